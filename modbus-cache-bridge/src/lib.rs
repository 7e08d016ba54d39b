//! Caching bridge for Modbus register data.
//!
//! One upstream device (Modbus TCP or RTU) is polled in the background and
//! its registers are kept in a [`RegisterCache`]. Downstream clients, over
//! Modbus TCP or a Modbus RTU serial line, are answered from that cache
//! only, so their latency never depends on the upstream link.
//!
//! # Data flow
//!
//! ```text
//! UpstreamPoller --Job--> UpstreamWorker --on_data/on_error--> RequestCorrelator --> RegisterCache
//!                                                                                       ^
//! downstream client --> CacheService --> respond() -------------------------------------+
//! ```
//!
//! [`ModbusCache`] wires the pieces together and exposes the host lifecycle
//! (`begin`, `update`) and the register accessors.

pub mod bridge;
pub mod cache;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod poller;
pub mod responder;
pub mod server;
pub mod stats;
pub mod transport;

pub use bridge::{BridgeSnapshot, ModbusCache, SetupError};
pub use cache::{CacheError, RegisterCache, RegisterEntry};
pub use config::{ModbusCacheConfig, WritePolicy};
pub use connection::ConnectionState;
pub use correlator::{AddressRange, CompletionHandler, Token, UpstreamError};
pub use poller::TickOutcome;
pub use transport::{Connector, ModbusConnector, UpstreamLink};
