//! Upstream link abstraction and the worker task that owns it.
//!
//! The poller never touches the link. It pushes [`Job`]s into a bounded
//! queue; a single [`UpstreamWorker`] task drains the queue, performs the
//! I/O and reports every read outcome through a [`CompletionHandler`].

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tracing::{debug, info, warn};

use crate::config::{ConnectionConfig, ReadFunction, UpstreamConfig};
use crate::connection::ConnectionManager;
use crate::correlator::{AddressRange, CompletionHandler, Token, UpstreamError};

/// An established connection to the upstream device.
pub trait UpstreamLink: Send + 'static {
    /// Read `range` with the given function.
    fn read(
        &mut self,
        function: ReadFunction,
        range: AddressRange,
    ) -> impl Future<Output = Result<Vec<u16>, UpstreamError>> + Send;

    /// Write `values` starting at `address`.
    fn write(
        &mut self,
        address: u16,
        values: Vec<u16>,
    ) -> impl Future<Output = Result<(), UpstreamError>> + Send;
}

/// Factory for [`UpstreamLink`]s.
pub trait Connector: Send + Sync + 'static {
    type Link: UpstreamLink;

    fn connect(&self) -> impl Future<Output = Result<Self::Link, UpstreamError>> + Send;

    /// Human-readable target, used in logs.
    fn describe(&self) -> String;
}

fn map_modbus_error(err: tokio_modbus::Error) -> UpstreamError {
    match err {
        tokio_modbus::Error::Protocol(e) => UpstreamError::Protocol(e.to_string()),
        other => UpstreamError::Transport(other.to_string()),
    }
}

/// Connector for a real device over Modbus TCP or RTU.
#[derive(Debug, Clone)]
pub struct ModbusConnector {
    connection: ConnectionConfig,
    unit_id: u8,
}

impl ModbusConnector {
    pub fn new(upstream: &UpstreamConfig) -> Self {
        Self {
            connection: upstream.connection.clone(),
            unit_id: upstream.unit_id,
        }
    }
}

impl Connector for ModbusConnector {
    type Link = ModbusLink;

    async fn connect(&self) -> Result<ModbusLink, UpstreamError> {
        let slave = Slave(self.unit_id);

        let ctx = match &self.connection {
            ConnectionConfig::Tcp { host, port } => {
                let addr: SocketAddr = tokio::net::lookup_host((host.as_str(), *port))
                    .await
                    .map_err(|e| UpstreamError::Connection(format!("Cannot resolve {}: {}", host, e)))?
                    .next()
                    .ok_or_else(|| UpstreamError::Connection(format!("No address for {}", host)))?;

                tcp::connect_slave(addr, slave)
                    .await
                    .map_err(|e| UpstreamError::Connection(e.to_string()))?
            }
            ConnectionConfig::Rtu(serial) => {
                let stream = tokio_serial::SerialStream::open(&serial.builder()).map_err(|e| {
                    UpstreamError::Connection(format!("Serial open failed: {}", e))
                })?;
                rtu::attach_slave(stream, slave)
            }
        };

        Ok(ModbusLink { ctx })
    }

    fn describe(&self) -> String {
        format!("{} (unit {})", self.connection.describe(), self.unit_id)
    }
}

/// Live tokio-modbus client context.
#[derive(Debug)]
pub struct ModbusLink {
    ctx: Context,
}

impl UpstreamLink for ModbusLink {
    async fn read(
        &mut self,
        function: ReadFunction,
        range: AddressRange,
    ) -> Result<Vec<u16>, UpstreamError> {
        let result = match function {
            ReadFunction::Holding => {
                self.ctx
                    .read_holding_registers(range.start, range.count)
                    .await
            }
            ReadFunction::Input => self.ctx.read_input_registers(range.start, range.count).await,
        };

        result
            .map_err(map_modbus_error)?
            .map_err(UpstreamError::Exception)
    }

    async fn write(&mut self, address: u16, values: Vec<u16>) -> Result<(), UpstreamError> {
        let result = match values.as_slice() {
            [value] => self.ctx.write_single_register(address, *value).await,
            _ => self.ctx.write_multiple_registers(address, &values).await,
        };

        result
            .map_err(map_modbus_error)?
            .map_err(UpstreamError::Exception)
    }
}

/// Work item for the upstream worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    /// Make sure a link exists (subject to backoff).
    Connect,
    /// Read the registers of `range`; the outcome is reported for `token`.
    Read { token: Token, range: AddressRange },
    /// Mirror a downstream write to the device.
    Write { address: u16, values: Vec<u16> },
}

/// Task owning the single upstream connection.
pub struct UpstreamWorker<C: Connector> {
    manager: ConnectionManager<C>,
    jobs: mpsc::Receiver<Job>,
    handler: Arc<dyn CompletionHandler>,
    function: ReadFunction,
    request_timeout: Duration,
}

impl<C: Connector> UpstreamWorker<C> {
    pub fn new(
        manager: ConnectionManager<C>,
        jobs: mpsc::Receiver<Job>,
        handler: Arc<dyn CompletionHandler>,
        function: ReadFunction,
        request_timeout: Duration,
    ) -> Self {
        Self {
            manager,
            jobs,
            handler,
            function,
            request_timeout,
        }
    }

    /// Process jobs until every sender is dropped.
    pub async fn run(mut self) {
        info!(upstream = %self.manager.describe(), "Upstream worker started");

        while let Some(job) = self.jobs.recv().await {
            self.handle(job).await;
        }

        self.manager.reset();
        info!("Upstream worker stopped");
    }

    async fn handle(&mut self, job: Job) {
        match job {
            Job::Connect => {
                // Failures are logged and backed off by the manager.
                let _ = self.manager.ensure_connection().await;
            }
            Job::Read { token, range } => match self.read(range).await {
                Ok(registers) => self.handler.on_data(token, &registers),
                Err(e) => self.handler.on_error(token, &e),
            },
            Job::Write { address, values } => {
                let count = values.len();
                match self.write(address, values).await {
                    Ok(()) => debug!(address, count, "Mirrored write upstream"),
                    Err(e) => warn!(address, count, error = %e, "Upstream write failed"),
                }
            }
        }
    }

    async fn read(&mut self, range: AddressRange) -> Result<Vec<u16>, UpstreamError> {
        self.manager.ensure_connection().await?;
        let function = self.function;
        let timeout = self.request_timeout;

        let link = self.manager.link_mut().ok_or(UpstreamError::NotConnected)?;
        let result = tokio::time::timeout(timeout, link.read(function, range))
            .await
            .unwrap_or(Err(UpstreamError::Timeout));

        self.check(result)
    }

    async fn write(&mut self, address: u16, values: Vec<u16>) -> Result<(), UpstreamError> {
        self.manager.ensure_connection().await?;
        let timeout = self.request_timeout;

        let link = self.manager.link_mut().ok_or(UpstreamError::NotConnected)?;
        let result = tokio::time::timeout(timeout, link.write(address, values))
            .await
            .unwrap_or(Err(UpstreamError::Timeout));

        self.check(result)
    }

    /// Drop the link after errors that leave it in an unknown state.
    fn check<T>(&mut self, result: Result<T, UpstreamError>) -> Result<T, UpstreamError> {
        match &result {
            Err(e) if e.breaks_connection() => {
                warn!(error = %e, "Dropping upstream connection");
                self.manager.reset();
            }
            _ => {}
        }
        result
    }
}
