//! Downstream Modbus server roles.
//!
//! Both the TCP server and the RTU (serial) server wrap the same
//! [`CacheService`]. Framing and CRC handling belong to tokio-modbus.

use std::future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_modbus::prelude::*;
use tokio_modbus::server::tcp::{Server as TcpServer, accept_tcp_connection};
use tokio_modbus::server::rtu::Server as RtuServer;
use tracing::{debug, error, info, warn};

use crate::cache::RegisterCache;
use crate::config::{SerialConfig, WritePolicy};
use crate::responder::{respond, written_registers};
use crate::transport::Job;

/// Hands accepted downstream writes to the upstream worker without waiting.
#[derive(Debug, Clone)]
pub struct UpstreamWriter {
    jobs: mpsc::Sender<Job>,
}

impl UpstreamWriter {
    pub fn new(jobs: mpsc::Sender<Job>) -> Self {
        Self { jobs }
    }

    /// Queue a write. Returns false when it had to be dropped.
    pub fn forward(&self, address: u16, values: Vec<u16>) -> bool {
        match self.jobs.try_send(Job::Write { address, values }) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(address, "Upstream queue full, write not mirrored");
                false
            }
            Err(TrySendError::Closed(_)) => {
                error!(address, "Upstream worker is gone, write not mirrored");
                false
            }
        }
    }
}

/// tokio-modbus service answering from the register cache.
#[derive(Debug, Clone)]
pub struct CacheService {
    cache: Arc<RegisterCache>,
    mirror: Option<UpstreamWriter>,
}

impl CacheService {
    /// Service for the given write policy. `writer` is only used with
    /// [`WritePolicy::MirrorUpstream`].
    pub fn new(cache: Arc<RegisterCache>, policy: WritePolicy, writer: UpstreamWriter) -> Self {
        let mirror = match policy {
            WritePolicy::CacheOnly => None,
            WritePolicy::MirrorUpstream => Some(writer),
        };
        Self { cache, mirror }
    }

    /// Answer one request.
    pub fn handle(&self, request: &Request<'_>) -> Result<Response, ExceptionCode> {
        let result = respond(request, &self.cache);

        match &result {
            Ok(_) => {
                if let (Some(mirror), Some((address, values))) =
                    (&self.mirror, written_registers(request))
                {
                    mirror.forward(address, values);
                }
            }
            // Client errors, not faults.
            Err(code) => debug!(?request, ?code, "Rejected downstream request"),
        }
        result
    }
}

impl tokio_modbus::server::Service for CacheService {
    type Request = SlaveRequest<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        future::ready(self.handle(&req.request))
    }
}

/// Serve Modbus TCP clients on `bind` until the listener fails.
pub async fn serve_tcp(bind: SocketAddr, service: CacheService) -> io::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!(%bind, "Modbus TCP server listening");
    run_tcp(listener, service).await
}

/// Serve Modbus TCP clients on an already bound listener.
pub async fn run_tcp(listener: TcpListener, service: CacheService) -> io::Result<()> {
    let server = TcpServer::new(listener);

    let new_service = move |_socket_addr: SocketAddr| Ok::<_, io::Error>(Some(service.clone()));
    let new_service = Arc::new(new_service);

    let on_connected = move |stream, socket_addr: SocketAddr| {
        let new_service = Arc::clone(&new_service);
        async move {
            debug!(%socket_addr, "Downstream TCP client connected");
            accept_tcp_connection(stream, socket_addr, move |addr| (*new_service)(addr))
        }
    };
    let on_process_error = |err| {
        warn!(error = %err, "Downstream TCP connection error");
    };

    server.serve(&on_connected, on_process_error).await
}

/// Serve one Modbus RTU serial line.
pub async fn serve_rtu(serial: &SerialConfig, service: CacheService) -> io::Result<()> {
    let stream = tokio_serial::SerialStream::open(&serial.builder()).map_err(io::Error::from)?;
    info!(port = %serial.port, baud_rate = serial.baud_rate, "Modbus RTU server listening");

    RtuServer::new(stream).serve_forever(service).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn cache() -> Arc<RegisterCache> {
        let cache = Arc::new(RegisterCache::new(&[0, 1, 2]).unwrap());
        cache.write_run(0, &[230, 10, 2400], Instant::now());
        cache
    }

    #[test]
    fn test_cache_only_never_queues_upstream_writes() {
        let (tx, mut rx) = mpsc::channel(4);
        let service = CacheService::new(cache(), WritePolicy::CacheOnly, UpstreamWriter::new(tx));

        assert_eq!(
            service.handle(&Request::WriteSingleRegister(1, 99)),
            Ok(Response::WriteSingleRegister(1, 99))
        );
        assert_eq!(service.cache.get_register_value(1), Ok(99));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_mirror_queues_accepted_writes_only() {
        let (tx, mut rx) = mpsc::channel(4);
        let service =
            CacheService::new(cache(), WritePolicy::MirrorUpstream, UpstreamWriter::new(tx));

        service.handle(&Request::WriteSingleRegister(2, 7)).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            Job::Write {
                address: 2,
                values: vec![7]
            }
        );

        // Rejected writes and reads are never mirrored.
        assert!(service.handle(&Request::WriteSingleRegister(9, 7)).is_err());
        service.handle(&Request::ReadHoldingRegisters(0, 3)).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_full_queue_does_not_block_the_reply() {
        let (tx, _rx) = mpsc::channel(1);
        let service =
            CacheService::new(cache(), WritePolicy::MirrorUpstream, UpstreamWriter::new(tx));

        assert!(service.handle(&Request::WriteSingleRegister(0, 1)).is_ok());
        assert!(service.handle(&Request::WriteSingleRegister(0, 2)).is_ok());
        assert_eq!(service.cache.get_register_value(0), Ok(2));
    }
}
