//! Downstream server roles exercised over the wire.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout};
use tokio_modbus::prelude::*;

use modbus_cache_bridge::RegisterCache;
use modbus_cache_bridge::WritePolicy;
use modbus_cache_bridge::config::SerialConfig;
use modbus_cache_bridge::server::{self, CacheService, UpstreamWriter};

const DEADLINE: Duration = Duration::from_secs(5);

/// Cache with 0..=2 fetched and 72 configured but never fetched.
fn service(policy: WritePolicy) -> (CacheService, Arc<RegisterCache>) {
    let cache = Arc::new(RegisterCache::new(&[0, 1, 2, 72]).unwrap());
    cache.write_run(0, &[230, 10, 2400], Instant::now());
    let (tx, _rx) = mpsc::channel(4);
    let service = CacheService::new(Arc::clone(&cache), policy, UpstreamWriter::new(tx));
    (service, cache)
}

async fn tcp_client(service: CacheService) -> client::Context {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server::run_tcp(listener, service));

    timeout(DEADLINE, tcp::connect(addr))
        .await
        .expect("connect timed out")
        .unwrap()
}

#[tokio::test]
async fn tcp_role_answers_from_cache() {
    let (service, _cache) = service(WritePolicy::CacheOnly);
    let mut ctx = tcp_client(service).await;

    let values = timeout(DEADLINE, ctx.read_holding_registers(0, 3))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(values, Ok(vec![230, 10, 2400]));

    let values = timeout(DEADLINE, ctx.read_input_registers(1, 2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(values, Ok(vec![10, 2400]));
}

#[tokio::test]
async fn tcp_role_reports_exceptions() {
    let (service, _cache) = service(WritePolicy::CacheOnly);
    let mut ctx = tcp_client(service).await;

    let unknown = timeout(DEADLINE, ctx.read_holding_registers(2, 2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(unknown, Err(ExceptionCode::IllegalDataAddress));

    let not_fetched = timeout(DEADLINE, ctx.read_holding_registers(72, 1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(not_fetched, Err(ExceptionCode::GatewayTargetDevice));

    let coils = timeout(DEADLINE, ctx.read_coils(0, 1)).await.unwrap().unwrap();
    assert_eq!(coils, Err(ExceptionCode::IllegalFunction));

    // The connection survives exceptions.
    let values = timeout(DEADLINE, ctx.read_holding_registers(0, 1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(values, Ok(vec![230]));
}

#[tokio::test]
async fn tcp_role_writes_land_in_cache() {
    let (service, cache) = service(WritePolicy::CacheOnly);
    let mut ctx = tcp_client(service).await;

    let written = timeout(DEADLINE, ctx.write_multiple_registers(0, &[1, 2]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(written, Ok(()));
    assert_eq!(cache.get_register_value(1), Ok(2));

    let values = timeout(DEADLINE, ctx.read_holding_registers(0, 3))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(values, Ok(vec![1, 2, 2400]));
}

#[tokio::test]
async fn rtu_role_fails_on_missing_port() {
    let (service, _cache) = service(WritePolicy::CacheOnly);
    let serial: SerialConfig =
        json5::from_str(r#"{ port: "/dev/modbus-cache-no-such-port" }"#).unwrap();

    let result = timeout(DEADLINE, server::serve_rtu(&serial, service))
        .await
        .unwrap();
    assert!(result.is_err());
}
