//! Caching Modbus bridge.
//!
//! Polls one upstream Modbus device and answers downstream Modbus TCP and
//! RTU clients from the register cache.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use modbus_cache_framework::{BridgeArgs, BridgeConfig, BridgeRunner, BridgeStatus};

use modbus_cache_bridge::config::ModbusCacheConfig;
use modbus_cache_bridge::server;
use modbus_cache_bridge::{ModbusCache, ModbusConnector};

/// How often the host loop calls `update()`. The poller enforces the
/// configured interval on its own.
const SCHEDULER_PERIOD: Duration = Duration::from_millis(50);

/// How often the bridge snapshot is logged.
const STATUS_PERIOD: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    let args = BridgeArgs::parse_with_default("modbus-cache.json5");

    let config = ModbusCacheConfig::load(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    let mut runner = BridgeRunner::new_with_args("modbus-cache", config, Some(&args))
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    let config = runner.config().clone();

    let connector = ModbusConnector::new(&config.upstream);
    let mut bridge =
        ModbusCache::begin(&config, connector).context("Failed to initialize the cache")?;

    if let Some(tcp) = &config.servers.tcp {
        let bind: SocketAddr = tcp
            .bind
            .parse()
            .with_context(|| format!("Invalid bind address '{}'", tcp.bind))?;
        runner.spawn_with_error("tcp-server", server::serve_tcp(bind, bridge.service()));
    }

    if let Some(serial) = config.servers.rtu.clone() {
        let service = bridge.service();
        runner.spawn_with_error("rtu-server", async move {
            server::serve_rtu(&serial, service).await
        });
    }

    let name = runner.name().to_string();
    let version = runner.version().to_string();
    runner.spawn(async move {
        let mut scheduler = tokio::time::interval(SCHEDULER_PERIOD);
        scheduler.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut status = tokio::time::interval(STATUS_PERIOD);
        status.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = scheduler.tick() => {
                    bridge.update();
                }
                _ = status.tick() => {
                    match serde_json::to_value(bridge.snapshot()) {
                        Ok(snapshot) => BridgeStatus::running(&name, &version)
                            .with_metadata(snapshot)
                            .emit(),
                        Err(e) => tracing::warn!(error = %e, "Failed to serialize bridge snapshot"),
                    }
                }
            }
        }
    });

    let metadata = serde_json::json!({
        "upstream": config.upstream.connection.describe(),
        "unit_id": config.upstream.unit_id,
        "registers": config.address_list().len(),
        "poll_interval_ms": config.polling.interval_ms,
        "tcp_server": config.servers.tcp.as_ref().map(|t| t.bind.clone()),
        "rtu_server": config.servers.rtu.as_ref().map(|s| s.port.clone()),
        "writes": config.writes,
    });

    runner.run_with_metadata(Some(metadata)).await
}
