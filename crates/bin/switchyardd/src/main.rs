//! # switchyardd — switchyard daemon
//!
//! Composition root that wires the messaging core to the brokers.
//!
//! ## Responsibilities
//! - Load configuration (`switchyard.toml` plus environment overrides)
//! - Initialise `tracing` with the configured filter
//! - Construct the event aggregator with the default behavior chain
//! - Start the embedded broker and the device message broker bridge
//! - Register script proxies
//! - Optionally start the MQTT uplink
//! - Handle graceful shutdown (SIGTERM/SIGINT)
//!
//! ## Dependency rule
//! This is the **only** crate that depends on all other crates.
//! It is the wiring layer; no domain logic belongs here.

mod config;

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use switchyard_adapter_broker_memory::{LoopbackClientFactory, MemoryBroker};
use switchyard_adapter_mqtt::MqttUplink;
use switchyard_app::behavior::LoggingBehavior;
use switchyard_app::ports::{EmbeddedBroker, WireClientFactory};
use switchyard_app::services::{DeviceMessageBroker, ScriptRegistry};
use switchyard_app::{BehaviorChain, EventAggregator};

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("failed to load configuration")?;

    let filter = EnvFilter::try_new(&config.logging.filter)
        .with_context(|| format!("invalid log filter {:?}", config.logging.filter))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Bus
    let bus = EventAggregator::new(config.bus.clone());
    bus.set_default_behavior(BehaviorChain::new().with(LoggingBehavior));

    // Embedded broker and bridge
    let broker = Arc::new(MemoryBroker::new(config.broker.clone()));
    let clients =
        LoopbackClientFactory::new(&config.broker).with_keep_alive(config.bridge.keep_alive());
    let bridge = DeviceMessageBroker::new(
        Arc::clone(&broker),
        clients.clone(),
        bus.clone(),
        config.bridge.clone(),
    );
    bridge
        .initialize()
        .await
        .context("failed to start the device message broker")?;

    // Scripting
    let scripts = ScriptRegistry::default();
    bridge.register_script_proxy(&scripts);

    // Uplink
    let uplink = if config.integrations.mqtt_enabled {
        let uplink = MqttUplink::start(&config.mqtt, &broker, &clients)
            .await
            .context("failed to start the MQTT uplink")?;
        Some(uplink)
    } else {
        None
    };

    tracing::info!(
        proxies = ?scripts.names(),
        mqtt = config.integrations.mqtt_enabled,
        "switchyardd running"
    );
    shutdown_signal().await;

    shut_down(uplink, &bridge, &bus).await?;
    tracing::info!("switchyardd stopped");
    Ok(())
}

/// Tear down in reverse start order. The bus is shut down even when the
/// bridge fails to close.
async fn shut_down<B, F>(
    uplink: Option<MqttUplink<F::Client>>,
    bridge: &DeviceMessageBroker<B, F>,
    bus: &EventAggregator,
) -> anyhow::Result<()>
where
    B: EmbeddedBroker,
    F: WireClientFactory,
{
    if let Some(uplink) = uplink {
        uplink.teardown().await;
    }
    let closed = bridge.close().await;
    if let Err(err) = &closed {
        tracing::error!(%err, "failed to close the device message broker");
    }
    bus.shutdown();
    closed.context("failed to close the device message broker")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(%err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(%err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use switchyard_app::config::BridgeConfig;
    use switchyard_app::services::BridgeState;

    use super::*;

    #[tokio::test]
    async fn should_shut_bus_down_even_when_bridge_close_fails() {
        let bus = EventAggregator::default();
        let bridge = DeviceMessageBroker::new(
            Arc::new(MemoryBroker::default()),
            LoopbackClientFactory::default(),
            bus.clone(),
            BridgeConfig::default(),
        );

        let result = shut_down(None, &bridge, &bus).await;

        assert!(result.is_err());
        assert_eq!(bridge.state(), BridgeState::Created);
        assert!(bus.is_shut_down());
    }

    #[tokio::test]
    async fn should_close_running_bridge_then_bus() {
        let bus = EventAggregator::default();
        let broker = Arc::new(MemoryBroker::default());
        let bridge = DeviceMessageBroker::new(
            Arc::clone(&broker),
            LoopbackClientFactory::default(),
            bus.clone(),
            BridgeConfig::default(),
        );
        bridge.initialize().await.unwrap();

        shut_down(None, &bridge, &bus).await.unwrap();

        assert_eq!(bridge.state(), BridgeState::Closed);
        assert!(!broker.is_running());
        assert!(bus.is_shut_down());
    }
}
