//! Bidirectional relay between an external MQTT broker and the embedded one.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use switchyard_app::ports::{
    BrokerError, EmbeddedBroker, LoopbackChannel, WireClient, WireClientFactory,
};
use switchyard_domain::device_message::DeviceMessage;
use switchyard_domain::packet::SubscriptionRequest;
use switchyard_domain::qos::QualityOfService;

use crate::config::MqttConfig;
use crate::error::MqttError;
use crate::qos::{from_mqtt, to_mqtt};

/// A running uplink. Stop it with [`teardown`](Self::teardown).
pub struct MqttUplink<C> {
    mqtt: AsyncClient,
    loopback: Arc<C>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl<C: WireClient> MqttUplink<C> {
    /// Connect the embedded broker to the external broker described by `config`.
    ///
    /// The external connection is established lazily by the event loop;
    /// connection errors are logged and retried.
    ///
    /// # Errors
    ///
    /// Returns [`MqttError::InvalidConfig`] / [`MqttError::Validation`] for a
    /// bad configuration and [`MqttError::Broker`] when the embedded broker
    /// refuses the loopback session or its subscriptions.
    #[tracing::instrument(skip_all, fields(host = %config.broker_host, port = config.broker_port))]
    pub async fn start<B, F>(
        config: &MqttConfig,
        broker: &B,
        clients: &F,
    ) -> Result<Self, MqttError>
    where
        B: EmbeddedBroker,
        F: WireClientFactory<Client = C>,
    {
        config.validate()?;
        let qos = config.quality_of_service()?;

        let loopback_id = format!("{}.uplink", config.client_id);
        let (broker_end, client_end) = LoopbackChannel::pair();
        broker.inject_client(&loopback_id, broker_end)?;
        let loopback = Arc::new(clients.create(&loopback_id, client_end));
        loopback.connect().await?;
        for filter in &config.export_topics {
            loopback
                .subscribe(SubscriptionRequest::new(filter.as_str(), qos).no_local())
                .await?;
        }
        let outbound = loopback
            .take_incoming()
            .ok_or(BrokerError::Protocol("incoming messages already taken"))?;

        let mut options =
            MqttOptions::new(&config.client_id, &config.broker_host, config.broker_port);
        options.set_keep_alive(config.keep_alive());
        let (mqtt, eventloop) = AsyncClient::new(options, config.channel_capacity);

        let cancel = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(import_loop(
                eventloop,
                mqtt.clone(),
                Arc::clone(&loopback),
                ImportSettings {
                    topics: config.import_topics.clone(),
                    qos,
                    reconnect_delay: config.reconnect_delay(),
                },
                cancel.clone(),
            )),
            tokio::spawn(export_loop(outbound, mqtt.clone(), cancel.clone())),
        ];

        tracing::info!(
            imports = config.import_topics.len(),
            exports = config.export_topics.len(),
            "MQTT uplink started"
        );
        Ok(Self {
            mqtt,
            loopback,
            cancel,
            tasks,
        })
    }

    /// Stop both relays, disconnect from the external broker and leave the
    /// embedded broker.
    pub async fn teardown(self) {
        if let Err(err) = self.mqtt.try_disconnect() {
            tracing::debug!(%err, "MQTT disconnect request not queued");
        }
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(err) = task.await {
                tracing::warn!(%err, "uplink task ended abnormally");
            }
        }
        if let Err(err) = self.loopback.disconnect().await {
            tracing::warn!(%err, "failed to leave embedded broker");
        }
        tracing::info!("MQTT uplink stopped");
    }
}

struct ImportSettings {
    topics: Vec<String>,
    qos: QualityOfService,
    reconnect_delay: Duration,
}

async fn import_loop<C: WireClient>(
    mut eventloop: EventLoop,
    mqtt: AsyncClient,
    loopback: Arc<C>,
    settings: ImportSettings,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };
        match event {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = DeviceMessage::new(
                    publish.topic,
                    publish.payload.to_vec(),
                    from_mqtt(publish.qos),
                );
                tracing::trace!(topic = %message.topic, "importing MQTT message");
                if let Err(err) = loopback.publish(message).await {
                    tracing::warn!(%err, "failed to import MQTT message");
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                tracing::info!("connected to MQTT broker");
                // Subscriptions do not survive a clean-session reconnect.
                for topic in &settings.topics {
                    if let Err(err) = mqtt.try_subscribe(topic.as_str(), to_mqtt(settings.qos)) {
                        tracing::warn!(%err, %topic, "failed to subscribe on MQTT broker");
                    }
                }
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(%err, "MQTT connection error");
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(settings.reconnect_delay) => {}
                }
            }
        }
    }
}

async fn export_loop(
    mut outbound: mpsc::UnboundedReceiver<DeviceMessage>,
    mqtt: AsyncClient,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => break,
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        tracing::trace!(topic = %message.topic, "exporting message to MQTT");
        let result = tokio::select! {
            () = cancel.cancelled() => break,
            result = mqtt.publish(
                message.topic.as_str(),
                to_mqtt(message.qos),
                false,
                message.payload,
            ) => result,
        };
        if let Err(err) = result {
            tracing::warn!(%err, "failed to export message");
        }
    }
}
