//! End-to-end tests for the full switchyard stack.
//!
//! Each test wires the real event aggregator, the embedded broker, loopback
//! clients and the device message broker bridge. No network socket is
//! opened.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use serde_json::json;
use switchyard_adapter_broker_memory::{LoopbackClient, LoopbackClientFactory, MemoryBroker};
use switchyard_app::config::{BridgeConfig, BusConfig};
use switchyard_app::ports::{EmbeddedBroker, LoopbackChannel, WireClient, WireClientFactory};
use switchyard_app::services::{ApiCall, DeviceMessageBroker};
use switchyard_app::{CallOptions, EventAggregator};
use switchyard_domain::device_message::{DeviceMessage, OutboundDeviceMessage};
use switchyard_domain::error::HandlerError;
use switchyard_domain::filter::MessageFilter;
use switchyard_domain::id::CorrelationId;
use switchyard_domain::message::Message;
use switchyard_domain::packet::SubscriptionRequest;
use switchyard_domain::qos::QualityOfService;
use tokio::sync::mpsc;

type Bridge = DeviceMessageBroker<Arc<MemoryBroker>, LoopbackClientFactory>;

#[derive(Debug, Clone, PartialEq)]
struct Ping {
    id: u32,
}
switchyard_domain::bus_message!(Ping, "test.ping");

#[derive(Debug, Clone)]
struct GetLampState;
switchyard_domain::bus_message!(GetLampState, "lamp.get_state");

#[derive(Debug, Clone, PartialEq)]
struct LampState(String);
switchyard_domain::bus_message!(LampState, "lamp.state");

/// Build a running bridge over a fresh embedded broker.
async fn stack() -> (EventAggregator, Bridge, Arc<MemoryBroker>) {
    let bus = EventAggregator::new(BusConfig {
        query_timeout_ms: 2_000,
        ..BusConfig::default()
    });
    let broker = Arc::new(MemoryBroker::default());
    let bridge = DeviceMessageBroker::new(
        Arc::clone(&broker),
        LoopbackClientFactory::default(),
        bus.clone(),
        BridgeConfig::default(),
    );
    bridge
        .initialize()
        .await
        .expect("bridge should initialise");
    (bus, bridge, broker)
}

/// A second session on the embedded broker, standing in for a device.
async fn device(
    broker: &MemoryBroker,
    client_id: &str,
    filter: &str,
) -> (LoopbackClient, mpsc::UnboundedReceiver<DeviceMessage>) {
    let (broker_end, client_end) = LoopbackChannel::pair();
    broker.inject_client(client_id, broker_end).unwrap();
    let client = LoopbackClientFactory::default().create(client_id, client_end);
    client.connect().await.unwrap();
    client
        .subscribe(SubscriptionRequest::new(filter, QualityOfService::AtLeastOnce))
        .await
        .unwrap();
    let incoming = client.take_incoming().unwrap();
    (client, incoming)
}

async fn within_a_second<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(1), future)
        .await
        .expect("timed out")
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

#[tokio::test]
async fn should_deliver_published_message_to_subscriber() {
    let bus = EventAggregator::default();
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    bus.subscribe::<Ping, _>(
        move |envelope| {
            sink.lock().unwrap().push(envelope.payload().id);
            Ok(())
        },
        None,
    );

    let report = bus
        .publish(Message::from(Ping { id: 1 }), CallOptions::default())
        .await
        .unwrap();

    assert_eq!(report.delivered, 1);
    assert_eq!(*received.lock().unwrap(), vec![1]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn should_count_every_delivery_under_concurrent_publishers() {
    let bus = EventAggregator::default();
    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..4 {
        let counter = Arc::clone(&counter);
        bus.subscribe::<Ping, _>(
            move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(())
            },
            None,
        );
    }

    let publishers: Vec<_> = (0..8)
        .map(|publisher| {
            let bus = bus.clone();
            tokio::spawn(async move {
                for id in 0..50 {
                    let ping = Message::from(Ping {
                        id: publisher * 100 + id,
                    });
                    bus.publish(ping, CallOptions::default()).await.unwrap();
                }
            })
        })
        .collect();
    for publisher in publishers {
        publisher.await.unwrap();
    }

    assert_eq!(counter.load(Ordering::Relaxed), 8 * 50 * 4);
}

// ---------------------------------------------------------------------------
// Bridge over the embedded broker
// ---------------------------------------------------------------------------

#[tokio::test]
async fn should_loop_published_bytes_back_to_universal_pattern() {
    let (_bus, bridge, _broker) = stack().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    bridge
        .subscribe("#", move |message| {
            tx.send(message.clone()).map_err(|_| HandlerError::from("receiver gone"))
        })
        .unwrap();

    bridge
        .publish("x/y", vec![1, 2, 3], QualityOfService::AtMostOnce)
        .unwrap();

    let message = within_a_second(rx.recv()).await.unwrap();
    assert_eq!(message.topic, "x/y");
    assert_eq!(message.payload, vec![1, 2, 3]);
}

#[tokio::test]
async fn should_relay_device_publishes_onto_the_bus() {
    let (bus, _bridge, broker) = stack().await;
    let mut relayed = bus.observe::<DeviceMessage>();
    let (sensor, _) = device(&broker, "sensor", "unused/#").await;

    sensor
        .publish(DeviceMessage::new(
            "sensors/hall/temp",
            b"21.5".to_vec(),
            QualityOfService::AtLeastOnce,
        ))
        .await
        .unwrap();

    let envelope = within_a_second(relayed.next()).await.unwrap();
    assert_eq!(envelope.topic(), "sensors/hall/temp");
    assert_eq!(envelope.payload().payload_text(), "21.5");
}

#[tokio::test]
async fn should_forward_outbound_bus_messages_to_devices() {
    let (bus, _bridge, broker) = stack().await;
    let (_lamp, mut commands) = device(&broker, "lamp", "lamps/+/set").await;

    let command = DeviceMessage::new(
        "lamps/desk/set",
        b"on".to_vec(),
        QualityOfService::AtLeastOnce,
    );
    bus.publish(Message::from(OutboundDeviceMessage(command)), CallOptions::default())
        .await
        .unwrap();

    let received = within_a_second(commands.recv()).await.unwrap();
    assert_eq!(received.topic, "lamps/desk/set");
    assert_eq!(received.payload_text(), "on");
}

#[tokio::test]
async fn should_answer_query_with_device_reply() {
    let (bus, bridge, broker) = stack().await;
    let (lamp, mut requests) = device(&broker, "lamp", "devices/lamp/get").await;
    tokio::spawn(async move {
        while let Some(_request) = requests.recv().await {
            let reply = DeviceMessage::new(
                "devices/lamp/state",
                b"on".to_vec(),
                QualityOfService::AtMostOnce,
            );
            if lamp.publish(reply).await.is_err() {
                break;
            }
        }
    });

    let waiting: Arc<Mutex<Option<CorrelationId>>> = Arc::default();
    let pending = Arc::clone(&waiting);
    let requester = bridge.clone();
    bus.subscribe::<GetLampState, _>(
        move |envelope| {
            *pending.lock().unwrap() = Some(envelope.correlation_id());
            requester
                .publish("devices/lamp/get", Vec::new(), QualityOfService::AtMostOnce)
                .map_err(|err| Box::new(err) as HandlerError)
        },
        None,
    );
    let responder = bus.clone();
    bus.subscribe::<DeviceMessage, _>(
        move |envelope| {
            if let Some(correlation_id) = *waiting.lock().unwrap() {
                let state = LampState(envelope.payload().payload_text().into_owned());
                responder.respond(correlation_id, state);
            }
            Ok(())
        },
        Some(MessageFilter::topic("devices/lamp/state").unwrap()),
    );

    let state: LampState = bus
        .query(Message::from(GetLampState), CallOptions::default())
        .await
        .unwrap();

    assert_eq!(state, LampState("on".to_string()));
    assert_eq!(bus.pending_queries(), 0);
}

#[tokio::test]
async fn should_list_sessions_through_api_call() {
    let (_bus, bridge, broker) = stack().await;
    let (_lamp, _) = device(&broker, "lamp", "lamps/#").await;
    let mut call = ApiCall::default();

    bridge.get_connected_clients(&mut call).unwrap();

    let ids: Vec<&str> = call.result["ConnectedClients"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|client| client["client_id"].as_str())
        .collect();
    assert_eq!(ids, vec!["lamp", "switchyard.loopback"]);
}

#[tokio::test]
async fn should_publish_through_api_call() {
    let (_bus, bridge, broker) = stack().await;
    let (_lamp, mut commands) = device(&broker, "lamp", "lamps/#").await;

    bridge
        .publish_call(&ApiCall::new(json!({
            "topic": "lamps/desk/set",
            "payload": [111, 102, 102],
            "qos": 1,
        })))
        .unwrap();

    let received = within_a_second(commands.recv()).await.unwrap();
    assert_eq!(received.payload_text(), "off");
}

#[tokio::test]
async fn should_release_broker_sessions_on_close() {
    let (bus, bridge, broker) = stack().await;
    assert_eq!(broker.connected_clients().len(), 1);

    bridge.close().await.unwrap();

    assert!(!broker.is_running());
    assert!(broker.connected_clients().is_empty());
    assert_eq!(bus.subscription_count(), 0);
}
