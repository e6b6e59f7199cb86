//! Control packets exchanged between a broker and its clients over a
//! loopback channel.
//!
//! The set mirrors the MQTT 3.1.1 control packets the hub needs. Packets are
//! plain values; no byte encoding happens in-process.

use std::time::Duration;

use crate::device_message::DeviceMessage;
use crate::qos::QualityOfService;

/// Identifier pairing a request packet with its acknowledgement.
pub type PacketId = u16;

/// One entry of a `Subscribe` packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRequest {
    /// Topic filter (may contain `+` / `#`).
    pub filter: String,
    /// Maximum QoS the subscriber accepts.
    pub qos: QualityOfService,
    /// Do not deliver messages published by the same client.
    pub no_local: bool,
}

impl SubscriptionRequest {
    /// Request `filter` at `qos`, receiving own publishes.
    pub fn new(filter: impl Into<String>, qos: QualityOfService) -> Self {
        Self {
            filter: filter.into(),
            qos,
            no_local: false,
        }
    }

    /// Suppress delivery of the subscriber's own publishes.
    #[must_use]
    pub fn no_local(mut self) -> Self {
        self.no_local = true;
        self
    }
}

/// A control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Client → broker: open a session.
    Connect {
        /// Client identifier.
        client_id: String,
        /// Keep-alive period announced by the client.
        keep_alive: Duration,
    },
    /// Broker → client: session accepted.
    ConnAck {
        /// Whether an existing session was resumed.
        session_present: bool,
    },
    /// Client → broker: add subscriptions.
    Subscribe {
        /// Request id.
        packet_id: PacketId,
        /// Requested filters.
        requests: Vec<SubscriptionRequest>,
    },
    /// Broker → client: per-filter outcome, `None` when refused.
    SubAck {
        /// Request id.
        packet_id: PacketId,
        /// Granted QoS per request, in request order.
        granted: Vec<Option<QualityOfService>>,
    },
    /// Client → broker: remove subscriptions.
    Unsubscribe {
        /// Request id.
        packet_id: PacketId,
        /// Filters to remove.
        filters: Vec<String>,
    },
    /// Broker → client: unsubscribe done.
    UnsubAck {
        /// Request id.
        packet_id: PacketId,
    },
    /// Either direction: application message.
    Publish {
        /// Present for QoS ≥ 1.
        packet_id: Option<PacketId>,
        /// The message.
        message: DeviceMessage,
    },
    /// Acknowledges a QoS ≥ 1 publish.
    PubAck {
        /// Id of the acknowledged publish.
        packet_id: PacketId,
    },
    /// Client → broker: keep-alive probe.
    PingReq,
    /// Broker → client: keep-alive answer.
    PingResp,
    /// Client → broker: close the session.
    Disconnect,
}

impl Packet {
    /// Short name used in logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "CONNECT",
            Self::ConnAck { .. } => "CONNACK",
            Self::Subscribe { .. } => "SUBSCRIBE",
            Self::SubAck { .. } => "SUBACK",
            Self::Unsubscribe { .. } => "UNSUBSCRIBE",
            Self::UnsubAck { .. } => "UNSUBACK",
            Self::Publish { .. } => "PUBLISH",
            Self::PubAck { .. } => "PUBACK",
            Self::PingReq => "PINGREQ",
            Self::PingResp => "PINGRESP",
            Self::Disconnect => "DISCONNECT",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_default_subscription_request_to_receive_own_publishes() {
        let request = SubscriptionRequest::new("#", QualityOfService::AtMostOnce);
        assert!(!request.no_local);
        assert!(request.no_local().no_local);
    }

    #[test]
    fn should_name_packets_for_logs() {
        assert_eq!(Packet::PingReq.name(), "PINGREQ");
        assert_eq!(Packet::UnsubAck { packet_id: 4 }.name(), "UNSUBACK");
    }
}
