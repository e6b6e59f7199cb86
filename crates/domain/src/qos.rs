//! Quality-of-service levels, as defined by the wire protocol.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Delivery guarantee requested for a message.
///
/// Deserializes from either the variant name (`"AtLeastOnce"`) or the
/// numeric level (`1`).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(try_from = "QosRepr")]
pub enum QualityOfService {
    /// Fire and forget.
    #[default]
    AtMostOnce,
    /// Acknowledged delivery, duplicates possible.
    AtLeastOnce,
    /// Assured delivery.
    ExactlyOnce,
}

impl QualityOfService {
    /// Numeric protocol level.
    #[must_use]
    pub fn level(self) -> u8 {
        match self {
            Self::AtMostOnce => 0,
            Self::AtLeastOnce => 1,
            Self::ExactlyOnce => 2,
        }
    }

    /// Whether the receiver must acknowledge the publish.
    #[must_use]
    pub fn requires_ack(self) -> bool {
        self != Self::AtMostOnce
    }
}

impl TryFrom<u8> for QualityOfService {
    type Error = ValidationError;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactlyOnce),
            other => Err(ValidationError::InvalidQos(other)),
        }
    }
}

impl From<QualityOfService> for u8 {
    fn from(qos: QualityOfService) -> Self {
        qos.level()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum QosRepr {
    Level(u8),
    Name(String),
}

impl TryFrom<QosRepr> for QualityOfService {
    type Error = ValidationError;

    fn try_from(repr: QosRepr) -> Result<Self, Self::Error> {
        match repr {
            QosRepr::Level(level) => Self::try_from(level),
            QosRepr::Name(name) => match name.as_str() {
                "AtMostOnce" => Ok(Self::AtMostOnce),
                "AtLeastOnce" => Ok(Self::AtLeastOnce),
                "ExactlyOnce" => Ok(Self::ExactlyOnce),
                _ => Err(ValidationError::InvalidQos(u8::MAX)),
            },
        }
    }
}
