//! MQTT adapter error types.

use switchyard_app::ports::BrokerError;
use switchyard_domain::error::{BusError, ValidationError};

/// Errors specific to the MQTT adapter.
#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    /// A configuration value is out of range.
    #[error("invalid MQTT configuration: {0}")]
    InvalidConfig(&'static str),

    /// The embedded broker refused the uplink session.
    #[error("embedded broker error")]
    Broker(#[from] BrokerError),

    /// A QoS level or topic filter is malformed.
    #[error("validation error")]
    Validation(#[from] ValidationError),
}

impl MqttError {
    /// Convert into a [`BusError`] for propagation across port boundaries.
    #[must_use]
    pub fn into_domain(self) -> BusError {
        match self {
            Self::Validation(err) => BusError::Validation(err),
            Self::Broker(err) => err.into_domain(),
            other => BusError::Transport(Box::new(other)),
        }
    }
}

impl From<MqttError> for BusError {
    fn from(err: MqttError) -> Self {
        err.into_domain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_display_invalid_config_error() {
        let err = MqttError::InvalidConfig("client_id must not be empty");
        assert_eq!(err.to_string(), "invalid MQTT configuration: client_id must not be empty");
    }

    #[test]
    fn should_convert_invalid_config_to_transport_error() {
        let err: BusError = MqttError::InvalidConfig("x").into();
        assert!(matches!(err, BusError::Transport(_)));
    }

    #[test]
    fn should_convert_validation_error_back_to_validation() {
        let err: BusError = MqttError::Validation(ValidationError::InvalidQos(7)).into();
        assert!(matches!(err, BusError::Validation(ValidationError::InvalidQos(7))));
    }

    #[test]
    fn should_convert_broker_error_through_broker_mapping() {
        let err: BusError = MqttError::Broker(BrokerError::NotRunning).into();
        assert!(matches!(err, BusError::Transport(_)));
    }
}
