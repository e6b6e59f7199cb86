//! QoS conversion between the domain and rumqttc.

use rumqttc::QoS;

use switchyard_domain::qos::QualityOfService;

pub(crate) fn to_mqtt(qos: QualityOfService) -> QoS {
    match qos {
        QualityOfService::AtMostOnce => QoS::AtMostOnce,
        QualityOfService::AtLeastOnce => QoS::AtLeastOnce,
        QualityOfService::ExactlyOnce => QoS::ExactlyOnce,
    }
}

pub(crate) fn from_mqtt(qos: QoS) -> QualityOfService {
    match qos {
        QoS::AtMostOnce => QualityOfService::AtMostOnce,
        QoS::AtLeastOnce => QualityOfService::AtLeastOnce,
        QoS::ExactlyOnce => QualityOfService::ExactlyOnce,
    }
}

