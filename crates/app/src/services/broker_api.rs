//! API-call and scripting surfaces of the device message broker.

use serde_json::Value;

use switchyard_domain::device_message::DeviceMessage;
use switchyard_domain::error::ValidationError;
use switchyard_domain::qos::QualityOfService;

use crate::ports::{EmbeddedBroker, ScriptCallError, ScriptProxy, ScriptingHost, WireClientFactory};
use crate::services::api::ApiCall;
use crate::services::device_message_broker::{BridgeError, DeviceMessageBroker};

/// Name under which the bridge proxy is registered with a scripting host.
pub const SCRIPT_PROXY_NAME: &str = "device_message_broker";

/// Result key written by [`DeviceMessageBroker::get_connected_clients`].
pub const CONNECTED_CLIENTS_KEY: &str = "ConnectedClients";

const SCRIPT_FUNCTIONS: &[&str] = &["publish", "connected_clients"];

impl<B: EmbeddedBroker, F: WireClientFactory> DeviceMessageBroker<B, F> {
    /// Write the broker's sessions into `call` under `"ConnectedClients"`.
    ///
    /// # Errors
    ///
    /// [`BridgeError::NotRunning`] outside `Running`.
    pub fn get_connected_clients(&self, call: &mut ApiCall) -> Result<(), BridgeError> {
        let clients = self.connected_clients()?;
        call.set_result(CONNECTED_CLIENTS_KEY, clients)?;
        Ok(())
    }

    /// Publish the [`DeviceMessage`] carried by `call.parameter`.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Validation`] when the parameter is not a device message
    /// or its topic is invalid; [`BridgeError::NotRunning`] outside `Running`.
    pub fn publish_call(&self, call: &ApiCall) -> Result<(), BridgeError> {
        let message: DeviceMessage = call.parameter_as()?;
        self.publish_message(message)
    }

    /// Expose `publish` and `connected_clients` to scripts hosted by `host`.
    pub fn register_script_proxy(&self, host: &impl ScriptingHost) {
        let bridge = self.clone();
        host.register_script_proxy(
            SCRIPT_PROXY_NAME,
            Box::new(move || -> Box<dyn ScriptProxy> {
                Box::new(BridgeScriptProxy {
                    bridge: bridge.clone(),
                })
            }),
        );
    }
}

struct BridgeScriptProxy<B, F: WireClientFactory> {
    bridge: DeviceMessageBroker<B, F>,
}

impl<B: EmbeddedBroker, F: WireClientFactory> BridgeScriptProxy<B, F> {
    /// `publish(topic, payload, qos?)`; the payload is a string or a byte array.
    fn publish(&self, arguments: &[Value]) -> Result<Value, ScriptCallError> {
        let [topic, payload, rest @ ..] = arguments else {
            return Err(ScriptCallError::InvalidArguments(
                "expected (topic, payload, qos?)".to_string(),
            ));
        };
        let topic = topic
            .as_str()
            .ok_or_else(|| {
                ScriptCallError::InvalidArguments("topic must be a string".to_string())
            })?;
        let payload = match payload {
            Value::String(text) => text.clone().into_bytes(),
            other => serde_json::from_value::<Vec<u8>>(other.clone())
                .map_err(|err| ScriptCallError::InvalidArguments(format!("payload: {err}")))?,
        };
        let qos = match rest.first() {
            Some(level) => serde_json::from_value::<QualityOfService>(level.clone())
                .map_err(|err| ScriptCallError::InvalidArguments(format!("qos: {err}")))?,
            None => QualityOfService::default(),
        };
        self.bridge
            .publish(topic, payload, qos)
            .map_err(|err| ScriptCallError::Failed(Box::new(err)))?;
        Ok(Value::Null)
    }

    fn connected_clients(&self) -> Result<Value, ScriptCallError> {
        let clients = self
            .bridge
            .connected_clients()
            .map_err(|err| ScriptCallError::Failed(Box::new(err)))?;
        serde_json::to_value(clients)
            .map_err(|err| {
                ScriptCallError::Failed(Box::new(ValidationError::InvalidParameter(err)))
            })
    }
}

impl<B: EmbeddedBroker, F: WireClientFactory> ScriptProxy for BridgeScriptProxy<B, F> {
    fn functions(&self) -> &'static [&'static str] {
        SCRIPT_FUNCTIONS
    }

    fn call(&self, function: &str, arguments: &[Value]) -> Result<Value, ScriptCallError> {
        match function {
            "publish" => self.publish(arguments),
            "connected_clients" => self.connected_clients(),
            other => Err(ScriptCallError::UnknownFunction(other.to_string())),
        }
    }
}
