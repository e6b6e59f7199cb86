//! API call wrapper — a JSON parameter in, a JSON result map out.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use switchyard_domain::error::ValidationError;

/// One call dispatched by an API collaborator.
#[derive(Debug, Clone, Default)]
pub struct ApiCall {
    /// Caller-supplied argument.
    pub parameter: Value,
    /// Named results filled in by the callee.
    pub result: Map<String, Value>,
}

impl ApiCall {
    /// A call carrying `parameter` with an empty result.
    #[must_use]
    pub fn new(parameter: Value) -> Self {
        Self {
            parameter,
            result: Map::new(),
        }
    }

    /// Decode the parameter.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidParameter`] when the parameter does
    /// not have the shape of `T`.
    pub fn parameter_as<T: DeserializeOwned>(&self) -> Result<T, ValidationError> {
        Ok(T::deserialize(&self.parameter)?)
    }

    /// Store `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidParameter`] when `value` cannot be
    /// represented as JSON.
    pub fn set_result(&mut self, key: &str, value: impl Serialize) -> Result<(), ValidationError> {
        self.result.insert(key.to_string(), serde_json::to_value(value)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Dim {
        level: u8,
    }

    #[test]
    fn should_decode_parameter() {
        let call = ApiCall::new(json!({ "level": 40 }));
        assert_eq!(call.parameter_as::<Dim>().unwrap(), Dim { level: 40 });
    }

    #[test]
    fn should_reject_parameter_with_wrong_shape() {
        let call = ApiCall::new(json!("forty"));
        assert!(matches!(
            call.parameter_as::<Dim>(),
            Err(ValidationError::InvalidParameter(_))
        ));
    }

    #[test]
    fn should_overwrite_result_under_same_key() {
        let mut call = ApiCall::default();
        call.set_result("Level", 1).unwrap();
        call.set_result("Level", 2).unwrap();
        assert_eq!(call.result.get("Level"), Some(&json!(2)));
    }
}
