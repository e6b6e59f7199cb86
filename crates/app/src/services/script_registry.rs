//! In-process scripting host — keeps registered proxy factories by name.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use serde_json::Value;

use crate::ports::{ScriptCallError, ScriptProxyFactory, ScriptingHost};

/// A [`ScriptingHost`] that holds proxies in memory and lets the embedding
/// process call them directly.
#[derive(Default)]
pub struct ScriptRegistry {
    factories: RwLock<HashMap<String, ScriptProxyFactory>>,
}

impl ScriptRegistry {
    /// Names of the registered proxies, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Call `function` on a fresh proxy registered under `name`.
    ///
    /// # Errors
    ///
    /// [`ScriptCallError::UnknownFunction`] when no proxy is registered under
    /// `name`; otherwise whatever the proxy returns.
    pub fn invoke(
        &self,
        name: &str,
        function: &str,
        arguments: &[Value],
    ) -> Result<Value, ScriptCallError> {
        let proxy = {
            let factories = self.factories.read().unwrap_or_else(PoisonError::into_inner);
            let factory = factories
                .get(name)
                .ok_or_else(|| ScriptCallError::UnknownFunction(format!("{name}.{function}")))?;
            factory()
        };
        tracing::debug!(proxy = name, function, "script call");
        proxy.call(function, arguments)
    }
}

impl ScriptingHost for ScriptRegistry {
    fn register_script_proxy(&self, name: &str, factory: ScriptProxyFactory) {
        let replaced = self
            .factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), factory)
            .is_some();
        if replaced {
            tracing::warn!(proxy = name, "script proxy replaced");
        } else {
            tracing::info!(proxy = name, "script proxy registered");
        }
    }
}

impl std::fmt::Debug for ScriptRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptRegistry")
            .field("names", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::ports::ScriptProxy;

    struct Echo;

    impl ScriptProxy for Echo {
        fn functions(&self) -> &'static [&'static str] {
            &["echo"]
        }

        fn call(&self, function: &str, arguments: &[Value]) -> Result<Value, ScriptCallError> {
            match function {
                "echo" => Ok(Value::Array(arguments.to_vec())),
                other => Err(ScriptCallError::UnknownFunction(other.to_string())),
            }
        }
    }

    #[test]
    fn should_call_registered_proxy() {
        let registry = ScriptRegistry::default();
        registry.register_script_proxy(
            "echo",
            Box::new(|| -> Box<dyn ScriptProxy> { Box::new(Echo) }),
        );

        let result = registry.invoke("echo", "echo", &[json!(1), json!("a")]).unwrap();

        assert_eq!(result, json!([1, "a"]));
        assert_eq!(registry.names(), vec!["echo"]);
    }

    #[test]
    fn should_reject_unknown_proxy() {
        let registry = ScriptRegistry::default();
        assert!(matches!(
            registry.invoke("missing", "echo", &[]),
            Err(ScriptCallError::UnknownFunction(name)) if name == "missing.echo"
        ));
    }
}
