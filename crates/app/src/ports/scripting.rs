//! Scripting port — where components expose a proxy to a scripting surface.
//!
//! The core only registers proxies; it never consumes anything back from the
//! scripting host.

use serde_json::Value;

/// Errors a proxy reports back to the script.
#[derive(Debug, thiserror::Error)]
pub enum ScriptCallError {
    /// The proxy has no such function.
    #[error("unknown function {0:?}")]
    UnknownFunction(String),

    /// Arguments did not match the function signature.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// The call itself failed.
    #[error("call failed")]
    Failed(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Functions a component exposes to scripts.
pub trait ScriptProxy: Send + Sync {
    /// Names of the callable functions.
    fn functions(&self) -> &'static [&'static str];

    /// Call `function` with positional JSON `arguments`.
    ///
    /// # Errors
    ///
    /// See [`ScriptCallError`].
    fn call(&self, function: &str, arguments: &[Value]) -> Result<Value, ScriptCallError>;
}

/// Builds a proxy when the scripting host creates a script context.
pub type ScriptProxyFactory = Box<dyn Fn() -> Box<dyn ScriptProxy> + Send + Sync>;

/// Registration point for script proxies.
pub trait ScriptingHost: Send + Sync {
    /// Make the proxy built by `factory` available under `name`.
    fn register_script_proxy(&self, name: &str, factory: ScriptProxyFactory);
}
