//! # Shared State Interfaces
//!
//! Objects shared between execution contexts are driven by method name with
//! JSON arguments, so the same call can travel over a channel to the thread
//! hosting the object or be applied to a local copy.
//!
//! - `SharedObject`: implemented by the object being shared
//! - `SharedHandle`: implemented by whatever gives units access to it
//! - `ProxyMode`: which path a handle is currently using

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::errors::SharedError;

/// An object whose methods can be invoked by name.
pub trait SharedObject: Send + 'static {
    fn call(&mut self, method: &str, args: &[Value]) -> Result<Value, SharedError>;
}

/// Access path currently used by a shared-state handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProxyMode {
    /// Calls go to the single instance hosted by the state server.
    Remote,
    /// The server is unreachable; calls go to a context-local instance.
    /// Writes made in this mode are not visible to other contexts.
    LocalFallback,
}

impl fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyMode::Remote => write!(f, "remote"),
            ProxyMode::LocalFallback => write!(f, "local-fallback"),
        }
    }
}

/// A handle units use to reach shared state.
pub trait SharedHandle: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Invoke an exposed method.
    fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, SharedError>;

    /// Whether the remote path is currently usable.
    fn is_active(&self) -> bool;

    fn mode(&self) -> ProxyMode;

    /// Bring the remote path back up if it is down. Returns the resulting mode.
    fn ensure_active(&self) -> ProxyMode;
}

/// Deserialize positional argument `index`.
pub fn arg<T: DeserializeOwned>(args: &[Value], index: usize) -> Result<T, SharedError> {
    let value = args.get(index).ok_or_else(|| {
        SharedError::InvalidArguments(format!("missing argument at position {}", index))
    })?;
    serde_json::from_value(value.clone())
        .map_err(|e| SharedError::InvalidArguments(format!("argument {}: {}", index, e)))
}

/// Serialize a method's return value.
pub fn reply<T: Serialize>(value: T) -> Result<Value, SharedError> {
    serde_json::to_value(value).map_err(|e| SharedError::Remote(e.to_string()))
}
