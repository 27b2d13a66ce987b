//! # Shared State
//!
//! Cross-context access to a single shared object (a knowledge base, a
//! parser cache). The object lives on a dedicated server thread and is
//! driven by method name over a channel. When the server cannot be reached
//! the proxy degrades to a context-local instance and reports
//! `ProxyMode::LocalFallback`.

mod proxy;
mod server;

use std::time::Duration;

pub use proxy::SharedStateProxy;
pub use shardcast_api::shared::{arg, reply};

pub const DEFAULT_STATE_THREAD_PREFIX: &str = "shardcast-state";

/// Configuration for a [`SharedStateProxy`].
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    /// How long a remote call may take before it counts as a transport
    /// failure. `None` waits for the server indefinitely.
    pub call_timeout: Option<Duration>,

    /// Prefix for the server thread name; the proxy name is appended.
    pub thread_name_prefix: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            call_timeout: None,
            thread_name_prefix: DEFAULT_STATE_THREAD_PREFIX.to_string(),
        }
    }
}

impl ProxyConfig {
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }
}
