use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use shardcast_api::{ProxyMode, SharedError, SharedHandle, SharedObject};

use super::server::StateServer;
use super::ProxyConfig;
use crate::logging;
use crate::pool::lock;

type Factory<T> = Arc<dyn Fn() -> T + Send + Sync>;

const MODE_REMOTE: u8 = 0;
const MODE_LOCAL: u8 = 1;

/// Accessor for a shared object hosted on a server thread.
///
/// Calls go to the server while it is reachable. On a transport failure the
/// proxy logs a warning, switches to [`ProxyMode::LocalFallback`] and serves
/// the call from a local instance built by the factory. Writes made in that
/// mode stay local; [`ensure_active`](SharedHandle::ensure_active) returns to
/// [`ProxyMode::Remote`], starting a fresh server only if the old one died.
pub struct SharedStateProxy<T: SharedObject> {
    name: String,
    exposed: BTreeSet<String>,
    factory: Factory<T>,
    config: ProxyConfig,
    server: Mutex<Option<StateServer>>,
    local: Mutex<Option<T>>,
    mode: AtomicU8,
    dispatch: tracing::Dispatch,
}

impl<T: SharedObject> SharedStateProxy<T> {
    /// Share `object`. The server and any fallback instance are clones of it.
    pub fn new<I, S>(name: impl Into<String>, object: T, exposed: I) -> Self
    where
        T: Clone + Sync,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_factory(name, move || object.clone(), exposed)
    }

    pub fn from_factory<F, I, S>(name: impl Into<String>, factory: F, exposed: I) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_factory_with_config(name, factory, exposed, ProxyConfig::default())
    }

    pub fn from_factory_with_config<F, I, S>(
        name: impl Into<String>,
        factory: F,
        exposed: I,
        config: ProxyConfig,
    ) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let proxy = Self {
            name: name.into(),
            exposed: exposed.into_iter().map(Into::into).collect(),
            factory: Arc::new(factory),
            config,
            server: Mutex::new(None),
            local: Mutex::new(None),
            mode: AtomicU8::new(MODE_LOCAL),
            dispatch: logging::current_subscriber(),
        };
        proxy.restart();
        proxy
    }

    /// Methods callers may invoke.
    pub fn exposed(&self) -> impl Iterator<Item = &str> {
        self.exposed.iter().map(String::as_str)
    }

    /// Replace the server with a fresh instance from the factory.
    ///
    /// State held by the previous server is lost. Returns the resulting mode.
    pub fn restart(&self) -> ProxyMode {
        let mut server = lock(&self.server);
        if let Some(previous) = server.take() {
            previous.shutdown();
        }

        let thread_name = format!("{}-{}", self.config.thread_name_prefix, self.name);
        match StateServer::start(thread_name, (self.factory)(), self.dispatch.clone()) {
            Ok(started) => {
                *server = Some(started);
                self.mode.store(MODE_REMOTE, Ordering::SeqCst);
                tracing::debug!(proxy = %self.name, "state server running");
                ProxyMode::Remote
            }
            Err(err) => {
                self.mode.store(MODE_LOCAL, Ordering::SeqCst);
                tracing::warn!(proxy = %self.name, error = %err, "state server failed to start, using local state");
                ProxyMode::LocalFallback
            }
        }
    }

    /// Stop the server. Later calls are served locally until a restart.
    pub fn shutdown_remote(&self) {
        if let Some(server) = lock(&self.server).take() {
            server.shutdown();
            tracing::debug!(proxy = %self.name, "state server shut down");
        }
    }

    fn call_remote(&self, method: &str, args: &[Value]) -> Option<Result<Value, SharedError>> {
        let client = lock(&self.server).as_ref().map(StateServer::client);
        let outcome = match client {
            Some(client) => client.call(method, args.to_vec(), self.config.call_timeout),
            None => Err(SharedError::Transport("state server is not running".into())),
        };

        match outcome {
            Ok(result) => Some(result),
            Err(err) => {
                tracing::warn!(
                    proxy = %self.name,
                    method,
                    error = %err,
                    "remote shared state unreachable, falling back to local state"
                );
                self.mode.store(MODE_LOCAL, Ordering::SeqCst);
                None
            }
        }
    }

    fn call_local(&self, method: &str, args: &[Value]) -> Result<Value, SharedError> {
        let mut local = lock(&self.local);
        let object = local.get_or_insert_with(|| (self.factory)());
        object.call(method, args)
    }
}

impl<T: SharedObject> SharedHandle for SharedStateProxy<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, SharedError> {
        if !self.exposed.contains(method) {
            return Err(SharedError::NotExposed(method.to_string()));
        }
        if self.mode() == ProxyMode::Remote {
            if let Some(result) = self.call_remote(method, &args) {
                return result;
            }
        }
        self.call_local(method, &args)
    }

    fn is_active(&self) -> bool {
        lock(&self.server).as_ref().is_some_and(StateServer::is_alive)
    }

    fn mode(&self) -> ProxyMode {
        match self.mode.load(Ordering::SeqCst) {
            MODE_REMOTE => ProxyMode::Remote,
            _ => ProxyMode::LocalFallback,
        }
    }

    /// Restart the server only if its thread is gone. A live server that
    /// merely missed a call deadline keeps its state; the proxy goes back to
    /// `Remote`.
    fn ensure_active(&self) -> ProxyMode {
        if self.is_active() {
            if self.mode.swap(MODE_REMOTE, Ordering::SeqCst) == MODE_LOCAL {
                tracing::info!(proxy = %self.name, "state server still running, leaving local fallback");
            }
            return ProxyMode::Remote;
        }
        tracing::info!(proxy = %self.name, "restarting shared state server");
        self.restart()
    }
}

impl<T: SharedObject> fmt::Debug for SharedStateProxy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedStateProxy")
            .field("name", &self.name)
            .field("exposed", &self.exposed)
            .field("mode", &self.mode())
            .finish()
    }
}

impl<T: SharedObject> Drop for SharedStateProxy<T> {
    fn drop(&mut self) {
        self.shutdown_remote();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shardcast_api::shared::{arg, reply};
    use std::collections::HashMap;

    #[derive(Clone, Default)]
    struct Store {
        entries: HashMap<String, i64>,
    }

    impl SharedObject for Store {
        fn call(&mut self, method: &str, args: &[Value]) -> Result<Value, SharedError> {
            match method {
                "set" => {
                    let key: String = arg(args, 0)?;
                    let value: i64 = arg(args, 1)?;
                    reply(self.entries.insert(key, value))
                }
                "get" => {
                    let key: String = arg(args, 0)?;
                    reply(self.entries.get(&key).copied())
                }
                other => Err(SharedError::UnknownMethod(other.to_string())),
            }
        }
    }

    fn proxy() -> SharedStateProxy<Store> {
        SharedStateProxy::new("kb", Store::default(), ["get", "set", "missing"])
    }

    #[test]
    fn test_remote_state_is_shared_between_calls() {
        let proxy = proxy();
        assert_eq!(proxy.mode(), ProxyMode::Remote);
        assert!(proxy.is_active());

        proxy.call("set", vec![json!("a"), json!(1)]).unwrap();
        assert_eq!(proxy.call("get", vec![json!("a")]).unwrap(), json!(1));
    }

    #[test]
    fn test_unexposed_and_unknown_methods() {
        let proxy = proxy();
        assert!(matches!(proxy.call("clear", vec![]), Err(SharedError::NotExposed(m)) if m == "clear"));
        assert!(matches!(proxy.call("missing", vec![]), Err(SharedError::UnknownMethod(_))));
        // object errors are not transport failures
        assert_eq!(proxy.mode(), ProxyMode::Remote);
    }

    #[test]
    fn test_restart_discards_remote_state() {
        let proxy = proxy();
        proxy.call("set", vec![json!("a"), json!(1)]).unwrap();
        assert_eq!(proxy.restart(), ProxyMode::Remote);
        assert_eq!(proxy.call("get", vec![json!("a")]).unwrap(), Value::Null);
    }
}
