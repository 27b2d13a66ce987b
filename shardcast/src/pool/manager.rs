//! Per-kind registry of dispatchers.
//!
//! Scanners keep one dispatcher for grep plugins and one for audit plugins.
//! A `ManagerSet` owns them explicitly, starts them on first use and
//! replaces them when they were terminated or interrupted.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use shardcast_api::{BoxedUnit, DispatchError, SharedHandles, SharedRef};

use super::config::DispatcherConfig;
use super::dispatcher::{Dispatcher, DispatcherState};
use super::lock;

/// The plugin families that get a dispatcher of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManagerKind {
    Grep,
    Audit,
}

impl ManagerKind {
    /// Action invoked on the units of this kind.
    pub fn action(&self) -> &'static str {
        match self {
            ManagerKind::Grep => "grep",
            ManagerKind::Audit => "audit",
        }
    }
}

impl fmt::Display for ManagerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.action())
    }
}

pub struct ManagerSet<P, O>
where
    P: Send + Sync + 'static,
    O: Send + 'static,
{
    config: DispatcherConfig,
    shared: SharedHandles,
    managers: Mutex<HashMap<ManagerKind, Arc<Dispatcher<P, O>>>>,
}

impl<P, O> ManagerSet<P, O>
where
    P: Send + Sync + 'static,
    O: Send + 'static,
{
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            config,
            shared: SharedHandles::new(),
            managers: Mutex::new(HashMap::new()),
        }
    }

    /// Register a shared-state handle for every dispatcher started afterwards.
    pub fn with_shared(mut self, name: impl Into<String>, handle: SharedRef) -> Self {
        self.shared.insert(name.into(), handle);
        self
    }

    pub fn get(&self, kind: ManagerKind) -> Option<Arc<Dispatcher<P, O>>> {
        lock(&self.managers).get(&kind).cloned()
    }

    /// Return the running dispatcher for `kind`, starting one over the units
    /// produced by `units` if there is none or the current one is unusable.
    pub fn get_or_start<F>(&self, kind: ManagerKind, units: F) -> Result<Arc<Dispatcher<P, O>>, DispatchError>
    where
        F: FnOnce() -> Vec<BoxedUnit<P, O>>,
    {
        let mut managers = lock(&self.managers);
        if let Some(existing) = managers.get(&kind) {
            if existing.state() == DispatcherState::Running && !existing.is_interrupted() {
                return Ok(Arc::clone(existing));
            }
            tracing::info!(kind = %kind, dispatcher = existing.id(), "replacing unusable dispatcher");
        }

        let dispatcher = Arc::new(self.start(units())?);
        if let Some(previous) = managers.insert(kind, Arc::clone(&dispatcher)) {
            if let Err(err) = previous.terminate() {
                tracing::warn!(kind = %kind, error = %err, "previous dispatcher did not shut down cleanly");
            }
        }
        Ok(dispatcher)
    }

    /// Terminate the dispatcher for `kind` (if any) and start a fresh one.
    pub fn restart<F>(&self, kind: ManagerKind, units: F) -> Result<Arc<Dispatcher<P, O>>, DispatchError>
    where
        F: FnOnce() -> Vec<BoxedUnit<P, O>>,
    {
        let previous = lock(&self.managers).remove(&kind);
        if let Some(previous) = previous {
            tracing::info!(kind = %kind, dispatcher = previous.id(), "restarting dispatcher");
            previous.terminate()?;
        }
        self.get_or_start(kind, units)
    }

    /// Terminate every dispatcher. All are torn down even if one fails; the
    /// first error is returned.
    pub fn terminate_all(&self) -> Result<(), DispatchError> {
        let managers: Vec<_> = lock(&self.managers).drain().collect();
        let mut first_error = None;
        for (kind, dispatcher) in managers {
            if let Err(err) = dispatcher.terminate() {
                tracing::warn!(kind = %kind, error = %err, "dispatcher shutdown failed");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn start(&self, units: Vec<BoxedUnit<P, O>>) -> Result<Dispatcher<P, O>, DispatchError> {
        Dispatcher::builder()
            .units(units)
            .config(self.config.clone())
            .shared_handles(self.shared.clone())
            .build()
    }
}
