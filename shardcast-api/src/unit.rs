//! # Work Units
//!
//! A work unit is the dispatcher's view of a scanner plugin: a named object
//! exposing actions (`grep`, `audit`, ...) that take a payload and return a
//! list of results. Units are shared read-only between the caller and the
//! worker owning them, so any unit-local mutable state has to live behind the
//! unit's own synchronisation.
//!
//! Shared state (a knowledge base, a parser cache) is never reached through
//! globals. It is handed to every invocation through [`UnitContext`].

use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::errors::SharedError;
use crate::types::{JobId, SharedHandles, SharedRef, UnitResult};

/// A named, callable unit of work.
///
/// Implementations are usually generated with `#[derive(WorkUnit)]`, which
/// maps action names to inherent methods.
pub trait WorkUnit: Send + Sync + 'static {
    /// Data every action receives; broadcast to all shards of a job.
    type Payload: Send + Sync + 'static;

    /// Element type of the result list an action produces.
    type Output: Send + 'static;

    /// Stable name, unique within a dispatcher. Used to attribute failures.
    fn name(&self) -> &str;

    /// Names of the actions this unit supports. Empty means "not declared".
    fn actions(&self) -> &[&'static str] {
        &[]
    }

    fn supports(&self, action: &str) -> bool {
        let actions = self.actions();
        actions.is_empty() || actions.iter().any(|a| *a == action)
    }

    /// Run `action` against `payload`.
    ///
    /// Returning `UnitError::Interrupted` stops the whole pool; any other
    /// error (or a panic) only fills this unit's slot with a failure.
    fn invoke(
        &self,
        action: &str,
        payload: &Self::Payload,
        ctx: &UnitContext,
    ) -> UnitResult<Self::Output>;
}

/// Per-invocation context passed to every unit.
#[derive(Clone)]
pub struct UnitContext {
    job_id: JobId,
    shard: usize,
    action: Arc<str>,
    shared: Arc<SharedHandles>,
}

impl UnitContext {
    pub fn new(job_id: JobId, shard: usize, action: Arc<str>, shared: Arc<SharedHandles>) -> Self {
        Self {
            job_id,
            shard,
            action,
            shared,
        }
    }

    /// A context outside any dispatcher job, for calling units directly.
    pub fn detached() -> Self {
        Self::new(0, 0, Arc::from(""), Arc::new(SharedHandles::new()))
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn shard(&self) -> usize {
        self.shard
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    /// Look up a shared-state handle by the name it was registered under.
    pub fn shared(&self, name: &str) -> Option<&SharedRef> {
        self.shared.get(name)
    }

    /// Call an exposed method on a named shared-state handle.
    pub fn call_shared(
        &self,
        name: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, SharedError> {
        let handle = self
            .shared(name)
            .ok_or_else(|| SharedError::UnknownHandle(name.to_string()))?;
        handle.call(method, args)
    }
}

impl fmt::Debug for UnitContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitContext")
            .field("job_id", &self.job_id)
            .field("shard", &self.shard)
            .field("action", &self.action)
            .field("shared", &self.shared.keys().collect::<Vec<_>>())
            .finish()
    }
}
