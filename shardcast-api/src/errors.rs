//! # Dispatcher Error Types
//!
//! Error types used across the shardcast dispatcher.
//!
//! - `DispatchError`: everything a `submit` or `terminate` caller can observe
//! - `UnitError`: what a work unit returns when it cannot produce results
//! - `SharedError`: failures of shared-state method calls
//!
//! Unit failures never surface as `UnitError` to the dispatcher's caller; the
//! worker converts them into a [`Failure`](crate::Failure) that occupies the
//! unit's slot, and the dispatcher re-raises the first one as
//! `DispatchError::UnitFailure`.

use std::time::Duration;
use thiserror::Error;

use crate::failure::Failure;

/// Errors returned by dispatcher operations.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// A job was submitted after `terminate()`.
    #[error("Dispatcher pool has been terminated")]
    PoolTerminated,

    /// Not every shard reported before the deadline. Partial results are discarded.
    #[error("Job deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    /// A work unit failed; this is the first failure in unit order.
    #[error("Work unit failed: {0}")]
    UnitFailure(Failure),

    /// A work unit observed an operator-requested interrupt.
    #[error("Operator interrupt: {0}")]
    OperatorInterrupt(Failure),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Two work units share the same name.
    #[error("Duplicate work unit name: {0}")]
    DuplicateUnit(String),

    #[error("Failed to spawn worker thread: {0}")]
    WorkerSpawn(String),

    #[error("Failed during shutdown: {0}")]
    Shutdown(String),

    #[error("Internal dispatcher error: {0}")]
    Other(#[from] anyhow::Error),
}

impl DispatchError {
    /// The failure carried by `UnitFailure` or `OperatorInterrupt`, if any.
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            DispatchError::UnitFailure(failure) | DispatchError::OperatorInterrupt(failure) => {
                Some(failure)
            }
            _ => None,
        }
    }
}

/// Errors returned by a work unit's action.
#[derive(Error, Debug, Clone)]
pub enum UnitError {
    /// Recoverable failure; the unit's shard-mates keep running.
    #[error("{class}: {message}")]
    Failed {
        class: String,
        message: String,
        trace: Option<String>,
    },

    /// The unit has no action with this name.
    #[error("Unit '{unit}' does not support action '{action}'")]
    UnknownAction { unit: String, action: String },

    /// Operator-requested cancellation; stops the whole pool.
    #[error("Interrupted: {0}")]
    Interrupted(String),
}

impl UnitError {
    pub fn failed(class: impl Into<String>, message: impl Into<String>) -> Self {
        UnitError::Failed {
            class: class.into(),
            message: message.into(),
            trace: None,
        }
    }

    pub fn unknown_action(unit: impl Into<String>, action: impl Into<String>) -> Self {
        UnitError::UnknownAction {
            unit: unit.into(),
            action: action.into(),
        }
    }

    pub fn interrupted(reason: impl Into<String>) -> Self {
        UnitError::Interrupted(reason.into())
    }

    pub fn is_interrupt(&self) -> bool {
        matches!(self, UnitError::Interrupted(_))
    }
}

impl From<anyhow::Error> for UnitError {
    fn from(err: anyhow::Error) -> Self {
        UnitError::Failed {
            class: "error".to_string(),
            message: err.to_string(),
            trace: Some(format!("{:?}", err)),
        }
    }
}

/// Errors related to shared-state access.
#[derive(Error, Debug, Clone)]
pub enum SharedError {
    #[error("Method '{0}' is not exposed by the shared object")]
    NotExposed(String),

    #[error("Shared object has no method '{0}'")]
    UnknownMethod(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("No shared handle named '{0}'")]
    UnknownHandle(String),

    /// The remote channel is unavailable. Proxies recover from this locally.
    #[error("Shared state transport failure: {0}")]
    Transport(String),

    /// The shared object itself returned an error.
    #[error("Shared object call failed: {0}")]
    Remote(String),

    #[error("Failed to start shared state server: {0}")]
    ServerStart(String),
}
