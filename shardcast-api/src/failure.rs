//! Captured work-unit failures.
//!
//! A `Failure` takes the place of a unit's results in its slot, so a job's
//! result list always holds one slot per unit even when some units fail.

use std::fmt;
use thiserror::Error;

use crate::errors::UnitError;
use crate::types::JobId;

/// Category of a captured failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// The unit returned an error; carries its class name.
    Error(String),
    /// The unit panicked.
    Panic,
    /// The unit (or a shard-mate) observed an operator interrupt.
    Interrupted,
    /// The worker thread owning the unit is gone.
    WorkerLost,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Error(class) => write!(f, "error[{}]", class),
            FailureKind::Panic => write!(f, "panic"),
            FailureKind::Interrupted => write!(f, "interrupted"),
            FailureKind::WorkerLost => write!(f, "worker lost"),
        }
    }
}

/// A failure captured while running one unit for one job.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unit '{unit}' failed in job {job_id} (shard {shard}): {kind}: {message}")]
pub struct Failure {
    /// Name of the unit the failure originated from
    pub unit: String,
    pub kind: FailureKind,
    pub message: String,
    /// Formatted trace, when one could be captured
    pub trace: Option<String>,
    pub job_id: JobId,
    pub shard: usize,
}

impl Failure {
    pub fn new(unit: impl Into<String>, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            kind,
            message: message.into(),
            trace: None,
            job_id: 0,
            shard: 0,
        }
    }

    /// Convert an error returned by a unit into the failure stored in its slot.
    pub fn from_unit_error(unit: impl Into<String>, err: UnitError) -> Self {
        match err {
            UnitError::Failed { class, message, trace } => {
                Self::new(unit, FailureKind::Error(class), message).with_trace(trace)
            }
            UnitError::UnknownAction { action, .. } => Self::new(
                unit,
                FailureKind::Error("unknown_action".to_string()),
                format!("action '{}' is not supported", action),
            ),
            UnitError::Interrupted(reason) => Self::new(unit, FailureKind::Interrupted, reason),
        }
    }

    pub fn with_job(mut self, job_id: JobId, shard: usize) -> Self {
        self.job_id = job_id;
        self.shard = shard;
        self
    }

    pub fn with_trace(mut self, trace: Option<String>) -> Self {
        self.trace = trace;
        self
    }

    pub fn is_interrupt(&self) -> bool {
        self.kind == FailureKind::Interrupted
    }
}
