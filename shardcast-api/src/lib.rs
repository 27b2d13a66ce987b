//! # Shardcast API
//!
//! Interfaces shared by every part of the shardcast dispatcher: the work units
//! that are fanned out across worker threads, the per-unit result slots and
//! failures that are fanned back in, the error taxonomy, and the shared-state
//! handles that units use to reach objects living outside their shard.
//!
//! ## Core Components
//!
//! - **WorkUnit**: a named unit of work exposing one or more actions
//! - **UnitContext**: per-invocation context (job id, shard, shared handles)
//! - **Failure**: a captured unit failure occupying that unit's result slot
//! - **SharedObject / SharedHandle**: method-name dispatch for state shared
//!   between execution contexts
//!
//! ## Usage Example
//!
//! ```rust
//! use shardcast_api::{UnitContext, UnitResult, WorkUnit};
//!
//! #[derive(WorkUnit)]
//! #[work_unit(name = "length", payload = "String", output = "usize", actions(grep = "measure"))]
//! struct Length;
//!
//! impl Length {
//!     fn measure(&self, body: &String, _ctx: &UnitContext) -> UnitResult<usize> {
//!         Ok(vec![body.len()])
//!     }
//! }
//!
//! let unit = Length;
//! let ctx = UnitContext::detached();
//! assert_eq!(unit.invoke("grep", &"abc".to_string(), &ctx).unwrap(), vec![3]);
//! ```
//!
//! ## Module Organization
//!
//! - [`unit`]: the `WorkUnit` trait and `UnitContext`
//! - [`failure`]: `Failure` and `FailureKind`
//! - [`shared`]: `SharedObject`, `SharedHandle`, `ProxyMode`
//! - [`errors`]: error types
//! - [`types`]: common type aliases

extern crate self as shardcast_api;

pub mod errors;
pub mod failure;
pub mod shared;
pub mod types;
pub mod unit;

pub use errors::{DispatchError, SharedError, UnitError};
pub use failure::{Failure, FailureKind};
pub use shared::{ProxyMode, SharedHandle, SharedObject};
pub use types::{BoxedUnit, JobId, SharedHandles, SharedRef, Slot, UnitResult};
pub use unit::{UnitContext, WorkUnit};

// Re-export the derive macro
pub use shardcast_api_derive::WorkUnit;
