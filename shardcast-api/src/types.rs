use crate::errors::UnitError;
use crate::failure::Failure;
use crate::shared::SharedHandle;
use crate::unit::WorkUnit;
use std::collections::BTreeMap;
use std::sync::Arc;

// Type aliases for common types
pub type JobId = u64;
pub type UnitResult<O> = Result<Vec<O>, UnitError>;
pub type Slot<O> = Result<Vec<O>, Failure>;
pub type BoxedUnit<P, O> = Arc<dyn WorkUnit<Payload = P, Output = O>>;
pub type SharedRef = Arc<dyn SharedHandle>;
pub type SharedHandles = BTreeMap<String, SharedRef>;
