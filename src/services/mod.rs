//! Collaborators of the job pipeline: a trait per concern plus the
//! production client behind it.

pub mod queue;
pub mod status;
pub mod storage;
pub mod transform;
