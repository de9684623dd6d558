//! Changes (CLs) and the transactional gateway that mutates them.

mod model;
mod mutator;

pub use model::{
    ApplicableConfig, ApplicableProject, Cl, ClMap, Dep, DepKind, RunMode, Snapshot, Trigger,
};
pub use mutator::{finalize_batch, ClMutation, MutateOutcome, Mutator, CL_ID_SEQUENCE};
