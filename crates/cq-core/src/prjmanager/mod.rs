//! Project-level orchestration: triage, purging and Run formation.

mod components;
mod manager;
mod pcl;
mod purge;
mod runforming;
mod triage;

pub use components::PclArena;
pub use manager::{PokeReport, ProjectEvent, ProjectManager, ProjectState, PURGE_DEADLINE_SECS};
pub use pcl::{pcl_from_cl, Component, PRun, Pcl, PclStatus, PurgeReason, PurgingCl};
pub use purge::{ClPurger, MutatorPurger, RecordingPurger};
pub use runforming::{form_runs, Formation, RunCandidate};
pub use triage::{triage, ClTriage, TriageResult, TriageSupporter, TriagedDeps};
