//! CQ Core - project-level orchestration for a CI commit queue
//!
//! Changes (CLs) approved for automated landing are grouped by their declared
//! dependencies, verified together as Runs and submitted one Run at a time per
//! project.
//!
//! ## Modules
//!
//! - [`changelist`]: the CL entity and the [`Mutator`], the only writer of CLs
//! - [`prjmanager`]: per-project loop; dependency triage and Run formation
//! - [`run`]: Run lifecycle and the per-project submission queue
//! - [`tasks`]: outbox task payloads and their dispatcher
//! - [`engine`]: wires managers, dispatcher and periodic resync together

pub mod changelist;
pub mod config;
pub mod engine;
pub mod error;
pub mod ids;
pub mod metrics;
pub mod obs;
pub mod prjmanager;
pub mod run;
pub mod tasks;
pub mod telemetry;
pub mod tree;

pub use changelist::{
    ApplicableConfig, ApplicableProject, Cl, ClMutation, Dep, DepKind, MutateOutcome, Mutator,
    RunMode, Snapshot, Trigger,
};
pub use config::{
    CombineCls, ConfigGroup, ConfigProvider, ProjectConfig, StaticConfigProvider, SubmitOptions,
};
pub use engine::{Engine, EngineSettings};
pub use error::{CqError, CqResult};
pub use ids::{ClId, ExternalId, RunId};
pub use prjmanager::{
    form_runs, pcl_from_cl, triage, ClPurger, ClTriage, Component, Formation, MutatorPurger,
    PRun, Pcl, PclStatus, ProjectEvent, ProjectManager, ProjectState, PurgeReason, PurgingCl,
    RecordingPurger, RunCandidate, TriageResult, TriageSupporter, TriagedDeps,
};
pub use run::{
    OfflineSubmitter, RecordingSubmitter, Run, RunCreator, RunEvent, RunManager, RunSettings,
    RunStatus, SubmissionOutcome, SubmissionRequest, SubmitQueue, Submission, Submitter,
};
pub use tasks::{
    ClUpdatedEvent, ProjectEventSink, RecordingSink, RunEventSink, Task, TaskDispatcher,
};
pub use telemetry::init_tracing;
pub use tree::{ManualTree, TreeClient, TreeState, TreeStatus};

pub use cq_state::{Clock, Datastore, SystemClock, TestClock, Transaction};
