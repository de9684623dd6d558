//! Runs: creation, the Run state machine and the submission queue.

mod creator;
mod events;
mod handler;
mod model;
pub mod submit_queue;
mod submitter;

pub use creator::RunCreator;
pub use events::{RunEvent, SubmissionOutcome};
pub use handler::{RunManager, RunSettings};
pub use model::{Run, RunCl, RunStatus, Submission};
pub use submit_queue::{load_current_and_waitlist, SubmitQueue};
pub use submitter::{OfflineSubmitter, RecordingSubmitter, SubmissionRequest, Submitter};
