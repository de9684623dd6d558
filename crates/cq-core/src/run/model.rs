use chrono::{DateTime, Utc};
use cq_state::Entity;
use serde::{Deserialize, Serialize};

use crate::changelist::{RunMode, Trigger};
use crate::ids::{ClId, RunId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    WaitingForSubmission,
    Submitting,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_ended(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Running => "RUNNING",
            RunStatus::WaitingForSubmission => "WAITING_FOR_SUBMISSION",
            RunStatus::Submitting => "SUBMITTING",
            RunStatus::Succeeded => "SUCCEEDED",
            RunStatus::Failed => "FAILED",
            RunStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Submission progress of a full Run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    /// Submission order: dependencies first.
    pub cls: Vec<ClId>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default)]
    pub tree_open: bool,
    #[serde(default)]
    pub last_tree_check_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub submitted_cls: Vec<ClId>,
    #[serde(default)]
    pub failed_cls: Vec<ClId>,
}

/// A CL as it was when the Run was created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCl {
    pub clid: ClId,
    pub eversion: i64,
    pub trigger: Trigger,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub project: String,
    pub mode: RunMode,
    pub status: RunStatus,
    /// Name of the config group the Run was formed under.
    pub config_group_id: String,
    /// Sorted.
    pub cls: Vec<ClId>,
    pub run_cls: Vec<RunCl>,
    pub create_time: DateTime<Utc>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// Incremented on every save.
    pub eversion: i64,
    #[serde(default)]
    pub submission: Option<Submission>,
    #[serde(default)]
    pub cancel_reason: Option<String>,
}

impl Run {
    pub fn run_cl(&self, clid: ClId) -> Option<&RunCl> {
        self.run_cls.iter().find(|c| c.clid == clid)
    }
}

impl Entity for Run {
    const KIND: &'static str = "run";

    fn entity_key(&self) -> String {
        self.id.as_str().to_string()
    }
}
