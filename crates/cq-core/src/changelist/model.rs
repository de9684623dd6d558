use chrono::{DateTime, Utc};
use cq_state::Entity;
use serde::{Deserialize, Serialize};

use crate::ids::{ClId, ExternalId, RunId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepKind {
    /// Must be submitted before (or together with) the dependent CL.
    Hard,
    /// Ordering hint only.
    Soft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dep {
    pub clid: ClId,
    pub kind: DepKind,
}

impl Dep {
    pub fn hard(clid: i64) -> Self {
        Self {
            clid: ClId(clid),
            kind: DepKind::Hard,
        }
    }

    pub fn soft(clid: i64) -> Self {
        Self {
            clid: ClId(clid),
            kind: DepKind::Soft,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    DryRun,
    QuickDryRun,
    /// Verify, then submit.
    FullRun,
}

impl RunMode {
    /// Verification only, never submits.
    pub fn is_dry_run_class(self) -> bool {
        matches!(self, RunMode::DryRun | RunMode::QuickDryRun)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::DryRun => "DRY_RUN",
            RunMode::QuickDryRun => "QUICK_DRY_RUN",
            RunMode::FullRun => "FULL_RUN",
        }
    }
}

/// A request to run the commit queue on a CL, as voted in the review system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub mode: RunMode,
    pub time: DateTime<Utc>,
    pub email: String,
}

/// Review-system state of a CL, always replaced as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Project that fetched this snapshot.
    pub project: String,
    pub external_update_time: DateTime<Utc>,
    pub patchset: u32,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub trigger: Option<Trigger>,
    #[serde(default)]
    pub deps: Vec<Dep>,
    #[serde(default)]
    pub submitted: bool,
    #[serde(default)]
    pub files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicableProject {
    pub project: String,
    /// Names of the project's config groups matching the CL.
    pub config_groups: Vec<String>,
}

/// Which projects and config groups watch a CL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicableConfig {
    pub projects: Vec<ApplicableProject>,
}

impl ApplicableConfig {
    pub fn single(project: &str, groups: &[&str]) -> Self {
        Self {
            projects: vec![ApplicableProject {
                project: project.to_string(),
                config_groups: groups.iter().map(|g| g.to_string()).collect(),
            }],
        }
    }

    pub fn for_project(&self, project: &str) -> Option<&ApplicableProject> {
        self.projects.iter().find(|p| p.project == project)
    }
}

/// A tracked change.
///
/// `id`, `external_id`, `eversion` and `update_time` are maintained by the
/// [`Mutator`](crate::changelist::Mutator) and must not be changed by callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cl {
    pub id: ClId,
    pub external_id: ExternalId,
    /// Incremented by exactly one on every committed mutation.
    pub eversion: i64,
    pub update_time: DateTime<Utc>,
    #[serde(default)]
    pub snapshot: Option<Snapshot>,
    #[serde(default)]
    pub applicable_config: Option<ApplicableConfig>,
    /// The review system reports the change as gone or inaccessible.
    #[serde(default)]
    pub deleted: bool,
    /// Non-terminal Runs including this CL, sorted.
    #[serde(default)]
    pub incomplete_runs: Vec<RunId>,
    /// Why the commit queue last removed this CL's trigger.
    #[serde(default)]
    pub purge_messages: Vec<String>,
}

impl Cl {
    /// Add a Run to `incomplete_runs`; returns false if already present.
    pub fn add_incomplete_run(&mut self, run_id: &RunId) -> bool {
        match self.incomplete_runs.binary_search(run_id) {
            Ok(_) => false,
            Err(pos) => {
                self.incomplete_runs.insert(pos, run_id.clone());
                true
            }
        }
    }

    /// Remove a Run from `incomplete_runs`; returns false if it was absent.
    pub fn remove_incomplete_run(&mut self, run_id: &RunId) -> bool {
        let before = self.incomplete_runs.len();
        self.incomplete_runs.retain(|r| r != run_id);
        before != self.incomplete_runs.len()
    }

    pub fn trigger(&self) -> Option<&Trigger> {
        self.snapshot.as_ref().and_then(|s| s.trigger.as_ref())
    }
}

impl Entity for Cl {
    const KIND: &'static str = "cl";

    fn entity_key(&self) -> String {
        self.id.to_string()
    }
}

/// Maps an external identity to its internal ID. Written once, with the CL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClMap {
    pub external_id: ExternalId,
    pub clid: ClId,
}

impl Entity for ClMap {
    const KIND: &'static str = "cl_map";

    fn entity_key(&self) -> String {
        self.external_id.as_str().to_string()
    }
}
