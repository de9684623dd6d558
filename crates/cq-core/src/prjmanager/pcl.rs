//! Project-scoped projections consumed by triage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::changelist::{Cl, Dep, RunMode, Trigger};
use crate::config::ProjectConfig;
use crate::ids::{ClId, RunId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PclStatus {
    Ok,
    /// No snapshot fetched yet.
    Unknown,
    /// Not watched by this project's config.
    Unwatched,
    /// Gone from the review system.
    Deleted,
}

/// A project's view of a CL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pcl {
    pub clid: ClId,
    pub eversion: i64,
    pub status: PclStatus,
    /// Indexes into the project's `config_groups`, sorted.
    #[serde(default)]
    pub config_group_indexes: Vec<usize>,
    #[serde(default)]
    pub trigger: Option<Trigger>,
    #[serde(default)]
    pub submitted: bool,
    #[serde(default)]
    pub deps: Vec<Dep>,
}

impl Pcl {
    pub fn mode(&self) -> Option<RunMode> {
        self.trigger.as_ref().map(|t| t.mode)
    }
}

/// Build the PCL of `cl` as seen by `project`.
///
/// Group names the config does not know are dropped. A CL that is not
/// watched by the project keeps its trigger only when the project fetched
/// it, so that it can be told why nothing happens.
pub fn pcl_from_cl(cl: &Cl, project: &str, config: &ProjectConfig) -> Pcl {
    let mut pcl = Pcl {
        clid: cl.id,
        eversion: cl.eversion,
        status: PclStatus::Unknown,
        config_group_indexes: Vec::new(),
        trigger: None,
        submitted: false,
        deps: Vec::new(),
    };
    let Some(snapshot) = &cl.snapshot else {
        return pcl;
    };
    if cl.deleted {
        pcl.status = PclStatus::Deleted;
        return pcl;
    }
    pcl.submitted = snapshot.submitted;
    pcl.deps = snapshot.deps.clone();

    let watched = cl
        .applicable_config
        .as_ref()
        .and_then(|ac| ac.for_project(project));
    match watched {
        None => {
            pcl.status = PclStatus::Unwatched;
            if snapshot.project == project {
                pcl.trigger = snapshot.trigger.clone();
            }
        }
        Some(ap) => {
            pcl.status = PclStatus::Ok;
            pcl.trigger = snapshot.trigger.clone();
            let mut idx: Vec<usize> = ap
                .config_groups
                .iter()
                .filter_map(|name| config.group_index(name))
                .collect();
            idx.sort_unstable();
            idx.dedup();
            pcl.config_group_indexes = idx;
        }
    }
    pcl
}

/// An in-flight Run as seen from a component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PRun {
    pub id: RunId,
    pub mode: RunMode,
    /// Sorted.
    pub clids: Vec<ClId>,
}

/// Connected PCLs plus the Runs touching them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    /// Sorted.
    pub clids: Vec<ClId>,
    #[serde(default)]
    pub pruns: Vec<PRun>,
}

impl Component {
    /// Indexes of the PRuns including `clid`.
    pub fn run_indexes(&self, clid: ClId) -> Vec<usize> {
        self.pruns
            .iter()
            .enumerate()
            .filter(|(_, r)| r.clids.binary_search(&clid).is_ok())
            .map(|(i, _)| i)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum PurgeReason {
    WatchedByManyConfigGroups { groups: Vec<String> },
    IncompatibleDeps { deps: Vec<ClId> },
    Unwatched,
}

impl PurgeReason {
    /// Explanation posted to the CL's author.
    pub fn message(&self) -> String {
        match self {
            PurgeReason::WatchedByManyConfigGroups { groups } => format!(
                "CL matches several config groups ({}); it must match exactly one",
                groups.join(", ")
            ),
            PurgeReason::IncompatibleDeps { deps } => {
                let list: Vec<String> = deps.iter().map(|d| d.to_string()).collect();
                format!(
                    "dependencies {} are neither submitted nor triggered in a compatible mode",
                    list.join(", ")
                )
            }
            PurgeReason::Unwatched => "CL is not watched by the project's config".to_string(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PurgeReason::WatchedByManyConfigGroups { .. } => "watched_by_many_config_groups",
            PurgeReason::IncompatibleDeps { .. } => "incompatible_deps",
            PurgeReason::Unwatched => "unwatched",
        }
    }
}

/// A CL whose trigger is being removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgingCl {
    pub clid: ClId,
    /// Forget the entry after this time even if the trigger is still there.
    pub deadline: DateTime<Utc>,
    pub reasons: Vec<PurgeReason>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelist::{ApplicableConfig, Snapshot};
    use crate::config::ConfigGroup;
    use crate::ids::ExternalId;

    fn cl(project: &str, applicable: Option<ApplicableConfig>) -> Cl {
        Cl {
            id: ClId(7),
            external_id: ExternalId::gerrit("review.example.com", 7),
            eversion: 3,
            update_time: Utc::now(),
            snapshot: Some(Snapshot {
                project: project.to_string(),
                external_update_time: Utc::now(),
                patchset: 1,
                owner: "dev@example.com".to_string(),
                trigger: Some(Trigger {
                    mode: RunMode::DryRun,
                    time: Utc::now(),
                    email: "dev@example.com".to_string(),
                }),
                deps: vec![Dep::hard(6)],
                submitted: false,
                files: vec![],
            }),
            applicable_config: applicable,
            deleted: false,
            incomplete_runs: vec![],
            purge_messages: vec![],
        }
    }

    fn config() -> ProjectConfig {
        ProjectConfig::new(
            "p",
            vec![ConfigGroup::singular("main"), ConfigGroup::singular("infra")],
        )
    }

    #[test]
    fn watched_cl_maps_group_names_to_indexes() {
        let pcl = pcl_from_cl(
            &cl("p", Some(ApplicableConfig::single("p", &["infra", "main", "gone"]))),
            "p",
            &config(),
        );
        assert_eq!(pcl.status, PclStatus::Ok);
        assert_eq!(pcl.config_group_indexes, vec![0, 1]);
        assert_eq!(pcl.eversion, 3);
        assert_eq!(pcl.deps, vec![Dep::hard(6)]);
    }

    #[test]
    fn unwatched_keeps_trigger_only_for_owner() {
        let own = pcl_from_cl(&cl("p", None), "p", &config());
        assert_eq!(own.status, PclStatus::Unwatched);
        assert!(own.trigger.is_some());

        let foreign = pcl_from_cl(&cl("other", None), "p", &config());
        assert_eq!(foreign.status, PclStatus::Unwatched);
        assert!(foreign.trigger.is_none());
    }

    #[test]
    fn missing_snapshot_is_unknown_and_deleted_wins() {
        let mut c = cl("p", Some(ApplicableConfig::single("p", &["main"])));
        c.deleted = true;
        assert_eq!(pcl_from_cl(&c, "p", &config()).status, PclStatus::Deleted);
        c.snapshot = None;
        assert_eq!(pcl_from_cl(&c, "p", &config()).status, PclStatus::Unknown);
    }
}
