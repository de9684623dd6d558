//! Turning triaged CLs into Run candidates.

use std::collections::{BTreeSet, VecDeque};

use chrono::{DateTime, Utc};

use crate::changelist::RunMode;
use crate::ids::ClId;
use crate::prjmanager::pcl::Component;
use crate::prjmanager::triage::{TriageResult, TriageSupporter};

/// A set of CLs to be verified as one new Run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunCandidate {
    pub config_group_index: usize,
    pub mode: RunMode,
    /// Sorted.
    pub clids: Vec<ClId>,
    /// Latest trigger among `clids`.
    pub trigger_time: DateTime<Utc>,
    /// CL versions the decision was based on.
    pub cl_eversions: Vec<(ClId, i64)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Formation {
    pub candidates: Vec<RunCandidate>,
    /// Earliest time a waiting group may become a candidate.
    pub next_eval: Option<DateTime<Utc>>,
}

impl Formation {
    fn wake_at(&mut self, at: DateTime<Utc>) {
        if self.next_eval.map_or(true, |n| at < n) {
            self.next_eval = Some(at);
        }
    }
}

/// Form new Runs from the ready CLs of `component`.
///
/// CLs of singular config groups each get their own Run. CLs of a
/// combinable group form one Run with every ready CL reachable through
/// compatible dependencies, once the group is stable: nothing in it is
/// running, no dependency is still loading, and the stabilization delay
/// after the latest trigger has passed.
pub fn form_runs(
    component: &Component,
    triage: &TriageResult,
    supporter: &dyn TriageSupporter,
    now: DateTime<Utc>,
) -> Formation {
    let mut formation = Formation::default();
    let mut visited: BTreeSet<ClId> = BTreeSet::new();

    for &clid in &component.clids {
        if visited.contains(&clid) || !triage.is_ready(clid) {
            continue;
        }
        let Some(pcl) = supporter.pcl(clid) else { continue };
        let (Some(trigger), [cg]) = (&pcl.trigger, pcl.config_group_indexes.as_slice()) else {
            continue;
        };
        let Some(group) = supporter.config_group(*cg) else { continue };

        let Some(combine) = &group.combine_cls else {
            visited.insert(clid);
            if triage.get(clid).is_some_and(|t| t.in_run()) {
                continue;
            }
            formation.candidates.push(RunCandidate {
                config_group_index: *cg,
                mode: trigger.mode,
                clids: vec![clid],
                trigger_time: trigger.time,
                cl_eversions: vec![(clid, pcl.eversion)],
            });
            continue;
        };

        let (members, blocked) = collect_group(clid, triage, &mut visited);
        if blocked {
            continue;
        }
        let mut latest = trigger.time;
        let mut cl_eversions = Vec::with_capacity(members.len());
        for &m in &members {
            if let Some(p) = supporter.pcl(m) {
                if let Some(t) = &p.trigger {
                    latest = latest.max(t.time);
                }
                cl_eversions.push((m, p.eversion));
            }
        }
        let stable_at = latest + combine.stabilization_delay();
        if now < stable_at {
            formation.wake_at(stable_at);
            continue;
        }
        formation.candidates.push(RunCandidate {
            config_group_index: *cg,
            mode: trigger.mode,
            clids: members.into_iter().collect(),
            trigger_time: latest,
            cl_eversions,
        });
    }
    formation
}

/// Walk compatible dependencies and dependents from `start`.
///
/// Returns the members and whether the group must wait.
fn collect_group(
    start: ClId,
    triage: &TriageResult,
    visited: &mut BTreeSet<ClId>,
) -> (BTreeSet<ClId>, bool) {
    let mut members = BTreeSet::new();
    let mut blocked = false;
    let mut queue = VecDeque::from([start]);
    while let Some(clid) = queue.pop_front() {
        if !members.insert(clid) {
            continue;
        }
        visited.insert(clid);
        let Some(t) = triage.get(clid) else {
            blocked = true;
            continue;
        };
        if !t.ready || t.in_run() {
            blocked = true;
        }
        if let Some(deps) = &t.deps {
            if !deps.not_yet_loaded.is_empty() {
                blocked = true;
            }
            queue.extend(deps.ok.iter().map(|d| d.clid));
        }
        if let Some(dependents) = triage.reverse_deps.get(&clid) {
            queue.extend(dependents.iter().copied());
        }
    }
    (members, blocked)
}
