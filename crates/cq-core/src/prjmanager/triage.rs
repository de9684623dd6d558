//! Dependency triage of one component.
//!
//! [`triage`] is a pure function of the component and the PCLs, purging
//! entries and config groups the [`TriageSupporter`] exposes. It can be
//! called any number of times; it never changes its inputs.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::changelist::Dep;
use crate::config::ConfigGroup;
use crate::ids::ClId;
use crate::prjmanager::pcl::{Component, Pcl, PclStatus, PurgeReason, PurgingCl};

/// Read access to the project state triage needs.
pub trait TriageSupporter {
    fn pcl(&self, clid: ClId) -> Option<&Pcl>;
    fn purging_cl(&self, clid: ClId) -> Option<&PurgingCl>;
    fn config_group(&self, index: usize) -> Option<&ConfigGroup>;
}

/// A CL's dependencies, each in exactly one bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriagedDeps {
    /// Latest trigger among loaded dependencies.
    pub last_triggered: Option<DateTime<Utc>>,
    pub not_yet_loaded: Vec<Dep>,
    pub submitted: Vec<Dep>,
    pub ok: Vec<Dep>,
    pub incompat_mode: Vec<Dep>,
}

impl TriagedDeps {
    pub fn has_incompatible(&self) -> bool {
        !self.incompat_mode.is_empty()
    }

    fn note_trigger(&mut self, dep: &Pcl) {
        if let Some(t) = &dep.trigger {
            if self.last_triggered.map_or(true, |lt| lt < t.time) {
                self.last_triggered = Some(t.time);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClTriage {
    pub clid: ClId,
    pub ready: bool,
    /// Computed only for CLs with status OK and one config group.
    pub deps: Option<TriagedDeps>,
    pub purge_reasons: Vec<PurgeReason>,
    pub purging: bool,
    /// Indexes into the component's `pruns`.
    pub run_indexes: Vec<usize>,
}

impl ClTriage {
    fn new(clid: ClId) -> Self {
        Self {
            clid,
            ready: false,
            deps: None,
            purge_reasons: Vec::new(),
            purging: false,
            run_indexes: Vec::new(),
        }
    }

    pub fn in_run(&self) -> bool {
        !self.run_indexes.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriageResult {
    pub cls: BTreeMap<ClId, ClTriage>,
    /// Dependency → ready CLs depending on it, sorted.
    pub reverse_deps: BTreeMap<ClId, Vec<ClId>>,
    /// CLs with purge reasons, sorted.
    pub to_purge: Vec<ClId>,
}

impl TriageResult {
    pub fn get(&self, clid: ClId) -> Option<&ClTriage> {
        self.cls.get(&clid)
    }

    pub fn is_ready(&self, clid: ClId) -> bool {
        self.cls.get(&clid).is_some_and(|c| c.ready)
    }

    pub fn ready(&self) -> impl Iterator<Item = ClId> + '_ {
        self.cls.values().filter(|c| c.ready).map(|c| c.clid)
    }
}

/// Triage every CL of `component`.
pub fn triage(component: &Component, supporter: &dyn TriageSupporter) -> TriageResult {
    let mut result = TriageResult::default();
    for &clid in &component.clids {
        let mut t = ClTriage::new(clid);
        t.run_indexes = component.run_indexes(clid);
        t.purging = supporter.purging_cl(clid).is_some();
        if let Some(pcl) = supporter.pcl(clid) {
            triage_cl(&mut t, pcl, supporter);
        }
        result.cls.insert(clid, t);
    }

    for t in result.cls.values() {
        if !t.purge_reasons.is_empty() {
            result.to_purge.push(t.clid);
        }
        if !t.ready {
            continue;
        }
        let Some(deps) = &t.deps else { continue };
        for dep in deps.ok.iter().chain(&deps.not_yet_loaded) {
            result.reverse_deps.entry(dep.clid).or_default().push(t.clid);
        }
    }
    for dependents in result.reverse_deps.values_mut() {
        dependents.sort();
        dependents.dedup();
    }
    result
}

fn triage_cl(t: &mut ClTriage, pcl: &Pcl, supporter: &dyn TriageSupporter) {
    let may_purge = pcl.trigger.is_some() && !t.in_run() && !t.purging;
    match pcl.status {
        PclStatus::Ok => {}
        PclStatus::Unwatched => {
            if may_purge {
                t.purge_reasons.push(PurgeReason::Unwatched);
            }
            return;
        }
        PclStatus::Unknown | PclStatus::Deleted => return,
    }

    let cg = match pcl.config_group_indexes.as_slice() {
        [] => return,
        [cg] => *cg,
        many => {
            if may_purge {
                let groups = many
                    .iter()
                    .map(|&i| {
                        supporter
                            .config_group(i)
                            .map_or_else(|| format!("#{i}"), |g| g.name.clone())
                    })
                    .collect();
                t.purge_reasons
                    .push(PurgeReason::WatchedByManyConfigGroups { groups });
            }
            return;
        }
    };

    let deps = triage_deps(pcl, cg, supporter);
    let incompatible = deps.has_incompatible();
    let incompat_ids: Vec<ClId> = deps.incompat_mode.iter().map(|d| d.clid).collect();
    t.deps = Some(deps);

    if t.purging || pcl.trigger.is_none() || pcl.submitted {
        return;
    }
    if incompatible {
        if !t.in_run() {
            t.purge_reasons
                .push(PurgeReason::IncompatibleDeps { deps: incompat_ids });
        }
        return;
    }
    t.ready = true;
}

fn triage_deps(pcl: &Pcl, cg: usize, supporter: &dyn TriageSupporter) -> TriagedDeps {
    let mut out = TriagedDeps::default();
    let combinable = supporter
        .config_group(cg)
        .is_some_and(ConfigGroup::is_combinable);
    for dep in &pcl.deps {
        let Some(dpcl) = supporter.pcl(dep.clid) else {
            out.not_yet_loaded.push(*dep);
            continue;
        };
        out.note_trigger(dpcl);
        let bucket = match dpcl.status {
            PclStatus::Unknown => &mut out.not_yet_loaded,
            PclStatus::Unwatched | PclStatus::Deleted => &mut out.incompat_mode,
            PclStatus::Ok if dpcl.submitted => &mut out.submitted,
            PclStatus::Ok if dpcl.config_group_indexes != [cg] => &mut out.incompat_mode,
            PclStatus::Ok if combinable => match (pcl.mode(), dpcl.mode()) {
                (Some(a), Some(b)) if a == b => &mut out.ok,
                _ => &mut out.incompat_mode,
            },
            // Singular groups: a dry run may include unsubmitted deps, a
            // full run needs them submitted first.
            PclStatus::Ok => match pcl.mode() {
                Some(m) if !m.is_dry_run_class() => &mut out.incompat_mode,
                _ => &mut out.ok,
            },
        };
        bucket.push(*dep);
    }
    out
}
