//! The per-project orchestration loop.
//!
//! Every event the loop receives means "something changed": the loop
//! re-reads the project's CLs and Runs from the store, triages each
//! component, purges CLs that cannot proceed and creates Runs for the ready
//! ones. It keeps no state in memory between pokes.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use cq_state::{conflict_backoff, Datastore, Entity, MAX_TXN_ATTEMPTS};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::changelist::Cl;
use crate::config::{ConfigGroup, ConfigProvider};
use crate::error::{CqError, CqResult};
use crate::ids::{ClId, RunId};
use crate::metrics::METRICS;
use crate::obs;
use crate::prjmanager::components::PclArena;
use crate::prjmanager::pcl::{pcl_from_cl, Component, PRun, Pcl, PurgingCl};
use crate::prjmanager::purge::ClPurger;
use crate::prjmanager::runforming::form_runs;
use crate::prjmanager::triage::{triage, TriageSupporter};
use crate::run::{submit_queue, Run, RunCreator};
use crate::tasks::{ClUpdatedEvent, ProjectEventSink, Task};

/// How long a purge is remembered while the CL still shows its trigger.
pub const PURGE_DEADLINE_SECS: i64 = 10 * 60;

/// Re-poke delay after a Run could not be created.
const RETRY_DELAY_SECS: i64 = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProjectEvent {
    Poke,
    ClsUpdated { events: Vec<ClUpdatedEvent> },
    RunFinished { run_id: RunId },
}

/// What the loop last computed for a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectState {
    pub project: String,
    /// Incremented on every save.
    pub eversion: i64,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub pcls: Vec<Pcl>,
    #[serde(default)]
    pub components: Vec<Component>,
    #[serde(default)]
    pub purging: Vec<PurgingCl>,
    #[serde(default)]
    pub next_eval: Option<DateTime<Utc>>,
    /// ETA of the delayed poke already in the outbox.
    #[serde(default)]
    pub scheduled_poke: Option<DateTime<Utc>>,
}

impl Entity for ProjectState {
    const KIND: &'static str = "project_state";

    fn entity_key(&self) -> String {
        self.project.clone()
    }
}

/// Outcome of one [`ProjectManager::poke`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PokeReport {
    pub cls: usize,
    pub components: usize,
    pub runs_created: Vec<RunId>,
    pub purged: Vec<ClId>,
    pub next_eval: Option<DateTime<Utc>>,
}

struct StateSupporter<'a> {
    arena: &'a PclArena,
    purging: &'a HashMap<ClId, PurgingCl>,
    groups: &'a [ConfigGroup],
}

impl TriageSupporter for StateSupporter<'_> {
    fn pcl(&self, clid: ClId) -> Option<&Pcl> {
        self.arena.get(clid)
    }

    fn purging_cl(&self, clid: ClId) -> Option<&PurgingCl> {
        self.purging.get(&clid)
    }

    fn config_group(&self, index: usize) -> Option<&ConfigGroup> {
        self.groups.get(index)
    }
}

#[derive(Clone)]
pub struct ProjectManager {
    store: Datastore,
    configs: Arc<dyn ConfigProvider>,
    purger: Arc<dyn ClPurger>,
    creator: RunCreator,
}

impl ProjectManager {
    pub fn new(
        store: Datastore,
        configs: Arc<dyn ConfigProvider>,
        purger: Arc<dyn ClPurger>,
        creator: RunCreator,
    ) -> Self {
        Self {
            store,
            configs,
            purger,
            creator,
        }
    }

    pub async fn handle(&self, project: &str, event: ProjectEvent) -> CqResult<()> {
        debug!(project = %project, event = ?event, "project event");
        self.poke(project).await.map(|_| ())
    }

    pub async fn load_state(&self, project: &str) -> CqResult<Option<ProjectState>> {
        Ok(self.store.get::<ProjectState>(project).await?)
    }

    /// Re-derive the project's state and act on it.
    #[instrument(skip(self), fields(project = %project))]
    pub async fn poke(&self, project: &str) -> CqResult<PokeReport> {
        let Some(config) = self.configs.project_config(project).await? else {
            debug!("project not configured; nothing to do");
            return Ok(PokeReport::default());
        };
        let now = self.store.now();

        let cls = self.load_cls(project).await?;
        let arena = PclArena::new(cls.values().map(|cl| pcl_from_cl(cl, project, &config)));
        let pruns = self.load_pruns(project, &cls).await?;

        let prior = self.load_state(project).await?;
        let mut purging: HashMap<ClId, PurgingCl> = prior
            .map(|s| s.purging)
            .unwrap_or_default()
            .into_iter()
            .filter(|p| {
                p.deadline > now && arena.get(p.clid).is_some_and(|pcl| pcl.trigger.is_some())
            })
            .map(|p| (p.clid, p))
            .collect();

        let components = arena.components(&pruns);
        let mut report = PokeReport {
            cls: arena.len(),
            components: components.len(),
            ..PokeReport::default()
        };

        for component in &components {
            let (result, formation) = {
                let supporter = StateSupporter {
                    arena: &arena,
                    purging: &purging,
                    groups: &config.config_groups,
                };
                let result = triage(component, &supporter);
                let formation = form_runs(component, &result, &supporter, now);
                (result, formation)
            };
            METRICS.inc_triage_passes();
            obs::emit_triage_completed(
                project,
                component.clids.len(),
                result.ready().count(),
                result.to_purge.len(),
            );

            for clid in &result.to_purge {
                let Some(t) = result.get(*clid) else { continue };
                match self.purger.purge(project, *clid, &t.purge_reasons).await {
                    Ok(()) => {
                        purging.insert(
                            *clid,
                            PurgingCl {
                                clid: *clid,
                                deadline: now + Duration::seconds(PURGE_DEADLINE_SECS),
                                reasons: t.purge_reasons.clone(),
                            },
                        );
                        report.purged.push(*clid);
                    }
                    Err(e) => warn!(clid = %clid, error = %e, "purge failed"),
                }
            }

            for candidate in &formation.candidates {
                match self.creator.create(project, candidate, &config).await {
                    Ok(Some(run)) => report.runs_created.push(run.id),
                    Ok(None) => {}
                    Err(e) if e.is_transient() => {
                        warn!(error = %e, "run creation failed; will retry");
                        let retry_at = now + Duration::seconds(RETRY_DELAY_SECS);
                        merge_eval(&mut report.next_eval, retry_at);
                    }
                    Err(e) => return Err(e),
                }
            }
            if let Some(at) = formation.next_eval {
                merge_eval(&mut report.next_eval, at);
            }
        }

        self.save_state(project, arena, components, purging, report.next_eval)
            .await?;
        Ok(report)
    }

    /// All CLs the project watches or fetched, plus their direct deps.
    async fn load_cls(&self, project: &str) -> CqResult<BTreeMap<ClId, Cl>> {
        let mut cls: BTreeMap<ClId, Cl> = self
            .store
            .list::<Cl>()
            .await?
            .into_iter()
            .filter(|cl| belongs_to(cl, project))
            .map(|cl| (cl.id, cl))
            .collect();
        let missing: BTreeSet<ClId> = cls
            .values()
            .filter_map(|cl| cl.snapshot.as_ref())
            .flat_map(|s| s.deps.iter().map(|d| d.clid))
            .filter(|id| !cls.contains_key(id))
            .collect();
        for id in missing {
            if let Some(cl) = self.store.get::<Cl>(&id.to_string()).await? {
                cls.insert(id, cl);
            }
        }
        Ok(cls)
    }

    async fn load_pruns(&self, project: &str, cls: &BTreeMap<ClId, Cl>) -> CqResult<Vec<PRun>> {
        let run_ids: BTreeSet<&RunId> = cls
            .values()
            .filter(|cl| belongs_to(cl, project))
            .flat_map(|cl| cl.incomplete_runs.iter())
            .collect();
        let mut pruns = Vec::with_capacity(run_ids.len());
        for id in run_ids {
            match self.store.get::<Run>(id.as_str()).await? {
                Some(run) if run.project == project && !run.status.is_ended() => {
                    let mut clids = run.cls.clone();
                    clids.sort();
                    pruns.push(PRun {
                        id: run.id,
                        mode: run.mode,
                        clids,
                    });
                }
                Some(_) => {}
                None => warn!(run_id = %id, "CL references a missing run"),
            }
        }
        Ok(pruns)
    }

    async fn save_state(
        &self,
        project: &str,
        arena: PclArena,
        components: Vec<Component>,
        purging: HashMap<ClId, PurgingCl>,
        next_eval: Option<DateTime<Utc>>,
    ) -> CqResult<()> {
        let mut purging: Vec<PurgingCl> = purging.into_values().collect();
        purging.sort_by_key(|p| p.clid);
        let pcls: Vec<Pcl> = arena.iter().cloned().collect();

        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut txn = self.store.begin();
            let now = txn.now();
            let prior = txn.get::<ProjectState>(project).await?;
            let mut scheduled_poke = prior
                .as_ref()
                .and_then(|s| s.scheduled_poke)
                .filter(|at| *at > now);
            if let Some(at) = next_eval {
                if scheduled_poke != Some(at) {
                    txn.enqueue(
                        Some(at),
                        &Task::Project {
                            project: project.to_string(),
                            event: ProjectEvent::Poke,
                        },
                    )?;
                    scheduled_poke = Some(at);
                }
            }
            submit_queue::release_expired(&mut txn, project).await?;
            txn.put(&ProjectState {
                project: project.to_string(),
                eversion: prior.map_or(0, |s| s.eversion) + 1,
                updated_at: now,
                pcls: pcls.clone(),
                components: components.clone(),
                purging: purging.clone(),
                next_eval,
                scheduled_poke,
            })?;
            match txn.commit().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_conflict() && attempt < MAX_TXN_ATTEMPTS => {
                    debug!(attempt, error = %e, "project state save conflicted, retrying");
                    conflict_backoff(attempt).await;
                }
                Err(e) => return Err(CqError::from(e)),
            }
        }
    }
}

fn belongs_to(cl: &Cl, project: &str) -> bool {
    cl.snapshot.as_ref().is_some_and(|s| s.project == project)
        || cl
            .applicable_config
            .as_ref()
            .is_some_and(|ac| ac.for_project(project).is_some())
}

fn merge_eval(slot: &mut Option<DateTime<Utc>>, at: DateTime<Utc>) {
    if slot.map_or(true, |cur| at < cur) {
        *slot = Some(at);
    }
}

#[async_trait]
impl ProjectEventSink for ProjectManager {
    async fn notify_project(&self, project: &str, event: ProjectEvent) -> CqResult<()> {
        self.handle(project, event).await
    }
}
