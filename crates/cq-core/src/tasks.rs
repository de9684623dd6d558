//! Outbox task payloads and their dispatcher.
//!
//! Transactions record [`Task`]s with `Transaction::enqueue`. The
//! [`TaskDispatcher`] later reads due rows, fans each task out to the
//! registered sinks (at most [`MAX_FANOUT`] deliveries in flight) and deletes
//! the row once every delivery succeeded. Rows for different receivers are
//! dispatched concurrently. A failed delivery leaves the row in
//! place, so receivers can see the same notification more than once.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cq_state::{Datastore, OutboxRecord};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

use crate::error::{CqError, CqResult};
use crate::ids::{ClId, RunId};
use crate::metrics::METRICS;
use crate::prjmanager::ProjectEvent;
use crate::run::RunEvent;

/// Upper bound on concurrent deliveries for one task.
pub const MAX_FANOUT: usize = 16;

/// Upper bound on delivery lanes served concurrently in one pass.
pub const MAX_LANES: usize = 32;

/// "CL `clid` now has version `eversion`."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClUpdatedEvent {
    pub clid: ClId,
    pub eversion: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum Task {
    /// One CL changed.
    ClUpdated {
        projects: Vec<String>,
        runs: Vec<RunId>,
        event: ClUpdatedEvent,
    },
    /// Many CLs changed in one transaction.
    BatchClUpdated {
        projects: BTreeMap<String, Vec<ClUpdatedEvent>>,
        runs: BTreeMap<RunId, Vec<ClUpdatedEvent>>,
    },
    Project {
        project: String,
        event: ProjectEvent,
    },
    Run {
        run_id: RunId,
        event: RunEvent,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum Delivery {
    Project { project: String, event: ProjectEvent },
    Run { run_id: RunId, event: RunEvent },
}

impl Task {
    /// Key of the first receiver; tasks sharing it are delivered in order.
    fn lane(&self) -> String {
        match self {
            Task::ClUpdated { projects, runs, .. } => projects
                .first()
                .map(|p| format!("project:{p}"))
                .or_else(|| runs.first().map(|r| format!("run:{r}")))
                .unwrap_or_default(),
            Task::BatchClUpdated { projects, runs } => projects
                .keys()
                .next()
                .map(|p| format!("project:{p}"))
                .or_else(|| runs.keys().next().map(|r| format!("run:{r}")))
                .unwrap_or_default(),
            Task::Project { project, .. } => format!("project:{project}"),
            Task::Run { run_id, .. } => format!("run:{run_id}"),
        }
    }

    fn into_deliveries(self) -> Vec<Delivery> {
        match self {
            Task::ClUpdated {
                projects,
                runs,
                event,
            } => {
                let mut out: Vec<Delivery> = projects
                    .into_iter()
                    .map(|project| Delivery::Project {
                        project,
                        event: ProjectEvent::ClsUpdated {
                            events: vec![event],
                        },
                    })
                    .collect();
                out.extend(runs.into_iter().map(|run_id| Delivery::Run {
                    run_id,
                    event: RunEvent::ClUpdated {
                        clid: event.clid,
                        eversion: event.eversion,
                    },
                }));
                out
            }
            Task::BatchClUpdated { projects, runs } => {
                let mut out: Vec<Delivery> = projects
                    .into_iter()
                    .map(|(project, events)| Delivery::Project {
                        project,
                        event: ProjectEvent::ClsUpdated { events },
                    })
                    .collect();
                out.extend(runs.into_iter().map(|(run_id, events)| Delivery::Run {
                    run_id,
                    event: RunEvent::ClsUpdated { events },
                }));
                out
            }
            Task::Project { project, event } => vec![Delivery::Project { project, event }],
            Task::Run { run_id, event } => vec![Delivery::Run { run_id, event }],
        }
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Receives events addressed to a project's orchestration loop.
#[async_trait]
pub trait ProjectEventSink: Send + Sync {
    async fn notify_project(&self, project: &str, event: ProjectEvent) -> CqResult<()>;
}

/// Receives events addressed to a Run.
#[async_trait]
pub trait RunEventSink: Send + Sync {
    async fn notify_run(&self, run_id: &RunId, event: RunEvent) -> CqResult<()>;
}

/// Sink that records everything it receives (testing).
#[derive(Debug, Default)]
pub struct RecordingSink {
    projects: Mutex<Vec<(String, ProjectEvent)>>,
    runs: Mutex<Vec<(RunId, RunEvent)>>,
    failing_projects: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn project_events(&self) -> Vec<(String, ProjectEvent)> {
        self.projects.lock().unwrap().clone()
    }

    pub fn run_events(&self) -> Vec<(RunId, RunEvent)> {
        self.runs.lock().unwrap().clone()
    }

    /// Make deliveries to `project` fail until [`RecordingSink::heal`].
    pub fn fail_project(&self, project: &str) {
        self.failing_projects
            .lock()
            .unwrap()
            .push(project.to_string());
    }

    pub fn heal(&self) {
        self.failing_projects.lock().unwrap().clear();
    }

    pub fn clear(&self) {
        self.projects.lock().unwrap().clear();
        self.runs.lock().unwrap().clear();
    }
}

#[async_trait]
impl ProjectEventSink for RecordingSink {
    async fn notify_project(&self, project: &str, event: ProjectEvent) -> CqResult<()> {
        if self
            .failing_projects
            .lock()
            .unwrap()
            .iter()
            .any(|p| p == project)
        {
            return Err(CqError::Delivery {
                target: project.to_string(),
                message: "injected failure".to_string(),
            });
        }
        self.projects
            .lock()
            .unwrap()
            .push((project.to_string(), event));
        Ok(())
    }
}

#[async_trait]
impl RunEventSink for RecordingSink {
    async fn notify_run(&self, run_id: &RunId, event: RunEvent) -> CqResult<()> {
        self.runs.lock().unwrap().push((run_id.clone(), event));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct TaskDispatcher {
    store: Datastore,
    projects: Arc<dyn ProjectEventSink>,
    runs: Arc<dyn RunEventSink>,
}

impl TaskDispatcher {
    pub fn new(
        store: Datastore,
        projects: Arc<dyn ProjectEventSink>,
        runs: Arc<dyn RunEventSink>,
    ) -> Self {
        Self {
            store,
            projects,
            runs,
        }
    }

    /// Deliver every due outbox task once.
    ///
    /// Rows are grouped into lanes by their lead target. Lanes run
    /// concurrently (at most [`MAX_LANES`]); rows within a lane are delivered
    /// in outbox order and the lane stops at its first failure.
    #[instrument(skip(self))]
    pub async fn dispatch_due(&self) -> CqResult<DispatchStats> {
        let now = self.store.now();
        let mut lanes: BTreeMap<String, Vec<(u64, OutboxRecord, Task)>> = BTreeMap::new();
        for (rev, record) in self.store.due_outbox(now).await? {
            match serde_json::from_value::<Task>(record.task.clone()) {
                Ok(task) => lanes
                    .entry(task.lane())
                    .or_default()
                    .push((rev, record, task)),
                Err(e) => {
                    warn!(outbox_id = %record.id, error = %e, "dropping undecodable task");
                    self.store.ack_outbox(rev, &record).await?;
                }
            }
        }

        let results: Vec<CqResult<DispatchStats>> = stream::iter(lanes.into_values())
            .map(|rows| self.dispatch_lane(rows))
            .buffer_unordered(MAX_LANES)
            .collect()
            .await;
        let mut stats = DispatchStats::default();
        for lane in results {
            let lane = lane?;
            stats.delivered += lane.delivered;
            stats.failed += lane.failed;
        }
        if stats.delivered + stats.failed > 0 {
            debug!(delivered = stats.delivered, failed = stats.failed, "dispatch pass done");
        }
        Ok(stats)
    }

    async fn dispatch_lane(
        &self,
        rows: Vec<(u64, OutboxRecord, Task)>,
    ) -> CqResult<DispatchStats> {
        let mut stats = DispatchStats::default();
        for (rev, record, task) in rows {
            match self.deliver(task).await {
                Ok(()) => {
                    self.store.ack_outbox(rev, &record).await?;
                    METRICS.inc_tasks_delivered();
                    stats.delivered += 1;
                }
                Err(e) => {
                    warn!(outbox_id = %record.id, error = %e, "task delivery failed; will retry");
                    stats.failed += 1;
                    break;
                }
            }
        }
        Ok(stats)
    }

    async fn deliver(&self, task: Task) -> CqResult<()> {
        let deliveries = task.into_deliveries();
        let width = deliveries.len().clamp(1, MAX_FANOUT);
        let results: Vec<CqResult<()>> = stream::iter(deliveries)
            .map(|d| self.deliver_one(d))
            .buffer_unordered(width)
            .collect()
            .await;
        results.into_iter().collect()
    }

    async fn deliver_one(&self, delivery: Delivery) -> CqResult<()> {
        match delivery {
            Delivery::Project { project, event } => {
                self.projects.notify_project(&project, event).await
            }
            Delivery::Run { run_id, event } => self.runs.notify_run(&run_id, event).await,
        }
    }

    /// Dispatch until `shutdown` turns true.
    ///
    /// Passes run back to back while they deliver something, otherwise after
    /// the next commit or after `tick`, whichever comes first.
    pub async fn run_until(&self, tick: std::time::Duration, mut shutdown: watch::Receiver<bool>) {
        let committed = self.store.committed();
        loop {
            if *shutdown.borrow() {
                break;
            }
            let notified = committed.notified();
            match self.dispatch_due().await {
                Ok(stats) if stats.delivered > 0 => continue,
                Ok(_) => {}
                Err(e) => warn!(error = %e, "dispatch pass failed"),
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(tick) => {}
                res = shutdown.changed() => {
                    if res.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("task dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cq_state::TestClock;

    fn setup() -> (Datastore, Arc<RecordingSink>, TaskDispatcher) {
        let store = Datastore::in_memory(Arc::new(TestClock::new(Utc::now())));
        let sink = Arc::new(RecordingSink::new());
        let dispatcher = TaskDispatcher::new(store.clone(), sink.clone(), sink.clone());
        (store, sink, dispatcher)
    }

    #[tokio::test]
    async fn batch_task_fans_out_per_project_and_run() {
        let (store, sink, dispatcher) = setup();
        let run = RunId::from_raw("p/1-1-ab");
        let e1 = ClUpdatedEvent { clid: ClId(1), eversion: 2 };
        let e2 = ClUpdatedEvent { clid: ClId(2), eversion: 5 };
        let mut txn = store.begin();
        txn.enqueue(
            None,
            &Task::BatchClUpdated {
                projects: BTreeMap::from([("p".to_string(), vec![e1, e2])]),
                runs: BTreeMap::from([(run.clone(), vec![e1, e2])]),
            },
        )
        .unwrap();
        txn.commit().await.unwrap();

        let stats = dispatcher.dispatch_due().await.unwrap();
        assert_eq!(stats.delivered, 1);
        assert_eq!(
            sink.project_events(),
            vec![(
                "p".to_string(),
                ProjectEvent::ClsUpdated { events: vec![e1, e2] }
            )]
        );
        assert_eq!(
            sink.run_events(),
            vec![(run, RunEvent::ClsUpdated { events: vec![e1, e2] })]
        );

        // Acknowledged: nothing left.
        assert_eq!(dispatcher.dispatch_due().await.unwrap().delivered, 0);
    }

    #[tokio::test]
    async fn failed_delivery_is_retried() {
        let (store, sink, dispatcher) = setup();
        let mut txn = store.begin();
        txn.enqueue(
            None,
            &Task::Project {
                project: "p".to_string(),
                event: ProjectEvent::Poke,
            },
        )
        .unwrap();
        txn.commit().await.unwrap();

        sink.fail_project("p");
        let stats = dispatcher.dispatch_due().await.unwrap();
        assert_eq!(stats, DispatchStats { delivered: 0, failed: 1 });

        sink.heal();
        let stats = dispatcher.dispatch_due().await.unwrap();
        assert_eq!(stats.delivered, 1);
        assert_eq!(sink.project_events(), vec![("p".to_string(), ProjectEvent::Poke)]);
    }

    /// Holds project "a" until project "b" has been delivered.
    struct Rendezvous {
        b_delivered: tokio::sync::Notify,
        inner: RecordingSink,
    }

    #[async_trait]
    impl ProjectEventSink for Rendezvous {
        async fn notify_project(&self, project: &str, event: ProjectEvent) -> CqResult<()> {
            if project == "a" {
                let waited = tokio::time::timeout(
                    std::time::Duration::from_secs(5),
                    self.b_delivered.notified(),
                )
                .await;
                if waited.is_err() {
                    return Err(CqError::Delivery {
                        target: project.to_string(),
                        message: "b never arrived".to_string(),
                    });
                }
            }
            self.inner.notify_project(project, event).await?;
            if project == "b" {
                self.b_delivered.notify_one();
            }
            Ok(())
        }
    }

    #[async_trait]
    impl RunEventSink for Rendezvous {
        async fn notify_run(&self, run_id: &RunId, event: RunEvent) -> CqResult<()> {
            self.inner.notify_run(run_id, event).await
        }
    }

    #[tokio::test]
    async fn slow_receiver_does_not_hold_up_others() {
        let store = Datastore::in_memory(Arc::new(TestClock::new(Utc::now())));
        let sink = Arc::new(Rendezvous {
            b_delivered: tokio::sync::Notify::new(),
            inner: RecordingSink::new(),
        });
        let dispatcher = TaskDispatcher::new(store.clone(), sink.clone(), sink.clone());
        let mut txn = store.begin();
        for project in ["a", "b"] {
            txn.enqueue(
                None,
                &Task::Project {
                    project: project.to_string(),
                    event: ProjectEvent::Poke,
                },
            )
            .unwrap();
        }
        txn.commit().await.unwrap();

        let stats = dispatcher.dispatch_due().await.unwrap();
        assert_eq!(stats, DispatchStats { delivered: 2, failed: 0 });
        assert_eq!(
            sink.inner.project_events(),
            vec![
                ("b".to_string(), ProjectEvent::Poke),
                ("a".to_string(), ProjectEvent::Poke),
            ]
        );
    }

    #[tokio::test]
    async fn same_receiver_keeps_outbox_order() {
        let clock = Arc::new(TestClock::new(Utc::now()));
        let store = Datastore::in_memory(clock.clone());
        let sink = Arc::new(RecordingSink::new());
        let dispatcher = TaskDispatcher::new(store.clone(), sink.clone(), sink.clone());
        let run = RunId::from_raw("p/1-1-ab");
        for clid in [ClId(1), ClId(2), ClId(3)] {
            let mut txn = store.begin();
            txn.enqueue(
                None,
                &Task::Run {
                    run_id: run.clone(),
                    event: RunEvent::ClUpdated { clid, eversion: 1 },
                },
            )
            .unwrap();
            txn.commit().await.unwrap();
            clock.advance(chrono::Duration::milliseconds(1));
        }

        assert_eq!(dispatcher.dispatch_due().await.unwrap().delivered, 3);
        let clids: Vec<ClId> = sink
            .run_events()
            .into_iter()
            .filter_map(|(_, e)| match e {
                RunEvent::ClUpdated { clid, .. } => Some(clid),
                _ => None,
            })
            .collect();
        assert_eq!(clids, vec![ClId(1), ClId(2), ClId(3)]);
    }

    #[test]
    fn task_json_round_trips_run_keys() {
        let run = RunId::from_raw("p/9-1-ff");
        let task = Task::BatchClUpdated {
            projects: BTreeMap::new(),
            runs: BTreeMap::from([(run, vec![ClUpdatedEvent { clid: ClId(3), eversion: 1 }])]),
        };
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["task"], "batch_cl_updated");
        let back: Task = serde_json::from_value(json).unwrap();
        assert_eq!(back, task);
    }
}
