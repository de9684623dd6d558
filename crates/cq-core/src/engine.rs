//! Wires the managers, the task dispatcher and periodic resync together.

use std::sync::Arc;

use cq_state::Datastore;
use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::changelist::Mutator;
use crate::config::ConfigProvider;
use crate::error::CqResult;
use crate::metrics::METRICS;
use crate::prjmanager::{ClPurger, MutatorPurger, ProjectManager};
use crate::run::{RunCreator, RunManager, RunSettings, Submitter};
use crate::tasks::{TaskDispatcher, MAX_LANES};
use crate::tree::TreeClient;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub run: RunSettings,
    /// Upper bound on the wait between dispatch passes.
    pub dispatch_tick: std::time::Duration,
    /// How often every configured project is poked regardless of events.
    pub resync_interval: std::time::Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            run: RunSettings::default(),
            dispatch_tick: std::time::Duration::from_millis(500),
            resync_interval: std::time::Duration::from_secs(60),
        }
    }
}

#[derive(Clone)]
pub struct Engine {
    store: Datastore,
    configs: Arc<dyn ConfigProvider>,
    mutator: Mutator,
    projects: ProjectManager,
    runs: RunManager,
    dispatcher: TaskDispatcher,
    settings: EngineSettings,
}

impl Engine {
    pub fn new(
        store: Datastore,
        configs: Arc<dyn ConfigProvider>,
        tree: Arc<dyn TreeClient>,
        submitter: Arc<dyn Submitter>,
        settings: EngineSettings,
    ) -> Self {
        let mutator = Mutator::new(store.clone());
        let purger: Arc<dyn ClPurger> = Arc::new(MutatorPurger::new(mutator.clone()));
        Self::assemble(store, mutator, configs, tree, submitter, purger, settings)
    }

    /// Like [`Engine::new`] with a caller-supplied trigger remover.
    pub fn with_purger(
        store: Datastore,
        configs: Arc<dyn ConfigProvider>,
        tree: Arc<dyn TreeClient>,
        submitter: Arc<dyn Submitter>,
        purger: Arc<dyn ClPurger>,
        settings: EngineSettings,
    ) -> Self {
        let mutator = Mutator::new(store.clone());
        Self::assemble(store, mutator, configs, tree, submitter, purger, settings)
    }

    fn assemble(
        store: Datastore,
        mutator: Mutator,
        configs: Arc<dyn ConfigProvider>,
        tree: Arc<dyn TreeClient>,
        submitter: Arc<dyn Submitter>,
        purger: Arc<dyn ClPurger>,
        settings: EngineSettings,
    ) -> Self {
        let creator = RunCreator::new(store.clone(), mutator.clone());
        let projects = ProjectManager::new(store.clone(), configs.clone(), purger, creator);
        let runs = RunManager::new(
            store.clone(),
            mutator.clone(),
            configs.clone(),
            tree,
            submitter,
            settings.run.clone(),
        );
        let dispatcher = TaskDispatcher::new(
            store.clone(),
            Arc::new(projects.clone()),
            Arc::new(runs.clone()),
        );
        Self {
            store,
            configs,
            mutator,
            projects,
            runs,
            dispatcher,
            settings,
        }
    }

    pub fn store(&self) -> &Datastore {
        &self.store
    }

    pub fn mutator(&self) -> &Mutator {
        &self.mutator
    }

    pub fn projects(&self) -> &ProjectManager {
        &self.projects
    }

    pub fn runs(&self) -> &RunManager {
        &self.runs
    }

    pub fn dispatcher(&self) -> &TaskDispatcher {
        &self.dispatcher
    }

    /// Poke every configured project once, up to [`MAX_LANES`] at a time.
    #[instrument(skip(self))]
    pub async fn resync(&self) -> CqResult<()> {
        let projects = self.configs.projects().await?;
        stream::iter(projects)
            .for_each_concurrent(MAX_LANES, |project| async move {
                if let Err(e) = self.projects.poke(&project).await {
                    warn!(project = %project, error = %e, "project resync failed");
                }
            })
            .await;
        Ok(())
    }

    /// Dispatch tasks until idle: nothing due is left after a pass.
    ///
    /// Delayed tasks stay in the outbox. Returns the number of tasks
    /// delivered.
    pub async fn drain(&self) -> CqResult<usize> {
        let mut total = 0;
        loop {
            let stats = self.dispatcher.dispatch_due().await?;
            total += stats.delivered;
            if stats.delivered == 0 {
                return Ok(total);
            }
        }
    }

    /// Run the dispatcher and the resync loop until `shutdown` turns true.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        info!(
            resync_secs = self.settings.resync_interval.as_secs(),
            "commit queue engine started"
        );
        let dispatch = self
            .dispatcher
            .run_until(self.settings.dispatch_tick, shutdown.clone());
        let resync = async {
            let mut shutdown = shutdown.clone();
            let mut ticker = tokio::time::interval(self.settings.resync_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.resync().await {
                            warn!(error = %e, "resync failed");
                        }
                        METRICS.flush();
                    }
                    res = shutdown.changed() => {
                        if res.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        };
        tokio::join!(dispatch, resync);
        info!("commit queue engine stopped");
    }
}
