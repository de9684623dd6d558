use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use cq_core::{
    ApplicableConfig, Cl, ClId, ConfigGroup, Datastore, Dep, Engine, EngineSettings, ExternalId,
    ManualTree, MutateOutcome, OfflineSubmitter, ProjectConfig, RecordingPurger, Run, RunEvent,
    RunMode, RunStatus, Snapshot, StaticConfigProvider, TestClock, Trigger,
};
use tokio::sync::watch;

fn engine(configs: Vec<ProjectConfig>) -> (Arc<TestClock>, Engine) {
    let clock = Arc::new(TestClock::new(
        Utc.with_ymd_and_hms(2026, 9, 14, 10, 0, 0).unwrap(),
    ));
    let store = Datastore::in_memory(clock.clone());
    let engine = Engine::new(
        store.clone(),
        Arc::new(StaticConfigProvider::new(configs)),
        Arc::new(ManualTree::new()),
        Arc::new(OfflineSubmitter::new(store)),
        EngineSettings::default(),
    );
    (clock, engine)
}

async fn trigger_cl(
    engine: &Engine,
    project: &str,
    change: i64,
    groups: &[&str],
    deps: &[ClId],
    mode: RunMode,
) -> Cl {
    let now = engine.store().now();
    engine
        .mutator()
        .upsert(
            project,
            &ExternalId::gerrit("review.example.com", change),
            |cl| {
                cl.snapshot = Some(Snapshot {
                    project: project.to_string(),
                    external_update_time: now,
                    patchset: 1,
                    owner: "dev@example.com".to_string(),
                    trigger: Some(Trigger {
                        mode,
                        time: now,
                        email: "dev@example.com".to_string(),
                    }),
                    deps: deps.iter().map(|id| Dep::hard(id.0)).collect(),
                    submitted: false,
                    files: vec!["BUILD.gn".to_string()],
                });
                cl.applicable_config = Some(ApplicableConfig::single(project, groups));
                MutateOutcome::Mutate
            },
        )
        .await
        .unwrap()
        .unwrap()
}

async fn reload(engine: &Engine, id: ClId) -> Cl {
    engine
        .store()
        .get::<Cl>(&id.to_string())
        .await
        .unwrap()
        .unwrap()
}

async fn only_run(engine: &Engine, cl: ClId) -> Run {
    let cl = reload(engine, cl).await;
    assert_eq!(cl.incomplete_runs.len(), 1, "CL {} runs", cl.id);
    engine.runs().load(&cl.incomplete_runs[0]).await.unwrap().unwrap()
}

#[tokio::test]
async fn full_run_lands_end_to_end() {
    cq_core::init_tracing(false, tracing::Level::DEBUG);
    let (_clock, engine) = engine(vec![ProjectConfig::new(
        "chromium",
        vec![ConfigGroup::singular("main")],
    )]);
    let cl = trigger_cl(&engine, "chromium", 1, &["main"], &[], RunMode::FullRun).await;

    assert!(engine.drain().await.unwrap() > 0);
    let run = only_run(&engine, cl.id).await;
    assert_eq!(run.status, RunStatus::Running);

    engine
        .runs()
        .handle(&run.id, RunEvent::VerificationCompleted { passed: true })
        .await
        .unwrap();
    engine.drain().await.unwrap();

    let run = engine.runs().load(&run.id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
    let cl = reload(&engine, cl.id).await;
    assert!(cl.incomplete_runs.is_empty());
    assert!(cl.snapshot.unwrap().submitted);

    // A submitted CL is never picked up again.
    engine.resync().await.unwrap();
    engine.drain().await.unwrap();
    assert!(reload(&engine, cl.id).await.incomplete_runs.is_empty());
}

#[tokio::test]
async fn failed_dry_run_frees_cl_for_a_new_trigger() {
    let (clock, engine) = engine(vec![ProjectConfig::new(
        "chromium",
        vec![ConfigGroup::singular("main")],
    )]);
    let cl = trigger_cl(&engine, "chromium", 2, &["main"], &[], RunMode::DryRun).await;
    engine.drain().await.unwrap();
    let first = only_run(&engine, cl.id).await;

    engine
        .runs()
        .handle(&first.id, RunEvent::VerificationCompleted { passed: false })
        .await
        .unwrap();
    engine.drain().await.unwrap();
    assert!(reload(&engine, cl.id).await.incomplete_runs.is_empty());

    // Re-voting gives a new trigger time and so a new Run.
    clock.advance(Duration::minutes(3));
    trigger_cl(&engine, "chromium", 2, &["main"], &[], RunMode::DryRun).await;
    engine.drain().await.unwrap();
    let second = only_run(&engine, cl.id).await;
    assert_ne!(second.id, first.id);
    assert_eq!(second.status, RunStatus::Running);
}

#[tokio::test]
async fn stacked_cls_in_combinable_group_share_a_run() {
    let (clock, engine) = engine(vec![ProjectConfig::new(
        "v8",
        vec![ConfigGroup::combinable("stack", 120)],
    )]);
    let base = trigger_cl(&engine, "v8", 10, &["stack"], &[], RunMode::DryRun).await;
    let top = trigger_cl(&engine, "v8", 11, &["stack"], &[base.id], RunMode::DryRun).await;

    engine.drain().await.unwrap();
    assert!(reload(&engine, base.id).await.incomplete_runs.is_empty());
    let eta = engine.store().next_outbox_eta().await.unwrap().unwrap();
    assert_eq!(eta, engine.store().now() + Duration::minutes(2));

    clock.advance(Duration::minutes(2));
    engine.drain().await.unwrap();
    let run = only_run(&engine, base.id).await;
    assert_eq!(run.cls, vec![base.id, top.id]);
    assert_eq!(only_run(&engine, top.id).await.id, run.id);
}

#[tokio::test]
async fn ambiguous_cl_loses_its_trigger() {
    let (_clock, engine) = engine(vec![ProjectConfig::new(
        "chromium",
        vec![ConfigGroup::singular("main"), ConfigGroup::singular("infra")],
    )]);
    let cl = trigger_cl(&engine, "chromium", 3, &["main", "infra"], &[], RunMode::FullRun).await;
    engine.drain().await.unwrap();

    let cl = reload(&engine, cl.id).await;
    assert!(cl.trigger().is_none());
    assert!(cl.incomplete_runs.is_empty());
    assert_eq!(cl.purge_messages.len(), 1);
    let state = engine.projects().load_state("chromium").await.unwrap().unwrap();
    assert!(state.purging.is_empty(), "purge is forgotten once the trigger is gone");
}

#[tokio::test]
async fn custom_purger_sees_ambiguous_cls() {
    let clock = Arc::new(TestClock::new(
        Utc.with_ymd_and_hms(2026, 9, 14, 10, 0, 0).unwrap(),
    ));
    let store = Datastore::in_memory(clock);
    let purger = Arc::new(RecordingPurger::new());
    let engine = Engine::with_purger(
        store.clone(),
        Arc::new(StaticConfigProvider::new(vec![ProjectConfig::new(
            "chromium",
            vec![ConfigGroup::singular("main"), ConfigGroup::singular("infra")],
        )])),
        Arc::new(ManualTree::new()),
        Arc::new(OfflineSubmitter::new(store)),
        purger.clone(),
        EngineSettings::default(),
    );
    let cl = trigger_cl(&engine, "chromium", 4, &["main", "infra"], &[], RunMode::DryRun).await;
    engine.drain().await.unwrap();

    assert_eq!(purger.calls().len(), 1);
    assert_eq!(purger.calls()[0].0, cl.id);
    // Recording only: the trigger is still there.
    assert!(reload(&engine, cl.id).await.trigger().is_some());
}

#[tokio::test]
async fn resync_pokes_every_project() {
    let (_clock, engine) = engine(vec![
        ProjectConfig::new("chromium", vec![ConfigGroup::singular("main")]),
        ProjectConfig::new("v8", vec![ConfigGroup::singular("main")]),
    ]);
    let a = trigger_cl(&engine, "chromium", 5, &["main"], &[], RunMode::DryRun).await;
    let b = trigger_cl(&engine, "v8", 6, &["main"], &[], RunMode::DryRun).await;

    // Skip the notifications and rely on resync alone.
    engine.resync().await.unwrap();
    assert_eq!(reload(&engine, a.id).await.incomplete_runs.len(), 1);
    assert_eq!(reload(&engine, b.id).await.incomplete_runs.len(), 1);
}

#[tokio::test]
async fn run_loop_stops_on_shutdown() {
    let (_clock, engine) = engine(vec![]);
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run(rx).await }
    });
    tx.send(true).unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .expect("engine did not stop")
        .unwrap();
}
