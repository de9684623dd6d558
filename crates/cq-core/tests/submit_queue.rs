use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use cq_core::run::submit_queue::{self, Holder, SubmittedBatch, LEASE_GRACE_SECS};
use cq_core::{Clock, Datastore, RunEvent, RunId, SubmitOptions, SubmitQueue, Task, TestClock};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 8, 0, 0).unwrap()
}

fn setup() -> (Arc<TestClock>, Datastore) {
    let clock = Arc::new(TestClock::new(t0()));
    let store = Datastore::in_memory(clock.clone());
    (clock, store)
}

fn run(n: u32) -> RunId {
    RunId::from_raw(format!("chromium/{n:013}-1-00000000000000{n:02}"))
}

async fn acquire(store: &Datastore, run_id: &RunId, opts: Option<&SubmitOptions>) -> bool {
    let mut txn = store.begin();
    let waitlisted = submit_queue::try_acquire(&mut txn, run_id, opts, Duration::minutes(20))
        .await
        .unwrap();
    txn.commit().await.unwrap();
    waitlisted
}

async fn due_tasks(store: &Datastore, clock: &TestClock) -> Vec<Task> {
    store
        .due_outbox(clock.now())
        .await
        .unwrap()
        .into_iter()
        .map(|(_, rec)| serde_json::from_value(rec.task).unwrap())
        .collect()
}

#[tokio::test]
async fn second_run_is_waitlisted_in_order() {
    let (_clock, store) = setup();
    assert!(!acquire(&store, &run(1), None).await);
    assert!(acquire(&store, &run(2), None).await);
    assert!(acquire(&store, &run(3), None).await);
    // Asking again does not move a Run.
    assert!(acquire(&store, &run(2), None).await);

    let (current, waitlist) = submit_queue::load_current_and_waitlist(&store, "chromium")
        .await
        .unwrap();
    assert_eq!(current, Some(run(1)));
    assert_eq!(waitlist, vec![run(2), run(3)]);
}

#[tokio::test]
async fn holder_reacquiring_renews_lease() {
    let (clock, store) = setup();
    assert!(!acquire(&store, &run(1), None).await);
    clock.advance(Duration::minutes(5));
    assert!(!acquire(&store, &run(1), None).await);
    let q = store.get::<SubmitQueue>("chromium").await.unwrap().unwrap();
    assert_eq!(
        q.current.unwrap().lease_until,
        clock.now() + Duration::minutes(20) + Duration::seconds(LEASE_GRACE_SECS)
    );
}

#[tokio::test]
async fn racing_acquirers_cannot_both_win() {
    let (_clock, store) = setup();
    let mut first = store.begin();
    let mut second = store.begin();
    let lease = Duration::minutes(20);
    assert!(!submit_queue::try_acquire(&mut first, &run(1), None, lease).await.unwrap());
    assert!(!submit_queue::try_acquire(&mut second, &run(2), None, lease).await.unwrap());
    first.commit().await.unwrap();
    assert!(second.commit().await.unwrap_err().is_conflict());

    assert!(acquire(&store, &run(2), None).await);
}

#[tokio::test]
async fn release_promotes_head_and_notifies_it() {
    let (clock, store) = setup();
    acquire(&store, &run(1), None).await;
    acquire(&store, &run(2), None).await;

    let mut txn = store.begin();
    submit_queue::release(&mut txn, &run(1)).await.unwrap();
    txn.commit().await.unwrap();

    let (current, waitlist) = submit_queue::load_current_and_waitlist(&store, "chromium")
        .await
        .unwrap();
    assert_eq!(current, Some(run(2)));
    assert!(waitlist.is_empty());
    assert_eq!(
        due_tasks(&store, &clock).await,
        vec![Task::Run {
            run_id: run(2),
            event: RunEvent::ReadyForSubmission
        }]
    );
    // The promoted Run sees itself as holder.
    assert!(!acquire(&store, &run(2), None).await);
}

#[tokio::test]
async fn releasing_a_waitlisted_run_removes_it() {
    let (_clock, store) = setup();
    acquire(&store, &run(1), None).await;
    acquire(&store, &run(2), None).await;
    let mut txn = store.begin();
    submit_queue::release(&mut txn, &run(2)).await.unwrap();
    txn.commit().await.unwrap();
    let (current, waitlist) = submit_queue::load_current_and_waitlist(&store, "chromium")
        .await
        .unwrap();
    assert_eq!(current, Some(run(1)));
    assert!(waitlist.is_empty());
}

#[tokio::test]
async fn expired_holder_is_demoted() {
    let (clock, store) = setup();
    acquire(&store, &run(1), None).await;
    acquire(&store, &run(2), None).await;

    clock.advance(Duration::minutes(23));
    let mut txn = store.begin();
    let demoted = submit_queue::release_expired(&mut txn, "chromium").await.unwrap();
    txn.commit().await.unwrap();
    assert_eq!(demoted, Some(run(1)));

    let (current, _) = submit_queue::load_current_and_waitlist(&store, "chromium")
        .await
        .unwrap();
    assert_eq!(current, Some(run(2)));
    let tasks = due_tasks(&store, &clock).await;
    assert!(tasks.contains(&Task::Run {
        run_id: run(1),
        event: RunEvent::Poke
    }));
    assert!(tasks.contains(&Task::Run {
        run_id: run(2),
        event: RunEvent::ReadyForSubmission
    }));

    // The demoted Run must queue up again.
    assert!(acquire(&store, &run(1), None).await);
}

#[tokio::test]
async fn newcomer_takes_slot_of_expired_holder_when_nobody_waits() {
    let (clock, store) = setup();
    acquire(&store, &run(1), None).await;
    clock.advance(Duration::minutes(30));
    assert!(!acquire(&store, &run(2), None).await);
    assert_eq!(
        due_tasks(&store, &clock).await,
        vec![Task::Run {
            run_id: run(1),
            event: RunEvent::Poke
        }]
    );
}

#[tokio::test]
async fn extend_lease_only_touches_holder() {
    let (clock, store) = setup();
    acquire(&store, &run(1), None).await;
    acquire(&store, &run(2), None).await;
    let until = clock.now() + Duration::hours(1);

    let mut txn = store.begin();
    submit_queue::extend_lease(&mut txn, &run(2), until).await.unwrap();
    submit_queue::extend_lease(&mut txn, &run(1), until).await.unwrap();
    txn.commit().await.unwrap();

    let q = store.get::<SubmitQueue>("chromium").await.unwrap().unwrap();
    assert_eq!(
        q.current,
        Some(Holder {
            run_id: run(1),
            acquired_at: t0(),
            lease_until: until + Duration::seconds(LEASE_GRACE_SECS),
        })
    );
}

#[tokio::test]
async fn burst_limit_delays_next_submission() {
    let (clock, store) = setup();
    let opts = SubmitOptions {
        max_burst: 2,
        burst_delay_secs: 600,
    };
    acquire(&store, &run(1), Some(&opts)).await;
    acquire(&store, &run(2), Some(&opts)).await;

    let mut txn = store.begin();
    submit_queue::release_on_success(&mut txn, &run(1), 2).await.unwrap();
    txn.commit().await.unwrap();

    // The promoted Run is told to come back once the window frees up.
    let gate = t0() + Duration::minutes(10);
    assert!(due_tasks(&store, &clock).await.is_empty());
    assert_eq!(store.next_outbox_eta().await.unwrap(), Some(gate));

    let mut txn = store.begin();
    assert_eq!(
        submit_queue::burst_ready_at(&mut txn, "chromium").await.unwrap(),
        Some(gate)
    );
    clock.advance_to(gate);
    let mut txn = store.begin();
    assert_eq!(
        submit_queue::burst_ready_at(&mut txn, "chromium").await.unwrap(),
        None
    );
}

#[test]
fn burst_gate_walks_history_oldest_first() {
    let mut q = SubmitQueue::new("chromium");
    q.opts = Some(SubmitOptions {
        max_burst: 2,
        burst_delay_secs: 600,
    });
    q.history = (0..3)
        .map(|i| SubmittedBatch {
            run_id: run(i),
            cl_count: 1,
            at: t0() + Duration::minutes(i as i64),
        })
        .collect();
    let now = t0() + Duration::minutes(3);
    // Three in the window; dropping the oldest still leaves two.
    assert_eq!(
        q.burst_ready_at(now),
        Some(t0() + Duration::minutes(11))
    );

    q.opts = Some(SubmitOptions {
        max_burst: 0,
        burst_delay_secs: 600,
    });
    assert_eq!(q.burst_ready_at(now), None);

    q.opts = Some(SubmitOptions {
        max_burst: 4,
        burst_delay_secs: 600,
    });
    assert_eq!(q.burst_ready_at(now), None);
}
