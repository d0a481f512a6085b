//! Task runner behaviour driven through the public overlord API
//!
//! Covers dependency ordering, undo ordering, retries, panics, concurrency
//! limits, aborts and shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use overlord::{
    ChangeId, Clock, Handler, HandlerError, ManualClock, MemoryBackend, Overlord,
    OverlordConfig, OverlordError, RetryPolicy, Status, TaskId,
};

const SETTLE: Duration = Duration::from_secs(10);

fn overlord_with(config: OverlordConfig) -> (Overlord, ManualClock, Arc<MemoryBackend>) {
    let clock = ManualClock::default();
    let backend = Arc::new(MemoryBackend::new());
    let ov = Overlord::with_backend(config, Arc::new(clock.clone()), backend.clone())
        .expect("Failed to build overlord");
    (ov, clock, backend)
}

fn overlord() -> (Overlord, ManualClock, Arc<MemoryBackend>) {
    overlord_with(OverlordConfig::with_state_path("/unused/state.json"))
}

/// Handler that appends `name` to a shared journal.
fn journaling(journal: &Arc<Mutex<Vec<String>>>, name: &str) -> Handler {
    let journal = Arc::clone(journal);
    let name = name.to_string();
    Handler::new(move |_| {
        journal.lock().expect("journal").push(name.clone());
        Ok(())
    })
}

/// Runs passes until no handler runs and a pass dispatches nothing.
fn drain(ov: &Overlord) {
    for _ in 0..1000 {
        ov.ensure_once().expect("ensure pass");
        if ov.task_runner().running_count() == 0 {
            return;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    panic!("runner did not go idle");
}

/// Creates a change with a linear chain of tasks, each waiting on the previous one.
fn chain(ov: &Overlord, kinds: &[&str]) -> (ChangeId, Vec<TaskId>) {
    let mut st = ov.state().lock();
    let chg = st.new_change("install", "Install foo");
    let mut ids: Vec<TaskId> = Vec::new();
    for kind in kinds {
        let id = st.new_task(kind, &format!("Run {kind}"));
        st.add_task(chg, id).expect("add task");
        if let Some(prev) = ids.last() {
            st.wait_for(id, *prev).expect("wait for previous");
        }
        ids.push(id);
    }
    (chg, ids)
}

fn status_of(ov: &Overlord, id: TaskId) -> Status {
    ov.state().lock().task(id).expect("task").status()
}

#[test]
fn test_dependencies_run_in_order() {
    let (ov, _, _) = overlord();
    let journal = Arc::new(Mutex::new(Vec::new()));
    for kind in ["download", "mount", "link"] {
        ov.task_runner()
            .add_handler(kind, journaling(&journal, kind), None);
    }
    let (chg, _) = chain(&ov, &["download", "mount", "link"]);

    ov.settle(SETTLE).expect("settle");

    assert_eq!(*journal.lock().expect("journal"), vec!["download", "mount", "link"]);
    let st = ov.state().lock();
    assert_eq!(st.change_status(chg), Some(Status::Done));
    assert!(st.change(chg).expect("change").ready_time().is_some());
}

#[test]
fn test_failure_undoes_in_reverse_dependency_order() {
    let (ov, _, _) = overlord();
    let journal = Arc::new(Mutex::new(Vec::new()));
    let runner = ov.task_runner();
    runner.add_handler(
        "a",
        journaling(&journal, "do a"),
        Some(journaling(&journal, "undo a")),
    );
    {
        let journal = Arc::clone(&journal);
        runner.add_handler(
            "b",
            Handler::new(move |_| {
                journal.lock().expect("journal").push("do b".into());
                Err(anyhow!("mount failed").into())
            }),
            None,
        );
    }
    runner.add_handler("c", journaling(&journal, "do c"), None);

    let (chg, ids) = chain(&ov, &["a", "b", "c"]);
    ov.settle(SETTLE).expect("settle");

    assert_eq!(
        *journal.lock().expect("journal"),
        vec!["do a", "do b", "undo a"]
    );
    assert_eq!(status_of(&ov, ids[0]), Status::Undone);
    assert_eq!(status_of(&ov, ids[1]), Status::Error);
    assert_eq!(status_of(&ov, ids[2]), Status::Hold);

    let st = ov.state().lock();
    assert_eq!(st.change_status(chg), Some(Status::Error));
    let err = st.change_err(chg).expect("change error");
    assert!(err.contains("Run b (mount failed)"), "got: {err}");
}

#[test]
fn test_undo_waits_for_halt_tasks() {
    let (ov, _, _) = overlord();
    let journal = Arc::new(Mutex::new(Vec::new()));
    let runner = ov.task_runner();
    for kind in ["first", "second"] {
        runner.add_handler(
            kind,
            journaling(&journal, &format!("do {kind}")),
            Some(journaling(&journal, &format!("undo {kind}"))),
        );
    }
    runner.add_handler(
        "fail",
        Handler::new(|_| Err(anyhow!("boom").into())),
        None,
    );

    chain(&ov, &["first", "second", "fail"]);
    ov.settle(SETTLE).expect("settle");

    assert_eq!(
        *journal.lock().expect("journal"),
        vec!["do first", "do second", "undo second", "undo first"]
    );
}

#[test]
fn test_kind_without_undo_handler_is_marked_undone() {
    let (ov, _, _) = overlord();
    let runner = ov.task_runner();
    runner.add_handler("prepare", Handler::new(|_| Ok(())), None);
    runner.add_handler("fail", Handler::new(|_| Err(anyhow!("nope").into())), None);

    let (_, ids) = chain(&ov, &["prepare", "fail"]);
    ov.settle(SETTLE).expect("settle");
    assert_eq!(status_of(&ov, ids[0]), Status::Undone);
}

#[test]
fn test_retry_is_not_dispatched_early() {
    let (ov, clock, _) = overlord();
    let calls = Arc::new(AtomicUsize::new(0));
    {
        let calls = Arc::clone(&calls);
        ov.task_runner().add_handler(
            "download",
            Handler::new(move |_| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(HandlerError::retry(Duration::from_secs(5), "store busy"));
                }
                Ok(())
            }),
            None,
        );
    }
    let (chg, ids) = chain(&ov, &["download"]);

    drain(&ov);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    {
        let st = ov.state().lock();
        let task = st.task(ids[0]).expect("task");
        assert_eq!(task.status(), Status::Wait);
        assert_eq!(task.retry_count(), 1);
        assert_eq!(task.at(), Some(clock.now() + chrono::Duration::seconds(5)));
        assert!(task.log().iter().any(|e| e.message.contains("store busy")));
        assert_eq!(st.change_status(chg), Some(Status::Wait));
    }
    assert!(ov.state().ensure_deadline().is_some());

    clock.advance(chrono::Duration::seconds(4));
    drain(&ov);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    clock.advance(chrono::Duration::seconds(1));
    ov.settle(SETTLE).expect("settle");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(status_of(&ov, ids[0]), Status::Done);
}

#[test]
fn test_retry_cap_turns_into_error() {
    let (ov, _, _) = overlord_with(OverlordConfig {
        retry: RetryPolicy::at_most(2),
        ..OverlordConfig::with_state_path("/unused/state.json")
    });
    let calls = Arc::new(AtomicUsize::new(0));
    {
        let calls = Arc::clone(&calls);
        ov.task_runner().add_handler(
            "flaky",
            Handler::new(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::retry(Duration::ZERO, "still flaky"))
            }),
            None,
        );
    }
    let (chg, ids) = chain(&ov, &["flaky"]);
    ov.settle(SETTLE).expect("settle");

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(status_of(&ov, ids[0]), Status::Error);
    let st = ov.state().lock();
    assert_eq!(st.change_status(chg), Some(Status::Error));
    assert!(st.change_err(chg).expect("err").contains("giving up after 2 retries"));
}

#[test]
fn test_idempotent_ensure_writes_nothing() {
    let (ov, _, backend) = overlord();
    ov.task_runner()
        .add_handler("noop", Handler::new(|_| Ok(())), None);
    chain(&ov, &["noop", "noop"]);
    ov.settle(SETTLE).expect("settle");

    let writes = backend.write_count();
    for _ in 0..3 {
        ov.ensure_once().expect("ensure");
    }
    assert_eq!(backend.write_count(), writes);
}

#[test]
fn test_panicking_handler_is_contained() {
    let (ov, _, _) = overlord();
    let runner = ov.task_runner();
    runner.add_handler("explode", Handler::new(|_| panic!("kaboom")), None);
    runner.add_handler("noop", Handler::new(|_| Ok(())), None);

    let (bad, bad_ids) = chain(&ov, &["explode"]);
    let (good, _) = chain(&ov, &["noop"]);
    ov.settle(SETTLE).expect("settle");

    assert_eq!(status_of(&ov, bad_ids[0]), Status::Error);
    let st = ov.state().lock();
    assert_eq!(st.change_status(bad), Some(Status::Error));
    assert_eq!(st.change_status(good), Some(Status::Done));
    let log = st.task(bad_ids[0]).expect("task").log();
    assert!(log.iter().any(|e| e.message.contains("kaboom")));
}

#[test]
fn test_missing_handler_is_fatal() {
    let (ov, _, _) = overlord();
    chain(&ov, &["unregistered"]);

    let err = ov.ensure_once().unwrap_err();
    assert!(matches!(err, OverlordError::MissingHandler { ref kind } if kind == "unregistered"));
    assert!(err.is_fatal());
}

#[test]
fn test_concurrency_is_bounded() {
    let (ov, _, _) = overlord_with(OverlordConfig {
        max_concurrent_tasks: 2,
        ..OverlordConfig::with_state_path("/unused/state.json")
    });
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    {
        let current = Arc::clone(&current);
        let peak = Arc::clone(&peak);
        ov.task_runner().add_handler(
            "slow",
            Handler::new(move |_| {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(20));
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }),
            None,
        );
    }
    {
        let mut st = ov.state().lock();
        let chg = st.new_change("bulk", "Many independent tasks");
        for i in 0..6 {
            let t = st.new_task("slow", &format!("slow {i}"));
            st.add_task(chg, t).expect("add");
        }
    }

    ov.settle(SETTLE).expect("settle");
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(peak.load(Ordering::SeqCst) >= 1);
}

#[test]
fn test_abort_cancels_running_and_undoes_done() {
    let (ov, _, _) = overlord();
    let (started_tx, started_rx) = crossbeam::channel::bounded(1);
    let undone = Arc::new(AtomicUsize::new(0));
    let runner = ov.task_runner();
    {
        let undone = Arc::clone(&undone);
        runner.add_handler(
            "fetch",
            Handler::new(|_| Ok(())),
            Some(Handler::new(move |_| {
                undone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
        );
    }
    runner.add_handler(
        "long",
        Handler::new(move |ctx| {
            let _ = started_tx.send(ctx.task_id());
            ctx.sleep(Duration::from_secs(30))
        }),
        None,
    );

    let (chg, ids) = chain(&ov, &["fetch", "long", "fetch"]);
    for _ in 0..1000 {
        ov.ensure_once().expect("ensure");
        if started_rx.try_recv().is_ok() {
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(status_of(&ov, ids[1]), Status::Doing);

    ov.state().lock().abort_change(chg).expect("abort");
    assert_eq!(status_of(&ov, ids[1]), Status::Abort);
    ov.settle(SETTLE).expect("settle");

    assert_eq!(status_of(&ov, ids[0]), Status::Undone);
    assert_eq!(status_of(&ov, ids[1]), Status::Hold);
    assert_eq!(status_of(&ov, ids[2]), Status::Hold);
    assert_eq!(undone.load(Ordering::SeqCst), 1);
    assert_eq!(ov.state().lock().change_status(chg), Some(Status::Undone));
}

#[test]
fn test_failed_undo_is_error_and_not_retried() {
    let (ov, _, _) = overlord();
    let undo_calls = Arc::new(AtomicUsize::new(0));
    let runner = ov.task_runner();
    {
        let undo_calls = Arc::clone(&undo_calls);
        runner.add_handler(
            "setup",
            Handler::new(|_| Ok(())),
            Some(Handler::new(move |_| {
                undo_calls.fetch_add(1, Ordering::SeqCst);
                Err(anyhow!("cannot revert").into())
            })),
        );
    }
    runner.add_handler("fail", Handler::new(|_| Err(anyhow!("broken").into())), None);

    let (chg, ids) = chain(&ov, &["setup", "fail"]);
    ov.settle(SETTLE).expect("settle");
    for _ in 0..3 {
        ov.ensure_once().expect("ensure");
    }

    assert_eq!(undo_calls.load(Ordering::SeqCst), 1);
    let st = ov.state().lock();
    let setup = st.task(ids[0]).expect("setup");
    assert_eq!(setup.status(), Status::Error);
    assert!(setup.undo_failed());
    assert_eq!(st.change_status(chg), Some(Status::Error));
}

#[test]
fn test_stop_leaves_interrupted_task_resumable() {
    let (ov, _, _) = overlord();
    let (started_tx, started_rx) = crossbeam::channel::bounded(1);
    ov.task_runner().add_handler(
        "long",
        Handler::new(move |ctx| {
            let _ = started_tx.send(());
            ctx.sleep(Duration::from_secs(30))
        }),
        None,
    );
    let (_, ids) = chain(&ov, &["long"]);
    ov.ensure_once().expect("ensure");
    started_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("handler started");

    ov.stop().expect("stop");
    assert_eq!(ov.task_runner().running_count(), 0);
    assert_eq!(status_of(&ov, ids[0]), Status::Do);
    assert!(ov.task_runner().is_stopping());
}

#[test]
fn test_handler_reports_progress_and_data() {
    let (ov, _, _) = overlord();
    ov.task_runner().add_handler(
        "download",
        Handler::new(|ctx| {
            ctx.set_progress("Downloading", 10, 10);
            ctx.logf("fetched 10 bytes");
            let mut st = ctx.state().lock();
            let task = st.task_mut(ctx.task_id()).expect("own task");
            task.set("size", &10_u64).map_err(anyhow::Error::from)?;
            Ok(())
        }),
        None,
    );
    let (_, ids) = chain(&ov, &["download"]);
    ov.settle(SETTLE).expect("settle");

    let st = ov.state().lock();
    let task = st.task(ids[0]).expect("task");
    assert_eq!(task.get::<u64>("size").expect("size"), Some(10));
    assert_eq!(task.progress().map(|p| p.done), Some(10));
    assert_eq!(task.log().len(), 1);
}

#[test]
fn test_task_held_before_running_settles_its_change() {
    let (ov, _, _) = overlord();
    let journal = Arc::new(Mutex::new(Vec::new()));
    for kind in ["download", "mount", "link"] {
        ov.task_runner()
            .add_handler(kind, journaling(&journal, kind), None);
    }
    let (chg, ids) = chain(&ov, &["download", "mount", "link"]);
    ov.state().lock().hold_task(ids[1]).expect("hold mount");

    ov.settle(SETTLE).expect("settle");

    assert_eq!(*journal.lock().expect("journal"), vec!["download"]);
    assert_eq!(status_of(&ov, ids[0]), Status::Done);
    assert_eq!(status_of(&ov, ids[1]), Status::Hold);
    assert_eq!(status_of(&ov, ids[2]), Status::Hold);

    let st = ov.state().lock();
    assert_eq!(st.change_status(chg), Some(Status::Hold));
    assert!(st.change(chg).expect("change").ready_time().is_some());
    let log = st.task(ids[2]).expect("link").log();
    assert!(log.iter().any(|e| e.message.contains("ended in Hold")));
}

#[test]
fn test_aborted_handler_holds_its_dependents() {
    let (ov, _, _) = overlord();
    let runner = ov.task_runner();
    runner.add_handler("gate", Handler::new(|_| Err(HandlerError::Aborted)), None);
    runner.add_handler("after", Handler::new(|_| Ok(())), None);

    let (chg, ids) = chain(&ov, &["gate", "after", "after"]);
    ov.settle(SETTLE).expect("settle");

    assert_eq!(status_of(&ov, ids[0]), Status::Hold);
    assert_eq!(status_of(&ov, ids[1]), Status::Hold);
    assert_eq!(status_of(&ov, ids[2]), Status::Hold);
    assert_eq!(ov.state().lock().change_status(chg), Some(Status::Hold));
}
