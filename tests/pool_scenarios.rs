//! End-to-end scenarios for the elastic worker pool

use agent_log_workers::io::FileIoOperationType;
use agent_log_workers::prelude::*;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// What a scripted job does
enum Task {
    Value(u32),
    /// Block until the gate is released (or dropped)
    Gated(Receiver<()>, u32),
    Fail(&'static str),
    Panic,
    ReadFile(PathBuf),
    /// Append the value to a shared log when the job starts
    Record(Arc<Mutex<Vec<u32>>>, u32),
}

#[derive(Clone)]
struct Scripted;

impl WorkerRoutine for Scripted {
    type Input = Task;
    type Output = u32;

    fn run(&mut self, task: Task, ctx: &JobContext<'_>) -> std::result::Result<u32, RoutineError> {
        match task {
            Task::Value(v) => Ok(v),
            Task::Gated(gate, v) => {
                let _ = gate.recv();
                Ok(v)
            }
            Task::Fail(msg) => Err(msg.into()),
            Task::Panic => panic!("corrupt session record"),
            Task::ReadFile(path) => Ok(ctx.io().read(&path)?.len() as u32),
            Task::Record(started, v) => {
                started.lock().push(v);
                Ok(v)
            }
        }
    }
}

fn gate() -> (Sender<()>, Receiver<()>) {
    unbounded()
}

fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn pool(options: WorkerPoolOptions) -> WorkerPool<Scripted> {
    init_logging();
    WorkerPool::with_routine(options.with_name("scenario"), Scripted).expect("Failed to create pool")
}

#[test]
fn test_min_one_max_two_with_three_jobs() {
    let pool = pool(WorkerPoolOptions::new(1, 2).without_idle_timeout());
    assert_eq!(pool.live_worker_count(), 1);

    let (tx1, rx1) = gate();
    let (tx2, rx2) = gate();
    let (tx3, rx3) = gate();
    let h1 = pool.execute(Task::Gated(rx1, 1));
    let h2 = pool.execute(Task::Gated(rx2, 2));
    let h3 = pool.execute(Task::Gated(rx3, 3));

    assert_eq!(pool.live_worker_count(), 2);
    assert_eq!(pool.busy_worker_count(), 2);
    assert_eq!(pool.queued_count(), 1);
    assert_eq!(pool.metrics().peak_worker_count, 2);

    tx1.send(()).unwrap();
    assert_eq!(h1.wait().unwrap(), 1);

    // the queued job took over the freed worker
    assert_eq!(pool.queued_count(), 0);
    assert_eq!(pool.live_worker_count(), 2);
    assert_eq!(pool.busy_worker_count(), 2);

    tx2.send(()).unwrap();
    tx3.send(()).unwrap();
    assert_eq!(h2.wait().unwrap(), 2);
    assert_eq!(h3.wait().unwrap(), 3);

    let metrics = pool.metrics();
    assert_eq!(metrics.success_count, 3);
    assert_eq!(metrics.peak_worker_count, 2);
    assert!(metrics.worker_count <= 2);
}

#[test]
fn test_failed_job_leaves_worker_reusable() {
    let pool = pool(WorkerPoolOptions::new(0, 1));

    let err = pool.execute(Task::Fail("unexpected token")).wait().unwrap_err();
    match &err {
        WorkerPoolError::Execution(exec) => assert_eq!(exec.message, "unexpected token"),
        other => panic!("expected an execution error, got {other}"),
    }

    let metrics = pool.metrics();
    assert_eq!(metrics.failure_count, 1);
    assert_eq!(metrics.success_count, 0);
    assert_eq!(pool.live_worker_count(), 1);
    assert_eq!(pool.idle_worker_count(), 1);

    let first_worker = pool.workers()[0].id;
    assert_eq!(pool.execute(Task::Value(9)).wait().unwrap(), 9);
    let workers = pool.workers();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].id, first_worker);
    assert_eq!(workers[0].jobs_completed, 2);
}

#[test]
fn test_panicking_job_is_contained() {
    let pool = pool(WorkerPoolOptions::new(0, 1));

    let err = pool.execute(Task::Panic).wait().unwrap_err();
    assert!(err.is_execution());
    assert!(err.to_string().contains("corrupt session record"));

    assert_eq!(pool.execute(Task::Value(4)).wait().unwrap(), 4);
    assert_eq!(pool.metrics().failure_count, 1);
    assert_eq!(pool.metrics().success_count, 1);
}

#[test]
fn test_spawn_failure_on_first_execute() {
    init_logging();
    let reported = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reported);
    let attempts = Arc::new(AtomicUsize::new(0));
    let factory_attempts = Arc::clone(&attempts);

    let pool = WorkerPool::new(
        WorkerPoolOptions::new(0, 2).with_error_handler(move |err| sink.lock().push(err.clone())),
        move |_worker| {
            if factory_attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Err("event schema not loaded".into())
            } else {
                Ok(Scripted)
            }
        },
    )
    .unwrap();

    let err = pool.execute(Task::Value(1)).wait().unwrap_err();
    match &err {
        WorkerPoolError::Spawn(spawn) => {
            assert_eq!(spawn.slot, 0);
            assert!(spawn.message.contains("event schema not loaded"));
        }
        other => panic!("expected a spawn error, got {other}"),
    }
    {
        let reported = reported.lock();
        assert_eq!(reported.len(), 1);
        assert!(reported[0].is_spawn());
    }

    assert_eq!(pool.execute(Task::Value(2)).wait().unwrap(), 2);
    assert_eq!(pool.live_worker_count(), 1);
}

#[test]
fn test_min_spawn_failure_goes_to_handler_only() {
    init_logging();
    let reported = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&reported);

    let pool: WorkerPool<Scripted> = WorkerPool::new(
        WorkerPoolOptions::new(2, 2).with_error_handler(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
        |_worker| Err("no loader".into()),
    )
    .unwrap();

    assert_eq!(reported.load(Ordering::SeqCst), 2);
    assert_eq!(pool.live_worker_count(), 0);
}

#[test]
fn test_idle_workers_above_min_retire() {
    let pool = pool(WorkerPoolOptions::new(1, 2).with_idle_timeout(Duration::from_millis(40)));

    let (tx1, rx1) = gate();
    let (tx2, rx2) = gate();
    let h1 = pool.execute(Task::Gated(rx1, 1));
    let h2 = pool.execute(Task::Gated(rx2, 2));
    assert_eq!(pool.live_worker_count(), 2);

    tx1.send(()).unwrap();
    tx2.send(()).unwrap();
    h1.wait().unwrap();
    h2.wait().unwrap();

    assert!(eventually(Duration::from_secs(3), || pool.live_worker_count() == 1));

    // the long-lived worker in slot 0 stays, however long it idles
    thread::sleep(Duration::from_millis(200));
    let workers = pool.workers();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].slot, 0);
    assert!(!workers[0].retiring);
}

#[test]
fn test_all_surplus_workers_retire_with_zero_min() {
    let pool = pool(WorkerPoolOptions::new(0, 3).with_idle_timeout(Duration::from_millis(30)));

    let gates: Vec<_> = (0..3).map(|_| gate()).collect();
    let handles: Vec<_> = gates
        .iter()
        .enumerate()
        .map(|(i, (_, rx))| pool.execute(Task::Gated(rx.clone(), i as u32)))
        .collect();
    assert_eq!(pool.live_worker_count(), 3);

    for (tx, _) in &gates {
        tx.send(()).unwrap();
    }
    for handle in handles {
        handle.wait().unwrap();
    }

    assert!(eventually(Duration::from_secs(3), || pool.live_worker_count() == 0));
    assert_eq!(pool.metrics().peak_worker_count, 3);

    // a retired pool grows back on demand
    assert_eq!(pool.execute(Task::Value(5)).wait().unwrap(), 5);
}

#[test]
fn test_busy_worker_is_not_retired() {
    let pool = pool(WorkerPoolOptions::new(0, 1).with_idle_timeout(Duration::from_millis(20)));

    let (tx, rx) = gate();
    let handle = pool.execute(Task::Gated(rx, 1));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(pool.live_worker_count(), 1);
    assert_eq!(pool.busy_worker_count(), 1);

    tx.send(()).unwrap();
    assert_eq!(handle.wait().unwrap(), 1);
}

#[test]
fn test_file_io_stats_sink_skips_empty_stats() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.jsonl");
    std::fs::write(&path, "{\"type\":\"step\"}\n").unwrap();

    let collected = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&collected);
    let pool = WorkerPool::with_routine(
        WorkerPoolOptions::new(0, 1)
            .with_file_io_stats_handler(move |stats| sink.lock().push(stats.clone())),
        Scripted,
    )
    .unwrap();

    assert_eq!(pool.execute(Task::ReadFile(path.clone())).wait().unwrap(), 16);
    assert_eq!(pool.execute(Task::Value(0)).wait().unwrap(), 0);
    assert_eq!(pool.execute(Task::ReadFile(path)).wait().unwrap(), 16);

    // callbacks run after the pool lock is released, so give them a moment
    assert!(eventually(Duration::from_secs(3), || collected.lock().len() == 2));

    let collected = collected.lock();
    for stats in collected.iter() {
        assert_eq!(stats.len(), 1);
        assert_eq!(stats.operations[0].op_type, FileIoOperationType::Read);
        assert_eq!(stats.operations[0].size, Some(16));
        assert!(!stats.operations[0].error);
    }
    assert_eq!(collected[0].worker_id, collected[1].worker_id);

    let summary = pool.file_io_summary();
    assert_eq!(summary.jobs_reported, 2);
    assert_eq!(summary.total_operations(), 2);
}

#[test]
fn test_up_to_max_jobs_never_queue() {
    let pool = pool(WorkerPoolOptions::new(0, 4));

    let (tx, rx) = gate();
    let handles: Vec<_> = (0..4).map(|i| pool.execute(Task::Gated(rx.clone(), i))).collect();

    let metrics = pool.metrics();
    assert_eq!(metrics.queued_count, 0);
    assert_eq!(metrics.busy_count, 4);
    assert!(metrics.worker_count <= 4);

    drop(tx);
    for handle in handles {
        handle.wait().unwrap();
    }
}

#[test]
fn test_beyond_max_jobs_queue_the_remainder() {
    let pool = pool(WorkerPoolOptions::new(0, 2));

    let (tx, rx) = gate();
    let handles: Vec<_> = (0..5).map(|i| pool.execute(Task::Gated(rx.clone(), i))).collect();

    assert_eq!(pool.busy_worker_count(), 2);
    assert_eq!(pool.queued_count(), 3);

    drop(tx);
    let results: Vec<u32> = handles.into_iter().map(|h| h.wait().unwrap()).collect();
    assert_eq!(results, vec![0, 1, 2, 3, 4]);

    let metrics = pool.metrics();
    assert_eq!(metrics.completed_jobs_count, 5);
    assert_eq!(metrics.peak_worker_count, 2);
    assert!(metrics.average_queue_wait_time_ms >= 0.0);
}

#[test]
fn test_queued_jobs_start_in_arrival_order() {
    let pool = pool(WorkerPoolOptions::new(0, 1));
    let started = Arc::new(Mutex::new(Vec::new()));

    let (tx, rx) = gate();
    let blocker = pool.execute(Task::Gated(rx, 0));
    let handles: Vec<_> = (1..=6)
        .map(|i| pool.execute(Task::Record(Arc::clone(&started), i)))
        .collect();
    assert_eq!(pool.queued_count(), 6);

    tx.send(()).unwrap();
    blocker.wait().unwrap();
    for handle in handles {
        handle.wait().unwrap();
    }

    assert_eq!(*started.lock(), vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(pool.live_worker_count(), 1);
}

#[test]
fn test_queue_wait_time_is_recorded_at_dispatch() {
    let pool = pool(WorkerPoolOptions::new(0, 1));
    let hold = Duration::from_millis(120);

    let (tx, rx) = gate();
    let blocker = pool.execute(Task::Gated(rx, 0));
    let queued = pool.execute(Task::Value(1));

    thread::sleep(hold);
    tx.send(()).unwrap();
    blocker.wait().unwrap();
    queued.wait().unwrap();

    let metrics = pool.metrics();
    let hold_ms = hold.as_millis() as f64;
    assert!(
        metrics.total_queue_wait_time_ms >= hold_ms,
        "queue wait {}ms shorter than the {}ms hold",
        metrics.total_queue_wait_time_ms,
        hold_ms
    );
    // two dispatches, one of them immediate
    assert!(metrics.average_queue_wait_time_ms >= hold_ms / 2.0);
}

#[test]
fn test_unbounded_idle_timeout_keeps_worker() {
    init_logging();
    let reported = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reported);
    let pool = WorkerPool::with_routine(
        WorkerPoolOptions::new(0, 1)
            .with_idle_timeout(Duration::MAX)
            .with_error_handler(move |err| sink.lock().push(err.to_string())),
        Scripted,
    )
    .unwrap();

    assert_eq!(pool.execute(Task::Value(1)).wait().unwrap(), 1);
    assert_eq!(pool.execute(Task::Value(2)).wait().unwrap(), 2);

    thread::sleep(Duration::from_millis(20));
    assert_eq!(pool.live_worker_count(), 1);
    assert!(pool.workers().iter().all(|w| !w.retiring));
    assert!(reported.lock().is_empty());
    pool.shutdown().unwrap();
}

#[test]
fn test_metrics_before_any_job() {
    let pool = pool(WorkerPoolOptions::new(0, 2));
    let metrics = pool.metrics();
    assert_eq!(metrics.average_execution_time_ms, 0.0);
    assert_eq!(metrics.average_queue_wait_time_ms, 0.0);
    assert_eq!(metrics, pool.metrics());
}

#[test]
fn test_shutdown_lets_running_jobs_finish() {
    let pool = pool(WorkerPoolOptions::new(1, 1));

    let (tx, rx) = gate();
    let running = pool.execute(Task::Gated(rx, 7));
    let queued: Vec<_> = (0..3).map(|i| pool.execute(Task::Value(i))).collect();
    assert_eq!(pool.queued_count(), 3);

    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        tx.send(()).unwrap();
    });
    pool.shutdown().unwrap();
    releaser.join().unwrap();

    assert_eq!(running.wait().unwrap(), 7);
    for handle in queued {
        assert!(matches!(
            handle.wait(),
            Err(WorkerPoolError::ShuttingDown { pending_jobs: 3, .. })
        ));
    }
    assert_eq!(pool.live_worker_count(), 0);
    assert!(pool.execute(Task::Value(1)).wait().is_err());
}

#[test]
fn test_load_event_logs() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut requests = Vec::new();
    for i in 0..6 {
        let path = dir.path().join(format!("session-{i}.jsonl"));
        let body: String = (0..=i).map(|n| format!("{{\"seq\":{n}}}\n")).collect();
        std::fs::write(&path, body + "oops\n").unwrap();
        requests.push(EventLogRequest::new(path));
    }

    let pool = WorkerPool::with_routine(
        WorkerPoolOptions::new(1, 3).with_routine_label("event-log-loader"),
        EventLogLoader::new(),
    )
    .unwrap();

    let handles: Vec<_> = requests.into_iter().map(|r| pool.execute(r)).collect();
    for (i, handle) in handles.into_iter().enumerate() {
        let log = handle.wait().unwrap();
        assert_eq!(log.events.len(), i + 1);
        assert_eq!(log.malformed_lines, 1);
    }

    assert!(pool.metrics().peak_worker_count <= 3);
    assert_eq!(pool.metrics().success_count, 6);
}
