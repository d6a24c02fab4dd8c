//! Tests for job cancellation

use agent_log_workers::prelude::*;
use crossbeam_channel::{unbounded, Receiver};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Scripted work; `Sleep` checks the token every millisecond
#[derive(Clone)]
struct Chunked {
    ran: Arc<AtomicBool>,
}

enum Work {
    Sleep(u64),
    Gated(Receiver<()>),
    Record,
}

impl WorkerRoutine for Chunked {
    type Input = Work;
    type Output = ();

    fn run(&mut self, work: Work, ctx: &JobContext<'_>) -> std::result::Result<(), RoutineError> {
        match work {
            Work::Sleep(millis) => {
                for _ in 0..millis {
                    ctx.check_cancelled()?;
                    thread::sleep(Duration::from_millis(1));
                }
                Ok(())
            }
            Work::Gated(gate) => {
                let _ = gate.recv();
                Ok(())
            }
            Work::Record => {
                self.ran.store(true, Ordering::SeqCst);
                Ok(())
            }
        }
    }
}

fn pool(max: usize) -> (WorkerPool<Chunked>, Arc<AtomicBool>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let ran = Arc::new(AtomicBool::new(false));
    let pool = WorkerPool::with_routine(
        WorkerPoolOptions::new(0, max).with_name("cancellation"),
        Chunked {
            ran: Arc::clone(&ran),
        },
    )
    .expect("Failed to create pool");
    (pool, ran)
}

#[test]
fn test_cancel_queued_job() {
    let (pool, ran) = pool(1);

    let (release, gate) = unbounded();
    let blocker = pool.execute(Work::Gated(gate));
    let queued = pool.execute(Work::Record);
    assert_eq!(pool.queued_count(), 1);

    queued.cancel();
    assert_eq!(pool.queued_count(), 0);

    let err = queued.wait().unwrap_err();
    assert!(err.is_cancelled());
    assert!(err.to_string().contains("manually cancelled"));

    release.send(()).unwrap();
    blocker.wait().unwrap();
    assert!(!ran.load(Ordering::SeqCst));

    // never reached a worker, so not counted
    let metrics = pool.metrics();
    assert_eq!(metrics.completed_jobs_count, 1);
    assert_eq!(metrics.failure_count, 0);
}

#[test]
fn test_cancel_before_submit() {
    let (pool, ran) = pool(2);

    let token = CancellationToken::new();
    token.cancel_with_reason(CancellationReason::Custom("request closed".into()));

    let err = pool.execute_with_token(Work::Record, token).wait().unwrap_err();
    assert!(err.is_cancelled());
    assert!(err.to_string().contains("request closed"));
    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(pool.live_worker_count(), 0);
}

#[test]
fn test_parent_token_cancels_queued_children() {
    let (pool, ran) = pool(1);

    let (release, gate) = unbounded();
    let blocker = pool.execute(Work::Gated(gate));

    let request = CancellationToken::new();
    let handles: Vec<_> = (0..4)
        .map(|_| pool.execute_with_token(Work::Record, request.child()))
        .collect();
    assert_eq!(pool.queued_count(), 4);

    request.cancel();
    assert_eq!(pool.queued_count(), 0);
    for handle in handles {
        let err = handle.wait().unwrap_err();
        assert!(matches!(
            err,
            WorkerPoolError::Cancelled { ref reason, .. } if reason == "parent was cancelled"
        ));
    }

    release.send(()).unwrap();
    blocker.wait().unwrap();
    assert!(!ran.load(Ordering::SeqCst));
}

#[test]
fn test_cancel_running_job_cooperatively() {
    let (pool, _ran) = pool(1);

    let handle = pool.execute(Work::Sleep(5_000));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(pool.busy_worker_count(), 1);

    handle.cancel();
    let err = handle.wait().unwrap_err();
    assert!(err.is_cancelled());

    // the routine bailed out, which still counts as a failed execution
    let metrics = pool.metrics();
    assert_eq!(metrics.failure_count, 1);
    assert_eq!(pool.idle_worker_count(), 1);
}

#[test]
fn test_cancel_after_completion_is_harmless() {
    let (pool, ran) = pool(1);

    let token = CancellationToken::new();
    let mut handle = pool.execute_with_token(Work::Record, token.clone());
    while handle.try_result().is_none() {
        thread::sleep(Duration::from_millis(1));
    }
    assert!(ran.load(Ordering::SeqCst));

    token.cancel();
    assert_eq!(pool.metrics().success_count, 1);
    assert_eq!(pool.queued_count(), 0);
}

#[test]
fn test_cancelling_one_job_leaves_others() {
    let (pool, _ran) = pool(1);

    let (release, gate) = unbounded();
    let blocker = pool.execute(Work::Gated(gate));
    let keep = pool.execute(Work::Sleep(1));
    let drop_me = pool.execute(Work::Sleep(1));
    let keep_too = pool.execute(Work::Sleep(1));

    drop_me.cancel();
    assert_eq!(pool.queued_count(), 2);

    release.send(()).unwrap();
    blocker.wait().unwrap();
    keep.wait().unwrap();
    keep_too.wait().unwrap();
    assert!(drop_me.wait().unwrap_err().is_cancelled());
}
