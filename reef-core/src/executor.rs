//! Bounded worker pool with lazy thread creation and idle retirement.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use tracing::warn;

use reef_common::config::PoolLimits;

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolState {
    /// Accepting and executing tasks.
    Running,
    /// No new tasks; threads exit once the queue drains.
    Draining,
    /// No new tasks; threads exit after their current task.
    Stopped,
}

impl Default for PoolState {
    fn default() -> Self {
        Self::Running
    }
}

#[derive(Default)]
struct PoolInner {
    queue: VecDeque<Task>,
    live_threads: usize,
    idle_threads: usize,
    state: PoolState,
}

struct PoolShared {
    limits: PoolLimits,
    idle_timeout: Duration,
    inner: Mutex<PoolInner>,
    task_available: Condvar,
    all_exited: Condvar,
}

/// Bounded task-execution service backing the thread-per-connection scheduler.
///
/// Threads are created lazily up to the configured maximum when a submitted task finds no idle
/// capacity; threads above the warm floor retire themselves after the idle timeout. The pending
/// queue is bounded, so saturation surfaces as a rejected `submit` instead of unbounded
/// queueing.
pub struct Executor {
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("Executor");
        let _ = debug.field("limits", &self.shared.limits);
        if let Ok(inner) = self.shared.inner.lock() {
            let _ = debug
                .field("live_threads", &inner.live_threads)
                .field("idle_threads", &inner.idle_threads)
                .field("queued_tasks", &inner.queue.len())
                .field("state", &inner.state);
        }
        debug.finish()
    }
}

impl Executor {
    /// Creates the pool and spawns the warm thread floor.
    #[must_use]
    pub fn new(limits: PoolLimits, idle_timeout: Duration) -> Self {
        let shared = Arc::new(PoolShared {
            limits,
            idle_timeout,
            inner: Mutex::new(PoolInner::default()),
            task_available: Condvar::new(),
            all_exited: Condvar::new(),
        });

        if let Ok(mut inner) = shared.inner.lock() {
            for _ in 0..limits.min_threads() {
                inner.live_threads += 1;
                spawn_worker(Arc::clone(&shared));
            }
        }

        Self { shared }
    }

    /// Submits one unit of work.
    ///
    /// Returns `false` when the pool is stopped, or when the pending queue is at capacity and
    /// the live thread count is already at the maximum; the rejected task is dropped, leaving
    /// any resources it owns (such as an accepted socket) to be released by that drop.
    pub fn submit<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let Ok(mut inner) = self.shared.inner.lock() else {
            return false;
        };
        if inner.state != PoolState::Running {
            return false;
        }
        if inner.queue.len() >= self.shared.limits.queue_capacity()
            && inner.live_threads >= self.shared.limits.max_threads()
        {
            return false;
        }

        if inner.idle_threads == 0 && inner.live_threads < self.shared.limits.max_threads() {
            inner.live_threads += 1;
            spawn_worker(Arc::clone(&self.shared));
        }
        inner.queue.push_back(Box::new(task));
        self.shared.task_available.notify_one();
        true
    }

    /// Signals all threads to exit and blocks until they have.
    ///
    /// With `wait_for_completion` the queue is drained first; without it, queued tasks are
    /// dropped and threads exit after their current task. Subsequent `submit` calls fail.
    /// Idempotent.
    pub fn stop(&self, wait_for_completion: bool) {
        let Ok(mut inner) = self.shared.inner.lock() else {
            return;
        };
        if wait_for_completion {
            if inner.state == PoolState::Running {
                inner.state = PoolState::Draining;
            }
        } else {
            inner.state = PoolState::Stopped;
            inner.queue.clear();
        }
        self.shared.task_available.notify_all();

        while inner.live_threads > 0 {
            let Ok(guard) = self.shared.all_exited.wait(inner) else {
                return;
            };
            inner = guard;
        }
    }

    #[cfg(test)]
    fn live_threads(&self) -> usize {
        self.shared
            .inner
            .lock()
            .map(|inner| inner.live_threads)
            .unwrap_or(0)
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.stop(false);
    }
}

fn spawn_worker(shared: Arc<PoolShared>) {
    let _ = thread::spawn(move || worker_loop(&shared));
}

fn worker_loop(shared: &PoolShared) {
    while let Some(task) = next_task(shared) {
        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            warn!("pool task panicked; worker thread continues");
        }
    }

    if let Ok(mut inner) = shared.inner.lock() {
        inner.live_threads = inner.live_threads.saturating_sub(1);
        if inner.live_threads == 0 {
            shared.all_exited.notify_all();
        }
    }
}

/// Blocks until a task is available, the pool stops, or this thread should retire.
fn next_task(shared: &PoolShared) -> Option<Task> {
    let mut inner = shared.inner.lock().ok()?;
    loop {
        if let Some(task) = inner.queue.pop_front() {
            return Some(task);
        }
        match inner.state {
            PoolState::Running => {}
            PoolState::Draining | PoolState::Stopped => return None,
        }

        inner.idle_threads += 1;
        let (guard, wait_result) = shared
            .task_available
            .wait_timeout(inner, shared.idle_timeout)
            .ok()?;
        inner = guard;
        inner.idle_threads -= 1;

        // Threads at or below the warm floor wait again; the rest retire once idle long
        // enough with nothing queued.
        if wait_result.timed_out()
            && inner.queue.is_empty()
            && inner.state == PoolState::Running
            && inner.live_threads > shared.limits.min_threads()
        {
            return None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Executor;
    use googletest::prelude::*;
    use reef_common::config::PoolLimits;
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn limits(min: usize, max: usize, queue: usize) -> PoolLimits {
        PoolLimits::new(min, max, queue).expect("test limits should be valid")
    }

    #[rstest]
    fn warm_floor_is_spawned_eagerly() {
        let executor = Executor::new(limits(2, 4, 4), Duration::from_millis(50));
        assert_that!(executor.live_threads(), eq(2));
        executor.stop(true);
    }

    #[rstest]
    fn submitted_tasks_run_to_completion_before_stop_returns() {
        let executor = Executor::new(limits(0, 2, 16), Duration::from_millis(50));
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            let accepted = executor.submit(move || {
                let _ = counter.fetch_add(1, Ordering::SeqCst);
            });
            assert_that!(accepted, eq(true));
        }

        executor.stop(true);
        assert_that!(counter.load(Ordering::SeqCst), eq(8));
    }

    #[rstest]
    fn saturation_rejects_instead_of_queueing_unboundedly() {
        let executor = Executor::new(limits(0, 1, 1), Duration::from_millis(200));
        let (release, gate) = mpsc::channel::<()>();

        // Occupies the single thread until released.
        let accepted = executor.submit(move || {
            let _ = gate.recv();
        });
        assert_that!(accepted, eq(true));

        // Give the worker a moment to pick the blocking task up, then fill the queue.
        let deadline = Instant::now() + Duration::from_millis(500);
        while Instant::now() < deadline {
            let queue_holds_one = executor.submit(|| {});
            if queue_holds_one {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        let mut saw_rejection = false;
        for _ in 0..4 {
            if !executor.submit(|| {}) {
                saw_rejection = true;
                break;
            }
        }
        assert_that!(saw_rejection, eq(true));

        release.send(()).expect("worker should still be alive");
        executor.stop(true);
    }

    #[rstest]
    fn idle_threads_above_the_floor_retire() {
        let executor = Executor::new(limits(1, 3, 8), Duration::from_millis(30));
        let (release, gate) = mpsc::channel::<()>();
        let gate = Arc::new(std::sync::Mutex::new(gate));

        for _ in 0..3 {
            let gate = Arc::clone(&gate);
            let accepted = executor.submit(move || {
                if let Ok(receiver) = gate.lock() {
                    let _ = receiver.recv_timeout(Duration::from_millis(200));
                }
            });
            assert_that!(accepted, eq(true));
        }
        drop(release);

        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if executor.live_threads() == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_that!(executor.live_threads(), eq(1));
        executor.stop(true);
    }

    #[rstest]
    fn submit_after_stop_is_rejected() {
        let executor = Executor::new(limits(0, 2, 4), Duration::from_millis(50));
        executor.stop(true);
        assert_that!(executor.submit(|| {}), eq(false));
    }

    #[rstest]
    fn stop_is_idempotent() {
        let executor = Executor::new(limits(1, 2, 4), Duration::from_millis(50));
        executor.stop(true);
        executor.stop(true);
        executor.stop(false);
        assert_that!(executor.live_threads(), eq(0));
    }
}
