//! Cooperative scheduling for pipeline stages.
//!
//! Each stage occupies one periodic task; the task's callback returns the
//! minimum delay before its next invocation (zero means "run me again now").
//! [`ThreadScheduler`] backs every task with a worker thread;
//! [`ManualTaskScheduler`] only runs tasks when told to, which makes stage
//! behavior deterministic under test.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

/// A token for cooperative cancellation of long-running work.
///
/// Cloning creates another handle to the same state; when any handle calls
/// `cancel()`, every handle observes `is_cancelled() == true`. The work being
/// cancelled must poll cooperatively.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    /// Request cancellation. Non-blocking.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Handle to a scheduled periodic task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeriodicTaskId(u64);

/// A repeating task body. Returns the minimum delay before the next run.
pub type PeriodicCallback = Box<dyn FnMut() -> Duration + Send>;

/// The scheduling capability pipeline stages consume.
pub trait TaskScheduler: Send + Sync {
    /// Enqueue a repeating task under a diagnostic name.
    fn start_periodic(&self, name: &str, callback: PeriodicCallback) -> PeriodicTaskId;

    /// Stop a task. Idempotent; a running invocation finishes first.
    fn stop(&self, id: PeriodicTaskId);
}

struct TaskControl {
    stopped: Mutex<bool>,
    wakeup: Condvar,
}

/// One worker thread per task. Stopping signals the worker and returns
/// without joining; the worker exits at its next wakeup.
#[derive(Default)]
pub struct ThreadScheduler {
    next_id: AtomicU64,
    tasks: Mutex<HashMap<PeriodicTaskId, Arc<TaskControl>>>,
}

impl ThreadScheduler {
    pub fn new() -> Self {
        ThreadScheduler::default()
    }
}

impl TaskScheduler for ThreadScheduler {
    fn start_periodic(&self, name: &str, mut callback: PeriodicCallback) -> PeriodicTaskId {
        let id = PeriodicTaskId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let control = Arc::new(TaskControl {
            stopped: Mutex::new(false),
            wakeup: Condvar::new(),
        });
        self.tasks.lock().unwrap().insert(id, control.clone());

        let task_name = name.to_string();
        thread::spawn(move || {
            log::debug!("periodic task '{}' started", task_name);
            loop {
                if *control.stopped.lock().unwrap() {
                    break;
                }
                let delay = callback();

                let mut stopped = control.stopped.lock().unwrap();
                if *stopped {
                    break;
                }
                if !delay.is_zero() {
                    let (guard, _) = control
                        .wakeup
                        .wait_timeout(stopped, delay)
                        .unwrap();
                    stopped = guard;
                    if *stopped {
                        break;
                    }
                }
            }
            log::debug!("periodic task '{}' stopped", task_name);
        });

        id
    }

    fn stop(&self, id: PeriodicTaskId) {
        let control = self.tasks.lock().unwrap().remove(&id);
        if let Some(control) = control {
            *control.stopped.lock().unwrap() = true;
            control.wakeup.notify_all();
        }
    }
}

/// A scheduler that runs tasks only when asked to.
#[derive(Default)]
pub struct ManualTaskScheduler {
    next_id: AtomicU64,
    tasks: Mutex<Vec<(PeriodicTaskId, PeriodicCallback)>>,
    stopped: Mutex<HashSet<PeriodicTaskId>>,
}

impl ManualTaskScheduler {
    pub fn new() -> Self {
        ManualTaskScheduler::default()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    /// Run every scheduled task once. Returns how many ran.
    pub fn run_pending_tasks(&self) -> usize {
        self.run_round().0
    }

    /// Run tasks repeatedly until none of them asks for an immediate re-run
    /// (or the round limit is hit, so a misbehaving task cannot hang a test).
    pub fn run_until_idle(&self) -> usize {
        let mut total = 0;
        for _ in 0..1000 {
            let (ran, want_more) = self.run_round();
            total += ran;
            if ran == 0 || !want_more {
                return total;
            }
        }
        total
    }

    fn run_round(&self) -> (usize, bool) {
        // Tasks run outside the lock so a callback may call back into the
        // scheduler (stages stop their own task on disposal).
        let mut tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        let mut ran = 0;
        let mut want_more = false;
        for (id, callback) in &mut tasks {
            if self.stopped.lock().unwrap().contains(id) {
                continue;
            }
            let delay = callback();
            ran += 1;
            if delay.is_zero() {
                want_more = true;
            }
        }

        {
            let mut stopped = self.stopped.lock().unwrap();
            tasks.retain(|(id, _)| !stopped.remove(id));
        }
        let mut stored = self.tasks.lock().unwrap();
        // Tasks scheduled while running land behind the survivors.
        tasks.append(&mut *stored);
        *stored = tasks;
        (ran, want_more)
    }
}

impl TaskScheduler for ManualTaskScheduler {
    fn start_periodic(&self, _name: &str, callback: PeriodicCallback) -> PeriodicTaskId {
        let id = PeriodicTaskId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.tasks.lock().unwrap().push((id, callback));
        id
    }

    fn stop(&self, id: PeriodicTaskId) {
        let removed = {
            let mut tasks = self.tasks.lock().unwrap();
            let before = tasks.len();
            tasks.retain(|(task_id, _)| *task_id != id);
            tasks.len() != before
        };
        if !removed {
            // Task is out on loan to run_round; flag it for removal there.
            self.stopped.lock().unwrap().insert(id);
        }
    }
}
