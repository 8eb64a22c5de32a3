//! Derived log sources: the multi-line grouper and the filtering stage.
//!
//! Both stages share the same skeleton ([`StageCore`]): they subscribe to
//! their upstream source through a forwarding listener that only enqueues,
//! and a periodic scheduler task drains the queue and advances a watermark
//! through the source. Everything a query thread reads sits behind one
//! mutex per stage; the in-progress entry state is task-local.

pub mod filtered;
pub mod multiline;

pub use filtered::FilteredLogSource;
pub use multiline::MultiLineGrouper;

use crate::config::PipelineConfig;
use crate::modification::Modification;
use crate::property::{Property, PropertyBag, PropertyValue};
use crate::scheduler::{CancelToken, PeriodicTaskId, TaskScheduler};
use crate::source::{ListenerFanout, ListenerId, LogSource};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// A stage's progress over its source: `source_progress × processed/total`,
/// clamped to `[0, 1]` and defined as 1 when there is nothing to process.
pub(crate) fn progress(source_progress: f64, processed: usize, total: usize) -> f64 {
    if total == 0 {
        return 1.0;
    }
    (source_progress * processed as f64 / total as f64).clamp(0.0, 1.0)
}

/// What both derived sources implement; `StageCore` drives it.
pub(crate) trait PipelineStage: Send + Sync {
    fn core(&self) -> &StageCore;

    /// One scheduler tick. Returns the minimum delay before the next tick;
    /// zero requests immediate rescheduling.
    fn run_once(&self, cancel: &CancelToken) -> Duration;
}

struct Intake {
    receiver: Receiver<Modification>,
    /// Modifications taken off the channel but deferred (batch budget ran
    /// out mid-append). Consumed before the channel.
    holdback: VecDeque<Modification>,
}

/// The boilerplate every derived source shares: source subscription,
/// modification intake, listener fanout, property snapshot, scheduler task
/// and disposal.
pub(crate) struct StageCore {
    source: Arc<dyn LogSource>,
    scheduler: Arc<dyn TaskScheduler>,
    config: PipelineConfig,
    fanout: ListenerFanout,
    cancel: CancelToken,
    disposed: AtomicBool,
    caught_up: AtomicBool,
    registration: ListenerId,
    task: Mutex<Option<PeriodicTaskId>>,
    intake: Mutex<Intake>,
    properties: Mutex<PropertyBag>,
}

impl StageCore {
    /// Subscribe to `source` and prepare the intake queue. The stage is not
    /// ticking yet; call [`start_stage`] once it sits in an `Arc`.
    pub(crate) fn new(
        source: Arc<dyn LogSource>,
        scheduler: Arc<dyn TaskScheduler>,
        config: PipelineConfig,
    ) -> StageCore {
        let (sender, receiver) = mpsc::channel();
        let registration = source.add_listener(
            Box::new(move |modification| {
                // Callbacks must not block: enqueue and return.
                let _ = sender.send(modification);
            }),
            config.maximum_wait_time(),
            config.stage_batch_size,
        );

        StageCore {
            source,
            scheduler,
            config,
            fanout: ListenerFanout::new(),
            cancel: CancelToken::new(),
            disposed: AtomicBool::new(false),
            caught_up: AtomicBool::new(false),
            registration,
            task: Mutex::new(None),
            intake: Mutex::new(Intake {
                receiver,
                holdback: VecDeque::new(),
            }),
            properties: Mutex::new(PropertyBag::new()),
        }
    }

    pub(crate) fn source(&self) -> &Arc<dyn LogSource> {
        &self.source
    }

    pub(crate) fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub(crate) fn fanout(&self) -> &ListenerFanout {
        &self.fanout
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// The idle delay between ticks when no work remains.
    pub(crate) fn idle_delay(&self) -> Duration {
        self.config.maximum_wait_time()
    }

    /// Next queued modification, FIFO across holdback and channel.
    pub(crate) fn next_modification(&self) -> Option<Modification> {
        let mut intake = self.intake.lock().unwrap();
        if let Some(modification) = intake.holdback.pop_front() {
            return Some(modification);
        }
        intake.receiver.try_recv().ok()
    }

    /// Put a modification back at the head of the queue (unfinished work).
    pub(crate) fn requeue_front(&self, modification: Modification) {
        self.intake
            .lock()
            .unwrap()
            .holdback
            .push_front(modification);
    }

    pub(crate) fn has_pending_modifications(&self) -> bool {
        let mut intake = self.intake.lock().unwrap();
        if !intake.holdback.is_empty() {
            return true;
        }
        match intake.receiver.try_recv() {
            Ok(modification) => {
                intake.holdback.push_back(modification);
                true
            }
            Err(_) => false,
        }
    }

    /// Atomically publish a new property snapshot. Must happen before the
    /// notification that makes listeners look at it.
    pub(crate) fn publish_properties(&self, snapshot: PropertyBag) {
        *self.properties.lock().unwrap() = snapshot;
    }

    /// Stage-owned value, falling through to the source for ancestor
    /// properties the stage does not compute itself.
    pub(crate) fn property(&self, property: Property) -> PropertyValue {
        if self.is_disposed() {
            return property.default_value();
        }
        let own = self.properties.lock().unwrap();
        if own.contains(property) {
            own.get(property)
        } else {
            drop(own);
            self.source.get_property(property)
        }
    }

    pub(crate) fn read_properties(&self, destination: &mut PropertyBag) {
        if self.is_disposed() {
            return;
        }
        self.properties.lock().unwrap().copy_into(destination);
    }

    /// Emit a `Flush` exactly once whenever the stage crosses into the
    /// fully-caught-up state; re-arm as soon as it falls behind again.
    pub(crate) fn flush_on_catch_up(&self, fully_processed: bool) {
        if fully_processed {
            if !self.caught_up.swap(true, Ordering::SeqCst) {
                self.fanout.flush();
            }
        } else {
            self.caught_up.store(false, Ordering::SeqCst);
        }
    }

    /// Tear down the shared plumbing. Returns true the first time, so the
    /// owning stage knows to release its own buffers.
    pub(crate) fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cancel.cancel();
        self.source.remove_listener(self.registration);
        if let Some(task) = self.task.lock().unwrap().take() {
            self.scheduler.stop(task);
        }
        self.properties.lock().unwrap().clear();
        true
    }
}

/// Enqueue the stage's periodic task. Called once, right after the stage is
/// wrapped in its `Arc`.
pub(crate) fn start_stage<S>(stage: &Arc<S>, name: &str)
where
    S: PipelineStage + 'static,
{
    let weak: Weak<S> = Arc::downgrade(stage);
    let cancel = stage.core().cancel.clone();
    let idle = stage.core().idle_delay();

    let task = stage.core().scheduler.start_periodic(
        name,
        Box::new(move || {
            if cancel.is_cancelled() {
                return idle;
            }
            match weak.upgrade() {
                Some(stage) => stage.run_once(&cancel),
                None => idle,
            }
        }),
    );
    *stage.core().task.lock().unwrap() = Some(task);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_one_with_empty_denominator() {
        assert_eq!(progress(0.0, 0, 0), 1.0);
        assert_eq!(progress(1.0, 5, 0), 1.0);
    }

    #[test]
    fn progress_scales_by_source_progress() {
        assert_eq!(progress(1.0, 50, 100), 0.5);
        assert_eq!(progress(0.5, 100, 100), 0.5);
        assert_eq!(progress(0.5, 50, 100), 0.25);
    }

    #[test]
    fn progress_is_clamped() {
        assert_eq!(progress(1.0, 200, 100), 1.0);
        assert_eq!(progress(-1.0, 50, 100), 0.0);
    }
}
