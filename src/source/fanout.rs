//! Listener registration and notification batching.
//!
//! Every source owns one fanout. Appends are coalesced per listener: full
//! `maximum_batch_size` chunks deliver immediately, a partial remainder waits
//! for the listener's `maximum_wait_time` or an explicit flush. Removals and
//! resets are never coalesced.

use crate::modification::Modification;
use crate::section::LogSourceSection;
use crate::source::SourceListener;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Identifies one registration; returned by `add_listener` and consumed by
/// `remove_listener`, so deregistration needs no listener identity
/// comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registration {
    id: ListenerId,
    listener: Box<dyn SourceListener>,
    maximum_wait_time: Duration,
    maximum_batch_size: usize,
    /// Lines this listener has been told about.
    reported: usize,
    last_delivery: Instant,
}

impl Registration {
    /// Deliver coalesced appends up to `count`. Full batches always go out;
    /// the remainder goes out when the wait time elapsed or on `force`.
    fn deliver_appends(&mut self, count: usize, force: bool) {
        while count.saturating_sub(self.reported) >= self.maximum_batch_size {
            let section = LogSourceSection::new(self.reported, self.maximum_batch_size);
            self.listener.on_modification(Modification::Appended(section));
            self.reported += self.maximum_batch_size;
            self.last_delivery = Instant::now();
        }

        let remainder = count.saturating_sub(self.reported);
        if remainder > 0 && (force || self.last_delivery.elapsed() >= self.maximum_wait_time) {
            let section = LogSourceSection::new(self.reported, remainder);
            self.listener.on_modification(Modification::Appended(section));
            self.reported = count;
            self.last_delivery = Instant::now();
        }
    }
}

struct FanoutState {
    registrations: Vec<Registration>,
    /// Current row total, as last announced via `on_read`.
    current_count: usize,
}

/// The registration point a source notifies through.
pub struct ListenerFanout {
    next_id: AtomicU64,
    state: Mutex<FanoutState>,
}

impl Default for ListenerFanout {
    fn default() -> Self {
        ListenerFanout {
            next_id: AtomicU64::new(0),
            state: Mutex::new(FanoutState {
                registrations: Vec::new(),
                current_count: 0,
            }),
        }
    }
}

impl ListenerFanout {
    pub fn new() -> Self {
        ListenerFanout::default()
    }

    /// Register a listener. It is synchronously brought up to date: `Reset`,
    /// then `Appended([0, current))` when the source already has content.
    pub fn add_listener(
        &self,
        listener: Box<dyn SourceListener>,
        maximum_wait_time: Duration,
        maximum_batch_size: usize,
    ) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut state = self.state.lock().unwrap();

        let mut registration = Registration {
            id,
            listener,
            maximum_wait_time,
            maximum_batch_size: maximum_batch_size.max(1),
            reported: 0,
            last_delivery: Instant::now(),
        };
        registration.listener.on_modification(Modification::Reset);
        let count = state.current_count;
        registration.deliver_appends(count, true);

        state.registrations.push(registration);
        id
    }

    /// Idempotent.
    pub fn remove_listener(&self, id: ListenerId) {
        let mut state = self.state.lock().unwrap();
        state.registrations.retain(|r| r.id != id);
    }

    pub fn listener_count(&self) -> usize {
        self.state.lock().unwrap().registrations.len()
    }

    /// Announce the new row total. A negative count signals reset.
    pub fn on_read(&self, count: i64) {
        let mut state = self.state.lock().unwrap();
        if count < 0 {
            state.current_count = 0;
            for registration in &mut state.registrations {
                registration.listener.on_modification(Modification::Reset);
                registration.reported = 0;
                registration.last_delivery = Instant::now();
            }
            return;
        }

        let count = count as usize;
        state.current_count = count;
        for registration in &mut state.registrations {
            registration.deliver_appends(count, false);
        }
    }

    /// All content was discarded.
    pub fn reset(&self) {
        self.on_read(-1);
    }

    /// The rows `[first_invalid, first_invalid + count)` were retracted.
    /// Delivered immediately; listeners that never heard of the retracted
    /// rows see a removal clipped to what they were told.
    pub fn remove(&self, first_invalid: usize, count: usize) {
        let mut state = self.state.lock().unwrap();
        state.current_count = state.current_count.min(first_invalid);
        log::debug!("retracting [{}, {})", first_invalid, first_invalid + count);
        for registration in &mut state.registrations {
            if registration.reported > first_invalid {
                let known = registration.reported - first_invalid;
                let section = LogSourceSection::new(first_invalid, known);
                registration.listener.on_modification(Modification::Removed(section));
                registration.reported = first_invalid;
                registration.last_delivery = Instant::now();
            }
        }
    }

    /// Push any coalesced remainder out to every listener now.
    pub fn flush(&self) {
        let mut state = self.state.lock().unwrap();
        let count = state.current_count;
        for registration in &mut state.registrations {
            registration.deliver_appends(count, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<Modification>>>;

    fn recording_listener() -> (Log, Box<dyn SourceListener>) {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let writer = log.clone();
        let listener = Box::new(move |modification| {
            writer.lock().unwrap().push(modification);
        });
        (log, listener)
    }

    fn received(log: &Log) -> Vec<Modification> {
        log.lock().unwrap().clone()
    }

    #[test]
    fn new_listener_is_brought_up_to_date() {
        let fanout = ListenerFanout::new();
        fanout.on_read(5);

        let (log, listener) = recording_listener();
        fanout.add_listener(listener, Duration::ZERO, 1000);
        assert_eq!(
            received(&log),
            vec![Modification::Reset, Modification::appended(0, 5)]
        );
    }

    #[test]
    fn empty_source_sends_only_reset_on_registration() {
        let fanout = ListenerFanout::new();
        let (log, listener) = recording_listener();
        fanout.add_listener(listener, Duration::ZERO, 1000);
        assert_eq!(received(&log), vec![Modification::Reset]);
    }

    #[test]
    fn full_batches_deliver_immediately() {
        let fanout = ListenerFanout::new();
        let (log, listener) = recording_listener();
        fanout.add_listener(listener, Duration::from_secs(3600), 10);

        fanout.on_read(25);
        // two full batches out, remainder of 5 held back by the hour wait
        assert_eq!(
            received(&log),
            vec![
                Modification::Reset,
                Modification::appended(0, 10),
                Modification::appended(10, 10),
            ]
        );

        fanout.flush();
        assert_eq!(
            received(&log).last(),
            Some(&Modification::appended(20, 5))
        );
    }

    #[test]
    fn zero_wait_time_delivers_remainder_immediately() {
        let fanout = ListenerFanout::new();
        let (log, listener) = recording_listener();
        fanout.add_listener(listener, Duration::ZERO, 10);

        fanout.on_read(3);
        assert_eq!(
            received(&log),
            vec![Modification::Reset, Modification::appended(0, 3)]
        );
    }

    #[test]
    fn on_read_is_cumulative_not_incremental() {
        let fanout = ListenerFanout::new();
        let (log, listener) = recording_listener();
        fanout.add_listener(listener, Duration::ZERO, 1000);

        fanout.on_read(2);
        fanout.on_read(6);
        assert_eq!(
            received(&log),
            vec![
                Modification::Reset,
                Modification::appended(0, 2),
                Modification::appended(2, 4),
            ]
        );
    }

    #[test]
    fn redundant_on_read_is_silent() {
        let fanout = ListenerFanout::new();
        let (log, listener) = recording_listener();
        fanout.add_listener(listener, Duration::ZERO, 1000);

        fanout.on_read(4);
        let seen = received(&log).len();
        fanout.on_read(4);
        fanout.flush();
        assert_eq!(received(&log).len(), seen);
    }

    #[test]
    fn reset_is_on_read_minus_one() {
        let fanout = ListenerFanout::new();
        let (log, listener) = recording_listener();
        fanout.add_listener(listener, Duration::ZERO, 1000);

        fanout.on_read(4);
        fanout.on_read(-1);
        assert_eq!(received(&log).last(), Some(&Modification::Reset));

        // content after the reset is announced from zero again
        fanout.on_read(2);
        assert_eq!(received(&log).last(), Some(&Modification::appended(0, 2)));
    }

    #[test]
    fn remove_delivers_immediately_and_rewinds() {
        let fanout = ListenerFanout::new();
        let (log, listener) = recording_listener();
        fanout.add_listener(listener, Duration::ZERO, 1000);

        fanout.on_read(100);
        fanout.remove(40, 60);
        assert_eq!(received(&log).last(), Some(&Modification::removed(40, 60)));

        // rows re-announced after the rewind
        fanout.on_read(50);
        assert_eq!(received(&log).last(), Some(&Modification::appended(40, 10)));
    }

    #[test]
    fn remove_is_clipped_to_what_the_listener_knows() {
        let fanout = ListenerFanout::new();
        let (log, listener) = recording_listener();
        // batch 10, long wait: listener knows about 0..10 only
        fanout.add_listener(listener, Duration::from_secs(3600), 10);
        fanout.on_read(14);
        assert_eq!(received(&log).last(), Some(&Modification::appended(0, 10)));

        fanout.remove(4, 10);
        assert_eq!(received(&log).last(), Some(&Modification::removed(4, 6)));
    }

    #[test]
    fn remove_below_reported_watermark_is_skipped() {
        let fanout = ListenerFanout::new();
        let (log, listener) = recording_listener();
        fanout.add_listener(listener, Duration::from_secs(3600), 1000);
        fanout.on_read(5); // nothing delivered, batch not full

        fanout.remove(2, 3);
        assert_eq!(received(&log), vec![Modification::Reset]);
    }

    #[test]
    fn remove_listener_is_idempotent() {
        let fanout = ListenerFanout::new();
        let (log, listener) = recording_listener();
        let id = fanout.add_listener(listener, Duration::ZERO, 1000);
        fanout.remove_listener(id);
        fanout.remove_listener(id);
        assert_eq!(fanout.listener_count(), 0);

        fanout.on_read(5);
        assert_eq!(received(&log), vec![Modification::Reset]);
    }

    #[test]
    fn listeners_have_independent_batching() {
        let fanout = ListenerFanout::new();
        let (coarse_log, coarse) = recording_listener();
        let (fine_log, fine) = recording_listener();
        fanout.add_listener(coarse, Duration::from_secs(3600), 100);
        fanout.add_listener(fine, Duration::ZERO, 1);

        fanout.on_read(3);
        assert_eq!(received(&coarse_log), vec![Modification::Reset]);
        assert_eq!(
            received(&fine_log),
            vec![
                Modification::Reset,
                Modification::appended(0, 1),
                Modification::appended(1, 1),
                Modification::appended(2, 1),
            ]
        );
    }
}
