//! Wall-clock and timer abstractions the flow needs from its host.
//!
//! Timer bookkeeping here is a direct generalization of the teacher's
//! `EventLoop` timer list: a flat `Vec` of deadlines polled on each tick
//! rather than a callback-pushing push model, so tests can drive it with a
//! [`ManualClock`] instead of real time.

use std::cell::RefCell;
use std::time::{Duration, Instant};

/// A source of wall-clock time.
pub trait Clock {
    fn now(&self) -> Instant;
}

/// The real system clock.
#[derive(Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only advances when told to, for deterministic tests.
pub struct ManualClock {
    now: RefCell<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: RefCell::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.borrow_mut();
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.borrow()
    }
}

struct TimerEntry {
    id: u64,
    fire_at: Instant,
    callback: Option<Box<dyn FnOnce()>>,
}

/// A flat list of pending one-shot timers, polled by deadline.
#[derive(Default)]
pub(crate) struct Timers {
    entries: Vec<TimerEntry>,
    next_id: u64,
}

impl Timers {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 1,
        }
    }

    pub fn schedule_at(&mut self, fire_at: Instant, callback: Box<dyn FnOnce()>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(TimerEntry {
            id,
            fire_at,
            callback: Some(callback),
        });
        id
    }

    pub fn cancel(&mut self, id: u64) {
        self.entries.retain(|t| t.id != id);
    }

    /// Removes and returns the callbacks of every timer whose deadline has
    /// passed as of `now`.
    pub fn fire_due(&mut self, now: Instant) -> Vec<Box<dyn FnOnce()>> {
        let mut fired = Vec::new();
        let mut kept = Vec::new();
        for mut entry in self.entries.drain(..) {
            if entry.fire_at <= now {
                fired.push(entry.callback.take().expect("timer fired twice"));
            } else {
                kept.push(entry);
            }
        }
        self.entries = kept;
        fired
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().map(|t| t.fire_at).min()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_only_due_timers() {
        let mut timers = Timers::new();
        let base = Instant::now();
        timers.schedule_at(base + Duration::from_millis(100), Box::new(|| {}));
        assert!(timers.fire_due(base + Duration::from_millis(50)).is_empty());
        assert_eq!(timers.fire_due(base + Duration::from_millis(100)).len(), 1);
    }

    #[test]
    fn cancel_removes_timer() {
        let mut timers = Timers::new();
        let base = Instant::now();
        let id = timers.schedule_at(base + Duration::from_millis(10), Box::new(|| {}));
        timers.cancel(id);
        assert!(timers.fire_due(base + Duration::from_millis(10)).is_empty());
    }

    #[test]
    fn manual_clock_only_moves_on_advance() {
        let clock = ManualClock::new();
        let t0 = clock.now();
        assert_eq!(clock.now(), t0);
        clock.advance(Duration::from_millis(5));
        assert_eq!(clock.now(), t0 + Duration::from_millis(5));
    }
}
