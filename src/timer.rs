//! Timeout wheel: schedule, cancel, and fire one-shot delayed callbacks.
//!
//! Grounded on `original_source/include/libnetworkd/TimeoutManager.hpp` +
//! `src/TimeoutManager.cpp`. The original orders timeouts in a
//! `std::multiset` keyed by fire time and guards re-entrant cancellation
//! during `fireTimeouts()` with a "locked" iterator that `dropTimeout`/
//! `dropReceiver` skip over. This rewrite gets the same safety without a
//! lock flag: due entries are snapshotted once, then each is removed from
//! the live table *before* its callback runs, so a callback that cancels a
//! handle later in the same batch just finds it already gone.
//!
//! As with [`crate::reactor::Reactor`], the spec's own redesign guidance
//! (§9 "Back-pointers inside callbacks") calls for an owning,
//! generation-indexed table in place of the original's raw `Timeout`
//! (`void *`) identity, hence `slab::Slab` + [`TimerHandle`].
//!
//! [`TimerWheel::fire_due`] is only re-entrant for a bare `&mut TimerWheel`:
//! a callback holding that same `&mut` borrow cannot call back into it
//! anyway, so "remove before calling" is enough. The wheel is normally kept
//! behind `Rc<RefCell<TimerWheel>>` so other components (the async DNS
//! resolver, application code) can hold their own handle to it; a callback
//! that reaches back through *that* handle during `fire_due` would try to
//! `borrow_mut` a `RefCell` already mutably borrowed by the `fire_due` call
//! itself and panic. [`TimerWheel::fire_due_shared`] is the re-entrant path
//! for that shape: it only holds the `RefCell` borrow for the span of
//! popping one due entry, dropping it before invoking that entry's
//! callback, so the callback is free to `cancel`/`schedule` through the same
//! `Rc<RefCell<TimerWheel>>` (SPEC_FULL.md §5 "Cancellation", §8 scenario 6).

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;
use std::time::{Duration, Instant};

use slab::Slab;
use tracing::trace;

/// Opaque handle to a scheduled timeout, returned by [`TimerWheel::schedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(usize);

struct Entry {
    fire_at: Instant,
    seq: u64,
    owner: Option<u64>,
    callback: Option<Box<dyn FnOnce()>>,
}

/// Single-threaded, one-shot timeout scheduler.
///
/// There is one wheel per runtime, typically shared via `Rc<RefCell<..>>`
/// with anything that needs to arm its own timeouts (the async DNS resolver,
/// the stream socket engine's connect-timeout, SOCKS5 negotiation deadlines).
pub struct TimerWheel {
    table: Slab<Entry>,
    // (fire_at, insertion sequence, slab key) kept in lockstep with `table`
    // so firing order is deterministic even when two timers share a
    // deadline.
    order: BTreeSet<(Instant, u64, usize)>,
    next_seq: u64,
}

impl TimerWheel {
    pub fn new() -> TimerWheel {
        TimerWheel {
            table: Slab::new(),
            order: BTreeSet::new(),
            next_seq: 0,
        }
    }

    /// Schedule `callback` to run once, no earlier than `delay` from now.
    ///
    /// `owner` is an optional caller-chosen tag (e.g. a socket or query
    /// handle cast to `u64`) letting [`TimerWheel::cancel_owner`] sweep every
    /// timeout belonging to one logical owner at once, the equivalent of the
    /// original's `dropReceiver`.
    pub fn schedule<F>(&mut self, delay: Duration, owner: Option<u64>, callback: F) -> TimerHandle
    where
        F: FnOnce() + 'static,
    {
        let fire_at = Instant::now() + delay;
        let seq = self.next_seq;
        self.next_seq += 1;

        let key = self.table.insert(Entry {
            fire_at,
            seq,
            owner,
            callback: Some(Box::new(callback)),
        });
        self.order.insert((fire_at, seq, key));

        TimerHandle(key)
    }

    /// Cancel a single timeout. Returns `false` if it already fired or was
    /// never valid (stale handle, or a handle for a timeout cancelled twice).
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        match self.table.try_remove(handle.0) {
            Some(entry) => {
                self.order.remove(&(entry.fire_at, entry.seq, handle.0));
                true
            }
            None => false,
        }
    }

    /// Cancel every still-pending timeout tagged with `owner`.
    pub fn cancel_owner(&mut self, owner: u64) {
        let keys: Vec<usize> = self
            .table
            .iter()
            .filter(|(_, entry)| entry.owner == Some(owner))
            .map(|(key, _)| key)
            .collect();

        for key in keys {
            if let Some(entry) = self.table.try_remove(key) {
                self.order.remove(&(entry.fire_at, entry.seq, key));
            }
        }
    }

    pub fn is_pending(&self, handle: TimerHandle) -> bool {
        self.table.contains(handle.0)
    }

    /// Time until the next scheduled fire, or `None` if nothing is pending.
    /// Used to bound the reactor's next `poll(2)` wait.
    pub fn next_delta(&self) -> Option<Duration> {
        self.order
            .iter()
            .next()
            .map(|(fire_at, _, _)| fire_at.saturating_duration_since(Instant::now()))
    }

    /// Run every callback whose deadline has passed.
    ///
    /// Re-entrancy safe against a bare `&mut self`: a callback may schedule
    /// new timeouts, or cancel any handle including ones later in this same
    /// batch, without corrupting the in-progress sweep, because each due
    /// entry is removed from the table *before* its callback runs. This does
    /// NOT cover a callback reaching back into the *same* wheel through its
    /// own `Rc<RefCell<TimerWheel>>` handle, since that handle is already
    /// mutably borrowed for the duration of this call — see
    /// [`TimerWheel::fire_due_shared`] for that shape.
    pub fn fire_due(&mut self) {
        let now = Instant::now();
        let due: Vec<(Instant, u64, usize)> = self
            .order
            .range(..=(now, u64::MAX, usize::MAX))
            .cloned()
            .collect();

        for key_tuple in due {
            if !self.order.remove(&key_tuple) {
                // already cancelled by an earlier callback in this batch.
                continue;
            }

            let (_, _, key) = key_tuple;
            if let Some(mut entry) = self.table.try_remove(key) {
                if let Some(callback) = entry.callback.take() {
                    trace!(timer = key, "firing timer");
                    callback();
                }
            }
        }
    }

    /// Pop and remove a single due entry's callback, or `None` if nothing is
    /// due yet. Holds no borrow past the return, so the caller can invoke
    /// the callback after dropping its own borrow of `wheel`.
    fn pop_one_due(&mut self) -> Option<Box<dyn FnOnce()>> {
        let now = Instant::now();
        let key_tuple = self.order.range(..=(now, u64::MAX, usize::MAX)).next().copied()?;
        self.order.remove(&key_tuple);

        let (_, _, key) = key_tuple;
        trace!(timer = key, "firing timer");
        self.table.try_remove(key)?.callback.take()
    }

    /// Re-entrant equivalent of [`TimerWheel::fire_due`] for a wheel shared
    /// as `Rc<RefCell<TimerWheel>>`: borrows `wheel` only long enough to pop
    /// one due entry at a time, dropping the borrow before running that
    /// entry's callback. A callback is therefore free to `cancel`,
    /// `cancel_owner`, or `schedule` through its own clone of the same
    /// `Rc<RefCell<TimerWheel>>` without hitting a `BorrowMutError`.
    pub fn fire_due_shared(wheel: &Rc<RefCell<TimerWheel>>) {
        loop {
            let callback = wheel.borrow_mut().pop_one_due();
            match callback {
                Some(callback) => callback(),
                None => break,
            }
        }
    }
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn fires_only_due_timers_in_order() {
        let mut wheel = TimerWheel::new();
        let fired = Rc::new(RefCell::new(Vec::new()));

        let f1 = fired.clone();
        wheel.schedule(Duration::from_millis(0), None, move || f1.borrow_mut().push(1));
        let f2 = fired.clone();
        wheel.schedule(Duration::from_millis(200), None, move || f2.borrow_mut().push(2));

        wheel.fire_due();
        assert_eq!(*fired.borrow(), vec![1]);

        wheel.fire_due();
        assert_eq!(*fired.borrow(), vec![1], "second timer not due yet");
    }

    #[test]
    fn cancel_during_fire_skips_later_due_entry() {
        // Exercises spec scenario 6 ("a timer callback cancels another
        // due-but-not-yet-fired timer") through the wheel's normal shared
        // shape, `Rc<RefCell<TimerWheel>>`. The canceller must be scheduled
        // *before* the victim (lower sequence number) so it fires first in
        // this same batch, and it must cancel through `fire_due_shared`
        // rather than `fire_due` — `fire_due` holds the `RefCell` borrow for
        // its whole call, so a callback re-entering the same `RefCell` would
        // panic with a `BorrowMutError`.
        let wheel_cell = Rc::new(RefCell::new(TimerWheel::new()));
        let fired = Rc::new(RefCell::new(Vec::new()));

        let victim_handle = Rc::new(RefCell::new(None));
        let handle_for_cb = victim_handle.clone();
        let wheel_for_cb = wheel_cell.clone();
        wheel_cell.borrow_mut().schedule(Duration::from_millis(0), None, move || {
            if let Some(h) = handle_for_cb.borrow_mut().take() {
                wheel_for_cb.borrow_mut().cancel(h);
            }
        });

        let f2 = fired.clone();
        let victim = wheel_cell.borrow_mut().schedule(Duration::from_millis(0), None, move || {
            f2.borrow_mut().push(2);
        });
        *victim_handle.borrow_mut() = Some(victim);

        TimerWheel::fire_due_shared(&wheel_cell);
        assert!(fired.borrow().is_empty(), "cancelled sibling must not fire");
    }

    #[test]
    fn cancel_owner_sweeps_all_its_timeouts() {
        let mut wheel = TimerWheel::new();
        let fired = Rc::new(RefCell::new(0u32));

        for _ in 0..3 {
            let f = fired.clone();
            wheel.schedule(Duration::from_millis(0), Some(7), move || {
                *f.borrow_mut() += 1;
            });
        }
        let other = fired.clone();
        wheel.schedule(Duration::from_millis(0), Some(9), move || {
            *other.borrow_mut() += 100;
        });

        wheel.cancel_owner(7);
        wheel.fire_due();
        assert_eq!(*fired.borrow(), 100);
    }

    #[test]
    fn next_delta_reflects_closest_pending_timer() {
        let mut wheel = TimerWheel::new();
        assert!(wheel.next_delta().is_none());

        wheel.schedule(Duration::from_millis(50), None, || {});
        let delta = wheel.next_delta().unwrap();
        assert!(delta <= Duration::from_millis(50));

        sleep(Duration::from_millis(60));
        assert_eq!(wheel.next_delta(), Some(Duration::ZERO));
    }
}
