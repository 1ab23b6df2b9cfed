//! Deterministic virtual time and the discrete-event queue driving device
//! models.
//!
//! # Design
//!
//! Simulated time is a monotonic `u64` tick counter advanced externally by
//! whatever drives the simulation (typically once per simulated instruction).
//! Devices never see wall-clock time.
//!
//! The queue stores callbacks keyed by absolute trigger time. It is built for
//! a single-threaded, cooperative world: all methods take `&self` (interior
//! mutability) so a device callback that is itself running with a shared
//! borrow of the simulation can schedule or cancel follow-up events.
//!
//! The queue does not deduplicate: a device modeling a "busy" state owns at
//! most one pending event for it and must [`EventQueue::deschedule`] before
//! rescheduling.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};

/// Token identifying a scheduled event, returned by [`EventQueue::schedule`].
///
/// Handles are unique for the lifetime of the queue; a handle whose event has
/// already fired or been cancelled never matches again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(u64);

type Callback<A> = Box<dyn FnOnce(&A)>;

struct Entry<A> {
    handle: EventHandle,
    callback: Callback<A>,
}

struct Inner<A> {
    now: u64,
    next_handle: u64,
    next_seq: u64,
    // Keyed by (trigger time, schedule order): iteration order is exactly
    // the required firing order.
    queue: BTreeMap<(u64, u64), Entry<A>>,
    by_handle: HashMap<EventHandle, (u64, u64)>,
}

/// Time-ordered queue of one-shot callbacks over a context `A`.
///
/// `A` is the value handed to every callback when it fires, normally the
/// simulation root that owns this queue.
pub struct EventQueue<A> {
    inner: RefCell<Inner<A>>,
}

impl<A> EventQueue<A> {
    pub fn new() -> Self {
        Self {
            inner: RefCell::new(Inner {
                now: 0,
                next_handle: 0,
                next_seq: 0,
                queue: BTreeMap::new(),
                by_handle: HashMap::new(),
            }),
        }
    }

    /// Returns the current virtual time, in ticks.
    #[inline]
    pub fn now(&self) -> u64 {
        self.inner.borrow().now
    }

    /// Advances the virtual clock by `ticks`. Does not fire anything; call
    /// [`EventQueue::dispatch`] afterwards.
    ///
    /// # Panics
    ///
    /// Panics if advancing would overflow `u64`.
    pub fn advance(&self, ticks: u64) {
        let mut inner = self.inner.borrow_mut();
        inner.now = inner
            .now
            .checked_add(ticks)
            .expect("virtual clock overflowed u64::MAX");
    }

    /// Schedules `callback` to fire `delay` ticks from now. A delay of zero
    /// fires on the next [`EventQueue::dispatch`] call, never synchronously.
    pub fn schedule(&self, delay: u64, callback: impl FnOnce(&A) + 'static) -> EventHandle {
        let mut inner = self.inner.borrow_mut();
        let time = inner
            .now
            .checked_add(delay)
            .expect("event trigger time overflowed u64::MAX");
        let handle = EventHandle(inner.next_handle);
        inner.next_handle += 1;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.queue.insert(
            (time, seq),
            Entry {
                handle,
                callback: Box::new(callback),
            },
        );
        inner.by_handle.insert(handle, (time, seq));
        handle
    }

    /// Cancels a pending event. Returns `false` if the event already fired or
    /// was cancelled before.
    pub fn deschedule(&self, handle: EventHandle) -> bool {
        let mut inner = self.inner.borrow_mut();
        match inner.by_handle.remove(&handle) {
            Some(key) => {
                inner.queue.remove(&key);
                true
            }
            None => false,
        }
    }

    /// Trigger time of the earliest pending event, if any.
    pub fn next_due(&self) -> Option<u64> {
        self.inner.borrow().queue.keys().next().map(|(t, _)| *t)
    }

    pub fn pending(&self) -> usize {
        self.inner.borrow().queue.len()
    }

    /// Fires every event whose trigger time has been reached, in
    /// (trigger-time, schedule-order) order, and returns how many fired.
    ///
    /// The due set is snapshotted before any callback runs: events scheduled
    /// by a firing callback become eligible only on a later call, even with a
    /// zero delay.
    pub fn dispatch(&self, arg: &A) -> usize {
        let due: Vec<Entry<A>> = {
            let mut inner = self.inner.borrow_mut();
            let cutoff = (inner.now + 1, 0);
            let not_due = inner.queue.split_off(&cutoff);
            let due = std::mem::replace(&mut inner.queue, not_due);
            for entry in due.values() {
                inner.by_handle.remove(&entry.handle);
            }
            due.into_values().collect()
        };

        let fired = due.len();
        for entry in due {
            (entry.callback)(arg);
        }
        fired
    }

    /// Runs the queue until `deadline`, advancing the clock event by event.
    /// On return the clock reads exactly `deadline`. Test/driver helper.
    pub fn run_until(&self, arg: &A, deadline: u64) {
        loop {
            let now = self.now();
            assert!(deadline >= now, "run_until deadline is in the past");
            match self.next_due() {
                Some(due) if due <= deadline => {
                    if due > now {
                        self.advance(due - now);
                    }
                    self.dispatch(arg);
                }
                _ => {
                    self.advance(deadline - now);
                    self.dispatch(arg);
                    return;
                }
            }
        }
    }
}

impl<A> Default for EventQueue<A> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Shared scratchpad the tests use as the dispatch context.
    #[derive(Default)]
    struct Log {
        fired: RefCell<Vec<&'static str>>,
    }

    impl Log {
        fn push(&self, tag: &'static str) {
            self.fired.borrow_mut().push(tag);
        }
    }

    #[test]
    fn fires_in_trigger_time_order() {
        let q: EventQueue<Log> = EventQueue::new();
        let log = Log::default();

        q.schedule(30, |l: &Log| l.push("c"));
        q.schedule(10, |l: &Log| l.push("a"));
        q.schedule(20, |l: &Log| l.push("b"));

        q.advance(30);
        assert_eq!(q.dispatch(&log), 3);
        assert_eq!(*log.fired.borrow(), vec!["a", "b", "c"]);
    }

    #[test]
    fn same_time_events_fire_in_schedule_order() {
        let q: EventQueue<Log> = EventQueue::new();
        let log = Log::default();

        q.schedule(5, |l: &Log| l.push("first"));
        q.schedule(5, |l: &Log| l.push("second"));

        q.advance(5);
        q.dispatch(&log);
        assert_eq!(*log.fired.borrow(), vec!["first", "second"]);
    }

    #[test]
    fn not_due_events_stay_queued() {
        let q: EventQueue<Log> = EventQueue::new();
        let log = Log::default();

        q.schedule(10, |l: &Log| l.push("later"));
        q.advance(9);
        assert_eq!(q.dispatch(&log), 0);
        assert_eq!(q.pending(), 1);

        q.advance(1);
        assert_eq!(q.dispatch(&log), 1);
        assert_eq!(q.pending(), 0);
    }

    #[test]
    fn deschedule_cancels_and_reports_stale_handles() {
        let q: EventQueue<Log> = EventQueue::new();
        let log = Log::default();

        let keep = q.schedule(1, |l: &Log| l.push("keep"));
        let drop = q.schedule(1, |l: &Log| l.push("drop"));

        assert!(q.deschedule(drop));
        // Second cancel of the same handle is stale.
        assert!(!q.deschedule(drop));

        q.advance(1);
        q.dispatch(&log);
        assert_eq!(*log.fired.borrow(), vec!["keep"]);

        // The fired handle is stale too.
        assert!(!q.deschedule(keep));
    }

    #[test]
    fn events_scheduled_while_dispatching_wait_for_a_later_tick() {
        struct Ctx {
            q: EventQueue<Ctx>,
            log: Log,
        }

        // The queue lives inside the context so the callback can reschedule
        // through the shared borrow, as device models do.
        let ctx = Box::leak(Box::new(Ctx {
            q: EventQueue::new(),
            log: Log::default(),
        }));

        ctx.q.schedule(0, |c: &Ctx| {
            c.log.push("outer");
            c.q.schedule(0, |c: &Ctx| c.log.push("inner"));
        });

        assert_eq!(ctx.q.dispatch(ctx), 1);
        assert_eq!(*ctx.log.fired.borrow(), vec!["outer"]);

        // The zero-delay event scheduled mid-dispatch fires on the next call.
        assert_eq!(ctx.q.dispatch(ctx), 1);
        assert_eq!(*ctx.log.fired.borrow(), vec!["outer", "inner"]);
    }

    #[test]
    fn run_until_advances_clock_through_each_event() {
        struct Ctx {
            q: EventQueue<Ctx>,
            times: RefCell<Vec<u64>>,
        }

        let ctx = Box::leak(Box::new(Ctx {
            q: EventQueue::new(),
            times: RefCell::new(Vec::new()),
        }));

        ctx.q.schedule(3, |c: &Ctx| c.times.borrow_mut().push(c.q.now()));
        ctx.q.schedule(7, |c: &Ctx| c.times.borrow_mut().push(c.q.now()));

        ctx.q.run_until(ctx, 10);
        assert_eq!(ctx.q.now(), 10);
        // Each callback observed the clock at its own trigger time.
        assert_eq!(*ctx.times.borrow(), vec![3, 7]);
    }
}
