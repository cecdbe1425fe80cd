//! Virtual-time timer manager.
//!
//! A single virtual clock, expressed in nanoseconds and supplied by the CPU
//! time source, drives every "later" in the machine: DMA completion, SCSI
//! bus settle delays, VBL pacing. Devices never own threads; they register
//! one-shot or cyclic callbacks here and the main loop drains the queue
//! between CPU time slices.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::rc::Rc;

pub const NS_PER_USEC: u64 = 1_000;
pub const NS_PER_MSEC: u64 = 1_000_000;
pub const NS_PER_SEC: u64 = 1_000_000_000;

pub const fn usecs_to_nsecs(usecs: u64) -> u64 {
    usecs * NS_PER_USEC
}

pub const fn msecs_to_nsecs(msecs: u64) -> u64 {
    msecs * NS_PER_MSEC
}

/// Timer callback. Shared so the queue borrow can be dropped before the
/// callback runs (callbacks are allowed to add and cancel timers).
pub type TimerCallback = Rc<RefCell<dyn FnMut()>>;

// ── Queue entry ───────────────────────────────────────────────

struct TimerSlot {
    id: u32,
    timeout_ns: u64,
    /// 0 for one-shot timers.
    interval_ns: u64,
    /// Insertion sequence, tie-breaker for equal expiry times.
    seq: u64,
    cb: TimerCallback,
}

impl Eq for TimerSlot {}
impl PartialEq for TimerSlot {
    fn eq(&self, other: &Self) -> bool {
        self.timeout_ns == other.timeout_ns && self.seq == other.seq
    }
}
impl PartialOrd for TimerSlot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerSlot {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; earliest expiry must win, and among equal
        // expiries the earliest insertion.
        other
            .timeout_ns
            .cmp(&self.timeout_ns)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

// ── Timer manager ─────────────────────────────────────────────

/// Machine-scoped timer queue.
///
/// All methods take `&self`; the queue lives behind scoped borrows so a
/// running callback can re-enter `add_*`/`cancel_timer` freely. Shared as
/// `Rc<TimerManager>` between the machine and its devices.
pub struct TimerManager {
    queue: RefCell<BinaryHeap<TimerSlot>>,
    next_id: Cell<u32>,
    next_seq: Cell<u64>,
    /// True while a timer callback executes; suppresses redundant
    /// queue-changed notifications to the host tick driver.
    cb_active: Cell<bool>,
    time_now_cb: RefCell<Option<Box<dyn Fn() -> u64>>>,
    notify_changes_cb: RefCell<Option<Box<dyn Fn()>>>,
}

impl TimerManager {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            queue: RefCell::new(BinaryHeap::new()),
            next_id: Cell::new(0),
            next_seq: Cell::new(0),
            cb_active: Cell::new(false),
            time_now_cb: RefCell::new(None),
            notify_changes_cb: RefCell::new(None),
        })
    }

    /// Callback for retrieving the current virtual time.
    pub fn set_time_now_cb(&self, cb: impl Fn() -> u64 + 'static) {
        *self.time_now_cb.borrow_mut() = Some(Box::new(cb));
    }

    /// Callback for acknowledging changes in the timer queue (the host tick
    /// driver reads the next-expiry hint through this).
    pub fn set_notify_changes_cb(&self, cb: impl Fn() + 'static) {
        *self.notify_changes_cb.borrow_mut() = Some(Box::new(cb));
    }

    /// Current virtual time in nanoseconds.
    pub fn current_time_ns(&self) -> u64 {
        match &*self.time_now_cb.borrow() {
            Some(cb) => cb(),
            None => panic!("TimerManager: no time source registered"),
        }
    }

    // ── Creating and cancelling timers ────────────────────────

    pub fn add_oneshot_timer(&self, timeout_ns: u64, cb: impl FnMut() + 'static) -> u32 {
        self.insert_timer(self.current_time_ns() + timeout_ns, 0, Rc::new(RefCell::new(cb)))
    }

    pub fn add_immediate_timer(&self, cb: impl FnMut() + 'static) -> u32 {
        self.insert_timer(self.current_time_ns(), 0, Rc::new(RefCell::new(cb)))
    }

    pub fn add_cyclic_timer(&self, interval_ns: u64, cb: impl FnMut() + 'static) -> u32 {
        self.insert_timer(
            self.current_time_ns() + interval_ns,
            interval_ns,
            Rc::new(RefCell::new(cb)),
        )
    }

    pub fn add_cyclic_timer_delayed(
        &self,
        interval_ns: u64,
        delay_ns: u64,
        cb: impl FnMut() + 'static,
    ) -> u32 {
        self.insert_timer(
            self.current_time_ns() + delay_ns,
            interval_ns,
            Rc::new(RefCell::new(cb)),
        )
    }

    /// Cancel a pending timer. Silent no-op for unknown or already fired ids.
    pub fn cancel_timer(&self, id: u32) {
        {
            let mut queue = self.queue.borrow_mut();
            let slots: Vec<TimerSlot> = queue.drain().collect();
            queue.extend(slots.into_iter().filter(|slot| slot.id != id));
        }
        self.notify_changes();
    }

    fn insert_timer(&self, timeout_ns: u64, interval_ns: u64, cb: TimerCallback) -> u32 {
        let id = self.next_id.get().wrapping_add(1);
        self.next_id.set(id);
        self.push_slot(TimerSlot {
            id,
            timeout_ns,
            interval_ns,
            seq: 0,
            cb,
        });
        self.notify_changes();
        id
    }

    fn push_slot(&self, mut slot: TimerSlot) {
        let seq = self.next_seq.get();
        self.next_seq.set(seq + 1);
        slot.seq = seq;
        self.queue.borrow_mut().push(slot);
    }

    fn notify_changes(&self) {
        if self.cb_active.get() {
            return;
        }
        if let Some(cb) = &*self.notify_changes_cb.borrow() {
            cb();
        }
    }

    // ── Dispatch ──────────────────────────────────────────────

    /// Drain all expired timers in expiry order. Cyclic timers are re-armed
    /// at `now + interval` before their callback runs, so a callback that
    /// mutates the queue observes a consistent state and periodic work never
    /// accumulates a backlog.
    ///
    /// Returns 0 when no timers remain, else the nanoseconds until the next
    /// expiry.
    pub fn process_timers(&self) -> u64 {
        let time_now = self.current_time_ns();

        loop {
            let slot = {
                let mut queue = self.queue.borrow_mut();
                match queue.peek() {
                    None => return 0,
                    Some(slot) if slot.timeout_ns > time_now => {
                        return slot.timeout_ns - time_now;
                    }
                    Some(_) => queue.pop().unwrap(),
                }
            };

            let cb = Rc::clone(&slot.cb);

            // re-arm cyclic timers
            if slot.interval_ns != 0 {
                self.push_slot(TimerSlot {
                    timeout_ns: time_now + slot.interval_ns,
                    ..slot
                });
            }

            self.cb_active.set(true);
            (cb.borrow_mut())();
            self.cb_active.set(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with_clock() -> (Rc<TimerManager>, Rc<Cell<u64>>) {
        let clock = Rc::new(Cell::new(0u64));
        let mgr = TimerManager::new();
        let c = Rc::clone(&clock);
        mgr.set_time_now_cb(move || c.get());
        (mgr, clock)
    }

    #[test]
    fn ids_are_monotonic() {
        let (mgr, _clock) = manager_with_clock();
        let a = mgr.add_oneshot_timer(10, || {});
        let b = mgr.add_oneshot_timer(5, || {});
        let c = mgr.add_immediate_timer(|| {});
        assert!(a < b && b < c);
    }

    #[test]
    fn oneshot_fires_once_in_order() {
        let (mgr, clock) = manager_with_clock();
        let order = Rc::new(RefCell::new(Vec::new()));

        for (tag, delay) in [(2u32, 200u64), (1, 100), (3, 300)] {
            let order = Rc::clone(&order);
            mgr.add_oneshot_timer(delay, move || order.borrow_mut().push(tag));
        }

        clock.set(250);
        let next = mgr.process_timers();
        assert_eq!(*order.borrow(), vec![1, 2]);
        assert_eq!(next, 50);

        clock.set(300);
        assert_eq!(mgr.process_timers(), 0);
        assert_eq!(*order.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn same_expiry_fires_in_insertion_order() {
        let (mgr, clock) = manager_with_clock();
        let order = Rc::new(RefCell::new(Vec::new()));
        for tag in 0..4u32 {
            let order = Rc::clone(&order);
            mgr.add_oneshot_timer(100, move || order.borrow_mut().push(tag));
        }
        clock.set(100);
        mgr.process_timers();
        assert_eq!(*order.borrow(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn cyclic_rearms_from_current_now() {
        let (mgr, clock) = manager_with_clock();
        let fired = Rc::new(Cell::new(0u32));
        let f = Rc::clone(&fired);
        mgr.add_cyclic_timer(100, move || f.set(f.get() + 1));

        // the 10th firing lands at t0 + 10 * T
        for step in 1..=10u64 {
            clock.set(step * 100);
            mgr.process_timers();
        }
        assert_eq!(fired.get(), 10);

        // late processing reschedules from "now", no backlog burst
        clock.set(1100 + 470);
        mgr.process_timers();
        assert_eq!(fired.get(), 11);
        clock.set(1100 + 471);
        assert_eq!(mgr.process_timers(), 99);
    }

    #[test]
    fn callback_may_cancel_pending_timer() {
        let (mgr, clock) = manager_with_clock();
        let fired = Rc::new(Cell::new(false));

        let f = Rc::clone(&fired);
        let victim = mgr.add_cyclic_timer_delayed(1000, 150, move || f.set(true));

        let m = Rc::clone(&mgr);
        mgr.add_oneshot_timer(100, move || m.cancel_timer(victim));

        clock.set(100);
        mgr.process_timers();
        clock.set(150);
        assert_eq!(mgr.process_timers(), 0);
        assert!(!fired.get());
    }

    #[test]
    fn callback_may_add_timers() {
        let (mgr, clock) = manager_with_clock();
        let fired = Rc::new(Cell::new(false));

        let m = Rc::clone(&mgr);
        let f = Rc::clone(&fired);
        mgr.add_oneshot_timer(100, move || {
            let f = Rc::clone(&f);
            m.add_oneshot_timer(50, move || f.set(true));
        });

        clock.set(100);
        assert_eq!(mgr.process_timers(), 50);
        clock.set(150);
        mgr.process_timers();
        assert!(fired.get());
    }

    #[test]
    fn cancel_unknown_id_is_silent() {
        let (mgr, _clock) = manager_with_clock();
        mgr.cancel_timer(12345);
    }

    #[test]
    fn notifications_suppressed_inside_callback() {
        let (mgr, clock) = manager_with_clock();
        let notifications = Rc::new(Cell::new(0u32));
        let n = Rc::clone(&notifications);
        mgr.set_notify_changes_cb(move || n.set(n.get() + 1));

        let m = Rc::clone(&mgr);
        mgr.add_oneshot_timer(10, move || {
            m.add_oneshot_timer(10, || {});
        });
        let outside = notifications.get();
        assert_eq!(outside, 1);

        clock.set(10);
        mgr.process_timers();
        // the add inside the callback must not have notified
        assert_eq!(notifications.get(), outside);
    }
}
