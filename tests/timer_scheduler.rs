//! Virtual-time scheduler driven the way the main loop drives it: process,
//! advance to the returned deadline, repeat.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use oldworld::timers::{usecs_to_nsecs, TimerManager};

fn manager() -> (Rc<TimerManager>, Rc<Cell<u64>>) {
    let clock = Rc::new(Cell::new(0u64));
    let mgr = TimerManager::new();
    let c = Rc::clone(&clock);
    mgr.set_time_now_cb(move || c.get());
    (mgr, clock)
}

#[test]
fn tenth_cyclic_firing_lands_on_schedule() {
    let (mgr, clock) = manager();
    let firings = Rc::new(RefCell::new(Vec::new()));

    let f = Rc::clone(&firings);
    let c = Rc::clone(&clock);
    mgr.add_cyclic_timer(usecs_to_nsecs(250), move || f.borrow_mut().push(c.get()));

    while firings.borrow().len() < 10 {
        let next = mgr.process_timers();
        assert_ne!(next, 0);
        clock.set(clock.get() + next);
    }

    // the 10th firing occurs at t0 + 10 * T exactly: the loop advances to
    // each deadline, so no drift accumulates
    assert_eq!(firings.borrow()[9], 10 * usecs_to_nsecs(250));
}

#[test]
fn oneshot_cancels_cyclic_before_it_fires() {
    let (mgr, clock) = manager();
    let cyclic_fired = Rc::new(Cell::new(false));

    let f = Rc::clone(&cyclic_fired);
    let cyclic_id = mgr.add_cyclic_timer_delayed(1_000, 150, move || f.set(true));

    let m = Rc::clone(&mgr);
    mgr.add_oneshot_timer(100, move || m.cancel_timer(cyclic_id));

    clock.set(100);
    // the callback fires and cancels the cyclic timer scheduled for t=150
    assert_eq!(mgr.process_timers(), 0);

    clock.set(150);
    assert_eq!(mgr.process_timers(), 0);
    assert!(!cyclic_fired.get());
}

#[test]
fn interleaved_devices_fire_in_expiry_order() {
    let (mgr, clock) = manager();
    let order = Rc::new(RefCell::new(Vec::new()));

    for (tag, delay) in [("vbl", 16_667_000u64), ("scsi", 400), ("dma", 2_400)] {
        let order = Rc::clone(&order);
        mgr.add_oneshot_timer(delay, move || order.borrow_mut().push(tag));
    }

    loop {
        let next = mgr.process_timers();
        if next == 0 {
            break;
        }
        clock.set(clock.get() + next);
    }
    assert_eq!(*order.borrow(), vec!["scsi", "dma", "vbl"]);
}
