//! SCSI bus end-to-end: arbitration and selection timing, the selection
//! timeout, and a full READ command walked through every phase by the
//! controller sequencer.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use oldworld::scsi::device::attach_target;
use oldworld::scsi::{
    scsi_status, CtrlError, ScsiBus, ScsiCtrl, ScsiHardDisk, ScsiPhase, SeqState,
};
use oldworld::timers::TimerManager;

struct Harness {
    bus: ScsiBus,
    ctrl: ScsiCtrl,
    timers: Rc<TimerManager>,
    clock: Rc<Cell<u64>>,
    steps: Rc<Cell<u32>>,
    errors: Rc<RefCell<Vec<CtrlError>>>,
}

fn harness() -> Harness {
    let clock = Rc::new(Cell::new(0u64));
    let timers = TimerManager::new();
    let c = Rc::clone(&clock);
    timers.set_time_now_cb(move || c.get());

    let bus = ScsiBus::new("scsi0");
    let ctrl = ScsiCtrl::new("mesh", 7, bus.clone(), Rc::clone(&timers));
    ctrl.attach_to_bus();

    let steps = Rc::new(Cell::new(0u32));
    let errors = Rc::new(RefCell::new(Vec::new()));
    let s = Rc::clone(&steps);
    let e = Rc::clone(&errors);
    ctrl.set_callbacks(
        move || s.set(s.get() + 1),
        move |err| e.borrow_mut().push(err),
    );

    Harness {
        bus,
        ctrl,
        timers,
        clock,
        steps,
        errors,
    }
}

impl Harness {
    /// Drain the timer queue, advancing virtual time to each expiry.
    fn pump(&self) {
        loop {
            let next = self.timers.process_timers();
            if next == 0 {
                break;
            }
            self.clock.set(self.clock.get() + next);
        }
    }

    fn attach_disk(&self, id: usize, image: Vec<u8>) -> Rc<RefCell<ScsiHardDisk>> {
        let disk = Rc::new(RefCell::new(ScsiHardDisk::new("disk", id)));
        disk.borrow_mut().insert_image(image);
        attach_target(&self.bus, disk.clone(), Rc::clone(&self.timers));
        disk
    }

    fn win_bus_and_select(&self, target_id: usize) {
        self.ctrl.arbitrate(target_id);
        self.pump();
        assert_eq!(self.steps.get(), 1, "arbitration step");
        self.ctrl.select(false);
        self.pump();
        assert_eq!(self.steps.get(), 2, "selection step");
    }
}

#[test]
fn arbitration_takes_standard_delays() {
    let h = harness();
    h.attach_disk(0, vec![0; 512]);

    h.ctrl.arbitrate(0);
    h.pump();

    assert_eq!(h.steps.get(), 1);
    assert!(h.errors.borrow().is_empty());
    // bus-free wait + settle + arbitration delay
    assert_eq!(h.clock.get(), 800 + 400 + 2400);
}

#[test]
fn selection_of_missing_target_times_out() {
    let h = harness();
    // nothing at ID 0

    h.ctrl.arbitrate(0);
    h.pump();
    let t_arb = h.clock.get();

    h.ctrl.select(false);
    h.pump();

    assert_eq!(*h.errors.borrow(), vec![CtrlError::SelTimeout]);
    assert_eq!(h.ctrl.cur_state(), SeqState::Idle);
    // the 250 ms selection timeout elapsed in virtual time
    assert_eq!(h.clock.get(), t_arb + 250_000_000);
    assert_eq!(h.bus.current_phase(), ScsiPhase::BusFree);
}

#[test]
fn selection_of_present_target_confirms_quickly() {
    let h = harness();
    h.attach_disk(0, vec![0; 512]);

    h.win_bus_and_select(0);
    assert!(h.errors.borrow().is_empty());
    // the target answered after the bus settle delay, far below the timeout
    assert!(h.clock.get() < 1_000_000);
    // target took the bus to COMMAND
    assert_eq!(h.bus.current_phase(), ScsiPhase::Command);
}

#[test]
fn read_command_walks_all_phases() {
    let h = harness();
    let mut image = vec![0u8; 1024];
    for (i, b) in image.iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }
    let disk = h.attach_disk(0, image.clone());

    h.win_bus_and_select(0);

    // COMMAND phase: READ(6) of LBA 1, one block
    h.ctrl.load_fifo(&[0x08, 0x00, 0x00, 0x01, 0x01, 0x00]);
    h.ctrl.set_xfer_count(6);
    h.ctrl.send_command();
    h.pump();
    assert_eq!(h.steps.get(), 3);
    assert_eq!(h.bus.current_phase(), ScsiPhase::DataIn);

    // DATA_IN: drain one block through the FIFO + DMA path
    h.ctrl.set_xfer_count(512);
    h.ctrl.begin_transfer();
    let mut sector = vec![0u8; 512];
    assert_eq!(h.ctrl.xfer_from(&mut sector), 0);
    assert_eq!(sector, image[512..1024].to_vec());
    assert_eq!(h.bus.current_phase(), ScsiPhase::Status);

    // STATUS: one byte, GOOD
    h.ctrl.set_xfer_count(1);
    h.ctrl.receive_status();
    assert_eq!(h.ctrl.fifo_len(), 1);
    assert_eq!(h.ctrl.fifo_pop(), scsi_status::GOOD);
    assert_eq!(h.bus.current_phase(), ScsiPhase::MessageIn);

    // MESSAGE_IN: COMMAND COMPLETE, then release the bus
    h.ctrl.set_xfer_count(1);
    h.ctrl.receive_message();
    assert_eq!(h.ctrl.cur_state(), SeqState::Idle);

    h.ctrl.release_bus();
    assert_eq!(h.bus.current_phase(), ScsiPhase::BusFree);
    assert_eq!(h.bus.ctrl_lines(), 0);

    // the medium was untouched
    assert_eq!(disk.borrow().image()[512], image[512]);
}

#[test]
fn write_command_commits_to_the_medium() {
    let h = harness();
    let disk = h.attach_disk(0, vec![0u8; 1024]);

    h.win_bus_and_select(0);

    // WRITE(6) of LBA 0, one block
    h.ctrl.load_fifo(&[0x0A, 0x00, 0x00, 0x00, 0x01, 0x00]);
    h.ctrl.set_xfer_count(6);
    h.ctrl.send_command();
    h.pump();
    assert_eq!(h.bus.current_phase(), ScsiPhase::DataOut);

    // DATA_OUT: push one block in FIFO-sized chunks
    h.ctrl.set_xfer_count(512);
    h.ctrl.begin_transfer();
    let payload: Vec<u8> = (0..512u32).map(|i| (i % 199) as u8).collect();
    for chunk in payload.chunks(16) {
        h.ctrl.load_fifo(chunk);
        h.ctrl.sequencer();
    }
    assert_eq!(h.bus.current_phase(), ScsiPhase::Status);
    assert_eq!(&disk.borrow().image()[..512], &payload[..]);

    h.ctrl.set_xfer_count(1);
    h.ctrl.receive_status();
    assert_eq!(h.ctrl.fifo_pop(), scsi_status::GOOD);
}

#[test]
fn check_condition_surfaces_through_status_phase() {
    let h = harness();
    // 2-block disk; reading past the end must fail
    h.attach_disk(0, vec![0u8; 1024]);

    h.win_bus_and_select(0);

    // READ(6) of LBA 8, one block: out of range
    h.ctrl.load_fifo(&[0x08, 0x00, 0x00, 0x08, 0x01, 0x00]);
    h.ctrl.set_xfer_count(6);
    h.ctrl.send_command();
    h.pump();
    assert_eq!(h.bus.current_phase(), ScsiPhase::Status);

    h.ctrl.set_xfer_count(1);
    h.ctrl.receive_status();
    assert_eq!(h.ctrl.fifo_pop(), scsi_status::CHECK_CONDITION);
}

#[test]
fn inquiry_identifies_the_drive() {
    let h = harness();
    h.attach_disk(0, vec![0; 512]);

    h.win_bus_and_select(0);

    h.ctrl.load_fifo(&[0x12, 0x00, 0x00, 0x00, 36, 0x00]);
    h.ctrl.set_xfer_count(6);
    h.ctrl.send_command();
    h.pump();
    assert_eq!(h.bus.current_phase(), ScsiPhase::DataIn);

    h.ctrl.set_xfer_count(36);
    h.ctrl.begin_transfer();
    let mut resp = vec![0u8; 36];
    assert_eq!(h.ctrl.xfer_from(&mut resp), 0);
    assert_eq!(resp[0], 0); // direct access device
    assert_eq!(&resp[8..16], b"QUANTUM ");
    assert_eq!(h.bus.current_phase(), ScsiPhase::Status);
}
