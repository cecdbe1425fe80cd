//! SCSI bus state: per-device control-line masks, data lines, phases.
//!
//! The bus is a cheap cloneable handle over shared state. Every method
//! scopes its borrow so that notification fan-out can re-enter the bus from
//! device code, the same way the reference controllers re-enter through raw
//! pointers. Phase-change notifications skip the device that initiated the
//! change.

use std::cell::RefCell;
use std::rc::Rc;

use super::{phase_signals, CtrlLines, ScsiNotification, ScsiPhase, SCSI_MAX_DEVS};

/// Bus-facing interface of every SCSI device (initiator or target).
/// Target-only entry points default to a logged no-op so controllers only
/// implement what the bus will actually call on them.
pub trait ScsiDevice {
    fn scsi_name(&self) -> &str;

    fn notify(&mut self, notif: ScsiNotification);

    /// Provide up to `dst.len()` bytes; returns the byte count delivered.
    fn send_data(&mut self, _dst: &mut [u8]) -> usize {
        log::warn!("{}: send_data not supported", self.scsi_name());
        0
    }

    /// Accept `src`; returns the byte count consumed.
    fn rcv_data(&mut self, _src: &[u8]) -> usize {
        log::warn!("{}: rcv_data not supported", self.scsi_name());
        0
    }

    /// Target-driven transfer step for the current phase.
    fn xfer_data(&mut self) {
        log::warn!("{}: xfer_data not supported", self.scsi_name());
    }

    /// Advance the target to its next protocol step.
    fn next_step(&mut self) {
        log::warn!("{}: next_step not supported", self.scsi_name());
    }

    /// Negotiate a transfer for the current phase.
    fn prepare_xfer(&mut self, _bytes_in: &mut i32, _bytes_out: &mut i32) {
        log::warn!("{}: prepare_xfer not supported", self.scsi_name());
    }
}

pub type ScsiDeviceRef = Rc<RefCell<dyn ScsiDevice>>;

struct BusState {
    name: String,
    devices: [Option<ScsiDeviceRef>; SCSI_MAX_DEVS],
    dev_ctrl_lines: [u16; SCSI_MAX_DEVS],
    ctrl_lines: u16,
    cur_phase: ScsiPhase,
    arb_winner_id: i32,
    initiator_id: i32,
    target_id: i32,
    data_lines: u8,
}

/// Shared handle to one SCSI bus.
#[derive(Clone)]
pub struct ScsiBus {
    state: Rc<RefCell<BusState>>,
}

impl ScsiBus {
    pub fn new(name: &str) -> Self {
        Self {
            state: Rc::new(RefCell::new(BusState {
                name: name.to_string(),
                devices: Default::default(),
                dev_ctrl_lines: [0; SCSI_MAX_DEVS],
                ctrl_lines: 0,
                cur_phase: ScsiPhase::BusFree,
                arb_winner_id: -1,
                initiator_id: -1,
                target_id: -1,
                data_lines: 0,
            })),
        }
    }

    pub fn name(&self) -> String {
        self.state.borrow().name.clone()
    }

    pub fn register_device(&self, id: usize, dev: ScsiDeviceRef) {
        let mut state = self.state.borrow_mut();
        if state.devices[id].is_some() {
            panic!("{}: device with ID {} already registered", state.name, id);
        }
        state.devices[id] = Some(dev);
    }

    pub fn device_at(&self, id: usize) -> Option<ScsiDeviceRef> {
        self.state.borrow().devices[id].clone()
    }

    // ── State queries ─────────────────────────────────────────

    pub fn current_phase(&self) -> ScsiPhase {
        self.state.borrow().cur_phase
    }

    pub fn get_initiator_id(&self) -> i32 {
        self.state.borrow().initiator_id
    }

    pub fn get_target_id(&self) -> i32 {
        self.state.borrow().target_id
    }

    pub fn get_data_lines(&self) -> u8 {
        self.state.borrow().data_lines
    }

    pub fn test_ctrl_lines(&self, mask: CtrlLines) -> u16 {
        let state = self.state.borrow();
        let mut new_state = 0u16;
        for lines in &state.dev_ctrl_lines {
            new_state |= lines;
        }
        new_state & mask.bits()
    }

    pub fn ctrl_lines(&self) -> u16 {
        self.state.borrow().ctrl_lines
    }

    // ── Control lines ─────────────────────────────────────────

    /// Notify every attached device of the new phase except the one that
    /// initiated the change.
    fn change_bus_phase(&self, initiator_id: usize) {
        let (phase, devices) = {
            let state = self.state.borrow();
            (state.cur_phase, state.devices.clone())
        };
        for (id, dev) in devices.iter().enumerate() {
            if id == initiator_id {
                continue; // don't notify the initiator
            }
            if let Some(dev) = dev {
                dev.borrow_mut()
                    .notify(ScsiNotification::BusPhaseChange(phase));
            }
        }
    }

    pub fn assert_ctrl_line(&self, id: usize, mask: CtrlLines) {
        let rst_asserted = {
            let mut state = self.state.borrow_mut();
            let new_state = mask.bits();
            state.dev_ctrl_lines[id] |= new_state;
            if new_state == state.ctrl_lines {
                return;
            }
            state.ctrl_lines |= new_state;
            if new_state & CtrlLines::RST.bits() != 0 {
                state.cur_phase = ScsiPhase::Reset;
                true
            } else {
                false
            }
        };
        if rst_asserted {
            self.change_bus_phase(id);
        }
    }

    pub fn release_ctrl_line(&self, id: usize, mask: CtrlLines) {
        let went_bus_free = {
            let mut state = self.state.borrow_mut();
            state.dev_ctrl_lines[id] &= !mask.bits();

            // OR the control lines of all devices together
            let mut new_state = 0u16;
            for lines in &state.dev_ctrl_lines {
                new_state |= lines;
            }

            if state.ctrl_lines & CtrlLines::RST.bits() != 0 {
                if new_state & CtrlLines::RST.bits() == 0 {
                    // falling RST edge: the bus returns to bus-free
                    state.ctrl_lines = new_state;
                    state.cur_phase = ScsiPhase::BusFree;
                    true
                } else {
                    false
                }
            } else {
                state.ctrl_lines = new_state;
                false
            }
        };
        if went_bus_free {
            self.change_bus_phase(id);
        }
    }

    pub fn release_ctrl_lines(&self, id: usize) {
        self.release_ctrl_line(id, CtrlLines::all());
    }

    // ── Phases ────────────────────────────────────────────────

    /// Update the CD/IO/MSG signals for `new_phase` and notify everyone but
    /// the switching device. Returns the previous phase.
    pub fn switch_phase(&self, id: usize, new_phase: ScsiPhase) -> ScsiPhase {
        let old_phase = self.current_phase();

        // leave the current phase
        let old_signals = phase_signals(old_phase);
        if !old_signals.is_empty() {
            self.release_ctrl_line(id, old_signals);
        }

        // enter the new phase
        let new_signals = phase_signals(new_phase);
        if !new_signals.is_empty() {
            self.assert_ctrl_line(id, new_signals);
        }

        self.state.borrow_mut().cur_phase = new_phase;
        self.change_bus_phase(id);

        old_phase
    }

    // ── Arbitration and selection ─────────────────────────────

    pub fn begin_arbitration(&self, initiator_id: usize) -> bool {
        {
            let mut state = self.state.borrow_mut();
            if state.cur_phase != ScsiPhase::BusFree {
                return false;
            }
            state.data_lines |= 1 << initiator_id;
            state.cur_phase = ScsiPhase::Arbitration;
        }
        self.change_bus_phase(initiator_id);
        true
    }

    /// The highest ID on the data lines wins arbitration.
    pub fn end_arbitration(&self, initiator_id: usize) -> bool {
        let mut state = self.state.borrow_mut();
        let mut highest_id = -1i32;
        for id in (0..SCSI_MAX_DEVS as i32).rev() {
            if state.data_lines & (1 << id) != 0 {
                highest_id = id;
                break;
            }
        }
        if highest_id >= 0 {
            state.arb_winner_id = highest_id;
        }
        highest_id == initiator_id as i32
    }

    pub fn begin_selection(&self, initiator_id: usize, target_id: usize, atn: bool) -> bool {
        {
            let state = self.state.borrow();
            if state.cur_phase != ScsiPhase::Arbitration
                || state.arb_winner_id != initiator_id as i32
            {
                return false;
            }
        }

        self.assert_ctrl_line(initiator_id, CtrlLines::SEL);

        {
            let mut state = self.state.borrow_mut();
            state.data_lines = (1 << initiator_id) | (1 << target_id);
        }

        if atn {
            self.assert_ctrl_line(initiator_id, CtrlLines::ATN);
        }

        {
            let mut state = self.state.borrow_mut();
            state.initiator_id = initiator_id as i32;
            state.cur_phase = ScsiPhase::Selection;
        }
        self.change_bus_phase(initiator_id);
        true
    }

    /// Called by the target once it asserted BSY in response to selection.
    pub fn confirm_selection(&self, target_id: usize) {
        let initiator = {
            let mut state = self.state.borrow_mut();
            state.target_id = target_id as i32;
            if state.initiator_id >= 0 {
                state.devices[state.initiator_id as usize].clone()
            } else {
                None
            }
        };
        if let Some(dev) = initiator {
            dev.borrow_mut()
                .notify(ScsiNotification::ConfirmSel(target_id));
        }
    }

    pub fn end_selection(&self, _initiator_id: usize, target_id: usize) -> bool {
        self.state.borrow().target_id == target_id as i32
    }

    pub fn disconnect(&self, dev_id: usize) {
        self.release_ctrl_lines(dev_id);
        let went_bus_free = {
            let mut state = self.state.borrow_mut();
            if state.ctrl_lines & (CtrlLines::BSY | CtrlLines::SEL).bits() == 0 {
                state.cur_phase = ScsiPhase::BusFree;
                true
            } else {
                false
            }
        };
        if went_bus_free {
            self.change_bus_phase(dev_id);
        }
    }

    // ── Data transfer ─────────────────────────────────────────

    /// Transfer target-to-initiator: ask device `id` to fill `dst`.
    pub fn pull_data(&self, id: usize, dst: &mut [u8]) -> bool {
        if dst.is_empty() {
            return false;
        }
        let dev = match self.device_at(id) {
            Some(dev) => dev,
            None => return false,
        };
        if dev.borrow_mut().send_data(dst) == 0 {
            log::error!("{}: error while transferring T->I data!", self.name());
            return false;
        }
        true
    }

    /// Transfer initiator-to-target: hand `src` to device `id`.
    pub fn push_data(&self, id: usize, src: &[u8]) -> bool {
        let dev = match self.device_at(id) {
            Some(dev) => dev,
            None => return false,
        };
        if dev.borrow_mut().rcv_data(src) == 0 && !src.is_empty() {
            log::error!("{}: error while transferring I->T data!", self.name());
            return false;
        }
        true
    }

    fn target_device(&self) -> Option<ScsiDeviceRef> {
        let state = self.state.borrow();
        if state.target_id < 0 {
            return None;
        }
        state.devices[state.target_id as usize].clone()
    }

    pub fn target_xfer_data(&self) {
        if let Some(dev) = self.target_device() {
            dev.borrow_mut().xfer_data();
        }
    }

    pub fn target_next_step(&self) {
        if let Some(dev) = self.target_device() {
            dev.borrow_mut().next_step();
        }
    }

    pub fn negotiate_xfer(&self, bytes_in: &mut i32, bytes_out: &mut i32) -> bool {
        if let Some(dev) = self.target_device() {
            dev.borrow_mut().prepare_xfer(bytes_in, bytes_out);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubDev {
        name: String,
        phases_seen: Vec<ScsiPhase>,
    }

    impl StubDev {
        fn new(name: &str) -> Rc<RefCell<Self>> {
            Rc::new(RefCell::new(Self {
                name: name.to_string(),
                phases_seen: Vec::new(),
            }))
        }
    }

    impl ScsiDevice for StubDev {
        fn scsi_name(&self) -> &str {
            &self.name
        }
        fn notify(&mut self, notif: ScsiNotification) {
            if let ScsiNotification::BusPhaseChange(phase) = notif {
                self.phases_seen.push(phase);
            }
        }
    }

    #[test]
    fn phase_signal_encoding_is_canonical() {
        let bus = ScsiBus::new("scsi0");
        let checks = [
            (ScsiPhase::Command, CtrlLines::CD),
            (ScsiPhase::DataIn, CtrlLines::IO),
            (ScsiPhase::DataOut, CtrlLines::empty()),
            (ScsiPhase::Status, CtrlLines::CD | CtrlLines::IO),
            (
                ScsiPhase::MessageIn,
                CtrlLines::CD | CtrlLines::IO | CtrlLines::MSG,
            ),
            (ScsiPhase::MessageOut, CtrlLines::CD | CtrlLines::MSG),
        ];
        let phase_mask = CtrlLines::CD | CtrlLines::IO | CtrlLines::MSG;
        for (phase, want) in checks {
            bus.switch_phase(0, phase);
            assert_eq!(
                bus.ctrl_lines() & phase_mask.bits(),
                want.bits(),
                "phase {:?}",
                phase
            );
        }
    }

    #[test]
    fn phase_change_skips_initiating_device() {
        let bus = ScsiBus::new("scsi0");
        let dev0 = StubDev::new("dev0");
        let dev1 = StubDev::new("dev1");
        bus.register_device(0, dev0.clone());
        bus.register_device(1, dev1.clone());

        bus.switch_phase(0, ScsiPhase::Command);
        assert!(dev0.borrow().phases_seen.is_empty());
        assert_eq!(dev1.borrow().phases_seen, vec![ScsiPhase::Command]);
    }

    #[test]
    fn ctrl_lines_are_or_of_contributions() {
        let bus = ScsiBus::new("scsi0");
        bus.assert_ctrl_line(0, CtrlLines::BSY);
        bus.assert_ctrl_line(1, CtrlLines::BSY | CtrlLines::SEL);
        bus.release_ctrl_line(1, CtrlLines::BSY | CtrlLines::SEL);
        // device 0 still drives BSY
        assert_eq!(bus.ctrl_lines(), CtrlLines::BSY.bits());
        bus.release_ctrl_lines(0);
        assert_eq!(bus.ctrl_lines(), 0);
    }

    #[test]
    fn rst_falling_edge_returns_to_bus_free() {
        let bus = ScsiBus::new("scsi0");
        let dev1 = StubDev::new("dev1");
        bus.register_device(1, dev1.clone());

        bus.assert_ctrl_line(0, CtrlLines::RST);
        assert_eq!(bus.current_phase(), ScsiPhase::Reset);
        assert_eq!(dev1.borrow().phases_seen, vec![ScsiPhase::Reset]);

        bus.release_ctrl_line(0, CtrlLines::RST);
        assert_eq!(bus.current_phase(), ScsiPhase::BusFree);
        assert_eq!(
            dev1.borrow().phases_seen,
            vec![ScsiPhase::Reset, ScsiPhase::BusFree]
        );
    }

    #[test]
    fn highest_id_wins_arbitration() {
        let bus = ScsiBus::new("scsi0");
        assert!(bus.begin_arbitration(3));
        // device 6 also drives its ID bit
        bus.state.borrow_mut().data_lines |= 1 << 6;
        assert!(!bus.end_arbitration(3));
        assert!(bus.end_arbitration(6));
    }

    #[test]
    fn arbitration_requires_bus_free() {
        let bus = ScsiBus::new("scsi0");
        bus.switch_phase(0, ScsiPhase::Command);
        assert!(!bus.begin_arbitration(7));
    }

    #[test]
    fn selection_places_both_ids_on_data_lines() {
        let bus = ScsiBus::new("scsi0");
        assert!(bus.begin_arbitration(7));
        assert!(bus.end_arbitration(7));
        assert!(bus.begin_selection(7, 0, true));
        assert_eq!(bus.get_data_lines(), 0x81);
        assert_eq!(bus.current_phase(), ScsiPhase::Selection);
        assert_ne!(bus.test_ctrl_lines(CtrlLines::ATN), 0);
    }
}
