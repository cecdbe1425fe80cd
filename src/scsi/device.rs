//! Target-side SCSI device protocol.
//!
//! Concrete targets (hard disks, CD-ROMs) embed a [`TargetState`] and
//! implement the [`ScsiTargetDevice`] hooks; the protocol itself, selection
//! response, phase walking, CDB length decoding and message handling, is
//! provided here and surfaced to the bus through a blanket [`ScsiDevice`]
//! implementation.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use super::bus::{ScsiBus, ScsiDevice};
use super::{
    scsi_ext_message, scsi_message, CtrlLines, ScsiNotification, ScsiPhase, BUS_SETTLE_DELAY,
    CMD_GROUP_LEN,
};
use crate::timers::TimerManager;

/// Which buffer the data lines currently map to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataReg {
    None,
    Command,
    Message,
    Status,
    Data,
}

pub struct TargetState {
    pub name: String,
    pub scsi_id: usize,
    pub lun: u8,
    pub initiator_id: i32,
    pub cur_phase: ScsiPhase,

    pub cmd_buf: [u8; 16],
    pub msg_buf: [u8; 16],
    pub status: u8,

    /// Device data buffer (sector cache, INQUIRY response, ...).
    pub data_buf: Vec<u8>,

    data_reg: DataReg,
    data_pos: usize,
    /// Remaining outgoing bytes, or accumulated incoming bytes.
    data_size: usize,
    incoming_size: usize,

    last_selection_has_attention: bool,
    last_selection_message: u8,

    /// Pluggable phase sequence (extended message responses).
    seq_steps: Option<(&'static [ScsiPhase], usize)>,
    post_xfer_pending: bool,

    bus: Option<ScsiBus>,
    timers: Option<Rc<TimerManager>>,
    self_ref: Option<Weak<RefCell<dyn ScsiTargetDevice>>>,
}

impl TargetState {
    pub fn new(name: &str, scsi_id: usize) -> Self {
        Self {
            name: name.to_string(),
            scsi_id,
            lun: 0,
            initiator_id: -1,
            cur_phase: ScsiPhase::BusFree,
            cmd_buf: [0; 16],
            msg_buf: [0; 16],
            status: 0,
            data_buf: Vec::new(),
            data_reg: DataReg::None,
            data_pos: 0,
            data_size: 0,
            incoming_size: 0,
            last_selection_has_attention: false,
            last_selection_message: 0,
            seq_steps: None,
            post_xfer_pending: false,
            bus: None,
            timers: None,
            self_ref: None,
        }
    }

    pub fn bus(&self) -> ScsiBus {
        self.bus.clone().expect("SCSI device not attached to a bus")
    }

    pub fn last_sel_has_attention(&self) -> bool {
        self.last_selection_has_attention
    }

    pub fn last_sel_msg(&self) -> u8 {
        self.last_selection_message
    }

    /// Expose the device data buffer, `xfer_len` bytes from its start.
    pub fn set_xfer_len(&mut self, xfer_len: usize) {
        self.data_reg = DataReg::Data;
        self.data_pos = 0;
        self.data_size = xfer_len;
    }

    /// Expect `len` incoming bytes into the data buffer.
    pub fn expect_data(&mut self, len: usize) {
        self.data_reg = DataReg::Data;
        self.data_buf.clear();
        self.data_buf.resize(len, 0);
        self.data_pos = 0;
        self.data_size = 0;
        self.incoming_size = len;
    }

    pub fn set_status(&mut self, status: u8) {
        self.status = status;
    }

    /// Run the device's post-transfer action when DATA_OUT completes.
    pub fn arm_post_xfer_action(&mut self) {
        self.post_xfer_pending = true;
    }

    fn has_data(&self) -> bool {
        self.data_size != 0
    }

    fn copy_out(&mut self, dst: &mut [u8]) -> usize {
        let count = self.data_size.min(dst.len());
        match self.data_reg {
            DataReg::Message => {
                dst[..count].copy_from_slice(&self.msg_buf[self.data_pos..self.data_pos + count]);
            }
            DataReg::Status => {
                if count > 0 {
                    dst[0] = self.status;
                }
            }
            DataReg::Data => {
                dst[..count].copy_from_slice(&self.data_buf[self.data_pos..self.data_pos + count]);
            }
            DataReg::Command | DataReg::None => return 0,
        }
        self.data_pos += count;
        self.data_size -= count;
        count
    }

    fn copy_in(&mut self, src: &[u8]) -> usize {
        match self.data_reg {
            DataReg::Command => {
                self.cmd_buf[self.data_pos..self.data_pos + src.len()].copy_from_slice(src);
            }
            DataReg::Message => {
                self.msg_buf[self.data_pos..self.data_pos + src.len()].copy_from_slice(src);
            }
            DataReg::Data => {
                if self.data_pos + src.len() > self.data_buf.len() {
                    self.data_buf.resize(self.data_pos + src.len(), 0);
                }
                self.data_buf[self.data_pos..self.data_pos + src.len()].copy_from_slice(src);
            }
            DataReg::Status | DataReg::None => return 0,
        }
        self.data_pos += src.len();
        self.data_size += src.len();
        src.len()
    }
}

/// Device-specific part of a SCSI target.
pub trait ScsiTargetDevice {
    fn state(&self) -> &TargetState;
    fn state_mut(&mut self) -> &mut TargetState;

    /// Set up the outgoing data for the command about to enter DATA_IN.
    fn prepare_data(&mut self) -> bool;

    /// Refill the data buffer mid-transfer; false when drained.
    fn get_more_data(&mut self) -> bool;

    /// Decode and execute the CDB in `cmd_buf`, switching to the next phase.
    fn process_command(&mut self);

    /// Runs once a DATA_OUT transfer completed (write-back actions).
    fn post_xfer_action(&mut self) {}
}

/// Wire a target to the bus: registers it under its ID and hands it the
/// machine's timer manager for deferred selection responses.
pub fn attach_target<T: ScsiTargetDevice + ScsiDevice + 'static>(
    bus: &ScsiBus,
    dev: Rc<RefCell<T>>,
    timers: Rc<TimerManager>,
) {
    let id = dev.borrow().state().scsi_id;
    {
        let mut d = dev.borrow_mut();
        let state = d.state_mut();
        state.bus = Some(bus.clone());
        state.timers = Some(timers);
        let dyn_dev: Rc<RefCell<dyn ScsiTargetDevice>> = dev.clone();
        state.self_ref = Some(Rc::downgrade(&dyn_dev));
    }
    bus.register_device(id, dev);
}

// ── Provided protocol logic ───────────────────────────────────
//
// Free functions so both the blanket ScsiDevice impl (concrete targets) and
// deferred timer callbacks (dyn targets) can run them.

pub fn switch_phase<T: ScsiTargetDevice + ?Sized>(dev: &mut T, new_phase: ScsiPhase) {
    let (bus, id) = {
        let state = dev.state_mut();
        state.cur_phase = new_phase;
        (state.bus(), state.scsi_id)
    };
    bus.switch_phase(id, new_phase);
}

fn allow_phase_change<T: ScsiTargetDevice + ?Sized>(dev: &mut T) -> bool {
    let state = dev.state();
    let bus = state.bus();
    let atn_ack = CtrlLines::ATN | CtrlLines::ACK;
    if bus.test_ctrl_lines(atn_ack) == atn_ack.bits() {
        panic!("{}: reject message requested", state.name);
    }
    !(state.has_data() || bus.test_ctrl_lines(CtrlLines::ACK) != 0)
}

pub fn next_step<T: ScsiTargetDevice + ?Sized>(dev: &mut T) {
    // data transfers during MESSAGE_IN require handshaking; rejection has to
    // be detected as well
    if dev.state().bus().current_phase() == ScsiPhase::MessageIn && !allow_phase_change(dev) {
        return;
    }

    // follow a pluggable phase sequence if one is active
    if let Some((steps, idx)) = dev.state().seq_steps {
        if idx < steps.len() && dev.state().cur_phase == steps[idx] {
            let next = idx + 1;
            dev.state_mut().seq_steps = Some((steps, next));
            if next < steps.len() {
                let phase = steps[next];
                switch_phase(dev, phase);
                return;
            }
        }
    }

    let cur_phase = dev.state().cur_phase;
    match cur_phase {
        ScsiPhase::DataOut => {
            let state = dev.state();
            if state.data_size >= state.incoming_size {
                if dev.state_mut().post_xfer_pending {
                    dev.state_mut().post_xfer_pending = false;
                    dev.post_xfer_action();
                }
                switch_phase(dev, ScsiPhase::Status);
            }
        }
        ScsiPhase::DataIn => {
            if !dev.state().has_data() {
                switch_phase(dev, ScsiPhase::Status);
            }
        }
        ScsiPhase::Command => {
            dev.process_command();
            if dev.state().cur_phase != ScsiPhase::Command {
                if dev.prepare_data() {
                    let (bus, id) = {
                        let state = dev.state();
                        (state.bus(), state.scsi_id)
                    };
                    bus.assert_ctrl_line(id, CtrlLines::REQ);
                } else {
                    panic!("{}: prepare_data() failed", dev.state().name);
                }
            }
        }
        ScsiPhase::Status => {
            let (bus, id) = {
                let state = dev.state_mut();
                state.data_reg = DataReg::Message;
                state.data_pos = 0;
                state.data_size = 1;
                (state.bus(), state.scsi_id)
            };
            bus.release_ctrl_line(id, CtrlLines::REQ);
            switch_phase(dev, ScsiPhase::MessageIn);
            // the completion message byte is pending
            bus.assert_ctrl_line(id, CtrlLines::REQ);
        }
        ScsiPhase::MessageOut => {
            switch_phase(dev, ScsiPhase::Command);
        }
        ScsiPhase::MessageIn | ScsiPhase::BusFree => {
            let (bus, id) = {
                let state = dev.state_mut();
                state.seq_steps = None;
                (state.bus(), state.scsi_id)
            };
            bus.release_ctrl_lines(id);
            switch_phase(dev, ScsiPhase::BusFree);
        }
        _ => {
            log::warn!(
                "{}: nothing to do for phase {:?}",
                dev.state().name,
                cur_phase
            );
        }
    }
}

pub fn prepare_xfer<T: ScsiTargetDevice + ?Sized>(
    dev: &mut T,
    bytes_in: &mut i32,
    bytes_out: &mut i32,
) {
    let cur_phase = dev.state().bus().current_phase();
    let state = dev.state_mut();
    state.cur_phase = cur_phase;

    match cur_phase {
        ScsiPhase::Command => {
            state.data_reg = DataReg::Command;
            state.data_pos = 0;
            state.data_size = 0;
            *bytes_out = 0;
        }
        ScsiPhase::Status => {
            state.data_reg = DataReg::Status;
            state.data_pos = 0;
            state.data_size = 1;
            *bytes_out = 1;
        }
        ScsiPhase::DataIn => {
            *bytes_out = state.data_size as i32;
        }
        ScsiPhase::DataOut => {}
        ScsiPhase::MessageOut => {
            state.data_reg = DataReg::Message;
            state.data_pos = 0;
            state.data_size = *bytes_in as usize;
            *bytes_out = 0;
        }
        ScsiPhase::MessageIn => {}
        _ => panic!(
            "{}: unhandled phase {:?} in prepare_xfer()",
            state.name, cur_phase
        ),
    }
}

pub fn xfer_data<T: ScsiTargetDevice + ?Sized>(dev: &mut T) {
    let cur_phase = dev.state().bus().current_phase();
    dev.state_mut().cur_phase = cur_phase;

    match cur_phase {
        ScsiPhase::MessageOut => {
            let (bus, initiator_id) = {
                let state = dev.state();
                (state.bus(), state.initiator_id as usize)
            };
            let mut first = [0u8; 1];
            if bus.pull_data(initiator_id, &mut first) {
                dev.state_mut().msg_buf[0] = first[0];
                if first[0] & scsi_message::IDENTIFY != 0 {
                    log::trace!(
                        "{}: IDENTIFY MESSAGE received, code = 0x{:X}",
                        dev.state().name,
                        first[0]
                    );
                } else {
                    process_message(dev);
                }
                if dev.state().last_selection_has_attention {
                    let msg = dev.state().msg_buf[0];
                    dev.state_mut().last_selection_message = msg;
                }
            }
        }
        ScsiPhase::Command => {
            let (bus, initiator_id) = {
                let state = dev.state();
                (state.bus(), state.initiator_id as usize)
            };
            let mut first = [0u8; 1];
            if bus.pull_data(initiator_id, &mut first) {
                dev.state_mut().cmd_buf[0] = first[0];
                let cmd_len = CMD_GROUP_LEN[(first[0] >> 5) as usize];
                if cmd_len < 0 {
                    panic!(
                        "{}: unsupported command received, code = 0x{:X}",
                        dev.state().name,
                        first[0]
                    );
                }
                let mut rest = vec![0u8; cmd_len as usize - 1];
                if bus.pull_data(initiator_id, &mut rest) {
                    dev.state_mut().cmd_buf[1..cmd_len as usize].copy_from_slice(&rest);
                    next_step(dev);
                }
            }
        }
        _ => panic!(
            "{}: unhandled phase {:?} in xfer_data()",
            dev.state().name,
            cur_phase
        ),
    }
}

pub fn send_data<T: ScsiTargetDevice + ?Sized>(dev: &mut T, dst: &mut [u8]) -> usize {
    if dst.is_empty() {
        return 0;
    }

    let mut actual_count = dev.state_mut().copy_out(dst);

    // try to deliver the requested amount when the buffer drains
    if !dev.state().has_data() && dev.get_more_data() && dst.len() > actual_count {
        actual_count += dev.state_mut().copy_out(&mut dst[actual_count..]);
    }

    actual_count
}

pub fn rcv_data<T: ScsiTargetDevice + ?Sized>(dev: &mut T, src: &[u8]) -> usize {
    // accumulate incoming data in the pre-configured buffer
    let count = dev.state_mut().copy_in(src);

    if dev.state().cur_phase == ScsiPhase::Command {
        next_step(dev);
    }
    count
}

pub fn process_message<T: ScsiTargetDevice + ?Sized>(dev: &mut T) {
    static SDTR_RESPONSE_SEQ: [ScsiPhase; 3] =
        [ScsiPhase::MessageOut, ScsiPhase::MessageIn, ScsiPhase::Command];

    let (bus, initiator_id) = {
        let state = dev.state();
        (state.bus(), state.initiator_id as usize)
    };

    let first = dev.state().msg_buf[0];
    if first == 1 {
        // extended message
        let mut hdr = [0u8; 1];
        if !bus.pull_data(initiator_id, &mut hdr) {
            panic!("{}: incomplete message received", dev.state().name);
        }
        dev.state_mut().msg_buf[1] = hdr[0];
        let mut body = vec![0u8; hdr[0] as usize];
        if !bus.pull_data(initiator_id, &mut body) {
            panic!("{}: incomplete message received", dev.state().name);
        }
        dev.state_mut().msg_buf[2..2 + body.len()].copy_from_slice(&body);

        match dev.state().msg_buf[2] {
            scsi_ext_message::SYNCH_XFER_REQ => {
                log::info!("{}: SDTR message received", dev.state().name);
                // confirm synchronous transfer capability by echoing the
                // SDTR message back
                let state = dev.state_mut();
                state.seq_steps = Some((&SDTR_RESPONSE_SEQ[..], 0));
                state.data_reg = DataReg::Message;
                state.data_pos = 0;
                state.data_size = 5;
            }
            code => {
                log::error!("{}: unsupported message {}", dev.state().name, code);
            }
        }
    } else if (first >> 4) == 2 {
        // two-byte message
        let mut second = [0u8; 1];
        if !bus.pull_data(initiator_id, &mut second) {
            panic!("{}: incomplete message received", dev.state().name);
        }
        dev.state_mut().msg_buf[1] = second[0];
    }
}

pub fn notify<T: ScsiTargetDevice + ?Sized>(dev: &mut T, notif: ScsiNotification) {
    if let ScsiNotification::BusPhaseChange(phase) = notif {
        match phase {
            ScsiPhase::Reset => {
                log::trace!("{}: bus reset acknowledged", dev.state().name);
            }
            ScsiPhase::Selection => {
                let state = dev.state();
                let bus = state.bus();
                // check whether something tries to select us
                if bus.get_data_lines() & (1 << state.scsi_id) == 0 {
                    return;
                }
                log::trace!("{}: device selected", state.name);

                let timers = state
                    .timers
                    .clone()
                    .expect("SCSI device has no timer manager");
                let weak = state.self_ref.clone().expect("SCSI device not attached");

                timers.add_oneshot_timer(BUS_SETTLE_DELAY, move || {
                    let dev = match weak.upgrade() {
                        Some(dev) => dev,
                        None => return,
                    };
                    selection_response(&dev);
                });
            }
            _ => {}
        }
    }
}

/// Deferred selection response: assert BSY after the settle delay, confirm
/// the selection and enter MESSAGE_OUT or COMMAND.
fn selection_response(dev: &Rc<RefCell<dyn ScsiTargetDevice>>) {
    let (bus, scsi_id) = {
        let d = dev.borrow();
        let state = d.state();
        (state.bus(), state.scsi_id)
    };

    // don't confirm the selection if BSY or I/O are asserted
    if bus.test_ctrl_lines(CtrlLines::BSY | CtrlLines::IO) != 0 {
        return;
    }

    bus.assert_ctrl_line(scsi_id, CtrlLines::BSY);

    let with_atn = bus.test_ctrl_lines(CtrlLines::ATN) != 0;
    {
        let mut d = dev.borrow_mut();
        let state = d.state_mut();
        state.seq_steps = None;
        state.initiator_id = bus.get_initiator_id();
        state.last_selection_has_attention = with_atn;
    }

    bus.confirm_selection(scsi_id);

    let mut d = dev.borrow_mut();
    if with_atn {
        switch_phase(&mut *d, ScsiPhase::MessageOut);
    } else {
        switch_phase(&mut *d, ScsiPhase::Command);
    }
}

/// Forward the bus-facing [`ScsiDevice`] methods of a concrete target to the
/// protocol functions above. A blanket implementation would collide with the
/// controllers' own `ScsiDevice` implementations, so each target spells this
/// out once.
#[macro_export]
macro_rules! impl_scsi_device_for_target {
    ($target:ty) => {
        impl $crate::scsi::bus::ScsiDevice for $target {
            fn scsi_name(&self) -> &str {
                &$crate::scsi::device::ScsiTargetDevice::state(self).name
            }

            fn notify(&mut self, notif: $crate::scsi::ScsiNotification) {
                $crate::scsi::device::notify(self, notif);
            }

            fn send_data(&mut self, dst: &mut [u8]) -> usize {
                $crate::scsi::device::send_data(self, dst)
            }

            fn rcv_data(&mut self, src: &[u8]) -> usize {
                $crate::scsi::device::rcv_data(self, src)
            }

            fn xfer_data(&mut self) {
                $crate::scsi::device::xfer_data(self);
            }

            fn next_step(&mut self) {
                $crate::scsi::device::next_step(self);
            }

            fn prepare_xfer(&mut self, bytes_in: &mut i32, bytes_out: &mut i32) {
                $crate::scsi::device::prepare_xfer(self, bytes_in, bytes_out);
            }
        }
    };
}
