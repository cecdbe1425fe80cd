//! SCSI bus-controller sequencer, the shared abstraction under the MESH and
//! Curio 53C94 controllers.
//!
//! The sequencer is a finite-state machine walking IDLE -> BUS_FREE ->
//! ARB_BEGIN -> ARB_END -> SEL_BEGIN -> SEL_END -> per-phase transfer states
//! -> XFER_END -> IDLE. Transitions between bus phases are deferred through
//! the timer manager with the standard bus settle/clear/arbitration delays.
//! The owning register-level controller learns about progress through the
//! step/error callbacks; those must not synchronously re-enter the bus.

use std::cell::RefCell;
use std::rc::Rc;

use super::bus::{ScsiBus, ScsiDevice};
use super::{
    CtrlLines, ScsiNotification, ScsiPhase, ARB_DELAY, BUS_CLEAR_DELAY, BUS_FREE_DELAY,
    BUS_SETTLE_DELAY, SEL_TIME_OUT,
};
use crate::timers::TimerManager;

pub const DATA_FIFO_MAX: usize = 16;

/// Sequencer states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqState {
    Idle,
    BusFree,
    ArbBegin,
    ArbEnd,
    SelBegin,
    SelEnd,
    SendMsg,
    SendCmd,
    XferBegin,
    XferEnd,
    SendData,
    RcvData,
    RcvStatus,
    RcvMessage,
}

/// Errors reported to the owning controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtrlError {
    ArbLost,
    SelTimeout,
}

struct CtrlCore {
    name: String,
    bus: ScsiBus,
    timers: Rc<TimerManager>,

    src_id: usize,
    dst_id: usize,
    assert_atn: bool,
    is_initiator: bool,

    cur_state: SeqState,
    next_state: SeqState,
    cur_bus_phase: ScsiPhase,

    data_fifo: [u8; DATA_FIFO_MAX],
    fifo_pos: usize,
    to_xfer: i32,
    bytes_out: i32,
    xfer_count: i32,

    seq_timer_id: u32,

    on_step: Option<Rc<RefCell<dyn FnMut()>>>,
    on_error: Option<Rc<RefCell<dyn FnMut(CtrlError)>>>,
}

/// Cheap cloneable handle; every method scopes its state borrow so that bus
/// traffic can re-enter the controller's bus port.
#[derive(Clone)]
pub struct ScsiCtrl {
    core: Rc<RefCell<CtrlCore>>,
}

impl ScsiCtrl {
    pub fn new(name: &str, my_id: usize, bus: ScsiBus, timers: Rc<TimerManager>) -> Self {
        Self {
            core: Rc::new(RefCell::new(CtrlCore {
                name: name.to_string(),
                bus,
                timers,
                src_id: my_id,
                dst_id: 0,
                assert_atn: false,
                is_initiator: true,
                cur_state: SeqState::Idle,
                next_state: SeqState::Idle,
                cur_bus_phase: ScsiPhase::BusFree,
                data_fifo: [0; DATA_FIFO_MAX],
                fifo_pos: 0,
                to_xfer: 0,
                bytes_out: 0,
                xfer_count: 0,
                seq_timer_id: 0,
                on_step: None,
                on_error: None,
            })),
        }
    }

    /// Register this controller's bus port at its own ID.
    pub fn attach_to_bus(&self) {
        let (bus, src_id, name) = {
            let core = self.core.borrow();
            (core.bus.clone(), core.src_id, core.name.clone())
        };
        bus.register_device(src_id, Rc::new(RefCell::new(CtrlPort {
            name,
            ctrl: self.clone(),
        })));
    }

    pub fn set_callbacks(
        &self,
        on_step: impl FnMut() + 'static,
        on_error: impl FnMut(CtrlError) + 'static,
    ) {
        let mut core = self.core.borrow_mut();
        core.on_step = Some(Rc::new(RefCell::new(on_step)));
        core.on_error = Some(Rc::new(RefCell::new(on_error)));
    }

    fn bus(&self) -> ScsiBus {
        self.core.borrow().bus.clone()
    }

    pub fn cur_state(&self) -> SeqState {
        self.core.borrow().cur_state
    }

    pub fn cur_bus_phase(&self) -> ScsiPhase {
        self.core.borrow().cur_bus_phase
    }

    pub fn fifo_len(&self) -> usize {
        self.core.borrow().fifo_pos
    }

    pub fn set_xfer_count(&self, count: i32) {
        let mut core = self.core.borrow_mut();
        core.xfer_count = count;
        core.to_xfer = count;
    }

    // ── Sequencer commands issued by the owning controller ────

    /// Win the bus: wait for bus-free, arbitrate.
    pub fn arbitrate(&self, dst_id: usize) {
        {
            let mut core = self.core.borrow_mut();
            core.dst_id = dst_id;
            core.cur_state = SeqState::BusFree;
        }
        self.sequencer();
    }

    /// Select the arbitration target, optionally with attention.
    pub fn select(&self, assert_atn: bool) {
        {
            let mut core = self.core.borrow_mut();
            core.assert_atn = assert_atn;
            core.cur_state = SeqState::SelBegin;
        }
        self.sequencer();
    }

    /// Transfer the FIFO contents as the COMMAND phase payload.
    pub fn send_command(&self) {
        self.core.borrow_mut().cur_state = SeqState::SendCmd;
        self.sequencer();
    }

    /// Transfer the FIFO contents as the MESSAGE_OUT payload.
    pub fn send_message(&self) {
        self.core.borrow_mut().cur_state = SeqState::SendMsg;
        self.sequencer();
    }

    /// Start a data transfer for the current bus phase.
    pub fn begin_transfer(&self) {
        self.core.borrow_mut().cur_state = SeqState::XferBegin;
        self.sequencer();
    }

    pub fn receive_status(&self) {
        self.core.borrow_mut().cur_state = SeqState::RcvStatus;
        self.sequencer();
    }

    pub fn receive_message(&self) {
        self.core.borrow_mut().cur_state = SeqState::RcvMessage;
        self.sequencer();
    }

    /// Complete the command: release ACK, let the target run to bus-free,
    /// then drop our own lines.
    pub fn release_bus(&self) {
        let (bus, src_id) = {
            let core = self.core.borrow();
            (core.bus.clone(), core.src_id)
        };
        bus.release_ctrl_line(src_id, CtrlLines::ACK);
        bus.target_next_step();
        bus.disconnect(src_id);
        self.core.borrow_mut().cur_state = SeqState::Idle;
    }

    // ── Sequencer proper ──────────────────────────────────────

    fn seq_defer_state(&self, delay_ns: u64) {
        let timers = self.core.borrow().timers.clone();
        let this = self.clone();
        let id = timers.add_oneshot_timer(delay_ns, move || {
            // re-enter the sequencer with the state specified in next_state
            {
                let mut core = this.core.borrow_mut();
                core.cur_state = core.next_state;
            }
            this.sequencer();
        });
        self.core.borrow_mut().seq_timer_id = id;
    }

    pub fn sequencer(&self) {
        let cur_state = self.core.borrow().cur_state;
        match cur_state {
            SeqState::Idle => {}
            SeqState::BusFree => {
                if self.bus().current_phase() == ScsiPhase::BusFree {
                    self.core.borrow_mut().next_state = SeqState::ArbBegin;
                    self.seq_defer_state(BUS_FREE_DELAY + BUS_SETTLE_DELAY);
                } else {
                    // continue waiting
                    self.core.borrow_mut().next_state = SeqState::BusFree;
                    self.seq_defer_state(BUS_FREE_DELAY);
                }
            }
            SeqState::ArbBegin => {
                let (bus, src_id) = {
                    let core = self.core.borrow();
                    (core.bus.clone(), core.src_id)
                };
                if !bus.begin_arbitration(src_id) {
                    log::error!("{}: arbitration error, bus not free!", self.name());
                    bus.release_ctrl_lines(src_id);
                    self.core.borrow_mut().next_state = SeqState::BusFree;
                    self.seq_defer_state(BUS_CLEAR_DELAY);
                    return;
                }
                self.core.borrow_mut().next_state = SeqState::ArbEnd;
                self.seq_defer_state(ARB_DELAY);
            }
            SeqState::ArbEnd => {
                let (bus, src_id) = {
                    let core = self.core.borrow();
                    (core.bus.clone(), core.src_id)
                };
                if bus.end_arbitration(src_id) && bus.test_ctrl_lines(CtrlLines::SEL) == 0 {
                    // arbitration won
                    bus.assert_ctrl_line(src_id, CtrlLines::SEL);
                    self.step_completed();
                } else {
                    log::error!("{}: arbitration lost!", self.name());
                    bus.release_ctrl_lines(src_id);
                    self.report_error(CtrlError::ArbLost);
                }
            }
            SeqState::SelBegin => {
                let (bus, src_id, dst_id, atn) = {
                    let core = self.core.borrow();
                    (core.bus.clone(), core.src_id, core.dst_id, core.assert_atn)
                };
                bus.begin_selection(src_id, dst_id, atn);
                self.core.borrow_mut().next_state = SeqState::SelEnd;
                self.seq_defer_state(SEL_TIME_OUT);
            }
            SeqState::SelEnd => {
                let (bus, src_id, dst_id) = {
                    let core = self.core.borrow();
                    (core.bus.clone(), core.src_id, core.dst_id)
                };
                if bus.end_selection(src_id, dst_id) {
                    bus.release_ctrl_line(src_id, CtrlLines::SEL);
                    log::trace!("{}: selection completed", self.name());
                    self.step_completed();
                } else {
                    // selection timeout
                    bus.disconnect(src_id);
                    self.core.borrow_mut().cur_state = SeqState::Idle;
                    self.report_error(CtrlError::SelTimeout);
                }
            }
            SeqState::SendMsg => {
                let (bus, src_id, fifo_pos) = {
                    let core = self.core.borrow();
                    (core.bus.clone(), core.src_id, core.fifo_pos)
                };
                if fifo_pos != 0 {
                    bus.target_xfer_data();
                    bus.release_ctrl_line(src_id, CtrlLines::ATN);
                    if self.core.borrow().to_xfer <= 0 {
                        self.step_completed();
                    }
                }
            }
            SeqState::SendCmd => {
                self.bus().target_xfer_data();
                if self.core.borrow().fifo_pos == 0 {
                    self.step_completed();
                }
            }
            SeqState::XferBegin => {
                let phase = self.bus().current_phase();
                self.core.borrow_mut().cur_bus_phase = phase;
                match phase {
                    ScsiPhase::DataOut => {
                        self.core.borrow_mut().cur_state = SeqState::SendData;
                    }
                    ScsiPhase::DataIn => {
                        let mut bytes_in = self.core.borrow().fifo_pos as i32;
                        let mut bytes_out = self.core.borrow().bytes_out;
                        self.bus().negotiate_xfer(&mut bytes_in, &mut bytes_out);
                        {
                            let mut core = self.core.borrow_mut();
                            core.fifo_pos = bytes_in as usize;
                            core.bytes_out = bytes_out;
                            core.cur_state = SeqState::RcvData;
                        }
                        self.rcv_data();
                    }
                    _ => {}
                }
            }
            SeqState::XferEnd => {
                if self.core.borrow().is_initiator {
                    self.bus().target_next_step();
                }
                self.step_completed();
            }
            SeqState::SendData => {
                let (bus, dst_id, chunk) = {
                    let core = self.core.borrow();
                    (
                        core.bus.clone(),
                        core.dst_id,
                        core.data_fifo[..core.fifo_pos].to_vec(),
                    )
                };
                if bus.push_data(dst_id, &chunk) {
                    let drained = {
                        let mut core = self.core.borrow_mut();
                        core.to_xfer -= core.fifo_pos as i32;
                        core.fifo_pos = 0;
                        core.to_xfer <= 0
                    };
                    if drained {
                        self.core.borrow_mut().cur_state = SeqState::XferEnd;
                        self.sequencer();
                    }
                }
            }
            SeqState::RcvData => {
                // check for unexpected bus phase changes
                let expected = self.core.borrow().cur_bus_phase;
                if self.bus().current_phase() != expected {
                    log::warn!("{}: phase mismatch!", self.name());
                } else if !self.rcv_data() {
                    self.core.borrow_mut().cur_state = SeqState::XferEnd;
                    self.sequencer();
                }
            }
            SeqState::RcvStatus | SeqState::RcvMessage => {
                let mut bytes_in = self.core.borrow().fifo_pos as i32;
                let mut bytes_out = self.core.borrow().bytes_out;
                self.bus().negotiate_xfer(&mut bytes_in, &mut bytes_out);
                self.core.borrow_mut().bytes_out = bytes_out;
                self.rcv_data();
                if self.core.borrow().is_initiator {
                    let (bus, src_id) = {
                        let core = self.core.borrow();
                        (core.bus.clone(), core.src_id)
                    };
                    if cur_state == SeqState::RcvMessage {
                        bus.assert_ctrl_line(src_id, CtrlLines::ACK);
                    }
                    bus.target_next_step();
                    self.step_completed();
                    self.core.borrow_mut().cur_state = SeqState::Idle;
                }
            }
        }
    }

    /// Pull target data into the FIFO. Returns false when nothing was moved
    /// (REQ negated or the transfer count is exhausted).
    fn rcv_data(&self) -> bool {
        // return if the REQ line is negated
        if self.bus().test_ctrl_lines(CtrlLines::REQ) == 0 {
            return false;
        }

        let (bus, dst_id, req_count) = {
            let core = self.core.borrow();
            if core.to_xfer == 0 {
                return false;
            }
            let req_count = (core.to_xfer as usize).min(DATA_FIFO_MAX - core.fifo_pos);
            (core.bus.clone(), core.dst_id, req_count)
        };

        let mut buf = vec![0u8; req_count];
        bus.pull_data(dst_id, &mut buf);

        let mut core = self.core.borrow_mut();
        let pos = core.fifo_pos;
        core.data_fifo[pos..pos + req_count].copy_from_slice(&buf);
        core.fifo_pos += req_count;
        core.to_xfer -= req_count as i32;
        true
    }

    // ── FIFO access for the owning controller ─────────────────

    /// Replace the FIFO contents wholesale (command and message payloads).
    pub fn load_fifo(&self, bytes: &[u8]) {
        let mut core = self.core.borrow_mut();
        assert!(bytes.len() <= DATA_FIFO_MAX);
        core.data_fifo[..bytes.len()].copy_from_slice(bytes);
        core.fifo_pos = bytes.len();
    }

    pub fn fifo_push(&self, data: u8) {
        let run_sequencer = {
            let mut core = self.core.borrow_mut();
            if core.fifo_pos < DATA_FIFO_MAX {
                let pos = core.fifo_pos;
                core.data_fifo[pos] = data;
                core.fifo_pos += 1;
                if core.xfer_count == 0 {
                    log::warn!("{}: zero xfer_count!", core.name);
                }
                core.xfer_count -= 1;
                core.xfer_count == 0
            } else {
                true
            }
        };
        if run_sequencer {
            self.sequencer();
        }
    }

    pub fn fifo_pop(&self) -> u8 {
        let (data, refill) = {
            let mut core = self.core.borrow_mut();
            let mut data = 0u8;
            if core.fifo_pos != 0 {
                data = core.data_fifo[0];
                core.fifo_pos -= 1;
                let pos = core.fifo_pos;
                core.data_fifo.copy_within(1..=pos, 0);
            }
            (data, core.fifo_pos == 0)
        };
        // see if the FIFO needs a refill
        if refill {
            self.sequencer();
        }
        data
    }

    /// DMA drain: empty the FIFO into `buf`, then pull the rest of the
    /// transfer directly from the target. Returns the bytes still owed.
    pub fn xfer_from(&self, buf: &mut [u8]) -> usize {
        let mut len = buf.len();
        let mut buf_pos = 0usize;

        {
            let core = self.core.borrow();
            if len as i32 > core.to_xfer + core.fifo_pos as i32 {
                log::warn!("{}: DMA xfer len > command xfer len", core.name);
            }
        }

        let fifo_bytes = {
            let mut core = self.core.borrow_mut();
            let fifo_bytes = core.fifo_pos.min(len);
            buf[..fifo_bytes].copy_from_slice(&core.data_fifo[..fifo_bytes]);
            let remaining = core.fifo_pos - fifo_bytes;
            core.data_fifo.copy_within(fifo_bytes..fifo_bytes + remaining, 0);
            core.fifo_pos = remaining;
            fifo_bytes
        };
        len -= fifo_bytes;
        buf_pos += fifo_bytes;

        let (bus, dst_id, dma_bytes) = {
            let core = self.core.borrow();
            (
                core.bus.clone(),
                core.dst_id,
                (core.to_xfer.max(0) as usize).min(len),
            )
        };

        if dma_bytes != 0 && bus.pull_data(dst_id, &mut buf[buf_pos..buf_pos + dma_bytes]) {
            let done = {
                let mut core = self.core.borrow_mut();
                core.to_xfer -= dma_bytes as i32;
                core.to_xfer <= 0
            };
            if done {
                self.core.borrow_mut().cur_state = SeqState::XferEnd;
                self.sequencer();
            }
            return 0;
        }

        len - dma_bytes
    }

    /// Take `len` bytes out of the FIFO front (bus port helper).
    fn send_data_from_fifo(&self, dst: &mut [u8]) -> usize {
        let mut core = self.core.borrow_mut();
        let actual_count = core.fifo_pos.min(dst.len());
        dst[..actual_count].copy_from_slice(&core.data_fifo[..actual_count]);

        // remove the consumed bytes from the FIFO
        let remaining = core.fifo_pos - actual_count;
        core.data_fifo
            .copy_within(actual_count..actual_count + remaining, 0);
        core.fifo_pos = remaining;
        core.to_xfer -= actual_count as i32;

        actual_count
    }

    fn name(&self) -> String {
        self.core.borrow().name.clone()
    }

    fn step_completed(&self) {
        let cb = self.core.borrow().on_step.clone();
        if let Some(cb) = cb {
            (cb.borrow_mut())();
        }
    }

    fn report_error(&self, error: CtrlError) {
        let cb = self.core.borrow().on_error.clone();
        if let Some(cb) = cb {
            (cb.borrow_mut())(error);
        }
    }
}

// ── Bus port ──────────────────────────────────────────────────

/// The controller's presence on the SCSI bus: receives notifications and
/// serves initiator-side data requests out of the controller FIFO.
pub struct CtrlPort {
    name: String,
    ctrl: ScsiCtrl,
}

impl ScsiDevice for CtrlPort {
    fn scsi_name(&self) -> &str {
        &self.name
    }

    fn notify(&mut self, notif: ScsiNotification) {
        match notif {
            ScsiNotification::ConfirmSel(target_id) => {
                let confirmed = {
                    let mut core = self.ctrl.core.borrow_mut();
                    if core.dst_id == target_id {
                        // cancel the selection timeout timer
                        let timer_id = core.seq_timer_id;
                        core.seq_timer_id = 0;
                        core.cur_state = SeqState::SelEnd;
                        core.timers.cancel_timer(timer_id);
                        true
                    } else {
                        false
                    }
                };
                if confirmed {
                    self.ctrl.sequencer();
                } else {
                    log::warn!("{}: ignore invalid selection confirmation message", self.name);
                }
            }
            ScsiNotification::BusPhaseChange(phase) => {
                self.ctrl.core.borrow_mut().cur_bus_phase = phase;
            }
        }
    }

    fn send_data(&mut self, dst: &mut [u8]) -> usize {
        self.ctrl.send_data_from_fifo(dst)
    }
}
