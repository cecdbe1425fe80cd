//! SCSI bus, bus-controller sequencer and target-side device protocol.
//!
//! The bus object tracks per-device control-line masks and the current
//! phase; the controller sequencer (the shared abstraction under MESH and
//! the Curio 53C94) walks arbitration, selection and the transfer phases on
//! virtual-time delays; targets implement the device side of the protocol.

pub mod bus;
pub mod ctrl;
pub mod device;
pub mod hd;

pub use bus::{ScsiBus, ScsiDevice, ScsiDeviceRef};
pub use ctrl::{CtrlError, ScsiCtrl, SeqState};
pub use device::{ScsiTargetDevice, TargetState};
pub use hd::ScsiHardDisk;

use bitflags::bitflags;

bitflags! {
    /// SCSI control signals. Bit positions follow the MESH controller
    /// convention for easier mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CtrlLines: u16 {
        const IO  = 1 << 0;
        const CD  = 1 << 1;
        const MSG = 1 << 2;
        const ATN = 1 << 3;
        const ACK = 1 << 4;
        const REQ = 1 << 5;
        const SEL = 1 << 13;
        const BSY = 1 << 14;
        const RST = 1 << 15;
    }
}

/// SCSI bus phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScsiPhase {
    BusFree,
    Arbitration,
    Selection,
    Reselection,
    Command,
    DataIn,
    DataOut,
    Status,
    MessageIn,
    MessageOut,
    Reset,
}

/// Internal notification codes of this SCSI implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScsiNotification {
    /// A target confirmed the selection; the parameter is its ID.
    ConfirmSel(usize),
    BusPhaseChange(ScsiPhase),
}

/// SCSI status codes.
pub mod scsi_status {
    pub const GOOD: u8 = 0;
    pub const CHECK_CONDITION: u8 = 2;
}

/// Standard message codes.
pub mod scsi_message {
    pub const COMMAND_COMPLETE: u8 = 0;
    pub const IDENTIFY: u8 = 0x80;
}

/// Extended message codes.
pub mod scsi_ext_message {
    pub const MODIFY_DATA_PTR: u8 = 0;
    pub const SYNCH_XFER_REQ: u8 = 1;
    pub const WIDE_XFER_REQ: u8 = 3;
}

/// Sense keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScsiSense {
    NoSense = 0x0,
    Recovered = 0x1,
    NotReady = 0x2,
    MediumErr = 0x3,
    HwError = 0x4,
    IllegalReq = 0x5,
    UnitAttention = 0x6,
    DataProtect = 0x7,
}

/// Additional sense codes.
pub mod scsi_error {
    pub const NO_ERROR: u8 = 0x00;
    pub const NO_SECTOR: u8 = 0x01;
    pub const WRITE_FAULT: u8 = 0x03;
    pub const DEV_NOT_READY: u8 = 0x04;
    pub const INVALID_CMD: u8 = 0x20;
    pub const INVALID_LBA: u8 = 0x21;
    pub const INVALID_CDB: u8 = 0x24;
    pub const INVALID_LUN: u8 = 0x25;
    pub const WRITE_PROTECT: u8 = 0x27;
    pub const MEDIUM_NOT_PRESENT: u8 = 0x3A;
}

/// Common CDB opcodes.
pub mod scsi_cmd {
    pub const TEST_UNIT_READY: u8 = 0x00;
    pub const REQ_SENSE: u8 = 0x03;
    pub const READ_6: u8 = 0x08;
    pub const WRITE_6: u8 = 0x0A;
    pub const INQUIRY: u8 = 0x12;
    pub const MODE_SENSE_6: u8 = 0x1A;
    pub const READ_CAPACITY_10: u8 = 0x25;
    pub const READ_10: u8 = 0x28;
    pub const WRITE_10: u8 = 0x2A;
}

/// Standard SCSI bus timing values, in nanoseconds.
pub const BUS_SETTLE_DELAY: u64 = 400;
pub const BUS_FREE_DELAY: u64 = 800;
pub const BUS_CLEAR_DELAY: u64 = 800;
pub const ARB_DELAY: u64 = 2400;
pub const SEL_ABORT_TIME: u64 = 200_000;
pub const SEL_TIME_OUT: u64 = 250_000_000;

pub const SCSI_MAX_DEVS: usize = 8;

/// CDB length by command group (top 3 bits of the opcode). Negative means
/// the group is unassigned and a hard error.
pub const CMD_GROUP_LEN: [i8; 8] = [6, 10, 10, -1, -1, 12, -1, -1];

/// Canonical (CD, IO, MSG) assertion for an information-transfer phase.
pub fn phase_signals(phase: ScsiPhase) -> CtrlLines {
    match phase {
        ScsiPhase::Command => CtrlLines::CD,
        ScsiPhase::DataIn => CtrlLines::IO,
        ScsiPhase::DataOut => CtrlLines::empty(),
        ScsiPhase::Status => CtrlLines::CD | CtrlLines::IO,
        ScsiPhase::MessageOut => CtrlLines::CD | CtrlLines::MSG,
        ScsiPhase::MessageIn => CtrlLines::CD | CtrlLines::MSG | CtrlLines::IO,
        _ => CtrlLines::empty(),
    }
}
