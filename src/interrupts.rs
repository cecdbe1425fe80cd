//! Interrupt fabric: sources, controllers, and the CPU interrupt line.
//!
//! Devices register an interrupt source with their IO hub and get back an
//! opaque `irq_id`; a device interrupt source is distinct from a DMA
//! interrupt source and may live in a different bitfield of the same
//! controller. Asserting or releasing a line goes through `ack_int` /
//! `ack_dma_int` with the new line level.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Interrupt sources of the Old World platforms. Which ones a given IO hub
/// accepts depends on the machine model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntSrc {
    ViaCuda,
    Scsi,
    ScsiMesh,
    Swim3,
    Scca,
    Sccb,
    Ethernet,
    Davbus,
    Nmi,
    PerchCard,
    /// PCI slot interrupts, routed through the host's IRQ map.
    PciA,
    PciB,
    PciC,
    PciD,
    PciE,
    PciF,
    Bandit1,
    Bandit2,
    ControlVideo,
    PlanB,
    Vci,
    /// DMA interrupt sources.
    DmaScsi,
    DmaScsiMesh,
    DmaSwim3,
    DmaSccaTx,
    DmaSccaRx,
    DmaSccbTx,
    DmaSccbRx,
    DmaDavbusTx,
    DmaDavbusRx,
    DmaEthTx,
    DmaEthRx,
}

/// Opaque interrupt handle: a one-hot bit in the controller's event/level
/// words, issued at registration time.
pub const fn int_to_irq_id(bit_num: u32) -> u64 {
    1u64 << bit_num
}

/// Hierarchical interrupt aggregator (IO hub or AMIC).
pub trait InterruptCtrl {
    /// Register a device interrupt source and obtain its `irq_id`.
    fn register_dev_int(&mut self, src: IntSrc) -> u64;
    /// Register a DMA interrupt source and obtain its `irq_id`.
    fn register_dma_int(&mut self, src: IntSrc) -> u64;
    /// Acknowledge a change of a device interrupt line.
    fn ack_int(&mut self, irq_id: u64, level: u8);
    /// Acknowledge a change of a DMA interrupt line.
    fn ack_dma_int(&mut self, irq_id: u64, level: u8);
}

pub type IntCtrlRef = Rc<RefCell<dyn InterruptCtrl>>;

// ── CPU interrupt line ────────────────────────────────────────

/// The external interrupt input of the CPU core. The CPU collaborator polls
/// `is_asserted` between instructions; tests read the edge counters.
#[derive(Default)]
pub struct CpuIntLine {
    asserted: Cell<bool>,
    assert_edges: Cell<u64>,
    release_edges: Cell<u64>,
}

pub type CpuIntRef = Rc<CpuIntLine>;

impl CpuIntLine {
    pub fn new() -> CpuIntRef {
        Rc::new(Self::default())
    }

    pub fn assert_line(&self) {
        if !self.asserted.replace(true) {
            self.assert_edges.set(self.assert_edges.get() + 1);
        }
    }

    pub fn release_line(&self) {
        if self.asserted.replace(false) {
            self.release_edges.set(self.release_edges.get() + 1);
        }
    }

    pub fn is_asserted(&self) -> bool {
        self.asserted.get()
    }

    pub fn assert_edges(&self) -> u64 {
        self.assert_edges.get()
    }

    pub fn release_edges(&self) -> u64 {
        self.release_edges.get()
    }
}

// ── Common latching logic ─────────────────────────────────────

/// Event/level/mask state shared by every mac-io style controller.
///
/// Native mode latches an event on a 0-to-1 line transition only; the
/// 68k-emulation mode latches on every transition. The CPU line follows
/// `(events & mask) != 0`.
pub struct IntLatch {
    pub int_events: u64,
    pub int_levels: u64,
    pub int_mask: u64,
    pub cpu_int_latch: bool,
    /// 68k-emulation mode flag, usually the MSB of the mask register.
    pub emulated_mode: bool,
}

impl IntLatch {
    pub fn new() -> Self {
        Self {
            int_events: 0,
            int_levels: 0,
            int_mask: 0,
            cpu_int_latch: false,
            emulated_mode: false,
        }
    }

    /// Fold a line-level change into the event and level words.
    pub fn ack(&mut self, irq_id: u64, level: u8) {
        if self.emulated_mode || (level != 0 && (self.int_levels & irq_id) == 0) {
            self.int_events |= irq_id;
        } else {
            self.int_events &= !irq_id;
        }
        if level != 0 {
            self.int_levels |= irq_id;
        } else {
            self.int_levels &= !irq_id;
        }
    }

    /// Guest writes 1-bits to clear latched events.
    pub fn clear_events(&mut self, bits: u64) {
        self.int_events &= !bits;
    }

    pub fn pending(&self) -> bool {
        self.int_events & self.int_mask != 0
    }

    /// Drive the CPU line from the current event/mask state; returns the
    /// latched state after the update.
    pub fn update_cpu_int(&mut self, cpu_int: &CpuIntLine) {
        if self.pending() {
            if !self.cpu_int_latch {
                self.cpu_int_latch = true;
                cpu_int.assert_line();
            } else {
                log::debug!("CPU INT already latched");
            }
        } else if self.cpu_int_latch {
            self.cpu_int_latch = false;
            cpu_int.release_line();
            log::debug!("CPU INT latch cleared");
        }
    }
}

impl Default for IntLatch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_mode_latches_rising_edges_only() {
        let mut latch = IntLatch::new();
        let id = int_to_irq_id(3);
        latch.int_mask = id;

        latch.ack(id, 1);
        assert_eq!(latch.int_events, id);
        assert_eq!(latch.int_levels, id);

        // a repeated assert is not a 0-to-1 transition
        latch.ack(id, 1);
        assert_eq!(latch.int_events, 0);

        latch.ack(id, 0);
        latch.ack(id, 1);
        assert_eq!(latch.int_events, id);
        latch.ack(id, 0);
        assert_eq!(latch.int_events, 0);
        assert_eq!(latch.int_levels, 0);
    }

    #[test]
    fn emulated_mode_latches_every_transition() {
        let mut latch = IntLatch::new();
        latch.emulated_mode = true;
        let id = int_to_irq_id(5);

        latch.ack(id, 1);
        assert_eq!(latch.int_events, id);
        latch.ack(id, 0);
        // falling edge still latches the event in 68k mode
        assert_eq!(latch.int_events, id);
        assert_eq!(latch.int_levels, 0);
    }

    #[test]
    fn cpu_line_follows_events_and_mask() {
        let mut latch = IntLatch::new();
        let cpu = CpuIntLine::new();
        let id = int_to_irq_id(0);

        latch.ack(id, 1);
        latch.update_cpu_int(&cpu);
        // masked off: no assertion
        assert!(!cpu.is_asserted());

        latch.int_mask = id;
        latch.update_cpu_int(&cpu);
        assert!(cpu.is_asserted());

        latch.clear_events(id);
        latch.update_cpu_int(&cpu);
        assert!(!cpu.is_asserted());
        assert_eq!(cpu.assert_edges(), 1);
        assert_eq!(cpu.release_edges(), 1);
    }
}
