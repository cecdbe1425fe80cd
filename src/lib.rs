//! Platform fabric of an Old World Power Macintosh emulator.
//!
//! This crate models the wiring every device of a mid-1990s Power Mac plugs
//! into: the physical address map with MMIO dispatch, the PCI host/device/
//! bridge hierarchy, the interrupt aggregation graph, the descriptor-based
//! DMA engine, the SCSI bus and its controller sequencer, the virtual-time
//! timer scheduler, and the per-model machine composers. The PowerPC core
//! itself and the register files of the individual peripherals are external
//! collaborators that consume these contracts.

pub mod dbdma;
pub mod interrupts;
pub mod ioctrl;
pub mod machine;
pub mod memctrl;
pub mod pci;
pub mod scsi;
pub mod timers;
