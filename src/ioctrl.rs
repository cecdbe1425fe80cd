//! mac-io style IO hubs: Grand Central, Heathrow, O'Hare, and the PDM-era
//! AMIC.
//!
//! An IO hub is the aggregation point of the interrupt fabric: every
//! on-board peripheral and every PCI slot line funnels into its event/mask
//! registers and from there into the single CPU interrupt line. The PCI
//! members (Grand Central, Heathrow, O'Hare) are PCI devices whose BAR0
//! window carries the peripheral register file and the DBDMA channel
//! registers; AMIC is a plain MMIO device with a pseudo-VIA2 second stage.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::dbdma::{DmaChannel, DmaChannelRef};
use crate::interrupts::{int_to_irq_id, CpuIntRef, IntLatch, IntSrc, InterruptCtrl};
use crate::memctrl::{MemCtrlRef, MmioDevice};
use crate::pci::device::{MappingReq, PciCfgState, PciDevice, PCI_HEADER_TYPE_0};
use crate::pci::PCI_VENDOR_APPLE;

/// 68k-emulation mode flag in the interrupt mask register.
pub const MACIO_INT_MODE: u32 = 0x8000_0000;

/// mac-io PCI device ids.
pub const MIO_DEV_ID_GRANDCENTRAL: u16 = 0x0002;
pub const MIO_DEV_ID_OHARE: u16 = 0x0007;
pub const MIO_DEV_ID_HEATHROW: u16 = 0x0010;

/// Interrupt register block (32-bit little-endian registers inside BAR0).
mod int_reg {
    pub const EVENTS_2: u32 = 0x10;
    pub const MASK_2: u32 = 0x14;
    pub const CLEAR_2: u32 = 0x18;
    pub const LEVELS_2: u32 = 0x1C;
    pub const EVENTS_1: u32 = 0x20;
    pub const MASK_1: u32 = 0x24;
    pub const CLEAR_1: u32 = 0x28;
    pub const LEVELS_1: u32 = 0x2C;
}

/// DBDMA channel block: base + channel * 0x100.
const DMA_BLOCK_BASE: u32 = 0x8000;
const DMA_BLOCK_END: u32 = 0x9000;

/// IOBus expansion window: one 4 KB slot per board-level register file.
const IOBUS_BASE: u32 = 0x1A000;
const IOBUS_END: u32 = 0x20000;

/// DBDMA channel numbers inside the hub.
pub mod dma_chan {
    pub const SCSI_CURIO: u32 = 0x0;
    pub const FLOPPY: u32 = 0x1;
    pub const ETH_XMIT: u32 = 0x2;
    pub const ETH_RCV: u32 = 0x3;
    pub const ESCC_A_XMIT: u32 = 0x4;
    pub const ESCC_A_RCV: u32 = 0x5;
    pub const ESCC_B_XMIT: u32 = 0x6;
    pub const ESCC_B_RCV: u32 = 0x7;
    pub const SND_OUT: u32 = 0x8;
    pub const SND_IN: u32 = 0x9;
}

// ── MacIo base ────────────────────────────────────────────────

pub struct MacIoBase {
    cfg: PciCfgState,
    iomem_size: u32,
    base_addr: u32,

    latch: IntLatch,
    cpu_int: CpuIntRef,

    dma_channels: HashMap<u32, DmaChannelRef>,
    iobus_devices: HashMap<u32, crate::memctrl::MmioRef>,
}

pub type MacIoRef = Rc<RefCell<MacIoBase>>;

impl MacIoBase {
    pub fn new(name: &str, dev_id: u16, rev: u8, mem_ctrl: MemCtrlRef, cpu_int: CpuIntRef) -> MacIoRef {
        let mut cfg = PciCfgState::new(&format!("mac-io_{}", name), PCI_HEADER_TYPE_0, 1);
        cfg.vendor_id = PCI_VENDOR_APPLE;
        cfg.device_id = dev_id;
        cfg.class_rev = 0xFF00_0000 + rev as u32;
        cfg.cache_ln_sz = 8;

        // memory mapped I/O size: 128 KB for Grand Central, 512 KB for others
        let iomem_size: u32 = if dev_id == MIO_DEV_ID_GRANDCENTRAL {
            0x2_0000
        } else {
            0x8_0000
        };
        cfg.setup_bars(&[(0, iomem_size.wrapping_neg())]);

        let macio = Rc::new(RefCell::new(Self {
            cfg,
            iomem_size,
            base_addr: 0,
            latch: IntLatch::new(),
            cpu_int,
            dma_channels: HashMap::new(),
            iobus_devices: HashMap::new(),
        }));

        // create the standard DMA channel complement and wire each channel
        // to its interrupt bit
        let channels = [
            (dma_chan::SCSI_CURIO, "scsi_curio", IntSrc::DmaScsi),
            (dma_chan::FLOPPY, "floppy", IntSrc::DmaSwim3),
            (dma_chan::ESCC_A_XMIT, "escc_a_tx", IntSrc::DmaSccaTx),
            (dma_chan::ESCC_A_RCV, "escc_a_rx", IntSrc::DmaSccaRx),
            (dma_chan::ESCC_B_XMIT, "escc_b_tx", IntSrc::DmaSccbTx),
            (dma_chan::ESCC_B_RCV, "escc_b_rx", IntSrc::DmaSccbRx),
            (dma_chan::SND_OUT, "snd_out", IntSrc::DmaDavbusTx),
            (dma_chan::SND_IN, "snd_in", IntSrc::DmaDavbusRx),
        ];
        for (chan_num, chan_name, int_src) in channels {
            let channel = Rc::new(RefCell::new(DmaChannel::new(chan_name, mem_ctrl.clone())));
            let irq_id = macio.borrow_mut().register_dma_int(int_src);
            channel
                .borrow_mut()
                .register_dma_int(macio.clone(), irq_id);
            macio.borrow_mut().dma_channels.insert(chan_num, channel);
        }

        macio
    }

    pub fn dma_channel(&self, chan_num: u32) -> Option<DmaChannelRef> {
        self.dma_channels.get(&chan_num).cloned()
    }

    /// Hang a board-level register file off the hub's IOBus window.
    pub fn attach_iodevice(&mut self, slot: u32, dev: crate::memctrl::MmioRef) {
        self.iobus_devices.insert(slot, dev);
    }

    pub fn int_events(&self) -> u64 {
        self.latch.int_events
    }

    pub fn int_levels(&self) -> u64 {
        self.latch.int_levels
    }

    fn notify_bar_change_impl(&mut self, bar_num: usize) {
        if bar_num != 0 {
            return; // only BAR0 is supported
        }
        let new_base = self.cfg.bars[0] & 0xFFFF_FFF0;
        if self.base_addr != new_base {
            if self.base_addr != 0 {
                self.cfg.push_mapping_request(MappingReq::Remove {
                    start: self.base_addr,
                    size: self.iomem_size,
                });
            }
            self.base_addr = new_base;
            self.cfg.push_mapping_request(MappingReq::Add {
                start: self.base_addr,
                size: self.iomem_size,
            });
            log::info!("{}: base address set to 0x{:X}", self.cfg.name, self.base_addr);
        }
    }

    fn ack_int_common(&mut self, irq_id: u64, irq_line_state: u8) {
        // native mode:   set IRQ bits in int_events on a 0-to-1 transition
        // emulated mode: set IRQ bits in int_events on all transitions
        self.latch.emulated_mode = self.latch.int_mask & MACIO_INT_MODE as u64 != 0;
        self.latch.ack(irq_id, irq_line_state);
        self.signal_cpu_int();
    }

    fn signal_cpu_int(&mut self) {
        if self.latch.pending() {
            if !self.latch.cpu_int_latch {
                self.latch.cpu_int_latch = true;
                self.cpu_int.assert_line();
            } else {
                log::trace!("{}: CPU INT already latched", self.cfg.name);
            }
        }
    }

    fn clear_cpu_int(&mut self) {
        if !self.latch.pending() && self.latch.cpu_int_latch {
            self.latch.cpu_int_latch = false;
            self.cpu_int.release_line();
            log::trace!("{}: CPU INT latch cleared", self.cfg.name);
        }
    }

    fn int_reg_read(&mut self, offset: u32) -> u32 {
        match offset {
            int_reg::EVENTS_2 => (self.latch.int_events >> 32) as u32,
            int_reg::MASK_2 => (self.latch.int_mask >> 32) as u32,
            int_reg::LEVELS_2 => (self.latch.int_levels >> 32) as u32,
            int_reg::EVENTS_1 => self.latch.int_events as u32,
            int_reg::MASK_1 => self.latch.int_mask as u32,
            int_reg::LEVELS_1 => self.latch.int_levels as u32,
            int_reg::CLEAR_1 | int_reg::CLEAR_2 => 0,
            _ => unreachable!(),
        }
    }

    fn int_reg_write(&mut self, offset: u32, value: u32) {
        match offset {
            int_reg::MASK_2 => {
                self.latch.int_mask =
                    (self.latch.int_mask & 0xFFFF_FFFF) | ((value as u64) << 32);
                self.signal_cpu_int();
            }
            int_reg::MASK_1 => {
                self.latch.int_mask = (self.latch.int_mask & !0xFFFF_FFFFu64) | value as u64;
                self.signal_cpu_int();
            }
            int_reg::CLEAR_2 => {
                self.latch.clear_events((value as u64) << 32);
                self.clear_cpu_int();
            }
            int_reg::CLEAR_1 => {
                self.latch.clear_events(value as u64);
                self.clear_cpu_int();
            }
            int_reg::EVENTS_1 | int_reg::EVENTS_2 | int_reg::LEVELS_1 | int_reg::LEVELS_2 => {
                // read-only
            }
            _ => unreachable!(),
        }
    }
}

impl InterruptCtrl for MacIoBase {
    fn register_dev_int(&mut self, src: IntSrc) -> u64 {
        match src {
            IntSrc::Scsi => int_to_irq_id(0x0C),
            IntSrc::ScsiMesh => int_to_irq_id(0x0D),
            IntSrc::Ethernet => int_to_irq_id(0x0E),
            IntSrc::Scca => int_to_irq_id(0x0F),
            IntSrc::Sccb => int_to_irq_id(0x10),
            IntSrc::Davbus => int_to_irq_id(0x11),
            IntSrc::ViaCuda => int_to_irq_id(0x12),
            IntSrc::Swim3 => int_to_irq_id(0x13),
            IntSrc::Nmi => int_to_irq_id(0x14),
            IntSrc::PerchCard => int_to_irq_id(0x15),
            IntSrc::PciA => int_to_irq_id(0x16),
            IntSrc::PciB => int_to_irq_id(0x17),
            IntSrc::PciC => int_to_irq_id(0x18),
            IntSrc::PciD => int_to_irq_id(0x19),
            IntSrc::PciE => int_to_irq_id(0x1A),
            IntSrc::PciF => int_to_irq_id(0x1B),
            IntSrc::Bandit1 => int_to_irq_id(0x1C),
            IntSrc::Bandit2 => int_to_irq_id(0x1D),
            IntSrc::ControlVideo => int_to_irq_id(0x1E),
            IntSrc::PlanB => int_to_irq_id(0x1F),
            IntSrc::Vci => int_to_irq_id(0x20),
            _ => panic!("{}: unknown interrupt source {:?}", self.cfg.name, src),
        }
    }

    fn register_dma_int(&mut self, src: IntSrc) -> u64 {
        match src {
            IntSrc::DmaScsi => int_to_irq_id(0x00),
            IntSrc::DmaSwim3 => int_to_irq_id(0x01),
            IntSrc::DmaScsiMesh => int_to_irq_id(0x02),
            IntSrc::DmaEthTx => int_to_irq_id(0x02),
            IntSrc::DmaEthRx => int_to_irq_id(0x03),
            IntSrc::DmaSccaTx => int_to_irq_id(0x04),
            IntSrc::DmaSccaRx => int_to_irq_id(0x05),
            IntSrc::DmaSccbTx => int_to_irq_id(0x06),
            IntSrc::DmaSccbRx => int_to_irq_id(0x07),
            IntSrc::DmaDavbusTx => int_to_irq_id(0x08),
            IntSrc::DmaDavbusRx => int_to_irq_id(0x09),
            _ => panic!("{}: unknown DMA interrupt source {:?}", self.cfg.name, src),
        }
    }

    fn ack_int(&mut self, irq_id: u64, irq_line_state: u8) {
        self.ack_int_common(irq_id, irq_line_state);
    }

    fn ack_dma_int(&mut self, irq_id: u64, irq_line_state: u8) {
        self.ack_int_common(irq_id, irq_line_state);
    }
}

impl MmioDevice for MacIoBase {
    fn name(&self) -> &str {
        &self.cfg.name
    }

    fn read(&mut self, _rgn_start: u32, offset: u32, size: u32) -> u32 {
        if (int_reg::EVENTS_2..=int_reg::LEVELS_1).contains(&offset) {
            return self.int_reg_read(offset & !3).swap_bytes();
        }
        if (DMA_BLOCK_BASE..DMA_BLOCK_END).contains(&offset) {
            let chan_num = (offset - DMA_BLOCK_BASE) >> 8;
            if let Some(channel) = self.dma_channels.get(&chan_num) {
                return channel.borrow_mut().reg_read(offset & 0xFF, size);
            }
            log::warn!("{}: read from unimplemented DMA channel {}", self.cfg.name, chan_num);
            return 0;
        }
        if (IOBUS_BASE..IOBUS_END).contains(&offset) {
            let slot = (offset - IOBUS_BASE) >> 12;
            if let Some(dev) = self.iobus_devices.get(&slot) {
                let dev = Rc::clone(dev);
                return dev.borrow_mut().read(IOBUS_BASE + (slot << 12), offset & 0xFFF, size);
            }
        }
        // peripheral register files are external collaborators; firmware
        // probes them blindly, so unknown registers read as zero
        log::warn!("{}: unimplemented register read @{:05X}", self.cfg.name, offset);
        0
    }

    fn write(&mut self, _rgn_start: u32, offset: u32, value: u32, size: u32) {
        if (int_reg::EVENTS_2..=int_reg::LEVELS_1).contains(&offset) {
            self.int_reg_write(offset & !3, value.swap_bytes());
            return;
        }
        if (DMA_BLOCK_BASE..DMA_BLOCK_END).contains(&offset) {
            let chan_num = (offset - DMA_BLOCK_BASE) >> 8;
            if let Some(channel) = self.dma_channels.get(&chan_num) {
                channel.borrow_mut().reg_write(offset & 0xFF, value, size);
                return;
            }
            log::warn!("{}: write to unimplemented DMA channel {}", self.cfg.name, chan_num);
            return;
        }
        if (IOBUS_BASE..IOBUS_END).contains(&offset) {
            let slot = (offset - IOBUS_BASE) >> 12;
            if let Some(dev) = self.iobus_devices.get(&slot) {
                let dev = Rc::clone(dev);
                dev.borrow_mut()
                    .write(IOBUS_BASE + (slot << 12), offset & 0xFFF, value, size);
                return;
            }
        }
        log::warn!(
            "{}: unimplemented register write @{:05X} = {:X}",
            self.cfg.name,
            offset,
            value
        );
    }
}

impl PciDevice for MacIoBase {
    fn cfg(&self) -> &PciCfgState {
        &self.cfg
    }

    fn cfg_mut(&mut self) -> &mut PciCfgState {
        &mut self.cfg
    }

    fn notify_bar_change(&mut self, bar_num: usize) {
        self.notify_bar_change_impl(bar_num);
    }
}

/// Grand Central, the TNT IO hub.
pub fn grand_central(mem_ctrl: MemCtrlRef, cpu_int: CpuIntRef) -> MacIoRef {
    MacIoBase::new("GrandCentral", MIO_DEV_ID_GRANDCENTRAL, 2, mem_ctrl, cpu_int)
}

/// Heathrow, the Gossamer IO hub.
pub fn heathrow(mem_ctrl: MemCtrlRef, cpu_int: CpuIntRef) -> MacIoRef {
    MacIoBase::new("Heathrow", MIO_DEV_ID_HEATHROW, 1, mem_ctrl, cpu_int)
}

/// O'Hare, the PSX/Alchemy IO hub.
pub fn ohare(mem_ctrl: MemCtrlRef, cpu_int: CpuIntRef) -> MacIoRef {
    MacIoBase::new("OHare", MIO_DEV_ID_OHARE, 1, mem_ctrl, cpu_int)
}

// ── AMIC ──────────────────────────────────────────────────────

/// AMIC register window.
pub const AMIC_REGS_BASE: u32 = 0x50F0_0000;
pub const AMIC_REGS_SIZE: u32 = 0x4_0000;

mod amic_reg {
    pub const VIA2_SLOT_IFR: u32 = 0x26002;
    pub const VIA2_IFR: u32 = 0x26003;
    pub const VIA2_SLOT_IER: u32 = 0x26012;
    pub const VIA2_IER: u32 = 0x26013;
    pub const DMA_IFR_0: u32 = 0x32000;
    pub const DMA_IFR_1: u32 = 0x32001;
}

/// Apple Memory-mapped I/O Controller, the PDM-era IO hub. Device
/// interrupts aggregate through a pseudo-VIA2 stage, DMA interrupts through
/// two flag registers, both feeding one CPU line.
pub struct Amic {
    cpu_int: CpuIntRef,

    // pseudo VIA2 state
    via2_ier: u8,
    via2_ifr: u8,
    via2_irq: u8,

    // DMA IRQ flag registers
    dma_ifr0: u8,
    dma_ifr1: u8,
    dma_irq: u8,

    dev_irq_lines: u8,
}

pub type AmicRef = Rc<RefCell<Amic>>;

impl Amic {
    pub fn new(cpu_int: CpuIntRef) -> AmicRef {
        Rc::new(RefCell::new(Self {
            cpu_int,
            via2_ier: 0,
            via2_ifr: 0,
            via2_irq: 0,
            dma_ifr0: 0,
            dma_ifr1: 0,
            dma_irq: 0,
            dev_irq_lines: 0,
        }))
    }

    pub fn via2_ifr(&self) -> u8 {
        self.via2_ifr
    }

    fn update_via2_irq(&mut self) {
        let new_irq = u8::from(self.via2_ifr & self.via2_ier & 0x7F != 0);
        self.via2_irq = new_irq;
        self.via2_ifr = (self.via2_ifr & 0x7F) | (new_irq << 7);
        self.update_cpu_int();
    }

    fn update_cpu_int(&mut self) {
        if self.via2_irq != 0 || self.dma_irq != 0 {
            self.cpu_int.assert_line();
        } else {
            self.cpu_int.release_line();
        }
    }
}

impl InterruptCtrl for Amic {
    fn register_dev_int(&mut self, src: IntSrc) -> u64 {
        // pseudo-VIA2 IFR bit positions
        match src {
            IntSrc::ViaCuda => int_to_irq_id(0),
            IntSrc::Scsi => int_to_irq_id(3),
            IntSrc::Swim3 => int_to_irq_id(1),
            IntSrc::Scca | IntSrc::Sccb => int_to_irq_id(4),
            _ => panic!("AMIC: unknown interrupt source {:?}", src),
        }
    }

    fn register_dma_int(&mut self, src: IntSrc) -> u64 {
        // DMA IFR bits, offset past the VIA2 byte
        match src {
            IntSrc::DmaScsi => int_to_irq_id(8),
            IntSrc::DmaSwim3 => int_to_irq_id(9),
            IntSrc::DmaSccaTx => int_to_irq_id(10),
            IntSrc::DmaSccaRx => int_to_irq_id(11),
            IntSrc::DmaSccbTx => int_to_irq_id(12),
            IntSrc::DmaSccbRx => int_to_irq_id(13),
            IntSrc::DmaDavbusTx => int_to_irq_id(14),
            IntSrc::DmaDavbusRx => int_to_irq_id(15),
            _ => panic!("AMIC: unknown DMA interrupt source {:?}", src),
        }
    }

    fn ack_int(&mut self, irq_id: u64, irq_line_state: u8) {
        let bit = irq_id as u8;
        if irq_line_state != 0 {
            self.dev_irq_lines |= bit;
            self.via2_ifr |= bit;
        } else {
            self.dev_irq_lines &= !bit;
        }
        self.update_via2_irq();
    }

    fn ack_dma_int(&mut self, irq_id: u64, irq_line_state: u8) {
        let bits = (irq_id >> 8) as u16;
        if irq_line_state != 0 {
            self.dma_ifr0 |= bits as u8;
            self.dma_ifr1 |= (bits >> 8) as u8;
            self.dma_irq = 1;
        }
        self.update_cpu_int();
    }
}

impl MmioDevice for Amic {
    fn name(&self) -> &str {
        "AMIC"
    }

    fn read(&mut self, _rgn_start: u32, offset: u32, _size: u32) -> u32 {
        match offset {
            amic_reg::VIA2_IFR => self.via2_ifr as u32,
            amic_reg::VIA2_IER => self.via2_ier as u32,
            amic_reg::VIA2_SLOT_IFR => 0x7F, // no slot interrupts pending (reverse logic)
            amic_reg::VIA2_SLOT_IER => 0,
            amic_reg::DMA_IFR_0 => self.dma_ifr0 as u32,
            amic_reg::DMA_IFR_1 => self.dma_ifr1 as u32,
            _ => {
                log::warn!("AMIC: unimplemented register read @{:05X}", offset);
                0
            }
        }
    }

    fn write(&mut self, _rgn_start: u32, offset: u32, value: u32, _size: u32) {
        let value = value as u8;
        match offset {
            amic_reg::VIA2_IFR => {
                // write-1-to-clear, but live lines stay pending
                self.via2_ifr &= !(value & 0x7F) | self.dev_irq_lines;
                self.update_via2_irq();
            }
            amic_reg::VIA2_IER => {
                // bit 7 high: set bits, low: clear bits
                if value & 0x80 != 0 {
                    self.via2_ier |= value & 0x7F;
                } else {
                    self.via2_ier &= !value;
                }
                self.update_via2_irq();
            }
            amic_reg::DMA_IFR_0 => {
                self.dma_ifr0 &= !value;
                if self.dma_ifr0 == 0 && self.dma_ifr1 == 0 {
                    self.dma_irq = 0;
                }
                self.update_cpu_int();
            }
            amic_reg::DMA_IFR_1 => {
                self.dma_ifr1 &= !value;
                if self.dma_ifr0 == 0 && self.dma_ifr1 == 0 {
                    self.dma_irq = 0;
                }
                self.update_cpu_int();
            }
            _ => {
                log::warn!("AMIC: unimplemented register write @{:05X} = {:X}", offset, value);
            }
        }
    }
}
