//! PCI device base state: configuration header, BARs, expansion ROM.
//!
//! Concrete PCI devices embed a [`PciCfgState`] and implement [`PciDevice`];
//! the trait's default methods serve the standard type-0 header registers and
//! the BAR sizing protocol, so a device only overrides what it extends.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use bitflags::bitflags;

use crate::interrupts::IntCtrlRef;
use crate::memctrl::{MmioDevice, MmioRef};
use crate::pci::{AccessDetails, PCI_CONFIG_DIRECTION, PCI_CONFIG_READ};

bitflags! {
    /// Command register bits a device actually honors.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PciCommand: u16 {
        const IO_SPACE     = 1 << 0;
        const MEM_SPACE    = 1 << 1;
        const BUS_MASTER   = 1 << 2;
        const SPECIAL_CYC  = 1 << 3;
        const MWI_ENABLE   = 1 << 4;
        const VGA_SNOOP    = 1 << 5;
        const PARITY_RESP  = 1 << 6;
        const STEPPING     = 1 << 7;
        const SERR_ENABLE  = 1 << 8;
        const FAST_B2B     = 1 << 9;
        const INTX_DISABLE = 1 << 10;
    }
}

/// Configuration space header types.
pub const PCI_HEADER_TYPE_0: u8 = 0; // device
pub const PCI_HEADER_TYPE_1: u8 = 1; // PCI-PCI bridge

/// BAR type derived from the configured size mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BarType {
    #[default]
    Unused,
    Io16Bit,
    Io32Bit,
    Mem20Bit, // legacy type for < 1MB memory
    Mem32Bit,
    Mem64BitLo,
    Mem64BitHi,
}

/// Address map changes requested by a device (BAR or expansion ROM moves).
/// The owning host drains these after each config access and applies them,
/// so a device never re-enters the bus fabric from inside its own borrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingReq {
    Add { start: u32, size: u32 },
    Remove { start: u32, size: u32 },
}

/// Interrupt wiring injected by the host from its IRQ map.
#[derive(Clone)]
pub struct IntDetails {
    pub int_ctrl: IntCtrlRef,
    pub irq_id: u64,
}

// ── Base state ────────────────────────────────────────────────

pub struct PciCfgState {
    pub name: String,

    pub vendor_id: u16,
    pub device_id: u16,
    pub class_rev: u32,
    pub cache_ln_sz: u8,
    pub lat_timer: u8,
    pub hdr_type: u8,
    pub cap_ptr: u8,
    pub command: u16,
    pub status: u16,
    pub irq_pin: u8,
    pub irq_line: u8,

    pub has_io_space: bool,
    num_bars: usize,
    pub bars: [u32; 6],
    bars_cfg: [u32; 6],
    bars_typ: [BarType; 6],

    pub exp_bar_cfg: u32,
    pub exp_rom_bar: u32,
    pub exp_rom_addr: u32,
    exp_rom_data: Vec<u8>,

    /// 1-bits mark command register bits the device implements.
    pub command_cfg: u16,

    pub int_details: Option<IntDetails>,
    mapping_reqs: Vec<MappingReq>,
}

impl PciCfgState {
    pub fn new(name: &str, hdr_type: u8, num_bars: usize) -> Self {
        Self {
            name: name.to_string(),
            vendor_id: 0,
            device_id: 0,
            class_rev: 0,
            cache_ln_sz: 0,
            lat_timer: 0,
            hdr_type,
            cap_ptr: 0,
            command: 0,
            status: 0,
            irq_pin: 0,
            irq_line: 0,
            has_io_space: false,
            num_bars,
            bars: [0; 6],
            bars_cfg: [0; 6],
            bars_typ: [BarType::Unused; 6],
            exp_bar_cfg: 0,
            exp_rom_bar: 0,
            exp_rom_addr: 0,
            exp_rom_data: Vec::new(),
            // disabled: special cycles and stepping
            command_cfg: 0xFFFF - (1 << 3) - (1 << 7),
            int_details: None,
            mapping_reqs: Vec::new(),
        }
    }

    pub fn set_multi_function(&mut self, is_multi_function: bool) {
        self.hdr_type = if is_multi_function {
            self.hdr_type | 0x80
        } else {
            self.hdr_type & 0x7F
        };
    }

    // ── BAR setup ─────────────────────────────────────────────

    /// Configure BAR size masks and derive the BAR types.
    pub fn setup_bars(&mut self, cfg_data: &[(usize, u32)]) {
        for &(bar_num, bar_cfg) in cfg_data {
            if bar_num > self.num_bars {
                panic!("{}: BAR number {} out of range", self.name, bar_num);
            }
            self.bars_cfg[bar_num] = bar_cfg;
        }
        self.finish_config_bars();
    }

    fn finish_config_bars(&mut self) {
        let mut bar_num = 0;
        while bar_num < self.num_bars {
            let bar_cfg = self.bars_cfg[bar_num];
            if bar_cfg == 0 {
                bar_num += 1;
                continue; // skip unimplemented BARs
            }
            if bar_cfg & 1 != 0 {
                self.bars_typ[bar_num] = if bar_cfg & 0xFFFF_0000 != 0 {
                    BarType::Io32Bit
                } else {
                    BarType::Io16Bit
                };
                self.has_io_space = true;
            } else {
                match (bar_cfg >> 1) & 3 {
                    0 => self.bars_typ[bar_num] = BarType::Mem32Bit,
                    1 => self.bars_typ[bar_num] = BarType::Mem20Bit,
                    2 => {
                        if bar_num >= self.num_bars - 1 {
                            panic!("{}: BAR {} cannot be 64-bit", self.name, bar_num);
                        }
                        if self.bars_cfg[bar_num + 1] == 0 {
                            panic!(
                                "{}: 64-bit BAR {} has zero for upper 32 bits",
                                self.name, bar_num
                            );
                        }
                        self.bars_typ[bar_num] = BarType::Mem64BitLo;
                        bar_num += 1;
                        self.bars_typ[bar_num] = BarType::Mem64BitHi;
                    }
                    _ => panic!(
                        "{}: invalid or unsupported PCI space type for BAR {}",
                        self.name, bar_num
                    ),
                }
            }
            bar_num += 1;
        }
    }

    pub fn bar_type(&self, bar_num: usize) -> BarType {
        self.bars_typ[bar_num]
    }

    /// Latch a BAR write. Returns true when the device should be notified,
    /// i.e. for everything except the `0xFFFFFFFF` sizing probe.
    pub fn set_bar_value(&mut self, bar_num: usize, value: u32) -> bool {
        let bar_cfg = self.bars_cfg[bar_num];
        match self.bars_typ[bar_num] {
            BarType::Unused => return false,
            BarType::Io16Bit | BarType::Io32Bit => {
                self.bars[bar_num] = (value & bar_cfg & !3) | (bar_cfg & 3);
                if value != 0xFFFF_FFFF && (value & !3) != (value & bar_cfg & !3) {
                    log::error!(
                        "{}: BAR {} cannot be 0x{:08X} (set to 0x{:08X})",
                        self.name,
                        bar_num,
                        value & !3,
                        value & bar_cfg & !3
                    );
                }
            }
            BarType::Mem20Bit | BarType::Mem32Bit | BarType::Mem64BitLo => {
                self.bars[bar_num] = (value & bar_cfg & !0xF) | (bar_cfg & 0xF);
                if value != 0xFFFF_FFFF && (value & !0xF) != (value & bar_cfg & !0xF) {
                    log::error!(
                        "{}: BAR {} cannot be 0x{:08X} (set to 0x{:08X})",
                        self.name,
                        bar_num,
                        value & !0xF,
                        value & bar_cfg & !0xF
                    );
                }
            }
            BarType::Mem64BitHi => {
                self.bars[bar_num] = value & bar_cfg;
            }
        }
        value != 0xFFFF_FFFF // don't notify the device during BAR sizing
    }

    // ── Expansion ROM ─────────────────────────────────────────

    /// Validate and attach an expansion ROM image.
    pub fn attach_exp_rom_image(&mut self, image: &[u8]) -> io::Result<()> {
        self.exp_bar_cfg = 0; // no ROM until the image checks out

        if image.len() < 0x1A || image[0] != 0x55 || image[1] != 0xAA {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid expansion ROM signature",
            ));
        }
        if image.len() > 4 * 1024 * 1024 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "expansion ROM file too large",
            ));
        }
        let pci_struct_offset = u16::from_le_bytes([image[0x18], image[0x19]]) as usize;
        if pci_struct_offset + 4 > image.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid PCI structure offset",
            ));
        }
        if &image[pci_struct_offset..pci_struct_offset + 4] != b"PCIR" {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unexpected PCI struct signature",
            ));
        }

        // minimum ROM window for the image: power of two >= 0x800
        let mut rom_size = 1usize << 11;
        while rom_size < image.len() {
            rom_size <<= 1;
        }

        self.exp_rom_data = vec![0xFF; rom_size];
        self.exp_rom_data[..image.len()].copy_from_slice(image);

        if image.len() == rom_size {
            log::info!("{}: loaded expansion rom ({} bytes).", self.name, rom_size);
        } else {
            log::warn!(
                "{}: loaded expansion rom ({} bytes adjusted to {} bytes).",
                self.name,
                image.len(),
                rom_size
            );
        }
        self.exp_bar_cfg = !(rom_size as u32 - 1);
        Ok(())
    }

    pub fn pci_wr_exp_rom_bar(&mut self, data: u32) {
        if self.exp_bar_cfg == 0 {
            return;
        }
        self.exp_rom_bar = data & (self.exp_bar_cfg | 1);
        if (data & self.exp_bar_cfg) == self.exp_bar_cfg {
            return; // sizing probe
        }
        if self.exp_rom_bar & 1 != 0 {
            self.map_exp_rom_mem();
        } else {
            self.unmap_exp_rom_mem();
        }
    }

    fn map_exp_rom_mem(&mut self) {
        let rom_addr = self.exp_rom_bar & self.exp_bar_cfg;
        let rom_size = !self.exp_bar_cfg + 1;
        if rom_addr != 0 {
            if self.exp_rom_addr != rom_addr {
                self.unmap_exp_rom_mem();
                self.mapping_reqs.push(MappingReq::Add {
                    start: rom_addr,
                    size: rom_size,
                });
                self.exp_rom_addr = rom_addr;
            }
        } else {
            self.unmap_exp_rom_mem();
        }
    }

    fn unmap_exp_rom_mem(&mut self) {
        if self.exp_rom_addr != 0 {
            let rom_size = !self.exp_bar_cfg + 1;
            self.mapping_reqs.push(MappingReq::Remove {
                start: self.exp_rom_addr,
                size: rom_size,
            });
            self.exp_rom_addr = 0;
        }
    }

    /// Serve a read from the mapped expansion ROM window.
    pub fn exp_rom_read(&self, offset: u32, size: u32) -> u32 {
        let mut val = 0u32;
        for i in 0..size {
            let byte = *self
                .exp_rom_data
                .get((offset + i) as usize)
                .unwrap_or(&0xFF);
            val = (val << 8) | byte as u32;
        }
        val
    }

    /// Requests queued by BAR/ROM updates; the host applies them.
    pub fn take_mapping_requests(&mut self) -> Vec<MappingReq> {
        std::mem::take(&mut self.mapping_reqs)
    }

    pub fn push_mapping_request(&mut self, req: MappingReq) {
        self.mapping_reqs.push(req);
    }

    // ── Common header registers ───────────────────────────────

    pub fn cfg_read_common(&mut self, reg_offs: u32, details: &AccessDetails) -> u32 {
        match reg_offs {
            super::PCI_CFG_DEV_ID => ((self.device_id as u32) << 16) | self.vendor_id as u32,
            super::PCI_CFG_STAT_CMD => ((self.status as u32) << 16) | self.command as u32,
            super::PCI_CFG_CLASS_REV => self.class_rev,
            super::PCI_CFG_DWORD_3 => {
                ((self.hdr_type as u32) << 16)
                    | ((self.lat_timer as u32) << 8)
                    | self.cache_ln_sz as u32
            }
            _ => {
                self.log_unimplemented_read(reg_offs, details);
                0
            }
        }
    }

    pub fn cfg_write_common(&mut self, reg_offs: u32, value: u32, details: &AccessDetails) {
        match reg_offs {
            super::PCI_CFG_STAT_CMD => {
                // status bits are write-1-to-clear, command bits latch only
                // where the device implements them
                self.status &= !(0b1111_1001_0000_0000 & (value >> 16) as u16);
                self.command = (self.command & !self.command_cfg)
                    | ((value as u16) & self.command_cfg);
            }
            super::PCI_CFG_DWORD_3 => {
                self.lat_timer = (value >> 8) as u8;
                self.cache_ln_sz = value as u8;
            }
            _ => self.log_unimplemented_write(reg_offs, value, details),
        }
    }

    pub fn log_unimplemented_read(&self, reg_offs: u32, details: &AccessDetails) {
        if details.flags & PCI_CONFIG_DIRECTION == PCI_CONFIG_READ {
            log::warn!(
                "{}: read unimplemented config register @{:02X}.{}",
                self.name,
                reg_offs + details.offset as u32,
                details.size
            );
        }
    }

    pub fn log_unimplemented_write(&self, reg_offs: u32, value: u32, details: &AccessDetails) {
        log::warn!(
            "{}: write unimplemented config register @{:02X}.{} = {:X}",
            self.name,
            reg_offs + details.offset as u32,
            details.size,
            value
        );
    }
}

// ── Device trait ──────────────────────────────────────────────

/// A PCI function. Also an [`MmioDevice`] so BAR and expansion ROM windows
/// can be dispatched straight to it.
pub trait PciDevice: MmioDevice {
    fn cfg(&self) -> &PciCfgState;
    fn cfg_mut(&mut self) -> &mut PciCfgState;

    /// Serve a naturally aligned config dword read.
    fn pci_cfg_read(&mut self, reg_offs: u32, details: &AccessDetails) -> u32 {
        match reg_offs {
            super::PCI_CFG_BAR0..=super::PCI_CFG_BAR5 => {
                self.cfg().bars[((reg_offs - super::PCI_CFG_BAR0) >> 2) as usize]
            }
            super::PCI_CFG_ROM_BAR => self.cfg().exp_rom_bar,
            super::PCI_CFG_CAP_PTR => self.cfg().cap_ptr as u32,
            super::PCI_CFG_DWORD_15 => {
                ((self.cfg().irq_pin as u32) << 8) | self.cfg().irq_line as u32
            }
            _ => self.cfg_mut().cfg_read_common(reg_offs, details),
        }
    }

    /// Serve a naturally aligned config dword write.
    fn pci_cfg_write(&mut self, reg_offs: u32, value: u32, details: &AccessDetails) {
        match reg_offs {
            super::PCI_CFG_BAR0..=super::PCI_CFG_BAR5 => {
                let bar_num = ((reg_offs - super::PCI_CFG_BAR0) >> 2) as usize;
                if self.cfg_mut().set_bar_value(bar_num, value) {
                    self.notify_bar_change(bar_num);
                }
            }
            super::PCI_CFG_ROM_BAR => self.cfg_mut().pci_wr_exp_rom_bar(value),
            super::PCI_CFG_DWORD_15 => self.cfg_mut().irq_line = value as u8,
            _ => self.cfg_mut().cfg_write_common(reg_offs, value, details),
        }
    }

    /// Called after a BAR latched a new base address (never during sizing).
    fn notify_bar_change(&mut self, _bar_num: usize) {}

    fn supports_io_space(&self) -> bool {
        self.cfg().has_io_space
    }

    /// I/O space access; return `Some(value)` / `true` to claim the access.
    fn pci_io_read(&mut self, _offset: u32, _size: u32) -> Option<u32> {
        None
    }

    fn pci_io_write(&mut self, _offset: u32, _value: u32, _size: u32) -> bool {
        false
    }

    /// Drive this function's interrupt line through the wiring the host
    /// injected from its IRQ map.
    fn pci_interrupt(&mut self, level: u8) {
        if self.cfg().command & PciCommand::INTX_DISABLE.bits() != 0 {
            return;
        }
        match self.cfg().int_details.clone() {
            Some(details) => details.int_ctrl.borrow_mut().ack_int(details.irq_id, level),
            None => log::error!("Unhandled interrupt from device {}", self.cfg().name),
        }
    }
}

pub type PciDeviceRef = Rc<RefCell<dyn PciDevice>>;

/// A PCI device under both of its personalities: the config-space target and
/// the MMIO responder. Both handles alias the same object; keeping the pair
/// avoids needing trait object upcasts in the host.
#[derive(Clone)]
pub struct PciDeviceHandle {
    pub dev: PciDeviceRef,
    pub mmio: MmioRef,
}

impl PciDeviceHandle {
    pub fn new<T: PciDevice + 'static>(dev: &Rc<RefCell<T>>) -> Self {
        Self {
            dev: Rc::clone(dev) as PciDeviceRef,
            mmio: Rc::clone(dev) as MmioRef,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestDev {
        cfg: PciCfgState,
        bar_changes: Vec<usize>,
    }

    impl TestDev {
        fn new() -> Self {
            let mut cfg = PciCfgState::new("testdev", PCI_HEADER_TYPE_0, 6);
            cfg.vendor_id = 0x106B;
            cfg.device_id = 0x1234;
            cfg.class_rev = 0x0300_0001;
            cfg.setup_bars(&[(0, 0xFFFF_0000), (1, 0x0000_FFF1)]);
            Self {
                cfg,
                bar_changes: Vec::new(),
            }
        }
    }

    impl MmioDevice for TestDev {
        fn name(&self) -> &str {
            &self.cfg.name
        }
        fn read(&mut self, _rgn_start: u32, _offset: u32, _size: u32) -> u32 {
            0
        }
        fn write(&mut self, _rgn_start: u32, _offset: u32, _value: u32, _size: u32) {}
    }

    impl PciDevice for TestDev {
        fn cfg(&self) -> &PciCfgState {
            &self.cfg
        }
        fn cfg_mut(&mut self) -> &mut PciCfgState {
            &mut self.cfg
        }
        fn notify_bar_change(&mut self, bar_num: usize) {
            self.bar_changes.push(bar_num);
        }
    }

    fn details() -> AccessDetails {
        AccessDetails {
            size: 4,
            offset: 0,
            flags: 0,
        }
    }

    #[test]
    fn bar_sizing_returns_mask_without_notification() {
        let mut dev = TestDev::new();
        dev.pci_cfg_write(super::super::PCI_CFG_BAR0, 0xFFFF_FFFF, &details());
        assert_eq!(dev.pci_cfg_read(super::super::PCI_CFG_BAR0, &details()), 0xFFFF_0000);
        assert!(dev.bar_changes.is_empty());
    }

    #[test]
    fn bar_write_latches_base_and_notifies() {
        let mut dev = TestDev::new();
        dev.pci_cfg_write(super::super::PCI_CFG_BAR0, 0x8000_0000, &details());
        assert_eq!(dev.pci_cfg_read(super::super::PCI_CFG_BAR0, &details()), 0x8000_0000);
        assert_eq!(dev.bar_changes, vec![0]);
    }

    #[test]
    fn io_bar_preserves_low_bits() {
        let mut dev = TestDev::new();
        assert!(dev.cfg().has_io_space);
        assert_eq!(dev.cfg().bar_type(1), BarType::Io16Bit);
        dev.pci_cfg_write(super::super::PCI_CFG_BAR1, 0xFFFF_FFFF, &details());
        assert_eq!(dev.pci_cfg_read(super::super::PCI_CFG_BAR1, &details()), 0x0000_FFF1);
    }

    #[test]
    fn header_dword_reads() {
        let mut dev = TestDev::new();
        assert_eq!(dev.pci_cfg_read(super::super::PCI_CFG_DEV_ID, &details()), 0x1234_106B);
        assert_eq!(
            dev.pci_cfg_read(super::super::PCI_CFG_CLASS_REV, &details()),
            0x0300_0001
        );
    }

    #[test]
    fn command_write_respects_mask() {
        let mut dev = TestDev::new();
        dev.pci_cfg_write(super::super::PCI_CFG_STAT_CMD, 0x0000_FFFF, &details());
        // special cycles (bit 3) and stepping (bit 7) never latch
        assert_eq!(dev.cfg().command & (1 << 3 | 1 << 7), 0);
    }

    #[test]
    fn exp_rom_arming_queues_mapping() {
        let mut dev = TestDev::new();
        let mut image = vec![0u8; 0x800];
        image[0] = 0x55;
        image[1] = 0xAA;
        image[0x18] = 0x40; // PCIR struct offset
        image[0x40..0x44].copy_from_slice(b"PCIR");
        dev.cfg_mut().attach_exp_rom_image(&image).unwrap();
        assert_eq!(dev.cfg().exp_bar_cfg, !(0x800u32 - 1));

        // sizing probe leaves the window unmapped
        dev.pci_cfg_write(super::super::PCI_CFG_ROM_BAR, 0xFFFF_F800, &details());
        assert!(dev.cfg_mut().take_mapping_requests().is_empty());

        // arming with bit 0 set maps it
        dev.pci_cfg_write(super::super::PCI_CFG_ROM_BAR, 0x8100_0001, &details());
        assert_eq!(
            dev.cfg_mut().take_mapping_requests(),
            vec![MappingReq::Add {
                start: 0x8100_0000,
                size: 0x800
            }]
        );

        // disarming unmaps it
        dev.pci_cfg_write(super::super::PCI_CFG_ROM_BAR, 0, &details());
        assert_eq!(
            dev.cfg_mut().take_mapping_requests(),
            vec![MappingReq::Remove {
                start: 0x8100_0000,
                size: 0x800
            }]
        );
    }
}
