//! PCI-to-PCI bridge (header type 1).
//!
//! A bridge is a PCI function with secondary/subordinate bus numbers and
//! three forwarding windows: memory, I/O (optionally 32-bit via upper16
//! registers) and prefetchable memory (optionally 64-bit via upper32
//! registers). Configuration cycles reach devices behind it through the
//! host's type-1 walk; I/O cycles are forwarded when they fall inside the
//! I/O window.

use crate::memctrl::MmioDevice;
use crate::pci::device::{PciCfgState, PciDevice, PCI_HEADER_TYPE_1};
use crate::pci::host::PciHost;
use crate::pci::AccessDetails;

pub struct PciBridge {
    cfg: PciCfgState,
    /// The secondary bus behind this bridge.
    pub host: PciHost,

    pub primary_bus: u8,
    pub secondary_bus: u8,
    pub subordinate_bus: u8,
    sec_latency_timer: u8,
    sec_status: u16,

    memory_base: u16,
    memory_limit: u16,
    memory_base_32: u32,
    memory_limit_32: u32,
    memory_cfg: u16,

    io_base: u8,
    io_limit: u8,
    io_base_32: u32,
    io_limit_32: u32,
    io_cfg: u8,
    io_base_upper16: u16,
    io_limit_upper16: u16,

    pref_mem_base: u16,
    pref_mem_limit: u16,
    pref_mem_cfg: u16,
    pref_base_upper32: u32,
    pref_limit_upper32: u32,
    pref_mem_base_64: u64,
    pref_mem_limit_64: u64,
}

impl PciBridge {
    pub fn new(name: &str) -> Self {
        let mut cfg = PciCfgState::new(name, PCI_HEADER_TYPE_1, 2);
        cfg.class_rev = 0x0604_0000;
        Self {
            cfg,
            host: PciHost::new(name),
            primary_bus: 0,
            secondary_bus: 0,
            subordinate_bus: 0,
            sec_latency_timer: 0,
            sec_status: 0,
            memory_base: 0,
            memory_limit: 0,
            memory_base_32: 0,
            memory_limit_32: 0,
            memory_cfg: 0xFFF0,
            io_base: 0,
            io_limit: 0,
            io_base_32: 0,
            io_limit_32: 0,
            // low nibble 1: 32-bit I/O addressing, upper16 registers live
            io_cfg: 0xF1,
            io_base_upper16: 0,
            io_limit_upper16: 0,
            pref_mem_base: 0,
            pref_mem_limit: 0,
            // low nibble 1: 64-bit prefetchable, upper32 registers live
            pref_mem_cfg: 0xFFF1,
            pref_base_upper32: 0,
            pref_limit_upper32: 0,
            pref_mem_base_64: 0,
            pref_mem_limit_64: 0,
        }
    }

    pub fn set_bus_range(&mut self, secondary: u8, subordinate: u8) {
        self.secondary_bus = secondary;
        self.subordinate_bus = subordinate;
    }

    pub fn io_window(&self) -> (u32, u32) {
        (self.io_base_32, self.io_limit_32)
    }

    pub fn memory_window(&self) -> (u32, u32) {
        (self.memory_base_32, self.memory_limit_32)
    }

    pub fn pref_window(&self) -> (u64, u64) {
        (self.pref_mem_base_64, self.pref_mem_limit_64)
    }

    // ── Window register latches ───────────────────────────────

    fn wr_memory_base(&mut self, val: u16) {
        self.memory_base = (val & self.memory_cfg) | (self.memory_cfg & 15);
        self.memory_base_32 = ((self.memory_base as u32) & 0xFFF0) << 16;
    }

    fn wr_memory_limit(&mut self, val: u16) {
        self.memory_limit = (val & self.memory_cfg) | (self.memory_cfg & 15);
        self.memory_limit_32 = (((self.memory_limit as u32) & 0xFFF0) << 16) + 0x10_0000;
    }

    fn wr_io_base(&mut self, val: u8) {
        self.io_base = (val & self.io_cfg) | (self.io_cfg & 15);
        self.io_base_32 =
            ((self.io_base_upper16 as u32) << 16) | (((self.io_base as u32) & 0xF0) << 8);
    }

    fn wr_io_limit(&mut self, val: u8) {
        self.io_limit = (val & self.io_cfg) | (self.io_cfg & 15);
        self.io_limit_32 = (((self.io_limit_upper16 as u32) << 16)
            | (((self.io_limit as u32) & 0xF0) << 8))
            + 0x1000;
    }

    fn wr_pref_mem_base(&mut self, val: u16) {
        self.pref_mem_base = (val & self.pref_mem_cfg) | (self.pref_mem_cfg & 15);
        self.pref_mem_base_64 = ((self.pref_base_upper32 as u64) << 32)
            | (((self.pref_mem_base as u64) & 0xFFF0) << 16);
    }

    fn wr_pref_mem_limit(&mut self, val: u16) {
        self.pref_mem_limit = (val & self.pref_mem_cfg) | (self.pref_mem_cfg & 15);
        self.pref_mem_limit_64 = (((self.pref_limit_upper32 as u64) << 32)
            | (((self.pref_mem_limit as u64) & 0xFFF0) << 16))
            + 0x10_0000;
    }

    fn wr_io_base_upper16(&mut self, val: u16) {
        if self.io_base & 15 == 1 {
            self.io_base_upper16 = val;
        }
        self.io_base_32 =
            ((self.io_base_upper16 as u32) << 16) | (((self.io_base as u32) & 0xF0) << 8);
    }

    fn wr_io_limit_upper16(&mut self, val: u16) {
        if self.io_limit & 15 == 1 {
            self.io_limit_upper16 = val;
        }
        self.io_limit_32 = (((self.io_limit_upper16 as u32) << 16)
            | (((self.io_limit as u32) & 0xF0) << 8))
            + 0x1000;
    }

    fn wr_pref_base_upper32(&mut self, val: u32) {
        if self.pref_mem_cfg & 15 == 1 {
            self.pref_base_upper32 = val;
        }
        self.pref_mem_base_64 = ((self.pref_base_upper32 as u64) << 32)
            | (((self.pref_mem_base as u64) & 0xFFF0) << 16);
    }

    fn wr_pref_limit_upper32(&mut self, val: u32) {
        if self.pref_mem_cfg & 15 == 1 {
            self.pref_limit_upper32 = val;
        }
        self.pref_mem_limit_64 = (((self.pref_limit_upper32 as u64) << 32)
            | (((self.pref_mem_limit as u64) & 0xFFF0) << 16))
            + 0x10_0000;
    }
}

impl MmioDevice for PciBridge {
    fn name(&self) -> &str {
        &self.cfg.name
    }

    fn read(&mut self, _rgn_start: u32, offset: u32, _size: u32) -> u32 {
        log::warn!("{}: unhandled MMIO read @{:X}", self.cfg.name, offset);
        0
    }

    fn write(&mut self, _rgn_start: u32, offset: u32, _value: u32, _size: u32) {
        log::warn!("{}: unhandled MMIO write @{:X}", self.cfg.name, offset);
    }
}

impl PciDevice for PciBridge {
    fn cfg(&self) -> &PciCfgState {
        &self.cfg
    }

    fn cfg_mut(&mut self) -> &mut PciCfgState {
        &mut self.cfg
    }

    fn pci_cfg_read(&mut self, reg_offs: u32, details: &AccessDetails) -> u32 {
        match reg_offs {
            super::PCI_CFG_BAR0 | super::PCI_CFG_BAR1 => {
                self.cfg.bars[((reg_offs - 0x10) >> 2) as usize]
            }
            super::PCI_CFG_PRIMARY_BUS => {
                ((self.sec_latency_timer as u32) << 24)
                    | ((self.subordinate_bus as u32) << 16)
                    | ((self.secondary_bus as u32) << 8)
                    | self.primary_bus as u32
            }
            super::PCI_CFG_IO_BASE => {
                ((self.sec_status as u32) << 16)
                    | ((self.io_limit as u32) << 8)
                    | self.io_base as u32
            }
            super::PCI_CFG_MEMORY_BASE => {
                ((self.memory_limit as u32) << 16) | self.memory_base as u32
            }
            super::PCI_CFG_PREF_MEM_BASE => {
                ((self.pref_mem_limit as u32) << 16) | self.pref_mem_base as u32
            }
            super::PCI_CFG_PREF_BASE_UPPER32 => self.pref_base_upper32,
            super::PCI_CFG_PREF_LIMIT_UPPER32 => self.pref_limit_upper32,
            super::PCI_CFG_IO_BASE_UPPER16 => {
                ((self.io_limit_upper16 as u32) << 16) | self.io_base_upper16 as u32
            }
            super::PCI_CFG_CAP_PTR => self.cfg.cap_ptr as u32,
            super::PCI_CFG_BRIDGE_ROM_ADDRESS => self.cfg.exp_rom_bar,
            _ => self.cfg.cfg_read_common(reg_offs, details),
        }
    }

    fn pci_cfg_write(&mut self, reg_offs: u32, value: u32, details: &AccessDetails) {
        match reg_offs {
            super::PCI_CFG_BAR0 | super::PCI_CFG_BAR1 => {
                let bar_num = ((reg_offs - 0x10) >> 2) as usize;
                if self.cfg.set_bar_value(bar_num, value) {
                    self.notify_bar_change(bar_num);
                }
            }
            super::PCI_CFG_PRIMARY_BUS => {
                self.sec_latency_timer = (value >> 24) as u8;
                self.subordinate_bus = (value >> 16) as u8;
                self.secondary_bus = (value >> 8) as u8;
                self.primary_bus = value as u8;
            }
            super::PCI_CFG_IO_BASE => {
                // secondary status bits are write-1-to-clear
                self.sec_status &= !(0b1111_1001_0000_0000 & (value >> 16) as u16);
                self.wr_io_limit((value >> 8) as u8);
                self.wr_io_base(value as u8);
            }
            super::PCI_CFG_MEMORY_BASE => {
                self.wr_memory_limit((value >> 16) as u16);
                self.wr_memory_base(value as u16);
            }
            super::PCI_CFG_PREF_MEM_BASE => {
                self.wr_pref_mem_limit((value >> 16) as u16);
                self.wr_pref_mem_base(value as u16);
            }
            super::PCI_CFG_PREF_BASE_UPPER32 => self.wr_pref_base_upper32(value),
            super::PCI_CFG_PREF_LIMIT_UPPER32 => self.wr_pref_limit_upper32(value),
            super::PCI_CFG_IO_BASE_UPPER16 => {
                self.wr_io_limit_upper16((value >> 16) as u16);
                self.wr_io_base_upper16(value as u16);
            }
            super::PCI_CFG_BRIDGE_ROM_ADDRESS => self.cfg.pci_wr_exp_rom_bar(value),
            _ => self.cfg.cfg_write_common(reg_offs, value, details),
        }
    }

    fn supports_io_space(&self) -> bool {
        // a bridge always participates in the I/O broadcast; window and
        // command gating happen per access
        true
    }

    fn pci_io_read(&mut self, offset: u32, size: u32) -> Option<u32> {
        if self.cfg.command & 1 == 0 {
            return None;
        }
        if offset < self.io_base_32 || offset + size >= self.io_limit_32 {
            return None;
        }
        self.host.pci_io_read_loop(offset, size)
    }

    fn pci_io_write(&mut self, offset: u32, value: u32, size: u32) -> bool {
        if self.cfg.command & 1 == 0 {
            return false;
        }
        if offset < self.io_base_32 || offset + size >= self.io_limit_32 {
            return false;
        }
        self.host.pci_io_write_loop(offset, value, size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d4() -> AccessDetails {
        AccessDetails {
            size: 4,
            offset: 0,
            flags: 0,
        }
    }

    #[test]
    fn bus_numbers_latch() {
        let mut bridge = PciBridge::new("pci-bridge");
        bridge.pci_cfg_write(crate::pci::PCI_CFG_PRIMARY_BUS, 0x0000_0201, &d4());
        assert_eq!(bridge.primary_bus, 1);
        assert_eq!(bridge.secondary_bus, 2);
        assert_eq!(bridge.subordinate_bus, 0);
    }

    #[test]
    fn memory_window_decodes() {
        let mut bridge = PciBridge::new("pci-bridge");
        // base 0x8000_0000, limit 0x8FFF_FFFF
        bridge.pci_cfg_write(crate::pci::PCI_CFG_MEMORY_BASE, 0x8FF0_8000, &d4());
        let (base, limit) = bridge.memory_window();
        assert_eq!(base, 0x8000_0000);
        assert_eq!(limit, 0x9000_0000);
    }

    #[test]
    fn io_window_uses_upper16_when_32bit_capable() {
        let mut bridge = PciBridge::new("pci-bridge");
        bridge.pci_cfg_write(crate::pci::PCI_CFG_IO_BASE, 0x0000_F010, &d4());
        bridge.pci_cfg_write(crate::pci::PCI_CFG_IO_BASE_UPPER16, 0x0002_0001, &d4());
        let (base, limit) = bridge.io_window();
        assert_eq!(base, 0x0001_1000);
        assert_eq!(limit, 0x0002_F000 + 0x1000);
    }

    #[test]
    fn pref_window_uses_upper32() {
        let mut bridge = PciBridge::new("pci-bridge");
        bridge.pci_cfg_write(crate::pci::PCI_CFG_PREF_MEM_BASE, 0xFFF0_0010, &d4());
        bridge.pci_cfg_write(crate::pci::PCI_CFG_PREF_BASE_UPPER32, 0x0000_0001, &d4());
        let (base, _limit) = bridge.pref_window();
        assert_eq!(base, 0x1_0010_0000);
    }
}
