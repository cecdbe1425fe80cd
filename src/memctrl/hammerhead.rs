//! Hammerhead memory controller (TNT machines).
//!
//! Hammerhead's registers are one byte wide, mapped at 0xF8000000, and are
//! always presented in the most significant byte of a wider access. RAM
//! arrives as up to 13 DIMMs, each contributing one or two banks; the
//! machine builder inserts the configured DIMMs and maps the total as one
//! region at address zero.

use std::cell::RefCell;
use std::rc::Rc;

use super::{MemCtrlRef, MmioDevice};

pub const DRAM_CAP_2MB: u32 = 0x20_0000;
pub const DRAM_CAP_4MB: u32 = 0x40_0000;
pub const DRAM_CAP_8MB: u32 = 0x80_0000;
pub const DRAM_CAP_16MB: u32 = 0x100_0000;
pub const DRAM_CAP_32MB: u32 = 0x200_0000;
pub const DRAM_CAP_64MB: u32 = 0x400_0000;
pub const DRAM_CAP_128MB: u32 = 0x800_0000;

/// Register window of the configuration and status registers.
pub const REGS_BASE: u32 = 0xF800_0000;
pub const REGS_SIZE: u32 = 0x500;

/// Motherboard ID bits.
pub const MBID_VCI0_PRESENT: u8 = 1 << 2;
pub const MBID_PCI2_PRESENT: u8 = 1 << 1;

pub const BUS_SPEED_40_MHZ: u8 = 0;
pub const BUS_SPEED_45_MHZ: u8 = 1;
pub const BUS_SPEED_50_MHZ: u8 = 2;

const HH_CPU_ID_TNT: u32 = 0xE0;
const BM_PRIMARY_CPU: u32 = 1;

mod reg {
    pub const CPU_ID: u32 = 0x000;
    pub const MOTHERBOARD_ID: u32 = 0x010;
    pub const CPU_SPEED: u32 = 0x020;
    pub const ARBITER_CONFIG: u32 = 0x090;
    pub const WHO_AM_I: u32 = 0x0B0;
    pub const L2_CACHE_CONFIG: u32 = 0x0D0;
    pub const MEM_TIMING_0: u32 = 0x0E0;
    pub const MEM_TIMING_1: u32 = 0x0F0;
    pub const REFRESH_TIMING: u32 = 0x100;
    pub const ROM_TIMING: u32 = 0x110;
    pub const BANK_0_BASE_MSB: u32 = 0x1E0;
    pub const BANK_25_BASE_LSB: u32 = 0x380;
}

pub struct HammerheadCtrl {
    mem_ctrl: MemCtrlRef,
    mb_id: u8,
    rom_type: u8,
    bus_speed: u8,
    arb_config: u32,
    bank_base: [u16; 26],
    bank_size: [u32; 26],
}

impl HammerheadCtrl {
    pub fn new(mem_ctrl: MemCtrlRef) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            mem_ctrl,
            mb_id: 0,
            rom_type: 1,
            bus_speed: BUS_SPEED_50_MHZ,
            arb_config: 0,
            bank_base: [0; 26],
            bank_size: [0; 26],
        }))
    }

    pub fn set_motherboard_id(&mut self, mb_id: u8) {
        self.mb_id = mb_id;
    }

    pub fn set_bus_speed(&mut self, bus_speed: u8) {
        self.bus_speed = bus_speed;
    }

    /// Install one DIMM; a 128 MB module occupies both banks of its slot.
    pub fn insert_ram_dimm(&mut self, slot_num: usize, capacity: u32) {
        if slot_num >= 13 {
            panic!("Hammerhead: invalid DIMM slot number {}", slot_num);
        }
        match capacity {
            0 => {}
            DRAM_CAP_2MB | DRAM_CAP_4MB | DRAM_CAP_8MB | DRAM_CAP_16MB | DRAM_CAP_32MB
            | DRAM_CAP_64MB => {
                self.bank_size[slot_num * 2] = capacity;
            }
            DRAM_CAP_128MB => {
                self.bank_size[slot_num * 2] = DRAM_CAP_64MB;
                self.bank_size[slot_num * 2 + 1] = DRAM_CAP_64MB;
            }
            _ => panic!("Hammerhead: unsupported DRAM capacity {}", capacity),
        }
    }

    /// Allocate and map the physical RAM of all populated banks.
    pub fn map_phys_ram(&mut self) {
        let total_ram: u32 = self.bank_size.iter().sum();

        log::info!("Hammerhead: total RAM size = {} bytes", total_ram);

        if self
            .mem_ctrl.add_ram_region(0x0000_0000, total_ram)
            .is_err()
        {
            panic!("Hammerhead: could not allocate physical RAM storage");
        }
    }
}

impl MmioDevice for HammerheadCtrl {
    fn name(&self) -> &str {
        "Hammerhead"
    }

    fn read(&mut self, _rgn_start: u32, offset: u32, size: u32) -> u32 {
        let result = if (reg::BANK_0_BASE_MSB..=reg::BANK_25_BASE_LSB).contains(&offset) {
            let idx = (offset - reg::BANK_0_BASE_MSB) >> 4;
            let bank = (idx >> 1) as usize;
            if idx & 1 != 0 {
                (self.bank_base[bank] & 0xFF) as u32
            } else {
                (self.bank_base[bank] >> 8) as u32
            }
        } else {
            match offset {
                reg::CPU_ID => HH_CPU_ID_TNT,
                reg::MOTHERBOARD_ID => ((self.mb_id as u32) << 5) | ((self.rom_type as u32) << 4),
                reg::CPU_SPEED => (self.bus_speed as u32) << 5,
                reg::ARBITER_CONFIG => self.arb_config,
                reg::WHO_AM_I => BM_PRIMARY_CPU << 3,
                reg::L2_CACHE_CONFIG => 0, // say there is no L2 cache
                _ => {
                    log::warn!("Hammerhead: unknown register read at offset 0x{:X}", offset);
                    return 0;
                }
            }
        };

        // registers are one byte wide so the result always lands in the MSB
        // of a multibyte read
        result << ((size - 1) << 3)
    }

    fn write(&mut self, _rgn_start: u32, offset: u32, value: u32, size: u32) {
        // extract the byte value from the MSB of a multibyte access
        let value = value >> ((size - 1) << 3);

        if (reg::BANK_0_BASE_MSB..=reg::BANK_25_BASE_LSB).contains(&offset) {
            let idx = (offset - reg::BANK_0_BASE_MSB) >> 4;
            let bank = (idx >> 1) as usize;
            if idx & 1 != 0 {
                self.bank_base[bank] = (self.bank_base[bank] & 0xFF00) | value as u16;
            } else {
                self.bank_base[bank] = (self.bank_base[bank] & 0x00FF) | ((value as u16) << 8);
            }
            log::info!(
                "Hammerhead: bank base #{} set to 0x{:X}",
                bank,
                self.bank_base[bank]
            );
            return;
        }

        match offset {
            reg::MEM_TIMING_0
            | reg::MEM_TIMING_1
            | reg::REFRESH_TIMING
            | reg::ROM_TIMING => {
                log::trace!("Hammerhead: timing register 0x{:X} set to 0x{:X}", offset, value);
            }
            reg::ARBITER_CONFIG => self.arb_config = value,
            _ => {
                log::warn!("Hammerhead: unknown register write at offset 0x{:X}", offset);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memctrl::MemCtrl;

    #[test]
    fn dimms_sum_into_one_ram_region() {
        let mem = MemCtrl::new();
        let hh = HammerheadCtrl::new(mem.clone());
        hh.borrow_mut().insert_ram_dimm(0, DRAM_CAP_16MB);
        hh.borrow_mut().insert_ram_dimm(1, DRAM_CAP_128MB);
        hh.borrow_mut().map_phys_ram();

        let entry = mem.find_range(0).unwrap();
        assert_eq!(entry.end, DRAM_CAP_16MB + DRAM_CAP_128MB - 1);
    }

    #[test]
    fn byte_registers_land_in_msb() {
        let mem = MemCtrl::new();
        let hh = HammerheadCtrl::new(mem.clone());
        hh.borrow_mut().set_bus_speed(BUS_SPEED_50_MHZ);
        let mut hh = hh.borrow_mut();
        assert_eq!(hh.read(REGS_BASE, reg::CPU_SPEED, 1), 2 << 5);
        assert_eq!(hh.read(REGS_BASE, reg::CPU_SPEED, 2), (2 << 5) << 8);
        assert_eq!(hh.read(REGS_BASE, reg::CPU_ID, 4), 0xE0 << 24);
    }

    #[test]
    fn bank_base_registers_hold_16_bits() {
        let mem = MemCtrl::new();
        let hh = HammerheadCtrl::new(mem.clone());
        let mut hh = hh.borrow_mut();
        hh.write(REGS_BASE, reg::BANK_0_BASE_MSB, 0x12, 1);
        hh.write(REGS_BASE, reg::BANK_0_BASE_MSB + 0x10, 0x34, 1);
        assert_eq!(hh.read(REGS_BASE, reg::BANK_0_BASE_MSB, 1), 0x12);
        assert_eq!(hh.read(REGS_BASE, reg::BANK_0_BASE_MSB + 0x10, 1), 0x34);
    }
}
