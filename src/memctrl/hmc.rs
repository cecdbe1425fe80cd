//! HMC, the Highspeed Memory Controller of the PDM machines (6100/7100/8100).
//!
//! The HMC is configured through a single bit-serial control register:
//! every write to offset 0 shifts one bit into an internal position counter,
//! a write to offset 8 resets the position. Reprogramming the RAM
//! configuration field relocates the optional bank B region, which is how
//! the firmware's memory sizing probes the SIMM population.

use std::cell::RefCell;
use std::rc::Rc;

use super::{MemCtrlRef, MmioDevice};

/// Register window of the bit-serial control register.
pub const REGS_BASE: u32 = 0x50F4_0000;
pub const REGS_SIZE: u32 = 0x1_0000;

pub const BANK_SIZE_2MB: u32 = 0x20_0000;
pub const BANK_SIZE_4MB: u32 = 0x40_0000;
pub const BANK_SIZE_8MB: u32 = 0x80_0000;
pub const BANK_SIZE_32MB: u32 = 0x200_0000;

/// Motherboard RAM lives at zero, the SIMM banks above it.
pub const BANK_MB_START: u32 = 0x0000_0000;
pub const BANK_A_START: u32 = 0x1000_0000;
pub const BANK_B_START: u32 = 0x2000_0000;

const HMC_CTRL_BITS: u32 = 35;
const HMC_RAM_CFG_POS: u32 = 29;

pub const BANK_CFG_128MB: u8 = 0;
pub const BANK_CFG_2MB: u8 = 1;
pub const BANK_CFG_8MB: u8 = 2;
pub const BANK_CFG_32MB: u8 = 3;

pub struct Hmc {
    mem_ctrl: MemCtrlRef,
    ctrl_reg: u64,
    bit_pos: u32,
    bank_config: u8,

    mb_bank_size: u32,
    bank_a_size: u32,
    bank_b_start: u32,
    bank_b_size: u32,
}

impl Hmc {
    pub fn new(mem_ctrl: MemCtrlRef) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            mem_ctrl,
            ctrl_reg: 0,
            bit_pos: 0,
            bank_config: BANK_CFG_128MB,
            mb_bank_size: 0,
            bank_a_size: 0,
            bank_b_start: 0,
            bank_b_size: 0,
        }))
    }

    /// Install the motherboard bank and the optional SIMM banks A and B.
    pub fn install_ram(
        &mut self,
        mb_bank_size: u32,
        bank_a_size: u32,
        bank_b_size: u32,
    ) -> Result<(), String> {
        if mb_bank_size != BANK_SIZE_4MB && mb_bank_size != BANK_SIZE_8MB {
            return Err(format!("invalid motherboard bank size {}", mb_bank_size));
        }
        if bank_a_size == 0 && bank_b_size != 0 {
            return Err("bank A can't be empty while bank B is not empty".to_string());
        }

        let mem = self.mem_ctrl.clone();
        if mem.add_ram_region(BANK_MB_START, mb_bank_size).is_err() {
            return Err("could not allocate motherboard RAM region".to_string());
        }
        self.mb_bank_size = mb_bank_size;
        self.bank_a_size = bank_a_size;
        self.bank_b_size = bank_b_size;

        if bank_a_size != 0 && mem.add_ram_region(BANK_A_START, bank_a_size).is_err() {
            return Err("could not allocate region for bank A".to_string());
        }
        if bank_b_size != 0 {
            if mem.add_ram_region(BANK_B_START, bank_b_size).is_err() {
                return Err("could not allocate region for bank B".to_string());
            }
            self.bank_b_start = BANK_B_START;
        }
        Ok(())
    }

    pub fn bank_config(&self) -> u8 {
        self.bank_config
    }

    fn remap_ram_regions(&mut self) {
        let bank_b_addr = match self.bank_config & 3 {
            BANK_CFG_128MB => BANK_B_START,
            BANK_CFG_2MB => self.mb_bank_size + BANK_SIZE_2MB,
            BANK_CFG_8MB => self.mb_bank_size + BANK_SIZE_8MB,
            _ => self.mb_bank_size + BANK_SIZE_32MB,
        };

        if self.bank_b_size != 0 && self.bank_b_start != bank_b_addr {
            if self
                .mem_ctrl.relocate_region(self.bank_b_start, bank_b_addr)
            {
                self.bank_b_start = bank_b_addr;
                log::info!(
                    "HMC: successfully relocated bank B mem region to 0x{:X}",
                    bank_b_addr
                );
            } else {
                log::error!("HMC: failed to relocate bank B mem region to 0x{:X}", bank_b_addr);
            }
        }
    }
}

impl MmioDevice for Hmc {
    fn name(&self) -> &str {
        "HMC"
    }

    fn read(&mut self, _rgn_start: u32, offset: u32, _size: u32) -> u32 {
        if offset == 0 {
            let bit = (self.ctrl_reg >> self.bit_pos) & 1;
            self.bit_pos = (self.bit_pos + 1) % HMC_CTRL_BITS;
            bit as u32
        } else {
            0
        }
    }

    fn write(&mut self, _rgn_start: u32, offset: u32, value: u32, _size: u32) {
        match offset {
            0 => {
                let bit = 1u64 << self.bit_pos;
                self.ctrl_reg = if value & 1 != 0 {
                    self.ctrl_reg | bit
                } else {
                    self.ctrl_reg & !bit
                };
                self.bit_pos += 1;
                if self.bit_pos >= HMC_CTRL_BITS {
                    self.bit_pos = 0;
                    let new_config = ((self.ctrl_reg >> HMC_RAM_CFG_POS) & 3) as u8;
                    if new_config != self.bank_config {
                        self.bank_config = new_config;
                        self.remap_ram_regions();
                    }
                }
            }
            8 => self.bit_pos = 0, // reset the internal bit position
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memctrl::MemCtrl;

    fn serial_write(hmc: &mut Hmc, value: u64) {
        hmc.write(REGS_BASE, 8, 0, 1);
        for bit in 0..HMC_CTRL_BITS {
            hmc.write(REGS_BASE, 0, ((value >> bit) & 1) as u32, 1);
        }
    }

    #[test]
    fn bank_b_relocates_on_config_change() {
        let mem = MemCtrl::new();
        let hmc = Hmc::new(mem.clone());
        hmc.borrow_mut()
            .install_ram(BANK_SIZE_8MB, BANK_SIZE_8MB, BANK_SIZE_8MB)
            .unwrap();

        serial_write(
            &mut hmc.borrow_mut(),
            (BANK_CFG_8MB as u64) << HMC_RAM_CFG_POS,
        );
        assert_eq!(hmc.borrow().bank_config(), BANK_CFG_8MB);

        let expected = BANK_SIZE_8MB + BANK_SIZE_8MB;
        assert!(mem.find_range(expected).is_some());
        assert!(mem.find_range(BANK_B_START).is_none());
    }

    #[test]
    fn serial_register_reads_back() {
        let mem = MemCtrl::new();
        let hmc = Hmc::new(mem.clone());
        let mut hmc = hmc.borrow_mut();
        serial_write(&mut hmc, 0b1011);
        hmc.write(REGS_BASE, 8, 0, 1);
        assert_eq!(hmc.read(REGS_BASE, 0, 1), 1);
        assert_eq!(hmc.read(REGS_BASE, 0, 1), 1);
        assert_eq!(hmc.read(REGS_BASE, 0, 1), 0);
        assert_eq!(hmc.read(REGS_BASE, 0, 1), 1);
    }
}
