//! Grackle (MPC106) PCI host bridge and memory controller of the Gossamer
//! board.
//!
//! Grackle exposes CONFIG_ADDR at 0xFEC00000 and CONFIG_DATA at 0xFEE00000
//! within its register region, plus a 64 KB PCI/ISA I/O window at
//! 0xFE000000. Its own configuration header (device 0 on bus 0) carries the
//! memory bank start/end registers; writing MEMGO to MCCR1 makes it carve
//! the RAM regions out of the bank setup, which is how firmware sizes
//! memory on this machine.

use std::cell::RefCell;
use std::rc::Rc;

use crate::memctrl::{MemCtrlRef, MmioDevice};
use crate::pci::device::{PciCfgState, PciDevice, PciDeviceHandle, PCI_HEADER_TYPE_0};
use crate::pci::host::PciHost;
use crate::pci::{
    AccessDetails, PCI_CONFIG_READ, PCI_CONFIG_TYPE_0, PCI_CONFIG_TYPE_1, PCI_CONFIG_WRITE,
    PCI_VENDOR_MOTOROLA,
};

/// MPC106 implementation-specific configuration registers.
mod reg {
    pub const CFG10: u32 = 0x40; // bus number / subordinate bus number
    pub const PMCR1: u32 = 0x70;
    pub const MSAR1: u32 = 0x80;
    pub const MSAR2: u32 = 0x84;
    pub const EMSAR1: u32 = 0x88;
    pub const EMSAR2: u32 = 0x8C;
    pub const MEAR1: u32 = 0x90;
    pub const MEAR2: u32 = 0x94;
    pub const EMEAR1: u32 = 0x98;
    pub const EMEAR2: u32 = 0x9C;
    pub const MBER: u32 = 0xA0;
    pub const PICR1: u32 = 0xA8;
    pub const PICR2: u32 = 0xAC;
    pub const MCCR1: u32 = 0xF0;
    pub const MCCR2: u32 = 0xF4;
    pub const MCCR3: u32 = 0xF8;
    pub const MCCR4: u32 = 0xFC;
}

const MEMGO: u32 = 1 << 19; // MCCR1: RAM banks are configured, go

// ── Grackle's own PCI personality ─────────────────────────────

/// The config-register file of the MPC106, separate from the host decode so
/// config cycles addressed at device 0 never re-enter the host object.
pub struct GracklePci {
    cfg: PciCfgState,
    mem_ctrl: MemCtrlRef,

    odcr: u8,
    pmcr1: u16,
    pmcr2: u8,
    picr1: u32,
    picr2: u32,
    mccr1: u32,
    mccr2: u32,
    mccr3: u32,
    mccr4: u32,
    mem_start: [u32; 2],
    ext_mem_start: [u32; 2],
    mem_end: [u32; 2],
    ext_mem_end: [u32; 2],
    mem_bank_en: u32,
}

impl GracklePci {
    pub fn new(mem_ctrl: MemCtrlRef) -> Self {
        let mut cfg = PciCfgState::new("Grackle", PCI_HEADER_TYPE_0, 0);
        cfg.vendor_id = PCI_VENDOR_MOTOROLA;
        cfg.device_id = 0x0002;
        cfg.class_rev = 0x0600_0040;
        cfg.cache_ln_sz = 8;
        cfg.command = 6;
        cfg.status = 0x80;
        Self {
            cfg,
            mem_ctrl,
            odcr: 0,
            pmcr1: 0,
            pmcr2: 0,
            picr1: 0,
            picr2: 0,
            mccr1: 0,
            mccr2: 0,
            mccr3: 0,
            mccr4: 0,
            mem_start: [0; 2],
            ext_mem_start: [0; 2],
            mem_end: [0; 2],
            ext_mem_end: [0; 2],
            mem_bank_en: 0,
        }
    }

    /// Turn the enabled bank start/end registers into RAM regions. Adjacent
    /// and overlapping banks are squashed into single regions first.
    fn setup_ram(&mut self) {
        let mut banks: Vec<(u32, u32)> = Vec::new();

        for bank in 0..8 {
            if self.mem_bank_en & (1 << bank) == 0 {
                continue;
            }
            let word = bank >> 2;
            let shift = (bank & 3) * 8;
            let start = (((self.ext_mem_start[word] >> shift) & 3) << 28)
                | (((self.mem_start[word] >> shift) & 0xFF) << 20);
            let end = (((self.ext_mem_end[word] >> shift) & 3) << 28)
                | (((self.mem_end[word] >> shift) & 0xFF) << 20)
                | 0xFFFFF;
            banks.push((start, end));
        }

        banks.sort_unstable();
        log::info!("banks:");
        for (i, (start, end)) in banks.iter().enumerate() {
            log::info!("bank {}: [{:08X}..{:08X}]", i, start, end);
        }

        // squash adjacent or overlapping banks into memory regions
        let mut regions: Vec<(u32, u32)> = Vec::new();
        for (start, end) in banks {
            match regions.last_mut() {
                Some((_, last_end)) if start <= *last_end + 1 => {
                    if start < *last_end + 1 {
                        log::error!("overlapping regions");
                    }
                    if end > *last_end {
                        *last_end = end;
                    }
                }
                _ => regions.push((start, end)),
            }
        }

        for (start, end) in regions {
            let region_size = end - start + 1;
            if self.mem_ctrl.add_ram_region(start, region_size).is_err() {
                log::warn!(
                    "Grackle: {} MB RAM allocation 0x{:X}..0x{:X} failed (maybe already exists?)",
                    region_size / (1024 * 1024),
                    start,
                    end
                );
            }
        }
    }
}

impl MmioDevice for GracklePci {
    fn name(&self) -> &str {
        &self.cfg.name
    }
    fn read(&mut self, _rgn_start: u32, _offset: u32, _size: u32) -> u32 {
        0
    }
    fn write(&mut self, _rgn_start: u32, _offset: u32, _value: u32, _size: u32) {}
}

impl PciDevice for GracklePci {
    fn cfg(&self) -> &PciCfgState {
        &self.cfg
    }
    fn cfg_mut(&mut self) -> &mut PciCfgState {
        &mut self.cfg
    }

    fn pci_cfg_read(&mut self, reg_offs: u32, details: &AccessDetails) -> u32 {
        if reg_offs < 64 {
            return self.cfg.cfg_read_common(reg_offs, details);
        }
        match reg_offs {
            reg::CFG10 => 0,
            reg::PMCR1 => {
                ((self.odcr as u32) << 24) | ((self.pmcr2 as u32) << 16) | self.pmcr1 as u32
            }
            reg::MSAR1 | reg::MSAR2 => self.mem_start[((reg_offs >> 2) & 1) as usize],
            reg::EMSAR1 | reg::EMSAR2 => self.ext_mem_start[((reg_offs >> 2) & 1) as usize],
            reg::MEAR1 | reg::MEAR2 => self.mem_end[((reg_offs >> 2) & 1) as usize],
            reg::EMEAR1 | reg::EMEAR2 => self.ext_mem_end[((reg_offs >> 2) & 1) as usize],
            reg::MBER => self.mem_bank_en,
            reg::PICR1 => self.picr1,
            reg::PICR2 => self.picr2,
            reg::MCCR1 => self.mccr1,
            reg::MCCR2 => self.mccr2,
            reg::MCCR3 => self.mccr3,
            reg::MCCR4 => self.mccr4,
            _ => {
                self.cfg.log_unimplemented_read(reg_offs, details);
                0
            }
        }
    }

    fn pci_cfg_write(&mut self, reg_offs: u32, value: u32, details: &AccessDetails) {
        if reg_offs < 64 {
            self.cfg.cfg_write_common(reg_offs, value, details);
            return;
        }
        match reg_offs {
            // Open Firmware writes 0 to the subordinate bus number
            reg::CFG10 => {}
            reg::PMCR1 => {
                self.pmcr1 = value as u16;
                self.pmcr2 = (value >> 16) as u8;
                self.odcr = (value >> 24) as u8;
            }
            reg::MSAR1 | reg::MSAR2 => {
                self.mem_start[((reg_offs >> 2) & 1) as usize] = value;
            }
            reg::EMSAR1 | reg::EMSAR2 => {
                self.ext_mem_start[((reg_offs >> 2) & 1) as usize] = value;
            }
            reg::MEAR1 | reg::MEAR2 => {
                self.mem_end[((reg_offs >> 2) & 1) as usize] = value;
            }
            reg::EMEAR1 | reg::EMEAR2 => {
                self.ext_mem_end[((reg_offs >> 2) & 1) as usize] = value;
            }
            reg::MBER => self.mem_bank_en = value & 0xFF,
            reg::PICR1 => self.picr1 = value,
            reg::PICR2 => self.picr2 = value,
            reg::MCCR1 => {
                if (value ^ self.mccr1) & MEMGO != 0 && value & MEMGO != 0 {
                    self.setup_ram();
                }
                self.mccr1 = value;
            }
            reg::MCCR2 => self.mccr2 = value,
            reg::MCCR3 => self.mccr3 = value,
            reg::MCCR4 => self.mccr4 = value,
            _ => self.cfg.log_unimplemented_write(reg_offs, value, details),
        }
    }
}

// ── Host bridge ───────────────────────────────────────────────

pub struct Grackle {
    name: String,
    pub host: PciHost,
    config_addr: u32,
}

impl Grackle {
    /// 64 KB PCI/ISA I/O window.
    pub const IO_REGION_BASE: u32 = 0xFE00_0000;
    pub const IO_REGION_SIZE: u32 = 0x1_0000;
    /// CONFIG_ADDR/CONFIG_DATA register region.
    pub const CFG_REGION_BASE: u32 = 0xFEC0_0000;
    pub const CFG_REGION_SIZE: u32 = 0x30_0000;

    pub fn new() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            name: "Grackle".to_string(),
            host: PciHost::new("Grackle"),
            config_addr: 0,
        }))
    }

    /// Attach the bridge's own config-register file as device 0.
    pub fn device_postinit(&mut self, mem_ctrl: MemCtrlRef) {
        let pci_dev = Rc::new(RefCell::new(GracklePci::new(mem_ctrl)));
        self.host
            .pci_register_device(super::dev_fun(0, 0), PciDeviceHandle::new(&pci_dev));
    }

    fn cfg_setup(&self, offset: u32, size: u32) -> (AccessDetails, Option<PciDeviceHandle>) {
        let mut details = AccessDetails {
            size: size as u8,
            offset: (offset & 3) as u8,
            flags: 0,
        };

        let bus_num = ((self.config_addr >> 8) & 0xFF) as u8;
        let dev_num = ((self.config_addr >> 19) & 0x1F) as u8;
        let fun_num = ((self.config_addr >> 16) & 0x07) as u8;

        let device = if bus_num != 0 {
            details.flags = PCI_CONFIG_TYPE_1;
            self.host.pci_find_device(bus_num, dev_num, fun_num)
        } else {
            details.flags = PCI_CONFIG_TYPE_0;
            self.host.pci_find_device_on_bus(dev_num, fun_num)
        };
        (details, device)
    }

    fn reg_offset(&self) -> u32 {
        (self.config_addr >> 24) & 0xFC
    }
}

impl MmioDevice for Grackle {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&mut self, rgn_start: u32, offset: u32, size: u32) -> u32 {
        if rgn_start == Self::IO_REGION_BASE {
            return self.host.pci_io_read_broadcast(offset, size);
        }
        if offset < 0x20_0000 {
            return self.config_addr;
        }
        if self.config_addr & 0x80 == 0 {
            return 0; // bit E (enable) not set
        }
        let (mut details, device) = self.cfg_setup(offset, size);
        details.flags |= PCI_CONFIG_READ;
        let reg_offs = self.reg_offset();
        match device {
            Some(handle) => self.host.cfg_data_read(&handle, reg_offs, details),
            None => {
                log::error!(
                    "{}: read attempt from non-existent PCI device, config_addr {:08X}",
                    self.name,
                    self.config_addr
                );
                0xFFFF_FFFF // PCI spec §6.1
            }
        }
    }

    fn write(&mut self, rgn_start: u32, offset: u32, value: u32, size: u32) {
        if rgn_start == Self::IO_REGION_BASE {
            self.host.pci_io_write_broadcast(offset, value, size);
            return;
        }
        if offset < 0x20_0000 {
            self.config_addr = value;
            return;
        }
        if self.config_addr & 0x80 == 0 {
            return; // bit E (enable) not set
        }
        let (mut details, device) = self.cfg_setup(offset, size);
        details.flags |= PCI_CONFIG_WRITE;
        let reg_offs = self.reg_offset();
        match device {
            Some(handle) => self.host.cfg_data_write(&handle, reg_offs, value, details),
            None => log::error!(
                "{}: write attempt to non-existent PCI device, config_addr {:08X}",
                self.name,
                self.config_addr
            ),
        }
    }
}
