//! Bandit/Chaos ARBus-to-PCI host bridges (TNT and VCI buses).
//!
//! Each Bandit claims a 16 MB register window inside 0xF0000000..0xF8000000:
//!
//!   base + 0x000000  I/O space
//!   base + 0x800000  CONFIG_ADDR
//!   base + 0xC00000  CONFIG_DATA
//!
//! CONFIG_ADDR bit 0 selects a type-1 command; otherwise the register holds
//! an IDSEL pattern with exactly one bit set in [11..31] selecting a device
//! on the root bus.

use std::cell::RefCell;
use std::rc::Rc;

use crate::memctrl::MmioDevice;
use crate::pci::device::{PciCfgState, PciDevice, PciDeviceHandle, PCI_HEADER_TYPE_0};
use crate::pci::host::PciHost;
use crate::pci::{
    AccessDetails, PCI_CONFIG_READ, PCI_CONFIG_TYPE_0, PCI_CONFIG_TYPE_1, PCI_CONFIG_WRITE,
    PCI_VENDOR_APPLE,
};

/// Device number of the bridge's own PCI personality.
pub const BANDIT_DEV: u8 = 11;

const BANDIT_CAR_TYPE: u32 = 1; // type-1 configuration command

/// Bandit implementation-specific config registers.
const BANDIT_ADDR_MASK: u32 = 0x48;
const BANDIT_MODE_SELECT: u32 = 0x50;
const BANDIT_ARBUS_RD_HOLD_OFF: u32 = 0x58;

const DE_BRUIJN_BIT_POSITION: [u8; 32] = [
    0, 1, 28, 2, 29, 14, 24, 3, 30, 22, 20, 15, 25, 17, 4, 8, 31, 27, 13, 23, 21, 19, 16, 7, 26,
    12, 18, 6, 11, 5, 10, 9,
];

/// Position of the single set bit in `val`.
fn what_bit_set(val: u32) -> u8 {
    DE_BRUIJN_BIT_POSITION[(val.wrapping_mul(0x077C_B531) >> 27) as usize]
}

const fn single_bit_set(val: u32) -> bool {
    val != 0 && (val & (val - 1)) == 0
}

// ── Bandit's own PCI personality ──────────────────────────────

pub struct BanditPciDevice {
    cfg: PciCfgState,
    addr_mask: u32,
    mode_ctrl: u32,
    rd_hold_off_cnt: u32,
}

impl BanditPciDevice {
    pub fn new(bridge_num: u8, name: &str, dev_id: u16, rev: u8) -> Self {
        let mut cfg = PciCfgState::new(name, PCI_HEADER_TYPE_0, 0);
        cfg.vendor_id = PCI_VENDOR_APPLE;
        cfg.device_id = dev_id;
        cfg.class_rev = 0x0600_0000 | rev as u32;
        cfg.cache_ln_sz = 8;
        cfg.command = 0x16;
        // command and cache line size registers are read-only on this chip
        cfg.command_cfg = 0;

        Self {
            cfg,
            // fine address space bits for this bridge's 32 MB PCI window
            addr_mask: 3 << ((bridge_num & 3) * 2),
            // PCI number + chip mode: big endian, interrupts and VGA space disabled
            mode_ctrl: (((bridge_num & 3) as u32) << 2) | 3,
            rd_hold_off_cnt: 8,
        }
    }

    fn verbose_address_space(&self) {
        if self.addr_mask == 0 {
            return;
        }
        log::info!("{} address spaces:", self.cfg.name);
        // coarse 256 MB regions
        for bit_pos in 0..15u32 {
            if self.addr_mask & (0x10000 << bit_pos) != 0 {
                let start_addr = bit_pos << 28;
                log::info!("- 0x{:X} ... 0x{:X}", start_addr, start_addr + 0x0FFF_FFFF);
            }
        }
        // fine 16 MB regions
        for bit_pos in 0..16u32 {
            if self.addr_mask & (1 << bit_pos) != 0 {
                let start_addr = (bit_pos << 24) + 0xF000_0000;
                log::info!("- 0x{:X} ... 0x{:X}", start_addr, start_addr + 0x00FF_FFFF);
            }
        }
    }
}

impl MmioDevice for BanditPciDevice {
    fn name(&self) -> &str {
        &self.cfg.name
    }
    fn read(&mut self, _rgn_start: u32, _offset: u32, _size: u32) -> u32 {
        0
    }
    fn write(&mut self, _rgn_start: u32, _offset: u32, _value: u32, _size: u32) {}
}

impl PciDevice for BanditPciDevice {
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
            BANDIT_ADDR_MASK => self.addr_mask,
            BANDIT_MODE_SELECT => self.mode_ctrl,
            BANDIT_ARBUS_RD_HOLD_OFF => self.rd_hold_off_cnt,
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
            BANDIT_ADDR_MASK => {
                self.addr_mask = value;
                self.verbose_address_space();
            }
            BANDIT_MODE_SELECT => self.mode_ctrl = value,
            BANDIT_ARBUS_RD_HOLD_OFF => self.rd_hold_off_cnt = value & 0x1F,
            _ => self.cfg.log_unimplemented_write(reg_offs, value, details),
        }
    }
}

// ── Host bridge ───────────────────────────────────────────────

pub struct Bandit {
    name: String,
    pub host: PciHost,
    config_addr: u32,
    base_addr: u32,
}

impl Bandit {
    /// Register window size of one Bandit (I/O + config, pass-through
    /// memory space excluded).
    pub const REGION_SIZE: u32 = 0x0100_0000;

    pub fn new(bridge_num: u8, name: &str, dev_id: u16, rev: u8) -> Rc<RefCell<Self>> {
        let base_addr = 0xF000_0000 + (((bridge_num & 3) as u32) << 25);
        let bandit = Rc::new(RefCell::new(Self {
            name: name.to_string(),
            host: PciHost::new(name),
            config_addr: 0,
            base_addr,
        }));

        let pci_dev = Rc::new(RefCell::new(BanditPciDevice::new(
            bridge_num, name, dev_id, rev,
        )));
        bandit.borrow_mut().host.pci_register_device(
            super::dev_fun(BANDIT_DEV, 0),
            PciDeviceHandle::new(&pci_dev),
        );

        bandit
    }

    pub fn base_addr(&self) -> u32 {
        self.base_addr
    }

    fn cfg_setup(&self, offset: u32, size: u32) -> (AccessDetails, Option<PciDeviceHandle>) {
        let mut details = AccessDetails {
            size: size as u8,
            offset: (offset & 3) as u8,
            flags: 0,
        };
        let fun_num = ((self.config_addr >> 8) & 7) as u8;

        if self.config_addr & BANDIT_CAR_TYPE != 0 {
            details.flags = PCI_CONFIG_TYPE_1;
            let bus_num = ((self.config_addr >> 16) & 0xFF) as u8;
            let dev_num = ((self.config_addr >> 11) & 0x1F) as u8;
            return (details, self.host.pci_find_device(bus_num, dev_num, fun_num));
        }

        details.flags = PCI_CONFIG_TYPE_0;
        let idsel = self.config_addr & 0xFFFF_F800;
        if !single_bit_set(idsel) {
            log::error!(
                "{}: config_addr 0x{:08X} does not contain valid IDSEL",
                self.name,
                self.config_addr
            );
            return (details, None);
        }
        let dev_num = what_bit_set(idsel);
        (details, self.host.pci_find_device_on_bus(dev_num, fun_num))
    }

    fn reg_offset(&self) -> u32 {
        self.config_addr & 0xFC
    }
}

impl MmioDevice for Bandit {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&mut self, _rgn_start: u32, offset: u32, size: u32) -> u32 {
        match offset >> 22 {
            3 => {
                // CONFIG_DATA
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
            2 => self.config_addr.swap_bytes(), // CONFIG_ADDR
            _ => self.host.pci_io_read_broadcast(offset, size),
        }
    }

    fn write(&mut self, _rgn_start: u32, offset: u32, value: u32, size: u32) {
        match offset >> 22 {
            3 => {
                // CONFIG_DATA
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
            2 => self.config_addr = value.swap_bytes(), // CONFIG_ADDR
            _ => self.host.pci_io_write_broadcast(offset, value, size),
        }
    }
}

/// Chaos: the VCI host bridge of the TNT video subsystem. Same register
/// decode as Bandit without a PCI personality.
pub struct Chaos {
    inner: Bandit,
}

impl Chaos {
    pub const REGION_SIZE: u32 = Bandit::REGION_SIZE;

    pub fn new(name: &str) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            inner: Bandit {
                name: name.to_string(),
                host: PciHost::new(name),
                config_addr: 0,
                base_addr: 0xF000_0000,
            },
        }))
    }

    pub fn host(&mut self) -> &mut PciHost {
        &mut self.inner.host
    }
}

impl MmioDevice for Chaos {
    fn name(&self) -> &str {
        &self.inner.name
    }
    fn read(&mut self, rgn_start: u32, offset: u32, size: u32) -> u32 {
        self.inner.read(rgn_start, offset, size)
    }
    fn write(&mut self, rgn_start: u32, offset: u32, value: u32, size: u32) {
        self.inner.write(rgn_start, offset, value, size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idsel_bit_scan() {
        for bit in 11..32u8 {
            assert_eq!(what_bit_set(1u32 << bit), bit);
        }
        assert!(single_bit_set(1 << 13));
        assert!(!single_bit_set(0));
        assert!(!single_bit_set(0x3000));
    }
}
