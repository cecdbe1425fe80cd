//! PCI configuration space access through the host bridges: IDSEL decode,
//! endian reshaping, BAR sizing, type-1 forwarding.

use std::cell::RefCell;
use std::rc::Rc;

use oldworld::memctrl::MmioDevice;
use oldworld::pci::device::{PciCfgState, PciDevice, PciDeviceHandle, PCI_HEADER_TYPE_0};
use oldworld::pci::{dev_fun, Bandit, PciBridge};

const CONFIG_ADDR: u32 = 0x80_0000;
const CONFIG_DATA: u32 = 0xC0_0000;

struct TestCard {
    cfg: PciCfgState,
    reg40: u32,
    bar_changes: Vec<(usize, u32)>,
}

impl TestCard {
    fn new() -> Rc<RefCell<Self>> {
        let mut cfg = PciCfgState::new("testcard", PCI_HEADER_TYPE_0, 6);
        cfg.vendor_id = 0x106B;
        cfg.device_id = 0x4567;
        cfg.class_rev = 0x0300_0001;
        // BAR0: 64 KB of memory space
        cfg.setup_bars(&[(0, 0xFFFF_0000)]);
        Rc::new(RefCell::new(Self {
            cfg,
            reg40: 0x1122_3344,
            bar_changes: Vec::new(),
        }))
    }
}

impl MmioDevice for TestCard {
    fn name(&self) -> &str {
        "testcard"
    }
    fn read(&mut self, _rgn_start: u32, _offset: u32, _size: u32) -> u32 {
        0
    }
    fn write(&mut self, _rgn_start: u32, _offset: u32, _value: u32, _size: u32) {}
}

impl PciDevice for TestCard {
    fn cfg(&self) -> &PciCfgState {
        &self.cfg
    }
    fn cfg_mut(&mut self) -> &mut PciCfgState {
        &mut self.cfg
    }
    fn pci_cfg_read(&mut self, reg_offs: u32, details: &oldworld::pci::AccessDetails) -> u32 {
        match reg_offs {
            0x40 => self.reg40,
            _ => match reg_offs {
                0x10..=0x24 => self.cfg.bars[((reg_offs - 0x10) >> 2) as usize],
                _ => self.cfg.cfg_read_common(reg_offs, details),
            },
        }
    }
    fn pci_cfg_write(&mut self, reg_offs: u32, value: u32, details: &oldworld::pci::AccessDetails) {
        match reg_offs {
            0x40 => self.reg40 = value,
            0x10..=0x24 => {
                let bar_num = ((reg_offs - 0x10) >> 2) as usize;
                if self.cfg.set_bar_value(bar_num, value) {
                    let base = self.cfg.bars[bar_num];
                    self.bar_changes.push((bar_num, base));
                }
            }
            _ => self.cfg.cfg_write_common(reg_offs, value, details),
        }
    }
}

/// Bandit host with a test card at device 13 (IDSEL bit 13).
fn setup() -> (Rc<RefCell<Bandit>>, Rc<RefCell<TestCard>>) {
    let bandit = Bandit::new(1, "Bandit1", 0x0001, 3);
    let card = TestCard::new();
    bandit
        .borrow_mut()
        .host
        .pci_register_device(dev_fun(13, 0), PciDeviceHandle::new(&card));
    (bandit, card)
}

/// The guest's CONFIG_ADDR/CONFIG_DATA accesses: the registers are
/// little-endian, so a guest dword arrives byte-swapped.
fn cfg_select(bandit: &Rc<RefCell<Bandit>>, config_addr: u32) {
    bandit
        .borrow_mut()
        .write(0, CONFIG_ADDR, config_addr.swap_bytes(), 4);
}

fn cfg_read(bandit: &Rc<RefCell<Bandit>>, config_addr: u32, offset: u32, size: u32) -> u32 {
    cfg_select(bandit, config_addr);
    bandit.borrow_mut().read(0, CONFIG_DATA + offset, size)
}

fn cfg_write(bandit: &Rc<RefCell<Bandit>>, config_addr: u32, offset: u32, value: u32, size: u32) {
    cfg_select(bandit, config_addr);
    bandit
        .borrow_mut()
        .write(0, CONFIG_DATA + offset, value, size)
}

/// IDSEL pattern for a device on the root bus.
fn idsel(dev_num: u32, reg: u32) -> u32 {
    (1 << dev_num) | (reg & 0xFC)
}

#[test]
fn idsel_selects_root_bus_device() {
    let (bandit, _card) = setup();
    let dev_vend = cfg_read(&bandit, idsel(13, 0x00), 0, 4);
    assert_eq!(dev_vend, 0x4567_106Bu32.swap_bytes());
}

#[test]
fn nonexistent_device_reads_all_ones() {
    let (bandit, _card) = setup();
    assert_eq!(cfg_read(&bandit, idsel(14, 0x00), 0, 4), 0xFFFF_FFFF);
}

#[test]
fn invalid_idsel_reads_all_ones() {
    let (bandit, _card) = setup();
    // two IDSEL bits at once is not a valid pattern
    assert_eq!(cfg_read(&bandit, (1 << 13) | (1 << 14), 0, 4), 0xFFFF_FFFF);
}

#[test]
fn byte_reads_match_dword_read_modulo_rotation() {
    // the register holds the host-ordered dword 0x11223344; byte reads see
    // the little-endian byte stream
    let (bandit, _card) = setup();
    assert_eq!(cfg_read(&bandit, idsel(13, 0x40), 0, 1), 0x44);
    assert_eq!(cfg_read(&bandit, idsel(13, 0x40), 1, 1), 0x33);
    assert_eq!(cfg_read(&bandit, idsel(13, 0x40), 2, 1), 0x22);
    assert_eq!(cfg_read(&bandit, idsel(13, 0x40), 3, 1), 0x11);
    assert_eq!(cfg_read(&bandit, idsel(13, 0x40), 2, 2), 0x2211);
}

#[test]
fn unaligned_byte_write_updates_one_lane() {
    let (bandit, card) = setup();
    cfg_write(&bandit, idsel(13, 0x40), 1, 0xAB, 1);
    assert_eq!(card.borrow().reg40, 0x1122_AB44);
}

#[test]
fn aligned_dword_write_takes_fast_path() {
    let (bandit, card) = setup();
    cfg_write(&bandit, idsel(13, 0x40), 0, 0xDDCC_BBAAu32, 4);
    // guest wrote the LE bytes AA BB CC DD; the register latches the
    // host-ordered value
    assert_eq!(card.borrow().reg40, 0xAABB_CCDD);
}

#[test]
fn bar_sizing_and_latching() {
    let (bandit, card) = setup();

    // sizing probe returns the configured mask, with no notification
    cfg_write(&bandit, idsel(13, 0x10), 0, 0xFFFF_FFFF, 4);
    assert_eq!(
        cfg_read(&bandit, idsel(13, 0x10), 0, 4),
        0xFFFF_0000u32.swap_bytes()
    );
    assert!(card.borrow().bar_changes.is_empty());

    // an aligned base latches and notifies
    cfg_write(&bandit, idsel(13, 0x10), 0, 0x8000_0000u32.swap_bytes(), 4);
    assert_eq!(
        cfg_read(&bandit, idsel(13, 0x10), 0, 4),
        0x8000_0000u32.swap_bytes()
    );
    assert_eq!(card.borrow().bar_changes, vec![(0, 0x8000_0000)]);
}

#[test]
fn config_addr_reads_back() {
    let (bandit, _card) = setup();
    cfg_select(&bandit, 0x0000_2000);
    let readback = bandit.borrow_mut().read(0, CONFIG_ADDR, 4);
    assert_eq!(readback.swap_bytes(), 0x0000_2000);
}

#[test]
fn type1_cycle_walks_the_bridge() {
    let (bandit, _card) = setup();

    // bridge at (bus 0, dev 0x0E, fn 0) in front of secondary bus 1
    let bridge = Rc::new(RefCell::new(PciBridge::new("pci-bridge")));
    bridge.borrow_mut().set_bus_range(1, 1);
    let behind = TestCard::new();
    bridge
        .borrow_mut()
        .host
        .pci_register_device(dev_fun(1, 0), PciDeviceHandle::new(&behind));
    bandit
        .borrow_mut()
        .host
        .pci_register_bridge(dev_fun(0x0E, 0), bridge);

    // type-1: bus 1, dev 1, fn 0, reg 0 reaches the device unchanged
    let config_addr = 0x8001_0800 | 1;
    let dev_vend = cfg_read(&bandit, config_addr, 0, 4);
    assert_eq!(dev_vend, 0x4567_106Bu32.swap_bytes());

    // a write through the same path lands on the device
    cfg_write(&bandit, config_addr | 0x40, 0, 0x0403_0201, 4);
    assert_eq!(behind.borrow().reg40, 0x0102_0304);

    // bus 2 is outside the bridge's range
    assert_eq!(cfg_read(&bandit, 0x8002_0800 | 1, 0, 4), 0xFFFF_FFFF);
}
