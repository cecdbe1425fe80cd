//! PCI host core: device map, bridge walking, interrupt routing, I/O space.
//!
//! Every host bridge (Bandit, Chaos, Grackle) and every PCI-to-PCI bridge
//! embeds one of these. It owns the `(dev, fn) -> device` map of one bus,
//! the list of I/O-space capable functions, downstream bridges, and the
//! slot-to-interrupt routing table.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::interrupts::{IntCtrlRef, IntSrc};
use crate::memctrl::MemCtrlRef;
use crate::pci::bridge::PciBridge;
use crate::pci::device::{IntDetails, MappingReq, PciDevice, PciDeviceHandle};
use crate::pci::{pci_conv_rd_data, pci_conv_wr_data, AccessDetails};

/// One slot of a host's interrupt routing table.
#[derive(Debug, Clone, Copy)]
pub struct PciIrqMapEntry {
    /// Configuration property naming the card in this slot, if any.
    pub slot_name: Option<&'static str>,
    pub dev_fun: u8,
    pub int_src: Option<IntSrc>,
}

pub struct PciHost {
    name: String,
    dev_map: HashMap<u8, PciDeviceHandle>,
    io_space_devs: Vec<PciDeviceHandle>,
    bridge_devs: Vec<Rc<RefCell<PciBridge>>>,
    irq_map: Vec<PciIrqMapEntry>,
    int_ctrl: Option<IntCtrlRef>,
    mem_ctrl: Option<MemCtrlRef>,
}

impl PciHost {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            dev_map: HashMap::new(),
            io_space_devs: Vec::new(),
            bridge_devs: Vec::new(),
            irq_map: Vec::new(),
            int_ctrl: None,
            mem_ctrl: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // ── Wiring ────────────────────────────────────────────────

    pub fn set_irq_map(&mut self, irq_map: Vec<PciIrqMapEntry>) {
        self.irq_map = irq_map;
    }

    pub fn irq_map(&self) -> &[PciIrqMapEntry] {
        &self.irq_map
    }

    pub fn set_interrupt_controller(&mut self, int_ctrl: IntCtrlRef) {
        self.int_ctrl = Some(int_ctrl);
    }

    pub fn interrupt_controller(&self) -> Option<IntCtrlRef> {
        self.int_ctrl.clone()
    }

    pub fn set_mem_ctrl(&mut self, mem_ctrl: MemCtrlRef) {
        self.mem_ctrl = Some(mem_ctrl);
    }

    // ── Device registration ───────────────────────────────────

    pub fn pci_register_device(&mut self, dev_fun_num: u8, handle: PciDeviceHandle) {
        if self.dev_map.contains_key(&dev_fun_num) {
            log::error!(
                "{}: slot {:02X} already occupied, replacing device",
                self.name,
                dev_fun_num
            );
        }

        let fun_num = dev_fun_num & 7;
        let dev_num = (dev_fun_num >> 3) & 0x1F;
        let mut is_multi_function = fun_num != 0;

        for other_fun_num in 0..8u8 {
            let key = super::dev_fun(dev_num, other_fun_num);
            if let Some(other) = self.dev_map.get(&key) {
                is_multi_function = true;
                if other_fun_num == 0 {
                    other.dev.borrow_mut().cfg_mut().set_multi_function(true);
                }
            }
        }

        if is_multi_function && fun_num == 0 {
            handle.dev.borrow_mut().cfg_mut().set_multi_function(true);
        }

        if handle.dev.borrow().supports_io_space() {
            self.io_space_devs.push(handle.clone());
        }

        // wire the slot interrupt if the routing table and controller are
        // already known; wire_slot_interrupts covers late arrivals
        if let Some(details) = self.slot_int_details(dev_fun_num) {
            handle.dev.borrow_mut().cfg_mut().int_details = Some(details);
        }

        self.dev_map.insert(dev_fun_num, handle);
    }

    /// Register a PCI-to-PCI bridge: a device that also forwards accesses to
    /// its secondary bus.
    pub fn pci_register_bridge(&mut self, dev_fun_num: u8, bridge: Rc<RefCell<PciBridge>>) {
        let handle = PciDeviceHandle::new(&bridge);
        self.pci_register_device(dev_fun_num, handle);
        self.bridge_devs.push(bridge);
    }

    pub fn pci_unregister_device(&mut self, dev_fun_num: u8) {
        if let Some(handle) = self.dev_map.remove(&dev_fun_num) {
            self.io_space_devs
                .retain(|h| !Rc::ptr_eq(&h.dev, &handle.dev));
            self.bridge_devs.retain(|b| {
                let bh = Rc::clone(b) as Rc<RefCell<dyn crate::pci::device::PciDevice>>;
                !Rc::ptr_eq(&bh, &handle.dev)
            });
        }
    }

    // ── Interrupt routing ─────────────────────────────────────

    fn slot_int_details(&self, dev_fun_num: u8) -> Option<IntDetails> {
        let entry = self.irq_map.iter().find(|e| e.dev_fun == dev_fun_num)?;
        let src = entry.int_src?;
        let int_ctrl = self.int_ctrl.clone()?;
        let irq_id = int_ctrl.borrow_mut().register_dev_int(src);
        Some(IntDetails { int_ctrl, irq_id })
    }

    /// Resolve the IRQ map for every registered function. Called at machine
    /// postinit, once the interrupt controller exists; functions behind a
    /// bridge with no routing entry inherit the bridge's own wiring.
    pub fn wire_slot_interrupts(&mut self) {
        for (&dev_fun_num, handle) in &self.dev_map {
            if handle.dev.borrow().cfg().int_details.is_some() {
                continue;
            }
            if let Some(details) = self.slot_int_details(dev_fun_num) {
                handle.dev.borrow_mut().cfg_mut().int_details = Some(details);
            }
        }
        for bridge in &self.bridge_devs {
            let parent_details = bridge.borrow().cfg().int_details.clone();
            let mut b = bridge.borrow_mut();
            if let Some(ctrl) = self.int_ctrl.clone() {
                b.host.set_interrupt_controller(ctrl);
            }
            b.host.wire_slot_interrupts();
            if let Some(details) = parent_details {
                for handle in b.host.dev_map.values() {
                    let mut dev = handle.dev.borrow_mut();
                    if dev.cfg().int_details.is_none() {
                        dev.cfg_mut().int_details = Some(details.clone());
                    }
                }
            }
        }
    }

    // ── Device lookup ─────────────────────────────────────────

    /// Type-1 lookup: walk bridges whose `[secondary, subordinate]` range
    /// contains `bus_num`.
    pub fn pci_find_device(
        &self,
        bus_num: u8,
        dev_num: u8,
        fun_num: u8,
    ) -> Option<PciDeviceHandle> {
        for bridge in &self.bridge_devs {
            let b = bridge.borrow();
            if b.secondary_bus <= bus_num {
                if b.secondary_bus == bus_num {
                    return b.host.pci_find_device_on_bus(dev_num, fun_num);
                }
                if b.subordinate_bus >= bus_num {
                    return b.host.pci_find_device(bus_num, dev_num, fun_num);
                }
            }
        }
        None
    }

    /// Type-0 lookup on this bus.
    pub fn pci_find_device_on_bus(&self, dev_num: u8, fun_num: u8) -> Option<PciDeviceHandle> {
        self.dev_map.get(&super::dev_fun(dev_num, fun_num)).cloned()
    }

    // ── Config data plumbing ──────────────────────────────────

    /// Serve a CONFIG_DATA read through `handle`, reshaping the internally
    /// read dword for the guest. Bytes past the addressed dword repeat it.
    pub fn cfg_data_read(
        &mut self,
        handle: &PciDeviceHandle,
        reg_offs: u32,
        details: AccessDetails,
    ) -> u32 {
        let value = handle.dev.borrow_mut().pci_cfg_read(reg_offs, &details);
        pci_conv_rd_data(value, value, details)
    }

    /// Serve a CONFIG_DATA write through `handle`: aligned dword writes take
    /// the byte-swap fast path, everything else is a read-modify-write with
    /// lane merging. BAR remaps queued by the device are applied afterwards.
    pub fn cfg_data_write(
        &mut self,
        handle: &PciDeviceHandle,
        reg_offs: u32,
        value: u32,
        details: AccessDetails,
    ) {
        {
            let mut dev = handle.dev.borrow_mut();
            if details.size == 4 && details.offset == 0 {
                dev.pci_cfg_write(reg_offs, value.swap_bytes(), &details);
            } else {
                let old_val = if details.size == 4 {
                    0
                } else {
                    dev.pci_cfg_read(reg_offs, &details)
                };
                let new_val = pci_conv_wr_data(old_val, value, details);
                dev.pci_cfg_write(reg_offs, new_val, &details);
            }
        }
        self.apply_mapping_requests(handle);
    }

    /// Apply the address-map changes a device queued during a config access.
    pub fn apply_mapping_requests(&mut self, handle: &PciDeviceHandle) {
        let reqs = handle.dev.borrow_mut().cfg_mut().take_mapping_requests();
        if reqs.is_empty() {
            return;
        }
        let mem_ctrl = match &self.mem_ctrl {
            Some(mc) => mc.clone(),
            None => {
                log::error!("{}: no memory controller to apply BAR mapping", self.name);
                return;
            }
        };
        for req in reqs {
            match req {
                MappingReq::Add { start, size } => {
                    if let Err(err) =
                        mem_ctrl.add_mmio_region(start, size, Rc::clone(&handle.mmio))
                    {
                        log::error!("{}: {}", self.name, err);
                    }
                }
                MappingReq::Remove { start, size } => {
                    mem_ctrl.remove_mmio_region(start, size, &handle.mmio);
                }
            }
        }
    }

    // ── I/O space ─────────────────────────────────────────────

    pub fn pci_io_read_loop(&mut self, offset: u32, size: u32) -> Option<u32> {
        for handle in &self.io_space_devs {
            if let Some(res) = handle.dev.borrow_mut().pci_io_read(offset, size) {
                return Some(res);
            }
        }
        None
    }

    pub fn pci_io_write_loop(&mut self, offset: u32, value: u32, size: u32) -> bool {
        for handle in &self.io_space_devs {
            if handle.dev.borrow_mut().pci_io_write(offset, value, size) {
                return true;
            }
        }
        false
    }

    /// Broadcast an I/O space read until a device claims it. Unclaimed
    /// accesses float; the CPU collaborator turns them into machine checks.
    pub fn pci_io_read_broadcast(&mut self, offset: u32, size: u32) -> u32 {
        if let Some(res) = self.pci_io_read_loop(offset, size) {
            return res;
        }
        log::error!(
            "{}: attempt to read from unmapped PCI I/O space @{:08X}.{}",
            self.name,
            offset,
            size
        );
        0
    }

    pub fn pci_io_write_broadcast(&mut self, offset: u32, value: u32, size: u32) {
        if self.pci_io_write_loop(offset, value, size) {
            return;
        }
        log::error!(
            "{}: attempt to write to unmapped PCI I/O space @{:08X}.{} = {:X}",
            self.name,
            offset,
            size,
            value
        );
    }
}
