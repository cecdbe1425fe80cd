//! Gossamer machine factory (Power Macintosh G3, Beige).
//!
//! Grackle combines the memory controller and the PCI host bridge; Heathrow
//! is the IO hub at device 0x10 on the single PCI bus. RAM is not mapped at
//! build time: the firmware programs the Grackle bank registers and pulls
//! MEMGO, exactly like on the real board.

use std::rc::Rc;

use crate::interrupts::IntSrc;
use crate::pci::device::PciDeviceHandle;
use crate::pci::host::PciIrqMapEntry;
use crate::pci::{dev_fun, Grackle};

use super::{
    attach_scsi_bus, attach_slot_devices, cpu_spec_from_prop, DeviceRegistry, IdRegister, Machine,
    MachineError, PropMap,
};

const GOSSAMER_BUS_FREQ_HZ: u64 = 66_820_000;

// Bit definitions for the Gossamer system register at 0xFF000004
const FDC_TYPE_SWIM3: u16 = 1 << 15;
const PCI_A_PRSNT_POS: u16 = 8;
const PCM_PID_POS: u16 = 5;
const AIO_PRSNT_FALSE: u16 = 1 << 4;
const BUS_SPEED_POS: u16 = 1;
const BUS_FREQ_66P82: u16 = 6;
const UNKNOWN_BIT_0: u16 = 1;

fn grackle_irq_map() -> Vec<PciIrqMapEntry> {
    vec![
        PciIrqMapEntry {
            slot_name: Some("pci_PERCH"),
            dev_fun: dev_fun(0x0C, 0),
            int_src: Some(IntSrc::PerchCard),
        },
        PciIrqMapEntry {
            slot_name: Some("pci_A1"),
            dev_fun: dev_fun(0x0D, 0),
            int_src: Some(IntSrc::PciA),
        },
        PciIrqMapEntry {
            slot_name: Some("pci_B1"),
            dev_fun: dev_fun(0x0E, 0),
            int_src: Some(IntSrc::PciB),
        },
        PciIrqMapEntry {
            slot_name: Some("pci_C1"),
            dev_fun: dev_fun(0x0F, 0),
            int_src: Some(IntSrc::PciC),
        },
        PciIrqMapEntry {
            slot_name: None,
            dev_fun: dev_fun(0x10, 0),
            int_src: None, // Heathrow
        },
    ]
}

pub fn defaults() -> PropMap {
    let mut props = PropMap::new();
    for bank in 1..=3 {
        props.add_int(
            &format!("rambank{}_size", bank),
            if bank == 1 { 32 } else { 0 },
            &[0, 4, 8, 16, 32, 64, 128, 256],
        );
    }
    props.add_bin("emmo", false);
    props.add_str("cpu", "750", &["604e", "750"]);
    for slot in ["pci_PERCH", "pci_A1", "pci_B1", "pci_C1"] {
        props.add_str(slot, "", &[]);
    }
    props.add_str("hdd_img", "", &[]);
    props.add_str("cdr_img", "", &[]);
    props.add_str("hdd_config", "ScsiMesh/@0", &[]);
    props.add_str("cdr_config", "ScsiMesh/@3", &[]);
    props.add_int("mon_id", 0, &[]);
    props
}

pub fn build(machine: &mut Machine, registry: &DeviceRegistry) -> Result<(), MachineError> {
    let mem = machine.mem_ctrl.clone();

    // memory controller / PCI host bridge
    let grackle_obj = Grackle::new();
    {
        let mut grackle = grackle_obj.borrow_mut();
        grackle.host.set_mem_ctrl(mem.clone());
        grackle.host.set_irq_map(grackle_irq_map());
        grackle.device_postinit(mem.clone());
    }
    mem.add_mmio_region(
        Grackle::IO_REGION_BASE,
        Grackle::IO_REGION_SIZE,
        grackle_obj.clone(),
    )?;
    mem.add_mmio_region(
        Grackle::CFG_REGION_BASE,
        Grackle::CFG_REGION_SIZE,
        grackle_obj.clone(),
    )?;
    machine.add_device("Grackle", grackle_obj.clone());

    // configure the Gossamer system register
    let sys_reg = FDC_TYPE_SWIM3
        | (0x3F << PCI_A_PRSNT_POS) // pull up all PRSNT bits
        | (1 << PCM_PID_POS) // CPU/cache speed ratio = 2:1
        | AIO_PRSNT_FALSE // this machine is not all-in-one
        | (BUS_FREQ_66P82 << BUS_SPEED_POS)
        | UNKNOWN_BIT_0;
    let machine_id = IdRegister::new("GossamerID", sys_reg);
    mem.add_mmio_region(0xFF00_0000, 4096, machine_id.clone())?;
    machine.add_device("MachineID", machine_id);

    // allocate ROM region
    mem.add_rom_region(0xFFC0_0000, 0x40_0000)?;

    // IO hub
    let heathrow_obj = crate::ioctrl::heathrow(mem.clone(), Rc::clone(&machine.cpu_int));
    {
        let mut grackle = grackle_obj.borrow_mut();
        grackle
            .host
            .pci_register_device(dev_fun(0x10, 0), PciDeviceHandle::new(&heathrow_obj));
        grackle.host.set_interrupt_controller(heathrow_obj.clone());
    }
    machine.add_device("Heathrow", heathrow_obj);

    // SCSI fabric (the MESH cell lives inside Heathrow)
    attach_scsi_bus(machine, "ScsiMesh", "MeshHeathrow")?;

    // PCI expansion slots
    attach_slot_devices(
        machine,
        registry,
        &[
            ("pci_PERCH", dev_fun(0x0C, 0)),
            ("pci_A1", dev_fun(0x0D, 0)),
            ("pci_B1", dev_fun(0x0E, 0)),
            ("pci_C1", dev_fun(0x0F, 0)),
        ],
        |dev_fun_num, handle| {
            grackle_obj
                .borrow_mut()
                .host
                .pci_register_device(dev_fun_num, handle);
        },
    );
    grackle_obj.borrow_mut().host.wire_slot_interrupts();

    // init the virtual CPU descriptor
    machine.cpu_spec = Some(cpu_spec_from_prop(
        &machine.props.get_str("cpu"),
        GOSSAMER_BUS_FREQ_HZ,
    ));

    Ok(())
}
