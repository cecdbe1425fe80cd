//! TNT machine factory (Power Macintosh 7300-9600).
//!
//! Hammerhead memory controller, Bandit PCI host bridge(s), Grand Central
//! IO hub on the first PCI bus, optional Chaos VCI bridge, MESH SCSI bus.

use std::rc::Rc;

use crate::interrupts::IntSrc;
use crate::memctrl::hammerhead::{self, HammerheadCtrl};
use crate::pci::device::PciDeviceHandle;
use crate::pci::host::PciIrqMapEntry;
use crate::pci::{dev_fun, Bandit, Chaos};

use super::{
    attach_scsi_bus, attach_slot_devices, cpu_spec_from_prop, DeviceRegistry, IdRegister, Machine,
    MachineError, PropMap, MB, RAM_BANK_SIZES,
};

const TNT_BUS_FREQ_HZ: u64 = 50_000_000;

fn bandit1_irq_map() -> Vec<PciIrqMapEntry> {
    vec![
        PciIrqMapEntry {
            slot_name: None,
            dev_fun: dev_fun(0x0B, 0),
            int_src: Some(IntSrc::Bandit1),
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
            int_src: None, // GrandCentral
        },
    ]
}

fn bandit2_irq_map() -> Vec<PciIrqMapEntry> {
    vec![
        PciIrqMapEntry {
            slot_name: None,
            dev_fun: dev_fun(0x0B, 0),
            int_src: Some(IntSrc::Bandit2),
        },
        PciIrqMapEntry {
            slot_name: Some("pci_D2"),
            dev_fun: dev_fun(0x0D, 0),
            int_src: Some(IntSrc::PciD),
        },
        PciIrqMapEntry {
            slot_name: Some("pci_E2"),
            dev_fun: dev_fun(0x0E, 0),
            int_src: Some(IntSrc::PciE),
        },
        PciIrqMapEntry {
            slot_name: Some("pci_F2"),
            dev_fun: dev_fun(0x0F, 0),
            int_src: Some(IntSrc::PciF),
        },
    ]
}

fn chaos_irq_map() -> Vec<PciIrqMapEntry> {
    vec![
        PciIrqMapEntry {
            slot_name: None,
            dev_fun: dev_fun(0x0B, 0),
            int_src: Some(IntSrc::ControlVideo),
        },
        PciIrqMapEntry {
            slot_name: Some("vci_D"),
            dev_fun: dev_fun(0x0D, 0),
            int_src: Some(IntSrc::PlanB),
        },
        PciIrqMapEntry {
            slot_name: Some("vci_E"),
            dev_fun: dev_fun(0x0E, 0),
            int_src: Some(IntSrc::Vci),
        },
    ]
}

pub fn defaults() -> PropMap {
    let mut props = PropMap::new();
    props.add_int("rambank0_size", 0, RAM_BANK_SIZES);
    props.add_int("rambank1_size", 16, &[4, 8, 16, 32, 64, 128]);
    for bank in 2..=12 {
        props.add_int(&format!("rambank{}_size", bank), 0, RAM_BANK_SIZES);
    }
    props.add_bin("emmo", false);
    props.add_str("cpu", "604e", &["601", "604", "604e", "750"]);
    for slot in ["pci_A1", "pci_B1", "pci_C1", "pci_D2", "pci_E2", "pci_F2"] {
        props.add_str(slot, "", &[]);
    }
    for slot in ["vci_D", "vci_E", "vci_F"] {
        props.add_str(slot, "", &[]);
    }
    props.add_str("hdd_img", "", &[]);
    props.add_str("cdr_img", "", &[]);
    props.add_str("hdd_config", "ScsiMesh/@0", &[]);
    props.add_str("cdr_config", "ScsiMesh/@3", &[]);
    props.add_int("mon_id", 0, &[]);
    props
}

/// Models with a second Bandit instead of the Chaos video bus.
fn has_second_bandit(model: &str) -> bool {
    matches!(model, "pm9500" | "pm9600")
}

pub fn build(machine: &mut Machine, registry: &DeviceRegistry) -> Result<(), MachineError> {
    let mem = machine.mem_ctrl.clone();

    // memory controller with its register window
    let memctrl_obj = HammerheadCtrl::new(mem.clone());
    mem.add_mmio_region(
        hammerhead::REGS_BASE,
        hammerhead::REGS_SIZE,
        memctrl_obj.clone(),
    )?;
    machine.add_device("Hammerhead", memctrl_obj.clone());

    // allocate ROM region
    mem.add_rom_region(0xFFC0_0000, 0x40_0000)?;

    // first PCI bus with the IO hub
    let pci_host = Bandit::new(1, "Bandit1", 0x0001, 3);
    {
        let mut bandit = pci_host.borrow_mut();
        bandit.host.set_mem_ctrl(mem.clone());
        bandit.host.set_irq_map(bandit1_irq_map());
    }
    let base_addr = pci_host.borrow().base_addr();
    mem.add_mmio_region(base_addr, Bandit::REGION_SIZE, pci_host.clone())?;
    machine.add_device("Bandit1", pci_host.clone());

    let gc_obj = crate::ioctrl::grand_central(mem.clone(), Rc::clone(&machine.cpu_int));
    {
        let mut bandit = pci_host.borrow_mut();
        bandit
            .host
            .pci_register_device(dev_fun(0x10, 0), PciDeviceHandle::new(&gc_obj));
        bandit.host.set_interrupt_controller(gc_obj.clone());
    }
    machine.add_device("GrandCentral", gc_obj.clone());

    // SCSI fabric before the board registers so the fast-SCSI lever is known
    attach_scsi_bus(machine, "ScsiMesh", "MeshTnt")?;

    // board register 1: PRSNT bits, factory-test pin, fast SCSI lever
    let board_reg1 = IdRegister::new(
        "Board Register 1",
        0x003F
            | ((u16::from(!machine.props.get_bin("emmo"))) << 8)
            | (1 << 13) // no composite video out (active low)
            | (1 << 14) // fast SCSI present (active high)
            | 0x8000,
    );
    gc_obj.borrow_mut().attach_iodevice(0, board_reg1.clone());
    machine.add_device("BoardReg1", board_reg1);

    // video or expansion bus, depending on the model
    if has_second_bandit(&machine.name) {
        let pci2_host = Bandit::new(2, "Bandit2", 0x0001, 3);
        {
            let mut bandit = pci2_host.borrow_mut();
            bandit.host.set_mem_ctrl(mem.clone());
            bandit.host.set_irq_map(bandit2_irq_map());
            bandit.host.set_interrupt_controller(gc_obj.clone());
        }
        let base_addr = pci2_host.borrow().base_addr();
        mem.add_mmio_region(base_addr, Bandit::REGION_SIZE, pci2_host.clone())?;
        machine.add_device("Bandit2", pci2_host.clone());

        let board_reg2 = IdRegister::new("Board Register 2", 0x003F | 0x8000);
        gc_obj.borrow_mut().attach_iodevice(2, board_reg2.clone());
        machine.add_device("BoardReg2", board_reg2);

        attach_slot_devices(
            machine,
            registry,
            &[
                ("pci_D2", dev_fun(0x0D, 0)),
                ("pci_E2", dev_fun(0x0E, 0)),
                ("pci_F2", dev_fun(0x0F, 0)),
            ],
            |dev_fun_num, handle| {
                pci2_host
                    .borrow_mut()
                    .host
                    .pci_register_device(dev_fun_num, handle);
            },
        );
        pci2_host.borrow_mut().host.wire_slot_interrupts();
    } else {
        let vci_host = Chaos::new("Chaos");
        {
            let mut chaos = vci_host.borrow_mut();
            chaos.host().set_mem_ctrl(mem.clone());
            chaos.host().set_irq_map(chaos_irq_map());
            chaos.host().set_interrupt_controller(gc_obj.clone());
        }
        mem.add_mmio_region(0xF000_0000, Chaos::REGION_SIZE, vci_host.clone())?;
        machine.add_device("Chaos", vci_host);
    }

    // populate RAM banks from the configuration properties
    {
        let mut memctrl = memctrl_obj.borrow_mut();
        memctrl.set_motherboard_id(hammerhead::MBID_VCI0_PRESENT);
        memctrl.set_bus_speed(hammerhead::BUS_SPEED_50_MHZ);
        for bank_num in 0..=12usize {
            let bank_size = machine.props.get_int(&format!("rambank{}_size", bank_num));
            memctrl.insert_ram_dimm(bank_num, bank_size * MB);
        }
        memctrl.map_phys_ram();
    }

    // PCI expansion slots
    attach_slot_devices(
        machine,
        registry,
        &[
            ("pci_A1", dev_fun(0x0D, 0)),
            ("pci_B1", dev_fun(0x0E, 0)),
            ("pci_C1", dev_fun(0x0F, 0)),
        ],
        |dev_fun_num, handle| {
            pci_host
                .borrow_mut()
                .host
                .pci_register_device(dev_fun_num, handle);
        },
    );
    pci_host.borrow_mut().host.wire_slot_interrupts();

    // init the virtual CPU descriptor
    machine.cpu_spec = Some(cpu_spec_from_prop(
        &machine.props.get_str("cpu"),
        TNT_BUS_FREQ_HZ,
    ));

    Ok(())
}
