//! PDM machine factory (Power Macintosh 6100/7100/8100, the NuBus
//! PowerMacs).
//!
//! HMC memory controller, AMIC IO hub, Curio SCSI. The ROM sits at
//! 0x40000000 with the boot mirror at 0xFFC00000 so a PowerPC CPU can
//! start from the reset vector.

use std::rc::Rc;

use crate::ioctrl::{Amic, AMIC_REGS_BASE, AMIC_REGS_SIZE};
use crate::memctrl::hmc::{self, Hmc};

use super::{
    attach_scsi_bus, cpu_spec_from_prop, DeviceRegistry, IdRegister, Machine, MachineError,
    PropMap, MB,
};

const PDM_BUS_FREQ_HZ: u64 = 40_000_000;

pub fn defaults() -> PropMap {
    let mut props = PropMap::new();
    props.add_int("rambank1_size", 8, &[0, 2, 4, 8, 16, 32, 64, 128]);
    props.add_int("rambank2_size", 0, &[0, 2, 4, 8, 16, 32, 64, 128]);
    props.add_bin("emmo", false);
    props.add_str("cpu", "601", &["601"]);
    props.add_str("pds", "", &[]);
    props.add_str("hdd_img", "", &[]);
    props.add_str("cdr_img", "", &[]);
    props.add_str("hdd_config", "ScsiCurio/@0", &[]);
    props.add_str("cdr_config", "ScsiCurio/@3", &[]);
    props.add_str("fdd_img", "", &[]);
    props.add_int("mon_id", 0, &[]);
    props
}

fn machine_id_for(model: &str) -> Result<u16, MachineError> {
    match model {
        "pm6100" => Ok(0x3010),
        "pm7100" => Ok(0x3012),
        "pm8100" => Ok(0x3013),
        other => Err(MachineError::UnknownModel(other.to_string())),
    }
}

fn setup_pds(machine: &Machine, registry: &DeviceRegistry) {
    let dev_name = machine.props.get_str_opt("pds");
    if dev_name.is_empty() {
        return;
    }
    if !registry.device_registered(&dev_name) {
        log::warn!("specified PDS device {} doesn't exist", dev_name);
        return;
    }
    // PDS cards are NuBus devices, outside this fabric
    log::info!("Plugged {} into the PDS/VDS slot", dev_name);
}

pub fn build(machine: &mut Machine, registry: &DeviceRegistry) -> Result<(), MachineError> {
    let mem = machine.mem_ctrl.clone();
    let machine_id = machine_id_for(&machine.name)?;

    // memory controller with its bit-serial control register
    let hmc_obj = Hmc::new(mem.clone());
    mem.add_mmio_region(hmc::REGS_BASE, hmc::REGS_SIZE, hmc_obj.clone())?;
    machine.add_device("HMC", hmc_obj.clone());

    // create the machine ID register
    let id_reg = IdRegister::new("MachineID", machine_id);
    mem.add_mmio_region(0x5FFF_FFFC, 4, id_reg.clone())?;
    machine.add_device("MachineID", id_reg);

    // allocate ROM region and mirror it to the reset vector
    mem.add_rom_region(0x4000_0000, 0x40_0000)?;
    mem.add_mem_mirror(0xFFC0_0000, 0x4000_0000)?;

    // motherboard RAM plus the configured SIMM banks
    let bank_a = machine.props.get_int("rambank1_size") * MB;
    let bank_b = machine.props.get_int("rambank2_size") * MB;
    hmc_obj
        .borrow_mut()
        .install_ram(hmc::BANK_SIZE_8MB, bank_a, bank_b)
        .map_err(MachineError::RamConfig)?;

    // AMIC IO hub
    let amic_obj = Amic::new(Rc::clone(&machine.cpu_int));
    mem.add_mmio_region(AMIC_REGS_BASE, AMIC_REGS_SIZE, amic_obj.clone())?;
    machine.add_device("AMIC", amic_obj);

    // SCSI fabric (Curio 53C94)
    attach_scsi_bus(machine, "ScsiCurio", "Sc53C94")?;

    setup_pds(machine, registry);

    // init the virtual CPU descriptor
    machine.cpu_spec = Some(cpu_spec_from_prop(
        &machine.props.get_str("cpu"),
        PDM_BUS_FREQ_HZ,
    ));

    Ok(())
}
