//! Machine composition: the per-model factories and the value that owns a
//! running machine.
//!
//! A `Machine` owns the timer manager, the memory controller, the CPU
//! interrupt line and every device, keyed by name where later wiring needs
//! to find a sibling. There is no global machine object: everything is
//! threaded through construction.

pub mod gossamer;
pub mod pdm;
pub mod properties;
pub mod tnt;

pub use properties::{PropError, PropMap, Property};

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use thiserror::Error;

use crate::interrupts::{CpuIntLine, CpuIntRef};
use crate::memctrl::{MemCtrl, MemCtrlRef, MmioRef, RegionError};
use crate::pci::device::PciDeviceHandle;
use crate::scsi::ScsiBus;
use crate::timers::TimerManager;

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("unknown machine model '{0}'")]
    UnknownModel(String),
    #[error(transparent)]
    Prop(#[from] PropError),
    #[error(transparent)]
    Region(#[from] RegionError),
    #[error("RAM configuration error: {0}")]
    RamConfig(String),
    #[error("could not load image file '{path}': {source}")]
    Image {
        path: String,
        source: std::io::Error,
    },
}

// ── CPU descriptor ────────────────────────────────────────────

/// PowerPC models fitted to these machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuVersion {
    Mpc601,
    Mpc604,
    Mpc604e,
    Mpc750,
}

/// What the CPU collaborator needs to know: core version, bus and timebase
/// frequencies, and the PLL ratio preset in HID1 (tenths).
#[derive(Debug, Clone, Copy)]
pub struct CpuSpec {
    pub version: CpuVersion,
    pub bus_freq_hz: u64,
    pub timebase_freq_hz: u64,
    pub pll_ratio_tenths: u32,
}

/// Derive the CPU descriptor from the `cpu` property the way the machine
/// factories configure the real parts.
pub fn cpu_spec_from_prop(cpu: &str, bus_freq_hz: u64) -> CpuSpec {
    match cpu {
        "601" => CpuSpec {
            version: CpuVersion::Mpc601,
            bus_freq_hz,
            timebase_freq_hz: 7_833_600,
            pll_ratio_tenths: 10,
        },
        "604" => CpuSpec {
            version: CpuVersion::Mpc604,
            bus_freq_hz,
            timebase_freq_hz: 12_500_000,
            pll_ratio_tenths: 10,
        },
        "604e" => CpuSpec {
            version: CpuVersion::Mpc604e,
            bus_freq_hz,
            timebase_freq_hz: 12_500_000,
            pll_ratio_tenths: 10,
        },
        "750" => CpuSpec {
            version: CpuVersion::Mpc750,
            bus_freq_hz,
            timebase_freq_hz: bus_freq_hz / 4,
            pll_ratio_tenths: 35,
        },
        other => panic!("unsupported cpu model '{}'", other),
    }
}

// ── Device registry ───────────────────────────────────────────

/// Factory signature for devices pluggable into PCI slots.
pub type PciDevFactory = fn(&mut Machine) -> PciDeviceHandle;

/// Name to factory map consulted when a slot property names a card.
#[derive(Default)]
pub struct DeviceRegistry {
    factories: HashMap<&'static str, PciDevFactory>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &'static str, factory: PciDevFactory) {
        self.factories.insert(name, factory);
    }

    pub fn device_registered(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn create(&self, name: &str, machine: &mut Machine) -> Option<PciDeviceHandle> {
        self.factories.get(name).map(|factory| factory(machine))
    }
}

// ── Machine ───────────────────────────────────────────────────

pub struct Machine {
    pub name: String,
    pub props: PropMap,

    pub timers: Rc<TimerManager>,
    /// Virtual clock driven by the CPU collaborator (or the main loop).
    pub virtual_clock: Rc<Cell<u64>>,
    pub mem_ctrl: MemCtrlRef,
    pub cpu_int: CpuIntRef,
    pub cpu_spec: Option<CpuSpec>,
    pub scsi_bus: Option<ScsiBus>,
    pub scsi_ctrl: Option<crate::scsi::ScsiCtrl>,

    /// Name map over every memory-mapped device for postinit wiring.
    devices: HashMap<String, MmioRef>,
}

impl Machine {
    pub fn new(name: &str, props: PropMap) -> Self {
        let timers = TimerManager::new();
        let virtual_clock = Rc::new(Cell::new(0u64));
        let clock = Rc::clone(&virtual_clock);
        timers.set_time_now_cb(move || clock.get());

        Self {
            name: name.to_string(),
            props,
            timers,
            virtual_clock,
            mem_ctrl: MemCtrl::new(),
            cpu_int: CpuIntLine::new(),
            cpu_spec: None,
            scsi_bus: None,
            scsi_ctrl: None,
            devices: HashMap::new(),
        }
    }

    pub fn add_device(&mut self, name: &str, dev: MmioRef) {
        if self
            .devices
            .insert(name.to_string(), dev)
            .is_some()
        {
            log::warn!("{}: device '{}' replaced", self.name, name);
        }
    }

    pub fn device_by_name(&self, name: &str) -> Option<MmioRef> {
        self.devices.get(name).cloned()
    }

    /// Load a firmware image into the machine ROM region.
    pub fn load_rom_image(&mut self, image: &[u8]) -> Result<(), MachineError> {
        let (rom_start, _) = self
            .mem_ctrl.find_rom_region()
            .ok_or_else(|| MachineError::RamConfig("no ROM region allocated".to_string()))?;
        self.mem_ctrl.set_data(rom_start, image)?;
        Ok(())
    }
}

// ── Machine-ID style registers ────────────────────────────────

/// A 16-bit read-only lever register (board registers, machine IDs). The
/// value always reads back in the most significant lanes, the way the real
/// pull-up registers present themselves.
pub struct IdRegister {
    name: String,
    value: u16,
}

impl IdRegister {
    pub fn new(name: &str, value: u16) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            name: name.to_string(),
            value,
        }))
    }
}

impl crate::memctrl::MmioDevice for IdRegister {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&mut self, _rgn_start: u32, offset: u32, size: u32) -> u32 {
        // the register repeats through its whole window
        match (offset & 3, size) {
            (0, 1) => (self.value >> 8) as u32,
            (1, 1) => (self.value & 0xFF) as u32,
            (0, 2) => self.value as u32,
            (0, 4) => (self.value as u32) << 16,
            _ => 0,
        }
    }

    fn write(&mut self, _rgn_start: u32, offset: u32, value: u32, _size: u32) {
        log::warn!(
            "{}: write to read-only register @{:X} = {:X} ignored",
            self.name,
            offset,
            value
        );
    }
}

// ── Model table ───────────────────────────────────────────────

struct MachineDescription {
    name: &'static str,
    description: &'static str,
    build: fn(&mut Machine, &DeviceRegistry) -> Result<(), MachineError>,
    defaults: fn() -> PropMap,
}

const MACHINE_TABLE: &[MachineDescription] = &[
    MachineDescription {
        name: "pm6100",
        description: "Power Macintosh 6100",
        build: pdm::build,
        defaults: pdm::defaults,
    },
    MachineDescription {
        name: "pm7100",
        description: "Power Macintosh 7100",
        build: pdm::build,
        defaults: pdm::defaults,
    },
    MachineDescription {
        name: "pm8100",
        description: "Power Macintosh 8100",
        build: pdm::build,
        defaults: pdm::defaults,
    },
    MachineDescription {
        name: "pm7300",
        description: "Power Macintosh 7300",
        build: tnt::build,
        defaults: tnt::defaults,
    },
    MachineDescription {
        name: "pm7500",
        description: "Power Macintosh 7500",
        build: tnt::build,
        defaults: tnt::defaults,
    },
    MachineDescription {
        name: "pm8500",
        description: "Power Macintosh 8500",
        build: tnt::build,
        defaults: tnt::defaults,
    },
    MachineDescription {
        name: "pm9500",
        description: "Power Macintosh 9500",
        build: tnt::build,
        defaults: tnt::defaults,
    },
    MachineDescription {
        name: "pmg3",
        description: "Power Macintosh G3 (Beige)",
        build: gossamer::build,
        defaults: gossamer::defaults,
    },
];

pub fn machine_models() -> Vec<(&'static str, &'static str)> {
    MACHINE_TABLE
        .iter()
        .map(|m| (m.name, m.description))
        .collect()
}

/// Instantiate a machine model: merge the property overrides into the model
/// defaults, then run the model factory.
pub fn create_machine(
    model: &str,
    overrides: &[(&str, &str)],
    registry: &DeviceRegistry,
) -> Result<Machine, MachineError> {
    let desc = MACHINE_TABLE
        .iter()
        .find(|m| m.name == model)
        .ok_or_else(|| MachineError::UnknownModel(model.to_string()))?;

    let mut props = (desc.defaults)();
    for (name, value) in overrides {
        props.set_override(name, value)?;
    }

    log::info!("Building machine {}...", desc.description);

    let mut machine = Machine::new(desc.name, props);
    (desc.build)(&mut machine, registry)?;
    Ok(machine)
}

/// Shared RAM bank allow-list of the DIMM-based machines.
pub(crate) const RAM_BANK_SIZES: &[u32] = &[0, 4, 8, 16, 32, 64, 128];

pub(crate) const MB: u32 = 0x10_0000;

/// Read `hdd_img`-style multi-path properties ("a.img:b.img").
pub(crate) fn split_image_paths(prop: &str) -> Vec<String> {
    prop.split(':')
        .filter(|p| !p.is_empty())
        .map(|p| p.to_string())
        .collect()
}

/// Create the machine's SCSI bus with its controller sequencer and populate
/// it from the disk image properties. Hard disks fill IDs from 0 upwards
/// skipping 3, CD-ROM style media fill IDs from 3 upwards.
pub(crate) fn attach_scsi_bus(
    machine: &mut Machine,
    bus_name: &str,
    ctrl_name: &str,
) -> Result<(), MachineError> {
    use crate::scsi::device::attach_target;
    use crate::scsi::{ScsiCtrl, ScsiHardDisk, SCSI_MAX_DEVS};

    let bus = ScsiBus::new(bus_name);
    let ctrl = ScsiCtrl::new(ctrl_name, 7, bus.clone(), Rc::clone(&machine.timers));
    ctrl.attach_to_bus();

    // `hdd_config`/`cdr_config` name the bus the images belong to
    for cfg_name in ["hdd_config", "cdr_config"] {
        let cfg = machine.props.get_str_opt(cfg_name);
        if !cfg.is_empty() && cfg.split('/').next() != Some(bus_name) {
            log::warn!(
                "{}: {} names bus '{}', images go to this machine's '{}'",
                machine.name,
                cfg_name,
                cfg,
                bus_name
            );
        }
    }

    let attach_image = |path: &str, first_id: usize, skip: Option<usize>| {
        let id = (first_id..SCSI_MAX_DEVS)
            .chain(0..first_id)
            .find(|&id| Some(id) != skip && id != 7 && bus.device_at(id).is_none());
        let id = match id {
            Some(id) => id,
            None => {
                log::error!("{}: too many devices, \"{}\" was not added", bus_name, path);
                return Ok::<(), MachineError>(());
            }
        };
        let image = std::fs::read(path).map_err(|source| MachineError::Image {
            path: path.to_string(),
            source,
        })?;
        let name = format!("ScsiHD{},{}", bus_name, id);
        let disk = Rc::new(RefCell::new(ScsiHardDisk::new(&name, id)));
        disk.borrow_mut().insert_image(image);
        attach_target(&bus, disk, Rc::clone(&machine.timers));
        log::info!("{}: attached \"{}\" at ID {}", bus_name, path, id);
        Ok(())
    };

    for path in split_image_paths(&machine.props.get_str_opt("hdd_img")) {
        attach_image(&path, 0, Some(3))?;
    }
    for path in split_image_paths(&machine.props.get_str_opt("cdr_img")) {
        attach_image(&path, 3, None)?;
    }

    machine.scsi_bus = Some(bus);
    machine.scsi_ctrl = Some(ctrl);
    Ok(())
}

/// Plug registry devices into the named PCI slots. `slots` pairs a slot
/// property name with its device/function number; `register` places the
/// created device on the owning host.
pub(crate) fn attach_slot_devices<F>(
    machine: &mut Machine,
    registry: &DeviceRegistry,
    slots: &[(&'static str, u8)],
    mut register: F,
) where
    F: FnMut(u8, PciDeviceHandle),
{
    for &(slot_name, dev_fun) in slots {
        let dev_name = machine.props.get_str_opt(slot_name);
        if dev_name.is_empty() {
            continue;
        }
        if !registry.device_registered(&dev_name) {
            log::warn!("specified PCI device {} doesn't exist", dev_name);
            continue;
        }
        if let Some(handle) = registry.create(&dev_name, machine) {
            register(dev_fun, handle);
            log::info!("Plugged {} into slot {}", dev_name, slot_name);
        }
    }
}
