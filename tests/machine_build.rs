//! Machine composition: address maps, RAM/ROM invariants, property
//! validation, and the Gossamer firmware-driven RAM setup.

use oldworld::machine::{create_machine, DeviceRegistry, MachineError};

fn build(model: &str, overrides: &[(&str, &str)]) -> oldworld::machine::Machine {
    let registry = DeviceRegistry::new();
    create_machine(model, overrides, &registry).unwrap()
}

#[test]
fn tnt_address_map_layout() {
    let machine = build("pm7500", &[]);
    let mem = machine.mem_ctrl.clone();

    // ROM at 0xFFC00000, Hammerhead registers, Bandit-1 at 0xF2000000
    assert_eq!(mem.find_rom_region(), Some((0xFFC0_0000, 0xFFFF_FFFF)));
    assert!(mem.find_range(0xF800_0000).is_some());
    assert!(mem.find_range(0xF200_0000).is_some());

    // default RAM: one 16 MB bank at zero
    let ram = mem.find_range(0).unwrap();
    assert_eq!(ram.end, 16 * 0x10_0000 - 1);
}

#[test]
fn tnt_ram_write_read_round_trip() {
    let machine = build("pm7500", &[("rambank2_size", "32")]);
    let mem = machine.mem_ctrl.clone();

    for (addr, val, size) in [
        (0x0000_1000u32, 0xA5u32, 1u32),
        (0x0010_0002, 0xBEEF, 2),
        (0x02FF_FFF8, 0xDEAD_BEEF, 4),
    ] {
        mem.write(addr, val, size);
        assert_eq!(mem.read(addr, size), val, "addr {:X} size {}", addr, size);
    }
}

#[test]
fn tnt_rom_image_visible_at_reset_vector() {
    let mut machine = build("pm7500", &[]);
    let mut image = vec![0u8; 0x1000];
    image[0..4].copy_from_slice(&[0x48, 0x00, 0x00, 0x64]); // b +0x64
    machine.load_rom_image(&image).unwrap();
    assert_eq!(machine.mem_ctrl.read(0xFFC0_0000, 4), 0x4800_0064);
}

#[test]
fn pdm_rom_mirror_tracks_origin() {
    let mut machine = build("pm6100", &[]);
    machine.load_rom_image(&[0x11, 0x22, 0x33, 0x44]).unwrap();

    let mem = machine.mem_ctrl.clone();
    // ROM at 0x40000000, mirrored at the reset vector
    assert_eq!(mem.read(0x4000_0000, 4), 0x1122_3344);
    assert_eq!(mem.read(0xFFC0_0000, 4), 0x1122_3344);
}

#[test]
fn pdm_ram_banks() {
    let machine = build("pm6100", &[("rambank1_size", "16")]);
    let mem = machine.mem_ctrl.clone();
    // 8 MB motherboard bank at zero plus bank A
    assert!(mem.find_range(0).is_some());
    assert!(mem.find_range(0x1000_0000).is_some());
}

#[test]
fn machine_id_register_reads() {
    let machine = build("pm6100", &[]);
    let mem = machine.mem_ctrl.clone();
    assert_eq!(mem.read(0x5FFF_FFFC, 2), 0x3010);
}

#[test]
fn gossamer_firmware_sizes_ram_through_grackle() {
    let machine = build("pmg3", &[]);
    let mem = machine.mem_ctrl.clone();

    // no RAM until the firmware programs the bank registers
    assert!(mem.find_range(0).is_none());

    // Grackle CONFIG_ADDR layout is byte-swapped relative to the standard
    // encoding because the register is little-endian; the firmware uses
    // stwbrx. enable | bus 0 | dev 0 | fn 0 | reg.
    let cfg_addr = |reg: u32| (0x8000_0000u32 | (reg & 0xFC)).swap_bytes();
    let cfg_write = |reg: u32, value: u32| {
        mem.write(0xFEC0_0000, cfg_addr(reg), 4);
        mem.write(0xFEE0_0000, value.swap_bytes(), 4);
    };

    // bank 0: start 0, end 0x01FFFFFF (32 MB)
    cfg_write(0x80, 0x0000_0000); // MSAR1
    cfg_write(0x88, 0x0000_0000); // EMSAR1
    cfg_write(0x90, 0x0000_001F); // MEAR1
    cfg_write(0x98, 0x0000_0000); // EMEAR1
    cfg_write(0xA0, 0x0000_0001); // MBER: bank 0 enabled
    cfg_write(0xF0, 1 << 19); // MCCR1: MEMGO

    let ram = mem.find_range(0).expect("RAM mapped after MEMGO");
    assert_eq!(ram.end, 0x01FF_FFFF);
}

#[test]
fn gossamer_machine_id_levers() {
    let machine = build("pmg3", &[]);
    let mem = machine.mem_ctrl.clone();
    let sys_reg = mem.read(0xFF00_0004, 2);
    // SWIM3-style floppy controller bit is set
    assert_ne!(sys_reg & 0x8000, 0);
}

#[test]
fn invalid_ram_size_rejected() {
    let registry = DeviceRegistry::new();
    let err = create_machine("pm7500", &[("rambank1_size", "13")], &registry);
    assert!(matches!(err, Err(MachineError::Prop(_))));
}

#[test]
fn unknown_model_rejected() {
    let registry = DeviceRegistry::new();
    let err = create_machine("quadra840av", &[], &registry);
    assert!(matches!(err, Err(MachineError::UnknownModel(_))));
}

#[test]
fn unknown_property_rejected() {
    let registry = DeviceRegistry::new();
    let err = create_machine("pm7500", &[("turbo_button", "1")], &registry);
    assert!(matches!(err, Err(MachineError::Prop(_))));
}

#[test]
fn cpu_spec_follows_property() {
    use oldworld::machine::CpuVersion;

    let machine = build("pm7500", &[("cpu", "601")]);
    let spec = machine.cpu_spec.unwrap();
    assert_eq!(spec.version, CpuVersion::Mpc601);
    assert_eq!(spec.timebase_freq_hz, 7_833_600);

    let machine = build("pmg3", &[]);
    let spec = machine.cpu_spec.unwrap();
    assert_eq!(spec.version, CpuVersion::Mpc750);
    assert_eq!(spec.timebase_freq_hz, spec.bus_freq_hz / 4);
    assert_eq!(spec.pll_ratio_tenths, 35);
}

#[test]
fn grand_central_bar_sizing_maps_register_window() {
    let machine = build("pm7500", &[]);

    // select Grand Central (device 0x10 on the Bandit bus) BAR0 by IDSEL
    let mem = machine.mem_ctrl.clone();
    let config_addr = 0xF280_0000u32;
    let config_data = 0xF2C0_0000u32;

    let cfg_write = |addr: u32, value: u32| {
        mem.write(config_addr, addr.swap_bytes(), 4);
        mem.write(config_data, value.swap_bytes(), 4);
    };

    // sizing: 128 KB window
    cfg_write(1 << 0x10 | 0x10, 0xFFFF_FFFF);
    mem.write(config_addr, (1u32 << 0x10 | 0x10).swap_bytes(), 4);
    assert_eq!(mem.read(config_data, 4).swap_bytes(), 0xFFFE_0000);

    // latch the window at 0xF3000000 and use it
    cfg_write(1 << 0x10 | 0x10, 0xF300_0000);

    assert!(mem.find_range(0xF300_0000).is_some());
    // interrupt mask register of the hub answers through the new window
    assert_eq!(mem.read(0xF300_0000 + 0x24, 4), 0);
}
