//! Thin driver: build a machine model and run the timer loop.
//!
//! The real front end couples this with a PowerPC core and host I/O; this
//! binary exists to compose a machine from the command line and prove the
//! fabric wires up.

use oldworld::machine::{self, DeviceRegistry};

fn usage() -> ! {
    eprintln!("usage: oldworld [<machine-model>] [prop=value ...]");
    eprintln!("models:");
    for (name, description) in machine::machine_models() {
        eprintln!("  {:10} {}", name, description);
    }
    std::process::exit(1);
}

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut model = "pm7500".to_string();
    let mut overrides: Vec<(String, String)> = Vec::new();
    for arg in &args {
        if let Some((name, value)) = arg.split_once('=') {
            overrides.push((name.to_string(), value.to_string()));
        } else if arg == "-h" || arg == "--help" {
            usage();
        } else {
            model = arg.clone();
        }
    }

    let override_refs: Vec<(&str, &str)> = overrides
        .iter()
        .map(|(n, v)| (n.as_str(), v.as_str()))
        .collect();

    let registry = DeviceRegistry::new();
    let machine = match machine::create_machine(&model, &override_refs, &registry) {
        Ok(machine) => machine,
        Err(err) => {
            eprintln!("oldworld: {}", err);
            std::process::exit(1);
        }
    };

    if let Some(spec) = &machine.cpu_spec {
        log::info!(
            "{} up: cpu {:?}, bus {} Hz, timebase {} Hz",
            machine.name,
            spec.version,
            spec.bus_freq_hz,
            spec.timebase_freq_hz
        );
    }

    // Without a CPU core attached there is nothing to drive the virtual
    // clock, so drain whatever the device factories scheduled and exit.
    loop {
        let next_delay = machine.timers.process_timers();
        if next_delay == 0 {
            break;
        }
        machine
            .virtual_clock
            .set(machine.virtual_clock.get() + next_delay);
    }

    log::info!("{}: machine composed, timer queue drained", machine.name);
}
