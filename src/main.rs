use clap::{Parser, ValueEnum};
use tracing::info;

use ts10::core::config::Config;
use ts10::emu::{Ks10Machine, VaxMachine, EMU_NAME, EMU_VERSION};
use ts10::log::Logger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum MachineKind {
    /// 36-bit DECSYSTEM-2020 (KS10) processor
    Ks10,
    /// 32-bit MicroVAX II (KA630) processor
    Vax,
}

#[derive(Parser)]
#[command(name = "ts10", about = "DEC KS10 / MicroVAX II system emulator")]
struct Args {
    /// Which machine to bring up
    #[arg(value_enum)]
    machine: MachineKind,

    /// YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Console TCP port (overrides the configuration)
    #[arg(short, long)]
    port: Option<u16>,

    /// Boot ROM image (VAX) or boot medium image (KS10)
    #[arg(short, long)]
    image: Option<String>,

    /// Initial log filter, e.g. "info" or "ts10=debug"
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn main() {
    let args = Args::parse();
    let _logger = Logger::new(&args.log_level);

    info!("Welcome to {EMU_NAME} v{EMU_VERSION}");

    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{e}");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    if let Some(port) = args.port {
        config.console_port = port;
    }
    if let Some(image) = &args.image {
        match args.machine {
            MachineKind::Ks10 => config.ks10.boot_image = Some(image.clone()),
            MachineKind::Vax => config.vax.rom_image = Some(image.clone()),
        }
    }

    let code = match args.machine {
        MachineKind::Ks10 => match Ks10Machine::build(&config) {
            Ok(mut machine) => machine.run(),
            Err(e) => {
                eprintln!("KS10: {e}");
                std::process::exit(1);
            }
        },
        MachineKind::Vax => match VaxMachine::build(&config) {
            Ok(mut machine) => machine.run(),
            Err(e) => {
                eprintln!("VAX: {e}");
                std::process::exit(1);
            }
        },
    };
    std::process::exit(code.min(255) as i32);
}
