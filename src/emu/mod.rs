use crate::core::config::{BootDevice, Config};
use crate::core::console::Console;
use crate::devices::Device;
use crate::pdp10::cpu::Cpu as P10Cpu;
use crate::pdp10::fe::{self, FrontEnd};
use crate::pdp10::memory::load_image;
use crate::pdp10::Ks10;
use crate::vax::cpu::Vax;
use crate::vax::cty::Cty;
use crate::vax::memory::ROM_BASE;
use crate::vax::{stop_reason, VaxBus, STOP_SWITCH};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

pub const EMU_NAME: &str = "TS10";
pub const EMU_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Instructions between host-side polls (sockets, tick counter). The
/// common path through the loop is one decrement-and-branch.
const POLL_INTERVAL: u32 = 500;

/// Spawn the 10 ms host interval source. The thread only bumps a counter;
/// the machine loop folds it in at instruction boundaries.
fn start_interval_timer() -> Arc<AtomicU64> {
    let ticks = Arc::new(AtomicU64::new(0));
    let thread_ticks = ticks.clone();
    thread::spawn(move || loop {
        thread::sleep(Duration::from_millis(crate::core::JIFFY_MS));
        thread_ticks.fetch_add(1, Ordering::Relaxed);
    });
    ticks
}

fn parse_mac(text: Option<&str>) -> [u8; 6] {
    let default = [0x08, 0x00, 0x2B, 0x10, 0x20, 0x30];
    let Some(text) = text else { return default };
    let mut mac = [0u8; 6];
    let mut count = 0;
    for (k, part) in text.split(':').enumerate() {
        if k >= 6 {
            return default;
        }
        match u8::from_str_radix(part, 16) {
            Ok(b) => mac[k] = b,
            Err(_) => return default,
        }
        count += 1;
    }
    if count == 6 { mac } else { default }
}

// ================= KS10 =================

pub struct Ks10Machine {
    pub cpu: P10Cpu,
    pub sys: Ks10,
    ticks: Arc<AtomicU64>,
    seen_ticks: u64,
}

impl Ks10Machine {
    pub fn build(config: &Config) -> Result<Self, String> {
        let console = Console::listen("KS10", config.console_port, false)?;
        let fe = FrontEnd::new(Some(console));
        let mut sys = Ks10::new(config.ks10.memory_kw, fe);
        let mut cpu = P10Cpu::new();

        // RH11 disk/tape controller on adapter 1.
        let disk_image = match (&config.ks10.boot_device, &config.ks10.boot_image) {
            (Some(BootDevice::Disk), Some(path)) => Some(load_image(path)?),
            _ => None,
        };
        sys.attach(1, Device::Rh(crate::devices::rh::Rh11::new(vec![disk_image.clone()])));

        // DZ11 terminal lines on adapter 3, and a DHU11 the monitor can
        // probe (its lines come up unconnected).
        if config.dz_lines > 0 {
            let mut lines = Vec::new();
            for line in 0..config.dz_lines.min(crate::devices::dz::DZ_LINES) {
                let port = config.console_port + 10 + line as u16;
                lines.push(Console::listen("KS10-DZ", port, false).ok());
            }
            lines.resize_with(crate::devices::dz::DZ_LINES, || None);
            sys.attach(3, Device::Dz(crate::devices::dz::Dz11::new(lines)));
        }
        sys.attach(
            3,
            Device::Dh(crate::devices::dh::Dhu11::new(
                (0..crate::devices::dh::DH_LINES).map(|_| None).collect(),
            )),
        );
        // A DL11 register pair at the classic console address.
        sys.attach(3, Device::Dl(crate::devices::dl::Dl11::new(None)));

        // Boot per the configured device.
        match (&config.ks10.boot_device, &config.ks10.boot_image) {
            (Some(BootDevice::Disk), Some(path)) => {
                info!("Booting {path}...");
                let image = disk_image.unwrap();
                cpu.pc = fe::boot_disk(
                    &mut sys.mem,
                    &image,
                    crate::devices::rh::RH_CSR_ADDR,
                    1,
                    0,
                )?;
            }
            (Some(BootDevice::Tape), Some(path)) => {
                info!("Booting {path}...");
                let image = load_image(path)?;
                cpu.pc = fe::boot_tape(
                    &mut sys.mem,
                    &image,
                    crate::devices::rh::RH_CSR_ADDR,
                    1,
                    0,
                    config.ks10.boot_file,
                )?;
            }
            _ => warn!("KS10: no boot device configured; starting at PC 0"),
        }

        Ok(Self {
            cpu,
            sys,
            ticks: start_interval_timer(),
            seen_ticks: 0,
        })
    }

    /// The main loop: one instruction, one event drain, amortized host
    /// polling. Returns the halt status code.
    pub fn run(&mut self) -> u32 {
        let mut poll = POLL_INTERVAL;
        loop {
            match self.cpu.step(&mut self.sys) {
                Ok(cycles) => self.sys.clock.advance_time(cycles),
                Err(code) => {
                    println!(
                        "KS10: halted ({code:03o}) at PC {:06o}",
                        self.cpu.pc
                    );
                    return code;
                }
            }
            if self.sys.clock.has_ready_event() {
                self.sys.process_events();
            }
            poll -= 1;
            if poll == 0 {
                poll = POLL_INTERVAL;
                self.sys.poll_io();
                let now = self.ticks.load(Ordering::Relaxed);
                while self.seen_ticks < now {
                    self.sys.host_tick();
                    self.seen_ticks += 1;
                }
            }
        }
    }
}

// ================= VAX =================

pub struct VaxMachine {
    pub cpu: Vax,
    pub bus: VaxBus,
    ticks: Arc<AtomicU64>,
    seen_ticks: u64,
    has_rom: bool,
}

impl VaxMachine {
    pub fn build(config: &Config) -> Result<Self, String> {
        let console = Console::listen("VAX", config.console_port, true)?;
        let cty = Cty::new(Some(console));
        let mut bus = VaxBus::new(config.vax.memory_mb, cty);
        let mut cpu = Vax::new();

        let has_rom = match &config.vax.rom_image {
            Some(path) => {
                let image = load_image(path)?;
                bus.mem.load_rom(&image);
                true
            }
            None => {
                warn!("VAX: no console ROM image; nothing to run until one is loaded");
                false
            }
        };

        // DEQNA Ethernet.
        let mac = parse_mac(config.net.mac.as_deref());
        bus.attach(Device::Qna(crate::devices::qna::Deqna::new(mac)));

        // DZV terminal lines.
        if config.dz_lines > 0 {
            let mut lines = Vec::new();
            for line in 0..config.dz_lines.min(crate::devices::dz::DZ_LINES) {
                let port = config.console_port + 10 + line as u16;
                lines.push(Console::listen("VAX-DZ", port, false).ok());
            }
            lines.resize_with(crate::devices::dz::DZ_LINES, || None);
            bus.attach(Device::Dz(crate::devices::dz::Dz11::new(lines)));
        }

        // System disk behind the massbus shim.
        let disk_image = match &config.vax.disk_image {
            Some(path) => Some(load_image(path)?),
            None => None,
        };
        bus.attach(Device::Rh(crate::devices::rh::Rh11::new(vec![disk_image])));

        // Power-on: the console ROM runs on the interrupt stack with
        // memory management off.
        cpu.set_pc(ROM_BASE);
        Ok(Self {
            cpu,
            bus,
            ticks: start_interval_timer(),
            seen_ticks: 0,
            has_rom,
        })
    }

    /// Halt-by-switch: back into the console ROM, the way the hardware
    /// halt line re-enters the resident console.
    fn halt_to_console(&mut self) {
        if self.has_rom {
            info!("VAX: halt switch, entering console ROM");
            self.cpu.psl = 0x041F_0000;
            self.cpu.mmu.mapen = false;
            self.cpu.mmu.invalidate_all();
            self.cpu.set_pc(ROM_BASE);
        }
    }

    pub fn run(&mut self) -> u32 {
        let mut poll = POLL_INTERVAL;
        loop {
            match self.cpu.step(&mut self.bus) {
                Ok(cycles) => self.bus.clock.advance_time(cycles),
                Err(code) => {
                    println!("VAX: {} at PC {:08X}", stop_reason(code), self.cpu.pc());
                    return code;
                }
            }
            if self.bus.clock.has_ready_event() {
                self.bus.process_events();
            }
            poll -= 1;
            if poll == 0 {
                poll = POLL_INTERVAL;
                self.bus.poll_io();
                if self.bus.cty.halt_request {
                    self.bus.cty.halt_request = false;
                    if self.has_rom {
                        self.halt_to_console();
                    } else {
                        println!(
                            "VAX: {} at PC {:08X}",
                            stop_reason(STOP_SWITCH),
                            self.cpu.pc()
                        );
                        return STOP_SWITCH;
                    }
                }
                let now = self.ticks.load(Ordering::Relaxed);
                while self.seen_ticks < now {
                    self.bus.host_tick();
                    self.seen_ticks += 1;
                }
            }
        }
    }
}
