pub mod arith;
pub mod cpu;
pub mod cty;
pub mod insts;
pub mod memory;
pub mod mmu;
pub mod operand;
pub mod qbus;

use crate::core::clock::Clock;
use crate::devices::{Device, IoCtx, IoEvent, IrqOp};
use crate::vax::cty::Cty;
use crate::vax::memory::{NoMemory, PhysMemory, IO_BASE};
use crate::vax::qbus::{Qbus, QbusDma, QbusTarget};
use tracing::debug;

// Processor stop codes, printed in the final diagnostic line.
pub const STOP_HALT: u32 = 1; // HALT instruction
pub const STOP_SWITCH: u32 = 2; // halt-by-switch (console Ctrl-P)
pub const STOP_ILLVEC: u32 = 3; // illegal SCB vector
pub const STOP_INIE: u32 = 4; // exception while handling an exception
pub const STOP_PPTE: u32 = 5; // process PTE in process space
pub const STOP_CHMFI: u32 = 6; // change mode from interrupt stack
pub const STOP_UIPL: u32 = 7; // undefined IPL

pub fn stop_reason(code: u32) -> &'static str {
    match code {
        STOP_HALT => "HALT instruction",
        STOP_SWITCH => "halt switch",
        STOP_ILLVEC => "illegal vector",
        STOP_INIE => "exception within exception",
        STOP_PPTE => "process PTE in process space",
        STOP_CHMFI => "change mode from interrupt stack",
        STOP_UIPL => "undefined IPL",
        _ => "unknown reason",
    }
}

/// Hardware events threaded out of instruction execution. Faults restart
/// or abort the instruction through the SCB; `Halt` stops the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaxFault {
    ReservedInstruction,
    PrivilegedInstruction,
    ReservedOperand,
    ReservedAddrMode,
    AccessViolation { param: u32, va: u32 },
    TranslationNotValid { param: u32, va: u32 },
    KernelStackNotValid,
    MachineCheck { code: u32, addr: u32 },
    Breakpoint,
    Halt(u32),
}

pub struct DeviceSlot {
    pub dev: Device,
    pub ipl_slots: Vec<usize>,
}

/// Everything outside the processor: memory with the ROM overlay, the
/// Qbus adapter and its devices, the console registers, the interval
/// clock, and the simulation event queue.
pub struct VaxBus {
    pub mem: PhysMemory,
    pub qbus: Qbus,
    pub cty: Cty,
    pub clock: Clock<IoEvent>,
    pub devices: Vec<DeviceSlot>,
    /// Interval clock: IE bit plus the pending-interrupt line.
    pub iccs: u32,
    pub todr: u32,
    pub clk_irq: bool,
}

impl VaxBus {
    pub fn new(memory_mb: usize, cty: Cty) -> Self {
        Self {
            mem: PhysMemory::new(memory_mb),
            qbus: Qbus::new(),
            cty,
            clock: Clock::new(),
            devices: Vec::new(),
            iccs: 0,
            todr: 0,
            clk_irq: false,
        }
    }

    pub fn attach(&mut self, dev: Device) -> usize {
        let desc = dev.descriptor();
        let slot = self.devices.len();
        let assignment = self.qbus.set_map(slot, &desc);
        self.devices.push(DeviceSlot {
            dev,
            ipl_slots: assignment.ipl_slots,
        });
        slot
    }

    /// Physical read: local memory and ROM below the IO base, the Qbus
    /// adapter above it. A miss is a machine check for the processor.
    pub fn read_phys(&mut self, pa: u32, size: u32) -> Result<u32, NoMemory> {
        if pa < IO_BASE || crate::vax::memory::PhysMemory::rom_covers(pa) {
            return self.mem.read(pa, size);
        }
        match self.qbus.resolve(pa) {
            QbusTarget::Device(slot, offset) => {
                let reg = offset & !1;
                let data = self
                    .device_call(slot, |dev, ctx| dev.read(reg, ctx))
                    .map_err(|_| NoMemory(pa))?;
                Ok(match size {
                    1 => ((data >> ((offset & 1) * 8)) & 0xFF) as u32,
                    _ => data as u32,
                })
            }
            QbusTarget::MapRegister(n) => Ok(self.qbus.map[n as usize]),
            QbusTarget::LocalRegister(off) => Ok(self.qbus.read_local(off)),
            QbusTarget::Ipcr => Ok(self.qbus.ipcr as u32),
            QbusTarget::Timeout => Err(NoMemory(pa)),
        }
    }

    pub fn write_phys(&mut self, pa: u32, size: u32, value: u32) -> Result<(), NoMemory> {
        if pa < IO_BASE || crate::vax::memory::PhysMemory::rom_covers(pa) {
            return self.mem.write(pa, size, value);
        }
        match self.qbus.resolve(pa) {
            QbusTarget::Device(slot, offset) => {
                let byte = size == 1;
                let reg = if byte { offset } else { offset & !1 };
                self.device_call(slot, |dev, ctx| dev.write(reg, value as u16, byte, ctx))
                    .map_err(|_| NoMemory(pa))
            }
            QbusTarget::MapRegister(n) => {
                self.qbus.map[n as usize] = value;
                Ok(())
            }
            QbusTarget::LocalRegister(off) => {
                self.qbus.write_local(off, value);
                Ok(())
            }
            QbusTarget::Ipcr => {
                self.qbus.ipcr = value as u16;
                Ok(())
            }
            QbusTarget::Timeout => Err(NoMemory(pa)),
        }
    }

    fn device_call<R>(&mut self, slot: usize, f: impl FnOnce(&mut Device, &mut IoCtx) -> R) -> R {
        let mut irqs = Vec::new();
        let result = {
            let mut dma = QbusDma {
                qbus: &mut self.qbus,
                mem: &mut self.mem,
            };
            let mut ctx = IoCtx {
                slot,
                clock: &mut self.clock,
                irqs: &mut irqs,
                dma: &mut dma,
            };
            f(&mut self.devices[slot].dev, &mut ctx)
        };
        self.apply_irqs(slot, irqs);
        result
    }

    fn apply_irqs(&mut self, slot: usize, irqs: Vec<IrqOp>) {
        for op in irqs {
            match op {
                IrqOp::Raise(vector) => {
                    let ipl_slot = self.devices[slot].ipl_slots[vector];
                    self.qbus.send_interrupt(ipl_slot);
                }
                IrqOp::Cancel(vector) => {
                    let ipl_slot = self.devices[slot].ipl_slots[vector];
                    self.qbus.cancel_interrupt(ipl_slot);
                }
            }
        }
    }

    /// Drain due timers.
    pub fn process_events(&mut self) {
        for event in self.clock.next_events() {
            match event.event_type {
                IoEvent::ConsoleRxQueue => {
                    let VaxBus { cty, clock, .. } = self;
                    cty.rx_queue_tick(clock);
                }
                IoEvent::ConsoleTxDone => self.cty.tx_done(),
                IoEvent::ConsoleRxDone | IoEvent::Interval => {}
                IoEvent::Device { slot, timer } => {
                    self.device_call(slot, |dev, ctx| dev.event(timer, ctx));
                }
            }
        }
    }

    /// Instruction-boundary poll of host-side queues.
    pub fn poll_io(&mut self) {
        let VaxBus { cty, clock, .. } = self;
        cty.poll(clock);
        for slot in 0..self.devices.len() {
            self.device_call(slot, |dev, ctx| dev.poll(ctx));
        }
    }

    /// 10 ms host tick: time of day plus the interval interrupt.
    pub fn host_tick(&mut self) {
        self.todr = self.todr.wrapping_add(1);
        if self.iccs & 0x40 != 0 {
            self.clk_irq = true;
        }
    }

    pub fn reset_io(&mut self) {
        self.qbus.reset();
        for slot in 0..self.devices.len() {
            self.device_call(slot, |dev, ctx| dev.reset(ctx));
        }
        debug!("QBUS: bus init");
    }
}
