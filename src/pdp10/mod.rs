pub mod apr;
pub mod cpu;
pub mod fe;
pub mod memory;
pub mod pager;
pub mod pi;
pub mod tim;
pub mod uba;
pub mod word;

use crate::core::clock::Clock;
use crate::devices::{Device, IoCtx, IoEvent, IrqOp, NoDma};
use crate::pdp10::apr::{Apr, APRF_INT_DONE, APRF_NO_MEMORY};
use crate::pdp10::fe::FrontEnd;
use crate::pdp10::memory::{NoMemory, PhysMemory};
use crate::pdp10::pager::{Pager, Refill};
use crate::pdp10::pi::Pi;
use crate::pdp10::tim::TimeBase;
use crate::pdp10::uba::{Uba, UbaDma, IoTarget, SR_NED};
use crate::pdp10::word::Word;
use tracing::debug;

// Halt status codes left for the operator when the processor stops.
pub const HALT_ILL_INT: u32 = 0o101; // illegal interrupt instruction
pub const HALT_SWITCH: u32 = 0o2; // console halt switch
pub const HALT_INSTRUCTION: u32 = 0o1; // HALT instruction

/// Hardware aborts threaded up through instruction execution. A page fail
/// leaves the PFW in the pager; a halt stops the machine with a code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum P10Fault {
    PageFail,
    Halt(u32),
}

pub struct DeviceSlot {
    pub dev: Device,
    pub uba: usize,
    pub ipl_slots: Vec<usize>,
}

/// Everything on the KS10 backplane except the processor itself.
pub struct Ks10 {
    pub mem: PhysMemory,
    pub pager: Pager,
    pub apr: Apr,
    pub pi: Pi,
    pub uba: Uba,
    pub fe: FrontEnd,
    pub tim: TimeBase,
    pub clock: Clock<IoEvent>,
    pub devices: Vec<DeviceSlot>,
}

impl Ks10 {
    pub fn new(memory_kw: usize, fe: FrontEnd) -> Self {
        Self {
            mem: PhysMemory::new(memory_kw),
            pager: Pager::new(),
            apr: Apr::new(),
            pi: Pi::new(),
            uba: Uba::new(),
            fe,
            tim: TimeBase::new(),
            clock: Clock::new(),
            devices: Vec::new(),
        }
    }

    /// Attach a device to a Unibus adapter.
    pub fn attach(&mut self, uba: usize, dev: Device) -> usize {
        let desc = dev.descriptor();
        let slot = self.devices.len();
        let assignment = self.uba.set_map(uba, slot, &desc);
        self.devices.push(DeviceSlot {
            dev,
            uba,
            ipl_slots: assignment.ipl_slots,
        });
        slot
    }

    /// Latch an APR condition and re-evaluate the PI system.
    pub fn apr_raise(&mut self, flag: Word) {
        self.apr.interrupt(flag);
        self.pi.evaluate(self.apr.irq_active(), self.apr.level);
    }

    /// Physical read as the processor sees it: NXM latches the APR flag
    /// and, with paging on, turns into a page-fail trap.
    pub fn read_phys(&mut self, addr: u32) -> Result<Word, P10Fault> {
        match self.mem.read(addr) {
            Ok(w) => Ok(w),
            Err(NoMemory(a)) => self.no_memory(a),
        }
    }

    pub fn write_phys(&mut self, addr: u32, value: Word) -> Result<(), P10Fault> {
        match self.mem.write(addr, value) {
            Ok(()) => Ok(()),
            Err(NoMemory(a)) => self.no_memory(a).map(|_| ()),
        }
    }

    fn no_memory(&mut self, addr: u32) -> Result<Word, P10Fault> {
        self.apr_raise(APRF_NO_MEMORY);
        if self.pager.enabled {
            self.pager.nxm_fail(addr);
            Err(P10Fault::PageFail)
        } else {
            Ok(0)
        }
    }

    /// Translate one virtual word address under the given reference mode.
    pub fn translate(&mut self, vaddr: Word, mode: u32) -> Result<u32, P10Fault> {
        match self.pager.translate(&mut self.mem, vaddr, mode) {
            Ok(pa) => Ok(pa),
            Err(Refill::PageFail) => Err(P10Fault::PageFail),
            Err(Refill::Nxm(_)) => {
                self.apr_raise(APRF_NO_MEMORY);
                Err(P10Fault::PageFail)
            }
        }
    }

    /// IO-space read (TIOE/RDIO and friends). A miss sets the adapter's
    /// non-existent-device bit and delivers the IO page-fail trap.
    pub fn io_read(&mut self, io_addr: Word, byte: bool, user: bool) -> Result<Word, P10Fault> {
        let (unit, target) = self.uba.resolve(io_addr);
        match target {
            IoTarget::Internal => Ok(self.uba.read_internal(unit, io_addr)),
            IoTarget::Device(slot, offset) => {
                let reg = offset & !1;
                match self.device_call(slot, |dev, ctx| dev.read(reg, ctx)) {
                    Ok(data) => {
                        let data = if byte {
                            if offset & 1 != 0 { (data >> 8) as Word } else { (data & 0xFF) as Word }
                        } else {
                            data as Word
                        };
                        Ok(data)
                    }
                    Err(_) => self.io_timeout(unit, io_addr, byte, user),
                }
            }
            IoTarget::Timeout => self.io_timeout(unit, io_addr, byte, user),
        }
    }

    pub fn io_write(
        &mut self,
        io_addr: Word,
        data: Word,
        byte: bool,
        user: bool,
    ) -> Result<(), P10Fault> {
        let (unit, target) = self.uba.resolve(io_addr);
        match target {
            IoTarget::Internal => {
                if self.uba.write_internal(unit, io_addr, data) {
                    self.reset_adapter_devices(unit);
                }
                Ok(())
            }
            IoTarget::Device(slot, offset) => {
                let reg = if byte { offset } else { offset & !1 };
                let result = self.device_call(slot, |dev, ctx| {
                    dev.write(reg, data as u16, byte, ctx)
                });
                match result {
                    Ok(()) => Ok(()),
                    Err(_) => self.io_timeout(unit, io_addr, byte, user).map(|_| ()),
                }
            }
            IoTarget::Timeout => self.io_timeout(unit, io_addr, byte, user).map(|_| ()),
        }
    }

    fn io_timeout(&mut self, unit: usize, io_addr: Word, byte: bool, user: bool) -> Result<Word, P10Fault> {
        self.uba.slots[unit].sr |= SR_NED;
        self.pager.io_fail(io_addr, user, byte);
        debug!("UBA{unit}: bus timeout at {:08o}", io_addr);
        Err(P10Fault::PageFail)
    }

    /// Run one closure against a device with a full IO context, then apply
    /// the interrupt operations it recorded.
    fn device_call<R>(
        &mut self,
        slot: usize,
        f: impl FnOnce(&mut Device, &mut IoCtx) -> R,
    ) -> R {
        let mut irqs = Vec::new();
        let unit = self.devices[slot].uba;
        let result = {
            let mut dma = UbaDma {
                slot: &mut self.uba.slots[unit],
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
                    let unit = self.devices[slot].uba;
                    let ipl_slot = self.devices[slot].ipl_slots[vector];
                    if let Some(channel) = self.uba.send_interrupt(unit, ipl_slot) {
                        self.pi
                            .request_io(channel, self.apr.irq_active(), self.apr.level);
                    }
                }
                IrqOp::Cancel(vector) => {
                    let unit = self.devices[slot].uba;
                    let ipl_slot = self.devices[slot].ipl_slots[vector];
                    self.uba.cancel_interrupt(unit, ipl_slot);
                    let high = self.uba.slots[unit].pi_high();
                    let low = self.uba.slots[unit].pi_low();
                    for channel in [high, low] {
                        if channel != 0 && !self.uba.channel_pending(channel) {
                            self.pi
                                .clear_io(channel, self.apr.irq_active(), self.apr.level);
                        }
                    }
                }
            }
        }
    }

    fn reset_adapter_devices(&mut self, unit: usize) {
        for slot in 0..self.devices.len() {
            if self.devices[slot].uba == unit {
                self.device_call(slot, |dev, ctx| dev.reset(ctx));
            }
        }
    }

    /// Drain every timer that has come due.
    pub fn process_events(&mut self) {
        for event in self.clock.next_events() {
            match event.event_type {
                IoEvent::ConsoleRxQueue => {
                    let wake = {
                        let Ks10 { mem, apr, fe, clock, .. } = self;
                        fe.rx_queue_tick(mem, apr, clock)
                    };
                    if wake {
                        self.pi.evaluate(self.apr.irq_active(), self.apr.level);
                    }
                }
                IoEvent::ConsoleTxDone => {
                    let wake = {
                        let Ks10 { mem, apr, fe, clock, .. } = self;
                        fe.tx_done(mem, apr, clock)
                    };
                    if wake {
                        self.pi.evaluate(self.apr.irq_active(), self.apr.level);
                    }
                }
                IoEvent::ConsoleRxDone | IoEvent::Interval => {}
                IoEvent::Device { slot, timer } => {
                    self.device_call(slot, |dev, ctx| dev.event(timer, ctx));
                }
            }
        }
    }

    /// Instruction-boundary poll: console socket and device host queues.
    pub fn poll_io(&mut self) {
        let wake = {
            let Ks10 { mem, apr, fe, clock, .. } = self;
            fe.poll(mem, apr, clock)
        };
        if wake {
            self.pi.evaluate(self.apr.irq_active(), self.apr.level);
        }
        for slot in 0..self.devices.len() {
            self.device_call(slot, |dev, ctx| dev.poll(ctx));
        }
    }

    /// 10 ms host tick: advance the time base, fire the interval timer.
    pub fn host_tick(&mut self) {
        if self.tim.tick() {
            self.apr_raise(APRF_INT_DONE);
        }
    }

    /// Reset every device without touching memory (Unibus init).
    pub fn reset_io(&mut self) {
        self.uba.reset();
        for slot in 0..self.devices.len() {
            self.device_call(slot, |dev, ctx| dev.reset(ctx));
        }
    }

    /// A device-free context for tests and boot-time device setup.
    pub fn with_no_dma<R>(&mut self, slot: usize, f: impl FnOnce(&mut Device, &mut IoCtx) -> R) -> R {
        let mut irqs = Vec::new();
        let result = {
            let mut dma = NoDma;
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
}
