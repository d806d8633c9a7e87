use crate::core::console::{Console, ConsoleEvent};
use crate::devices::{merge_byte, DevTimer, IoCtx, IoDescriptor, Nxd};
use std::collections::VecDeque;
use tracing::debug;

pub const DL_CSR_ADDR: u32 = 0o777560;
const DL_NREGS: usize = 4;
const DL_RXVEC: u16 = 0o60;
const DL_TXVEC: u16 = 0o64;
const DL_IPL: u8 = 4;

const RX: usize = 0;
const TX: usize = 1;

// RCSR.
const RCSR_DONE: u16 = 0o200;
const RCSR_IE: u16 = 0o100;
const RCSR_WMASK: u16 = 0o100;

// RBUF.
const RBUF_ERR: u16 = 0o100000;
const RBUF_OVR: u16 = 0o040000;

// XCSR.
const XCSR_RDY: u16 = 0o200;
const XCSR_IE: u16 = 0o100;
const XCSR_MAINT: u16 = 0o4;
const XCSR_WMASK: u16 = 0o104;

const QUEUE_DELAY: u64 = 100;
const TX_DELAY: u64 = 100;

/// DL11 single-line asynchronous interface: the classic four-register
/// console SLU, fed by one TCP session.
pub struct Dl11 {
    pub console: Option<Console>,
    rcsr: u16,
    rbuf: u16,
    xcsr: u16,
    in_queue: VecDeque<u8>,
}

impl Dl11 {
    pub fn new(console: Option<Console>) -> Self {
        Self {
            console,
            rcsr: 0,
            rbuf: 0,
            xcsr: XCSR_RDY,
            in_queue: VecDeque::new(),
        }
    }

    pub fn descriptor(&self) -> IoDescriptor {
        IoDescriptor {
            name: "DL11",
            csr_addr: DL_CSR_ADDR,
            nregs: DL_NREGS,
            br_level: DL_IPL,
            vectors: vec![DL_RXVEC, DL_TXVEC],
        }
    }

    pub fn reset(&mut self, ctx: &mut IoCtx) {
        self.rcsr = 0;
        self.rbuf = 0;
        self.xcsr = XCSR_RDY;
        self.in_queue.clear();
        ctx.cancel(DevTimer::RxQueue);
        ctx.cancel(DevTimer::TxDone(0));
    }

    fn deliver(&mut self, ctx: &mut IoCtx) {
        if self.rcsr & RCSR_DONE != 0 {
            if !self.in_queue.is_empty() {
                self.rbuf |= RBUF_ERR | RBUF_OVR;
                ctx.schedule(DevTimer::RxQueue, QUEUE_DELAY);
            }
            return;
        }
        let Some(ch) = self.in_queue.pop_front() else {
            return;
        };
        self.rbuf = ch as u16;
        self.rcsr |= RCSR_DONE;
        if self.rcsr & RCSR_IE != 0 {
            ctx.raise(RX);
        }
        if !self.in_queue.is_empty() {
            ctx.schedule(DevTimer::RxQueue, QUEUE_DELAY);
        }
    }

    pub fn read(&mut self, reg: u32, ctx: &mut IoCtx) -> Result<u16, Nxd> {
        match reg {
            0 => Ok(self.rcsr),
            2 => {
                let value = self.rbuf;
                self.rcsr &= !RCSR_DONE;
                self.rbuf &= !(RBUF_ERR | RBUF_OVR);
                if !self.in_queue.is_empty() {
                    ctx.schedule(DevTimer::RxQueue, QUEUE_DELAY);
                }
                Ok(value)
            }
            4 => Ok(self.xcsr),
            6 => Ok(0),
            _ => Err(Nxd),
        }
    }

    pub fn write(&mut self, reg: u32, data: u16, byte: bool, ctx: &mut IoCtx) -> Result<(), Nxd> {
        match reg & !1 {
            0 => {
                let data = if byte { merge_byte(self.rcsr, data, reg) } else { data };
                if data & RCSR_IE == 0 {
                    ctx.cancel_irq(RX);
                } else if self.rcsr & (RCSR_DONE | RCSR_IE) == RCSR_DONE {
                    ctx.raise(RX);
                }
                self.rcsr = (self.rcsr & !RCSR_WMASK) | (data & RCSR_WMASK);
            }
            2 => {}
            4 => {
                let data = if byte { merge_byte(self.xcsr, data, reg) } else { data };
                if data & XCSR_IE == 0 {
                    ctx.cancel_irq(TX);
                } else if self.xcsr & (XCSR_RDY | XCSR_IE) == XCSR_RDY {
                    ctx.raise(TX);
                }
                self.xcsr = (self.xcsr & !XCSR_WMASK) | (data & XCSR_WMASK);
            }
            6 => {
                let ch = (data & 0xFF) as u8;
                if self.xcsr & XCSR_MAINT != 0 {
                    self.in_queue.push_back(ch);
                    self.deliver(ctx);
                    return Ok(());
                }
                self.xcsr &= !XCSR_RDY;
                if let Some(console) = &self.console {
                    console.send(ch);
                }
                ctx.schedule(DevTimer::TxDone(0), TX_DELAY);
            }
            _ => return Err(Nxd),
        }
        Ok(())
    }

    pub fn event(&mut self, timer: DevTimer, ctx: &mut IoCtx) {
        match timer {
            DevTimer::RxQueue => self.deliver(ctx),
            DevTimer::TxDone(_) => {
                self.xcsr |= XCSR_RDY;
                if self.xcsr & XCSR_IE != 0 {
                    ctx.raise(TX);
                }
            }
            _ => {}
        }
    }

    pub fn poll(&mut self, ctx: &mut IoCtx) {
        while let Some(event) = self.console.as_ref().and_then(|c| c.poll()) {
            match event {
                ConsoleEvent::Char(ch) => {
                    self.in_queue.push_back(ch);
                    self.deliver(ctx);
                }
                ConsoleEvent::Connected => {
                    debug!("DL11: line connected");
                    self.xcsr |= XCSR_RDY;
                    if self.xcsr & XCSR_IE != 0 {
                        ctx.raise(TX);
                    }
                }
                ConsoleEvent::Disconnected => {
                    self.xcsr &= !XCSR_RDY;
                }
                ConsoleEvent::HaltSwitch => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::Clock;
    use crate::devices::{IrqOp, NoDma};

    fn with_ctx<R>(f: impl FnOnce(&mut Dl11, &mut IoCtx) -> R) -> (R, Vec<IrqOp>) {
        let mut dl = Dl11::new(None);
        let mut clock = Clock::new();
        let mut irqs = Vec::new();
        let mut dma = NoDma;
        let mut ctx = IoCtx {
            slot: 0,
            clock: &mut clock,
            irqs: &mut irqs,
            dma: &mut dma,
        };
        let r = f(&mut dl, &mut ctx);
        (r, irqs)
    }

    #[test]
    fn receive_and_read_clears_done() {
        let ((), irqs) = with_ctx(|dl, ctx| {
            dl.write(0, RCSR_IE, false, ctx).unwrap();
            dl.in_queue.push_back(b'Z');
            dl.deliver(ctx);
            assert_ne!(dl.rcsr & RCSR_DONE, 0);
            assert_eq!(dl.read(2, ctx).unwrap() & 0xFF, b'Z' as u16);
            assert_eq!(dl.rcsr & RCSR_DONE, 0);
        });
        assert!(irqs.contains(&IrqOp::Raise(RX)));
    }

    #[test]
    fn transmit_schedules_done() {
        let ((), irqs) = with_ctx(|dl, ctx| {
            dl.write(6, b'H' as u16, false, ctx).unwrap();
            assert_eq!(dl.xcsr & XCSR_RDY, 0);
            dl.event(DevTimer::TxDone(0), ctx);
            assert_ne!(dl.xcsr & XCSR_RDY, 0);
        });
        // IE was off: the done event raised nothing.
        assert!(irqs.is_empty());
    }

    #[test]
    fn maintenance_loops_back() {
        let ((), _) = with_ctx(|dl, ctx| {
            dl.write(4, XCSR_MAINT, false, ctx).unwrap();
            dl.write(6, 0x55, false, ctx).unwrap();
            assert_eq!(dl.read(2, ctx).unwrap() & 0xFF, 0x55);
        });
    }

    #[test]
    fn byte_write_merges_high_half() {
        let ((), _) = with_ctx(|dl, ctx| {
            // Odd-byte write to RCSR leaves the IE bit (bit 6) alone.
            dl.write(0, RCSR_IE, false, ctx).unwrap();
            dl.write(1, 0xFF, true, ctx).unwrap();
            assert_ne!(dl.rcsr & RCSR_IE, 0);
        });
    }
}
