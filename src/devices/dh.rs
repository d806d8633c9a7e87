use crate::core::console::{Console, ConsoleEvent};
use crate::devices::{merge_byte, DevTimer, DmaBus, IoCtx, IoDescriptor, Nxd};
use std::collections::VecDeque;
use tracing::{debug, trace};

pub const DH_CSR_ADDR: u32 = 0o760440;
const DH_NREGS: usize = 8;
const DH_RXVEC: u16 = 0o310;
const DH_TXVEC: u16 = 0o314;
const DH_IPL: u8 = 4;
pub const DH_LINES: usize = 16;

const RX: usize = 0;
const TX: usize = 1;

// CSR bits. The low nibble is the indirect line-register selector.
const CSR_TXACT: u16 = 0o100000;
const CSR_TXIE: u16 = 0o040000;
const CSR_TXERR: u16 = 0o010000;
const CSR_TXLINE: u16 = 0o007400;
const CSR_RXAVAIL: u16 = 0o000200;
const CSR_RXIE: u16 = 0o000100;
const CSR_RESET: u16 = 0o000040;
const CSR_LINE: u16 = 0o000017;
const CSR_RW: u16 = CSR_TXIE | CSR_RXIE | CSR_RESET | CSR_LINE;

// RBUF bits.
const RBUF_VALID: u16 = 0o100000;
const RBUF_OVRRUN: u16 = 0o040000;

// TXCHAR (programmed single-character transmit).
const TXCH_VALID: u16 = 0o100000;

// STAT: report a wired-up modem and the DHU personality bit.
const STAT_DHU: u16 = 0o114400;

// LNCTRL bits.
const LNC_MAINT: u16 = 0o000300;
const LNC_RXEN: u16 = 0o000004;
const LNC_ABORT: u16 = 0o000001;

// TBUFFAD2 bits.
const TBAD2_TXEN: u16 = 0o100000;
const TBAD2_START: u16 = 0o000200;
const TBAD2_ADDR: u16 = 0o000077;

const SILO_SIZE: usize = 256;
const XFER_DELAY: u64 = 300;
const QUEUE_DELAY: u64 = 100;

#[derive(Default, Clone)]
struct Line {
    lpr: u16,
    lnctrl: u16,
    tbad1: u16,
    tbad2: u16,
    tbcnt: u16,
    txchar: u16,
}

/// DHU11 sixteen-line terminal server: an indirect register file selected
/// through the CSR line field, a shared receive FIFO, and DMA transmit
/// through the bus adapter's map.
pub struct Dhu11 {
    pub lines: Vec<Option<Console>>,
    csr: u16,
    silo: VecDeque<u16>,
    regs: Vec<Line>,
    tx_done_line: Option<usize>,
}

impl Dhu11 {
    pub fn new(lines: Vec<Option<Console>>) -> Self {
        Self {
            lines,
            csr: 0,
            silo: VecDeque::new(),
            regs: vec![Line::default(); DH_LINES],
            tx_done_line: None,
        }
    }

    pub fn descriptor(&self) -> IoDescriptor {
        IoDescriptor {
            name: "DHU11",
            csr_addr: DH_CSR_ADDR,
            nregs: DH_NREGS,
            br_level: DH_IPL,
            vectors: vec![DH_RXVEC, DH_TXVEC],
        }
    }

    pub fn reset(&mut self, ctx: &mut IoCtx) {
        self.csr = 0;
        self.silo.clear();
        self.regs = vec![Line::default(); DH_LINES];
        self.tx_done_line = None;
        for line in 0..DH_LINES {
            ctx.cancel(DevTimer::Transfer(line));
        }
        ctx.cancel(DevTimer::RxQueue);
    }

    fn line(&self) -> usize {
        (self.csr & CSR_LINE) as usize
    }

    fn silo_push(&mut self, line: usize, ch: u8, ctx: &mut IoCtx) {
        if self.regs[line].lnctrl & LNC_RXEN == 0 {
            return;
        }
        if self.silo.len() >= SILO_SIZE {
            if let Some(last) = self.silo.back_mut() {
                *last |= RBUF_OVRRUN;
            }
            return;
        }
        self.silo
            .push_back(RBUF_VALID | ((line as u16) << 8) | ch as u16);
        let had = self.csr & CSR_RXAVAIL != 0;
        self.csr |= CSR_RXAVAIL;
        if !had && self.csr & CSR_RXIE != 0 {
            ctx.raise(RX);
        }
    }

    fn send_char(&mut self, line: usize, ch: u8, ctx: &mut IoCtx) {
        if self.regs[line].lnctrl & LNC_MAINT != 0 {
            self.silo_push(line, ch, ctx);
        } else if let Some(Some(console)) = self.lines.get(line) {
            console.send(ch);
        }
    }

    /// Transmitter-done: record the line for the CSR and interrupt.
    fn tx_complete(&mut self, line: usize, ctx: &mut IoCtx) {
        self.csr = (self.csr & !(CSR_TXACT | CSR_TXLINE)) | ((line as u16) << 8);
        self.tx_done_line = Some(line);
        if self.csr & CSR_TXIE != 0 {
            ctx.raise(TX);
        }
    }

    pub fn read(&mut self, reg: u32, ctx: &mut IoCtx) -> Result<u16, Nxd> {
        let line = self.line();
        Ok(match reg >> 1 {
            0 => self.csr,
            1 => {
                let value = self.silo.pop_front().unwrap_or(0);
                if self.silo.is_empty() {
                    self.csr &= !CSR_RXAVAIL;
                } else {
                    ctx.schedule(DevTimer::RxQueue, QUEUE_DELAY);
                }
                value
            }
            2 => self.regs[line].lpr,
            3 => STAT_DHU,
            4 => self.regs[line].lnctrl,
            5 => self.regs[line].tbad1,
            6 => self.regs[line].tbad2,
            7 => self.regs[line].tbcnt,
            _ => return Err(Nxd),
        })
    }

    pub fn write(&mut self, reg: u32, data: u16, byte: bool, ctx: &mut IoCtx) -> Result<(), Nxd> {
        let line = self.line();
        match reg >> 1 {
            0 => {
                let data = if byte { merge_byte(self.csr, data, reg) } else { data };
                if data & CSR_RESET != 0 {
                    self.reset(ctx);
                    return Ok(());
                }
                self.csr = (self.csr & !CSR_RW) | (data & CSR_RW);
            }
            1 => {
                // TXCHAR: programmed single-character transmit.
                let tx = &mut self.regs[line];
                tx.txchar = data;
                if data & TXCH_VALID != 0 {
                    let ch = (data & 0xFF) as u8;
                    self.send_char(line, ch, ctx);
                    self.regs[line].txchar = 0;
                    ctx.schedule(DevTimer::TxDone(line), XFER_DELAY);
                }
            }
            2 => self.regs[line].lpr = data & 0o177776,
            3 => {}
            4 => {
                let old = self.regs[line].lnctrl;
                self.regs[line].lnctrl = data & 0o011777;
                if data & LNC_ABORT != 0 && old & LNC_ABORT == 0 {
                    ctx.cancel(DevTimer::Transfer(line));
                    self.tx_complete(line, ctx);
                }
            }
            5 => self.regs[line].tbad1 = data,
            6 => {
                self.regs[line].tbad2 = data & (TBAD2_TXEN | TBAD2_START | TBAD2_ADDR);
                // Start strobe with the transmitter enabled kicks the DMA.
                if data & TBAD2_START != 0 && data & TBAD2_TXEN != 0 {
                    self.csr |= CSR_TXACT;
                    ctx.schedule(DevTimer::Transfer(line), XFER_DELAY);
                }
            }
            7 => self.regs[line].tbcnt = data,
            _ => return Err(Nxd),
        }
        Ok(())
    }

    pub fn event(&mut self, timer: DevTimer, ctx: &mut IoCtx) {
        match timer {
            DevTimer::RxQueue => {
                if !self.silo.is_empty() {
                    let had = self.csr & CSR_RXAVAIL != 0;
                    self.csr |= CSR_RXAVAIL;
                    if !had && self.csr & CSR_RXIE != 0 {
                        ctx.raise(RX);
                    }
                }
            }
            DevTimer::TxDone(line) => self.tx_complete(line, ctx),
            DevTimer::Transfer(line) => {
                // Transmit DMA: fetch the buffer through the adapter map
                // and put it on the wire.
                let tx = &self.regs[line];
                let bus_addr =
                    ((tx.tbad2 as u32 & TBAD2_ADDR as u32) << 16) | tx.tbad1 as u32;
                let count = tx.tbcnt as usize;
                let mut words = vec![0u16; (count + 1) / 2];
                let short = ctx.dma.read_block(bus_addr & !1, &mut words);
                if short != 0 {
                    debug!("DHU11: line {line} transmit DMA timed out");
                    self.csr |= CSR_TXERR;
                    self.regs[line].tbcnt = short as u16;
                    self.tx_complete(line, ctx);
                    return;
                }
                let odd_start = bus_addr & 1 != 0;
                let mut sent = 0;
                for (k, w) in words.iter().enumerate() {
                    if !(k == 0 && odd_start) && sent < count {
                        self.send_char(line, *w as u8, ctx);
                        sent += 1;
                    }
                    if sent < count {
                        self.send_char(line, (*w >> 8) as u8, ctx);
                        sent += 1;
                    }
                }
                trace!("DHU11: line {line} sent {sent} bytes by DMA");
                self.regs[line].tbcnt = 0;
                self.regs[line].tbad2 &= !TBAD2_START;
                self.tx_complete(line, ctx);
            }
            _ => {}
        }
    }

    pub fn poll(&mut self, ctx: &mut IoCtx) {
        for line in 0..self.lines.len().min(DH_LINES) {
            while let Some(event) = self.lines[line].as_ref().and_then(|c| c.poll()) {
                match event {
                    ConsoleEvent::Char(ch) => self.silo_push(line, ch, ctx),
                    ConsoleEvent::Connected => debug!("DHU11: line {line} connected"),
                    ConsoleEvent::Disconnected => debug!("DHU11: line {line} disconnected"),
                    ConsoleEvent::HaltSwitch => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::Clock;
    use crate::devices::{IoEvent, IrqOp};
    use crate::vax::memory::PhysMemory;
    use crate::vax::qbus::{Qbus, QbusDma, QMAP_VALID};

    fn with_ctx<R>(
        dh: &mut Dhu11,
        qbus: &mut Qbus,
        mem: &mut PhysMemory,
        clock: &mut Clock<IoEvent>,
        f: impl FnOnce(&mut Dhu11, &mut IoCtx) -> R,
    ) -> (R, Vec<IrqOp>) {
        let mut irqs = Vec::new();
        let mut dma = QbusDma { qbus, mem };
        let mut ctx = IoCtx {
            slot: 0,
            clock,
            irqs: &mut irqs,
            dma: &mut dma,
        };
        let r = f(dh, &mut ctx);
        (r, irqs)
    }

    #[test]
    fn indirect_line_registers() {
        let mut dh = Dhu11::new(vec![]);
        let mut qbus = Qbus::new();
        let mut mem = PhysMemory::new(1);
        let mut clock = Clock::new();
        let ((), _) = with_ctx(&mut dh, &mut qbus, &mut mem, &mut clock, |dh, ctx| {
            dh.write(0, 3, false, ctx).unwrap(); // select line 3
            dh.write(4, 0o100, false, ctx).unwrap(); // LPR
            dh.write(0, 5, false, ctx).unwrap(); // select line 5
            assert_eq!(dh.read(4, ctx).unwrap(), 0);
            dh.write(0, 3, false, ctx).unwrap();
            assert_eq!(dh.read(4, ctx).unwrap(), 0o100);
        });
    }

    #[test]
    fn receive_tags_line_number() {
        let mut dh = Dhu11::new(vec![]);
        let mut qbus = Qbus::new();
        let mut mem = PhysMemory::new(1);
        let mut clock = Clock::new();
        let ((), irqs) = with_ctx(&mut dh, &mut qbus, &mut mem, &mut clock, |dh, ctx| {
            dh.write(0, CSR_RXIE | 7, false, ctx).unwrap(); // select line 7
            dh.write(8, LNC_RXEN, false, ctx).unwrap(); // LNCTRL: receiver on
            dh.silo_push(7, b'M', ctx);
            let rbuf = dh.read(2, ctx).unwrap();
            assert_ne!(rbuf & RBUF_VALID, 0);
            assert_eq!((rbuf >> 8) & 0o17, 7);
            assert_eq!(rbuf & 0xFF, b'M' as u16);
        });
        assert!(irqs.contains(&IrqOp::Raise(RX)));
    }

    #[test]
    fn dma_transmit_pulls_buffer() {
        let mut dh = Dhu11::new((0..DH_LINES).map(|_| None).collect());
        let mut qbus = Qbus::new();
        let mut mem = PhysMemory::new(1);
        let mut clock = Clock::new();
        qbus.map[0] = QMAP_VALID | 0x10;
        mem.poke(0x10 << 9, 2, 0x4241); // "AB"

        let ((), irqs) = with_ctx(&mut dh, &mut qbus, &mut mem, &mut clock, |dh, ctx| {
            dh.write(0, CSR_TXIE, false, ctx).unwrap(); // line 0
            // Loop the line back so the bytes land in the silo.
            dh.write(8, LNC_MAINT | LNC_RXEN, false, ctx).unwrap();
            dh.write(10, 0, false, ctx).unwrap(); // TBUFFAD1
            dh.write(14, 2, false, ctx).unwrap(); // TBUFFCT = 2
            dh.write(12, TBAD2_TXEN | TBAD2_START, false, ctx).unwrap();
            dh.event(DevTimer::Transfer(0), ctx);
            assert_eq!(dh.read(2, ctx).unwrap() & 0xFF, b'A' as u16);
            assert_eq!(dh.read(2, ctx).unwrap() & 0xFF, b'B' as u16);
            assert_eq!(dh.regs[0].tbcnt, 0);
        });
        assert!(irqs.contains(&IrqOp::Raise(TX)));
    }

    #[test]
    fn dma_timeout_sets_error() {
        let mut dh = Dhu11::new((0..DH_LINES).map(|_| None).collect());
        let mut qbus = Qbus::new();
        let mut mem = PhysMemory::new(1);
        let mut clock = Clock::new();
        let ((), _) = with_ctx(&mut dh, &mut qbus, &mut mem, &mut clock, |dh, ctx| {
            dh.write(14, 4, false, ctx).unwrap();
            dh.write(12, TBAD2_TXEN | TBAD2_START, false, ctx).unwrap();
            dh.event(DevTimer::Transfer(0), ctx);
            assert_ne!(dh.csr & CSR_TXERR, 0);
        });
    }
}
