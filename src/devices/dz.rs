use crate::core::console::{Console, ConsoleEvent};
use crate::devices::{merge_byte, DevTimer, IoCtx, IoDescriptor, Nxd};
use std::collections::VecDeque;
use tracing::debug;

pub const DZ_CSR_ADDR: u32 = 0o760100;
const DZ_NREGS: usize = 4;
const DZ_RXVEC: u16 = 0o300;
const DZ_TXVEC: u16 = 0o304;
const DZ_IPL: u8 = 5;
pub const DZ_LINES: usize = 8;

const RX: usize = 0;
const TX: usize = 1;

// CSR bits.
const CSR_TRDY: u16 = 0o100000;
const CSR_TIE: u16 = 0o040000;
const CSR_SA: u16 = 0o020000;
const CSR_SAE: u16 = 0o010000;
const CSR_TLINE: u16 = 0o003400;
const CSR_RDONE: u16 = 0o000200;
const CSR_RIE: u16 = 0o000100;
const CSR_MSE: u16 = 0o000040;
const CSR_CLR: u16 = 0o000020;
const CSR_MAINT: u16 = 0o000010;
const CSR_RW: u16 = 0o050170;

// RBUF bits.
const RBUF_DATA_VALID: u16 = 0o100000;
const RBUF_OVRN: u16 = 0o040000;

// LPR bits.
const LPR_RX_ON: u16 = 0o010000;

const SILO_SIZE: usize = 64;
const SILO_ALARM: usize = 16;
const SCAN_DELAY: u64 = 200;

/// DZ11 eight-line terminal multiplexer: a 64-entry receive silo shared
/// by all lines, per-line enables, and a scanned transmitter.
pub struct Dz11 {
    pub lines: Vec<Option<Console>>,
    csr: u16,
    tcr: u16,
    rx_on: u16, // per-line receiver enable from LPR
    silo: VecDeque<u16>,
    silo_seen: usize,
}

impl Dz11 {
    pub fn new(lines: Vec<Option<Console>>) -> Self {
        Self {
            lines,
            csr: 0,
            tcr: 0,
            rx_on: 0,
            silo: VecDeque::new(),
            silo_seen: 0,
        }
    }

    pub fn descriptor(&self) -> IoDescriptor {
        IoDescriptor {
            name: "DZ11",
            csr_addr: DZ_CSR_ADDR,
            nregs: DZ_NREGS,
            br_level: DZ_IPL,
            vectors: vec![DZ_RXVEC, DZ_TXVEC],
        }
    }

    pub fn reset(&mut self, ctx: &mut IoCtx) {
        self.csr = 0;
        self.tcr = 0;
        self.rx_on = 0;
        self.silo.clear();
        self.silo_seen = 0;
        ctx.cancel(DevTimer::Scan);
    }

    fn update_csr(&mut self, ctx: &mut IoCtx) {
        let had_rdone = self.csr & CSR_RDONE != 0;
        if self.silo.is_empty() {
            self.csr &= !(CSR_RDONE | CSR_SA);
        } else {
            self.csr |= CSR_RDONE;
            if self.csr & CSR_SAE != 0 && self.silo_seen >= SILO_ALARM {
                self.csr |= CSR_SA;
            }
        }
        if !had_rdone && self.csr & CSR_RDONE != 0 && self.csr & CSR_RIE != 0 {
            // Silo alarm mode holds the interrupt until 16 entries.
            if self.csr & CSR_SAE == 0 || self.csr & CSR_SA != 0 {
                ctx.raise(RX);
            }
        }
        // Transmit side: find the highest enabled line with the scanner.
        let mut tline = None;
        for line in 0..DZ_LINES {
            if self.tcr & (1 << line) != 0 {
                tline = Some(line);
                break;
            }
        }
        match tline {
            Some(line) if self.csr & CSR_MSE != 0 => {
                let had_trdy = self.csr & CSR_TRDY != 0;
                self.csr = (self.csr & !CSR_TLINE) | ((line as u16) << 8) | CSR_TRDY;
                if !had_trdy && self.csr & CSR_TIE != 0 {
                    ctx.raise(TX);
                }
            }
            _ => {
                self.csr &= !CSR_TRDY;
            }
        }
    }

    fn silo_push(&mut self, line: usize, ch: u8, ctx: &mut IoCtx) {
        if self.csr & CSR_MSE == 0 || self.rx_on & (1 << line) == 0 {
            return;
        }
        if self.silo.len() >= SILO_SIZE {
            // Overrun marks the newest entry; the silo itself stays.
            if let Some(last) = self.silo.back_mut() {
                *last |= RBUF_OVRN;
            }
            return;
        }
        self.silo
            .push_back(RBUF_DATA_VALID | ((line as u16) << 8) | ch as u16);
        self.silo_seen += 1;
        self.update_csr(ctx);
    }

    pub fn read(&mut self, reg: u32, ctx: &mut IoCtx) -> Result<u16, Nxd> {
        match reg {
            0 => Ok(self.csr),
            2 => {
                let value = self.silo.pop_front().unwrap_or(0);
                if self.silo.is_empty() {
                    self.silo_seen = 0;
                }
                self.update_csr(ctx);
                Ok(value)
            }
            4 => Ok(self.tcr),
            6 => Ok(0), // MSR: no modem signals on a TCP line
            _ => Err(Nxd),
        }
    }

    pub fn write(&mut self, reg: u32, data: u16, byte: bool, ctx: &mut IoCtx) -> Result<(), Nxd> {
        match reg & !1 {
            0 => {
                let data = if byte { merge_byte(self.csr, data, reg) } else { data };
                if data & CSR_CLR != 0 {
                    self.reset(ctx);
                    return Ok(());
                }
                self.csr = (self.csr & !CSR_RW) | (data & CSR_RW);
                if self.csr & CSR_MSE != 0 {
                    if !ctx.is_scheduled(DevTimer::Scan) {
                        ctx.schedule(DevTimer::Scan, SCAN_DELAY);
                    }
                } else {
                    ctx.cancel(DevTimer::Scan);
                }
                self.update_csr(ctx);
            }
            2 => {
                // LPR: per-line receiver on/off.
                let line = (data & 0o7) as usize;
                if data & LPR_RX_ON != 0 {
                    self.rx_on |= 1 << line;
                } else {
                    self.rx_on &= !(1 << line);
                }
            }
            4 => {
                let data = if byte { merge_byte(self.tcr, data, reg) } else { data };
                self.tcr = data;
                self.update_csr(ctx);
            }
            6 => {
                // TDR: transmit on the currently scanned line.
                let line = ((self.csr & CSR_TLINE) >> 8) as usize;
                let ch = (data & 0xFF) as u8;
                if self.csr & CSR_MAINT != 0 {
                    self.silo_push(line, ch, ctx);
                } else if let Some(Some(console)) = self.lines.get(line) {
                    console.send(ch);
                }
                self.csr &= !CSR_TRDY;
                ctx.schedule(DevTimer::TxDone(line), SCAN_DELAY);
            }
            _ => return Err(Nxd),
        }
        Ok(())
    }

    pub fn event(&mut self, timer: DevTimer, ctx: &mut IoCtx) {
        match timer {
            DevTimer::Scan => {
                self.update_csr(ctx);
                if self.csr & CSR_MSE != 0 {
                    ctx.schedule(DevTimer::Scan, SCAN_DELAY);
                }
            }
            DevTimer::TxDone(_) => self.update_csr(ctx),
            _ => {}
        }
    }

    pub fn poll(&mut self, ctx: &mut IoCtx) {
        for line in 0..self.lines.len().min(DZ_LINES) {
            while let Some(event) = self.lines[line].as_ref().and_then(|c| c.poll()) {
                match event {
                    ConsoleEvent::Char(ch) => self.silo_push(line, ch, ctx),
                    ConsoleEvent::Connected => debug!("DZ11: line {line} connected"),
                    ConsoleEvent::Disconnected => debug!("DZ11: line {line} disconnected"),
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
    use crate::devices::{IrqOp, NoDma};

    fn with_ctx<R>(f: impl FnOnce(&mut Dz11, &mut IoCtx) -> R) -> (R, Vec<IrqOp>) {
        let mut dz = Dz11::new((0..DZ_LINES).map(|_| None).collect());
        let mut clock = Clock::new();
        let mut irqs = Vec::new();
        let mut dma = NoDma;
        let mut ctx = IoCtx {
            slot: 0,
            clock: &mut clock,
            irqs: &mut irqs,
            dma: &mut dma,
        };
        let r = f(&mut dz, &mut ctx);
        (r, irqs)
    }

    #[test]
    fn silo_delivers_line_tagged_characters() {
        let ((), irqs) = with_ctx(|dz, ctx| {
            dz.write(0, CSR_MSE | CSR_RIE, false, ctx).unwrap();
            dz.write(2, LPR_RX_ON | 3, false, ctx).unwrap(); // line 3 on
            dz.silo_push(3, b'Q', ctx);
            let rbuf = dz.read(2, ctx).unwrap();
            assert_ne!(rbuf & RBUF_DATA_VALID, 0);
            assert_eq!((rbuf >> 8) & 7, 3);
            assert_eq!(rbuf & 0xFF, b'Q' as u16);
        });
        assert!(irqs.contains(&IrqOp::Raise(RX)));
    }

    #[test]
    fn disabled_line_drops_input() {
        let ((), _) = with_ctx(|dz, ctx| {
            dz.write(0, CSR_MSE, false, ctx).unwrap();
            dz.silo_push(2, b'x', ctx);
            assert_eq!(dz.csr & CSR_RDONE, 0);
        });
    }

    #[test]
    fn transmit_scanner_reports_lowest_enabled_line() {
        let ((), irqs) = with_ctx(|dz, ctx| {
            dz.write(0, CSR_MSE | CSR_TIE, false, ctx).unwrap();
            dz.write(4, 1 << 5, false, ctx).unwrap(); // enable line 5
            assert_ne!(dz.csr & CSR_TRDY, 0);
            assert_eq!((dz.csr & CSR_TLINE) >> 8, 5);
        });
        assert!(irqs.contains(&IrqOp::Raise(TX)));
    }

    #[test]
    fn silo_overrun_marks_last_entry() {
        let ((), _) = with_ctx(|dz, ctx| {
            dz.write(0, CSR_MSE, false, ctx).unwrap();
            dz.write(2, LPR_RX_ON, false, ctx).unwrap(); // line 0
            for _ in 0..SILO_SIZE + 3 {
                dz.silo_push(0, b'a', ctx);
            }
            assert_eq!(dz.silo.len(), SILO_SIZE);
            assert_ne!(dz.silo.back().unwrap() & RBUF_OVRN, 0);
        });
    }

    #[test]
    fn master_clear_resets_state() {
        let ((), _) = with_ctx(|dz, ctx| {
            dz.write(0, CSR_MSE, false, ctx).unwrap();
            dz.write(2, LPR_RX_ON, false, ctx).unwrap();
            dz.silo_push(0, b'a', ctx);
            dz.write(0, CSR_CLR, false, ctx).unwrap();
            assert_eq!(dz.csr, 0);
            assert!(dz.silo.is_empty());
        });
    }
}
