use crate::core::clock::Clock;
use crate::core::console::{Console, ConsoleEvent};
use crate::devices::IoEvent;
use std::collections::VecDeque;
use tracing::debug;

// RXCS - console receive control and status.
pub const RXCS_ACT: u32 = 0x0000_0800;
pub const RXCS_RDY: u32 = 0x0000_0080;
pub const RXCS_IE: u32 = 0x0000_0040;
const RXCS_WMASK: u32 = 0x0000_0040;

// RXDB - console receive data buffer.
pub const RXDB_ERR: u32 = 0x0000_8000;
pub const RXDB_OVR: u32 = 0x0000_4000;
pub const RXDB_BRK: u32 = 0x0000_0800;
pub const RXDB_CHAR: u32 = 0x0000_00FF;

// TXCS - console transmit control and status.
pub const TXCS_RDY: u32 = 0x0000_0080;
pub const TXCS_IE: u32 = 0x0000_0040;
pub const TXCS_MAINT: u32 = 0x0000_0004;
const TXCS_WMASK: u32 = 0x0000_0045;

const QUEUE_DELAY: u64 = 50;
const TX_DELAY: u64 = 30;

/// The console terminal as the VAX sees it: two register pairs reached by
/// MTPR/MFPR, a TCP stream behind them, and two interrupt lines at BR4
/// wired straight to the architectural SCB vectors.
pub struct Cty {
    pub console: Option<Console>,
    pub rxcs: u32,
    pub rxdb: u32,
    pub txcs: u32,
    in_queue: VecDeque<u8>,
    pub rx_irq: bool,
    pub tx_irq: bool,
    pub halt_request: bool,
}

impl Cty {
    pub fn new(console: Option<Console>) -> Self {
        Self {
            console,
            rxcs: 0,
            rxdb: 0,
            txcs: TXCS_RDY,
            in_queue: VecDeque::new(),
            rx_irq: false,
            tx_irq: false,
            halt_request: false,
        }
    }

    /// Drain the socket at the instruction boundary.
    pub fn poll(&mut self, clock: &mut Clock<IoEvent>) {
        while let Some(event) = self.console.as_ref().and_then(|c| c.poll()) {
            match event {
                ConsoleEvent::Char(ch) => {
                    self.in_queue.push_back(ch);
                    self.deliver(clock);
                }
                ConsoleEvent::Connected => {
                    debug!("CTY: console connected");
                    self.txcs |= TXCS_RDY;
                    if self.txcs & TXCS_IE != 0 {
                        self.tx_irq = true;
                    }
                }
                ConsoleEvent::Disconnected => {
                    debug!("CTY: console disconnected");
                    self.txcs &= !TXCS_RDY;
                }
                ConsoleEvent::HaltSwitch => {
                    self.halt_request = true;
                }
            }
        }
    }

    /// Move one queued character into RXDB. A still-full buffer marks the
    /// overrun; remaining input re-arms the queue timer.
    fn deliver(&mut self, clock: &mut Clock<IoEvent>) {
        if self.rxcs & RXCS_RDY != 0 {
            if !self.in_queue.is_empty() {
                self.rxdb |= RXDB_ERR | RXDB_OVR;
                self.rxcs |= RXCS_ACT;
                clock.schedule(IoEvent::ConsoleRxQueue, QUEUE_DELAY);
            }
            return;
        }
        let Some(ch) = self.in_queue.pop_front() else {
            return;
        };
        self.rxcs &= !RXCS_ACT;
        self.rxdb = ch as u32;
        if self.rxdb & RXDB_CHAR == 0 {
            self.rxdb |= RXDB_BRK;
        }
        self.rxcs |= RXCS_RDY;
        if self.txcs & TXCS_MAINT != 0 {
            self.txcs |= TXCS_RDY;
        }
        if self.rxcs & RXCS_IE != 0 {
            self.rx_irq = true;
        }
        if !self.in_queue.is_empty() {
            self.rxcs |= RXCS_ACT;
            clock.schedule(IoEvent::ConsoleRxQueue, QUEUE_DELAY);
        }
    }

    pub fn rx_queue_tick(&mut self, clock: &mut Clock<IoEvent>) {
        self.deliver(clock);
    }

    /// Inject one character as if it arrived from the wire; maintenance
    /// paths and local-console use.
    pub fn input_char(&mut self, ch: u8, clock: &mut Clock<IoEvent>) {
        self.in_queue.push_back(ch);
        self.deliver(clock);
    }

    pub fn tx_done(&mut self) {
        self.txcs |= TXCS_RDY;
        if self.txcs & TXCS_IE != 0 {
            self.tx_irq = true;
        }
    }

    pub fn read_rxcs(&self) -> u32 {
        self.rxcs
    }

    pub fn write_rxcs(&mut self, value: u32) {
        if value & RXCS_IE == 0 {
            self.rx_irq = false;
        } else if self.rxcs & (RXCS_RDY | RXCS_IE) == RXCS_RDY {
            self.rx_irq = true;
        }
        self.rxcs = (self.rxcs & !RXCS_WMASK) | (value & RXCS_WMASK);
    }

    /// Reading the buffer hands the character over and re-arms the queue.
    pub fn read_rxdb(&mut self, clock: &mut Clock<IoEvent>) -> u32 {
        let value = self.rxdb;
        self.rxcs &= !RXCS_RDY;
        self.rxdb &= !(RXDB_ERR | RXDB_OVR | RXDB_BRK);
        if !self.in_queue.is_empty() {
            self.rxcs |= RXCS_ACT;
            clock.schedule(IoEvent::ConsoleRxQueue, QUEUE_DELAY);
        }
        value
    }

    pub fn read_txcs(&self) -> u32 {
        self.txcs
    }

    pub fn write_txcs(&mut self, value: u32) {
        if value & TXCS_IE == 0 {
            self.tx_irq = false;
        } else if self.txcs & (TXCS_RDY | TXCS_IE) == TXCS_RDY {
            self.tx_irq = true;
        }
        self.txcs = (self.txcs & !TXCS_WMASK) | (value & TXCS_WMASK);
    }

    /// A TXDB write puts the character on the wire; ready returns via the
    /// transmit-done timer. Maintenance mode short-circuits into RXDB.
    pub fn write_txdb(&mut self, value: u32, clock: &mut Clock<IoEvent>) {
        let ch = (value & 0xFF) as u8;
        if self.txcs & TXCS_MAINT != 0 {
            self.in_queue.push_back(ch);
            self.deliver(clock);
            return;
        }
        self.txcs &= !TXCS_RDY;
        if let Some(console) = &self.console {
            console.send(ch);
        }
        clock.schedule(IoEvent::ConsoleTxDone, TX_DELAY);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock() -> Clock<IoEvent> {
        Clock::new()
    }

    #[test]
    fn receive_sets_ready_and_interrupt() {
        let mut cty = Cty::new(None);
        let mut clock = clock();
        cty.write_rxcs(RXCS_IE);
        cty.in_queue.push_back(b'A');
        cty.deliver(&mut clock);
        assert_eq!(cty.rxdb & RXDB_CHAR, b'A' as u32);
        assert_ne!(cty.rxcs & RXCS_RDY, 0);
        assert!(cty.rx_irq);

        // Reading clears ready.
        let v = cty.read_rxdb(&mut clock);
        assert_eq!(v & RXDB_CHAR, b'A' as u32);
        assert_eq!(cty.rxcs & RXCS_RDY, 0);
    }

    #[test]
    fn overrun_marks_rxdb() {
        let mut cty = Cty::new(None);
        let mut clock = clock();
        cty.in_queue.push_back(b'A');
        cty.deliver(&mut clock);
        cty.in_queue.push_back(b'B');
        cty.deliver(&mut clock);
        assert_ne!(cty.rxdb & RXDB_OVR, 0);
        // The second character waits in the queue.
        cty.read_rxdb(&mut clock);
        cty.rx_queue_tick(&mut clock);
        assert_eq!(cty.rxdb & RXDB_CHAR, b'B' as u32);
    }

    #[test]
    fn maintenance_loopback() {
        let mut cty = Cty::new(None);
        let mut clock = clock();
        cty.write_txcs(TXCS_MAINT | TXCS_IE);
        cty.write_txdb(0x41, &mut clock);
        assert_eq!(cty.rxdb & RXDB_CHAR, 0x41);
        assert_ne!(cty.rxcs & RXCS_RDY, 0);
        // MAINT keeps the transmitter ready.
        assert_ne!(cty.txcs & TXCS_RDY, 0);
    }

    #[test]
    fn transmit_ready_via_timer() {
        let mut cty = Cty::new(None);
        let mut clock = clock();
        cty.write_txcs(TXCS_IE);
        cty.write_txdb(b'X' as u32, &mut clock);
        assert_eq!(cty.txcs & TXCS_RDY, 0);
        assert!(clock.is_scheduled(IoEvent::ConsoleTxDone));
        cty.tx_done();
        assert_ne!(cty.txcs & TXCS_RDY, 0);
        assert!(cty.tx_irq);
    }
}
