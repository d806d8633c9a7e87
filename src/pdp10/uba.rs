use crate::devices::IoDescriptor;
use crate::pdp10::memory::PhysMemory;
use crate::pdp10::word::{lh, rh, Word};
use tracing::{debug, trace};

pub const UBA_MAX: usize = 4;

// Internal register window within each adapter's IO space.
const MAP_ADDR: u32 = 0o763000;
const MAP_NREG: u32 = 0o100;
const SR_ADDR: u32 = 0o763100;
const MR_ADDR: u32 = 0o763101;

// Status register bits.
pub const SR_TIM: u32 = 0o400000; // Unibus arbitrator timeout
pub const SR_BAD: u32 = 0o200000; // bad memory data on NPR transfer
pub const SR_PAR: u32 = 0o100000; // KS10 bus parity error
pub const SR_NED: u32 = 0o040000; // non-existent device addressed
pub const SR_INTH: u32 = 0o004000; // interrupt request on BR6/BR7
pub const SR_INTL: u32 = 0o002000; // interrupt request on BR4/BR5
pub const SR_PWRL: u32 = 0o001000; // power low
pub const SR_DXFR: u32 = 0o000200; // disable transfer on bad data
pub const SR_UINIT: u32 = 0o000100; // issue Unibus init
pub const SR_PIH: u32 = 0o000070; // PI level of BR6/BR7
pub const SR_PIL: u32 = 0o000007; // PI level of BR4/BR5
const SR_W1C: u32 = 0o741000;
const SR_RW: u32 = 0o000277;

// Map register, write format.
const MAPW_FLAGS: u32 = 0o740000;
const MAPW_PAGE: u32 = 0o003777;

// Map register, read format (36-bit image).
pub const MAP_VALID: u32 = 0o001000000000;
pub const MAP_PAGE: u32 = 0o000003777000;

// IPL slot groups by bus-request level.
const INT_BR7: u32 = 0x0000_00FF;
const INT_BR6: u32 = 0x0000_FF00;
const INT_BR5: u32 = 0x00FF_0000;
const INT_BR4: u32 = 0x3F00_0000;
const INT_BR67: u32 = INT_BR6 | INT_BR7;
const INT_BR45: u32 = INT_BR4 | INT_BR5;

fn br_group(level: u8) -> u32 {
    match level {
        7 => INT_BR7,
        6 => INT_BR6,
        5 => INT_BR5,
        _ => INT_BR4,
    }
}

/// What an IO-space address resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoTarget {
    /// A registered device: (device slot, byte offset from its CSR base).
    Device(usize, u32),
    /// One of the adapter's own registers.
    Internal,
    /// Nothing answered: bus timeout.
    Timeout,
}

/// One Unibus adapter: 64-entry DMA page map, status register, interrupt
/// request/vector tables, and the CSR dispatch table for its devices.
pub struct UbaSlot {
    pub exists: bool,
    pub sr: u32,
    pub mr: u32,
    pub map: [u32; 64],
    pub int_requests: u32,
    int_vectors: [u16; 32],
    /// For each possible IPL slot, the owning device slot.
    int_owner: [Option<usize>; 32],
    /// CSR dispatch: (device slot, csr base) per registered region.
    regions: Vec<(usize, u32, u32)>, // (device, base, len_bytes)
}

impl UbaSlot {
    fn new(exists: bool) -> Self {
        Self {
            exists,
            sr: 0,
            mr: 0,
            map: [0; 64],
            int_requests: 0,
            int_vectors: [0; 32],
            int_owner: [None; 32],
            regions: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.sr = 0;
        self.mr = 0;
        self.map = [0; 64];
        self.int_requests = 0;
    }

    /// PI channel wired for BR6/BR7 requests.
    pub fn pi_high(&self) -> usize {
        ((self.sr & SR_PIH) >> 3) as usize
    }

    /// PI channel wired for BR4/BR5 requests.
    pub fn pi_low(&self) -> usize {
        (self.sr & SR_PIL) as usize
    }
}

/// The KS10's Unibus interface: adapters 1 and 3 are populated, matching
/// the DECSYSTEM-2020 backplane.
pub struct Uba {
    pub slots: [UbaSlot; UBA_MAX],
}

/// Result of registering a device on an adapter: the IPL slots assigned to
/// each of its vectors, fed back when the device raises interrupts.
pub struct IrqAssignment {
    pub uba: usize,
    pub ipl_slots: Vec<usize>,
}

impl Uba {
    pub fn new() -> Self {
        Self {
            slots: [
                UbaSlot::new(false),
                UbaSlot::new(true),
                UbaSlot::new(false),
                UbaSlot::new(true),
            ],
        }
    }

    pub fn reset(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.reset();
        }
    }

    /// Register a device's CSR region and interrupt vectors on adapter
    /// `uba`. IPL slots inside the BR group are handed out low-index-first
    /// (highest priority first).
    pub fn set_map(&mut self, uba: usize, device: usize, desc: &IoDescriptor) -> IrqAssignment {
        let slot = &mut self.slots[uba];
        slot.regions
            .push((device, desc.csr_addr & 0o17777, (desc.nregs * 2) as u32));
        let group = br_group(desc.br_level);
        let mut ipl_slots = Vec::new();
        for vector in desc.vectors.iter() {
            let mut assigned = None;
            for ipl in 0..32 {
                if (group >> ipl) & 1 != 0 && slot.int_owner[ipl].is_none() {
                    slot.int_owner[ipl] = Some(device);
                    slot.int_vectors[ipl] = *vector;
                    assigned = Some(ipl);
                    break;
                }
            }
            let ipl = assigned.expect("out of IPL slots on adapter");
            ipl_slots.push(ipl);
            debug!(
                "UBA{uba}: {} CSR {:06o} vector {:03o} BR{} -> IPL slot {}",
                desc.name, desc.csr_addr, vector, desc.br_level, ipl
            );
        }
        IrqAssignment { uba, ipl_slots }
    }

    /// Decode an IO-space reference: which adapter, and what within it.
    pub fn resolve(&self, io_addr: Word) -> (usize, IoTarget) {
        let unit = ((io_addr >> 18) & 0o17) as usize;
        let reg = (io_addr & 0o777777) as u32;
        if unit >= UBA_MAX || !self.slots[unit].exists {
            return (unit.min(UBA_MAX - 1), IoTarget::Timeout);
        }
        let reg13 = reg & 0o17777;
        if (MAP_ADDR..MAP_ADDR + MAP_NREG).contains(&(reg & 0o777777))
            || reg == SR_ADDR
            || reg == MR_ADDR
        {
            return (unit, IoTarget::Internal);
        }
        for (device, base, len) in self.slots[unit].regions.iter() {
            if reg13 >= *base && reg13 < *base + *len {
                return (unit, IoTarget::Device(*device, reg13 - *base));
            }
        }
        (unit, IoTarget::Timeout)
    }

    /// Read one of the adapter's own registers.
    pub fn read_internal(&mut self, unit: usize, io_addr: Word) -> Word {
        let slot = &mut self.slots[unit];
        let reg = (io_addr & 0o777777) as u32;
        if reg == SR_ADDR {
            let mut sr = slot.sr;
            if slot.int_requests & INT_BR67 != 0 {
                sr |= SR_INTH;
            }
            if slot.int_requests & INT_BR45 != 0 {
                sr |= SR_INTL;
            }
            sr as Word
        } else if reg == MR_ADDR {
            slot.mr as Word
        } else {
            slot.map[(reg & 0o77) as usize] as Word
        }
    }

    /// Write one of the adapter's own registers. Returns true when the
    /// write was a Unibus init strobe, so the caller resets the devices on
    /// this adapter.
    pub fn write_internal(&mut self, unit: usize, io_addr: Word, data: Word) -> bool {
        let slot = &mut self.slots[unit];
        let reg = (io_addr & 0o777777) as u32;
        let data = data as u32;
        if reg == SR_ADDR {
            if data & SR_UINIT != 0 {
                slot.reset();
                slot.sr = data & SR_DXFR;
                debug!("UBA{unit}: Unibus init");
                return true;
            }
            slot.sr = (slot.sr & !(SR_RW | (data & SR_W1C))) | (data & SR_RW);
            false
        } else if reg == MR_ADDR {
            slot.mr = data & 0o3;
            false
        } else {
            let index = (reg & 0o77) as usize;
            slot.map[index] = ((data & MAPW_FLAGS) << 13) | ((data & MAPW_PAGE) << 9);
            trace!("UBA{unit}: MAP {index:02o} <- {:012o}", slot.map[index]);
            false
        }
    }

    /// A device raised an interrupt on an assigned IPL slot: latch the
    /// request and return the PI channel to post on, if one is wired.
    pub fn send_interrupt(&mut self, unit: usize, ipl_slot: usize) -> Option<usize> {
        let slot = &mut self.slots[unit];
        slot.int_requests |= 1 << ipl_slot;
        let channel = if (1u32 << ipl_slot) & INT_BR67 != 0 {
            slot.pi_high()
        } else {
            slot.pi_low()
        };
        debug!(
            "UBA{unit}: interrupt on IPL slot {ipl_slot} vector {:03o} (PI {channel})",
            slot.int_vectors[ipl_slot]
        );
        (channel != 0).then_some(channel)
    }

    pub fn cancel_interrupt(&mut self, unit: usize, ipl_slot: usize) {
        self.slots[unit].int_requests &= !(1 << ipl_slot);
    }

    /// Interrupt acknowledge: find the adapter wired to this PI channel
    /// with a pending request, clear the highest-priority one and return
    /// (adapter, vector). None is the passive release.
    pub fn get_vector(&mut self, channel: usize) -> Option<(usize, u16)> {
        for unit in (1..UBA_MAX).step_by(2) {
            let slot = &mut self.slots[unit];
            if !slot.exists {
                continue;
            }
            let mut group = 0;
            if channel != 0 && channel == slot.pi_high() {
                group |= INT_BR67;
            }
            if channel != 0 && channel == slot.pi_low() {
                group |= INT_BR45;
            }
            let requests = slot.int_requests & group;
            if requests == 0 {
                continue;
            }
            for ipl in 0..32 {
                if (requests >> ipl) & 1 != 0 {
                    slot.int_requests &= !(1u32 << ipl);
                    debug!(
                        "UBA{unit}: acknowledge PI {channel} -> vector {:03o}",
                        slot.int_vectors[ipl]
                    );
                    return Some((unit, slot.int_vectors[ipl]));
                }
            }
        }
        None
    }

    /// Does any wired request remain on this adapter/channel pair?
    pub fn channel_pending(&self, channel: usize) -> bool {
        self.slots.iter().any(|slot| {
            slot.exists
                && ((channel != 0 && channel == slot.pi_high()
                    && slot.int_requests & INT_BR67 != 0)
                    || (channel != 0 && channel == slot.pi_low()
                        && slot.int_requests & INT_BR45 != 0))
        })
    }
}

/// Scatter-mapped DMA through one adapter's page map. Unibus addresses
/// count bytes, four per 36-bit word; each map slot covers one 2048-byte
/// Unibus page (512 words) and supplies an 11-bit physical frame. A miss
/// aborts the transfer and latches the arbitrator-timeout bit.
pub struct UbaDma<'a> {
    pub slot: &'a mut UbaSlot,
    pub mem: &'a mut PhysMemory,
}

impl UbaDma<'_> {
    fn map_addr(&mut self, io_addr: u32) -> Option<u32> {
        let entry = self.slot.map[((io_addr >> 11) & 0o77) as usize];
        if entry & MAP_VALID != 0 {
            Some((entry & MAP_PAGE) | ((io_addr >> 2) & 0o777))
        } else {
            self.slot.sr |= SR_TIM;
            None
        }
    }
}

impl crate::devices::DmaBus for UbaDma<'_> {
    /// Bus -> device: unpack each 36-bit word into two 16-bit Unibus words
    /// (one per 18-bit half).
    fn read_block(&mut self, bus_addr: u32, data: &mut [u16]) -> u32 {
        let mut addr = bus_addr & !1;
        let mut idx = 0;
        while idx < data.len() {
            let Some(pa) = self.map_addr(addr) else {
                return ((data.len() - idx) * 2) as u32;
            };
            let word = self.mem.peek(pa);
            if addr & 2 == 0 {
                data[idx] = (lh(word) & 0xFFFF) as u16;
            } else {
                data[idx] = (rh(word) & 0xFFFF) as u16;
            }
            idx += 1;
            addr += 2;
        }
        0
    }

    /// Device -> bus: pack pairs of 16-bit words into 18-bit halves.
    fn write_block(&mut self, bus_addr: u32, data: &[u16]) -> u32 {
        let mut addr = bus_addr & !1;
        for (idx, half) in data.iter().enumerate() {
            let Some(pa) = self.map_addr(addr) else {
                return ((data.len() - idx) * 2) as u32;
            };
            let word = self.mem.peek(pa);
            let word = if addr & 2 == 0 {
                (word & 0o000000777777) | ((*half as Word) << 18)
            } else {
                (word & 0o777777000000) | *half as Word
            };
            self.mem.poke(pa, word);
            addr += 2;
        }
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::DmaBus;

    fn desc(csr: u32, br: u8, vectors: Vec<u16>) -> IoDescriptor {
        IoDescriptor {
            name: "test",
            csr_addr: csr,
            nregs: 4,
            br_level: br,
            vectors,
        }
    }

    #[test]
    fn csr_dispatch_and_timeout() {
        let mut uba = Uba::new();
        uba.set_map(1, 0, &desc(0o777560, 4, vec![0o60, 0o64]));

        let io = (1 << 18) | 0o777562;
        assert_eq!(uba.resolve(io), (1, IoTarget::Device(0, 2)));
        assert_eq!(uba.resolve((1 << 18) | 0o777600).1, IoTarget::Timeout);
        // Adapter 0 is unpopulated.
        assert_eq!(uba.resolve(0o777560).1, IoTarget::Timeout);
        // Internal window.
        assert_eq!(uba.resolve((1 << 18) | 0o763100).1, IoTarget::Internal);
    }

    #[test]
    fn interrupt_request_and_acknowledge() {
        let mut uba = Uba::new();
        let irq = uba.set_map(1, 0, &desc(0o777560, 4, vec![0o60, 0o64]));
        // Wire BR4/5 requests to PI channel 5.
        uba.write_internal(1, 0o763100, 0o5);

        let chan = uba.send_interrupt(1, irq.ipl_slots[0]).unwrap();
        assert_eq!(chan, 5);
        assert!(uba.channel_pending(5));
        // Acknowledge hands out the RX vector and clears the request.
        assert_eq!(uba.get_vector(5), Some((1, 0o60)));
        assert_eq!(uba.get_vector(5), None); // passive release
    }

    #[test]
    fn br67_outranks_br45_at_acknowledge() {
        let mut uba = Uba::new();
        let low = uba.set_map(1, 0, &desc(0o777560, 4, vec![0o60]));
        let high = uba.set_map(1, 1, &desc(0o776700, 6, vec![0o254]));
        uba.write_internal(1, 0o763100, 0o55); // PIH=5, PIL=5

        uba.send_interrupt(1, low.ipl_slots[0]);
        uba.send_interrupt(1, high.ipl_slots[0]);
        // The BR6 request sits in a lower IPL slot, so it wins the ack.
        assert_eq!(uba.get_vector(5), Some((1, 0o254)));
        assert_eq!(uba.get_vector(5), Some((1, 0o60)));
    }

    #[test]
    fn sr_write_one_to_clear() {
        let mut uba = Uba::new();
        uba.slots[1].sr |= SR_NED;
        uba.write_internal(1, 0o763100, SR_NED as Word);
        assert_eq!(uba.slots[1].sr & SR_NED, 0);
    }

    #[test]
    fn dma_roundtrip_and_invalid_map() {
        let mut uba = Uba::new();
        let mut mem = PhysMemory::new(64);
        // Map slot 0 -> physical page 2 (write format: valid | page).
        uba.write_internal(1, 0o763000, (0o40000 | 2) as Word);

        {
            let mut dma = UbaDma {
                slot: &mut uba.slots[1],
                mem: &mut mem,
            };
            let out = [0x1122u16, 0x3344, 0x5566];
            assert_eq!(dma.write_block(0, &out), 0);
            let mut back = [0u16; 3];
            assert_eq!(dma.read_block(0, &mut back), 0);
            assert_eq!(back, out);
        }
        // First word landed at page 2, halves packed left then right.
        assert_eq!(mem.peek(2 << 9), (0x1122 << 18) | 0x3344);

        // Unmapped page: truncation plus the timeout latch in the SR.
        let mut dma = UbaDma {
            slot: &mut uba.slots[1],
            mem: &mut mem,
        };
        let out = [0xAAAAu16; 2];
        assert_eq!(dma.write_block(0o4000, &out), 4);
        assert_ne!(uba.slots[1].sr & SR_TIM, 0);
    }
}
