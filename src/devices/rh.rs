use crate::devices::{DevTimer, DmaBus, IoCtx, IoDescriptor, Nxd};
use tracing::{debug, trace, warn};

pub const RH_CSR_ADDR: u32 = 0o776700;
const RH_NREGS: usize = 18;
const RH_VECTOR: u16 = 0o254;
const RH_IPL: u8 = 5;

pub const RH_UNITS: usize = 8;
const XFER_DELAY: u64 = 2000;

// RP06 geometry, 16-bit sector format.
const RP_SECTORS: u32 = 22;
const RP_TRACKS: u32 = 19;
const RP_CYLINDERS: u32 = 815;
const SECTOR_BYTES: u32 = 512;

// CS1 bits.
const CS1_SC: u16 = 0o100000;
const CS1_TRE: u16 = 0o040000;
const CS1_RDY: u16 = 0o000200;
const CS1_IE: u16 = 0o000100;
const CS1_FUNC: u16 = 0o000076;
const CS1_GO: u16 = 0o000001;

// CS2 bits.
const CS2_WCE: u16 = 0o040000; // write check error
const CS2_NED: u16 = 0o010000; // non-existent drive
const CS2_NEM: u16 = 0o004000; // non-existent memory
const CS2_CLR: u16 = 0o000040;
const CS2_UNIT: u16 = 0o000007;

// Drive status bits.
const DS_ATA: u16 = 0o100000;
const DS_ERR: u16 = 0o040000;
const DS_MOL: u16 = 0o010000;
const DS_DPR: u16 = 0o000400;
const DS_DRY: u16 = 0o000200;
const DS_VV: u16 = 0o000100;

// Error register 1.
const ER1_AOE: u16 = 0o001000; // address overflow
const ER1_IAE: u16 = 0o000400; // invalid address

// Function codes (CS1<5:1>).
const FN_NOP: u16 = 0o00;
const FN_SEEK: u16 = 0o02;
const FN_RECAL: u16 = 0o03;
const FN_DCLR: u16 = 0o04;
const FN_RELEASE: u16 = 0o05;
const FN_SEARCH: u16 = 0o14;
const FN_WCHK: u16 = 0o24;
const FN_WRITE: u16 = 0o30;
const FN_READ: u16 = 0o34;
const FN_PRESET: u16 = 0o10;
const FN_PACKACK: u16 = 0o11;

// RP06 drive type code.
const DT_RP06: u16 = 0o020022;

struct Drive {
    image: Option<Vec<u8>>,
    ds: u16,
    er1: u16,
    da: u16,
    dc: u16,
    of: u16,
}

impl Drive {
    fn new(image: Option<Vec<u8>>) -> Self {
        let present = image.is_some();
        Self {
            image,
            ds: if present { DS_MOL | DS_DPR | DS_DRY } else { 0 },
            er1: 0,
            da: 0,
            dc: 0,
            of: 0,
        }
    }
}

/// RH11 massbus controller fronting up to eight RP06 drives. Data moves
/// between the drive images and bus memory through the adapter's DMA map;
/// completion raises the single controller vector.
pub struct Rh11 {
    cs1: u16,
    wc: u16,
    ba: u16,
    cs2: u16,
    asr: u16, // attention summary
    drives: Vec<Drive>,
}

impl Rh11 {
    pub fn new(images: Vec<Option<Vec<u8>>>) -> Self {
        let mut drives: Vec<Drive> = images.into_iter().map(Drive::new).collect();
        drives.resize_with(RH_UNITS, || Drive::new(None));
        Self {
            cs1: CS1_RDY,
            wc: 0,
            ba: 0,
            cs2: 0,
            asr: 0,
            drives,
        }
    }

    pub fn descriptor(&self) -> IoDescriptor {
        IoDescriptor {
            name: "RH11",
            csr_addr: RH_CSR_ADDR,
            nregs: RH_NREGS,
            br_level: RH_IPL,
            vectors: vec![RH_VECTOR],
        }
    }

    pub fn reset(&mut self, ctx: &mut IoCtx) {
        self.cs1 = CS1_RDY;
        self.wc = 0;
        self.ba = 0;
        self.cs2 = 0;
        self.asr = 0;
        for unit in 0..RH_UNITS {
            ctx.cancel(DevTimer::Transfer(unit));
            let drive = &mut self.drives[unit];
            drive.er1 = 0;
            if drive.image.is_some() {
                drive.ds = DS_MOL | DS_DPR | DS_DRY;
            }
        }
    }

    fn unit(&self) -> usize {
        (self.cs2 & CS2_UNIT) as usize
    }

    fn update_sc(&mut self) {
        let err = self.cs1 & CS1_TRE != 0 || self.asr != 0;
        if err {
            self.cs1 |= CS1_SC;
        } else {
            self.cs1 &= !CS1_SC;
        }
    }

    fn block_of(drive: &Drive) -> Option<u32> {
        let cylinder = drive.dc as u32;
        let track = (drive.da >> 8) as u32;
        let sector = (drive.da & 0o377) as u32;
        if cylinder >= RP_CYLINDERS || track >= RP_TRACKS || sector >= RP_SECTORS {
            return None;
        }
        Some((cylinder * RP_TRACKS + track) * RP_SECTORS + sector)
    }

    fn advance_address(drive: &mut Drive) {
        let mut sector = (drive.da & 0o377) as u32 + 1;
        let mut track = (drive.da >> 8) as u32;
        let mut cylinder = drive.dc as u32;
        if sector >= RP_SECTORS {
            sector = 0;
            track += 1;
            if track >= RP_TRACKS {
                track = 0;
                cylinder += 1;
            }
        }
        drive.da = ((track as u16) << 8) | sector as u16;
        drive.dc = cylinder as u16;
    }

    fn start_function(&mut self, ctx: &mut IoCtx) {
        let unit = self.unit();
        let func = (self.cs1 & CS1_FUNC) >> 1;
        if self.drives[unit].image.is_none() {
            self.cs2 |= CS2_NED;
            self.cs1 |= CS1_TRE;
            self.finish(ctx, false);
            return;
        }
        trace!("RH11: unit {unit} function {:02o}", func);
        match func {
            FN_NOP | FN_RELEASE => self.finish(ctx, false),
            FN_SEEK | FN_SEARCH | FN_RECAL => {
                // Positioning completes with drive attention.
                self.drives[unit].ds |= DS_ATA;
                self.asr |= 1 << unit;
                self.finish(ctx, true);
            }
            FN_DCLR => {
                self.drives[unit].er1 = 0;
                self.drives[unit].ds &= !(DS_ATA | DS_ERR);
                self.asr &= !(1 << unit);
                self.finish(ctx, false);
            }
            FN_PRESET | FN_PACKACK => {
                self.drives[unit].ds |= DS_VV;
                self.drives[unit].da = 0;
                self.drives[unit].dc = 0;
                self.finish(ctx, false);
            }
            FN_READ | FN_WRITE | FN_WCHK => {
                self.cs1 &= !CS1_RDY;
                ctx.schedule(DevTimer::Transfer(unit), XFER_DELAY);
            }
            _ => {
                warn!("RH11: unimplemented function {:02o}", func);
                self.cs1 |= CS1_TRE;
                self.finish(ctx, false);
            }
        }
    }

    /// Function completion: controller ready, optional interrupt.
    fn finish(&mut self, ctx: &mut IoCtx, _attention: bool) {
        self.cs1 = (self.cs1 & !CS1_GO) | CS1_RDY;
        self.update_sc();
        if self.cs1 & CS1_IE != 0 {
            ctx.raise(0);
        }
    }

    fn do_transfer(&mut self, unit: usize, dma: &mut dyn DmaBus) {
        let func = (self.cs1 & CS1_FUNC) >> 1;
        let count_words = (0x10000 - self.wc as u32) & 0xFFFF;
        let mut remaining = count_words as usize;
        let mut bus_addr = ((self.cs1 as u32 & 0o1400) << 8) | self.ba as u32;

        while remaining > 0 {
            let Some(block) = Self::block_of(&self.drives[unit]) else {
                self.drives[unit].er1 |= ER1_IAE;
                self.drives[unit].ds |= DS_ERR | DS_ATA;
                self.asr |= 1 << unit;
                self.cs1 |= CS1_TRE;
                break;
            };
            let offset = (block * SECTOR_BYTES) as usize;
            let image = self.drives[unit].image.as_mut().unwrap();
            if offset + SECTOR_BYTES as usize > image.len() {
                self.drives[unit].er1 |= ER1_AOE;
                self.drives[unit].ds |= DS_ERR | DS_ATA;
                self.asr |= 1 << unit;
                self.cs1 |= CS1_TRE;
                break;
            }
            let words_now = remaining.min(SECTOR_BYTES as usize / 2);
            match func {
                FN_READ => {
                    let words: Vec<u16> = image[offset..offset + words_now * 2]
                        .chunks_exact(2)
                        .map(|c| c[0] as u16 | ((c[1] as u16) << 8))
                        .collect();
                    if dma.write_block(bus_addr, &words) != 0 {
                        self.cs2 |= CS2_NEM;
                        self.cs1 |= CS1_TRE;
                        break;
                    }
                }
                FN_WRITE => {
                    let mut words = vec![0u16; words_now];
                    if dma.read_block(bus_addr, &mut words) != 0 {
                        self.cs2 |= CS2_NEM;
                        self.cs1 |= CS1_TRE;
                        break;
                    }
                    for (k, w) in words.iter().enumerate() {
                        image[offset + 2 * k] = *w as u8;
                        image[offset + 2 * k + 1] = (*w >> 8) as u8;
                    }
                    // Zero-fill a partial final sector.
                    for k in words_now * 2..SECTOR_BYTES as usize {
                        image[offset + k] = 0;
                    }
                }
                _ => {
                    // Write check: compare drive data against memory.
                    let mut words = vec![0u16; words_now];
                    if dma.read_block(bus_addr, &mut words) != 0 {
                        self.cs2 |= CS2_NEM;
                        self.cs1 |= CS1_TRE;
                        break;
                    }
                    let same = image[offset..offset + words_now * 2]
                        .chunks_exact(2)
                        .map(|c| c[0] as u16 | ((c[1] as u16) << 8))
                        .eq(words.iter().copied());
                    if !same {
                        self.cs2 |= CS2_WCE;
                        self.cs1 |= CS1_TRE;
                        break;
                    }
                }
            }
            remaining -= words_now;
            bus_addr += (words_now * 2) as u32;
            Self::advance_address(&mut self.drives[unit]);
        }

        // Leave the registers where the transfer stopped.
        let moved = count_words as usize - remaining;
        self.wc = self.wc.wrapping_add(moved as u16);
        self.ba = bus_addr as u16;
        self.cs1 = (self.cs1 & !0o1400) | (((bus_addr >> 8) & 0o1400) as u16);
        debug!(
            "RH11: unit {unit} {} {moved} words, {} remaining",
            if func == FN_READ { "read" } else { "wrote" },
            remaining
        );
    }

    pub fn read(&mut self, reg: u32, _ctx: &mut IoCtx) -> Result<u16, Nxd> {
        let unit = self.unit();
        let drive = &self.drives[unit];
        Ok(match reg {
            0o00 => self.cs1,
            0o02 => self.wc,
            0o04 => self.ba,
            0o06 => drive.da,
            0o10 => self.cs2,
            0o12 => drive.ds,
            0o14 => drive.er1,
            0o16 => self.asr,
            0o20 => 0, // look-ahead
            0o22 => 0, // data buffer
            0o24 => 0, // maintenance
            0o26 => DT_RP06,
            0o30 => 0o1000 + unit as u16, // serial number
            0o32 => drive.of,
            0o34 => drive.dc,
            0o36 | 0o40 | 0o42 | 0o44 | 0o46 => 0,
            _ => return Err(Nxd),
        })
    }

    pub fn write(&mut self, reg: u32, data: u16, _byte: bool, ctx: &mut IoCtx) -> Result<(), Nxd> {
        let unit = self.unit();
        match reg & !1 {
            0o00 => {
                self.cs1 = (self.cs1 & !(CS1_IE | CS1_FUNC | 0o1400))
                    | (data & (CS1_IE | CS1_FUNC | 0o1400));
                if data & CS1_GO != 0 {
                    self.cs1 |= CS1_GO;
                    self.start_function(ctx);
                } else if data & CS1_IE != 0 && self.cs1 & CS1_RDY != 0 {
                    // Setting IE with the controller idle interrupts
                    // immediately (software interrupt convention).
                    ctx.raise(0);
                }
            }
            0o02 => self.wc = data,
            0o04 => self.ba = data & !1,
            0o06 => self.drives[unit].da = data,
            0o10 => {
                if data & CS2_CLR != 0 {
                    self.reset(ctx);
                } else {
                    self.cs2 = (self.cs2 & !CS2_UNIT) | (data & CS2_UNIT);
                }
            }
            0o14 => self.drives[unit].er1 = 0,
            0o16 => {
                // Attention summary: write-one-to-clear per drive.
                self.asr &= !data;
                for u in 0..RH_UNITS {
                    if data & (1 << u) != 0 {
                        self.drives[u].ds &= !DS_ATA;
                    }
                }
                self.update_sc();
            }
            0o32 => self.drives[unit].of = data,
            0o34 => self.drives[unit].dc = data,
            0o20 | 0o22 | 0o24 | 0o26 | 0o30 | 0o36 | 0o40 | 0o42 | 0o44 | 0o46 => {}
            _ => return Err(Nxd),
        }
        Ok(())
    }

    pub fn event(&mut self, timer: DevTimer, ctx: &mut IoCtx) {
        if let DevTimer::Transfer(unit) = timer {
            self.do_transfer(unit, ctx.dma);
            self.finish(ctx, false);
        }
    }

    pub fn poll(&mut self, _ctx: &mut IoCtx) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::Clock;
    use crate::devices::{IoEvent, IrqOp};
    use crate::pdp10::memory::PhysMemory;
    use crate::pdp10::uba::{Uba, UbaDma};

    struct Rig {
        rh: Rh11,
        uba: Uba,
        mem: PhysMemory,
        clock: Clock<IoEvent>,
    }

    fn rig(image: Vec<u8>) -> Rig {
        let mut uba = Uba::new();
        // Identity map slot 0 -> page 0 etc.
        for k in 0..8u32 {
            uba.write_internal(1, 0o763000 + k as u64, (0o40000 | k) as u64);
        }
        Rig {
            rh: Rh11::new(vec![Some(image)]),
            uba,
            mem: PhysMemory::new(64),
            clock: Clock::new(),
        }
    }

    fn with_ctx<R>(r: &mut Rig, f: impl FnOnce(&mut Rh11, &mut IoCtx) -> R) -> (R, Vec<IrqOp>) {
        let mut irqs = Vec::new();
        let mut dma = UbaDma {
            slot: &mut r.uba.slots[1],
            mem: &mut r.mem,
        };
        let mut ctx = IoCtx {
            slot: 0,
            clock: &mut r.clock,
            irqs: &mut irqs,
            dma: &mut dma,
        };
        let out = f(&mut r.rh, &mut ctx);
        (out, irqs)
    }

    #[test]
    fn read_transfers_sector_to_memory() {
        let mut image = vec![0u8; 4 * SECTOR_BYTES as usize];
        image[0] = 0x34;
        image[1] = 0x12;
        image[2] = 0x78;
        image[3] = 0x56;
        let mut r = rig(image);

        let ((), irqs) = with_ctx(&mut r, |rh, ctx| {
            rh.write(0o02, (0x10000u32 - 2) as u16, false, ctx).unwrap(); // 2 words
            rh.write(0o04, 0, false, ctx).unwrap();
            rh.write(0o00, (FN_READ << 1) | CS1_GO | CS1_IE, false, ctx).unwrap();
            assert_eq!(rh.cs1 & CS1_RDY, 0);
            rh.event(DevTimer::Transfer(0), ctx);
            assert_ne!(rh.cs1 & CS1_RDY, 0);
            assert_eq!(rh.wc, 0);
        });
        // Words land as 18-bit halves through the Unibus map.
        assert_eq!(r.mem.peek(0) >> 18, 0x1234);
        assert_eq!(r.mem.peek(0) & 0o777777, 0x5678);
        assert!(irqs.iter().any(|op| matches!(op, IrqOp::Raise(0))));
    }

    #[test]
    fn write_roundtrip() {
        let mut r = rig(vec![0u8; 4 * SECTOR_BYTES as usize]);
        // Stage two Unibus words in memory.
        r.mem.poke(0, ((0xAAAA as u64) << 18) | 0xBBBB);
        let ((), _) = with_ctx(&mut r, |rh, ctx| {
            rh.write(0o02, (0x10000u32 - 2) as u16, false, ctx).unwrap();
            rh.write(0o04, 0, false, ctx).unwrap();
            rh.write(0o00, (FN_WRITE << 1) | CS1_GO, false, ctx).unwrap();
            rh.event(DevTimer::Transfer(0), ctx);
        });
        assert_eq!(r.rh.drives[0].image.as_ref().unwrap()[..4], [0xAA, 0xAA, 0xBB, 0xBB]);
    }

    #[test]
    fn seek_raises_attention() {
        let mut r = rig(vec![0u8; SECTOR_BYTES as usize]);
        let ((), irqs) = with_ctx(&mut r, |rh, ctx| {
            rh.write(0o34, 5, false, ctx).unwrap(); // cylinder
            rh.write(0o00, (FN_SEEK << 1) | CS1_GO | CS1_IE, false, ctx).unwrap();
            assert_ne!(rh.asr & 1, 0);
            assert_ne!(rh.read(0o12, ctx).unwrap() & DS_ATA, 0);
            // Attention summary clears write-one.
            rh.write(0o16, 1, false, ctx).unwrap();
            assert_eq!(rh.asr, 0);
        });
        assert!(irqs.iter().any(|op| matches!(op, IrqOp::Raise(0))));
    }

    #[test]
    fn missing_drive_sets_ned() {
        let mut r = rig(vec![0u8; SECTOR_BYTES as usize]);
        let ((), _) = with_ctx(&mut r, |rh, ctx| {
            rh.write(0o10, 3, false, ctx).unwrap(); // select empty unit 3
            rh.write(0o00, (FN_READ << 1) | CS1_GO, false, ctx).unwrap();
            assert_ne!(rh.cs2 & CS2_NED, 0);
            assert_ne!(rh.cs1 & CS1_TRE, 0);
        });
    }
}
