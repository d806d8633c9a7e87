use crate::core::console::{Console, ConsoleEvent};
use crate::core::clock::Clock;
use crate::devices::IoEvent;
use crate::pdp10::apr::{Apr, APRF_CON_INT};
use crate::pdp10::memory::{core_dump_word, PhysMemory};
use crate::pdp10::word::{rh, xwd, Word};
use std::collections::VecDeque;
use tracing::{debug, info, warn};

// Front-end communication area in physical low memory: the 8080 console
// processor and the KS10 talk through these cells.
pub const FE_HALTSW: u32 = 0o030;
pub const FE_KASWD: u32 = 0o031;
pub const FE_CTYIWD: u32 = 0o032;
pub const FE_CTYOWD: u32 = 0o033;
pub const FE_BRH11BA: u32 = 0o036;
pub const FE_BDRVNUM: u32 = 0o037;
pub const FE_MTBFSN: u32 = 0o040;

// FE-FILE page 0 layout (word indices).
const FE_P0_MONITOR_PREBOOT: usize = 0o004;
const FE_BT_8080: usize = 0o103;

// Disk address word fields: cylinder / track / sector.
fn da_cyl(w: Word) -> u32 {
    ((w & 0o077700000000) >> 24) as u32
}
fn da_trk(w: Word) -> u32 {
    ((w & 0o000000017600) >> 7) as u32
}
fn da_sec(w: Word) -> u32 {
    (w & 0o000000000037) as u32
}

// RP06 geometry for FE-FILE disk address arithmetic.
const DSK_TRACKS: u32 = 19;
const DSK_SECTORS: u32 = 20;

/// Sector size in the "dbs5" packed image format: 128 words, 5 bytes each.
const SECTOR_WORDS: usize = 128;
const SECTOR_BYTES: usize = SECTOR_WORDS * 5;

const CTY_DELAY: u64 = 200;
const CTY_QDELAY: u64 = 200;

/// The KS10 console front end. Characters arrive over TCP and are handed
/// to the monitor one at a time through CTYIWD; output appears in CTYOWD
/// when the monitor strobes the APR interrupt-console flag.
pub struct FrontEnd {
    pub console: Option<Console>,
    in_queue: VecDeque<u8>,
}

impl FrontEnd {
    pub fn new(console: Option<Console>) -> Self {
        Self {
            console,
            in_queue: VecDeque::new(),
        }
    }

    /// Drain the console socket at the instruction boundary. Returns true
    /// when an APR flag changed and the PI system needs re-evaluation.
    pub fn poll(
        &mut self,
        mem: &mut PhysMemory,
        apr: &mut Apr,
        clock: &mut Clock<IoEvent>,
    ) -> bool {
        let mut wake = false;
        while let Some(event) = self.console.as_ref().and_then(|c| c.poll()) {
            match event {
                ConsoleEvent::Char(ch) => {
                    self.in_queue.push_back(ch);
                    wake |= self.deliver(mem, apr, clock);
                }
                ConsoleEvent::Connected => {
                    debug!("CTY: console connected");
                    // Flush any output the monitor queued while we were
                    // without a terminal.
                    self.output(mem, clock);
                }
                ConsoleEvent::Disconnected => {
                    debug!("CTY: console disconnected");
                }
                ConsoleEvent::HaltSwitch => {}
            }
        }
        wake
    }

    /// Move one queued character into CTYIWD if the monitor has consumed
    /// the previous one. More input re-arms the queue timer.
    fn deliver(&mut self, mem: &mut PhysMemory, apr: &mut Apr, clock: &mut Clock<IoEvent>) -> bool {
        if mem.peek(FE_CTYIWD) != 0 || self.in_queue.is_empty() {
            return false;
        }
        let ch = self.in_queue.pop_front().unwrap();
        mem.poke(FE_CTYIWD, (1 << 8) | ch as Word);
        let wake = apr.interrupt(APRF_CON_INT);
        if !self.in_queue.is_empty() {
            clock.schedule(IoEvent::ConsoleRxQueue, CTY_QDELAY);
        }
        wake
    }

    /// Queue-timer callback.
    pub fn rx_queue_tick(
        &mut self,
        mem: &mut PhysMemory,
        apr: &mut Apr,
        clock: &mut Clock<IoEvent>,
    ) -> bool {
        self.deliver(mem, apr, clock)
    }

    /// The monitor set the interrupt-console strobe: take the pending
    /// character out of CTYOWD and put it on the wire. Completion is a
    /// timer so the done interrupt trails the write.
    pub fn output(&mut self, mem: &mut PhysMemory, clock: &mut Clock<IoEvent>) {
        let word = mem.peek(FE_CTYOWD);
        if (word >> 8) & 0o377 != 1 {
            return;
        }
        let ch = (word & 0o177) as u8;
        if let Some(console) = &self.console {
            console.send(ch);
        }
        mem.poke(FE_CTYOWD, 0);
        clock.schedule(IoEvent::ConsoleTxDone, CTY_DELAY);
    }

    /// Transmit-done callback: tell the monitor the 8080 is ready again.
    pub fn tx_done(&mut self, mem: &mut PhysMemory, apr: &mut Apr, clock: &mut Clock<IoEvent>) -> bool {
        // Another character may already be waiting.
        self.output(mem, clock);
        apr.interrupt(APRF_CON_INT)
    }
}

/// Boot a "dbs5"-format disk image: find a HOM block, chase the 8080 disk
/// address to FE-FILE page 0, pull the monitor pre-boot loader out of it,
/// drop it at 01000 and hand back the start PC.
pub fn boot_disk(
    mem: &mut PhysMemory,
    image: &[u8],
    rh_csr: u32,
    uba_unit: u32,
    drive: u32,
) -> Result<Word, String> {
    let read_sector = |block: u32, out: &mut [Word]| -> Result<(), String> {
        let start = block as usize * SECTOR_BYTES;
        let end = start + SECTOR_BYTES;
        if end > image.len() {
            return Err(format!("disk image too short for block {block}"));
        }
        for (idx, group) in image[start..end].chunks_exact(5).enumerate() {
            out[idx] = core_dump_word(group);
        }
        Ok(())
    };

    let id_home = xwd(0o505755, 0); // SIXBIT/HOM/ left-justified

    let mut block = [0 as Word; SECTOR_WORDS];
    info!("Reading first HOME block...");
    read_sector(1, &mut block)?;
    if block[0] & 0o777777000000 != id_home {
        info!("Reading second HOME block...");
        read_sector(10, &mut block)?;
        if block[0] & 0o777777000000 != id_home {
            return Err("both HOME blocks not found".to_string());
        }
    }

    // Disk address of FE-FILE page 0.
    let da = block[FE_BT_8080];
    if da == 0 {
        return Err("disk is not bootable (no 8080 address)".to_string());
    }
    let fe_block = (da_cyl(da) * DSK_TRACKS + da_trk(da)) * DSK_SECTORS + da_sec(da);
    let mut fe_page = [0 as Word; SECTOR_WORDS * 4];
    for idx in 0..4 {
        read_sector(fe_block + idx as u32, &mut fe_page[idx * SECTOR_WORDS..][..SECTOR_WORDS])?;
    }

    // Pre-boot loader pointer inside FE-FILE page 0.
    let da = fe_page[FE_P0_MONITOR_PREBOOT];
    if da == 0 {
        return Err("pre-boot loader not available".to_string());
    }
    let boot_block = (da_cyl(da) * DSK_TRACKS + da_trk(da)) * DSK_SECTORS + da_sec(da);
    info!("Reading pre-boot loader at block {boot_block}...");
    let mut loader = [0 as Word; SECTOR_WORDS * 4];
    for idx in 0..4 {
        read_sector(boot_block + idx as u32, &mut loader[idx * SECTOR_WORDS..][..SECTOR_WORDS])?;
    }
    for (offset, word) in loader.iter().enumerate().take(256) {
        mem.poke(0o1000 + offset as u32, *word);
    }

    mem.poke(FE_BRH11BA, xwd(uba_unit as Word, rh_csr as Word));
    mem.poke(FE_BDRVNUM, drive as Word);
    info!("Running...");
    Ok(0o1000)
}

/// Boot a SIMH-format (.tap) magtape image: position past `file` file
/// marks, read one record of up to 32 KB, convert its 5-byte core-dump
/// groups into words at 01000.
pub fn boot_tape(
    mem: &mut PhysMemory,
    image: &[u8],
    rh_csr: u32,
    uba_unit: u32,
    drive: u32,
    file: usize,
) -> Result<Word, String> {
    let mut pos = 0usize;
    let record_len = |pos: usize| -> Option<usize> {
        image
            .get(pos..pos + 4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
    };

    // Skip leading files (a zero length is a tape mark).
    for _ in 0..file {
        loop {
            let len = record_len(pos).ok_or("tape image exhausted while skipping")?;
            pos += 4;
            if len == 0 {
                break;
            }
            pos += (len + 1) & !1; // records are padded to even length
            pos += 4;
        }
    }

    let len = record_len(pos).ok_or("tape image exhausted at boot record")?;
    if len == 0 || len > 32768 {
        return Err(format!("bad boot record length {len}"));
    }
    let data = image
        .get(pos + 4..pos + 4 + len)
        .ok_or("tape image truncated")?;

    let mut addr = 0o1000u32;
    for group in data.chunks_exact(5) {
        mem.poke(addr, core_dump_word(group));
        addr += 1;
    }
    if data.len() % 5 != 0 {
        warn!("BOOT: tape record length {} not a multiple of 5", data.len());
    }
    info!("BOOT: loaded {} words from tape", addr - 0o1000);

    mem.poke(FE_BRH11BA, xwd(uba_unit as Word, rh_csr as Word));
    mem.poke(FE_BDRVNUM, rh(drive as Word & 0o377));
    mem.poke(FE_MTBFSN, (drive >> 8) as Word);
    info!("Running...");
    Ok(0o1000)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pack(words: &[Word]) -> Vec<u8> {
        let mut out = Vec::new();
        for w in words {
            out.push(((w >> 28) & 0xFF) as u8);
            out.push(((w >> 20) & 0xFF) as u8);
            out.push(((w >> 12) & 0xFF) as u8);
            out.push(((w >> 4) & 0xFF) as u8);
            out.push((w & 0o17) as u8);
        }
        out
    }

    #[test]
    fn console_input_hands_one_char_at_a_time() {
        let mut mem = PhysMemory::new(8);
        let mut apr = Apr::new();
        let mut clock = Clock::new();
        let mut fe = FrontEnd::new(None);

        fe.in_queue.push_back(b'A');
        fe.in_queue.push_back(b'B');
        assert!(!fe.deliver(&mut mem, &mut apr, &mut clock));
        assert_eq!(mem.peek(FE_CTYIWD), (1 << 8) | b'A' as Word);
        // Second character waits for the monitor to clear the word.
        assert!(clock.is_scheduled(IoEvent::ConsoleRxQueue));
        assert!(!fe.rx_queue_tick(&mut mem, &mut apr, &mut clock));
        assert_eq!(mem.peek(FE_CTYIWD), (1 << 8) | b'A' as Word);

        mem.poke(FE_CTYIWD, 0);
        fe.rx_queue_tick(&mut mem, &mut apr, &mut clock);
        assert_eq!(mem.peek(FE_CTYIWD), (1 << 8) | b'B' as Word);
    }

    #[test]
    fn console_output_clears_word_and_arms_done() {
        let mut mem = PhysMemory::new(8);
        let mut clock = Clock::new();
        let mut fe = FrontEnd::new(None);

        mem.poke(FE_CTYOWD, (1 << 8) | b'X' as Word);
        fe.output(&mut mem, &mut clock);
        assert_eq!(mem.peek(FE_CTYOWD), 0);
        assert!(clock.is_scheduled(IoEvent::ConsoleTxDone));
    }

    #[test]
    fn tape_boot_loads_at_01000() {
        let mut mem = PhysMemory::new(16);
        // One record holding two words, preceded by nothing.
        let words = pack(&[0o254000001000, 0o123456654321]);
        let mut tap = Vec::new();
        tap.extend_from_slice(&(words.len() as u32).to_le_bytes());
        tap.extend_from_slice(&words);
        tap.extend_from_slice(&(words.len() as u32).to_le_bytes());

        let pc = boot_tape(&mut mem, &tap, 0o776700, 1, 0, 0).unwrap();
        assert_eq!(pc, 0o1000);
        assert_eq!(mem.peek(0o1000), 0o254000001000);
        assert_eq!(mem.peek(0o1001), 0o123456654321);
        assert_eq!(mem.peek(FE_BRH11BA), xwd(1, 0o776700));
    }

    #[test]
    fn disk_boot_chases_hom_block() {
        let mut mem = PhysMemory::new(32);
        // Build a tiny image: 64 sectors.
        let mut sectors = vec![[0 as Word; SECTOR_WORDS]; 64];
        // HOM block at 1.
        sectors[1][0] = xwd(0o505755, 0);
        // 8080 pointer -> cyl 0 trk 0 sec 2.
        sectors[1][FE_BT_8080] = 2;
        // FE-FILE page 0 at sectors 2..6; monitor pre-boot pointer -> sec 6.
        sectors[2][FE_P0_MONITOR_PREBOOT] = 6;
        // Loader content at sectors 6..10.
        sectors[6][0] = 0o254000002000; // JRST 2000
        let image: Vec<u8> = sectors.iter().flat_map(|s| pack(s)).collect();

        let pc = boot_disk(&mut mem, &image, 0o776700, 1, 0).unwrap();
        assert_eq!(pc, 0o1000);
        assert_eq!(mem.peek(0o1000), 0o254000002000);
    }
}
