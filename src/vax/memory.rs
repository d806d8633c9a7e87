use tracing::{info, warn};

pub const MAX_MEMORY_MB: usize = 64;

/// Boot ROM window (KA630: 128 KB at 0x20040000).
pub const ROM_BASE: u32 = 0x2004_0000;
pub const ROM_SIZE: u32 = 0x0002_0000;

/// Start of the IO space: everything at or above routes off local memory.
pub const IO_BASE: u32 = 0x2000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoMemory(pub u32);

/// Byte-addressed local memory plus the boot ROM overlay. Writes into the
/// ROM window are silently dropped (KA630 behavior) and latch a machine-
/// check indicator the processor reads at its leisure.
pub struct PhysMemory {
    bytes: Vec<u8>,
    rom: Vec<u8>,
    pub rom_write_latch: bool,
}

impl PhysMemory {
    pub fn new(size_mb: usize) -> Self {
        let size_mb = size_mb.min(MAX_MEMORY_MB);
        Self {
            bytes: vec![0; size_mb * 1024 * 1024],
            rom: vec![0; ROM_SIZE as usize],
            rom_write_latch: false,
        }
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn load_rom(&mut self, image: &[u8]) {
        let len = image.len().min(self.rom.len());
        self.rom[..len].copy_from_slice(&image[..len]);
        info!(
            "Loaded boot ROM ({} bytes) MD5: {:x}",
            len,
            md5::compute(&image[..len])
        );
    }

    fn in_rom(addr: u32) -> bool {
        (ROM_BASE..ROM_BASE + ROM_SIZE).contains(&addr)
    }

    /// Whether an address falls in the ROM window (which sits inside the
    /// IO region but is served by the memory model).
    pub fn rom_covers(addr: u32) -> bool {
        Self::in_rom(addr)
    }

    pub fn read_byte(&self, addr: u32) -> Result<u8, NoMemory> {
        if Self::in_rom(addr) {
            return Ok(self.rom[(addr - ROM_BASE) as usize]);
        }
        self.bytes
            .get(addr as usize)
            .copied()
            .ok_or(NoMemory(addr))
    }

    pub fn write_byte(&mut self, addr: u32, value: u8) -> Result<(), NoMemory> {
        if Self::in_rom(addr) {
            // ROM ignores writes; the latch lets the CPU flag the machine
            // check its microcode would raise.
            warn!("MEM: write to ROM at {addr:08X} dropped");
            self.rom_write_latch = true;
            return Ok(());
        }
        match self.bytes.get_mut(addr as usize) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(NoMemory(addr)),
        }
    }

    pub fn read(&self, addr: u32, size: u32) -> Result<u32, NoMemory> {
        let mut value = 0u32;
        for k in 0..size {
            value |= (self.read_byte(addr + k)? as u32) << (8 * k);
        }
        Ok(value)
    }

    pub fn write(&mut self, addr: u32, size: u32, value: u32) -> Result<(), NoMemory> {
        for k in 0..size {
            self.write_byte(addr + k, (value >> (8 * k)) as u8)?;
        }
        Ok(())
    }

    /// Fault-free accessors for DMA after map validation.
    pub fn peek(&self, addr: u32, size: u32) -> u32 {
        self.read(addr, size).unwrap_or(0)
    }

    pub fn poke(&mut self, addr: u32, size: u32, value: u32) {
        let _ = self.write(addr, size, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn little_endian_longs() {
        let mut mem = PhysMemory::new(1);
        mem.write(0x100, 4, 0x1122_3344).unwrap();
        assert_eq!(mem.read_byte(0x100).unwrap(), 0x44);
        assert_eq!(mem.read(0x100, 4).unwrap(), 0x1122_3344);
        assert_eq!(mem.read(0x101, 2).unwrap(), 0x2233);
    }

    #[test]
    fn nxm_reported() {
        let mem = PhysMemory::new(1);
        assert_eq!(mem.read(0x10_0000, 4), Err(NoMemory(0x10_0000)));
    }

    #[test]
    fn rom_reads_back_and_drops_writes() {
        let mut mem = PhysMemory::new(1);
        mem.load_rom(&[0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(mem.read(ROM_BASE, 4).unwrap(), 0xDDCC_BBAA);
        mem.write(ROM_BASE, 4, 0).unwrap();
        assert_eq!(mem.read(ROM_BASE, 4).unwrap(), 0xDDCC_BBAA);
        assert!(mem.rom_write_latch);
    }
}
