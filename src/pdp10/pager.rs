use crate::pdp10::memory::{NoMemory, PhysMemory};
use crate::pdp10::word::{lh, rh, Word, HALF_ONES};
use tracing::{debug, trace};

// EBR fields.
const EBR_TOPS20_PAGING: Word = 0o040000;
const EBR_ENA_PAGER: Word = 0o020000;
const EBR_EXEC_BASE_ADDR: Word = 0o003777;

// UBR fields.
const UBR_SEL_AC_BLOCKS: Word = 0o400000000000;
const UBR_LD_USER_BASE_ADDR: Word = 0o100000000000;
const UBR_CUR_AC_BLOCK: Word = 0o007000000000;
const UBR_PREV_AC_BLOCK: Word = 0o000700000000;
const UBR_USER_BASE_ADDR: Word = 0o000000003777;
const UBR_ACB_MASK: Word = 0o407700000000;
const UBR_UADDR_MASK: Word = 0o100000017777;

// TOPS-10 (KI-style) PTE bits, one PTE per half-word.
const PTE_T10_ACCESS: Word = 0o400000;
const PTE_T10_WRITABLE: Word = 0o100000;
const PTE_T10_SOFTWARE: Word = 0o040000;
const PTE_T10_CACHE: Word = 0o020000;

// TOPS-20 (KL-style) PTE fields.
const PTE_T20_ACCESS: Word = 0o700000000000;
const PTE_T20_WRITE: Word = 0o020000000000;
const PTE_T20_CACHE: Word = 0o004000000000;
const PTE_T20_STM: Word = 0o000077000000; // storage medium
const PTE_T20_PIDX: Word = 0o000777000000;
const PTE_T20_SIDX: Word = 0o000000777777;
const PTE_T20_PNUM: Word = 0o000000017777;
const PTE_T20_P_ACCESS: u32 = 33;

const PTR_IMMEDIATE: Word = 1;
const PTR_SHARED: Word = 2;
const PTR_INDIRECT: Word = 3;

// Core Status Table fields.
const CST_AGE: Word = 0o770000000000;
const CST_MODIFIED: Word = 0o000000000001;

// Page fail word, left half.
pub const PFW_USER: Word = 0o400000;
pub const PFW_HARD: Word = 0o200000;
pub const PFW_T10_ACCESS: Word = 0o100000;
pub const PFW_T10_WRITE: Word = 0o040000;
pub const PFW_T10_SOFTWARE: Word = 0o020000;
pub const PFW_T20_DONE: Word = 0o100000;
pub const PFW_T20_MODIFIED: Word = 0o040000;
pub const PFW_T20_WRITE: Word = 0o020000;
pub const PFW_WRITE: Word = 0o010000;
pub const PFW_CACHE: Word = 0o002000;
pub const PFW_PAGED: Word = 0o001000;
pub const PFW_IO: Word = 0o000200;
pub const PFW_BYTE: Word = 0o000020;
pub const PFW_PHYSICAL: Word = 0o160000;
pub const PFW_NXM: Word = 0o370000;

// Process table cells.
pub const T10_UPT_PF_WORD: u32 = 0o500;
pub const T10_UPT_PF_OLD_PC: u32 = 0o501;
pub const T10_UPT_PF_NEW_PC: u32 = 0o502;
pub const T20_UPT_PF_WORD: u32 = 0o500;
pub const T20_UPT_PF_FLAGS: u32 = 0o501;
pub const T20_UPT_PF_OLD_PC: u32 = 0o502;
pub const T20_UPT_PF_NEW_PC: u32 = 0o503;
pub const T20_SECTION: u32 = 0o540;
pub const EPT_PI_BASE: u32 = 0o040;
pub const EPT_UBA_BASE: u32 = 0o100;
pub const EPT_TRAP_BASE: u32 = 0o420;
pub const UPT_TRAP_BASE: u32 = 0o420;
pub const UPT_MUUO: u32 = 0o424;
pub const UPT_MUUO_OLD_PC: u32 = 0o425;
pub const UPT_MUUO_NEW_PC: u32 = 0o430;

// Reference attribute bits passed with every virtual access.
pub const PTF_WRITE: u32 = 0o1;
pub const PTF_MAP: u32 = 0o2;
pub const PTF_USER: u32 = 0o10;
pub const PTF_PREV: u32 = 0o20;
pub const PTF_NOTRAP: u32 = 0o100;
pub const PTF_IOBYTE: u32 = 0o1000;
pub const PTF_CONSOLE: u32 = 0o2000;
pub const PTF_BLT: u32 = 0o4000;

// Translation cache entry: valid/writable + 11-bit frame.
const CACHE_VALID: u32 = 0x8000_0000;
const CACHE_USER: u32 = 0x4000_0000;
const CACHE_MODIFIED: u32 = 0x2000_0000;
const CACHE_FRAME: u32 = 0o3777;

/// Outcome of a failed translation. `PageFail` means the PFW has been
/// built; `Nxm` additionally wants the APR no-memory flag raised by the
/// caller before the trap is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refill {
    PageFail,
    Nxm(u32),
}

/// The KS10 pager: base registers, both paging-mode table walks, and the
/// per-space translation caches. The CPU asks it to resolve every virtual
/// reference; a failed resolve leaves the page-fail word here for the trap
/// path to store into the process table.
pub struct Pager {
    pub enabled: bool,
    pub tops20: bool,
    pub ebr: Word,
    pub ubr: Word,
    pub spb: Word,
    pub csb: Word,
    pub cstm: Word,
    pub pur: Word,
    pub hsb: Word,
    pub ept_addr: u32,
    pub upt_addr: u32,
    spt_addr: u32,
    cst_addr: u32,
    pub cur_block: usize,
    pub prev_block: usize,
    exec_cache: [u32; 512],
    user_cache: [u32; 512],
    lh_pfw: Word,
    rh_pfw: Word,
    pub pfw: Word,
}

impl Pager {
    pub fn new() -> Self {
        Self {
            enabled: false,
            tops20: false,
            ebr: 0,
            ubr: 0,
            spb: 0,
            csb: 0,
            cstm: 0,
            pur: 0,
            hsb: 0o376000,
            ept_addr: 0,
            upt_addr: 0,
            spt_addr: 0,
            cst_addr: 0,
            cur_block: 0,
            prev_block: 0,
            exec_cache: [0; 512],
            user_cache: [0; 512],
            lh_pfw: 0,
            rh_pfw: 0,
            pfw: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn clear_cache(&mut self) {
        self.exec_cache = [0; 512];
        self.user_cache = [0; 512];
    }

    /// WREBR: decode pager enable, paging mode and EPT base, then flush.
    pub fn write_ebr(&mut self, value: Word) {
        self.ebr = value & (EBR_TOPS20_PAGING | EBR_ENA_PAGER | EBR_EXEC_BASE_ADDR);
        self.enabled = (self.ebr & EBR_ENA_PAGER) != 0;
        self.tops20 = (self.ebr & EBR_TOPS20_PAGING) != 0;
        self.ept_addr = ((self.ebr & EBR_EXEC_BASE_ADDR) << 9) as u32;
        self.clear_cache();
        debug!(
            "PAGER: EBR <- {:06o}, EPT <- {:o}, pager {} ({} paging)",
            self.ebr,
            self.ept_addr,
            if self.enabled { "on" } else { "off" },
            if self.tops20 { "TOPS-20" } else { "TOPS-10" }
        );
    }

    pub fn read_ebr(&self) -> Word {
        self.ebr
    }

    /// WRUBR: optionally reselect AC blocks and/or reload the UPT base.
    /// A new UPT base invalidates every cached translation.
    pub fn write_ubr(&mut self, value: Word) {
        if (value & UBR_SEL_AC_BLOCKS) != 0 {
            self.ubr = (self.ubr & !UBR_ACB_MASK) | (value & UBR_ACB_MASK);
            self.cur_block = ((self.ubr & UBR_CUR_AC_BLOCK) >> 27) as usize;
            self.prev_block = ((self.ubr & UBR_PREV_AC_BLOCK) >> 24) as usize;
            debug!(
                "PAGER: AC blocks <- cur {} prev {}",
                self.cur_block, self.prev_block
            );
        }
        if (value & UBR_LD_USER_BASE_ADDR) != 0 {
            self.ubr = (self.ubr & !UBR_UADDR_MASK) | (value & UBR_UADDR_MASK);
            self.upt_addr = ((self.ubr & UBR_USER_BASE_ADDR) << 9) as u32;
            self.clear_cache();
            debug!("PAGER: UPT <- {:o}", self.upt_addr);
        }
    }

    pub fn read_ubr(&self) -> Word {
        self.ubr
    }

    pub fn write_spb(&mut self, value: Word) {
        self.spb = value;
        self.spt_addr = (value & 0o17777777) as u32;
        self.clear_cache();
    }

    pub fn write_csb(&mut self, value: Word) {
        self.csb = value;
        self.cst_addr = (value & 0o17777777) as u32;
        self.clear_cache();
    }

    pub fn write_cstm(&mut self, value: Word) {
        self.cstm = value;
    }

    pub fn write_pur(&mut self, value: Word) {
        self.pur = value;
    }

    /// CLRPT: drop one page's translation from both spaces.
    pub fn clear_page(&mut self, vaddr: Word) {
        let index = ((vaddr >> 9) & 0o777) as usize;
        self.exec_cache[index] = 0;
        self.user_cache[index] = 0;
    }

    /// Resolve a virtual word address to a physical one. On a hit the
    /// cached entry must also permit the access (a write through a clean
    /// entry re-walks so the CST modified bit gets set); on a miss the
    /// page tables are walked and, when cachable, the result installed.
    pub fn translate(
        &mut self,
        mem: &mut PhysMemory,
        vaddr: Word,
        mode: u32,
    ) -> Result<u32, Refill> {
        let vaddr = vaddr & HALF_ONES;
        if !self.enabled {
            return Ok(vaddr as u32);
        }
        let user = (mode & PTF_USER) != 0;
        let index = (vaddr >> 9) as usize;
        let entry = if user {
            self.user_cache[index]
        } else {
            self.exec_cache[index]
        };
        if (entry & CACHE_VALID) != 0
            && ((mode & PTF_WRITE) == 0 || (entry & CACHE_MODIFIED) != 0)
        {
            return Ok(((entry & CACHE_FRAME) << 9) | (vaddr as u32 & 0o777));
        }
        self.refill(mem, vaddr, mode)
    }

    /// MAP instruction: run the walk in probe mode and hand back the PFW.
    pub fn map(&mut self, mem: &mut PhysMemory, vaddr: Word, mode: u32) -> Word {
        if self.enabled {
            let _ = self.refill(mem, vaddr, mode | PTF_MAP);
        } else {
            self.lh_pfw = PFW_PHYSICAL;
            self.rh_pfw = vaddr & HALF_ONES;
            self.pfw = (self.lh_pfw << 18) | self.rh_pfw;
        }
        self.pfw
    }

    /// Build the NXM page-fail word for a physical reference that fell off
    /// the end of memory.
    pub fn nxm_fail(&mut self, addr: u32) {
        self.lh_pfw = PFW_NXM | PFW_PAGED;
        self.rh_pfw = addr as Word & HALF_ONES;
        self.pfw = (self.lh_pfw << 18) | self.rh_pfw;
    }

    /// Build the page-fail word for a bad IO-space reference (bus timeout).
    pub fn io_fail(&mut self, io_addr: Word, user: bool, byte: bool) {
        self.lh_pfw = PFW_HARD | PFW_PAGED | PFW_IO
            | if user { PFW_USER } else { 0 }
            | if byte { PFW_BYTE } else { 0 }
            | lh(io_addr);
        self.rh_pfw = rh(io_addr);
        self.pfw = (self.lh_pfw << 18) | self.rh_pfw;
    }

    fn pread(&mut self, mem: &mut PhysMemory, addr: u32) -> Result<Word, Refill> {
        mem.read(addr & 0o3777777).map_err(|NoMemory(a)| {
            self.nxm_fail(a);
            Refill::Nxm(a)
        })
    }

    fn pwrite(&mut self, mem: &mut PhysMemory, addr: u32, value: Word) -> Result<(), Refill> {
        mem.write(addr & 0o3777777, value).map_err(|NoMemory(a)| {
            self.nxm_fail(a);
            Refill::Nxm(a)
        })
    }

    fn fail(&mut self) -> Refill {
        self.pfw = (self.lh_pfw << 18) | self.rh_pfw;
        Refill::PageFail
    }

    /// Page-table walk, TOPS-20 or TOPS-10 according to EBR. Installs the
    /// translation in the cache on success (unless probing for MAP).
    fn refill(&mut self, mem: &mut PhysMemory, vaddr: Word, mode: u32) -> Result<u32, Refill> {
        self.lh_pfw = PFW_PAGED;
        self.rh_pfw = vaddr;
        if (mode & PTF_USER) != 0 {
            self.lh_pfw |= PFW_USER;
        }
        if (mode & PTF_WRITE) != 0 {
            self.lh_pfw |= PFW_WRITE;
        }

        let pt_page = if self.tops20 {
            self.refill_tops20(mem, vaddr)?
        } else {
            self.refill_tops10(mem, vaddr)?
        };

        self.rh_pfw = ((pt_page & 0o3777) << 9) | (vaddr & 0o777);
        self.pfw = (self.lh_pfw << 18) | self.rh_pfw;

        if (mode & PTF_MAP) == 0 && (self.lh_pfw & PFW_CACHE) != 0 {
            let mut entry = CACHE_VALID | ((self.rh_pfw >> 9) as u32 & CACHE_FRAME);
            if (self.lh_pfw & PFW_USER) != 0 {
                entry |= CACHE_USER;
            }
            if (self.lh_pfw & PFW_WRITE) != 0 {
                entry |= CACHE_MODIFIED;
            }
            let table = if (self.lh_pfw & PFW_USER) != 0 {
                &mut self.user_cache
            } else {
                &mut self.exec_cache
            };
            table[(vaddr >> 9) as usize] = entry;
        }
        trace!("PAGER: {:06o} -> {:08o}", vaddr, self.rh_pfw);
        Ok(self.rh_pfw as u32)
    }

    fn refill_tops20(&mut self, mem: &mut PhysMemory, vaddr: Word) -> Result<Word, Refill> {
        let mut access = PTE_T20_WRITE | PTE_T20_CACHE;
        let user = (self.lh_pfw & PFW_USER) != 0;

        // Phase I: the section pointer.
        let base = if user { self.upt_addr } else { self.ept_addr };
        let mut pt_page = self.pread(mem, base + T20_SECTION)?;
        loop {
            access &= pt_page | !(PTE_T20_WRITE | PTE_T20_CACHE);
            match (pt_page & PTE_T20_ACCESS) >> PTE_T20_P_ACCESS {
                PTR_IMMEDIATE => break,
                PTR_SHARED => {
                    let index = self.spt_addr + (pt_page & PTE_T20_SIDX) as u32;
                    pt_page = self.pread(mem, index)?;
                    break;
                }
                PTR_INDIRECT => {
                    let index = self.spt_addr + (pt_page & PTE_T20_SIDX) as u32;
                    pt_page = self.pread(mem, index)?;
                    if (pt_page & PTE_T20_STM) != 0 {
                        return Err(self.fail());
                    }
                    let index = ((pt_page & PTE_T20_PNUM) << 9) as u32;
                    pt_page = self.pread(mem, index)?;
                }
                _ => return Err(self.fail()),
            }
        }

        let mut pt_base = (((pt_page & PTE_T20_PNUM) << 9) | ((vaddr >> 9) & 0o777)) as u32;

        // Phase II: the map pointer.
        loop {
            if (pt_page & PTE_T20_STM) != 0 {
                return Err(self.fail());
            }
            self.touch_cst(mem, pt_page, false)?;
            pt_page = self.pread(mem, pt_base)?;
            access &= pt_page | !(PTE_T20_WRITE | PTE_T20_CACHE);
            match (pt_page & PTE_T20_ACCESS) >> PTE_T20_P_ACCESS {
                PTR_IMMEDIATE => break,
                PTR_SHARED => {
                    let index = self.spt_addr + (pt_page & PTE_T20_SIDX) as u32;
                    pt_page = self.pread(mem, index)?;
                    break;
                }
                PTR_INDIRECT => {
                    let index = ((pt_page & PTE_T20_PIDX) >> 18) as u32;
                    let base = self.spt_addr + (pt_page & PTE_T20_SIDX) as u32;
                    pt_page = self.pread(mem, base)?;
                    pt_base = (((pt_page & PTE_T20_PNUM) << 9) as u32) | index;
                }
                _ => return Err(self.fail()),
            }
        }

        // Phase III: the final pointer.
        if (pt_page & PTE_T20_STM) != 0 {
            return Err(self.fail());
        }
        self.lh_pfw |= PFW_T20_DONE;
        let writable = (access & PTE_T20_WRITE) != 0;
        if writable {
            self.lh_pfw |= PFW_T20_WRITE;
            if self.cst_addr != 0 && (self.lh_pfw & PFW_WRITE) != 0 {
                self.lh_pfw |= PFW_T20_MODIFIED;
            }
        } else if (self.lh_pfw & PFW_WRITE) != 0 {
            return Err(self.fail());
        }
        self.touch_cst(mem, pt_page, writable && (self.lh_pfw & PFW_WRITE) != 0)?;
        if (access & PTE_T20_CACHE) != 0 {
            self.lh_pfw |= PFW_CACHE;
        }
        Ok(pt_page & PTE_T20_PNUM)
    }

    /// Age-check and stamp the Core Status Table entry for a physical page.
    fn touch_cst(&mut self, mem: &mut PhysMemory, pt_page: Word, modify: bool) -> Result<(), Refill> {
        if self.cst_addr == 0 {
            return Ok(());
        }
        let addr = self.cst_addr + (pt_page & PTE_T20_PNUM) as u32;
        let data = self.pread(mem, addr)?;
        if (data & CST_AGE) == 0 {
            return Err(self.fail());
        }
        let mut data = (data & self.cstm) | self.pur;
        if modify {
            data |= CST_MODIFIED;
        }
        self.pwrite(mem, addr, data)
    }

    fn refill_tops10(&mut self, mem: &mut PhysMemory, vaddr: Word) -> Result<Word, Refill> {
        let page = (vaddr >> 9) & 0o777;
        let base = if (self.lh_pfw & PFW_USER) != 0 {
            self.upt_addr
        } else if page < 0o340 {
            self.ept_addr + 0o600
        } else if page < 0o400 {
            self.upt_addr + 0o220
        } else {
            self.ept_addr
        };
        let pair = self.pread(mem, base + (page >> 1) as u32)?;
        let pte = if page & 1 != 0 { rh(pair) } else { lh(pair) };

        if (pte & PTE_T10_ACCESS) == 0 {
            return Err(self.fail());
        }
        self.lh_pfw |= PFW_T10_ACCESS;
        if (pte & PTE_T10_CACHE) != 0 {
            self.lh_pfw |= PFW_CACHE;
        }
        if (pte & PTE_T10_SOFTWARE) != 0 {
            self.lh_pfw |= PFW_T10_SOFTWARE;
        }
        if (pte & PTE_T10_WRITABLE) != 0 {
            self.lh_pfw |= PFW_T10_WRITE;
        } else if (self.lh_pfw & PFW_WRITE) != 0 {
            return Err(self.fail());
        }
        Ok(pte)
    }

    /// After a failed reference: store PFW, flags and old PC into the
    /// process table, and hand back the new flags/PC word to resume at.
    pub fn deliver_page_fail(
        &mut self,
        mem: &mut PhysMemory,
        flags: Word,
        pc: Word,
    ) -> (Word, Word) {
        let upt = self.upt_addr;
        if self.tops20 {
            mem.poke(upt + T20_UPT_PF_WORD, self.pfw);
            mem.poke(upt + T20_UPT_PF_FLAGS, flags);
            mem.poke(upt + T20_UPT_PF_OLD_PC, pc & HALF_ONES);
            let new = mem.peek(upt + T20_UPT_PF_NEW_PC);
            (new & crate::pdp10::word::FLG_MASK, rh(new))
        } else {
            mem.poke(upt + T10_UPT_PF_WORD, self.pfw);
            mem.poke(upt + T10_UPT_PF_OLD_PC, flags | (pc & HALF_ONES));
            let new = mem.peek(upt + T10_UPT_PF_NEW_PC);
            (new & crate::pdp10::word::FLG_MASK, rh(new))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdp10::word::xwd;

    fn pager_with_t10(mem: &mut PhysMemory) -> Pager {
        let mut pager = Pager::new();
        // EPT at page 1, UPT at page 2, TOPS-10 paging on.
        pager.write_ebr(EBR_ENA_PAGER | 1);
        pager.write_ubr(UBR_LD_USER_BASE_ADDR | 2);
        let _ = mem;
        pager
    }

    #[test]
    fn disabled_pager_is_identity() {
        let mut mem = PhysMemory::new(64);
        let mut pager = Pager::new();
        assert_eq!(pager.translate(&mut mem, 0o1234, 0), Ok(0o1234));
    }

    #[test]
    fn tops10_user_translation_and_write_protect() {
        let mut mem = PhysMemory::new(512);
        let mut pager = pager_with_t10(&mut mem);

        // User page 0 -> frame 0o20, accessible but not writable;
        // user page 1 -> frame 0o21, writable.
        let even = PTE_T10_ACCESS | PTE_T10_CACHE | 0o20;
        let odd = PTE_T10_ACCESS | PTE_T10_WRITABLE | PTE_T10_CACHE | 0o21;
        mem.write(0o2000, xwd(even, odd)).unwrap();

        let pa = pager.translate(&mut mem, 0o123, PTF_USER).unwrap();
        assert_eq!(pa, (0o20 << 9) | 0o123);

        // Read again: served from cache.
        let pa2 = pager.translate(&mut mem, 0o123, PTF_USER).unwrap();
        assert_eq!(pa, pa2);

        // Write to the read-only page fails with the T10 access bits set.
        assert_eq!(
            pager.translate(&mut mem, 0o123, PTF_USER | PTF_WRITE),
            Err(Refill::PageFail)
        );
        assert_ne!(pager.pfw & ((PFW_T10_ACCESS | PFW_WRITE) << 18), 0);

        // Write to the writable odd page succeeds.
        let pa = pager
            .translate(&mut mem, (1 << 9) | 0o177, PTF_USER | PTF_WRITE)
            .unwrap();
        assert_eq!(pa, (0o21 << 9) | 0o177);
    }

    #[test]
    fn tops10_no_access_page_fails() {
        let mut mem = PhysMemory::new(512);
        let mut pager = pager_with_t10(&mut mem);
        assert_eq!(
            pager.translate(&mut mem, 0o123, PTF_USER),
            Err(Refill::PageFail)
        );
        // PFW records a paged user reference with no access bit.
        assert_eq!(lh(pager.pfw) & PFW_USER, PFW_USER);
        assert_eq!(lh(pager.pfw) & PFW_T10_ACCESS, 0);
        assert_eq!(rh(pager.pfw), 0o123);
    }

    #[test]
    fn write_through_clean_entry_rewalks() {
        let mut mem = PhysMemory::new(512);
        let mut pager = pager_with_t10(&mut mem);
        let even = PTE_T10_ACCESS | PTE_T10_WRITABLE | PTE_T10_CACHE | 0o20;
        mem.write(0o2000, xwd(even, 0)).unwrap();

        // Fill by reading: the cached entry is clean.
        pager.translate(&mut mem, 0o10, PTF_USER).unwrap();
        // Revoke writability behind the cache's back, then write: the
        // slow path must notice.
        mem.write(0o2000, xwd(PTE_T10_ACCESS | PTE_T10_CACHE | 0o20, 0))
            .unwrap();
        assert_eq!(
            pager.translate(&mut mem, 0o10, PTF_USER | PTF_WRITE),
            Err(Refill::PageFail)
        );
    }

    #[test]
    fn base_register_writes_flush_cache() {
        let mut mem = PhysMemory::new(512);
        let mut pager = pager_with_t10(&mut mem);
        let even = PTE_T10_ACCESS | PTE_T10_CACHE | 0o20;
        mem.write(0o2000, xwd(even, 0)).unwrap();
        pager.translate(&mut mem, 0o10, PTF_USER).unwrap();

        // Retarget the UPT: the stale entry must be gone.
        pager.write_ubr(UBR_LD_USER_BASE_ADDR | 3);
        mem.write(0o3000, xwd(PTE_T10_ACCESS | PTE_T10_CACHE | 0o30, 0))
            .unwrap();
        let pa = pager.translate(&mut mem, 0o10, PTF_USER).unwrap();
        assert_eq!(pa, (0o30 << 9) | 0o10);
    }

    #[test]
    fn tops20_immediate_walk() {
        let mut mem = PhysMemory::new(512);
        let mut pager = Pager::new();
        pager.write_ebr(EBR_ENA_PAGER | EBR_TOPS20_PAGING | 1);
        pager.write_ubr(UBR_LD_USER_BASE_ADDR | 2);

        // UPT section pointer (immediate) -> page-table page 4.
        mem.write(0o2000 + T20_SECTION, (PTR_IMMEDIATE << 33) | PTE_T20_WRITE | PTE_T20_CACHE | 4)
            .unwrap();
        // Page table at 0o4000: entry for vpage 3 -> frame 0o40.
        mem.write(0o4003, (PTR_IMMEDIATE << 33) | PTE_T20_WRITE | PTE_T20_CACHE | 0o40)
            .unwrap();

        let pa = pager
            .translate(&mut mem, (3 << 9) | 0o17, PTF_USER | PTF_WRITE)
            .unwrap();
        assert_eq!(pa, (0o40 << 9) | 0o17);
        assert_ne!(lh(pager.pfw) & PFW_T20_DONE, 0);
        assert_ne!(lh(pager.pfw) & PFW_T20_WRITE, 0);
    }

    #[test]
    fn tops20_storage_medium_faults() {
        let mut mem = PhysMemory::new(512);
        let mut pager = Pager::new();
        pager.write_ebr(EBR_ENA_PAGER | EBR_TOPS20_PAGING | 1);
        pager.write_ubr(UBR_LD_USER_BASE_ADDR | 2);
        mem.write(0o2000 + T20_SECTION, (PTR_IMMEDIATE << 33) | PTE_T20_WRITE | PTE_T20_CACHE | 4)
            .unwrap();
        // Page not in memory: storage-medium field non-zero.
        mem.write(0o4003, (PTR_IMMEDIATE << 33) | (1 << 18) | 0o40)
            .unwrap();
        assert_eq!(
            pager.translate(&mut mem, (3 << 9) | 0o17, PTF_USER),
            Err(Refill::PageFail)
        );
    }

    #[test]
    fn nxm_during_walk() {
        let mut mem = PhysMemory::new(1);
        let mut pager = Pager::new();
        pager.write_ebr(EBR_ENA_PAGER | 0o3777); // EPT far past memory
        match pager.translate(&mut mem, 0o400 << 9, 0) {
            Err(Refill::Nxm(_)) => {}
            other => panic!("expected NXM, got {other:?}"),
        }
        assert_eq!(lh(pager.pfw) & PFW_NXM, PFW_NXM);
    }
}
