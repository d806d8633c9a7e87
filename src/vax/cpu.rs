use crate::vax::insts::{self, InstDef};
use crate::vax::memory::NoMemory;
use crate::vax::mmu::{MmFault, Mmu, PAGE_MASK, PAGE_SIZE};
use crate::vax::operand::Operand;
use crate::vax::{
    VaxBus, VaxFault, STOP_CHMFI, STOP_ILLVEC, STOP_INIE, STOP_UIPL,
};
use tracing::{debug, trace, warn};

// PSL fields.
pub const PSL_C: u32 = 0x0000_0001;
pub const PSL_V: u32 = 0x0000_0002;
pub const PSL_Z: u32 = 0x0000_0004;
pub const PSL_N: u32 = 0x0000_0008;
pub const PSL_CC: u32 = 0x0000_000F;
pub const PSL_T: u32 = 0x0000_0010;
pub const PSW_IV: u32 = 0x0000_0020;
pub const PSW_FU: u32 = 0x0000_0040;
pub const PSW_DV: u32 = 0x0000_0080;
pub const PSL_IPL: u32 = 0x001F_0000;
pub const PSL_PRVMOD: u32 = 0x00C0_0000;
pub const PSL_CURMOD: u32 = 0x0300_0000;
pub const PSL_IS: u32 = 0x0400_0000;
pub const PSL_FPD: u32 = 0x0800_0000;
pub const PSL_TP: u32 = 0x4000_0000;
pub const PSL_CM: u32 = 0x8000_0000;
const PSL_MBZ: u32 = 0x3020_FF00;

// Access modes.
pub const MODE_K: u32 = 0;
pub const MODE_E: u32 = 1;
pub const MODE_S: u32 = 2;
pub const MODE_U: u32 = 3;

// SCB vectors.
pub const SCB_MCHK: u32 = 0x04;
pub const SCB_KSNV: u32 = 0x08;
pub const SCB_RESIN: u32 = 0x10;
pub const SCB_XFC: u32 = 0x14;
pub const SCB_RESOP: u32 = 0x18;
pub const SCB_RESAD: u32 = 0x1C;
pub const SCB_ACV: u32 = 0x20;
pub const SCB_TNV: u32 = 0x24;
pub const SCB_TP: u32 = 0x28;
pub const SCB_BPT: u32 = 0x2C;
pub const SCB_ARITH: u32 = 0x34;
pub const SCB_CHMK: u32 = 0x40;
pub const SCB_IPLSOFT: u32 = 0x80;
pub const SCB_TIMER: u32 = 0xC0;
pub const SCB_CTYIN: u32 = 0xF8;
pub const SCB_CTYOUT: u32 = 0xFC;
/// Qbus device vectors dispatch through the second SCB page.
pub const SCB_QBUS_BASE: u32 = 0x200;

// Arithmetic trap codes.
pub const TRAP_INTOVF: u32 = 1;
pub const TRAP_INTDIV: u32 = 2;
pub const TRAP_SUBRNG: u32 = 7;

// IPL bands.
pub const IPL_SMAX: u32 = 0x0F;
pub const IPL_HMIN: u32 = 0x14;
pub const IPL_HMAX: u32 = 0x17;
pub const IPL_CLOCK: u32 = 0x16;
pub const IPL_CTY: u32 = 0x14;

// Privileged register numbers.
const PR_KSP: u32 = 0;
const PR_ESP: u32 = 1;
const PR_SSP: u32 = 2;
const PR_USP: u32 = 3;
const PR_ISP: u32 = 4;
const PR_P0BR: u32 = 8;
const PR_P0LR: u32 = 9;
const PR_P1BR: u32 = 10;
const PR_P1LR: u32 = 11;
const PR_SBR: u32 = 12;
const PR_SLR: u32 = 13;
const PR_PCBB: u32 = 16;
const PR_SCBB: u32 = 17;
const PR_IPL: u32 = 18;
const PR_ASTLVL: u32 = 19;
const PR_SIRR: u32 = 20;
const PR_SISR: u32 = 21;
const PR_ICCS: u32 = 24;
const PR_NICR: u32 = 25;
const PR_ICR: u32 = 26;
const PR_TODR: u32 = 27;
const PR_RXCS: u32 = 32;
const PR_RXDB: u32 = 33;
const PR_TXCS: u32 = 34;
const PR_TXDB: u32 = 35;
const PR_MAPEN: u32 = 56;
const PR_TBIA: u32 = 57;
const PR_TBIS: u32 = 58;
const PR_SID: u32 = 62;
const PR_TBCHK: u32 = 63;

// KA630 system identification.
const SID_KA630: u32 = (8 << 24) | 0x01;

pub type ExecResult = Result<(), VaxFault>;

enum IntKind {
    Exception,
    Severe,
    Interrupt(u32),
}

/// The MicroVAX processor: general registers (R15 is the PC), PSL, the
/// per-mode stack bank, the MMU, and the decoded-operand staging area the
/// handlers consume.
pub struct Vax {
    pub r: [u32; 16],
    pub psl: u32,
    pub sp_bank: [u32; 5],
    pub scbb: u32,
    pub pcbb: u32,
    pub sisr: u32,
    pub astlvl: u32,
    pub mmu: Mmu,
    pub trap_code: u32,
    pub pending_ipl: u32,
    pub in_ie: bool,
    pub fault_pc: u32,
    pub recovery: Vec<(usize, i32)>,
    pub operands: [Operand; 10],
    dispatch: [u16; 512],
    pub halted: bool,
}

impl Vax {
    pub fn new() -> Self {
        let mut dispatch = [u16::MAX; 512];
        for (idx, def) in insts::INSTRUCTIONS.iter().enumerate() {
            let slot = if def.opcode < 0x100 {
                def.opcode as usize
            } else {
                0x100 + (def.opcode & 0xFF) as usize
            };
            dispatch[slot] = idx as u16;
        }
        Self {
            r: [0; 16],
            psl: 0x041F_0000, // IS set, IPL 1F: power-on state
            sp_bank: [0; 5],
            scbb: 0,
            pcbb: 0,
            sisr: 0,
            astlvl: 4,
            mmu: Mmu::new(),
            trap_code: 0,
            pending_ipl: 0,
            in_ie: false,
            fault_pc: 0,
            recovery: Vec::new(),
            operands: [Operand::None; 10],
            dispatch,
            halted: false,
        }
    }

    pub fn lookup(&self, opcode: u16) -> Option<&'static InstDef> {
        let slot = if opcode < 0x100 {
            opcode as usize
        } else {
            0x100 + (opcode & 0xFF) as usize
        };
        let idx = self.dispatch[slot];
        if idx == u16::MAX {
            None
        } else {
            Some(&insts::INSTRUCTIONS[idx as usize])
        }
    }

    // ================= PSL helpers =================

    #[inline(always)]
    pub fn pc(&self) -> u32 {
        self.r[15]
    }

    #[inline(always)]
    pub fn set_pc(&mut self, pc: u32) {
        self.r[15] = pc;
    }

    #[inline(always)]
    pub fn cur_mode(&self) -> u32 {
        (self.psl & PSL_CURMOD) >> 24
    }

    #[inline(always)]
    pub fn prev_mode(&self) -> u32 {
        (self.psl & PSL_PRVMOD) >> 22
    }

    #[inline(always)]
    pub fn ipl(&self) -> u32 {
        (self.psl & PSL_IPL) >> 16
    }

    pub fn set_ipl(&mut self, ipl: u32) {
        self.psl = (self.psl & !PSL_IPL) | ((ipl & 0x1F) << 16);
    }

    fn sp_index(&self) -> usize {
        if self.psl & PSL_IS != 0 { 4 } else { self.cur_mode() as usize }
    }

    /// Mirror SP into its bank before any mode/stack change.
    pub fn save_sp(&mut self) {
        self.sp_bank[self.sp_index()] = self.r[14];
    }

    pub fn load_sp(&mut self) {
        self.r[14] = self.sp_bank[self.sp_index()];
    }

    pub fn set_cc(&mut self, n: bool, z: bool, v: bool, c: bool) {
        self.psl = (self.psl & !PSL_CC)
            | (n as u32) << 3
            | (z as u32) << 2
            | (v as u32) << 1
            | c as u32;
    }

    pub fn set_nzv(&mut self, n: bool, z: bool, v: bool) {
        self.psl = (self.psl & !(PSL_N | PSL_Z | PSL_V))
            | (n as u32) << 3
            | (z as u32) << 2
            | (v as u32) << 1;
    }

    /// An integer-overflow condition: V always, trap only when IV is set.
    pub fn arith_trap(&mut self, code: u32) {
        if self.psl & PSW_IV != 0 || code != TRAP_INTOVF {
            self.trap_code = code;
        }
    }

    // ================= virtual memory =================

    fn mm_fault(fault: MmFault) -> VaxFault {
        match fault {
            MmFault::AccessViolation { param, va } => VaxFault::AccessViolation { param, va },
            MmFault::TranslationNotValid { param, va } => {
                VaxFault::TranslationNotValid { param, va }
            }
            MmFault::PteNoMemory(addr) => VaxFault::MachineCheck { code: 0x82, addr },
        }
    }

    pub fn read_v(&mut self, bus: &mut VaxBus, va: u32, size: u32) -> Result<u32, VaxFault> {
        self.read_v_mode(bus, va, size, self.cur_mode())
    }

    pub fn read_v_mode(
        &mut self,
        bus: &mut VaxBus,
        va: u32,
        size: u32,
        mode: u32,
    ) -> Result<u32, VaxFault> {
        if (va & PAGE_MASK) + size <= PAGE_SIZE {
            let pa = self
                .mmu
                .translate(&mut bus.mem, va, mode, false)
                .map_err(Self::mm_fault)?;
            bus.read_phys(pa, size)
                .map_err(|NoMemory(a)| VaxFault::MachineCheck { code: 0x80, addr: a })
        } else {
            let mut value = 0u32;
            for k in 0..size {
                let pa = self
                    .mmu
                    .translate(&mut bus.mem, va + k, mode, false)
                    .map_err(Self::mm_fault)?;
                let byte = bus
                    .read_phys(pa, 1)
                    .map_err(|NoMemory(a)| VaxFault::MachineCheck { code: 0x80, addr: a })?;
                value |= byte << (8 * k);
            }
            Ok(value)
        }
    }

    pub fn write_v(&mut self, bus: &mut VaxBus, va: u32, size: u32, value: u32) -> ExecResult {
        self.write_v_mode(bus, va, size, value, self.cur_mode())
    }

    pub fn write_v_mode(
        &mut self,
        bus: &mut VaxBus,
        va: u32,
        size: u32,
        value: u32,
        mode: u32,
    ) -> ExecResult {
        if (va & PAGE_MASK) + size <= PAGE_SIZE {
            let pa = self
                .mmu
                .translate(&mut bus.mem, va, mode, true)
                .map_err(Self::mm_fault)?;
            bus.write_phys(pa, size, value)
                .map_err(|NoMemory(a)| VaxFault::MachineCheck { code: 0x81, addr: a })
        } else {
            for k in 0..size {
                let pa = self
                    .mmu
                    .translate(&mut bus.mem, va + k, mode, true)
                    .map_err(Self::mm_fault)?;
                bus.write_phys(pa, 1, (value >> (8 * k)) & 0xFF)
                    .map_err(|NoMemory(a)| VaxFault::MachineCheck { code: 0x81, addr: a })?;
            }
            Ok(())
        }
    }

    pub fn read_vq(&mut self, bus: &mut VaxBus, va: u32) -> Result<u64, VaxFault> {
        let lo = self.read_v(bus, va, 4)? as u64;
        let hi = self.read_v(bus, va + 4, 4)? as u64;
        Ok(lo | (hi << 32))
    }

    pub fn write_vq(&mut self, bus: &mut VaxBus, va: u32, value: u64) -> ExecResult {
        self.write_v(bus, va, 4, value as u32)?;
        self.write_v(bus, va + 4, 4, (value >> 32) as u32)
    }

    /// Instruction-stream read: at PC, advancing it.
    pub fn read_istream(&mut self, bus: &mut VaxBus, size: u32) -> Result<u32, VaxFault> {
        let va = self.pc();
        let value = self.read_v(bus, va, size)?;
        self.set_pc(va.wrapping_add(size));
        Ok(value)
    }

    pub fn push(&mut self, bus: &mut VaxBus, value: u32) -> ExecResult {
        let sp = self.r[14].wrapping_sub(4);
        self.write_v(bus, sp, 4, value)?;
        self.r[14] = sp;
        Ok(())
    }

    pub fn pop(&mut self, bus: &mut VaxBus) -> Result<u32, VaxFault> {
        let value = self.read_v(bus, self.r[14], 4)?;
        self.r[14] = self.r[14].wrapping_add(4);
        Ok(value)
    }

    // ================= exceptions and interrupts =================

    /// Deliver an exception or interrupt through the SCB, per the vector's
    /// stack-select bits. Severe events raise IPL to 1F.
    fn do_intexc(&mut self, bus: &mut VaxBus, vector: u32, kind: IntKind) -> Result<(), u32> {
        let scb_word = match bus.read_phys(self.scbb + vector, 4) {
            Ok(w) => w,
            Err(_) => {
                warn!("VAX: SCB read failed at vector {vector:02X}");
                return Err(STOP_ILLVEC);
            }
        };
        let sel = scb_word & 3;
        let new_pc = scb_word & !3;
        let use_is = matches!(kind, IntKind::Interrupt(_)) || sel == 1;
        if sel >= 2 {
            return Err(STOP_ILLVEC);
        }

        let old_psl = self.psl;
        let old_pc = self.pc();
        self.save_sp();

        // New context: kernel mode, previous mode records the old one.
        self.psl = (self.psl & !(PSL_CURMOD | PSL_PRVMOD | PSL_CC | PSL_T | PSL_TP | PSL_FPD))
            | (self.cur_mode() << 22);
        if use_is {
            self.psl |= PSL_IS;
        }
        match kind {
            IntKind::Interrupt(ipl) => self.set_ipl(ipl),
            IntKind::Severe => self.set_ipl(0x1F),
            IntKind::Exception => {}
        }
        self.load_sp();

        // Push PC then PSL; a failure on the kernel stack is
        // kernel-stack-not-valid, on the interrupt stack fatal.
        self.in_ie = true;
        let pushed = self
            .push(bus, old_psl)
            .and_then(|_| self.push(bus, old_pc));
        self.in_ie = false;
        if pushed.is_err() {
            if self.psl & PSL_IS != 0 {
                return Err(STOP_INIE);
            }
            return self.do_intexc(bus, SCB_KSNV, IntKind::Severe);
        }

        trace!(
            "VAX: dispatch vector {vector:03X} -> {new_pc:08X} (PSL {old_psl:08X})"
        );
        self.set_pc(new_pc);
        Ok(())
    }

    /// Fault delivery: back out operand side effects, restore the PC, and
    /// dispatch through the SCB with each fault's own stack and parameter
    /// behavior.
    pub fn deliver_fault(&mut self, bus: &mut VaxBus, fault: VaxFault) -> Result<(), u32> {
        // Undo every specifier side effect so the restart re-decodes the
        // instruction from a clean register file. Checkpointed string
        // instructions keep their progress in R0-R5, which the rollback
        // list never touches.
        for (reg, delta) in std::mem::take(&mut self.recovery).into_iter().rev() {
            self.r[reg] = self.r[reg].wrapping_sub(delta as u32);
        }
        self.set_pc(self.fault_pc);

        match fault {
            VaxFault::ReservedInstruction | VaxFault::PrivilegedInstruction => {
                if self.in_ie {
                    return Err(STOP_INIE);
                }
                debug!("VAX: reserved/privileged instruction at {:08X}", self.fault_pc);
                self.do_intexc(bus, SCB_RESIN, IntKind::Exception)
            }
            VaxFault::ReservedOperand => {
                if self.in_ie {
                    return Err(STOP_INIE);
                }
                self.do_intexc(bus, SCB_RESOP, IntKind::Exception)
            }
            VaxFault::ReservedAddrMode => self.do_intexc(bus, SCB_RESAD, IntKind::Exception),
            VaxFault::Breakpoint => self.do_intexc(bus, SCB_BPT, IntKind::Exception),
            VaxFault::AccessViolation { param, va }
            | VaxFault::TranslationNotValid { param, va } => {
                let vector = if matches!(fault, VaxFault::AccessViolation { .. }) {
                    SCB_ACV
                } else {
                    SCB_TNV
                };
                debug!("VAX: MM fault {vector:02X} va={va:08X} param={param:X}");
                self.do_intexc(bus, vector, IntKind::Exception)?;
                // Two parameter longwords under the frame.
                self.in_ie = true;
                let pushed = self.push(bus, va).and_then(|_| self.push(bus, param));
                self.in_ie = false;
                if pushed.is_err() {
                    return Err(STOP_INIE);
                }
                Ok(())
            }
            VaxFault::KernelStackNotValid => {
                if self.psl & PSL_IS != 0 {
                    return Err(STOP_INIE);
                }
                self.do_intexc(bus, SCB_KSNV, IntKind::Severe)
            }
            VaxFault::MachineCheck { code, addr } => {
                if self.in_ie {
                    return Err(STOP_INIE);
                }
                warn!("VAX: machine check {code:02X} addr {addr:08X}");
                self.do_intexc(bus, SCB_MCHK, IntKind::Severe)?;
                self.in_ie = true;
                let pushed = self
                    .push(bus, addr)
                    .and_then(|_| self.push(bus, code))
                    .and_then(|_| self.push(bus, 8)); // byte count
                self.in_ie = false;
                if pushed.is_err() {
                    return Err(STOP_INIE);
                }
                Ok(())
            }
            VaxFault::Halt(code) => Err(code),
        }
    }

    /// Recompute the interrupt summary: the single highest-priority
    /// pending source.
    pub fn eval_irq(&mut self, bus: &VaxBus) {
        let mut ipl = 0;
        if bus.clk_irq {
            ipl = IPL_CLOCK;
        }
        if let Some(qipl) = bus.qbus.pending_ipl() {
            ipl = ipl.max(qipl);
        }
        if bus.cty.rx_irq || bus.cty.tx_irq {
            ipl = ipl.max(IPL_CTY);
        }
        if self.sisr != 0 {
            let soft = 31 - (self.sisr & 0xFFFE).leading_zeros();
            ipl = ipl.max(soft);
        }
        self.pending_ipl = ipl;
    }

    /// Instruction-boundary event check: arithmetic traps first, then the
    /// highest pending interrupt above the current IPL.
    fn check_events(&mut self, bus: &mut VaxBus) -> Result<bool, u32> {
        if self.trap_code != 0 {
            let code = self.trap_code;
            self.trap_code = 0;
            debug!("VAX: arithmetic trap {code}");
            self.do_intexc(bus, SCB_ARITH, IntKind::Exception)?;
            self.in_ie = true;
            let pushed = self.push(bus, code);
            self.in_ie = false;
            if pushed.is_err() {
                return Err(STOP_INIE);
            }
            return Ok(true);
        }

        self.eval_irq(bus);
        if self.pending_ipl <= self.ipl() {
            return Ok(false);
        }
        let ipl = self.pending_ipl;
        let vector = if ipl == IPL_CLOCK && bus.clk_irq {
            bus.clk_irq = false;
            SCB_TIMER
        } else if ipl == IPL_CTY && bus.cty.rx_irq {
            bus.cty.rx_irq = false;
            SCB_CTYIN
        } else if ipl == IPL_CTY && bus.cty.tx_irq {
            bus.cty.tx_irq = false;
            SCB_CTYOUT
        } else if (IPL_HMIN..=IPL_HMAX).contains(&ipl) {
            match bus.qbus.get_vector((ipl - 0x10) as u8) {
                Some(v) => SCB_QBUS_BASE + v as u32,
                // Passive release: nothing pending at acknowledge time.
                None => return Ok(false),
            }
        } else if ipl <= IPL_SMAX {
            self.sisr &= !(1u32 << ipl);
            SCB_IPLSOFT + (ipl << 2)
        } else {
            return Err(STOP_UIPL);
        };
        debug!("VAX: interrupt IPL {ipl:02X} vector {vector:03X}");
        self.do_intexc(bus, vector, IntKind::Interrupt(ipl))?;
        Ok(true)
    }

    // ================= step =================

    /// One instruction (or one interrupt/trap delivery). Returns cycles,
    /// or the stop code when the processor halts.
    pub fn step(&mut self, bus: &mut VaxBus) -> Result<u64, u32> {
        self.fault_pc = self.pc();
        self.recovery.clear();

        match self.check_events(bus) {
            Ok(true) => return Ok(1),
            Ok(false) => {}
            Err(stop) => return Err(stop),
        }

        // Trace: the T bit arms trace-pending, which fires one
        // instruction later.
        if self.psl & PSL_TP != 0 {
            self.psl &= !PSL_TP;
            return match self.do_intexc(bus, SCB_TP, IntKind::Exception) {
                Ok(()) => Ok(1),
                Err(stop) => Err(stop),
            };
        }
        if self.psl & PSL_T != 0 {
            self.psl |= PSL_TP;
        }

        let result = self.execute_one(bus);
        match result {
            Ok(()) => Ok(1),
            Err(fault) => self.deliver_fault(bus, fault).map(|_| 1),
        }
    }

    fn execute_one(&mut self, bus: &mut VaxBus) -> ExecResult {
        let mut opcode = self.read_istream(bus, 1)? as u16;
        if opcode >= 0xFD {
            opcode = 0x100 | self.read_istream(bus, 1)? as u16;
        }
        let Some(def) = self.lookup(opcode) else {
            return Err(VaxFault::ReservedInstruction);
        };
        trace!("VAX: {:08X} {}", self.fault_pc, def.name);
        self.decode_operands(bus, def.specs)?;
        (def.exec)(self, bus)
    }

    // ================= privileged instructions =================

    /// REI: pop PC and PSL, with the architecture's legality checks, and
    /// re-arm the interrupt evaluation.
    pub fn rei(&mut self, bus: &mut VaxBus) -> ExecResult {
        let new_pc = self.read_v(bus, self.r[14], 4)?;
        let new_psl = self.read_v(bus, self.r[14].wrapping_add(4), 4)?;
        let new_cur = (new_psl & PSL_CURMOD) >> 24;

        if new_psl & PSL_MBZ != 0
            || new_cur < self.cur_mode()
            || (new_psl & PSL_IS != 0 && self.psl & PSL_IS == 0)
            || (new_psl & PSL_IS != 0 && (new_cur != 0 || new_psl & PSL_IPL == 0))
            || ((new_psl & PSL_IPL) >> 16 > self.ipl())
            || (new_cur != 0 && new_psl & PSL_IPL != 0)
        {
            return Err(VaxFault::ReservedOperand);
        }

        self.r[14] = self.r[14].wrapping_add(8);
        self.save_sp();
        let keep_tp = self.psl & PSL_TP;
        self.psl = new_psl | keep_tp;
        if new_psl & PSL_T != 0 {
            self.psl |= PSL_TP;
        }
        self.set_pc(new_pc);
        self.load_sp();
        debug!("VAX: REI -> PC {new_pc:08X} PSL {new_psl:08X}");
        Ok(())
    }

    /// CHMx: change mode inward, through the mode's SCB vector, pushing
    /// the code operand on the new stack.
    pub fn chm(&mut self, bus: &mut VaxBus, target: u32, code: u32) -> ExecResult {
        if self.psl & PSL_IS != 0 {
            return Err(VaxFault::Halt(STOP_CHMFI));
        }
        let new_mode = target.min(self.cur_mode());
        let vector = SCB_CHMK + (target << 2);
        let scb_word = self
            .read_scb(bus, vector)
            .map_err(|_| VaxFault::MachineCheck { code: 0x83, addr: self.scbb + vector })?;
        let new_pc = scb_word & !3;

        let old_psl = self.psl;
        let old_pc = self.pc();
        self.save_sp();
        self.psl = (self.psl
            & !(PSL_CURMOD | PSL_PRVMOD | PSL_CC | PSL_T | PSL_TP | PSL_FPD))
            | (new_mode << 24)
            | (self.cur_mode() << 22);
        self.load_sp();
        self.push(bus, old_psl)?;
        self.push(bus, old_pc)?;
        self.push(bus, code)?;
        self.set_pc(new_pc);
        Ok(())
    }

    fn read_scb(&mut self, bus: &mut VaxBus, vector: u32) -> Result<u32, ()> {
        bus.read_phys(self.scbb + vector, 4).map_err(|_| ())
    }

    /// LDPCTX: load the process context from the PCB and stage PC/PSL on
    /// the kernel stack for the REI that follows.
    pub fn ldpctx(&mut self, bus: &mut VaxBus) -> ExecResult {
        if self.cur_mode() != MODE_K {
            return Err(VaxFault::PrivilegedInstruction);
        }
        let pcb = self.pcbb & !3;
        let rd = |bus: &mut VaxBus, off: u32| {
            bus.read_phys(pcb + off, 4)
                .map_err(|NoMemory(a)| VaxFault::MachineCheck { code: 0x84, addr: a })
        };
        self.sp_bank[0] = rd(bus, 0)?;
        self.sp_bank[1] = rd(bus, 4)?;
        self.sp_bank[2] = rd(bus, 8)?;
        self.sp_bank[3] = rd(bus, 12)?;
        for k in 0..12 {
            self.r[k] = rd(bus, 16 + 4 * k as u32)?;
        }
        self.r[12] = rd(bus, 64)?;
        self.r[13] = rd(bus, 68)?;
        let pc = rd(bus, 72)?;
        let psl = rd(bus, 76)?;
        self.mmu.p0br = rd(bus, 80)?;
        let p0lr = rd(bus, 84)?;
        self.mmu.p0lr = p0lr & 0x3F_FFFF;
        self.astlvl = (p0lr >> 24) & 7;
        self.mmu.p1br = rd(bus, 88)?;
        self.mmu.p1lr = rd(bus, 92)? & 0x3F_FFFF;
        self.mmu.invalidate_all();

        // Stage the return frame on the kernel stack.
        if self.psl & PSL_IS != 0 {
            self.save_sp();
            self.psl &= !PSL_IS;
            self.load_sp();
        }
        self.push(bus, psl)?;
        self.push(bus, pc)?;
        Ok(())
    }

    /// SVPCTX: save the context back and return to the interrupt stack.
    pub fn svpctx(&mut self, bus: &mut VaxBus) -> ExecResult {
        if self.cur_mode() != MODE_K {
            return Err(VaxFault::PrivilegedInstruction);
        }
        let pc = self.pop(bus)?;
        let psl = self.pop(bus)?;
        self.save_sp();
        let pcb = self.pcbb & !3;
        let wr = |bus: &mut VaxBus, off: u32, v: u32| {
            bus.write_phys(pcb + off, 4, v)
                .map_err(|NoMemory(a)| VaxFault::MachineCheck { code: 0x84, addr: a })
        };
        wr(bus, 0, self.sp_bank[0])?;
        wr(bus, 4, self.sp_bank[1])?;
        wr(bus, 8, self.sp_bank[2])?;
        wr(bus, 12, self.sp_bank[3])?;
        for k in 0..12 {
            wr(bus, 16 + 4 * k as u32, self.r[k])?;
        }
        wr(bus, 64, self.r[12])?;
        wr(bus, 68, self.r[13])?;
        wr(bus, 72, pc)?;
        wr(bus, 76, psl)?;
        // Resume on the interrupt stack.
        self.psl |= PSL_IS;
        self.load_sp();
        Ok(())
    }

    /// MTPR.
    pub fn mtpr(&mut self, bus: &mut VaxBus, reg: u32, value: u32) -> ExecResult {
        if self.cur_mode() != MODE_K {
            return Err(VaxFault::PrivilegedInstruction);
        }
        match reg {
            PR_KSP..=PR_ISP => {
                let idx = reg as usize;
                if idx == self.sp_index() {
                    self.r[14] = value;
                } else {
                    self.sp_bank[idx] = value;
                }
            }
            PR_P0BR => {
                self.mmu.p0br = value;
                self.mmu.invalidate_all();
            }
            PR_P0LR => {
                self.mmu.p0lr = value & 0x3F_FFFF;
                self.mmu.invalidate_all();
            }
            PR_P1BR => {
                self.mmu.p1br = value;
                self.mmu.invalidate_all();
            }
            PR_P1LR => {
                self.mmu.p1lr = value & 0x3F_FFFF;
                self.mmu.invalidate_all();
            }
            PR_SBR => {
                self.mmu.sbr = value & !3;
                self.mmu.invalidate_all();
            }
            PR_SLR => {
                self.mmu.slr = value & 0x3F_FFFF;
                self.mmu.invalidate_all();
            }
            PR_PCBB => self.pcbb = value,
            PR_SCBB => self.scbb = value & !0x1FF,
            PR_IPL => {
                self.set_ipl(value);
                self.eval_irq(bus);
            }
            PR_ASTLVL => self.astlvl = value & 7,
            PR_SIRR => {
                if (1..=15).contains(&value) {
                    self.sisr |= 1 << value;
                    self.eval_irq(bus);
                }
            }
            PR_SISR => {
                self.sisr = value & 0xFFFE;
                self.eval_irq(bus);
            }
            PR_ICCS => {
                bus.iccs = value & 0x40;
                if value & 0x40 == 0 {
                    bus.clk_irq = false;
                }
                self.eval_irq(bus);
            }
            PR_NICR | PR_ICR => {}
            PR_TODR => bus.todr = value,
            PR_RXCS => {
                bus.cty.write_rxcs(value);
                self.eval_irq(bus);
            }
            PR_RXDB => {}
            PR_TXCS => {
                bus.cty.write_txcs(value);
                self.eval_irq(bus);
            }
            PR_TXDB => {
                let VaxBus { cty, clock, .. } = bus;
                cty.write_txdb(value, clock);
            }
            PR_MAPEN => {
                self.mmu.mapen = value & 1 != 0;
                self.mmu.invalidate_all();
                self.mmu.dump_state();
            }
            PR_TBIA => self.mmu.invalidate_all(),
            PR_TBIS => self.mmu.invalidate(value),
            _ => return Err(VaxFault::ReservedOperand),
        }
        Ok(())
    }

    /// MFPR.
    pub fn mfpr(&mut self, bus: &mut VaxBus, reg: u32) -> Result<u32, VaxFault> {
        if self.cur_mode() != MODE_K {
            return Err(VaxFault::PrivilegedInstruction);
        }
        Ok(match reg {
            PR_KSP..=PR_ISP => {
                let idx = reg as usize;
                if idx == self.sp_index() { self.r[14] } else { self.sp_bank[idx] }
            }
            PR_P0BR => self.mmu.p0br,
            PR_P0LR => self.mmu.p0lr,
            PR_P1BR => self.mmu.p1br,
            PR_P1LR => self.mmu.p1lr,
            PR_SBR => self.mmu.sbr,
            PR_SLR => self.mmu.slr,
            PR_PCBB => self.pcbb,
            PR_SCBB => self.scbb,
            PR_IPL => self.ipl(),
            PR_ASTLVL => self.astlvl,
            PR_SISR => self.sisr,
            PR_ICCS => bus.iccs,
            PR_TODR => bus.todr,
            PR_RXCS => bus.cty.read_rxcs(),
            PR_RXDB => {
                let VaxBus { cty, clock, .. } = bus;
                cty.read_rxdb(clock)
            }
            PR_TXCS => bus.cty.read_txcs(),
            PR_MAPEN => self.mmu.mapen as u32,
            PR_SID => SID_KA630,
            PR_TBCHK => 0,
            _ => return Err(VaxFault::ReservedOperand),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vax::cty::Cty;

    pub fn machine() -> (Vax, VaxBus) {
        let mut cpu = Vax::new();
        let mut bus = VaxBus::new(1, Cty::new(None));
        // Minimal run state: kernel mode, IPL 0, SCB at 0x400.
        cpu.psl = 0;
        cpu.scbb = 0x400;
        cpu.r[14] = 0x4000;
        let _ = &mut bus;
        (cpu, bus)
    }

    #[test]
    fn intexc_pushes_frame_and_switches() {
        let (mut cpu, mut bus) = machine();
        cpu.psl |= MODE_U << 24;
        cpu.sp_bank[0] = 0x3000;
        bus.mem.write(0x400 + SCB_RESIN, 4, 0x1234).unwrap();
        cpu.set_pc(0x2000);

        cpu.do_intexc(&mut bus, SCB_RESIN, IntKind::Exception).unwrap();
        assert_eq!(cpu.pc(), 0x1234);
        assert_eq!(cpu.cur_mode(), MODE_K);
        assert_eq!(cpu.prev_mode(), MODE_U);
        // Old PC and PSL sit on the kernel stack.
        assert_eq!(cpu.r[14], 0x3000 - 8);
        assert_eq!(bus.mem.read(0x3000 - 8, 4).unwrap(), 0x2000);
        assert_eq!(bus.mem.read(0x3000 - 4, 4).unwrap() >> 24, MODE_U);
    }

    #[test]
    fn interrupt_stack_select() {
        let (mut cpu, mut bus) = machine();
        cpu.sp_bank[4] = 0x3800;
        bus.mem.write(0x400 + SCB_TIMER, 4, 0x5678).unwrap();
        cpu.do_intexc(&mut bus, SCB_TIMER, IntKind::Interrupt(IPL_CLOCK))
            .unwrap();
        assert_ne!(cpu.psl & PSL_IS, 0);
        assert_eq!(cpu.ipl(), IPL_CLOCK);
        assert_eq!(cpu.r[14], 0x3800 - 8);
    }

    #[test]
    fn rei_restores_and_checks() {
        let (mut cpu, mut bus) = machine();
        // Frame for a return to user mode at IPL 0.
        let target_psl = MODE_U << 24 | (MODE_U << 22);
        bus.mem.write(0x3000, 4, 0x8888).unwrap();
        bus.mem.write(0x3004, 4, target_psl).unwrap();
        cpu.r[14] = 0x3000;
        cpu.sp_bank[3] = 0x7000;

        cpu.rei(&mut bus).unwrap();
        assert_eq!(cpu.pc(), 0x8888);
        assert_eq!(cpu.cur_mode(), MODE_U);
        assert_eq!(cpu.r[14], 0x7000);

        // Privilege escalation is rejected: from user back to kernel.
        bus.mem.write(0x7000, 4, 0x9999).unwrap();
        bus.mem.write(0x7004, 4, 0).unwrap();
        assert_eq!(cpu.rei(&mut bus), Err(VaxFault::ReservedOperand));
    }

    #[test]
    fn software_interrupt_delivery() {
        let (mut cpu, mut bus) = machine();
        cpu.sp_bank[4] = 0x3800;
        bus.mem.write(0x400 + 0x90, 4, 0x2222).unwrap();

        // MTPR #4, #SIRR
        cpu.mtpr(&mut bus, PR_SIRR, 4).unwrap();
        assert_eq!(cpu.sisr & (1 << 4), 1 << 4);
        assert_eq!(cpu.pending_ipl, 4);

        // Next boundary delivers through SCB 0x90 and clears the bit.
        assert!(cpu.check_events(&mut bus).unwrap());
        assert_eq!(cpu.pc(), 0x2222);
        assert_eq!(cpu.ipl(), 4);
        assert_eq!(cpu.sisr & (1 << 4), 0);
    }

    #[test]
    fn trap_queue_drains_before_interrupts() {
        let (mut cpu, mut bus) = machine();
        cpu.sp_bank[0] = 0x3000;
        cpu.r[14] = 0x3000;
        bus.mem.write(0x400 + SCB_ARITH, 4, 0x1500).unwrap();
        cpu.trap_code = TRAP_INTOVF;
        cpu.sisr = 1 << 3;

        assert!(cpu.check_events(&mut bus).unwrap());
        assert_eq!(cpu.pc(), 0x1500);
        // Trap code parameter above the frame.
        assert_eq!(bus.mem.read(cpu.r[14], 4).unwrap(), TRAP_INTOVF);
        // The software interrupt is still pending for the next boundary.
        assert_ne!(cpu.sisr, 0);
    }

    #[test]
    fn mtpr_requires_kernel() {
        let (mut cpu, mut bus) = machine();
        cpu.psl |= MODE_U << 24;
        assert_eq!(
            cpu.mtpr(&mut bus, PR_SCBB, 0),
            Err(VaxFault::PrivilegedInstruction)
        );
    }
}
