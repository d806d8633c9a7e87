use crate::vax::arith::{add32, div32, mul32, sign_bit, sub32, sxt, trunc};
use crate::vax::cpu::{
    ExecResult, Vax, PSL_C, PSL_CC, PSL_FPD, PSL_N, PSL_V, PSL_Z, PSW_DV, PSW_IV, TRAP_INTDIV,
    TRAP_INTOVF, TRAP_SUBRNG,
};
use crate::vax::operand::{
    ab, al, aq, aw, bb, bw, mb, ml, mw, rb, rl, rq, rw, vb, wb, wl, wq, ww, OpSpec, Operand,
};
use crate::vax::{VaxBus, VaxFault, STOP_HALT};

type Exec = fn(&mut Vax, &mut VaxBus) -> ExecResult;

pub struct InstDef {
    pub opcode: u16,
    pub name: &'static str,
    pub specs: &'static [OpSpec],
    pub exec: Exec,
}

// ================= common helpers =================

fn set_nz(cpu: &mut Vax, value: u32, size: u32, v: bool, keep_c: bool) {
    let n = sign_bit(value, size);
    let z = trunc(value, size) == 0;
    let c = if keep_c { cpu.psl & PSL_C != 0 } else { false };
    cpu.set_cc(n, z, v, c);
}

// ================= moves =================

fn op_move<const SIZE: u32>(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let v = cpu.op_value(0);
    cpu.op_write(bus, 1, SIZE, v)?;
    set_nz(cpu, v, SIZE, false, true);
    Ok(())
}

fn op_movq(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let v = cpu.op_qvalue(0);
    cpu.op_write_q(bus, 1, v)?;
    let n = v & (1 << 63) != 0;
    let z = v == 0;
    let c = cpu.psl & PSL_C != 0;
    cpu.set_cc(n, z, false, c);
    Ok(())
}

fn op_clr<const SIZE: u32>(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    cpu.op_write(bus, 0, SIZE, 0)?;
    set_nz(cpu, 0, SIZE, false, true);
    Ok(())
}

fn op_clrq(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    cpu.op_write_q(bus, 0, 0)?;
    let c = cpu.psl & PSL_C != 0;
    cpu.set_cc(false, true, false, c);
    Ok(())
}

fn op_mneg<const SIZE: u32>(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let v = trunc(cpu.op_value(0), SIZE);
    let r = trunc(0u32.wrapping_sub(v), SIZE);
    let overflow = v == 1u32 << (SIZE * 8 - 1);
    cpu.op_write(bus, 1, SIZE, r)?;
    // Carry is set exactly when the operand was nonzero.
    cpu.set_cc(sign_bit(r, SIZE), r == 0, overflow, v != 0);
    if overflow {
        cpu.arith_trap(TRAP_INTOVF);
    }
    Ok(())
}

fn op_mcom<const SIZE: u32>(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let v = !cpu.op_value(0);
    cpu.op_write(bus, 1, SIZE, v)?;
    set_nz(cpu, v, SIZE, false, true);
    Ok(())
}

fn op_movz<const FROM: u32, const TO: u32>(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let v = trunc(cpu.op_value(0), FROM);
    cpu.op_write(bus, 1, TO, v)?;
    set_nz(cpu, v, TO, false, true);
    Ok(())
}

fn op_cvt<const FROM: u32, const TO: u32>(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let v = sxt(cpu.op_value(0), FROM);
    let out = trunc(v, TO);
    let overflow = sxt(out, TO) != v;
    cpu.op_write(bus, 1, TO, out)?;
    let n = sign_bit(out, TO);
    cpu.set_cc(n, out == 0, overflow, false);
    if overflow {
        cpu.arith_trap(TRAP_INTOVF);
    }
    Ok(())
}

fn op_mova<const SIZE: u32>(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let a = cpu.op_addr(0);
    cpu.op_write(bus, 1, 4, a)?;
    set_nz(cpu, a, 4, false, true);
    Ok(())
}

fn op_pusha<const SIZE: u32>(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let a = cpu.op_addr(0);
    cpu.push(bus, a)?;
    set_nz(cpu, a, 4, false, true);
    Ok(())
}

fn op_pushl(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let v = cpu.op_value(0);
    cpu.push(bus, v)?;
    set_nz(cpu, v, 4, false, true);
    Ok(())
}

// ================= integer arithmetic =================

fn op_add<const SIZE: u32, const OPS: usize>(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let a = cpu.op_value(0);
    let b = cpu.op_value(OPS - 2);
    let (r, _, _) = add32(b, a, 0);
    let carry = (trunc(a, SIZE) as u64 + trunc(b, SIZE) as u64) >> (SIZE * 8) != 0;
    let overflow = sign_bit(a, SIZE) == sign_bit(b, SIZE) && sign_bit(r, SIZE) != sign_bit(a, SIZE);
    cpu.op_write(bus, OPS - 1, SIZE, r)?;
    let n = sign_bit(r, SIZE);
    cpu.set_cc(n, trunc(r, SIZE) == 0, overflow, carry);
    if overflow {
        cpu.arith_trap(TRAP_INTOVF);
    }
    Ok(())
}

fn op_sub<const SIZE: u32, const OPS: usize>(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let a = cpu.op_value(0); // subtrahend
    let b = cpu.op_value(OPS - 2); // minuend
    let (r, _, _) = sub32(b, a, 0);
    let borrow = (trunc(a, SIZE) as u64) > (trunc(b, SIZE) as u64);
    let overflow = sign_bit(a, SIZE) != sign_bit(b, SIZE) && sign_bit(r, SIZE) == sign_bit(a, SIZE);
    cpu.op_write(bus, OPS - 1, SIZE, r)?;
    let n = sign_bit(r, SIZE);
    cpu.set_cc(n, trunc(r, SIZE) == 0, overflow, borrow);
    if overflow {
        cpu.arith_trap(TRAP_INTOVF);
    }
    Ok(())
}

fn op_adwc(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let a = cpu.op_value(0);
    let b = cpu.op_value(1);
    let cin = cpu.psl & PSL_C;
    let (r, carry, overflow) = add32(b, a, cin);
    cpu.op_write(bus, 1, 4, r)?;
    cpu.set_cc(r & 0x8000_0000 != 0, r == 0, overflow, carry);
    if overflow {
        cpu.arith_trap(TRAP_INTOVF);
    }
    Ok(())
}

fn op_sbwc(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let a = cpu.op_value(0);
    let b = cpu.op_value(1);
    let bin = cpu.psl & PSL_C;
    let (r, borrow, overflow) = sub32(b, a, bin);
    cpu.op_write(bus, 1, 4, r)?;
    cpu.set_cc(r & 0x8000_0000 != 0, r == 0, overflow, borrow);
    if overflow {
        cpu.arith_trap(TRAP_INTOVF);
    }
    Ok(())
}

fn op_adawi(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    if let Operand::ModMem(a, _) = cpu.operands[1] {
        if a & 1 != 0 {
            return Err(VaxFault::ReservedOperand);
        }
    }
    op_add::<2, 2>(cpu, bus)
}

fn op_inc<const SIZE: u32>(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let b = cpu.op_value(0);
    let r = b.wrapping_add(1);
    let carry = (trunc(b, SIZE) as u64 + 1) >> (SIZE * 8) != 0;
    let overflow = trunc(b, SIZE) == (1 << (SIZE * 8 - 1)) - 1;
    cpu.op_write(bus, 0, SIZE, r)?;
    let n = sign_bit(r, SIZE);
    cpu.set_cc(n, trunc(r, SIZE) == 0, overflow, carry);
    if overflow {
        cpu.arith_trap(TRAP_INTOVF);
    }
    Ok(())
}

fn op_dec<const SIZE: u32>(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let b = cpu.op_value(0);
    let r = b.wrapping_sub(1);
    let borrow = trunc(b, SIZE) == 0;
    let overflow = trunc(b, SIZE) == 1 << (SIZE * 8 - 1);
    cpu.op_write(bus, 0, SIZE, r)?;
    let n = sign_bit(r, SIZE);
    cpu.set_cc(n, trunc(r, SIZE) == 0, overflow, borrow);
    if overflow {
        cpu.arith_trap(TRAP_INTOVF);
    }
    Ok(())
}

fn op_mul<const SIZE: u32, const OPS: usize>(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let a = sxt(cpu.op_value(0), SIZE);
    let b = sxt(cpu.op_value(OPS - 2), SIZE);
    let (r, wide_overflow) = mul32(a, b);
    let overflow = if SIZE == 4 {
        wide_overflow
    } else {
        sxt(trunc(r, SIZE), SIZE) as i32 as i64 != (a as i32 as i64) * (b as i32 as i64)
    };
    cpu.op_write(bus, OPS - 1, SIZE, r)?;
    let n = sign_bit(r, SIZE);
    cpu.set_cc(n, trunc(r, SIZE) == 0, overflow, false);
    if overflow {
        cpu.arith_trap(TRAP_INTOVF);
    }
    Ok(())
}

fn op_div<const SIZE: u32, const OPS: usize>(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let divisor = sxt(cpu.op_value(0), SIZE);
    let dividend = sxt(cpu.op_value(OPS - 2), SIZE);
    match div32(dividend, divisor) {
        Ok((q, _)) => {
            let overflow = sxt(trunc(q, SIZE), SIZE) != q;
            cpu.op_write(bus, OPS - 1, SIZE, q)?;
            let n = sign_bit(q, SIZE);
            cpu.set_cc(n, trunc(q, SIZE) == 0, overflow, false);
            if overflow {
                cpu.arith_trap(TRAP_INTOVF);
            }
            Ok(())
        }
        Err(()) => {
            // The 3-op form stores the dividend; the trap follows at the
            // instruction boundary.
            if OPS == 3 {
                cpu.op_write(bus, OPS - 1, SIZE, dividend as u32)?;
            }
            cpu.set_cc(false, false, true, false);
            let code = if divisor == 0 { TRAP_INTDIV } else { TRAP_INTOVF };
            cpu.arith_trap(code);
            Ok(())
        }
    }
}

fn op_emul(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let mulr = cpu.op_value(0) as i32 as i64;
    let muld = cpu.op_value(1) as i32 as i64;
    let addend = cpu.op_value(2) as i32 as i64;
    let prod = (mulr * muld).wrapping_add(addend) as u64;
    cpu.op_write_q(bus, 3, prod)?;
    cpu.set_cc(prod & (1 << 63) != 0, prod == 0, false, false);
    Ok(())
}

fn op_ediv(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let divisor = cpu.op_value(0) as i32 as i64;
    let dividend = cpu.op_qvalue(1) as i64;
    if divisor == 0 {
        cpu.op_write(bus, 2, 4, dividend as u32)?;
        cpu.op_write(bus, 3, 4, 0)?;
        cpu.set_cc(false, false, true, false);
        cpu.arith_trap(TRAP_INTDIV);
        return Ok(());
    }
    let q = dividend / divisor;
    let r = dividend % divisor;
    if q > i32::MAX as i64 || q < i32::MIN as i64 {
        cpu.op_write(bus, 2, 4, dividend as u32)?;
        cpu.op_write(bus, 3, 4, 0)?;
        cpu.set_cc(false, false, true, false);
        cpu.arith_trap(TRAP_INTOVF);
        return Ok(());
    }
    cpu.op_write(bus, 2, 4, q as u32)?;
    cpu.op_write(bus, 3, 4, r as u32)?;
    cpu.set_cc((q as i32) < 0, q == 0, false, false);
    Ok(())
}

// ================= logicals =================

fn op_bis<const SIZE: u32, const OPS: usize>(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let r = cpu.op_value(0) | cpu.op_value(OPS - 2);
    cpu.op_write(bus, OPS - 1, SIZE, r)?;
    set_nz(cpu, r, SIZE, false, true);
    Ok(())
}

fn op_bic<const SIZE: u32, const OPS: usize>(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let r = !cpu.op_value(0) & cpu.op_value(OPS - 2);
    cpu.op_write(bus, OPS - 1, SIZE, r)?;
    set_nz(cpu, r, SIZE, false, true);
    Ok(())
}

fn op_xor<const SIZE: u32, const OPS: usize>(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let r = cpu.op_value(0) ^ cpu.op_value(OPS - 2);
    cpu.op_write(bus, OPS - 1, SIZE, r)?;
    set_nz(cpu, r, SIZE, false, true);
    Ok(())
}

fn op_bit<const SIZE: u32>(cpu: &mut Vax, _bus: &mut VaxBus) -> ExecResult {
    let r = cpu.op_value(0) & cpu.op_value(1);
    set_nz(cpu, r, SIZE, false, true);
    Ok(())
}

fn op_tst<const SIZE: u32>(cpu: &mut Vax, _bus: &mut VaxBus) -> ExecResult {
    let v = cpu.op_value(0);
    cpu.set_cc(sign_bit(v, SIZE), trunc(v, SIZE) == 0, false, false);
    Ok(())
}

fn op_cmp<const SIZE: u32>(cpu: &mut Vax, _bus: &mut VaxBus) -> ExecResult {
    let a = trunc(cpu.op_value(0), SIZE);
    let b = trunc(cpu.op_value(1), SIZE);
    let n = (sxt(a, SIZE) as i32) < (sxt(b, SIZE) as i32);
    cpu.set_cc(n, a == b, false, a < b);
    Ok(())
}

fn op_ash<const QUAD: bool>(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let count = sxt(cpu.op_value(0), 1) as i32;
    if QUAD {
        let src = cpu.op_qvalue(1) as i64;
        let (r, overflow) = if count >= 0 {
            let n = count.min(64) as u32;
            let shifted = if n >= 64 { 0 } else { (src as u64) << n };
            let back = if n >= 64 { 0 } else { (shifted as i64) >> n };
            (shifted as i64, back != src && src != 0)
        } else {
            ((src >> (-count).min(63)), false)
        };
        cpu.op_write_q(bus, 2, r as u64)?;
        cpu.set_cc(r < 0, r == 0, overflow, false);
        if overflow {
            cpu.arith_trap(TRAP_INTOVF);
        }
    } else {
        let src = cpu.op_value(1) as i32;
        let (r, overflow) = if count >= 0 {
            let n = count.min(32) as u32;
            let shifted = if n >= 32 { 0 } else { (src as u32) << n };
            let back = if n >= 32 { 0 } else { (shifted as i32) >> n };
            (shifted as i32, back != src && src != 0)
        } else {
            (src >> (-count).min(31), false)
        };
        cpu.op_write(bus, 2, 4, r as u32)?;
        cpu.set_cc(r < 0, r == 0, overflow, false);
        if overflow {
            cpu.arith_trap(TRAP_INTOVF);
        }
    }
    Ok(())
}

fn op_rotl(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let count = (sxt(cpu.op_value(0), 1) as i32).rem_euclid(32) as u32;
    let src = cpu.op_value(1);
    let r = if count == 0 { src } else { src.rotate_left(count) };
    cpu.op_write(bus, 2, 4, r)?;
    set_nz(cpu, r, 4, false, true);
    Ok(())
}

// ================= control flow =================

fn do_branch(cpu: &mut Vax, idx: usize) {
    let disp = cpu.op_branch(idx);
    let pc = cpu.pc().wrapping_add(disp as u32);
    cpu.set_pc(pc);
}

fn op_brx(cpu: &mut Vax, _bus: &mut VaxBus) -> ExecResult {
    do_branch(cpu, 0);
    Ok(())
}

fn op_jmp(cpu: &mut Vax, _bus: &mut VaxBus) -> ExecResult {
    let a = cpu.op_addr(0);
    cpu.set_pc(a);
    Ok(())
}

fn op_bsb(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let pc = cpu.pc();
    cpu.push(bus, pc)?;
    do_branch(cpu, 0);
    Ok(())
}

fn op_jsb(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let a = cpu.op_addr(0);
    let pc = cpu.pc();
    cpu.push(bus, pc)?;
    cpu.set_pc(a);
    Ok(())
}

fn op_rsb(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let pc = cpu.pop(bus)?;
    cpu.set_pc(pc);
    Ok(())
}

/// Conditional branch on a condition-code mask: taken when
/// (PSL & MASK != 0) == SET.
fn op_bcond<const MASK: u32, const SET: bool>(cpu: &mut Vax, _bus: &mut VaxBus) -> ExecResult {
    if (cpu.psl & MASK != 0) == SET {
        do_branch(cpu, 0);
    }
    Ok(())
}

/// Signed greater-than style branches need compound conditions.
fn op_bgtr<const OR_MASK: u32, const SET: bool>(cpu: &mut Vax, _bus: &mut VaxBus) -> ExecResult {
    if (cpu.psl & OR_MASK == 0) == SET {
        do_branch(cpu, 0);
    }
    Ok(())
}

fn op_blb<const SET: bool>(cpu: &mut Vax, _bus: &mut VaxBus) -> ExecResult {
    if (cpu.op_value(0) & 1 != 0) == SET {
        do_branch(cpu, 1);
    }
    Ok(())
}

/// Branch on bit, optionally setting or clearing it. The interlocked
/// forms behave identically in an instruction-atomic model.
fn op_bbx<const SENSE: bool, const ACTION: u8>(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let pos = cpu.op_value(0);
    let bit = match cpu.operands[1] {
        Operand::Reg(r) => {
            if pos > 31 {
                return Err(VaxFault::ReservedOperand);
            }
            let bit = cpu.r[r] >> pos & 1 != 0;
            match ACTION {
                1 => cpu.r[r] |= 1 << pos,
                2 => cpu.r[r] &= !(1 << pos),
                _ => {}
            }
            bit
        }
        Operand::Addr(base) => {
            let addr = base.wrapping_add(((pos as i32) >> 3) as u32);
            let bitpos = pos & 7;
            let old = cpu.read_v(bus, addr, 1)?;
            let bit = old >> bitpos & 1 != 0;
            match ACTION {
                1 => cpu.write_v(bus, addr, 1, old | 1 << bitpos)?,
                2 => cpu.write_v(bus, addr, 1, old & !(1 << bitpos))?,
                _ => {}
            }
            bit
        }
        _ => return Err(VaxFault::ReservedOperand),
    };
    if bit == SENSE {
        do_branch(cpu, 2);
    }
    Ok(())
}

fn op_aob<const LEQ: bool>(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let limit = cpu.op_value(0);
    let index = cpu.op_value(1).wrapping_add(1);
    let overflow = index == 0x8000_0000;
    cpu.op_write(bus, 1, 4, index)?;
    let n = index & 0x8000_0000 != 0;
    let c = cpu.psl & PSL_C != 0;
    cpu.set_cc(n, index == 0, overflow, c);
    if overflow {
        cpu.arith_trap(TRAP_INTOVF);
    }
    let taken = if LEQ {
        (index as i32) <= (limit as i32)
    } else {
        (index as i32) < (limit as i32)
    };
    if taken {
        do_branch(cpu, 2);
    }
    Ok(())
}

fn op_sob<const GTR: bool>(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let index = cpu.op_value(0).wrapping_sub(1);
    let overflow = index == 0x7FFF_FFFF;
    cpu.op_write(bus, 0, 4, index)?;
    let n = index & 0x8000_0000 != 0;
    let c = cpu.psl & PSL_C != 0;
    cpu.set_cc(n, index == 0, overflow, c);
    if overflow {
        cpu.arith_trap(TRAP_INTOVF);
    }
    let taken = if GTR { (index as i32) > 0 } else { (index as i32) >= 0 };
    if taken {
        do_branch(cpu, 1);
    }
    Ok(())
}

fn op_acb<const SIZE: u32>(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let limit = sxt(cpu.op_value(0), SIZE) as i32;
    let addend = sxt(cpu.op_value(1), SIZE) as i32;
    let index = sxt(cpu.op_value(2), SIZE) as i32;
    let r = index.wrapping_add(addend);
    let overflow = (addend >= 0) == (index >= 0) && (r >= 0) != (index >= 0);
    cpu.op_write(bus, 2, SIZE, r as u32)?;
    let c = cpu.psl & PSL_C != 0;
    cpu.set_cc(r < 0, r == 0, overflow, c);
    if overflow {
        cpu.arith_trap(TRAP_INTOVF);
    }
    let taken = if addend >= 0 { r <= limit } else { r >= limit };
    if taken {
        do_branch(cpu, 3);
    }
    Ok(())
}

fn op_case<const SIZE: u32>(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let selector = trunc(cpu.op_value(0), SIZE);
    let base = trunc(cpu.op_value(1), SIZE);
    let limit = trunc(cpu.op_value(2), SIZE);
    let tmp = trunc(selector.wrapping_sub(base), SIZE);
    let table = cpu.pc();
    let n = (sxt(tmp, SIZE) as i32) < (sxt(limit, SIZE) as i32);
    cpu.set_cc(n, tmp == limit, false, tmp < limit);
    if tmp <= limit {
        let disp = cpu.read_v(bus, table.wrapping_add(tmp * 2), 2)?;
        cpu.set_pc(table.wrapping_add(sxt(disp, 2)));
    } else {
        cpu.set_pc(table.wrapping_add((limit + 1) * 2));
    }
    Ok(())
}

// ================= procedure calls =================

fn call_common(cpu: &mut Vax, bus: &mut VaxBus, arglist: u32, dst: u32, is_calls: bool) -> ExecResult {
    let mask = cpu.read_v(bus, dst, 2)?;
    if mask & 0x3000 != 0 {
        return Err(VaxFault::ReservedOperand);
    }
    let spa = cpu.r[14] & 3;
    let mut sp = cpu.r[14] & !3;
    for r in (0..12).rev() {
        if mask & (1 << r) != 0 {
            sp = sp.wrapping_sub(4);
            cpu.write_v(bus, sp, 4, cpu.r[r])?;
        }
    }
    sp = sp.wrapping_sub(4);
    cpu.write_v(bus, sp, 4, cpu.pc())?;
    sp = sp.wrapping_sub(4);
    cpu.write_v(bus, sp, 4, cpu.r[13])?;
    sp = sp.wrapping_sub(4);
    cpu.write_v(bus, sp, 4, cpu.r[12])?;
    let status = ((mask & 0x0FFF) << 16)
        | (cpu.psl & 0xFFE0)
        | (spa << 30)
        | ((is_calls as u32) << 29);
    sp = sp.wrapping_sub(4);
    cpu.write_v(bus, sp, 4, status)?;
    sp = sp.wrapping_sub(4);
    cpu.write_v(bus, sp, 4, 0)?; // condition handler
    cpu.r[13] = sp;
    cpu.r[14] = sp;
    cpu.r[12] = arglist;
    cpu.psl &= !(PSL_CC | PSW_IV | PSW_DV);
    if mask & 0x4000 != 0 {
        cpu.psl |= PSW_IV;
    }
    if mask & 0x8000 != 0 {
        cpu.psl |= PSW_DV;
    }
    cpu.set_pc(dst.wrapping_add(2));
    Ok(())
}

fn op_calls(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let nargs = cpu.op_value(0);
    let dst = cpu.op_addr(1);
    cpu.push(bus, nargs)?;
    let arglist = cpu.r[14];
    call_common(cpu, bus, arglist, dst, true)
}

fn op_callg(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let arglist = cpu.op_addr(0);
    let dst = cpu.op_addr(1);
    call_common(cpu, bus, arglist, dst, false)
}

fn op_ret(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let mut sp = cpu.r[13].wrapping_add(4); // past the condition handler
    let status = cpu.read_v(bus, sp, 4)?;
    sp = sp.wrapping_add(4);
    let ap = cpu.read_v(bus, sp, 4)?;
    sp = sp.wrapping_add(4);
    let fp = cpu.read_v(bus, sp, 4)?;
    sp = sp.wrapping_add(4);
    let pc = cpu.read_v(bus, sp, 4)?;
    sp = sp.wrapping_add(4);
    let mask = (status >> 16) & 0x0FFF;
    for r in 0..12 {
        if mask & (1 << r) != 0 {
            cpu.r[r] = cpu.read_v(bus, sp, 4)?;
            sp = sp.wrapping_add(4);
        }
    }
    sp = sp.wrapping_add((status >> 30) & 3);
    if status & (1 << 29) != 0 {
        let nargs = cpu.read_v(bus, sp, 4)?;
        sp = sp.wrapping_add(4 + 4 * (nargs & 0xFF));
    }
    cpu.r[12] = ap;
    cpu.r[13] = fp;
    cpu.r[14] = sp;
    cpu.psl = (cpu.psl & !0xFFFF) | (status & 0xFFE0);
    cpu.set_pc(pc);
    Ok(())
}

fn op_pushr(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let mask = cpu.op_value(0) & 0x7FFF;
    for r in (0..15).rev() {
        if mask & (1 << r) != 0 {
            let v = cpu.r[r];
            cpu.push(bus, v)?;
        }
    }
    Ok(())
}

fn op_popr(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let mask = cpu.op_value(0) & 0x7FFF;
    for r in 0..15 {
        if mask & (1 << r) != 0 {
            cpu.r[r] = cpu.pop(bus)?;
        }
    }
    Ok(())
}

fn op_index(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let subscript = cpu.op_value(0) as i32;
    let low = cpu.op_value(1) as i32;
    let high = cpu.op_value(2) as i32;
    let size = cpu.op_value(3) as i32;
    let indexin = cpu.op_value(4) as i32;
    let out = indexin.wrapping_add(subscript).wrapping_mul(size);
    cpu.op_write(bus, 5, 4, out as u32)?;
    cpu.set_cc(out < 0, out == 0, false, false);
    if subscript < low || subscript > high {
        cpu.arith_trap(TRAP_SUBRNG);
    }
    Ok(())
}

// ================= bit fields =================

/// Fetch a variable bit field as a u32 (size <= 32).
fn field_read(cpu: &mut Vax, bus: &mut VaxBus, pos: u32, size: u32, basek: usize) -> Result<u32, VaxFault> {
    if size > 32 {
        return Err(VaxFault::ReservedOperand);
    }
    if size == 0 {
        return Ok(0);
    }
    match cpu.operands[basek] {
        Operand::Reg(r) => {
            if pos > 31 {
                return Err(VaxFault::ReservedOperand);
            }
            let pair = cpu.r[r] as u64 | ((cpu.r[(r + 1) & 0xF] as u64) << 32);
            Ok(((pair >> pos) & ((1u64 << size) - 1)) as u64 as u32)
        }
        Operand::Addr(base) => {
            let bit = pos as i32;
            let addr = base.wrapping_add((bit >> 3) as u32);
            let shift = (bit & 7) as u32;
            let wide = cpu.read_v(bus, addr, 4)? as u64
                | ((cpu.read_v(bus, addr.wrapping_add(4), 1)? as u64) << 32);
            Ok(((wide >> shift) & ((1u64 << size) - 1)) as u32)
        }
        _ => Err(VaxFault::ReservedOperand),
    }
}

fn field_write(cpu: &mut Vax, bus: &mut VaxBus, pos: u32, size: u32, basek: usize, value: u32) -> ExecResult {
    if size > 32 {
        return Err(VaxFault::ReservedOperand);
    }
    if size == 0 {
        return Ok(());
    }
    let mask = if size == 32 { u64::MAX >> 32 } else { (1u64 << size) - 1 };
    match cpu.operands[basek] {
        Operand::Reg(r) => {
            if pos > 31 {
                return Err(VaxFault::ReservedOperand);
            }
            let pair = cpu.r[r] as u64 | ((cpu.r[(r + 1) & 0xF] as u64) << 32);
            let pair = (pair & !(mask << pos)) | (((value as u64) & mask) << pos);
            cpu.r[r] = pair as u32;
            if pos + size > 32 {
                cpu.r[(r + 1) & 0xF] = (pair >> 32) as u32;
            }
            Ok(())
        }
        Operand::Addr(base) => {
            let bit = pos as i32;
            let addr = base.wrapping_add((bit >> 3) as u32);
            let shift = (bit & 7) as u32;
            let wide = cpu.read_v(bus, addr, 4)? as u64
                | ((cpu.read_v(bus, addr.wrapping_add(4), 1)? as u64) << 32);
            let wide = (wide & !(mask << shift)) | (((value as u64) & mask) << shift);
            cpu.write_v(bus, addr, 4, wide as u32)?;
            if shift + size > 32 {
                cpu.write_v(bus, addr.wrapping_add(4), 1, (wide >> 32) as u32)?;
            }
            Ok(())
        }
        _ => Err(VaxFault::ReservedOperand),
    }
}

fn op_extv<const SIGNED: bool>(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let pos = cpu.op_value(0);
    let size = cpu.op_value(1) & 0xFF;
    let field = field_read(cpu, bus, pos, size, 2)?;
    let value = if SIGNED && size > 0 && size < 32 && field >> (size - 1) & 1 != 0 {
        field | !((1u32 << size) - 1)
    } else {
        field
    };
    cpu.op_write(bus, 3, 4, value)?;
    cpu.set_cc(value & 0x8000_0000 != 0, value == 0, false, cpu.psl & PSL_C != 0);
    Ok(())
}

fn op_cmpv<const SIGNED: bool>(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let pos = cpu.op_value(0);
    let size = cpu.op_value(1) & 0xFF;
    let field = field_read(cpu, bus, pos, size, 2)?;
    let field = if SIGNED && size > 0 && size < 32 && field >> (size - 1) & 1 != 0 {
        field | !((1u32 << size) - 1)
    } else {
        field
    };
    let src = cpu.op_value(3);
    let n = (field as i32) < (src as i32);
    cpu.set_cc(n, field == src, false, field < src);
    Ok(())
}

fn op_insv(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let src = cpu.op_value(0);
    let pos = cpu.op_value(1);
    let size = cpu.op_value(2) & 0xFF;
    field_write(cpu, bus, pos, size, 3, src)
}

fn op_ffx<const SET: bool>(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let start = cpu.op_value(0);
    let size = cpu.op_value(1) & 0xFF;
    let raw = field_read(cpu, bus, start, size, 2)?;
    let mask = if size >= 32 { u32::MAX } else { (1u32 << size) - 1 };
    let field = if SET { raw } else { !raw & mask };
    let found = field.trailing_zeros();
    if size != 0 && found < size {
        cpu.op_write(bus, 3, 4, start.wrapping_add(found))?;
        cpu.set_cc(false, false, false, false);
    } else {
        cpu.op_write(bus, 3, 4, start.wrapping_add(size))?;
        cpu.set_cc(false, true, false, false);
    }
    Ok(())
}

// ================= character strings =================

/// MOVC3/MOVC5 with first-part-done checkpointing: R0-R3 carry the copy
/// cursors across page faults, R4 flags a backward (overlapping) copy.
/// The operand slots are re-staged on every entry, so the architectural
/// completion values are computed from them.
fn op_movc<const FIVE: bool>(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let srclen = trunc(cpu.op_value(0), 2);
    let srcaddr = cpu.op_addr(1);
    let (fill, dstlen, dstaddr) = if FIVE {
        (cpu.op_value(2) & 0xFF, trunc(cpu.op_value(3), 2), cpu.op_addr(4))
    } else {
        (0, trunc(cpu.op_value(0), 2), cpu.op_addr(2))
    };
    let moved = srclen.min(dstlen);

    if cpu.psl & PSL_FPD == 0 {
        let backward = dstaddr > srcaddr && dstaddr < srcaddr.wrapping_add(moved);
        if backward {
            // Walk down from the high end; fill bytes lie above the moved
            // block and go out first.
            cpu.r[0] = moved;
            cpu.r[1] = srcaddr.wrapping_add(moved);
            cpu.r[2] = dstlen;
            cpu.r[3] = dstaddr.wrapping_add(dstlen);
            cpu.r[4] = 1;
        } else {
            cpu.r[0] = srclen;
            cpu.r[1] = srcaddr;
            cpu.r[2] = dstlen;
            cpu.r[3] = dstaddr;
            cpu.r[4] = 0;
        }
        cpu.r[5] = 0;
        cpu.psl |= PSL_FPD;
    }

    if cpu.r[4] & 1 != 0 {
        while cpu.r[2] > cpu.r[0] {
            cpu.r[3] = cpu.r[3].wrapping_sub(1);
            let dst = cpu.r[3];
            cpu.write_v(bus, dst, 1, fill)?;
            cpu.r[2] -= 1;
        }
        while cpu.r[0] != 0 {
            let b = cpu.read_v(bus, cpu.r[1].wrapping_sub(1), 1)?;
            cpu.write_v(bus, cpu.r[3].wrapping_sub(1), 1, b)?;
            cpu.r[1] = cpu.r[1].wrapping_sub(1);
            cpu.r[3] = cpu.r[3].wrapping_sub(1);
            cpu.r[0] -= 1;
            cpu.r[2] -= 1;
        }
    } else {
        while cpu.r[0] != 0 && cpu.r[2] != 0 {
            let b = cpu.read_v(bus, cpu.r[1], 1)?;
            cpu.write_v(bus, cpu.r[3], 1, b)?;
            cpu.r[1] = cpu.r[1].wrapping_add(1);
            cpu.r[3] = cpu.r[3].wrapping_add(1);
            cpu.r[0] -= 1;
            cpu.r[2] -= 1;
        }
        while cpu.r[2] != 0 {
            let dst = cpu.r[3];
            cpu.write_v(bus, dst, 1, fill)?;
            cpu.r[3] = cpu.r[3].wrapping_add(1);
            cpu.r[2] -= 1;
        }
    }

    // Completion: the architectural register contract. The forward loop
    // leaves the cursors exactly on the final values; the backward walk
    // ends at the low addresses and needs the offsets put back.
    cpu.psl &= !PSL_FPD;
    if cpu.r[4] & 1 != 0 {
        cpu.r[0] = srclen - moved;
        cpu.r[1] = srcaddr.wrapping_add(moved);
        cpu.r[3] = dstaddr.wrapping_add(dstlen);
    }
    cpu.r[2] = 0;
    cpu.r[4] = 0;
    cpu.r[5] = 0;
    if FIVE {
        let n = (srclen as i32) < (dstlen as i32);
        cpu.set_cc(n, srclen == dstlen, false, srclen < dstlen);
    } else {
        cpu.set_cc(false, true, false, false);
    }
    Ok(())
}

fn op_locc<const SKIP: bool>(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let target = cpu.op_value(0) & 0xFF;
    if cpu.psl & PSL_FPD == 0 {
        cpu.r[0] = trunc(cpu.op_value(1), 2);
        cpu.r[1] = cpu.op_addr(2);
        cpu.psl |= PSL_FPD;
    }
    while cpu.r[0] != 0 {
        let b = cpu.read_v(bus, cpu.r[1], 1)?;
        let hit = if SKIP { b != target } else { b == target };
        if hit {
            break;
        }
        cpu.r[1] = cpu.r[1].wrapping_add(1);
        cpu.r[0] -= 1;
    }
    cpu.psl &= !PSL_FPD;
    cpu.set_cc(false, cpu.r[0] == 0, false, false);
    Ok(())
}

// ================= processor status =================

fn op_movpsl(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let psl = cpu.psl;
    cpu.op_write(bus, 0, 4, psl)
}

fn op_bispsw(cpu: &mut Vax, _bus: &mut VaxBus) -> ExecResult {
    let v = cpu.op_value(0);
    if v & 0xFF00 != 0 {
        return Err(VaxFault::ReservedOperand);
    }
    cpu.psl |= v;
    Ok(())
}

fn op_bicpsw(cpu: &mut Vax, _bus: &mut VaxBus) -> ExecResult {
    let v = cpu.op_value(0);
    if v & 0xFF00 != 0 {
        return Err(VaxFault::ReservedOperand);
    }
    cpu.psl &= !v;
    Ok(())
}

fn op_probe<const WRITE: bool>(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let mode = (cpu.op_value(0) & 3).max(cpu.prev_mode());
    let len = trunc(cpu.op_value(1), 2);
    let base = cpu.op_addr(2);
    let last = base.wrapping_add(len.saturating_sub(1));
    let ok = cpu.mmu.probe(&mut bus.mem, base, mode, WRITE)
        && cpu.mmu.probe(&mut bus.mem, last, mode, WRITE);
    let c = cpu.psl & PSL_C != 0;
    let n = cpu.psl & PSL_N != 0;
    cpu.set_cc(n, !ok, false, c);
    Ok(())
}

// ================= privileged & misc =================

fn op_halt(cpu: &mut Vax, _bus: &mut VaxBus) -> ExecResult {
    if cpu.cur_mode() != 0 {
        return Err(VaxFault::PrivilegedInstruction);
    }
    Err(VaxFault::Halt(STOP_HALT))
}

fn op_nop(_cpu: &mut Vax, _bus: &mut VaxBus) -> ExecResult {
    Ok(())
}

fn op_bpt(_cpu: &mut Vax, _bus: &mut VaxBus) -> ExecResult {
    Err(VaxFault::Breakpoint)
}

fn op_xfc(_cpu: &mut Vax, _bus: &mut VaxBus) -> ExecResult {
    Err(VaxFault::ReservedInstruction)
}

fn op_rei(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    cpu.rei(bus)
}

fn op_chm<const MODE: u32>(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let code = sxt(cpu.op_value(0), 2);
    cpu.chm(bus, MODE, code)
}

fn op_ldpctx(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    cpu.ldpctx(bus)
}

fn op_svpctx(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    cpu.svpctx(bus)
}

fn op_mtpr(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let value = cpu.op_value(0);
    let reg = cpu.op_value(1);
    cpu.mtpr(bus, reg, value)
}

fn op_mfpr(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let reg = cpu.op_value(0);
    let value = cpu.mfpr(bus, reg)?;
    cpu.op_write(bus, 1, 4, value)?;
    set_nz(cpu, value, 4, false, true);
    Ok(())
}

fn op_reserved(_cpu: &mut Vax, _bus: &mut VaxBus) -> ExecResult {
    Err(VaxFault::ReservedInstruction)
}

// ================= the instruction set =================

macro_rules! inst {
    ($op:expr, $name:expr, [$($spec:expr),*], $exec:expr) => {
        InstDef {
            opcode: $op,
            name: $name,
            specs: &[$($spec),*],
            exec: $exec,
        }
    };
}

pub static INSTRUCTIONS: &[InstDef] = &[
    inst!(0x00, "HALT", [], op_halt),
    inst!(0x01, "NOP", [], op_nop),
    inst!(0x02, "REI", [], op_rei),
    inst!(0x03, "BPT", [], op_bpt),
    inst!(0x04, "RET", [], op_ret),
    inst!(0x05, "RSB", [], op_rsb),
    inst!(0x06, "LDPCTX", [], op_ldpctx),
    inst!(0x07, "SVPCTX", [], op_svpctx),
    inst!(0x08, "CVTPS", [], op_reserved),
    inst!(0x09, "CVTSP", [], op_reserved),
    inst!(0x0A, "INDEX", [rl(), rl(), rl(), rl(), rl(), wl()], op_index),
    inst!(0x0B, "CRC", [], op_reserved),
    inst!(0x0C, "PROBER", [rb(), rw(), ab()], op_probe::<false>),
    inst!(0x0D, "PROBEW", [rb(), rw(), ab()], op_probe::<true>),
    inst!(0x0E, "INSQUE", [ab(), ab()], op_insque),
    inst!(0x0F, "REMQUE", [ab(), wl()], op_remque),
    inst!(0x10, "BSBB", [bb()], op_bsb),
    inst!(0x11, "BRB", [bb()], op_brx),
    inst!(0x12, "BNEQ", [bb()], op_bcond::<PSL_Z, false>),
    inst!(0x13, "BEQL", [bb()], op_bcond::<PSL_Z, true>),
    inst!(0x14, "BGTR", [bb()], op_bgtr::<{ PSL_N | PSL_Z }, true>),
    inst!(0x15, "BLEQ", [bb()], op_bgtr::<{ PSL_N | PSL_Z }, false>),
    inst!(0x16, "JSB", [ab()], op_jsb),
    inst!(0x17, "JMP", [ab()], op_jmp),
    inst!(0x18, "BGEQ", [bb()], op_bcond::<PSL_N, false>),
    inst!(0x19, "BLSS", [bb()], op_bcond::<PSL_N, true>),
    inst!(0x1A, "BGTRU", [bb()], op_bgtr::<{ PSL_C | PSL_Z }, true>),
    inst!(0x1B, "BLEQU", [bb()], op_bgtr::<{ PSL_C | PSL_Z }, false>),
    inst!(0x1C, "BVC", [bb()], op_bcond::<PSL_V, false>),
    inst!(0x1D, "BVS", [bb()], op_bcond::<PSL_V, true>),
    inst!(0x1E, "BCC", [bb()], op_bcond::<PSL_C, false>),
    inst!(0x1F, "BCS", [bb()], op_bcond::<PSL_C, true>),
    inst!(0x20, "ADDP4", [], op_reserved),
    inst!(0x21, "ADDP6", [], op_reserved),
    inst!(0x22, "SUBP4", [], op_reserved),
    inst!(0x23, "SUBP6", [], op_reserved),
    inst!(0x24, "CVTPT", [], op_reserved),
    inst!(0x25, "MULP", [], op_reserved),
    inst!(0x26, "CVTTP", [], op_reserved),
    inst!(0x27, "DIVP", [], op_reserved),
    inst!(0x28, "MOVC3", [rw(), ab(), ab()], op_movc::<false>),
    inst!(0x29, "CMPC3", [], op_reserved),
    inst!(0x2A, "SCANC", [], op_reserved),
    inst!(0x2B, "SPANC", [], op_reserved),
    inst!(0x2C, "MOVC5", [rw(), ab(), rb(), rw(), ab()], op_movc::<true>),
    inst!(0x2D, "CMPC5", [], op_reserved),
    inst!(0x2E, "MOVTC", [], op_reserved),
    inst!(0x2F, "MOVTUC", [], op_reserved),
    inst!(0x30, "BSBW", [bw()], op_bsb),
    inst!(0x31, "BRW", [bw()], op_brx),
    inst!(0x32, "CVTWL", [rw(), wl()], op_cvt::<2, 4>),
    inst!(0x33, "CVTWB", [rw(), wb()], op_cvt::<2, 1>),
    inst!(0x34, "MOVP", [], op_reserved),
    inst!(0x35, "CMPP3", [], op_reserved),
    inst!(0x36, "CVTPL", [], op_reserved),
    inst!(0x37, "CMPP4", [], op_reserved),
    inst!(0x38, "EDITPC", [], op_reserved),
    inst!(0x39, "MATCHC", [], op_reserved),
    inst!(0x3A, "LOCC", [rb(), rw(), ab()], op_locc::<false>),
    inst!(0x3B, "SKPC", [rb(), rw(), ab()], op_locc::<true>),
    inst!(0x3C, "MOVZWL", [rw(), wl()], op_movz::<2, 4>),
    inst!(0x3D, "ACBW", [rw(), rw(), mw(), bw()], op_acb::<2>),
    inst!(0x3E, "MOVAW", [aw(), wl()], op_mova::<2>),
    inst!(0x3F, "PUSHAW", [aw()], op_pusha::<2>),
    inst!(0x40, "ADDF2", [], op_reserved),
    inst!(0x41, "ADDF3", [], op_reserved),
    inst!(0x42, "SUBF2", [], op_reserved),
    inst!(0x43, "SUBF3", [], op_reserved),
    inst!(0x44, "MULF2", [], op_reserved),
    inst!(0x45, "MULF3", [], op_reserved),
    inst!(0x46, "DIVF2", [], op_reserved),
    inst!(0x47, "DIVF3", [], op_reserved),
    inst!(0x48, "CVTFB", [], op_reserved),
    inst!(0x49, "CVTFW", [], op_reserved),
    inst!(0x4A, "CVTFL", [], op_reserved),
    inst!(0x4B, "CVTRFL", [], op_reserved),
    inst!(0x4C, "CVTBF", [], op_reserved),
    inst!(0x4D, "CVTWF", [], op_reserved),
    inst!(0x4E, "CVTLF", [], op_reserved),
    inst!(0x4F, "ACBF", [], op_reserved),
    inst!(0x50, "MOVF", [], op_reserved),
    inst!(0x51, "CMPF", [], op_reserved),
    inst!(0x52, "MNEGF", [], op_reserved),
    inst!(0x53, "TSTF", [], op_reserved),
    inst!(0x54, "EMODF", [], op_reserved),
    inst!(0x55, "POLYF", [], op_reserved),
    inst!(0x56, "CVTFD", [], op_reserved),
    inst!(0x58, "ADAWI", [rw(), mw()], op_adawi),
    inst!(0x5C, "INSQHI", [ab(), aq()], op_insqx::<false>),
    inst!(0x5D, "INSQTI", [ab(), aq()], op_insqx::<true>),
    inst!(0x5E, "REMQHI", [aq(), wl()], op_remqx::<false>),
    inst!(0x5F, "REMQTI", [aq(), wl()], op_remqx::<true>),
    inst!(0x60, "ADDD2", [], op_reserved),
    inst!(0x61, "ADDD3", [], op_reserved),
    inst!(0x62, "SUBD2", [], op_reserved),
    inst!(0x63, "SUBD3", [], op_reserved),
    inst!(0x64, "MULD2", [], op_reserved),
    inst!(0x65, "MULD3", [], op_reserved),
    inst!(0x66, "DIVD2", [], op_reserved),
    inst!(0x67, "DIVD3", [], op_reserved),
    inst!(0x68, "CVTDB", [], op_reserved),
    inst!(0x69, "CVTDW", [], op_reserved),
    inst!(0x6A, "CVTDL", [], op_reserved),
    inst!(0x6B, "CVTRDL", [], op_reserved),
    inst!(0x6C, "CVTBD", [], op_reserved),
    inst!(0x6D, "CVTWD", [], op_reserved),
    inst!(0x6E, "CVTLD", [], op_reserved),
    inst!(0x6F, "ACBD", [], op_reserved),
    inst!(0x70, "MOVD", [], op_reserved),
    inst!(0x71, "CMPD", [], op_reserved),
    inst!(0x72, "MNEGD", [], op_reserved),
    inst!(0x73, "TSTD", [], op_reserved),
    inst!(0x74, "EMODD", [], op_reserved),
    inst!(0x75, "POLYD", [], op_reserved),
    inst!(0x76, "CVTDF", [], op_reserved),
    inst!(0x78, "ASHL", [rb(), rl(), wl()], op_ash::<false>),
    inst!(0x79, "ASHQ", [rb(), rq(), wq()], op_ash::<true>),
    inst!(0x7A, "EMUL", [rl(), rl(), rl(), wq()], op_emul),
    inst!(0x7B, "EDIV", [rl(), rq(), wl(), wl()], op_ediv),
    inst!(0x7C, "CLRQ", [wq()], op_clrq),
    inst!(0x7D, "MOVQ", [rq(), wq()], op_movq),
    inst!(0x7E, "MOVAQ", [aq(), wl()], op_mova::<8>),
    inst!(0x7F, "PUSHAQ", [aq()], op_pusha::<8>),
    inst!(0x80, "ADDB2", [rb(), mb()], op_add::<1, 2>),
    inst!(0x81, "ADDB3", [rb(), rb(), wb()], op_add::<1, 3>),
    inst!(0x82, "SUBB2", [rb(), mb()], op_sub::<1, 2>),
    inst!(0x83, "SUBB3", [rb(), rb(), wb()], op_sub::<1, 3>),
    inst!(0x84, "MULB2", [rb(), mb()], op_mul::<1, 2>),
    inst!(0x85, "MULB3", [rb(), rb(), wb()], op_mul::<1, 3>),
    inst!(0x86, "DIVB2", [rb(), mb()], op_div::<1, 2>),
    inst!(0x87, "DIVB3", [rb(), rb(), wb()], op_div::<1, 3>),
    inst!(0x88, "BISB2", [rb(), mb()], op_bis::<1, 2>),
    inst!(0x89, "BISB3", [rb(), rb(), wb()], op_bis::<1, 3>),
    inst!(0x8A, "BICB2", [rb(), mb()], op_bic::<1, 2>),
    inst!(0x8B, "BICB3", [rb(), rb(), wb()], op_bic::<1, 3>),
    inst!(0x8C, "XORB2", [rb(), mb()], op_xor::<1, 2>),
    inst!(0x8D, "XORB3", [rb(), rb(), wb()], op_xor::<1, 3>),
    inst!(0x8E, "MNEGB", [rb(), wb()], op_mneg::<1>),
    inst!(0x8F, "CASEB", [rb(), rb(), rb()], op_case::<1>),
    inst!(0x90, "MOVB", [rb(), wb()], op_move::<1>),
    inst!(0x91, "CMPB", [rb(), rb()], op_cmp::<1>),
    inst!(0x92, "MCOMB", [rb(), wb()], op_mcom::<1>),
    inst!(0x93, "BITB", [rb(), rb()], op_bit::<1>),
    inst!(0x94, "CLRB", [wb()], op_clr::<1>),
    inst!(0x95, "TSTB", [rb()], op_tst::<1>),
    inst!(0x96, "INCB", [mb()], op_inc::<1>),
    inst!(0x97, "DECB", [mb()], op_dec::<1>),
    inst!(0x98, "CVTBL", [rb(), wl()], op_cvt::<1, 4>),
    inst!(0x99, "CVTBW", [rb(), ww()], op_cvt::<1, 2>),
    inst!(0x9A, "MOVZBL", [rb(), wl()], op_movz::<1, 4>),
    inst!(0x9B, "MOVZBW", [rb(), ww()], op_movz::<1, 2>),
    inst!(0x9C, "ROTL", [rb(), rl(), wl()], op_rotl),
    inst!(0x9D, "ACBB", [rb(), rb(), mb(), bw()], op_acb::<1>),
    inst!(0x9E, "MOVAB", [ab(), wl()], op_mova::<1>),
    inst!(0x9F, "PUSHAB", [ab()], op_pusha::<1>),
    inst!(0xA0, "ADDW2", [rw(), mw()], op_add::<2, 2>),
    inst!(0xA1, "ADDW3", [rw(), rw(), ww()], op_add::<2, 3>),
    inst!(0xA2, "SUBW2", [rw(), mw()], op_sub::<2, 2>),
    inst!(0xA3, "SUBW3", [rw(), rw(), ww()], op_sub::<2, 3>),
    inst!(0xA4, "MULW2", [rw(), mw()], op_mul::<2, 2>),
    inst!(0xA5, "MULW3", [rw(), rw(), ww()], op_mul::<2, 3>),
    inst!(0xA6, "DIVW2", [rw(), mw()], op_div::<2, 2>),
    inst!(0xA7, "DIVW3", [rw(), rw(), ww()], op_div::<2, 3>),
    inst!(0xA8, "BISW2", [rw(), mw()], op_bis::<2, 2>),
    inst!(0xA9, "BISW3", [rw(), rw(), ww()], op_bis::<2, 3>),
    inst!(0xAA, "BICW2", [rw(), mw()], op_bic::<2, 2>),
    inst!(0xAB, "BICW3", [rw(), rw(), ww()], op_bic::<2, 3>),
    inst!(0xAC, "XORW2", [rw(), mw()], op_xor::<2, 2>),
    inst!(0xAD, "XORW3", [rw(), rw(), ww()], op_xor::<2, 3>),
    inst!(0xAE, "MNEGW", [rw(), ww()], op_mneg::<2>),
    inst!(0xAF, "CASEW", [rw(), rw(), rw()], op_case::<2>),
    inst!(0xB0, "MOVW", [rw(), ww()], op_move::<2>),
    inst!(0xB1, "CMPW", [rw(), rw()], op_cmp::<2>),
    inst!(0xB2, "MCOMW", [rw(), ww()], op_mcom::<2>),
    inst!(0xB3, "BITW", [rw(), rw()], op_bit::<2>),
    inst!(0xB4, "CLRW", [ww()], op_clr::<2>),
    inst!(0xB5, "TSTW", [rw()], op_tst::<2>),
    inst!(0xB6, "INCW", [mw()], op_inc::<2>),
    inst!(0xB7, "DECW", [mw()], op_dec::<2>),
    inst!(0xB8, "BISPSW", [rw()], op_bispsw),
    inst!(0xB9, "BICPSW", [rw()], op_bicpsw),
    inst!(0xBA, "POPR", [rw()], op_popr),
    inst!(0xBB, "PUSHR", [rw()], op_pushr),
    inst!(0xBC, "CHMK", [rw()], op_chm::<0>),
    inst!(0xBD, "CHME", [rw()], op_chm::<1>),
    inst!(0xBE, "CHMS", [rw()], op_chm::<2>),
    inst!(0xBF, "CHMU", [rw()], op_chm::<3>),
    inst!(0xC0, "ADDL2", [rl(), ml()], op_add::<4, 2>),
    inst!(0xC1, "ADDL3", [rl(), rl(), wl()], op_add::<4, 3>),
    inst!(0xC2, "SUBL2", [rl(), ml()], op_sub::<4, 2>),
    inst!(0xC3, "SUBL3", [rl(), rl(), wl()], op_sub::<4, 3>),
    inst!(0xC4, "MULL2", [rl(), ml()], op_mul::<4, 2>),
    inst!(0xC5, "MULL3", [rl(), rl(), wl()], op_mul::<4, 3>),
    inst!(0xC6, "DIVL2", [rl(), ml()], op_div::<4, 2>),
    inst!(0xC7, "DIVL3", [rl(), rl(), wl()], op_div::<4, 3>),
    inst!(0xC8, "BISL2", [rl(), ml()], op_bis::<4, 2>),
    inst!(0xC9, "BISL3", [rl(), rl(), wl()], op_bis::<4, 3>),
    inst!(0xCA, "BICL2", [rl(), ml()], op_bic::<4, 2>),
    inst!(0xCB, "BICL3", [rl(), rl(), wl()], op_bic::<4, 3>),
    inst!(0xCC, "XORL2", [rl(), ml()], op_xor::<4, 2>),
    inst!(0xCD, "XORL3", [rl(), rl(), wl()], op_xor::<4, 3>),
    inst!(0xCE, "MNEGL", [rl(), wl()], op_mneg::<4>),
    inst!(0xCF, "CASEL", [rl(), rl(), rl()], op_case::<4>),
    inst!(0xD0, "MOVL", [rl(), wl()], op_move::<4>),
    inst!(0xD1, "CMPL", [rl(), rl()], op_cmp::<4>),
    inst!(0xD2, "MCOML", [rl(), wl()], op_mcom::<4>),
    inst!(0xD3, "BITL", [rl(), rl()], op_bit::<4>),
    inst!(0xD4, "CLRL", [wl()], op_clr::<4>),
    inst!(0xD5, "TSTL", [rl()], op_tst::<4>),
    inst!(0xD6, "INCL", [ml()], op_inc::<4>),
    inst!(0xD7, "DECL", [ml()], op_dec::<4>),
    inst!(0xD8, "ADWC", [rl(), ml()], op_adwc),
    inst!(0xD9, "SBWC", [rl(), ml()], op_sbwc),
    inst!(0xDA, "MTPR", [rl(), rl()], op_mtpr),
    inst!(0xDB, "MFPR", [rl(), wl()], op_mfpr),
    inst!(0xDC, "MOVPSL", [wl()], op_movpsl),
    inst!(0xDD, "PUSHL", [rl()], op_pushl),
    inst!(0xDE, "MOVAL", [al(), wl()], op_mova::<4>),
    inst!(0xDF, "PUSHAL", [al()], op_pusha::<4>),
    inst!(0xE0, "BBS", [rl(), vb(), bb()], op_bbx::<true, 0>),
    inst!(0xE1, "BBC", [rl(), vb(), bb()], op_bbx::<false, 0>),
    inst!(0xE2, "BBSS", [rl(), vb(), bb()], op_bbx::<true, 1>),
    inst!(0xE3, "BBCS", [rl(), vb(), bb()], op_bbx::<false, 1>),
    inst!(0xE4, "BBSC", [rl(), vb(), bb()], op_bbx::<true, 2>),
    inst!(0xE5, "BBCC", [rl(), vb(), bb()], op_bbx::<false, 2>),
    inst!(0xE6, "BBSSI", [rl(), vb(), bb()], op_bbx::<true, 1>),
    inst!(0xE7, "BBCCI", [rl(), vb(), bb()], op_bbx::<false, 2>),
    inst!(0xE8, "BLBS", [rl(), bb()], op_blb::<true>),
    inst!(0xE9, "BLBC", [rl(), bb()], op_blb::<false>),
    inst!(0xEA, "FFS", [rl(), rb(), vb(), wl()], op_ffx::<true>),
    inst!(0xEB, "FFC", [rl(), rb(), vb(), wl()], op_ffx::<false>),
    inst!(0xEC, "CMPV", [rl(), rb(), vb(), rl()], op_cmpv::<true>),
    inst!(0xED, "CMPZV", [rl(), rb(), vb(), rl()], op_cmpv::<false>),
    inst!(0xEE, "EXTV", [rl(), rb(), vb(), wl()], op_extv::<true>),
    inst!(0xEF, "EXTZV", [rl(), rb(), vb(), wl()], op_extv::<false>),
    inst!(0xF0, "INSV", [rl(), rl(), rb(), vb()], op_insv),
    inst!(0xF1, "ACBL", [rl(), rl(), ml(), bw()], op_acb::<4>),
    inst!(0xF2, "AOBLSS", [rl(), ml(), bb()], op_aob::<false>),
    inst!(0xF3, "AOBLEQ", [rl(), ml(), bb()], op_aob::<true>),
    inst!(0xF4, "SOBGEQ", [ml(), bb()], op_sob::<false>),
    inst!(0xF5, "SOBGTR", [ml(), bb()], op_sob::<true>),
    inst!(0xF6, "CVTLB", [rl(), wb()], op_cvt::<4, 1>),
    inst!(0xF7, "CVTLW", [rl(), ww()], op_cvt::<4, 2>),
    inst!(0xF8, "ASHP", [], op_reserved),
    inst!(0xF9, "CVTLP", [], op_reserved),
    inst!(0xFA, "CALLG", [ab(), ab()], op_callg),
    inst!(0xFB, "CALLS", [rl(), ab()], op_calls),
    inst!(0xFC, "XFC", [], op_xfc),
];

// ================= queues =================

/// INSQUE entry,pred: link entry after pred in a doubly-linked queue.
fn op_insque(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let entry = cpu.op_addr(0);
    let pred = cpu.op_addr(1);
    let succ = cpu.read_v(bus, pred, 4)?;
    cpu.write_v(bus, entry, 4, succ)?;
    cpu.write_v(bus, entry.wrapping_add(4), 4, pred)?;
    cpu.write_v(bus, pred, 4, entry)?;
    cpu.write_v(bus, succ.wrapping_add(4), 4, entry)?;
    // Z set when the queue was empty before the insert.
    cpu.set_cc(false, succ == pred, false, false);
    Ok(())
}

/// REMQUE entry,addr: unlink entry, return its address.
fn op_remque(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let entry = cpu.op_addr(0);
    let succ = cpu.read_v(bus, entry, 4)?;
    let pred = cpu.read_v(bus, entry.wrapping_add(4), 4)?;
    cpu.write_v(bus, pred, 4, succ)?;
    cpu.write_v(bus, succ.wrapping_add(4), 4, pred)?;
    cpu.op_write(bus, 1, 4, entry)?;
    cpu.set_cc(false, succ == pred, false, false);
    Ok(())
}

/// INSQHI/INSQTI: interlocked insert into a self-relative queue. Links
/// are displacements from the longword that holds them; the instruction-
/// atomic model makes the interlock implicit.
fn op_insqx<const TAIL: bool>(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let entry = cpu.op_addr(0);
    let header = cpu.op_addr(1);
    if entry & 7 != 0 || header & 7 != 0 {
        return Err(VaxFault::ReservedOperand);
    }
    let was_empty = cpu.read_v(bus, header, 4)? == 0;
    if TAIL {
        let last = header.wrapping_add(cpu.read_v(bus, header.wrapping_add(4), 4)?);
        cpu.write_v(bus, entry, 4, header.wrapping_sub(entry))?;
        cpu.write_v(bus, entry.wrapping_add(4), 4, last.wrapping_sub(entry))?;
        cpu.write_v(bus, last, 4, entry.wrapping_sub(last))?;
        cpu.write_v(bus, header.wrapping_add(4), 4, entry.wrapping_sub(header))?;
    } else {
        let first = header.wrapping_add(cpu.read_v(bus, header, 4)?);
        cpu.write_v(bus, entry, 4, first.wrapping_sub(entry))?;
        cpu.write_v(bus, entry.wrapping_add(4), 4, header.wrapping_sub(entry))?;
        cpu.write_v(bus, first.wrapping_add(4), 4, entry.wrapping_sub(first))?;
        cpu.write_v(bus, header, 4, entry.wrapping_sub(header))?;
    }
    cpu.set_cc(false, was_empty, false, false);
    Ok(())
}

/// REMQHI/REMQTI: interlocked removal. V reports an empty queue.
fn op_remqx<const TAIL: bool>(cpu: &mut Vax, bus: &mut VaxBus) -> ExecResult {
    let header = cpu.op_addr(0);
    if header & 7 != 0 {
        return Err(VaxFault::ReservedOperand);
    }
    let link = if TAIL {
        cpu.read_v(bus, header.wrapping_add(4), 4)?
    } else {
        cpu.read_v(bus, header, 4)?
    };
    if link == 0 {
        cpu.op_write(bus, 1, 4, header)?;
        cpu.set_cc(false, true, true, false);
        return Ok(());
    }
    let entry = header.wrapping_add(link);
    if TAIL {
        let pred = entry.wrapping_add(cpu.read_v(bus, entry.wrapping_add(4), 4)?);
        cpu.write_v(bus, header.wrapping_add(4), 4, if pred == header { 0 } else { pred.wrapping_sub(header) })?;
        cpu.write_v(bus, pred, 4, header.wrapping_sub(pred))?;
        if pred == header {
            cpu.write_v(bus, header, 4, 0)?;
        }
    } else {
        let next = entry.wrapping_add(cpu.read_v(bus, entry, 4)?);
        cpu.write_v(bus, header, 4, if next == header { 0 } else { next.wrapping_sub(header) })?;
        cpu.write_v(bus, next.wrapping_add(4), 4, header.wrapping_sub(next))?;
        if next == header {
            cpu.write_v(bus, header.wrapping_add(4), 4, 0)?;
        }
    }
    let now_empty = cpu.read_v(bus, header, 4)? == 0;
    cpu.op_write(bus, 1, 4, entry)?;
    cpu.set_cc(false, now_empty, false, false);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vax::cty::Cty;
    use crate::vax::cpu::PSL_Z as Z;

    fn machine() -> (Vax, VaxBus) {
        let mut cpu = Vax::new();
        let bus = VaxBus::new(1, Cty::new(None));
        cpu.psl = 0;
        cpu.scbb = 0x400;
        cpu.r[14] = 0x4000;
        (cpu, bus)
    }

    fn run(cpu: &mut Vax, bus: &mut VaxBus, bytes: &[u8]) {
        for (k, b) in bytes.iter().enumerate() {
            bus.mem.write(0x1000 + k as u32, 1, *b as u32).unwrap();
        }
        cpu.set_pc(0x1000);
        cpu.step(bus).unwrap();
    }

    #[test]
    fn addl2_overflow_scenario() {
        // ADDL2 #1, R0 with R0 = 0x7FFFFFFF: N and V set, Z and C clear.
        let (mut cpu, mut bus) = machine();
        cpu.r[0] = 0x7FFF_FFFF;
        run(&mut cpu, &mut bus, &[0xC0, 0x01, 0x50]);
        assert_eq!(cpu.r[0], 0x8000_0000);
        assert_ne!(cpu.psl & PSL_V, 0);
        assert_ne!(cpu.psl & crate::vax::cpu::PSL_N, 0);
        assert_eq!(cpu.psl & Z, 0);
        assert_eq!(cpu.psl & PSL_C, 0);
        // IV clear: no trap queued.
        assert_eq!(cpu.trap_code, 0);

        // With IV set the trap code is 1.
        cpu.psl |= PSW_IV;
        cpu.r[0] = 0x7FFF_FFFF;
        run(&mut cpu, &mut bus, &[0xC0, 0x01, 0x50]);
        assert_eq!(cpu.trap_code, TRAP_INTOVF);
    }

    #[test]
    fn movl_between_memory_and_register() {
        let (mut cpu, mut bus) = machine();
        bus.mem.write(0x2000, 4, 0xDEAD_BEEF).unwrap();
        cpu.r[1] = 0x2000;
        // MOVL (R1)+, R2
        run(&mut cpu, &mut bus, &[0xD0, 0x81, 0x52]);
        assert_eq!(cpu.r[2], 0xDEAD_BEEF);
        assert_eq!(cpu.r[1], 0x2004);
        assert_ne!(cpu.psl & crate::vax::cpu::PSL_N, 0);
    }

    #[test]
    fn subl3_and_cmp() {
        let (mut cpu, mut bus) = machine();
        cpu.r[1] = 10;
        // SUBL3 #3, R1, R2 -> R2 = 7
        run(&mut cpu, &mut bus, &[0xC3, 0x03, 0x51, 0x52]);
        assert_eq!(cpu.r[2], 7);

        // CMPL R1, #10 -> Z
        run(&mut cpu, &mut bus, &[0xD1, 0x51, 0x0A]);
        assert_ne!(cpu.psl & Z, 0);
    }

    #[test]
    fn branches() {
        let (mut cpu, mut bus) = machine();
        cpu.psl |= Z;
        // BEQL .+4 (disp 2)
        run(&mut cpu, &mut bus, &[0x13, 0x02]);
        assert_eq!(cpu.pc(), 0x1004);
        // BNEQ not taken.
        run(&mut cpu, &mut bus, &[0x12, 0x02]);
        assert_eq!(cpu.pc(), 0x1002);
    }

    #[test]
    fn sobgtr_loops() {
        let (mut cpu, mut bus) = machine();
        cpu.r[3] = 2;
        // SOBGTR R3, .-2: taken once (2 -> 1), branch displacement -3.
        run(&mut cpu, &mut bus, &[0xF5, 0x53, 0xFD]);
        assert_eq!(cpu.r[3], 1);
        assert_eq!(cpu.pc(), 0x1000);
    }

    #[test]
    fn calls_ret_roundtrip() {
        let (mut cpu, mut bus) = machine();
        cpu.r[14] = 0x4000;
        cpu.r[2] = 0x1234_5678;
        // Procedure at 0x2000 with entry mask saving R2.
        bus.mem.write(0x2000, 2, 0x0004).unwrap();
        // CALLS #0, @#0x2000
        run(&mut cpu, &mut bus, &[0xFB, 0x00, 0x9F, 0x00, 0x20, 0x00, 0x00]);
        assert_eq!(cpu.pc(), 0x2002);
        assert_eq!(cpu.r[12], 0x4000 - 4); // AP at the pushed arg count
        let fp = cpu.r[13];
        cpu.r[2] = 0;

        // RET restores R2 and the return PC.
        bus.mem.write(0x3000, 1, 0x04).unwrap(); // RET
        cpu.set_pc(0x3000);
        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.r[2], 0x1234_5678);
        assert_eq!(cpu.pc(), 0x1007);
        assert_eq!(cpu.r[14], 0x4000);
        let _ = fp;
    }

    #[test]
    fn field_extract_insert() {
        let (mut cpu, mut bus) = machine();
        bus.mem.write(0x2000, 4, 0b1011_0000).unwrap();
        cpu.r[1] = 0x2000;
        // EXTZV #4, #4, (R1), R2 -> 0b1011
        run(&mut cpu, &mut bus, &[0xEF, 0x04, 0x04, 0x61, 0x52]);
        assert_eq!(cpu.r[2], 0b1011);

        // INSV R3, #8, #8, (R1)
        cpu.r[3] = 0xAB;
        run(&mut cpu, &mut bus, &[0xF0, 0x53, 0x08, 0x08, 0x61]);
        assert_eq!(bus.mem.read(0x2000, 4).unwrap(), 0xAB00 | 0b1011_0000);
    }

    #[test]
    fn movc3_copies_and_clears_state() {
        let (mut cpu, mut bus) = machine();
        for k in 0..5u32 {
            bus.mem.write(0x2000 + k, 1, 0x30 + k).unwrap();
        }
        // MOVC3 #5, @#0x2000, @#0x3000
        run(
            &mut cpu,
            &mut bus,
            &[
                0x28, 0x05, 0x9F, 0x00, 0x20, 0x00, 0x00, 0x9F, 0x00, 0x30, 0x00, 0x00,
            ],
        );
        for k in 0..5u32 {
            assert_eq!(bus.mem.read(0x3000 + k, 1).unwrap(), 0x30 + k);
        }
        assert_eq!(cpu.r[0], 0);
        assert_eq!(cpu.r[1], 0x2005);
        assert_eq!(cpu.r[3], 0x3005);
        assert_ne!(cpu.psl & Z, 0);
        assert_eq!(cpu.psl & PSL_FPD, 0);
    }

    #[test]
    fn case_dispatch() {
        let (mut cpu, mut bus) = machine();
        cpu.r[1] = 2;
        // CASEB R1, #0, #3 followed by a 4-entry displacement table.
        let table: &[u8] = &[
            0x8F, 0x51, 0x00, 0x03, // CASEB R1, #0, #3
            0x10, 0x00, // disp[0]
            0x20, 0x00, // disp[1]
            0x30, 0x00, // disp[2]
            0x40, 0x00, // disp[3]
        ];
        run(&mut cpu, &mut bus, table);
        // Table base is 0x1004; entry 2 = 0x30.
        assert_eq!(cpu.pc(), 0x1004 + 0x30);
    }

    #[test]
    fn division_by_zero_traps() {
        let (mut cpu, mut bus) = machine();
        cpu.r[1] = 42;
        // DIVL2 #0, R1
        run(&mut cpu, &mut bus, &[0xC6, 0x00, 0x51]);
        assert_eq!(cpu.r[1], 42);
        assert_eq!(cpu.trap_code, TRAP_INTDIV);
        assert_ne!(cpu.psl & PSL_V, 0);
    }

    #[test]
    fn insque_remque_roundtrip() {
        let (mut cpu, mut bus) = machine();
        // Empty queue header at 0x2000 pointing at itself.
        bus.mem.write(0x2000, 4, 0x2000).unwrap();
        bus.mem.write(0x2004, 4, 0x2000).unwrap();
        // INSQUE @#0x2100, @#0x2000
        run(
            &mut cpu,
            &mut bus,
            &[0x0E, 0x9F, 0x00, 0x21, 0x00, 0x00, 0x9F, 0x00, 0x20, 0x00, 0x00],
        );
        assert_eq!(bus.mem.read(0x2000, 4).unwrap(), 0x2100);
        assert_ne!(cpu.psl & Z, 0); // was empty

        // REMQUE @#0x2100, R5
        run(
            &mut cpu,
            &mut bus,
            &[0x0F, 0x9F, 0x00, 0x21, 0x00, 0x00, 0x55],
        );
        assert_eq!(cpu.r[5], 0x2100);
        assert_eq!(bus.mem.read(0x2000, 4).unwrap(), 0x2000);
    }
}
