//! End-to-end scenarios: each drives a whole machine the way its system
//! software would, checking the architectural contract at the edges.

use ts10::devices::DmaBus;
use ts10::pdp10;
use ts10::pdp10::fe::FrontEnd;
use ts10::pdp10::word;
use ts10::vax::cpu::{Vax, PSL_C, PSL_N, PSL_V, PSL_Z, PSW_IV};
use ts10::vax::cty::{Cty, RXCS_IE, RXCS_RDY};
use ts10::vax::mmu::PTE_V;
use ts10::vax::VaxBus;

fn vax_machine() -> (Vax, VaxBus) {
    let mut cpu = Vax::new();
    let mut bus = VaxBus::new(1, Cty::new(None));
    cpu.psl = 0; // kernel, IPL 0
    cpu.scbb = 0x400;
    cpu.r[14] = 0x4000;
    cpu.sp_bank[4] = 0x3800;
    let _ = &mut bus;
    (cpu, bus)
}

fn put_code(bus: &mut VaxBus, addr: u32, bytes: &[u8]) {
    for (k, b) in bytes.iter().enumerate() {
        bus.mem.write(addr + k as u32, 1, *b as u32).unwrap();
    }
}

/// S1: integer add with overflow, with and without the IV trap.
#[test]
fn s1_integer_add_with_overflow() {
    let (mut cpu, mut bus) = vax_machine();
    cpu.r[0] = 0x7FFF_FFFF;
    put_code(&mut bus, 0x1000, &[0xC0, 0x01, 0x50]); // ADDL2 #1, R0
    cpu.set_pc(0x1000);
    cpu.step(&mut bus).unwrap();

    assert_eq!(cpu.r[0], 0x8000_0000);
    assert_ne!(cpu.psl & PSL_V, 0);
    assert_ne!(cpu.psl & PSL_N, 0);
    assert_eq!(cpu.psl & PSL_Z, 0);
    assert_eq!(cpu.psl & PSL_C, 0);

    // With PSL.IV the trap delivers after the instruction, pushing the
    // integer-overflow code.
    bus.mem.write(0x400 + 0x34, 4, 0x2000).unwrap(); // SCB_ARITH
    cpu.psl |= PSW_IV;
    cpu.r[0] = 0x7FFF_FFFF;
    cpu.set_pc(0x1000);
    cpu.step(&mut bus).unwrap(); // executes, queues the trap
    cpu.step(&mut bus).unwrap(); // delivers it
    assert_eq!(cpu.pc(), 0x2000);
    assert_eq!(bus.mem.read(cpu.r[14], 4).unwrap(), 1); // trap code
}

/// S2: a page fault rolls the autoincrement back, the OS validates the
/// PTE and returns, and the instruction restarts to completion.
#[test]
fn s2_page_fault_restart() {
    let (mut cpu, mut bus) = vax_machine();

    // S0 identity map over the first 128 KB: system page table at 0x1000.
    cpu.mmu.sbr = 0x1000;
    cpu.mmu.slr = 0x100;
    for vpn in 0..0x100u32 {
        bus.mem
            .write(0x1000 + vpn * 4, 4, PTE_V | (0x4 << 27) | vpn)
            .unwrap();
    }
    // P0 page table at phys 0x2000, reached through system space.
    cpu.mmu.p0br = 0x8000_2000;
    cpu.mmu.p0lr = 0x10;
    // PTE for VA 0x1000 (vpn 8): frame 0x100, user-writable, NOT valid.
    bus.mem.write(0x2020, 4, (0x4 << 27) | 0x100).unwrap();
    bus.mem.write(0x100 << 9, 4, 0xCAFE_BABE).unwrap();
    cpu.mmu.mapen = true;

    // Code, stack and handler all live in mapped system space.
    put_code(&mut bus, 0x3000, &[0xD0, 0x81, 0x52]); // MOVL (R1)+, R2
    put_code(&mut bus, 0x5000, &[0x02]); // REI
    bus.mem.write(0x400 + 0x24, 4, 0x8000_5000).unwrap(); // SCB_TNV
    cpu.r[14] = 0x8000_4000;
    cpu.r[1] = 0x1000;
    cpu.set_pc(0x8000_3000);

    // First step faults: autoincrement undone, parameters pushed.
    cpu.step(&mut bus).unwrap();
    assert_eq!(cpu.pc(), 0x8000_5000);
    assert_eq!(cpu.r[1], 0x1000);
    assert_eq!(cpu.r[2], 0);
    let sp = cpu.r[14];
    assert_eq!(bus.mem.read(sp & 0xFFFF, 4).unwrap(), 0); // fault parameter (read)
    assert_eq!(bus.mem.read((sp + 4) & 0xFFFF, 4).unwrap(), 0x1000); // faulting VA
    assert_eq!(bus.mem.read((sp + 8) & 0xFFFF, 4).unwrap(), 0x8000_3000); // saved PC

    // The handler validates the PTE, pops the parameters and returns.
    bus.mem.write(0x2020, 4, PTE_V | (0x4 << 27) | 0x100).unwrap();
    cpu.r[14] += 8;
    cpu.step(&mut bus).unwrap(); // REI
    assert_eq!(cpu.pc(), 0x8000_3000);

    // The restarted instruction completes.
    cpu.step(&mut bus).unwrap();
    assert_eq!(cpu.r[1], 0x1004);
    assert_eq!(cpu.r[2], 0xCAFE_BABE);
}

/// S3: APRID identification word, exactly as the KS10 reports itself.
#[test]
fn s3_ks10_aprid() {
    let mut cpu = pdp10::cpu::Cpu::new();
    let mut sys = pdp10::Ks10::new(64, FrontEnd::new(None));
    // APRID 0,100 at PC 200.
    sys.mem.poke(0o200, (0o700u64 << 27) | 0o100);
    cpu.pc = 0o200;
    cpu.step(&mut sys).unwrap();

    let expect = (0o600u64 << 27) | (0o130 << 18) | 0 | 4096;
    assert_eq!(sys.mem.peek(0o100), expect);
}

/// S4: a software interrupt requested at IPL 0 delivers through the
/// software vector at the next boundary and clears its SISR bit.
#[test]
fn s4_software_interrupt() {
    let (mut cpu, mut bus) = vax_machine();
    bus.mem.write(0x400 + 0x90, 4, 0x2000).unwrap(); // 0x84 + 4*3
    put_code(&mut bus, 0x1000, &[0xDA, 0x04, 0x14]); // MTPR #4, #SIRR
    cpu.set_pc(0x1000);

    cpu.step(&mut bus).unwrap();
    assert_eq!(cpu.sisr & (1 << 4), 1 << 4);
    assert_eq!(cpu.pending_ipl, 4);

    cpu.step(&mut bus).unwrap();
    assert_eq!(cpu.pc(), 0x2000);
    assert_eq!(cpu.ipl(), 4);
    assert_eq!(cpu.sisr & (1 << 4), 0);
}

/// S5: Unibus DMA readback through the page map, then the NXM latch when
/// the map entry goes away.
#[test]
fn s5_unibus_dma_readback() {
    let mut sys = pdp10::Ks10::new(512, FrontEnd::new(None));
    // Map slot 0 -> physical frame 0x100, valid.
    sys.uba
        .write_internal(1, 0o763000, (0o40000u64 | 0x100) as word::Word);

    let out = [0x2211u16, 0x4433]; // bytes 11 22 33 44 on bus addresses 0-3
    {
        let mut dma = pdp10::uba::UbaDma {
            slot: &mut sys.uba.slots[1],
            mem: &mut sys.mem,
        };
        assert_eq!(dma.write_block(0, &out), 0);
        let mut back = [0u16; 2];
        assert_eq!(dma.read_block(0, &mut back), 0);
        assert_eq!(back, out);
    }

    // Invalidate the slot and repeat: truncation plus the NXM-error bit.
    sys.uba.write_internal(1, 0o763000, 0);
    {
        let mut dma = pdp10::uba::UbaDma {
            slot: &mut sys.uba.slots[1],
            mem: &mut sys.mem,
        };
        assert_eq!(dma.write_block(0, &out), 4);
    }
    assert_ne!(sys.uba.slots[1].sr & pdp10::uba::SR_TIM, 0);

    // A CPU reference to an unanswered IO address takes the IO-flagged
    // page-fail trap.
    sys.pager.write_ebr(0o20000 | 3); // paging on so the trap is armed
    let bad = (1u64 << 18) | 0o740000;
    assert_eq!(
        sys.io_read(bad, false, false),
        Err(pdp10::P10Fault::PageFail)
    );
    assert_ne!(word::lh(sys.pager.pfw) & pdp10::pager::PFW_IO, 0);
}

/// S6: console character round trip: queue tick, ready bit, vector at
/// BR4, read clears ready.
#[test]
fn s6_console_roundtrip() {
    let (mut cpu, mut bus) = vax_machine();
    bus.mem.write(0x400 + 0xF8, 4, 0x2000).unwrap(); // SCB_CTYIN

    bus.cty.write_rxcs(RXCS_IE);
    {
        let VaxBus { cty, clock, .. } = &mut bus;
        cty.input_char(0x41, clock);
    }
    assert_ne!(bus.cty.rxcs & RXCS_RDY, 0);
    assert!(bus.cty.rx_irq);

    // The next instruction boundary takes the interrupt at the console
    // IPL through the receive vector.
    put_code(&mut bus, 0x1000, &[0x01]); // NOP it never reaches
    cpu.set_pc(0x1000);
    cpu.step(&mut bus).unwrap();
    assert_eq!(cpu.pc(), 0x2000);
    assert_eq!(cpu.ipl(), 0x14);

    // Reading the buffer returns the character and clears ready.
    let value = {
        let VaxBus { cty, clock, .. } = &mut bus;
        cty.read_rxdb(clock)
    };
    assert_eq!(value & 0xFF, 0x41);
    assert_eq!(bus.cty.rxcs & RXCS_RDY, 0);
}

/// Invariant 1: repeated reads with no intervening writes return the same
/// value, across a translation-cache fill.
#[test]
fn invariant_stable_reads() {
    let mut sys = pdp10::Ks10::new(512, FrontEnd::new(None));
    let mut cpu = pdp10::cpu::Cpu::new();
    sys.pager.write_ebr(0o20000 | 3);
    sys.pager.write_ubr(0o100000000000 | 4);
    // User page 0 mapped writable at frame 0o20.
    sys.mem
        .poke(0o4000, word::xwd(0o400000 | 0o100000 | 0o020000 | 0o20, 0));
    sys.mem.poke(0o20 << 9 | 0o123, 0o777);

    cpu.flags = word::FLG_USER;
    let mode = pdp10::pager::PTF_USER;
    let first = cpu.vread(&mut sys, 0o123, mode).unwrap();
    let second = cpu.vread(&mut sys, 0o123, mode).unwrap();
    assert_eq!(first, 0o777);
    assert_eq!(first, second);
}
