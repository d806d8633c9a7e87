use crate::pdp10::word::Word;
use tracing::debug;

// WRAPR strobe bits and fields (right half of E).
pub const APR_ENABLE: Word = 0o100000;
pub const APR_DISABLE: Word = 0o040000;
pub const APR_CLEAR: Word = 0o020000;
pub const APR_SET: Word = 0o010000;
pub const APR_FLAGS: Word = 0o007760;
pub const APR_IRQ: Word = 0o000010;
pub const APR_LEVEL: Word = 0o000007;

// System flags.
pub const APRF_FLAG24: Word = 0o4000;
pub const APRF_INT_CON: Word = 0o2000; // interrupt the 8080 console
pub const APRF_POWER_FAIL: Word = 0o1000;
pub const APRF_NO_MEMORY: Word = 0o0400;
pub const APRF_BAD_MEM_DATA: Word = 0o0200;
pub const APRF_COR_MEM_DATA: Word = 0o0100;
pub const APRF_INT_DONE: Word = 0o0040; // interval timer done
pub const APRF_CON_INT: Word = 0o0020; // console attention

/// Arithmetic Processor System flags: the KS10's processor-internal
/// interrupt conditions, all funneled to one assignable PI level.
pub struct Apr {
    pub enables: Word,
    pub flags: Word,
    pub level: usize,
}

impl Apr {
    pub fn new() -> Self {
        Self {
            enables: 0,
            flags: 0,
            level: 0,
        }
    }

    pub fn reset(&mut self) {
        self.enables = 0;
        self.flags = 0;
        self.level = 0;
    }

    /// Latch a condition flag. Returns true when the condition is enabled,
    /// i.e. the caller should re-evaluate the PI system.
    pub fn interrupt(&mut self, flag: Word) -> bool {
        self.flags |= flag;
        (self.enables & flag) != 0
    }

    pub fn irq_active(&self) -> bool {
        (self.enables & self.flags) != 0
    }

    /// WRAPR: atomically enable/disable/set/clear the selected flags and
    /// load the PI assignment. Returns the INT-CON strobe state so the
    /// front end can run its output side.
    pub fn write(&mut self, e: Word) -> bool {
        let flags = e & APR_FLAGS;
        self.level = (e & APR_LEVEL) as usize;
        if (e & APR_ENABLE) != 0 {
            self.enables |= flags;
        }
        if (e & APR_DISABLE) != 0 {
            self.enables &= !flags;
        }
        if (e & APR_SET) != 0 {
            self.flags |= flags;
        }
        if (e & APR_CLEAR) != 0 {
            self.flags &= !flags;
        }
        debug!(
            "APR: enables {:06o} flags {:06o} level {}",
            self.enables, self.flags, self.level
        );
        if (self.flags & APRF_INT_CON) != 0 {
            self.flags &= !APRF_INT_CON;
            true
        } else {
            false
        }
    }

    /// RDAPR status composition.
    pub fn read(&self) -> Word {
        (if self.irq_active() { APR_IRQ } else { 0 })
            | (self.enables << 18)
            | self.flags
            | self.level as Word
    }

    /// CONSO/CONSZ APR use only the right half.
    pub fn status_rh(&self) -> Word {
        (if self.irq_active() { APR_IRQ } else { 0 }) | self.flags | self.level as Word
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapr_strobes() {
        let mut apr = Apr::new();
        apr.write(APR_ENABLE | APRF_INT_DONE | 5);
        assert_eq!(apr.enables, APRF_INT_DONE);
        assert_eq!(apr.level, 5);
        assert!(!apr.irq_active());

        assert!(apr.interrupt(APRF_INT_DONE));
        assert!(apr.irq_active());
        assert_ne!(apr.read() & APR_IRQ, 0);

        apr.write(APR_CLEAR | APRF_INT_DONE | 5);
        assert!(!apr.irq_active());
    }

    #[test]
    fn int_con_strobe_fires_console_output() {
        let mut apr = Apr::new();
        assert!(apr.write(APR_SET | APRF_INT_CON));
        // The strobe is self-clearing.
        assert_eq!(apr.flags & APRF_INT_CON, 0);
    }

    #[test]
    fn disabled_condition_latches_quietly() {
        let mut apr = Apr::new();
        assert!(!apr.interrupt(APRF_NO_MEMORY));
        assert_ne!(apr.flags & APRF_NO_MEMORY, 0);
    }
}
