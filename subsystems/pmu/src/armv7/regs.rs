//! # Architected PMU Registers
//!
//! Register access for the ARMv7 PMU (CP15 c9) and the ARMv8 PMUv3
//! (`PM*_EL0` system registers), which share one layout.
//!
//! | ARMv7 (CP15)         | PMUv3             | Description                  |
//! |----------------------|-------------------|------------------------------|
//! | PMNC   c9,c12,0      | PMCR_EL0          | control                      |
//! | CNTENS c9,c12,1      | PMCNTENSET_EL0    | counter enable set           |
//! | CNTENC c9,c12,2      | PMCNTENCLR_EL0    | counter enable clear         |
//! | FLAG   c9,c12,3      | PMOVSCLR_EL0      | overflow flags (W1C)         |
//! | SELECT c9,c12,5      | PMSELR_EL0        | event counter select         |
//! | CCNT   c9,c13,0      | PMCCNTR_EL0       | cycle counter                |
//! | XEVTYPER c9,c13,1    | PMXEVTYPER_EL0    | selected counter event type  |
//! | XEVCNTR c9,c13,2     | PMXEVCNTR_EL0     | selected counter value       |
//! | INTENS c9,c14,1      | PMINTENSET_EL1    | interrupt enable set         |
//! | INTENC c9,c14,2      | PMINTENCLR_EL1    | interrupt enable clear       |

/// Access to the architected PMU register file of the executing CPU
pub trait Armv7Registers: Send + Sync {
    /// Read the control register
    fn read_pmnc(&self) -> u32;
    /// Write the control register
    fn write_pmnc(&self, value: u32);

    /// Set counter enable bits
    fn write_cntens(&self, mask: u32);
    /// Clear counter enable bits
    fn write_cntenc(&self, mask: u32);

    /// Set interrupt enable bits
    fn write_intens(&self, mask: u32);
    /// Clear interrupt enable bits
    fn write_intenc(&self, mask: u32);

    /// Read the overflow flags
    fn read_flags(&self) -> u32;
    /// Clear the overflow flags in `mask`
    fn write_flags(&self, mask: u32);

    /// Select event counter `counter` for the `XEV*` registers
    fn write_select(&self, counter: u32);

    /// Read the cycle counter
    fn read_ccnt(&self) -> u32;
    /// Write the cycle counter
    fn write_ccnt(&self, value: u32);

    /// Write the event type of the selected counter
    fn write_xevtyper(&self, value: u32);
    /// Read the selected counter
    fn read_xevcntr(&self) -> u32;
    /// Write the selected counter
    fn write_xevcntr(&self, value: u32);
}

// ============================================================================
// ARMv7 CP15
// ============================================================================

#[cfg(target_arch = "arm")]
mod cp15 {
    use core::arch::asm;

    use super::Armv7Registers;

    macro_rules! cp15_read {
        ($crn:literal, $crm:literal, $op2:literal) => {{
            let value: u32;
            unsafe {
                asm!(
                    concat!("mrc p15, 0, {}, ", $crn, ", ", $crm, ", ", $op2),
                    out(reg) value,
                    options(nomem, nostack, preserves_flags)
                );
            }
            value
        }};
    }

    macro_rules! cp15_write {
        ($crn:literal, $crm:literal, $op2:literal, $value:expr) => {{
            unsafe {
                asm!(
                    concat!("mcr p15, 0, {}, ", $crn, ", ", $crm, ", ", $op2),
                    in(reg) $value,
                    options(nomem, nostack)
                );
            }
        }};
    }

    #[inline]
    fn isb() {
        unsafe { asm!("isb", options(nostack, preserves_flags)) };
    }

    /// Main ID register
    #[inline]
    pub fn read_cpuid() -> u32 {
        cp15_read!("c0", "c0", "0")
    }

    /// CP15 c9 PMU registers
    #[derive(Debug, Default, Clone, Copy)]
    pub struct Cp15Registers;

    impl Armv7Registers for Cp15Registers {
        fn read_pmnc(&self) -> u32 {
            cp15_read!("c9", "c12", "0")
        }

        fn write_pmnc(&self, value: u32) {
            isb();
            cp15_write!("c9", "c12", "0", value);
        }

        fn write_cntens(&self, mask: u32) {
            cp15_write!("c9", "c12", "1", mask);
        }

        fn write_cntenc(&self, mask: u32) {
            cp15_write!("c9", "c12", "2", mask);
        }

        fn write_intens(&self, mask: u32) {
            cp15_write!("c9", "c14", "1", mask);
        }

        fn write_intenc(&self, mask: u32) {
            cp15_write!("c9", "c14", "2", mask);
        }

        fn read_flags(&self) -> u32 {
            cp15_read!("c9", "c12", "3")
        }

        fn write_flags(&self, mask: u32) {
            cp15_write!("c9", "c12", "3", mask);
            isb();
        }

        fn write_select(&self, counter: u32) {
            cp15_write!("c9", "c12", "5", counter);
            isb();
        }

        fn read_ccnt(&self) -> u32 {
            cp15_read!("c9", "c13", "0")
        }

        fn write_ccnt(&self, value: u32) {
            cp15_write!("c9", "c13", "0", value);
        }

        fn write_xevtyper(&self, value: u32) {
            cp15_write!("c9", "c13", "1", value);
        }

        fn read_xevcntr(&self) -> u32 {
            cp15_read!("c9", "c13", "2")
        }

        fn write_xevcntr(&self, value: u32) {
            cp15_write!("c9", "c13", "2", value);
        }
    }
}

#[cfg(target_arch = "arm")]
pub use cp15::{read_cpuid, Cp15Registers};

// ============================================================================
// ARMv8 PMUv3
// ============================================================================

#[cfg(target_arch = "aarch64")]
mod pmuv3 {
    use core::arch::asm;

    use super::Armv7Registers;

    macro_rules! sysreg_read {
        ($reg:literal) => {{
            let value: u64;
            unsafe {
                asm!(
                    concat!("mrs {}, ", $reg),
                    out(reg) value,
                    options(nomem, nostack, preserves_flags)
                );
            }
            value
        }};
    }

    macro_rules! sysreg_write {
        ($reg:literal, $value:expr) => {{
            let value = u64::from($value);
            unsafe {
                asm!(concat!("msr ", $reg, ", {}"), in(reg) value, options(nomem, nostack));
            }
        }};
    }

    #[inline]
    fn isb() {
        unsafe { asm!("isb", options(nostack, preserves_flags)) };
    }

    /// Main ID register (MIDR_EL1)
    #[inline]
    pub fn read_cpuid() -> u32 {
        sysreg_read!("midr_el1") as u32
    }

    /// PMUv3 system registers
    #[derive(Debug, Default, Clone, Copy)]
    pub struct Pmuv3Registers;

    impl Armv7Registers for Pmuv3Registers {
        fn read_pmnc(&self) -> u32 {
            sysreg_read!("pmcr_el0") as u32
        }

        fn write_pmnc(&self, value: u32) {
            isb();
            sysreg_write!("pmcr_el0", value);
        }

        fn write_cntens(&self, mask: u32) {
            sysreg_write!("pmcntenset_el0", mask);
        }

        fn write_cntenc(&self, mask: u32) {
            sysreg_write!("pmcntenclr_el0", mask);
        }

        fn write_intens(&self, mask: u32) {
            sysreg_write!("pmintenset_el1", mask);
        }

        fn write_intenc(&self, mask: u32) {
            sysreg_write!("pmintenclr_el1", mask);
        }

        fn read_flags(&self) -> u32 {
            sysreg_read!("pmovsclr_el0") as u32
        }

        fn write_flags(&self, mask: u32) {
            sysreg_write!("pmovsclr_el0", mask);
            isb();
        }

        fn write_select(&self, counter: u32) {
            sysreg_write!("pmselr_el0", counter);
            isb();
        }

        fn read_ccnt(&self) -> u32 {
            sysreg_read!("pmccntr_el0") as u32
        }

        fn write_ccnt(&self, value: u32) {
            sysreg_write!("pmccntr_el0", value);
        }

        fn write_xevtyper(&self, value: u32) {
            sysreg_write!("pmxevtyper_el0", value);
        }

        fn read_xevcntr(&self) -> u32 {
            sysreg_read!("pmxevcntr_el0") as u32
        }

        fn write_xevcntr(&self, value: u32) {
            sysreg_write!("pmxevcntr_el0", value);
        }
    }
}

#[cfg(target_arch = "aarch64")]
pub use pmuv3::{read_cpuid, Pmuv3Registers};
