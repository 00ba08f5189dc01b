//! # CPU Identification
//!
//! Decodes the main ID register and picks the PMU model for the running CPU.
//!
//! ## MIDR Layout
//!
//! ```text
//! ┌─────────────┬─────────┬────────────┬────────────────────┬──────────┐
//! │ 31       24 │ 23   20 │ 19      16 │ 15               4 │ 3      0 │
//! ├─────────────┼─────────┼────────────┼────────────────────┼──────────┤
//! │ Implementer │ Variant │ Arch       │ Part number        │ Revision │
//! └─────────────┴─────────┴────────────┴────────────────────┴──────────┘
//! ```
//!
//! Intel XScale parts encode the core generation in bits 15..13 instead.

use core::fmt;

// ============================================================================
// IMPLEMENTERS AND PARTS
// ============================================================================

/// ARM Ltd
pub const IMPLEMENTER_ARM: u32 = 0x41;
/// Intel (XScale)
pub const IMPLEMENTER_INTEL: u32 = 0x69;

/// ARM part numbers (bits 15..4 of MIDR, kept in place)
pub mod part {
    /// ARM1136
    pub const ARM1136: u32 = 0xB360;
    /// ARM1156
    pub const ARM1156: u32 = 0xB560;
    /// ARM1176
    pub const ARM1176: u32 = 0xB760;
    /// ARM11 MPCore
    pub const ARM11_MPCORE: u32 = 0xB020;
    /// Cortex-A5
    pub const CORTEX_A5: u32 = 0xC050;
    /// Cortex-A7
    pub const CORTEX_A7: u32 = 0xC070;
    /// Cortex-A8
    pub const CORTEX_A8: u32 = 0xC080;
    /// Cortex-A9
    pub const CORTEX_A9: u32 = 0xC090;
    /// Cortex-A15
    pub const CORTEX_A15: u32 = 0xC0F0;
    /// Cortex-A53
    pub const CORTEX_A53: u32 = 0xD030;
    /// Cortex-A57
    pub const CORTEX_A57: u32 = 0xD070;
}

/// Raw main ID register value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CpuId(pub u32);

impl CpuId {
    /// Implementer code
    pub const fn implementer(self) -> u32 {
        (self.0 & 0xFF00_0000) >> 24
    }

    /// Part number, left in its register position
    pub const fn part_number(self) -> u32 {
        self.0 & 0xFFF0
    }

    /// XScale core generation
    pub const fn xscale_arch(self) -> u32 {
        (self.0 >> 13) & 0x7
    }

    /// Identify the PMU model
    pub const fn pmu_id(self) -> Option<PmuId> {
        match self.implementer() {
            IMPLEMENTER_ARM => match self.part_number() {
                part::ARM1136 | part::ARM1156 | part::ARM1176 => Some(PmuId::Arm1136),
                part::ARM11_MPCORE => Some(PmuId::Arm11Mpcore),
                part::CORTEX_A5 => Some(PmuId::CortexA5),
                part::CORTEX_A7 => Some(PmuId::CortexA7),
                part::CORTEX_A8 => Some(PmuId::CortexA8),
                part::CORTEX_A9 => Some(PmuId::CortexA9),
                part::CORTEX_A15 => Some(PmuId::CortexA15),
                part::CORTEX_A53 => Some(PmuId::CortexA53),
                part::CORTEX_A57 => Some(PmuId::CortexA57),
                _ => None,
            },
            IMPLEMENTER_INTEL => match self.xscale_arch() {
                1 => Some(PmuId::Xscale1),
                2 => Some(PmuId::Xscale2),
                _ => None,
            },
            _ => None,
        }
    }
}

// ============================================================================
// PMU MODELS
// ============================================================================

/// PMU model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PmuId {
    /// ARM1136/1156/1176 (ARMv6)
    Arm1136,
    /// ARM11 MPCore
    Arm11Mpcore,
    /// Intel XScale generation 1
    Xscale1,
    /// Intel XScale generation 2
    Xscale2,
    /// Cortex-A5
    CortexA5,
    /// Cortex-A7
    CortexA7,
    /// Cortex-A8
    CortexA8,
    /// Cortex-A9
    CortexA9,
    /// Cortex-A15
    CortexA15,
    /// Cortex-A53 (PMUv3)
    CortexA53,
    /// Cortex-A57 (PMUv3)
    CortexA57,
}

impl PmuId {
    /// Driver name
    pub const fn name(self) -> &'static str {
        match self {
            Self::Arm1136 => "v6",
            Self::Arm11Mpcore => "v6mpcore",
            Self::Xscale1 => "xscale1",
            Self::Xscale2 => "xscale2",
            Self::CortexA5 => "ARMv7 Cortex-A5",
            Self::CortexA7 => "ARMv7 Cortex-A7",
            Self::CortexA8 => "ARMv7 Cortex-A8",
            Self::CortexA9 => "ARMv7 Cortex-A9",
            Self::CortexA15 => "ARMv7 Cortex-A15",
            Self::CortexA53 => "ARMv8 Cortex-A53",
            Self::CortexA57 => "ARMv8 Cortex-A57",
        }
    }

    /// Whether the architected ARMv7/PMUv3 register interface applies
    pub const fn is_architected(self) -> bool {
        matches!(
            self,
            Self::CortexA5
                | Self::CortexA7
                | Self::CortexA8
                | Self::CortexA9
                | Self::CortexA15
                | Self::CortexA53
                | Self::CortexA57
        )
    }

    /// Whether the counters can filter by privilege level
    pub const fn supports_mode_filter(self) -> bool {
        matches!(
            self,
            Self::CortexA7 | Self::CortexA15 | Self::CortexA53 | Self::CortexA57
        )
    }
}

impl fmt::Display for PmuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
