//! # PMU Configuration

use crate::platform::IrqFlags;
use crate::PMU_SOURCE_NAME;

/// Registration and interrupt settings of a CPU PMU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmuConfig {
    /// Event-source name published to the event framework
    pub source_name: &'static str,
    /// Name attached to the overflow interrupt lines
    pub irq_name: &'static str,
    /// Flags used when requesting the overflow interrupt lines
    pub irq_flags: IrqFlags,
}

impl PmuConfig {
    /// Default configuration
    pub const fn new() -> Self {
        Self {
            source_name: PMU_SOURCE_NAME,
            irq_name: "arm-pmu",
            irq_flags: IrqFlags::DISABLED.union(IrqFlags::NO_BALANCING),
        }
    }

    /// Override the interrupt name
    pub const fn with_irq_name(mut self, name: &'static str) -> Self {
        self.irq_name = name;
        self
    }
}

impl Default for PmuConfig {
    fn default() -> Self {
        Self::new()
    }
}
