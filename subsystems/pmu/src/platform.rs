//! # Platform Contract
//!
//! Everything the PMU core needs from the surrounding kernel: CPU topology,
//! local interrupt masking, the PMU device reservation and its interrupt
//! resources. Device-tree probing and interrupt controller programming live
//! behind this trait.

use crate::error::PmuResult;

bitflags::bitflags! {
    /// Flags used when requesting the PMU overflow interrupt
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IrqFlags: u32 {
        /// Run the handler with local interrupts disabled
        const DISABLED     = 1 << 0;
        /// Exclude the line from interrupt balancing (keep it pinned)
        const NO_BALANCING = 1 << 1;
    }
}

/// Outcome of an interrupt handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
    /// The interrupt was not ours
    None,
    /// The interrupt was serviced
    Handled,
}

/// Saved local interrupt state, returned by [`PmuPlatform::local_irq_save`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqState(pub usize);

/// Kind of PMU device reserved from the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PmuDevice {
    /// Per-CPU core PMU
    Cpu,
}

/// Platform top-half hook wrapped around the core overflow handler
///
/// The hook receives the core handler and decides when (and whether) to run it.
pub type PlatformIrqHook = fn(irq: u32, handler: &dyn Fn(u32) -> IrqReturn) -> IrqReturn;

/// Platform services consumed by the PMU core
pub trait PmuPlatform: Send + Sync {
    // ------------------------------------------------------------------------
    // CPU topology
    // ------------------------------------------------------------------------

    /// Number of CPUs that may ever come online
    fn num_possible_cpus(&self) -> usize;

    /// Logical id of the executing CPU
    fn current_cpu(&self) -> usize;

    /// Run `f` on every online CPU and wait for completion
    fn on_each_cpu(&self, f: &(dyn Fn(usize) + Sync));

    // ------------------------------------------------------------------------
    // Local interrupt masking
    // ------------------------------------------------------------------------

    /// Mask local interrupts, returning the previous state
    fn local_irq_save(&self) -> IrqState;

    /// Restore a state returned by [`PmuPlatform::local_irq_save`]
    fn local_irq_restore(&self, state: IrqState);

    // ------------------------------------------------------------------------
    // PMU device
    // ------------------------------------------------------------------------

    /// Claim exclusive use of the PMU device
    fn reserve_pmu(&self, device: PmuDevice) -> PmuResult<()>;

    /// Return the PMU device
    fn release_pmu(&self, device: PmuDevice);

    /// Number of interrupt resources attached to the PMU device
    fn num_irq_resources(&self) -> usize;

    /// Interrupt number of resource `index`, `None` if it can't be resolved
    fn irq_resource(&self, index: usize) -> Option<u32>;

    /// Optional platform top-half wrapped around the core handler
    fn irq_hook(&self) -> Option<PlatformIrqHook> {
        None
    }

    // ------------------------------------------------------------------------
    // Interrupt lines
    // ------------------------------------------------------------------------

    /// Steer `irq` to `cpu`
    fn set_irq_affinity(&self, irq: u32, cpu: usize) -> PmuResult<()>;

    /// Install the PMU handler on `irq`
    ///
    /// Once installed the platform routes the line to
    /// [`CpuPmu::handle_irq`](crate::CpuPmu::handle_irq).
    fn request_irq(&self, irq: u32, flags: IrqFlags, name: &'static str) -> PmuResult<()>;

    /// Remove the PMU handler from `irq`
    fn free_irq(&self, irq: u32);
}
