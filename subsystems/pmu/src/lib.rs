//! # Helix OS Hardware Performance Monitoring
//!
//! Multiplexes the per-CPU hardware performance counters of a CPU PMU among
//! the events requested by the kernel's event-accounting framework.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    EVENT FRAMEWORK (consumer)                           │
//! │        event_init / add / del / start / stop / read / destroy           │
//! └──────────────────────────────┬──────────────────────────────────────────┘
//!                                │ PmuOps
//!                                ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          CpuPmu                                         │
//! │                                                                         │
//! │  ┌───────────────┐   ┌────────────────┐   ┌──────────────────────────┐  │
//! │  │ Group         │   │ Event          │   │ Interrupt reservation    │  │
//! │  │ validation    │   │ lifecycle      │   │ (first/last event)       │  │
//! │  └───────────────┘   └───────┬────────┘   └──────────────────────────┘  │
//! │                              │                                          │
//! │        ┌─────────────────────┼─────────────────────┐                    │
//! │        ▼                     ▼                     ▼                    │
//! │  ┌───────────┐         ┌───────────┐         ┌───────────┐              │
//! │  │  CPU 0    │         │  CPU 1    │   ...   │  CPU N    │  counter     │
//! │  │  table    │         │  table    │         │  table    │  tables      │
//! │  └───────────┘         └───────────┘         └───────────┘              │
//! └──────────────────────────────┬──────────────────────────────────────────┘
//!                                │ PmuBackend
//!                                ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │         ARMv7 / PMUv3 backend  ──▶  Armv7Registers (CP15 / sysregs)     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Boot
//!
//! ```rust,ignore
//! use helix_pmu::{registry, PmuConfig, PmuRegistry};
//!
//! static REGISTRY: PmuRegistry = PmuRegistry::new();
//!
//! let pmu = registry::init_cpu_pmu(platform, &REGISTRY, PmuConfig::default());
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

// =============================================================================
// EXTERNAL DEPENDENCIES
// =============================================================================

extern crate alloc;

#[cfg(test)]
extern crate std;

// =============================================================================
// MODULE DECLARATIONS
// =============================================================================

/// Error types
pub mod error;

/// Registration settings
pub mod config;

/// Event descriptors and event objects
pub mod event;

/// Per-CPU counter tables
pub mod cpu_events;

/// Backend operation table
pub mod backend;

/// PMU instance and event lifecycle
pub mod pmu;

/// Group validation
pub mod group;

/// Interrupt reservation
pub mod irq;

/// Platform services
pub mod platform;

/// CPU identification
pub mod identify;

/// Event-source registry and boot registration
pub mod registry;

/// ARMv7 / ARMv8 PMUv3 backend
pub mod armv7;

#[cfg(test)]
mod testing;

// =============================================================================
// RE-EXPORTS
// =============================================================================

pub use backend::{EventMap, PmuBackend};
pub use config::PmuConfig;
pub use cpu_events::{CounterSlots, CpuHwEvents, UsedMask};
pub use error::{PmuError, PmuResult};
pub use event::{
    EventAttr, EventFlags, EventState, EventType, ExcludeFlags, HesFlags, HwCacheConfig,
    HwEventId, HwPerfEvent, OverflowSample, PerfEvent, SourceId,
};
pub use identify::{CpuId, PmuId};
pub use platform::{IrqFlags, IrqReturn, PmuPlatform};
pub use pmu::{CpuPmu, PmuDisableGuard};
pub use registry::{init_hw_perf_events, EventSource, PmuOps, PmuRegistry};

// =============================================================================
// CONSTANTS
// =============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Upper bound on hardware counters per CPU
pub const MAX_HW_EVENTS: usize = 32;

/// Event-source name the CPU PMU is published under
pub const PMU_SOURCE_NAME: &str = "cpu";

static_assertions::assert_impl_all!(CpuPmu: Send, Sync);
static_assertions::assert_impl_all!(PerfEvent: Send, Sync);
static_assertions::assert_impl_all!(PmuRegistry: Send, Sync);
