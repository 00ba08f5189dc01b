//! # Event-Source Registry
//!
//! The framework-facing side of the subsystem: the operation table an event
//! source exposes, a registry routing event creation to the right source,
//! and boot-time identification that assembles and publishes the CPU PMU.
//!
//! ```text
//!   boot ──▶ read MIDR ──▶ CpuId::pmu_id() ──▶ probe backend ──▶ CpuPmu
//!                                │                                 │
//!                             no match                   reset every CPU
//!                                │                                 │
//!                                ▼                                 ▼
//!                   "no hardware support"          registry.register("cpu", RAW)
//! ```

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use spin::RwLock;

use crate::backend::PmuBackend;
use crate::config::PmuConfig;
use crate::error::{PmuError, PmuResult};
use crate::event::{EventFlags, EventType, PerfEvent, SourceId};
use crate::identify::{CpuId, PmuId};
use crate::pmu::CpuPmu;
use crate::platform::PmuPlatform;

// ============================================================================
// OPERATION TABLE
// ============================================================================

/// Callbacks an event source exposes to the event framework
pub trait PmuOps: Send + Sync {
    /// Identity of the source
    fn source(&self) -> SourceId;
    /// Validate and initialize an event for this source
    fn event_init(&self, event: &mut PerfEvent) -> PmuResult<()>;
    /// Release what `event_init` acquired
    fn event_destroy(&self, event: &PerfEvent);
    /// Schedule an event on the executing CPU
    fn add(&self, event: &Arc<PerfEvent>, flags: EventFlags) -> PmuResult<()>;
    /// Unschedule an event
    fn del(&self, event: &Arc<PerfEvent>, flags: EventFlags);
    /// Start counting
    fn start(&self, event: &PerfEvent, flags: EventFlags);
    /// Stop counting
    fn stop(&self, event: &PerfEvent, flags: EventFlags);
    /// Refresh the event's count
    fn read(&self, event: &PerfEvent);
    /// Resume counting on the executing CPU
    fn pmu_enable(&self);
    /// Suspend counting on the executing CPU
    fn pmu_disable(&self);
}

impl PmuOps for CpuPmu {
    fn source(&self) -> SourceId {
        CpuPmu::source(self)
    }

    fn event_init(&self, event: &mut PerfEvent) -> PmuResult<()> {
        CpuPmu::event_init(self, event)
    }

    fn event_destroy(&self, event: &PerfEvent) {
        CpuPmu::event_destroy(self, event)
    }

    fn add(&self, event: &Arc<PerfEvent>, flags: EventFlags) -> PmuResult<()> {
        CpuPmu::add(self, event, flags)
    }

    fn del(&self, event: &Arc<PerfEvent>, flags: EventFlags) {
        CpuPmu::del(self, event, flags)
    }

    fn start(&self, event: &PerfEvent, flags: EventFlags) {
        CpuPmu::start(self, event, flags)
    }

    fn stop(&self, event: &PerfEvent, flags: EventFlags) {
        CpuPmu::stop(self, event, flags)
    }

    fn read(&self, event: &PerfEvent) {
        CpuPmu::read(self, event)
    }

    fn pmu_enable(&self) {
        CpuPmu::pmu_enable(self)
    }

    fn pmu_disable(&self) {
        CpuPmu::pmu_disable(self)
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// A registered event source
#[derive(Clone)]
pub struct EventSource {
    /// Source name
    pub name: &'static str,
    /// Event type routed to this source first
    pub event_type: EventType,
    /// Operation table
    pub ops: Arc<dyn PmuOps>,
}

impl fmt::Debug for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSource")
            .field("name", &self.name)
            .field("event_type", &self.event_type)
            .field("source", &self.ops.source())
            .finish()
    }
}

/// Registered event sources
#[derive(Debug, Default)]
pub struct PmuRegistry {
    sources: RwLock<Vec<EventSource>>,
}

impl PmuRegistry {
    /// Empty registry
    pub const fn new() -> Self {
        Self {
            sources: RwLock::new(Vec::new()),
        }
    }

    /// Publish `ops` under `name` for `event_type`
    pub fn register(
        &self,
        name: &'static str,
        event_type: EventType,
        ops: Arc<dyn PmuOps>,
    ) -> PmuResult<()> {
        let mut sources = self.sources.write();
        if sources.iter().any(|source| source.name == name) {
            return Err(PmuError::Busy);
        }

        sources.push(EventSource {
            name,
            event_type,
            ops,
        });
        Ok(())
    }

    /// Look a source up by name
    pub fn find(&self, name: &str) -> Option<EventSource> {
        self.sources
            .read()
            .iter()
            .find(|source| source.name == name)
            .cloned()
    }

    /// Number of registered sources
    pub fn len(&self) -> usize {
        self.sources.read().len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.sources.read().is_empty()
    }

    /// Find a source that accepts `event` and initialize it there
    ///
    /// The source registered for the event's type is asked first; after that
    /// every source is tried in registration order. A source answering
    /// anything other than `NotSupported` ends the search.
    pub fn event_init(&self, event: &mut PerfEvent) -> PmuResult<Arc<dyn PmuOps>> {
        let sources: Vec<EventSource> = self.sources.read().clone();
        let event_type = event.attr().event_type;

        if let Some(source) = sources.iter().find(|s| s.event_type == event_type) {
            source.ops.event_init(event)?;
            return Ok(Arc::clone(&source.ops));
        }

        for source in &sources {
            match source.ops.event_init(event) {
                Ok(()) => return Ok(Arc::clone(&source.ops)),
                Err(PmuError::NotSupported) => continue,
                Err(err) => return Err(err),
            }
        }

        Err(PmuError::NotSupported)
    }
}

// ============================================================================
// BOOT REGISTRATION
// ============================================================================

/// Identify the CPU, assemble its PMU and publish it
///
/// `probe` builds the backend for the identified model. When the CPU is not
/// recognised or no backend exists for it, hardware counting stays disabled
/// and `None` is returned; this is not an error.
pub fn init_hw_perf_events<P>(
    cpuid: CpuId,
    probe: P,
    platform: Arc<dyn PmuPlatform>,
    registry: &PmuRegistry,
    config: PmuConfig,
) -> Option<Arc<CpuPmu>>
where
    P: FnOnce(PmuId) -> Option<Box<dyn PmuBackend>>,
{
    let Some(backend) = cpuid.pmu_id().and_then(probe) else {
        log::info!("PMU: no hardware support available");
        return None;
    };

    let pmu = Arc::new(CpuPmu::new(backend, platform, config));
    log::info!(
        "PMU: enabled with {} PMU driver, {} counters available",
        pmu.name(),
        pmu.num_counters()
    );

    pmu.reset_all();

    if let Err(err) = registry.register(config.source_name, EventType::Raw, pmu.clone()) {
        log::error!("PMU: unable to register event source: {}", err);
        return None;
    }

    Some(pmu)
}

/// Boot-time entry point for the running CPU
///
/// Reads the main ID register and probes the architected register interface.
/// Without the `armv7` feature no backend is available and counting stays
/// disabled.
#[cfg(any(target_arch = "arm", target_arch = "aarch64"))]
pub fn init_cpu_pmu(
    platform: Arc<dyn PmuPlatform>,
    registry: &PmuRegistry,
    config: PmuConfig,
) -> Option<Arc<CpuPmu>> {
    let cpuid = CpuId(crate::armv7::regs::read_cpuid());
    init_hw_perf_events(cpuid, native_backend, platform, registry, config)
}

#[cfg(all(feature = "armv7", target_arch = "arm"))]
fn native_backend(id: PmuId) -> Option<Box<dyn PmuBackend>> {
    crate::armv7::probe(crate::armv7::regs::Cp15Registers)(id)
}

#[cfg(all(feature = "armv7", target_arch = "aarch64"))]
fn native_backend(id: PmuId) -> Option<Box<dyn PmuBackend>> {
    crate::armv7::probe(crate::armv7::regs::Pmuv3Registers)(id)
}

#[cfg(all(not(feature = "armv7"), any(target_arch = "arm", target_arch = "aarch64")))]
fn native_backend(_id: PmuId) -> Option<Box<dyn PmuBackend>> {
    None
}
