//! # CPU PMU Instance
//!
//! The assembled PMU: one backend, one counter table per CPU, the
//! system-wide active-event count and the interrupt reservation it drives.
//!
//! ## Event Lifecycle
//!
//! ```text
//!   event_init ──▶ map ─▶ mode filter ─▶ default period ─▶ group check ─▶ reserve
//!        │                                                       (first event only)
//!        ▼
//!   add ───────▶ allocate slot ─▶ install ─▶ [start]
//!   start ─────▶ program period ─▶ enable counter
//!   stop ──────▶ disable counter ─▶ final delta read
//!   del ───────▶ stop ─▶ vacate slot
//!        │
//!        ▼
//!   event_destroy ──▶ release (last event only)
//! ```
//!
//! ## Delta Accounting
//!
//! The raw counter is narrower than the 64-bit logical count. Each
//! observation swaps the shadow value with a compare-and-swap and accumulates
//! the difference; after an overflow the difference spans one full wrap:
//!
//! ```text
//!   delta = new - prev                       (no overflow)
//!   delta = max_period - prev + new + 1      (overflow)
//! ```

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use crate::backend::PmuBackend;
use crate::config::PmuConfig;
use crate::cpu_events::CpuHwEvents;
use crate::error::{PmuError, PmuResult};
use crate::event::{EventFlags, HesFlags, OverflowSample, PerfEvent, SourceId};
use crate::group;
use crate::identify::PmuId;
use crate::irq::IrqReservation;
use crate::platform::{IrqReturn, PmuPlatform};
use crate::MAX_HW_EVENTS;

// ============================================================================
// PMU INSTANCE
// ============================================================================

/// Per-CPU hardware PMU shared by every CPU of the system
pub struct CpuPmu {
    backend: Box<dyn PmuBackend>,
    platform: Arc<dyn PmuPlatform>,
    config: PmuConfig,
    source: SourceId,
    hw_events: Box<[CpuHwEvents]>,
    active_events: AtomicUsize,
    reserve_mutex: Mutex<()>,
    irqs: IrqReservation,
}

impl CpuPmu {
    /// Assemble a PMU from its backend and the platform services
    pub fn new(
        backend: Box<dyn PmuBackend>,
        platform: Arc<dyn PmuPlatform>,
        config: PmuConfig,
    ) -> Self {
        let cpus = platform.num_possible_cpus().max(1);
        Self {
            backend,
            config,
            source: SourceId::next(),
            hw_events: (0..cpus).map(CpuHwEvents::new).collect(),
            active_events: AtomicUsize::new(0),
            reserve_mutex: Mutex::new(()),
            irqs: IrqReservation::new(cpus),
            platform,
        }
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Detected model
    pub fn pmu_id(&self) -> PmuId {
        self.backend.id()
    }

    /// Driver name
    pub fn name(&self) -> &'static str {
        self.backend.name()
    }

    /// Number of hardware counters
    pub fn num_counters(&self) -> usize {
        self.backend.num_events().min(MAX_HW_EVENTS)
    }

    /// Counter width mask
    pub fn max_period(&self) -> u64 {
        self.backend.max_period()
    }

    /// Events currently holding the hardware reservation
    pub fn active_events(&self) -> usize {
        self.active_events.load(Ordering::Acquire)
    }

    /// Identity of this PMU as an event source
    pub fn source(&self) -> SourceId {
        self.source
    }

    /// Registration settings
    pub fn config(&self) -> &PmuConfig {
        &self.config
    }

    /// Backend operation table
    pub fn backend(&self) -> &dyn PmuBackend {
        &*self.backend
    }

    /// Interrupt lines claimed for this PMU
    pub fn irqs(&self) -> &IrqReservation {
        &self.irqs
    }

    /// Counter table of `cpu`
    pub fn cpu_events(&self, cpu: usize) -> Option<&CpuHwEvents> {
        self.hw_events.get(cpu)
    }

    fn local_events(&self) -> Option<&CpuHwEvents> {
        let cpu = self.platform.current_cpu();
        let cpuc = self.hw_events.get(cpu);
        if cpuc.is_none() {
            log::error!("PMU: no counter table for cpu {}", cpu);
        }
        cpuc
    }

    // ------------------------------------------------------------------------
    // Hardware reservation
    // ------------------------------------------------------------------------

    fn acquire_hardware(&self) -> PmuResult<()> {
        let bumped = self
            .active_events
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n != 0).then(|| n + 1)
            })
            .is_ok();
        if bumped {
            return Ok(());
        }

        let _guard = self.reserve_mutex.lock();
        if self.active_events.load(Ordering::Acquire) == 0 {
            self.irqs.reserve(&*self.platform, &self.config)?;
        }
        self.active_events.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn release_hardware_ref(&self) {
        let dropped = self
            .active_events
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n > 1).then(|| n - 1)
            })
            .is_ok();
        if dropped {
            return;
        }

        let _guard = self.reserve_mutex.lock();
        if self.active_events.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.irqs.release(&*self.platform);
        }
    }

    // ------------------------------------------------------------------------
    // Event initialization and teardown
    // ------------------------------------------------------------------------

    /// Validate `event`, derive its hardware configuration and take a
    /// reference on the hardware reservation
    ///
    /// On success the event is bound to this PMU. On failure nothing is
    /// retained and the event is left unbound.
    pub fn event_init(&self, event: &mut PerfEvent) -> PmuResult<()> {
        if event.hw().is_reserved() {
            log::debug!("PMU: event already initialized");
            return Err(PmuError::Busy);
        }

        event.bind(Some(self.source));
        let result = self.init_bound_event(event);
        if result.is_err() {
            event.bind(None);
        }
        result
    }

    fn init_bound_event(&self, event: &mut PerfEvent) -> PmuResult<()> {
        let attr = *event.attr();

        // Periods are tracked as signed remainders
        if attr.sample_period > i64::MAX as u64 {
            log::debug!("PMU: sample period {:#x} out of range", attr.sample_period);
            return Err(PmuError::InvalidArgument);
        }

        let mapping = match self.backend.map_event(&attr) {
            Ok(mapping) => mapping,
            Err(err) => {
                log::debug!(
                    "PMU: event {:?}:{:#x} not supported",
                    attr.event_type,
                    attr.config
                );
                return Err(err);
            }
        };

        if self.backend.set_event_filter(event.hw_mut(), &attr).is_err()
            && attr.requires_mode_exclusion()
        {
            log::debug!("PMU: performance counters do not support mode exclusion");
            return Err(PmuError::PermissionDenied);
        }

        event.init_hw(mapping, self.max_period());

        if event.group_leader().is_some() {
            group::validate_group(self, event)?;
        }

        self.acquire_hardware()?;
        event.hw().mark_reserved();
        Ok(())
    }

    /// Drop the event's reference on the hardware reservation
    ///
    /// Safe to call more than once; only the first call after a successful
    /// [`CpuPmu::event_init`] has an effect.
    pub fn event_destroy(&self, event: &PerfEvent) {
        if event.hw().take_reservation() {
            self.release_hardware_ref();
        }
    }

    // ------------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------------

    /// Place `event` on a counter of the executing CPU
    pub fn add(&self, event: &Arc<PerfEvent>, flags: EventFlags) -> PmuResult<()> {
        let _disabled = PmuDisableGuard::new(self);
        let cpuc = self.local_events().ok_or(PmuError::NoHardware)?;
        let mut slots = cpuc.lock(&*self.platform);

        let hw = event.hw();
        let idx = self
            .backend
            .get_event_idx(&mut slots, hw)
            .map_err(|_| PmuError::NoSpace)?;

        hw.set_index(Some(idx));
        self.backend.disable(hw, idx);
        slots.install(idx, Arc::clone(event));

        hw.set_state(HesFlags::STOPPED | HesFlags::UPTODATE);
        if flags.contains(EventFlags::START) {
            self.start_locked(event, idx, EventFlags::RELOAD);
        }
        Ok(())
    }

    /// Remove `event` from its counter, accounting the final delta
    pub fn del(&self, event: &Arc<PerfEvent>, _flags: EventFlags) {
        let Some(idx) = event.hw().index() else {
            log::warn!("PMU: removing an event that holds no counter");
            return;
        };

        let Some(cpuc) = self.local_events() else {
            return;
        };

        let mut slots = cpuc.lock(&*self.platform);
        self.stop_locked(event, idx);
        slots.vacate(idx);
        event.hw().set_index(None);
    }

    /// Start counting on a scheduled event
    pub fn start(&self, event: &PerfEvent, flags: EventFlags) {
        if let (Some(idx), Some(cpuc)) = (event.hw().index(), self.local_events()) {
            let _slots = cpuc.lock(&*self.platform);
            self.start_locked(event, idx, flags);
        }
    }

    /// Stop counting on a scheduled event
    ///
    /// The count is always brought up to date, whatever `flags` says.
    pub fn stop(&self, event: &PerfEvent, _flags: EventFlags) {
        if let (Some(idx), Some(cpuc)) = (event.hw().index(), self.local_events()) {
            let _slots = cpuc.lock(&*self.platform);
            self.stop_locked(event, idx);
        }
    }

    /// Fold the current hardware value into the event's count
    pub fn read(&self, event: &PerfEvent) {
        if let (Some(idx), Some(cpuc)) = (event.hw().index(), self.local_events()) {
            let _slots = cpuc.lock(&*self.platform);
            self.event_update(event, idx, false);
        }
    }

    fn start_locked(&self, event: &PerfEvent, idx: usize, flags: EventFlags) {
        let hw = event.hw();
        if flags.contains(EventFlags::RELOAD) && !hw.state().contains(HesFlags::UPTODATE) {
            log::warn!("PMU: period reload requested on an event with a stale count");
        }

        // The counter may have kept running while stopped; always reprogram
        hw.set_state(HesFlags::empty());
        self.event_set_period(event, idx);
        self.backend.enable(hw, idx);
    }

    fn stop_locked(&self, event: &PerfEvent, idx: usize) {
        let hw = event.hw();
        if hw.state().contains(HesFlags::STOPPED) {
            return;
        }

        self.backend.disable(hw, idx);
        self.event_update(event, idx, false);
        hw.insert_state(HesFlags::STOPPED | HesFlags::UPTODATE);
    }

    // ------------------------------------------------------------------------
    // Period programming and delta accounting
    // ------------------------------------------------------------------------

    /// Program counter `idx` to overflow once the event's remaining period elapses
    ///
    /// Returns `true` when a new period was started.
    pub fn event_set_period(&self, event: &PerfEvent, idx: usize) -> bool {
        let hw = event.hw();
        let period = hw.sample_period() as i64;
        let mut left = hw.period_left();
        let mut changed = false;

        if left <= -period {
            left = period;
            hw.set_period_left(left);
            hw.set_last_period(period as u64);
            changed = true;
        }

        if left <= 0 {
            left += period;
            hw.set_period_left(left);
            hw.set_last_period(period as u64);
            changed = true;
        }

        let max_period = self.max_period();
        if left > max_period as i64 {
            left = max_period as i64;
        }

        let start = (left as u64).wrapping_neg();
        hw.rebase_prev_count(start);
        self.backend.write_counter(idx, (start & max_period) as u32);

        changed
    }

    /// Account everything counter `idx` saw since the last observation
    ///
    /// Returns the raw counter value that was observed.
    pub fn event_update(&self, event: &PerfEvent, idx: usize, overflow: bool) -> u64 {
        let hw = event.hw();
        let max_period = self.max_period();

        let (prev_raw, new_raw) = loop {
            let prev_raw = hw.prev_count();
            let new_raw = u64::from(self.backend.read_counter(idx));
            if hw.exchange_prev_count(prev_raw, new_raw) {
                break (prev_raw & max_period, new_raw & max_period);
            }
        };

        let delta = if overflow {
            max_period
                .wrapping_sub(prev_raw)
                .wrapping_add(new_raw)
                .wrapping_add(1)
        } else {
            new_raw.wrapping_sub(prev_raw) & max_period
        };

        event.add_count(delta);
        hw.sub_period_left(delta);

        new_raw
    }

    // ------------------------------------------------------------------------
    // PMU-wide enable/disable
    // ------------------------------------------------------------------------

    /// Re-enable counting on the executing CPU once the outermost bracket closes
    pub fn pmu_enable(&self) {
        let Some(cpuc) = self.local_events() else {
            return;
        };
        if !cpuc.disable_exit() {
            return;
        }

        let slots = cpuc.lock(&*self.platform);
        let mut enabled = false;
        for (idx, event) in slots.occupied() {
            if event.hw().state().contains(HesFlags::STOPPED) {
                continue;
            }
            self.backend.enable(event.hw(), idx);
            enabled = true;
        }

        if enabled {
            self.backend.start();
        }
    }

    /// Suspend all counting on the executing CPU
    pub fn pmu_disable(&self) {
        if self.local_events().is_some_and(|cpuc| cpuc.disable_enter()) {
            self.backend.stop();
        }
    }

    // ------------------------------------------------------------------------
    // Interrupts and reset
    // ------------------------------------------------------------------------

    /// Entry point for the overflow interrupt
    ///
    /// Runs the platform hook around the core handler when one is installed.
    pub fn handle_irq(&self, irq: u32) -> IrqReturn {
        match self.platform.irq_hook() {
            Some(hook) => hook(irq, &|irq| self.handle_overflow(irq)),
            None => self.handle_overflow(irq),
        }
    }

    fn handle_overflow(&self, _irq: u32) -> IrqReturn {
        let Some(cpuc) = self.local_events() else {
            return IrqReturn::None;
        };

        let overflowed = {
            let _slots = cpuc.lock(&*self.platform);
            self.backend.get_reset_overflow()
        };
        if overflowed == 0 {
            return IrqReturn::None;
        }

        for idx in 0..self.num_counters() {
            if overflowed & (1 << idx) == 0 {
                continue;
            }

            let (event, sample) = {
                let slots = cpuc.lock(&*self.platform);
                let Some(event) = slots.event(idx).cloned() else {
                    continue;
                };

                self.event_update(&event, idx, true);
                let period = event.hw().last_period();
                if !self.event_set_period(&event, idx) {
                    continue;
                }

                let count = event.count();
                (event, OverflowSample { period, count })
            };

            // Throttled events stay stopped until the framework restarts them
            if event.overflow(&sample) {
                let _slots = cpuc.lock(&*self.platform);
                self.stop_locked(&event, idx);
            }
        }

        IrqReturn::Handled
    }

    /// Put every CPU's PMU into a known state
    pub fn reset_all(&self) {
        self.platform.on_each_cpu(&|_cpu| self.backend.reset());
    }
}

impl fmt::Debug for CpuPmu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuPmu")
            .field("id", &self.pmu_id())
            .field("num_counters", &self.num_counters())
            .field("source", &self.source)
            .field("active_events", &self.active_events())
            .field("irqs", &self.irqs)
            .finish()
    }
}

// ============================================================================
// DISABLE BRACKET
// ============================================================================

/// Holds the executing CPU's PMU disabled until dropped
#[derive(Debug)]
pub struct PmuDisableGuard<'a> {
    pmu: &'a CpuPmu,
}

impl<'a> PmuDisableGuard<'a> {
    /// Open a disable bracket on `pmu`
    pub fn new(pmu: &'a CpuPmu) -> Self {
        pmu.pmu_disable();
        Self { pmu }
    }
}

impl Drop for PmuDisableGuard<'_> {
    fn drop(&mut self) {
        self.pmu.pmu_enable();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::armv7::Armv7Backend;
    use crate::event::{EventAttr, ExcludeFlags, HwEventId};
    use crate::testing::{SimPlatform, SimRegisters};
    use alloc::vec::Vec;
    use core::sync::atomic::AtomicU64;
    use std::sync::Barrier;
    use std::thread;

    fn setup(id: PmuId, counters: u32, cpus: usize) -> (CpuPmu, SimRegisters, Arc<SimPlatform>) {
        let regs = SimRegisters::new(counters);
        let platform = Arc::new(SimPlatform::new(cpus));
        let backend = Armv7Backend::new(id, regs.clone()).expect("architected model");
        let pmu = CpuPmu::new(Box::new(backend), platform.clone(), PmuConfig::default());
        (pmu, regs, platform)
    }

    fn init(pmu: &CpuPmu, attr: EventAttr) -> Arc<PerfEvent> {
        let mut event = PerfEvent::new(attr);
        pmu.event_init(&mut event).expect("event init");
        Arc::new(event)
    }

    #[test]
    fn test_queries() {
        let (pmu, _, _) = setup(PmuId::CortexA9, 6, 2);
        assert_eq!(pmu.pmu_id(), PmuId::CortexA9);
        assert_eq!(pmu.num_counters(), 7);
        assert_eq!(pmu.max_period(), 0xffff_ffff);
        assert_eq!(pmu.active_events(), 0);
        assert_eq!(pmu.cpu_events(1).map(CpuHwEvents::cpu), Some(1));
        assert!(pmu.cpu_events(2).is_none());
        assert_eq!(pmu.config().source_name, crate::PMU_SOURCE_NAME);
        assert_eq!(pmu.irqs().active_count(), 0);
    }

    #[test]
    fn test_oversized_sample_period_rejected() {
        let (pmu, _, platform) = setup(PmuId::CortexA9, 6, 1);

        for period in [1u64 << 63, u64::MAX] {
            let mut event = PerfEvent::new(EventAttr::raw(0x08).with_sample_period(period));
            assert_eq!(pmu.event_init(&mut event), Err(PmuError::InvalidArgument));
            assert_eq!(event.source(), None);
        }
        assert_eq!(platform.reserve_calls(), 0);
        assert_eq!(pmu.active_events(), 0);

        // The largest signed period is accepted and clamped to the counter width
        let event = init(&pmu, EventAttr::raw(0x08).with_sample_period(i64::MAX as u64));
        pmu.add(&event, EventFlags::START).expect("add");
        let idx = event.hw().index().expect("scheduled");
        assert_eq!(event.hw().period_left(), i64::MAX);
        assert_eq!(pmu.backend().read_counter(idx), 1);
    }

    #[test]
    fn test_repeated_init_keeps_one_reference() {
        let (pmu, _, platform) = setup(PmuId::CortexA9, 6, 1);
        let mut event = PerfEvent::new(EventAttr::raw(0x08));

        assert_eq!(pmu.event_init(&mut event), Ok(()));
        assert_eq!(pmu.event_init(&mut event), Err(PmuError::Busy));
        assert_eq!(event.source(), Some(pmu.source()));
        assert_eq!(pmu.active_events(), 1);

        pmu.event_destroy(&event);
        assert_eq!(pmu.active_events(), 0);
        assert_eq!(platform.release_calls(), 1);
        assert!(!platform.pmu_reserved());
        assert_eq!(pmu.irqs().active_count(), 0);
    }

    #[test]
    fn test_unknown_cpu_is_ignored() {
        let (pmu, regs, platform) = setup(PmuId::CortexA9, 6, 1);
        let event = init(&pmu, EventAttr::raw(0x08));
        pmu.add(&event, EventFlags::START).expect("add");
        regs.raise_overflow(1);

        platform.set_current_cpu(5);
        let other = init(&pmu, EventAttr::raw(0x10));
        assert_eq!(pmu.add(&other, EventFlags::START), Err(PmuError::NoHardware));
        pmu.read(&event);
        pmu.stop(&event, EventFlags::UPDATE);
        pmu.pmu_disable();
        pmu.pmu_enable();
        assert_eq!(pmu.handle_irq(100), IrqReturn::None);
        assert_eq!(other.hw().index(), None);

        platform.set_current_cpu(0);
        assert!(event.hw().state().is_empty());
        pmu.del(&event, EventFlags::UPDATE);
        assert_eq!(event.hw().index(), None);
    }

    #[test]
    fn test_set_period_from_zero() {
        let (pmu, regs, _) = setup(PmuId::CortexA9, 6, 1);
        let event = init(&pmu, EventAttr::raw(0x08).with_sample_period(1000));
        event.hw().set_period_left(0);

        assert!(pmu.event_set_period(&event, 1));
        assert_eq!(event.hw().period_left(), 1000);
        assert_eq!(event.hw().last_period(), 1000);
        assert_eq!(pmu.backend().read_counter(1), 0xFFFF_FC18);
        assert_eq!(regs.cnten(), 0);
    }

    #[test]
    fn test_set_period_stale() {
        let (pmu, _, _) = setup(PmuId::CortexA9, 6, 1);
        let event = init(&pmu, EventAttr::raw(0x08).with_sample_period(1000));

        event.hw().set_period_left(-2500);
        assert!(pmu.event_set_period(&event, 1));
        assert_eq!(event.hw().period_left(), 1000);

        event.hw().set_period_left(400);
        assert!(!pmu.event_set_period(&event, 1));
        assert_eq!(event.hw().period_left(), 400);
        assert_eq!(pmu.backend().read_counter(1), 400u32.wrapping_neg());
    }

    #[test]
    fn test_set_period_clamps_to_counter_width() {
        let (pmu, _, _) = setup(PmuId::CortexA9, 6, 1);
        let event = init(&pmu, EventAttr::raw(0x08).with_sample_period(1 << 40));

        assert!(!pmu.event_set_period(&event, 1));
        assert_eq!(pmu.backend().read_counter(1), 1);
    }

    #[test]
    fn test_overflow_delta() {
        let (pmu, _, _) = setup(PmuId::CortexA9, 6, 1);
        let event = init(&pmu, EventAttr::raw(0x08));
        let max = pmu.max_period();

        event.hw().rebase_prev_count(max - 10);
        pmu.backend().write_counter(1, 5);
        assert_eq!(pmu.event_update(&event, 1, true), 5);
        assert_eq!(event.count(), 16);
        assert_eq!(event.hw().prev_count(), 5);
    }

    #[test]
    fn test_plain_delta_wraps_in_counter_width() {
        let (pmu, _, _) = setup(PmuId::CortexA9, 6, 1);
        let event = init(&pmu, EventAttr::raw(0x08));

        event.hw().rebase_prev_count(0xffff_fff0);
        pmu.backend().write_counter(1, 0x10);
        pmu.event_update(&event, 1, false);
        assert_eq!(event.count(), 0x20);
    }

    #[test]
    fn test_add_start_read_stop_del() {
        let (pmu, regs, platform) = setup(PmuId::CortexA9, 6, 1);
        let event = init(&pmu, EventAttr::hardware(HwEventId::Instructions));

        assert_eq!(pmu.add(&event, EventFlags::START), Ok(()));
        assert_eq!(event.hw().index(), Some(1));
        assert!(event.hw().state().is_empty());
        assert!(regs.is_counting());

        regs.tick(0, 250);
        pmu.read(&event);
        assert_eq!(event.count(), 250);

        regs.tick(0, 50);
        pmu.stop(&event, EventFlags::empty());
        assert_eq!(event.count(), 300);
        assert!(event.hw().state().contains(HesFlags::STOPPED | HesFlags::UPTODATE));

        // Ticks while stopped are not counted
        regs.tick(0, 1000);
        pmu.stop(&event, EventFlags::UPDATE);
        assert_eq!(event.count(), 300);

        pmu.del(&event, EventFlags::UPDATE);
        assert_eq!(event.hw().index(), None);
        let slots = pmu.cpu_events(0).expect("cpu 0").lock(&*platform);
        assert_eq!(slots.used_mask().count(), 0);
        assert!(slots.event(1).is_none());
    }

    #[test]
    fn test_start_reprograms_period() {
        let (pmu, regs, _) = setup(PmuId::CortexA9, 6, 1);
        let event = init(&pmu, EventAttr::raw(0x08).with_sample_period(100));

        pmu.add(&event, EventFlags::START).expect("add");
        regs.tick(0, 30);
        pmu.stop(&event, EventFlags::UPDATE);
        assert_eq!(event.hw().period_left(), 70);

        // The hardware kept counting while stopped
        regs.tick(0, 500);
        pmu.start(&event, EventFlags::RELOAD);
        assert_eq!(pmu.backend().read_counter(1), 70u32.wrapping_neg());
        assert_eq!(event.count(), 30);
    }

    #[test]
    fn test_cycle_counter_slot() {
        let (pmu, _, _) = setup(PmuId::CortexA9, 6, 1);
        let cycles = init(&pmu, EventAttr::hardware(HwEventId::CpuCycles));
        let second = init(&pmu, EventAttr::hardware(HwEventId::CpuCycles));

        assert_eq!(pmu.add(&cycles, EventFlags::empty()), Ok(()));
        assert_eq!(cycles.hw().index(), Some(0));
        assert_eq!(pmu.add(&second, EventFlags::empty()), Err(PmuError::NoSpace));
        assert_eq!(second.hw().index(), None);
    }

    #[test]
    fn test_occupancy_tracks_scheduled_events() {
        let (pmu, _, platform) = setup(PmuId::CortexA8, 4, 1);
        let events: Vec<_> = (0..6).map(|_| init(&pmu, EventAttr::raw(0x08))).collect();
        let used = || {
            pmu.cpu_events(0)
                .expect("cpu 0")
                .lock(&*platform)
                .used_mask()
                .count()
        };

        let mut scheduled = Vec::new();
        for event in &events {
            match pmu.add(event, EventFlags::START) {
                Ok(()) => scheduled.push(Arc::clone(event)),
                Err(err) => assert_eq!(err, PmuError::NoSpace),
            }
            assert_eq!(used(), scheduled.len());
        }
        assert_eq!(scheduled.len(), 4);

        while let Some(event) = scheduled.pop() {
            pmu.del(&event, EventFlags::UPDATE);
            assert_eq!(used(), scheduled.len());
        }

        // A freed slot can be reused
        assert_eq!(pmu.add(&events[5], EventFlags::empty()), Ok(()));
        assert_eq!(used(), 1);
    }

    #[test]
    fn test_add_failure_leaves_table_untouched() {
        let (pmu, _, platform) = setup(PmuId::CortexA8, 1, 1);
        let first = init(&pmu, EventAttr::raw(0x08));
        let second = init(&pmu, EventAttr::raw(0x08));

        pmu.add(&first, EventFlags::empty()).expect("add");
        assert_eq!(pmu.add(&second, EventFlags::START), Err(PmuError::NoSpace));

        let slots = pmu.cpu_events(0).expect("cpu 0").lock(&*platform);
        assert_eq!(slots.used_mask().count(), 1);
        assert_eq!(slots.occupied().count(), 1);
        drop(slots);
        assert_eq!(pmu.cpu_events(0).expect("cpu 0").disable_depth(), 0);
        assert_eq!(platform.irq_mask_depth(), 0);
    }

    #[test]
    fn test_unsupported_event() {
        let (pmu, _, platform) = setup(PmuId::CortexA9, 6, 1);
        let mut event = PerfEvent::new(EventAttr::hardware(HwEventId::BusCycles));

        assert_eq!(pmu.event_init(&mut event), Err(PmuError::NotSupported));
        assert_eq!(event.source(), None);
        assert_eq!(pmu.active_events(), 0);
        assert_eq!(platform.reserve_calls(), 0);
    }

    #[test]
    fn test_mode_exclusion_denied_before_reservation() {
        let (pmu, _, platform) = setup(PmuId::CortexA9, 6, 1);
        let attr = EventAttr::raw(0x08).with_exclude(ExcludeFlags::KERNEL);
        let mut event = PerfEvent::new(attr);

        assert_eq!(pmu.event_init(&mut event), Err(PmuError::PermissionDenied));
        assert_eq!(platform.reserve_calls(), 0);
        assert_eq!(platform.request_calls(), 0);
        assert_eq!(pmu.active_events(), 0);
    }

    #[test]
    fn test_mode_exclusion_with_filter() {
        let (pmu, regs, _) = setup(PmuId::CortexA15, 6, 1);
        let attr = EventAttr::raw(0x08).with_exclude(ExcludeFlags::USER);
        let event = init(&pmu, attr);

        pmu.add(&event, EventFlags::START).expect("add");
        assert_eq!(
            regs.event_type(0),
            crate::armv7::evtype::EXCLUDE_USER | crate::armv7::evtype::INCLUDE_HYP | 0x08
        );

        let idle = EventAttr::raw(0x08).with_exclude(ExcludeFlags::IDLE);
        let mut event = PerfEvent::new(idle);
        assert_eq!(pmu.event_init(&mut event), Err(PmuError::PermissionDenied));
    }

    #[test]
    fn test_reserve_on_first_release_on_last() {
        let (pmu, _, platform) = setup(PmuId::CortexA9, 6, 2);

        let first = init(&pmu, EventAttr::raw(0x08));
        assert_eq!(pmu.active_events(), 1);
        assert_eq!(platform.requested_irqs(), [100, 101]);

        let second = init(&pmu, EventAttr::raw(0x10));
        assert_eq!(pmu.active_events(), 2);
        assert_eq!(platform.reserve_calls(), 1);

        pmu.event_destroy(&first);
        pmu.event_destroy(&first);
        assert_eq!(pmu.active_events(), 1);
        assert!(platform.pmu_reserved());

        pmu.event_destroy(&second);
        assert_eq!(pmu.active_events(), 0);
        assert_eq!(platform.release_calls(), 1);
        assert!(platform.requested_irqs().is_empty());
    }

    #[test]
    fn test_reservation_failure_is_retried() {
        let regs = SimRegisters::new(6);
        let platform = Arc::new(SimPlatform::new(2).with_irqs(Vec::new()));
        let backend = Armv7Backend::new(PmuId::CortexA9, regs).expect("architected model");
        let pmu = CpuPmu::new(Box::new(backend), platform.clone(), PmuConfig::default());

        let mut event = PerfEvent::new(EventAttr::raw(0x08));
        assert_eq!(pmu.event_init(&mut event), Err(PmuError::NoHardware));
        assert_eq!(pmu.active_events(), 0);
        assert_eq!(pmu.event_init(&mut event), Err(PmuError::NoHardware));
        assert_eq!(platform.reserve_calls(), 2);
        assert!(!platform.pmu_reserved());
    }

    #[test]
    fn test_concurrent_first_and_last_event() {
        const THREADS: usize = 8;
        let (pmu, _, platform) = setup(PmuId::CortexA9, 6, 4);
        let pmu = Arc::new(pmu);
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let pmu = Arc::clone(&pmu);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let mut event = PerfEvent::new(EventAttr::raw(0x08));
                    barrier.wait();
                    pmu.event_init(&mut event).expect("event init");
                    event
                })
            })
            .collect();
        let events: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .collect();

        assert_eq!(pmu.active_events(), THREADS);
        assert_eq!(platform.reserve_calls(), 1);
        assert_eq!(platform.request_calls(), 4);

        let events = Arc::new(events);
        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let pmu = Arc::clone(&pmu);
                let events = Arc::clone(&events);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    pmu.event_destroy(&events[i]);
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread");
        }

        assert_eq!(pmu.active_events(), 0);
        assert_eq!(platform.release_calls(), 1);
        assert_eq!(platform.free_calls(), 4);
    }

    #[test]
    fn test_concurrent_reads_account_once() {
        const THREADS: usize = 4;
        const ROUNDS: u32 = 500;
        let (pmu, regs, _) = setup(PmuId::CortexA9, 6, 1);
        let pmu = Arc::new(pmu);
        let event = init(&pmu, EventAttr::raw(0x08));
        pmu.add(&event, EventFlags::START).expect("add");
        let start = event.count();
        let ticked = Arc::new(AtomicU64::new(0));
        let barrier = Arc::new(Barrier::new(THREADS + 1));

        let readers: Vec<_> = (0..THREADS)
            .map(|_| {
                let pmu = Arc::clone(&pmu);
                let event = Arc::clone(&event);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..ROUNDS {
                        pmu.read(&event);
                    }
                })
            })
            .collect();

        barrier.wait();
        for _ in 0..ROUNDS {
            regs.tick(0, 3);
            ticked.fetch_add(3, Ordering::Relaxed);
        }
        for reader in readers {
            reader.join().expect("thread");
        }

        pmu.read(&event);
        assert_eq!(event.count() - start, ticked.load(Ordering::Relaxed));
    }

    #[test]
    fn test_disable_bracket_nests() {
        let (pmu, regs, _) = setup(PmuId::CortexA9, 6, 1);
        let event = init(&pmu, EventAttr::raw(0x08));
        pmu.add(&event, EventFlags::START).expect("add");
        assert!(regs.is_counting());

        {
            let _outer = PmuDisableGuard::new(&pmu);
            assert!(!regs.is_counting());
            {
                let _inner = PmuDisableGuard::new(&pmu);
            }
            assert!(!regs.is_counting());
        }
        assert!(regs.is_counting());
    }

    #[test]
    fn test_enable_skips_stopped_counters() {
        let (pmu, regs, _) = setup(PmuId::CortexA9, 6, 1);
        let event = init(&pmu, EventAttr::raw(0x08));
        pmu.add(&event, EventFlags::empty()).expect("add");

        pmu.pmu_disable();
        pmu.pmu_enable();
        assert_eq!(regs.cnten(), 0);
        assert!(!regs.is_counting());
    }

    #[test]
    fn test_overflow_irq_delivers_sample() {
        let (pmu, regs, _) = setup(PmuId::CortexA9, 6, 1);
        let samples = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&samples);
        let mut event = PerfEvent::new(EventAttr::raw(0x08).with_sample_period(100))
            .with_overflow_handler(move |_, sample| {
                assert_eq!(sample.period, 100);
                seen.fetch_add(1, Ordering::SeqCst);
                false
            });
        pmu.event_init(&mut event).expect("event init");
        let event = Arc::new(event);
        pmu.add(&event, EventFlags::START).expect("add");

        regs.tick(0, 100);
        assert_eq!(pmu.handle_irq(100), IrqReturn::Handled);
        assert_eq!(event.count(), 100);
        assert_eq!(samples.load(Ordering::SeqCst), 1);
        assert_eq!(pmu.backend().read_counter(1), 100u32.wrapping_neg());

        // Nothing pending
        assert_eq!(pmu.handle_irq(100), IrqReturn::None);
    }

    #[test]
    fn test_overflow_throttle_stops_counter() {
        let (pmu, regs, _) = setup(PmuId::CortexA9, 6, 1);
        let mut event = PerfEvent::new(EventAttr::raw(0x08).with_sample_period(10))
            .with_overflow_handler(|_, _| true);
        pmu.event_init(&mut event).expect("event init");
        let event = Arc::new(event);
        pmu.add(&event, EventFlags::START).expect("add");

        regs.tick(0, 10);
        assert_eq!(pmu.handle_irq(100), IrqReturn::Handled);
        assert!(event.hw().state().contains(HesFlags::STOPPED));
        assert_eq!(regs.cnten(), 0);
    }

    #[test]
    fn test_platform_hook_wraps_handler() {
        fn hook(irq: u32, handler: &dyn Fn(u32) -> IrqReturn) -> IrqReturn {
            if irq == 7 {
                return IrqReturn::None;
            }
            handler(irq)
        }

        let regs = SimRegisters::new(6);
        let platform = Arc::new(SimPlatform::new(1).with_irq_hook(hook));
        let backend = Armv7Backend::new(PmuId::CortexA9, regs.clone()).expect("architected model");
        let pmu = CpuPmu::new(Box::new(backend), platform, PmuConfig::default());
        let event = init(&pmu, EventAttr::raw(0x08).with_sample_period(10));
        pmu.add(&event, EventFlags::START).expect("add");

        regs.tick(0, 10);
        assert_eq!(pmu.handle_irq(7), IrqReturn::None);
        assert_eq!(pmu.handle_irq(100), IrqReturn::Handled);
        assert_eq!(event.count(), 10);
    }

    #[test]
    fn test_reset_all() {
        let (pmu, regs, _) = setup(PmuId::CortexA9, 6, 2);
        pmu.backend().write_counter(2, 77);
        pmu.reset_all();
        assert_eq!(pmu.backend().read_counter(2), 0);
        assert_eq!(regs.cnten(), 0);
    }
}
