//! # ARMv7 / PMUv3 Backend
//!
//! Backend for the architected PMU found on Cortex-A5/A7/A8/A9/A15 and, with
//! the same register layout, on ARMv8 PMUv3 cores (Cortex-A53/A57).
//!
//! ## Counter Indices
//!
//! ```text
//!   backend index     0            1           2          ...   N
//!                ┌──────────┬───────────┬───────────┬─────┬───────────┐
//!                │  CCNT    │  PMN0     │  PMN1     │ ... │  PMN(N-1) │
//!                └──────────┴───────────┴───────────┴─────┴───────────┘
//!   register bit     31           0           1                N-1
//! ```
//!
//! Index 0 is the dedicated cycle counter; it only accepts the cycle event.
//! `N` is read from PMNC[15:11] at probe time.

pub mod regs;

use alloc::boxed::Box;

use crate::backend::{
    CacheMap, EventMap, PmuBackend, CACHE_OP_UNSUPPORTED, CACHE_UNSUPPORTED, HW_OP_UNSUPPORTED,
};
use crate::cpu_events::CounterSlots;
use crate::error::{PmuError, PmuResult};
use crate::event::{CacheOp, CacheType, EventAttr, ExcludeFlags, HwEventId, HwPerfEvent};
use crate::identify::PmuId;

pub use regs::Armv7Registers;

// ============================================================================
// REGISTER BITS
// ============================================================================

/// PMNC control register bits
pub mod pmnc {
    /// Enable all counters
    pub const E: u32 = 1 << 0;
    /// Reset all event counters
    pub const P: u32 = 1 << 1;
    /// Reset the cycle counter
    pub const C: u32 = 1 << 2;
    /// Cycle counter divider
    pub const D: u32 = 1 << 3;
    /// Export events
    pub const X: u32 = 1 << 4;
    /// Disable the cycle counter in prohibited regions
    pub const DP: u32 = 1 << 5;
    /// Writable bits
    pub const MASK: u32 = 0x3f;
    /// Number of event counters
    pub const N_SHIFT: u32 = 11;
    /// Number of event counters
    pub const N_MASK: u32 = 0x1f;
}

/// Event type register bits
pub mod evtype {
    /// Don't count at PL1 (kernel)
    pub const EXCLUDE_PL1: u32 = 1 << 31;
    /// Don't count at PL0 (user)
    pub const EXCLUDE_USER: u32 = 1 << 30;
    /// Count at PL2 (hypervisor)
    pub const INCLUDE_HYP: u32 = 1 << 27;
    /// Writable bits
    pub const MASK: u32 = 0xc800_03ff;
}

/// Backend index of the cycle counter
pub const IDX_CYCLE_COUNTER: usize = 0;
/// Backend index of the first event counter
pub const IDX_COUNTER0: usize = 1;

const MAX_PERIOD: u64 = 0xffff_ffff;

/// Register bit of backend index `idx`
const fn counter_bit(idx: usize) -> u32 {
    1 << ((idx as u32).wrapping_sub(1) & 0x1f)
}

// ============================================================================
// EVENT NUMBERS
// ============================================================================

/// Architected common events
pub mod perfctr {
    pub const L1_ICACHE_REFILL: u32 = 0x01;
    pub const ITLB_REFILL: u32 = 0x02;
    pub const L1_DCACHE_REFILL: u32 = 0x03;
    pub const L1_DCACHE_ACCESS: u32 = 0x04;
    pub const DTLB_REFILL: u32 = 0x05;
    pub const INSTR_EXECUTED: u32 = 0x08;
    pub const PC_WRITE: u32 = 0x0C;
    pub const PC_BRANCH_MIS_PRED: u32 = 0x10;
    pub const CLOCK_CYCLES: u32 = 0x11;
    pub const PC_BRANCH_PRED: u32 = 0x12;
    pub const L1_ICACHE_ACCESS: u32 = 0x14;
    pub const L2_CACHE_ACCESS: u32 = 0x16;
    pub const L2_CACHE_REFILL: u32 = 0x17;
    pub const BUS_CYCLES: u32 = 0x1D;
    /// ARMv7 cycle counter pseudo-event
    pub const CPU_CYCLES: u32 = 0xFF;

    pub const A8_L2_CACHE_ACCESS: u32 = 0x43;
    pub const A8_L2_CACHE_REFILL: u32 = 0x44;
    pub const A8_L1_ICACHE_ACCESS: u32 = 0x50;

    pub const A9_INSTR_CORE_RENAME: u32 = 0x68;

    pub const A5_PREFETCH_LINEFILL: u32 = 0xC2;
    pub const A5_PREFETCH_LINEFILL_DROP: u32 = 0xC3;

    pub const A15_L1_DCACHE_ACCESS_READ: u32 = 0x40;
    pub const A15_L1_DCACHE_ACCESS_WRITE: u32 = 0x41;
    pub const A15_L1_DCACHE_REFILL_READ: u32 = 0x42;
    pub const A15_L1_DCACHE_REFILL_WRITE: u32 = 0x43;
    pub const A15_DTLB_REFILL_L1_READ: u32 = 0x4C;
    pub const A15_DTLB_REFILL_L1_WRITE: u32 = 0x4D;
    pub const A15_L2_DCACHE_ACCESS_READ: u32 = 0x50;
    pub const A15_L2_DCACHE_ACCESS_WRITE: u32 = 0x51;
    pub const A15_L2_DCACHE_REFILL_READ: u32 = 0x52;
    pub const A15_L2_DCACHE_REFILL_WRITE: u32 = 0x53;
    pub const A15_PC_WRITE_SPEC: u32 = 0x76;
}

use perfctr::*;

const L1D: usize = CacheType::L1D as usize;
const L1I: usize = CacheType::L1I as usize;
const LL: usize = CacheType::LL as usize;
const DTLB: usize = CacheType::DTlb as usize;
const ITLB: usize = CacheType::ITlb as usize;
const BPU: usize = CacheType::Bpu as usize;
const READ: usize = CacheOp::Read as usize;
const WRITE: usize = CacheOp::Write as usize;
const PREFETCH: usize = CacheOp::Prefetch as usize;

const U: u32 = CACHE_OP_UNSUPPORTED;

// ============================================================================
// EVENT TABLES
// ============================================================================

static A5_PERF_MAP: [u32; HwEventId::COUNT] = [
    CPU_CYCLES,
    INSTR_EXECUTED,
    L1_DCACHE_ACCESS,
    L1_DCACHE_REFILL,
    PC_WRITE,
    PC_BRANCH_MIS_PRED,
    HW_OP_UNSUPPORTED,
];

static A5_CACHE_MAP: CacheMap = {
    let mut map = [CACHE_UNSUPPORTED; CacheType::COUNT];
    map[L1D][READ] = [L1_DCACHE_ACCESS, L1_DCACHE_REFILL];
    map[L1D][WRITE] = [L1_DCACHE_ACCESS, L1_DCACHE_REFILL];
    map[L1D][PREFETCH] = [A5_PREFETCH_LINEFILL, A5_PREFETCH_LINEFILL_DROP];
    map[L1I][READ] = [L1_ICACHE_ACCESS, L1_ICACHE_REFILL];
    map[DTLB][READ] = [U, DTLB_REFILL];
    map[DTLB][WRITE] = [U, DTLB_REFILL];
    map[ITLB][READ] = [U, ITLB_REFILL];
    map[ITLB][WRITE] = [U, ITLB_REFILL];
    map[BPU][READ] = [PC_BRANCH_PRED, PC_BRANCH_MIS_PRED];
    map[BPU][WRITE] = [PC_BRANCH_PRED, PC_BRANCH_MIS_PRED];
    map
};

static A7_PERF_MAP: [u32; HwEventId::COUNT] = [
    CPU_CYCLES,
    INSTR_EXECUTED,
    L1_DCACHE_ACCESS,
    L1_DCACHE_REFILL,
    PC_WRITE,
    PC_BRANCH_MIS_PRED,
    BUS_CYCLES,
];

static A7_CACHE_MAP: CacheMap = {
    let mut map = [CACHE_UNSUPPORTED; CacheType::COUNT];
    map[L1D][READ] = [L1_DCACHE_ACCESS, L1_DCACHE_REFILL];
    map[L1D][WRITE] = [L1_DCACHE_ACCESS, L1_DCACHE_REFILL];
    map[L1I][READ] = [L1_ICACHE_ACCESS, L1_ICACHE_REFILL];
    map[LL][READ] = [L2_CACHE_ACCESS, L2_CACHE_REFILL];
    map[LL][WRITE] = [L2_CACHE_ACCESS, L2_CACHE_REFILL];
    map[DTLB][READ] = [U, DTLB_REFILL];
    map[DTLB][WRITE] = [U, DTLB_REFILL];
    map[ITLB][READ] = [U, ITLB_REFILL];
    map[ITLB][WRITE] = [U, ITLB_REFILL];
    map[BPU][READ] = [PC_BRANCH_PRED, PC_BRANCH_MIS_PRED];
    map[BPU][WRITE] = [PC_BRANCH_PRED, PC_BRANCH_MIS_PRED];
    map
};

static A8_PERF_MAP: [u32; HwEventId::COUNT] = [
    CPU_CYCLES,
    INSTR_EXECUTED,
    L1_DCACHE_ACCESS,
    L1_DCACHE_REFILL,
    PC_WRITE,
    PC_BRANCH_MIS_PRED,
    HW_OP_UNSUPPORTED,
];

static A8_CACHE_MAP: CacheMap = {
    let mut map = [CACHE_UNSUPPORTED; CacheType::COUNT];
    map[L1D][READ] = [L1_DCACHE_ACCESS, L1_DCACHE_REFILL];
    map[L1D][WRITE] = [L1_DCACHE_ACCESS, L1_DCACHE_REFILL];
    map[L1I][READ] = [A8_L1_ICACHE_ACCESS, L1_ICACHE_REFILL];
    map[LL][READ] = [A8_L2_CACHE_ACCESS, A8_L2_CACHE_REFILL];
    map[LL][WRITE] = [A8_L2_CACHE_ACCESS, A8_L2_CACHE_REFILL];
    map[DTLB][READ] = [U, DTLB_REFILL];
    map[DTLB][WRITE] = [U, DTLB_REFILL];
    map[ITLB][READ] = [U, ITLB_REFILL];
    map[ITLB][WRITE] = [U, ITLB_REFILL];
    map[BPU][READ] = [PC_BRANCH_PRED, PC_BRANCH_MIS_PRED];
    map[BPU][WRITE] = [PC_BRANCH_PRED, PC_BRANCH_MIS_PRED];
    map
};

static A9_PERF_MAP: [u32; HwEventId::COUNT] = [
    CPU_CYCLES,
    A9_INSTR_CORE_RENAME,
    L1_DCACHE_ACCESS,
    L1_DCACHE_REFILL,
    PC_WRITE,
    PC_BRANCH_MIS_PRED,
    HW_OP_UNSUPPORTED,
];

static A9_CACHE_MAP: CacheMap = {
    let mut map = [CACHE_UNSUPPORTED; CacheType::COUNT];
    map[L1D][READ] = [L1_DCACHE_ACCESS, L1_DCACHE_REFILL];
    map[L1D][WRITE] = [L1_DCACHE_ACCESS, L1_DCACHE_REFILL];
    map[L1I][READ] = [U, L1_ICACHE_REFILL];
    map[DTLB][READ] = [U, DTLB_REFILL];
    map[DTLB][WRITE] = [U, DTLB_REFILL];
    map[ITLB][READ] = [U, ITLB_REFILL];
    map[ITLB][WRITE] = [U, ITLB_REFILL];
    map[BPU][READ] = [PC_BRANCH_PRED, PC_BRANCH_MIS_PRED];
    map[BPU][WRITE] = [PC_BRANCH_PRED, PC_BRANCH_MIS_PRED];
    map
};

static A15_PERF_MAP: [u32; HwEventId::COUNT] = [
    CPU_CYCLES,
    INSTR_EXECUTED,
    L1_DCACHE_ACCESS,
    L1_DCACHE_REFILL,
    A15_PC_WRITE_SPEC,
    PC_BRANCH_MIS_PRED,
    BUS_CYCLES,
];

static A15_CACHE_MAP: CacheMap = {
    let mut map = [CACHE_UNSUPPORTED; CacheType::COUNT];
    map[L1D][READ] = [A15_L1_DCACHE_ACCESS_READ, A15_L1_DCACHE_REFILL_READ];
    map[L1D][WRITE] = [A15_L1_DCACHE_ACCESS_WRITE, A15_L1_DCACHE_REFILL_WRITE];
    map[L1I][READ] = [L1_ICACHE_ACCESS, L1_ICACHE_REFILL];
    map[LL][READ] = [A15_L2_DCACHE_ACCESS_READ, A15_L2_DCACHE_REFILL_READ];
    map[LL][WRITE] = [A15_L2_DCACHE_ACCESS_WRITE, A15_L2_DCACHE_REFILL_WRITE];
    map[DTLB][READ] = [U, A15_DTLB_REFILL_L1_READ];
    map[DTLB][WRITE] = [U, A15_DTLB_REFILL_L1_WRITE];
    map[ITLB][READ] = [U, ITLB_REFILL];
    map[ITLB][WRITE] = [U, ITLB_REFILL];
    map[BPU][READ] = [PC_BRANCH_PRED, PC_BRANCH_MIS_PRED];
    map[BPU][WRITE] = [PC_BRANCH_PRED, PC_BRANCH_MIS_PRED];
    map
};

static PMUV3_PERF_MAP: [u32; HwEventId::COUNT] = [
    CLOCK_CYCLES,
    INSTR_EXECUTED,
    L1_DCACHE_ACCESS,
    L1_DCACHE_REFILL,
    PC_WRITE,
    PC_BRANCH_MIS_PRED,
    BUS_CYCLES,
];

static PMUV3_CACHE_MAP: CacheMap = {
    let mut map = [CACHE_UNSUPPORTED; CacheType::COUNT];
    map[L1D][READ] = [L1_DCACHE_ACCESS, L1_DCACHE_REFILL];
    map[L1D][WRITE] = [L1_DCACHE_ACCESS, L1_DCACHE_REFILL];
    map[L1I][READ] = [L1_ICACHE_ACCESS, L1_ICACHE_REFILL];
    map[LL][READ] = [L2_CACHE_ACCESS, L2_CACHE_REFILL];
    map[LL][WRITE] = [L2_CACHE_ACCESS, L2_CACHE_REFILL];
    map[BPU][READ] = [PC_BRANCH_PRED, PC_BRANCH_MIS_PRED];
    map[BPU][WRITE] = [PC_BRANCH_PRED, PC_BRANCH_MIS_PRED];
    map
};

/// Event tables and cycle event of an architected model
fn model_tables(id: PmuId) -> Option<(EventMap, u32)> {
    let (hw, cache, raw_mask) = match id {
        PmuId::CortexA5 => (&A5_PERF_MAP, &A5_CACHE_MAP, 0xFF),
        PmuId::CortexA7 => (&A7_PERF_MAP, &A7_CACHE_MAP, 0xFF),
        PmuId::CortexA8 => (&A8_PERF_MAP, &A8_CACHE_MAP, 0xFF),
        PmuId::CortexA9 => (&A9_PERF_MAP, &A9_CACHE_MAP, 0xFF),
        PmuId::CortexA15 => (&A15_PERF_MAP, &A15_CACHE_MAP, 0xFF),
        PmuId::CortexA53 | PmuId::CortexA57 => (&PMUV3_PERF_MAP, &PMUV3_CACHE_MAP, 0x3FF),
        _ => return None,
    };
    let cycle_event = hw[HwEventId::CpuCycles as usize];
    Some((EventMap { hw, cache, raw_mask }, cycle_event))
}

// ============================================================================
// BACKEND
// ============================================================================

/// Architected PMU backend over a register file `R`
#[derive(Debug)]
pub struct Armv7Backend<R> {
    id: PmuId,
    map: EventMap,
    cycle_event: u32,
    num_events: usize,
    regs: R,
}

impl<R: Armv7Registers> Armv7Backend<R> {
    /// Probe the register file for model `id`
    ///
    /// Returns `None` for models without the architected register interface.
    pub fn new(id: PmuId, regs: R) -> Option<Self> {
        let (map, cycle_event) = model_tables(id)?;
        let counters = (regs.read_pmnc() >> pmnc::N_SHIFT) & pmnc::N_MASK;
        Some(Self {
            id,
            map,
            cycle_event,
            num_events: counters as usize + 1,
            regs,
        })
    }

    /// Register file
    pub fn regs(&self) -> &R {
        &self.regs
    }

    fn counter_valid(&self, idx: usize) -> bool {
        idx < self.num_events
    }

    /// Select index `idx`; the cycle counter selects its filter register (31)
    fn select_counter(&self, idx: usize) {
        self.regs.write_select((idx as u32).wrapping_sub(1) & pmnc::N_MASK);
    }

    fn write_evtsel(&self, idx: usize, value: u32) {
        self.select_counter(idx);
        self.regs.write_xevtyper(value & evtype::MASK);
    }

    fn disable_intens(&self, idx: usize) {
        let bit = counter_bit(idx);
        self.regs.write_intenc(bit);
        // Clear any overflow already latched for this counter
        self.regs.write_flags(bit);
    }
}

/// Backend constructor over `regs`, for [`crate::registry::init_hw_perf_events`]
pub fn probe<R>(regs: R) -> impl FnOnce(PmuId) -> Option<Box<dyn PmuBackend>>
where
    R: Armv7Registers + 'static,
{
    move |id| Armv7Backend::new(id, regs).map(|backend| Box::new(backend) as Box<dyn PmuBackend>)
}

impl<R: Armv7Registers> PmuBackend for Armv7Backend<R> {
    fn id(&self) -> PmuId {
        self.id
    }

    fn name(&self) -> &'static str {
        self.id.name()
    }

    fn num_events(&self) -> usize {
        self.num_events
    }

    fn max_period(&self) -> u64 {
        MAX_PERIOD
    }

    fn map_event(&self, attr: &EventAttr) -> PmuResult<u32> {
        self.map.map(attr)
    }

    fn get_event_idx(&self, slots: &mut CounterSlots, hw: &HwPerfEvent) -> PmuResult<usize> {
        let used = slots.used_mask_mut();

        if hw.config_base() & self.map.raw_mask == self.cycle_event {
            if used.test_and_set(IDX_CYCLE_COUNTER) {
                return Err(PmuError::NoCounterAvailable);
            }
            return Ok(IDX_CYCLE_COUNTER);
        }

        (IDX_COUNTER0..self.num_events)
            .find(|&idx| !used.test_and_set(idx))
            .ok_or(PmuError::NoCounterAvailable)
    }

    fn enable(&self, hw: &HwPerfEvent, idx: usize) {
        if !self.counter_valid(idx) {
            log::error!("PMU: enabling unsupported counter {}", idx);
            return;
        }

        let bit = counter_bit(idx);
        self.regs.write_cntenc(bit);

        // The cycle counter only takes an event type when it carries a mode filter
        if idx != IDX_CYCLE_COUNTER || self.id.supports_mode_filter() {
            self.write_evtsel(idx, hw.config_base());
        }

        self.regs.write_intens(bit);
        self.regs.write_cntens(bit);
    }

    fn disable(&self, _hw: &HwPerfEvent, idx: usize) {
        if !self.counter_valid(idx) {
            log::error!("PMU: disabling unsupported counter {}", idx);
            return;
        }

        self.regs.write_cntenc(counter_bit(idx));
        self.disable_intens(idx);
    }

    fn read_counter(&self, idx: usize) -> u32 {
        if !self.counter_valid(idx) {
            log::error!("PMU: reading unsupported counter {}", idx);
            return 0;
        }

        if idx == IDX_CYCLE_COUNTER {
            self.regs.read_ccnt()
        } else {
            self.select_counter(idx);
            self.regs.read_xevcntr()
        }
    }

    fn write_counter(&self, idx: usize, value: u32) {
        if !self.counter_valid(idx) {
            log::error!("PMU: writing unsupported counter {}", idx);
            return;
        }

        if idx == IDX_CYCLE_COUNTER {
            self.regs.write_ccnt(value);
        } else {
            self.select_counter(idx);
            self.regs.write_xevcntr(value);
        }
    }

    fn set_event_filter(&self, hw: &mut HwPerfEvent, attr: &EventAttr) -> PmuResult<()> {
        if !self.id.supports_mode_filter() || attr.exclude.contains(ExcludeFlags::IDLE) {
            return Err(PmuError::PermissionDenied);
        }

        let mut filter = 0;
        if attr.exclude.contains(ExcludeFlags::USER) {
            filter |= evtype::EXCLUDE_USER;
        }
        if attr.exclude.contains(ExcludeFlags::KERNEL) {
            filter |= evtype::EXCLUDE_PL1;
        }
        if !attr.exclude.contains(ExcludeFlags::HV) {
            filter |= evtype::INCLUDE_HYP;
        }

        *hw.config_base_mut() = filter;
        Ok(())
    }

    fn get_reset_overflow(&self) -> u32 {
        let flags = self.regs.read_flags();
        self.regs.write_flags(flags);
        // Register bit 31 (CCNT) becomes index 0, bit n becomes index n + 1
        flags.rotate_left(1)
    }

    fn start(&self) {
        let value = self.regs.read_pmnc();
        self.regs.write_pmnc((value | pmnc::E) & pmnc::MASK);
    }

    fn stop(&self) {
        let value = self.regs.read_pmnc();
        self.regs.write_pmnc(value & !pmnc::E & pmnc::MASK);
    }

    fn reset(&self) {
        for idx in IDX_CYCLE_COUNTER..self.num_events {
            self.regs.write_cntenc(counter_bit(idx));
            self.disable_intens(idx);
        }
        self.regs.write_pmnc(pmnc::P | pmnc::C);
    }
}
