//! # Performance Events
//!
//! The generic event descriptor consumed from the event framework, the
//! event object the framework owns, and the hardware sub-record the PMU
//! core manages inside it.
//!
//! ## Event Object Layout
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ PerfEvent                                                     │
//! │                                                               │
//! │  attr ─────────▶ EventAttr { type, config, exclude, period }  │
//! │  source ───────▶ PMU the event is bound to (set at init)      │
//! │  count  ───────▶ 64-bit logical count (delta accounting)      │
//! │  state  ───────▶ Error / Off / Inactive / Active              │
//! │  leader ───────▶ group leader (None = leads itself)           │
//! │                                                               │
//! │  ┌─────────────────────────────────────────────────────────┐  │
//! │  │ HwPerfEvent (owned by the PMU core)                     │  │
//! │  │   idx          counter slot, -1 when unscheduled        │  │
//! │  │   config_base  backend encoding, set once at init       │  │
//! │  │   prev_count   shadow of the raw register (CAS only)    │  │
//! │  │   period_left / last_period / sample_period             │  │
//! │  └─────────────────────────────────────────────────────────┘  │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Cache Event Encoding
//!
//! ```text
//!   bits 23..16      15..8        7..0
//!  ┌────────────┬────────────┬────────────┐
//!  │  result    │  operation │ cache type │
//!  └────────────┴────────────┴────────────┘
//! ```

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};

use spin::{Mutex, MutexGuard};

use crate::error::{PmuError, PmuResult};

// ============================================================================
// EVENT TYPES
// ============================================================================

/// Event type of a generic event descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum EventType {
    /// Generic hardware event (`HwEventId`)
    Hardware = 0,
    /// Generic cache event (`HwCacheConfig` encoding)
    HwCache  = 3,
    /// Raw, backend-specific event number
    Raw      = 4,
}

impl EventType {
    /// Decode the framework's numeric type
    pub const fn from_raw(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Hardware),
            3 => Some(Self::HwCache),
            4 => Some(Self::Raw),
            _ => None,
        }
    }
}

/// Generic hardware events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum HwEventId {
    /// CPU cycles
    CpuCycles          = 0,
    /// Instructions retired
    Instructions       = 1,
    /// Cache accesses
    CacheReferences    = 2,
    /// Cache misses
    CacheMisses        = 3,
    /// Branch instructions
    BranchInstructions = 4,
    /// Mispredicted branches
    BranchMisses       = 5,
    /// Bus cycles
    BusCycles          = 6,
}

impl HwEventId {
    /// Number of generic hardware events
    pub const COUNT: usize = 7;
}

bitflags::bitflags! {
    /// Privilege-mode exclusion requested by an event
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ExcludeFlags: u32 {
        /// Don't count user mode
        const USER   = 1 << 0;
        /// Don't count kernel mode
        const KERNEL = 1 << 1;
        /// Don't count hypervisor mode
        const HV     = 1 << 2;
        /// Don't count when the CPU is idle
        const IDLE   = 1 << 3;
    }
}

bitflags::bitflags! {
    /// Hardware state of a scheduled event
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HesFlags: u32 {
        /// The counter is not counting
        const STOPPED  = 1 << 0;
        /// `count` reflects everything the counter has seen
        const UPTODATE = 1 << 1;
    }
}

bitflags::bitflags! {
    /// Flags passed by the framework to add/del/start/stop
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EventFlags: u32 {
        /// Start counting right after `add()`
        const START  = 1 << 0;
        /// Reload the period on `start()`
        const RELOAD = 1 << 1;
        /// Update the count on `stop()`
        const UPDATE = 1 << 2;
    }
}

/// Scheduling state of an event in the framework
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum EventState {
    /// Event hit an unrecoverable error
    Error    = -2,
    /// Event is administratively disabled
    Off      = -1,
    /// Event is enabled but not scheduled
    Inactive = 0,
    /// Event is scheduled on hardware
    Active   = 1,
}

impl From<i32> for EventState {
    fn from(value: i32) -> Self {
        match value {
            1 => Self::Active,
            0 => Self::Inactive,
            -1 => Self::Off,
            _ => Self::Error,
        }
    }
}

// ============================================================================
// CACHE EVENT ENCODING
// ============================================================================

/// Cache being monitored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CacheType {
    /// Level 1 data cache
    L1D  = 0,
    /// Level 1 instruction cache
    L1I  = 1,
    /// Last-level cache
    LL   = 2,
    /// Data TLB
    DTlb = 3,
    /// Instruction TLB
    ITlb = 4,
    /// Branch prediction unit
    Bpu  = 5,
    /// Local memory node
    Node = 6,
}

impl CacheType {
    /// Number of cache types
    pub const COUNT: usize = 7;

    const ALL: [Self; Self::COUNT] = [
        Self::L1D,
        Self::L1I,
        Self::LL,
        Self::DTlb,
        Self::ITlb,
        Self::Bpu,
        Self::Node,
    ];
}

/// Cache operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CacheOp {
    /// Read access
    Read     = 0,
    /// Write access
    Write    = 1,
    /// Prefetch
    Prefetch = 2,
}

impl CacheOp {
    /// Number of cache operations
    pub const COUNT: usize = 3;

    const ALL: [Self; Self::COUNT] = [Self::Read, Self::Write, Self::Prefetch];
}

/// Cache operation result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CacheResult {
    /// The operation was performed
    Access = 0,
    /// The operation missed
    Miss   = 1,
}

impl CacheResult {
    /// Number of cache results
    pub const COUNT: usize = 2;

    const ALL: [Self; Self::COUNT] = [Self::Access, Self::Miss];
}

/// Decoded generic cache event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HwCacheConfig {
    /// Cache type
    pub cache: CacheType,
    /// Operation
    pub op: CacheOp,
    /// Result
    pub result: CacheResult,
}

impl HwCacheConfig {
    /// Create a cache event
    pub const fn new(cache: CacheType, op: CacheOp, result: CacheResult) -> Self {
        Self { cache, op, result }
    }

    /// Pack into the 64-bit config value
    pub const fn encode(self) -> u64 {
        (self.cache as u64) | ((self.op as u64) << 8) | ((self.result as u64) << 16)
    }

    /// Unpack a 64-bit config value, range-checking every field
    pub fn decode(config: u64) -> PmuResult<Self> {
        let field = |shift: u32, max: usize| -> PmuResult<usize> {
            let value = ((config >> shift) & 0xff) as usize;
            if value >= max {
                return Err(PmuError::InvalidArgument);
            }
            Ok(value)
        };

        Ok(Self {
            cache: CacheType::ALL[field(0, CacheType::COUNT)?],
            op: CacheOp::ALL[field(8, CacheOp::COUNT)?],
            result: CacheResult::ALL[field(16, CacheResult::COUNT)?],
        })
    }
}

// ============================================================================
// EVENT DESCRIPTOR
// ============================================================================

/// Generic event descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventAttr {
    /// Event type
    pub event_type: EventType,
    /// Type-specific config value
    pub config: u64,
    /// Privilege-mode exclusion
    pub exclude: ExcludeFlags,
    /// Requested sample period, 0 for a free-running count
    pub sample_period: u64,
}

impl EventAttr {
    /// Generic hardware event
    pub const fn hardware(id: HwEventId) -> Self {
        Self::new(EventType::Hardware, id as u64)
    }

    /// Generic cache event
    pub const fn cache(config: HwCacheConfig) -> Self {
        Self::new(EventType::HwCache, config.encode())
    }

    /// Raw backend event
    pub const fn raw(config: u64) -> Self {
        Self::new(EventType::Raw, config)
    }

    /// Descriptor with no exclusion and no sample period
    pub const fn new(event_type: EventType, config: u64) -> Self {
        Self {
            event_type,
            config,
            exclude: ExcludeFlags::empty(),
            sample_period: 0,
        }
    }

    /// Set the sample period
    pub const fn with_sample_period(mut self, period: u64) -> Self {
        self.sample_period = period;
        self
    }

    /// Set the exclusion flags
    pub const fn with_exclude(mut self, exclude: ExcludeFlags) -> Self {
        self.exclude = exclude;
        self
    }

    /// Whether any privilege mode is excluded
    pub fn requires_mode_exclusion(&self) -> bool {
        !self.exclude.is_empty()
    }
}

// ============================================================================
// HARDWARE EVENT STATE
// ============================================================================

const IDX_UNASSIGNED: i32 = -1;

/// Hardware sub-record of an event, managed exclusively by the PMU core
pub struct HwPerfEvent {
    idx: AtomicI32,
    config_base: u32,
    state: AtomicU32,
    prev_count: AtomicU64,
    period_left: AtomicI64,
    last_period: AtomicU64,
    sample_period: u64,
    reserved: AtomicBool,
}

impl HwPerfEvent {
    fn new(sample_period: u64) -> Self {
        Self {
            idx: AtomicI32::new(IDX_UNASSIGNED),
            config_base: 0,
            state: AtomicU32::new((HesFlags::STOPPED | HesFlags::UPTODATE).bits()),
            prev_count: AtomicU64::new(0),
            period_left: AtomicI64::new(sample_period as i64),
            last_period: AtomicU64::new(sample_period),
            sample_period,
            reserved: AtomicBool::new(false),
        }
    }

    /// Throwaway copy used for placement checks against a scratch table
    pub(crate) fn fake_copy(&self) -> Self {
        Self {
            idx: AtomicI32::new(self.idx.load(Ordering::Relaxed)),
            config_base: self.config_base,
            state: AtomicU32::new(self.state.load(Ordering::Relaxed)),
            prev_count: AtomicU64::new(self.prev_count.load(Ordering::Relaxed)),
            period_left: AtomicI64::new(self.period_left.load(Ordering::Relaxed)),
            last_period: AtomicU64::new(self.last_period.load(Ordering::Relaxed)),
            sample_period: self.sample_period,
            reserved: AtomicBool::new(false),
        }
    }

    /// Assigned counter slot, if scheduled
    pub fn index(&self) -> Option<usize> {
        let idx = self.idx.load(Ordering::Acquire);
        (idx >= 0).then_some(idx as usize)
    }

    pub(crate) fn set_index(&self, idx: Option<usize>) {
        let raw = idx.map_or(IDX_UNASSIGNED, |i| i as i32);
        self.idx.store(raw, Ordering::Release);
    }

    /// Backend-specific hardware configuration
    pub fn config_base(&self) -> u32 {
        self.config_base
    }

    /// Mutable access for the backend's mode filter during initialization
    pub fn config_base_mut(&mut self) -> &mut u32 {
        &mut self.config_base
    }

    /// Current hardware state
    pub fn state(&self) -> HesFlags {
        HesFlags::from_bits_truncate(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: HesFlags) {
        self.state.store(state.bits(), Ordering::Release);
    }

    pub(crate) fn insert_state(&self, state: HesFlags) {
        self.state.fetch_or(state.bits(), Ordering::AcqRel);
    }

    /// Shadow of the raw counter register at the last observation
    pub fn prev_count(&self) -> u64 {
        self.prev_count.load(Ordering::Acquire)
    }

    /// Swap the shadow value if nobody raced in since `current` was read
    pub(crate) fn exchange_prev_count(&self, current: u64, new: u64) -> bool {
        self.prev_count
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Re-base the shadow value after programming the counter
    pub(crate) fn rebase_prev_count(&self, new: u64) {
        let mut current = self.prev_count();
        while !self.exchange_prev_count(current, new) {
            current = self.prev_count();
        }
    }

    /// Ticks left until the next overflow sample
    pub fn period_left(&self) -> i64 {
        self.period_left.load(Ordering::Acquire)
    }

    pub(crate) fn set_period_left(&self, left: i64) {
        self.period_left.store(left, Ordering::Release);
    }

    pub(crate) fn sub_period_left(&self, delta: u64) {
        self.period_left.fetch_sub(delta as i64, Ordering::AcqRel);
    }

    /// Period length that was programmed for the last overflow
    pub fn last_period(&self) -> u64 {
        self.last_period.load(Ordering::Acquire)
    }

    pub(crate) fn set_last_period(&self, period: u64) {
        self.last_period.store(period, Ordering::Release);
    }

    /// Sample period in effect
    pub fn sample_period(&self) -> u64 {
        self.sample_period
    }

    fn init_config(&mut self, mapping: u32, default_period: u64) {
        self.idx = AtomicI32::new(IDX_UNASSIGNED);
        self.config_base |= mapping;
        if self.sample_period == 0 {
            self.sample_period = default_period;
            self.last_period = AtomicU64::new(default_period);
            self.period_left = AtomicI64::new(default_period as i64);
        }
    }

    pub(crate) fn mark_reserved(&self) {
        self.reserved.store(true, Ordering::Release);
    }

    pub(crate) fn is_reserved(&self) -> bool {
        self.reserved.load(Ordering::Acquire)
    }

    pub(crate) fn take_reservation(&self) -> bool {
        self.reserved.swap(false, Ordering::AcqRel)
    }
}

impl fmt::Debug for HwPerfEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HwPerfEvent")
            .field("idx", &self.index())
            .field("config_base", &format_args!("{:#x}", self.config_base))
            .field("state", &self.state())
            .field("prev_count", &self.prev_count())
            .field("period_left", &self.period_left())
            .field("sample_period", &self.sample_period)
            .finish()
    }
}

// ============================================================================
// EVENT OBJECT
// ============================================================================

/// Identity of the PMU an event is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(u32);

impl SourceId {
    /// Allocate a fresh identity
    pub fn next() -> Self {
        static NEXT: AtomicU32 = AtomicU32::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

/// Data handed to an event's overflow handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverflowSample {
    /// Period that just elapsed
    pub period: u64,
    /// Logical count after accounting the overflow
    pub count: u64,
}

/// Overflow callback; returning `true` throttles (disables) the counter
pub type OverflowHandler = Box<dyn Fn(&PerfEvent, &OverflowSample) -> bool + Send + Sync>;

/// A performance event as owned by the event framework
pub struct PerfEvent {
    attr: EventAttr,
    source: Option<SourceId>,
    hw: HwPerfEvent,
    count: AtomicU64,
    state: AtomicI32,
    leader: Option<Arc<PerfEvent>>,
    siblings: Mutex<Vec<Arc<PerfEvent>>>,
    overflow_handler: Option<OverflowHandler>,
}

impl PerfEvent {
    /// Create an unbound group leader
    pub fn new(attr: EventAttr) -> Self {
        Self {
            attr,
            source: None,
            hw: HwPerfEvent::new(attr.sample_period),
            count: AtomicU64::new(0),
            state: AtomicI32::new(EventState::Inactive as i32),
            leader: None,
            siblings: Mutex::new(Vec::new()),
            overflow_handler: None,
        }
    }

    /// Create an event that will join `leader`'s group
    ///
    /// The event is not visible to the group until [`PerfEvent::attach_to_group`].
    pub fn new_sibling(attr: EventAttr, leader: &Arc<PerfEvent>) -> Self {
        let mut event = Self::new(attr);
        event.leader = Some(Arc::clone(leader));
        event
    }

    /// Install an overflow handler
    pub fn with_overflow_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&PerfEvent, &OverflowSample) -> bool + Send + Sync + 'static,
    {
        self.overflow_handler = Some(Box::new(handler));
        self
    }

    /// Publish this event in its leader's sibling list
    pub fn attach_to_group(self: &Arc<Self>) {
        if let Some(leader) = &self.leader {
            leader.siblings.lock().push(Arc::clone(self));
        }
    }

    /// Remove this event from its leader's sibling list
    pub fn detach_from_group(self: &Arc<Self>) {
        if let Some(leader) = &self.leader {
            leader.siblings.lock().retain(|s| !Arc::ptr_eq(s, self));
        }
    }

    /// Event descriptor
    pub fn attr(&self) -> &EventAttr {
        &self.attr
    }

    /// PMU this event is bound to, once initialized
    pub fn source(&self) -> Option<SourceId> {
        self.source
    }

    pub(crate) fn bind(&mut self, source: Option<SourceId>) {
        self.source = source;
    }

    /// Hardware sub-record
    pub fn hw(&self) -> &HwPerfEvent {
        &self.hw
    }

    /// Accumulated 64-bit count
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    pub(crate) fn add_count(&self, delta: u64) {
        self.count.fetch_add(delta, Ordering::AcqRel);
    }

    /// Framework scheduling state
    pub fn state(&self) -> EventState {
        EventState::from(self.state.load(Ordering::Acquire))
    }

    /// Change the framework scheduling state
    pub fn set_state(&self, state: EventState) {
        self.state.store(state as i32, Ordering::Release);
    }

    /// Group leader, `None` when the event leads its own group
    pub fn group_leader(&self) -> Option<&Arc<PerfEvent>> {
        self.leader.as_ref()
    }

    /// Siblings of a group leader
    pub fn siblings(&self) -> MutexGuard<'_, Vec<Arc<PerfEvent>>> {
        self.siblings.lock()
    }

    /// Run the overflow handler; `true` asks for the counter to be throttled
    pub(crate) fn overflow(&self, sample: &OverflowSample) -> bool {
        self.overflow_handler
            .as_ref()
            .map(|handler| handler(self, sample))
            .unwrap_or(false)
    }

    pub(crate) fn init_hw(&mut self, mapping: u32, default_period: u64) {
        self.hw.init_config(mapping, default_period);
    }

    pub(crate) fn hw_mut(&mut self) -> &mut HwPerfEvent {
        &mut self.hw
    }
}

impl fmt::Debug for PerfEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerfEvent")
            .field("attr", &self.attr)
            .field("source", &self.source)
            .field("hw", &self.hw)
            .field("count", &self.count())
            .field("state", &self.state())
            .field("is_leader", &self.leader.is_none())
            .finish()
    }
}
