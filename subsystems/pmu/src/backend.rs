//! # Backend Operation Table
//!
//! Model-specific register semantics behind a single trait. The PMU core is
//! written entirely against [`PmuBackend`]; each hardware variant supplies
//! one implementation, selected once at boot by [`crate::identify`].
//!
//! ## Contract
//!
//! | Operation          | Context                     | Notes                         |
//! |--------------------|-----------------------------|-------------------------------|
//! | `map_event`        | any                         | pure                          |
//! | `get_event_idx`    | table lock or scratch table | sets the chosen `used_mask` bit |
//! | `enable`/`disable` | table lock held             | read-modify-write of registers |
//! | `read`/`write_counter` | local CPU               | raw register access           |
//! | `set_event_filter` | event initialization        | may set `config_base` bits    |
//! | `start`/`stop`     | local CPU                   | global counting enable        |
//! | `reset`            | once per CPU at boot        | known state out of reset      |

use crate::cpu_events::CounterSlots;
use crate::error::{PmuError, PmuResult};
use crate::event::{
    CacheOp, CacheResult, CacheType, EventAttr, EventType, HwCacheConfig, HwEventId, HwPerfEvent,
};
use crate::identify::PmuId;

/// Marker for a generic or cache event the hardware cannot count
pub const HW_OP_UNSUPPORTED: u32 = 0xFFFF;

/// Marker for an unsupported cache event
pub const CACHE_OP_UNSUPPORTED: u32 = 0xFFFF;

/// Cache map indexed `[type][op][result]`
pub type CacheMap = [[[u32; CacheResult::COUNT]; CacheOp::COUNT]; CacheType::COUNT];

/// Cache map entry with every operation unsupported
pub const CACHE_UNSUPPORTED: [[u32; CacheResult::COUNT]; CacheOp::COUNT] =
    [[CACHE_OP_UNSUPPORTED; CacheResult::COUNT]; CacheOp::COUNT];

// ============================================================================
// EVENT MAPS
// ============================================================================

/// Static event tables of one hardware model
#[derive(Debug)]
pub struct EventMap {
    /// Generic hardware events, indexed by [`HwEventId`]
    pub hw: &'static [u32; HwEventId::COUNT],
    /// Generic cache events
    pub cache: &'static CacheMap,
    /// Mask applied to raw event numbers
    pub raw_mask: u32,
}

impl EventMap {
    /// Translate a generic event descriptor into a hardware event number
    pub fn map(&self, attr: &EventAttr) -> PmuResult<u32> {
        match attr.event_type {
            EventType::Hardware => self.map_hw(attr.config),
            EventType::HwCache => self.map_cache(attr.config),
            EventType::Raw => Ok((attr.config & u64::from(self.raw_mask)) as u32),
        }
    }

    fn map_hw(&self, config: u64) -> PmuResult<u32> {
        let mapping = usize::try_from(config)
            .ok()
            .and_then(|idx| self.hw.get(idx))
            .copied()
            .ok_or(PmuError::NotSupported)?;
        if mapping == HW_OP_UNSUPPORTED {
            return Err(PmuError::NotSupported);
        }
        Ok(mapping)
    }

    fn map_cache(&self, config: u64) -> PmuResult<u32> {
        let HwCacheConfig { cache, op, result } = HwCacheConfig::decode(config)?;
        let mapping = self.cache[cache as usize][op as usize][result as usize];
        if mapping == CACHE_OP_UNSUPPORTED {
            return Err(PmuError::NotSupported);
        }
        Ok(mapping)
    }
}

// ============================================================================
// BACKEND TRAIT
// ============================================================================

/// Model-specific PMU operations
///
/// All register operations act on the PMU of the executing CPU. Counter
/// indices are backend-defined and lie in `0..num_events()`.
pub trait PmuBackend: Send + Sync {
    /// Detected model
    fn id(&self) -> PmuId;

    /// Human-readable model name
    fn name(&self) -> &'static str;

    /// Number of counters, including any fixed-function counter
    fn num_events(&self) -> usize;

    /// Counter width mask
    fn max_period(&self) -> u64;

    /// Hardware encoding of a generic event
    fn map_event(&self, attr: &EventAttr) -> PmuResult<u32>;

    /// Pick a free counter for `hw` and mark it used in `slots`
    fn get_event_idx(&self, slots: &mut CounterSlots, hw: &HwPerfEvent) -> PmuResult<usize>;

    /// Program and enable counter `idx` for `hw`
    fn enable(&self, hw: &HwPerfEvent, idx: usize);

    /// Disable counter `idx`
    fn disable(&self, hw: &HwPerfEvent, idx: usize);

    /// Raw value of counter `idx`
    fn read_counter(&self, idx: usize) -> u32;

    /// Set the raw value of counter `idx`
    fn write_counter(&self, idx: usize, value: u32);

    /// Apply privilege-mode filtering to `hw`
    ///
    /// Backends without mode filtering keep the default.
    fn set_event_filter(&self, _hw: &mut HwPerfEvent, _attr: &EventAttr) -> PmuResult<()> {
        Err(PmuError::NotSupported)
    }

    /// Read and clear the overflow flags, returned as a bitmask of counter indices
    fn get_reset_overflow(&self) -> u32;

    /// Enable counting globally on this CPU
    fn start(&self);

    /// Disable counting globally on this CPU
    fn stop(&self);

    /// Put this CPU's PMU into a known state
    fn reset(&self);
}
