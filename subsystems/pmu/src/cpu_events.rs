//! # Per-CPU Counter Table
//!
//! One table per logical CPU records which hardware counter slot is used and
//! which event occupies it. Every read-modify-write register sequence on a
//! CPU runs under that CPU's table lock.
//!
//! ```text
//!   CPU 0                       CPU 1                      CPU N
//!  ┌──────────────────────┐   ┌──────────────────────┐   ┌─────────────┐
//!  │ IrqSpinLock          │   │ IrqSpinLock          │   │     ...     │
//!  │ ┌──────────────────┐ │   │ ┌──────────────────┐ │   │             │
//!  │ │ used_mask 0b0101 │ │   │ │ used_mask 0b0001 │ │   │             │
//!  │ │ events[0] ─▶ ev A│ │   │ │ events[0] ─▶ ev C│ │   │             │
//!  │ │ events[2] ─▶ ev B│ │   │ │                  │ │   │             │
//!  │ └──────────────────┘ │   │ └──────────────────┘ │   │             │
//!  │ disable_count        │   │ disable_count        │   │             │
//!  └──────────────────────┘   └──────────────────────┘   └─────────────┘
//! ```
//!
//! The lock masks local interrupts before spinning so the overflow handler
//! on the same CPU can never spin on a lock its own CPU already holds.

use alloc::sync::Arc;
use core::fmt;
use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

use spin::{Mutex, MutexGuard};

use crate::event::PerfEvent;
use crate::platform::{IrqState, PmuPlatform};
use crate::MAX_HW_EVENTS;

static_assertions::const_assert!(MAX_HW_EVENTS <= u32::BITS as usize);

// ============================================================================
// OCCUPANCY BITSET
// ============================================================================

/// Occupancy bitset, bit `n` set when counter slot `n` is in use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsedMask(u32);

impl UsedMask {
    /// Empty mask
    pub const fn new() -> Self {
        Self(0)
    }

    /// Raw bits
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether slot `idx` is used
    pub fn test(&self, idx: usize) -> bool {
        idx < MAX_HW_EVENTS && self.0 & (1 << idx) != 0
    }

    /// Mark slot `idx` used, returning whether it already was
    pub fn test_and_set(&mut self, idx: usize) -> bool {
        let was_set = self.test(idx);
        if idx < MAX_HW_EVENTS {
            self.0 |= 1 << idx;
        }
        was_set
    }

    /// Mark slot `idx` free
    pub fn clear(&mut self, idx: usize) {
        if idx < MAX_HW_EVENTS {
            self.0 &= !(1 << idx);
        }
    }

    /// Number of used slots
    pub fn count(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Iterate used slot indices in ascending order
    pub fn iter(self) -> impl Iterator<Item = usize> {
        (0..MAX_HW_EVENTS).filter(move |&idx| self.0 & (1 << idx) != 0)
    }
}

// ============================================================================
// COUNTER SLOTS
// ============================================================================

/// Slot ownership of one CPU's counters
///
/// Also used as a stack-local scratch table when validating event groups.
pub struct CounterSlots {
    events: [Option<Arc<PerfEvent>>; MAX_HW_EVENTS],
    used_mask: UsedMask,
}

impl CounterSlots {
    /// Empty table
    pub const fn new() -> Self {
        const EMPTY: Option<Arc<PerfEvent>> = None;
        Self {
            events: [EMPTY; MAX_HW_EVENTS],
            used_mask: UsedMask::new(),
        }
    }

    /// Occupancy bitset
    pub fn used_mask(&self) -> &UsedMask {
        &self.used_mask
    }

    /// Occupancy bitset, for backend allocators
    pub fn used_mask_mut(&mut self) -> &mut UsedMask {
        &mut self.used_mask
    }

    /// Event occupying slot `idx`
    pub fn event(&self, idx: usize) -> Option<&Arc<PerfEvent>> {
        self.events.get(idx).and_then(Option::as_ref)
    }

    /// Iterate `(slot, event)` pairs of occupied slots
    pub fn occupied(&self) -> impl Iterator<Item = (usize, &Arc<PerfEvent>)> + '_ {
        self.events
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|event| (idx, event)))
    }

    pub(crate) fn install(&mut self, idx: usize, event: Arc<PerfEvent>) {
        self.events[idx] = Some(event);
    }

    pub(crate) fn vacate(&mut self, idx: usize) -> Option<Arc<PerfEvent>> {
        self.used_mask.clear(idx);
        self.events.get_mut(idx).and_then(Option::take)
    }
}

impl Default for CounterSlots {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CounterSlots {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CounterSlots")
            .field("used_mask", &format_args!("{:#034b}", self.used_mask.bits()))
            .finish()
    }
}

// ============================================================================
// INTERRUPT-SAFE SPINLOCK
// ============================================================================

/// Spinlock that masks local interrupts while held
pub struct IrqSpinLock<T> {
    inner: Mutex<T>,
}

impl<T> IrqSpinLock<T> {
    /// Create a new lock
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Mask local interrupts, then acquire the lock
    pub fn lock<'a>(&'a self, platform: &'a dyn PmuPlatform) -> IrqSpinGuard<'a, T> {
        let state = platform.local_irq_save();
        IrqSpinGuard {
            guard: ManuallyDrop::new(self.inner.lock()),
            platform,
            state,
        }
    }

    /// Whether the lock is currently held
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

/// Guard of an [`IrqSpinLock`]; unlocks, then restores interrupts
pub struct IrqSpinGuard<'a, T> {
    guard: ManuallyDrop<MutexGuard<'a, T>>,
    platform: &'a dyn PmuPlatform,
    state: IrqState,
}

impl<T> Deref for IrqSpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqSpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for IrqSpinGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: the guard is dropped exactly once, here, and never used again.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        self.platform.local_irq_restore(self.state);
    }
}

// ============================================================================
// PER-CPU TABLE
// ============================================================================

/// Counter table of one CPU
pub struct CpuHwEvents {
    cpu: usize,
    slots: IrqSpinLock<CounterSlots>,
    disable_count: AtomicU32,
}

impl CpuHwEvents {
    /// Table for `cpu`
    pub const fn new(cpu: usize) -> Self {
        Self {
            cpu,
            slots: IrqSpinLock::new(CounterSlots::new()),
            disable_count: AtomicU32::new(0),
        }
    }

    /// CPU this table belongs to
    pub fn cpu(&self) -> usize {
        self.cpu
    }

    /// Take the table lock
    pub fn lock<'a>(&'a self, platform: &'a dyn PmuPlatform) -> IrqSpinGuard<'a, CounterSlots> {
        self.slots.lock(platform)
    }

    /// Whether the table lock is held
    pub fn is_locked(&self) -> bool {
        self.slots.is_locked()
    }

    /// Enter a PMU-disable bracket; `true` for the outermost one
    pub(crate) fn disable_enter(&self) -> bool {
        self.disable_count.fetch_add(1, Ordering::AcqRel) == 0
    }

    /// Leave a PMU-disable bracket; `true` when the last one closes
    ///
    /// An enable without a matching disable also counts as closing.
    pub(crate) fn disable_exit(&self) -> bool {
        self.disable_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |depth| depth.checked_sub(1))
            .map_or(true, |depth| depth == 1)
    }

    /// Number of open PMU-disable brackets
    pub fn disable_depth(&self) -> u32 {
        self.disable_count.load(Ordering::Acquire)
    }
}

impl fmt::Debug for CpuHwEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuHwEvents")
            .field("cpu", &self.cpu)
            .field("disable_depth", &self.disable_depth())
            .finish()
    }
}
