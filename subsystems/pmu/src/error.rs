//! # PMU Errors
//!
//! Error taxonomy for event creation, scheduling and interrupt reservation.
//!
//! | Error                | errno   | Retry | Raised by                          |
//! |----------------------|---------|-------|------------------------------------|
//! | `NotSupported`       | ENOENT  | No    | event mapping, missing hardware    |
//! | `InvalidArgument`    | EINVAL  | No    | malformed cache-event encoding     |
//! | `PermissionDenied`   | EPERM   | No    | mode exclusion without filtering   |
//! | `NoSpace`            | ENOSPC  | Yes   | group validation, `add()`          |
//! | `NoCounterAvailable` | EAGAIN  | Yes   | backend index allocator            |
//! | `NoHardware`         | ENODEV  | No    | interrupt reservation              |
//! | `Busy`               | EBUSY   | Yes   | platform PMU / IRQ line contention |

use core::fmt;

/// Result type for PMU operations
pub type PmuResult<T> = Result<T, PmuError>;

// ============================================================================
// ERROR KIND
// ============================================================================

/// PMU error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PmuError {
    /// The event type or config has no hardware mapping
    NotSupported,
    /// Malformed event encoding (e.g. cache type/op/result out of range)
    InvalidArgument,
    /// Privilege-mode exclusion requested but the hardware cannot filter
    PermissionDenied,
    /// The event (or its group) cannot be scheduled onto the counters
    NoSpace,
    /// The backend allocator found no free counter
    NoCounterAvailable,
    /// No interrupt line could be reserved for overflow notification
    NoHardware,
    /// The PMU device or an interrupt line is owned by someone else
    Busy,
}

impl PmuError {
    /// Negative errno value as expected by the event framework ABI
    pub const fn errno(self) -> i32 {
        match self {
            Self::NotSupported => -2,       // ENOENT
            Self::InvalidArgument => -22,   // EINVAL
            Self::PermissionDenied => -1,   // EPERM
            Self::NoSpace => -28,           // ENOSPC
            Self::NoCounterAvailable => -11, // EAGAIN
            Self::NoHardware => -19,        // ENODEV
            Self::Busy => -16,              // EBUSY
        }
    }

    /// Whether a later attempt may succeed once other events vacate counters
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::NoSpace | Self::NoCounterAvailable | Self::Busy)
    }

    /// Short description
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotSupported => "event not supported by hardware",
            Self::InvalidArgument => "invalid event encoding",
            Self::PermissionDenied => "mode exclusion not supported",
            Self::NoSpace => "no space to schedule event",
            Self::NoCounterAvailable => "no hardware counter available",
            Self::NoHardware => "no PMU interrupt available",
            Self::Busy => "PMU resource busy",
        }
    }
}

impl fmt::Display for PmuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.errno())
    }
}
