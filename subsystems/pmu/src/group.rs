//! # Group Validation
//!
//! A group of events is scheduled all-or-nothing, so before a new member is
//! accepted the whole group is placed on a scratch counter table. The real
//! per-CPU tables are never touched.

use crate::cpu_events::CounterSlots;
use crate::error::{PmuError, PmuResult};
use crate::event::{EventState, PerfEvent};
use crate::pmu::CpuPmu;

/// Check that `event` together with its group fits on `pmu`'s counters
pub fn validate_group(pmu: &CpuPmu, event: &PerfEvent) -> PmuResult<()> {
    let mut fake = CounterSlots::new();

    if let Some(leader) = event.group_leader() {
        validate_event(pmu, &mut fake, leader)?;

        for sibling in leader.siblings().iter() {
            validate_event(pmu, &mut fake, sibling)?;
        }
    }

    validate_event(pmu, &mut fake, event)
}

fn validate_event(pmu: &CpuPmu, fake: &mut CounterSlots, member: &PerfEvent) -> PmuResult<()> {
    // Members of other PMUs and disabled members never take one of our counters
    if member.source() != Some(pmu.source()) || member.state() <= EventState::Off {
        return Ok(());
    }

    let hw = member.hw().fake_copy();
    pmu.backend()
        .get_event_idx(fake, &hw)
        .map(|_| ())
        .map_err(|_| PmuError::NoSpace)
}
