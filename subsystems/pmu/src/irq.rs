//! # Interrupt Reservation
//!
//! Claims the PMU overflow interrupt lines when the first event is created
//! and frees them when the last one goes away. One line per CPU where the
//! platform provides it; a single line that cannot be steered is taken as a
//! uniprocessor system and used as-is.
//!
//! ```text
//!   reserve_pmu ──▶ for cpu in 0..min(resources, cpus):
//!                     irq = resource(cpu)            (skip if missing)
//!                     set_affinity(irq, cpu)         (skip on failure if >1 line)
//!                     request_irq(irq)  ──failure──▶ release everything, error
//!                     mark cpu active
//! ```

use alloc::boxed::Box;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::config::PmuConfig;
use crate::error::{PmuError, PmuResult};
use crate::platform::{PmuDevice, PmuPlatform};

/// Interrupt lines currently claimed, one flag per CPU
pub struct IrqReservation {
    active: Box<[AtomicBool]>,
}

impl IrqReservation {
    /// Empty reservation for `cpus` CPUs
    pub fn new(cpus: usize) -> Self {
        Self {
            active: (0..cpus).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    /// Whether `cpu` has its interrupt line claimed
    pub fn is_active(&self, cpu: usize) -> bool {
        self.active
            .get(cpu)
            .is_some_and(|active| active.load(Ordering::Acquire))
    }

    /// Number of claimed lines
    pub fn active_count(&self) -> usize {
        self.active
            .iter()
            .filter(|active| active.load(Ordering::Acquire))
            .count()
    }

    /// Claim the PMU device and its interrupt lines
    ///
    /// All-or-nothing: on failure nothing stays claimed.
    pub fn reserve(&self, platform: &dyn PmuPlatform, config: &PmuConfig) -> PmuResult<()> {
        if let Err(err) = platform.reserve_pmu(PmuDevice::Cpu) {
            log::warn!("PMU: unable to reserve pmu");
            return Err(err);
        }

        let irqs = platform
            .num_irq_resources()
            .min(platform.num_possible_cpus())
            .min(self.active.len());
        if irqs < 1 {
            log::error!("PMU: no irqs for PMUs defined");
            platform.release_pmu(PmuDevice::Cpu);
            return Err(PmuError::NoHardware);
        }

        for cpu in 0..irqs {
            let Some(irq) = platform.irq_resource(cpu) else {
                continue;
            };

            if platform.set_irq_affinity(irq, cpu).is_err() && irqs > 1 {
                log::warn!("PMU: unable to set irq affinity (irq={}, cpu={})", irq, cpu);
                continue;
            }

            if let Err(err) = platform.request_irq(irq, config.irq_flags, config.irq_name) {
                log::error!("PMU: unable to request IRQ{} for {} counters", irq, config.irq_name);
                self.release(platform);
                return Err(err);
            }

            self.active[cpu].store(true, Ordering::Release);
        }

        if self.active_count() == 0 {
            log::error!("PMU: no usable irqs for PMUs");
            platform.release_pmu(PmuDevice::Cpu);
            return Err(PmuError::NoHardware);
        }

        Ok(())
    }

    /// Free every claimed line and return the PMU device
    pub fn release(&self, platform: &dyn PmuPlatform) {
        for (cpu, active) in self.active.iter().enumerate() {
            if !active.swap(false, Ordering::AcqRel) {
                continue;
            }
            if let Some(irq) = platform.irq_resource(cpu) {
                platform.free_irq(irq);
            }
        }

        platform.release_pmu(PmuDevice::Cpu);
    }
}

impl fmt::Debug for IrqReservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IrqReservation")
            .field("cpus", &self.active.len())
            .field("active", &self.active_count())
            .finish()
    }
}
