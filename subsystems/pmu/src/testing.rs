//! Simulated platform and register file for unit tests.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use spin::Mutex;

use crate::armv7::pmnc;
use crate::armv7::regs::Armv7Registers;
use crate::error::{PmuError, PmuResult};
use crate::platform::{IrqFlags, IrqState, PlatformIrqHook, PmuDevice, PmuPlatform};

// ============================================================================
// SIMULATED PLATFORM
// ============================================================================

/// Platform with configurable interrupt resources and failure injection
pub struct SimPlatform {
    cpus: usize,
    current_cpu: AtomicUsize,
    irqs: Vec<Option<u32>>,
    affinity_fails: bool,
    failing_irq: Option<u32>,
    pmu_busy: bool,
    hook: Option<PlatformIrqHook>,
    pmu_reserved: AtomicBool,
    requested: Mutex<Vec<u32>>,
    irq_mask_depth: AtomicUsize,
    reserve_calls: AtomicUsize,
    release_calls: AtomicUsize,
    request_calls: AtomicUsize,
    free_calls: AtomicUsize,
}

impl SimPlatform {
    /// `cpus` CPUs with one interrupt line each (100, 101, ...)
    pub fn new(cpus: usize) -> Self {
        Self {
            cpus,
            current_cpu: AtomicUsize::new(0),
            irqs: (0..cpus as u32).map(|cpu| Some(100 + cpu)).collect(),
            affinity_fails: false,
            failing_irq: None,
            pmu_busy: false,
            hook: None,
            pmu_reserved: AtomicBool::new(false),
            requested: Mutex::new(Vec::new()),
            irq_mask_depth: AtomicUsize::new(0),
            reserve_calls: AtomicUsize::new(0),
            release_calls: AtomicUsize::new(0),
            request_calls: AtomicUsize::new(0),
            free_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_irqs(mut self, irqs: Vec<Option<u32>>) -> Self {
        self.irqs = irqs;
        self
    }

    pub fn with_affinity_failure(mut self) -> Self {
        self.affinity_fails = true;
        self
    }

    pub fn with_request_failure(mut self, irq: u32) -> Self {
        self.failing_irq = Some(irq);
        self
    }

    pub fn with_pmu_busy(mut self) -> Self {
        self.pmu_busy = true;
        self
    }

    pub fn with_irq_hook(mut self, hook: PlatformIrqHook) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn set_current_cpu(&self, cpu: usize) {
        self.current_cpu.store(cpu, Ordering::SeqCst);
    }

    pub fn requested_irqs(&self) -> Vec<u32> {
        self.requested.lock().clone()
    }

    pub fn pmu_reserved(&self) -> bool {
        self.pmu_reserved.load(Ordering::SeqCst)
    }

    pub fn irq_mask_depth(&self) -> usize {
        self.irq_mask_depth.load(Ordering::SeqCst)
    }

    pub fn reserve_calls(&self) -> usize {
        self.reserve_calls.load(Ordering::SeqCst)
    }

    pub fn release_calls(&self) -> usize {
        self.release_calls.load(Ordering::SeqCst)
    }

    pub fn request_calls(&self) -> usize {
        self.request_calls.load(Ordering::SeqCst)
    }

    pub fn free_calls(&self) -> usize {
        self.free_calls.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for SimPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimPlatform")
            .field("cpus", &self.cpus)
            .field("irqs", &self.irqs)
            .field("pmu_reserved", &self.pmu_reserved())
            .finish()
    }
}

impl PmuPlatform for SimPlatform {
    fn num_possible_cpus(&self) -> usize {
        self.cpus
    }

    fn current_cpu(&self) -> usize {
        self.current_cpu.load(Ordering::SeqCst)
    }

    fn on_each_cpu(&self, f: &(dyn Fn(usize) + Sync)) {
        let saved = self.current_cpu();
        for cpu in 0..self.cpus {
            self.set_current_cpu(cpu);
            f(cpu);
        }
        self.set_current_cpu(saved);
    }

    fn local_irq_save(&self) -> IrqState {
        IrqState(self.irq_mask_depth.fetch_add(1, Ordering::SeqCst))
    }

    fn local_irq_restore(&self, state: IrqState) {
        self.irq_mask_depth.store(state.0, Ordering::SeqCst);
    }

    fn reserve_pmu(&self, _device: PmuDevice) -> PmuResult<()> {
        self.reserve_calls.fetch_add(1, Ordering::SeqCst);
        std::thread::yield_now();
        if self.pmu_busy || self.pmu_reserved.swap(true, Ordering::SeqCst) {
            return Err(PmuError::Busy);
        }
        Ok(())
    }

    fn release_pmu(&self, _device: PmuDevice) {
        self.release_calls.fetch_add(1, Ordering::SeqCst);
        std::thread::yield_now();
        self.pmu_reserved.store(false, Ordering::SeqCst);
    }

    fn num_irq_resources(&self) -> usize {
        self.irqs.len()
    }

    fn irq_resource(&self, index: usize) -> Option<u32> {
        self.irqs.get(index).copied().flatten()
    }

    fn irq_hook(&self) -> Option<PlatformIrqHook> {
        self.hook
    }

    fn set_irq_affinity(&self, _irq: u32, _cpu: usize) -> PmuResult<()> {
        if self.affinity_fails {
            return Err(PmuError::InvalidArgument);
        }
        Ok(())
    }

    fn request_irq(&self, irq: u32, _flags: IrqFlags, _name: &'static str) -> PmuResult<()> {
        self.request_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_irq == Some(irq) {
            return Err(PmuError::Busy);
        }
        self.requested.lock().push(irq);
        Ok(())
    }

    fn free_irq(&self, irq: u32) {
        self.free_calls.fetch_add(1, Ordering::SeqCst);
        self.requested.lock().retain(|&line| line != irq);
    }
}

// ============================================================================
// SIMULATED REGISTER FILE
// ============================================================================

const CCNT_BIT: u32 = 31;

#[derive(Debug)]
struct RegState {
    pmnc: u32,
    cnten: u32,
    inten: u32,
    flags: u32,
    select: u32,
    ccnt: u32,
    counters: [u32; 32],
    evtypes: [u32; 32],
}

/// ARMv7 PMU register file held in memory; clones share the same registers
#[derive(Debug, Clone)]
pub struct SimRegisters {
    state: Arc<Mutex<RegState>>,
}

impl SimRegisters {
    /// Register file advertising `counters` event counters
    pub fn new(counters: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(RegState {
                pmnc: (counters & pmnc::N_MASK) << pmnc::N_SHIFT,
                cnten: 0,
                inten: 0,
                flags: 0,
                select: 0,
                ccnt: 0,
                counters: [0; 32],
                evtypes: [0; 32],
            })),
        }
    }

    pub fn cnten(&self) -> u32 {
        self.state.lock().cnten
    }

    pub fn inten(&self) -> u32 {
        self.state.lock().inten
    }

    pub fn event_type(&self, counter: u32) -> u32 {
        self.state.lock().evtypes[counter as usize]
    }

    pub fn is_counting(&self) -> bool {
        self.state.lock().pmnc & pmnc::E != 0
    }

    pub fn raise_overflow(&self, mask: u32) {
        self.state.lock().flags |= mask;
    }

    /// Advance the counter behind register bit `bit` by `ticks`, latching overflow
    pub fn tick(&self, bit: u32, ticks: u32) {
        let mut state = self.state.lock();
        let slot = if bit == CCNT_BIT {
            &mut state.ccnt
        } else {
            &mut state.counters[bit as usize]
        };
        let (value, wrapped) = slot.overflowing_add(ticks);
        *slot = value;
        if wrapped {
            state.flags |= 1 << bit;
        }
    }
}

impl Armv7Registers for SimRegisters {
    fn read_pmnc(&self) -> u32 {
        self.state.lock().pmnc
    }

    fn write_pmnc(&self, value: u32) {
        let mut state = self.state.lock();
        if value & pmnc::P != 0 {
            state.counters = [0; 32];
        }
        if value & pmnc::C != 0 {
            state.ccnt = 0;
        }
        let sticky = pmnc::E | pmnc::D | pmnc::X | pmnc::DP;
        state.pmnc = (state.pmnc & !pmnc::MASK) | (value & sticky);
    }

    fn write_cntens(&self, mask: u32) {
        self.state.lock().cnten |= mask;
    }

    fn write_cntenc(&self, mask: u32) {
        self.state.lock().cnten &= !mask;
    }

    fn write_intens(&self, mask: u32) {
        self.state.lock().inten |= mask;
    }

    fn write_intenc(&self, mask: u32) {
        self.state.lock().inten &= !mask;
    }

    fn read_flags(&self) -> u32 {
        self.state.lock().flags
    }

    fn write_flags(&self, mask: u32) {
        self.state.lock().flags &= !mask;
    }

    fn write_select(&self, counter: u32) {
        self.state.lock().select = counter;
    }

    fn read_ccnt(&self) -> u32 {
        self.state.lock().ccnt
    }

    fn write_ccnt(&self, value: u32) {
        self.state.lock().ccnt = value;
    }

    fn write_xevtyper(&self, value: u32) {
        let mut state = self.state.lock();
        let select = state.select as usize;
        state.evtypes[select] = value;
    }

    fn read_xevcntr(&self) -> u32 {
        let state = self.state.lock();
        state.counters[state.select as usize]
    }

    fn write_xevcntr(&self, value: u32) {
        let mut state = self.state.lock();
        let select = state.select as usize;
        state.counters[select] = value;
    }
}
