//! Memory estimates for sizing marker locality windows

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use sysinfo::System;

/// Lower bound on a locality window
pub const MIN_LOCALITY: usize = 1_000_000;

/// Available memory below this fraction of the total counts as pressure
const PRESSURE_FRACTION: f64 = 0.10;

/// How often the system probe re-reads memory counters
const PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Source of free-memory estimates and pressure signals
pub enum MemoryProbe {
    /// Fixed budget in bytes. Never reports pressure.
    Fixed(u64),
    /// Live system counters
    System(Mutex<SystemMemory>),
}

pub struct SystemMemory {
    system: System,
    last_refresh: Instant,
    under_pressure: bool,
}

impl SystemMemory {
    fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        let under_pressure = Self::pressure_of(&system);
        Self {
            system,
            last_refresh: Instant::now(),
            under_pressure,
        }
    }

    fn pressure_of(system: &System) -> bool {
        let total = system.total_memory();
        total > 0 && (system.available_memory() as f64) < total as f64 * PRESSURE_FRACTION
    }

    fn refresh_if_stale(&mut self) {
        if self.last_refresh.elapsed() >= PROBE_INTERVAL {
            self.system.refresh_memory();
            self.under_pressure = Self::pressure_of(&self.system);
            self.last_refresh = Instant::now();
        }
    }
}

impl MemoryProbe {
    /// A fixed budget when configured, otherwise the live system counters
    pub fn from_budget_mb(budget_mb: Option<u64>) -> Self {
        match budget_mb {
            Some(mb) => MemoryProbe::Fixed(mb.saturating_mul(1024 * 1024)),
            None => MemoryProbe::System(Mutex::new(SystemMemory::new())),
        }
    }

    pub fn available_bytes(&self) -> u64 {
        match self {
            MemoryProbe::Fixed(bytes) => *bytes,
            MemoryProbe::System(memory) => {
                let mut memory = memory.lock();
                memory.refresh_if_stale();
                memory.system.available_memory()
            }
        }
    }

    /// True while available memory is scarce. Re-probes at most every 100 ms.
    pub fn under_pressure(&self) -> bool {
        match self {
            MemoryProbe::Fixed(_) => false,
            MemoryProbe::System(memory) => {
                let mut memory = memory.lock();
                memory.refresh_if_stale();
                memory.under_pressure
            }
        }
    }
}

impl std::fmt::Debug for MemoryProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryProbe::Fixed(bytes) => f.debug_tuple("Fixed").field(bytes).finish(),
            MemoryProbe::System(_) => f.write_str("System"),
        }
    }
}

/// Ids per thread window. Sized so the windows of all threads together
/// cover roughly the part of the outbound index that fits in `free` bytes.
pub fn locality_size(object_count: usize, footprint: u64, free: u64, threads: usize) -> usize {
    if object_count == 0 {
        return 0;
    }
    let n = object_count as f64;
    let outbound_bytes = if footprint == 0 {
        n * 30.0
    } else {
        footprint as f64
    };
    let resident = n.min(n * free as f64 / outbound_bytes);
    let threads = threads.max(1) as f64;
    let per_thread = (1.0 - ((n - resident) / n).powf(1.0 / threads)) * n;
    (per_thread.max(MIN_LOCALITY as f64) as usize).min(object_count)
}
