//! Process metrics source for the health monitor.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::System;

/// Load and memory pressure, both in percent (0-100).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ProcessSample {
  pub system_load: f64,
  pub memory_usage: f64,
}

/// Supplies CPU and memory ratios for the health rules.
pub trait ProcessProbe: Send + Sync {
  fn sample(&self) -> ProcessSample;

  /// Best-effort request to give memory back. Returns `true` if anything was
  /// attempted. The default does nothing.
  fn reclaim_memory(&self) -> bool {
    false
  }
}

/// Host-wide figures from `sysinfo`.
///
/// CPU usage is measured between consecutive samples, so the first sample
/// after construction reads low.
pub struct SysinfoProbe {
  system: Mutex<System>,
}

impl std::fmt::Debug for SysinfoProbe {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SysinfoProbe").finish_non_exhaustive()
  }
}

impl Default for SysinfoProbe {
  fn default() -> Self {
    Self::new()
  }
}

impl SysinfoProbe {
  pub fn new() -> Self {
    let mut system = System::new();
    system.refresh_cpu_usage();
    system.refresh_memory();
    Self {
      system: Mutex::new(system),
    }
  }
}

impl ProcessProbe for SysinfoProbe {
  fn sample(&self) -> ProcessSample {
    let mut system = self.system.lock();
    system.refresh_cpu_usage();
    system.refresh_memory();

    let total_memory = system.total_memory();
    let available = system.available_memory();
    let used = if available == 0 {
      system.used_memory().min(total_memory)
    } else {
      total_memory.saturating_sub(available)
    };
    let memory_usage = if total_memory > 0 {
      used as f64 / total_memory as f64 * 100.0
    } else {
      0.0
    };

    ProcessSample {
      system_load: f64::from(system.global_cpu_usage()).clamp(0.0, 100.0),
      memory_usage,
    }
  }
}

/// A probe returning values set by the embedder. Useful in tests and on
/// platforms where host figures are meaningless (containers with shared CPUs).
#[derive(Debug)]
pub struct FixedProbe {
  load_bits: AtomicU64,
  memory_bits: AtomicU64,
  reclaims: AtomicU64,
}

impl Default for FixedProbe {
  fn default() -> Self {
    Self::new(0.0, 0.0)
  }
}

impl FixedProbe {
  pub fn new(system_load: f64, memory_usage: f64) -> Self {
    Self {
      load_bits: AtomicU64::new(system_load.to_bits()),
      memory_bits: AtomicU64::new(memory_usage.to_bits()),
      reclaims: AtomicU64::new(0),
    }
  }

  pub fn set_system_load(&self, percent: f64) {
    self.load_bits.store(percent.to_bits(), Ordering::Relaxed);
  }

  pub fn set_memory_usage(&self, percent: f64) {
    self.memory_bits.store(percent.to_bits(), Ordering::Relaxed);
  }

  /// How many times `reclaim_memory` was called.
  pub fn reclaim_count(&self) -> u64 {
    self.reclaims.load(Ordering::Relaxed)
  }
}

impl ProcessProbe for FixedProbe {
  fn sample(&self) -> ProcessSample {
    ProcessSample {
      system_load: f64::from_bits(self.load_bits.load(Ordering::Relaxed)),
      memory_usage: f64::from_bits(self.memory_bits.load(Ordering::Relaxed)),
    }
  }

  fn reclaim_memory(&self) -> bool {
    self.reclaims.fetch_add(1, Ordering::Relaxed);
    true
  }
}
