//! Concurrency planning module for compressd
//!
//! Derives how many encodes may run at once from the CPU core count and the
//! configured hardware path.

use crate::config::{Config, HwAccel};

/// Upper bound for derived CPU encode slots.
const MAX_DERIVED_CPU_JOBS: u32 = 4;

/// Encode slots when a GPU does the work.
const HARDWARE_JOBS: u32 = 2;

/// Concurrency plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Maximum number of concurrent encoding jobs
    pub max_concurrent_jobs: u32,
}

impl ConcurrencyPlan {
    /// Derive a concurrency plan from configuration
    ///
    /// - An explicit non-zero `max_concurrent_jobs` is used unchanged
    /// - Hardware encodes get 2 slots
    /// - Software encodes get one slot per 8 cores, clamped to [1, 4]
    pub fn derive(cfg: &Config) -> Self {
        Self::derive_with_cores(cfg, num_cpus::get() as u32)
    }

    pub fn derive_with_cores(cfg: &Config, total_cores: u32) -> Self {
        let max_concurrent_jobs = if cfg.scheduler.max_concurrent_jobs > 0 {
            cfg.scheduler.max_concurrent_jobs
        } else {
            derive_max_jobs(total_cores, cfg.encode.hw_accel)
        };

        Self {
            total_cores,
            max_concurrent_jobs,
        }
    }
}

fn derive_max_jobs(cores: u32, hw_accel: HwAccel) -> u32 {
    match hw_accel {
        HwAccel::None => (cores / 8).clamp(1, MAX_DERIVED_CPU_JOBS),
        HwAccel::Qsv | HwAccel::Nvenc => HARDWARE_JOBS,
    }
}

/// Public function to derive a concurrency plan from configuration
pub fn derive_plan(cfg: &Config) -> ConcurrencyPlan {
    ConcurrencyPlan::derive(cfg)
}
