//! Concurrency planning for the frame pipeline
//!
//! Derives frame producer look-ahead and cache bounds from CPU core count and configuration.

use crate::config::{Config, PartialOutputPolicy};
use std::time::Duration;

/// Pipeline limits derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct EncodingPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Frames requested ahead of the last written one
    pub max_threads: usize,
    /// Completed-but-unwritten frames held in memory
    pub cached_frames_limit: usize,
    /// Grace period before an aborted subprocess is killed
    pub abort_timeout: Duration,
    /// Partial output handling for aborted/failed encodes
    pub partial_output: PartialOutputPolicy,
}

impl EncodingPlan {
    /// Derive an encoding plan from configuration
    ///
    /// Uses the following rules:
    /// - Detects CPU cores via num_cpus
    /// - max_threads: explicit value if non-zero, otherwise one per core
    /// - cached_frames_limit: explicit value if non-zero (never below max_threads),
    ///   otherwise twice max_threads
    pub fn derive(cfg: &Config) -> Self {
        Self::derive_with_cores(cfg, num_cpus::get() as u32)
    }

    fn derive_with_cores(cfg: &Config, total_cores: u32) -> Self {
        let max_threads = if cfg.encoding.max_threads > 0 {
            cfg.encoding.max_threads as usize
        } else {
            total_cores.max(1) as usize
        };

        let cached_frames_limit = derive_cache_limit(cfg.encoding.cached_frames_limit, max_threads);

        Self {
            total_cores,
            max_threads,
            cached_frames_limit,
            abort_timeout: Duration::from_millis(cfg.encoding.abort_timeout_ms),
            partial_output: cfg.encoding.partial_output,
        }
    }

    /// Plan with explicit limits, bypassing core detection
    pub fn fixed(max_threads: usize, cached_frames_limit: usize) -> Self {
        let max_threads = max_threads.max(1);
        Self {
            total_cores: max_threads as u32,
            max_threads,
            cached_frames_limit: derive_cache_limit(cached_frames_limit as u32, max_threads),
            abort_timeout: Duration::from_millis(3000),
            partial_output: PartialOutputPolicy::Keep,
        }
    }
}

/// The cache must hold every in-flight frame, so it never shrinks below the look-ahead.
fn derive_cache_limit(configured: u32, max_threads: usize) -> usize {
    if configured > 0 {
        (configured as usize).max(max_threads)
    } else {
        max_threads * 2
    }
}

/// Public function to derive an encoding plan from configuration
pub fn derive_plan(cfg: &Config) -> EncodingPlan {
    EncodingPlan::derive(cfg)
}
