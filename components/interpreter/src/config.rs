//! Engine tunables
//!
//! Every threshold that shapes adaptive behavior lives here. None of them
//! affect observable results, only when the engine speculates.

use serde::{Deserialize, Serialize};
use trace_optimizer::RecorderLimits;

/// Configuration of one [`Vm`](crate::Vm)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Quicken adaptive instructions into specialized forms
    pub specialization: bool,
    /// Record hot loops and run tier-2 executors
    pub tier2: bool,
    /// Executions of an adaptive instruction before the first attempt
    pub adaptive_warmup: u16,
    /// Counter value after a deoptimization
    pub adaptive_cooldown: u16,
    /// Backoff after a failed attempt is `backoff_base << misses`
    pub backoff_base: u16,
    /// Misses after which a site is never specialized again
    pub max_specialization_misses: u16,
    /// Backward-jump executions before a loop is recorded
    pub jump_backward_threshold: u16,
    /// Longest trace accepted, in uops
    pub max_trace_length: usize,
    /// Most calls a trace may contain
    pub max_trace_calls: usize,
    /// Deepest frame nesting before `RecursionError`
    pub max_recursion_depth: usize,
    /// Native stack, in bytes, that nested run loops may use below the
    /// outermost one
    ///
    /// Frame-linked calls do not consume it; `__init__`, builtins calling
    /// back into guest code, generator resumption and tier-2 calls do.
    pub max_native_stack: usize,
    /// Instructions between eval-breaker checks
    pub tick_interval: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            specialization: true,
            tier2: true,
            adaptive_warmup: 8,
            adaptive_cooldown: 52,
            backoff_base: 2,
            max_specialization_misses: 6,
            jump_backward_threshold: 16,
            max_trace_length: 256,
            max_trace_calls: 4,
            max_recursion_depth: 1000,
            max_native_stack: 1 << 20,
            tick_interval: 1000,
        }
    }
}

impl EngineConfig {
    /// Generic tier-1 execution only
    pub fn no_specialization() -> Self {
        Self {
            specialization: false,
            tier2: false,
            ..Self::default()
        }
    }

    /// Every threshold at its minimum
    pub fn eager() -> Self {
        Self {
            adaptive_warmup: 1,
            adaptive_cooldown: 1,
            backoff_base: 1,
            jump_backward_threshold: 1,
            ..Self::default()
        }
    }

    /// Set [`specialization`](Self::specialization)
    pub fn with_specialization(mut self, enabled: bool) -> Self {
        self.specialization = enabled;
        self
    }

    /// Set [`tier2`](Self::tier2)
    pub fn with_tier2(mut self, enabled: bool) -> Self {
        self.tier2 = enabled;
        self
    }

    /// Set [`adaptive_warmup`](Self::adaptive_warmup)
    pub fn with_warmup(mut self, warmup: u16) -> Self {
        self.adaptive_warmup = warmup.max(1);
        self
    }

    /// Set [`adaptive_cooldown`](Self::adaptive_cooldown)
    pub fn with_cooldown(mut self, cooldown: u16) -> Self {
        self.adaptive_cooldown = cooldown.max(1);
        self
    }

    /// Set [`max_specialization_misses`](Self::max_specialization_misses)
    pub fn with_max_misses(mut self, misses: u16) -> Self {
        self.max_specialization_misses = misses;
        self
    }

    /// Set [`jump_backward_threshold`](Self::jump_backward_threshold)
    pub fn with_jump_threshold(mut self, threshold: u16) -> Self {
        self.jump_backward_threshold = threshold.max(1);
        self
    }

    /// Set [`max_trace_length`](Self::max_trace_length)
    pub fn with_max_trace_length(mut self, length: usize) -> Self {
        self.max_trace_length = length;
        self
    }

    /// Set [`max_recursion_depth`](Self::max_recursion_depth)
    pub fn with_max_recursion_depth(mut self, depth: usize) -> Self {
        self.max_recursion_depth = depth;
        self
    }

    /// Set [`max_native_stack`](Self::max_native_stack)
    pub fn with_max_native_stack(mut self, bytes: usize) -> Self {
        self.max_native_stack = bytes;
        self
    }

    /// Set [`tick_interval`](Self::tick_interval)
    pub fn with_tick_interval(mut self, interval: u32) -> Self {
        self.tick_interval = interval.max(1);
        self
    }

    /// Counter value after the `misses`-th miss
    pub fn backoff(&self, misses: u16) -> u16 {
        let shifted = (self.backoff_base.max(1) as u32).checked_shl(misses as u32);
        shifted.map_or(u16::MAX, |value| value.min(u16::MAX as u32) as u16)
    }

    /// Bounds handed to the trace recorder
    pub fn recorder_limits(&self) -> RecorderLimits {
        RecorderLimits {
            max_trace_length: self.max_trace_length,
            max_trace_calls: self.max_trace_calls,
        }
    }
}
