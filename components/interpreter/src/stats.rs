//! Counters describing what the adaptive tiers did

use std::fmt;

use trace_optimizer::OptimizerStats;

/// Quickening activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpecializationStats {
    /// Specialization attempts
    pub attempts: u64,
    /// Attempts that rewrote the instruction
    pub successes: u64,
    /// Attempts that found no specialized form
    pub failures: u64,
    /// Guard failures that reverted a specialized instruction
    pub deopts: u64,
    /// Sites switched off for good
    pub disabled: u64,
}

/// Tier-2 activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tier2Stats {
    /// Recordings started
    pub traces_started: u64,
    /// Recordings that closed their loop
    pub traces_completed: u64,
    /// Recordings abandoned
    pub traces_aborted: u64,
    /// Executors attached to a backward jump
    pub executors_installed: u64,
    /// Entries into an executor
    pub executor_entries: u64,
    /// Guard failures inside executors
    pub side_exits: u64,
    /// Stale executors found and detached
    pub invalidations: u64,
}

/// Everything the engine counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Tier-1 instructions dispatched
    pub instructions: u64,
    /// Quickening
    pub specialization: SpecializationStats,
    /// Tracing and executors
    pub tier2: Tier2Stats,
    /// Optimizer pass results
    pub optimizer: OptimizerStats,
}

impl fmt::Display for EngineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = &self.specialization;
        let t = &self.tier2;
        let o = &self.optimizer;
        writeln!(f, "instructions:        {}", self.instructions)?;
        writeln!(
            f,
            "specialization:      {} attempts, {} ok, {} failed, {} deopts, {} disabled",
            s.attempts, s.successes, s.failures, s.deopts, s.disabled
        )?;
        writeln!(
            f,
            "traces:              {} started, {} completed, {} aborted",
            t.traces_started, t.traces_completed, t.traces_aborted
        )?;
        writeln!(
            f,
            "executors:           {} installed, {} entries, {} side exits, {} invalidated",
            t.executors_installed, t.executor_entries, t.side_exits, t.invalidations
        )?;
        write!(
            f,
            "optimizer:           {} uops in, {} out, {} guards removed, {} folded, {} fused",
            o.uops_in, o.uops_out, o.guards_removed, o.constants_folded, o.fused
        )
    }
}
