//! Installed tier-2 traces

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::code::Constant;
use crate::uop::UopInstruction;
use crate::version::VersionTag;

/// An optimized uop trace attached to a hot backward jump
///
/// Validity is checked lazily: the executor is valid while its flag is set
/// and every version tag it depends on still holds the value observed at
/// recording time. Nothing scans executors when a tag is bumped.
#[derive(Debug)]
pub struct Executor {
    uops: Vec<UopInstruction>,
    consts: Vec<Constant>,
    dependencies: Vec<(Arc<VersionTag>, u32)>,
    valid: AtomicBool,
    origin: u32,
    entry: u32,
    executions: AtomicU64,
    side_exits: AtomicU64,
}

impl Executor {
    /// Create an executor
    ///
    /// `origin` is the index of the backward jump the executor is attached
    /// to, `entry` the loop head the trace starts at.
    pub fn new(
        uops: Vec<UopInstruction>,
        consts: Vec<Constant>,
        dependencies: Vec<(Arc<VersionTag>, u32)>,
        origin: u32,
        entry: u32,
    ) -> Self {
        Self {
            uops,
            consts,
            dependencies,
            valid: AtomicBool::new(true),
            origin,
            entry,
            executions: AtomicU64::new(0),
            side_exits: AtomicU64::new(0),
        }
    }

    /// The uop sequence
    pub fn uops(&self) -> &[UopInstruction] {
        &self.uops
    }

    /// Constants produced by folding, indexed by `_LOAD_CONST_INLINE`
    pub fn consts(&self) -> &[Constant] {
        &self.consts
    }

    /// Guarded version tags and the versions they must still hold
    pub fn dependencies(&self) -> &[(Arc<VersionTag>, u32)] {
        &self.dependencies
    }

    /// Index of the originating backward jump
    pub fn origin(&self) -> u32 {
        self.origin
    }

    /// Loop head the trace starts at
    pub fn entry(&self) -> u32 {
        self.entry
    }

    /// Lazily re-check validity
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
            && self
                .dependencies
                .iter()
                .all(|(tag, version)| tag.matches(*version))
    }

    /// Mark the executor dead; it is never entered again
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    /// Count one entry
    pub fn record_entry(&self) {
        self.executions.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one side exit
    pub fn record_side_exit(&self) {
        self.side_exits.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of times the executor was entered
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    /// Number of side exits taken
    pub fn side_exits(&self) -> u64 {
        self.side_exits.load(Ordering::Relaxed)
    }
}
