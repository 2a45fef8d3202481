//! Recorded uop traces

use std::fmt;
use std::sync::Arc;

use bytecode_system::{CodeUnit, UopInstruction, VersionTag};

/// A closed loop of uops, as recorded and before optimization
///
/// The first uop is always `_CHECK_VALIDITY` and the last `_JUMP_TO_TOP`.
/// Every uop in between carries the instruction index tier-1 resumes at if
/// it side-exits.
#[derive(Clone)]
pub struct Trace {
    code: Arc<CodeUnit>,
    origin: usize,
    entry: usize,
    uops: Vec<UopInstruction>,
    dependencies: Vec<(Arc<VersionTag>, u32)>,
}

impl Trace {
    /// Assemble a trace
    pub fn new(
        code: Arc<CodeUnit>,
        origin: usize,
        entry: usize,
        uops: Vec<UopInstruction>,
        dependencies: Vec<(Arc<VersionTag>, u32)>,
    ) -> Self {
        Self {
            code,
            origin,
            entry,
            uops,
            dependencies,
        }
    }

    /// Code unit the loop lives in
    pub fn code(&self) -> &Arc<CodeUnit> {
        &self.code
    }

    /// Index of the backward jump closing the loop
    pub fn origin(&self) -> usize {
        self.origin
    }

    /// Loop head
    pub fn entry(&self) -> usize {
        self.entry
    }

    /// Recorded uops
    pub fn uops(&self) -> &[UopInstruction] {
        &self.uops
    }

    /// Number of uops
    pub fn len(&self) -> usize {
        self.uops.len()
    }

    /// Whether the trace holds no uops
    pub fn is_empty(&self) -> bool {
        self.uops.is_empty()
    }

    /// Version tags the trace was specialized against
    pub fn dependencies(&self) -> &[(Arc<VersionTag>, u32)] {
        &self.dependencies
    }

    /// Split into uops and dependencies
    pub fn into_parts(self) -> (Vec<UopInstruction>, Vec<(Arc<VersionTag>, u32)>) {
        (self.uops, self.dependencies)
    }
}

impl fmt::Debug for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trace")
            .field("code", self.code.qualname())
            .field("origin", &self.origin)
            .field("entry", &self.entry)
            .field("uops", &self.uops.len())
            .field("dependencies", &self.dependencies.len())
            .finish()
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "trace {}:{} -> {}",
            self.code.qualname(),
            self.origin,
            self.entry
        )?;
        for (position, uop) in self.uops.iter().enumerate() {
            writeln!(f, "{:4} {}", position, uop)?;
        }
        Ok(())
    }
}
