//! Reasons a recording is abandoned

use bytecode_system::Opcode;
use thiserror::Error;

/// Why the recorder gave up on a loop
///
/// An aborted recording leaves no trace behind; the caller backs off the
/// originating jump counter so the loop is not re-recorded immediately.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AbortReason {
    /// The trace grew past the configured length
    #[error("trace longer than {limit} uops")]
    TooLong {
        /// Configured maximum
        limit: usize,
    },

    /// The instruction has no uop translation
    #[error("no translation for {opcode} at {index}")]
    Untranslatable {
        /// Offending opcode (live form)
        opcode: Opcode,
        /// Instruction index
        index: usize,
    },

    /// More calls than the configured call budget
    #[error("more than {limit} calls recorded")]
    TooManyCalls {
        /// Configured maximum
        limit: usize,
    },

    /// Control reached an instruction outside the loop body
    #[error("left the loop at {index}")]
    LeftLoop {
        /// Instruction index reached
        index: usize,
    },

    /// A backward jump other than the loop's own
    #[error("inner loop at {index}")]
    InnerLoop {
        /// Index of the inner backward jump
        index: usize,
    },

    /// The iterator driving the loop ran out while recording
    #[error("loop iterator exhausted at {index}")]
    Exhausted {
        /// Index of the `FOR_ITER`
        index: usize,
    },

    /// The recording frame returned, yielded or was unwound
    #[error("recording frame exited")]
    FrameExited,

    /// An exception was raised inside the loop body
    #[error("exception raised while recording")]
    Exception,

    /// Monitoring was enabled while recording
    #[error("instrumentation changed while recording")]
    Instrumented,
}
