//! Engine-level errors returned to embedders

use std::rc::Rc;

use core_types::{Exception, FatalError, Unwind};
use thiserror::Error;

/// Failure of a monitoring registration call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MonitoringError {
    /// The tool id is held by a different registrant
    #[error("ConflictError: tool {tool} is already in use by '{holder}'")]
    Conflict {
        /// Requested tool id
        tool: u8,
        /// Current holder
        holder: String,
    },
    /// Tool id outside `0..=7`
    #[error("invalid tool id {0}")]
    InvalidTool(u8),
    /// Operation on a tool id nobody claimed
    #[error("tool {0} is not in use")]
    ToolNotInUse(u8),
}

/// Result of a top-level call into the engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// A guest exception escaped the outermost frame
    #[error("{}", .0.render())]
    Uncaught(Rc<Exception>),
    /// Engine-fatal failure of this call
    #[error(transparent)]
    Fatal(#[from] FatalError),
    /// Monitoring registration failed
    #[error(transparent)]
    Monitoring(#[from] MonitoringError),
}

impl EngineError {
    /// The uncaught guest exception, if that is what this is
    pub fn exception(&self) -> Option<&Rc<Exception>> {
        match self {
            EngineError::Uncaught(exc) => Some(exc),
            _ => None,
        }
    }
}

impl From<Unwind> for EngineError {
    fn from(unwind: Unwind) -> Self {
        match unwind {
            Unwind::Exception(exc) => EngineError::Uncaught(exc),
            Unwind::Fatal(err) => EngineError::Fatal(err),
        }
    }
}
