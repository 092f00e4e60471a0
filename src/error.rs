// Runtime errors.
//
// The Display forms are stable: embedding hosts assert on them, so any
// change here is a breaking change. Budget and cancellation errors are
// not recoverable within a thread and must propagate unchanged.

use thiserror::Error;

use crate::caps::SafetyFlags;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    // A provider did not declare every capability the thread requires.
    // Carries the missing subset for hosts that want to report it.
    #[error("feature unavailable to the sandbox")]
    Unavailable { missing: SafetyFlags },

    // A capability set contained bits outside the defined range.
    #[error("internal error: invalid capability flags")]
    InvalidFlags,

    #[error("exceeded memory allocation limits")]
    MemoryBudget,

    #[error("too many steps")]
    StepBudget,

    // Sticky: once a thread reports this, it reports it for every
    // subsequent operation until the host uncancels.
    #[error("Starlark computation cancelled: {0}")]
    Cancelled(String),

    #[error("comparison exceeded maximum recursion depth")]
    ComparisonDepth,

    // Well-known sentinel: the operand does not implement the requested
    // operation. Dispatch sites catch this and refine the message.
    #[error("unsupported operation")]
    Unsupported,

    #[error("no .{attr} field or method on {type_name}")]
    NoAttr {
        type_name: &'static str,
        attr: String,
    },

    #[error("cannot {verb} frozen {what}")]
    Frozen {
        verb: &'static str,
        what: &'static str,
    },

    #[error("cannot {verb} {what} during iteration")]
    ActiveIteration {
        verb: &'static str,
        what: &'static str,
    },

    #[error("unhashable type: {0}")]
    Unhashable(&'static str),

    #[error("key {0} not in dict")]
    KeyNotFound(String),

    #[error("cannot call {name}: feature unavailable to the sandbox")]
    CannotCall { name: String, missing: SafetyFlags },

    #[error("cannot load {module}: {source}")]
    Load {
        module: String,
        #[source]
        source: Box<Error>,
    },

    // Value-domain errors with a one-off message (division by zero,
    // unknown capability name, out-of-range index, ...).
    #[error("{0}")]
    Operation(String),
}

impl Error {
    // Budget and cancellation errors abort the evaluation; everything
    // else is recoverable by script-level or host-level handling.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::MemoryBudget | Error::StepBudget | Error::Cancelled(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
