use std::fmt;

use crate::vm::VmError;

/// Failure modes of arena and pool allocation paths.
#[derive(Debug)]
pub enum AllocError {
    /// The requested word count cannot be served by any chunk (zero, or
    /// larger than the largest chunk). Caller error.
    InvalidWordSize(usize),
    /// The commit budget denied the expansion. Recoverable: other tenants
    /// releasing committed memory can make a retry succeed.
    CommitLimitReached { requested_words: usize },
    /// The pool's reserved address range is exhausted. Not recoverable at
    /// this layer (reservations never grow).
    OutOfReservedSpace,
    /// An underlying virtual memory operation failed.
    Vm(VmError),
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::InvalidWordSize(words) => {
                write!(f, "invalid allocation size: {words} words")
            }
            AllocError::CommitLimitReached { requested_words } => {
                write!(f, "commit limit reached ({requested_words} words denied)")
            }
            AllocError::OutOfReservedSpace => write!(f, "reserved address space exhausted"),
            AllocError::Vm(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for AllocError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AllocError::Vm(e) => Some(e),
            _ => None,
        }
    }
}

impl From<VmError> for AllocError {
    fn from(e: VmError) -> Self {
        AllocError::Vm(e)
    }
}

impl AllocError {
    /// True for conditions that can clear up without intervention at this
    /// layer (another tenant frees committed memory).
    pub fn is_recoverable(&self) -> bool {
        matches!(self, AllocError::CommitLimitReached { .. })
    }
}
