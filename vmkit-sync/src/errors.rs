use thiserror::Error;

/// Failures reported to the caller of a monitor operation.
///
/// Unbalanced `exit` is not an error here: it is logged and ignored.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SyncError {
    #[error("IllegalMonitorStateException: {0}")]
    IllegalMonitorState(&'static str),

    #[error("InterruptedException")]
    Interrupted,

    #[error("IllegalArgumentException: {0}")]
    IllegalArgument(&'static str),
}

pub type SyncResult<T> = Result<T, SyncError>;
