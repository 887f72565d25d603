use crate::vfs::FsError;

/// Errors surfaced by the runtime facade.
///
/// Callers can tell a caller bug (`ConfigAfterBoot`, `Fs`) from an
/// infrastructure fault (`Fault`, `Crashed`): only the latter calls for
/// rebuilding the runtime from a fresh instance.
#[derive(Debug)]
pub enum RuntimeError {
    /// The fixed sentinel returned by every public operation once an
    /// internal execution fault has poisoned the instance.
    Crashed,
    /// The runtime was destroyed with `exit()`.
    Retired,
    /// One-time configuration was set after the first request had run.
    ConfigAfterBoot { what: &'static str },
    /// The engine finished but left no readable response state behind.
    Protocol(String),
    Fs(FsError),
    /// An unrecoverable internal execution fault. The instance is
    /// poisoned; subsequent calls return [`RuntimeError::Crashed`].
    Fault(anyhow::Error),
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeError::Crashed => {
                f.write_str("runtime has crashed; see the earlier error for details")
            }
            RuntimeError::Retired => f.write_str("runtime has been destroyed"),
            RuntimeError::ConfigAfterBoot { what } => {
                write!(f, "cannot set {what} after the first request has run")
            }
            RuntimeError::Protocol(msg) => write!(f, "runtime protocol error: {msg}"),
            RuntimeError::Fs(err) => err.fmt(f),
            RuntimeError::Fault(err) => write!(f, "runtime fault: {err:#}"),
        }
    }
}

impl std::error::Error for RuntimeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RuntimeError::Fs(err) => Some(err),
            RuntimeError::Fault(err) => err.source(),
            _ => None,
        }
    }
}

impl From<FsError> for RuntimeError {
    fn from(err: FsError) -> Self {
        RuntimeError::Fs(err)
    }
}
