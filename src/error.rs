use thiserror::Error;

/// The error type for all operations of this crate.
///
/// Every failure mode of the instrumentation engine is kind-tagged so the
/// driver can decide between "operator error" (missing symbols, bad filter
/// input), "target error" (malformed module or sidecar), and "environment
/// error" (I/O). Metadata-level failures from the underlying assembly
/// framework are wrapped rather than flattened, so their context survives.
#[derive(Error, Debug)]
pub enum Error {
    /// A precondition of the requested operation was not met.
    ///
    /// The typical case is calling [`crate::Instrumenter::instrument`] on a
    /// module without a debug-symbol sidecar; callers are expected to gate
    /// on [`crate::Instrumenter::can_instrument`] first.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// The symbol sidecar exists but could not be understood.
    #[error("bad symbols: {message}")]
    BadSymbols {
        /// What was wrong with the sidecar data.
        message: String,
    },

    /// The runtime tracker template is missing a member the injector
    /// depends on (a pinned field or a method referenced from another
    /// template body). This is a build-time defect of the engine itself,
    /// never of the target module.
    #[error("tracker template member not found: {0}")]
    TemplateNotFound(&'static str),

    /// An on-disk hit file does not match the in-memory counter array on
    /// the accumulation path. Nothing has been written.
    #[error("hit file length mismatch: file has {actual} counters, expected {expected}")]
    HitFileMismatch {
        /// Counter count the caller carries in memory.
        expected: usize,
        /// Counter count found in the file's length prefix.
        actual: usize,
    },

    /// Filesystem I/O failure.
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// Failure inside the metadata framework (parsing, mutation, or
    /// write-back of the module).
    #[error("{0}")]
    Metadata(#[from] dotscope::Error),

    /// An include or exclude filter is not a valid glob pattern.
    #[error("invalid filter pattern '{pattern}': {message}")]
    InvalidFilter {
        /// The offending pattern as supplied by the caller.
        pattern: String,
        /// Why the pattern failed to compile.
        message: String,
    },
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

macro_rules! bad_symbols {
    ($msg:expr) => {
        crate::Error::BadSymbols {
            message: $msg.to_string(),
        }
    };
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::BadSymbols {
            message: format!($fmt, $($arg)*),
        }
    };
}

pub(crate) use bad_symbols;
