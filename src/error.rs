use thiserror::Error;

/// Errors that end a capture run or a watcher cycle.
///
/// Cancellation is not an error. A deadline or interrupt ends a run normally
/// and shows up in the callers' outcome types.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad user input, detected before any kernel state is touched.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A required kernel symbol or program section could not be resolved.
    #[error("failed to resolve attach plan: {0}")]
    Resolution(String),

    /// The event stream failed for a reason other than cancellation.
    #[error("event stream read failed: {0}")]
    Stream(String),

    /// A kernel record did not match the expected layout.
    #[error("failed to decode {what}: need {expected} bytes, got {got}")]
    Decode {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    /// Loading, attaching or reading the BPF object failed.
    #[error("BPF data plane: {0}")]
    DataPlane(String),

    /// A triggered capture run failed or never finished.
    #[error("capture run failed: {0}")]
    Capture(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// The container metadata server could not be reached or answered garbage.
    #[error("metadata server: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
