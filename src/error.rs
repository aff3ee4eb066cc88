use std::io;

/// Minimum number of in-memory arenas when a cap is configured.
///
/// Three arenas can simultaneously hold the queue head, the tail, and one
/// buffer arena for a record crossing an arena boundary.
pub const MIN_IN_MEMORY_ARENAS: usize = 3;

/// A specialized error type for queue operations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Dequeue or peek was performed on an empty queue.
    #[error("queue is empty")]
    EmptyQueue,
    /// The configured arena size is smaller than the OS page size.
    #[error("arena size {requested} is smaller than the OS page size {page_size}")]
    TooSmallArenaSize { requested: u64, page_size: u64 },
    /// The in-memory arena cap is positive but below the minimum.
    #[error("in-memory arena cap {0} is below the minimum of {MIN_IN_MEMORY_ARENAS}")]
    TooFewInMemoryArenas(usize),
    /// A flush threshold was configured with a non-positive value.
    #[error("{0} must be greater than zero")]
    MustBeGreaterThanZero(&'static str),
    /// The persisted arena size differs from the configured one.
    #[error("persisted arena size {persisted} does not match configured arena size {configured}")]
    MismatchedArenaSize { persisted: u64, configured: u64 },
    /// The metadata file was written by an incompatible format version.
    #[error("incompatible metadata format version {found}, expected {expected}")]
    IncompatibleVersion { found: u64, expected: u64 },
    /// A consumer from a different queue instance was passed in.
    #[error("consumer belongs to a different queue")]
    DifferentQueues,
    /// A string read found a payload that is not valid UTF-8.
    #[error("payload is not valid UTF-8")]
    MalformedUtf8(#[source] std::string::FromUtf8Error),
}

/// A Result type alias for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;
