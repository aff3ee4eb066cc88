use std::fmt::{self, Display};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::{Clock, SystemClock};
use crate::error::{QueueError, QueueResult, MIN_IN_MEMORY_ARENAS};
use crate::fs::os_page_size;

/// Default arena size (128 MiB).
const DEFAULT_ARENA_SIZE: u64 = 128 * 1024 * 1024;

/// Default number of arenas allowed in memory at any time.
const DEFAULT_MAX_IN_MEMORY_ARENAS: usize = MIN_IN_MEMORY_ARENAS;

/// Default number of mutations after which a flush is scheduled.
const DEFAULT_FLUSH_MUT_OPS: u64 = 1_000;

/// Default interval after which a flush is scheduled.
const DEFAULT_FLUSH_PERIOD: Duration = Duration::from_secs(60);

/// Logical identifier of one arena file.
///
/// Arena ids are zero-based, dense, and monotonically increasing as the tail
/// advances. An id is persisted in the arena's file name (`arena_<aid>.dat`)
/// and in the metadata file.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ArenaId(pub u64);

impl ArenaId {
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next arena id in sequence.
    #[inline]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl From<u64> for ArenaId {
    #[inline]
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Display for ArenaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// A byte position in the queue's arena stream.
///
/// Positions order lexicographically by `(aid, offset)`, which matches the
/// order in which bytes are written. A normalized position always satisfies
/// `offset < arena_size`; the canonical end-of-arena form `(aid, arena_size)`
/// is folded to `(aid + 1, 0)` before any read or write.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Position {
    pub aid: ArenaId,
    pub offset: u64,
}

impl Position {
    #[inline]
    pub const fn new(aid: ArenaId, offset: u64) -> Self {
        Self { aid, offset }
    }

    /// Folds `(aid, arena_size)` into `(aid + 1, 0)`.
    #[inline]
    pub(crate) fn normalize(mut self, arena_size: u64) -> Self {
        debug_assert!(self.offset <= arena_size, "position past end of arena");
        if self.offset == arena_size {
            self.aid = self.aid.next();
            self.offset = 0;
        }
        self
    }
}

impl Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.aid, self.offset)
    }
}

/// Configuration surface for an [`MmapQueue`](crate::MmapQueue).
///
/// Fields are public so a configuration can be assembled directly; values set
/// that way are validated when the queue is opened. The [`QueueOptions`]
/// builder validates each option as it is applied instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Fixed size of every arena file in bytes. Immutable for the lifetime
    /// of a queue directory and at least the OS page size.
    pub arena_size: u64,

    /// Maximum number of arenas kept mapped at any time. Zero disables
    /// eviction entirely; a nonzero cap must be at least three (head, tail,
    /// and a buffer arena for a record crossing an arena boundary).
    pub max_in_memory_arenas: usize,

    /// Number of successful mutations (enqueue/dequeue) after which a flush
    /// is scheduled. Zero disables the mutation trigger.
    pub flush_mut_ops: u64,

    /// Interval after which a flush is scheduled. [`Duration::ZERO`]
    /// disables the timer trigger.
    pub flush_period: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            arena_size: DEFAULT_ARENA_SIZE,
            max_in_memory_arenas: DEFAULT_MAX_IN_MEMORY_ARENAS,
            flush_mut_ops: DEFAULT_FLUSH_MUT_OPS,
            flush_period: DEFAULT_FLUSH_PERIOD,
        }
    }
}

impl QueueConfig {
    /// Checks the invariants the builder would have enforced per option.
    pub(crate) fn validate(&self) -> QueueResult<()> {
        let page_size = os_page_size();
        if self.arena_size < page_size {
            return Err(QueueError::TooSmallArenaSize {
                requested: self.arena_size,
                page_size,
            });
        }
        if self.max_in_memory_arenas != 0 && self.max_in_memory_arenas < MIN_IN_MEMORY_ARENAS {
            return Err(QueueError::TooFewInMemoryArenas(self.max_in_memory_arenas));
        }
        Ok(())
    }

    /// True when either flush trigger is enabled.
    pub(crate) fn flushing_enabled(&self) -> bool {
        self.flush_mut_ops > 0 || !self.flush_period.is_zero()
    }
}

/// Builder for opening an [`MmapQueue`](crate::MmapQueue).
///
/// Each setter validates its option and returns the builder, so a bad value
/// surfaces at the call site:
///
/// ```no_run
/// use mmapq::QueueOptions;
///
/// let queue = QueueOptions::new()
///     .arena_size(4 * 1024 * 1024)?
///     .max_in_memory_arenas(4)?
///     .open("/var/lib/myapp/queue")?;
/// # Ok::<(), mmapq::QueueError>(())
/// ```
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub(crate) config: QueueConfig,
    pub(crate) clock: Arc<dyn Clock>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            config: QueueConfig::default(),
            clock: Arc::new(SystemClock),
        }
    }
}

impl QueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from an already assembled configuration.
    pub fn from_config(config: QueueConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
        }
    }

    /// Sets the fixed arena size in bytes.
    ///
    /// The size must be at least the OS page size. It is persisted on first
    /// open and must match on every subsequent open of the same directory.
    pub fn arena_size(mut self, arena_size: u64) -> QueueResult<Self> {
        let page_size = os_page_size();
        if arena_size < page_size {
            return Err(QueueError::TooSmallArenaSize {
                requested: arena_size,
                page_size,
            });
        }
        self.config.arena_size = arena_size;
        Ok(self)
    }

    /// Sets the maximum number of arenas kept mapped at any time.
    ///
    /// Zero disables eviction and lets the operating system page mappings in
    /// and out. A useful nonzero cap satisfies
    /// `cap > 2 + (maximum message size / arena size)`.
    pub fn max_in_memory_arenas(mut self, cap: usize) -> QueueResult<Self> {
        if cap != 0 && cap < MIN_IN_MEMORY_ARENAS {
            return Err(QueueError::TooFewInMemoryArenas(cap));
        }
        self.config.max_in_memory_arenas = cap;
        Ok(self)
    }

    /// Schedules a best-effort flush after `ops` successful mutations.
    ///
    /// Lower values favor durability, higher values favor throughput. To
    /// disable the mutation trigger set [`QueueConfig::flush_mut_ops`] to
    /// zero and use [`QueueOptions::from_config`].
    pub fn periodic_flush_ops(mut self, ops: u64) -> QueueResult<Self> {
        if ops == 0 {
            return Err(QueueError::MustBeGreaterThanZero("flush_mut_ops"));
        }
        self.config.flush_mut_ops = ops;
        Ok(self)
    }

    /// Schedules a best-effort flush every `period`.
    ///
    /// To disable the timer trigger set [`QueueConfig::flush_period`] to
    /// [`Duration::ZERO`] and use [`QueueOptions::from_config`].
    pub fn periodic_flush_duration(mut self, period: Duration) -> QueueResult<Self> {
        if period.is_zero() {
            return Err(QueueError::MustBeGreaterThanZero("flush_period"));
        }
        self.config.flush_period = period;
        Ok(self)
    }

    /// Injects a custom time source. Intended for tests.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}
