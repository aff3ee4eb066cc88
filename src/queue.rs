use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::channel::{bounded, Sender};
use parking_lot::Mutex;
use tracing::debug;

use crate::clock::Clock;
use crate::codec;
use crate::config::{Position, QueueConfig, QueueOptions};
use crate::error::{QueueError, QueueResult};
use crate::flush::{FlushMetrics, FlushMetricsSnapshot, FlushTrigger, FlushWorker};
use crate::manager::{ArenaManager, Pins};
use crate::meta::Metadata;

/// Name of the consumer that backs the queue-level operations.
pub const DEFAULT_CONSUMER: &str = "__default__";

/// Everything guarded by the queue's write lock.
struct QueueState {
    meta: Metadata,
    arenas: ArenaManager,
    last_flush_millis: u64,
}

/// State shared between the queue handle, its consumers, and the flush
/// worker.
///
/// One exclusive lock serializes every operation that touches queue state:
/// metadata, the arena map, the consumer directory. Reads take it too, since
/// arena loads and evictions mutate the manager. The mutation counter is the
/// one piece that lives outside the lock, as a plain atomic.
struct QueueCore {
    dir: PathBuf,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<QueueState>,
    mut_ops: AtomicU64,
    metrics: FlushMetrics,
    flush_signal: Sender<()>,
}

impl QueueCore {
    fn enqueue(&self, payload: &[u8]) -> QueueResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let tail = state.meta.tail();
        let pins = Pins {
            head: state.meta.head().aid,
            tail: tail.aid,
        };
        let pos = codec::write_length(&mut state.arenas, pins, tail, payload.len() as u64)?;
        let pos = codec::write_bytes(&mut state.arenas, pins, pos, payload)?;
        state.meta.set_tail(pos);

        self.record_mutation(state);
        Ok(())
    }

    fn is_empty(&self, base: u64) -> bool {
        let guard = self.state.lock();
        guard.meta.consumer_head(base) == guard.meta.tail()
    }

    /// Reads the record at the consumer's head, converts it, and only then
    /// advances the head. A failing conversion leaves the record unread.
    fn dequeue_with<T>(&self, base: u64, convert: fn(Vec<u8>) -> QueueResult<T>) -> QueueResult<T> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let (pos, payload) = read_head_record(state, base)?;
        let value = convert(payload)?;

        state.meta.set_consumer_head(base, pos);
        let queue_head = state
            .meta
            .min_consumer_head()
            .expect("the default consumer always exists");
        state.meta.set_head(queue_head);
        state.arenas.gc(queue_head.aid)?;

        self.record_mutation(state);
        Ok(value)
    }

    fn peek_with<T>(&self, base: u64, convert: fn(Vec<u8>) -> QueueResult<T>) -> QueueResult<T> {
        let mut guard = self.state.lock();
        let (_, payload) = read_head_record(&mut guard, base)?;
        drop(guard);
        convert(payload)
    }

    /// Msyncs every dirty arena and the metadata, then rearms both flush
    /// triggers.
    fn flush(&self, trigger: FlushTrigger) -> QueueResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let result = state.arenas.flush().and_then(|()| state.meta.flush());
        match result {
            Ok(()) => {
                self.mut_ops.store(0, Ordering::Release);
                state.last_flush_millis = self.clock.now_millis();
                self.metrics.record_success(trigger);
                Ok(())
            }
            Err(err) => {
                self.metrics.record_failure();
                Err(err)
            }
        }
    }

    /// Counts one successful mutation and schedules a flush when either
    /// threshold has tripped. A full signal slot means one is already queued.
    fn record_mutation(&self, state: &QueueState) {
        let ops = self.mut_ops.fetch_add(1, Ordering::AcqRel) + 1;
        let ops_tripped = self.config.flush_mut_ops > 0 && ops >= self.config.flush_mut_ops;
        let elapsed = self
            .clock
            .now_millis()
            .saturating_sub(state.last_flush_millis);
        let period_tripped = !self.config.flush_period.is_zero()
            && elapsed >= self.config.flush_period.as_millis() as u64;

        if ops_tripped || period_tripped {
            let _ = self.flush_signal.try_send(());
        }
    }
}

impl QueueOptions {
    /// Opens the queue at `dir` with these options.
    pub fn open(self, dir: impl AsRef<Path>) -> QueueResult<MmapQueue> {
        MmapQueue::open_with(dir.as_ref(), self)
    }
}

/// Locates, reads, and returns the record at the consumer's head together
/// with the normalized position of the next record. The head is not moved.
fn read_head_record(state: &mut QueueState, base: u64) -> QueueResult<(Position, Vec<u8>)> {
    let tail = state.meta.tail();
    let head = state.meta.consumer_head(base);
    if head == tail {
        return Err(QueueError::EmptyQueue);
    }

    let pins = Pins {
        head: state.meta.head().aid,
        tail: tail.aid,
    };
    let (pos, length) = codec::read_length(&mut state.arenas, pins, head)?;
    codec::read_bytes(&mut state.arenas, pins, pos, length)
}

fn into_bytes(payload: Vec<u8>) -> QueueResult<Vec<u8>> {
    Ok(payload)
}

fn into_string(payload: Vec<u8>) -> QueueResult<String> {
    String::from_utf8(payload).map_err(QueueError::MalformedUtf8)
}

/// An embedded, persistent FIFO byte-message queue backed by memory-mapped
/// arena files.
///
/// Producers append variable-length payloads; consumers read them back in
/// insertion order. State lives in a single directory and survives process
/// restarts. Named consumers track independent read positions over the one
/// shared stream; the queue-level `dequeue`/`peek`/`is_empty` operate on the
/// built-in [`DEFAULT_CONSUMER`].
///
/// ```no_run
/// use mmapq::MmapQueue;
///
/// let queue = MmapQueue::open("/var/lib/myapp/queue")?;
/// queue.enqueue(b"hello")?;
/// assert_eq!(queue.dequeue()?, b"hello");
/// # Ok::<(), mmapq::QueueError>(())
/// ```
pub struct MmapQueue {
    core: Arc<QueueCore>,
    default_base: u64,
    worker: Option<FlushWorker>,
    closed: bool,
}

impl std::fmt::Debug for MmapQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmapQueue")
            .field("dir", &self.core.dir)
            .field("closed", &self.closed)
            .finish()
    }
}

impl MmapQueue {
    /// Opens the queue at `dir` with default options, creating the
    /// directory and files on first use.
    pub fn open(dir: impl AsRef<Path>) -> QueueResult<Self> {
        QueueOptions::new().open(dir)
    }

    pub(crate) fn open_with(dir: &Path, options: QueueOptions) -> QueueResult<Self> {
        let QueueOptions { config, clock } = options;
        config.validate()?;
        fs::create_dir_all(dir)?;

        let mut meta = Metadata::open(dir)?;
        let persisted = meta.arena_size();
        if persisted == 0 {
            meta.set_arena_size(config.arena_size);
        } else if persisted != config.arena_size {
            return Err(QueueError::MismatchedArenaSize {
                persisted,
                configured: config.arena_size,
            });
        }

        let head = meta.head();
        let tail = meta.tail();
        let arenas = ArenaManager::new(
            dir,
            config.arena_size,
            config.max_in_memory_arenas,
            head.aid,
            tail.aid,
        )?;
        let default_base = meta.get_or_create_consumer(DEFAULT_CONSUMER)?;

        let (flush_signal, signal_rx) = bounded(1);
        let last_flush_millis = clock.now_millis();
        let core = Arc::new(QueueCore {
            dir: dir.to_path_buf(),
            config,
            clock,
            state: Mutex::new(QueueState {
                meta,
                arenas,
                last_flush_millis,
            }),
            mut_ops: AtomicU64::new(0),
            metrics: FlushMetrics::default(),
            flush_signal,
        });

        let worker = if core.config.flushing_enabled() {
            let flusher = Arc::clone(&core);
            Some(FlushWorker::spawn(
                core.config.flush_period,
                signal_rx,
                move |trigger| flusher.flush(trigger),
            )?)
        } else {
            None
        };

        debug!(dir = %dir.display(), arena_size = core.config.arena_size, "opened queue");
        Ok(Self {
            core,
            default_base,
            worker,
            closed: false,
        })
    }

    /// Appends one record holding `payload` to the tail of the queue.
    pub fn enqueue(&self, payload: &[u8]) -> QueueResult<()> {
        self.core.enqueue(payload)
    }

    /// Appends one record holding the UTF-8 bytes of `payload`, without
    /// copying it first.
    pub fn enqueue_str(&self, payload: &str) -> QueueResult<()> {
        self.core.enqueue(payload.as_bytes())
    }

    /// Removes the record at the default consumer's head and returns its
    /// payload.
    pub fn dequeue(&self) -> QueueResult<Vec<u8>> {
        self.core.dequeue_with(self.default_base, into_bytes)
    }

    /// Like [`dequeue`](Self::dequeue), decoding the payload as UTF-8. A
    /// payload that is not valid UTF-8 fails with
    /// [`QueueError::MalformedUtf8`] and stays in the queue.
    pub fn dequeue_string(&self) -> QueueResult<String> {
        self.core.dequeue_with(self.default_base, into_string)
    }

    /// Returns the record at the default consumer's head without advancing.
    pub fn peek(&self) -> QueueResult<Vec<u8>> {
        self.core.peek_with(self.default_base, into_bytes)
    }

    /// Like [`peek`](Self::peek), decoding the payload as UTF-8.
    pub fn peek_string(&self) -> QueueResult<String> {
        self.core.peek_with(self.default_base, into_string)
    }

    /// True when the default consumer has read everything written so far.
    pub fn is_empty(&self) -> bool {
        self.core.is_empty(self.default_base)
    }

    /// Returns the consumer named `name`, registering it first when unknown.
    /// A newly registered consumer starts reading at the current queue head.
    pub fn consumer(&self, name: &str) -> QueueResult<Consumer> {
        let base = self.core.state.lock().meta.get_or_create_consumer(name)?;
        Ok(Consumer {
            core: Arc::clone(&self.core),
            name: name.to_owned(),
            base,
        })
    }

    /// Like [`consumer`](Self::consumer), but a newly registered consumer
    /// starts at `source`'s head instead of the queue head. An existing
    /// consumer is rebound with its head untouched. Fails with
    /// [`QueueError::DifferentQueues`] when `source` belongs to another
    /// queue instance.
    pub fn consumer_from(&self, name: &str, source: &Consumer) -> QueueResult<Consumer> {
        if !Arc::ptr_eq(&self.core, &source.core) {
            return Err(QueueError::DifferentQueues);
        }

        let mut guard = self.core.state.lock();
        let state = &mut *guard;
        let existed = state.meta.has_consumer(name);
        let base = state.meta.get_or_create_consumer(name)?;
        if !existed {
            let head = state.meta.consumer_head(source.base);
            state.meta.set_consumer_head(base, head);
        }
        drop(guard);

        Ok(Consumer {
            core: Arc::clone(&self.core),
            name: name.to_owned(),
            base,
        })
    }

    /// Msyncs every dirty arena and the metadata, resets the mutation
    /// counter, and records the flush time.
    pub fn flush(&self) -> QueueResult<()> {
        self.core.flush(FlushTrigger::Manual)
    }

    /// Stops the background flush task, flushes everything, and unmaps the
    /// arenas. Called implicitly on drop; calling it explicitly surfaces
    /// errors instead of discarding them.
    pub fn close(mut self) -> QueueResult<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> QueueResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
        let flushed = self.core.flush(FlushTrigger::Manual);
        let closed = self.core.state.lock().arenas.close();
        flushed.and(closed)
    }

    /// Directory holding the queue's files.
    pub fn dir(&self) -> &Path {
        &self.core.dir
    }

    /// Counters describing the durability controller's activity so far.
    pub fn flush_metrics(&self) -> FlushMetricsSnapshot {
        self.core.metrics.snapshot()
    }

    /// Mutations performed since the last completed flush.
    pub fn pending_mutations(&self) -> u64 {
        self.core.mut_ops.load(Ordering::Acquire)
    }

    /// Number of arenas currently mapped, excluding the metadata mapping.
    pub fn in_memory_arenas(&self) -> usize {
        self.core.state.lock().arenas.in_memory()
    }
}

impl Drop for MmapQueue {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            debug!(error = %err, "close on drop failed");
        }
    }
}

/// A named read cursor over the shared queue.
///
/// Each consumer advances independently; a record is only eligible for
/// deletion once every consumer has read past it. The handle stays valid
/// after the [`MmapQueue`] it came from is dropped, but the arenas are
/// unmapped at that point and operations will remap them on demand.
#[derive(Clone)]
pub struct Consumer {
    core: Arc<QueueCore>,
    name: String,
    base: u64,
}

impl Consumer {
    /// The name this consumer was registered under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when this consumer has read everything written so far.
    pub fn is_empty(&self) -> bool {
        self.core.is_empty(self.base)
    }

    /// Removes the record at this consumer's head and returns its payload.
    pub fn dequeue(&self) -> QueueResult<Vec<u8>> {
        self.core.dequeue_with(self.base, into_bytes)
    }

    /// Like [`dequeue`](Self::dequeue), decoding the payload as UTF-8.
    pub fn dequeue_string(&self) -> QueueResult<String> {
        self.core.dequeue_with(self.base, into_string)
    }

    /// Returns the record at this consumer's head without advancing.
    pub fn peek(&self) -> QueueResult<Vec<u8>> {
        self.core.peek_with(self.base, into_bytes)
    }

    /// Like [`peek`](Self::peek), decoding the payload as UTF-8.
    pub fn peek_string(&self) -> QueueResult<String> {
        self.core.peek_with(self.base, into_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::os_page_size;
    use tempfile::TempDir;

    fn small_queue(dir: &Path) -> MmapQueue {
        QueueOptions::new()
            .arena_size(os_page_size())
            .expect("arena size")
            .open(dir)
            .expect("open")
    }

    #[test]
    fn dequeue_on_empty_queue_is_control_flow() {
        let tmp = TempDir::new().expect("tempdir");
        let queue = small_queue(tmp.path());
        assert!(queue.is_empty());
        assert!(matches!(queue.dequeue(), Err(QueueError::EmptyQueue)));
        assert!(matches!(queue.peek(), Err(QueueError::EmptyQueue)));
    }

    #[test]
    fn is_empty_is_idempotent() {
        let tmp = TempDir::new().expect("tempdir");
        let queue = small_queue(tmp.path());
        queue.enqueue(b"one").expect("enqueue");
        for _ in 0..5 {
            assert!(!queue.is_empty());
        }
        queue.dequeue().expect("dequeue");
        for _ in 0..5 {
            assert!(queue.is_empty());
        }
    }

    #[test]
    fn peek_does_not_advance() {
        let tmp = TempDir::new().expect("tempdir");
        let queue = small_queue(tmp.path());
        queue.enqueue(b"stay").expect("enqueue");
        assert_eq!(queue.peek().expect("peek"), b"stay");
        assert_eq!(queue.peek().expect("peek again"), b"stay");
        assert_eq!(queue.dequeue().expect("dequeue"), b"stay");
    }

    #[test]
    fn string_round_trip_and_malformed_payload() {
        let tmp = TempDir::new().expect("tempdir");
        let queue = small_queue(tmp.path());

        queue.enqueue_str("grüße").expect("enqueue");
        assert_eq!(queue.peek_string().expect("peek"), "grüße");
        assert_eq!(queue.dequeue_string().expect("dequeue"), "grüße");

        queue.enqueue(&[0xff, 0xfe]).expect("enqueue raw");
        assert!(matches!(
            queue.dequeue_string(),
            Err(QueueError::MalformedUtf8(_))
        ));
        // the record was not consumed by the failed decode
        assert_eq!(queue.dequeue().expect("dequeue"), vec![0xff, 0xfe]);
    }

    #[test]
    fn consumers_of_the_same_name_share_a_cursor() {
        let tmp = TempDir::new().expect("tempdir");
        let queue = small_queue(tmp.path());
        queue.enqueue(b"a").expect("enqueue");
        queue.enqueue(b"b").expect("enqueue");

        let one = queue.consumer("worker").expect("consumer");
        let two = queue.consumer("worker").expect("consumer again");
        assert_eq!(one.dequeue().expect("dequeue"), b"a");
        assert_eq!(two.dequeue().expect("dequeue"), b"b");
    }

    #[test]
    fn consumer_from_other_queue_is_rejected() {
        let tmp_a = TempDir::new().expect("tempdir");
        let tmp_b = TempDir::new().expect("tempdir");
        let queue_a = small_queue(tmp_a.path());
        let queue_b = small_queue(tmp_b.path());

        let foreign = queue_b.consumer("other").expect("consumer");
        assert!(matches!(
            queue_a.consumer_from("clone", &foreign),
            Err(QueueError::DifferentQueues)
        ));
    }

    #[test]
    fn consumer_from_copies_the_source_head_once() {
        let tmp = TempDir::new().expect("tempdir");
        let queue = small_queue(tmp.path());
        queue.enqueue(b"a").expect("enqueue");
        queue.enqueue(b"b").expect("enqueue");

        queue.dequeue().expect("advance default");
        let source = queue.consumer(DEFAULT_CONSUMER).expect("default handle");
        let branched = queue.consumer_from("branched", &source).expect("branch");
        assert_eq!(branched.dequeue().expect("dequeue"), b"b");

        // rebinding an existing name leaves its cursor alone
        let rebound = queue.consumer_from("branched", &source).expect("rebind");
        assert!(rebound.is_empty());
    }
}
