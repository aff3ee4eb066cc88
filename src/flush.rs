use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{bounded, never, tick, Receiver, Sender};
use crossbeam::select;
use tracing::{debug, warn};

use crate::error::{QueueError, QueueResult};

const FLUSH_RETRY_MAX_ATTEMPTS: u32 = 5;
const FLUSH_RETRY_BASE_DELAY_MS: u64 = 5;
const FLUSH_RETRY_MAX_DELAY_MS: u64 = 250;

/// What scheduled a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushTrigger {
    /// The mutation counter reached the configured threshold.
    Ops,
    /// The periodic timer fired.
    Timer,
    /// An explicit `flush()` or `close()` call.
    Manual,
}

/// Point-in-time view of the flush counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushMetricsSnapshot {
    /// Completed flushes, regardless of trigger.
    pub flushes: u64,
    /// Flushes scheduled by the mutation-count threshold.
    pub triggered_by_ops: u64,
    /// Flushes scheduled by the periodic timer.
    pub triggered_by_timer: u64,
    /// Explicit flushes (including the one performed by close).
    pub manual: u64,
    /// Flush attempts that failed; the next trigger retries.
    pub failures: u64,
}

/// Atomic flush counters shared between the queue and its flush worker.
#[derive(Debug, Default)]
pub(crate) struct FlushMetrics {
    flushes: AtomicU64,
    triggered_by_ops: AtomicU64,
    triggered_by_timer: AtomicU64,
    manual: AtomicU64,
    failures: AtomicU64,
}

impl FlushMetrics {
    pub(crate) fn record_success(&self, trigger: FlushTrigger) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        let cell = match trigger {
            FlushTrigger::Ops => &self.triggered_by_ops,
            FlushTrigger::Timer => &self.triggered_by_timer,
            FlushTrigger::Manual => &self.manual,
        };
        cell.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> FlushMetricsSnapshot {
        FlushMetricsSnapshot {
            flushes: self.flushes.load(Ordering::Relaxed),
            triggered_by_ops: self.triggered_by_ops.load(Ordering::Relaxed),
            triggered_by_timer: self.triggered_by_timer.load(Ordering::Relaxed),
            manual: self.manual.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Background flush task.
///
/// One worker thread waits on three sources: a shutdown channel, the
/// queue's one-slot signal channel (written when the mutation threshold
/// trips), and a timer firing every flush period. Signal and timer both
/// run the shared flush routine; failures are logged and retried on the
/// next trigger, never escalated.
pub(crate) struct FlushWorker {
    shutdown_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl FlushWorker {
    pub(crate) fn spawn<F>(
        period: Duration,
        signal_rx: Receiver<()>,
        flush: F,
    ) -> QueueResult<Self>
    where
        F: Fn(FlushTrigger) -> QueueResult<()> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = bounded(1);
        let handle = thread::Builder::new()
            .name("mmapq-flush".to_string())
            .spawn(move || worker_loop(period, shutdown_rx, signal_rx, flush))?;
        Ok(Self {
            shutdown_tx,
            handle: Some(handle),
        })
    }

    /// Signals shutdown and waits for the worker to exit.
    pub(crate) fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.shutdown_tx.send(());
            let _ = handle.join();
        }
    }
}

impl Drop for FlushWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop<F>(period: Duration, shutdown_rx: Receiver<()>, signal_rx: Receiver<()>, flush: F)
where
    F: Fn(FlushTrigger) -> QueueResult<()>,
{
    let ticker = if period.is_zero() {
        never()
    } else {
        tick(period)
    };

    loop {
        select! {
            recv(shutdown_rx) -> _ => break,
            recv(signal_rx) -> msg => {
                if msg.is_err() {
                    break;
                }
                flush_with_retry(&flush, FlushTrigger::Ops);
            }
            recv(ticker) -> _ => flush_with_retry(&flush, FlushTrigger::Timer),
        }
    }
}

/// Runs one flush, retrying transient I/O failures with bounded backoff.
fn flush_with_retry<F>(flush: &F, trigger: FlushTrigger)
where
    F: Fn(FlushTrigger) -> QueueResult<()>,
{
    let mut retries = 0u32;
    loop {
        match flush(trigger) {
            Ok(()) => {
                if retries > 0 {
                    debug!(retries, ?trigger, "flush succeeded after retries");
                } else {
                    debug!(?trigger, "flush succeeded");
                }
                return;
            }
            Err(err) => {
                if retries < FLUSH_RETRY_MAX_ATTEMPTS && is_retryable_error(&err) {
                    retries += 1;
                    debug!(attempt = retries, error = %err, "retrying flush");
                    thread::sleep(retry_backoff_delay(retries));
                    continue;
                }
                warn!(retries, error = %err, "background flush failed; next trigger retries");
                return;
            }
        }
    }
}

fn retry_backoff_delay(retries: u32) -> Duration {
    let shift = retries.saturating_sub(1).min(6);
    let delay = FLUSH_RETRY_BASE_DELAY_MS.saturating_mul(1u64 << shift);
    Duration::from_millis(delay.min(FLUSH_RETRY_MAX_DELAY_MS))
}

fn is_retryable_error(err: &QueueError) -> bool {
    match err {
        QueueError::Io(io_err) => is_retryable_io_error(io_err),
        _ => false,
    }
}

fn is_retryable_io_error(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    ) {
        return true;
    }
    if let Some(code) = err.raw_os_error() {
        return matches!(
            code,
            libc::EINTR | libc::EAGAIN | libc::EBUSY | libc::ETIMEDOUT
        );
    }
    false
}
