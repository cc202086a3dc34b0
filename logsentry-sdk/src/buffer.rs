use std::collections::VecDeque;
use std::time::{Duration, Instant};

use logsentry_protocol::LogRecord;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// How often the overflow warning may be emitted.
const OVERFLOW_WARN_INTERVAL: Duration = Duration::from_secs(60);

struct Inner {
    records: VecDeque<LogRecord>,
    /// When the oldest record currently in the buffer was enqueued.
    oldest_enqueued: Option<Instant>,
    last_overflow_warn: Option<Instant>,
    dropped: u64,
}

/// Bounded in-process queue of pending log records.
///
/// Producers are the host's logging threads: [`push`](LogBuffer::push) never
/// blocks, and a full buffer evicts the oldest record instead of the caller
/// waiting. The flusher is the single consumer.
pub struct LogBuffer {
    inner: Mutex<Inner>,
    max_buffer: usize,
    batch_size: usize,
    /// Signalled when a full batch accumulates.
    pub(crate) batch_ready: Notify,
}

impl LogBuffer {
    /// Creates a buffer holding at most `max_buffer` records.
    pub fn new(max_buffer: usize, batch_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                records: VecDeque::new(),
                oldest_enqueued: None,
                last_overflow_warn: None,
                dropped: 0,
            }),
            max_buffer,
            batch_size,
            batch_ready: Notify::new(),
        }
    }

    /// Enqueues a record without blocking.
    ///
    /// On overflow the oldest record is dropped and a rate-limited warning
    /// goes to the host's own console, never back into the pipeline.
    pub fn push(&self, record: LogRecord) {
        // Evicting and appending under one guard keeps the occupancy bound
        // exact with concurrent producers.
        let warn_dropped = {
            let mut inner = self.inner.lock();

            let mut warn_dropped = None;
            if inner.records.len() == self.max_buffer {
                inner.records.pop_front();
                inner.dropped += 1;

                let now = Instant::now();
                let warn = inner
                    .last_overflow_warn
                    .map_or(true, |last| now - last >= OVERFLOW_WARN_INTERVAL);
                if warn {
                    inner.last_overflow_warn = Some(now);
                    warn_dropped = Some(inner.dropped);
                }
            }

            inner.oldest_enqueued.get_or_insert_with(Instant::now);
            inner.records.push_back(record);

            if inner.records.len() >= self.batch_size {
                self.batch_ready.notify_one();
            }

            warn_dropped
        };

        if let Some(dropped) = warn_dropped {
            tracing::warn!(
                target: "logsentry_sdk",
                "log buffer full, dropped {dropped} records so far"
            );
        }
    }

    /// Takes up to one batch from the head of the queue.
    ///
    /// Without `force`, a batch is only returned when it is full or its
    /// oldest record has reached `max_age`.
    pub fn take_batch(&self, max_age: Duration, force: bool) -> Option<Vec<LogRecord>> {
        let mut inner = self.inner.lock();
        if inner.records.is_empty() {
            return None;
        }

        let aged = inner
            .oldest_enqueued
            .is_some_and(|oldest| oldest.elapsed() >= max_age);
        if !force && !aged && inner.records.len() < self.batch_size {
            return None;
        }

        let n = inner.records.len().min(self.batch_size);
        let batch = inner.records.drain(..n).collect();
        inner.oldest_enqueued = if inner.records.is_empty() {
            None
        } else {
            // Records behind the drained batch arrived later; their age bound
            // restarts rather than tracking exact enqueue times.
            Some(Instant::now())
        };

        Some(batch)
    }

    /// Reinserts a failed batch at the head of the queue, preserving order.
    pub fn reinsert_front(&self, batch: Vec<LogRecord>) {
        let mut inner = self.inner.lock();
        for record in batch.into_iter().rev() {
            inner.records.push_front(record);
        }

        // Trim from the back: the newest records give way for the retried
        // batch within the configured bound.
        while inner.records.len() > self.max_buffer {
            inner.records.pop_back();
            inner.dropped += 1;
        }

        inner.oldest_enqueued.get_or_insert_with(Instant::now);
    }

    /// The deadline at which the oldest buffered record reaches `max_age`.
    pub fn age_deadline(&self, max_age: Duration) -> Option<Instant> {
        let inner = self.inner.lock();
        inner.oldest_enqueued.map(|oldest| oldest + max_age)
    }

    /// Number of buffered records.
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    /// Returns `true` if no records are buffered.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use logsentry_protocol::LogLevel;

    use super::*;

    fn record(message: &str) -> LogRecord {
        LogRecord::new(LogLevel::Info, message)
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let buffer = LogBuffer::new(3, 2);
        for i in 0..5 {
            buffer.push(record(&format!("m{i}")));
        }

        assert_eq!(buffer.len(), 3);
        let batch = buffer.take_batch(Duration::ZERO, true).unwrap();
        assert_eq!(batch[0].message, "m2");
        assert_eq!(batch[1].message, "m3");
    }

    #[test]
    fn test_partial_batch_needs_age_or_force() {
        let buffer = LogBuffer::new(100, 10);
        buffer.push(record("only"));

        assert!(buffer.take_batch(Duration::from_secs(60), false).is_none());
        assert_eq!(
            buffer.take_batch(Duration::from_secs(60), true).unwrap().len(),
            1
        );
    }

    #[test]
    fn test_full_batch_is_taken_without_force() {
        let buffer = LogBuffer::new(100, 2);
        buffer.push(record("a"));
        buffer.push(record("b"));
        buffer.push(record("c"));

        let batch = buffer.take_batch(Duration::from_secs(60), false).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_reinsert_preserves_order() {
        let buffer = LogBuffer::new(100, 2);
        buffer.push(record("a"));
        buffer.push(record("b"));
        buffer.push(record("c"));

        let batch = buffer.take_batch(Duration::ZERO, true).unwrap();
        buffer.reinsert_front(batch);

        let batch = buffer.take_batch(Duration::ZERO, true).unwrap();
        assert_eq!(batch[0].message, "a");
        assert_eq!(batch[1].message, "b");
    }
}
