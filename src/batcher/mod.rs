//! Message accumulation. Decoded payloads are queued onto a bounded channel
//! and a single batcher task groups them into batches, flushing on a count,
//! size, or quiet-interval trigger, or on an explicit request. Each flush
//! hands the batch to the sink together with the largest sequence pair ever
//! enclosed in a flushed batch.

use crate::config::ConfigError;
use crate::sequence::{SequenceError, SequencePair, SequenceTracker};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tracing::debug;

/// Hard ceiling of the downstream bulk-put API.
pub const MAX_FLUSH_COUNT: usize = 500;
/// Hard ceiling of the downstream bulk-put API, in bytes.
pub const MAX_FLUSH_SIZE: usize = 4 * 1024 * 1024;

const MESSAGE_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Error)]
pub enum BatcherError {
    #[error("empty messages can't be sent")]
    EmptyMessage,

    #[error(transparent)]
    Sequence(#[from] SequenceError),

    #[error("batcher task has stopped")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct BatcherConfig {
    pub flush_interval: Duration,
    pub flush_count: usize,
    pub flush_size: usize,
}

impl BatcherConfig {
    pub fn new(
        flush_interval: Duration,
        flush_count: usize,
        flush_size: usize,
    ) -> Result<Self, ConfigError> {
        if !(1..=MAX_FLUSH_COUNT).contains(&flush_count) {
            return Err(ConfigError::Validation(format!(
                "flush count must be between 1 and {MAX_FLUSH_COUNT} messages, got {flush_count}"
            )));
        }
        if !(1..=MAX_FLUSH_SIZE).contains(&flush_size) {
            return Err(ConfigError::Validation(format!(
                "flush size must be between 1 and {MAX_FLUSH_SIZE} bytes, got {flush_size}"
            )));
        }
        Ok(Self {
            flush_interval,
            flush_count,
            flush_size,
        })
    }
}

/// Where flushed batches go. The owner of the batcher implements this; any
/// delivery failure is handled behind it, so a batch is considered flushed
/// the moment the call returns.
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn send_batch(&self, batch: Vec<Bytes>, largest: SequencePair);
}

#[derive(Debug)]
struct BatchItem {
    payload: Bytes,
    pair: SequencePair,
}

/// Handle to the batcher task. Cheap to use from the ingest loop; the only
/// suspension points are channel backpressure and explicit flushes.
pub struct MessageBatcher {
    message_tx: mpsc::Sender<BatchItem>,
    flush_tx: mpsc::Sender<oneshot::Sender<()>>,
    tracker: Arc<Mutex<SequenceTracker>>,
}

impl MessageBatcher {
    pub fn spawn(config: BatcherConfig, sink: Arc<dyn BatchSink>) -> Self {
        let (message_tx, message_rx) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);
        let (flush_tx, flush_rx) = mpsc::channel(1);
        let tracker = Arc::new(Mutex::new(SequenceTracker::default()));

        let batcher_loop = BatcherLoop {
            config,
            sink,
            tracker: Arc::clone(&tracker),
            batch: Vec::new(),
            batch_size: 0,
        };
        tokio::spawn(batcher_loop.run(message_rx, flush_rx));

        Self {
            message_tx,
            flush_tx,
            tracker,
        }
    }

    /// Queue one serialized message under its sequence pair. Fails fast on
    /// empty payloads and unparseable sequence numbers; blocks only when the
    /// queue is full.
    pub async fn add_message(
        &self,
        payload: Bytes,
        sequence_number: &str,
        sub_sequence_number: u32,
    ) -> Result<(), BatcherError> {
        if payload.is_empty() {
            return Err(BatcherError::EmptyMessage);
        }
        let pair = SequencePair::parse(sequence_number, sub_sequence_number)?;
        self.message_tx
            .send(BatchItem { payload, pair })
            .await
            .map_err(|_| BatcherError::Closed)
    }

    /// Flush whatever is pending. Resolves after the batcher loop has
    /// performed the flush, so a following checkpoint cannot outrun the send.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.flush_tx.send(done_tx).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    pub fn largest_sequence_pair(&self) -> Option<SequencePair> {
        self.tracker.lock().ok().and_then(|t| t.largest.clone())
    }

    pub fn smallest_sequence_pair(&self) -> Option<SequencePair> {
        self.tracker.lock().ok().and_then(|t| t.smallest.clone())
    }
}

struct BatcherLoop {
    config: BatcherConfig,
    sink: Arc<dyn BatchSink>,
    tracker: Arc<Mutex<SequenceTracker>>,
    batch: Vec<Bytes>,
    batch_size: usize,
}

impl BatcherLoop {
    /// The select is biased towards queued messages so that an explicit
    /// flush observes everything enqueued before it. The interval sleep is
    /// rebuilt every iteration, which makes it a quiet-period timer: any
    /// activity pushes the next timed flush out by a full interval.
    async fn run(
        mut self,
        mut message_rx: mpsc::Receiver<BatchItem>,
        mut flush_rx: mpsc::Receiver<oneshot::Sender<()>>,
    ) {
        loop {
            tokio::select! {
                biased;

                item = message_rx.recv() => match item {
                    Some(item) => self.append(item).await,
                    None => {
                        self.flush().await;
                        break;
                    }
                },

                Some(done) = flush_rx.recv() => {
                    self.flush().await;
                    let _ = done.send(());
                }

                _ = sleep(self.config.flush_interval) => {
                    self.flush().await;
                }
            }
        }
    }

    async fn append(&mut self, item: BatchItem) {
        // Flush first if this payload would push the batch over the size
        // limit. A payload larger than the limit on its own still goes out,
        // as a one-item batch.
        if self.config.flush_size < self.batch_size + item.payload.len() {
            self.flush().await;
        }

        if let Ok(mut tracker) = self.tracker.lock() {
            tracker.observe(&item.pair);
        }
        self.batch_size += item.payload.len();
        self.batch.push(item.payload);

        if self.config.flush_count <= self.batch.len() || self.config.flush_size <= self.batch_size
        {
            self.flush().await;
        }
    }

    async fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }

        let largest = self.tracker.lock().ok().and_then(|t| t.largest.clone());
        let batch = std::mem::take(&mut self.batch);
        self.batch_size = 0;

        if let Some(largest) = largest {
            debug!(records = batch.len(), largest = %largest, "flushing batch");
            self.sink.send_batch(batch, largest).await;
        }

        if let Ok(mut tracker) = self.tracker.lock() {
            tracker.reset_smallest();
        }
    }
}
