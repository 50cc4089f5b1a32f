//! The host-facing record processor. For every record: pace the ingest rate,
//! base64-decode, unpack CloudWatch Logs envelopes, decode and enrich each
//! logical message, and queue the result for batching. Progress is reported
//! back to the host on a fixed cadence, quoting only sequence pairs whose
//! batches the sink has already acknowledged.

pub mod es;
pub mod sampler;

use crate::batcher::{BatcherError, MessageBatcher};
use crate::decode::{DecodeError, Decoder};
use crate::host::{CheckpointError, Checkpointer, Record, ShardProcessor, ShutdownReason};
use crate::limiter::RateLimiter;
use crate::sequence::FlushMark;
use crate::splitter::{self, SplitterError};
use crate::stats::Counters;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use self::es::EsTransform;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

const CHECKPOINT_FREQ: Duration = Duration::from_secs(60);
const CHECKPOINT_RETRIES: u32 = 5;
const CHECKPOINT_RETRY_SLEEP: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("record data is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("record data is not utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error(transparent)]
    Envelope(#[from] SplitterError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Batcher(#[from] BatcherError),
}

pub struct RecordProcessor {
    shard_id: String,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    batcher: MessageBatcher,
    limiter: RateLimiter,
    decoder: Decoder,
    es: Option<EsTransform>,
    counters: Arc<Counters>,
    flush_mark: FlushMark,

    checkpoint_freq: Duration,
    checkpoint_retries: u32,
    checkpoint_retry_sleep: Duration,
    last_checkpoint: Instant,
}

impl RecordProcessor {
    pub fn new(
        batcher: MessageBatcher,
        limiter: RateLimiter,
        decoder: Decoder,
        es: Option<EsTransform>,
        counters: Arc<Counters>,
        flush_mark: FlushMark,
    ) -> Self {
        Self {
            shard_id: String::new(),
            checkpointer: None,
            batcher,
            limiter,
            decoder,
            es,
            counters,
            flush_mark,
            checkpoint_freq: CHECKPOINT_FREQ,
            checkpoint_retries: CHECKPOINT_RETRIES,
            checkpoint_retry_sleep: CHECKPOINT_RETRY_SLEEP,
            last_checkpoint: Instant::now(),
        }
    }

    /// Override the checkpoint cadence; the defaults suit production.
    pub fn with_checkpoint_cadence(
        mut self,
        freq: Duration,
        retries: u32,
        retry_sleep: Duration,
    ) -> Self {
        self.checkpoint_freq = freq;
        self.checkpoint_retries = retries;
        self.checkpoint_retry_sleep = retry_sleep;
        self
    }

    /// One host record, which may expand into many logical messages when it
    /// is a CloudWatch Logs envelope. Every expanded message carries the
    /// outer record's sequence pair. A failed message marks the whole record
    /// failed, but the remaining envelope messages are still attempted.
    async fn process_record(&self, record: &Record) -> Result<(), ProcessError> {
        let data = general_purpose::STANDARD.decode(&record.data)?;

        if splitter::is_gzipped(&data) {
            let envelope = splitter::unpack(&data)?;
            let mut last_error = None;
            for line in splitter::split(&envelope) {
                if let Err(error) = self.handle_message(&line, record).await {
                    last_error = Some(error);
                }
            }
            return match last_error {
                Some(error) => Err(error),
                None => Ok(()),
            };
        }

        let line = String::from_utf8(data)?;
        self.handle_message(&line, record).await
    }

    async fn handle_message(&self, line: &str, record: &Record) -> Result<(), ProcessError> {
        let mut fields = self.decoder.parse_and_enhance(line)?;

        if let Some(es) = &self.es {
            match es.apply(fields).await {
                Some(transformed) => fields = transformed,
                // Ignored or sampled away; not a failure.
                None => return Ok(()),
            }
        }

        // One JSON object per line in the delivery stream.
        let mut payload = serde_json::to_vec(&fields)?;
        payload.push(b'\n');
        self.batcher
            .add_message(
                Bytes::from(payload),
                &record.sequence_number,
                record.sub_sequence_number,
            )
            .await?;
        Ok(())
    }

    /// Checkpoint with the host, retrying transient failures. Advisory: a
    /// checkpoint that never lands does not halt ingest.
    async fn checkpoint_with_retry(
        &self,
        checkpointer: &dyn Checkpointer,
        sequence_number: Option<&str>,
        sub_sequence_number: Option<u32>,
    ) {
        for attempt in 0..self.checkpoint_retries {
            match checkpointer
                .checkpoint(sequence_number, sub_sequence_number)
                .await
            {
                Ok(()) => return,
                Err(CheckpointError::Shutdown) => {
                    warn!("encountered shutdown exception, skipping checkpoint");
                    return;
                }
                Err(CheckpointError::Throttling) => {
                    warn!(
                        retry_in = ?self.checkpoint_retry_sleep,
                        "was throttled while checkpointing, will attempt again"
                    );
                }
                Err(CheckpointError::InvalidState) => {
                    warn!("host reported an invalid state while checkpointing");
                }
                Err(CheckpointError::Other(message)) => {
                    warn!(error = %message, "encountered an error while checkpointing");
                }
            }

            if attempt + 1 == self.checkpoint_retries {
                error!(
                    attempts = self.checkpoint_retries,
                    "failed to checkpoint, giving up"
                );
                return;
            }
            sleep(self.checkpoint_retry_sleep).await;
        }
    }
}

#[async_trait]
impl ShardProcessor for RecordProcessor {
    async fn initialize(&mut self, shard_id: &str, checkpointer: Arc<dyn Checkpointer>) {
        self.shard_id = shard_id.to_string();
        self.checkpointer = Some(checkpointer);
        self.last_checkpoint = Instant::now();
    }

    async fn process_records(&mut self, records: Vec<Record>) {
        for record in records {
            // One token per record, however many messages it expands into.
            self.limiter.acquire().await;
            self.counters.incr_received();

            if let Err(error) = self.process_record(&record).await {
                debug!(
                    sequence_number = %record.sequence_number,
                    error = %error,
                    "record failed"
                );
                self.counters.incr_failed();
            }
        }

        if self.last_checkpoint.elapsed() > self.checkpoint_freq {
            if let (Some(checkpointer), Some(largest)) =
                (self.checkpointer.clone(), self.flush_mark.get())
            {
                let sequence_number = largest.number.to_string();
                self.checkpoint_with_retry(
                    checkpointer.as_ref(),
                    Some(&sequence_number),
                    Some(largest.sub),
                )
                .await;
                self.last_checkpoint = Instant::now();

                let snapshot = self.counters.snapshot();
                info!(
                    shard_id = %self.shard_id,
                    received = snapshot.received,
                    sent = snapshot.sent,
                    failed = snapshot.failed,
                    "checkpointed shard progress"
                );
            }
        }
    }

    async fn shutdown(&mut self, reason: ShutdownReason) {
        match reason {
            ShutdownReason::Terminate => {
                info!(shard_id = %self.shard_id, "was told to terminate, will attempt to checkpoint");
                self.batcher.flush().await;
                if let Some(checkpointer) = self.checkpointer.clone() {
                    self.checkpoint_with_retry(checkpointer.as_ref(), None, None)
                        .await;
                }
                if let Some(es) = self.es.take() {
                    es.shutdown().await;
                }
            }
            ShutdownReason::Failover(reason) => {
                info!(
                    shard_id = %self.shard_id,
                    reason = %reason,
                    "shutting down due to failover, will not checkpoint"
                );
            }
        }
    }
}
