//! Bulk delivery to Firehose. A batch goes out as one `PutRecordBatch`; the
//! per-record responses drive a backoff-and-retry loop that resends only the
//! rejected records. Errors split into two kinds: catastrophic (the transport
//! failed, nothing was delivered) and partial (retries exhausted, the listed
//! records were dropped).

use crate::batcher::BatchSink;
use crate::firehose::FirehoseApi;
use crate::sequence::{FlushMark, SequencePair};
use crate::stats::Counters;
use async_trait::async_trait;
use bytes::Bytes;
use rusoto_firehose::{PutRecordBatchOutput, Record};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, warn};

const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(250);
const MAX_RETRIES: u32 = 4;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("error writing to stream {stream}: {message}")]
    Catastrophic { stream: String, message: String },

    #[error("too many retries failed to put records -- stream: {stream}")]
    Partial { stream: String, failed: Vec<Bytes> },
}

pub struct FirehoseSender {
    client: Arc<dyn FirehoseApi>,
    stream_name: String,
    counters: Arc<Counters>,
    flush_mark: FlushMark,
}

impl FirehoseSender {
    pub fn new(
        client: Arc<dyn FirehoseApi>,
        stream_name: String,
        counters: Arc<Counters>,
        flush_mark: FlushMark,
    ) -> Self {
        Self {
            client,
            stream_name,
            counters,
            flush_mark,
        }
    }

    /// Deliver a batch, retrying rejected records with exponential backoff.
    pub async fn dispatch(&self, batch: Vec<Bytes>) -> Result<(), SendError> {
        let mut pending = batch;
        let mut output = self.put(&pending).await?;
        self.track_attempt(pending.len(), output.failed_put_count);

        let mut delay = INITIAL_RETRY_DELAY;
        let mut retries = 0;
        while output.failed_put_count != 0 {
            warn!(
                stream = %self.stream_name,
                failed_record_count = output.failed_put_count,
                retries,
                "stream rejected records, backing off"
            );
            sleep(delay).await;
            delay *= 2;

            let failed = self.failed_records(&pending, &output);
            if failed.is_empty() {
                // The count disagrees with the per-record view; nothing is
                // left to resend.
                break;
            }
            if retries >= MAX_RETRIES {
                return Err(SendError::Partial {
                    stream: self.stream_name.clone(),
                    failed,
                });
            }

            pending = failed;
            output = self.put(&pending).await?;
            self.track_attempt(pending.len(), output.failed_put_count);
            retries += 1;
        }

        Ok(())
    }

    async fn put(&self, batch: &[Bytes]) -> Result<PutRecordBatchOutput, SendError> {
        let records = batch
            .iter()
            .map(|payload| Record {
                data: payload.clone(),
            })
            .collect();
        self.client
            .put_record_batch(&self.stream_name, records)
            .await
            .map_err(|e| SendError::Catastrophic {
                stream: self.stream_name.clone(),
                message: e.to_string(),
            })
    }

    fn track_attempt(&self, attempted: usize, failed_count: i64) {
        let failed = failed_count.max(0) as u64;
        self.counters.add_failed(failed);
        self.counters.add_sent((attempted as u64).saturating_sub(failed));
    }

    /// Records whose response entry carries a non-empty error message, in
    /// their original order. An empty message means the record was accepted.
    fn failed_records(&self, batch: &[Bytes], output: &PutRecordBatchOutput) -> Vec<Bytes> {
        batch
            .iter()
            .zip(output.request_responses.iter())
            .filter(|(_, entry)| match entry.error_message.as_deref() {
                Some(message) if !message.is_empty() => {
                    debug!(stream = %self.stream_name, error = message, "record rejected");
                    true
                }
                _ => false,
            })
            .map(|(payload, _)| payload.clone())
            .collect()
    }
}

#[async_trait]
impl BatchSink for FirehoseSender {
    async fn send_batch(&self, batch: Vec<Bytes>, largest: SequencePair) {
        let record_count = batch.len();
        match self.dispatch(batch).await {
            Ok(()) => {
                debug!(records = record_count, largest = %largest, "batch delivered");
            }
            Err(SendError::Partial { failed, .. }) => {
                error!(
                    stream = %self.stream_name,
                    dropped = failed.len(),
                    "giving up on records that kept failing, dropping them"
                );
            }
            Err(err @ SendError::Catastrophic { .. }) => {
                error!(error = %err, "failed to deliver batch");
            }
        }

        // The worker never requeues a batch, so the batch is consumed either
        // way and the checkpoint marker moves with it.
        self.flush_mark.advance(&largest);
    }
}
