//! Narrow view of the Firehose bulk-put surface. The sender only ever needs
//! `PutRecordBatch`, so that is the whole capability; tests substitute doubles
//! without touching AWS.

use async_trait::async_trait;
use rusoto_core::Region;
use rusoto_firehose::{
    KinesisFirehose, KinesisFirehoseClient, PutRecordBatchInput, PutRecordBatchOutput, Record,
};
use std::str::FromStr;
use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum FirehoseError {
    #[error("firehose transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait FirehoseApi: Send + Sync {
    async fn put_record_batch(
        &self,
        stream_name: &str,
        records: Vec<Record>,
    ) -> Result<PutRecordBatchOutput, FirehoseError>;
}

#[async_trait]
impl FirehoseApi for KinesisFirehoseClient {
    async fn put_record_batch(
        &self,
        stream_name: &str,
        records: Vec<Record>,
    ) -> Result<PutRecordBatchOutput, FirehoseError> {
        KinesisFirehose::put_record_batch(
            self,
            PutRecordBatchInput {
                delivery_stream_name: stream_name.to_string(),
                records,
            },
        )
        .await
        .map_err(|e| FirehoseError::Transport(e.to_string()))
    }
}

/// Client for the configured region.
pub fn new_client(region: &str) -> Result<KinesisFirehoseClient, ConfigError> {
    let region = Region::from_str(region).map_err(|_| ConfigError::InvalidVar {
        name: "FIREHOSE_AWS_REGION".to_string(),
        value: region.to_string(),
        expected: "a valid AWS region name",
    })?;
    Ok(KinesisFirehoseClient::new(region))
}
