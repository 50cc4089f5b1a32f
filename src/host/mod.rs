//! Types and capabilities of the host-worker interface. The host is the
//! multi-language daemon that owns the shard lease: it feeds records over
//! stdin, receives status and checkpoint requests over stdout, and decides
//! when the worker shuts down.

pub mod daemon;

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;

/// A single record as delivered by the host. `data` is base64 on the wire.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub data: String,
    pub sequence_number: String,
    #[serde(default)]
    pub sub_sequence_number: u32,
}

/// Why the host is shutting this worker down. `Terminate` means the shard
/// is ending gracefully and a final checkpoint is expected; any other
/// reason is a failover and the worker must not checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    Terminate,
    Failover(String),
}

impl ShutdownReason {
    pub fn from_reason(reason: &str) -> Self {
        if reason == "TERMINATE" {
            ShutdownReason::Terminate
        } else {
            ShutdownReason::Failover(reason.to_string())
        }
    }
}

/// Typed view of the error strings the host returns from a checkpoint call.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("ShutdownException")]
    Shutdown,

    #[error("ThrottlingException")]
    Throttling,

    #[error("InvalidStateException")]
    InvalidState,

    #[error("checkpoint failed: {0}")]
    Other(String),
}

impl CheckpointError {
    pub fn from_host_error(error: &str) -> Self {
        match error {
            "ShutdownException" => CheckpointError::Shutdown,
            "ThrottlingException" => CheckpointError::Throttling,
            "InvalidStateException" => CheckpointError::InvalidState,
            other => CheckpointError::Other(other.to_string()),
        }
    }
}

/// Capability to record progress with the host. Passing `None` for both
/// arguments finalizes the shard (used on graceful shutdown).
#[async_trait]
pub trait Checkpointer: Send + Sync {
    async fn checkpoint(
        &self,
        sequence_number: Option<&str>,
        sub_sequence_number: Option<u32>,
    ) -> Result<(), CheckpointError>;
}

/// The worker side of the host protocol. The host calls these serially,
/// one shard per worker process; the checkpointer handed to `initialize`
/// stays valid for the life of the shard lease.
#[async_trait]
pub trait ShardProcessor: Send {
    async fn initialize(&mut self, shard_id: &str, checkpointer: Arc<dyn Checkpointer>);

    async fn process_records(&mut self, records: Vec<Record>);

    async fn shutdown(&mut self, reason: ShutdownReason);
}
