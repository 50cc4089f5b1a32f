//! Line protocol with the multi-language daemon. The daemon writes one JSON
//! action per line on the worker's stdin and expects a status line on stdout
//! after each action completes. Checkpoint requests flow the other way: the
//! worker emits a checkpoint action and the daemon's acknowledgement is the
//! next line on stdin, so the reader is shared between the dispatch loop and
//! the checkpointer. All calls are serial; the mutex never contends.

use super::{CheckpointError, Checkpointer, Record, ShardProcessor, ShutdownReason};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed host action: {0}")]
    Protocol(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action")]
enum HostAction {
    #[serde(rename = "initialize")]
    Initialize {
        #[serde(rename = "shardId")]
        shard_id: String,
    },

    #[serde(rename = "processRecords")]
    ProcessRecords { records: Vec<Record> },

    #[serde(rename = "shutdown")]
    Shutdown { reason: String },

    #[serde(rename = "checkpoint")]
    Checkpoint { error: Option<String> },
}

#[derive(Serialize)]
struct StatusResponse<'a> {
    action: &'static str,
    #[serde(rename = "responseFor")]
    response_for: &'a str,
}

#[derive(Serialize)]
struct CheckpointRequest<'a> {
    action: &'static str,
    #[serde(rename = "sequenceNumber")]
    sequence_number: Option<&'a str>,
    #[serde(rename = "subSequenceNumber")]
    sub_sequence_number: Option<u32>,
}

struct HostIo<R, W> {
    reader: R,
    writer: W,
}

impl<R, W> HostIo<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Next non-empty line, or `None` once the host closes the pipe.
    async fn read_line(&mut self) -> Result<Option<String>, DaemonError> {
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line).await? == 0 {
                return Ok(None);
            }
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                return Ok(Some(trimmed.to_string()));
            }
        }
    }

    async fn write_line<T: Serialize>(&mut self, value: &T) -> Result<(), DaemonError> {
        let mut line = serde_json::to_string(value)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Checkpointer backed by the shared host pipes: writes the request line,
/// reads the acknowledgement, and maps the host's error string.
pub struct HostCheckpointer<R, W> {
    io: Arc<Mutex<HostIo<R, W>>>,
}

#[async_trait]
impl<R, W> Checkpointer for HostCheckpointer<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn checkpoint(
        &self,
        sequence_number: Option<&str>,
        sub_sequence_number: Option<u32>,
    ) -> Result<(), CheckpointError> {
        let mut io = self.io.lock().await;
        io.write_line(&CheckpointRequest {
            action: "checkpoint",
            sequence_number,
            sub_sequence_number,
        })
        .await
        .map_err(|e| CheckpointError::Other(e.to_string()))?;

        let line = io
            .read_line()
            .await
            .map_err(|e| CheckpointError::Other(e.to_string()))?
            .ok_or_else(|| CheckpointError::Other("host closed the pipe".to_string()))?;
        let ack: HostAction =
            serde_json::from_str(&line).map_err(|e| CheckpointError::Other(e.to_string()))?;

        match ack {
            HostAction::Checkpoint { error: None } => Ok(()),
            HostAction::Checkpoint { error: Some(error) } => {
                Err(CheckpointError::from_host_error(&error))
            }
            _ => Err(CheckpointError::Other(
                "host answered a checkpoint with a different action".to_string(),
            )),
        }
    }
}

/// Dispatch host actions to the processor until the host shuts us down or
/// closes stdin. Framing errors are the host's concern and abort the loop.
pub async fn run<P, R, W>(processor: &mut P, reader: R, writer: W) -> Result<(), DaemonError>
where
    P: ShardProcessor,
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let io = Arc::new(Mutex::new(HostIo { reader, writer }));
    let checkpointer: Arc<dyn Checkpointer> = Arc::new(HostCheckpointer {
        io: Arc::clone(&io),
    });

    loop {
        let line = { io.lock().await.read_line().await? };
        let Some(line) = line else {
            info!("host closed stdin, exiting");
            break;
        };

        match serde_json::from_str::<HostAction>(&line)? {
            HostAction::Initialize { shard_id } => {
                info!(shard_id = %shard_id, "initializing shard worker");
                processor
                    .initialize(&shard_id, Arc::clone(&checkpointer))
                    .await;
                respond(&io, "initialize").await?;
            }
            HostAction::ProcessRecords { records } => {
                processor.process_records(records).await;
                respond(&io, "processRecords").await?;
            }
            HostAction::Shutdown { reason } => {
                processor.shutdown(ShutdownReason::from_reason(&reason)).await;
                respond(&io, "shutdown").await?;
                break;
            }
            HostAction::Checkpoint { .. } => {
                warn!("checkpoint acknowledgement arrived outside a checkpoint call");
            }
        }
    }

    Ok(())
}

async fn respond<R, W>(io: &Arc<Mutex<HostIo<R, W>>>, response_for: &str) -> Result<(), DaemonError>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    io.lock()
        .await
        .write_line(&StatusResponse {
            action: "status",
            response_for,
        })
        .await
}
