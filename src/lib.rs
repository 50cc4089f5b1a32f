//! Per-shard stream worker: consumes records from a Kinesis shard through the
//! host daemon's stdin/stdout protocol, decodes and enriches each log line,
//! accumulates the results into bounded batches, and bulk-delivers them to a
//! Firehose stream with partial-failure retry. Progress is reported back to the
//! host as a monotonically advancing checkpoint.

pub mod batcher;
pub mod config;
pub mod decode;
pub mod firehose;
pub mod host;
pub mod limiter;
pub mod processor;
pub mod sender;
pub mod sequence;
pub mod splitter;
pub mod stats;
