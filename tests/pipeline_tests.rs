//! Whole-pipeline tests: host protocol in, Firehose batches out. The host is
//! scripted over in-memory pipes and the Firehose client is a capturing
//! double, so everything between stdin and the bulk-put call is real.

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::{TimeZone, Utc};
use firetap::batcher::{BatcherConfig, MessageBatcher};
use firetap::decode::Decoder;
use firetap::firehose::{FirehoseApi, FirehoseError};
use firetap::host::daemon;
use firetap::limiter::RateLimiter;
use firetap::processor::RecordProcessor;
use firetap::sender::FirehoseSender;
use firetap::sequence::FlushMark;
use firetap::stats::Counters;
use rusoto_firehose::{PutRecordBatchOutput, PutRecordBatchResponseEntry, Record};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

struct CapturingFirehose {
    batches: Mutex<Vec<Vec<String>>>,
}

impl CapturingFirehose {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            batches: Mutex::new(Vec::new()),
        })
    }

    fn batches(&self) -> Vec<Vec<String>> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl FirehoseApi for CapturingFirehose {
    async fn put_record_batch(
        &self,
        _stream_name: &str,
        records: Vec<Record>,
    ) -> Result<PutRecordBatchOutput, FirehoseError> {
        let count = records.len();
        self.batches.lock().unwrap().push(
            records
                .iter()
                .map(|r| String::from_utf8_lossy(&r.data).to_string())
                .collect(),
        );
        Ok(PutRecordBatchOutput {
            failed_put_count: 0,
            request_responses: (0..count)
                .map(|_| PutRecordBatchResponseEntry::default())
                .collect(),
            ..Default::default()
        })
    }
}

fn build_processor(
    firehose: Arc<CapturingFirehose>,
) -> (RecordProcessor, Arc<Counters>, FlushMark) {
    let counters = Arc::new(Counters::default());
    let mark = FlushMark::new();
    let sender = Arc::new(FirehoseSender::new(
        firehose,
        "test-stream".to_string(),
        Arc::clone(&counters),
        mark.clone(),
    ));
    let config = BatcherConfig::new(Duration::from_secs(3600), 500, 4 * 1024 * 1024).unwrap();
    let batcher = MessageBatcher::spawn(config, sender);
    let decoder = Decoder::new(
        "production".to_string(),
        false,
        false,
        Utc.timestamp_opt(0, 0).unwrap(),
    );
    let processor = RecordProcessor::new(
        batcher,
        RateLimiter::for_read_rate(10_000.0),
        decoder,
        None,
        Arc::clone(&counters),
        mark.clone(),
    );
    (processor, counters, mark)
}

fn encoded_record_line(line: &str, sequence_number: &str, sub: u32) -> String {
    format!(
        r#"{{"action":"processRecords","records":[{{"data":"{}","sequenceNumber":"{}","subSequenceNumber":{}}}]}}"#,
        general_purpose::STANDARD.encode(line),
        sequence_number,
        sub,
    )
}

#[tokio::test]
async fn terminate_flushes_and_finalizes_through_the_host() {
    let firehose = CapturingFirehose::new();
    let (mut processor, counters, _) = build_processor(firehose.clone());

    let (mut host_writes, worker_stdin) = tokio::io::duplex(8192);
    let (worker_stdout, host_reads) = tokio::io::duplex(8192);

    let host = tokio::spawn(async move {
        let mut reader = BufReader::new(host_reads);
        let mut line = String::new();

        host_writes
            .write_all(b"{\"action\":\"initialize\",\"shardId\":\"shardId-000\"}\n")
            .await
            .unwrap();
        reader.read_line(&mut line).await.unwrap();
        assert!(line.contains(r#""responseFor":"initialize""#));

        let record_line = encoded_record_line(
            "2017-01-02T03:04:05+00:00 ip-10-0-0-1 web-app[42]: hello world",
            "49568167373333333333333333333333333333333333333",
            7,
        );
        host_writes
            .write_all(format!("{record_line}\n").as_bytes())
            .await
            .unwrap();
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        assert!(line.contains(r#""responseFor":"processRecords""#));

        host_writes
            .write_all(b"{\"action\":\"shutdown\",\"reason\":\"TERMINATE\"}\n")
            .await
            .unwrap();

        // The worker flushes, then asks for a finalizing checkpoint.
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(
            line.trim(),
            r#"{"action":"checkpoint","sequenceNumber":null,"subSequenceNumber":null}"#
        );
        host_writes
            .write_all(b"{\"action\":\"checkpoint\",\"error\":null}\n")
            .await
            .unwrap();

        line.clear();
        reader.read_line(&mut line).await.unwrap();
        assert!(line.contains(r#""responseFor":"shutdown""#));
    });

    daemon::run(&mut processor, BufReader::new(worker_stdin), worker_stdout)
        .await
        .expect("daemon run");
    host.await.unwrap();

    let batches = firehose.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 1);
    let payload = &batches[0][0];
    assert!(payload.ends_with('\n'));
    let fields: serde_json::Value = serde_json::from_str(payload.trim()).unwrap();
    assert_eq!(fields["rawlog"], "hello world");
    assert_eq!(fields["hostname"], "ip-10-0-0-1");
    assert_eq!(fields["env"], "production");

    let snapshot = counters.snapshot();
    assert_eq!(snapshot.received, 1);
    assert_eq!(snapshot.sent, 1);
    assert_eq!(snapshot.failed, 0);
    assert!(snapshot.received >= snapshot.sent + snapshot.failed);
}

#[tokio::test]
async fn failover_shutdown_sends_and_checkpoints_nothing() {
    let firehose = CapturingFirehose::new();
    let (mut processor, counters, _) = build_processor(firehose.clone());

    let (mut host_writes, worker_stdin) = tokio::io::duplex(8192);
    let (worker_stdout, host_reads) = tokio::io::duplex(8192);

    let host = tokio::spawn(async move {
        let mut reader = BufReader::new(host_reads);
        let mut line = String::new();

        host_writes
            .write_all(b"{\"action\":\"initialize\",\"shardId\":\"shardId-000\"}\n")
            .await
            .unwrap();
        reader.read_line(&mut line).await.unwrap();

        let record_line = encoded_record_line(
            "2017-01-02T03:04:05+00:00 host app[1]: pending message",
            "99999",
            12345,
        );
        host_writes
            .write_all(format!("{record_line}\n").as_bytes())
            .await
            .unwrap();
        line.clear();
        reader.read_line(&mut line).await.unwrap();

        host_writes
            .write_all(b"{\"action\":\"shutdown\",\"reason\":\"ZOMBIE\"}\n")
            .await
            .unwrap();

        // Straight to the shutdown status; no checkpoint request in between.
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        assert!(line.contains(r#""responseFor":"shutdown""#));
    });

    daemon::run(&mut processor, BufReader::new(worker_stdin), worker_stdout)
        .await
        .expect("daemon run");
    host.await.unwrap();

    assert!(firehose.batches().is_empty());
    assert_eq!(counters.snapshot().received, 1);
    assert_eq!(counters.snapshot().sent, 0);
}

#[tokio::test]
async fn decode_failures_are_counted_not_fatal() {
    let firehose = CapturingFirehose::new();
    let (mut processor, counters, _) = build_processor(firehose.clone());

    let (mut host_writes, worker_stdin) = tokio::io::duplex(8192);
    let (worker_stdout, host_reads) = tokio::io::duplex(8192);

    let host = tokio::spawn(async move {
        let mut reader = BufReader::new(host_reads);
        let mut line = String::new();

        let bad = encoded_record_line("definitely not syslog", "1", 0);
        let good = encoded_record_line("2017-01-02T03:04:05+00:00 host app[1]: ok", "2", 0);
        host_writes
            .write_all(format!("{bad}\n{good}\n").as_bytes())
            .await
            .unwrap();
        reader.read_line(&mut line).await.unwrap();
        line.clear();
        reader.read_line(&mut line).await.unwrap();

        host_writes
            .write_all(b"{\"action\":\"shutdown\",\"reason\":\"FAILOVER\"}\n")
            .await
            .unwrap();
        line.clear();
        reader.read_line(&mut line).await.unwrap();
    });

    daemon::run(&mut processor, BufReader::new(worker_stdin), worker_stdout)
        .await
        .expect("daemon run");
    host.await.unwrap();

    let snapshot = counters.snapshot();
    assert_eq!(snapshot.received, 2);
    assert_eq!(snapshot.failed, 1);
    assert!(snapshot.received >= snapshot.sent + snapshot.failed);
}
