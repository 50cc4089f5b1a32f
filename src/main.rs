use firetap::batcher::{BatcherConfig, MessageBatcher};
use firetap::config::Config;
use firetap::decode::Decoder;
use firetap::host::daemon;
use firetap::limiter::RateLimiter;
use firetap::processor::es::EsTransform;
use firetap::processor::sampler::DropStats;
use firetap::processor::RecordProcessor;
use firetap::sender::FirehoseSender;
use firetap::sequence::FlushMark;
use firetap::stats::Counters;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Flush triggers sit at the delivery stream's hard limits; the interval
// bounds how long a quiet shard can hold messages back.
const FLUSH_INTERVAL: Duration = Duration::from_secs(10);
const FLUSH_COUNT: usize = 500;
const FLUSH_SIZE: usize = 4 * 1024 * 1024;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;

    // stdout/stderr belong to the host protocol; all diagnostics go to the
    // configured log file.
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.log_file)?;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "firetap=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(Arc::new(log_file))
                .with_ansi(false),
        )
        .init();

    let counters = Arc::new(Counters::default());
    let flush_mark = FlushMark::new();

    let client = Arc::new(firetap::firehose::new_client(&config.firehose_region)?);
    let sender = Arc::new(FirehoseSender::new(
        client,
        config.firehose_stream_name.clone(),
        Arc::clone(&counters),
        flush_mark.clone(),
    ));

    let batcher_config = BatcherConfig::new(FLUSH_INTERVAL, FLUSH_COUNT, FLUSH_SIZE)?;
    let batcher = MessageBatcher::spawn(batcher_config, sender);

    let decoder = Decoder::new(
        config.deploy_env.clone(),
        config.stringify_nested,
        config.rename_es_reserved_fields,
        config.minimum_timestamp,
    );
    let es = config
        .is_elasticsearch_consumer
        .then(|| EsTransform::new(DropStats::spawn()));

    let mut processor = RecordProcessor::new(
        batcher,
        RateLimiter::for_read_rate(config.read_rate_limit),
        decoder,
        es,
        counters,
        flush_mark,
    );

    daemon::run(
        &mut processor,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await?;

    Ok(())
}
