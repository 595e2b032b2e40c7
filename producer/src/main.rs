use std::error::Error;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use shmqueue::writer::{QueueWriter, WriterConfig};

#[derive(clap::Parser)]
#[clap(about = "Pushes numbered elements into a shared memory queue")]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "shmqueue-producer.toml")]
    config: String,
    /// Elements to push; element i carries the decimal string of i.
    #[clap(short = 'n', long = "count", default_value_t = 10)]
    count: u64,
    #[clap(long = "interval-ms", default_value_t = 0)]
    interval_ms: u64,
    /// Pause before trying again when the queue is full.
    #[clap(long = "retry-ms", default_value_t = 10)]
    retry_ms: u64,
    #[clap(long = "max-retries", default_value_t = 100)]
    max_retries: u32,
}

fn main() -> Result<(), Box<dyn Error>> {
    init_logging();
    let opts: Opts = Opts::parse();
    let cfg: WriterConfig = confy::load_path(&opts.config)?;
    tracing::debug!(?cfg, "loaded producer config");
    let writer = &mut QueueWriter::new(&cfg)?;
    run(writer, &opts);
    Ok(())
}

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

fn run(writer: &mut QueueWriter, opts: &Opts) {
    let start = Instant::now();
    let interval = Duration::from_millis(opts.interval_ms);
    let mut pushed = 0u64;
    let mut dropped = 0u64;

    for i in 0..opts.count {
        let element = i.to_string();
        if push_with_retry(writer, element.as_bytes(), opts) {
            pushed += 1;
        } else {
            dropped += 1;
            tracing::warn!(element = %element, retries = opts.max_retries, "queue stayed full, dropping element");
        }
        if !interval.is_zero() {
            thread::sleep(interval);
        }
    }

    tracing::info!(
        name = %writer.name(),
        dropped,
        elapsed = ?start.elapsed(),
        stats = %writer.stats(),
        "push {} elements",
        pushed
    );
}

fn push_with_retry(writer: &mut QueueWriter, payload: &[u8], opts: &Opts) -> bool {
    for attempt in 0..=opts.max_retries {
        if writer.push(payload) {
            return true;
        }
        if attempt < opts.max_retries {
            thread::sleep(Duration::from_millis(opts.retry_ms));
        }
    }
    false
}
