use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use tracing_subscriber::EnvFilter;

use shmqueue::reader::{QueueReader, ReaderConfig};

#[derive(clap::Parser)]
#[clap(about = "Drains a shared memory queue and logs every element")]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "shmqueue-consumer.toml")]
    config: String,
    /// Keep polling after the queue runs empty, until a termination signal.
    #[clap(short = 'f', long = "follow")]
    follow: bool,
    #[clap(long = "poll-ms", default_value_t = 100)]
    poll_ms: u64,
    /// Stats report period while following; 0 turns reports off.
    #[clap(long = "stats-secs", default_value_t = 10)]
    stats_secs: u64,
}

fn main() -> Result<(), Box<dyn Error>> {
    init_logging();
    let opts: Opts = Opts::parse();
    let cfg: ReaderConfig = confy::load_path(&opts.config)?;
    tracing::debug!(?cfg, "loaded consumer config");
    let reader = &mut QueueReader::new(&cfg)?;

    let closing = Arc::new(AtomicBool::new(false));
    for signal in [SIGHUP, SIGINT, SIGQUIT, SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&closing))?;
    }

    let consumed = run(reader, &opts, &closing);
    if closing.load(Ordering::Relaxed) {
        tracing::info!("The process has been killed.");
    }
    tracing::info!(
        name = %reader.name(),
        consumed,
        emergency_resets = reader.emergency_resets(),
        stats = %reader.stats(),
        "consumer finished"
    );
    Ok(())
}

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

fn run(reader: &mut QueueReader, opts: &Opts, closing: &AtomicBool) -> u64 {
    let poll = Duration::from_millis(opts.poll_ms);
    let stats_every = Duration::from_secs(opts.stats_secs);
    let mut next_stat_report = Instant::now() + stats_every;
    let mut consumed = 0u64;

    loop {
        while !closing.load(Ordering::Relaxed) {
            let element = reader.read(|buff| {
                tracing::info!(element = %String::from_utf8_lossy(buff), len = buff.len(), "element");
            });
            if element.is_none() {
                break;
            }
            consumed += 1;
        }

        if !opts.follow || closing.load(Ordering::Relaxed) {
            return consumed;
        }

        if opts.stats_secs > 0 && Instant::now() >= next_stat_report {
            tracing::info!(name = %reader.name(), consumed, stats = %reader.stats(), "shm queue stats");
            next_stat_report = Instant::now() + stats_every;
        }
        thread::sleep(poll);
    }
}
