use std::path::PathBuf;
use std::process::exit;
use std::time::{Duration, Instant};

use clap::Parser;
use log::{error, info};
use rand::prelude::*;

use machi::{Locator, MachiStore, Result};

#[derive(Parser)]
#[command(name = "machi-bench", version, about = "Append/get benchmark for the machi store")]
struct Cli {
    /// Rotation watermark in appends per generation
    #[arg(long, default_value_t = 65536)]
    maxlen: u64,

    /// Data directory
    #[arg(long, default_value = "/tmp/machi-bench")]
    dir: PathBuf,

    /// Number of appends to perform; runs until interrupted when omitted
    #[arg(long)]
    ops: Option<u64>,
}

fn main() {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .target(env_logger::Target::Stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        error!("{}", e);
        exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    info!("machi-bench {}", env!("CARGO_PKG_VERSION"));
    info!("Data directory: {}", cli.dir.display());

    let store = MachiStore::open(&cli.dir, cli.maxlen, false)?;
    let mut append_stats = Stats::new("append time");
    let mut sample_stats = Stats::new("sample time");
    let mut keys: Vec<(Locator, u64)> = Vec::new();
    let mut rng = thread_rng();
    let mut last_report = Instant::now();
    let mut done = 0u64;

    while cli.ops.map_or(true, |ops| done < ops) {
        let value: u64 = rng.gen_range(0..345_678);
        let payload = value.to_string().into_bytes();

        let begin = Instant::now();
        let loc = store.append(&payload)?;
        append_stats.record(begin.elapsed());
        keys.push((loc, value));
        done += 1;

        if keys.len() > 10 {
            let begin = Instant::now();
            for _ in 0..10 {
                let (loc, value) = keys[rng.gen_range(0..keys.len())];
                let data = store.get(loc)?.expect("entries are never trimmed");
                assert_eq!(data, value.to_string().into_bytes());
            }
            sample_stats.record(begin.elapsed());
        }

        if last_report.elapsed() >= Duration::from_secs(1) {
            append_stats.report();
            sample_stats.report();
            last_report = Instant::now();
        }
    }

    append_stats.report();
    sample_stats.report();
    store.close()
}

/// Running mean of recorded durations.
struct Stats {
    name: &'static str,
    total: Duration,
    count: u64,
}

impl Stats {
    fn new(name: &'static str) -> Stats {
        Stats {
            name,
            total: Duration::ZERO,
            count: 0,
        }
    }

    fn record(&mut self, elapsed: Duration) {
        self.total += elapsed;
        self.count += 1;
    }

    fn report(&self) {
        if self.count > 0 {
            info!(
                "{}: {:?} mean over {} ops",
                self.name,
                self.total / self.count as u32,
                self.count
            );
        }
    }
}
