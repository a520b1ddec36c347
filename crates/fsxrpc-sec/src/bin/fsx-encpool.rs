#![warn(missing_docs)]
//! Drives a synthetic multi-threaded workload against the bulk page pool
//! and prints its statistics.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use fsxrpc_sec::{BulkDesc, CallerRole, EncPagePool, PoolConfig, PoolError, Shrinker};
use rand::Rng;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "fsx-encpool", about = "Exercise the fsxrpc bulk page pool")]
struct Args {
    /// Pool configuration file (.toml or .json); defaults plus environment otherwise.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Largest request, in pages.
    #[arg(long, default_value_t = 256)]
    pages: usize,

    /// Requests per thread.
    #[arg(long, default_value_t = 1000)]
    iterations: usize,

    /// Override the pool capacity in pages.
    #[arg(long)]
    max_pages: Option<usize>,

    /// Run workers as background callers that never wait.
    #[arg(long)]
    background: bool,

    /// Print statistics as JSON.
    #[arg(long)]
    json: bool,
}

fn worker(pool: &EncPagePool, args: &Args, role: CallerRole) -> Result<u64, PoolError> {
    let mut rng = rand::thread_rng();
    let largest = args.pages.clamp(1, pool.max_pages());
    let mut refused = 0;

    for _ in 0..args.iterations {
        let mut desc = BulkDesc::new(rng.gen_range(1..=largest));
        match pool.get_pages(&mut desc, role) {
            Ok(()) => {
                if let Some(pages) = desc.enc_pages_mut() {
                    for page in pages.iter_mut() {
                        page[0] = page[0].wrapping_add(1);
                    }
                }
                pool.put_pages(&mut desc);
            }
            Err(PoolError::OutOfMemory { .. }) => refused += 1,
            Err(e) => return Err(e),
        }
    }
    Ok(refused)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => PoolConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => PoolConfig::from_env()?,
    };
    if let Some(max_pages) = args.max_pages {
        config.max_pages = Some(max_pages);
        config.validate()?;
    }

    let pool = EncPagePool::new(config)?;
    pool.add_user()?;

    let role = if args.background {
        CallerRole::Background
    } else {
        CallerRole::Request
    };
    info!(
        threads = args.threads,
        iterations = args.iterations,
        max_pages = pool.max_pages(),
        ?role,
        "starting workload"
    );

    let started = Instant::now();
    let (pool_ref, args_ref) = (&pool, &args);
    let results: Vec<Result<u64, PoolError>> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..args.threads)
            .map(|_| s.spawn(move || worker(pool_ref, args_ref, role)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|p| std::panic::resume_unwind(p)))
            .collect()
    });

    let mut refused = 0;
    for r in results {
        refused += r?;
    }
    if refused > 0 {
        warn!(refused, "requests refused by the pool");
    }
    info!(elapsed_ms = started.elapsed().as_millis() as u64, "workload done");

    let reclaimable = pool.count_objects();
    let freed = pool.scan_objects(reclaimable);
    info!(reclaimable, freed, "shrink pass");
    pool.del_user();

    let stats = pool.stats();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        print!("{}", stats);
    }
    Ok(())
}
