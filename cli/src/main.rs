use clap::{Parser, Subcommand};
use r4_core::context::{self, init_context};
use r4_core::oid;
use r4_core::test_utils::{MockPage, MockPageCache, MockTxnManager};
use r4_core::{MountOptions, VolumeConfig, WritebackControl};
use r4_daemon::{Submission, Volume, VolumeStats};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "r4ctl")]
#[command(about = "Transaction context and daemon workbench", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the default volume configuration as JSON
    Config,
    /// Mount an in-memory volume and run a writer workload against it
    Simulate {
        /// Number of writer threads
        #[arg(short, long, default_value_t = 4)]
        threads: u64,
        /// Operations per writer thread
        #[arg(short, long, default_value_t = 100)]
        ops: u64,
        /// Volume configuration file (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    threads: u64,
    ops_per_thread: u64,
    elapsed_ms: u128,
    oids_exhausted: u64,
    blocked_submissions: u64,
    volume: VolumeStats,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// One writer thread: enter a context, create an object, dirty it, hand
/// its page to the ent daemon.
fn writer(volume: &Volume, thread: u64, ops: u64) -> (u64, u64) {
    let sb = volume.sb();
    let sentinel = oid::oid_sentinel(sb);
    let mut exhausted = 0;
    let mut blocked = 0;

    for op in 0..ops {
        let ctx = init_context(sb);
        let id = oid::oid_allocate(sb);
        if id == sentinel {
            exhausted += 1;
        } else {
            oid::oid_count_allocated();
            context::mark_dirty();
        }
        ctx.exit();

        let page = MockPage::new(thread << 32 | op);
        if volume.entd().write_page_by_ent(page, &WritebackControl::new(1)) == Submission::Completed {
            blocked += 1;
        }
        if op % 16 == 15 {
            if let Err(e) = volume.ktxnmgrd().kick() {
                tracing::warn!("writer-{}: {}", thread, e);
            }
        }
    }
    (exhausted, blocked)
}

fn simulate(threads: u64, ops: u64, config: VolumeConfig) -> anyhow::Result<SimulationReport> {
    let txn = Arc::new(MockTxnManager::new());
    txn.set_blocks_per_flush(8);
    let options = MountOptions {
        name: "sim".to_string(),
        config,
        ..MountOptions::default()
    };
    let volume = Arc::new(Volume::mount(txn, Arc::new(MockPageCache::new()), options)?);

    let started = Instant::now();
    let handles = (0..threads)
        .map(|t| {
            let volume = Arc::clone(&volume);
            std::thread::Builder::new()
                .name(format!("writer-{}", t))
                .spawn(move || writer(&volume, t, ops))
        })
        .collect::<std::io::Result<Vec<_>>>()?;

    let mut oids_exhausted = 0;
    let mut blocked_submissions = 0;
    for handle in handles {
        let (exhausted, blocked) = handle
            .join()
            .map_err(|_| anyhow::anyhow!("writer thread panicked"))?;
        oids_exhausted += exhausted;
        blocked_submissions += blocked;
    }
    let elapsed_ms = started.elapsed().as_millis();

    volume.unmount();
    Ok(SimulationReport {
        threads,
        ops_per_thread: ops,
        elapsed_ms,
        oids_exhausted,
        blocked_submissions,
        volume: volume.stats(),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&VolumeConfig::default())?);
        }
        Commands::Simulate {
            threads,
            ops,
            config,
        } => {
            let config = match config {
                Some(path) => VolumeConfig::from_json_file(&path)
                    .map_err(|e| anyhow::anyhow!("{}: {}", path.display(), e))?,
                None => VolumeConfig::default(),
            };
            if threads == 0 {
                anyhow::bail!("--threads must be at least 1");
            }

            tracing::info!("Simulating {} writers x {} operations", threads, ops);
            let report = tokio::task::spawn_blocking(move || simulate(threads, ops, config)).await??;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
