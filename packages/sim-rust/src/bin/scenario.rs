//! Deterministic scenario runner.
//!
//! Boots a small three-region fleet with one deliberately stale-clocked
//! node, drives seeded delivery traffic while a background loop captures
//! channel snapshots, injects one forced stale delivery, and finishes with a
//! hierarchical snapshot, a diff, and a run summary document.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use courier_core::value::Value;
use courier_sim::{
    persist_json_atomic, read_json_lines, setup_global_fleet, spawn_snapshot_loop,
    HierarchicalOrchestrator, ShutdownController, SimConfig,
};

const PACKAGE_STATES: [&str; 5] = ["CREATED", "SENT", "IN_TRANSIT", "RECEIVED", "DELIVERED"];

#[derive(Debug, Clone, Parser)]
#[command(name = "scenario", about = "Run a deterministic delivery scenario")]
struct Args {
    /// Directory for journals and snapshot documents.
    #[arg(long, default_value = "logs", env = "COURIER_LOG_DIR")]
    log_dir: PathBuf,

    /// How long to drive traffic, in seconds.
    #[arg(long, default_value_t = 20)]
    duration_secs: u64,

    /// Seed for the traffic generator.
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Simulated per-hop latency in milliseconds.
    #[arg(long, default_value_t = 25)]
    latency_ms: u64,

    /// Seconds between background channel snapshots.
    #[arg(long, default_value_t = 10)]
    snapshot_interval_secs: u64,

    /// Build the full seven-continent fleet instead of the small demo fleet.
    #[arg(long)]
    global: bool,

    /// Nodes per region when --global is set.
    #[arg(long, default_value_t = 200)]
    nodes_per_region: usize,
}

#[derive(Debug, Serialize)]
struct RunSummary {
    deliveries: usize,
    rejected: usize,
    anomalies: usize,
    packages: usize,
    added: usize,
    updated: usize,
}

/// Three regions, ten nodes, one stale clock in APAC.
fn setup_demo_fleet(orchestrator: &HierarchicalOrchestrator) -> anyhow::Result<()> {
    let fleet: [(&str, usize); 3] = [("Europe", 4), ("US-East", 3), ("APAC", 3)];
    for (region, count) in fleet {
        orchestrator.add_region(region);
        for i in 1..=count {
            // APAC-N1 runs 15 s behind wall time to force drift and
            // out-of-order anomalies during the run.
            let offset = if region == "APAC" && i == 1 { -15_000 } else { 0 };
            orchestrator.add_node(&format!("{region}-N{i}"), region, offset)?;
        }
    }
    Ok(())
}

fn run_traffic(
    orchestrator: &HierarchicalOrchestrator,
    args: &Args,
    stop: &AtomicBool,
) -> (usize, usize) {
    let mut rng = StdRng::seed_from_u64(args.seed);
    let node_ids = orchestrator.node_ids();
    let deadline = Instant::now() + Duration::from_secs(args.duration_secs);

    let mut deliveries = 0;
    let mut rejected = 0;
    let mut batch = 0_u64;

    while Instant::now() < deadline && !stop.load(Ordering::Relaxed) {
        let src = node_ids.choose(&mut rng).cloned().unwrap_or_default();
        let dst = node_ids.choose(&mut rng).cloned().unwrap_or_default();
        if src == dst {
            continue;
        }

        batch += 1;
        let package_id = format!("PKG{}_{:04}", batch, rng.random_range(0..10_000));
        for state in PACKAGE_STATES {
            let payload = Value::object([("status", Value::from(state))]);
            match orchestrator.send(&src, &dst, &package_id, payload, Some(args.latency_ms)) {
                Ok(record) => {
                    deliveries += 1;
                    if !record.applied {
                        rejected += 1;
                    }
                }
                Err(err) => tracing::warn!(%err, "scenario send failed"),
            }
        }
    }

    (deliveries, rejected)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = SimConfig::with_log_dir(&args.log_dir);
    let orchestrator =
        Arc::new(HierarchicalOrchestrator::new(config).context("create orchestrator")?);

    if args.global {
        setup_global_fleet(&orchestrator, args.nodes_per_region).context("global fleet")?;
    } else {
        setup_demo_fleet(&orchestrator).context("demo fleet")?;
    }
    tracing::info!(
        nodes = orchestrator.node_ids().len(),
        regions = orchestrator.region_ids().len(),
        "fleet ready"
    );

    let controller = ShutdownController::new();
    controller.set_running();
    let snapshot_loop = spawn_snapshot_loop(
        Arc::clone(&orchestrator),
        Duration::from_secs(args.snapshot_interval_secs),
        &controller,
    );

    let stop = Arc::new(AtomicBool::new(false));
    let traffic = {
        let orchestrator = Arc::clone(&orchestrator);
        let stop = Arc::clone(&stop);
        let args = args.clone();
        tokio::task::spawn_blocking(move || run_traffic(&orchestrator, &args, &stop))
    };

    let (deliveries, rejected) = tokio::select! {
        result = traffic => result.context("traffic task")?,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupted; stopping traffic");
            stop.store(true, Ordering::Relaxed);
            (0, 0)
        }
    };

    controller.trigger_shutdown();
    controller.wait_for_drain(Duration::from_secs(5)).await;
    snapshot_loop.await.context("snapshot loop")?;

    let (merged, diff) = orchestrator.snapshot_and_diff();
    let anomalies = read_json_lines(orchestrator.detector().journal_path())
        .map(|records| records.len())
        .unwrap_or(0);

    let summary = RunSummary {
        deliveries,
        rejected,
        anomalies,
        packages: merged.len(),
        added: diff.added.len(),
        updated: diff.updated.len(),
    };
    let summary_path = args.log_dir.join("run_summary.json");
    persist_json_atomic(&summary_path, &summary).context("write run summary")?;

    tracing::info!(
        deliveries = summary.deliveries,
        rejected = summary.rejected,
        anomalies = summary.anomalies,
        packages = summary.packages,
        summary = %summary_path.display(),
        "scenario complete"
    );
    Ok(())
}
