//! `neuropipe populate` and `neuropipe populate-all`.
//!
//! Ctrl-C stops new keys from starting; keys already running finish and
//! commit, and the report counts the rest as cancelled.

use anyhow::Result;
use clap::Args;
use neuropipe_core::Restriction;
use neuropipe_engine::{Pipeline, PopulateOptions, PopulateOrder, PopulateReport};
use tokio::sync::watch;
use tracing::warn;

use super::{Format, print_json};

#[derive(Args, Debug, Clone)]
pub struct PopulateArgs {
    /// Only keys matching this predicate, e.g. "session_id = 1 AND filter_name = 'low'"
    #[arg(short, long)]
    pub restriction: Option<Restriction>,
    /// Attempt at most N keys
    #[arg(long)]
    pub max_calls: Option<usize>,
    /// Key order: original, reverse or random
    #[arg(long, default_value = "original")]
    pub order: PopulateOrder,
    /// Compute without reserving job records
    #[arg(long)]
    pub no_reserve: bool,
    /// Keys computed concurrently (default: engine.workers)
    #[arg(short, long)]
    pub workers: Option<usize>,
}

impl PopulateArgs {
    fn options(&self) -> PopulateOptions {
        PopulateOptions {
            restriction: self.restriction.clone(),
            reserve_jobs: self.no_reserve.then_some(false),
            max_calls: self.max_calls,
            order: self.order,
            workers: self.workers,
        }
    }
}

pub async fn populate(pipeline: &Pipeline, table: &str, args: &PopulateArgs, format: Format) -> Result<()> {
    let populator = pipeline.populator().with_cancel(cancel_on_interrupt());
    let report = populator.populate(table, &args.options()).await?;
    match format {
        Format::Json => print_json(&report),
        Format::Text => {
            print_report(&report);
            Ok(())
        }
    }
}

pub async fn populate_all(
    pipeline: &Pipeline,
    from: Option<&str>,
    args: &PopulateArgs,
    format: Format,
) -> Result<()> {
    let populator = pipeline.populator().with_cancel(cancel_on_interrupt());
    let reports = populator.populate_downstream(from, &args.options()).await?;
    match format {
        Format::Json => print_json(&reports),
        Format::Text => {
            if reports.is_empty() {
                println!("nothing to populate");
            }
            for report in &reports {
                print_report(report);
            }
            let failed: usize = reports.iter().map(|r| r.failed).sum();
            if failed > 0 {
                println!("{failed} keys failed; see `neuropipe failures`");
            }
            Ok(())
        }
    }
}

fn print_report(report: &PopulateReport) {
    println!("{report}");
    for failure in &report.failures {
        println!("  ✗ {}: {}", failure.key, failure.reason);
    }
}

fn cancel_on_interrupt() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, waiting for running keys to finish");
            let _ = tx.send(true);
        }
    });
    rx
}
