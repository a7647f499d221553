//! Read-mostly commands over the ledgers: lineage, jobs, failures, status.

use anyhow::Result;
use neuropipe_core::{JobStatus, KeyFilter, TableKind};
use neuropipe_engine::{Pipeline, Progress, now_ms};
use serde::Serialize;

use super::{Format, parse_key, print_json};

pub fn provenance(pipeline: &Pipeline, table: &str, key: &str, format: Format) -> Result<()> {
    let key = parse_key(key)?;
    let lineage = pipeline.provenance().provenance_of(table, &key)?;
    if format == Format::Json {
        return print_json(&lineage);
    }
    for entry in &lineage {
        let commit = entry
            .commit
            .map(|token| format!("  commit {token}"))
            .unwrap_or_default();
        println!(
            "{}{} {} ({}){commit}",
            "  ".repeat(entry.depth),
            entry.table,
            entry.key,
            entry.kind.label()
        );
    }
    Ok(())
}

pub fn jobs(pipeline: &Pipeline, table: Option<&str>, format: Format) -> Result<()> {
    let jobs = pipeline.jobs().jobs(table)?;
    if format == Format::Json {
        return print_json(&jobs);
    }
    if jobs.is_empty() {
        println!("no jobs");
    }
    let now = now_ms();
    let liveness = pipeline.settings().liveness;
    for job in &jobs {
        let state = match job.status {
            JobStatus::Ignored => "ignored",
            JobStatus::Reserved if job.is_stale(now, liveness) => "stale",
            JobStatus::Reserved => "reserved",
        };
        println!(
            "{:<8} {} {}  {} pid {} ({}s ago)",
            state,
            job.table,
            job.key,
            job.owner,
            job.pid,
            now.saturating_sub(job.reserved_at) / 1000
        );
    }
    Ok(())
}

pub fn failures(pipeline: &Pipeline, table: Option<&str>, clear: bool, format: Format) -> Result<()> {
    let ledger = pipeline.jobs();
    let failures = ledger.failures(table)?;
    if clear {
        let removed = ledger.clear_failures(table)?;
        if format == Format::Text {
            println!("cleared {removed} failure records");
            return Ok(());
        }
    }
    if format == Format::Json {
        return print_json(&failures);
    }
    if failures.is_empty() {
        println!("no failures");
    }
    for failure in &failures {
        println!(
            "{} {}  attempts {}: {}",
            failure.table, failure.key, failure.attempts, failure.reason
        );
    }
    Ok(())
}

pub fn ignore(pipeline: &Pipeline, table: &str, key: &str, clear: bool, format: Format) -> Result<()> {
    let key = parse_key(key)?;
    let ledger = pipeline.jobs();
    if clear {
        let existed = ledger.clear_job(table, &key)?;
        match format {
            Format::Json => print_json(&serde_json::json!({ "cleared": existed }))?,
            Format::Text if existed => println!("{table} {key} is eligible again"),
            Format::Text => println!("{table} {key} had no job record"),
        }
        return Ok(());
    }
    let job = ledger.ignore(table, &key)?;
    match format {
        Format::Json => print_json(&job),
        Format::Text => {
            println!("{table} {key} ignored until `neuropipe ignore --clear`");
            Ok(())
        }
    }
}

pub fn recover(pipeline: &Pipeline, format: Format) -> Result<()> {
    let recovered = pipeline.jobs().recover_stale_jobs(now_ms())?;
    if format == Format::Json {
        return print_json(&recovered);
    }
    println!("{} stale jobs recovered", recovered.len());
    for failure in &recovered {
        println!("  {} {}: {}", failure.table, failure.key, failure.reason);
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct TableStatus {
    table: String,
    kind: TableKind,
    rows: usize,
    progress: Option<Progress>,
    failures: usize,
    jobs: usize,
}

pub fn status(pipeline: &Pipeline, format: Format) -> Result<()> {
    let registry = pipeline.registry();
    let jobs = pipeline.jobs().jobs(None)?;
    let failures = pipeline.jobs().failures(None)?;
    let mut statuses = Vec::with_capacity(registry.len());
    for table in registry.graph()?.order() {
        let descriptor = registry.resolve(table)?;
        let rows = pipeline
            .storage()
            .snapshot()?
            .read_rows(table, &KeyFilter::All)?
            .len();
        let progress = if descriptor.kind.is_populated() {
            Some(pipeline.provenance().progress(table)?)
        } else {
            None
        };
        statuses.push(TableStatus {
            table: table.to_string(),
            kind: descriptor.kind,
            rows,
            progress,
            failures: failures.iter().filter(|f| f.table == table).count(),
            jobs: jobs.iter().filter(|j| j.table == table).count(),
        });
    }

    if format == Format::Json {
        return print_json(&statuses);
    }
    println!(
        "{:<24} {:<9} {:>8} {:>12} {:>8} {:>5}",
        "TABLE", "KIND", "ROWS", "POPULATED", "FAILED", "JOBS"
    );
    for s in &statuses {
        let progress = s
            .progress
            .map(|p| format!("{}/{}", p.populated, p.total))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<24} {:<9} {:>8} {:>12} {:>8} {:>5}",
            s.table,
            s.kind.label(),
            s.rows,
            progress,
            s.failures,
            s.jobs
        );
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct GraphNode<'a> {
    table: &'a str,
    kind: TableKind,
    upstream: Vec<&'a str>,
    downstream: Vec<&'a str>,
}

pub fn graph(pipeline: &Pipeline, format: Format) -> Result<()> {
    let registry = pipeline.registry();
    let graph = registry.graph()?;
    let mut nodes = Vec::with_capacity(graph.len());
    for table in graph.order() {
        nodes.push(GraphNode {
            table,
            kind: registry.resolve(table)?.kind,
            upstream: graph.upstream(table)?,
            downstream: graph.downstream(table)?,
        });
    }

    if format == Format::Json {
        return print_json(&nodes);
    }
    for node in &nodes {
        if node.upstream.is_empty() {
            println!("{} ({})", node.table, node.kind.label());
        } else {
            println!("{} ({}) <- {}", node.table, node.kind.label(), node.upstream.join(", "));
        }
    }
    Ok(())
}
