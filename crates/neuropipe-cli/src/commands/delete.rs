use anyhow::{Context, Result};
use neuropipe_engine::{DeletePlan, Pipeline};

use super::{Format, parse_key, print_json};

pub fn delete(pipeline: &Pipeline, table: &str, key: &str, dry_run: bool, format: Format) -> Result<()> {
    let key = parse_key(key)?;
    let plan = pipeline
        .cascade()
        .delete(table, &key, dry_run)
        .with_context(|| format!("delete of {table} {key} aborted, nothing was removed"))?;
    match format {
        Format::Json => print_json(&plan),
        Format::Text => {
            print_plan(&plan);
            Ok(())
        }
    }
}

fn print_plan(plan: &DeletePlan) {
    if plan.is_empty() {
        println!("no rows of {} match {}", plan.table, plan.key);
        return;
    }
    let verb = if plan.dry_run { "would delete" } else { "deleted" };
    println!(
        "{verb} {} rows from {} tables for {} {}",
        plan.total_rows(),
        plan.steps.len(),
        plan.table,
        plan.key
    );
    for step in &plan.steps {
        println!("  {:<24} {:>6} rows  {:>4} commits", step.table, step.rows.len(), step.commits.len());
    }
    if !plan.conflicts.is_empty() {
        println!("blocked by running jobs:");
        for conflict in &plan.conflicts {
            println!("  {conflict}");
        }
    }
}

pub fn invalidate(pipeline: &Pipeline, table: &str, key: &str, format: Format) -> Result<()> {
    let key = parse_key(key)?;
    let report = pipeline.provenance().invalidate(table, &key)?;
    match format {
        Format::Json => print_json(&report),
        Format::Text => {
            println!(
                "invalidated {} {}: {} rows removed, run populate to recompute",
                report.table, report.key, report.rows_removed
            );
            Ok(())
        }
    }
}
