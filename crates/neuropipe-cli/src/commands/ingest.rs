use std::path::Path;

use anyhow::Result;
use neuropipe_engine::{InsertReport, Pipeline};

use super::{Format, parse_row, print_json};

pub fn insert(pipeline: &Pipeline, table: &str, row: &str, skip_duplicates: bool, format: Format) -> Result<()> {
    let row = parse_row(pipeline.registry().resolve(table)?, row)?;
    let report = pipeline.ingestor().insert_rows(table, vec![row], skip_duplicates)?;
    print_insert(&report, format)
}

pub fn prepopulate(pipeline: &Pipeline, file: &Path, format: Format) -> Result<()> {
    let report = pipeline.ingestor().prepopulate_file(file)?;
    print_insert(&report, format)
}

fn print_insert(report: &InsertReport, format: Format) -> Result<()> {
    match format {
        Format::Json => print_json(report),
        Format::Text => {
            println!("{} inserted, {} already present", report.inserted, report.skipped);
            Ok(())
        }
    }
}
