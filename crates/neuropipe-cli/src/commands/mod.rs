//! Subcommand implementations. Every command except `init` runs against
//! the pipeline described by the manifest given with `--config`.

pub mod audit;
pub mod delete;
pub mod ingest;
pub mod init;
pub mod populate;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use neuropipe_core::{Key, PipelineManifest, Row, TableDescriptor};
use neuropipe_engine::{ComputeCatalog, EngineSettings, Pipeline};
use neuropipe_state::StateStore;
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Text,
    Json,
}

impl Format {
    pub fn parse(s: &str) -> Self {
        match s {
            "json" => Format::Json,
            _ => Format::Text,
        }
    }
}

/// Load the manifest, open its store and assemble the pipeline.
///
/// A relative store path is resolved against the manifest's directory.
pub fn open(config: &Path) -> Result<Pipeline> {
    let manifest = PipelineManifest::from_file(config)
        .with_context(|| format!("cannot load manifest {} (run `neuropipe init`?)", config.display()))?;
    let registry = manifest.registry()?;
    let settings = EngineSettings::from_config(&manifest.engine)?;

    let store = if manifest.store.in_memory {
        StateStore::open_in_memory()?
    } else {
        let base = config.parent().unwrap_or_else(|| Path::new("."));
        let path = manifest.store.resolve_path(base);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("cannot create {}", dir.display()))?;
        }
        let store = StateStore::open(&path)
            .with_context(|| format!("cannot open store {}", path.display()))?;
        info!(path = %path.display(), "state store opened");
        store
    };

    let pipeline = Pipeline::new(registry, Arc::new(store), ComputeCatalog::with_builtins())?
        .with_settings(settings);
    info!(pipeline = %manifest.pipeline.name, tables = pipeline.registry().len(), "pipeline loaded");
    Ok(pipeline)
}

pub fn parse_key(s: &str) -> Result<Key> {
    s.parse::<Key>().with_context(|| format!("bad key {s:?}"))
}

/// Split `name=value` pairs into the table's key and secondary attributes.
pub fn parse_row(table: &TableDescriptor, s: &str) -> Result<Row> {
    let fields = parse_key(s)?;
    let mut row = Row::new(fields.project(&table.primary_key));
    for (name, value) in fields.iter() {
        if !table.primary_key.iter().any(|a| a == name) {
            row.attributes.insert(name.to_string(), value.clone());
        }
    }
    Ok(row)
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use neuropipe_core::Value;

    #[test]
    fn rows_split_on_the_primary_key() {
        let table = TableDescriptor::manual("Session", &["session_id"]).with_attributes(&["subject"]);
        let row = parse_row(&table, "session_id=3,subject=rat3").unwrap();
        assert_eq!(row.key, Key::new().with("session_id", 3));
        assert_eq!(row.get("subject"), Some(&Value::text("rat3")));
        assert!(parse_row(&table, "session_id").is_err());
    }

    #[test]
    fn open_creates_the_store_next_to_the_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("neuropipe.toml");
        init::init(&config, "ephys", false).unwrap();

        let pipeline = open(&config).unwrap();
        assert_eq!(pipeline.registry().len(), 3);
        assert!(dir.path().join("ephys.redb").exists());
    }

    #[test]
    fn missing_manifest_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let Err(err) = open(&dir.path().join("absent.toml")) else {
            panic!("opening a missing manifest succeeded");
        };
        assert!(err.to_string().contains("cannot load manifest"));
    }
}
