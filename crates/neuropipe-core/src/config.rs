//! neuropipe.toml manifest parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::registry::Registry;
use crate::table::TableDescriptor;
use crate::value::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineManifest {
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub tables: Vec<TableDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database file, relative to the manifest directory.
    pub path: Option<String>,
    /// Keep everything in memory (tests and dry experiments).
    #[serde(default)]
    pub in_memory: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Keys computed concurrently by one populate call.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Age after which a reserved job counts as abandoned, e.g. "30m".
    #[serde(default = "default_liveness_window")]
    pub liveness_window: String,
    /// Reserve a job record per key before computing it.
    #[serde(default = "default_reserve_jobs")]
    pub reserve_jobs: bool,
}

fn default_workers() -> usize {
    4
}

fn default_liveness_window() -> String {
    "1h".to_string()
}

fn default_reserve_jobs() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            liveness_window: default_liveness_window(),
            reserve_jobs: default_reserve_jobs(),
        }
    }
}

impl EngineConfig {
    pub fn liveness(&self) -> PipelineResult<Duration> {
        parse_duration(&self.liveness_window)
    }
}

impl StoreConfig {
    /// Resolve the database path against the manifest directory.
    pub fn resolve_path(&self, base_dir: &Path) -> PathBuf {
        let path = self.path.as_deref().unwrap_or("neuropipe.redb");
        base_dir.join(path)
    }
}

impl PipelineManifest {
    pub fn from_file(path: &Path) -> PipelineResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::Config(format!("{}: {e}", path.display())))?;
        content.parse()
    }

    pub fn to_toml_string(&self) -> PipelineResult<String> {
        toml::to_string_pretty(self).map_err(|e| PipelineError::Config(e.to_string()))
    }

    /// Build the registry; tables may be declared in any order.
    pub fn registry(&self) -> PipelineResult<Registry> {
        Registry::from_descriptors(self.tables.clone())
    }

    /// A starter manifest: sessions, a filter parameter set, and the
    /// filtered signal computed from both.
    pub fn scaffold(name: &str) -> Self {
        PipelineManifest {
            pipeline: PipelineSection {
                name: name.to_string(),
                description: Some("ephys preprocessing".to_string()),
            },
            store: StoreConfig {
                path: Some(format!("{name}.redb")),
                in_memory: false,
            },
            engine: EngineConfig::default(),
            tables: vec![
                TableDescriptor::manual("Session", &["session_id"]).with_attributes(&["subject"]),
                TableDescriptor::lookup("FilterParams", &["filter_name"])
                    .with_attributes(&["cutoff_hz"]),
                TableDescriptor::computed(
                    "FilteredSignal",
                    &["session_id", "filter_name"],
                    &["Session", "FilterParams"],
                    "passthrough",
                )
                .with_attributes(&["cutoff_hz", "order"])
                .with_param("order", Value::Int(4)),
            ],
        }
    }
}

impl std::str::FromStr for PipelineManifest {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).map_err(|e| PipelineError::Config(e.to_string()))
    }
}

/// Parse durations written as `<number><unit>` with unit ms, s, m, h, or d.
pub fn parse_duration(s: &str) -> PipelineResult<Duration> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| PipelineError::Config(format!("duration {s:?} has no unit")))?;
    let (number, unit) = s.split_at(split);
    let n: u64 = number
        .parse()
        .map_err(|_| PipelineError::Config(format!("invalid duration {s:?}")))?;
    let seconds_per_unit = match unit {
        "ms" => return Ok(Duration::from_millis(n)),
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86_400,
        other => {
            return Err(PipelineError::Config(format!(
                "unknown duration unit {other:?} in {s:?}"
            )));
        }
    };
    n.checked_mul(seconds_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(|| PipelineError::Config(format!("duration {s:?} is out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaffold() {
        let manifest = PipelineManifest::scaffold("ephys");
        let toml_str = manifest.to_toml_string().unwrap();
        assert!(toml_str.contains("FilteredSignal"));

        let back: PipelineManifest = toml_str.parse().unwrap();
        assert_eq!(back.tables.len(), 3);
        assert_eq!(back.registry().unwrap().len(), 3);
    }

    #[test]
    fn test_parse_minimal() {
        let manifest: PipelineManifest = r#"
[pipeline]
name = "test"
"#
        .parse()
        .unwrap();
        assert_eq!(manifest.pipeline.name, "test");
        assert_eq!(manifest.engine.workers, 4);
        assert!(manifest.engine.reserve_jobs);
        assert_eq!(manifest.engine.liveness().unwrap(), Duration::from_secs(3600));
        assert!(manifest.tables.is_empty());
    }

    #[test]
    fn test_tables_in_any_order() {
        let manifest: PipelineManifest = r#"
[pipeline]
name = "test"

[engine]
workers = 2
liveness_window = "90s"

[[tables]]
name = "Position"
kind = "computed"
primary_key = ["session_id"]
upstream = ["Session"]
compute = "passthrough"

[[tables]]
name = "Session"
kind = "manual"
primary_key = ["session_id"]
"#
        .parse()
        .unwrap();
        assert_eq!(manifest.engine.liveness().unwrap(), Duration::from_secs(90));
        let registry = manifest.registry().unwrap();
        assert_eq!(registry.graph().unwrap().order(), vec!["Session", "Position"]);
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2d").unwrap(), Duration::from_secs(172_800));
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("3w").is_err());
        assert_eq!(parse_duration(&format!("{}s", u64::MAX)).unwrap(), Duration::from_secs(u64::MAX));
        let err = parse_duration(&format!("{}d", u64::MAX / 1000)).unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn store_path_resolves_against_manifest_dir() {
        let store = StoreConfig::default();
        assert_eq!(
            store.resolve_path(Path::new("/data")),
            PathBuf::from("/data/neuropipe.redb")
        );
    }
}
