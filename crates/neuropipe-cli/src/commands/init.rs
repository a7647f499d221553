use std::path::Path;

use anyhow::{Result, bail};
use neuropipe_core::PipelineManifest;

const SAMPLE_ENTRIES: &str = r#"# Apply with `neuropipe prepopulate entries.toml`.

[[FilterParams]]
filter_name = "low"
cutoff_hz = 300

[[FilterParams]]
filter_name = "high"
cutoff_hz = 6000

[[Session]]
session_id = 1
subject = "rat1"
"#;

/// Write a scaffold manifest, plus `entries.toml` beside it unless one exists.
pub fn init(config: &Path, name: &str, force: bool) -> Result<()> {
    if config.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", config.display());
    }
    let manifest = PipelineManifest::scaffold(name);
    manifest.registry()?;
    std::fs::write(config, manifest.to_toml_string()?)?;
    println!("✓ Generated {}", config.display());

    let entries = config
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("entries.toml");
    if !entries.exists() {
        std::fs::write(&entries, SAMPLE_ENTRIES)?;
        println!("✓ Generated {}", entries.display());
    }
    Ok(())
}
