//! Pipeline context shared by every engine component.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use neuropipe_core::config::EngineConfig;
use neuropipe_core::{PipelineResult, Registry, Storage};
use tracing::debug;

use crate::cascade::CascadeDeleter;
use crate::catalog::ComputeCatalog;
use crate::error::{EngineError, EngineResult};
use crate::ingest::Ingestor;
use crate::jobs::JobLedger;
use crate::merge::MergeTables;
use crate::populate::Populator;
use crate::provenance::Provenance;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub workers: usize,
    pub liveness: Duration,
    pub reserve_jobs: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            liveness: Duration::from_secs(3600),
            reserve_jobs: true,
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &EngineConfig) -> PipelineResult<Self> {
        Ok(Self {
            workers: config.workers.max(1),
            liveness: config.liveness()?,
            reserve_jobs: config.reserve_jobs,
        })
    }
}

/// Registry, store and compute catalog behind cheap `Arc` clones.
#[derive(Clone)]
pub struct Pipeline {
    registry: Arc<Registry>,
    storage: Arc<dyn Storage>,
    catalog: Arc<ComputeCatalog>,
    settings: EngineSettings,
    worker_id: Arc<str>,
    reservations: Arc<AtomicU64>,
}

impl Pipeline {
    /// Fails when a table names a compute function missing from the catalog.
    pub fn new(
        registry: Registry,
        storage: Arc<dyn Storage>,
        catalog: ComputeCatalog,
    ) -> EngineResult<Self> {
        registry.graph()?;
        for table in registry.tables() {
            if let Some(compute) = &table.compute {
                if !catalog.contains(compute) {
                    return Err(EngineError::ComputeNotFound {
                        table: table.name.clone(),
                        compute: compute.clone(),
                    });
                }
            }
        }
        let worker_id = format!("{}:{}", host_name(), std::process::id());
        debug!(tables = registry.len(), %worker_id, "pipeline ready");
        Ok(Self {
            registry: Arc::new(registry),
            storage,
            catalog: Arc::new(catalog),
            settings: EngineSettings::default(),
            worker_id: worker_id.into(),
            reservations: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Override the worker id recorded in job owners (tests, multi-worker runs).
    pub fn with_worker_id(mut self, worker_id: &str) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn storage(&self) -> &dyn Storage {
        self.storage.as_ref()
    }

    pub fn catalog(&self) -> &ComputeCatalog {
        &self.catalog
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Unique owner id for one reservation.
    pub(crate) fn next_owner(&self) -> String {
        let n = self.reservations.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}#{n}", self.worker_id)
    }

    pub fn populator(&self) -> Populator {
        Populator::new(self.clone())
    }

    pub fn cascade(&self) -> CascadeDeleter {
        CascadeDeleter::new(self.clone())
    }

    pub fn provenance(&self) -> Provenance {
        Provenance::new(self.clone())
    }

    pub fn jobs(&self) -> JobLedger {
        JobLedger::new(self.clone())
    }

    pub fn merges(&self) -> MergeTables {
        MergeTables::new(self.clone())
    }

    pub fn ingestor(&self) -> Ingestor {
        Ingestor::new(self.clone())
    }
}

/// Current time in Unix milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub(crate) fn host_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
