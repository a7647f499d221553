//! neuropipe-engine: decides what to compute, computes it once, and
//! removes it again.
//!
//! Every component holds a [`Pipeline`] (registry, store and compute
//! catalog behind `Arc`s) and is cheap to create per call:
//!
//! - [`Populator`] computes missing candidate keys with per-key failure
//!   isolation and job reservations.
//! - [`Provenance`] answers lineage and progress queries and invalidates
//!   single row-sets.
//! - [`CascadeDeleter`] removes rows with everything derived from them.
//! - [`JobLedger`] lists, ignores and recovers jobs and failures.
//! - [`MergeTables`] resolves merge rows back to their sources.
//! - [`Ingestor`] inserts Manual/Lookup rows and applies prepopulate files.

pub mod candidates;
pub mod cascade;
pub mod catalog;
pub mod error;
pub mod ingest;
pub mod jobs;
pub mod merge;
pub mod pipeline;
pub mod populate;
pub mod provenance;

pub use candidates::Candidate;
pub use cascade::{CascadeDeleter, DeletePlan, DeleteStep};
pub use catalog::{ComputeCatalog, ComputeError, ComputeFn, ComputeInput};
pub use error::{EngineError, EngineResult};
pub use ingest::{Ingestor, InsertReport};
pub use jobs::JobLedger;
pub use merge::{MergeTables, merge_id_for};
pub use pipeline::{EngineSettings, Pipeline, now_ms};
pub use populate::{KeyFailure, PopulateOptions, PopulateOrder, PopulateReport, Populator};
pub use provenance::{InvalidateReport, LineageEntry, Progress, Provenance};
