pub mod config;
pub mod error;
pub mod graph;
pub mod key;
pub mod ledger;
pub mod registry;
pub mod restriction;
pub mod row;
pub mod storage;
pub mod table;
pub mod value;

pub use config::PipelineManifest;
pub use error::{PipelineError, PipelineResult};
pub use graph::DependencyGraph;
pub use key::{Key, scoped_digest};
pub use ledger::{CommitRecord, CommitToken, FailureRecord, JobRecord, JobStatus};
pub use registry::Registry;
pub use restriction::{CompareOp, Restriction};
pub use row::{Row, TableKey};
pub use storage::{KeyFilter, Storage, StorageTxn, StorageView};
pub use table::{MERGE_ID, MERGE_SOURCE, TableDescriptor, TableKind};
pub use value::{BlobRef, Value};
