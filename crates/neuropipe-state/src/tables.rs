//! redb table definitions for the neuropipe store.
//!
//! Record tables use `&str` keys and `&[u8]` values (JSON-serialized).
//! Every key has the form `{table}/{key_hash}`, so the records of one
//! pipeline table are found with a `{table}/` prefix scan.

use redb::TableDefinition;

/// Committed rows keyed by `{table}/{row_key_hash}`.
pub const ROWS: TableDefinition<&str, &[u8]> = TableDefinition::new("rows");

/// Commit records keyed by `{table}/{candidate_key_hash}`.
pub const COMMITS: TableDefinition<&str, &[u8]> = TableDefinition::new("commits");

/// Reserved and ignored jobs keyed by `{table}/{candidate_key_hash}`.
pub const JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");

/// Last failure per key, keyed by `{table}/{candidate_key_hash}`.
pub const FAILURES: TableDefinition<&str, &[u8]> = TableDefinition::new("failures");

/// Store counters.
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// META entry holding the token of the last committed write transaction.
pub const COMMIT_SEQ: &str = "commit_seq";

pub(crate) fn record_key(table: &str, key: &neuropipe_core::Key) -> String {
    format!("{table}/{}", key.hash_hex())
}

pub(crate) fn table_prefix(table: &str) -> String {
    format!("{table}/")
}
