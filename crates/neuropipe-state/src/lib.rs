//! neuropipe-state: embedded row and ledger store.
//!
//! Backed by [redb](https://docs.rs/redb). Implements the
//! [`Storage`](neuropipe_core::Storage) interface: consistent read
//! snapshots and serializable write transactions over rows, commit
//! records, job reservations and failure records.
//!
//! `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and is shared by every populate worker.

pub mod error;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use store::{StateStore, StoreTxn, StoreView};
