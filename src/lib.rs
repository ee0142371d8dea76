//! A persistent, authenticated key/value store built on a nibble-addressed
//! radix Merkle trie.
//!
//! The entire store is summarized by a 32-byte root digest. Writes are staged
//! in layered [`TrieView`]s and folded into the base atomically on commit;
//! recent root transitions are retained in a bounded history ring so the
//! database can prove not just what it contains ([`Proof`], [`RangeProof`])
//! but exactly what changed between two recent roots ([`ChangeProof`]).
//! Storage is delegated to any [`ByteStore`] implementation; [`MemStore`]
//! ships as the in-memory reference backend.

pub mod cache;
pub mod cancel;
pub mod changes;
pub mod constant;
pub mod db;
pub mod error;
pub mod history;
pub mod mem_store;
pub mod metrics;
pub mod node;
pub mod path;
pub mod proof;
pub mod traits;
pub mod types;

mod overlay;
mod view;

pub use cancel::CancelToken;
pub use changes::ChangeSet;
pub use db::{Batch, Config, MerkleDb};
pub use error::{MerkleError, StoreError};
pub use mem_store::MemStore;
pub use metrics::TrieMetrics;
pub use node::{Child, Node};
pub use path::Path;
pub use proof::{ChangeProof, Proof, RangeProof};
pub use traits::{ByteStore, ReadOnlyTrie, WriteBatch};
pub use types::{BatchOp, TrieHash};
pub use view::TrieView;
