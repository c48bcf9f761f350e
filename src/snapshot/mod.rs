//! Filesystem-backed snapshot persistence (spec.md §4.2/§4.9/§4.11).
//!
//! Split the way the teacher splits its own on-disk persistence concerns:
//! `store` is the low-level atomic JSON read/write + path layout (grounded
//! in `ddl/create.rs`/`ddl/drop.rs`'s "write new file / remove old file"
//! lifecycle pairing), `writer` is the canonical-document assembly plus
//! `index.json` maintenance (C9, grounded in `queue/persistence.rs`'s
//! serde round-trip shape), and `cache` is the fingerprinted procedure
//! cache (C11, grounded in `queue/cache.rs`'s load/invalidate/invalidate-all
//! pattern).

mod cache;
mod store;
mod writer;

pub use cache::CacheController;
pub use store::{PersistedObjectCache, RefreshPlanDocument, SnapshotStore};
pub use writer::SnapshotWriter;
