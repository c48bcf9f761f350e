//! `InvalidationOrchestrator` — diffs the live catalog against the
//! persisted object cache, updates the dependency graph, and produces a
//! schema-batched refresh plan (C5, spec.md §4.5).
//!
//! Grounded in the teacher's `propagate.rs` (row-level cascade: walk
//! `EntityDepGraph` from a changed row out to its transitive dependents,
//! then enqueue them) — generalized from "one changed row" to "every
//! catalog object kind, diffed against a persisted reference timestamp".

use crate::catalog::CatalogReader;
use crate::dependency::DependencyGraph;
use crate::error::{XtraqError, XtraqResult};
use crate::model::{
    CacheEntry, RefreshReason, SchemaInvalidationResult, SchemaObjectKind, SchemaObjectRef,
    SchemaRefreshBatch, SchemaRefreshEntry,
};
use crate::snapshot::{PersistedObjectCache, RefreshPlanDocument, SnapshotStore};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Every tracked object kind, in the deterministic order spec.md §4.5
/// processes them.
const ALL_KINDS: [SchemaObjectKind; 7] = [
    SchemaObjectKind::Table,
    SchemaObjectKind::View,
    SchemaObjectKind::StoredProcedure,
    SchemaObjectKind::ScalarFunction,
    SchemaObjectKind::TableValuedFunction,
    SchemaObjectKind::UserDefinedTableType,
    SchemaObjectKind::UserDefinedDataType,
];

pub struct InvalidationOrchestrator {
    reader: Arc<dyn CatalogReader>,
    store: SnapshotStore,
    graph: DependencyGraph,
    cache: HashMap<SchemaObjectRef, CacheEntry>,
    reference_timestamp: Option<chrono::DateTime<Utc>>,
}

impl InvalidationOrchestrator {
    #[must_use]
    pub fn new(reader: Arc<dyn CatalogReader>, store: SnapshotStore) -> Self {
        Self {
            reader,
            store,
            graph: DependencyGraph::new(),
            cache: HashMap::new(),
            reference_timestamp: None,
        }
    }

    /// One-shot: loads the persisted object cache. `_connection_string` is
    /// accepted for interface fidelity with spec.md §4.5 — the concrete
    /// catalog connection is out of this crate's scope (spec.md §1); the
    /// `CatalogReader` passed to [`InvalidationOrchestrator::new`] is
    /// already connected.
    pub fn initialize(&mut self, _connection_string: &str) {
        let persisted = self.store.load_object_cache();
        self.reference_timestamp = persisted.reference_timestamp;
        self.cache = persisted.to_map();
        for (object_ref, entry) in &self.cache {
            self.graph
                .set_dependencies(object_ref.clone(), entry.dependencies.iter().cloned().collect());
        }
    }

    /// Runs the diff-and-invalidate algorithm of spec.md §4.5 for every
    /// tracked object kind, then persists cache and refresh plan.
    ///
    /// `cancellation`, when cancelled, aborts before any cache or plan file
    /// is written (fail-closed, spec.md §5 "Cancellation") — the in-memory
    /// graph/cache mutations made up to that point are discarded along with
    /// `self`'s caller, since nothing durable has been touched yet.
    pub async fn analyze_and_invalidate(
        &mut self,
        schema_filter: Option<&HashSet<String>>,
        cancellation: &CancellationToken,
    ) -> XtraqResult<SchemaInvalidationResult> {
        let mut modified = Vec::new();
        let mut removed = Vec::new();
        let mut invalidated_set: HashSet<SchemaObjectRef> = HashSet::new();
        let mut reason_map: HashMap<SchemaObjectRef, RefreshReason> = HashMap::new();

        for kind in ALL_KINDS {
            if cancellation.is_cancelled() {
                return Err(XtraqError::Cancelled { operation: "analyze_and_invalidate".to_string() });
            }
            let changes = self
                .reader
                .list_objects_modified_since(kind, self.reference_timestamp, schema_filter)
                .await?;

            for metadata in changes.modified {
                let unchanged = self
                    .cache
                    .get(&metadata.object_ref)
                    .is_some_and(|existing| existing.last_modified_utc >= metadata.modified_utc);
                if unchanged {
                    continue;
                }

                modified.push(metadata.object_ref.clone());
                reason_map.insert(metadata.object_ref.clone(), RefreshReason::Modified);

                let dependencies = self.reader.read_dependencies(&metadata.object_ref).await?;
                self.graph.set_dependencies(
                    metadata.object_ref.clone(),
                    dependencies.iter().cloned().collect(),
                );
                self.cache.insert(
                    metadata.object_ref.clone(),
                    CacheEntry {
                        last_modified_utc: metadata.modified_utc,
                        dependencies,
                    },
                );

                for dependent in self.graph.transitive_dependents(&metadata.object_ref) {
                    invalidated_set.insert(dependent.clone());
                    reason_map.entry(dependent).or_insert(RefreshReason::Dependency);
                }
            }

            for removed_ref in changes.removed {
                for dependent in self.graph.transitive_dependents(&removed_ref) {
                    invalidated_set.insert(dependent.clone());
                    reason_map.entry(dependent).or_insert(RefreshReason::Dependency);
                }
                self.cache.remove(&removed_ref);
                self.graph.remove(&removed_ref);
                removed.push(removed_ref);
            }
        }

        if cancellation.is_cancelled() {
            return Err(XtraqError::Cancelled { operation: "analyze_and_invalidate".to_string() });
        }

        let next_reference_timestamp = self.reader.read_max_modification_time().await?;
        self.reference_timestamp = Some(next_reference_timestamp);

        self.store
            .save_object_cache(&PersistedObjectCache::from_map(Some(next_reference_timestamp), &self.cache))?;

        let (batches, skipped) = build_refresh_plan(&reason_map, schema_filter);
        self.persist_refresh_plan(&batches, modified.len(), invalidated_set.len(), removed.len(), skipped.len())?;

        let mut invalidated: Vec<SchemaObjectRef> = invalidated_set.into_iter().collect();
        invalidated.sort();

        Ok(SchemaInvalidationResult {
            modified,
            invalidated,
            removed,
            skipped,
            next_reference_timestamp,
            refresh_plan: batches,
        })
    }

    /// Manual eviction: drops `refs` from the cache and graph without
    /// consulting the catalog (spec.md §4.5 `invalidate`).
    pub fn invalidate(&mut self, refs: &[SchemaObjectRef]) -> XtraqResult<()> {
        for object_ref in refs {
            self.cache.remove(object_ref);
            self.graph.remove(object_ref);
        }
        self.store
            .save_object_cache(&PersistedObjectCache::from_map(self.reference_timestamp, &self.cache))
    }

    fn persist_refresh_plan(
        &self,
        batches: &[SchemaRefreshBatch],
        modified_count: usize,
        dependency_count: usize,
        removed_count: usize,
        skipped_count: usize,
    ) -> XtraqResult<()> {
        let document = RefreshPlanDocument {
            version: 1,
            generated_utc: Utc::now(),
            schemas: batches.iter().map(|b| b.schema.clone()).collect(),
            modified_count,
            dependency_count,
            removed_count,
            skipped_count,
            batches: batches.to_vec(),
        };
        self.store.save_refresh_plan(&document)
    }
}

/// Groups `reason_map` into schema-ascending (case-insensitive) batches,
/// ordering each batch Modified-before-Dependency, then by kind, then by
/// name (case-insensitive). Entries whose schema falls outside
/// `schema_filter` are returned separately as `skipped` rather than
/// appearing in any batch (spec.md §4.5).
fn build_refresh_plan(
    reason_map: &HashMap<SchemaObjectRef, RefreshReason>,
    schema_filter: Option<&HashSet<String>>,
) -> (Vec<SchemaRefreshBatch>, Vec<SchemaObjectRef>) {
    let mut grouped: HashMap<String, (String, Vec<SchemaRefreshEntry>)> = HashMap::new();
    let mut skipped = Vec::new();

    for (object_ref, reason) in reason_map {
        let in_scope = schema_filter.is_none_or(|filter| {
            filter.iter().any(|s| s.eq_ignore_ascii_case(&object_ref.schema))
        });
        if !in_scope {
            skipped.push(object_ref.clone());
            continue;
        }
        let key = object_ref.schema.to_lowercase();
        let group = grouped
            .entry(key)
            .or_insert_with(|| (object_ref.schema.clone(), Vec::new()));
        group.1.push(SchemaRefreshEntry {
            object_ref: object_ref.clone(),
            reason: *reason,
        });
    }

    let mut schema_keys: Vec<String> = grouped.keys().cloned().collect();
    schema_keys.sort();

    let mut batches = Vec::with_capacity(schema_keys.len());
    for key in schema_keys {
        let (schema, mut entries) = grouped.remove(&key).expect("key came from this map");
        entries.sort_by(|a, b| {
            reason_rank(a.reason)
                .cmp(&reason_rank(b.reason))
                .then_with(|| a.object_ref.kind.cmp(&b.object_ref.kind))
                .then_with(|| a.object_ref.name.to_lowercase().cmp(&b.object_ref.name.to_lowercase()))
        });
        batches.push(SchemaRefreshBatch { schema, entries });
    }

    skipped.sort();
    (batches, skipped)
}

fn reason_rank(reason: RefreshReason) -> u8 {
    match reason {
        RefreshReason::Modified => 0,
        RefreshReason::Dependency => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::FakeCatalogReader;
    use crate::model::{SchemaObjectKind, SchemaObjectMetadata};
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn obj(kind: SchemaObjectKind, schema: &str, name: &str) -> SchemaObjectRef {
        SchemaObjectRef::new(kind, schema, name)
    }

    #[tokio::test]
    async fn modified_table_invalidates_dependent_procedure() {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let table = obj(SchemaObjectKind::Table, "dbo", "Users");
        let procedure = obj(SchemaObjectKind::StoredProcedure, "dbo", "GetUsers");

        let reader = Arc::new(
            FakeCatalogReader::new()
                .with_object(SchemaObjectMetadata { object_ref: table.clone(), object_id: 1, modified_utc: t0 })
                .with_object(SchemaObjectMetadata { object_ref: procedure.clone(), object_id: 2, modified_utc: t0 })
                .with_dependencies(procedure.clone(), vec![table.clone()]),
        );

        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let mut orchestrator = InvalidationOrchestrator::new(reader, store);
        orchestrator.initialize("unused");

        let token = CancellationToken::new();
        let result = orchestrator.analyze_and_invalidate(None, &token).await.unwrap();
        assert!(result.modified.contains(&table));
        assert!(result.modified.contains(&procedure));

        // second pass: nothing changed, cache short-circuits both.
        let second = orchestrator.analyze_and_invalidate(None, &token).await.unwrap();
        assert!(second.modified.is_empty());
    }

    #[tokio::test]
    async fn schema_filter_routes_out_of_scope_entries_to_skipped() {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let table = obj(SchemaObjectKind::Table, "dbo", "Users");
        let procedure = obj(SchemaObjectKind::StoredProcedure, "app", "GetUsers");

        let reader = Arc::new(
            FakeCatalogReader::new()
                .with_object(SchemaObjectMetadata { object_ref: table.clone(), object_id: 1, modified_utc: t0 })
                .with_dependencies(procedure.clone(), vec![table.clone()]),
        );
        // Pre-seed the graph edge by registering the procedure as a
        // dependent of the table before the filtered run.
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let mut orchestrator = InvalidationOrchestrator::new(reader.clone(), store.clone());
        orchestrator.graph.set_dependencies(procedure.clone(), HashSet::from([table.clone()]));

        let mut filter = HashSet::new();
        filter.insert("dbo".to_string());
        let token = CancellationToken::new();
        let result = orchestrator.analyze_and_invalidate(Some(&filter), &token).await.unwrap();

        assert!(result.modified.contains(&table));
        assert!(result.invalidated.contains(&procedure));
        assert!(result.skipped.contains(&procedure));
        assert!(!result.refresh_plan.iter().any(|b| b.schema == "app"));
    }

    #[tokio::test]
    async fn removed_table_invalidates_dependents_and_clears_cache() {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let table = obj(SchemaObjectKind::Table, "dbo", "Legacy");
        let procedure = obj(SchemaObjectKind::StoredProcedure, "dbo", "GetLegacy");

        let mut reader = FakeCatalogReader::new()
            .with_object(SchemaObjectMetadata { object_ref: table.clone(), object_id: 1, modified_utc: t0 });
        reader.dependencies.insert(procedure.clone(), vec![table.clone()]);

        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let mut orchestrator = InvalidationOrchestrator::new(Arc::new(reader.clone()), store.clone());
        orchestrator.initialize("unused");
        orchestrator.analyze_and_invalidate(None, &CancellationToken::new()).await.unwrap();

        let mut reader_after = reader;
        reader_after.remove(table.clone());
        let mut orchestrator2 = InvalidationOrchestrator::new(Arc::new(reader_after), store);
        orchestrator2.initialize("unused");
        let result = orchestrator2.analyze_and_invalidate(None, &CancellationToken::new()).await.unwrap();

        assert!(result.removed.contains(&table));
    }

    #[tokio::test]
    async fn cancelled_token_aborts_before_writing_cache_or_plan() {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let table = obj(SchemaObjectKind::Table, "dbo", "Users");

        let reader = Arc::new(FakeCatalogReader::new().with_object(SchemaObjectMetadata {
            object_ref: table,
            object_id: 1,
            modified_utc: t0,
        }));

        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let mut orchestrator = InvalidationOrchestrator::new(reader, store.clone());
        orchestrator.initialize("unused");

        let token = CancellationToken::new();
        token.cancel();
        let err = orchestrator.analyze_and_invalidate(None, &token).await.unwrap_err();
        assert!(matches!(err, XtraqError::Cancelled { .. }));
        assert!(store.load_refresh_plan().is_none());
    }
}
