use crate::error::{XtraqError, XtraqResult};
use crate::model::{CacheEntry, SchemaObjectKind, SchemaObjectRef, SchemaRefreshBatch};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Filesystem-backed mapping from [`SchemaObjectRef`] to JSON documents,
/// rooted at `<project>/.xtraq/` (spec.md §4.2/§6).
///
/// Grounded in the teacher's `ddl/create.rs`/`ddl/drop.rs` file lifecycle
/// (one physical artifact per logical object, created/removed in lockstep
/// with catalog state) — generalized from "one trigger function file" to
/// "one JSON snapshot per schema object".
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    /// `project_root` is the directory containing `.xtraqconfig`; the
    /// store itself lives under `<project_root>/.xtraq`.
    #[must_use]
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self { root: project_root.into().join(".xtraq") }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn index_path(&self) -> PathBuf {
        self.root.join("snapshots").join("index.json")
    }

    #[must_use]
    pub fn object_cache_path(&self) -> PathBuf {
        self.root.join("cache").join("schema-object-cache.json")
    }

    #[must_use]
    pub fn refresh_plan_path(&self) -> PathBuf {
        self.root.join("cache").join("schema-refresh-plan.json")
    }

    #[must_use]
    pub fn fingerprint_cache_path(&self, fingerprint: &str) -> PathBuf {
        self.root.join("cache").join(format!("{fingerprint}.json"))
    }

    #[must_use]
    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    /// Path for one object's canonical snapshot, per the layout in
    /// spec.md §6.
    #[must_use]
    pub fn object_path(&self, object_ref: &SchemaObjectRef) -> PathBuf {
        let snapshots = self.root.join("snapshots");
        match object_ref.kind {
            SchemaObjectKind::Table | SchemaObjectKind::View => snapshots
                .join("tables")
                .join(format!("{}.{}.json", object_ref.schema, object_ref.name)),
            SchemaObjectKind::StoredProcedure => snapshots
                .join("procedures")
                .join(&object_ref.schema)
                .join(format!("{}.json", object_ref.name)),
            SchemaObjectKind::ScalarFunction | SchemaObjectKind::TableValuedFunction => snapshots
                .join("functions")
                .join(format!("{}.{}.json", object_ref.schema, object_ref.name)),
            SchemaObjectKind::UserDefinedTableType | SchemaObjectKind::UserDefinedDataType => snapshots
                .join("types")
                .join(format!("{}.{}.json", object_ref.schema, object_ref.name)),
        }
    }

    /// Writes `value` to `path` atomically: serialize, write to a sibling
    /// temp file, fsync, then rename over the destination (spec.md §4.9).
    /// If the rename fails the previous file is left untouched.
    pub fn write_json_atomic<T: Serialize>(&self, path: &Path, value: &T) -> XtraqResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_vec_pretty(value)?;

        let temp_path = path.with_extension(format!(
            "{}.tmp",
            path.extension().and_then(|e| e.to_str()).unwrap_or("json")
        ));
        {
            let mut file = std::fs::File::create(&temp_path)?;
            use std::io::Write;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        std::fs::rename(&temp_path, path).map_err(|e| {
            let _ = std::fs::remove_file(&temp_path);
            XtraqError::SnapshotIoError {
                object: path.display().to_string(),
                reason: e.to_string(),
            }
        })
    }

    /// Tolerant read: unknown fields are ignored by serde's default
    /// behaviour, a missing file or invalid JSON yields `None` rather than
    /// an error (spec.md §4.2).
    #[must_use]
    pub fn read_json_tolerant<T: DeserializeOwned>(&self, path: &Path) -> Option<T> {
        let contents = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&contents).ok()
    }

    pub fn write_object<T: Serialize>(&self, object_ref: &SchemaObjectRef, value: &T) -> XtraqResult<()> {
        self.write_json_atomic(&self.object_path(object_ref), value)
    }

    pub fn remove_object(&self, object_ref: &SchemaObjectRef) -> XtraqResult<()> {
        let path = self.object_path(object_ref);
        if path.is_file() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    pub fn load_object<T: DeserializeOwned>(&self, object_ref: &SchemaObjectRef) -> Option<T> {
        self.read_json_tolerant(&self.object_path(object_ref))
    }

    // ---------------- object cache (cache/schema-object-cache.json) ----------------

    pub fn load_object_cache(&self) -> PersistedObjectCache {
        self.read_json_tolerant(&self.object_cache_path())
            .unwrap_or_default()
    }

    pub fn save_object_cache(&self, cache: &PersistedObjectCache) -> XtraqResult<()> {
        self.write_json_atomic(&self.object_cache_path(), cache)
    }

    // ---------------- refresh plan (cache/schema-refresh-plan.json) ----------------

    pub fn save_refresh_plan(&self, document: &RefreshPlanDocument) -> XtraqResult<()> {
        self.write_json_atomic(&self.refresh_plan_path(), document)
    }

    pub fn load_refresh_plan(&self) -> Option<RefreshPlanDocument> {
        self.read_json_tolerant(&self.refresh_plan_path())
    }
}

/// On-disk shape of `cache/schema-object-cache.json`: a `HashMap` keyed by
/// a value-object can't serialize directly to JSON object keys, so the
/// persisted form is a flat row list, matching the teacher's
/// `queue/persistence.rs` `SerializedQueue` (`version` + flat `Vec` +
/// metadata) shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedObjectCache {
    pub version: u32,
    pub reference_timestamp: Option<DateTime<Utc>>,
    pub entries: Vec<PersistedCacheRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedCacheRow {
    pub object_ref: SchemaObjectRef,
    pub entry: CacheEntry,
}

impl PersistedObjectCache {
    #[must_use]
    pub fn to_map(&self) -> HashMap<SchemaObjectRef, CacheEntry> {
        self.entries
            .iter()
            .map(|row| (row.object_ref.clone(), row.entry.clone()))
            .collect()
    }

    #[must_use]
    pub fn from_map(reference_timestamp: Option<DateTime<Utc>>, map: &HashMap<SchemaObjectRef, CacheEntry>) -> Self {
        let mut entries: Vec<PersistedCacheRow> = map
            .iter()
            .map(|(object_ref, entry)| PersistedCacheRow {
                object_ref: object_ref.clone(),
                entry: entry.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.object_ref.cmp(&b.object_ref));
        Self { version: 1, reference_timestamp, entries }
    }
}

/// `cache/schema-refresh-plan.json` (spec.md §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshPlanDocument {
    pub version: u32,
    pub generated_utc: DateTime<Utc>,
    pub schemas: Vec<String>,
    pub modified_count: usize,
    pub dependency_count: usize,
    pub removed_count: usize,
    pub skipped_count: usize,
    pub batches: Vec<SchemaRefreshBatch>,
}
