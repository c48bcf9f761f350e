use super::store::SnapshotStore;
use crate::error::XtraqResult;
use crate::model::{
    IndexColumn, IndexEntry, IndexResultSet, ProcedureModel, SchemaObjectRef, SnapshotFunction,
};
use sha2::{Digest, Sha256};

/// Assembles and emits canonical procedure/function/table/type JSON
/// documents and maintains `index.json` (C9, spec.md §4.9).
///
/// Grounded in the teacher's `queue/persistence.rs` (`SerializedQueue`:
/// a versioned serde document with an embedded digest-worthy payload) —
/// generalized from "one serialized refresh queue" to "one canonical
/// snapshot per schema object plus a roll-up index".
#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    store: SnapshotStore,
}

impl SnapshotWriter {
    #[must_use]
    pub fn new(store: SnapshotStore) -> Self {
        Self { store }
    }

    /// Writes one procedure's canonical snapshot (`definitionHash` must
    /// already be populated by the caller via [`definition_hash`]) and
    /// keeps `index.json` in sync.
    pub fn write_procedure(&self, model: &ProcedureModel) -> XtraqResult<()> {
        let object_ref = SchemaObjectRef::new(
            crate::model::SchemaObjectKind::StoredProcedure,
            &model.descriptor.schema,
            &model.descriptor.name,
        );
        self.store.write_object(&object_ref, model)?;
        self.rebuild_index()
    }

    pub fn remove_procedure(&self, object_ref: &SchemaObjectRef) -> XtraqResult<()> {
        self.store.remove_object(object_ref)?;
        self.rebuild_index()
    }

    pub fn write_function(&self, snapshot: &SnapshotFunction) -> XtraqResult<()> {
        let kind = if snapshot.is_table_valued.unwrap_or(false) {
            crate::model::SchemaObjectKind::TableValuedFunction
        } else {
            crate::model::SchemaObjectKind::ScalarFunction
        };
        let object_ref = SchemaObjectRef::new(kind, &snapshot.schema, &snapshot.name);
        self.store.write_object(&object_ref, snapshot)
    }

    pub fn write_table_columns(
        &self,
        object_ref: &SchemaObjectRef,
        columns: &[crate::catalog::ColumnMetadata],
    ) -> XtraqResult<()> {
        self.store.write_object(object_ref, &columns.to_vec())
    }

    /// Rebuilds `index.json` from every file currently present under
    /// `snapshots/procedures/` — the index always reflects the union of
    /// on-disk procedure files, so removed procedures disappear the
    /// moment their file does (spec.md §4.9/§8).
    fn rebuild_index(&self) -> XtraqResult<()> {
        let procedures_dir = self.store.root().join("snapshots").join("procedures");
        let mut entries = Vec::new();

        if procedures_dir.is_dir() {
            for schema_entry in std::fs::read_dir(&procedures_dir)? {
                let schema_entry = schema_entry?;
                if !schema_entry.file_type()?.is_dir() {
                    continue;
                }
                for file_entry in std::fs::read_dir(schema_entry.path())? {
                    let file_entry = file_entry?;
                    let path = file_entry.path();
                    if path.extension().and_then(|e| e.to_str()) != Some("json") {
                        continue;
                    }
                    let Some(model): Option<ProcedureModel> = self.store.read_json_tolerant(&path) else {
                        continue;
                    };
                    entries.push(IndexEntry {
                        schema: model.descriptor.schema.clone(),
                        name: model.descriptor.name.clone(),
                        result_sets: model
                            .result_sets
                            .iter()
                            .map(|rs| IndexResultSet {
                                columns: rs
                                    .columns
                                    .iter()
                                    .map(|c| IndexColumn {
                                        name: c.name.clone(),
                                        sql_type_name: c.sql_type_name.clone(),
                                    })
                                    .collect(),
                            })
                            .collect(),
                    });
                }
            }
        }

        entries.sort_by(|a, b| {
            a.schema
                .to_lowercase()
                .cmp(&b.schema.to_lowercase())
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        });

        self.store.write_json_atomic(&self.store.index_path(), &entries)
    }
}

/// Normalizes T-SQL text before hashing (spec.md §4.9): line endings to
/// LF, trailing whitespace trimmed per line, trailing empty lines removed.
#[must_use]
pub fn normalize_sql(sql: &str) -> String {
    let mut lines: Vec<String> = sql
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .lines()
        .map(|line| line.trim_end().to_string())
        .collect();
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

/// Hex-encoded SHA-256 over [`normalize_sql`]'s output (spec.md §4.9/§8).
#[must_use]
pub fn definition_hash(sql: &str) -> String {
    let normalized = normalize_sql(sql);
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
