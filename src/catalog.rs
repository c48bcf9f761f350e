//! `CatalogReader` — the read-only port over a live SQL Server catalog
//! (spec.md §4.3). No concrete implementation (a `tds`/SQL Server driver
//! querying `sys.*`) lives in this crate; that is explicitly out of scope
//! (spec.md §1).
//!
//! Grounded in the teacher's `catalog.rs` (`TviewMeta::load_for_source` /
//! `load_by_entity`, a serde struct mirroring one catalog row fetched via
//! SPI), generalized from "one Postgres OID lookup" to an `async_trait`
//! covering every catalog read the pipeline needs.

use crate::error::XtraqResult;
use crate::model::{SchemaObjectKind, SchemaObjectMetadata, SchemaObjectRef};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// One batch of catalog changes for a single object kind, per spec.md
/// §4.3.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub modified: Vec<SchemaObjectMetadata>,
    pub removed: Vec<SchemaObjectRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMetadata {
    pub name: String,
    pub sql_type_name: String,
    pub max_length: Option<i32>,
    pub precision: Option<u8>,
    pub scale: Option<u8>,
    pub is_nullable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionMetadata {
    pub schema: String,
    pub name: String,
    pub is_table_valued: bool,
    pub return_sql_type: Option<String>,
    pub return_max_length: Option<i32>,
    pub return_is_nullable: Option<bool>,
    /// Whether the function's `RETURN` body produces `FOR JSON` text
    /// (C8 `FunctionJsonExtractor`, spec.md §4.8).
    pub returns_json: bool,
    pub returns_json_array: bool,
    pub json_root_property: Option<String>,
    pub json_include_null_values: bool,
    pub columns: Vec<ColumnMetadata>,
}

impl FunctionMetadata {
    /// Builds a [`FunctionMetadata`] whose JSON-shape fields are derived
    /// from `body_sql` via [`crate::ast::analyze_function_json`] (C8,
    /// spec.md §4.8), rather than left for each `CatalogReader`
    /// implementation to compute itself. A concrete reader calls this once
    /// it has fetched both the function's declared return type and its
    /// definition text.
    #[must_use]
    pub fn from_definition(
        schema: impl Into<String>,
        name: impl Into<String>,
        is_table_valued: bool,
        return_sql_type: Option<String>,
        return_max_length: Option<i32>,
        return_is_nullable: Option<bool>,
        columns: Vec<ColumnMetadata>,
        body_sql: &str,
    ) -> Self {
        let shape = crate::ast::analyze_function_json(body_sql);
        Self {
            schema: schema.into(),
            name: name.into(),
            is_table_valued,
            return_sql_type,
            return_max_length,
            return_is_nullable,
            returns_json: shape.returns_json,
            returns_json_array: shape.returns_json_array,
            json_root_property: shape.json_root_property,
            json_include_null_values: shape.json_include_null_values,
            columns,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdtRow {
    pub schema: String,
    pub name: String,
    pub columns: Vec<ColumnMetadata>,
}

#[derive(Debug, Clone)]
pub struct ProcedureDefinition {
    pub sql: String,
    pub modified_utc: DateTime<Utc>,
}

impl ProcedureDefinition {
    #[must_use]
    pub fn new(sql: impl Into<String>, modified_utc: DateTime<Utc>) -> Self {
        Self { sql: sql.into(), modified_utc }
    }
}

/// Read-only operations over the live catalog (spec.md §4.3). All
/// operations may fail with [`crate::error::XtraqError::CatalogUnavailable`].
/// Cancellation (spec.md §5) is cooperative at the caller — see
/// [`crate::invalidation::InvalidationOrchestrator::analyze_and_invalidate`]
/// and [`crate::enrich::MetadataEnricher::enrich`], which poll a
/// `CancellationToken` between calls into this trait rather than threading
/// one through each individual read.
#[async_trait]
pub trait CatalogReader: Send + Sync {
    async fn list_objects_modified_since(
        &self,
        kind: SchemaObjectKind,
        since: Option<DateTime<Utc>>,
        schema_filter: Option<&HashSet<String>>,
    ) -> XtraqResult<ChangeSet>;

    async fn read_dependencies(&self, object_ref: &SchemaObjectRef) -> XtraqResult<Vec<SchemaObjectRef>>;

    async fn read_max_modification_time(&self) -> XtraqResult<DateTime<Utc>>;

    async fn read_procedure_definition(&self, object_ref: &SchemaObjectRef) -> XtraqResult<ProcedureDefinition>;

    async fn read_table_columns(&self, schema: &str, table: &str) -> XtraqResult<Vec<ColumnMetadata>>;

    async fn read_function_metadata(&self, object_ref: &SchemaObjectRef) -> XtraqResult<Option<FunctionMetadata>>;

    async fn read_user_defined_types(&self) -> XtraqResult<Vec<UdtRow>>;
}

/// An in-memory `CatalogReader` test double (spec.md §4.3: "fake-able").
/// Grounded in the teacher's own `#[pg_test]` fixtures (`CREATE TABLE
/// test_types (...)` in `schema/types.rs`) reborn as plain in-memory data
/// instead of a live database.
#[derive(Debug, Default, Clone)]
pub struct FakeCatalogReader {
    pub objects: Vec<SchemaObjectMetadata>,
    pub removed: Vec<SchemaObjectRef>,
    pub dependencies: HashMap<SchemaObjectRef, Vec<SchemaObjectRef>>,
    pub procedure_definitions: HashMap<SchemaObjectRef, ProcedureDefinition>,
    pub table_columns: HashMap<(String, String), Vec<ColumnMetadata>>,
    pub functions: HashMap<SchemaObjectRef, FunctionMetadata>,
    pub udts: Vec<UdtRow>,
}

impl FakeCatalogReader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_object(mut self, metadata: SchemaObjectMetadata) -> Self {
        self.objects.push(metadata);
        self
    }

    pub fn with_dependencies(mut self, object_ref: SchemaObjectRef, deps: Vec<SchemaObjectRef>) -> Self {
        self.dependencies.insert(object_ref, deps);
        self
    }

    pub fn with_procedure(mut self, object_ref: SchemaObjectRef, sql: impl Into<String>, modified_utc: DateTime<Utc>) -> Self {
        self.procedure_definitions.insert(
            object_ref,
            ProcedureDefinition { sql: sql.into(), modified_utc },
        );
        self
    }

    pub fn with_table_columns(mut self, schema: impl Into<String>, table: impl Into<String>, columns: Vec<ColumnMetadata>) -> Self {
        self.table_columns.insert((schema.into(), table.into()), columns);
        self
    }

    pub fn with_function(mut self, object_ref: SchemaObjectRef, metadata: FunctionMetadata) -> Self {
        self.functions.insert(object_ref, metadata);
        self
    }

    /// Bumps the `modified_utc` of an already-registered object, as
    /// spec.md §8 scenario 2 requires ("Bump only the UDTT's
    /// `modifiedUtc`").
    pub fn touch(&mut self, object_ref: &SchemaObjectRef, modified_utc: DateTime<Utc>) {
        if let Some(existing) = self.objects.iter_mut().find(|m| &m.object_ref == object_ref) {
            existing.modified_utc = modified_utc;
        }
    }

    pub fn remove(&mut self, object_ref: SchemaObjectRef) {
        self.objects.retain(|m| m.object_ref != object_ref);
        self.removed.push(object_ref);
    }
}

#[async_trait]
impl CatalogReader for FakeCatalogReader {
    async fn list_objects_modified_since(
        &self,
        kind: SchemaObjectKind,
        since: Option<DateTime<Utc>>,
        schema_filter: Option<&HashSet<String>>,
    ) -> XtraqResult<ChangeSet> {
        let in_filter = |schema: &str| {
            schema_filter.is_none_or(|f| f.iter().any(|s| s.eq_ignore_ascii_case(schema)))
        };
        let modified = self
            .objects
            .iter()
            .filter(|m| m.object_ref.kind == kind && in_filter(&m.object_ref.schema))
            .filter(|m| since.is_none_or(|s| m.modified_utc > s))
            .cloned()
            .collect();
        let removed = self
            .removed
            .iter()
            .filter(|r| r.kind == kind && in_filter(&r.schema))
            .cloned()
            .collect();
        Ok(ChangeSet { modified, removed })
    }

    async fn read_dependencies(&self, object_ref: &SchemaObjectRef) -> XtraqResult<Vec<SchemaObjectRef>> {
        Ok(self.dependencies.get(object_ref).cloned().unwrap_or_default())
    }

    async fn read_max_modification_time(&self) -> XtraqResult<DateTime<Utc>> {
        Ok(self
            .objects
            .iter()
            .map(|m| m.modified_utc)
            .max()
            .unwrap_or_else(Utc::now))
    }

    async fn read_procedure_definition(&self, object_ref: &SchemaObjectRef) -> XtraqResult<ProcedureDefinition> {
        self.procedure_definitions
            .get(object_ref)
            .cloned()
            .ok_or_else(|| crate::error::XtraqError::CatalogUnavailable {
                reason: format!("no definition registered for {object_ref}"),
            })
    }

    async fn read_table_columns(&self, schema: &str, table: &str) -> XtraqResult<Vec<ColumnMetadata>> {
        Ok(self
            .table_columns
            .get(&(schema.to_string(), table.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn read_function_metadata(&self, object_ref: &SchemaObjectRef) -> XtraqResult<Option<FunctionMetadata>> {
        Ok(self.functions.get(object_ref).cloned())
    }

    async fn read_user_defined_types(&self) -> XtraqResult<Vec<UdtRow>> {
        Ok(self.udts.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SchemaObjectKind;
    use chrono::TimeZone;

    #[tokio::test]
    async fn fake_reader_filters_by_schema() {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let reader = FakeCatalogReader::new().with_object(SchemaObjectMetadata {
            object_ref: SchemaObjectRef::new(SchemaObjectKind::Table, "dbo", "Users"),
            object_id: 1,
            modified_utc: t0,
        });

        let mut filter = HashSet::new();
        filter.insert("app".to_string());
        let changes = reader
            .list_objects_modified_since(SchemaObjectKind::Table, None, Some(&filter))
            .await
            .unwrap();
        assert!(changes.modified.is_empty());

        let changes_all = reader
            .list_objects_modified_since(SchemaObjectKind::Table, None, None)
            .await
            .unwrap();
        assert_eq!(changes_all.modified.len(), 1);
    }

    #[tokio::test]
    async fn fake_reader_respects_since_cutoff() {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        let reader = FakeCatalogReader::new().with_object(SchemaObjectMetadata {
            object_ref: SchemaObjectRef::new(SchemaObjectKind::Table, "dbo", "Users"),
            object_id: 1,
            modified_utc: t0,
        });

        let changes = reader
            .list_objects_modified_since(SchemaObjectKind::Table, Some(t1), None)
            .await
            .unwrap();
        assert!(changes.modified.is_empty());
    }

    #[test]
    fn from_definition_derives_json_shape_from_body() {
        // spec.md §4.8.
        let sql = "CREATE FUNCTION sample.GetContactJson(@Id INT) RETURNS NVARCHAR(MAX) AS \
                   BEGIN RETURN (SELECT Id FROM sample.Contacts WHERE Id = @Id FOR JSON PATH, ROOT('contact')) END";
        let metadata = FunctionMetadata::from_definition(
            "sample",
            "GetContactJson",
            false,
            Some("nvarchar".to_string()),
            Some(-1),
            Some(true),
            Vec::new(),
            sql,
        );
        assert!(metadata.returns_json);
        assert_eq!(metadata.json_root_property.as_deref(), Some("contact"));
    }
}
