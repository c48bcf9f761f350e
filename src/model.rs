//! Core data model shared by every pipeline stage (spec.md §3).
//!
//! Grounded in the teacher's `queue/key.rs` (`RefreshKey`, a small `Eq`/`Hash`
//! value type used as a map/set key throughout the queue subsystem) and
//! `catalog.rs` (`TviewMeta`, a plain serde struct mirroring one catalog
//! row) — generalized from "one Postgres OID pair" to the
//! `(kind, schema, name)` triple spec.md §3 requires.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// The catalog object kinds Xtraq tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SchemaObjectKind {
    Table,
    View,
    StoredProcedure,
    ScalarFunction,
    TableValuedFunction,
    UserDefinedTableType,
    UserDefinedDataType,
}

impl fmt::Display for SchemaObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SchemaObjectKind::Table => "Table",
            SchemaObjectKind::View => "View",
            SchemaObjectKind::StoredProcedure => "StoredProcedure",
            SchemaObjectKind::ScalarFunction => "ScalarFunction",
            SchemaObjectKind::TableValuedFunction => "TableValuedFunction",
            SchemaObjectKind::UserDefinedTableType => "UserDefinedTableType",
            SchemaObjectKind::UserDefinedDataType => "UserDefinedDataType",
        };
        f.write_str(s)
    }
}

/// `(kind, schema, name)`. Comparison is case-insensitive on `schema` and
/// `name` (spec.md §3), implemented via a normalized lowercase key rather
/// than a custom hasher so `HashSet`/`HashMap` keying "just works".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaObjectRef {
    pub kind: SchemaObjectKind,
    pub schema: String,
    pub name: String,
}

impl SchemaObjectRef {
    #[must_use]
    pub fn new(kind: SchemaObjectKind, schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// `"{schema}.{name}"`, per spec.md §3.
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    fn ci_key(&self) -> (SchemaObjectKind, String, String) {
        (self.kind, self.schema.to_lowercase(), self.name.to_lowercase())
    }
}

impl PartialEq for SchemaObjectRef {
    fn eq(&self, other: &Self) -> bool {
        self.ci_key() == other.ci_key()
    }
}

impl Eq for SchemaObjectRef {}

impl std::hash::Hash for SchemaObjectRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.ci_key().hash(state);
    }
}

impl PartialOrd for SchemaObjectRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SchemaObjectRef {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ci_key().cmp(&other.ci_key())
    }
}

impl fmt::Display for SchemaObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.full_name())
    }
}

/// Returned by [`crate::catalog::CatalogReader`] for any object it has
/// observed. `modified_utc` MUST be interpreted as UTC per spec.md §3 even
/// when the source value carried no timezone tag — see
/// [`normalize_unspecified_utc`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaObjectMetadata {
    pub object_ref: SchemaObjectRef,
    pub object_id: i32,
    pub modified_utc: DateTime<Utc>,
}

/// Reinterprets a naive (timezone-unspecified) timestamp as UTC *without*
/// any offset conversion, per spec.md §3's normalization rule. Use this at
/// the `CatalogReader` boundary whenever the source driver hands back a
/// naive timestamp.
#[must_use]
pub fn normalize_unspecified_utc(naive: chrono::NaiveDateTime) -> DateTime<Utc> {
    DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc)
}

/// One persisted cache row per [`SchemaObjectRef`] (spec.md §3). The
/// invariant that every dependency edge is bidirectional is enforced by
/// [`crate::dependency::DependencyGraph`], not by this struct itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub last_modified_utc: DateTime<Utc>,
    pub dependencies: Vec<SchemaObjectRef>,
}

/// Why a ref appears in a refresh batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefreshReason {
    Modified,
    Dependency,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaRefreshEntry {
    pub object_ref: SchemaObjectRef,
    pub reason: RefreshReason,
}

/// One schema-scoped group of objects to re-analyze, per spec.md §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaRefreshBatch {
    pub schema: String,
    pub entries: Vec<SchemaRefreshEntry>,
}

/// Result of one [`crate::invalidation::InvalidationOrchestrator::analyze_and_invalidate`]
/// call, per spec.md §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaInvalidationResult {
    pub modified: Vec<SchemaObjectRef>,
    pub invalidated: Vec<SchemaObjectRef>,
    pub removed: Vec<SchemaObjectRef>,
    pub skipped: Vec<SchemaObjectRef>,
    pub next_reference_timestamp: DateTime<Utc>,
    pub refresh_plan: Vec<SchemaRefreshBatch>,
}

impl SchemaInvalidationResult {
    /// Union of all objects that must be re-analyzed: derived from the
    /// refresh plan, falling back to `modified ∪ invalidated` when the plan
    /// is empty (spec.md §4.5 "Edge rules").
    #[must_use]
    pub fn objects_to_refresh(&self) -> Vec<SchemaObjectRef> {
        if self.refresh_plan.is_empty() {
            let mut out: Vec<SchemaObjectRef> = self.modified.clone();
            for r in &self.invalidated {
                if !out.contains(r) {
                    out.push(r.clone());
                }
            }
            out
        } else {
            self.refresh_plan
                .iter()
                .flat_map(|b| b.entries.iter().map(|e| e.object_ref.clone()))
                .collect()
        }
    }
}

// ===================== Procedure / result-set model =====================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub sql_type_name: String,
    pub is_nullable: bool,
    pub has_default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableTypeParameter {
    pub parameter_name: String,
    pub schema: String,
    pub name: String,
    pub normalized_type_ref: String,
}

/// What kind of object a function-valued / reference column points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferenceKind {
    Function,
    Table,
    View,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnReference {
    pub kind: ReferenceKind,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub schema: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub name: Option<String>,
}

/// One projected column. May nest arbitrarily deep for FOR JSON
/// projections / `JSON_QUERY` subqueries (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResultColumn {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub alias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub source_schema: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub source_table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub source_column: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sql_type_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub max_length: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub precision: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub scale: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub is_nullable: Option<bool>,
    #[serde(skip_serializing_if = "is_false_or_none", default)]
    pub returns_json: Option<bool>,
    #[serde(skip_serializing_if = "is_false_or_none", default)]
    pub returns_json_array: Option<bool>,
    #[serde(skip_serializing_if = "is_false_or_none", default)]
    pub is_nested_json: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub json_root_property: Option<String>,
    #[serde(skip_serializing_if = "is_false_or_none", default)]
    pub json_include_null_values: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reference: Option<ColumnReference>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub columns: Vec<ResultColumn>,
}

fn is_false_or_none(v: &Option<bool>) -> bool {
    !matches!(v, Some(true))
}

impl ResultColumn {
    #[must_use]
    pub fn leaf(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// `sqlTypeName` missing and not a leaf JSON container — this is the
    /// condition [`crate::enrich::MetadataEnricher`] fills in (spec.md §4.7).
    #[must_use]
    pub fn needs_enrichment(&self) -> bool {
        self.sql_type_name.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResultSet {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "is_false_or_none", default)]
    pub returns_json: Option<bool>,
    #[serde(skip_serializing_if = "is_false_or_none", default)]
    pub returns_json_array: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub json_root_property: Option<String>,
    #[serde(skip_serializing_if = "is_false_or_none", default)]
    pub json_include_null_values: Option<bool>,
    pub columns: Vec<ResultColumn>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcedureDescriptor {
    pub schema: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcedureModel {
    pub descriptor: ProcedureDescriptor,
    pub parameters: Vec<Parameter>,
    pub table_type_parameters: Vec<TableTypeParameter>,
    pub result_sets: Vec<ResultSet>,
    /// Hex-encoded SHA-256 over normalized T-SQL (spec.md §4.9).
    pub definition_hash: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub required_type_refs: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub required_table_refs: Vec<String>,
    /// Count of recoverable parse diagnostics recorded while analyzing this
    /// procedure (spec.md §4.6 "Failure semantics").
    #[serde(default)]
    pub diagnostic_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionParameter {
    pub name: String,
    pub sql_type_name: String,
    pub is_nullable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FunctionColumn {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sql_type_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub max_length: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub is_nullable: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotFunction {
    pub schema: String,
    pub name: String,
    #[serde(skip_serializing_if = "is_false_or_none", default)]
    pub is_table_valued: Option<bool>,
    #[serde(skip_serializing_if = "is_false_or_none", default)]
    pub is_encrypted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub return_sql_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub return_max_length: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub return_is_nullable: Option<bool>,
    #[serde(skip_serializing_if = "is_false_or_none", default)]
    pub returns_json: Option<bool>,
    #[serde(skip_serializing_if = "is_false_or_none", default)]
    pub returns_json_array: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub json_root_property: Option<String>,
    #[serde(skip_serializing_if = "is_false_or_none", default)]
    pub json_include_null_values: Option<bool>,
    #[serde(default)]
    pub parameters: Vec<FunctionParameter>,
    #[serde(default)]
    pub columns: Vec<FunctionColumn>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// One line of `snapshots/index.json` (spec.md §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexColumn {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sql_type_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexResultSet {
    pub columns: Vec<IndexColumn>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub schema: String,
    pub name: String,
    pub result_sets: Vec<IndexResultSet>,
}

/// Cache row keyed by content-addressed fingerprint (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcedureCacheSnapshot {
    pub fingerprint: String,
    pub created_utc: DateTime<Utc>,
    pub procedures: Vec<CachedProcedureRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedProcedureRef {
    pub schema: String,
    pub name: String,
    pub modified_ticks: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_object_ref_equality_is_case_insensitive() {
        let a = SchemaObjectRef::new(SchemaObjectKind::Table, "dbo", "Users");
        let b = SchemaObjectRef::new(SchemaObjectKind::Table, "DBO", "users");
        assert_eq!(a, b);

        let mut set = std::collections::HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn full_name_formats_schema_dot_name() {
        let r = SchemaObjectRef::new(SchemaObjectKind::StoredProcedure, "app", "ApplyChanges");
        assert_eq!(r.full_name(), "app.ApplyChanges");
    }

    #[test]
    fn objects_to_refresh_falls_back_when_plan_empty() {
        let modified = SchemaObjectRef::new(SchemaObjectKind::Table, "dbo", "Users");
        let invalidated = SchemaObjectRef::new(SchemaObjectKind::StoredProcedure, "dbo", "GetUsers");
        let result = SchemaInvalidationResult {
            modified: vec![modified.clone()],
            invalidated: vec![invalidated.clone()],
            removed: vec![],
            skipped: vec![],
            next_reference_timestamp: Utc::now(),
            refresh_plan: vec![],
        };
        let refresh = result.objects_to_refresh();
        assert!(refresh.contains(&modified));
        assert!(refresh.contains(&invalidated));
    }
}
