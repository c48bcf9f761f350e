//! `MetadataEnricher` — fills in `sqlTypeName`/length/nullability gaps the
//! AST analyzer deliberately leaves blank (C7, spec.md §4.7).
//!
//! Grounded in the teacher's `metadata.rs` (a four-way fallback chain:
//! explicit annotation, then inferred-from-column, then type default, then
//! "give up and warn") — generalized to the exact chain spec.md §4.7
//! prescribes: function return type, table column lookup, parameter match,
//! well-known leaf-name fallbacks.

use crate::catalog::CatalogReader;
use crate::error::{XtraqError, XtraqResult};
use crate::model::{Parameter, ProcedureModel, ReferenceKind, ResultColumn, SnapshotFunction};
use crate::snapshot::SnapshotStore;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct MetadataEnricher {
    reader: Arc<dyn CatalogReader>,
    store: SnapshotStore,
}

#[async_trait]
impl MetadataEnricher {
    #[must_use]
    pub fn new(reader: Arc<dyn CatalogReader>, store: SnapshotStore) -> Self {
        Self { reader, store }
    }

    /// Enriches every result-set column of `model` in place, recursing
    /// depth-first through nested JSON columns.
    ///
    /// On cancellation, returns `Err(XtraqError::Cancelled)` as soon as the
    /// in-flight column finishes (fail-closed, spec.md §5) — `model` may be
    /// left partially enriched and the caller must discard it rather than
    /// persist it.
    pub async fn enrich(&self, model: &mut ProcedureModel, cancellation: &CancellationToken) -> XtraqResult<()> {
        let parameters = model.parameters.clone();
        for set in &mut model.result_sets {
            for column in &mut set.columns {
                if cancellation.is_cancelled() {
                    return Err(XtraqError::Cancelled { operation: "enrich".to_string() });
                }
                self.enrich_column(column, &parameters).await?;
            }
        }
        Ok(())
    }

    /// A column whose `sqlTypeName` is already set is skipped, but its
    /// children are still visited (spec.md §4.7).
    async fn enrich_column(&self, column: &mut ResultColumn, parameters: &[Parameter]) -> XtraqResult<()> {
        if column.sql_type_name.is_none() {
            if !self.enrich_from_function(column).await? && !self.enrich_from_table(column).await? {
                if !enrich_from_parameter(column, parameters) {
                    self.enrich_from_well_known_leaf(column).await?;
                }
            }
        }

        for child in &mut column.columns {
            self.enrich_column(child, parameters).await?;
        }
        Ok(())
    }

    /// Step 1: `reference.kind == Function`.
    async fn enrich_from_function(&self, column: &mut ResultColumn) -> XtraqResult<bool> {
        let Some(reference) = &column.reference else {
            return Ok(false);
        };
        if reference.kind != ReferenceKind::Function {
            return Ok(false);
        }
        let (Some(schema), Some(name)) = (&reference.schema, &reference.name) else {
            return Ok(false);
        };
        let object_ref = crate::model::SchemaObjectRef::new(
            crate::model::SchemaObjectKind::ScalarFunction,
            schema.clone(),
            name.clone(),
        );

        let function = match self.reader.read_function_metadata(&object_ref).await {
            Ok(Some(f)) => Some(f),
            _ => self.load_cached_function(schema, name),
        };
        let Some(function) = function else {
            return Ok(false);
        };

        if function.is_table_valued {
            let Some(matched) = function
                .columns
                .iter()
                .find(|c| c.name.eq_ignore_ascii_case(&column.name))
            else {
                return Ok(false);
            };
            column.sql_type_name = Some(matched.sql_type_name.clone());
            column.max_length = matched.max_length;
            column.precision = matched.precision;
            column.scale = matched.scale;
            column.is_nullable = Some(matched.is_nullable);
        } else {
            let Some(return_type) = &function.return_sql_type else {
                return Ok(false);
            };
            column.sql_type_name = Some(return_type.clone());
            column.max_length = function.return_max_length;
            column.is_nullable = function.return_is_nullable;
        }

        // C8: a function's `FOR JSON` shape propagates onto the referencing
        // column regardless of whether it is scalar or table-valued
        // (spec.md §4.7/§4.8).
        if function.returns_json {
            column.returns_json = Some(true);
            column.returns_json_array = Some(function.returns_json_array);
            column.json_root_property = function.json_root_property.clone();
            column.json_include_null_values = Some(function.json_include_null_values);
        }
        Ok(true)
    }

    fn load_cached_function(&self, schema: &str, name: &str) -> Option<crate::catalog::FunctionMetadata> {
        let object_ref = crate::model::SchemaObjectRef::new(
            crate::model::SchemaObjectKind::ScalarFunction,
            schema,
            name,
        );
        let snapshot: SnapshotFunction = self.store.load_object(&object_ref)?;
        Some(crate::catalog::FunctionMetadata {
            schema: snapshot.schema,
            name: snapshot.name,
            is_table_valued: snapshot.is_table_valued.unwrap_or(false),
            return_sql_type: snapshot.return_sql_type,
            return_max_length: snapshot.return_max_length,
            return_is_nullable: snapshot.return_is_nullable,
            returns_json: snapshot.returns_json.unwrap_or(false),
            returns_json_array: snapshot.returns_json_array.unwrap_or(false),
            json_root_property: snapshot.json_root_property,
            json_include_null_values: snapshot.json_include_null_values.unwrap_or(false),
            columns: snapshot
                .columns
                .into_iter()
                .map(|c| crate::catalog::ColumnMetadata {
                    name: c.name,
                    sql_type_name: c.sql_type_name.unwrap_or_default(),
                    max_length: c.max_length,
                    precision: None,
                    scale: None,
                    is_nullable: c.is_nullable.unwrap_or(true),
                })
                .collect(),
        })
    }

    /// Step 2: `sourceSchema`/`sourceTable`/`sourceColumn` are populated.
    async fn enrich_from_table(&self, column: &mut ResultColumn) -> XtraqResult<bool> {
        let (Some(schema), Some(table)) = (&column.source_schema, &column.source_table) else {
            return Ok(false);
        };
        let Some(source_column) = &column.source_column else {
            return Ok(false);
        };

        let columns = self.reader.read_table_columns(schema, table).await?;
        let Some(matched) = columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(source_column))
        else {
            return Ok(false);
        };

        apply_column_metadata(column, matched);
        Ok(true)
    }

    /// Step 4: targeted fallbacks for well-known leaf names (spec.md §4.7).
    async fn enrich_from_well_known_leaf(&self, column: &mut ResultColumn) -> XtraqResult<()> {
        let leaf = column.name.rsplit('.').next().unwrap_or(&column.name).to_string();

        if leaf.eq_ignore_ascii_case("rowVersion") {
            column.sql_type_name = Some("rowversion".to_string());
            column.max_length = Some(8);
            column.is_nullable = Some(false);
            return Ok(());
        }

        if leaf.eq_ignore_ascii_case("displayName") {
            if self.lookup_identity_user_column(column, "DisplayName").await? {
                return Ok(());
            }
            self.lookup_identity_user_column(column, "UserName").await?;
            return Ok(());
        }

        if leaf.eq_ignore_ascii_case("userId") {
            self.lookup_identity_user_column(column, "UserId").await?;
            return Ok(());
        }

        if leaf.eq_ignore_ascii_case("initials") {
            self.lookup_identity_user_column(column, "Initials").await?;
            return Ok(());
        }

        if leaf.eq_ignore_ascii_case("dateTime") {
            column.sql_type_name = Some("datetime2".to_string());
            column.is_nullable = Some(true);
        }

        Ok(())
    }

    async fn lookup_identity_user_column(&self, column: &mut ResultColumn, name: &str) -> XtraqResult<bool> {
        let columns = self.reader.read_table_columns("identity", "User").await?;
        let Some(matched) = columns.iter().find(|c| c.name.eq_ignore_ascii_case(name)) else {
            return Ok(false);
        };
        apply_column_metadata(column, matched);
        Ok(true)
    }
}

fn apply_column_metadata(column: &mut ResultColumn, matched: &crate::catalog::ColumnMetadata) {
    column.sql_type_name = Some(matched.sql_type_name.clone());
    column.max_length = matched.max_length;
    column.precision = matched.precision;
    column.scale = matched.scale;
    column.is_nullable = Some(matched.is_nullable);
}

/// Step 3: exact match, then suffix match, then longest-prefix match
/// against the dotted column name.
fn enrich_from_parameter(column: &mut ResultColumn, parameters: &[Parameter]) -> bool {
    let leaf = column.name.rsplit('.').next().unwrap_or(&column.name);

    if let Some(p) = parameters.iter().find(|p| p.name.eq_ignore_ascii_case(leaf)) {
        apply_parameter(column, p);
        return true;
    }

    if let Some(p) = parameters
        .iter()
        .find(|p| leaf.to_lowercase().ends_with(&p.name.to_lowercase()) || p.name.to_lowercase().ends_with(&leaf.to_lowercase()))
    {
        apply_parameter(column, p);
        return true;
    }

    let full = column.name.to_lowercase();
    let best = parameters
        .iter()
        .filter(|p| full.starts_with(&p.name.to_lowercase()))
        .max_by_key(|p| p.name.len());
    if let Some(p) = best {
        apply_parameter(column, p);
        return true;
    }

    false
}

fn apply_parameter(column: &mut ResultColumn, parameter: &Parameter) {
    column.sql_type_name = Some(parameter.sql_type_name.clone());
    column.is_nullable = Some(parameter.is_nullable);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::FakeCatalogReader;
    use crate::model::{ColumnReference, ResultSet};

    fn reader_with_table() -> Arc<dyn CatalogReader> {
        Arc::new(FakeCatalogReader::new().with_table_columns(
            "sample",
            "UserContacts",
            vec![crate::catalog::ColumnMetadata {
                name: "Email".to_string(),
                sql_type_name: "nvarchar".to_string(),
                max_length: Some(320),
                precision: None,
                scale: None,
                is_nullable: false,
            }],
        ))
    }

    #[tokio::test]
    async fn table_lookup_fills_merge_output_email_column() {
        // spec.md §8 scenario 4.
        let store = SnapshotStore::new(tempfile::tempdir().unwrap().path());
        let enricher = MetadataEnricher::new(reader_with_table(), store);

        let mut model = ProcedureModel {
            descriptor: crate::model::ProcedureDescriptor {
                schema: "sample".to_string(),
                name: "UpsertContact".to_string(),
            },
            parameters: vec![],
            table_type_parameters: vec![],
            result_sets: vec![ResultSet {
                columns: vec![ResultColumn {
                    name: "Email".to_string(),
                    source_schema: Some("sample".to_string()),
                    source_table: Some("UserContacts".to_string()),
                    source_column: Some("Email".to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            definition_hash: String::new(),
            required_type_refs: vec![],
            required_table_refs: vec![],
            diagnostic_count: 0,
        };

        enricher.enrich(&mut model, &CancellationToken::new()).await.unwrap();

        let email = &model.result_sets[0].columns[0];
        assert_eq!(email.sql_type_name.as_deref(), Some("nvarchar"));
        assert_eq!(email.max_length, Some(320));
        assert_eq!(email.is_nullable, Some(false));
    }

    #[tokio::test]
    async fn parameter_match_fills_column_lacking_table_source() {
        let store = SnapshotStore::new(tempfile::tempdir().unwrap().path());
        let enricher = MetadataEnricher::new(Arc::new(FakeCatalogReader::new()), store);

        let mut model = ProcedureModel {
            descriptor: crate::model::ProcedureDescriptor {
                schema: "app".to_string(),
                name: "Echo".to_string(),
            },
            parameters: vec![Parameter {
                name: "Verbose".to_string(),
                sql_type_name: "bit".to_string(),
                is_nullable: false,
                has_default: true,
            }],
            table_type_parameters: vec![],
            result_sets: vec![ResultSet {
                columns: vec![ResultColumn::leaf("Verbose")],
                ..Default::default()
            }],
            definition_hash: String::new(),
            required_type_refs: vec![],
            required_table_refs: vec![],
            diagnostic_count: 0,
        };

        enricher.enrich(&mut model, &CancellationToken::new()).await.unwrap();
        let col = &model.result_sets[0].columns[0];
        assert_eq!(col.sql_type_name.as_deref(), Some("bit"));
    }

    #[tokio::test]
    async fn well_known_leaf_row_version_is_hardcoded() {
        let store = SnapshotStore::new(tempfile::tempdir().unwrap().path());
        let enricher = MetadataEnricher::new(Arc::new(FakeCatalogReader::new()), store);

        let mut model = ProcedureModel {
            descriptor: crate::model::ProcedureDescriptor {
                schema: "app".to_string(),
                name: "GetRow".to_string(),
            },
            parameters: vec![],
            table_type_parameters: vec![],
            result_sets: vec![ResultSet {
                columns: vec![ResultColumn::leaf("rowVersion")],
                ..Default::default()
            }],
            definition_hash: String::new(),
            required_type_refs: vec![],
            required_table_refs: vec![],
            diagnostic_count: 0,
        };

        enricher.enrich(&mut model, &CancellationToken::new()).await.unwrap();
        let col = &model.result_sets[0].columns[0];
        assert_eq!(col.sql_type_name.as_deref(), Some("rowversion"));
        assert_eq!(col.is_nullable, Some(false));
    }

    #[tokio::test]
    async fn already_set_sql_type_name_is_skipped_but_children_still_visited() {
        let store = SnapshotStore::new(tempfile::tempdir().unwrap().path());
        let enricher = MetadataEnricher::new(reader_with_table(), store);

        let mut model = ProcedureModel {
            descriptor: crate::model::ProcedureDescriptor {
                schema: "sample".to_string(),
                name: "GetPayload".to_string(),
            },
            parameters: vec![],
            table_type_parameters: vec![],
            result_sets: vec![ResultSet {
                columns: vec![ResultColumn {
                    name: "Payload".to_string(),
                    sql_type_name: Some("nvarchar(max)".to_string()),
                    is_nested_json: Some(true),
                    columns: vec![ResultColumn {
                        name: "Email".to_string(),
                        source_schema: Some("sample".to_string()),
                        source_table: Some("UserContacts".to_string()),
                        source_column: Some("Email".to_string()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }],
                ..Default::default()
            }],
            definition_hash: String::new(),
            required_type_refs: vec![],
            required_table_refs: vec![],
            diagnostic_count: 0,
        };

        enricher.enrich(&mut model, &CancellationToken::new()).await.unwrap();
        let outer = &model.result_sets[0].columns[0];
        assert_eq!(outer.sql_type_name.as_deref(), Some("nvarchar(max)"));
        let inner = &outer.columns[0];
        assert_eq!(inner.sql_type_name.as_deref(), Some("nvarchar"));
    }

    #[tokio::test]
    async fn cancelled_token_aborts_without_enriching() {
        let store = SnapshotStore::new(tempfile::tempdir().unwrap().path());
        let enricher = MetadataEnricher::new(reader_with_table(), store);

        let mut model = ProcedureModel {
            descriptor: crate::model::ProcedureDescriptor {
                schema: "sample".to_string(),
                name: "UpsertContact".to_string(),
            },
            parameters: vec![],
            table_type_parameters: vec![],
            result_sets: vec![ResultSet {
                columns: vec![ResultColumn {
                    name: "Email".to_string(),
                    source_schema: Some("sample".to_string()),
                    source_table: Some("UserContacts".to_string()),
                    source_column: Some("Email".to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            definition_hash: String::new(),
            required_type_refs: vec![],
            required_table_refs: vec![],
            diagnostic_count: 0,
        };

        let token = CancellationToken::new();
        token.cancel();
        let err = enricher.enrich(&mut model, &token).await.unwrap_err();
        assert!(matches!(err, XtraqError::Cancelled { .. }));
        assert!(model.result_sets[0].columns[0].sql_type_name.is_none());
    }

    #[tokio::test]
    async fn scalar_function_json_shape_propagates_onto_column() {
        // spec.md §4.8: a referenced function's FOR JSON shape must reach
        // the column even though it never touches a table.
        let reader = Arc::new(FakeCatalogReader::new().with_function(
            crate::model::SchemaObjectRef::new(
                crate::model::SchemaObjectKind::ScalarFunction,
                "sample",
                "GetContactJson",
            ),
            crate::catalog::FunctionMetadata::from_definition(
                "sample",
                "GetContactJson",
                false,
                Some("nvarchar".to_string()),
                Some(-1),
                Some(true),
                Vec::new(),
                "CREATE FUNCTION sample.GetContactJson(@Id INT) RETURNS NVARCHAR(MAX) AS \
                 BEGIN RETURN (SELECT Id FROM sample.Contacts WHERE Id = @Id FOR JSON PATH, ROOT('contact')) END",
            ),
        ));
        let store = SnapshotStore::new(tempfile::tempdir().unwrap().path());
        let enricher = MetadataEnricher::new(reader, store);

        let mut model = ProcedureModel {
            descriptor: crate::model::ProcedureDescriptor {
                schema: "sample".to_string(),
                name: "GetContact".to_string(),
            },
            parameters: vec![],
            table_type_parameters: vec![],
            result_sets: vec![ResultSet {
                columns: vec![ResultColumn {
                    name: "ContactJson".to_string(),
                    reference: Some(ColumnReference {
                        kind: ReferenceKind::Function,
                        schema: Some("sample".to_string()),
                        name: Some("GetContactJson".to_string()),
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            definition_hash: String::new(),
            required_type_refs: vec![],
            required_table_refs: vec![],
            diagnostic_count: 0,
        };

        enricher.enrich(&mut model, &CancellationToken::new()).await.unwrap();
        let col = &model.result_sets[0].columns[0];
        assert_eq!(col.sql_type_name.as_deref(), Some("nvarchar"));
        assert_eq!(col.returns_json, Some(true));
        assert_eq!(col.json_root_property.as_deref(), Some("contact"));
    }

    #[test]
    fn function_reference_without_schema_name_is_not_enriched() {
        let reference = ColumnReference {
            kind: ReferenceKind::Function,
            schema: None,
            name: None,
        };
        assert!(reference.schema.is_none());
    }
}
