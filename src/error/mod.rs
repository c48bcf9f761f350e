//! Error taxonomy for the Xtraq metadata pipeline.
//!
//! Every fallible operation in this crate returns [`XtraqError`]. Variants are
//! grouped the way spec.md §7 groups them (configuration, catalog, snapshot
//! I/O, parsing, enrichment, cache) rather than by which module raises them,
//! so a caller can dispatch on "is this fatal to the whole run" without
//! knowing which component failed.

pub mod testing;

use thiserror::Error;

/// Error kinds, grouped per spec.md §7. `exit_code()` maps each group onto
/// the semantic (not bit-exact) CLI exit codes from spec.md §6.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum XtraqError {
    // ============ Configuration Errors (exit 30) ============
    #[error("project not initialised: no .xtraqconfig found above '{searched_from}'")]
    ProjectNotInitialised { searched_from: String },

    #[error("invalid namespace '{namespace}': {reason}")]
    InvalidNamespace { namespace: String, reason: String },

    #[error("invalid output directory '{output_dir}': {reason}")]
    InvalidOutputDir { output_dir: String, reason: String },

    #[error("invalid schema identifier '{identifier}': {reason}")]
    InvalidSchemaIdentifier { identifier: String, reason: String },

    #[error("missing required setting XTRAQ_GENERATOR_DB (connection string)")]
    MissingConnectionString,

    #[error("env file '{path}' is present but contains no XTRAQ_* entry")]
    EnvFileMissingMarker { path: String },

    #[error(".xtraqconfig at '{path}' is malformed: {reason}")]
    MalformedManifest { path: String, reason: String },

    // ============ Catalog Errors (exit 20) ============
    #[error("catalog unavailable: {reason}")]
    CatalogUnavailable { reason: String },

    // ============ Cancellation (fail-closed, spec.md §5) ============
    #[error("operation cancelled: {operation}")]
    Cancelled { operation: String },

    // ============ Snapshot I/O Errors (exit 40) ============
    #[error("failed to write snapshot for '{object}': {reason}")]
    SnapshotIoError { object: String, reason: String },

    #[error("failed to read snapshot index: {reason}")]
    IndexIoError { reason: String },

    // ============ Parse Errors (non-fatal) ============
    #[error("failed to parse procedure '{procedure}': {reason}")]
    ParseError { procedure: String, reason: String },

    // ============ Enrichment Errors (non-fatal) ============
    #[error("could not enrich column '{column}' in '{procedure}': {reason}")]
    EnrichmentGap {
        procedure: String,
        column: String,
        reason: String,
    },

    // ============ Cache Corruption (exit 50) ============
    #[error("cache file '{path}' is corrupt: {reason}")]
    CacheCorruption { path: String, reason: String },

    // ============ Generic wrapped errors ============
    #[error("serialization error: {message}")]
    SerializationError { message: String },

    #[error("I/O error: {message}")]
    IoError { message: String },

    #[error("internal error at {file}:{line}: {message} (this is a bug, please report it)")]
    InternalError {
        message: String,
        file: &'static str,
        line: u32,
    },
}

impl XtraqError {
    /// Semantic CLI exit code per spec.md §6. Not bit-exact — a CLI driving
    /// this crate may remap, but the grouping is authoritative.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        use XtraqError::{
            CacheCorruption, CatalogUnavailable, EnvFileMissingMarker, IndexIoError,
            InvalidNamespace, InvalidOutputDir, InvalidSchemaIdentifier, MalformedManifest,
            MissingConnectionString, ProjectNotInitialised, SnapshotIoError,
        };
        match self {
            CatalogUnavailable { .. } => 20,
            ProjectNotInitialised { .. }
            | InvalidNamespace { .. }
            | InvalidOutputDir { .. }
            | InvalidSchemaIdentifier { .. }
            | MissingConnectionString
            | EnvFileMissingMarker { .. }
            | MalformedManifest { .. } => 30,
            SnapshotIoError { .. } | IndexIoError { .. } => 40,
            CacheCorruption { .. } => 50,
            _ => 1,
        }
    }

    /// Whether this error kind is fatal to the whole run (spec.md §7
    /// propagation policy) as opposed to being captured per-object.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            XtraqError::ProjectNotInitialised { .. }
                | XtraqError::InvalidNamespace { .. }
                | XtraqError::InvalidOutputDir { .. }
                | XtraqError::InvalidSchemaIdentifier { .. }
                | XtraqError::MissingConnectionString
                | XtraqError::EnvFileMissingMarker { .. }
                | XtraqError::MalformedManifest { .. }
                | XtraqError::CatalogUnavailable { .. }
                | XtraqError::Cancelled { .. }
        )
    }

    #[must_use]
    pub fn internal(message: String, file: &'static str, line: u32) -> Self {
        XtraqError::InternalError { message, file, line }
    }
}

pub type XtraqResult<T> = Result<T, XtraqError>;

impl From<serde_json::Error> for XtraqError {
    fn from(e: serde_json::Error) -> Self {
        XtraqError::SerializationError {
            message: format!("JSON error: {e}"),
        }
    }
}

impl From<std::io::Error> for XtraqError {
    fn from(e: std::io::Error) -> Self {
        XtraqError::IoError {
            message: e.to_string(),
        }
    }
}

/// Creates an [`XtraqError::InternalError`] with the call site's file/line.
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::error::XtraqError::internal($msg.to_string(), file!(), line!())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::XtraqError::internal(format!($fmt, $($arg)*), file!(), line!())
    };
}

/// Unwraps an `Option`, returning the given error from the enclosing
/// function otherwise.
#[macro_export]
macro_rules! require {
    ($opt:expr, $err:expr) => {
        match $opt {
            Some(v) => v,
            None => return Err($err),
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_not_initialised_message() {
        let err = XtraqError::ProjectNotInitialised {
            searched_from: "/tmp/project".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("/tmp/project"));
        assert_eq!(err.exit_code(), 30);
        assert!(err.is_fatal());
    }

    #[test]
    fn catalog_unavailable_is_fatal_with_exit_20() {
        let err = XtraqError::CatalogUnavailable {
            reason: "connection refused".to_string(),
        };
        assert_eq!(err.exit_code(), 20);
        assert!(err.is_fatal());
    }

    #[test]
    fn parse_error_is_non_fatal() {
        let err = XtraqError::ParseError {
            procedure: "dbo.GetUsers".to_string(),
            reason: "unbalanced parens".to_string(),
        };
        assert!(!err.is_fatal());
    }

    #[test]
    fn internal_error_macro_captures_location() {
        let err = internal_error!("unreachable: {}", "branch X");
        match err {
            XtraqError::InternalError { message, file, line } => {
                assert!(message.contains("unreachable"));
                assert!(file.ends_with("mod.rs"));
                assert!(line > 0);
            }
            _ => panic!("wrong variant"),
        }
    }
}
