//! Identifier validation for config values (spec.md §4.1).
//!
//! Grounded in the teacher's `validation.rs`: whitelist (not blacklist),
//! validate early, fail with a descriptive error — generalized from "is
//! this safe to interpolate into SQL" to "is this a well-formed Xtraq
//! setting".

use crate::error::{XtraqError, XtraqResult};
use once_cell::sync::Lazy;
use regex::Regex;

/// `^[A-Za-z_][A-Za-z0-9_\.]*$`, per spec.md §4.1.
static NAMESPACE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.]*$").expect("static regex"));

/// `^[A-Za-z_][A-Za-z0-9_-]*$`, per spec.md §4.1.
static SCHEMA_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]*$").expect("static regex"));

/// Characters invalid in a path component on the platforms Xtraq targets.
const INVALID_PATH_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*', '\0'];

/// Validates `XTRAQ_NAMESPACE`.
///
/// # Examples
///
/// ```
/// use xtraq_core::config::validate_namespace;
/// validate_namespace("Acme.Orders").unwrap();
/// assert!(validate_namespace("Acme..Orders").is_err());
/// ```
pub fn validate_namespace(namespace: &str) -> XtraqResult<()> {
    if namespace.contains("..") {
        return Err(XtraqError::InvalidNamespace {
            namespace: namespace.to_string(),
            reason: "namespace must not contain '..'".to_string(),
        });
    }
    if !NAMESPACE_RE.is_match(namespace) {
        return Err(XtraqError::InvalidNamespace {
            namespace: namespace.to_string(),
            reason: "namespace must match ^[A-Za-z_][A-Za-z0-9_.]*$".to_string(),
        });
    }
    Ok(())
}

/// Validates `XTRAQ_OUTPUT_DIR`: no invalid path characters.
pub fn validate_output_dir(output_dir: &str) -> XtraqResult<()> {
    if output_dir.is_empty() {
        return Err(XtraqError::InvalidOutputDir {
            output_dir: output_dir.to_string(),
            reason: "output directory must not be empty".to_string(),
        });
    }
    if output_dir.chars().any(|c| INVALID_PATH_CHARS.contains(&c)) {
        return Err(XtraqError::InvalidOutputDir {
            output_dir: output_dir.to_string(),
            reason: "output directory contains an invalid path character".to_string(),
        });
    }
    Ok(())
}

/// Validates one `XTRAQ_BUILD_SCHEMAS` entry.
pub fn validate_schema_identifier(schema: &str) -> XtraqResult<()> {
    if !SCHEMA_RE.is_match(schema) {
        return Err(XtraqError::InvalidSchemaIdentifier {
            identifier: schema.to_string(),
            reason: "schema identifier must match ^[A-Za-z_][A-Za-z0-9_-]*$".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::testing::assert_error_contains;

    #[test]
    fn namespace_rejects_dotdot() {
        assert_error_contains(validate_namespace("Foo..Bar"), "..");
    }

    #[test]
    fn namespace_accepts_dotted_identifiers() {
        validate_namespace("Acme.Data.Orders").unwrap();
    }

    #[test]
    fn namespace_rejects_leading_digit() {
        assert!(validate_namespace("1Acme").is_err());
    }

    #[test]
    fn schema_identifier_rejects_invalid_chars() {
        assert!(validate_schema_identifier("dbo;drop").is_err());
        assert!(validate_schema_identifier("dbo").is_ok());
        assert!(validate_schema_identifier("my-schema").is_ok());
    }

    #[test]
    fn output_dir_rejects_invalid_path_chars() {
        assert!(validate_output_dir("Xtraq<gen>").is_err());
        assert!(validate_output_dir("Xtraq/Generated").is_ok());
    }
}
