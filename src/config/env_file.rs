//! `.env`/`.env.local` parsing (spec.md §4.1 "Env file parsing").

use std::collections::HashMap;

/// Line-based parse: trim, skip empty lines and `#` comments, split at the
/// first `=`, strip one layer of paired leading/trailing quotes, and keep
/// only `XTRAQ_*` keys.
#[must_use]
pub fn parse_env_file(contents: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if !key.starts_with("XTRAQ_") {
            continue;
        }
        out.insert(key.to_string(), unquote(value.trim()));
    }
    out
}

fn unquote(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return value[1..value.len() - 1].to_string();
        }
    }
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_comments_and_blank_lines() {
        let parsed = parse_env_file("# comment\n\nXTRAQ_NAMESPACE=App\n");
        assert_eq!(parsed.get("XTRAQ_NAMESPACE"), Some(&"App".to_string()));
    }

    #[test]
    fn strips_paired_quotes() {
        let parsed = parse_env_file("XTRAQ_GENERATOR_DB=\"Server=.;Trusted=1;\"\n");
        assert_eq!(
            parsed.get("XTRAQ_GENERATOR_DB"),
            Some(&"Server=.;Trusted=1;".to_string())
        );
    }

    #[test]
    fn drops_non_xtraq_keys() {
        let parsed = parse_env_file("PATH=/usr/bin\nXTRAQ_VERBOSE=1\n");
        assert_eq!(parsed.len(), 1);
        assert!(parsed.contains_key("XTRAQ_VERBOSE"));
    }

    #[test]
    fn splits_only_at_first_equals() {
        let parsed = parse_env_file("XTRAQ_GENERATOR_DB=Server=.;Database=App=1;\n");
        assert_eq!(
            parsed.get("XTRAQ_GENERATOR_DB"),
            Some(&"Server=.;Database=App=1;".to_string())
        );
    }
}
