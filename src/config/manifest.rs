//! `.xtraqconfig` document handling (spec.md §4.1 / §6).
//!
//! The manifest is EITHER a redirect (`{"ProjectPath": "..."}`) OR a
//! defaults document (`Namespace`/`OutputDir`/`TargetFramework`/
//! `BuildSchemas`). The two variants must not mix.

use crate::error::{XtraqError, XtraqResult};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestRedirect {
    #[serde(rename = "ProjectPath")]
    pub project_path: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManifestDefaults {
    #[serde(rename = "Namespace", default)]
    pub namespace: Option<String>,
    #[serde(rename = "OutputDir", default)]
    pub output_dir: Option<String>,
    #[serde(rename = "TargetFramework", default)]
    pub target_framework: Option<String>,
    #[serde(rename = "BuildSchemas", default)]
    pub build_schemas: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum Manifest {
    Redirect(ManifestRedirect),
    Defaults(ManifestDefaults),
}

impl Manifest {
    #[must_use]
    pub fn as_defaults(&self) -> Option<ManifestDefaults> {
        match self {
            Manifest::Defaults(d) => Some(d.clone()),
            Manifest::Redirect(_) => None,
        }
    }
}

/// Loads and classifies the manifest at `path`. A document containing
/// `ProjectPath` is always treated as a redirect regardless of any other
/// (invalid, per spec.md §6) keys present alongside it.
pub fn load(path: &Path) -> XtraqResult<Manifest> {
    let contents = std::fs::read_to_string(path)?;
    let value: serde_json::Value = serde_json::from_str(&contents).map_err(|e| {
        XtraqError::MalformedManifest {
            path: path.display().to_string(),
            reason: e.to_string(),
        }
    })?;

    if value.get("ProjectPath").is_some() {
        let redirect: ManifestRedirect =
            serde_json::from_value(value).map_err(|e| XtraqError::MalformedManifest {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        return Ok(Manifest::Redirect(redirect));
    }

    let defaults: ManifestDefaults =
        serde_json::from_value(value).map_err(|e| XtraqError::MalformedManifest {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
    Ok(Manifest::Defaults(defaults))
}
