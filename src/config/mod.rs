//! Configuration: project discovery and precedence-ordered settings
//! resolution (spec.md §4.1).
//!
//! The teacher (`pg_tviews`) resolves settings from PostgreSQL GUC
//! variables registered once at `_PG_init()` — a single, flat source with
//! no merging. Xtraq's settings instead come from four layered sources with
//! a strict precedence lattice (highest first): explicit per-call
//! overrides, `XTRAQ_*` process environment, a parsed `.env`/`.env.local`,
//! and a tracked `.xtraqconfig` manifest merged with its untracked
//! `.xtraqconfig.local` (same "local wins where non-empty" rule as
//! `.env.local`). This module keeps the teacher's split between
//! compile-time constants and a small set of free functions, generalized
//! from "read a GUC" to "walk the precedence lattice".

mod env_file;
mod manifest;
mod validate;

pub use env_file::parse_env_file;
pub use manifest::{Manifest, ManifestRedirect};
pub use validate::{validate_namespace, validate_output_dir, validate_schema_identifier};

use manifest::ManifestDefaults;

use crate::error::{XtraqError, XtraqResult};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Maximum `.xtraqconfig` `ProjectPath` redirect hops before giving up on
/// the last-visited directory, per spec.md §4.1 / §8.
pub const MAX_REDIRECT_HOPS: usize = 10;

/// Default value for `XTRAQ_OUTPUT_DIR` when unset anywhere in the
/// precedence chain.
pub const DEFAULT_OUTPUT_DIR: &str = "Xtraq";

const ENV_PREFIX: &str = "XTRAQ_";

/// Settings this crate recognizes, in the order spec.md §4.1 lists them.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub generator_db: Option<String>,
    pub namespace: Option<String>,
    pub output_dir: Option<String>,
    pub build_schemas: Option<Vec<String>>,
    pub target_framework: Option<String>,
    pub json_include_null_values: Option<bool>,
    pub verbose: Option<bool>,
    pub config_path: Option<PathBuf>,
}

/// The fully-resolved, merged view of every recognized setting.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveConfig {
    pub project_root: PathBuf,
    pub config_path: PathBuf,
    pub generator_connection_string: String,
    pub namespace: Option<String>,
    pub output_dir: String,
    pub build_schemas: Vec<String>,
    pub target_framework: Option<String>,
    pub json_include_null_values: bool,
    pub verbose: bool,
}

/// Isolates the "publish resolved settings back to the process
/// environment" side effect (spec.md §4.1 / §9: "implementations targeting
/// languages without mutable globals should isolate this via an explicit
/// `EnvironmentPublisher` interface" — Rust's global mutable `std::env` is
/// exactly that situation, so tests get a fake instead of touching the
/// real process environment).
pub trait EnvironmentPublisher {
    fn publish(&self, key: &str, value: &str);
}

/// Default publisher: writes to the real process environment. Mutating
/// `std::env` is process-wide and `unsafe` as of Rust 2024's hardened
/// `std::env::set_var`; this is the one place in the crate that does it,
/// matching spec.md's "published side effects" note that this state is
/// init-only and never rolled back.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnvironmentPublisher;

impl EnvironmentPublisher for ProcessEnvironmentPublisher {
    fn publish(&self, key: &str, value: &str) {
        // SAFETY: ConfigResolver::load runs once, early, before any other
        // thread in the process reads these specific keys.
        unsafe {
            std::env::set_var(key, value);
        }
    }
}

/// Walks `start` and its ancestors looking for `.xtraqconfig`. Returns the
/// directory containing the first one found.
fn find_manifest_dir(start: &Path) -> XtraqResult<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        if dir.join(".xtraqconfig").is_file() {
            return Ok(dir);
        }
        if !dir.pop() {
            return Err(XtraqError::ProjectNotInitialised {
                searched_from: start.display().to_string(),
            });
        }
    }
}

/// Follows `ProjectPath` redirects starting at `manifest_dir`, up to
/// [`MAX_REDIRECT_HOPS`]. Returns the directory of the final (non-redirect
/// or exhausted) manifest plus the parsed manifest found there, per
/// spec.md §4.1 and the §8 boundary test ("redirect chain of length > 10
/// does not loop forever; returns the last hop's directory").
fn follow_redirects(manifest_dir: &Path) -> XtraqResult<(PathBuf, Manifest)> {
    let mut current = manifest_dir.to_path_buf();
    let mut visited = std::collections::HashSet::new();

    for _ in 0..=MAX_REDIRECT_HOPS {
        let manifest_path = current.join(".xtraqconfig");
        let manifest = manifest::load(&manifest_path)?;

        match manifest {
            Manifest::Redirect(ManifestRedirect { project_path }) => {
                let target = if project_path == "." {
                    current.clone()
                } else {
                    let p = Path::new(&project_path);
                    if p.is_absolute() {
                        p.to_path_buf()
                    } else {
                        current.join(p)
                    }
                };
                let target = normalize(&target);
                if !visited.insert(target.clone()) {
                    // Cycle: stop at the last hop visited, not an error.
                    return Ok((current, Manifest::Redirect(ManifestRedirect { project_path })));
                }
                if !target.join(".xtraqconfig").is_file() {
                    // Redirect target has no manifest of its own: treat the
                    // redirect itself as the terminal hop.
                    return Ok((current, manifest::load(&manifest_path)?));
                }
                current = target;
            }
            defaults => return Ok((current, defaults)),
        }
    }

    // Overflow: return the last directory visited, per spec.md §8.
    let manifest = manifest::load(&current.join(".xtraqconfig"))?;
    Ok((current, manifest))
}

fn normalize(path: &Path) -> PathBuf {
    // `canonicalize` requires the path to exist; fall back to the raw join
    // for not-yet-materialized test fixtures.
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// Reads `XTRAQ_*` keys from the process environment.
fn read_process_env() -> HashMap<String, String> {
    std::env::vars()
        .filter(|(k, _)| k.starts_with(ENV_PREFIX))
        .collect()
}

/// Reads `.env` then `.env.local` (local wins) from `dir`, merging their
/// `XTRAQ_*` keys.
fn read_env_files(dir: &Path) -> XtraqResult<HashMap<String, String>> {
    let mut merged = HashMap::new();
    for name in [".env", ".env.local"] {
        let path = dir.join(name);
        if path.is_file() {
            let contents = std::fs::read_to_string(&path)?;
            let parsed = parse_env_file(&contents);
            if parsed.is_empty() {
                return Err(XtraqError::EnvFileMissingMarker {
                    path: path.display().to_string(),
                });
            }
            merged.extend(parsed);
        }
    }
    Ok(merged)
}

/// Loads `.xtraqconfig.local` from `project_root` if present, classified
/// the same way as the tracked manifest. A local redirect has no meaning
/// (spec.md §4.1 only describes `.local` overriding defaults fields), so it
/// is treated as absent.
fn load_local_manifest(project_root: &Path) -> XtraqResult<Option<ManifestDefaults>> {
    let path = project_root.join(".xtraqconfig.local");
    if !path.is_file() {
        return Ok(None);
    }
    Ok(manifest::load(&path)?.as_defaults())
}

/// Merges `.xtraqconfig.local` over the tracked `.xtraqconfig` defaults,
/// per spec.md §4.1 / §247: local overrides win where non-empty, the same
/// precedence `.env.local` already has over `.env`.
fn merge_local_overrides(tracked: Option<ManifestDefaults>, local: Option<ManifestDefaults>) -> Option<ManifestDefaults> {
    let Some(local) = local else {
        return tracked;
    };
    let mut merged = tracked.unwrap_or_default();
    if let Some(namespace) = non_empty(local.namespace) {
        merged.namespace = Some(namespace);
    }
    if let Some(output_dir) = non_empty(local.output_dir) {
        merged.output_dir = Some(output_dir);
    }
    if let Some(target_framework) = non_empty(local.target_framework) {
        merged.target_framework = Some(target_framework);
    }
    if !local.build_schemas.is_empty() {
        merged.build_schemas = local.build_schemas;
    }
    Some(merged)
}

/// Resolves the effective configuration for `input_dir`, per the strict
/// precedence lattice of spec.md §4.1: overrides, then process env, then
/// env files, then the tracked manifest's defaults merged with
/// `.xtraqconfig.local`.
pub fn load(input_dir: &Path, overrides: &Overrides) -> XtraqResult<EffectiveConfig> {
    load_with_publisher(input_dir, overrides, &ProcessEnvironmentPublisher)
}

pub fn load_with_publisher(
    input_dir: &Path,
    overrides: &Overrides,
    publisher: &dyn EnvironmentPublisher,
) -> XtraqResult<EffectiveConfig> {
    let manifest_dir = find_manifest_dir(input_dir)?;
    let (project_root, manifest) = follow_redirects(&manifest_dir)?;
    let config_path = project_root.join(".xtraqconfig");

    let process_env = read_process_env();
    let env_file_vars = read_env_files(&project_root)?;

    let local_defaults = load_local_manifest(&project_root)?;
    let defaults = merge_local_overrides(manifest.as_defaults(), local_defaults);

    let generator_connection_string = overrides
        .generator_db
        .clone()
        .or_else(|| process_env.get("XTRAQ_GENERATOR_DB").cloned())
        .or_else(|| env_file_vars.get("XTRAQ_GENERATOR_DB").cloned())
        .ok_or(XtraqError::MissingConnectionString)?;

    let namespace = overrides
        .namespace
        .clone()
        .or_else(|| process_env.get("XTRAQ_NAMESPACE").cloned())
        .or_else(|| env_file_vars.get("XTRAQ_NAMESPACE").cloned())
        .or_else(|| defaults.as_ref().and_then(|d| non_empty(d.namespace.clone())));
    if let Some(ns) = &namespace {
        validate_namespace(ns)?;
    }

    let output_dir = overrides
        .output_dir
        .clone()
        .or_else(|| process_env.get("XTRAQ_OUTPUT_DIR").cloned())
        .or_else(|| env_file_vars.get("XTRAQ_OUTPUT_DIR").cloned())
        .or_else(|| defaults.as_ref().and_then(|d| non_empty(d.output_dir.clone())))
        .unwrap_or_else(|| DEFAULT_OUTPUT_DIR.to_string());
    validate_output_dir(&output_dir)?;

    let build_schemas = overrides
        .build_schemas
        .clone()
        .or_else(|| {
            process_env
                .get("XTRAQ_BUILD_SCHEMAS")
                .map(|v| split_schema_list(v))
        })
        .or_else(|| {
            env_file_vars
                .get("XTRAQ_BUILD_SCHEMAS")
                .map(|v| split_schema_list(v))
        })
        .or_else(|| defaults.as_ref().filter(|d| !d.build_schemas.is_empty()).map(|d| d.build_schemas.clone()))
        .unwrap_or_default();
    for schema in &build_schemas {
        validate_schema_identifier(schema)?;
    }
    let build_schemas = dedup_ci_preserve_order(build_schemas);

    let target_framework = overrides
        .target_framework
        .clone()
        .or_else(|| process_env.get("XTRAQ_TARGET_FRAMEWORK").cloned())
        .or_else(|| env_file_vars.get("XTRAQ_TARGET_FRAMEWORK").cloned())
        .or_else(|| defaults.as_ref().and_then(|d| non_empty(d.target_framework.clone())));

    let json_include_null_values = overrides
        .json_include_null_values
        .or_else(|| parse_bool_env(&process_env, "XTRAQ_JSON_INCLUDE_NULL_VALUES"))
        .or_else(|| parse_bool_env(&env_file_vars, "XTRAQ_JSON_INCLUDE_NULL_VALUES"))
        .unwrap_or(false);

    let verbose = overrides
        .verbose
        .or_else(|| parse_bool_env(&process_env, "XTRAQ_VERBOSE"))
        .or_else(|| parse_bool_env(&env_file_vars, "XTRAQ_VERBOSE"))
        .unwrap_or(false);

    let effective = EffectiveConfig {
        project_root: project_root.clone(),
        config_path: config_path.clone(),
        generator_connection_string,
        namespace,
        output_dir,
        build_schemas,
        target_framework,
        json_include_null_values,
        verbose,
    };

    publish(&effective, publisher);
    Ok(effective)
}

/// Published environment variables (spec.md §6): init-only, never unset.
fn publish(config: &EffectiveConfig, publisher: &dyn EnvironmentPublisher) {
    publisher.publish("XTRAQ_PROJECT_ROOT", &config.project_root.display().to_string());
    publisher.publish("XTRAQ_CONFIG_PATH", &config.config_path.display().to_string());
    publisher.publish("XTRAQ_BUILD_SCHEMAS", &config.build_schemas.join(","));
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|v| !v.is_empty())
}

fn parse_bool_env(map: &HashMap<String, String>, key: &str) -> Option<bool> {
    map.get(key).map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn split_schema_list(raw: &str) -> Vec<String> {
    raw.split([',', ';'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn dedup_ci_preserve_order(items: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        if seen.insert(item.to_lowercase()) {
            out.push(item);
        }
    }
    out
}

/// Concurrency ceiling for per-procedure analysis (spec.md §9 Open
/// Question (c)): left configurable, defaulting to the machine's apparent
/// parallelism.
pub fn analysis_concurrency() -> usize {
    static CEILING: OnceLock<usize> = OnceLock::new();
    *CEILING.get_or_init(|| {
        std::env::var("XTRAQ_ANALYSIS_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| std::thread::available_parallelism().map(std::num::NonZeroUsize::get).unwrap_or(4))
    })
}
