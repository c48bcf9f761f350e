use super::store::SnapshotStore;
use crate::error::XtraqResult;
use crate::model::ProcedureCacheSnapshot;

/// Fingerprinted procedure snapshot cache (C11, spec.md §4.11).
///
/// Grounded in the teacher's `queue/cache.rs` load/invalidate/invalidate-all
/// shape (there, an in-process `LazyLock<Mutex<..>>`; here, one file per
/// fingerprint under `cache/`, since Xtraq's cache must survive across
/// process invocations).
#[derive(Debug, Clone)]
pub struct CacheController {
    store: SnapshotStore,
}

impl CacheController {
    #[must_use]
    pub fn new(store: SnapshotStore) -> Self {
        Self { store }
    }

    /// Invalid or whitespace-only fingerprints are treated as no-ops
    /// everywhere in this type, per spec.md §4.11.
    fn is_valid(fingerprint: &str) -> bool {
        !fingerprint.trim().is_empty()
    }

    #[must_use]
    pub fn load(&self, fingerprint: &str) -> Option<ProcedureCacheSnapshot> {
        if !Self::is_valid(fingerprint) {
            return None;
        }
        self.store.read_json_tolerant(&self.store.fingerprint_cache_path(fingerprint))
    }

    pub fn save(&self, fingerprint: &str, snapshot: &ProcedureCacheSnapshot) -> XtraqResult<()> {
        if !Self::is_valid(fingerprint) {
            return Ok(());
        }
        self.store.write_json_atomic(&self.store.fingerprint_cache_path(fingerprint), snapshot)
    }

    pub fn invalidate(&self, fingerprint: &str) -> XtraqResult<()> {
        if !Self::is_valid(fingerprint) {
            return Ok(());
        }
        let path = self.store.fingerprint_cache_path(fingerprint);
        if path.is_file() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    /// Deletes every `*.json` file in the cache directory.
    pub fn invalidate_all(&self) -> XtraqResult<()> {
        self.invalidate_by_pattern("*")
    }

    /// Glob-matches `expr` against top-level files in the cache directory
    /// only, per spec.md §4.11:
    /// - if `expr` lacks `*`, append `*`
    /// - if `expr` lacks `.json`, append `.json`
    pub fn invalidate_by_pattern(&self, expr: &str) -> XtraqResult<()> {
        let dir = self.store.cache_dir();
        if !dir.is_dir() {
            return Ok(());
        }

        let mut pattern = expr.to_string();
        if !pattern.contains('*') {
            pattern.push('*');
        }
        if !pattern.ends_with(".json") && !pattern.contains(".json") {
            pattern.push_str(".json");
        }

        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if glob_match(&pattern, &name) {
                std::fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

/// Minimal top-level `*` glob matcher (no `?`, no recursive `**`, no path
/// separators — the cache directory is always flat).
fn glob_match(pattern: &str, name: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == name;
    }

    let mut pos = 0usize;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            if !name[pos..].starts_with(part) {
                return false;
            }
            pos += part.len();
        } else if i == parts.len() - 1 {
            return name[pos..].ends_with(part);
        } else {
            match name[pos..].find(part) {
                Some(idx) => pos += idx + part.len(),
                None => return false,
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;

    fn snapshot() -> ProcedureCacheSnapshot {
        ProcedureCacheSnapshot {
            fingerprint: "abc-1".to_string(),
            created_utc: Utc::now(),
            procedures: vec![],
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let controller = CacheController::new(SnapshotStore::new(dir.path()));
        controller.save("abc-1", &snapshot()).unwrap();
        let loaded = controller.load("abc-1").unwrap();
        assert_eq!(loaded.fingerprint, "abc-1");
    }

    #[test]
    fn whitespace_fingerprint_is_a_no_op() {
        let dir = tempdir().unwrap();
        let controller = CacheController::new(SnapshotStore::new(dir.path()));
        controller.save("   ", &snapshot()).unwrap();
        assert!(!dir.path().join(".xtraq/cache").exists() || std::fs::read_dir(dir.path().join(".xtraq/cache")).map(|mut d| d.next().is_none()).unwrap_or(true));
    }

    #[test]
    fn invalidate_by_pattern_matches_prefix_only() {
        // spec.md §8 scenario 5.
        let dir = tempdir().unwrap();
        let controller = CacheController::new(SnapshotStore::new(dir.path()));
        controller.save("abc-1", &snapshot()).unwrap();
        controller.save("abc-2", &snapshot()).unwrap();
        controller.save("xyz", &snapshot()).unwrap();

        controller.invalidate_by_pattern("abc-").unwrap();

        assert!(controller.load("abc-1").is_none());
        assert!(controller.load("abc-2").is_none());
        assert!(controller.load("xyz").is_some());
    }

    #[test]
    fn invalidate_all_removes_every_cache_file() {
        let dir = tempdir().unwrap();
        let controller = CacheController::new(SnapshotStore::new(dir.path()));
        controller.save("a", &snapshot()).unwrap();
        controller.save("b", &snapshot()).unwrap();

        controller.invalidate_all().unwrap();

        assert!(controller.load("a").is_none());
        assert!(controller.load("b").is_none());
    }
}
