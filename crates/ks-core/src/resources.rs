use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("resource directory not found: {0}")]
    MissingDir(PathBuf),
    #[error("io: {0}")]
    Io(String),
    #[error("resource cache lock poisoned")]
    Poisoned,
}

/// In-memory cache of bundled resource files, keyed by file name.
///
/// Filled once by [`ResourceCache::preload`] (normally from the background
/// startup tier) and read from anywhere afterwards.
pub struct ResourceCache {
    dir: Option<PathBuf>,
    extensions: Vec<String>,
    entries: RwLock<HashMap<String, Arc<[u8]>>>,
    loaded: AtomicBool,
}

impl ResourceCache {
    /// Cache that preloads `dir`. Extensions are matched case-insensitively
    /// without the leading dot; an empty list accepts every file.
    pub fn new(dir: Option<PathBuf>, extensions: Vec<String>) -> Self {
        Self {
            dir,
            extensions: extensions
                .into_iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            entries: RwLock::new(HashMap::new()),
            loaded: AtomicBool::new(false),
        }
    }

    /// Cache with nothing to preload.
    pub fn empty() -> Self {
        Self::new(None, Vec::new())
    }

    /// Read every matching regular file of the directory into memory.
    ///
    /// Returns the number of files loaded. Without a configured directory
    /// this is a successful no-op.
    pub fn preload(&self) -> Result<usize, ResourceError> {
        let Some(dir) = &self.dir else {
            self.loaded.store(true, Ordering::Release);
            return Ok(0);
        };
        if !dir.is_dir() {
            return Err(ResourceError::MissingDir(dir.clone()));
        }

        let mut loaded = HashMap::new();
        let read_dir = std::fs::read_dir(dir).map_err(|e| ResourceError::Io(e.to_string()))?;
        for entry in read_dir {
            let entry = entry.map_err(|e| ResourceError::Io(e.to_string()))?;
            let path = entry.path();
            if !path.is_file() || !self.accepts(&path) {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let bytes = std::fs::read(&path).map_err(|e| ResourceError::Io(e.to_string()))?;
            loaded.insert(name.to_string(), Arc::from(bytes));
        }

        let count = loaded.len();
        {
            let mut entries = self.entries.write().map_err(|_| ResourceError::Poisoned)?;
            entries.extend(loaded);
        }
        self.loaded.store(true, Ordering::Release);
        tracing::info!(dir = %dir.display(), count, "resources preloaded");
        Ok(count)
    }

    fn accepts(&self, path: &Path) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
            .unwrap_or(false)
    }

    /// Preloaded bytes for `name`, if present.
    pub fn get(&self, name: &str) -> Option<Arc<[u8]>> {
        self.entries.read().ok()?.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once a preload pass has finished.
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preload_without_dir_is_noop() {
        let cache = ResourceCache::empty();
        assert_eq!(cache.preload().unwrap(), 0);
        assert!(cache.is_loaded());
        assert!(cache.is_empty());
    }

    #[test]
    fn preload_filters_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("loading.json"), b"{\"v\":1}").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"skip me").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let cache = ResourceCache::new(Some(dir.path().to_path_buf()), vec![".JSON".into()]);
        assert_eq!(cache.preload().unwrap(), 1);
        assert_eq!(&*cache.get("loading.json").unwrap(), b"{\"v\":1}");
        assert!(cache.get("notes.txt").is_none());
    }

    #[test]
    fn preload_missing_dir_errors() {
        let cache = ResourceCache::new(Some(PathBuf::from("/definitely/not/here")), vec![]);
        assert!(matches!(cache.preload(), Err(ResourceError::MissingDir(_))));
        assert!(!cache.is_loaded());
    }
}
