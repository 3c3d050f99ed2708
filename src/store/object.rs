use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use log::debug;

use crate::dirs;

/// Opaque upload target. Returns the URL the stored object is served from.
pub trait ObjectStore: Send + Sync {
    fn put(&self, key: &str, data: &[u8]) -> Result<String>;
}

/// Rejects keys that could escape the store root.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        bail!("object key is empty");
    }
    for component in Path::new(key).components() {
        match component {
            Component::Normal(_) => {}
            _ => bail!("object key '{key}' must be a relative path without '..'"),
        }
    }
    Ok(())
}

/// Objects stored as plain files under a root directory.
pub struct LocalObjectStore {
    root: PathBuf,
    url_prefix: String,
}

impl LocalObjectStore {
    pub fn new(root: PathBuf, url_prefix: String) -> Self {
        Self { root, url_prefix }
    }
}

impl ObjectStore for LocalObjectStore {
    fn put(&self, key: &str, data: &[u8]) -> Result<String> {
        validate_key(key)?;
        let path = self.root.join(key);
        if let Some(dir) = path.parent() {
            dirs::ensure_dir_exists(dir)
                .with_context(|| format!("ensure object dir {}", dir.display()))?;
        }
        debug!("Write object {key} ({} bytes)", data.len());
        fs::write(&path, data).with_context(|| format!("write object {}", path.display()))?;
        Ok(format!("{}/{key}", self.url_prefix.trim_end_matches('/')))
    }
}

/// Objects kept in process memory, for tests and throwaway deployments.
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    url_prefix: String,
}

impl MemoryObjectStore {
    pub fn new(url_prefix: String) -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            url_prefix,
        }
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().ok()?.get(key).cloned()
    }
}

impl ObjectStore for MemoryObjectStore {
    fn put(&self, key: &str, data: &[u8]) -> Result<String> {
        validate_key(key)?;
        let mut objects = match self.objects.lock() {
            Ok(objects) => objects,
            Err(e) => bail!("failed to lock objects: {e:#}"),
        };
        objects.insert(key.to_string(), data.to_vec());
        Ok(format!("{}/{key}", self.url_prefix.trim_end_matches('/')))
    }
}
