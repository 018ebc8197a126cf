use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ragdb_core::{Error, Result};

use crate::collection::Collection;
use crate::index::IndexParams;
use crate::persist::artifact_exists;

/// Registry of collections, optionally backed by a data directory with one
/// sub-directory per collection.
pub struct CollectionStore {
    collections: RwLock<HashMap<String, Arc<Collection>>>,
    data_dir: Option<PathBuf>,
    params: IndexParams,
    model_name: String,
    dimension: Option<usize>,
}

impl CollectionStore {
    /// `model_name` is the running embedder; `dimension`, when known up front,
    /// is checked against persisted collections on load.
    pub fn new(data_dir: Option<PathBuf>, params: IndexParams, model_name: impl Into<String>, dimension: Option<usize>) -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            data_dir,
            params,
            model_name: model_name.into(),
            dimension,
        }
    }

    pub fn in_memory(params: IndexParams, model_name: impl Into<String>) -> Self {
        Self::new(None, params, model_name, None)
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn collection_dir(&self, name: &str) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join(name))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn validate_name(name: &str) -> Result<()> {
        let ok = !name.is_empty()
            && name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && name != "."
            && name != "..";
        if ok {
            Ok(())
        } else {
            Err(Error::InvalidConfig(format!("invalid collection name '{}'", name)))
        }
    }

    fn try_load(&self, name: &str) -> Result<Option<Arc<Collection>>> {
        let Some(dir) = self.collection_dir(name) else { return Ok(None) };
        if !artifact_exists(&dir) {
            return Ok(None);
        }
        let loaded = Collection::load(name, &dir, &self.model_name, self.dimension, self.params.nprobe)?;
        let mut map = self.collections.write();
        Ok(Some(map.entry(name.to_string()).or_insert_with(|| Arc::new(loaded)).clone()))
    }

    /// A loaded collection, reading it from disk on first access.
    pub fn get(&self, name: &str) -> Result<Option<Arc<Collection>>> {
        if let Some(c) = self.collections.read().get(name) {
            return Ok(Some(c.clone()));
        }
        Self::validate_name(name)?;
        self.try_load(name)
    }

    pub fn require(&self, name: &str) -> Result<Arc<Collection>> {
        self.get(name)?.ok_or_else(|| Error::NotFound(format!("collection '{}'", name)))
    }

    /// The collection `name`, created with `dimension` and `model` if it does
    /// not exist yet. An existing collection must match both.
    pub fn get_or_create(&self, name: &str, dimension: usize, model: &str) -> Result<Arc<Collection>> {
        if let Some(existing) = self.get(name)? {
            existing.check_compatible(model, dimension)?;
            return Ok(existing);
        }
        let mut map = self.collections.write();
        let c = map
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::info!(collection = name, dimension, model, "collection created");
                Arc::new(Collection::new(name, dimension, model, self.params))
            })
            .clone();
        drop(map);
        c.check_compatible(model, dimension)?;
        Ok(c)
    }

    /// Load every collection found in the data directory. Collections that
    /// fail their compatibility check are reported, not skipped silently.
    pub fn load_all(&self) -> Result<Vec<String>> {
        let Some(root) = &self.data_dir else { return Ok(Vec::new()) };
        if !root.is_dir() {
            return Ok(Vec::new());
        }
        let mut loaded = Vec::new();
        let mut entries: Vec<PathBuf> = fs::read_dir(root)?
            .filter_map(std::result::Result::ok)
            .map(|e| e.path())
            .filter(|p| artifact_exists(p))
            .collect();
        entries.sort();
        for dir in entries {
            let Some(name) = dir.file_name().map(|n| n.to_string_lossy().into_owned()) else { continue };
            if self.get(&name)?.is_some() {
                loaded.push(name);
            }
        }
        Ok(loaded)
    }

    pub async fn persist(&self, name: &str) -> Result<Option<PathBuf>> {
        let Some(dir) = self.collection_dir(name) else { return Ok(None) };
        let c = self.require(name)?;
        c.persist(&dir).await.map(Some)
    }

    /// Forget the collection and delete its artifact. Returns whether it existed.
    pub fn drop_collection(&self, name: &str) -> Result<bool> {
        Self::validate_name(name)?;
        let removed = self.collections.write().remove(name).is_some();
        let mut existed_on_disk = false;
        if let Some(dir) = self.collection_dir(name) {
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
                existed_on_disk = true;
            }
        }
        if removed || existed_on_disk {
            tracing::info!(collection = name, "collection dropped");
        }
        Ok(removed || existed_on_disk)
    }
}
