use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, RwLock};

use ragdb_core::types::{ChunkRecord, Meta, SearchHit};
use ragdb_core::{Error, Result};

use crate::index::{IndexParams, VectorIndex};
use crate::persist::{self, LoadExpectations};

/// Committed, immutable view of a collection: the index plus the side table
/// whose position `i` describes internal id `i`.
#[derive(Debug, Clone)]
pub struct CollectionState {
    pub index: VectorIndex,
    pub records: Vec<ChunkRecord>,
}

impl CollectionState {
    fn matches(record: &ChunkRecord, filters: &Meta) -> bool {
        filters.iter().all(|(k, v)| record.metadata.get(k) == Some(v))
    }

    pub fn search(&self, query: &[f32], k: usize, filters: Option<&Meta>) -> Result<Vec<SearchHit>> {
        let hits = match filters.filter(|f| !f.is_empty()) {
            None => self.index.search(query, k)?,
            Some(f) => self.index.search_filtered(query, k, &|id| {
                self.records.get(id as usize).is_some_and(|r| Self::matches(r, f))
            })?,
        };
        hits.into_iter()
            .map(|(id, score)| {
                let r = self.records.get(id as usize).ok_or_else(|| {
                    Error::CorruptArtifact(format!("internal id {} has no side-table row", id))
                })?;
                Ok(SearchHit { chunk_id: r.id.clone(), score, content: r.content.clone(), metadata: r.metadata.clone() })
            })
            .collect()
    }
}

/// One isolated corpus: fixed dimension and model, one index, one writer.
///
/// Readers clone the committed `Arc` and search it under a read lock. A writer
/// takes the writer mutex, stages changes on a private copy while readers keep
/// going, then swaps the copy in under the write lock.
pub struct Collection {
    name: String,
    dimension: usize,
    model_name: String,
    created_at: DateTime<Utc>,
    committed: RwLock<Arc<CollectionState>>,
    writer: Mutex<()>,
}

impl Collection {
    pub fn new(name: impl Into<String>, dimension: usize, model_name: impl Into<String>, params: IndexParams) -> Self {
        let name = name.into();
        let state = CollectionState { index: VectorIndex::new(name.clone(), dimension, params), records: Vec::new() };
        Self {
            name,
            dimension,
            model_name: model_name.into(),
            created_at: Utc::now(),
            committed: RwLock::new(Arc::new(state)),
            writer: Mutex::new(()),
        }
    }

    /// Open a persisted collection from `dir`.
    pub fn load(name: &str, dir: &Path, model_name: &str, dimension: Option<usize>, nprobe: usize) -> Result<Self> {
        let (mut index, sidecar) =
            persist::load(dir, LoadExpectations { collection: name, model_name, dimension })?;
        index.set_nprobe(nprobe);
        tracing::info!(collection = name, vectors = index.len(), kind = index.kind().as_str(), "collection loaded");
        Ok(Self {
            name: name.to_string(),
            dimension: sidecar.embedding_dimension,
            model_name: sidecar.model_name,
            created_at: sidecar.created_at,
            committed: RwLock::new(Arc::new(CollectionState { index, records: sidecar.documents })),
            writer: Mutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub async fn snapshot(&self) -> Arc<CollectionState> {
        self.committed.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.committed.read().await.records.len()
    }

    /// Fail unless vectors from `model` with `dimension` belong here.
    pub fn check_compatible(&self, model: &str, dimension: usize) -> Result<()> {
        if model != self.model_name {
            return Err(Error::ModelMismatch {
                collection: self.name.clone(),
                expected: self.model_name.clone(),
                actual: model.to_string(),
            });
        }
        if dimension != self.dimension {
            return Err(Error::DimensionMismatch {
                collection: self.name.clone(),
                expected: self.dimension,
                actual: dimension,
            });
        }
        Ok(())
    }

    /// Top-`k` chunks for a unit query vector. The read lock is held for the
    /// whole search, so a commit waits for in-flight searches to finish.
    pub async fn search(&self, query: &[f32], k: usize, filters: Option<&Meta>) -> Result<Vec<SearchHit>> {
        let guard = self.committed.read().await;
        guard.search(query, k, filters)
    }

    /// Start a write. Only one writer per collection exists at a time.
    pub async fn begin_write(&self) -> CollectionWriter<'_> {
        let guard = self.writer.lock().await;
        let staged = CollectionState::clone(&*self.snapshot().await);
        CollectionWriter { collection: self, guard, staged }
    }

    /// Save the committed state. Waits for any writer, so the artifact on
    /// disk never goes backwards relative to a concurrent commit.
    pub async fn persist(&self, dir: &Path) -> Result<PathBuf> {
        let _guard = self.writer.lock().await;
        let snap = self.snapshot().await;
        self.save_state(dir, snap).await
    }

    async fn save_state(&self, dir: &Path, state: Arc<CollectionState>) -> Result<PathBuf> {
        let dir = dir.to_path_buf();
        let model = self.model_name.clone();
        let created_at = self.created_at;
        tokio::task::spawn_blocking(move || persist::save(&dir, &state.index, &state.records, &model, created_at))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))?
    }
}

/// Staged changes to a collection; invisible to readers until `commit_with`.
pub struct CollectionWriter<'a> {
    collection: &'a Collection,
    guard: MutexGuard<'a, ()>,
    staged: CollectionState,
}

impl<'a> CollectionWriter<'a> {
    pub fn is_trained(&self) -> bool {
        self.staged.index.is_trained()
    }

    pub fn index(&self) -> &VectorIndex {
        &self.staged.index
    }

    /// Train the staged index on `samples` if it has never been trained.
    pub fn ensure_trained(&mut self, samples: &[Vec<f32>]) -> Result<()> {
        if !self.staged.index.is_trained() {
            self.staged.index.train(samples)?;
        }
        Ok(())
    }

    /// Append vectors with their side-table rows.
    pub fn add(&mut self, records: Vec<ChunkRecord>, vectors: &[Vec<f32>]) -> Result<usize> {
        if records.len() != vectors.len() {
            return Err(Error::InvalidConfig(format!(
                "{} records for {} vectors",
                records.len(),
                vectors.len()
            )));
        }
        let ids = self.staged.index.add(vectors)?;
        if ids.start as usize != self.staged.records.len() {
            return Err(Error::CorruptArtifact(format!(
                "collection '{}': index ids start at {} but side table has {} rows",
                self.collection.name,
                ids.start,
                self.staged.records.len()
            )));
        }
        let added = records.len();
        self.staged.records.extend(records);
        Ok(added)
    }

    pub fn rebuild(&mut self) -> Result<()> {
        self.staged.index.rebuild()
    }

    /// Swap the staged state in under the write lock, running `inside`
    /// before readers can see it. The writer guard is handed back so the
    /// caller decides when the next writer may start.
    async fn publish(self, inside: impl FnOnce()) -> (Arc<CollectionState>, MutexGuard<'a, ()>) {
        let CollectionWriter { collection, guard, staged } = self;
        let staged = Arc::new(staged);
        let mut committed = collection.committed.write().await;
        *committed = staged.clone();
        inside();
        drop(committed);
        tracing::debug!(collection = %collection.name, total = staged.records.len(), "collection committed");
        (staged, guard)
    }

    /// Publish the staged state. `inside` runs while the write lock is held,
    /// after the swap and before any reader can observe the new state.
    pub async fn commit_with(self, inside: impl FnOnce()) -> usize {
        let (state, _guard) = self.publish(inside).await;
        state.records.len()
    }

    /// Like `commit_with`, then save exactly the published state to `dir`
    /// before the writer guard is released.
    pub async fn commit_persisted(self, dir: Option<&Path>, inside: impl FnOnce()) -> Result<usize> {
        let collection = self.collection;
        let (state, _guard) = self.publish(inside).await;
        if let Some(dir) = dir {
            collection.save_state(dir, state.clone()).await?;
        }
        Ok(state.records.len())
    }

    pub async fn commit(self) -> usize {
        self.commit_with(|| {}).await
    }
}
