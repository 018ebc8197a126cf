use serde::{Deserialize, Serialize};
use std::ops::Range;

use ragdb_core::config::IndexConfig;
use ragdb_core::{Error, Result};

use crate::flat::FlatIndex;
use crate::ivf::IvfIndex;

pub const MIN_NLIST: usize = 4;
pub const MAX_NLIST: usize = 100;

/// Number of inverted lists for `n` training vectors:
/// `clamp(round(sqrt(n) / 4), 4, 100)`.
pub fn compute_nlist(n: usize) -> usize {
    let raw = ((n as f64).sqrt() / 4.0).round() as usize;
    raw.clamp(MIN_NLIST, MAX_NLIST)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexParams {
    pub exact_threshold: usize,
    pub nprobe: usize,
    pub kmeans_iterations: usize,
}

impl Default for IndexParams {
    fn default() -> Self {
        Self::from(&IndexConfig::default())
    }
}

impl From<&IndexConfig> for IndexParams {
    fn from(c: &IndexConfig) -> Self {
        Self { exact_threshold: c.exact_threshold, nprobe: c.nprobe, kmeans_iterations: c.kmeans_iterations }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    Untrained,
    Flat,
    IvfFlat,
}

impl IndexKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Untrained => "untrained",
            Self::Flat => "flat",
            Self::IvfFlat => "ivf_flat",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
enum IndexState {
    Untrained,
    Flat(FlatIndex),
    Ivf(IvfIndex),
}

/// Inner-product index over unit vectors.
///
/// Starts untrained. The first `train` picks an exact scan for small
/// collections and IVF-Flat otherwise; that choice only changes on `rebuild`.
/// Internal ids are dense and follow insertion order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorIndex {
    name: String,
    dim: usize,
    params: IndexParams,
    nlist: usize,
    state: IndexState,
}

impl VectorIndex {
    pub fn new(name: impl Into<String>, dim: usize, params: IndexParams) -> Self {
        Self { name: name.into(), dim, params, nlist: 0, state: IndexState::Untrained }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn nlist(&self) -> usize {
        self.nlist
    }

    pub fn params(&self) -> IndexParams {
        self.params
    }

    pub fn kind(&self) -> IndexKind {
        match self.state {
            IndexState::Untrained => IndexKind::Untrained,
            IndexState::Flat(_) => IndexKind::Flat,
            IndexState::Ivf(_) => IndexKind::IvfFlat,
        }
    }

    pub fn is_trained(&self) -> bool {
        !matches!(self.state, IndexState::Untrained)
    }

    pub fn len(&self) -> usize {
        match &self.state {
            IndexState::Untrained => 0,
            IndexState::Flat(f) => f.len(),
            IndexState::Ivf(i) => i.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply the running nprobe to an index that was loaded from disk.
    pub fn set_nprobe(&mut self, nprobe: usize) {
        self.params.nprobe = nprobe;
        if let IndexState::Ivf(ivf) = &mut self.state {
            ivf.set_nprobe(nprobe);
        }
    }

    fn check_dim(&self, actual: usize) -> Result<()> {
        if actual != self.dim {
            return Err(Error::DimensionMismatch { collection: self.name.clone(), expected: self.dim, actual });
        }
        Ok(())
    }

    pub fn train(&mut self, samples: &[Vec<f32>]) -> Result<()> {
        if self.is_trained() {
            return Err(Error::InvalidConfig(format!(
                "index for '{}' is already trained; use rebuild to retrain",
                self.name
            )));
        }
        let refs: Vec<&[f32]> = samples.iter().map(Vec::as_slice).collect();
        self.train_on(&refs)
    }

    fn train_on(&mut self, samples: &[&[f32]]) -> Result<()> {
        if samples.is_empty() {
            return Err(Error::InvalidConfig(format!("cannot train '{}' on an empty sample", self.name)));
        }
        for s in samples {
            self.check_dim(s.len())?;
        }
        let n = samples.len();
        self.nlist = compute_nlist(n);
        self.state = if n < self.params.exact_threshold {
            IndexState::Flat(FlatIndex::new(self.dim))
        } else {
            IndexState::Ivf(IvfIndex::train(
                self.dim,
                samples,
                self.nlist,
                self.params.nprobe,
                self.params.kmeans_iterations,
            ))
        };
        tracing::info!(collection = %self.name, samples = n, nlist = self.nlist, kind = self.kind().as_str(), "index trained");
        Ok(())
    }

    /// Append vectors; returns the range of internal ids they received.
    /// Either every vector is added or none is.
    pub fn add(&mut self, vectors: &[Vec<f32>]) -> Result<Range<u32>> {
        if !self.is_trained() {
            return Err(Error::NotTrained(self.name.clone()));
        }
        for v in vectors {
            self.check_dim(v.len())?;
        }
        let first = self.len() as u32;
        for v in vectors {
            self.insert(v)?;
        }
        Ok(first..self.len() as u32)
    }

    fn insert(&mut self, v: &[f32]) -> Result<u32> {
        match &mut self.state {
            IndexState::Untrained => Err(Error::NotTrained(self.name.clone())),
            IndexState::Flat(f) => Ok(f.push(v)),
            IndexState::Ivf(i) => Ok(i.add(v)),
        }
    }

    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(u32, f32)>> {
        self.search_filtered(query, k, &|_| true)
    }

    /// Top-`k` by inner product among ids accepted by `filter`.
    pub fn search_filtered(&self, query: &[f32], k: usize, filter: &dyn Fn(u32) -> bool) -> Result<Vec<(u32, f32)>> {
        if !self.is_trained() {
            return Err(Error::NotTrained(self.name.clone()));
        }
        self.check_dim(query.len())?;
        match &self.state {
            IndexState::Untrained => Err(Error::NotTrained(self.name.clone())),
            IndexState::Flat(f) => Ok(f.search(query, k, filter)),
            IndexState::Ivf(i) => Ok(i.search(query, k, filter)),
        }
    }

    /// Retrain over every stored vector and re-insert them in id order, so
    /// internal ids stay stable. May switch between flat and IVF.
    pub fn rebuild(&mut self) -> Result<()> {
        let store = match &self.state {
            IndexState::Untrained => return Err(Error::NotTrained(self.name.clone())),
            IndexState::Flat(f) => f.clone(),
            IndexState::Ivf(i) => i.store().clone(),
        };
        if store.is_empty() {
            return Ok(());
        }
        let vectors: Vec<&[f32]> = store.iter().collect();
        self.state = IndexState::Untrained;
        self.train_on(&vectors)?;
        for v in &vectors {
            self.insert(v)?;
        }
        tracing::info!(collection = %self.name, vectors = vectors.len(), kind = self.kind().as_str(), "index rebuilt");
        Ok(())
    }
}
