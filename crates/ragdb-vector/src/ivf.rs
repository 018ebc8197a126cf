use serde::{Deserialize, Serialize};

use crate::flat::{dot, top_k, FlatIndex};
use crate::kmeans;

/// Inverted-file index: vectors are bucketed by nearest centroid and a search
/// only scans the `nprobe` buckets closest to the query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IvfIndex {
    centroids: Vec<Vec<f32>>,
    lists: Vec<Vec<u32>>,
    store: FlatIndex,
    nprobe: usize,
}

impl IvfIndex {
    pub fn train(dim: usize, samples: &[&[f32]], nlist: usize, nprobe: usize, iterations: usize) -> Self {
        let centroids = kmeans::train(samples, nlist, iterations);
        let lists = vec![Vec::new(); centroids.len()];
        let mut index = Self { centroids, lists, store: FlatIndex::new(dim), nprobe: 1 };
        index.set_nprobe(nprobe);
        index
    }

    pub fn nlist(&self) -> usize {
        self.centroids.len()
    }

    pub fn nprobe(&self) -> usize {
        self.nprobe
    }

    pub fn set_nprobe(&mut self, nprobe: usize) {
        self.nprobe = nprobe.clamp(1, self.nlist().max(1));
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn store(&self) -> &FlatIndex {
        &self.store
    }

    pub fn add(&mut self, v: &[f32]) -> u32 {
        let id = self.store.push(v);
        if !self.centroids.is_empty() {
            let list = kmeans::nearest(&self.centroids, v);
            self.lists[list].push(id);
        }
        id
    }

    pub fn search(&self, query: &[f32], k: usize, filter: &dyn Fn(u32) -> bool) -> Vec<(u32, f32)> {
        let mut ranked: Vec<(usize, f32)> =
            self.centroids.iter().enumerate().map(|(i, c)| (i, dot(query, c))).collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut scored = Vec::new();
        for (list, _) in ranked.into_iter().take(self.nprobe) {
            for &id in &self.lists[list] {
                if !filter(id) {
                    continue;
                }
                if let Some(v) = self.store.get(id) {
                    scored.push((id, dot(query, v)));
                }
            }
        }
        top_k(scored, k)
    }
}
