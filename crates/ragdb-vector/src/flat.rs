use serde::{Deserialize, Serialize};

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Keep the `k` best `(id, score)` pairs: score descending, id ascending on ties.
pub(crate) fn top_k(mut scored: Vec<(u32, f32)>, k: usize) -> Vec<(u32, f32)> {
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    scored.truncate(k);
    scored
}

/// Exact inner-product scan over row-major storage.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FlatIndex {
    dim: usize,
    data: Vec<f32>,
}

impl FlatIndex {
    pub fn new(dim: usize) -> Self {
        Self { dim, data: Vec::new() }
    }

    pub fn len(&self) -> usize {
        if self.dim == 0 { 0 } else { self.data.len() / self.dim }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Append a vector; returns its id.
    pub fn push(&mut self, v: &[f32]) -> u32 {
        let id = self.len() as u32;
        self.data.extend_from_slice(v);
        id
    }

    pub fn get(&self, id: u32) -> Option<&[f32]> {
        let start = id as usize * self.dim;
        self.data.get(start..start + self.dim)
    }

    pub fn iter(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.dim.max(1))
    }

    pub fn search(&self, query: &[f32], k: usize, filter: &dyn Fn(u32) -> bool) -> Vec<(u32, f32)> {
        let scored = self
            .iter()
            .enumerate()
            .map(|(i, v)| (i as u32, v))
            .filter(|(id, _)| filter(*id))
            .map(|(id, v)| (id, dot(query, v)))
            .collect();
        top_k(scored, k)
    }
}
