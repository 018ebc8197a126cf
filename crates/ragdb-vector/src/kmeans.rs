//! Spherical k-means with deterministic farthest-point seeding.

use crate::flat::dot;

fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-12 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Index of the centroid with the highest inner product; lowest index on ties.
pub fn nearest(centroids: &[Vec<f32>], v: &[f32]) -> usize {
    let mut best = 0;
    let mut best_score = f32::NEG_INFINITY;
    for (i, c) in centroids.iter().enumerate() {
        let s = dot(c, v);
        if s > best_score {
            best = i;
            best_score = s;
        }
    }
    best
}

/// Seed with the first sample, then repeatedly take the sample least similar
/// to every centroid chosen so far.
fn seed(samples: &[&[f32]], k: usize) -> Vec<Vec<f32>> {
    let mut centroids = vec![samples[0].to_vec()];
    let mut best_sim: Vec<f32> = samples.iter().map(|s| dot(s, samples[0])).collect();
    while centroids.len() < k {
        let (far, _) = best_sim
            .iter()
            .enumerate()
            .fold((0usize, f32::INFINITY), |acc, (i, &s)| if s < acc.1 { (i, s) } else { acc });
        let c = samples[far].to_vec();
        for (i, s) in samples.iter().enumerate() {
            best_sim[i] = best_sim[i].max(dot(s, &c));
        }
        centroids.push(c);
    }
    centroids
}

/// Train `min(k, samples.len())` unit-length centroids.
pub fn train(samples: &[&[f32]], k: usize, max_iterations: usize) -> Vec<Vec<f32>> {
    if samples.is_empty() || k == 0 {
        return Vec::new();
    }
    let k = k.min(samples.len());
    let dim = samples[0].len();
    let mut centroids = seed(samples, k);
    let mut assignment = vec![usize::MAX; samples.len()];

    for iteration in 0..max_iterations.max(1) {
        let mut changed = false;
        for (i, s) in samples.iter().enumerate() {
            let c = nearest(&centroids, s);
            if assignment[i] != c {
                assignment[i] = c;
                changed = true;
            }
        }
        if !changed {
            tracing::debug!(iteration, k, "k-means converged");
            break;
        }

        let mut sums = vec![vec![0f32; dim]; k];
        let mut counts = vec![0usize; k];
        for (s, &c) in samples.iter().zip(&assignment) {
            counts[c] += 1;
            for (acc, x) in sums[c].iter_mut().zip(s.iter()) {
                *acc += x;
            }
        }
        for (c, (mut sum, count)) in sums.into_iter().zip(counts).enumerate() {
            // Empty clusters keep their previous centroid.
            if count > 0 {
                normalize(&mut sum);
                centroids[c] = sum;
            }
        }
    }
    centroids
}
