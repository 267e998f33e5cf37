#![allow(dead_code)]

use hybridann_core::{DistanceMetric, VectorIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;

/// `n` uniform vectors in `[-1, 1)^dim`, reproducible from `seed`.
pub fn random_vectors(n: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect())
        .collect()
}

pub fn ids(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("id-{i}")).collect()
}

/// Exact top-`k` ids by brute force.
pub fn exact_top_k(
    vectors: &[Vec<f32>],
    query: &[f32],
    k: usize,
    metric: DistanceMetric,
) -> Vec<String> {
    let mut scored: Vec<(f32, usize)> = vectors
        .iter()
        .enumerate()
        .map(|(i, v)| (metric.distance(query, v), i))
        .collect();
    scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    scored
        .into_iter()
        .take(k)
        .map(|(_, i)| format!("id-{i}"))
        .collect()
}

/// Mean recall@k of `index` over `queries`, in percent.
pub fn recall_at_k(
    index: &VectorIndex,
    vectors: &[Vec<f32>],
    queries: &[Vec<f32>],
    k: usize,
    metric: DistanceMetric,
) -> f64 {
    let mut total = 0.0;
    for q in queries {
        let truth: HashSet<String> = exact_top_k(vectors, q, k, metric).into_iter().collect();
        let found = index.search(q, k, None).unwrap();
        let hits = found.hits.iter().filter(|h| truth.contains(&h.id)).count();
        total += hits as f64 / k as f64;
    }
    total / queries.len() as f64 * 100.0
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
