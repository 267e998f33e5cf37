//! Recall calibration for a candidate codec.
//!
//! Trains the codec on (a sample of) the stored vectors, then compares the
//! quantized search path against exact ground truth: for every calibration
//! query the approximate distances pick a shortlist of `k * rerank_factor`
//! codes, the shortlist is re-ranked and its top `k` is checked against the
//! exact top `k`.

use super::{QuantizationKind, Quantizer};
use crate::config::{self, QuantizationSettings};
use crate::distance::DistanceMetric;
use crate::error::Result;
use ordered_float::OrderedFloat;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::collections::HashSet;

/// Outcome of a calibration run.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationReport {
    pub kind: QuantizationKind,
    /// Vectors the codec was trained and evaluated on.
    pub sample_size: usize,
    pub queries: usize,
    pub k: usize,
    /// Mean recall@k of the quantized path, in percent.
    pub quantized_recall: f32,
    /// `100 - quantized_recall`: exact search has recall 100 by construction.
    pub degradation_points: f32,
    pub tolerance_points: f32,
    pub within_tolerance: bool,
    /// Fewer vectors than the minimum calibration sample were available.
    pub insufficient_sample: bool,
    /// Mean Euclidean distance between a vector and its reconstruction.
    pub mean_reconstruction_error: f32,
    pub compression_ratio: f32,
}

/// Train `kind` on `vectors` (a `dim`-wide arena) and measure its recall.
pub fn calibrate(
    kind: QuantizationKind,
    metric: DistanceMetric,
    vectors: &[f32],
    dim: usize,
    settings: &QuantizationSettings,
    seed: u64,
) -> Result<(Quantizer, CalibrationReport)> {
    let total = if dim == 0 { 0 } else { vectors.len() / dim };
    let mut rng = StdRng::seed_from_u64(seed);

    let sample: Vec<f32> = if total > config::CALIBRATION_MAX_TRAINING {
        rand::seq::index::sample(&mut rng, total, config::CALIBRATION_MAX_TRAINING)
            .into_iter()
            .flat_map(|i| vectors[i * dim..(i + 1) * dim].iter().copied())
            .collect()
    } else {
        vectors.to_vec()
    };
    let quantizer = Quantizer::train(kind, metric, &sample, dim, seed)?;
    let n = sample.len() / dim;

    let codes: Vec<Vec<u8>> = sample
        .par_chunks_exact(dim)
        .map(|row| quantizer.encode(row))
        .collect();
    let reconstruction: f64 = sample
        .par_chunks_exact(dim)
        .zip(codes.par_iter())
        .map(|(row, code)| {
            let decoded = quantizer.decode(code);
            crate::distance::l2_squared(row, &decoded).sqrt() as f64
        })
        .sum();

    let k = config::CALIBRATION_RECALL_K.min(n);
    let num_queries = settings.calibration_queries.max(1).min(n);
    let queries: Vec<Vec<f32>> = (0..num_queries)
        .map(|_| {
            let a = rng.gen_range(0..n);
            let b = rng.gen_range(0..n);
            sample[a * dim..(a + 1) * dim]
                .iter()
                .zip(&sample[b * dim..(b + 1) * dim])
                .map(|(x, y)| (x + y) * 0.5)
                .collect()
        })
        .collect();

    let shortlist_len = (k * settings.rerank_factor.max(1)).min(n);
    let recall_sum: f64 = queries
        .par_iter()
        .map(|query| {
            let exact: HashSet<usize> = top_k(
                sample
                    .chunks_exact(dim)
                    .map(|row| metric.distance(query, row))
                    .enumerate(),
                k,
            )
            .into_iter()
            .collect();

            let prepared = quantizer.prepare(query);
            let shortlist = top_k(
                codes
                    .iter()
                    .map(|code| quantizer.distance_to_query(&prepared, code))
                    .enumerate(),
                shortlist_len,
            );
            // Refinement sees only what the store would keep.
            let refined = top_k(
                shortlist.into_iter().map(|i| {
                    let d = if settings.retain_raw {
                        metric.distance(query, &sample[i * dim..(i + 1) * dim])
                    } else {
                        metric.distance(query, &quantizer.decode(&codes[i]))
                    };
                    (i, d)
                }),
                k,
            );
            let hits = refined.iter().filter(|i| exact.contains(i)).count();
            hits as f64 / k.max(1) as f64
        })
        .sum();

    let quantized_recall = (recall_sum / num_queries as f64 * 100.0) as f32;
    let degradation_points = (100.0 - quantized_recall).max(0.0);
    let report = CalibrationReport {
        kind,
        sample_size: n,
        queries: num_queries,
        k,
        quantized_recall,
        degradation_points,
        tolerance_points: settings.tolerance_points,
        within_tolerance: degradation_points <= settings.tolerance_points,
        insufficient_sample: total < config::CALIBRATION_MIN_SAMPLE,
        mean_reconstruction_error: (reconstruction / n as f64) as f32,
        compression_ratio: quantizer.compression_ratio(),
    };
    Ok((quantizer, report))
}

/// Indices of the `k` smallest distances, ascending; ties broken by index.
fn top_k(items: impl Iterator<Item = (usize, f32)>, k: usize) -> Vec<usize> {
    let mut all: Vec<(OrderedFloat<f32>, usize)> =
        items.map(|(i, d)| (OrderedFloat(d), i)).collect();
    let k = k.min(all.len());
    if k == 0 {
        return Vec::new();
    }
    all.select_nth_unstable(k - 1);
    all.truncate(k);
    all.sort_unstable();
    all.into_iter().map(|(_, i)| i).collect()
}
