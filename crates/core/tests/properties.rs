mod common;

use common::{ids, random_vectors};
use hybridann_core::{
    Algorithm, Confidence, DistanceMetric, GraphAlgorithm, IndexConfig, IndexState,
    QuantizationKind, QuantizationSettings, VectorIndex,
};

const DIM: usize = 32;

fn index_in(config: IndexConfig, vectors: &[Vec<f32>]) -> VectorIndex {
    let index = VectorIndex::new(config).unwrap();
    index.add_batch(&ids(vectors.len()), vectors, None).unwrap();
    index
}

fn states() -> Vec<(&'static str, IndexConfig)> {
    let base = IndexConfig::default().with_migration_threshold(100_000);
    let retained = QuantizationSettings {
        retain_raw: true,
        tolerance_points: 100.0,
        ..QuantizationSettings::default()
    };
    vec![
        ("flat", base.clone()),
        ("hnsw", base.clone().with_algorithm(Algorithm::Hnsw)),
        ("diskann", base.clone().with_algorithm(Algorithm::DiskAnn)),
        (
            "auto-migrated",
            base.clone().with_migration_threshold(200).with_target(GraphAlgorithm::DiskAnn),
        ),
        ("binary-retained", base.with_quantization(retained)),
    ]
}

#[test]
fn test_self_query_finds_itself_in_every_state() {
    common::init_tracing();
    let vectors = random_vectors(600, DIM, 1);
    for (name, config) in states() {
        let quantize = name.starts_with("binary");
        let index = index_in(config, &vectors);
        if quantize {
            index.enable_quantization(QuantizationKind::Binary).unwrap();
            index.reencode().unwrap();
        }
        for i in (0..vectors.len()).step_by(37) {
            let response = index.search(&vectors[i], 1, None).unwrap();
            let hit = &response.hits[0];
            assert_eq!(hit.id, format!("id-{i}"), "{name}");
            assert!(hit.distance.abs() < 1e-5, "{name}: distance {}", hit.distance);
            assert!((hit.score - 1.0).abs() < 1e-5, "{name}: score {}", hit.score);
        }
    }
}

#[test]
fn test_self_query_with_lossy_scalar_codes() {
    let vectors = random_vectors(500, DIM, 2);
    let index = index_in(IndexConfig::default(), &vectors);
    index.enable_quantization(QuantizationKind::Scalar).unwrap();
    assert_eq!(index.reencode().unwrap(), 500);
    for i in (0..vectors.len()).step_by(41) {
        let hit = &index.search(&vectors[i], 1, None).unwrap().hits[0];
        assert_eq!(hit.id, format!("id-{i}"));
        assert!(hit.distance < 1e-3, "distance {}", hit.distance);
    }
}

#[test]
fn test_distances_never_decrease() {
    let vectors = random_vectors(800, DIM, 3);
    let queries = random_vectors(20, DIM, 4);
    for (name, config) in states().into_iter().take(4) {
        let index = index_in(config.with_metric(DistanceMetric::L2), &vectors);
        for q in &queries {
            let response = index.search(q, 25, None).unwrap();
            assert_eq!(response.len(), 25, "{name}");
            assert!(
                response.hits.windows(2).all(|w| w[0].distance <= w[1].distance),
                "{name}: unsorted results"
            );
        }
    }
}

#[test]
fn test_cosine_constants() {
    let index = VectorIndex::new(IndexConfig::default()).unwrap();
    index.add("x", &[1.0, 0.0], None).unwrap();
    index.add("y", &[0.0, 1.0], None).unwrap();
    index.add("neg", &[-1.0, 0.0], None).unwrap();
    let response = index.search(&[1.0, 0.0], 3, None).unwrap();
    let distance = |id: &str| response.hits.iter().find(|h| h.id == id).unwrap().distance;
    assert!(distance("x").abs() < 1e-5);
    assert!((distance("y") - 1.0).abs() < 1e-5);
    assert!((distance("neg") - 2.0).abs() < 1e-5);
}

#[test]
fn test_get_returns_vector_unchanged() {
    let vectors = random_vectors(50, 7, 5);
    let index = index_in(IndexConfig::default().with_metric(DistanceMetric::Dot), &vectors);
    for (i, v) in vectors.iter().enumerate() {
        assert_eq!(&index.get(&format!("id-{i}")).unwrap().0, v);
    }
    // Cosine must not normalize what it stores.
    let cosine = VectorIndex::new(IndexConfig::default()).unwrap();
    cosine.add("big", &[30.0, 40.0], None).unwrap();
    assert_eq!(cosine.get("big").unwrap().0, vec![30.0, 40.0]);
}

#[test]
fn test_get_after_reencode_is_within_codec_error() {
    let vectors = random_vectors(400, DIM, 6);
    let index = index_in(IndexConfig::default(), &vectors);
    let report = index.enable_quantization(QuantizationKind::Scalar).unwrap();
    index.reencode().unwrap();
    for (i, v) in vectors.iter().enumerate().step_by(13) {
        let got = index.get(&format!("id-{i}")).unwrap().0;
        let error: f32 = v
            .iter()
            .zip(&got)
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f32>()
            .sqrt();
        assert!(error <= report.mean_reconstruction_error * 4.0 + 1e-3, "error {error}");
    }
}

#[test]
fn test_count_matches_exhaustive_search() {
    let vectors = random_vectors(300, DIM, 7);
    let index = index_in(IndexConfig::default().with_migration_threshold(100), &vectors);
    for i in (0..300).step_by(4) {
        index.delete(&format!("id-{i}")).unwrap();
    }
    let everything = index.search(&vectors[1], 300, None).unwrap();
    assert_eq!(everything.len(), index.count());
    assert_eq!(index.count(), 225);
}

#[test]
fn test_worked_example_pythagorean_vector() {
    let index = VectorIndex::new(IndexConfig::default()).unwrap();
    let mut v = vec![0.0f32; 128];
    v[0] = 3.0;
    v[1] = 4.0;
    index.add("p", &v, None).unwrap();
    let hit = &index.search(&v, 1, None).unwrap().hits[0];
    assert_eq!(hit.id, "p");
    assert!(hit.distance.abs() < 5e-3);
    assert!((hit.score - 1.0).abs() < 5e-3);
}

#[test]
fn test_worked_example_unit_axes() {
    let index = VectorIndex::new(IndexConfig::default()).unwrap();
    index.add("e0", &[1.0, 0.0, 0.0], None).unwrap();
    index.add("e1", &[0.0, 1.0, 0.0], None).unwrap();
    index.add("e2", &[0.0, 0.0, 1.0], None).unwrap();
    let response = index.search(&[1.0, 0.0, 0.0], 3, None).unwrap();
    assert_eq!(response.confidence, Confidence::Exact);
    assert_eq!(response.hits[0].id, "e0");
    assert!(response.hits[0].distance.abs() < 1e-5);
    let mut rest: Vec<&str> = response.hits[1..].iter().map(|h| h.id.as_str()).collect();
    rest.sort_unstable();
    assert_eq!(rest, vec!["e1", "e2"]);
    assert!(response.hits[1..].iter().all(|h| (h.distance - 1.0).abs() < 1e-5));
}

#[test]
fn test_info_reports_state() {
    let index = VectorIndex::new(IndexConfig::default().with_algorithm(Algorithm::Hnsw)).unwrap();
    index.add("a", &[1.0, 2.0, 3.0], None).unwrap();
    let info = index.info();
    assert_eq!(info.vector_count, 1);
    assert_eq!(info.dimension, Some(3));
    assert_eq!(info.algorithm, Algorithm::Hnsw);
    assert_eq!(info.status, IndexState::GraphHnsw);
    assert!(info.memory_bytes > 0);
}
