mod common;

use common::random_vectors;
use hybridann_core::persistence::{segment_file_name, wal, Manifest};
use hybridann_core::{
    Algorithm, CancelToken, CheckpointOptions, DistanceMetric, IndexConfig, IndexError,
    IndexState, Metadata, QuantizationKind, SegmentKind, VectorIndex,
};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

const DIM: usize = 16;

fn config() -> IndexConfig {
    IndexConfig::default()
        .with_metric(DistanceMetric::L2)
        .with_migration_threshold(300)
}

fn tagged(i: usize) -> Metadata {
    let mut m = Metadata::new();
    m.insert("bucket".into(), (i % 3).to_string());
    m
}

fn fill(index: &VectorIndex, vectors: &[Vec<f32>], from: usize) {
    let metadata = (from..from + vectors.len()).map(tagged).collect();
    let ids: Vec<String> = (from..from + vectors.len()).map(|i| format!("id-{i}")).collect();
    let outcome = index.add_batch(&ids, vectors, Some(metadata)).unwrap();
    assert!(outcome.is_complete());
}

/// Ids and distances of the top-10 for every query.
fn snapshot(index: &VectorIndex, queries: &[Vec<f32>]) -> Vec<Vec<(String, f32)>> {
    queries
        .iter()
        .map(|q| {
            index
                .search(q, 10, None)
                .unwrap()
                .hits
                .into_iter()
                .map(|h| (h.id, h.distance))
                .collect()
        })
        .collect()
}

fn assert_same_results(a: &[Vec<(String, f32)>], b: &[Vec<(String, f32)>]) {
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(b) {
        let ids_x: Vec<&str> = x.iter().map(|h| h.0.as_str()).collect();
        let ids_y: Vec<&str> = y.iter().map(|h| h.0.as_str()).collect();
        assert_eq!(ids_x, ids_y);
        for (hx, hy) in x.iter().zip(y) {
            assert!((hx.1 - hy.1).abs() < 1e-5);
        }
    }
}

fn assert_same_contents(a: &VectorIndex, b: &VectorIndex) {
    assert_eq!(a.count(), b.count());
    for id in a.list_ids(0, usize::MAX) {
        assert_eq!(a.get(&id), b.get(&id), "{id}");
    }
}

#[test]
fn test_round_trip_preserves_count_gets_and_results() {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let vectors = random_vectors(800, DIM, 21);
    let queries = random_vectors(25, DIM, 22);

    let before = {
        let index = VectorIndex::open(dir.path(), config()).unwrap();
        fill(&index, &vectors, 0);
        assert_eq!(index.state(), IndexState::GraphHnsw);
        assert!(index.checkpoint().unwrap());
        assert!(!index.checkpoint().unwrap(), "nothing changed");
        let ids = index.list_ids(0, usize::MAX);
        let gets: Vec<_> = ids.iter().map(|id| index.get(id)).collect();
        (snapshot(&index, &queries), ids, gets)
    };

    let reopened = VectorIndex::open(dir.path(), config()).unwrap();
    assert_eq!(reopened.count(), 800);
    assert_eq!(reopened.state(), IndexState::GraphHnsw);
    assert_eq!(reopened.list_ids(0, usize::MAX), before.1);
    let gets: Vec<_> = before.1.iter().map(|id| reopened.get(id)).collect();
    assert_eq!(gets, before.2);
    assert_same_results(&before.0, &snapshot(&reopened, &queries));
    reopened.validate().unwrap();
}

#[test]
fn test_delta_checkpoints_fold_back_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let vectors = random_vectors(700, DIM, 23);
    let queries = random_vectors(10, DIM, 24);

    let expected = {
        let index = VectorIndex::open(dir.path(), config()).unwrap();
        fill(&index, &vectors[..400], 0);
        let first = index.checkpoint_with(CheckpointOptions::default()).unwrap().unwrap();
        assert_eq!(first.kind, SegmentKind::Full);

        fill(&index, &vectors[400..], 400);
        for i in (0..400).step_by(9) {
            index.delete(&format!("id-{i}")).unwrap();
        }
        index.add("id-1", &vectors[699], Some(tagged(1))).unwrap();
        let second = index.checkpoint_with(CheckpointOptions::default()).unwrap().unwrap();
        assert_eq!(second.kind, SegmentKind::Delta);
        assert_eq!(second.segments, 2);
        assert_eq!(index.info().segments, 2);
        (snapshot(&index, &queries), index.count())
    };

    let reopened = VectorIndex::open(dir.path(), config()).unwrap();
    assert_eq!(reopened.count(), expected.1);
    assert!(!reopened.exists("id-9"));
    assert_eq!(reopened.get("id-1").unwrap().0, vectors[699]);
    assert_same_results(&expected.0, &snapshot(&reopened, &queries));
    reopened.validate().unwrap();
}

#[test]
fn test_segment_limit_triggers_merge_and_next_checkpoint_is_full() {
    let dir = tempfile::tempdir().unwrap();
    let vectors = random_vectors(600, DIM, 25);
    let cfg = config().with_max_segments(2);
    let index = VectorIndex::open(dir.path(), cfg.clone()).unwrap();

    fill(&index, &vectors[..350], 0);
    index.checkpoint().unwrap();
    fill(&index, &vectors[350..450], 350);
    index.checkpoint().unwrap();
    for i in 0..50 {
        index.delete(&format!("id-{i}")).unwrap();
    }
    fill(&index, &vectors[450..], 450);
    let merged = index.checkpoint_with(CheckpointOptions::default()).unwrap().unwrap();
    assert!(merged.merged);
    assert_eq!(merged.kind, SegmentKind::Full);
    assert_eq!(merged.segments, 1);
    assert_eq!(merged.live_vectors, 550);

    index.add("late", &vectors[0], None).unwrap();
    let next = index.checkpoint_with(CheckpointOptions::default()).unwrap().unwrap();
    assert_eq!(next.kind, SegmentKind::Full);

    let expected: Vec<String> = index.list_ids(0, usize::MAX);
    drop(index);
    let reopened = VectorIndex::open(dir.path(), cfg).unwrap();
    assert_eq!(reopened.list_ids(0, usize::MAX), expected);
    assert_eq!(reopened.count(), 551);
    reopened.validate().unwrap();
}

#[test]
fn test_wal_replays_mutations_after_the_last_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let vectors = random_vectors(500, DIM, 26);
    let original = VectorIndex::open(dir.path(), config()).unwrap();
    fill(&original, &vectors[..200], 0);
    original.checkpoint().unwrap();
    fill(&original, &vectors[200..], 200);
    original.delete("id-3").unwrap();
    original.compact().unwrap();
    original.add("id-4", &vectors[0], None).unwrap();

    // Snapshot the on-disk state as a crash would leave it, then compare.
    let copy = tempfile::tempdir().unwrap();
    copy_dir(dir.path(), copy.path());
    fs::remove_file(copy.path().join("LOCK")).unwrap();
    let recovered = VectorIndex::open(copy.path(), config()).unwrap();
    assert_same_contents(&original, &recovered);
    assert_eq!(recovered.state(), IndexState::GraphHnsw);
    assert!(!recovered.exists("id-3"));
    recovered.validate().unwrap();
}

#[test]
fn test_wal_alone_recovers_an_index_that_never_checkpointed() {
    let dir = tempfile::tempdir().unwrap();
    let vectors = random_vectors(50, DIM, 27);
    {
        let index = VectorIndex::open(dir.path(), config()).unwrap();
        fill(&index, &vectors, 0);
        index.delete("id-7").unwrap();
    }
    assert!(Manifest::load(dir.path()).unwrap().is_none());
    let index = VectorIndex::open(dir.path(), config()).unwrap();
    assert_eq!(index.count(), 49);
    assert_eq!(index.get("id-8").unwrap().1, tagged(8));
}

#[test]
fn test_torn_wal_tail_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    {
        let index = VectorIndex::open(dir.path(), config()).unwrap();
        index.add("kept", &[1.0; DIM], None).unwrap();
        index.add("torn", &[2.0; DIM], None).unwrap();
    }
    let (_, log) = wal::list_wal_files(dir.path()).unwrap().pop().unwrap();
    let bytes = fs::read(&log).unwrap();
    fs::write(&log, &bytes[..bytes.len() - 3]).unwrap();

    let index = VectorIndex::open(dir.path(), config()).unwrap();
    assert!(index.exists("kept"));
    assert!(!index.exists("torn"));
}

#[test]
fn test_without_wal_only_checkpoints_survive() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config().with_wal(false);
    {
        let index = VectorIndex::open(dir.path(), cfg.clone()).unwrap();
        index.add("saved", &[1.0; DIM], None).unwrap();
        index.checkpoint().unwrap();
        index.add("lost", &[2.0; DIM], None).unwrap();
    }
    assert!(wal::list_wal_files(dir.path()).unwrap().is_empty());
    let index = VectorIndex::open(dir.path(), cfg).unwrap();
    assert!(index.exists("saved"));
    assert!(!index.exists("lost"));
}

#[test]
fn test_corrupt_segment_aborts_open() {
    let dir = tempfile::tempdir().unwrap();
    let generation = {
        let index = VectorIndex::open(dir.path(), config()).unwrap();
        fill(&index, &random_vectors(100, DIM, 28), 0);
        index.checkpoint().unwrap();
        index.info().generation
    };
    let path = dir.path().join(segment_file_name(generation));
    let mut bytes = fs::read(&path).unwrap();
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0x5A;
    fs::write(&path, &bytes).unwrap();

    let err = VectorIndex::open(dir.path(), config()).unwrap_err();
    assert!(matches!(err, IndexError::CorruptPersistence { .. }), "{err}");
    // A failed open must not hold the directory.
    assert!(!dir.path().join("LOCK").exists());
}

#[test]
fn test_missing_segment_aborts_open() {
    let dir = tempfile::tempdir().unwrap();
    let generation = {
        let index = VectorIndex::open(dir.path(), config()).unwrap();
        index.add("a", &[1.0; DIM], None).unwrap();
        index.checkpoint().unwrap();
        index.info().generation
    };
    fs::remove_file(dir.path().join(segment_file_name(generation))).unwrap();
    assert!(matches!(
        VectorIndex::open(dir.path(), config()),
        Err(IndexError::CorruptPersistence { .. })
    ));
}

#[test]
fn test_second_instance_is_locked_out() {
    let dir = tempfile::tempdir().unwrap();
    let first = VectorIndex::open(dir.path(), config()).unwrap();
    assert!(matches!(
        VectorIndex::open(dir.path(), config()),
        Err(IndexError::Locked(_))
    ));
    let clone = first.clone();
    drop(first);
    assert!(matches!(
        VectorIndex::open(dir.path(), config()),
        Err(IndexError::Locked(_))
    ));
    drop(clone);
    VectorIndex::open(dir.path(), config()).unwrap();
}

#[test]
fn test_metric_mismatch_on_open_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    {
        let index = VectorIndex::open(dir.path(), config()).unwrap();
        index.add("a", &[1.0; DIM], None).unwrap();
        index.checkpoint().unwrap();
    }
    let cosine = IndexConfig::default();
    assert!(matches!(
        VectorIndex::open(dir.path(), cosine),
        Err(IndexError::InvalidConfig(_))
    ));
}

#[test]
fn test_structure_on_disk_wins_over_requested_algorithm() {
    let dir = tempfile::tempdir().unwrap();
    {
        let index =
            VectorIndex::open(dir.path(), config().with_algorithm(Algorithm::DiskAnn)).unwrap();
        fill(&index, &random_vectors(40, DIM, 29), 0);
        index.checkpoint().unwrap();
    }
    let index = VectorIndex::open(dir.path(), config()).unwrap();
    assert_eq!(index.state(), IndexState::GraphDiskAnn);
    assert_eq!(index.info().algorithm, Algorithm::DiskAnn);
}

#[test]
fn test_quantized_index_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let vectors = random_vectors(400, DIM, 30);
    let queries = random_vectors(10, DIM, 31);
    let before = {
        let index = VectorIndex::open(dir.path(), config()).unwrap();
        fill(&index, &vectors, 0);
        index.enable_quantization(QuantizationKind::Scalar).unwrap();
        index.reencode().unwrap();
        index.checkpoint().unwrap();
        snapshot(&index, &queries)
    };
    let index = VectorIndex::open(dir.path(), config()).unwrap();
    assert_eq!(index.info().quantization, Some(QuantizationKind::Scalar));
    assert_same_results(&before, &snapshot(&index, &queries));
}

#[test]
fn test_cancelled_checkpoint_keeps_previous_generation() {
    let dir = tempfile::tempdir().unwrap();
    let index = VectorIndex::open(dir.path(), config()).unwrap();
    fill(&index, &random_vectors(100, DIM, 32), 0);
    index.checkpoint().unwrap();
    let kept = index.info().generation;

    index.add("extra", &[0.5; DIM], None).unwrap();
    let token = CancelToken::new();
    token.cancel();
    let err = index
        .checkpoint_with(CheckpointOptions::default().with_token(token))
        .unwrap_err();
    assert!(matches!(err, IndexError::Cancelled));
    assert_eq!(index.info().generation, kept);

    // The retry writes a full segment and nothing is lost.
    let report = index.checkpoint_with(CheckpointOptions::default()).unwrap().unwrap();
    assert_eq!(report.kind, SegmentKind::Full);
    drop(index);
    let reopened = VectorIndex::open(dir.path(), config()).unwrap();
    assert_eq!(reopened.count(), 101);
    assert!(reopened.exists("extra"));
}

#[test]
fn test_clear_then_checkpoint_persists_empty_index() {
    let dir = tempfile::tempdir().unwrap();
    {
        let index = VectorIndex::open(dir.path(), config()).unwrap();
        fill(&index, &random_vectors(350, DIM, 33), 0);
        index.checkpoint().unwrap();
        index.clear().unwrap();
        index.checkpoint().unwrap();
    }
    let index = VectorIndex::open(dir.path(), config()).unwrap();
    assert!(index.is_empty());
    assert_eq!(index.state(), IndexState::FlatBuffer);
    index.add("fresh", &[1.0, 2.0], None).unwrap();
    assert_eq!(index.dimension(), Some(2));
}

fn copy_dir(from: &Path, to: &Path) {
    for entry in fs::read_dir(from).unwrap() {
        let entry = entry.unwrap();
        fs::copy(entry.path(), to.join(entry.file_name())).unwrap();
    }
}

#[derive(Debug, Clone)]
enum Op {
    Add(u8, u8),
    Delete(u8),
    Checkpoint,
    Compact,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (any::<u8>(), any::<u8>()).prop_map(|(id, seed)| Op::Add(id % 64, seed)),
        3 => any::<u8>().prop_map(|id| Op::Delete(id % 64)),
        2 => Just(Op::Checkpoint),
        1 => Just(Op::Compact),
    ]
}

fn vector_for(seed: u8) -> Vec<f32> {
    (0..4).map(|d| (seed as f32 * 0.37 + d as f32).sin()).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Whatever mix of deltas, merges and compactions produced the segments,
    /// reopening yields exactly the live vectors of a plain map.
    #[test]
    fn prop_reopen_matches_model(ops in prop::collection::vec(op(), 1..60)) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = IndexConfig::default()
            .with_metric(DistanceMetric::L2)
            .with_migration_threshold(20)
            .with_max_segments(2)
            .with_wal(false);
        let mut model: BTreeMap<String, Vec<f32>> = BTreeMap::new();
        let mut saved = model.clone();
        {
            let index = VectorIndex::open(dir.path(), cfg.clone()).unwrap();
            for op in ops {
                match op {
                    Op::Add(id, seed) => {
                        let v = vector_for(seed);
                        index.add(&format!("k{id}"), &v, None).unwrap();
                        model.insert(format!("k{id}"), v);
                    }
                    Op::Delete(id) => {
                        let existed = model.remove(&format!("k{id}")).is_some();
                        prop_assert_eq!(index.delete(&format!("k{id}")).unwrap(), existed);
                    }
                    Op::Checkpoint => {
                        index.checkpoint().unwrap();
                        saved = model.clone();
                    }
                    Op::Compact => {
                        index.compact().unwrap();
                    }
                }
            }
            index.validate().unwrap();
        }
        let index = VectorIndex::open(dir.path(), cfg).unwrap();
        index.validate().unwrap();
        prop_assert_eq!(index.count(), saved.len());
        for (id, v) in &saved {
            let got = index.get(id);
            prop_assert!(got.is_some(), "{} missing after reopen", id);
            prop_assert_eq!(&got.unwrap().0, v);
            let hit = &index.search(v, 1, None).unwrap().hits[0];
            prop_assert_eq!(hit.distance, 0.0);
        }
    }
}
