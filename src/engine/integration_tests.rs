//! End-to-end tests for the batch state machine: discovery through commit,
//! crash resume, group mode, and termination. The face model is stubbed;
//! everything else (catalog, compression, routing, state files) is real.

use crate::config::Settings;
use crate::db::{open_in_memory, run_migrations};
use crate::engine::batch::{BatchEngine, BatchRunStatus};
use crate::engine::faces::testing::StubAnalyzer;
use crate::engine::faces::FaceAnalyzer;
use crate::jobs::model::{BatchState, JobConfig};
use crate::jobs::repository as jobs;
use crate::registry::model::EmbeddingSource;
use crate::registry::repository as registry;
use crate::storage::{stream_hash, HotStorage};
use crate::worker::resume_interrupted;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

struct Rig {
    _hot_dir: TempDir,
    _source_dir: TempDir,
    _output_dir: TempDir,
    storage: HotStorage,
    source: PathBuf,
    output: PathBuf,
    conn: Connection,
    settings: Settings,
}

impl Rig {
    fn new() -> Rig {
        let hot_dir = TempDir::new().unwrap();
        let source_dir = TempDir::new().unwrap();
        let output_dir = TempDir::new().unwrap();
        let conn = open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        Rig {
            storage: HotStorage::new(hot_dir.path()),
            source: source_dir.path().to_path_buf(),
            output: output_dir.path().to_path_buf(),
            _hot_dir: hot_dir,
            _source_dir: source_dir,
            _output_dir: output_dir,
            conn,
            settings: Settings::default(),
        }
    }

    fn config(&self) -> JobConfig {
        JobConfig {
            source_root: Some(self.source.to_string_lossy().into_owned()),
            output_root: Some(self.output.to_string_lossy().into_owned()),
            ..JobConfig::default()
        }
    }

    /// A real decodable JPEG so the commit phase can compress it.
    fn add_jpeg(&self, name: &str) -> PathBuf {
        let p = self.source.join(name);
        image::DynamicImage::new_rgb8(64, 48).save(&p).unwrap();
        p
    }

    fn seed(&mut self, name: &str, folder: &str, axis: usize) -> i64 {
        let pid = registry::create_person(&self.conn, name, folder).unwrap();
        let mut v = vec![0.0f32; 4];
        v[axis] = 1.0;
        registry::add_embedding(&mut self.conn, pid, &v, EmbeddingSource::Reference, 30).unwrap();
        pid
    }

    fn engine(&self, analyzer: Arc<dyn FaceAnalyzer>) -> BatchEngine {
        self.engine_with_config(analyzer, self.config())
    }

    fn engine_with_config(
        &self,
        analyzer: Arc<dyn FaceAnalyzer>,
        config: JobConfig,
    ) -> BatchEngine {
        BatchEngine::new(self.settings.clone(), self.storage.clone(), &config, analyzer).unwrap()
    }

    fn run_all_batches(&mut self, engine: &mut BatchEngine) {
        loop {
            let pending = jobs::get_pending_batches(&self.conn, 1).unwrap();
            let Some(batch) = pending.into_iter().next() else {
                break;
            };
            engine.process_batch(&mut self.conn, batch.batch_id).unwrap();
        }
    }
}

/// Unit vector at Euclidean distance `d` from the first axis.
fn vector_at_distance(d: f32) -> Vec<f32> {
    let cos = 1.0 - d * d / 2.0;
    let sin = (1.0 - cos * cos).sqrt();
    vec![cos, sin, 0.0, 0.0]
}

fn axis(i: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; 4];
    v[i] = 1.0;
    v
}

fn files_under(dir: &Path) -> Vec<PathBuf> {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().to_path_buf())
        .collect()
}

// ── S2: single match with online learning ─────────────────────────────────────

#[test]
fn test_single_match_routes_learns_and_records_result() {
    let mut rig = Rig::new();
    let alice = rig.seed("Alice", "alice", 0);
    let src = rig.add_jpeg("a.jpg");
    let hash = stream_hash(&src).unwrap();

    let analyzer = Arc::new(StubAnalyzer::new().with_faces("a.jpg", vec![vector_at_distance(0.3)]));
    let mut engine = rig.engine(analyzer);
    let outcome = engine.discover_images(&mut rig.conn).unwrap();
    assert_eq!(outcome.image_count, 1);
    assert_eq!(outcome.batch_count, 1);

    let batch_id = jobs::get_pending_batches(&rig.conn, 1).unwrap()[0].batch_id;
    let summary = engine.process_batch(&mut rig.conn, batch_id).unwrap();
    assert_eq!(summary.status, BatchRunStatus::Committed);
    assert_eq!(summary.files_routed, 1);

    // Exactly one output, deterministically named.
    let expected = rig
        .output
        .join("alice")
        .join(format!("a__{}.jpg", &hash[..12]));
    assert!(expected.exists(), "expected {:?}", expected);
    assert_eq!(files_under(&rig.output).len(), 1);

    // Output is a valid JPEG under the locked policy.
    let out = image::open(&expected).unwrap();
    assert!(out.width().max(out.height()) <= 2048);

    // ImageResult persisted: 1 face, 1 match, 0 unknown.
    let image_id: i64 = rig
        .conn
        .query_row("SELECT image_id FROM images", [], |r| r.get(0))
        .unwrap();
    let result = jobs::get_image_result(&rig.conn, image_id).unwrap().unwrap();
    assert_eq!(result.face_count, 1);
    assert_eq!(result.matched_count, 1);
    assert_eq!(result.unknown_count, 0);
    assert_eq!(result.matched_person_ids, vec![alice]);

    // Strict match learned: Alice's embeddings grew to 2.
    assert_eq!(
        registry::get_person_embeddings(&rig.conn, alice).unwrap().len(),
        2
    );

    // Batch reached its terminal state; scratch areas are clean.
    let batch = jobs::get_batch(&rig.conn, batch_id).unwrap().unwrap();
    assert_eq!(batch.state, BatchState::Committed);
    assert!(files_under(&rig.storage.staging_dir()).is_empty());
    assert!(files_under(&rig.storage.temp_dir()).is_empty());
}

// ── S3: fan-out to multiple persons ───────────────────────────────────────────

#[test]
fn test_fan_out_copies_identical_bytes_to_each_match() {
    let mut rig = Rig::new();
    rig.seed("Alice", "alice", 0);
    rig.seed("Bob", "bob", 1);
    let src = rig.add_jpeg("group.jpg");
    let hash = stream_hash(&src).unwrap();

    let analyzer =
        Arc::new(StubAnalyzer::new().with_faces("group.jpg", vec![axis(0), axis(1)]));
    let mut engine = rig.engine(analyzer);
    engine.discover_images(&mut rig.conn).unwrap();
    let batch_id = jobs::get_pending_batches(&rig.conn, 1).unwrap()[0].batch_id;
    let summary = engine.process_batch(&mut rig.conn, batch_id).unwrap();
    assert_eq!(summary.files_routed, 2);

    let name = format!("group__{}.jpg", &hash[..12]);
    let a = rig.output.join("alice").join(&name);
    let b = rig.output.join("bob").join(&name);
    assert!(a.exists() && b.exists());
    assert_eq!(
        std::fs::read(&a).unwrap(),
        std::fs::read(&b).unwrap(),
        "fan-out copies must be byte-identical"
    );
}

// ── S4: crash during COMMITTING is replayed idempotently ──────────────────────

#[test]
fn test_commit_replay_fills_missing_target_without_touching_existing() {
    let mut rig = Rig::new();
    rig.seed("Alice", "alice", 0);
    rig.seed("Bob", "bob", 1);
    let src = rig.add_jpeg("pair.jpg");
    let hash = stream_hash(&src).unwrap();

    // Resume reads the operator config from the catalog, so persist it.
    jobs::set_job_config(&rig.conn, &rig.config()).unwrap();

    let stub = || {
        Arc::new(StubAnalyzer::new().with_faces("pair.jpg", vec![axis(0), axis(1)]))
            as Arc<dyn FaceAnalyzer>
    };
    let mut engine = rig.engine(stub());
    engine.discover_images(&mut rig.conn).unwrap();
    let batch_id = jobs::get_pending_batches(&rig.conn, 1).unwrap()[0].batch_id;
    engine.process_batch(&mut rig.conn, batch_id).unwrap();

    let name = format!("pair__{}.jpg", &hash[..12]);
    let alice_copy = rig.output.join("alice").join(&name);
    let bob_copy = rig.output.join("bob").join(&name);
    assert!(alice_copy.exists() && bob_copy.exists());

    // Simulate the crash: one target vanished mid-commit, the batch row
    // was still COMMITTING, and the worker died.
    std::fs::remove_file(&bob_copy).unwrap();
    std::fs::write(&alice_copy, b"SENTINEL: must not be rewritten").unwrap();
    rig.conn
        .execute(
            "UPDATE batches SET state = 'COMMITTING' WHERE batch_id = ?1",
            rusqlite::params![batch_id],
        )
        .unwrap();

    // Restart: resume replays the commit phase.
    let report =
        resume_interrupted(&mut rig.conn, &rig.settings, &rig.storage, stub()).unwrap();
    assert_eq!(report.commits_replayed, 1);

    assert!(bob_copy.exists(), "missing target must be filled in");
    assert_eq!(
        std::fs::read(&alice_copy).unwrap(),
        b"SENTINEL: must not be rewritten",
        "existing target must be untouched (append-only)"
    );
    assert_eq!(
        jobs::get_batch(&rig.conn, batch_id).unwrap().unwrap().state,
        BatchState::Committed
    );
}

#[test]
fn test_resume_resets_processing_batches_to_pending() {
    let mut rig = Rig::new();
    rig.seed("Alice", "alice", 0);
    rig.add_jpeg("a.jpg");

    let stub = || Arc::new(StubAnalyzer::new()) as Arc<dyn FaceAnalyzer>;
    let mut engine = rig.engine(stub());
    engine.discover_images(&mut rig.conn).unwrap();
    let batch_id = jobs::get_pending_batches(&rig.conn, 1).unwrap()[0].batch_id;
    jobs::update_batch_state(&rig.conn, batch_id, BatchState::Processing).unwrap();

    let report =
        resume_interrupted(&mut rig.conn, &rig.settings, &rig.storage, stub()).unwrap();
    assert_eq!(report.reset_to_pending, 1);
    assert_eq!(
        jobs::get_batch(&rig.conn, batch_id).unwrap().unwrap().state,
        BatchState::Pending
    );
}

/// Reprocessing after a crash-reset converges to the same outputs an
/// uninterrupted run would have produced.
#[test]
fn test_reprocessing_after_reset_converges_to_same_outputs() {
    let mut rig = Rig::new();
    rig.seed("Alice", "alice", 0);
    rig.add_jpeg("a.jpg");
    rig.add_jpeg("b.jpg");

    let analyzer = Arc::new(
        StubAnalyzer::new()
            .with_faces("a.jpg", vec![vector_at_distance(0.2)])
            .with_faces("b.jpg", vec![vector_at_distance(0.3)]),
    );
    let mut engine = rig.engine(analyzer.clone());
    engine.discover_images(&mut rig.conn).unwrap();
    let batch_id = jobs::get_pending_batches(&rig.conn, 1).unwrap()[0].batch_id;

    // First attempt dies mid-PROCESSING (simulated: claim + partial result,
    // then reset).
    jobs::update_batch_state(&rig.conn, batch_id, BatchState::Processing).unwrap();
    jobs::update_batch_state(&rig.conn, batch_id, BatchState::Pending).unwrap();

    engine.process_batch(&mut rig.conn, batch_id).unwrap();
    let outputs: Vec<_> = files_under(&rig.output)
        .iter()
        .map(|p| p.strip_prefix(&rig.output).unwrap().to_path_buf())
        .collect();
    assert_eq!(outputs.len(), 2);

    // Second full run over the same batch produces no new files and no error.
    rig.conn
        .execute(
            "UPDATE batches SET state = 'PENDING' WHERE batch_id = ?1",
            rusqlite::params![batch_id],
        )
        .unwrap();
    engine.process_batch(&mut rig.conn, batch_id).unwrap();
    let after: Vec<_> = files_under(&rig.output)
        .iter()
        .map(|p| p.strip_prefix(&rig.output).unwrap().to_path_buf())
        .collect();
    assert_eq!(outputs, after, "idempotent commit: file set must be unchanged");
}

// ── S5 (raw path): decode failure is absorbed, scratch space stays clean ──────

#[test]
fn test_unreadable_raw_is_skipped_with_zero_face_result() {
    let mut rig = Rig::new();
    rig.seed("Alice", "alice", 0);
    // Not a real ARW; the decoder will reject it.
    std::fs::write(rig.source.join("photo.arw"), b"not really raw").unwrap();

    let analyzer = Arc::new(StubAnalyzer::new().with_fallback(vec![axis(0)]));
    let mut engine = rig.engine(analyzer.clone());
    engine.discover_images(&mut rig.conn).unwrap();
    let batch_id = jobs::get_pending_batches(&rig.conn, 1).unwrap()[0].batch_id;
    let summary = engine.process_batch(&mut rig.conn, batch_id).unwrap();

    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.faces_detected, 0);

    // Zero-face result persisted so the image is never retried.
    let image_id: i64 = rig
        .conn
        .query_row("SELECT image_id FROM images", [], |r| r.get(0))
        .unwrap();
    let result = jobs::get_image_result(&rig.conn, image_id).unwrap().unwrap();
    assert_eq!(result.face_count, 0);
    assert_eq!(result.matched_count, 0);

    // The raw file itself was never handed to the face model, and no
    // scratch files survived.
    assert!(analyzer
        .seen_paths()
        .iter()
        .all(|p| !p.to_string_lossy().ends_with(".arw")));
    assert!(files_under(&rig.storage.temp_dir()).is_empty());

    // The batch still commits.
    assert_eq!(
        jobs::get_batch(&rig.conn, batch_id).unwrap().unwrap().state,
        BatchState::Committed
    );
    assert!(files_under(&rig.output).is_empty());
}

#[test]
fn test_unreadable_jpeg_is_absorbed_and_batch_continues() {
    let mut rig = Rig::new();
    let alice = rig.seed("Alice", "alice", 0);
    rig.add_jpeg("good.jpg");
    std::fs::write(rig.source.join("bad.jpg"), b"garbage").unwrap();

    let analyzer = Arc::new(
        StubAnalyzer::new()
            .with_faces("good.jpg", vec![axis(0)])
            .failing_on("bad.jpg"),
    );
    let mut engine = rig.engine(analyzer);
    engine.discover_images(&mut rig.conn).unwrap();
    let batch_id = jobs::get_pending_batches(&rig.conn, 1).unwrap()[0].batch_id;
    let summary = engine.process_batch(&mut rig.conn, batch_id).unwrap();

    assert_eq!(summary.images_processed, 2);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.matches, 1);
    let _ = alice;

    // good.jpg routed; bad.jpg absorbed with a zero-face result.
    assert_eq!(files_under(&rig.output.join("alice")).len(), 1);
    let bad_id: i64 = rig
        .conn
        .query_row(
            "SELECT image_id FROM images WHERE filename = 'bad.jpg'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    let result = jobs::get_image_result(&rig.conn, bad_id).unwrap().unwrap();
    assert_eq!(result.face_count, 0);
}

// ── S6: group mode ────────────────────────────────────────────────────────────

#[test]
fn test_group_mode_requires_all_selected_persons() {
    let mut rig = Rig::new();
    let alice = rig.seed("Alice", "alice", 0);
    let bob = rig.seed("Bob", "bob", 1);
    let both = rig.add_jpeg("both.jpg");
    rig.add_jpeg("only_alice.jpg");
    let hash = stream_hash(&both).unwrap();

    let mut config = rig.config();
    config.group_mode = true;
    config.group_folder_name = Some("wedding".into());
    config.selected_person_ids = Some(vec![alice, bob]);

    let analyzer = Arc::new(
        StubAnalyzer::new()
            .with_faces("both.jpg", vec![axis(0), axis(1)])
            .with_faces("only_alice.jpg", vec![axis(0)]),
    );
    let mut engine = rig.engine_with_config(analyzer, config);
    engine.discover_images(&mut rig.conn).unwrap();
    rig.run_all_batches(&mut engine);

    // Only the image with the full set lands, under the group folder.
    let outputs = files_under(&rig.output);
    assert_eq!(outputs.len(), 1);
    assert_eq!(
        outputs[0],
        rig.output
            .join("wedding")
            .join(format!("both__{}.jpg", &hash[..12]))
    );

    // The partial image's matches were cleared.
    let partial_id: i64 = rig
        .conn
        .query_row(
            "SELECT image_id FROM images WHERE filename = 'only_alice.jpg'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    let result = jobs::get_image_result(&rig.conn, partial_id).unwrap().unwrap();
    assert_eq!(result.matched_count, 0, "partial group match must be cleared");
    assert_eq!(result.face_count, 1);
}

// ── Termination, empty batches, already-committed ─────────────────────────────

#[test]
fn test_terminating_mid_batch_commits_partial_work() {
    let mut rig = Rig::new();
    rig.seed("Alice", "alice", 0);
    // Two chunks' worth of images with a tiny terminate window.
    rig.settings.terminate_chunk = 2;
    for i in 0..4 {
        rig.add_jpeg(&format!("img_{}.jpg", i));
    }

    let analyzer = Arc::new(StubAnalyzer::new().with_fallback(vec![axis(0)]));
    let mut engine = rig.engine(analyzer);
    engine.discover_images(&mut rig.conn).unwrap();
    let batch_id = jobs::get_pending_batches(&rig.conn, 1).unwrap()[0].batch_id;

    // Flip to terminating before processing starts: the chunk guard fires
    // immediately, nothing is analyzed, and the batch closes out cleanly.
    jobs::set_job_status(&rig.conn, crate::jobs::model::JobStatus::Terminating).unwrap();
    let summary = engine.process_batch(&mut rig.conn, batch_id).unwrap();

    assert!(summary.terminated);
    assert_eq!(summary.images_processed, 0);
    assert_eq!(
        jobs::get_batch(&rig.conn, batch_id).unwrap().unwrap().state,
        BatchState::Committed,
        "terminated batches still run their commit phase to completion"
    );
    assert!(files_under(&rig.output).is_empty());
}

#[test]
fn test_already_committed_batch_is_skipped() {
    let mut rig = Rig::new();
    rig.seed("Alice", "alice", 0);
    rig.add_jpeg("a.jpg");

    let analyzer = Arc::new(StubAnalyzer::new().with_faces("a.jpg", vec![axis(0)]));
    let mut engine = rig.engine(analyzer);
    engine.discover_images(&mut rig.conn).unwrap();
    let batch_id = jobs::get_pending_batches(&rig.conn, 1).unwrap()[0].batch_id;
    engine.process_batch(&mut rig.conn, batch_id).unwrap();

    let again = engine.process_batch(&mut rig.conn, batch_id).unwrap();
    assert_eq!(again.status, BatchRunStatus::AlreadyCommitted);
}

#[test]
fn test_batches_observe_only_legal_state_sequences() {
    let mut rig = Rig::new();
    rig.seed("Alice", "alice", 0);
    rig.settings.atomic_batch_size = 2;
    for i in 0..5 {
        rig.add_jpeg(&format!("img_{}.jpg", i));
    }

    let analyzer = Arc::new(StubAnalyzer::new().with_fallback(vec![axis(0)]));
    let mut engine = rig.engine(analyzer);
    engine.discover_images(&mut rig.conn).unwrap();
    rig.run_all_batches(&mut engine);

    // Every batch ended COMMITTED with both timestamps stamped, i.e. it
    // walked the full PENDING → PROCESSING → COMMITTING → COMMITTED path.
    let mut stmt = rig
        .conn
        .prepare("SELECT state, started_at, committed_at FROM batches")
        .unwrap();
    let rows: Vec<(String, Option<String>, Option<String>)> = stmt
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
        .unwrap()
        .collect::<rusqlite::Result<_>>()
        .unwrap();
    assert_eq!(rows.len(), 3);
    for (state, started, committed) in rows {
        assert_eq!(state, "COMMITTED");
        assert!(started.is_some());
        assert!(committed.is_some());
    }

    // Job counters converged on the full catalog.
    let job = jobs::get_active_job(&rig.conn).unwrap().unwrap();
    assert_eq!(job.total_images, 5);
    assert_eq!(job.processed_images, 5);
}

#[test]
fn test_progress_snapshot_published_during_run() {
    let mut rig = Rig::new();
    rig.seed("Alice", "alice", 0);
    rig.add_jpeg("a.jpg");

    let analyzer = Arc::new(StubAnalyzer::new().with_faces("a.jpg", vec![axis(0)]));
    let mut engine = rig.engine(analyzer);
    engine.discover_images(&mut rig.conn).unwrap();
    let batch_id = jobs::get_pending_batches(&rig.conn, 1).unwrap()[0].batch_id;
    engine.process_batch(&mut rig.conn, batch_id).unwrap();

    let snapshot = crate::state::read_progress(&rig.storage.state_dir());
    assert_eq!(snapshot.total_images, 1);
    assert_eq!(snapshot.processed_images, 1);
    assert_eq!(snapshot.completion_percent, 100.0);
    assert_eq!(snapshot.current_batch_state.as_deref(), Some("COMMITTED"));
    assert!(snapshot.last_committed_image.is_some());
}
