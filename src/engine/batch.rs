use crate::config::Settings;
use crate::engine::compress::{compress_jpeg, OutputPolicy};
use crate::engine::faces::FaceAnalyzer;
use crate::engine::ingest::{self, IngestOutcome};
use crate::engine::matcher::{apply_group_mode, Matcher};
use crate::engine::raw;
use crate::engine::routing::{self, RouteOutcome, RouteStatus, RouteTarget};
use crate::error::{Error, Result};
use crate::jobs::model::{BatchState, CommitCandidate, CommitStatus, ImageResult, ImageRow, JobConfig, JobStatus};
use crate::jobs::repository as jobs;
use crate::registry::repository as registry;
use crate::state::{ProgressReport, StateWriter};
use crate::storage::{deterministic_name, is_valid_folder_segment, stream_hash, HotStorage};
use rayon::prelude::*;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Group-mode settings: the image is kept only when every required person
/// appears, and output goes to a single shared folder.
#[derive(Debug, Clone)]
struct GroupMode {
    required: Vec<i64>,
    folder_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchRunStatus {
    Committed,
    AlreadyCommitted,
    Empty,
}

/// What `process_batch` reports back to the supervisor.
#[derive(Debug, Clone)]
pub struct BatchSummary {
    pub batch_id: i64,
    pub status: BatchRunStatus,
    pub images_processed: usize,
    pub faces_detected: i64,
    pub matches: i64,
    pub unknowns: i64,
    pub files_routed: usize,
    pub skipped: usize,
    /// True when the job flipped to `terminating` mid-batch; whatever was
    /// analyzed so far has been committed.
    pub terminated: bool,
}

/// Per-image output of the parallel analysis stage. Carries no connection
/// state — all catalog writes happen afterwards on the coordinator.
struct Analysis {
    image_id: i64,
    sha256: Option<String>,
    embeddings: Vec<Vec<f32>>,
    skipped: bool,
}

enum RoutePlan {
    Persons(Vec<RouteTarget>),
    Group(String),
}

/// Everything the pool needs to commit one image, resolved up front so the
/// parallel stage stays free of catalog access.
struct CommitPlan {
    image_id: i64,
    source_path: String,
    stem: String,
    hash: String,
    output_filename: String,
    route: RoutePlan,
}

struct CommitResult {
    image_id: i64,
    output_filename: String,
    outcomes: Vec<RouteOutcome>,
}

/// Orchestrates the atomic batch state machine:
///
/// ```text
/// PENDING → PROCESSING → COMMITTING → COMMITTED
/// ```
///
/// PROCESSING detects, matches and persists results but never writes to the
/// output tree; COMMITTING performs only append-only writes with
/// deterministic names. A crash in PROCESSING is undone by resetting to
/// PENDING (result upserts make reprocessing safe); a crash in COMMITTING
/// is finished by replaying the commit phase (existing outputs are skipped).
impl std::fmt::Debug for BatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchEngine").finish()
    }
}

pub struct BatchEngine {
    settings: Settings,
    storage: HotStorage,
    source_root: PathBuf,
    output_root: PathBuf,
    analyzer: Arc<dyn FaceAnalyzer>,
    matcher: Matcher,
    state_writer: StateWriter,
    pool: rayon::ThreadPool,
    policy: OutputPolicy,
    selected_image_paths: Option<Vec<String>>,
    group: Option<GroupMode>,
    job_id: Option<i64>,
    total_images: i64,
    processed_images: i64,
    start_time: Option<chrono::DateTime<chrono::Utc>>,
}

impl BatchEngine {
    /// Build an engine for the given operator configuration. Fails with
    /// `ConfigMissing`/`ConfigInvalid` when the roots or group settings
    /// cannot support a run.
    pub fn new(
        settings: Settings,
        storage: HotStorage,
        config: &JobConfig,
        analyzer: Arc<dyn FaceAnalyzer>,
    ) -> Result<BatchEngine> {
        let source_root = PathBuf::from(
            config
                .source_root
                .as_deref()
                .ok_or(Error::ConfigMissing("source_root"))?,
        );
        let output_root = PathBuf::from(
            config
                .output_root
                .as_deref()
                .ok_or(Error::ConfigMissing("output_root"))?,
        );
        if !source_root.is_dir() {
            return Err(Error::ConfigInvalid(format!(
                "source root {:?} is not a directory",
                source_root
            )));
        }

        let group = if config.group_mode {
            let folder_name = config
                .group_folder_name
                .clone()
                .ok_or(Error::ConfigMissing("group_folder_name"))?;
            if !is_valid_folder_segment(&folder_name) {
                return Err(Error::ConfigInvalid(format!(
                    "group folder {:?} is not a single safe path segment",
                    folder_name
                )));
            }
            let required = config
                .selected_person_ids
                .clone()
                .filter(|ids| !ids.is_empty())
                .ok_or_else(|| {
                    Error::ConfigInvalid("group mode requires selected persons".to_string())
                })?;
            Some(GroupMode {
                required,
                folder_name,
            })
        } else {
            None
        };

        storage.ensure_directories()?;
        std::fs::create_dir_all(&output_root)?;

        let workers = settings.worker_count();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|e| Error::Internal(format!("cannot build worker pool: {}", e)))?;
        tracing::info!("batch engine: {} analysis worker(s)", workers);

        let state_writer = StateWriter::new(storage.state_dir())?;
        let matcher = Matcher::new(&settings, config.selected_person_ids.as_deref());
        let policy = OutputPolicy {
            max_long_edge: settings.output_max_long_edge,
            quality: settings.output_jpeg_quality,
        };

        Ok(BatchEngine {
            settings,
            storage,
            source_root,
            output_root,
            analyzer,
            matcher,
            state_writer,
            pool,
            policy,
            selected_image_paths: config.selected_image_paths.clone(),
            group,
            job_id: None,
            total_images: 0,
            processed_images: 0,
            start_time: None,
        })
    }

    pub fn job_id(&self) -> Option<i64> {
        self.job_id
    }

    /// Catalog the source tree and pre-cut batches. Called once per job start.
    pub fn discover_images(&mut self, conn: &mut Connection) -> Result<IngestOutcome> {
        let outcome = ingest::run_ingestion(
            conn,
            &self.source_root,
            &self.output_root,
            self.selected_image_paths.as_deref(),
            self.settings.atomic_batch_size,
            false,
        )?;
        self.job_id = Some(outcome.job_id);
        self.total_images = outcome.image_count;
        self.processed_images = 0;
        self.start_time = Some(chrono::Utc::now());
        self.publish(|p| p.current_batch_state = Some("READY".into()));
        Ok(outcome)
    }

    /// Drive one batch through the full state machine.
    pub fn process_batch(&mut self, conn: &mut Connection, batch_id: i64) -> Result<BatchSummary> {
        let batch = jobs::get_batch(conn, batch_id)?
            .ok_or_else(|| Error::NotFound(format!("batch {}", batch_id)))?;

        let mut summary = BatchSummary {
            batch_id,
            status: BatchRunStatus::Committed,
            images_processed: 0,
            faces_detected: 0,
            matches: 0,
            unknowns: 0,
            files_routed: 0,
            skipped: 0,
            terminated: false,
        };

        if batch.state == BatchState::Committed {
            summary.status = BatchRunStatus::AlreadyCommitted;
            return Ok(summary);
        }

        let images = jobs::get_images_for_batch(conn, batch_id)?;
        if images.is_empty() {
            jobs::update_batch_state(conn, batch_id, BatchState::Committed)?;
            summary.status = BatchRunStatus::Empty;
            return Ok(summary);
        }

        let image_range = image_range_label(&images);

        // ── PROCESSING: detect + match + persist results; no external writes.
        jobs::update_batch_state(conn, batch_id, BatchState::Processing)?;
        self.publish(|p| {
            p.current_batch_id = Some(batch_id);
            p.current_batch_state = Some("PROCESSING".into());
            p.current_image_range = Some(image_range.clone());
        });

        self.matcher.refresh(conn)?;
        tracing::info!(
            "batch {}: matching against {} person(s)",
            batch_id,
            self.matcher.person_count(conn)?
        );

        for chunk in images.chunks(self.settings.terminate_chunk) {
            // Terminate is honored between chunks: in-flight analyses finish,
            // nothing new starts, and whatever was produced gets committed.
            if jobs::get_job_status(conn)? == JobStatus::Terminating {
                tracing::info!("batch {}: terminating mid-batch", batch_id);
                summary.terminated = true;
                break;
            }

            self.publish(|p| {
                p.current_batch_id = Some(batch_id);
                p.current_batch_state = Some("PROCESSING".into());
                p.current_image_range = Some(image_range.clone());
                p.current_image = chunk.first().map(|i| i.filename.clone());
            });

            // CPU-bound stage runs on the pool; the coordinator thread keeps
            // the connection.
            let analyses: Vec<Analysis> = self
                .pool
                .install(|| chunk.par_iter().map(|img| self.analyze_image(img)).collect());

            for (img, analysis) in chunk.iter().zip(analyses) {
                summary.images_processed += 1;
                if analysis.skipped {
                    summary.skipped += 1;
                }

                let (matched, unknown) = if analysis.embeddings.is_empty() {
                    (Vec::new(), 0)
                } else {
                    self.matcher.match_image_faces(conn, &analysis.embeddings)?
                };
                let matched = match &self.group {
                    Some(group) => apply_group_mode(matched, &group.required),
                    None => matched,
                };

                summary.faces_detected += analysis.embeddings.len() as i64;
                summary.matches += matched.len() as i64;
                summary.unknowns += unknown;

                if let Some(hash) = &analysis.sha256 {
                    if img.sha256.is_none() {
                        jobs::update_image_hash(conn, analysis.image_id, hash)?;
                    }
                }
                jobs::save_image_result(
                    conn,
                    &ImageResult {
                        image_id: analysis.image_id,
                        batch_id,
                        face_count: analysis.embeddings.len() as i64,
                        matched_count: matched.len() as i64,
                        unknown_count: unknown,
                        matched_person_ids: matched,
                    },
                )?;
            }
        }

        // ── COMMITTING → COMMITTED: append-only writes to the output tree.
        jobs::update_batch_state(conn, batch_id, BatchState::Committing)?;
        self.publish(|p| {
            p.current_batch_id = Some(batch_id);
            p.current_batch_state = Some("COMMITTING".into());
        });
        summary.files_routed = self.commit_batch(conn, batch_id)?;

        tracing::info!(
            "batch {} committed: images={} faces={} matches={} unknowns={} routed={} skipped={}",
            batch_id,
            summary.images_processed,
            summary.faces_detected,
            summary.matches,
            summary.unknowns,
            summary.files_routed,
            summary.skipped
        );
        Ok(summary)
    }

    /// The commit phase: compress each matched image once to staging, fan
    /// out to its person folders (or the group folder), record the audit
    /// log, then mark the batch COMMITTED and refresh job counters.
    ///
    /// Also invoked directly by resume when a batch was left in COMMITTING:
    /// deterministic names plus the existence check in routing make the
    /// replay idempotent. Returns the number of files written or verified.
    pub fn commit_batch(&mut self, conn: &mut Connection, batch_id: i64) -> Result<usize> {
        let batch = jobs::get_batch(conn, batch_id)?
            .ok_or_else(|| Error::NotFound(format!("batch {}", batch_id)))?;
        if self.total_images <= 0 {
            self.total_images = jobs::get_image_count(conn, batch.job_id)?;
        }

        let results = jobs::get_image_results_for_batch(conn, batch_id)?;
        let plans: Vec<CommitPlan> = results
            .iter()
            .filter(|r| r.matched_count > 0)
            .filter_map(|candidate| self.plan_commit(conn, candidate))
            .collect();

        let commits: Vec<CommitResult> = self
            .pool
            .install(|| plans.par_iter().map(|plan| self.commit_one(plan)).collect());

        let mut routed = 0usize;
        let mut last_committed: Option<(Option<String>, String)> = None;
        for commit in &commits {
            for outcome in &commit.outcomes {
                let status = match &outcome.status {
                    RouteStatus::Written => CommitStatus::Written,
                    RouteStatus::AlreadyExists => CommitStatus::Skipped,
                    RouteStatus::Failed(_) => CommitStatus::Failed,
                };
                jobs::append_commit_entry(
                    conn,
                    batch_id,
                    commit.image_id,
                    outcome.person_id,
                    &outcome.output_filename,
                    &outcome.output_path.to_string_lossy(),
                    status,
                )?;
                if !matches!(outcome.status, RouteStatus::Failed(_)) {
                    routed += 1;
                    last_committed =
                        Some((outcome.person_name.clone(), commit.output_filename.clone()));
                }
            }
        }

        jobs::update_batch_state(conn, batch_id, BatchState::Committed)?;
        self.update_job_progress(conn, batch.job_id, results.len())?;
        self.publish(|p| {
            p.current_batch_id = Some(batch_id);
            p.current_batch_state = Some("COMMITTED".into());
            if let Some((person, image)) = &last_committed {
                p.last_committed_person = person.clone();
                p.last_committed_image = Some(image.clone());
            }
        });
        Ok(routed)
    }

    /// Analyze one image on the worker pool: decode raw to scratch if
    /// needed, detect + embed, back-fill the source hash. Decode failures
    /// are absorbed — a skipped analysis persists as a zero-face result so
    /// the image is never retried.
    fn analyze_image(&self, img: &ImageRow) -> Analysis {
        let source = Path::new(&img.source_path);
        let mut temp_path: Option<PathBuf> = None;

        let recognition_path = if ingest::is_raw(source) {
            match raw::convert_for_recognition(
                source,
                &self.storage.temp_dir(),
                self.settings.output_max_long_edge,
            ) {
                Ok(path) => {
                    temp_path = Some(path.clone());
                    path
                }
                Err(e) => {
                    tracing::warn!("skipping {:?}: {}", source, e);
                    return Analysis {
                        image_id: img.image_id,
                        sha256: None,
                        embeddings: Vec::new(),
                        skipped: true,
                    };
                }
            }
        } else {
            source.to_path_buf()
        };

        let detected = self.analyzer.detect_and_embed(&recognition_path);
        // The scratch file is deleted whether or not detection succeeded.
        if let Some(temp) = &temp_path {
            raw::cleanup_temp_file(temp);
        }

        let faces = match detected {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!("skipping {:?}: {}", source, e);
                return Analysis {
                    image_id: img.image_id,
                    sha256: None,
                    embeddings: Vec::new(),
                    skipped: true,
                };
            }
        };

        // Opportunistic hash: ingest skipped it, so compute while the file
        // is warm in the page cache.
        let sha256 = match &img.sha256 {
            Some(hash) => Some(hash.clone()),
            None => match stream_hash(source) {
                Ok(hash) => Some(hash),
                Err(e) => {
                    tracing::warn!("cannot hash {:?}: {}", source, e);
                    None
                }
            },
        };

        Analysis {
            image_id: img.image_id,
            sha256,
            embeddings: faces.into_iter().map(|f| f.embedding).collect(),
            skipped: false,
        }
    }

    /// Resolve one commit candidate into a self-contained plan. Runs on the
    /// coordinator so the parallel stage needs no catalog access. Returns
    /// None (logged) when the image can no longer be committed.
    fn plan_commit(&self, conn: &Connection, candidate: &CommitCandidate) -> Option<CommitPlan> {
        let source = Path::new(&candidate.source_path);
        let stem = Path::new(&candidate.filename)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| candidate.filename.clone());

        let hash = match &candidate.sha256 {
            Some(hash) => hash.clone(),
            // Replay after a crash that predated the hash back-fill.
            None => match stream_hash(source) {
                Ok(hash) => hash,
                Err(e) => {
                    tracing::warn!("cannot hash {:?} for commit: {}", source, e);
                    return None;
                }
            },
        };

        let route = match &self.group {
            Some(group) => RoutePlan::Group(group.folder_name.clone()),
            None => {
                let mut targets = Vec::new();
                for person_id in &candidate.matched_person_ids {
                    match registry::get_person(conn, *person_id) {
                        Ok(Some(person)) => targets.push(RouteTarget {
                            person_id: person.person_id,
                            person_name: person.name,
                            folder_rel: person.output_folder_rel,
                        }),
                        Ok(None) => {
                            tracing::warn!(
                                "person {} vanished before commit of image {}",
                                person_id,
                                candidate.image_id
                            );
                        }
                        Err(e) => {
                            tracing::warn!("cannot load person {}: {}", person_id, e);
                        }
                    }
                }
                if targets.is_empty() {
                    return None;
                }
                RoutePlan::Persons(targets)
            }
        };

        let output_filename = deterministic_name(&stem, &hash);
        Some(CommitPlan {
            image_id: candidate.image_id,
            source_path: candidate.source_path.clone(),
            stem,
            hash,
            output_filename,
            route,
        })
    }

    /// Commit one image on the pool: compress once to staging, fan out,
    /// delete the staged artifact. Compression failures are absorbed — the
    /// image simply routes nowhere and the batch continues.
    fn commit_one(&self, plan: &CommitPlan) -> CommitResult {
        let source = Path::new(&plan.source_path);
        // Staging name carries the image id so duplicate source bytes in
        // one batch cannot collide mid-compress.
        let staged = self
            .storage
            .staging_dir()
            .join(format!("{}_{}", plan.image_id, plan.output_filename));

        let compressed = if ingest::is_raw(source) {
            raw::convert_for_delivery(source, &staged, &self.policy)
        } else {
            compress_jpeg(source, &staged, &self.policy)
        };
        if let Err(e) = compressed {
            tracing::warn!("cannot compress {:?} for commit: {}", source, e);
            return CommitResult {
                image_id: plan.image_id,
                output_filename: plan.output_filename.clone(),
                outcomes: Vec::new(),
            };
        }

        let outcomes = match &plan.route {
            RoutePlan::Persons(targets) => routing::route_image(
                &staged,
                &plan.stem,
                &plan.hash,
                targets,
                &self.output_root,
            ),
            RoutePlan::Group(folder) => vec![routing::route_group(
                &staged,
                &plan.stem,
                &plan.hash,
                folder,
                &self.output_root,
            )],
        };
        routing::cleanup_staged(&staged);

        CommitResult {
            image_id: plan.image_id,
            output_filename: plan.output_filename.clone(),
            outcomes,
        }
    }

    fn update_job_progress(
        &mut self,
        conn: &Connection,
        job_id: i64,
        batch_result_count: usize,
    ) -> Result<()> {
        let committed = jobs::get_committed_batch_count(conn, job_id)?;
        let batch_size = self.settings.atomic_batch_size;
        let processed = if committed > 0 {
            (committed - 1) * batch_size + batch_result_count as i64
        } else {
            batch_result_count as i64
        };
        let processed = processed.clamp(0, self.total_images);
        jobs::update_job_image_counts(conn, job_id, self.total_images, processed)?;
        self.processed_images = processed;
        Ok(())
    }

    /// Publish a progress snapshot; a failing write never fails the engine.
    fn publish<F: FnOnce(&mut ProgressReport)>(&self, fill: F) {
        let mut report = ProgressReport {
            total_images: self.total_images,
            processed_images: self.processed_images,
            start_time: self.start_time,
            source_root: Some(self.source_root.to_string_lossy().into_owned()),
            output_root: Some(self.output_root.to_string_lossy().into_owned()),
            ..ProgressReport::default()
        };
        fill(&mut report);
        if let Err(e) = self.state_writer.write_progress(&report) {
            tracing::debug!("progress write failed: {}", e);
        }
    }
}

fn image_range_label(images: &[ImageRow]) -> String {
    let stem = |row: &ImageRow| {
        Path::new(&row.filename)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| row.filename.clone())
    };
    match (images.first(), images.last()) {
        (Some(first), Some(last)) => format!("{} - {}", stem(first), stem(last)),
        _ => "--".to_string(),
    }
}
