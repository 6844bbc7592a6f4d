use crate::config::Settings;
use crate::db::{open_connection, run_migrations};
use crate::engine::batch::BatchEngine;
use crate::engine::faces::FaceAnalyzer;
use crate::error::{Error, Result};
use crate::jobs::model::{BatchState, JobStatus};
use crate::jobs::repository as jobs;
use crate::registry::repository as registry;
use crate::state::StateWriter;
use crate::storage::HotStorage;
use rusqlite::Connection;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Heartbeat cadence. Consumers treat the worker as online while the
/// heartbeat is younger than 10 s, so 3 s gives three chances per window.
const HEARTBEAT_PERIOD: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Default)]
pub struct ResumeReport {
    /// Batches reset from PROCESSING back to PENDING.
    pub reset_to_pending: usize,
    /// Batches whose commit phase was replayed to COMMITTED.
    pub commits_replayed: usize,
}

/// Startup recovery. PROCESSING batches are reset to PENDING (their result
/// upserts make reprocessing safe); COMMITTING batches get their commit
/// phase replayed — deterministic names mean already-materialized outputs
/// are skipped and missing ones are filled in — then become COMMITTED.
pub fn resume_interrupted(
    conn: &mut Connection,
    settings: &Settings,
    storage: &HotStorage,
    analyzer: Arc<dyn FaceAnalyzer>,
) -> Result<ResumeReport> {
    let mut report = ResumeReport::default();

    for batch in jobs::get_batches_by_state(conn, BatchState::Processing)? {
        tracing::info!("resume: resetting batch {} to PENDING", batch.batch_id);
        jobs::update_batch_state(conn, batch.batch_id, BatchState::Pending)?;
        report.reset_to_pending += 1;
    }

    let committing = jobs::get_batches_by_state(conn, BatchState::Committing)?;
    if committing.is_empty() {
        return Ok(report);
    }

    let config = jobs::get_job_config(conn)?;
    let mut engine = match BatchEngine::new(
        settings.clone(),
        storage.clone(),
        &config,
        analyzer,
    ) {
        Ok(engine) => Some(engine),
        Err(e) => {
            // The output tree is unreachable (drive unplugged, config
            // cleared). The batch cannot be replayed and must not wedge the
            // machine: whatever was written stays, the rest is lost.
            tracing::warn!("resume: cannot rebuild engine for commit replay: {}", e);
            None
        }
    };

    for batch in committing {
        tracing::info!("resume: replaying commit of batch {}", batch.batch_id);
        match engine.as_mut() {
            Some(engine) => {
                if let Err(e) = engine.commit_batch(conn, batch.batch_id) {
                    tracing::warn!(
                        "resume: commit replay of batch {} failed: {}",
                        batch.batch_id,
                        e
                    );
                    let _ = jobs::update_batch_state(conn, batch.batch_id, BatchState::Committed);
                }
            }
            None => {
                let _ = jobs::update_batch_state(conn, batch.batch_id, BatchState::Committed);
            }
        }
        report.commits_replayed += 1;
    }
    Ok(report)
}

/// The long-running supervisor: initializes the catalog, resumes once,
/// emits heartbeats from a dedicated thread, and dispatches pending batches
/// while the job status is `running`.
pub struct WorkerRunner {
    settings: Settings,
    storage: HotStorage,
    analyzer: Arc<dyn FaceAnalyzer>,
    state_writer: StateWriter,
    running: Arc<AtomicBool>,
    status: Arc<Mutex<String>>,
    poll_interval: Duration,
}

impl WorkerRunner {
    pub fn new(
        settings: Settings,
        storage: HotStorage,
        analyzer: Arc<dyn FaceAnalyzer>,
    ) -> Result<WorkerRunner> {
        storage.ensure_directories()?;
        let state_writer = StateWriter::new(storage.state_dir())?;
        Ok(WorkerRunner {
            settings,
            storage,
            analyzer,
            state_writer,
            running: Arc::new(AtomicBool::new(true)),
            status: Arc::new(Mutex::new("starting".to_string())),
            poll_interval: Duration::from_secs(3),
        })
    }

    /// Shorter polling for tests.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Flip to false to make `run` return after the current iteration.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn current_status(&self) -> String {
        self.status.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn set_status(&self, status: impl Into<String>) {
        if let Ok(mut guard) = self.status.lock() {
            *guard = status.into();
        }
    }

    /// Main worker loop. Returns when the stop flag is cleared.
    pub fn run(&mut self) -> Result<()> {
        let mut conn = open_connection(&self.storage.db_path())
            .map_err(|e| Error::Internal(format!("cannot open catalog: {}", e)))?;
        run_migrations(&conn).map_err(|e| Error::Internal(format!("migrations: {}", e)))?;

        let heartbeat = self.spawn_heartbeat();

        self.set_status("resuming");
        let resume = match resume_interrupted(
            &mut conn,
            &self.settings,
            &self.storage,
            Arc::clone(&self.analyzer),
        ) {
            Ok(report) => report,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = heartbeat.join();
                return Err(e);
            }
        };
        if resume.reset_to_pending + resume.commits_replayed > 0 {
            tracing::info!(
                "resume: {} reset, {} commit(s) replayed",
                resume.reset_to_pending,
                resume.commits_replayed
            );
        }
        self.set_status("idle");

        let mut engine: Option<BatchEngine> = None;
        let mut job_initialized = false;

        while self.running.load(Ordering::SeqCst) {
            if let Err(e) = self.tick(&mut conn, &mut engine, &mut job_initialized) {
                self.set_status(format!("error: {}", e));
                tracing::error!("worker loop error: {}", e);
                self.sleep();
            }
        }

        self.running.store(false, Ordering::SeqCst);
        let _ = heartbeat.join();
        Ok(())
    }

    /// One supervisor iteration. Any error from batch processing resets the
    /// claimed batch back to PENDING before propagating, so a poisoned
    /// batch never sticks in PROCESSING.
    fn tick(
        &mut self,
        conn: &mut Connection,
        engine: &mut Option<BatchEngine>,
        job_initialized: &mut bool,
    ) -> Result<()> {
        let config = jobs::get_job_config(conn)?;
        if config.source_root.is_none() || config.output_root.is_none() {
            self.set_status("waiting_for_config");
            *job_initialized = false;
            *engine = None;
            self.sleep();
            return Ok(());
        }

        let job_status = jobs::get_job_status(conn)?;
        if job_status == JobStatus::Terminating {
            // Terminate observed between batches: nothing is in flight, so
            // it degrades to a plain stop.
            jobs::set_job_status(conn, JobStatus::Stopped)?;
            return Ok(());
        }
        if job_status != JobStatus::Running {
            self.set_status("waiting_for_start");
            // Next Start re-discovers from scratch.
            *job_initialized = false;
            self.sleep();
            return Ok(());
        }

        if !*job_initialized {
            self.set_status("discovering_images");

            // A run with zero seeded persons can never match anything.
            let mut centroids = registry::get_all_centroids(conn)?;
            if let Some(selected) = &config.selected_person_ids {
                centroids.retain(|c| selected.contains(&c.person_id));
            }
            if centroids.is_empty() {
                tracing::error!("cannot start: no seeded persons to match against");
                jobs::set_job_status(conn, JobStatus::Configured)?;
                return Err(Error::ConfigInvalid(
                    "no seeded persons to match against".to_string(),
                ));
            }

            jobs::clear_job_data(conn)?;

            let mut fresh = BatchEngine::new(
                self.settings.clone(),
                self.storage.clone(),
                &config,
                Arc::clone(&self.analyzer),
            )
            .map_err(|e| {
                // Surface config problems to the operator instead of
                // retrying forever.
                if let Err(status_err) = jobs::set_job_status(conn, JobStatus::Configured) {
                    tracing::warn!("cannot reset job status: {}", status_err);
                }
                e
            })?;

            let outcome = fresh.discover_images(conn)?;
            tracing::info!(
                "discovered {} image(s) in {} batch(es)",
                outcome.image_count,
                outcome.batch_count
            );
            if outcome.image_count == 0 {
                tracing::warn!("no images found under the source root");
            }
            *engine = Some(fresh);
            *job_initialized = true;
        }

        let pending = jobs::get_pending_batches(conn, 1)?;
        let Some(batch) = pending.into_iter().next() else {
            self.set_status("completed");
            jobs::set_job_status(conn, JobStatus::Completed)?;
            *job_initialized = false; // allow restart
            self.sleep();
            return Ok(());
        };

        self.set_status(format!("processing_batch_{}", batch.batch_id));
        let engine_ref = engine
            .as_mut()
            .ok_or_else(|| Error::Internal("engine missing after init".to_string()))?;
        match engine_ref.process_batch(conn, batch.batch_id) {
            Ok(summary) => {
                if summary.terminated {
                    jobs::set_job_status(conn, JobStatus::Stopped)?;
                }
                Ok(())
            }
            Err(e) => {
                // Un-claim the batch so it can be retried after the sleep.
                if let Ok(Some(row)) = jobs::get_batch(conn, batch.batch_id) {
                    if row.state == BatchState::Processing {
                        if let Err(reset_err) =
                            jobs::update_batch_state(conn, batch.batch_id, BatchState::Pending)
                        {
                            tracing::warn!(
                                "cannot reset batch {}: {}",
                                batch.batch_id,
                                reset_err
                            );
                        }
                    }
                }
                Err(e)
            }
        }
    }

    /// Heartbeat thread: independent of batch work, so a long analysis
    /// never makes the worker look dead.
    fn spawn_heartbeat(&self) -> std::thread::JoinHandle<()> {
        let writer = self.state_writer.clone();
        let running = Arc::clone(&self.running);
        let status = Arc::clone(&self.status);
        std::thread::spawn(move || {
            let mut last_beat: Option<Instant> = None;
            while running.load(Ordering::SeqCst) {
                let due = last_beat
                    .map(|t| t.elapsed() >= HEARTBEAT_PERIOD)
                    .unwrap_or(true);
                if due {
                    let current = status.lock().map(|s| s.clone()).unwrap_or_default();
                    if let Err(e) = writer.write_heartbeat(&current) {
                        tracing::warn!("heartbeat write failed: {}", e);
                    }
                    last_beat = Some(Instant::now());
                }
                // Short naps keep shutdown prompt.
                std::thread::sleep(Duration::from_millis(50));
            }
        })
    }

    fn sleep(&self) {
        std::thread::sleep(self.poll_interval);
    }
}
