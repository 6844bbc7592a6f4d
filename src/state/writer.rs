use crate::error::Result;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

/// Heartbeat age below which the worker counts as online.
const ONLINE_WINDOW_SECS: i64 = 10;

/// What the engine knows at the moment of a progress write.
#[derive(Debug, Clone, Default)]
pub struct ProgressReport {
    pub total_images: i64,
    pub processed_images: i64,
    pub current_batch_id: Option<i64>,
    pub current_batch_state: Option<String>,
    pub current_image_range: Option<String>,
    pub current_image: Option<String>,
    pub last_committed_person: Option<String>,
    pub last_committed_image: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub source_root: Option<String>,
    pub output_root: Option<String>,
}

/// The published `progress.json` document, derived fields included.
/// The tracker UI reads this file and nothing else.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ProgressSnapshot {
    pub total_images: i64,
    pub processed_images: i64,
    pub completion_percent: f64,
    pub current_batch_id: Option<i64>,
    pub current_batch_state: Option<String>,
    pub current_image_range: Option<String>,
    pub current_image: Option<String>,
    pub last_committed_person: Option<String>,
    pub last_committed_image: Option<String>,
    pub last_committed_time: Option<String>,
    pub updated_at: Option<String>,
    pub source_root: Option<String>,
    pub output_root: Option<String>,
    pub start_time: Option<String>,
    pub elapsed_seconds: Option<f64>,
    pub elapsed_formatted: Option<String>,
    pub estimated_remaining_seconds: Option<f64>,
    pub estimated_remaining_formatted: Option<String>,
    pub estimated_total_seconds: Option<f64>,
    pub images_per_second: Option<f64>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Heartbeat {
    pub timestamp: String,
    pub pid: u32,
    pub status: String,
}

/// Publishes observer-plane snapshots. Every write is temp-file + rename so
/// a reader never sees a torn document.
#[derive(Debug, Clone)]
pub struct StateWriter {
    state_dir: PathBuf,
}

impl StateWriter {
    pub fn new(state_dir: impl Into<PathBuf>) -> std::io::Result<StateWriter> {
        let state_dir = state_dir.into();
        std::fs::create_dir_all(&state_dir)?;
        Ok(StateWriter { state_dir })
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn atomic_write<T: serde::Serialize>(&self, file_name: &str, data: &T) -> Result<()> {
        let path = self.state_dir.join(file_name);
        let tmp = self.state_dir.join(format!("{}.tmp", file_name));
        std::fs::write(&tmp, serde_json::to_string_pretty(data)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn write_progress(&self, report: &ProgressReport) -> Result<()> {
        let now = Utc::now();
        let mut snapshot = ProgressSnapshot {
            total_images: report.total_images,
            processed_images: report.processed_images,
            current_batch_id: report.current_batch_id,
            current_batch_state: report.current_batch_state.clone(),
            current_image_range: report.current_image_range.clone(),
            current_image: report.current_image.clone(),
            last_committed_person: report.last_committed_person.clone(),
            last_committed_image: report.last_committed_image.clone(),
            last_committed_time: report
                .last_committed_image
                .as_ref()
                .map(|_| now.to_rfc3339()),
            updated_at: Some(now.to_rfc3339()),
            source_root: report.source_root.clone(),
            output_root: report.output_root.clone(),
            start_time: report.start_time.map(|t| t.to_rfc3339()),
            ..ProgressSnapshot::default()
        };

        if report.total_images > 0 {
            snapshot.completion_percent =
                (report.processed_images as f64 / report.total_images as f64 * 100.0 * 100.0)
                    .round()
                    / 100.0;
        }

        if let (Some(start), true) = (report.start_time, report.processed_images > 0) {
            let elapsed = (now - start).num_milliseconds() as f64 / 1000.0;
            if elapsed > 0.0 {
                let rate = report.processed_images as f64 / elapsed;
                let remaining = (report.total_images - report.processed_images) as f64;
                snapshot.elapsed_seconds = Some(elapsed);
                snapshot.elapsed_formatted = Some(format_duration(elapsed));
                snapshot.images_per_second = Some((rate * 100.0).round() / 100.0);
                if rate > 0.0 {
                    let eta = remaining / rate;
                    snapshot.estimated_remaining_seconds = Some(eta);
                    snapshot.estimated_remaining_formatted = Some(format_duration(eta));
                    snapshot.estimated_total_seconds =
                        Some(report.total_images as f64 / rate);
                }
            }
        }

        self.atomic_write("progress.json", &snapshot)
    }

    pub fn write_heartbeat(&self, status: &str) -> Result<()> {
        let heartbeat = Heartbeat {
            timestamp: Utc::now().to_rfc3339(),
            pid: std::process::id(),
            status: status.to_string(),
        };
        self.atomic_write("worker_heartbeat.json", &heartbeat)
    }
}

/// Read the last-published progress snapshot. A missing or torn file reads
/// as the empty structure — the observer plane stays usable even when the
/// engine is broken.
pub fn read_progress(state_dir: &Path) -> ProgressSnapshot {
    let path = state_dir.join("progress.json");
    std::fs::read_to_string(path)
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_default()
}

pub fn read_heartbeat(state_dir: &Path) -> Option<Heartbeat> {
    let path = state_dir.join("worker_heartbeat.json");
    let text = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
}

/// The worker counts as online iff its heartbeat is younger than 10 s.
pub fn heartbeat_is_online(heartbeat: &Heartbeat, now: DateTime<Utc>) -> bool {
    match DateTime::parse_from_rfc3339(&heartbeat.timestamp) {
        Ok(ts) => (now - ts.with_timezone(&Utc)).num_seconds() < ONLINE_WINDOW_SECS,
        Err(_) => false,
    }
}

fn format_duration(seconds: f64) -> String {
    let secs = seconds as u64;
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}
