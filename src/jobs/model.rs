/// Batch lifecycle. Persisted as the uppercase string; everything inside
/// the crate works with the enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BatchState {
    Pending,
    Processing,
    Committing,
    Committed,
}

impl BatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Pending => "PENDING",
            BatchState::Processing => "PROCESSING",
            BatchState::Committing => "COMMITTING",
            BatchState::Committed => "COMMITTED",
        }
    }

    pub fn parse(s: &str) -> Option<BatchState> {
        match s {
            "PENDING" => Some(BatchState::Pending),
            "PROCESSING" => Some(BatchState::Processing),
            "COMMITTING" => Some(BatchState::Committing),
            "COMMITTED" => Some(BatchState::Committed),
            _ => None,
        }
    }

    /// Legal transitions of the state machine. `Processing → Pending` is the
    /// crash reset; `Pending → Committed` short-circuits empty batches.
    pub fn can_transition_to(self, to: BatchState) -> bool {
        use BatchState::*;
        matches!(
            (self, to),
            (Pending, Processing)
                | (Processing, Committing)
                | (Processing, Pending)
                | (Committing, Committed)
                | (Pending, Committed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Configured,
    Running,
    Stopped,
    Terminating,
    Completed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Configured => "configured",
            JobStatus::Running => "running",
            JobStatus::Stopped => "stopped",
            JobStatus::Terminating => "terminating",
            JobStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<JobStatus> {
        match s {
            "configured" => Some(JobStatus::Configured),
            "running" => Some(JobStatus::Running),
            "stopped" => Some(JobStatus::Stopped),
            "terminating" => Some(JobStatus::Terminating),
            "completed" => Some(JobStatus::Completed),
            _ => None,
        }
    }
}

/// The operator-set singleton configuration row.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct JobConfig {
    pub source_root: Option<String>,
    pub output_root: Option<String>,
    /// If set, only these persons are matched (and required, in group mode).
    pub selected_person_ids: Option<Vec<i64>>,
    /// If set, replaces discovery with this explicit list.
    pub selected_image_paths: Option<Vec<String>>,
    pub group_mode: bool,
    pub group_folder_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct JobRow {
    pub job_id: i64,
    pub source_root: String,
    pub output_root: String,
    pub total_images: i64,
    pub processed_images: i64,
}

/// Catalog row for one source image.
#[derive(Debug, Clone)]
pub struct ImageRow {
    pub image_id: i64,
    pub job_id: i64,
    pub source_path: String,
    pub filename: String,
    pub extension: String,
    pub sha256: Option<String>,
    pub ordering_idx: i64,
}

/// Image to be inserted during ingestion (no id yet).
#[derive(Debug, Clone)]
pub struct NewImage {
    pub source_path: String,
    pub filename: String,
    pub extension: String,
    pub sha256: Option<String>,
    pub ordering_idx: i64,
}

#[derive(Debug, Clone)]
pub struct BatchRow {
    pub batch_id: i64,
    pub job_id: i64,
    pub start_idx: i64,
    pub end_idx: i64,
    pub state: BatchState,
}

/// Per-image analysis outcome, keyed by image_id (upsert-on-conflict).
#[derive(Debug, Clone, PartialEq)]
pub struct ImageResult {
    pub image_id: i64,
    pub batch_id: i64,
    pub face_count: i64,
    pub matched_count: i64,
    pub unknown_count: i64,
    pub matched_person_ids: Vec<i64>,
}

/// Audit outcome of one fan-out target, as recorded in the commit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
    Written,
    Skipped,
    Failed,
}

impl CommitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitStatus::Written => "written",
            CommitStatus::Skipped => "skipped",
            CommitStatus::Failed => "failed",
        }
    }
}

/// An ImageResult joined back to its source row, as read by the commit phase.
#[derive(Debug, Clone)]
pub struct CommitCandidate {
    pub image_id: i64,
    pub source_path: String,
    pub filename: String,
    pub sha256: Option<String>,
    pub face_count: i64,
    pub matched_count: i64,
    pub matched_person_ids: Vec<i64>,
}
