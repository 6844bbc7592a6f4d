use std::path::PathBuf;

/// How aggressively the CPU-bound analysis pool may use the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuUsageMode {
    Low,
    Balanced,
    High,
    Adaptive,
    Custom,
}

impl CpuUsageMode {
    /// Parse the `CPU_USAGE_MODE` value. Unknown strings fall back to Adaptive.
    pub fn parse(s: &str) -> CpuUsageMode {
        match s.to_ascii_lowercase().as_str() {
            "low" => CpuUsageMode::Low,
            "balanced" => CpuUsageMode::Balanced,
            "high" => CpuUsageMode::High,
            "adaptive" => CpuUsageMode::Adaptive,
            "custom" => CpuUsageMode::Custom,
            other => {
                tracing::warn!("unknown CPU_USAGE_MODE {:?}, using adaptive", other);
                CpuUsageMode::Adaptive
            }
        }
    }
}

/// Runtime settings. Defaults match the locked processing policy;
/// environment variables override the machine-dependent knobs.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Internal fast volume holding the catalog, state files, staging and scratch.
    pub hot_storage_root: PathBuf,

    /// Euclidean distance on unit vectors: match + learn below this.
    pub threshold_strict: f32,
    /// Match only (no learning) below this; unknown above.
    pub threshold_loose: f32,

    /// FIFO cap on stored embeddings per person.
    pub max_embeddings_per_person: usize,

    /// Images per atomic batch (the crash boundary).
    pub atomic_batch_size: i64,
    /// Terminate is polled between chunks of this many images.
    pub terminate_chunk: usize,

    /// Output JPEG policy.
    pub output_max_long_edge: u32,
    pub output_jpeg_quality: u8,

    pub cpu_usage_mode: CpuUsageMode,
    /// Only consulted when `cpu_usage_mode` is Custom.
    pub max_parallel_workers: Option<usize>,
    pub enable_parallel_processing: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            hot_storage_root: default_hot_storage_root(),
            threshold_strict: 0.80,
            threshold_loose: 1.00,
            max_embeddings_per_person: 30,
            atomic_batch_size: 50,
            terminate_chunk: 10,
            output_max_long_edge: 2048,
            output_jpeg_quality: 85,
            cpu_usage_mode: CpuUsageMode::Adaptive,
            max_parallel_workers: None,
            enable_parallel_processing: true,
        }
    }
}

fn default_hot_storage_root() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".facesort"))
        .unwrap_or_else(|| PathBuf::from("hot_storage"))
}

impl Settings {
    /// Load settings from the environment on top of the defaults.
    pub fn from_env() -> Settings {
        let mut s = Settings::default();
        if let Ok(root) = std::env::var("HOT_STORAGE_ROOT") {
            if !root.is_empty() {
                s.hot_storage_root = PathBuf::from(root);
            }
        }
        if let Ok(mode) = std::env::var("CPU_USAGE_MODE") {
            s.cpu_usage_mode = CpuUsageMode::parse(&mode);
        }
        if let Ok(n) = std::env::var("MAX_PARALLEL_WORKERS") {
            s.max_parallel_workers = n.parse().ok();
        }
        if let Ok(v) = std::env::var("ENABLE_PARALLEL_PROCESSING") {
            s.enable_parallel_processing = !matches!(v.as_str(), "0" | "false" | "no");
        }
        s
    }

    /// Size of the CPU-bound worker pool, clamped to `[1, available cores]`.
    pub fn worker_count(&self) -> usize {
        if !self.enable_parallel_processing {
            return 1;
        }
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let wanted = match self.cpu_usage_mode {
            CpuUsageMode::Low => cores / 4,
            CpuUsageMode::Balanced => cores / 2,
            CpuUsageMode::High => cores,
            // Leave headroom for the coordinator and heartbeat threads.
            CpuUsageMode::Adaptive => cores.saturating_sub(2),
            CpuUsageMode::Custom => self.max_parallel_workers.unwrap_or(cores),
        };
        wanted.clamp(1, cores)
    }
}
