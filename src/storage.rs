use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};

/// Layout of the hot-storage root (internal fast volume).
///
/// Everything the engine writes during a run except the deliverables lives
/// here: the catalog, state snapshots, the staging area and raw-decode
/// scratch space. The source and output trees stay on external media.
#[derive(Debug, Clone)]
pub struct HotStorage {
    root: PathBuf,
}

impl HotStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        HotStorage { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join("registry.db")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.root.join("temp")
    }

    pub fn thumbnails_dir(&self) -> PathBuf {
        self.root.join("thumbnails")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.root.join("models")
    }

    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.state_dir())?;
        std::fs::create_dir_all(self.staging_dir())?;
        std::fs::create_dir_all(self.temp_dir())?;
        std::fs::create_dir_all(self.thumbnails_dir())?;
        std::fs::create_dir_all(self.models_dir())?;
        Ok(())
    }
}

/// SHA-256 of a file, streamed in 64 KiB reads. Equal bytes ⇒ equal hash.
pub fn stream_hash(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 65536];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Deterministic output filename: `{stem}__{hash[:12]}.jpg`.
///
/// The 12-hex prefix gives ~48 bits of collision resistance per stem;
/// identical source bytes always map to the same name, which is what makes
/// the commit fan-out idempotent.
pub fn deterministic_name(stem: &str, hash: &str) -> String {
    let prefix: String = hash.chars().take(12).collect();
    format!("{}__{}.jpg", stem, prefix)
}

/// Whether `name` is usable as a single output folder segment on all
/// target filesystems: non-empty, no separators or drive/NUL characters,
/// and not a dot entry.
pub fn is_valid_folder_segment(name: &str) -> bool {
    if name.is_empty() || name == "." || name == ".." {
        return false;
    }
    !name
        .chars()
        .any(|c| matches!(c, '/' | '\\' | ':' | '\0' | '*' | '?' | '"' | '<' | '>' | '|'))
}
