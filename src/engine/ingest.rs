use crate::error::{Error, Result};
use crate::jobs::model::NewImage;
use crate::jobs::repository as jobs;
use crate::storage::stream_hash;
use rusqlite::Connection;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Extensions accepted from the source tree (case-insensitive).
const SUPPORTED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "arw"];

/// Catalog rows are inserted in chunks of this many per transaction.
const INSERT_CHUNK: usize = 1000;

pub fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let e = e.to_lowercase();
            SUPPORTED_EXTENSIONS.contains(&e.as_str())
        })
        .unwrap_or(false)
}

pub fn is_raw(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("arw"))
        .unwrap_or(false)
}

/// Recursively discover supported images under `source_root`.
///
/// Symlinks are skipped; unreadable directories are logged and skipped.
/// Paths are resolved, deduplicated and sorted lexicographically so the
/// resulting order (and therefore `ordering_idx`) is identical across runs
/// and platforms. Returns (paths, error log).
pub fn discover_images(source_root: &Path) -> (Vec<PathBuf>, Vec<String>) {
    let mut found: BTreeSet<PathBuf> = BTreeSet::new();
    let mut errors = Vec::new();

    for entry in WalkDir::new(source_root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !e.path_is_symlink())
    {
        match entry {
            Err(e) => {
                let msg = format!("discovery error: {}", e);
                tracing::warn!("{}", msg);
                errors.push(msg);
            }
            Ok(entry) => {
                if !entry.file_type().is_file() {
                    continue;
                }
                if !is_supported(entry.path()) {
                    continue;
                }
                let resolved = entry
                    .path()
                    .canonicalize()
                    .unwrap_or_else(|_| entry.path().to_path_buf());
                found.insert(resolved);
            }
        }
    }

    tracing::debug!(
        "discover_images {:?}: {} files, {} errors",
        source_root,
        found.len(),
        errors.len()
    );
    (found.into_iter().collect(), errors)
}

/// Validate an explicit image selection. Every entry must exist, be a
/// regular file with a supported extension, and live under `source_root`.
/// The validated list replaces discovery wholesale.
pub fn resolve_selection(source_root: &Path, selection: &[String]) -> Result<Vec<PathBuf>> {
    let root = source_root
        .canonicalize()
        .map_err(|e| Error::ConfigInvalid(format!("source root {:?}: {}", source_root, e)))?;

    let mut resolved: BTreeSet<PathBuf> = BTreeSet::new();
    for raw in selection {
        let path = PathBuf::from(raw);
        let canonical = path
            .canonicalize()
            .map_err(|_| Error::ConfigInvalid(format!("selected image {:?} does not exist", raw)))?;
        if !canonical.is_file() {
            return Err(Error::ConfigInvalid(format!(
                "selected image {:?} is not a regular file",
                raw
            )));
        }
        if !canonical.starts_with(&root) {
            return Err(Error::ConfigInvalid(format!(
                "selected image {:?} is outside the source root",
                raw
            )));
        }
        if !is_supported(&canonical) {
            return Err(Error::ConfigInvalid(format!(
                "selected image {:?} has an unsupported extension",
                raw
            )));
        }
        resolved.insert(canonical);
    }
    Ok(resolved.into_iter().collect())
}

#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub job_id: i64,
    pub image_count: i64,
    pub batch_count: i64,
}

/// Catalog the source tree and cut batches. Called once at job start.
///
/// Hashing at ingest is optional and off by default — a full pre-read of
/// external media doubles startup I/O, so hashes are normally back-filled
/// during analysis.
pub fn run_ingestion(
    conn: &mut Connection,
    source_root: &Path,
    output_root: &Path,
    selected_image_paths: Option<&[String]>,
    batch_size: i64,
    compute_hashes: bool,
) -> Result<IngestOutcome> {
    let paths = match selected_image_paths {
        Some(selection) => resolve_selection(source_root, selection)?,
        None => discover_images(source_root).0,
    };

    let job_id = jobs::create_job(
        conn,
        &source_root.to_string_lossy(),
        &output_root.to_string_lossy(),
    )?;

    let mut pending: Vec<NewImage> = Vec::with_capacity(INSERT_CHUNK);
    for (idx, path) in paths.iter().enumerate() {
        let sha256 = if compute_hashes {
            match stream_hash(path) {
                Ok(h) => Some(h),
                Err(e) => {
                    tracing::warn!("cannot hash {:?}: {}", path, e);
                    None
                }
            }
        } else {
            None
        };
        pending.push(NewImage {
            source_path: path.to_string_lossy().into_owned(),
            filename: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            extension: path
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
                .unwrap_or_default(),
            sha256,
            ordering_idx: idx as i64,
        });
        if pending.len() >= INSERT_CHUNK {
            jobs::add_images_batch(conn, job_id, &pending)?;
            pending.clear();
        }
    }
    if !pending.is_empty() {
        jobs::add_images_batch(conn, job_id, &pending)?;
    }

    let image_count = jobs::get_image_count(conn, job_id)?;
    jobs::update_job_image_counts(conn, job_id, image_count, 0)?;
    let batch_count = jobs::create_batches(conn, job_id, batch_size)?;

    tracing::info!(
        "ingestion complete: job={} images={} batches={}",
        job_id,
        image_count,
        batch_count
    );

    Ok(IngestOutcome {
        job_id,
        image_count,
        batch_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{open_in_memory, run_migrations};
    use std::fs;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let p = dir.join(name);
        fs::write(&p, b"x").unwrap();
        p
    }

    #[test]
    fn test_discover_filters_extensions_case_insensitive() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "a.jpg");
        touch(tmp.path(), "b.JPEG");
        touch(tmp.path(), "c.ARW");
        touch(tmp.path(), "d.png");
        touch(tmp.path(), "e.txt");

        let (paths, errors) = discover_images(tmp.path());
        assert!(errors.is_empty());
        let names: Vec<_> = paths
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a.jpg", "b.JPEG", "c.ARW"]);
    }

    #[test]
    fn test_discover_is_recursive_and_sorted() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("z/deep")).unwrap();
        fs::create_dir_all(tmp.path().join("a")).unwrap();
        touch(&tmp.path().join("z/deep"), "3.jpg");
        touch(&tmp.path().join("a"), "2.jpg");
        touch(tmp.path(), "1.jpg");

        let (paths, _) = discover_images(tmp.path());
        assert_eq!(paths.len(), 3);
        let mut sorted = paths.clone();
        sorted.sort();
        assert_eq!(paths, sorted, "discovery order must be lexicographic");
    }

    #[test]
    fn test_discover_deterministic_across_runs() {
        let tmp = TempDir::new().unwrap();
        for name in ["b.jpg", "a.jpg", "c.arw", "d.jpeg"] {
            touch(tmp.path(), name);
        }
        let (first, _) = discover_images(tmp.path());
        let (second, _) = discover_images(tmp.path());
        assert_eq!(first, second, "repeated discovery must yield identical sequences");
    }

    #[test]
    #[cfg(unix)]
    fn test_discover_skips_symlinks() {
        let tmp = TempDir::new().unwrap();
        let real = touch(tmp.path(), "real.jpg");
        let link = tmp.path().join("link.jpg");
        if std::os::unix::fs::symlink(&real, &link).is_ok() {
            let (paths, _) = discover_images(tmp.path());
            assert_eq!(paths.len(), 1);
        }
    }

    #[test]
    fn test_selection_replaces_discovery_with_validation() {
        let tmp = TempDir::new().unwrap();
        let kept = touch(tmp.path(), "keep.jpg");
        touch(tmp.path(), "ignored.jpg");

        let selection = vec![kept.to_string_lossy().into_owned()];
        let resolved = resolve_selection(tmp.path(), &selection).unwrap();
        assert_eq!(resolved.len(), 1);
        assert!(resolved[0].ends_with("keep.jpg"));
    }

    #[test]
    fn test_selection_rejects_missing_outside_and_unsupported() {
        let tmp = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let foreign = touch(outside.path(), "foreign.jpg");
        let text = touch(tmp.path(), "notes.txt");

        let missing = vec![tmp.path().join("ghost.jpg").to_string_lossy().into_owned()];
        assert!(matches!(
            resolve_selection(tmp.path(), &missing),
            Err(Error::ConfigInvalid(_))
        ));

        let outside_sel = vec![foreign.to_string_lossy().into_owned()];
        assert!(matches!(
            resolve_selection(tmp.path(), &outside_sel),
            Err(Error::ConfigInvalid(_))
        ));

        let unsupported = vec![text.to_string_lossy().into_owned()];
        assert!(matches!(
            resolve_selection(tmp.path(), &unsupported),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_run_ingestion_catalogs_and_slices() {
        let tmp = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        for i in 0..7 {
            touch(tmp.path(), &format!("img_{}.jpg", i));
        }
        let conn = open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        let mut conn = conn;

        let outcome =
            run_ingestion(&mut conn, tmp.path(), out.path(), None, 3, false).unwrap();
        assert_eq!(outcome.image_count, 7);
        assert_eq!(outcome.batch_count, 3); // 3 + 3 + 1

        // ordering_idx is dense and monotone
        let mut stmt = conn
            .prepare("SELECT ordering_idx FROM images ORDER BY ordering_idx")
            .unwrap();
        let idxs: Vec<i64> = stmt
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(idxs, (0..7).collect::<Vec<i64>>());
    }

    #[test]
    fn test_run_ingestion_with_hashing() {
        let tmp = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        touch(tmp.path(), "a.jpg");
        let conn = open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        let mut conn = conn;

        run_ingestion(&mut conn, tmp.path(), out.path(), None, 50, true).unwrap();
        let hash: Option<String> = conn
            .query_row("SELECT sha256 FROM images", [], |r| r.get(0))
            .unwrap();
        let hash = hash.expect("hash must be populated when compute_hashes is on");
        assert_eq!(hash.len(), 64);
    }
}
