use crate::storage::deterministic_name;
use std::path::{Path, PathBuf};

/// A fan-out destination: one matched person's folder.
#[derive(Debug, Clone)]
pub struct RouteTarget {
    pub person_id: i64,
    pub person_name: String,
    pub folder_rel: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteStatus {
    /// Copied and renamed into place.
    Written,
    /// Destination already present — idempotent no-op.
    AlreadyExists,
    /// This target failed; other targets are unaffected.
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct RouteOutcome {
    /// None for the group-folder variant.
    pub person_id: Option<i64>,
    pub person_name: Option<String>,
    pub output_filename: String,
    pub output_path: PathBuf,
    pub status: RouteStatus,
}

/// Fan a staged artifact out to every matched person's folder.
///
/// Destinations are append-only: an existing file is never rewritten, which
/// is what makes replaying a half-committed batch safe. A failure on one
/// target never aborts the others. The staged file is left in place; the
/// caller deletes it after all fan-outs for the image are done.
pub fn route_image(
    staged: &Path,
    original_stem: &str,
    file_hash: &str,
    targets: &[RouteTarget],
    output_root: &Path,
) -> Vec<RouteOutcome> {
    let output_filename = deterministic_name(original_stem, file_hash);
    targets
        .iter()
        .map(|target| {
            let output_path = output_root
                .join(&target.folder_rel)
                .join(&output_filename);
            let status = copy_append_only(staged, &output_path);
            if let RouteStatus::Failed(reason) = &status {
                tracing::warn!(
                    "route to {:?} for person {} failed: {}",
                    output_path,
                    target.person_id,
                    reason
                );
            }
            RouteOutcome {
                person_id: Some(target.person_id),
                person_name: Some(target.person_name.clone()),
                output_filename: output_filename.clone(),
                output_path,
                status,
            }
        })
        .collect()
}

/// Group-mode variant: one destination under the group folder.
pub fn route_group(
    staged: &Path,
    original_stem: &str,
    file_hash: &str,
    group_folder: &str,
    output_root: &Path,
) -> RouteOutcome {
    let output_filename = deterministic_name(original_stem, file_hash);
    let output_path = output_root.join(group_folder).join(&output_filename);
    let status = copy_append_only(staged, &output_path);
    RouteOutcome {
        person_id: None,
        person_name: None,
        output_filename,
        output_path,
        status,
    }
}

/// Copy `staged` to `dst` unless `dst` exists. Copy goes to `dst.tmp`
/// first, then renames — readers of the output tree never observe a
/// partial file.
fn copy_append_only(staged: &Path, dst: &Path) -> RouteStatus {
    if dst.exists() {
        return RouteStatus::AlreadyExists;
    }
    if let Some(parent) = dst.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            return RouteStatus::Failed(format!("create {:?}: {}", parent, e));
        }
    }
    let tmp = dst.with_extension("tmp");
    if let Err(e) = std::fs::copy(staged, &tmp) {
        let _ = std::fs::remove_file(&tmp);
        return RouteStatus::Failed(format!("copy to {:?}: {}", tmp, e));
    }
    if let Err(e) = std::fs::rename(&tmp, dst) {
        let _ = std::fs::remove_file(&tmp);
        return RouteStatus::Failed(format!("rename to {:?}: {}", dst, e));
    }
    RouteStatus::Written
}

/// Remove a staged artifact after fan-out. Absence is tolerated: a replayed
/// commit may have nothing left to clean.
pub fn cleanup_staged(staged: &Path) {
    if let Err(e) = std::fs::remove_file(staged) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::debug!("cannot remove staged file {:?}: {}", staged, e);
        }
    }
}
