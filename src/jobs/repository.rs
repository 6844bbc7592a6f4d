use crate::error::{Error, Result};
use crate::jobs::model::{
    BatchRow, BatchState, CommitCandidate, CommitStatus, ImageResult, ImageRow, JobConfig,
    JobRow, JobStatus, NewImage,
};
use rusqlite::{params, Connection, OptionalExtension};

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn parse_state(s: &str) -> Result<BatchState> {
    BatchState::parse(s).ok_or_else(|| Error::Internal(format!("unknown batch state {:?}", s)))
}

// ── Job config (singleton row) ────────────────────────────────────────────────

/// Read the operator configuration. A missing row reads as the default
/// (unconfigured) config.
pub fn get_job_config(conn: &Connection) -> Result<JobConfig> {
    let row = conn
        .query_row(
            "SELECT source_root, output_root, selected_person_ids, selected_image_paths,
                    group_mode, group_folder_name
               FROM job_config WHERE id = 1",
            [],
            |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            },
        )
        .optional()?;

    let Some((source_root, output_root, persons_json, images_json, group_mode, group_folder)) = row
    else {
        return Ok(JobConfig::default());
    };

    Ok(JobConfig {
        source_root,
        output_root,
        selected_person_ids: persons_json.as_deref().map(serde_json::from_str).transpose()?,
        selected_image_paths: images_json.as_deref().map(serde_json::from_str).transpose()?,
        group_mode: group_mode != 0,
        group_folder_name: group_folder,
    })
}

/// Persist the operator configuration. Leaves job_status untouched.
pub fn set_job_config(conn: &Connection, config: &JobConfig) -> Result<()> {
    let persons_json = config
        .selected_person_ids
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let images_json = config
        .selected_image_paths
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    conn.execute(
        "INSERT INTO job_config (id, source_root, output_root, selected_person_ids,
                                 selected_image_paths, group_mode, group_folder_name, updated_at)
         VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(id) DO UPDATE SET
             source_root = excluded.source_root,
             output_root = excluded.output_root,
             selected_person_ids = excluded.selected_person_ids,
             selected_image_paths = excluded.selected_image_paths,
             group_mode = excluded.group_mode,
             group_folder_name = excluded.group_folder_name,
             updated_at = excluded.updated_at",
        params![
            config.source_root,
            config.output_root,
            persons_json,
            images_json,
            config.group_mode as i64,
            config.group_folder_name,
            now()
        ],
    )?;
    Ok(())
}

pub fn get_job_status(conn: &Connection) -> Result<JobStatus> {
    let status: Option<String> = conn
        .query_row("SELECT job_status FROM job_config WHERE id = 1", [], |row| {
            row.get(0)
        })
        .optional()?;
    match status {
        Some(s) => JobStatus::parse(&s)
            .ok_or_else(|| Error::Internal(format!("unknown job status {:?}", s))),
        None => Ok(JobStatus::Configured),
    }
}

pub fn set_job_status(conn: &Connection, status: JobStatus) -> Result<()> {
    conn.execute(
        "INSERT INTO job_config (id, job_status, updated_at) VALUES (1, ?1, ?2)
         ON CONFLICT(id) DO UPDATE SET
             job_status = excluded.job_status,
             updated_at = excluded.updated_at",
        params![status.as_str(), now()],
    )?;
    Ok(())
}

// ── Jobs ──────────────────────────────────────────────────────────────────────

pub fn create_job(conn: &Connection, source_root: &str, output_root: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO jobs (source_root, output_root, created_at) VALUES (?1, ?2, ?3)",
        params![source_root, output_root, now()],
    )?;
    Ok(conn.last_insert_rowid())
}

/// The most recent job row, if any. At most one job is active at a time
/// because the worker clears prior rows on a fresh start.
pub fn get_active_job(conn: &Connection) -> Result<Option<JobRow>> {
    let row = conn
        .query_row(
            "SELECT job_id, source_root, output_root, total_images, processed_images
               FROM jobs ORDER BY job_id DESC LIMIT 1",
            [],
            |row| {
                Ok(JobRow {
                    job_id: row.get(0)?,
                    source_root: row.get(1)?,
                    output_root: row.get(2)?,
                    total_images: row.get(3)?,
                    processed_images: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

pub fn update_job_image_counts(
    conn: &Connection,
    job_id: i64,
    total: i64,
    processed: i64,
) -> Result<()> {
    conn.execute(
        "UPDATE jobs SET total_images = ?1, processed_images = ?2, updated_at = ?3
          WHERE job_id = ?4",
        params![total, processed, now(), job_id],
    )?;
    Ok(())
}

/// Delete all rows belonging to prior jobs (commit log, results, batches,
/// images, jobs) so a fresh start begins from a clean catalog. The person
/// registry is untouched.
pub fn clear_job_data(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM commit_log", [])?;
    tx.execute("DELETE FROM image_results", [])?;
    tx.execute("DELETE FROM batches", [])?;
    tx.execute("DELETE FROM images", [])?;
    tx.execute("DELETE FROM jobs", [])?;
    tx.commit()?;
    Ok(())
}

// ── Images ────────────────────────────────────────────────────────────────────

/// Bulk-insert catalog rows. Callers chunk at ≤ 1000 rows; each call is one
/// transaction.
pub fn add_images_batch(conn: &mut Connection, job_id: i64, images: &[NewImage]) -> Result<()> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO images (job_id, source_path, filename, extension, sha256, ordering_idx)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for img in images {
            stmt.execute(params![
                job_id,
                img.source_path,
                img.filename,
                img.extension,
                img.sha256,
                img.ordering_idx
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}

pub fn get_image_count(conn: &Connection, job_id: i64) -> Result<i64> {
    let n = conn.query_row(
        "SELECT COUNT(*) FROM images WHERE job_id = ?1",
        params![job_id],
        |row| row.get(0),
    )?;
    Ok(n)
}

pub fn update_image_hash(conn: &Connection, image_id: i64, sha256: &str) -> Result<()> {
    conn.execute(
        "UPDATE images SET sha256 = ?1 WHERE image_id = ?2",
        params![sha256, image_id],
    )?;
    Ok(())
}

// ── Batches ───────────────────────────────────────────────────────────────────

/// Slice the job's `ordering_idx` range into fixed-size windows, one
/// transaction for the whole cut. The final window may be smaller.
pub fn create_batches(conn: &mut Connection, job_id: i64, batch_size: i64) -> Result<i64> {
    let total = get_image_count(conn, job_id)?;
    let tx = conn.transaction()?;
    let mut count = 0i64;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO batches (job_id, start_idx, end_idx, created_at)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        let mut start = 0i64;
        while start < total {
            let end = (start + batch_size - 1).min(total - 1);
            stmt.execute(params![job_id, start, end, now()])?;
            count += 1;
            start = end + 1;
        }
    }
    tx.commit()?;
    Ok(count)
}

fn batch_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(BatchRow, String)> {
    Ok((
        BatchRow {
            batch_id: row.get(0)?,
            job_id: row.get(1)?,
            start_idx: row.get(2)?,
            end_idx: row.get(3)?,
            state: BatchState::Pending, // overwritten by the caller
        },
        row.get::<_, String>(4)?,
    ))
}

fn collect_batches(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<BatchRow>> {
    let mut stmt = conn.prepare(sql)?;
    let rows: Vec<(BatchRow, String)> = stmt
        .query_map(params, batch_from_row)?
        .collect::<rusqlite::Result<_>>()?;
    rows.into_iter()
        .map(|(mut b, state)| {
            b.state = parse_state(&state)?;
            Ok(b)
        })
        .collect()
}

pub fn get_batch(conn: &Connection, batch_id: i64) -> Result<Option<BatchRow>> {
    let mut found = collect_batches(
        conn,
        "SELECT batch_id, job_id, start_idx, end_idx, state
           FROM batches WHERE batch_id = ?1",
        params![batch_id],
    )?;
    Ok(found.pop())
}

/// Pending batches in ascending batch_id order (the dispatch order).
pub fn get_pending_batches(conn: &Connection, limit: i64) -> Result<Vec<BatchRow>> {
    collect_batches(
        conn,
        "SELECT batch_id, job_id, start_idx, end_idx, state
           FROM batches WHERE state = 'PENDING'
          ORDER BY batch_id ASC LIMIT ?1",
        params![limit],
    )
}

pub fn get_batches_by_state(conn: &Connection, state: BatchState) -> Result<Vec<BatchRow>> {
    collect_batches(
        conn,
        "SELECT batch_id, job_id, start_idx, end_idx, state
           FROM batches WHERE state = ?1
          ORDER BY batch_id ASC",
        params![state.as_str()],
    )
}

/// Transition a batch, enforcing the state machine. Stamps `started_at` on
/// entry to PROCESSING and `committed_at` on entry to COMMITTED.
pub fn update_batch_state(conn: &Connection, batch_id: i64, to: BatchState) -> Result<()> {
    let batch = get_batch(conn, batch_id)?
        .ok_or_else(|| Error::NotFound(format!("batch {}", batch_id)))?;
    if !batch.state.can_transition_to(to) {
        return Err(Error::Internal(format!(
            "batch {}: illegal transition {} -> {}",
            batch_id,
            batch.state.as_str(),
            to.as_str()
        )));
    }
    match to {
        BatchState::Processing => {
            conn.execute(
                "UPDATE batches SET state = ?1, started_at = ?2 WHERE batch_id = ?3",
                params![to.as_str(), now(), batch_id],
            )?;
        }
        BatchState::Committed => {
            conn.execute(
                "UPDATE batches SET state = ?1, committed_at = ?2 WHERE batch_id = ?3",
                params![to.as_str(), now(), batch_id],
            )?;
        }
        _ => {
            conn.execute(
                "UPDATE batches SET state = ?1 WHERE batch_id = ?2",
                params![to.as_str(), batch_id],
            )?;
        }
    }
    Ok(())
}

pub fn get_committed_batch_count(conn: &Connection, job_id: i64) -> Result<i64> {
    let n = conn.query_row(
        "SELECT COUNT(*) FROM batches WHERE job_id = ?1 AND state = 'COMMITTED'",
        params![job_id],
        |row| row.get(0),
    )?;
    Ok(n)
}

/// The images inside a batch's window, in catalog order.
pub fn get_images_for_batch(conn: &Connection, batch_id: i64) -> Result<Vec<ImageRow>> {
    let mut stmt = conn.prepare(
        "SELECT i.image_id, i.job_id, i.source_path, i.filename, i.extension,
                i.sha256, i.ordering_idx
           FROM images i
           JOIN batches b ON b.job_id = i.job_id
          WHERE b.batch_id = ?1
            AND i.ordering_idx BETWEEN b.start_idx AND b.end_idx
          ORDER BY i.ordering_idx ASC",
    )?;
    let rows = stmt.query_map(params![batch_id], |row| {
        Ok(ImageRow {
            image_id: row.get(0)?,
            job_id: row.get(1)?,
            source_path: row.get(2)?,
            filename: row.get(3)?,
            extension: row.get(4)?,
            sha256: row.get(5)?,
            ordering_idx: row.get(6)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

// ── Image results ─────────────────────────────────────────────────────────────

/// Upsert by image_id. Reprocessing an image after a crash overwrites the
/// previous row instead of duplicating it.
pub fn save_image_result(conn: &Connection, result: &ImageResult) -> Result<()> {
    let ids_json = serde_json::to_string(&result.matched_person_ids)?;
    conn.execute(
        "INSERT INTO image_results (image_id, batch_id, face_count, matched_count,
                                    unknown_count, matched_person_ids, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(image_id) DO UPDATE SET
             batch_id = excluded.batch_id,
             face_count = excluded.face_count,
             matched_count = excluded.matched_count,
             unknown_count = excluded.unknown_count,
             matched_person_ids = excluded.matched_person_ids,
             updated_at = excluded.updated_at",
        params![
            result.image_id,
            result.batch_id,
            result.face_count,
            result.matched_count,
            result.unknown_count,
            ids_json,
            now()
        ],
    )?;
    Ok(())
}

pub fn get_image_result(conn: &Connection, image_id: i64) -> Result<Option<ImageResult>> {
    let row = conn
        .query_row(
            "SELECT image_id, batch_id, face_count, matched_count, unknown_count,
                    matched_person_ids
               FROM image_results WHERE image_id = ?1",
            params![image_id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                ))
            },
        )
        .optional()?;
    let Some((image_id, batch_id, face_count, matched_count, unknown_count, ids_json)) = row
    else {
        return Ok(None);
    };
    Ok(Some(ImageResult {
        image_id,
        batch_id,
        face_count,
        matched_count,
        unknown_count,
        matched_person_ids: serde_json::from_str(&ids_json)?,
    }))
}

/// Results for a batch joined back to the source rows, as the commit phase
/// consumes them.
pub fn get_image_results_for_batch(
    conn: &Connection,
    batch_id: i64,
) -> Result<Vec<CommitCandidate>> {
    let mut stmt = conn.prepare(
        "SELECT r.image_id, i.source_path, i.filename, i.sha256,
                r.face_count, r.matched_count, r.matched_person_ids
           FROM image_results r
           JOIN images i ON i.image_id = r.image_id
          WHERE r.batch_id = ?1
          ORDER BY i.ordering_idx ASC",
    )?;
    let rows: Vec<(i64, String, String, Option<String>, i64, i64, String)> = stmt
        .query_map(params![batch_id], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
            ))
        })?
        .collect::<rusqlite::Result<_>>()?;

    rows.into_iter()
        .map(
            |(image_id, source_path, filename, sha256, face_count, matched_count, ids_json)| {
                Ok(CommitCandidate {
                    image_id,
                    source_path,
                    filename,
                    sha256,
                    face_count,
                    matched_count,
                    matched_person_ids: serde_json::from_str(&ids_json)?,
                })
            },
        )
        .collect()
}

// ── Commit log (audit only) ───────────────────────────────────────────────────

pub fn append_commit_entry(
    conn: &Connection,
    batch_id: i64,
    image_id: i64,
    person_id: Option<i64>,
    output_filename: &str,
    output_path: &str,
    status: CommitStatus,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO commit_log (batch_id, image_id, person_id, output_filename,
                                 output_path, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            batch_id,
            image_id,
            person_id,
            output_filename,
            output_path,
            status.as_str(),
            now()
        ],
    )?;
    Ok(conn.last_insert_rowid())
}
