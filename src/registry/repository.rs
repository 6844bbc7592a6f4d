use crate::error::{Error, Result};
use crate::registry::model::{
    deserialize_embedding, normalize, serialize_embedding, CentroidEntry, EmbeddingSource, Person,
    PersonSummary,
};
use crate::storage::is_valid_folder_segment;
use rusqlite::{params, Connection, OptionalExtension, Transaction};

/// Create a person. The output folder must be a single safe path segment;
/// uniqueness is enforced by the schema.
pub fn create_person(conn: &Connection, name: &str, output_folder_rel: &str) -> Result<i64> {
    if !is_valid_folder_segment(output_folder_rel) {
        return Err(Error::ConfigInvalid(format!(
            "output folder {:?} is not a single safe path segment",
            output_folder_rel
        )));
    }
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO persons (name, output_folder_rel, created_at) VALUES (?1, ?2, ?3)",
        params![name, output_folder_rel, now],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Delete a person. Embeddings and the centroid go with it (FK cascade).
/// Returns whether a row was actually removed.
pub fn delete_person(conn: &Connection, person_id: i64) -> Result<bool> {
    let n = conn.execute(
        "DELETE FROM persons WHERE person_id = ?1",
        params![person_id],
    )?;
    Ok(n > 0)
}

pub fn get_person(conn: &Connection, person_id: i64) -> Result<Option<Person>> {
    let row = conn
        .query_row(
            "SELECT person_id, name, output_folder_rel, created_at
               FROM persons WHERE person_id = ?1",
            params![person_id],
            |row| {
                Ok(Person {
                    person_id: row.get(0)?,
                    name: row.get(1)?,
                    output_folder_rel: row.get(2)?,
                    created_at: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// All persons with their embedding counts, ordered by name.
pub fn get_all_persons(conn: &Connection) -> Result<Vec<PersonSummary>> {
    let mut stmt = conn.prepare(
        "SELECT p.person_id, p.name, p.output_folder_rel, p.created_at,
                COUNT(pe.embedding_id)
           FROM persons p
           LEFT JOIN person_embeddings pe ON pe.person_id = p.person_id
          GROUP BY p.person_id
          ORDER BY p.name",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(PersonSummary {
            person_id: row.get(0)?,
            name: row.get(1)?,
            output_folder_rel: row.get(2)?,
            created_at: row.get(3)?,
            embedding_count: row.get(4)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

/// Append an embedding to a person, evict the oldest rows past `max_embeddings`,
/// and recompute the centroid — all in one transaction, so no partial state
/// (embedding without centroid, stale count) is ever observable.
pub fn add_embedding(
    conn: &mut Connection,
    person_id: i64,
    embedding: &[f32],
    source: EmbeddingSource,
    max_embeddings: usize,
) -> Result<i64> {
    let tx = conn.transaction()?;

    let now = chrono::Utc::now().to_rfc3339();
    tx.execute(
        "INSERT INTO person_embeddings (person_id, embedding, source_type, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            person_id,
            serialize_embedding(embedding),
            source.as_str(),
            now
        ],
    )?;
    let embedding_id = tx.last_insert_rowid();

    let count: i64 = tx.query_row(
        "SELECT COUNT(*) FROM person_embeddings WHERE person_id = ?1",
        params![person_id],
        |row| row.get(0),
    )?;
    if count > max_embeddings as i64 {
        // FIFO: drop the oldest; embedding_id breaks same-timestamp ties.
        let excess = count - max_embeddings as i64;
        tx.execute(
            "DELETE FROM person_embeddings
              WHERE embedding_id IN (
                    SELECT embedding_id FROM person_embeddings
                     WHERE person_id = ?1
                     ORDER BY created_at ASC, embedding_id ASC
                     LIMIT ?2)",
            params![person_id, excess],
        )?;
    }

    update_centroid(&tx, person_id)?;
    tx.commit()?;
    Ok(embedding_id)
}

/// Recompute `centroid = normalize(mean(embeddings))` from the surviving
/// rows. Runs inside the caller's transaction. No embeddings ⇒ no centroid
/// row.
fn update_centroid(tx: &Transaction<'_>, person_id: i64) -> Result<()> {
    let mut stmt =
        tx.prepare("SELECT embedding FROM person_embeddings WHERE person_id = ?1")?;
    let vectors: Vec<Vec<f32>> = stmt
        .query_map(params![person_id], |row| {
            let blob: Vec<u8> = row.get(0)?;
            Ok(deserialize_embedding(&blob))
        })?
        .collect::<rusqlite::Result<_>>()?;
    drop(stmt);

    if vectors.is_empty() {
        tx.execute(
            "DELETE FROM person_centroids WHERE person_id = ?1",
            params![person_id],
        )?;
        return Ok(());
    }

    let dim = vectors[0].len();
    let mut mean = vec![0.0f32; dim];
    for v in &vectors {
        for (m, x) in mean.iter_mut().zip(v.iter()) {
            *m += x;
        }
    }
    let n = vectors.len() as f32;
    for m in mean.iter_mut() {
        *m /= n;
    }
    // The mean of unit vectors is not unit length; re-normalize.
    let centroid = normalize(&mean);

    let now = chrono::Utc::now().to_rfc3339();
    tx.execute(
        "INSERT INTO person_centroids (person_id, centroid, embedding_count, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(person_id) DO UPDATE SET
             centroid = excluded.centroid,
             embedding_count = excluded.embedding_count,
             updated_at = excluded.updated_at",
        params![
            person_id,
            serialize_embedding(&centroid),
            vectors.len() as i64,
            now
        ],
    )?;
    Ok(())
}

/// Every person that has a centroid, ordered by person_id for deterministic
/// iteration in the matcher.
pub fn get_all_centroids(conn: &Connection) -> Result<Vec<CentroidEntry>> {
    let mut stmt = conn.prepare(
        "SELECT p.person_id, p.name, p.output_folder_rel, pc.centroid
           FROM persons p
           INNER JOIN person_centroids pc ON pc.person_id = p.person_id
          ORDER BY p.person_id",
    )?;
    let rows = stmt.query_map([], |row| {
        let blob: Vec<u8> = row.get(3)?;
        Ok(CentroidEntry {
            person_id: row.get(0)?,
            name: row.get(1)?,
            output_folder_rel: row.get(2)?,
            centroid: deserialize_embedding(&blob),
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

/// A person's embeddings in insertion order.
pub fn get_person_embeddings(conn: &Connection, person_id: i64) -> Result<Vec<Vec<f32>>> {
    let mut stmt = conn.prepare(
        "SELECT embedding FROM person_embeddings
          WHERE person_id = ?1
          ORDER BY created_at ASC, embedding_id ASC",
    )?;
    let rows = stmt.query_map(params![person_id], |row| {
        let blob: Vec<u8> = row.get(0)?;
        Ok(deserialize_embedding(&blob))
    })?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}
