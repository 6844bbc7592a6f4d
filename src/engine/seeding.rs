use crate::config::Settings;
use crate::engine::faces::FaceAnalyzer;
use crate::error::{Error, Result};
use crate::registry::model::EmbeddingSource;
use crate::registry::repository as registry;
use crate::storage::HotStorage;
use rusqlite::Connection;
use std::path::Path;

/// Thumbnail box for seeded persons, matching the recognition preview size.
const THUMBNAIL_EDGE: u32 = 256;

fn validate_reference_extension(reference: &Path) -> Result<()> {
    let ok = reference
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let e = e.to_lowercase();
            matches!(e.as_str(), "jpg" | "jpeg" | "png")
        })
        .unwrap_or(false);
    if ok {
        Ok(())
    } else {
        Err(Error::ConfigInvalid(format!(
            "reference portrait {:?} must be JPEG or PNG",
            reference
        )))
    }
}

/// Extract the single face embedding from a reference portrait.
/// Zero faces or more than one face reject the seed.
fn single_face_embedding(analyzer: &dyn FaceAnalyzer, reference: &Path) -> Result<Vec<f32>> {
    let faces = analyzer.detect_and_embed(reference)?;
    if faces.len() != 1 {
        return Err(Error::SeedRejected { found: faces.len() });
    }
    Ok(faces.into_iter().next().expect("one face").embedding)
}

/// Seed a new person from a reference portrait: create the registry row,
/// store the first embedding (which also creates the centroid), and save a
/// thumbnail under `thumbnails/{person_id}.jpg` for the operator UI.
pub fn seed_person(
    conn: &mut Connection,
    analyzer: &dyn FaceAnalyzer,
    storage: &HotStorage,
    settings: &Settings,
    name: &str,
    output_folder_rel: &str,
    reference: &Path,
) -> Result<i64> {
    validate_reference_extension(reference)?;
    let embedding = single_face_embedding(analyzer, reference)?;

    let person_id = registry::create_person(conn, name, output_folder_rel)?;
    registry::add_embedding(
        conn,
        person_id,
        &embedding,
        EmbeddingSource::Reference,
        settings.max_embeddings_per_person,
    )?;

    save_thumbnail(storage, person_id, reference);
    tracing::info!("seeded person {} ({:?})", person_id, name);
    Ok(person_id)
}

/// Append another reference embedding to an existing person. The FIFO cap
/// may evict the oldest stored embedding.
pub fn add_reference(
    conn: &mut Connection,
    analyzer: &dyn FaceAnalyzer,
    settings: &Settings,
    person_id: i64,
    reference: &Path,
) -> Result<i64> {
    validate_reference_extension(reference)?;
    if registry::get_person(conn, person_id)?.is_none() {
        return Err(Error::NotFound(format!("person {}", person_id)));
    }
    let embedding = single_face_embedding(analyzer, reference)?;
    registry::add_embedding(
        conn,
        person_id,
        &embedding,
        EmbeddingSource::Reference,
        settings.max_embeddings_per_person,
    )
}

/// Best-effort thumbnail write; a failure never fails the seed.
fn save_thumbnail(storage: &HotStorage, person_id: i64, reference: &Path) {
    let out_path = storage.thumbnails_dir().join(format!("{}.jpg", person_id));
    let result = (|| -> Result<()> {
        std::fs::create_dir_all(storage.thumbnails_dir())?;
        let img = image::open(reference)?;
        let thumb = img.thumbnail(THUMBNAIL_EDGE, THUMBNAIL_EDGE).to_rgb8();
        thumb.save(&out_path)?;
        Ok(())
    })();
    if let Err(e) = result {
        tracing::warn!("cannot save thumbnail for person {}: {}", person_id, e);
    }
}
