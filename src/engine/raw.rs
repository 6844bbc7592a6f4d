use crate::engine::compress::{write_deliverable, OutputPolicy};
use crate::error::{Error, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use std::io::{BufWriter, Write};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};

/// Quality for recognition scratch JPEGs. The scratch file only feeds the
/// detector, so it trades a little fidelity for speed.
const RECOGNITION_QUALITY: u8 = 90;

/// Decode a camera-raw file to an RGB image.
///
/// rawler may panic on malformed or unknown raw containers; the guard turns
/// that into a `DecodeFailed` like any other unreadable source.
pub fn decode_raw(path: &Path) -> Result<DynamicImage> {
    match std::panic::catch_unwind(AssertUnwindSafe(|| decode_raw_inner(path))) {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!("panic while decoding raw {:?}", path);
            Err(Error::decode_failed(path, "panic in raw decoder"))
        }
    }
}

fn decode_raw_inner(path: &Path) -> Result<DynamicImage> {
    let raw = rawler::decode_file(path)
        .map_err(|e| Error::decode_failed(path, format!("{:?}", e)))?;
    let developer = rawler::imgop::develop::RawDevelop::default();
    let developed = developer
        .develop_intermediate(&raw)
        .map_err(|e| Error::decode_failed(path, format!("{:?}", e)))?;
    developed
        .to_dynamic_image()
        .ok_or_else(|| Error::decode_failed(path, "develop produced no image"))
}

/// Decode a raw file to a uniquely-named scratch JPEG under `temp_dir` for
/// the recognition pass. The caller must delete the returned file after
/// face analysis, whether or not detection succeeded.
pub fn convert_for_recognition(
    raw_path: &Path,
    temp_dir: &Path,
    max_long_edge: u32,
) -> Result<PathBuf> {
    std::fs::create_dir_all(temp_dir)?;
    let token = uuid::Uuid::new_v4().simple().to_string();
    let temp_path = temp_dir.join(format!("raw_temp_{}.jpg", &token[..12]));

    let img = decode_raw(raw_path)?;
    let img = shrink_for_recognition(img, max_long_edge);
    let rgb = img.to_rgb8();

    let file = std::fs::File::create(&temp_path)
        .map_err(|e| Error::write_failed(&temp_path, e))?;
    let mut writer = BufWriter::new(file);
    let encoded = JpegEncoder::new_with_quality(&mut writer, RECOGNITION_QUALITY).encode_image(&rgb);
    if let Err(e) = encoded {
        drop(writer);
        let _ = std::fs::remove_file(&temp_path);
        return Err(e.into());
    }
    writer
        .flush()
        .map_err(|e| Error::write_failed(&temp_path, e))?;
    Ok(temp_path)
}

/// Decode a raw file and write the deliverable JPEG under the locked output
/// policy. This is a second, independent decode — the recognition scratch
/// and the deliverable are separate artifacts.
pub fn convert_for_delivery(raw_path: &Path, dst: &Path, policy: &OutputPolicy) -> Result<()> {
    let img = decode_raw(raw_path)?;
    write_deliverable(img, dst, policy)
}

fn shrink_for_recognition(img: DynamicImage, max_long_edge: u32) -> DynamicImage {
    let long_edge = img.width().max(img.height());
    if long_edge <= max_long_edge {
        return img;
    }
    // Triangle is plenty for a detector input and much faster than Lanczos.
    img.resize(max_long_edge, max_long_edge, FilterType::Triangle)
}

/// Delete a scratch file, tolerating absence.
pub fn cleanup_temp_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::debug!("cannot remove temp file {:?}: {}", path, e);
        }
    }
}
