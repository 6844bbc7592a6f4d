use crate::error::{Error, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// The locked deliverable policy: sRGB-assumed RGB8, long edge capped,
/// quality 85, all metadata stripped.
#[derive(Debug, Clone, Copy)]
pub struct OutputPolicy {
    pub max_long_edge: u32,
    pub quality: u8,
}

impl Default for OutputPolicy {
    fn default() -> Self {
        OutputPolicy {
            max_long_edge: 2048,
            quality: 85,
        }
    }
}

/// Compress a JPEG source to a deliverable JPEG at `dst`.
///
/// EXIF orientation is baked into the pixels before encoding — the output
/// carries no metadata, so a viewer could not rotate it afterwards.
/// The write is atomic: `dst.tmp` then rename.
pub fn compress_jpeg(src: &Path, dst: &Path, policy: &OutputPolicy) -> Result<()> {
    let orientation = read_orientation(src);
    let img = image::open(src).map_err(|e| Error::decode_failed(src, e))?;
    let img = apply_orientation(img, orientation);
    write_deliverable(img, dst, policy)
}

/// Encode an already-decoded image under the locked policy. Shared by the
/// JPEG and raw delivery paths.
pub fn write_deliverable(img: DynamicImage, dst: &Path, policy: &OutputPolicy) -> Result<()> {
    let img = resize_to_max_edge(img, policy.max_long_edge);
    // Force RGB8: drops alpha/palette/16-bit representations.
    let rgb = img.to_rgb8();

    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(dst);
    let file = std::fs::File::create(&tmp)
        .map_err(|e| Error::write_failed(&tmp, e))?;
    let mut writer = BufWriter::new(file);
    let encoded = JpegEncoder::new_with_quality(&mut writer, policy.quality).encode_image(&rgb);
    if let Err(e) = encoded {
        drop(writer);
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    writer
        .flush()
        .map_err(|e| Error::write_failed(&tmp, e))?;
    drop(writer);
    // Atomic on the same volume.
    std::fs::rename(&tmp, dst).map_err(|e| Error::write_failed(dst, e))?;
    Ok(())
}

pub(crate) fn tmp_path(dst: &Path) -> PathBuf {
    dst.with_extension("tmp")
}

/// Scale so the long edge is at most `max_long_edge`; aspect preserved,
/// smaller images untouched. Lanczos for the downscale.
fn resize_to_max_edge(img: DynamicImage, max_long_edge: u32) -> DynamicImage {
    let (w, h) = (img.width(), img.height());
    let long_edge = w.max(h);
    if long_edge <= max_long_edge {
        return img;
    }
    let scale = max_long_edge as f64 / long_edge as f64;
    let nw = ((w as f64 * scale) as u32).max(1);
    let nh = ((h as f64 * scale) as u32).max(1);
    img.resize_exact(nw, nh, FilterType::Lanczos3)
}

/// EXIF orientation of a source image, if it carries one.
fn read_orientation(path: &Path) -> Option<u16> {
    let file = std::fs::File::open(path).ok()?;
    let mut reader = std::io::BufReader::new(file);
    let exif = exif::Reader::new().read_from_container(&mut reader).ok()?;
    let field = exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)?;
    match &field.value {
        exif::Value::Short(v) => v.first().copied(),
        _ => None,
    }
}

fn apply_orientation(img: DynamicImage, orientation: Option<u16>) -> DynamicImage {
    match orientation {
        Some(3) => img.rotate180(),
        Some(6) => img.rotate90(),
        Some(8) => img.rotate270(),
        Some(o) if matches!(o, 2 | 4 | 5 | 7) => {
            tracing::debug!("orientation {} (mirror) not applied", o);
            img
        }
        _ => img, // 1 or None: no rotation needed
    }
}
