use crate::error::Result;
use std::path::Path;

/// One detected face: a fixed-dimension identity embedding plus where it
/// was found.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub embedding: Vec<f32>,
    /// `[x1, y1, x2, y2]` in pixel coordinates.
    pub bbox: [f32; 4],
    pub confidence: f32,
}

/// Seam to the external face model. Implementations load the pretrained
/// detector/embedder once and keep it for the life of the process; the
/// engine owns a shared handle and never constructs models itself.
///
/// Called from the analysis worker pool, hence `Send + Sync`.
pub trait FaceAnalyzer: Send + Sync {
    /// Detect all faces in the image at `image_path` and return one
    /// embedding per face. Raw files are never passed here; the engine
    /// hands over a decoded JPEG instead.
    fn detect_and_embed(&self, image_path: &Path) -> Result<Vec<DetectedFace>>;
}
