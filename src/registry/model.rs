#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingSource {
    /// Seeded from an operator-supplied reference portrait.
    Reference,
    /// Added by online learning on a strict match.
    Learned,
}

impl EmbeddingSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingSource::Reference => "reference",
            EmbeddingSource::Learned => "learned",
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Person {
    pub person_id: i64,
    pub name: String,
    pub output_folder_rel: String,
    pub created_at: String,
}

/// Person plus embedding count, as listed to the operator surface.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PersonSummary {
    pub person_id: i64,
    pub name: String,
    pub output_folder_rel: String,
    pub created_at: String,
    pub embedding_count: i64,
}

/// One row of the matcher's centroid cache.
#[derive(Debug, Clone)]
pub struct CentroidEntry {
    pub person_id: i64,
    pub name: String,
    pub output_folder_rel: String,
    pub centroid: Vec<f32>,
}

/// Scale a vector to unit L2 length. Zero vectors pass through untouched.
pub fn normalize(v: &[f32]) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter().map(|x| x / norm).collect()
    } else {
        v.to_vec()
    }
}

/// Euclidean distance. On unit vectors this is a monotone function of
/// cosine distance, range 0..2.
pub fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Serialize a vector for BLOB storage. Always normalizes first so every
/// stored embedding and centroid is unit length.
pub fn serialize_embedding(v: &[f32]) -> Vec<u8> {
    normalize(v)
        .iter()
        .flat_map(|x| x.to_le_bytes())
        .collect()
}

pub fn deserialize_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
