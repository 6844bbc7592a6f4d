use crate::config::Settings;
use crate::error::Result;
use crate::registry::model::{euclidean, normalize, CentroidEntry, EmbeddingSource};
use crate::registry::repository as registry;
use rusqlite::Connection;
use std::collections::{BTreeSet, HashSet};

/// Outcome of resolving one embedding against the registry.
///
/// Distances are Euclidean on unit vectors (range 0..2). The strict band
/// feeds online learning so the centroid drifts toward the subject's
/// appearance in this event; the loose band widens recall without letting
/// noisy faces corrupt the centroid.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    /// High confidence — match and learn.
    Strict { person_id: i64, distance: f32 },
    /// Moderate confidence — match only.
    Loose { person_id: i64, distance: f32 },
    /// No person within the loose band.
    Unknown { distance: f32 },
}

impl MatchOutcome {
    pub fn matched_person(&self) -> Option<i64> {
        match self {
            MatchOutcome::Strict { person_id, .. } | MatchOutcome::Loose { person_id, .. } => {
                Some(*person_id)
            }
            MatchOutcome::Unknown { .. } => None,
        }
    }

    pub fn distance(&self) -> f32 {
        match self {
            MatchOutcome::Strict { distance, .. }
            | MatchOutcome::Loose { distance, .. }
            | MatchOutcome::Unknown { distance } => *distance,
        }
    }
}

/// Nearest-centroid identity resolver with dual thresholds and online
/// learning. The centroid cache is refreshed lazily and after every
/// learning event; callers on the coordinator thread therefore always
/// match against the freshest registry state.
pub struct Matcher {
    threshold_strict: f32,
    threshold_loose: f32,
    max_embeddings: usize,
    selected: Option<HashSet<i64>>,
    cache: Option<Vec<CentroidEntry>>,
    dirty: bool,
}

impl Matcher {
    pub fn new(settings: &Settings, selected_person_ids: Option<&[i64]>) -> Matcher {
        Matcher {
            threshold_strict: settings.threshold_strict,
            threshold_loose: settings.threshold_loose,
            max_embeddings: settings.max_embeddings_per_person,
            selected: selected_person_ids.map(|ids| ids.iter().copied().collect()),
            cache: None,
            dirty: true,
        }
    }

    /// Reload centroids from the registry, applying the person filter.
    pub fn refresh(&mut self, conn: &Connection) -> Result<()> {
        let mut centroids = registry::get_all_centroids(conn)?;
        if let Some(selected) = &self.selected {
            centroids.retain(|c| selected.contains(&c.person_id));
        }
        tracing::debug!("matcher cache: {} person(s)", centroids.len());
        self.cache = Some(centroids);
        self.dirty = false;
        Ok(())
    }

    fn ensure_fresh(&mut self, conn: &Connection) -> Result<()> {
        if self.cache.is_none() || self.dirty {
            self.refresh(conn)?;
        }
        Ok(())
    }

    /// Number of persons currently matchable (after filtering).
    pub fn person_count(&mut self, conn: &Connection) -> Result<usize> {
        self.ensure_fresh(conn)?;
        Ok(self.cache.as_ref().map(|c| c.len()).unwrap_or(0))
    }

    /// Resolve one embedding. With `learn`, a strict match appends the
    /// embedding to the person (FIFO + centroid refresh happen in the
    /// registry transaction) and invalidates the cache.
    pub fn match_embedding(
        &mut self,
        conn: &mut Connection,
        embedding: &[f32],
        learn: bool,
    ) -> Result<MatchOutcome> {
        self.ensure_fresh(conn)?;
        let cache = self.cache.as_ref().expect("cache populated by ensure_fresh");
        if cache.is_empty() {
            return Ok(MatchOutcome::Unknown {
                distance: f32::INFINITY,
            });
        }

        let probe = normalize(embedding);
        // Argmin distance; ties break toward the smallest person_id. The
        // cache is ordered by person_id, so strict `<` keeps the first.
        let mut best: Option<(f32, i64)> = None;
        for entry in cache {
            let d = euclidean(&probe, &entry.centroid);
            match best {
                Some((bd, _)) if d >= bd => {}
                _ => best = Some((d, entry.person_id)),
            }
        }
        let (distance, person_id) = best.expect("non-empty cache");

        if distance <= self.threshold_strict {
            if learn {
                registry::add_embedding(
                    conn,
                    person_id,
                    embedding,
                    EmbeddingSource::Learned,
                    self.max_embeddings,
                )?;
                self.dirty = true;
            }
            Ok(MatchOutcome::Strict {
                person_id,
                distance,
            })
        } else if distance <= self.threshold_loose {
            Ok(MatchOutcome::Loose {
                person_id,
                distance,
            })
        } else {
            Ok(MatchOutcome::Unknown { distance })
        }
    }

    /// Match every face of one image with learning on. Returns the deduped
    /// (sorted) matched person ids and the unknown count.
    pub fn match_image_faces(
        &mut self,
        conn: &mut Connection,
        embeddings: &[Vec<f32>],
    ) -> Result<(Vec<i64>, i64)> {
        let mut matched: BTreeSet<i64> = BTreeSet::new();
        let mut unknown = 0i64;
        for embedding in embeddings {
            match self.match_embedding(conn, embedding, true)? {
                outcome @ (MatchOutcome::Strict { .. } | MatchOutcome::Loose { .. }) => {
                    matched.insert(outcome.matched_person().expect("matched outcome"));
                }
                MatchOutcome::Unknown { .. } => unknown += 1,
            }
        }
        Ok((matched.into_iter().collect(), unknown))
    }
}

/// Group-mode gate: the image is kept only when every required person was
/// matched; otherwise its matches are cleared so nothing is routed.
pub fn apply_group_mode(matched: Vec<i64>, required: &[i64]) -> Vec<i64> {
    let matched_set: HashSet<i64> = matched.iter().copied().collect();
    if !required.is_empty() && required.iter().all(|id| matched_set.contains(id)) {
        matched
    } else {
        Vec::new()
    }
}
