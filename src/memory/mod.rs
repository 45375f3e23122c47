//! Episodic Memory
//!
//! Similarity memory over previously observed fingerprints.
//!
//! Features:
//! - Append-only backing log behind the [`EpisodeLog`] trait
//! - In-memory index guarded by a reader/writer lock (many readers, one writer)
//! - Brute-force k-nearest recall by Euclidean distance
//! - Novelty as distance to the nearest episode
//! - Write-behind for file logs so the tick path never waits on disk
//! - Offline consolidation (see [`consolidation`])

pub mod consolidation;
pub mod store;
pub mod writer;

pub use store::{EpisodeLog, InMemoryEpisodeLog, JsonlEpisodeLog};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::MemoryConfig;
use crate::errors::{InputValidationError, Result, ShunolloError};
use crate::features::{FeatureVector, FEATURE_DIM};
use writer::EpisodeWriter;

/// Novelty reported by an empty memory: the diameter of the unit hypercube
/// in the canonical dimensionality.
pub const MAX_NOVELTY: f64 = 4.0;

/// A remembered fingerprint. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub vector: FeatureVector,
    /// Known-normal exemplar recorded during a baseline phase.
    #[serde(default)]
    pub baseline: bool,
}

impl Episode {
    pub fn new(vector: FeatureVector) -> Self {
        Self {
            id: Uuid::new_v4(),
            recorded_at: Utc::now(),
            vector,
            baseline: false,
        }
    }

    pub fn as_baseline(mut self) -> Self {
        self.baseline = true;
        self
    }

    pub fn with_recorded_at(mut self, recorded_at: DateTime<Utc>) -> Self {
        self.recorded_at = recorded_at;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub episodes: usize,
    pub baseline_episodes: usize,
    /// Corrupt records skipped while opening the log.
    pub skipped_records: usize,
    pub dimension: usize,
    pub write_behind: bool,
    pub failed_appends: u64,
}

enum Sink {
    Direct(Arc<dyn EpisodeLog>),
    WriteBehind(EpisodeWriter),
}

pub struct EpisodicMemory {
    dimension: usize,
    index: RwLock<Vec<Episode>>,
    sink: Sink,
    skipped_records: usize,
}

impl EpisodicMemory {
    /// Empty memory backed by a process-local log.
    pub fn in_memory(dimension: usize) -> Self {
        Self {
            dimension,
            index: RwLock::new(Vec::new()),
            sink: Sink::Direct(Arc::new(InMemoryEpisodeLog::new())),
            skipped_records: 0,
        }
    }

    /// Load every readable record from `log` into the index.
    ///
    /// Corrupt records are logged and skipped. A well-formed record whose
    /// dimension or schema disagrees with `dimension` fails the open.
    pub fn open(log: Arc<dyn EpisodeLog>, dimension: usize, write_behind: bool) -> Result<Self> {
        let mut episodes = Vec::new();
        let mut skipped = 0usize;

        for record in log.iterate()? {
            let episode = match record {
                Ok(ep) => ep,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable episode record");
                    skipped += 1;
                    continue;
                }
            };
            match episode.vector.validate(dimension) {
                Ok(()) => episodes.push(episode),
                Err(
                    e @ (InputValidationError::DimensionMismatch { .. }
                    | InputValidationError::SchemaMismatch { .. }),
                ) => return Err(e.into()),
                Err(e) => {
                    warn!(episode = %episode.id, error = %e, "Skipping invalid episode record");
                    skipped += 1;
                }
            }
        }

        info!(
            episodes = episodes.len(),
            skipped, "Episodic memory loaded"
        );

        let sink = if write_behind {
            Sink::WriteBehind(EpisodeWriter::spawn(log)?)
        } else {
            Sink::Direct(log)
        };

        Ok(Self {
            dimension,
            index: RwLock::new(episodes),
            sink,
            skipped_records: skipped,
        })
    }

    /// Open the memory described by `config`: a JSONL log when a path is set,
    /// otherwise in-process only. File logs are written behind the tick path
    /// unless `write_behind` is turned off.
    pub fn from_config(config: &MemoryConfig) -> Result<Self> {
        match &config.log_path {
            Some(path) => Self::open(
                Arc::new(JsonlEpisodeLog::new(path.clone())),
                config.dimension,
                config.write_behind,
            ),
            None => Ok(Self::in_memory(config.dimension)),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    /// Novelty reported when nothing has been remembered yet.
    pub fn max_novelty(&self) -> f64 {
        if self.dimension == FEATURE_DIM {
            MAX_NOVELTY
        } else {
            (self.dimension as f64).sqrt()
        }
    }

    /// Record `vector` as a new episode.
    ///
    /// The episode is visible to reads that start after this returns. With a
    /// direct sink the log append happens first, so a storage failure leaves
    /// the index untouched.
    pub fn remember(&self, vector: &FeatureVector) -> Result<Episode> {
        vector.validate(self.dimension)?;
        self.record(Episode::new(vector.clone()))
    }

    /// Record `vector` as a known-normal baseline exemplar.
    pub fn remember_baseline(&self, vector: &FeatureVector) -> Result<Episode> {
        vector.validate(self.dimension)?;
        self.record(Episode::new(vector.clone()).as_baseline())
    }

    fn record(&self, episode: Episode) -> Result<Episode> {
        match &self.sink {
            Sink::Direct(log) => log.append(&episode)?,
            Sink::WriteBehind(writer) => writer.enqueue(episode.clone())?,
        }
        self.index.write().push(episode.clone());

        debug!(episode = %episode.id, baseline = episode.baseline, "Remembered episode");
        Ok(episode)
    }

    /// The `k` nearest episodes, ascending by distance.
    pub fn recall_similar(&self, vector: &FeatureVector, k: usize) -> Result<Vec<(Episode, f64)>> {
        self.recall_within(vector, k, f64::INFINITY)
    }

    /// The `k` nearest episodes no farther than `max_distance`, ascending by distance.
    pub fn recall_within(
        &self,
        vector: &FeatureVector,
        k: usize,
        max_distance: f64,
    ) -> Result<Vec<(Episode, f64)>> {
        vector.validate(self.dimension)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let index = self.index.read();
        let mut scored: Vec<(usize, f64)> = index
            .iter()
            .enumerate()
            .map(|(i, ep)| (i, vector.distance(&ep.vector)))
            .filter(|(_, d)| *d <= max_distance)
            .collect();

        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        Ok(scored
            .into_iter()
            .take(k)
            .map(|(i, d)| (index[i].clone(), d))
            .collect())
    }

    /// Distance to the nearest episode, or [`Self::max_novelty`] when empty.
    pub fn novelty(&self, vector: &FeatureVector) -> Result<f64> {
        vector.validate(self.dimension)?;
        let nearest = self
            .index
            .read()
            .iter()
            .map(|ep| vector.distance(&ep.vector))
            .fold(f64::INFINITY, f64::min);
        Ok(if nearest.is_finite() {
            nearest
        } else {
            self.max_novelty()
        })
    }

    /// Drop episodes recorded before `cutoff` from the index. The backing
    /// log is append-only and keeps them.
    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut index = self.index.write();
        let before = index.len();
        index.retain(|ep| ep.recorded_at >= cutoff);
        let pruned = before - index.len();
        if pruned > 0 {
            info!(pruned, remaining = index.len(), "Pruned episodic index");
        }
        pruned
    }

    /// Owned copy of the index in recording order.
    pub fn snapshot(&self) -> Vec<Episode> {
        self.index.read().clone()
    }

    pub fn stats(&self) -> MemoryStats {
        let index = self.index.read();
        MemoryStats {
            episodes: index.len(),
            baseline_episodes: index.iter().filter(|ep| ep.baseline).count(),
            skipped_records: self.skipped_records,
            dimension: self.dimension,
            write_behind: matches!(self.sink, Sink::WriteBehind(_)),
            failed_appends: match &self.sink {
                Sink::WriteBehind(writer) => writer.failed_appends(),
                Sink::Direct(_) => 0,
            },
        }
    }

    /// Wait for queued write-behind appends. A no-op for direct sinks.
    pub fn flush(&self) -> Result<()> {
        match &self.sink {
            Sink::WriteBehind(writer) => writer.flush().map_err(ShunolloError::from),
            Sink::Direct(_) => Ok(()),
        }
    }
}

impl std::fmt::Debug for EpisodicMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpisodicMemory")
            .field("dimension", &self.dimension)
            .field("episodes", &self.len())
            .field("skipped_records", &self.skipped_records)
            .finish()
    }
}
