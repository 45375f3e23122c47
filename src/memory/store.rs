//! Episode Backing Store
//!
//! Append-only storage for episodes. The JSONL log writes one envelope per
//! line carrying the SHA-256 of the serialized episode, so torn writes and
//! bit rot are detected on read and skipped by the caller.

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::Episode;
use crate::errors::StorageError;

/// Boxed iterator over stored episodes; each item fails independently.
pub type EpisodeIter<'a> = Box<dyn Iterator<Item = Result<Episode, StorageError>> + Send + 'a>;

/// Backing store for episodic memory.
pub trait EpisodeLog: Send + Sync {
    fn append(&self, episode: &Episode) -> Result<(), StorageError>;

    /// Every stored record in append order. A missing store yields nothing.
    fn iterate(&self) -> Result<EpisodeIter<'_>, StorageError>;
}

const ENVELOPE_PREFIX: &str = "{\"sha256\":\"";
const ENVELOPE_SEPARATOR: &str = "\",\"episode\":";
const DIGEST_HEX_LEN: usize = 64;

/// JSON-lines episode log on the local filesystem.
pub struct JsonlEpisodeLog {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl JsonlEpisodeLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_for_append(&self) -> Result<File, StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io_error(e))?;

        // A torn final record must not swallow the next append.
        if ends_mid_record(&mut file).map_err(|e| self.io_error(e))? {
            file.write_all(b"\n").map_err(|e| self.io_error(e))?;
        }
        Ok(file)
    }

    fn io_error(&self, e: std::io::Error) -> StorageError {
        StorageError::Io {
            path: self.path.clone(),
            message: e.to_string(),
        }
    }
}

impl EpisodeLog for JsonlEpisodeLog {
    fn append(&self, episode: &Episode) -> Result<(), StorageError> {
        let line = encode_record(episode)?;
        let mut guard = self.file.lock();
        if guard.is_none() {
            *guard = Some(self.open_for_append()?);
        }
        if let Some(file) = guard.as_mut() {
            writeln!(file, "{}", line).map_err(|e| self.io_error(e))?;
            file.flush().map_err(|e| self.io_error(e))?;
        }
        Ok(())
    }

    fn iterate(&self) -> Result<EpisodeIter<'_>, StorageError> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Box::new(std::iter::empty()));
            }
            Err(e) => return Err(self.io_error(e)),
        };

        let records = BufReader::new(file)
            .lines()
            .enumerate()
            .filter_map(|(i, line)| {
                let line_no = i + 1;
                match line {
                    Ok(l) if l.trim().is_empty() => None,
                    Ok(l) => Some(decode_record(&l, line_no)),
                    Err(e) => Some(Err(StorageError::CorruptRecord {
                        line: line_no,
                        reason: e.to_string(),
                    })),
                }
            });
        Ok(Box::new(records))
    }
}

/// Process-local log, used for ephemeral agents and tests.
#[derive(Default)]
pub struct InMemoryEpisodeLog {
    episodes: Mutex<Vec<Episode>>,
}

impl InMemoryEpisodeLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.episodes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.episodes.lock().is_empty()
    }
}

impl EpisodeLog for InMemoryEpisodeLog {
    fn append(&self, episode: &Episode) -> Result<(), StorageError> {
        self.episodes.lock().push(episode.clone());
        Ok(())
    }

    fn iterate(&self) -> Result<EpisodeIter<'_>, StorageError> {
        let snapshot = self.episodes.lock().clone();
        Ok(Box::new(snapshot.into_iter().map(Ok)))
    }
}

/// Serialize an episode into its checksummed envelope line.
pub fn encode_record(episode: &Episode) -> Result<String, StorageError> {
    let payload =
        serde_json::to_string(episode).map_err(|e| StorageError::Serialize(e.to_string()))?;
    let digest = hex::encode(Sha256::digest(payload.as_bytes()));
    Ok(format!(
        "{ENVELOPE_PREFIX}{digest}{ENVELOPE_SEPARATOR}{payload}}}"
    ))
}

/// Parse one envelope line, verifying the checksum over the exact payload bytes.
pub fn decode_record(line: &str, line_no: usize) -> Result<Episode, StorageError> {
    let corrupt = |reason: &str| StorageError::CorruptRecord {
        line: line_no,
        reason: reason.to_string(),
    };

    let rest = line
        .trim_end()
        .strip_prefix(ENVELOPE_PREFIX)
        .ok_or_else(|| corrupt("missing envelope header"))?;
    if rest.len() < DIGEST_HEX_LEN || !rest.is_char_boundary(DIGEST_HEX_LEN) {
        return Err(corrupt("truncated checksum"));
    }
    let (digest, rest) = rest.split_at(DIGEST_HEX_LEN);
    let payload = rest
        .strip_prefix(ENVELOPE_SEPARATOR)
        .and_then(|p| p.strip_suffix('}'))
        .ok_or_else(|| corrupt("malformed envelope"))?;

    let actual = hex::encode(Sha256::digest(payload.as_bytes()));
    if actual != digest {
        return Err(corrupt("checksum mismatch"));
    }

    serde_json::from_str(payload).map_err(|e| StorageError::CorruptRecord {
        line: line_no,
        reason: e.to_string(),
    })
}

fn ends_mid_record(file: &mut File) -> std::io::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}
