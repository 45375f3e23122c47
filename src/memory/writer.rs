//! Write-behind worker that keeps disk latency off the tick path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

use super::store::EpisodeLog;
use super::Episode;
use crate::errors::StorageError;

enum Command {
    Append(Box<Episode>),
    Flush(Sender<()>),
    Shutdown,
}

/// Single background thread draining appends into an [`EpisodeLog`] in order.
pub struct EpisodeWriter {
    tx: Sender<Command>,
    failed: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl EpisodeWriter {
    pub fn spawn(log: Arc<dyn EpisodeLog>) -> Result<Self, StorageError> {
        let (tx, rx) = mpsc::channel();
        let failed = Arc::new(AtomicU64::new(0));
        let worker_failed = Arc::clone(&failed);
        let handle = std::thread::Builder::new()
            .name("shunollo-episode-writer".into())
            .spawn(move || run(log, rx, worker_failed))
            .map_err(|e| StorageError::Io {
                path: "<episode writer>".into(),
                message: e.to_string(),
            })?;
        Ok(Self {
            tx,
            failed,
            handle: Some(handle),
        })
    }

    pub fn enqueue(&self, episode: Episode) -> Result<(), StorageError> {
        self.tx
            .send(Command::Append(Box::new(episode)))
            .map_err(|_| StorageError::WriterClosed)
    }

    /// Block until every append queued before this call has been attempted.
    pub fn flush(&self) -> Result<(), StorageError> {
        let (ack_tx, ack_rx) = mpsc::channel();
        self.tx
            .send(Command::Flush(ack_tx))
            .map_err(|_| StorageError::WriterClosed)?;
        ack_rx.recv().map_err(|_| StorageError::WriterClosed)
    }

    /// Appends the worker failed to persist.
    pub fn failed_appends(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

impl Drop for EpisodeWriter {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(log: Arc<dyn EpisodeLog>, rx: Receiver<Command>, failed: Arc<AtomicU64>) {
    while let Ok(command) = rx.recv() {
        match command {
            Command::Append(episode) => {
                if let Err(e) = log.append(&episode) {
                    failed.fetch_add(1, Ordering::Relaxed);
                    warn!(episode = %episode.id, error = %e, "Write-behind append failed");
                }
            }
            Command::Flush(ack) => {
                let _ = ack.send(());
            }
            Command::Shutdown => break,
        }
    }
    debug!("Episode writer stopped");
}
