//! Media probing with a modification-time keyed descriptor cache.
//!
//! Probing shells out to ffprobe, so results are cached per (path, mtime);
//! a hit never touches the inspector. Concurrent first probes of the same
//! path are single-flighted so the inspector runs once and every waiter
//! shares the winner's descriptor.

mod ffprobe;
mod types;

pub use types::{AudioStream, MediaDescriptor, VideoStream};

use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::OnceCell;

/// Errors surfaced by the prober.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProbeError {
    /// The file cannot be opened or stat'ed.
    #[error("unreadable media file: {}", path.display())]
    Unreadable { path: PathBuf },

    /// No container/codec information could be extracted.
    #[error("unrecognized media format: {}", path.display())]
    UnrecognizedFormat { path: PathBuf },
}

#[derive(Debug, Clone)]
struct CacheSlot {
    mtime: SystemTime,
    descriptor: Arc<MediaDescriptor>,
}

/// Prober with a shared descriptor cache.
pub struct MediaProber {
    ffprobe_bin: PathBuf,
    timeout: Duration,
    cache: DashMap<PathBuf, Arc<OnceCell<CacheSlot>>>,
}

impl MediaProber {
    pub fn new(ffprobe_bin: PathBuf, timeout: Duration) -> Self {
        Self {
            ffprobe_bin,
            timeout,
            cache: DashMap::new(),
        }
    }

    /// Probe a media file, returning the cached descriptor when the file is
    /// unchanged since the last inspection.
    pub async fn probe(&self, path: &Path) -> Result<Arc<MediaDescriptor>, ProbeError> {
        let unreadable = || ProbeError::Unreadable {
            path: path.to_path_buf(),
        };

        let meta = tokio::fs::metadata(path).await.map_err(|_| unreadable())?;
        if !meta.is_file() {
            return Err(unreadable());
        }
        let mtime = meta.modified().map_err(|_| unreadable())?;

        loop {
            let cell = self
                .cache
                .entry(path.to_path_buf())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone();

            // A populated cell is either a hit or a stale entry to replace.
            if let Some(slot) = cell.get() {
                if slot.mtime == mtime {
                    tracing::debug!("Probe cache hit: {:?}", path);
                    return Ok(slot.descriptor.clone());
                }
                tracing::debug!("Probe cache stale (mtime changed): {:?}", path);
                self.cache
                    .remove_if(path, |_, existing| Arc::ptr_eq(existing, &cell));
                continue;
            }

            // Single-flight: the first caller runs ffprobe, waiters share the
            // result. The cell only ever holds a complete slot.
            let slot = cell
                .get_or_try_init(|| async {
                    let descriptor =
                        ffprobe::probe_with_ffprobe(&self.ffprobe_bin, path, self.timeout)
                            .await?;
                    Ok::<_, ProbeError>(CacheSlot {
                        mtime,
                        descriptor: Arc::new(descriptor),
                    })
                })
                .await?;

            if slot.mtime == mtime {
                return Ok(slot.descriptor.clone());
            }
            // Lost a race against a probe keyed to an older mtime.
            self.cache
                .remove_if(path, |_, existing| Arc::ptr_eq(existing, &cell));
        }
    }

    /// Number of cached descriptors.
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}
