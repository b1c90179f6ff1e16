//! Frame Capture Layer
//!
//! Frames reach the recognizer through [`FrameSource`], which produces one
//! grayscale image at a time. The bundled source watches a directory that an
//! external camera tool writes timestamped images into.

pub mod frame;

use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::CaptureSettings;
pub use frame::{CapturedFrame, FrameConditioner};

/// Decode attempts before a file that keeps failing is given up on
const MAX_DECODE_ATTEMPTS: u32 = 3;

/// Produces one grayscale frame per call
pub trait FrameSource: Send {
    /// Next frame, or `None` once the stream has ended
    fn next_frame(&mut self) -> Result<Option<CapturedFrame>>;
}

/// Reads newly written images from a directory
///
/// In watch mode, files present at startup are ignored and the directory is
/// polled for new ones forever. In once mode, the existing files are read in
/// name order and the stream ends.
pub struct DirectoryFrameSource {
    dir: PathBuf,
    poll_interval: Duration,
    once: bool,
    seen: HashSet<PathBuf>,
    queue: VecDeque<PathBuf>,
    failures: HashMap<PathBuf, u32>,
}

impl DirectoryFrameSource {
    /// Watch `dir` for images written after this call
    pub fn watch(dir: impl Into<PathBuf>, poll_interval: Duration) -> Result<Self> {
        let mut source = Self::with_mode(dir.into(), poll_interval, false);
        let existing = source.scan()?;
        info!(
            "Watching {:?} for frames ({} existing files ignored)",
            source.dir,
            existing.len()
        );
        source.seen.extend(existing);
        Ok(source)
    }

    /// Read the images currently in `dir`, then end
    pub fn once(dir: impl Into<PathBuf>) -> Result<Self> {
        let mut source = Self::with_mode(dir.into(), Duration::ZERO, true);
        let existing = source.scan()?;
        source.seen.extend(existing.iter().cloned());
        source.queue.extend(existing);
        Ok(source)
    }

    /// Build from the `[capture]` settings
    pub fn from_settings(settings: &CaptureSettings, once: bool) -> Result<Self> {
        if once {
            Self::once(&settings.watch_dir)
        } else {
            std::fs::create_dir_all(&settings.watch_dir)
                .with_context(|| format!("Failed to create {:?}", settings.watch_dir))?;
            Self::watch(&settings.watch_dir, Duration::from_millis(settings.poll_interval_ms))
        }
    }

    fn with_mode(dir: PathBuf, poll_interval: Duration, once: bool) -> Self {
        Self {
            dir,
            poll_interval,
            once,
            seen: HashSet::new(),
            queue: VecDeque::new(),
            failures: HashMap::new(),
        }
    }

    /// Unseen image files in name order
    fn scan(&self) -> Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        for entry in std::fs::read_dir(&self.dir).with_context(|| format!("Failed to list {:?}", self.dir))? {
            let path = entry?.path();
            if is_image_file(&path) && !self.seen.contains(&path) {
                found.push(path);
            }
        }
        found.sort();
        Ok(found)
    }

    fn refill(&mut self) -> Result<()> {
        let fresh = self.scan()?;
        if !fresh.is_empty() {
            debug!("Found {} new frames in {:?}", fresh.len(), self.dir);
        }
        self.seen.extend(fresh.iter().cloned());
        self.queue.extend(fresh);
        Ok(())
    }

    /// Decode a queued file; files still being written get retried on a later poll
    fn decode(&mut self, path: PathBuf) -> Option<CapturedFrame> {
        match image::open(&path) {
            Ok(image) => {
                self.failures.remove(&path);
                Some(CapturedFrame::from_file(image.to_luma8(), path))
            }
            Err(e) => {
                let attempts = self.failures.entry(path.clone()).or_insert(0);
                *attempts += 1;
                if self.once || *attempts >= MAX_DECODE_ATTEMPTS {
                    warn!("Skipping unreadable frame {:?}: {}", path, e);
                    self.failures.remove(&path);
                } else {
                    debug!("Frame {:?} not readable yet ({}), retrying", path, e);
                    self.seen.remove(&path);
                }
                None
            }
        }
    }
}

impl FrameSource for DirectoryFrameSource {
    fn next_frame(&mut self) -> Result<Option<CapturedFrame>> {
        loop {
            if let Some(path) = self.queue.pop_front() {
                if let Some(frame) = self.decode(path) {
                    return Ok(Some(frame));
                }
                continue;
            }

            if self.once {
                return Ok(None);
            }

            std::thread::sleep(self.poll_interval);
            self.refill()?;
        }
    }
}

fn is_image_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| matches!(e.to_ascii_lowercase().as_str(), "png" | "jpg" | "jpeg"))
            .unwrap_or(false)
}
