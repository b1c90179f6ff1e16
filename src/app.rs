//! Inference Coordinator
//!
//! Loads trained weights into a read-only recognizer and runs it over single
//! images or a live frame stream. The capture thread hands a frame over only
//! when the recognizer is idle; anything arriving while it is busy is dropped.

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use crossbeam_channel::{bounded, TryRecvError};
use image::GrayImage;
use ndarray::{Array2, Array3};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

use crate::capture::{CapturedFrame, FrameConditioner, FrameSource};
use crate::config::ModelConfig;
use crate::error::{RecognitionError, Result as RecognitionResult};
use crate::recognition::alphabet::Alphabet;
use crate::recognition::decoder::{GreedyDecoder, SequenceDecoder};
use crate::recognition::model::{default_device, Crnn};
use crate::recognition::preprocess::{load_grayscale, prepare_gray, stack_images};
use crate::storage::weights::load_into;

/// Decoded text of one image plus its raw scores
#[derive(Debug, Clone)]
pub struct Recognition {
    pub text: String,
    /// `(T, A+1)` raw class scores
    pub logits: Array2<f32>,
}

impl Recognition {
    /// Argmax class and its softmax probability for every timestep
    pub fn best_path(&self) -> Vec<(usize, f32)> {
        self.logits
            .rows()
            .into_iter()
            .map(|row| {
                let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let denom: f32 = row.iter().map(|&v| (v - max).exp()).sum();
                let (best, _) = row
                    .iter()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |acc, (i, &v)| if v > acc.1 { (i, v) } else { acc });
                (best, 1.0 / denom)
            })
            .collect()
    }
}

/// CRNN with loaded weights and its decoder
pub struct Recognizer {
    model: Crnn,
    decoder: GreedyDecoder,
    config: ModelConfig,
    device: Device,
}

impl Recognizer {
    /// Load trained weights
    ///
    /// Fails with `ModelLoad` rather than falling back to random parameters.
    pub fn load(weights: &Path, alphabet: Alphabet, config: ModelConfig) -> RecognitionResult<Self> {
        let device = default_device();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = Crnn::new(config, alphabet.num_classes(), vb)?;
        load_into(&varmap, weights, &alphabet, &config)?;

        info!(
            "Loaded recognizer from {:?} ({} classes, T = {})",
            weights,
            alphabet.num_classes(),
            model.timesteps()
        );
        Ok(Self {
            model,
            decoder: GreedyDecoder::new(alphabet),
            config,
            device,
        })
    }

    /// Recognize one preprocessed `(1, H, W)` image
    pub fn recognize(&self, image: &Array3<f32>) -> RecognitionResult<Recognition> {
        let batch = stack_images(std::slice::from_ref(image), &self.device)?;
        let logits = self.model.forward(&batch)?.squeeze(0)?;

        let (steps, classes) = logits.dims2()?;
        let values = logits.flatten_all()?.to_vec1::<f32>()?;
        let logits = Array2::from_shape_vec((steps, classes), values)
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;

        let text = self.decoder.decode(logits.view())?;
        Ok(Recognition { text, logits })
    }

    /// Resize and recognize a grayscale image of any size
    pub fn recognize_gray(&self, image: &GrayImage) -> RecognitionResult<Recognition> {
        self.recognize(&prepare_gray(image, self.config.input_size()))
    }

    /// Recognize an image file; a missing or corrupt file is an `ImageLoad` error
    pub fn recognize_path(&self, path: &Path) -> RecognitionResult<Recognition> {
        let image = load_grayscale(path, self.config.input_size())?;
        self.recognize(&image)
    }
}

/// Outcome of one live frame
#[derive(Debug, Clone)]
pub struct LiveResult {
    pub text: String,
    pub source: Option<PathBuf>,
    /// Capture-to-decode time
    pub latency: Duration,
}

/// Frame counts of a finished live run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveStats {
    pub processed: usize,
    pub dropped: usize,
}

/// Capture, condition, recognize, report; one frame at a time
pub struct LiveLoop {
    recognizer: Recognizer,
    conditioner: FrameConditioner,
    crop_dir: Option<PathBuf>,
}

impl LiveLoop {
    pub fn new(recognizer: Recognizer, conditioner: FrameConditioner) -> Self {
        Self {
            recognizer,
            conditioner,
            crop_dir: None,
        }
    }

    /// Keep every conditioned frame in `dir` as a future labeling sample
    pub fn with_crop_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.crop_dir = dir;
        self
    }

    /// Run until the source ends
    ///
    /// A source or recognition error stops the run and is returned. `on_result` runs on the
    /// recognizer side, so time spent in it counts as busy time.
    pub fn run<S, F>(&self, source: S, on_result: F) -> Result<LiveStats>
    where
        S: FrameSource + 'static,
        F: FnMut(&LiveResult),
    {
        if let Some(dir) = &self.crop_dir {
            std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
        }

        let stats = drive_frames(source, |frame| self.process(frame), on_result)?;
        info!("Live run finished: {} processed, {} dropped", stats.processed, stats.dropped);
        Ok(stats)
    }

    fn process(&self, frame: CapturedFrame) -> Result<LiveResult> {
        let conditioned = self.conditioner.apply(&frame.image);

        if let Some(dir) = &self.crop_dir {
            if let Err(e) = save_crop(dir, &conditioned) {
                warn!("Failed to keep crop in {:?}: {}", dir, e);
            }
        }

        let recognition = self
            .recognizer
            .recognize_gray(&conditioned)
            .map_err(|e| anyhow::Error::new(e).context(format!("Recognition failed for {:?}", frame.source)))?;

        Ok(LiveResult {
            text: recognition.text,
            source: frame.source,
            latency: frame.timestamp.elapsed(),
        })
    }
}

/// Pump frames from a capture thread into `process`, dropping any that arrive
/// while the previous one is still being handled
///
/// A `process` error stops the capture thread before it is returned.
fn drive_frames<S, P, F>(mut source: S, mut process: P, mut on_result: F) -> Result<LiveStats>
where
    S: FrameSource + 'static,
    P: FnMut(CapturedFrame) -> Result<LiveResult>,
    F: FnMut(&LiveResult),
{
    let (idle_tx, idle_rx) = bounded::<()>(1);
    let (frame_tx, frame_rx) = bounded::<CapturedFrame>(1);
    idle_tx
        .send(())
        .map_err(|_| anyhow::anyhow!("recognizer channel closed before start"))?;

    let capture = std::thread::spawn(move || -> Result<usize> {
        let mut dropped = 0;
        while let Some(frame) = source.next_frame()? {
            match idle_rx.try_recv() {
                Ok(()) => {
                    if frame_tx.send(frame).is_err() {
                        break;
                    }
                }
                Err(TryRecvError::Empty) => {
                    dropped += 1;
                    debug!("Recognizer busy, dropped frame {:?}", frame.source);
                }
                Err(TryRecvError::Disconnected) => break,
            }
        }
        Ok(dropped)
    });

    let mut processed = 0;
    let mut failure = None;
    for frame in frame_rx.iter() {
        match process(frame) {
            Ok(result) => {
                processed += 1;
                on_result(&result);
            }
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
        // The capture thread is gone once the source ends
        let _ = idle_tx.send(());
    }

    if let Some(e) = failure {
        // Closing both channels stops the capture thread at its next frame
        drop(frame_rx);
        drop(idle_tx);
        if capture.join().is_err() {
            warn!("Capture thread panicked while stopping");
        }
        return Err(e);
    }

    let dropped = capture
        .join()
        .map_err(|_| anyhow::anyhow!("capture thread panicked"))?
        .context("Frame source failed")?;

    Ok(LiveStats { processed, dropped })
}

fn save_crop(dir: &Path, image: &GrayImage) -> RecognitionResult<PathBuf> {
    let millis = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let path = dir.join(format!("roi_{}.png", millis));
    image
        .save(&path)
        .map_err(|e| RecognitionError::image_load(&path, e))?;
    debug!("Kept crop {:?}", path);
    Ok(path)
}

/// Time a closure, for command-line diagnostics
pub fn timed<T>(f: impl FnOnce() -> T) -> (T, Duration) {
    let started = Instant::now();
    let value = f();
    (value, started.elapsed())
}
