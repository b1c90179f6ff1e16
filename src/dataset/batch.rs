//! Batches for training
//!
//! Images are stacked into a `(batch, 1, H, W)` tensor; labels stay a list of
//! unpadded index sequences. Image loading for upcoming batches runs on a
//! background thread while the current batch trains; batches still arrive in
//! order.

use candle_core::{Device, Tensor};
use crossbeam_channel::bounded;
use ndarray::Array3;
use tracing::{debug, warn};

use super::samples::{Sample, SampleStore};
use crate::error::Result;
use crate::recognition::alphabet::Alphabet;
use crate::recognition::ctc::check_target_fits;
use crate::recognition::preprocess::stack_images;

/// A sample with its label already encoded
#[derive(Debug, Clone)]
pub struct EncodedSample {
    pub sample: Sample,
    pub target: Vec<u32>,
}

/// Encoded samples ready for training
#[derive(Debug, Clone, Default)]
pub struct PreparedSamples {
    pub samples: Vec<EncodedSample>,
    /// Records rejected for out-of-alphabet characters
    pub rejected: usize,
}

/// Encode every label of the store
///
/// Out-of-alphabet labels exclude their sample with a warning. A label that
/// cannot be aligned to `timesteps` frames aborts with `LabelTooLong`.
pub fn encode_samples(store: &SampleStore, alphabet: &Alphabet, timesteps: usize) -> Result<PreparedSamples> {
    let mut prepared = PreparedSamples::default();

    for sample in store.samples()? {
        let sample = sample?;
        let target = match alphabet.encode(&sample.label) {
            Ok(target) => target,
            Err(e) if e.is_recoverable() => {
                warn!("Skipping {:?} (line {}): {}", sample.image_path, sample.line, e);
                prepared.rejected += 1;
                continue;
            }
            Err(e) => return Err(e),
        };

        if let Err(e) = check_target_fits(&target, timesteps) {
            warn!(
                "Label {:?} of {:?} (line {}) does not fit the model output",
                sample.label, sample.image_path, sample.line
            );
            return Err(e);
        }

        prepared.samples.push(EncodedSample { sample, target });
    }

    debug!(
        "Encoded {} samples ({} rejected)",
        prepared.samples.len(),
        prepared.rejected
    );
    Ok(prepared)
}

/// Images and targets of one batch, before tensor construction
#[derive(Debug)]
pub struct LoadedBatch {
    pub images: Vec<Array3<f32>>,
    pub targets: Vec<Vec<u32>>,
    /// Samples dropped because their image could not be loaded
    pub skipped: usize,
}

impl LoadedBatch {
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Stack into a training batch on `device`
    pub fn into_batch(self, device: &Device) -> Result<Batch> {
        let images = stack_images(&self.images, device)?;
        Ok(Batch {
            images,
            targets: self.targets,
        })
    }
}

/// A training batch
#[derive(Debug)]
pub struct Batch {
    /// `(batch, 1, H, W)` in [0, 1]
    pub images: Tensor,
    /// Unpadded class-index sequences, one per image
    pub targets: Vec<Vec<u32>>,
}

/// Load the images of one batch; unreadable images are skipped, other errors abort
fn load_batch(store: &SampleStore, samples: &[EncodedSample], indices: &[usize]) -> Result<LoadedBatch> {
    let mut batch = LoadedBatch {
        images: Vec::with_capacity(indices.len()),
        targets: Vec::with_capacity(indices.len()),
        skipped: 0,
    };

    for &i in indices {
        let encoded = &samples[i];
        match store.load_image(&encoded.sample) {
            Ok(image) => {
                batch.images.push(image);
                batch.targets.push(encoded.target.clone());
            }
            Err(e) if e.is_recoverable() => {
                warn!("Skipping sample at line {}: {}", encoded.sample.line, e);
                batch.skipped += 1;
            }
            Err(e) => return Err(e),
        }
    }

    Ok(batch)
}

/// Feed batches of `samples` in `order` to `consume`, loading ahead
///
/// At most `prefetch` loaded batches wait in the channel. Returns the number
/// of samples skipped for unreadable images. An error from `consume` or a
/// non-recoverable load error stops loading and is returned.
pub fn for_each_batch<F>(
    store: &SampleStore,
    samples: &[EncodedSample],
    order: &[usize],
    batch_size: usize,
    prefetch: usize,
    mut consume: F,
) -> Result<usize>
where
    F: FnMut(LoadedBatch) -> Result<()>,
{
    if batch_size == 0 {
        return Err(candle_core::Error::Msg("batch size must be positive".to_string()).into());
    }

    let (tx, rx) = bounded::<Result<LoadedBatch>>(prefetch);

    std::thread::scope(|scope| {
        scope.spawn(move || {
            for indices in order.chunks(batch_size) {
                let batch = load_batch(store, samples, indices);
                let failed = batch.is_err();
                if tx.send(batch).is_err() {
                    debug!("Batch consumer stopped; ending prefetch");
                    break;
                }
                if failed {
                    break;
                }
            }
        });

        let mut skipped = 0;
        let mut outcome: Result<()> = Ok(());
        for batch in rx.iter() {
            let batch = match batch {
                Ok(batch) => batch,
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            };
            skipped += batch.skipped;
            if batch.is_empty() {
                continue;
            }
            if let Err(e) = consume(batch) {
                outcome = Err(e);
                break;
            }
        }
        drop(rx);

        outcome.map(|_| skipped)
    })
}
