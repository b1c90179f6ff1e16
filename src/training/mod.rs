//! Training Loop
//!
//! Fits the CRNN to the labeled samples with CTC loss and AdamW, one strictly
//! sequential update per batch, then persists the weights.

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{ModelConfig, TrainingConfig};
use crate::dataset::batch::{encode_samples, for_each_batch};
use crate::dataset::samples::SampleStore;
use crate::error::RecognitionError;
use crate::recognition::alphabet::Alphabet;
use crate::recognition::ctc::{self, CtcLoss};
use crate::recognition::model::{default_device, Crnn};
use crate::storage::weights::{save_weights, ModelManifest, TrainingSummary};

/// Statistics of one pass over the dataset
#[derive(Debug, Clone)]
pub struct EpochStats {
    /// 1-based epoch number
    pub epoch: usize,
    /// Mean of the per-batch summed losses
    pub mean_loss: f32,
    pub batches: usize,
    pub samples: usize,
    /// Samples dropped because their image could not be loaded
    pub skipped: usize,
    pub elapsed: Duration,
}

/// Outcome of a training run
#[derive(Debug, Clone, Default)]
pub struct TrainingReport {
    pub epochs: Vec<EpochStats>,
    /// Samples that reached the optimizer in the last epoch
    pub samples_used: usize,
    /// Samples excluded for bad labels or unreadable images
    pub samples_skipped: usize,
}

impl TrainingReport {
    pub fn final_loss(&self) -> Option<f32> {
        self.epochs.last().map(|e| e.mean_loss)
    }
}

/// Trains a freshly initialized CRNN
pub struct Trainer {
    alphabet: Alphabet,
    model_config: ModelConfig,
    config: TrainingConfig,
    device: Device,
    loss: CtcLoss,
}

impl Trainer {
    pub fn new(alphabet: Alphabet, model_config: ModelConfig, config: TrainingConfig) -> Self {
        Self {
            alphabet,
            model_config,
            config,
            device: default_device(),
            loss: CtcLoss::default(),
        }
    }

    /// Run all epochs and return the trained parameters
    pub fn train(&self, store: &SampleStore) -> Result<(VarMap, TrainingReport)> {
        self.model_config.validate()?;
        if self.config.batch_size == 0 {
            anyhow::bail!("training.batch_size must be positive");
        }
        if self.config.epochs == 0 {
            anyhow::bail!("training.epochs must be positive");
        }

        let timesteps = self.model_config.timesteps();
        let prepared = encode_samples(store, &self.alphabet, timesteps)
            .with_context(|| format!("Failed to prepare samples from {:?}", store.label_file()))?;
        if prepared.samples.is_empty() {
            return Err(RecognitionError::EmptyDataset(store.label_file().to_path_buf()).into());
        }
        info!(
            "Training on {} samples ({} rejected), {} classes, T = {}",
            prepared.samples.len(),
            prepared.rejected,
            self.alphabet.num_classes(),
            timesteps
        );

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &self.device);
        let model = Crnn::new(self.model_config, self.alphabet.num_classes(), vb)?;

        let params = ParamsAdamW {
            lr: self.config.learning_rate,
            weight_decay: 0.0,
            ..Default::default()
        };
        let mut opt = AdamW::new(varmap.all_vars(), params)?;

        let mut rng = match self.config.shuffle_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut order: Vec<usize> = (0..prepared.samples.len()).collect();
        let mut report = TrainingReport::default();

        for epoch in 1..=self.config.epochs {
            let started = Instant::now();
            order.shuffle(&mut rng);

            let mut total_loss = 0f32;
            let mut batches = 0usize;
            let mut samples = 0usize;

            let skipped = for_each_batch(
                store,
                &prepared.samples,
                &order,
                self.config.batch_size,
                self.config.prefetch_batches,
                |loaded| {
                    let batch = loaded.into_batch(&self.device)?;
                    let logits = model.forward(&batch.images)?;
                    let log_probs = ctc::log_probs(&logits)?;
                    let loss = self.loss.forward_sum(&log_probs, &batch.targets)?;
                    let value = loss.to_scalar::<f32>()?;
                    if !value.is_finite() {
                        return Err(candle_core::Error::Msg(format!(
                            "non-finite loss {} in epoch {}",
                            value, epoch
                        ))
                        .into());
                    }

                    opt.backward_step(&loss)?;

                    total_loss += value;
                    batches += 1;
                    samples += batch.targets.len();
                    debug!("Epoch {} batch {}: loss {:.4}", epoch, batches, value);
                    Ok(())
                },
            )?;

            if batches == 0 {
                return Err(RecognitionError::EmptyDataset(store.label_file().to_path_buf()).into());
            }
            if skipped > 0 {
                warn!("Epoch {}: skipped {} unreadable samples", epoch, skipped);
            }

            let mean_loss = total_loss / batches as f32;
            info!("Epoch {} - loss {:.4}", epoch, mean_loss);

            report.samples_used = samples;
            report.samples_skipped = prepared.rejected + skipped;
            report.epochs.push(EpochStats {
                epoch,
                mean_loss,
                batches,
                samples,
                skipped,
                elapsed: started.elapsed(),
            });
        }

        Ok((varmap, report))
    }

    /// Train and persist the weights to `weights_path`
    pub fn train_and_save(&self, store: &SampleStore, weights_path: &Path) -> Result<(TrainingReport, ModelManifest)> {
        let (varmap, report) = self.train(store)?;

        let summary = TrainingSummary {
            epochs: report.epochs.len(),
            final_loss: report.final_loss(),
        };
        let manifest = save_weights(&varmap, weights_path, &self.alphabet, &self.model_config, summary)
            .with_context(|| format!("Failed to save weights to {:?}", weights_path))?;

        Ok((report, manifest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognition::preprocess::InputSize;
    use image::{GrayImage, Luma};
    use tempfile::tempdir;

    fn tiny_model() -> ModelConfig {
        ModelConfig {
            input_height: 8,
            input_width: 16,
            hidden_size: 4,
        }
    }

    fn tiny_training(epochs: usize) -> TrainingConfig {
        TrainingConfig {
            epochs,
            batch_size: 2,
            learning_rate: 1e-2,
            shuffle_seed: Some(7),
            prefetch_batches: 1,
        }
    }

    /// Writes a bar image per label; a `None` image leaves the file missing
    fn dataset(records: &[(&str, bool)]) -> (tempfile::TempDir, SampleStore) {
        let dir = tempdir().unwrap();
        let mut content = String::new();
        for (i, (label, with_image)) in records.iter().enumerate() {
            let name = format!("crop_{i}.png");
            if *with_image {
                let image = GrayImage::from_fn(16, 8, |x, _| {
                    if (x as usize / 4) % 2 == i % 2 {
                        Luma([230])
                    } else {
                        Luma([20])
                    }
                });
                image.save(dir.path().join(&name)).unwrap();
            }
            content.push_str(&format!("{name},{label}\n"));
        }
        let label_file = dir.path().join("labels.csv");
        std::fs::write(&label_file, content).unwrap();
        let store = SampleStore::new(label_file, dir.path(), InputSize::new(8, 16));
        (dir, store)
    }

    fn ab() -> Alphabet {
        Alphabet::new("AB").unwrap()
    }

    #[test]
    fn test_training_reports_every_epoch() {
        let (_dir, store) = dataset(&[("AB", true), ("BA", true), ("A", true)]);
        let trainer = Trainer::new(ab(), tiny_model(), tiny_training(3));

        let (_, report) = trainer.train(&store).unwrap();
        assert_eq!(report.epochs.len(), 3);
        assert_eq!(report.samples_used, 3);
        assert_eq!(report.samples_skipped, 0);
        for stats in &report.epochs {
            assert_eq!(stats.batches, 2);
            assert!(stats.mean_loss.is_finite());
            assert!(stats.mean_loss >= 0.0);
        }
    }

    #[test]
    fn test_loss_decreases_on_single_sample() {
        let (_dir, store) = dataset(&[("AB", true)]);
        let trainer = Trainer::new(ab(), tiny_model(), tiny_training(40));

        let (_, report) = trainer.train(&store).unwrap();
        let first = report.epochs[0].mean_loss;
        let last = report.final_loss().unwrap();
        assert!(last < first, "loss did not decrease: {first} -> {last}");
    }

    #[test]
    fn test_bad_samples_are_skipped() {
        let (_dir, store) = dataset(&[("AB", true), ("AC", true), ("B", false), ("A", true)]);
        let trainer = Trainer::new(ab(), tiny_model(), tiny_training(1));

        let (_, report) = trainer.train(&store).unwrap();
        assert_eq!(report.samples_used, 2);
        assert_eq!(report.samples_skipped, 2);
        assert_eq!(report.epochs[0].skipped, 1);
    }

    #[test]
    fn test_overlong_label_aborts_before_training() {
        // "AABB" needs 6 frames but T = 4
        let (_dir, store) = dataset(&[("AB", true), ("AABB", true)]);
        let trainer = Trainer::new(ab(), tiny_model(), tiny_training(1));

        let Err(err) = trainer.train(&store) else {
            panic!("training accepted a label longer than the model output");
        };
        assert!(matches!(
            err.downcast_ref::<RecognitionError>(),
            Some(RecognitionError::LabelTooLong { .. })
        ));
    }

    #[test]
    fn test_empty_dataset_is_an_error() {
        let (_dir, store) = dataset(&[("XY", true), ("A", false)]);
        let trainer = Trainer::new(ab(), tiny_model(), tiny_training(1));

        let Err(err) = trainer.train(&store) else {
            panic!("training accepted a dataset without usable samples");
        };
        assert!(matches!(
            err.downcast_ref::<RecognitionError>(),
            Some(RecognitionError::EmptyDataset(_))
        ));
    }

    #[test]
    fn test_train_and_save_writes_weights() {
        let (dir, store) = dataset(&[("AB", true), ("B", true)]);
        let trainer = Trainer::new(ab(), tiny_model(), tiny_training(2));
        let weights = dir.path().join("models").join("crnn.safetensors");

        let (report, manifest) = trainer.train_and_save(&store, &weights).unwrap();
        assert!(weights.exists());
        assert_eq!(manifest.epochs, 2);
        assert_eq!(manifest.num_classes, 3);
        assert_eq!(manifest.final_loss, report.final_loss());
    }

    #[test]
    fn test_zero_batch_size_is_rejected() {
        let (_dir, store) = dataset(&[("AB", true)]);
        let mut config = tiny_training(1);
        config.batch_size = 0;
        assert!(Trainer::new(ab(), tiny_model(), config).train(&store).is_err());
    }

    #[test]
    fn test_zero_epochs_is_rejected() {
        let (dir, store) = dataset(&[("AB", true)]);
        let trainer = Trainer::new(ab(), tiny_model(), tiny_training(0));
        let weights = dir.path().join("crnn.safetensors");

        assert!(trainer.train_and_save(&store, &weights).is_err());
        assert!(!weights.exists());
    }
}
