//! Connectionist Temporal Classification loss
//!
//! Computes -log p(target | input) by summing over every frame alignment that
//! collapses to the target under the greedy decode rule. The recursion runs in
//! log space over the blank-extended label `l' = [b, l1, b, l2, ..., lL, b]`:
//!
//! ```text
//! alpha_t(s) = lse(alpha_{t-1}(s), alpha_{t-1}(s-1), [alpha_{t-1}(s-2)]) + log y_t(l'_s)
//! ```
//!
//! where the `s-2` transition is only allowed onto a non-blank symbol that
//! differs from `l'_{s-2}`. Everything is expressed as candle tensor ops so
//! gradients flow back into the log-probabilities.

use candle_core::{IndexOp, Tensor, D};

use super::alphabet::BLANK;
use crate::error::{RecognitionError, Result};

/// Finite stand-in for log(0); keeps masked states out of NaN territory.
const LOG_ZERO: f32 = -1.0e30;

/// Minimum number of frames a CTC alignment of `target` needs
///
/// Every character takes one frame and every pair of equal neighbours needs a
/// blank frame between them.
pub fn min_timesteps(target: &[u32]) -> usize {
    let repeats = target.windows(2).filter(|pair| pair[0] == pair[1]).count();
    target.len() + repeats
}

/// Reject targets that cannot be aligned to `available` frames
pub fn check_target_fits(target: &[u32], available: usize) -> Result<()> {
    let required = min_timesteps(target);
    if required > available {
        return Err(RecognitionError::LabelTooLong {
            length: target.len(),
            required,
            available,
        });
    }
    Ok(())
}

/// CTC loss with a fixed input length (every sample uses all T frames)
#[derive(Debug, Clone, Copy)]
pub struct CtcLoss {
    blank: u32,
}

impl Default for CtcLoss {
    fn default() -> Self {
        Self { blank: BLANK }
    }
}

impl CtcLoss {
    /// Per-sample negative log-likelihood
    ///
    /// `log_probs` is `(batch, T, classes)` after `log_softmax`; `targets`
    /// holds one unpadded index sequence per sample. Returns a `(batch,)`
    /// tensor.
    pub fn forward(&self, log_probs: &Tensor, targets: &[Vec<u32>]) -> Result<Tensor> {
        let (batch, steps, classes) = log_probs.dims3()?;
        if targets.len() != batch {
            return Err(candle_core::Error::Msg(format!(
                "{} targets for a batch of {}",
                targets.len(),
                batch
            ))
            .into());
        }

        for target in targets {
            for &idx in target {
                if idx == self.blank || idx as usize >= classes {
                    return Err(RecognitionError::OutOfRange {
                        index: idx as usize,
                        max: classes - 1,
                    });
                }
            }
            check_target_fits(target, steps)?;
        }

        let max_len = targets.iter().map(Vec::len).max().unwrap_or(0).max(1);
        let states = 2 * max_len + 1;
        let plan = ExtendedLabels::build(targets, states, self.blank);
        let device = log_probs.device();

        let ext = Tensor::from_vec(plan.labels, (batch, states), device)?;
        let skip = Tensor::from_vec(plan.skip_mask, (batch, states), device)?;
        let init = Tensor::from_vec(plan.init_mask, (batch, states), device)?;
        let end = Tensor::from_vec(plan.end_mask, (batch, states), device)?;

        // (batch, T, states): log y_t(l'_s)
        let index = ext.unsqueeze(1)?.broadcast_as((batch, steps, states))?.contiguous()?;
        let emissions = log_probs.contiguous()?.gather(&index, 2)?;

        let pad1 = Tensor::full(LOG_ZERO, (batch, 1), device)?;
        let pad2 = Tensor::full(LOG_ZERO, (batch, 2), device)?;

        let mut alpha = (emissions.i((.., 0, ..))? + &init)?;
        for t in 1..steps {
            let stay = alpha.clone();
            let step = Tensor::cat(&[&pad1, &alpha.narrow(1, 0, states - 1)?], 1)?;
            let skip_from = Tensor::cat(&[&pad2, &alpha.narrow(1, 0, states - 2)?], 1)?;
            let skip_from = (skip_from + &skip)?;

            let merged = log_sum_exp(&Tensor::stack(&[&stay, &step, &skip_from], 2)?, 2)?;
            alpha = (merged + emissions.i((.., t, ..))?)?;
        }

        let log_likelihood = log_sum_exp(&(alpha + &end)?, 1)?;
        Ok(log_likelihood.neg()?)
    }

    /// Batch loss summed over samples
    pub fn forward_sum(&self, log_probs: &Tensor, targets: &[Vec<u32>]) -> Result<Tensor> {
        Ok(self.forward(log_probs, targets)?.sum_all()?)
    }
}

/// Numerically stable log-sum-exp that removes `dim`
fn log_sum_exp(x: &Tensor, dim: usize) -> candle_core::Result<Tensor> {
    let max = x.max_keepdim(dim)?.detach();
    x.broadcast_sub(&max)?
        .exp()?
        .sum_keepdim(dim)?
        .log()?
        .broadcast_add(&max)?
        .squeeze(dim)
}

/// Host-side description of the blank-extended labels and transition masks
struct ExtendedLabels {
    labels: Vec<u32>,
    skip_mask: Vec<f32>,
    init_mask: Vec<f32>,
    end_mask: Vec<f32>,
}

impl ExtendedLabels {
    fn build(targets: &[Vec<u32>], states: usize, blank: u32) -> Self {
        let total = targets.len() * states;
        let mut labels = vec![blank; total];
        let mut skip_mask = vec![LOG_ZERO; total];
        let mut init_mask = vec![LOG_ZERO; total];
        let mut end_mask = vec![LOG_ZERO; total];

        for (b, target) in targets.iter().enumerate() {
            let row = b * states;
            for (i, &c) in target.iter().enumerate() {
                labels[row + 2 * i + 1] = c;
            }

            for s in 2..states {
                let here = labels[row + s];
                if here != blank && here != labels[row + s - 2] {
                    skip_mask[row + s] = 0.0;
                }
            }

            init_mask[row] = 0.0;
            if !target.is_empty() {
                init_mask[row + 1] = 0.0;
            }

            let last_blank = 2 * target.len();
            end_mask[row + last_blank] = 0.0;
            if last_blank > 0 {
                end_mask[row + last_blank - 1] = 0.0;
            }
        }

        Self {
            labels,
            skip_mask,
            init_mask,
            end_mask,
        }
    }
}

/// Convert raw logits `(batch, T, classes)` to log-probabilities
pub fn log_probs(logits: &Tensor) -> Result<Tensor> {
    Ok(candle_nn::ops::log_softmax(logits, D::Minus1)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};

    /// Uniform log-probabilities over `classes`
    fn uniform(batch: usize, steps: usize, classes: usize) -> Tensor {
        let value = -(classes as f32).ln();
        Tensor::full(value, (batch, steps, classes), &Device::Cpu).unwrap()
    }

    fn scalar_losses(t: &Tensor) -> Vec<f32> {
        t.to_vec1::<f32>().unwrap()
    }

    #[test]
    fn test_min_timesteps_counts_repeats() {
        assert_eq!(min_timesteps(&[]), 0);
        assert_eq!(min_timesteps(&[1, 2, 3]), 3);
        assert_eq!(min_timesteps(&[1, 1]), 3);
        assert_eq!(min_timesteps(&[4, 4, 4, 2]), 6);
    }

    #[test]
    fn test_single_frame_single_label() {
        let loss = CtcLoss::default().forward(&uniform(1, 1, 2), &[vec![1]]).unwrap();
        let expected = 2f32.ln();
        assert!((scalar_losses(&loss)[0] - expected).abs() < 1e-5);
    }

    #[test]
    fn test_two_frames_single_label() {
        // alignments of "1" over two frames: 11, 01, 10
        let loss = CtcLoss::default().forward(&uniform(1, 2, 2), &[vec![1]]).unwrap();
        let expected = -(0.75f32).ln();
        assert!((scalar_losses(&loss)[0] - expected).abs() < 1e-5);
    }

    #[test]
    fn test_empty_target_only_blank_path() {
        let loss = CtcLoss::default().forward(&uniform(1, 2, 2), &[vec![]]).unwrap();
        let expected = 4f32.ln();
        assert!((scalar_losses(&loss)[0] - expected).abs() < 1e-5);
    }

    #[test]
    fn test_repeated_label_needs_blank() {
        // "11" over three frames has exactly one alignment: 1 0 1
        let loss = CtcLoss::default().forward(&uniform(1, 3, 2), &[vec![1, 1]]).unwrap();
        let expected = 8f32.ln();
        assert!((scalar_losses(&loss)[0] - expected).abs() < 1e-4);
    }

    #[test]
    fn test_batch_matches_individual_losses() {
        let device = Device::Cpu;
        let logits = Tensor::randn(0f32, 1.0, (3, 6, 4), &device).unwrap();
        let lp = log_probs(&logits).unwrap();
        let targets = vec![vec![1, 2], vec![3], vec![2, 2, 1]];

        let ctc = CtcLoss::default();
        let batch = scalar_losses(&ctc.forward(&lp, &targets).unwrap());

        for (i, target) in targets.iter().enumerate() {
            let single = lp.narrow(0, i, 1).unwrap();
            let alone = scalar_losses(&ctc.forward(&single, &[target.clone()]).unwrap());
            assert!((batch[i] - alone[0]).abs() < 1e-4);
        }

        let summed: f32 = ctc.forward_sum(&lp, &targets).unwrap().to_scalar().unwrap();
        assert!((summed - batch.iter().sum::<f32>()).abs() < 1e-3);
    }

    #[test]
    fn test_loss_is_finite_and_non_negative() {
        let device = Device::Cpu;
        let logits = Tensor::randn(0f32, 3.0, (4, 10, 6), &device).unwrap();
        let lp = log_probs(&logits).unwrap();
        let targets = vec![vec![1, 2, 3, 4, 5], vec![5, 5, 5], vec![], vec![2; 5]];

        for loss in scalar_losses(&CtcLoss::default().forward(&lp, &targets).unwrap()) {
            assert!(loss.is_finite());
            assert!(loss >= -1e-4);
        }
    }

    #[test]
    fn test_overlong_label_is_rejected() {
        let ctc = CtcLoss::default();
        let err = ctc.forward(&uniform(1, 2, 3), &[vec![1, 1]]).unwrap_err();
        assert!(matches!(
            err,
            RecognitionError::LabelTooLong {
                length: 2,
                required: 3,
                available: 2
            }
        ));

        let err = ctc.forward(&uniform(1, 2, 3), &[vec![1, 2, 1]]).unwrap_err();
        assert!(matches!(err, RecognitionError::LabelTooLong { .. }));
    }

    #[test]
    fn test_blank_or_unknown_class_in_target_is_rejected() {
        let ctc = CtcLoss::default();
        assert!(matches!(
            ctc.forward(&uniform(1, 4, 3), &[vec![1, 0]]),
            Err(RecognitionError::OutOfRange { .. })
        ));
        assert!(matches!(
            ctc.forward(&uniform(1, 4, 3), &[vec![3]]),
            Err(RecognitionError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_gradients_reach_logits() {
        let device = Device::Cpu;
        let logits = Var::randn(0f32, 1.0, (2, 5, 4), &device).unwrap();
        let lp = log_probs(logits.as_tensor()).unwrap();
        let loss = CtcLoss::default()
            .forward_sum(&lp, &[vec![1, 2], vec![3, 3]])
            .unwrap();

        let grads = loss.backward().unwrap();
        let grad = grads.get(logits.as_tensor()).expect("gradient for logits");
        assert_eq!(grad.dims(), &[2, 5, 4]);

        let values = grad.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| v.is_finite()));
        assert!(values.iter().any(|v| v.abs() > 0.0));
    }
}
