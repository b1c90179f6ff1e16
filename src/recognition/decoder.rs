//! CTC decoding
//!
//! Greedy best-path decoding: argmax per timestep, collapse repeats, drop
//! blanks. Other strategies (beam search, lexicon constraints) plug in behind
//! [`SequenceDecoder`].

use ndarray::ArrayView2;

use super::alphabet::{Alphabet, BLANK};
use crate::error::{RecognitionError, Result};

/// Turns one sample's per-timestep class scores into text
pub trait SequenceDecoder {
    /// `logits` has shape (T, A + 1)
    fn decode(&self, logits: ArrayView2<f32>) -> Result<String>;
}

/// Greedy (best-path) CTC decoder
#[derive(Debug, Clone)]
pub struct GreedyDecoder {
    alphabet: Alphabet,
}

impl GreedyDecoder {
    pub fn new(alphabet: Alphabet) -> Self {
        Self { alphabet }
    }

    /// Highest scoring class per timestep
    pub fn best_path(&self, logits: ArrayView2<f32>) -> Result<Vec<usize>> {
        let classes = logits.ncols();
        if classes != self.alphabet.num_classes() {
            return Err(RecognitionError::OutOfRange {
                index: classes.saturating_sub(1),
                max: self.alphabet.len(),
            });
        }

        Ok(logits
            .rows()
            .into_iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .fold((0usize, f32::NEG_INFINITY), |best, (i, &score)| {
                        if score > best.1 {
                            (i, score)
                        } else {
                            best
                        }
                    })
                    .0
            })
            .collect())
    }

    /// Collapse a per-timestep index sequence into text
    ///
    /// An index is emitted when it differs from the previous timestep's index
    /// and is not the blank. A blank between two equal indices therefore keeps
    /// both characters.
    pub fn decode_indices(&self, path: &[usize]) -> Result<String> {
        let mut text = String::with_capacity(path.len());
        let mut last: Option<usize> = None;

        for &idx in path {
            if Some(idx) != last && idx != BLANK as usize {
                text.push(self.alphabet.decode_index(idx)?);
            }
            last = Some(idx);
        }

        Ok(text)
    }
}

impl SequenceDecoder for GreedyDecoder {
    fn decode(&self, logits: ArrayView2<f32>) -> Result<String> {
        let path = self.best_path(logits)?;
        self.decode_indices(&path)
    }
}
