//! Alphabet and label codec
//!
//! Maps characters to CTC class indices. Index 0 is the blank class and never
//! names a character; printable characters occupy 1..=A in alphabet order.

use std::collections::HashMap;

use crate::error::{RecognitionError, Result};

/// Class index reserved for the CTC blank
pub const BLANK: u32 = 0;

/// Alphabet used by the reference plate labels
pub const DEFAULT_ALPHABET: &str = "0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ/";

/// Fixed ordered character set with a bidirectional index mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alphabet {
    chars: Vec<char>,
    index: HashMap<char, u32>,
}

impl Alphabet {
    /// Build an alphabet from an ordered string of distinct characters
    pub fn new(characters: &str) -> Result<Self> {
        let chars: Vec<char> = characters.chars().collect();
        if chars.is_empty() {
            return Err(RecognitionError::InvalidAlphabet(
                "alphabet must contain at least one character".to_string(),
            ));
        }

        let mut index = HashMap::with_capacity(chars.len());
        for (i, &c) in chars.iter().enumerate() {
            if index.insert(c, i as u32 + 1).is_some() {
                return Err(RecognitionError::InvalidAlphabet(format!(
                    "character {:?} appears more than once",
                    c
                )));
            }
        }

        Ok(Self { chars, index })
    }

    /// Number of printable characters (A)
    pub fn len(&self) -> usize {
        self.chars.len()
    }

    /// Number of output classes including the blank (A + 1)
    pub fn num_classes(&self) -> usize {
        self.chars.len() + 1
    }

    /// Characters in index order
    pub fn as_str(&self) -> String {
        self.chars.iter().collect()
    }

    /// Unicode code points in index order, used to fingerprint saved weights
    pub fn code_points(&self) -> Vec<u32> {
        self.chars.iter().map(|&c| c as u32).collect()
    }

    /// Class index of a single character
    pub fn encode_char(&self, c: char) -> Option<u32> {
        self.index.get(&c).copied()
    }

    /// Encode a label into class indices, one per character
    pub fn encode(&self, label: &str) -> Result<Vec<u32>> {
        label
            .chars()
            .map(|c| {
                self.encode_char(c)
                    .ok_or_else(|| RecognitionError::InvalidCharacter {
                        character: c,
                        label: label.to_string(),
                    })
            })
            .collect()
    }

    /// Character for a class index; the blank and indices above A are rejected
    pub fn decode_index(&self, index: usize) -> Result<char> {
        if index == BLANK as usize || index > self.chars.len() {
            return Err(RecognitionError::OutOfRange {
                index,
                max: self.chars.len(),
            });
        }
        Ok(self.chars[index - 1])
    }
}

impl Default for Alphabet {
    fn default() -> Self {
        let chars: Vec<char> = DEFAULT_ALPHABET.chars().collect();
        let index = chars
            .iter()
            .enumerate()
            .map(|(i, &c)| (c, i as u32 + 1))
            .collect();
        Self { chars, index }
    }
}
