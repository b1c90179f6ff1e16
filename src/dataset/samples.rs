//! Sample store
//!
//! Lazily reads `filename,label` records and loads the referenced images as
//! fixed-size grayscale arrays. Label validation is left to the codec.

use ndarray::Array3;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::Result;
use crate::recognition::preprocess::{load_grayscale, InputSize};
use crate::storage::labels::{is_header, parse_record};

/// One labeled image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    /// Resolved image path (sample directory joined with the filename)
    pub image_path: PathBuf,
    /// Label text, not yet validated against any alphabet
    pub label: String,
    /// 1-based line number in the label file
    pub line: usize,
}

/// Reads samples from a label file and images from a sample directory
#[derive(Debug, Clone)]
pub struct SampleStore {
    label_file: PathBuf,
    sample_dir: PathBuf,
    input_size: InputSize,
}

impl SampleStore {
    pub fn new(label_file: impl Into<PathBuf>, sample_dir: impl Into<PathBuf>, input_size: InputSize) -> Self {
        Self {
            label_file: label_file.into(),
            sample_dir: sample_dir.into(),
            input_size,
        }
    }

    pub fn label_file(&self) -> &Path {
        &self.label_file
    }

    /// Iterate samples in file order
    ///
    /// Each call re-opens the label file and starts from the first record.
    /// Malformed lines (including ones that are not UTF-8) are logged and
    /// skipped; an optional header is ignored.
    pub fn samples(&self) -> Result<SampleIter> {
        let file = File::open(&self.label_file)?;
        Ok(SampleIter {
            reader: BufReader::new(file),
            buf: Vec::new(),
            sample_dir: self.sample_dir.clone(),
            line: 0,
        })
    }

    /// Load and normalize the image of a sample as (1, H, W)
    pub fn load_image(&self, sample: &Sample) -> Result<Array3<f32>> {
        load_grayscale(&sample.image_path, self.input_size)
    }
}

/// Lazy iterator over the records of a label file
pub struct SampleIter {
    reader: BufReader<File>,
    buf: Vec<u8>,
    sample_dir: PathBuf,
    line: usize,
}

impl Iterator for SampleIter {
    type Item = Result<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            match self.reader.read_until(b'\n', &mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => return Some(Err(e.into())),
            }
            self.line += 1;

            let Ok(text) = std::str::from_utf8(&self.buf) else {
                warn!("Skipping label record at line {}: not valid UTF-8", self.line);
                continue;
            };

            if text.trim().is_empty() || (self.line == 1 && is_header(text)) {
                continue;
            }

            match parse_record(text) {
                Some((filename, label)) => {
                    return Some(Ok(Sample {
                        image_path: self.sample_dir.join(filename),
                        label: label.to_string(),
                        line: self.line,
                    }));
                }
                None => warn!("Skipping malformed label record at line {}: {:?}", self.line, text),
            }
        }
    }
}
