//! Training Data
//!
//! Labeled samples read from a `filename,label` file and grouped into
//! image/target batches.

pub mod batch;
pub mod samples;
