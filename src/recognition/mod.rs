//! Recognition Core
//!
//! Character codec, CRNN model, CTC loss and greedy decoding for single-line
//! plate crops. Images enter as fixed-size grayscale arrays and leave as text.

pub mod alphabet;
pub mod ctc;
pub mod decoder;
pub mod model;
pub mod preprocess;
