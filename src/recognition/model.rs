//! Convolutional-recurrent recognition model (CRNN)
//!
//! conv3x3(1→32) → ReLU → maxpool2 → conv3x3(32→64) → ReLU → maxpool2
//! → width as time axis, channels×height as features
//! → bidirectional LSTM → linear to A+1 class scores per timestep.

use candle_core::{Device, Module, Tensor};
use candle_nn::rnn::{lstm, LSTMConfig, LSTM, RNN};
use candle_nn::{conv2d, linear, Conv2d, Conv2dConfig, Linear, VarBuilder};

use crate::config::ModelConfig;
use crate::error::Result;

const CONV1_CHANNELS: usize = 32;
const CONV2_CHANNELS: usize = 64;
const KERNEL: usize = 3;
const POOL: usize = 2;

/// Bidirectional LSTM built from two unidirectional candle LSTMs
#[derive(Debug, Clone)]
struct BiLstm {
    forward: LSTM,
    backward: LSTM,
}

impl BiLstm {
    fn new(in_dim: usize, hidden: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let forward = lstm(in_dim, hidden, LSTMConfig::default(), vb.pp("forward"))?;
        let backward = lstm(in_dim, hidden, LSTMConfig::default(), vb.pp("backward"))?;
        Ok(Self { forward, backward })
    }

    /// (batch, T, features) → (batch, T, 2 * hidden)
    fn forward(&self, seq: &Tensor) -> candle_core::Result<Tensor> {
        let steps = seq.dim(1)?;
        let reversed: Vec<u32> = (0..steps as u32).rev().collect();
        let reversed = Tensor::new(reversed.as_slice(), seq.device())?;

        let fwd = run_lstm(&self.forward, seq)?;
        let bwd = run_lstm(&self.backward, &seq.index_select(&reversed, 1)?)?
            .index_select(&reversed, 1)?;

        Tensor::cat(&[&fwd, &bwd], 2)
    }
}

fn run_lstm(lstm: &LSTM, seq: &Tensor) -> candle_core::Result<Tensor> {
    let states = lstm.seq(seq)?;
    lstm.states_to_tensor(&states)
}

/// CRNN producing per-timestep class scores
#[derive(Debug, Clone)]
pub struct Crnn {
    conv1: Conv2d,
    conv2: Conv2d,
    rnn: BiLstm,
    fc: Linear,
    config: ModelConfig,
}

impl Crnn {
    /// Build the network; parameters come from (or are registered in) `vb`
    pub fn new(config: ModelConfig, num_classes: usize, vb: VarBuilder) -> Result<Self> {
        let conv_cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv1 = conv2d(1, CONV1_CHANNELS, KERNEL, conv_cfg, vb.pp("cnn.conv1"))?;
        let conv2 = conv2d(CONV1_CHANNELS, CONV2_CHANNELS, KERNEL, conv_cfg, vb.pp("cnn.conv2"))?;

        let hidden = config.hidden_size as usize;
        let features = CONV2_CHANNELS * config.pooled_height();
        let rnn = BiLstm::new(features, hidden, vb.pp("rnn"))?;
        let fc = linear(2 * hidden, num_classes, vb.pp("fc"))?;

        Ok(Self {
            conv1,
            conv2,
            rnn,
            fc,
            config,
        })
    }

    /// Output sequence length T for the configured input width
    pub fn timesteps(&self) -> usize {
        self.config.timesteps()
    }

    /// `(batch, 1, H, W)` images → `(batch, T, A+1)` raw class scores
    pub fn forward(&self, images: &Tensor) -> Result<Tensor> {
        let (_, channels, height, width) = images.dims4()?;
        if channels != 1
            || height != self.config.input_height as usize
            || width != self.config.input_width as usize
        {
            return Err(candle_core::Error::Msg(format!(
                "model expects (batch, 1, {}, {}) input, got {:?}",
                self.config.input_height,
                self.config.input_width,
                images.dims()
            ))
            .into());
        }

        let x = self.conv1.forward(images)?.relu()?.max_pool2d(POOL)?;
        let x = self.conv2.forward(&x)?.relu()?.max_pool2d(POOL)?;

        // (b, c, h, w) → (b, w, c*h): width becomes time
        let (b, c, h, w) = x.dims4()?;
        let seq = x.permute((0, 3, 1, 2))?.contiguous()?.reshape((b, w, c * h))?;

        let hidden = self.rnn.forward(&seq)?;
        Ok(self.fc.forward(&hidden)?)
    }
}

/// Device used for training and inference
pub fn default_device() -> Device {
    Device::Cpu
}
