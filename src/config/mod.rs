//! Application Configuration
//!
//! Alphabet, model geometry, training and capture settings stored in TOML format.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::recognition::alphabet::{Alphabet, DEFAULT_ALPHABET};
use crate::recognition::preprocess::InputSize;

/// Number of 2x2 pooling stages in the convolutional front end
pub const POOL_STAGES: u32 = 2;

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Recognizable characters
    pub alphabet: AlphabetConfig,
    /// Model geometry
    pub model: ModelConfig,
    /// Training hyperparameters
    pub training: TrainingConfig,
    /// File locations
    pub paths: PathsConfig,
    /// Live capture settings
    pub capture: CaptureSettings,
}

impl AppConfig {
    /// Build the alphabet described by this configuration
    pub fn alphabet(&self) -> Result<Alphabet> {
        Alphabet::new(&self.alphabet.characters).context("Invalid alphabet in configuration")
    }
}

/// Alphabet settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlphabetConfig {
    /// Ordered, distinct characters; class 0 is reserved for the blank
    pub characters: String,
}

impl Default for AlphabetConfig {
    fn default() -> Self {
        Self {
            characters: DEFAULT_ALPHABET.to_string(),
        }
    }
}

/// Recognition model geometry
///
/// Changing any of these invalidates previously trained weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Input image height in pixels
    pub input_height: u32,
    /// Input image width in pixels
    pub input_width: u32,
    /// Hidden units per LSTM direction
    pub hidden_size: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            input_height: 50,
            input_width: 200,
            hidden_size: 128,
        }
    }
}

impl ModelConfig {
    pub fn input_size(&self) -> InputSize {
        InputSize::new(self.input_height, self.input_width)
    }

    /// Feature-map height after the pooling stages
    pub fn pooled_height(&self) -> usize {
        (self.input_height >> POOL_STAGES) as usize
    }

    /// Output sequence length T
    pub fn timesteps(&self) -> usize {
        (self.input_width >> POOL_STAGES) as usize
    }

    /// Reject geometries that collapse to nothing after pooling
    pub fn validate(&self) -> Result<()> {
        if self.pooled_height() == 0 || self.timesteps() == 0 {
            anyhow::bail!(
                "Model input {}x{} is too small for {} pooling stages",
                self.input_width,
                self.input_height,
                POOL_STAGES
            );
        }
        if self.hidden_size == 0 {
            anyhow::bail!("Model hidden_size must be positive");
        }
        Ok(())
    }
}

/// Training hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Passes over the full dataset
    pub epochs: usize,
    /// Samples per batch
    pub batch_size: usize,
    /// Adam learning rate
    pub learning_rate: f64,
    /// Fixed shuffle seed for reproducible runs
    pub shuffle_seed: Option<u64>,
    /// Batches loaded ahead of the optimizer
    pub prefetch_batches: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 30,
            batch_size: 8,
            learning_rate: 1e-3,
            shuffle_seed: None,
            prefetch_batches: 2,
        }
    }
}

/// File locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory holding the labeled crops
    pub sample_dir: PathBuf,
    /// `filename,label` records
    pub label_file: PathBuf,
    /// Trained weights (safetensors)
    pub weights_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let data_dir = crate::storage::default_data_dir();
        Self {
            sample_dir: data_dir.join("samples"),
            label_file: data_dir.join("labels.csv"),
            weights_file: data_dir.join("models").join("crnn.safetensors"),
        }
    }
}

/// Region of interest as fractions of the frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoiFractions {
    pub top: f32,
    pub bottom: f32,
    pub left: f32,
    pub right: f32,
}

/// Live capture settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Directory the camera tool writes frames into
    pub watch_dir: PathBuf,
    /// How often to look for new frames
    pub poll_interval_ms: u64,
    /// Blur and Otsu-threshold frames before recognition
    pub binarize: bool,
    /// Directory to keep conditioned frames in for later labeling
    pub save_crops_to: Option<PathBuf>,
    /// Crop applied before recognition
    pub roi: Option<RoiFractions>,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            watch_dir: crate::storage::default_data_dir().join("capture"),
            poll_interval_ms: 200,
            binarize: false,
            save_crops_to: None,
            roi: None,
        }
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {:?}", path))?;
    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config {:?}", path))?;
    config.model.validate()?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_app_config() {
        let config = AppConfig::default();

        assert_eq!(config.alphabet.characters, DEFAULT_ALPHABET);
        assert_eq!(config.alphabet().unwrap().num_classes(), 38);

        assert_eq!(config.model.input_height, 50);
        assert_eq!(config.model.input_width, 200);
        assert_eq!(config.model.hidden_size, 128);
        assert_eq!(config.model.timesteps(), 50);
        assert_eq!(config.model.pooled_height(), 12);

        assert_eq!(config.training.epochs, 30);
        assert_eq!(config.training.batch_size, 8);
        assert!((config.training.learning_rate - 1e-3).abs() < 1e-12);
        assert!(config.training.shuffle_seed.is_none());

        assert!(config.capture.roi.is_none());
        assert!(!config.capture.binarize);
        assert!(config.paths.weights_file.ends_with("models/crnn.safetensors"));
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let mut config = AppConfig::default();
        config.training.shuffle_seed = Some(7);
        config.capture.roi = Some(RoiFractions {
            top: 0.1,
            bottom: 0.4,
            left: 0.05,
            right: 0.6,
        });

        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(parsed.model, config.model);
        assert_eq!(parsed.training.shuffle_seed, Some(7));
        assert_eq!(parsed.capture.roi, config.capture.roi);
        assert_eq!(parsed.paths.label_file, config.paths.label_file);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: AppConfig = toml::from_str(
            r#"
            [alphabet]
            characters = "0123456789"

            [training]
            epochs = 5
            "#,
        )
        .unwrap();

        assert_eq!(parsed.alphabet().unwrap().num_classes(), 11);
        assert_eq!(parsed.training.epochs, 5);
        assert_eq!(parsed.training.batch_size, 8);
        assert_eq!(parsed.model, ModelConfig::default());
    }

    #[test]
    fn test_save_and_load_config() {
        let config = AppConfig::default();
        let temp_file = NamedTempFile::new().unwrap();

        save_config(&config, temp_file.path()).unwrap();
        let loaded = load_config(temp_file.path()).unwrap();

        assert_eq!(config.model, loaded.model);
        assert_eq!(config.training.epochs, loaded.training.epochs);
    }

    #[test]
    fn test_load_config_file_not_found() {
        let result = load_config(Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_config_invalid_toml() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "this is not valid toml {{{{").unwrap();

        let result = load_config(temp_file.path());
        assert!(result.is_err());
    }

    #[test]
    fn test_tiny_geometry_is_rejected() {
        let model = ModelConfig {
            input_height: 3,
            input_width: 200,
            hidden_size: 16,
        };
        assert!(model.validate().is_err());
        assert!(ModelConfig::default().validate().is_ok());
    }

    #[test]
    fn test_duplicate_alphabet_is_rejected() {
        let mut config = AppConfig::default();
        config.alphabet.characters = "AAB".to_string();
        assert!(config.alphabet().is_err());
    }
}
