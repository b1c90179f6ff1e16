//! Storage Layer
//!
//! Resolves the platform data/config directories and persists label records
//! and trained weights.

pub mod labels;
pub mod weights;

use anyhow::Result;
use std::path::PathBuf;

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "plateocr", "PlateOcr")
}

/// Get the configuration directory
pub fn get_config_dir() -> Result<PathBuf> {
    let proj_dirs =
        project_dirs().ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;

    let config_dir = proj_dirs.config_dir().to_path_buf();
    std::fs::create_dir_all(&config_dir)?;

    Ok(config_dir)
}

/// Data directory used for default paths, without touching the filesystem
///
/// Falls back to a relative `plate-ocr-data` directory when no home
/// directory can be determined.
pub fn default_data_dir() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("plate-ocr-data"))
}
