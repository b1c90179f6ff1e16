//! Model weight persistence
//!
//! Weights are a single safetensors file holding every model parameter plus
//! two metadata tensors that fingerprint the alphabet and geometry. Writes go
//! to a temporary file in the destination directory and are renamed into
//! place, so readers see either the old file or the complete new one. A JSON
//! manifest next to the weights records a sha256 of the file; it is staged
//! the same way and renamed into place after the weights.

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

use crate::config::ModelConfig;
use crate::error::{RecognitionError, Result};
use crate::recognition::alphabet::Alphabet;

/// Tensor name holding the alphabet code points
pub const META_ALPHABET: &str = "meta.alphabet";
/// Tensor name holding `[input_height, input_width, hidden_size]`
pub const META_GEOMETRY: &str = "meta.geometry";

/// Record written next to the weights file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelManifest {
    pub version: String,
    pub alphabet: String,
    pub num_classes: usize,
    pub geometry: [u32; 3],
    pub size_bytes: u64,
    pub sha256: String,
    pub epochs: usize,
    pub final_loss: Option<f32>,
    pub saved_at: u64,
}

/// Training facts stored in the manifest
#[derive(Debug, Clone, Copy, Default)]
pub struct TrainingSummary {
    pub epochs: usize,
    pub final_loss: Option<f32>,
}

/// Path of the manifest belonging to a weights file
pub fn manifest_path(weights: &Path) -> PathBuf {
    weights.with_extension("manifest.json")
}

fn geometry_of(config: &ModelConfig) -> [u32; 3] {
    [config.input_height, config.input_width, config.hidden_size]
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Persist all parameters of `varmap` atomically and write the manifest
pub fn save_weights(
    varmap: &VarMap,
    path: &Path,
    alphabet: &Alphabet,
    config: &ModelConfig,
    summary: TrainingSummary,
) -> Result<ModelManifest> {
    let mut tensors: HashMap<String, Tensor> = {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| candle_core::Error::Msg("parameter store lock poisoned".to_string()))?;
        data.iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect()
    };

    let device = Device::Cpu;
    tensors.insert(
        META_ALPHABET.to_string(),
        Tensor::new(alphabet.code_points().as_slice(), &device)?,
    );
    tensors.insert(
        META_GEOMETRY.to_string(),
        Tensor::new(&geometry_of(config)[..], &device)?,
    );

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let staging = staging_file(&dir, ".weights-")?;
    candle_core::safetensors::save(&tensors, staging.path())?;
    let bytes = std::fs::read(staging.path())?;

    let manifest = ModelManifest {
        version: env!("CARGO_PKG_VERSION").to_string(),
        alphabet: alphabet.as_str(),
        num_classes: alphabet.num_classes(),
        geometry: geometry_of(config),
        size_bytes: bytes.len() as u64,
        sha256: sha256_hex(&bytes),
        epochs: summary.epochs,
        final_loss: summary.final_loss,
        saved_at: unix_now(),
    };
    let manifest_json = serde_json::to_string_pretty(&manifest)
        .map_err(|e| candle_core::Error::Msg(format!("manifest serialization failed: {e}")))?;
    let mut manifest_staging = staging_file(&dir, ".manifest-")?;
    manifest_staging.write_all(manifest_json.as_bytes())?;
    manifest_staging.as_file().sync_all()?;

    // The old manifest goes first; weights without a manifest load with a
    // warning, weights with a stale one do not load at all
    let manifest_file = manifest_path(path);
    match std::fs::remove_file(&manifest_file) {
        Ok(()) => debug!("Removed previous manifest {:?}", manifest_file),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    staging.persist(path).map_err(|e| e.error)?;
    manifest_staging.persist(&manifest_file).map_err(|e| e.error)?;

    info!(
        "Saved {} parameter tensors to {:?} ({} bytes)",
        tensors.len() - 2,
        path,
        manifest.size_bytes
    );
    Ok(manifest)
}

fn staging_file(dir: &Path, prefix: &str) -> std::io::Result<tempfile::NamedTempFile> {
    tempfile::Builder::new().prefix(prefix).suffix(".tmp").tempfile_in(dir)
}

/// Read, verify and deserialize a weights file
///
/// Any failure (missing, truncated, checksum mismatch, different alphabet or
/// geometry) is a `ModelLoad` error.
pub fn read_weights(
    path: &Path,
    alphabet: &Alphabet,
    config: &ModelConfig,
    device: &Device,
) -> Result<HashMap<String, Tensor>> {
    let fail = |reason: String| RecognitionError::model_load(path, reason);

    let bytes = std::fs::read(path).map_err(|e| fail(e.to_string()))?;

    let manifest_file = manifest_path(path);
    if manifest_file.exists() {
        let manifest: ModelManifest = std::fs::read_to_string(&manifest_file)
            .map_err(|e| e.to_string())
            .and_then(|s| serde_json::from_str(&s).map_err(|e| e.to_string()))
            .map_err(|e| fail(format!("unreadable manifest {:?}: {}", manifest_file, e)))?;
        let actual = sha256_hex(&bytes);
        if manifest.sha256 != actual {
            return Err(fail(format!(
                "checksum mismatch: manifest says {}, file is {}",
                manifest.sha256, actual
            )));
        }
        debug!("Checksum verified for {:?}", path);
    } else {
        warn!("No manifest next to {:?}; skipping checksum verification", path);
    }

    let tensors = candle_core::safetensors::load_buffer(&bytes, device)
        .map_err(|e| fail(format!("not a valid weights file: {}", e)))?;

    let stored_alphabet = meta_values(&tensors, META_ALPHABET).map_err(&fail)?;
    if stored_alphabet.len() != alphabet.len() {
        return Err(fail(format!(
            "model trained for {} classes, configured for {}",
            stored_alphabet.len() + 1,
            alphabet.num_classes()
        )));
    }
    if stored_alphabet != alphabet.code_points() {
        let trained: String = stored_alphabet
            .iter()
            .filter_map(|&c| char::from_u32(c))
            .collect();
        return Err(fail(format!(
            "model trained for alphabet {:?}, configured for {:?}",
            trained,
            alphabet.as_str()
        )));
    }

    let stored_geometry = meta_values(&tensors, META_GEOMETRY).map_err(&fail)?;
    if stored_geometry != geometry_of(config) {
        return Err(fail(format!(
            "model trained for geometry {:?}, configured for {:?}",
            stored_geometry,
            geometry_of(config)
        )));
    }

    Ok(tensors)
}

fn meta_values(tensors: &HashMap<String, Tensor>, name: &str) -> std::result::Result<Vec<u32>, String> {
    tensors
        .get(name)
        .ok_or_else(|| format!("missing {} tensor", name))?
        .to_vec1::<u32>()
        .map_err(|e| format!("malformed {} tensor: {}", name, e))
}

/// Overwrite every parameter in `varmap` with the stored tensors
///
/// The varmap must already hold the parameters of a freshly built model; a
/// parameter that is absent from the file or shaped differently fails the
/// whole load before anything is written.
pub fn load_into(
    varmap: &VarMap,
    path: &Path,
    alphabet: &Alphabet,
    config: &ModelConfig,
) -> Result<()> {
    let tensors = read_weights(path, alphabet, config, &Device::Cpu)?;
    let fail = |reason: String| RecognitionError::model_load(path, reason);

    let data = varmap
        .data()
        .lock()
        .map_err(|_| fail("parameter store lock poisoned".to_string()))?;

    for (name, var) in data.iter() {
        let stored = tensors
            .get(name)
            .ok_or_else(|| fail(format!("missing parameter {}", name)))?;
        if stored.dims() != var.dims() {
            return Err(fail(format!(
                "parameter {} has shape {:?}, model expects {:?}",
                name,
                stored.dims(),
                var.dims()
            )));
        }
    }

    for (name, var) in data.iter() {
        if let Some(stored) = tensors.get(name) {
            var.set(stored).map_err(|e| fail(e.to_string()))?;
        }
    }

    info!("Loaded {} parameter tensors from {:?}", data.len(), path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognition::model::Crnn;
    use candle_core::DType;
    use candle_nn::VarBuilder;
    use tempfile::tempdir;

    fn small_config() -> ModelConfig {
        ModelConfig {
            input_height: 16,
            input_width: 32,
            hidden_size: 8,
        }
    }

    fn fresh(alphabet: &Alphabet, config: ModelConfig) -> (VarMap, Crnn) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = Crnn::new(config, alphabet.num_classes(), vb).unwrap();
        (varmap, model)
    }

    fn fc_weight(varmap: &VarMap) -> Vec<f32> {
        let data = varmap.data().lock().unwrap();
        data["fc.weight"]
            .as_tensor()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("models").join("crnn.safetensors");
        let alphabet = Alphabet::default();
        let config = small_config();

        let (trained, _) = fresh(&alphabet, config);
        let manifest = save_weights(
            &trained,
            &path,
            &alphabet,
            &config,
            TrainingSummary {
                epochs: 3,
                final_loss: Some(1.5),
            },
        )
        .unwrap();
        assert_eq!(manifest.num_classes, 38);
        assert!(manifest_path(&path).exists());

        let (loaded, _) = fresh(&alphabet, config);
        assert_ne!(fc_weight(&trained), fc_weight(&loaded));
        load_into(&loaded, &path, &alphabet, &config).unwrap();
        assert_eq!(fc_weight(&trained), fc_weight(&loaded));
    }

    #[test]
    fn test_alphabet_size_mismatch_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("crnn.safetensors");
        let trained_alphabet = Alphabet::default();
        let config = small_config();

        let (trained, _) = fresh(&trained_alphabet, config);
        save_weights(&trained, &path, &trained_alphabet, &config, TrainingSummary::default())
            .unwrap();

        let digits = Alphabet::new("123456789").unwrap();
        let (target, _) = fresh(&digits, config);
        let before = fc_weight(&target);

        let err = load_into(&target, &path, &digits, &config).unwrap_err();
        match err {
            RecognitionError::ModelLoad { reason, .. } => {
                assert!(reason.contains("38"), "{reason}");
                assert!(reason.contains("10"), "{reason}");
            }
            other => panic!("unexpected error: {other}"),
        }
        // nothing partially loaded
        assert_eq!(before, fc_weight(&target));
    }

    #[test]
    fn test_geometry_mismatch_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("crnn.safetensors");
        let alphabet = Alphabet::default();

        let (trained, _) = fresh(&alphabet, small_config());
        save_weights(&trained, &path, &alphabet, &small_config(), TrainingSummary::default())
            .unwrap();

        let wider = ModelConfig {
            input_width: 64,
            ..small_config()
        };
        let (target, _) = fresh(&alphabet, wider);
        assert!(matches!(
            load_into(&target, &path, &alphabet, &wider),
            Err(RecognitionError::ModelLoad { .. })
        ));
    }

    #[test]
    fn test_missing_file_fails() {
        let alphabet = Alphabet::default();
        let (target, _) = fresh(&alphabet, small_config());
        let err = load_into(
            &target,
            Path::new("/nonexistent/crnn.safetensors"),
            &alphabet,
            &small_config(),
        )
        .unwrap_err();
        assert!(matches!(err, RecognitionError::ModelLoad { .. }));
    }

    #[test]
    fn test_truncated_file_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("crnn.safetensors");
        let alphabet = Alphabet::default();
        let config = small_config();

        let (trained, _) = fresh(&alphabet, config);
        save_weights(&trained, &path, &alphabet, &config, TrainingSummary::default()).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        let (target, _) = fresh(&alphabet, config);
        assert!(matches!(
            load_into(&target, &path, &alphabet, &config),
            Err(RecognitionError::ModelLoad { .. })
        ));

        // still rejected once the checksum no longer vouches for it
        std::fs::remove_file(manifest_path(&path)).unwrap();
        assert!(matches!(
            load_into(&target, &path, &alphabet, &config),
            Err(RecognitionError::ModelLoad { .. })
        ));
    }

    #[test]
    fn test_resave_replaces_stale_manifest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("crnn.safetensors");
        let alphabet = Alphabet::default();
        let config = small_config();

        let (first, _) = fresh(&alphabet, config);
        save_weights(&first, &path, &alphabet, &config, TrainingSummary::default()).unwrap();

        let mut stale: ModelManifest =
            serde_json::from_str(&std::fs::read_to_string(manifest_path(&path)).unwrap()).unwrap();
        stale.sha256 = "0".repeat(64);
        std::fs::write(manifest_path(&path), serde_json::to_string(&stale).unwrap()).unwrap();

        let (second, _) = fresh(&alphabet, config);
        let manifest = save_weights(&second, &path, &alphabet, &config, TrainingSummary::default()).unwrap();
        assert_eq!(manifest.sha256, sha256_hex(&std::fs::read(&path).unwrap()));

        let (target, _) = fresh(&alphabet, config);
        load_into(&target, &path, &alphabet, &config).unwrap();
        assert_eq!(fc_weight(&second), fc_weight(&target));

        // no staging files left behind
        let mut names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["crnn.manifest.json", "crnn.safetensors"]);
    }

    #[test]
    fn test_manifest_path() {
        assert_eq!(
            manifest_path(Path::new("/m/crnn.safetensors")),
            PathBuf::from("/m/crnn.manifest.json")
        );
    }
}
