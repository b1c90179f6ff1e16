//! Label record storage
//!
//! Plain-text `filename,label` records, one per line. The labeling workflow
//! writes a `filename,label` header when it creates the file; readers skip it.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use tracing::{debug, info};

use crate::recognition::alphabet::Alphabet;

/// Header line written when a label file is created
pub const HEADER: &str = "filename,label";

/// Whether a line is the optional header
pub fn is_header(line: &str) -> bool {
    line.trim().eq_ignore_ascii_case(HEADER)
}

/// Split a record into (filename, label)
///
/// Returns `None` unless the line has exactly one separator and a filename.
pub fn parse_record(line: &str) -> Option<(&str, &str)> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (filename, label) = line.split_once(',')?;
    if label.contains(',') {
        return None;
    }
    let filename = filename.trim();
    if filename.is_empty() {
        return None;
    }
    Some((filename, label.trim()))
}

/// Load existing labels keyed by filename; a missing file yields no labels
pub fn load_labels(path: &Path) -> Result<HashMap<String, String>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read label file {:?}", path))?;

    let labels: HashMap<String, String> = content
        .lines()
        .filter(|line| !is_header(line))
        .filter_map(parse_record)
        .map(|(f, l)| (f.to_string(), l.to_string()))
        .collect();

    debug!("Loaded {} labels from {:?}", labels.len(), path);
    Ok(labels)
}

/// Trim a typed label and fold its case only where the alphabet needs it
///
/// The label is kept as typed when the alphabet accepts it; otherwise its
/// uppercase form is tried. Out-of-alphabet labels are rejected, never
/// filtered.
pub fn normalize_label(label: &str, alphabet: &Alphabet) -> crate::error::Result<String> {
    let trimmed = label.trim();
    match alphabet.encode(trimmed) {
        Ok(_) => Ok(trimmed.to_string()),
        Err(e) => {
            let upper = trimmed.to_uppercase();
            if upper != trimmed && alphabet.encode(&upper).is_ok() {
                Ok(upper)
            } else {
                Err(e)
            }
        }
    }
}

/// Append one label record, returning the normalized label
pub fn append_label(path: &Path, filename: &str, label: &str, alphabet: &Alphabet) -> Result<String> {
    if filename.is_empty() || filename.contains(',') || filename.contains('\n') {
        anyhow::bail!("Invalid sample filename {:?}", filename);
    }

    let normalized = normalize_label(label, alphabet)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let needs_header = std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open label file {:?}", path))?;

    if needs_header {
        writeln!(file, "{}", HEADER)?;
    }
    writeln!(file, "{},{}", filename, normalized)?;

    info!("Saved {} -> {}", filename, normalized);
    Ok(normalized)
}

/// Images in `dir` that have no label yet: `.png` first, then `.jpg`/`.jpeg`,
/// each group in name order
pub fn pending_images(dir: &Path, labels: &HashMap<String, String>) -> Result<Vec<String>> {
    let mut png = Vec::new();
    let mut jpg = Vec::new();

    for entry in std::fs::read_dir(dir).with_context(|| format!("Failed to list {:?}", dir))? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if labels.contains_key(&name) {
            continue;
        }
        match extension_of(&name).as_deref() {
            Some("png") => png.push(name),
            Some("jpg") | Some("jpeg") => jpg.push(name),
            _ => {}
        }
    }

    png.sort();
    jpg.sort();
    png.extend(jpg);
    Ok(png)
}

fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}
