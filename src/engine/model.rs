//! Model files
//!
//! Locates the model inside a session's model folder and checks its GGUF header.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::SessionConfig;

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x46554747;

/// Errors that can occur while locating or validating a model
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Failed to open file: {0}")]
    FileOpen(#[from] std::io::Error),

    #[error("Invalid GGUF file: magic bytes mismatch (expected 0x{:08X}, got 0x{:08X})", GGUF_MAGIC, .0)]
    InvalidMagic(u32),

    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),

    #[error("File too small to be valid GGUF")]
    FileTooSmall,

    #[error("No .gguf model found in {0}")]
    NotFound(PathBuf),
}

/// Metadata extracted from a GGUF file header
#[derive(Debug, Clone)]
pub struct GgufMetadata {
    /// GGUF format version
    pub version: u32,
    /// Number of tensors in the model
    pub tensor_count: u64,
    /// Number of metadata key-value pairs
    pub metadata_kv_count: u64,
}

/// Validates that a file is a valid GGUF format and extracts basic metadata.
pub fn validate_gguf<P: AsRef<Path>>(path: P) -> Result<GgufMetadata, ModelError> {
    let mut file = File::open(path)?;

    // magic(4) + version(4) + tensor_count(8) + metadata_kv_count(8)
    let file_size = file.seek(SeekFrom::End(0))?;
    if file_size < 24 {
        return Err(ModelError::FileTooSmall);
    }
    file.seek(SeekFrom::Start(0))?;

    let magic = read_u32(&mut file)?;
    if magic != GGUF_MAGIC {
        return Err(ModelError::InvalidMagic(magic));
    }

    // GGUF v2 and v3 are supported
    let version = read_u32(&mut file)?;
    if !(2..=3).contains(&version) {
        return Err(ModelError::UnsupportedVersion(version));
    }

    let tensor_count = read_u64(&mut file)?;
    let metadata_kv_count = read_u64(&mut file)?;

    Ok(GgufMetadata {
        version,
        tensor_count,
        metadata_kv_count,
    })
}

fn read_u32(file: &mut File) -> Result<u32, ModelError> {
    let mut bytes = [0u8; 4];
    file.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_u64(file: &mut File) -> Result<u64, ModelError> {
    let mut bytes = [0u8; 8];
    file.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

fn has_gguf_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case("gguf"))
        .unwrap_or(false)
}

/// Lists `.gguf` files directly inside `directory`, sorted by file name.
pub fn scan_models_directory(directory: &Path) -> Result<Vec<PathBuf>, ModelError> {
    let mut models = vec![];

    for entry in fs::read_dir(directory)? {
        let path = entry?.path();
        if path.is_file() && has_gguf_extension(&path) {
            tracing::debug!("Found model: {}", path.display());
            models.push(path);
        }
    }

    models.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(models)
}

/// Picks the model file for a session.
///
/// `model_main` from the workspace wins when set: a file is used as is, a
/// directory is scanned. Otherwise the model folder itself is scanned and the
/// first `.gguf` by name is used.
pub fn resolve_model_file(config: &SessionConfig) -> Result<PathBuf, ModelError> {
    let main = config.workspace.model_main.trim();
    let target = if main.is_empty() {
        config.model_folder.clone()
    } else {
        config.model_folder.join(main)
    };

    if target.is_file() {
        return Ok(target);
    }

    scan_models_directory(&target)?
        .into_iter()
        .next()
        .ok_or(ModelError::NotFound(target))
}
