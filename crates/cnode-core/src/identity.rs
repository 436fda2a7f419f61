//! Node identity — a stable id stamped on every command this node originates.
//!
//! Generated once on first run and persisted, so a node keeps its id across
//! restarts. An explicit id in the config bypasses the file.

use std::path::{Path, PathBuf};

use rand::RngCore;

use crate::config::IdentityConfig;
use crate::wire::MAX_NODE_ID_LEN;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("node id in {0} is empty")]
    Empty(PathBuf),
    #[error("node id is {0} bytes, maximum {}", MAX_NODE_ID_LEN)]
    TooLong(usize),
}

/// Resolve the node id from config: explicit value first, then the id file.
pub fn resolve(config: &IdentityConfig) -> Result<String, IdentityError> {
    if !config.node_id.is_empty() {
        check_len(&config.node_id)?;
        return Ok(config.node_id.clone());
    }
    load_or_create(&config.node_id_path)
}

/// Read the id stored at `path`, generating and persisting one if absent.
pub fn load_or_create(path: &Path) -> Result<String, IdentityError> {
    if path.exists() {
        let text = std::fs::read_to_string(path)
            .map_err(|e| IdentityError::ReadFailed(path.to_path_buf(), e))?;
        let id = text.trim();
        if id.is_empty() {
            return Err(IdentityError::Empty(path.to_path_buf()));
        }
        check_len(id)?;
        return Ok(id.to_string());
    }

    let id = generate();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| IdentityError::WriteFailed(path.to_path_buf(), e))?;
    }
    std::fs::write(path, format!("{id}\n"))
        .map_err(|e| IdentityError::WriteFailed(path.to_path_buf(), e))?;
    tracing::info!(node_id = %id, path = %path.display(), "generated node id");
    Ok(id)
}

/// Random 128-bit id, hex-encoded.
pub fn generate() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn check_len(id: &str) -> Result<(), IdentityError> {
    if id.len() > MAX_NODE_ID_LEN {
        return Err(IdentityError::TooLong(id.len()));
    }
    Ok(())
}
