// src/utils/fs.rs
//! Filesystem helpers for worker and tenant directories

use crate::utils::errors::{FleetError, Result};
use std::io::ErrorKind;
use std::path::Path;
use tracing::debug;

/// Create a single directory, treating "already exists" as success
pub fn ensure_dir(path: &Path) -> Result<()> {
    match std::fs::create_dir(path) {
        Ok(()) => {
            debug!("Created directory {:?}", path);
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(FleetError::StorageFailed(format!(
            "Failed to create directory {:?}: {}",
            path, e
        ))),
    }
}

/// Recursively delete a directory tree; a missing tree is not an error
pub async fn remove_tree(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {
            debug!("Removed {:?}", path);
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(FleetError::StorageFailed(format!(
            "Failed to remove {:?}: {}",
            path, e
        ))),
    }
}
