//! Factory reset.

use std::fs;
use std::io;
use std::path::Path;

use thiserror::Error;
use tracing::{info, warn};

use lightbox_core::{
    ensure_cipher_key, ConfigError, ConfigStore, ConfigStoreExt, CredentialError, CredentialVault,
};

#[derive(Debug, Error)]
pub enum ResetError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Credentials(#[from] CredentialError),

    #[error("Failed to clear uploads: {0}")]
    Io(#[from] io::Error),
}

/// Restore the factory setup, forget the WiFi credentials and delete the
/// stored uploads. Returns the number of files removed.
pub fn factory_reset(
    store: &dyn ConfigStore,
    vault: &CredentialVault,
    upload_dir: &Path,
    upload_extension: &str,
) -> Result<usize, ResetError> {
    store.restore_setup_backup()?;
    // The factory copy may carry no key; credentials are re-encrypted under
    // whatever key `setup` ends up with.
    let key = ensure_cipher_key(store)?;
    vault.clear(key.as_bytes())?;

    let removed = remove_uploads(upload_dir, upload_extension)?;
    info!("Factory reset done, {} uploads removed", removed);
    Ok(removed)
}

fn remove_uploads(dir: &Path, extension: &str) -> io::Result<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let mut removed = 0;
    for entry in entries {
        let path = entry?.path();
        let matches = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(extension));
        if matches && path.is_file() {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!("Could not delete {}: {}", path.display(), e),
            }
        }
    }
    Ok(removed)
}
