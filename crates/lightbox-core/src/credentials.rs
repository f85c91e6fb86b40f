//! Encrypted WiFi credential storage.
//!
//! Credentials are kept in a single blob file holding the JSON document
//! `{"wifi_credentials": {"SSID": ..., "PASSWORD": ...}}`, encrypted with the
//! [`Cipher`] collaborator under the key stored in the `setup` document.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cipher::Cipher;
use crate::config::{ConfigError, ConfigStore, ConfigStoreExt, SetupConfig};

/// Errors from the credential vault.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Credential file error: {0}")]
    Io(#[from] io::Error),

    #[error("Credential document is corrupt: {0}")]
    Corrupt(String),

    #[error("WiFi SSID cannot be empty")]
    EmptySsid,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Station network credentials.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiCredentials {
    #[serde(rename = "SSID")]
    pub ssid: String,

    /// Empty for open networks.
    #[serde(rename = "PASSWORD")]
    pub password: String,
}

impl WifiCredentials {
    pub fn new(ssid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            ssid: ssid.into(),
            password: password.into(),
        }
    }

    /// Usable credentials name a network.
    pub fn is_configured(&self) -> bool {
        !self.ssid.is_empty()
    }
}

impl fmt::Debug for WifiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WifiCredentials")
            .field("ssid", &self.ssid)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialDocument {
    #[serde(default)]
    wifi_credentials: WifiCredentials,

    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Reads and writes the encrypted credential blob.
#[derive(Clone)]
pub struct CredentialVault {
    path: PathBuf,
    cipher: Arc<dyn Cipher>,
}

impl CredentialVault {
    pub fn new(path: impl Into<PathBuf>, cipher: Arc<dyn Cipher>) -> Self {
        Self {
            path: path.into(),
            cipher,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load credentials. `Ok(None)` when nothing usable has been saved.
    pub fn load(&self, key: &[u8]) -> Result<Option<WifiCredentials>, CredentialError> {
        let Some(document) = self.read_document(key)? else {
            return Ok(None);
        };
        let credentials = document.wifi_credentials;
        Ok(credentials.is_configured().then_some(credentials))
    }

    /// Persist credentials, keeping any other fields of the document.
    pub fn save(&self, key: &[u8], credentials: &WifiCredentials) -> Result<(), CredentialError> {
        if !credentials.is_configured() {
            return Err(CredentialError::EmptySsid);
        }
        self.write_credentials(key, credentials.clone())?;
        info!("saved WiFi credentials for '{}'", credentials.ssid);
        Ok(())
    }

    /// Blank the stored credentials.
    pub fn clear(&self, key: &[u8]) -> Result<(), CredentialError> {
        self.write_credentials(key, WifiCredentials::default())?;
        info!("cleared WiFi credentials");
        Ok(())
    }

    fn write_credentials(
        &self,
        key: &[u8],
        credentials: WifiCredentials,
    ) -> Result<(), CredentialError> {
        let mut document = match self.read_document(key) {
            Ok(Some(document)) => document,
            Ok(None) => CredentialDocument::default(),
            Err(e) => {
                warn!("replacing unreadable credential document: {}", e);
                CredentialDocument::default()
            }
        };
        document.wifi_credentials = credentials;

        let plain =
            serde_json::to_vec(&document).map_err(|e| CredentialError::Corrupt(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, self.cipher.encrypt(&plain, key))?;
        Ok(())
    }

    fn read_document(&self, key: &[u8]) -> Result<Option<CredentialDocument>, CredentialError> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if raw.is_empty() {
            return Ok(None);
        }

        let decrypted = self.cipher.decrypt(&raw, key);
        match serde_json::from_slice(&decrypted) {
            Ok(document) => Ok(Some(document)),
            Err(decrypt_err) => {
                // Factory images ship the document unencrypted.
                serde_json::from_slice(&raw)
                    .map(|document| {
                        debug!("credential document was stored in plain text");
                        Some(document)
                    })
                    .map_err(|_| CredentialError::Corrupt(decrypt_err.to_string()))
            }
        }
    }
}

impl fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialVault")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Return the cipher key from `setup`, generating and persisting one if the
/// document has none.
pub fn ensure_cipher_key(store: &dyn ConfigStore) -> Result<String, ConfigError> {
    let mut setup = match store.load_setup() {
        Ok(setup) => setup,
        Err(ConfigError::NotFound(_)) => SetupConfig::default(),
        Err(e) => return Err(e),
    };
    if setup.key.is_empty() {
        setup.key = uuid::Uuid::new_v4().simple().to_string();
        store.save_setup(&setup)?;
        info!("generated new credential key");
    }
    Ok(setup.key)
}
