//! Persisted configuration documents.
//!
//! Configuration lives in named JSON documents behind the [`ConfigStore`]
//! trait:
//! - `setup`: the live [`SetupConfig`]
//! - `setup_backup`: the factory copy restored by `revert` and factory reset
//!
//! The trait is object-safe and speaks `serde_json::Value`; typed access
//! goes through [`ConfigStoreExt`]. All methods are synchronous so that the
//! same store works on the device and on a host.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

/// Name of the live setup document.
pub const SETUP: &str = "setup";

/// Name of the factory setup document.
pub const SETUP_BACKUP: &str = "setup_backup";

/// Hostname used when the user never picked one.
pub const DEFAULT_HOSTNAME: &str = "mylightbox";

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The requested document was not found.
    #[error("Configuration not found: {0}")]
    NotFound(String),

    /// Failed to read a document.
    #[error("Read error: {0}")]
    ReadError(String),

    /// Failed to write a document.
    #[error("Write error: {0}")]
    WriteError(String),

    /// Document content is invalid.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// A field update carried a value of the wrong type or range.
    #[error("Invalid value {value:?} for field {field}")]
    InvalidField { field: String, value: String },
}

/// Named document storage.
pub trait ConfigStore: Send + Sync {
    /// Load a document by name.
    fn get_config(&self, name: &str) -> Result<Value, ConfigError>;

    /// Replace a document.
    fn save_config(&self, name: &str, data: &Value) -> Result<(), ConfigError>;

    /// Check whether a document exists.
    fn has_config(&self, name: &str) -> bool;
}

/// Typed helpers over any [`ConfigStore`].
pub trait ConfigStoreExt: ConfigStore {
    fn load<T: DeserializeOwned>(&self, name: &str) -> Result<T, ConfigError> {
        let value = self.get_config(name)?;
        serde_json::from_value(value).map_err(|e| ConfigError::InvalidData(e.to_string()))
    }

    fn store<T: Serialize>(&self, name: &str, value: &T) -> Result<(), ConfigError> {
        let value =
            serde_json::to_value(value).map_err(|e| ConfigError::WriteError(e.to_string()))?;
        self.save_config(name, &value)
    }

    fn load_setup(&self) -> Result<SetupConfig, ConfigError> {
        self.load(SETUP)
    }

    fn save_setup(&self, setup: &SetupConfig) -> Result<(), ConfigError> {
        self.store(SETUP, setup)
    }

    /// Copy `setup_backup` over `setup` without reinterpreting it.
    fn restore_setup_backup(&self) -> Result<(), ConfigError> {
        let backup = self.get_config(SETUP_BACKUP)?;
        self.save_config(SETUP, &backup)
    }
}

impl<S: ConfigStore + ?Sized> ConfigStoreExt for S {}

/// Documents stored as `<root>/<name>.json`.
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    root: PathBuf,
}

impl FileConfigStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.json", name))
    }
}

impl ConfigStore for FileConfigStore {
    fn get_config(&self, name: &str) -> Result<Value, ConfigError> {
        let path = self.path_for(name);
        let text = fs::read_to_string(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ConfigError::NotFound(name.to_string()),
            _ => ConfigError::ReadError(format!("{}: {}", path.display(), e)),
        })?;
        serde_json::from_str(&text).map_err(|e| ConfigError::InvalidData(format!("{}: {}", name, e)))
    }

    fn save_config(&self, name: &str, data: &Value) -> Result<(), ConfigError> {
        fs::create_dir_all(&self.root).map_err(|e| ConfigError::WriteError(e.to_string()))?;
        let path = self.path_for(name);
        let tmp = path.with_extension("json.tmp");
        let text =
            serde_json::to_string_pretty(data).map_err(|e| ConfigError::WriteError(e.to_string()))?;
        fs::write(&tmp, text).map_err(|e| ConfigError::WriteError(e.to_string()))?;
        fs::rename(&tmp, &path).map_err(|e| ConfigError::WriteError(e.to_string()))?;
        debug!("saved configuration {}", path.display());
        Ok(())
    }

    fn has_config(&self, name: &str) -> bool {
        self.path_for(name).is_file()
    }
}

// ============================================================================
// Setup document
// ============================================================================

/// Geographic location, filled in from an IP lookup or by the user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,

    /// Offset from UTC in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone_offset: Option<i32>,

    #[serde(rename = "countryCode", skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,

    /// Fields not modelled above, kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The `setup` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupConfig {
    #[serde(default)]
    pub location: Location,

    #[serde(default = "default_units")]
    pub units: String,

    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Credential cipher key.
    #[serde(default)]
    pub key: String,

    /// User override of the timezone offset, `false` on disk when unset.
    #[serde(default, with = "manual_time_zone")]
    pub manual_time_zone: Option<i32>,

    #[serde(default = "default_brightness")]
    pub brightness: u8,

    /// Fields not modelled above (API keys, ...), kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_units() -> String {
    "metric".to_string()
}

fn default_hostname() -> String {
    DEFAULT_HOSTNAME.to_string()
}

fn default_brightness() -> u8 {
    100
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            location: Location::default(),
            units: default_units(),
            hostname: default_hostname(),
            key: String::new(),
            manual_time_zone: None,
            brightness: default_brightness(),
            extra: Map::new(),
        }
    }
}

impl SetupConfig {
    /// Apply one `key=value` update from the settings endpoint.
    ///
    /// Known fields are parsed to their type. Unknown keys only overwrite
    /// entries that already exist in the document. Returns whether anything
    /// changed.
    pub fn apply_change(&mut self, field: &str, raw: &str) -> Result<bool, ConfigError> {
        let invalid = || ConfigError::InvalidField {
            field: field.to_string(),
            value: raw.to_string(),
        };

        match field {
            "type" | "key" => return Ok(false),
            "brightness" => {
                let value: u8 = raw.parse().map_err(|_| invalid())?;
                if value > 100 {
                    return Err(invalid());
                }
                self.brightness = value;
            }
            "units" => self.units = raw.to_string(),
            "hostname" => {
                if raw.is_empty() {
                    return Err(invalid());
                }
                self.hostname = raw.to_string();
            }
            "timezone_offset" => {
                self.manual_time_zone = Some(raw.parse().map_err(|_| invalid())?);
            }
            "lat" => self.location.lat = Some(raw.parse().map_err(|_| invalid())?),
            "lon" => self.location.lon = Some(raw.parse().map_err(|_| invalid())?),
            "timezone" => self.location.timezone = Some(raw.to_string()),
            "countryCode" => self.location.country_code = Some(raw.to_string()),
            other => {
                if let Some(slot) = self.extra.get_mut(other) {
                    *slot = loose_value(raw);
                } else if let Some(slot) = self.location.extra.get_mut(other) {
                    *slot = loose_value(raw);
                } else {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}

/// Integer if the text is all digits, string otherwise.
fn loose_value(raw: &str) -> Value {
    if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(n) = raw.parse::<u64>() {
            return Value::from(n);
        }
    }
    Value::String(raw.to_string())
}

mod manual_time_zone {
    use super::*;
    use serde::de::Error as _;

    pub fn serialize<S: Serializer>(value: &Option<i32>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(offset) => serializer.serialize_i32(*offset),
            None => serializer.serialize_bool(false),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i32>, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Null | Value::Bool(false) => Ok(None),
            Value::Number(n) => n
                .as_i64()
                .and_then(|n| i32::try_from(n).ok())
                .map(Some)
                .ok_or_else(|| D::Error::custom("manual_time_zone out of range")),
            other => Err(D::Error::custom(format!("invalid manual_time_zone: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::sync::RwLock;

    /// In-memory storage for testing.
    struct MemoryConfigStore {
        data: RwLock<HashMap<String, Value>>,
    }

    impl MemoryConfigStore {
        fn new() -> Self {
            Self {
                data: RwLock::new(HashMap::new()),
            }
        }
    }

    impl ConfigStore for MemoryConfigStore {
        fn get_config(&self, name: &str) -> Result<Value, ConfigError> {
            self.data
                .read()
                .unwrap()
                .get(name)
                .cloned()
                .ok_or_else(|| ConfigError::NotFound(name.to_string()))
        }

        fn save_config(&self, name: &str, data: &Value) -> Result<(), ConfigError> {
            self.data.write().unwrap().insert(name.to_string(), data.clone());
            Ok(())
        }

        fn has_config(&self, name: &str) -> bool {
            self.data.read().unwrap().contains_key(name)
        }
    }

    fn sample_setup() -> Value {
        serde_json::json!({
            "location": {
                "lat": 59.91,
                "lon": 10.75,
                "timezone": "Europe/Oslo",
                "timezone_offset": 3600,
                "countryCode": "NO"
            },
            "units": "metric",
            "hostname": "mylightbox",
            "key": "0123456789abcdef",
            "manual_time_zone": false,
            "openweathermap_api_key": "abc123",
            "refresh": 10
        })
    }

    #[test]
    fn test_setup_round_trip_keeps_unknown_fields() {
        let setup: SetupConfig = serde_json::from_value(sample_setup()).unwrap();
        assert_eq!(setup.location.country_code.as_deref(), Some("NO"));
        assert_eq!(setup.manual_time_zone, None);
        assert_eq!(setup.extra["openweathermap_api_key"], "abc123");

        let back = serde_json::to_value(&setup).unwrap();
        assert_eq!(back["manual_time_zone"], false);
        assert_eq!(back["openweathermap_api_key"], "abc123");
        assert_eq!(back["location"]["countryCode"], "NO");
    }

    #[test]
    fn test_empty_location_is_accepted() {
        let setup: SetupConfig =
            serde_json::from_value(serde_json::json!({"location": {}, "key": "k"})).unwrap();
        assert_eq!(setup.location, Location::default());
        assert_eq!(setup.hostname, DEFAULT_HOSTNAME);
    }

    #[test]
    fn test_apply_change_typed_fields() {
        let mut setup: SetupConfig = serde_json::from_value(sample_setup()).unwrap();

        assert!(setup.apply_change("brightness", "50").unwrap());
        assert!(setup.apply_change("timezone_offset", "-7200").unwrap());
        assert!(setup.apply_change("units", "imperial").unwrap());
        assert!(setup.apply_change("refresh", "30").unwrap());
        assert!(!setup.apply_change("unknown", "1").unwrap());
        assert!(!setup.apply_change("key", "stolen").unwrap());

        assert_eq!(setup.brightness, 50);
        assert_eq!(setup.manual_time_zone, Some(-7200));
        assert_eq!(setup.units, "imperial");
        assert_eq!(setup.extra["refresh"], 30);
        assert_eq!(setup.key, "0123456789abcdef");
    }

    #[test]
    fn test_apply_change_rejects_bad_values() {
        let mut setup = SetupConfig::default();
        assert!(matches!(
            setup.apply_change("brightness", "bright"),
            Err(ConfigError::InvalidField { .. })
        ));
        assert!(setup.apply_change("brightness", "101").is_err());
        assert!(setup.apply_change("lat", "north").is_err());
        assert_eq!(setup.brightness, 100);
    }

    #[test]
    fn test_restore_backup_is_verbatim() {
        let store = MemoryConfigStore::new();
        let backup = sample_setup();
        store.save_config(SETUP_BACKUP, &backup).unwrap();
        store.store(SETUP, &SetupConfig::default()).unwrap();

        store.restore_setup_backup().unwrap();

        assert_eq!(store.get_config(SETUP).unwrap(), backup);
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FileConfigStore::new(dir.path().join("data"));

        assert!(!store.has_config(SETUP));
        assert!(matches!(store.get_config(SETUP), Err(ConfigError::NotFound(_))));

        store.save_config(SETUP, &sample_setup()).unwrap();
        assert!(store.has_config(SETUP));
        assert_eq!(store.get_config(SETUP).unwrap(), sample_setup());

        let setup = store.load_setup().unwrap();
        assert_eq!(setup.location.timezone.as_deref(), Some("Europe/Oslo"));
    }

    #[test]
    fn test_file_store_reports_corrupt_document() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("setup.json"), "{not json").unwrap();
        let store = FileConfigStore::new(dir.path());

        assert!(matches!(store.get_config(SETUP), Err(ConfigError::InvalidData(_))));
    }
}
