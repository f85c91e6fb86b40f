//! Runtime configuration.
//!
//! Every section has a `Default` matching the appliance firmware, so a
//! config file only needs to name what it changes. Durations are stored as
//! plain second/millisecond fields and exposed as [`Duration`] accessors.

use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use lightbox_core::{ConfigError, CounterRange};

/// Listening socket parameters shared by both HTTP servers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// Pending-connection queue length.
    pub backlog: u32,

    /// Total bind attempts while the address is in use.
    pub bind_attempts: u32,

    pub bind_retry_delay_ms: u64,

    /// Accept wait; bounds how late a run-flag change is noticed.
    pub accept_timeout_ms: u64,

    /// Per-read deadline on accepted connections.
    pub recv_timeout_ms: u64,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            backlog: 5,
            bind_attempts: 5,
            bind_retry_delay_ms: 1000,
            accept_timeout_ms: 3000,
            recv_timeout_ms: 5000,
        }
    }
}

impl SocketConfig {
    pub fn bind_retry_delay(&self) -> Duration {
        Duration::from_millis(self.bind_retry_delay_ms)
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }
}

/// HTTP control server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address. `None` binds to the station address.
    pub bind_ip: Option<IpAddr>,

    pub port: u16,

    pub socket: SocketConfig,

    /// Bytes requested per receive.
    pub recv_chunk_size: usize,

    /// Bytes per write when streaming files.
    pub send_chunk_size: usize,

    /// Directory holding `index.html.gz`.
    pub web_root: PathBuf,

    pub upload_dir: PathBuf,

    /// Extension of the uploads removed by a factory reset.
    pub upload_extension: String,

    pub max_upload_files: usize,

    /// Used to find the boundary when the upload has no usable
    /// `Content-Type` header.
    pub boundary_prefix: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: None,
            port: 80,
            socket: SocketConfig::default(),
            recv_chunk_size: 2048,
            send_chunk_size: 1024,
            web_root: PathBuf::from("web"),
            upload_dir: PathBuf::from("images"),
            upload_extension: "ppm".to_string(),
            max_upload_files: 10,
            boundary_prefix: "----WebKitFormBoundary".to_string(),
        }
    }
}

/// First-run provisioning server and its access point.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    pub ap_ssid: String,
    pub ap_password: String,
    pub ap_address: Ipv4Addr,

    /// Bind address of the form server.
    pub bind_ip: IpAddr,

    pub port: u16,

    pub socket: SocketConfig,

    /// Path the form POSTs to.
    pub submission_path: String,

    /// Form page, relative to `web_root`.
    pub form_page: String,

    pub web_root: PathBuf,

    pub recv_chunk_size: usize,

    /// Upper bound on a submission body.
    pub max_body_bytes: usize,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            ap_ssid: "My Lightbox wifi setup".to_string(),
            ap_password: "lightbox".to_string(),
            ap_address: Ipv4Addr::new(192, 168, 4, 1),
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 80,
            socket: SocketConfig::default(),
            submission_path: "/internett".to_string(),
            form_page: "wifi_credentials.html".to_string(),
            web_root: PathBuf::from("web"),
            recv_chunk_size: 1024,
            max_body_bytes: 4096,
        }
    }
}

/// Station association.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    /// Wait budget of one `connect` call.
    pub max_wait_secs: u64,

    pub poll_interval_ms: u64,

    /// Pause between `connect` calls at boot.
    pub retry_delay_ms: u64,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            max_wait_secs: 20,
            poll_interval_ms: 1000,
            retry_delay_ms: 3000,
        }
    }
}

impl StationConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Serve/update time slicing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Preemption timer period.
    pub update_period_secs: u64,

    /// Refreshes are skipped below this much free memory.
    pub min_free_memory: usize,

    pub low_memory_wait_ms: u64,

    /// Pause after a failed cycle.
    pub error_backoff_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            update_period_secs: 30 * 60,
            min_free_memory: 70_000,
            low_memory_wait_ms: 3000,
            error_backoff_ms: 3000,
        }
    }
}

impl SchedulerConfig {
    pub fn update_period(&self) -> Duration {
        Duration::from_secs(self.update_period_secs)
    }

    pub fn low_memory_wait(&self) -> Duration {
        Duration::from_millis(self.low_memory_wait_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

/// On-disk locations of persisted state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoragePaths {
    /// Directory of the JSON documents (`setup`, `setup_backup`).
    pub data_dir: PathBuf,

    /// Encrypted credential blob, relative to `data_dir`.
    pub credentials_file: String,

    /// Crash log, relative to `data_dir`.
    pub crash_log_file: String,
}

impl Default for StoragePaths {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            credentials_file: "config.bin".to_string(),
            crash_log_file: "logg.txt".to_string(),
        }
    }
}

impl StoragePaths {
    pub fn credentials_path(&self) -> PathBuf {
        self.data_dir.join(&self.credentials_file)
    }

    pub fn crash_log_path(&self) -> PathBuf {
        self.data_dir.join(&self.crash_log_file)
    }
}

/// Whole-appliance configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub provisioning: ProvisioningConfig,
    pub station: StationConfig,
    pub scheduler: SchedulerConfig,
    pub storage: StoragePaths,
    pub counter: CounterRange,
}

impl AppConfig {
    /// Load from a JSON file; missing sections take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|e| ConfigError::InvalidData(e.to_string()))
    }
}
