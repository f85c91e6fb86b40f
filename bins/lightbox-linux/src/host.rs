//! Collaborators for running the control plane on a Linux host.

use std::fs;
use std::net::{IpAddr, Ipv4Addr};

use tracing::{debug, info};

use lightbox_core::{MemoryProbe, Radio, RadioError, SystemUpdater, UpdateError};

/// The host is already on a network; association succeeds immediately with
/// a fixed address.
pub struct HostRadio {
    address: IpAddr,
}

impl HostRadio {
    pub fn new(address: IpAddr) -> Self {
        Self { address }
    }
}

impl Radio for HostRadio {
    fn start_access_point(&self, ssid: &str, _password: &str, address: Ipv4Addr) -> Result<(), RadioError> {
        info!("Access point '{}' simulated at {}", ssid, address);
        Ok(())
    }

    fn stop_access_point(&self) -> Result<(), RadioError> {
        debug!("Access point stopped");
        Ok(())
    }

    fn begin_association(&self, ssid: &str, _password: &str, hostname: &str) -> Result<(), RadioError> {
        if ssid.len() > 32 {
            return Err(RadioError::InvalidCredentials(format!(
                "SSID is {} bytes, at most 32 allowed",
                ssid.len()
            )));
        }
        info!("Associating with '{}' as {}", ssid, hostname);
        Ok(())
    }

    fn is_associated(&self) -> bool {
        true
    }

    fn station_address(&self) -> Option<IpAddr> {
        Some(self.address)
    }
}

/// `MemAvailable` from `/proc/meminfo`.
pub struct MeminfoProbe;

impl MemoryProbe for MeminfoProbe {
    fn free_bytes(&self) -> usize {
        match fs::read_to_string("/proc/meminfo") {
            Ok(text) => parse_mem_available(&text).unwrap_or(usize::MAX),
            Err(e) => {
                debug!("/proc/meminfo unreadable: {}", e);
                usize::MAX
            }
        }
    }
}

fn parse_mem_available(meminfo: &str) -> Option<usize> {
    let line = meminfo.lines().find(|l| l.starts_with("MemAvailable:"))?;
    let kib: usize = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib.saturating_mul(1024))
}

/// Stands in for the time/weather fetchers, which are not part of the
/// control plane.
pub struct LoggingUpdater;

impl SystemUpdater for LoggingUpdater {
    fn refresh_system_data(&self) -> Result<(), UpdateError> {
        info!("System data refresh requested");
        Ok(())
    }

    fn refresh_weather(&self) -> Result<(), UpdateError> {
        info!("Weather refresh requested");
        Ok(())
    }
}
