//! Station-mode WiFi association.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

use lightbox_core::{Radio, RadioError};

#[derive(Debug, Error)]
pub enum StationError {
    #[error("WiFi SSID cannot be empty")]
    EmptySsid,

    /// The radio keeps trying in the background; call `connect` again.
    #[error("Not associated after {waited:?}")]
    Timeout { waited: Duration },

    #[error(transparent)]
    Radio(#[from] RadioError),
}

/// Joins the home network through the [`Radio`] collaborator.
pub struct StationConnector {
    radio: Arc<dyn Radio>,
    poll_interval: Duration,
    address: Option<IpAddr>,
}

impl StationConnector {
    pub fn new(radio: Arc<dyn Radio>, poll_interval: Duration) -> Self {
        Self {
            radio,
            poll_interval,
            address: None,
        }
    }

    /// Last acquired station address.
    pub fn ip_address(&self) -> Option<IpAddr> {
        self.address
    }

    /// Associate and wait for an address, polling once per interval for up
    /// to `max_wait`.
    pub async fn connect(
        &mut self,
        ssid: &str,
        password: &str,
        hostname: &str,
        max_wait: Duration,
    ) -> Result<IpAddr, StationError> {
        if ssid.is_empty() {
            return Err(StationError::EmptySsid);
        }
        if let Some(ip) = self.current_address() {
            self.address = Some(ip);
            return Ok(ip);
        }

        if password.is_empty() {
            info!("WiFi password is empty, using open network");
        }
        info!("Connecting to '{}' as {}...", ssid, hostname);
        self.radio.begin_association(ssid, password, hostname)?;

        let started = Instant::now();
        loop {
            if let Some(ip) = self.current_address() {
                info!("WiFi connected, IP address {}", ip);
                self.address = Some(ip);
                return Ok(ip);
            }
            let waited = started.elapsed();
            if waited >= max_wait {
                warn!("'{}' not associated after {:?}", ssid, waited);
                return Err(StationError::Timeout { waited });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    fn current_address(&self) -> Option<IpAddr> {
        if self.radio.is_associated() {
            self.radio.station_address()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Associates after a fixed number of polls.
    struct SlowRadio {
        polls_needed: u32,
        polls: AtomicU32,
        begins: AtomicU32,
    }

    impl SlowRadio {
        fn new(polls_needed: u32) -> Self {
            Self {
                polls_needed,
                polls: AtomicU32::new(0),
                begins: AtomicU32::new(0),
            }
        }
    }

    impl Radio for SlowRadio {
        fn start_access_point(&self, _: &str, _: &str, _: Ipv4Addr) -> Result<(), RadioError> {
            Ok(())
        }

        fn stop_access_point(&self) -> Result<(), RadioError> {
            Ok(())
        }

        fn begin_association(&self, _: &str, _: &str, _: &str) -> Result<(), RadioError> {
            self.begins.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn is_associated(&self) -> bool {
            self.polls.fetch_add(1, Ordering::SeqCst) >= self.polls_needed
        }

        fn station_address(&self) -> Option<IpAddr> {
            Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_polls_until_associated() {
        let radio = Arc::new(SlowRadio::new(4));
        let mut station = StationConnector::new(radio.clone(), Duration::from_secs(1));

        let ip = station
            .connect("home", "pw", "mylightbox", Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(ip, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)));
        assert_eq!(station.ip_address(), Some(ip));
        assert_eq!(radio.begins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_times_out_without_error() {
        let radio = Arc::new(SlowRadio::new(u32::MAX));
        let mut station = StationConnector::new(radio, Duration::from_secs(1));

        let result = station
            .connect("home", "pw", "mylightbox", Duration::from_secs(3))
            .await;

        match result {
            Err(StationError::Timeout { waited }) => assert!(waited >= Duration::from_secs(3)),
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_eq!(station.ip_address(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_when_associated_skips_radio() {
        let radio = Arc::new(SlowRadio::new(2));
        let mut station = StationConnector::new(radio.clone(), Duration::from_secs(1));

        let first = station
            .connect("home", "pw", "mylightbox", Duration::from_secs(10))
            .await
            .unwrap();
        let second = station
            .connect("home", "pw", "mylightbox", Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(radio.begins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_after_timeout_reuses_radio() {
        let radio = Arc::new(SlowRadio::new(5));
        let mut station = StationConnector::new(radio.clone(), Duration::from_secs(1));

        let result = station
            .connect("home", "pw", "mylightbox", Duration::from_secs(2))
            .await;
        assert!(matches!(result, Err(StationError::Timeout { .. })));
        assert_eq!(radio.begins.load(Ordering::SeqCst), 1);

        let ip = station
            .connect("home", "pw", "mylightbox", Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(ip, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)));
        assert_eq!(station.ip_address(), Some(ip));
        assert_eq!(radio.begins.load(Ordering::SeqCst), 2);
        assert_eq!(radio.polls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_empty_ssid_never_reaches_radio() {
        let radio = Arc::new(SlowRadio::new(0));
        let mut station = StationConnector::new(radio.clone(), Duration::from_millis(1));

        let result = station.connect("", "pw", "host", Duration::from_secs(1)).await;

        assert!(matches!(result, Err(StationError::EmptySsid)));
        assert_eq!(radio.begins.load(Ordering::SeqCst), 0);
    }
}
