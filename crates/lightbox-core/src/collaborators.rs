//! Capabilities the control plane consumes from the rest of the appliance.
//!
//! Rendering, the radio driver and the time/weather fetchers live outside
//! the control plane. They are reached only through these traits so that
//! the device build and the host build can plug in their own
//! implementations.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU8, Ordering};

use thiserror::Error;
use tracing::{debug, info};

use crate::counter::EventCounter;

/// Errors reported by a radio driver.
#[derive(Debug, Error)]
pub enum RadioError {
    /// The driver rejected the supplied credentials (length, encoding).
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Any other driver failure.
    #[error("Radio driver error: {0}")]
    Driver(String),
}

/// Errors reported by the system-data updater.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("Update failed: {0}")]
    Failed(String),
}

/// Display capability shared with the rendering context.
pub trait Display: Send + Sync {
    /// Clear the frame buffer.
    fn clear(&self);

    /// Push the frame buffer to the panel.
    fn show(&self);

    /// Scroll a line of text once.
    fn show_text(&self, text: &str);

    /// Set the brightness percentage (clamped to 0-100).
    fn change_brightness(&self, percent: u8);

    /// Move the event position by `delta` and return the new position.
    fn change_counter(&self, delta: i32) -> i32;
}

/// WiFi radio capability.
pub trait Radio: Send + Sync {
    /// Host a temporary access point at `address`.
    fn start_access_point(&self, ssid: &str, password: &str, address: Ipv4Addr) -> Result<(), RadioError>;

    /// Tear down the access point.
    fn stop_access_point(&self) -> Result<(), RadioError>;

    /// Start (or restart) associating with a network. Returns immediately.
    fn begin_association(&self, ssid: &str, password: &str, hostname: &str) -> Result<(), RadioError>;

    /// Association predicate polled by the station connector.
    fn is_associated(&self) -> bool;

    /// Address leased to the station interface, once associated.
    fn station_address(&self) -> Option<IpAddr>;
}

/// Location/time/weather refresh capability.
pub trait SystemUpdater: Send + Sync {
    /// Full refresh: location (if unknown), clock and weather.
    fn refresh_system_data(&self) -> Result<(), UpdateError>;

    /// Weather only.
    fn refresh_weather(&self) -> Result<(), UpdateError>;
}

/// Free heap probe.
pub trait MemoryProbe: Send + Sync {
    fn free_bytes(&self) -> usize;
}

/// Display that keeps state in memory and logs what it would draw.
///
/// Used on hosts without a panel and in tests.
#[derive(Debug)]
pub struct HeadlessDisplay {
    brightness: AtomicU8,
    counter: EventCounter,
}

impl HeadlessDisplay {
    pub fn new(counter: EventCounter) -> Self {
        Self {
            brightness: AtomicU8::new(100),
            counter,
        }
    }

    pub fn brightness(&self) -> u8 {
        self.brightness.load(Ordering::SeqCst)
    }

    pub fn counter(&self) -> &EventCounter {
        &self.counter
    }
}

impl Default for HeadlessDisplay {
    fn default() -> Self {
        Self::new(EventCounter::default())
    }
}

impl Display for HeadlessDisplay {
    fn clear(&self) {
        debug!("display: clear");
    }

    fn show(&self) {
        debug!("display: show");
    }

    fn show_text(&self, text: &str) {
        info!("display: {}", text);
    }

    fn change_brightness(&self, percent: u8) {
        let percent = percent.min(100);
        self.brightness.store(percent, Ordering::SeqCst);
        debug!("display: brightness {}%", percent);
    }

    fn change_counter(&self, delta: i32) -> i32 {
        let position = self.counter.adjust(delta);
        debug!("display: event position {}", position);
        position
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::CounterRange;

    #[test]
    fn test_brightness_is_clamped() {
        let display = HeadlessDisplay::default();
        display.change_brightness(250);
        assert_eq!(display.brightness(), 100);
        display.change_brightness(50);
        assert_eq!(display.brightness(), 50);
    }

    #[test]
    fn test_change_counter_delegates_to_counter() {
        let display = HeadlessDisplay::new(EventCounter::new(CounterRange::new(1, 3), 3));
        assert_eq!(display.change_counter(1), 1);
        assert_eq!(display.counter().get(), 1);
    }
}
