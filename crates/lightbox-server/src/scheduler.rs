//! Time slicing of the control-plane context between serving HTTP and
//! refreshing system data.
//!
//! The task indicator in [`ControlFlags`] picks the duty of each iteration.
//! A periodic timer is the only preemption: it forces the indicator to
//! [`Duty::Update`] and clears the run flag, so the control server returns
//! at its next accept timeout.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use lightbox_core::{ControlFlags, Duty, MemoryProbe, SystemUpdater, UpdateError};

use crate::config::SchedulerConfig;
use crate::control::{ControlServer, ServerError};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Update(#[from] UpdateError),
}

/// What one scheduler iteration did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// A serve cycle ran until preempted.
    Served,
    /// The timer fired between reading the indicator and arming the server.
    Preempted,
    FullRefresh,
    WeatherRefresh,
    /// Not enough free memory; waited instead of refreshing.
    LowMemory,
}

/// Top-level loop of the control-plane context.
pub struct TaskScheduler {
    config: SchedulerConfig,
    server: ControlServer,
    flags: Arc<ControlFlags>,
    updater: Arc<dyn SystemUpdater>,
    memory: Arc<dyn MemoryProbe>,
    full_refresh_next: bool,
}

impl TaskScheduler {
    pub fn new(
        config: SchedulerConfig,
        server: ControlServer,
        updater: Arc<dyn SystemUpdater>,
        memory: Arc<dyn MemoryProbe>,
    ) -> Self {
        let flags = server.flags();
        Self {
            config,
            server,
            flags,
            updater,
            memory,
            full_refresh_next: true,
        }
    }

    pub fn flags(&self) -> Arc<ControlFlags> {
        self.flags.clone()
    }

    pub fn server(&self) -> &ControlServer {
        &self.server
    }

    pub fn server_mut(&mut self) -> &mut ControlServer {
        &mut self.server
    }

    /// Start the periodic preemption timer for this scheduler.
    pub fn spawn_preemption_timer(&self) -> JoinHandle<()> {
        spawn_preemption_timer(self.flags.clone(), self.config.update_period())
    }

    /// Run one iteration.
    pub async fn step(&mut self) -> Result<StepOutcome, SchedulerError> {
        match self.flags.duty() {
            Duty::Serve => {
                if !self.flags.begin_serve() {
                    return Ok(StepOutcome::Preempted);
                }
                if let Err(e) = self.server.serve().await {
                    self.flags.stop();
                    return Err(e.into());
                }
                Ok(StepOutcome::Served)
            }
            Duty::Update => {
                let free = self.memory.free_bytes();
                if free <= self.config.min_free_memory {
                    warn!(
                        "Only {} bytes free (need {}), postponing update",
                        free, self.config.min_free_memory
                    );
                    tokio::time::sleep(self.config.low_memory_wait()).await;
                    return Ok(StepOutcome::LowMemory);
                }

                let full = self.full_refresh_next;
                self.full_refresh_next = !full;
                let result = if full {
                    info!("Refreshing system data");
                    self.updater.refresh_system_data()
                } else {
                    info!("Refreshing weather");
                    self.updater.refresh_weather()
                };
                self.flags.set_duty(Duty::Serve);
                result?;

                Ok(if full {
                    StepOutcome::FullRefresh
                } else {
                    StepOutcome::WeatherRefresh
                })
            }
        }
    }

    /// Loop forever, backing off after failed iterations.
    pub async fn run(&mut self) {
        loop {
            match self.step().await {
                Ok(outcome) => debug!("Scheduler step: {:?}", outcome),
                Err(e) => {
                    error!("Scheduler step failed: {}", e);
                    tokio::time::sleep(self.config.error_backoff()).await;
                }
            }
        }
    }
}

/// Preempt `flags` every `period`, starting one period from now.
pub fn spawn_preemption_timer(flags: Arc<ControlFlags>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            debug!("Update timer fired");
            flags.preempt();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use lightbox_core::{ConfigError, ConfigStore, HeadlessDisplay, Radio, RadioError};
    use serde_json::Value;

    use crate::config::{ServerConfig, SocketConfig};
    use crate::control::ServerContext;
    use crate::station::StationConnector;

    struct NoRadio;

    impl Radio for NoRadio {
        fn start_access_point(&self, _: &str, _: &str, _: Ipv4Addr) -> Result<(), RadioError> {
            Ok(())
        }
        fn stop_access_point(&self) -> Result<(), RadioError> {
            Ok(())
        }
        fn begin_association(&self, _: &str, _: &str, _: &str) -> Result<(), RadioError> {
            Ok(())
        }
        fn is_associated(&self) -> bool {
            false
        }
        fn station_address(&self) -> Option<IpAddr> {
            None
        }
    }

    struct NoStore;

    impl ConfigStore for NoStore {
        fn get_config(&self, name: &str) -> Result<Value, ConfigError> {
            Err(ConfigError::NotFound(name.to_string()))
        }
        fn save_config(&self, _: &str, _: &Value) -> Result<(), ConfigError> {
            Ok(())
        }
        fn has_config(&self, _: &str) -> bool {
            false
        }
    }

    #[derive(Default)]
    struct RecordingUpdater {
        calls: Mutex<Vec<&'static str>>,
        fail: bool,
    }

    impl SystemUpdater for RecordingUpdater {
        fn refresh_system_data(&self) -> Result<(), UpdateError> {
            self.calls.lock().unwrap().push("full");
            if self.fail {
                return Err(UpdateError::Failed("offline".into()));
            }
            Ok(())
        }

        fn refresh_weather(&self) -> Result<(), UpdateError> {
            self.calls.lock().unwrap().push("weather");
            Ok(())
        }
    }

    struct FixedMemory(AtomicUsize);

    impl MemoryProbe for FixedMemory {
        fn free_bytes(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn scheduler(updater: Arc<RecordingUpdater>, free: usize) -> TaskScheduler {
        let config = ServerConfig {
            bind_ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            port: 0,
            socket: SocketConfig {
                accept_timeout_ms: 20,
                ..SocketConfig::default()
            },
            ..ServerConfig::default()
        };
        let ctx = ServerContext {
            config,
            store: Arc::new(NoStore),
            display: Arc::new(HeadlessDisplay::default()),
            updater: updater.clone(),
        };
        let station = StationConnector::new(Arc::new(NoRadio), Duration::from_millis(10));
        let server = ControlServer::new(ctx, station, Arc::new(ControlFlags::default()));
        TaskScheduler::new(
            SchedulerConfig {
                low_memory_wait_ms: 10,
                ..SchedulerConfig::default()
            },
            server,
            updater,
            Arc::new(FixedMemory(AtomicUsize::new(free))),
        )
    }

    #[tokio::test]
    async fn test_updates_alternate_full_and_weather() {
        let updater = Arc::new(RecordingUpdater::default());
        let mut scheduler = scheduler(updater.clone(), 100_000);
        let flags = scheduler.flags();

        assert_eq!(flags.duty(), Duty::Update);
        assert_eq!(scheduler.step().await.unwrap(), StepOutcome::FullRefresh);
        assert_eq!(flags.duty(), Duty::Serve);

        flags.set_duty(Duty::Update);
        assert_eq!(scheduler.step().await.unwrap(), StepOutcome::WeatherRefresh);
        flags.set_duty(Duty::Update);
        assert_eq!(scheduler.step().await.unwrap(), StepOutcome::FullRefresh);

        assert_eq!(*updater.calls.lock().unwrap(), vec!["full", "weather", "full"]);
    }

    #[tokio::test]
    async fn test_low_memory_postpones_update() {
        let updater = Arc::new(RecordingUpdater::default());
        let mut scheduler = scheduler(updater.clone(), 70_000);

        assert_eq!(scheduler.step().await.unwrap(), StepOutcome::LowMemory);
        assert_eq!(scheduler.flags().duty(), Duty::Update);
        assert!(updater.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_refresh_still_returns_to_serve() {
        let updater = Arc::new(RecordingUpdater {
            fail: true,
            ..RecordingUpdater::default()
        });
        let mut scheduler = scheduler(updater, 100_000);

        assert!(matches!(
            scheduler.step().await,
            Err(SchedulerError::Update(_))
        ));
        assert_eq!(scheduler.flags().duty(), Duty::Serve);
    }

    #[tokio::test]
    async fn test_timer_preempts_serve_cycle() {
        let updater = Arc::new(RecordingUpdater::default());
        let mut scheduler = scheduler(updater, 100_000);
        let flags = scheduler.flags();
        flags.set_duty(Duty::Serve);

        let timer = spawn_preemption_timer(flags.clone(), Duration::from_millis(100));
        let outcome = tokio::time::timeout(Duration::from_secs(5), scheduler.step())
            .await
            .expect("serve cycle must end after preemption")
            .unwrap();
        timer.abort();

        assert_eq!(outcome, StepOutcome::Served);
        assert_eq!(flags.duty(), Duty::Update);
        assert!(!flags.is_running());
        assert!(scheduler.server().local_addr().is_some());
    }
}
