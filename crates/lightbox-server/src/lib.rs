//! # lightbox-server
//!
//! tokio runtime of the lightbox control plane:
//! - [`socket`]: bind/listen/accept with bounded retry
//! - [`provisioning`]: first-run access point and credential form
//! - [`station`]: association with the home network
//! - [`control`]: HTTP control server with streaming uploads
//! - [`scheduler`]: serve/update time slicing with timer preemption
//! - [`reset`] and [`crash_log`]: maintenance helpers used at boot

pub mod config;
pub mod control;
pub mod crash_log;
pub mod provisioning;
pub mod reset;
pub mod scheduler;
pub mod socket;
pub mod station;

pub use config::{
    AppConfig, ProvisioningConfig, SchedulerConfig, ServerConfig, SocketConfig, StationConfig,
    StoragePaths,
};
pub use control::{ControlServer, HandlerError, Reply, ServerContext, ServerError, UploadSession};
pub use crash_log::CrashLog;
pub use provisioning::{ProvisioningError, ProvisioningServer, ProvisioningState};
pub use reset::{factory_reset, ResetError};
pub use scheduler::{spawn_preemption_timer, SchedulerError, StepOutcome, TaskScheduler};
pub use socket::{AcceptOutcome, Connection, SocketError, SocketManager};
pub use station::{StationConnector, StationError};
