//! # lightbox-core
//!
//! Core lightbox control-plane model and logic.
//!
//! This crate provides:
//! - Persisted configuration documents and the `ConfigStore` abstraction
//! - Encrypted WiFi credential storage
//! - Collaborator capabilities (display, radio, system updates, memory)
//! - Shared scheduling flags between execution contexts
//! - HTTP request classification, route table and response headers
//! - A streaming multipart/form-data parser
//!
//! This crate is intentionally runtime-agnostic and contains no async code,
//! so the same logic serves the host build and a device build.

pub mod cipher;
pub mod collaborators;
pub mod config;
pub mod counter;
pub mod credentials;
pub mod multipart;
pub mod request;
pub mod response;
pub mod routes;
pub mod schedule;

pub use cipher::{Cipher, XorCipher};
pub use collaborators::{
    Display, HeadlessDisplay, MemoryProbe, Radio, RadioError, SystemUpdater, UpdateError,
};
pub use config::{
    ConfigError, ConfigStore, ConfigStoreExt, FileConfigStore, Location, SetupConfig,
    DEFAULT_HOSTNAME, SETUP, SETUP_BACKUP,
};
pub use counter::{CounterRange, EventCounter, SLEEP_POSITION};
pub use credentials::{ensure_cipher_key, CredentialError, CredentialVault, WifiCredentials};
pub use multipart::{MultipartError, MultipartEvent, MultipartParser, ParseState};
pub use request::{Method, Request, RequestError, RequestPhase};
pub use response::{full_response, status_response, ContentEncoding, ResponseHeaders, StatusCode};
pub use routes::{resolve_route, Route};
pub use schedule::{ControlFlags, Duty};
