//! First-run WiFi provisioning.
//!
//! While no credentials are stored, the appliance hosts its own access
//! point and serves a small form. The form POSTs
//! `{"wifiName", "wifiPassword", "hostname"}` as JSON to the submission
//! path; once that is persisted the server stops and releases its socket.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use lightbox_core::{
    ensure_cipher_key, full_response, status_response, ConfigError, ConfigStore, ConfigStoreExt,
    ControlFlags, CredentialError, CredentialVault, Display, Duty, Method, Radio, RadioError,
    Request, RequestError, ResponseHeaders, StatusCode, WifiCredentials, DEFAULT_HOSTNAME,
};

use crate::config::ProvisioningConfig;
use crate::socket::{AcceptOutcome, Connection, SocketError, SocketManager};

/// Served when the form page is missing from the web root.
const FALLBACK_FORM: &str = "<!DOCTYPE html><html><body><h1>Lightbox WiFi setup</h1>\
<form onsubmit=\"fetch('/internett',{method:'POST',headers:{'Content-Type':'application/json'},\
body:JSON.stringify({wifiName:n.value,wifiPassword:p.value,hostname:h.value})});return false;\">\
<input id=\"n\" placeholder=\"WiFi name\"><input id=\"p\" type=\"password\" placeholder=\"Password\">\
<input id=\"h\" value=\"mylightbox\"><button>Save</button></form></body></html>";

const SAVED_PAGE: &str = "<p>WIFI credentials successfully saved!</p>";

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error(transparent)]
    Radio(#[from] RadioError),

    #[error(transparent)]
    Socket(#[from] SocketError),

    #[error(transparent)]
    Credentials(#[from] CredentialError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Provisioning stopped before credentials were submitted")]
    Aborted,
}

/// Lifecycle of the provisioning server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningState {
    Init,
    Listening,
    ServeForm,
    ReceiveSubmission,
    Done,
}

#[derive(Debug, Deserialize)]
struct Submission {
    #[serde(rename = "wifiName")]
    wifi_name: String,

    #[serde(rename = "wifiPassword", default)]
    wifi_password: String,

    #[serde(default)]
    hostname: Option<String>,
}

/// Outcome of one provisioning connection.
enum Reply {
    Form,
    Saved(WifiCredentials),
    Status(StatusCode),
}

/// Captive credential server.
pub struct ProvisioningServer {
    config: ProvisioningConfig,
    sockets: SocketManager,
    radio: Arc<dyn Radio>,
    display: Arc<dyn Display>,
    store: Arc<dyn ConfigStore>,
    vault: CredentialVault,
    flags: Arc<ControlFlags>,
    listener: Option<TcpListener>,
    state: ProvisioningState,
    address_shown: bool,
    saved: Option<WifiCredentials>,
}

impl ProvisioningServer {
    pub fn new(
        config: ProvisioningConfig,
        radio: Arc<dyn Radio>,
        display: Arc<dyn Display>,
        store: Arc<dyn ConfigStore>,
        vault: CredentialVault,
    ) -> Self {
        let sockets = SocketManager::new(config.socket.clone());
        Self {
            config,
            sockets,
            radio,
            display,
            store,
            vault,
            flags: Arc::new(ControlFlags::new(Duty::Serve)),
            listener: None,
            state: ProvisioningState::Init,
            address_shown: false,
            saved: None,
        }
    }

    pub fn state(&self) -> ProvisioningState {
        self.state
    }

    /// Run flag; clearing it stops the server at the next accept timeout.
    pub fn flags(&self) -> Arc<ControlFlags> {
        self.flags.clone()
    }

    /// Host the access point, collect credentials, tear everything down.
    pub async fn run(&mut self) -> Result<WifiCredentials, ProvisioningError> {
        self.radio.start_access_point(
            &self.config.ap_ssid,
            &self.config.ap_password,
            self.config.ap_address,
        )?;
        info!(
            "Access point '{}' up at {}",
            self.config.ap_ssid, self.config.ap_address
        );

        let result = self.listen_and_serve().await;

        if let Err(e) = self.radio.stop_access_point() {
            warn!("Failed to stop access point: {}", e);
        }
        result
    }

    async fn listen_and_serve(&mut self) -> Result<WifiCredentials, ProvisioningError> {
        self.listen().await?;
        self.serve().await
    }

    /// Bind the form server; returns the bound address.
    pub async fn listen(&mut self) -> Result<SocketAddr, ProvisioningError> {
        let addr = SocketAddr::new(self.config.bind_ip, self.config.port);
        let listener = self.sockets.bind_and_listen(addr).await?;
        let local = listener.local_addr().map_err(SocketError::from)?;
        self.listener = Some(listener);
        self.state = ProvisioningState::Listening;
        Ok(local)
    }

    /// Serve clients one at a time until credentials are saved.
    pub async fn serve(&mut self) -> Result<WifiCredentials, ProvisioningError> {
        if self.listener.is_none() {
            self.listen().await?;
        }
        self.flags.start();

        let result = self.accept_loop().await;

        self.listener = None;
        self.state = ProvisioningState::Done;
        result?;
        self.saved.take().ok_or(ProvisioningError::Aborted)
    }

    async fn accept_loop(&mut self) -> Result<(), ProvisioningError> {
        while self.flags.is_running() {
            let Some(listener) = self.listener.as_ref() else {
                break;
            };
            let outcome = self.sockets.accept_with_timeout(listener).await?;
            match outcome {
                AcceptOutcome::Connected(mut conn) => {
                    self.handle_connection(&mut conn).await;
                    conn.close().await;
                }
                AcceptOutcome::TimedOut | AcceptOutcome::Transient(_) => {}
            }
        }
        Ok(())
    }

    async fn handle_connection(&mut self, conn: &mut Connection) {
        if !self.address_shown {
            self.display.show_text(&format!("IP: {}", self.config.ap_address));
            self.address_shown = true;
        }

        let reply = match self.read_and_process(conn).await {
            Ok(reply) => reply,
            Err(ProvisioningError::Socket(e)) if e.is_silent() => {
                debug!("Provisioning client {} went away: {}", conn.peer(), e);
                return;
            }
            Err(e) => {
                error!("Provisioning request failed: {}", e);
                Reply::Status(StatusCode::InternalServerError)
            }
        };

        let bytes = match &reply {
            Reply::Form => full_response(
                ResponseHeaders::ok().with_content_type("text/html"),
                self.form_page().as_bytes(),
            ),
            Reply::Saved(_) => full_response(
                ResponseHeaders::ok().with_content_type("text/html"),
                SAVED_PAGE.as_bytes(),
            ),
            Reply::Status(status) => status_response(*status),
        };
        if let Err(e) = conn.send_all(&bytes).await {
            warn!("Failed to answer {}: {}", conn.peer(), e);
        }

        if let Reply::Saved(credentials) = reply {
            self.saved = Some(credentials);
            self.flags.stop();
        }
    }

    async fn read_and_process(&mut self, conn: &mut Connection) -> Result<Reply, ProvisioningError> {
        let mut buf = Vec::new();
        let mut request = loop {
            let chunk = conn.recv(self.config.recv_chunk_size).await?;
            if chunk.is_empty() {
                return Err(SocketError::Closed.into());
            }
            buf.extend_from_slice(&chunk);
            match Request::parse(&buf) {
                Ok(request) => break request,
                Err(RequestError::Incomplete) => continue,
                Err(e) => {
                    warn!("Bad provisioning request: {}", e);
                    return Ok(Reply::Status(StatusCode::BadRequest));
                }
            }
        };

        if request.method != Method::Post || request.path != self.config.submission_path {
            self.state = ProvisioningState::ServeForm;
            return Ok(Reply::Form);
        }
        self.state = ProvisioningState::ReceiveSubmission;

        let wanted = request
            .content_length()
            .unwrap_or(request.body.len())
            .min(self.config.max_body_bytes);
        while request.body.len() < wanted {
            let chunk = conn.recv(self.config.recv_chunk_size).await?;
            if chunk.is_empty() {
                break;
            }
            request.body.extend_from_slice(&chunk);
        }
        request.body.truncate(wanted);

        let submission: Submission = match serde_json::from_slice(&request.body) {
            Ok(submission) => submission,
            Err(e) => {
                warn!("Malformed credential submission: {}", e);
                return Ok(Reply::Status(StatusCode::BadRequest));
            }
        };

        let credentials = WifiCredentials::new(submission.wifi_name, submission.wifi_password);
        if !credentials.is_configured() {
            warn!("Credential submission without SSID");
            return Ok(Reply::Status(StatusCode::UnprocessableEntity));
        }

        self.persist(&credentials, submission.hostname.as_deref())?;
        Ok(Reply::Saved(credentials))
    }

    fn persist(
        &self,
        credentials: &WifiCredentials,
        hostname: Option<&str>,
    ) -> Result<(), ProvisioningError> {
        let key = ensure_cipher_key(self.store.as_ref())?;
        self.vault.save(key.as_bytes(), credentials)?;

        if let Some(hostname) = hostname.filter(|h| !h.is_empty() && *h != DEFAULT_HOSTNAME) {
            let mut setup = self.store.load_setup()?;
            setup.hostname = hostname.to_string();
            self.store.save_setup(&setup)?;
            info!("Hostname set to '{}'", hostname);
        }
        Ok(())
    }

    fn form_page(&self) -> String {
        let path: PathBuf = self.config.web_root.join(&self.config.form_page);
        std::fs::read_to_string(&path).unwrap_or_else(|e| {
            debug!("{} unavailable ({}), serving built-in form", path.display(), e);
            FALLBACK_FORM.to_string()
        })
    }
}
