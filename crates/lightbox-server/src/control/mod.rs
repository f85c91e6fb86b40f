//! HTTP control server.
//!
//! One connection at a time: the first received chunk is classified by its
//! leading token, then
//! - `OPTIONS` gets the CORS preflight answer,
//! - `GET` is routed through the route table to a handler,
//! - `POST` streams a multipart upload to disk,
//! - anything else gets `400`.
//!
//! Every connection is closed when its handler returns, whatever the
//! outcome. Handler failures are answered and logged; they never reach the
//! accept loop. The loop itself checks the shared run flag after every
//! accept or accept timeout.

pub mod handlers;
pub mod upload;

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use lightbox_core::{
    full_response, status_response, ConfigStore, ControlFlags, Display, Method, Request,
    RequestError, RequestPhase, ResponseHeaders, StatusCode, SystemUpdater,
};

use crate::config::ServerConfig;
use crate::socket::{AcceptOutcome, Connection, SocketError, SocketManager};
use crate::station::StationConnector;

pub use handlers::{HandlerError, Reply};
pub use upload::UploadSession;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Socket(#[from] SocketError),

    #[error("No address to bind to: station not connected and no bind_ip configured")]
    NoAddress,
}

/// Collaborators and settings the handlers work with.
pub struct ServerContext {
    pub config: ServerConfig,
    pub store: Arc<dyn ConfigStore>,
    pub display: Arc<dyn Display>,
    pub updater: Arc<dyn SystemUpdater>,
}

/// Long-running control server. Keeps its listener across serve cycles.
pub struct ControlServer {
    ctx: ServerContext,
    sockets: SocketManager,
    station: StationConnector,
    flags: Arc<ControlFlags>,
    listener: Option<TcpListener>,
}

impl ControlServer {
    pub fn new(ctx: ServerContext, station: StationConnector, flags: Arc<ControlFlags>) -> Self {
        let sockets = SocketManager::new(ctx.config.socket.clone());
        Self {
            ctx,
            sockets,
            station,
            flags,
            listener: None,
        }
    }

    pub fn flags(&self) -> Arc<ControlFlags> {
        self.flags.clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Bind unless already bound; returns the listening address.
    pub async fn listen(&mut self) -> Result<SocketAddr, ServerError> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }
        let ip = self
            .ctx
            .config
            .bind_ip
            .or_else(|| self.station.ip_address())
            .ok_or(ServerError::NoAddress)?;
        let listener = self
            .sockets
            .bind_and_listen(SocketAddr::new(ip, self.ctx.config.port))
            .await?;
        let addr = listener.local_addr().map_err(SocketError::from)?;
        self.listener = Some(listener);
        Ok(addr)
    }

    /// Drop the listener; the next `listen` binds again.
    pub fn release(&mut self) {
        if self.listener.take().is_some() {
            debug!("Control server listener released");
        }
    }

    /// Accept and handle connections until the run flag clears.
    pub async fn serve(&mut self) -> Result<(), ServerError> {
        let addr = self.listen().await?;
        info!("Control server running on {}", addr);

        while self.flags.is_running() {
            let Some(listener) = self.listener.as_ref() else {
                break;
            };
            let accepted = self.sockets.accept_with_timeout(listener).await;
            let outcome = match accepted {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Control server accept failed: {}", e);
                    self.release();
                    return Err(e.into());
                }
            };
            match outcome {
                AcceptOutcome::Connected(mut conn) => {
                    handle_connection(&self.ctx, &mut conn).await;
                    conn.close().await;
                }
                AcceptOutcome::TimedOut => {}
                AcceptOutcome::Transient(e) => debug!("Accept interrupted: {}", e),
            }
        }

        info!("Control server stopped");
        Ok(())
    }
}

async fn handle_connection(ctx: &ServerContext, conn: &mut Connection) {
    let peer = conn.peer();
    let reply = match process(ctx, conn).await {
        Ok(Some(reply)) => reply,
        Ok(None) => return,
        Err(e) => match e.status() {
            Some(status) => {
                warn!("Request from {} failed: {}", peer, e);
                Reply::Status(status)
            }
            None => {
                debug!("Connection from {} dropped: {}", peer, e);
                return;
            }
        },
    };

    if let Err(e) = send_reply(ctx, conn, reply).await {
        debug!("Failed to answer {}: {}", peer, e);
    }
}

async fn process(ctx: &ServerContext, conn: &mut Connection) -> Result<Option<Reply>, HandlerError> {
    let first = conn.recv(ctx.config.recv_chunk_size).await?;
    if first.is_empty() {
        return Ok(None);
    }

    let reply = match Method::classify(&first) {
        Method::Options => Reply::Full {
            headers: ResponseHeaders::preflight(StatusCode::Ok),
            body: Vec::new(),
        },
        Method::Get => {
            let mut request = read_request(conn, first, ctx.config.recv_chunk_size).await?;
            request.advance(RequestPhase::Complete)?;
            handlers::dispatch(ctx, &request).await?
        }
        Method::Post => upload::receive_upload(ctx, conn, first).await?,
        Method::Unsupported => {
            warn!("Unsupported method from {}", conn.peer());
            Reply::Status(StatusCode::BadRequest)
        }
    };
    Ok(Some(reply))
}

/// Parse a request head, reading more chunks while it is incomplete.
pub(crate) async fn read_request(
    conn: &mut Connection,
    first: Vec<u8>,
    chunk_size: usize,
) -> Result<Request, HandlerError> {
    let mut buf = first;
    loop {
        match Request::parse(&buf) {
            Ok(request) => return Ok(request),
            Err(RequestError::Incomplete) => {
                let chunk = conn.recv(chunk_size).await?;
                if chunk.is_empty() {
                    return Err(SocketError::Closed.into());
                }
                buf.extend_from_slice(&chunk);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

async fn send_reply(
    ctx: &ServerContext,
    conn: &mut Connection,
    reply: Reply,
) -> Result<(), HandlerError> {
    match reply {
        Reply::Full { headers, body } => conn.send_all(&full_response(headers, &body)).await?,
        Reply::Status(status) => conn.send_all(&status_response(status)).await?,
        Reply::File { headers, path, len } => {
            let mut file = File::open(&path).await?;
            let head = headers.with_content_length(len as usize).to_bytes();
            conn.send_all(&head).await?;

            let mut buf = vec![0u8; ctx.config.send_chunk_size.max(1)];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                conn.send_all(&buf[..n]).await?;
            }
        }
    }
    Ok(())
}
