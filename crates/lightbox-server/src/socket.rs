//! Listening sockets and accepted connections.
//!
//! [`SocketManager`] owns the retry policy: binding retries only while the
//! address is in use, and accepting distinguishes transient failures (the
//! loop goes on) from fatal ones (the caller gives up). [`Connection`]
//! applies the receive deadline to every read and is closed exactly once.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, info, warn};

use crate::config::SocketConfig;

/// Upper bound on draining a client after our side has shut down.
const CLOSE_LINGER: Duration = Duration::from_millis(500);

/// Socket-level failures.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("Address {addr} still in use after {attempts} bind attempts")]
    RetryExhausted { addr: SocketAddr, attempts: u32 },

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Accept failed: {0}")]
    Fatal(#[source] io::Error),

    #[error("No data within {0:?}")]
    RecvTimeout(Duration),

    #[error("Connection already closed")]
    Closed,

    #[error("Socket I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SocketError {
    /// Timeouts and peer resets end a connection without an error reply.
    pub fn is_silent(&self) -> bool {
        match self {
            SocketError::RecvTimeout(_) | SocketError::Closed => true,
            SocketError::Io(e) => is_transient(e),
            _ => false,
        }
    }
}

/// Result of one accept wait.
#[derive(Debug)]
pub enum AcceptOutcome {
    Connected(Connection),
    /// Nobody connected within the accept timeout.
    TimedOut,
    /// Accept failed in a way the loop can shrug off.
    Transient(io::Error),
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// Bind/listen/accept with bounded retry.
#[derive(Debug, Clone)]
pub struct SocketManager {
    config: SocketConfig,
}

impl SocketManager {
    pub fn new(config: SocketConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SocketConfig {
        &self.config
    }

    /// Bind and listen on `addr`.
    ///
    /// "Address in use" is retried up to `bind_attempts` times in total with
    /// a fixed delay; any other failure is returned at once.
    pub async fn bind_and_listen(&self, addr: SocketAddr) -> Result<TcpListener, SocketError> {
        let attempts = self.config.bind_attempts.max(1);
        for attempt in 1..=attempts {
            match try_bind(addr, self.config.backlog) {
                Ok(listener) => {
                    info!("Listening on {}", addr);
                    return Ok(listener);
                }
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                    warn!("{} in use (attempt {}/{})", addr, attempt, attempts);
                    if attempt < attempts {
                        tokio::time::sleep(self.config.bind_retry_delay()).await;
                    }
                }
                Err(source) => return Err(SocketError::Bind { addr, source }),
            }
        }
        Err(SocketError::RetryExhausted { addr, attempts })
    }

    /// Wait up to the accept timeout for the next client.
    pub async fn accept_with_timeout(
        &self,
        listener: &TcpListener,
    ) -> Result<AcceptOutcome, SocketError> {
        match tokio::time::timeout(self.config.accept_timeout(), listener.accept()).await {
            Err(_) => Ok(AcceptOutcome::TimedOut),
            Ok(Ok((stream, peer))) => {
                debug!("Accepted connection from {}", peer);
                Ok(AcceptOutcome::Connected(Connection::new(
                    stream,
                    peer,
                    self.config.recv_timeout(),
                )))
            }
            Ok(Err(e)) if is_transient(&e) => {
                warn!("Transient accept error: {}", e);
                Ok(AcceptOutcome::Transient(e))
            }
            Ok(Err(e)) => Err(SocketError::Fatal(e)),
        }
    }
}

fn try_bind(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    // The half-created socket is dropped, and thus closed, on every error.
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

/// An accepted client connection.
#[derive(Debug)]
pub struct Connection {
    stream: Option<TcpStream>,
    peer: SocketAddr,
    recv_timeout: Duration,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr, recv_timeout: Duration) -> Self {
        Self {
            stream: Some(stream),
            peer,
            recv_timeout,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Read up to `max` bytes. An empty vector means the peer closed.
    pub async fn recv(&mut self, max: usize) -> Result<Vec<u8>, SocketError> {
        let deadline = self.recv_timeout;
        let stream = self.stream.as_mut().ok_or(SocketError::Closed)?;
        let mut buf = vec![0u8; max.max(1)];
        let n = tokio::time::timeout(deadline, stream.read(&mut buf))
            .await
            .map_err(|_| SocketError::RecvTimeout(deadline))??;
        buf.truncate(n);
        Ok(buf)
    }

    /// Write the whole buffer.
    pub async fn send_all(&mut self, data: &[u8]) -> Result<(), SocketError> {
        let stream = self.stream.as_mut().ok_or(SocketError::Closed)?;
        stream.write_all(data).await?;
        Ok(())
    }

    /// Flush and close. Safe to call more than once; failures are only
    /// logged.
    pub async fn close(&mut self) {
        let Some(mut stream) = self.stream.take() else {
            return;
        };
        if let Err(e) = stream.shutdown().await {
            debug!("Error closing connection to {}: {}", self.peer, e);
            return;
        }
        // Unread input would turn the close into a reset and could discard
        // the reply on the client side.
        let mut sink = [0u8; 512];
        let _ = tokio::time::timeout(CLOSE_LINGER, async {
            while let Ok(n) = stream.read(&mut sink).await {
                if n == 0 {
                    break;
                }
            }
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> SocketConfig {
        SocketConfig {
            bind_attempts: 3,
            bind_retry_delay_ms: 10,
            accept_timeout_ms: 50,
            recv_timeout_ms: 50,
            ..SocketConfig::default()
        }
    }

    #[tokio::test]
    async fn test_bind_retries_then_gives_up() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();
        let sockets = SocketManager::new(fast_config());

        let started = std::time::Instant::now();
        let result = sockets.bind_and_listen(addr).await;

        assert!(matches!(
            result,
            Err(SocketError::RetryExhausted { attempts: 3, .. })
        ));
        // Two delays between three attempts.
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_rebind_after_release() {
        let sockets = SocketManager::new(fast_config());
        let first = sockets
            .bind_and_listen("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = first.local_addr().unwrap();
        drop(first);

        let second = tokio::time::timeout(Duration::from_secs(2), sockets.bind_and_listen(addr))
            .await
            .expect("rebind must not hang");
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_accept_times_out() {
        let sockets = SocketManager::new(fast_config());
        let listener = sockets
            .bind_and_listen("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let outcome = sockets.accept_with_timeout(&listener).await.unwrap();
        assert!(matches!(outcome, AcceptOutcome::TimedOut));
    }

    #[tokio::test]
    async fn test_recv_deadline_and_idempotent_close() {
        let sockets = SocketManager::new(fast_config());
        let listener = sockets
            .bind_and_listen("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();

        let AcceptOutcome::Connected(mut conn) = sockets.accept_with_timeout(&listener).await.unwrap()
        else {
            panic!("expected a connection");
        };

        assert!(matches!(conn.recv(16).await, Err(SocketError::RecvTimeout(_))));

        conn.close().await;
        conn.close().await;
        assert!(!conn.is_open());
        assert!(matches!(conn.recv(16).await, Err(SocketError::Closed)));
    }
}
