//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use lightbox_core::{Radio, RadioError, SystemUpdater, UpdateError};
use lightbox_server::SocketConfig;

/// Radio that records calls and is always associated.
#[derive(Default)]
pub struct RecordingRadio {
    pub calls: Mutex<Vec<String>>,
}

impl RecordingRadio {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl Radio for RecordingRadio {
    fn start_access_point(&self, ssid: &str, _: &str, _: Ipv4Addr) -> Result<(), RadioError> {
        self.calls.lock().unwrap().push(format!("start_ap:{}", ssid));
        Ok(())
    }

    fn stop_access_point(&self) -> Result<(), RadioError> {
        self.calls.lock().unwrap().push("stop_ap".to_string());
        Ok(())
    }

    fn begin_association(&self, ssid: &str, _: &str, _: &str) -> Result<(), RadioError> {
        self.calls.lock().unwrap().push(format!("associate:{}", ssid));
        Ok(())
    }

    fn is_associated(&self) -> bool {
        true
    }

    fn station_address(&self) -> Option<IpAddr> {
        Some(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}

/// Updater counting weather refreshes, optionally failing them.
#[derive(Default)]
pub struct CountingUpdater {
    pub weather: AtomicUsize,
    pub fail: AtomicBool,
}

impl SystemUpdater for CountingUpdater {
    fn refresh_system_data(&self) -> Result<(), UpdateError> {
        Ok(())
    }

    fn refresh_weather(&self) -> Result<(), UpdateError> {
        self.weather.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(UpdateError::Failed("weather service unreachable".into()));
        }
        Ok(())
    }
}

pub fn fast_sockets() -> SocketConfig {
    SocketConfig {
        bind_attempts: 2,
        bind_retry_delay_ms: 10,
        accept_timeout_ms: 50,
        recv_timeout_ms: 2000,
        ..SocketConfig::default()
    }
}

/// A parsed HTTP response.
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub head: String,
    pub body: Vec<u8>,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<String> {
        self.head.lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim().to_string())
        })
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Send `chunks` with a pause between them and read the whole response.
pub async fn send_chunks(addr: SocketAddr, chunks: &[&[u8]]) -> Response {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.set_nodelay(true).unwrap();
    for (i, chunk) in chunks.iter().enumerate() {
        if i > 0 {
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        stream.write_all(chunk).await.unwrap();
        stream.flush().await.unwrap();
    }

    let mut raw = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut raw))
        .await
        .expect("response within 5s")
        .unwrap();
    parse_response(&raw)
}

pub async fn send(addr: SocketAddr, raw: &[u8]) -> Response {
    send_chunks(addr, &[raw]).await
}

pub async fn get(addr: SocketAddr, target: &str) -> Response {
    send(
        addr,
        format!("GET {} HTTP/1.1\r\nHost: lightbox\r\n\r\n", target).as_bytes(),
    )
    .await
}

pub fn parse_response(raw: &[u8]) -> Response {
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("response head");
    let head = String::from_utf8_lossy(&raw[..split]).into_owned();
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .expect("status code");
    Response {
        status,
        head,
        body: raw[split + 4..].to_vec(),
    }
}

/// Deterministic upload payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 7) % 251) as u8).collect()
}

/// Multipart upload split into head, part headers and the body pieces.
pub struct Upload {
    pub head: Vec<u8>,
    pub preamble: Vec<u8>,
    pub data: Vec<u8>,
    pub epilogue: Vec<u8>,
}

impl Upload {
    pub fn new(boundary: &str, filename: &str, data: Vec<u8>, boundary_in_header: bool) -> Self {
        let preamble = format!(
            "--{}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\n\
             Content-Type: image/x-portable-pixmap\r\n\r\n",
            boundary, filename
        )
        .into_bytes();
        let epilogue = format!("\r\n--{}--\r\n", boundary).into_bytes();
        let content_type = if boundary_in_header {
            format!("multipart/form-data; boundary={}", boundary)
        } else {
            "multipart/form-data".to_string()
        };
        let head = format!(
            "POST /upload HTTP/1.1\r\nHost: lightbox\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
            content_type,
            preamble.len() + data.len() + epilogue.len()
        )
        .into_bytes();
        Self {
            head,
            preamble,
            data,
            epilogue,
        }
    }

    /// The whole request in one buffer.
    pub fn bytes(&self) -> Vec<u8> {
        let mut out = self.head.clone();
        out.extend_from_slice(&self.preamble);
        out.extend_from_slice(&self.data);
        out.extend_from_slice(&self.epilogue);
        out
    }
}
