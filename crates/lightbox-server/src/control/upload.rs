//! Streaming multipart upload into the upload directory.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use lightbox_core::multipart::{boundary_from_body, boundary_from_content_type, MAX_PART_HEADER_LEN};
use lightbox_core::{MultipartError, MultipartEvent, MultipartParser, RequestPhase, StatusCode};

use super::handlers::{is_plain_filename, HandlerError, Reply};
use super::{read_request, ServerContext};
use crate::socket::{Connection, SocketError};

/// A file being written from an upload.
#[derive(Debug)]
pub struct UploadSession {
    destination: PathBuf,
    boundary: String,
    bytes_written: u64,
    complete: bool,
    file: File,
}

impl UploadSession {
    /// Create (or truncate) the destination file.
    pub async fn create(destination: PathBuf, boundary: &str) -> io::Result<Self> {
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = File::create(&destination).await?;
        debug!("Receiving upload into {}", destination.display());
        Ok(Self {
            destination,
            boundary: boundary.to_string(),
            bytes_written: 0,
            complete: false,
            file,
        })
    }

    pub async fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data).await?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    pub async fn finish(&mut self) -> io::Result<()> {
        self.file.flush().await?;
        self.complete = true;
        info!(
            "Stored {} ({} bytes, boundary {:?})",
            self.destination.display(),
            self.bytes_written,
            self.boundary
        );
        Ok(())
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }
}

/// Receive a POSTed multipart body whose first chunk is `first`.
pub(crate) async fn receive_upload(
    ctx: &ServerContext,
    conn: &mut Connection,
    first: Vec<u8>,
) -> Result<Reply, HandlerError> {
    let chunk_size = ctx.config.recv_chunk_size;
    let mut request = read_request(conn, first, chunk_size).await?;
    request.advance(RequestPhase::AwaitingBoundary)?;

    let mut body = std::mem::take(&mut request.body);
    let boundary = match request.header("content-type").and_then(boundary_from_content_type) {
        Some(boundary) => boundary,
        None => loop {
            if let Some(boundary) = boundary_from_body(&body, &ctx.config.boundary_prefix) {
                break boundary;
            }
            if body.len() > MAX_PART_HEADER_LEN {
                return Err(MultipartError::MissingBoundary.into());
            }
            let chunk = conn.recv(chunk_size).await?;
            if chunk.is_empty() {
                return Err(MultipartError::MissingBoundary.into());
            }
            body.extend_from_slice(&chunk);
        },
    };
    debug!("Upload boundary {:?}", boundary);

    request.advance(RequestPhase::StreamingBody)?;
    let mut parser = MultipartParser::new(&boundary);
    let mut session: Option<UploadSession> = None;
    let mut chunk = body;

    loop {
        for event in parser.feed(&chunk)? {
            match event {
                MultipartEvent::PartStart { filename } => {
                    let Some(name) = filename.as_deref().and_then(sanitize_filename) else {
                        warn!("Upload part without a usable filename: {:?}", filename);
                        return Ok(Reply::Status(StatusCode::BadRequest));
                    };
                    let extension = file_extension(&name);
                    let stored = count_stored(&ctx.config.upload_dir, extension).await?;
                    if stored >= ctx.config.max_upload_files {
                        warn!(
                            "Upload of {} rejected: {} of {} .{} files stored",
                            name, stored, ctx.config.max_upload_files, extension
                        );
                        return Ok(Reply::Status(StatusCode::InsufficientStorage));
                    }
                    let destination = unique_destination(&ctx.config.upload_dir, &name);
                    session = Some(UploadSession::create(destination, &boundary).await?);
                }
                MultipartEvent::Data(bytes) => {
                    if let Some(session) = session.as_mut() {
                        session.append(&bytes).await?;
                    }
                }
                MultipartEvent::Finished => {
                    if let Some(session) = session.as_mut() {
                        session.finish().await?;
                    }
                }
            }
        }

        if parser.is_done() {
            break;
        }
        chunk = conn.recv(chunk_size).await?;
        if chunk.is_empty() {
            // The partial file stays where it is.
            warn!("Upload connection closed before the final boundary");
            return Err(SocketError::Closed.into());
        }
    }

    request.advance(RequestPhase::Complete)?;
    match session {
        Some(session) if session.is_complete() => Ok(Reply::ok_cors()),
        _ => {
            warn!("Multipart body held no file part");
            Ok(Reply::Status(StatusCode::BadRequest))
        }
    }
}

/// Extension of `filename`, empty when it has none.
pub fn file_extension(filename: &str) -> &str {
    match filename.rfind('.') {
        Some(dot) if dot > 0 => &filename[dot + 1..],
        _ => "",
    }
}

/// Number of files in `dir` whose extension is `extension` (empty matches
/// files without one).
pub async fn count_stored(dir: &Path, extension: &str) -> io::Result<usize> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let mut count = 0;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let name = entry.file_name();
        let matches = file_extension(&name.to_string_lossy()).eq_ignore_ascii_case(extension);
        if matches && entry.file_type().await?.is_file() {
            count += 1;
        }
    }
    Ok(count)
}

/// Final path component of a client-supplied filename, if the images
/// handlers would accept it.
pub fn sanitize_filename(raw: &str) -> Option<String> {
    let name = raw.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    is_plain_filename(name).then(|| name.to_string())
}

/// `dir/name.ext`, or the first free `dir/name(N).ext`.
pub fn unique_destination(dir: &Path, filename: &str) -> PathBuf {
    let candidate = dir.join(filename);
    if !candidate.exists() {
        return candidate;
    }

    let (stem, extension) = match filename.rfind('.') {
        Some(dot) if dot > 0 => (&filename[..dot], Some(&filename[dot + 1..])),
        _ => (filename, None),
    };
    (1u32..)
        .map(|n| match extension {
            Some(ext) => dir.join(format!("{}({}).{}", stem, n, ext)),
            None => dir.join(format!("{}({})", stem, n)),
        })
        .find(|path| !path.exists())
        .unwrap_or(candidate)
}
