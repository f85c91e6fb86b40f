//! GET handlers of the control server.

use std::io;
use std::path::PathBuf;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use lightbox_core::{
    resolve_route, ConfigError, ConfigStoreExt, ContentEncoding, MultipartError, Request,
    RequestError, ResponseHeaders, Route, StatusCode, UpdateError, SETUP,
};

use super::ServerContext;
use crate::socket::SocketError;

/// Failures while handling one connection.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Socket(#[from] SocketError),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Multipart(#[from] MultipartError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Update(#[from] UpdateError),

    #[error("File error: {0}")]
    Io(#[from] io::Error),
}

impl HandlerError {
    /// Status to answer with, if the connection can still take one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            HandlerError::Socket(_) => None,
            HandlerError::Request(_) | HandlerError::Multipart(_) => Some(StatusCode::BadRequest),
            _ => Some(StatusCode::InternalServerError),
        }
    }
}

/// What to send back.
#[derive(Debug)]
pub enum Reply {
    /// Head plus an in-memory body.
    Full {
        headers: ResponseHeaders,
        body: Vec<u8>,
    },
    /// Head plus a file streamed in chunks.
    File {
        headers: ResponseHeaders,
        path: PathBuf,
        len: u64,
    },
    /// Plain-text status answer.
    Status(StatusCode),
}

impl Reply {
    /// Empty 200 with `Access-Control-Allow-Origin`.
    pub fn ok_cors() -> Self {
        Reply::Full {
            headers: ResponseHeaders::ok().with_cors(),
            body: Vec::new(),
        }
    }

    pub fn text(body: impl Into<String>) -> Self {
        Reply::Full {
            headers: ResponseHeaders::ok()
                .with_content_type("text/plain")
                .with_cors(),
            body: body.into().into_bytes(),
        }
    }
}

pub(crate) async fn dispatch(ctx: &ServerContext, request: &Request) -> Result<Reply, HandlerError> {
    let Some(route) = resolve_route(request.method, &request.path) else {
        return Ok(Reply::Status(StatusCode::NotFound));
    };
    debug!("GET {} -> {:?}", request.target, route);

    match route {
        Route::Settings => settings(ctx, request),
        Route::Images => images(ctx, request).await,
        Route::EventPosition => event_position(ctx, request),
        Route::RefreshWeather => refresh_weather(ctx),
        Route::StaticAsset => static_asset(ctx).await,
    }
}

fn request_type(request: &Request) -> &str {
    request.query_param("type").unwrap_or("unknown")
}

// ============================================================================
// settings
// ============================================================================

fn settings(ctx: &ServerContext, request: &Request) -> Result<Reply, HandlerError> {
    match request_type(request) {
        "inf" => settings_info(ctx),
        "change" => settings_change(ctx, request),
        "revert" => {
            ctx.store.restore_setup_backup()?;
            info!("Settings reverted to factory copy");
            Ok(Reply::ok_cors())
        }
        other => {
            debug!("Unknown settings type '{}'", other);
            Ok(Reply::Status(StatusCode::NotFound))
        }
    }
}

fn settings_info(ctx: &ServerContext) -> Result<Reply, HandlerError> {
    let raw = ctx.store.get_config(SETUP)?;

    let mut location = raw.get("location").cloned().unwrap_or_else(|| json!({}));
    // A manual offset overrides the looked-up one in what the UI sees.
    if let Some(offset) = raw.get("manual_time_zone").and_then(Value::as_i64) {
        if let Some(location) = location.as_object_mut() {
            location.insert("timezone_offset".to_string(), Value::from(offset));
        }
    }
    let body = json!({
        "location": location,
        "units": raw.get("units").cloned().unwrap_or(Value::Null),
    });

    Ok(Reply::Full {
        headers: ResponseHeaders::ok()
            .with_content_type("application/json")
            .with_cors(),
        body: body.to_string().into_bytes(),
    })
}

fn settings_change(ctx: &ServerContext, request: &Request) -> Result<Reply, HandlerError> {
    let mut setup = ctx.store.load_setup()?;
    let mut changed = false;

    for (field, value) in &request.query {
        match setup.apply_change(field, value) {
            Ok(applied) => changed |= applied,
            Err(ConfigError::InvalidField { field, value }) => {
                warn!("Rejected setting {}={:?}", field, value);
                return Ok(Reply::Status(StatusCode::UnprocessableEntity));
            }
            Err(e) => return Err(e.into()),
        }
    }

    if changed {
        ctx.store.save_setup(&setup)?;
        info!("Settings updated");
    }
    if request.query.contains_key("brightness") {
        ctx.display.change_brightness(setup.brightness);
    }
    Ok(Reply::ok_cors())
}

// ============================================================================
// images
// ============================================================================

async fn images(ctx: &ServerContext, request: &Request) -> Result<Reply, HandlerError> {
    match request_type(request) {
        "inf" => {
            let names = list_files(ctx).await?;
            Ok(Reply::text(names.join("\n")))
        }
        "data" => {
            let path = match image_path(ctx, request) {
                Ok(path) => path,
                Err(status) => return Ok(Reply::Status(status)),
            };
            let metadata = match tokio::fs::metadata(&path).await {
                Ok(metadata) if metadata.is_file() => metadata,
                _ => return Ok(Reply::Status(StatusCode::NotFound)),
            };
            let is_ppm = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("ppm"));
            let content_type = if is_ppm {
                "image/x-portable-pixmap"
            } else {
                "application/octet-stream"
            };
            Ok(Reply::File {
                headers: ResponseHeaders::ok()
                    .with_content_type(content_type)
                    .with_cors(),
                path,
                len: metadata.len(),
            })
        }
        "del" => {
            let path = match image_path(ctx, request) {
                Ok(path) => path,
                Err(status) => return Ok(Reply::Status(status)),
            };
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    info!("Deleted {}", path.display());
                    Ok(Reply::ok_cors())
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    Ok(Reply::Status(StatusCode::NotFound))
                }
                Err(e) => Err(e.into()),
            }
        }
        _ => Ok(Reply::Status(StatusCode::NotFound)),
    }
}

/// Stored file names, sorted.
async fn list_files(ctx: &ServerContext) -> Result<Vec<String>, HandlerError> {
    let mut entries = match tokio::fs::read_dir(&ctx.config.upload_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// `filename` query parameter resolved inside the upload directory.
fn image_path(ctx: &ServerContext, request: &Request) -> Result<PathBuf, StatusCode> {
    let name = request.query_param("filename").unwrap_or_default();
    if !is_plain_filename(name) {
        warn!("Rejected filename {:?}", name);
        return Err(StatusCode::BadRequest);
    }
    Ok(ctx.config.upload_dir.join(name))
}

/// A single path component naming a file inside the upload directory.
pub(crate) fn is_plain_filename(name: &str) -> bool {
    !matches!(name, "" | "." | "..") && !name.contains(['/', '\\'])
}

// ============================================================================
// event_pos, refresh_weather, static asset
// ============================================================================

fn event_position(ctx: &ServerContext, request: &Request) -> Result<Reply, HandlerError> {
    let Some(delta) = request
        .query_param("increment")
        .and_then(|raw| raw.trim().parse::<i32>().ok())
    else {
        return Ok(Reply::Status(StatusCode::UnprocessableEntity));
    };
    let position = ctx.display.change_counter(delta);
    debug!("Event position now {}", position);
    Ok(Reply::text(position.to_string()))
}

fn refresh_weather(ctx: &ServerContext) -> Result<Reply, HandlerError> {
    ctx.updater.refresh_weather()?;
    Ok(Reply::ok_cors())
}

async fn static_asset(ctx: &ServerContext) -> Result<Reply, HandlerError> {
    let path = ctx.config.web_root.join("index.html.gz");
    match tokio::fs::metadata(&path).await {
        Ok(metadata) if metadata.is_file() => Ok(Reply::File {
            headers: ResponseHeaders::ok()
                .with_content_type("text/html")
                .with_content_encoding(ContentEncoding::Gzip),
            path,
            len: metadata.len(),
        }),
        _ => {
            warn!("{} missing", path.display());
            Ok(Reply::Status(StatusCode::NotFound))
        }
    }
}
