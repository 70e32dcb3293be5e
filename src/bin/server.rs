#![forbid(unsafe_code)]

//! MediaVault HTTP server.
//!
//! A thin JSON API over the download pipeline: requests start at most one
//! background job, poll its progress, and manage the catalog of finished
//! files and playlists. The job itself runs on the blocking pool around the
//! yt-dlp subprocess and reports back only through the shared job tracker.

use std::{
    fs,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use mime_guess::MimeGuess;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    signal,
};
use tokio_util::io::ReaderStream;

use mediavault::catalog::{Catalog, MediaRecord, NewMedia};
use mediavault::config::{RuntimeOverrides, RuntimePaths, resolve_runtime_paths};
use mediavault::job::{JobState, JobStatus, JobTracker, JobUpdate};
use mediavault::resolve::resolve_entry;
use mediavault::security::{ensure_not_root, is_safe_media_filename};
use mediavault::ytdlp::{DownloadOutcome, FormatPolicy, Ytdlp};

const OWNER_HEADER: &str = "x-owner-id";
const CANCELLED_MESSAGE: &str = "Download cancelled by user";

#[derive(Debug, Clone)]
struct ServerArgs {
    runtime: RuntimePaths,
    allow_root: bool,
}

impl ServerArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut overrides = RuntimeOverrides::default();
        let mut allow_root = false;
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--media-dir=") {
                overrides.media_dir = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--database-path=") {
                overrides.database_path = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--host=") {
                overrides.host = Some(value.to_string());
                continue;
            }
            if let Some(value) = arg.strip_prefix("--port=") {
                overrides.port = Some(parse_port_arg(value)?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--default-owner=") {
                overrides.default_owner = Some(value.to_string());
                continue;
            }
            if let Some(value) = arg.strip_prefix("--env-file=") {
                overrides.env_path = Some(PathBuf::from(value));
                continue;
            }

            match arg.as_str() {
                "--media-dir" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--media-dir requires a value"))?;
                    overrides.media_dir = Some(PathBuf::from(value));
                }
                "--database-path" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--database-path requires a value"))?;
                    overrides.database_path = Some(PathBuf::from(value));
                }
                "--host" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--host requires a value"))?;
                    overrides.host = Some(value);
                }
                "--port" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--port requires a value"))?;
                    overrides.port = Some(parse_port_arg(&value)?);
                }
                "--default-owner" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--default-owner requires a value"))?;
                    overrides.default_owner = Some(value);
                }
                "--env-file" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--env-file requires a value"))?;
                    overrides.env_path = Some(PathBuf::from(value));
                }
                "--allow-root" => allow_root = true,
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }

        let runtime = resolve_runtime_paths(overrides)?;
        Ok(Self {
            runtime,
            allow_root,
        })
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/MEDIAVAULT_HOST")
}

#[derive(Clone)]
struct AppState {
    catalog: Catalog,
    jobs: JobTracker,
    ytdlp: Arc<Ytdlp>,
    media_dir: Arc<PathBuf>,
    default_owner: Arc<String>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    /// Creates a 400 error with the provided message.
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    /// Creates a 404 error with the provided message.
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    /// Creates a 409 error with the provided message.
    fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: message.into(),
        }
    }

    /// Creates a 500 error with the provided message.
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        let body = json!({
            "error": self.message,
        });
        (self.status, headers, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Deserialize)]
struct DownloadRequest {
    url: Option<String>,
    #[serde(rename = "type")]
    format: Option<String>,
}

#[derive(Deserialize)]
struct FilenameRequest {
    filename: Option<String>,
}

#[derive(Deserialize)]
struct CreatePlaylistRequest {
    name: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let ServerArgs {
        runtime,
        allow_root,
    } = ServerArgs::parse()?;

    if !allow_root {
        ensure_not_root("mediavault-server")?;
    }

    fs::create_dir_all(&runtime.media_dir)
        .with_context(|| format!("creating media directory {}", runtime.media_dir.display()))?;

    let catalog = Catalog::open(&runtime.database_path)
        .await
        .context("opening catalog database")?;

    let ytdlp = Ytdlp::from_env();
    if let Err(err) = ytdlp.ensure_available() {
        eprintln!("  Warning: {err}; downloads will fail until yt-dlp is available");
    }

    let state = AppState {
        catalog,
        jobs: JobTracker::new(),
        ytdlp: Arc::new(ytdlp),
        media_dir: Arc::new(runtime.media_dir.clone()),
        default_owner: Arc::new(runtime.default_owner.clone()),
    };

    let app = build_router(state);

    let host = parse_host_arg(&runtime.host)?;
    let addr = SocketAddr::new(host, runtime.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    println!("MediaVault listening on http://{}", addr);
    println!("Media directory: {}", runtime.media_dir.display());
    println!("Catalog database: {}", runtime.database_path.display());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running MediaVault server")?;

    Ok(())
}

async fn shutdown_signal() {
    // We do not propagate this error up because it only affects graceful
    // shutdown; the process still terminates when Ctrl+C fires.
    if let Err(err) = signal::ctrl_c().await {
        eprintln!("Failed to install Ctrl+C handler: {}", err);
    }
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/download", post(start_download))
        .route("/cancel", post(cancel_download))
        .route("/status", get(get_status))
        .route("/files", get(list_files))
        .route("/delete", post(delete_file))
        .route("/files/sync", post(sync_files))
        .route("/playlists", get(get_playlists).post(create_playlist))
        .route("/playlists/{name}", delete(delete_playlist))
        .route("/playlists/{name}/add", post(playlist_add))
        .route("/playlists/{name}/remove", post(playlist_remove))
        .route("/media/{filename}", get(get_media))
        .route("/health", get(health))
        .with_state(state)
}

/// Owner scope for a request. Authentication lives in front of this server;
/// it hands us the account name in a header, or we fall back to the
/// configured single-user owner.
fn owner_from_headers(headers: &HeaderMap, default_owner: &str) -> String {
    headers
        .get(OWNER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| default_owner.to_string())
}

async fn start_download(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<DownloadRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let url = payload
        .url
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::bad_request("No URL provided"))?
        .to_string();
    let format = payload.format.as_deref().unwrap_or("video");
    let policy = FormatPolicy::parse(format)
        .ok_or_else(|| ApiError::bad_request(format!("Unknown media type: {format}")))?;

    let owner = owner_from_headers(&headers, &state.default_owner);
    let token = state
        .jobs
        .begin(&owner)
        .ok_or_else(|| ApiError::conflict("Download already in progress"))?;

    tokio::spawn(run_download_job(state, url, policy, owner, token));
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"message": "Download started"})),
    ))
}

async fn cancel_download(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    if state.jobs.request_cancel() {
        Ok(Json(json!({"message": "Cancellation requested"})))
    } else {
        Err(ApiError::bad_request("No active download"))
    }
}

async fn get_status(State(state): State<AppState>) -> Json<JobState> {
    Json(state.jobs.observe())
}

async fn list_files(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<MediaRecord>>> {
    let owner = owner_from_headers(&headers, &state.default_owner);
    let records = state
        .catalog
        .list_media(&owner)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    Ok(Json(records))
}

async fn delete_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<FilenameRequest>,
) -> ApiResult<Json<Value>> {
    let filename = payload
        .filename
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::bad_request("No filename provided"))?;

    let owner = owner_from_headers(&headers, &state.default_owner);
    let record = state
        .catalog
        .find_media(&owner, filename)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?
        .ok_or_else(|| ApiError::not_found("File not found"))?;

    let storage_path = PathBuf::from(&record.storage_path);
    if storage_path.is_file() {
        fs::remove_file(&storage_path)
            .map_err(|err| ApiError::internal(format!("removing {filename}: {err}")))?;
    }

    state
        .catalog
        .delete_media(record.id)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    Ok(Json(json!({"message": "Deleted"})))
}

async fn sync_files(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let owner = owner_from_headers(&headers, &state.default_owner);
    let count = state
        .catalog
        .sync_from_disk(&state.media_dir, &owner)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    Ok(Json(json!({
        "message": format!("Synced {count} files"),
        "count": count,
    })))
}

async fn get_playlists(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let owner = owner_from_headers(&headers, &state.default_owner);
    let playlists = state
        .catalog
        .list_playlists(&owner)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;

    let mut result = serde_json::Map::new();
    for (name, items) in playlists {
        result.insert(name, json!(items));
    }
    Ok(Json(Value::Object(result)))
}

async fn create_playlist(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreatePlaylistRequest>,
) -> ApiResult<Json<Value>> {
    let name = payload
        .name
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::bad_request("Name required"))?;

    let owner = owner_from_headers(&headers, &state.default_owner);
    let created = state
        .catalog
        .create_playlist(&owner, name)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    if !created {
        return Err(ApiError::conflict("Playlist already exists"));
    }
    Ok(Json(json!({"message": "Created"})))
}

async fn delete_playlist(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(name): AxumPath<String>,
) -> ApiResult<Json<Value>> {
    let owner = owner_from_headers(&headers, &state.default_owner);
    let deleted = state
        .catalog
        .delete_playlist(&owner, &name)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    if !deleted {
        return Err(ApiError::not_found("Not found"));
    }
    Ok(Json(json!({"message": "Deleted"})))
}

async fn playlist_add(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(name): AxumPath<String>,
    Json(payload): Json<FilenameRequest>,
) -> ApiResult<Json<Value>> {
    let filename = required_filename(&payload)?;
    let owner = owner_from_headers(&headers, &state.default_owner);
    let added = state
        .catalog
        .add_playlist_item(&owner, &name, &filename)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    if !added {
        return Err(ApiError::not_found("Playlist or Media not found"));
    }
    Ok(Json(json!({"message": "Added"})))
}

async fn playlist_remove(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(name): AxumPath<String>,
    Json(payload): Json<FilenameRequest>,
) -> ApiResult<Json<Value>> {
    let filename = required_filename(&payload)?;
    let owner = owner_from_headers(&headers, &state.default_owner);
    let removed = state
        .catalog
        .remove_playlist_item(&owner, &name, &filename)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;
    if !removed {
        return Err(ApiError::not_found("Playlist or Media not found"));
    }
    Ok(Json(json!({"message": "Removed"})))
}

fn required_filename(payload: &FilenameRequest) -> ApiResult<String> {
    payload
        .filename
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError::bad_request("No filename provided"))
}

async fn get_media(
    State(state): State<AppState>,
    AxumPath(filename): AxumPath<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    if !is_safe_media_filename(&filename) {
        return Err(ApiError::not_found("file not found"));
    }
    stream_file(state.media_dir.join(&filename), Some(&headers)).await
}

async fn health(State(state): State<AppState>) -> Response {
    match state.catalog.ping().await {
        Ok(()) => Json(json!({"status": "healthy", "database": "connected"})).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"status": "unhealthy", "error": err.to_string()})),
        )
            .into_response(),
    }
}

/// Background job body. Every failure path lands in the job tracker, never in
/// an HTTP response: the caller already got its 202.
async fn run_download_job(
    state: AppState,
    url: String,
    policy: FormatPolicy,
    owner: String,
    token: mediavault::job::CancelToken,
) {
    if let Err(err) = download_job(&state, &url, policy, &owner, &token).await {
        state.jobs.fail(err.to_string());
    }
}

async fn download_job(
    state: &AppState,
    url: &str,
    policy: FormatPolicy,
    owner: &str,
    token: &mediavault::job::CancelToken,
) -> Result<()> {
    // The probe tells us up front which logical entries to resolve afterwards;
    // a playlist URL expands to several.
    let entries = {
        let ytdlp = state.ytdlp.clone();
        let url = url.to_string();
        tokio::task::spawn_blocking(move || ytdlp.probe(&url))
            .await
            .context("probe task failed")??
    };

    if token.is_cancelled() {
        state.jobs.fail(CANCELLED_MESSAGE);
        return Ok(());
    }

    let outcome = {
        let ytdlp = state.ytdlp.clone();
        let url = url.to_string();
        let media_dir = state.media_dir.as_ref().clone();
        let jobs = state.jobs.clone();
        let token = token.clone();
        tokio::task::spawn_blocking(move || {
            ytdlp.download(&url, policy, &media_dir, &token, |event| {
                jobs.apply(JobUpdate {
                    status: Some(JobStatus::Downloading),
                    percentage: Some(event.percent),
                    current_filename: Some(event.filename),
                    speed: Some(event.speed),
                    eta: Some(event.eta),
                    ..JobUpdate::default()
                });
            })
        })
        .await
        .context("download task failed")??
    };

    let saved = match outcome {
        DownloadOutcome::Cancelled => {
            state.jobs.fail(CANCELLED_MESSAGE);
            return Ok(());
        }
        DownloadOutcome::Finished { saved } => saved,
    };

    state.jobs.apply(JobUpdate {
        status: Some(JobStatus::Processing),
        percentage: Some("100%".to_string()),
        ..JobUpdate::default()
    });

    for entry in entries {
        let reported = saved.get(&entry.id).map(PathBuf::as_path);
        let Some(path) = resolve_entry(
            &state.media_dir,
            reported,
            &entry.title,
            policy.target_extension(),
        ) else {
            eprintln!("  Warning: could not locate file for {}", entry.title);
            continue;
        };
        let Some(filename) = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
        else {
            eprintln!("  Warning: skipping {} (unreadable filename)", path.display());
            continue;
        };

        state
            .catalog
            .insert_media(&NewMedia {
                owner_id: owner.to_string(),
                filename,
                original_url: Some(url.to_string()),
                title: entry.title,
                media_type: policy.media_type(),
                storage_path: path.to_string_lossy().into_owned(),
            })
            .await?;
    }

    state.jobs.apply(JobUpdate {
        status: Some(JobStatus::Completed),
        ..JobUpdate::default()
    });
    Ok(())
}

async fn stream_file(path: PathBuf, headers: Option<&HeaderMap>) -> ApiResult<Response> {
    let mut file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let size = metadata.len();

    let guessed = MimeGuess::from_path(&path).first();
    let range = headers
        .and_then(|headers| headers.get(header::RANGE))
        .and_then(|value| parse_range_header(value, size));

    let mut response = if let Some((start, end)) = range {
        if start >= size {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
            response.headers_mut().insert(
                header::CONTENT_RANGE,
                format!("bytes */{}", size).parse().unwrap(),
            );
            response
        } else {
            let end = end.min(size.saturating_sub(1));
            let length = end - start + 1;
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|_| ApiError::not_found("file not found"))?;
            let stream = ReaderStream::new(file.take(length));
            let body = Body::from_stream(stream);
            let mut response = body.into_response();
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            response.headers_mut().insert(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", start, end, size).parse().unwrap(),
            );
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, length.to_string().parse().unwrap());
            response
        }
    } else {
        let stream = ReaderStream::new(file);
        let body = Body::from_stream(stream);
        body.into_response()
    };

    response
        .headers_mut()
        .insert(header::ACCEPT_RANGES, "bytes".parse().unwrap());
    if let Some(mime) = guessed
        && let Ok(value) = mime.to_string().parse()
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }

    Ok(response)
}

fn parse_range_header(value: &header::HeaderValue, size: u64) -> Option<(u64, u64)> {
    let value = value.to_str().ok()?;
    let value = value.trim();
    let mut parts = value.split('=');
    let unit = parts.next()?.trim();
    if unit != "bytes" {
        return None;
    }
    let range = parts.next()?.trim();
    if range.is_empty() {
        return None;
    }
    let (start_str, end_str) = range.split_once('-')?;

    if start_str.is_empty() {
        // Suffix range: "-N" means last N bytes.
        let suffix_len: u64 = end_str.parse().ok()?;
        if suffix_len == 0 {
            return None;
        }
        if suffix_len >= size {
            return Some((0, size.saturating_sub(1)));
        }
        return Some((size - suffix_len, size.saturating_sub(1)));
    }

    let start: u64 = start_str.parse().ok()?;
    let end = if end_str.is_empty() {
        size.saturating_sub(1)
    } else {
        end_str.parse().ok()?
    };
    if end < start {
        return None;
    }
    Some((start, end))
}
