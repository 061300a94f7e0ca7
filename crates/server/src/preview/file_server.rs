//! Per-project loopback HTTP server exposing a single project root.
//!
//! Every request runs the same pipeline: method gate, token auth, path
//! policy, then a streamed file read. A handler failure answers the one
//! request; it never takes the listener down.

use std::io::{self, SeekFrom};
use std::net::{IpAddr, SocketAddr};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::io::ReaderStream;
use tower::Service;

use super::error::PreviewServerError;
use super::mime;
use super::monotonic_ms;
use super::token::AccessToken;

/// A connection that never sends its request line is cut off here, so an
/// idle socket cannot pin the listener.
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// One project's preview server. At most one runs per project at a time;
/// the manager owns every instance and serializes `start`/`stop` calls.
pub struct LocalFileServer {
    project_id: String,
    root: PathBuf,
    port: u16,
    bind_address: IpAddr,
    start_timeout: Duration,
    token: Arc<AccessToken>,
    last_accessed: Arc<AtomicU64>,
    lifecycle: Mutex<Lifecycle>,
}

enum Lifecycle {
    Created,
    Running {
        shutdown_tx: oneshot::Sender<()>,
        task: JoinHandle<()>,
    },
    /// Terminal; the instance refuses further use.
    Stopped,
}

/// Request-handler view of the server. Cloned into the axum router.
#[derive(Clone)]
struct ServeState {
    project_id: String,
    root: PathBuf,
    token: Arc<AccessToken>,
    last_accessed: Arc<AtomicU64>,
}

impl LocalFileServer {
    #[must_use]
    pub fn new(
        project_id: impl Into<String>,
        root: impl Into<PathBuf>,
        port: u16,
        token: AccessToken,
        bind_address: IpAddr,
        start_timeout: Duration,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            root: root.into(),
            port,
            bind_address,
            start_timeout,
            token: Arc::new(token),
            last_accessed: Arc::new(AtomicU64::new(monotonic_ms())),
            lifecycle: Mutex::new(Lifecycle::Created),
        }
    }

    /// Binds the listener and starts answering requests.
    ///
    /// Idempotent on a running instance. A stopped instance is terminal and
    /// reports `NotStarted`. The internal lock only guards the state word;
    /// concurrent `start`/`stop` calls are serialized by the manager.
    pub async fn start(&self) -> Result<String, PreviewServerError> {
        {
            let lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
            match &*lifecycle {
                Lifecycle::Running { .. } => return Ok(self.base_url()),
                Lifecycle::Stopped => return Err(PreviewServerError::NotStarted),
                Lifecycle::Created => {}
            }
        }

        let canonical_root =
            std::fs::canonicalize(&self.root).map_err(|_| PreviewServerError::RootInvalid {
                path: self.root.clone(),
            })?;
        if !canonical_root.is_dir() {
            return Err(PreviewServerError::RootInvalid {
                path: self.root.clone(),
            });
        }

        let addr = SocketAddr::new(self.bind_address, self.port);
        let listener = tokio::time::timeout(self.start_timeout, TcpListener::bind(addr))
            .await
            .map_err(|_| PreviewServerError::BindFailed {
                port: self.port,
                reason: "timed out waiting for the listener".to_string(),
            })?
            .map_err(|err| PreviewServerError::BindFailed {
                port: self.port,
                reason: err.to_string(),
            })?;

        let state = ServeState {
            project_id: self.project_id.clone(),
            root: canonical_root,
            token: Arc::clone(&self.token),
            last_accessed: Arc::clone(&self.last_accessed),
        };
        let app = Router::new().fallback(serve_file).with_state(state);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let project_id = self.project_id.clone();
        let task = tokio::spawn(accept_loop(listener, app, shutdown_rx, project_id));

        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        *lifecycle = Lifecycle::Running { shutdown_tx, task };
        tracing::info!(project = %self.project_id, port = self.port, "preview server started");
        Ok(self.base_url())
    }

    /// Tokenized URL for a file beneath the project root.
    pub fn url_for(&self, relative_path: &str) -> Result<String, PreviewServerError> {
        if !self.is_running() {
            return Err(PreviewServerError::NotStarted);
        }
        let segments =
            relative_segments(relative_path).ok_or_else(|| PreviewServerError::PathEscape {
                path: relative_path.to_string(),
            })?;
        let encoded = segments
            .iter()
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        Ok(format!(
            "http://{}:{}/{}?token={}",
            self.bind_address,
            self.port,
            encoded,
            self.token.as_hex()
        ))
    }

    /// Closes the listener and waits for in-flight requests to drain.
    /// Terminal: the instance refuses further use.
    pub async fn stop(&self) {
        let previous = {
            let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *lifecycle, Lifecycle::Stopped)
        };
        let Lifecycle::Running { shutdown_tx, task } = previous else {
            return;
        };
        let _ = shutdown_tx.send(());
        if let Err(err) = task.await {
            tracing::warn!(project = %self.project_id, "preview server task join failed: {err}");
        }
        tracing::info!(project = %self.project_id, port = self.port, "preview server stopped");
    }

    /// Monotonic millis of the most recent authenticated request.
    #[must_use]
    pub fn last_accessed(&self) -> u64 {
        self.last_accessed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        let lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        matches!(&*lifecycle, Lifecycle::Running { .. })
    }

    fn base_url(&self) -> String {
        format!("http://{}:{}/", self.bind_address, self.port)
    }
}

/// Accepts connections until the shutdown signal, then closes the listener
/// and lets in-flight requests finish. Keep-alive is off, so every
/// connection ends after a single response and the drain is bounded.
async fn accept_loop(
    listener: TcpListener,
    app: Router,
    mut shutdown_rx: oneshot::Receiver<()>,
    project_id: String,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        connections.spawn(serve_connection(stream, app.clone()));
                    }
                    Err(err) => {
                        tracing::warn!(project = %project_id, "preview accept failed: {err}");
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    drop(listener);
    while connections.join_next().await.is_some() {}
}

/// Serves one connection with HTTP keep-alive disabled and a bounded
/// header read, so idle sockets never pin the listener.
async fn serve_connection(stream: TcpStream, service: Router) {
    let io = TokioIo::new(stream);
    let hyper_service = hyper::service::service_fn(move |request: hyper::Request<Incoming>| {
        service.clone().call(request.map(Body::new))
    });
    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(HEADER_READ_TIMEOUT)
        .keep_alive(false);
    if let Err(err) = builder.serve_connection(io, hyper_service).await {
        tracing::debug!("preview connection closed: {err}");
    }
}

/// Splits a caller-supplied relative path into plain components.
/// `None` when the path is absolute or walks upward.
fn relative_segments(path: &str) -> Option<Vec<String>> {
    let mut segments = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(segment) => segments.push(segment.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(segments)
}

async fn serve_file(State(state): State<ServeState>, req: Request) -> Response {
    let method = req.method().clone();
    if method != Method::GET && method != Method::HEAD {
        return method_not_allowed();
    }

    if !authenticate(&state, &req) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    state.last_accessed.store(monotonic_ms(), Ordering::Relaxed);

    let raw_path = req.uri().path().to_string();
    let Some(decoded) = decode_path(req.uri()) else {
        tracing::warn!(project = %state.project_id, path = %raw_path, "undecodable request path denied");
        return StatusCode::FORBIDDEN.into_response();
    };

    let mut relative = PathBuf::new();
    for component in Path::new(&decoded).components() {
        match component {
            Component::Normal(segment) => {
                if segment.to_string_lossy().starts_with('.') {
                    tracing::warn!(project = %state.project_id, path = %raw_path, "hidden entry denied");
                    return StatusCode::FORBIDDEN.into_response();
                }
                relative.push(segment);
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                tracing::warn!(project = %state.project_id, path = %raw_path, "PathEscape denied");
                return StatusCode::FORBIDDEN.into_response();
            }
        }
    }

    let target = match tokio::fs::canonicalize(state.root.join(&relative)).await {
        Ok(target) => target,
        Err(err) => return io_error_response(&state, &err),
    };
    if target != state.root && !target.starts_with(&state.root) {
        tracing::warn!(project = %state.project_id, path = %raw_path, "PathEscape denied");
        return StatusCode::FORBIDDEN.into_response();
    }
    // A symlink may legally resolve inside the root but into a hidden tree.
    if let Ok(suffix) = target.strip_prefix(&state.root) {
        for component in suffix.components() {
            if let Component::Normal(segment) = component {
                if segment.to_string_lossy().starts_with('.') {
                    tracing::warn!(project = %state.project_id, path = %raw_path, "hidden entry denied");
                    return StatusCode::FORBIDDEN.into_response();
                }
            }
        }
    }

    let metadata = match tokio::fs::metadata(&target).await {
        Ok(metadata) => metadata,
        Err(err) => return io_error_response(&state, &err),
    };
    if metadata.is_dir() {
        return StatusCode::NOT_FOUND.into_response();
    }

    let file_len = metadata.len();
    let content_type = mime::content_type_for(&target);
    let range = if mime::supports_ranges(content_type) {
        req.headers()
            .get(header::RANGE)
            .and_then(|value| value.to_str().ok())
            .map(|value| parse_byte_range(value, file_len))
            .unwrap_or(RangeOutcome::Full)
    } else {
        RangeOutcome::Full
    };

    match range {
        RangeOutcome::Unsatisfiable => Response::builder()
            .status(StatusCode::RANGE_NOT_SATISFIABLE)
            .header(header::CONTENT_RANGE, format!("bytes */{file_len}"))
            .body(Body::empty())
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        RangeOutcome::Full => {
            let body = if method == Method::HEAD {
                Body::empty()
            } else {
                match stream_range(&target, 0, file_len).await {
                    Ok(body) => body,
                    Err(err) => return io_error_response(&state, &err),
                }
            };
            file_response(StatusCode::OK, content_type, file_len, None, body)
        }
        RangeOutcome::Partial(start, end) => {
            let span = end - start + 1;
            let body = if method == Method::HEAD {
                Body::empty()
            } else {
                match stream_range(&target, start, span).await {
                    Ok(body) => body,
                    Err(err) => return io_error_response(&state, &err),
                }
            };
            file_response(
                StatusCode::PARTIAL_CONTENT,
                content_type,
                span,
                Some(format!("bytes {start}-{end}/{file_len}")),
                body,
            )
        }
    }
}

fn authenticate(state: &ServeState, req: &Request) -> bool {
    let presented = query_token(req.uri()).or_else(|| bearer_token(req.headers()));
    match presented {
        Some(token) => state.token.verify(&token),
        None => false,
    }
}

fn query_token(uri: &Uri) -> Option<String> {
    let query = uri.query()?;
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        if parts.next() == Some("token") {
            let value = parts.next().unwrap_or("");
            return Some(
                urlencoding::decode(value)
                    .map(|decoded| decoded.into_owned())
                    .unwrap_or_default(),
            );
        }
    }
    None
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

fn decode_path(uri: &Uri) -> Option<String> {
    let raw = uri.path().trim_start_matches('/');
    urlencoding::decode(raw).ok().map(|decoded| decoded.into_owned())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RangeOutcome {
    /// Serve the whole file with a 200.
    Full,
    /// Serve `start..=end` with a 206.
    Partial(u64, u64),
    /// The range lies wholly outside the file: 416.
    Unsatisfiable,
}

/// Parses a single `bytes=` range against a file of `len` bytes.
/// Malformed or multi-range headers fall back to a full response.
fn parse_byte_range(header: &str, len: u64) -> RangeOutcome {
    let Some(spec) = header.strip_prefix("bytes=") else {
        return RangeOutcome::Full;
    };
    let spec = spec.trim();
    if spec.contains(',') {
        return RangeOutcome::Full;
    }
    let Some((start_s, end_s)) = spec.split_once('-') else {
        return RangeOutcome::Full;
    };
    match (start_s.is_empty(), end_s.is_empty()) {
        (true, true) => RangeOutcome::Full,
        (true, false) => {
            // Suffix form: the final N bytes.
            let Ok(suffix) = end_s.parse::<u64>() else {
                return RangeOutcome::Full;
            };
            if suffix == 0 || len == 0 {
                return RangeOutcome::Unsatisfiable;
            }
            let span = suffix.min(len);
            RangeOutcome::Partial(len - span, len - 1)
        }
        (false, true) => {
            let Ok(start) = start_s.parse::<u64>() else {
                return RangeOutcome::Full;
            };
            if start >= len {
                RangeOutcome::Unsatisfiable
            } else {
                RangeOutcome::Partial(start, len - 1)
            }
        }
        (false, false) => {
            let (Ok(start), Ok(end)) = (start_s.parse::<u64>(), end_s.parse::<u64>()) else {
                return RangeOutcome::Full;
            };
            if start > end || start >= len {
                RangeOutcome::Unsatisfiable
            } else {
                RangeOutcome::Partial(start, end.min(len - 1))
            }
        }
    }
}

async fn stream_range(path: &Path, start: u64, span: u64) -> io::Result<Body> {
    let mut file = tokio::fs::File::open(path).await?;
    if start > 0 {
        file.seek(SeekFrom::Start(start)).await?;
    }
    Ok(Body::from_stream(ReaderStream::new(file.take(span))))
}

fn file_response(
    status: StatusCode,
    content_type: &'static str,
    content_length: u64,
    content_range: Option<String>,
    body: Body,
) -> Response {
    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, content_length)
        .header(header::X_CONTENT_TYPE_OPTIONS, "nosniff")
        .header(header::CACHE_CONTROL, "no-cache");
    if let Some(content_range) = content_range {
        builder = builder.header(header::CONTENT_RANGE, content_range);
    }
    builder
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn method_not_allowed() -> Response {
    Response::builder()
        .status(StatusCode::METHOD_NOT_ALLOWED)
        .header(header::ALLOW, "GET, HEAD")
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn io_error_response(state: &ServeState, err: &io::Error) -> Response {
    match err.kind() {
        io::ErrorKind::NotFound => StatusCode::NOT_FOUND.into_response(),
        io::ErrorKind::PermissionDenied => StatusCode::FORBIDDEN.into_response(),
        _ => {
            tracing::error!(project = %state.project_id, "preview read failed: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
