use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use data_encoding::BASE64;
use nix::sys::signal::Signal;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::activity::ActivityMonitor;
use crate::bell::BellChannel;
use crate::buffers::BufferAggregator;
use crate::errors::HubError;
use crate::hq::HqClient;
use crate::http_server::{HttpRequest, HttpServer, Method, Response, StatusCode};
use crate::protocol::{SessionStatus, SPECIAL_KEYS};
use crate::remotes::{Remote, RemoteRegistry};
use crate::store::{SessionEntry, SessionStore};
use crate::stream::{StreamHub, StreamMessage};
use crate::supervisor::{CreateOptions, InputPayload, PtySupervisor};
use crate::watcher::ControlDirWatcher;

/// Federation role for a remote host: who to register with and as what.
#[derive(Debug, Clone)]
pub struct RemoteRole {
    pub hq_url: String,
    pub hq_username: String,
    pub hq_password: String,
    pub name: String,
    pub our_url: String,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub control_path: PathBuf,
    pub static_path: Option<PathBuf>,
    pub password: Option<String>,
    /// Bearer token accepted from federated callers (and required on
    /// `/api/health` once set).
    pub token: Option<String>,
    /// Act as headquarters: keep a remote registry and aggregate sessions.
    pub hq_mode: bool,
    /// Act as a remote federated with the given HQ.
    pub remote_role: Option<RemoteRole>,
}

struct AppState {
    supervisor: PtySupervisor,
    store: SessionStore,
    hub: Arc<StreamHub>,
    registry: Option<Arc<RemoteRegistry>>,
    hq: Option<Arc<HqClient>>,
    aggregator: Arc<BufferAggregator>,
    password: Option<String>,
    token: Option<String>,
    static_path: Option<PathBuf>,
    http: reqwest::blocking::Client,
}

#[derive(Debug, Serialize)]
struct ApiResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
}

impl ApiResponse {
    fn ok(message: &str) -> Self {
        Self {
            success: Some(true),
            message: Some(message.to_string()),
            error: None,
            code: None,
            session_id: None,
        }
    }

    fn failure(error: String, code: Option<&'static str>) -> Self {
        Self {
            success: None,
            message: None,
            error: Some(error),
            code,
            session_id: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    id: String,
    command: String,
    name: String,
    working_dir: String,
    status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    exit_code: Option<i32>,
    started_at: String,
    last_modified: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cols: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rows: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    remote_name: Option<String>,
}

impl SessionResponse {
    fn from_entry(entry: &SessionEntry) -> Self {
        let started_at = entry
            .info
            .started_at
            .map_or_else(|| "unknown".to_string(), |ts| ts.to_string());
        let last_modified = entry
            .last_modified
            .map_or_else(|| started_at.clone(), |ts| ts.to_string());
        Self {
            id: entry.id.clone(),
            command: entry.info.command.join(" "),
            name: entry.info.name.clone(),
            working_dir: entry.info.working_dir.clone(),
            status: entry.info.status,
            exit_code: entry.info.exit_code,
            started_at,
            last_modified,
            pid: entry.info.pid,
            cols: entry.info.cols,
            rows: entry.info.rows,
            remote_name: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest {
    command: Vec<String>,
    working_dir: Option<String>,
    name: Option<String>,
    cols: Option<u16>,
    rows: Option<u16>,
    term: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InputRequest {
    text: Option<String>,
    key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResizeRequest {
    cols: u16,
    rows: u16,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRemoteRequest {
    id: String,
    name: String,
    url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshSessionsRequest {
    action: String,
    session_id: String,
}

pub fn start_server(config: ServerConfig) -> anyhow::Result<()> {
    fs::create_dir_all(&config.control_path)?;
    let store = SessionStore::new(config.control_path.clone());

    // The bell channel feeds the external notification layer; the server
    // itself only logs the events it consumes.
    let (bells, bell_rx) = BellChannel::new();
    thread::Builder::new()
        .name("bell-consumer".to_string())
        .spawn(move || {
            for event in bell_rx {
                let source = event
                    .snapshot
                    .suspected_source
                    .as_ref()
                    .map_or("unknown", |p| p.command.as_str());
                info!(
                    session_id = event.session_id,
                    bells = event.bell_count,
                    source,
                    "bell"
                );
            }
        })?;

    let supervisor = PtySupervisor::new(store.clone(), Some(Arc::new(bells)));
    let hub = Arc::new(StreamHub::new(store.clone()));
    let registry = config.hq_mode.then(RemoteRegistry::new);
    if let Some(registry) = &registry {
        registry.start_health_loop();
    }
    let aggregator = BufferAggregator::new(Arc::clone(&hub), registry.clone());

    let hq = match &config.remote_role {
        Some(role) => {
            let token = config
                .token
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            let client = Arc::new(HqClient::new(
                role.hq_url.clone(),
                role.hq_username.clone(),
                role.hq_password.clone(),
                Uuid::new_v4().to_string(),
                role.name.clone(),
                role.our_url.clone(),
                token,
            ));
            client.register()?;
            Some(client)
        }
        None => None,
    };

    let _activity = ActivityMonitor::start(config.control_path.clone());
    let _watcher = ControlDirWatcher::start(store.clone(), hq.clone(), registry.clone())?;

    let state = Arc::new(AppState {
        supervisor,
        store,
        hub,
        registry,
        hq,
        aggregator,
        password: config.password.clone(),
        token: config.token.clone(),
        static_path: config.static_path.clone(),
        http: reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to construct http client"),
    });

    // shutdown hook: kill every live session, then leave the federation
    let shutdown_state = Arc::clone(&state);
    ctrlc::set_handler(move || {
        crate::utils::begin_shutdown();
        info!("shutting down, terminating live sessions");
        shutdown_state.supervisor.kill_all();
        if let Some(hq) = &shutdown_state.hq {
            hq.deregister();
        }
        std::process::exit(0);
    })?;

    let server = HttpServer::bind(&config.bind)
        .map_err(|err| anyhow::anyhow!("failed to bind {}: {err}", config.bind))?;
    if config.password.is_some() {
        info!(bind = config.bind, "listening with basic auth enabled (any username)");
    } else {
        info!(bind = config.bind, "listening with no authentication");
    }

    for request in server.incoming() {
        let state = Arc::clone(&state);
        thread::spawn(move || {
            let request = match request {
                Ok(request) => request,
                Err(err) => {
                    debug!(%err, "request error");
                    return;
                }
            };
            handle_request(&state, request);
        });
    }

    Ok(())
}

fn handle_request(state: &Arc<AppState>, mut req: HttpRequest) {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!(%method, path, remote = %req.remote_addr(), "request");

    if !authorized(state, &req, &path) {
        let _ = req.respond(unauthorized_response());
        return;
    }

    // WebSocket surface
    if path == "/buffers" && req.is_websocket_upgrade() {
        match req.upgrade_websocket() {
            Ok(socket) => state.aggregator.handle_client(socket),
            Err(err) => debug!(%err, "websocket upgrade failed"),
        }
        return;
    }

    // static dashboard assets
    if method == Method::GET && !path.starts_with("/api/") {
        if let Some(static_dir) = state.static_path.as_deref() {
            if let Some(response) = serve_static_file(static_dir, &path) {
                let _ = req.respond(response);
                return;
            }
        }
    }

    // streaming endpoints consume the request
    if method == Method::GET && path.starts_with("/api/sessions/") && path.ends_with("/stream") {
        if let Some(session_id) = extract_session_id(&path) {
            handle_session_stream(state, req, &session_id);
        } else {
            let _ = req.respond(json_response(
                StatusCode::BAD_REQUEST,
                &ApiResponse::failure("Invalid session ID".to_string(), None),
            ));
        }
        return;
    }

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/api/health") => handle_health(),
        (&Method::GET, "/api/sessions") => handle_list_sessions(state),
        (&Method::POST, "/api/sessions") => handle_create_session(state, &req),
        (&Method::POST, "/api/cleanup-exited") => handle_cleanup_exited(state),
        (&Method::GET, "/api/remotes") => handle_list_remotes(state),
        (&Method::POST, "/api/remotes/register") => handle_register_remote(state, &req),
        (&Method::POST, path) if path.starts_with("/api/remotes/") && path.ends_with("/refresh-sessions") => {
            handle_refresh_sessions(state, path, &req)
        }
        (&Method::DELETE, path) if path.starts_with("/api/remotes/") => {
            handle_unregister_remote(state, path)
        }
        (&Method::GET, path)
            if path.starts_with("/api/sessions/") && path.ends_with("/snapshot") =>
        {
            handle_session_snapshot(state, path)
        }
        (&Method::POST, path)
            if path.starts_with("/api/sessions/") && path.ends_with("/input") =>
        {
            handle_session_input(state, path, &req)
        }
        (&Method::POST, path)
            if path.starts_with("/api/sessions/") && path.ends_with("/resize") =>
        {
            handle_session_resize(state, path, &req)
        }
        (&Method::POST, path)
            if path.starts_with("/api/sessions/") && path.ends_with("/reset-size") =>
        {
            handle_session_reset_size(state, path)
        }
        (&Method::DELETE, path)
            if path.starts_with("/api/sessions/") && path.ends_with("/cleanup") =>
        {
            handle_session_cleanup(state, path)
        }
        (&Method::GET, path) if path.starts_with("/api/sessions/") => {
            handle_get_session(state, path)
        }
        (&Method::DELETE, path) if path.starts_with("/api/sessions/") => {
            handle_session_kill(state, path)
        }
        _ => json_response(
            StatusCode::NOT_FOUND,
            &ApiResponse::failure("Not found".to_string(), None),
        ),
    };

    let _ = req.respond(response);
}

fn check_basic_auth(req: &HttpRequest, expected_password: &str) -> bool {
    let Some(header) = req.headers().get("authorization") else {
        return false;
    };
    let Ok(value) = header.to_str() else {
        return false;
    };
    let Some(credentials) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = BASE64.decode(credentials.as_bytes()) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    // any username; only the password counts
    decoded
        .split_once(':')
        .is_some_and(|(_, password)| password == expected_password)
}

fn check_bearer(req: &HttpRequest, expected_token: &str) -> bool {
    req.headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|token| token == expected_token)
}

fn authorized(state: &AppState, req: &HttpRequest, path: &str) -> bool {
    if path == "/api/health" {
        // liveness stays open unless a federation token is configured
        return state
            .token
            .as_deref()
            .map_or(true, |token| check_bearer(req, token));
    }
    let Some(password) = state.password.as_deref() else {
        return true;
    };
    if check_basic_auth(req, password) {
        return true;
    }
    // federated callers authenticate with the bearer token instead
    state
        .token
        .as_deref()
        .is_some_and(|token| check_bearer(req, token))
}

fn unauthorized_response() -> Response<String> {
    Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .header("WWW-Authenticate", "Basic realm=\"tty-hub\"")
        .header("Content-Type", "text/plain")
        .body("Unauthorized".to_string())
        .unwrap()
}

fn extract_session_id(path: &str) -> Option<String> {
    let re = Regex::new(r"/api/sessions/([^/]+)($|/)").unwrap();
    re.captures(path)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn extract_remote_segment(path: &str) -> Option<String> {
    let re = Regex::new(r"/api/remotes/([^/]+)($|/)").unwrap();
    re.captures(path)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn json_response<T: Serialize>(status: StatusCode, data: &T) -> Response<String> {
    let json = serde_json::to_string(data).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(json)
        .unwrap()
}

fn error_response(err: &HubError) -> Response<String> {
    let status = match err.code() {
        "invalidInput" | "invalidWorkingDir" => StatusCode::BAD_REQUEST,
        "sessionNotFound" => StatusCode::NOT_FOUND,
        "duplicateRemoteName" => StatusCode::CONFLICT,
        "noSocketConnection" => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    json_response(
        status,
        &ApiResponse::failure(err.to_string(), Some(err.code())),
    )
}

fn handle_health() -> Response<String> {
    json_response(StatusCode::OK, &ApiResponse::ok("OK"))
}

/// The owning remote of a session, when this host is HQ and the session is
/// not local.
fn remote_for_session(state: &AppState, session_id: &str) -> Option<Remote> {
    if state.store.load_info(session_id).is_some() {
        return None;
    }
    state
        .registry
        .as_ref()
        .and_then(|registry| registry.get_by_session_id(session_id))
}

/// Forwards a session operation to the owning remote, relaying status and
/// body as-is.
fn proxy_to_remote(
    state: &AppState,
    remote: &Remote,
    method: &Method,
    path: &str,
    body: &[u8],
) -> Response<String> {
    let url = format!("{}{}", remote.url.trim_end_matches('/'), path);
    let request = match *method {
        Method::GET => state.http.get(&url),
        Method::POST => state.http.post(&url),
        Method::DELETE => state.http.delete(&url),
        _ => {
            return json_response(
                StatusCode::METHOD_NOT_ALLOWED,
                &ApiResponse::failure("Unsupported proxy method".to_string(), None),
            )
        }
    };
    let mut request = request.bearer_auth(&remote.token);
    if !body.is_empty() {
        request = request
            .header("content-type", "application/json")
            .body(body.to_vec());
    }
    match request.send() {
        Ok(response) => {
            let status = StatusCode::from_u16(response.status().as_u16())
                .unwrap_or(StatusCode::BAD_GATEWAY);
            let body = response.text().unwrap_or_default();
            Response::builder()
                .status(status)
                .header("Content-Type", "application/json")
                .header("Access-Control-Allow-Origin", "*")
                .body(body)
                .unwrap()
        }
        Err(err) => {
            warn!(remote = remote.name, %err, "proxying to remote failed");
            json_response(
                StatusCode::BAD_GATEWAY,
                &ApiResponse::failure(format!("remote unreachable: {err}"), None),
            )
        }
    }
}

fn handle_list_sessions(state: &AppState) -> Response<String> {
    let local = match state.supervisor.list() {
        Ok(entries) => entries,
        Err(err) => return error_response(&err),
    };
    let mut responses: Vec<SessionResponse> =
        local.iter().map(SessionResponse::from_entry).collect();

    // HQ aggregates every remote's sessions and refreshes the routing table
    if let Some(registry) = &state.registry {
        for remote in registry.list() {
            let url = format!("{}/api/sessions", remote.url.trim_end_matches('/'));
            let Some(token) = registry.get(&remote.id).map(|r| r.token) else {
                continue;
            };
            let fetched: Result<Vec<SessionResponse>, _> = state
                .http
                .get(&url)
                .bearer_auth(&token)
                .send()
                .and_then(|response| response.json());
            match fetched {
                Ok(mut sessions) => {
                    let ids = sessions.iter().map(|s| s.id.clone()).collect();
                    registry.update_sessions(&remote.id, ids);
                    for session in &mut sessions {
                        session.remote_name = Some(remote.name.clone());
                    }
                    responses.append(&mut sessions);
                }
                Err(err) => {
                    warn!(remote = remote.name, %err, "failed to list remote sessions");
                }
            }
        }
    }

    responses.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    json_response(StatusCode::OK, &responses)
}

fn handle_get_session(state: &AppState, path: &str) -> Response<String> {
    let Some(session_id) = extract_session_id(path) else {
        return json_response(
            StatusCode::BAD_REQUEST,
            &ApiResponse::failure("Invalid session ID".to_string(), None),
        );
    };
    if let Some(remote) = remote_for_session(state, &session_id) {
        return proxy_to_remote(
            state,
            &remote,
            &Method::GET,
            &format!("/api/sessions/{session_id}"),
            &[],
        );
    }
    match state.supervisor.get(&session_id) {
        Ok(entry) => json_response(StatusCode::OK, &SessionResponse::from_entry(&entry)),
        Err(err) => error_response(&err),
    }
}

fn handle_create_session(state: &AppState, req: &HttpRequest) -> Response<String> {
    let body = String::from_utf8_lossy(req.body());
    let Ok(create) = serde_json::from_str::<CreateSessionRequest>(&body) else {
        return json_response(
            StatusCode::BAD_REQUEST,
            &ApiResponse::failure(
                "Invalid request body. Expected JSON with 'command' array".to_string(),
                Some("invalidInput"),
            ),
        );
    };
    if create.command.is_empty() {
        return json_response(
            StatusCode::BAD_REQUEST,
            &ApiResponse::failure("Command cannot be empty".to_string(), Some("invalidInput")),
        );
    }

    let options = CreateOptions {
        session_id: None,
        name: create.name,
        working_dir: create
            .working_dir
            .as_deref()
            .map(crate::utils::expand_tilde),
        cols: create.cols,
        rows: create.rows,
        term: create.term,
    };
    match state.supervisor.create(&create.command, options) {
        Ok((session_id, _info)) => {
            let response = ApiResponse {
                session_id: Some(session_id),
                ..ApiResponse::ok("Session created successfully")
            };
            json_response(StatusCode::OK, &response)
        }
        Err(err) => error_response(&err),
    }
}

fn handle_cleanup_exited(state: &AppState) -> Response<String> {
    match state.supervisor.cleanup_exited() {
        Ok(removed) => json_response(
            StatusCode::OK,
            &ApiResponse::ok(&format!("{} exited sessions cleaned up", removed.len())),
        ),
        Err(err) => error_response(&err),
    }
}

fn handle_session_input(state: &AppState, path: &str, req: &HttpRequest) -> Response<String> {
    let Some(session_id) = extract_session_id(path) else {
        return json_response(
            StatusCode::BAD_REQUEST,
            &ApiResponse::failure("Invalid session ID".to_string(), None),
        );
    };
    if let Some(remote) = remote_for_session(state, &session_id) {
        return proxy_to_remote(
            state,
            &remote,
            &Method::POST,
            &format!("/api/sessions/{session_id}/input"),
            req.body(),
        );
    }

    let body = String::from_utf8_lossy(req.body());
    let Ok(input) = serde_json::from_str::<InputRequest>(&body) else {
        return json_response(
            StatusCode::BAD_REQUEST,
            &ApiResponse::failure("Invalid request body".to_string(), Some("invalidInput")),
        );
    };
    // the dashboard sends named keys through the text field too
    let (text, key) = match (input.text, input.key) {
        (Some(text), None) if SPECIAL_KEYS.contains(&text.as_str()) => (None, Some(text)),
        other => other,
    };
    let payload = match InputPayload::from_parts(text, key) {
        Ok(payload) => payload,
        Err(err) => return error_response(&err),
    };
    match state.supervisor.send_input(&session_id, payload) {
        Ok(()) => json_response(StatusCode::OK, &ApiResponse::ok("Input sent successfully")),
        Err(err) => error_response(&err),
    }
}

fn handle_session_resize(state: &AppState, path: &str, req: &HttpRequest) -> Response<String> {
    let Some(session_id) = extract_session_id(path) else {
        return json_response(
            StatusCode::BAD_REQUEST,
            &ApiResponse::failure("Invalid session ID".to_string(), None),
        );
    };
    if let Some(remote) = remote_for_session(state, &session_id) {
        return proxy_to_remote(
            state,
            &remote,
            &Method::POST,
            &format!("/api/sessions/{session_id}/resize"),
            req.body(),
        );
    }

    let body = String::from_utf8_lossy(req.body());
    let Ok(resize) = serde_json::from_str::<ResizeRequest>(&body) else {
        return json_response(
            StatusCode::BAD_REQUEST,
            &ApiResponse::failure(
                "Invalid request body. Expected JSON with 'cols' and 'rows'".to_string(),
                Some("invalidInput"),
            ),
        );
    };
    match state.supervisor.resize(&session_id, resize.cols, resize.rows) {
        Ok(()) => json_response(
            StatusCode::OK,
            &ApiResponse::ok(&format!("Session resized to {}x{}", resize.cols, resize.rows)),
        ),
        Err(err) => error_response(&err),
    }
}

fn handle_session_reset_size(state: &AppState, path: &str) -> Response<String> {
    let Some(session_id) = extract_session_id(path) else {
        return json_response(
            StatusCode::BAD_REQUEST,
            &ApiResponse::failure("Invalid session ID".to_string(), None),
        );
    };
    if let Some(remote) = remote_for_session(state, &session_id) {
        return proxy_to_remote(
            state,
            &remote,
            &Method::POST,
            &format!("/api/sessions/{session_id}/reset-size"),
            &[],
        );
    }
    match state.supervisor.reset_size(&session_id) {
        Ok(()) => json_response(StatusCode::OK, &ApiResponse::ok("Reset requested")),
        Err(err) => error_response(&err),
    }
}

fn handle_session_kill(state: &AppState, path: &str) -> Response<String> {
    let Some(session_id) = extract_session_id(path) else {
        return json_response(
            StatusCode::BAD_REQUEST,
            &ApiResponse::failure("Invalid session ID".to_string(), None),
        );
    };
    if let Some(remote) = remote_for_session(state, &session_id) {
        return proxy_to_remote(
            state,
            &remote,
            &Method::DELETE,
            &format!("/api/sessions/{session_id}"),
            &[],
        );
    }
    match state.supervisor.kill(&session_id, Signal::SIGTERM) {
        Ok(()) => json_response(StatusCode::OK, &ApiResponse::ok("Session killed")),
        Err(err) => error_response(&err),
    }
}

fn handle_session_cleanup(state: &AppState, path: &str) -> Response<String> {
    let Some(session_id) = extract_session_id(path) else {
        return json_response(
            StatusCode::BAD_REQUEST,
            &ApiResponse::failure("Invalid session ID".to_string(), None),
        );
    };
    if let Some(remote) = remote_for_session(state, &session_id) {
        return proxy_to_remote(
            state,
            &remote,
            &Method::DELETE,
            &format!("/api/sessions/{session_id}/cleanup"),
            &[],
        );
    }
    match state.supervisor.cleanup(&session_id) {
        Ok(()) => json_response(StatusCode::OK, &ApiResponse::ok("Session cleaned up")),
        Err(err) => error_response(&err),
    }
}

fn handle_session_snapshot(state: &AppState, path: &str) -> Response<String> {
    let Some(session_id) = extract_session_id(path) else {
        return json_response(
            StatusCode::BAD_REQUEST,
            &ApiResponse::failure("Invalid session ID".to_string(), None),
        );
    };
    if let Some(remote) = remote_for_session(state, &session_id) {
        return proxy_to_remote(
            state,
            &remote,
            &Method::GET,
            &format!("/api/sessions/{session_id}/snapshot"),
            &[],
        );
    }

    let stream_path = state.store.paths(&session_id).stdout;
    match fs::read_to_string(&stream_path) {
        Ok(content) => {
            let pruned = prune_snapshot_content(&content);
            Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain")
                .body(pruned)
                .unwrap()
        }
        Err(_) => json_response(
            StatusCode::NOT_FOUND,
            &ApiResponse::failure("Session not found".to_string(), Some("sessionNotFound")),
        ),
    }
}

fn handle_session_stream(state: &Arc<AppState>, req: HttpRequest, session_id: &str) {
    // sessions owned by a remote relay the remote's SSE bytes verbatim
    if let Some(remote) = remote_for_session(state, session_id) {
        let url = format!(
            "{}/api/sessions/{session_id}/stream",
            remote.url.trim_end_matches('/')
        );
        let upstream = state.http.get(&url).bearer_auth(&remote.token).send();
        match upstream {
            Ok(mut upstream) if upstream.status().is_success() => {
                if let Ok(mut raw) = req.into_raw_stream("text/event-stream") {
                    if let Err(err) = upstream.copy_to(&mut raw) {
                        debug!(%err, "remote stream relay ended");
                    }
                }
            }
            _ => {
                let mut req = req;
                let _ = req.respond(json_response(
                    StatusCode::BAD_GATEWAY,
                    &ApiResponse::failure("remote stream unavailable".to_string(), None),
                ));
            }
        }
        return;
    }

    let subscription = match state.hub.subscribe(session_id) {
        Ok(subscription) => subscription,
        Err(err) => {
            let mut req = req;
            let _ = req.respond(error_response(&err));
            return;
        }
    };
    let mut sse = match req.into_sse() {
        Ok(sse) => sse,
        Err(err) => {
            debug!(%err, "failed to start SSE stream");
            return;
        }
    };
    info!(session_id, "streaming SSE");
    for message in subscription.rx.iter() {
        match message {
            StreamMessage::Line(line) => {
                if sse.write_event(&line).is_err() {
                    break;
                }
            }
            StreamMessage::End => break,
        }
    }
    info!(session_id, "SSE stream ended");
}

/// Serves only what a fresh viewer needs: everything after the last clear
/// sequence, timestamps zeroed for instant playback, preserving the header
/// and the last resize preceding the clear.
fn prune_snapshot_content(content: &str) -> String {
    let mut header_line: Option<&str> = None;
    let mut events: Vec<&str> = Vec::new();

    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(line) {
            if parsed.get("version").is_some() {
                header_line = Some(line);
            } else if parsed.is_array() {
                events.push(line);
            }
        }
    }

    let mut last_clear_index = None;
    for (i, line) in events.iter().enumerate().rev() {
        if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(line) {
            if let (Some("o"), Some(data)) = (
                parsed.get(1).and_then(|v| v.as_str()),
                parsed.get(2).and_then(|v| v.as_str()),
            ) {
                if data.contains("\x1b[2J") || data.contains("\x1b[3J") || data.contains("\x1bc") {
                    last_clear_index = Some(i);
                    break;
                }
            }
        }
    }

    let mut last_resize_before_clear: Option<&str> = None;
    if let Some(clear_index) = last_clear_index {
        for line in events.iter().take(clear_index).rev() {
            if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(line) {
                if parsed.get(1).and_then(|v| v.as_str()) == Some("r") {
                    last_resize_before_clear = Some(line);
                    break;
                }
            }
        }
    }

    let zeroed = |line: &str| -> Option<String> {
        let mut parsed = serde_json::from_str::<serde_json::Value>(line).ok()?;
        let array = parsed.as_array_mut()?;
        if array.first().map_or(false, serde_json::Value::is_number) {
            array[0] = serde_json::Value::from(0);
        }
        serde_json::to_string(&parsed).ok()
    };

    let mut result = Vec::new();
    if let Some(header) = header_line {
        result.push(header.to_string());
    }
    if let Some(resize) = last_resize_before_clear {
        if let Some(line) = zeroed(resize) {
            result.push(line);
        }
    }
    for line in events.iter().skip(last_clear_index.unwrap_or(0)) {
        if let Some(line) = zeroed(line) {
            result.push(line);
        }
    }
    result.join("\n")
}

fn handle_list_remotes(state: &AppState) -> Response<String> {
    match &state.registry {
        Some(registry) => json_response(StatusCode::OK, &registry.list()),
        None => json_response(
            StatusCode::NOT_FOUND,
            &ApiResponse::failure("Not running in HQ mode".to_string(), None),
        ),
    }
}

fn handle_register_remote(state: &AppState, req: &HttpRequest) -> Response<String> {
    let Some(registry) = &state.registry else {
        return json_response(
            StatusCode::NOT_FOUND,
            &ApiResponse::failure("Not running in HQ mode".to_string(), None),
        );
    };
    let body = String::from_utf8_lossy(req.body());
    let Ok(register) = serde_json::from_str::<RegisterRemoteRequest>(&body) else {
        return json_response(
            StatusCode::BAD_REQUEST,
            &ApiResponse::failure(
                "Invalid request body. Expected id, name, url and token".to_string(),
                Some("invalidInput"),
            ),
        );
    };
    let remote = Remote {
        id: register.id,
        name: register.name,
        url: register.url,
        token: register.token,
        registered_at: jiff::Timestamp::now(),
        last_heartbeat: None,
    };
    match registry.register(remote) {
        Ok(()) => json_response(StatusCode::OK, &ApiResponse::ok("Remote registered")),
        Err(err) => error_response(&err),
    }
}

fn handle_unregister_remote(state: &AppState, path: &str) -> Response<String> {
    let Some(registry) = &state.registry else {
        return json_response(
            StatusCode::NOT_FOUND,
            &ApiResponse::failure("Not running in HQ mode".to_string(), None),
        );
    };
    let Some(remote_id) = extract_remote_segment(path) else {
        return json_response(
            StatusCode::BAD_REQUEST,
            &ApiResponse::failure("Invalid remote ID".to_string(), None),
        );
    };
    match registry.unregister(&remote_id) {
        Some(_) => json_response(StatusCode::OK, &ApiResponse::ok("Remote unregistered")),
        None => json_response(
            StatusCode::NOT_FOUND,
            &ApiResponse::failure("Remote not found".to_string(), None),
        ),
    }
}

fn handle_refresh_sessions(state: &AppState, path: &str, req: &HttpRequest) -> Response<String> {
    if crate::utils::is_shutting_down() {
        return json_response(
            StatusCode::SERVICE_UNAVAILABLE,
            &ApiResponse::failure("Shutting down".to_string(), None),
        );
    }
    let Some(registry) = &state.registry else {
        return json_response(
            StatusCode::NOT_FOUND,
            &ApiResponse::failure("Not running in HQ mode".to_string(), None),
        );
    };
    let Some(remote_name) = extract_remote_segment(path) else {
        return json_response(
            StatusCode::BAD_REQUEST,
            &ApiResponse::failure("Invalid remote name".to_string(), None),
        );
    };
    let Some(remote) = registry.get_by_name(&remote_name) else {
        return json_response(
            StatusCode::NOT_FOUND,
            &ApiResponse::failure("Remote not found".to_string(), None),
        );
    };
    let body = String::from_utf8_lossy(req.body());
    let Ok(refresh) = serde_json::from_str::<RefreshSessionsRequest>(&body) else {
        return json_response(
            StatusCode::BAD_REQUEST,
            &ApiResponse::failure(
                "Invalid request body. Expected action and sessionId".to_string(),
                Some("invalidInput"),
            ),
        );
    };

    match refresh.action.as_str() {
        "created" => registry.add_session(&remote.id, &refresh.session_id),
        "deleted" => registry.clear_session(&refresh.session_id),
        other => {
            return json_response(
                StatusCode::BAD_REQUEST,
                &ApiResponse::failure(format!("Unknown action: {other}"), Some("invalidInput")),
            )
        }
    }
    json_response(StatusCode::OK, &ApiResponse::ok("Sessions refreshed"))
}

fn get_mime_type(file_path: &Path) -> &'static str {
    match file_path.extension().and_then(|ext| ext.to_str()) {
        Some("html" | "htm") => "text/html",
        Some("css") => "text/css",
        Some("js" | "mjs") => "application/javascript",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("txt") => "text/plain",
        Some("xml") => "application/xml",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("ttf") => "font/ttf",
        Some("otf") => "font/otf",
        _ => "application/octet-stream",
    }
}

fn serve_static_file(static_root: &Path, request_path: &str) -> Option<Response<Vec<u8>>> {
    // no directory traversal
    if request_path.contains("../") || request_path.contains("..\\") {
        return None;
    }

    let cleaned_path = request_path.trim_start_matches('/');
    let file_path = static_root.join(cleaned_path);
    if !file_path.starts_with(static_root) {
        return None;
    }

    let file_path = if file_path.is_dir() {
        let index = file_path.join("index.html");
        index.is_file().then_some(index)?
    } else {
        file_path
    };
    if !file_path.is_file() {
        return None;
    }

    let content = fs::read(&file_path).ok()?;
    let mime_type = get_mime_type(&file_path);
    Some(
        Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", mime_type)
            .header("Access-Control-Allow-Origin", "*")
            .body(content)
            .unwrap(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_extract_session_id() {
        assert_eq!(
            extract_session_id("/api/sessions/123-456"),
            Some("123-456".to_string())
        );
        assert_eq!(
            extract_session_id("/api/sessions/abc-def/stream"),
            Some("abc-def".to_string())
        );
        assert_eq!(extract_session_id("/api/sessions/"), None);
        assert_eq!(extract_session_id("/api/sessions"), None);
        assert_eq!(extract_session_id("/other/path"), None);
    }

    #[test]
    fn test_extract_remote_segment() {
        assert_eq!(
            extract_remote_segment("/api/remotes/r-1"),
            Some("r-1".to_string())
        );
        assert_eq!(
            extract_remote_segment("/api/remotes/edge/refresh-sessions"),
            Some("edge".to_string())
        );
        assert_eq!(extract_remote_segment("/api/remotes/"), None);
    }

    #[test]
    fn test_json_response_headers() {
        #[derive(Serialize)]
        struct TestData {
            message: String,
        }
        let response = json_response(
            StatusCode::OK,
            &TestData {
                message: "test".to_string(),
            },
        );
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response
                .headers()
                .get("Access-Control-Allow-Origin")
                .unwrap(),
            "*"
        );
        assert_eq!(response.body(), r#"{"message":"test"}"#);
    }

    #[test]
    fn test_error_response_status_mapping() {
        let err = HubError::SessionNotFound {
            session_id: "x".to_string(),
        };
        assert_eq!(error_response(&err).status(), StatusCode::NOT_FOUND);

        let err = HubError::DuplicateRemoteName {
            name: "x".to_string(),
        };
        let response = error_response(&err);
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert!(response.body().contains("duplicateRemoteName"));

        let err = HubError::InvalidInput {
            reason: "bad".to_string(),
        };
        assert_eq!(error_response(&err).status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_create_session_request_deserialization() {
        let json = r#"{"command":["bash","-l"],"workingDir":"/tmp","cols":120,"rows":30}"#;
        let request: CreateSessionRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.command, vec!["bash", "-l"]);
        assert_eq!(request.working_dir, Some("/tmp".to_string()));
        assert_eq!(request.cols, Some(120));
        assert_eq!(request.rows, Some(30));
        assert!(request.name.is_none());
    }

    #[test]
    fn test_session_response_serialization() {
        use crate::protocol::SessionInfo;
        let entry = SessionEntry {
            id: "123".to_string(),
            info: SessionInfo {
                command: vec!["bash".to_string(), "-l".to_string()],
                name: "bash".to_string(),
                working_dir: "/home/user".to_string(),
                status: SessionStatus::Running,
                pid: Some(1234),
                started_at: Some(jiff::Timestamp::UNIX_EPOCH),
                ..SessionInfo::default()
            },
            last_modified: None,
        };
        let json = serde_json::to_string(&SessionResponse::from_entry(&entry)).unwrap();
        assert!(json.contains(r#""id":"123""#));
        assert!(json.contains(r#""command":"bash -l""#));
        assert!(json.contains(r#""workingDir":"/home/user""#));
        assert!(json.contains(r#""status":"running""#));
        assert!(json.contains(r#""pid":1234"#));
        assert!(!json.contains("exitCode"));
        assert!(!json.contains("remoteName"));
    }

    #[test]
    fn test_prune_snapshot_content() {
        assert_eq!(prune_snapshot_content(""), "");

        let header = r#"{"version":2,"width":80,"height":24}"#;
        assert_eq!(prune_snapshot_content(header), header);

        let content = format!(
            "{header}\n[0.5,\"o\",\"before\"]\n[0.8,\"r\",\"100x30\"]\n[1.0,\"o\",\"\\u001b[2Jcleared\"]\n[1.5,\"o\",\"after\"]"
        );
        let pruned = prune_snapshot_content(&content);
        let lines: Vec<&str> = pruned.lines().collect();
        assert!(lines[0].contains("version"));
        // resize before the clear survives, zeroed
        assert!(lines[1].contains("100x30"));
        assert!(lines[1].starts_with("[0,"));
        // content before the clear is dropped
        assert!(!pruned.contains("before"));
        assert!(pruned.contains("after"));
        for line in &lines[1..] {
            assert!(line.starts_with("[0,"), "not zeroed: {line}");
        }
    }

    #[test]
    fn test_serve_static_file_security_and_index() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::write(root.join("app.js"), "console.log(1)").unwrap();
        fs::create_dir(root.join("sub")).unwrap();
        fs::write(root.join("sub/index.html"), "<h1>hi</h1>").unwrap();

        assert!(serve_static_file(root, "../etc/passwd").is_none());
        assert!(serve_static_file(root, "/missing.css").is_none());

        let response = serve_static_file(root, "/app.js").unwrap();
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/javascript"
        );

        let response = serve_static_file(root, "/sub/").unwrap();
        assert_eq!(response.body(), b"<h1>hi</h1>");
        assert_eq!(response.headers().get("Content-Type").unwrap(), "text/html");
    }

    #[test]
    fn test_get_mime_type() {
        assert_eq!(get_mime_type(Path::new("a.html")), "text/html");
        assert_eq!(get_mime_type(Path::new("a.css")), "text/css");
        assert_eq!(get_mime_type(Path::new("a.wasm")), "application/octet-stream");
    }

    #[test]
    fn test_api_response_shape() {
        let ok = serde_json::to_string(&ApiResponse::ok("done")).unwrap();
        assert!(ok.contains(r#""success":true"#));
        assert!(!ok.contains("error"));

        let failed =
            serde_json::to_string(&ApiResponse::failure("broken".to_string(), Some("killFailed")))
                .unwrap();
        assert!(failed.contains(r#""error":"broken""#));
        assert!(failed.contains(r#""code":"killFailed""#));
        assert!(!failed.contains("success"));
    }
}
