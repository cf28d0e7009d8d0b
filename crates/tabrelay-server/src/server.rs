//! HTTP and WebSocket surface.
//!
//! Owns the session registry, the hub registry and the rate limiters, and
//! runs the background GC and activity tasks for the lifetime of the
//! listener.

use crate::auth::ServerRateLimits;
use crate::config::{ServerConfig, UpstreamMode};
use crate::relay::{
    ActivityEvent, ClientEvent, ClientHandle, ClientId, HubContext, HubRegistry, RelayHub, TabKey,
};
use crate::session::{RemovedSession, SessionRegistry};
use crate::upstream::{PtyResource, TerminalResource, WebSocketResource};
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, Path, Query, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tabrelay_core::messages::{CreateTabRequest, ErrorBody, SetPasswordRequest, StartResponse};
use tabrelay_core::{CloseReason, Control, ErrorKind, RelayError, RelayResult};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Header carrying the session password.
pub const PASSWORD_HEADER: &str = "x-session-password";

const GC_INTERVAL: Duration = Duration::from_secs(60);

/// Seconds a client is told to wait before retrying a start.
const START_RETRY_AFTER_SECS: u64 = 5;

/// Rejected-frame notices waiting for the client's output task.
const REJECT_BUFFER: usize = 8;

/// State shared by every handler.
pub struct AppState {
    pub sessions: Arc<SessionRegistry>,
    pub hubs: Arc<HubRegistry>,
    limits: Mutex<ServerRateLimits>,
    start_wait: Duration,
}

type SharedState = Arc<AppState>;

impl AppState {
    /// Tear down everything a removed session owned.
    async fn teardown_removed(&self, removed: &RemovedSession) {
        for tab_id in &removed.tab_ids {
            if let Ok(key) = TabKey::new(removed.id.as_str(), tab_id.as_str()) {
                self.hubs.teardown_tab(&key).await;
            }
        }
        self.hubs.teardown_session(&removed.id).await;
    }

    /// Gate a request on the session password, if the session has one.
    async fn authorize(
        &self,
        session_id: &str,
        ip: IpAddr,
        candidate: Option<&str>,
    ) -> RelayResult<()> {
        if !self.sessions.has_password(session_id).await? {
            return Ok(());
        }
        if !self.limits.lock().await.may_try_credential(ip, session_id) {
            warn!(session_id, %ip, "too many failed credentials");
            return Err(RelayError::RateLimited(
                "too many failed password attempts".into(),
            ));
        }

        if self.sessions.verify_password(session_id, candidate).await? {
            self.limits
                .lock()
                .await
                .record_credential_success(ip, session_id);
            return Ok(());
        }

        match candidate {
            Some(_) => {
                self.limits
                    .lock()
                    .await
                    .record_credential_failure(ip, session_id);
                warn!(session_id, %ip, "invalid session password");
                Err(RelayError::Auth("invalid password".into()))
            }
            None => Err(RelayError::Auth("password required".into())),
        }
    }
}

/// Build the terminal resource client for the configured mode.
pub fn build_resource(config: &ServerConfig) -> RelayResult<Arc<dyn TerminalResource>> {
    Ok(match config.upstream.mode {
        UpstreamMode::Pty => Arc::new(PtyResource::new(config.upstream.command.clone())),
        UpstreamMode::Websocket => Arc::new(WebSocketResource::new(config.remote_endpoints())?),
    })
}

/// The relay server instance.
pub struct RelayServer {
    config: ServerConfig,
    state: SharedState,
    activity_rx: mpsc::UnboundedReceiver<ActivityEvent>,
}

impl RelayServer {
    pub fn new(config: ServerConfig, resource: Arc<dyn TerminalResource>) -> Self {
        let (activity_tx, activity_rx) = mpsc::unbounded_channel();
        let ctx = HubContext::new(resource, config.hub.clone()).with_activity(activity_tx);
        let state = Arc::new(AppState {
            sessions: Arc::new(SessionRegistry::new(
                config.max_sessions,
                config.session_ttl,
                config.capabilities.clone(),
            )),
            hubs: HubRegistry::new(ctx),
            limits: Mutex::new(ServerRateLimits::new(config.limits)),
            start_wait: config.start_wait,
        });
        Self {
            config,
            state,
            activity_rx,
        }
    }

    pub fn state(&self) -> SharedState {
        self.state.clone()
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send + 'static) -> RelayResult<()> {
        let listener = TcpListener::bind(self.config.listen).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already-bound listener until `shutdown` resolves.
    ///
    /// On shutdown every hub is closed first, so attached clients get a
    /// `closed` notification before the listener drains.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> RelayResult<()> {
        let addr = listener.local_addr()?;
        let Self {
            config,
            state,
            activity_rx,
        } = self;

        let activity_task = tokio::spawn(consume_activity(state.sessions.clone(), activity_rx));
        let gc_task = tokio::spawn(gc_loop(state.clone()));

        info!(
            %addr,
            upstream = ?config.upstream.mode,
            replay_capacity = config.hub.replay_capacity,
            idle_grace_secs = config.hub.idle_grace.as_secs(),
            "tabrelay-server ready"
        );

        let hubs = state.hubs.clone();
        let app = router(state);
        let result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!("shutting down, closing hubs");
            hubs.teardown_all().await;
        })
        .await;

        gc_task.abort();
        activity_task.abort();
        result.map_err(RelayError::Io)
    }
}

/// Build the HTTP router.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sessions/:session_id", get(session_info).delete(delete_session))
        .route("/sessions/:session_id/password", post(set_password))
        .route("/sessions/:session_id/tabs", post(create_tab))
        .route("/sessions/:session_id/tabs/:tab_id", delete(delete_tab))
        .route("/sessions/:session_id/tabs/:tab_id/start", post(start_tab))
        .route("/sessions/:session_id/tabs/:tab_id/ws", get(attach))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn consume_activity(
    sessions: Arc<SessionRegistry>,
    mut rx: mpsc::UnboundedReceiver<ActivityEvent>,
) {
    while let Some(event) = rx.recv().await {
        sessions.touch(&event.session_id).await;
    }
}

async fn gc_loop(state: SharedState) {
    let mut interval = tokio::time::interval(GC_INTERVAL);
    loop {
        interval.tick().await;

        // A live hub means clients are (or were just) attached.
        for key in state.hubs.keys() {
            state.sessions.touch(&key.session_id).await;
        }

        for removed in state.sessions.gc().await {
            state.teardown_removed(&removed).await;
        }

        state.limits.lock().await.gc();
    }
}

/// Error response: status from the error kind, structured JSON body.
#[derive(Debug)]
pub struct ApiError(pub RelayError);

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = match kind {
            ErrorKind::NeedsCredential => StatusCode::UNAUTHORIZED,
            ErrorKind::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            ErrorKind::Starting => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() && kind == ErrorKind::Internal {
            warn!(error = %self.0, "request failed");
        }

        let mut response = (status, Json(ErrorBody::from(&self.0))).into_response();
        if kind == ErrorKind::Starting {
            response.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from(START_RETRY_AFTER_SECS),
            );
        }
        response
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Default, Deserialize)]
struct CredentialQuery {
    password: Option<String>,
}

/// Password from the header, falling back to the query string.
fn credential(headers: &HeaderMap, query: &CredentialQuery) -> Option<String> {
    headers
        .get(PASSWORD_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| query.password.clone())
}

fn client_ip(connect_info: Option<ConnectInfo<SocketAddr>>) -> IpAddr {
    connect_info
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

async fn health(State(state): State<SharedState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": state.sessions.count().await,
        "hubs": state.hubs.count(),
    }))
}

async fn session_info(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
    Query(query): Query<CredentialQuery>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> ApiResult<Json<tabrelay_core::SessionInfo>> {
    // Reads never create sessions; an unknown id is a 404.
    let candidate = credential(&headers, &query);
    state
        .authorize(&session_id, client_ip(connect_info), candidate.as_deref())
        .await?;
    state.sessions.touch(&session_id).await;
    Ok(Json(state.sessions.info(&session_id).await?))
}

async fn delete_session(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
    Query(query): Query<CredentialQuery>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> ApiResult<StatusCode> {
    let candidate = credential(&headers, &query);
    state
        .authorize(&session_id, client_ip(connect_info), candidate.as_deref())
        .await?;
    let removed = state.sessions.remove(&session_id).await?;
    state.teardown_removed(&removed).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_password(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
    Query(query): Query<CredentialQuery>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Json(body): Json<SetPasswordRequest>,
) -> ApiResult<StatusCode> {
    state.sessions.get_or_create(&session_id).await?;
    let candidate = credential(&headers, &query);
    state
        .authorize(&session_id, client_ip(connect_info), candidate.as_deref())
        .await?;
    let password = body.password.filter(|p| !p.is_empty());
    state
        .sessions
        .set_password(&session_id, password.as_deref())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_tab(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
    Query(query): Query<CredentialQuery>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    body: Option<Json<CreateTabRequest>>,
) -> ApiResult<(StatusCode, Json<tabrelay_core::TabDescriptor>)> {
    state.sessions.get_or_create(&session_id).await?;
    let candidate = credential(&headers, &query);
    state
        .authorize(&session_id, client_ip(connect_info), candidate.as_deref())
        .await?;
    let name = body.and_then(|Json(b)| b.name);
    let tab = state.sessions.add_tab(&session_id, name).await?;
    Ok((StatusCode::CREATED, Json(tab)))
}

async fn delete_tab(
    State(state): State<SharedState>,
    Path((session_id, tab_id)): Path<(String, String)>,
    Query(query): Query<CredentialQuery>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> ApiResult<StatusCode> {
    let key = TabKey::new(session_id.as_str(), tab_id.as_str())?;
    let candidate = credential(&headers, &query);
    state
        .authorize(&session_id, client_ip(connect_info), candidate.as_deref())
        .await?;
    state.sessions.remove_tab(&session_id, &tab_id).await?;
    state.hubs.teardown_tab(&key).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn start_tab(
    State(state): State<SharedState>,
    Path((session_id, tab_id)): Path<(String, String)>,
    Query(query): Query<CredentialQuery>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> ApiResult<Json<StartResponse>> {
    let key = TabKey::new(session_id.as_str(), tab_id.as_str())?;
    state.sessions.get_or_create(&session_id).await?;
    let candidate = credential(&headers, &query);
    state
        .authorize(&session_id, client_ip(connect_info), candidate.as_deref())
        .await?;
    state.sessions.ensure_tab(&session_id, &tab_id).await?;
    state.sessions.touch(&session_id).await;

    match tokio::time::timeout(state.start_wait, state.hubs.start(&key)).await {
        Ok(result) => result?,
        Err(_) => {
            debug!(tab = %key, "start still in progress");
            return Err(RelayError::Starting(key.to_string()).into());
        }
    }

    Ok(Json(StartResponse {
        session_id,
        tab_id,
        state: "connected".into(),
    }))
}

/// Attach. The credential is checked before the upgrade is accepted, so an
/// unauthorized client never gets a WebSocket.
async fn attach(
    State(state): State<SharedState>,
    Path((session_id, tab_id)): Path<(String, String)>,
    Query(query): Query<CredentialQuery>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let key = TabKey::new(session_id.as_str(), tab_id.as_str())?;
    let ip = client_ip(connect_info);
    if !state.limits.lock().await.admit_attach(ip) {
        return Err(RelayError::RateLimited("too many attach attempts".into()).into());
    }

    state.sessions.get_or_create(&session_id).await?;
    let candidate = credential(&headers, &query);
    state.authorize(&session_id, ip, candidate.as_deref()).await?;
    state.sessions.ensure_tab(&session_id, &tab_id).await?;

    debug!(tab = %key, %ip, "upgrading client connection");
    Ok(ws.on_upgrade(move |socket| client_loop(socket, state, key)))
}

type ClientSink = SplitSink<WebSocket, Message>;

async fn send_control(sink: &mut ClientSink, control: &Control) -> bool {
    match serde_json::to_string(control) {
        Ok(json) => sink.send(Message::Text(json)).await.is_ok(),
        Err(_) => false,
    }
}

async fn send_closed(sink: &mut ClientSink, reason: CloseReason) {
    if let CloseReason::UpstreamUnavailable { message } = &reason {
        let err = RelayError::UpstreamUnavailable(message.clone());
        send_control(sink, &Control::from_error(&err)).await;
    }
    send_control(sink, &Control::Closed { detail: reason }).await;
}

/// Pump one client connection between its WebSocket and its hub.
///
/// Output runs on this task; input is forwarded by a separate task so a
/// stalled upstream write never delays delivery to this client.
async fn client_loop(socket: WebSocket, state: SharedState, key: TabKey) {
    let (mut sink, stream) = socket.split();

    let (hub, handle) = match state.hubs.attach(&key).await {
        Ok(attached) => attached,
        Err(e) => {
            warn!(tab = %key, error = %e, "attach failed");
            send_control(&mut sink, &Control::from_error(&e)).await;
            let _ = sink.close().await;
            return;
        }
    };
    let ClientHandle { id, mut events } = handle;

    let (reject_tx, mut rejects) = mpsc::channel::<RelayError>(REJECT_BUFFER);
    let mut input = tokio::spawn(forward_input(stream, hub.clone(), id, key.clone(), reject_tx));

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ClientEvent::Replay(frames)) => {
                    let mut ok = true;
                    for frame in frames {
                        if sink.send(Message::Binary(frame)).await.is_err() {
                            ok = false;
                            break;
                        }
                    }
                    if !ok {
                        break;
                    }
                }
                Some(ClientEvent::Frame(frame)) => {
                    if sink.send(Message::Binary(frame)).await.is_err() {
                        break;
                    }
                }
                Some(ClientEvent::Closed(reason)) => {
                    send_closed(&mut sink, reason).await;
                    break;
                }
                None => {
                    send_closed(&mut sink, CloseReason::SlowClient).await;
                    break;
                }
            },

            Some(err) = rejects.recv() => {
                if !send_control(&mut sink, &Control::from_error(&err)).await {
                    break;
                }
            }

            // The client went away.
            _ = &mut input => break,
        }
    }

    input.abort();
    hub.detach(id).await;
    let _ = sink.close().await;
}

/// Read client messages and hand them to the hub until the client closes.
/// Rejected frames are reported back on `rejects`.
async fn forward_input(
    mut stream: SplitStream<WebSocket>,
    hub: Arc<RelayHub>,
    id: ClientId,
    key: TabKey,
    rejects: mpsc::Sender<RelayError>,
) {
    while let Some(msg) = stream.next().await {
        let frame = match msg {
            Ok(Message::Binary(data)) => data,
            Ok(Message::Text(text)) => text.into_bytes(),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(tab = %key, client_id = id, error = %e, "client connection ended");
                break;
            }
        };
        match hub.send(id, frame).await {
            Ok(()) => {}
            Err(e @ RelayError::InvalidFrame(_)) => {
                debug!(tab = %key, client_id = id, error = %e, "rejected client frame");
                if rejects.send(e).await.is_err() {
                    break;
                }
            }
            // The hub's Closed event follows.
            Err(RelayError::HubClosed) => {}
            Err(e) => {
                warn!(tab = %key, client_id = id, error = %e, "client frame not delivered");
            }
        }
    }
}
