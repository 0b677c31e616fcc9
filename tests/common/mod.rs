//! Fake dashboard backend: the backup REST endpoints plus the push socket.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::time::{Instant, sleep};

use bkmon::config::AppConfig;

/// Push frame that makes the server close every open socket.
pub const CLOSE_SOCKETS: &str = "__close__";

#[derive(Clone)]
pub struct BackendState {
    push: broadcast::Sender<String>,
    connections: Arc<AtomicUsize>,
    next_job_id: Arc<AtomicI64>,
    pub started: Arc<Mutex<Vec<String>>>,
    pub received: Arc<Mutex<Vec<String>>>,
    pub sessions: Arc<Mutex<Vec<String>>>,
    pub auth: Arc<Mutex<Vec<String>>>,
    pub history_limits: Arc<Mutex<Vec<usize>>>,
    pub active: Arc<Mutex<Vec<Value>>>,
    pub history: Arc<Mutex<Vec<Value>>>,
}

pub struct FakeBackend {
    pub addr: SocketAddr,
    pub state: BackendState,
}

impl FakeBackend {
    pub async fn spawn() -> Self {
        let (push, _) = broadcast::channel(64);
        let state = BackendState {
            push,
            connections: Arc::new(AtomicUsize::new(0)),
            next_job_id: Arc::new(AtomicI64::new(1)),
            started: Arc::default(),
            received: Arc::default(),
            sessions: Arc::default(),
            auth: Arc::default(),
            history_limits: Arc::default(),
            active: Arc::default(),
            history: Arc::default(),
        };

        let app = Router::new()
            .route("/api/backup/start/{client_id}", post(start_backup))
            .route("/api/backup/jobs/active", get(active_jobs))
            .route("/api/backup/jobs/{client_id}", get(client_jobs))
            .route("/api/backup/test-ssh/{client_id}", post(test_ssh))
            .route("/ws/backup", get(ws_handler))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake backend");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve fake backend");
        });

        Self { addr, state }
    }

    pub fn api_url(&self) -> String {
        format!("http://{}/api/backup", self.addr)
    }

    pub fn push_url(&self) -> String {
        format!("ws://{}/ws/backup", self.addr)
    }

    pub fn config(&self) -> AppConfig {
        AppConfig {
            api_url: self.api_url(),
            push_url: self.push_url(),
            session_id: "dashboard-test".into(),
            reconnect_delay_ms: 50,
            refresh_debounce_ms: 100,
            poll_interval_secs: 1,
            ..AppConfig::default()
        }
    }

    /// Send a frame to every connected socket.
    pub fn push(&self, kind: &str, data: Value) {
        let frame = json!({ "type": kind, "data": data, "timestamp": 1_700_000_000_000i64 });
        let _ = self.state.push.send(frame.to_string());
    }

    pub fn push_raw(&self, frame: &str) {
        let _ = self.state.push.send(frame.to_string());
    }

    pub fn close_sockets(&self) {
        let _ = self.state.push.send(CLOSE_SOCKETS.to_string());
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<String> {
        self.state.received.lock().unwrap().clone()
    }

    pub async fn wait_for_connections(&self, n: usize) {
        wait_until(|| async { self.connections() >= n }).await;
    }
}

/// Poll `check` until it holds, failing the test after five seconds.
pub async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(Instant::now() < deadline, "condition not met in time");
        sleep(Duration::from_millis(10)).await;
    }
}

fn record_auth(state: &BackendState, headers: &HeaderMap) {
    if let Some(value) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        state.auth.lock().unwrap().push(value.to_string());
    }
}

async fn start_backup(
    State(state): State<BackendState>,
    Path(client_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    record_auth(&state, &headers);
    state.started.lock().unwrap().push(client_id.clone());

    match client_id.as_str() {
        "broken" => (StatusCode::INTERNAL_SERVER_ERROR, "rsync missing").into_response(),
        "queued" => Json(json!({ "message": "Backup queued" })).into_response(),
        _ => {
            let job_id = state.next_job_id.fetch_add(1, Ordering::SeqCst);
            Json(json!({ "jobId": job_id, "message": "Backup started" })).into_response()
        }
    }
}

async fn active_jobs(State(state): State<BackendState>, headers: HeaderMap) -> Json<Vec<Value>> {
    record_auth(&state, &headers);
    Json(state.active.lock().unwrap().clone())
}

async fn client_jobs(
    State(state): State<BackendState>,
    Path(client_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Vec<Value>> {
    let limit = query
        .get("limit")
        .and_then(|l| l.parse().ok())
        .unwrap_or(usize::MAX);
    state.history_limits.lock().unwrap().push(limit);
    let jobs = state
        .history
        .lock()
        .unwrap()
        .iter()
        .filter(|job| job["clientId"] == client_id.as_str())
        .take(limit)
        .cloned()
        .collect();
    Json(jobs)
}

async fn test_ssh(Path(client_id): Path<String>) -> Json<Value> {
    let success = client_id != "unreachable";
    let message = if success {
        "Connection successful"
    } else {
        "Connection refused"
    };
    Json(json!({ "success": success, "message": message }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<BackendState>,
) -> impl IntoResponse {
    if let Some(session) = query.get("clientId") {
        state.sessions.lock().unwrap().push(session.clone());
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: BackendState) {
    let mut push = state.push.subscribe();
    let (mut sink, mut stream) = socket.split();

    let hello = json!({ "type": "CONNECTION_ESTABLISHED", "data": { "status": "connected" } });
    if sink.send(Message::Text(hello.to_string().into())).await.is_err() {
        return;
    }
    state.connections.fetch_add(1, Ordering::SeqCst);

    loop {
        tokio::select! {
            frame = push.recv() => match frame {
                Ok(frame) if frame == CLOSE_SOCKETS => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                Ok(frame) => {
                    if sink.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    state.received.lock().unwrap().push(text.to_string());
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    state.connections.fetch_sub(1, Ordering::SeqCst);
}
