use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::listeners::{EventBus, ListenerId};
use super::protocol::{self, Command, EventKind, StreamEvent};
use super::transport::{Connection, Connector};
use crate::config::AppConfig;
use crate::core::models::BackupConfiguration;

/// Fixed-interval, bounded reconnection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(3000),
            max_attempts: 5,
        }
    }
}

impl From<&AppConfig> for ReconnectPolicy {
    fn from(config: &AppConfig) -> Self {
        Self {
            delay: config.reconnect_delay(),
            max_attempts: config.max_reconnect_attempts,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    pub connected: bool,
    pub reconnect_attempts: u32,
}

#[derive(Default)]
struct Session {
    state: ConnectionState,
    outbound: Option<mpsc::UnboundedSender<String>>,
    task: Option<JoinHandle<()>>,
    connecting: bool,
    closed: bool,
}

struct Inner {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    bus: EventBus,
    session: Mutex<Session>,
}

/// Client for the push channel of one dashboard session.
///
/// Owns the connection, its listener registry and the reconnect loop. All
/// transport and protocol failures are handled here and surface only as
/// `connection` / `maxReconnectAttemptsReached` events and log lines.
#[derive(Clone)]
pub struct EventStreamClient {
    inner: Arc<Inner>,
}

impl EventStreamClient {
    pub fn new(connector: Arc<dyn Connector>, policy: ReconnectPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                policy,
                bus: EventBus::new(),
                session: Mutex::new(Session::default()),
            }),
        }
    }

    pub fn endpoint(&self) -> &str {
        self.inner.connector.endpoint()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state().connected
    }

    /// Open the connection. Resolves `false` on failure without scheduling any
    /// retry; the reconnect loop only runs after an open connection drops.
    pub async fn connect(&self) -> bool {
        {
            let mut session = self.inner.lock();
            if session.closed {
                warn!("connect() called after disconnect()");
                return false;
            }
            if session.state.connected {
                return true;
            }
            if session.connecting {
                debug!("Connect already in progress");
                return false;
            }
            session.connecting = true;
            // A manual connect supersedes a running reconnect loop.
            if let Some(task) = session.task.take() {
                task.abort();
            }
        }

        let endpoint = self.endpoint().to_string();
        let result = self.inner.connector.connect().await;
        self.inner.lock().connecting = false;

        match result {
            Ok(conn) => {
                let Some(inbound) = self.inner.install(conn) else {
                    return false;
                };
                info!(%endpoint, "Connected to push endpoint");
                self.inner.bus.emit(&StreamEvent::Connection { connected: true });

                let task = tokio::spawn(run_session(self.inner.clone(), inbound));
                let mut session = self.inner.lock();
                if session.closed {
                    task.abort();
                } else {
                    session.task = Some(task);
                }
                true
            }
            Err(e) => {
                warn!(%endpoint, error = %e, "Failed to connect to push endpoint");
                false
            }
        }
    }

    /// Close the connection, cancel any pending reconnect and drop all listeners.
    /// Safe to call repeatedly.
    pub fn disconnect(&self) {
        let (task, was_connected) = {
            let mut session = self.inner.lock();
            if session.closed {
                return;
            }
            session.closed = true;
            let was_connected = session.state.connected;
            session.state = ConnectionState::default();
            session.outbound = None;
            (session.task.take(), was_connected)
        };

        if let Some(task) = task {
            task.abort();
        }
        if was_connected {
            self.inner.bus.emit(&StreamEvent::Connection { connected: false });
        }
        self.inner.bus.clear();
        info!(endpoint = %self.endpoint(), "Disconnected from push endpoint");
    }

    pub fn on<F>(&self, kind: EventKind, callback: F) -> ListenerId
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        self.inner.bus.on(kind, callback)
    }

    pub fn off(&self, kind: EventKind, id: ListenerId) -> bool {
        self.inner.bus.off(kind, id)
    }

    /// Queue an outbound command. Returns `false` (and logs) when the
    /// connection is not open.
    pub fn send_message(&self, command: Command, data: Value) -> bool {
        let outbound = {
            let session = self.inner.lock();
            if session.state.connected {
                session.outbound.clone()
            } else {
                None
            }
        };

        let Some(outbound) = outbound else {
            warn!(command = command.as_str(), "Push connection not open, message dropped");
            return false;
        };

        let frame = match protocol::encode(command, data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(command = command.as_str(), error = %e, "Failed to encode message");
                return false;
            }
        };

        if outbound.send(frame).is_err() {
            warn!(command = command.as_str(), "Push connection closed while sending");
            return false;
        }
        true
    }

    pub fn start_backup(&self, client_id: &str) -> bool {
        self.send_message(Command::StartBackup, json!({ "clientId": client_id }))
    }

    pub fn test_ssh_connection(&self, client_id: &str) -> bool {
        self.send_message(Command::TestSshConnection, json!({ "clientId": client_id }))
    }

    pub fn save_configuration(&self, config: &BackupConfiguration) -> bool {
        match serde_json::to_value(config) {
            Ok(data) => self.send_message(Command::SaveConfiguration, data),
            Err(e) => {
                warn!(client_id = %config.client_id, error = %e, "Failed to encode configuration");
                false
            }
        }
    }

    pub fn get_configuration(&self, client_id: &str) -> bool {
        self.send_message(Command::GetConfiguration, json!({ "clientId": client_id }))
    }

    /// Ask the backend to push `JOB_STATUS_DATA`, for one client or all of them.
    pub fn get_job_status(&self, client_id: Option<&str>) -> bool {
        let data = match client_id {
            Some(client_id) => json!({ "clientId": client_id }),
            None => json!({}),
        };
        self.send_message(Command::GetJobStatus, data)
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a freshly opened connection. Returns `None` if the client was
    /// torn down while the connection was being opened.
    fn install(&self, conn: Connection) -> Option<mpsc::UnboundedReceiver<String>> {
        let mut session = self.lock();
        if session.closed {
            return None;
        }
        session.state = ConnectionState {
            connected: true,
            reconnect_attempts: 0,
        };
        session.outbound = Some(conn.outbound);
        Some(conn.inbound)
    }

    /// Returns `false` if the close was caused by `disconnect()`.
    fn mark_disconnected(&self) -> bool {
        let mut session = self.lock();
        session.state.connected = false;
        session.outbound = None;
        !session.closed
    }

    fn dispatch(&self, text: &str) {
        match protocol::decode(text) {
            Ok((event, timestamp)) => {
                debug!(event = event.kind().as_str(), ?timestamp, "Push event");
                self.bus.emit(&event);
            }
            Err(e) => warn!(error = %e, "Dropping push message"),
        }
    }

    /// Sleep the fixed delay and try again, until a connection opens or the
    /// attempt budget is spent.
    async fn reconnect(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        let max = self.policy.max_attempts;
        loop {
            let attempt = {
                let mut session = self.lock();
                if session.closed {
                    return None;
                }
                if session.state.reconnect_attempts >= max {
                    None
                } else {
                    session.state.reconnect_attempts += 1;
                    Some(session.state.reconnect_attempts)
                }
            };

            let Some(attempt) = attempt else {
                error!(attempts = max, "Max reconnect attempts reached, giving up");
                self.bus
                    .emit(&StreamEvent::MaxReconnectAttemptsReached { attempts: max });
                return None;
            };

            info!(
                attempt,
                max,
                delay_ms = self.policy.delay.as_millis() as u64,
                "Scheduling reconnect"
            );
            tokio::time::sleep(self.policy.delay).await;

            match self.connector.connect().await {
                Ok(conn) => {
                    let inbound = self.install(conn)?;
                    info!(attempt, "Reconnected to push endpoint");
                    self.bus.emit(&StreamEvent::Connection { connected: true });
                    return Some(inbound);
                }
                Err(e) => warn!(attempt, error = %e, "Reconnect attempt failed"),
            }
        }
    }
}

/// The single task that owns an open connection: reads frames, and on an
/// unexpected close runs the reconnect loop and carries on with the new one.
async fn run_session(inner: Arc<Inner>, mut inbound: mpsc::UnboundedReceiver<String>) {
    loop {
        while let Some(text) = inbound.recv().await {
            inner.dispatch(&text);
        }

        if !inner.mark_disconnected() {
            return;
        }
        warn!("Push connection lost");
        inner.bus.emit(&StreamEvent::Connection { connected: false });

        match inner.reconnect().await {
            Some(next) => inbound = next,
            None => return,
        }
    }
}
