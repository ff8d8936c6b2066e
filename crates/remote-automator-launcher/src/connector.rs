//! `Connector` and `Connection` over the developer-tool websocket.

use std::{
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use remote_automator_core::{
    Connection, ConnectionError, Connector, EventValue, LaunchOptions, TargetEvent,
};
use remote_automator_transport::{
    Event, TransportError, WsClient,
    protocol::{events, methods},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::{
    sync::{Mutex, broadcast, broadcast::error::RecvError},
    task::JoinHandle,
};

use crate::{cli::resolve_cli_path, command::LaunchCommand};

/// How long a launch may take before the endpoint must accept.
pub const DEFAULT_LAUNCH_TIMEOUT: Duration = Duration::from_millis(30_000);

const POLL_INTERVAL: Duration = Duration::from_millis(250);
const EXIT_TIMEOUT: Duration = Duration::from_secs(3);
const EVENT_CAPACITY: usize = 1024;

/// Top of the target's navigation stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    #[serde(default)]
    pub page_id: Option<u64>,
    pub path: String,
    #[serde(default)]
    pub query: Value,
}

fn map_transport(err: TransportError) -> ConnectionError {
    match err {
        TransportError::Connect { endpoint, reason } => {
            ConnectionError::Handshake(format!("{endpoint}: {reason}"))
        }
        TransportError::ConnectTimeout { duration, .. } | TransportError::Timeout { duration, .. } => {
            ConnectionError::Timeout(duration)
        }
        TransportError::Remote { method, message } => {
            ConnectionError::Target(format!("{method}: {message}"))
        }
        TransportError::Closed => ConnectionError::Closed,
        TransportError::Protocol(msg) => ConnectionError::Protocol(msg),
        TransportError::Json(e) => ConnectionError::Protocol(e.to_string()),
    }
}

/// Translate a wire event into a captured event, if it is one we log.
#[must_use]
pub fn target_event(event: &Event) -> Option<TargetEvent> {
    match event.method.as_str() {
        events::LOG_ADDED => Some(TargetEvent::Console {
            kind: event
                .params
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("log")
                .to_owned(),
            payload: EventValue::from(event.params.clone()),
        }),
        events::EXCEPTION_THROWN => Some(TargetEvent::Exception {
            payload: EventValue::from(event.params.clone()),
        }),
        _ => None,
    }
}

/// Dials or launches the developer-tool target.
#[derive(Debug, Clone)]
pub struct DevtoolsConnector {
    poll_interval: Duration,
}

impl Default for DevtoolsConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl DevtoolsConnector {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Override the delay between launch readiness probes.
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Probe `endpoint` until it accepts, the child exits or `timeout` passes.
    async fn wait_for_endpoint(
        &self,
        endpoint: &str,
        child: &mut AsyncGroupChild,
        timeout: Duration,
    ) -> Result<WsClient, ConnectionError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                return Err(ConnectionError::SpawnFailed(format!(
                    "target exited with {status} before accepting connections"
                )));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ConnectionError::Timeout(timeout));
            }

            match WsClient::connect(endpoint, Some(remaining)).await {
                Ok(client) => return Ok(client),
                Err(e) => tracing::trace!(endpoint, error = %e, "target not ready yet"),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(self.poll_interval.min(remaining)).await;
        }
    }
}

#[async_trait]
impl Connector for DevtoolsConnector {
    type Connection = DevtoolsConnection;

    async fn connect(
        &self,
        ws_endpoint: &str,
        timeout: Option<Duration>,
    ) -> Result<DevtoolsConnection, ConnectionError> {
        let client = WsClient::connect(ws_endpoint, timeout)
            .await
            .map_err(map_transport)?;
        DevtoolsConnection::attach(client, None).await
    }

    async fn launch(&self, options: &LaunchOptions) -> Result<DevtoolsConnection, ConnectionError> {
        let command = LaunchCommand::from_options(options);
        let executable = resolve_cli_path(command.program.as_deref()).await?;
        let endpoint = command.endpoint();

        tracing::info!(
            command = %command.display(&executable),
            endpoint,
            "launching automation target"
        );

        let mut child = command
            .to_command(&executable)
            .group_spawn()
            .map_err(|e| ConnectionError::SpawnFailed(format!("{}: {e}", executable.display())))?;

        let timeout = options.timeout.unwrap_or(DEFAULT_LAUNCH_TIMEOUT);
        match self.wait_for_endpoint(&endpoint, &mut child, timeout).await {
            Ok(client) => DevtoolsConnection::attach(client, Some(child)).await,
            Err(e) => {
                if let Err(kill_err) = child.kill().await {
                    tracing::debug!(error = %kill_err, "failed to kill target after launch failure");
                }
                Err(e)
            }
        }
    }
}

/// Live connection to the target, optionally owning its process group.
pub struct DevtoolsConnection {
    client: Arc<WsClient>,
    events: broadcast::Sender<TargetEvent>,
    /// Receiver opened before log delivery was enabled; handed to the first
    /// `events()` caller so startup events are kept.
    startup_events: StdMutex<Option<broadcast::Receiver<TargetEvent>>>,
    pump: JoinHandle<()>,
    child: Mutex<Option<AsyncGroupChild>>,
}

impl DevtoolsConnection {
    async fn attach(client: WsClient, child: Option<AsyncGroupChild>) -> Result<Self, ConnectionError> {
        let client = Arc::new(client);
        let (events, startup_events) = broadcast::channel(EVENT_CAPACITY);
        // Subscribe before enabling logs so nothing is missed.
        let pump = tokio::spawn(pump_events(client.subscribe(), events.clone()));

        let connection = Self {
            client,
            events,
            startup_events: StdMutex::new(Some(startup_events)),
            pump,
            child: Mutex::new(child),
        };

        if let Err(e) = connection.client.call(methods::ENABLE_LOG, json!({ "enable": true })).await {
            let err = map_transport(e);
            let cleanup = if connection.owns_process().await {
                connection.close().await
            } else {
                connection.disconnect().await
            };
            if let Err(close_err) = cleanup {
                tracing::debug!(error = %close_err, "cleanup after failed attach");
            }
            return Err(err);
        }

        tracing::debug!(endpoint = connection.client.endpoint(), "attached to automation target");
        Ok(connection)
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        self.client.endpoint()
    }

    /// Whether this connection owns a launched process.
    pub async fn owns_process(&self) -> bool {
        self.child.lock().await.is_some()
    }

    /// Raw protocol call against the target.
    ///
    /// # Errors
    /// Returns error if the call fails or times out.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, ConnectionError> {
        self.client.call(method, params).await.map_err(map_transport)
    }
}

#[async_trait]
impl Connection for DevtoolsConnection {
    type Page = PageInfo;

    fn events(&self) -> broadcast::Receiver<TargetEvent> {
        self.startup_events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_else(|| self.events.subscribe())
    }

    async fn current_page(&self) -> Result<Option<PageInfo>, ConnectionError> {
        let result = self.call(methods::GET_CURRENT_PAGE, json!({})).await?;
        match result {
            Value::Null => Ok(None),
            Value::Object(ref map) if map.is_empty() => Ok(None),
            other => serde_json::from_value(other)
                .map(Some)
                .map_err(|e| ConnectionError::Protocol(format!("malformed page: {e}"))),
        }
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        if !self.client.is_closed() {
            if let Err(e) = self.client.call_with_timeout(methods::EXIT, json!({}), EXIT_TIMEOUT).await {
                tracing::debug!(error = %e, "target did not acknowledge exit");
            }
        }
        let closed = self.client.close().await.map_err(map_transport);
        self.pump.abort();

        if let Some(mut child) = self.child.lock().await.take() {
            child.kill().await?;
            tracing::debug!("killed target process group");
        }
        closed
    }

    async fn disconnect(&self) -> Result<(), ConnectionError> {
        let closed = self.client.close().await.map_err(map_transport);
        self.pump.abort();
        closed
    }
}

impl Drop for DevtoolsConnection {
    fn drop(&mut self) {
        self.pump.abort();
        if let Some(child) = self.child.get_mut().as_mut() {
            let _ = child.start_kill();
        }
    }
}

async fn pump_events(mut incoming: broadcast::Receiver<Event>, events: broadcast::Sender<TargetEvent>) {
    loop {
        match incoming.recv().await {
            Ok(event) => {
                if let Some(event) = target_event(&event) {
                    let _ = events.send(event);
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "dropped target events");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_test::assert_ok;
    use tokio_tungstenite::tungstenite::Message;

    use super::*;

    /// Fake target. `page` is what `App.getCurrentPage` returns.
    async fn spawn_target(page: Value) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                let Message::Text(text) = msg else { continue };
                let req: Value = serde_json::from_str(&text.to_string()).unwrap();
                let result = match req["method"].as_str().unwrap() {
                    methods::GET_CURRENT_PAGE => page.clone(),
                    _ => json!({}),
                };
                let reply = json!({ "id": req["id"], "result": result });
                ws.send(Message::Text(reply.to_string().into())).await.unwrap();

                if req["method"] == methods::ENABLE_LOG {
                    let log = json!({
                        "method": events::LOG_ADDED,
                        "params": { "type": "warn", "args": ["low", "memory"] }
                    });
                    ws.send(Message::Text(log.to_string().into())).await.unwrap();
                }
            }
        });
        format!("ws://{addr}")
    }

    #[test]
    fn test_target_event_mapping() {
        let log = Event {
            method: events::LOG_ADDED.into(),
            params: json!({ "type": "error", "args": ["x", 1] }),
        };
        let mapped = target_event(&log).unwrap();
        assert_eq!(mapped.kind(), "error");
        assert_eq!(mapped.message(), "x 1");

        let exception = Event {
            method: events::EXCEPTION_THROWN.into(),
            params: json!({ "message": "undefined is not a function", "stack": "at onLoad" }),
        };
        let mapped = target_event(&exception).unwrap();
        assert_eq!(mapped.kind(), "exception");
        assert_eq!(mapped.message(), "undefined is not a function");

        let other = Event {
            method: "App.bindingCalled".into(),
            params: Value::Null,
        };
        assert!(target_event(&other).is_none());
    }

    #[test]
    fn test_map_transport_errors() {
        assert!(matches!(map_transport(TransportError::Closed), ConnectionError::Closed));
        assert!(matches!(
            map_transport(TransportError::Timeout {
                method: "App.exit".into(),
                duration: Duration::from_secs(1),
            }),
            ConnectionError::Timeout(d) if d == Duration::from_secs(1)
        ));
        assert!(matches!(
            map_transport(TransportError::Remote {
                method: "App.exit".into(),
                message: "nope".into(),
            }),
            ConnectionError::Target(m) if m == "App.exit: nope"
        ));
    }

    #[tokio::test]
    async fn test_connect_streams_events_and_reads_page() {
        let endpoint =
            spawn_target(json!({ "pageId": 2, "path": "pages/index/index", "query": { "a": "1" } })).await;
        let connector = DevtoolsConnector::new();
        let connection = connector
            .connect(&endpoint, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(!connection.owns_process().await);

        let page = connection.current_page().await.unwrap().unwrap();
        assert_eq!(page.path, "pages/index/index");
        assert_eq!(page.page_id, Some(2));
        assert_eq!(page.query["a"], "1");

        // Emitted right after the enableLog reply, before anyone subscribed.
        let mut events = connection.events();
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind(), "warn");
        assert_eq!(event.message(), "low memory");

        // Later subscribers only see later events.
        let mut late = connection.events();
        assert!(matches!(
            late.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));

        assert_ok!(connection.disconnect().await);
        assert!(matches!(
            connection.current_page().await,
            Err(ConnectionError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_empty_navigation_stack_is_none() {
        let endpoint = spawn_target(Value::Null).await;
        let connection = DevtoolsConnector::new().connect(&endpoint, None).await.unwrap();
        assert!(assert_ok!(connection.current_page().await).is_none());
        assert_ok!(connection.close().await);
    }

    #[tokio::test]
    async fn test_connect_failure_is_handshake_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = DevtoolsConnector::new()
            .connect(&format!("ws://{addr}"), Some(Duration::from_secs(2)))
            .await;
        assert!(matches!(result, Err(ConnectionError::Handshake(_))));
    }

    #[tokio::test]
    async fn test_launch_with_missing_cli() {
        let options = LaunchOptions {
            cli_path: Some("/definitely/not/here/cli".into()),
            project_path: "/tmp/project".into(),
            timeout: Some(Duration::from_millis(200)),
            port: None,
            account: None,
            ticket: None,
            trust_project: false,
            args: vec![],
            cwd: None,
        };
        let result = DevtoolsConnector::new().launch(&options).await;
        assert!(matches!(result, Err(ConnectionError::ExecutableNotFound(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_fails_early_when_target_exits() {
        let options = LaunchOptions {
            cli_path: Some("false".into()),
            project_path: "/tmp/project".into(),
            timeout: Some(Duration::from_secs(10)),
            port: Some(1),
            account: None,
            ticket: None,
            trust_project: false,
            args: vec![],
            cwd: None,
        };
        let started = Instant::now();
        let result = DevtoolsConnector::new()
            .with_poll_interval(Duration::from_millis(20))
            .launch(&options)
            .await;
        assert!(matches!(result, Err(ConnectionError::SpawnFailed(_))));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
