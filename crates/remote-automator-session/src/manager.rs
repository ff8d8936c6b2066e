//! Session manager owning at most one connection to the automation target.

use std::{future::Future, sync::Arc};

use remote_automator_core::{
    Connection, ConnectionMode, ConnectionOverrides, ConnectionTarget, Connector, EnvSnapshot,
    LogBuffer, LogEntry, ResolvedConfig, SessionError, resolve,
};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Page context type produced by a connector's connections.
pub type PageOf<K> = <<K as Connector>::Connection as Connection>::Page;

/// Per-call connection parameters.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRequest {
    /// Highest-precedence configuration layer.
    pub overrides: Option<ConnectionOverrides>,
    /// Tear down any active session before resolving reuse.
    pub reconnect: bool,
}

impl ConnectionRequest {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_overrides(mut self, overrides: ConnectionOverrides) -> Self {
        self.overrides = Some(overrides);
        self
    }

    #[must_use]
    pub fn reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }
}

impl From<Option<ConnectionOverrides>> for ConnectionRequest {
    fn from(overrides: Option<ConnectionOverrides>) -> Self {
        Self {
            overrides,
            reconnect: false,
        }
    }
}

/// Active session state.
struct ActiveSession<C: Connection> {
    id: Uuid,
    connection: Arc<C>,
    config: ResolvedConfig,
    forwarder: JoinHandle<()>,
}

enum SessionState<C: Connection> {
    NoSession,
    Active(ActiveSession<C>),
}

/// Session manager for a single automation target.
///
/// Lifecycle methods take `&mut self`; share a manager behind a
/// `tokio::sync::Mutex` to serialise concurrent callers.
pub struct SessionManager<K>
where
    K: Connector,
{
    connector: K,
    state: SessionState<K::Connection>,
    logs: Arc<LogBuffer>,
    env: Option<EnvSnapshot>,
}

impl<K> SessionManager<K>
where
    K: Connector,
{
    /// Create a manager that reads the process environment on every call.
    #[must_use]
    pub fn new(connector: K) -> Self {
        Self {
            connector,
            state: SessionState::NoSession,
            logs: Arc::new(LogBuffer::new()),
            env: None,
        }
    }

    /// Resolve against a fixed environment snapshot instead of the process environment.
    #[must_use]
    pub fn with_env(mut self, env: EnvSnapshot) -> Self {
        self.env = Some(env);
        self
    }

    /// Run `operation` with a guaranteed-active connection.
    ///
    /// Reuses the active session when the freshly resolved config equals the
    /// one that opened it, otherwise reconnects. With `autoClose` the session
    /// is torn down afterwards whatever the operation returned.
    ///
    /// # Errors
    /// Returns the configuration or connection error converted into `E`, or
    /// the operation's own error unchanged.
    pub async fn run_with_connection<T, E, F, Fut>(
        &mut self,
        request: ConnectionRequest,
        operation: F,
    ) -> Result<T, E>
    where
        F: FnOnce(Arc<K::Connection>, ResolvedConfig) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<SessionError>,
    {
        let (connection, config) = self.ensure_connection(request).await.map_err(E::from)?;
        let auto_close = config.auto_close();

        let result = operation(connection, config).await;

        if auto_close {
            debug!("auto-closing session after operation");
            self.teardown().await;
        }
        result
    }

    /// Run `operation` against the current page of a guaranteed-active connection.
    ///
    /// # Errors
    /// Returns [`SessionError::NoPage`] (converted into `E`) without invoking
    /// `operation` when the navigation stack is empty.
    pub async fn run_with_page_context<T, E, F, Fut>(
        &mut self,
        overrides: Option<ConnectionOverrides>,
        operation: F,
    ) -> Result<T, E>
    where
        F: FnOnce(PageOf<K>, Arc<K::Connection>, ResolvedConfig) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<SessionError>,
    {
        self.run_with_connection(ConnectionRequest::from(overrides), move |connection, config| async move {
            let page = connection
                .current_page()
                .await
                .map_err(|e| E::from(SessionError::Target(e.to_string())))?
                .ok_or_else(|| E::from(SessionError::NoPage))?;
            operation(page, connection, config).await
        })
        .await
    }

    /// Close the active session, if any.
    ///
    /// Never fails: close errors are logged and the manager always ends
    /// with no active session.
    pub async fn teardown(&mut self) {
        let SessionState::Active(active) = std::mem::replace(&mut self.state, SessionState::NoSession)
        else {
            return;
        };
        let ActiveSession {
            id,
            connection,
            config,
            forwarder,
        } = active;

        // Stop forwarding before the connection goes away.
        forwarder.abort();
        let _ = forwarder.await;

        let result = match config.mode {
            ConnectionMode::Launch => connection.close().await,
            ConnectionMode::Connect => connection.disconnect().await,
        };
        match result {
            Ok(()) => info!(session_id = %id, mode = %config.mode, "session closed"),
            Err(e) => warn!(session_id = %id, mode = %config.mode, "failed to close session: {e}"),
        }
    }

    /// Whether a session is active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self.state, SessionState::Active(_))
    }

    /// Config of the active session.
    #[must_use]
    pub fn active_config(&self) -> Option<&ResolvedConfig> {
        match &self.state {
            SessionState::Active(active) => Some(&active.config),
            SessionState::NoSession => None,
        }
    }

    /// Identifier of the active session.
    #[must_use]
    pub fn session_id(&self) -> Option<Uuid> {
        match &self.state {
            SessionState::Active(active) => Some(active.id),
            SessionState::NoSession => None,
        }
    }

    /// Copy of the captured log entries, oldest first.
    #[must_use]
    pub fn log_entries(&self) -> Vec<LogEntry> {
        self.logs.entries()
    }

    pub fn clear_log_entries(&self) {
        self.logs.clear();
    }

    /// Receiver for log entries captured from now on.
    #[must_use]
    pub fn subscribe_logs(&self) -> broadcast::Receiver<LogEntry> {
        self.logs.subscribe()
    }

    /// Captured history followed by live entries.
    #[must_use]
    pub fn log_stream(&self) -> futures::stream::BoxStream<'static, LogEntry> {
        self.logs.history_plus_stream()
    }

    /// Shared handle to the log buffer.
    #[must_use]
    pub fn log_buffer(&self) -> Arc<LogBuffer> {
        Arc::clone(&self.logs)
    }

    async fn ensure_connection(
        &mut self,
        request: ConnectionRequest,
    ) -> Result<(Arc<K::Connection>, ResolvedConfig), SessionError> {
        let previous = self.active_config();
        let config = match &self.env {
            Some(env) => resolve(request.overrides.as_ref(), previous, env)?,
            None => resolve(request.overrides.as_ref(), previous, &EnvSnapshot::capture())?,
        };

        if request.reconnect {
            self.teardown().await;
        }

        if let SessionState::Active(active) = &self.state {
            if active.config == config {
                debug!(session_id = %active.id, "reusing session");
                return Ok((Arc::clone(&active.connection), config));
            }
            debug!(session_id = %active.id, "config changed; reconnecting");
        }

        self.teardown().await;

        let connection = Arc::new(self.open(&config).await?);
        let forwarder = Arc::clone(&self.logs).spawn_forwarder(connection.events());
        let id = Uuid::new_v4();
        info!(session_id = %id, mode = %config.mode, "session established");

        self.state = SessionState::Active(ActiveSession {
            id,
            connection: Arc::clone(&connection),
            config: config.clone(),
            forwarder,
        });
        Ok((connection, config))
    }

    async fn open(&self, config: &ResolvedConfig) -> Result<K::Connection, SessionError> {
        match config.target()? {
            ConnectionTarget::Connect { ws_endpoint, timeout } => {
                match self.connector.connect(&ws_endpoint, timeout).await {
                    Ok(connection) => Ok(connection),
                    Err(e) => {
                        warn!(endpoint = %ws_endpoint, "connect failed: {e}");
                        Err(SessionError::Connect {
                            endpoint: ws_endpoint,
                            reason: e.to_string(),
                        })
                    }
                }
            }
            ConnectionTarget::Launch(options) => match self.connector.launch(&options).await {
                Ok(connection) => Ok(connection),
                Err(e) => {
                    warn!(project_path = %options.project_path, "launch failed: {e}");
                    Err(SessionError::Launch {
                        project_path: options.project_path,
                        reason: e.to_string(),
                    })
                }
            },
        }
    }
}

impl<K> Drop for SessionManager<K>
where
    K: Connector,
{
    fn drop(&mut self) {
        if let SessionState::Active(active) = &self.state {
            active.forwarder.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Mutex,
            atomic::{AtomicBool, AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use remote_automator_core::{ConnectionError, EventValue, LaunchOptions, TargetEvent};
    use tokio_test::assert_ok;

    use super::*;

    #[derive(Default)]
    struct Counters {
        connects: AtomicUsize,
        launches: AtomicUsize,
        closes: AtomicUsize,
        disconnects: AtomicUsize,
        fail_open: AtomicBool,
        fail_close: AtomicBool,
        empty_stack: AtomicBool,
        last_events: Mutex<Option<broadcast::Sender<TargetEvent>>>,
    }

    #[derive(Clone, Default)]
    struct FakeConnector {
        counters: Arc<Counters>,
    }

    struct FakeConnection {
        counters: Arc<Counters>,
        events: broadcast::Sender<TargetEvent>,
    }

    impl FakeConnector {
        fn open(&self) -> Result<FakeConnection, ConnectionError> {
            if self.counters.fail_open.load(Ordering::SeqCst) {
                return Err(ConnectionError::Handshake("connection refused".into()));
            }
            let (events, _) = broadcast::channel(64);
            *self.counters.last_events.lock().unwrap() = Some(events.clone());
            Ok(FakeConnection {
                counters: Arc::clone(&self.counters),
                events,
            })
        }

        fn emit(&self, event: TargetEvent) {
            let sender = self.counters.last_events.lock().unwrap().clone().unwrap();
            sender.send(event).unwrap();
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        type Connection = FakeConnection;

        async fn connect(
            &self,
            _ws_endpoint: &str,
            _timeout: Option<Duration>,
        ) -> Result<FakeConnection, ConnectionError> {
            self.counters.connects.fetch_add(1, Ordering::SeqCst);
            self.open()
        }

        async fn launch(&self, _options: &LaunchOptions) -> Result<FakeConnection, ConnectionError> {
            self.counters.launches.fetch_add(1, Ordering::SeqCst);
            self.open()
        }
    }

    #[async_trait]
    impl Connection for FakeConnection {
        type Page = String;

        fn events(&self) -> broadcast::Receiver<TargetEvent> {
            self.events.subscribe()
        }

        async fn current_page(&self) -> Result<Option<String>, ConnectionError> {
            if self.counters.empty_stack.load(Ordering::SeqCst) {
                Ok(None)
            } else {
                Ok(Some("pages/index/index".into()))
            }
        }

        async fn close(&self) -> Result<(), ConnectionError> {
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
            if self.counters.fail_close.load(Ordering::SeqCst) {
                return Err(ConnectionError::Target("close failed".into()));
            }
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), ConnectionError> {
            self.counters.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn manager() -> (SessionManager<FakeConnector>, Arc<Counters>) {
        let connector = FakeConnector::default();
        let counters = Arc::clone(&connector.counters);
        (SessionManager::new(connector).with_env(EnvSnapshot::default()), counters)
    }

    fn launch_overrides(args: &[&str]) -> ConnectionOverrides {
        ConnectionOverrides {
            project_path: Some("/work/app".into()),
            args: Some(args.iter().map(|a| (*a).to_string()).collect()),
            ..Default::default()
        }
    }

    fn request(overrides: ConnectionOverrides) -> ConnectionRequest {
        ConnectionRequest::new().with_overrides(overrides)
    }

    async fn noop(manager: &mut SessionManager<FakeConnector>, req: ConnectionRequest) -> Result<(), SessionError> {
        manager.run_with_connection(req, |_, _| async { Ok(()) }).await
    }

    #[tokio::test]
    async fn test_identical_config_reuses_session() {
        let (mut manager, counters) = manager();
        assert_ok!(noop(&mut manager, request(launch_overrides(&["--a", "--b"]))).await);
        let first = manager.session_id();
        assert_ok!(noop(&mut manager, request(launch_overrides(&["--a", "--b"]))).await);

        assert_eq!(counters.launches.load(Ordering::SeqCst), 1);
        assert_eq!(manager.session_id(), first);
    }

    #[tokio::test]
    async fn test_reordered_args_force_reconnect() {
        let (mut manager, counters) = manager();
        assert_ok!(noop(&mut manager, request(launch_overrides(&["--a", "--b"]))).await);
        assert_ok!(noop(&mut manager, request(launch_overrides(&["--b", "--a"]))).await);

        assert_eq!(counters.launches.load(Ordering::SeqCst), 2);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        assert!(manager.is_active());
    }

    #[tokio::test]
    async fn test_previous_config_carries_project_path() {
        let (mut manager, counters) = manager();
        assert_ok!(noop(&mut manager, request(launch_overrides(&[]))).await);
        assert_ok!(noop(&mut manager, ConnectionRequest::new()).await);

        assert_eq!(counters.launches.load(Ordering::SeqCst), 1);
        assert_eq!(
            manager.active_config().and_then(|c| c.project_path.as_deref()),
            Some("/work/app")
        );
    }

    #[tokio::test]
    async fn test_reconnect_flag_forces_new_session() {
        let (mut manager, counters) = manager();
        assert_ok!(noop(&mut manager, request(launch_overrides(&[]))).await);
        assert_ok!(noop(&mut manager, request(launch_overrides(&[])).reconnect(true)).await);

        assert_eq!(counters.launches.load(Ordering::SeqCst), 2);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_operation_receives_resolved_config() {
        let (mut manager, _) = manager();
        let mode = manager
            .run_with_connection(request(launch_overrides(&[])), |_, config| async move {
                Ok::<_, SessionError>(config.mode)
            })
            .await
            .unwrap();
        assert_eq!(mode, ConnectionMode::Launch);
    }

    #[tokio::test]
    async fn test_configuration_error_skips_connecting() {
        let (mut manager, counters) = manager();
        let overrides = ConnectionOverrides {
            mode: Some(ConnectionMode::Connect),
            ..Default::default()
        };
        let err = noop(&mut manager, request(overrides)).await.unwrap_err();

        assert!(err.is_configuration());
        assert!(err.to_string().contains("wsEndpoint"));
        assert_eq!(counters.connects.load(Ordering::SeqCst), 0);
        assert!(!manager.is_active());
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_no_session() {
        let (mut manager, counters) = manager();
        counters.fail_open.store(true, Ordering::SeqCst);
        let overrides = ConnectionOverrides {
            ws_endpoint: Some("ws://127.0.0.1:9420".into()),
            ..Default::default()
        };
        let err = noop(&mut manager, request(overrides.clone())).await.unwrap_err();

        match &err {
            SessionError::Connect { endpoint, reason } => {
                assert_eq!(endpoint, "ws://127.0.0.1:9420");
                assert!(reason.contains("connection refused"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!manager.is_active());
        assert!(manager.active_config().is_none());

        counters.fail_open.store(false, Ordering::SeqCst);
        assert_ok!(noop(&mut manager, request(overrides)).await);
        assert!(manager.is_active());
    }

    #[tokio::test]
    async fn test_launch_failure_names_launch() {
        let (mut manager, counters) = manager();
        counters.fail_open.store(true, Ordering::SeqCst);
        let err = noop(&mut manager, request(launch_overrides(&[]))).await.unwrap_err();
        assert!(matches!(err, SessionError::Launch { .. }));
        assert!(err.to_string().contains("launch"));
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let (mut manager, counters) = manager();
        manager.teardown().await;
        assert_ok!(noop(&mut manager, request(launch_overrides(&[]))).await);

        manager.teardown().await;
        manager.teardown().await;

        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        assert!(!manager.is_active());
    }

    #[tokio::test]
    async fn test_teardown_failure_still_clears_session() {
        let (mut manager, counters) = manager();
        counters.fail_close.store(true, Ordering::SeqCst);
        assert_ok!(noop(&mut manager, request(launch_overrides(&[]))).await);

        manager.teardown().await;
        assert!(!manager.is_active());
    }

    #[tokio::test]
    async fn test_connect_sessions_are_detached_not_closed() {
        let (mut manager, counters) = manager();
        let overrides = ConnectionOverrides {
            ws_endpoint: Some("ws://127.0.0.1:9420".into()),
            ..Default::default()
        };
        assert_ok!(noop(&mut manager, request(overrides)).await);
        manager.teardown().await;

        assert_eq!(counters.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_auto_close_after_success_and_failure() {
        let (mut manager, counters) = manager();
        let overrides = ConnectionOverrides {
            auto_close: Some(true),
            ..launch_overrides(&[])
        };

        assert_ok!(noop(&mut manager, request(overrides.clone())).await);
        assert!(!manager.is_active());

        let err = manager
            .run_with_connection(request(overrides), |_, _| async {
                Err::<(), _>(SessionError::Target("tap failed".into()))
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "automation target error: tap failed");
        assert!(!manager.is_active());
        assert_eq!(counters.closes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_changing_a_single_scalar_field_forces_reconnect() {
        let (mut manager, counters) = manager();
        assert_ok!(noop(&mut manager, request(launch_overrides(&[]))).await);

        let changes = [
            ConnectionOverrides {
                port: Some(9530),
                ..launch_overrides(&[])
            },
            ConnectionOverrides {
                port: Some(9530),
                account: Some("tester".into()),
                ..launch_overrides(&[])
            },
            ConnectionOverrides {
                port: Some(9530),
                account: Some("tester".into()),
                trust_project: Some(true),
                ..launch_overrides(&[])
            },
        ];
        for (i, overrides) in changes.into_iter().enumerate() {
            assert_ok!(noop(&mut manager, request(overrides.clone())).await);
            assert_eq!(counters.launches.load(Ordering::SeqCst), i + 2);

            // Same config again is reused.
            assert_ok!(noop(&mut manager, request(overrides)).await);
            assert_eq!(counters.launches.load(Ordering::SeqCst), i + 2);
        }
        assert_eq!(counters.closes.load(Ordering::SeqCst), 3);
        assert_eq!(manager.active_config().and_then(|c| c.port), Some(9530));
    }

    #[derive(Debug)]
    enum TapError {
        Session(SessionError),
        Rejected(String),
    }

    impl From<SessionError> for TapError {
        fn from(err: SessionError) -> Self {
            Self::Session(err)
        }
    }

    #[tokio::test]
    async fn test_auto_close_failure_keeps_operation_error() {
        let (mut manager, counters) = manager();
        counters.fail_close.store(true, Ordering::SeqCst);
        let overrides = ConnectionOverrides {
            auto_close: Some(true),
            ..launch_overrides(&[])
        };

        let err = manager
            .run_with_connection(request(overrides), |_, _| async {
                Err::<(), _>(TapError::Rejected("element not found".into()))
            })
            .await
            .unwrap_err();

        match err {
            TapError::Rejected(msg) => assert_eq!(msg, "element not found"),
            TapError::Session(e) => panic!("operation error replaced by {e}"),
        }
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        assert!(!manager.is_active());
        assert!(manager.active_config().is_none());
    }

    #[tokio::test]
    async fn test_page_context_requires_a_page() {
        let (mut manager, counters) = manager();
        counters.empty_stack.store(true, Ordering::SeqCst);
        let invoked = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&invoked);

        let err = manager
            .run_with_page_context(Some(launch_overrides(&[])), move |_, _, _| async move {
                flag.store(true, Ordering::SeqCst);
                Ok::<_, SessionError>(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::NoPage));
        assert!(!invoked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_page_context_passes_page() {
        let (mut manager, _) = manager();
        let path = manager
            .run_with_page_context(Some(launch_overrides(&[])), |page, _, config| async move {
                assert_eq!(config.project_path.as_deref(), Some("/work/app"));
                Ok::<_, SessionError>(page)
            })
            .await
            .unwrap();
        assert_eq!(path, "pages/index/index");
    }

    #[tokio::test]
    async fn test_events_are_captured_until_teardown() {
        let (mut manager, counters) = manager();
        let connector = FakeConnector {
            counters: Arc::clone(&counters),
        };
        let mut live = manager.subscribe_logs();
        assert_ok!(noop(&mut manager, request(launch_overrides(&[]))).await);

        connector.emit(TargetEvent::Console {
            kind: "info".into(),
            payload: EventValue::from("hello"),
        });
        let entry = tokio::time::timeout(Duration::from_secs(1), live.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.kind, "info");
        assert_eq!(manager.log_entries().len(), 1);

        let stale = counters.last_events.lock().unwrap().clone().unwrap();
        manager.teardown().await;
        assert_eq!(stale.receiver_count(), 0);

        manager.clear_log_entries();
        assert!(manager.log_entries().is_empty());
    }
}
