//! The connection server: registry, admission, fan-out and shutdown.
//!
//! One [`ConnectionServer`] owns the registry of admitted connections for a
//! single game session. Listeners hand it freshly accepted connections via
//! [`ConnectionServer::handle_connection`]; each one runs its handshake on a
//! separate task and, on success, is registered and starts feeding the
//! dispatch queue.
//!
//! Every registry mutation happens under one lock. Observer events are queued
//! under that same lock and delivered by a notifier task, so their order
//! matches the order of the mutations.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use tavern_core::outbound::ChannelTag;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::dispatch::{Dispatcher, MessageHandler};
use crate::errors::{HandshakeFailure, ServerError};
use crate::handshake::{HandshakeDriver, HandshakeProvider};
use crate::metrics::{
    BROADCAST_DROPS_TOTAL, CONNECTIONS_ACTIVE, CONNECTIONS_ADMITTED_TOTAL,
    CONNECTIONS_REMOVED_TOTAL, HANDSHAKE_FAILURES_TOTAL,
};
use crate::observer::{ObserverList, ServerEvent, ServerObserver, run_notifier};
use crate::reaper::run_reaper;
use crate::shutdown::ShutdownCoordinator;
use crate::transport::Listener;

type Registry = HashMap<String, Arc<dyn Connection>>;

/// Why a connection left the registry.
#[derive(Clone, Copy, Debug)]
enum Removal {
    Disconnected,
    Reaped,
    Booted,
    Shutdown,
}

impl Removal {
    fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Reaped => "reaped",
            Self::Booted => "booted",
            Self::Shutdown => "shutdown",
        }
    }
}

struct Inner {
    config: ServerConfig,
    provider: Arc<dyn HandshakeProvider>,
    registry: Mutex<Registry>,
    observers: ObserverList,
    events: mpsc::UnboundedSender<ServerEvent>,
    dispatcher: Dispatcher,
    listeners: tokio::sync::Mutex<Vec<Box<dyn Listener>>>,
    shutdown: ShutdownCoordinator,
    closed: AtomicBool,
}

/// Handle to one connection server. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionServer {
    inner: Arc<Inner>,
}

impl ConnectionServer {
    /// Create a server and start its background tasks.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(
        config: ServerConfig,
        provider: Arc<dyn HandshakeProvider>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let shutdown = ShutdownCoordinator::new();
        let (dispatcher, worker) = Dispatcher::spawn(handler, shutdown.token());
        shutdown.track(worker);

        let observers: ObserverList = Arc::new(Mutex::new(Vec::new()));
        let (events, events_rx) = mpsc::unbounded_channel();
        shutdown.track(tokio::spawn(run_notifier(
            events_rx,
            Arc::clone(&observers),
            shutdown.token(),
        )));

        let reap_interval = config.reap_interval;
        let server = Self {
            inner: Arc::new(Inner {
                config,
                provider,
                registry: Mutex::new(HashMap::new()),
                observers,
                events,
                dispatcher,
                listeners: tokio::sync::Mutex::new(Vec::new()),
                shutdown,
                closed: AtomicBool::new(false),
            }),
        };

        if let Some(interval) = reap_interval {
            let reaper = run_reaper(server.downgrade(), interval, server.inner.shutdown.token());
            server.inner.shutdown.track(tokio::spawn(async move {
                let stopped = reaper.await;
                debug!(?stopped, "reaper stopped");
            }));
        }

        info!(name = %server.inner.config.name, "connection server started");
        server
    }

    /// Server display name.
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Configuration this server was built with.
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Whether [`Self::close`] has begun.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Resolves once the server has started closing.
    pub async fn wait_closed(&self) {
        self.inner.shutdown.token().cancelled().await;
    }

    pub(crate) fn downgrade(&self) -> WeakServer {
        WeakServer(Arc::downgrade(&self.inner))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Listeners
    // ─────────────────────────────────────────────────────────────────────

    /// Start `listener` and keep it until the server closes.
    ///
    /// Closing the server while this is pending abandons the start with
    /// [`ServerError::Closed`]; the listeners lock is never held across
    /// `start`, so [`Self::close`] does not wait on a slow transport.
    pub async fn start_listener(&self, listener: Box<dyn Listener>) -> Result<(), ServerError> {
        if self.is_closed() {
            return Err(ServerError::Closed);
        }

        let cancel = self.inner.shutdown.token();
        let started = tokio::select! {
            started = listener.start(self.clone()) => started,
            () = cancel.cancelled() => Err(ServerError::Closed),
        };
        if let Err(error) = started {
            listener.close().await;
            return Err(error);
        }

        let mut listeners = self.inner.listeners.lock().await;
        if self.is_closed() {
            // close() already took the list; this one would never be closed.
            drop(listeners);
            listener.close().await;
            return Err(ServerError::Closed);
        }
        info!(name = %self.name(), transport = %listener.transport(), "listener started");
        listeners.push(listener);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Admission
    // ─────────────────────────────────────────────────────────────────────

    /// Run the handshake for a newly accepted connection, then register it.
    ///
    /// Returns immediately; admission happens on its own task so the caller's
    /// accept loop keeps going.
    pub fn handle_connection(&self, conn: Arc<dyn Connection>) {
        if self.is_closed() {
            conn.close();
            return;
        }
        debug!(conn_id = conn.id(), transport = %conn.transport(), "starting handshake");
        let server = self.clone();
        let _admission = tokio::spawn(async move { server.admit(conn).await });
    }

    async fn admit(self, conn: Arc<dyn Connection>) {
        let provider = Arc::clone(&self.inner.provider);
        let timeout = provider.timeout().unwrap_or(self.inner.config.handshake_timeout);
        let mut driver = HandshakeDriver::start(provider.get_connection_handshake(&conn), timeout);

        let cancel = self.inner.shutdown.token();
        let outcome = tokio::select! {
            outcome = driver.wait() => outcome,
            () = cancel.cancelled() => Err(HandshakeFailure::Cancelled),
        };
        drop(driver);
        provider.release_handshake(conn.id());

        match outcome {
            Ok(()) => self.register(conn),
            Err(failure) => {
                counter!(HANDSHAKE_FAILURES_TOTAL).increment(1);
                info!(conn_id = conn.id(), transport = %conn.transport(), reason = %failure, "handshake failed");
                conn.close();
            }
        }
    }

    fn register(&self, conn: Arc<dyn Connection>) {
        let id = conn.id().to_owned();

        // Disconnect path: drop the entry if it still refers to this connection.
        let server = self.downgrade();
        let target = Arc::downgrade(&conn);
        conn.set_disconnect_handler(Box::new(move |conn_id| {
            if let Some(server) = server.upgrade() {
                server.connection_lost(conn_id, &target);
            }
        }));

        // Message path, live before observers hear about the connection.
        let pump_conn = Arc::clone(&conn);
        let dispatcher = self.inner.dispatcher.clone();
        let _pump = tokio::spawn(async move {
            let conn_id: Arc<str> = Arc::from(pump_conn.id());
            while let Some(payload) = pump_conn.recv().await {
                if !dispatcher.submit(Arc::clone(&conn_id), payload) {
                    break;
                }
            }
        });

        let (reaped, admitted) = {
            let mut registry = self.inner.registry.lock();
            let reaped = self.reap_locked(&mut registry);
            let admitted = conn.is_alive() && !self.is_closed();
            if admitted {
                if let Some(previous) = registry.insert(id.clone(), Arc::clone(&conn)) {
                    // Ids are unique per transport, so this only happens when a
                    // transport reuses the id of a live peer.
                    warn!(conn_id = %id, "replacing registered connection with the same id");
                    self.queue(ServerEvent::Removed(Arc::clone(&previous)));
                    record_removal(&id, Removal::Booted);
                    previous.clear_disconnect_handler();
                    previous.close();
                }
                self.queue(ServerEvent::Added(Arc::clone(&conn)));
            }
            (reaped, admitted)
        };
        close_all(&reaped);

        if admitted {
            counter!(CONNECTIONS_ADMITTED_TOTAL).increment(1);
            gauge!(CONNECTIONS_ACTIVE).increment(1.0);
            info!(conn_id = %id, transport = %conn.transport(), "connection added");
        } else {
            debug!(conn_id = %id, "connection died before registration");
            conn.close();
        }
    }

    fn connection_lost(&self, conn_id: &str, target: &Weak<dyn Connection>) {
        let Some(conn) = target.upgrade() else {
            return;
        };
        let removed = {
            let mut registry = self.inner.registry.lock();
            match registry.get(conn_id) {
                Some(current) if Arc::ptr_eq(current, &conn) => {
                    let removed = registry.remove(conn_id);
                    if let Some(removed) = &removed {
                        self.queue(ServerEvent::Removed(Arc::clone(removed)));
                    }
                    removed
                }
                _ => None,
            }
        };
        if removed.is_some() {
            record_removal(conn_id, Removal::Disconnected);
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Registry maintenance
    // ─────────────────────────────────────────────────────────────────────

    /// Remove every registered connection that is no longer alive.
    ///
    /// Fires `connection_removed` for each and returns them. A second call
    /// with no intervening deaths removes nothing.
    pub fn reap_clients(&self) -> Vec<Arc<dyn Connection>> {
        let reaped = {
            let mut registry = self.inner.registry.lock();
            self.reap_locked(&mut registry)
        };
        close_all(&reaped);
        reaped
    }

    fn reap_locked(&self, registry: &mut Registry) -> Vec<Arc<dyn Connection>> {
        let dead: Vec<String> = registry
            .iter()
            .filter(|(_, conn)| !conn.is_alive())
            .map(|(id, _)| id.clone())
            .collect();

        let mut reaped = Vec::with_capacity(dead.len());
        for id in dead {
            if let Some(conn) = registry.remove(&id) {
                self.queue(ServerEvent::Removed(Arc::clone(&conn)));
                record_removal(&id, Removal::Reaped);
                reaped.push(conn);
            }
        }
        reaped
    }

    /// Remove a registered connection by id and close it.
    pub fn boot(&self, conn_id: &str) -> Result<(), ServerError> {
        let conn = {
            let mut registry = self.inner.registry.lock();
            let conn = registry.remove(conn_id).ok_or_else(|| ServerError::NotFound {
                id: conn_id.to_owned(),
            })?;
            self.queue(ServerEvent::Removed(Arc::clone(&conn)));
            conn
        };
        record_removal(conn_id, Removal::Booted);
        conn.clear_disconnect_handler();
        conn.close();
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Fan-out
    // ─────────────────────────────────────────────────────────────────────

    /// Send `payload` to every registered connection.
    ///
    /// Returns how many connections accepted it. A refusing connection is
    /// logged and skipped.
    pub fn broadcast_message(&self, payload: Bytes) -> usize {
        self.broadcast_message_excluding(&[], payload)
    }

    /// Send `payload` to every registered connection whose id is not in
    /// `exclude`.
    pub fn broadcast_message_excluding(&self, exclude: &[&str], payload: Bytes) -> usize {
        let exclude: HashSet<&str> = exclude.iter().copied().collect();
        let recipients: Vec<_> = self
            .inner
            .registry
            .lock()
            .iter()
            .filter(|(id, _)| !exclude.contains(id.as_str()))
            .map(|(_, conn)| Arc::clone(conn))
            .collect();

        let mut delivered = 0;
        for conn in &recipients {
            match conn.send(None, payload.clone()) {
                Ok(()) => delivered += 1,
                Err(error) => {
                    counter!(BROADCAST_DROPS_TOTAL).increment(1);
                    warn!(conn_id = conn.id(), %error, "failed to send broadcast to connection");
                }
            }
        }
        debug!(recipients = recipients.len(), delivered, "broadcast message");
        delivered
    }

    /// Send `payload` to one registered connection.
    pub fn send_message(
        &self,
        conn_id: &str,
        channel: Option<&ChannelTag>,
        payload: Bytes,
    ) -> Result<(), ServerError> {
        let conn = self.get_connection(conn_id).ok_or_else(|| ServerError::NotFound {
            id: conn_id.to_owned(),
        })?;
        conn.send(channel, payload).map_err(|source| ServerError::Send {
            id: conn_id.to_owned(),
            source,
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Observers
    // ─────────────────────────────────────────────────────────────────────

    /// Register an observer. Adding the same observer twice is a no-op.
    pub fn add_observer(&self, observer: Arc<dyn ServerObserver>) {
        let mut observers = self.inner.observers.lock();
        if !observers.iter().any(|o| Arc::ptr_eq(o, &observer)) {
            observers.push(observer);
        }
    }

    /// Unregister an observer previously passed to [`Self::add_observer`].
    pub fn remove_observer(&self, observer: &Arc<dyn ServerObserver>) {
        self.inner
            .observers
            .lock()
            .retain(|o| !Arc::ptr_eq(o, observer));
    }

    fn queue(&self, event: ServerEvent) {
        // Only fails once the notifier has exited during shutdown.
        let _ = self.inner.events.send(event);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────

    /// Ids of registered connections, sorted.
    pub fn connection_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.inner.registry.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.inner.registry.lock().len()
    }

    /// Whether `conn_id` is registered.
    pub fn is_connected(&self, conn_id: &str) -> bool {
        self.inner.registry.lock().contains_key(conn_id)
    }

    /// Registered connection by id.
    pub fn get_connection(&self, conn_id: &str) -> Option<Arc<dyn Connection>> {
        self.inner.registry.lock().get(conn_id).cloned()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Shutdown
    // ─────────────────────────────────────────────────────────────────────

    /// Stop accepting, close every connection and stop background tasks.
    ///
    /// Listeners release their OS resources before this returns. Task joins
    /// are bounded by the configured shutdown timeout. Safe to call from any
    /// task, more than once.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(name = %self.name(), "closing connection server");

        let listeners: Vec<_> = std::mem::take(&mut *self.inner.listeners.lock().await);
        for listener in &listeners {
            listener.close().await;
        }

        let drained: Vec<_> = {
            let mut registry = self.inner.registry.lock();
            let drained: Vec<_> = registry.drain().collect();
            for (_, conn) in &drained {
                self.queue(ServerEvent::Removed(Arc::clone(conn)));
            }
            drained
        };
        for (id, conn) in &drained {
            record_removal(id, Removal::Shutdown);
            conn.clear_disconnect_handler();
            conn.close();
        }

        self.inner
            .shutdown
            .graceful_shutdown(self.inner.config.shutdown_timeout)
            .await;
        info!(name = %self.name(), closed = drained.len(), "connection server closed");
    }
}

impl fmt::Debug for ConnectionServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionServer")
            .field("name", &self.name())
            .field("connections", &self.connection_count())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Non-owning server handle for background tasks and callbacks.
#[derive(Clone)]
pub(crate) struct WeakServer(Weak<Inner>);

impl WeakServer {
    pub(crate) fn upgrade(&self) -> Option<ConnectionServer> {
        self.0.upgrade().map(|inner| ConnectionServer { inner })
    }
}

fn record_removal(conn_id: &str, reason: Removal) {
    counter!(CONNECTIONS_REMOVED_TOTAL, "reason" => reason.as_str()).increment(1);
    gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
    info!(conn_id, reason = reason.as_str(), "connection removed");
}

fn close_all(conns: &[Arc<dyn Connection>]) {
    for conn in conns {
        conn.close();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::connection::{ConnectionState, TransportKind};
    use crate::handshake::{AcceptAllHandshakeProvider, RejectAllHandshakeProvider, StalledHandshakeProvider};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use tavern_core::compression::PayloadCodec;
    use tavern_core::logging::capture_logs;
    use tracing::Level;

    struct Mock(ConnectionState);

    impl Connection for Mock {
        fn state(&self) -> &ConnectionState {
            &self.0
        }
        fn transport(&self) -> TransportKind {
            TransportKind::Socket
        }
    }

    fn mock(id: &str) -> Arc<Mock> {
        Arc::new(Mock(ConnectionState::new(id, PayloadCodec::new(false, 1024))))
    }

    struct Sink;

    #[async_trait]
    impl MessageHandler for Sink {
        async fn handle_message(&self, _conn_id: &str, _payload: Bytes) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Events(Mutex<Vec<String>>);

    impl ServerObserver for Events {
        fn connection_added(&self, conn: &Arc<dyn Connection>) {
            self.0.lock().push(format!("+{}", conn.id()));
        }
        fn connection_removed(&self, conn: &Arc<dyn Connection>) {
            self.0.lock().push(format!("-{}", conn.id()));
        }
    }

    fn config() -> ServerConfig {
        ServerConfig {
            name: "test".into(),
            reap_interval: None,
            compression: false,
            handshake_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(1),
            ..ServerConfig::default()
        }
    }

    fn server_with(provider: Arc<dyn HandshakeProvider>) -> (ConnectionServer, Arc<Events>) {
        let server = ConnectionServer::new(config(), provider, Arc::new(Sink));
        let events = Arc::new(Events::default());
        server.add_observer(events.clone());
        (server, events)
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn accepted_connection_is_registered_and_announced() {
        let (server, events) = server_with(Arc::new(AcceptAllHandshakeProvider));
        server.handle_connection(mock("a"));

        eventually(|| server.is_connected("a")).await;
        eventually(|| events.0.lock().len() == 1).await;
        assert_eq!(*events.0.lock(), vec!["+a"]);
        assert_eq!(server.connection_ids(), vec!["a"]);
    }

    #[tokio::test]
    async fn rejected_connection_is_closed_and_never_announced() {
        let (logs, _guard) = capture_logs();
        let (server, events) = server_with(Arc::new(RejectAllHandshakeProvider));
        let conn = mock("a");
        server.handle_connection(conn.clone());

        eventually(|| !conn.is_alive()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(server.connection_count(), 0);
        assert!(events.0.lock().is_empty());
        assert!(logs.has_event(Level::INFO, "handshake failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_handshake_times_out() {
        let provider = StalledHandshakeProvider {
            timeout: Some(Duration::from_secs(3)),
        };
        let (server, events) = server_with(Arc::new(provider));
        let conn = mock("a");
        server.handle_connection(conn.clone());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(conn.is_alive());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!conn.is_alive());
        assert_eq!(server.connection_count(), 0);
        assert!(events.0.lock().is_empty());
    }

    #[tokio::test]
    async fn disconnect_removes_exactly_once() {
        let (server, events) = server_with(Arc::new(AcceptAllHandshakeProvider));
        let conn = mock("a");
        server.handle_connection(conn.clone());
        eventually(|| server.is_connected("a")).await;

        let _ = conn.state().mark_dead("peer reset");
        assert!(!server.is_connected("a"));
        assert!(server.reap_clients().is_empty());

        eventually(|| events.0.lock().len() == 2).await;
        assert_eq!(*events.0.lock(), vec!["+a", "-a"]);
    }

    #[tokio::test]
    async fn reap_removes_dead_and_is_idempotent() {
        let (server, events) = server_with(Arc::new(AcceptAllHandshakeProvider));
        let a = mock("a");
        let b = mock("b");
        server.handle_connection(a.clone());
        server.handle_connection(b.clone());
        eventually(|| server.connection_count() == 2).await;

        // Simulate a transport whose disconnect handler never ran.
        a.clear_disconnect_handler();
        let _ = a.state().mark_dead("silent");

        let reaped = server.reap_clients();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].id(), "a");
        assert!(server.reap_clients().is_empty());
        assert_eq!(server.connection_ids(), vec!["b"]);

        eventually(|| events.0.lock().iter().filter(|e| e.starts_with('-')).count() == 1).await;
    }

    #[tokio::test]
    async fn broadcast_skips_excluded_and_failing_recipients() {
        let (logs, _guard) = capture_logs();
        let (server, _events) = server_with(Arc::new(AcceptAllHandshakeProvider));
        let conns: Vec<_> = ["a", "b", "c", "d"].into_iter().map(mock).collect();
        for conn in &conns {
            server.handle_connection(conn.clone());
        }
        eventually(|| server.connection_count() == 4).await;

        // "c" is registered but refuses sends.
        conns[2].clear_disconnect_handler();
        let _ = conns[2].state().mark_dead("broken pipe");

        let delivered = server.broadcast_message_excluding(&["a"], Bytes::from_static(b"hi"));
        assert_eq!(delivered, 2);
        assert_eq!(conns[0].state().pending_outbound(), 0);
        assert_eq!(conns[1].state().pending_outbound(), 1);
        assert_eq!(conns[3].state().pending_outbound(), 1);

        let warnings: Vec<_> = logs
            .events()
            .into_iter()
            .filter(|e| e.level == Level::WARN && e.message.contains("failed to send broadcast"))
            .collect();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].field("conn_id"), Some("c"));
    }

    #[tokio::test]
    async fn send_message_to_unknown_id_is_not_found() {
        let (server, _events) = server_with(Arc::new(AcceptAllHandshakeProvider));
        assert_matches!(
            server.send_message("ghost", None, Bytes::from_static(b"boo")),
            Err(ServerError::NotFound { id }) if id == "ghost"
        );
    }

    #[tokio::test]
    async fn send_message_threads_channel_through() {
        let (server, _events) = server_with(Arc::new(AcceptAllHandshakeProvider));
        let conn = mock("a");
        server.handle_connection(conn.clone());
        eventually(|| server.is_connected("a")).await;

        let channel = ChannelTag::from("assets");
        server
            .send_message("a", Some(&channel), Bytes::from_static(b"map.png"))
            .unwrap();
        assert_eq!(conn.state().pending_outbound(), 1);
    }

    #[tokio::test]
    async fn boot_removes_and_closes() {
        let (server, events) = server_with(Arc::new(AcceptAllHandshakeProvider));
        let conn = mock("a");
        server.handle_connection(conn.clone());
        eventually(|| server.is_connected("a")).await;

        server.boot("a").unwrap();
        assert!(!conn.is_alive());
        assert_matches!(server.boot("a"), Err(ServerError::NotFound { .. }));
        eventually(|| events.0.lock().len() == 2).await;
        assert_eq!(*events.0.lock(), vec!["+a", "-a"]);
    }

    #[tokio::test]
    async fn observer_can_reenter_server() {
        struct Greeter(ConnectionServer);

        impl ServerObserver for Greeter {
            fn connection_added(&self, conn: &Arc<dyn Connection>) {
                let _ = self.0.send_message(conn.id(), None, Bytes::from_static(b"welcome"));
            }
            fn connection_removed(&self, _conn: &Arc<dyn Connection>) {}
        }

        let (server, _events) = server_with(Arc::new(AcceptAllHandshakeProvider));
        server.add_observer(Arc::new(Greeter(server.clone())));
        let conn = mock("a");
        server.handle_connection(conn.clone());
        eventually(|| conn.state().pending_outbound() == 1).await;
        server.close().await;
    }

    #[tokio::test]
    async fn removed_observer_stops_hearing_events() {
        let (server, events) = server_with(Arc::new(AcceptAllHandshakeProvider));
        let observer: Arc<dyn ServerObserver> = events.clone();
        server.remove_observer(&observer);
        server.handle_connection(mock("a"));
        eventually(|| server.is_connected("a")).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(events.0.lock().is_empty());
    }

    #[tokio::test]
    async fn close_removes_everyone_and_refuses_newcomers() {
        let (server, events) = server_with(Arc::new(AcceptAllHandshakeProvider));
        let a = mock("a");
        server.handle_connection(a.clone());
        eventually(|| server.is_connected("a")).await;

        server.close().await;
        server.close().await;
        assert!(server.is_closed());
        assert!(!a.is_alive());
        assert_eq!(server.connection_count(), 0);
        assert_eq!(*events.0.lock(), vec!["+a", "-a"]);

        let late = mock("late");
        server.handle_connection(late.clone());
        assert!(!late.is_alive());
    }

    #[tokio::test]
    async fn reaper_reports_why_it_stopped() {
        let (logs, _guard) = capture_logs();
        let config = ServerConfig {
            reap_interval: Some(Duration::from_secs(60)),
            ..config()
        };
        let server = ConnectionServer::new(config, Arc::new(AcceptAllHandshakeProvider), Arc::new(Sink));
        server.close().await;

        let stopped: Vec<_> = logs
            .events()
            .into_iter()
            .filter(|e| e.message.contains("reaper stopped"))
            .collect();
        assert_eq!(stopped.len(), 1);
        assert_eq!(stopped[0].level, Level::DEBUG);
        assert_eq!(stopped[0].field("stopped"), Some("Cancelled"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_admissions_under_one_id_leave_one_entry() {
        let (server, events) = server_with(Arc::new(AcceptAllHandshakeProvider));
        let conns: Vec<_> = (0..8).map(|_| mock("dup")).collect();
        for conn in &conns {
            let server = server.clone();
            let conn = conn.clone();
            let _ = tokio::spawn(async move { server.handle_connection(conn) });
        }

        // Every admission lands; each one after the first replaces its predecessor.
        eventually(|| events.0.lock().len() == 15).await;
        assert_eq!(server.connection_ids(), vec!["dup"]);
        let alive: Vec<_> = conns.iter().filter(|c| c.is_alive()).collect();
        assert_eq!(alive.len(), 1);
        let registered = server.get_connection("dup").unwrap();
        let survivor: Arc<dyn Connection> = alive[0].clone();
        assert!(Arc::ptr_eq(&registered, &survivor));
        let events = events.0.lock();
        assert_eq!(events.iter().filter(|e| *e == "+dup").count(), 8);
        assert_eq!(events.iter().filter(|e| *e == "-dup").count(), 7);
    }

    mod registry_properties {
        use super::*;
        use proptest::prelude::*;

        #[derive(Clone, Copy, Debug)]
        enum Op {
            Admit(u8),
            Kill { slot: u8, silent: bool },
            Reap,
            Boot(u8),
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                (0u8..4).prop_map(Op::Admit),
                (0u8..4, any::<bool>()).prop_map(|(slot, silent)| Op::Kill { slot, silent }),
                Just(Op::Reap),
                (0u8..4).prop_map(Op::Boot),
            ]
        }

        /// Added/removed events keyed by connection object, not id.
        #[derive(Default)]
        struct Ledger(Mutex<Vec<(bool, usize)>>);

        fn addr(conn: &Arc<dyn Connection>) -> usize {
            Arc::as_ptr(conn).cast::<()>() as usize
        }

        impl ServerObserver for Ledger {
            fn connection_added(&self, conn: &Arc<dyn Connection>) {
                self.0.lock().push((true, addr(conn)));
            }
            fn connection_removed(&self, conn: &Arc<dyn Connection>) {
                self.0.lock().push((false, addr(conn)));
            }
        }

        /// Registered connections as the test expects them; `true` marks one
        /// that died without telling the server.
        type Model = HashMap<String, (Arc<Mock>, bool)>;

        async fn apply(server: &ConnectionServer, model: &mut Model, all: &mut Vec<Arc<Mock>>, op: Op) -> Result<(), TestCaseError> {
            match op {
                Op::Admit(slot) => {
                    let id = format!("p{slot}");
                    let conn = mock(&id);
                    all.push(conn.clone());
                    server.handle_connection(conn.clone());
                    let expected: Arc<dyn Connection> = conn.clone();
                    eventually(|| server.get_connection(&id).is_some_and(|c| Arc::ptr_eq(&c, &expected))).await;
                    // Registration sweeps silently dead entries first.
                    model.retain(|_, (_, dead)| !*dead);
                    let _ = model.insert(id, (conn, false));
                }
                Op::Kill { slot, silent } => {
                    let id = format!("p{slot}");
                    let target = model.get(&id).filter(|(_, dead)| !dead).map(|(conn, _)| conn.clone());
                    if let Some(conn) = target {
                        if silent {
                            conn.clear_disconnect_handler();
                            let _ = conn.state().mark_dead("silent");
                            let _ = model.insert(id, (conn, true));
                        } else {
                            let _ = conn.state().mark_dead("gone");
                            let _ = model.remove(&id);
                        }
                    }
                }
                Op::Reap => {
                    let expected = model.values().filter(|(_, dead)| *dead).count();
                    prop_assert_eq!(server.reap_clients().len(), expected);
                    model.retain(|_, (_, dead)| !*dead);
                }
                Op::Boot(slot) => {
                    let id = format!("p{slot}");
                    let booted = server.boot(&id).is_ok();
                    prop_assert_eq!(booted, model.remove(&id).is_some());
                }
            }
            Ok(())
        }

        async fn check(ops: Vec<Op>) -> Result<(), TestCaseError> {
            let ledger = Arc::new(Ledger::default());
            let server = ConnectionServer::new(config(), Arc::new(AcceptAllHandshakeProvider), Arc::new(Sink));
            server.add_observer(ledger.clone());

            let mut model = Model::new();
            let mut all = Vec::new();
            for op in ops {
                apply(&server, &mut model, &mut all, op).await?;
                let mut expected: Vec<String> = model.keys().cloned().collect();
                expected.sort();
                prop_assert_eq!(server.connection_ids(), expected);
            }

            // After a final sweep only live, unbooted admissions remain.
            apply(&server, &mut model, &mut all, Op::Reap).await?;
            for id in server.connection_ids() {
                prop_assert!(server.get_connection(&id).is_some_and(|c| c.is_alive()));
            }

            // One added per admission, one removed per departure, in that order.
            let registered = server.connection_count();
            let total = 2 * all.len() - registered;
            eventually(|| ledger.0.lock().len() == total).await;
            let entries = ledger.0.lock().clone();
            for conn in &all {
                let conn: Arc<dyn Connection> = conn.clone();
                let key = addr(&conn);
                let seen: Vec<bool> = entries.iter().filter(|(_, a)| *a == key).map(|(added, _)| *added).collect();
                let still_registered = server.get_connection(conn.id()).is_some_and(|c| Arc::ptr_eq(&c, &conn));
                if still_registered {
                    prop_assert_eq!(seen, vec![true]);
                } else {
                    prop_assert_eq!(seen, vec![true, false]);
                }
            }
            server.close().await;
            Ok(())
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(48))]

            #[test]
            fn registry_tracks_admitted_live_unbooted_connections(ops in proptest::collection::vec(op(), 1..24)) {
                let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
                runtime.block_on(check(ops))?;
            }
        }
    }
}
