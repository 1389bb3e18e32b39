//! Connection hub for BuddyBot server
//!
//! A single control loop owns the set of connected clients and the message
//! counters. Everything else talks to it through [`Hub`], a cheap cloneable
//! handle that turns calls into requests on bounded queues.

mod client;
mod control;
mod message;
mod metrics;

use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::HubSettings;
use crate::error::HubError;

pub use client::{Client, Mailbox};
pub use control::{HubLoop, HubState};
pub use message::{
    Message, CLOSE_GOING_AWAY, KIND_CLOSE, KIND_ERROR, KIND_SERVER_SHUTDOWN, KIND_WELCOME,
};
pub use metrics::MetricsSnapshot;

use control::{Dispatch, Requests};

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub register_buffer: usize,
    pub unregister_buffer: usize,
    pub broadcast_buffer: usize,
    pub mailbox_capacity: usize,
    /// How long the loop waits after sending close messages before closing mailboxes.
    pub shutdown_grace: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            register_buffer: 256,
            unregister_buffer: 256,
            broadcast_buffer: 256,
            mailbox_capacity: 256,
            shutdown_grace: Duration::from_millis(100),
        }
    }
}

impl From<&HubSettings> for HubConfig {
    fn from(settings: &HubSettings) -> Self {
        Self {
            register_buffer: settings.register_buffer,
            unregister_buffer: settings.unregister_buffer,
            broadcast_buffer: settings.broadcast_buffer,
            mailbox_capacity: settings.mailbox_capacity,
            shutdown_grace: Duration::from_millis(settings.shutdown_grace_ms),
        }
    }
}

/// Handle to the hub control loop. Safe to clone and share between tasks.
#[derive(Debug, Clone)]
pub struct Hub {
    register_tx: mpsc::Sender<Client>,
    unregister_tx: mpsc::Sender<String>,
    broadcast_tx: mpsc::Sender<Dispatch>,
    metrics_tx: mpsc::Sender<oneshot::Sender<MetricsSnapshot>>,
    count_tx: mpsc::Sender<oneshot::Sender<usize>>,
    shutdown_tx: mpsc::Sender<()>,
    state_rx: watch::Receiver<HubState>,
    mailbox_capacity: usize,
}

impl Hub {
    /// Creates a handle and the loop it talks to. The loop does nothing until
    /// [`HubLoop::run`] is awaited.
    pub fn new(config: HubConfig) -> (Self, HubLoop) {
        let (register_tx, register) = mpsc::channel(config.register_buffer.max(1));
        let (unregister_tx, unregister) = mpsc::channel(config.unregister_buffer.max(1));
        let (broadcast_tx, broadcast) = mpsc::channel(config.broadcast_buffer.max(1));
        let (metrics_tx, metrics) = mpsc::channel(16);
        let (count_tx, count) = mpsc::channel(16);
        let (shutdown_tx, shutdown) = mpsc::channel(1);
        let (state_tx, state_rx) = watch::channel(HubState::Running);

        let requests = Requests {
            register,
            unregister,
            broadcast,
            metrics,
            count,
            shutdown,
        };
        let hub_loop = HubLoop::new(
            requests,
            unregister_tx.clone(),
            state_tx,
            config.shutdown_grace,
        );

        let hub = Self {
            register_tx,
            unregister_tx,
            broadcast_tx,
            metrics_tx,
            count_tx,
            shutdown_tx,
            state_rx,
            mailbox_capacity: config.mailbox_capacity,
        };
        (hub, hub_loop)
    }

    /// Creates a hub and starts its control loop on the current tokio runtime.
    pub fn spawn(config: HubConfig) -> (Self, JoinHandle<()>) {
        let (hub, hub_loop) = Self::new(config);
        let handle = tokio::spawn(hub_loop.run());
        (hub, handle)
    }

    pub fn mailbox_capacity(&self) -> usize {
        self.mailbox_capacity
    }

    /// Creates a client sized with this hub's mailbox capacity.
    pub fn new_client(&self, user_id: impl Into<String>) -> (Client, Mailbox) {
        Client::new(user_id, self.mailbox_capacity)
    }

    /// Best-effort: if the registration queue is full the client is dropped,
    /// which closes its mailbox.
    pub fn register(&self, client: Client) {
        match self.register_tx.try_send(client) {
            Ok(()) => {}
            Err(TrySendError::Full(client)) => {
                warn!(connection_id = %client.connection_id(), "Registration queue full, client dropped");
            }
            Err(TrySendError::Closed(client)) => {
                warn!(connection_id = %client.connection_id(), "Hub stopped, client dropped");
            }
        }
    }

    pub async fn unregister(&self, connection_id: &str) {
        tokio::select! {
            _ = self.unregister_tx.send(connection_id.to_string()) => {}
            _ = self.stopped() => {}
        }
    }

    /// Best-effort, non-blocking. Dropped with a warning when the queue is full.
    pub fn broadcast(&self, message: Message) {
        self.enqueue(Dispatch::Inbound(message));
    }

    /// Sends a server-generated message to one connection. Shares the
    /// broadcast queue but does not count as received traffic.
    pub fn reply(&self, connection_id: &str, message: Message) {
        self.enqueue(Dispatch::Reply(message.with_target(connection_id)));
    }

    fn enqueue(&self, dispatch: Dispatch) {
        match self.broadcast_tx.try_send(dispatch) {
            Ok(()) => {}
            Err(TrySendError::Full(dispatch)) => {
                warn!(kind = %dispatch.kind(), "Broadcast queue full, message dropped");
            }
            Err(TrySendError::Closed(dispatch)) => {
                debug!(kind = %dispatch.kind(), "Hub stopped, message dropped");
            }
        }
    }

    pub fn send_to_user(&self, user_id: &str, mut message: Message) {
        message.target = Some(user_id.to_string());
        self.broadcast(message);
    }

    /// Number of registered clients; 0 once the hub has stopped.
    pub async fn get_connected_clients(&self) -> usize {
        self.round_trip(&self.count_tx).await
    }

    /// Snapshot of the hub counters; all zeroes once the hub has stopped.
    pub async fn get_metrics(&self) -> MetricsSnapshot {
        self.round_trip(&self.metrics_tx).await
    }

    /// (sent, received) messages per second since the hub started.
    pub async fn get_message_rate(&self) -> (f64, f64) {
        self.get_metrics().await.message_rate()
    }

    pub fn state(&self) -> HubState {
        *self.state_rx.borrow()
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == HubState::Stopped
    }

    /// Requests shutdown and waits for the loop to finish, however long it takes.
    pub async fn shutdown(&self) {
        self.request_shutdown();
        self.stopped().await;
    }

    /// Notifies clients, requests shutdown, and waits up to `timeout` for the
    /// loop to finish. A timeout means shutdown is unconfirmed: the loop may
    /// still complete later.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<(), HubError> {
        self.broadcast(Message::server_shutdown("Server is shutting down"));
        self.request_shutdown();

        match tokio::time::timeout(timeout, self.stopped()).await {
            Ok(()) => {
                info!("Hub shutdown complete");
                Ok(())
            }
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Hub shutdown timed out");
                Err(HubError::ShutdownTimeout(timeout))
            }
        }
    }

    fn request_shutdown(&self) {
        // Full means a shutdown is already pending; closed means it already happened.
        if let Err(e) = self.shutdown_tx.try_send(()) {
            debug!(error = %e, "Shutdown already requested");
        }
    }

    /// Resolves once the loop has stopped, or if it was dropped without running.
    async fn stopped(&self) {
        let mut state = self.state_rx.clone();
        loop {
            if *state.borrow_and_update() == HubState::Stopped {
                return;
            }
            if state.changed().await.is_err() {
                return;
            }
        }
    }

    async fn round_trip<T: Default>(&self, requests: &mpsc::Sender<oneshot::Sender<T>>) -> T {
        let (reply_tx, reply_rx) = oneshot::channel();
        let exchange = async move {
            requests.send(reply_tx).await.ok()?;
            reply_rx.await.ok()
        };

        tokio::select! {
            reply = exchange => reply.unwrap_or_default(),
            _ = self.stopped() => T::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, timeout};

    fn test_config() -> HubConfig {
        HubConfig {
            mailbox_capacity: 8,
            shutdown_grace: Duration::from_millis(10),
            ..Default::default()
        }
    }

    async fn next_kind(rx: &mut Mailbox) -> Option<String> {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .ok()
            .flatten()
            .map(|m| m.kind)
    }

    async fn wait_for_clients(hub: &Hub, expected: usize) {
        for _ in 0..100 {
            if hub.get_connected_clients().await == expected {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} connected clients", expected);
    }

    #[tokio::test]
    async fn test_register_sends_welcome() {
        let (hub, _handle) = Hub::spawn(test_config());
        let (client, mut rx) = Client::with_id("conn-1", "u1", 8);
        hub.register(client);

        let welcome = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(welcome.kind, KIND_WELCOME);
        assert_eq!(welcome.payload["client_id"], "conn-1");
        assert_eq!(welcome.payload["user_id"], "u1");
        assert_eq!(hub.get_connected_clients().await, 1);
    }

    #[tokio::test]
    async fn test_register_unregister_counts() {
        let (hub, _handle) = Hub::spawn(test_config());
        let mut mailboxes = Vec::new();
        let mut ids = Vec::new();
        for i in 0..4 {
            let (client, rx) = hub.new_client(format!("user-{}", i));
            ids.push(client.connection_id().to_string());
            hub.register(client);
            mailboxes.push(rx);
        }
        wait_for_clients(&hub, 4).await;

        hub.unregister(&ids[0]).await;
        hub.unregister(&ids[1]).await;
        // Unknown and repeated ids are ignored.
        hub.unregister(&ids[1]).await;
        hub.unregister("missing").await;
        wait_for_clients(&hub, 2).await;

        let metrics = hub.get_metrics().await;
        assert_eq!(metrics.total_connections, 4);
        assert_eq!(metrics.current_connections, 2);
    }

    #[tokio::test]
    async fn test_unregister_closes_mailbox() {
        let (hub, _handle) = Hub::spawn(test_config());
        let (client, mut rx) = Client::with_id("conn-1", "u1", 8);
        hub.register(client);
        assert_eq!(next_kind(&mut rx).await.as_deref(), Some(KIND_WELCOME));

        hub.unregister("conn-1").await;
        let closed = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert!(closed.is_none());
    }

    #[tokio::test]
    async fn test_broadcast_metrics() {
        let (hub, _handle) = Hub::spawn(test_config());
        let mut mailboxes = Vec::new();
        for i in 0..3 {
            let (client, rx) = hub.new_client(format!("user-{}", i));
            hub.register(client);
            mailboxes.push(rx);
        }
        wait_for_clients(&hub, 3).await;

        hub.broadcast(Message::new("chat").with_data("text", "hi"));
        for rx in mailboxes.iter_mut() {
            assert_eq!(next_kind(rx).await.as_deref(), Some(KIND_WELCOME));
            assert_eq!(next_kind(rx).await.as_deref(), Some("chat"));
        }

        let metrics = hub.get_metrics().await;
        assert_eq!(metrics.current_connections, 3);
        assert_eq!(metrics.messages_sent, 3);
        assert_eq!(metrics.messages_received, 1);
        assert_eq!(metrics.message_type_counts.get("chat"), Some(&1));
        assert!(metrics.last_message_time.is_some());
    }

    #[tokio::test]
    async fn test_send_to_user_only_reaches_that_user() {
        let (hub, _handle) = Hub::spawn(test_config());
        let (a, mut rx_a) = Client::with_id("conn-a", "u1", 8);
        let (b, mut rx_b) = Client::with_id("conn-b", "u2", 8);
        hub.register(a);
        hub.register(b);
        wait_for_clients(&hub, 2).await;
        assert_eq!(next_kind(&mut rx_a).await.as_deref(), Some(KIND_WELCOME));
        assert_eq!(next_kind(&mut rx_b).await.as_deref(), Some(KIND_WELCOME));

        hub.send_to_user("u1", Message::new("direct"));
        let received = timeout(Duration::from_secs(1), rx_a.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.kind, "direct");
        assert_eq!(received.target.as_deref(), Some("u1"));

        assert_eq!(hub.get_metrics().await.messages_sent, 1);
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_target_matches_connection_id_and_every_user_connection() {
        let (hub, _handle) = Hub::spawn(test_config());
        let (tab1, mut rx1) = Client::with_id("conn-1", "u1", 8);
        let (tab2, mut rx2) = Client::with_id("conn-2", "u1", 8);
        hub.register(tab1);
        hub.register(tab2);
        wait_for_clients(&hub, 2).await;
        next_kind(&mut rx1).await;
        next_kind(&mut rx2).await;

        hub.send_to_user("u1", Message::new("both"));
        assert_eq!(next_kind(&mut rx1).await.as_deref(), Some("both"));
        assert_eq!(next_kind(&mut rx2).await.as_deref(), Some("both"));

        hub.broadcast(Message::new("one").with_target("conn-2"));
        assert_eq!(next_kind(&mut rx2).await.as_deref(), Some("one"));
        assert_eq!(hub.get_metrics().await.messages_sent, 3);
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unmatched_target_delivers_nothing() {
        let (hub, _handle) = Hub::spawn(test_config());
        let (client, mut rx) = Client::with_id("conn-1", "u1", 8);
        hub.register(client);
        wait_for_clients(&hub, 1).await;
        next_kind(&mut rx).await;

        hub.send_to_user("nobody", Message::new("chat"));
        let metrics = hub.get_metrics().await;
        assert_eq!(metrics.messages_received, 1);
        assert_eq!(metrics.messages_sent, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_mailbox_removes_slow_client() {
        let (hub, _handle) = Hub::spawn(test_config());
        // The welcome message fills the slow client's only slot.
        let (slow, _slow_rx) = Client::with_id("slow", "u-slow", 1);
        let (fast, mut fast_rx) = Client::with_id("fast", "u-fast", 8);
        hub.register(slow);
        hub.register(fast);
        wait_for_clients(&hub, 2).await;

        hub.broadcast(Message::new("chat"));
        assert_eq!(next_kind(&mut fast_rx).await.as_deref(), Some(KIND_WELCOME));
        assert_eq!(next_kind(&mut fast_rx).await.as_deref(), Some("chat"));

        wait_for_clients(&hub, 1).await;
        let metrics = hub.get_metrics().await;
        assert_eq!(metrics.current_connections, 1);
        assert_eq!(metrics.total_connections, 2);
        assert_eq!(metrics.messages_sent, 1);
    }

    #[tokio::test]
    async fn test_reply_is_not_counted_as_received() {
        let (hub, _handle) = Hub::spawn(test_config());
        let (a, mut rx_a) = Client::with_id("conn-a", "u1", 8);
        let (b, mut rx_b) = Client::with_id("conn-b", "u2", 8);
        hub.register(a);
        hub.register(b);
        wait_for_clients(&hub, 2).await;
        next_kind(&mut rx_a).await;
        next_kind(&mut rx_b).await;

        hub.reply("conn-a", Message::error("bad frame"));
        let reply = timeout(Duration::from_secs(1), rx_a.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.kind, KIND_ERROR);
        assert_eq!(reply.target.as_deref(), Some("conn-a"));

        let metrics = hub.get_metrics().await;
        assert_eq!(metrics.messages_received, 0);
        assert_eq!(metrics.messages_sent, 1);
        assert!(metrics.message_type_counts.is_empty());
        assert!(metrics.last_message_time.is_none());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_duplicate_connection_id_replaces_previous_client() {
        let (hub, _handle) = Hub::spawn(test_config());
        let (first, mut rx_first) = Client::with_id("conn-1", "u1", 8);
        let (second, mut rx_second) = Client::with_id("conn-1", "u2", 8);
        hub.register(first);
        assert_eq!(next_kind(&mut rx_first).await.as_deref(), Some(KIND_WELCOME));
        hub.register(second);
        assert_eq!(next_kind(&mut rx_second).await.as_deref(), Some(KIND_WELCOME));

        let closed = timeout(Duration::from_secs(1), rx_first.recv()).await.unwrap();
        assert!(closed.is_none());

        let metrics = hub.get_metrics().await;
        assert_eq!(metrics.current_connections, 1);
        assert_eq!(metrics.total_connections, 1);
        assert_eq!(hub.get_connected_clients().await, 1);
    }

    #[tokio::test]
    async fn test_welcome_dropped_when_mailbox_full() {
        let (hub, _handle) = Hub::spawn(test_config());
        let (client, mut rx) = Client::with_id("conn-1", "u1", 1);
        client.try_deliver(Message::new("queued")).unwrap();
        hub.register(client);
        wait_for_clients(&hub, 1).await;

        assert_eq!(next_kind(&mut rx).await.as_deref(), Some("queued"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_sends_close_and_clears_registry() {
        let (hub, handle) = Hub::spawn(test_config());
        let (client, mut rx) = Client::with_id("conn-1", "u1", 8);
        hub.register(client);
        wait_for_clients(&hub, 1).await;

        hub.shutdown_with_timeout(Duration::from_secs(1))
            .await
            .unwrap();
        assert!(hub.is_stopped());
        handle.await.unwrap();

        let mut kinds = Vec::new();
        while let Some(message) = rx.recv().await {
            if let Some((code, reason)) = message.close_details() {
                assert_eq!(code, CLOSE_GOING_AWAY);
                assert_eq!(reason, "Server shutting down");
            }
            kinds.push(message.kind);
        }
        assert_eq!(kinds, vec![KIND_WELCOME, KIND_SERVER_SHUTDOWN, KIND_CLOSE]);
        assert_eq!(hub.get_connected_clients().await, 0);
    }

    #[tokio::test]
    async fn test_calls_after_shutdown_return_zero_values() {
        let (hub, _handle) = Hub::spawn(test_config());
        hub.shutdown().await;

        assert_eq!(hub.get_connected_clients().await, 0);
        assert_eq!(hub.get_metrics().await, MetricsSnapshot::default());
        assert_eq!(hub.get_message_rate().await, (0.0, 0.0));

        let (client, mut rx) = hub.new_client("late");
        hub.register(client);
        hub.broadcast(Message::new("late"));
        hub.unregister("late").await;
        assert!(rx.recv().await.is_none());

        // A second shutdown completes immediately.
        hub.shutdown_with_timeout(Duration::from_millis(50))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_times_out_when_loop_not_running() {
        let (hub, _hub_loop) = Hub::new(test_config());
        let deadline = Duration::from_millis(100);

        let started = std::time::Instant::now();
        let result = hub.shutdown_with_timeout(deadline).await;
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(HubError::ShutdownTimeout(d)) if d == deadline));
        assert!(elapsed >= deadline);
        assert!(elapsed < deadline + Duration::from_millis(500));
        assert_eq!(hub.state(), HubState::Running);
    }

    #[tokio::test]
    async fn test_dropping_all_handles_stops_loop() {
        let (hub, handle) = Hub::spawn(test_config());
        drop(hub);
        timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
