use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::client::Client;
use super::message::{Message, CLOSE_GOING_AWAY};
use super::metrics::{HubMetrics, MetricsSnapshot};

/// Lifecycle of the control loop as observed by the facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubState {
    Running,
    ShuttingDown,
    Stopped,
}

/// An entry on the broadcast queue.
#[derive(Debug)]
pub(crate) enum Dispatch {
    /// Traffic from a producer; counted as received.
    Inbound(Message),
    /// Generated by the server for one connection; only deliveries are counted.
    Reply(Message),
}

impl Dispatch {
    pub(crate) fn kind(&self) -> &str {
        match self {
            Dispatch::Inbound(message) | Dispatch::Reply(message) => &message.kind,
        }
    }
}

/// The receiving ends of every request queue, handed to the loop at construction.
pub(crate) struct Requests {
    pub register: mpsc::Receiver<Client>,
    pub unregister: mpsc::Receiver<String>,
    pub broadcast: mpsc::Receiver<Dispatch>,
    pub metrics: mpsc::Receiver<oneshot::Sender<MetricsSnapshot>>,
    pub count: mpsc::Receiver<oneshot::Sender<usize>>,
    pub shutdown: mpsc::Receiver<()>,
}

/// The hub control loop.
///
/// Owns the client registry and all counters. Nothing else reads or writes
/// them; every change arrives as a request on one of the queues in
/// [`Requests`] and is applied one at a time.
pub struct HubLoop {
    requests: Requests,
    /// Used to remove clients whose mailbox was full, without blocking the loop.
    unregister_tx: mpsc::Sender<String>,
    state: watch::Sender<HubState>,
    clients: HashMap<String, Client>,
    metrics: HubMetrics,
    shutdown_grace: Duration,
}

impl HubLoop {
    pub(crate) fn new(
        requests: Requests,
        unregister_tx: mpsc::Sender<String>,
        state: watch::Sender<HubState>,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            requests,
            unregister_tx,
            state,
            clients: HashMap::new(),
            metrics: HubMetrics::new(),
            shutdown_grace,
        }
    }

    /// Runs until a shutdown request arrives or every hub handle is dropped.
    pub async fn run(mut self) {
        info!("Hub control loop started");

        loop {
            tokio::select! {
                Some(client) = self.requests.register.recv() => self.register_client(client),
                Some(connection_id) = self.requests.unregister.recv() => {
                    self.unregister_client(&connection_id)
                }
                Some(dispatch) = self.requests.broadcast.recv() => self.dispatch(dispatch),
                Some(reply) = self.requests.metrics.recv() => {
                    let _ = reply.send(self.metrics.snapshot());
                }
                Some(reply) = self.requests.count.recv() => {
                    let _ = reply.send(self.clients.len());
                }
                // `None` means every handle is gone, which is a shutdown too.
                _ = self.requests.shutdown.recv() => break,
            }
        }

        self.shutdown().await;
        self.state.send_replace(HubState::Stopped);
        info!("Hub control loop stopped");
    }

    fn register_client(&mut self, client: Client) {
        let welcome = Message::welcome(client.connection_id(), client.user_id());
        match client.try_deliver(welcome) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(connection_id = %client.connection_id(), "Mailbox full, welcome message dropped");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(connection_id = %client.connection_id(), "Mailbox already closed on registration");
            }
        }

        info!(
            connection_id = %client.connection_id(),
            user_id = %client.user_id(),
            total_clients = self.clients.len() + 1,
            "Client registered"
        );
        let connection_id = client.connection_id().to_string();
        match self.clients.insert(connection_id, client) {
            // The replaced client is dropped here, which closes its mailbox.
            Some(previous) => {
                warn!(
                    connection_id = %previous.connection_id(),
                    user_id = %previous.user_id(),
                    "Duplicate connection id, previous client replaced"
                );
                self.metrics.set_current_connections(self.clients.len());
            }
            None => self.metrics.connection_opened(self.clients.len()),
        }
    }

    fn unregister_client(&mut self, connection_id: &str) {
        // Dropping the client closes its mailbox so both pumps wind down.
        if let Some(client) = self.clients.remove(connection_id) {
            self.metrics.set_current_connections(self.clients.len());
            info!(
                connection_id = %connection_id,
                user_id = %client.user_id(),
                total_clients = self.clients.len(),
                "Client unregistered"
            );
        }
    }

    fn dispatch(&mut self, dispatch: Dispatch) {
        match dispatch {
            Dispatch::Inbound(message) => {
                self.metrics.message_received(&message.kind);
                self.deliver(message);
            }
            Dispatch::Reply(message) => self.deliver(message),
        }
    }

    fn deliver(&mut self, message: Message) {
        let mut stale = Vec::new();
        for (connection_id, client) in &self.clients {
            if let Some(target) = message.target() {
                if !client.matches(target) {
                    continue;
                }
            }

            match client.try_deliver(message.clone()) {
                Ok(()) => self.metrics.message_sent(),
                Err(TrySendError::Full(_)) => {
                    warn!(
                        connection_id = %connection_id,
                        kind = %message.kind,
                        "Mailbox full, dropping message and removing client"
                    );
                    stale.push(connection_id.clone());
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(connection_id = %connection_id, "Mailbox closed, removing client");
                    stale.push(connection_id.clone());
                }
            }
        }

        for connection_id in stale {
            self.schedule_removal(connection_id);
        }
    }

    /// Queues an unregistration from a separate task so a full unregister
    /// queue never stalls the loop.
    fn schedule_removal(&self, connection_id: String) {
        let unregister_tx = self.unregister_tx.clone();
        tokio::spawn(async move {
            let _ = unregister_tx.send(connection_id).await;
        });
    }

    async fn shutdown(&mut self) {
        self.state.send_replace(HubState::ShuttingDown);
        info!(clients = self.clients.len(), "Hub shutting down");

        // Messages accepted before the shutdown request still go out.
        while let Ok(dispatch) = self.requests.broadcast.try_recv() {
            self.dispatch(dispatch);
        }

        let close = Message::close(CLOSE_GOING_AWAY, "Server shutting down");
        for (connection_id, client) in &self.clients {
            if let Err(e) = client.try_deliver(close.clone()) {
                warn!(connection_id = %connection_id, error = %e, "Failed to deliver close message");
            }
        }

        if !self.clients.is_empty() && !self.shutdown_grace.is_zero() {
            tokio::time::sleep(self.shutdown_grace).await;
        }

        let closed = self.clients.len();
        self.clients.clear();
        self.metrics.set_current_connections(0);
        info!(closed, "All client mailboxes closed");
    }
}
