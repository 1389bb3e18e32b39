use tokio::sync::mpsc;
use uuid::Uuid;

use super::message::Message;

/// Receiving half of a client's outbound mailbox, drained by its write pump.
pub type Mailbox = mpsc::Receiver<Message>;

/// The hub-facing half of a connection.
///
/// The hub is the only writer to `mailbox`. Dropping the `Client` (which the
/// hub does on unregistration or shutdown) closes the mailbox, which tells the
/// connection's write pump to exit.
#[derive(Debug)]
pub struct Client {
    connection_id: String,
    user_id: String,
    mailbox: mpsc::Sender<Message>,
}

impl Client {
    /// Creates a client with a fresh connection id and a mailbox of `capacity` slots.
    pub fn new(user_id: impl Into<String>, capacity: usize) -> (Self, Mailbox) {
        Self::with_id(Uuid::new_v4().to_string(), user_id, capacity)
    }

    pub fn with_id(
        connection_id: impl Into<String>,
        user_id: impl Into<String>,
        capacity: usize,
    ) -> (Self, Mailbox) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let client = Self {
            connection_id: connection_id.into(),
            user_id: user_id.into(),
            mailbox: tx,
        };
        (client, rx)
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Whether a message addressed to `target` should reach this client.
    pub fn matches(&self, target: &str) -> bool {
        self.connection_id == target || self.user_id == target
    }

    pub(crate) fn try_deliver(
        &self,
        message: Message,
    ) -> Result<(), mpsc::error::TrySendError<Message>> {
        self.mailbox.try_send(message)
    }
}
