//! Tracks connected real-time clients and the commands each one follows.
//!
//! Each client owns an unbounded outbox. The registry enqueues into it and a
//! transport task drains it to the socket, so nothing here ever waits on a
//! slow client.
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use ops_types::{ClientId, ClientMessage, CommandId, ServerMessage};
use std::collections::HashSet;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Receiving end of a client's outbox, drained by its transport.
pub type Outbox = mpsc::UnboundedReceiver<ServerMessage>;

/// Represents a connected client with its subscriptions.
struct Client {
    outbox: mpsc::UnboundedSender<ServerMessage>,
    subscriptions: HashSet<CommandId>,
    connected_at: DateTime<Utc>,
}

/// Outcome of handing one message to one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Client unknown, or not subscribed to the command.
    Skipped,
    /// The client's transport is gone.
    Closed,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    clients: DashMap<ClientId, Client>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits a new client. The `connection` acknowledgement is queued before
    /// the client becomes visible to anyone else, so it is always first.
    pub fn register(&self) -> (ClientId, Outbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        loop {
            let client_id = ClientId::new();
            if let Entry::Vacant(slot) = self.clients.entry(client_id) {
                let _ = tx.send(ServerMessage::Connection { client_id });
                slot.insert(Client {
                    outbox: tx,
                    subscriptions: HashSet::new(),
                    connected_at: Utc::now(),
                });
                info!(client_id = %client_id, "Client connected");
                return (client_id, rx);
            }
        }
    }

    /// Removes a client and all of its subscriptions. Idempotent.
    pub fn unregister(&self, client_id: &ClientId) -> bool {
        match self.clients.remove(client_id) {
            Some((_, client)) => {
                let connected_for = Utc::now() - client.connected_at;
                info!(
                    client_id = %client_id,
                    subscriptions = client.subscriptions.len(),
                    connected_secs = connected_for.num_seconds(),
                    "Client disconnected. Removing."
                );
                true
            }
            None => false,
        }
    }

    /// Adds a subscription and queues the `subscribed` acknowledgement in the
    /// same step. Returns false if the client is already gone.
    pub fn subscribe(&self, client_id: &ClientId, command_id: &CommandId) -> bool {
        let Some(mut client) = self.clients.get_mut(client_id) else {
            debug!(client_id = %client_id, "Subscribe from unregistered client ignored");
            return false;
        };
        client.subscriptions.insert(*command_id);
        let _ = client.outbox.send(ServerMessage::Subscribed {
            command_id: *command_id,
        });
        info!(client_id = %client_id, command_id = %command_id, "Client subscribed to command");
        true
    }

    /// Removes a subscription and queues the `unsubscribed` acknowledgement.
    /// Nothing for the command is queued for this client after the ack.
    pub fn unsubscribe(&self, client_id: &ClientId, command_id: &CommandId) -> bool {
        let Some(mut client) = self.clients.get_mut(client_id) else {
            debug!(client_id = %client_id, "Unsubscribe from unregistered client ignored");
            return false;
        };
        client.subscriptions.remove(command_id);
        let _ = client.outbox.send(ServerMessage::Unsubscribed {
            command_id: *command_id,
        });
        info!(client_id = %client_id, command_id = %command_id, "Client unsubscribed from command");
        true
    }

    /// Drops every client. Their transports see the outbox close and hang up.
    pub fn disconnect_all(&self) -> usize {
        let ids = self.client_ids();
        ids.iter().filter(|id| self.unregister(id)).count()
    }

    pub fn is_subscribed(&self, client_id: &ClientId, command_id: &CommandId) -> bool {
        self.clients
            .get(client_id)
            .is_some_and(|client| client.subscriptions.contains(command_id))
    }

    pub fn clients_subscribed_to(&self, command_id: &CommandId) -> Vec<ClientId> {
        self.clients
            .iter()
            .filter(|client| client.subscriptions.contains(command_id))
            .map(|client| *client.key())
            .collect()
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        self.clients.iter().map(|client| *client.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Queues a message for a client regardless of its subscriptions.
    pub fn deliver(&self, client_id: &ClientId, message: ServerMessage) -> Delivery {
        match self.clients.get(client_id) {
            Some(client) => Self::push(&client.outbox, message),
            None => Delivery::Skipped,
        }
    }

    /// Queues a command message only if the client is still subscribed,
    /// checked atomically with the enqueue.
    pub fn deliver_to_subscriber(
        &self,
        client_id: &ClientId,
        command_id: &CommandId,
        message: ServerMessage,
    ) -> Delivery {
        match self.clients.get(client_id) {
            Some(client) if client.subscriptions.contains(command_id) => {
                Self::push(&client.outbox, message)
            }
            _ => Delivery::Skipped,
        }
    }

    fn push(outbox: &mpsc::UnboundedSender<ServerMessage>, message: ServerMessage) -> Delivery {
        match outbox.send(message) {
            Ok(()) => Delivery::Sent,
            Err(_) => Delivery::Closed,
        }
    }

    /// Drops a finished command from every client's subscriptions.
    pub fn forget_command(&self, command_id: &CommandId) {
        for mut client in self.clients.iter_mut() {
            client.subscriptions.remove(command_id);
        }
    }

    /// Applies one inbound text frame. Frames that do not parse are logged and
    /// dropped; the connection stays up. Subscriptions to commands for which
    /// `is_live` is false are ignored. `is_live` must turn false no later than
    /// the command's terminal status is routed.
    pub fn handle_inbound<F>(&self, client_id: &ClientId, text: &str, is_live: F) -> Option<ClientMessage>
    where
        F: Fn(&CommandId) -> bool,
    {
        let message = match ClientMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(client_id = %client_id, "Dropping client message: {}", e);
                return None;
            }
        };

        match &message {
            ClientMessage::Subscribe { command_id } => {
                if is_live(command_id) {
                    self.subscribe(client_id, command_id);
                    // The command may have finished, and been forgotten, in
                    // between. Checking again after the insert closes that gap.
                    if !is_live(command_id) {
                        debug!(
                            client_id = %client_id,
                            command_id = %command_id,
                            "Command finished while subscribing, rolling back"
                        );
                        self.unsubscribe(client_id, command_id);
                    }
                } else {
                    debug!(
                        client_id = %client_id,
                        command_id = %command_id,
                        "Subscription to unknown or finished command ignored"
                    );
                }
            }
            ClientMessage::Unsubscribe { command_id } => {
                self.unsubscribe(client_id, command_id);
            }
        }
        Some(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn subscribe_frame(command_id: &CommandId) -> String {
        json!({"type": "subscribe", "commandId": command_id.to_string()}).to_string()
    }

    #[test]
    fn connection_ack_is_the_first_message() {
        let registry = ConnectionRegistry::new();
        let (client_id, mut outbox) = registry.register();
        assert_eq!(
            outbox.try_recv().unwrap(),
            ServerMessage::Connection { client_id }
        );
        assert!(outbox.try_recv().is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn concurrent_clients_get_distinct_ids() {
        let registry = ConnectionRegistry::new();
        let mut outboxes = Vec::new();
        let mut ids = HashSet::new();
        for _ in 0..500 {
            let (id, outbox) = registry.register();
            assert!(ids.insert(id));
            outboxes.push(outbox);
        }
        assert_eq!(registry.len(), 500);
    }

    #[test]
    fn subscribe_and_unsubscribe_are_acknowledged() {
        let registry = ConnectionRegistry::new();
        let (client_id, mut outbox) = registry.register();
        let command_id = CommandId::new();
        outbox.try_recv().unwrap();

        assert!(registry.subscribe(&client_id, &command_id));
        assert_eq!(registry.clients_subscribed_to(&command_id), vec![client_id]);
        assert_eq!(
            outbox.try_recv().unwrap(),
            ServerMessage::Subscribed { command_id }
        );

        assert!(registry.unsubscribe(&client_id, &command_id));
        assert!(registry.clients_subscribed_to(&command_id).is_empty());
        assert_eq!(
            outbox.try_recv().unwrap(),
            ServerMessage::Unsubscribed { command_id }
        );
    }

    #[test]
    fn unregister_is_idempotent_and_later_calls_are_no_ops() {
        let registry = ConnectionRegistry::new();
        let (client_id, _outbox) = registry.register();
        let command_id = CommandId::new();
        registry.subscribe(&client_id, &command_id);

        assert!(registry.unregister(&client_id));
        assert!(!registry.unregister(&client_id));
        assert!(!registry.subscribe(&client_id, &command_id));
        assert!(!registry.unsubscribe(&client_id, &command_id));
        assert!(registry.clients_subscribed_to(&command_id).is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn disconnect_all_closes_every_outbox() {
        let registry = ConnectionRegistry::new();
        let (_a, mut a_outbox) = registry.register();
        let (_b, mut b_outbox) = registry.register();

        assert_eq!(registry.disconnect_all(), 2);
        assert!(registry.is_empty());
        // The queued connection ack is still readable, then the channel is closed.
        assert!(a_outbox.try_recv().is_ok());
        assert!(a_outbox.try_recv().is_err());
        assert!(b_outbox.try_recv().is_ok());
        assert_eq!(
            b_outbox.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        );
    }

    #[test]
    fn subscriber_delivery_rechecks_the_subscription() {
        let registry = ConnectionRegistry::new();
        let (client_id, mut outbox) = registry.register();
        let command_id = CommandId::new();
        let message = ServerMessage::Subscribed { command_id };

        assert_eq!(
            registry.deliver_to_subscriber(&client_id, &command_id, message.clone()),
            Delivery::Skipped
        );
        registry.subscribe(&client_id, &command_id);
        assert_eq!(
            registry.deliver_to_subscriber(&client_id, &command_id, message.clone()),
            Delivery::Sent
        );

        // connection, subscribed ack, delivered message
        assert_eq!(std::iter::from_fn(|| outbox.try_recv().ok()).count(), 3);
    }

    #[test]
    fn closed_transport_is_reported() {
        let registry = ConnectionRegistry::new();
        let (client_id, outbox) = registry.register();
        drop(outbox);
        let delivery = registry.deliver(&client_id, ServerMessage::Connection { client_id });
        assert_eq!(delivery, Delivery::Closed);
        assert_eq!(
            registry.deliver(&ClientId::new(), ServerMessage::Connection { client_id }),
            Delivery::Skipped
        );
    }

    #[test]
    fn malformed_frames_are_dropped_without_disconnecting() {
        let registry = ConnectionRegistry::new();
        let (client_id, mut outbox) = registry.register();
        outbox.try_recv().unwrap();

        assert!(registry.handle_inbound(&client_id, "{{{", |_| true).is_none());
        assert!(registry
            .handle_inbound(&client_id, r#"{"type": "explode"}"#, |_| true)
            .is_none());
        assert_eq!(registry.len(), 1);
        assert!(outbox.try_recv().is_err());

        let command_id = CommandId::new();
        let parsed = registry.handle_inbound(&client_id, &subscribe_frame(&command_id), |_| true);
        assert_eq!(parsed, Some(ClientMessage::Subscribe { command_id }));
        assert!(registry.is_subscribed(&client_id, &command_id));
    }

    #[test]
    fn subscribing_to_an_unknown_command_is_a_no_op() {
        let registry = ConnectionRegistry::new();
        let (client_id, mut outbox) = registry.register();
        outbox.try_recv().unwrap();

        let command_id = CommandId::new();
        registry.handle_inbound(&client_id, &subscribe_frame(&command_id), |_| false);
        assert!(!registry.is_subscribed(&client_id, &command_id));
        assert!(outbox.try_recv().is_err());
    }

    #[test]
    fn forgetting_a_command_clears_every_subscription() {
        let registry = ConnectionRegistry::new();
        let (a, _a_outbox) = registry.register();
        let (b, _b_outbox) = registry.register();
        let command_id = CommandId::new();
        let other = CommandId::new();
        registry.subscribe(&a, &command_id);
        registry.subscribe(&b, &command_id);
        registry.subscribe(&b, &other);

        registry.forget_command(&command_id);
        assert!(registry.clients_subscribed_to(&command_id).is_empty());
        assert_eq!(registry.clients_subscribed_to(&other), vec![b]);
        assert_eq!(registry.client_ids().len(), 2);
    }
}
