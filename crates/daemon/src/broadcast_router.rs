//! Fans supervisor events out to the clients that asked for them.
//!
//! The router keeps no state of its own. It reads the registry's
//! subscriptions at delivery time and hands each message to every target
//! individually, so a dead client never holds up the others.

use crate::connection_registry::{ConnectionRegistry, Delivery};
use bytes::Bytes;
use ops_types::{
    ClientId, CommandEvent, CommandId, CommandStatus, OutputStream, ServerMessage, SystemStatus,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct BroadcastRouter {
    registry: Arc<ConnectionRegistry>,
}

impl BroadcastRouter {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Drains the supervisor's event stream until it closes.
    pub async fn run(self: Arc<Self>, events: flume::Receiver<CommandEvent>) {
        info!("Broadcast router is running.");
        while let Ok(event) = events.recv_async().await {
            self.route(&event);
        }
        info!("Broadcast router finished: event stream closed.");
    }

    pub fn route(&self, event: &CommandEvent) {
        let command_id = event.command_id();
        self.fan_out_to_subscribers(&command_id, ServerMessage::from(event));
        if event.is_terminal() {
            self.registry.forget_command(&command_id);
        }
    }

    pub fn on_command_output(&self, command_id: CommandId, stream: OutputStream, data: Bytes) {
        self.route(&CommandEvent::Output {
            command_id,
            stream,
            data,
        });
    }

    pub fn on_command_status(
        &self,
        command_id: CommandId,
        status: CommandStatus,
        exit_code: Option<i32>,
    ) {
        self.route(&CommandEvent::Status {
            command_id,
            status,
            exit_code,
        });
    }

    /// Delivers to every registered client, subscriptions notwithstanding.
    pub fn on_system_status(&self, status: SystemStatus) {
        let message = ServerMessage::SystemStatus(status);
        let mut closed = Vec::new();
        for client_id in self.registry.client_ids() {
            if self.registry.deliver(&client_id, message.clone()) == Delivery::Closed {
                closed.push(client_id);
            }
        }
        self.cleanup(closed);
    }

    fn fan_out_to_subscribers(&self, command_id: &CommandId, message: ServerMessage) {
        let targets = self.registry.clients_subscribed_to(command_id);
        if targets.is_empty() {
            return;
        }

        let mut closed = Vec::new();
        for client_id in targets {
            match self
                .registry
                .deliver_to_subscriber(&client_id, command_id, message.clone())
            {
                Delivery::Sent => {}
                Delivery::Skipped => {
                    debug!(client_id = %client_id, command_id = %command_id, "Client unsubscribed mid-delivery")
                }
                Delivery::Closed => closed.push(client_id),
            }
        }
        self.cleanup(closed);
    }

    fn cleanup(&self, closed: Vec<ClientId>) {
        for client_id in closed {
            warn!(client_id = %client_id, "Failed to send message, client disconnected");
            self.registry.unregister(&client_id);
        }
    }
}
