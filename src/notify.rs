use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{ClientId, Party};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Recipient {
    Provider,
    Client(ClientId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotifyEvent {
    NewRequest,
    CounterProposed,
    Accepted,
    Rejected,
    Expired,
    Cancelled,
    Waitlisted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub recipient: Recipient,
    pub event: NotifyEvent,
    pub request_id: Ulid,
}

impl Notification {
    /// Address a notification to one side of a request.
    pub fn to_party(party: Party, client: &ClientId, event: NotifyEvent, request_id: Ulid) -> Self {
        let recipient = match party {
            Party::Provider => Recipient::Provider,
            Party::Client => Recipient::Client(client.clone()),
        };
        Self {
            recipient,
            event,
            request_id,
        }
    }
}

/// Delivery is someone else's problem: the engine calls this after a
/// transition commits and never looks at the result.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Broadcast hub, one channel per recipient. Front-ends subscribe to the
/// recipient they render for.
pub struct NotifyHub {
    channels: DashMap<Recipient, broadcast::Sender<Notification>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notifications for a recipient. Creates the channel if needed.
    pub fn subscribe(&self, recipient: Recipient) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(recipient)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Drop a recipient's channel, e.g. when a chat session ends.
    pub fn remove(&self, recipient: &Recipient) {
        self.channels.remove(recipient);
    }
}

impl Notifier for NotifyHub {
    /// No-op if nobody is listening.
    fn notify(&self, notification: Notification) {
        if let Some(sender) = self.channels.get(&notification.recipient) {
            let _ = sender.send(notification);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe(Recipient::Provider);

        let n = Notification {
            recipient: Recipient::Provider,
            event: NotifyEvent::NewRequest,
            request_id: Ulid::new(),
        };
        hub.notify(n.clone());

        assert_eq!(rx.recv().await.unwrap(), n);
    }

    #[tokio::test]
    async fn clients_only_see_their_own() {
        let hub = NotifyHub::new();
        let mut alice = hub.subscribe(Recipient::Client("alice".into()));
        let mut bob = hub.subscribe(Recipient::Client("bob".into()));

        let rid = Ulid::new();
        hub.notify(Notification::to_party(
            Party::Client,
            &"bob".to_string(),
            NotifyEvent::Accepted,
            rid,
        ));

        assert_eq!(bob.recv().await.unwrap().request_id, rid);
        assert!(alice.try_recv().is_err());
    }

    #[test]
    fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.notify(Notification {
            recipient: Recipient::Provider,
            event: NotifyEvent::Expired,
            request_id: Ulid::new(),
        });
    }
}
