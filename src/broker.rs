use crate::protocol::Envelope;
use crate::registry::{Client, ClientId, Registry};
use dashmap::{mapref::entry::Entry, DashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// A published envelope addressed to one subscribed client.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub client_id: ClientId,
    pub envelope: Envelope,
}

#[derive(Debug, Clone)]
struct Mailbox {
    session_id: String,
    sender: mpsc::Sender<Delivery>,
}

/// Receiving side of a connection's deliveries.
///
/// One inbox exists per connection; every client id the connection subscribes
/// is bound to it through [`Broker::subscribe`].
#[derive(Debug)]
pub struct Inbox {
    session_id: String,
    sender: mpsc::Sender<Delivery>,
    receiver: mpsc::Receiver<Delivery>,
}

impl Inbox {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

/// Topic dispatch.
///
/// Delivery is best effort: a payload goes to the clients holding the topic
/// at publish time, nothing is kept for clients that connect later, and a
/// connection whose inbox is full loses the payload.
pub struct Broker {
    registry: Arc<Registry>,
    mailboxes: DashMap<ClientId, Mailbox>,
    inbox_capacity: usize,
}

impl Broker {
    pub fn new(registry: Arc<Registry>, inbox_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            registry,
            mailboxes: DashMap::new(),
            inbox_capacity: inbox_capacity.max(1),
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn open_inbox(&self, session_id: impl Into<String>) -> Inbox {
        let (sender, receiver) = mpsc::channel(self.inbox_capacity);
        Inbox {
            session_id: session_id.into(),
            sender,
            receiver,
        }
    }

    /// Route deliveries for `client_id` to `inbox`. The latest connection to
    /// attach a client id owns it.
    pub fn attach(&self, client_id: &str, inbox: &Inbox) {
        let previous = self.mailboxes.insert(
            client_id.to_owned(),
            Mailbox {
                session_id: inbox.session_id.clone(),
                sender: inbox.sender.clone(),
            },
        );
        if let Some(previous) = previous.filter(|m| m.session_id != inbox.session_id) {
            debug!(
                client_id,
                from = %previous.session_id,
                to = %inbox.session_id,
                "Client moved to a new connection"
            );
        }
    }

    /// Add `topic` to `client_id` and route its deliveries to `inbox`.
    ///
    /// The binding is made before the registry update so a concurrent
    /// [`Broker::detach`] from a previous owner cannot drop the new topic.
    pub fn subscribe(&self, client_id: &str, topic: &str, inbox: &Inbox) {
        self.attach(client_id, inbox);
        self.registry.add_or_update(Client::new(client_id, [topic]));
    }

    pub fn unsubscribe(&self, client_id: &str, topic: &str) -> bool {
        self.registry.remove_topic(client_id, topic)
    }

    pub fn is_attached(&self, client_id: &str, session_id: &str) -> bool {
        self.mailboxes
            .get(client_id)
            .map(|mailbox| mailbox.session_id == session_id)
            .unwrap_or(false)
    }

    /// Forget `client_id` if it is still bound to `session_id`.
    ///
    /// Removes both the binding and the registry entry. Returns `false` when
    /// another connection has taken the client id over in the meantime.
    pub fn detach(&self, client_id: &str, session_id: &str) -> bool {
        match self.mailboxes.entry(client_id.to_owned()) {
            Entry::Occupied(entry) if entry.get().session_id == session_id => {
                self.registry.remove(client_id);
                entry.remove();
                true
            }
            _ => false,
        }
    }

    /// Hand `envelope` to every client holding its topic. Returns the number
    /// of inboxes that accepted it.
    pub fn publish(&self, envelope: &Envelope) -> usize {
        let interested = self.registry.all_interested_in(&envelope.topic);
        let mut delivered = 0;
        let mut closed = Vec::new();

        for client_id in interested {
            let Some(mailbox) = self.mailboxes.get(&client_id).map(|m| m.value().clone()) else {
                debug!(client_id = %client_id, "No live connection for subscriber");
                continue;
            };

            let delivery = Delivery {
                client_id: client_id.clone(),
                envelope: envelope.clone(),
            };
            match mailbox.sender.try_send(delivery) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        client_id = %client_id,
                        topic = %envelope.topic,
                        "Inbox full, dropping delivery"
                    );
                }
                Err(TrySendError::Closed(_)) => closed.push((client_id, mailbox.session_id)),
            }
        }

        for (client_id, session_id) in closed {
            self.detach(&client_id, &session_id);
        }

        debug!(topic = %envelope.topic, delivered, "Published");
        delivered
    }

    /// Wait for the next delivery the inbox's connection should still see.
    ///
    /// Deliveries for a topic the client dropped after publish time, or for a
    /// client id another connection took over, are discarded. Cancel safe.
    pub async fn fan_out(&self, inbox: &mut Inbox) -> Option<Delivery> {
        while let Some(delivery) = inbox.receiver.recv().await {
            if self.deliverable(&delivery, &inbox.session_id) {
                return Some(delivery);
            }
        }
        None
    }

    /// Non-blocking [`Broker::fan_out`].
    pub fn try_fan_out(&self, inbox: &mut Inbox) -> Option<Delivery> {
        while let Ok(delivery) = inbox.receiver.try_recv() {
            if self.deliverable(&delivery, &inbox.session_id) {
                return Some(delivery);
            }
        }
        None
    }

    fn deliverable(&self, delivery: &Delivery, session_id: &str) -> bool {
        self.is_attached(&delivery.client_id, session_id)
            && self
                .registry
                .is_subscribed(&delivery.client_id, &delivery.envelope.topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn broker() -> Arc<Broker> {
        Broker::new(Arc::new(Registry::new()), 16)
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber_only() {
        let broker = broker();
        let mut sub = broker.open_inbox("s1");
        let mut other = broker.open_inbox("s2");
        broker.subscribe("c1", "news", &sub);
        broker.subscribe("c2", "sport", &other);

        let delivered = broker.publish(&Envelope::publish("c3", "news", "hello"));
        assert_eq!(delivered, 1);

        let delivery = timeout(Duration::from_secs(1), broker.fan_out(&mut sub))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.client_id, "c1");
        assert_eq!(delivery.envelope.topic, "news");
        assert_eq!(delivery.envelope.data, Some("hello".into()));

        assert!(broker.try_fan_out(&mut other).is_none());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let broker = broker();
        assert_eq!(broker.publish(&Envelope::publish("c1", "void", 1)), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_discards_queued_delivery() {
        let broker = broker();
        let mut inbox = broker.open_inbox("s1");
        broker.subscribe("c1", "news", &inbox);

        assert_eq!(broker.publish(&Envelope::publish("c2", "news", "late")), 1);
        assert!(broker.unsubscribe("c1", "news"));
        assert!(broker.try_fan_out(&mut inbox).is_none());

        assert_eq!(broker.publish(&Envelope::publish("c2", "news", "after")), 0);
    }

    #[tokio::test]
    async fn test_fan_out_waits_for_publish() {
        let broker = broker();
        let mut inbox = broker.open_inbox("s1");
        broker.subscribe("c1", "news", &inbox);

        assert!(timeout(Duration::from_millis(50), broker.fan_out(&mut inbox))
            .await
            .is_err());

        let publisher = Arc::clone(&broker);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish(&Envelope::publish("c2", "news", "tick"));
        });

        let delivery = timeout(Duration::from_secs(1), broker.fan_out(&mut inbox))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.envelope.data, Some("tick".into()));
    }

    #[tokio::test]
    async fn test_takeover_and_detach() {
        let broker = broker();
        let mut old = broker.open_inbox("s1");
        let mut new = broker.open_inbox("s2");
        broker.subscribe("c1", "news", &old);
        broker.subscribe("c1", "sport", &new);
        assert!(broker.is_attached("c1", "s2"));

        broker.publish(&Envelope::publish("c2", "news", "x"));
        assert!(broker.try_fan_out(&mut old).is_none());
        assert!(broker.try_fan_out(&mut new).is_some());

        // The old connection closing must not drop the client.
        assert!(!broker.detach("c1", "s1"));
        assert!(broker.registry().contains("c1"));

        assert!(broker.detach("c1", "s2"));
        assert!(!broker.registry().contains("c1"));
        assert_eq!(broker.publish(&Envelope::publish("c2", "news", "y")), 0);
    }

    #[tokio::test]
    async fn test_full_inbox_drops() {
        let broker = Broker::new(Arc::new(Registry::new()), 2);
        let mut inbox = broker.open_inbox("s1");
        broker.subscribe("c1", "news", &inbox);

        for i in 0..5 {
            broker.publish(&Envelope::publish("c2", "news", i));
        }

        let mut received = Vec::new();
        while let Some(delivery) = broker.try_fan_out(&mut inbox) {
            received.push(delivery.envelope.data.unwrap());
        }
        assert_eq!(received, vec![serde_json::json!(0), serde_json::json!(1)]);
    }
}
