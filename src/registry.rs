use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{BTreeSet, HashSet};
use tracing::debug;

pub type ClientId = String;
pub type Topic = String;

/// A client id and the topics it currently holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    pub id: ClientId,
    pub topics: HashSet<Topic>,
}

impl Client {
    pub fn new<I, T>(id: impl Into<ClientId>, topics: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Topic>,
    {
        Self {
            id: id.into(),
            topics: topics.into_iter().map(Into::into).collect(),
        }
    }

    pub fn has_topic(&self, topic: &str) -> bool {
        self.topics.contains(topic)
    }
}

/// Shared table of known clients and their subscriptions.
///
/// Every operation is safe to call concurrently from any number of sessions;
/// no reference into the map escapes a method.
#[derive(Debug, Default)]
pub struct Registry {
    clients: DashMap<ClientId, Client>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Client> {
        self.clients.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.clients.contains_key(id)
    }

    /// Insert `client`, or merge its topics into the existing entry.
    ///
    /// Repeated subscribes only ever add topics.
    pub fn add_or_update(&self, client: Client) {
        match self.clients.entry(client.id.clone()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().topics.extend(client.topics);
            }
            Entry::Vacant(entry) => {
                debug!(client_id = %client.id, "Registering client");
                entry.insert(client);
            }
        }
    }

    /// Remove a single topic. Returns whether the client held it.
    pub fn remove_topic(&self, id: &str, topic: &str) -> bool {
        self.clients
            .get_mut(id)
            .map(|mut entry| entry.topics.remove(topic))
            .unwrap_or(false)
    }

    pub fn remove(&self, id: &str) -> Option<Client> {
        self.clients.remove(id).map(|(_, client)| client)
    }

    pub fn is_subscribed(&self, id: &str, topic: &str) -> bool {
        self.clients
            .get(id)
            .map(|entry| entry.has_topic(topic))
            .unwrap_or(false)
    }

    pub fn all_interested_in(&self, topic: &str) -> HashSet<ClientId> {
        self.clients
            .iter()
            .filter(|entry| entry.has_topic(topic))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Distinct topic names across all clients.
    pub fn topics(&self) -> BTreeSet<Topic> {
        self.clients
            .iter()
            .flat_map(|entry| entry.topics.clone())
            .collect()
    }

    pub fn has_topic(&self, topic: &str) -> bool {
        self.clients.iter().any(|entry| entry.has_topic(topic))
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn set(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_get_does_not_create() {
        let registry = Registry::new();
        assert!(registry.get("c1").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_add_or_update_unions_topics() {
        let registry = Registry::new();
        registry.add_or_update(Client::new("c1", ["news"]));
        registry.add_or_update(Client::new("c1", ["sport"]));
        registry.add_or_update(Client::new("c1", ["news"]));

        let client = registry.get("c1").unwrap();
        assert_eq!(client.topics, set(&["news", "sport"]));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_topic() {
        let registry = Registry::new();
        registry.add_or_update(Client::new("c1", ["news", "sport"]));

        assert!(registry.remove_topic("c1", "news"));
        assert!(!registry.remove_topic("c1", "news"));
        assert!(!registry.remove_topic("missing", "news"));
        assert_eq!(registry.get("c1").unwrap().topics, set(&["sport"]));
    }

    #[test]
    fn test_subscribe_unsubscribe_sequence() {
        let registry = Registry::new();
        for topic in ["a", "b", "c", "d"] {
            registry.add_or_update(Client::new("c1", [topic]));
        }
        registry.remove_topic("c1", "b");
        registry.add_or_update(Client::new("c1", ["e"]));
        registry.remove_topic("c1", "d");

        assert_eq!(registry.get("c1").unwrap().topics, set(&["a", "c", "e"]));
    }

    #[test]
    fn test_all_interested_in() {
        let registry = Registry::new();
        registry.add_or_update(Client::new("c1", ["news"]));
        registry.add_or_update(Client::new("c2", ["news", "sport"]));
        registry.add_or_update(Client::new("c3", ["sport"]));

        assert_eq!(registry.all_interested_in("news"), set(&["c1", "c2"]));
        assert_eq!(registry.all_interested_in("sport"), set(&["c2", "c3"]));
        assert!(registry.all_interested_in("weather").is_empty());

        registry.remove_topic("c2", "news");
        assert_eq!(registry.all_interested_in("news"), set(&["c1"]));
    }

    #[test]
    fn test_derived_topics() {
        let registry = Registry::new();
        registry.add_or_update(Client::new("c1", ["news"]));
        registry.add_or_update(Client::new("c2", ["news", "sport"]));

        let topics: Vec<_> = registry.topics().into_iter().collect();
        assert_eq!(topics, vec!["news".to_string(), "sport".to_string()]);
        assert!(registry.has_topic("sport"));

        registry.remove("c2");
        assert!(!registry.has_topic("sport"));
    }

    #[test]
    fn test_concurrent_updates() {
        let registry = Arc::new(Registry::new());
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        registry.add_or_update(Client::new("shared", [format!("t{worker}-{i}")]));
                        registry.add_or_update(Client::new(format!("own{worker}"), ["x"]));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.get("shared").unwrap().topics.len(), 800);
        assert_eq!(registry.len(), 9);
        assert_eq!(registry.all_interested_in("x").len(), 8);
    }
}
