//! Topic management
//!
//! A `Topic` holds the delivery queues of everyone subscribed to one topic
//! name. The `Registry` owns every topic plus a reverse index from subscriber
//! to joined topics, both behind a single lock so they never disagree.
//!
//! Delivery never happens while the lock is held: `subscribers` hands out a
//! snapshot, so a subscriber reacting to a message may join or leave freely.

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

use tokio::sync::mpsc;

use crate::broker::message::Message;

pub type SubscriberId = String;

/// Delivery endpoint of one session or programmatic client.
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub id: SubscriberId,
    pub sender: mpsc::Sender<Message>,
}

impl Subscriber {
    pub fn new(id: impl Into<SubscriberId>, sender: mpsc::Sender<Message>) -> Self {
        Self {
            id: id.into(),
            sender,
        }
    }
}

#[derive(Debug, Default)]
pub struct Topic {
    pub name: String,
    pub subscribers: HashMap<SubscriberId, mpsc::Sender<Message>>,
}

impl Topic {
    /// Create a new topic with the given name.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            subscribers: HashMap::new(),
        }
    }

    /// Add a subscriber to the topic. Duplicate adds are ignored.
    pub fn subscribe(&mut self, subscriber: &Subscriber) -> bool {
        if self.subscribers.contains_key(&subscriber.id) {
            return false;
        }
        self.subscribers
            .insert(subscriber.id.clone(), subscriber.sender.clone());
        true
    }

    /// Remove a subscriber from the topic.
    pub fn unsubscribe(&mut self, id: &SubscriberId) -> bool {
        self.subscribers.remove(id).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    topics: HashMap<String, Topic>,
    memberships: HashMap<SubscriberId, HashSet<String>>,
}

impl RegistryState {
    /// Removes `id` from `topic`, pruning the topic once empty. Returns true
    /// when that removal emptied it.
    fn remove(&mut self, topic: &str, id: &SubscriberId) -> bool {
        let Some(entry) = self.topics.get_mut(topic) else {
            return false;
        };
        if !entry.unsubscribe(id) {
            return false;
        }
        if entry.is_empty() {
            self.topics.remove(topic);
            return true;
        }
        false
    }
}

/// Topic name -> subscribers map shared by the broker and every session.
#[derive(Debug, Default)]
pub struct Registry {
    state: RwLock<RegistryState>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `subscriber` to `topic`. Returns true when the topic gained its
    /// first subscriber.
    pub fn join(&self, topic: &str, subscriber: &Subscriber) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        let entry = state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic::new(topic));
        let first = entry.is_empty();
        if !entry.subscribe(subscriber) {
            return false;
        }

        state
            .memberships
            .entry(subscriber.id.clone())
            .or_default()
            .insert(topic.to_string());
        first
    }

    /// Removes `id` from `topic`. Returns true when the topic lost its last
    /// subscriber. Leaving a topic that was never joined is a no-op.
    pub fn leave(&self, topic: &str, id: &SubscriberId) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(joined) = state.memberships.get_mut(id) {
            joined.remove(topic);
            if joined.is_empty() {
                state.memberships.remove(id);
            }
        }
        state.remove(topic, id)
    }

    /// Removes `id` from every topic it joined. Returns the topics that
    /// became empty.
    pub fn leave_all(&self, id: &SubscriberId) -> Vec<String> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        let Some(joined) = state.memberships.remove(id) else {
            return Vec::new();
        };
        joined
            .into_iter()
            .filter(|topic| state.remove(topic, id))
            .collect()
    }

    /// Snapshot of the current subscribers of `topic`.
    pub fn subscribers(&self, topic: &str) -> Vec<Subscriber> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);

        state
            .topics
            .get(topic)
            .map(|t| {
                t.subscribers
                    .iter()
                    .map(|(id, sender)| Subscriber::new(id.clone(), sender.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_subscribers(&self, topic: &str) -> bool {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.topics.get(topic).is_some_and(|t| !t.is_empty())
    }

    /// Every topic with at least one subscriber.
    pub fn topics(&self) -> Vec<String> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.topics.keys().cloned().collect()
    }

    /// Topics `id` is currently joined to.
    pub fn topics_of(&self, id: &SubscriberId) -> Vec<String> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .memberships
            .get(id)
            .map(|joined| joined.iter().cloned().collect())
            .unwrap_or_default()
    }
}
