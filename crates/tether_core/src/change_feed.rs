//! Change feed for observing the entity store.
//!
//! Every store mutation publishes a snapshot of the current record set.
//! Subscribers may restrict themselves to one entity type, and a new
//! subscriber receives the current snapshot straight away, so a reactive
//! view never has to issue a separate initial read.
//!
//! # Usage
//!
//! ```rust,ignore
//! let rx = store.subscribe(Some("notes"));
//!
//! std::thread::spawn(move || {
//!     while let Ok(notes) = rx.recv() {
//!         println!("{} notes", notes.len());
//!     }
//! });
//! ```

use crate::entity::EntityRecord;
use parking_lot::Mutex;
use std::sync::mpsc::{self, Receiver, Sender};

struct Subscriber {
    entity_type: Option<String>,
    sender: Sender<Vec<EntityRecord>>,
}

impl Subscriber {
    /// Sends the part of `records` this subscriber cares about.
    fn send(&self, records: &[EntityRecord]) -> bool {
        let snapshot = match &self.entity_type {
            Some(entity_type) => records
                .iter()
                .filter(|r| &r.entity_type == entity_type)
                .cloned()
                .collect(),
            None => records.to_vec(),
        };
        self.sender.send(snapshot).is_ok()
    }
}

/// Distributes record snapshots to subscribers.
///
/// Snapshots are delivered in publish order. Subscribers whose receiver has
/// been dropped are removed on the next publish.
#[derive(Default)]
pub struct ChangeFeed {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl ChangeFeed {
    /// Creates a feed with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber and sends it `current` immediately.
    ///
    /// With `entity_type` set, only records of that type are delivered.
    pub fn subscribe(
        &self,
        entity_type: Option<String>,
        current: &[EntityRecord],
    ) -> Receiver<Vec<EntityRecord>> {
        let (sender, receiver) = mpsc::channel();
        let subscriber = Subscriber {
            entity_type,
            sender,
        };

        if subscriber.send(current) {
            self.subscribers.lock().push(subscriber);
        }
        receiver
    }

    /// Publishes a snapshot of the full record set.
    pub fn publish(&self, records: &[EntityRecord]) {
        self.subscribers.lock().retain(|s| s.send(records));
    }

    /// Returns true if anyone is listening.
    pub fn has_subscribers(&self) -> bool {
        !self.subscribers.lock().is_empty()
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl std::fmt::Debug for ChangeFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeed")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn record(entity_type: &str) -> EntityRecord {
        EntityRecord::new_local(entity_type, json!({}), Utc::now())
    }

    #[test]
    fn subscriber_gets_current_set_first() {
        let feed = ChangeFeed::new();
        let current = vec![record("notes"), record("tags")];

        let rx = feed.subscribe(None, &current);
        assert_eq!(rx.try_recv().unwrap().len(), 2);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn filter_by_entity_type() {
        let feed = ChangeFeed::new();
        let rx = feed.subscribe(Some("notes".into()), &[]);
        assert!(rx.try_recv().unwrap().is_empty());

        feed.publish(&[record("notes"), record("tags"), record("notes")]);
        let snapshot = rx.try_recv().unwrap();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().all(|r| r.entity_type == "notes"));
    }

    #[test]
    fn dropped_subscribers_are_removed() {
        let feed = ChangeFeed::new();
        let kept = feed.subscribe(None, &[]);
        let dropped = feed.subscribe(None, &[]);
        assert_eq!(feed.subscriber_count(), 2);

        drop(dropped);
        feed.publish(&[record("notes")]);

        assert_eq!(feed.subscriber_count(), 1);
        assert!(kept.try_recv().is_ok());
    }
}
