//! In-memory index shared by both entity store implementations.

use super::Mutation;
use crate::entity::EntityRecord;
use crate::types::{LocalId, RemoteId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// One state change of the entity table; also the durable log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum StoreChange {
    Put(EntityRecord),
    Remove(LocalId),
    Watermark(DateTime<Utc>),
}

#[derive(Debug, Default)]
pub(crate) struct EntityTable {
    records: BTreeMap<LocalId, EntityRecord>,
    by_remote: HashMap<(String, RemoteId), LocalId>,
    watermark: Option<DateTime<Utc>>,
}

impl EntityTable {
    pub(crate) fn get(&self, local_id: LocalId) -> Option<&EntityRecord> {
        self.records.get(&local_id)
    }

    pub(crate) fn find_remote(&self, entity_type: &str, remote_id: &RemoteId) -> Option<&EntityRecord> {
        self.by_remote
            .get(&(entity_type.to_string(), remote_id.clone()))
            .and_then(|id| self.records.get(id))
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn watermark(&self) -> Option<DateTime<Utc>> {
        self.watermark
    }

    /// All records, oldest local change first.
    pub(crate) fn snapshot(&self) -> Vec<EntityRecord> {
        let mut records: Vec<_> = self.records.values().cloned().collect();
        records.sort_by(|a, b| {
            a.local_updated_at
                .cmp(&b.local_updated_at)
                .then(a.local_id.cmp(&b.local_id))
        });
        records
    }

    /// The minimal change list that rebuilds this table.
    pub(crate) fn checkpoint(&self) -> Vec<StoreChange> {
        let mut changes: Vec<_> = self.records.values().cloned().map(StoreChange::Put).collect();
        if let Some(at) = self.watermark {
            changes.push(StoreChange::Watermark(at));
        }
        changes
    }

    pub(crate) fn apply(&mut self, change: StoreChange) {
        match change {
            StoreChange::Put(record) => {
                if let Some(previous) = self.records.get(&record.local_id) {
                    if let Some(remote_id) = &previous.remote_id {
                        self.by_remote
                            .remove(&(previous.entity_type.clone(), remote_id.clone()));
                    }
                }
                if let Some(remote_id) = &record.remote_id {
                    self.by_remote.insert(
                        (record.entity_type.clone(), remote_id.clone()),
                        record.local_id,
                    );
                }
                self.records.insert(record.local_id, record);
            }
            StoreChange::Remove(local_id) => {
                if let Some(previous) = self.records.remove(&local_id) {
                    if let Some(remote_id) = previous.remote_id {
                        self.by_remote.remove(&(previous.entity_type, remote_id));
                    }
                }
            }
            StoreChange::Watermark(at) => self.watermark = Some(at),
        }
    }

    pub(crate) fn plan_delete(&self, local_id: LocalId) -> (Option<StoreChange>, bool) {
        if self.records.contains_key(&local_id) {
            (Some(StoreChange::Remove(local_id)), true)
        } else {
            (None, false)
        }
    }

    pub(crate) fn plan_modify(
        &self,
        local_id: LocalId,
        f: &mut dyn FnMut(&EntityRecord) -> Mutation,
    ) -> (Option<StoreChange>, Option<EntityRecord>) {
        let Some(current) = self.records.get(&local_id) else {
            return (None, None);
        };

        match f(current) {
            Mutation::Unchanged => (None, Some(current.clone())),
            Mutation::Save(mut record) => {
                record.local_id = local_id;
                (Some(StoreChange::Put(record.clone())), Some(record))
            }
            Mutation::Delete => (Some(StoreChange::Remove(local_id)), None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn remote_index_follows_puts_and_removes() {
        let mut table = EntityTable::default();
        let mut record = EntityRecord::new_local("notes", json!({}), Utc::now());
        let id = record.local_id;
        table.apply(StoreChange::Put(record.clone()));
        assert!(table.find_remote("notes", &RemoteId::new("r-1")).is_none());

        record.remote_id = Some(RemoteId::new("r-1"));
        table.apply(StoreChange::Put(record.clone()));
        assert_eq!(table.find_remote("notes", &RemoteId::new("r-1")).unwrap().local_id, id);
        assert!(table.find_remote("tags", &RemoteId::new("r-1")).is_none());

        record.remote_id = Some(RemoteId::new("r-2"));
        table.apply(StoreChange::Put(record));
        assert!(table.find_remote("notes", &RemoteId::new("r-1")).is_none());

        table.apply(StoreChange::Remove(id));
        assert!(table.find_remote("notes", &RemoteId::new("r-2")).is_none());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn checkpoint_rebuilds_table() {
        let mut table = EntityTable::default();
        for i in 0..3 {
            table.apply(StoreChange::Put(EntityRecord::new_local("notes", json!({ "n": i }), Utc::now())));
        }
        let at = Utc::now();
        table.apply(StoreChange::Watermark(at));

        let mut rebuilt = EntityTable::default();
        for change in table.checkpoint() {
            rebuilt.apply(change);
        }
        assert_eq!(rebuilt.len(), 3);
        assert_eq!(rebuilt.watermark(), Some(at));
    }
}
