//! Conflict resolution between a local record and its remote version.
//!
//! Resolution is a pure decision: the resolver never touches the store or
//! the queue. The sync service applies the returned [`Resolution`].

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tether_core::{EntityRecord, RemoteEntity};
use tracing::debug;

/// Outcome of resolving one conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Drop the local changes and adopt the remote version.
    AcceptRemote,
    /// Keep the local changes and push them over the remote version.
    KeepLocal,
    /// Replace the local payload with a merged one and push it.
    Merge(Value),
    /// Stop automatic handling; a person has to decide.
    NeedsManualResolution,
}

/// A field-level merge function.
///
/// Returning `None` means the merge does not apply and last-write-wins is
/// used instead.
pub type MergeFn = Arc<dyn Fn(&EntityRecord, &RemoteEntity) -> Option<Value> + Send + Sync>;

/// How conflicts of one entity type are decided.
#[derive(Clone)]
pub enum ConflictStrategy {
    /// The later of `local_updated_at` and the remote `updated_at` wins.
    /// Ties go to the remote.
    LastWriteWins,
    /// The remote version always wins.
    ServerWins,
    /// The local version always wins.
    ClientWins,
    /// Every conflict needs a manual decision.
    Manual,
    /// A registered merge function decides.
    Merge(MergeFn),
}

impl ConflictStrategy {
    /// Wraps a merge function.
    pub fn merge<F>(f: F) -> Self
    where
        F: Fn(&EntityRecord, &RemoteEntity) -> Option<Value> + Send + Sync + 'static,
    {
        Self::Merge(Arc::new(f))
    }
}

impl fmt::Debug for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictStrategy::LastWriteWins => f.write_str("LastWriteWins"),
            ConflictStrategy::ServerWins => f.write_str("ServerWins"),
            ConflictStrategy::ClientWins => f.write_str("ClientWins"),
            ConflictStrategy::Manual => f.write_str("Manual"),
            ConflictStrategy::Merge(_) => f.write_str("Merge(..)"),
        }
    }
}

/// Last-write-wins by timestamp; a tie goes to the remote.
pub fn last_write_wins(local: &EntityRecord, remote: &RemoteEntity) -> Resolution {
    if local.local_updated_at > remote.updated_at {
        Resolution::KeepLocal
    } else {
        Resolution::AcceptRemote
    }
}

/// Decides conflicts using a per-entity-type strategy registry.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    default: ConflictStrategy,
    strategies: HashMap<String, ConflictStrategy>,
}

impl ConflictResolver {
    /// Creates a resolver using last-write-wins for every type.
    pub fn new() -> Self {
        Self::with_default(ConflictStrategy::LastWriteWins)
    }

    /// Creates a resolver with another fallback strategy.
    pub fn with_default(default: ConflictStrategy) -> Self {
        Self {
            default,
            strategies: HashMap::new(),
        }
    }

    /// Registers a strategy for one entity type.
    pub fn with_strategy(mut self, entity_type: impl Into<String>, strategy: ConflictStrategy) -> Self {
        self.register(entity_type, strategy);
        self
    }

    /// Registers a strategy for one entity type, replacing any earlier one.
    pub fn register(&mut self, entity_type: impl Into<String>, strategy: ConflictStrategy) {
        self.strategies.insert(entity_type.into(), strategy);
    }

    /// Returns the strategy that applies to `entity_type`.
    pub fn strategy_for(&self, entity_type: &str) -> &ConflictStrategy {
        self.strategies.get(entity_type).unwrap_or(&self.default)
    }

    /// Decides between a local record and the remote version of it.
    pub fn resolve(&self, local: &EntityRecord, remote: &RemoteEntity) -> Resolution {
        let strategy = self.strategy_for(&local.entity_type);
        let resolution = match strategy {
            ConflictStrategy::LastWriteWins => last_write_wins(local, remote),
            ConflictStrategy::ServerWins => Resolution::AcceptRemote,
            ConflictStrategy::ClientWins => Resolution::KeepLocal,
            ConflictStrategy::Manual => Resolution::NeedsManualResolution,
            ConflictStrategy::Merge(merge) => match merge(local, remote) {
                Some(payload) => Resolution::Merge(payload),
                None => last_write_wins(local, remote),
            },
        };

        debug!(
            local_id = %local.local_id,
            entity_type = %local.entity_type,
            ?strategy,
            ?resolution,
            "conflict resolved"
        );
        resolution
    }

    /// Decides between local edits and a remote deletion of the entity.
    ///
    /// A merge function has nothing to merge with, so `Merge` falls back to
    /// last-write-wins against the deletion time.
    pub fn resolve_deletion(&self, local: &EntityRecord, tombstone: &RemoteEntity) -> Resolution {
        let strategy = self.strategy_for(&local.entity_type);
        let resolution = match strategy {
            ConflictStrategy::LastWriteWins | ConflictStrategy::Merge(_) => {
                last_write_wins(local, tombstone)
            }
            ConflictStrategy::ServerWins => Resolution::AcceptRemote,
            ConflictStrategy::ClientWins => Resolution::KeepLocal,
            ConflictStrategy::Manual => Resolution::NeedsManualResolution,
        };

        debug!(
            local_id = %local.local_id,
            entity_type = %local.entity_type,
            ?strategy,
            ?resolution,
            "deletion conflict resolved"
        );
        resolution
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use proptest::prelude::*;
    use serde_json::json;

    fn pair(local_offset_secs: i64) -> (EntityRecord, RemoteEntity) {
        let now = Utc::now();
        let local = EntityRecord::new_local(
            "notes",
            json!({ "title": "local", "tags": ["a"] }),
            now + Duration::seconds(local_offset_secs),
        );
        let remote = RemoteEntity::new("r-1", "notes", json!({ "title": "remote", "tags": ["b"] }), now);
        (local, remote)
    }

    #[test]
    fn lww_later_local_keeps_local() {
        let (local, remote) = pair(10);
        assert_eq!(ConflictResolver::new().resolve(&local, &remote), Resolution::KeepLocal);
    }

    #[test]
    fn lww_later_remote_accepts_remote() {
        let (local, remote) = pair(-10);
        assert_eq!(ConflictResolver::new().resolve(&local, &remote), Resolution::AcceptRemote);
    }

    #[test]
    fn lww_tie_goes_to_remote() {
        let (local, remote) = pair(0);
        assert_eq!(ConflictResolver::new().resolve(&local, &remote), Resolution::AcceptRemote);
    }

    #[test]
    fn per_type_overrides() {
        let resolver = ConflictResolver::new()
            .with_strategy("notes", ConflictStrategy::ClientWins)
            .with_strategy("tags", ConflictStrategy::ServerWins);

        let (local, remote) = pair(-10);
        assert_eq!(resolver.resolve(&local, &remote), Resolution::KeepLocal);

        let mut tag = local.clone();
        tag.entity_type = "tags".into();
        let (_, remote_late) = pair(0);
        assert_eq!(resolver.resolve(&tag, &remote_late), Resolution::AcceptRemote);

        let mut other = local;
        other.entity_type = "other".into();
        assert_eq!(resolver.resolve(&other, &remote), Resolution::AcceptRemote);
    }

    #[test]
    fn manual_strategy() {
        let resolver = ConflictResolver::with_default(ConflictStrategy::Manual);
        let (local, remote) = pair(10);
        assert_eq!(resolver.resolve(&local, &remote), Resolution::NeedsManualResolution);
    }

    #[test]
    fn merge_function_and_fallback() {
        let resolver = ConflictResolver::new().with_strategy(
            "notes",
            ConflictStrategy::merge(|local, remote| {
                let mut tags = local.payload["tags"].as_array()?.clone();
                tags.extend(remote.payload["tags"].as_array()?.iter().cloned());
                Some(json!({ "title": local.payload["title"], "tags": tags }))
            }),
        );

        let (local, remote) = pair(-10);
        assert_eq!(
            resolver.resolve(&local, &remote),
            Resolution::Merge(json!({ "title": "local", "tags": ["a", "b"] }))
        );

        let mut untagged = local;
        untagged.payload = json!({ "title": "no tags" });
        assert_eq!(resolver.resolve(&untagged, &remote), Resolution::AcceptRemote);
    }

    #[test]
    fn deletion_follows_strategy() {
        let now = Utc::now();
        let local = EntityRecord::new_local("notes", json!({ "title": "local" }), now);
        let earlier = RemoteEntity::tombstone("r-1", "notes", now - Duration::seconds(10));
        let later = RemoteEntity::tombstone("r-1", "notes", now + Duration::seconds(10));

        let lww = ConflictResolver::new();
        assert_eq!(lww.resolve_deletion(&local, &earlier), Resolution::KeepLocal);
        assert_eq!(lww.resolve_deletion(&local, &later), Resolution::AcceptRemote);

        let merging = ConflictResolver::with_default(ConflictStrategy::merge(|_, _| Some(json!({}))));
        assert_eq!(merging.resolve_deletion(&local, &earlier), Resolution::KeepLocal);

        let manual = ConflictResolver::with_default(ConflictStrategy::Manual);
        assert_eq!(
            manual.resolve_deletion(&local, &earlier),
            Resolution::NeedsManualResolution
        );
        let server = ConflictResolver::with_default(ConflictStrategy::ServerWins);
        assert_eq!(server.resolve_deletion(&local, &earlier), Resolution::AcceptRemote);
    }

    proptest! {
        #[test]
        fn lww_is_deterministic(local_secs in -1_000i64..1_000, remote_secs in -1_000i64..1_000) {
            let base = Utc::now();
            let local = EntityRecord::new_local("notes", json!({}), base + Duration::seconds(local_secs));
            let remote = RemoteEntity::new("r", "notes", json!({}), base + Duration::seconds(remote_secs));

            let first = last_write_wins(&local, &remote);
            prop_assert_eq!(&first, &last_write_wins(&local, &remote));
            if local_secs > remote_secs {
                prop_assert_eq!(first, Resolution::KeepLocal);
            } else {
                prop_assert_eq!(first, Resolution::AcceptRemote);
            }
        }
    }
}
