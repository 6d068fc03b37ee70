//! Property-based test generators using proptest.

use chrono::{DateTime, Utc};
use proptest::prelude::*;
use serde_json::{json, Value};
use tether_core::{EntityRecord, OperationType};

/// Earliest generated timestamp (2023-11-14T22:13:20Z).
pub const TIMESTAMP_BASE: i64 = 1_700_000_000;

/// Strategy for generating entity type names.
pub fn entity_type_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z_]{0,11}").expect("Invalid regex")
}

/// Strategy for generating JSON object payloads.
pub fn payload_strategy() -> impl Strategy<Value = Value> {
    (
        prop::string::string_regex("[ -~]{0,24}").expect("Invalid regex"),
        any::<i32>(),
        any::<bool>(),
        prop::collection::vec(prop::string::string_regex("[a-z]{1,8}").expect("Invalid regex"), 0..4),
    )
        .prop_map(|(title, count, done, tags)| {
            json!({ "title": title, "count": count, "done": done, "tags": tags })
        })
}

/// Strategy for generating timestamps within one year of [`TIMESTAMP_BASE`].
pub fn timestamp_strategy() -> impl Strategy<Value = DateTime<Utc>> {
    (0i64..31_536_000, 0u32..1_000_000).prop_map(|(secs, micros)| {
        DateTime::from_timestamp(TIMESTAMP_BASE + secs, micros * 1_000).unwrap_or_default()
    })
}

/// Strategy for generating operation types.
pub fn operation_type_strategy() -> impl Strategy<Value = OperationType> {
    prop_oneof![
        Just(OperationType::Create),
        Just(OperationType::Update),
        Just(OperationType::Delete),
    ]
}

/// Strategy for generating freshly created local records.
pub fn local_record_strategy() -> impl Strategy<Value = EntityRecord> {
    (entity_type_strategy(), payload_strategy(), timestamp_strategy())
        .prop_map(|(entity_type, payload, at)| EntityRecord::new_local(entity_type, payload, at))
}

/// Proptest configuration for slower tests that touch durable logs.
pub fn durable_test_config() -> ProptestConfig {
    ProptestConfig {
        cases: 32,
        ..ProptestConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::SyncStatus;

    proptest! {
        #[test]
        fn payloads_are_objects(payload in payload_strategy()) {
            prop_assert!(payload.is_object());
            prop_assert!(payload["title"].is_string());
        }

        #[test]
        fn timestamps_in_range(at in timestamp_strategy()) {
            prop_assert!(at.timestamp() >= TIMESTAMP_BASE);
            prop_assert!(at.timestamp() < TIMESTAMP_BASE + 31_536_000);
        }

        #[test]
        fn local_records_are_consistent(record in local_record_strategy()) {
            prop_assert_eq!(record.sync_status, SyncStatus::PendingCreate);
            prop_assert!(record.is_consistent());
            prop_assert!(!record.entity_type.is_empty());
        }
    }
}
