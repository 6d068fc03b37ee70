//! Invariant checks over store contents.

use tether_core::{EntityRecord, EntityStore};

/// Returns the records that break the remote-id or conflict invariants.
pub fn inconsistent_records<S: EntityStore + ?Sized>(store: &S) -> Vec<EntityRecord> {
    store
        .get_all()
        .expect("Failed to read store")
        .into_iter()
        .filter(|r| !r.is_consistent())
        .collect()
}

/// Panics with the offending records if any record is inconsistent.
#[track_caller]
pub fn assert_store_consistent<S: EntityStore + ?Sized>(store: &S) {
    let broken = inconsistent_records(store);
    assert!(broken.is_empty(), "inconsistent records: {broken:#?}");
}
