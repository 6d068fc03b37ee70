//! Sync state, statistics and pass reports.

use crate::error::TransportError;
use crate::resolver::Resolution;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tether_core::{LocalId, OperationId, OperationType, SyncOperation};

/// The current state of the sync service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    /// No pass is running.
    #[default]
    Idle,
    /// A pass is running.
    Syncing,
    /// The last pass ended with failures.
    Error,
}

impl SyncState {
    /// Returns true if a pass is running.
    pub fn is_active(&self) -> bool {
        matches!(self, SyncState::Syncing)
    }

    /// Returns a lowercase name for display.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Syncing => "syncing",
            SyncState::Error => "error",
        }
    }
}

/// Cumulative statistics since the service was created.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Passes run to completion (cancelled passes included).
    pub passes_completed: u64,
    /// Operations the remote accepted.
    pub operations_pushed: u64,
    /// Failed operation attempts.
    pub operations_failed: u64,
    /// Conflicts met while pushing or pulling.
    pub conflicts_encountered: u64,
    /// Remote changes and deletions applied locally.
    pub entities_pulled: u64,
    /// Stale operations pruned.
    pub operations_pruned: u64,
    /// End of the last pass.
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Error of the last failed pass.
    pub last_error: Option<String>,
}

/// Why an operation was not attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Backoff since the last failed attempt has not elapsed.
    CoolingDown,
    /// An earlier operation of the same entity was not acknowledged.
    Blocked,
    /// The entity waits for a manual conflict decision.
    InConflict,
    /// The entity no longer exists locally; the operation was dropped.
    EntityGone,
}

/// What happened to one operation during a pass.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutcome {
    /// The remote accepted the operation.
    Succeeded,
    /// The remote reported a conflict, decided as shown.
    Conflict(Resolution),
    /// The attempt failed.
    Failed(TransportError),
    /// The operation was not attempted.
    Skipped(SkipReason),
}

/// Outcome of one operation.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationReport {
    /// The operation.
    pub operation_id: OperationId,
    /// The entity it targets.
    pub entity_id: LocalId,
    /// Mutation kind.
    pub op_type: OperationType,
    /// What happened.
    pub outcome: OperationOutcome,
}

/// Result of one sync pass.
///
/// A pass that did not run because another one was in flight returns the
/// empty default report.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    /// Operations the remote accepted.
    pub succeeded: usize,
    /// Failed attempts.
    pub failed: usize,
    /// Operations not attempted.
    pub skipped: usize,
    /// Conflicts met while pushing.
    pub conflicts: usize,
    /// Remote changes and deletions applied by the pull phase.
    pub pulled: usize,
    /// Stale operations pruned at the end of the pass.
    pub pruned: usize,
    /// Per-operation outcomes, in processing order.
    pub outcomes: Vec<OperationReport>,
    /// Whether the pass stopped early because of [`cancel`](crate::SyncService::cancel).
    pub cancelled: bool,
    /// Error that aborted a phase (failed pull, local storage failure).
    pub error: Option<String>,
    /// Wall time of the pass.
    pub duration: Duration,
}

impl SyncReport {
    /// Returns true if nothing was attempted or pulled.
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty() && self.pulled == 0 && self.pruned == 0 && self.error.is_none()
    }

    /// Returns true if nothing failed.
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.error.is_none()
    }

    pub(crate) fn record(&mut self, op: &SyncOperation, outcome: OperationOutcome) {
        match &outcome {
            OperationOutcome::Succeeded => self.succeeded += 1,
            OperationOutcome::Conflict(_) => self.conflicts += 1,
            OperationOutcome::Failed(_) => self.failed += 1,
            OperationOutcome::Skipped(_) => self.skipped += 1,
        }
        self.outcomes.push(OperationReport {
            operation_id: op.id,
            entity_id: op.entity_id,
            op_type: op.op_type,
            outcome,
        });
    }

    /// Returns the outcomes of one entity's operations.
    pub fn outcomes_for(&self, entity_id: LocalId) -> impl Iterator<Item = &OperationReport> {
        self.outcomes.iter().filter(move |o| o.entity_id == entity_id)
    }
}

/// Point-in-time summary of the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    /// Current state.
    pub state: SyncState,
    /// Queued operations, retryable or not.
    pub pending_operations: usize,
    /// Entities whose automatic sync gave up.
    pub failed_entities: usize,
    /// Entities waiting for a manual conflict decision.
    pub conflicted_entities: usize,
    /// End of the last pass.
    pub last_sync_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_core::EntityRecord;

    #[test]
    fn state_helpers() {
        assert_eq!(SyncState::default(), SyncState::Idle);
        assert!(SyncState::Syncing.is_active());
        assert!(!SyncState::Error.is_active());
        assert_eq!(SyncState::Error.as_str(), "error");
    }

    #[test]
    fn report_counts_outcomes() {
        let record = EntityRecord::new_local("notes", json!({}), Utc::now());
        let op = SyncOperation::for_record(OperationType::Create, &record, Utc::now());

        let mut report = SyncReport::default();
        assert!(report.is_empty());

        report.record(&op, OperationOutcome::Succeeded);
        report.record(&op, OperationOutcome::Failed(TransportError::retryable("503")));
        report.record(&op, OperationOutcome::Skipped(SkipReason::Blocked));
        report.record(&op, OperationOutcome::Conflict(Resolution::AcceptRemote));

        assert_eq!(
            (report.succeeded, report.failed, report.skipped, report.conflicts),
            (1, 1, 1, 1)
        );
        assert!(!report.is_clean());
        assert!(!report.is_empty());
        assert_eq!(report.outcomes_for(record.local_id).count(), 4);
    }
}
