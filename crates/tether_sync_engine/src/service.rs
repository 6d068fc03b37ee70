//! The sync service.
//!
//! A pass walks the operation queue in FIFO order and sends each operation
//! to the remote authority. Operations of one entity are strictly ordered:
//! once one of them is not acknowledged (failed, cooling down, in conflict),
//! the entity's later operations wait for the next pass.
//!
//! A pull fetches remote changes and deletions since the stored watermark
//! and merges them into the store, routing entities with local changes
//! through the [`ConflictResolver`]. A pulled entity whose create was never
//! acknowledged locally is matched to its record through
//! [`RemoteEntity::origin`].

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult, TransportError, TransportResult};
use crate::resolver::{ConflictResolver, Resolution};
use crate::state::{
    OperationOutcome, ServiceStatus, SkipReason, SyncReport, SyncState, SyncStats,
};
use crate::transport::{RemoteAck, RemoteTombstone, RemoteTransport};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_core::{
    Clock, EntityRecord, EntityStore, LocalId, Mutation, OperationQueue, OperationType,
    RemoteEntity, SyncOperation, SyncStatus, SystemClock,
};
use tracing::{debug, info, warn};

/// Synchronizes an entity store with a remote authority.
///
/// At most one pass runs at a time. [`sync`](Self::sync) returns an empty
/// report instead of waiting when a pass is already in flight, so an
/// operation is never sent twice concurrently.
pub struct SyncService<S, Q, T> {
    store: Arc<S>,
    queue: Arc<Q>,
    transport: Arc<T>,
    resolver: RwLock<ConflictResolver>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
    cancelled: AtomicBool,
    pass: tokio::sync::Mutex<()>,
}

impl<S, Q, T> SyncService<S, Q, T>
where
    S: EntityStore,
    Q: OperationQueue,
    T: RemoteTransport,
{
    /// Creates a service with default configuration, last-write-wins
    /// conflict resolution and the system clock.
    pub fn new(store: Arc<S>, queue: Arc<Q>, transport: Arc<T>) -> Self {
        Self {
            store,
            queue,
            transport,
            resolver: RwLock::new(ConflictResolver::new()),
            clock: Arc::new(SystemClock),
            config: SyncConfig::default(),
            state: RwLock::new(SyncState::Idle),
            stats: RwLock::new(SyncStats::default()),
            cancelled: AtomicBool::new(false),
            pass: tokio::sync::Mutex::new(()),
        }
    }

    /// Sets the configuration.
    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the conflict resolver.
    pub fn with_resolver(mut self, resolver: ConflictResolver) -> Self {
        *self.resolver.get_mut() = resolver;
        self
    }

    /// Sets the clock used for queue and retry timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the conflict resolver.
    pub fn set_resolver(&self, resolver: ConflictResolver) {
        *self.resolver.write() = resolver;
    }

    /// Returns the entity store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Returns the operation queue.
    pub fn queue(&self) -> &Arc<Q> {
        &self.queue
    }

    /// Returns the transport.
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Returns the clock.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Asks the running pass to stop after the operation in flight.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: SyncState) {
        *self.state.write() = state;
    }

    /// Runs one push pass over the queue.
    ///
    /// Returns the empty report if another pass is in flight.
    pub async fn sync(&self) -> SyncReport {
        let Ok(_pass) = self.pass.try_lock() else {
            debug!("sync pass already running");
            return SyncReport::default();
        };
        self.run_pass(false).await
    }

    /// Pulls remote changes, then runs a push pass.
    ///
    /// Returns the empty report if another pass is in flight.
    pub async fn sync_cycle(&self) -> SyncReport {
        let Ok(_pass) = self.pass.try_lock() else {
            debug!("sync pass already running");
            return SyncReport::default();
        };
        self.run_pass(true).await
    }

    /// Pushes the operations of one entity now, ignoring retry cooldowns.
    ///
    /// Waits for a running pass to finish first. Fails with the transport
    /// error of a failed attempt, or if the entity is left in conflict or
    /// failed state.
    pub async fn sync_entity(&self, local_id: LocalId) -> SyncResult<()> {
        let _pass = self.pass.lock().await;

        if self.store.get(local_id)?.is_none() && self.queue.for_entity(local_id)?.is_empty() {
            return Err(SyncError::EntityNotFound(local_id));
        }

        let started = Instant::now();
        self.cancelled.store(false, Ordering::SeqCst);
        self.set_state(SyncState::Syncing);

        let mut report = SyncReport::default();
        let result = self.push(&mut report, Some(local_id), true).await;
        if let Err(e) = &result {
            report.error = Some(e.to_string());
        }
        report.duration = started.elapsed();
        self.finish(&report);
        result?;

        if report.cancelled {
            return Err(SyncError::Cancelled);
        }
        let failure = report.outcomes.iter().find_map(|o| match &o.outcome {
            OperationOutcome::Failed(e) => Some(e.clone()),
            _ => None,
        });
        if let Some(error) = failure {
            return Err(error.into());
        }

        match self.store.get(local_id)?.map(|r| r.sync_status) {
            Some(SyncStatus::Conflict) => Err(SyncError::UnresolvedConflict(local_id)),
            Some(SyncStatus::SyncFailed) => Err(SyncError::RetriesExhausted(local_id)),
            _ => Ok(()),
        }
    }

    /// Fetches remote changes and deletions and merges them into the store.
    ///
    /// `since` overrides the stored watermark. Returns the number of
    /// changes and deletions applied.
    pub async fn pull(&self, since: Option<DateTime<Utc>>) -> SyncResult<usize> {
        let _pass = self.pass.lock().await;
        self.cancelled.store(false, Ordering::SeqCst);
        self.set_state(SyncState::Syncing);

        let result = self.pull_changes(since).await;
        match &result {
            Ok(applied) => {
                self.stats.write().entities_pulled += *applied as u64;
                self.set_state(SyncState::Idle);
            }
            Err(e) => {
                warn!(error = %e, "pull failed");
                self.stats.write().last_error = Some(e.to_string());
                self.set_state(SyncState::Error);
            }
        }
        result
    }

    /// Settles a conflict held for manual resolution.
    ///
    /// `NeedsManualResolution` leaves the entity untouched.
    pub fn resolve_conflict(&self, local_id: LocalId, resolution: Resolution) -> SyncResult<()> {
        let record = self
            .store
            .get(local_id)?
            .ok_or(SyncError::EntityNotFound(local_id))?;
        let remote = match (record.sync_status, record.conflict) {
            (SyncStatus::Conflict, Some(remote)) => remote,
            _ => return Err(SyncError::NotInConflict(local_id)),
        };
        if resolution == Resolution::NeedsManualResolution {
            return Ok(());
        }

        info!(%local_id, ?resolution, "conflict resolved manually");
        self.apply_resolution(local_id, &remote, &resolution)
    }

    /// Gives a failed entity a fresh retry budget.
    ///
    /// Resets exhausted and parked operations, re-creates the operation an
    /// entity needs if its queue was pruned, and moves the entity back to a
    /// pending state. Returns the number of operations reset or enqueued.
    pub fn retry_entity(&self, local_id: LocalId) -> SyncResult<usize> {
        let record = self
            .store
            .get(local_id)?
            .ok_or(SyncError::EntityNotFound(local_id))?;
        if record.sync_status == SyncStatus::Conflict {
            return Err(SyncError::UnresolvedConflict(local_id));
        }

        let ops = self.queue.for_entity(local_id)?;
        let mut requeued = 0;
        for (position, op) in ops.iter().enumerate() {
            let mut next = op.clone();
            if op.retry_count > 0 || op.parked {
                next.retry_count = 0;
                next.parked = false;
                next.last_attempt_at = None;
            }
            // An entity the remote never acknowledged has to start with a create.
            if position == 0 && record.remote_id.is_none() && op.op_type != OperationType::Create {
                next.op_type = OperationType::Create;
                next.payload = record.payload.clone();
            }
            if next != *op {
                self.queue.replace(next)?;
                requeued += 1;
            }
        }

        let mut deleting = ops.iter().any(|op| op.op_type == OperationType::Delete);
        if ops.is_empty() && record.sync_status != SyncStatus::Synced {
            deleting = record.sync_status == SyncStatus::PendingDelete;
            let op_type = if record.remote_id.is_none() {
                OperationType::Create
            } else if deleting {
                OperationType::Delete
            } else {
                OperationType::Update
            };
            self.queue
                .enqueue(SyncOperation::for_record(op_type, &record, self.clock.now()))?;
            requeued += 1;
        }
        if requeued == 0 {
            return Ok(0);
        }

        self.store.modify(local_id, &mut |rec| {
            let mut next = rec.clone();
            next.sync_status = if rec.remote_id.is_none() {
                SyncStatus::PendingCreate
            } else if deleting {
                SyncStatus::PendingDelete
            } else {
                SyncStatus::PendingUpdate
            };
            Mutation::Save(next)
        })?;
        info!(%local_id, requeued, "entity queued for retry");
        Ok(requeued)
    }

    /// Removes exhausted or parked operations older than `max_age`.
    pub fn prune_stale(&self, max_age: Duration) -> SyncResult<usize> {
        let pruned = self.prune_older_than(max_age)?;
        self.stats.write().operations_pruned += pruned as u64;
        Ok(pruned)
    }

    /// Returns the number of queued operations.
    pub fn pending_count(&self) -> SyncResult<usize> {
        Ok(self.queue.len()?)
    }

    /// Returns the sync status of one entity.
    pub fn entity_status(&self, local_id: LocalId) -> SyncResult<Option<SyncStatus>> {
        Ok(self.store.get(local_id)?.map(|r| r.sync_status))
    }

    /// Returns the entities that are failed or in conflict.
    pub fn entities_needing_attention(&self) -> SyncResult<Vec<EntityRecord>> {
        Ok(self
            .store
            .get_all()?
            .into_iter()
            .filter(|r| r.sync_status.needs_attention())
            .collect())
    }

    /// Returns a point-in-time summary.
    pub fn status(&self) -> SyncResult<ServiceStatus> {
        let mut failed_entities = 0;
        let mut conflicted_entities = 0;
        for record in self.store.get_all()? {
            match record.sync_status {
                SyncStatus::SyncFailed => failed_entities += 1,
                SyncStatus::Conflict => conflicted_entities += 1,
                _ => {}
            }
        }

        Ok(ServiceStatus {
            state: self.state(),
            pending_operations: self.queue.len()?,
            failed_entities,
            conflicted_entities,
            last_sync_at: self.stats.read().last_sync_at,
        })
    }

    async fn run_pass(&self, pull_first: bool) -> SyncReport {
        let started = Instant::now();
        self.cancelled.store(false, Ordering::SeqCst);
        self.set_state(SyncState::Syncing);

        let mut report = SyncReport::default();
        if let Err(e) = self.run_phases(pull_first, &mut report).await {
            warn!(error = %e, "sync pass aborted");
            report.error = Some(e.to_string());
        }
        report.duration = started.elapsed();
        self.finish(&report);
        report
    }

    async fn run_phases(&self, pull_first: bool, report: &mut SyncReport) -> SyncResult<()> {
        if pull_first {
            match self.pull_changes(None).await {
                Ok(applied) => report.pulled = applied,
                Err(SyncError::Transport(e)) => {
                    warn!(error = %e, "pull failed; pushing anyway");
                    report.error = Some(e.to_string());
                }
                Err(e) => return Err(e),
            }
        }

        self.push(report, None, false).await?;

        if let Some(age) = self.config.stale_operation_age {
            if !report.cancelled {
                report.pruned = self.prune_older_than(age)?;
            }
        }
        Ok(())
    }

    fn finish(&self, report: &SyncReport) {
        let last_error = report.error.clone().or_else(|| {
            report.outcomes.iter().find_map(|o| match &o.outcome {
                OperationOutcome::Failed(e) => Some(e.to_string()),
                _ => None,
            })
        });
        self.set_state(if last_error.is_some() {
            SyncState::Error
        } else {
            SyncState::Idle
        });

        {
            let mut stats = self.stats.write();
            stats.passes_completed += 1;
            stats.operations_pushed += report.succeeded as u64;
            stats.operations_failed += report.failed as u64;
            stats.conflicts_encountered += report.conflicts as u64;
            stats.entities_pulled += report.pulled as u64;
            stats.operations_pruned += report.pruned as u64;
            stats.last_sync_at = Some(self.clock.now());
            if last_error.is_some() {
                stats.last_error = last_error;
            }
        }

        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            conflicts = report.conflicts,
            pulled = report.pulled,
            pruned = report.pruned,
            cancelled = report.cancelled,
            "sync pass finished"
        );
    }

    /// Walks the queue once. `only` restricts the pass to one entity.
    async fn push(
        &self,
        report: &mut SyncReport,
        only: Option<LocalId>,
        ignore_cooldown: bool,
    ) -> SyncResult<()> {
        let max_retries = self.config.max_retries;
        let mut blocked: HashSet<LocalId> = HashSet::new();

        for queued in self.queue.pending()? {
            if only.map_or(false, |id| id != queued.entity_id) {
                continue;
            }
            if self.is_cancelled() {
                debug!("sync pass cancelled");
                report.cancelled = true;
                break;
            }
            if blocked.contains(&queued.entity_id) {
                if queued.is_retryable(max_retries) {
                    report.record(&queued, OperationOutcome::Skipped(SkipReason::Blocked));
                }
                continue;
            }

            // Earlier steps of this pass may have completed or replaced it.
            let Some(op) = self.queue.get(queued.id)? else {
                continue;
            };
            if !op.is_retryable(max_retries) {
                blocked.insert(op.entity_id);
                continue;
            }

            let Some(record) = self.store.get(op.entity_id)? else {
                self.queue.complete(op.id)?;
                report.record(&op, OperationOutcome::Skipped(SkipReason::EntityGone));
                continue;
            };
            if record.sync_status == SyncStatus::Conflict {
                blocked.insert(op.entity_id);
                report.record(&op, OperationOutcome::Skipped(SkipReason::InConflict));
                continue;
            }
            if !ignore_cooldown && self.cooling_down(&op) {
                blocked.insert(op.entity_id);
                report.record(&op, OperationOutcome::Skipped(SkipReason::CoolingDown));
                continue;
            }

            let outcome = self.dispatch(&op, &record).await?;
            if outcome != OperationOutcome::Succeeded {
                blocked.insert(op.entity_id);
            }
            report.record(&op, outcome);
        }
        Ok(())
    }

    fn cooling_down(&self, op: &SyncOperation) -> bool {
        let Some(last_attempt) = op.last_attempt_at else {
            return false;
        };
        if op.retry_count == 0 {
            return false;
        }

        let delay = self.config.retry.delay_for_retry(op.retry_count);
        let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(365));
        last_attempt
            .checked_add_signed(delay)
            .map_or(true, |ready_at| ready_at > self.clock.now())
    }

    async fn call<R, F>(&self, call: F) -> TransportResult<R>
    where
        F: Future<Output = TransportResult<R>>,
    {
        let limit = self.config.transport_timeout;
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::retryable(format!(
                "no response within {limit:?}"
            ))),
        }
    }

    async fn dispatch(
        &self,
        op: &SyncOperation,
        record: &EntityRecord,
    ) -> SyncResult<OperationOutcome> {
        let base = record.remote_updated_at.or(op.base_updated_at);
        let remote_id = match (op.op_type, &record.remote_id) {
            (OperationType::Create, _) => None,
            (_, Some(remote_id)) => Some(remote_id.clone()),
            // Waits for a create that is no longer queued; see `retry_entity`.
            (_, None) => return Ok(OperationOutcome::Skipped(SkipReason::Blocked)),
        };

        debug!(op = %op.id, kind = %op.op_type, entity = %op.entity_id, "sending operation");
        let result = match (op.op_type, remote_id) {
            (OperationType::Create, _) => self
                .call(self.transport.create(&op.entity_type, op.entity_id, &op.payload))
                .await
                .map(Some),
            (OperationType::Update, Some(remote_id)) => self
                .call(self.transport.update(&op.entity_type, &remote_id, &op.payload, base))
                .await
                .map(Some),
            (OperationType::Delete, Some(remote_id)) => {
                match self
                    .call(self.transport.delete(&op.entity_type, &remote_id, base))
                    .await
                {
                    // Already gone remotely counts as deleted.
                    Ok(()) | Err(TransportError::NotFound(_)) => Ok(None),
                    Err(e) => Err(e),
                }
            }
            (_, None) => return Ok(OperationOutcome::Skipped(SkipReason::Blocked)),
        };

        match result {
            Ok(ack) => {
                self.settle(op, ack).await?;
                Ok(OperationOutcome::Succeeded)
            }
            Err(TransportError::Conflict(remote)) => {
                let resolution = self.resolve_push_conflict(op, &remote)?;
                Ok(OperationOutcome::Conflict(resolution))
            }
            Err(error) => self.record_failure(op, error),
        }
    }

    /// Applies an acknowledgement to the record, then completes the operation.
    async fn settle(&self, op: &SyncOperation, ack: Option<RemoteAck>) -> SyncResult<()> {
        let Some(ack) = ack else {
            self.store.modify(op.entity_id, &mut |rec| {
                if rec.sync_status == SyncStatus::PendingDelete {
                    Mutation::Delete
                } else {
                    Mutation::Unchanged
                }
            })?;
            self.queue.complete(op.id)?;
            return Ok(());
        };

        let settled = self.store.modify(op.entity_id, &mut |rec| {
            let mut next = rec.clone();
            next.remote_id = Some(ack.remote_id.clone());
            next.remote_updated_at = Some(ack.updated_at);
            next.sync_status = settled_status(rec, op);
            Mutation::Save(next)
        })?;
        self.queue.complete(op.id)?;

        if settled.is_none() && op.op_type == OperationType::Create {
            // The record was removed while its create was in flight.
            warn!(entity = %op.entity_id, remote_id = %ack.remote_id, "removing orphaned remote entity");
            if let Err(e) = self
                .call(self.transport.delete(&op.entity_type, &ack.remote_id, Some(ack.updated_at)))
                .await
            {
                warn!(error = %e, remote_id = %ack.remote_id, "orphan cleanup failed");
            }
        }
        Ok(())
    }

    fn resolve_push_conflict(
        &self,
        op: &SyncOperation,
        remote: &RemoteEntity,
    ) -> SyncResult<Resolution> {
        let Some(local) = self.store.get(op.entity_id)? else {
            self.queue.complete(op.id)?;
            return Ok(Resolution::AcceptRemote);
        };

        let resolution = self.resolver.read().resolve(&local, remote);
        info!(op = %op.id, entity = %op.entity_id, ?resolution, "push conflict");
        self.apply_resolution(local.local_id, remote, &resolution)?;
        Ok(resolution)
    }

    fn record_failure(
        &self,
        op: &SyncOperation,
        error: TransportError,
    ) -> SyncResult<OperationOutcome> {
        let now = self.clock.now();
        let message = error.to_string();
        let updated = if error.is_permanent() {
            self.queue.park(op.id, &message, now)?
        } else {
            self.queue.mark_failed(op.id, &message, now)?
        };

        if updated.is_retryable(self.config.max_retries) {
            debug!(op = %op.id, retry_count = updated.retry_count, error = %message, "operation failed");
        } else {
            warn!(op = %op.id, entity = %op.entity_id, error = %message, "giving up on operation");
            self.store.modify(op.entity_id, &mut |rec| {
                if rec.sync_status == SyncStatus::Conflict {
                    return Mutation::Unchanged;
                }
                let mut next = rec.clone();
                next.sync_status = SyncStatus::SyncFailed;
                Mutation::Save(next)
            })?;
        }
        Ok(OperationOutcome::Failed(error))
    }

    /// Persists a conflict decision for the entity and rewrites its queue.
    fn apply_resolution(
        &self,
        local_id: LocalId,
        remote: &RemoteEntity,
        resolution: &Resolution,
    ) -> SyncResult<()> {
        if remote.deleted {
            return self.apply_deletion_resolution(local_id, remote, resolution);
        }

        let now = self.clock.now();
        match resolution {
            Resolution::AcceptRemote => {
                self.queue.remove_for_entity(local_id)?;
                self.store.modify(local_id, &mut |rec| {
                    let mut next = rec.clone();
                    next.adopt_remote(remote);
                    Mutation::Save(next)
                })?;
            }
            Resolution::KeepLocal | Resolution::Merge(_) => {
                let delete_queued = self
                    .queue
                    .for_entity(local_id)?
                    .iter()
                    .any(|op| op.op_type == OperationType::Delete);
                let merged = match resolution {
                    Resolution::Merge(payload) => Some(payload),
                    _ => None,
                };

                self.queue.remove_for_entity(local_id)?;
                let rebased = self.store.modify(local_id, &mut |rec| {
                    let deleting = delete_queued || rec.sync_status == SyncStatus::PendingDelete;
                    let mut next = rec.clone();
                    next.remote_id = Some(remote.remote_id.clone());
                    next.remote_updated_at = Some(remote.updated_at);
                    next.conflict = None;
                    if let (Some(payload), false) = (merged, deleting) {
                        next.payload = payload.clone();
                        next.version += 1;
                        next.local_updated_at = now;
                    }
                    next.sync_status = if deleting {
                        SyncStatus::PendingDelete
                    } else {
                        SyncStatus::PendingUpdate
                    };
                    Mutation::Save(next)
                })?;

                if let Some(record) = rebased {
                    let op_type = if record.sync_status == SyncStatus::PendingDelete {
                        OperationType::Delete
                    } else {
                        OperationType::Update
                    };
                    self.queue
                        .enqueue(SyncOperation::for_record(op_type, &record, now))?;
                }
            }
            Resolution::NeedsManualResolution => {
                self.store.modify(local_id, &mut |rec| {
                    let mut next = rec.clone();
                    next.sync_status = SyncStatus::Conflict;
                    next.conflict = Some(remote.clone());
                    Mutation::Save(next)
                })?;
            }
        }
        Ok(())
    }

    /// Persists a decision between local edits and a remote deletion.
    ///
    /// Keeping the local side re-creates the entity under a new remote id.
    fn apply_deletion_resolution(
        &self,
        local_id: LocalId,
        tombstone: &RemoteEntity,
        resolution: &Resolution,
    ) -> SyncResult<()> {
        let now = self.clock.now();
        match resolution {
            Resolution::AcceptRemote => {
                self.store.delete(local_id)?;
                self.queue.remove_for_entity(local_id)?;
                debug!(entity = %local_id, "applied remote deletion");
            }
            Resolution::KeepLocal | Resolution::Merge(_) => {
                let merged = match resolution {
                    Resolution::Merge(payload) => Some(payload),
                    _ => None,
                };

                self.queue.remove_for_entity(local_id)?;
                let recreated = self.store.modify(local_id, &mut |rec| {
                    if rec.sync_status == SyncStatus::PendingDelete {
                        return Mutation::Delete;
                    }
                    let mut next = rec.clone();
                    if let Some(payload) = merged {
                        next.payload = payload.clone();
                    }
                    next.remote_id = None;
                    next.remote_updated_at = None;
                    next.conflict = None;
                    next.sync_status = SyncStatus::PendingCreate;
                    next.version += 1;
                    next.local_updated_at = now;
                    Mutation::Save(next)
                })?;
                if let Some(record) = recreated {
                    self.queue
                        .enqueue(SyncOperation::for_record(OperationType::Create, &record, now))?;
                    info!(entity = %local_id, "remote deletion overridden by local edits");
                }
            }
            Resolution::NeedsManualResolution => {
                self.store.modify(local_id, &mut |rec| {
                    let mut next = rec.clone();
                    next.sync_status = SyncStatus::Conflict;
                    next.conflict = Some(tombstone.clone());
                    Mutation::Save(next)
                })?;
            }
        }
        Ok(())
    }

    async fn pull_changes(&self, since: Option<DateTime<Utc>>) -> SyncResult<usize> {
        let stored = self.store.watermark()?;
        let since = since.or(stored);

        let changes = self.call(self.transport.get_changes_since(since)).await?;
        let deletions = self.call(self.transport.get_deleted_since(since)).await?;
        debug!(changes = changes.len(), deletions = deletions.len(), ?since, "pulled");

        let mut high_water = since;
        let mut applied = 0;
        for remote in &changes {
            if self.is_cancelled() {
                return Ok(applied);
            }
            if self.apply_remote_change(remote)? {
                applied += 1;
            }
            high_water = high_water.max(Some(remote.updated_at));
        }
        for tombstone in &deletions {
            if self.is_cancelled() {
                return Ok(applied);
            }
            if self.apply_remote_deletion(tombstone)? {
                applied += 1;
            }
            high_water = high_water.max(Some(tombstone.deleted_at));
        }

        if let Some(mark) = high_water {
            if Some(mark) > stored {
                self.store.set_watermark(mark)?;
            }
        }
        Ok(applied)
    }

    /// Merges one remote version. Returns false if it was already known.
    fn apply_remote_change(&self, remote: &RemoteEntity) -> SyncResult<bool> {
        let Some(local) = self
            .store
            .get_by_remote_id(&remote.entity_type, &remote.remote_id)?
        else {
            if !self.claim_created(remote)? {
                self.store.save(EntityRecord::from_remote(remote))?;
            }
            return Ok(true);
        };
        if local
            .remote_updated_at
            .map_or(false, |seen| remote.updated_at <= seen)
        {
            return Ok(false);
        }

        match local.sync_status {
            SyncStatus::Synced => {
                // A local write racing the pull is caught by the push conflict check.
                self.store.modify(local.local_id, &mut |rec| {
                    if rec.sync_status != SyncStatus::Synced {
                        return Mutation::Unchanged;
                    }
                    let mut next = rec.clone();
                    next.adopt_remote(remote);
                    Mutation::Save(next)
                })?;
            }
            SyncStatus::Conflict => {
                self.store.modify(local.local_id, &mut |rec| {
                    let mut next = rec.clone();
                    next.conflict = Some(remote.clone());
                    Mutation::Save(next)
                })?;
            }
            _ => {
                let resolution = self.resolver.read().resolve(&local, remote);
                info!(entity = %local.local_id, ?resolution, "pull conflict");
                self.stats.write().conflicts_encountered += 1;
                self.apply_resolution(local.local_id, remote, &resolution)?;
            }
        }
        Ok(true)
    }

    /// Links a pulled entity to the local record whose create it came from.
    ///
    /// The remote committed the create but the acknowledgement never
    /// arrived, so the record still waits for its create. Returns false if
    /// no such record exists.
    fn claim_created(&self, remote: &RemoteEntity) -> SyncResult<bool> {
        let Some(origin) = remote.origin else {
            return Ok(false);
        };
        let waiting = |rec: &EntityRecord| {
            rec.entity_type == remote.entity_type
                && rec.remote_id.is_none()
                && matches!(
                    rec.sync_status,
                    SyncStatus::PendingCreate | SyncStatus::SyncFailed
                )
        };
        if !self.store.get(origin)?.map_or(false, |rec| waiting(&rec)) {
            return Ok(false);
        }

        let later_ops = self
            .queue
            .for_entity(origin)?
            .iter()
            .any(|op| op.op_type != OperationType::Create);
        let claimed = self.store.modify(origin, &mut |rec| {
            if !waiting(rec) {
                return Mutation::Unchanged;
            }
            let mut next = rec.clone();
            next.remote_id = Some(remote.remote_id.clone());
            next.remote_updated_at = Some(remote.updated_at);
            next.sync_status = if later_ops {
                SyncStatus::PendingUpdate
            } else {
                SyncStatus::Synced
            };
            Mutation::Save(next)
        })?;
        if claimed.map_or(true, |rec| rec.remote_id.as_ref() != Some(&remote.remote_id)) {
            return Ok(false);
        }

        // The remote already holds the create.
        for op in self.queue.for_entity(origin)? {
            if op.op_type == OperationType::Create {
                self.queue.complete(op.id)?;
            }
        }
        info!(entity = %origin, remote_id = %remote.remote_id, "claimed unacknowledged create");
        Ok(true)
    }

    /// Applies one remote deletion. Returns false for unknown entities.
    fn apply_remote_deletion(&self, tombstone: &RemoteTombstone) -> SyncResult<bool> {
        let Some(local) = self
            .store
            .get_by_remote_id(&tombstone.entity_type, &tombstone.remote_id)?
        else {
            return Ok(false);
        };
        let remote = tombstone.to_remote();

        match local.sync_status {
            SyncStatus::Synced | SyncStatus::PendingDelete => {
                self.store.delete(local.local_id)?;
                self.queue.remove_for_entity(local.local_id)?;
                debug!(entity = %local.local_id, "applied remote deletion");
            }
            SyncStatus::Conflict => {
                self.store.modify(local.local_id, &mut |rec| {
                    let mut next = rec.clone();
                    next.conflict = Some(remote.clone());
                    Mutation::Save(next)
                })?;
            }
            _ => {
                let resolution = self.resolver.read().resolve_deletion(&local, &remote);
                info!(entity = %local.local_id, ?resolution, "remote deletion of edited entity");
                self.stats.write().conflicts_encountered += 1;
                self.apply_resolution(local.local_id, &remote, &resolution)?;
            }
        }
        Ok(true)
    }

    fn prune_older_than(&self, max_age: Duration) -> SyncResult<usize> {
        let max_age = chrono::Duration::from_std(max_age)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let pruned = self
            .queue
            .prune_stale(max_age, self.config.max_retries, self.clock.now())?;
        if pruned > 0 {
            info!(pruned, "pruned stale operations");
        }
        Ok(pruned)
    }
}

/// Status of a record after the remote acknowledged `op`.
fn settled_status(record: &EntityRecord, op: &SyncOperation) -> SyncStatus {
    match record.sync_status {
        SyncStatus::Conflict | SyncStatus::PendingDelete => record.sync_status,
        _ if record.version == op.entity_version => SyncStatus::Synced,
        SyncStatus::PendingCreate | SyncStatus::Synced => SyncStatus::PendingUpdate,
        other => other,
    }
}
