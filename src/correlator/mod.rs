//! # Response Correlator
//!
//! Matches responses arriving from outside the process (remote workers,
//! external systems, child invocations) with the suspended invocations
//! waiting for them.
//!
//! Every correlation id owns exactly one slot. A slot moves from `Pending`
//! to `Resolved` under the map's per-key lock, so whichever of response,
//! expiry or cancellation gets there first wins and every other contender
//! sees the tombstone and is discarded. A resolved wait is handed to the
//! orchestrator once, as a [`Resumption`] on the channel returned by
//! [`ResponseCorrelator::new`].
//!
//! Responses can overtake registration (an asynchronous executable may get
//! its reply before `execute_async` even returns). Such early responses are
//! parked for `early_response_grace_ms` and consumed by the matching
//! registration.

pub mod aggregate;
pub mod pending_wait;

pub use aggregate::{AggregateProgress, AggregateState, ChildrenAggregate};
pub use pending_wait::{PendingWait, Resolution, Resumption, WaitKind, WaitOutcome};

use crate::config::CorrelatorConfig;
use crate::error::{AggregationError, CorrelationError};
use crate::events::{EventPublisher, OrchestrationEvent};
use crate::store::WaitStore;
use crate::types::{ChildId, CorrelationId, ResponseData, StepResponse};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Why a response was dropped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscardReason {
    Correlation(CorrelationError),
    Aggregation(AggregationError),
}

impl std::fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Correlation(error) => write!(f, "{error}"),
            Self::Aggregation(error) => write!(f, "{error}"),
        }
    }
}

/// What happened to an incoming response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorrelationOutcome {
    /// The wait was resolved and handed to the orchestrator
    Delivered,
    /// Child response recorded; the aggregate is still waiting on siblings
    Recorded { received: usize, expected: usize },
    /// No wait registered yet; held for the early-response grace period
    Parked,
    Discarded(DiscardReason),
}

impl CorrelationOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }

    pub fn is_discarded(&self) -> bool {
        matches!(self, Self::Discarded(_))
    }
}

/// A wait removed by [`ResponseCorrelator::cancel`]
#[derive(Debug, Clone)]
pub struct CancelledWait {
    pub wait: PendingWait,
    /// Children of a cancelled aggregate that had not reported yet
    pub outstanding_children: Vec<ChildId>,
}

#[derive(Debug)]
struct WaitEntry {
    wait: PendingWait,
    timer: Option<AbortHandle>,
}

#[derive(Debug)]
enum Slot {
    Pending(Box<WaitEntry>),
    Resolved { resolution: Resolution, at: Instant },
    Parked { data: ResponseData, at: Instant },
}

impl Slot {
    fn resolved(resolution: Resolution) -> Self {
        Self::Resolved {
            resolution,
            at: Instant::now(),
        }
    }
}

enum Claim {
    Won(Box<WaitEntry>),
    AlreadyResolved(Resolution),
    Parked,
    Missing,
}

/// Swap a pending slot for a tombstone. Non-pending slots are left as found.
fn claim_slot(slot: &mut Slot, resolution: Resolution) -> Claim {
    match std::mem::replace(slot, Slot::resolved(resolution)) {
        Slot::Pending(entry) => Claim::Won(entry),
        previous => {
            let claim = match &previous {
                Slot::Resolved { resolution, .. } => Claim::AlreadyResolved(*resolution),
                _ => Claim::Parked,
            };
            *slot = previous;
            claim
        }
    }
}

/// Registry of pending waits and children aggregates
pub struct ResponseCorrelator {
    config: CorrelatorConfig,
    slots: DashMap<CorrelationId, Slot>,
    aggregates: DashMap<CorrelationId, ChildrenAggregate>,
    child_index: DashMap<ChildId, CorrelationId>,
    store: Arc<dyn WaitStore>,
    events: EventPublisher,
    resumptions: mpsc::UnboundedSender<Resumption>,
    me: Weak<ResponseCorrelator>,
}

impl ResponseCorrelator {
    pub fn new(
        config: CorrelatorConfig,
        store: Arc<dyn WaitStore>,
        events: EventPublisher,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Resumption>) {
        let (resumptions, receiver) = mpsc::unbounded_channel();
        let correlator = Arc::new_cyclic(|me| Self {
            config,
            slots: DashMap::new(),
            aggregates: DashMap::new(),
            child_index: DashMap::new(),
            store,
            events,
            resumptions,
            me: me.clone(),
        });
        (correlator, receiver)
    }

    pub fn config(&self) -> &CorrelatorConfig {
        &self.config
    }

    /// Register a wait for a single correlated response.
    ///
    /// A response parked under the same id is consumed immediately and the
    /// wait resolves without ever becoming pending.
    pub async fn register_wait(&self, wait: PendingWait) -> Result<(), CorrelationError> {
        let correlation_id = wait.correlation_id;
        self.ensure_vacant(correlation_id)?;

        // Persist first so that a resolution racing this registration always
        // removes the stored record after it was written.
        if let Err(e) = self.store.save_wait(&wait).await {
            warn!(correlation_id = %correlation_id, error = %e, "Failed to persist pending wait");
        }

        let parked = match self.slots.entry(correlation_id) {
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::Pending(Box::new(WaitEntry {
                    wait: wait.clone(),
                    timer: None,
                })));
                None
            }
            Entry::Occupied(mut occupied)
                if matches!(occupied.get(), Slot::Parked { .. })
                    && !matches!(wait.kind, WaitKind::Children) =>
            {
                match std::mem::replace(occupied.get_mut(), Slot::resolved(Resolution::Responded))
                {
                    Slot::Parked { data, .. } => Some(data),
                    _ => None,
                }
            }
            Entry::Occupied(_) => {
                return Err(CorrelationError::DuplicateWait { correlation_id });
            }
        };

        match parked {
            Some(data) => {
                debug!(correlation_id = %correlation_id, "Consuming early response parked before registration");
                self.forget_stored_wait(correlation_id).await;
                self.deliver(Resumption {
                    wait,
                    outcome: WaitOutcome::Response(data),
                });
            }
            None => {
                debug!(
                    correlation_id = %correlation_id,
                    runtime_id = %wait.runtime_id,
                    expires_at = ?wait.expires_at,
                    "Registered pending wait"
                );
                self.arm_timer(&wait);
            }
        }
        Ok(())
    }

    /// Register a children aggregate together with its wait.
    ///
    /// The aggregate is keyed by the wait's correlation id. Children must not
    /// be launched before this returns.
    pub async fn register_children(
        &self,
        wait: PendingWait,
        children: Vec<(ChildId, String)>,
        cancel_siblings_on_failure: bool,
    ) -> Result<(), CorrelationError> {
        let aggregate_id = wait.correlation_id;
        self.ensure_vacant(aggregate_id)?;

        let aggregate = ChildrenAggregate::new(
            aggregate_id,
            wait.runtime_id,
            children,
            cancel_siblings_on_failure,
        );
        for child_id in aggregate.expected.keys() {
            self.child_index.insert(*child_id, aggregate_id);
        }
        if let Err(e) = self.store.save_aggregate(&aggregate).await {
            warn!(aggregate_id = %aggregate_id, error = %e, "Failed to persist children aggregate");
        }
        let expected = aggregate.expected_count();
        self.aggregates.insert(aggregate_id, aggregate.clone());

        if let Err(e) = self.register_wait(wait).await {
            self.drop_aggregate(aggregate_id);
            if let Err(e) = self.store.remove_aggregate(aggregate_id).await {
                warn!(aggregate_id = %aggregate_id, error = %e, "Failed to remove children aggregate");
            }
            return Err(e);
        }

        debug!(aggregate_id = %aggregate_id, expected, "Registered children aggregate");
        Ok(())
    }

    /// Deliver a response for a correlation id
    pub async fn on_response(
        &self,
        correlation_id: CorrelationId,
        data: ResponseData,
    ) -> CorrelationOutcome {
        let claim = match self.slots.entry(correlation_id) {
            Entry::Vacant(vacant) => {
                if self.config.early_response_grace_ms == 0 {
                    Claim::Missing
                } else {
                    vacant.insert(Slot::Parked {
                        data,
                        at: Instant::now(),
                    });
                    debug!(correlation_id = %correlation_id, "Parked response for unregistered correlation id");
                    return CorrelationOutcome::Parked;
                }
            }
            Entry::Occupied(mut occupied) => {
                // Aggregates resolve only through child responses
                let awaits_children = matches!(
                    occupied.get(),
                    Slot::Pending(entry) if matches!(entry.wait.kind, WaitKind::Children)
                );
                if awaits_children {
                    Claim::Missing
                } else {
                    claim_slot(occupied.get_mut(), Resolution::Responded)
                }
            }
        };

        match claim {
            Claim::Won(entry) => {
                if let Some(timer) = &entry.timer {
                    timer.abort();
                }
                self.forget_stored_wait(correlation_id).await;
                debug!(
                    correlation_id = %correlation_id,
                    runtime_id = %entry.wait.runtime_id,
                    status = %data.status,
                    "Resolved pending wait with response"
                );
                self.deliver(Resumption {
                    wait: entry.wait,
                    outcome: WaitOutcome::Response(data),
                });
                CorrelationOutcome::Delivered
            }
            Claim::AlreadyResolved(resolution) => {
                self.discard_correlation(CorrelationError::DuplicateResponse {
                    correlation_id,
                    resolution: resolution.to_string(),
                })
            }
            Claim::Parked => self.discard_correlation(CorrelationError::DuplicateResponse {
                correlation_id,
                resolution: "parked".to_string(),
            }),
            Claim::Missing => {
                self.discard_correlation(CorrelationError::UnknownCorrelation { correlation_id })
            }
        }
    }

    /// Deliver the terminal response of a child invocation
    pub async fn on_child_response(
        &self,
        child_id: ChildId,
        response: StepResponse,
    ) -> CorrelationOutcome {
        let Some(aggregate_id) = self.child_index.get(&child_id).map(|entry| *entry.value())
        else {
            return self.discard_aggregation(None, AggregationError::UnknownChild { child_id });
        };

        let (progress, snapshot) = {
            let Some(mut aggregate) = self.aggregates.get_mut(&aggregate_id) else {
                return self.discard_aggregation(
                    Some(aggregate_id),
                    AggregationError::UnknownChild { child_id },
                );
            };
            let progress = aggregate.record(child_id, response);
            (progress, aggregate.clone())
        };

        match progress {
            Err(e) => self.discard_aggregation(Some(aggregate_id), e),
            Ok(AggregateProgress::Pending { received, expected }) => {
                if let Err(e) = self.store.save_aggregate(&snapshot).await {
                    warn!(aggregate_id = %aggregate_id, error = %e, "Failed to persist children aggregate");
                }
                debug!(aggregate_id = %aggregate_id, child_id = %child_id, received, expected, "Recorded child response");
                CorrelationOutcome::Recorded { received, expected }
            }
            Ok(AggregateProgress::Complete {
                responses,
                cancelled,
            }) => match self.claim(aggregate_id, Resolution::Responded) {
                Claim::Won(entry) => {
                    if let Some(timer) = &entry.timer {
                        timer.abort();
                    }
                    self.forget_stored_wait(aggregate_id).await;
                    self.forget_stored_aggregate(aggregate_id).await;
                    info!(
                        aggregate_id = %aggregate_id,
                        runtime_id = %entry.wait.runtime_id,
                        children = responses.len(),
                        cancelled = cancelled.len(),
                        "Children aggregate complete"
                    );
                    self.deliver(Resumption {
                        wait: entry.wait,
                        outcome: WaitOutcome::ChildrenCompleted {
                            responses,
                            cancelled,
                        },
                    });
                    CorrelationOutcome::Delivered
                }
                _ => self.discard_aggregation(
                    Some(aggregate_id),
                    AggregationError::AggregateClosed {
                        aggregate_id,
                        child_id,
                    },
                ),
            },
        }
    }

    /// Expire a wait whose deadline passed.
    ///
    /// Resolves with a synthetic ERRORED timeout payload. A wait that was
    /// already resolved is left alone.
    pub async fn on_expiry(&self, correlation_id: CorrelationId) -> CorrelationOutcome {
        self.expire(correlation_id, true).await
    }

    async fn expire(&self, correlation_id: CorrelationId, abort_timer: bool) -> CorrelationOutcome {
        let entry = match self.claim(correlation_id, Resolution::Expired) {
            Claim::Won(entry) => entry,
            Claim::AlreadyResolved(resolution) => {
                debug!(correlation_id = %correlation_id, %resolution, "Expiry lost to earlier resolution");
                return CorrelationOutcome::Discarded(DiscardReason::Correlation(
                    CorrelationError::DuplicateResponse {
                        correlation_id,
                        resolution: resolution.to_string(),
                    },
                ));
            }
            Claim::Parked | Claim::Missing => {
                return CorrelationOutcome::Discarded(DiscardReason::Correlation(
                    CorrelationError::UnknownCorrelation { correlation_id },
                ));
            }
        };
        if abort_timer {
            if let Some(timer) = &entry.timer {
                timer.abort();
            }
        }

        self.forget_stored_wait(correlation_id).await;
        if matches!(entry.wait.kind, WaitKind::Children) {
            self.close_aggregate(correlation_id, AggregateState::Expired);
            self.forget_stored_aggregate(correlation_id).await;
        }

        let wait = entry.wait;
        warn!(
            correlation_id = %correlation_id,
            runtime_id = %wait.runtime_id,
            step_type = %wait.step_type,
            mode = %wait.mode,
            "Pending wait expired"
        );
        self.events.publish(OrchestrationEvent::WaitExpired {
            runtime_id: wait.runtime_id,
            correlation_id,
        });
        let message = match wait.expires_at {
            Some(deadline) => format!("no response for {correlation_id} before {deadline}"),
            None => format!("no response for {correlation_id}"),
        };
        self.deliver(Resumption {
            wait,
            outcome: WaitOutcome::Expired(ResponseData::timed_out(message)),
        });
        CorrelationOutcome::Delivered
    }

    /// Remove a pending wait without resolving it through the orchestrator.
    ///
    /// Returns `None` when the id is unknown or already resolved.
    pub async fn cancel(&self, correlation_id: CorrelationId) -> Option<CancelledWait> {
        let Claim::Won(entry) = self.claim(correlation_id, Resolution::Cancelled) else {
            return None;
        };
        if let Some(timer) = &entry.timer {
            timer.abort();
        }
        self.forget_stored_wait(correlation_id).await;

        let outstanding_children = if matches!(entry.wait.kind, WaitKind::Children) {
            let outstanding = self.close_aggregate(correlation_id, AggregateState::Cancelled);
            self.forget_stored_aggregate(correlation_id).await;
            outstanding
        } else {
            Vec::new()
        };

        info!(
            correlation_id = %correlation_id,
            runtime_id = %entry.wait.runtime_id,
            outstanding_children = outstanding_children.len(),
            "Cancelled pending wait"
        );
        Some(CancelledWait {
            wait: entry.wait,
            outstanding_children,
        })
    }

    /// Expire every pending wait whose deadline has passed.
    ///
    /// Timers normally do this; the sweep covers waits restored from a store
    /// and hosts that drive expiry themselves.
    pub async fn expire_overdue(&self) -> usize {
        let now = Utc::now();
        let overdue: Vec<CorrelationId> = self
            .slots
            .iter()
            .filter_map(|slot| match slot.value() {
                Slot::Pending(entry) if entry.wait.is_overdue(now) => Some(*slot.key()),
                _ => None,
            })
            .collect();

        let mut expired = 0;
        for correlation_id in overdue {
            if self.on_expiry(correlation_id).await.is_delivered() {
                expired += 1;
            }
        }
        expired
    }

    /// Drop tombstones past retention and parked responses past the grace
    /// period. Returns the number of slots removed.
    pub fn prune_tombstones(&self) -> usize {
        let now = Instant::now();
        let retention = self.config.tombstone_retention();
        let grace = self.config.early_response_grace();

        let mut pruned_tombstones = Vec::new();
        let mut pruned_parked = Vec::new();
        self.slots.retain(|correlation_id, slot| match slot {
            Slot::Resolved { at, .. } if now.saturating_duration_since(*at) >= retention => {
                pruned_tombstones.push(*correlation_id);
                false
            }
            Slot::Parked { at, .. } if now.saturating_duration_since(*at) >= grace => {
                pruned_parked.push(*correlation_id);
                false
            }
            _ => true,
        });

        for aggregate_id in &pruned_tombstones {
            self.drop_aggregate(*aggregate_id);
        }
        for correlation_id in &pruned_parked {
            self.discard_correlation(CorrelationError::UnknownCorrelation {
                correlation_id: *correlation_id,
            });
        }

        let pruned = pruned_tombstones.len() + pruned_parked.len();
        if pruned > 0 {
            debug!(
                tombstones = pruned_tombstones.len(),
                parked = pruned_parked.len(),
                "Pruned correlation slots"
            );
        }
        pruned
    }

    /// Re-install waits and aggregates loaded from a store.
    ///
    /// Deadlines are absolute, so waits that expired while the process was
    /// down fire as soon as the runtime schedules their timers.
    pub fn restore(
        &self,
        waits: Vec<PendingWait>,
        aggregates: Vec<ChildrenAggregate>,
    ) -> usize {
        for aggregate in aggregates.into_iter().filter(ChildrenAggregate::is_open) {
            for child_id in aggregate.expected.keys() {
                self.child_index.insert(*child_id, aggregate.aggregate_id);
            }
            self.aggregates.insert(aggregate.aggregate_id, aggregate);
        }

        let mut restored = 0;
        for wait in waits {
            let correlation_id = wait.correlation_id;
            let inserted = match self.slots.entry(correlation_id) {
                Entry::Vacant(vacant) => {
                    vacant.insert(Slot::Pending(Box::new(WaitEntry {
                        wait: wait.clone(),
                        timer: None,
                    })));
                    true
                }
                Entry::Occupied(_) => false,
            };
            if inserted {
                self.arm_timer(&wait);
                restored += 1;
            } else {
                warn!(correlation_id = %correlation_id, "Skipping restored wait for an id already in use");
            }
        }
        info!(restored, "Restored pending waits");
        restored
    }

    pub fn pending_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot.value(), Slot::Pending(_)))
            .count()
    }

    pub fn is_pending(&self, correlation_id: &CorrelationId) -> bool {
        self.slots
            .get(correlation_id)
            .is_some_and(|slot| matches!(slot.value(), Slot::Pending(_)))
    }

    /// Terminal marker of a resolved id, while retained
    pub fn resolution(&self, correlation_id: &CorrelationId) -> Option<Resolution> {
        self.slots
            .get(correlation_id)
            .and_then(|slot| match slot.value() {
                Slot::Resolved { resolution, .. } => Some(*resolution),
                _ => None,
            })
    }

    pub fn pending_wait(&self, correlation_id: &CorrelationId) -> Option<PendingWait> {
        self.slots
            .get(correlation_id)
            .and_then(|slot| match slot.value() {
                Slot::Pending(entry) => Some(entry.wait.clone()),
                _ => None,
            })
    }

    pub fn aggregate_snapshot(&self, aggregate_id: &CorrelationId) -> Option<ChildrenAggregate> {
        self.aggregates
            .get(aggregate_id)
            .map(|aggregate| aggregate.clone())
    }

    fn ensure_vacant(&self, correlation_id: CorrelationId) -> Result<(), CorrelationError> {
        match self.slots.get(&correlation_id).as_deref() {
            Some(Slot::Pending(_)) | Some(Slot::Resolved { .. }) => {
                Err(CorrelationError::DuplicateWait { correlation_id })
            }
            _ => Ok(()),
        }
    }

    fn claim(&self, correlation_id: CorrelationId, resolution: Resolution) -> Claim {
        match self.slots.get_mut(&correlation_id) {
            Some(mut slot) => claim_slot(slot.value_mut(), resolution),
            None => Claim::Missing,
        }
    }

    fn arm_timer(&self, wait: &PendingWait) {
        let Some(remaining) = wait.remaining(Utc::now()) else {
            return;
        };
        let correlation_id = wait.correlation_id;
        let me = self.me.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            if let Some(correlator) = me.upgrade() {
                // Not aborting ourselves: the expiry below awaits the store.
                correlator.expire(correlation_id, false).await;
            }
        })
        .abort_handle();

        if let Some(mut slot) = self.slots.get_mut(&correlation_id) {
            if let Slot::Pending(entry) = slot.value_mut() {
                entry.timer = Some(timer);
                return;
            }
        }
        timer.abort();
    }

    /// Close an aggregate and report its children that never responded
    fn close_aggregate(&self, aggregate_id: CorrelationId, state: AggregateState) -> Vec<ChildId> {
        match self.aggregates.get_mut(&aggregate_id) {
            Some(mut aggregate) => {
                let outstanding = aggregate.outstanding();
                aggregate.close(state);
                outstanding
            }
            None => Vec::new(),
        }
    }

    fn drop_aggregate(&self, aggregate_id: CorrelationId) {
        if let Some((_, aggregate)) = self.aggregates.remove(&aggregate_id) {
            for child_id in aggregate.expected.keys() {
                self.child_index.remove(child_id);
            }
        }
    }

    fn deliver(&self, resumption: Resumption) {
        let correlation_id = resumption.wait.correlation_id;
        if self.resumptions.send(resumption).is_err() {
            warn!(correlation_id = %correlation_id, "Resumption receiver dropped; resolved wait not resumed");
        }
    }

    async fn forget_stored_wait(&self, correlation_id: CorrelationId) {
        if let Err(e) = self.store.remove_wait(correlation_id).await {
            warn!(correlation_id = %correlation_id, error = %e, "Failed to remove stored wait");
        }
    }

    async fn forget_stored_aggregate(&self, aggregate_id: CorrelationId) {
        if let Err(e) = self.store.remove_aggregate(aggregate_id).await {
            warn!(aggregate_id = %aggregate_id, error = %e, "Failed to remove stored aggregate");
        }
    }

    fn discard_correlation(&self, error: CorrelationError) -> CorrelationOutcome {
        let correlation_id = match &error {
            CorrelationError::DuplicateWait { correlation_id }
            | CorrelationError::DuplicateResponse { correlation_id, .. }
            | CorrelationError::UnknownCorrelation { correlation_id } => *correlation_id,
        };
        warn!(correlation_id = %correlation_id, reason = %error, "Discarding response");
        self.events.publish(OrchestrationEvent::ResponseDiscarded {
            correlation_id: Some(correlation_id),
            reason: error.to_string(),
        });
        CorrelationOutcome::Discarded(DiscardReason::Correlation(error))
    }

    fn discard_aggregation(
        &self,
        aggregate_id: Option<CorrelationId>,
        error: AggregationError,
    ) -> CorrelationOutcome {
        warn!(aggregate_id = ?aggregate_id, reason = %error, "Discarding child response");
        self.events.publish(OrchestrationEvent::ResponseDiscarded {
            correlation_id: aggregate_id,
            reason: error.to_string(),
        });
        CorrelationOutcome::Discarded(DiscardReason::Aggregation(error))
    }
}

impl std::fmt::Debug for ResponseCorrelator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCorrelator")
            .field("slots", &self.slots.len())
            .field("aggregates", &self.aggregates.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ambiance::{Ambiance, Level};
    use crate::store::InMemoryWaitStore;
    use crate::types::{ExecutionMode, FailureKind, StepInputs, StepStatus};
    use serde_json::json;
    use std::time::Duration;
    use uuid::Uuid;

    fn correlator(
        config: CorrelatorConfig,
    ) -> (
        Arc<ResponseCorrelator>,
        mpsc::UnboundedReceiver<Resumption>,
        Arc<InMemoryWaitStore>,
    ) {
        let store = Arc::new(InMemoryWaitStore::new());
        let (correlator, receiver) =
            ResponseCorrelator::new(config, store.clone(), EventPublisher::new(64));
        (correlator, receiver, store)
    }

    fn wait(kind: WaitKind, timeout: Option<Duration>) -> PendingWait {
        let level = Level::step("fetch", "http");
        PendingWait::new(
            CorrelationId::new(),
            level.runtime_id,
            Ambiance::new(Uuid::new_v4(), "plan").with_level(level),
            "http".into(),
            ExecutionMode::Async,
            json!({}),
            StepInputs::new(),
            kind,
        )
        .with_timeout(timeout)
    }

    #[tokio::test]
    async fn test_response_resolves_wait_exactly_once() {
        let (correlator, mut resumptions, store) = correlator(CorrelatorConfig::default());
        let wait = wait(WaitKind::Response, Some(Duration::from_secs(60)));
        let id = wait.correlation_id;

        correlator.register_wait(wait).await.unwrap();
        assert!(correlator.is_pending(&id));
        assert!(store.contains_wait(&id));

        let first = correlator
            .on_response(id, ResponseData::success(json!("ok")))
            .await;
        let second = correlator
            .on_response(id, ResponseData::success(json!("again")))
            .await;

        assert_eq!(first, CorrelationOutcome::Delivered);
        assert!(matches!(
            second,
            CorrelationOutcome::Discarded(DiscardReason::Correlation(
                CorrelationError::DuplicateResponse { .. }
            ))
        ));
        assert_eq!(correlator.resolution(&id), Some(Resolution::Responded));
        assert!(!store.contains_wait(&id));

        let resumption = resumptions.recv().await.unwrap();
        assert_eq!(
            resumption.outcome,
            WaitOutcome::Response(ResponseData::success(json!("ok")))
        );
        assert!(resumptions.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let (correlator, _resumptions, _store) = correlator(CorrelatorConfig::default());
        let wait = wait(WaitKind::Response, None);

        correlator.register_wait(wait.clone()).await.unwrap();
        assert_eq!(
            correlator.register_wait(wait.clone()).await,
            Err(CorrelationError::DuplicateWait {
                correlation_id: wait.correlation_id
            })
        );
    }

    #[tokio::test]
    async fn test_early_response_is_parked_then_consumed() {
        let (correlator, mut resumptions, store) = correlator(CorrelatorConfig::default());
        let wait = wait(WaitKind::Response, Some(Duration::from_secs(60)));
        let id = wait.correlation_id;

        let outcome = correlator
            .on_response(id, ResponseData::success(json!(1)))
            .await;
        assert_eq!(outcome, CorrelationOutcome::Parked);

        correlator.register_wait(wait).await.unwrap();
        assert!(!correlator.is_pending(&id));
        assert!(!store.contains_wait(&id));

        let resumption = resumptions.recv().await.unwrap();
        assert_eq!(resumption.wait.correlation_id, id);
        assert!(matches!(resumption.outcome, WaitOutcome::Response(_)));
    }

    #[tokio::test]
    async fn test_unknown_response_discarded_without_grace() {
        let config = CorrelatorConfig {
            early_response_grace_ms: 0,
            ..Default::default()
        };
        let (correlator, _resumptions, _store) = correlator(config);

        let outcome = correlator
            .on_response(CorrelationId::new(), ResponseData::success(json!(null)))
            .await;
        assert!(matches!(
            outcome,
            CorrelationOutcome::Discarded(DiscardReason::Correlation(
                CorrelationError::UnknownCorrelation { .. }
            ))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_expires_wait_with_timeout_payload() {
        let (correlator, mut resumptions, _store) = correlator(CorrelatorConfig::default());
        let wait = wait(WaitKind::Response, Some(Duration::from_millis(50)));
        let id = wait.correlation_id;

        correlator.register_wait(wait).await.unwrap();
        let resumption = resumptions.recv().await.unwrap();

        match resumption.outcome {
            WaitOutcome::Expired(data) => {
                assert_eq!(data.status, StepStatus::Errored);
                assert_eq!(
                    data.failure.map(|f| f.kind),
                    Some(FailureKind::Timeout)
                );
            }
            other => panic!("expected expiry, got {other:?}"),
        }
        assert_eq!(correlator.resolution(&id), Some(Resolution::Expired));

        let late = correlator
            .on_response(id, ResponseData::success(json!("late")))
            .await;
        assert!(late.is_discarded());
    }

    #[tokio::test]
    async fn test_expire_overdue_sweeps_past_deadlines() {
        let (correlator, mut resumptions, _store) = correlator(CorrelatorConfig::default());
        let mut overdue = wait(WaitKind::Response, None);
        overdue.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        let fresh = wait(WaitKind::Response, Some(Duration::from_secs(3600)));

        correlator.restore(vec![overdue.clone(), fresh.clone()], vec![]);
        // The restored timer may already have fired; either way exactly one
        // expiry is delivered for the overdue wait.
        let swept = correlator.expire_overdue().await;
        assert!(swept <= 1);

        let resumption = resumptions.recv().await.unwrap();
        assert_eq!(resumption.wait.correlation_id, overdue.correlation_id);
        assert!(correlator.is_pending(&fresh.correlation_id));
        assert!(resumptions.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_removes_wait_and_reports_outstanding_children() {
        let (correlator, mut resumptions, store) = correlator(CorrelatorConfig::default());
        let wait = wait(WaitKind::Children, None);
        let id = wait.correlation_id;
        let (done, outstanding) = (ChildId::new(), ChildId::new());

        correlator
            .register_children(
                wait,
                vec![(done, "a".to_string()), (outstanding, "b".to_string())],
                false,
            )
            .await
            .unwrap();
        correlator
            .on_child_response(done, StepResponse::succeeded())
            .await;

        let cancelled = correlator.cancel(id).await.unwrap();
        assert_eq!(cancelled.outstanding_children, vec![outstanding]);
        assert_eq!(correlator.resolution(&id), Some(Resolution::Cancelled));
        assert_eq!(store.aggregate_count(), 0);
        assert!(correlator.cancel(id).await.is_none());

        let late = correlator
            .on_child_response(outstanding, StepResponse::succeeded())
            .await;
        assert!(matches!(
            late,
            CorrelationOutcome::Discarded(DiscardReason::Aggregation(
                AggregationError::AggregateClosed { .. }
            ))
        ));
        assert!(resumptions.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_children_aggregate_delivers_once_all_reported() {
        let (correlator, mut resumptions, _store) = correlator(CorrelatorConfig::default());
        let wait = wait(WaitKind::Children, Some(Duration::from_secs(60)));
        let children = [ChildId::new(), ChildId::new()];

        correlator
            .register_children(
                wait,
                vec![(children[0], "x".to_string()), (children[1], "y".to_string())],
                false,
            )
            .await
            .unwrap();

        assert_eq!(
            correlator
                .on_child_response(children[1], StepResponse::succeeded())
                .await,
            CorrelationOutcome::Recorded {
                received: 1,
                expected: 2
            }
        );
        assert_eq!(
            correlator
                .on_child_response(children[0], StepResponse::succeeded())
                .await,
            CorrelationOutcome::Delivered
        );

        match resumptions.recv().await.unwrap().outcome {
            WaitOutcome::ChildrenCompleted { responses, cancelled } => {
                assert_eq!(responses.len(), 2);
                assert!(cancelled.is_empty());
            }
            other => panic!("expected children completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_child_discarded() {
        let (correlator, _resumptions, _store) = correlator(CorrelatorConfig::default());
        let outcome = correlator
            .on_child_response(ChildId::new(), StepResponse::succeeded())
            .await;
        assert!(matches!(
            outcome,
            CorrelationOutcome::Discarded(DiscardReason::Aggregation(
                AggregationError::UnknownChild { .. }
            ))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_drops_old_tombstones_and_parked_responses() {
        let config = CorrelatorConfig {
            early_response_grace_ms: 1_000,
            tombstone_retention_ms: 10_000,
            ..Default::default()
        };
        let (correlator, _resumptions, _store) = correlator(config);
        let resolved = wait(WaitKind::Response, None);
        let resolved_id = resolved.correlation_id;
        correlator.register_wait(resolved).await.unwrap();
        correlator
            .on_response(resolved_id, ResponseData::success(json!(null)))
            .await;
        correlator
            .on_response(CorrelationId::new(), ResponseData::success(json!(null)))
            .await;

        assert_eq!(correlator.prune_tombstones(), 0);

        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert_eq!(correlator.prune_tombstones(), 1);
        assert_eq!(correlator.resolution(&resolved_id), Some(Resolution::Responded));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(correlator.prune_tombstones(), 1);
        assert_eq!(correlator.resolution(&resolved_id), None);
    }
}
