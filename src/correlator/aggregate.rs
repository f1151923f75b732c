//! Children aggregate: order-independent merge of child responses.
//!
//! Responses are keyed by [`ChildId`], so the merged result does not depend
//! on arrival order. The aggregate completes exactly once: when the last
//! expected child reports, or, for fail-fast aggregates, when the first child
//! fails. Anything arriving after that is rejected.

use crate::error::AggregationError;
use crate::executable::ChildResponse;
use crate::types::{ChildId, CorrelationId, FailureKind, StepResponse};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateState {
    Open,
    Completed,
    Expired,
    Cancelled,
}

/// Result of recording one child response
#[derive(Debug, Clone, PartialEq)]
pub enum AggregateProgress {
    Pending {
        received: usize,
        expected: usize,
    },
    /// Fired once; `responses` holds an entry for every expected child
    Complete {
        responses: HashMap<ChildId, ChildResponse>,
        /// Children that never reported and were marked cancelled
        cancelled: Vec<ChildId>,
    },
}

/// Serializable merge state of a CHILD or CHILDREN invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildrenAggregate {
    /// Same id as the owning pending wait
    pub aggregate_id: CorrelationId,
    pub parent_runtime_id: Uuid,
    /// Child id → plan node identifier
    pub expected: BTreeMap<ChildId, String>,
    pub responses: BTreeMap<ChildId, StepResponse>,
    pub cancel_siblings_on_failure: bool,
    pub state: AggregateState,
    pub created_at: DateTime<Utc>,
}

impl ChildrenAggregate {
    pub fn new(
        aggregate_id: CorrelationId,
        parent_runtime_id: Uuid,
        expected: impl IntoIterator<Item = (ChildId, String)>,
        cancel_siblings_on_failure: bool,
    ) -> Self {
        Self {
            aggregate_id,
            parent_runtime_id,
            expected: expected.into_iter().collect(),
            responses: BTreeMap::new(),
            cancel_siblings_on_failure,
            state: AggregateState::Open,
            created_at: Utc::now(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == AggregateState::Open
    }

    pub fn expected_count(&self) -> usize {
        self.expected.len()
    }

    pub fn received_count(&self) -> usize {
        self.responses.len()
    }

    /// Children that have not reported yet
    pub fn outstanding(&self) -> Vec<ChildId> {
        self.expected
            .keys()
            .filter(|child_id| !self.responses.contains_key(child_id))
            .copied()
            .collect()
    }

    pub fn record(
        &mut self,
        child_id: ChildId,
        response: StepResponse,
    ) -> Result<AggregateProgress, AggregationError> {
        if !self.expected.contains_key(&child_id) {
            return Err(AggregationError::UnknownChild { child_id });
        }
        if !self.is_open() {
            return Err(AggregationError::AggregateClosed {
                aggregate_id: self.aggregate_id,
                child_id,
            });
        }
        if self.responses.contains_key(&child_id) {
            return Err(AggregationError::DuplicateChild {
                aggregate_id: self.aggregate_id,
                child_id,
            });
        }

        let failed = response.status.is_failure();
        self.responses.insert(child_id, response);

        let all_reported = self.responses.len() == self.expected.len();
        let fail_fast = failed && self.cancel_siblings_on_failure;

        if !all_reported && !fail_fast {
            return Ok(AggregateProgress::Pending {
                received: self.responses.len(),
                expected: self.expected.len(),
            });
        }

        let cancelled = self.outstanding();
        for child_id in &cancelled {
            self.responses.insert(
                *child_id,
                StepResponse::errored(
                    FailureKind::Cancelled,
                    "cancelled after a sibling child failed",
                ),
            );
        }
        self.state = AggregateState::Completed;

        Ok(AggregateProgress::Complete {
            responses: self.collected(),
            cancelled,
        })
    }

    /// Close without completing; later responses are rejected
    pub fn close(&mut self, state: AggregateState) {
        if self.is_open() {
            self.state = state;
        }
    }

    fn collected(&self) -> HashMap<ChildId, ChildResponse> {
        self.responses
            .iter()
            .map(|(child_id, response)| {
                let identifier = self.expected.get(child_id).cloned().unwrap_or_default();
                (
                    *child_id,
                    ChildResponse {
                        identifier,
                        response: response.clone(),
                    },
                )
            })
            .collect()
    }
}
