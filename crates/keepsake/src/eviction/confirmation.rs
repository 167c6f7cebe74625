//! Confirmation gate for borderline and highly connected deletions
//!
//! Requests go out on a bounded channel to whoever decides (an operator UI, a
//! policy task, a test). The gate waits briefly for an answer and otherwise
//! reports the request as pending; the scheduler asks again on a later cycle.
//! Once the deadline passes, the configured default policy decides.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::Serialize;
use tokio::sync::{Mutex, mpsc, oneshot};
use uuid::Uuid;

use crate::config::{ConfirmationConfig, DefaultPolicy, window_secs};
use crate::error::KeepsakeError;
use crate::memory::types::{MemoryRecord, TierName};

const PREVIEW_CHARS: usize = 80;

/// Answer from the gate for one record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "decision")]
pub enum ConfirmationOutcome {
    Approved,
    Denied,
    /// Still waiting on the decider
    Pending {
        requested_at: DateTime<Utc>,
        deadline: DateTime<Utc>,
    },
}

/// A deletion waiting for a decision
#[derive(Debug)]
pub struct ConfirmationRequest {
    pub record_id: Uuid,
    pub tier: TierName,
    pub score: f32,
    pub threshold: f32,
    pub relational_weight: f32,
    /// Start of the record's content
    pub preview: String,
    pub deadline: DateTime<Utc>,
    responder: oneshot::Sender<bool>,
}

impl ConfirmationRequest {
    /// Allow the deletion. Returns false if the gate stopped waiting.
    pub fn approve(self) -> bool {
        self.responder.send(true).is_ok()
    }

    /// Refuse the deletion. Returns false if the gate stopped waiting.
    pub fn deny(self) -> bool {
        self.responder.send(false).is_ok()
    }

    pub fn respond(self, approved: bool) -> bool {
        self.responder.send(approved).is_ok()
    }
}

#[derive(Debug)]
struct PendingRequest {
    receiver: oneshot::Receiver<bool>,
    requested_at: DateTime<Utc>,
    deadline: DateTime<Utc>,
}

pub struct ConfirmationGate {
    config: ConfirmationConfig,
    sender: Option<mpsc::Sender<ConfirmationRequest>>,
    pending: Mutex<HashMap<Uuid, PendingRequest>>,
    denials: Mutex<LruCache<Uuid, DateTime<Utc>>>,
}

impl ConfirmationGate {
    /// Gate without a decider; routed records get the default policy at once
    pub fn new(config: ConfirmationConfig) -> Self {
        let cap = NonZeroUsize::new(config.denial_cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            sender: None,
            pending: Mutex::new(HashMap::new()),
            denials: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Gate plus the receiving end a decider should drain
    pub fn with_channel(config: ConfirmationConfig) -> (Self, mpsc::Receiver<ConfirmationRequest>) {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let mut gate = Self::new(config);
        gate.sender = Some(tx);
        (gate, rx)
    }

    pub fn config(&self) -> &ConfirmationConfig {
        &self.config
    }

    pub fn has_decider(&self) -> bool {
        self.sender.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Borderline scores and well-connected records need a decision
    pub fn requires_confirmation(&self, record: &MemoryRecord, threshold: f32) -> bool {
        if !self.config.enabled {
            return false;
        }
        let borderline = (record.value_score - threshold).abs() <= self.config.borderline_band;
        let relational = relational_weight(record) >= self.config.high_relational_weight;
        borderline || relational
    }

    pub async fn request_confirmation(
        &self,
        record: &MemoryRecord,
        threshold: f32,
    ) -> ConfirmationOutcome {
        if !self.requires_confirmation(record, threshold) {
            return ConfirmationOutcome::Approved;
        }

        let now = Utc::now();
        if self.in_cooldown(record.id, now).await {
            tracing::debug!("Record {} is in denial cooldown", record.id);
            return ConfirmationOutcome::Denied;
        }

        let existing = self.pending.lock().await.remove(&record.id);
        if let Some(pending) = existing {
            return self.poll_pending(record.id, pending, now).await;
        }

        let Some(sender) = &self.sender else {
            tracing::debug!(
                "No confirmation decider, applying {:?} to {}",
                self.config.default_policy,
                record.id
            );
            return self.apply_default(record.id, None, now).await;
        };

        // A record that was pending before a restart keeps its original deadline
        let (requested_at, deadline) = match record.pending_confirmation {
            Some(p) => (p.requested_at, p.deadline),
            None => (now, now + window_secs(self.config.deadline_secs)),
        };
        if now >= deadline {
            return self
                .apply_default(record.id, Some("deadline passed before the request was sent"), now)
                .await;
        }

        let (responder, mut receiver) = oneshot::channel();
        let request = ConfirmationRequest {
            record_id: record.id,
            tier: record.tier.clone(),
            score: record.value_score,
            threshold,
            relational_weight: relational_weight(record),
            preview: record.content.chars().take(PREVIEW_CHARS).collect(),
            deadline,
            responder,
        };

        if let Err(e) = sender.try_send(request) {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "confirmation channel full",
                mpsc::error::TrySendError::Closed(_) => "confirmation decider gone",
            };
            return self.apply_default(record.id, Some(reason), now).await;
        }

        let inline_wait = StdDuration::from_millis(self.config.inline_wait_ms);
        match tokio::time::timeout(inline_wait, &mut receiver).await {
            Ok(Ok(approved)) => self.record_answer(record.id, approved, now).await,
            Ok(Err(_)) => {
                self.apply_default(record.id, Some("decider dropped the request"), Utc::now())
                    .await
            }
            Err(_) => {
                let pending = PendingRequest {
                    receiver,
                    requested_at,
                    deadline,
                };
                self.poll_pending(record.id, pending, Utc::now()).await
            }
        }
    }

    async fn poll_pending(
        &self,
        id: Uuid,
        mut pending: PendingRequest,
        now: DateTime<Utc>,
    ) -> ConfirmationOutcome {
        match pending.receiver.try_recv() {
            Ok(approved) => self.record_answer(id, approved, now).await,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.apply_default(id, Some("decider dropped the request"), now)
                    .await
            }
            Err(oneshot::error::TryRecvError::Empty) if now >= pending.deadline => {
                pending.receiver.close();
                self.apply_default(id, Some("no answer before the deadline"), now)
                    .await
            }
            Err(oneshot::error::TryRecvError::Empty) => {
                let outcome = ConfirmationOutcome::Pending {
                    requested_at: pending.requested_at,
                    deadline: pending.deadline,
                };
                self.pending.lock().await.insert(id, pending);
                outcome
            }
        }
    }

    async fn record_answer(&self, id: Uuid, approved: bool, now: DateTime<Utc>) -> ConfirmationOutcome {
        if approved {
            tracing::debug!("Deletion of {} approved", id);
            ConfirmationOutcome::Approved
        } else {
            tracing::info!("Deletion of {} denied", id);
            self.denials.lock().await.put(id, now);
            ConfirmationOutcome::Denied
        }
    }

    async fn apply_default(
        &self,
        id: Uuid,
        timeout_reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> ConfirmationOutcome {
        let approved = self.config.default_policy == DefaultPolicy::Approve;
        if let Some(reason) = timeout_reason {
            let err = KeepsakeError::ConfirmationTimeout {
                record: id,
                decision: if approved { "DefaultApprove" } else { "DefaultDeny" }.to_string(),
            };
            tracing::warn!("{} ({})", err, reason);
        }
        self.record_answer(id, approved, now).await
    }

    async fn in_cooldown(&self, id: Uuid, now: DateTime<Utc>) -> bool {
        let mut denials = self.denials.lock().await;
        let Some(denied_at) = denials.get(&id).copied() else {
            return false;
        };
        if now - denied_at < window_secs(self.config.denial_cooldown_secs) {
            return true;
        }
        denials.pop(&id);
        false
    }

    /// Drop state for a record that no longer exists
    pub async fn forget(&self, id: Uuid) {
        self.pending.lock().await.remove(&id);
        self.denials.lock().await.pop(&id);
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Outstanding requests and their deadlines
    pub async fn pending_deadlines(&self) -> Vec<(Uuid, DateTime<Utc>, DateTime<Utc>)> {
        self.pending
            .lock()
            .await
            .iter()
            .map(|(id, p)| (*id, p.requested_at, p.deadline))
            .collect()
    }
}

fn relational_weight(record: &MemoryRecord) -> f32 {
    record
        .score_breakdown
        .map(|b| b.relational_weight)
        .unwrap_or(0.0)
}
