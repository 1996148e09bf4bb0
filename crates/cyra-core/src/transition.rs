//! Plan transition workflow.
//!
//! ```text
//! Requested ──▶ BillingPending ──▶ Active
//!    │  ▲              │
//!    │  └── Failed ◀───┘   (billing rejected; retry allowed)
//!    ▼
//! Cancelled
//! ```
//!
//! A subscriber has at most one open transition. The open transition itself
//! is the serialization device while billing is in progress; the subscriber's
//! exclusive section is taken only for the final commit. A billing call that
//! times out counts as a rejection, and one abandoned by a cancelled caller
//! returns the transition to `Requested`.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  Error, Result,
  catalog::{PlanCatalog, PlanId},
  ledger::UsageLedger,
  provider::{BillingCollaborator, ChargeOutcome},
  store::{SubscriberStore, get_or_enrol},
  subscriber::{Subscriber, SubscriberId, SubscriberLocks},
};

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransitionState {
  Requested,
  BillingPending,
  Active,
  Failed,
  Cancelled,
}

impl TransitionState {
  pub fn is_terminal(self) -> bool { matches!(self, Self::Active | Self::Cancelled) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionStep {
  pub state: TransitionState,
  pub at:    DateTime<Utc>,
}

/// An in-progress or recently settled plan change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanTransition {
  pub transition_id: Uuid,
  pub subscriber_id: SubscriberId,
  pub from_plan:     PlanId,
  pub to_plan:       PlanId,
  pub state:         TransitionState,
  pub requested_at:  DateTime<Utc>,
  pub updated_at:    DateTime<Utc>,
  /// Reason given by billing for the most recent rejection.
  pub last_failure:  Option<String>,
  pub history:       Vec<TransitionStep>,
}

impl PlanTransition {
  fn new(
    transition_id: Uuid,
    subscriber: &Subscriber,
    to_plan: PlanId,
    now: DateTime<Utc>,
  ) -> Self {
    Self {
      transition_id,
      subscriber_id: subscriber.subscriber_id.clone(),
      from_plan:     subscriber.plan_id.clone(),
      to_plan,
      state:         TransitionState::Requested,
      requested_at:  now,
      updated_at:    now,
      last_failure:  None,
      history:       vec![TransitionStep { state: TransitionState::Requested, at: now }],
    }
  }

  fn enter(&mut self, state: TransitionState, now: DateTime<Utc>) {
    self.state = state;
    self.updated_at = now;
    self.history.push(TransitionStep { state, at: now });
  }
}

/// Recorded against a transition whose billing call was abandoned before it
/// settled.
pub const BILLING_ABANDONED: &str = "billing call abandoned before it settled";

/// Recorded against a transition whose billing call exceeded its timeout.
pub const BILLING_TIMED_OUT: &str = "billing call timed out";

pub struct PlanTransitions<S> {
  store:           Arc<S>,
  catalog:         Arc<PlanCatalog>,
  ledger:          Arc<UsageLedger>,
  locks:           Arc<SubscriberLocks>,
  billing:         Arc<dyn BillingCollaborator>,
  /// How long a settled transition stays readable before [`Self::prune`]
  /// discards it.
  retention:       TimeDelta,
  billing_timeout: Duration,
  transitions:     DashMap<Uuid, PlanTransition>,
  open:            DashMap<SubscriberId, Uuid>,
}

// ─── Guards ──────────────────────────────────────────────────────────────────

/// Holds a subscriber's open slot while a new transition is being set up.
/// Released on drop unless [`kept`](Self::keep).
struct OpenClaim<'a> {
  open:          &'a DashMap<SubscriberId, Uuid>,
  id:            &'a SubscriberId,
  transition_id: Uuid,
  kept:          bool,
}

impl OpenClaim<'_> {
  fn keep(mut self) { self.kept = true; }
}

impl Drop for OpenClaim<'_> {
  fn drop(&mut self) {
    if !self.kept {
      self.open.remove_if(self.id, |_, open| *open == self.transition_id);
    }
  }
}

/// Marks a transition `BillingPending` for its lifetime. If dropped without
/// being settled (the caller's future was cancelled mid-charge), the
/// transition reverts to `Requested` so it can be retried or cancelled.
struct Charging<'a, S> {
  transitions:   &'a PlanTransitions<S>,
  transition_id: Uuid,
  now:           DateTime<Utc>,
  settled:       bool,
}

impl<S> Charging<'_, S> {
  fn settle(mut self) { self.settled = true; }

  fn fail(mut self, reason: &str) -> Result<PlanTransition> {
    self.settled = true;
    self.transitions.revert(self.transition_id, reason, self.now)
  }
}

impl<S> Drop for Charging<'_, S> {
  fn drop(&mut self) {
    if !self.settled
      && self.transitions.revert(self.transition_id, BILLING_ABANDONED, self.now).is_ok()
    {
      tracing::warn!(transition_id = %self.transition_id, "plan change abandoned mid-billing");
    }
  }
}

// ─── Workflow ────────────────────────────────────────────────────────────────

impl<S> PlanTransitions<S> {
  /// Abandon a transition that is waiting in `Requested`.
  pub fn cancel(&self, transition_id: Uuid, now: DateTime<Utc>) -> Result<PlanTransition> {
    let cancelled = self.update(transition_id, "cancel", |t| {
      if t.state != TransitionState::Requested {
        return false;
      }
      t.enter(TransitionState::Cancelled, now);
      true
    })?;
    self.open.remove_if(&cancelled.subscriber_id, |_, open| *open == transition_id);
    tracing::info!(subscriber = %cancelled.subscriber_id, %transition_id, "plan change cancelled");
    Ok(cancelled)
  }

  pub fn get(&self, transition_id: Uuid) -> Option<PlanTransition> {
    self.transitions.get(&transition_id).map(|t| t.clone())
  }

  /// Discard settled transitions older than the retention period. Returns the
  /// number removed.
  pub fn prune(&self, now: DateTime<Utc>) -> usize {
    let before = self.transitions.len();
    self.transitions.retain(|_, t| {
      let expired = t
        .updated_at
        .checked_add_signed(self.retention)
        .is_some_and(|expiry| expiry <= now);
      !(t.state.is_terminal() && expired)
    });
    before - self.transitions.len()
  }

  /// Apply `f` to a transition under its entry lock. `f` returns `false` to
  /// refuse the operation in the current state.
  fn update(
    &self,
    transition_id: Uuid,
    action: &'static str,
    f: impl FnOnce(&mut PlanTransition) -> bool,
  ) -> Result<PlanTransition> {
    let mut t = self
      .transitions
      .get_mut(&transition_id)
      .ok_or(Error::TransitionNotFound(transition_id))?;
    if !f(&mut t) {
      return Err(Error::InvalidTransition { state: t.state, action });
    }
    Ok(t.clone())
  }

  /// `BillingPending → Failed → Requested`.
  fn revert(&self, transition_id: Uuid, reason: &str, now: DateTime<Utc>) -> Result<PlanTransition> {
    self.update(transition_id, "fail", |t| {
      if t.state != TransitionState::BillingPending {
        return false;
      }
      t.enter(TransitionState::Failed, now);
      t.last_failure = Some(reason.to_owned());
      t.enter(TransitionState::Requested, now);
      true
    })
  }
}

impl<S: SubscriberStore> PlanTransitions<S> {
  pub fn new(
    store: Arc<S>,
    catalog: Arc<PlanCatalog>,
    ledger: Arc<UsageLedger>,
    locks: Arc<SubscriberLocks>,
    billing: Arc<dyn BillingCollaborator>,
    retention: TimeDelta,
    billing_timeout: Duration,
  ) -> Self {
    Self {
      store,
      catalog,
      ledger,
      locks,
      billing,
      retention,
      billing_timeout,
      transitions: DashMap::new(),
      open: DashMap::new(),
    }
  }

  /// Request a move to `to_plan` and drive it through billing.
  ///
  /// On confirmation the returned transition is `Active`. On rejection the
  /// transition reverts to `Requested` and [`Error::BillingRejected`] carries
  /// its id for a later [`retry`](Self::retry) or [`cancel`](Self::cancel).
  pub async fn request_change(
    &self,
    id: &SubscriberId,
    to_plan: &PlanId,
    now: DateTime<Utc>,
  ) -> Result<PlanTransition> {
    self.catalog.lookup(to_plan)?;

    // Claim the slot before reading the current plan: once it is held no
    // other transition can activate for `id`, so the read is not stale.
    let transition_id = Uuid::new_v4();
    let claim = match self.open.entry(id.clone()) {
      Entry::Occupied(open) => return Err(Error::TransitionInProgress(*open.get())),
      Entry::Vacant(slot) => {
        slot.insert(transition_id);
        OpenClaim { open: &self.open, id, transition_id, kept: false }
      }
    };
    let subscriber = get_or_enrol(&*self.store, &self.catalog, id, now).await?;
    if &subscriber.plan_id == to_plan {
      return Err(Error::SamePlan(to_plan.clone()));
    }

    let transition = PlanTransition::new(transition_id, &subscriber, to_plan.clone(), now);
    self.transitions.insert(transition_id, transition);
    claim.keep();
    tracing::info!(
      subscriber = %id,
      from = %subscriber.plan_id,
      to = %to_plan,
      %transition_id,
      "plan change requested"
    );
    self.drive(transition_id, now).await
  }

  /// Resubmit a transition whose billing was rejected.
  pub async fn retry(&self, transition_id: Uuid, now: DateTime<Utc>) -> Result<PlanTransition> {
    self.drive(transition_id, now).await
  }

  /// `Requested → BillingPending`, then settle on the billing outcome.
  async fn drive(&self, transition_id: Uuid, now: DateTime<Utc>) -> Result<PlanTransition> {
    let pending = self.update(transition_id, "bill", |t| {
      if t.state != TransitionState::Requested {
        return false;
      }
      t.enter(TransitionState::BillingPending, now);
      true
    })?;
    let charging = Charging { transitions: self, transition_id, now, settled: false };

    let outcome = tokio::time::timeout(
      self.billing_timeout,
      self.billing.charge(&pending.subscriber_id, &pending.to_plan),
    )
    .await
    .unwrap_or_else(|_| ChargeOutcome::Rejected { reason: BILLING_TIMED_OUT.into() });

    match outcome {
      ChargeOutcome::Confirmed => self.activate(pending, charging).await,
      ChargeOutcome::Rejected { reason } => {
        tracing::warn!(
          subscriber = %pending.subscriber_id,
          %transition_id,
          %reason,
          "billing rejected plan change"
        );
        charging.fail(&reason)?;
        Err(Error::BillingRejected { transition_id, reason })
      }
    }
  }

  /// Commit a confirmed change: new plan assignment and an immediate usage
  /// rollover, both inside the subscriber's exclusive section.
  async fn activate(
    &self,
    pending: PlanTransition,
    charging: Charging<'_, S>,
  ) -> Result<PlanTransition> {
    let id = &pending.subscriber_id;
    let now = charging.now;
    let _section = self.locks.lock(id).await;
    if let Err(e) = self.ledger.hydrate(&*self.store, id).await {
      charging.fail("usage could not be loaded")?;
      return Err(e);
    }
    let assignment = Subscriber::new(id.clone(), pending.to_plan.clone(), now);
    if let Err(e) = self.store.save_subscriber(assignment).await {
      charging.fail("plan assignment could not be saved")?;
      return Err(Error::store(e));
    }

    // Downgrades below current usage are not penalised: the new cycle
    // starts from zero.
    let fresh = self.ledger.reset_for(id, now);
    let active = self.update(pending.transition_id, "activate", |t| {
      t.enter(TransitionState::Active, now);
      t.last_failure = None;
      true
    })?;
    charging.settle();
    self.open.remove_if(id, |_, open| *open == pending.transition_id);
    tracing::info!(
      subscriber = %id,
      from = %active.from_plan,
      to = %active.to_plan,
      "plan change active"
    );

    if let Err(error) = self.store.save_usage(fresh).await {
      tracing::error!(subscriber = %id, %error, "fresh usage cycle could not be saved");
    }
    Ok(active)
  }
}
