//! Error types for `cyra-core`.

use thiserror::Error;
use uuid::Uuid;

use crate::{
  catalog::PlanId, provider::ProviderError, transition::TransitionState,
};

/// Errors returned across the core boundary. Every variant is an explicit,
/// recoverable result for the calling collaborator.
#[derive(Debug, Error)]
pub enum Error {
  #[error("unknown plan: {0}")]
  UnknownPlan(PlanId),

  #[error("quota exceeded: {used}/{limit} used")]
  QuotaExceeded {
    used:    u32,
    limit:   u32,
    /// The next plan in upgrade order, if any.
    upgrade: Option<PlanId>,
  },

  #[error("a request is already in flight for this session")]
  SessionBusy,

  #[error("completion provider unavailable: {0}")]
  ProviderUnavailable(#[from] ProviderError),

  #[error("billing rejected transition {transition_id}: {reason}")]
  BillingRejected { transition_id: Uuid, reason: String },

  #[error("subscriber is already on plan {0}")]
  SamePlan(PlanId),

  #[error("subscriber already has an open plan transition: {0}")]
  TransitionInProgress(Uuid),

  #[error("plan transition not found: {0}")]
  TransitionNotFound(Uuid),

  #[error("cannot {action} a transition in state {state}")]
  InvalidTransition {
    state:  TransitionState,
    action: &'static str,
  },

  #[error("threat not found: {0}")]
  ThreatNotFound(String),

  #[error("message is empty")]
  EmptyMessage,

  #[error("store error: {0}")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
  pub(crate) fn store<E>(e: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    Self::Store(Box::new(e))
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Plan catalog misconfiguration. Detected once at load time; the process
/// must not start with an invalid catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
  #[error("plan catalog is empty")]
  Empty,

  #[error("plan identifier must not be blank")]
  BlankId,

  #[error("duplicate plan identifier: {0}")]
  DuplicatePlan(PlanId),

  #[error("plan {plan} has a negative query limit ({value})")]
  NegativeQuota { plan: PlanId, value: i64 },

  #[error("plan {plan} query limit {value} is out of range")]
  QuotaOutOfRange { plan: PlanId, value: i64 },
}

/// A failed threat-feed poll. Reported, never fatal.
#[derive(Debug, Clone, Error)]
pub enum FeedError {
  #[error("threat feed timed out")]
  Timeout,

  #[error("threat feed transport error: {0}")]
  Transport(String),

  #[error("threat feed returned HTTP {0}")]
  Status(u16),

  #[error("malformed threat feed payload: {0}")]
  Malformed(String),
}
