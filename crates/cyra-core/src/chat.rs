//! Chat session manager: one conversation per subscriber with the
//! completion provider.
//!
//! A session moves `Idle → AwaitingResponse → Idle` on success and
//! `Idle → AwaitingResponse → Failed → Idle` on a provider error. The
//! `AwaitingResponse` state is what serializes a subscriber's submissions: a
//! second submit while one is in flight is rejected with
//! [`Error::SessionBusy`]. No lock is held across the provider call.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  Error, Result,
  ledger::UsageRecord,
  provider::{CompletionProvider, ProviderError},
  quota::{Action, QuotaEnforcer},
  store::SubscriberStore,
  subscriber::SubscriberId,
};

/// System preamble sent ahead of every transcript.
pub const PERSONA_PREAMBLE: &str = "You are Cyra, a helpful and knowledgeable AI \
  cybersecurity assistant. You help with threat analysis, security \
  recommendations, vulnerability assessments and incident response. Stay \
  within the cybersecurity domain and answer concisely.";

// ─── Messages ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
  Subscriber,
  Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
  pub message_id: Uuid,
  pub role:       Role,
  pub content:    String,
  pub sent_at:    DateTime<Utc>,
}

impl Message {
  pub fn new(role: Role, content: impl Into<String>, sent_at: DateTime<Utc>) -> Self {
    Self { message_id: Uuid::new_v4(), role, content: content.into(), sent_at }
  }
}

// ─── Session state ───────────────────────────────────────────────────────────

#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionState {
  #[default]
  Idle,
  AwaitingResponse,
  Failed,
}

#[derive(Debug, Clone, Copy)]
pub struct ChatConfig {
  /// Maximum retained user/assistant exchanges per session.
  pub max_turns: usize,
  /// Provider calls exceeding this are treated as [`ProviderError::Timeout`].
  pub timeout:   Duration,
}

impl Default for ChatConfig {
  fn default() -> Self {
    Self { max_turns: 20, timeout: Duration::from_secs(30) }
  }
}

#[derive(Debug, Default)]
struct Session {
  state:        SessionState,
  /// Complete user/assistant pairs, oldest first, plus at most one pending
  /// subscriber turn while a request is in flight.
  messages:     VecDeque<Message>,
  pending:      Option<Uuid>,
  last_failure: Option<ProviderError>,
}

impl Session {
  /// Append `message` as the pending turn and return the payload transcript:
  /// the newest `max_turns - 1` exchanges plus the pending turn. Eviction is
  /// left to [`complete`](Self::complete), so a failed request drops nothing.
  fn stage(&mut self, message: Message, max_turns: usize) -> Vec<Message> {
    let keep = 2 * (max_turns.max(1) - 1);
    let skip = self.messages.len().saturating_sub(keep);
    self.pending = Some(message.message_id);
    self.messages.push_back(message);
    self.messages.iter().skip(skip).cloned().collect()
  }

  /// Remove the pending subscriber turn, if it is still the newest message.
  fn withdraw(&mut self) {
    if let Some(id) = self.pending.take()
      && self.messages.back().is_some_and(|m| m.message_id == id)
    {
      self.messages.pop_back();
    }
  }

  fn complete(&mut self, reply: Message, max_turns: usize) {
    self.pending = None;
    self.messages.push_back(reply);
    while self.messages.len() / 2 > max_turns.max(1) {
      self.messages.pop_front();
      self.messages.pop_front();
    }
    self.last_failure = None;
    self.state = SessionState::Idle;
  }

  fn fail(&mut self, error: ProviderError) {
    self.state = SessionState::Failed;
    self.withdraw();
    self.last_failure = Some(error);
    // The subscriber keeps their quota and may retry straight away.
    self.state = SessionState::Idle;
  }

  fn release(&mut self) {
    self.withdraw();
    self.state = SessionState::Idle;
  }
}

/// Read-only snapshot of a session for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionView {
  pub subscriber_id: SubscriberId,
  pub state:         SessionState,
  pub messages:      Vec<Message>,
  pub last_failure:  Option<ProviderError>,
}

/// The assistant's turn plus the usage record after it was counted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssistantReply {
  pub message: Message,
  pub usage:   UsageRecord,
}

// ─── In-flight guard ─────────────────────────────────────────────────────────

/// Marks a session `AwaitingResponse` for its lifetime. If dropped without
/// being settled (an error path, or the caller's future being cancelled), the
/// session is released back to `Idle` with its pending turn withdrawn.
struct InFlight<'a> {
  sessions: &'a DashMap<SubscriberId, Session>,
  id:       &'a SubscriberId,
  settled:  bool,
}

impl InFlight<'_> {
  fn with_session<T>(&self, f: impl FnOnce(&mut Session) -> T) -> Option<T> {
    self.sessions.get_mut(self.id).map(|mut s| f(&mut s))
  }

  fn settle(mut self, f: impl FnOnce(&mut Session)) {
    self.with_session(f);
    self.settled = true;
  }
}

impl Drop for InFlight<'_> {
  fn drop(&mut self) {
    if !self.settled {
      self.with_session(Session::release);
    }
  }
}

// ─── Manager ─────────────────────────────────────────────────────────────────

pub struct ChatSessions<S> {
  enforcer: Arc<QuotaEnforcer<S>>,
  provider: Arc<dyn CompletionProvider>,
  config:   ChatConfig,
  sessions: DashMap<SubscriberId, Session>,
}

impl<S: SubscriberStore> ChatSessions<S> {
  pub fn new(
    enforcer: Arc<QuotaEnforcer<S>>,
    provider: Arc<dyn CompletionProvider>,
    config: ChatConfig,
  ) -> Self {
    Self { enforcer, provider, config, sessions: DashMap::new() }
  }

  /// Claim the session for one request, or fail with `SessionBusy`.
  fn claim<'a>(&'a self, id: &'a SubscriberId) -> Result<InFlight<'a>> {
    let mut session = self.sessions.entry(id.clone()).or_default();
    if session.state == SessionState::AwaitingResponse {
      return Err(Error::SessionBusy);
    }
    session.state = SessionState::AwaitingResponse;
    Ok(InFlight { sessions: &self.sessions, id, settled: false })
  }

  /// Authorize, send `text` to the provider and record the exchange.
  ///
  /// Usage is counted only after the provider replies successfully; a denial
  /// or provider failure leaves both the ledger and the transcript unchanged.
  pub async fn submit(
    &self,
    id: &SubscriberId,
    text: &str,
    now: DateTime<Utc>,
  ) -> Result<AssistantReply> {
    let text = text.trim();
    if text.is_empty() {
      return Err(Error::EmptyMessage);
    }

    let flight = self.claim(id)?;
    self.enforcer.authorize(id, Action::Query, now).await?.into_result()?;

    let transcript = flight
      .with_session(|s| {
        s.stage(Message::new(Role::Subscriber, text, now), self.config.max_turns)
      })
      .unwrap_or_default();

    let outcome = tokio::time::timeout(
      self.config.timeout,
      self.provider.complete(PERSONA_PREAMBLE, &transcript),
    )
    .await
    .unwrap_or(Err(ProviderError::Timeout));

    match outcome {
      Ok(content) => {
        // Count before releasing the session so the next authorize for this
        // subscriber observes the increment.
        let usage = self.enforcer.record(id, Action::Query, now).await;
        let message = Message::new(Role::Assistant, content, now);
        flight.settle(|s| s.complete(message.clone(), self.config.max_turns));
        Ok(AssistantReply { message, usage: usage? })
      }
      Err(error) => {
        tracing::warn!(subscriber = %id, %error, "completion provider failed");
        flight.settle(|s| s.fail(error));
        Err(Error::ProviderUnavailable(error))
      }
    }
  }

  /// Snapshot of `id`'s session. Subscribers without a session get an empty,
  /// idle view.
  pub fn transcript(&self, id: &SubscriberId) -> SessionView {
    let session = self.sessions.get(id);
    SessionView {
      subscriber_id: id.clone(),
      state:         session.as_ref().map(|s| s.state).unwrap_or_default(),
      messages:      session
        .as_ref()
        .map(|s| s.messages.iter().cloned().collect())
        .unwrap_or_default(),
      last_failure:  session.as_ref().and_then(|s| s.last_failure),
    }
  }

  /// Discard `id`'s transcript. Rejected while a request is in flight.
  pub fn clear(&self, id: &SubscriberId) -> Result<()> {
    let removed = self
      .sessions
      .remove_if(id, |_, s| s.state != SessionState::AwaitingResponse);
    if removed.is_none() && self.sessions.contains_key(id) {
      return Err(Error::SessionBusy);
    }
    Ok(())
  }
}
