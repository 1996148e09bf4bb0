//! JSON REST API for the cyra gateway.
//!
//! Exposes an axum [`Router`] over a shared [`cyra_core::Engine`]. The caller
//! is identified by the `X-Subscriber-Id` header, which the upstream
//! authentication layer is trusted to set. TLS and transport concerns are the
//! caller's responsibility.
//!
//! # Mounting
//!
//! ```rust,ignore
//! .nest("/api", cyra_api::api_router(engine.clone()))
//! ```

pub mod chat;
pub mod error;
pub mod identity;
pub mod plans;
pub mod reports;
pub mod threats;
pub mod transitions;
pub mod usage;

use std::sync::Arc;

use axum::{
  Router,
  routing::{get, post},
};
use cyra_core::{Engine, store::SubscriberStore};

pub use error::ApiError;
pub use identity::{Caller, SUBSCRIBER_HEADER};

/// Build a fully-materialised API router for `engine`.
///
/// The returned `Router<()>` can be nested into any parent router regardless
/// of its own state type.
pub fn api_router<S>(engine: Arc<Engine<S>>) -> Router<()>
where
  S: SubscriberStore + 'static,
{
  Router::new()
    // Plans
    .route("/plans", get(plans::list::<S>))
    .route("/plans/{id}", get(plans::get_one::<S>))
    .route("/me", get(plans::me::<S>))
    // Usage
    .route("/usage", get(usage::summary::<S>))
    .route("/usage/history", get(usage::history::<S>))
    // Chat
    .route(
      "/chat",
      get(chat::transcript::<S>)
        .post(chat::submit::<S>)
        .delete(chat::clear::<S>),
    )
    .route("/chat/authorize", post(chat::authorize::<S>))
    // Threats
    .route("/threats", get(threats::list::<S>))
    .route("/threats/tags", get(threats::tags::<S>))
    .route("/threats/status", get(threats::status::<S>))
    .route("/threats/{id}/flag", post(threats::flag::<S>))
    .route("/reports/threats", get(reports::threats::<S>))
    // Plan transitions
    .route("/transitions", post(transitions::create::<S>))
    .route("/transitions/{id}", get(transitions::get_one::<S>))
    .route("/transitions/{id}/retry", post(transitions::retry::<S>))
    .route("/transitions/{id}/cancel", post(transitions::cancel::<S>))
    .with_state(engine)
}
