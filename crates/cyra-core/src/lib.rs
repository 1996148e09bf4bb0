//! Core types and logic for the cyra gateway: plan catalog, usage ledger,
//! quota enforcement, chat sessions, the threat feed and plan transitions.
//!
//! Nothing here performs I/O directly. Persistence sits behind
//! [`store::SubscriberStore`] and external services behind the traits in
//! [`provider`].

#![allow(async_fn_in_trait)]

pub mod catalog;
pub mod chat;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod provider;
pub mod quota;
pub mod store;
pub mod subscriber;
pub mod threat;
pub mod transition;

pub use engine::{Collaborators, Engine, EngineConfig};
pub use error::{Error, Result};
