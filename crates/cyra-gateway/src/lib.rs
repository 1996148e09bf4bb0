//! The cyra gateway: configuration, HTTP adapters for the external
//! collaborators, the background feed poller and router assembly.

pub mod billing;
pub mod completion;
pub mod error;
pub mod otx;
pub mod settings;

pub use error::{Error, Result};
pub use settings::GatewayConfig;

use std::{sync::Arc, time::Duration};

use axum::{Router, routing::get};
use chrono::Utc;
use cyra_core::{Collaborators, Engine, store::SubscriberStore};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tower_http::trace::TraceLayer;

use billing::{HttpBilling, SandboxBilling};
use completion::OpenAiCompletion;
use otx::OtxFeed;

// ─── Assembly ────────────────────────────────────────────────────────────────

/// Build the HTTP-backed collaborators described by `cfg`.
pub fn collaborators(cfg: &GatewayConfig) -> Result<Collaborators> {
  let billing: Arc<dyn cyra_core::provider::BillingCollaborator> = match &cfg.billing.url {
    Some(url) => Arc::new(HttpBilling::new(url.clone(), cfg.billing.api_key.clone())?),
    None => {
      tracing::warn!("no billing url configured; plan changes are confirmed by the sandbox");
      Arc::new(SandboxBilling)
    }
  };
  if cfg.chat.api_key.is_empty() {
    tracing::warn!("chat.api_key is empty; completion requests will be rejected upstream");
  }
  Ok(Collaborators {
    completion: Arc::new(OpenAiCompletion::new(&cfg.chat)?),
    threat_intel: Arc::new(OtxFeed::new(&cfg.feed)?),
    billing,
  })
}

/// Validate the catalog and wire an engine around `store`.
pub fn build_engine<S: SubscriberStore>(
  store: Arc<S>,
  cfg: &GatewayConfig,
  collaborators: Collaborators,
) -> Result<Engine<S>> {
  let catalog = cfg.catalog()?;
  Ok(Engine::new(store, catalog, collaborators, cfg.engine_config()))
}

// ─── Router ──────────────────────────────────────────────────────────────────

/// The full gateway router: `/health` plus the JSON API under `/api`.
pub fn router<S>(engine: Arc<Engine<S>>) -> Router
where
  S: SubscriberStore + 'static,
{
  Router::new()
    .route("/health", get(|| async { "ok" }))
    .nest("/api", cyra_api::api_router(engine))
    .layer(TraceLayer::new_for_http())
}

// ─── Poller ──────────────────────────────────────────────────────────────────

/// Poll the threat feed every `every`, starting immediately, and prune
/// settled plan transitions on the same tick. Failures are logged by the feed
/// and the loop carries on.
pub fn spawn_poller<S>(engine: Arc<Engine<S>>, every: Duration) -> JoinHandle<()>
where
  S: SubscriberStore + 'static,
{
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
      ticker.tick().await;
      let now = Utc::now();
      if let Ok(report) = engine.feed().poll(now).await {
        tracing::info!(
          inserted = report.inserted,
          updated = report.updated,
          evicted = report.evicted,
          cached = engine.feed().len(),
          "threat feed refreshed"
        );
      }
      let pruned = engine.transitions().prune(now);
      if pruned > 0 {
        tracing::debug!(pruned, "pruned settled plan transitions");
      }
    }
  })
}

#[cfg(test)]
mod tests {
  use async_trait::async_trait;
  use axum::{
    body::Body,
    http::{Request, StatusCode},
  };
  use cyra_core::{
    catalog::PlanId,
    chat::Message,
    error::FeedError,
    provider::{
      CompletionProvider, ProviderError, ThreatIntelProvider,
      ThreatRecord,
    },
    store::MemoryStore,
    subscriber::SubscriberId,
  };
  use tower::ServiceExt as _;

  use super::*;

  struct Silent;

  #[async_trait]
  impl CompletionProvider for Silent {
    async fn complete(&self, _: &str, _: &[Message]) -> Result<String, ProviderError> {
      Err(ProviderError::Unavailable)
    }
  }

  struct OnePulse;

  #[async_trait]
  impl ThreatIntelProvider for OnePulse {
    async fn fetch_latest(&self) -> Result<Vec<ThreatRecord>, FeedError> {
      Ok(vec![ThreatRecord {
        id:          "pulse-1".into(),
        name:        "Ransomware note".into(),
        description: String::new(),
        author:      "otx".into(),
        created_at:  Utc::now(),
        tags:        vec!["ransomware".into()],
      }])
    }
  }

  fn engine() -> Arc<Engine<MemoryStore>> {
    let collaborators = Collaborators {
      completion:   Arc::new(Silent),
      threat_intel: Arc::new(OnePulse),
      billing:      Arc::new(SandboxBilling),
    };
    let engine =
      build_engine(Arc::new(MemoryStore::new()), &GatewayConfig::default(), collaborators)
        .unwrap();
    Arc::new(engine)
  }

  async fn get(app: Router, uri: &str, caller: Option<&str>) -> StatusCode {
    let mut req = Request::builder().uri(uri);
    if let Some(caller) = caller {
      req = req.header(cyra_api::SUBSCRIBER_HEADER, caller);
    }
    app.oneshot(req.body(Body::empty()).unwrap()).await.unwrap().status()
  }

  #[tokio::test]
  async fn health_and_api_are_mounted() {
    let app = router(engine());
    assert_eq!(get(app.clone(), "/health", None).await, StatusCode::OK);
    assert_eq!(get(app.clone(), "/api/plans", None).await, StatusCode::OK);
    assert_eq!(get(app.clone(), "/api/usage", None).await, StatusCode::UNAUTHORIZED);
    assert_eq!(get(app, "/api/usage", Some("alice")).await, StatusCode::OK);
  }

  #[tokio::test]
  async fn invalid_catalog_refuses_to_build() {
    let cfg: GatewayConfig = serde_json::from_value(serde_json::json!({
      "plans": [{ "id": "free", "name": "Free", "max_queries": -5 }]
    }))
    .unwrap();
    let collaborators = Collaborators {
      completion:   Arc::new(Silent),
      threat_intel: Arc::new(OnePulse),
      billing:      Arc::new(SandboxBilling),
    };
    let built = build_engine(Arc::new(MemoryStore::new()), &cfg, collaborators);
    assert!(matches!(built, Err(Error::Catalog(_))));
  }

  #[tokio::test]
  async fn poller_fills_the_cache_and_prunes() {
    let engine = engine();
    let alice = SubscriberId::from("alice");
    let t = engine
      .transitions()
      .request_change(&alice, &PlanId::from("pro"), Utc::now() - chrono::TimeDelta::days(1))
      .await
      .unwrap();

    let handle = spawn_poller(engine.clone(), Duration::from_millis(20));
    tokio::time::timeout(Duration::from_secs(2), async {
      while engine.feed().is_empty() || engine.transitions().get(t.transition_id).is_some() {
        tokio::time::sleep(Duration::from_millis(10)).await;
      }
    })
    .await
    .unwrap();
    handle.abort();

    assert_eq!(engine.feed().len(), 1);
    assert!(engine.feed().get("pulse-1").is_some());
  }

  #[test]
  fn default_config_builds_http_collaborators() {
    assert!(collaborators(&GatewayConfig::default()).is_ok());
  }
}
