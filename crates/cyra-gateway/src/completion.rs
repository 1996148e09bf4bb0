//! [`CompletionProvider`] over an OpenAI-compatible `chat/completions`
//! endpoint.

use std::time::Duration;

use async_trait::async_trait;
use cyra_core::{
  chat::{Message, Role},
  provider::{CompletionProvider, ProviderError},
};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::{Result, settings::ChatSettings};

pub struct OpenAiCompletion {
  client:   Client,
  endpoint: String,
  api_key:  String,
  model:    String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
  model:    &'a str,
  messages: Vec<WireMessage<'a>>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
  role:    &'static str,
  content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
  #[serde(default)]
  choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
  message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
  #[serde(default)]
  content: Option<String>,
}

impl OpenAiCompletion {
  pub fn new(settings: &ChatSettings) -> Result<Self> {
    // The engine enforces its own deadline; this one only bounds a wedged
    // connection.
    let client = Client::builder()
      .timeout(Duration::from_secs(settings.timeout_secs.saturating_add(5)))
      .build()?;
    Ok(Self {
      client,
      endpoint: format!("{}/chat/completions", settings.api_base.trim_end_matches('/')),
      api_key: settings.api_key.clone(),
      model: settings.model.clone(),
    })
  }
}

fn wire_role(role: Role) -> &'static str {
  match role {
    Role::Subscriber => "user",
    Role::Assistant => "assistant",
  }
}

#[async_trait]
impl CompletionProvider for OpenAiCompletion {
  async fn complete(
    &self,
    system_preamble: &str,
    transcript: &[Message],
  ) -> Result<String, ProviderError> {
    let messages = std::iter::once(WireMessage { role: "system", content: system_preamble })
      .chain(
        transcript
          .iter()
          .map(|m| WireMessage { role: wire_role(m.role), content: &m.content }),
      )
      .collect();
    let body = ChatRequest { model: &self.model, messages };

    let resp = self
      .client
      .post(&self.endpoint)
      .bearer_auth(&self.api_key)
      .json(&body)
      .send()
      .await
      .map_err(|e| {
        tracing::debug!(error = %e, "completion request failed");
        if e.is_timeout() { ProviderError::Timeout } else { ProviderError::Unavailable }
      })?;

    match resp.status() {
      StatusCode::TOO_MANY_REQUESTS => return Err(ProviderError::RateLimited),
      s if !s.is_success() => {
        tracing::debug!(status = %s, "completion endpoint returned an error");
        return Err(ProviderError::Unavailable);
      }
      _ => {}
    }

    let parsed: ChatResponse = resp.json().await.map_err(|e| {
      if e.is_timeout() { ProviderError::Timeout } else { ProviderError::MalformedResponse }
    })?;
    parsed
      .choices
      .into_iter()
      .next()
      .and_then(|c| c.message.content)
      .filter(|c| !c.trim().is_empty())
      .ok_or(ProviderError::MalformedResponse)
  }
}

#[cfg(test)]
mod tests {
  use chrono::Utc;
  use serde_json::json;
  use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_partial_json, header, method, path},
  };

  use super::*;

  fn provider(server: &MockServer) -> OpenAiCompletion {
    OpenAiCompletion::new(&ChatSettings {
      api_base: server.uri(),
      api_key: "sk-test".into(),
      ..ChatSettings::default()
    })
    .unwrap()
  }

  fn transcript() -> Vec<Message> {
    vec![
      Message::new(Role::Subscriber, "what is phishing?", Utc::now()),
      Message::new(Role::Assistant, "a social engineering attack", Utc::now()),
      Message::new(Role::Subscriber, "how do I spot it?", Utc::now()),
    ]
  }

  #[tokio::test]
  async fn sends_preamble_and_transcript() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/chat/completions"))
      .and(header("authorization", "Bearer sk-test"))
      .and(body_partial_json(json!({
        "model": "gpt-4o-mini",
        "messages": [
          { "role": "system", "content": "be brief" },
          { "role": "user", "content": "what is phishing?" },
          { "role": "assistant", "content": "a social engineering attack" },
          { "role": "user", "content": "how do I spot it?" },
        ],
      })))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{ "message": { "role": "assistant", "content": "Check the sender." } }],
      })))
      .expect(1)
      .mount(&server)
      .await;

    let reply = provider(&server).complete("be brief", &transcript()).await.unwrap();
    assert_eq!(reply, "Check the sender.");
  }

  #[tokio::test]
  async fn rate_limit_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(429))
      .mount(&server)
      .await;
    let err = provider(&server).complete("", &transcript()).await.unwrap_err();
    assert_eq!(err, ProviderError::RateLimited);
  }

  #[tokio::test]
  async fn server_error_is_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(502))
      .mount(&server)
      .await;
    let err = provider(&server).complete("", &transcript()).await.unwrap_err();
    assert_eq!(err, ProviderError::Unavailable);
  }

  #[tokio::test]
  async fn empty_choices_are_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "choices": [] })))
      .mount(&server)
      .await;
    let err = provider(&server).complete("", &transcript()).await.unwrap_err();
    assert_eq!(err, ProviderError::MalformedResponse);
  }
}
