//! Thin, replaceable boundary against the chat provider's HTTP API.
//!
//! The only component that speaks the provider protocol. Request-level
//! retries are env-tunable; errors carry the HTTP status so callers can
//! classify transient versus permanent failures. The long-poll offset is
//! persisted after every successful batch so restarts never re-deliver
//! acknowledged updates.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use gaia_core::write_json_atomic;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

const OFFSET_STATE_SCHEMA_VERSION: u32 = 1;

/// Typed provider error; `status` is `None` for network-level failures.
#[derive(Debug, Clone, Error)]
#[error("chat api error (status={status:?}): {message}")]
pub struct ChatApiError {
    pub status: Option<u16>,
    pub message: String,
}

impl ChatApiError {
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    /// Network errors, 5xx and 429 are worth retrying; other 4xx are not.
    pub fn retryable(&self) -> bool {
        match self.status {
            None => true,
            Some(429) => true,
            Some(status) => status >= 500,
        }
    }
}

/// Capability seam against the provider; production uses [`TelegramApi`],
/// tests substitute a double.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn get_updates(&self, offset: u64, timeout_secs: u64)
        -> Result<Vec<Value>, ChatApiError>;
    async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        reply_markup: Option<Value>,
    ) -> Result<Value, ChatApiError>;
    async fn answer_callback(
        &self,
        callback_query_id: &str,
        text: Option<&str>,
    ) -> Result<Value, ChatApiError>;
    async fn edit_message_text(
        &self,
        chat_id: &str,
        message_id: &str,
        text: &str,
        reply_markup: Option<Value>,
    ) -> Result<Value, ChatApiError>;
    async fn send_chat_action(&self, chat_id: &str, action: &str) -> Result<Value, ChatApiError>;
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub api_base: String,
    pub bot_token: String,
    pub retries: u32,
    pub base_backoff: Duration,
    pub http_timeout: Duration,
}

impl TelegramConfig {
    pub fn new(bot_token: impl Into<String>) -> Self {
        Self {
            api_base: "https://api.telegram.org".to_string(),
            bot_token: bot_token.into(),
            retries: 3,
            base_backoff: Duration::from_millis(500),
            http_timeout: Duration::from_secs(65),
        }
    }

    /// Applies `TELEGRAM_API_BASE`, `TELEGRAM_RETRIES` and
    /// `TELEGRAM_BACKOFF_MS` on top of the defaults.
    pub fn from_env(bot_token: impl Into<String>) -> Self {
        let mut config = Self::new(bot_token);
        if let Ok(base) = std::env::var("TELEGRAM_API_BASE") {
            let trimmed = base.trim();
            if !trimmed.is_empty() {
                config.api_base = trimmed.to_string();
            }
        }
        if let Some(retries) = env_u64("TELEGRAM_RETRIES") {
            config.retries = retries.clamp(1, 10) as u32;
        }
        if let Some(backoff_ms) = env_u64("TELEGRAM_BACKOFF_MS") {
            config.base_backoff = Duration::from_millis(backoff_ms.max(1));
        }
        config
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.trim().parse().ok()
}

/// Production provider client.
pub struct TelegramApi {
    config: TelegramConfig,
    client: reqwest::Client,
}

impl TelegramApi {
    pub fn new(config: TelegramConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("failed to build telegram http client")?;
        Ok(Self { config, client })
    }

    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token,
            method
        )
    }

    /// One provider call with request-level retries; only retryable failures
    /// are re-attempted, with the backoff doubling each attempt.
    async fn call_method(&self, method: &str, params: Value) -> Result<Value, ChatApiError> {
        let url = self.method_url(method);
        let mut backoff = self.config.base_backoff;
        let mut last_error = ChatApiError::network("no attempts made");
        for attempt in 1..=self.config.retries.max(1) {
            match self.call_once(&url, &params).await {
                Ok(result) => return Ok(result),
                Err(error) => {
                    let retryable = error.retryable();
                    tracing::debug!(method, attempt, %error, retryable, "provider call failed");
                    last_error = error;
                    if !retryable || attempt == self.config.retries.max(1) {
                        break;
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
            }
        }
        Err(last_error)
    }

    async fn call_once(&self, url: &str, params: &Value) -> Result<Value, ChatApiError> {
        let response = self
            .client
            .post(url)
            .json(params)
            .send()
            .await
            .map_err(|error| ChatApiError::network(error.to_string()))?;
        let status = response.status().as_u16();
        let body: Value = response
            .json()
            .await
            .map_err(|error| ChatApiError::http(status, format!("malformed response: {error}")))?;
        if status >= 400 {
            let description = body
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("provider returned an error status");
            return Err(ChatApiError::http(status, description.to_string()));
        }
        if body.get("ok").and_then(Value::as_bool) != Some(true) {
            let description = body
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("provider response not ok");
            return Err(ChatApiError::http(status, description.to_string()));
        }
        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl ChatApi for TelegramApi {
    async fn get_updates(
        &self,
        offset: u64,
        timeout_secs: u64,
    ) -> Result<Vec<Value>, ChatApiError> {
        let result = self
            .call_method(
                "getUpdates",
                json!({ "offset": offset, "timeout": timeout_secs }),
            )
            .await?;
        result
            .as_array()
            .cloned()
            .ok_or_else(|| ChatApiError::http(200, "getUpdates result is not an array"))
    }

    async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        reply_markup: Option<Value>,
    ) -> Result<Value, ChatApiError> {
        let mut params = json!({ "chat_id": chat_id, "text": text });
        if let Some(markup) = reply_markup {
            params["reply_markup"] = markup;
        }
        self.call_method("sendMessage", params).await
    }

    async fn answer_callback(
        &self,
        callback_query_id: &str,
        text: Option<&str>,
    ) -> Result<Value, ChatApiError> {
        let mut params = json!({ "callback_query_id": callback_query_id });
        if let Some(text) = text {
            params["text"] = json!(text);
        }
        self.call_method("answerCallbackQuery", params).await
    }

    async fn edit_message_text(
        &self,
        chat_id: &str,
        message_id: &str,
        text: &str,
        reply_markup: Option<Value>,
    ) -> Result<Value, ChatApiError> {
        let mut params = json!({ "chat_id": chat_id, "message_id": message_id, "text": text });
        if let Some(markup) = reply_markup {
            params["reply_markup"] = markup;
        }
        self.call_method("editMessageText", params).await
    }

    async fn send_chat_action(&self, chat_id: &str, action: &str) -> Result<Value, ChatApiError> {
        self.call_method("sendChatAction", json!({ "chat_id": chat_id, "action": action }))
            .await
    }
}

/// Highest `update_id` in a batch plus one, or `None` for an empty batch.
pub fn next_offset(updates: &[Value]) -> Option<u64> {
    updates
        .iter()
        .filter_map(|update| update.get("update_id").and_then(Value::as_u64))
        .max()
        .map(|max_id| max_id.saturating_add(1))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OffsetStateFile {
    schema_version: u32,
    #[serde(default)]
    next_update_offset: u64,
}

/// Durable long-poll offset, written atomically after every successful batch.
#[derive(Debug, Clone)]
pub struct OffsetStore {
    path: PathBuf,
}

impl OffsetStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn load(&self) -> Result<u64> {
        if !self.path.exists() {
            return Ok(0);
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let state: OffsetStateFile = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", self.path.display()))?;
        Ok(state.next_update_offset)
    }

    pub fn save(&self, next_update_offset: u64) -> Result<()> {
        write_json_atomic(
            &self.path,
            &OffsetStateFile {
                schema_version: OFFSET_STATE_SCHEMA_VERSION,
                next_update_offset,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn api(base: String) -> TelegramApi {
        TelegramApi::new(TelegramConfig {
            api_base: base,
            bot_token: "test-token".to_string(),
            retries: 3,
            base_backoff: Duration::from_millis(1),
            http_timeout: Duration::from_secs(5),
        })
        .expect("client")
    }

    #[tokio::test]
    async fn get_updates_returns_result_array() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/bottest-token/getUpdates");
            then.status(200).json_body(serde_json::json!({
                "ok": true,
                "result": [
                    { "update_id": 7, "message": { "text": "hi" } },
                    { "update_id": 8, "message": { "text": "yo" } }
                ]
            }));
        });

        let updates = api(server.base_url())
            .get_updates(0, 0)
            .await
            .expect("updates");
        mock.assert();
        assert_eq!(updates.len(), 2);
        assert_eq!(next_offset(&updates), Some(9));
    }

    #[tokio::test]
    async fn transient_failure_is_retried_until_success() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/bottest-token/sendMessage");
            then.status(500)
                .json_body(serde_json::json!({ "ok": false, "description": "boom" }));
        });

        let error = api(server.base_url())
            .send_message("42", "hello", None)
            .await
            .expect_err("all attempts fail");
        assert_eq!(error.status, Some(500));
        assert!(error.retryable());
        // Retried up to the configured attempt count.
        assert_eq!(mock.hits(), 3);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/bottest-token/answerCallbackQuery");
            then.status(400).json_body(serde_json::json!({
                "ok": false,
                "description": "query is too old"
            }));
        });

        let error = api(server.base_url())
            .answer_callback("cq-1", None)
            .await
            .expect_err("permanent failure");
        assert_eq!(error.status, Some(400));
        assert!(!error.retryable());
        assert_eq!(mock.hits(), 1);
    }

    #[tokio::test]
    async fn not_ok_body_with_200_is_an_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/bottest-token/sendChatAction");
            then.status(200)
                .json_body(serde_json::json!({ "ok": false, "description": "nope" }));
        });

        let error = api(server.base_url())
            .send_chat_action("42", "typing")
            .await
            .expect_err("not ok");
        assert_eq!(error.message, "nope");
    }

    #[test]
    fn offset_store_round_trips_and_defaults_to_zero() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let store = OffsetStore::new(tempdir.path().join("offset.json"));
        assert_eq!(store.load().expect("empty load"), 0);
        store.save(123).expect("save");
        assert_eq!(store.load().expect("load"), 123);
    }
}
