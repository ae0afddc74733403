use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, error, warn};

use crate::providers::ProviderError;
use crate::traits::{ChatMessage, LanguageModel, ModelOptions, Role};

pub struct OpenAiCompatibleProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

/// Validate the base URL for security.
/// - HTTPS is required for remote URLs to protect API keys in transit
/// - HTTP is allowed only for localhost/127.0.0.1 (local LLM servers)
fn validate_base_url(base_url: &str) -> Result<(), String> {
    let parsed = reqwest::Url::parse(base_url)
        .map_err(|e| format!("Invalid base_url '{}': {}", base_url, e))?;

    let scheme = parsed.scheme();
    let host = parsed.host_str().unwrap_or("");

    match scheme {
        "https" => Ok(()),
        "http" => {
            let is_localhost =
                host == "localhost" || host == "127.0.0.1" || host == "[::1]" || host == "::1";

            if is_localhost {
                warn!(
                    "Using unencrypted HTTP for local LLM server at '{}'. \
                     API key will be transmitted in cleartext.",
                    base_url
                );
                Ok(())
            } else {
                Err(format!(
                    "HTTP is not allowed for remote URLs (base_url: '{}'). \
                     Use HTTPS to protect your API key in transit. \
                     HTTP is only permitted for localhost.",
                    base_url
                ))
            }
        }
        _ => Err(format!(
            "Unsupported URL scheme '{}' in base_url '{}'. Only http and https are allowed.",
            scheme, base_url
        )),
    }
}

impl OpenAiCompatibleProvider {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, String> {
        validate_base_url(base_url)?;

        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| format!("Failed to build HTTP client: {}", e))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &ModelOptions,
        timezone: &str,
        reference_time: DateTime<Utc>,
    ) -> anyhow::Result<String> {
        let mut wire_messages: Vec<Value> = vec![json!({
            "role": "system",
            "content": format!(
                "The user's timezone is {timezone}. Their message arrived at {}. \
                 Resolve relative dates and times against that moment.",
                reference_time.to_rfc3339(),
            ),
        })];
        wire_messages.extend(messages.iter().map(|m| {
            json!({
                "role": match m.role {
                    Role::System => "system",
                    Role::User => "user",
                },
                "content": m.content,
            })
        }));

        let mut body = json!({
            "model": options.model,
            "messages": wire_messages,
            "temperature": options.temperature,
        });
        if let Some(top_p) = options.top_p {
            body["top_p"] = json!(top_p);
        }

        let url = format!("{}/chat/completions", self.base_url);
        debug!(model = %options.model, url = %url, "Calling LLM API");

        let text = match self.request(&url, &body).await {
            Ok(text) => text,
            Err(err) if err.is_retryable() => {
                let wait_secs = err.retry_after_secs.unwrap_or(2);
                warn!(wait_secs, "Transient provider error, retrying once: {err}");
                tokio::time::sleep(Duration::from_secs(wait_secs)).await;
                self.request(&url, &body).await?
            }
            Err(err) => return Err(err.into()),
        };

        let data: Value = serde_json::from_str(&text)?;
        let content = data["choices"]
            .get(0)
            .and_then(|c| c["message"]["content"].as_str())
            .ok_or_else(|| anyhow::anyhow!("No content in response"))?;
        Ok(content.to_string())
    }

    async fn request(&self, url: &str, body: &Value) -> Result<String, ProviderError> {
        let resp = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                error!("HTTP request failed: {}", e);
                ProviderError::network(&e)
            })?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| ProviderError::network(&e))?;

        if !status.is_success() {
            error!(status = %status, "Provider API error: {}", text);
            return Err(ProviderError::from_status(status.as_u16(), &text));
        }
        Ok(text)
    }
}

#[async_trait]
impl LanguageModel for OpenAiCompatibleProvider {
    async fn prompt_for_json(
        &self,
        messages: &[ChatMessage],
        options: &ModelOptions,
        timezone: &str,
        reference_time: DateTime<Utc>,
    ) -> Option<String> {
        match self.complete(messages, options, timezone, reference_time).await {
            Ok(content) => Some(strip_code_fences(&content).to_string()),
            Err(err) => {
                warn!("LLM JSON prompt failed, degrading: {err}");
                None
            }
        }
    }

    async fn prompt_for_text(
        &self,
        messages: &[ChatMessage],
        options: &ModelOptions,
        timezone: &str,
        reference_time: DateTime<Utc>,
    ) -> Option<String> {
        match self.complete(messages, options, timezone, reference_time).await {
            Ok(content) => Some(content),
            Err(err) => {
                warn!("LLM text prompt failed, degrading: {err}");
                None
            }
        }
    }
}

/// Models often wrap JSON answers in markdown code fences despite
/// instructions not to.
fn strip_code_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open.strip_suffix("```").unwrap_or(without_open).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn https_accepted() {
        assert!(validate_base_url("https://api.openai.com").is_ok());
    }

    #[test]
    fn http_localhost_accepted() {
        assert!(validate_base_url("http://localhost:8080").is_ok());
        assert!(validate_base_url("http://127.0.0.1:1234").is_ok());
        assert!(validate_base_url("http://[::1]:8080").is_ok());
    }

    #[test]
    fn http_remote_rejected() {
        let err = validate_base_url("http://api.example.com").unwrap_err();
        assert!(err.contains("HTTP is not allowed"));
    }

    #[test]
    fn unsupported_scheme_rejected() {
        let err = validate_base_url("ftp://example.com").unwrap_err();
        assert!(err.contains("Unsupported URL scheme"));
    }

    #[test]
    fn trailing_slash_trimmed() {
        let provider = OpenAiCompatibleProvider::new("https://api.openai.com/v1/", "test-key").unwrap();
        assert!(!provider.base_url.ends_with('/'));
    }

    #[test]
    fn code_fences_stripped() {
        assert_eq!(strip_code_fences("```json\n[1, 2]\n```"), "[1, 2]");
        assert_eq!(strip_code_fences("```\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_code_fences("[1, 2]"), "[1, 2]");
    }
}
