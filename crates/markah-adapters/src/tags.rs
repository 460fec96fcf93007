use std::env;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

const SYSTEM_PROMPT: &str = "You are a bookmark tagging assistant. Given a bookmark's title, \
description, and URL, suggest 3-5 relevant tags. Tags must be lowercase, single-word or \
hyphenated (e.g. 'javascript', 'machine-learning'). Return ONLY a JSON array of strings, no \
other text. Example: [\"javascript\", \"tutorial\", \"web-dev\"]";

const MAX_SUGGESTED_TAGS: usize = 5;

/// Best-effort tag suggestion for a freshly imported bookmark.
#[async_trait]
pub trait TagSuggester: Send + Sync {
    fn provider_id(&self) -> &'static str;

    async fn suggest_tags(&self, title: &str, description: &str, url: &str) -> Result<Vec<String>>;
}

pub fn build_user_prompt(title: &str, description: &str, url: &str) -> String {
    format!("Title: {title}\nDescription: {description}\nURL: {url}")
}

fn is_tag_shaped(tag: &str) -> bool {
    !tag.is_empty()
        && tag.split('-').all(|part| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        })
}

/// Pulls the first JSON string array out of free-form model output.
///
/// Tags are lowercased and trimmed; anything that is not a lowercase,
/// hyphen-joined alphanumeric word is dropped. At most five are kept.
pub fn parse_tags(text: &str) -> Vec<String> {
    let Some(start) = text.find('[') else {
        return Vec::new();
    };
    let Some(len) = text[start..].find(']') else {
        return Vec::new();
    };
    let Ok(values) = serde_json::from_str::<Vec<serde_json::Value>>(&text[start..=start + len])
    else {
        return Vec::new();
    };

    values
        .into_iter()
        .filter_map(|value| value.as_str().map(|s| s.trim().to_lowercase()))
        .filter(|tag| is_tag_shaped(tag))
        .take(MAX_SUGGESTED_TAGS)
        .collect()
}

/// Used when no provider is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTagSuggester;

#[async_trait]
impl TagSuggester for NoopTagSuggester {
    fn provider_id(&self) -> &'static str {
        "none"
    }

    async fn suggest_tags(&self, _title: &str, _description: &str, _url: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Clone)]
pub struct AnthropicTagSuggester {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl AnthropicTagSuggester {
    pub fn new(client: reqwest::Client, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            base_url: "https://api.anthropic.com".to_string(),
            model: "claude-haiku-4-5-20251001".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicContent>,
}

#[async_trait]
impl TagSuggester for AnthropicTagSuggester {
    fn provider_id(&self) -> &'static str {
        "claude"
    }

    async fn suggest_tags(&self, title: &str, description: &str, url: &str) -> Result<Vec<String>> {
        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&json!({
                "model": self.model,
                "max_tokens": 256,
                "system": SYSTEM_PROMPT,
                "messages": [
                    { "role": "user", "content": build_user_prompt(title, description, url) }
                ],
            }))
            .send()
            .await
            .context("calling anthropic messages api")?;
        if !resp.status().is_success() {
            bail!("anthropic messages api returned {}", resp.status());
        }
        let body: AnthropicResponse = resp.json().await.context("decoding anthropic response")?;
        let text = body
            .content
            .into_iter()
            .find(|block| block.kind == "text")
            .map(|block| block.text)
            .unwrap_or_default();
        Ok(parse_tags(&text))
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiTagSuggester {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiTagSuggester {
    pub fn new(client: reqwest::Client, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            base_url: "https://api.openai.com".to_string(),
            model: "gpt-4o-mini".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[derive(Debug, Default, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    #[serde(default)]
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
}

#[async_trait]
impl TagSuggester for OpenAiTagSuggester {
    fn provider_id(&self) -> &'static str {
        "openai"
    }

    async fn suggest_tags(&self, title: &str, description: &str, url: &str) -> Result<Vec<String>> {
        let resp = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "max_tokens": 256,
                "messages": [
                    { "role": "system", "content": SYSTEM_PROMPT },
                    { "role": "user", "content": build_user_prompt(title, description, url) }
                ],
            }))
            .send()
            .await
            .context("calling openai chat completions")?;
        if !resp.status().is_success() {
            bail!("openai chat completions returned {}", resp.status());
        }
        let body: OpenAiResponse = resp.json().await.context("decoding openai response")?;
        let text = body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();
        Ok(parse_tags(&text))
    }
}

#[derive(Debug, Clone)]
pub struct OllamaTagSuggester {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaTagSuggester {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            model: model.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    #[serde(default)]
    message: ChatMessage,
}

#[async_trait]
impl TagSuggester for OllamaTagSuggester {
    fn provider_id(&self) -> &'static str {
        "ollama"
    }

    async fn suggest_tags(&self, title: &str, description: &str, url: &str) -> Result<Vec<String>> {
        let resp = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&json!({
                "model": self.model,
                "stream": false,
                "messages": [
                    { "role": "system", "content": SYSTEM_PROMPT },
                    { "role": "user", "content": build_user_prompt(title, description, url) }
                ],
            }))
            .send()
            .await
            .context("calling ollama chat")?;
        if !resp.status().is_success() {
            bail!("ollama chat returned {}", resp.status());
        }
        let body: OllamaResponse = resp.json().await.context("decoding ollama response")?;
        Ok(parse_tags(&body.message.content.unwrap_or_default()))
    }
}

/// Provider selection read from `LLM_PROVIDER`, `LLM_API_KEY`,
/// `OLLAMA_BASE_URL` and `OLLAMA_MODEL`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagProviderConfig {
    pub provider: Option<String>,
    pub api_key: Option<String>,
    pub ollama_base_url: Option<String>,
    pub ollama_model: Option<String>,
}

impl TagProviderConfig {
    pub fn from_env() -> Self {
        let read = |key: &str| env::var(key).ok().filter(|v| !v.trim().is_empty());
        Self {
            provider: read("LLM_PROVIDER").map(|p| p.to_lowercase()),
            api_key: read("LLM_API_KEY"),
            ollama_base_url: read("OLLAMA_BASE_URL"),
            ollama_model: read("OLLAMA_MODEL"),
        }
    }

    /// Unknown providers, or hosted providers without a key, fall back to no-op.
    pub fn build(&self, client: reqwest::Client) -> Arc<dyn TagSuggester> {
        let suggester: Arc<dyn TagSuggester> = match (self.provider.as_deref(), &self.api_key) {
            (Some("claude"), Some(key)) => Arc::new(AnthropicTagSuggester::new(client, key)),
            (Some("openai"), Some(key)) => Arc::new(OpenAiTagSuggester::new(client, key)),
            (Some("ollama"), _) => Arc::new(OllamaTagSuggester::new(
                client,
                self.ollama_base_url
                    .clone()
                    .unwrap_or_else(|| "http://localhost:11434".to_string()),
                self.ollama_model
                    .clone()
                    .unwrap_or_else(|| "llama3.2".to_string()),
            )),
            _ => Arc::new(NoopTagSuggester),
        };
        debug!(provider = suggester.provider_id(), "tag suggester selected");
        suggester
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn parses_first_array_and_filters_bad_tags() {
        let text = r#"Sure! ["Rust", "async-io", "not valid", "-x", 7, "web-dev"] and ["later"]"#;
        assert_eq!(parse_tags(text), vec!["rust", "async-io", "web-dev"]);
    }

    #[test]
    fn keeps_at_most_five() {
        let text = r#"["a","b","c","d","e","f"]"#;
        assert_eq!(parse_tags(text).len(), 5);
    }

    #[test]
    fn garbage_yields_no_tags() {
        assert!(parse_tags("no tags here").is_empty());
        assert!(parse_tags("[not json]").is_empty());
    }

    #[test]
    fn config_without_key_falls_back_to_noop() {
        let config = TagProviderConfig {
            provider: Some("claude".into()),
            ..Default::default()
        };
        let suggester = config.build(reqwest::Client::new());
        assert_eq!(suggester.provider_id(), "none");

        let ollama = TagProviderConfig {
            provider: Some("ollama".into()),
            ..Default::default()
        };
        assert_eq!(ollama.build(reqwest::Client::new()).provider_id(), "ollama");
    }

    #[tokio::test]
    async fn anthropic_provider_reads_text_block() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "key"))
            .and(header("anthropic-version", "2023-06-01"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [{ "type": "text", "text": "[\"rust\", \"databases\"]" }]
            })))
            .mount(&server)
            .await;

        let suggester =
            AnthropicTagSuggester::new(reqwest::Client::new(), "key").with_base_url(server.uri());
        let tags = suggester
            .suggest_tags("Postgres in Rust", "", "https://x.com/a/status/1")
            .await
            .unwrap();
        assert_eq!(tags, vec!["rust", "databases"]);
    }

    #[tokio::test]
    async fn ollama_failure_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let suggester = OllamaTagSuggester::new(reqwest::Client::new(), server.uri(), "llama3.2");
        assert!(suggester.suggest_tags("t", "d", "u").await.is_err());
    }
}
