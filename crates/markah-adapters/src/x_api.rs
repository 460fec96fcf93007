use std::collections::HashMap;
use std::env;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use markah_core::{ExternalCollection, ExternalItem};
use markah_storage::{
    build_http_client, classify_reqwest_error, classify_status, BackoffPolicy, HttpClientConfig,
    RetryDisposition,
};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info_span, Instrument};

use crate::{ExternalPlatform, ItemsPageRequest, Page, PlatformError, TokenGrant};

pub const DEFAULT_X_API_BASE_URL: &str = "https://api.twitter.com";

const ITEM_FIELDS: &str = "id,text,created_at,author_id";
const AUTHOR_FIELDS: &str = "username,name";

#[derive(Debug, Clone)]
pub struct XApiConfig {
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub http: HttpClientConfig,
    /// Retries for transport failures and 5xx; 429 is never retried here.
    pub backoff: BackoffPolicy,
}

impl XApiConfig {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_X_API_BASE_URL.to_string(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            http: HttpClientConfig::default(),
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(2),
            },
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_http(mut self, http: HttpClientConfig) -> Self {
        self.http = http;
        self
    }

    /// Reads `X_CLIENT_ID`, `X_CLIENT_SECRET` and `X_API_BASE_URL`. HTTP
    /// settings stay at their defaults; callers pass theirs via [`Self::with_http`].
    pub fn from_env() -> Result<Self, PlatformError> {
        let client_id = non_empty_env("X_CLIENT_ID");
        let client_secret = non_empty_env("X_CLIENT_SECRET");
        let (Some(client_id), Some(client_secret)) = (client_id, client_secret) else {
            return Err(PlatformError::Configuration(
                "X integration not configured: X_CLIENT_ID and X_CLIENT_SECRET are required"
                    .to_string(),
            ));
        };

        let mut config = Self::new(client_id, client_secret);
        if let Some(base_url) = non_empty_env("X_API_BASE_URL") {
            config = config.with_base_url(base_url);
        }
        Ok(config)
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Live client for the X v2 API.
#[derive(Debug, Clone)]
pub struct XApiClient {
    client: reqwest::Client,
    config: XApiConfig,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: i64,
}

#[derive(Debug, Default, Deserialize)]
struct Meta {
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct XTweet {
    id: String,
    text: String,
    created_at: Option<DateTime<Utc>>,
    author_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct XUser {
    id: String,
    username: String,
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct Includes {
    #[serde(default)]
    users: Vec<XUser>,
}

#[derive(Debug, Deserialize)]
struct BookmarksResponse {
    #[serde(default)]
    data: Vec<XTweet>,
    #[serde(default)]
    includes: Includes,
    #[serde(default)]
    meta: Meta,
}

#[derive(Debug, Deserialize)]
struct FolderEntry {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct FoldersResponse {
    #[serde(default)]
    data: Vec<FolderEntry>,
    #[serde(default)]
    meta: Meta,
}

#[derive(Debug, Deserialize)]
struct IdEntry {
    id: String,
}

#[derive(Debug, Deserialize)]
struct FolderItemsResponse {
    #[serde(default)]
    data: Vec<IdEntry>,
    #[serde(default)]
    meta: Meta,
}

impl XApiClient {
    pub fn new(config: XApiConfig) -> Result<Self, PlatformError> {
        let client = build_http_client(&config.http)
            .map_err(|err| PlatformError::Configuration(format!("{err:#}")))?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        access_token: &str,
        query: &[(&str, String)],
    ) -> Result<T, PlatformError> {
        let url = self.url(endpoint);
        let backoff = self.config.backoff;

        for attempt in 0..=backoff.max_retries {
            let sent = self
                .client
                .get(&url)
                .bearer_auth(access_token)
                .query(query)
                .send()
                .await;

            match sent {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return resp
                            .json::<T>()
                            .await
                            .map_err(|err| PlatformError::Decode(format!("{endpoint}: {err}")));
                    }
                    if status == StatusCode::TOO_MANY_REQUESTS {
                        return Err(PlatformError::RateLimited {
                            endpoint: endpoint.to_string(),
                        });
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < backoff.max_retries
                    {
                        debug!(%status, attempt, "retrying X API request");
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(PlatformError::Status {
                        status: status.as_u16(),
                        endpoint: endpoint.to_string(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < backoff.max_retries
                    {
                        debug!(%err, attempt, "retrying X API request after transport error");
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(PlatformError::Http(err));
                }
            }
        }

        Err(PlatformError::Decode(format!(
            "{endpoint}: retry loop exited without a response"
        )))
    }
}

fn items_from_response(body: BookmarksResponse) -> Vec<ExternalItem> {
    let authors = body
        .includes
        .users
        .into_iter()
        .map(|user| (user.id.clone(), user))
        .collect::<HashMap<_, _>>();

    body.data
        .into_iter()
        .map(|tweet| {
            let author = tweet.author_id.as_ref().and_then(|id| authors.get(id));
            let author_handle = author.map_or("unknown", |a| a.username.as_str()).to_string();
            let author_name = author.map_or("Unknown", |a| a.name.as_str()).to_string();
            ExternalItem {
                url: format!("https://x.com/{author_handle}/status/{}", tweet.id),
                external_id: tweet.id,
                text: tweet.text,
                author_handle,
                author_name,
                created_at: tweet.created_at,
            }
        })
        .collect()
}

#[async_trait]
impl ExternalPlatform for XApiClient {
    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant, PlatformError> {
        let span = info_span!("x_token_refresh");
        async {
            let resp = self
                .client
                .post(self.url("/2/oauth2/token"))
                .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
                .form(&[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", refresh_token),
                ])
                .send()
                .await?;

            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(PlatformError::TokenRejected {
                    status: status.as_u16(),
                    body,
                });
            }

            let token: TokenResponse = resp
                .json()
                .await
                .map_err(|err| PlatformError::Decode(format!("token response: {err}")))?;
            Ok(TokenGrant {
                access_token: token.access_token,
                refresh_token: token.refresh_token,
                expires_in: token.expires_in,
            })
        }
        .instrument(span)
        .await
    }

    async fn fetch_items_page(
        &self,
        request: ItemsPageRequest<'_>,
    ) -> Result<Page<ExternalItem>, PlatformError> {
        let mut query = vec![
            ("tweet.fields", ITEM_FIELDS.to_string()),
            ("expansions", "author_id".to_string()),
            ("user.fields", AUTHOR_FIELDS.to_string()),
            ("max_results", request.page_size.to_string()),
        ];
        if let Some(since_id) = request.since_id {
            query.push(("since_id", since_id.to_string()));
        }
        if let Some(cursor) = request.cursor {
            query.push(("pagination_token", cursor.to_string()));
        }

        let endpoint = format!("/2/users/{}/bookmarks", request.account_id);
        let body: BookmarksResponse = self
            .get_json(&endpoint, request.access_token, &query)
            .instrument(info_span!("x_bookmarks_page", page_size = request.page_size))
            .await?;
        let next_cursor = body.meta.next_token.clone();
        Ok(Page {
            items: items_from_response(body),
            next_cursor,
        })
    }

    async fn fetch_collections_page(
        &self,
        access_token: &str,
        account_id: &str,
        cursor: Option<&str>,
    ) -> Result<Page<ExternalCollection>, PlatformError> {
        let mut query = Vec::new();
        if let Some(cursor) = cursor {
            query.push(("pagination_token", cursor.to_string()));
        }
        let endpoint = format!("/2/users/{account_id}/bookmarks/folders");
        let body: FoldersResponse = self
            .get_json(&endpoint, access_token, &query)
            .instrument(info_span!("x_bookmark_folders"))
            .await?;
        Ok(Page {
            items: body
                .data
                .into_iter()
                .map(|f| ExternalCollection { id: f.id, name: f.name })
                .collect(),
            next_cursor: body.meta.next_token,
        })
    }

    async fn fetch_collection_items_page(
        &self,
        access_token: &str,
        account_id: &str,
        collection_id: &str,
        cursor: Option<&str>,
    ) -> Result<Page<String>, PlatformError> {
        let mut query = Vec::new();
        if let Some(cursor) = cursor {
            query.push(("pagination_token", cursor.to_string()));
        }
        let endpoint = format!("/2/users/{account_id}/bookmarks/folders/{collection_id}");
        let body: FolderItemsResponse = self
            .get_json(&endpoint, access_token, &query)
            .instrument(info_span!("x_bookmark_folder_items", collection_id))
            .await?;
        Ok(Page {
            items: body.data.into_iter().map(|entry| entry.id).collect(),
            next_cursor: body.meta.next_token,
        })
    }
}
