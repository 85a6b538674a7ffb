//! Kanban board access.
//!
//! The pipelines only see the [`BoardApi`] trait. [`TrelloClient`] implements
//! it over the Trello REST API with a bounded retry loop; tests use an
//! in-memory board.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::backoff::ExponentialBackoff;
use crate::error::{truncate_chars, Error, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
/// Longest response body quoted in an API error.
const ERROR_BODY_CHARS: usize = 500;
/// Attachment downloads from this domain and its subdomains carry credentials.
const BOARD_DOMAIN: &str = "trello.com";

/// A card as listed in a column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub id: String,
    #[serde(rename = "name")]
    pub title: String,
    #[serde(rename = "desc", default)]
    pub description: String,
    #[serde(default)]
    pub url: String,
}

/// A comment on a card, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
    pub id: String,
    pub date: String,
    pub author: String,
    pub text: String,
}

/// A card attachment: either an uploaded file or a plain link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub is_upload: bool,
    #[serde(default)]
    pub bytes: Option<u64>,
}

/// A board column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub id: String,
    pub name: String,
}

/// Card fields to overwrite. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CardUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
}

impl CardUpdate {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.description.is_none()
    }
}

/// Board operations the pipelines depend on.
///
/// Implementations apply their own retries; an error returned here is final.
#[async_trait]
pub trait BoardApi: Send + Sync {
    async fn list_columns(&self, board_id: &str) -> Result<Vec<Column>>;

    async fn list_cards(&self, column_id: &str) -> Result<Vec<Card>>;

    async fn card_comments(&self, card_id: &str) -> Result<Vec<Comment>>;

    async fn card_attachments(&self, card_id: &str) -> Result<Vec<Attachment>>;

    async fn move_card(&self, card_id: &str, column_id: &str) -> Result<()>;

    async fn add_comment(&self, card_id: &str, text: &str) -> Result<()>;

    async fn update_card(&self, card_id: &str, update: &CardUpdate) -> Result<()>;

    async fn attach_url(&self, card_id: &str, url: &str, name: &str) -> Result<()>;

    /// Downloads an uploaded attachment, refusing files over `max_bytes`.
    async fn download_attachment(&self, url: &str, max_bytes: u64) -> Result<Vec<u8>>;
}

/// Comment action as returned by `/cards/{id}/actions?filter=commentCard`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentAction {
    id: String,
    date: String,
    member_creator: Option<MemberCreator>,
    data: CommentData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemberCreator {
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct CommentData {
    #[serde(default)]
    text: String,
}

impl From<CommentAction> for Comment {
    fn from(action: CommentAction) -> Self {
        Comment {
            id: action.id,
            date: action.date,
            author: action
                .member_creator
                .map(|m| m.full_name)
                .unwrap_or_else(|| "unknown".to_string()),
            text: action.data.text,
        }
    }
}

/// Trello REST client.
#[derive(Clone)]
pub struct TrelloClient {
    client: Client,
    base_url: String,
    api_key: String,
    token: String,
    initial_backoff: Duration,
}

impl std::fmt::Debug for TrelloClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrelloClient")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("token", &"<redacted>")
            .finish()
    }
}

impl TrelloClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        token: impl Into<String>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            token: token.into(),
            initial_backoff: INITIAL_BACKOFF,
        })
    }

    /// Overrides the first retry delay.
    pub fn with_initial_backoff(mut self, delay: Duration) -> Self {
        self.initial_backoff = delay;
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn auth(&self) -> [(&'static str, &str); 2] {
        [("key", self.api_key.as_str()), ("token", self.token.as_str())]
    }

    /// Credentials are only sent to the API origin or a `trello.com` host.
    fn needs_auth(&self, url: &str) -> bool {
        let Ok(target) = Url::parse(url) else {
            return false;
        };
        let Some(host) = target.host_str() else {
            return false;
        };
        let same_origin = Url::parse(&self.base_url).is_ok_and(|base| {
            base.host_str() == Some(host)
                && base.port_or_known_default() == target.port_or_known_default()
        });
        same_origin || host == BOARD_DOMAIN || host.ends_with(&format!(".{}", BOARD_DOMAIN))
    }

    /// Sends a request, retrying on 429, 5xx and transport failures.
    async fn send(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
        authenticate: bool,
    ) -> Result<reqwest::Response> {
        let mut backoff = ExponentialBackoff::new(self.initial_backoff, MAX_ATTEMPTS);
        loop {
            let mut request = self.client.request(method.clone(), url).query(query);
            if authenticate {
                request = request.query(&self.auth());
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            let failure = match request.send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    let message = format!(
                        "{} {} returned {}: {}",
                        method,
                        path_of(url),
                        status,
                        truncate_chars(&text, ERROR_BODY_CHARS)
                    );
                    if !is_retryable_status(status) {
                        return Err(Error::Api(message));
                    }
                    message
                }
                Err(e) if e.is_timeout() || e.is_connect() || e.is_request() => {
                    format!("{} {} failed: {}", method, path_of(url), e)
                }
                Err(e) => {
                    return Err(Error::Api(format!("{} {} failed: {}", method, path_of(url), e)))
                }
            };

            match backoff.next_delay() {
                Some(delay) => {
                    tracing::warn!(
                        error = %failure,
                        attempt = backoff.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        "board request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => return Err(Error::Api(failure)),
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let url = self.endpoint(path);
        let response = self.send(Method::GET, &url, query, None, true).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| Error::Api(format!("malformed response from {}: {}", path, e)))
    }

    async fn write(&self, method: Method, path: &str, body: Value) -> Result<()> {
        let url = self.endpoint(path);
        self.send(method, &url, &[], Some(&body), true).await?;
        Ok(())
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// The URL without its query string, for messages that must not carry credentials.
fn path_of(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

#[async_trait]
impl BoardApi for TrelloClient {
    async fn list_columns(&self, board_id: &str) -> Result<Vec<Column>> {
        self.get_json(&format!("boards/{}/lists", board_id), &[]).await
    }

    async fn list_cards(&self, column_id: &str) -> Result<Vec<Card>> {
        self.get_json(&format!("lists/{}/cards", column_id), &[]).await
    }

    async fn card_comments(&self, card_id: &str) -> Result<Vec<Comment>> {
        let actions: Vec<CommentAction> = self
            .get_json(
                &format!("cards/{}/actions", card_id),
                &[("filter", "commentCard")],
            )
            .await?;
        // Trello lists newest first.
        Ok(actions.into_iter().rev().map(Comment::from).collect())
    }

    async fn card_attachments(&self, card_id: &str) -> Result<Vec<Attachment>> {
        self.get_json(&format!("cards/{}/attachments", card_id), &[])
            .await
    }

    async fn move_card(&self, card_id: &str, column_id: &str) -> Result<()> {
        self.write(
            Method::PUT,
            &format!("cards/{}", card_id),
            json!({ "idList": column_id }),
        )
        .await
    }

    async fn add_comment(&self, card_id: &str, text: &str) -> Result<()> {
        self.write(
            Method::POST,
            &format!("cards/{}/actions/comments", card_id),
            json!({ "text": text }),
        )
        .await
    }

    async fn update_card(&self, card_id: &str, update: &CardUpdate) -> Result<()> {
        let mut body = serde_json::Map::new();
        if let Some(title) = &update.title {
            body.insert("name".to_string(), Value::String(title.clone()));
        }
        if let Some(description) = &update.description {
            body.insert("desc".to_string(), Value::String(description.clone()));
        }
        if body.is_empty() {
            return Ok(());
        }
        self.write(Method::PUT, &format!("cards/{}", card_id), Value::Object(body))
            .await
    }

    async fn attach_url(&self, card_id: &str, url: &str, name: &str) -> Result<()> {
        self.write(
            Method::POST,
            &format!("cards/{}/attachments", card_id),
            json!({ "url": url, "name": name }),
        )
        .await
    }

    async fn download_attachment(&self, url: &str, max_bytes: u64) -> Result<Vec<u8>> {
        let response = self
            .send(Method::GET, url, &[], None, self.needs_auth(url))
            .await?;

        if let Some(length) = response.content_length() {
            if length > max_bytes {
                return Err(Error::Api(format!(
                    "file too large: {} bytes (limit: {})",
                    length, max_bytes
                )));
            }
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::Api(format!("download of {} failed: {}", path_of(url), e)))?;
        if bytes.len() as u64 > max_bytes {
            return Err(Error::Api(format!(
                "file too large: {} bytes (limit: {})",
                bytes.len(),
                max_bytes
            )));
        }
        Ok(bytes.to_vec())
    }
}
