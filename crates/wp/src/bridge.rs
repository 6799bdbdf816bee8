use reqwest::{Client, Method, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use reply_gate_core::types::{CommentStatus, ReplySettings};

/// Client for the bridge REST endpoints the blog-side companion plugin
/// exposes: settings lookup, reply-address resolution, and comment creation.
#[derive(Clone)]
pub struct BridgeClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl BridgeClient {
    /// Creates a new bridge client with the provided configuration.
    pub fn new(base_url: Url, token: impl Into<String>, http: Client) -> Self {
        Self {
            http,
            base_url,
            token: token.into(),
        }
    }

    /// Fetches the install's reply-handling settings.
    pub async fn fetch_settings(&self) -> Result<ReplySettings, BridgeError> {
        let url = self.base_url.join("settings")?;
        let response = self.authorized_request(Method::GET, url).send().await?;
        parse_json(response).await
    }

    /// Resolves a per-message reply address back to the subscription it was
    /// minted for. A `404` means the address is unknown and maps to
    /// `Ok(None)` rather than an error.
    pub async fn resolve_reply_address(
        &self,
        email: &str,
    ) -> Result<Option<SubscriptionContext>, BridgeError> {
        let mut url = self.base_url.join("subscriptions/resolve")?;
        url.query_pairs_mut().append_pair("email", email);

        let response = self.authorized_request(Method::GET, url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        parse_json(response).await.map(Some)
    }

    /// Submits the reply as a new comment on the resolved thread.
    ///
    /// Failures are surfaced as-is; the pipeline never retries them.
    pub async fn create_reply(
        &self,
        comment: &NewReplyComment<'_>,
    ) -> Result<CreatedComment, BridgeError> {
        let url = self.base_url.join("comments")?;
        let response = self
            .authorized_request(Method::POST, url)
            .json(comment)
            .send()
            .await?;
        parse_json(response).await
    }

    fn authorized_request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header("Authorization", format!("Bearer {}", self.token))
    }
}

/// Parent thread context a reply address resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubscriptionContext {
    /// Opaque subscription key the address was minted for.
    pub sub_key: String,
    pub post_id: u64,
    #[serde(default)]
    pub comment_parent_id: Option<u64>,
}

/// Payload for creating a reply comment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewReplyComment<'a> {
    pub post_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment_parent_id: Option<u64>,
    pub author_name: &'a str,
    pub author_email: &'a str,
    pub subject: &'a str,
    pub body: &'a str,
    /// Only present when the trust policy forced a status; absent means the
    /// host applies its default moderation status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<CommentStatus>,
}

/// Identifier of the created comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct CreatedComment {
    pub comment_id: u64,
}

/// Errors produced by the bridge client.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

async fn parse_json<T>(response: Response) -> Result<T, BridgeError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(BridgeError::Status { status, body });
    }

    Ok(response.json().await?)
}
