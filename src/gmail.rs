//! Gmail API handler
//!
//! Stateless HTTP client over the Gmail REST API. The only cached state is
//! the OAuth2 access token, which is refreshed from the account's refresh
//! token shortly before it expires.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use reqwest::{Client, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::sync::Mutex;

use crate::accounts::GmailAccount;
use crate::config::Timeouts;
use crate::errors::{AppError, AppResult};
use crate::handler::MailHandler;
use crate::mime;
use crate::models::{
    ListQuery, MessageDetail, MessageSummary, OutgoingMessage, SearchQuery, SendReceipt,
};
use crate::smtp;

const API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Refresh this long before the provider-reported expiry
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

const SUMMARY_HEADERS: [&str; 3] = ["Date", "From", "Subject"];

struct AccessToken {
    value: SecretString,
    expires_at: Instant,
}

impl AccessToken {
    fn is_fresh(&self, now: Instant) -> bool {
        now + TOKEN_REFRESH_MARGIN < self.expires_at
    }
}

pub struct GmailHandler {
    account: GmailAccount,
    client: Client,
    token: Mutex<Option<AccessToken>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListMessagesResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessage {
    id: String,
    #[serde(default)]
    snippet: Option<String>,
    #[serde(default)]
    label_ids: Vec<String>,
    #[serde(default)]
    payload: Option<MessagePayload>,
    #[serde(default)]
    raw: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagePayload {
    #[serde(default)]
    headers: Vec<PayloadHeader>,
}

#[derive(Debug, Deserialize)]
struct PayloadHeader {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LabelResponse {
    #[serde(default)]
    messages_unread: u64,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    id: String,
}

impl GmailHandler {
    /// Build a handler with an HTTP client bounded by the configured timeouts
    pub fn new(account: GmailAccount, timeouts: &Timeouts) -> AppResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_millis(timeouts.connect_ms))
            .timeout(Duration::from_millis(timeouts.http_ms))
            .build()
            .map_err(|e| AppError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            account,
            client,
            token: Mutex::new(None),
        })
    }

    /// Current access token, refreshing it when missing or about to expire
    async fn access_token(&self) -> AppResult<SecretString> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref()
            && token.is_fresh(Instant::now())
        {
            return Ok(token.value.clone());
        }

        let response = self
            .client
            .post(TOKEN_URL)
            .form(&[
                ("client_id", self.account.client_id.as_str()),
                ("client_secret", self.account.client_secret.expose_secret()),
                ("refresh_token", self.account.refresh_token.expose_secret()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            // Google answers 400 invalid_grant for revoked refresh tokens
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::AuthFailed(format!(
                "token refresh failed with status {status}: {}",
                body.trim()
            )));
        }
        let token: TokenResponse = response.json().await.map_err(map_transport_error)?;
        tracing::debug!(email = %self.account.email, expires_in = token.expires_in, "gmail access token refreshed");

        let value = SecretString::new(token.access_token.into());
        *cached = Some(AccessToken {
            value: value.clone(),
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        });
        Ok(value)
    }

    async fn execute<T: DeserializeOwned>(&self, request: RequestBuilder) -> AppResult<T> {
        let token = self.access_token().await?;
        let response = request
            .bearer_auth(token.expose_secret())
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status_error(status, &body));
        }
        response.json().await.map_err(map_transport_error)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> AppResult<T> {
        let request = self.client.get(format!("{API_BASE}/{path}")).query(query);
        self.execute(request).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: serde_json::Value) -> AppResult<T> {
        let request = self.client.post(format!("{API_BASE}/{path}")).json(&body);
        self.execute(request).await
    }

    async fn summaries(&self, q: Option<&str>, max_results: usize) -> AppResult<Vec<MessageSummary>> {
        let max = max_results.to_string();
        let mut query = vec![("maxResults", max.as_str())];
        match q {
            Some(q) => query.push(("q", q)),
            None => query.push(("labelIds", "INBOX")),
        }
        let listing: ListMessagesResponse = self.get("messages", &query).await?;

        let mut messages = Vec::with_capacity(listing.messages.len());
        for reference in listing.messages.into_iter().take(max_results) {
            let mut metadata_query = vec![("format", "metadata")];
            metadata_query.extend(SUMMARY_HEADERS.iter().map(|h| ("metadataHeaders", *h)));
            let message: GmailMessage = self
                .get(&message_path(&reference.id), &metadata_query)
                .await?;
            messages.push(summary_from_metadata(message));
        }
        Ok(messages)
    }
}

#[async_trait]
impl MailHandler for GmailHandler {
    async fn probe(&self, account_id: &str) -> AppResult<()> {
        let _: serde_json::Value = self.get("profile", &[]).await?;
        tracing::debug!(account = %account_id, "gmail probe succeeded");
        Ok(())
    }

    async fn list_messages(
        &self,
        _account_id: &str,
        query: ListQuery,
    ) -> AppResult<Vec<MessageSummary>> {
        let q = query.unread_only.then_some("in:inbox is:unread");
        self.summaries(q, query.max_results).await
    }

    async fn search_messages(
        &self,
        _account_id: &str,
        query: SearchQuery,
    ) -> AppResult<Vec<MessageSummary>> {
        if query.query.trim().is_empty() {
            return Err(AppError::invalid("search query must not be empty"));
        }
        self.summaries(Some(&query.query), query.max_results).await
    }

    async fn get_message(
        &self,
        _account_id: &str,
        message_id: &str,
        body_max_chars: usize,
    ) -> AppResult<MessageDetail> {
        validate_message_id(message_id)?;
        let message: GmailMessage = self
            .get(&message_path(message_id), &[("format", "raw")])
            .await?;
        let raw = message
            .raw
            .as_deref()
            .ok_or_else(|| AppError::Provider("Gmail returned no raw message".to_owned()))?;
        let parsed = mime::parse_message(&decode_raw(raw)?, body_max_chars)?;

        Ok(MessageDetail {
            message_id: message.id,
            date: parsed.date,
            from: parsed.from,
            to: parsed.to,
            cc: parsed.cc,
            subject: parsed.subject,
            labels: message.label_ids,
            body_text: parsed.body_text,
            attachments: parsed.attachments,
        })
    }

    async fn send_message(
        &self,
        _account_id: &str,
        message: OutgoingMessage,
    ) -> AppResult<SendReceipt> {
        let recipients = message.to.len() + message.cc.len() + message.bcc.len();
        let from = smtp::sender(&self.account.email, self.account.display_name.as_deref())?;
        let composed = smtp::compose(from, &message, true)?;
        let raw = URL_SAFE_NO_PAD.encode(composed.formatted());

        let sent: SentMessage = self.post("messages/send", json!({ "raw": raw })).await?;
        Ok(SendReceipt {
            message_id: Some(sent.id),
            recipients,
        })
    }

    async fn archive_message(&self, _account_id: &str, message_id: &str) -> AppResult<()> {
        validate_message_id(message_id)?;
        let _: serde_json::Value = self
            .post(
                &format!("{}/modify", message_path(message_id)),
                json!({ "removeLabelIds": ["INBOX"] }),
            )
            .await?;
        Ok(())
    }

    async fn unread_count(&self, _account_id: &str) -> AppResult<u64> {
        let label: LabelResponse = self.get("labels/INBOX", &[]).await?;
        Ok(label.messages_unread)
    }
}

fn message_path(message_id: &str) -> String {
    format!("messages/{}", urlencoding::encode(message_id))
}

fn validate_message_id(message_id: &str) -> AppResult<()> {
    if message_id.is_empty() || message_id.len() > 256 {
        return Err(AppError::invalid("message_id must be 1..256 characters"));
    }
    if message_id.starts_with("imap:") {
        return Err(AppError::invalid(
            "message_id belongs to an IMAP account, not a Gmail account",
        ));
    }
    Ok(())
}

fn summary_from_metadata(message: GmailMessage) -> MessageSummary {
    let headers: Vec<(String, String)> = message
        .payload
        .map(|p| p.headers.into_iter().map(|h| (h.name, h.value)).collect())
        .unwrap_or_default();
    MessageSummary {
        unread: message.label_ids.iter().any(|l| l == "UNREAD"),
        date: mime::header_value(&headers, "date"),
        from: mime::header_value(&headers, "from"),
        subject: mime::header_value(&headers, "subject"),
        snippet: message.snippet,
        message_id: message.id,
    }
}

/// Gmail emits unpadded base64url, but padded payloads are accepted too
fn decode_raw(raw: &str) -> AppResult<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(raw.as_bytes())
        .or_else(|_| URL_SAFE.decode(raw.as_bytes()))
        .map_err(|e| AppError::Provider(format!("invalid Gmail raw payload: {e}")))
}

fn map_transport_error(e: reqwest::Error) -> AppError {
    if e.is_timeout() {
        AppError::Timeout(format!("Gmail request timed out: {e}"))
    } else {
        AppError::Provider(format!("Gmail request failed: {e}"))
    }
}

fn map_status_error(status: StatusCode, body: &str) -> AppError {
    let detail = format!("Gmail API returned {status}: {}", body.trim());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AppError::AuthFailed(detail),
        _ => AppError::Provider(detail),
    }
}
