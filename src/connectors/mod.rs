use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;

use crate::db::models::PageToken;
use crate::error::IngestError;

pub mod gmail_api;
pub mod oauth;

pub use gmail_api::{GmailApiClient, GmailBody, GmailHeader, GmailMessage, GmailPayload};
pub use oauth::GoogleTokenClient;

const REDACTED_BODY_MAX_LEN: usize = 200;

/// One page request against the remote message list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListRequest {
    pub max_results: u32,
    /// Remote search-operator syntax, forwarded verbatim.
    pub query: Option<String>,
    pub page_token: Option<PageToken>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MessageList {
    pub ids: Vec<String>,
    pub next_page_token: Option<PageToken>,
    pub result_size_estimate: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshedToken {
    pub access_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[async_trait(?Send)]
pub trait MailboxApi {
    async fn list_messages(
        &self,
        access_token: &str,
        request: &ListRequest,
    ) -> Result<MessageList, IngestError>;

    async fn get_message(
        &self,
        access_token: &str,
        message_id: &str,
    ) -> Result<GmailMessage, IngestError>;
}

#[async_trait(?Send)]
pub trait TokenEndpoint {
    /// Exchanges a refresh token for a new access token.
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken, IngestError>;
}

pub(crate) fn http_client(timeout: Duration) -> reqwest::Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!("mailroom/", env!("CARGO_PKG_VERSION")))
        .build()
}

pub(crate) fn redact_response_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= REDACTED_BODY_MAX_LEN {
        return trimmed.to_string();
    }

    let mut cut = REDACTED_BODY_MAX_LEN;
    while !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…[truncated {} bytes]", &trimmed[..cut], trimmed.len())
}

#[cfg(test)]
mod tests {
    use super::redact_response_body;

    #[test]
    fn short_bodies_are_kept() {
        assert_eq!(redact_response_body("  {\"error\":\"x\"} "), "{\"error\":\"x\"}");
    }

    #[test]
    fn long_bodies_are_truncated_on_char_boundary() {
        let body = "é".repeat(300);
        let redacted = redact_response_body(&body);
        assert!(redacted.contains("[truncated 600 bytes]"));
        assert!(redacted.len() < body.len());
    }
}
