use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::connectors::{
    http_client, redact_response_body, ListRequest, MailboxApi, MessageList,
};
use crate::db::models::PageToken;
use crate::error::IngestError;

#[derive(Debug, Clone)]
pub struct GmailApiClient {
    client: Client,
    base_url: String,
}

impl GmailApiClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> reqwest::Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        token: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, RequestFailure> {
        debug!("gmail api request: {url}");
        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .header("accept", "application/json")
            .query(query)
            .send()
            .await
            .map_err(|error| RequestFailure::Transport(error.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| RequestFailure::Transport(error.to_string()))?;

        if status == StatusCode::UNAUTHORIZED {
            return Err(RequestFailure::Unauthorized(redact_response_body(&body)));
        }
        if !status.is_success() {
            return Err(RequestFailure::Status(status, redact_response_body(&body)));
        }

        serde_json::from_str(&body).map_err(|error| RequestFailure::Decode(error.to_string()))
    }
}

#[derive(Debug)]
enum RequestFailure {
    Unauthorized(String),
    Status(StatusCode, String),
    Transport(String),
    Decode(String),
}

impl std::fmt::Display for RequestFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unauthorized(body) => write!(f, "status=401 body={body}"),
            Self::Status(status, body) => write!(f, "status={status} body={body}"),
            Self::Transport(error) => write!(f, "transport: {error}"),
            Self::Decode(error) => write!(f, "decode response: {error}"),
        }
    }
}

#[async_trait(?Send)]
impl MailboxApi for GmailApiClient {
    async fn list_messages(
        &self,
        access_token: &str,
        request: &ListRequest,
    ) -> Result<MessageList, IngestError> {
        let url = format!("{}/users/me/messages", self.base_url);
        let mut query = vec![("maxResults", request.max_results.to_string())];
        if let Some(q) = request.query.as_deref().filter(|q| !q.trim().is_empty()) {
            query.push(("q", q.to_string()));
        }
        if let Some(page_token) = &request.page_token {
            query.push(("pageToken", page_token.as_str().to_string()));
        }

        let list: GmailMessageList = self
            .get_json(access_token, &url, &query)
            .await
            .map_err(|failure| match failure {
                RequestFailure::Unauthorized(body) => {
                    IngestError::AuthExpired(format!("gmail message list rejected token: {body}"))
                }
                other => IngestError::RemoteUnavailable(format!("gmail message list: {other}")),
            })?;

        Ok(MessageList {
            ids: list.messages.into_iter().map(|stub| stub.id).collect(),
            next_page_token: list
                .next_page_token
                .filter(|token| !token.is_empty())
                .map(PageToken::new),
            result_size_estimate: list.result_size_estimate.unwrap_or_default(),
        })
    }

    async fn get_message(
        &self,
        access_token: &str,
        message_id: &str,
    ) -> Result<GmailMessage, IngestError> {
        let url = format!("{}/users/me/messages/{message_id}", self.base_url);
        self.get_json(access_token, &url, &[("format", "full".to_string())])
            .await
            .map_err(|failure| match failure {
                RequestFailure::Unauthorized(body) => {
                    IngestError::AuthExpired(format!("gmail message get rejected token: {body}"))
                }
                other => IngestError::transient(message_id, other),
            })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessageList {
    #[serde(default)]
    messages: Vec<GmailMessageStub>,
    next_page_token: Option<String>,
    result_size_estimate: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailMessageStub {
    id: String,
}

/// A message as returned by `messages.get?format=full`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailMessage {
    pub id: String,
    #[serde(default)]
    pub thread_id: String,
    #[serde(default)]
    pub label_ids: Vec<String>,
    #[serde(default)]
    pub snippet: String,
    #[serde(default)]
    pub payload: GmailPayload,
    /// Epoch milliseconds, sent as a decimal string.
    pub internal_date: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailPayload {
    pub mime_type: Option<String>,
    pub filename: Option<String>,
    #[serde(default)]
    pub headers: Vec<GmailHeader>,
    pub body: Option<GmailBody>,
    #[serde(default)]
    pub parts: Vec<GmailPayload>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GmailHeader {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailBody {
    pub size: Option<u64>,
    pub data: Option<String>,
    pub attachment_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mockito::Matcher;

    use super::{GmailApiClient, GmailMessage};
    use crate::connectors::{ListRequest, MailboxApi};
    use crate::db::models::PageToken;
    use crate::error::IngestError;

    fn client(server: &mockito::ServerGuard) -> GmailApiClient {
        GmailApiClient::new(format!("{}/gmail/v1", server.url()), Duration::from_secs(5))
            .expect("build client")
    }

    #[test]
    fn gmail_message_deserializes_full_format() {
        let payload = r#"{
            "id": "18e1",
            "threadId": "18e0",
            "labelIds": ["INBOX", "UNREAD"],
            "snippet": "Hello there",
            "internalDate": "1731401723000",
            "sizeEstimate": 2048,
            "payload": {
                "mimeType": "multipart/alternative",
                "headers": [{"name": "Subject", "value": "Hi"}],
                "body": {"size": 0},
                "parts": [
                    {"mimeType": "text/plain", "filename": "", "body": {"size": 5, "data": "SGVsbG8"}}
                ]
            }
        }"#;

        let message: GmailMessage = serde_json::from_str(payload).expect("decode message");
        assert_eq!(message.thread_id, "18e0");
        assert_eq!(message.label_ids, vec!["INBOX", "UNREAD"]);
        assert_eq!(message.internal_date.as_deref(), Some("1731401723000"));
        assert_eq!(message.payload.parts.len(), 1);
        assert_eq!(
            message.payload.parts[0]
                .body
                .as_ref()
                .and_then(|body| body.data.as_deref()),
            Some("SGVsbG8")
        );
    }

    #[tokio::test]
    async fn list_messages_forwards_paging_and_query() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/gmail/v1/users/me/messages")
            .match_header("authorization", "Bearer ya29.token")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("maxResults".into(), "2".into()),
                Matcher::UrlEncoded("q".into(), "from:boss is:unread".into()),
                Matcher::UrlEncoded("pageToken".into(), "CAEQAhgB".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"messages":[{"id":"a","threadId":"t"},{"id":"b","threadId":"t"}],"nextPageToken":"CAIQAhgC","resultSizeEstimate":7}"#,
            )
            .create_async()
            .await;

        let list = client(&server)
            .list_messages(
                "ya29.token",
                &ListRequest {
                    max_results: 2,
                    query: Some("from:boss is:unread".to_string()),
                    page_token: Some(PageToken::new("CAEQAhgB")),
                },
            )
            .await
            .expect("list messages");

        mock.assert_async().await;
        assert_eq!(list.ids, vec!["a", "b"]);
        assert_eq!(list.next_page_token, Some(PageToken::new("CAIQAhgC")));
        assert_eq!(list.result_size_estimate, 7);
    }

    #[tokio::test]
    async fn empty_mailbox_is_not_an_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/gmail/v1/users/me/messages")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"resultSizeEstimate":0}"#)
            .create_async()
            .await;

        let list = client(&server)
            .list_messages(
                "ya29.token",
                &ListRequest {
                    max_results: 20,
                    ..ListRequest::default()
                },
            )
            .await
            .expect("list messages");

        assert!(list.ids.is_empty());
        assert!(list.next_page_token.is_none());
        assert_eq!(list.result_size_estimate, 0);
    }

    #[tokio::test]
    async fn unauthorized_list_maps_to_auth_expired() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/gmail/v1/users/me/messages")
            .match_query(Matcher::Any)
            .with_status(401)
            .with_body(r#"{"error":{"message":"Invalid Credentials"}}"#)
            .create_async()
            .await;

        let error = client(&server)
            .list_messages(
                "stale",
                &ListRequest {
                    max_results: 20,
                    ..ListRequest::default()
                },
            )
            .await
            .expect_err("401 must fail");
        assert!(matches!(error, IngestError::AuthExpired(_)));
    }

    #[tokio::test]
    async fn server_error_on_list_is_remote_unavailable() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/gmail/v1/users/me/messages")
            .match_query(Matcher::Any)
            .with_status(503)
            .with_body("backend error")
            .create_async()
            .await;

        let error = client(&server)
            .list_messages(
                "ya29.token",
                &ListRequest {
                    max_results: 20,
                    ..ListRequest::default()
                },
            )
            .await
            .expect_err("503 must fail");
        assert!(matches!(error, IngestError::RemoteUnavailable(_)));
    }

    #[tokio::test]
    async fn missing_message_is_a_transient_failure() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/gmail/v1/users/me/messages/gone")
            .match_query(Matcher::UrlEncoded("format".into(), "full".into()))
            .with_status(404)
            .with_body(r#"{"error":{"message":"Requested entity was not found."}}"#)
            .create_async()
            .await;

        let error = client(&server)
            .get_message("ya29.token", "gone")
            .await
            .expect_err("404 must fail");
        match error {
            IngestError::TransientFetch { id, reason } => {
                assert_eq!(id, "gone");
                assert!(reason.contains("404"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
