use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::config::OAuthClient;
use crate::connectors::{http_client, redact_response_body, RefreshedToken, TokenEndpoint};
use crate::error::IngestError;

/// Seconds shaved off a reported lifetime so a token is never used right at its edge.
const EXPIRY_SKEW_SECONDS: i64 = 60;

/// Refresh-token exchange against Google's OAuth2 token endpoint.
#[derive(Debug, Clone)]
pub struct GoogleTokenClient {
    client: Client,
    token_url: String,
    oauth_client: Option<OAuthClient>,
}

impl GoogleTokenClient {
    pub fn new(
        token_url: impl Into<String>,
        oauth_client: Option<OAuthClient>,
        timeout: Duration,
    ) -> reqwest::Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            token_url: token_url.into(),
            oauth_client,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    expires_in: Option<i64>,
    /// Absolute expiry in epoch milliseconds, sent by some token brokers.
    expiry_date: Option<i64>,
}

impl OAuthTokenResponse {
    fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if let Some(seconds) = self.expires_in {
            return Some(now + ChronoDuration::seconds(seconds.saturating_sub(EXPIRY_SKEW_SECONDS)));
        }
        self.expiry_date
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct OAuthErrorResponse {
    error: String,
    error_description: Option<String>,
}

#[async_trait(?Send)]
impl TokenEndpoint for GoogleTokenClient {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken, IngestError> {
        let Some(oauth_client) = &self.oauth_client else {
            return Err(IngestError::Validation(
                "missing google oauth client (MAILROOM_GOOGLE_CLIENT_ID/MAILROOM_GOOGLE_CLIENT_SECRET)"
                    .to_string(),
            ));
        };

        debug!("refreshing access token at {}", self.token_url);
        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("client_id", oauth_client.client_id.as_str()),
                ("client_secret", oauth_client.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|error| {
                IngestError::RemoteUnavailable(format!(
                    "request oauth token from {}: {error}",
                    self.token_url
                ))
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|error| {
            IngestError::RemoteUnavailable(format!("read oauth token response: {error}"))
        })?;

        if status.is_server_error() {
            return Err(IngestError::RemoteUnavailable(format!(
                "oauth token request failed: status={} body={}",
                status,
                redact_response_body(&body)
            )));
        }

        if !status.is_success() {
            // 4xx from the token endpoint means the grant itself was refused
            // (invalid_grant for revoked or expired refresh tokens).
            let reason = serde_json::from_str::<OAuthErrorResponse>(&body)
                .map(|error| match error.error_description {
                    Some(description) => format!("{}: {description}", error.error),
                    None => error.error,
                })
                .unwrap_or_else(|_| redact_response_body(&body));
            return Err(IngestError::AuthExpired(format!(
                "oauth refresh rejected: status={status} {reason}"
            )));
        }

        let payload: OAuthTokenResponse = serde_json::from_str(&body).map_err(|error| {
            IngestError::RemoteUnavailable(format!("decode oauth token response: {error}"))
        })?;

        Ok(RefreshedToken {
            expires_at: payload.expires_at(Utc::now()),
            access_token: payload.access_token,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use mockito::Matcher;

    use super::{GoogleTokenClient, OAuthTokenResponse};
    use crate::config::OAuthClient;
    use crate::connectors::TokenEndpoint;
    use crate::error::IngestError;

    fn oauth_client() -> Option<OAuthClient> {
        Some(OAuthClient {
            client_id: "client-id".to_string(),
            client_secret: "client-secret".to_string(),
        })
    }

    fn token_client(server: &mockito::ServerGuard) -> GoogleTokenClient {
        GoogleTokenClient::new(
            format!("{}/token", server.url()),
            oauth_client(),
            Duration::from_secs(5),
        )
        .expect("build token client")
    }

    #[test]
    fn token_response_accepts_relative_or_absolute_expiry() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();

        let relative: OAuthTokenResponse =
            serde_json::from_str(r#"{"access_token":"a","expires_in":3600,"token_type":"Bearer"}"#)
                .expect("decode relative");
        assert_eq!(
            relative.expires_at(now),
            Some(Utc.with_ymd_and_hms(2026, 3, 1, 10, 59, 0).unwrap())
        );

        let absolute: OAuthTokenResponse =
            serde_json::from_str(r#"{"access_token":"a","expiry_date":1772362800000}"#)
                .expect("decode absolute");
        assert_eq!(
            absolute.expires_at(now),
            Some(Utc.timestamp_millis_opt(1_772_362_800_000).unwrap())
        );

        let neither: OAuthTokenResponse =
            serde_json::from_str(r#"{"access_token":"a"}"#).expect("decode bare");
        assert_eq!(neither.expires_at(now), None);
    }

    #[tokio::test]
    async fn refresh_posts_refresh_token_grant() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                Matcher::UrlEncoded("refresh_token".into(), "1//refresh".into()),
                Matcher::UrlEncoded("client_id".into(), "client-id".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"ya29.fresh","expires_in":3599,"token_type":"Bearer"}"#)
            .create_async()
            .await;

        let before = Utc::now();
        let refreshed = token_client(&server)
            .refresh("1//refresh")
            .await
            .expect("refresh token");

        mock.assert_async().await;
        assert_eq!(refreshed.access_token, "ya29.fresh");
        let expires_at = refreshed.expires_at.expect("expiry");
        assert!(expires_at > before);
    }

    #[tokio::test]
    async fn invalid_grant_is_auth_expired() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(400)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error":"invalid_grant","error_description":"Token has been expired or revoked."}"#)
            .create_async()
            .await;

        let error = token_client(&server)
            .refresh("revoked")
            .await
            .expect_err("invalid grant must fail");
        match error {
            IngestError::AuthExpired(reason) => assert!(reason.contains("invalid_grant")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_failure_is_remote_unavailable() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(502)
            .with_body("bad gateway")
            .create_async()
            .await;

        let error = token_client(&server)
            .refresh("1//refresh")
            .await
            .expect_err("502 must fail");
        assert!(matches!(error, IngestError::RemoteUnavailable(_)));
    }

    #[tokio::test]
    async fn missing_client_registration_fails_before_any_request() {
        let client = GoogleTokenClient::new("http://127.0.0.1:9/token", None, Duration::from_secs(1))
            .expect("build token client");
        let error = client
            .refresh("1//refresh")
            .await
            .expect_err("missing client must fail");
        assert!(matches!(error, IngestError::Validation(_)));
    }
}
