use std::path::PathBuf;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use mockito::{Matcher, Server, ServerGuard};
use uuid::Uuid;

use mailroom::config::OAuthClient;
use mailroom::connectors::{GmailApiClient, GoogleTokenClient};
use mailroom::db::models::{NewUser, PageToken};
use mailroom::db::Database;
use mailroom::ingest::{page_token_key, FetchOptions, InboxService, SyncOptions, UpsertMode};
use mailroom::IngestError;

fn temp_db_path() -> PathBuf {
    std::env::temp_dir().join(format!("mailroom-ingest-it-{}.db", Uuid::new_v4()))
}

fn service(server: &ServerGuard) -> InboxService<GmailApiClient, GoogleTokenClient> {
    let api = GmailApiClient::new(format!("{}/gmail/v1", server.url()), Duration::from_secs(5))
        .expect("build gmail client");
    let tokens = GoogleTokenClient::new(
        format!("{}/token", server.url()),
        Some(OAuthClient {
            client_id: "client-id".to_string(),
            client_secret: "client-secret".to_string(),
        }),
        Duration::from_secs(5),
    )
    .expect("build token client");
    InboxService::new(api, tokens)
}

fn register_expired_user(db: &Database) -> i64 {
    db.upsert_user(&NewUser {
        google_id: "g-42".to_string(),
        email: "owner@example.com".to_string(),
        name: "Owner".to_string(),
        access_token: Some("ya29.stale".to_string()),
        refresh_token: Some("1//refresh".to_string()),
        token_expiry: Some(Utc::now() - ChronoDuration::minutes(5)),
        ..NewUser::default()
    })
    .expect("register user")
    .id
}

const PLAIN_MESSAGE: &str = r#"{
    "id": "m1",
    "threadId": "t1",
    "labelIds": ["INBOX", "UNREAD"],
    "snippet": "Quarterly numbers &amp; notes",
    "internalDate": "1731401723000",
    "payload": {
        "mimeType": "multipart/mixed",
        "headers": [
            {"name": "Subject", "value": "Q3 report"},
            {"name": "From", "value": "\"Finance Team\" <finance@example.com>"},
            {"name": "To", "value": "owner@example.com, \"Lee, Sam\" <sam@example.com>"},
            {"name": "Message-ID", "value": "<q3@example.com>"}
        ],
        "body": {"size": 0},
        "parts": [
            {"mimeType": "text/plain", "filename": "", "body": {"size": 27, "data": "UXVhcnRlcmx5IG51bWJlcnMgYXR0YWNoZWQu"}},
            {"mimeType": "application/pdf", "filename": "q3.pdf", "body": {"size": 1024, "attachmentId": "att-1"}}
        ]
    }
}"#;

const HTML_MESSAGE: &str = r#"{
    "id": "m2",
    "threadId": "t2",
    "labelIds": ["INBOX", "STARRED"],
    "snippet": "Team offsite",
    "payload": {
        "mimeType": "text/html",
        "headers": [
            {"name": "Subject", "value": "Offsite"},
            {"name": "From", "value": "events@example.com"},
            {"name": "Date", "value": "Tue, 12 Nov 2024 09:15:23 +0000"}
        ],
        "body": {"size": 40, "data": "PHA-VGVhbSA8Yj5vZmZzaXRlPC9iPiBpcyBvbiBGcmlkYXkuPC9wPg"}
    }
}"#;

#[tokio::test]
async fn sync_refreshes_token_ingests_page_and_resumes_from_cursor() {
    let mut server = Server::new_async().await;
    let token_mock = server
        .mock("POST", "/token")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
            Matcher::UrlEncoded("refresh_token".into(), "1//refresh".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token":"ya29.fresh","expires_in":3599,"token_type":"Bearer"}"#)
        .expect(1)
        .create_async()
        .await;
    let first_list = server
        .mock("GET", "/gmail/v1/users/me/messages")
        .match_header("authorization", "Bearer ya29.fresh")
        .match_query(Matcher::UrlEncoded("maxResults".into(), "3".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{"messages":[{"id":"m1"},{"id":"m2"},{"id":"m3"}],"nextPageToken":"CURSOR-2","resultSizeEstimate":4}"#,
        )
        .create_async()
        .await;
    let second_list = server
        .mock("GET", "/gmail/v1/users/me/messages")
        .match_header("authorization", "Bearer ya29.fresh")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("maxResults".into(), "2".into()),
            Matcher::UrlEncoded("pageToken".into(), "CURSOR-2".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"messages":[{"id":"m1"}],"resultSizeEstimate":4}"#)
        .create_async()
        .await;
    let _m1 = server
        .mock("GET", "/gmail/v1/users/me/messages/m1")
        .match_query(Matcher::UrlEncoded("format".into(), "full".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(PLAIN_MESSAGE)
        .expect(2)
        .create_async()
        .await;
    let _m2 = server
        .mock("GET", "/gmail/v1/users/me/messages/m2")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(HTML_MESSAGE)
        .create_async()
        .await;
    let _m3 = server
        .mock("GET", "/gmail/v1/users/me/messages/m3")
        .match_query(Matcher::Any)
        .with_status(500)
        .with_body("backend error")
        .create_async()
        .await;

    let path = temp_db_path();
    let db = Database::open(&path).expect("open db");
    let user_id = register_expired_user(&db);
    let service = service(&server);

    let report = service
        .sync(
            &db,
            user_id,
            &SyncOptions {
                max_results: Some(3),
                ..SyncOptions::default()
            },
        )
        .await
        .expect("first sync");

    assert_eq!(report.listed, 3);
    assert_eq!(report.inserted, 2);
    assert_eq!(report.dropped, 1);
    assert_eq!(report.next_page_token, Some(PageToken::new("CURSOR-2")));
    first_list.assert_async().await;

    let user = db.get_user(user_id).expect("get user").expect("user exists");
    assert_eq!(user.access_token.as_deref(), Some("ya29.fresh"));
    assert_eq!(user.refresh_token.as_deref(), Some("1//refresh"));
    assert!(user.last_sync.is_some());
    let cursor = db
        .get_sync_state(&page_token_key(user_id))
        .expect("read cursor")
        .and_then(|state| state.value);
    assert_eq!(cursor.as_deref(), Some("CURSOR-2"));

    let plain_email = db
        .get_email_by_gmail_id(user_id, "m1")
        .expect("read m1")
        .expect("m1 stored");
    assert_eq!(plain_email.subject, "Q3 report");
    assert_eq!(plain_email.from.name, "Finance Team");
    assert_eq!(plain_email.from.address, "finance@example.com");
    assert_eq!(
        plain_email.to,
        vec!["owner@example.com", "\"Lee, Sam\" <sam@example.com>"]
    );
    assert_eq!(plain_email.body_text, "Quarterly numbers attached.");
    assert_eq!(plain_email.snippet, "Quarterly numbers & notes");
    assert_eq!(plain_email.attachments.len(), 1);
    assert_eq!(plain_email.attachments[0].filename, "q3.pdf");
    assert!(!plain_email.is_read);

    let html_email = db
        .get_email_by_gmail_id(user_id, "m2")
        .expect("read m2")
        .expect("m2 stored");
    assert_eq!(html_email.from.address, "events@example.com");
    assert_eq!(html_email.body_text, "");
    assert!(html_email.body_html.contains("<b>offsite</b>"));
    assert!(html_email.is_read);
    assert!(html_email.is_starred);
    assert!(db.get_email_by_gmail_id(user_id, "m3").expect("read m3").is_none());

    let resumed = service
        .sync(
            &db,
            user_id,
            &SyncOptions {
                max_results: Some(2),
                resume: true,
                ..SyncOptions::default()
            },
        )
        .await
        .expect("resumed sync");

    assert_eq!(resumed.listed, 1);
    assert_eq!(resumed.inserted, 0);
    assert_eq!(resumed.existing, 1);
    assert_eq!(resumed.next_page_token, None);
    second_list.assert_async().await;
    token_mock.assert_async().await;
    assert!(db
        .get_sync_state(&page_token_key(user_id))
        .expect("read cursor")
        .is_none());

    let stats = db.get_stats(user_id).expect("stats");
    assert_eq!(stats.total_emails, 2);
    assert_eq!(stats.unread_count, 1);
    assert_eq!(stats.starred_count, 1);

    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn refresh_labels_mode_rewrites_flags_of_cached_message() {
    let mut server = Server::new_async().await;
    let _list = server
        .mock("GET", "/gmail/v1/users/me/messages")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"messages":[{"id":"m1"}],"resultSizeEstimate":1}"#)
        .create_async()
        .await;
    let _detail = server
        .mock("GET", "/gmail/v1/users/me/messages/m1")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(PLAIN_MESSAGE)
        .create_async()
        .await;

    let path = temp_db_path();
    let db = Database::open(&path).expect("open db");
    let user_id = db
        .upsert_user(&NewUser {
            google_id: "g-7".to_string(),
            email: "reader@example.com".to_string(),
            name: "Reader".to_string(),
            access_token: Some("ya29.valid".to_string()),
            token_expiry: Some(Utc::now() + ChronoDuration::minutes(30)),
            ..NewUser::default()
        })
        .expect("register user")
        .id;

    let first = service(&server)
        .fetch(&db, user_id, &FetchOptions::default())
        .await
        .expect("first fetch");
    assert_eq!(first.emails.len(), 1);
    assert!(!first.emails[0].is_read);

    let stored_id = first.emails[0].id.expect("stored id");
    db.conn()
        .execute(
            "UPDATE emails SET labels = '[\"INBOX\"]', is_read = 1 WHERE id = ?",
            [stored_id],
        )
        .expect("mark read locally");

    let kept = service(&server)
        .fetch(&db, user_id, &FetchOptions::default())
        .await
        .expect("insert-if-absent fetch");
    assert_eq!(kept.emails[0].id, Some(stored_id));
    assert!(!kept.emails[0].is_read);
    let cached = db
        .get_email(user_id, stored_id)
        .expect("read cached")
        .expect("cached row");
    assert!(cached.is_read);
    assert_eq!(cached.labels, vec!["INBOX"]);

    let refreshed = service(&server)
        .with_upsert_mode(UpsertMode::RefreshLabels)
        .fetch(&db, user_id, &FetchOptions::default())
        .await
        .expect("refresh-labels fetch");
    assert_eq!(refreshed.emails[0].id, Some(stored_id));
    assert!(!refreshed.emails[0].is_read);
    assert_eq!(refreshed.emails[0].labels, vec!["INBOX", "UNREAD"]);
    let cached = db
        .get_email(user_id, stored_id)
        .expect("read cached")
        .expect("cached row");
    assert!(!cached.is_read);

    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn revoked_refresh_token_stops_before_listing() {
    let mut server = Server::new_async().await;
    let _token = server
        .mock("POST", "/token")
        .with_status(400)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error":"invalid_grant"}"#)
        .create_async()
        .await;
    let list = server
        .mock("GET", "/gmail/v1/users/me/messages")
        .match_query(Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let path = temp_db_path();
    let db = Database::open(&path).expect("open db");
    let user_id = register_expired_user(&db);

    let error = service(&server)
        .fetch(&db, user_id, &FetchOptions::default())
        .await
        .expect_err("refresh rejected");

    assert!(matches!(error, IngestError::AuthExpired(_)));
    list.assert_async().await;
    let user = db.get_user(user_id).expect("get user").expect("user exists");
    assert_eq!(user.access_token.as_deref(), Some("ya29.stale"));
    assert!(user.last_sync.is_none());

    let _ = std::fs::remove_file(path);
}
