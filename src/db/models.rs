use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use rusqlite::{Result as SqlResult, Row};
use serde::{Deserialize, Serialize};

pub const UNREAD_LABEL: &str = "UNREAD";
pub const STARRED_LABEL: &str = "STARRED";
pub const IMPORTANT_LABEL: &str = "IMPORTANT";

/// Opaque continuation cursor issued by the remote list endpoint.
///
/// The value is stored and forwarded verbatim; nothing in this crate reads
/// meaning into it or builds one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageToken(String);

impl PageToken {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PageToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sender {
    pub name: String,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    pub attachment_id: String,
}

/// Read/starred/important state derived from a label set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LabelFlags {
    pub is_read: bool,
    pub is_starred: bool,
    pub is_important: bool,
}

impl LabelFlags {
    pub fn from_labels(labels: &[String]) -> Self {
        let has = |wanted: &str| labels.iter().any(|label| label == wanted);
        Self {
            is_read: !has(UNREAD_LABEL),
            is_starred: has(STARRED_LABEL),
            is_important: has(IMPORTANT_LABEL),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Email {
    /// Local row id; `None` until the message has been stored.
    pub id: Option<i64>,
    pub user_id: i64,
    pub gmail_id: String,
    pub message_id: String,
    pub thread_id: String,
    pub subject: String,
    pub from: Sender,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub date: DateTime<Utc>,
    pub body_text: String,
    pub body_html: String,
    pub attachments: Vec<Attachment>,
    pub labels: Vec<String>,
    pub is_read: bool,
    pub is_starred: bool,
    pub is_important: bool,
    pub snippet: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: i64,
    pub google_id: String,
    pub email: String,
    pub name: String,
    pub picture: Option<String>,
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    #[serde(skip_serializing)]
    pub refresh_token: Option<String>,
    pub token_expiry: Option<DateTime<Utc>>,
    pub preferences: serde_json::Value,
    pub last_sync: Option<DateTime<Utc>>,
}

/// Profile and tokens captured at login, used to register or refresh a user.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewUser {
    pub google_id: String,
    pub email: String,
    pub name: String,
    pub picture: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub token_expiry: Option<DateTime<Utc>>,
}

/// A bearer credential that was valid when the token guard returned it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmailStats {
    pub total_emails: i64,
    pub unread_count: i64,
    pub starred_count: i64,
    pub important_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncState {
    pub key: String,
    pub value: Option<String>,
    pub updated_at: Option<String>,
}

pub fn default_preferences() -> serde_json::Value {
    serde_json::json!({
        "emailsPerPage": 20,
        "theme": "light"
    })
}

pub(crate) fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339()
}

pub(crate) fn parse_timestamp(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_json_array<T: for<'de> Deserialize<'de>>(raw: Option<String>) -> Vec<T> {
    raw.and_then(|s| serde_json::from_str::<Vec<T>>(&s).ok())
        .unwrap_or_default()
}

fn parse_json_value(raw: Option<String>) -> Option<serde_json::Value> {
    raw.and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok())
}

fn invalid_column(column: &str, raw: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        raw.len(),
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid {column}: {raw}"),
        )),
    )
}

impl Email {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        let date_raw: String = row.get("date")?;
        let date = parse_timestamp(Some(date_raw.clone()))
            .ok_or_else(|| invalid_column("date", &date_raw))?;
        Ok(Self {
            id: Some(row.get("id")?),
            user_id: row.get("user_id")?,
            gmail_id: row.get("gmail_id")?,
            message_id: row.get("message_id")?,
            thread_id: row.get::<_, Option<String>>("thread_id")?.unwrap_or_default(),
            subject: row.get::<_, Option<String>>("subject")?.unwrap_or_default(),
            from: Sender {
                name: row.get::<_, Option<String>>("from_name")?.unwrap_or_default(),
                address: row.get("from_email")?,
            },
            to: parse_json_array(row.get("to_emails")?),
            cc: parse_json_array(row.get("cc_emails")?),
            bcc: parse_json_array(row.get("bcc_emails")?),
            date,
            body_text: row.get::<_, Option<String>>("body_text")?.unwrap_or_default(),
            body_html: row.get::<_, Option<String>>("body_html")?.unwrap_or_default(),
            attachments: parse_json_array(row.get("attachments")?),
            labels: parse_json_array(row.get("labels")?),
            is_read: row.get("is_read")?,
            is_starred: row.get("is_starred")?,
            is_important: row.get("is_important")?,
            snippet: row.get::<_, Option<String>>("snippet")?.unwrap_or_default(),
        })
    }
}

impl User {
    /// Token columns come back exactly as stored; sealed values are opened by
    /// the database handle.
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            google_id: row.get("google_id")?,
            email: row.get("email")?,
            name: row.get("name")?,
            picture: row.get("picture")?,
            access_token: row.get("access_token")?,
            refresh_token: row.get("refresh_token")?,
            token_expiry: parse_timestamp(row.get("token_expiry")?),
            preferences: parse_json_value(row.get("preferences")?)
                .unwrap_or_else(default_preferences),
            last_sync: parse_timestamp(row.get("last_sync")?),
        })
    }

    pub fn credential(&self) -> Option<Credential> {
        self.access_token.as_ref().map(|token| Credential {
            access_token: token.clone(),
            expires_at: self.token_expiry,
        })
    }
}

impl SyncState {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            key: row.get("key")?,
            value: row.get("value")?,
            updated_at: row.get("updated_at")?,
        })
    }
}
