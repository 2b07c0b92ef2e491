use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, ToSql};
use serde::Serialize;
use thiserror::Error;

use crate::crypto::{SealError, TokenSealer};

use self::models::{
    default_preferences, format_timestamp, Email, EmailStats, LabelFlags, NewUser, SyncState, User,
};

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("json serialization: {0}")]
    Json(#[from] serde_json::Error),

    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),

    #[error("token sealing: {0}")]
    Seal(#[from] SealError),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Config(String),
}

pub mod migrations;
pub mod models;
pub mod schema;

const EMAIL_COLUMNS: &str = r#"
    id, user_id, gmail_id, message_id, thread_id, subject, from_name, from_email,
    to_emails, cc_emails, bcc_emails, date, body_text, body_html, attachments, labels,
    is_read, is_starred, is_important, snippet
"#;

const USER_COLUMNS: &str = r#"
    id, google_id, email, name, picture, access_token, refresh_token, token_expiry,
    preferences, last_sync
"#;

#[derive(Debug, Clone, Default)]
pub struct EmailListFilters {
    pub user_id: i64,
    pub query: Option<String>,
    pub unread_only: bool,
    pub starred_only: bool,
    pub limit: usize,
    pub offset: usize,
}

/// What the ingestion upsert did with one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "id", rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted(i64),
    Existing(i64),
    Refreshed(i64),
}

impl UpsertOutcome {
    pub fn id(self) -> i64 {
        match self {
            Self::Inserted(id) | Self::Existing(id) | Self::Refreshed(id) => id,
        }
    }
}

pub struct Database {
    conn: Connection,
    path: PathBuf,
    sealer: Option<TokenSealer>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        let mut db = Self {
            conn,
            path: path.to_path_buf(),
            sealer: None,
        };
        db.initialize()?;
        Ok(db)
    }

    /// Seal access and refresh tokens at rest from now on.
    pub fn with_token_sealer(mut self, sealer: TokenSealer) -> Self {
        self.sealer = Some(sealer);
        self
    }

    pub fn initialize(&mut self) -> Result<(), DbError> {
        self.run_migrations()
    }

    fn run_migrations(&mut self) -> Result<(), DbError> {
        migrations::migrate(&self.conn)
            .map_err(|e| DbError::Config(format!("migration failed: {e}")))
    }

    pub fn default_db_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir()
            .ok_or_else(|| DbError::Config("failed to determine home directory".to_string()))?;
        Ok(home.join(".mailroom").join("mailroom.db"))
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Registers a user or refreshes an existing one matched by Google id.
    /// A missing refresh token keeps the one already stored.
    pub fn upsert_user(&self, user: &NewUser) -> Result<User, DbError> {
        let access_token = self.seal_token(user.access_token.as_deref())?;
        let refresh_token = self.seal_token(user.refresh_token.as_deref())?;
        let preferences = serde_json::to_string(&default_preferences())?;

        self.conn.execute(
            r#"
            INSERT INTO users (
                google_id, email, name, picture, access_token, refresh_token, token_expiry, preferences
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(google_id) DO UPDATE SET
                email = excluded.email,
                name = excluded.name,
                picture = excluded.picture,
                access_token = excluded.access_token,
                refresh_token = COALESCE(excluded.refresh_token, users.refresh_token),
                token_expiry = excluded.token_expiry,
                updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
            "#,
            params![
                user.google_id,
                user.email,
                user.name,
                user.picture,
                access_token,
                refresh_token,
                user.token_expiry.as_ref().map(format_timestamp),
                preferences,
            ],
        )?;

        self.get_user_by_google_id(&user.google_id)?
            .ok_or_else(|| DbError::NotFound(format!("user {}", user.google_id)))
    }

    pub fn get_user(&self, user_id: i64) -> Result<Option<User>, DbError> {
        self.query_single_user("id = ?", &user_id)
    }

    pub fn get_user_by_google_id(&self, google_id: &str) -> Result<Option<User>, DbError> {
        self.query_single_user("google_id = ?", &google_id)
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>, DbError> {
        self.query_single_user("email = ? COLLATE NOCASE", &email)
    }

    pub fn list_users(&self) -> Result<Vec<User>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {USER_COLUMNS} FROM users ORDER BY email ASC"
        ))?;
        let users = stmt
            .query_map([], User::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        users.into_iter().map(|user| self.open_tokens(user)).collect()
    }

    /// Writes a refreshed access token and its expiry in one statement.
    pub fn update_credential(
        &self,
        user_id: i64,
        access_token: &str,
        token_expiry: Option<DateTime<Utc>>,
    ) -> Result<(), DbError> {
        let sealed = self.seal_token(Some(access_token))?;
        let updated = self.conn.execute(
            r#"
            UPDATE users
            SET access_token = ?, token_expiry = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
            WHERE id = ?
            "#,
            params![sealed, token_expiry.as_ref().map(format_timestamp), user_id],
        )?;
        if updated == 0 {
            return Err(DbError::NotFound(format!("user {user_id}")));
        }
        Ok(())
    }

    pub fn set_last_sync(&self, user_id: i64, at: DateTime<Utc>) -> Result<(), DbError> {
        let updated = self.conn.execute(
            "UPDATE users SET last_sync = ? WHERE id = ?",
            params![format_timestamp(&at), user_id],
        )?;
        if updated == 0 {
            return Err(DbError::NotFound(format!("user {user_id}")));
        }
        Ok(())
    }

    pub fn update_preferences(
        &self,
        user_id: i64,
        preferences: &serde_json::Value,
    ) -> Result<(), DbError> {
        let raw = serde_json::to_string(preferences)?;
        let updated = self.conn.execute(
            "UPDATE users SET preferences = ? WHERE id = ?",
            params![raw, user_id],
        )?;
        if updated == 0 {
            return Err(DbError::NotFound(format!("user {user_id}")));
        }
        Ok(())
    }

    /// Inserts the message unless (user_id, gmail_id) is already stored.
    /// Flags are derived from the labels here, never taken from the caller.
    pub fn insert_email_if_absent(&self, email: &Email) -> Result<UpsertOutcome, DbError> {
        let flags = LabelFlags::from_labels(&email.labels);
        let inserted = self.conn.execute(
            r#"
            INSERT INTO emails (
                user_id, gmail_id, message_id, thread_id, subject, from_name, from_email,
                to_emails, cc_emails, bcc_emails, date, body_text, body_html, attachments, labels,
                is_read, is_starred, is_important, snippet
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id, gmail_id) DO NOTHING
            "#,
            params![
                email.user_id,
                email.gmail_id,
                email.message_id,
                email.thread_id,
                email.subject,
                email.from.name,
                email.from.address,
                serde_json::to_string(&email.to)?,
                serde_json::to_string(&email.cc)?,
                serde_json::to_string(&email.bcc)?,
                format_timestamp(&email.date),
                email.body_text,
                email.body_html,
                serde_json::to_string(&email.attachments)?,
                serde_json::to_string(&email.labels)?,
                flags.is_read,
                flags.is_starred,
                flags.is_important,
                email.snippet,
            ],
        )?;

        if inserted == 1 {
            return Ok(UpsertOutcome::Inserted(self.conn.last_insert_rowid()));
        }

        self.email_row_id(email.user_id, &email.gmail_id)?
            .map(UpsertOutcome::Existing)
            .ok_or_else(|| DbError::NotFound(format!("email {}", email.gmail_id)))
    }

    /// Rewrites the label set of a stored message together with its flags.
    pub fn refresh_email_labels(
        &self,
        user_id: i64,
        gmail_id: &str,
        labels: &[String],
    ) -> Result<Option<i64>, DbError> {
        let flags = LabelFlags::from_labels(labels);
        let updated = self.conn.execute(
            r#"
            UPDATE emails
            SET labels = ?, is_read = ?, is_starred = ?, is_important = ?,
                updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
            WHERE user_id = ? AND gmail_id = ?
            "#,
            params![
                serde_json::to_string(labels)?,
                flags.is_read,
                flags.is_starred,
                flags.is_important,
                user_id,
                gmail_id,
            ],
        )?;
        if updated == 0 {
            return Ok(None);
        }
        self.email_row_id(user_id, gmail_id)
    }

    pub fn get_email(&self, user_id: i64, id: i64) -> Result<Option<Email>, DbError> {
        let email = self
            .conn
            .query_row(
                &format!("SELECT {EMAIL_COLUMNS} FROM emails WHERE user_id = ? AND id = ?"),
                params![user_id, id],
                Email::from_row,
            )
            .optional()?;
        Ok(email)
    }

    pub fn get_email_by_gmail_id(
        &self,
        user_id: i64,
        gmail_id: &str,
    ) -> Result<Option<Email>, DbError> {
        let email = self
            .conn
            .query_row(
                &format!("SELECT {EMAIL_COLUMNS} FROM emails WHERE user_id = ? AND gmail_id = ?"),
                params![user_id, gmail_id],
                Email::from_row,
            )
            .optional()?;
        Ok(email)
    }

    pub fn list_emails(&self, mut filters: EmailListFilters) -> Result<Vec<Email>, DbError> {
        if filters.limit == 0 {
            filters.limit = 20;
        }

        let mut sql = format!("SELECT {EMAIL_COLUMNS} FROM emails WHERE user_id = ?");
        let mut params_vec: Vec<Box<dyn ToSql>> = vec![Box::new(filters.user_id)];

        if let Some(query) = filters.query.filter(|s| !s.trim().is_empty()) {
            sql.push_str(
                " AND (subject LIKE ? OR body_text LIKE ? OR from_name LIKE ? OR from_email LIKE ?)",
            );
            let pattern = format!("%{}%", query.trim());
            params_vec.push(Box::new(pattern.clone()));
            params_vec.push(Box::new(pattern.clone()));
            params_vec.push(Box::new(pattern.clone()));
            params_vec.push(Box::new(pattern));
        }

        if filters.unread_only {
            sql.push_str(" AND is_read = 0");
        }

        if filters.starred_only {
            sql.push_str(" AND is_starred = 1");
        }

        sql.push_str(" ORDER BY date DESC LIMIT ? OFFSET ?");
        params_vec.push(Box::new(filters.limit as i64));
        params_vec.push(Box::new(filters.offset as i64));

        let params_refs: Vec<&dyn ToSql> = params_vec.iter().map(|v| v.as_ref()).collect();
        let mut stmt = self.conn.prepare(&sql)?;
        let results = stmt
            .query_map(params_refs.as_slice(), Email::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(results)
    }

    pub fn get_stats(&self, user_id: i64) -> Result<EmailStats, DbError> {
        let stats = self.conn.query_row(
            r#"
            SELECT
                COUNT(id),
                COALESCE(SUM(CASE WHEN is_read = 0 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN is_starred = 1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN is_important = 1 THEN 1 ELSE 0 END), 0)
            FROM emails
            WHERE user_id = ?
            "#,
            [user_id],
            |row| {
                Ok(EmailStats {
                    total_emails: row.get(0)?,
                    unread_count: row.get(1)?,
                    starred_count: row.get(2)?,
                    important_count: row.get(3)?,
                })
            },
        )?;
        Ok(stats)
    }

    pub fn get_sync_state(&self, key: &str) -> Result<Option<SyncState>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, value, updated_at FROM sync_state WHERE key = ? LIMIT 1")?;
        let mut rows = stmt.query([key])?;
        if let Some(row) = rows.next()? {
            Ok(Some(SyncState::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn set_sync_state(&self, key: &str, value: &str) -> Result<(), DbError> {
        self.conn.execute(
            r#"
            INSERT INTO sync_state (key, value, updated_at)
            VALUES (?, ?, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![key, value],
        )?;
        Ok(())
    }

    pub fn clear_sync_state(&self, key: &str) -> Result<(), DbError> {
        self.conn
            .execute("DELETE FROM sync_state WHERE key = ?", [key])?;
        Ok(())
    }

    fn query_single_user(
        &self,
        predicate: &str,
        value: &dyn ToSql,
    ) -> Result<Option<User>, DbError> {
        let user = self
            .conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE {predicate} LIMIT 1"),
                params![value],
                User::from_row,
            )
            .optional()?;
        user.map(|user| self.open_tokens(user)).transpose()
    }

    fn email_row_id(&self, user_id: i64, gmail_id: &str) -> Result<Option<i64>, DbError> {
        let id = self
            .conn
            .query_row(
                "SELECT id FROM emails WHERE user_id = ? AND gmail_id = ?",
                params![user_id, gmail_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    fn seal_token(&self, token: Option<&str>) -> Result<Option<String>, DbError> {
        match (token, &self.sealer) {
            (Some(token), Some(sealer)) => Ok(Some(sealer.seal(token)?)),
            (Some(token), None) => Ok(Some(token.to_string())),
            (None, _) => Ok(None),
        }
    }

    fn open_tokens(&self, mut user: User) -> Result<User, DbError> {
        let Some(sealer) = &self.sealer else {
            if [&user.access_token, &user.refresh_token]
                .into_iter()
                .flatten()
                .any(|token| TokenSealer::is_sealed(token))
            {
                return Err(DbError::Config(format!(
                    "tokens for user {} are sealed; configure the token key to read them",
                    user.id
                )));
            }
            return Ok(user);
        };

        user.access_token = user
            .access_token
            .map(|token| sealer.open(&token))
            .transpose()?;
        user.refresh_token = user
            .refresh_token
            .map(|token| sealer.open(&token))
            .transpose()?;
        Ok(user)
    }
}
