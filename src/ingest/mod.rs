//! Gmail ingestion: token guard, list page, concurrent detail fetch, MIME
//! normalization and the per-user upsert.

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::connectors::{ListRequest, MailboxApi, TokenEndpoint};
use crate::db::models::{Email, EmailStats, PageToken, User};
use crate::db::{Database, DbError, UpsertOutcome};
use crate::error::IngestError;

pub mod mime;
pub mod token;

pub use mime::normalize_message;
pub use token::ensure_fresh_credential;

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 50;

/// How a re-fetched message that is already stored is reconciled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpsertMode {
    /// Keep the stored row untouched.
    #[default]
    InsertIfAbsent,
    /// Rewrite the stored label set and the flags derived from it.
    RefreshLabels,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchOptions {
    /// Page size; `None` means [`DEFAULT_PAGE_SIZE`].
    pub max_results: Option<u32>,
    pub page_token: Option<PageToken>,
    pub query: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FetchPage {
    pub emails: Vec<Email>,
    pub next_page_token: Option<PageToken>,
    pub total_results: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub listed: usize,
    pub inserted: usize,
    pub existing: usize,
    pub refreshed: usize,
    pub dropped: usize,
    /// Normalized messages whose write failed; the rest of the page is kept.
    pub failed: usize,
    pub next_page_token: Option<PageToken>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOptions {
    pub max_results: Option<u32>,
    pub query: Option<String>,
    /// Continue from the cursor stored by the previous sync.
    pub resume: bool,
}

struct IngestedPage {
    page: FetchPage,
    report: SyncReport,
}

pub fn page_token_key(user_id: i64) -> String {
    format!("gmail_page_token:{user_id}")
}

pub struct InboxService<A, T> {
    api: A,
    tokens: T,
    upsert_mode: UpsertMode,
}

impl<A, T> InboxService<A, T>
where
    A: MailboxApi,
    T: TokenEndpoint,
{
    pub fn new(api: A, tokens: T) -> Self {
        Self {
            api,
            tokens,
            upsert_mode: UpsertMode::default(),
        }
    }

    pub fn with_upsert_mode(mut self, mode: UpsertMode) -> Self {
        self.upsert_mode = mode;
        self
    }

    /// Fetches one page of the remote mailbox and stores every message that
    /// normalizes cleanly.
    pub async fn fetch(
        &self,
        db: &Database,
        user_id: i64,
        options: &FetchOptions,
    ) -> Result<FetchPage, IngestError> {
        Ok(self.ingest_page(db, user_id, options).await?.page)
    }

    /// Same as [`fetch`](Self::fetch) with a mandatory remote search query.
    pub async fn search(
        &self,
        db: &Database,
        user_id: i64,
        query: &str,
        options: &FetchOptions,
    ) -> Result<FetchPage, IngestError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(IngestError::Validation(
                "search query is required".to_string(),
            ));
        }

        let options = FetchOptions {
            query: Some(query.to_string()),
            ..options.clone()
        };
        self.fetch(db, user_id, &options).await
    }

    /// Reads one stored email owned by `user_id`.
    pub fn get_by_id(
        &self,
        db: &Database,
        user_id: i64,
        id: i64,
    ) -> Result<Option<Email>, IngestError> {
        load_user(db, user_id)?;
        Ok(db.get_email(user_id, id)?)
    }

    pub fn stats(&self, db: &Database, user_id: i64) -> Result<EmailStats, IngestError> {
        load_user(db, user_id)?;
        Ok(db.get_stats(user_id)?)
    }

    /// Ingests one page and remembers where the next one starts.
    pub async fn sync(
        &self,
        db: &Database,
        user_id: i64,
        options: &SyncOptions,
    ) -> Result<SyncReport, IngestError> {
        let key = page_token_key(user_id);
        let page_token = if options.resume {
            db.get_sync_state(&key)?
                .and_then(|state| state.value)
                .filter(|value| !value.is_empty())
                .map(PageToken::new)
        } else {
            None
        };

        let fetch_options = FetchOptions {
            max_results: options.max_results,
            page_token,
            query: options.query.clone(),
        };
        let ingested = self.ingest_page(db, user_id, &fetch_options).await?;

        match &ingested.report.next_page_token {
            Some(next) => db.set_sync_state(&key, next.as_str())?,
            None => db.clear_sync_state(&key)?,
        }

        Ok(ingested.report)
    }

    async fn ingest_page(
        &self,
        db: &Database,
        user_id: i64,
        options: &FetchOptions,
    ) -> Result<IngestedPage, IngestError> {
        let max_results = validate_page_size(options.max_results)?;
        let mut user = load_user(db, user_id)?;
        let credential = ensure_fresh_credential(db, &self.tokens, &mut user).await?;

        let request = ListRequest {
            max_results,
            query: options.query.clone().filter(|q| !q.trim().is_empty()),
            page_token: options.page_token.clone(),
        };
        let list = self
            .api
            .list_messages(&credential.access_token, &request)
            .await?;

        let mut report = SyncReport {
            listed: list.ids.len(),
            ..SyncReport::default()
        };

        if list.ids.is_empty() {
            db.set_last_sync(user.id, Utc::now())?;
            info!("gmail fetch for user {}: mailbox page empty", user.id);
            return Ok(IngestedPage {
                page: FetchPage::default(),
                report,
            });
        }

        let details = join_all(
            list.ids
                .iter()
                .map(|id| self.api.get_message(&credential.access_token, id)),
        )
        .await;

        let mut normalized = Vec::with_capacity(details.len());
        for (id, detail) in list.ids.iter().zip(details) {
            match detail.and_then(|message| normalize_message(&message, user.id)) {
                Ok(email) => normalized.push(email),
                Err(error) if error.is_terminal() => return Err(error),
                Err(error) => {
                    warn!("dropping gmail message {id}: {error}");
                    report.dropped += 1;
                }
            }
        }

        let mut emails = Vec::with_capacity(normalized.len());
        for email in normalized {
            let gmail_id = email.gmail_id.clone();
            match self.store(db, &user, email, &mut report) {
                Ok(stored) => emails.push(stored),
                Err(error) => {
                    warn!("failed to store gmail message {gmail_id}: {error}");
                    report.failed += 1;
                }
            }
        }

        db.set_last_sync(user.id, Utc::now())?;
        info!(
            "gmail fetch for user {}: {} listed, {} inserted, {} existing, {} refreshed, {} dropped, {} failed",
            user.id,
            report.listed,
            report.inserted,
            report.existing,
            report.refreshed,
            report.dropped,
            report.failed
        );

        report.next_page_token = list.next_page_token.clone();
        Ok(IngestedPage {
            page: FetchPage {
                emails,
                next_page_token: list.next_page_token,
                total_results: list.result_size_estimate,
            },
            report,
        })
    }

    /// Writes `email` according to the upsert mode. The returned email is
    /// always the freshly normalized one; the mode only decides what is written.
    fn store(
        &self,
        db: &Database,
        user: &User,
        mut email: Email,
        report: &mut SyncReport,
    ) -> Result<Email, DbError> {
        let outcome = match db.insert_email_if_absent(&email)? {
            UpsertOutcome::Existing(id) if self.upsert_mode == UpsertMode::RefreshLabels => db
                .refresh_email_labels(user.id, &email.gmail_id, &email.labels)?
                .map(UpsertOutcome::Refreshed)
                .unwrap_or(UpsertOutcome::Existing(id)),
            outcome => outcome,
        };

        match outcome {
            UpsertOutcome::Inserted(_) => report.inserted += 1,
            UpsertOutcome::Existing(_) => report.existing += 1,
            UpsertOutcome::Refreshed(_) => report.refreshed += 1,
        }
        email.id = Some(outcome.id());
        Ok(email)
    }
}

fn validate_page_size(requested: Option<u32>) -> Result<u32, IngestError> {
    let size = requested.unwrap_or(DEFAULT_PAGE_SIZE);
    if !(1..=MAX_PAGE_SIZE).contains(&size) {
        return Err(IngestError::Validation(format!(
            "max_results must be between 1 and {MAX_PAGE_SIZE}, got {size}"
        )));
    }
    Ok(size)
}

fn load_user(db: &Database, user_id: i64) -> Result<User, IngestError> {
    db.get_user(user_id)?
        .ok_or(IngestError::UserNotFound(user_id))
}
