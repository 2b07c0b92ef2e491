use anyhow::Result;

use crate::db::models::{Email, EmailStats, User};
use crate::ingest::{FetchPage, SyncReport};

pub fn format_page(page: &FetchPage) -> Result<String> {
    Ok(serde_json::to_string_pretty(page)?)
}

pub fn format_emails(emails: &[Email]) -> Result<String> {
    Ok(serde_json::to_string_pretty(emails)?)
}

pub fn format_email(email: &Email) -> Result<String> {
    Ok(serde_json::to_string_pretty(email)?)
}

pub fn format_stats(stats: &EmailStats) -> Result<String> {
    Ok(serde_json::to_string_pretty(stats)?)
}

pub fn format_users(users: &[User]) -> Result<String> {
    Ok(serde_json::to_string_pretty(users)?)
}

pub fn format_user(user: &User) -> Result<String> {
    Ok(serde_json::to_string_pretty(user)?)
}

pub fn format_sync_report(report: &SyncReport) -> Result<String> {
    Ok(serde_json::to_string_pretty(report)?)
}
