pub mod json;
pub mod table;

use anyhow::Result;

use crate::db::models::{Email, EmailStats, User};
use crate::ingest::{FetchPage, SyncReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
}

impl OutputFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            Self::Json
        } else {
            Self::Table
        }
    }
}

pub fn format_page(format: OutputFormat, page: &FetchPage) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_page(page)),
        OutputFormat::Json => json::format_page(page),
    }
}

pub fn format_emails(format: OutputFormat, emails: &[Email]) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_emails(emails)),
        OutputFormat::Json => json::format_emails(emails),
    }
}

pub fn format_email(format: OutputFormat, email: &Email) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_email(email)),
        OutputFormat::Json => json::format_email(email),
    }
}

pub fn format_stats(format: OutputFormat, stats: &EmailStats) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_stats(stats)),
        OutputFormat::Json => json::format_stats(stats),
    }
}

pub fn format_users(format: OutputFormat, users: &[User]) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_users(users)),
        OutputFormat::Json => json::format_users(users),
    }
}

pub fn format_user(format: OutputFormat, user: &User) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_user(user)),
        OutputFormat::Json => json::format_user(user),
    }
}

pub fn format_sync_report(format: OutputFormat, report: &SyncReport) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_sync_report(report)),
        OutputFormat::Json => json::format_sync_report(report),
    }
}
