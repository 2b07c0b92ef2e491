use chrono::{DateTime, Utc};
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::db::models::{Email, EmailStats, User};
use crate::ingest::{FetchPage, SyncReport};

const ID_WIDTH: usize = 6;
const FLAGS_WIDTH: usize = 3;
const FROM_WIDTH: usize = 24;
const SUBJECT_WIDTH: usize = 52;
const DATE_WIDTH: usize = 12;
const HTML_RENDER_WIDTH: usize = 100;

pub fn format_page(page: &FetchPage) -> String {
    let mut out = format_emails(&page.emails);
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&format!("\nEstimated total: {}\n", page.total_results));
    if let Some(token) = &page.next_page_token {
        out.push_str(&format!("Next page token: {token}\n"));
    }
    out
}

pub fn format_emails(emails: &[Email]) -> String {
    if emails.is_empty() {
        return "No emails found.".to_string();
    }

    let mut out = String::new();
    out.push_str(&format!(
        "{:>id$}  {:<flags$}  {:<from$}  {:<subject$}  {:<date$}\n",
        "ID",
        "",
        "From",
        "Subject",
        "Date",
        id = ID_WIDTH,
        flags = FLAGS_WIDTH,
        from = FROM_WIDTH,
        subject = SUBJECT_WIDTH,
        date = DATE_WIDTH
    ));
    out.push_str(&format!(
        "{}  {}  {}  {}  {}\n",
        "-".repeat(ID_WIDTH),
        "-".repeat(FLAGS_WIDTH),
        "-".repeat(FROM_WIDTH),
        "-".repeat(SUBJECT_WIDTH),
        "-".repeat(DATE_WIDTH)
    ));

    for email in emails {
        let id = email
            .id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        let from = pad_to_width(&truncate_for_width(sender_label(email), FROM_WIDTH), FROM_WIDTH);
        let subject = pad_to_width(
            &truncate_for_width(subject_label(email), SUBJECT_WIDTH),
            SUBJECT_WIDTH,
        );
        let date = truncate_for_width(&relative_date(&email.date), DATE_WIDTH);

        out.push_str(&format!(
            "{:>id$}  {:<flags$}  {}  {}  {}\n",
            id,
            flag_marks(email),
            from,
            subject,
            date,
            id = ID_WIDTH,
            flags = FLAGS_WIDTH,
        ));
    }

    out
}

pub fn format_email(email: &Email) -> String {
    let mut out = String::new();
    if let Some(id) = email.id {
        out.push_str(&format!("ID: {id}\n"));
    }
    out.push_str(&format!("Gmail ID: {}\n", email.gmail_id));
    out.push_str(&format!("Subject: {}\n", subject_label(email)));
    if email.from.name.is_empty() {
        out.push_str(&format!("From: {}\n", email.from.address));
    } else {
        out.push_str(&format!(
            "From: {} <{}>\n",
            email.from.name, email.from.address
        ));
    }
    if !email.to.is_empty() {
        out.push_str(&format!("To: {}\n", email.to.join(", ")));
    }
    if !email.cc.is_empty() {
        out.push_str(&format!("CC: {}\n", email.cc.join(", ")));
    }
    if !email.bcc.is_empty() {
        out.push_str(&format!("BCC: {}\n", email.bcc.join(", ")));
    }
    out.push_str(&format!(
        "Date: {} ({})\n",
        email.date.to_rfc3339(),
        relative_date(&email.date)
    ));
    if !email.labels.is_empty() {
        out.push_str(&format!("Labels: {}\n", email.labels.join(", ")));
    }
    if !email.thread_id.is_empty() {
        out.push_str(&format!("Thread: {}\n", email.thread_id));
    }

    if !email.attachments.is_empty() {
        out.push_str("Attachments:\n");
        for attachment in &email.attachments {
            out.push_str(&format!(
                "  {} ({}, {} bytes)\n",
                attachment.filename, attachment.mime_type, attachment.size
            ));
        }
    }

    out.push('\n');
    out.push_str("Body\n");
    out.push_str("----\n");
    out.push_str(&display_body(email));
    out.push('\n');
    out
}

pub fn format_stats(stats: &EmailStats) -> String {
    let mut out = String::new();
    out.push_str("Mailbox Stats\n");
    out.push_str("=============\n");
    out.push_str(&format!("Emails:    {}\n", stats.total_emails));
    out.push_str(&format!("Unread:    {}\n", stats.unread_count));
    out.push_str(&format!("Starred:   {}\n", stats.starred_count));
    out.push_str(&format!("Important: {}\n", stats.important_count));
    out
}

pub fn format_users(users: &[User]) -> String {
    if users.is_empty() {
        return "No users registered.".to_string();
    }

    let mut out = String::new();
    out.push_str("    ID  User                            Last Sync\n");
    out.push_str("------  ------------------------------  ------------\n");
    for user in users {
        let label = if user.name.is_empty() {
            user.email.clone()
        } else {
            format!("{} <{}>", user.name, user.email)
        };
        let last_sync = user
            .last_sync
            .as_ref()
            .map(relative_date)
            .unwrap_or_else(|| "never".to_string());
        out.push_str(&format!(
            "{:>6}  {}  {}\n",
            user.id,
            pad_to_width(&truncate_for_width(&label, 30), 30),
            last_sync
        ));
    }
    out
}

pub fn format_user(user: &User) -> String {
    let mut out = String::new();
    out.push_str(&format!("ID: {}\n", user.id));
    out.push_str(&format!("Google ID: {}\n", user.google_id));
    out.push_str(&format!("Email: {}\n", user.email));
    out.push_str(&format!("Name: {}\n", user.name));
    out.push_str(&format!(
        "Refresh token: {}\n",
        if user.refresh_token.is_some() {
            "stored"
        } else {
            "missing"
        }
    ));
    out.push_str(&format!(
        "Token expiry: {}\n",
        user.token_expiry
            .map(|expiry| expiry.to_rfc3339())
            .unwrap_or_else(|| "-".to_string())
    ));
    out.push_str(&format!(
        "Last sync: {}\n",
        user.last_sync
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
    ));
    out.push_str(&format!("Preferences: {}\n", user.preferences));
    out
}

pub fn format_sync_report(report: &SyncReport) -> String {
    let mut out = String::new();
    out.push_str(&format!("Listed:    {}\n", report.listed));
    out.push_str(&format!("Inserted:  {}\n", report.inserted));
    out.push_str(&format!("Existing:  {}\n", report.existing));
    if report.refreshed > 0 {
        out.push_str(&format!("Refreshed: {}\n", report.refreshed));
    }
    out.push_str(&format!("Dropped:   {}\n", report.dropped));
    if report.failed > 0 {
        out.push_str(&format!("Failed:    {}\n", report.failed));
    }
    match &report.next_page_token {
        Some(token) => out.push_str(&format!("Next page: {token}\n")),
        None => out.push_str("Next page: (none, mailbox exhausted)\n"),
    }
    out
}

fn sender_label(email: &Email) -> &str {
    if !email.from.name.is_empty() {
        &email.from.name
    } else if !email.from.address.is_empty() {
        &email.from.address
    } else {
        "(unknown)"
    }
}

fn subject_label(email: &Email) -> &str {
    if email.subject.is_empty() {
        "(no subject)"
    } else {
        &email.subject
    }
}

fn flag_marks(email: &Email) -> String {
    let mut marks = String::new();
    marks.push(if email.is_read { ' ' } else { 'U' });
    marks.push(if email.is_starred { '*' } else { ' ' });
    marks.push(if email.is_important { '!' } else { ' ' });
    marks
}

/// Plain text body, or the HTML body rendered to text when that is all there is.
fn display_body(email: &Email) -> String {
    if !email.body_text.trim().is_empty() {
        return email.body_text.clone();
    }
    if email.body_html.trim().is_empty() {
        return if email.snippet.is_empty() {
            "(empty)".to_string()
        } else {
            email.snippet.clone()
        };
    }

    let html = email.body_html.clone();
    std::panic::catch_unwind(move || {
        html2text::from_read(html.as_bytes(), HTML_RENDER_WIDTH)
            .lines()
            .map(str::trim_end)
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    })
    .ok()
    .filter(|text| !text.is_empty())
    .unwrap_or_else(|| email.snippet.clone())
}

fn relative_date(date: &DateTime<Utc>) -> String {
    let delta = Utc::now().signed_duration_since(*date);
    if delta.num_seconds() < 0 {
        return "in future".to_string();
    }
    if delta.num_minutes() < 1 {
        return "just now".to_string();
    }
    if delta.num_hours() < 1 {
        return format!("{}m ago", delta.num_minutes());
    }
    if delta.num_hours() < 24 {
        return format!("{}h ago", delta.num_hours());
    }
    if delta.num_days() == 1 {
        return "yesterday".to_string();
    }
    if delta.num_days() < 7 {
        return format!("{}d ago", delta.num_days());
    }
    date.format("%Y-%m-%d").to_string()
}

fn truncate_for_width(value: &str, max_width: usize) -> String {
    if UnicodeWidthStr::width(value) <= max_width {
        return value.to_string();
    }

    if max_width <= 1 {
        return "…".to_string();
    }

    let mut out = String::new();
    let mut width = 0usize;
    for c in value.chars() {
        let cw = UnicodeWidthChar::width(c).unwrap_or(0);
        if width + cw + 1 > max_width {
            break;
        }
        out.push(c);
        width += cw;
    }
    out.push('…');
    out
}

/// `format!` pads by char count; wide glyphs need padding by display width.
fn pad_to_width(value: &str, width: usize) -> String {
    let current = UnicodeWidthStr::width(value);
    let mut out = value.to_string();
    out.push_str(&" ".repeat(width.saturating_sub(current)));
    out
}
