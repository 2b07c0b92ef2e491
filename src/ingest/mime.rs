//! Flattens a Gmail `format=full` message into an [`Email`] row.
//!
//! The part tree is walked pre-order through [`MimeNode`], threading a
//! [`PartAccumulator`] through the recursion. Normalization is a pure function
//! of the message: the same input always yields the same record.

use std::sync::OnceLock;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;

use crate::connectors::{GmailHeader, GmailMessage, GmailPayload};
use crate::db::models::{Attachment, Email, LabelFlags, Sender};
use crate::error::IngestError;

/// One node of a MIME part tree.
pub trait MimeNode: Sized {
    fn mime_type(&self) -> &str;
    /// Raw base64url body data, if the part carries it inline.
    fn body_data(&self) -> Option<&str>;
    fn filename(&self) -> Option<&str>;
    fn attachment_id(&self) -> Option<&str>;
    fn size(&self) -> u64;
    fn children(&self) -> &[Self];
}

impl MimeNode for GmailPayload {
    fn mime_type(&self) -> &str {
        self.mime_type.as_deref().unwrap_or_default()
    }

    fn body_data(&self) -> Option<&str> {
        self.body
            .as_ref()
            .and_then(|body| body.data.as_deref())
            .filter(|data| !data.is_empty())
    }

    fn filename(&self) -> Option<&str> {
        self.filename.as_deref().filter(|name| !name.is_empty())
    }

    fn attachment_id(&self) -> Option<&str> {
        self.body
            .as_ref()
            .and_then(|body| body.attachment_id.as_deref())
            .filter(|id| !id.is_empty())
    }

    fn size(&self) -> u64 {
        self.body.as_ref().and_then(|body| body.size).unwrap_or_default()
    }

    fn children(&self) -> &[Self] {
        &self.parts
    }
}

/// Bodies and attachments collected while walking a part tree.
#[derive(Debug, Default, PartialEq)]
pub struct PartAccumulator {
    pub text: Option<String>,
    pub html: Option<String>,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyDecodeError {
    pub mime_type: String,
    pub reason: String,
}

impl std::fmt::Display for BodyDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "undecodable {} body: {}", self.mime_type, self.reason)
    }
}

/// Visits `node` and then its children in order. Parts with a filename and a
/// remote attachment id are recorded as attachments. Every other part with
/// inline data is a body candidate, and the first `text/plain` and the first
/// `text/html` win.
pub fn collect_parts<N: MimeNode>(
    node: &N,
    acc: &mut PartAccumulator,
) -> Result<(), BodyDecodeError> {
    if let (Some(filename), Some(attachment_id)) = (node.filename(), node.attachment_id()) {
        acc.attachments.push(Attachment {
            filename: filename.to_string(),
            mime_type: node.mime_type().to_string(),
            size: node.size(),
            attachment_id: attachment_id.to_string(),
        });
    } else if let Some(data) = node.body_data() {
        let mime_type = node.mime_type();
        let slot = if mime_type.eq_ignore_ascii_case("text/plain") {
            Some(&mut acc.text)
        } else if mime_type.eq_ignore_ascii_case("text/html") {
            Some(&mut acc.html)
        } else {
            None
        };

        if let Some(slot) = slot.filter(|slot| slot.is_none()) {
            let decoded = decode_body_data(data).map_err(|reason| BodyDecodeError {
                mime_type: mime_type.to_string(),
                reason,
            })?;
            *slot = Some(decoded);
        }
    }

    for child in node.children() {
        collect_parts(child, acc)?;
    }

    Ok(())
}

/// Decodes Gmail body data. Padding, embedded whitespace and the standard
/// base64 alphabet are tolerated; invalid UTF-8 is replaced.
pub fn decode_body_data(data: &str) -> Result<String, String> {
    let normalized: String = data
        .chars()
        .filter(|ch| !ch.is_ascii_whitespace())
        .map(|ch| match ch {
            '+' => '-',
            '/' => '_',
            other => other,
        })
        .collect();
    let bytes = URL_SAFE_NO_PAD
        .decode(normalized.trim_end_matches('='))
        .map_err(|error| error.to_string())?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Case-insensitive header lookup; a missing header is an empty string.
pub fn header_value<'a>(headers: &'a [GmailHeader], name: &str) -> &'a str {
    headers
        .iter()
        .find(|header| header.name.eq_ignore_ascii_case(name))
        .map(|header| header.value.as_str())
        .unwrap_or_default()
}

fn named_sender_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(.+?)\s*<(.+?)>$").expect("compile named sender regex")
    })
}

fn bare_angle_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"<(.+?)>$").expect("compile angle address regex"))
}

/// Splits a `From` header into display name and address.
pub fn parse_sender(raw: &str) -> Sender {
    let raw = raw.trim();

    if let Some(captures) = named_sender_pattern().captures(raw) {
        return Sender {
            name: captures[1].replace('"', "").trim().to_string(),
            address: captures[2].trim().to_string(),
        };
    }

    let address = bare_angle_pattern()
        .captures(raw)
        .map(|captures| captures[1].trim().to_string())
        .unwrap_or_else(|| raw.to_string());

    Sender {
        name: String::new(),
        address,
    }
}

/// Splits a recipient header on commas outside quoted display names.
pub fn parse_recipients(raw: &str) -> Vec<String> {
    let mut recipients = Vec::new();
    let mut in_quotes = false;
    let mut current = String::new();

    for ch in raw.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ',' if !in_quotes => {
                push_recipient(&mut recipients, &current);
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    push_recipient(&mut recipients, &current);

    recipients
}

fn push_recipient(recipients: &mut Vec<String>, entry: &str) {
    let entry = entry.trim();
    if !entry.is_empty() {
        recipients.push(entry.to_string());
    }
}

fn parse_internal_date(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|millis| millis.trim().parse::<i64>().ok())
        .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
}

fn parse_date_header(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    // Trailing zone comments such as "(UTC)" are common and not always accepted.
    let without_comment = match raw.rfind('(') {
        Some(start) if raw.ends_with(')') => raw[..start].trim_end(),
        _ => raw,
    };

    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc2822(without_comment))
        .ok()
        .map(|date| date.with_timezone(&Utc))
}

fn decode_snippet_entities(snippet: &str) -> String {
    snippet
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Normalizes one fetched message for `user_id`. Failures name the message so
/// the caller can drop it and keep going.
pub fn normalize_message(message: &GmailMessage, user_id: i64) -> Result<Email, IngestError> {
    let headers = &message.payload.headers;

    let mut parts = PartAccumulator::default();
    collect_parts(&message.payload, &mut parts)
        .map_err(|error| IngestError::transient(&message.id, error))?;

    let date = parse_internal_date(message.internal_date.as_deref())
        .or_else(|| parse_date_header(header_value(headers, "Date")))
        .ok_or_else(|| IngestError::transient(&message.id, "no internalDate or Date header"))?;

    let flags = LabelFlags::from_labels(&message.label_ids);

    Ok(Email {
        id: None,
        user_id,
        gmail_id: message.id.clone(),
        message_id: header_value(headers, "Message-ID").to_string(),
        thread_id: message.thread_id.clone(),
        subject: header_value(headers, "Subject").to_string(),
        from: parse_sender(header_value(headers, "From")),
        to: parse_recipients(header_value(headers, "To")),
        cc: parse_recipients(header_value(headers, "Cc")),
        bcc: parse_recipients(header_value(headers, "Bcc")),
        date,
        body_text: parts.text.unwrap_or_default(),
        body_html: parts.html.unwrap_or_default(),
        attachments: parts.attachments,
        labels: message.label_ids.clone(),
        is_read: flags.is_read,
        is_starred: flags.is_starred,
        is_important: flags.is_important,
        snippet: decode_snippet_entities(&message.snippet),
    })
}
