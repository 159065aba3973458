//! Message parsing and MIME handling
//!
//! Parses RFC822 messages using `mailparse`, extracts a plain text body
//! (converting HTML with `html2text` when no text part exists), and collects
//! attachment metadata. Shared by the IMAP and Gmail handlers.

use std::collections::BTreeMap;

use mailparse::{DispositionType, MailHeader, ParsedMail};

use crate::errors::{AppError, AppResult};
use crate::models::AttachmentInfo;

/// Column width used when rendering HTML bodies as text
const HTML_TEXT_WIDTH: usize = 100;

/// Parsed message representation
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub date: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub cc: Option<String>,
    pub subject: Option<String>,
    /// Plain text body, truncated to the requested character count
    pub body_text: Option<String>,
    pub attachments: Vec<AttachmentInfo>,
}

/// Parse RFC822 message into structured representation
///
/// # Errors
///
/// - `Provider` if `mailparse` rejects the message
pub fn parse_message(raw: &[u8], body_max_chars: usize) -> AppResult<ParsedMessage> {
    let parsed = mailparse::parse_mail(raw)
        .map_err(|e| AppError::Provider(format!("failed to parse RFC822 message: {e}")))?;

    let mut body_text = None;
    let mut body_html = None;
    let mut attachments = Vec::new();
    walk_parts(
        &parsed,
        "1".to_owned(),
        &mut body_text,
        &mut body_html,
        &mut attachments,
    )?;

    let body = body_text
        .or_else(|| {
            body_html.and_then(|html| html2text::from_read(html.as_bytes(), HTML_TEXT_WIDTH).ok())
        })
        .map(|text| truncate_chars(text, body_max_chars));

    let headers = to_header_map(&to_tuples(&parsed.headers));
    Ok(ParsedMessage {
        date: headers.get("date").cloned(),
        from: headers.get("from").cloned(),
        to: headers.get("to").cloned(),
        cc: headers.get("cc").cloned(),
        subject: headers.get("subject").cloned(),
        body_text: body,
        attachments,
    })
}

/// Walk MIME part tree recursively
///
/// Keeps the first text/plain and text/html bodies and records every
/// attachment.
fn walk_parts(
    part: &ParsedMail<'_>,
    part_id: String,
    body_text: &mut Option<String>,
    body_html: &mut Option<String>,
    attachments: &mut Vec<AttachmentInfo>,
) -> AppResult<()> {
    if part.subparts.is_empty() {
        let ctype = part.ctype.mimetype.to_ascii_lowercase();
        let disp = part.get_content_disposition();
        let filename = attachment_filename(part, &disp.params);
        let is_attachment = disp.disposition == DispositionType::Attachment || filename.is_some();

        if is_attachment {
            let raw_body = part
                .get_body_raw()
                .map_err(|e| AppError::Provider(format!("failed decoding attachment body: {e}")))?;
            attachments.push(AttachmentInfo {
                filename,
                content_type: ctype,
                size_bytes: raw_body.len(),
                part_id,
            });
            return Ok(());
        }

        if ctype == "text/plain"
            && body_text.is_none()
            && let Ok(text) = part.get_body()
        {
            *body_text = Some(text);
        }
        if ctype == "text/html"
            && body_html.is_none()
            && let Ok(html) = part.get_body()
        {
            *body_html = Some(html);
        }
        return Ok(());
    }

    for (idx, sub) in part.subparts.iter().enumerate() {
        walk_parts(
            sub,
            format!("{part_id}.{}", idx + 1),
            body_text,
            body_html,
            attachments,
        )?;
    }
    Ok(())
}

/// Attachment filename from Content-Disposition, falling back to the
/// Content-Type `name` parameter
fn attachment_filename(
    part: &ParsedMail<'_>,
    disp_params: &BTreeMap<String, String>,
) -> Option<String> {
    disp_params
        .get("filename")
        .cloned()
        .or_else(|| part.ctype.params.get("name").cloned())
}

/// Parse header bytes into key-value pairs
pub fn parse_header_bytes(header_bytes: &[u8]) -> AppResult<Vec<(String, String)>> {
    let (headers, _) = mailparse::parse_headers(header_bytes)
        .map_err(|e| AppError::Provider(format!("failed to parse message headers: {e}")))?;
    Ok(to_tuples(&headers))
}

fn to_tuples(headers: &[MailHeader<'_>]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|h| (h.get_key(), h.get_value()))
        .collect()
}

/// First value for each header key, keyed in lowercase
fn to_header_map(headers: &[(String, String)]) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for (k, v) in headers {
        map.entry(k.to_ascii_lowercase()).or_insert_with(|| v.clone());
    }
    map
}

/// Get header value by case-insensitive key
pub fn header_value(headers: &[(String, String)], key: &str) -> Option<String> {
    headers
        .iter()
        .find_map(|(k, v)| k.eq_ignore_ascii_case(key).then(|| v.clone()))
}

/// Truncate string to maximum characters (Unicode-aware)
pub fn truncate_chars(input: String, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input;
    }
    input.chars().take(max_chars).collect()
}
