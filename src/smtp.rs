//! Outgoing message composition and SMTP submission
//!
//! Messages are built with `lettre`. IMAP accounts submit through their
//! configured SMTP server; Gmail accounts reuse the composer and upload the
//! formatted RFC822 bytes through the API.

use std::time::Duration;

use lettre::message::header::ContentType;
use lettre::message::{Mailbox, MessageBuilder};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use secrecy::{ExposeSecret, SecretString};

use crate::accounts::SmtpSettings;
use crate::errors::{AppError, AppResult};
use crate::models::OutgoingMessage;

/// Port that uses implicit TLS; every other port upgrades with STARTTLS
const IMPLICIT_TLS_PORT: u16 = 465;

/// Build the sender mailbox from an address and optional display name
pub fn sender(address: &str, display_name: Option<&str>) -> AppResult<Mailbox> {
    let address = address
        .parse::<Address>()
        .map_err(|e| AppError::Configuration(format!("invalid sender address '{address}': {e}")))?;
    Ok(Mailbox::new(display_name.map(str::to_owned), address))
}

/// Compose an RFC822 message
///
/// `keep_bcc` retains the Bcc header in the formatted output, which API
/// uploads need because they derive recipients from the headers.
pub fn compose(from: Mailbox, outgoing: &OutgoingMessage, keep_bcc: bool) -> AppResult<Message> {
    validate(outgoing)?;

    let mut builder = Message::builder().from(from).subject(outgoing.subject.as_str());
    builder = add_recipients(builder, &outgoing.to, MessageBuilder::to)?;
    builder = add_recipients(builder, &outgoing.cc, MessageBuilder::cc)?;
    builder = add_recipients(builder, &outgoing.bcc, MessageBuilder::bcc)?;
    if keep_bcc {
        builder = builder.keep_bcc();
    }

    let content_type = if outgoing.html {
        ContentType::TEXT_HTML
    } else {
        ContentType::TEXT_PLAIN
    };
    builder
        .header(content_type)
        .body(outgoing.body.clone())
        .map_err(|e| AppError::invalid(format!("cannot build message: {e}")))
}

fn add_recipients(
    mut builder: MessageBuilder,
    addresses: &[String],
    add: fn(MessageBuilder, Mailbox) -> MessageBuilder,
) -> AppResult<MessageBuilder> {
    for address in addresses {
        let mailbox = address
            .parse::<Mailbox>()
            .map_err(|e| AppError::invalid(format!("invalid recipient '{address}': {e}")))?;
        builder = add(builder, mailbox);
    }
    Ok(builder)
}

fn validate(outgoing: &OutgoingMessage) -> AppResult<()> {
    if outgoing.to.is_empty() {
        return Err(AppError::invalid("at least one recipient is required"));
    }
    if outgoing.subject.chars().any(|ch| ch == '\r' || ch == '\n') {
        return Err(AppError::invalid("subject must not contain line breaks"));
    }
    Ok(())
}

/// Submit a message through an SMTP server
///
/// # Errors
///
/// - `Timeout` if the server does not answer within `timeout`
/// - `AuthFailed` if credentials are rejected
/// - `Provider` for any other SMTP failure
pub async fn send(
    settings: &SmtpSettings,
    user: &str,
    password: &SecretString,
    message: Message,
    timeout: Duration,
) -> AppResult<()> {
    let builder = if settings.port == IMPLICIT_TLS_PORT {
        AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.host)
    } else {
        AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)
    }
    .map_err(|e| AppError::Configuration(format!("invalid SMTP host '{}': {e}", settings.host)))?;

    let transport = builder
        .port(settings.port)
        .credentials(Credentials::new(
            user.to_owned(),
            password.expose_secret().to_owned(),
        ))
        .timeout(Some(timeout))
        .build();

    transport.send(message).await.map_err(|e| {
        if e.is_timeout() {
            AppError::Timeout(format!("SMTP submission timed out: {e}"))
        } else if e.is_permanent() && e.to_string().to_ascii_lowercase().contains("auth") {
            AppError::AuthFailed(e.to_string())
        } else {
            AppError::Provider(format!("SMTP submission failed: {e}"))
        }
    })?;
    Ok(())
}
