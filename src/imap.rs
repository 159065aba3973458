//! IMAP session handler
//!
//! Provides timeout-bounded wrappers around `async-imap` operations and the
//! stateful [`ImapHandler`] that keeps one authenticated session per account.
//! All network calls are enforced to use TLS.

use std::sync::Arc;
use std::time::Duration;

use async_imap::types::{Fetch, Flag};
use async_imap::{Client, Session};
use async_trait::async_trait;
use futures::TryStreamExt;
use rustls::ClientConfig;
use rustls::RootCertStore;
use rustls_pki_types::ServerName;
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use crate::accounts::{ImapAccount, StoredSecret};
use crate::config::Timeouts;
use crate::crypto::SecretCipher;
use crate::errors::{AppError, AppResult};
use crate::handler::MailHandler;
use crate::message_id::MessageId;
use crate::mime;
use crate::models::{
    ListQuery, MessageDetail, MessageSummary, OutgoingMessage, SearchQuery, SendReceipt,
};
use crate::smtp;

/// Authenticated IMAP session over TLS
pub type ImapSession = Session<tokio_rustls::client::TlsStream<TcpStream>>;

const INBOX: &str = "INBOX";

/// Resolve a stored password, decrypting it when necessary
///
/// `cipher` is only invoked for encrypted secrets, so accounts with
/// plaintext passwords work without a configured secret key.
pub fn resolve_password(
    stored: &StoredSecret,
    cipher: impl FnOnce() -> AppResult<SecretCipher>,
) -> AppResult<SecretString> {
    match stored {
        StoredSecret::Plain(secret) => Ok(secret.clone()),
        StoredSecret::Encrypted(payload) => {
            let plaintext = cipher()?.decrypt(payload)?;
            Ok(SecretString::new(plaintext.into()))
        }
    }
}

/// Stateful handler owning one IMAP session
///
/// The session is opened on first use. When an operation fails in a way
/// that may have broken the connection, the session is dropped and the
/// next call reconnects.
pub struct ImapHandler {
    account: ImapAccount,
    password: SecretString,
    timeouts: Timeouts,
    session: Mutex<Option<ImapSession>>,
}

impl ImapHandler {
    pub fn new(account: ImapAccount, password: SecretString, timeouts: Timeouts) -> Self {
        Self {
            account,
            password,
            timeouts,
            session: Mutex::new(None),
        }
    }

    async fn ensure_connected<'s>(
        &self,
        slot: &'s mut Option<ImapSession>,
    ) -> AppResult<&'s mut ImapSession> {
        if slot.is_none() {
            let session = connect_authenticated(&self.timeouts, &self.account, &self.password).await?;
            tracing::info!(host = %self.account.host, user = %self.account.user, "imap session opened");
            *slot = Some(session);
        }
        slot.as_mut()
            .ok_or_else(|| AppError::Internal("imap session unavailable".to_owned()))
    }

    fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.socket_ms)
    }
}

/// Errors after which the session can no longer be trusted
fn is_connection_fatal(err: &AppError) -> bool {
    matches!(
        err,
        AppError::Timeout(_) | AppError::Provider(_) | AppError::Internal(_)
    )
}

/// Run `$body` against the pooled session, dropping it on fatal errors
macro_rules! with_session {
    ($handler:expr, $session:ident => $body:expr) => {{
        let mut guard = $handler.session.lock().await;
        let result = match $handler.ensure_connected(&mut guard).await {
            Ok($session) => $body.await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result
            && is_connection_fatal(e)
        {
            tracing::warn!(host = %$handler.account.host, error = %e, "dropping imap session");
            *guard = None;
        }
        result
    }};
}

#[async_trait]
impl MailHandler for ImapHandler {
    async fn probe(&self, account_id: &str) -> AppResult<()> {
        let timeout = self.socket_timeout();
        with_session!(self, session => noop(timeout, session))?;
        tracing::debug!(account = %account_id, "imap probe succeeded");
        Ok(())
    }

    async fn list_messages(
        &self,
        _account_id: &str,
        query: ListQuery,
    ) -> AppResult<Vec<MessageSummary>> {
        let mailbox = query.mailbox.unwrap_or_else(|| INBOX.to_owned());
        validate_mailbox(&mailbox)?;
        let criteria = if query.unread_only { "UNSEEN" } else { "ALL" };
        let timeout = self.socket_timeout();
        with_session!(self, session => summaries(timeout, session, &mailbox, criteria, query.max_results))
    }

    async fn search_messages(
        &self,
        _account_id: &str,
        query: SearchQuery,
    ) -> AppResult<Vec<MessageSummary>> {
        let criteria = format!("TEXT \"{}\"", escape_imap_quoted(&query.query)?);
        let timeout = self.socket_timeout();
        with_session!(self, session => summaries(timeout, session, INBOX, &criteria, query.max_results))
    }

    async fn get_message(
        &self,
        _account_id: &str,
        message_id: &str,
        body_max_chars: usize,
    ) -> AppResult<MessageDetail> {
        let msg_id = MessageId::parse(message_id)?;
        validate_mailbox(&msg_id.mailbox)?;
        let timeout = self.socket_timeout();
        let (raw, flags) = with_session!(self, session => async {
            ensure_uidvalidity_matches(timeout, session, &msg_id, false).await?;
            let fetch = fetch_one(timeout, session, msg_id.uid, "(UID FLAGS BODY.PEEK[])").await?;
            let raw = fetch
                .body()
                .ok_or_else(|| AppError::Provider("message has no body".to_owned()))?
                .to_vec();
            Ok::<_, AppError>((raw, flags_to_strings(&fetch)))
        })?;

        let parsed = mime::parse_message(&raw, body_max_chars)?;
        Ok(MessageDetail {
            message_id: msg_id.encode(),
            date: parsed.date,
            from: parsed.from,
            to: parsed.to,
            cc: parsed.cc,
            subject: parsed.subject,
            labels: flags,
            body_text: parsed.body_text,
            attachments: parsed.attachments,
        })
    }

    async fn send_message(
        &self,
        account_id: &str,
        message: OutgoingMessage,
    ) -> AppResult<SendReceipt> {
        let settings = self.account.smtp.as_ref().ok_or_else(|| {
            AppError::invalid(format!(
                "account '{account_id}' has no SMTP server configured; set MAIL_IMAP_<ACCOUNT>_SMTP_HOST"
            ))
        })?;
        let recipients = message.to.len() + message.cc.len() + message.bcc.len();
        let composed = smtp::compose(smtp::sender(&self.account.user, None)?, &message, false)?;
        smtp::send(
            settings,
            &self.account.user,
            &self.password,
            composed,
            self.socket_timeout(),
        )
        .await?;

        Ok(SendReceipt {
            message_id: None,
            recipients,
        })
    }

    async fn archive_message(&self, _account_id: &str, message_id: &str) -> AppResult<()> {
        let msg_id = MessageId::parse(message_id)?;
        validate_mailbox(&msg_id.mailbox)?;
        let destination = self.account.archive_mailbox.as_str();
        let timeout = self.socket_timeout();
        with_session!(self, session => async {
            ensure_uidvalidity_matches(timeout, session, &msg_id, true).await?;
            let caps = capabilities(timeout, session).await?;
            if caps.has_str("MOVE") {
                uid_move(timeout, session, msg_id.uid, destination).await
            } else {
                uid_copy(timeout, session, msg_id.uid, destination).await?;
                uid_store(timeout, session, msg_id.uid, "+FLAGS.SILENT (\\Deleted)").await?;
                uid_expunge(timeout, session, msg_id.uid).await
            }
        })
    }

    async fn unread_count(&self, _account_id: &str) -> AppResult<u64> {
        let timeout = self.socket_timeout();
        with_session!(self, session => async {
            select_mailbox(timeout, session, INBOX, false).await?;
            let unseen = uid_search(timeout, session, "UNSEEN").await?;
            Ok::<_, AppError>(unseen.len() as u64)
        })
    }

    async fn shutdown(&self, account_id: &str) -> AppResult<()> {
        let Some(mut session) = self.session.lock().await.take() else {
            return Ok(());
        };
        timeout(self.socket_timeout(), session.logout())
            .await
            .map_err(|_| AppError::Timeout("LOGOUT timed out".to_owned()))
            .and_then(|r| r.map_err(|e| AppError::Provider(format!("LOGOUT failed: {e}"))))?;
        tracing::info!(account = %account_id, "imap session closed");
        Ok(())
    }
}

/// Connect to IMAP server and authenticate
///
/// Performs full connection sequence with timeouts:
/// 1. TCP connect
/// 2. TLS handshake with bundled root certificates
/// 3. Read IMAP greeting
/// 4. LOGIN authentication
///
/// # Errors
///
/// - `InvalidInput` if `secure` is false or hostname is invalid for TLS SNI
/// - `Timeout` if any connection phase times out
/// - `AuthFailed` if authentication fails
/// - `Provider` for TCP, TLS, or greeting failures
pub async fn connect_authenticated(
    timeouts: &Timeouts,
    account: &ImapAccount,
    password: &SecretString,
) -> AppResult<ImapSession> {
    if !account.secure {
        return Err(AppError::InvalidInput(
            "insecure IMAP is not supported; set MAIL_IMAP_<ACCOUNT>_SECURE=true".to_owned(),
        ));
    }

    let connect_duration = Duration::from_millis(timeouts.connect_ms);
    let greeting_duration = Duration::from_millis(timeouts.greeting_ms);

    let tcp = timeout(
        connect_duration,
        TcpStream::connect((account.host.as_str(), account.port)),
    )
    .await
    .map_err(|_| AppError::Timeout("tcp connect timeout".to_owned()))
    .and_then(|r| r.map_err(|e| AppError::Provider(format!("tcp connect failed: {e}"))))?;

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));

    let server_name = ServerName::try_from(account.host.clone())
        .map_err(|_| AppError::InvalidInput("invalid IMAP host for TLS SNI".to_owned()))?;
    let tls_stream = timeout(greeting_duration, connector.connect(server_name, tcp))
        .await
        .map_err(|_| AppError::Timeout("TLS handshake timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Provider(format!("TLS handshake failed: {e}"))))?;

    let mut client = Client::new(tls_stream);
    let greeting = timeout(greeting_duration, client.read_response())
        .await
        .map_err(|_| AppError::Timeout("IMAP greeting timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Provider(format!("IMAP greeting failed: {e}"))))?;

    if greeting.is_none() {
        return Err(AppError::Provider(
            "IMAP server closed connection before greeting".to_owned(),
        ));
    }

    timeout(
        greeting_duration,
        client.login(account.user.as_str(), password.expose_secret()),
    )
    .await
    .map_err(|_| AppError::Timeout("IMAP login timeout".to_owned()))
    .and_then(|r| {
        r.map_err(|(e, _)| {
            let msg = e.to_string();
            if msg.to_ascii_lowercase().contains("auth") || msg.contains("LOGIN") {
                AppError::AuthFailed(msg)
            } else {
                AppError::Provider(msg)
            }
        })
    })
}

/// Send NOOP to test connection liveness
async fn noop(dur: Duration, session: &mut ImapSession) -> AppResult<()> {
    timeout(dur, session.noop())
        .await
        .map_err(|_| AppError::Timeout("NOOP timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Provider(format!("NOOP failed: {e}"))))
}

/// Query server capabilities, used to detect `MOVE` support
async fn capabilities(
    dur: Duration,
    session: &mut ImapSession,
) -> AppResult<async_imap::types::Capabilities> {
    timeout(dur, session.capabilities())
        .await
        .map_err(|_| AppError::Timeout("CAPABILITY timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Provider(format!("CAPABILITY failed: {e}"))))
}

/// Select a mailbox and return its UIDVALIDITY
///
/// Read-only access uses `EXAMINE` so messages are not marked as read.
async fn select_mailbox(
    dur: Duration,
    session: &mut ImapSession,
    mailbox: &str,
    writable: bool,
) -> AppResult<u32> {
    let (command, selected) = if writable {
        ("SELECT", timeout(dur, session.select(mailbox)).await)
    } else {
        ("EXAMINE", timeout(dur, session.examine(mailbox)).await)
    };
    let selected = selected
        .map_err(|_| AppError::Timeout(format!("{command} timed out for mailbox '{mailbox}'")))
        .and_then(|r| {
            r.map_err(|e| AppError::invalid(format!("cannot open mailbox '{mailbox}': {e}")))
        })?;
    selected
        .uid_validity
        .ok_or_else(|| AppError::Provider("mailbox missing UIDVALIDITY".to_owned()))
}

/// Select the message's mailbox and ensure UIDVALIDITY still matches
async fn ensure_uidvalidity_matches(
    dur: Duration,
    session: &mut ImapSession,
    msg_id: &MessageId,
    writable: bool,
) -> AppResult<()> {
    let current = select_mailbox(dur, session, &msg_id.mailbox, writable).await?;
    if current != msg_id.uidvalidity {
        return Err(AppError::invalid(
            "message uidvalidity no longer matches mailbox; list messages again",
        ));
    }
    Ok(())
}

/// Fetch a single message with custom query
///
/// # Errors
///
/// - `InvalidInput` if UID does not exist in mailbox
/// - `Timeout` or `Provider` for network/protocol errors
async fn fetch_one(dur: Duration, session: &mut ImapSession, uid: u32, query: &str) -> AppResult<Fetch> {
    let stream = timeout(dur, session.uid_fetch(uid.to_string(), query))
        .await
        .map_err(|_| AppError::Timeout("UID FETCH timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Provider(format!("uid fetch failed: {e}"))))?;
    let fetches: Vec<Fetch> = timeout(dur, stream.try_collect())
        .await
        .map_err(|_| AppError::Timeout("UID FETCH stream timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Provider(format!("uid fetch stream failed: {e}"))))?;

    fetches
        .into_iter()
        .next()
        .ok_or_else(|| AppError::invalid(format!("message uid {uid} not found")))
}

/// Select `mailbox`, search it, and build summaries for the newest matches
async fn summaries(
    dur: Duration,
    session: &mut ImapSession,
    mailbox: &str,
    criteria: &str,
    max_results: usize,
) -> AppResult<Vec<MessageSummary>> {
    let uidvalidity = select_mailbox(dur, session, mailbox, false).await?;
    let uids = uid_search(dur, session, criteria).await?;

    let mut messages = Vec::with_capacity(max_results.min(uids.len()));
    for uid in uids.into_iter().take(max_results) {
        let fetch = fetch_one(
            dur,
            session,
            uid,
            "(UID FLAGS BODY.PEEK[HEADER.FIELDS (DATE FROM SUBJECT)])",
        )
        .await?;
        let header_bytes = fetch
            .header()
            .or_else(|| fetch.body())
            .ok_or_else(|| AppError::Provider("message headers not available".to_owned()))?;
        let headers = mime::parse_header_bytes(header_bytes)?;
        let flags = flags_to_strings(&fetch);

        messages.push(MessageSummary {
            message_id: MessageId {
                mailbox: mailbox.to_owned(),
                uidvalidity,
                uid,
            }
            .encode(),
            date: mime::header_value(&headers, "date"),
            from: mime::header_value(&headers, "from"),
            subject: mime::header_value(&headers, "subject"),
            snippet: None,
            unread: !flags.iter().any(|f| f == "\\Seen"),
        });
    }
    Ok(messages)
}

/// Render fetch flags in IMAP syntax (`\Seen`, `$Label`, ...)
fn flags_to_strings(fetch: &Fetch) -> Vec<String> {
    fetch
        .flags()
        .map(|flag| match flag {
            Flag::Seen => "\\Seen".to_owned(),
            Flag::Answered => "\\Answered".to_owned(),
            Flag::Flagged => "\\Flagged".to_owned(),
            Flag::Deleted => "\\Deleted".to_owned(),
            Flag::Draft => "\\Draft".to_owned(),
            Flag::Recent => "\\Recent".to_owned(),
            Flag::MayCreate => "\\*".to_owned(),
            Flag::Custom(name) => name.to_string(),
        })
        .collect()
}

/// Run `UID SEARCH` and return UIDs newest first
async fn uid_search(dur: Duration, session: &mut ImapSession, query: &str) -> AppResult<Vec<u32>> {
    let set = timeout(dur, session.uid_search(query))
        .await
        .map_err(|_| AppError::Timeout("UID SEARCH timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Provider(format!("uid search failed: {e}"))))?;
    let mut uids: Vec<u32> = set.into_iter().collect();
    uids.sort_unstable_by(|a, b| b.cmp(a));
    Ok(uids)
}

async fn uid_store(dur: Duration, session: &mut ImapSession, uid: u32, query: &str) -> AppResult<()> {
    let stream = timeout(dur, session.uid_store(uid.to_string(), query))
        .await
        .map_err(|_| AppError::Timeout("UID STORE timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Provider(format!("uid store failed: {e}"))))?;
    let _: Vec<Fetch> = timeout(dur, stream.try_collect())
        .await
        .map_err(|_| AppError::Timeout("UID STORE stream timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Provider(format!("uid store stream failed: {e}"))))?;
    Ok(())
}

async fn uid_copy(dur: Duration, session: &mut ImapSession, uid: u32, mailbox: &str) -> AppResult<()> {
    timeout(dur, session.uid_copy(uid.to_string(), mailbox))
        .await
        .map_err(|_| AppError::Timeout("UID COPY timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Provider(format!("UID COPY failed: {e}"))))
}

/// Move a message with `UID MOVE` (RFC 6851)
async fn uid_move(dur: Duration, session: &mut ImapSession, uid: u32, mailbox: &str) -> AppResult<()> {
    timeout(dur, session.uid_mv(uid.to_string(), mailbox))
        .await
        .map_err(|_| AppError::Timeout("UID MOVE timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Provider(format!("UID MOVE failed: {e}"))))
}

async fn uid_expunge(dur: Duration, session: &mut ImapSession, uid: u32) -> AppResult<()> {
    let stream = timeout(dur, session.uid_expunge(uid.to_string()))
        .await
        .map_err(|_| AppError::Timeout("UID EXPUNGE timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Provider(format!("UID EXPUNGE failed: {e}"))))?;
    let _: Vec<u32> = timeout(dur, stream.try_collect())
        .await
        .map_err(|_| AppError::Timeout("UID EXPUNGE stream timed out".to_owned()))
        .and_then(|r| {
            r.map_err(|e| AppError::Provider(format!("UID EXPUNGE stream failed: {e}")))
        })?;
    Ok(())
}

/// Validate mailbox name format
fn validate_mailbox(mailbox: &str) -> AppResult<()> {
    if mailbox.is_empty() || mailbox.len() > 256 {
        return Err(AppError::invalid("mailbox must be 1..256 characters"));
    }
    validate_no_controls(mailbox, "mailbox")
}

/// Reject IMAP control characters in user-provided values
fn validate_no_controls(value: &str, field: &str) -> AppResult<()> {
    if value.chars().any(|ch| ch.is_ascii_control()) {
        return Err(AppError::InvalidInput(format!(
            "{field} must not contain control characters"
        )));
    }
    Ok(())
}

/// Escape backslashes and quotes for IMAP quoted strings
fn escape_imap_quoted(input: &str) -> AppResult<String> {
    if input.is_empty() || input.len() > 256 {
        return Err(AppError::invalid("search text must be 1..256 chars"));
    }
    validate_no_controls(input, "search text")?;
    Ok(input.replace('\\', "\\\\").replace('"', "\\\""))
}

#[cfg(test)]
mod tests {
    use secrecy::{ExposeSecret, SecretString};

    use super::{escape_imap_quoted, resolve_password, validate_mailbox};
    use crate::accounts::StoredSecret;
    use crate::crypto::SecretCipher;
    use crate::errors::AppError;

    #[test]
    fn rejects_control_chars_in_mailbox() {
        let err = validate_mailbox("INBOX\r").expect_err("must fail");
        assert!(err.to_string().contains("control characters"));
    }

    #[test]
    fn escape_quotes_and_rejects_linebreaks() {
        assert_eq!(
            escape_imap_quoted(r#"say "hi" \o/"#).expect("escape"),
            r#"say \"hi\" \\o/"#
        );
        let err = escape_imap_quoted("a\nb").expect_err("must fail");
        assert!(err.to_string().contains("control characters"));
    }

    #[test]
    fn plain_password_does_not_need_a_cipher() {
        let stored = StoredSecret::Plain(SecretString::new("pw".into()));
        let resolved = resolve_password(&stored, || {
            Err(AppError::Configuration("no key".to_owned()))
        })
        .expect("plain password resolves");
        assert_eq!(resolved.expose_secret(), "pw");
    }

    #[test]
    fn encrypted_password_is_decrypted() {
        let cipher = SecretCipher::new("master-key").expect("cipher");
        let stored = StoredSecret::Encrypted(cipher.encrypt("imap-pass").expect("encrypt"));
        let resolved = resolve_password(&stored, || Ok(cipher.clone())).expect("decrypts");
        assert_eq!(resolved.expose_secret(), "imap-pass");
    }

    #[test]
    fn encrypted_password_without_key_is_a_configuration_error() {
        let stored = StoredSecret::Encrypted("00:00".to_owned());
        let err = resolve_password(&stored, || {
            Err(AppError::Configuration("no key".to_owned()))
        })
        .expect_err("must fail");
        assert!(matches!(err, AppError::Configuration(_)));
    }
}
