//! Configuration module for accounts and server settings
//!
//! All configuration is loaded from environment variables. IMAP accounts are
//! discovered by scanning for `MAIL_IMAP_<SEGMENT>_HOST`, Gmail accounts by
//! scanning for `MAIL_GMAIL_<SEGMENT>_CLIENT_ID`. The segment, lowercased,
//! becomes the account identity.

use std::collections::BTreeMap;
use std::env;

use regex::Regex;
use secrecy::SecretString;

use crate::accounts::{AccountDescriptor, GmailAccount, ImapAccount, SmtpSettings, StoredSecret};
use crate::errors::{AppError, AppResult};

/// Variable holding the key for encrypted passwords
pub const SECRET_KEY_VAR: &str = "MAIL_MCP_SECRET_KEY";

/// Network timeouts handed to provider handlers
#[derive(Debug, Clone)]
pub struct Timeouts {
    /// TCP connection timeout in milliseconds
    pub connect_ms: u64,
    /// IMAP greeting/TLS handshake/login timeout in milliseconds
    pub greeting_ms: u64,
    /// IMAP socket I/O timeout in milliseconds
    pub socket_ms: u64,
    /// Gmail HTTP request timeout in milliseconds
    pub http_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect_ms: 30_000,
            greeting_ms: 15_000,
            socket_ms: 300_000,
            http_ms: 30_000,
        }
    }
}

/// Server-wide configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// All configured accounts, keyed by identity
    pub accounts: BTreeMap<String, AccountDescriptor>,
    /// Key used to decrypt encrypted passwords
    pub secret_key: Option<SecretString>,
    pub timeouts: Timeouts,
}

/// Snapshot of the variables configuration is read from
struct Vars(BTreeMap<String, String>);

impl Vars {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

impl ServerConfig {
    /// Load all configuration from the process environment
    ///
    /// # Example Environment
    ///
    /// ```text
    /// MAIL_IMAP_WORK_HOST=outlook.office365.com
    /// MAIL_IMAP_WORK_USER=user@company.com
    /// MAIL_IMAP_WORK_PASS=9f1c...:4be2...
    /// MAIL_IMAP_WORK_PASS_ENCRYPTED=true
    /// MAIL_IMAP_WORK_SMTP_HOST=smtp.office365.com
    /// MAIL_GMAIL_PERSONAL_CLIENT_ID=1234.apps.googleusercontent.com
    /// MAIL_GMAIL_PERSONAL_CLIENT_SECRET=...
    /// MAIL_GMAIL_PERSONAL_REFRESH_TOKEN=...
    /// MAIL_GMAIL_PERSONAL_EMAIL=me@gmail.com
    /// MAIL_MCP_SECRET_KEY=...
    /// ```
    pub fn load_from_env() -> AppResult<Self> {
        Self::from_vars(
            env::vars_os()
                .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?))),
        )
    }

    /// Load configuration from an explicit set of variables
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for missing or malformed account variables and
    /// `Configuration` if one identity is configured under both families.
    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> AppResult<Self> {
        let vars = Vars(vars.into_iter().collect());

        let mut accounts = BTreeMap::new();
        for segment in discover_segments(&vars, r"^MAIL_IMAP_([A-Z0-9_]+)_HOST$")? {
            // MAIL_IMAP_<SEG>_SMTP_HOST also matches the host pattern
            if segment.ends_with("_SMTP") {
                continue;
            }
            let descriptor = AccountDescriptor::Imap(load_imap_account(&vars, &segment)?);
            accounts.insert(account_id_for(&segment), descriptor);
        }

        for segment in discover_segments(&vars, r"^MAIL_GMAIL_([A-Z0-9_]+)_CLIENT_ID$")? {
            let account_id = account_id_for(&segment);
            if accounts.contains_key(&account_id) {
                return Err(AppError::Configuration(format!(
                    "account '{account_id}' is configured as both IMAP and Gmail"
                )));
            }
            let descriptor = AccountDescriptor::Gmail(load_gmail_account(&vars, &segment)?);
            accounts.insert(account_id, descriptor);
        }

        let secret_key = vars.get(SECRET_KEY_VAR).and_then(secret_from);

        let defaults = Timeouts::default();
        Ok(Self {
            accounts,
            secret_key,
            timeouts: Timeouts {
                connect_ms: parse_u64(&vars, "MAIL_MCP_CONNECT_TIMEOUT_MS", defaults.connect_ms)?,
                greeting_ms: parse_u64(
                    &vars,
                    "MAIL_MCP_GREETING_TIMEOUT_MS",
                    defaults.greeting_ms,
                )?,
                socket_ms: parse_u64(&vars, "MAIL_MCP_SOCKET_TIMEOUT_MS", defaults.socket_ms)?,
                http_ms: parse_u64(&vars, "MAIL_MCP_HTTP_TIMEOUT_MS", defaults.http_ms)?,
            },
        })
    }
}

/// Read only the secret key, without loading any account
pub fn secret_key_from_env() -> Option<SecretString> {
    env::var(SECRET_KEY_VAR).ok().as_deref().and_then(secret_from)
}

fn secret_from(value: &str) -> Option<SecretString> {
    (!value.is_empty()).then(|| SecretString::new(value.into()))
}

/// Find account segments whose marker variable matches `pattern`
fn discover_segments(vars: &Vars, pattern: &str) -> AppResult<Vec<String>> {
    let account_pattern =
        Regex::new(pattern).map_err(|e| AppError::Internal(format!("invalid account regex: {e}")))?;

    let mut segments: Vec<String> = vars
        .0
        .keys()
        .filter_map(|k| {
            account_pattern
                .captures(k)
                .and_then(|c| c.get(1).map(|m| m.as_str().to_owned()))
        })
        .collect();
    segments.sort();
    segments.dedup();
    Ok(segments)
}

fn account_id_for(segment: &str) -> String {
    segment.to_ascii_lowercase()
}

/// Load a single IMAP account
///
/// Reads `MAIL_IMAP_<SEGMENT>_HOST`, `_USER`, `_PASS`, `_PORT`, `_SECURE`,
/// `_PASS_ENCRYPTED`, `_SMTP_HOST`, `_SMTP_PORT`, and `_ARCHIVE_MAILBOX`.
fn load_imap_account(vars: &Vars, segment: &str) -> AppResult<ImapAccount> {
    let prefix = format!("MAIL_IMAP_{segment}_");
    let host = required(vars, &format!("{prefix}HOST"))?;
    let user = required(vars, &format!("{prefix}USER"))?;
    let pass = required(vars, &format!("{prefix}PASS"))?;
    let pass = if parse_bool(vars, &format!("{prefix}PASS_ENCRYPTED"), false)? {
        StoredSecret::Encrypted(pass)
    } else {
        StoredSecret::Plain(SecretString::new(pass.into()))
    };

    let smtp = match vars.get(&format!("{prefix}SMTP_HOST")) {
        Some(smtp_host) if !smtp_host.trim().is_empty() => Some(SmtpSettings {
            host: smtp_host.to_owned(),
            port: parse_u16(vars, &format!("{prefix}SMTP_PORT"), 465)?,
        }),
        _ => None,
    };

    Ok(ImapAccount {
        host,
        port: parse_u16(vars, &format!("{prefix}PORT"), 993)?,
        secure: parse_bool(vars, &format!("{prefix}SECURE"), true)?,
        user,
        pass,
        smtp,
        archive_mailbox: vars
            .get(&format!("{prefix}ARCHIVE_MAILBOX"))
            .filter(|v| !v.trim().is_empty())
            .unwrap_or("Archive")
            .to_owned(),
    })
}

/// Load a single Gmail account
///
/// Reads `MAIL_GMAIL_<SEGMENT>_CLIENT_ID`, `_CLIENT_SECRET`, `_REFRESH_TOKEN`,
/// `_EMAIL`, and the optional `_DISPLAY_NAME`.
fn load_gmail_account(vars: &Vars, segment: &str) -> AppResult<GmailAccount> {
    let prefix = format!("MAIL_GMAIL_{segment}_");
    Ok(GmailAccount {
        client_id: required(vars, &format!("{prefix}CLIENT_ID"))?,
        client_secret: SecretString::new(
            required(vars, &format!("{prefix}CLIENT_SECRET"))?.into(),
        ),
        refresh_token: SecretString::new(
            required(vars, &format!("{prefix}REFRESH_TOKEN"))?.into(),
        ),
        email: required(vars, &format!("{prefix}EMAIL"))?,
        display_name: vars
            .get(&format!("{prefix}DISPLAY_NAME"))
            .filter(|v| !v.trim().is_empty())
            .map(str::to_owned),
    })
}

/// Read a required variable, returning error if missing or empty
fn required(vars: &Vars, key: &str) -> AppResult<String> {
    match vars.get(key) {
        Some(v) if !v.trim().is_empty() => Ok(v.to_owned()),
        _ => Err(AppError::InvalidInput(format!(
            "missing required environment variable {key}"
        ))),
    }
}

/// Parse a boolean variable with flexible values
///
/// Accepts: `1`, `true`, `yes`, `y`, `on` (truthy) or `0`, `false`, `no`,
/// `n`, `off` (falsy). Case-insensitive. Returns `default` if unset.
fn parse_bool(vars: &Vars, key: &str, default: bool) -> AppResult<bool> {
    match vars.get(key) {
        Some(v) => parse_bool_value(v).ok_or_else(|| {
            AppError::InvalidInput(format!("invalid boolean environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}

fn parse_bool_value(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

fn parse_u16(vars: &Vars, key: &str, default: u16) -> AppResult<u16> {
    match vars.get(key) {
        Some(v) => v.trim().parse::<u16>().map_err(|_| {
            AppError::InvalidInput(format!("invalid u16 environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}

fn parse_u64(vars: &Vars, key: &str, default: u64) -> AppResult<u64> {
    match vars.get(key) {
        Some(v) => v.trim().parse::<u64>().map_err(|_| {
            AppError::InvalidInput(format!("invalid u64 environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}
