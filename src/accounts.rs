//! Account descriptors and the in-memory account directory
//!
//! An account is registered under a unique identity and belongs to exactly
//! one backend family. The directory is filled once from configuration and
//! may be extended at runtime with [`AccountDirectory::add_account`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};

use schemars::JsonSchema;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::models::AccountInfo;

/// Backend family of an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum AccountFamily {
    /// Gmail REST API (stateless HTTP)
    Gmail,
    /// IMAP session with optional SMTP submission (stateful)
    Imap,
}

impl AccountFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gmail => "gmail",
            Self::Imap => "imap",
        }
    }
}

impl fmt::Display for AccountFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A secret that is either held in memory as-is or still encrypted
#[derive(Debug, Clone)]
pub enum StoredSecret {
    /// Plaintext secret loaded from configuration
    Plain(SecretString),
    /// `hex(iv):hex(ciphertext)` payload; decrypted when a handler is built
    Encrypted(String),
}

/// Gmail API account parameters
#[derive(Debug, Clone)]
pub struct GmailAccount {
    /// OAuth2 client id
    pub client_id: String,
    /// OAuth2 client secret
    pub client_secret: SecretString,
    /// Long-lived OAuth2 refresh token
    pub refresh_token: SecretString,
    /// Mailbox address, used as the sender for outgoing mail
    pub email: String,
    /// Optional display name for the sender
    pub display_name: Option<String>,
}

/// SMTP submission settings for an IMAP account
#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
}

/// IMAP account parameters
#[derive(Debug, Clone)]
pub struct ImapAccount {
    /// IMAP server hostname
    pub host: String,
    /// IMAP server port (typically 993 for TLS)
    pub port: u16,
    /// Whether to use TLS (plaintext IMAP is rejected at connect time)
    pub secure: bool,
    /// Username for authentication
    pub user: String,
    /// Password, possibly encrypted at rest
    pub pass: StoredSecret,
    /// SMTP server used to send mail as this account
    pub smtp: Option<SmtpSettings>,
    /// Mailbox that archived messages are moved to
    pub archive_mailbox: String,
}

/// Account descriptor: one variant per backend family
#[derive(Debug, Clone)]
pub enum AccountDescriptor {
    Gmail(GmailAccount),
    Imap(ImapAccount),
}

impl AccountDescriptor {
    pub fn family(&self) -> AccountFamily {
        match self {
            Self::Gmail(_) => AccountFamily::Gmail,
            Self::Imap(_) => AccountFamily::Imap,
        }
    }

    /// Credential-free summary for listing
    pub fn info(&self, account_id: &str) -> AccountInfo {
        match self {
            Self::Gmail(gmail) => AccountInfo {
                account_id: account_id.to_owned(),
                family: AccountFamily::Gmail,
                address: gmail.email.clone(),
                display_name: gmail.display_name.clone(),
                host: None,
                port: None,
            },
            Self::Imap(imap) => AccountInfo {
                account_id: account_id.to_owned(),
                family: AccountFamily::Imap,
                address: imap.user.clone(),
                display_name: None,
                host: Some(imap.host.clone()),
                port: Some(imap.port),
            },
        }
    }
}

/// In-memory registry of identity → account descriptor
#[derive(Debug, Default)]
pub struct AccountDirectory {
    accounts: RwLock<BTreeMap<String, AccountDescriptor>>,
}

impl AccountDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an account; `None` means the identity is not configured
    pub fn get_account(&self, account_id: &str) -> Option<AccountDescriptor> {
        self.accounts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(account_id)
            .cloned()
    }

    /// Register or replace an account (last write wins)
    pub fn add_account(&self, account_id: impl Into<String>, descriptor: AccountDescriptor) {
        let account_id = account_id.into();
        let family = descriptor.family();
        let replaced = self
            .accounts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(account_id.clone(), descriptor);
        tracing::info!(
            account = %account_id,
            %family,
            replaced = replaced.is_some(),
            "account registered"
        );
    }

    /// All registered identities in ascending order
    pub fn list_accounts(&self) -> Vec<String> {
        self.accounts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Credential-free summaries of every account
    pub fn summaries(&self) -> Vec<AccountInfo> {
        self.accounts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, descriptor)| descriptor.info(id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{AccountDirectory, AccountFamily};
    use crate::test_support::{gmail_descriptor, imap_descriptor};

    #[test]
    fn unknown_account_is_none() {
        let directory = AccountDirectory::new();
        assert!(directory.get_account("missing").is_none());
    }

    #[test]
    fn add_account_overwrites_previous_descriptor() {
        let directory = AccountDirectory::new();
        directory.add_account("work", gmail_descriptor());
        directory.add_account("work", imap_descriptor());

        let account = directory.get_account("work").expect("account exists");
        assert_eq!(account.family(), AccountFamily::Imap);
        assert_eq!(directory.list_accounts(), vec!["work".to_owned()]);
    }

    #[test]
    fn list_accounts_is_sorted() {
        let directory = AccountDirectory::new();
        directory.add_account("zeta", imap_descriptor());
        directory.add_account("alpha", gmail_descriptor());
        assert_eq!(directory.list_accounts(), vec!["alpha", "zeta"]);
    }

    #[test]
    fn summaries_exclude_credentials() {
        let directory = AccountDirectory::new();
        directory.add_account("personal", gmail_descriptor());
        directory.add_account("work", imap_descriptor());

        let summaries = directory.summaries();
        let json = serde_json::to_string(&summaries).expect("serialize");
        assert!(json.contains("\"family\":\"gmail\""));
        assert!(json.contains("\"family\":\"imap\""));
        assert!(!json.contains("secret"));
        assert!(!json.contains("refresh"));
    }
}
