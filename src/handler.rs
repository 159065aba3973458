//! Provider handler contract
//!
//! Each backend family implements [`MailHandler`]. Handlers are built by a
//! [`HandlerFactory`] from an account descriptor and then pooled, one per
//! account, by the connection manager.

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::accounts::{GmailAccount, ImapAccount};
use crate::config::Timeouts;
use crate::crypto::SecretCipher;
use crate::errors::{AppError, AppResult};
use crate::gmail::GmailHandler;
use crate::imap::ImapHandler;
use crate::models::{
    ListQuery, MessageDetail, MessageSummary, OutgoingMessage, SearchQuery, SendReceipt,
};

/// Shared, pooled handler instance
pub type SharedHandler = Arc<dyn MailHandler>;

/// Operations one account's backend supports
///
/// Every operation receives the account identity for logging and for
/// provider-specific identifiers.
#[async_trait]
pub trait MailHandler: Send + Sync {
    /// Verify connectivity and credentials without touching mail
    async fn probe(&self, account_id: &str) -> AppResult<()>;

    async fn list_messages(
        &self,
        account_id: &str,
        query: ListQuery,
    ) -> AppResult<Vec<MessageSummary>>;

    async fn search_messages(
        &self,
        account_id: &str,
        query: SearchQuery,
    ) -> AppResult<Vec<MessageSummary>>;

    async fn get_message(
        &self,
        account_id: &str,
        message_id: &str,
        body_max_chars: usize,
    ) -> AppResult<MessageDetail>;

    async fn send_message(
        &self,
        account_id: &str,
        message: OutgoingMessage,
    ) -> AppResult<SendReceipt>;

    async fn archive_message(&self, account_id: &str, message_id: &str) -> AppResult<()>;

    async fn unread_count(&self, account_id: &str) -> AppResult<u64>;

    /// Release protocol-level resources; stateless handlers need nothing
    async fn shutdown(&self, _account_id: &str) -> AppResult<()> {
        Ok(())
    }
}

/// Builds handlers from account descriptors
#[async_trait]
pub trait HandlerFactory: Send + Sync {
    async fn create_gmail(&self, account_id: &str, account: &GmailAccount)
    -> AppResult<SharedHandler>;

    async fn create_imap(&self, account_id: &str, account: &ImapAccount)
    -> AppResult<SharedHandler>;
}

/// Factory producing the real Gmail API and IMAP handlers
#[derive(Debug)]
pub struct ProviderFactory {
    timeouts: Timeouts,
    secret_key: Option<SecretString>,
}

impl ProviderFactory {
    pub fn new(timeouts: Timeouts, secret_key: Option<SecretString>) -> Self {
        Self {
            timeouts,
            secret_key,
        }
    }

    fn cipher(&self) -> AppResult<SecretCipher> {
        let key = self.secret_key.as_ref().ok_or_else(|| {
            AppError::Configuration(
                "MAIL_MCP_SECRET_KEY is required for encrypted passwords".to_owned(),
            )
        })?;
        SecretCipher::new(key.expose_secret())
    }
}

#[async_trait]
impl HandlerFactory for ProviderFactory {
    async fn create_gmail(
        &self,
        account_id: &str,
        account: &GmailAccount,
    ) -> AppResult<SharedHandler> {
        let handler = GmailHandler::new(account.clone(), &self.timeouts)?;
        tracing::debug!(account = %account_id, "gmail handler constructed");
        Ok(Arc::new(handler))
    }

    async fn create_imap(
        &self,
        account_id: &str,
        account: &ImapAccount,
    ) -> AppResult<SharedHandler> {
        let password = crate::imap::resolve_password(&account.pass, || self.cipher())?;
        let handler = ImapHandler::new(account.clone(), password, self.timeouts.clone());
        tracing::debug!(account = %account_id, "imap handler constructed");
        Ok(Arc::new(handler))
    }
}
