//! Test helpers
//!
//! Mock handler/factory implementations and account fixtures. Nothing here
//! touches the network.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::accounts::{
    AccountDescriptor, AccountFamily, GmailAccount, ImapAccount, SmtpSettings, StoredSecret,
};
use crate::errors::{AppError, AppResult};
use crate::handler::{HandlerFactory, MailHandler, SharedHandler};
use crate::models::{
    ListQuery, MessageDetail, MessageSummary, OutgoingMessage, SearchQuery, SendReceipt,
};

// ===== Fixtures =====

pub fn gmail_descriptor() -> AccountDescriptor {
    AccountDescriptor::Gmail(GmailAccount {
        client_id: "client-123.apps.example".to_owned(),
        client_secret: SecretString::new("cs-value-123".into()),
        refresh_token: SecretString::new("rt-value-456".into()),
        email: "me@gmail.example".to_owned(),
        display_name: Some("Me".to_owned()),
    })
}

pub fn imap_descriptor() -> AccountDescriptor {
    AccountDescriptor::Imap(ImapAccount {
        host: "imap.example.com".to_owned(),
        port: 993,
        secure: true,
        user: "user@example.com".to_owned(),
        pass: StoredSecret::Plain(SecretString::new("pw".into())),
        smtp: Some(SmtpSettings {
            host: "smtp.example.com".to_owned(),
            port: 465,
        }),
        archive_mailbox: "Archive".to_owned(),
    })
}

// ===== MockHandler =====

pub struct MockHandler {
    family: AccountFamily,
    fail_probe: bool,
    fail_shutdown: bool,
    shutdowns: Arc<AtomicUsize>,
}

#[async_trait]
impl MailHandler for MockHandler {
    async fn probe(&self, account_id: &str) -> AppResult<()> {
        if self.fail_probe {
            return Err(AppError::Provider(format!("{account_id} unreachable")));
        }
        Ok(())
    }

    async fn list_messages(
        &self,
        account_id: &str,
        query: ListQuery,
    ) -> AppResult<Vec<MessageSummary>> {
        Ok((1..=query.max_results.min(3))
            .map(|n| MessageSummary {
                message_id: format!("{account_id}-{n}"),
                date: None,
                from: Some("sender@example.com".to_owned()),
                subject: Some(format!("{} message {n}", self.family)),
                snippet: None,
                unread: query.unread_only,
            })
            .collect())
    }

    async fn search_messages(
        &self,
        account_id: &str,
        query: SearchQuery,
    ) -> AppResult<Vec<MessageSummary>> {
        Ok(vec![MessageSummary {
            message_id: format!("{account_id}-match"),
            date: None,
            from: None,
            subject: Some(query.query),
            snippet: None,
            unread: false,
        }])
    }

    async fn get_message(
        &self,
        _account_id: &str,
        message_id: &str,
        _body_max_chars: usize,
    ) -> AppResult<MessageDetail> {
        if message_id == "missing" {
            return Err(AppError::invalid("message not found"));
        }
        Ok(MessageDetail {
            message_id: message_id.to_owned(),
            date: None,
            from: Some("sender@example.com".to_owned()),
            to: Some("me@example.com".to_owned()),
            cc: None,
            subject: Some("Hello".to_owned()),
            labels: vec!["INBOX".to_owned()],
            body_text: Some("Hi there".to_owned()),
            attachments: Vec::new(),
        })
    }

    async fn send_message(
        &self,
        _account_id: &str,
        message: OutgoingMessage,
    ) -> AppResult<SendReceipt> {
        Ok(SendReceipt {
            message_id: Some("sent-1".to_owned()),
            recipients: message.to.len() + message.cc.len() + message.bcc.len(),
        })
    }

    async fn archive_message(&self, _account_id: &str, message_id: &str) -> AppResult<()> {
        assert_ne!(message_id, "panic", "mock handler asked to panic");
        Ok(())
    }

    async fn unread_count(&self, _account_id: &str) -> AppResult<u64> {
        Ok(7)
    }

    async fn shutdown(&self, account_id: &str) -> AppResult<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        if self.fail_shutdown {
            return Err(AppError::Provider(format!("{account_id} logout failed")));
        }
        Ok(())
    }
}

// ===== MockFactory =====

/// Factory that counts constructions and can inject failures
#[derive(Default)]
pub struct MockFactory {
    gmail_constructions: AtomicUsize,
    imap_constructions: AtomicUsize,
    shutdowns: Arc<AtomicUsize>,
    /// Sleep inside construction so concurrent callers overlap
    delay: Option<Duration>,
    fail_construction: AtomicBool,
    fail_probe: AtomicBool,
    fail_shutdown: AtomicBool,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn set_fail_construction(&self, fail: bool) {
        self.fail_construction.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_probe(&self, fail: bool) {
        self.fail_probe.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_shutdown(&self, fail: bool) {
        self.fail_shutdown.store(fail, Ordering::SeqCst);
    }

    pub fn gmail_constructions(&self) -> usize {
        self.gmail_constructions.load(Ordering::SeqCst)
    }

    pub fn imap_constructions(&self) -> usize {
        self.imap_constructions.load(Ordering::SeqCst)
    }

    pub fn constructions(&self) -> usize {
        self.gmail_constructions() + self.imap_constructions()
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    async fn build(&self, family: AccountFamily, counter: &AtomicUsize) -> AppResult<SharedHandler> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_construction.load(Ordering::SeqCst) {
            return Err(AppError::Configuration("MAIL_MCP_SECRET_KEY is required".to_owned()));
        }
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockHandler {
            family,
            fail_probe: self.fail_probe.load(Ordering::SeqCst),
            fail_shutdown: self.fail_shutdown.load(Ordering::SeqCst),
            shutdowns: Arc::clone(&self.shutdowns),
        }))
    }
}

#[async_trait]
impl HandlerFactory for MockFactory {
    async fn create_gmail(
        &self,
        _account_id: &str,
        _account: &GmailAccount,
    ) -> AppResult<SharedHandler> {
        self.build(AccountFamily::Gmail, &self.gmail_constructions).await
    }

    async fn create_imap(
        &self,
        _account_id: &str,
        _account: &ImapAccount,
    ) -> AppResult<SharedHandler> {
        self.build(AccountFamily::Imap, &self.imap_constructions).await
    }
}
