//! Connection pool manager
//!
//! Owns one [`KeyedPool`] per backend family and hands out the pooled
//! handler for an account, constructing it on first use. Every tool
//! operation and every connectivity probe goes through
//! [`ConnectionManager::get_handler_for`], so a successful probe is always
//! followed by operations on the same handler instance.

use std::sync::Arc;

use chrono::SecondsFormat;

use crate::accounts::{AccountDescriptor, AccountDirectory, AccountFamily};
use crate::errors::{AppError, AppResult};
use crate::handler::{HandlerFactory, SharedHandler};
use crate::models::{ConnectionResult, FamilyPoolStatus, PoolEntryInfo, PoolStatus};
use crate::pool::{KeyedPool, PoolEvent};

/// Family reported for identities that are not configured
const DEFAULT_FAMILY: AccountFamily = AccountFamily::Gmail;

pub struct ConnectionManager {
    directory: Arc<AccountDirectory>,
    factory: Arc<dyn HandlerFactory>,
    gmail: KeyedPool<SharedHandler>,
    imap: KeyedPool<SharedHandler>,
}

impl ConnectionManager {
    pub fn new(directory: Arc<AccountDirectory>, factory: Arc<dyn HandlerFactory>) -> Self {
        Self {
            directory,
            factory,
            gmail: KeyedPool::new(),
            imap: KeyedPool::new(),
        }
    }

    pub fn directory(&self) -> &AccountDirectory {
        &self.directory
    }

    /// Register or replace an account
    ///
    /// A handler already pooled for the identity is kept until cleanup.
    pub fn add_account(&self, account_id: impl Into<String>, descriptor: AccountDescriptor) {
        self.directory.add_account(account_id, descriptor);
    }

    fn pool(&self, family: AccountFamily) -> &KeyedPool<SharedHandler> {
        match family {
            AccountFamily::Gmail => &self.gmail,
            AccountFamily::Imap => &self.imap,
        }
    }

    /// Pooled handler for `account_id` in the `family` pool, created on demand
    ///
    /// # Errors
    ///
    /// - `AccountNotFound` if the identity is unknown or registered under the
    ///   other family
    /// - any error raised while constructing the handler
    pub async fn get_handler_for(
        &self,
        account_id: &str,
        family: AccountFamily,
    ) -> AppResult<SharedHandler> {
        let pool = self.pool(family);
        if let Some(handler) = pool.get(account_id) {
            tracing::debug!(event = "REUSE", account = %account_id, %family, "reusing pooled handler");
            return Ok(handler);
        }

        let descriptor = self.directory.get_account(account_id).ok_or_else(|| {
            AppError::AccountNotFound(format!("account '{account_id}' is not configured"))
        })?;
        if descriptor.family() != family {
            return Err(AppError::AccountNotFound(format!(
                "account '{account_id}' is not a {family} account"
            )));
        }

        let (handler, event) = pool
            .get_or_try_init(account_id, || self.construct(account_id, &descriptor))
            .await
            .inspect_err(|e| {
                tracing::error!(account = %account_id, %family, error = %e, "handler construction failed");
            })?;

        match event {
            PoolEvent::Created => tracing::info!(
                event = "CREATE",
                account = %account_id,
                %family,
                gmail_pool = self.gmail.len(),
                imap_pool = self.imap.len(),
                "handler created"
            ),
            PoolEvent::Reused => {
                tracing::debug!(event = "REUSE", account = %account_id, %family, "reusing pooled handler");
            }
        }
        Ok(handler)
    }

    /// Pooled handler for an account, using its registered family
    pub async fn handler_for_account(&self, account_id: &str) -> AppResult<SharedHandler> {
        let family = self
            .directory
            .get_account(account_id)
            .map(|descriptor| descriptor.family())
            .ok_or_else(|| {
                AppError::AccountNotFound(format!("account '{account_id}' is not configured"))
            })?;
        self.get_handler_for(account_id, family).await
    }

    async fn construct(
        &self,
        account_id: &str,
        descriptor: &AccountDescriptor,
    ) -> AppResult<SharedHandler> {
        match descriptor {
            AccountDescriptor::Gmail(account) => self.factory.create_gmail(account_id, account).await,
            AccountDescriptor::Imap(account) => self.factory.create_imap(account_id, account).await,
        }
    }

    /// Probe an account through its pooled handler; never fails
    pub async fn test_connection(&self, account_id: &str) -> ConnectionResult {
        let Some(descriptor) = self.directory.get_account(account_id) else {
            tracing::error!(account = %account_id, "connection test failed: account not configured");
            return ConnectionResult {
                success: false,
                account_name: account_id.to_owned(),
                account_type: DEFAULT_FAMILY,
                message: format!("Account '{account_id}' is not configured"),
            };
        };

        let family = descriptor.family();
        let outcome = match self.get_handler_for(account_id, family).await {
            Ok(handler) => handler.probe(account_id).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                tracing::info!(account = %account_id, %family, "connection test succeeded");
                ConnectionResult {
                    success: true,
                    account_name: account_id.to_owned(),
                    account_type: family,
                    message: "Connection successful".to_owned(),
                }
            }
            Err(e) => {
                tracing::error!(account = %account_id, %family, error = %e, "connection test failed");
                ConnectionResult {
                    success: false,
                    account_name: account_id.to_owned(),
                    account_type: family,
                    message: format!("Connection failed: {e}"),
                }
            }
        }
    }

    /// Empty both pools and shut every handler down
    ///
    /// Handlers still under construction are awaited and shut down as well.
    /// Shutdown errors are logged and do not stop the remaining handlers.
    /// Returns the number of handlers released; a second call returns 0.
    pub async fn cleanup(&self) -> usize {
        let mut released = 0;
        for family in [AccountFamily::Gmail, AccountFamily::Imap] {
            for (account_id, handler) in self.pool(family).drain().await {
                tracing::info!(event = "CLEANUP", account = %account_id, %family, "releasing handler");
                if let Err(e) = handler.shutdown(&account_id).await {
                    tracing::warn!(account = %account_id, %family, error = %e, "handler shutdown failed");
                }
                released += 1;
            }
        }
        released
    }

    pub fn pool_status(&self) -> PoolStatus {
        PoolStatus {
            gmail: family_status(&self.gmail),
            imap: family_status(&self.imap),
        }
    }
}

fn family_status(pool: &KeyedPool<SharedHandler>) -> FamilyPoolStatus {
    let entries: Vec<PoolEntryInfo> = pool
        .snapshot()
        .into_iter()
        .map(|(account_id, created_at)| PoolEntryInfo {
            account_id,
            created_at: created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        })
        .collect();
    FamilyPoolStatus {
        count: entries.len(),
        accounts: entries.iter().map(|e| e.account_id.clone()).collect(),
        entries,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use futures::future::join_all;

    use super::ConnectionManager;
    use crate::accounts::{AccountDirectory, AccountFamily};
    use crate::errors::AppError;
    use crate::handler::HandlerFactory;
    use crate::test_support::{MockFactory, gmail_descriptor, imap_descriptor};

    fn manager_with(factory: &Arc<MockFactory>) -> ConnectionManager {
        let directory = Arc::new(AccountDirectory::new());
        directory.add_account("personal", gmail_descriptor());
        directory.add_account("work", imap_descriptor());
        let factory: Arc<dyn HandlerFactory> = Arc::clone(factory) as Arc<dyn HandlerFactory>;
        ConnectionManager::new(directory, factory)
    }

    #[tokio::test]
    async fn second_lookup_reuses_the_pooled_handler() {
        let factory = Arc::new(MockFactory::new());
        let manager = manager_with(&factory);

        let first = manager.handler_for_account("work").await.expect("first");
        let second = manager.handler_for_account("work").await.expect("second");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(factory.imap_constructions(), 1);
        assert_eq!(factory.gmail_constructions(), 0);
    }

    #[tokio::test]
    async fn accounts_get_independent_handlers() {
        let factory = Arc::new(MockFactory::new());
        let manager = manager_with(&factory);
        manager.add_account("work2", imap_descriptor());

        let a = manager.handler_for_account("work").await.expect("work");
        let b = manager.handler_for_account("work2").await.expect("work2");

        assert!(!Arc::ptr_eq(&a, &b));
        let status = manager.pool_status();
        assert_eq!(status.imap.count, 2);
        assert_eq!(status.imap.accounts, vec!["work", "work2"]);
        assert_eq!(status.gmail.count, 0);
    }

    #[tokio::test]
    async fn concurrent_first_calls_construct_once() {
        let factory = Arc::new(MockFactory::with_delay(Duration::from_millis(20)));
        let manager = manager_with(&factory);

        let results = join_all((0..8).map(|_| manager.handler_for_account("personal"))).await;
        let handlers: Vec<_> = results
            .into_iter()
            .map(|r| r.expect("handler"))
            .collect();

        assert_eq!(factory.gmail_constructions(), 1);
        assert!(handlers.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[tokio::test]
    async fn probe_then_operation_reuses_handler() {
        let factory = Arc::new(MockFactory::new());
        let manager = manager_with(&factory);

        let result = manager.test_connection("personal").await;
        assert!(result.success, "{}", result.message);
        assert_eq!(result.account_type, AccountFamily::Gmail);

        manager.handler_for_account("personal").await.expect("handler");
        assert_eq!(factory.gmail_constructions(), 1);
    }

    #[tokio::test]
    async fn missing_account_reports_default_family() {
        let factory = Arc::new(MockFactory::new());
        let manager = manager_with(&factory);

        let result = manager.test_connection("ghost").await;
        assert!(!result.success);
        assert_eq!(result.account_name, "ghost");
        assert_eq!(result.account_type, AccountFamily::Gmail);
        assert!(result.message.contains("not configured"));
        assert_eq!(factory.constructions(), 0);
    }

    #[tokio::test]
    async fn failed_probe_keeps_true_family() {
        let factory = Arc::new(MockFactory::new());
        factory.set_fail_probe(true);
        let manager = manager_with(&factory);

        let result = manager.test_connection("work").await;
        assert!(!result.success);
        assert_eq!(result.account_type, AccountFamily::Imap);
        assert!(result.message.contains("unreachable"));
    }

    #[tokio::test]
    async fn family_mismatch_is_account_not_found() {
        let factory = Arc::new(MockFactory::new());
        let manager = manager_with(&factory);

        let err = manager
            .get_handler_for("work", AccountFamily::Gmail)
            .await
            .err()
            .expect("must fail");
        assert!(matches!(err, AppError::AccountNotFound(_)));

        let err = manager
            .handler_for_account("ghost")
            .await
            .err()
            .expect("must fail");
        assert!(matches!(err, AppError::AccountNotFound(_)));
    }

    #[tokio::test]
    async fn construction_error_propagates_and_later_call_retries() {
        let factory = Arc::new(MockFactory::new());
        factory.set_fail_construction(true);
        let manager = manager_with(&factory);

        let err = manager
            .handler_for_account("work")
            .await
            .err()
            .expect("must fail");
        assert!(matches!(err, AppError::Configuration(_)));
        assert_eq!(manager.pool_status().imap.count, 0);

        factory.set_fail_construction(false);
        manager.handler_for_account("work").await.expect("retry succeeds");
        assert_eq!(factory.imap_constructions(), 1);
    }

    #[tokio::test]
    async fn cleanup_empties_pools_and_is_idempotent() {
        let factory = Arc::new(MockFactory::new());
        let manager = manager_with(&factory);
        manager.handler_for_account("work").await.expect("work");
        manager.handler_for_account("personal").await.expect("personal");

        assert_eq!(manager.cleanup().await, 2);
        assert_eq!(factory.shutdowns(), 2);
        let status = manager.pool_status();
        assert_eq!(status.gmail.count, 0);
        assert_eq!(status.imap.count, 0);
        assert!(status.gmail.accounts.is_empty());
        assert!(status.imap.accounts.is_empty());

        assert_eq!(manager.cleanup().await, 0);

        manager.handler_for_account("work").await.expect("recreated");
        assert_eq!(factory.imap_constructions(), 2);
    }

    #[tokio::test]
    async fn shutdown_error_does_not_abort_cleanup() {
        let factory = Arc::new(MockFactory::new());
        factory.set_fail_shutdown(true);
        let manager = manager_with(&factory);
        manager.handler_for_account("work").await.expect("work");
        manager.handler_for_account("personal").await.expect("personal");

        assert_eq!(manager.cleanup().await, 2);
        assert_eq!(factory.shutdowns(), 2);
        assert_eq!(manager.pool_status(), Default::default());
    }

    #[tokio::test]
    async fn cleanup_shuts_down_handler_still_under_construction() {
        let factory = Arc::new(MockFactory::with_delay(Duration::from_millis(50)));
        let manager = manager_with(&factory);

        let (handler, released) = tokio::join!(manager.handler_for_account("work"), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            manager.cleanup().await
        });
        handler.expect("construction completes for its caller");
        assert_eq!(released, 1);
        assert_eq!(factory.shutdowns(), 1);
        assert_eq!(manager.pool_status().imap.count, 0);

        manager.handler_for_account("work").await.expect("fresh handler");
        assert_eq!(factory.imap_constructions(), 2);
        assert_eq!(manager.cleanup().await, 1);
        assert_eq!(factory.shutdowns(), factory.constructions());
    }
}
