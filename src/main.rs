//! mail-accounts-mcp: multi-account email MCP server over stdio
//!
//! This server exposes Gmail API and IMAP mailboxes as MCP tools over
//! line-delimited JSON-RPC on stdio. Each account gets one long-lived,
//! lazily created handler, and stored IMAP passwords may be encrypted at
//! rest with AES-256-GCM.
//!
//! # Architecture
//!
//! - [`main`]: Process entry point with CLI, env loading and stdio serving
//! - [`config`]: Environment-driven configuration for accounts and timeouts
//! - [`accounts`]: Account descriptors and the identity directory
//! - [`crypto`]: Secret encryption and decryption
//! - [`redact`]: Masking of credential fields before logging
//! - [`pool`]: Keyed single-flight pool
//! - [`manager`]: Per-family handler pools, probes and teardown
//! - [`handler`]: Provider handler contract and factory
//! - [`gmail`] / [`imap`] / [`smtp`]: Provider implementations
//! - [`mime`] / [`message_id`]: Message parsing and IMAP message ids
//! - [`rpc`] / [`server`] / [`transport`]: JSON-RPC envelope, dispatch and stdio loop
//! - [`errors`]: Application error model with JSON-RPC error mapping
//! - [`models`]: Input/output DTOs and schema-bearing types

mod accounts;
mod config;
mod crypto;
mod errors;
mod gmail;
mod handler;
mod imap;
mod manager;
mod message_id;
mod mime;
mod models;
mod pool;
mod redact;
mod rpc;
mod server;
mod smtp;
#[cfg(test)]
mod test_support;
mod transport;

use std::io::Read;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

use accounts::AccountDirectory;
use config::ServerConfig;
use errors::AppError;
use handler::{HandlerFactory, ProviderFactory};
use manager::ConnectionManager;
use server::MailServer;

#[derive(Debug, Parser)]
#[command(version, about = "Multi-account email MCP server over stdio")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve JSON-RPC requests on stdin/stdout (default)
    Serve,
    /// Encrypt a secret read from stdin with MAIL_MCP_SECRET_KEY
    Encrypt,
    /// Decrypt an `iv:ciphertext` payload read from stdin with MAIL_MCP_SECRET_KEY
    Decrypt,
}

/// Application entry point
///
/// Initializes tracing on stderr, loads config and serves until stdin
/// closes or the process is interrupted. Pooled handlers are shut down
/// before exit.
///
/// # Environment Variables
///
/// See [`ServerConfig::load_from_env`] for full configuration options.
///
/// # Example
///
/// ```no_run
/// MAIL_IMAP_WORK_HOST=imap.example.com \
/// MAIL_IMAP_WORK_USER=user@example.com \
/// MAIL_IMAP_WORK_PASS=secret \
/// cargo run
/// ```
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve().await?,
        Command::Encrypt => println!("{}", crypto::encrypt(&read_stdin()?, &secret_key()?)?),
        Command::Decrypt => println!("{}", crypto::decrypt(read_stdin()?.trim(), &secret_key()?)?),
    }
    Ok(())
}

async fn serve() -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig::load_from_env()?;
    let factory: Arc<dyn HandlerFactory> =
        Arc::new(ProviderFactory::new(config.timeouts, config.secret_key));
    let manager = Arc::new(ConnectionManager::new(
        Arc::new(AccountDirectory::new()),
        factory,
    ));
    for (account_id, descriptor) in config.accounts {
        manager.add_account(account_id, descriptor);
    }
    tracing::info!(accounts = ?manager.directory().list_accounts(), "configuration loaded");
    let server = MailServer::new(Arc::clone(&manager));

    let outcome = tokio::select! {
        result = transport::serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout(), server) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted");
            Ok(())
        }
    };

    let released = manager.cleanup().await;
    tracing::info!(released, "shutdown complete");
    outcome?;
    Ok(())
}

fn secret_key() -> Result<String, AppError> {
    config::secret_key_from_env()
        .map(|key| key.expose_secret().to_owned())
        .ok_or_else(|| AppError::Configuration(format!("{} is not set", config::SECRET_KEY_VAR)))
}

/// Read stdin, dropping one trailing newline
fn read_stdin() -> Result<String, AppError> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .map_err(|e| AppError::InvalidInput(format!("failed to read stdin: {e}")))?;
    let trimmed = input.strip_suffix('\n').unwrap_or(&input);
    Ok(trimmed.strip_suffix('\r').unwrap_or(trimmed).to_owned())
}
