//! Credential pool operator CLI
//!
//! Single binary for managing the shared account pool and checking that
//! requests go through:
//! 1. Loads config (`--config`, `CONFIG_PATH`, `pool-cli.toml`)
//! 2. Opens the credential store the queue clients share
//! 3. Runs one subcommand and prints its result as JSON on stdout
//!
//! Logs are JSON on stderr, filtered by `LOG_LEVEL` or `RUST_LOG`.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use accounts::{CredentialStore, load_account_file};
use anyhow::{Context, Result, bail};
use metrics_exporter_prometheus::PrometheusBuilder;
use queue_client::{CursorStore, QueueClient};
use serde_json::{Value, json};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transport::SessionTransportFactory;
use txid::{GeneratorCache, RemoteSource};

use crate::config::Config;

const USAGE: &str = "usage: pool-cli [--config <path>] <command>

commands:
  add-accounts <file>       import colon-separated account lines
  accounts                  list accounts
  stats                     pool counts and per-queue locks
  reset-locks               clear every queue lock
  delete-inactive           remove deactivated accounts
  activate <username>       re-enable an account after re-login
  cursors                   unfinished pagination cursors
  cleanup-cursors <secs>    drop completed cursors older than <secs>
  probe <queue> <url>       send one GET through a queue client";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    AddAccounts(PathBuf),
    Accounts,
    Stats,
    ResetLocks,
    DeleteInactive,
    Activate(String),
    Cursors,
    CleanupCursors(i64),
    Probe { queue: String, url: String },
}

/// Split `--config <path>` from the rest and parse the subcommand.
fn parse_args(args: &[String]) -> Result<(Option<String>, Command)> {
    let mut config_path = None;
    let mut rest = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            let path = iter.next().context("--config needs a path")?;
            config_path = Some(path.clone());
        } else {
            rest.push(arg.as_str());
        }
    }

    let command = match rest.as_slice() {
        ["add-accounts", file] => Command::AddAccounts(PathBuf::from(*file)),
        ["accounts"] => Command::Accounts,
        ["stats"] => Command::Stats,
        ["reset-locks"] => Command::ResetLocks,
        ["delete-inactive"] => Command::DeleteInactive,
        ["activate", username] => Command::Activate(username.to_string()),
        ["cursors"] => Command::Cursors,
        ["cleanup-cursors", secs] => Command::CleanupCursors(
            secs.parse::<i64>()
                .with_context(|| format!("invalid age in seconds: {secs}"))?,
        ),
        ["probe", queue, url] => Command::Probe {
            queue: queue.to_string(),
            url: url.to_string(),
        },
        [] => bail!("missing command\n\n{USAGE}"),
        other => bail!("unknown command: {}\n\n{USAGE}", other.join(" ")),
    };
    Ok((config_path, command))
}

async fn open_store(config: &Config) -> Result<Arc<CredentialStore>> {
    let store = CredentialStore::load(config.store.path.clone(), config.store.options.clone())
        .await
        .with_context(|| format!("failed to open store {}", config.store.path.display()))?;
    Ok(Arc::new(store))
}

async fn run(command: Command, config: &Config) -> Result<Value> {
    match command {
        Command::AddAccounts(file) => {
            let store = open_store(config).await?;
            let report = load_account_file(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let added = report.accounts.len();
            for credential in report.accounts {
                store.add(credential).await?;
            }
            info!(added, rejected = report.errors.len(), "imported accounts");
            Ok(json!({ "added": added, "errors": report.errors }))
        }
        Command::Accounts => {
            let store = open_store(config).await?;
            Ok(serde_json::to_value(store.accounts_info().await?)?)
        }
        Command::Stats => {
            let store = open_store(config).await?;
            Ok(serde_json::to_value(store.stats().await?)?)
        }
        Command::ResetLocks => {
            let store = open_store(config).await?;
            store.reset_locks().await?;
            Ok(json!({ "reset": true }))
        }
        Command::DeleteInactive => {
            let store = open_store(config).await?;
            let deleted = store.delete_inactive().await?;
            Ok(json!({ "deleted": deleted }))
        }
        Command::Activate(username) => {
            let store = open_store(config).await?;
            store.set_active(&username, true).await?;
            Ok(json!({ "activated": username }))
        }
        Command::Cursors => {
            let cursors = CursorStore::load(config.store.cursor_path.clone()).await?;
            Ok(json!({
                "stats": cursors.stats().await,
                "active": cursors.active().await,
            }))
        }
        Command::CleanupCursors(older_than_secs) => {
            let cursors = CursorStore::load(config.store.cursor_path.clone()).await?;
            let removed = cursors.cleanup(older_than_secs).await?;
            Ok(json!({ "removed": removed }))
        }
        Command::Probe { queue, url } => probe(config, queue, &url).await,
    }
}

/// One GET through a fully wired queue client.
async fn probe(config: &Config, queue: String, url: &str) -> Result<Value> {
    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install metrics recorder")?;

    let store = open_store(config).await?;
    let factory = SessionTransportFactory::new(config.client.request_timeout())
        .with_user_agent(config.token.source.user_agent.clone());
    let source = RemoteSource::new(config.token.source.clone(), config.token.constants.clone())
        .context("failed to build token source")?;
    let generators = Arc::new(GeneratorCache::new(Arc::new(source)));

    let mut client = QueueClient::new(
        queue,
        store,
        Arc::new(factory),
        generators,
        config.client.clone(),
    );
    let outcome = client.get(url, &[]).await;
    client.close().await;

    let mut result = match outcome? {
        Some(rep) => json!({
            "status": rep.status,
            "served_by": rep.served_by,
            "bytes": rep.body.len(),
        }),
        None => json!({ "aborted": true }),
    };
    result["metrics"] = Value::String(prometheus.render());
    Ok(result)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (cli_config_path, command) = parse_args(&args)?;

    let config_path = Config::resolve_path(cli_config_path.as_deref());
    info!(path = %config_path.display(), "loading configuration");
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let output = run(command, &config).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
