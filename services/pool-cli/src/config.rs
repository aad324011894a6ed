//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Every section maps onto a library options struct with serde defaults, so
//! a missing section (or an empty file) means "all defaults".

use std::path::{Path, PathBuf};

use accounts::StoreOptions;
use queue_client::ClientOptions;
use serde::Deserialize;
use txid::{TokenConstants, TokenSource};

/// Root configuration
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub client: ClientOptions,
    pub token: TokenConfig,
}

/// Where pool state lives, plus store tunables
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub cursor_path: PathBuf,
    #[serde(flatten)]
    pub options: StoreOptions,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("accounts.json"),
            cursor_path: PathBuf::from("cursors.json"),
            options: StoreOptions::default(),
        }
    }
}

/// Reference page location and token algorithm constants
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    #[serde(flatten)]
    pub source: TokenSource,
    #[serde(flatten)]
    pub constants: TokenConstants,
}

/// Set to `1` or `true` to fail fast instead of waiting for a credential.
const RAISE_WHEN_NO_ACCOUNT_ENV: &str = "POOL_RAISE_WHEN_NO_ACCOUNT";

impl Config {
    /// Load configuration from a TOML file, validate it, then overlay
    /// environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        if let Ok(value) = std::env::var(RAISE_WHEN_NO_ACCOUNT_ENV)
            && matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true")
        {
            config.client.wait_for_account = false;
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        for (name, url) in [
            ("token.page_url", &self.token.source.page_url),
            ("token.script_base", &self.token.source.script_base),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(common::Error::Config(format!(
                    "{name} must start with http:// or https://, got: {url}"
                )));
            }
        }

        if self.client.poll_interval_secs == 0 {
            return Err(common::Error::Config(
                "client.poll_interval_secs must be greater than 0".into(),
            ));
        }

        if self.client.token_attempts == 0 {
            return Err(common::Error::Config(
                "client.token_attempts must be greater than 0".into(),
            ));
        }

        if self.client.request_timeout_secs == 0 {
            return Err(common::Error::Config(
                "client.request_timeout_secs must be greater than 0".into(),
            ));
        }

        if self.store.options.claim_window_secs == 0 {
            return Err(common::Error::Config(
                "store.claim_window_secs must be greater than 0".into(),
            ));
        }

        if self.store.options.busy_backoff_min_ms > self.store.options.busy_backoff_max_ms {
            return Err(common::Error::Config(
                "store.busy_backoff_min_ms must not exceed store.busy_backoff_max_ms".into(),
            ));
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("pool-cli.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serializes tests that touch environment variables.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("pool-cli.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env(RAISE_WHEN_NO_ACCOUNT_ENV) };
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&write_config(&dir, "")).unwrap();

        assert_eq!(config.store.path, PathBuf::from("accounts.json"));
        assert_eq!(config.store.options.claim_window_secs, 900);
        assert!(config.client.wait_for_account);
        assert_eq!(config.client.token_attempts, 3);
        assert_eq!(config.token.constants.keyword, "obfiowerehiring");
        assert_eq!(config.token.source.page_url, "https://x.com/tesla");
    }

    #[test]
    fn sections_override_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env(RAISE_WHEN_NO_ACCOUNT_ENV) };
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[store]
path = "/var/lib/pool/accounts.json"
claim_window_secs = 600
busy_retries = 4

[client]
wait_for_account = false
unhandled_status_lock_secs = 300

[client.retry]
max_retries = 5

[token]
page_url = "https://mirror.test/page"
epoch_secs = 1700000000
keyword = "rotated"
"#,
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(config.store.path, PathBuf::from("/var/lib/pool/accounts.json"));
        assert_eq!(config.store.options.claim_window_secs, 600);
        assert_eq!(config.store.options.busy_retries, 4);
        assert_eq!(config.store.options.stale_lock_secs, 30);
        assert!(!config.client.wait_for_account);
        assert_eq!(config.client.unhandled_status_lock_secs, Some(300));
        assert_eq!(config.client.retry.max_retries, 5);
        assert_eq!(config.client.retry.base_delay_ms, 500);
        assert_eq!(config.token.source.page_url, "https://mirror.test/page");
        assert_eq!(config.token.constants.epoch_secs, 1_700_000_000);
        assert_eq!(config.token.constants.keyword, "rotated");
        assert_eq!(config.token.constants.total_time, 4096);
    }

    #[test]
    fn missing_file_and_bad_toml_are_errors() {
        assert!(Config::load(Path::new("/nonexistent/pool-cli.toml")).is_err());

        let dir = tempfile::tempdir().unwrap();
        let result = Config::load(&write_config(&dir, "not valid {{{{ toml"));
        assert!(result.is_err());
    }

    #[test]
    fn invalid_values_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        for (contents, needle) in [
            ("[token]\npage_url = \"x.com/tesla\"", "token.page_url"),
            ("[client]\npoll_interval_secs = 0", "poll_interval_secs"),
            ("[client]\ntoken_attempts = 0", "token_attempts"),
            ("[store]\nclaim_window_secs = 0", "claim_window_secs"),
            (
                "[store]\nbusy_backoff_min_ms = 500\nbusy_backoff_max_ms = 100",
                "busy_backoff_min_ms",
            ),
        ] {
            let err = Config::load(&write_config(&dir, contents)).unwrap_err();
            assert!(err.to_string().contains(needle), "{contents}: {err}");
        }
    }

    #[test]
    fn env_forces_fail_fast() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "[client]\nwait_for_account = true");

        unsafe { set_env(RAISE_WHEN_NO_ACCOUNT_ENV, "true") };
        assert!(!Config::load(&path).unwrap().client.wait_for_account);

        unsafe { set_env(RAISE_WHEN_NO_ACCOUNT_ENV, "0") };
        assert!(Config::load(&path).unwrap().client.wait_for_account);

        unsafe { remove_env(RAISE_WHEN_NO_ACCOUNT_ENV) };
    }

    #[test]
    fn resolve_path_precedence() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONFIG_PATH") };
        assert_eq!(Config::resolve_path(None), PathBuf::from("pool-cli.toml"));

        unsafe { set_env("CONFIG_PATH", "/env/path.toml") };
        assert_eq!(Config::resolve_path(None), PathBuf::from("/env/path.toml"));
        assert_eq!(
            Config::resolve_path(Some("/cli/wins.toml")),
            PathBuf::from("/cli/wins.toml"),
            "CLI arg must take precedence over CONFIG_PATH env var"
        );
        unsafe { remove_env("CONFIG_PATH") };
    }
}
