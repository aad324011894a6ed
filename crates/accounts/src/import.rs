//! Account file import
//!
//! Operators hand over credentials as one colon-separated line per account:
//!
//! ```text
//! username:password:email:email_password:ct0:auth_token:proxy_host:proxy_port:proxy_user:proxy_pass
//! ```
//!
//! Only the identity, the two session cookies and the proxy are kept. The
//! password and email fields belong to the login flow, which lives outside
//! this crate. The proxy fields are optional.

use std::path::Path;

use serde::Serialize;
use tracing::{info, warn};

use crate::credentials::Credential;
use crate::error::{Error, Result};

/// Fields up to and including `auth_token`.
const REQUIRED_FIELDS: usize = 6;

/// A line that could not be turned into a credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineError {
    /// 1-based line number in the source file.
    pub line: usize,
    pub message: String,
}

/// Outcome of importing an account file.
#[derive(Debug, Default)]
pub struct ImportReport {
    pub accounts: Vec<Credential>,
    pub errors: Vec<LineError>,
}

/// Parse one account line into an active credential.
pub fn parse_account_line(line: &str) -> Result<Credential> {
    let fields: Vec<&str> = line.trim().split(':').map(str::trim).collect();
    if fields.len() < REQUIRED_FIELDS {
        return Err(Error::Import(format!(
            "expected at least {REQUIRED_FIELDS} fields, got {}",
            fields.len()
        )));
    }

    let username = fields[0];
    let ct0 = fields[4];
    let auth_token = fields[5];
    if username.is_empty() {
        return Err(Error::Import("empty username".into()));
    }
    if ct0.is_empty() || auth_token.is_empty() {
        return Err(Error::Import(format!("{username}: missing ct0 or auth_token")));
    }

    let mut credential = Credential::new(username);
    credential.cookies.insert("ct0".into(), ct0.to_string());
    credential
        .cookies
        .insert("auth_token".into(), auth_token.to_string());
    credential.proxy = proxy_url(&fields[REQUIRED_FIELDS..])
        .map_err(|e| Error::Import(format!("{username}: {e}")))?;
    Ok(credential)
}

/// `http://[user:pass@]host:port` from the trailing proxy fields.
fn proxy_url(fields: &[&str]) -> std::result::Result<Option<String>, String> {
    let get = |i: usize| fields.get(i).copied().filter(|f| !f.is_empty());
    let (host, port, user, pass) = (get(0), get(1), get(2), get(3));

    let (host, port) = match (host, port) {
        (None, None) => return Ok(None),
        (Some(host), Some(port)) => (host, port),
        _ => return Err("proxy needs both host and port".into()),
    };
    port.parse::<u16>()
        .map_err(|_| format!("invalid proxy port {port:?}"))?;

    Ok(Some(match (user, pass) {
        (Some(user), Some(pass)) => format!("http://{user}:{pass}@{host}:{port}"),
        (Some(user), None) => format!("http://{user}@{host}:{port}"),
        _ => format!("http://{host}:{port}"),
    }))
}

/// Read an account file. Blank lines and `#` comments are skipped; bad
/// lines are reported in the result without stopping the import.
pub async fn load_account_file(path: &Path) -> Result<ImportReport> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::Io(format!("reading account file {}: {e}", path.display())))?;

    let mut report = ImportReport::default();
    for (idx, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_account_line(line) {
            Ok(credential) => report.accounts.push(credential),
            Err(e) => {
                warn!(line = idx + 1, error = %e, "skipping account line");
                report.errors.push(LineError {
                    line: idx + 1,
                    message: e.to_string(),
                });
            }
        }
    }

    info!(
        path = %path.display(),
        accounts = report.accounts.len(),
        rejected = report.errors.len(),
        "parsed account file"
    );
    Ok(report)
}
