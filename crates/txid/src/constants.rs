//! Token algorithm constants and reference page locations
//!
//! The numeric constants are whatever the live service currently expects and
//! do change upstream, so both structs load from the `[token]` config section
//! with these values as defaults.

use serde::{Deserialize, Serialize};

/// Request header the token is sent in.
pub const TRANSACTION_ID_HEADER: &str = "x-client-transaction-id";

/// Meta tag carrying the base64 verification key.
pub const VERIFICATION_META: &str = "twitter-site-verification";

/// Marker of the on-demand bundle in script names and chunk maps.
pub const ONDEMAND_MARKER: &str = "ondemand.s";

/// Fixed inputs of the per-request computation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConstants {
    /// Reference epoch (unix seconds) the time offset counts from.
    pub epoch_secs: i64,
    pub keyword: String,
    /// Byte appended after the hash.
    pub trailing_byte: u8,
    /// Animation length the frame time is divided by.
    pub total_time: u32,
}

impl Default for TokenConstants {
    fn default() -> Self {
        Self {
            epoch_secs: 1_682_924_400,
            keyword: "obfiowerehiring".to_string(),
            trailing_byte: 3,
            total_time: 4096,
        }
    }
}

/// Where verification material is fetched from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenSource {
    /// Any public page that embeds the meta tag and the loading animation.
    pub page_url: String,
    /// Directory the on-demand bundle is served from.
    pub script_base: String,
    pub user_agent: String,
    pub timeout_secs: u64,
}

impl Default for TokenSource {
    fn default() -> Self {
        Self {
            page_url: "https://x.com/tesla".to_string(),
            script_base: "https://abs.twimg.com/responsive-web/client-web".to_string(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36".to_string(),
            timeout_secs: 30,
        }
    }
}
