//! Per-credential token generator
//!
//! Holds the verification key and animation key derived from one fetch of
//! the reference page. `calc` is cheap and called once per request.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::RngExt;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::anim::derive_animation_key;
use crate::constants::TokenConstants;
use crate::error::{Error, Result};
use crate::page;

/// Leading hash bytes kept in the token.
const HASH_PREFIX_LEN: usize = 16;

/// Derived signing material for one credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIdGenerator {
    verification_key: Vec<u8>,
    animation_key: String,
    constants: TokenConstants,
}

impl TxIdGenerator {
    pub fn new(verification_key: Vec<u8>, animation_key: String, constants: TokenConstants) -> Self {
        Self {
            verification_key,
            animation_key,
            constants,
        }
    }

    /// Build from an already fetched reference page and on-demand script.
    pub fn from_sources(page_html: &str, script: &str, constants: TokenConstants) -> Result<Self> {
        let verification_key = page::verification_key(page_html)?;
        let indices = page::animation_indices(script);
        if indices.is_empty() {
            return Err(Error::Script("no animation indices in script".into()));
        }
        let rows = page::frame_rows(page_html, &verification_key)?;
        let animation_key =
            derive_animation_key(&rows, &indices, &verification_key, constants.total_time)?;

        debug!(
            key_len = verification_key.len(),
            indices = indices.len(),
            animation_key = %animation_key,
            "derived token material"
        );
        Ok(Self::new(verification_key, animation_key, constants))
    }

    pub fn verification_key(&self) -> &[u8] {
        &self.verification_key
    }

    pub fn animation_key(&self) -> &str {
        &self.animation_key
    }

    /// Token for `method` and `path` at the current time with a random salt.
    pub fn calc(&self, method: &str, path: &str) -> String {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        let salt: u8 = rand::rng().random();
        self.calc_with(method, path, salt, now_ms)
    }

    /// Deterministic core of [`calc`](Self::calc).
    pub fn calc_with(&self, method: &str, path: &str, salt: u8, now_ms: i64) -> String {
        let offset = (now_ms - self.constants.epoch_secs * 1000).div_euclid(1000);
        let offset_bytes = (offset as u32).to_le_bytes();

        let payload = format!(
            "{}!{}!{}{}{}",
            method.to_uppercase(),
            path,
            offset,
            self.constants.keyword,
            self.animation_key
        );
        let hash = Sha256::digest(payload.as_bytes());

        let mut bytes = Vec::with_capacity(self.verification_key.len() + 22);
        bytes.push(salt);
        bytes.extend(
            self.verification_key
                .iter()
                .chain(offset_bytes.iter())
                .chain(hash[..HASH_PREFIX_LEN].iter())
                .chain(std::iter::once(&self.constants.trailing_byte))
                .map(|b| b ^ salt),
        );

        STANDARD.encode(&bytes).trim_end_matches('=').to_string()
    }
}
