//! Reference page and script parsing
//!
//! Pure functions over fetched text; all network access lives in
//! `cache::RemoteSource`.

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};

use crate::constants::{ONDEMAND_MARKER, VERIFICATION_META};
use crate::error::{Error, Result};

/// Characters of move-to prefix in the animation path data.
const PATH_PREFIX_LEN: usize = 9;

static CHUNK_HASH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""ondemand\.s"\s*:\s*"([0-9a-f]+)""#).expect("static regex")
});

static INDEX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\(\w\[(\d{1,2})\],\s*16\)").expect("static regex"));

static NON_DIGITS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\d]+").expect("static regex"));

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("static selector")
}

static META_SEL: Lazy<Selector> =
    Lazy::new(|| selector(&format!("meta[name='{VERIFICATION_META}']")));
static SCRIPT_SEL: Lazy<Selector> = Lazy::new(|| selector("script[src]"));
static FRAME_SEL: Lazy<Selector> = Lazy::new(|| selector("svg[id^='loading-x-anim']"));
static PATH_SEL: Lazy<Selector> = Lazy::new(|| selector("path"));

/// Decoded verification key from the page's meta tag.
pub fn verification_key(html: &str) -> Result<Vec<u8>> {
    let doc = Html::parse_document(html);
    let content = doc
        .select(&META_SEL)
        .find_map(|el| el.value().attr("content"))
        .ok_or_else(|| Error::VerificationKey(format!("no {VERIFICATION_META} meta tag")))?;

    let content = content.trim();
    let key = STANDARD
        .decode(content)
        .or_else(|_| STANDARD_NO_PAD.decode(content.trim_end_matches('=')))
        .map_err(|e| Error::VerificationKey(format!("invalid base64: {e}")))?;
    if key.is_empty() {
        return Err(Error::VerificationKey("empty key".into()));
    }
    Ok(key)
}

/// URL of the on-demand bundle referenced by the page.
///
/// Prefers the webpack chunk map (`"ondemand.s":"<hash>"`), then any plain
/// `<script src>` that names the bundle.
pub fn ondemand_script_url(html: &str, script_base: &str) -> Option<String> {
    if let Some(caps) = CHUNK_HASH_RE.captures(html) {
        let base = script_base.trim_end_matches('/');
        return Some(format!("{base}/{ONDEMAND_MARKER}.{}a.js", &caps[1]));
    }

    let doc = Html::parse_document(html);
    let marker = format!("{ONDEMAND_MARKER}.");
    doc.select(&SCRIPT_SEL)
        .filter_map(|el| el.value().attr("src"))
        .find(|src| src.contains(&marker))
        .map(str::to_string)
}

/// Key indices named by `(x[<n>], 16)` occurrences in the bundle, in order.
pub fn animation_indices(script: &str) -> Vec<usize> {
    INDEX_RE
        .captures_iter(script)
        .filter_map(|caps| caps[1].parse().ok())
        .collect()
}

/// Frame rows of the animation candidate selected by the key.
///
/// Each `svg[id^='loading-x-anim']` is a candidate; `key[5] % count` picks
/// one. Its second path's data, minus the move-to prefix, splits on `C` into
/// rows of integers.
pub fn frame_rows(html: &str, key: &[u8]) -> Result<Vec<Vec<f64>>> {
    let doc = Html::parse_document(html);
    let candidates: Vec<_> = doc.select(&FRAME_SEL).collect();
    if candidates.is_empty() {
        return Err(Error::Animation("no loading animation on page".into()));
    }
    let selector_byte = key
        .get(5)
        .ok_or_else(|| Error::Animation(format!("key too short ({} bytes)", key.len())))?;
    let frame = candidates[*selector_byte as usize % candidates.len()];

    let data = frame
        .select(&PATH_SEL)
        .nth(1)
        .and_then(|path| path.value().attr("d"))
        .ok_or_else(|| Error::Animation("animation has no second path".into()))?;
    let data = data
        .get(PATH_PREFIX_LEN..)
        .ok_or_else(|| Error::Animation("path data too short".into()))?;

    let rows: Vec<Vec<f64>> = data
        .split('C')
        .map(|segment| {
            NON_DIGITS_RE
                .replace_all(segment, " ")
                .split_whitespace()
                .filter_map(|n| n.parse::<f64>().ok())
                .collect::<Vec<_>>()
        })
        .collect();
    Ok(rows)
}
