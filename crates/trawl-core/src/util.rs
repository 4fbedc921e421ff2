use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use url::Url;

use crate::error::AppError;

/// Normalize a URL into the per-job dedup key.
///
/// Scheme and host are lowercased and default ports dropped (by `url`), the fragment is
/// removed, and an empty `?` is dropped. Path and query are kept verbatim.
pub fn normalize_url(raw: &str) -> Result<String, AppError> {
    let mut url = Url::parse(raw.trim()).map_err(|e| AppError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::InvalidUrl {
                url: raw.to_string(),
                reason: format!("scheme '{scheme}' is not allowed (only http/https)"),
            });
        }
    }
    if url.host_str().is_none() {
        return Err(AppError::InvalidUrl {
            url: raw.to_string(),
            reason: "URL has no host".to_string(),
        });
    }

    url.set_fragment(None);
    if url.query() == Some("") {
        url.set_query(None);
    }
    Ok(url.to_string())
}

/// Lowercased host of `url`, if it has one.
pub fn host_of(url: &str) -> Option<String> {
    Url::parse(url.trim())
        .ok()?
        .host_str()
        .map(str::to_ascii_lowercase)
}

/// Resolve a possibly relative link against the page it was found on.
pub fn resolve_url(base: &str, link: &str) -> Result<String, AppError> {
    let base = Url::parse(base).map_err(|e| AppError::InvalidUrl {
        url: base.to_string(),
        reason: e.to_string(),
    })?;
    base.join(link.trim())
        .map(|u| u.to_string())
        .map_err(|e| AppError::InvalidUrl {
            url: link.to_string(),
            reason: e.to_string(),
        })
}

/// Read non-empty, non-comment lines from a text file (URL lists, proxy lists).
pub fn read_list_file(path: &Path) -> Result<Vec<String>, AppError> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

// ---------------------------------------------------------------------------
// Jitter based on std, seeded from the clock plus a per-process counter.
// Good enough for backoff and proxy weighting, not crypto.
// ---------------------------------------------------------------------------

static JITTER_COUNTER: AtomicU64 = AtomicU64::new(0x9E37_79B9_7F4A_7C15);

/// Uniform-ish value in `[0, max)`. Returns 0 when `max` is 0.
pub fn random_below(max: u64) -> u64 {
    if max == 0 {
        return 0;
    }
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let mut x = nanos ^ JITTER_COUNTER.fetch_add(0x9E37_79B9_7F4A_7C15, Ordering::Relaxed);
    // xorshift64
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x % max
}

/// Random float in `[0, 1)`.
pub fn random_unit() -> f64 {
    const SCALE: u64 = 1 << 53;
    random_below(SCALE) as f64 / SCALE as f64
}
