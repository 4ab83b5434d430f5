/// Link normalization for incoming chat messages.
///
/// Strips tracking/query parameters and derives the base name every artifact
/// of the request is stored under.
use once_cell::sync::Lazy;
use regex::Regex;

use vidbot_shared::errors::NormalizeError;
use vidbot_shared::models::MediaRequest;

/// YouTube "watch" pages keep the video ID in the query string, not the path.
static YOUTUBE_WATCH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^https?://(?:www\.|m\.)?youtube\.com/watch\?").expect("valid regex")
});

/// Scheme plus a non-empty host.
static HTTP_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^https?://[^\s/?#]+").expect("valid regex"));

static UNSAFE_CHARS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9._-]").expect("valid regex"));

/// Base name used when the URL yields nothing usable.
pub const FALLBACK_BASE_NAME: &str = "media";

/// Normalize raw message text into a [`MediaRequest`].
///
/// Rejects empty text and anything that is not an http(s) URL.
pub fn normalize(raw: &str) -> Result<MediaRequest, NormalizeError> {
    let source = raw.trim();
    if source.is_empty() {
        return Err(NormalizeError::Empty);
    }
    if source.contains(char::is_whitespace) || !HTTP_URL_RE.is_match(source) {
        return Err(NormalizeError::NotAUrl(source.to_string()));
    }

    let (normalized_url, raw_base) = if YOUTUBE_WATCH_RE.is_match(source) {
        // Keep only the first parameter (v=ID) and name the file after its value.
        let url = source.split('&').next().unwrap_or(source);
        let query = url.rsplit('?').next().unwrap_or(url);
        let base = query.rsplit('=').next().unwrap_or(query);
        (url.to_string(), base.to_string())
    } else {
        let url = source.split('?').next().unwrap_or(source);
        let url = url.split('#').next().unwrap_or(url);
        let base = url.trim_end_matches('/').rsplit('/').next().unwrap_or(url);
        (url.to_string(), base.to_string())
    };

    Ok(MediaRequest {
        source_url: source.to_string(),
        normalized_url,
        base_name: sanitize_base_name(&raw_base),
    })
}

/// Replace anything outside `[A-Za-z0-9._-]` and guard against empty or dot-only names.
pub fn sanitize_base_name(raw: &str) -> String {
    let cleaned = UNSAFE_CHARS_RE.replace_all(raw, "_");
    let cleaned = cleaned.trim_matches('.');
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '_') {
        FALLBACK_BASE_NAME.to_string()
    } else {
        cleaned.chars().take(100).collect()
    }
}
