//! URL canonicalization and request URL building.

use serde_json::Value;
use url::Url;

/// Error type for URL building failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UrlError {
    #[error("empty URL")]
    Empty,

    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("relative path {0:?} without a base URL")]
    MissingBase(String),
}

/// Canonicalize an absolute URL string.
///
/// Normalization steps:
/// 1. Trim leading/trailing whitespace
/// 2. Default scheme to https:// if missing
/// 3. Lowercase the host
/// 4. Remove fragment (#...)
/// 5. Sort query pairs by name so equal requests produce equal URLs
pub fn canonicalize(input: &str) -> Result<Url, UrlError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(UrlError::Empty);
    }

    let url_str = if trimmed.contains("://") { trimmed.to_string() } else { format!("https://{trimmed}") };
    let mut parsed = Url::parse(&url_str).map_err(|e| UrlError::InvalidUrl(e.to_string()))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlError::UnsupportedScheme(scheme.to_string())),
    }

    if let Some(host) = parsed.host_str().map(str::to_lowercase) {
        parsed.set_host(Some(&host)).map_err(|e| UrlError::InvalidUrl(e.to_string()))?;
    }
    parsed.set_fragment(None);

    let mut pairs: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();
    if !pairs.is_empty() {
        pairs.sort();
        parsed.query_pairs_mut().clear().extend_pairs(pairs);
    }

    Ok(parsed)
}

/// Resolve `path` against `base`. Absolute URLs are canonicalized as-is.
pub fn resolve(base: Option<&Url>, path: &str) -> Result<Url, UrlError> {
    let path = path.trim();
    if path.contains("://") {
        return canonicalize(path);
    }
    let base = base.ok_or_else(|| UrlError::MissingBase(path.to_string()))?;
    let joined = base.join(path.trim_start_matches('/')).map_err(|e| UrlError::InvalidUrl(e.to_string()))?;
    canonicalize(joined.as_str())
}

/// Append JSON request params as query pairs.
///
/// Objects contribute one pair per field (arrays repeat the name); scalars
/// are rendered without quotes and `null` fields are skipped. Non-object
/// params are ignored.
pub fn with_query(mut url: Url, params: &Value) -> Url {
    let Value::Object(fields) = params else {
        return url;
    };
    if fields.is_empty() {
        return url;
    }

    let mut pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    for (name, value) in fields {
        match value {
            Value::Array(items) => pairs.extend(items.iter().filter_map(render).map(|v| (name.clone(), v))),
            other => pairs.extend(render(other).map(|v| (name.clone(), v))),
        }
    }
    if pairs.is_empty() {
        return url;
    }
    pairs.sort();
    url.query_pairs_mut().clear().extend_pairs(pairs);
    url
}

fn render(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
