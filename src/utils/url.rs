//! URL utilities for upstream identification and cache keys

use url::Url;

/// URL utilities for consistent URL handling
pub struct UrlUtils;

impl UrlUtils {
    /// Circuit breaker service name for an upstream URL.
    ///
    /// The lowercased host, with the port appended when it is not the scheme
    /// default. Unparseable URLs map to `"unknown"` so they still share a breaker.
    ///
    /// ```rust
    /// use m3u_relay::utils::url::UrlUtils;
    ///
    /// assert_eq!(UrlUtils::service_name("http://Live.Example.com/ch/1.ts"), "live.example.com");
    /// assert_eq!(UrlUtils::service_name("http://10.0.0.5:8000/stream"), "10.0.0.5:8000");
    /// ```
    pub fn service_name(url: &str) -> String {
        match Url::parse(url.trim()) {
            Ok(parsed) => match (parsed.host_str(), parsed.port()) {
                (Some(host), Some(port)) => format!("{}:{}", host.to_ascii_lowercase(), port),
                (Some(host), None) => host.to_ascii_lowercase(),
                (None, _) => "unknown".to_string(),
            },
            Err(_) => "unknown".to_string(),
        }
    }

    /// Normalize a stream URL for use as a cache key.
    ///
    /// Scheme and host are lowercased by the parser, default ports and the
    /// fragment are removed. Path and query are kept verbatim because IPTV
    /// panels encode credentials and channel ids there.
    pub fn normalize_for_cache(url: &str) -> String {
        match Url::parse(url.trim()) {
            Ok(mut parsed) => {
                parsed.set_fragment(None);
                parsed.to_string()
            }
            Err(_) => url.trim().to_string(),
        }
    }

    /// Resolve a (possibly relative) playlist entry against the playlist URL
    pub fn resolve(base: &str, reference: &str) -> String {
        if reference.starts_with("http://") || reference.starts_with("https://") {
            return reference.to_string();
        }
        match Url::parse(base).and_then(|b| b.join(reference)) {
            Ok(joined) => joined.to_string(),
            Err(_) => reference.to_string(),
        }
    }

    /// Lowercased extension of the URL path, ignoring query and fragment
    pub fn path_extension(url: &str) -> Option<String> {
        let path = match Url::parse(url) {
            Ok(parsed) => parsed.path().to_string(),
            Err(_) => url
                .split(['?', '#'])
                .next()
                .unwrap_or_default()
                .to_string(),
        };
        let file = path.rsplit('/').next()?;
        let (_, ext) = file.rsplit_once('.')?;
        if ext.is_empty() {
            None
        } else {
            Some(ext.to_ascii_lowercase())
        }
    }

    /// Strip credentials-bearing query strings before logging
    pub fn redact(url: &str) -> String {
        match Url::parse(url) {
            Ok(mut parsed) => {
                if parsed.query().is_some() {
                    parsed.set_query(Some("..."));
                }
                if !parsed.username().is_empty() {
                    let _ = parsed.set_username("***");
                }
                if parsed.password().is_some() {
                    let _ = parsed.set_password(Some("***"));
                }
                parsed.to_string()
            }
            Err(_) => url.to_string(),
        }
    }
}
