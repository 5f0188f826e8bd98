use url::Url;

/// Resolve the tracked-domain key for a page URL: the host name with a
/// leading `www.` stripped. Path, query, scheme, and port are ignored.
/// Returns `None` for unparsable URLs or URLs without a host.
#[must_use]
pub fn tracked_domain(raw_url: &str) -> Option<String> {
    let url = Url::parse(raw_url).ok()?;
    let host = url.host_str()?;
    normalize_domain(host)
}

/// Normalize a bare domain the same way tracked URLs are keyed. Accepts what
/// users type into the add-site command (`www.example.com`, `Example.com`).
#[must_use]
pub fn normalize_domain(input: &str) -> Option<String> {
    let trimmed = input.trim().to_ascii_lowercase();
    let host = trimmed.strip_prefix("www.").unwrap_or(&trimmed);
    if host.is_empty() || host.contains('/') || host.contains(' ') {
        return None;
    }
    Some(host.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_leading_www_only() {
        assert_eq!(
            tracked_domain("https://www.reddit.com/r/rust").as_deref(),
            Some("reddit.com")
        );
        assert_eq!(
            tracked_domain("https://news.ycombinator.com/item?id=1").as_deref(),
            Some("news.ycombinator.com")
        );
        // "www" embedded elsewhere in the host is not a prefix
        assert_eq!(
            tracked_domain("https://notwww.example.com/").as_deref(),
            Some("notwww.example.com")
        );
    }

    #[test]
    fn ignores_path_query_and_scheme() {
        assert_eq!(
            tracked_domain("http://example.com:8080/a/b?q=1").as_deref(),
            Some("example.com")
        );
    }

    #[test]
    fn unparsable_urls_resolve_to_none() {
        assert_eq!(tracked_domain("not a url"), None);
        assert_eq!(tracked_domain(""), None);
        assert_eq!(tracked_domain("about:blank"), None);
    }

    #[test]
    fn normalizes_user_typed_domains() {
        assert_eq!(
            normalize_domain("www.Example.com").as_deref(),
            Some("example.com")
        );
        assert_eq!(normalize_domain("  reddit.com "), Some("reddit.com".into()));
        assert_eq!(normalize_domain(""), None);
        assert_eq!(normalize_domain("www."), None);
    }
}
