//! URL normalization.
//!
//! Query parameter order carries no meaning for matching, so both the
//! registered pattern and the outgoing request go through the same
//! canonicalization: pairs are decoded, sorted by (key, value) and re-encoded.
//! Everything before the query is left as is.

use crate::error::Result;
use url::form_urlencoded;
use url::Url;

/// Normalize an absolute URL.
pub fn normalize_url(url: &Url) -> Url {
    let mut normalized = url.clone();
    normalized.set_query(normalize_query(url.query().unwrap_or("")).as_deref());
    normalized
}

/// Parse and normalize an absolute URL string.
pub fn normalize_str(url: &str) -> Result<Url> {
    Ok(normalize_url(&Url::parse(url)?))
}

/// Sorted, decoded query pairs of `url`.
pub fn query_pairs(url: &Url) -> Vec<(String, String)> {
    sorted_pairs(url.query().unwrap_or(""))
}

/// Normalize a URL reference, absolute (`https://host/x?b=1`) or path-only
/// (`/x?b=1`). Fragments are kept.
pub fn normalize_reference(reference: &str) -> String {
    if let Ok(url) = Url::parse(reference) {
        return normalize_url(&url).to_string();
    }

    let (rest, fragment) = match reference.split_once('#') {
        Some((rest, fragment)) => (rest, Some(fragment)),
        None => (reference, None),
    };
    let mut out = match rest.split_once('?') {
        Some((path, query)) => match normalize_query(query) {
            Some(query) => format!("{}?{}", path, query),
            None => path.to_string(),
        },
        None => rest.to_string(),
    };
    if let Some(fragment) = fragment {
        out.push('#');
        out.push_str(fragment);
    }
    out
}

/// Sorted, decoded query pairs.
pub fn sorted_pairs(query: &str) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();
    pairs
}

/// Canonical query string, or None when there are no pairs.
pub fn normalize_query(query: &str) -> Option<String> {
    let pairs = sorted_pairs(query);
    if pairs.is_empty() {
        return None;
    }
    Some(
        form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_insensitive() {
        assert_eq!(
            normalize_reference("/x?b=2&a=1"),
            normalize_reference("/x?a=1&b=2")
        );

        let a = Url::parse("https://api.example.com/items?z=1&a=2").unwrap();
        let b = Url::parse("https://api.example.com/items?a=2&z=1").unwrap();
        assert_eq!(normalize_url(&a), normalize_url(&b));
        assert_eq!(
            normalize_url(&a).as_str(),
            "https://api.example.com/items?a=2&z=1"
        );
    }

    #[test]
    fn test_idempotent() {
        for input in [
            "/search?q=hello world&page=2",
            "/x?b=%2F&a=1&a=0",
            "https://example.com:8443/p/q?tag=b&tag=a#frag",
            "/plain",
        ] {
            let once = normalize_reference(input);
            assert_eq!(normalize_reference(&once), once, "input: {}", input);
        }
    }

    #[test]
    fn test_sorts_repeated_keys_by_value() {
        assert_eq!(normalize_reference("/x?tag=b&tag=a"), "/x?tag=a&tag=b");
    }

    #[test]
    fn test_leaves_path_untouched() {
        let url = Url::parse("http://Example.com/A/b/?").unwrap();
        let normalized = normalize_url(&url);
        assert_eq!(normalized.path(), "/A/b/");
        assert_eq!(normalized.query(), None);
        assert_eq!(normalize_reference("/A/b?"), "/A/b");
    }

    #[test]
    fn test_sorted_pairs_decodes() {
        let pairs = sorted_pairs("name=John%20Doe&age=3");
        assert_eq!(
            pairs,
            vec![
                ("age".to_string(), "3".to_string()),
                ("name".to_string(), "John Doe".to_string())
            ]
        );
    }

    #[test]
    fn test_normalize_str() {
        let url = normalize_str("https://api.test/x?z=1&a=2#top").unwrap();
        assert_eq!(url.as_str(), "https://api.test/x?a=2&z=1#top");
        assert_eq!(
            query_pairs(&url),
            vec![
                ("a".to_string(), "2".to_string()),
                ("z".to_string(), "1".to_string())
            ]
        );

        assert!(matches!(
            normalize_str("/relative"),
            Err(crate::error::MockError::InvalidUrl(_))
        ));
    }
}
