//! Order-independent request identity and the merge hash derived from it.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use url::Url;

/// A request URL normalized for query-parameter order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalIdentity {
    pub host: String,
    pub path: String,
    pub sorted_query_string: String,
    pub query_keys: Vec<String>,
}

/// Canonicalize a raw URL.
///
/// Absolute URLs have their decoded query pairs stable-sorted by key (ordinal
/// comparison). Anything that does not parse as absolute is split on the first
/// `?` and keeps its original parameter order, so it only ever matches itself.
pub fn canonicalize(raw: &str) -> CanonicalIdentity {
    match Url::parse(raw) {
        Ok(url) => from_parsed(&url),
        Err(_) => fallback(raw),
    }
}

fn from_parsed(url: &Url) -> CanonicalIdentity {
    let mut params: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    // `sort_by` is stable: duplicate keys keep their relative order.
    params.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

    let sorted_query_string = params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    let query_keys = params.into_iter().map(|(k, _)| k).collect();

    let host = match (url.host_str(), url.port()) {
        (Some(h), Some(port)) => format!("{h}:{port}"),
        (Some(h), None) => h.to_string(),
        (None, _) => String::new(),
    };

    CanonicalIdentity {
        host,
        path: url.path().to_string(),
        sorted_query_string,
        query_keys,
    }
}

fn fallback(raw: &str) -> CanonicalIdentity {
    let (path, query) = match raw.split_once('?') {
        Some((path, query)) => (path, query),
        None => (raw, ""),
    };
    let query_keys = if query.is_empty() {
        Vec::new()
    } else {
        query
            .split('&')
            .map(|pair| pair.split('=').next().unwrap_or_default().to_string())
            .collect()
    };

    CanonicalIdentity {
        host: String::new(),
        path: path.to_string(),
        sorted_query_string: query.to_string(),
        query_keys,
    }
}

/// Merge identity for a detection: hex SHA-1 of `key|host|path|query`.
///
/// Input ordering and separator are part of the stored-report format.
pub fn event_hash(provider_key: &str, identity: &CanonicalIdentity) -> String {
    let mut hasher = Sha1::new();
    hasher.update(provider_key.as_bytes());
    hasher.update(b"|");
    hasher.update(identity.host.as_bytes());
    hasher.update(b"|");
    hasher.update(identity.path.as_bytes());
    hasher.update(b"|");
    hasher.update(identity.sorted_query_string.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorts_query_params_and_extracts_keys() {
        let c = canonicalize("https://example.com/path/to?p=2&a=1&a=1&b=3");
        assert_eq!(c.host, "example.com");
        assert_eq!(c.path, "/path/to");
        assert_eq!(c.sorted_query_string, "a=1&a=1&b=3&p=2");
        assert_eq!(c.query_keys, vec!["a", "a", "b", "p"]);
    }

    #[test]
    fn order_invariant_across_permutations() {
        let a = canonicalize("https://t.example/x?c=2&a=1&b=3");
        let b = canonicalize("https://t.example/x?a=1&b=3&c=2");
        let c = canonicalize("https://t.example/x?b=3&c=2&a=1");
        assert_eq!(a.sorted_query_string, "a=1&b=3&c=2");
        assert_eq!(a, b);
        assert_eq!(b, c);
    }

    #[test]
    fn duplicate_keys_keep_relative_order() {
        let c = canonicalize("https://t.example/?z=9&k=second&a=0&k=first");
        assert_eq!(c.sorted_query_string, "a=0&k=second&k=first&z=9");
    }

    #[test]
    fn ordinal_comparison_puts_uppercase_first() {
        let c = canonicalize("https://t.example/?b=1&B=2&a=3");
        assert_eq!(c.query_keys, vec!["B", "a", "b"]);
    }

    #[test]
    fn non_default_port_kept_in_host() {
        let c = canonicalize("http://localhost:8080/collect?x=1");
        assert_eq!(c.host, "localhost:8080");
        let d = canonicalize("https://example.com:443/collect");
        assert_eq!(d.host, "example.com");
    }

    #[test]
    fn values_are_decoded() {
        let c = canonicalize("https://t.example/g?dl=https%3A%2F%2Fsite.test%2F&en=page+view");
        assert_eq!(c.sorted_query_string, "dl=https://site.test/&en=page view");
    }

    #[test]
    fn falls_back_on_relative_urls_without_sorting() {
        let c = canonicalize("/relative/path?z=1&y=2");
        assert_eq!(c.host, "");
        assert_eq!(c.path, "/relative/path");
        assert_eq!(c.sorted_query_string, "z=1&y=2");
        assert_eq!(c.query_keys, vec!["z", "y"]);
    }

    #[test]
    fn fallback_splits_on_first_question_mark_only() {
        let c = canonicalize("not a url?a=1?b=2");
        assert_eq!(c.path, "not a url");
        assert_eq!(c.sorted_query_string, "a=1?b=2");
        assert_eq!(c.query_keys, vec!["a"]);
    }

    #[test]
    fn fallback_without_query() {
        let c = canonicalize("just-a-path");
        assert_eq!(c.path, "just-a-path");
        assert!(c.sorted_query_string.is_empty());
        assert!(c.query_keys.is_empty());
    }

    #[test]
    fn hash_matches_reference_layout() {
        let identity = CanonicalIdentity {
            host: "h".to_string(),
            path: "/p".to_string(),
            sorted_query_string: "a=1".to_string(),
            query_keys: vec!["a".to_string()],
        };
        let mut hasher = Sha1::new();
        hasher.update(b"KEY|h|/p|a=1");
        let expected = hex::encode(hasher.finalize());
        assert_eq!(event_hash("KEY", &identity), expected);
        assert_eq!(expected.len(), 40);
    }

    #[test]
    fn hash_is_order_invariant_and_provider_scoped() {
        let a = canonicalize("https://www.googletagmanager.com/gtm.js?id=GTM-XYZ&a=1");
        let b = canonicalize("https://www.googletagmanager.com/gtm.js?a=1&id=GTM-XYZ");
        assert_eq!(event_hash("GOOGLETAGMAN", &a), event_hash("GOOGLETAGMAN", &b));
        assert_ne!(event_hash("GOOGLETAGMAN", &a), event_hash("OTHER", &a));
    }
}
