use url::{Host, Url};

/// Registrable domain (eTLD+1) of a URL, if it has one.
///
/// IP hosts and bare public suffixes have no registrable domain.
pub fn registrable_domain(raw: &str) -> Option<String> {
    let url = Url::parse(raw).ok()?;
    match url.host()? {
        Host::Domain(host) => {
            let host = host.trim_end_matches('.');
            psl::domain_str(host).map(str::to_string)
        }
        Host::Ipv4(_) | Host::Ipv6(_) => None,
    }
}

/// Whether a request goes to a different registrable domain than the page.
/// Anything that cannot be resolved counts as third party.
pub fn is_third_party(request_url: &str, first_party_url: &str) -> bool {
    match (
        registrable_domain(request_url),
        registrable_domain(first_party_url),
    ) {
        (Some(req), Some(first)) => req != first,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_registrable_domain_is_first_party() {
        assert!(!is_third_party(
            "https://cdn.example.com/script.js",
            "https://www.example.com"
        ));
    }

    #[test]
    fn different_domain_is_third_party() {
        assert!(is_third_party(
            "https://tracker.com/collect",
            "https://www.example.com"
        ));
    }

    #[test]
    fn public_suffix_only_is_third_party() {
        assert!(is_third_party("https://com/whatever", "https://example.com"));
    }

    #[test]
    fn multi_label_suffixes() {
        assert_eq!(
            registrable_domain("https://shop.example.co.uk/x").as_deref(),
            Some("example.co.uk")
        );
        assert!(is_third_party(
            "https://other.co.uk/",
            "https://www.example.co.uk/"
        ));
    }

    #[test]
    fn unparseable_or_ip_is_third_party() {
        assert!(is_third_party("not a url", "https://example.com"));
        assert!(is_third_party("http://10.0.0.1/p", "http://10.0.0.1/"));
        assert_eq!(registrable_domain("http://127.0.0.1:8080/"), None);
    }
}
