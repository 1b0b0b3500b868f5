//! URL canonicalization and cache fingerprinting.
//!
//! Two URLs that differ only in scheme/host case, default port, fragment,
//! or query parameter order normalize to the same string and therefore
//! hash to the same fingerprint. The path keeps its case.

use url::Url;
use xxhash_rust::xxh64::xxh64;

use crate::error::UrlError;

/// Canonicalize a URL string.
///
/// - scheme and host lowercased, only http/https accepted
/// - default ports (80/443) dropped
/// - fragment dropped
/// - query pairs sorted lexicographically by key (stable for equal keys)
///   and re-encoded consistently
pub fn normalize(raw: &str) -> Result<String, UrlError> {
    normalize_stripped(raw, &[])
}

/// Canonicalize with tracking-parameter stripping applied first. Parameter
/// names match exactly (case-sensitive).
pub fn normalize_stripped(raw: &str, tracking_params: &[String]) -> Result<String, UrlError> {
    let mut url = Url::parse(raw.trim()).map_err(|_| UrlError::Invalid(raw.to_string()))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(UrlError::UnsupportedScheme {
                url: raw.to_string(),
                scheme: other.to_string(),
            })
        }
    }
    if url.host_str().is_none() {
        return Err(UrlError::NoHost(raw.to_string()));
    }

    url.set_fragment(None);

    // The url crate already lowercases host and scheme and drops default
    // ports for http/https. What remains is query canonicalization.
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .filter(|(k, _)| !tracking_params.iter().any(|p| p == k))
        .collect();

    if pairs.is_empty() {
        url.set_query(None);
    } else {
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .finish();
        url.set_query(Some(&query));
    }

    Ok(url.to_string())
}

/// Fixed-width lowercase hex xxh64 digest of a canonical URL string.
pub fn fingerprint(normalized: &str) -> String {
    format!("{:016x}", xxh64(normalized.as_bytes(), 0))
}

/// Normalize then fingerprint in one step.
pub fn hash_url(raw: &str, tracking_params: &[String]) -> Result<String, UrlError> {
    Ok(fingerprint(&normalize_stripped(raw, tracking_params)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equivalent_urls_normalize_identically() {
        let cases = [
            ("https://Example.COM/page?a=1&b=2", "https://example.com/page?b=2&a=1"),
            ("HTTP://example.com:80/x", "http://example.com/x"),
            ("https://example.com:443/x", "https://example.com/x"),
            ("https://example.com/x#frag", "https://example.com/x"),
        ];
        for (left, right) in cases {
            assert_eq!(
                normalize(left).unwrap(),
                normalize(right).unwrap(),
                "{left} vs {right}"
            );
        }
    }

    #[test]
    fn equivalent_urls_hash_identically() {
        let a = hash_url("https://example.com/page?a=1&b=2", &[]).unwrap();
        let b = hash_url("https://EXAMPLE.com/page?b=2&a=1#top", &[]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn path_case_is_preserved() {
        let a = normalize("https://example.com/Page").unwrap();
        let b = normalize("https://example.com/page").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn non_default_port_is_kept() {
        let n = normalize("https://example.com:8443/x").unwrap();
        assert!(n.contains(":8443"), "{n}");
    }

    #[test]
    fn tracking_params_are_stripped_before_hashing() {
        let tracking = vec!["utm_source".to_string(), "utm_medium".to_string()];
        let a = hash_url("https://example.com/p?utm_source=x&id=1", &tracking).unwrap();
        let b = hash_url("https://example.com/p?id=1&utm_medium=y", &tracking).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn stripping_all_params_drops_the_query() {
        let tracking = vec!["utm_source".to_string()];
        let n = normalize_stripped("https://example.com/p?utm_source=x", &tracking).unwrap();
        assert_eq!(n, "https://example.com/p");
    }

    #[test]
    fn rejects_relative_and_schemeless() {
        assert!(normalize("/just/a/path").is_err());
        assert!(normalize("example.com/x").is_err());
    }

    #[test]
    fn rejects_non_http_schemes() {
        assert!(matches!(
            normalize("ftp://example.com/x"),
            Err(UrlError::UnsupportedScheme { .. })
        ));
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let n = normalize("https://example.com/page?a=1").unwrap();
        assert_eq!(fingerprint(&n), fingerprint(&n));
    }
}
