//! Key comparison and header filtering shared by the public and internal
//! surfaces.

use std::collections::HashMap;

pub use edgerender_common::util::constant_time_eq;

/// Keep only headers on the allowlist. Names compare case-insensitively;
/// output keys are lowercased.
pub fn filter_headers(
    headers: &HashMap<String, String>,
    allowlist: &[String],
) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let lower = name.to_ascii_lowercase();
            if allowlist.iter().any(|a| a.eq_ignore_ascii_case(&lower)) {
                Some((lower, value.clone()))
            } else {
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_is_case_insensitive_and_lowercases() {
        let mut headers = HashMap::new();
        headers.insert("Accept-Language".to_string(), "en".to_string());
        headers.insert("X-Secret".to_string(), "nope".to_string());

        let allow = vec!["accept-language".to_string()];
        let filtered = filter_headers(&headers, &allow);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered.get("accept-language"), Some(&"en".to_string()));
    }
}
