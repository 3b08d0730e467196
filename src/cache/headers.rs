//! Header metadata stored alongside cache entries.
//!
//! Entries carry an HTTP-style multimap of header names to value lists.
//! Names are canonicalised (`Content-Type`, `Last-Modified`) so lookups are
//! effectively case-insensitive and the serialised form is stable.

use std::collections::BTreeMap;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

/// HTTP-style headers persisted with a cache entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(BTreeMap<String, Vec<String>>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonicalise a header name: each hyphen-separated segment is
    /// capitalised (`content-type` -> `Content-Type`).
    fn canonical(name: &str) -> String {
        name.split('-')
            .map(|seg| {
                let mut chars = seg.chars();
                match chars.next() {
                    Some(first) => {
                        first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
                    }
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join("-")
    }

    /// First value for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .get(&Self::canonical(name))
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// All values for `name`.
    pub fn get_all(&self, name: &str) -> &[String] {
        self.0
            .get(&Self::canonical(name))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Replace all values for `name` with a single value.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.0.insert(Self::canonical(name), vec![value.into()]);
    }

    /// Append a value for `name`.
    pub fn add(&mut self, name: &str, value: impl Into<String>) {
        self.0
            .entry(Self::canonical(name))
            .or_default()
            .push(value.into());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(&Self::canonical(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Capture all headers from an HTTP header map.
    pub fn from_http(map: &HeaderMap) -> Self {
        let mut headers = Self::new();
        for (name, value) in map {
            if let Ok(value) = value.to_str() {
                headers.add(name.as_str(), value);
            }
        }
        headers
    }

    /// Convert into an HTTP header map, skipping values that are not valid
    /// header values.
    pub fn to_http(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, values) in &self.0 {
            let Ok(name) = name.parse::<HeaderName>() else {
                continue;
            };
            for value in values {
                if let Ok(value) = HeaderValue::from_str(value) {
                    map.append(name.clone(), value);
                }
            }
        }
        map
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (name, value) in iter {
            headers.add(&name, value);
        }
        headers
    }
}

/// The current time formatted as an HTTP date (`Last-Modified` format).
pub fn http_date_now() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_is_case_insensitive() {
        let mut headers = Headers::new();
        headers.set("content-type", "text/plain");
        assert_eq!(headers.get("Content-Type"), Some("text/plain"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("text/plain"));
    }

    #[test]
    fn add_appends_values() {
        let mut headers = Headers::new();
        headers.add("Accept", "a");
        headers.add("accept", "b");
        assert_eq!(headers.get_all("Accept"), &["a", "b"]);
    }

    #[test]
    fn set_replaces_values() {
        let mut headers = Headers::new();
        headers.add("X-Test", "a");
        headers.set("x-test", "b");
        assert_eq!(headers.get_all("X-Test"), &["b"]);
    }

    #[test]
    fn http_round_trip() {
        let mut map = HeaderMap::new();
        map.insert("content-type", HeaderValue::from_static("application/zstd"));
        let headers = Headers::from_http(&map);
        assert_eq!(headers.get("Content-Type"), Some("application/zstd"));

        let back = headers.to_http();
        assert_eq!(back.get("content-type").unwrap(), "application/zstd");
    }

    #[test]
    fn serde_round_trip() {
        let mut headers = Headers::new();
        headers.set("Content-Type", "application/x-git-bundle");
        headers.add("X-Multi", "1");
        headers.add("X-Multi", "2");

        let encoded = serde_json::to_string(&headers).unwrap();
        let decoded: Headers = serde_json::from_str(&encoded).unwrap();
        assert_eq!(headers, decoded);
    }
}
