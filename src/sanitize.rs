// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Sanitizer pipeline: redacts secrets from captured traffic before it is
//! appended to a record session. Every sanitizer must be idempotent —
//! running the same list twice over an entry is a no-op the second time.

use crate::errors::ProxyError;
use crate::record_entry::{is_json_content_type, update_content_length, RecordEntry};
use bytes::Bytes;
use hyper::header::{HeaderName, HeaderValue};
use hyper::HeaderMap;
use regex::Regex;
use std::collections::BTreeMap;

/// Replacement value used by every built-in sanitizer.
pub const SANITIZED_VALUE: &str = "Sanitized";

pub trait Sanitizer: Send + Sync {
    fn sanitize(&self, entry: &mut RecordEntry);

    /// Hook for session variables recorded at stop time.
    fn sanitize_variables(&self, _variables: &mut BTreeMap<String, String>) {}
}

/// The always-on set: replaces `Authorization` with the sanitized value.
pub fn default_sanitizers() -> Vec<Box<dyn Sanitizer>> {
    vec![Box::new(HeaderSanitizer::new(&["authorization"]))]
}

pub fn apply_all(sanitizers: &[Box<dyn Sanitizer>], entry: &mut RecordEntry) {
    for sanitizer in sanitizers {
        sanitizer.sanitize(entry);
    }
}

// ── HeaderSanitizer ───────────────────────────────────────────────────────

/// Replaces the value of named headers, on both request and response.
pub struct HeaderSanitizer {
    headers: Vec<String>,
    replacement: String,
}

impl HeaderSanitizer {
    pub fn new(headers: &[&str]) -> Self {
        Self {
            headers: headers.iter().map(|h| h.to_ascii_lowercase()).collect(),
            replacement: SANITIZED_VALUE.to_string(),
        }
    }

    pub fn with_replacement(mut self, replacement: &str) -> Self {
        self.replacement = replacement.to_string();
        self
    }

    fn sanitize_headers(&self, headers: &mut HeaderMap) {
        for name in &self.headers {
            if let Ok(name) = name.parse::<HeaderName>() {
                if headers.contains_key(&name) {
                    if let Ok(value) = self.replacement.parse::<HeaderValue>() {
                        headers.insert(name, value);
                    }
                }
            }
        }
    }
}

impl Sanitizer for HeaderSanitizer {
    fn sanitize(&self, entry: &mut RecordEntry) {
        self.sanitize_headers(&mut entry.request.headers);
        self.sanitize_headers(&mut entry.response.headers);
    }
}

// ── GeneralRegexSanitizer ─────────────────────────────────────────────────

/// Regex replacement across URI, header values, and text bodies.
#[derive(Debug)]
pub struct GeneralRegexSanitizer {
    regex: Regex,
    replacement: String,
}

impl GeneralRegexSanitizer {
    pub fn new(pattern: &str, replacement: &str) -> Result<Self, ProxyError> {
        let regex = Regex::new(pattern).map_err(|e| {
            ProxyError::InvalidRequest(format!("expression {pattern:?} does not compile: {e}"))
        })?;
        Ok(Self {
            regex,
            replacement: replacement.to_string(),
        })
    }

    fn replace(&self, text: &str) -> Option<String> {
        if self.regex.is_match(text) {
            Some(self.regex.replace_all(text, self.replacement.as_str()).into_owned())
        } else {
            None
        }
    }

    fn sanitize_headers(&self, headers: &mut HeaderMap) {
        let names: Vec<HeaderName> = headers.keys().cloned().collect();
        for name in names {
            let values: Vec<String> = headers
                .get_all(&name)
                .iter()
                .filter_map(|v| v.to_str().ok().map(str::to_string))
                .collect();
            if !values.iter().any(|v| self.regex.is_match(v)) {
                continue;
            }
            headers.remove(&name);
            for value in values {
                let replaced = self.replace(&value).unwrap_or(value);
                if let Ok(value) = replaced.parse::<HeaderValue>() {
                    headers.append(name.clone(), value);
                }
            }
        }
    }

    fn sanitize_body(&self, headers: &mut HeaderMap, body: &mut Option<Bytes>) {
        let Some(bytes) = body else { return };
        let Ok(text) = std::str::from_utf8(bytes) else {
            return;
        };
        if let Some(replaced) = self.replace(text) {
            let len = replaced.len();
            *body = Some(Bytes::from(replaced));
            update_content_length(headers, len);
        }
    }
}

impl Sanitizer for GeneralRegexSanitizer {
    fn sanitize(&self, entry: &mut RecordEntry) {
        if let Some(replaced) = self.replace(&entry.request.uri) {
            entry.request.uri = replaced;
        }
        self.sanitize_headers(&mut entry.request.headers);
        self.sanitize_headers(&mut entry.response.headers);
        self.sanitize_body(&mut entry.request.headers, &mut entry.request.body);
        self.sanitize_body(&mut entry.response.headers, &mut entry.response.body);
    }

    fn sanitize_variables(&self, variables: &mut BTreeMap<String, String>) {
        for value in variables.values_mut() {
            if let Some(replaced) = self.replace(value) {
                *value = replaced;
            }
        }
    }
}

// ── BodyKeySanitizer ──────────────────────────────────────────────────────

/// Replaces the value at a JSON pointer path in JSON bodies.
pub struct BodyKeySanitizer {
    json_path: String,
    replacement: String,
}

impl BodyKeySanitizer {
    /// `json_path` is a JSON pointer, e.g. `/connectionString`.
    pub fn new(json_path: &str) -> Self {
        Self {
            json_path: json_path.to_string(),
            replacement: SANITIZED_VALUE.to_string(),
        }
    }

    pub fn with_replacement(mut self, replacement: &str) -> Self {
        self.replacement = replacement.to_string();
        self
    }

    fn sanitize_body(&self, headers: &mut HeaderMap, body: &mut Option<Bytes>) {
        if !is_json_content_type(headers) {
            return;
        }
        let Some(bytes) = body else { return };
        let Ok(mut value) = serde_json::from_slice::<serde_json::Value>(bytes) else {
            return;
        };
        let Some(target) = value.pointer_mut(&self.json_path) else {
            return;
        };
        if target.as_str() == Some(self.replacement.as_str()) {
            return;
        }
        *target = serde_json::Value::String(self.replacement.clone());
        if let Ok(compact) = serde_json::to_vec(&value) {
            let len = compact.len();
            *body = Some(Bytes::from(compact));
            update_content_length(headers, len);
        }
    }
}

impl Sanitizer for BodyKeySanitizer {
    fn sanitize(&self, entry: &mut RecordEntry) {
        self.sanitize_body(&mut entry.request.headers, &mut entry.request.body);
        self.sanitize_body(&mut entry.response.headers, &mut entry.response.body);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{make_entry, make_headers_from_pairs};

    fn assert_idempotent(sanitizer: &dyn Sanitizer, entry: &RecordEntry) {
        let mut once = entry.clone();
        sanitizer.sanitize(&mut once);
        let mut twice = once.clone();
        sanitizer.sanitize(&mut twice);
        assert_eq!(once, twice);
    }

    #[test]
    fn default_set_redacts_authorization_on_both_sides() {
        let mut entry = make_entry("GET", "https://example.test/", 200);
        entry.request.headers =
            make_headers_from_pairs(&[("authorization", "Bearer secret"), ("accept", "*/*")]);
        entry.response.headers = make_headers_from_pairs(&[("authorization", "Bearer secret")]);

        apply_all(&default_sanitizers(), &mut entry);

        assert_eq!(
            entry
                .request
                .headers
                .get("authorization")
                .and_then(|v| v.to_str().ok()),
            Some(SANITIZED_VALUE)
        );
        assert_eq!(
            entry
                .response
                .headers
                .get("authorization")
                .and_then(|v| v.to_str().ok()),
            Some(SANITIZED_VALUE)
        );
        assert_eq!(
            entry.request.headers.get("accept").and_then(|v| v.to_str().ok()),
            Some("*/*")
        );
    }

    #[test]
    fn header_sanitizer_is_idempotent_and_skips_absent_headers() {
        let sanitizer = HeaderSanitizer::new(&["x-api-key"]);
        let mut entry = make_entry("GET", "https://example.test/", 200);
        entry.request.headers = make_headers_from_pairs(&[("x-api-key", "k123")]);
        assert_idempotent(&sanitizer, &entry);

        let mut absent = make_entry("GET", "https://example.test/", 200);
        sanitizer.sanitize(&mut absent);
        assert!(absent.request.headers.get("x-api-key").is_none());
    }

    #[test]
    fn regex_sanitizer_covers_uri_headers_and_body() -> anyhow::Result<()> {
        let sanitizer = GeneralRegexSanitizer::new("secret-[a-z0-9]+", SANITIZED_VALUE)?;
        let mut entry = make_entry(
            "GET",
            "https://example.test/items?token=secret-abc123",
            200,
        );
        entry.request.headers = make_headers_from_pairs(&[("x-token", "secret-abc123")]);
        entry.response.headers = make_headers_from_pairs(&[("content-type", "text/plain")]);
        entry.response.body = Some(Bytes::from("the key is secret-abc123 ok"));

        sanitizer.sanitize(&mut entry);

        assert_eq!(
            entry.request.uri,
            format!("https://example.test/items?token={SANITIZED_VALUE}")
        );
        assert_eq!(
            entry.request.headers.get("x-token").and_then(|v| v.to_str().ok()),
            Some(SANITIZED_VALUE)
        );
        assert_eq!(
            entry.response.body.as_deref(),
            Some(format!("the key is {SANITIZED_VALUE} ok").as_bytes())
        );
        assert_idempotent(&sanitizer, &entry);
        Ok(())
    }

    #[test]
    fn regex_sanitizer_rejects_invalid_pattern() {
        let err = GeneralRegexSanitizer::new("(unclosed", "x").expect_err("must not compile");
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn regex_sanitizer_updates_existing_content_length() -> anyhow::Result<()> {
        let sanitizer = GeneralRegexSanitizer::new("supersecretvalue", "short")?;
        let mut entry = make_entry("POST", "https://example.test/", 200);
        entry.request.headers = make_headers_from_pairs(&[
            ("content-type", "text/plain"),
            ("content-length", "16"),
        ]);
        entry.request.body = Some(Bytes::from("supersecretvalue"));

        sanitizer.sanitize(&mut entry);

        assert_eq!(entry.request.body.as_deref(), Some(b"short".as_ref()));
        assert_eq!(
            entry
                .request
                .headers
                .get("content-length")
                .and_then(|v| v.to_str().ok()),
            Some("5")
        );
        Ok(())
    }

    #[test]
    fn body_key_sanitizer_replaces_json_value() {
        let sanitizer = BodyKeySanitizer::new("/credentials/key");
        let mut entry = make_entry("POST", "https://example.test/", 200);
        entry.request.headers = make_headers_from_pairs(&[("content-type", "application/json")]);
        entry.request.body = Some(Bytes::from(
            r#"{"credentials":{"key":"hunter2"},"name":"db"}"#,
        ));

        sanitizer.sanitize(&mut entry);

        let value: serde_json::Value =
            serde_json::from_slice(entry.request.body.as_ref().expect("body")).expect("json");
        assert_eq!(value["credentials"]["key"], SANITIZED_VALUE);
        assert_eq!(value["name"], "db");
        assert_idempotent(&sanitizer, &entry);
    }

    #[test]
    fn body_key_sanitizer_leaves_non_json_bodies_alone() {
        let sanitizer = BodyKeySanitizer::new("/key");
        let mut entry = make_entry("POST", "https://example.test/", 200);
        entry.request.headers = make_headers_from_pairs(&[("content-type", "text/plain")]);
        entry.request.body = Some(Bytes::from(r#"{"key":"hunter2"}"#));
        let before = entry.clone();
        sanitizer.sanitize(&mut entry);
        assert_eq!(entry, before);
    }

    #[test]
    fn variables_pass_through_regex_sanitizer() -> anyhow::Result<()> {
        let sanitizer = GeneralRegexSanitizer::new("secret-[a-z]+", SANITIZED_VALUE)?;
        let mut variables = BTreeMap::new();
        variables.insert("token".to_string(), "secret-alpha".to_string());
        variables.insert("plain".to_string(), "keep-me".to_string());
        sanitizer.sanitize_variables(&mut variables);
        assert_eq!(variables["token"], SANITIZED_VALUE);
        assert_eq!(variables["plain"], "keep-me");
        Ok(())
    }
}
