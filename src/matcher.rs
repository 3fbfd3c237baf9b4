// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Matcher engine: selects which recorded entry answers a playback request.
//!
//! Matching is score based. For every unconsumed entry the matcher counts
//! differences (method, normalized URI, headers, body); the first entry in
//! recorded order with zero differences wins. When nothing matches, the
//! lowest-scoring near miss is rendered into the error message.

use crate::errors::ProxyError;
use crate::record_entry::{RecordEntry, RequestInfo};
use hyper::HeaderMap;
use std::collections::{BTreeMap, HashSet};
use std::fmt::Write;

const VOLATILE_VALUE: &str = "Volatile";

/// Headers removed from both sides before comparison.
const DEFAULT_EXCLUDED_HEADERS: &[&str] = &["request-id", "traceparent"];

/// Headers whose presence is compared but whose values are not.
const DEFAULT_IGNORED_HEADERS: &[&str] = &[
    "authorization",
    "date",
    "x-ms-date",
    "x-ms-client-request-id",
    "x-ms-client-id",
    "user-agent",
    "x-ms-useragent",
    "x-ms-version",
    "if-none-match",
    "origin",
    "referer",
    "content-length",
];

#[derive(Debug, Clone)]
pub struct RecordMatcher {
    compare_bodies: bool,
    compare_headers: bool,
    excluded_headers: HashSet<String>,
    ignored_headers: HashSet<String>,
    excluded_query_params: HashSet<String>,
    allow_reuse: bool,
}

impl Default for RecordMatcher {
    fn default() -> Self {
        Self::default_matcher()
    }
}

impl RecordMatcher {
    /// Compares method, URI, headers (minus the volatile sets), and bodies.
    pub fn default_matcher() -> Self {
        Self {
            compare_bodies: true,
            compare_headers: true,
            excluded_headers: DEFAULT_EXCLUDED_HEADERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ignored_headers: DEFAULT_IGNORED_HEADERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            excluded_query_params: HashSet::new(),
            allow_reuse: false,
        }
    }

    /// Default minus the body predicate.
    pub fn bodiless() -> Self {
        Self {
            compare_bodies: false,
            ..Self::default_matcher()
        }
    }

    /// Default minus the header predicate.
    pub fn headerless() -> Self {
        Self {
            compare_headers: false,
            ..Self::default_matcher()
        }
    }

    /// Default with a caller-supplied body toggle and a comma-separated
    /// exclusion list merged into the default excluded set.
    pub fn custom(compare_bodies: bool, extra_excluded_headers: &str) -> Self {
        let mut matcher = Self::default_matcher();
        matcher.compare_bodies = compare_bodies;
        for name in extra_excluded_headers.split(',') {
            let name = name.trim().to_ascii_lowercase();
            if !name.is_empty() {
                matcher.excluded_headers.insert(name);
            }
        }
        matcher
    }

    /// Query parameters whose values may drift between record and playback.
    pub fn with_excluded_query_params(mut self, params: &str) -> Self {
        for name in params.split(',') {
            let name = name.trim().to_ascii_lowercase();
            if !name.is_empty() {
                self.excluded_query_params.insert(name);
            }
        }
        self
    }

    /// Allow an entry to satisfy more than one playback request.
    pub fn with_allow_reuse(mut self, allow: bool) -> Self {
        self.allow_reuse = allow;
        self
    }

    pub fn allow_reuse(&self) -> bool {
        self.allow_reuse
    }

    /// Select the first unconsumed entry (in recorded order) with no
    /// differences from `request`. Returns the entry index.
    pub fn find_match(
        &self,
        request: &RequestInfo,
        entries: &[RecordEntry],
        consumed: &[bool],
    ) -> Result<usize, ProxyError> {
        let mut best: Option<(usize, u32)> = None;

        for (idx, entry) in entries.iter().enumerate() {
            if consumed.get(idx).copied().unwrap_or(false) {
                continue;
            }

            let score = self.score(request, entry);
            if score == 0 {
                return Ok(idx);
            }
            if best.map(|(_, s)| score < s).unwrap_or(true) {
                best = Some((idx, score));
            }
        }

        Err(ProxyError::NoMatch(self.describe_failure(
            request,
            best.map(|(idx, _)| &entries[idx]),
            entries,
            consumed,
        )))
    }

    fn score(&self, request: &RequestInfo, entry: &RecordEntry) -> u32 {
        let mut score = 0;
        if request.method != entry.request.method {
            score += 1;
        }
        if self.normalize_uri(&request.uri) != self.normalize_uri(&entry.request.uri) {
            score += 1;
        }
        if self.compare_headers {
            score += self.header_differences(&request.headers, &entry.request.headers, None);
        }
        score += self.body_difference(&request.body, &entry.request.body, None);
        score
    }

    /// Replace excluded query parameter values with a fixed placeholder;
    /// everything else (including parameter order) must match exactly.
    fn normalize_uri(&self, uri: &str) -> String {
        let Some((base, query)) = uri.split_once('?') else {
            return uri.to_string();
        };
        let mut parts = Vec::new();
        for pair in query.split('&') {
            if pair.is_empty() {
                continue;
            }
            let (name, _value) = pair.split_once('=').unwrap_or((pair, ""));
            if self
                .excluded_query_params
                .contains(&name.to_ascii_lowercase())
            {
                parts.push(format!("{name}={VOLATILE_VALUE}"));
            } else {
                parts.push(pair.to_string());
            }
        }
        format!("{base}?{}", parts.join("&"))
    }

    fn header_differences(
        &self,
        request: &HeaderMap,
        record: &HeaderMap,
        mut description: Option<&mut String>,
    ) -> u32 {
        let request = to_multimap(request);
        let mut remaining = to_multimap(record);
        let mut difference = 0;

        for (name, request_values) in &request {
            if self.excluded_headers.contains(name) {
                continue;
            }
            match remaining.remove(name) {
                Some(record_values) => {
                    if self.ignored_headers.contains(name) {
                        continue;
                    }
                    if !values_equal(request_values, &record_values) {
                        difference += 1;
                        if let Some(out) = description.as_deref_mut() {
                            let _ = writeln!(
                                out,
                                "    <{name}> values differ, request <{}>, record <{}>",
                                request_values.join(","),
                                record_values.join(",")
                            );
                        }
                    }
                }
                None => {
                    difference += 1;
                    if let Some(out) = description.as_deref_mut() {
                        let _ = writeln!(
                            out,
                            "    <{name}> is absent in record, value <{}>",
                            request_values.join(",")
                        );
                    }
                }
            }
        }

        for (name, record_values) in &remaining {
            if self.excluded_headers.contains(name) {
                continue;
            }
            difference += 1;
            if let Some(out) = description.as_deref_mut() {
                let _ = writeln!(
                    out,
                    "    <{name}> is absent in request, value <{}>",
                    record_values.join(",")
                );
            }
        }

        difference
    }

    fn body_difference(
        &self,
        request: &Option<bytes::Bytes>,
        record: &Option<bytes::Bytes>,
        mut description: Option<&mut String>,
    ) -> u32 {
        if !self.compare_bodies {
            return 0;
        }
        let (request, record) = match (request, record) {
            (None, None) => return 0,
            (None, Some(_)) => {
                if let Some(out) = description.as_deref_mut() {
                    let _ = writeln!(out, "    record has a body but the request does not");
                }
                return 1;
            }
            (Some(_), None) => {
                if let Some(out) = description.as_deref_mut() {
                    let _ = writeln!(out, "    request has a body but the record does not");
                }
                return 1;
            }
            (Some(a), Some(b)) => (a, b),
        };

        if request == record {
            return 0;
        }
        if let Some(out) = description.as_deref_mut() {
            let index = request
                .iter()
                .zip(record.iter())
                .position(|(a, b)| a != b)
                .unwrap_or_else(|| request.len().min(record.len()));
            let _ = writeln!(
                out,
                "    bodies differ at byte {index} (request {} bytes, record {} bytes)",
                request.len(),
                record.len()
            );
        }
        1
    }

    fn describe_failure(
        &self,
        request: &RequestInfo,
        best: Option<&RecordEntry>,
        entries: &[RecordEntry],
        consumed: &[bool],
    ) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Unable to find a record for the request {} {}",
            request.method, request.uri
        );

        let Some(best) = best else {
            let _ = writeln!(out, "No records to match.");
            return out;
        };

        if request.method != best.request.method {
            let _ = writeln!(
                out,
                "Method doesn't match, request <{}> record <{}>",
                request.method, best.request.method
            );
        }
        if self.normalize_uri(&request.uri) != self.normalize_uri(&best.request.uri) {
            let _ = writeln!(out, "Uri doesn't match:");
            let _ = writeln!(out, "    request <{}>", request.uri);
            let _ = writeln!(out, "    record  <{}>", best.request.uri);
        }
        if self.compare_headers {
            let _ = writeln!(out, "Header differences:");
            self.header_differences(&request.headers, &best.request.headers, Some(&mut out));
        }
        let _ = writeln!(out, "Body differences:");
        self.body_difference(&request.body, &best.request.body, Some(&mut out));

        let remaining: Vec<_> = entries
            .iter()
            .enumerate()
            .filter(|(idx, _)| !consumed.get(*idx).copied().unwrap_or(false))
            .collect();
        if !remaining.is_empty() {
            let _ = writeln!(out, "Remaining entries:");
            for (idx, entry) in remaining {
                let _ = writeln!(out, "{idx}: {}", entry.request.uri);
            }
        }
        out
    }
}

fn to_multimap(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for name in headers.keys() {
        let values = headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok().map(str::to_string))
            .collect();
        map.insert(name.as_str().to_string(), values);
    }
    map
}

/// Multi-valued headers compare as sets, not sequences.
fn values_equal(a: &[String], b: &[String]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a: Vec<_> = a.to_vec();
    let mut b: Vec<_> = b.to_vec();
    a.sort();
    b.sort();
    a == b
}
