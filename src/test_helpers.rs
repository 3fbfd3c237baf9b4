// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Shared test utilities to reduce duplication across test modules.

use crate::record_entry::{RecordEntry, RequestInfo, ResponseInfo};
use bytes::Bytes;
use hyper::HeaderMap;

/// Build a HeaderMap from name/value pairs, appending duplicates.
pub fn make_headers_from_pairs(pairs: &[(&str, &str)]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        let name: hyper::header::HeaderName = name.parse().expect("valid test header name");
        let value: hyper::header::HeaderValue = value.parse().expect("valid test header value");
        headers.append(name, value);
    }
    headers
}

/// Minimal entry skeleton for matcher and serialization tests.
pub fn make_entry(method: &str, uri: &str, status: u16) -> RecordEntry {
    RecordEntry {
        request: RequestInfo {
            method: method.to_string(),
            uri: uri.to_string(),
            headers: HeaderMap::new(),
            body: None,
        },
        response: ResponseInfo {
            status,
            headers: HeaderMap::new(),
            body: None,
        },
    }
}

/// Incoming-request skeleton with headers and an optional body.
pub fn make_request(
    method: &str,
    uri: &str,
    header_pairs: &[(&str, &str)],
    body: Option<&[u8]>,
) -> RequestInfo {
    RequestInfo {
        method: method.to_string(),
        uri: uri.to_string(),
        headers: make_headers_from_pairs(header_pairs),
        body: body.map(|b| Bytes::from(b.to_vec())),
    }
}
