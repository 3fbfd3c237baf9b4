// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Response transform pipeline: after a playback entry is selected, copy or
//! recompute header values from the live request into the outgoing response.
//! Transforms run in registration order and never touch the request.

use crate::errors::ProxyError;
use crate::record_entry::{RequestInfo, ResponseInfo};
use hyper::header::{HeaderName, HeaderValue};
use regex::Regex;

pub trait ResponseTransform: Send + Sync {
    fn apply(&self, request: &RequestInfo, response: &mut ResponseInfo);
}

/// Process-wide defaults, applied before any session-scoped transforms.
pub fn default_transforms() -> Vec<Box<dyn ResponseTransform>> {
    vec![
        Box::new(StorageRequestIdTransform),
        Box::new(ClientIdTransform),
        Box::new(HeaderTransform::new("Retry-After", "0")),
    ]
}

pub fn apply_all(
    transforms: &[Box<dyn ResponseTransform>],
    request: &RequestInfo,
    response: &mut ResponseInfo,
) {
    for transform in transforms {
        transform.apply(request, response);
    }
}

/// Echo the caller's `x-ms-client-request-id` so replayed responses carry
/// the id the SDK just generated, not the one captured at record time.
pub struct ClientIdTransform;

impl ResponseTransform for ClientIdTransform {
    fn apply(&self, request: &RequestInfo, response: &mut ResponseInfo) {
        if let Some(value) = request.headers.get("x-ms-client-request-id") {
            response
                .headers
                .insert("x-ms-client-request-id", value.clone());
        }
    }
}

/// Storage services echo the client id into `x-ms-request-id`; keep that
/// relationship intact when the recorded response carried the header.
pub struct StorageRequestIdTransform;

impl ResponseTransform for StorageRequestIdTransform {
    fn apply(&self, request: &RequestInfo, response: &mut ResponseInfo) {
        if !response.headers.contains_key("x-ms-request-id") {
            return;
        }
        if let Some(value) = request.headers.get("x-ms-client-request-id") {
            response.headers.insert("x-ms-request-id", value.clone());
        }
    }
}

/// Overwrite a response header with a fixed value. Fires only when the
/// response already carries the header, and — when a condition regex is
/// configured — only when the current value matches it.
#[derive(Debug)]
pub struct HeaderTransform {
    header: HeaderName,
    value: HeaderValue,
    condition: Option<Regex>,
}

impl HeaderTransform {
    pub fn new(header: &str, value: &str) -> Self {
        Self {
            header: header.parse().expect("static header name"),
            value: value.parse().expect("static header value"),
            condition: None,
        }
    }

    /// Fallible constructor for caller-supplied names and values.
    pub fn try_new(header: &str, value: &str) -> Result<Self, ProxyError> {
        Ok(Self {
            header: header
                .parse()
                .map_err(|_| ProxyError::InvalidRequest(format!("invalid header name {header:?}")))?,
            value: value
                .parse()
                .map_err(|_| ProxyError::InvalidRequest(format!("invalid header value {value:?}")))?,
            condition: None,
        })
    }

    pub fn with_condition_regex(mut self, pattern: &str) -> Result<Self, ProxyError> {
        let regex = Regex::new(pattern).map_err(|e| {
            ProxyError::InvalidRequest(format!("expression {pattern:?} does not compile: {e}"))
        })?;
        self.condition = Some(regex);
        Ok(self)
    }
}

impl ResponseTransform for HeaderTransform {
    fn apply(&self, _request: &RequestInfo, response: &mut ResponseInfo) {
        let Some(current) = response.headers.get(&self.header) else {
            return;
        };
        if let Some(condition) = &self.condition {
            let Ok(current) = current.to_str() else { return };
            if !condition.is_match(current) {
                return;
            }
        }
        response.headers.insert(self.header.clone(), self.value.clone());
    }
}
