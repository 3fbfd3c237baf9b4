// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Serde helpers for HeaderMap (de)serialization.
//!
//! Recording files store headers as a JSON object keyed by header name.
//! Single-valued headers serialize as a bare string, multi-valued headers
//! as an array of strings; both forms are accepted when loading.

use hyper::header::{HeaderName, HeaderValue};
use hyper::HeaderMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;

pub fn serialize_headers<S>(hm: &HeaderMap, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    // BTreeMap keeps recordings diffable across runs.
    let mut map: BTreeMap<String, Value> = BTreeMap::new();
    for name in hm.keys() {
        let values: Vec<String> = hm
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok().map(str::to_string))
            .collect();
        match values.len() {
            0 => continue,
            1 => {
                map.insert(name.as_str().to_string(), Value::String(values[0].clone()));
            }
            _ => {
                map.insert(
                    name.as_str().to_string(),
                    Value::Array(values.into_iter().map(Value::String).collect()),
                );
            }
        }
    }
    map.serialize(serializer)
}

pub fn deserialize_headers<'de, D>(deserializer: D) -> Result<HeaderMap, D::Error>
where
    D: Deserializer<'de>,
{
    let map = BTreeMap::<String, Value>::deserialize(deserializer)?;
    let mut hm = HeaderMap::new();
    for (k, v) in map {
        let name = k
            .parse::<HeaderName>()
            .map_err(serde::de::Error::custom)?;
        match v {
            Value::String(s) => {
                let val = s.parse::<HeaderValue>().map_err(serde::de::Error::custom)?;
                hm.append(name, val);
            }
            Value::Array(items) => {
                for item in items {
                    let s = item
                        .as_str()
                        .ok_or_else(|| serde::de::Error::custom("header value must be a string"))?;
                    let val = s.parse::<HeaderValue>().map_err(serde::de::Error::custom)?;
                    hm.append(name.clone(), val);
                }
            }
            _ => {
                return Err(serde::de::Error::custom(
                    "header value must be a string or array of strings",
                ))
            }
        }
    }
    Ok(hm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Wrapper {
        #[serde(
            serialize_with = "serialize_headers",
            deserialize_with = "deserialize_headers"
        )]
        headers: HeaderMap,
    }

    #[test]
    fn single_value_serializes_as_string() -> anyhow::Result<()> {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/json".parse()?);
        let s = serde_json::to_string(&Wrapper { headers })?;
        let v: serde_json::Value = serde_json::from_str(&s)?;
        assert_eq!(v["headers"]["content-type"], "application/json");
        Ok(())
    }

    #[test]
    fn multi_value_round_trips_as_array() -> anyhow::Result<()> {
        let mut headers = HeaderMap::new();
        headers.append("set-cookie", "a=1".parse()?);
        headers.append("set-cookie", "b=2".parse()?);
        let s = serde_json::to_string(&Wrapper { headers })?;
        let v: serde_json::Value = serde_json::from_str(&s)?;
        assert!(v["headers"]["set-cookie"].is_array());

        let back: Wrapper = serde_json::from_str(&s)?;
        let values: Vec<_> = back.headers.get_all("set-cookie").iter().collect();
        assert_eq!(values.len(), 2);
        Ok(())
    }

    #[test]
    fn bare_string_form_is_accepted_on_load() -> anyhow::Result<()> {
        let back: Wrapper = serde_json::from_str(r#"{"headers":{"Accept":"*/*"}}"#)?;
        assert_eq!(
            back.headers.get("accept").and_then(|v| v.to_str().ok()),
            Some("*/*")
        );
        Ok(())
    }

    #[test]
    fn non_string_header_value_is_rejected() {
        let result: Result<Wrapper, _> = serde_json::from_str(r#"{"headers":{"x-n":5}}"#);
        assert!(result.is_err());
    }
}
