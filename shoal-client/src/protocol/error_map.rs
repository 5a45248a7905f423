//! Server error map: a JSON catalogue of status codes with attributes,
//! downloaded once per session after HELLO. Statuses outside the static
//! [`super::Status`] set are looked up here; a `retry-later` attribute
//! upgrades the failure to a retriable one.

use std::collections::HashMap;

use serde::Deserialize;
use shoal_errors::{ErrorKind, ShoalError, ShoalResult};

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorMapEntry {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub attrs: Vec<String>,
}

impl ErrorMapEntry {
    pub fn has_retry_attribute(&self) -> bool {
        self.attrs
            .iter()
            .any(|attr| attr == "retry-later" || attr == "retry-now" || attr == "auto-retry")
    }

    pub fn is_fetch_config(&self) -> bool {
        self.attrs.iter().any(|attr| attr == "fetch-config")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorMap {
    #[serde(default)]
    pub version: u16,
    #[serde(default)]
    pub revision: u16,
    #[serde(default)]
    errors: HashMap<String, ErrorMapEntry>,
}

impl ErrorMap {
    pub fn parse(raw: &[u8]) -> ShoalResult<ErrorMap> {
        serde_json::from_slice(raw)
            .map_err(|e| ShoalError::with_source(ErrorKind::ParsingFailure, e))
    }

    /// Codes are keyed by lowercase hex without a prefix.
    pub fn entry(&self, code: u16) -> Option<&ErrorMapEntry> {
        self.errors.get(&format!("{code:x}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_hex_code() {
        let map = ErrorMap::parse(
            br#"{
                "version": 2,
                "revision": 1,
                "errors": {
                    "7": {"name": "NOT_MY_VBUCKET", "desc": "...", "attrs": ["fetch-config"]},
                    "86": {"name": "ETMPFAIL", "desc": "...", "attrs": ["temp", "retry-later"]},
                    "d0": {"name": "EXTRAS", "desc": "...", "attrs": ["invalid-input"]}
                }
            }"#,
        )
        .unwrap();

        assert!(map.entry(0x86).unwrap().has_retry_attribute());
        assert!(map.entry(0x07).unwrap().is_fetch_config());
        assert!(!map.entry(0xd0).unwrap().has_retry_attribute());
        assert!(map.entry(0x99).is_none());
    }
}
