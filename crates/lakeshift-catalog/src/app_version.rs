//! Application versions of the data producer.
//!
//! Every ingested record carries the version of the application that emitted
//! it. Versions are dotted numeric strings (`3`, `1.4`, `2.0.17`, optionally
//! prefixed with `v`) and order component-wise; trailing zero components are
//! insignificant, so `1.2` and `1.2.0` are the same version.
//!
//! Raw records carry the version inside a client-info string, which is either
//! a JSON object (`{"appVersion": 12, "osName": "iOS"}`) or a comma-separated
//! key/value list (`appVersion=12, osName=iOS`). [`ClientInfo::parse`] accepts
//! both.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CatalogError;

/// A dotted numeric application version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AppVersion {
    raw: String,
    components: Vec<u64>,
}

impl AppVersion {
    /// Parses a version string.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::InvalidAppVersion`] for empty input or a
    /// component that is not a non-negative integer.
    pub fn parse(value: &str) -> Result<Self, CatalogError> {
        let invalid = |message: &str| CatalogError::InvalidAppVersion {
            value: value.to_string(),
            message: message.to_string(),
        };

        let trimmed = value.trim();
        let digits = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);
        if digits.is_empty() {
            return Err(invalid("empty version"));
        }

        let components = digits
            .split('.')
            .map(|part| {
                if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(invalid("components must be non-negative integers"));
                }
                part.parse::<u64>()
                    .map_err(|_| invalid("component out of range"))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            raw: trimmed.to_string(),
            components,
        })
    }

    /// Returns the numeric components as written.
    #[must_use]
    pub fn components(&self) -> &[u64] {
        &self.components
    }

    /// Returns the version as originally written (trimmed).
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    fn significant(&self) -> &[u64] {
        let len = self
            .components
            .iter()
            .rposition(|c| *c != 0)
            .map_or(0, |i| i + 1);
        &self.components[..len]
    }
}

impl PartialEq for AppVersion {
    fn eq(&self, other: &Self) -> bool {
        self.significant() == other.significant()
    }
}

impl Eq for AppVersion {}

impl Hash for AppVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.significant().hash(state);
    }
}

impl PartialOrd for AppVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AppVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.significant().cmp(other.significant())
    }
}

impl fmt::Display for AppVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for AppVersion {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for AppVersion {
    type Error = CatalogError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<AppVersion> for String {
    fn from(value: AppVersion) -> Self {
        value.raw
    }
}

/// Producer metadata attached to a raw record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    /// Version of the emitting application.
    pub app_version: AppVersion,
    /// Operating system, if reported.
    pub os_name: Option<String>,
    /// Application name, if reported.
    pub app_name: Option<String>,
}

impl ClientInfo {
    /// Parses a client-info string.
    ///
    /// A JSON object is read by key; anything else is scanned for
    /// `appVersion=`, `osName=` and `appName=` entries, each running up to
    /// the next comma. JSON version values may be numbers or strings.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::InvalidAppVersion`] when no app version is
    /// present or it does not parse.
    pub fn parse(raw: &str) -> Result<Self, CatalogError> {
        let missing = || CatalogError::InvalidAppVersion {
            value: raw.to_string(),
            message: "client info has no appVersion".to_string(),
        };

        let parsed = serde_json::from_str::<serde_json::Value>(raw);
        if let Ok(serde_json::Value::Object(fields)) = parsed {
            let text = |key: &str| fields.get(key).and_then(json_text);
            let version = text("appVersion").ok_or_else(missing)?;
            return Ok(Self {
                app_version: AppVersion::parse(&version)?,
                os_name: text("osName"),
                app_name: text("appName"),
            });
        }

        let version = key_value(raw, "appVersion").ok_or_else(missing)?;
        Ok(Self {
            app_version: AppVersion::parse(version)?,
            os_name: key_value(raw, "osName").map(str::to_string),
            app_name: key_value(raw, "appName").map(str::to_string),
        })
    }
}

impl AppVersion {
    /// Extracts the app version from a client-info string.
    ///
    /// # Errors
    ///
    /// See [`ClientInfo::parse`].
    pub fn from_client_info(raw: &str) -> Result<Self, CatalogError> {
        ClientInfo::parse(raw).map(|info| info.app_version)
    }
}

fn json_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Value of the first `key=` entry in `raw`, up to the next comma.
fn key_value<'a>(raw: &'a str, key: &str) -> Option<&'a str> {
    let needle = format!("{key}=");
    let start = raw.find(&needle)? + needle.len();
    let rest = &raw[start..];
    let value = rest.split(',').next().unwrap_or(rest).trim();
    (!value.is_empty()).then_some(value)
}
