//! Key-Value Form: newline separated `key:value` pairs in UTF-8.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::error::KvfError;

/// How strictly incoming Key-Value Form is held to the format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyValueFormConformanceLevel {
    /// Trims lines and skips blank ones.
    Loose,
    /// Requires a trailing newline; trims keys and values.
    OpenId11,
    /// Requires a trailing newline and keeps values verbatim.
    #[default]
    OpenId20,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct KeyValueFormEncoding {
    conformance: KeyValueFormConformanceLevel,
}

impl KeyValueFormEncoding {
    pub fn new(conformance: KeyValueFormConformanceLevel) -> Self {
        Self { conformance }
    }

    pub fn conformance(&self) -> KeyValueFormConformanceLevel {
        self.conformance
    }

    /// Encodes pairs in the order given. Signatures depend on that order.
    pub fn encode<K, V, I>(&self, pairs: I) -> Result<Vec<u8>, KvfError>
    where
        K: AsRef<str>,
        V: AsRef<str>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut out = String::new();
        for (key, value) in pairs {
            let key = key.as_ref().trim();
            let value = value.as_ref().trim();
            if key.contains([':', '\n']) {
                return Err(KvfError::IllegalKeyCharacter(key.to_string()));
            }
            if value.contains('\n') {
                return Err(KvfError::IllegalValueCharacter(key.to_string()));
            }
            out.push_str(key);
            out.push(':');
            out.push_str(value);
            out.push('\n');
        }
        Ok(out.into_bytes())
    }

    pub fn decode(&self, data: &[u8]) -> Result<BTreeMap<String, String>, KvfError> {
        let text = std::str::from_utf8(data).map_err(|_| KvfError::InvalidUtf8)?;
        let mut fields = BTreeMap::new();

        for (i, raw) in text.lines().enumerate() {
            let line_number = i + 1;
            let line = if self.conformance == KeyValueFormConformanceLevel::Loose {
                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    continue;
                }
                trimmed
            } else {
                raw
            };

            let (mut key, mut value) = line
                .split_once(':')
                .ok_or(KvfError::MissingSeparator { line: line_number })?;

            if self.conformance > KeyValueFormConformanceLevel::Loose
                && (key.ends_with(char::is_whitespace) || value.starts_with(char::is_whitespace))
            {
                return Err(KvfError::WhitespaceAroundSeparator { line: line_number });
            }
            if self.conformance < KeyValueFormConformanceLevel::OpenId20 {
                key = key.trim();
                value = value.trim();
            }

            if fields.insert(key.to_string(), value.to_string()).is_some() {
                return Err(KvfError::DuplicateKey(key.to_string()));
            }
        }

        if self.conformance > KeyValueFormConformanceLevel::Loose && !data.ends_with(b"\n") {
            return Err(KvfError::MissingTrailingNewline);
        }
        Ok(fields)
    }
}
