use serde::Serialize;
use std::fmt;

use toolcrib_protocol::normalize_tag_id;

/// A normalized tag identifier (upper-case alphanumerics, no separators).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct TagId(String);

impl TagId {
    pub fn parse(raw: &str) -> Option<Self> {
        normalize_tag_id(raw).map(TagId)
    }

    /// Hex-encodes a raw UID as returned by a contactless reader.
    pub fn from_uid_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() {
            return None;
        }
        let hex: String = bytes.iter().map(|byte| format!("{:02X}", byte)).collect();
        Self::parse(&hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TagId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
