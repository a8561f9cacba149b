use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies a logical capability on the host by `(kind, name)`.
///
/// On the wire the pair is spread over the `deviceType` and `deviceName`
/// fields; an absent name is the empty string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    /// Device kind, e.g. `camera`.
    #[serde(rename = "deviceType", default)]
    pub kind: String,
    /// Device instance name; empty for singleton devices.
    #[serde(rename = "deviceName", default)]
    pub name: String,
}

impl Address {
    /// Builds an address from its kind and name.
    #[must_use]
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Builds the address of a singleton device (empty name).
    #[must_use]
    pub fn singleton(kind: impl Into<String>) -> Self {
        Self::new(kind, "")
    }
}

impl fmt::Display for Address {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            formatter.write_str(&self.kind)
        } else {
            write!(formatter, "{}.{}", self.kind, self.name)
        }
    }
}
