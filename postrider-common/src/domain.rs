//! Domain newtype for type safety
//!
//! Wraps domain strings so email addresses or arbitrary strings cannot be
//! passed where a domain is expected. Domains are normalised to lowercase
//! on construction, so equality and map lookups are case-insensitive.

use std::{
    fmt::{self, Display},
    ops::Deref,
    sync::Arc,
};

use serde::{Deserialize, Serialize};

/// A recipient or sender domain name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Domain(Arc<str>);

impl<'de> Deserialize<'de> for Domain {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Self::new(&s))
    }
}

impl Domain {
    /// Create a new `Domain`, lowercasing and trimming any trailing dot.
    #[must_use]
    pub fn new(s: &str) -> Self {
        let s = s.trim_end_matches('.');
        if s.chars().any(|c| c.is_ascii_uppercase()) {
            Self(Arc::from(s.to_ascii_lowercase()))
        } else {
            Self(Arc::from(s))
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for Domain {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for Domain {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Domain {
    fn from(s: String) -> Self {
        Self::new(&s)
    }
}

impl AsRef<str> for Domain {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
