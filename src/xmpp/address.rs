// Bare address handling
// A bare address is local-part@domain with any resource suffix removed, lower-cased.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::EngineError;

static LOCAL_PART: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^[^@/\s"&'<>:]{1,1023}$"#).expect("valid local-part pattern"));

static DOMAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?(\.[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?)*$")
        .expect("valid domain pattern")
});

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BareAddress {
    full: String,
    at: usize,
}

impl BareAddress {
    /// Parse and normalize an address. Accepts full addresses (`user@host/res`)
    /// and drops the resource.
    pub fn parse(input: &str) -> Result<Self, EngineError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(EngineError::Validation("empty address".to_string()));
        }
        let without_resource = trimmed.split('/').next().unwrap_or(trimmed);
        let (local, domain) = without_resource
            .split_once('@')
            .ok_or_else(|| EngineError::Validation(format!("missing '@' in address '{}'", input)))?;

        let local = local.to_lowercase();
        let domain = domain.trim_end_matches('.').to_lowercase();

        if !LOCAL_PART.is_match(&local) {
            return Err(EngineError::Validation(format!("invalid local part in '{}'", input)));
        }
        if domain.is_empty() || !DOMAIN.is_match(&domain) {
            return Err(EngineError::Validation(format!("invalid domain in '{}'", input)));
        }

        Ok(BareAddress {
            at: local.len(),
            full: format!("{}@{}", local, domain),
        })
    }

    /// Like `parse`, but a bare username gets `default_domain` appended.
    pub fn with_default_domain(input: &str, default_domain: &str) -> Result<Self, EngineError> {
        let trimmed = input.trim();
        if !trimmed.is_empty() && !trimmed.contains('@') {
            return Self::parse(&format!("{}@{}", trimmed, default_domain));
        }
        Self::parse(trimmed)
    }

    pub fn local_part(&self) -> &str {
        &self.full[..self.at]
    }

    pub fn domain(&self) -> &str {
        &self.full[self.at + 1..]
    }

    pub fn as_str(&self) -> &str {
        &self.full
    }
}

impl fmt::Display for BareAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

impl FromStr for BareAddress {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for BareAddress {
    fn as_ref(&self) -> &str {
        &self.full
    }
}

impl Serialize for BareAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.full)
    }
}
