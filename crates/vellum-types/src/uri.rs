use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Address of an independently connectable partition.
///
/// The textual form is `scheme://authority/rawId[?query]`. The scheme selects
/// the authority module, `scheme://authority` names the authority, and the
/// raw id is unique within it. Partition URIs are immutable once parsed.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PartitionUri {
    scheme: String,
    authority: String,
    raw_id: String,
    query: Option<String>,
}

impl PartitionUri {
    /// Build a partition URI from its parts.
    pub fn new(
        scheme: impl Into<String>,
        authority: impl Into<String>,
        raw_id: impl Into<String>,
    ) -> Result<Self, TypeError> {
        let uri = Self {
            scheme: scheme.into(),
            authority: authority.into(),
            raw_id: raw_id.into(),
            query: None,
        };
        uri.validate()?;
        Ok(uri)
    }

    /// Parse the textual `scheme://authority/rawId[?query]` form.
    pub fn parse(s: &str) -> Result<Self, TypeError> {
        let invalid = |reason: &str| TypeError::InvalidUri {
            uri: s.to_string(),
            reason: reason.to_string(),
        };
        let (scheme, rest) = s.split_once("://").ok_or_else(|| invalid("missing '://'"))?;
        let (authority, path) = rest
            .split_once('/')
            .ok_or_else(|| invalid("missing partition raw id"))?;
        let (raw_id, query) = match path.split_once('?') {
            Some((raw_id, query)) => (raw_id, Some(query.to_string())),
            None => (path, None),
        };
        let uri = Self {
            scheme: scheme.to_string(),
            authority: authority.to_string(),
            raw_id: raw_id.to_string(),
            query,
        };
        uri.validate()?;
        Ok(uri)
    }

    fn validate(&self) -> Result<(), TypeError> {
        let invalid = |reason: &str| TypeError::InvalidUri {
            uri: self.to_string(),
            reason: reason.to_string(),
        };
        let mut chars = self.scheme.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() => {}
            _ => return Err(invalid("scheme must start with a letter")),
        }
        if !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')) {
            return Err(invalid("scheme contains invalid characters"));
        }
        if self.authority.contains(['/', '?']) {
            return Err(invalid("authority contains a reserved character"));
        }
        if self.raw_id.is_empty() {
            return Err(invalid("partition raw id is empty"));
        }
        if self.raw_id.contains('?') {
            return Err(invalid("partition raw id contains '?'"));
        }
        Ok(())
    }

    /// Attach a query string (without the leading `?`).
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// The partition id, unique within its authority.
    pub fn raw_id(&self) -> &str {
        &self.raw_id
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// `scheme://authority`, the key authorities are memoized under.
    pub fn authority_uri(&self) -> String {
        format!("{}://{}", self.scheme, self.authority)
    }
}

impl fmt::Display for PartitionUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.authority, self.raw_id)?;
        if let Some(query) = &self.query {
            write!(f, "?{query}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for PartitionUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PartitionUri({self})")
    }
}

impl FromStr for PartitionUri {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PartitionUri {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PartitionUri> for String {
    fn from(uri: PartitionUri) -> Self {
        uri.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_all_parts() {
        let uri = PartitionUri::parse("vellum-memory://example.org/abc123?rev=2").unwrap();
        assert_eq!(uri.scheme(), "vellum-memory");
        assert_eq!(uri.authority(), "example.org");
        assert_eq!(uri.raw_id(), "abc123");
        assert_eq!(uri.query(), Some("rev=2"));
        assert_eq!(uri.authority_uri(), "vellum-memory://example.org");
    }

    #[test]
    fn empty_authority_is_allowed() {
        let uri = PartitionUri::parse("vellum-local:///p1").unwrap();
        assert_eq!(uri.authority(), "");
        assert_eq!(uri.authority_uri(), "vellum-local://");
        assert_eq!(uri.to_string(), "vellum-local:///p1");
    }

    #[test]
    fn rejects_missing_raw_id() {
        assert!(PartitionUri::parse("vellum-memory://host").is_err());
        assert!(PartitionUri::parse("vellum-memory://host/").is_err());
    }

    #[test]
    fn rejects_bad_scheme() {
        assert!(PartitionUri::parse("1abc://host/p").is_err());
        assert!(PartitionUri::parse("a_b://host/p").is_err());
        assert!(PartitionUri::parse("no-separator/p").is_err());
    }

    #[test]
    fn new_validates() {
        assert!(PartitionUri::new("vellum-local", "", "p").is_ok());
        assert!(PartitionUri::new("vellum-local", "", "").is_err());
    }

    #[test]
    fn serde_uses_text_form() {
        let uri = PartitionUri::parse("vellum-memory://h/p?x").unwrap();
        let json = serde_json::to_string(&uri).unwrap();
        assert_eq!(json, "\"vellum-memory://h/p?x\"");
        let back: PartitionUri = serde_json::from_str(&json).unwrap();
        assert_eq!(back, uri);
    }

    proptest! {
        #[test]
        fn display_reparses_to_same_uri(
            scheme in "[a-z][a-z0-9+.-]{0,8}",
            authority in "[a-z0-9.:-]{0,12}",
            raw_id in "[A-Za-z0-9_-]{1,16}",
        ) {
            let uri = PartitionUri::new(scheme, authority, raw_id).unwrap();
            prop_assert_eq!(PartitionUri::parse(&uri.to_string()).unwrap(), uri);
        }
    }
}
