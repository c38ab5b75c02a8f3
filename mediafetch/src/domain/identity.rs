//! Identity newtypes for the two sides of a binding.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Error, Result};

/// Longest handle the source platform allows.
pub const MAX_SOURCE_ID_LEN: usize = 30;

macro_rules! identity {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

identity!(
    /// Account on the source content platform.
    SourceId
);

identity!(
    /// Endpoint on the messaging platform that receives deliveries.
    RecipientId
);

impl SourceId {
    /// Parse a handle as a user would type it.
    ///
    /// Handles are case-insensitive on the source platform, so the result is
    /// lowercased: `@Alice` and `alice` name the same account. A leading `@`
    /// is dropped. The rest must be 1 to 30 ASCII letters, digits, `_` or `.`.
    pub fn parse(raw: &str) -> Result<Self> {
        let handle = raw.trim();
        let handle = handle.strip_prefix('@').unwrap_or(handle);
        if handle.is_empty() {
            return Err(Error::validation("source id must not be empty"));
        }
        if handle.len() > MAX_SOURCE_ID_LEN {
            return Err(Error::validation(format!(
                "source id '{handle}' is longer than {MAX_SOURCE_ID_LEN} characters"
            )));
        }
        if !handle
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        {
            return Err(Error::validation(format!(
                "source id '{handle}' may only contain letters, digits, '_' and '.'"
            )));
        }
        Ok(Self(handle.to_ascii_lowercase()))
    }
}

impl RecipientId {
    /// Trimmed, non-empty, without control characters.
    pub fn parse(raw: &str) -> Result<Self> {
        let id = raw.trim();
        if id.is_empty() {
            return Err(Error::validation("recipient id must not be empty"));
        }
        if id.chars().any(char::is_control) {
            return Err(Error::validation("recipient id contains control characters"));
        }
        Ok(Self(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_identity_display_and_serde() {
        let source = SourceId::new("insta_user");
        assert_eq!(source.to_string(), "insta_user");
        assert_eq!(serde_json::to_string(&source).unwrap(), "\"insta_user\"");

        let recipient: RecipientId = serde_json::from_str("\"12345\"").unwrap();
        assert_eq!(recipient.as_str(), "12345");
    }

    #[rstest]
    #[case("alice", "alice")]
    #[case("ALICE", "alice")]
    #[case("  @Alice.B_1 ", "alice.b_1")]
    #[case("a23456789012345678901234567890", "a23456789012345678901234567890")]
    fn test_source_id_parse_normalizes(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(SourceId::parse(raw).unwrap().as_str(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("   ")]
    #[case("@")]
    #[case("a234567890123456789012345678901")]
    #[case("alice bob")]
    #[case("alice/../x")]
    #[case("émile")]
    fn test_source_id_parse_rejects(#[case] raw: &str) {
        assert!(matches!(SourceId::parse(raw), Err(Error::Validation(_))));
    }

    #[test]
    fn test_recipient_id_parse() {
        assert_eq!(RecipientId::parse(" 12345 ").unwrap().as_str(), "12345");
        assert!(RecipientId::parse("").is_err());
        assert!(RecipientId::parse("12\n34").is_err());
    }
}
