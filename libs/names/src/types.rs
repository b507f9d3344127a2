//! Typed name and ID definitions.

use crate::{define_id, define_name, NameError};

/// Maximum length of a DNS-1123 subdomain (object names).
pub const MAX_SUBDOMAIN_LEN: usize = 253;

/// Maximum length of a DNS-1123 label (namespaces, member names).
pub const MAX_LABEL_LEN: usize = 63;

/// Validates `s` against DNS-1123 rules.
///
/// Lowercase alphanumerics and `-` are always allowed; `.` only when
/// `allow_dots` is set (subdomain form). The first and last character must
/// be alphanumeric.
pub fn validate_dns1123(
    kind: &'static str,
    s: &str,
    max_len: usize,
    allow_dots: bool,
) -> Result<(), NameError> {
    if s.is_empty() {
        return Err(NameError::Empty);
    }
    if s.len() > max_len {
        return Err(NameError::TooLong {
            kind,
            max: max_len,
            actual: s.len(),
        });
    }

    for (position, c) in s.chars().enumerate() {
        let ok = c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || (allow_dots && c == '.');
        if !ok {
            return Err(NameError::InvalidCharacter {
                kind,
                found: c,
                position,
            });
        }
    }

    let is_alnum = |c: Option<char>| c.is_some_and(|c| c.is_ascii_alphanumeric());
    if !is_alnum(s.chars().next()) || !is_alnum(s.chars().last()) {
        return Err(NameError::InvalidBoundary { kind });
    }

    Ok(())
}

// =============================================================================
// Object names
// =============================================================================

define_name!(DeclarationName, "declaration");

// =============================================================================
// Attempt IDs
// =============================================================================

define_id!(AttemptId, "att");

// =============================================================================
// Member identity
// =============================================================================

/// Identity of a member cluster: `namespace/name`.
///
/// Ordering is by namespace, then name. Status lists are sorted with this
/// ordering.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemberId {
    namespace: String,
    name: String,
}

impl MemberId {
    /// Kind used in validation errors.
    pub const KIND: &'static str = "member";

    /// Creates a member ID from its two parts.
    pub fn new(namespace: &str, name: &str) -> Result<Self, NameError> {
        validate_dns1123("member namespace", namespace, MAX_LABEL_LEN, false)?;
        validate_dns1123(Self::KIND, name, MAX_LABEL_LEN, false)?;
        Ok(Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }

    /// Parses `namespace/name`.
    pub fn parse(s: &str) -> Result<Self, NameError> {
        if s.is_empty() {
            return Err(NameError::Empty);
        }
        let Some((namespace, name)) = s.split_once('/') else {
            return Err(NameError::MissingSeparator(s.to_string()));
        };
        Self::new(namespace, name)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Display for MemberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl std::str::FromStr for MemberId {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for MemberId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for MemberId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================
