//! Macros for defining typed names and IDs.

/// Macro to define a validated DNS-1123 name type.
///
/// This generates a newtype wrapper around `String` with:
/// - A `KIND` constant used in error messages
/// - `parse()` enforcing the DNS-1123 subdomain rules
/// - `as_str()`, `Display`, `FromStr`, `Serialize` and `Deserialize`
///
/// # Example
///
/// ```ignore
/// define_name!(DeclarationName, "declaration");
///
/// let name: DeclarationName = "prod-clusters".parse()?;
/// ```
#[macro_export]
macro_rules! define_name {
    ($name:ident, $kind:literal) => {
        /// A validated object name.
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            /// Kind of object this name identifies.
            pub const KIND: &'static str = $kind;

            /// Parses and validates a name.
            pub fn parse(s: &str) -> Result<Self, $crate::NameError> {
                $crate::validate_dns1123(Self::KIND, s, $crate::MAX_SUBDOMAIN_LEN, true)?;
                Ok(Self(s.to_string()))
            }

            /// Returns the name as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::NameError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

/// Macro to define a typed ULID-based ID with a specific prefix.
///
/// IDs render as `{prefix}_{ulid}` and sort by creation time.
#[macro_export]
macro_rules! define_id {
    ($name:ident, $prefix:literal) => {
        /// A typed ID for this resource type.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name($crate::Ulid);

        impl $name {
            /// The prefix for this ID type.
            pub const PREFIX: &'static str = $prefix;

            /// Creates a new ID with a fresh ULID.
            #[must_use]
            pub fn new() -> Self {
                Self($crate::Ulid::new())
            }

            /// Parses an ID from a string.
            ///
            /// The string must be in the format `{prefix}_{ulid}`.
            pub fn parse(s: &str) -> Result<Self, $crate::NameError> {
                if s.is_empty() {
                    return Err($crate::NameError::Empty);
                }

                let (prefix, ulid_str) = s.split_once('_').unwrap_or((s, ""));
                if prefix != Self::PREFIX {
                    return Err($crate::NameError::InvalidPrefix {
                        expected: Self::PREFIX,
                        actual: prefix.to_string(),
                    });
                }

                let ulid = ulid_str
                    .parse::<$crate::Ulid>()
                    .map_err(|e| $crate::NameError::InvalidUlid(e.to_string()))?;

                Ok(Self(ulid))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}_{}", Self::PREFIX, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::NameError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }
    };
}
