//! Macros for defining typed IDs and validated names.

/// Maximum length of an operator-chosen name.
pub const MAX_NAME_LEN: usize = 63;

/// Validate an operator-chosen name.
///
/// Names must be non-empty, at most [`MAX_NAME_LEN`] characters, start with
/// a lowercase letter or digit, and only contain `[a-z0-9._-]`.
pub fn validate_name(kind: &'static str, name: &str) -> Result<(), crate::IdError> {
    if name.is_empty() {
        return Err(crate::IdError::Empty);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(crate::IdError::NameTooLong {
            kind,
            name: name.to_string(),
            max: MAX_NAME_LEN,
        });
    }
    for (i, c) in name.chars().enumerate() {
        let allowed = c.is_ascii_lowercase()
            || c.is_ascii_digit()
            || (i > 0 && matches!(c, '.' | '_' | '-'));
        if !allowed {
            return Err(crate::IdError::InvalidNameCharacter {
                kind,
                name: name.to_string(),
                character: c,
            });
        }
    }
    Ok(())
}

/// Macro to define a generated ID with a specific prefix.
///
/// This generates a `Copy` newtype wrapper around ULID with:
/// - A `PREFIX` constant
/// - `new()` to generate a fresh ID
/// - `parse()` to parse from `{prefix}_{ulid}`
/// - `Display`, `FromStr`, `Serialize` and `Deserialize`
///
/// # Example
///
/// ```ignore
/// define_id!(FleetInstanceId, "fleet");
///
/// let id = FleetInstanceId::new();
/// let parsed: FleetInstanceId = "fleet_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse()?;
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident, $prefix:literal) => {
        /// A generated ULID-backed identifier.
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

            /// Creates an ID from a raw ULID.
            #[must_use]
            pub const fn from_ulid(ulid: $crate::Ulid) -> Self {
                Self(ulid)
            }

            /// Returns the underlying ULID.
            #[must_use]
            pub const fn ulid(&self) -> $crate::Ulid {
                self.0
            }

            /// Lowercase ULID text without the prefix, suitable for
            /// embedding in DNS-style names.
            #[must_use]
            pub fn short(&self) -> String {
                self.0.to_string().to_ascii_lowercase()
            }

            /// Parses an ID from `{prefix}_{ulid}`.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                if s.is_empty() {
                    return Err($crate::IdError::Empty);
                }

                let Some((prefix, ulid_str)) = s.split_once('_') else {
                    return Err($crate::IdError::MissingSeparator);
                };

                if prefix != Self::PREFIX {
                    return Err($crate::IdError::InvalidPrefix {
                        expected: Self::PREFIX,
                        actual: prefix.to_string(),
                    });
                }

                let ulid = ulid_str
                    .parse::<$crate::Ulid>()
                    .map_err(|e| $crate::IdError::InvalidUlid(e.to_string()))?;

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
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.collect_str(self)
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
    };
}

/// Macro to define a validated, operator-chosen name.
///
/// Names are `String` newtypes checked by [`validate_name`]. They implement
/// `Borrow<str>` so maps keyed by a name can be queried with a `&str`.
#[macro_export]
macro_rules! define_name {
    ($name:ident, $kind:literal) => {
        /// A validated operator-chosen name.
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            /// Human-readable kind used in error messages.
            pub const KIND: &'static str = $kind;

            /// Parses and validates a name.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                $crate::validate_name(Self::KIND, s)?;
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
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
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
    };
}
