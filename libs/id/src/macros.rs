//! Macros for defining typed ID types.

/// Macro to define an opaque, master-assigned ID.
///
/// This generates a newtype wrapper around `String` with:
/// - A `KIND` constant used in error messages
/// - `new()` that validates the value
/// - `as_str()` for borrowing the raw value
/// - `Display` and `FromStr` implementations
/// - `Serialize` and `Deserialize` implementations (as a bare string)
/// - `Ord`, `Hash`, and other standard traits
///
/// # Example
///
/// ```ignore
/// define_id!(OfferId, "offer ID");
///
/// let id = OfferId::new("5b1c-O42")?;
/// let parsed: OfferId = "5b1c-O42".parse()?;
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident, $kind:literal) => {
        /// An opaque identifier assigned by the resource manager.
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            /// Human-readable kind of this ID.
            pub const KIND: &'static str = $kind;

            /// Creates an ID, rejecting empty values and embedded whitespace.
            pub fn new(value: impl Into<String>) -> Result<Self, $crate::IdError> {
                let value = value.into();
                if value.is_empty() {
                    return Err($crate::IdError::Empty);
                }
                if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
                    return Err($crate::IdError::InvalidCharacters {
                        kind: Self::KIND,
                        value,
                    });
                }
                Ok(Self(value))
            }

            /// Parses an ID from a string.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                Self::new(s)
            }

            /// Returns the raw value.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consumes the ID and returns the raw value.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
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
                Self::new(s).map_err(serde::de::Error::custom)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}
