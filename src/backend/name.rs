//! Validated instance names shared by every backend.

use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

use thiserror::Error;
use uuid::Uuid;

const MAX_LEN: usize = 63;

/// Name of an instance, valid for both LXD and Multipass.
///
/// Names are 1 to 63 characters of lowercase ASCII letters, digits and `-`,
/// start with a letter and do not end with `-`.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct InstanceName(String);

/// Reasons a candidate instance name is rejected.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum InstanceNameError {
    /// The candidate was empty.
    #[error("instance name must not be empty")]
    Empty,
    /// The candidate exceeded the length limit.
    #[error("instance name {0:?} is longer than 63 characters")]
    TooLong(String),
    /// The candidate did not start with a letter.
    #[error("instance name {0:?} must start with a lowercase letter")]
    BadStart(String),
    /// The candidate ended with a hyphen.
    #[error("instance name {0:?} must not end with '-'")]
    TrailingHyphen(String),
    /// The candidate contained a disallowed character.
    #[error("instance name {name:?} contains invalid character {found:?}")]
    InvalidCharacter {
        /// Rejected name.
        name: String,
        /// First offending character.
        found: char,
    },
}

impl InstanceName {
    /// Validates and wraps `value`.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceNameError`] describing the first rule `value`
    /// breaks.
    pub fn parse(value: impl Into<String>) -> Result<Self, InstanceNameError> {
        let value = value.into();
        let Some(first) = value.chars().next() else {
            return Err(InstanceNameError::Empty);
        };
        if value.len() > MAX_LEN {
            return Err(InstanceNameError::TooLong(value));
        }
        if !first.is_ascii_lowercase() {
            return Err(InstanceNameError::BadStart(value));
        }
        if let Some(found) = value
            .chars()
            .find(|ch| !(ch.is_ascii_lowercase() || ch.is_ascii_digit() || *ch == '-'))
        {
            return Err(InstanceNameError::InvalidCharacter { name: value, found });
        }
        if value.ends_with('-') {
            return Err(InstanceNameError::TrailingHyphen(value));
        }
        Ok(Self(value))
    }

    /// Generates a unique name of the form `<prefix>-<12 hex digits>`.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceNameError`] when `prefix` itself would produce an
    /// invalid name.
    pub fn generate(prefix: &str) -> Result<Self, InstanceNameError> {
        let simple = Uuid::new_v4().simple().to_string();
        let suffix = simple.get(..12).unwrap_or(simple.as_str());
        Self::parse(format!("{prefix}-{suffix}"))
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub const fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl FromStr for InstanceName {
    type Err = InstanceNameError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl AsRef<str> for InstanceName {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Deref for InstanceName {
    type Target = str;
    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

impl fmt::Display for InstanceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("a")]
    #[case("kiln-build-01")]
    #[case("x9")]
    fn accepts_valid_names(#[case] value: &str) {
        let name = InstanceName::parse(value).expect("valid name");
        assert_eq!(name.as_str(), value);
    }

    #[rstest]
    #[case("", InstanceNameError::Empty)]
    #[case("9lives", InstanceNameError::BadStart("9lives".to_owned()))]
    #[case("build-", InstanceNameError::TrailingHyphen("build-".to_owned()))]
    #[case(
        "Build",
        InstanceNameError::BadStart("Build".to_owned())
    )]
    #[case(
        "build_1",
        InstanceNameError::InvalidCharacter { name: "build_1".to_owned(), found: '_' }
    )]
    fn rejects_invalid_names(#[case] value: &str, #[case] expected: InstanceNameError) {
        assert_eq!(InstanceName::parse(value), Err(expected));
    }

    #[rstest]
    fn rejects_overlong_names() {
        let value = "a".repeat(64);
        assert!(matches!(
            InstanceName::parse(value),
            Err(InstanceNameError::TooLong(_))
        ));
    }

    #[rstest]
    fn generated_names_are_unique_and_prefixed() {
        let first = InstanceName::generate("kiln").expect("first name");
        let second = InstanceName::generate("kiln").expect("second name");

        assert!(first.starts_with("kiln-"));
        assert_eq!(first.len(), "kiln-".len() + 12);
        assert_ne!(first, second);
    }
}
