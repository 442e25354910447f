//! The `scheme://path` address every location is identified by.

use crate::error::DerivationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A parsed location address.
///
/// The raw string is kept verbatim; the accessors only slice it.
///
/// ```rust
/// use edgequake_derivatives::LocationUri;
///
/// let uri = LocationUri::parse("s3://scans.s3.us-east-1.amazonaws.com/box/a.tiff").unwrap();
/// assert_eq!(uri.scheme(), "s3");
/// assert_eq!(uri.file_name(), "a.tiff");
/// assert_eq!(uri.extension(), ".tiff");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LocationUri {
    raw: String,
    scheme_end: usize,
}

impl LocationUri {
    /// Parse a raw URI. Fails when there is no valid `scheme://` prefix.
    pub fn parse(raw: impl Into<String>) -> Result<Self, DerivationError> {
        let raw = raw.into();
        match Self::split_scheme(&raw) {
            Some((scheme, _)) => {
                let scheme_end = scheme.len();
                Ok(Self { raw, scheme_end })
            }
            None => Err(DerivationError::MissingScheme { uri: raw }),
        }
    }

    /// Split `scheme://rest` into its two halves.
    ///
    /// The scheme must be non-empty and made of ASCII letters, digits, `+`,
    /// `-` or `.`.
    pub fn split_scheme(raw: &str) -> Option<(&str, &str)> {
        let (scheme, rest) = raw.split_once("://")?;
        let valid = !scheme.is_empty()
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
        valid.then_some((scheme, rest))
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn scheme(&self) -> &str {
        &self.raw[..self.scheme_end]
    }

    /// Everything after `scheme://`, query included.
    pub fn rest(&self) -> &str {
        &self.raw[self.scheme_end + 3..]
    }

    /// Everything after `scheme://` with the query removed.
    pub fn path(&self) -> &str {
        let rest = self.rest();
        rest.split_once('?').map_or(rest, |(p, _)| p)
    }

    /// The raw query string, without the `?`.
    pub fn query(&self) -> Option<&str> {
        self.rest().split_once('?').map(|(_, q)| q)
    }

    /// The path up to (not including) the last `/`.
    pub fn directory(&self) -> &str {
        let path = self.path();
        path.rfind('/').map_or("", |i| &path[..i])
    }

    pub fn file_name(&self) -> &str {
        let path = self.path();
        path.rfind('/').map_or(path, |i| &path[i + 1..])
    }

    /// The file name minus its last extension.
    pub fn base_name(&self) -> &str {
        split_extension(self.file_name()).0
    }

    /// The last extension including its dot, or `""`.
    pub fn extension(&self) -> &str {
        split_extension(self.file_name()).1
    }
}

/// Split a file name at its last extension.
///
/// Leading-dot names (`.profile`) and trailing dots have no extension.
pub(crate) fn split_extension(file_name: &str) -> (&str, &str) {
    match file_name.rfind('.') {
        Some(i) if i > 0 && i + 1 < file_name.len() => (&file_name[..i], &file_name[i..]),
        _ => (file_name, ""),
    }
}

impl fmt::Display for LocationUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for LocationUri {
    type Err = DerivationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for LocationUri {
    type Error = DerivationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl From<LocationUri> for String {
    fn from(uri: LocationUri) -> Self {
        uri.raw
    }
}

impl AsRef<str> for LocationUri {
    fn as_ref(&self) -> &str {
        &self.raw
    }
}
