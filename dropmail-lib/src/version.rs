use serde::{Deserialize, Serialize};
use std::fmt::{self, Formatter};

/// format version number of the published documents
///
/// this is carried in every RTS payload and in every mailsite so a peer
/// running a newer implementation can tell what it is reading. It is
/// serialized as a plain JSON number.
///
/// Versions will be listed here overtime. Decoding checks the remote's
/// version against [`Version::MIN`] and [`Version::MAX`]. See
/// [`is_supported`].
///
/// [`is_supported`]: Version::is_supported
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(u8);

impl Version {
    /// version 1:
    ///
    /// RSA-OAEP wrapped AES-256-CBC drops, JSON payloads
    pub const V1: Self = Self(0x01);

    /// get the minimal supported version supported by this implementation
    pub const MIN: Self = Self::V1;

    /// get the current version implemented by this implementation
    pub const CURRENT: Self = Self::V1;

    /// get the maximal supported version supported by this implementation
    pub const MAX: Self = Self::CURRENT;

    /// returns if the version is currently supported or not
    ///
    /// ```
    /// # use dropmail_lib::Version;
    /// assert!(
    ///   Version::CURRENT.is_supported() ==
    ///   (Version::CURRENT >= Version::MIN && Version::CURRENT <= Version::MAX)
    /// );
    /// ```
    #[inline]
    pub fn is_supported(self) -> bool {
        Self::MIN <= self && self <= Self::MAX
    }

    #[inline]
    pub const fn from_u8(version: u8) -> Self {
        Self(version)
    }

    #[inline]
    pub const fn to_u8(self) -> u8 {
        self.0
    }
}

impl Default for Version {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
