// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::error::Error;

/// On-disk format version of a sorted table file set
///
/// Every statistics field is gated by a version flag; reading an older
/// table substitutes sentinels for the fields its version did not track.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct FormatVersion([u8; 2]);

impl FormatVersion {
    /// Baseline: size/count histograms and the replay position
    pub const WA: Self = Self(*b"wa");

    /// Adds min/max timestamps, compression ratio and the partitioner id
    pub const WB: Self = Self(*b"wb");

    /// Adds ancestor generations and the tombstone drop-time histogram
    pub const WC: Self = Self(*b"wc");

    /// The version newly written tables carry
    pub const CURRENT: Self = Self::WC;

    /// Parses a version token, rejecting unknown ones.
    pub fn parse(bytes: [u8; 2]) -> crate::Result<Self> {
        let version = Self(bytes);

        if version == Self::WA || version == Self::WB || version == Self::WC {
            Ok(version)
        } else {
            Err(Error::InvalidVersion(bytes))
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> [u8; 2] {
        self.0
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("??")
    }

    #[must_use]
    pub fn has_replay_position(&self) -> bool {
        *self >= Self::WA
    }

    #[must_use]
    pub fn tracks_timestamps(&self) -> bool {
        *self >= Self::WB
    }

    #[must_use]
    pub fn has_compression_ratio(&self) -> bool {
        *self >= Self::WB
    }

    #[must_use]
    pub fn has_partitioner(&self) -> bool {
        *self >= Self::WB
    }

    #[must_use]
    pub fn has_ancestors(&self) -> bool {
        *self >= Self::WC
    }

    #[must_use]
    pub fn has_tombstone_histogram(&self) -> bool {
        *self >= Self::WC
    }
}

impl std::fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn version_ordering() {
        assert!(FormatVersion::WA < FormatVersion::WB);
        assert!(FormatVersion::WB < FormatVersion::WC);
        assert_eq!(FormatVersion::CURRENT, FormatVersion::WC);
    }

    #[test]
    fn version_flags() {
        assert!(FormatVersion::WA.has_replay_position());
        assert!(!FormatVersion::WA.tracks_timestamps());
        assert!(!FormatVersion::WA.has_tombstone_histogram());

        assert!(FormatVersion::WB.tracks_timestamps());
        assert!(FormatVersion::WB.has_partitioner());
        assert!(!FormatVersion::WB.has_ancestors());

        assert!(FormatVersion::WC.has_ancestors());
        assert!(FormatVersion::WC.has_tombstone_histogram());
    }

    #[test]
    fn version_parse_rejects_unknown() {
        assert!(FormatVersion::parse(*b"wa").is_ok());
        assert!(FormatVersion::parse(*b"zz").is_err());
    }
}
