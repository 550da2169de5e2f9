//! Version comparison
//!
//! Upgrade eligibility and platform compatibility only ever look at the
//! major.minor pair, so that is all this parses.

use crate::error::{Error, Result};

/// Minimum supported platform version
pub const MIN_PLATFORM_VERSION: MajorMinor = MajorMinor { major: 4, minor: 10 };

/// Major.minor pair of a dotted version string
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MajorMinor {
    pub major: u64,
    pub minor: u64,
}

impl MajorMinor {
    /// Parse `v1.2.3`, `1.2`, or `1.2.3-rc.1`; anything past minor is ignored
    pub fn parse(version: &str) -> Result<Self> {
        let trimmed = version.trim().trim_start_matches('v');
        let mut parts = trimmed.split(['.', '-', '+']);

        let major = parse_component(parts.next(), version)?;
        let minor = parse_component(parts.next(), version)?;

        Ok(Self { major, minor })
    }
}

fn parse_component(part: Option<&str>, version: &str) -> Result<u64> {
    part.filter(|p| !p.is_empty())
        .and_then(|p| p.parse::<u64>().ok())
        .ok_or_else(|| Error::VersionParse(format!("could not parse version: {:?}", version)))
}

impl std::fmt::Display for MajorMinor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Whether two versions share major.minor
pub fn same_minor(a: &str, b: &str) -> Result<bool> {
    Ok(MajorMinor::parse(a)? == MajorMinor::parse(b)?)
}

/// Whether the platform version meets the minimum
pub fn platform_supported(platform_version: &str) -> Result<bool> {
    Ok(MajorMinor::parse(platform_version)? >= MIN_PLATFORM_VERSION)
}
