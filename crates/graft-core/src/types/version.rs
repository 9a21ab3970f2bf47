//! Module versions and version ranges.
//!
//! Versions follow the `major.minor.micro.qualifier` scheme used by bundle
//! manifests: missing numeric components default to zero and an empty
//! qualifier sorts before any non-empty one. Ranges use interval notation
//! (`[1.0,2.0)`), a bare version meaning "at least".

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Module version (major.minor.micro.qualifier)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub micro: u64,
    pub qualifier: String,
}

/// Interval of versions, e.g. `[1.0,2.0)` or `1.2` (at least 1.2)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionRange {
    pub floor: Version,
    pub floor_inclusive: bool,
    pub ceiling: Option<Version>,
    pub ceiling_inclusive: bool,
}

/// Version parsing and validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("Invalid version format: {input}")]
    InvalidFormat { input: String },

    #[error("Invalid number in version: {component}")]
    InvalidNumber { component: String },

    #[error("Invalid qualifier: {qualifier}")]
    InvalidQualifier { qualifier: String },

    #[error("Invalid version range: {input}")]
    InvalidRange { input: String },
}

impl Version {
    /// Create a new version without a qualifier
    pub fn new(major: u64, minor: u64, micro: u64) -> Self {
        Self {
            major,
            minor,
            micro,
            qualifier: String::new(),
        }
    }

    /// The lowest possible version, `0.0.0`
    pub fn zero() -> Self {
        Self::new(0, 0, 0)
    }

    /// Attach a qualifier
    pub fn with_qualifier(mut self, qualifier: impl Into<String>) -> Self {
        self.qualifier = qualifier.into();
        self
    }

    /// Check if this version lies inside a range
    pub fn satisfies(&self, range: &VersionRange) -> bool {
        range.includes(self)
    }
}

impl Default for Version {
    fn default() -> Self {
        Self::zero()
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.micro)
            .cmp(&(other.major, other.minor, other.micro))
            .then_with(|| self.qualifier.cmp(&other.qualifier))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim();
        if input.is_empty() {
            return Err(VersionError::InvalidFormat {
                input: s.to_string(),
            });
        }

        let parts: Vec<&str> = input.splitn(4, '.').collect();
        let mut numbers = [0u64; 3];
        for (slot, part) in numbers.iter_mut().zip(parts.iter().take(3)) {
            *slot = part.parse().map_err(|_| VersionError::InvalidNumber {
                component: part.to_string(),
            })?;
        }

        let qualifier = parts.get(3).copied().unwrap_or_default();
        if !qualifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(VersionError::InvalidQualifier {
                qualifier: qualifier.to_string(),
            });
        }

        Ok(Self {
            major: numbers[0],
            minor: numbers[1],
            micro: numbers[2],
            qualifier: qualifier.to_string(),
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)?;
        if !self.qualifier.is_empty() {
            write!(f, ".{}", self.qualifier)?;
        }
        Ok(())
    }
}

impl TryFrom<String> for Version {
    type Error = VersionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Version> for String {
    fn from(version: Version) -> Self {
        version.to_string()
    }
}

impl VersionRange {
    /// Range matching every version
    pub fn any() -> Self {
        Self::at_least(Version::zero())
    }

    /// Range `[floor, infinity)`
    pub fn at_least(floor: Version) -> Self {
        Self {
            floor,
            floor_inclusive: true,
            ceiling: None,
            ceiling_inclusive: false,
        }
    }

    /// Range `[floor, ceiling)`
    pub fn between(floor: Version, ceiling: Version) -> Self {
        Self {
            floor,
            floor_inclusive: true,
            ceiling: Some(ceiling),
            ceiling_inclusive: false,
        }
    }

    /// Range `[version, version]`
    pub fn exactly(version: Version) -> Self {
        Self {
            floor: version.clone(),
            floor_inclusive: true,
            ceiling: Some(version),
            ceiling_inclusive: true,
        }
    }

    /// Check if a version lies inside this range
    pub fn includes(&self, version: &Version) -> bool {
        let above_floor = match version.cmp(&self.floor) {
            Ordering::Greater => true,
            Ordering::Equal => self.floor_inclusive,
            Ordering::Less => false,
        };
        if !above_floor {
            return false;
        }
        match &self.ceiling {
            None => true,
            Some(ceiling) => match version.cmp(ceiling) {
                Ordering::Less => true,
                Ordering::Equal => self.ceiling_inclusive,
                Ordering::Greater => false,
            },
        }
    }

    /// Check if this range matches every version
    pub fn is_any(&self) -> bool {
        self.ceiling.is_none() && self.floor_inclusive && self.floor == Version::zero()
    }

    /// Intersection of two ranges, `None` when they do not overlap
    pub fn intersect(&self, other: &VersionRange) -> Option<VersionRange> {
        let (floor, floor_inclusive) = match self.floor.cmp(&other.floor) {
            Ordering::Greater => (self.floor.clone(), self.floor_inclusive),
            Ordering::Less => (other.floor.clone(), other.floor_inclusive),
            Ordering::Equal => (
                self.floor.clone(),
                self.floor_inclusive && other.floor_inclusive,
            ),
        };
        let (ceiling, ceiling_inclusive) = match (&self.ceiling, &other.ceiling) {
            (None, None) => (None, false),
            (Some(c), None) => (Some(c.clone()), self.ceiling_inclusive),
            (None, Some(c)) => (Some(c.clone()), other.ceiling_inclusive),
            (Some(a), Some(b)) => match a.cmp(b) {
                Ordering::Less => (Some(a.clone()), self.ceiling_inclusive),
                Ordering::Greater => (Some(b.clone()), other.ceiling_inclusive),
                Ordering::Equal => (
                    Some(a.clone()),
                    self.ceiling_inclusive && other.ceiling_inclusive,
                ),
            },
        };

        if let Some(ceiling) = &ceiling {
            match floor.cmp(ceiling) {
                Ordering::Greater => return None,
                Ordering::Equal if !(floor_inclusive && ceiling_inclusive) => return None,
                _ => {}
            }
        }

        Some(VersionRange {
            floor,
            floor_inclusive,
            ceiling,
            ceiling_inclusive,
        })
    }
}

impl Default for VersionRange {
    fn default() -> Self {
        Self::any()
    }
}

impl FromStr for VersionRange {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim();
        let invalid = || VersionError::InvalidRange {
            input: s.to_string(),
        };

        if input.is_empty() || input == "*" {
            return Ok(Self::any());
        }

        let first = input.chars().next().ok_or_else(invalid)?;
        if first != '[' && first != '(' {
            return Ok(Self::at_least(input.parse()?));
        }

        let last = input.chars().last().ok_or_else(invalid)?;
        if (last != ']' && last != ')') || input.len() < 2 {
            return Err(invalid());
        }

        let body = &input[1..input.len() - 1];
        let (floor, ceiling) = body.split_once(',').ok_or_else(invalid)?;
        let floor: Version = floor.parse()?;
        let ceiling: Version = ceiling.parse()?;
        if floor > ceiling {
            return Err(invalid());
        }

        Ok(Self {
            floor,
            floor_inclusive: first == '[',
            ceiling: Some(ceiling),
            ceiling_inclusive: last == ']',
        })
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.ceiling {
            None if self.floor_inclusive => write!(f, "{}", self.floor),
            None => write!(f, "({},*)", self.floor),
            Some(ceiling) => write!(
                f,
                "{}{},{}{}",
                if self.floor_inclusive { '[' } else { '(' },
                self.floor,
                ceiling,
                if self.ceiling_inclusive { ']' } else { ')' },
            ),
        }
    }
}

impl TryFrom<String> for VersionRange {
    type Error = VersionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<VersionRange> for String {
    fn from(range: VersionRange) -> Self {
        range.to_string()
    }
}
