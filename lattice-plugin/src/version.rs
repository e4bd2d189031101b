//! Semantic version constraints
//!
//! A constraint is one or more comparators separated by commas, all of which
//! must hold: `>=1.2.0, <2.0.0`. Supported operators are `=`, `>=`, `<=`, `>`,
//! `<` and `^`; a bare version means `=` and `*` matches everything. Partial
//! versions such as `1.2` are rejected.
//!
//! `^` keeps the major version fixed when it is non-zero. For `0.x` versions
//! the minor version is the compatibility boundary instead.

use semver::Version;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::{PluginError, PluginResult};

/// Comparison operator of a single comparator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Exact,
    Greater,
    GreaterEq,
    Less,
    LessEq,
    Caret,
}

impl Op {
    fn symbol(self) -> &'static str {
        match self {
            Op::Exact => "=",
            Op::Greater => ">",
            Op::GreaterEq => ">=",
            Op::Less => "<",
            Op::LessEq => "<=",
            Op::Caret => "^",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comparator {
    pub op: Op,
    pub version: Version,
}

impl Comparator {
    pub fn matches(&self, version: &Version) -> bool {
        let ordering = precedence(version, &self.version);
        match self.op {
            Op::Exact => ordering == Ordering::Equal,
            Op::Greater => ordering == Ordering::Greater,
            Op::GreaterEq => ordering != Ordering::Less,
            Op::Less => ordering == Ordering::Less,
            Op::LessEq => ordering != Ordering::Greater,
            Op::Caret => {
                let compatible = if self.version.major > 0 {
                    version.major == self.version.major
                } else {
                    version.major == 0 && version.minor == self.version.minor
                };
                compatible && ordering != Ordering::Less
            }
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.op.symbol(), self.version)
    }
}

/// Compare by (major, minor, patch, pre-release); build metadata never counts
fn precedence(a: &Version, b: &Version) -> Ordering {
    (a.major, a.minor, a.patch)
        .cmp(&(b.major, b.minor, b.patch))
        .then_with(|| a.pre.cmp(&b.pre))
}

/// A parsed version range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionConstraint {
    source: String,
    comparators: Vec<Comparator>,
}

impl VersionConstraint {
    /// Parse a constraint string
    pub fn parse(input: &str) -> PluginResult<Self> {
        let source = input.trim();
        if source.is_empty() {
            return Err(malformed(input, "constraint is empty"));
        }

        if source == "*" {
            return Ok(Self::any());
        }

        let comparators = source
            .split(',')
            .map(|part| parse_comparator(input, part.trim()))
            .collect::<PluginResult<Vec<_>>>()?;

        Ok(Self {
            source: source.to_string(),
            comparators,
        })
    }

    /// Matches every version
    pub fn any() -> Self {
        Self {
            source: "*".to_string(),
            comparators: Vec::new(),
        }
    }

    /// `=version`
    pub fn exact(version: &Version) -> Self {
        Self {
            source: format!("={}", version),
            comparators: vec![Comparator {
                op: Op::Exact,
                version: version.clone(),
            }],
        }
    }

    pub fn matches(&self, version: &Version) -> bool {
        self.comparators.iter().all(|c| c.matches(version))
    }

    pub fn comparators(&self) -> &[Comparator] {
        &self.comparators
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

fn parse_comparator(input: &str, part: &str) -> PluginResult<Comparator> {
    if part.is_empty() {
        return Err(malformed(input, "empty comparator"));
    }
    if part == "*" {
        return Err(malformed(input, "'*' cannot be combined with other comparators"));
    }

    // two-character operators first
    let (op, rest) = [
        (">=", Op::GreaterEq),
        ("<=", Op::LessEq),
        (">", Op::Greater),
        ("<", Op::Less),
        ("=", Op::Exact),
        ("^", Op::Caret),
    ]
    .iter()
    .find_map(|(prefix, op)| part.strip_prefix(prefix).map(|rest| (*op, rest)))
    .unwrap_or((Op::Exact, part));

    let version = Version::parse(rest.trim())
        .map_err(|e| malformed(input, &format!("'{}': {}", rest.trim(), e)))?;

    Ok(Comparator { op, version })
}

fn malformed(constraint: &str, reason: &str) -> PluginError {
    PluginError::MalformedConstraint {
        constraint: constraint.to_string(),
        reason: reason.to_string(),
    }
}

impl Default for VersionConstraint {
    fn default() -> Self {
        Self::any()
    }
}

impl FromStr for VersionConstraint {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Serialize for VersionConstraint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for VersionConstraint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    fn matches(constraint: &str, version: &str) -> bool {
        VersionConstraint::parse(constraint).unwrap().matches(&v(version))
    }

    #[test]
    fn test_basic_operators() {
        assert!(matches("=1.2.3", "1.2.3"));
        assert!(matches("1.2.3", "1.2.3"));
        assert!(!matches("1.2.3", "1.2.4"));
        assert!(matches(">=1.2.3", "1.2.3"));
        assert!(matches(">1.2.3", "1.3.0"));
        assert!(!matches(">1.2.3", "1.2.3"));
        assert!(matches("<2.0.0", "1.99.0"));
        assert!(matches("<=2.0.0", "2.0.0"));
        assert!(!matches("<2.0.0", "2.0.0"));
    }

    #[test]
    fn test_caret_major() {
        assert!(matches("^1.2.3", "1.2.3"));
        assert!(matches("^1.2.3", "1.9.0"));
        assert!(!matches("^1.2.3", "1.2.2"));
        assert!(!matches("^1.2.3", "2.0.0"));
        assert!(!matches("^2.0.0", "1.0.0"));
    }

    #[test]
    fn test_caret_zero_major_uses_minor_boundary() {
        assert!(matches("^0.3.1", "0.3.5"));
        assert!(!matches("^0.3.1", "0.3.0"));
        assert!(!matches("^0.3.1", "0.4.0"));
        assert!(!matches("^0.3.1", "1.3.1"));
    }

    #[test]
    fn test_ranges_and_wildcard() {
        assert!(matches(">=1.2.0, <2.0.0", "1.5.0"));
        assert!(!matches(">=1.2.0, <2.0.0", "2.0.0"));
        assert!(matches("*", "0.0.1"));
        assert!(matches("  *  ", "9.9.9"));
    }

    #[test]
    fn test_build_metadata_ignored() {
        assert!(matches("=1.0.0", "1.0.0+build.7"));
        assert!(matches("=1.0.0+abc", "1.0.0"));
    }

    #[test]
    fn test_prerelease_precedence() {
        assert!(matches("<1.0.0", "1.0.0-alpha"));
        assert!(!matches(">=1.0.0", "1.0.0-rc.1"));
    }

    #[test]
    fn test_malformed_constraints() {
        for bad in ["", "1.2", ">=", "~1.0.0", "^abc", ">=1.0.0,", "*, >1.0.0", "=>1.0.0"] {
            let result = VersionConstraint::parse(bad);
            assert!(
                matches!(result, Err(PluginError::MalformedConstraint { .. })),
                "expected '{}' to be malformed",
                bad
            );
        }
    }

    #[test]
    fn test_display_and_serde_round_trip() {
        let constraint = VersionConstraint::parse(">=1.0.0, <1.5.0").unwrap();
        assert_eq!(constraint.to_string(), ">=1.0.0, <1.5.0");

        let json = serde_json::to_string(&constraint).unwrap();
        assert_eq!(json, "\">=1.0.0, <1.5.0\"");
        let back: VersionConstraint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, constraint);

        let bad: Result<VersionConstraint, _> = serde_json::from_str("\"1.x\"");
        assert!(bad.is_err());
    }
}
