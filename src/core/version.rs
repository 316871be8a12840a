//! Version constraints and artifact requests
//!
//! Supports:
//! - Latest: `jq` (no constraint)
//! - Pinned: `jq:= 1.7.1`
//! - Ranged: `jq:>= 1.7.0`, `jq:< 2.0.0`
//!
//! A bare version (`jq:1.7.1`) is treated as `>= 1.7.1`.

use std::fmt;
use std::str::FromStr;

use semver::Version;
use thiserror::Error;

/// Errors from parsing a request or constraint.
#[derive(Error, Debug)]
pub enum VersionError {
    /// The request or constraint string is malformed.
    #[error("invalid artifact specifier '{spec}': {reason}")]
    Invalid {
        /// The offending input.
        spec: String,
        /// What was wrong with it.
        reason: String,
    },
}

/// Comparison operator of a version constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// `=` — exactly this version.
    Exact,
    /// `>=` — this version or newer.
    GreaterEq,
    /// `>` — strictly newer.
    Greater,
    /// `<=` — this version or older.
    LessEq,
    /// `<` — strictly older.
    Less,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Op::Exact => "=",
            Op::GreaterEq => ">=",
            Op::Greater => ">",
            Op::LessEq => "<=",
            Op::Less => "<",
        };
        f.write_str(s)
    }
}

/// A single version constraint: an operator and a semver boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraint {
    /// Comparison operator.
    pub op: Op,
    /// Boundary version.
    pub version: Version,
}

impl Constraint {
    /// Parse a constraint like `>= 1.0.0`, `=2.1.0` or `1.0.0`.
    pub fn parse(input: &str) -> Result<Self, VersionError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(VersionError::Invalid {
                spec: input.to_string(),
                reason: "empty constraint".to_string(),
            });
        }

        let (op, rest) = if let Some(rest) = trimmed.strip_prefix(">=") {
            (Op::GreaterEq, rest)
        } else if let Some(rest) = trimmed.strip_prefix("<=") {
            (Op::LessEq, rest)
        } else if let Some(rest) = trimmed.strip_prefix('>') {
            (Op::Greater, rest)
        } else if let Some(rest) = trimmed.strip_prefix('<') {
            (Op::Less, rest)
        } else if let Some(rest) = trimmed.strip_prefix('=') {
            (Op::Exact, rest)
        } else {
            // Bare version means "at least this version".
            (Op::GreaterEq, trimmed)
        };

        let version = Version::from_str(rest.trim()).map_err(|e| VersionError::Invalid {
            spec: input.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self { op, version })
    }

    /// Whether `candidate` satisfies this constraint under semver
    /// precedence (pre-releases compare lower than releases).
    pub fn matches(&self, candidate: &Version) -> bool {
        match self.op {
            Op::Exact => candidate == &self.version,
            Op::GreaterEq => candidate >= &self.version,
            Op::Greater => candidate > &self.version,
            Op::LessEq => candidate <= &self.version,
            Op::Less => candidate < &self.version,
        }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.op, self.version)
    }
}

/// A dependency or user request: a name with an optional constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Artifact name.
    pub name: String,
    /// Version constraint, if one was given.
    pub constraint: Option<Constraint>,
}

impl Request {
    /// Parse a request like `jq` or `jq:>= 1.7.0`.
    pub fn parse(spec: &str) -> Result<Self, VersionError> {
        let trimmed = spec.trim();
        if let Some((name, constraint)) = trimmed.split_once(':') {
            if name.is_empty() {
                return Err(VersionError::Invalid {
                    spec: spec.to_string(),
                    reason: "missing artifact name".to_string(),
                });
            }
            Ok(Self {
                name: name.to_string(),
                constraint: Some(Constraint::parse(constraint)?),
            })
        } else if trimmed.is_empty() {
            Err(VersionError::Invalid {
                spec: spec.to_string(),
                reason: "empty specifier".to_string(),
            })
        } else {
            Ok(Self {
                name: trimmed.to_string(),
                constraint: None,
            })
        }
    }

    /// Whether `candidate` satisfies this request's constraint (a
    /// request without a constraint accepts everything).
    pub fn matches(&self, candidate: &Version) -> bool {
        match &self.constraint {
            Some(c) => c.matches(candidate),
            None => true,
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.constraint {
            Some(c) => write!(f, "{}:{}", self.name, c),
            None => f.write_str(&self.name),
        }
    }
}
