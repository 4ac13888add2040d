//! Equality-based label selectors
//!
//! Supports the subset of Kubernetes selector syntax the handshake needs:
//! `key=value`, `key==value`, `key!=value`, `key` (exists) and `!key`
//! (does not exist), joined by commas. Whitespace around operators is
//! accepted, so `open-cluster-management.io/cluster-name = edge-1` parses.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// One requirement of a selector
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Requirement {
    /// Label must be present with this value
    Equals(String, String),
    /// Label must be absent or have a different value
    NotEquals(String, String),
    /// Label must be present
    Exists(String),
    /// Label must be absent
    DoesNotExist(String),
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Self::Equals(k, v) => labels.get(k) == Some(v),
            Self::NotEquals(k, v) => labels.get(k) != Some(v),
            Self::Exists(k) => labels.contains_key(k),
            Self::DoesNotExist(k) => !labels.contains_key(k),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Equals(k, v) => write!(f, "{k}={v}"),
            Self::NotEquals(k, v) => write!(f, "{k}!={v}"),
            Self::Exists(k) => write!(f, "{k}"),
            Self::DoesNotExist(k) => write!(f, "!{k}"),
        }
    }
}

/// A conjunction of label requirements. The empty selector matches everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    /// Selector matching every object
    pub fn everything() -> Self {
        Self::default()
    }

    /// Selector requiring `key=value`
    pub fn eq(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            requirements: vec![Requirement::Equals(key.into(), value.into())],
        }
    }

    /// Add another requirement
    pub fn and(mut self, requirement: Requirement) -> Self {
        self.requirements.push(requirement);
        self
    }

    /// Requirements in this selector
    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    /// True if no requirement is set
    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    /// True if the labels satisfy every requirement
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.requirements.iter().map(|r| r.to_string()).collect();
        write!(f, "{}", parts.join(","))
    }
}

fn validate_key(key: &str, selector: &str) -> Result<String, Error> {
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return Err(Error::validation(format!(
            "invalid label selector {selector:?}: bad key {key:?}"
        )));
    }
    Ok(key.to_string())
}

fn validate_value(value: &str, selector: &str) -> Result<String, Error> {
    let value = value.trim();
    if value.contains(char::is_whitespace) || value.contains('=') || value.contains('!') {
        return Err(Error::validation(format!(
            "invalid label selector {selector:?}: bad value {value:?}"
        )));
    }
    Ok(value.to_string())
}

impl FromStr for LabelSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut requirements = Vec::new();

        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                if s.trim().is_empty() {
                    continue;
                }
                return Err(Error::validation(format!(
                    "invalid label selector {s:?}: empty requirement"
                )));
            }

            let requirement = if let Some((k, v)) = part.split_once("!=") {
                Requirement::NotEquals(validate_key(k, s)?, validate_value(v, s)?)
            } else if let Some((k, v)) = part.split_once("==") {
                Requirement::Equals(validate_key(k, s)?, validate_value(v, s)?)
            } else if let Some((k, v)) = part.split_once('=') {
                Requirement::Equals(validate_key(k, s)?, validate_value(v, s)?)
            } else if let Some(k) = part.strip_prefix('!') {
                Requirement::DoesNotExist(validate_key(k, s)?)
            } else {
                Requirement::Exists(validate_key(part, s)?)
            };
            requirements.push(requirement);
        }

        Ok(Self { requirements })
    }
}
