//! Equality-based label selectors.

use crate::errors::{NodeStateError, Result};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirement {
    Exists(String),
    Equals(String, String),
    NotEquals(String, String),
}

/// A label selector of the form `a=b,c!=d,e`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    /// A selector that matches everything.
    #[must_use]
    pub fn everything() -> Self {
        Self::default()
    }

    /// Parses a comma-separated selector.
    pub fn parse(selector: &str) -> Result<Self> {
        let mut requirements = Vec::new();
        for term in selector.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let req = if let Some((k, v)) = term.split_once("!=") {
                Requirement::NotEquals(k.trim().to_string(), v.trim().to_string())
            } else if let Some((k, v)) = term.split_once("==").or_else(|| term.split_once('=')) {
                Requirement::Equals(k.trim().to_string(), v.trim().to_string())
            } else {
                Requirement::Exists(term.to_string())
            };
            let key = match &req {
                Requirement::Exists(k) | Requirement::Equals(k, _) | Requirement::NotEquals(k, _) => k,
            };
            if key.is_empty() || key.contains(char::is_whitespace) {
                return Err(NodeStateError::validation(format!(
                    "invalid label selector term '{term}'"
                )));
            }
            requirements.push(req);
        }
        Ok(Self { requirements })
    }

    /// Adds an equality requirement.
    #[must_use]
    pub fn with_equals(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.requirements
            .push(Requirement::Equals(key.into(), value.into()));
        self
    }

    /// Adds an existence requirement.
    #[must_use]
    pub fn with_exists(mut self, key: impl Into<String>) -> Self {
        self.requirements.push(Requirement::Exists(key.into()));
        self
    }

    /// Combines two selectors.
    #[must_use]
    pub fn and(mut self, other: &Self) -> Self {
        self.requirements.extend(other.requirements.iter().cloned());
        self
    }

    /// Returns true if `labels` satisfy every requirement.
    #[must_use]
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|req| match req {
            Requirement::Exists(k) => labels.contains_key(k),
            Requirement::Equals(k, v) => labels.get(k) == Some(v),
            Requirement::NotEquals(k, v) => labels.get(k) != Some(v),
        })
    }

    /// Returns true if the selector has no requirements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let terms: Vec<String> = self
            .requirements
            .iter()
            .map(|req| match req {
                Requirement::Exists(k) => k.clone(),
                Requirement::Equals(k, v) => format!("{k}={v}"),
                Requirement::NotEquals(k, v) => format!("{k}!={v}"),
            })
            .collect();
        write!(f, "{}", terms.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_parse_and_match() {
        let sel = LabelSelector::parse("app=wf, tier!=db,gc").unwrap();
        assert!(sel.matches(&labels(&[("app", "wf"), ("gc", "5m")])));
        assert!(!sel.matches(&labels(&[("app", "wf")])));
        assert!(!sel.matches(&labels(&[("app", "wf"), ("tier", "db"), ("gc", "")])));
        assert_eq!(sel.to_string(), "app=wf,tier!=db,gc");
    }

    #[test]
    fn test_empty_matches_everything() {
        let sel = LabelSelector::parse("").unwrap();
        assert!(sel.is_empty());
        assert!(sel.matches(&BTreeMap::new()));
    }

    #[test]
    fn test_invalid_term() {
        assert!(LabelSelector::parse("=x").is_err());
        assert!(LabelSelector::parse("a b=c").is_err());
    }

    #[test]
    fn test_and_combines() {
        let sel = LabelSelector::everything()
            .with_equals("workflow", "wf-1")
            .and(&LabelSelector::parse("step=main").unwrap());
        assert_eq!(sel.to_string(), "workflow=wf-1,step=main");
    }
}
