//! Fleet matcher.
//!
//! Decides which members satisfy a declaration's cluster selector. The
//! selector uses label-selector syntax:
//!
//! ```text
//! env=prod,tier!=db,region in (eu, us),gpu,!legacy
//! ```
//!
//! An empty selector matches every member.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use fleetclass_api::Member;
use fleetclass_names::MemberId;
use thiserror::Error;

const MAX_LABEL_NAME_LEN: usize = 63;
const MAX_LABEL_PREFIX_LEN: usize = 253;

/// Malformed selector. Terminal: retrying cannot fix it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SelectorError {
    #[error("empty requirement at position {0}")]
    EmptyRequirement(usize),

    #[error("invalid label key '{0}'")]
    InvalidKey(String),

    #[error("invalid label value '{value}' for key '{key}'")]
    InvalidValue { key: String, value: String },

    #[error("unknown operator '{op}' for key '{key}'")]
    UnknownOperator { key: String, op: String },

    #[error("value set for key '{0}' must be enclosed in parentheses")]
    MalformedSet(String),

    #[error("value set for key '{0}' is empty")]
    EmptySet(String),

    #[error("unbalanced parentheses in selector")]
    Unbalanced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    NotEquals,
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    key: String,
    operator: Operator,
    values: BTreeSet<String>,
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            Operator::Equals | Operator::In => value.is_some_and(|v| self.values.contains(v)),
            // Absent keys satisfy != and notin.
            Operator::NotEquals | Operator::NotIn => !value.is_some_and(|v| self.values.contains(v)),
            Operator::Exists => value.is_some(),
            Operator::DoesNotExist => value.is_none(),
        }
    }
}

/// A parsed cluster selector: the conjunction of its requirements.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

impl Selector {
    pub fn parse(expr: &str) -> Result<Self, SelectorError> {
        if expr.trim().is_empty() {
            return Ok(Self::default());
        }

        let requirements = split_top_level(expr)?
            .into_iter()
            .enumerate()
            .map(|(position, term)| parse_requirement(position, term))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { requirements })
    }

    /// Returns true if the selector has no requirements.
    pub fn is_everything(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

impl FromStr for Selector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Ids of the members whose labels satisfy `selector`.
pub fn match_members(members: &[Member], selector: &Selector) -> BTreeSet<MemberId> {
    members
        .iter()
        .filter(|m| selector.matches(&m.labels))
        .map(|m| m.id.clone())
        .collect()
}

/// Parse `expr` and match it against `members`.
pub fn matching_members(members: &[Member], expr: &str) -> Result<BTreeSet<MemberId>, SelectorError> {
    Ok(match_members(members, &Selector::parse(expr)?))
}

/// Split on commas that are not inside a value set.
fn split_top_level(expr: &str) -> Result<Vec<&str>, SelectorError> {
    let mut terms = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;

    for (i, c) in expr.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.checked_sub(1).ok_or(SelectorError::Unbalanced)?,
            ',' if depth == 0 => {
                terms.push(&expr[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(SelectorError::Unbalanced);
    }
    terms.push(&expr[start..]);
    Ok(terms)
}

fn parse_requirement(position: usize, term: &str) -> Result<Requirement, SelectorError> {
    let term = term.trim();
    if term.is_empty() {
        return Err(SelectorError::EmptyRequirement(position));
    }

    if let Some(key) = term.strip_prefix('!') {
        return requirement(key.trim(), Operator::DoesNotExist, []);
    }

    // Check the two-character operators before `=`.
    for (token, operator) in [("!=", Operator::NotEquals), ("==", Operator::Equals), ("=", Operator::Equals)] {
        if let Some((key, value)) = term.split_once(token) {
            let key = key.trim();
            let value = value.trim();
            validate_value(key, value)?;
            return requirement(key, operator, [value.to_string()]);
        }
    }

    if let Some(open) = term.find('(') {
        let head = &term[..open];
        let mut words = head.split_whitespace();
        let key = words.next().unwrap_or_default();
        let op = words.next().unwrap_or_default();
        if words.next().is_some() {
            return Err(SelectorError::InvalidKey(head.trim().to_string()));
        }
        let operator = match op {
            "in" => Operator::In,
            "notin" => Operator::NotIn,
            other => {
                return Err(SelectorError::UnknownOperator {
                    key: key.to_string(),
                    op: other.to_string(),
                })
            }
        };

        let Some(inner) = term[open + 1..].strip_suffix(')') else {
            return Err(SelectorError::MalformedSet(key.to_string()));
        };
        let values = inner
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| validate_value(key, v).map(|_| v.to_string()))
            .collect::<Result<BTreeSet<_>, _>>()?;
        if values.is_empty() {
            return Err(SelectorError::EmptySet(key.to_string()));
        }
        return requirement(key, operator, values);
    }

    if term.contains(char::is_whitespace) {
        let mut words = term.split_whitespace();
        let key = words.next().unwrap_or_default().to_string();
        let op = words.next().unwrap_or_default();
        if op == "in" || op == "notin" {
            return Err(SelectorError::MalformedSet(key));
        }
        return Err(SelectorError::UnknownOperator {
            key,
            op: op.to_string(),
        });
    }

    requirement(term, Operator::Exists, [])
}

fn requirement(
    key: &str,
    operator: Operator,
    values: impl IntoIterator<Item = String>,
) -> Result<Requirement, SelectorError> {
    validate_key(key)?;
    Ok(Requirement {
        key: key.to_string(),
        operator,
        values: values.into_iter().collect(),
    })
}

/// `[prefix/]name`, where prefix is a DNS subdomain and name a qualified name.
fn validate_key(key: &str) -> Result<(), SelectorError> {
    let invalid = || SelectorError::InvalidKey(key.to_string());
    let (prefix, name) = match key.split_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, key),
    };

    if let Some(prefix) = prefix {
        let ok = !prefix.is_empty()
            && prefix.len() <= MAX_LABEL_PREFIX_LEN
            && prefix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
            && has_alnum_edges(prefix);
        if !ok {
            return Err(invalid());
        }
    }

    if name.is_empty() || !is_qualified_token(name) {
        return Err(invalid());
    }
    Ok(())
}

fn validate_value(key: &str, value: &str) -> Result<(), SelectorError> {
    if value.is_empty() || is_qualified_token(value) {
        return Ok(());
    }
    Err(SelectorError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn is_qualified_token(s: &str) -> bool {
    s.len() <= MAX_LABEL_NAME_LEN
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && has_alnum_edges(s)
}

fn has_alnum_edges(s: &str) -> bool {
    let alnum = |c: Option<char>| c.is_some_and(|c| c.is_ascii_alphanumeric());
    alnum(s.chars().next()) && alnum(s.chars().last())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn member(id: &str, pairs: &[(&str, &str)]) -> Member {
        Member {
            id: id.parse().unwrap(),
            labels: labels(pairs),
            api_url: "http://member.invalid".to_string(),
        }
    }

    #[rstest]
    #[case("", true)]
    #[case("env=prod", true)]
    #[case("env==prod", true)]
    #[case("env!=prod", false)]
    #[case("env in (prod, staging)", true)]
    #[case("env notin (prod)", false)]
    #[case("gpu", false)]
    #[case("!gpu", true)]
    #[case("env=prod,region=eu", true)]
    #[case("env=prod,region=us", false)]
    #[case("tier!=db", true)]
    #[case("topology.example.io/zone=eu-1a", true)]
    fn test_selector_matches(#[case] expr: &str, #[case] expected: bool) {
        let labels = labels(&[
            ("env", "prod"),
            ("region", "eu"),
            ("topology.example.io/zone", "eu-1a"),
        ]);
        let selector = Selector::parse(expr).unwrap();
        assert_eq!(selector.matches(&labels), expected, "selector {expr:?}");
    }

    #[rstest]
    #[case("env=prod,", SelectorError::EmptyRequirement(1))]
    #[case("Env Prod", SelectorError::UnknownOperator { key: "Env".into(), op: "Prod".into() })]
    #[case("env in (prod", SelectorError::Unbalanced)]
    #[case("env in ()", SelectorError::EmptySet("env".into()))]
    #[case("env in prod", SelectorError::MalformedSet("env".into()))]
    #[case("env=pr od", SelectorError::InvalidValue { key: "env".into(), value: "pr od".into() })]
    #[case("-env=prod", SelectorError::InvalidKey("-env".into()))]
    #[case("env like (prod)", SelectorError::UnknownOperator { key: "env".into(), op: "like".into() })]
    fn test_selector_rejects(#[case] expr: &str, #[case] expected: SelectorError) {
        assert_eq!(Selector::parse(expr).unwrap_err(), expected);
    }

    #[test]
    fn test_empty_value_is_allowed() {
        let selector = Selector::parse("env=").unwrap();
        assert!(selector.matches(&labels(&[("env", "")])));
        assert!(!selector.matches(&labels(&[("env", "prod")])));
    }

    #[test]
    fn test_empty_selector_matches_all_members() {
        let members = vec![member("a/one", &[]), member("b/two", &[("env", "dev")])];
        let matched = matching_members(&members, "  ").unwrap();
        assert_eq!(matched.len(), 2);
        assert!(Selector::parse("").unwrap().is_everything());
    }

    #[test]
    fn test_match_members_is_deterministic() {
        let members = vec![
            member("fleet/c", &[("env", "prod")]),
            member("fleet/a", &[("env", "prod")]),
            member("fleet/b", &[("env", "dev")]),
        ];
        let matched: Vec<String> = matching_members(&members, "env=prod")
            .unwrap()
            .into_iter()
            .map(|id| id.to_string())
            .collect();
        assert_eq!(matched, vec!["fleet/a", "fleet/c"]);
    }
}
