//! Subscription filter options and label-selector construction.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// One label requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    In(String, BTreeSet<String>),
    NotIn(String, BTreeSet<String>),
    Exists(String),
    NotExists(String),
}

impl Requirement {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Requirement::Equals(k, v) => labels.get(k) == Some(v),
            Requirement::NotEquals(k, v) => labels.get(k) != Some(v),
            Requirement::In(k, vs) => labels.get(k).map(|v| vs.contains(v)).unwrap_or(false),
            Requirement::NotIn(k, vs) => labels.get(k).map(|v| !vs.contains(v)).unwrap_or(true),
            Requirement::Exists(k) => labels.contains_key(k),
            Requirement::NotExists(k) => !labels.contains_key(k),
        }
    }
}

fn join_set(vs: &BTreeSet<String>) -> String { vs.iter().map(String::as_str).collect::<Vec<_>>().join(",") }

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Requirement::Equals(k, v) => write!(f, "{}={}", k, v),
            Requirement::NotEquals(k, v) => write!(f, "{}!={}", k, v),
            Requirement::In(k, vs) => write!(f, "{} in ({})", k, join_set(vs)),
            Requirement::NotIn(k, vs) => write!(f, "{} notin ({})", k, join_set(vs)),
            Requirement::Exists(k) => f.write_str(k),
            Requirement::NotExists(k) => write!(f, "!{}", k),
        }
    }
}

/// Label selector builder. Rendering is deterministic: requirements are sorted
/// by their rendered form and set values are kept sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    pub fn new() -> Self { Self::default() }

    pub fn equals(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.requirements.push(Requirement::Equals(key.into(), value.into()));
        self
    }

    pub fn not_equals(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.requirements.push(Requirement::NotEquals(key.into(), value.into()));
        self
    }

    pub fn in_set<I, S>(mut self, key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requirements.push(Requirement::In(key.into(), values.into_iter().map(Into::into).collect()));
        self
    }

    pub fn not_in<I, S>(mut self, key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requirements.push(Requirement::NotIn(key.into(), values.into_iter().map(Into::into).collect()));
        self
    }

    pub fn exists(mut self, key: impl Into<String>) -> Self {
        self.requirements.push(Requirement::Exists(key.into()));
        self
    }

    pub fn not_exists(mut self, key: impl Into<String>) -> Self {
        self.requirements.push(Requirement::NotExists(key.into()));
        self
    }

    pub fn is_empty(&self) -> bool { self.requirements.is_empty() }
    pub fn requirements(&self) -> &[Requirement] { &self.requirements }

    /// An empty selector matches everything.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool { self.requirements.iter().all(|r| r.matches(labels)) }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = self.requirements.iter().map(|r| r.to_string()).collect();
        parts.sort();
        parts.dedup();
        f.write_str(&parts.join(","))
    }
}

/// Split on commas that are not inside a `( ... )` value set.
fn split_terms(s: &str) -> Result<Vec<&str>> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(Error::InvalidSelector(s.to_string()));
                }
            }
            ',' if depth == 0 => {
                out.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(Error::InvalidSelector(s.to_string()));
    }
    out.push(&s[start..]);
    Ok(out)
}

fn parse_set(raw: &str, term: &str) -> Result<BTreeSet<String>> {
    let inner = raw
        .trim()
        .strip_prefix('(')
        .and_then(|r| r.strip_suffix(')'))
        .ok_or_else(|| Error::InvalidSelector(term.to_string()))?;
    let set: BTreeSet<String> = inner.split(',').map(|v| v.trim().to_string()).filter(|v| !v.is_empty()).collect();
    if set.is_empty() {
        return Err(Error::InvalidSelector(term.to_string()));
    }
    Ok(set)
}

fn parse_term(term: &str) -> Result<Requirement> {
    let t = term.trim();
    let invalid = || Error::InvalidSelector(term.to_string());
    if t.is_empty() {
        return Err(invalid());
    }
    if let Some(k) = t.strip_prefix('!') {
        let k = k.trim();
        if k.is_empty() || k.contains(['=', ' ']) {
            return Err(invalid());
        }
        return Ok(Requirement::NotExists(k.to_string()));
    }
    if let Some((k, rest)) = t.split_once(" notin ") {
        return Ok(Requirement::NotIn(k.trim().to_string(), parse_set(rest, term)?));
    }
    if let Some((k, rest)) = t.split_once(" in ") {
        return Ok(Requirement::In(k.trim().to_string(), parse_set(rest, term)?));
    }
    if let Some((k, v)) = t.split_once("!=") {
        if k.trim().is_empty() {
            return Err(invalid());
        }
        return Ok(Requirement::NotEquals(k.trim().to_string(), v.trim().to_string()));
    }
    if let Some((k, v)) = t.split_once("==").or_else(|| t.split_once('=')) {
        if k.trim().is_empty() {
            return Err(invalid());
        }
        return Ok(Requirement::Equals(k.trim().to_string(), v.trim().to_string()));
    }
    if t.contains([' ', '(', ')']) {
        return Err(invalid());
    }
    Ok(Requirement::Exists(t.to_string()))
}

impl FromStr for LabelSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.trim().is_empty() {
            return Ok(Self::default());
        }
        let requirements = split_terms(s)?.into_iter().map(parse_term).collect::<Result<Vec<_>>>()?;
        Ok(Self { requirements })
    }
}

/// List/watch scope for one pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListOptions {
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
}

impl ListOptions {
    pub fn namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = Some(ns.into());
        self
    }

    pub fn labels(mut self, selector: &LabelSelector) -> Self {
        self.label_selector = if selector.is_empty() { None } else { Some(selector.to_string()) };
        self
    }

    pub fn fields(mut self, selector: impl Into<String>) -> Self {
        let s = selector.into();
        self.field_selector = if s.is_empty() { None } else { Some(s) };
        self
    }
}
