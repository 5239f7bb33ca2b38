//! Structural conditions over a decoded JSON body.
//!
//! ```yaml
//! condition:
//!   and:
//!     - equals: {status: ok, "checks.db": 1}
//!     - regexp: {version: '^2\.'}
//!     - not: {has_fields: [error]}
//! ```

use std::collections::BTreeMap;

use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Number, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConditionError {
    #[error("condition must set exactly one of equals, contains, regexp, range, has_fields, and, or, not")]
    Empty,
    #[error("condition sets more than one operator: {0}")]
    Multiple(String),
    #[error("invalid regular expression for field {field}: {source}")]
    Regex {
        field: String,
        #[source]
        source: regex::Error,
    },
    #[error("range for field {0} sets no bound")]
    EmptyRange(String),
    #[error("{0} needs at least one condition")]
    EmptyList(&'static str),
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RangeConfig {
    pub gt: Option<f64>,
    pub gte: Option<f64>,
    pub lt: Option<f64>,
    pub lte: Option<f64>,
}

/// A condition as written in YAML. Exactly one operator may be set.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConditionConfig {
    pub equals: Option<BTreeMap<String, Value>>,
    pub contains: Option<BTreeMap<String, String>>,
    pub regexp: Option<BTreeMap<String, String>>,
    pub range: Option<BTreeMap<String, RangeConfig>>,
    pub has_fields: Option<Vec<String>>,
    pub and: Option<Vec<ConditionConfig>>,
    pub or: Option<Vec<ConditionConfig>>,
    pub not: Option<Box<ConditionConfig>>,
}

#[derive(Debug, Clone)]
pub enum Condition {
    Equals(Vec<(String, Value)>),
    Contains(Vec<(String, String)>),
    Regexp(Vec<(String, Regex)>),
    Range(Vec<(String, RangeConfig)>),
    HasFields(Vec<String>),
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    pub fn new(config: &ConditionConfig) -> Result<Self, ConditionError> {
        let mut set = Vec::new();
        if config.equals.is_some() {
            set.push("equals");
        }
        if config.contains.is_some() {
            set.push("contains");
        }
        if config.regexp.is_some() {
            set.push("regexp");
        }
        if config.range.is_some() {
            set.push("range");
        }
        if config.has_fields.is_some() {
            set.push("has_fields");
        }
        if config.and.is_some() {
            set.push("and");
        }
        if config.or.is_some() {
            set.push("or");
        }
        if config.not.is_some() {
            set.push("not");
        }
        match set.len() {
            0 => return Err(ConditionError::Empty),
            1 => {}
            _ => return Err(ConditionError::Multiple(set.join(", "))),
        }

        if let Some(equals) = &config.equals {
            return Ok(Condition::Equals(
                equals
                    .iter()
                    .map(|(field, value)| (field.clone(), normalize(value.clone())))
                    .collect(),
            ));
        }
        if let Some(contains) = &config.contains {
            return Ok(Condition::Contains(
                contains.iter().map(|(f, s)| (f.clone(), s.clone())).collect(),
            ));
        }
        if let Some(regexp) = &config.regexp {
            let compiled = regexp
                .iter()
                .map(|(field, pattern)| {
                    Regex::new(pattern)
                        .map(|re| (field.clone(), re))
                        .map_err(|source| ConditionError::Regex {
                            field: field.clone(),
                            source,
                        })
                })
                .collect::<Result<_, _>>()?;
            return Ok(Condition::Regexp(compiled));
        }
        if let Some(range) = &config.range {
            for (field, bounds) in range {
                if *bounds == RangeConfig::default() {
                    return Err(ConditionError::EmptyRange(field.clone()));
                }
            }
            return Ok(Condition::Range(
                range.iter().map(|(f, b)| (f.clone(), b.clone())).collect(),
            ));
        }
        if let Some(fields) = &config.has_fields {
            return Ok(Condition::HasFields(fields.clone()));
        }
        if let Some(and) = &config.and {
            return Ok(Condition::And(compile_list(and, "and")?));
        }
        if let Some(or) = &config.or {
            return Ok(Condition::Or(compile_list(or, "or")?));
        }
        match &config.not {
            Some(inner) => Ok(Condition::Not(Box::new(Condition::new(inner)?))),
            None => Err(ConditionError::Empty),
        }
    }

    /// Evaluate against a body decoded with [`normalize`].
    pub fn check(&self, document: &Value) -> bool {
        match self {
            Condition::Equals(expected) => expected
                .iter()
                .all(|(field, want)| lookup(document, field).is_some_and(|got| got == want)),
            Condition::Contains(expected) => expected.iter().all(|(field, needle)| {
                match lookup(document, field) {
                    Some(Value::String(s)) => s.contains(needle.as_str()),
                    Some(Value::Array(items)) => items
                        .iter()
                        .any(|item| item.as_str().is_some_and(|s| s.contains(needle.as_str()))),
                    _ => false,
                }
            }),
            Condition::Regexp(expected) => expected.iter().all(|(field, re)| {
                match lookup(document, field) {
                    Some(Value::String(s)) => re.is_match(s),
                    Some(Value::Array(items)) => items
                        .iter()
                        .any(|item| item.as_str().is_some_and(|s| re.is_match(s))),
                    _ => false,
                }
            }),
            Condition::Range(expected) => expected.iter().all(|(field, bounds)| {
                let Some(n) = lookup(document, field).and_then(Value::as_f64) else {
                    return false;
                };
                bounds.gt.is_none_or(|b| n > b)
                    && bounds.gte.is_none_or(|b| n >= b)
                    && bounds.lt.is_none_or(|b| n < b)
                    && bounds.lte.is_none_or(|b| n <= b)
            }),
            Condition::HasFields(fields) => fields.iter().all(|f| lookup(document, f).is_some()),
            Condition::And(all) => all.iter().all(|c| c.check(document)),
            Condition::Or(any) => any.iter().any(|c| c.check(document)),
            Condition::Not(inner) => !inner.check(document),
        }
    }
}

fn compile_list(
    configs: &[ConditionConfig],
    name: &'static str,
) -> Result<Vec<Condition>, ConditionError> {
    if configs.is_empty() {
        return Err(ConditionError::EmptyList(name));
    }
    configs.iter().map(Condition::new).collect()
}

/// Convert integral floating point numbers to integers, recursively, so
/// `3.0` in a body compares equal to `3` in a condition.
pub fn normalize(value: Value) -> Value {
    match value {
        Value::Number(n) if n.is_f64() => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                Value::Number(Number::from(f as i64))
            }
            _ => Value::Number(n),
        },
        Value::Array(items) => Value::Array(items.into_iter().map(normalize).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, normalize(v)))
                .collect::<Map<String, Value>>(),
        ),
        other => other,
    }
}

/// Dotted field lookup. A key that itself contains dots is matched before
/// descending, so both `{"a.b": 1}` and `{"a": {"b": 1}}` answer `a.b`.
fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let object = value.as_object()?;
    if let Some(found) = object.get(path) {
        return Some(found);
    }
    path.match_indices('.').find_map(|(at, _)| {
        let (head, rest) = (&path[..at], &path[at + 1..]);
        object.get(head).and_then(|child| lookup(child, rest))
    })
}
