//! Response validation.
//!
//! A [`Validator`] runs its checks in order and stops at the first failure.

use std::collections::BTreeMap;
use std::fmt;

use hyper::Response;
use hyper::header::{HeaderName, HeaderValue};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use super::condition::{Condition, ConditionConfig, ConditionError, normalize};
use super::expr::{ExprError, Expression};

/// `check.response`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseCheckConfig {
    #[serde(default)]
    pub status: Vec<u16>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Vec<String>,
    #[serde(default)]
    pub json: Vec<JsonCheckConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonCheckConfig {
    #[serde(default)]
    pub description: String,
    pub expression: Option<String>,
    pub condition: Option<ConditionConfig>,
}

#[derive(Error, Debug)]
pub enum CheckConfigError {
    #[error("invalid header name {0}")]
    HeaderName(String),
    #[error("invalid value for header {0}")]
    HeaderValue(String),
    #[error("invalid body pattern {pattern:?}: {source}")]
    BodyPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("json check '{0}': only one of expression or condition may be set")]
    ExpressionAndCondition(String),
    #[error("json check '{0}': one of expression or condition is required")]
    MissingJsonCheck(String),
    #[error("json check '{description}': {source}")]
    Expression {
        description: String,
        #[source]
        source: ExprError,
    },
    #[error("json check '{description}': {source}")]
    Condition {
        description: String,
        #[source]
        source: ConditionError,
    },
}

/// A failed check. The message names the check that failed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidateError {
    #[error("received status code {received} expecting {expected}")]
    Status { received: u16, expected: String },
    #[error("header {name} has value {actual:?}, expected {expected:?}")]
    Header {
        name: String,
        expected: String,
        actual: Option<String>,
    },
    #[error("body did not match any of the configured patterns")]
    Body,
    #[error("could not parse JSON body: {0}")]
    JsonDecode(String),
    #[error("JSON body did not match {kind} '{description}'")]
    Json {
        kind: &'static str,
        description: String,
    },
    #[error("JSON expression '{description}' could not be evaluated: {message}")]
    JsonEval {
        description: String,
        message: String,
    },
}

/// A single pass/fail predicate over a buffered response.
pub trait ResponseCheck: Send + Sync + fmt::Debug {
    fn check(&self, response: &Response<Vec<u8>>) -> Result<(), ValidateError>;
}

#[derive(Debug, Default)]
pub struct Validator {
    checks: Vec<Box<dyn ResponseCheck>>,
}

impl Validator {
    pub fn new(config: &ResponseCheckConfig) -> Result<Self, CheckConfigError> {
        let mut checks: Vec<Box<dyn ResponseCheck>> = vec![Box::new(StatusCheck {
            expected: config.status.clone(),
        })];

        if !config.headers.is_empty() {
            checks.push(Box::new(HeaderCheck::new(&config.headers)?));
        }
        if !config.body.is_empty() {
            checks.push(Box::new(BodyCheck::new(&config.body)?));
        }
        if !config.json.is_empty() {
            checks.push(Box::new(JsonCheck::new(&config.json)?));
        }

        Ok(Validator { checks })
    }

    pub fn from_checks(checks: Vec<Box<dyn ResponseCheck>>) -> Self {
        Validator { checks }
    }

    pub fn validate(&self, response: &Response<Vec<u8>>) -> Result<(), ValidateError> {
        self.checks.iter().try_for_each(|c| c.check(response))
    }
}

/// Exact status codes when configured, otherwise anything below 400.
#[derive(Debug)]
pub struct StatusCheck {
    expected: Vec<u16>,
}

impl ResponseCheck for StatusCheck {
    fn check(&self, response: &Response<Vec<u8>>) -> Result<(), ValidateError> {
        let received = response.status().as_u16();
        if self.expected.is_empty() {
            if received < 400 {
                return Ok(());
            }
            return Err(ValidateError::Status {
                received,
                expected: "< 400".to_string(),
            });
        }
        if self.expected.contains(&received) {
            Ok(())
        } else {
            Err(ValidateError::Status {
                received,
                expected: format!("{:?}", self.expected),
            })
        }
    }
}

#[derive(Debug)]
pub struct HeaderCheck {
    expected: Vec<(HeaderName, HeaderValue)>,
}

impl HeaderCheck {
    fn new(headers: &BTreeMap<String, String>) -> Result<Self, CheckConfigError> {
        let expected = headers
            .iter()
            .map(|(name, value)| {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|_| CheckConfigError::HeaderName(name.clone()))?;
                let value = HeaderValue::from_str(value)
                    .map_err(|_| CheckConfigError::HeaderValue(name.to_string()))?;
                Ok((name, value))
            })
            .collect::<Result<_, CheckConfigError>>()?;
        Ok(HeaderCheck { expected })
    }
}

impl ResponseCheck for HeaderCheck {
    fn check(&self, response: &Response<Vec<u8>>) -> Result<(), ValidateError> {
        for (name, value) in &self.expected {
            let present = response.headers().get_all(name);
            if present.iter().any(|v| v == value) {
                continue;
            }
            return Err(ValidateError::Header {
                name: name.to_string(),
                expected: value.to_str().unwrap_or_default().to_string(),
                actual: present
                    .iter()
                    .next()
                    .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned()),
            });
        }
        Ok(())
    }
}

/// Passes when any pattern matches.
#[derive(Debug)]
pub struct BodyCheck {
    patterns: Vec<Regex>,
}

impl BodyCheck {
    fn new(patterns: &[String]) -> Result<Self, CheckConfigError> {
        let patterns = patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|source| CheckConfigError::BodyPattern {
                    pattern: p.clone(),
                    source,
                })
            })
            .collect::<Result<_, _>>()?;
        Ok(BodyCheck { patterns })
    }
}

impl ResponseCheck for BodyCheck {
    fn check(&self, response: &Response<Vec<u8>>) -> Result<(), ValidateError> {
        let body = String::from_utf8_lossy(response.body());
        if self.patterns.iter().any(|re| re.is_match(&body)) {
            Ok(())
        } else {
            Err(ValidateError::Body)
        }
    }
}

#[derive(Debug)]
enum JsonRule {
    Expression(Expression),
    Condition(Condition),
}

#[derive(Debug)]
pub struct JsonCheck {
    rules: Vec<(String, JsonRule)>,
    has_expressions: bool,
    has_conditions: bool,
}

impl JsonCheck {
    fn new(configs: &[JsonCheckConfig]) -> Result<Self, CheckConfigError> {
        let mut rules = Vec::with_capacity(configs.len());
        for config in configs {
            let description = config.description.clone();
            let rule = match (&config.expression, &config.condition) {
                (Some(_), Some(_)) => {
                    return Err(CheckConfigError::ExpressionAndCondition(description));
                }
                (None, None) => return Err(CheckConfigError::MissingJsonCheck(description)),
                (Some(source), None) => JsonRule::Expression(Expression::parse(source).map_err(
                    |source| CheckConfigError::Expression {
                        description: description.clone(),
                        source,
                    },
                )?),
                (None, Some(condition)) => JsonRule::Condition(Condition::new(condition).map_err(
                    |source| CheckConfigError::Condition {
                        description: description.clone(),
                        source,
                    },
                )?),
            };
            rules.push((description, rule));
        }

        let has_expressions = rules
            .iter()
            .any(|(_, r)| matches!(r, JsonRule::Expression(_)));
        let has_conditions = rules
            .iter()
            .any(|(_, r)| matches!(r, JsonRule::Condition(_)));
        Ok(JsonCheck {
            rules,
            has_expressions,
            has_conditions,
        })
    }
}

impl ResponseCheck for JsonCheck {
    fn check(&self, response: &Response<Vec<u8>>) -> Result<(), ValidateError> {
        let decode = || {
            serde_json::from_slice::<Value>(response.body())
                .map_err(|e| ValidateError::JsonDecode(e.to_string()))
        };
        // Each engine gets its own decoding of the body.
        let for_expressions = if self.has_expressions {
            Some(decode()?)
        } else {
            None
        };
        let for_conditions = if self.has_conditions {
            Some(normalize(decode()?))
        } else {
            None
        };

        for (description, rule) in &self.rules {
            match rule {
                JsonRule::Expression(expression) => {
                    let Some(document) = &for_expressions else {
                        continue;
                    };
                    let label = if description.is_empty() {
                        expression.source().to_string()
                    } else {
                        description.clone()
                    };
                    match expression.evaluate_bool(document) {
                        Ok(true) => {}
                        Ok(false) => {
                            return Err(ValidateError::Json {
                                kind: "expression",
                                description: label,
                            });
                        }
                        Err(e) => {
                            log::warn!("json expression '{expression}' failed to evaluate: {e}");
                            return Err(ValidateError::JsonEval {
                                description: label,
                                message: e.to_string(),
                            });
                        }
                    }
                }
                JsonRule::Condition(condition) => {
                    let Some(document) = &for_conditions else {
                        continue;
                    };
                    if !condition.check(document) {
                        return Err(ValidateError::Json {
                            kind: "condition",
                            description: description.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn response(status: u16, headers: &[(&str, &str)], body: &str) -> Response<Vec<u8>> {
        let mut builder = Response::builder().status(status);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(body.as_bytes().to_vec()).unwrap()
    }

    fn validator(yaml: &str) -> Validator {
        let config: ResponseCheckConfig = serde_yaml::from_str(yaml).unwrap();
        Validator::new(&config).unwrap()
    }

    #[test]
    fn default_status_rejects_errors() {
        let v = Validator::new(&ResponseCheckConfig::default()).unwrap();
        assert!(v.validate(&response(200, &[], "")).is_ok());
        assert!(v.validate(&response(302, &[], "")).is_ok());
        assert_eq!(
            v.validate(&response(503, &[], "")).unwrap_err().to_string(),
            "received status code 503 expecting < 400"
        );
    }

    #[test]
    fn configured_status_list() {
        let v = validator("status: [200, 404]");
        assert!(v.validate(&response(404, &[], "")).is_ok());
        assert!(matches!(
            v.validate(&response(201, &[], "")),
            Err(ValidateError::Status { received: 201, .. })
        ));
    }

    #[test]
    fn header_and_body_checks() {
        let v = validator(
            r#"
headers: {Content-Type: application/json}
body: ["^ok$", "healthy"]
"#,
        );
        let ok = response(200, &[("content-type", "application/json")], "all healthy");
        assert!(v.validate(&ok).is_ok());

        let wrong_body = response(200, &[("content-type", "application/json")], "broken");
        assert_eq!(v.validate(&wrong_body), Err(ValidateError::Body));

        let wrong_header = response(200, &[("content-type", "text/plain")], "ok");
        assert_eq!(
            v.validate(&wrong_header),
            Err(ValidateError::Header {
                name: "content-type".into(),
                expected: "application/json".into(),
                actual: Some("text/plain".into()),
            })
        );
    }

    #[derive(Debug)]
    struct Counting {
        inner: Box<dyn ResponseCheck>,
        calls: Arc<AtomicUsize>,
    }

    impl ResponseCheck for Counting {
        fn check(&self, response: &Response<Vec<u8>>) -> Result<(), ValidateError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.check(response)
        }
    }

    #[test]
    fn stops_at_first_failing_check() {
        let counters: Vec<Arc<AtomicUsize>> = (0..3).map(|_| Arc::default()).collect();
        let mut headers = BTreeMap::new();
        headers.insert("x-ready".to_string(), "yes".to_string());
        let inner: Vec<Box<dyn ResponseCheck>> = vec![
            Box::new(StatusCheck { expected: vec![200] }),
            Box::new(HeaderCheck::new(&headers).unwrap()),
            Box::new(BodyCheck::new(&["never-present".to_string()]).unwrap()),
        ];
        let checks = inner
            .into_iter()
            .zip(&counters)
            .map(|(inner, calls)| {
                Box::new(Counting {
                    inner,
                    calls: calls.clone(),
                }) as Box<dyn ResponseCheck>
            })
            .collect();
        let v = Validator::from_checks(checks);

        let err = v
            .validate(&response(200, &[("x-ready", "no")], "body"))
            .unwrap_err();
        assert!(matches!(err, ValidateError::Header { .. }));
        let calls: Vec<usize> = counters.iter().map(|c| c.load(Ordering::SeqCst)).collect();
        assert_eq!(calls, vec![1, 1, 0]);
    }

    #[test]
    fn json_expression_check() {
        let v = validator(
            r#"
json:
  - description: foo and bar
    expression: 'foo == "hi" && bar == 3'
"#,
        );
        assert!(v.validate(&response(200, &[], r#"{"foo":"hi","bar":3}"#)).is_ok());

        let v = validator(
            r#"
json:
  - description: bar is large
    expression: 'bar == 1000'
"#,
        );
        let err = v
            .validate(&response(200, &[], r#"{"foo":"hi","bar":3}"#))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "JSON body did not match expression 'bar is large'"
        );
    }

    #[test]
    fn json_expression_errors_fail_the_check() {
        let v = validator("json: [{expression: 'missing.field == 1'}]");
        assert!(matches!(
            v.validate(&response(200, &[], r#"{"foo":1}"#)),
            Err(ValidateError::JsonEval { .. })
        ));
        assert!(matches!(
            v.validate(&response(200, &[], "not json")),
            Err(ValidateError::JsonDecode(_))
        ));
    }

    #[test]
    fn json_condition_check() {
        let v = validator(
            r#"
json:
  - description: healthy
    condition: {equals: {status: up, replicas: 3}}
"#,
        );
        assert!(v
            .validate(&response(200, &[], r#"{"status":"up","replicas":3.0}"#))
            .is_ok());
        assert_eq!(
            v.validate(&response(200, &[], r#"{"status":"down","replicas":3}"#)),
            Err(ValidateError::Json {
                kind: "condition",
                description: "healthy".into(),
            })
        );
    }

    #[test]
    fn configuration_errors() {
        let both: ResponseCheckConfig = serde_yaml::from_str(
            r#"
json:
  - description: both
    expression: 'a == 1'
    condition: {equals: {a: 1}}
"#,
        )
        .unwrap();
        assert!(matches!(
            Validator::new(&both),
            Err(CheckConfigError::ExpressionAndCondition(_))
        ));

        let neither: ResponseCheckConfig =
            serde_yaml::from_str("json: [{description: empty}]").unwrap();
        assert!(matches!(
            Validator::new(&neither),
            Err(CheckConfigError::MissingJsonCheck(_))
        ));

        let bad_expr: ResponseCheckConfig =
            serde_yaml::from_str("json: [{expression: 'a =='}]").unwrap();
        assert!(matches!(
            Validator::new(&bad_expr),
            Err(CheckConfigError::Expression { .. })
        ));

        let bad_regex: ResponseCheckConfig = serde_yaml::from_str("body: ['(']").unwrap();
        assert!(matches!(
            Validator::new(&bad_regex),
            Err(CheckConfigError::BodyPattern { .. })
        ));
    }
}
