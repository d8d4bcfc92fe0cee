//! Condition Evaluator
//!
//! Evaluates a [`Condition`] against the live session or a step's API
//! response. Every check yields a [`ConditionCheck`] with a diagnostic
//! string for trace logging; session errors count as "not met" so polling
//! loops keep going.

use log::info;
use regex::Regex;
use serde_json::Value;

use crate::automation::AutomationSession;
use crate::workflow::{Condition, MatchOperator};

use super::TRACE_TARGET;

/// Result of one condition evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionCheck {
    pub met: bool,
    pub detail: String,
}

impl ConditionCheck {
    fn new(met: bool, detail: impl Into<String>) -> Self {
        Self {
            met,
            detail: detail.into(),
        }
    }
}

/// Compiles a URL pattern: `/.../` is a regex, anything else matches as a
/// literal substring.
pub fn url_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    if pattern.len() >= 2 && pattern.starts_with('/') && pattern.ends_with('/') {
        Regex::new(&pattern[1..pattern.len() - 1])
    } else {
        Regex::new(&regex::escape(pattern))
    }
}

/// Walks a dotted path with optional `[i]` indices, e.g. `$.data.items[0].id`.
pub fn json_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim();
    let path = path
        .strip_prefix("$.")
        .or_else(|| path.strip_prefix('$'))
        .unwrap_or(path);

    let mut current = value;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        let mut parts = segment.split('[');
        let key = parts.next().unwrap_or_default();
        if !key.is_empty() {
            current = current.get(key)?;
        }
        for index in parts {
            let index: usize = index.strip_suffix(']')?.trim().parse().ok()?;
            current = current.get(index)?;
        }
    }
    Some(current)
}

/// Status code and body of an API step result.
///
/// Handlers return `{ "status": 200, "body": ... }`; a result without a
/// `body` (or `data`) field is treated as the body itself.
#[derive(Debug, Clone, Copy)]
pub struct ApiResponse<'a> {
    pub status: Option<u16>,
    pub body: &'a Value,
}

impl<'a> ApiResponse<'a> {
    pub fn from_value(value: &'a Value) -> Self {
        let status = value
            .get("status")
            .and_then(Value::as_u64)
            .and_then(|s| u16::try_from(s).ok());
        let body = value
            .get("body")
            .or_else(|| value.get("data"))
            .unwrap_or(value);
        Self { status, body }
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn compare(actual: &str, operator: MatchOperator, expected: &str) -> Result<bool, String> {
    Ok(match operator {
        MatchOperator::Equals => actual == expected,
        MatchOperator::Contains => actual.contains(expected),
        MatchOperator::StartsWith => actual.starts_with(expected),
        MatchOperator::EndsWith => actual.ends_with(expected),
        MatchOperator::Regex => Regex::new(expected)
            .map_err(|e| format!("invalid regex '{}': {}", expected, e))?
            .is_match(actual),
    })
}

/// Evaluates conditions for one execution.
pub struct ConditionEvaluator<'a> {
    session: &'a dyn AutomationSession,
    trace: bool,
}

impl<'a> ConditionEvaluator<'a> {
    pub fn new(session: &'a dyn AutomationSession) -> Self {
        Self {
            session,
            trace: false,
        }
    }

    /// Emits every check under the trace log target.
    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    /// Evaluates `condition`; `response` is the latest API step result.
    pub async fn evaluate(&self, condition: &Condition, response: Option<&Value>) -> ConditionCheck {
        let check = match (condition.needs_api_response(), response) {
            (true, Some(value)) => self.api(condition, ApiResponse::from_value(value)).await,
            (true, None) => ConditionCheck::new(false, "no API response available"),
            (false, _) => self.page(condition).await,
        };

        if self.trace {
            info!(
                target: TRACE_TARGET,
                "condition {:?}: met={} ({})", condition, check.met, check.detail
            );
        }
        check
    }

    async fn page(&self, condition: &Condition) -> ConditionCheck {
        match condition {
            Condition::ElementVisible { selector } => self.element(selector, true).await,
            Condition::ElementHidden { selector } => self.element(selector, false).await,
            Condition::UrlMatches { pattern } => self.url(pattern).await,
            Condition::Script { script } => match self.session.evaluate_predicate(script, None).await {
                Ok(met) => ConditionCheck::new(met, format!("script returned {}", met)),
                Err(e) => ConditionCheck::new(false, format!("script failed: {}", e)),
            },
            _ => ConditionCheck::new(false, "not a page condition"),
        }
    }

    async fn element(&self, selector: &str, want_visible: bool) -> ConditionCheck {
        match self.session.is_element_visible(selector).await {
            Ok(visible) => {
                let state = if visible { "visible" } else { "hidden" };
                ConditionCheck::new(visible == want_visible, format!("'{}' is {}", selector, state))
            }
            Err(e) => ConditionCheck::new(false, format!("lookup of '{}' failed: {}", selector, e)),
        }
    }

    async fn url(&self, pattern: &str) -> ConditionCheck {
        let regex = match url_pattern(pattern) {
            Ok(regex) => regex,
            Err(e) => return ConditionCheck::new(false, format!("invalid URL pattern '{}': {}", pattern, e)),
        };
        match self.session.current_url().await {
            Ok(url) => {
                let met = regex.is_match(&url);
                ConditionCheck::new(met, format!("url '{}' vs '{}'", url, pattern))
            }
            Err(e) => ConditionCheck::new(false, format!("could not read URL: {}", e)),
        }
    }

    async fn api(&self, condition: &Condition, response: ApiResponse<'_>) -> ConditionCheck {
        match condition {
            Condition::ApiStatus { status } => match response.status {
                Some(actual) => ConditionCheck::new(
                    actual == *status,
                    format!("status {} (expected {})", actual, status),
                ),
                None => ConditionCheck::new(false, "response has no status"),
            },
            Condition::ApiJsonPath {
                path,
                operator,
                expected,
            } => match json_path(response.body, path) {
                Some(value) => {
                    let actual = value_text(value);
                    match compare(&actual, *operator, expected) {
                        Ok(met) => ConditionCheck::new(
                            met,
                            format!("{} = '{}' {} '{}'", path, actual, operator, expected),
                        ),
                        Err(detail) => ConditionCheck::new(false, detail),
                    }
                }
                None => ConditionCheck::new(false, format!("path '{}' not found", path)),
            },
            Condition::ApiScript { script } => {
                match self.session.evaluate_predicate(script, Some(response.body)).await {
                    Ok(met) => ConditionCheck::new(met, format!("response script returned {}", met)),
                    Err(e) => ConditionCheck::new(false, format!("response script failed: {}", e)),
                }
            }
            _ => ConditionCheck::new(false, "not an API condition"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeSession;
    use serde_json::json;

    #[test]
    fn test_url_pattern_literal_and_regex() {
        let literal = url_pattern("/checkout?step=2").unwrap();
        assert!(literal.is_match("https://shop.test/checkout?step=2"));
        assert!(!literal.is_match("https://shop.test/checkout?step=3"));

        let regex = url_pattern(r"//orders/\d+$/").unwrap();
        assert!(regex.is_match("https://shop.test/orders/42"));
        assert!(!regex.is_match("https://shop.test/orders/new"));

        assert!(url_pattern("/(/").is_err());
    }

    #[test]
    fn test_json_path() {
        let body = json!({ "data": { "items": [ { "id": 7 }, { "id": 9 } ] }, "ok": true });

        assert_eq!(json_path(&body, "$.data.items[1].id"), Some(&json!(9)));
        assert_eq!(json_path(&body, "ok"), Some(&json!(true)));
        assert_eq!(json_path(&body, "$"), Some(&body));
        assert_eq!(json_path(&body, "data.items[5]"), None);
        assert_eq!(json_path(&body, "data.items[x]"), None);
    }

    #[test]
    fn test_api_response_shapes() {
        let wrapped = json!({ "status": 201, "body": { "id": 1 } });
        let response = ApiResponse::from_value(&wrapped);
        assert_eq!(response.status, Some(201));
        assert_eq!(response.body, &json!({ "id": 1 }));

        let bare = json!({ "id": 1 });
        let response = ApiResponse::from_value(&bare);
        assert_eq!(response.status, None);
        assert_eq!(response.body, &bare);
    }

    #[tokio::test]
    async fn test_element_conditions() {
        let session = FakeSession::new();
        session.set_visible("#ready", true);
        let evaluator = ConditionEvaluator::new(&session);

        let visible = Condition::ElementVisible { selector: "#ready".into() };
        let hidden = Condition::ElementHidden { selector: "#spinner".into() };

        assert!(evaluator.evaluate(&visible, None).await.met);
        let check = evaluator.evaluate(&hidden, None).await;
        assert!(check.met);
        assert!(check.detail.contains("hidden"));
    }

    #[tokio::test]
    async fn test_url_condition() {
        let session = FakeSession::new();
        session.set_url("https://app.test/dashboard");
        let evaluator = ConditionEvaluator::new(&session);

        let met = Condition::UrlMatches { pattern: "/dashboard".into() };
        let unmet = Condition::UrlMatches { pattern: "/^https://other/".into() };

        assert!(evaluator.evaluate(&met, None).await.met);
        assert!(!evaluator.evaluate(&unmet, None).await.met);
    }

    #[tokio::test]
    async fn test_script_condition_error_is_not_met() {
        let session = FakeSession::new();
        session.set_script("ready()", true);
        let evaluator = ConditionEvaluator::new(&session);

        let ok = Condition::Script { script: "ready()".into() };
        let broken = Condition::Script { script: "throw()".into() };

        assert!(evaluator.evaluate(&ok, None).await.met);
        let check = evaluator.evaluate(&broken, None).await;
        assert!(!check.met);
        assert!(check.detail.contains("failed"));
    }

    #[tokio::test]
    async fn test_dispatch_by_condition_source() {
        let session = FakeSession::new();
        session.set_visible("#ready", true);
        let evaluator = ConditionEvaluator::new(&session);
        let response = json!({ "status": 500 });

        let page = Condition::ElementVisible { selector: "#ready".into() };
        assert!(evaluator.evaluate(&page, Some(&response)).await.met);

        let api = Condition::ApiScript { script: "ok".into() };
        let check = evaluator.evaluate(&api, None).await;
        assert!(!check.met);
        assert_eq!(check.detail, "no API response available");
    }

    #[tokio::test]
    async fn test_api_conditions() {
        let session = FakeSession::new();
        let evaluator = ConditionEvaluator::new(&session);
        let response = json!({ "status": 200, "body": { "state": "DONE-42" } });

        let status = Condition::ApiStatus { status: 200 };
        assert!(evaluator.evaluate(&status, Some(&response)).await.met);
        assert!(!evaluator.evaluate(&status, None).await.met);

        for (operator, expected, met) in [
            (MatchOperator::Equals, "DONE-42", true),
            (MatchOperator::Contains, "NE-4", true),
            (MatchOperator::StartsWith, "DONE", true),
            (MatchOperator::EndsWith, "41", false),
            (MatchOperator::Regex, r"^DONE-\d+$", true),
            (MatchOperator::Regex, "(", false),
        ] {
            let condition = Condition::ApiJsonPath {
                path: "$.state".into(),
                operator,
                expected: expected.into(),
            };
            assert_eq!(
                evaluator.evaluate(&condition, Some(&response)).await.met,
                met,
                "{} {}",
                operator,
                expected
            );
        }
    }
}
