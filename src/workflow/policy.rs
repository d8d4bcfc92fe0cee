//! Declarative Node Policies
//!
//! Retry and wait configuration attached to individual nodes.
//!
//! # Example JSON
//!
//! ```json
//! {
//!   "retry": {
//!     "strategy": "untilCondition",
//!     "delay": 500,
//!     "delayStrategy": "exponential",
//!     "maxDelay": 4000,
//!     "timeout": 20000,
//!     "condition": { "kind": "elementVisible", "selector": "#dashboard" }
//!   },
//!   "waits": [
//!     { "timing": "after", "url": { "pattern": "/\\/home$/", "timeout": 5000 } }
//!   ]
//! }
//! ```

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default timeout for condition-based retries and individual waits.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_MS
}

/// How a retry loop decides to stop.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum RetryStrategy {
    /// Run up to `count + 1` times.
    #[default]
    Count,
    /// Run until the attached condition holds or the timeout elapses.
    UntilCondition,
}

/// How the pause between attempts grows.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum DelayStrategy {
    #[default]
    Fixed,
    Exponential,
}

/// Retry configuration for a node.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub strategy: RetryStrategy,

    /// Extra attempts after the first one (Count strategy)
    #[serde(default)]
    pub count: u32,

    /// Base delay between attempts in milliseconds
    #[serde(default, rename = "delay")]
    pub delay_ms: u64,

    #[serde(default)]
    pub delay_strategy: DelayStrategy,

    /// Upper bound for exponential delays in milliseconds
    #[serde(default, rename = "maxDelay", skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,

    /// Swallow the final failure instead of failing the node
    #[serde(default)]
    pub fail_silently: bool,

    /// Condition checked after every attempt (UntilCondition strategy)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,

    /// Overall budget for the UntilCondition strategy in milliseconds
    #[serde(default = "default_timeout", rename = "timeout")]
    pub timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: RetryStrategy::Count,
            count: 0,
            delay_ms: 0,
            delay_strategy: DelayStrategy::Fixed,
            max_delay_ms: None,
            fail_silently: false,
            condition: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl RetryPolicy {
    /// Count-based retry with a fixed delay.
    pub fn count(count: u32, delay_ms: u64) -> Self {
        Self {
            count,
            delay_ms,
            ..Self::default()
        }
    }

    /// Condition-based retry bounded by `timeout_ms`.
    pub fn until(condition: Condition, delay_ms: u64, timeout_ms: u64) -> Self {
        Self {
            strategy: RetryStrategy::UntilCondition,
            delay_ms,
            condition: Some(condition),
            timeout_ms,
            ..Self::default()
        }
    }

    /// Switches to exponential backoff.
    pub fn exponential(mut self) -> Self {
        self.delay_strategy = DelayStrategy::Exponential;
        self
    }

    /// Caps exponential delays.
    pub fn with_max_delay(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = Some(max_delay_ms);
        self
    }

    /// Makes final failures resolve to an empty result.
    pub fn silent(mut self) -> Self {
        self.fail_silently = true;
        self
    }

    /// Disables retrying while keeping the silent flag meaningful.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Delay before retry number `attempt` (1-based).
    ///
    /// Fixed: `delay`. Exponential: `delay * 2^(attempt-1)`, capped at
    /// `maxDelay` when set.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.delay_ms;
        let millis = match self.delay_strategy {
            DelayStrategy::Fixed => base,
            DelayStrategy::Exponential => {
                let exponent = attempt.saturating_sub(1).min(63);
                let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
                let grown = base.saturating_mul(factor);
                match self.max_delay_ms {
                    Some(cap) if cap > 0 => grown.min(cap),
                    _ => grown,
                }
            }
        };
        Duration::from_millis(millis)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Operator used to compare a JSON-path value with the expected text.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum MatchOperator {
    #[default]
    Equals,
    Contains,
    StartsWith,
    EndsWith,
    Regex,
}

impl fmt::Display for MatchOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Equals => "equals",
            Self::Contains => "contains",
            Self::StartsWith => "startsWith",
            Self::EndsWith => "endsWith",
            Self::Regex => "regex",
        };
        write!(f, "{}", name)
    }
}

/// A boolean check against the live session or an API response.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Condition {
    /// Element matching the selector is visible
    ElementVisible { selector: String },
    /// Element matching the selector is absent or hidden
    ElementHidden { selector: String },
    /// Current URL matches; `/.../` is a regex, anything else a literal substring
    UrlMatches { pattern: String },
    /// In-session script returning a boolean
    Script { script: String },
    /// API response status code equals
    ApiStatus { status: u16 },
    /// Value at a JSON path of the API response body matches
    ApiJsonPath {
        path: String,
        #[serde(default)]
        operator: MatchOperator,
        expected: String,
    },
    /// Script predicate evaluated with the API response as argument
    ApiScript { script: String },
}

impl Condition {
    /// Whether the condition reads an API response rather than the page.
    pub fn needs_api_response(&self) -> bool {
        matches!(
            self,
            Self::ApiStatus { .. } | Self::ApiJsonPath { .. } | Self::ApiScript { .. }
        )
    }
}

/// Whether a wait runs before or after the node's handler.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum WaitTiming {
    #[default]
    Before,
    After,
}

impl fmt::Display for WaitTiming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Before => write!(f, "before"),
            Self::After => write!(f, "after"),
        }
    }
}

/// How multiple waits in one spec are scheduled.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum WaitStrategy {
    #[default]
    Parallel,
    Sequential,
}

/// Element state a selector wait expects.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ElementState {
    #[default]
    Visible,
    Hidden,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SelectorWait {
    pub selector: String,
    #[serde(default)]
    pub state: ElementState,
    #[serde(default = "default_timeout", rename = "timeout")]
    pub timeout_ms: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UrlWait {
    pub pattern: String,
    #[serde(default = "default_timeout", rename = "timeout")]
    pub timeout_ms: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScriptWait {
    pub script: String,
    #[serde(default = "default_timeout", rename = "timeout")]
    pub timeout_ms: u64,
}

/// Timed waits executed around a node.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct WaitSpec {
    #[serde(default)]
    pub timing: WaitTiming,

    #[serde(default)]
    pub strategy: WaitStrategy,

    #[serde(default)]
    pub fail_silently: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<SelectorWait>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<UrlWait>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<ScriptWait>,
}

impl WaitSpec {
    pub fn before() -> Self {
        Self::default()
    }

    pub fn after() -> Self {
        Self {
            timing: WaitTiming::After,
            ..Self::default()
        }
    }

    pub fn with_selector(mut self, selector: impl Into<String>, timeout_ms: u64) -> Self {
        self.selector = Some(SelectorWait {
            selector: selector.into(),
            state: ElementState::Visible,
            timeout_ms,
        });
        self
    }

    pub fn with_hidden_selector(mut self, selector: impl Into<String>, timeout_ms: u64) -> Self {
        self.selector = Some(SelectorWait {
            selector: selector.into(),
            state: ElementState::Hidden,
            timeout_ms,
        });
        self
    }

    pub fn with_url(mut self, pattern: impl Into<String>, timeout_ms: u64) -> Self {
        self.url = Some(UrlWait {
            pattern: pattern.into(),
            timeout_ms,
        });
        self
    }

    pub fn with_script(mut self, script: impl Into<String>, timeout_ms: u64) -> Self {
        self.script = Some(ScriptWait {
            script: script.into(),
            timeout_ms,
        });
        self
    }

    pub fn sequential(mut self) -> Self {
        self.strategy = WaitStrategy::Sequential;
        self
    }

    pub fn silent(mut self) -> Self {
        self.fail_silently = true;
        self
    }

    /// True when no wait kind is declared.
    pub fn is_empty(&self) -> bool {
        self.selector.is_none() && self.url.is_none() && self.script.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_delay_is_constant() {
        let policy = RetryPolicy::count(2, 50);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(50));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(50));
    }

    #[test]
    fn test_exponential_delay_doubles() {
        let policy = RetryPolicy::count(3, 100).exponential();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn test_exponential_delay_respects_cap() {
        let policy = RetryPolicy::count(5, 100).exponential().with_max_delay(250);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(250));
    }

    #[test]
    fn test_exponential_delay_saturates() {
        let policy = RetryPolicy::count(100, u64::MAX / 2).exponential();
        assert_eq!(policy.delay_for_attempt(90), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_retry_policy_from_json() {
        let json = r#"{
            "count": 2,
            "delay": 50,
            "failSilently": true
        }"#;
        let policy: RetryPolicy = serde_json::from_str(json).unwrap();

        assert!(policy.enabled);
        assert_eq!(policy.strategy, RetryStrategy::Count);
        assert_eq!(policy.count, 2);
        assert_eq!(policy.delay_ms, 50);
        assert!(policy.fail_silently);
        assert_eq!(policy.timeout_ms, DEFAULT_TIMEOUT_MS);
    }

    #[test]
    fn test_condition_from_json() {
        let json = r#"{ "kind": "apiJsonPath", "path": "data.state", "operator": "startsWith", "expected": "done" }"#;
        let condition: Condition = serde_json::from_str(json).unwrap();

        assert_eq!(
            condition,
            Condition::ApiJsonPath {
                path: "data.state".to_string(),
                operator: MatchOperator::StartsWith,
                expected: "done".to_string(),
            }
        );
        assert!(condition.needs_api_response());
    }

    #[test]
    fn test_wait_spec_defaults() {
        let spec: WaitSpec =
            serde_json::from_str(r##"{ "selector": { "selector": "#ok" } }"##).unwrap();

        assert_eq!(spec.timing, WaitTiming::Before);
        assert_eq!(spec.strategy, WaitStrategy::Parallel);
        assert_eq!(spec.selector.as_ref().unwrap().timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(spec.selector.as_ref().unwrap().state, ElementState::Visible);
        assert!(!spec.is_empty());
        assert!(WaitSpec::after().is_empty());
    }

    #[test]
    fn test_wait_timing_display() {
        assert_eq!(WaitTiming::Before.to_string(), "before");
        assert_eq!(WaitTiming::After.to_string(), "after");
    }
}
