//! Declarative workflow definitions.
//!
//! A definition is a YAML or JSON document:
//!
//! ```yaml
//! name: quarterly-report
//! steps:
//!   - name: clean
//!     agentType: data_cleaning
//!     config: { drop_nulls: true }
//!   - name: stats
//!     agentType: statistics
//!     dependsOn: [clean]
//!     retry: { maxAttempts: 5, backoffBaseMs: 200 }
//!     timeoutMs: 30000
//!   - name: charts
//!     agentType: visualization
//!     dependsOn: [clean]
//!   - name: advice
//!     agentType: recommendation
//!     dependsOn: [stats, charts]
//! ```
//!
//! Both camelCase and snake_case keys are accepted.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, StepError};

/// Top-level workflow template. Immutable once loaded; reusable across runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(alias = "name")]
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
    /// Declaration order only; execution order comes from the dependency graph.
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: None,
            version: default_version(),
            steps: vec![],
        }
    }

    pub fn with_step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn step(&self, name: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn from_yaml_str(s: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(s)?)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    /// Load a definition file, choosing the format by extension.
    ///
    /// Unknown extensions are parsed as YAML, which also accepts JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&content),
            _ => Self::from_yaml_str(&content),
        }
    }
}

/// One named step of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    /// Registry key of the agent implementation.
    #[serde(alias = "agentType")]
    pub agent_type: String,
    /// Opaque configuration handed to the agent factory.
    #[serde(default = "default_config")]
    pub config: Value,
    /// Steps whose outputs must be available before this one runs.
    #[serde(default, alias = "dependsOn")]
    pub depends_on: Vec<String>,
    /// Overrides the orchestrator's default retry policy.
    #[serde(default, alias = "retryPolicy", alias = "retry_policy")]
    pub retry: Option<RetryPolicy>,
    /// Overrides the orchestrator's default per-attempt timeout.
    #[serde(default, alias = "timeoutMs", alias = "timeout")]
    pub timeout_ms: Option<u64>,
}

fn default_config() -> Value {
    Value::Object(serde_json::Map::new())
}

impl StepSpec {
    pub fn new(name: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            agent_type: agent_type.into(),
            config: default_config(),
            depends_on: vec![],
            retry: None,
            timeout_ms: None,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Which failures the retry policy re-attempts.
///
/// Timeouts are retried under every mode until attempts run out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryOn {
    /// Follow the `retryable` hint carried by the error.
    #[default]
    Hinted,
    /// Retry every agent failure.
    Always,
    /// Never retry agent failures.
    Never,
}

/// Retry behaviour for one step.
///
/// The delay before attempt `n + 1` is
/// `backoff_base * backoff_multiplier^(n - 1)`. Delays strictly increase
/// unless `max_backoff_ms` is set or `backoff_multiplier` is exactly 1.0,
/// which gives a constant delay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts", alias = "maxAttempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms", alias = "backoffBaseMs")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_multiplier", alias = "backoffMultiplier")]
    pub backoff_multiplier: f64,
    /// Upper bound on a single delay. Unbounded when absent.
    #[serde(default, alias = "maxBackoffMs")]
    pub max_backoff_ms: Option<u64>,
    #[serde(default, alias = "retryOn")]
    pub retry_on: RetryOn,
    /// Scale each delay by a random factor in 0.8..1.2.
    #[serde(default)]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 { 3 }
fn default_backoff_base_ms() -> u64 { 1000 }
fn default_backoff_multiplier() -> f64 { 2.0 }

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: None,
            retry_on: RetryOn::default(),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// A single attempt with no retries.
    pub fn no_retry() -> Self {
        Self::new(1)
    }

    pub fn with_backoff(mut self, base: Duration, multiplier: f64) -> Self {
        self.backoff_base_ms = base.as_millis() as u64;
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_max_backoff(mut self, max: Option<Duration>) -> Self {
        self.max_backoff_ms = max.map(|d| d.as_millis() as u64);
        self
    }

    pub fn with_retry_on(mut self, retry_on: RetryOn) -> Self {
        self.retry_on = retry_on;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    /// The retry predicate: whether `error` may be re-attempted at all.
    ///
    /// Attempt limits are enforced by the executor, not here.
    pub fn should_retry(&self, error: &StepError) -> bool {
        if error.is_timeout() {
            return true;
        }
        match error {
            StepError::Agent { retryable, .. } => match self.retry_on {
                RetryOn::Hinted => *retryable,
                RetryOn::Always => true,
                RetryOn::Never => false,
            },
            _ => false,
        }
    }

    /// Reject settings that cannot produce a sane schedule.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".into());
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(format!(
                "backoff_multiplier must be a finite number >= 1.0 (got {})",
                self.backoff_multiplier
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AgentError, FinflowError};
    use serde_json::json;

    const REPORT_YAML: &str = r#"
name: quarterly-report
description: Clean, analyse and chart a price series
steps:
  - name: clean
    agentType: data_cleaning
    config:
      drop_nulls: true
  - name: stats
    agentType: statistics
    dependsOn: [clean]
    retry:
      maxAttempts: 5
      backoffBaseMs: 200
      retryOn: always
    timeoutMs: 30000
  - name: charts
    agent_type: visualization
    depends_on: [clean]
  - name: advice
    agentType: recommendation
    dependsOn: [stats, charts]
"#;

    #[test]
    fn test_parse_yaml_definition() {
        let def = WorkflowDefinition::from_yaml_str(REPORT_YAML).unwrap();
        assert_eq!(def.id, "quarterly-report");
        assert_eq!(def.version, "1.0");
        assert_eq!(def.step_names(), vec!["clean", "stats", "charts", "advice"]);

        let clean = def.step("clean").unwrap();
        assert_eq!(clean.config, json!({"drop_nulls": true}));
        assert!(clean.depends_on.is_empty());
        assert!(clean.retry.is_none());

        let stats = def.step("stats").unwrap();
        let retry = stats.retry.as_ref().unwrap();
        assert_eq!(retry.max_attempts, 5);
        assert_eq!(retry.backoff_base_ms, 200);
        assert_eq!(retry.backoff_multiplier, 2.0);
        assert_eq!(retry.retry_on, RetryOn::Always);
        assert_eq!(retry.max_backoff_ms, None);
        assert_eq!(stats.timeout(), Some(Duration::from_secs(30)));

        let charts = def.step("charts").unwrap();
        assert_eq!(charts.agent_type, "visualization");
        assert_eq!(charts.depends_on, vec!["clean"]);
        assert_eq!(charts.config, json!({}));
    }

    #[test]
    fn test_parse_json_definition() {
        let def = WorkflowDefinition::from_json_str(
            r#"{"id": "wf", "steps": [{"name": "a", "agentType": "echo", "timeout": 50}]}"#,
        )
        .unwrap();
        assert_eq!(def.id, "wf");
        assert_eq!(def.steps[0].timeout_ms, Some(50));
    }

    #[test]
    fn test_load_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let yaml_path = dir.path().join("report.yaml");
        std::fs::write(&yaml_path, REPORT_YAML).unwrap();
        assert_eq!(WorkflowDefinition::load(&yaml_path).unwrap().steps.len(), 4);

        let json_path = dir.path().join("tiny.json");
        std::fs::write(&json_path, r#"{"name": "tiny", "steps": []}"#).unwrap();
        assert_eq!(WorkflowDefinition::load(&json_path).unwrap().id, "tiny");

        let missing = WorkflowDefinition::load(&dir.path().join("nope.yaml"));
        assert!(matches!(missing, Err(FinflowError::Io(_))));
    }

    #[test]
    fn test_builder() {
        let def = WorkflowDefinition::new("wf")
            .with_step(StepSpec::new("a", "echo"))
            .with_step(
                StepSpec::new("b", "echo")
                    .depends_on(["a"])
                    .with_retry(RetryPolicy::no_retry())
                    .with_timeout(Duration::from_millis(250)),
            );
        let b = def.step("b").unwrap();
        assert_eq!(b.depends_on, vec!["a"]);
        assert_eq!(b.retry.as_ref().unwrap().max_attempts, 1);
        assert_eq!(b.timeout_ms, Some(250));
    }

    #[test]
    fn test_retry_predicate() {
        let transient: StepError = AgentError::transient("503").into();
        let fatal: StepError = AgentError::fatal("bad schema").into();
        let timeout = StepError::Timeout { timeout_ms: 10 };

        let hinted = RetryPolicy::default();
        assert!(hinted.should_retry(&transient));
        assert!(!hinted.should_retry(&fatal));
        assert!(hinted.should_retry(&timeout));

        let always = RetryPolicy::default().with_retry_on(RetryOn::Always);
        assert!(always.should_retry(&fatal));

        let never = RetryPolicy::default().with_retry_on(RetryOn::Never);
        assert!(!never.should_retry(&transient));
        assert!(never.should_retry(&timeout));
        assert!(!never.should_retry(&StepError::Cancelled));
    }

    #[test]
    fn test_retry_policy_validation() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy::new(0).validate().is_err());
        assert!(RetryPolicy::default()
            .with_backoff(Duration::from_millis(10), 0.5)
            .validate()
            .is_err());
        assert!(RetryPolicy::default()
            .with_backoff(Duration::from_millis(10), f64::NAN)
            .validate()
            .is_err());
        assert!(RetryPolicy::default()
            .with_backoff(Duration::from_secs(5), 1.0)
            .with_max_backoff(None)
            .validate()
            .is_ok());
    }
}
