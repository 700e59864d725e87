// src/models.rs

//! Shared data types that flow between the engine, the job worker and the CLI.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// --- Command chain ---

/// One parsed token of a command chain (`"AI2"` -> code `AI`, index 2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandStep {
    /// Upper-cased letters and underscores of the token.
    pub code: String,
    /// Occurrence index for the operation's parameter records.
    pub index: usize,
    /// The token exactly as written, used when calling user functions.
    pub token: String,
}

/// Result of a single executed step, as returned by the engine and
/// serialized to JSON for the job worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// Upper-cased command code.
    pub cmd: String,
    /// Success status of the step.
    pub value: bool,
    /// Optional output payload, usually a dataset path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Set for the implicit `_OnStart`/`_OnExit` steps.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub event: bool,
}

impl StepResult {
    pub fn new(cmd: impl Into<String>, value: bool, output: Option<Value>) -> Self {
        Self {
            cmd: cmd.into(),
            value,
            output,
            event: false,
        }
    }

    pub fn as_event(mut self) -> Self {
        self.event = true;
        self
    }
}

/// What a handler or user function hands back to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Plain success flag.
    Bool(bool),
    /// Status with an optional payload and an optional replacement chain.
    Structured {
        status: bool,
        output: Option<Value>,
        /// Raw `response` object a user function handed back, if any.
        response: Option<Value>,
        upd_chain: Option<Vec<String>>,
    },
}

impl StepOutcome {
    pub fn ok() -> Self {
        Self::Bool(true)
    }

    pub fn failed() -> Self {
        Self::Bool(false)
    }

    pub fn from_status(status: bool) -> Self {
        Self::Bool(status)
    }

    pub fn with_output(self, output: impl Into<Value>) -> Self {
        match self {
            Self::Bool(status) => Self::Structured {
                status,
                output: Some(output.into()),
                response: None,
                upd_chain: None,
            },
            Self::Structured {
                status,
                response,
                upd_chain,
                ..
            } => Self::Structured {
                status,
                output: Some(output.into()),
                response,
                upd_chain,
            },
        }
    }

    pub fn status(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Structured { status, .. } => *status,
        }
    }

    pub fn output(&self) -> Option<&Value> {
        match self {
            Self::Bool(_) => None,
            Self::Structured { output, .. } => output.as_ref(),
        }
    }

    pub fn upd_chain(&self) -> Option<&[String]> {
        match self {
            Self::Bool(_) => None,
            Self::Structured { upd_chain, .. } => upd_chain.as_deref(),
        }
    }

    /// Interprets a loosely-typed return value.
    ///
    /// A boolean is the status itself. An object may carry `status`, `output`
    /// and `upd_chain`; when it carries a non-empty `response` object, that
    /// object is read instead.
    pub fn from_value(value: &Value) -> Self {
        let outer = match value {
            Value::Bool(b) => return Self::Bool(*b),
            Value::Object(map) => map,
            other => return Self::Bool(get_boolean_value(Some(other))),
        };
        let response = match outer.get("response") {
            Some(Value::Object(inner)) if !inner.is_empty() => Some(inner),
            _ => None,
        };
        let map = response.unwrap_or(outer);
        let upd_chain = match map.get("upd_chain") {
            Some(Value::Array(items)) => Some(
                items
                    .iter()
                    .map(|item| match item {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect(),
            ),
            _ => None,
        };
        Self::Structured {
            status: get_boolean_value(map.get("status")),
            output: map.get("output").cloned(),
            response: response.map(|r| Value::Object(r.clone())),
            upd_chain,
        }
    }
}

/// Loose truthiness used for config values and returned statuses.
///
/// Absent or null is false, booleans are themselves, anything else is
/// stringified and compared (case-insensitive) against `true`, `yes`, `t`,
/// `1` and `y`.
pub fn get_boolean_value(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => is_truthy_str(s),
        Some(other) => is_truthy_str(&other.to_string()),
    }
}

pub fn is_truthy_str(s: &str) -> bool {
    matches!(
        s.trim().to_lowercase().as_str(),
        "true" | "yes" | "t" | "1" | "y"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_boolean_value_accepts_loose_truthy_strings() {
        assert!(get_boolean_value(Some(&json!("Yes"))));
        assert!(get_boolean_value(Some(&json!("t"))));
        assert!(get_boolean_value(Some(&json!(1))));
        assert!(!get_boolean_value(Some(&json!("no"))));
        assert!(!get_boolean_value(Some(&Value::Null)));
        assert!(!get_boolean_value(None));
    }

    #[test]
    fn test_outcome_unwraps_nested_response() {
        let raw = json!({
            "response": {"status": "true", "output": "/data/md", "upd_chain": ["BF", "BS"]},
            "status": false
        });
        let outcome = StepOutcome::from_value(&raw);
        assert!(outcome.status());
        assert_eq!(outcome.output(), Some(&json!("/data/md")));
        assert_eq!(
            outcome.upd_chain(),
            Some(["BF".to_string(), "BS".to_string()].as_slice())
        );
    }

    #[test]
    fn test_outcome_ignores_empty_response() {
        let raw = json!({"response": {}, "status": true});
        assert!(StepOutcome::from_value(&raw).status());
    }

    #[test]
    fn test_step_result_omits_missing_output() {
        let json = serde_json::to_string(&StepResult::new("CM", true, None)).unwrap();
        assert_eq!(json, r#"{"cmd":"CM","value":true}"#);
    }
}
