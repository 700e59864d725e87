// src/core/toolkit.rs

//! The external geoprocessing toolkit, seen only through a narrow capability
//! interface: look a tool up by dotted name, learn its parameter names, call it
//! with positional arguments.

use crate::system::executor::ExecutionError;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ToolkitError {
    #[error("Tool '{0}' is not available in the toolkit.")]
    NotFound(String),
    #[error("Tool '{name}' failed: {message}")]
    CallFailed { name: String, message: String },
    #[error("Invalid toolkit manifest: {0}")]
    Manifest(String),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

/// Declared shape of a tool; the arity is `params.len()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSignature {
    pub name: String,
    pub params: Vec<String>,
}

impl ToolSignature {
    pub fn new(name: &str, params: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            params: params.iter().map(|p| (*p).to_string()).collect(),
        }
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

pub trait Toolkit: std::fmt::Debug {
    /// Looks a tool up by its dotted name (`management.BuildFootprints`).
    fn resolve(&self, name: &str) -> Option<ToolSignature>;

    /// Calls a tool with positional arguments.
    fn call(&mut self, name: &str, args: &[Value]) -> Result<Value, ToolkitError>;

    /// Calls `method` on the object a previous call returned.
    /// `Ok(None)` means the object exposes no such method.
    fn call_method(
        &mut self,
        _target: &Value,
        _method: &str,
        _args: &[Value],
    ) -> Result<Option<Value>, ToolkitError> {
        Ok(None)
    }

    /// Applies one toolkit environment setting for subsequent calls.
    fn set_environment(&mut self, key: &str, value: &str) -> Result<(), ToolkitError>;
}

// --- Helpers over common management tools ---

pub const TOOL_EXISTS: &str = "management.Exists";
pub const TOOL_LIST_FIELDS: &str = "management.ListFields";
pub const TOOL_DELETE: &str = "management.Delete";
pub const TOOL_MAKE_MOSAIC_LAYER: &str = "management.MakeMosaicLayer";

/// Asks the toolkit whether a dataset exists. Call failures count as "no".
pub fn exists(toolkit: &mut dyn Toolkit, path: &str) -> bool {
    match toolkit.call(TOOL_EXISTS, &[Value::from(path)]) {
        Ok(v) => crate::models::get_boolean_value(Some(&v)),
        Err(e) => {
            log::debug!("Exists({}) failed: {}", path, e);
            false
        }
    }
}

/// Field names of a dataset, optionally filtered by a wildcard.
pub fn list_fields(
    toolkit: &mut dyn Toolkit,
    path: &str,
    wildcard: Option<&str>,
) -> Result<Vec<String>, ToolkitError> {
    let mut args = vec![Value::from(path)];
    if let Some(w) = wildcard {
        args.push(Value::from(w));
    }
    let fields = toolkit.call(TOOL_LIST_FIELDS, &args)?;
    Ok(match fields {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s),
                Value::Object(map) => map.get("name").and_then(Value::as_str).map(str::to_string),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    })
}

// --- In-memory toolkit ---

/// One call seen by a [`RecordingToolkit`].
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub name: String,
    pub args: Vec<Value>,
}

#[derive(Debug, Default)]
struct RecordingState {
    signatures: HashMap<String, ToolSignature>,
    results: HashMap<String, Value>,
    method_results: HashMap<String, Value>,
    failing: HashSet<String>,
    environment: Vec<(String, String)>,
    calls: Vec<ToolCall>,
}

/// Toolkit that records every call and answers with canned results.
///
/// Clones share state, so a test can keep one handle while the engine owns
/// another. Unknown tools are callable and return `null`; only tools given a
/// signature can be resolved for dynamic invocation.
#[derive(Debug, Clone, Default)]
pub struct RecordingToolkit {
    state: Arc<Mutex<RecordingState>>,
}

impl RecordingToolkit {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RecordingState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn with_tool(self, name: &str, params: &[&str]) -> Self {
        self.state()
            .signatures
            .insert(name.to_string(), ToolSignature::new(name, params));
        self
    }

    pub fn with_result(self, name: &str, result: Value) -> Self {
        self.state().results.insert(name.to_string(), result);
        self
    }

    pub fn with_method_result(self, method: &str, result: Value) -> Self {
        self.state().method_results.insert(method.to_string(), result);
        self
    }

    pub fn failing(self, name: &str) -> Self {
        self.state().failing.insert(name.to_string());
        self
    }

    pub fn calls(&self) -> Vec<ToolCall> {
        self.state().calls.clone()
    }

    /// Names of the calls made so far, in order.
    pub fn call_names(&self) -> Vec<String> {
        self.state().calls.iter().map(|c| c.name.clone()).collect()
    }

    pub fn environment(&self) -> Vec<(String, String)> {
        self.state().environment.clone()
    }
}

impl Toolkit for RecordingToolkit {
    fn resolve(&self, name: &str) -> Option<ToolSignature> {
        self.state().signatures.get(name).cloned()
    }

    fn call(&mut self, name: &str, args: &[Value]) -> Result<Value, ToolkitError> {
        let mut state = self.state();
        state.calls.push(ToolCall {
            name: name.to_string(),
            args: args.to_vec(),
        });
        if state.failing.contains(name) {
            return Err(ToolkitError::CallFailed {
                name: name.to_string(),
                message: "injected failure".to_string(),
            });
        }
        Ok(state.results.get(name).cloned().unwrap_or(Value::Null))
    }

    fn call_method(
        &mut self,
        target: &Value,
        method: &str,
        args: &[Value],
    ) -> Result<Option<Value>, ToolkitError> {
        let mut state = self.state();
        let Some(result) = state.method_results.get(method).cloned() else {
            return Ok(None);
        };
        let mut all_args = vec![target.clone()];
        all_args.extend_from_slice(args);
        state.calls.push(ToolCall {
            name: format!(".{method}"),
            args: all_args,
        });
        Ok(Some(result))
    }

    fn set_environment(&mut self, key: &str, value: &str) -> Result<(), ToolkitError> {
        self.state()
            .environment
            .push((key.to_string(), value.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_recording_toolkit_shares_journal_between_clones() {
        let handle = RecordingToolkit::new().with_result(TOOL_EXISTS, json!(true));
        let mut engine_side: Box<dyn Toolkit> = Box::new(handle.clone());
        assert!(exists(engine_side.as_mut(), "/gdb/md"));
        assert_eq!(handle.call_names(), vec![TOOL_EXISTS.to_string()]);
    }

    #[test]
    fn test_failure_injection_and_unknown_tools() {
        let mut tk = RecordingToolkit::new().failing("management.Compact");
        assert!(tk.call("management.Compact", &[]).is_err());
        assert_eq!(tk.call("management.Other", &[]).unwrap(), Value::Null);
        assert!(tk.resolve("management.Other").is_none());
    }

    #[test]
    fn test_list_fields_accepts_names_or_objects() {
        let mut tk = RecordingToolkit::new()
            .with_result(TOOL_LIST_FIELDS, json!(["Year", {"name": "Month"}, 3]));
        assert_eq!(list_fields(&mut tk, "/md", None).unwrap(), vec!["Year", "Month"]);
    }
}
