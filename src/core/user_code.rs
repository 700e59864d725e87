// src/core/user_code.rs

//! Bridge to user-authored functions.
//!
//! A command code that is not built in may name a user function. The function
//! receives a mutable [`UserContext`]; by setting `use_response` it can hand
//! back a structured result instead of a bare success flag.

use crate::constants::{EVENT_ON_EXIT, EVENT_ON_START};
use crate::core::document::Document;
use crate::core::run_log::RunLog;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UserCodeError {
    #[error("function ({0}) was not found")]
    NotFound(String),
    #[error("{0}")]
    Failed(String),
}

/// Everything a user function can see and change.
#[derive(Debug)]
pub struct UserContext<'a> {
    pub log: &'a mut RunLog,
    /// The live configuration; edits are picked up after the call.
    pub document: &'a mut Document,
    /// Full geodatabase path.
    pub workspace: String,
    pub mosaic_dataset: String,
    pub source_path: String,
    /// `-__name:value` arguments, keyed with their `__` prefix.
    pub user_args: &'a BTreeMap<String, String>,
    pub use_response: bool,
    pub response: Option<Value>,
    pub status: Option<Value>,
    pub code: Option<Value>,
}

impl UserContext<'_> {
    /// The value the engine interprets when `use_response` is set.
    pub fn response_value(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert(
            "response".to_string(),
            self.response.clone().unwrap_or(Value::Null),
        );
        if let Some(code) = &self.code {
            map.insert("code".to_string(), code.clone());
        }
        if let Some(status) = &self.status {
            map.insert("status".to_string(), status.clone());
        }
        Value::Object(map)
    }
}

pub trait UserCode: fmt::Debug {
    fn has_function(&self, name: &str) -> bool;

    fn call(&mut self, name: &str, ctx: &mut UserContext<'_>) -> Result<bool, UserCodeError>;
}

/// True for the implicit start/exit lifecycle functions.
pub fn is_event(name: &str) -> bool {
    name == EVENT_ON_START || name == EVENT_ON_EXIT
}

/// Calls a user function, logging resolution and execution failures with
/// distinct messages. Any failure reads as `false`.
pub fn invoke_user_function(
    user_code: &mut dyn UserCode,
    name: &str,
    ctx: &mut UserContext<'_>,
) -> bool {
    let kind = if is_event(name) { "event" } else { "user defined function" };
    if !user_code.has_function(name) {
        let short = if is_event(name) { "event" } else { "user" };
        ctx.log.critical(&format!(
            "Please check if {short} function ({name}) is found in the user-code module."
        ));
        return false;
    }
    match user_code.call(name, ctx) {
        Ok(result) => result,
        Err(UserCodeError::NotFound(_)) => {
            let short = if is_event(name) { "event" } else { "user" };
            ctx.log.critical(&format!(
                "Please check if {short} function ({name}) is found in the user-code module."
            ));
            false
        }
        Err(UserCodeError::Failed(message)) => {
            ctx.log.critical(&format!("Executing {kind} ({name})"));
            ctx.log.critical(&message);
            false
        }
    }
}

// --- Implementations ---

/// No user module configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoUserCode;

impl UserCode for NoUserCode {
    fn has_function(&self, _name: &str) -> bool {
        false
    }

    fn call(&mut self, name: &str, _ctx: &mut UserContext<'_>) -> Result<bool, UserCodeError> {
        Err(UserCodeError::NotFound(name.to_string()))
    }
}

pub type UserFunction = Box<dyn FnMut(&mut UserContext<'_>) -> Result<bool, String>>;

/// User functions registered as closures. Names are case-sensitive.
#[derive(Default)]
pub struct FunctionTable {
    functions: HashMap<String, UserFunction>,
}

impl fmt::Debug for FunctionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("FunctionTable").field("functions", &names).finish()
    }
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, function: F)
    where
        F: FnMut(&mut UserContext<'_>) -> Result<bool, String> + 'static,
    {
        self.functions.insert(name.to_string(), Box::new(function));
    }

    pub fn with<F>(mut self, name: &str, function: F) -> Self
    where
        F: FnMut(&mut UserContext<'_>) -> Result<bool, String> + 'static,
    {
        self.register(name, function);
        self
    }
}

impl UserCode for FunctionTable {
    fn has_function(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    fn call(&mut self, name: &str, ctx: &mut UserContext<'_>) -> Result<bool, UserCodeError> {
        let function = self
            .functions
            .get_mut(name)
            .ok_or_else(|| UserCodeError::NotFound(name.to_string()))?;
        function(ctx).map_err(UserCodeError::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn with_context<R>(f: impl FnOnce(&mut UserContext<'_>) -> R) -> (R, RunLog) {
        let mut log = RunLog::new("MDCS");
        let mut doc = Document::parse("<Application><Name>md</Name></Application>").unwrap();
        let args = BTreeMap::new();
        let result = {
            let mut ctx = UserContext {
                log: &mut log,
                document: &mut doc,
                workspace: "/data/imagery.gdb".to_string(),
                mosaic_dataset: "md".to_string(),
                source_path: String::new(),
                user_args: &args,
                use_response: false,
                response: None,
                status: None,
                code: None,
            };
            f(&mut ctx)
        };
        (result, log)
    }

    #[test]
    fn test_missing_function_and_event_messages_differ() {
        let mut table = FunctionTable::new();
        let (ok, log) = with_context(|ctx| invoke_user_function(&mut table, "_OnStart", ctx));
        assert!(!ok);
        assert!(log.messages()[0].contains("event function (_OnStart)"));

        let (ok, log) = with_context(|ctx| invoke_user_function(&mut table, "customCV", ctx));
        assert!(!ok);
        assert!(log.messages()[0].contains("user function (customCV)"));
    }

    #[test]
    fn test_raised_error_is_logged_as_execution_failure() {
        let mut table = FunctionTable::new().with("boom", |_| Err("disk full".to_string()));
        let (ok, log) = with_context(|ctx| invoke_user_function(&mut table, "boom", ctx));
        assert!(!ok);
        assert_eq!(
            log.messages(),
            vec!["Executing user defined function (boom)", "disk full"]
        );
    }

    #[test]
    fn test_function_can_return_structured_response() {
        let mut table = FunctionTable::new().with("sample02", |ctx| {
            ctx.log.general("Returning multiple values");
            ctx.use_response = true;
            ctx.response = Some(json!(["msg0", "msg1"]));
            ctx.status = Some(json!(true));
            Ok(true)
        });
        let (value, _) = with_context(|ctx| {
            assert!(invoke_user_function(&mut table, "sample02", ctx));
            assert!(ctx.use_response);
            ctx.response_value()
        });
        assert_eq!(value, json!({"response": ["msg0", "msg1"], "status": true}));
    }

    #[test]
    fn test_function_names_are_case_sensitive() {
        let table = FunctionTable::new().with("customCV", |_| Ok(true));
        assert!(table.has_function("customCV"));
        assert!(!table.has_function("CUSTOMCV"));
    }
}
