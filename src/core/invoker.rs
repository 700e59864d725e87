// src/core/invoker.rs

//! Late-bound calls into the toolkit.
//!
//! Tool arities vary between toolkit versions, so callers hand over only the
//! arguments they care about. [`DynamicInvoker::prepare`] looks the tool up,
//! pads the list with `#` up to the declared arity or truncates it, and
//! [`DynamicInvoker::invoke`] performs the call, optionally followed by one
//! method call on the returned object.

use crate::constants::DEFAULT_MARKER;
use crate::core::run_log::RunLog;
use crate::core::toolkit::{ToolSignature, Toolkit};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum InvokeError {
    #[error("Syntax error for sub->method calls.")]
    SubCallSyntax,
}

/// Hook run right before the call. `None` skips the call without failing;
/// a list of the same length replaces the arguments, any other length is ignored.
pub type ArgsRewrite<'a> = &'a dyn Fn(&str, &[Value]) -> Option<Vec<Value>>;

/// A method to call on the object the tool returns: `save("C:/out.tif")`.
#[derive(Debug, Clone, PartialEq)]
pub struct SubCall {
    pub method: String,
    pub args: Vec<Value>,
}

/// Parses `method(arg1,arg2)`. Arguments become floats when they contain a
/// `.` and parse as such, then integers, then strings.
/// Returns `Ok(None)` when the text carries no call at all.
pub fn parse_sub_call(expr: &str) -> Result<Option<SubCall>, InvokeError> {
    let Some((method, rest)) = expr.split_once('(') else {
        return Ok(None);
    };
    if rest.contains('(') {
        return Err(InvokeError::SubCallSyntax);
    }
    let inner = rest.strip_suffix(')').ok_or(InvokeError::SubCallSyntax)?;
    let args = inner.split(',').map(typed_arg).collect();
    Ok(Some(SubCall {
        method: method.trim().to_string(),
        args,
    }))
}

fn typed_arg(raw: &str) -> Value {
    if raw.contains('.')
        && let Ok(f) = raw.trim().parse::<f64>()
        && let Some(n) = serde_json::Number::from_f64(f)
    {
        return Value::Number(n);
    }
    if let Ok(i) = raw.trim().parse::<i64>() {
        return Value::from(i);
    }
    Value::from(raw)
}

#[derive(Debug)]
pub struct DynamicInvoker {
    name: String,
    args: Vec<Value>,
    signature: Option<ToolSignature>,
    sub_call: Option<SubCall>,
}

impl DynamicInvoker {
    pub fn new(name: &str, args: Vec<Value>) -> Self {
        Self {
            name: name.to_string(),
            args,
            signature: None,
            sub_call: None,
        }
    }

    pub fn with_sub_call(mut self, sub_call: Option<SubCall>) -> Self {
        self.sub_call = sub_call;
        self
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Resolves the tool and fits the argument list to its arity.
    /// Logs a critical message and returns false when the tool is unknown.
    pub fn prepare(&mut self, toolkit: &dyn Toolkit, log: &mut RunLog) -> bool {
        let Some(signature) = toolkit.resolve(&self.name) else {
            log.critical(&format!("Unable to resolve ({}) in the toolkit.", self.name));
            return false;
        };
        let arity = signature.arity();
        if self.args.len() < arity {
            self.args.resize(arity, Value::from(DEFAULT_MARKER));
        } else {
            self.args.truncate(arity);
        }
        self.signature = Some(signature);
        true
    }

    /// Calls the prepared tool. Failures are logged, never raised.
    pub fn invoke(
        &mut self,
        toolkit: &mut dyn Toolkit,
        rewrite: Option<ArgsRewrite<'_>>,
        log: &mut RunLog,
    ) -> bool {
        let result = self.try_invoke(toolkit, rewrite, log);
        let ok = match result {
            Ok(()) => true,
            Err(message) => {
                log.critical(&message);
                false
            }
        };
        log.general(&format!("Status: {}", if ok { "OK" } else { "FAILED" }));
        ok
    }

    fn try_invoke(
        &mut self,
        toolkit: &mut dyn Toolkit,
        rewrite: Option<ArgsRewrite<'_>>,
        log: &mut RunLog,
    ) -> Result<(), String> {
        if self.signature.is_none() {
            return Err("DynamicInvoker/Not initialized.".to_string());
        }
        if let Some(rewrite) = rewrite {
            match rewrite(&self.name, &self.args) {
                None => return Ok(()),
                Some(updated) if updated.len() == self.args.len() => self.args = updated,
                Some(_) => {}
            }
        }
        log.general(&format!("Calling ({})", self.name));
        let result = toolkit
            .call(&self.name, &self.args)
            .map_err(|e| e.to_string())?;

        if let Some(sub) = &self.sub_call {
            match toolkit
                .call_method(&result, &sub.method, &sub.args)
                .map_err(|e| e.to_string())?
            {
                Some(value) => log.general(&format!(
                    "Sub-call ({}) on ({}) returned {value}",
                    sub.method, self.name
                )),
                None => log.warning(&format!(
                    "Result of ({}) has no method ({}).",
                    self.name, sub.method
                )),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::toolkit::RecordingToolkit;
    use serde_json::json;

    const TOOL: &str = "management.BuildFootprints";

    fn toolkit() -> RecordingToolkit {
        RecordingToolkit::new().with_tool(TOOL, &["md", "a", "b", "c", "d"])
    }

    #[test]
    fn test_prepare_pads_short_argument_lists() {
        let mut log = RunLog::new("MDCS");
        let mut inv = DynamicInvoker::new(TOOL, vec![json!("md"), json!(1), json!(2)]);
        assert!(inv.prepare(&toolkit(), &mut log));
        assert_eq!(inv.args(), &[json!("md"), json!(1), json!(2), json!("#"), json!("#")]);
    }

    #[test]
    fn test_prepare_truncates_long_argument_lists() {
        let mut log = RunLog::new("MDCS");
        let args = (0..7).map(|i| json!(i)).collect();
        let mut inv = DynamicInvoker::new(TOOL, args);
        assert!(inv.prepare(&toolkit(), &mut log));
        assert_eq!(inv.args().len(), 5);
    }

    #[test]
    fn test_unknown_tool_fails_prepare() {
        let mut log = RunLog::new("MDCS");
        let mut inv = DynamicInvoker::new("management.Nope", vec![]);
        assert!(!inv.prepare(&toolkit(), &mut log));
        assert!(!inv.invoke(&mut toolkit(), None, &mut log));
        assert!(log.messages().contains(&"Status: FAILED".to_string()));
    }

    #[test]
    fn test_rewrite_can_skip_or_replace_arguments() {
        let mut log = RunLog::new("MDCS");
        let handle = toolkit();
        let mut tk = handle.clone();

        let mut inv = DynamicInvoker::new(TOOL, vec![json!("md")]);
        assert!(inv.prepare(&tk, &mut log));
        let skip = |_: &str, _: &[Value]| None;
        assert!(inv.invoke(&mut tk, Some(&skip), &mut log));
        assert!(handle.calls().is_empty());

        let wrong_len = |_: &str, _: &[Value]| Some(vec![json!("x")]);
        assert!(inv.invoke(&mut tk, Some(&wrong_len), &mut log));
        assert_eq!(handle.calls().last().unwrap().args.first(), Some(&json!("md")));

        let replace = |_: &str, args: &[Value]| {
            let mut a = args.to_vec();
            a[0] = json!("other");
            Some(a)
        };
        assert!(inv.invoke(&mut tk, Some(&replace), &mut log));
        assert_eq!(handle.calls().last().unwrap().args.first(), Some(&json!("other")));
    }

    #[test]
    fn test_failed_call_logs_status_failed() {
        let mut log = RunLog::new("MDCS");
        let mut tk = toolkit().failing(TOOL);
        let mut inv = DynamicInvoker::new(TOOL, vec![]);
        assert!(inv.prepare(&tk, &mut log));
        assert!(!inv.invoke(&mut tk, None, &mut log));
        let messages = log.messages();
        assert!(messages.contains(&format!("Calling ({TOOL})")));
        assert_eq!(messages.last().unwrap(), "Status: FAILED");
    }

    #[test]
    fn test_sub_call_runs_on_returned_object() {
        let mut log = RunLog::new("MDCS");
        let handle = toolkit()
            .with_result(TOOL, json!({"raster": 1}))
            .with_method_result("save", json!(true));
        let mut tk = handle.clone();
        let sub = parse_sub_call("save(C:/out.tif)").unwrap();
        let mut inv = DynamicInvoker::new(TOOL, vec![]).with_sub_call(sub);
        assert!(inv.prepare(&tk, &mut log));
        assert!(inv.invoke(&mut tk, None, &mut log));
        assert_eq!(handle.call_names(), vec![TOOL.to_string(), ".save".to_string()]);
    }

    #[test]
    fn test_missing_sub_call_method_is_warned() {
        let mut log = RunLog::new("MDCS");
        let mut tk = toolkit().with_result(TOOL, json!({"raster": 1}));
        let sub = parse_sub_call("save(C:/out.tif)").unwrap();
        let mut inv = DynamicInvoker::new(TOOL, vec![]).with_sub_call(sub);
        assert!(inv.prepare(&tk, &mut log));
        assert!(inv.invoke(&mut tk, None, &mut log));
        let expected = format!("Result of ({TOOL}) has no method (save).");
        assert!(log.messages().contains(&expected));
    }

    #[test]
    fn test_sub_call_value_is_logged() {
        let mut log = RunLog::new("MDCS");
        let mut tk = toolkit()
            .with_result(TOOL, json!({"raster": 1}))
            .with_method_result("save", json!(true));
        let sub = parse_sub_call("save(C:/out.tif)").unwrap();
        let mut inv = DynamicInvoker::new(TOOL, vec![]).with_sub_call(sub);
        assert!(inv.prepare(&tk, &mut log));
        assert!(inv.invoke(&mut tk, None, &mut log));
        let expected = format!("Sub-call (save) on ({TOOL}) returned true");
        assert!(log.messages().contains(&expected));
    }

    #[test]
    fn test_parse_sub_call_types_arguments() {
        let call = parse_sub_call("fn(1,2.5,abc,3.x)").unwrap().unwrap();
        assert_eq!(call.method, "fn");
        assert_eq!(call.args, vec![json!(1), json!(2.5), json!("abc"), json!("3.x")]);
        assert_eq!(parse_sub_call("#").unwrap(), None);
        assert_eq!(parse_sub_call("fn(1,2"), Err(InvokeError::SubCallSyntax));
    }
}
