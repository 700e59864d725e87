// src/system/user_scripts.rs

//! User functions and job namespaces backed by external scripts.
//!
//! ```toml
//! [functions.customCV]
//! run = "python3 user/custom_cv.py"
//!
//! [namespaces.publisher.share]
//! run = "publish-item"
//! ```
//!
//! A user function sees the run through `MDCS_*` variables. Every stdout line
//! but the last is logged; the last line is the result: a JSON object is a
//! structured response, anything else is read as a boolean.

use crate::core::job::{JobError, StepNamespace};
use crate::core::user_code::{UserCode, UserCodeError, UserContext};
use crate::models::get_boolean_value;
use crate::system::executor::{self, expand_command_line};
use crate::system::tool_manifest::parse_output;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptEntry {
    pub run: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserCodeManifest {
    #[serde(default)]
    pub functions: HashMap<String, ScriptEntry>,
    #[serde(default)]
    pub namespaces: HashMap<String, HashMap<String, ScriptEntry>>,
}

impl UserCodeManifest {
    pub fn load(path: &Path) -> Result<Self, UserCodeError> {
        let content = fs::read_to_string(path)
            .map_err(|e| UserCodeError::Failed(format!("{}: {e}", path.display())))?;
        toml::from_str(&content).map_err(|e| UserCodeError::Failed(e.to_string()))
    }
}

fn run_script(
    entry: &ScriptEntry,
    cwd: &Path,
    env: &HashMap<String, String>,
) -> Result<String, String> {
    let command = expand_command_line(&entry.run).map_err(|e| e.to_string())?;
    let cwd = (!cwd.as_os_str().is_empty()).then_some(cwd);
    executor::execute_and_capture_output(&command, cwd, env).map_err(|e| e.to_string())
}

// --- User functions ---

#[derive(Debug)]
pub struct ScriptUserCode {
    functions: HashMap<String, ScriptEntry>,
    base_dir: PathBuf,
}

impl ScriptUserCode {
    pub fn new(manifest: &UserCodeManifest, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            functions: manifest.functions.clone(),
            base_dir: base_dir.into(),
        }
    }

    fn environment(ctx: &UserContext<'_>) -> HashMap<String, String> {
        let mut env = HashMap::from([
            ("MDCS_WORKSPACE".to_string(), ctx.workspace.clone()),
            ("MDCS_MOSAIC_DATASET".to_string(), ctx.mosaic_dataset.clone()),
            ("MDCS_SOURCES".to_string(), ctx.source_path.clone()),
        ]);
        for (key, value) in ctx.user_args {
            let name = key.trim_start_matches(crate::constants::USER_ARG_PREFIX);
            env.insert(format!("MDCS_USER_{}", name.to_uppercase()), value.clone());
        }
        env
    }
}

impl UserCode for ScriptUserCode {
    fn has_function(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    fn call(&mut self, name: &str, ctx: &mut UserContext<'_>) -> Result<bool, UserCodeError> {
        let entry = self
            .functions
            .get(name)
            .ok_or_else(|| UserCodeError::NotFound(name.to_string()))?;
        let stdout = run_script(entry, &self.base_dir, &Self::environment(ctx))
            .map_err(UserCodeError::Failed)?;

        let lines: Vec<&str> = stdout.lines().filter(|l| !l.trim().is_empty()).collect();
        let Some((last, logged)) = lines.split_last() else {
            return Ok(true);
        };
        for line in logged {
            ctx.log.general(line.trim());
        }
        match parse_output(last) {
            Value::Object(map) => {
                let status = map.get("status").cloned();
                ctx.use_response = true;
                ctx.response = Some(
                    map.get("response")
                        .cloned()
                        .unwrap_or_else(|| Value::Object(map.clone())),
                );
                ctx.code = map.get("code").cloned();
                ctx.status = status.clone();
                Ok(status.map_or(true, |s| get_boolean_value(Some(&s))))
            }
            other => Ok(get_boolean_value(Some(&other))),
        }
    }
}

// --- Job namespaces ---

/// Job-step functions grouped by namespace. Keyword arguments travel as a
/// JSON object in `MDCS_KWARGS`; stdout is the step's return value.
#[derive(Debug)]
pub struct ScriptNamespace {
    namespaces: HashMap<String, HashMap<String, ScriptEntry>>,
    base_dir: PathBuf,
}

impl ScriptNamespace {
    pub fn new(manifest: &UserCodeManifest, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            namespaces: manifest.namespaces.clone(),
            base_dir: base_dir.into(),
        }
    }
}

impl StepNamespace for ScriptNamespace {
    fn call(
        &mut self,
        namespace: &str,
        function: &str,
        kwargs: &Map<String, Value>,
    ) -> Result<Value, JobError> {
        let entry = self
            .namespaces
            .get(namespace)
            .and_then(|functions| functions.get(function))
            .ok_or_else(|| JobError::UnknownFunction {
                namespace: namespace.to_string(),
                function: function.to_string(),
            })?;
        let env = HashMap::from([(
            "MDCS_KWARGS".to_string(),
            Value::Object(kwargs.clone()).to_string(),
        )]);
        let stdout = run_script(entry, &self.base_dir, &env).map_err(JobError::Failed)?;
        Ok(parse_output(&stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::document::Document;
    use crate::core::run_log::RunLog;
    use serde_json::json;
    use std::collections::BTreeMap;

    const MANIFEST: &str = r#"
[functions.plain]
run = "sh -c 'echo working on $MDCS_MOSAIC_DATASET; echo true'"

[functions.quiet]
run = "true"

[functions.refuse]
run = "echo false"

[functions.structured]
run = """sh -c 'echo "{\\"response\\": [\\"$MDCS_USER_ITEM\\"], \\"status\\": true, \\"code\\": 7}"'"""

[functions.relink]
run = """echo '{"status": true, "output": "/gdb/md2", "upd_chain": ["CP"]}'"""

[functions.crash]
run = "sh -c 'echo bad >&2; exit 1'"

[namespaces.publisher.share]
run = "sh -c 'echo $MDCS_KWARGS'"
"#;

    fn manifest() -> UserCodeManifest {
        toml::from_str(MANIFEST).unwrap()
    }

    fn call(name: &str) -> (Result<bool, UserCodeError>, RunLog, Option<Value>) {
        let mut code = ScriptUserCode::new(&manifest(), "");
        let mut log = RunLog::new("MDCS");
        let mut doc = Document::parse("<Application/>").unwrap();
        let args = BTreeMap::from([("__item".to_string(), "tile-9".to_string())]);
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
        let result = code.call(name, &mut ctx);
        let response = ctx.use_response.then(|| ctx.response_value());
        (result, log, response)
    }

    #[test]
    fn test_manifest_lists_functions() {
        let code = ScriptUserCode::new(&manifest(), "");
        assert!(code.has_function("plain"));
        assert!(!code.has_function("Plain"));
    }

    #[cfg(unix)]
    #[test]
    fn test_last_line_is_the_result() {
        let (result, log, response) = call("plain");
        assert!(result.unwrap());
        assert_eq!(log.messages(), vec!["working on md"]);
        assert!(response.is_none());

        assert!(!call("refuse").0.unwrap());
        assert!(call("quiet").0.unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_json_object_becomes_a_structured_response() {
        let (result, _, response) = call("structured");
        assert!(result.unwrap());
        assert_eq!(
            response.unwrap(),
            json!({"response": ["tile-9"], "status": true, "code": 7})
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_top_level_fields_reach_the_engine() {
        let (result, _, response) = call("relink");
        assert!(result.unwrap());
        let outcome = crate::models::StepOutcome::from_value(&response.unwrap());
        assert_eq!(outcome.output(), Some(&json!("/gdb/md2")));
        assert_eq!(outcome.upd_chain(), Some(&["CP".to_string()][..]));
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_script_is_an_execution_failure() {
        assert!(matches!(call("crash").0, Err(UserCodeError::Failed(m)) if m.contains("bad")));
        assert!(matches!(call("missing").0, Err(UserCodeError::NotFound(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_namespace_receives_keyword_arguments() {
        let mut ns = ScriptNamespace::new(&manifest(), "");
        let mut kwargs = Map::new();
        kwargs.insert("item".to_string(), json!("/out/dem.gdb"));
        assert_eq!(
            ns.call("publisher", "share", &kwargs).unwrap(),
            json!({"item": "/out/dem.gdb"})
        );
        assert!(matches!(
            ns.call("publisher", "unshare", &kwargs),
            Err(JobError::UnknownFunction { .. })
        ));
    }
}
