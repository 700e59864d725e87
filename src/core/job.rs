// src/core/job.rs

//! Job payloads: a list of steps, each either an engine run executed in a
//! subordinate process or a call into a user-script namespace. Later steps
//! reference earlier inputs and outputs through `@` templates.

use crate::core::engine::join_path;
use crate::core::template::{StepStore, TemplateError};
use crate::models::{StepOutcome, StepResult, get_boolean_value};
use crate::system::executor::ExecutionError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

const STEP_TYPE_ENGINE: &str = "mdcs";
const VALID_FLAGS: &[&str] = &["i", "m", "c", "p", "s"];
const REQUIRED_FLAGS: &[&str] = &["c"];
const ROOT_RELATIVE_FLAGS: &[&str] = &["i", "s"];

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Invalid/non-implemented flag found!\nValid flags are {flags:?}", flags = VALID_FLAGS)]
    InvalidFlag,
    #[error("The following flags must exist in the payload,\n{flags:?}", flags = REQUIRED_FLAGS)]
    MissingFlag,
    #[error("MDCS/steps/args/m is not set.")]
    EmptyMosaicDataset,
    #[error("Step key (enabled, id) must be specified.")]
    InvalidStep,
    #[error("Invalid step definition: {0}")]
    StepFormat(#[from] serde_json::Error),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error("Subordinate run returned an unreadable response: {0}")]
    Response(String),
    #[error("Namespace '{namespace}' has no function '{function}'.")]
    UnknownFunction { namespace: String, function: String },
    #[error("{0}")]
    Failed(String),
}

/// Runs the engine for one job step, isolated from the caller's process.
pub trait SubordinateLauncher: fmt::Debug {
    fn launch(&self, argv: &[String]) -> Result<Vec<StepResult>, JobError>;
}

/// Calls a function of a named namespace with keyword arguments.
pub trait StepNamespace: fmt::Debug {
    fn call(
        &mut self,
        namespace: &str,
        function: &str,
        kwargs: &Map<String, Value>,
    ) -> Result<Value, JobError>;
}

/// Collected messages and final status of a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobReport {
    pub logs: Vec<String>,
    pub status: bool,
    /// Results of every step that ran, keyed by step id.
    pub steps: BTreeMap<String, Vec<StepResult>>,
}

impl JobReport {
    pub fn add_message(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::info!("{}", message);
        self.logs.push(message);
    }

    fn fail(mut self, message: impl Into<String>) -> Self {
        self.add_message(message);
        self.status = false;
        self
    }
}

#[derive(Debug, Deserialize)]
struct JobStep {
    id: String,
    #[serde(rename = "type", default)]
    kind: String,
    enabled: Value,
    #[serde(default)]
    args: Map<String, Value>,
    #[serde(rename = "fn", default)]
    function: Option<String>,
}

#[derive(Debug)]
pub struct JobRunner {
    root: PathBuf,
    code_base: Option<PathBuf>,
    launcher: Box<dyn SubordinateLauncher>,
    namespace: Box<dyn StepNamespace>,
}

impl JobRunner {
    /// `root` is the work folder: inputs are resolved against it, outputs
    /// land under `root/output` and logs under `root/logs`.
    pub fn new(
        root: impl Into<PathBuf>,
        launcher: Box<dyn SubordinateLauncher>,
        namespace: Box<dyn StepNamespace>,
    ) -> Self {
        Self {
            root: root.into(),
            code_base: None,
            launcher,
            namespace,
        }
    }

    /// Folder passed as `-b` to subordinate runs.
    pub fn with_code_base(mut self, code_base: impl Into<PathBuf>) -> Self {
        self.code_base = Some(code_base.into());
        self
    }

    fn root_str(&self) -> String {
        self.root.to_string_lossy().replace('\\', "/")
    }

    pub fn run(&mut self, payload: &Value) -> JobReport {
        let report = JobReport::default();
        if payload.is_null() {
            return report.fail("Job empty!");
        }
        let Some(job) = payload.get("job") else {
            return report.fail("job/params not found!");
        };
        let Some(params) = job.get("params") else {
            return report.fail("job/params not found!");
        };
        let Some(output) = params.get("output") else {
            return report.fail("Err. input/output entry not found!");
        };
        let Some(build) = params.get("build") else {
            return report.fail("input/MDCS|build entry not found!");
        };
        let Some(steps) = build.get("steps").and_then(Value::as_array) else {
            return report.fail("input/build/steps entry not found!");
        };
        let job_id = match job.get("id") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };

        match self.run_steps(&job_id, output, steps, report) {
            Ok(report) | Err(report) => report,
        }
    }

    fn run_steps(
        &mut self,
        job_id: &str,
        output: &Value,
        steps: &[Value],
        mut report: JobReport,
    ) -> Result<JobReport, JobReport> {
        if steps
            .iter()
            .any(|s| s.get("enabled").is_none() || s.get("id").is_none())
        {
            return Err(report.fail(format!("Err. {}", JobError::InvalidStep)));
        }
        let output_path = output
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let root = self.root_str();
        let output_root = join_path(&root, "output");
        let internals = BTreeMap::from([
            ("output".to_string(), join_path(&output_root, &output_path)),
            ("payload".to_string(), join_path(&root, "payload")),
            ("wp".to_string(), root.clone()),
        ]);
        let mut store = StepStore::new(internals);
        let mut md_path = join_path(&output_root, "undefined.gdb");
        let mut step_status = false;
        let mut last_id = String::new();

        for raw in steps {
            let step: JobStep = match serde_json::from_value(raw.clone()) {
                Ok(step) => step,
                Err(e) => return Err(report.fail(format!("Err. {}", JobError::from(e)))),
            };
            last_id.clone_from(&step.id);
            if !get_boolean_value(Some(&step.enabled)) {
                report.add_message(format!("Skipping step ({})", step.id));
                continue;
            }

            let results = if step.kind.eq_ignore_ascii_case(STEP_TYPE_ENGINE) {
                let mut args = step.args;
                args.insert("__wp__".to_string(), Value::from(root.as_str()));
                args.insert("__step__".to_string(), Value::from(step.id.as_str()));
                args.insert("__job__".to_string(), Value::from(job_id));
                let resolved = match store.add_input(&step.id, args) {
                    Ok(resolved) => resolved,
                    Err(e) => return Err(report.fail(format!("Err. {e}"))),
                };
                let (results, status) = self.do_work(&output_path, resolved, &mut report);
                step_status = status;
                results
            } else {
                let function = step.function.clone().unwrap_or_else(|| step.id.clone());
                let kwargs = match store.add_input(&step.id, step.args) {
                    Ok(kwargs) => kwargs,
                    Err(e) => return Err(report.fail(format!("Err. {e}"))),
                };
                match self.namespace.call(&step.kind, &function, &kwargs) {
                    Ok(value) => {
                        let outcome = StepOutcome::from_value(&value);
                        step_status = outcome.status();
                        vec![StepResult::new(function, step_status, outcome.output().cloned())]
                    }
                    Err(e) => {
                        report.add_message(format!("Err. {e}"));
                        step_status = false;
                        Vec::new()
                    }
                }
            };

            store.add_results(&step.id, results.clone());
            if !step_status {
                break;
            }
            if let Some(output) = results.iter().rev().find_map(|r| r.output.as_ref()) {
                md_path = match output {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
            }
        }
        report.steps = store.results().clone();

        if !step_status {
            return Err(report.fail(format!("Err. MDCS/step({last_id}) failed!")));
        }
        // Only paths inside the work folder (or remote references) may be handed on.
        if !md_path.starts_with(&root) && Path::new(&md_path).exists() {
            return Err(report.fail("Err. MDCS/steps/(output) is invalid/omitted/empty!"));
        }
        if !get_boolean_value(output.get("enabled")) {
            report.add_message("Cloud-upload has been disabled in the request, skipping..");
            report.status = true;
            return Ok(report);
        }
        Err(report.fail(format!("Cloud-upload to ({md_path}) is not handled by this worker.")))
    }

    /// Validates an engine step's flags, maps them onto the work folder and
    /// runs the engine in a subordinate process. Returns the results and the
    /// step status.
    pub fn do_work(
        &self,
        output_path: &str,
        args: Map<String, Value>,
        report: &mut JobReport,
    ) -> (Vec<StepResult>, bool) {
        match self.try_do_work(output_path, args, report) {
            Ok(outcome) => outcome,
            Err(e) => {
                report.add_message(format!("Err. doWork/{e}"));
                (Vec::new(), false)
            }
        }
    }

    fn try_do_work(
        &self,
        output_path: &str,
        mut args: Map<String, Value>,
        report: &mut JobReport,
    ) -> Result<(Vec<StepResult>, bool), JobError> {
        if args
            .keys()
            .any(|k| !VALID_FLAGS.contains(&k.as_str()) && !k.starts_with("__"))
        {
            return Err(JobError::InvalidFlag);
        }
        if REQUIRED_FLAGS.iter().any(|k| !args.contains_key(*k)) {
            return Err(JobError::MissingFlag);
        }

        let root = self.root_str();
        for flag in ROOT_RELATIVE_FLAGS {
            if let Some(value) = args.get_mut(*flag) {
                *value = map_values(value, |v| join_path(&root, v));
            }
        }
        if let Some(code_base) = &self.code_base {
            args.insert("b".to_string(), Value::from(code_base.to_string_lossy().as_ref()));
        }
        args.insert("l".to_string(), Value::from(format!("{}/", join_path(&root, "logs"))));
        if let Some(md) = args.get("m") {
            let md = value_text(md);
            if md.is_empty() {
                return Err(JobError::EmptyMosaicDataset);
            }
            let md_root = join_path(&join_path(&root, "output"), output_path);
            args.insert("m".to_string(), Value::from(join_path(&md_root, &md)));
        }

        let mut argv = Vec::new();
        for (flag, value) in &args {
            match value {
                Value::Array(items) => {
                    argv.extend(items.iter().map(|v| format!("-{flag}:{}", value_text(v))));
                }
                other => argv.push(format!("-{flag}:{}", value_text(other))),
            }
        }

        report.add_message("Invoking MDCS..");
        let results = self.launcher.launch(&argv)?;
        log::debug!("Response> {:?}", results);
        let Some(last) = results.last() else {
            return Ok((results, false));
        };
        if last.value && last.output.is_some() {
            return Ok((results, true));
        }
        let status = results.iter().all(|r| r.value);
        Ok((results, status))
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn map_values(value: &Value, f: impl Fn(&str) -> String) -> Value {
    match value {
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| Value::from(f(&value_text(v))))
                .collect(),
        ),
        other => Value::from(f(&value_text(other))),
    }
}
