// src/core/engine.rs

//! The command-chain interpreter.
//!
//! A run takes a `+`-joined chain (`CM+AF+AR+BF1`), resolves each token to a
//! built-in handler or a user function, executes it with parameters from the
//! process table and folds the handler's answer into one [`StepResult`].
//! Failures of chain-critical or user steps end the chain early; a step may
//! also hand back a replacement for the rest of the queue.

use crate::constants::{
    CHAIN_CRITICAL_COMMANDS, DEFAULT_COMMAND_SENTINEL, DEFAULT_MARKER, EVENT_ON_EXIT,
    EVENT_ON_START, GEODATABASE_EXT, SDE_EXT, STATUS_FAILED, STATUS_OK, XPATH_GEODATABASE,
    XPATH_MOSAIC_DATASET_NAME, XPATH_WORKSPACE,
};
use crate::core::document::{Document, DocumentError};
use crate::core::invoker::{DynamicInvoker, parse_sub_call};
use crate::core::process_info::{ProcessInfo, ProcessInfoError};
use crate::core::registry::{CommandDefinition, Handler, Lead, Registry};
use crate::core::run_log::RunLog;
use crate::core::toolkit::{Toolkit, ToolkitError};
use crate::core::user_code::{UserCode, UserContext, invoke_user_function, is_event};
use crate::core::variables::DynamicParams;
use crate::models::{CommandStep, StepOutcome, StepResult};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

lazy_static! {
    static ref STEP_TOKEN_RE: Regex = Regex::new(r"^([A-Za-z_]+)(.*)$").unwrap();
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    ProcessInfo(#[from] ProcessInfoError),
    #[error("Error: Empty command.")]
    EmptyCommand,
    #[error(transparent)]
    Toolkit(#[from] ToolkitError),
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Step(String),
}

impl EngineError {
    /// Configuration and parameter-index errors end the run; everything else
    /// only fails the step that raised it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Document(_) | Self::ProcessInfo(_) | Self::EmptyCommand
        )
    }
}

/// What to do with a token that is neither built in nor a user function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnresolvedPolicy {
    /// Log a warning and carry on with the next token.
    #[default]
    Skip,
    /// Drop the rest of the chain except a pending `_OnExit` event.
    CollapseToExit,
}

/// Caller-supplied settings for one engine run.
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    pub params: DynamicParams,
    pub workspace: Option<String>,
    pub geodatabase: Option<String>,
    pub mosaic_dataset: Option<String>,
    /// `;`-joined source paths, overriding the configuration's sources.
    pub sources: String,
    pub user_args: BTreeMap<String, String>,
    /// Folder holding the `Parameter` tree; bare workspace names resolve against it.
    pub root: PathBuf,
    pub unresolved: UnresolvedPolicy,
}

/// Workspace and dataset identity of the run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BaseState {
    pub workspace: String,
    pub geodatabase: String,
    /// `workspace/geodatabase`.
    pub geo_path: String,
    pub md_name: String,
    pub is_sde: bool,
    pub sources: String,
    /// Rows above this object id are the ones the current run added.
    pub last_object_id: u64,
}

impl BaseState {
    pub fn md_path(&self) -> String {
        join_path(&self.geo_path, &self.md_name)
    }

    /// Geodatabase name without its extension.
    pub fn gdb_name(&self) -> &str {
        let len = self.geodatabase.len();
        self.geodatabase
            .get(..len.saturating_sub(GEODATABASE_EXT.len()))
            .unwrap_or(&self.geodatabase)
    }
}

enum Target {
    Builtin(&'static CommandDefinition),
    User { name: String, event: bool },
}

#[derive(Debug)]
pub struct Engine {
    pub(crate) document: Document,
    pub(crate) process_info: ProcessInfo,
    pub(crate) toolkit: Box<dyn Toolkit>,
    pub(crate) user_code: Box<dyn UserCode>,
    pub(crate) log: RunLog,
    pub(crate) registry: Registry,
    pub(crate) base: BaseState,
    pub(crate) user_args: BTreeMap<String, String>,
    pub(crate) root: PathBuf,
    policy: UnresolvedPolicy,
}

impl Engine {
    /// Prepares the document (overrides, `$VAR$` substitution), derives the
    /// base state and builds the process table.
    pub fn new(
        mut document: Document,
        toolkit: Box<dyn Toolkit>,
        user_code: Box<dyn UserCode>,
        mut log: RunLog,
        options: EngineOptions,
    ) -> Result<Self, EngineError> {
        if let Some(ws) = options.workspace.as_deref().filter(|s| !s.is_empty()) {
            document.set_value_at_path(XPATH_WORKSPACE, "WorkspacePath", ws, None);
        }
        if let Some(gdb) = options.geodatabase.as_deref().filter(|s| !s.is_empty()) {
            document.set_value_at_path(XPATH_GEODATABASE, "Geodatabase", gdb, None);
        }
        if let Some(md) = options.mosaic_dataset.as_deref().filter(|s| !s.is_empty()) {
            document.set_value_at_path(XPATH_MOSAIC_DATASET_NAME, "Name", md, None);
        }
        document.substitute_variables(&options.params);

        let workspace = match options.workspace.as_deref().filter(|s| !s.is_empty()) {
            Some(ws) => ws.to_string(),
            None => prefix_folder_path(&document.value_of("WorkspacePath"), &options.root),
        };
        let mut geodatabase = options
            .geodatabase
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| document.value_of("Geodatabase").trim().to_string());
        let md_name = options
            .mosaic_dataset
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| document.value_at_path(XPATH_MOSAIC_DATASET_NAME));

        let lower = geodatabase.to_lowercase();
        let is_sde = lower.ends_with(SDE_EXT);
        if !lower.ends_with(GEODATABASE_EXT) && !is_sde {
            geodatabase.push_str(GEODATABASE_EXT);
        }
        let geo_path = join_path(&workspace, &geodatabase);
        if is_sde {
            log.general(&format!("Using enterprise geodatabase connection ({geo_path})"));
        }

        let process_info = ProcessInfo::build(&document)?;
        let base = BaseState {
            workspace,
            geodatabase,
            geo_path,
            md_name,
            is_sde,
            sources: options.sources.trim_end_matches(['/', '\\']).to_string(),
            last_object_id: 0,
        };
        log::debug!("Engine base state: {:?}", base);

        Ok(Self {
            document,
            process_info,
            toolkit,
            user_code,
            log,
            registry: Registry::default(),
            base,
            user_args: options.user_args,
            root: options.root,
            policy: options.unresolved,
        })
    }

    // --- Accessors ---

    pub fn base(&self) -> &BaseState {
        &self.base
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn process_info(&self) -> &ProcessInfo {
        &self.process_info
    }

    pub fn log(&self) -> &RunLog {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut RunLog {
        &mut self.log
    }

    pub fn into_log(self) -> RunLog {
        self.log
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    // --- Chain execution ---

    /// Runs a command chain and returns one result per executed step.
    ///
    /// Per-step failures are recorded in the results; only configuration and
    /// parameter-index errors come back as `Err`.
    pub fn run(&mut self, command: &str) -> Result<Vec<StepResult>, EngineError> {
        let chain = self.resolve_command(command)?;
        self.log
            .general(&format!("Processing command(s):{}", chain.to_uppercase()));

        let mut queue: VecDeque<String> = chain
            .split('+')
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        if self.user_code.has_function(EVENT_ON_START) {
            queue.push_front(EVENT_ON_START.to_string());
        }
        let has_exit_event = self.user_code.has_function(EVENT_ON_EXIT);
        if has_exit_event {
            queue.push_back(EVENT_ON_EXIT.to_string());
        }

        let mut results = Vec::new();
        while let Some(token) = queue.pop_front() {
            let step = self.parse_step(&token);
            let Some(target) = self.resolve_target(&step) else {
                self.log
                    .warning(&format!("Command/Err: Unknown command:{}", step.code));
                match self.policy {
                    UnresolvedPolicy::Skip => continue,
                    UnresolvedPolicy::CollapseToExit => {
                        if collapse_to_exit(&mut queue) {
                            continue;
                        }
                        break;
                    }
                }
            };

            let (cmd, category, desc, critical, event) = match &target {
                Target::Builtin(def) => {
                    let category = if step.index > 0 {
                        format!("{}{}", step.code, step.index)
                    } else {
                        step.code.clone()
                    };
                    (
                        step.code.clone(),
                        category,
                        def.desc.to_string(),
                        CHAIN_CRITICAL_COMMANDS.contains(&def.code),
                        false,
                    )
                }
                Target::User { name, event } => {
                    let desc = if *event {
                        format!("User defined event ({name})")
                    } else {
                        self.registry
                            .user_description(name)
                            .unwrap_or_default()
                            .to_string()
                    };
                    (name.clone(), name.clone(), desc, true, *event)
                }
            };

            self.log.create_category(&category);
            self.log.general(&format!("Command:{category}->{desc}"));
            if step.index > 0 {
                self.log.general(&format!(
                    "Using parameter values at index ({})",
                    step.index
                ));
            }

            let outcome = match self.dispatch(&target, &step) {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.log.critical(&e.to_string());
                    self.log.status(STATUS_FAILED);
                    self.log.close_category();
                    return Err(e);
                }
            };

            let status = outcome.status();
            let mut result = StepResult::new(cmd, status, outcome.output().cloned());
            if event {
                result = result.as_event();
            }
            results.push(result);
            self.log.status(if status { STATUS_OK } else { STATUS_FAILED });
            self.log.close_category();

            if !status && critical {
                if token != EVENT_ON_EXIT && collapse_to_exit(&mut queue) {
                    continue;
                }
                break;
            }
            if let Some(chain) = outcome.upd_chain() {
                log::debug!("Step ({}) replaced the remaining chain with {:?}", token, chain);
                let keep_exit = has_exit_event
                    && queue.back().is_some_and(|t| t == EVENT_ON_EXIT)
                    && !chain.iter().any(|t| t == EVENT_ON_EXIT);
                queue = chain.iter().cloned().collect();
                if keep_exit {
                    queue.push_back(EVENT_ON_EXIT.to_string());
                }
            }
        }
        Ok(results)
    }

    fn resolve_command(&mut self, command: &str) -> Result<String, EngineError> {
        let command: String = command.chars().filter(|c| !c.is_whitespace()).collect();
        let chain = if command.eq_ignore_ascii_case(DEFAULT_COMMAND_SENTINEL) {
            let from_doc: String = self
                .document
                .value_of("Command")
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect();
            self.log
                .general(&format!("Using default command(s):{from_doc}"));
            from_doc
        } else {
            command
        };
        if chain.is_empty() {
            self.log.critical(&EngineError::EmptyCommand.to_string());
            return Err(EngineError::EmptyCommand);
        }
        Ok(chain)
    }

    /// Splits a token into code and index; a malformed index is warned about
    /// and read as 0.
    fn parse_step(&mut self, token: &str) -> CommandStep {
        let (code, index) = match parse_token(token) {
            Ok(parsed) => parsed,
            Err(code) => {
                self.log.warning(&format!(
                    "Command/Err: Invalid command index:{}",
                    token.to_uppercase()
                ));
                (code, 0)
            }
        };
        CommandStep {
            code,
            index,
            token: token.to_string(),
        }
    }

    fn resolve_target(&mut self, step: &CommandStep) -> Option<Target> {
        if is_event(&step.token) {
            return self.user_code.has_function(&step.token).then(|| Target::User {
                name: step.token.clone(),
                event: true,
            });
        }
        if let Some(def) = Registry::builtin(&step.code) {
            return Some(Target::Builtin(def));
        }
        if self.registry.user_description(&step.token).is_some()
            || self.user_code.has_function(&step.token)
        {
            self.registry.register_user(&step.token);
            return Some(Target::User {
                name: step.token.clone(),
                event: false,
            });
        }
        None
    }

    fn dispatch(&mut self, target: &Target, step: &CommandStep) -> Result<StepOutcome, EngineError> {
        let result = match target {
            Target::Builtin(def) => self.run_builtin(def, step),
            Target::User { name, .. } => Ok(self.run_user_function(name)),
        };
        match result {
            Err(e) if !e.is_fatal() => {
                self.log.critical(&e.to_string());
                Ok(StepOutcome::failed())
            }
            other => other,
        }
    }

    fn run_builtin(
        &mut self,
        def: &'static CommandDefinition,
        step: &CommandStep,
    ) -> Result<StepOutcome, EngineError> {
        match def.handler {
            Handler::Dynamic { function, lead } => {
                self.describe(def);
                let args = self.lead_args(lead);
                self.invoke_dynamic(
                    def.process_key,
                    function,
                    args,
                    step.index,
                    lead == Lead::DatasetWhenOmitted,
                )
            }
            Handler::Fixed {
                function,
                lead,
                params,
            } => {
                self.describe(def);
                let mut args = self.lead_args(lead);
                for p in params {
                    args.push(self.param_value(def.process_key, p, step.index)?);
                }
                self.call_tool(function, &args)?;
                Ok(StepOutcome::ok())
            }
            Handler::Custom(handler) => handler(self, def, step),
        }
    }

    fn run_user_function(&mut self, name: &str) -> StepOutcome {
        let (ok, response) = {
            let mut ctx = UserContext {
                log: &mut self.log,
                document: &mut self.document,
                workspace: self.base.geo_path.clone(),
                mosaic_dataset: self.base.md_name.clone(),
                source_path: self.base.sources.clone(),
                user_args: &self.user_args,
                use_response: false,
                response: None,
                status: None,
                code: None,
            };
            let ok = invoke_user_function(self.user_code.as_mut(), name, &mut ctx);
            let response = ctx.use_response.then(|| ctx.response_value());
            (ok, response)
        };
        if !ok {
            return StepOutcome::failed();
        }

        // The function may have edited the document.
        self.refresh_base();
        let rebuilt = match ProcessInfo::build(&self.document) {
            Ok(info) => {
                self.process_info = info;
                true
            }
            Err(e) => {
                self.log.critical(&e.to_string());
                false
            }
        };
        match response {
            Some(value) => StepOutcome::from_value(&value),
            None => StepOutcome::from_status(rebuilt),
        }
    }

    /// Re-reads workspace, geodatabase and dataset name from the document.
    fn refresh_base(&mut self) {
        let workspace = self.document.value_at_path(XPATH_WORKSPACE);
        let geodatabase = self.document.value_at_path(XPATH_GEODATABASE);
        let lower = geodatabase.to_lowercase();
        let mut geo_path = join_path(&workspace, &geodatabase);
        if !lower.ends_with(GEODATABASE_EXT) && !lower.ends_with("sde") {
            geo_path.push_str(GEODATABASE_EXT);
        }
        self.base.md_name = self.document.value_at_path(XPATH_MOSAIC_DATASET_NAME);
        self.base.geo_path = geo_path.replace('\\', "/");
        self.base.workspace = workspace;
        self.base.geodatabase = geodatabase;
    }

    // --- Helpers shared with the built-in handlers ---

    pub(crate) fn describe(&mut self, def: &CommandDefinition) {
        let line = format!("\t{}:{}", def.desc, self.base.md_name);
        self.log.general(&line);
    }

    pub(crate) fn md_path(&self) -> String {
        self.base.md_path()
    }

    /// Raw process-table value (`#` when unset).
    pub(crate) fn param(&self, process_key: &str, key: &str, index: usize) -> Result<String, EngineError> {
        Ok(self.process_info.value_of(process_key, key, index, None)?)
    }

    pub(crate) fn param_value(
        &self,
        process_key: &str,
        key: &str,
        index: usize,
    ) -> Result<Value, EngineError> {
        self.param(process_key, key, index).map(Value::from)
    }

    pub(crate) fn lead_args(&self, lead: Lead) -> Vec<Value> {
        match lead {
            Lead::Dataset => vec![Value::from(self.md_path())],
            Lead::Nothing | Lead::DatasetWhenOmitted => Vec::new(),
            Lead::RasterTypeTable => vec![Value::from(join_path(
                &self.base.geo_path,
                &format!("AMD_{}_ART", self.base.md_name),
            ))],
            Lead::LogTable => vec![Value::from(join_path(
                &self.base.geo_path,
                &format!("AMD_{}_LOG", self.base.md_name),
            ))],
        }
    }

    pub(crate) fn call_tool(&mut self, name: &str, args: &[Value]) -> Result<Value, EngineError> {
        log::debug!("Calling toolkit ({}) with {} argument(s)", name, args.len());
        Ok(self.toolkit.call(name, args)?)
    }

    /// Calls `function` through the invocation adapter: arguments past the
    /// supplied ones are filled by parameter name from the process table, and
    /// an optional `returnvalue` entry requests a method call on the result.
    pub(crate) fn invoke_dynamic(
        &mut self,
        process_key: &str,
        function: &str,
        mut args: Vec<Value>,
        index: usize,
        md_when_omitted: bool,
    ) -> Result<StepOutcome, EngineError> {
        let Some(signature) = self.toolkit.resolve(function) else {
            self.log
                .critical(&format!("Unable to resolve ({function}) in the toolkit."));
            return Ok(StepOutcome::failed());
        };
        for name in signature.params.iter().skip(args.len()) {
            args.push(self.param_value(process_key, &name.to_lowercase(), index)?);
        }
        // Unset values reach the tool as null so it applies its own default.
        for arg in &mut args {
            if arg.as_str() == Some(DEFAULT_MARKER) {
                *arg = Value::Null;
            }
        }
        if md_when_omitted
            && let Some(first) = args.first_mut()
            && first.is_null()
        {
            *first = Value::from(self.base.md_path());
        }

        let return_value = self.param(process_key, "returnvalue", index)?;
        let sub_call = match parse_sub_call(&return_value) {
            Ok(sub) => sub,
            Err(e) => {
                self.log.critical(&e.to_string());
                return Ok(StepOutcome::failed());
            }
        };

        let mut invoker = DynamicInvoker::new(function, args).with_sub_call(sub_call);
        if !invoker.prepare(self.toolkit.as_ref(), &mut self.log) {
            return Ok(StepOutcome::failed());
        }
        let rewrite = rewrite_args;
        let ok = invoker.invoke(self.toolkit.as_mut(), Some(&rewrite), &mut self.log);
        Ok(StepOutcome::from_status(ok))
    }
}

/// Last-moment argument fixes for tools that expect the filesystem prepared.
fn rewrite_args(function: &str, args: &[Value]) -> Option<Vec<Value>> {
    let target = args.get(1).and_then(Value::as_str).filter(|p| *p != DEFAULT_MARKER);
    if let Some(path) = target {
        if function.ends_with("ExportMosaicDatasetItems") {
            if let Err(e) = fs::create_dir_all(path) {
                log::warn!("Could not create output folder '{}': {}", path, e);
            }
        } else if function.ends_with("StageService") && Path::new(path).exists() {
            if let Err(e) = fs::remove_file(path) {
                log::warn!("Could not remove existing output '{}': {}", path, e);
            }
        }
    }
    Some(args.to_vec())
}

/// Keeps only a trailing `_OnExit` in the queue. Returns false when there is none.
fn collapse_to_exit(queue: &mut VecDeque<String>) -> bool {
    if queue.back().is_some_and(|t| t == EVENT_ON_EXIT) {
        queue.clear();
        queue.push_back(EVENT_ON_EXIT.to_string());
        return true;
    }
    false
}

/// `"AI2"` -> `("AI", 2)`. An unreadable index yields `Err(code)`.
pub fn parse_token(token: &str) -> Result<(String, usize), String> {
    let Some(caps) = STEP_TOKEN_RE.captures(token) else {
        return Err(token.to_uppercase());
    };
    let code = caps.get(1).map_or("", |m| m.as_str()).to_uppercase();
    let rest = caps.get(2).map_or("", |m| m.as_str());
    if rest.is_empty() {
        return Ok((code, 0));
    }
    rest.parse::<usize>().map(|i| (code.clone(), i)).map_err(|_| code)
}

/// Joins two path fragments with `/`.
pub fn join_path(base: &str, name: &str) -> String {
    let base = base.trim_end_matches(['/', '\\']);
    if base.is_empty() {
        return name.to_string();
    }
    format!("{base}/{name}")
}

/// Resolves a bare workspace name (or one that sits inside a `.gdb`) against `root`.
pub fn prefix_folder_path(input: &str, root: &Path) -> String {
    let input = input.trim();
    let (dir, file) = match input.rfind(['/', '\\']) {
        Some(pos) => (
            input.get(..pos).unwrap_or_default(),
            input.get(pos + 1..).unwrap_or_default(),
        ),
        None => ("", input),
    };
    if dir.is_empty() {
        return join_path(&root.to_string_lossy(), file);
    }
    if dir.to_lowercase().contains(GEODATABASE_EXT) {
        return join_path(&root.to_string_lossy(), &format!("{dir}/{file}"));
    }
    input.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::toolkit::{RecordingToolkit, TOOL_EXISTS};
    use crate::core::user_code::{FunctionTable, NoUserCode};
    use serde_json::json;

    fn config(workspace: &Path, command: &str) -> String {
        format!(
            r#"<Application>
  <Command>{command}</Command>
  <Workspace>
    <WorkspacePath>{}</WorkspacePath>
    <Geodatabase>imagery</Geodatabase>
    <MosaicDataset>
      <Name>$MD$</Name>
      <SRS>4326</SRS>
      <Fields><Field><Name>Year</Name><Type>SHORT</Type></Field></Fields>
      <AddRasters><AddRaster>
        <Sources><data_path>C:/src</data_path></Sources>
        <raster_type>Raster Dataset</raster_type>
      </AddRaster></AddRasters>
      <Processes>
        <BuildFootprint><where_clause>#</where_clause></BuildFootprint>
      </Processes>
    </MosaicDataset>
  </Workspace>
</Application>"#,
            workspace.display()
        )
    }

    fn engine_with(
        command: &str,
        toolkit: RecordingToolkit,
        user_code: Box<dyn UserCode>,
        policy: UnresolvedPolicy,
    ) -> (Engine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let doc = Document::parse(&config(dir.path(), command)).unwrap();
        let mut params = DynamicParams::new();
        params.insert("MD", "elevation");
        let options = EngineOptions {
            params,
            root: dir.path().to_path_buf(),
            unresolved: policy,
            ..Default::default()
        };
        let engine = Engine::new(doc, Box::new(toolkit), user_code, RunLog::new("MDCS"), options).unwrap();
        (engine, dir)
    }

    fn cmds(results: &[StepResult]) -> Vec<&str> {
        results.iter().map(|r| r.cmd.as_str()).collect()
    }

    #[test]
    fn test_parse_token_splits_code_and_index() {
        assert_eq!(parse_token("AI2"), Ok(("AI".to_string(), 2)));
        assert_eq!(parse_token("ai"), Ok(("AI".to_string(), 0)));
        assert_eq!(parse_token("BF1.5"), Err("BF".to_string()));
    }

    #[test]
    fn test_base_state_from_document() {
        let (engine, dir) = engine_with("CP", RecordingToolkit::new(), Box::new(NoUserCode), UnresolvedPolicy::Skip);
        let base = engine.base();
        assert_eq!(base.md_name, "elevation");
        assert_eq!(base.geodatabase, "imagery.gdb");
        assert_eq!(base.gdb_name(), "imagery");
        assert_eq!(base.geo_path, join_path(&dir.path().to_string_lossy(), "imagery.gdb"));
        assert!(!base.is_sde);
    }

    #[test]
    fn test_default_command_runs_configured_chain_in_order() {
        let toolkit = RecordingToolkit::new().with_result(TOOL_EXISTS, json!(true));
        let (mut engine, _dir) = engine_with("CM+AF+AR", toolkit, Box::new(NoUserCode), UnresolvedPolicy::Skip);
        let results = engine.run("#DEFAULTS").unwrap();
        assert_eq!(cmds(&results), vec!["CM", "AF", "AR"]);
        assert!(results.iter().all(|r| r.value));

        let messages = engine.log().messages();
        assert_eq!(messages.iter().filter(|m| m.starts_with("Command:")).count(), 3);
        let statuses = engine
            .log()
            .entries()
            .into_iter()
            .filter(|e| e.kind == crate::core::run_log::MessageKind::Status)
            .count();
        assert_eq!(statuses, 3);
    }

    #[test]
    fn test_failed_add_rasters_aborts_chain_but_is_recorded() {
        let handle = RecordingToolkit::new()
            .with_result(TOOL_EXISTS, json!(true))
            .failing("management.AddRastersToMosaicDataset");
        let (mut engine, _dir) = engine_with("", handle.clone(), Box::new(NoUserCode), UnresolvedPolicy::Skip);
        let results = engine.run("AR+CP").unwrap();
        assert_eq!(cmds(&results), vec!["AR"]);
        assert!(!results[0].value);
        assert!(!handle.call_names().contains(&"management.Compact".to_string()));
    }

    #[test]
    fn test_non_critical_failure_continues() {
        let toolkit = RecordingToolkit::new().failing("management.Compact");
        let (mut engine, _dir) = engine_with("", toolkit, Box::new(NoUserCode), UnresolvedPolicy::Skip);
        let results = engine.run("CP+CP").unwrap();
        assert_eq!(cmds(&results), vec!["CP", "CP"]);
        assert!(results.iter().all(|r| !r.value));
    }

    #[test]
    fn test_upd_chain_replaces_remaining_queue() {
        let user = FunctionTable::new().with("relink", |ctx| {
            ctx.use_response = true;
            ctx.response = Some(json!({"status": true, "output": "x", "upd_chain": ["CP", "hello"]}));
            Ok(true)
        }).with("hello", |_| Ok(true));
        let (mut engine, _dir) = engine_with("", RecordingToolkit::new(), Box::new(user), UnresolvedPolicy::Skip);
        let results = engine.run("relink+AR+BF").unwrap();
        assert_eq!(cmds(&results), vec!["relink", "CP", "hello"]);
        assert_eq!(results[0].output, Some(json!("x")));
    }

    #[test]
    fn test_lifecycle_events_wrap_chain_and_survive_abort() {
        let user = FunctionTable::new()
            .with("_OnStart", |_| Ok(true))
            .with("_OnExit", |_| Ok(true));
        let toolkit = RecordingToolkit::new().failing("management.AddRastersToMosaicDataset");
        let (mut engine, _dir) = engine_with("", toolkit, Box::new(user), UnresolvedPolicy::Skip);
        let results = engine.run("AR+CP").unwrap();
        assert_eq!(cmds(&results), vec!["_OnStart", "AR", "_OnExit"]);
        assert!(results[0].event && results[2].event);
        assert!(!results[1].value);
    }

    #[test]
    fn test_failed_user_command_aborts_chain() {
        let user = FunctionTable::new().with("customCV", |_| Err("boom".to_string()));
        let (mut engine, _dir) = engine_with("", RecordingToolkit::new(), Box::new(user), UnresolvedPolicy::Skip);
        let results = engine.run("customCV+CP").unwrap();
        assert_eq!(cmds(&results), vec!["customCV"]);
        assert!(engine.registry().user_description("customCV").is_some());
    }

    #[test]
    fn test_unknown_command_policies() {
        let (mut engine, _dir) = engine_with("", RecordingToolkit::new(), Box::new(NoUserCode), UnresolvedPolicy::Skip);
        let results = engine.run("XYZ+CP").unwrap();
        assert_eq!(cmds(&results), vec!["CP"]);
        assert!(engine.log().messages().contains(&"Command/Err: Unknown command:XYZ".to_string()));

        let user = FunctionTable::new().with("_OnExit", |_| Ok(true));
        let (mut engine, _dir) =
            engine_with("", RecordingToolkit::new(), Box::new(user), UnresolvedPolicy::CollapseToExit);
        let results = engine.run("CP+XYZ+CP").unwrap();
        assert_eq!(cmds(&results), vec!["CP", "_OnExit"]);
    }

    #[test]
    fn test_parameter_index_out_of_range_is_fatal() {
        let toolkit = RecordingToolkit::new().with_tool("management.BuildFootprints", &["in_mosaic_dataset", "where_clause"]);
        let (mut engine, _dir) = engine_with("", toolkit, Box::new(NoUserCode), UnresolvedPolicy::Skip);
        let err = engine.run("BF3").unwrap_err();
        assert!(matches!(err, EngineError::ProcessInfo(ProcessInfoError::IndexOutOfRange { index: 3, .. })));
    }

    #[test]
    fn test_empty_default_command_is_fatal() {
        let (mut engine, _dir) = engine_with("", RecordingToolkit::new(), Box::new(NoUserCode), UnresolvedPolicy::Skip);
        assert!(matches!(engine.run("#defaults"), Err(EngineError::EmptyCommand)));
    }

    #[test]
    fn test_dynamic_command_fills_arguments_from_process_table() {
        let handle = RecordingToolkit::new()
            .with_tool("management.ComputeDirtyArea", &["in_mosaic_dataset", "timestamp", "where_clause"]);
        let (mut engine, _dir) = engine_with("", handle.clone(), Box::new(NoUserCode), UnresolvedPolicy::Skip);
        let results = engine.run("CDA").unwrap();
        assert!(results[0].value);
        let call = handle.calls().pop().unwrap();
        assert_eq!(call.name, "management.ComputeDirtyArea");
        assert_eq!(call.args[0], json!(engine.base().md_path()));
        assert_eq!(&call.args[1..], &[Value::Null, Value::Null]);
    }

    #[test]
    fn test_prefix_folder_path() {
        let root = Path::new("/mdcs");
        assert_eq!(prefix_folder_path("output", root), "/mdcs/output");
        assert_eq!(prefix_folder_path("a.gdb/x", root), "/mdcs/a.gdb/x");
        assert_eq!(prefix_folder_path("/data/ws", root), "/data/ws");
    }
}
