// src/system/tool_manifest.rs

//! A [`Toolkit`] whose tools are external commands declared in a TOML file.
//!
//! ```toml
//! [tools."management.BuildFootprints"]
//! params = ["in_mosaic_dataset", "where_clause", "reset_footprint"]
//! run = "gp-runner BuildFootprints"
//!
//! [tools."ia.ClassifyPixelsUsingDeepLearning".methods.save]
//! run = "gp-runner save"
//! ```
//!
//! Arguments are appended to `run` one per word; nulls become `#`. Stdout is
//! read as JSON when it parses, otherwise as a trimmed string.

use crate::constants::DEFAULT_MARKER;
use crate::core::toolkit::{ToolSignature, Toolkit, ToolkitError};
use crate::system::executor::{self, expand_command_line};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Deserialize)]
pub struct ToolManifest {
    #[serde(default)]
    tools: HashMap<String, ToolEntry>,
}

#[derive(Debug, Deserialize)]
struct ToolEntry {
    #[serde(default)]
    params: Vec<String>,
    run: String,
    #[serde(default)]
    methods: HashMap<String, MethodEntry>,
}

#[derive(Debug, Deserialize)]
struct MethodEntry {
    run: String,
}

#[derive(Debug)]
pub struct ManifestToolkit {
    manifest: ToolManifest,
    /// Working directory for every tool; the manifest's folder.
    base_dir: PathBuf,
    environment: BTreeMap<String, String>,
    last_tool: Option<String>,
}

impl ManifestToolkit {
    pub fn load(path: &Path) -> Result<Self, ToolkitError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ToolkitError::Manifest(format!("{}: {e}", path.display())))?;
        let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Self::from_toml_str(&content, base_dir)
    }

    pub fn from_toml_str(content: &str, base_dir: impl Into<PathBuf>) -> Result<Self, ToolkitError> {
        let manifest: ToolManifest =
            toml::from_str(content).map_err(|e| ToolkitError::Manifest(e.to_string()))?;
        log::debug!("Toolkit manifest declares {} tool(s).", manifest.tools.len());
        Ok(Self {
            manifest,
            base_dir: base_dir.into(),
            environment: BTreeMap::new(),
            last_tool: None,
        })
    }

    fn env_vars(&self) -> HashMap<String, String> {
        self.environment
            .iter()
            .map(|(k, v)| (format!("MDCS_ENV_{}", k.to_uppercase()), v.clone()))
            .collect()
    }

    fn run(&self, name: &str, line: &str, args: &[Value]) -> Result<Value, ToolkitError> {
        let mut command = expand_command_line(line)?;
        command.extend(args.iter().map(argument_text));
        let cwd = (!self.base_dir.as_os_str().is_empty()).then_some(self.base_dir.as_path());
        let stdout = executor::execute_and_capture_output(&command, cwd, &self.env_vars())
            .map_err(|e| ToolkitError::CallFailed {
                name: name.to_string(),
                message: e.to_string(),
            })?;
        Ok(parse_output(&stdout))
    }
}

impl Toolkit for ManifestToolkit {
    fn resolve(&self, name: &str) -> Option<ToolSignature> {
        self.manifest.tools.get(name).map(|entry| ToolSignature {
            name: name.to_string(),
            params: entry.params.clone(),
        })
    }

    fn call(&mut self, name: &str, args: &[Value]) -> Result<Value, ToolkitError> {
        let entry = self
            .manifest
            .tools
            .get(name)
            .ok_or_else(|| ToolkitError::NotFound(name.to_string()))?;
        let result = self.run(name, &entry.run, args);
        self.last_tool = Some(name.to_string());
        result
    }

    /// Methods are looked up on the tool that produced the last result.
    fn call_method(
        &mut self,
        target: &Value,
        method: &str,
        args: &[Value],
    ) -> Result<Option<Value>, ToolkitError> {
        let Some(entry) = self
            .last_tool
            .as_ref()
            .and_then(|tool| self.manifest.tools.get(tool))
            .and_then(|entry| entry.methods.get(method))
        else {
            return Ok(None);
        };
        let mut all_args = vec![target.clone()];
        all_args.extend_from_slice(args);
        self.run(method, &entry.run, &all_args).map(Some)
    }

    fn set_environment(&mut self, key: &str, value: &str) -> Result<(), ToolkitError> {
        self.environment.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

fn argument_text(value: &Value) -> String {
    match value {
        Value::Null => DEFAULT_MARKER.to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Empty output is null; JSON is taken as is; anything else is a string.
pub fn parse_output(stdout: &str) -> Value {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::from(trimmed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const MANIFEST: &str = r#"
[tools."management.Exists"]
params = ["in_data"]
run = "sh -c 'echo true' exists"

[tools."management.Echo"]
params = ["a", "b"]
run = "echo"

[tools."management.Env"]
run = "sh -c 'echo ${MDCS_ENV_WORKSPACE:-unset}'"

[tools."management.Broken"]
run = "sh -c 'exit 2'"

[tools."ia.Classify"]
run = "echo raster-1"

[tools."ia.Classify".methods.save]
run = "echo saved"
"#;

    fn toolkit() -> ManifestToolkit {
        ManifestToolkit::from_toml_str(MANIFEST, "").unwrap()
    }

    #[test]
    fn test_resolve_exposes_declared_params() {
        let tk = toolkit();
        assert_eq!(tk.resolve("management.Echo").unwrap().arity(), 2);
        assert!(tk.resolve("management.Nope").is_none());
    }

    #[test]
    fn test_parse_output_prefers_json() {
        assert_eq!(parse_output(" true\n"), json!(true));
        assert_eq!(parse_output("[\"Year\"]"), json!(["Year"]));
        assert_eq!(parse_output("C:/out.tif\n"), json!("C:/out.tif"));
        assert_eq!(parse_output(""), Value::Null);
    }

    #[test]
    fn test_invalid_manifest_is_reported() {
        assert!(matches!(
            ManifestToolkit::from_toml_str("[tools.x]\nparams = 3", ""),
            Err(ToolkitError::Manifest(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_calls_run_commands_with_arguments() {
        let mut tk = toolkit();
        assert_eq!(tk.call("management.Exists", &[json!("/gdb/md")]).unwrap(), json!(true));
        assert_eq!(
            tk.call("management.Echo", &[json!("/gdb/md"), Value::Null]).unwrap(),
            json!("/gdb/md #")
        );
        assert!(matches!(
            tk.call("management.Broken", &[]),
            Err(ToolkitError::CallFailed { .. })
        ));
        assert!(matches!(tk.call("management.Nope", &[]), Err(ToolkitError::NotFound(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_environment_is_exported_to_tools() {
        let mut tk = toolkit();
        assert_eq!(tk.call("management.Env", &[]).unwrap(), json!("unset"));
        tk.set_environment("workspace", "/data/scratch").unwrap();
        assert_eq!(tk.call("management.Env", &[]).unwrap(), json!("/data/scratch"));
    }

    #[cfg(unix)]
    #[test]
    fn test_methods_follow_the_last_tool() {
        let mut tk = toolkit();
        let raster = tk.call("ia.Classify", &[]).unwrap();
        assert_eq!(
            tk.call_method(&raster, "save", &[json!("/out.tif")]).unwrap(),
            Some(json!("saved raster-1 /out.tif"))
        );
        assert_eq!(tk.call_method(&raster, "delete", &[]).unwrap(), None);
    }
}
