// src/core/template.rs

//! `@` references between job steps.
//!
//! A token is either an internal key followed by a path (`@output/dem.gdb`)
//! or a step reference:
//!
//! - `@<step>/i/<key>`: the value the step was given for `key`.
//! - `@<step>/i/p/<KEY>`: the `value$KEY` entry of the step's `p` list.
//! - `@<step>/o/<cmd>`: the output the step's `cmd` command reported.
//!
//! The last segment may carry an accessor chain (`.name`, `[0]`, `['key']`,
//! `.method(args)`) and an assignment (`=value`) which writes through the
//! [`Store`] and yields the assigned value. Tokens embedded in longer text are
//! replaced in place; resolved strings that hold further tokens are expanded
//! again, up to [`MAX_TEMPLATE_DEPTH`] levels.

use crate::constants::MAX_TEMPLATE_DEPTH;
use crate::models::StepResult;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

lazy_static! {
    static ref STEP_REFERENCE_RE: Regex =
        Regex::new(r"^([^/]+)/([io])/([^/]+)(?:/(.+))?$").unwrap();
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TemplateError {
    #[error(
        "Maximum template depth ({0}) exceeded while resolving references. Check for cycles."
    )]
    DepthExceeded(u32),
    #[error("Invalid template expression '{0}'.")]
    Syntax(String),
    #[error("Unknown method '{method}' in '{token}'.")]
    UnknownMethod { token: String, method: String },
    #[error("Cannot assign through '{0}'.")]
    NotAssignable(String),
}

/// What a step reference points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Input {
        step: String,
        key: String,
        /// `KEY` of a `p` entry.
        param: Option<String>,
    },
    Output {
        step: String,
        cmd: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Accessor {
    Attr(String),
    Index(usize),
    Key(String),
    Call { method: String, args: Vec<Value> },
}

/// Where references are looked up and assignments land.
pub trait Store {
    /// Folder behind an internal key (`output`, `payload`, `wp`).
    fn internal(&self, name: &str) -> Option<String>;

    fn get_input(&self, step: &str, key: &str) -> Option<Value>;

    fn get_output(&self, step: &str, cmd: &str) -> Option<Value>;

    fn set_property(
        &mut self,
        reference: &Reference,
        path: &[Accessor],
        value: Value,
    ) -> Result<(), TemplateError>;
}

/// Resolves every `@` token in `text`. A text that is exactly one token
/// yields the referenced value itself; anything else yields a string.
/// Unresolved references read as null.
pub fn resolve(text: &str, store: &mut dyn Store) -> Result<Value, TemplateError> {
    Resolver::new(store).resolve(text)
}

pub struct Resolver<'a> {
    store: &'a mut dyn Store,
    depth: u32,
}

impl<'a> Resolver<'a> {
    pub fn new(store: &'a mut dyn Store) -> Self {
        Self { store, depth: 0 }
    }

    pub fn resolve(&mut self, text: &str) -> Result<Value, TemplateError> {
        if self.depth >= MAX_TEMPLATE_DEPTH {
            return Err(TemplateError::DepthExceeded(MAX_TEMPLATE_DEPTH));
        }
        let spans = token_spans(text);
        if let [(start, end)] = spans.as_slice()
            && *start == 0
            && *end == text.len()
        {
            return self.resolve_token(text);
        }

        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for (start, end) in spans {
            out.push_str(text.get(last..start).unwrap_or_default());
            let value = self.resolve_token(text.get(start..end).unwrap_or_default())?;
            out.push_str(&value_to_text(&value));
            last = end;
        }
        out.push_str(text.get(last..).unwrap_or_default());
        Ok(Value::from(out))
    }

    fn resolve_token(&mut self, token: &str) -> Result<Value, TemplateError> {
        let body = token.strip_prefix('@').unwrap_or(token);
        let mut segments = body.split('/');
        let head = segments.next().unwrap_or_default();

        if let Some(folder) = self.store.internal(head) {
            let rest: Vec<&str> = segments.collect();
            let value = if rest.is_empty() {
                folder
            } else {
                format!("{}/{}", folder.trim_end_matches(['/', '\\']), rest.join("/"))
            };
            return Ok(Value::from(value));
        }

        let (expression, assignment) = match split_assignment(body) {
            Some((e, v)) => (e, Some(v)),
            None => (body, None),
        };
        let Some((reference, chain)) = parse_reference(expression)? else {
            log::debug!("Template token '{}' does not name a step value.", token);
            return Ok(Value::Null);
        };
        let path = parse_accessors(chain, token)?;

        if let Some(raw) = assignment {
            if path.iter().any(|a| matches!(a, Accessor::Call { .. })) {
                return Err(TemplateError::NotAssignable(token.to_string()));
            }
            let value = typed_literal(raw);
            self.store.set_property(&reference, &path, value.clone())?;
            return Ok(value);
        }

        let mut value = self.lookup(&reference);
        for accessor in &path {
            value = apply(&value, accessor, token)?;
        }
        match value {
            Value::String(s) if !token_spans(&s).is_empty() => {
                self.depth += 1;
                let resolved = self.resolve(&s);
                self.depth -= 1;
                resolved
            }
            other => Ok(other),
        }
    }

    fn lookup(&self, reference: &Reference) -> Value {
        match reference {
            Reference::Input { step, key, param } => {
                let value = self.store.get_input(step, key);
                match (param, value) {
                    (None, v) => v.unwrap_or(Value::Null),
                    (Some(p), Some(Value::Array(entries))) => {
                        let suffix = format!("${p}");
                        entries
                            .iter()
                            .filter_map(Value::as_str)
                            .find(|e| e.ends_with(&suffix))
                            .and_then(|e| e.split('$').next())
                            .map_or(Value::Null, Value::from)
                    }
                    (Some(_), _) => Value::Null,
                }
            }
            Reference::Output { step, cmd } => self.store.get_output(step, cmd).unwrap_or(Value::Null),
        }
    }
}

/// Byte spans of the `@` tokens in `text`. A token runs until whitespace,
/// `;` or `$` outside brackets and quotes.
fn token_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut chars = text.char_indices().peekable();
    while let Some((start, c)) = chars.next() {
        if c != '@' {
            continue;
        }
        let mut depth = 0usize;
        let mut quote: Option<char> = None;
        let mut end = text.len();
        while let Some(&(i, c)) = chars.peek() {
            match (quote, c) {
                (Some(q), c) if c == q => quote = None,
                (Some(_), _) => {}
                (None, '\'' | '"') => quote = Some(c),
                (None, '(' | '[') => depth += 1,
                (None, ')' | ']') => depth = depth.saturating_sub(1),
                (None, c) if depth == 0 && (c.is_whitespace() || c == ';' || c == '$') => {
                    end = i;
                    break;
                }
                _ => {}
            }
            chars.next();
        }
        if end > start + 1 {
            spans.push((start, end));
        }
    }
    spans
}

/// Splits `expr=value` at the first `=` outside brackets and quotes.
fn split_assignment(body: &str) -> Option<(&str, &str)> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for (i, c) in body.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '(' | '[') => depth += 1,
            (None, ')' | ']') => depth = depth.saturating_sub(1),
            (None, '=') if depth == 0 => {
                return Some((body.get(..i)?, body.get(i + 1..)?));
            }
            _ => {}
        }
    }
    None
}

/// Splits `step/dir/key[/param]<chain>` into its reference and accessor text.
fn parse_reference(expression: &str) -> Result<Option<(Reference, &str)>, TemplateError> {
    let Some(caps) = STEP_REFERENCE_RE.captures(expression) else {
        return Ok(None);
    };
    let step = caps.get(1).map_or("", |m| m.as_str()).to_string();
    let dir = caps.get(2).map_or("", |m| m.as_str());
    let third = caps.get(3).map_or("", |m| m.as_str());
    let fourth = caps.get(4).map(|m| m.as_str());

    let (last, key_part) = match (dir, fourth) {
        ("i", Some(param)) if third == "p" => (param, None),
        (_, Some(_)) => return Err(TemplateError::Syntax(expression.to_string())),
        (_, None) => (third, Some(())),
    };
    let split_at = last.find(['.', '[']).unwrap_or(last.len());
    let name = last.get(..split_at).unwrap_or(last).to_string();
    let chain = last.get(split_at..).unwrap_or_default();
    if dir == "i" && third == "p" && key_part.is_some() {
        // A `p` reference needs the parameter name.
        return Ok(None);
    }

    let reference = match (dir, key_part) {
        ("i", None) => Reference::Input {
            step,
            key: "p".to_string(),
            param: Some(name),
        },
        ("i", Some(())) => Reference::Input {
            step,
            key: name,
            param: None,
        },
        _ => Reference::Output { step, cmd: name },
    };
    Ok(Some((reference, chain)))
}

fn parse_accessors(mut chain: &str, token: &str) -> Result<Vec<Accessor>, TemplateError> {
    let syntax = || TemplateError::Syntax(token.to_string());
    let mut path = Vec::new();
    while !chain.is_empty() {
        if let Some(rest) = chain.strip_prefix('[') {
            let close = rest.find(']').ok_or_else(syntax)?;
            let inner = rest.get(..close).ok_or_else(syntax)?.trim();
            let unquoted = inner
                .strip_prefix(['\'', '"'])
                .and_then(|s| s.strip_suffix(['\'', '"']));
            path.push(match unquoted {
                Some(key) => Accessor::Key(key.to_string()),
                None => Accessor::Index(inner.parse().map_err(|_| syntax())?),
            });
            chain = rest.get(close + 1..).unwrap_or_default();
        } else if let Some(rest) = chain.strip_prefix('.') {
            let end = rest.find(['.', '[', '(']).unwrap_or(rest.len());
            let name = rest.get(..end).unwrap_or_default().to_string();
            if name.is_empty() {
                return Err(syntax());
            }
            let after = rest.get(end..).unwrap_or_default();
            if let Some(call) = after.strip_prefix('(') {
                let close = call.find(')').ok_or_else(syntax)?;
                let inner = call.get(..close).unwrap_or_default();
                let args = if inner.trim().is_empty() {
                    Vec::new()
                } else {
                    inner.split(',').map(typed_literal).collect()
                };
                path.push(Accessor::Call { method: name, args });
                chain = call.get(close + 1..).unwrap_or_default();
            } else {
                path.push(Accessor::Attr(name));
                chain = after;
            }
        } else {
            return Err(syntax());
        }
    }
    Ok(path)
}

fn apply(value: &Value, accessor: &Accessor, token: &str) -> Result<Value, TemplateError> {
    Ok(match accessor {
        Accessor::Attr(name) | Accessor::Key(name) => {
            value.get(name.as_str()).cloned().unwrap_or(Value::Null)
        }
        Accessor::Index(i) => value.get(*i).cloned().unwrap_or(Value::Null),
        Accessor::Call { method, args } => call_method(value, method, args).ok_or_else(|| {
            TemplateError::UnknownMethod {
                token: token.to_string(),
                method: method.clone(),
            }
        })?,
    })
}

/// The handful of methods configurations use on resolved values.
fn call_method(value: &Value, method: &str, args: &[Value]) -> Option<Value> {
    let text = value.as_str();
    match (method, text) {
        ("upper", Some(s)) => Some(Value::from(s.to_uppercase())),
        ("lower", Some(s)) => Some(Value::from(s.to_lowercase())),
        ("strip", Some(s)) => Some(Value::from(s.trim())),
        ("split", Some(s)) => {
            let sep = args.first().and_then(Value::as_str).unwrap_or(",");
            Some(Value::from(s.split(sep).collect::<Vec<_>>()))
        }
        ("replace", Some(s)) => {
            let from = args.first().and_then(Value::as_str)?;
            let to = args.get(1).and_then(Value::as_str).unwrap_or_default();
            Some(Value::from(s.replace(from, to)))
        }
        ("len", _) => match value {
            Value::String(s) => Some(Value::from(s.chars().count())),
            Value::Array(a) => Some(Value::from(a.len())),
            Value::Object(o) => Some(Value::from(o.len())),
            _ => None,
        },
        _ => None,
    }
}

/// Integer, float, boolean, quoted or bare string.
fn typed_literal(raw: &str) -> Value {
    let raw = raw.trim();
    if let Some(s) = raw
        .strip_prefix(['\'', '"'])
        .and_then(|s| s.strip_suffix(['\'', '"']))
    {
        return Value::from(s);
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = raw.parse::<f64>()
        && let Some(n) = serde_json::Number::from_f64(f)
    {
        return Value::Number(n);
    }
    match raw {
        "true" | "True" => Value::Bool(true),
        "false" | "False" => Value::Bool(false),
        _ => Value::from(raw),
    }
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// --- Step store ---

/// Inputs and results of the steps run so far in a job.
#[derive(Debug, Clone, Default)]
pub struct StepStore {
    internals: BTreeMap<String, String>,
    inputs: BTreeMap<String, Map<String, Value>>,
    results: BTreeMap<String, Vec<StepResult>>,
}

impl StepStore {
    /// `internals` maps internal keys (without `@`) to folders.
    pub fn new(internals: BTreeMap<String, String>) -> Self {
        Self {
            internals,
            ..Default::default()
        }
    }

    /// Records a step's arguments with their `@` references resolved and
    /// returns the resolved set. List entries take the `@ref$KEY` form; only
    /// the part before `$` is resolved.
    pub fn add_input(
        &mut self,
        step: &str,
        args: Map<String, Value>,
    ) -> Result<Map<String, Value>, TemplateError> {
        self.inputs.insert(step.to_string(), args.clone());
        let mut resolved = Map::new();
        for (key, value) in args {
            let value = match value {
                Value::String(s) if s.starts_with('@') => resolve(&s, self)?,
                Value::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(match item.as_str() {
                            Some(s) if s.starts_with('@') => {
                                let (reference, param) = s.split_once('$').unwrap_or((s, ""));
                                let value = resolve(reference, self)?;
                                Value::from(format!("{}${param}", value_to_text(&value)))
                            }
                            _ => item,
                        });
                    }
                    Value::Array(out)
                }
                other => other,
            };
            resolved.insert(key, value);
        }
        self.inputs.insert(step.to_string(), resolved.clone());
        Ok(resolved)
    }

    /// Stores a step's results. Only steps with recorded inputs are accepted.
    pub fn add_results(&mut self, step: &str, results: Vec<StepResult>) -> bool {
        if !self.inputs.contains_key(step) {
            return false;
        }
        self.results.insert(step.to_string(), results);
        true
    }

    pub fn results(&self) -> &BTreeMap<String, Vec<StepResult>> {
        &self.results
    }
}

impl Store for StepStore {
    fn internal(&self, name: &str) -> Option<String> {
        self.internals.get(name).cloned()
    }

    fn get_input(&self, step: &str, key: &str) -> Option<Value> {
        self.inputs.get(step).and_then(|args| args.get(key)).cloned()
    }

    fn get_output(&self, step: &str, cmd: &str) -> Option<Value> {
        self.results
            .get(step)?
            .iter()
            .find(|r| r.cmd == cmd)
            .and_then(|r| r.output.clone())
    }

    fn set_property(
        &mut self,
        reference: &Reference,
        path: &[Accessor],
        value: Value,
    ) -> Result<(), TemplateError> {
        let not_assignable = || TemplateError::NotAssignable(format!("{reference:?}"));
        let target = match reference {
            Reference::Input {
                step,
                key,
                param: None,
            } => self
                .inputs
                .get_mut(step)
                .ok_or_else(not_assignable)?
                .entry(key.clone())
                .or_insert(Value::Null),
            Reference::Output { step, cmd } => {
                let result = self
                    .results
                    .get_mut(step)
                    .and_then(|results| results.iter_mut().find(|r| &r.cmd == cmd))
                    .ok_or_else(not_assignable)?;
                result.output.get_or_insert(Value::Null)
            }
            Reference::Input { param: Some(_), .. } => return Err(not_assignable()),
        };
        assign(target, path, value).ok_or_else(not_assignable)
    }
}

/// Walks `path` inside `target`, creating objects for missing attributes.
fn assign(target: &mut Value, path: &[Accessor], value: Value) -> Option<()> {
    let Some((first, rest)) = path.split_first() else {
        *target = value;
        return Some(());
    };
    let next = match first {
        Accessor::Attr(name) | Accessor::Key(name) => {
            if target.is_null() {
                *target = Value::Object(Map::new());
            }
            target
                .as_object_mut()?
                .entry(name.clone())
                .or_insert(Value::Null)
        }
        Accessor::Index(i) => target.as_array_mut()?.get_mut(*i)?,
        Accessor::Call { .. } => return None,
    };
    assign(next, rest, value)
}
