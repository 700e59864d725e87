// src/core/variables.rs

//! `$NAME$` placeholders in configuration text and the `-p` values that fill them.

use std::collections::HashMap;

/// Command-line supplied values for `$NAME$` placeholders.
///
/// Keys are stored upper-cased and the first value given for a key wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DynamicParams {
    values: HashMap<String, String>,
}

impl DynamicParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a value unless the key is blank or already present.
    /// Returns whether the value was stored.
    pub fn insert(&mut self, key: &str, value: &str) -> bool {
        let key = key.trim().to_uppercase();
        if key.is_empty() || self.values.contains_key(&key) {
            return false;
        }
        self.values.insert(key, value.to_string());
        true
    }

    /// Parses a `-p` argument of the form `value$KEY` (or `value@KEY`).
    pub fn insert_flag(&mut self, raw: &str) -> bool {
        match parse_flag(raw) {
            Some((key, value)) => self.insert(&key, &value),
            None => {
                log::debug!("Ignoring parameter without a '$' or '@' key marker: '{}'", raw);
                false
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(&key.to_uppercase()).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Splits `value$KEY` at the last `$`, falling back to the last `@`.
pub fn parse_flag(raw: &str) -> Option<(String, String)> {
    let pos = raw.rfind('$').or_else(|| raw.rfind('@'))?;
    let key = raw.get(pos + 1..)?.to_string();
    let value = raw.get(..pos)?.to_string();
    Some((key, value))
}

/// Splits `input` on `sep` except where the separator is preceded by a
/// backslash; escaped separators are unescaped in the output.
/// Blank input yields no values.
pub fn split_escaped(input: &str, sep: char) -> Vec<String> {
    if input.trim().is_empty() {
        return Vec::new();
    }
    let mut values = Vec::new();
    let mut current = String::new();
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' && chars.peek() == Some(&sep) {
            current.push(sep);
            chars.next();
        } else if c == sep {
            values.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    values.push(current);
    values
}

/// Resolves the `$`-delimited placeholders of a single text value.
///
/// `default;body` supplies a fallback for a body consisting of exactly one
/// unresolved token. Every `$`-terminated segment after the first `$` is looked
/// up; unresolved segments are kept as literal text, and `\$` inside a segment
/// stands for a literal dollar sign. Text with an unterminated token is
/// returned unchanged, and a trailing `$` that opens no token is kept as written.
pub fn substitute(value: &str, params: &DynamicParams) -> String {
    if !value.contains('$') {
        return value.to_string();
    }

    let parts = split_escaped(value, ';');
    let (mut default, body) = match (parts.first(), parts.get(1)) {
        (Some(d), Some(b)) => (d.trim().to_string(), b.trim().to_string()),
        _ => (String::new(), value.to_string()),
    };

    let Some(first) = body.find('$') else {
        return body;
    };
    let (prefix, rest) = body.split_at(first);
    let rest = rest.get(1..).unwrap_or_default();

    let mut segments: Vec<(String, bool)> = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    let mut chars = rest.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'$') => {
                chars.next();
                current.push('$');
                escaped = true;
            }
            '$' => {
                segments.push((std::mem::take(&mut current), escaped));
                escaped = false;
            }
            _ => current.push(c),
        }
    }
    if segments.is_empty() {
        return body;
    }
    let mut tail = current;
    if segments.len() > 1 && segments.last().is_some_and(|(s, e)| s.is_empty() && !e) {
        segments.pop();
        tail.insert(0, '$');
    }

    let whole = prefix.is_empty() && segments.len() == 1 && tail.is_empty();
    let mut out = String::from(prefix);
    for (segment, was_escaped) in segments {
        if let Some(v) = params.get(&segment) {
            out.push_str(v);
            continue;
        }
        if was_escaped {
            out.push_str(&segment);
            continue;
        }
        if default.is_empty() {
            default = segment.clone();
        }
        if whole {
            out.push_str(&default);
        } else {
            out.push_str(&segment);
        }
    }
    out.push_str(&tail);
    out
}
