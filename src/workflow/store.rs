//! Flat key-value store in line-oriented `key = value` text
//!
//! Both the compiled graph and the engine profile live in this format. Keys are
//! dot-separated paths kept in sorted order, so all entries under a prefix form
//! one contiguous range that can be read without visiting unrelated entries.

use std::collections::BTreeMap;
use std::fs;
use std::ops::Bound;
use std::path::{Path, PathBuf};

use super::graph::GraphError;
use super::script::ScriptError;

/// Errors raised while reading, writing or decoding a store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to access store {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed store entry at line {line}: {message}")]
    Malformed { line: usize, message: String },

    #[error("Missing store entry '{0}'")]
    MissingKey(String),

    #[error("Invalid value '{value}' for '{key}': {message}")]
    InvalidValue {
        key: String,
        value: String,
        message: String,
    },

    #[error("Unknown flow '{0}'")]
    UnknownFlow(String),

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Sorted string map with text serialization
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyStore {
    entries: BTreeMap<String, String>,
}

impl PropertyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a store from a file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Write this store to a file, replacing any previous content
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let path = path.as_ref();
        fs::write(path, self.to_text()).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Entries whose key starts with `prefix`, visiting only that key range
    pub fn prefixed<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'a str, &'a str)> {
        self.entries
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(move |(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Entries under `prefix` with the prefix stripped
    pub fn sub_map(&self, prefix: &str) -> BTreeMap<String, String> {
        self.prefixed(prefix)
            .map(|(k, v)| (k[prefix.len()..].to_string(), v.to_string()))
            .collect()
    }

    /// Distinct next path segments below `prefix` (which should end with `.`)
    pub fn child_keys(&self, prefix: &str) -> Vec<String> {
        let mut children: Vec<String> = Vec::new();
        for (key, _) in self.prefixed(prefix) {
            let rest = &key[prefix.len()..];
            let child = rest.split('.').next().unwrap_or(rest);
            if child.is_empty() {
                continue;
            }
            if children.last().map(String::as_str) != Some(child) {
                children.push(child.to_string());
            }
        }
        children.dedup();
        children
    }

    /// Parse store text
    pub fn parse(text: &str) -> Result<Self, StoreError> {
        let mut entries = BTreeMap::new();
        for (line_no, logical) in logical_lines(text) {
            let (key, value) = split_entry(&logical);
            let key = unescape(key).map_err(|message| StoreError::Malformed {
                line: line_no,
                message,
            })?;
            let value = unescape(value).map_err(|message| StoreError::Malformed {
                line: line_no,
                message,
            })?;
            if key.is_empty() {
                return Err(StoreError::Malformed {
                    line: line_no,
                    message: "empty key".to_string(),
                });
            }
            entries.insert(key, value);
        }
        Ok(Self { entries })
    }

    /// Render store text, one entry per line in key order
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.entries {
            out.push_str(&escape(key, true));
            out.push_str(" = ");
            out.push_str(&escape(value, false));
            out.push('\n');
        }
        out
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for PropertyStore {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl<K: Into<String>, V: Into<String>> Extend<(K, V)> for PropertyStore {
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        self.entries
            .extend(iter.into_iter().map(|(k, v)| (k.into(), v.into())));
    }
}

/// Join continuation lines and drop comments, keeping the first line number
fn logical_lines(text: &str) -> Vec<(usize, String)> {
    let mut result = Vec::new();
    let mut current: Option<(usize, String)> = None;

    for (index, raw) in text.lines().enumerate() {
        let line = match current {
            Some(_) => raw.trim_start(),
            None => {
                let trimmed = raw.trim_start();
                if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('!') {
                    continue;
                }
                trimmed
            }
        };

        let continued = ends_with_odd_backslashes(line);
        let content = if continued {
            &line[..line.len() - 1]
        } else {
            line
        };

        let entry = current.get_or_insert_with(|| (index + 1, String::new()));
        entry.1.push_str(content);

        if !continued {
            if let Some(done) = current.take() {
                result.push(done);
            }
        }
    }
    if let Some(done) = current.take() {
        result.push(done);
    }
    result
}

fn ends_with_odd_backslashes(line: &str) -> bool {
    line.chars().rev().take_while(|&c| c == '\\').count() % 2 == 1
}

/// Split a logical line at the first unescaped separator
fn split_entry(line: &str) -> (&str, &str) {
    let bytes = line.as_bytes();
    let mut i = 0;
    let mut key_end = line.len();
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'=' | b':' | b' ' | b'\t' | b'\x0c' => {
                key_end = i;
                break;
            }
            _ => i += 1,
        }
    }
    if key_end >= line.len() {
        return (line, "");
    }

    let rest = line[key_end..].trim_start_matches([' ', '\t', '\x0c']);
    let rest = rest
        .strip_prefix('=')
        .or_else(|| rest.strip_prefix(':'))
        .unwrap_or(rest);
    (&line[..key_end], rest.trim_start_matches([' ', '\t', '\x0c']))
}

fn unescape(text: &str) -> Result<String, String> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('f') => out.push('\x0c'),
            Some('u') => {
                let hex: String = chars.by_ref().take(4).collect();
                let code = u32::from_str_radix(&hex, 16)
                    .ok()
                    .filter(|_| hex.len() == 4)
                    .ok_or_else(|| format!("malformed \\u escape '\\u{}'", hex))?;
                let decoded = char::from_u32(code)
                    .ok_or_else(|| format!("invalid code point \\u{}", hex))?;
                out.push(decoded);
            }
            Some(other) => out.push(other),
            None => {}
        }
    }
    Ok(out)
}

fn escape(text: &str, is_key: bool) -> String {
    let mut out = String::with_capacity(text.len());
    for (index, c) in text.chars().enumerate() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\x0c' => out.push_str("\\f"),
            ' ' if is_key || index == 0 => out.push_str("\\ "),
            '=' | ':' | '#' | '!' if is_key => {
                out.push('\\');
                out.push(c);
            }
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}
