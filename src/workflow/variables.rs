//! Placeholder substitution for `${name}` syntax
//!
//! A [`VariableResolver`] owns a fixed name → value table. Substitution is
//! single-pass: a substituted value is never scanned again.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

static PLACEHOLDER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]*)\}").unwrap());

/// Errors that can occur during placeholder substitution
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VariableError {
    #[error("Unresolved placeholder ${{{name}}} in \"{text}\"")]
    Unresolved { name: String, text: String },
}

/// Replaces `${name}` placeholders using a fixed table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariableResolver {
    entries: BTreeMap<String, String>,
}

impl VariableResolver {
    /// Create a resolver over the given entries
    pub fn new<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Create a resolver seeded from the process environment and host properties
    pub fn system() -> Self {
        Self::system_with(std::iter::empty::<(String, String)>())
    }

    /// Like [`VariableResolver::system`], with extra entries taking precedence
    pub fn system_with<I, K, V>(extra: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut entries: BTreeMap<String, String> = BTreeMap::new();
        entries.insert("os.name".to_string(), std::env::consts::OS.to_string());
        entries.insert("os.arch".to_string(), std::env::consts::ARCH.to_string());
        if let Ok(dir) = std::env::current_dir() {
            entries.insert("user.dir".to_string(), dir.display().to_string());
        }
        entries.extend(std::env::vars());
        entries.extend(extra.into_iter().map(|(k, v)| (k.into(), v.into())));
        Self { entries }
    }

    /// Look up a single variable
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    pub fn entries(&self) -> &BTreeMap<String, String> {
        &self.entries
    }

    /// Replace every `${name}` in `text`.
    ///
    /// Unknown names fail in strict mode and are kept verbatim otherwise.
    pub fn replace(&self, text: &str, strict: bool) -> Result<String, VariableError> {
        let mut result = String::with_capacity(text.len());
        let mut last = 0;

        for cap in PLACEHOLDER_REGEX.captures_iter(text) {
            let whole = cap.get(0).unwrap();
            let name = cap.get(1).unwrap().as_str();
            result.push_str(&text[last..whole.start()]);

            match self.entries.get(name) {
                Some(value) => result.push_str(value),
                None if strict => {
                    return Err(VariableError::Unresolved {
                        name: name.to_string(),
                        text: text.to_string(),
                    })
                }
                None => result.push_str(whole.as_str()),
            }
            last = whole.end();
        }

        result.push_str(&text[last..]);
        Ok(result)
    }

    /// Resolve every value of a map with the same strictness
    pub fn replace_values(
        &self,
        values: &BTreeMap<String, String>,
        strict: bool,
    ) -> Result<BTreeMap<String, String>, VariableError> {
        values
            .iter()
            .map(|(k, v)| Ok((k.clone(), self.replace(v, strict)?)))
            .collect()
    }
}
