//! Ordered environment variable set.
//!
//! Keys are unique. Setting an existing key replaces its value in place, so
//! declaration order is kept stable and a later declaration always wins.

use crate::error::{Result, StratumError};

/// Ordered set of environment variables with unique keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvSet {
    vars: Vec<(String, String)>,
}

impl EnvSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key` to `value`, overriding any earlier value for the same key.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.vars.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.vars.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Apply every entry of `other` on top of this set.
    pub fn merge(&mut self, other: &EnvSet) {
        for (key, value) in other.iter() {
            self.set(key, value);
        }
    }

    /// Render as `KEY=VALUE` strings, the form used by OCI image configs.
    pub fn to_oci_list(&self) -> Vec<String> {
        self.vars.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }

    /// Build from `KEY=VALUE` strings. Entries without `=` are skipped.
    pub fn from_oci_list<S: AsRef<str>>(list: &[S]) -> Self {
        let mut env = Self::new();
        for entry in list {
            if let Some((k, v)) = entry.as_ref().split_once('=') {
                env.set(k, v);
            }
        }
        env
    }

    /// Parse a single `KEY=VALUE` assignment as given on the command line.
    pub fn parse_assignment(s: &str) -> Result<(String, String)> {
        let (key, value) = s.split_once('=').ok_or_else(|| {
            StratumError::ConfigError(format!("Invalid variable (expected KEY=VALUE): {}", s))
        })?;
        let key = key.trim();
        validate_key(key)?;
        Ok((key.to_string(), value.to_string()))
    }

    /// Parse dotenv-style content: `KEY=VALUE` lines, `#` comments, an
    /// optional `export ` prefix, and single- or double-quoted values.
    pub fn parse_env_file(content: &str) -> Result<Self> {
        let mut env = Self::new();

        for (idx, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = line.strip_prefix("export ").unwrap_or(line);

            let (key, value) = line.split_once('=').ok_or_else(|| {
                StratumError::ConfigError(format!(
                    "env file line {}: expected KEY=VALUE, got '{}'",
                    idx + 1,
                    line
                ))
            })?;
            let key = key.trim();
            validate_key(key).map_err(|_| {
                StratumError::ConfigError(format!(
                    "env file line {}: invalid variable name '{}'",
                    idx + 1,
                    key
                ))
            })?;

            env.set(key, parse_env_value(value.trim()));
        }

        Ok(env)
    }
}

impl FromIterator<(String, String)> for EnvSet {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut env = Self::new();
        for (k, v) in iter {
            env.set(k, v);
        }
        env
    }
}

fn validate_key(key: &str) -> Result<()> {
    let mut chars = key.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(StratumError::ConfigError(format!(
            "Invalid environment variable name: '{}'",
            key
        )))
    }
}

fn parse_env_value(value: &str) -> String {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return value[1..value.len() - 1].to_string();
        }
    }
    // Unquoted values may carry a trailing comment
    match value.find(" #") {
        Some(pos) => value[..pos].trim_end().to_string(),
        None => value.to_string(),
    }
}
