use color_eyre::eyre::{bail, eyre, WrapErr};
use color_eyre::Result;
use serde_yaml::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

const MAX_INCLUDE_DEPTH: usize = 10;
const INCLUDE_KEY: &str = "include";

/// Ordered string key/value store.
///
/// Keys keep the position of their first insertion, so the PROPERTIES
/// snapshot sent to the child is stable across reloads.
#[derive(Debug, Clone, Default)]
pub struct Properties {
    entries: Vec<(String, String)>,
    index: HashMap<String, usize>,
}

impl Properties {
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.index.get(&key) {
            Some(&i) => self.entries[i].1 = value,
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, value));
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.index.get(key).map(|&i| self.entries[i].1.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Entries below `prefix.`, yielded with the prefix stripped.
    pub fn children<'a>(&'a self, prefix: &str) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        let prefix = format!("{prefix}.");
        self.iter()
            .filter_map(move |(k, v)| k.strip_prefix(prefix.as_str()).map(|rest| (rest, v)))
    }

    pub fn merge(&mut self, other: Properties) {
        for (key, value) in other.entries {
            self.set(key, value);
        }
    }

    /// Applies `key=value` overrides given on the command line.
    pub fn apply_overrides(&mut self, overrides: &[String]) -> Result<()> {
        for item in overrides {
            let (key, value) = item
                .split_once('=')
                .ok_or_else(|| eyre!("Invalid override {item:?}, expected KEY=VALUE"))?;
            let key = key.trim();
            if key.is_empty() {
                bail!("Invalid override {item:?}, empty key");
            }
            self.set(key, value);
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn from_yaml_str(text: &str) -> Result<Properties> {
        let value: Value = serde_yaml::from_str(text).wrap_err("Failed to parse config")?;
        let mut properties = Properties::default();
        flatten("", &value, &mut properties)?;
        Ok(properties)
    }

    /// Reads a YAML file, resolving `include` entries relative to it.
    pub fn load(path: &Path) -> Result<Properties> {
        let mut stack = Vec::new();
        load_file(path, 0, &mut stack)
    }
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

fn load_file(path: &Path, depth: usize, stack: &mut Vec<PathBuf>) -> Result<Properties> {
    if depth > MAX_INCLUDE_DEPTH {
        bail!(
            "Includes nested deeper than {MAX_INCLUDE_DEPTH} levels at {}",
            path.display()
        );
    }
    let canonical = path
        .canonicalize()
        .wrap_err_with(|| format!("Failed to read config {}", path.display()))?;
    if stack.contains(&canonical) {
        bail!("Include cycle through {}", canonical.display());
    }
    let text = std::fs::read_to_string(&canonical)
        .wrap_err_with(|| format!("Failed to read config {}", canonical.display()))?;
    let value: Value = serde_yaml::from_str(&text)
        .wrap_err_with(|| format!("Failed to parse config {}", canonical.display()))?;
    debug!(path = %canonical.display(), depth, "Loading config");

    let mut properties = Properties::default();
    let paths = includes(&value)?;
    if !paths.is_empty() {
        let base = canonical.parent().map(Path::to_path_buf).unwrap_or_default();
        stack.push(canonical.clone());
        for include in paths {
            properties.merge(load_file(&base.join(include), depth + 1, stack)?);
        }
        stack.pop();
    }
    flatten("", &value, &mut properties)?;
    Ok(properties)
}

fn includes(value: &Value) -> Result<Vec<String>> {
    let Value::Mapping(map) = value else {
        return Ok(Vec::new());
    };
    match map.get(INCLUDE_KEY) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(path)) => Ok(vec![path.clone()]),
        Some(Value::Sequence(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(path) => Ok(path.clone()),
                other => Err(eyre!("Include entries must be paths, got {other:?}")),
            })
            .collect(),
        Some(other) => bail!("Include must be a path or a list of paths, got {other:?}"),
    }
}

fn flatten(prefix: &str, value: &Value, out: &mut Properties) -> Result<()> {
    match value {
        Value::Mapping(map) => {
            for (key, child) in map {
                let key = scalar(key).ok_or_else(|| eyre!("Unsupported key {key:?} below {prefix:?}"))?;
                if prefix.is_empty() && key == INCLUDE_KEY {
                    continue;
                }
                flatten(&join(prefix, &key), child, out)?;
            }
        }
        Value::Sequence(items) => {
            for (i, child) in items.iter().enumerate() {
                flatten(&join(prefix, &(i + 1).to_string()), child, out)?;
            }
        }
        Value::Tagged(tagged) => flatten(prefix, &tagged.value, out)?,
        Value::Null if prefix.is_empty() => {}
        Value::Null => out.set(prefix, ""),
        scalar_value => {
            if prefix.is_empty() {
                bail!("Config must be a mapping");
            }
            let text = scalar(scalar_value).unwrap_or_default();
            out.set(prefix, text);
        }
    }
    Ok(())
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}
