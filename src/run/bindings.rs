//! Input bindings and the filename rule every path-bearing value must obey.

use serde::{Deserialize, Serialize};

use crate::errors::RunError;

/// Check a path that will be resolved inside a run's working directory.
///
/// The path must be relative and must not climb out through a `..` segment.
/// This runs before any worker is contacted.
pub fn validate_filename(path: &str) -> Result<(), RunError> {
    if path.trim().is_empty() {
        return Err(RunError::invalid_path(path, "path is empty"));
    }
    if path.starts_with('/') || path.starts_with('\\') {
        return Err(RunError::invalid_path(path, "absolute paths are not allowed"));
    }
    if path.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(RunError::invalid_path(
            path,
            "parent-directory segments are not allowed",
        ));
    }
    Ok(())
}

/// Where an input port gets its data from. Exactly one source per port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum InputSource {
    File(String),
    Value(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputBinding {
    pub name: String,
    pub source: InputSource,
    /// Splits a single value into a list on the worker side.
    pub delimiter: Option<char>,
}

impl InputBinding {
    pub fn file(name: impl Into<String>, path: impl Into<String>) -> Result<Self, RunError> {
        let path = path.into();
        validate_filename(&path)?;
        Ok(Self {
            name: name.into(),
            source: InputSource::File(path),
            delimiter: None,
        })
    }

    pub fn value(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: InputSource::Value(value.into()),
            delimiter: None,
        }
    }

    pub fn file_path(&self) -> Option<&str> {
        match &self.source {
            InputSource::File(path) => Some(path),
            InputSource::Value(_) => None,
        }
    }

    pub fn inline_value(&self) -> Option<&str> {
        match &self.source {
            InputSource::Value(value) => Some(value),
            InputSource::File(_) => None,
        }
    }
}

/// Ordered, name-unique collection of input bindings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputBindings {
    bindings: Vec<InputBinding>,
}

impl InputBindings {
    pub fn iter(&self) -> impl Iterator<Item = &InputBinding> {
        self.bindings.iter()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&InputBinding> {
        self.bindings.iter().find(|b| b.name == name)
    }

    /// Insert or replace in place, keeping first-creation order.
    pub fn upsert(&mut self, binding: InputBinding) {
        match self.bindings.iter_mut().find(|b| b.name == binding.name) {
            Some(existing) => {
                existing.source = binding.source;
                if binding.delimiter.is_some() {
                    existing.delimiter = binding.delimiter;
                }
            }
            None => self.bindings.push(binding),
        }
    }

    pub fn set_delimiter(&mut self, name: &str, delimiter: Option<char>) -> Result<(), RunError> {
        let binding = self
            .bindings
            .iter_mut()
            .find(|b| b.name == name)
            .ok_or_else(|| RunError::invalid_argument(format!("no input named '{name}'")))?;
        binding.delimiter = delimiter;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.bindings.clear();
    }

    pub fn to_vec(&self) -> Vec<InputBinding> {
        self.bindings.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_paths_are_accepted() {
        assert!(validate_filename("in/data.txt").is_ok());
        assert!(validate_filename("a..b/c").is_ok());
        assert!(validate_filename("./out.xml").is_ok());
    }

    #[test]
    fn test_escaping_paths_are_rejected() {
        for path in ["/etc/passwd", "..", "../x", "a/../../b", "a/..", "\\win", "a\\..\\b", ""] {
            let err = validate_filename(path).unwrap_err();
            assert!(
                matches!(err, RunError::InvalidPath { .. }),
                "expected InvalidPath for {path:?}"
            );
        }
    }

    #[test]
    fn test_upsert_keeps_creation_order_and_replaces_source() {
        let mut inputs = InputBindings::default();
        inputs.upsert(InputBinding::value("a", "1"));
        inputs.upsert(InputBinding::file("b", "b.txt").unwrap());
        inputs.upsert(InputBinding::value("b", "inline"));

        let names: Vec<_> = inputs.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        let b = inputs.get("b").unwrap();
        assert_eq!(b.inline_value(), Some("inline"));
        assert_eq!(b.file_path(), None);
    }

    #[test]
    fn test_file_binding_validates_path() {
        assert!(InputBinding::file("x", "../secret").is_err());
    }
}
