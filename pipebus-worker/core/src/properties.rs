//! Typed key-value configuration store used by handlers.
//!
//! A handler declares the properties it expects (with a description and whether
//! they are required), values are set from definitions or code, and the processor
//! validates that every required property has a value before starting.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Errors that can occur while reading or validating properties.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Property was never declared with `add`.
    #[error("Unknown property: {}", _0)]
    UnknownProperty(String),
    /// Property is declared but has no value.
    #[error("Property '{}' has no value", _0)]
    Unset(String),
    /// Value cannot be read as the requested type.
    #[error("Property '{name}' is not a valid {expected}: {source}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        #[source]
        source: serde_json::Error,
    },
    /// Value has the right type but is out of range.
    #[error("Property '{name}' is invalid: {reason}")]
    InvalidValue { name: String, reason: &'static str },
    /// One or more required properties have no value.
    #[error("Missing required properties: {}", _0.join(", "))]
    MissingProperties(Vec<String>),
}

/// A single declared property.
#[derive(PartialEq, Clone, Debug, Default, Deserialize, Serialize)]
pub struct Property {
    /// Human readable description.
    pub description: String,
    /// Whether validation fails while the value is unset.
    pub required: bool,
    /// Current value.
    pub value: Option<Value>,
}

/// Named set of declared properties.
#[derive(PartialEq, Clone, Debug, Default)]
pub struct Properties {
    name: String,
    entries: BTreeMap<String, Property>,
}

impl Properties {
    pub fn new(name: impl Into<String>) -> Self {
        Properties {
            name: name.into(),
            entries: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declares an expected property. Declaring it again replaces the description
    /// and the required flag but keeps an existing value.
    pub fn add(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        required: bool,
    ) -> &mut Self {
        let entry = self.entries.entry(name.into()).or_default();
        entry.description = description.into();
        entry.required = required;
        self
    }

    /// Sets the value of a declared property.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<(), Error> {
        let entry = self
            .entries
            .get_mut(name)
            .ok_or_else(|| Error::UnknownProperty(name.to_string()))?;
        entry.value = Some(value.into());
        Ok(())
    }

    /// Reads a property as `T`. Returns `Ok(None)` when the value is unset.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, Error> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| Error::UnknownProperty(name.to_string()))?;
        match &entry.value {
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|source| Error::TypeMismatch {
                    name: name.to_string(),
                    expected: std::any::type_name::<T>(),
                    source,
                }),
            None => Ok(None),
        }
    }

    /// Reads a property as `T`, failing when it is unset.
    pub fn require<T: DeserializeOwned>(&self, name: &str) -> Result<T, Error> {
        self.get(name)?
            .ok_or_else(|| Error::Unset(name.to_string()))
    }

    /// Checks that every required property has a value.
    ///
    /// # Errors
    /// Returns `Error::MissingProperties` listing the unset required names in order.
    pub fn validate(&self) -> Result<(), Error> {
        let missing: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, p)| p.required && p.value.is_none())
            .map(|(name, _)| name.clone())
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::MissingProperties(missing))
        }
    }

    /// Applies every entry of `values`. Unknown keys are rejected.
    pub fn apply(&mut self, values: &Map<String, Value>) -> Result<(), Error> {
        for (name, value) in values {
            self.set(name, value.clone())?;
        }
        Ok(())
    }

    /// Snapshot of the properties that currently have a value.
    pub fn values(&self) -> Map<String, Value> {
        self.entries
            .iter()
            .filter_map(|(name, p)| p.value.clone().map(|v| (name.clone(), v)))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Property)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Properties {
        let mut properties = Properties::new("sample");
        properties
            .add("path", "Directory to watch", true)
            .add("interval", "Polling interval in ms", false);
        properties
    }

    #[test]
    fn test_validate_reports_missing_required() {
        let properties = sample();
        let err = properties.validate().unwrap_err();
        assert!(matches!(err, Error::MissingProperties(ref names) if names == &vec!["path".to_string()]));
        assert_eq!(err.to_string(), "Missing required properties: path");
    }

    #[test]
    fn test_set_and_get_typed() {
        let mut properties = sample();
        properties.set("path", "/tmp/in").unwrap();
        properties.set("interval", 250).unwrap();

        assert!(properties.validate().is_ok());
        assert_eq!(properties.require::<String>("path").unwrap(), "/tmp/in");
        assert_eq!(properties.get::<u64>("interval").unwrap(), Some(250));
    }

    #[test]
    fn test_get_type_mismatch() {
        let mut properties = sample();
        properties.set("interval", "soon").unwrap();

        let result = properties.get::<u64>("interval");
        assert!(matches!(result, Err(Error::TypeMismatch { name, .. }) if name == "interval"));
    }

    #[test]
    fn test_unknown_property() {
        let mut properties = sample();
        assert!(matches!(
            properties.set("color", "red"),
            Err(Error::UnknownProperty(name)) if name == "color"
        ));
    }

    #[test]
    fn test_unset_optional_reads_none() {
        let properties = sample();
        assert_eq!(properties.get::<u64>("interval").unwrap(), None);
        assert!(matches!(properties.require::<u64>("interval"), Err(Error::Unset(_))));
    }

    #[test]
    fn test_apply_and_values_snapshot() {
        let mut properties = sample();
        let values = json!({"path": "/data", "interval": 10});
        properties.apply(values.as_object().unwrap()).unwrap();

        assert_eq!(Value::Object(properties.values()), values);
    }
}
