//! A single, immutable call.

use std::collections::BTreeMap;

use serde_json::Value;

/// One remote/local call: method name, ordered parameter types, ordered
/// arguments, and attachments. Immutable for the duration of the call —
/// filters that need to pass extra context downstream do so by building a
/// new `Invocation` with additional attachments.
#[derive(Debug, Clone)]
pub struct Invocation {
    method_name: String,
    parameter_types: Vec<String>,
    arguments: Vec<Value>,
    attachments: BTreeMap<String, String>,
}

impl Invocation {
    #[must_use]
    pub fn new(method_name: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self {
            method_name: method_name.into(),
            parameter_types: Vec::new(),
            arguments,
            attachments: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_parameter_types(mut self, types: Vec<String>) -> Self {
        self.parameter_types = types;
        self
    }

    #[must_use]
    pub fn with_attachment(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attachments.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    #[must_use]
    pub fn parameter_types(&self) -> &[String] {
        &self.parameter_types
    }

    #[must_use]
    pub fn arguments(&self) -> &[Value] {
        &self.arguments
    }

    #[must_use]
    pub fn attachment(&self, key: &str) -> Option<&str> {
        self.attachments.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn attachments(&self) -> &BTreeMap<String, String> {
        &self.attachments
    }

    /// Find a [`crate::Url`]-shaped string argument among `arguments`, the
    /// mechanism the adaptive extension dispatcher uses to locate the URL
    /// that carries the extension-name parameter for a given call.
    #[must_use]
    pub fn find_url_argument(&self) -> Option<&str> {
        self.arguments.iter().find_map(|v| match v {
            Value::String(s) if s.contains("://") => Some(s.as_str()),
            _ => None,
        })
    }
}
