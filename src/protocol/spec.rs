use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One method within a protocol: an input/result schema pair, expressed as
/// JSON Schema documents (kept opaque to the kernel — it validates structure
/// and membership only, never payload shape).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodSpec {
    pub name: String,
    #[serde(default)]
    pub input_schema: Option<Value>,
    #[serde(default)]
    pub result_schema: Option<Value>,
}

impl MethodSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input_schema: None,
            result_schema: None,
        }
    }
}

/// Immutable descriptor for a named, versioned method surface (e.g. `llm/v1`).
/// Registered once at startup; lookup afterwards is read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolSpec {
    /// `<name>/<version>`, e.g. `llm/v1`.
    pub identifier: String,
    pub methods: Vec<MethodSpec>,
}

impl ProtocolSpec {
    pub fn new(identifier: impl Into<String>, methods: Vec<MethodSpec>) -> Self {
        Self {
            identifier: identifier.into(),
            methods,
        }
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.iter().map(|m| m.name.as_str())
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m.name == method)
    }

    pub fn methods_by_name(&self) -> HashMap<&str, &MethodSpec> {
        self.methods.iter().map(|m| (m.name.as_str(), m)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_method_checks_membership() {
        let spec = ProtocolSpec::new("llm/v1", vec![MethodSpec::new("llm/generate")]);
        assert!(spec.has_method("llm/generate"));
        assert!(!spec.has_method("llm/complete"));
    }
}
