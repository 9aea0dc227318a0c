#![forbid(unsafe_code)]

use serde::Deserialize;

use crate::qir::ident::IdentifierPolicy;

/// Compiler inputs that influence rendering and emission.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct CompilerConfig {
    /// Identifier quoting policy for every rendered identifier.
    pub identifier_policy: IdentifierPolicy,
    /// Schema that emitted views and functions are created in.
    pub schema: String,
    /// Tie-breaker column assumed when no primary-key resolver is supplied.
    pub default_primary_key: String,
    /// Declared type for emitted function parameters without a type hint.
    pub function_param_default_type: String,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            identifier_policy: IdentifierPolicy::Minimal,
            schema: "public".to_owned(),
            default_primary_key: "id".to_owned(),
            function_param_default_type: "text".to_owned(),
        }
    }
}

impl CompilerConfig {
    /// Strict identifier policy, otherwise default.
    pub fn strict() -> Self {
        Self {
            identifier_policy: IdentifierPolicy::Strict,
            ..Self::default()
        }
    }

    /// Overrides the target schema.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }
}
