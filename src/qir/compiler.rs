#![forbid(unsafe_code)]

//! Compiler facade tying the catalog, configuration, and passes together.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, trace};

use crate::qir::builder::build_plan;
use crate::qir::catalog::{Catalog, HeuristicPrimaryKey, PrimaryKeyResolver};
use crate::qir::config::CompilerConfig;
use crate::qir::descriptor::SelectDescriptor;
use crate::qir::emit::Emitter;
use crate::qir::errors::Result;
use crate::qir::explain::{build_explain_tree, compute_plan_hash, ExplainNode};
use crate::qir::ir::{Param, QueryPlan};
use crate::qir::lower::{LoweredQuery, Lowerer};

/// Compiled SELECT with its bind parameters and a deterministic plan hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledQuery {
    /// SELECT text with `$1..$n` placeholders.
    pub sql: String,
    /// Parameters in placeholder order.
    pub params: Vec<Param>,
    /// xxh64 over the explain tree and parameter list.
    pub plan_hash: u64,
}

/// Compiles operation descriptors into SQL.
///
/// Holds only read-only state, so a single instance can be shared across
/// threads.
pub struct Compiler {
    config: CompilerConfig,
    catalog: Arc<dyn Catalog>,
    keys: Option<Arc<dyn PrimaryKeyResolver + Send + Sync>>,
}

impl Compiler {
    /// Creates a compiler over `catalog`.
    pub fn new(config: CompilerConfig, catalog: Arc<dyn Catalog>) -> Self {
        Self {
            config,
            catalog,
            keys: None,
        }
    }

    /// Uses `keys` for tie-breaker resolution instead of the catalog.
    pub fn with_primary_keys(mut self, keys: Arc<dyn PrimaryKeyResolver + Send + Sync>) -> Self {
        self.keys = Some(keys);
        self
    }

    /// Active configuration.
    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// Validates `desc` and builds its plan.
    pub fn build(&self, desc: &SelectDescriptor) -> Result<QueryPlan> {
        build_plan(desc, self.catalog.as_ref())
    }

    /// Lowers a plan to SQL.
    pub fn lower(&self, plan: &QueryPlan) -> Result<LoweredQuery> {
        let keys = self.key_resolution();
        Lowerer::new(self.config.identifier_policy, &keys).lower(plan)
    }

    /// Explain tree for a plan.
    pub fn explain(&self, plan: &QueryPlan) -> ExplainNode {
        build_explain_tree(plan)
    }

    /// Builds and lowers `desc`.
    pub fn compile(&self, desc: &SelectDescriptor) -> Result<CompiledQuery> {
        let plan = self.build(desc)?;
        let lowered = self.lower(&plan)?;
        let explain = self.explain(&plan);
        trace!(plan = %format_args!("{explain:#}"), "qir.compile.explain");
        let plan_hash = compute_plan_hash(&explain, &lowered.params);
        debug!(
            table = %desc.table,
            params = lowered.params.len(),
            plan_hash = format_args!("{plan_hash:016x}"),
            "qir.compile"
        );
        Ok(CompiledQuery {
            sql: lowered.sql,
            params: lowered.params,
            plan_hash,
        })
    }

    /// Deserializes a JSON descriptor and compiles it.
    pub fn compile_json(&self, descriptor: &JsonValue) -> Result<CompiledQuery> {
        self.compile(&SelectDescriptor::from_json(descriptor)?)
    }

    /// Builds `desc` and emits it as `CREATE OR REPLACE VIEW`.
    pub fn emit_view(&self, name: &str, desc: &SelectDescriptor) -> Result<String> {
        let plan = self.build(desc)?;
        let keys = self.key_resolution();
        let lowerer = Lowerer::new(self.config.identifier_policy, &keys);
        Emitter::new(&self.config, &lowerer).emit_view(name, &plan)
    }

    /// Builds `desc` and emits it as a `STABLE` SQL function.
    pub fn emit_function(&self, name: &str, desc: &SelectDescriptor) -> Result<String> {
        let plan = self.build(desc)?;
        let keys = self.key_resolution();
        let lowerer = Lowerer::new(self.config.identifier_policy, &keys);
        Emitter::new(&self.config, &lowerer).emit_function(name, &plan)
    }

    fn key_resolution(&self) -> KeyResolution<'_> {
        KeyResolution {
            explicit: self.keys.as_deref(),
            catalog: self.catalog.as_ref(),
            fallback: HeuristicPrimaryKey(self.config.default_primary_key.clone()),
        }
    }
}

/// Explicit resolver when configured; otherwise the catalog's key, then the
/// configured default column when the table has it.
struct KeyResolution<'a> {
    explicit: Option<&'a (dyn PrimaryKeyResolver + Send + Sync)>,
    catalog: &'a dyn Catalog,
    fallback: HeuristicPrimaryKey,
}

impl PrimaryKeyResolver for KeyResolution<'_> {
    fn primary_key(&self, table: &str) -> Option<String> {
        if let Some(explicit) = self.explicit {
            return explicit.primary_key(table);
        }
        self.catalog.primary_key(table).or_else(|| {
            self.fallback
                .primary_key(table)
                .filter(|column| self.catalog.column_type(table, column).is_some())
        })
    }
}
