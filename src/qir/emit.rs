#![forbid(unsafe_code)]

//! Persists lowered operations as named VIEW or STABLE FUNCTION DDL.
//!
//! Operation names are sanitized and prefixed with `op_`; function
//! parameters take their names from the collected parameter list in ordinal
//! order, so `$n` in the body lines up with the n-th declared argument.

use rustc_hash::FxHashSet;
use tracing::debug;

use crate::qir::config::CompilerConfig;
use crate::qir::errors::{QirError, Result};
use crate::qir::ident::{self, check_length, sanitize_base};
use crate::qir::ir::{Param, QueryPlan, Relation};
use crate::qir::lower::{LoweredQuery, Lowerer};
use crate::qir::types::normalize_type;

/// Prefix carried by every generated operation name.
pub const OPERATION_PREFIX: &str = "op_";

/// Emits VIEW/FUNCTION DDL for plans.
pub struct Emitter<'a> {
    config: &'a CompilerConfig,
    lowerer: &'a Lowerer<'a>,
}

impl<'a> Emitter<'a> {
    /// Creates an emitter that lowers through `lowerer`.
    pub fn new(config: &'a CompilerConfig, lowerer: &'a Lowerer<'a>) -> Self {
        Self { config, lowerer }
    }

    /// `CREATE OR REPLACE VIEW schema.op_<name> AS <select>;`
    ///
    /// Views cannot bind placeholders, so a plan with parameters is rejected.
    pub fn emit_view(&self, name: &str, plan: &QueryPlan) -> Result<String> {
        check_output_names(plan)?;
        let lowered = self.lowerer.lower(plan)?;
        if let Some(first) = lowered.params.first() {
            return Err(QirError::validation(
                "params",
                format!(
                    "a view cannot bind parameters ({} found, first '{}')",
                    lowered.params.len(),
                    first.name
                ),
            ));
        }
        let target = self.qualified_name(name)?;
        debug!(name = %target, "qir.emit.view");
        Ok(format!("CREATE OR REPLACE VIEW {target} AS {};", lowered.sql))
    }

    /// `CREATE OR REPLACE FUNCTION schema.op_<name>(...) RETURNS SETOF jsonb`
    /// wrapping the select as `SELECT to_jsonb(q.*) FROM (<select>) q`.
    pub fn emit_function(&self, name: &str, plan: &QueryPlan) -> Result<String> {
        check_output_names(plan)?;
        let lowered = self.lowerer.lower(plan)?;
        self.function_ddl(name, &lowered)
    }

    /// Renders function DDL for an already lowered query.
    pub fn function_ddl(&self, name: &str, lowered: &LoweredQuery) -> Result<String> {
        let target = self.qualified_name(name)?;
        let args = self.function_args(&lowered.params)?;
        let body = format!("SELECT to_jsonb(q.*) FROM ({}) q", lowered.sql);
        let tag = dollar_tag(&body);
        debug!(name = %target, params = lowered.params.len(), "qir.emit.function");
        Ok(format!(
            "CREATE OR REPLACE FUNCTION {target}({}) RETURNS SETOF jsonb LANGUAGE sql STABLE AS {tag} {body} {tag};",
            args.join(", ")
        ))
    }

    fn qualified_name(&self, name: &str) -> Result<String> {
        let op = operation_name(name)?;
        let policy = self.config.identifier_policy;
        Ok(format!(
            "{}.{}",
            ident::render(&self.config.schema, policy)?,
            ident::render(&op, policy)?
        ))
    }

    fn function_args(&self, params: &[Param]) -> Result<Vec<String>> {
        let default_ty = normalize_type(&self.config.function_param_default_type).ok_or_else(|| {
            QirError::validation(
                "functionParamDefaultType",
                format!(
                    "unsupported type '{}'",
                    self.config.function_param_default_type
                ),
            )
        })?;
        let mut used: Vec<String> = Vec::with_capacity(params.len());
        let mut args = Vec::with_capacity(params.len());
        for param in params {
            let name = unique_param_name(&param.name, &used)?;
            let ty = match param.type_hint.as_deref() {
                Some(raw) => normalize_type(raw).ok_or_else(|| {
                    QirError::parameter_type(&param.name, format!("unsupported type '{raw}'"))
                })?,
                None => default_ty.clone(),
            };
            args.push(format!(
                "{} {ty}",
                ident::render(&name, self.config.identifier_policy)?
            ));
            used.push(name);
        }
        Ok(args)
    }
}

/// A persisted operation exposes its output row by name, so every output
/// column must be named once. `SELECT *` over a join repeats shared names.
fn check_output_names(plan: &QueryPlan) -> Result<()> {
    if plan.projection.is_empty() {
        if joins_relations(&plan.root) {
            return Err(QirError::validation(
                "columns",
                "an operation over joined relations must list its columns",
            ));
        }
        return Ok(());
    }
    let mut seen = FxHashSet::default();
    for item in &plan.projection {
        if !seen.insert(item.alias.as_str()) {
            return Err(QirError::validation(
                "columns",
                format!("duplicate output column '{}'", item.alias),
            ));
        }
    }
    Ok(())
}

fn joins_relations(rel: &Relation) -> bool {
    match rel {
        Relation::Join { .. } => true,
        Relation::Filter { input, .. } => joins_relations(input),
        _ => false,
    }
}

/// Sanitized, prefixed, length-checked operation name.
///
/// `"My Op!"` becomes `op_my_op`; a name with nothing usable becomes
/// `op_unnamed` rather than the bare prefix.
pub fn operation_name(raw: &str) -> Result<String> {
    let base = sanitize_base(raw, "op");
    let name = if base == "op" {
        format!("{OPERATION_PREFIX}unnamed")
    } else if base.starts_with(OPERATION_PREFIX) {
        base
    } else {
        format!("{OPERATION_PREFIX}{base}")
    };
    check_length(&name)?;
    Ok(name)
}

fn unique_param_name(raw: &str, used: &[String]) -> Result<String> {
    let base = sanitize_base(raw, "param");
    let mut candidate = base.clone();
    let mut suffix = 2;
    while used.contains(&candidate) {
        candidate = format!("{base}_{suffix}");
        suffix += 1;
    }
    check_length(&candidate)?;
    Ok(candidate)
}

fn dollar_tag(body: &str) -> String {
    if !body.contains("$$") {
        return "$$".to_owned();
    }
    let mut tag = "$qir$".to_owned();
    let mut n = 1;
    while body.contains(&tag) {
        tag = format!("$qir{n}$");
        n += 1;
    }
    tag
}
