#![forbid(unsafe_code)]

//! SQL lowering engine.
//!
//! Renders a [`QueryPlan`] to PostgreSQL text with one function per node
//! category. Filters are hoisted into the enclosing WHERE accumulator; on
//! the nullable side of a LEFT join they are folded into the join's ON
//! clause instead so outer-join semantics survive.

use serde_json::Value as JsonValue;
use tracing::{debug, trace};

use crate::qir::catalog::PrimaryKeyResolver;
use crate::qir::errors::{IdentifierViolation, QirError, Result};
use crate::qir::ident::{self, IdentifierPolicy};
use crate::qir::ir::{
    ColumnRef, CompareOp, Expr, JoinKind, NullsOrder, OrderBy, Param, Predicate, ProjectionItem,
    QueryPlan, Relation, SortDir,
};
use crate::qir::params::{self, ParamSet};
use crate::qir::types::{is_array, is_json, normalize_type};

/// Rendered SELECT plus the parameters its placeholders bind, in ordinal
/// order (`params[0]` is `$1`).
#[derive(Clone, Debug, PartialEq)]
pub struct LoweredQuery {
    /// SELECT statement text.
    pub sql: String,
    /// Ordered parameter list.
    pub params: Vec<Param>,
}

/// Lowers plans under a fixed identifier policy and tie-breaker resolver.
pub struct Lowerer<'a> {
    policy: IdentifierPolicy,
    keys: &'a dyn PrimaryKeyResolver,
}

impl<'a> Lowerer<'a> {
    /// Creates a lowerer.
    pub fn new(policy: IdentifierPolicy, keys: &'a dyn PrimaryKeyResolver) -> Self {
        Self { policy, keys }
    }

    /// Renders `plan`.
    pub fn lower(&self, plan: &QueryPlan) -> Result<LoweredQuery> {
        let params = params::collect(plan);
        let render = Render {
            policy: self.policy,
            keys: self.keys,
            params: &params,
        };
        let sql = render.select(plan, true)?;
        debug!(params = params.len(), len = sql.len(), "qir.lower.done");
        Ok(LoweredQuery {
            sql,
            params: params.into_params(),
        })
    }
}

struct Render<'a> {
    policy: IdentifierPolicy,
    keys: &'a dyn PrimaryKeyResolver,
    params: &'a ParamSet,
}

impl Render<'_> {
    fn ident(&self, raw: &str) -> Result<String> {
        ident::render(raw, self.policy)
    }

    fn select(&self, plan: &QueryPlan, top: bool) -> Result<String> {
        let (from, conjuncts) = self.relation(&plan.root)?;
        let mut sql = String::from("SELECT ");
        if !plan.distinct_on.is_empty() {
            let keys = self.exprs(&plan.distinct_on)?;
            sql.push_str(&format!("DISTINCT ON ({}) ", keys.join(", ")));
        }
        if plan.projection.is_empty() {
            sql.push('*');
        } else {
            let items = plan
                .projection
                .iter()
                .map(|item| self.projection(item))
                .collect::<Result<Vec<_>>>()?;
            sql.push_str(&items.join(", "));
        }
        sql.push_str(" FROM ");
        sql.push_str(&from);
        if !conjuncts.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conjuncts.join(" AND "));
        }
        let terms = self.order_terms(plan, top)?;
        if !terms.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&terms.join(", "));
        }
        if let Some(limit) = plan.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = plan.offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }
        Ok(sql)
    }

    fn projection(&self, item: &ProjectionItem) -> Result<String> {
        let expr = self.expr(&item.expr)?;
        match &item.expr {
            Expr::Column(ColumnRef { column, .. }) if *column == item.alias => Ok(expr),
            _ => Ok(format!("{expr} AS {}", self.ident(&item.alias)?)),
        }
    }

    /// Returns the FROM fragment and the WHERE conjuncts hoisted out of it.
    fn relation(&self, rel: &Relation) -> Result<(String, Vec<String>)> {
        match rel {
            Relation::Table { name, alias } => Ok((
                format!(
                    "{} {}",
                    ident::render_qualified(name, self.policy)?,
                    self.ident(alias)?
                ),
                Vec::new(),
            )),
            Relation::Lateral { plan, alias } => Ok((
                format!("LATERAL ({}) {}", self.select(plan, false)?, self.ident(alias)?),
                Vec::new(),
            )),
            Relation::Subquery { plan, alias } => Ok((
                format!("({}) {}", self.select(plan, false)?, self.ident(alias)?),
                Vec::new(),
            )),
            Relation::Filter { input, predicate } => {
                let (from, mut conjuncts) = self.relation(input)?;
                conjuncts.extend(self.conjuncts(predicate)?);
                Ok((from, conjuncts))
            }
            Relation::Join {
                left,
                right,
                kind,
                on,
            } => {
                let (left_sql, mut conjuncts) = self.relation(left)?;
                let (mut right_sql, right_conjuncts) = self.relation(right)?;
                if matches!(right.as_ref(), Relation::Join { .. }) {
                    right_sql = format!("({right_sql})");
                }
                let mut on_terms = match on {
                    Predicate::Const(true) => Vec::new(),
                    other => self.conjuncts(other)?,
                };
                match kind {
                    JoinKind::Inner => conjuncts.extend(right_conjuncts),
                    JoinKind::Left => {
                        if !right_conjuncts.is_empty() {
                            trace!(terms = right_conjuncts.len(), "qir.lower.fold_left_filter");
                        }
                        on_terms.extend(right_conjuncts);
                    }
                }
                let on_sql = if on_terms.is_empty() {
                    "TRUE".to_owned()
                } else {
                    on_terms.join(" AND ")
                };
                let keyword = match kind {
                    JoinKind::Inner => "INNER JOIN",
                    JoinKind::Left => "LEFT JOIN",
                };
                Ok((
                    format!("{left_sql} {keyword} {right_sql} ON {on_sql}"),
                    conjuncts,
                ))
            }
        }
    }

    /// Splits a top-level conjunction into separately rendered terms.
    fn conjuncts(&self, pred: &Predicate) -> Result<Vec<String>> {
        match pred {
            Predicate::And(children) if !children.is_empty() => {
                children.iter().map(|child| self.predicate(child)).collect()
            }
            other => Ok(vec![self.predicate(other)?]),
        }
    }

    fn predicate(&self, pred: &Predicate) -> Result<String> {
        match pred {
            Predicate::Compare { left, op, right } => self.compare(left, *op, right.as_ref()),
            Predicate::And(children) => self.junction(children, " AND ", "TRUE"),
            Predicate::Or(children) => self.junction(children, " OR ", "FALSE"),
            Predicate::Not(inner) => Ok(format!("NOT ({})", self.predicate(inner)?)),
            Predicate::Exists(plan) => Ok(format!("EXISTS ({})", self.select(plan, false)?)),
            Predicate::Const(true) => Ok("TRUE".to_owned()),
            Predicate::Const(false) => Ok("FALSE".to_owned()),
        }
    }

    fn junction(&self, children: &[Predicate], sep: &str, empty: &str) -> Result<String> {
        if children.is_empty() {
            return Ok(empty.to_owned());
        }
        let parts = children
            .iter()
            .map(|child| self.predicate(child))
            .collect::<Result<Vec<_>>>()?;
        Ok(format!("({})", parts.join(sep)))
    }

    fn compare(&self, left: &Expr, op: CompareOp, right: Option<&Expr>) -> Result<String> {
        let lhs = self.expr(left)?;
        match (op, right) {
            (CompareOp::IsNull | CompareOp::IsNotNull, _) => {
                Ok(format!("{lhs} {}", sql_operator(op)))
            }
            (CompareOp::In, Some(rhs)) => Ok(format!("{lhs} = ANY({})", self.expr(rhs)?)),
            (_, Some(rhs)) => Ok(format!("{lhs} {} {}", sql_operator(op), self.expr(rhs)?)),
            (_, None) => Err(QirError::validation(
                "predicate",
                format!("{} requires a right operand", op.as_str()),
            )),
        }
    }

    fn exprs(&self, exprs: &[Expr]) -> Result<Vec<String>> {
        exprs.iter().map(|expr| self.expr(expr)).collect()
    }

    fn expr(&self, expr: &Expr) -> Result<String> {
        match expr {
            Expr::Column(ColumnRef { table, column }) => {
                Ok(format!("{}.{}", self.ident(table)?, self.ident(column)?))
            }
            Expr::Param(param) => self.param(param),
            Expr::Literal { value, type_hint } => literal(value, type_hint.as_deref()),
            Expr::FuncCall { name, args } => {
                if !ident::is_safe_bare(name) {
                    return Err(QirError::identifier(name, IdentifierViolation::Pattern));
                }
                Ok(format!("{name}({})", self.exprs(args)?.join(", ")))
            }
            Expr::ScalarSubquery(plan) => Ok(format!("({})", self.select(plan, false)?)),
            Expr::JsonBuildObject(fields) => {
                let parts = fields
                    .iter()
                    .map(|(key, value)| Ok(format!("{}, {}", quote_literal(key), self.expr(value)?)))
                    .collect::<Result<Vec<_>>>()?;
                Ok(format!("jsonb_build_object({})", parts.join(", ")))
            }
            Expr::JsonAgg { value, order_by } => {
                let value = self.expr(value)?;
                let order = if order_by.is_empty() {
                    String::new()
                } else {
                    let terms = order_by
                        .iter()
                        .map(|term| self.order_term(term))
                        .collect::<Result<Vec<_>>>()?;
                    format!(" ORDER BY {}", terms.join(", "))
                };
                Ok(format!("COALESCE(jsonb_agg({value}{order}), '[]'::jsonb)"))
            }
        }
    }

    fn param(&self, param: &Param) -> Result<String> {
        let ordinal = self.params.ordinal(param).ok_or_else(|| {
            QirError::parameter_type(&param.name, "parameter missing from collected set")
        })?;
        match param.type_hint.as_deref() {
            None => Ok(format!("${ordinal}")),
            Some(raw) => Ok(format!("${ordinal}::{}", cast_type(raw, &param.name)?)),
        }
    }

    fn order_term(&self, term: &OrderBy) -> Result<String> {
        let dir = match term.dir {
            SortDir::Asc => "ASC",
            SortDir::Desc => "DESC",
        };
        let nulls = match term.nulls {
            NullsOrder::Unspecified => "",
            NullsOrder::First => " NULLS FIRST",
            NullsOrder::Last => " NULLS LAST",
        };
        Ok(format!("{} {dir}{nulls}", self.expr(&term.expr)?))
    }

    /// DISTINCT ON keys first, then the remaining requested terms, then the
    /// primary-key tie-breaker when one applies.
    fn order_terms(&self, plan: &QueryPlan, top: bool) -> Result<Vec<String>> {
        let mut terms: Vec<OrderBy> = plan
            .distinct_on
            .iter()
            .map(|key| {
                plan.order_by
                    .iter()
                    .find(|term| term.expr == *key)
                    .cloned()
                    .unwrap_or_else(|| OrderBy::asc(key.clone()))
            })
            .collect();
        for term in &plan.order_by {
            if !terms.iter().any(|t| t.expr == term.expr) {
                terms.push(term.clone());
            }
        }

        let ordered = top
            || !terms.is_empty()
            || plan.limit.is_some()
            || plan.offset.is_some();
        if ordered {
            if let Some(key) = self.tie_breaker(plan) {
                if !terms.iter().any(|t| mentions(&t.expr, &key)) {
                    trace!(table = %key.table, column = %key.column, "qir.lower.tie_breaker");
                    terms.push(OrderBy::asc(Expr::Column(key)));
                }
            }
        }
        terms.iter().map(|term| self.order_term(term)).collect()
    }

    fn tie_breaker(&self, plan: &QueryPlan) -> Option<ColumnRef> {
        let (table, alias) = plan.root.leftmost_table()?;
        let column = self.keys.primary_key(table)?;
        Some(ColumnRef {
            table: alias.to_owned(),
            column,
        })
    }
}

fn sql_operator(op: CompareOp) -> &'static str {
    match op {
        CompareOp::Eq => "=",
        CompareOp::Ne => "<>",
        CompareOp::Lt => "<",
        CompareOp::Lte => "<=",
        CompareOp::Gt => ">",
        CompareOp::Gte => ">=",
        CompareOp::Like => "LIKE",
        CompareOp::ILike => "ILIKE",
        CompareOp::Contains => "@>",
        CompareOp::In => "= ANY",
        CompareOp::IsNull => "IS NULL",
        CompareOp::IsNotNull => "IS NOT NULL",
    }
}

fn mentions(expr: &Expr, column: &ColumnRef) -> bool {
    match expr {
        Expr::Column(c) => c == column,
        Expr::FuncCall { args, .. } => args.iter().any(|arg| mentions(arg, column)),
        _ => false,
    }
}

/// Renders a literal. JSON-typed and untyped structured values are
/// serialized and cast to `jsonb` unless a JSON type is given; lists cast to
/// an array type render as `ARRAY[...]`.
fn literal(value: &JsonValue, type_hint: Option<&str>) -> Result<String> {
    let cast = type_hint.map(|raw| cast_type(raw, "literal")).transpose()?;
    let json_cast = match cast.as_deref() {
        None if matches!(value, JsonValue::Array(_) | JsonValue::Object(_)) => Some("jsonb"),
        Some(ty) if is_json(ty) => Some(ty),
        _ => None,
    };
    if let Some(ty) = json_cast {
        return Ok(format!("{}::{ty}", quote_literal(&value.to_string())));
    }
    let body = match value {
        JsonValue::Null => "NULL".to_owned(),
        JsonValue::Bool(true) => "TRUE".to_owned(),
        JsonValue::Bool(false) => "FALSE".to_owned(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::String(s) => quote_literal(s),
        JsonValue::Array(items) if cast.as_deref().is_some_and(is_array) => {
            let elements = items.iter().map(array_element).collect::<Result<Vec<_>>>()?;
            format!("ARRAY[{}]", elements.join(", "))
        }
        JsonValue::Array(_) | JsonValue::Object(_) => {
            return Err(QirError::parameter_type(
                "literal",
                format!(
                    "a structured value cannot be cast to {}",
                    cast.as_deref().unwrap_or("an untyped value")
                ),
            ))
        }
    };
    Ok(match cast {
        Some(ty) => format!("{body}::{ty}"),
        None => body,
    })
}

fn array_element(value: &JsonValue) -> Result<String> {
    match value {
        JsonValue::Array(_) | JsonValue::Object(_) => Err(QirError::parameter_type(
            "literal",
            "array elements must be scalars",
        )),
        scalar => literal(scalar, None),
    }
}

/// Normalizes a cast target; anything outside the allowed type set is a
/// parameter type error whether it came from a param or a literal.
fn cast_type(raw: &str, subject: &str) -> Result<String> {
    normalize_type(raw)
        .ok_or_else(|| QirError::parameter_type(subject, format!("unsupported type '{raw}'")))
}

fn quote_literal(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', "''"))
}
