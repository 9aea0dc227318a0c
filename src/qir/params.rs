#![forbid(unsafe_code)]

//! Deterministic parameter collection.
//!
//! Traversal order is fixed: projection, ORDER BY, DISTINCT ON, then the root
//! relation (join left, join right, join condition; nested plans recurse in
//! the same order; filters visit their input before their predicate). Each
//! distinct [`Param`] receives the next 1-based ordinal on first sight.

use rustc_hash::FxHashMap;

use crate::qir::ir::{Expr, OrderBy, Param, Predicate, ProjectionItem, QueryPlan, Relation};

/// Ordered parameter list plus ordinal lookup.
#[derive(Clone, Debug, Default)]
pub struct ParamSet {
    params: Vec<Param>,
    ordinals: FxHashMap<Param, usize>,
}

impl ParamSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the set extended with `param`; repeats are no-ops.
    pub fn with(mut self, param: &Param) -> Self {
        if !self.ordinals.contains_key(param) {
            self.params.push(param.clone());
            self.ordinals.insert(param.clone(), self.params.len());
        }
        self
    }

    /// 1-based ordinal of `param`.
    pub fn ordinal(&self, param: &Param) -> Option<usize> {
        self.ordinals.get(param).copied()
    }

    /// Parameters in ordinal order.
    pub fn params(&self) -> &[Param] {
        &self.params
    }

    /// Consumes the set, returning parameters in ordinal order.
    pub fn into_params(self) -> Vec<Param> {
        self.params
    }

    /// Number of distinct parameters.
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Whether no parameters were seen.
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

/// Collects every parameter referenced by `plan`.
pub fn collect(plan: &QueryPlan) -> ParamSet {
    fold_plan(ParamSet::new(), plan)
}

fn fold_plan(acc: ParamSet, plan: &QueryPlan) -> ParamSet {
    let acc = plan
        .projection
        .iter()
        .fold(acc, |acc, ProjectionItem { expr, .. }| fold_expr(acc, expr));
    let acc = fold_order_by(acc, &plan.order_by);
    let acc = plan.distinct_on.iter().fold(acc, fold_expr);
    fold_relation(acc, &plan.root)
}

fn fold_order_by(acc: ParamSet, terms: &[OrderBy]) -> ParamSet {
    terms.iter().fold(acc, |acc, term| fold_expr(acc, &term.expr))
}

fn fold_relation(acc: ParamSet, rel: &Relation) -> ParamSet {
    match rel {
        Relation::Table { .. } => acc,
        Relation::Join {
            left, right, on, ..
        } => {
            let acc = fold_relation(acc, left);
            let acc = fold_relation(acc, right);
            fold_predicate(acc, on)
        }
        Relation::Lateral { plan, .. } | Relation::Subquery { plan, .. } => fold_plan(acc, plan),
        Relation::Filter { input, predicate } => {
            let acc = fold_relation(acc, input);
            fold_predicate(acc, predicate)
        }
    }
}

fn fold_expr(acc: ParamSet, expr: &Expr) -> ParamSet {
    match expr {
        Expr::Column(_) | Expr::Literal { .. } => acc,
        Expr::Param(param) => acc.with(param),
        Expr::FuncCall { args, .. } => args.iter().fold(acc, fold_expr),
        Expr::ScalarSubquery(plan) => fold_plan(acc, plan),
        Expr::JsonBuildObject(fields) => fields.iter().fold(acc, |acc, (_, value)| fold_expr(acc, value)),
        Expr::JsonAgg { value, order_by } => {
            let acc = fold_expr(acc, value);
            fold_order_by(acc, order_by)
        }
    }
}

fn fold_predicate(acc: ParamSet, pred: &Predicate) -> ParamSet {
    match pred {
        Predicate::Compare { left, right, .. } => {
            let acc = fold_expr(acc, left);
            match right {
                Some(right) => fold_expr(acc, right),
                None => acc,
            }
        }
        Predicate::And(children) | Predicate::Or(children) => {
            children.iter().fold(acc, fold_predicate)
        }
        Predicate::Not(inner) => fold_predicate(acc, inner),
        Predicate::Exists(plan) => fold_plan(acc, plan),
        Predicate::Const(_) => acc,
    }
}
