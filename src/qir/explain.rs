#![forbid(unsafe_code)]

//! Explain trees and deterministic plan hashing.

use std::fmt;
use std::hash::Hasher;

use xxhash_rust::xxh64::Xxh64;

use crate::qir::ir::{
    ColumnRef, Expr, JoinKind, NullsOrder, OrderBy, Param, Predicate, QueryPlan, Relation,
    SortDir,
};

/// Explain node representing an operator with optional metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExplainNode {
    /// Operator name
    pub op: String,
    /// Additional properties describing the operator
    pub props: Vec<ExplainProp>,
    /// Input operators
    pub inputs: Vec<ExplainNode>,
}

impl ExplainNode {
    /// Creates a new explain node with the given operator name.
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            props: Vec::new(),
            inputs: Vec::new(),
        }
    }

    fn write_tree(&self, f: &mut fmt::Formatter<'_>, depth: usize, redact: bool) -> fmt::Result {
        write!(f, "{:indent$}{}", "", self.op, indent = depth * 2)?;
        for prop in &self.props {
            if redact && prop.redactable {
                write!(f, " {}=<redacted>", prop.key)?;
            } else {
                write!(f, " {}={}", prop.key, prop.value)?;
            }
        }
        writeln!(f)?;
        for input in &self.inputs {
            input.write_tree(f, depth + 1, redact)?;
        }
        Ok(())
    }
}

/// `{}` prints the full tree; `{:#}` replaces properties that carry literal
/// values with `<redacted>`.
impl fmt::Display for ExplainNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = f.alternate();
        self.write_tree(f, 0, redact)
    }
}

/// Single property associated with an [`ExplainNode`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExplainProp {
    /// Property key.
    pub key: String,
    /// Property value serialized for display.
    pub value: String,
    /// Whether this property contains literal data that may be redacted.
    pub redactable: bool,
}

impl ExplainProp {
    fn plain(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            redactable: false,
        }
    }

    fn described(key: impl Into<String>, text: Described) -> Self {
        Self {
            key: key.into(),
            value: text.text,
            redactable: text.has_literal,
        }
    }
}

/// Textual form of an expression or predicate, plus the nested plans it
/// references so they can be attached as explain inputs.
#[derive(Default)]
struct Described<'a> {
    text: String,
    has_literal: bool,
    subplans: Vec<&'a QueryPlan>,
}

impl<'a> Described<'a> {
    fn absorb(&mut self, other: Described<'a>) -> String {
        self.has_literal |= other.has_literal;
        self.subplans.extend(other.subplans);
        other.text
    }
}

/// Builds the explain tree for `plan`.
pub fn build_explain_tree(plan: &QueryPlan) -> ExplainNode {
    let mut node = ExplainNode::new("Select");
    let mut nested = Vec::new();

    if !plan.projection.is_empty() {
        let mut desc = Described::default();
        let items: Vec<String> = plan
            .projection
            .iter()
            .map(|item| {
                let expr = desc.absorb(describe_expr(&item.expr));
                format!("{}:{expr}", item.alias)
            })
            .collect();
        nested.extend(desc.subplans.drain(..).map(build_explain_tree));
        desc.text = format!("[{}]", items.join(", "));
        node.props.push(ExplainProp::described("project", desc));
    }
    if !plan.distinct_on.is_empty() {
        let keys: Vec<String> = plan.distinct_on.iter().map(|e| describe_expr(e).text).collect();
        node.props
            .push(ExplainProp::plain("distinct_on", format!("[{}]", keys.join(", "))));
    }
    if !plan.order_by.is_empty() {
        node.props
            .push(ExplainProp::plain("order_by", describe_order(&plan.order_by)));
    }
    if let Some(limit) = plan.limit {
        node.props.push(ExplainProp::plain("limit", limit.to_string()));
    }
    if let Some(offset) = plan.offset {
        node.props.push(ExplainProp::plain("offset", offset.to_string()));
    }
    node.inputs.push(explain_relation(&plan.root));
    node.inputs.extend(nested);
    node
}

fn explain_relation(rel: &Relation) -> ExplainNode {
    match rel {
        Relation::Table { name, alias } => {
            let mut node = ExplainNode::new("Table");
            node.props.push(ExplainProp::plain("name", name.clone()));
            node.props.push(ExplainProp::plain("alias", alias.clone()));
            node
        }
        Relation::Join {
            left,
            right,
            kind,
            on,
        } => {
            let mut node = ExplainNode::new(match kind {
                JoinKind::Inner => "InnerJoin",
                JoinKind::Left => "LeftJoin",
            });
            let desc = describe_predicate(on);
            let subplans = desc.subplans.clone();
            node.props.push(ExplainProp::described("on", desc));
            node.inputs.push(explain_relation(left));
            node.inputs.push(explain_relation(right));
            node.inputs.extend(subplans.into_iter().map(build_explain_tree));
            node
        }
        Relation::Lateral { plan, alias } | Relation::Subquery { plan, alias } => {
            let op = if matches!(rel, Relation::Lateral { .. }) {
                "Lateral"
            } else {
                "Subquery"
            };
            let mut node = ExplainNode::new(op);
            node.props.push(ExplainProp::plain("alias", alias.clone()));
            node.inputs.push(build_explain_tree(plan));
            node
        }
        Relation::Filter { input, predicate } => {
            let mut node = ExplainNode::new("Filter");
            let desc = describe_predicate(predicate);
            let subplans = desc.subplans.clone();
            node.props.push(ExplainProp::described("predicate", desc));
            node.inputs.push(explain_relation(input));
            node.inputs.extend(subplans.into_iter().map(build_explain_tree));
            node
        }
    }
}

fn describe_column(col: &ColumnRef) -> String {
    format!("{}.{}", col.table, col.column)
}

fn describe_param(param: &Param) -> String {
    let mut text = format!("${}", param.name);
    if let Some(ty) = &param.type_hint {
        text.push_str("::");
        text.push_str(ty);
    }
    if let Some(special) = &param.special {
        text.push_str(&format!("@{special}"));
    }
    text
}

fn describe_order(terms: &[OrderBy]) -> String {
    let parts: Vec<String> = terms
        .iter()
        .map(|term| {
            let dir = match term.dir {
                SortDir::Asc => "asc",
                SortDir::Desc => "desc",
            };
            let nulls = match term.nulls {
                NullsOrder::Unspecified => "",
                NullsOrder::First => " nulls first",
                NullsOrder::Last => " nulls last",
            };
            format!("{} {dir}{nulls}", describe_expr(&term.expr).text)
        })
        .collect();
    format!("[{}]", parts.join(", "))
}

fn describe_expr(expr: &Expr) -> Described<'_> {
    let mut out = Described::default();
    let text = match expr {
        Expr::Column(col) => describe_column(col),
        Expr::Param(param) => describe_param(param),
        Expr::Literal { value, type_hint } => {
            out.has_literal = true;
            match type_hint {
                Some(ty) => format!("{value}::{ty}"),
                None => value.to_string(),
            }
        }
        Expr::FuncCall { name, args } => {
            let args: Vec<String> = args.iter().map(|a| out.absorb(describe_expr(a))).collect();
            format!("{name}({})", args.join(", "))
        }
        Expr::ScalarSubquery(plan) => {
            out.subplans.push(plan.as_ref());
            "subquery".to_owned()
        }
        Expr::JsonBuildObject(fields) => {
            let parts: Vec<String> = fields
                .iter()
                .map(|(key, value)| format!("{key}: {}", out.absorb(describe_expr(value))))
                .collect();
            format!("{{{}}}", parts.join(", "))
        }
        Expr::JsonAgg { value, order_by } => {
            let value = out.absorb(describe_expr(value));
            if order_by.is_empty() {
                format!("json_agg({value})")
            } else {
                format!("json_agg({value} order {})", describe_order(order_by))
            }
        }
    };
    out.text = text;
    out
}

fn describe_predicate(pred: &Predicate) -> Described<'_> {
    let mut out = Described::default();
    let text = match pred {
        Predicate::Compare { left, op, right } => {
            let lhs = out.absorb(describe_expr(left));
            match right {
                Some(right) => {
                    let rhs = out.absorb(describe_expr(right));
                    format!("{lhs} {} {rhs}", op.as_str())
                }
                None => format!("{lhs} {}", op.as_str()),
            }
        }
        Predicate::And(children) | Predicate::Or(children) => {
            let sep = if matches!(pred, Predicate::And(_)) {
                " and "
            } else {
                " or "
            };
            let parts: Vec<String> = children
                .iter()
                .map(|child| out.absorb(describe_predicate(child)))
                .collect();
            format!("({})", parts.join(sep))
        }
        Predicate::Not(inner) => format!("not {}", out.absorb(describe_predicate(inner))),
        Predicate::Exists(plan) => {
            out.subplans.push(plan.as_ref());
            "exists(subplan)".to_owned()
        }
        Predicate::Const(value) => value.to_string(),
    };
    out.text = text;
    out
}

/// Deterministic hash over the explain tree and the ordered parameter list.
pub fn compute_plan_hash(explain: &ExplainNode, params: &[Param]) -> u64 {
    let mut hasher = Xxh64::new(0);
    hash_explain_node(explain, &mut hasher);
    hasher.write_u64(params.len() as u64);
    for param in params {
        hasher.write(param.name.as_bytes());
        hash_opt(param.type_hint.as_deref(), &mut hasher);
        hash_opt(param.special.as_deref(), &mut hasher);
    }
    hasher.finish()
}

fn hash_explain_node(node: &ExplainNode, hasher: &mut Xxh64) {
    hasher.write(node.op.as_bytes());
    hasher.write_u64(node.props.len() as u64);
    for prop in &node.props {
        hasher.write(prop.key.as_bytes());
        hasher.write(prop.value.as_bytes());
    }
    hasher.write_u64(node.inputs.len() as u64);
    for child in &node.inputs {
        hash_explain_node(child, hasher);
    }
}

fn hash_opt(value: Option<&str>, hasher: &mut Xxh64) {
    match value {
        Some(value) => {
            hasher.write_u8(1);
            hasher.write(value.as_bytes());
        }
        None => hasher.write_u8(0),
    }
}
