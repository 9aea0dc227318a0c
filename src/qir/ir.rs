#![forbid(unsafe_code)]

//! Relational-algebra intermediate representation.
//!
//! These are plain data types with no validation attached: the plan builder
//! is responsible for producing well-formed trees, and the lowering engine
//! consumes them. Each node category is a closed enum so every pass handles
//! every variant.

use serde::Serialize;
use serde_json::Value as JsonValue;

/// A complete SELECT: relation tree plus output shaping.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryPlan {
    /// Root relation (the FROM clause, with hoistable filters).
    pub root: Relation,
    /// Output columns; empty renders `SELECT *`.
    pub projection: Vec<ProjectionItem>,
    /// `DISTINCT ON` key expressions.
    pub distinct_on: Vec<Expr>,
    /// Requested ordering (tie-breaker not yet applied).
    pub order_by: Vec<OrderBy>,
    /// Optional row limit.
    pub limit: Option<u64>,
    /// Optional row offset.
    pub offset: Option<u64>,
}

impl QueryPlan {
    /// Creates a plan selecting `*` from `root`.
    pub fn new(root: Relation) -> Self {
        Self {
            root,
            projection: Vec::new(),
            distinct_on: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    /// Replaces the projection.
    pub fn with_projection(mut self, projection: Vec<ProjectionItem>) -> Self {
        self.projection = projection;
        self
    }

    /// Replaces the ORDER BY terms.
    pub fn with_order_by(mut self, order_by: Vec<OrderBy>) -> Self {
        self.order_by = order_by;
        self
    }

    /// Replaces the DISTINCT ON keys.
    pub fn with_distinct_on(mut self, keys: Vec<Expr>) -> Self {
        self.distinct_on = keys;
        self
    }

    /// Sets LIMIT/OFFSET.
    pub fn with_paging(mut self, limit: Option<u64>, offset: Option<u64>) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }
}

/// Single `(alias, expression)` output column.
#[derive(Clone, Debug, PartialEq)]
pub struct ProjectionItem {
    /// Output column name.
    pub alias: String,
    /// Expression producing the value.
    pub expr: Expr,
}

impl ProjectionItem {
    /// Creates a projection item.
    pub fn new(alias: impl Into<String>, expr: Expr) -> Self {
        Self {
            alias: alias.into(),
            expr,
        }
    }
}

/// Join flavours the compiler emits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinKind {
    /// `INNER JOIN`.
    Inner,
    /// `LEFT JOIN`.
    Left,
}

/// Relation tree nodes.
#[derive(Clone, Debug, PartialEq)]
pub enum Relation {
    /// Base table reference.
    Table {
        /// Table name, optionally schema-qualified.
        name: String,
        /// Alias used by every column reference.
        alias: String,
    },
    /// Binary join; `on` is always explicit.
    Join {
        /// Left input.
        left: Box<Relation>,
        /// Right input.
        right: Box<Relation>,
        /// Join flavour.
        kind: JoinKind,
        /// Join condition.
        on: Predicate,
    },
    /// Correlated subquery; may reference outer aliases.
    Lateral {
        /// Nested plan.
        plan: Box<QueryPlan>,
        /// Alias for the nested result.
        alias: String,
    },
    /// Uncorrelated subquery.
    Subquery {
        /// Nested plan.
        plan: Box<QueryPlan>,
        /// Alias for the nested result.
        alias: String,
    },
    /// Predicate over `input`, hoisted into WHERE when lowered.
    Filter {
        /// Filtered relation.
        input: Box<Relation>,
        /// Filter predicate.
        predicate: Predicate,
    },
}

impl Relation {
    /// Creates a table relation.
    pub fn table(name: impl Into<String>, alias: impl Into<String>) -> Self {
        Relation::Table {
            name: name.into(),
            alias: alias.into(),
        }
    }

    /// Joins `self` with `right`.
    pub fn join(self, right: Relation, kind: JoinKind, on: Predicate) -> Self {
        Relation::Join {
            left: Box::new(self),
            right: Box::new(right),
            kind,
            on,
        }
    }

    /// Wraps `self` in a filter.
    pub fn filter(self, predicate: Predicate) -> Self {
        Relation::Filter {
            input: Box::new(self),
            predicate,
        }
    }

    /// Creates a lateral relation.
    pub fn lateral(plan: QueryPlan, alias: impl Into<String>) -> Self {
        Relation::Lateral {
            plan: Box::new(plan),
            alias: alias.into(),
        }
    }

    /// Creates an uncorrelated subquery relation.
    pub fn subquery(plan: QueryPlan, alias: impl Into<String>) -> Self {
        Relation::Subquery {
            plan: Box::new(plan),
            alias: alias.into(),
        }
    }

    /// Returns `(name, alias)` of the leftmost base table, following join
    /// left sides and filter inputs.
    pub fn leftmost_table(&self) -> Option<(&str, &str)> {
        match self {
            Relation::Table { name, alias } => Some((name, alias)),
            Relation::Join { left, .. } => left.leftmost_table(),
            Relation::Filter { input, .. } => input.leftmost_table(),
            Relation::Lateral { .. } | Relation::Subquery { .. } => None,
        }
    }
}

/// Column reference qualified by relation alias.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ColumnRef {
    /// Relation alias.
    pub table: String,
    /// Column name.
    pub column: String,
}

/// Bound parameter. Identity is the full `(special, name, type_hint)` triple.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Param {
    /// Caller-facing parameter name.
    pub name: String,
    /// Canonical type used for the cast, if any.
    pub type_hint: Option<String>,
    /// Marker for parameters supplied by the runtime rather than the caller.
    pub special: Option<String>,
}

impl Param {
    /// Creates an untyped parameter.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_hint: None,
            special: None,
        }
    }

    /// Attaches a type hint.
    pub fn typed(mut self, ty: impl Into<String>) -> Self {
        self.type_hint = Some(ty.into());
        self
    }

    /// Attaches a special marker.
    pub fn special(mut self, marker: impl Into<String>) -> Self {
        self.special = Some(marker.into());
        self
    }
}

/// Scalar expressions.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    /// `alias.column`.
    Column(ColumnRef),
    /// Positional placeholder resolved by the parameter collector.
    Param(Param),
    /// Inline literal with an optional cast.
    Literal {
        /// JSON value of the literal.
        value: JsonValue,
        /// Optional target type.
        type_hint: Option<String>,
    },
    /// Function application.
    FuncCall {
        /// Function name (must be a safe bare identifier).
        name: String,
        /// Arguments in call order.
        args: Vec<Expr>,
    },
    /// Single-value subquery.
    ScalarSubquery(Box<QueryPlan>),
    /// `jsonb_build_object(key, value, ...)`.
    JsonBuildObject(Vec<(String, Expr)>),
    /// `jsonb_agg` with an empty-array fallback.
    JsonAgg {
        /// Aggregated value.
        value: Box<Expr>,
        /// Aggregation order.
        order_by: Vec<OrderBy>,
    },
}

impl Expr {
    /// Creates a column reference.
    pub fn column(table: impl Into<String>, column: impl Into<String>) -> Self {
        Expr::Column(ColumnRef {
            table: table.into(),
            column: column.into(),
        })
    }

    /// Creates an untyped literal.
    pub fn literal(value: impl Into<JsonValue>) -> Self {
        Expr::Literal {
            value: value.into(),
            type_hint: None,
        }
    }

    /// Creates a function call.
    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::FuncCall {
            name: name.into(),
            args,
        }
    }
}

/// Comparison operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompareOp {
    /// `=`
    Eq,
    /// `<>`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Lte,
    /// `>`
    Gt,
    /// `>=`
    Gte,
    /// `LIKE`
    Like,
    /// `ILIKE`
    ILike,
    /// `@>`
    Contains,
    /// `= ANY(array)`
    In,
    /// `IS NULL`
    IsNull,
    /// `IS NOT NULL`
    IsNotNull,
}

impl CompareOp {
    /// Parses the descriptor spelling of an operator.
    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "eq" => CompareOp::Eq,
            "ne" => CompareOp::Ne,
            "lt" => CompareOp::Lt,
            "lte" => CompareOp::Lte,
            "gt" => CompareOp::Gt,
            "gte" => CompareOp::Gte,
            "like" => CompareOp::Like,
            "ilike" => CompareOp::ILike,
            "contains" => CompareOp::Contains,
            "in" => CompareOp::In,
            "isNull" => CompareOp::IsNull,
            "isNotNull" => CompareOp::IsNotNull,
            _ => return None,
        })
    }

    /// Descriptor spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            CompareOp::Eq => "eq",
            CompareOp::Ne => "ne",
            CompareOp::Lt => "lt",
            CompareOp::Lte => "lte",
            CompareOp::Gt => "gt",
            CompareOp::Gte => "gte",
            CompareOp::Like => "like",
            CompareOp::ILike => "ilike",
            CompareOp::Contains => "contains",
            CompareOp::In => "in",
            CompareOp::IsNull => "isNull",
            CompareOp::IsNotNull => "isNotNull",
        }
    }

    /// Whether the operator takes no right operand.
    pub fn is_unary(self) -> bool {
        matches!(self, CompareOp::IsNull | CompareOp::IsNotNull)
    }

    /// Whether a parameter on the right must carry an explicit type.
    pub fn requires_explicit_type(self) -> bool {
        matches!(self, CompareOp::In | CompareOp::ILike | CompareOp::Contains)
    }
}

/// Boolean predicates.
#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    /// Binary or unary comparison.
    Compare {
        /// Left operand.
        left: Expr,
        /// Operator.
        op: CompareOp,
        /// Right operand; `None` only for unary operators.
        right: Option<Expr>,
    },
    /// Conjunction.
    And(Vec<Predicate>),
    /// Disjunction.
    Or(Vec<Predicate>),
    /// Negation.
    Not(Box<Predicate>),
    /// Correlated existence test.
    Exists(Box<QueryPlan>),
    /// Constant `TRUE`/`FALSE`.
    Const(bool),
}

impl Predicate {
    /// Creates a binary comparison.
    pub fn compare(left: Expr, op: CompareOp, right: Expr) -> Self {
        Predicate::Compare {
            left,
            op,
            right: Some(right),
        }
    }

    /// Creates `expr IS NULL`.
    pub fn is_null(expr: Expr) -> Self {
        Predicate::Compare {
            left: expr,
            op: CompareOp::IsNull,
            right: None,
        }
    }

    /// Creates `expr IS NOT NULL`.
    pub fn is_not_null(expr: Expr) -> Self {
        Predicate::Compare {
            left: expr,
            op: CompareOp::IsNotNull,
            right: None,
        }
    }

    /// Negates `self`.
    pub fn negate(self) -> Self {
        Predicate::Not(Box::new(self))
    }

    /// Conjoins predicates, flattening nested conjunctions. Returns `None`
    /// for an empty input and the sole element for a single input.
    pub fn conjoin(preds: impl IntoIterator<Item = Predicate>) -> Option<Predicate> {
        let mut flat = Vec::new();
        for pred in preds {
            match pred {
                Predicate::And(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(Predicate::And(flat)),
        }
    }
}

/// Sort direction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortDir {
    /// Ascending.
    #[default]
    Asc,
    /// Descending.
    Desc,
}

/// NULL placement for a sort key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NullsOrder {
    /// Database default.
    #[default]
    Unspecified,
    /// `NULLS FIRST`.
    First,
    /// `NULLS LAST`.
    Last,
}

/// Single ORDER BY term.
#[derive(Clone, Debug, PartialEq)]
pub struct OrderBy {
    /// Sort key.
    pub expr: Expr,
    /// Direction.
    pub dir: SortDir,
    /// NULL placement.
    pub nulls: NullsOrder,
}

impl OrderBy {
    /// Ascending term with default NULL placement.
    pub fn asc(expr: Expr) -> Self {
        Self {
            expr,
            dir: SortDir::Asc,
            nulls: NullsOrder::Unspecified,
        }
    }

    /// Descending term with default NULL placement.
    pub fn desc(expr: Expr) -> Self {
        Self {
            expr,
            dir: SortDir::Desc,
            nulls: NullsOrder::Unspecified,
        }
    }
}
