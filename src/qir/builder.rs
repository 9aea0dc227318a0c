#![forbid(unsafe_code)]

//! Operation plan builder.
//!
//! Validates a [`SelectDescriptor`] against the catalog and assembles a
//! [`QueryPlan`]. All descriptor validation happens here, before any SQL
//! exists: table/alias shape, column resolution, operator and parameter
//! typing, join qualification, list correlation, ordering, and paging.
//!
//! Shape of the produced relation tree:
//!
//! ```text
//! Filter(
//!   Join(... Join(Join(Table(base), join_0), join_1) ..., Lateral(list_0)) ...,
//!   filters AND where AND exists(required lists)
//! )
//! ```

use serde_json::Value as JsonValue;
use tracing::{debug, trace};

use crate::qir::catalog::{canonical_column_type, Catalog};
use crate::qir::descriptor::{
    ColumnPair, CountSpec, FilterSpec, JoinSpec, ListSpec, MatchPair, OneOrMany, OrderSpec,
    SelectDescriptor,
};
use crate::qir::errors::{QirError, Result};
use crate::qir::ir::{
    CompareOp, Expr, JoinKind, NullsOrder, OrderBy, Predicate, ProjectionItem, QueryPlan,
    Relation, SortDir,
};
use crate::qir::predicate::{self, Operand, PredicateEnv, ResolvedColumn};

/// Builds a plan for `desc`, resolving names against `catalog`.
pub fn build_plan(desc: &SelectDescriptor, catalog: &dyn Catalog) -> Result<QueryPlan> {
    let built = build_select(desc, catalog, "")?;
    debug!(
        table = %desc.table,
        alias = %desc.alias,
        joins = desc.joins.len(),
        lists = desc.lists.len(),
        counts = desc.counts.len(),
        "qir.build.done"
    );
    Ok(built.plan)
}

/// Output column name and canonical type.
type OutputColumn = (String, Option<String>);

struct Built {
    plan: QueryPlan,
    outputs: Vec<OutputColumn>,
}

enum Source {
    Table(String),
    Derived(Vec<OutputColumn>),
}

struct Binding {
    alias: String,
    source: Source,
}

/// Alias scope. Child scopes (lists, counts) see their parents, which is
/// what makes lateral correlation possible; join subqueries start fresh.
struct Scope<'a> {
    catalog: &'a dyn Catalog,
    bindings: Vec<Binding>,
    parent: Option<&'a Scope<'a>>,
}

impl<'a> Scope<'a> {
    fn new(catalog: &'a dyn Catalog, parent: Option<&'a Scope<'a>>) -> Self {
        Self {
            catalog,
            bindings: Vec::new(),
            parent,
        }
    }

    fn lookup(&self, alias: &str) -> Option<&Binding> {
        self.bindings
            .iter()
            .find(|b| b.alias == alias)
            .or_else(|| self.parent.and_then(|p| p.lookup(alias)))
    }

    fn bind(&mut self, alias: &str, source: Source, field: &str) -> Result<()> {
        if self.lookup(alias).is_some() {
            return Err(QirError::validation(
                field,
                format!("alias '{alias}' is already in use"),
            ));
        }
        self.bindings.push(Binding {
            alias: alias.to_owned(),
            source,
        });
        Ok(())
    }

    /// Canonical type of `column` on `binding`; `None` when the column does
    /// not exist, `Some(None)` when it exists with an unknown type.
    fn column_type(&self, binding: &Binding, column: &str) -> Option<Option<String>> {
        match &binding.source {
            Source::Table(table) => canonical_column_type(self.catalog, table, column).map(Some),
            Source::Derived(outputs) => outputs
                .iter()
                .find(|(name, _)| name == column)
                .map(|(_, ty)| ty.clone()),
        }
    }

    fn base(&self) -> &Binding {
        &self.bindings[0]
    }
}

impl PredicateEnv for Scope<'_> {
    fn resolve_column(&self, path: &str, field: &str) -> Result<ResolvedColumn> {
        if path.trim().is_empty() {
            return Err(QirError::validation(
                field,
                "column must be a non-empty string",
            ));
        }
        let (binding, column) = match path.split_once('.') {
            Some((alias, column)) => {
                let binding = self.lookup(alias).ok_or_else(|| {
                    QirError::validation(field, format!("unknown alias '{alias}' in '{path}'"))
                })?;
                (binding, column)
            }
            None => (self.base(), path),
        };
        let ty = self.column_type(binding, column).ok_or_else(|| {
            QirError::validation(
                field,
                format!("unknown column '{}.{column}'", binding.alias),
            )
        })?;
        Ok(ResolvedColumn {
            table: binding.alias.clone(),
            column: column.to_owned(),
            ty,
        })
    }
}

fn at(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_owned()
    } else {
        format!("{prefix}.{name}")
    }
}

fn require_name(value: &str, field: String) -> Result<()> {
    if value.trim().is_empty() {
        return Err(QirError::validation(field, "must be a non-empty string"));
    }
    Ok(())
}

fn require_table(catalog: &dyn Catalog, table: &str, field: String) -> Result<()> {
    require_name(table, field.clone())?;
    if !catalog.has_table(table) {
        return Err(QirError::validation(field, format!("unknown table '{table}'")));
    }
    Ok(())
}

struct OutputNames(Vec<OutputColumn>);

impl OutputNames {
    fn push(&mut self, name: &str, ty: Option<String>, field: String) -> Result<()> {
        if self.0.iter().any(|(existing, _)| existing == name) {
            return Err(QirError::validation(
                field,
                format!("duplicate output column '{name}'"),
            ));
        }
        self.0.push((name.to_owned(), ty));
        Ok(())
    }
}

fn build_select(desc: &SelectDescriptor, catalog: &dyn Catalog, prefix: &str) -> Result<Built> {
    require_table(catalog, &desc.table, at(prefix, "table"))?;
    require_name(&desc.alias, at(prefix, "alias"))?;
    trace!(table = %desc.table, alias = %desc.alias, "qir.build.select");

    let mut scope = Scope::new(catalog, None);
    scope.bind(&desc.alias, Source::Table(desc.table.clone()), &at(prefix, "alias"))?;
    let mut root = Relation::table(desc.table.clone(), desc.alias.clone());

    for (idx, join) in desc.joins.iter().enumerate() {
        let field = at(prefix, &format!("joins[{idx}]"));
        root = build_join(&mut scope, root, join, &field)?;
    }

    let mut outputs = OutputNames(Vec::new());
    let mut projection = Vec::new();
    for (column, field) in expand_columns(catalog, &desc.table, &desc.columns, &at(prefix, "columns"))? {
        let resolved = scope.resolve_column(&column, &field)?;
        outputs.push(&resolved.column, resolved.ty.clone(), field)?;
        projection.push(ProjectionItem::new(resolved.column.clone(), resolved.to_expr()));
    }

    let mut preds = compile_filter_specs(&scope, &desc.filters, &at(prefix, "filters"))?;
    if let Some(filter) = &desc.where_clause {
        preds.push(predicate::compile_filter(filter, &scope, &at(prefix, "where"))?);
    }

    let mut laterals = Vec::new();
    for (idx, list) in desc.lists.iter().enumerate() {
        let field = at(prefix, &format!("lists[{idx}]"));
        let mut built = build_list(&scope, list, &field)?;
        outputs.push(&list.name, Some("jsonb".to_owned()), at(&field, "name"))?;
        projection.push(ProjectionItem::new(
            list.name.clone(),
            Expr::column(built.lateral_alias.clone(), list.name.clone()),
        ));
        preds.extend(built.exists.take());
        laterals.push(built);
    }
    for built in &laterals {
        scope.bind(
            &built.lateral_alias,
            Source::Derived(vec![(built.name.clone(), Some("jsonb".to_owned()))]),
            &built.field,
        )?;
    }
    for built in laterals {
        root = root.join(
            Relation::lateral(built.plan, built.lateral_alias),
            JoinKind::Left,
            Predicate::Const(true),
        );
    }

    for (idx, count) in desc.counts.iter().enumerate() {
        let field = at(prefix, &format!("counts[{idx}]"));
        let expr = build_count(&scope, count, &field)?;
        outputs.push(&count.name, Some("bigint".to_owned()), at(&field, "name"))?;
        projection.push(ProjectionItem::new(count.name.clone(), expr));
    }

    if let Some(pred) = Predicate::conjoin(preds) {
        root = root.filter(pred);
    }

    let order_by = build_order_by(&scope, &desc.order_by, &at(prefix, "orderBy"))?;
    let distinct_on = desc
        .distinct_on
        .iter()
        .enumerate()
        .map(|(idx, column)| {
            let field = at(prefix, &format!("distinctOn[{idx}]"));
            scope.resolve_column(column, &field).map(|c| c.to_expr())
        })
        .collect::<Result<Vec<_>>>()?;
    let limit = parse_count(desc.limit.as_ref(), 1, &at(prefix, "limit"), "a positive integer")?;
    let offset = parse_count(
        desc.offset.as_ref(),
        0,
        &at(prefix, "offset"),
        "a non-negative integer",
    )?;

    let plan = QueryPlan {
        root,
        projection,
        distinct_on,
        order_by,
        limit,
        offset,
    };
    Ok(Built {
        plan,
        outputs: outputs.0,
    })
}

fn expand_columns(
    catalog: &dyn Catalog,
    table: &str,
    columns: &[String],
    field: &str,
) -> Result<Vec<(String, String)>> {
    if columns.iter().any(|c| c == "*") {
        if columns.len() != 1 {
            return Err(QirError::validation(
                field,
                "'*' must be the only entry when present",
            ));
        }
        return Ok(catalog
            .columns(table)
            .into_iter()
            .enumerate()
            .map(|(idx, c)| (c, format!("{field}[{idx}]")))
            .collect());
    }
    columns
        .iter()
        .enumerate()
        .map(|(idx, c)| {
            let entry = format!("{field}[{idx}]");
            require_name(c, entry.clone())?;
            Ok((c.clone(), entry))
        })
        .collect()
}

fn build_join(scope: &mut Scope<'_>, left: Relation, join: &JoinSpec, field: &str) -> Result<Relation> {
    require_name(&join.alias, at(field, "alias"))?;
    let kind = match join.kind.as_deref() {
        None | Some("inner") => JoinKind::Inner,
        Some("left") => JoinKind::Left,
        Some(other) => {
            return Err(QirError::validation(
                at(field, "type"),
                format!("join type must be 'inner' or 'left' (got '{other}')"),
            ))
        }
    };
    let (right, source) = match (&join.table, &join.select) {
        (Some(table), None) => {
            require_table(scope.catalog, table, at(field, "table"))?;
            (
                Relation::table(table.clone(), join.alias.clone()),
                Source::Table(table.clone()),
            )
        }
        (None, Some(select)) => {
            let built = build_select(select, scope.catalog, &at(field, "select"))?;
            (
                Relation::subquery(built.plan, join.alias.clone()),
                Source::Derived(built.outputs),
            )
        }
        _ => {
            return Err(QirError::validation(
                field,
                "join requires exactly one of 'table' or 'select'",
            ))
        }
    };
    let right_binding = Binding {
        alias: join.alias.clone(),
        source,
    };
    if scope.lookup(&join.alias).is_some() {
        return Err(QirError::validation(
            at(field, "alias"),
            format!("alias '{}' is already in use", join.alias),
        ));
    }

    let pairs = match &join.on {
        Some(on) if !on.as_slice().is_empty() => on,
        _ => {
            return Err(QirError::validation(
                at(field, "on"),
                "join requires an explicit on clause",
            ))
        }
    };
    let mut conditions = Vec::new();
    for (idx, ColumnPair { left: l, right: r }) in pairs.as_slice().iter().enumerate() {
        let on_field = match pairs {
            OneOrMany::One(_) => at(field, "on"),
            OneOrMany::Many(_) => at(field, &format!("on[{idx}]")),
        };
        let lhs = resolve_join_ref(scope, &right_binding, l, &at(&on_field, "left"))?;
        let rhs = resolve_join_ref(scope, &right_binding, r, &at(&on_field, "right"))?;
        conditions.push(Predicate::compare(lhs, CompareOp::Eq, rhs));
    }
    let on = Predicate::conjoin(conditions).unwrap_or(Predicate::Const(true));
    trace!(alias = %join.alias, ?kind, "qir.build.join");

    scope.bindings.push(right_binding);
    Ok(left.join(right, kind, on))
}

/// Resolves one side of a join condition. References must be qualified with
/// an alias from the current scope or the joined relation.
fn resolve_join_ref(scope: &Scope<'_>, right: &Binding, raw: &str, field: &str) -> Result<Expr> {
    require_name(raw, field.to_owned())?;
    match raw.split_once('.') {
        Some((alias, column)) => {
            let binding = if alias == right.alias {
                right
            } else {
                scope
                    .bindings
                    .iter()
                    .find(|b| b.alias == alias)
                    .ok_or_else(|| {
                        QirError::validation(field, format!("unknown alias '{alias}' in '{raw}'"))
                    })?
            };
            if scope.column_type(binding, column).is_none() {
                return Err(QirError::validation(
                    field,
                    format!("unknown column '{raw}'"),
                ));
            }
            Ok(Expr::column(alias, column))
        }
        None => {
            let on_left = scope
                .bindings
                .iter()
                .any(|b| scope.column_type(b, raw).is_some());
            let on_right = scope.column_type(right, raw).is_some();
            if on_left && on_right {
                Err(QirError::validation(
                    field,
                    format!("ambiguous join reference '{raw}'; qualify it with a table alias"),
                ))
            } else {
                Err(QirError::validation(
                    field,
                    format!("join reference '{raw}' must be table-qualified"),
                ))
            }
        }
    }
}

fn compile_filter_specs(scope: &Scope<'_>, filters: &[FilterSpec], field: &str) -> Result<Vec<Predicate>> {
    filters
        .iter()
        .enumerate()
        .map(|(idx, spec)| compile_filter_spec(scope, spec, &format!("{field}[{idx}]")))
        .collect()
}

fn compile_filter_spec(scope: &Scope<'_>, spec: &FilterSpec, field: &str) -> Result<Predicate> {
    require_name(&spec.column, at(field, "column"))?;
    let op = CompareOp::parse(&spec.op).ok_or_else(|| {
        QirError::validation(at(field, "op"), format!("unsupported operator '{}'", spec.op))
    })?;
    let operand = match (&spec.param, &spec.value) {
        (Some(_), Some(_)) => {
            return Err(QirError::validation(
                field,
                "filter accepts either 'param' or 'value', not both",
            ))
        }
        (Some(param), None) => Operand::Param(param.clone()),
        (None, Some(JsonValue::Null)) => Operand::Null,
        (None, Some(value)) => Operand::Literal(value.clone()),
        (None, None) => Operand::Absent,
    };
    predicate::compile_comparison(scope, &spec.column, op, operand, field)
}

fn build_order_by(scope: &Scope<'_>, specs: &[OrderSpec], field: &str) -> Result<Vec<OrderBy>> {
    specs
        .iter()
        .enumerate()
        .map(|(idx, spec)| {
            let entry = format!("{field}[{idx}]");
            let column = scope.resolve_column(&spec.column, &at(&entry, "column"))?;
            let dir = match spec.dir.as_deref() {
                None | Some("asc") => SortDir::Asc,
                Some("desc") => SortDir::Desc,
                Some(other) => {
                    return Err(QirError::validation(
                        at(&entry, "dir"),
                        format!("must be 'asc' or 'desc' (got '{other}')"),
                    ))
                }
            };
            let nulls = match spec.nulls.as_deref() {
                None => NullsOrder::Unspecified,
                Some("first") => NullsOrder::First,
                Some("last") => NullsOrder::Last,
                Some(other) => {
                    return Err(QirError::validation(
                        at(&entry, "nulls"),
                        format!("must be 'first' or 'last' (got '{other}')"),
                    ))
                }
            };
            Ok(OrderBy {
                expr: column.to_expr(),
                dir,
                nulls,
            })
        })
        .collect()
}

fn parse_count(value: Option<&JsonValue>, min: u64, field: &str, expected: &str) -> Result<Option<u64>> {
    match value {
        None | Some(JsonValue::Null) => Ok(None),
        Some(raw) => match raw.as_u64() {
            Some(n) if n >= min => Ok(Some(n)),
            _ => Err(QirError::validation(
                field,
                format!("must be {expected} (got {raw})"),
            )),
        },
    }
}

/// Binds a child table in a scope nested under `parent` and compiles its
/// correlation and filters.
fn child_scope<'a>(
    parent: &'a Scope<'a>,
    table: &str,
    alias: &str,
    on_match: Option<&OneOrMany<MatchPair>>,
    filters: &[FilterSpec],
    where_clause: Option<&JsonValue>,
    field: &str,
) -> Result<(Scope<'a>, Vec<Predicate>)> {
    require_table(parent.catalog, table, at(field, "table"))?;
    require_name(alias, at(field, "alias"))?;
    let mut scope = Scope::new(parent.catalog, Some(parent));
    scope.bind(alias, Source::Table(table.to_owned()), &at(field, "alias"))?;

    let mut preds = Vec::new();
    if let Some(pairs) = on_match {
        for (idx, MatchPair { local, foreign }) in pairs.as_slice().iter().enumerate() {
            let pair_field = match pairs {
                OneOrMany::One(_) => at(field, "match"),
                OneOrMany::Many(_) => at(field, &format!("match[{idx}]")),
            };
            let child = scope.resolve_column(foreign, &at(&pair_field, "foreign"))?;
            let outer = parent.resolve_column(local, &at(&pair_field, "local"))?;
            preds.push(Predicate::compare(
                child.to_expr(),
                CompareOp::Eq,
                outer.to_expr(),
            ));
        }
    }
    if preds.is_empty() && filters.is_empty() && where_clause.is_none() {
        return Err(QirError::validation(
            field,
            "requires 'match' or filters to correlate with the parent",
        ));
    }
    preds.extend(compile_filter_specs(&scope, filters, &at(field, "filters"))?);
    if let Some(filter) = where_clause {
        preds.push(predicate::compile_filter(filter, &scope, &at(field, "where"))?);
    }
    Ok((scope, preds))
}

struct BuiltList {
    name: String,
    field: String,
    lateral_alias: String,
    plan: QueryPlan,
    exists: Option<Predicate>,
}

fn build_list(parent: &Scope<'_>, list: &ListSpec, field: &str) -> Result<BuiltList> {
    require_name(&list.name, at(field, "name"))?;
    let (mut scope, preds) = child_scope(
        parent,
        &list.table,
        &list.alias,
        list.on_match.as_ref(),
        &list.filters,
        list.where_clause.as_ref(),
        field,
    )?;
    let lateral_alias = format!("{}_list", list.alias);
    if scope.lookup(&lateral_alias).is_some() {
        return Err(QirError::validation(
            at(field, "alias"),
            format!("alias '{lateral_alias}' is already in use"),
        ));
    }

    let columns_field = at(field, "columns");
    let columns = expand_columns(scope.catalog, &list.table, &list.columns, &columns_field)?;
    if columns.is_empty() {
        return Err(QirError::validation(
            columns_field,
            "list must select at least one column",
        ));
    }
    let mut keys = OutputNames(Vec::new());
    let mut fields = Vec::new();
    for (column, entry) in columns {
        let resolved = scope.resolve_column(&column, &entry)?;
        keys.push(&resolved.column, None, entry)?;
        fields.push((resolved.column.clone(), resolved.to_expr()));
    }

    let exists = if list.required {
        let mut probe = Relation::table(list.table.clone(), list.alias.clone());
        if let Some(pred) = Predicate::conjoin(preds.clone()) {
            probe = probe.filter(pred);
        }
        Some(Predicate::Exists(Box::new(QueryPlan::new(probe))))
    } else {
        None
    };

    let order_by = build_order_by(&scope, &list.order_by, &at(field, "orderBy"))?;

    let mut root = Relation::table(list.table.clone(), list.alias.clone());
    let mut preds = preds;
    let mut nested = Vec::new();
    for (idx, child) in list.lists.iter().enumerate() {
        let child_field = at(field, &format!("lists[{idx}]"));
        let built = build_list(&scope, child, &child_field)?;
        keys.push(&child.name, None, at(&child_field, "name"))?;
        fields.push((
            child.name.clone(),
            Expr::column(built.lateral_alias.clone(), child.name.clone()),
        ));
        nested.push(built);
    }
    for built in nested {
        scope.bind(
            &built.lateral_alias,
            Source::Derived(vec![(built.name.clone(), Some("jsonb".to_owned()))]),
            &built.field,
        )?;
        preds.extend(built.exists);
        root = root.join(
            Relation::lateral(built.plan, built.lateral_alias),
            JoinKind::Left,
            Predicate::Const(true),
        );
    }
    if let Some(pred) = Predicate::conjoin(preds) {
        root = root.filter(pred);
    }

    let agg = Expr::JsonAgg {
        value: Box::new(Expr::JsonBuildObject(fields)),
        order_by,
    };
    let plan = QueryPlan::new(root).with_projection(vec![ProjectionItem::new(list.name.clone(), agg)]);
    trace!(name = %list.name, alias = %lateral_alias, required = list.required, "qir.build.list");
    Ok(BuiltList {
        name: list.name.clone(),
        field: field.to_owned(),
        lateral_alias,
        plan,
        exists,
    })
}

fn build_count(parent: &Scope<'_>, count: &CountSpec, field: &str) -> Result<Expr> {
    require_name(&count.name, at(field, "name"))?;
    let (_, preds) = child_scope(
        parent,
        &count.table,
        &count.alias,
        count.on_match.as_ref(),
        &count.filters,
        count.where_clause.as_ref(),
        field,
    )?;
    let mut root = Relation::table(count.table.clone(), count.alias.clone());
    if let Some(pred) = Predicate::conjoin(preds) {
        root = root.filter(pred);
    }
    let plan = QueryPlan::new(root).with_projection(vec![ProjectionItem::new(
        "count",
        Expr::call("count", vec![Expr::literal(1)]),
    )]);
    Ok(Expr::ScalarSubquery(Box::new(plan)))
}
