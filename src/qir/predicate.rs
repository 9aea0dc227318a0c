#![forbid(unsafe_code)]

//! Filter DSL → [`Predicate`] compiler.
//!
//! Grammar: `{"AND": [f, ...]}`, `{"OR": [f, ...]}`, `{"NOT": f}`, or exactly
//! one `{"field": {"op": operand}}` pair. An operand is `null`, a JSON
//! literal, or `{"param": {"name", "type"?, "special"?}}`. Columns and
//! parameters are bound through a [`PredicateEnv`] supplied by the caller.

use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::qir::descriptor::ParamSpec;
use crate::qir::errors::{QirError, Result};
use crate::qir::ir::{CompareOp, Expr, Param, Predicate};
use crate::qir::types;

/// Column resolved against the environment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedColumn {
    /// Relation alias owning the column.
    pub table: String,
    /// Column name.
    pub column: String,
    /// Canonical column type, when known.
    pub ty: Option<String>,
}

impl ResolvedColumn {
    /// Column reference expression.
    pub fn to_expr(&self) -> Expr {
        Expr::column(self.table.clone(), self.column.clone())
    }
}

/// Scope the predicate compiler binds names against.
pub trait PredicateEnv {
    /// Resolves `path` (`column` or `alias.column`). `field` names the
    /// descriptor location for error messages.
    fn resolve_column(&self, path: &str, field: &str) -> Result<ResolvedColumn>;

    /// Creates a parameter reference.
    fn param(&self, name: &str, type_hint: Option<&str>, special: Option<&str>) -> Expr {
        Expr::Param(Param {
            name: name.to_owned(),
            type_hint: type_hint.map(str::to_owned),
            special: special.map(str::to_owned),
        })
    }
}

/// Right-hand side of a comparison before binding.
#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    /// No operand supplied.
    Absent,
    /// Explicit `null`.
    Null,
    /// Inline literal.
    Literal(JsonValue),
    /// Parameter declaration.
    Param(ParamSpec),
}

impl Operand {
    /// Reads a DSL operand. Objects of the exact form `{"param": {...}}`
    /// declare parameters; everything else is a literal.
    pub fn from_json(value: &JsonValue, field: &str) -> Result<Self> {
        match value {
            JsonValue::Null => Ok(Operand::Null),
            JsonValue::Object(map) if map.len() == 1 && map.contains_key("param") => {
                let spec = ParamSpec::deserialize(&map["param"]).map_err(|err| {
                    QirError::validation(format!("{field}.param"), err.to_string())
                })?;
                Ok(Operand::Param(spec))
            }
            other => Ok(Operand::Literal(other.clone())),
        }
    }
}

/// Compiles one DSL filter tree. `field` is the descriptor path of `filter`.
pub fn compile_filter(filter: &JsonValue, env: &dyn PredicateEnv, field: &str) -> Result<Predicate> {
    let obj = filter
        .as_object()
        .ok_or_else(|| QirError::validation(field, "filter must be an object"))?;
    let mut entries = obj.iter();
    let (key, value) = match (entries.next(), entries.next()) {
        (Some(entry), None) => entry,
        _ => {
            return Err(QirError::validation(
                field,
                "filter must contain exactly one key",
            ))
        }
    };
    match key.as_str() {
        "AND" | "OR" => {
            let path = format!("{field}.{key}");
            let items = value
                .as_array()
                .ok_or_else(|| QirError::validation(&path, "expected an array of filters"))?;
            if items.is_empty() {
                return Err(QirError::validation(&path, "requires at least one filter"));
            }
            let mut children = items
                .iter()
                .enumerate()
                .map(|(idx, item)| compile_filter(item, env, &format!("{path}[{idx}]")))
                .collect::<Result<Vec<_>>>()?;
            if children.len() == 1 {
                return Ok(children.remove(0));
            }
            Ok(if key == "AND" {
                Predicate::And(children)
            } else {
                Predicate::Or(children)
            })
        }
        "NOT" => {
            let inner = compile_filter(value, env, &format!("{field}.NOT"))?;
            Ok(inner.negate())
        }
        column => {
            let path = format!("{field}.{column}");
            let ops = value
                .as_object()
                .ok_or_else(|| QirError::validation(&path, "expected {op: operand}"))?;
            let mut ops_iter = ops.iter();
            let (op_name, raw) = match (ops_iter.next(), ops_iter.next()) {
                (Some(entry), None) => entry,
                _ => {
                    return Err(QirError::validation(
                        &path,
                        "expected exactly one operator",
                    ))
                }
            };
            let op_path = format!("{path}.{op_name}");
            let op = CompareOp::parse(op_name).ok_or_else(|| {
                QirError::validation(&op_path, format!("unsupported operator '{op_name}'"))
            })?;
            let operand = Operand::from_json(raw, &op_path)?;
            compile_comparison(env, column, op, operand, &op_path)
        }
    }
}

/// Compiles several top-level filters and ANDs them. Returns `None` when
/// `filters` is empty.
pub fn compile_filters(
    filters: &[JsonValue],
    env: &dyn PredicateEnv,
    field: &str,
) -> Result<Option<Predicate>> {
    let compiled = filters
        .iter()
        .enumerate()
        .map(|(idx, filter)| compile_filter(filter, env, &format!("{field}[{idx}]")))
        .collect::<Result<Vec<_>>>()?;
    Ok(Predicate::conjoin(compiled))
}

/// Binds `column op operand` into a predicate.
///
/// This is shared by the DSL and by descriptor `filters[]` entries so both
/// paths apply the same null, typing, and fallback rules.
pub fn compile_comparison(
    env: &dyn PredicateEnv,
    column: &str,
    op: CompareOp,
    operand: Operand,
    field: &str,
) -> Result<Predicate> {
    let col = env.resolve_column(column, field)?;
    let left = col.to_expr();

    if op.is_unary() {
        let negate = match operand {
            Operand::Absent | Operand::Null | Operand::Literal(JsonValue::Bool(true)) => false,
            Operand::Literal(JsonValue::Bool(false)) => true,
            _ => {
                return Err(QirError::validation(
                    field,
                    format!("{} takes no operand", op.as_str()),
                ))
            }
        };
        let null_check = (op == CompareOp::IsNull) != negate;
        return Ok(if null_check {
            Predicate::is_null(left)
        } else {
            Predicate::is_not_null(left)
        });
    }

    match (op, &operand) {
        (CompareOp::Eq, Operand::Null) => return Ok(Predicate::is_null(left)),
        (CompareOp::Ne, Operand::Null) => return Ok(Predicate::is_null(left).negate()),
        (_, Operand::Null) => {
            return Err(QirError::validation(
                field,
                format!("{} does not accept null", op.as_str()),
            ))
        }
        (_, Operand::Absent) => return Err(missing_operand(op, field)),
        _ => {}
    }

    match op {
        CompareOp::In => compile_in(env, left, operand, field),
        CompareOp::Contains => compile_contains(env, &col, left, operand, field),
        CompareOp::Like | CompareOp::ILike => {
            let right = match operand {
                Operand::Param(spec) => bind_param(env, &spec, op, col.ty.as_deref(), field)?,
                Operand::Literal(JsonValue::String(s)) => Expr::literal(s),
                _ => {
                    return Err(QirError::validation(
                        field,
                        format!("{} requires a string pattern", op.as_str()),
                    ))
                }
            };
            Ok(Predicate::compare(left, op, right))
        }
        _ => {
            let right = match operand {
                Operand::Param(spec) => bind_param(env, &spec, op, col.ty.as_deref(), field)?,
                Operand::Literal(value) => literal_for_column(value, col.ty.as_deref(), field)?,
                Operand::Absent | Operand::Null => return Err(missing_operand(op, field)),
            };
            Ok(Predicate::compare(left, op, right))
        }
    }
}

fn compile_in(env: &dyn PredicateEnv, left: Expr, operand: Operand, field: &str) -> Result<Predicate> {
    match operand {
        Operand::Literal(JsonValue::Array(items)) if items.is_empty() => Ok(Predicate::Const(false)),
        Operand::Literal(JsonValue::Array(_)) => Err(QirError::parameter_type(
            field,
            "in requires an explicit array-typed parameter",
        )),
        Operand::Param(spec) => {
            let param = bind_param(env, &spec, CompareOp::In, None, field)?;
            Ok(Predicate::compare(left, CompareOp::In, param))
        }
        _ => Err(QirError::validation(
            field,
            "in requires an array-typed parameter or an empty list",
        )),
    }
}

fn compile_contains(
    env: &dyn PredicateEnv,
    col: &ResolvedColumn,
    left: Expr,
    operand: Operand,
    field: &str,
) -> Result<Predicate> {
    match col.ty.as_deref() {
        Some(ty) if types::is_array(ty) => {
            let right = match operand {
                Operand::Param(spec) => {
                    let param = bind_param(env, &spec, CompareOp::Contains, Some(ty), field)?;
                    if !param_type(&param).is_some_and(types::is_array) {
                        return Err(QirError::parameter_type(
                            &spec.name,
                            "contains on an array column requires an array-typed parameter",
                        ));
                    }
                    param
                }
                Operand::Literal(value @ JsonValue::Array(_)) => Expr::Literal {
                    value,
                    type_hint: Some(ty.to_owned()),
                },
                _ => {
                    return Err(QirError::parameter_type(
                        field,
                        "contains on an array column requires a list or an array-typed parameter",
                    ))
                }
            };
            Ok(Predicate::compare(left, CompareOp::Contains, right))
        }
        Some(ty) if types::is_json(ty) => {
            // `@>` is defined on jsonb only.
            let left = if ty == "jsonb" {
                left
            } else {
                Expr::call("to_jsonb", vec![left])
            };
            let right = match operand {
                Operand::Param(spec) => {
                    let param = bind_param(env, &spec, CompareOp::Contains, Some(ty), field)?;
                    match param_type(&param) {
                        Some("jsonb") => param,
                        Some("json") => Expr::call("to_jsonb", vec![param]),
                        _ => {
                            return Err(QirError::parameter_type(
                                &spec.name,
                                "contains on a json column requires a json or jsonb parameter",
                            ))
                        }
                    }
                }
                Operand::Literal(value) => Expr::Literal {
                    value,
                    type_hint: Some("jsonb".to_owned()),
                },
                Operand::Absent | Operand::Null => {
                    return Err(missing_operand(CompareOp::Contains, field))
                }
            };
            Ok(Predicate::compare(left, CompareOp::Contains, right))
        }
        Some("text") => {
            let pattern = match operand {
                Operand::Param(spec) => {
                    let param = bind_param(env, &spec, CompareOp::Contains, Some("text"), field)?;
                    Expr::call(
                        "concat",
                        vec![Expr::literal("%"), escape_like_expr(param), Expr::literal("%")],
                    )
                }
                Operand::Literal(JsonValue::String(s)) => {
                    Expr::literal(format!("%{}%", escape_like(&s)))
                }
                _ => {
                    return Err(QirError::validation(
                        field,
                        "contains on a text column requires a string value",
                    ))
                }
            };
            Ok(Predicate::compare(left, CompareOp::ILike, pattern))
        }
        other => Err(QirError::parameter_type(
            field,
            format!(
                "contains is not supported on {} column '{}'",
                other.unwrap_or("an untyped"),
                col.column
            ),
        )),
    }
}

fn param_type(expr: &Expr) -> Option<&str> {
    match expr {
        Expr::Param(param) => param.type_hint.as_deref(),
        _ => None,
    }
}

/// Escapes LIKE metacharacters in a bound value, matching [`escape_like`].
fn escape_like_expr(value: Expr) -> Expr {
    ["\\", "%", "_"].into_iter().fold(value, |acc, meta| {
        Expr::call(
            "replace",
            vec![acc, Expr::literal(meta), Expr::literal(format!("\\{meta}"))],
        )
    })
}

/// Validates a parameter declaration and binds it through `env`.
///
/// Explicit types are normalized and must be in the allowed set. Operators
/// that PostgreSQL cannot infer a type for (`in`, `ilike`, `contains`)
/// require an explicit type; `in` further requires an array type. Other
/// operators fall back to the column's canonical type.
pub fn bind_param(
    env: &dyn PredicateEnv,
    spec: &ParamSpec,
    op: CompareOp,
    column_type: Option<&str>,
    field: &str,
) -> Result<Expr> {
    if spec.name.trim().is_empty() {
        return Err(QirError::validation(
            format!("{field}.param.name"),
            "parameter name must be a non-empty string",
        ));
    }
    let hint = match spec.ty.as_deref() {
        Some(raw) => Some(types::normalize_type(raw).ok_or_else(|| {
            QirError::parameter_type(&spec.name, format!("unsupported type '{raw}'"))
        })?),
        None if op.requires_explicit_type() => {
            return Err(QirError::parameter_type(
                &spec.name,
                format!("{} requires an explicit parameter type", op.as_str()),
            ))
        }
        None => column_type.and_then(types::normalize_type),
    };
    if op == CompareOp::In && !hint.as_deref().is_some_and(types::is_array) {
        return Err(QirError::parameter_type(
            &spec.name,
            "in requires an array type such as text[]",
        ));
    }
    Ok(env.param(&spec.name, hint.as_deref(), spec.special.as_deref()))
}

fn missing_operand(op: CompareOp, field: &str) -> QirError {
    QirError::validation(field, format!("{} requires a param or value", op.as_str()))
}

fn literal_for_column(value: JsonValue, column_type: Option<&str>, field: &str) -> Result<Expr> {
    let column_type = column_type.and_then(types::normalize_type);
    let type_hint = match (&value, column_type.as_deref()) {
        (_, Some(ty)) if types::is_json(ty) => Some(ty.to_owned()),
        (JsonValue::String(_), Some(ty)) if ty != "text" => Some(ty.to_owned()),
        (JsonValue::Number(_) | JsonValue::Bool(_), Some("text")) => Some("text".to_owned()),
        (JsonValue::Array(_), Some(ty)) if types::is_array(ty) => Some(ty.to_owned()),
        (JsonValue::Array(_) | JsonValue::Object(_), Some(ty)) => {
            return Err(QirError::parameter_type(
                field,
                format!("a structured value cannot be compared with column type {ty}"),
            ))
        }
        _ => None,
    };
    Ok(Expr::Literal { value, type_hint })
}

fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Env;

    impl PredicateEnv for Env {
        fn resolve_column(&self, path: &str, field: &str) -> Result<ResolvedColumn> {
            let ty = match path {
                "name" | "email" => "text",
                "id" | "stock" => "integer",
                "tags" => "text[]",
                "attrs" => "jsonb",
                "meta" => "json",
                "created_at" => "timestamptz",
                _ => return Err(QirError::validation(field, format!("unknown column '{path}'"))),
            };
            Ok(ResolvedColumn {
                table: "t0".into(),
                column: path.into(),
                ty: Some(ty.into()),
            })
        }
    }

    fn compile(filter: JsonValue) -> Result<Predicate> {
        compile_filter(&filter, &Env, "where")
    }

    fn col(name: &str) -> Expr {
        Expr::column("t0", name)
    }

    #[test]
    fn null_equality_becomes_null_checks() {
        assert_eq!(
            compile(json!({"email": {"eq": null}})).unwrap(),
            Predicate::is_null(col("email"))
        );
        assert_eq!(
            compile(json!({"email": {"ne": null}})).unwrap(),
            Predicate::Not(Box::new(Predicate::is_null(col("email"))))
        );
        assert_eq!(
            compile(json!({"email": {"isNull": false}})).unwrap(),
            Predicate::is_not_null(col("email"))
        );
        assert!(compile(json!({"email": {"lt": null}})).is_err());
    }

    #[test]
    fn empty_in_is_always_false() {
        assert_eq!(
            compile(json!({"id": {"in": []}})).unwrap(),
            Predicate::Const(false)
        );
    }

    #[test]
    fn in_requires_array_typed_param() {
        let err = compile(json!({"id": {"in": [1, 2]}})).unwrap_err();
        assert_eq!(err.code(), "ParameterTypeError");
        let err = compile(json!({"id": {"in": {"param": {"name": "ids"}}}})).unwrap_err();
        assert_eq!(err.code(), "ParameterTypeError");
        let err =
            compile(json!({"id": {"in": {"param": {"name": "ids", "type": "int"}}}})).unwrap_err();
        assert_eq!(err.code(), "ParameterTypeError");
        let pred =
            compile(json!({"id": {"in": {"param": {"name": "ids", "type": "int[]"}}}})).unwrap();
        assert_eq!(
            pred,
            Predicate::compare(
                col("id"),
                CompareOp::In,
                Expr::Param(Param::new("ids").typed("integer[]"))
            )
        );
    }

    #[test]
    fn untyped_params_take_column_type() {
        let pred = compile(json!({"stock": {"gte": {"param": {"name": "min"}}}})).unwrap();
        assert_eq!(
            pred,
            Predicate::compare(
                col("stock"),
                CompareOp::Gte,
                Expr::Param(Param::new("min").typed("integer"))
            )
        );
        let err = compile(json!({"name": {"ilike": {"param": {"name": "q"}}}})).unwrap_err();
        assert_eq!(err.code(), "ParameterTypeError");
    }

    #[test]
    fn contains_falls_back_to_ilike_on_text() {
        let pred = compile(json!({"name": {"contains": "50%"}})).unwrap();
        assert_eq!(
            pred,
            Predicate::compare(col("name"), CompareOp::ILike, Expr::literal("%50\\%%"))
        );
        let pred = compile(json!({"attrs": {"contains": {"color": "red"}}})).unwrap();
        assert!(matches!(
            pred,
            Predicate::Compare {
                op: CompareOp::Contains,
                ..
            }
        ));
        let pred =
            compile(json!({"tags": {"contains": {"param": {"name": "t", "type": "text[]"}}}}))
                .unwrap();
        assert!(matches!(
            pred,
            Predicate::Compare {
                op: CompareOp::Contains,
                ..
            }
        ));
    }

    #[test]
    fn boolean_combinators_nest() {
        let pred = compile(json!({
            "OR": [
                {"name": {"eq": "a"}},
                {"NOT": {"AND": [{"stock": {"gt": 0}}, {"email": {"isNotNull": true}}]}}
            ]
        }))
        .unwrap();
        match pred {
            Predicate::Or(children) => {
                assert_eq!(children.len(), 2);
                assert!(matches!(&children[1], Predicate::Not(inner) if matches!(**inner, Predicate::And(_))));
            }
            other => panic!("unexpected predicate: {other:?}"),
        }
    }

    #[test]
    fn shape_errors_name_the_field() {
        let err = compile(json!({"name": {"eq": "a"}, "stock": {"eq": 1}})).unwrap_err();
        assert!(err.to_string().starts_with("where:"));
        let err = compile(json!({"AND": [{"name": {"between": [1, 2]}}]})).unwrap_err();
        assert_eq!(
            err,
            QirError::validation("where.AND[0].name.between", "unsupported operator 'between'")
        );
        let err = compile(json!({"nope": {"eq": 1}})).unwrap_err();
        assert!(err.to_string().contains("unknown column 'nope'"));
    }

    #[test]
    fn string_literals_cast_to_non_text_columns() {
        let pred = compile(json!({"created_at": {"gte": "2024-01-01"}})).unwrap();
        assert_eq!(
            pred,
            Predicate::compare(
                col("created_at"),
                CompareOp::Gte,
                Expr::Literal {
                    value: json!("2024-01-01"),
                    type_hint: Some("timestamptz".into())
                }
            )
        );
        let pred = compile(json!({"name": {"eq": 5}})).unwrap();
        assert!(matches!(
            pred,
            Predicate::Compare { right: Some(Expr::Literal { type_hint: Some(ref ty), .. }), .. } if ty == "text"
        ));
    }

    #[test]
    fn contains_rejects_non_text_scalars() {
        let err = compile(json!({"stock": {"contains": "5"}})).unwrap_err();
        assert_eq!(
            err,
            QirError::parameter_type(
                "where.stock.contains",
                "contains is not supported on integer column 'stock'"
            )
        );
        let err = compile(json!({"created_at": {"contains": {"param": {"name": "d", "type": "text"}}}}))
            .unwrap_err();
        assert_eq!(err.code(), "ParameterTypeError");
    }

    #[test]
    fn contains_on_json_compares_as_jsonb() {
        let pred = compile(json!({"meta": {"contains": {"k": 1}}})).unwrap();
        assert_eq!(
            pred,
            Predicate::compare(
                Expr::call("to_jsonb", vec![col("meta")]),
                CompareOp::Contains,
                Expr::Literal {
                    value: json!({"k": 1}),
                    type_hint: Some("jsonb".into())
                }
            )
        );
        let pred =
            compile(json!({"attrs": {"contains": {"param": {"name": "p", "type": "json"}}}})).unwrap();
        assert_eq!(
            pred,
            Predicate::compare(
                col("attrs"),
                CompareOp::Contains,
                Expr::call("to_jsonb", vec![Expr::Param(Param::new("p").typed("json"))])
            )
        );
        let err = compile(json!({"attrs": {"contains": {"param": {"name": "p", "type": "text"}}}}))
            .unwrap_err();
        assert_eq!(err.code(), "ParameterTypeError");
    }

    #[test]
    fn contains_on_arrays_needs_array_operands() {
        let pred = compile(json!({"tags": {"contains": ["a", "b"]}})).unwrap();
        assert_eq!(
            pred,
            Predicate::compare(
                col("tags"),
                CompareOp::Contains,
                Expr::Literal {
                    value: json!(["a", "b"]),
                    type_hint: Some("text[]".into())
                }
            )
        );
        let err = compile(json!({"tags": {"contains": {"param": {"name": "t", "type": "text"}}}}))
            .unwrap_err();
        assert_eq!(err.code(), "ParameterTypeError");
        assert!(compile(json!({"tags": {"contains": "a"}})).is_err());
    }

    #[test]
    fn contains_param_on_text_is_escaped() {
        let pred = compile(json!({"name": {"contains": {"param": {"name": "q", "type": "text"}}}}))
            .unwrap();
        let escaped = ["\\", "%", "_"].into_iter().fold(
            Expr::Param(Param::new("q").typed("text")),
            |acc, meta| {
                Expr::call(
                    "replace",
                    vec![acc, Expr::literal(meta), Expr::literal(format!("\\{meta}"))],
                )
            },
        );
        assert_eq!(
            pred,
            Predicate::compare(
                col("name"),
                CompareOp::ILike,
                Expr::call("concat", vec![Expr::literal("%"), escaped, Expr::literal("%")])
            )
        );
    }

    #[test]
    fn structured_literals_need_a_matching_column() {
        let pred = compile(json!({"tags": {"eq": ["a", "b"]}})).unwrap();
        assert_eq!(
            pred,
            Predicate::compare(
                col("tags"),
                CompareOp::Eq,
                Expr::Literal {
                    value: json!(["a", "b"]),
                    type_hint: Some("text[]".into())
                }
            )
        );
        let err = compile(json!({"stock": {"eq": [1, 2]}})).unwrap_err();
        assert_eq!(
            err,
            QirError::parameter_type(
                "where.stock.eq",
                "a structured value cannot be compared with column type integer"
            )
        );
        assert!(compile(json!({"tags": {"eq": {"a": 1}}})).is_err());
    }

    #[test]
    fn top_level_filters_and_together() {
        let pred = compile_filters(
            &[json!({"name": {"eq": "a"}}), json!({"stock": {"gt": 1}})],
            &Env,
            "where",
        )
        .unwrap();
        assert!(matches!(pred, Some(Predicate::And(ref c)) if c.len() == 2));
        assert_eq!(compile_filters(&[], &Env, "where").unwrap(), None);
    }
}
