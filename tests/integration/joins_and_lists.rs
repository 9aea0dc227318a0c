use std::sync::Arc;

use qir::{Compiler, CompilerConfig, InMemoryCatalog, QirErrorWithCode};
use serde_json::json;

fn compiler() -> Compiler {
    let catalog = InMemoryCatalog::new()
        .with_table(
            "product",
            [("id", "integer"), ("name", "text"), ("brand_id", "integer")],
        )
        .with_table("brand", [("id", "integer"), ("name", "text")])
        .with_table(
            "review",
            [
                ("id", "integer"),
                ("product_id", "integer"),
                ("name", "text"),
                ("stars", "smallint"),
            ],
        )
        .with_table("vote", [("id", "integer"), ("review_id", "integer")]);
    Compiler::new(CompilerConfig::default(), Arc::new(catalog))
}

#[test]
fn ambiguous_join_reference_names_the_field() {
    let err = compiler()
        .compile_json(&json!({
            "table": "product",
            "alias": "t0",
            "joins": [{"table": "brand", "alias": "b", "on": [
                {"left": "t0.brand_id", "right": "b.id"},
                {"left": "name", "right": "b.name"}
            ]}]
        }))
        .unwrap_err();
    assert_eq!(
        QirErrorWithCode(&err).to_string(),
        "[ValidationError] joins[0].on[1].left: ambiguous join reference 'name'; \
         qualify it with a table alias"
    );
}

#[test]
fn left_join_renders_on_and_where() {
    let out = compiler()
        .compile_json(&json!({
            "table": "product",
            "alias": "t0",
            "columns": ["id", "b.name"],
            "joins": [{"table": "brand", "alias": "b", "type": "left",
                       "on": {"left": "t0.brand_id", "right": "b.id"}}],
            "where": {"b.name": {"eq": "Acme"}}
        }))
        .expect("compile");
    assert_eq!(
        out.sql,
        "SELECT t0.id, b.name FROM product t0 LEFT JOIN brand b ON t0.brand_id = b.id \
         WHERE b.name = 'Acme' ORDER BY t0.id ASC"
    );
}

#[test]
fn list_aggregates_to_json_with_empty_fallback() {
    let out = compiler()
        .compile_json(&json!({
            "table": "product",
            "alias": "t0",
            "columns": ["id"],
            "lists": [{
                "name": "reviews",
                "table": "review",
                "alias": "r",
                "columns": ["id", "name"],
                "match": {"local": "id", "foreign": "product_id"}
            }]
        }))
        .expect("compile");
    assert!(out.sql.contains(
        "COALESCE(jsonb_agg(jsonb_build_object('id', r.id, 'name', r.name)), '[]'::jsonb)"
    ));
    assert_eq!(
        out.sql,
        "SELECT t0.id, r_list.reviews FROM product t0 LEFT JOIN LATERAL (SELECT \
         COALESCE(jsonb_agg(jsonb_build_object('id', r.id, 'name', r.name)), '[]'::jsonb) AS reviews \
         FROM review r WHERE r.product_id = t0.id) r_list ON TRUE ORDER BY t0.id ASC"
    );
}

#[test]
fn required_ordered_list_with_filter_param() {
    let out = compiler()
        .compile_json(&json!({
            "table": "product",
            "alias": "t0",
            "columns": ["id"],
            "lists": [{
                "name": "top_reviews",
                "table": "review",
                "alias": "r",
                "columns": ["id"],
                "match": {"local": "id", "foreign": "product_id"},
                "filters": [{"column": "stars", "op": "gte", "param": {"name": "min_stars"}}],
                "orderBy": [{"column": "stars", "dir": "desc"}],
                "required": true
            }]
        }))
        .expect("compile");
    assert_eq!(
        out.sql,
        "SELECT t0.id, r_list.top_reviews FROM product t0 LEFT JOIN LATERAL (SELECT \
         COALESCE(jsonb_agg(jsonb_build_object('id', r.id) ORDER BY r.stars DESC), '[]'::jsonb) \
         AS top_reviews FROM review r WHERE r.product_id = t0.id AND r.stars >= $1::smallint) r_list \
         ON TRUE WHERE EXISTS (SELECT * FROM review r WHERE r.product_id = t0.id \
         AND r.stars >= $1::smallint) ORDER BY t0.id ASC"
    );
    assert_eq!(out.params.len(), 1);
}

#[test]
fn nested_lists_join_inside_the_child() {
    let out = compiler()
        .compile_json(&json!({
            "table": "product",
            "alias": "t0",
            "columns": ["id"],
            "lists": [{
                "name": "reviews",
                "table": "review",
                "alias": "r",
                "columns": ["id"],
                "match": {"local": "id", "foreign": "product_id"},
                "lists": [{
                    "name": "votes",
                    "table": "vote",
                    "alias": "v",
                    "columns": ["id"],
                    "match": {"local": "id", "foreign": "review_id"}
                }]
            }]
        }))
        .expect("compile");
    assert!(out.sql.contains("jsonb_build_object('id', r.id, 'votes', v_list.votes)"));
    assert!(out.sql.contains(
        "FROM review r LEFT JOIN LATERAL (SELECT COALESCE(jsonb_agg(jsonb_build_object('id', v.id)), \
         '[]'::jsonb) AS votes FROM vote v WHERE v.review_id = r.id) v_list ON TRUE \
         WHERE r.product_id = t0.id) r_list"
    ));
}

#[test]
fn counts_project_scalar_subqueries() {
    let out = compiler()
        .compile_json(&json!({
            "table": "product",
            "alias": "t0",
            "columns": ["id"],
            "counts": [{"name": "review_count", "table": "review", "alias": "rc",
                        "match": {"local": "id", "foreign": "product_id"}}]
        }))
        .expect("compile");
    assert_eq!(
        out.sql,
        "SELECT t0.id, (SELECT count(1) AS count FROM review rc WHERE rc.product_id = t0.id) \
         AS review_count FROM product t0 ORDER BY t0.id ASC"
    );
}

#[test]
fn join_select_is_an_uncorrelated_subquery() {
    let out = compiler()
        .compile_json(&json!({
            "table": "product",
            "alias": "t0",
            "columns": ["id", "best.stars"],
            "joins": [{
                "alias": "best",
                "select": {
                    "table": "review",
                    "alias": "r",
                    "columns": ["product_id", "stars"],
                    "orderBy": [{"column": "stars", "dir": "desc"}],
                    "limit": 1
                },
                "on": {"left": "t0.id", "right": "best.product_id"}
            }]
        }))
        .expect("compile");
    assert_eq!(
        out.sql,
        "SELECT t0.id, best.stars FROM product t0 INNER JOIN (SELECT r.product_id, r.stars \
         FROM review r ORDER BY r.stars DESC, r.id ASC LIMIT 1) best ON t0.id = best.product_id \
         ORDER BY t0.id ASC"
    );
}
