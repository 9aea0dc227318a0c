use std::sync::Arc;

use qir::{Compiler, CompilerConfig, IdentifierPolicy, InMemoryCatalog};
use serde_json::json;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[test]
fn config_loads_from_toml() {
    init_tracing();
    let config: CompilerConfig = toml::from_str(
        r#"
identifierPolicy = "strict"
schema = "reporting"
functionParamDefaultType = "varchar"
"#,
    )
    .expect("toml");
    assert_eq!(config.identifier_policy, IdentifierPolicy::Strict);
    assert_eq!(config.schema, "reporting");
    assert_eq!(config.default_primary_key, "id");

    let catalog = InMemoryCatalog::new().with_table("item", [("id", "integer"), ("label", "text")]);
    let compiler = Compiler::new(config, Arc::new(catalog));
    let desc = qir::SelectDescriptor::from_json(&json!({
        "table": "item",
        "alias": "i",
        "filters": [{"column": "label", "op": "eq", "param": {"name": "label"}}]
    }))
    .expect("descriptor");
    let ddl = compiler.emit_function("by label", &desc).expect("emit");
    assert!(ddl.starts_with(
        "CREATE OR REPLACE FUNCTION \"reporting\".\"op_by_label\"(\"label\" text)"
    ));
}

#[test]
fn unknown_keys_are_rejected() {
    let err = toml::from_str::<CompilerConfig>("identifier_policy = \"strict\"").unwrap_err();
    assert!(err.to_string().contains("unknown field"));
}

#[test]
fn custom_default_primary_key_drives_tie_breaker() {
    init_tracing();
    let config: CompilerConfig = toml::from_str("defaultPrimaryKey = \"uid\"").expect("toml");
    let catalog = InMemoryCatalog::new().with_table("account", [("uid", "uuid"), ("id", "integer")]);
    let out = Compiler::new(config, Arc::new(catalog))
        .compile_json(&json!({"table": "account", "alias": "a"}))
        .expect("compile");
    assert_eq!(out.sql, "SELECT * FROM account a ORDER BY a.uid ASC");
}
