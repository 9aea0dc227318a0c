#![forbid(unsafe_code)]

//! Query intermediate representation compiler.
//!
//! Turns operation descriptors into a relational-algebra plan and lowers it
//! to parameterized PostgreSQL, optionally wrapped as VIEW or FUNCTION DDL.
//!
//! descriptor → [`builder`] → [`ir::QueryPlan`] → [`lower`] → SQL → [`emit`]

/// Operation plan builder.
///
/// Validates descriptors against the catalog and assembles query plans.
pub mod builder;

/// Column/type catalog and primary-key resolver hook.
pub mod catalog;

/// Compiler facade.
pub mod compiler;

/// Compiler configuration.
pub mod config;

/// Serde operation descriptors.
pub mod descriptor;

/// VIEW/FUNCTION emission.
pub mod emit;

/// Error taxonomy shared by every pass.
pub mod errors;

/// Explain trees and plan hashing.
pub mod explain;

/// Identifier validation and quoting.
pub mod ident;

/// Relation, expression, and predicate node types.
pub mod ir;

/// SQL lowering engine.
///
/// Renders plans recursively, hoisting filters and appending the ORDER BY
/// tie-breaker.
pub mod lower;

/// Deterministic parameter collection.
pub mod params;

/// Filter DSL compilation.
pub mod predicate;

/// Scalar type normalization.
pub mod types;

pub use catalog::{Catalog, InMemoryCatalog, PrimaryKeyResolver};
pub use compiler::{CompiledQuery, Compiler};
pub use config::CompilerConfig;
pub use descriptor::SelectDescriptor;
pub use errors::{QirError, QirErrorWithCode, Result};
pub use ident::IdentifierPolicy;
