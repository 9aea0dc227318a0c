//! Query intermediate representation compiler.
//!
//! Builds, validates, and lowers operation descriptors into parameterized
//! SQL, plus persisted VIEW/FUNCTION wrappers.

#![warn(missing_docs)]

pub mod qir;

pub use qir::{
    Catalog, CompiledQuery, Compiler, CompilerConfig, IdentifierPolicy, InMemoryCatalog,
    PrimaryKeyResolver, QirError, QirErrorWithCode, SelectDescriptor,
};
