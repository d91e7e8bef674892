//! # XTL Template Compiler
//!
//! Compiles XML templates into JavaScript units that render against a runtime helper
//! object (`$rt`) and an ordered list of data sources (`$src`).
//!
//! ## Pipeline
//!
//! source text → [`document`] tree → [`transform`] (match templates, applied once) →
//! [`codegen`] walk (expressions through [`static_eval`], names through [`scope`]) →
//! [`finalize`] unit → [`cache`].
//!
//! ## Compilation Invariants
//!
//! 1. **Fold What Is Known**: an expression whose inputs are all constant is evaluated at
//!    compile time with JavaScript semantics. Only the residue reaches the output.
//!
//! 2. **Closed Residue**: emitted expressions reference nothing but generated temporaries
//!    and `$rt`. Bare identifiers, assignments and unknown calls are compile errors.
//!
//! 3. **One Slot per Name**: every data-source variable is read once into a `const` at the
//!    top of the unit, however often the template uses it.
//!
//! 4. **Lexical Temporaries**: loop, def, fill and opt temporaries live in their own block
//!    and never share a name with another live temporary.
//!
//! 5. **Deterministic Output**: identical inputs produce byte-identical units.

#[cfg(feature = "napi")]
use napi_derive::napi;

pub mod builtins;
pub mod cache;
pub mod codegen;
pub mod discovery;
pub mod document;
pub mod engine;
pub mod finalize;
pub mod options;
pub mod scope;
pub mod static_eval;
pub mod tokenize;
pub mod transform;
pub mod validate;
pub mod xpath;

#[cfg(test)]
mod expression_tests;
#[cfg(test)]
mod safety_tests;
#[cfg(test)]
mod template_match_tests;

pub use cache::{cache_key, ArtifactCache, FsArtifactCache, MemoryArtifactCache};
pub use codegen::{compile_template, CompiledBody, Compiler, CompilerState};
pub use discovery::{FsTemplateSource, MemoryTemplateSource, TemplateSource};
pub use document::{Document, NodeId, NodeKind};
pub use engine::TemplateEngine;
pub use finalize::CompiledUnit;
pub use options::CompileOptions;
pub use scope::{DataSource, Environment, ObjectSource};
pub use static_eval::{analyze, evaluate_static, Analysis};
pub use transform::{LinkResolver, Transformer};
pub use validate::{CompilerError, ErrorKind, Result, SourceLocation};

#[cfg(feature = "napi")]
pub use engine::compile_template_native;

#[cfg(feature = "napi")]
#[napi]
pub fn compiler_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
