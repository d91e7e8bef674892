//! Artifact assembly.
//!
//! Wraps a compiled body into a self-registering JavaScript unit. Evaluating the unit yields
//! a function of `registry`; calling it twice with the same registry returns the instance
//! registered first.

#[cfg(feature = "napi")]
use napi_derive::napi;
use oxc_allocator::Allocator;
use oxc_parser::Parser;
use oxc_span::SourceType;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::codegen::CompiledBody;
use crate::static_eval::render_literal;
use crate::validate::{CompilerError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "napi", napi(object))]
#[serde(rename_all = "camelCase")]
pub struct CompiledUnit {
    /// Registry name, derived from the cache key.
    pub name: String,
    pub key: String,
    /// SHA-256 of the template source the unit was compiled from.
    pub freshness: String,
    pub code: String,
    /// Binding declarations placed at the top of the unit.
    pub bindings: String,
}

pub fn compute_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// `tpl_` followed by the first 16 hex digits of the key's hash.
pub fn unit_name(key: &str) -> String {
    format!("tpl_{}", &compute_hash(key)[..16])
}

pub fn finalize_unit(key: &str, freshness: &str, body: CompiledBody) -> Result<CompiledUnit> {
    let name = unit_name(key);
    let quoted = render_literal(&serde_json::Value::String(name.clone()));
    let code = format!(
        "(function (registry) {{\n\
         \"use strict\";\n\
         if (Object.prototype.hasOwnProperty.call(registry, {q})) return registry[{q}];\n\
         return (registry[{q}] = function ($rt, $src) {{\n\
         {bindings}{body}}});\n\
         }})\n",
        q = quoted,
        bindings = body.bindings,
        body = body.body,
    );
    verify_artifact(&code)?;

    Ok(CompiledUnit {
        name,
        key: key.to_string(),
        freshness: freshness.to_string(),
        code,
        bindings: body.bindings,
    })
}

/// The assembled unit must parse as JavaScript.
fn verify_artifact(code: &str) -> Result<()> {
    let allocator = Allocator::default();
    let ret = Parser::new(&allocator, code, SourceType::default()).parse();
    if let Some(error) = ret.errors.first() {
        return Err(CompilerError::tree(format!(
            "Generated code does not parse: {}",
            error
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(bindings: &str, code: &str) -> CompiledBody {
        CompiledBody {
            bindings: bindings.to_string(),
            body: code.to_string(),
        }
    }

    #[test]
    fn test_unit_name_is_stable() {
        let name = unit_name("page.xml#a");
        assert_eq!(name, unit_name("page.xml#a"));
        assert_ne!(name, unit_name("page.xml#o"));
        assert_eq!(name.len(), 4 + 16);
        assert!(name.starts_with("tpl_"));
    }

    #[test]
    fn test_unit_shape() {
        let unit = finalize_unit(
            "page.xml#a",
            "abc",
            body("const _x = $src[0][\"x\"];\n", "$rt.echo(_x);\n"),
        )
        .unwrap();
        assert!(unit.code.starts_with("(function (registry) {\n\"use strict\";\n"));
        assert!(unit
            .code
            .contains(&format!("hasOwnProperty.call(registry, \"{}\")", unit.name)));
        assert!(unit
            .code
            .contains("function ($rt, $src) {\nconst _x = $src[0][\"x\"];\n$rt.echo(_x);\n});"));
        assert_eq!(unit.freshness, "abc");
    }

    #[test]
    fn test_invalid_body_is_rejected() {
        assert!(finalize_unit("k", "f", body("", "if (\n")).is_err());
    }

    #[test]
    fn test_compute_hash() {
        assert_eq!(
            compute_hash(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
