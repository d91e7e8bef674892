//! # Variable Environment
//!
//! Resolves template variables against an ordered list of data sources and hands out
//! collision-free temporaries.
//!
//! ## Resolution Order
//!
//! 1. Scope frames pushed by `loop`, `fill` and `def`, innermost first. A frame hit returns
//!    the frame's generated expression as is; no binding is created.
//! 2. Data sources, front to back. The first source that knows the name wins, and a
//!    binding (`const _name = <storage>;`) is created on first use and reused afterwards.
//! 3. Unresolved names become the literal `null`.
//!
//! Residual code is finally parsed with oxc and may only reference generated names
//! and `$rt`.

use oxc_allocator::Allocator;
use oxc_ast_visit::Visit;
use oxc_parser::Parser;
use oxc_span::SourceType;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::static_eval::{render_literal, Substitution};
use crate::validate::{CompilerError, ErrorKind, Result};

/// An object-shaped data source.
pub trait ObjectSource: Send + Sync {
    /// Value of a declared property.
    fn property(&self, name: &str) -> Option<Value>;

    /// Fallback getter. Counts as a match only when it yields a value.
    fn magic_get(&self, _name: &str) -> Option<Value> {
        None
    }

    /// Whether `object[name]` is served by index access.
    fn supports_index(&self, _name: &str) -> bool {
        false
    }
}

pub type CallableSource = Box<dyn Fn(&str) -> Option<Value> + Send + Sync>;

pub enum DataSource {
    Json(Map<String, Value>),
    Strings(HashMap<String, String>),
    Object(Box<dyn ObjectSource>),
    Callable(CallableSource),
}

impl std::fmt::Debug for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataSource::Json(map) => f.debug_tuple("Json").field(map).finish(),
            DataSource::Strings(map) => f.debug_tuple("Strings").field(map).finish(),
            DataSource::Object(_) => f.write_str("Object(..)"),
            DataSource::Callable(_) => f.write_str("Callable(..)"),
        }
    }
}

impl DataSource {
    /// One letter per source kind, used in cache keys.
    pub fn signature_letter(&self) -> char {
        match self {
            DataSource::Json(_) => 'a',
            DataSource::Strings(_) => 'm',
            DataSource::Object(_) => 'o',
            DataSource::Callable(_) => 'c',
        }
    }

    /// Host expression reading `name` from this source, if the source knows it.
    fn storage(&self, index: usize, name: &str) -> Option<String> {
        let source = format!("$src[{}]", index);
        let key = render_literal(&Value::String(name.to_string()));
        match self {
            DataSource::Json(map) if map.contains_key(name) => {
                Some(format!("{}[{}]", source, key))
            }
            DataSource::Strings(map) if map.contains_key(name) => {
                Some(format!("{}[{}]", source, key))
            }
            DataSource::Object(object) => {
                if object.property(name).is_some() {
                    Some(format!("{}[{}]", source, key))
                } else if object.magic_get(name).is_some() {
                    Some(format!("$rt.magic({}, {})", source, key))
                } else if object.supports_index(name) {
                    Some(format!("$rt.index({}, {})", source, key))
                } else {
                    None
                }
            }
            DataSource::Callable(callable) => {
                callable(name).map(|_| format!("{}({})", source, key))
            }
            _ => None,
        }
    }
}

pub fn signature(sources: &[DataSource]) -> String {
    sources.iter().map(DataSource::signature_letter).collect()
}

// ═══════════════════════════════════════════════════════════════════════════════
// TEMPORARIES
// ═══════════════════════════════════════════════════════════════════════════════

/// Generated local names. Uniqueness is case-insensitive.
#[derive(Debug, Default, Clone)]
pub struct TempPool {
    live: HashSet<String>,
    issued: HashSet<String>,
}

impl TempPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// `_` + sanitized hint, suffixed with the smallest free number when taken.
    pub fn get(&mut self, hint: &str) -> String {
        let sanitized: String = hint
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect();
        let base = if sanitized.is_empty() {
            "_t".to_string()
        } else {
            format!("_{}", sanitized)
        };

        let mut candidate = base.clone();
        let mut suffix = 1;
        while self.live.contains(&candidate.to_lowercase()) {
            candidate = format!("{}{}", base, suffix);
            suffix += 1;
        }
        self.live.insert(candidate.to_lowercase());
        self.issued.insert(candidate.clone());
        candidate
    }

    pub fn free(&mut self, name: &str) -> Result<()> {
        if self.live.remove(&name.to_lowercase()) {
            Ok(())
        } else {
            Err(CompilerError::new(
                ErrorKind::UnknownTemporary,
                format!("Temporary '{}' was never allocated or is already free", name),
            ))
        }
    }

    pub fn is_live(&self, name: &str) -> bool {
        self.live.contains(&name.to_lowercase())
    }

    /// Every name handed out so far, live or not.
    pub fn issued(&self) -> &HashSet<String> {
        &self.issued
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ENVIRONMENT
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub name: String,
    pub source: usize,
    pub temp: String,
    pub storage: String,
}

pub struct Environment<'s> {
    sources: &'s [DataSource],
    frames: Vec<HashMap<String, String>>,
    bindings: Vec<Binding>,
    memo: HashMap<(usize, String), usize>,
    temps: TempPool,
}

impl<'s> Environment<'s> {
    pub fn new(sources: &'s [DataSource]) -> Self {
        Environment {
            sources,
            frames: Vec::new(),
            bindings: Vec::new(),
            memo: HashMap::new(),
            temps: TempPool::new(),
        }
    }

    pub fn signature(&self) -> String {
        signature(self.sources)
    }

    pub fn resolve(&mut self, name: &str) -> Option<String> {
        for frame in self.frames.iter().rev() {
            if let Some(expr) = frame.get(name) {
                return Some(expr.clone());
            }
        }

        for (index, source) in self.sources.iter().enumerate() {
            let Some(storage) = source.storage(index, name) else {
                continue;
            };
            let key = (index, name.to_string());
            if let Some(existing) = self.memo.get(&key) {
                return Some(self.bindings[*existing].temp.clone());
            }
            let temp = self.temps.get(name);
            self.memo.insert(key, self.bindings.len());
            self.bindings.push(Binding {
                name: name.to_string(),
                source: index,
                temp: temp.clone(),
                storage,
            });
            return Some(temp);
        }
        None
    }

    /// Resolution as seen by the expression analyzer.
    pub fn substitution(&mut self, name: &str) -> Substitution {
        match self.resolve(name) {
            Some(expr) => Substitution::Code(expr),
            None => {
                debug!(variable = name, "unresolved template variable, using null");
                Substitution::Literal(Value::Null)
            }
        }
    }

    pub fn push(&mut self, frame: HashMap<String, String>) {
        self.frames.push(frame);
    }

    pub fn pop(&mut self) -> Option<HashMap<String, String>> {
        self.frames.pop()
    }

    /// Number of pushed frames.
    pub fn local_count(&self) -> usize {
        self.frames.len()
    }

    /// Rebinds `name` in the innermost frame.
    pub fn bind_local(&mut self, name: &str, expr: &str) {
        match self.frames.last_mut() {
            Some(frame) => {
                frame.insert(name.to_string(), expr.to_string());
            }
            None => self.push(HashMap::from([(name.to_string(), expr.to_string())])),
        }
    }

    pub fn get_temp(&mut self, hint: &str) -> String {
        self.temps.get(hint)
    }

    pub fn free_temp(&mut self, name: &str) -> Result<()> {
        self.temps.free(name)
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    pub fn render_bindings(&self) -> String {
        self.bindings
            .iter()
            .map(|b| format!("const {} = {};\n", b.temp, b.storage))
            .collect()
    }

    /// Checks that residual code parses as one expression and only references generated
    /// names and `$rt`.
    pub fn check_residual(&self, code: &str) -> Result<()> {
        let allocator = Allocator::default();
        let expr = Parser::new(&allocator, code, SourceType::default())
            .parse_expression()
            .map_err(|errors| {
                let detail = errors
                    .first()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "syntax error".to_string());
                CompilerError::malformed(format!("Invalid expression `{}`: {}", code, detail))
            })?;

        let mut collector = ReferenceCollector {
            references: Vec::new(),
        };
        collector.visit_expression(&expr);

        for name in collector.references {
            if name != "$rt" && !self.temps.issued().contains(&name) {
                return Err(CompilerError::forbidden(format!(
                    "Expression references unknown identifier '{}'",
                    name
                )));
            }
        }
        Ok(())
    }
}

struct ReferenceCollector {
    references: Vec<String>,
}

impl<'a> Visit<'a> for ReferenceCollector {
    fn visit_identifier_reference(&mut self, ident: &oxc_ast::ast::IdentifierReference<'a>) {
        self.references.push(ident.name.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Page;

    impl ObjectSource for Page {
        fn property(&self, name: &str) -> Option<Value> {
            (name == "title").then(|| json!("Home"))
        }

        fn magic_get(&self, name: &str) -> Option<Value> {
            name.starts_with("meta_").then(|| json!(""))
        }

        fn supports_index(&self, name: &str) -> bool {
            name == "items"
        }
    }

    fn sources() -> Vec<DataSource> {
        let mut map = Map::new();
        map.insert("user".into(), json!({"name": "Ann"}));
        vec![
            DataSource::Json(map),
            DataSource::Object(Box::new(Page)),
            DataSource::Callable(Box::new(|name: &str| (name == "lang").then(|| json!("en")))),
        ]
    }

    #[test]
    fn test_storage_per_source_kind() {
        let sources = sources();
        let mut env = Environment::new(&sources);
        assert_eq!(env.resolve("user").as_deref(), Some("_user"));
        assert_eq!(env.resolve("title").as_deref(), Some("_title"));
        assert_eq!(env.resolve("meta_x").as_deref(), Some("_meta_x"));
        assert_eq!(env.resolve("items").as_deref(), Some("_items"));
        assert_eq!(env.resolve("lang").as_deref(), Some("_lang"));
        assert_eq!(env.resolve("nothing"), None);

        assert_eq!(
            env.render_bindings(),
            "const _user = $src[0][\"user\"];\n\
             const _title = $src[1][\"title\"];\n\
             const _meta_x = $rt.magic($src[1], \"meta_x\");\n\
             const _items = $rt.index($src[1], \"items\");\n\
             const _lang = $src[2](\"lang\");\n"
        );
        assert_eq!(env.signature(), "aoc");
    }

    #[test]
    fn test_binding_is_memoized() {
        let sources = sources();
        let mut env = Environment::new(&sources);
        let first = env.resolve("user");
        let second = env.resolve("user");
        assert_eq!(first, second);
        assert_eq!(env.bindings().len(), 1);
    }

    #[test]
    fn test_frames_shadow_without_binding() {
        let sources = sources();
        let mut env = Environment::new(&sources);
        env.push(HashMap::from([("user".to_string(), "_v".to_string())]));
        assert_eq!(env.resolve("user").as_deref(), Some("_v"));
        assert!(env.bindings().is_empty());
        env.pop();
        assert_eq!(env.resolve("user").as_deref(), Some("_user"));
    }

    #[test]
    fn test_unresolved_is_null_literal() {
        let sources = sources();
        let mut env = Environment::new(&sources);
        assert_eq!(env.substitution("ghost"), Substitution::Literal(Value::Null));
    }

    #[test]
    fn test_temp_pool_case_insensitive() {
        let mut pool = TempPool::new();
        assert_eq!(pool.get("x"), "_x");
        assert_eq!(pool.get("X"), "_X1");
        assert_eq!(pool.get("x"), "_x2");
        pool.free("_x1").unwrap();
        assert_eq!(pool.get("x"), "_x1");
        assert_eq!(pool.get("a-b"), "_a_b");
        let err = pool.free("_nope").unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownTemporary);
    }

    #[test]
    fn test_check_residual() {
        let sources = sources();
        let mut env = Environment::new(&sources);
        let temp = env.resolve("user").unwrap();
        env.check_residual(&format!("$rt.str({}?.name)", temp)).unwrap();
        env.check_residual("$rt.chain(() => (_user), () => (\"x\"))").unwrap();

        let err = env.check_residual("process.exit(1)").unwrap_err();
        assert_eq!(err.kind, ErrorKind::ForbiddenConstruct);
        let err = env.check_residual("_user +").unwrap_err();
        assert_eq!(err.kind, ErrorKind::MalformedExpression);
    }
}
