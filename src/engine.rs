//! # Template Engine
//!
//! Top-level driver: load the source, consult the artifact cache, compile on a miss and
//! store the result.
//!
//! ## Key Invariants
//!
//! 1. **Keyed by Shape**: the cache key is `path#signature`, so data sources of a
//!    different kind never reuse a unit compiled for another shape.
//! 2. **Nothing Cached on Error**: a failed compilation leaves the cache untouched.
//! 3. **Independent Units**: every compilation builds its own `Compiler`, environment and
//!    transformer, so units can be compiled in parallel.

#[cfg(feature = "napi")]
use napi_derive::napi;
use rayon::prelude::*;
use std::path::Path;
use tracing::debug;

use crate::cache::{cache_key, ArtifactCache};
use crate::codegen::compile_template;
use crate::discovery::{discover_templates, TemplateSource, TEMPLATE_EXTENSION};
use crate::finalize::{compute_hash, finalize_unit, CompiledUnit};
use crate::options::CompileOptions;
use crate::scope::{signature, DataSource};
use crate::transform::LinkResolver;
use crate::validate::Result;

pub struct TemplateEngine {
    source: Box<dyn TemplateSource>,
    cache: Option<Box<dyn ArtifactCache>>,
    links: Option<Box<dyn LinkResolver>>,
    options: CompileOptions,
}

impl TemplateEngine {
    pub fn new(source: impl TemplateSource + 'static, options: CompileOptions) -> Self {
        TemplateEngine {
            source: Box::new(source),
            cache: None,
            links: None,
            options,
        }
    }

    pub fn with_cache(mut self, cache: impl ArtifactCache + 'static) -> Self {
        self.cache = Some(Box::new(cache));
        self
    }

    pub fn with_links(mut self, links: impl LinkResolver + 'static) -> Self {
        self.links = Some(Box::new(links));
        self
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    fn active_cache(&self) -> Option<&dyn ArtifactCache> {
        if self.options.cache_enabled {
            self.cache.as_deref()
        } else {
            None
        }
    }

    /// Compiles the template at `path` for data sources shaped like `sources`.
    pub fn compile(&self, path: &str, sources: &[DataSource]) -> Result<CompiledUnit> {
        let text = self.source.load(path).map_err(|e| e.in_file(path))?;
        let key = cache_key(path, &signature(sources));
        let freshness = compute_hash(&text);

        if let Some(cache) = self.active_cache() {
            if !self.options.force_recompile {
                let usable = !self.options.check_freshness || cache.has(&key, &freshness);
                if let Some(unit) = cache.get(&key).filter(|_| usable) {
                    debug!(key = %key, "using cached compiled unit");
                    return Ok(unit);
                }
            }
        }

        debug!(key = %key, "compiling template");
        let unit = self
            .compile_text(&key, &text, sources)
            .map_err(|e| e.in_file(path))?;
        if let Some(cache) = self.active_cache() {
            cache.put(&key, &unit)?;
        }
        Ok(unit)
    }

    /// Compiles `text` without touching the source or the cache.
    pub fn compile_text(&self, key: &str, text: &str, sources: &[DataSource]) -> Result<CompiledUnit> {
        let body = compile_template(text, sources, &self.options, self.links.as_deref())?;
        finalize_unit(key, &compute_hash(text), body)
    }

    /// Compiles several templates in parallel. Results keep the order of `paths`.
    pub fn precompile(
        &self,
        paths: &[String],
        sources: &[DataSource],
    ) -> Vec<(String, Result<CompiledUnit>)> {
        paths
            .par_iter()
            .map(|path| (path.clone(), self.compile(path, sources)))
            .collect()
    }

    /// Precompiles every template file below `dir`. Paths are relative to `dir`, which
    /// should be the root of this engine's source.
    pub fn precompile_dir(
        &self,
        dir: &Path,
        sources: &[DataSource],
    ) -> Vec<(String, Result<CompiledUnit>)> {
        let paths = discover_templates(dir, TEMPLATE_EXTENSION);
        debug!(dir = %dir.display(), count = paths.len(), "precompiling templates");
        self.precompile(&paths, sources)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// NAPI EXPORT
// ═══════════════════════════════════════════════════════════════════════════════

/// Compiles one template for a Node host. `data` holds one JSON object per data source.
#[cfg(feature = "napi")]
#[napi]
pub fn compile_template_native(
    path: String,
    source: String,
    data: Vec<serde_json::Value>,
    options_json: Option<String>,
) -> napi::Result<CompiledUnit> {
    let options = match options_json {
        Some(json) => CompileOptions::from_json(&json)
            .map_err(|e| napi::Error::from_reason(e.to_string()))?,
        None => CompileOptions::default(),
    };
    let sources = data
        .into_iter()
        .map(|value| match value {
            serde_json::Value::Object(map) => Ok(DataSource::Json(map)),
            other => Err(napi::Error::from_reason(format!(
                "Data source must be an object, got {}",
                other
            ))),
        })
        .collect::<napi::Result<Vec<_>>>()?;

    let engine = TemplateEngine::new(
        crate::discovery::MemoryTemplateSource::new().with(path.clone(), source),
        options,
    );
    engine
        .compile(&path, &sources)
        .map_err(|e| napi::Error::from_reason(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryArtifactCache;
    use crate::discovery::MemoryTemplateSource;
    use crate::validate::ErrorKind;
    use serde_json::json;
    use std::sync::Arc;

    /// Shares one cache between engines so tests can inspect it.
    struct Shared(Arc<MemoryArtifactCache>);

    impl ArtifactCache for Shared {
        fn has(&self, key: &str, freshness: &str) -> bool {
            self.0.has(key, freshness)
        }
        fn get(&self, key: &str) -> Option<CompiledUnit> {
            self.0.get(key)
        }
        fn put(&self, key: &str, unit: &CompiledUnit) -> Result<()> {
            self.0.put(key, unit)
        }
    }

    fn json_source(value: serde_json::Value) -> DataSource {
        match value {
            serde_json::Value::Object(map) => DataSource::Json(map),
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn test_compile_and_cache() {
        let cache = Arc::new(MemoryArtifactCache::new());
        let engine = TemplateEngine::new(
            MemoryTemplateSource::new().with("home.xml", "<p>$title</p>"),
            CompileOptions::default(),
        )
        .with_cache(Shared(cache.clone()));
        let sources = vec![json_source(json!({"title": "Hi"}))];

        let unit = engine.compile("home.xml", &sources).unwrap();
        assert_eq!(unit.key, "home.xml#a");
        assert!(unit.code.contains("const _title = $src[0][\"title\"];"));
        assert!(cache.has("home.xml#a", &unit.freshness));

        let again = engine.compile("home.xml", &sources).unwrap();
        assert_eq!(again, unit);
    }

    #[test]
    fn test_stale_entry_is_recompiled() {
        let cache = Arc::new(MemoryArtifactCache::new());
        let mut stale = TemplateEngine::new(
            MemoryTemplateSource::new().with("a.xml", "<p>new</p>"),
            CompileOptions::default(),
        )
        .compile("a.xml", &[])
        .unwrap();
        stale.freshness = "old".to_string();
        stale.code = "stale".to_string();
        cache.put("a.xml#", &stale).unwrap();

        let engine = TemplateEngine::new(
            MemoryTemplateSource::new().with("a.xml", "<p>new</p>"),
            CompileOptions::default(),
        )
        .with_cache(Shared(cache.clone()));
        let unit = engine.compile("a.xml", &[]).unwrap();
        assert_ne!(unit.code, "stale");
        assert_eq!(cache.get("a.xml#").unwrap().code, unit.code);
    }

    #[test]
    fn test_error_carries_file_and_skips_cache() {
        let cache = Arc::new(MemoryArtifactCache::new());
        let engine = TemplateEngine::new(
            MemoryTemplateSource::new().with("bad.xml", "<p>{exec('ls')}</p>"),
            CompileOptions::default(),
        )
        .with_cache(Shared(cache.clone()));
        let err = engine.compile("bad.xml", &[]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownOrForbiddenFunction);
        assert_eq!(err.file, "bad.xml");
        assert!(cache.is_empty());

        let missing = engine.compile("nope.xml", &[]).unwrap_err();
        assert_eq!(missing.kind, ErrorKind::NotFound);
    }

    #[test]
    fn test_precompile_keeps_order() {
        let source = MemoryTemplateSource::new()
            .with("a.xml", "<a/>")
            .with("b.xml", "<b>")
            .with("c.xml", "<c/>");
        let engine = TemplateEngine::new(source, CompileOptions::default());
        let paths = vec!["a.xml".to_string(), "b.xml".to_string(), "c.xml".to_string()];
        let results = engine.precompile(&paths, &[]);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].0, "a.xml");
        assert!(results[0].1.is_ok());
        assert_eq!(results[1].1.as_ref().unwrap_err().kind, ErrorKind::TreeMalformed);
        assert!(results[2].1.is_ok());
    }
}
