//! Template source retrieval and discovery.
//!
//! Template paths are `/`-separated and relative to a source root. Discovery walks a
//! directory for template files so the engine can precompile them.

use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use crate::validate::{CompilerError, ErrorKind, Result};

/// Default template file extension.
pub const TEMPLATE_EXTENSION: &str = "xml";

pub trait TemplateSource: Send + Sync {
    /// Fails with `NotFound` when no template exists at `path`.
    fn load(&self, path: &str) -> Result<String>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// FILESYSTEM SOURCE
// ═══════════════════════════════════════════════════════════════════════════════

pub struct FsTemplateSource {
    root: PathBuf,
}

impl FsTemplateSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Rejects absolute paths and `..` so a template path never leaves the root.
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(CompilerError::new(
                ErrorKind::NotFound,
                format!("Template path \"{}\" is outside the template root", path),
            ));
        }
        Ok(self.root.join(relative))
    }
}

impl TemplateSource for FsTemplateSource {
    fn load(&self, path: &str) -> Result<String> {
        let full = self.resolve(path)?;
        fs::read_to_string(&full).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => CompilerError::new(
                ErrorKind::NotFound,
                format!("Template \"{}\" not found", path),
            ),
            _ => CompilerError::new(ErrorKind::Io, format!("{}: {}", full.display(), e)),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// IN-MEMORY SOURCE
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default)]
pub struct MemoryTemplateSource {
    templates: HashMap<String, String>,
}

impl MemoryTemplateSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, source: impl Into<String>) {
        self.templates.insert(path.into(), source.into());
    }

    pub fn with(mut self, path: impl Into<String>, source: impl Into<String>) -> Self {
        self.insert(path, source);
        self
    }

    /// Stored paths, sorted.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.templates.keys().cloned().collect();
        paths.sort();
        paths
    }
}

impl TemplateSource for MemoryTemplateSource {
    fn load(&self, path: &str) -> Result<String> {
        self.templates.get(path).cloned().ok_or_else(|| {
            CompilerError::new(ErrorKind::NotFound, format!("Template \"{}\" not found", path))
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DISCOVERY
// ═══════════════════════════════════════════════════════════════════════════════

/// Template paths below `dir` with the given extension, relative to `dir`, `/`-separated
/// and sorted.
pub fn discover_templates(dir: &Path, extension: &str) -> Vec<String> {
    let mut paths = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true).into_iter().flatten() {
        let path = entry.path();
        if !path.is_file() || path.extension().map_or(true, |ext| ext != extension) {
            continue;
        }
        let Ok(relative) = path.strip_prefix(dir) else {
            continue;
        };
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        paths.push(parts.join("/"));
    }
    paths.sort();
    paths
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("xtl-src-{}-{}", name, std::process::id()));
        fs::remove_dir_all(&dir).ok();
        fs::create_dir_all(dir.join("partials")).unwrap();
        dir
    }

    #[test]
    fn test_memory_source() {
        let source = MemoryTemplateSource::new().with("a.xml", "<p/>");
        assert_eq!(source.load("a.xml").unwrap(), "<p/>");
        assert_eq!(source.load("b.xml").unwrap_err().kind, ErrorKind::NotFound);
    }

    #[test]
    fn test_fs_source_and_discovery() {
        let root = temp_root("discover");
        fs::write(root.join("page.xml"), "<p>page</p>").unwrap();
        fs::write(root.join("partials/nav.xml"), "<nav/>").unwrap();
        fs::write(root.join("notes.txt"), "skip").unwrap();

        let source = FsTemplateSource::new(&root);
        assert_eq!(source.load("partials/nav.xml").unwrap(), "<nav/>");
        assert_eq!(source.load("missing.xml").unwrap_err().kind, ErrorKind::NotFound);
        assert_eq!(source.load("../page.xml").unwrap_err().kind, ErrorKind::NotFound);

        assert_eq!(
            discover_templates(&root, TEMPLATE_EXTENSION),
            vec!["page.xml".to_string(), "partials/nav.xml".to_string()]
        );
        fs::remove_dir_all(&root).ok();
    }
}
