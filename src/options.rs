use serde::{Deserialize, Serialize};

use crate::validate::{CompilerError, ErrorKind, Result};

/// Compilation and caching switches. Every field has a default, so a partial JSON object
/// is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CompileOptions {
    /// Ignore any cached artifact and compile again.
    pub force_recompile: bool,
    pub cache_enabled: bool,
    /// Compare the cached freshness token with the current template source.
    pub check_freshness: bool,
    /// Drop whitespace-only text nodes while parsing.
    pub strip_blank_text: bool,
    pub remove_comments: bool,
    /// Join array results with `array_join_separator` instead of failing at run time.
    pub auto_array_join: bool,
    pub array_join_separator: String,
    /// `loop` fails at run time on values that are not iterable.
    pub strict_iteration: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            force_recompile: false,
            cache_enabled: true,
            check_freshness: true,
            strip_blank_text: false,
            remove_comments: false,
            auto_array_join: false,
            array_join_separator: ", ".to_string(),
            strict_iteration: false,
        }
    }
}

impl CompileOptions {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            CompilerError::new(ErrorKind::Io, format!("Invalid compile options: {}", e))
        })
    }
}
