use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::document::{Document, NodeId, NodeKind};

// ═══════════════════════════════════════════════════════════════════════════════
// ERROR CODES
// ═══════════════════════════════════════════════════════════════════════════════

pub const ERR_MALFORMED_EXPRESSION: &str = "XTL-ERR-EXPR-001";
pub const ERR_ASSIGNMENT_FORBIDDEN: &str = "XTL-ERR-EXPR-002";
pub const ERR_OPERATOR_FORBIDDEN: &str = "XTL-ERR-EXPR-003";
pub const ERR_FORBIDDEN_CONSTRUCT: &str = "XTL-ERR-EXPR-004";
pub const ERR_UNKNOWN_FUNCTION: &str = "XTL-ERR-EXPR-005";
pub const ERR_DANGLING_BRANCH: &str = "XTL-ERR-TAG-001";
pub const ERR_DUPLICATE_CASE: &str = "XTL-ERR-TAG-002";
pub const ERR_DUPLICATE_DEFAULT: &str = "XTL-ERR-TAG-003";
pub const ERR_CASE_AFTER_DEFAULT: &str = "XTL-ERR-TAG-004";
pub const ERR_EMPTY_SWITCH: &str = "XTL-ERR-TAG-005";
pub const ERR_UNKNOWN_TEMPORARY: &str = "XTL-ERR-INTERNAL-001";
pub const ERR_TREE_MALFORMED: &str = "XTL-ERR-TREE-001";
pub const ERR_SELECTION_TYPE_MISMATCH: &str = "XTL-ERR-MATCH-001";
pub const ERR_NOT_FOUND: &str = "XTL-ERR-SOURCE-001";
pub const ERR_IO: &str = "XTL-ERR-IO-001";

/// The error taxonomy. Every kind aborts the current top-level compilation unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
pub enum ErrorKind {
    #[error("malformed expression")]
    MalformedExpression,
    #[error("assignment is not allowed in template expressions")]
    AssignmentForbidden,
    #[error("operator is not allowed in template expressions")]
    OperatorForbidden,
    #[error("construct is not allowed in template expressions")]
    ForbiddenConstruct,
    #[error("unknown or forbidden function")]
    UnknownOrForbiddenFunction,
    #[error("else/elseif without a preceding if")]
    DanglingBranch,
    #[error("duplicate case value")]
    DuplicateCase,
    #[error("more than one default block")]
    DuplicateDefault,
    #[error("case after default")]
    CaseAfterDefault,
    #[error("switch without case or default")]
    EmptySwitch,
    #[error("unknown temporary")]
    UnknownTemporary,
    #[error("malformed template tree")]
    TreeMalformed,
    #[error("node selection used where a scalar is required")]
    SelectionTypeMismatch,
    #[error("template not found")]
    NotFound,
    #[error("i/o failure")]
    Io,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::MalformedExpression => ERR_MALFORMED_EXPRESSION,
            ErrorKind::AssignmentForbidden => ERR_ASSIGNMENT_FORBIDDEN,
            ErrorKind::OperatorForbidden => ERR_OPERATOR_FORBIDDEN,
            ErrorKind::ForbiddenConstruct => ERR_FORBIDDEN_CONSTRUCT,
            ErrorKind::UnknownOrForbiddenFunction => ERR_UNKNOWN_FUNCTION,
            ErrorKind::DanglingBranch => ERR_DANGLING_BRANCH,
            ErrorKind::DuplicateCase => ERR_DUPLICATE_CASE,
            ErrorKind::DuplicateDefault => ERR_DUPLICATE_DEFAULT,
            ErrorKind::CaseAfterDefault => ERR_CASE_AFTER_DEFAULT,
            ErrorKind::EmptySwitch => ERR_EMPTY_SWITCH,
            ErrorKind::UnknownTemporary => ERR_UNKNOWN_TEMPORARY,
            ErrorKind::TreeMalformed => ERR_TREE_MALFORMED,
            ErrorKind::SelectionTypeMismatch => ERR_SELECTION_TYPE_MISMATCH,
            ErrorKind::NotFound => ERR_NOT_FOUND,
            ErrorKind::Io => ERR_IO,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// COMPILER ERROR
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("[{code}] {kind}: {message} ({file}:{line}:{column})")]
pub struct CompilerError {
    pub code: String,
    pub kind: ErrorKind,
    pub message: String,
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl CompilerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        CompilerError {
            code: kind.code().to_string(),
            kind,
            message: message.into(),
            file: String::new(),
            line: 0,
            column: 0,
        }
    }

    /// Attach a position unless a more precise one was already recorded.
    pub fn at(mut self, location: SourceLocation) -> Self {
        if self.line == 0 {
            self.line = location.line;
            self.column = location.column;
        }
        self
    }

    pub fn in_file(mut self, file: &str) -> Self {
        if self.file.is_empty() {
            self.file = file.to_string();
        }
        self
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MalformedExpression, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ForbiddenConstruct, message)
    }

    pub fn tree(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TreeMalformed, message)
    }
}

pub type Result<T> = std::result::Result<T, CompilerError>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SourceLocation {
    pub line: u32,
    pub column: u32,
}

// ═══════════════════════════════════════════════════════════════════════════════
// STRUCTURAL VALIDATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Whitespace-only text and comments may sit between control siblings.
pub fn is_insignificant(doc: &Document, id: NodeId) -> bool {
    match &doc.node(id).kind {
        NodeKind::Text(text) => text.trim().is_empty(),
        NodeKind::Comment(_) => true,
        _ => false,
    }
}

/// A `case` or `default` child of a `switch`, in document order.
#[derive(Debug, Clone, PartialEq)]
pub enum SwitchArm {
    Case { node: NodeId, key: String },
    Default { node: NodeId },
}

/// Checks the children of a `switch` element. `case_key` yields the comparison key of a
/// `case` (its folded value, or the raw attribute text when it is not static).
pub fn validate_switch<F>(doc: &Document, switch: NodeId, mut case_key: F) -> Result<Vec<SwitchArm>>
where
    F: FnMut(NodeId) -> Result<String>,
{
    let location = doc.node(switch).location;
    let mut arms = Vec::new();
    let mut seen = HashSet::new();
    let mut has_default = false;

    for child in doc.children(switch) {
        if is_insignificant(doc, child) {
            continue;
        }
        let child_location = doc.node(child).location;
        match doc.element_name(child) {
            Some("case") => {
                if has_default {
                    return Err(CompilerError::new(
                        ErrorKind::CaseAfterDefault,
                        "<case> must not follow <default>",
                    )
                    .at(child_location));
                }
                let key = case_key(child)?;
                if !seen.insert(key.clone()) {
                    return Err(CompilerError::new(
                        ErrorKind::DuplicateCase,
                        format!("case value {:?} appears twice", key),
                    )
                    .at(child_location));
                }
                arms.push(SwitchArm::Case { node: child, key });
            }
            Some("default") => {
                if has_default {
                    return Err(CompilerError::new(
                        ErrorKind::DuplicateDefault,
                        "<switch> has more than one <default>",
                    )
                    .at(child_location));
                }
                has_default = true;
                arms.push(SwitchArm::Default { node: child });
            }
            Some(other) => {
                return Err(CompilerError::tree(format!(
                    "<switch> may only contain <case> and <default>, found <{}>",
                    other
                ))
                .at(child_location));
            }
            None => {
                return Err(CompilerError::tree(
                    "<switch> may only contain <case> and <default> elements",
                )
                .at(child_location));
            }
        }
    }

    if arms.is_empty() {
        return Err(
            CompilerError::new(ErrorKind::EmptySwitch, "<switch> has no <case> or <default>")
                .at(location),
        );
    }
    Ok(arms)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first_switch(doc: &Document) -> NodeId {
        doc.descendants(doc.root())
            .into_iter()
            .find(|id| doc.element_name(*id) == Some("switch"))
            .unwrap()
    }

    fn raw_key(doc: &Document) -> impl FnMut(NodeId) -> Result<String> + '_ {
        move |id| Ok(doc.attr(id, "test").unwrap_or_default().to_string())
    }

    #[test]
    fn test_error_display_carries_code_and_position() {
        let err = CompilerError::new(ErrorKind::DuplicateCase, "case value \"1\" appears twice")
            .at(SourceLocation { line: 3, column: 7 })
            .in_file("page.xtl");
        let text = err.to_string();
        assert!(text.starts_with("[XTL-ERR-TAG-002]"));
        assert!(text.contains("page.xtl:3:7"));
    }

    #[test]
    fn test_position_is_not_overwritten() {
        let err = CompilerError::malformed("x")
            .at(SourceLocation { line: 2, column: 1 })
            .at(SourceLocation { line: 9, column: 9 });
        assert_eq!((err.line, err.column), (2, 1));
    }

    #[test]
    fn test_switch_arms_in_order() {
        let doc = Document::parse(
            "<switch test=\"$x\"> <case test=\"1\">a</case><!-- c --><default>b</default></switch>",
            false,
        )
        .unwrap();
        let switch = first_switch(&doc);
        let arms = validate_switch(&doc, switch, raw_key(&doc)).unwrap();
        assert_eq!(arms.len(), 2);
        assert!(matches!(&arms[0], SwitchArm::Case { key, .. } if key == "1"));
        assert!(matches!(arms[1], SwitchArm::Default { .. }));
    }

    #[test]
    fn test_switch_duplicate_case() {
        let doc = Document::parse(
            "<switch test=\"$x\"><case test=\"1\">a</case><case test=\"1\">b</case></switch>",
            false,
        )
        .unwrap();
        let err = validate_switch(&doc, first_switch(&doc), raw_key(&doc)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DuplicateCase);
    }

    #[test]
    fn test_switch_case_after_default() {
        let doc = Document::parse(
            "<switch test=\"$x\"><default>a</default><case test=\"1\">b</case></switch>",
            false,
        )
        .unwrap();
        let err = validate_switch(&doc, first_switch(&doc), raw_key(&doc)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::CaseAfterDefault);
    }

    #[test]
    fn test_switch_duplicate_default_and_empty() {
        let doc = Document::parse(
            "<switch test=\"$x\"><default>a</default><default>b</default></switch>",
            false,
        )
        .unwrap();
        let err = validate_switch(&doc, first_switch(&doc), raw_key(&doc)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DuplicateDefault);

        let doc = Document::parse("<switch test=\"$x\">  </switch>", false).unwrap();
        let err = validate_switch(&doc, first_switch(&doc), raw_key(&doc)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::EmptySwitch);
    }

    #[test]
    fn test_switch_rejects_foreign_children() {
        let doc = Document::parse("<switch test=\"$x\">text<case test=\"1\"/></switch>", false)
            .unwrap();
        let err = validate_switch(&doc, first_switch(&doc), raw_key(&doc)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::TreeMalformed);
    }
}
