//! # Template Document Tree
//!
//! Templates are parsed into an arena of nodes addressed by stable [`NodeId`]s.
//!
//! ## Key Invariants
//!
//! 1. **Stable Ids**: A `NodeId` is never reused or freed while the document lives.
//!    Detaching only unlinks a node from its parent, so ids held across a rewrite stay valid.
//! 2. **Snapshot Traversal**: [`Document::children`] returns an owned vector. Callers that
//!    mutate the tree iterate over the snapshot, never over the live child list.
//! 3. **Decoded Storage**: Text and attribute values are stored decoded (entities resolved).
//!    Escaping happens only in [`Document::to_xml`] and during code emission.

use quick_xml::escape::resolve_xml_entity;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::borrow::Cow;
use std::collections::HashMap;

use crate::validate::{CompilerError, Result, SourceLocation};

pub type NodeId = usize;

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Document,
    Element {
        name: String,
        attributes: Vec<(String, String)>,
    },
    Text(String),
    Comment(String),
    ProcessingInstruction {
        target: String,
        data: String,
    },
    CData(String),
    Doctype(String),
}

#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub location: SourceLocation,
}

#[derive(Debug, Clone)]
pub struct Document {
    nodes: Vec<Node>,
    root: NodeId,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    pub fn new() -> Self {
        Document {
            nodes: vec![Node {
                kind: NodeKind::Document,
                parent: None,
                children: Vec::new(),
                location: SourceLocation { line: 1, column: 1 },
            }],
            root: 0,
        }
    }

    /// Parse a template fragment. Several top-level nodes are allowed; the markup itself
    /// must be well formed.
    pub fn parse(source: &str, strip_blank_text: bool) -> Result<Document> {
        let mut doc = Document::new();
        let lines = LineIndex::new(source);
        let mut reader = Reader::from_str(source);
        reader.config_mut().trim_text(false);

        let mut stack: Vec<NodeId> = vec![doc.root];

        loop {
            let offset = reader.buffer_position() as usize;
            let location = lines.locate(offset);
            let parent = *stack.last().unwrap_or(&doc.root);

            let event = reader.read_event().map_err(|e| {
                CompilerError::tree(format!("Failed to parse template: {}", e)).at(location)
            })?;

            match event {
                Event::Start(ref e) | Event::Empty(ref e) => {
                    let is_empty = matches!(event, Event::Empty(_));
                    let (name, attributes) = read_element(e).map_err(|e| e.at(location))?;
                    let id = doc.create(NodeKind::Element { name, attributes }, location);
                    doc.append_child(parent, id);
                    if !is_empty {
                        stack.push(id);
                    }
                }
                Event::End(_) => {
                    if stack.len() <= 1 {
                        return Err(CompilerError::tree("Unbalanced closing tag").at(location));
                    }
                    stack.pop();
                }
                Event::Text(e) => {
                    let text = e.decode().map_err(|e| {
                        CompilerError::tree(format!("Invalid text: {}", e)).at(location)
                    })?;
                    doc.push_text(parent, &text, location);
                }
                Event::GeneralRef(e) => {
                    let raw = e.decode().map_err(|e| {
                        CompilerError::tree(format!("Invalid entity: {}", e)).at(location)
                    })?;
                    let resolved = resolve_entity(&raw).map_err(|e| e.at(location))?;
                    doc.push_text(parent, &resolved, location);
                }
                Event::CData(e) => {
                    let text = std::str::from_utf8(e.as_ref()).map_err(|e| {
                        CompilerError::tree(format!("Invalid UTF-8 in CDATA: {}", e)).at(location)
                    })?;
                    let id = doc.create(NodeKind::CData(text.to_string()), location);
                    doc.append_child(parent, id);
                }
                Event::Comment(e) => {
                    let text = std::str::from_utf8(e.as_ref()).map_err(|e| {
                        CompilerError::tree(format!("Invalid UTF-8 in comment: {}", e))
                            .at(location)
                    })?;
                    let id = doc.create(NodeKind::Comment(text.to_string()), location);
                    doc.append_child(parent, id);
                }
                Event::PI(e) => {
                    let content = std::str::from_utf8(e.as_ref()).map_err(|e| {
                        CompilerError::tree(format!("Invalid UTF-8 in instruction: {}", e))
                            .at(location)
                    })?;
                    let (target, data) = content
                        .split_once(char::is_whitespace)
                        .unwrap_or((content, ""));
                    let id = doc.create(
                        NodeKind::ProcessingInstruction {
                            target: target.to_string(),
                            data: data.trim().to_string(),
                        },
                        location,
                    );
                    doc.append_child(parent, id);
                }
                Event::DocType(e) => {
                    let text = std::str::from_utf8(e.as_ref()).map_err(|e| {
                        CompilerError::tree(format!("Invalid UTF-8 in doctype: {}", e))
                            .at(location)
                    })?;
                    let id = doc.create(NodeKind::Doctype(text.trim().to_string()), location);
                    doc.append_child(parent, id);
                }
                Event::Decl(_) => {
                    // XML declaration carries nothing the compiler needs
                }
                Event::Eof => break,
            }
        }

        if stack.len() > 1 {
            let open = stack[stack.len() - 1];
            let name = doc.element_name(open).unwrap_or_default().to_string();
            return Err(
                CompilerError::tree(format!("Element <{}> is never closed", name))
                    .at(doc.node(open).location),
            );
        }

        if strip_blank_text {
            for id in doc.descendants(doc.root) {
                if matches!(&doc.node(id).kind, NodeKind::Text(t) if t.trim().is_empty()) {
                    doc.detach(id);
                }
            }
        }

        Ok(doc)
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    pub fn create(&mut self, kind: NodeKind, location: SourceLocation) -> NodeId {
        self.nodes.push(Node {
            kind,
            parent: None,
            children: Vec::new(),
            location,
        });
        self.nodes.len() - 1
    }

    pub fn create_element(&mut self, name: &str, location: SourceLocation) -> NodeId {
        self.create(
            NodeKind::Element {
                name: name.to_string(),
                attributes: Vec::new(),
            },
            location,
        )
    }

    pub fn create_text(&mut self, text: &str, location: SourceLocation) -> NodeId {
        self.create(NodeKind::Text(text.to_string()), location)
    }

    /// Owned snapshot of the current children.
    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes[id].children.clone()
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].parent
    }

    pub fn element_name(&self, id: NodeId) -> Option<&str> {
        match &self.nodes[id].kind {
            NodeKind::Element { name, .. } => Some(name.as_str()),
            _ => None,
        }
    }

    pub fn is_element(&self, id: NodeId) -> bool {
        matches!(self.nodes[id].kind, NodeKind::Element { .. })
    }

    pub fn attributes(&self, id: NodeId) -> Vec<(String, String)> {
        match &self.nodes[id].kind {
            NodeKind::Element { attributes, .. } => attributes.clone(),
            _ => Vec::new(),
        }
    }

    pub fn attr(&self, id: NodeId, name: &str) -> Option<&str> {
        match &self.nodes[id].kind {
            NodeKind::Element { attributes, .. } => attributes
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.as_str()),
            _ => None,
        }
    }

    pub fn has_attr(&self, id: NodeId, name: &str) -> bool {
        self.attr(id, name).is_some()
    }

    pub fn set_attr(&mut self, id: NodeId, name: &str, value: &str) {
        if let NodeKind::Element { attributes, .. } = &mut self.nodes[id].kind {
            if let Some(slot) = attributes.iter_mut().find(|(key, _)| key == name) {
                slot.1 = value.to_string();
            } else {
                attributes.push((name.to_string(), value.to_string()));
            }
        }
    }

    pub fn remove_attr(&mut self, id: NodeId, name: &str) -> Option<String> {
        if let NodeKind::Element { attributes, .. } = &mut self.nodes[id].kind {
            if let Some(index) = attributes.iter().position(|(key, _)| key == name) {
                return Some(attributes.remove(index).1);
            }
        }
        None
    }

    /// Unlink a node from its parent. The node and its subtree stay addressable.
    pub fn detach(&mut self, id: NodeId) {
        if let Some(parent) = self.nodes[id].parent.take() {
            self.nodes[parent].children.retain(|child| *child != id);
        }
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
        self.detach(child);
        self.nodes[child].parent = Some(parent);
        self.nodes[parent].children.push(child);
    }

    pub fn insert_child(&mut self, parent: NodeId, index: usize, child: NodeId) {
        self.detach(child);
        self.nodes[child].parent = Some(parent);
        let index = index.min(self.nodes[parent].children.len());
        self.nodes[parent].children.insert(index, child);
    }

    /// Put `replacements` where `target` sits and detach `target`.
    pub fn replace_with(&mut self, target: NodeId, replacements: &[NodeId]) {
        let Some(parent) = self.nodes[target].parent else {
            return;
        };
        let Some(index) = self.nodes[parent].children.iter().position(|c| *c == target) else {
            return;
        };
        self.detach(target);
        for (offset, node) in replacements.iter().enumerate() {
            self.insert_child(parent, index + offset, *node);
        }
    }

    /// Replace `target` by the children of `container`.
    pub fn replace_with_children(&mut self, target: NodeId, container: NodeId) {
        let children = self.children(container);
        self.replace_with(target, &children);
    }

    /// Copy a subtree into fresh arena slots. The copy has no parent.
    pub fn deep_clone(&mut self, id: NodeId) -> NodeId {
        let kind = self.nodes[id].kind.clone();
        let location = self.nodes[id].location;
        let copy = self.create(kind, location);
        for child in self.children(id) {
            let child_copy = self.deep_clone(child);
            self.append_child(copy, child_copy);
        }
        copy
    }

    pub fn is_attached(&self, id: NodeId) -> bool {
        let mut current = id;
        loop {
            if current == self.root {
                return true;
            }
            match self.nodes[current].parent {
                Some(parent) => current = parent,
                None => return false,
            }
        }
    }

    pub fn depth(&self, id: NodeId) -> usize {
        let mut depth = 0;
        let mut current = self.nodes[id].parent;
        while let Some(parent) = current {
            depth += 1;
            current = self.nodes[parent].parent;
        }
        depth
    }

    /// Pre-order descendants of `id`, excluding `id` itself.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.nodes[id].children.iter().rev().copied().collect();
        while let Some(next) = stack.pop() {
            out.push(next);
            stack.extend(self.nodes[next].children.iter().rev().copied());
        }
        out
    }

    /// Position of every attached node in document order.
    pub fn document_order(&self) -> HashMap<NodeId, usize> {
        let mut order = HashMap::new();
        order.insert(self.root, 0);
        for (index, id) in self.descendants(self.root).into_iter().enumerate() {
            order.insert(id, index + 1);
        }
        order
    }

    pub fn text_content(&self, id: NodeId) -> String {
        match &self.nodes[id].kind {
            NodeKind::Text(text) | NodeKind::CData(text) => text.clone(),
            NodeKind::Element { .. } | NodeKind::Document => self
                .descendants(id)
                .into_iter()
                .filter_map(|child| match &self.nodes[child].kind {
                    NodeKind::Text(text) | NodeKind::CData(text) => Some(text.as_str()),
                    _ => None,
                })
                .collect(),
            _ => String::new(),
        }
    }

    fn push_text(&mut self, parent: NodeId, text: &str, location: SourceLocation) {
        if let Some(last) = self.nodes[parent].children.last().copied() {
            if let NodeKind::Text(existing) = &mut self.nodes[last].kind {
                existing.push_str(text);
                return;
            }
        }
        let id = self.create_text(text, location);
        self.append_child(parent, id);
    }

    /// Outer markup of a node (the children only, for the document node).
    pub fn to_xml(&self, id: NodeId) -> String {
        let mut out = String::new();
        self.write_xml(id, &mut out);
        out
    }

    pub fn inner_xml(&self, id: NodeId) -> String {
        let mut out = String::new();
        for child in &self.nodes[id].children {
            self.write_xml(*child, &mut out);
        }
        out
    }

    fn write_xml(&self, id: NodeId, out: &mut String) {
        match &self.nodes[id].kind {
            NodeKind::Document => {
                for child in &self.nodes[id].children {
                    self.write_xml(*child, out);
                }
            }
            NodeKind::Element { name, attributes } => {
                out.push('<');
                out.push_str(name);
                for (key, value) in attributes {
                    out.push(' ');
                    out.push_str(key);
                    out.push_str("=\"");
                    out.push_str(&escape_attr(value));
                    out.push('"');
                }
                if self.nodes[id].children.is_empty() {
                    out.push_str("/>");
                } else {
                    out.push('>');
                    for child in &self.nodes[id].children {
                        self.write_xml(*child, out);
                    }
                    out.push_str("</");
                    out.push_str(name);
                    out.push('>');
                }
            }
            NodeKind::Text(text) => out.push_str(&escape_text(text)),
            NodeKind::Comment(text) => {
                out.push_str("<!--");
                out.push_str(text);
                out.push_str("-->");
            }
            NodeKind::ProcessingInstruction { target, data } => {
                out.push_str("<?");
                out.push_str(target);
                if !data.is_empty() {
                    out.push(' ');
                    out.push_str(data);
                }
                out.push_str("?>");
            }
            NodeKind::CData(text) => {
                out.push_str("<![CDATA[");
                out.push_str(text);
                out.push_str("]]>");
            }
            NodeKind::Doctype(text) => {
                out.push_str("<!DOCTYPE ");
                out.push_str(text);
                out.push('>');
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PARSING HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

fn read_element(e: &BytesStart<'_>) -> Result<(String, Vec<(String, String)>)> {
    let name = std::str::from_utf8(e.name().as_ref())
        .map_err(|e| CompilerError::tree(format!("Invalid UTF-8 in tag name: {}", e)))?
        .to_string();

    let mut attributes = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| CompilerError::tree(format!("Invalid attribute: {}", e)))?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(|e| CompilerError::tree(format!("Invalid UTF-8 in attribute: {}", e)))?
            .to_string();
        let value = attr
            .unescape_value()
            .map_err(|e| CompilerError::tree(format!("Invalid attribute value: {}", e)))?;
        attributes.push((key, value.into_owned()));
    }
    Ok((name, attributes))
}

/// XML predefined entities, numeric references and the handful of HTML entities
/// templates commonly carry.
fn resolve_entity(raw: &str) -> Result<String> {
    if let Some(resolved) = resolve_xml_entity(raw) {
        return Ok(resolved.into());
    }

    if let Some(rest) = raw.strip_prefix('#') {
        let code = if let Some(hex) = rest.strip_prefix('x').or_else(|| rest.strip_prefix('X')) {
            u32::from_str_radix(hex, 16)
                .map_err(|_| CompilerError::tree(format!("Invalid hex entity: #{}", rest)))?
        } else {
            rest.parse::<u32>()
                .map_err(|_| CompilerError::tree(format!("Invalid decimal entity: #{}", rest)))?
        };
        let ch = char::from_u32(code)
            .ok_or_else(|| CompilerError::tree(format!("Invalid Unicode: {}", code)))?;
        return Ok(ch.to_string());
    }

    let html = match raw {
        "nbsp" => '\u{a0}',
        "copy" => '©',
        "reg" => '®',
        "trade" => '™',
        "hellip" => '…',
        "mdash" => '—',
        "ndash" => '–',
        "laquo" => '«',
        "raquo" => '»',
        "euro" => '€',
        "middot" => '·',
        _ => {
            return Err(CompilerError::tree(format!("Undefined entity &{};", raw)));
        }
    };
    Ok(html.to_string())
}

struct LineIndex {
    starts: Vec<usize>,
}

impl LineIndex {
    fn new(source: &str) -> Self {
        let mut starts = vec![0];
        for (index, byte) in source.bytes().enumerate() {
            if byte == b'\n' {
                starts.push(index + 1);
            }
        }
        LineIndex { starts }
    }

    fn locate(&self, offset: usize) -> SourceLocation {
        let line = match self.starts.binary_search(&offset) {
            Ok(exact) => exact,
            Err(next) => next - 1,
        };
        SourceLocation {
            line: (line + 1) as u32,
            column: (offset - self.starts[line] + 1) as u32,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ESCAPING
// ═══════════════════════════════════════════════════════════════════════════════

/// Escapes `&` `<` `>`.
pub fn escape_text(text: &str) -> Cow<'_, str> {
    escape(text, false)
}

/// Escapes `&` `<` `>` `"`.
pub fn escape_attr(text: &str) -> Cow<'_, str> {
    escape(text, true)
}

fn escape(text: &str, quotes: bool) -> Cow<'_, str> {
    let needs = text
        .chars()
        .any(|c| matches!(c, '&' | '<' | '>') || (quotes && c == '"'));
    if !needs {
        return Cow::Borrowed(text);
    }
    let mut out = String::with_capacity(text.len() + 8);
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' if quotes => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    Cow::Owned(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_with_children_keeps_order() {
        let mut doc = Document::parse("<a><b/><c/><d/></a>", false).unwrap();
        let a = doc.children(doc.root())[0];
        let c = doc.children(a)[1];

        let container = doc.create(NodeKind::Document, SourceLocation::default());
        let x = doc.create_element("x", SourceLocation::default());
        let y = doc.create_element("y", SourceLocation::default());
        doc.append_child(container, x);
        doc.append_child(container, y);

        doc.replace_with_children(c, container);
        assert_eq!(doc.to_xml(doc.root()), "<a><b/><x/><y/><d/></a>");
        assert!(!doc.is_attached(c));
        assert_eq!(doc.element_name(c), Some("c"));
    }

    #[test]
    fn test_deep_clone_is_detached() {
        let mut doc = Document::parse("<a k=\"v\"><b>t</b></a>", false).unwrap();
        let a = doc.children(doc.root())[0];
        let copy = doc.deep_clone(a);
        assert!(!doc.is_attached(copy));
        assert_eq!(doc.to_xml(copy), "<a k=\"v\"><b>t</b></a>");
        doc.set_attr(copy, "k", "w");
        assert_eq!(doc.attr(a, "k"), Some("v"));
    }

    #[test]
    fn test_depth_and_order() {
        let doc = Document::parse("<p><i><p/></i></p><q/>", false).unwrap();
        let order = doc.document_order();
        let outer = doc.children(doc.root())[0];
        let inner = doc.children(doc.children(outer)[0])[0];
        let q = doc.children(doc.root())[1];
        assert_eq!(doc.depth(outer), 1);
        assert_eq!(doc.depth(inner), 3);
        assert!(order[&outer] < order[&inner]);
        assert!(order[&inner] < order[&q]);
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape_text("a < b & \"c\""), "a &lt; b &amp; \"c\"");
        assert_eq!(escape_attr("\"q\""), "&quot;q&quot;");
        assert!(matches!(escape_text("plain"), Cow::Borrowed(_)));
    }
}
