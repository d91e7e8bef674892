//! # Match-Template Transformer
//!
//! Rewrites the document before code generation. Any element carrying `match="<query>"`
//! is a rule: its other attributes declare parameters (with defaults) and its children
//! are the body that replaces every node the query selects.
//!
//! ## Ordering Invariants
//!
//! 1. **Rules leave the tree first**: every rule element is detached while rules are
//!    extracted, so no query can ever select a rule body.
//! 2. **Last declared runs first**: later rules see the tree as rewritten by none of the
//!    earlier ones, earlier rules see the output of later ones.
//! 3. **Deepest match first**: matches are instantiated by descending depth, then document
//!    order. An outer match is rewritten only after everything nested in it, so every
//!    match is still attached when its turn comes.

use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use tracing::trace;

use crate::document::{Document, NodeId, NodeKind};
use crate::static_eval::{
    analyze_tokens, template_string, PseudoFunctions, PseudoHandler, Substitution,
};
use crate::tokenize::{render_tokens, split_interpolations, tokenize, Segment, Token, TokenKind};
use crate::validate::{CompilerError, ErrorKind, Result};
use crate::xpath::{self, Item, Query};

pub const MATCH_ATTRIBUTE: &str = "match";

/// Elements whose text is never interpolated.
pub const RAW_TEXT_ELEMENTS: [&str; 2] = ["script", "style"];

/// Link resolution collaborator, used by `route()` and by the link attribute table.
pub trait LinkResolver: Send + Sync {
    fn resolve_link(&self, target: &str) -> String;
}

#[derive(Debug, Clone)]
pub struct MatchRule {
    pub node: NodeId,
    pub query: Query,
    pub params: Vec<(String, String)>,
}

pub struct Transformer<'l> {
    links: Option<&'l dyn LinkResolver>,
}

enum Outcome {
    /// Template text, with `$` and `{` escaped.
    Static(String),
    Nodes(Vec<NodeId>),
    /// `{expr}` kept for the compiler.
    Residual(String),
}

enum Fragment {
    Text(String),
    Nodes(Vec<NodeId>),
}

impl<'l> Transformer<'l> {
    pub fn new(links: Option<&'l dyn LinkResolver>) -> Self {
        Transformer { links }
    }

    /// Detaches every rule element and returns the rules in document order.
    pub fn extract_rules(&self, doc: &mut Document) -> Result<Vec<MatchRule>> {
        let mut rules = Vec::new();
        for id in doc.descendants(doc.root()) {
            let Some(query) = doc.attr(id, MATCH_ATTRIBUTE).map(str::to_string) else {
                continue;
            };
            let location = doc.node(id).location;
            let query = Query::parse(&query).map_err(|e| e.at(location))?;
            let params = doc
                .attributes(id)
                .into_iter()
                .filter(|(name, _)| name != MATCH_ATTRIBUTE)
                .collect();
            doc.detach(id);
            rules.push(MatchRule {
                node: id,
                query,
                params,
            });
        }
        Ok(rules)
    }

    /// Applies all rules and returns the number of instantiations.
    pub fn apply(&self, doc: &mut Document) -> Result<usize> {
        let rules = self.extract_rules(doc)?;
        let mut rewrites = 0;

        for rule in rules.iter().rev() {
            let order = doc.document_order();
            let root = doc.root();
            let mut targets: Vec<NodeId> = rule
                .query
                .evaluate_pattern(doc)
                .into_iter()
                .filter_map(|item| match item {
                    Item::Node(id) if id != root => Some(id),
                    _ => None,
                })
                .collect();

            if targets.is_empty() {
                trace!(query = rule.query.source(), "match template selects nothing");
                continue;
            }
            trace!(
                query = rule.query.source(),
                matches = targets.len(),
                "applying match template"
            );

            let position = |id: &NodeId| order.get(id).copied().unwrap_or(usize::MAX);
            targets.sort_by(|a, b| {
                doc.depth(*b)
                    .cmp(&doc.depth(*a))
                    .then_with(|| position(a).cmp(&position(b)))
            });

            for target in targets {
                if !doc.is_attached(target) {
                    continue;
                }
                let location = doc.node(target).location;
                self.instantiate(doc, rule, target)
                    .map_err(|e| e.at(location))?;
                rewrites += 1;
            }
        }
        Ok(rewrites)
    }

    fn instantiate(&self, doc: &mut Document, rule: &MatchRule, target: NodeId) -> Result<()> {
        let params: HashMap<String, String> = rule
            .params
            .iter()
            .map(|(name, default)| {
                let value = doc.attr(target, name).unwrap_or(default).to_string();
                (name.clone(), value)
            })
            .collect();

        let body = doc.deep_clone(rule.node);

        for id in doc.descendants(body) {
            match doc.node(id).kind.clone() {
                NodeKind::Element { attributes, .. } => {
                    for (name, value) in attributes {
                        let expanded = self.expand_attribute(doc, &value, target, &params)?;
                        if let Some(expanded) = expanded {
                            doc.set_attr(id, &name, &expanded);
                        }
                    }
                }
                NodeKind::Text(text) => {
                    let raw = doc
                        .parent(id)
                        .and_then(|p| doc.element_name(p))
                        .map(|name| RAW_TEXT_ELEMENTS.contains(&name))
                        .unwrap_or(false);
                    if !raw {
                        self.expand_text(doc, id, &text, target, &params)?;
                    }
                }
                _ => {}
            }
        }

        // forward caller attributes that are not parameters
        let first_element = doc.children(body).into_iter().find(|c| doc.is_element(*c));
        if let Some(first) = first_element {
            for (name, value) in doc.attributes(target) {
                if !params.contains_key(&name) && !doc.has_attr(first, &name) {
                    doc.set_attr(first, &name, &value);
                }
            }
        }

        doc.replace_with_children(target, body);
        Ok(())
    }

    fn expand_attribute(
        &self,
        doc: &Document,
        value: &str,
        target: NodeId,
        params: &HashMap<String, String>,
    ) -> Result<Option<String>> {
        let segments = split_interpolations(value)?;
        if !segments.iter().any(Segment::is_expr) {
            return Ok(None);
        }
        let mut out = String::new();
        for segment in segments {
            match segment {
                Segment::Literal(text) => out.push_str(&escape_template(&text)),
                Segment::Expr(source) => match self.evaluate(doc, &source, target, params)? {
                    Outcome::Static(text) | Outcome::Residual(text) => out.push_str(&text),
                    Outcome::Nodes(_) => {
                        return Err(CompilerError::new(
                            ErrorKind::SelectionTypeMismatch,
                            format!("select() in attribute value \"{}\" yields nodes", value),
                        ));
                    }
                },
            }
        }
        Ok(Some(out))
    }

    fn expand_text(
        &self,
        doc: &mut Document,
        id: NodeId,
        text: &str,
        target: NodeId,
        params: &HashMap<String, String>,
    ) -> Result<()> {
        let segments = split_interpolations(text)?;
        if !segments.iter().any(Segment::is_expr) {
            return Ok(());
        }

        let mut fragments: Vec<Fragment> = Vec::new();
        for segment in segments {
            let piece = match segment {
                Segment::Literal(text) => Fragment::Text(escape_template(&text)),
                Segment::Expr(source) => match self.evaluate(doc, &source, target, params)? {
                    Outcome::Static(text) | Outcome::Residual(text) => Fragment::Text(text),
                    Outcome::Nodes(nodes) => Fragment::Nodes(nodes),
                },
            };
            match (fragments.last_mut(), piece) {
                (Some(Fragment::Text(previous)), Fragment::Text(next)) => previous.push_str(&next),
                (_, piece) => fragments.push(piece),
            }
        }

        if let [Fragment::Text(only)] = fragments.as_slice() {
            doc.node_mut(id).kind = NodeKind::Text(only.clone());
            return Ok(());
        }

        let location = doc.node(id).location;
        let mut replacements = Vec::new();
        for fragment in fragments {
            match fragment {
                Fragment::Text(text) if text.is_empty() => {}
                Fragment::Text(text) => replacements.push(doc.create_text(&text, location)),
                Fragment::Nodes(nodes) => {
                    for node in nodes {
                        replacements.push(doc.deep_clone(node));
                    }
                }
            }
        }
        doc.replace_with(id, &replacements);
        Ok(())
    }

    /// Runs one expression of a rule body against the matched node.
    fn evaluate(
        &self,
        doc: &Document,
        source: &str,
        target: NodeId,
        params: &HashMap<String, String>,
    ) -> Result<Outcome> {
        let tokens = substitute_params(&tokenize(source)?, params);
        let selections: RefCell<Vec<Vec<NodeId>>> = RefCell::new(Vec::new());

        let analysis = {
            let mut pseudo: PseudoFunctions<'_> = HashMap::new();
            let select: PseudoHandler<'_> = Box::new(|args: &[Value]| {
                let query = args.first().map(template_string).ok_or_else(|| {
                    CompilerError::malformed("select() expects a query argument")
                })?;
                let items = xpath::select(doc, target, &query)?;
                let attributes_only =
                    !items.is_empty() && items.iter().all(|i| matches!(i, Item::Attribute { .. }));
                if attributes_only {
                    return Ok(Value::String(items[0].string_value(doc)));
                }
                let nodes = items
                    .into_iter()
                    .filter_map(|item| match item {
                        Item::Node(id) => Some(id),
                        Item::Attribute { .. } => None,
                    })
                    .collect();
                let mut selections = selections.borrow_mut();
                selections.push(nodes);
                Ok(Value::String(selection_marker(selections.len() - 1)))
            });
            pseudo.insert("select".to_string(), Some(select));

            if let Some(links) = self.links {
                let route: PseudoHandler<'_> = Box::new(move |args: &[Value]| {
                    let target = args.first().map(template_string).ok_or_else(|| {
                        CompilerError::malformed("route() expects a target argument")
                    })?;
                    Ok(Value::String(links.resolve_link(&target)))
                });
                pseudo.insert("route".to_string(), Some(route));
            }

            let mut keep_dynamic =
                |name: &str, _: bool| -> Result<Substitution> { Ok(Substitution::Code(format!("${}", name))) };
            analyze_tokens(&tokens, Some(&mut keep_dynamic), &pseudo)?
        };

        let selections = selections.into_inner();
        if let Some(Value::String(text)) = &analysis.value {
            if let Some(index) = (0..selections.len()).find(|i| *text == selection_marker(*i)) {
                return Ok(Outcome::Nodes(selections[index].clone()));
            }
        }
        if !selections.is_empty() {
            return Err(CompilerError::new(
                ErrorKind::SelectionTypeMismatch,
                format!("select() in \"{}\" is combined with other values", source),
            ));
        }

        Ok(match &analysis.value {
            Some(value) => Outcome::Static(escape_template(&template_string(value))),
            None => Outcome::Residual(format!("{{{}}}", render_tokens(&tokens))),
        })
    }
}

fn selection_marker(index: usize) -> String {
    format!("\u{1}select:{}\u{1}", index)
}

/// Escapes text so the compiler reads it back literally.
fn escape_template(text: &str) -> String {
    text.replace('$', "\\$").replace('{', "\\{")
}

/// Replaces `$param` by the parameter value as a string literal, including inside
/// double-quoted strings.
fn substitute_params(tokens: &[Token], params: &HashMap<String, String>) -> Vec<Token> {
    tokens
        .iter()
        .map(|token| match token.kind {
            TokenKind::Variable => match params.get(&token.text[1..]) {
                Some(value) => Token::new(TokenKind::Str, single_quoted(value), token.offset),
                None => token.clone(),
            },
            TokenKind::Str if token.text.starts_with('"') => Token::new(
                TokenKind::Str,
                substitute_in_string(&token.text, params),
                token.offset,
            ),
            _ => token.clone(),
        })
        .collect()
}

fn single_quoted(value: &str) -> String {
    let mut out = String::from("'");
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}

fn substitute_in_string(literal: &str, params: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(literal.len());
    let mut chars = literal.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == '\\' {
            out.push(c);
            if let Some((_, escaped)) = chars.next() {
                out.push(escaped);
            }
            continue;
        }
        if c == '$' {
            let name: String = literal[i + 1..]
                .chars()
                .take_while(|n| n.is_ascii_alphanumeric() || *n == '_')
                .collect();
            if let Some(value) = params.get(&name) {
                for _ in 0..name.len() {
                    chars.next();
                }
                for v in value.chars() {
                    match v {
                        '\\' | '"' | '$' => {
                            out.push('\\');
                            out.push(v);
                        }
                        '\n' => out.push_str("\\n"),
                        _ => out.push(v),
                    }
                }
                continue;
            }
        }
        out.push(c);
    }
    out
}
