//! Path queries over the document tree.
//!
//! Supported: absolute and relative paths, `//`, `.`, `..`, `*`, element names, `@name`,
//! `@*`, `node()`, `text()`, `comment()`, `|` unions, and predicates built from positions,
//! `last()`, `position()` comparisons, attribute and child tests, `not()`, `and`, `or`.
//! Results come back in document order without duplicates.

use std::collections::HashMap;

use crate::document::{Document, NodeId, NodeKind};
use crate::validate::{CompilerError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Item {
    Node(NodeId),
    Attribute { owner: NodeId, name: String },
}

impl Item {
    pub fn string_value(&self, doc: &Document) -> String {
        match self {
            Item::Node(id) => doc.text_content(*id),
            Item::Attribute { owner, name } => doc.attr(*owner, name).unwrap_or_default().to_string(),
        }
    }
}

#[derive(Debug, Clone)]
enum Axis {
    Child,
    SelfNode,
    Parent,
    Attribute,
}

#[derive(Debug, Clone)]
enum NodeTest {
    Name(String),
    AnyElement,
    AnyNode,
    Text,
    Comment,
}

#[derive(Debug, Clone, Copy)]
enum Cmp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl Cmp {
    fn holds(self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            Cmp::Eq => ordering == Equal,
            Cmp::Ne => ordering != Equal,
            Cmp::Lt => ordering == Less,
            Cmp::Gt => ordering == Greater,
            Cmp::Le => ordering != Greater,
            Cmp::Ge => ordering != Less,
        }
    }
}

#[derive(Debug, Clone)]
enum Predicate {
    Index(usize),
    Last,
    Position(Cmp, usize),
    HasAttr(String),
    AttrCmp(String, Cmp, String),
    HasChild(String),
    ChildCmp(String, Cmp, String),
    Not(Box<Predicate>),
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
}

#[derive(Debug, Clone)]
struct Step {
    axis: Axis,
    test: NodeTest,
    predicates: Vec<Predicate>,
}

#[derive(Debug, Clone)]
struct PathExpr {
    absolute: bool,
    /// `true` when the step was introduced by `//`.
    steps: Vec<(bool, Step)>,
}

/// A compiled query, reusable across contexts.
#[derive(Debug, Clone)]
pub struct Query {
    source: String,
    paths: Vec<PathExpr>,
}

impl Query {
    pub fn parse(source: &str) -> Result<Query> {
        let mut parser = QueryParser { src: source, pos: 0 };
        let paths = parser.union()?;
        parser.skip_ws();
        if parser.pos < source.len() {
            return Err(parser.error("unexpected input"));
        }
        Ok(Query {
            source: source.to_string(),
            paths,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, doc: &Document, context: NodeId) -> Vec<Item> {
        let mut items = Vec::new();
        for path in &self.paths {
            items.extend(eval_path(doc, context, path));
        }
        sort_unique(doc, items)
    }

    /// Match-pattern reading: a relative path matches anywhere in the document.
    pub fn evaluate_pattern(&self, doc: &Document) -> Vec<Item> {
        let mut items = Vec::new();
        for path in &self.paths {
            if path.absolute {
                items.extend(eval_path(doc, doc.root(), path));
                continue;
            }
            let mut anchored = path.clone();
            anchored.absolute = true;
            if let Some(first) = anchored.steps.first_mut() {
                first.0 = true;
            }
            items.extend(eval_path(doc, doc.root(), &anchored));
        }
        sort_unique(doc, items)
    }
}

pub fn select(doc: &Document, context: NodeId, query: &str) -> Result<Vec<Item>> {
    Ok(Query::parse(query)?.evaluate(doc, context))
}

// ═══════════════════════════════════════════════════════════════════════════════
// EVALUATION
// ═══════════════════════════════════════════════════════════════════════════════

fn eval_path(doc: &Document, context: NodeId, path: &PathExpr) -> Vec<Item> {
    let start = if path.absolute { doc.root() } else { context };
    let mut current = vec![Item::Node(start)];

    for (descend, step) in &path.steps {
        let mut next = Vec::new();
        for item in &current {
            let bases = match item {
                Item::Node(node) if *descend => {
                    let mut all = vec![*node];
                    all.extend(doc.descendants(*node));
                    all
                }
                Item::Node(node) => vec![*node],
                Item::Attribute { owner, .. } => {
                    if matches!(step.axis, Axis::Parent) {
                        next.push(Item::Node(*owner));
                    }
                    continue;
                }
            };
            for base in bases {
                let candidates = candidates(doc, base, step);
                next.extend(filter(doc, candidates, &step.predicates));
            }
        }
        current = sort_unique(doc, next);
    }
    current
}

fn candidates(doc: &Document, base: NodeId, step: &Step) -> Vec<Item> {
    match step.axis {
        Axis::SelfNode => vec![Item::Node(base)],
        Axis::Parent => doc.parent(base).map(Item::Node).into_iter().collect(),
        Axis::Attribute => doc
            .attributes(base)
            .into_iter()
            .filter(|(name, _)| match &step.test {
                NodeTest::Name(wanted) => wanted == name,
                _ => true,
            })
            .map(|(name, _)| Item::Attribute { owner: base, name })
            .collect(),
        Axis::Child => doc
            .children(base)
            .into_iter()
            .filter(|child| matches_test(doc, *child, &step.test))
            .map(Item::Node)
            .collect(),
    }
}

fn matches_test(doc: &Document, node: NodeId, test: &NodeTest) -> bool {
    match (test, &doc.node(node).kind) {
        (NodeTest::Name(wanted), NodeKind::Element { name, .. }) => wanted == name,
        (NodeTest::AnyElement, NodeKind::Element { .. }) => true,
        (NodeTest::AnyNode, _) => true,
        (NodeTest::Text, NodeKind::Text(_) | NodeKind::CData(_)) => true,
        (NodeTest::Comment, NodeKind::Comment(_)) => true,
        _ => false,
    }
}

fn filter(doc: &Document, mut items: Vec<Item>, predicates: &[Predicate]) -> Vec<Item> {
    for predicate in predicates {
        let size = items.len();
        items = items
            .into_iter()
            .enumerate()
            .filter(|(index, item)| test_predicate(doc, item, index + 1, size, predicate))
            .map(|(_, item)| item)
            .collect();
    }
    items
}

fn test_predicate(
    doc: &Document,
    item: &Item,
    position: usize,
    size: usize,
    predicate: &Predicate,
) -> bool {
    let node = match item {
        Item::Node(id) => Some(*id),
        Item::Attribute { .. } => None,
    };
    match predicate {
        Predicate::Index(n) => position == *n,
        Predicate::Last => position == size,
        Predicate::Position(cmp, n) => cmp.holds(position.cmp(n)),
        Predicate::HasAttr(name) => node.map(|n| doc.has_attr(n, name)).unwrap_or(false),
        Predicate::AttrCmp(name, cmp, value) => node
            .and_then(|n| doc.attr(n, name))
            .map(|actual| cmp.holds(actual.cmp(value.as_str())))
            .unwrap_or(false),
        Predicate::HasChild(name) => node
            .map(|n| {
                doc.children(n)
                    .iter()
                    .any(|c| doc.element_name(*c) == Some(name.as_str()))
            })
            .unwrap_or(false),
        Predicate::ChildCmp(name, cmp, value) => node
            .map(|n| {
                doc.children(n).iter().any(|c| {
                    doc.element_name(*c) == Some(name.as_str())
                        && cmp.holds(doc.text_content(*c).as_str().cmp(value.as_str()))
                })
            })
            .unwrap_or(false),
        Predicate::Not(inner) => !test_predicate(doc, item, position, size, inner),
        Predicate::And(a, b) => {
            test_predicate(doc, item, position, size, a)
                && test_predicate(doc, item, position, size, b)
        }
        Predicate::Or(a, b) => {
            test_predicate(doc, item, position, size, a)
                || test_predicate(doc, item, position, size, b)
        }
    }
}

fn sort_unique(doc: &Document, items: Vec<Item>) -> Vec<Item> {
    let order: HashMap<NodeId, usize> = doc.document_order();
    let key = |item: &Item| -> (usize, usize) {
        match item {
            Item::Node(id) => (order.get(id).copied().unwrap_or(usize::MAX), 0),
            Item::Attribute { owner, name } => {
                let index = doc
                    .attributes(*owner)
                    .iter()
                    .position(|(n, _)| n == name)
                    .unwrap_or(0);
                (order.get(owner).copied().unwrap_or(usize::MAX), index + 1)
            }
        }
    };
    let mut seen = std::collections::HashSet::new();
    let mut unique: Vec<Item> = items.into_iter().filter(|i| seen.insert(i.clone())).collect();
    unique.sort_by_key(|item| key(item));
    unique
}

// ═══════════════════════════════════════════════════════════════════════════════
// PARSER
// ═══════════════════════════════════════════════════════════════════════════════

struct QueryParser<'q> {
    src: &'q str,
    pos: usize,
}

impl<'q> QueryParser<'q> {
    fn rest(&self) -> &'q str {
        &self.src[self.pos..]
    }

    fn error(&self, message: &str) -> CompilerError {
        CompilerError::malformed(format!(
            "Invalid path query \"{}\" at {}: {}",
            self.src, self.pos, message
        ))
    }

    fn skip_ws(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.src.len() - trimmed.len();
    }

    fn eat(&mut self, text: &str) -> bool {
        self.skip_ws();
        if self.rest().starts_with(text) {
            self.pos += text.len();
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, word: &str) -> bool {
        self.skip_ws();
        let rest = self.rest();
        if rest.starts_with(word)
            && !rest[word.len()..]
                .chars()
                .next()
                .map(is_name_char)
                .unwrap_or(false)
        {
            self.pos += word.len();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, text: &str) -> Result<()> {
        if self.eat(text) {
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", text)))
        }
    }

    fn name(&mut self) -> Result<String> {
        self.skip_ws();
        let rest = self.rest();
        let starts = rest
            .chars()
            .next()
            .map(|c| c.is_alphabetic() || c == '_')
            .unwrap_or(false);
        if !starts {
            return Err(self.error("expected a name"));
        }
        let len = rest.find(|c: char| !is_name_char(c)).unwrap_or(rest.len());
        self.pos += len;
        Ok(rest[..len].to_string())
    }

    fn union(&mut self) -> Result<Vec<PathExpr>> {
        let mut paths = vec![self.path()?];
        while self.eat("|") {
            paths.push(self.path()?);
        }
        Ok(paths)
    }

    fn path(&mut self) -> Result<PathExpr> {
        let mut absolute = false;
        let mut descend = false;
        if self.eat("//") {
            absolute = true;
            descend = true;
        } else if self.eat("/") {
            absolute = true;
            self.skip_ws();
            if self.rest().is_empty() || self.rest().starts_with('|') {
                return Ok(PathExpr {
                    absolute,
                    steps: Vec::new(),
                });
            }
        }

        let mut steps = Vec::new();
        loop {
            steps.push((descend, self.step()?));
            if self.eat("//") {
                descend = true;
            } else if self.eat("/") {
                descend = false;
            } else {
                break;
            }
        }
        Ok(PathExpr { absolute, steps })
    }

    fn step(&mut self) -> Result<Step> {
        let (axis, test) = if self.eat("..") {
            (Axis::Parent, NodeTest::AnyNode)
        } else if self.eat(".") {
            (Axis::SelfNode, NodeTest::AnyNode)
        } else if self.eat("@") {
            if self.eat("*") {
                (Axis::Attribute, NodeTest::AnyNode)
            } else {
                (Axis::Attribute, NodeTest::Name(self.name()?))
            }
        } else if self.eat("*") {
            (Axis::Child, NodeTest::AnyElement)
        } else {
            let name = self.name()?;
            if self.eat("(") {
                self.expect(")")?;
                let test = match name.as_str() {
                    "node" => NodeTest::AnyNode,
                    "text" => NodeTest::Text,
                    "comment" => NodeTest::Comment,
                    _ => return Err(self.error(&format!("unknown node test {}()", name))),
                };
                (Axis::Child, test)
            } else {
                (Axis::Child, NodeTest::Name(name))
            }
        };

        let mut predicates = Vec::new();
        while self.eat("[") {
            predicates.push(self.or_expr()?);
            self.expect("]")?;
        }
        Ok(Step {
            axis,
            test,
            predicates,
        })
    }

    fn or_expr(&mut self) -> Result<Predicate> {
        let mut left = self.and_expr()?;
        while self.eat_keyword("or") {
            let right = self.and_expr()?;
            left = Predicate::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Predicate> {
        let mut left = self.unary()?;
        while self.eat_keyword("and") {
            let right = self.unary()?;
            left = Predicate::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Predicate> {
        if self.eat_keyword("not") {
            self.expect("(")?;
            let inner = self.or_expr()?;
            self.expect(")")?;
            return Ok(Predicate::Not(Box::new(inner)));
        }
        if self.eat("(") {
            let inner = self.or_expr()?;
            self.expect(")")?;
            return Ok(inner);
        }
        if self.eat("last()") {
            return Ok(Predicate::Last);
        }
        if self.eat("position()") {
            let cmp = self.cmp()?.ok_or_else(|| self.error("expected a comparison"))?;
            let n = self.number()?;
            return Ok(Predicate::Position(cmp, n));
        }
        self.skip_ws();
        if self.rest().starts_with(|c: char| c.is_ascii_digit()) {
            return Ok(Predicate::Index(self.number()?));
        }
        if self.eat("@") {
            let name = self.name()?;
            return Ok(match self.cmp()? {
                Some(cmp) => Predicate::AttrCmp(name, cmp, self.string()?),
                None => Predicate::HasAttr(name),
            });
        }
        let name = self.name()?;
        Ok(match self.cmp()? {
            Some(cmp) => Predicate::ChildCmp(name, cmp, self.string()?),
            None => Predicate::HasChild(name),
        })
    }

    fn cmp(&mut self) -> Result<Option<Cmp>> {
        for (text, cmp) in [
            ("!=", Cmp::Ne),
            ("<=", Cmp::Le),
            (">=", Cmp::Ge),
            ("=", Cmp::Eq),
            ("<", Cmp::Lt),
            (">", Cmp::Gt),
        ] {
            if self.eat(text) {
                return Ok(Some(cmp));
            }
        }
        Ok(None)
    }

    fn number(&mut self) -> Result<usize> {
        self.skip_ws();
        let rest = self.rest();
        let len = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        let n = rest[..len]
            .parse::<usize>()
            .map_err(|_| self.error("expected a number"))?;
        self.pos += len;
        Ok(n)
    }

    fn string(&mut self) -> Result<String> {
        self.skip_ws();
        let rest = self.rest();
        let Some(quote) = rest.chars().next().filter(|c| *c == '\'' || *c == '"') else {
            return Err(self.error("expected a quoted string"));
        };
        let Some(end) = rest[1..].find(quote) else {
            return Err(self.error("unterminated string"));
        };
        let value = rest[1..1 + end].to_string();
        self.pos += end + 2;
        Ok(value)
    }
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | ':' | '.')
}
