//! # Tree Compiler
//!
//! Walks the transformed document and emits the body of the compiled unit. Literal markup
//! becomes `$rt.write(...)` calls, expressions go through the analyzer, and the control
//! tags (`if`, `switch`, `loop`, `opt`, `fill`, `slot`, `def`, `tag`) dispatch to their
//! handlers.
//!
//! ## Key Invariants
//!
//! 1. **Block Scoping**: every handler that declares a temporary wraps its output in a
//!    `{ ... }` block, so a freed temporary can be declared again by a later sibling.
//! 2. **Fold Before Emit**: a statically known condition, switch subject or tag name never
//!    reaches the output; only the branch it selects does.
//! 3. **Fresh State**: [`CompilerState`] is saved and restored around every compiled unit,
//!    so nested or sequential compilations never share opt/fill stacks or loop depth.
//! 4. **Checked Residue**: every non-static expression is parsed back with oxc before it
//!    is emitted and may only reference generated names and `$rt`.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;

use crate::document::{escape_attr, escape_text, Document, NodeId, NodeKind};
use crate::options::CompileOptions;
use crate::scope::{DataSource, Environment};
use crate::static_eval::{
    self, render_literal, template_string, template_truthy, to_number, Analysis,
    PseudoFunctions, Substitution, VariableResolver,
};
use crate::tokenize::{split_interpolations, Segment};
use crate::transform::{LinkResolver, Transformer, RAW_TEXT_ELEMENTS};
use crate::validate::{
    is_insignificant, validate_switch, CompilerError, ErrorKind, Result, SourceLocation,
    SwitchArm,
};

/// Elements written as `<name/>` when they have no children.
pub const VOID_ELEMENTS: [&str; 13] = [
    "br", "hr", "img", "input", "meta", "link", "area", "base", "col", "embed", "source",
    "track", "wbr",
];

/// `(element, attribute)` pairs routed through link resolution.
pub const LINK_ATTRIBUTES: [(&str, &str); 7] = [
    ("a", "href"),
    ("area", "href"),
    ("link", "href"),
    ("img", "src"),
    ("script", "src"),
    ("iframe", "src"),
    ("form", "action"),
];

lazy_static! {
    static ref LOCAL_NAME: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
    static ref ELEMENT_NAME: Regex = Regex::new(r"^[A-Za-z][A-Za-z0-9:_.-]*$").unwrap();
}

// ═══════════════════════════════════════════════════════════════════════════════
// OUTPUT TYPES
// ═══════════════════════════════════════════════════════════════════════════════

/// Output of one compiled unit: the binding declarations and the statement body.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledBody {
    pub bindings: String,
    pub body: String,
}

/// Statement buffer. Consecutive literal writes are coalesced into one `$rt.write`.
#[derive(Debug, Default)]
pub struct Emitter {
    code: String,
    pending: String,
}

impl Emitter {
    pub fn write(&mut self, text: &str) {
        self.pending.push_str(text);
    }

    pub fn code(&mut self, statement: impl AsRef<str>) {
        self.flush();
        self.code.push_str(statement.as_ref());
        self.code.push('\n');
    }

    pub fn append(&mut self, other: Emitter) {
        if other.code.is_empty() {
            self.pending.push_str(&other.pending);
            return;
        }
        self.flush();
        self.code.push_str(&other.code);
        self.pending = other.pending;
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty() && self.pending.is_empty()
    }

    pub fn finish(mut self) -> String {
        self.flush();
        self.code
    }

    fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let text = std::mem::take(&mut self.pending);
        self.code
            .push_str(&format!("$rt.write({});\n", render_literal(&Value::String(text))));
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// COMPILER STATE
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
struct OptFrame {
    temp: String,
    /// Expressions seen in the body, static or not.
    expressions: usize,
    /// Runtime `mark` calls targeting this block.
    marks: usize,
    /// Static expressions known to be non-empty.
    static_fills: usize,
}

/// Nesting state of the walk. Reset for every compiled unit.
#[derive(Debug, Clone, Default)]
pub struct CompilerState {
    opts: Vec<OptFrame>,
    fills: Vec<String>,
    loop_depth: usize,
    position: SourceLocation,
}

impl CompilerState {
    pub fn loop_depth(&self) -> usize {
        self.loop_depth
    }

    pub fn opt_depth(&self) -> usize {
        self.opts.len()
    }

    pub fn fill_depth(&self) -> usize {
        self.fills.len()
    }

    /// Position of the node being compiled.
    pub fn position(&self) -> SourceLocation {
        self.position
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlTag {
    If,
    ElseIf,
    Else,
    Switch,
    Case,
    Default,
    Loop,
    Opt,
    Fill,
    Slot,
    Def,
    Tag,
}

impl ControlTag {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "if" => ControlTag::If,
            "elseif" => ControlTag::ElseIf,
            "else" => ControlTag::Else,
            "switch" => ControlTag::Switch,
            "case" => ControlTag::Case,
            "default" => ControlTag::Default,
            "loop" => ControlTag::Loop,
            "opt" => ControlTag::Opt,
            "fill" => ControlTag::Fill,
            "slot" => ControlTag::Slot,
            "def" => ControlTag::Def,
            "tag" => ControlTag::Tag,
            _ => return None,
        })
    }

    fn of(doc: &Document, id: NodeId) -> Option<Self> {
        doc.element_name(id).and_then(ControlTag::from_name)
    }
}

/// `def` declarations made directly in one body.
#[derive(Default)]
struct DefScope {
    temps: HashMap<String, String>,
    blocks: usize,
    frame_pushed: bool,
}

enum Strip {
    Never,
    Always,
    Dynamic(String),
}

// ═══════════════════════════════════════════════════════════════════════════════
// ENTRY POINTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Parses, transforms and compiles one template.
pub fn compile_template(
    source: &str,
    sources: &[DataSource],
    options: &CompileOptions,
    links: Option<&dyn LinkResolver>,
) -> Result<CompiledBody> {
    let mut compiler = Compiler::new(sources, options, links);
    compiler.compile_source(source)
}

pub struct Compiler<'a> {
    env: Environment<'a>,
    options: &'a CompileOptions,
    links: Option<&'a dyn LinkResolver>,
    pseudo: PseudoFunctions<'static>,
    state: CompilerState,
}

impl<'a> Compiler<'a> {
    pub fn new(
        sources: &'a [DataSource],
        options: &'a CompileOptions,
        links: Option<&'a dyn LinkResolver>,
    ) -> Self {
        Compiler {
            env: Environment::new(sources),
            options,
            links,
            pseudo: PseudoFunctions::new(),
            state: CompilerState::default(),
        }
    }

    pub fn state(&self) -> &CompilerState {
        &self.state
    }

    pub fn environment(&self) -> &Environment<'a> {
        &self.env
    }

    /// Runs match templates once over the whole tree, then compiles it.
    pub fn compile_source(&mut self, source: &str) -> Result<CompiledBody> {
        let mut doc = Document::parse(source, self.options.strip_blank_text)?;
        Transformer::new(self.links).apply(&mut doc)?;
        self.compile_document(&doc)
    }

    pub fn compile_document(&mut self, doc: &Document) -> Result<CompiledBody> {
        let body = self.with_fresh_state(|compiler| {
            let mut out = Emitter::default();
            compiler.compile_children(doc, doc.root(), &mut out)?;
            Ok(out.finish())
        })?;
        Ok(CompiledBody {
            bindings: self.env.render_bindings(),
            body,
        })
    }

    /// Runs `f` with empty nesting state and restores the previous state afterwards.
    pub fn with_fresh_state<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let saved = std::mem::take(&mut self.state);
        let result = f(self);
        self.state = saved;
        result
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // EXPRESSIONS
    // ═══════════════════════════════════════════════════════════════════════════

    fn analyze(&mut self, source: &str) -> Result<Analysis> {
        let env = &mut self.env;
        let mut resolver =
            |name: &str, _in_string: bool| -> Result<Substitution> { Ok(env.substitution(name)) };
        let resolver: &mut dyn VariableResolver = &mut resolver;
        let analysis = static_eval::analyze(source, Some(resolver), &self.pseudo)?;
        if !analysis.is_static() {
            self.env.check_residual(&analysis.code)?;
        }
        Ok(analysis)
    }

    /// Value of an attribute: a lone expression keeps its type, anything mixed is a string.
    fn value_expression(&mut self, text: &str) -> Result<Analysis> {
        let mut parts = Vec::new();
        for segment in split_interpolations(text)? {
            match segment {
                Segment::Literal(literal) => parts.push(Analysis::literal(Value::String(literal))),
                Segment::Expr(source) => parts.push(self.analyze(&source)?),
            }
        }
        if parts.len() <= 1 {
            return Ok(parts
                .pop()
                .unwrap_or_else(|| Analysis::literal(Value::String(String::new()))));
        }
        if parts.iter().all(Analysis::is_static) {
            let joined = parts
                .iter()
                .filter_map(|part| part.value.as_ref())
                .map(template_string)
                .collect::<String>();
            return Ok(Analysis::literal(Value::String(joined)));
        }
        let codes: Vec<&str> = parts.iter().map(|part| part.code.as_str()).collect();
        Ok(Analysis::residual(format!("$rt.concat({})", codes.join(", "))))
    }

    /// Output text of a static value, or `None` when only the runtime can render it.
    fn static_text(&self, value: &Value) -> Option<String> {
        match value {
            Value::Array(items) if self.options.auto_array_join => Some(
                items
                    .iter()
                    .map(template_string)
                    .collect::<Vec<_>>()
                    .join(&self.options.array_join_separator),
            ),
            Value::Array(_) => None,
            other => Some(template_string(other)),
        }
    }

    /// Wraps residual output code with array joining and opt marking.
    fn output_code(&mut self, code: String) -> String {
        let code = if self.options.auto_array_join {
            format!(
                "$rt.join({}, {})",
                code,
                render_literal(&Value::String(self.options.array_join_separator.clone()))
            )
        } else {
            code
        };
        self.mark(code)
    }

    fn mark(&mut self, code: String) -> String {
        match self.state.opts.last_mut() {
            Some(opt) => {
                opt.expressions += 1;
                opt.marks += 1;
                format!("$rt.mark({}, {})", opt.temp, code)
            }
            None => code,
        }
    }

    fn note_static(&mut self, filled: bool) {
        if let Some(opt) = self.state.opts.last_mut() {
            opt.expressions += 1;
            if filled {
                opt.static_fills += 1;
            }
        }
    }

    fn flag_attribute(&mut self, doc: &Document, id: NodeId, name: &str) -> Result<bool> {
        let Some(text) = doc.attr(id, name) else {
            return Ok(false);
        };
        if matches!(text.trim().to_ascii_lowercase().as_str(), "" | "0" | "false" | "no") {
            return Ok(false);
        }
        match self.value_expression(text)?.value {
            Some(value) => Ok(template_truthy(&value)),
            None => Err(CompilerError::tree(format!(
                "Attribute \"{}\" must be a constant",
                name
            ))),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // TREE WALK
    // ═══════════════════════════════════════════════════════════════════════════

    fn at_node<T>(
        &mut self,
        doc: &Document,
        id: NodeId,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let location = doc.node(id).location;
        self.state.position = location;
        f(self).map_err(|e| e.at(location))
    }

    fn compile_children(&mut self, doc: &Document, parent: NodeId, out: &mut Emitter) -> Result<()> {
        let children = doc.children(parent);
        let mut defs = DefScope::default();

        let mut i = 0;
        while i < children.len() {
            let id = children[i];
            match ControlTag::of(doc, id) {
                Some(ControlTag::If) => {
                    i += self.compile_if_chain(doc, &children[i..], out)?;
                    continue;
                }
                Some(tag @ (ControlTag::ElseIf | ControlTag::Else)) => {
                    let name = if tag == ControlTag::Else { "else" } else { "elseif" };
                    return Err(CompilerError::new(
                        ErrorKind::DanglingBranch,
                        format!("<{}> without a preceding <if>", name),
                    )
                    .at(doc.node(id).location));
                }
                Some(ControlTag::Def) => {
                    self.at_node(doc, id, |c| c.compile_def(doc, id, &mut defs, out))?;
                }
                _ => self.compile_node(doc, id, out)?,
            }
            i += 1;
        }

        if defs.frame_pushed {
            self.env.pop();
        }
        for _ in 0..defs.blocks {
            out.code("}");
        }
        for temp in defs.temps.values() {
            self.env.free_temp(temp)?;
        }
        Ok(())
    }

    fn compile_node(&mut self, doc: &Document, id: NodeId, out: &mut Emitter) -> Result<()> {
        self.at_node(doc, id, |c| c.compile_node_inner(doc, id, out))
    }

    fn compile_node_inner(&mut self, doc: &Document, id: NodeId, out: &mut Emitter) -> Result<()> {
        match &doc.node(id).kind {
            NodeKind::Document => self.compile_children(doc, id, out),
            NodeKind::Text(text) => self.compile_text(doc, id, text, out),
            NodeKind::Comment(text) => {
                if !self.options.remove_comments {
                    out.write(&format!("<!--{}-->", text));
                }
                Ok(())
            }
            NodeKind::CData(text) => {
                out.write(&format!("<![CDATA[{}]]>", text));
                Ok(())
            }
            NodeKind::Doctype(text) => {
                out.write(&format!("<!DOCTYPE {}>", text));
                Ok(())
            }
            NodeKind::ProcessingInstruction { target, .. } => Err(CompilerError::forbidden(
                format!("Processing instruction <?{}?> is not allowed", target),
            )),
            NodeKind::Element { name, .. } => match ControlTag::from_name(name) {
                Some(ControlTag::Switch) => self.compile_switch(doc, id, out),
                Some(ControlTag::Loop) => self.compile_loop(doc, id, out),
                Some(ControlTag::Opt) => self.compile_opt(doc, id, out),
                Some(ControlTag::Fill) => self.compile_fill(doc, id, out),
                Some(ControlTag::Slot) => self.compile_slot(doc, id, out),
                Some(ControlTag::Tag) => self.compile_tag(doc, id, out),
                Some(ControlTag::Case | ControlTag::Default) => Err(CompilerError::tree(
                    format!("<{}> outside of <switch>", name),
                )),
                // if/elseif/else/def are handled by compile_children
                Some(_) => Err(CompilerError::tree(format!("Unexpected <{}>", name))),
                None => self.compile_element(doc, id, name, &[], out),
            },
        }
    }

    fn compile_text(&mut self, doc: &Document, id: NodeId, text: &str, out: &mut Emitter) -> Result<()> {
        let raw = doc
            .parent(id)
            .and_then(|parent| doc.element_name(parent))
            .map(|name| RAW_TEXT_ELEMENTS.contains(&name.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if raw {
            out.write(text);
            return Ok(());
        }

        for segment in split_interpolations(text)? {
            match segment {
                Segment::Literal(literal) => out.write(&escape_text(&literal)),
                Segment::Expr(source) => {
                    let analysis = self.analyze(&source)?;
                    self.emit_echo(analysis, out);
                }
            }
        }
        Ok(())
    }

    fn emit_echo(&mut self, analysis: Analysis, out: &mut Emitter) {
        if let Some(text) = analysis.value.as_ref().and_then(|v| self.static_text(v)) {
            self.note_static(!text.is_empty());
            out.write(&escape_text(&text));
            return;
        }
        let code = self.output_code(analysis.code);
        out.code(format!("$rt.echo({});", code));
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // CONDITIONALS
    // ═══════════════════════════════════════════════════════════════════════════

    fn condition(&mut self, doc: &Document, id: NodeId) -> Result<Analysis> {
        let name = doc.element_name(id).unwrap_or_default();
        let test = doc.attr(id, "test").ok_or_else(|| {
            CompilerError::tree(format!("<{}> requires a \"test\" attribute", name))
        })?;
        self.value_expression(test)
    }

    /// Compiles an `if` and its `elseif`/`else` siblings. Returns how many siblings it used.
    fn compile_if_chain(&mut self, doc: &Document, siblings: &[NodeId], out: &mut Emitter) -> Result<usize> {
        let mut branches = vec![siblings[0]];
        let mut consumed = 1;
        let mut j = 1;
        loop {
            while j < siblings.len() && is_insignificant(doc, siblings[j]) {
                j += 1;
            }
            match siblings.get(j).and_then(|id| ControlTag::of(doc, *id)) {
                Some(tag @ (ControlTag::ElseIf | ControlTag::Else)) => {
                    branches.push(siblings[j]);
                    j += 1;
                    consumed = j;
                    if tag == ControlTag::Else {
                        break;
                    }
                }
                _ => break,
            }
        }

        let mut opened = false;
        for branch in branches {
            let is_else = ControlTag::of(doc, branch) == Some(ControlTag::Else);
            let condition = if is_else {
                None
            } else {
                Some(self.at_node(doc, branch, |c| c.condition(doc, branch))?)
            };

            match condition.as_ref().map(|a| a.value.as_ref().map(template_truthy)) {
                Some(Some(false)) => continue,
                Some(Some(true)) | None => {
                    out.code(if opened { "} else {" } else { "{" });
                    self.compile_children(doc, branch, out)?;
                    out.code("}");
                    return Ok(consumed);
                }
                Some(None) => {
                    let code = condition.map(|a| a.code).unwrap_or_default();
                    if opened {
                        out.code(format!("}} else if ($rt.truthy({})) {{", code));
                    } else {
                        out.code(format!("if ($rt.truthy({})) {{", code));
                        opened = true;
                    }
                    self.compile_children(doc, branch, out)?;
                }
            }
        }
        if opened {
            out.code("}");
        }
        Ok(consumed)
    }

    fn compile_switch(&mut self, doc: &Document, id: NodeId, out: &mut Emitter) -> Result<()> {
        let test = doc
            .attr(id, "test")
            .ok_or_else(|| CompilerError::tree("<switch> requires a \"test\" attribute"))?;
        let subject = self.value_expression(test)?;

        let mut cases: HashMap<NodeId, Analysis> = HashMap::new();
        let arms = validate_switch(doc, id, |case| {
            let location = doc.node(case).location;
            let text = doc.attr(case, "test").ok_or_else(|| {
                CompilerError::tree("<case> requires a \"test\" attribute").at(location)
            })?;
            let analysis = self.value_expression(text).map_err(|e| e.at(location))?;
            let key = match &analysis.value {
                Some(value) => template_string(value),
                None => text.to_string(),
            };
            cases.insert(case, analysis);
            Ok(key)
        })?;

        if let Some(value) = &subject.value {
            if cases.values().all(Analysis::is_static) {
                let key = template_string(value);
                let chosen = arms
                    .iter()
                    .find(|arm| matches!(arm, SwitchArm::Case { key: k, .. } if *k == key))
                    .or_else(|| arms.iter().find(|arm| matches!(arm, SwitchArm::Default { .. })));
                if let Some(SwitchArm::Case { node, .. } | SwitchArm::Default { node }) = chosen {
                    out.code("{");
                    self.compile_children(doc, *node, out)?;
                    out.code("}");
                }
                return Ok(());
            }
        }

        out.code(format!("switch ($rt.str({})) {{", subject.code));
        for arm in &arms {
            match arm {
                SwitchArm::Case { node, key } => {
                    let label = match cases.get(node) {
                        Some(analysis) if !analysis.is_static() => {
                            format!("$rt.str({})", analysis.code)
                        }
                        _ => render_literal(&Value::String(key.clone())),
                    };
                    out.code(format!("case {}: {{", label));
                    self.compile_children(doc, *node, out)?;
                    out.code("break;");
                    out.code("}");
                }
                SwitchArm::Default { node } => {
                    out.code("default: {");
                    self.compile_children(doc, *node, out)?;
                    out.code("}");
                }
            }
        }
        out.code("}");
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // SCOPED TAGS
    // ═══════════════════════════════════════════════════════════════════════════

    fn compile_loop(&mut self, doc: &Document, id: NodeId, out: &mut Emitter) -> Result<()> {
        let on = doc
            .attr(id, "on")
            .ok_or_else(|| CompilerError::tree("<loop> requires an \"on\" attribute"))?;
        let on = self.value_expression(on)?;
        if matches!(&on.value, Some(value) if !template_truthy(value)) {
            return Ok(());
        }
        let (key_name, value_name) = loop_names(doc.attr(id, "as"))?;
        let max = match doc.attr(id, "max") {
            Some(text) => Some(self.value_expression(text)?),
            None => None,
        };

        self.state.loop_depth += 1;
        let key = self.env.get_temp(&key_name);
        let value = self.env.get_temp(&value_name);
        let counter = match max {
            Some(_) => Some(self.env.get_temp(&format!("n{}", self.state.loop_depth))),
            None => None,
        };

        out.code("{");
        if let Some(counter) = &counter {
            out.code(format!("let {} = 0;", counter));
        }
        out.code(format!(
            "for (const [{}, {}] of $rt.iter({}, {})) {{",
            key, value, on.code, self.options.strict_iteration
        ));
        if let (Some(counter), Some(max)) = (&counter, &max) {
            out.code(format!("if ({}++ >= {}) break;", counter, max.code));
        }

        self.env.push(HashMap::from([
            (key_name, key.clone()),
            (value_name, value.clone()),
        ]));
        let body = self.compile_children(doc, id, out);
        self.env.pop();
        self.state.loop_depth -= 1;
        body?;

        out.code("}");
        out.code("}");
        self.env.free_temp(&key)?;
        self.env.free_temp(&value)?;
        if let Some(counter) = counter {
            self.env.free_temp(&counter)?;
        }
        Ok(())
    }

    fn compile_opt(&mut self, doc: &Document, id: NodeId, out: &mut Emitter) -> Result<()> {
        let min = match doc.attr(id, "min") {
            Some(text) => self.value_expression(text)?,
            None => Analysis::literal(Value::from(1)),
        };
        let static_min = min.value.as_ref().map(|value| {
            let n = to_number(value);
            if n.is_finite() && n > 0.0 {
                n.ceil() as usize
            } else {
                0
            }
        });

        let temp = self.env.get_temp("opt");
        self.state.opts.push(OptFrame {
            temp: temp.clone(),
            expressions: 0,
            marks: 0,
            static_fills: 0,
        });
        let mut inner = Emitter::default();
        let body = self.compile_children(doc, id, &mut inner);
        let frame = self.state.opts.pop();
        body?;
        self.env.free_temp(&temp)?;
        let Some(frame) = frame else {
            return Err(CompilerError::tree("Unbalanced <opt> nesting"));
        };

        if frame.marks == 0 {
            // Nothing left for the runtime to decide
            let keep = frame.expressions == 0
                || static_min.map_or(false, |min| frame.static_fills >= min);
            if keep || static_min.is_some() {
                if frame.expressions > 0 {
                    self.note_static(keep);
                }
                if keep {
                    out.append(inner);
                }
                return Ok(());
            }
        }

        let required = match static_min {
            Some(min) => min.saturating_sub(frame.static_fills).to_string(),
            None if frame.static_fills > 0 => format!("({}) - {}", min.code, frame.static_fills),
            None => min.code,
        };
        out.code("{");
        out.code(format!("const {} = $rt.optBegin();", temp));
        out.append(inner);
        let end = format!("$rt.optEnd({}, {})", temp, required);
        match self.state.opts.last_mut() {
            Some(parent) => {
                parent.expressions += 1;
                parent.marks += 1;
                out.code(format!("if ({}) $rt.mark({}, true);", end, parent.temp));
            }
            None => out.code(format!("{};", end)),
        }
        out.code("}");
        Ok(())
    }

    fn compile_fill(&mut self, doc: &Document, id: NodeId, out: &mut Emitter) -> Result<()> {
        let values = match doc.attr(id, "values") {
            Some(text) => self.value_expression(text)?,
            None => Analysis::literal(Value::Null),
        };
        let strict = self.flag_attribute(doc, id, "strict")?;
        let set = match &values.value {
            Some(value) => render_literal(&Value::Array(
                fill_tokens(value, strict).into_iter().map(Value::String).collect(),
            )),
            None => values.code,
        };

        let temp = self.env.get_temp("fill");
        out.code("{");
        out.code(format!("const {} = $rt.fillSet({}, {});", temp, set, strict));
        self.env.push(HashMap::from([("fill".to_string(), temp.clone())]));
        self.state.fills.push(temp.clone());
        let body = self.compile_children(doc, id, out);
        self.state.fills.pop();
        self.env.pop();
        body?;
        out.code("}");
        self.env.free_temp(&temp)
    }

    fn compile_def(&mut self, doc: &Document, id: NodeId, defs: &mut DefScope, out: &mut Emitter) -> Result<()> {
        let name = doc
            .attr(id, "name")
            .map(|n| n.trim().trim_start_matches('$').to_string())
            .ok_or_else(|| CompilerError::tree("<def> requires a \"name\" attribute"))?;
        if !LOCAL_NAME.is_match(&name) {
            return Err(CompilerError::tree(format!("Invalid <def> name \"{}\"", name)));
        }
        let value = match doc.attr(id, "value") {
            Some(text) => self.value_expression(text)?,
            None => Analysis::literal(Value::Null),
        };

        if let Some(temp) = defs.temps.get(&name) {
            out.code(format!("{} = {};", temp, value.code));
            return Ok(());
        }
        let temp = self.env.get_temp(&name);
        out.code("{");
        out.code(format!("let {} = {};", temp, value.code));
        defs.blocks += 1;
        if !defs.frame_pushed {
            self.env.push(HashMap::new());
            defs.frame_pushed = true;
        }
        self.env.bind_local(&name, &temp);
        defs.temps.insert(name, temp);
        Ok(())
    }

    fn compile_slot(&mut self, doc: &Document, id: NodeId, out: &mut Emitter) -> Result<()> {
        let name = doc
            .attr(id, "name")
            .ok_or_else(|| CompilerError::tree("<slot> requires a \"name\" attribute"))?;
        let name = self.value_expression(name)?;
        let action = self.value_expression(doc.attr(id, "action").unwrap_or_default())?;

        let mut args = Vec::new();
        for (key, text) in doc.attributes(id) {
            if matches!(key.as_str(), "name" | "action") {
                continue;
            }
            let value = self.value_expression(&text)?;
            args.push(format!("{}: {}", render_literal(&Value::String(key)), value.code));
        }
        let call = format!(
            "$rt.slot({}, {}, {{{}}})",
            name.code,
            action.code,
            args.join(", ")
        );

        let has_body = doc
            .children(id)
            .into_iter()
            .any(|child| !is_insignificant(doc, child));
        if has_body {
            out.code(format!("if ({}) {{", call));
            self.compile_children(doc, id, out)?;
            out.code("}");
        } else {
            out.code(format!("{};", call));
        }
        Ok(())
    }

    fn compile_tag(&mut self, doc: &Document, id: NodeId, out: &mut Emitter) -> Result<()> {
        let tag = match doc.attr(id, "tag") {
            Some(text) => self.value_expression(text)?,
            None => Analysis::literal(Value::String(String::new())),
        };

        if let Some(value) = &tag.value {
            let name = template_string(value).trim().to_string();
            if name.is_empty() {
                return self.compile_children(doc, id, out);
            }
            if !ELEMENT_NAME.is_match(&name) {
                return Err(CompilerError::tree(format!("Invalid element name \"{}\"", name)));
            }
            return self.compile_element(doc, id, &name, &["tag"], out);
        }

        let Some(guarded) = self.test_guard(doc, id, out)? else {
            return Ok(());
        };
        let tag_name = match self.strip_mode(doc, id)? {
            Strip::Always => {
                self.compile_children(doc, id, out)?;
                if guarded {
                    out.code("}");
                }
                return Ok(());
            }
            Strip::Never => format!("$rt.tagName({})", tag.code),
            // a stripped element keeps its children only
            Strip::Dynamic(code) => format!("$rt.truthy({}) ? \"\" : $rt.tagName({})", code, tag.code),
        };
        let temp = self.env.get_temp("tag");
        out.code("{");
        out.code(format!("const {} = {};", temp, tag_name));
        out.code(format!("if ({}) {{", temp));
        out.code(format!("$rt.write(\"<\" + {});", temp));
        for (name, value) in doc.attributes(id) {
            if !matches!(name.as_str(), "tag" | "test" | "strip") {
                self.compile_attribute("", &name, &value, out)?;
            }
        }
        out.write(">");
        out.code("}");
        self.compile_children(doc, id, out)?;
        out.code(format!("if ({}) {{", temp));
        out.code(format!("$rt.write(\"</\" + {} + \">\");", temp));
        out.code("}");
        out.code("}");
        if guarded {
            out.code("}");
        }
        self.env.free_temp(&temp)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // ELEMENTS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Handles a `test` attribute. `None` means the node is statically dropped,
    /// `Some(true)` means an `if` block was opened and must be closed by the caller.
    fn test_guard(&mut self, doc: &Document, id: NodeId, out: &mut Emitter) -> Result<Option<bool>> {
        let Some(test) = doc.attr(id, "test") else {
            return Ok(Some(false));
        };
        let condition = self.value_expression(test)?;
        Ok(match &condition.value {
            Some(value) if template_truthy(value) => Some(false),
            Some(_) => None,
            None => {
                out.code(format!("if ($rt.truthy({})) {{", condition.code));
                Some(true)
            }
        })
    }

    fn strip_mode(&mut self, doc: &Document, id: NodeId) -> Result<Strip> {
        let Some(text) = doc.attr(id, "strip") else {
            return Ok(Strip::Never);
        };
        let analysis = self.value_expression(text)?;
        Ok(match &analysis.value {
            Some(value) if template_truthy(value) => Strip::Always,
            Some(_) => Strip::Never,
            None => Strip::Dynamic(analysis.code),
        })
    }

    fn compile_element(
        &mut self,
        doc: &Document,
        id: NodeId,
        name: &str,
        skip: &[&str],
        out: &mut Emitter,
    ) -> Result<()> {
        let Some(guarded) = self.test_guard(doc, id, out)? else {
            return Ok(());
        };
        let strip = self.strip_mode(doc, id)?;
        let attributes: Vec<(String, String)> = doc
            .attributes(id)
            .into_iter()
            .filter(|(key, _)| !matches!(key.as_str(), "test" | "strip"))
            .filter(|(key, _)| !skip.contains(&key.as_str()))
            .collect();

        match strip {
            Strip::Always => self.compile_children(doc, id, out)?,
            Strip::Never => {
                let closed = self.emit_open_tag(doc, id, name, &attributes, out)?;
                if !closed {
                    self.compile_children(doc, id, out)?;
                    out.write(&format!("</{}>", name));
                }
            }
            Strip::Dynamic(code) => {
                let temp = self.env.get_temp("strip");
                out.code("{");
                out.code(format!("const {} = $rt.truthy({});", temp, code));
                out.code(format!("if (!{}) {{", temp));
                let closed = self.emit_open_tag(doc, id, name, &attributes, out)?;
                out.code("}");
                if !closed {
                    self.compile_children(doc, id, out)?;
                    out.code(format!("if (!{}) {{", temp));
                    out.write(&format!("</{}>", name));
                    out.code("}");
                }
                out.code("}");
                self.env.free_temp(&temp)?;
            }
        }

        if guarded {
            out.code("}");
        }
        Ok(())
    }

    /// Writes the start tag. Returns `true` when the element was self-closed.
    fn emit_open_tag(
        &mut self,
        doc: &Document,
        id: NodeId,
        name: &str,
        attributes: &[(String, String)],
        out: &mut Emitter,
    ) -> Result<bool> {
        out.write(&format!("<{}", name));
        for (key, value) in attributes {
            self.compile_attribute(name, key, value, out)?;
        }
        self.fill_hook(doc, id, name, out)?;

        let lower = name.to_ascii_lowercase();
        if VOID_ELEMENTS.contains(&lower.as_str()) && doc.children(id).is_empty() {
            out.write("/>");
            Ok(true)
        } else {
            out.write(">");
            Ok(false)
        }
    }

    fn compile_attribute(&mut self, element: &str, name: &str, value: &str, out: &mut Emitter) -> Result<()> {
        let segments = split_interpolations(value)?;
        let has_expr = segments.iter().any(Segment::is_expr);
        let quoted = render_literal(&Value::String(name.to_string()));

        if is_link_attribute(element, name) {
            let target = self.value_expression(value)?;
            match (&target.value, self.links) {
                (Some(value), Some(links)) => {
                    let url = links.resolve_link(&template_string(value));
                    if has_expr {
                        self.note_static(!url.is_empty());
                    }
                    out.write(&format!(" {}=\"{}\"", name, escape_attr(&url)));
                }
                _ => {
                    let code = format!("$rt.link({})", target.code);
                    let code = if has_expr { self.mark(code) } else { code };
                    out.code(format!("$rt.attr({}, {});", quoted, code));
                }
            }
            return Ok(());
        }

        if !has_expr {
            let text: String = segments
                .into_iter()
                .map(|segment| match segment {
                    Segment::Literal(literal) | Segment::Expr(literal) => literal,
                })
                .collect();
            out.write(&format!(" {}=\"{}\"", name, escape_attr(&text)));
            return Ok(());
        }

        if let [Segment::Expr(source)] = segments.as_slice() {
            let analysis = self.analyze(source)?;
            if let Some(text) = analysis.value.as_ref().and_then(|v| self.static_text(v)) {
                self.note_static(!text.is_empty());
                if !text.is_empty() {
                    out.write(&format!(" {}=\"{}\"", name, escape_attr(&text)));
                }
                return Ok(());
            }
            let code = self.output_code(analysis.code);
            out.code(format!("$rt.attr({}, {});", quoted, code));
            return Ok(());
        }

        // mixed values are escaped by the runtime as a whole
        let mut text = String::new();
        let mut parts: Vec<String> = Vec::new();
        for segment in segments {
            match segment {
                Segment::Literal(literal) => text.push_str(&literal),
                Segment::Expr(source) => {
                    let analysis = self.analyze(&source)?;
                    match analysis.value.as_ref().and_then(|v| self.static_text(v)) {
                        Some(folded) => {
                            self.note_static(!folded.is_empty());
                            text.push_str(&folded);
                        }
                        None => {
                            if !text.is_empty() {
                                parts.push(render_literal(&Value::String(std::mem::take(&mut text))));
                            }
                            parts.push(self.output_code(analysis.code));
                        }
                    }
                }
            }
        }
        if parts.is_empty() {
            out.write(&format!(" {}=\"{}\"", name, escape_attr(&text)));
            return Ok(());
        }
        if !text.is_empty() {
            parts.push(render_literal(&Value::String(text)));
        }
        out.code(format!("$rt.attr({}, $rt.concat({}));", quoted, parts.join(", ")));
        Ok(())
    }

    /// Inside `fill`, checkable inputs and options consume their value from the set.
    fn fill_hook(&mut self, doc: &Document, id: NodeId, name: &str, out: &mut Emitter) -> Result<()> {
        let Some(fill) = self.state.fills.last().cloned() else {
            return Ok(());
        };
        let lower = name.to_ascii_lowercase();
        let marker = match lower.as_str() {
            "input" => {
                let kind = doc.attr(id, "type").map(|t| t.trim().to_ascii_lowercase());
                match kind.as_deref() {
                    None | Some("checkbox") | Some("radio") => "checked",
                    _ => return Ok(()),
                }
            }
            "option" => "selected",
            _ => return Ok(()),
        };
        if doc.has_attr(id, marker) {
            return Ok(());
        }

        let value = match doc.attr(id, "value") {
            Some(text) => self.value_expression(text)?,
            None if lower == "option" => {
                Analysis::literal(Value::String(doc.text_content(id).trim().to_string()))
            }
            None => return Ok(()),
        };
        let attribute = format!(" {}=\"{}\"", marker, marker);
        out.code(format!(
            "if ($rt.fillTake({}, {})) $rt.write({});",
            fill,
            value.code,
            render_literal(&Value::String(attribute))
        ));
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

fn is_link_attribute(element: &str, attribute: &str) -> bool {
    let element = element.to_ascii_lowercase();
    let attribute = attribute.to_ascii_lowercase();
    LINK_ATTRIBUTES
        .iter()
        .any(|(e, a)| *e == element && *a == attribute)
}

/// `as="$v"` or `as="$k, $v"`. The key defaults to `key`, the value to `value`.
fn loop_names(declared: Option<&str>) -> Result<(String, String)> {
    let Some(declared) = declared else {
        return Ok(("key".to_string(), "value".to_string()));
    };
    let names: Vec<String> = declared
        .split(',')
        .map(|name| name.trim().trim_start_matches('$').to_string())
        .collect();
    if let Some(bad) = names.iter().find(|name| !LOCAL_NAME.is_match(name)) {
        return Err(CompilerError::tree(format!("Invalid loop variable \"{}\"", bad)));
    }
    match names.as_slice() {
        [value] => Ok(("key".to_string(), value.clone())),
        [key, value] if key == value => Err(CompilerError::malformed(format!(
            "<loop as=\"{}\"> uses \"{}\" for both the key and the value",
            declared, key
        ))),
        [key, value] => Ok((key.clone(), value.clone())),
        _ => Err(CompilerError::tree(format!(
            "<loop as=\"{}\"> declares more than two names",
            declared
        ))),
    }
}

/// Token set of a static `fill` value.
pub fn fill_tokens(value: &Value, strict: bool) -> Vec<String> {
    let raw: Vec<String> = match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items.iter().map(template_string).collect(),
        Value::Object(map) => map.values().map(template_string).collect(),
        Value::String(text) => text.split(',').map(str::to_string).collect(),
        other => vec![template_string(other)],
    };
    raw.into_iter()
        .map(|token| if strict { token } else { normalize_fill_token(&token) })
        .filter(|token| !token.is_empty())
        .collect()
}

/// Case and diacritic folding used by non-strict `fill`.
pub fn normalize_fill_token(token: &str) -> String {
    token.trim().to_lowercase().chars().map(fold_diacritic).collect()
}

fn fold_diacritic(c: char) -> char {
    match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' | 'ă' | 'ą' => 'a',
        'ç' | 'ć' | 'č' => 'c',
        'ď' => 'd',
        'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ę' | 'ě' => 'e',
        'ì' | 'í' | 'î' | 'ï' | 'ī' => 'i',
        'ł' | 'ľ' => 'l',
        'ñ' | 'ń' | 'ň' => 'n',
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' | 'ő' => 'o',
        'ř' => 'r',
        'ś' | 'š' | 'ş' => 's',
        'ť' | 'ţ' => 't',
        'ù' | 'ú' | 'û' | 'ü' | 'ū' | 'ů' | 'ű' => 'u',
        'ý' | 'ÿ' => 'y',
        'ź' | 'ż' | 'ž' => 'z',
        other => other,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(value: Value) -> Vec<DataSource> {
        match value {
            Value::Object(map) => vec![DataSource::Json(map)],
            _ => panic!("test data must be an object"),
        }
    }

    fn compile(source: &str, sources: &[DataSource]) -> CompiledBody {
        compile_template(source, sources, &CompileOptions::default(), None).unwrap()
    }

    fn compile_err(source: &str) -> CompilerError {
        compile_template(source, &[], &CompileOptions::default(), None).unwrap_err()
    }

    #[test]
    fn test_static_markup_is_one_write() {
        let out = compile("<p class=\"a\">Hi <b>there</b></p>", &[]);
        assert_eq!(out.body, "$rt.write(\"<p class=\\\"a\\\">Hi <b>there</b></p>\");\n");
        assert!(out.bindings.is_empty());
    }

    #[test]
    fn test_variable_binding_and_echo() {
        let sources = data(json!({"name": "x"}));
        let out = compile("<p>$name</p>", &sources);
        assert_eq!(out.bindings, "const _name = $src[0][\"name\"];\n");
        assert!(out.body.contains("$rt.echo(_name);"));
    }

    #[test]
    fn test_static_expression_is_folded_and_escaped() {
        let out = compile("<p>{'<' + 1 + 2}</p>", &[]);
        assert_eq!(out.body, "$rt.write(\"<p>&lt;12</p>\");\n");
    }

    #[test]
    fn test_void_elements_self_close() {
        let out = compile("<div><br></br><img src=\"/a.png\"/></div>", &[]);
        assert!(out.body.contains("<div><br/>"));
        assert!(out.body.contains("$rt.attr(\"src\", $rt.link(\"/a.png\"));"));
    }

    #[test]
    fn test_link_resolved_at_compile_time() {
        struct Root;
        impl LinkResolver for Root {
            fn resolve_link(&self, target: &str) -> String {
                format!("/app{}", target)
            }
        }
        let out = compile_template(
            "<a href=\"/home\">x</a>",
            &[],
            &CompileOptions::default(),
            Some(&Root),
        )
        .unwrap();
        assert_eq!(out.body, "$rt.write(\"<a href=\\\"/app/home\\\">x</a>\");\n");
    }

    #[test]
    fn test_if_chain_static_true_drops_rest() {
        let sources = data(json!({"x": 1}));
        let out = compile("<if test=\"{true}\">A</if><else>$x</else>", &sources);
        assert_eq!(out.body, "{\n$rt.write(\"A\");\n}\n");
        assert!(!out.body.contains("_x"));
        assert!(out.bindings.is_empty());
    }

    #[test]
    fn test_if_chain_false_then_else() {
        let sources = data(json!({"x": 1}));
        let out = compile(
            "<if test=\"{false}\">A</if> <elseif test=\"$x\">B</elseif> <else>C</else>",
            &sources,
        );
        assert_eq!(
            out.body,
            "if ($rt.truthy(_x)) {\n$rt.write(\"B\");\n} else {\n$rt.write(\"C\");\n}\n"
        );
    }

    #[test]
    fn test_dangling_else() {
        let err = compile_err("<p/><else>x</else>");
        assert_eq!(err.kind, ErrorKind::DanglingBranch);
        assert_eq!(err.line, 1);
    }

    #[test]
    fn test_switch_runtime_and_folding() {
        let sources = data(json!({"x": "a"}));
        let out = compile(
            "<switch test=\"$x\"><case test=\"a\">A</case><default>D</default></switch>",
            &sources,
        );
        assert!(out.body.starts_with("switch ($rt.str(_x)) {\ncase \"a\": {\n"));
        assert!(out.body.contains("default: {\n$rt.write(\"D\");\n}\n}\n"));

        let folded = compile(
            "<switch test=\"{'b'}\"><case test=\"a\">A</case><case test=\"b\">B</case></switch>",
            &[],
        );
        assert_eq!(folded.body, "{\n$rt.write(\"B\");\n}\n");
    }

    #[test]
    fn test_switch_errors() {
        assert_eq!(
            compile_err("<switch test=\"1\"><case test=\"a\"/><case test=\"a\"/></switch>").kind,
            ErrorKind::DuplicateCase
        );
        assert_eq!(
            compile_err("<switch test=\"1\"> </switch>").kind,
            ErrorKind::EmptySwitch
        );
        assert_eq!(compile_err("<case test=\"1\"/>").kind, ErrorKind::TreeMalformed);
    }

    #[test]
    fn test_loop_scoping() {
        let sources = data(json!({"x": "outer", "list": [1, 2]}));
        let out = compile("$x<loop on=\"$list\" as=\"$x\">$x</loop>$x", &sources);
        assert!(out.body.contains("for (const [_key, _x1] of $rt.iter(_list, false)) {"));
        assert!(out.body.contains("$rt.echo(_x1);"));
        assert!(out.body.ends_with("$rt.echo(_x);\n"));
    }

    #[test]
    fn test_loop_max_counter() {
        let sources = data(json!({"list": [1, 2]}));
        let out = compile("<loop on=\"$list\" as=\"$k, $v\" max=\"2\">$k</loop>", &sources);
        assert!(out.body.contains("let _n1 = 0;"));
        assert!(out.body.contains("for (const [_k, _v] of $rt.iter(_list, false)) {"));
        assert!(out.body.contains("if (_n1++ >= \"2\") break;"));
    }

    #[test]
    fn test_opt_without_expressions_is_passthrough() {
        let out = compile("<opt><b>hi</b></opt>", &[]);
        assert_eq!(out.body, "$rt.write(\"<b>hi</b>\");\n");
    }

    #[test]
    fn test_opt_static_empty_is_dropped() {
        let out = compile("<p><opt><b>{''}</b></opt></p>", &[]);
        assert_eq!(out.body, "$rt.write(\"<p></p>\");\n");
    }

    #[test]
    fn test_opt_with_variable() {
        let sources = data(json!({"x": ""}));
        let out = compile("<opt><b>$x</b></opt>", &sources);
        assert_eq!(
            out.body,
            "{\nconst _opt = $rt.optBegin();\n$rt.write(\"<b>\");\n$rt.echo($rt.mark(_opt, _x));\n$rt.write(\"</b>\");\n$rt.optEnd(_opt, 1);\n}\n"
        );
    }

    #[test]
    fn test_nested_opt_marks_parent() {
        let sources = data(json!({"x": ""}));
        let out = compile("<opt><opt>$x</opt></opt>", &sources);
        assert!(out.body.contains("const _opt1 = $rt.optBegin();"));
        assert!(out.body.contains("if ($rt.optEnd(_opt1, 1)) $rt.mark(_opt, true);"));
    }

    #[test]
    fn test_fill_marks_inputs() {
        let out = compile(
            "<fill values=\"A, Béta\"><input type=\"checkbox\" value=\"beta\"/></fill>",
            &[],
        );
        assert!(out.body.contains("const _fill = $rt.fillSet([\"a\",\"beta\"], false);"));
        assert!(out
            .body
            .contains("if ($rt.fillTake(_fill, \"beta\")) $rt.write(\" checked=\\\"checked\\\"\");"));
    }

    #[test]
    fn test_def_and_redefinition() {
        let out = compile(
            "<def name=\"x\" value=\"{1}\"/>$x<def name=\"x\" value=\"{2}\"/>$x",
            &[],
        );
        assert_eq!(
            out.body,
            "{\nlet _x = 1;\n$rt.echo(_x);\n_x = 2;\n$rt.echo(_x);\n}\n"
        );
    }

    #[test]
    fn test_slot_with_and_without_body() {
        let sources = data(json!({"id": 3}));
        let out = compile("<slot name=\"side\" id=\"$id\"/>", &sources);
        assert_eq!(out.body, "$rt.slot(\"side\", \"\", {\"id\": _id});\n");

        let guarded = compile("<slot name=\"side\" action=\"menu\">x</slot>", &[]);
        assert_eq!(
            guarded.body,
            "if ($rt.slot(\"side\", \"menu\", {})) {\n$rt.write(\"x\");\n}\n"
        );
    }

    #[test]
    fn test_tag_static_and_dynamic() {
        let out = compile("<tag tag=\"h2\" class=\"t\">x</tag>", &[]);
        assert_eq!(out.body, "$rt.write(\"<h2 class=\\\"t\\\">x</h2>\");\n");

        let empty = compile("<tag tag=\"\">x</tag>", &[]);
        assert_eq!(empty.body, "$rt.write(\"x\");\n");

        let sources = data(json!({"level": "h3"}));
        let dynamic = compile("<tag tag=\"$level\">x</tag>", &sources);
        assert!(dynamic.body.contains("const _tag = $rt.tagName(_level);"));
        assert!(dynamic.body.contains("$rt.write(\"</\" + _tag + \">\");"));
    }

    #[test]
    fn test_dynamic_tag_honours_strip() {
        let sources = data(json!({"level": "h3", "flat": true}));
        let dynamic = compile("<tag tag=\"$level\" strip=\"$flat\">x</tag>", &sources);
        assert!(dynamic
            .body
            .contains("const _tag = $rt.truthy(_flat) ? \"\" : $rt.tagName(_level);"));
        assert!(dynamic.body.contains("$rt.write(\"x\");"));

        let stripped = compile("<tag tag=\"$level\" strip=\"1\">x</tag>", &sources);
        assert_eq!(stripped.body, "$rt.write(\"x\");\n");

        let kept = compile("<tag tag=\"$level\" strip=\"{0}\">x</tag>", &sources);
        assert!(kept.body.contains("const _tag = $rt.tagName(_level);"));
    }

    #[test]
    fn test_loop_rejects_repeated_name() {
        assert_eq!(
            compile_err("<loop on=\"{[1]}\" as=\"$x,$x\">a</loop>").kind,
            ErrorKind::MalformedExpression
        );
        assert_eq!(
            compile_err("<loop on=\"{[1]}\" as=\"x, $x\">a</loop>").kind,
            ErrorKind::MalformedExpression
        );
    }

    #[test]
    fn test_element_test_and_strip() {
        let out = compile("<p test=\"{false}\">a</p><b strip=\"1\">c</b>", &[]);
        assert_eq!(out.body, "$rt.write(\"c\");\n");
    }

    #[test]
    fn test_attribute_pure_code_suppressed_when_empty() {
        let out = compile("<p title=\"{''}\" id=\"{'a'}\">x</p>", &[]);
        assert_eq!(out.body, "$rt.write(\"<p id=\\\"a\\\">x</p>\");\n");
    }

    #[test]
    fn test_processing_instruction_forbidden() {
        let err = compile_err("<p><?php echo 1; ?></p>");
        assert_eq!(err.kind, ErrorKind::ForbiddenConstruct);
    }

    #[test]
    fn test_remove_comments_option() {
        let options = CompileOptions {
            remove_comments: true,
            ..CompileOptions::default()
        };
        let out = compile_template("<p><!-- x -->y</p>", &[], &options, None).unwrap();
        assert_eq!(out.body, "$rt.write(\"<p>y</p>\");\n");
    }

    #[test]
    fn test_auto_array_join() {
        let options = CompileOptions {
            auto_array_join: true,
            ..CompileOptions::default()
        };
        let sources = data(json!({"tags": ["a", "b"]}));
        let out = compile_template("<p>$tags {[1, 2]}</p>", &sources, &options, None).unwrap();
        assert!(out.body.contains("$rt.echo($rt.join(_tags, \", \"));"));
        assert!(out.body.contains("1, 2</p>"));
    }

    #[test]
    fn test_fresh_state_is_restored() {
        let options = CompileOptions::default();
        let mut compiler = Compiler::new(&[], &options, None);
        compiler.state.loop_depth = 4;
        let depth = compiler
            .with_fresh_state(|c| Ok(c.state().loop_depth()))
            .unwrap();
        assert_eq!(depth, 0);
        assert_eq!(compiler.state().loop_depth(), 4);
    }

    #[test]
    fn test_error_position() {
        let err = compile_err("<p>\n  <b>{$a = 1}</b></p>");
        assert_eq!(err.kind, ErrorKind::AssignmentForbidden);
        assert_eq!(err.line, 2);
    }

    #[test]
    fn test_normalize_fill_token() {
        assert_eq!(normalize_fill_token("  Élan "), "elan");
        assert_eq!(fill_tokens(&json!(["A", 1]), true), vec!["A", "1"]);
    }
}
