//! Expression analyzer and compile-time evaluator.
//!
//! An expression is analyzed token by token: variables are substituted through a
//! [`VariableResolver`], function calls are checked against the sandbox in
//! [`crate::builtins`], and every construct outside the template subset is rejected.
//! When nothing dynamic is left, the expression is evaluated with JavaScript semantics and
//! replaced by its literal, so a folded value is exactly what the runtime would compute.

use serde_json::{Number, Value};
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::builtins::{self, DENIED_KEYWORDS, DENIED_MEMBERS};
use crate::tokenize::{tokenize, Token, TokenKind};
use crate::validate::{CompilerError, ErrorKind, Result};

/// What a variable turns into.
#[derive(Debug, Clone, PartialEq)]
pub enum Substitution {
    /// Further host code; the expression stops being static.
    Code(String),
    /// A known value, spliced in as a literal.
    Literal(Value),
}

pub trait VariableResolver {
    fn resolve(&mut self, name: &str, in_string: bool) -> Result<Substitution>;
}

impl<F> VariableResolver for F
where
    F: FnMut(&str, bool) -> Result<Substitution>,
{
    fn resolve(&mut self, name: &str, in_string: bool) -> Result<Substitution> {
        self(name, in_string)
    }
}

/// Compile-time handler of a caller-supplied pseudo-function.
pub type PseudoHandler<'a> = Box<dyn Fn(&[Value]) -> Result<Value> + 'a>;

/// `Some(handler)` runs at compile time; `None` defers to `$rt.call`.
pub type PseudoFunctions<'a> = HashMap<String, Option<PseudoHandler<'a>>>;

#[derive(Debug, Clone, PartialEq)]
pub struct Analysis {
    /// JavaScript expression. For static results this is the literal of `value`.
    pub code: String,
    pub value: Option<Value>,
}

impl Analysis {
    pub fn literal(value: Value) -> Self {
        Analysis {
            code: render_literal(&value),
            value: Some(value),
        }
    }

    pub fn residual(code: impl Into<String>) -> Self {
        Analysis {
            code: code.into(),
            value: None,
        }
    }

    pub fn is_static(&self) -> bool {
        self.value.is_some()
    }
}

pub fn render_literal(value: &Value) -> String {
    match value {
        Value::Number(n) if n.as_f64().map(|f| f < 0.0).unwrap_or(false) => format!("({})", n),
        _ => serde_json::to_string(value).unwrap_or_else(|_| "null".to_string()),
    }
}

pub fn analyze(
    source: &str,
    resolver: Option<&mut dyn VariableResolver>,
    pseudo: &PseudoFunctions<'_>,
) -> Result<Analysis> {
    let tokens = tokenize(source)?;
    analyze_tokens(&tokens, resolver, pseudo)
}

pub fn analyze_tokens(
    tokens: &[Token],
    resolver: Option<&mut dyn VariableResolver>,
    pseudo: &PseudoFunctions<'_>,
) -> Result<Analysis> {
    let mut analyzer = Analyzer {
        tokens,
        pos: 0,
        resolver,
        pseudo,
    };
    let analysis = analyzer.expression(&[])?;
    let rest = analyzer.peek();
    if rest.kind != TokenKind::End {
        return Err(unexpected(rest));
    }
    Ok(analysis)
}

/// Folds an expression that may not reference variables.
pub fn evaluate_static(source: &str) -> Result<Option<Value>> {
    Ok(analyze(source, None, &PseudoFunctions::new())?.value)
}

// ═══════════════════════════════════════════════════════════════════════════════
// ANALYZER
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
enum Piece {
    Lit(Value),
    Op(String),
    Code(String),
    /// Depth-0 `:` outside any ternary.
    Chain,
}

impl Piece {
    fn is_value(&self) -> bool {
        matches!(self, Piece::Lit(_) | Piece::Code(_))
    }

    fn render(&self) -> String {
        match self {
            Piece::Lit(value) => render_literal(value),
            Piece::Op(op) => op.clone(),
            Piece::Code(code) => code.clone(),
            Piece::Chain => ":".to_string(),
        }
    }
}

struct Analyzer<'a, 'r> {
    tokens: &'a [Token],
    pos: usize,
    resolver: Option<&'r mut dyn VariableResolver>,
    pseudo: &'a PseudoFunctions<'a>,
}

impl<'a, 'r> Analyzer<'a, 'r> {
    fn peek(&self) -> &'a Token {
        let index = self.pos.min(self.tokens.len().saturating_sub(1));
        &self.tokens[index]
    }

    fn peek_at(&self, ahead: usize) -> Option<&'a Token> {
        self.tokens.get(self.pos + ahead)
    }

    fn expect(&mut self, text: &str) -> Result<()> {
        let token = self.peek();
        if token.is_char(text) {
            self.pos += 1;
            Ok(())
        } else {
            Err(CompilerError::malformed(format!(
                "Expected '{}' at offset {}",
                text, token.offset
            )))
        }
    }

    /// Analyzes until one of `stops` (not consumed) or the end of input.
    fn expression(&mut self, stops: &[&str]) -> Result<Analysis> {
        let mut pieces: Vec<Piece> = Vec::new();
        let mut ternary = 0usize;

        loop {
            if self.tokens.is_empty() {
                break;
            }
            let token = self.peek();
            let piece = match token.kind {
                TokenKind::End => break,
                TokenKind::Char if stops.contains(&token.text.as_str()) => break,
                TokenKind::Char if token.text == " " => {
                    self.pos += 1;
                    continue;
                }
                TokenKind::Variable => {
                    self.pos += 1;
                    self.variable(&token.text[1..], false)?
                }
                TokenKind::Str => {
                    self.pos += 1;
                    self.string_literal(token)?
                }
                TokenKind::Number => {
                    self.pos += 1;
                    parse_number(&token.text)
                }
                TokenKind::Ident => {
                    self.pos += 1;
                    self.identifier(token)?
                }
                TokenKind::Char => match self.operator(token, &mut pieces, &mut ternary)? {
                    Some(piece) => piece,
                    None => continue,
                },
            };

            if piece.is_value() && pieces.last().map(Piece::is_value).unwrap_or(false) {
                return Err(CompilerError::malformed(format!(
                    "Missing operator before offset {}",
                    token.offset
                )));
            }
            pieces.push(piece);
        }

        if ternary != 0 {
            return Err(CompilerError::malformed("Incomplete ternary expression"));
        }
        self.finish(pieces)
    }

    fn variable(&mut self, name: &str, in_string: bool) -> Result<Piece> {
        match self.resolver.as_mut() {
            Some(resolver) => Ok(match resolver.resolve(name, in_string)? {
                Substitution::Code(code) => Piece::Code(code),
                Substitution::Literal(value) => Piece::Lit(value),
            }),
            None => Ok(Piece::Code(format!("${}", name))),
        }
    }

    fn identifier(&mut self, token: &Token) -> Result<Piece> {
        let name = token.text.as_str();
        match name {
            "true" => return Ok(Piece::Lit(Value::Bool(true))),
            "false" => return Ok(Piece::Lit(Value::Bool(false))),
            "null" => return Ok(Piece::Lit(Value::Null)),
            _ => {}
        }

        let is_call = self.peek().is_char("(");
        let is_function = self.pseudo.contains_key(name)
            || builtins::is_compile_time(name)
            || builtins::is_runtime_only(name);

        if is_call && is_function {
            self.pos += 1;
            return self.call(name);
        }
        if DENIED_KEYWORDS.contains(name) {
            return Err(CompilerError::forbidden(format!(
                "'{}' is not allowed in template expressions",
                name
            )));
        }
        if is_call {
            return Err(CompilerError::new(
                ErrorKind::UnknownOrForbiddenFunction,
                format!("{}() is not an allowed function", name),
            ));
        }
        Err(CompilerError::forbidden(format!(
            "Bare identifier '{}' is not allowed; variables are written as ${}",
            name, name
        )))
    }

    fn call(&mut self, name: &str) -> Result<Piece> {
        let args = self.arguments()?;
        let values: Option<Vec<Value>> = args.iter().map(|a| a.value.clone()).collect();
        let codes: Vec<&str> = args.iter().map(|a| a.code.as_str()).collect();
        let runtime_call = format!("$rt.fn.{}({})", name, codes.join(", "));

        if let Some(entry) = self.pseudo.get(name) {
            return match entry {
                Some(handler) => match values {
                    Some(values) => Ok(Piece::Lit(handler(&values)?)),
                    None => Err(CompilerError::forbidden(format!(
                        "{}() only accepts compile-time constant arguments",
                        name
                    ))),
                },
                None => {
                    let mut parts = vec![render_literal(&Value::String(name.to_string()))];
                    parts.extend(codes.iter().map(|c| c.to_string()));
                    Ok(Piece::Code(format!("$rt.call({})", parts.join(", "))))
                }
            };
        }

        if builtins::is_compile_time(name) {
            if let Some(values) = values {
                if let Some(value) = builtins::call(name, &values)? {
                    return Ok(Piece::Lit(value));
                }
            }
            return Ok(Piece::Code(runtime_call));
        }

        Ok(Piece::Code(runtime_call))
    }

    fn arguments(&mut self) -> Result<Vec<Analysis>> {
        let mut args = Vec::new();
        if self.peek().is_char(")") {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            args.push(self.expression(&[",", ")"])?);
            let token = self.peek();
            if token.is_char(",") {
                self.pos += 1;
            } else if token.is_char(")") {
                self.pos += 1;
                return Ok(args);
            } else {
                return Err(CompilerError::malformed("Unclosed function call"));
            }
        }
    }

    /// Returns `None` when the token was merged into an existing piece.
    fn operator(
        &mut self,
        token: &'a Token,
        pieces: &mut Vec<Piece>,
        ternary: &mut usize,
    ) -> Result<Option<Piece>> {
        let after_value = pieces.last().map(Piece::is_value).unwrap_or(false);
        let op = token.text.as_str();
        self.pos += 1;

        match op {
            "(" => {
                if after_value {
                    return Err(CompilerError::new(
                        ErrorKind::UnknownOrForbiddenFunction,
                        "Only allow-listed functions may be called",
                    ));
                }
                let inner = self.expression(&[")"])?;
                self.expect(")")?;
                Ok(Some(match inner.value {
                    Some(value) => Piece::Lit(value),
                    None => Piece::Code(format!("({})", inner.code)),
                }))
            }
            "[" if after_value => {
                let inner = self.expression(&["]"])?;
                self.expect("]")?;
                let target = pieces.pop().map(|p| p.render()).unwrap_or_default();
                pieces.push(Piece::Code(format!("{}?.[{}]", target, inner.code)));
                Ok(None)
            }
            "[" => self.array_literal().map(Some),
            "?." if after_value && self.peek().is_char("[") => Ok(None),
            "." | "?." | "!" if after_value && self.peek().kind == TokenKind::Ident => {
                self.member(pieces)?;
                Ok(None)
            }
            "." | "?." => Err(CompilerError::malformed(format!(
                "Member access without a target at offset {}",
                token.offset
            ))),
            "?" => {
                *ternary += 1;
                Ok(Some(Piece::Op("?".into())))
            }
            ":" if *ternary > 0 => {
                *ternary -= 1;
                Ok(Some(Piece::Op(":".into())))
            }
            ":" => Ok(Some(Piece::Chain)),
            "=" | "+=" | "-=" | "*=" | "/=" | "%=" | "**=" | "<<=" | ">>=" | ">>>=" | "&="
            | "|=" | "^=" | "&&=" | "||=" | "??=" | "++" | "--" => Err(CompilerError::new(
                ErrorKind::AssignmentForbidden,
                format!("'{}' would assign a value", op),
            )),
            "`" | "@" => Err(CompilerError::new(
                ErrorKind::OperatorForbidden,
                format!("'{}' is not allowed in template expressions", op),
            )),
            ";" | "{" | "}" | "=>" | "..." | "," | "#" => Err(CompilerError::forbidden(format!(
                "'{}' is not allowed in template expressions",
                op
            ))),
            ")" | "]" => Err(unexpected(token)),
            "+" | "-" | "*" | "/" | "%" | "**" | "==" | "!=" | "===" | "!==" | "<" | ">"
            | "<=" | ">=" | "&&" | "||" | "??" | "!" | "&" | "|" | "^" | "~" | "<<" | ">>"
            | ">>>" => Ok(Some(Piece::Op(op.to_string()))),
            _ => Err(unexpected(token)),
        }
    }

    /// `value!name`, `value.name` and `value?.name`, all emitted null-safe.
    fn member(&mut self, pieces: &mut Vec<Piece>) -> Result<()> {
        let name = self.peek().text.clone();
        self.pos += 1;

        if DENIED_MEMBERS.contains(name.as_str()) {
            return Err(CompilerError::forbidden(format!(
                "Member '{}' is not accessible",
                name
            )));
        }
        if self.peek().is_char("(") {
            return Err(CompilerError::new(
                ErrorKind::UnknownOrForbiddenFunction,
                format!("Method call .{}() is not allowed", name),
            ));
        }

        let Some(target) = pieces.pop() else {
            return Err(CompilerError::malformed("Member access without a target"));
        };
        let folded = match (&target, name.as_str()) {
            (Piece::Lit(Value::Object(map)), _) => {
                Some(map.get(&name).cloned().unwrap_or(Value::Null))
            }
            (Piece::Lit(Value::Array(items)), "length") => Some(Value::from(items.len() as u64)),
            (Piece::Lit(Value::String(s)), "length") => {
                Some(Value::from(s.encode_utf16().count() as u64))
            }
            _ => None,
        };
        pieces.push(match folded {
            Some(value) => Piece::Lit(value),
            None => Piece::Code(format!("{}?.{}", target.render(), name)),
        });
        Ok(())
    }

    fn array_literal(&mut self) -> Result<Piece> {
        let mut items = Vec::new();
        if self.peek().is_char("]") {
            self.pos += 1;
            return Ok(Piece::Lit(Value::Array(Vec::new())));
        }
        loop {
            items.push(self.expression(&[",", "]"])?);
            let token = self.peek();
            if token.is_char(",") {
                self.pos += 1;
            } else if token.is_char("]") {
                self.pos += 1;
                break;
            } else {
                return Err(CompilerError::malformed("Unclosed array literal"));
            }
        }

        let values: Option<Vec<Value>> = items.iter().map(|i| i.value.clone()).collect();
        Ok(match values {
            Some(values) => Piece::Lit(Value::Array(values)),
            None => {
                let codes: Vec<&str> = items.iter().map(|i| i.code.as_str()).collect();
                Piece::Code(format!("[{}]", codes.join(", ")))
            }
        })
    }

    fn string_literal(&mut self, token: &Token) -> Result<Piece> {
        let raw = &token.text;
        let quote = raw.chars().next().unwrap_or('\'');
        let body = &raw[1..raw.len() - 1];
        let interpolate = quote == '"';

        let mut parts: Vec<Piece> = Vec::new();
        let mut current = String::new();
        let mut chars = body.char_indices().peekable();

        while let Some((i, c)) = chars.next() {
            if c == '\\' {
                decode_escape(&mut chars, &mut current)?;
                continue;
            }
            let starts_name = body[i + 1..]
                .chars()
                .next()
                .map(|n| n.is_ascii_alphabetic() || n == '_')
                .unwrap_or(false);
            if interpolate && c == '$' && starts_name {
                let name: String = body[i + 1..]
                    .chars()
                    .take_while(|n| n.is_ascii_alphanumeric() || *n == '_')
                    .collect();
                for _ in 0..name.len() {
                    chars.next();
                }
                match self.variable(&name, true)? {
                    Piece::Lit(value) => current.push_str(&template_string(&value)),
                    other => {
                        if !current.is_empty() {
                            parts.push(Piece::Lit(Value::String(std::mem::take(&mut current))));
                        }
                        parts.push(other);
                    }
                }
                continue;
            }
            current.push(c);
        }

        if parts.is_empty() {
            return Ok(Piece::Lit(Value::String(current)));
        }
        if !current.is_empty() {
            parts.push(Piece::Lit(Value::String(current)));
        }
        let rendered: Vec<String> = parts.iter().map(Piece::render).collect();
        Ok(Piece::Code(format!("$rt.concat({})", rendered.join(", "))))
    }

    /// Splits a necklace chain and folds what can be folded.
    fn finish(&mut self, pieces: Vec<Piece>) -> Result<Analysis> {
        if pieces.is_empty() {
            return Err(CompilerError::malformed("Empty expression"));
        }

        let segments: Vec<&[Piece]> = pieces.split(|p| matches!(p, Piece::Chain)).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(CompilerError::malformed("Empty operand in ':' chain"));
        }
        if segments.len() == 1 {
            return Ok(fold(segments[0]));
        }

        let mut kept: Vec<Analysis> = Vec::new();
        let count = segments.len();
        for (index, segment) in segments.into_iter().enumerate() {
            let analysis = fold(segment);
            match &analysis.value {
                Some(value) if template_truthy(value) => {
                    kept.push(analysis);
                    break;
                }
                Some(_) if index + 1 < count => {}
                _ => kept.push(analysis),
            }
        }

        if kept.len() == 1 {
            if let Some(only) = kept.pop() {
                return Ok(only);
            }
        }
        let thunks: Vec<String> = kept
            .iter()
            .map(|a| format!("() => ({})", a.code))
            .collect();
        Ok(Analysis::residual(format!("$rt.chain({})", thunks.join(", "))))
    }
}

fn fold(pieces: &[Piece]) -> Analysis {
    let all_known = pieces.iter().all(|p| matches!(p, Piece::Lit(_) | Piece::Op(_)));
    if all_known {
        if let Some(value) = Evaluator::run(pieces) {
            return Analysis::literal(value);
        }
    }
    let rendered: Vec<String> = pieces.iter().map(Piece::render).collect();
    Analysis::residual(rendered.join(" "))
}

fn unexpected(token: &Token) -> CompilerError {
    if token.is_char(",") {
        return CompilerError::forbidden("The comma operator is not allowed");
    }
    CompilerError::malformed(format!(
        "Unexpected '{}' at offset {}",
        token.text, token.offset
    ))
}

fn parse_number(text: &str) -> Piece {
    let parsed = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok().map(Value::from)
    } else {
        text.parse::<f64>().ok().and_then(number_value)
    };
    match parsed {
        Some(value) => Piece::Lit(value),
        None => Piece::Code(text.to_string()),
    }
}

fn decode_escape(
    chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>,
    out: &mut String,
) -> Result<()> {
    let Some((_, c)) = chars.next() else {
        return Err(CompilerError::malformed("Dangling '\\' in string literal"));
    };
    match c {
        'n' => out.push('\n'),
        't' => out.push('\t'),
        'r' => out.push('\r'),
        'b' => out.push('\u{8}'),
        'f' => out.push('\u{c}'),
        'v' => out.push('\u{b}'),
        '0' => out.push('\0'),
        '\n' => {}
        'x' => {
            let hex: String = (0..2).filter_map(|_| chars.next().map(|(_, h)| h)).collect();
            out.push(hex_char(&hex)?);
        }
        'u' => {
            let hex: String = if chars.peek().map(|(_, h)| *h == '{').unwrap_or(false) {
                chars.next();
                let mut digits = String::new();
                for (_, h) in chars.by_ref() {
                    if h == '}' {
                        break;
                    }
                    digits.push(h);
                }
                digits
            } else {
                (0..4).filter_map(|_| chars.next().map(|(_, h)| h)).collect()
            };
            out.push(hex_char(&hex)?);
        }
        other => out.push(other),
    }
    Ok(())
}

fn hex_char(hex: &str) -> Result<char> {
    u32::from_str_radix(hex, 16)
        .ok()
        .and_then(char::from_u32)
        .ok_or_else(|| CompilerError::malformed(format!("Invalid escape '{}'", hex)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// EVALUATOR
// ═══════════════════════════════════════════════════════════════════════════════

/// Pratt evaluator over literals and operators. `None` means "leave it to the runtime".
struct Evaluator<'p> {
    pieces: &'p [Piece],
    pos: usize,
}

impl<'p> Evaluator<'p> {
    fn run(pieces: &'p [Piece]) -> Option<Value> {
        let mut evaluator = Evaluator { pieces, pos: 0 };
        let value = evaluator.expr(0)?;
        if evaluator.pos == pieces.len() {
            Some(value)
        } else {
            None
        }
    }

    fn peek_op(&self) -> Option<&'p str> {
        match self.pieces.get(self.pos) {
            Some(Piece::Op(op)) => Some(op.as_str()),
            _ => None,
        }
    }

    fn expr(&mut self, min_bp: u8) -> Option<Value> {
        let first = self.pieces.get(self.pos)?;
        self.pos += 1;
        let mut lhs = match first {
            Piece::Lit(value) => value.clone(),
            Piece::Op(op) => {
                let operand = self.expr(17)?;
                match op.as_str() {
                    "!" => Value::Bool(!js_truthy(&operand)),
                    "-" => number_value(-to_number(&operand))?,
                    "+" => number_value(to_number(&operand))?,
                    _ => return None,
                }
            }
            _ => return None,
        };

        loop {
            if self.pos >= self.pieces.len() {
                break;
            }
            let op = self.peek_op()?;
            if op == ":" {
                break;
            }
            if op == "?" {
                if min_bp > 1 {
                    break;
                }
                self.pos += 1;
                let consequent = self.expr(0)?;
                if self.peek_op() != Some(":") {
                    return None;
                }
                self.pos += 1;
                let alternate = self.expr(1)?;
                lhs = if js_truthy(&lhs) { consequent } else { alternate };
                continue;
            }

            let (left_bp, right_bp) = binding_power(op)?;
            if left_bp < min_bp {
                break;
            }
            self.pos += 1;
            let rhs = self.expr(right_bp)?;
            lhs = apply_binary(op, lhs, rhs)?;
        }
        Some(lhs)
    }
}

fn binding_power(op: &str) -> Option<(u8, u8)> {
    Some(match op {
        "??" | "||" => (3, 4),
        "&&" => (5, 6),
        "==" | "!=" | "===" | "!==" => (9, 10),
        "<" | ">" | "<=" | ">=" => (11, 12),
        "+" | "-" => (13, 14),
        "*" | "/" | "%" => (15, 16),
        "**" => (18, 17),
        _ => return None,
    })
}

fn apply_binary(op: &str, lhs: Value, rhs: Value) -> Option<Value> {
    match op {
        "&&" => Some(if js_truthy(&lhs) { rhs } else { lhs }),
        "||" => Some(if js_truthy(&lhs) { lhs } else { rhs }),
        "??" => Some(if lhs.is_null() { rhs } else { lhs }),
        "==" => Some(Value::Bool(js_loose_equals(&lhs, &rhs))),
        "!=" => Some(Value::Bool(!js_loose_equals(&lhs, &rhs))),
        "===" => Some(Value::Bool(js_strict_equals(&lhs, &rhs))),
        "!==" => Some(Value::Bool(!js_strict_equals(&lhs, &rhs))),
        "<" | ">" | "<=" | ">=" => {
            let result = match js_compare(&lhs, &rhs) {
                None => false,
                Some(ordering) => match op {
                    "<" => ordering == Ordering::Less,
                    ">" => ordering == Ordering::Greater,
                    "<=" => ordering != Ordering::Greater,
                    _ => ordering != Ordering::Less,
                },
            };
            Some(Value::Bool(result))
        }
        "+" => js_add(&lhs, &rhs),
        _ => {
            let (a, b) = (to_number(&lhs), to_number(&rhs));
            let n = match op {
                "-" => a - b,
                "*" => a * b,
                "/" => a / b,
                "%" => a % b,
                "**" => a.powf(b),
                _ => return None,
            };
            number_value(n)
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// VALUE SEMANTICS
// ═══════════════════════════════════════════════════════════════════════════════

/// Integral values become integers so literals render without a fraction.
/// Non-finite numbers have no JSON literal and are never folded.
pub fn number_value(n: f64) -> Option<Value> {
    if !n.is_finite() {
        return None;
    }
    if n.fract() == 0.0 && n.abs() <= 9_007_199_254_740_992.0 {
        return Some(Value::from(n as i64));
    }
    Number::from_f64(n).map(Value::Number)
}

pub fn to_number(value: &Value) -> f64 {
    match value {
        Value::Null => 0.0,
        Value::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) => string_to_number(s),
        Value::Array(items) => match items.as_slice() {
            [] => 0.0,
            [only] => string_to_number(&js_string(only)),
            _ => f64::NAN,
        },
        Value::Object(_) => f64::NAN,
    }
}

fn string_to_number(s: &str) -> f64 {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return 0.0;
    }
    if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        return i64::from_str_radix(hex, 16)
            .map(|n| n as f64)
            .unwrap_or(f64::NAN);
    }
    match trimmed {
        "Infinity" | "+Infinity" => return f64::INFINITY,
        "-Infinity" => return f64::NEG_INFINITY,
        _ => {}
    }
    let numeric = trimmed
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'));
    if !numeric {
        return f64::NAN;
    }
    trimmed.parse::<f64>().unwrap_or(f64::NAN)
}

pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if n == 0.0 {
        return "0".to_string();
    }
    let magnitude = n.abs();
    if magnitude >= 1e21 || magnitude < 1e-6 {
        let formatted = format!("{:e}", n);
        return match formatted.split_once('e') {
            Some((mantissa, exponent)) if !exponent.starts_with('-') => {
                format!("{}e+{}", mantissa, exponent)
            }
            _ => formatted,
        };
    }
    if n.fract() == 0.0 {
        return format!("{:.0}", n);
    }
    format!("{}", n)
}

/// `String(value)` in JavaScript.
pub fn js_string(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => format_number(n.as_f64().unwrap_or(f64::NAN)),
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|item| if item.is_null() { String::new() } else { js_string(item) })
            .collect::<Vec<_>>()
            .join(","),
        Value::Object(_) => "[object Object]".to_string(),
    }
}

/// Output form: `null` and `false` print nothing, `true` prints `1`.
pub fn template_string(value: &Value) -> String {
    match value {
        Value::Null | Value::Bool(false) => String::new(),
        Value::Bool(true) => "1".to_string(),
        other => js_string(other),
    }
}

pub fn js_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Like JavaScript truthiness, except that empty arrays and objects are false.
pub fn template_truthy(value: &Value) -> bool {
    match value {
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        other => js_truthy(other),
    }
}

fn to_primitive(value: &Value) -> Value {
    match value {
        Value::Array(_) | Value::Object(_) => Value::String(js_string(value)),
        other => other.clone(),
    }
}

fn js_add(lhs: &Value, rhs: &Value) -> Option<Value> {
    let (a, b) = (to_primitive(lhs), to_primitive(rhs));
    if a.is_string() || b.is_string() {
        return Some(Value::String(js_string(&a) + &js_string(&b)));
    }
    number_value(to_number(&a) + to_number(&b))
}

pub fn js_strict_equals(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::String(a), Value::String(b)) => a == b,
        _ => false,
    }
}

pub fn js_loose_equals(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Array(_) | Value::Object(_), Value::Array(_) | Value::Object(_)) => false,
        (Value::Bool(_), _) | (_, Value::Bool(_)) => {
            let a = number_value(to_number(lhs)).unwrap_or(Value::Null);
            let b = number_value(to_number(rhs)).unwrap_or(Value::Null);
            !a.is_null() && !b.is_null() && js_loose_equals(&a, &b)
        }
        (Value::Array(_) | Value::Object(_), _) | (_, Value::Array(_) | Value::Object(_)) => {
            js_loose_equals(&to_primitive(lhs), &to_primitive(rhs))
        }
        (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
            to_number(lhs) == to_number(rhs)
        }
        _ => js_strict_equals(lhs, rhs),
    }
}

fn js_compare(lhs: &Value, rhs: &Value) -> Option<Ordering> {
    let (a, b) = (to_primitive(lhs), to_primitive(rhs));
    if let (Value::String(a), Value::String(b)) = (&a, &b) {
        return Some(a.encode_utf16().cmp(b.encode_utf16()));
    }
    to_number(&a).partial_cmp(&to_number(&b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fold_value(source: &str) -> Option<Value> {
        evaluate_static(source).unwrap()
    }

    #[test]
    fn test_js_arithmetic_and_concatenation() {
        assert_eq!(fold_value("1 + 2 * 3"), Some(json!(7)));
        assert_eq!(fold_value("2 ** 3 ** 2"), Some(json!(512)));
        assert_eq!(fold_value("'a' + 1 + 2"), Some(json!("a12")));
        assert_eq!(fold_value("1 + 2 + 'a'"), Some(json!("3a")));
        assert_eq!(fold_value("7 % 4 - 0.5"), Some(json!(2.5)));
        assert_eq!(fold_value("[1, 2] + 1"), Some(json!("1,21")));
    }

    #[test]
    fn test_division_by_zero_stays_residual() {
        let analysis = analyze("1 / 0", None, &PseudoFunctions::new()).unwrap();
        assert!(!analysis.is_static());
        assert_eq!(analysis.code, "1 / 0");
    }

    #[test]
    fn test_logic_and_comparison() {
        assert_eq!(fold_value("1 < 2 && 'b' > 'a'"), Some(json!(true)));
        assert_eq!(fold_value("null ?? 'x'"), Some(json!("x")));
        assert_eq!(fold_value("0 || ''"), Some(json!("")));
        assert_eq!(fold_value("'1' == 1"), Some(json!(true)));
        assert_eq!(fold_value("'1' === 1"), Some(json!(false)));
        assert_eq!(fold_value("!0 ? 'y' : 'n'"), Some(json!("y")));
        assert_eq!(fold_value("false ? 1 : true ? 2 : 3"), Some(json!(2)));
    }

    #[test]
    fn test_number_formatting() {
        assert_eq!(format_number(1e21), "1e+21");
        assert_eq!(format_number(1e-7), "1e-7");
        assert_eq!(format_number(0.1 + 0.2), "0.30000000000000004");
        assert_eq!(format_number(-42.0), "-42");
    }

    #[test]
    fn test_truthiness() {
        assert!(js_truthy(&json!([])));
        assert!(!template_truthy(&json!([])));
        assert!(!template_truthy(&json!({})));
        assert!(!template_truthy(&json!("")));
        assert!(template_truthy(&json!("0")));
        assert_eq!(template_string(&json!(true)), "1");
        assert_eq!(template_string(&json!(null)), "");
    }

    #[test]
    fn test_negative_literal_renders_parenthesized() {
        let mut resolver =
            |_: &str, _: bool| -> Result<Substitution> { Ok(Substitution::Code("_x".into())) };
        let analysis = analyze("(0 - 2) ** $x", Some(&mut resolver), &PseudoFunctions::new())
            .unwrap();
        assert_eq!(analysis.code, "(-2) ** _x");
    }
}
