//! Expression tokenizer and interpolation splitting.
//!
//! Expressions use the JavaScript lexical grammar plus `$name` variables. Whitespace and
//! comments never survive tokenization, except for a single space between two
//! alphanumeric tokens so that `a b` can not turn into `ab` when tokens are re-joined.

use lazy_static::lazy_static;
use regex::Regex;

use crate::validate::{CompilerError, Result};

lazy_static! {
    static ref TOKEN_RE: Regex = Regex::new(concat!(
        r"^(?:",
        r"(?P<ws>\s+)",
        r"|(?P<comment>//[^\n]*|/\*(?s:.*?)\*/)",
        r"|(?P<var>\$[A-Za-z_][A-Za-z0-9_]*)",
        r"|(?P<num>0[xX][0-9a-fA-F]+|(?:[0-9]+\.?[0-9]*|\.[0-9]+)(?:[eE][+-]?[0-9]+)?)",
        r"|(?P<ident>[A-Za-z_][A-Za-z0-9_]*)",
        r#"|(?P<str>"(?:[^"\\]|\\.)*"|'(?:[^'\\]|\\.)*')"#,
        r"|(?P<op>>>>=|===|!==|\*\*=|<<=|>>=|>>>|\?\?=|&&=|\|\|=|\.\.\.",
        r"|=>|==|!=|<=|>=|&&|\|\||\?\?|\?\.|\+\+|--|\+=|-=|\*=|/=|%=|&=|\|=|\^=|\*\*|<<|>>",
        r"|[-+*/%<>=!?:.,;()\[\]{}&|^~@`#])",
        r")"
    ))
    .unwrap();
    static ref INTERPOLATED_VAR_RE: Regex =
        Regex::new(r"^\$[A-Za-z_][A-Za-z0-9_]*(?:![A-Za-z_][A-Za-z0-9_]*)*").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Variable,
    Str,
    Number,
    Ident,
    Char,
    End,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Verbatim source text.
    pub text: String,
    pub offset: usize,
}

impl Token {
    pub fn new(kind: TokenKind, text: impl Into<String>, offset: usize) -> Self {
        Token {
            kind,
            text: text.into(),
            offset,
        }
    }

    pub fn is_char(&self, text: &str) -> bool {
        self.kind == TokenKind::Char && self.text == text
    }

    fn is_alphanumeric(&self) -> bool {
        matches!(
            self.kind,
            TokenKind::Variable | TokenKind::Number | TokenKind::Ident
        )
    }
}

pub fn tokenize(source: &str) -> Result<Vec<Token>> {
    let mut tokens: Vec<Token> = Vec::new();
    let mut pos = 0;
    let mut pending_space = false;

    while pos < source.len() {
        let rest = &source[pos..];
        let Some(caps) = TOKEN_RE.captures(rest) else {
            return Err(lex_error(rest, pos));
        };
        let Some(whole) = caps.get(0) else {
            return Err(lex_error(rest, pos));
        };
        let mut text = whole.as_str();

        if caps.name("ws").is_some() || caps.name("comment").is_some() {
            pending_space = true;
            pos += text.len();
            continue;
        }

        let kind = if caps.name("var").is_some() {
            TokenKind::Variable
        } else if caps.name("num").is_some() {
            TokenKind::Number
        } else if caps.name("ident").is_some() {
            TokenKind::Ident
        } else if caps.name("str").is_some() {
            TokenKind::Str
        } else {
            if text == "/" && rest.starts_with("/*") {
                return Err(CompilerError::malformed(format!(
                    "Unterminated comment at offset {}",
                    pos
                )));
            }
            // `a?.5:1` is a ternary, not optional chaining
            if text == "?." && rest[2..].starts_with(|c: char| c.is_ascii_digit()) {
                text = "?";
            }
            TokenKind::Char
        };

        let token = Token::new(kind, text, pos);
        if pending_space
            && token.is_alphanumeric()
            && tokens.last().map(Token::is_alphanumeric).unwrap_or(false)
        {
            tokens.push(Token::new(TokenKind::Char, " ", pos));
        }
        pending_space = false;
        pos += text.len();
        tokens.push(token);
    }

    tokens.push(Token::new(TokenKind::End, "", source.len()));
    Ok(tokens)
}

fn lex_error(rest: &str, pos: usize) -> CompilerError {
    let ch = rest.chars().next().unwrap_or(' ');
    if ch == '"' || ch == '\'' {
        CompilerError::malformed(format!("Unterminated string literal at offset {}", pos))
    } else if ch == '$' {
        CompilerError::malformed(format!("Invalid variable name at offset {}", pos))
    } else {
        CompilerError::malformed(format!("Unexpected character '{}' at offset {}", ch, pos))
    }
}

/// Joins token texts back into expression source.
pub fn render_tokens(tokens: &[Token]) -> String {
    tokens
        .iter()
        .filter(|t| t.kind != TokenKind::End)
        .map(|t| t.text.as_str())
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════════════
// INTERPOLATION
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Literal(String),
    /// Expression source, without the surrounding braces.
    Expr(String),
}

impl Segment {
    pub fn is_expr(&self) -> bool {
        matches!(self, Segment::Expr(_))
    }
}

/// Splits text or an attribute value into literal runs and `$name` / `{expr}` expressions.
pub fn split_interpolations(text: &str) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut i = 0;

    while i < text.len() {
        let rest = &text[i..];
        let Some(c) = rest.chars().next() else { break };

        if c == '\\' && (rest[1..].starts_with('$') || rest[1..].starts_with('{')) {
            literal.push_str(&rest[1..2]);
            i += 2;
            continue;
        }

        if c == '$' {
            if let Some(m) = INTERPOLATED_VAR_RE.find(rest) {
                flush_literal(&mut segments, &mut literal);
                segments.push(Segment::Expr(m.as_str().to_string()));
                i += m.end();
                continue;
            }
        }

        if c == '{' {
            let opens_expression = rest[1..]
                .chars()
                .next()
                .map(|next| !next.is_whitespace() && next != '}')
                .unwrap_or(false);
            if opens_expression {
                let end = find_balanced_brace_end(rest).ok_or_else(|| {
                    CompilerError::malformed(format!("Unclosed '{{' in \"{}\"", text))
                })?;
                flush_literal(&mut segments, &mut literal);
                segments.push(Segment::Expr(rest[1..end - 1].to_string()));
                i += end;
                continue;
            }
        }

        literal.push(c);
        i += c.len_utf8();
    }

    flush_literal(&mut segments, &mut literal);
    Ok(segments)
}

fn flush_literal(segments: &mut Vec<Segment>, literal: &mut String) {
    if !literal.is_empty() {
        segments.push(Segment::Literal(std::mem::take(literal)));
    }
}

/// Byte offset just past the `}` closing the `{` at the start of `text`.
/// Braces inside string literals do not count.
fn find_balanced_brace_end(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string: Option<char> = None;
    let mut chars = text.char_indices();

    while let Some((i, c)) = chars.next() {
        if c == '\\' {
            chars.next();
            continue;
        }

        if let Some(quote) = in_string {
            if c == quote {
                in_string = None;
            }
            continue;
        }

        match c {
            '"' | '\'' => in_string = Some(c),
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(tokens: &[Token]) -> Vec<(TokenKind, &str)> {
        tokens.iter().map(|t| (t.kind, t.text.as_str())).collect()
    }

    #[test]
    fn test_space_only_between_alphanumerics() {
        let tokens = tokenize("a  b + /* c */ $x").unwrap();
        assert_eq!(
            kinds(&tokens),
            vec![
                (TokenKind::Ident, "a"),
                (TokenKind::Char, " "),
                (TokenKind::Ident, "b"),
                (TokenKind::Char, "+"),
                (TokenKind::Variable, "$x"),
                (TokenKind::End, ""),
            ]
        );
    }

    #[test]
    fn test_longest_operator_wins() {
        let tokens = tokenize("$a === $b ?? 1").unwrap();
        assert_eq!(tokens[1].text, "===");
        assert_eq!(tokens[3].text, "??");
    }

    #[test]
    fn test_ternary_with_fraction_is_not_optional_chain() {
        let tokens = tokenize("$a?.5:1").unwrap();
        assert_eq!(tokens[1].text, "?");
        assert_eq!(tokens[2].text, ".5");
    }

    #[test]
    fn test_lexer_failures() {
        assert!(tokenize("'open").is_err());
        assert!(tokenize("1 /* open").is_err());
        assert!(tokenize("a \u{00a7} b").is_err());
    }

    #[test]
    fn test_split_interpolations() {
        let segments = split_interpolations("Hi $user!name, {1 + 2} \\$x { y} {}").unwrap();
        assert_eq!(
            segments,
            vec![
                Segment::Literal("Hi ".into()),
                Segment::Expr("$user!name".into()),
                Segment::Literal(", ".into()),
                Segment::Expr("1 + 2".into()),
                Segment::Literal(" $x { y} {}".into()),
            ]
        );
    }

    #[test]
    fn test_braces_inside_strings() {
        let segments = split_interpolations("{'}' + \"{\"}").unwrap();
        assert_eq!(segments, vec![Segment::Expr("'}' + \"{\"".into())]);
        assert!(split_interpolations("{open").is_err());
    }
}
