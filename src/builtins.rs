//! Sandbox of functions reachable from template expressions.
//!
//! Only the pure functions registered here can run at compile time. Runtime-only functions
//! are always deferred to `$rt.fn`, and everything else is rejected by the analyzer.

use lazy_static::lazy_static;
use serde_json::{Map, Value};
use std::collections::HashSet;

use crate::static_eval::{
    js_loose_equals, js_string, number_value, template_string, template_truthy, to_number,
};
use crate::validate::{CompilerError, Result};

type Builtin = fn(&[Value]) -> Result<Option<Value>>;

lazy_static! {
    pub static ref RUNTIME_ONLY_FUNCTIONS: HashSet<&'static str> =
        ["now", "date", "random", "uniqid", "translate", "route"].into_iter().collect();

    /// Keywords and host primitives that may never appear, neither bare nor called.
    pub static ref DENIED_KEYWORDS: HashSet<&'static str> = [
        "new", "function", "class", "var", "let", "const", "if", "else", "for", "while", "do",
        "return", "import", "export", "eval", "this", "delete", "void", "yield", "await",
        "typeof", "instanceof", "in", "of", "with", "throw", "try", "catch", "finally",
        "switch", "case", "default", "break", "continue", "debugger", "super", "extends",
        "async", "static", "arguments", "require", "include", "include_once",
        "require_once", "echo", "print", "exit", "die", "globalThis", "window", "document",
        "process", "Function", "setTimeout", "setInterval", "fetch",
    ]
    .into_iter()
    .collect();

    /// Member names that reach the prototype chain.
    pub static ref DENIED_MEMBERS: HashSet<&'static str> = [
        "constructor", "prototype", "__proto__", "__defineGetter__", "__defineSetter__",
        "__lookupGetter__", "__lookupSetter__", "caller", "callee", "arguments",
    ]
    .into_iter()
    .collect();
}

fn lookup(name: &str) -> Option<Builtin> {
    let f: Builtin = match name {
        "lower" => |a| string_op(a, "lower", |s| s.to_lowercase()),
        "upper" => |a| string_op(a, "upper", |s| s.to_uppercase()),
        "ucfirst" => |a| string_op(a, "ucfirst", ucfirst),
        "trim" => |a| string_op(a, "trim", |s| s.trim().to_string()),
        "ltrim" => |a| string_op(a, "ltrim", |s| s.trim_start().to_string()),
        "rtrim" => |a| string_op(a, "rtrim", |s| s.trim_end().to_string()),
        "len" => len,
        "count" => count,
        "substr" => substr,
        "replace" => replace,
        "contains" => contains,
        "starts_with" => starts_with,
        "ends_with" => ends_with,
        "split" => split,
        "join" => join,
        "concat" => concat,
        "min" => |a| extreme(a, "min", |x, y| x < y),
        "max" => |a| extreme(a, "max", |x, y| x > y),
        "abs" => |a| numeric_op(a, "abs", f64::abs),
        "round" => round,
        "floor" => |a| numeric_op(a, "floor", f64::floor),
        "ceil" => |a| numeric_op(a, "ceil", f64::ceil),
        "int" => int,
        "float" => float,
        "str" => |a| Ok(Some(Value::String(template_string(arg(a, 0, "str")?)))),
        "bool" => |a| Ok(Some(Value::Bool(template_truthy(arg(a, 0, "bool")?)))),
        "escape" => |a| string_op(a, "escape", html_escape),
        "url_encode" => |a| string_op(a, "url_encode", url_encode),
        "json" => json,
        "number_format" => number_format,
        "pad_left" => pad_left,
        "repeat" => repeat,
        "in_array" => in_array,
        "default" => default,
        "fill_keys" => fill_keys,
        _ => return None,
    };
    Some(f)
}

pub fn is_compile_time(name: &str) -> bool {
    lookup(name).is_some()
}

pub fn is_runtime_only(name: &str) -> bool {
    RUNTIME_ONLY_FUNCTIONS.contains(name)
}

/// Runs a compile-time function. `Ok(None)` means the call can not be folded and must stay
/// residual.
pub fn call(name: &str, args: &[Value]) -> Result<Option<Value>> {
    match lookup(name) {
        Some(f) => f(args),
        None => Err(CompilerError::new(
            crate::validate::ErrorKind::UnknownOrForbiddenFunction,
            format!("{}() is not a compile-time function", name),
        )),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ARGUMENT HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

fn arg<'a>(args: &'a [Value], index: usize, name: &str) -> Result<&'a Value> {
    args.get(index).ok_or_else(|| {
        CompilerError::malformed(format!("{}() expects at least {} argument(s)", name, index + 1))
    })
}

fn opt_arg(args: &[Value], index: usize) -> Option<&Value> {
    args.get(index)
}

fn string_op(args: &[Value], name: &str, f: impl Fn(&str) -> String) -> Result<Option<Value>> {
    let s = template_string(arg(args, 0, name)?);
    Ok(Some(Value::String(f(&s))))
}

fn numeric_op(args: &[Value], name: &str, f: impl Fn(f64) -> f64) -> Result<Option<Value>> {
    let n = to_number(arg(args, 0, name)?);
    Ok(number_value(f(n)))
}

fn ucfirst(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

pub fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn url_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

/// Longest string `pad_left` and `repeat` build at compile time. Longer results are left
/// to the runtime.
const MAX_FOLDED_LENGTH: usize = 10_000;

/// Truncated integer argument. NaN is 0, infinities and huge values saturate.
fn index_arg(value: &Value) -> i64 {
    let n = to_number(value);
    if n.is_nan() {
        0
    } else {
        n.trunc() as i64
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// FUNCTIONS
// ═══════════════════════════════════════════════════════════════════════════════

fn len(args: &[Value]) -> Result<Option<Value>> {
    let n = match arg(args, 0, "len")? {
        Value::Null => 0,
        Value::String(s) => s.chars().count(),
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
        other => template_string(other).chars().count(),
    };
    Ok(Some(Value::from(n as u64)))
}

fn count(args: &[Value]) -> Result<Option<Value>> {
    let n = match arg(args, 0, "count")? {
        Value::Null => 0,
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
        _ => 1,
    };
    Ok(Some(Value::from(n as u64)))
}

fn substr(args: &[Value]) -> Result<Option<Value>> {
    let chars: Vec<char> = template_string(arg(args, 0, "substr")?).chars().collect();
    let total = chars.len() as i64;
    let start = index_arg(arg(args, 1, "substr")?);
    let start = if start < 0 {
        total.saturating_add(start).max(0)
    } else {
        start.min(total)
    };
    let end = match opt_arg(args, 2) {
        Some(length) => {
            let length = index_arg(length);
            if length < 0 {
                total.saturating_add(length).max(start)
            } else {
                start.saturating_add(length).min(total)
            }
        }
        None => total,
    };
    let out: String = chars[start as usize..end as usize].iter().collect();
    Ok(Some(Value::String(out)))
}

fn replace(args: &[Value]) -> Result<Option<Value>> {
    let subject = template_string(arg(args, 0, "replace")?);
    let search = template_string(arg(args, 1, "replace")?);
    let replacement = template_string(arg(args, 2, "replace")?);
    if search.is_empty() {
        return Ok(Some(Value::String(subject)));
    }
    Ok(Some(Value::String(subject.replace(&search, &replacement))))
}

fn contains(args: &[Value]) -> Result<Option<Value>> {
    let haystack = arg(args, 0, "contains")?;
    let needle = arg(args, 1, "contains")?;
    let found = match haystack {
        Value::Array(items) => items.iter().any(|item| js_loose_equals(item, needle)),
        Value::Object(map) => map.contains_key(&template_string(needle)),
        other => template_string(other).contains(&template_string(needle)),
    };
    Ok(Some(Value::Bool(found)))
}

fn starts_with(args: &[Value]) -> Result<Option<Value>> {
    let s = template_string(arg(args, 0, "starts_with")?);
    let prefix = template_string(arg(args, 1, "starts_with")?);
    Ok(Some(Value::Bool(s.starts_with(&prefix))))
}

fn ends_with(args: &[Value]) -> Result<Option<Value>> {
    let s = template_string(arg(args, 0, "ends_with")?);
    let suffix = template_string(arg(args, 1, "ends_with")?);
    Ok(Some(Value::Bool(s.ends_with(&suffix))))
}

fn split(args: &[Value]) -> Result<Option<Value>> {
    let s = template_string(arg(args, 0, "split")?);
    let separator = template_string(arg(args, 1, "split")?);
    let parts: Vec<Value> = if s.is_empty() {
        Vec::new()
    } else if separator.is_empty() {
        s.chars().map(|c| Value::String(c.to_string())).collect()
    } else {
        s.split(separator.as_str())
            .map(|part| Value::String(part.to_string()))
            .collect()
    };
    Ok(Some(Value::Array(parts)))
}

fn join(args: &[Value]) -> Result<Option<Value>> {
    let separator = opt_arg(args, 1)
        .map(template_string)
        .unwrap_or_else(|| ",".to_string());
    let joined = match arg(args, 0, "join")? {
        Value::Array(items) => items
            .iter()
            .map(template_string)
            .collect::<Vec<_>>()
            .join(&separator),
        Value::Object(map) => map
            .values()
            .map(template_string)
            .collect::<Vec<_>>()
            .join(&separator),
        other => template_string(other),
    };
    Ok(Some(Value::String(joined)))
}

fn concat(args: &[Value]) -> Result<Option<Value>> {
    if let Some(Value::Array(first)) = args.first() {
        let mut out = first.clone();
        for value in &args[1..] {
            match value {
                Value::Array(items) => out.extend(items.iter().cloned()),
                other => out.push(other.clone()),
            }
        }
        return Ok(Some(Value::Array(out)));
    }
    Ok(Some(Value::String(args.iter().map(template_string).collect())))
}

fn extreme(args: &[Value], name: &str, better: fn(f64, f64) -> bool) -> Result<Option<Value>> {
    let values: Vec<&Value> = match args {
        [Value::Array(items)] => items.iter().collect(),
        _ => args.iter().collect(),
    };
    if values.is_empty() {
        return Err(CompilerError::malformed(format!(
            "{}() expects at least 1 argument(s)",
            name
        )));
    }
    let mut best = to_number(values[0]);
    for value in &values[1..] {
        let n = to_number(value);
        if n.is_nan() || better(n, best) {
            best = n;
        }
    }
    Ok(number_value(best))
}

fn round(args: &[Value]) -> Result<Option<Value>> {
    let n = to_number(arg(args, 0, "round")?);
    let precision = opt_arg(args, 1).map(index_arg).unwrap_or(0).clamp(-15, 15) as i32;
    let factor = 10f64.powi(precision);
    // half away from zero
    let rounded = (n * factor).abs().round().copysign(n) / factor;
    Ok(number_value(rounded))
}

fn int(args: &[Value]) -> Result<Option<Value>> {
    let n = to_number(arg(args, 0, "int")?);
    let truncated = if n.is_finite() { n.trunc() } else { 0.0 };
    Ok(number_value(truncated))
}

fn float(args: &[Value]) -> Result<Option<Value>> {
    let n = to_number(arg(args, 0, "float")?);
    Ok(number_value(if n.is_nan() { 0.0 } else { n }))
}

fn json(args: &[Value]) -> Result<Option<Value>> {
    let value = arg(args, 0, "json")?;
    let text = serde_json::to_string(value)
        .map_err(|e| CompilerError::malformed(format!("json() failed: {}", e)))?;
    Ok(Some(Value::String(text)))
}

fn number_format(args: &[Value]) -> Result<Option<Value>> {
    let n = to_number(arg(args, 0, "number_format")?);
    if !n.is_finite() {
        return Ok(None);
    }
    let decimals = opt_arg(args, 1).map(index_arg).unwrap_or(0).clamp(0, 20) as usize;
    let point = opt_arg(args, 2)
        .map(template_string)
        .unwrap_or_else(|| ".".to_string());
    let thousands = opt_arg(args, 3)
        .map(template_string)
        .unwrap_or_else(|| ",".to_string());

    let fixed = format!("{:.*}", decimals, n.abs());
    let (whole, fraction) = fixed.split_once('.').unwrap_or((fixed.as_str(), ""));
    let mut grouped = String::new();
    for (i, digit) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push_str(&thousands);
        }
        grouped.push(digit);
    }
    let mut out = String::new();
    if n < 0.0 && fixed.chars().any(|c| c.is_ascii_digit() && c != '0') {
        out.push('-');
    }
    out.push_str(&grouped);
    if decimals > 0 {
        out.push_str(&point);
        out.push_str(fraction);
    }
    Ok(Some(Value::String(out)))
}

fn pad_left(args: &[Value]) -> Result<Option<Value>> {
    let s = template_string(arg(args, 0, "pad_left")?);
    let width = index_arg(arg(args, 1, "pad_left")?);
    if width > MAX_FOLDED_LENGTH as i64 {
        return Ok(None);
    }
    let width = width.max(0) as usize;
    let pad = opt_arg(args, 2)
        .map(template_string)
        .unwrap_or_else(|| " ".to_string());
    let current = s.chars().count();
    if pad.is_empty() || current >= width {
        return Ok(Some(Value::String(s)));
    }
    let padding: String = pad.chars().cycle().take(width - current).collect();
    Ok(Some(Value::String(padding + &s)))
}

fn repeat(args: &[Value]) -> Result<Option<Value>> {
    let s = template_string(arg(args, 0, "repeat")?);
    let times = index_arg(arg(args, 1, "repeat")?);
    if times < 0 {
        return Ok(None);
    }
    let folded = (times as u64).saturating_mul(s.chars().count() as u64);
    if folded > MAX_FOLDED_LENGTH as u64 {
        return Ok(None);
    }
    Ok(Some(Value::String(s.repeat(times as usize))))
}

fn in_array(args: &[Value]) -> Result<Option<Value>> {
    let needle = arg(args, 0, "in_array")?;
    let found = match arg(args, 1, "in_array")? {
        Value::Array(items) => items.iter().any(|item| js_loose_equals(item, needle)),
        Value::Object(map) => map.values().any(|item| js_loose_equals(item, needle)),
        _ => false,
    };
    Ok(Some(Value::Bool(found)))
}

fn default(args: &[Value]) -> Result<Option<Value>> {
    let value = arg(args, 0, "default")?;
    let fallback = arg(args, 1, "default")?;
    Ok(Some(if template_truthy(value) {
        value.clone()
    } else {
        fallback.clone()
    }))
}

fn fill_keys(args: &[Value]) -> Result<Option<Value>> {
    let fill = opt_arg(args, 1).cloned().unwrap_or(Value::Bool(true));
    let mut out = Map::new();
    match arg(args, 0, "fill_keys")? {
        Value::Array(keys) => {
            for key in keys {
                out.insert(js_string(key), fill.clone());
            }
        }
        Value::Null => {}
        other => {
            out.insert(js_string(other), fill);
        }
    }
    Ok(Some(Value::Object(out)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(name: &str, args: Vec<Value>) -> Value {
        call(name, &args).unwrap().unwrap()
    }

    #[test]
    fn test_string_functions() {
        assert_eq!(run("upper", vec![json!("abc")]), json!("ABC"));
        assert_eq!(run("ucfirst", vec![json!("élan")]), json!("Élan"));
        assert_eq!(run("substr", vec![json!("template"), json!(-4)]), json!("late"));
        assert_eq!(run("substr", vec![json!("template"), json!(1), json!(3)]), json!("emp"));
        assert_eq!(run("replace", vec![json!("a-b-c"), json!("-"), json!("+")]), json!("a+b+c"));
        assert_eq!(run("pad_left", vec![json!(7), json!(3), json!("0")]), json!("007"));
        assert_eq!(run("escape", vec![json!("<a href=\"x\">")]), json!("&lt;a href=&quot;x&quot;&gt;"));
        assert_eq!(run("url_encode", vec![json!("a b/c")]), json!("a%20b%2Fc"));
    }

    #[test]
    fn test_collection_functions() {
        assert_eq!(run("len", vec![json!([1, 2, 3])]), json!(3));
        assert_eq!(run("count", vec![json!(null)]), json!(0));
        assert_eq!(run("split", vec![json!("a,b"), json!(",")]), json!(["a", "b"]));
        assert_eq!(run("join", vec![json!(["a", null, 1]), json!("|")]), json!("a||1"));
        assert_eq!(run("in_array", vec![json!("2"), json!([1, 2])]), json!(true));
        assert_eq!(run("max", vec![json!([3, 9, 4])]), json!(9));
        assert_eq!(
            run("fill_keys", vec![json!(["a", 1])]),
            json!({"a": true, "1": true})
        );
    }

    #[test]
    fn test_numeric_functions() {
        assert_eq!(run("round", vec![json!(2.5)]), json!(3));
        assert_eq!(run("round", vec![json!(-1.2345), json!(2)]), json!(-1.23));
        assert_eq!(run("int", vec![json!("12.9px")]), json!(0));
        assert_eq!(run("int", vec![json!("-12.9")]), json!(-12));
        assert_eq!(
            run("number_format", vec![json!(1234567.891), json!(2)]),
            json!("1,234,567.89")
        );
        assert_eq!(run("default", vec![json!(""), json!("n/a")]), json!("n/a"));
    }

    #[test]
    fn test_substr_with_out_of_range_indices() {
        let huge = json!(1e300);
        let huge_negative = json!(-1e300);
        assert_eq!(run("substr", vec![json!("abc"), json!(1), huge.clone()]), json!("bc"));
        assert_eq!(run("substr", vec![json!("abc"), huge.clone()]), json!(""));
        assert_eq!(run("substr", vec![json!("abc"), huge_negative.clone()]), json!("abc"));
        assert_eq!(
            run("substr", vec![json!("abc"), huge_negative.clone(), huge_negative]),
            json!("")
        );
        assert_eq!(run("substr", vec![json!("abc"), json!("x"), json!(2)]), json!("ab"));
        assert_eq!(run("substr", vec![json!("abc"), json!(1), json!("x")]), json!(""));
        assert_eq!(
            crate::static_eval::evaluate_static("substr('abc', 1, 1e300)").unwrap(),
            Some(json!("bc"))
        );
    }

    #[test]
    fn test_padding_and_repetition_are_bounded() {
        assert_eq!(call("pad_left", &[json!("x"), json!(1e12)]).unwrap(), None);
        assert_eq!(call("pad_left", &[json!("x"), json!(1e300)]).unwrap(), None);
        assert_eq!(run("pad_left", vec![json!("x"), json!(-1e300)]), json!("x"));
        assert_eq!(run("pad_left", vec![json!("x"), json!("wide")]), json!("x"));
        let widest = run("pad_left", vec![json!("x"), json!(10_000)]);
        assert_eq!(widest.as_str().map(|s| s.chars().count()), Some(10_000));

        assert_eq!(call("repeat", &[json!("ab"), json!(1e300)]).unwrap(), None);
        assert_eq!(call("repeat", &[json!("ab"), json!(5_001)]).unwrap(), None);
        assert_eq!(call("repeat", &[json!("ab"), json!(-1e300)]).unwrap(), None);
        assert_eq!(run("repeat", vec![json!("x"), json!("many")]), json!(""));
        let longest = run("repeat", vec![json!("ab"), json!(5_000)]);
        assert_eq!(longest.as_str().map(str::len), Some(10_000));
    }

    #[test]
    fn test_numeric_functions_with_extreme_values() {
        assert_eq!(run("round", vec![json!(1.25), json!(1e300)]), json!(1.25));
        assert_eq!(run("round", vec![json!(1234), json!(-1e300)]), json!(0));
        assert_eq!(call("round", &[json!(1e308), json!(2)]).unwrap(), None);
        assert_eq!(call("round", &[json!("x")]).unwrap(), None);
        assert_eq!(
            run("number_format", vec![json!(1.5), json!(1e300)]),
            json!("1.50000000000000000000")
        );
        assert_eq!(call("number_format", &[json!("x")]).unwrap(), None);
        assert_eq!(run("int", vec![json!(1e300)]), json!(1e300));
        assert_eq!(run("abs", vec![json!(-1e300)]), json!(1e300));
        assert_eq!(call("floor", &[json!("x")]).unwrap(), None);
        assert_eq!(call("ceil", &[json!("x")]).unwrap(), None);
    }

    #[test]
    fn test_unfoldable_results_stay_residual() {
        assert_eq!(call("repeat", &[json!("x"), json!(-1)]).unwrap(), None);
        assert_eq!(call("float", &[json!("abc")]).unwrap(), Some(json!(0)));
        assert!(call("system", &[]).is_err());
        assert!(is_runtime_only("now"));
        assert!(!is_compile_time("now"));
    }
}
