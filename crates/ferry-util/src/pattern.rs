//! Filename metadata patterns.
//!
//! Chain configs name files with `{field[:format]}` templates, e.g.
//!
//! ```text
//! /in/H-000-{series:_<6s}-{platform_name:_<12s}-{nominal_time:%Y%m%d%H%M}-__
//! ```
//!
//! A compiled [`Pattern`] supports three operations:
//!
//! - [`Pattern::parse`]: extract the fields from a concrete name,
//! - [`Pattern::globify`]: the equivalent shell glob (fixed-width fields
//!   become `?` runs, free fields become `*`),
//! - [`Pattern::compose`]: substitute field values back into the template.
//!
//! Supported format specs: none (free string), strftime directives
//! (`%Y%m%d%H%M` style), zero-padded integers (`05d`), and fill/align
//! strings (`_<6s`). That subset covers the operational configs; anything
//! else is a [`PatternError`] at compile time, never a silent mismatch.

use chrono::NaiveDateTime;
use regex::Regex;
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Template model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Literal(String),
    Field { name: String, spec: Spec },
}

#[derive(Debug, Clone, PartialEq)]
enum Spec {
    /// `{name}`: any non-empty run of characters, matched lazily.
    Free,
    /// `{name:%Y%m%d%H%M}`: chrono strftime directives.
    Time(String),
    /// `{name:05d}`: fixed-width integer, zero or fill padded.
    Int { fill: char, width: usize },
    /// `{name:_<6s}`: fixed-width string with fill and alignment.
    Str {
        fill: char,
        align: Align,
        width: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Align {
    Left,
    Right,
    Center,
}

/// A compiled filename template.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    tokens: Vec<Token>,
    regex: Regex,
}

#[derive(Debug, thiserror::Error)]
pub enum PatternError {
    #[error("unbalanced braces in pattern: {0}")]
    Unbalanced(String),
    #[error("unsupported format spec '{spec}' for field '{name}'")]
    BadSpec { name: String, spec: String },
    #[error("unsupported strftime directive '%{0}'")]
    BadDirective(char),
    #[error("missing field '{0}' when composing")]
    MissingField(String),
    #[error("field '{field}' has unusable value '{value}'")]
    BadValue { field: String, value: String },
    #[error("internal regex error: {0}")]
    Regex(#[from] regex::Error),
}

impl Pattern {
    /// Compile a template string.
    pub fn new(source: &str) -> Result<Self, PatternError> {
        let tokens = tokenize(source)?;
        let regex = build_regex(&tokens)?;
        Ok(Pattern {
            source: source.to_owned(),
            tokens,
            regex,
        })
    }

    /// The original template string.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Names of the fields, in template order.
    pub fn field_names(&self) -> Vec<&str> {
        self.tokens
            .iter()
            .filter_map(|t| match t {
                Token::Field { name, .. } => Some(name.as_str()),
                Token::Literal(_) => None,
            })
            .collect()
    }

    /// Extract field values from a concrete name. `None` when the name does
    /// not match the template.
    ///
    /// Times become `%Y-%m-%dT%H:%M:%S` strings, integers become numbers,
    /// everything else a string with the fill characters stripped.
    pub fn parse(&self, name: &str) -> Option<Map<String, Value>> {
        let caps = self.regex.captures(name)?;
        let mut out = Map::new();
        let mut group = 0;
        for token in &self.tokens {
            let Token::Field { name, spec } = token else {
                continue;
            };
            group += 1;
            let text = caps.get(group)?.as_str();
            let value = match spec {
                Spec::Free => Value::String(text.to_owned()),
                Spec::Time(fmt) => {
                    let dt = parse_time(text, fmt)?;
                    Value::String(dt.format("%Y-%m-%dT%H:%M:%S").to_string())
                }
                Spec::Int { fill, .. } => {
                    let trimmed = text.trim_start_matches(*fill);
                    let trimmed = if trimmed.is_empty() { "0" } else { trimmed };
                    Value::Number(trimmed.parse::<i64>().ok()?.into())
                }
                Spec::Str { fill, align, .. } => {
                    let stripped = match align {
                        Align::Left => text.trim_end_matches(*fill),
                        Align::Right => text.trim_start_matches(*fill),
                        Align::Center => text.trim_matches(*fill),
                    };
                    Value::String(stripped.to_owned())
                }
            };
            out.insert(name.clone(), value);
        }
        Some(out)
    }

    /// The shell glob equivalent of this template.
    pub fn globify(&self) -> String {
        let mut out = String::new();
        for token in &self.tokens {
            match token {
                Token::Literal(text) => out.push_str(&escape_glob(text)),
                Token::Field { spec, .. } => match spec.glob_width() {
                    Some(width) => out.extend(std::iter::repeat('?').take(width)),
                    None => out.push('*'),
                },
            }
        }
        out
    }

    /// Substitute field values back into the template.
    pub fn compose(&self, fields: &Map<String, Value>) -> Result<String, PatternError> {
        let mut out = String::new();
        for token in &self.tokens {
            match token {
                Token::Literal(text) => out.push_str(text),
                Token::Field { name, spec } => {
                    let value = fields
                        .get(name)
                        .ok_or_else(|| PatternError::MissingField(name.clone()))?;
                    out.push_str(&render(name, value, spec)?);
                }
            }
        }
        Ok(out)
    }
}

impl Spec {
    /// Glob width of the matched text, when fixed.
    fn glob_width(&self) -> Option<usize> {
        match self {
            Spec::Free => None,
            Spec::Time(fmt) => strftime_width(fmt),
            Spec::Int { width, .. } | Spec::Str { width, .. } => Some(*width),
        }
    }
}

// ---------------------------------------------------------------------------
// Convenience wrappers (single-shot API)
// ---------------------------------------------------------------------------

/// One-shot [`Pattern::parse`].
pub fn parse(pattern: &str, name: &str) -> Result<Option<Map<String, Value>>, PatternError> {
    Ok(Pattern::new(pattern)?.parse(name))
}

/// One-shot [`Pattern::globify`].
pub fn globify(pattern: &str) -> Result<String, PatternError> {
    Ok(Pattern::new(pattern)?.globify())
}

/// One-shot [`Pattern::compose`].
pub fn compose(pattern: &str, fields: &Map<String, Value>) -> Result<String, PatternError> {
    Pattern::new(pattern)?.compose(fields)
}

/// Shell-style name matching (`*`, `?`, `[...]`).
pub fn fnmatch(glob_pattern: &str, name: &str) -> bool {
    glob::Pattern::new(glob_pattern)
        .map(|p| p.matches(name))
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

fn tokenize(source: &str) -> Result<Vec<Token>, PatternError> {
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut chars = source.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '{' {
            if c == '}' {
                return Err(PatternError::Unbalanced(source.to_owned()));
            }
            literal.push(c);
            continue;
        }
        if !literal.is_empty() {
            tokens.push(Token::Literal(std::mem::take(&mut literal)));
        }
        let mut body = String::new();
        let mut closed = false;
        for c in chars.by_ref() {
            if c == '}' {
                closed = true;
                break;
            }
            body.push(c);
        }
        if !closed {
            return Err(PatternError::Unbalanced(source.to_owned()));
        }
        let (name, spec_text) = match body.split_once(':') {
            Some((n, s)) => (n.to_owned(), Some(s.to_owned())),
            None => (body, None),
        };
        let spec = parse_spec(&name, spec_text.as_deref())?;
        tokens.push(Token::Field { name, spec });
    }
    if !literal.is_empty() {
        tokens.push(Token::Literal(literal));
    }
    Ok(tokens)
}

fn parse_spec(name: &str, spec: Option<&str>) -> Result<Spec, PatternError> {
    let Some(spec) = spec else {
        return Ok(Spec::Free);
    };
    if spec.contains('%') {
        return Ok(Spec::Time(spec.to_owned()));
    }

    let bad = || PatternError::BadSpec {
        name: name.to_owned(),
        spec: spec.to_owned(),
    };

    // fill/align string: `_<6s`, `>4s`
    let mut chars: Vec<char> = spec.chars().collect();
    let kind = chars.pop().ok_or_else(bad)?;
    match kind {
        's' => {
            let (fill, align, rest) = split_fill_align(&chars);
            let width: usize = rest.parse().map_err(|_| bad())?;
            Ok(Spec::Str { fill, align, width })
        }
        'd' => {
            // `05d` or `5d`
            let rest: String = chars.iter().collect();
            let digits = rest
                .strip_prefix('0')
                .filter(|d| !d.is_empty())
                .unwrap_or(&rest);
            let width: usize = digits.parse().map_err(|_| bad())?;
            Ok(Spec::Int { fill: '0', width })
        }
        _ => Err(bad()),
    }
}

fn split_fill_align(chars: &[char]) -> (char, Align, String) {
    match chars {
        [fill, '<', rest @ ..] => (*fill, Align::Left, rest.iter().collect()),
        [fill, '>', rest @ ..] => (*fill, Align::Right, rest.iter().collect()),
        [fill, '^', rest @ ..] => (*fill, Align::Center, rest.iter().collect()),
        ['<', rest @ ..] => (' ', Align::Left, rest.iter().collect()),
        ['>', rest @ ..] => (' ', Align::Right, rest.iter().collect()),
        ['^', rest @ ..] => (' ', Align::Center, rest.iter().collect()),
        rest => (' ', Align::Left, rest.iter().collect()),
    }
}

// ---------------------------------------------------------------------------
// Regex construction
// ---------------------------------------------------------------------------

fn build_regex(tokens: &[Token]) -> Result<Regex, PatternError> {
    let mut re = String::from("^");
    for token in tokens {
        match token {
            Token::Literal(text) => re.push_str(&regex::escape(text)),
            Token::Field { spec, .. } => {
                re.push('(');
                match spec {
                    Spec::Free => re.push_str(".+?"),
                    Spec::Time(fmt) => re.push_str(&strftime_regex(fmt)?),
                    Spec::Int { width, .. } => re.push_str(&format!("\\d{{{width}}}")),
                    Spec::Str { width, .. } => re.push_str(&format!(".{{{width}}}")),
                }
                re.push(')');
            }
        }
    }
    re.push('$');
    Ok(Regex::new(&re)?)
}

fn strftime_regex(fmt: &str) -> Result<String, PatternError> {
    let mut re = String::new();
    let mut chars = fmt.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            re.push_str(&regex::escape(&c.to_string()));
            continue;
        }
        let d = chars.next().ok_or(PatternError::BadDirective('%'))?;
        let piece = match d {
            'Y' => "\\d{4}",
            'y' | 'm' | 'd' | 'H' | 'M' | 'S' => "\\d{2}",
            'j' => "\\d{3}",
            'f' => "\\d{6}",
            other => return Err(PatternError::BadDirective(other)),
        };
        re.push_str(piece);
    }
    Ok(re)
}

fn strftime_width(fmt: &str) -> Option<usize> {
    let mut width = 0;
    let mut chars = fmt.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            width += 1;
            continue;
        }
        width += match chars.next()? {
            'Y' => 4,
            'y' | 'm' | 'd' | 'H' | 'M' | 'S' => 2,
            'j' => 3,
            'f' => 6,
            _ => return None,
        };
    }
    Some(width)
}

fn parse_time(text: &str, fmt: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = NaiveDateTime::parse_from_str(text, fmt) {
        return Some(dt);
    }
    // Date-only directives need a synthetic midnight to form a datetime.
    chrono::NaiveDate::parse_from_str(text, fmt)
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

// ---------------------------------------------------------------------------
// Composition
// ---------------------------------------------------------------------------

fn render(name: &str, value: &Value, spec: &Spec) -> Result<String, PatternError> {
    let bad = |v: &Value| PatternError::BadValue {
        field: name.to_owned(),
        value: v.to_string(),
    };
    match spec {
        Spec::Free => Ok(value_text(value)),
        Spec::Time(fmt) => {
            let text = value.as_str().ok_or_else(|| bad(value))?;
            let dt = value_to_datetime(text).ok_or_else(|| bad(value))?;
            Ok(dt.format(fmt).to_string())
        }
        Spec::Int { fill, width } => {
            let n = value.as_i64().ok_or_else(|| bad(value))?;
            Ok(pad(&n.to_string(), *fill, Align::Right, *width))
        }
        Spec::Str { fill, align, width } => Ok(pad(&value_text(value), *fill, *align, *width)),
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn value_to_datetime(text: &str) -> Option<NaiveDateTime> {
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(dt);
        }
    }
    chrono::DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.naive_utc())
}

fn pad(text: &str, fill: char, align: Align, width: usize) -> String {
    let len = text.chars().count();
    if len >= width {
        return text.to_owned();
    }
    let padding: String = std::iter::repeat(fill).take(width - len).collect();
    match align {
        Align::Left => format!("{text}{padding}"),
        Align::Right => format!("{padding}{text}"),
        Align::Center => {
            let left = (width - len) / 2;
            let right = width - len - left;
            let l: String = std::iter::repeat(fill).take(left).collect();
            let r: String = std::iter::repeat(fill).take(right).collect();
            format!("{l}{text}{r}")
        }
    }
}

fn escape_glob(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '*' | '?' | '[' | ']') {
            out.push('[');
            out.push(c);
            out.push(']');
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const HRIT: &str = "H-000-{series:_<6s}-{platform_name:_<12s}-{nominal_time:%Y%m%d%H%M}-__";

    #[test]
    fn parses_fixed_width_fields() {
        let p = Pattern::new(HRIT).unwrap();
        let fields = p
            .parse("H-000-MSG4__-MSG4________-202401011200-__")
            .unwrap();
        assert_eq!(fields["series"], "MSG4");
        assert_eq!(fields["platform_name"], "MSG4");
        assert_eq!(fields["nominal_time"], "2024-01-01T12:00:00");
    }

    #[test]
    fn rejects_non_matching_name() {
        let p = Pattern::new(HRIT).unwrap();
        assert!(p.parse("B-1.dat").is_none());
    }

    #[test]
    fn globify_uses_fixed_width_runs() {
        let p = Pattern::new("H-{time:%Y%m%d%H%M}-__").unwrap();
        assert_eq!(p.globify(), "H-????????????-__");
        assert!(fnmatch(&p.globify(), "H-202401011200-__"));
        assert!(!fnmatch(&p.globify(), "H-20240101120-__"));
    }

    #[test]
    fn globify_free_field_is_star() {
        let p = Pattern::new("{channel}.dat").unwrap();
        assert_eq!(p.globify(), "*.dat");
    }

    #[test]
    fn parse_then_compose_is_stable() {
        let p = Pattern::new(HRIT).unwrap();
        let name = "H-000-MSG4__-MSG4________-202401011200-__";
        let fields = p.parse(name).unwrap();
        assert_eq!(p.compose(&fields).unwrap(), name);
    }

    #[test]
    fn compose_pads_integers() {
        let p = Pattern::new("pass_{orbit:05d}.l1b").unwrap();
        let fields = json!({"orbit": 42}).as_object().unwrap().clone();
        assert_eq!(p.compose(&fields).unwrap(), "pass_00042.l1b");
    }

    #[test]
    fn parse_strips_integer_padding() {
        let p = Pattern::new("pass_{orbit:05d}.l1b").unwrap();
        let fields = p.parse("pass_00042.l1b").unwrap();
        assert_eq!(fields["orbit"], 42);
    }

    #[test]
    fn compose_missing_field_is_an_error() {
        let p = Pattern::new("{a}/{b}").unwrap();
        let fields = json!({"a": "x"}).as_object().unwrap().clone();
        assert!(matches!(
            p.compose(&fields),
            Err(PatternError::MissingField(_))
        ));
    }

    #[test]
    fn unbalanced_braces_rejected() {
        assert!(Pattern::new("{oops").is_err());
        assert!(Pattern::new("oops}").is_err());
    }

    #[test]
    fn free_fields_split_on_literals() {
        let p = Pattern::new("{sensor}_{product}.png").unwrap();
        let fields = p.parse("avhrr_green_snow.png").unwrap();
        assert_eq!(fields["sensor"], "avhrr");
        assert_eq!(fields["product"], "green_snow");
    }

    #[test]
    fn fnmatch_basics() {
        assert!(fnmatch("A-*.dat", "A-1.dat"));
        assert!(!fnmatch("A-*.dat", "B-1.dat"));
    }
}
