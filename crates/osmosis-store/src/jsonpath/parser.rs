use fxhash::FxHashMap;
use osmosis_common::JsonValue;

use super::expr::{BinaryOp, PathExpr, UnaryOp};
use super::{CompiledJsonPath, JsonPathError, Segment};

/// Replaces `{name}` placeholders (outside quoted strings) with the JSON
/// rendering of the bound variable, then hands the result to [parse].
pub fn interpolate(
    path: &str,
    vars: &FxHashMap<String, JsonValue>,
) -> Result<String, JsonPathError> {
    let mut out = String::with_capacity(path.len());
    let mut chars = path.chars().peekable();
    let mut quote: Option<char> = None;
    while let Some(c) = chars.next() {
        match c {
            '\\' if quote.is_some() => {
                out.push(c);
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            '\'' | '"' => {
                match quote {
                    Some(q) if q == c => quote = None,
                    None => quote = Some(c),
                    _ => {}
                }
                out.push(c);
            }
            '{' if quote.is_none() => {
                let mut name = String::new();
                for c in chars.by_ref() {
                    if c == '}' {
                        break;
                    }
                    name.push(c);
                }
                let value = vars.get(name.trim()).ok_or_else(|| {
                    JsonPathError::InvalidJsonPath(format!("unbound variable {{{name}}}"))
                })?;
                // Whole numbers render without a fraction so they stay valid
                // as array subscripts.
                let rendered = match value {
                    JsonValue::Number(n) if n.fract() == 0.0 && n.is_finite() => {
                        format!("{}", *n as i64)
                    }
                    other => serde_json::to_string(other)
                        .map_err(|e| JsonPathError::InvalidJsonPath(e.to_string()))?,
                };
                out.push_str(&rendered);
            }
            _ => out.push(c),
        }
    }
    Ok(out)
}

/// Parses an absolute (`$`-rooted) JSONPath.
pub fn parse(path: &str) -> Result<CompiledJsonPath, JsonPathError> {
    let chars: Vec<char> = path.chars().collect();
    let mut i = 0;
    skip_ws(&chars, &mut i);
    if chars.get(i) != Some(&'$') {
        return Err(JsonPathError::InvalidJsonPath(
            "path must start with $".to_string(),
        ));
    }
    i += 1;
    let mut segments = Vec::new();
    loop {
        skip_ws(&chars, &mut i);
        match chars.get(i) {
            None => break,
            Some('.') => parse_dot_notation(&chars, &mut i, &mut segments)?,
            Some('[') => {
                let segment = parse_bracket(&chars, &mut i)?;
                segments.push(segment);
            }
            Some(c) => {
                return Err(JsonPathError::InvalidJsonPath(format!(
                    "unexpected character '{c}' at position {i}"
                )))
            }
        }
    }
    Ok(CompiledJsonPath(segments))
}

fn skip_ws(chars: &[char], i: &mut usize) {
    while chars.get(*i).is_some_and(|c| c.is_whitespace()) {
        *i += 1;
    }
}

fn parse_dot_notation(
    chars: &[char],
    i: &mut usize,
    segments: &mut Vec<Segment>,
) -> Result<(), JsonPathError> {
    *i += 1; // '.'
    if chars.get(*i) == Some(&'.') {
        *i += 1;
        let inner = match chars.get(*i) {
            Some('*') => {
                *i += 1;
                Segment::Wildcard
            }
            Some('[') => parse_bracket(chars, i)?,
            Some(c) if c.is_alphabetic() || *c == '_' => Segment::Key(parse_identifier(chars, i)?),
            _ => {
                return Err(JsonPathError::InvalidJsonPath(
                    "expected a key, '*' or '[' after '..'".to_string(),
                ))
            }
        };
        segments.push(Segment::Recursive(vec![inner]));
        return Ok(());
    }
    if chars.get(*i) == Some(&'*') {
        *i += 1;
        segments.push(Segment::Wildcard);
        return Ok(());
    }
    let key = parse_identifier(chars, i)?;
    segments.push(Segment::Key(key));
    Ok(())
}

fn parse_identifier(chars: &[char], i: &mut usize) -> Result<String, JsonPathError> {
    let mut key = String::new();
    while let Some(&c) = chars.get(*i) {
        let ok = if key.is_empty() {
            c.is_alphabetic() || c == '_'
        } else {
            c.is_alphanumeric() || c == '_' || c == '-'
        };
        if !ok {
            break;
        }
        key.push(c);
        *i += 1;
    }
    if key.is_empty() {
        return Err(JsonPathError::InvalidJsonPath(format!(
            "expected an identifier at position {i}"
        )));
    }
    Ok(key)
}

fn parse_bracket(chars: &[char], i: &mut usize) -> Result<Segment, JsonPathError> {
    *i += 1; // '['
    skip_ws(chars, i);
    let segment = match chars.get(*i) {
        None => {
            return Err(JsonPathError::InvalidJsonPath(
                "unterminated bracket".to_string(),
            ))
        }
        Some('*') => {
            *i += 1;
            Segment::Wildcard
        }
        Some('?') => {
            *i += 1;
            skip_ws(chars, i);
            expect(chars, i, '(')?;
            let expr = parse_expr(chars, i)?;
            skip_ws(chars, i);
            expect(chars, i, ')')?;
            Segment::Filter(expr)
        }
        Some('\'') | Some('"') => parse_key_union(chars, i)?,
        Some(c) if c.is_alphabetic() || *c == '_' => {
            let key = parse_identifier(chars, i)?;
            skip_ws(chars, i);
            if chars.get(*i) == Some(&',') {
                let mut keys = vec![key];
                while chars.get(*i) == Some(&',') {
                    *i += 1;
                    skip_ws(chars, i);
                    keys.push(match chars.get(*i) {
                        Some('\'') | Some('"') => parse_quoted(chars, i)?,
                        _ => parse_identifier(chars, i)?,
                    });
                    skip_ws(chars, i);
                }
                Segment::MultiKey(keys)
            } else {
                Segment::Key(key)
            }
        }
        _ => parse_index_slice_or_expr(chars, i)?,
    };
    skip_ws(chars, i);
    expect(chars, i, ']')?;
    Ok(segment)
}

fn parse_key_union(chars: &[char], i: &mut usize) -> Result<Segment, JsonPathError> {
    let mut keys = vec![parse_quoted(chars, i)?];
    skip_ws(chars, i);
    while chars.get(*i) == Some(&',') {
        *i += 1;
        skip_ws(chars, i);
        keys.push(match chars.get(*i) {
            Some('\'') | Some('"') => parse_quoted(chars, i)?,
            _ => parse_identifier(chars, i)?,
        });
        skip_ws(chars, i);
    }
    if keys.len() == 1 {
        Ok(Segment::Key(keys.pop().expect("one key")))
    } else {
        Ok(Segment::MultiKey(keys))
    }
}

fn parse_quoted(chars: &[char], i: &mut usize) -> Result<String, JsonPathError> {
    let quote = chars[*i];
    *i += 1;
    let mut out = String::new();
    loop {
        match chars.get(*i) {
            None => {
                return Err(JsonPathError::InvalidJsonPath(
                    "unterminated string".to_string(),
                ))
            }
            Some('\\') => {
                *i += 1;
                let escaped = chars.get(*i).ok_or_else(|| {
                    JsonPathError::InvalidJsonPath("unterminated escape".to_string())
                })?;
                out.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    other => *other,
                });
                *i += 1;
            }
            Some(&c) if c == quote => {
                *i += 1;
                return Ok(out);
            }
            Some(&c) => {
                out.push(c);
                *i += 1;
            }
        }
    }
}

/// Bracket body that is not a wildcard, filter or key: a numeric index or
/// union, a slice, a parenthesized script subscript, or an expression slice.
fn parse_index_slice_or_expr(chars: &[char], i: &mut usize) -> Result<Segment, JsonPathError> {
    #[derive(Clone)]
    enum Part {
        Empty,
        Number(i64),
        Expr(PathExpr),
    }

    let mut parts: Vec<Part> = Vec::new();
    let mut part = Part::Empty;
    let mut slice = false;
    let mut union = false;
    loop {
        skip_ws(chars, i);
        match chars.get(*i) {
            Some(']') | None => {
                parts.push(part);
                break;
            }
            Some(':') => {
                *i += 1;
                slice = true;
                parts.push(part);
                part = Part::Empty;
            }
            Some(',') => {
                *i += 1;
                union = true;
                parts.push(part);
                part = Part::Empty;
            }
            Some('(') => {
                let expr = parse_expr(chars, i)?;
                part = Part::Expr(expr);
            }
            Some(&c) if c == '-' || c.is_ascii_digit() => {
                part = Part::Number(parse_int(chars, i)?);
            }
            Some(c) => {
                return Err(JsonPathError::InvalidJsonPath(format!(
                    "unexpected character '{c}' in brackets at position {i}"
                )))
            }
        }
    }
    if slice && union {
        return Err(JsonPathError::InvalidJsonPath(
            "cannot mix ',' and ':' in one bracket".to_string(),
        ));
    }
    if slice {
        if parts.len() > 3 {
            return Err(JsonPathError::InvalidJsonPath(
                "slice takes at most three parts".to_string(),
            ));
        }
        parts.resize(3, Part::Empty);
        if parts.iter().any(|p| matches!(p, Part::Expr(_))) {
            let mut bounds = parts.into_iter().map(|p| match p {
                Part::Empty => None,
                Part::Number(n) => Some(PathExpr::Literal(JsonValue::Number(n as f64))),
                Part::Expr(e) => Some(e),
            });
            Ok(Segment::ExprSlice {
                from: bounds.next().flatten(),
                to: bounds.next().flatten(),
                step: bounds.next().flatten(),
            })
        } else {
            let mut bounds = parts.into_iter().map(|p| match p {
                Part::Number(n) => Some(n),
                _ => None,
            });
            Ok(Segment::Slice {
                from: bounds.next().flatten(),
                to: bounds.next().flatten(),
                step: bounds.next().flatten(),
            })
        }
    } else if union {
        if parts.iter().all(|p| matches!(p, Part::Number(_))) {
            Ok(Segment::MultiIndex(
                parts
                    .into_iter()
                    .map(|p| match p {
                        Part::Number(n) => n,
                        _ => unreachable!(),
                    })
                    .collect(),
            ))
        } else if parts.iter().all(|p| matches!(p, Part::Expr(_))) {
            Ok(Segment::ExprIndex(
                parts
                    .into_iter()
                    .map(|p| match p {
                        Part::Expr(e) => e,
                        _ => unreachable!(),
                    })
                    .collect(),
            ))
        } else {
            Err(JsonPathError::InvalidJsonPath(
                "cannot mix numbers and expressions in a union".to_string(),
            ))
        }
    } else {
        match parts.pop().expect("one part") {
            Part::Number(n) => Ok(Segment::Index(n)),
            Part::Expr(e) => Ok(Segment::ExprIndex(vec![e])),
            Part::Empty => Err(JsonPathError::InvalidJsonPath(
                "empty bracket".to_string(),
            )),
        }
    }
}

fn parse_int(chars: &[char], i: &mut usize) -> Result<i64, JsonPathError> {
    let start = *i;
    if chars.get(*i) == Some(&'-') {
        *i += 1;
    }
    while chars.get(*i).is_some_and(|c| c.is_ascii_digit()) {
        *i += 1;
    }
    let text: String = chars[start..*i].iter().collect();
    text.parse::<i64>()
        .map_err(|_| JsonPathError::InvalidJsonPath(format!("invalid integer '{text}'")))
}

// ---- expressions ----------------------------------------------------

fn expect(chars: &[char], i: &mut usize, c: char) -> Result<(), JsonPathError> {
    if chars.get(*i) == Some(&c) {
        *i += 1;
        Ok(())
    } else {
        Err(JsonPathError::InvalidJsonPath(format!(
            "expected '{c}' at position {i}"
        )))
    }
}

/// Entry point: ternary is the loosest level.
fn parse_expr(chars: &[char], i: &mut usize) -> Result<PathExpr, JsonPathError> {
    skip_ws(chars, i);
    if chars.get(*i) == Some(&'(') {
        *i += 1;
        let inner = parse_ternary(chars, i)?;
        skip_ws(chars, i);
        expect(chars, i, ')')?;
        return parse_postfix_with(chars, i, inner);
    }
    parse_ternary(chars, i)
}

fn parse_ternary(chars: &[char], i: &mut usize) -> Result<PathExpr, JsonPathError> {
    let cond = parse_or(chars, i)?;
    skip_ws(chars, i);
    if chars.get(*i) == Some(&'?') {
        *i += 1;
        let then = parse_ternary(chars, i)?;
        skip_ws(chars, i);
        expect(chars, i, ':')?;
        let or_else = parse_ternary(chars, i)?;
        return Ok(PathExpr::If {
            cond: Box::new(cond),
            then: Box::new(then),
            or_else: Box::new(or_else),
        });
    }
    Ok(cond)
}

fn parse_or(chars: &[char], i: &mut usize) -> Result<PathExpr, JsonPathError> {
    let mut lhs = parse_and(chars, i)?;
    loop {
        skip_ws(chars, i);
        if chars.get(*i) == Some(&'|') && chars.get(*i + 1) == Some(&'|') {
            *i += 2;
            let rhs = parse_and(chars, i)?;
            lhs = PathExpr::binary(BinaryOp::Or, lhs, rhs);
        } else {
            return Ok(lhs);
        }
    }
}

fn parse_and(chars: &[char], i: &mut usize) -> Result<PathExpr, JsonPathError> {
    let mut lhs = parse_equality(chars, i)?;
    loop {
        skip_ws(chars, i);
        if chars.get(*i) == Some(&'&') && chars.get(*i + 1) == Some(&'&') {
            *i += 2;
            let rhs = parse_equality(chars, i)?;
            lhs = PathExpr::binary(BinaryOp::And, lhs, rhs);
        } else {
            return Ok(lhs);
        }
    }
}

fn parse_equality(chars: &[char], i: &mut usize) -> Result<PathExpr, JsonPathError> {
    let mut lhs = parse_comparison(chars, i)?;
    loop {
        skip_ws(chars, i);
        let op = match (chars.get(*i), chars.get(*i + 1)) {
            (Some('='), Some('=')) => BinaryOp::Eq,
            (Some('!'), Some('=')) => BinaryOp::Ne,
            _ => return Ok(lhs),
        };
        *i += 2;
        let rhs = parse_comparison(chars, i)?;
        lhs = PathExpr::binary(op, lhs, rhs);
    }
}

fn parse_comparison(chars: &[char], i: &mut usize) -> Result<PathExpr, JsonPathError> {
    let mut lhs = parse_additive(chars, i)?;
    loop {
        skip_ws(chars, i);
        let op = match chars.get(*i) {
            Some('<') => {
                if chars.get(*i + 1) == Some(&'=') {
                    *i += 2;
                    BinaryOp::Le
                } else {
                    *i += 1;
                    BinaryOp::Lt
                }
            }
            Some('>') => {
                if chars.get(*i + 1) == Some(&'=') {
                    *i += 2;
                    BinaryOp::Ge
                } else {
                    *i += 1;
                    BinaryOp::Gt
                }
            }
            _ => return Ok(lhs),
        };
        let rhs = parse_additive(chars, i)?;
        lhs = PathExpr::binary(op, lhs, rhs);
    }
}

fn parse_additive(chars: &[char], i: &mut usize) -> Result<PathExpr, JsonPathError> {
    let mut lhs = parse_multiplicative(chars, i)?;
    loop {
        skip_ws(chars, i);
        let op = match chars.get(*i) {
            Some('+') => BinaryOp::Add,
            Some('-') => BinaryOp::Sub,
            _ => return Ok(lhs),
        };
        *i += 1;
        let rhs = parse_multiplicative(chars, i)?;
        lhs = PathExpr::binary(op, lhs, rhs);
    }
}

fn parse_multiplicative(chars: &[char], i: &mut usize) -> Result<PathExpr, JsonPathError> {
    let mut lhs = parse_unary(chars, i)?;
    loop {
        skip_ws(chars, i);
        let op = match chars.get(*i) {
            Some('*') => BinaryOp::Mul,
            Some('/') => BinaryOp::Div,
            Some('%') => BinaryOp::Mod,
            _ => return Ok(lhs),
        };
        *i += 1;
        let rhs = parse_unary(chars, i)?;
        lhs = PathExpr::binary(op, lhs, rhs);
    }
}

fn parse_unary(chars: &[char], i: &mut usize) -> Result<PathExpr, JsonPathError> {
    skip_ws(chars, i);
    match chars.get(*i) {
        Some('-') => {
            *i += 1;
            Ok(PathExpr::unary(UnaryOp::Neg, parse_unary(chars, i)?))
        }
        Some('!') if chars.get(*i + 1) != Some(&'=') => {
            *i += 1;
            Ok(PathExpr::unary(UnaryOp::Not, parse_unary(chars, i)?))
        }
        _ => parse_postfix(chars, i),
    }
}

fn parse_postfix(chars: &[char], i: &mut usize) -> Result<PathExpr, JsonPathError> {
    let primary = parse_primary(chars, i)?;
    parse_postfix_with(chars, i, primary)
}

/// `.key` and `[expr]` subscripts chained after a primary.
fn parse_postfix_with(
    chars: &[char],
    i: &mut usize,
    mut lhs: PathExpr,
) -> Result<PathExpr, JsonPathError> {
    loop {
        match chars.get(*i) {
            Some('.') => {
                *i += 1;
                let key = parse_identifier(chars, i)?;
                lhs = PathExpr::binary(
                    BinaryOp::Subscript,
                    lhs,
                    PathExpr::Literal(JsonValue::String(key)),
                );
            }
            Some('[') => {
                *i += 1;
                let index = parse_ternary(chars, i)?;
                skip_ws(chars, i);
                expect(chars, i, ']')?;
                lhs = PathExpr::binary(BinaryOp::Subscript, lhs, index);
            }
            _ => return Ok(lhs),
        }
    }
}

fn parse_primary(chars: &[char], i: &mut usize) -> Result<PathExpr, JsonPathError> {
    skip_ws(chars, i);
    match chars.get(*i) {
        None => Err(JsonPathError::InvalidJsonPath(
            "unexpected end of expression".to_string(),
        )),
        Some('@') => {
            *i += 1;
            Ok(PathExpr::SelfValue)
        }
        Some('(') => {
            *i += 1;
            let inner = parse_ternary(chars, i)?;
            skip_ws(chars, i);
            expect(chars, i, ')')?;
            Ok(inner)
        }
        Some('\'') | Some('"') => Ok(PathExpr::Literal(JsonValue::String(parse_quoted(
            chars, i,
        )?))),
        Some('[') => {
            *i += 1;
            let mut items = Vec::new();
            skip_ws(chars, i);
            if chars.get(*i) != Some(&']') {
                loop {
                    items.push(parse_ternary(chars, i)?);
                    skip_ws(chars, i);
                    if chars.get(*i) == Some(&',') {
                        *i += 1;
                    } else {
                        break;
                    }
                }
            }
            expect(chars, i, ']')?;
            // Literal lists only; a list of computed elements is not a
            // JsonValue until evaluated, so fold eagerly when possible.
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    PathExpr::Literal(v) => values.push(v),
                    _ => {
                        return Err(JsonPathError::InvalidJsonPath(
                            "list literals may only contain literals".to_string(),
                        ))
                    }
                }
            }
            Ok(PathExpr::Literal(JsonValue::List(values)))
        }
        Some(&c) if c == '-' || c.is_ascii_digit() => {
            let number = parse_number(chars, i)?;
            Ok(PathExpr::Literal(JsonValue::Number(number)))
        }
        Some(&c) if c.is_alphabetic() => {
            let word = parse_identifier(chars, i)?;
            match word.as_str() {
                "true" => Ok(PathExpr::Literal(JsonValue::Bool(true))),
                "false" => Ok(PathExpr::Literal(JsonValue::Bool(false))),
                "null" => Ok(PathExpr::Literal(JsonValue::Null)),
                other => Err(JsonPathError::InvalidJsonPath(format!(
                    "unknown word '{other}' in expression"
                ))),
            }
        }
        Some(c) => Err(JsonPathError::InvalidJsonPath(format!(
            "unexpected character '{c}' in expression at position {i}"
        ))),
    }
}

fn parse_number(chars: &[char], i: &mut usize) -> Result<f64, JsonPathError> {
    let start = *i;
    if chars.get(*i) == Some(&'-') {
        *i += 1;
    }
    while chars
        .get(*i)
        .is_some_and(|c| c.is_ascii_digit() || *c == '.' || *c == 'e' || *c == 'E')
    {
        if (chars.get(*i) == Some(&'e') || chars.get(*i) == Some(&'E'))
            && matches!(chars.get(*i + 1), Some('+') | Some('-'))
        {
            *i += 1;
        }
        *i += 1;
    }
    let text: String = chars[start..*i].iter().collect();
    text.parse::<f64>()
        .map_err(|_| JsonPathError::InvalidJsonPath(format!("invalid number '{text}'")))
}
