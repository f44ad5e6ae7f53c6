//! Parses the textual surface syntax into a (type, value) pair.
//!
//! Three modes: `Normal` (strict, hex literals allowed), `Liberal`
//! (mixed-type containers widen to `a`) and `Json` (backslash string
//! escapes, widening like Liberal). The grammar covers literals,
//! tuples `(a, b)` (`,` or `;` separated), lists, maps with `:` or `=`,
//! `<type>` coercions with an optional trailing value, and `error(...)`
//! literals producing an `e`.

use nom::character::complete::{char, multispace0};
use nom::IResult;

use crate::chunk::Accumulator;
use crate::codec::{put_bytes, put_u32};
use crate::convert::{convert, Policy};
use crate::default_value::default_value;
use crate::error::{Error, ErrorKind};
use crate::type_str::TypeStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextMode {
    /// Strict parsing; container element types must agree.
    Normal,
    /// On element-type mismatch, restart with the element type forced
    /// to `a` and every element wrapped.
    Liberal,
    /// JSON surface: backslash escapes, no hex or char literals,
    /// widening as in `Liberal`.
    Json,
}

#[derive(Debug, Clone)]
struct Node {
    ty: String,
    val: Vec<u8>,
}

#[derive(Debug)]
struct TErr<'s> {
    input: &'s str,
    cause: Option<Error>,
}

impl<'s> nom::error::ParseError<&'s str> for TErr<'s> {
    fn from_error_kind(input: &'s str, _kind: nom::error::ErrorKind) -> Self {
        TErr { input, cause: None }
    }

    fn append(_input: &'s str, _kind: nom::error::ErrorKind, other: Self) -> Self {
        other
    }
}

type PResult<'s, T> = IResult<&'s str, T, TErr<'s>>;

fn perr<'s, T>(i: &'s str) -> PResult<'s, T> {
    Err(nom::Err::Error(TErr { input: i, cause: None }))
}

fn pfail<'s, T>(i: &'s str, e: Error) -> PResult<'s, T> {
    Err(nom::Err::Failure(TErr { input: i, cause: Some(e) }))
}

fn syntax(input: &str, rest: &str) -> Error {
    Error::new(
        ErrorKind::ValueMismatch,
        format!("syntax error in value text at byte {}", input.len() - rest.len()),
    )
}

/// Parses a complete value text into its type and serialized bytes.
pub fn parse_text(input: &str, mode: TextMode) -> Result<(TypeStr, Vec<u8>), Error> {
    match value(input, mode) {
        Ok((rest, node)) => {
            let rest = rest.trim_start();
            if !rest.is_empty() {
                return Err(syntax(input, rest));
            }
            Ok((TypeStr::from_validated(node.ty), node.val))
        }
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            Err(e.cause.unwrap_or_else(|| syntax(input, e.input)))
        }
        Err(nom::Err::Incomplete(_)) => Err(syntax(input, "")),
    }
}

fn ws(i: &str) -> PResult<&str> {
    multispace0(i)
}

fn ident_follows(i: &str) -> bool {
    i.starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_')
}

fn value<'s>(i: &'s str, mode: TextMode) -> PResult<'s, Node> {
    let (i, _) = ws(i)?;
    match i.chars().next() {
        Some('(') => tuple_lit(i, mode),
        Some('[') => list_lit(i, mode),
        Some('{') => map_lit(i, mode),
        Some('<') => coercion(i, mode),
        Some('"') => string_lit(i, mode),
        Some('\'') if mode != TextMode::Json => char_lit(i),
        Some('e') if i.starts_with("error") => error_lit(i, mode),
        _ => keyword_or_number(i, mode),
    }
}

fn keyword_or_number<'s>(i: &'s str, mode: TextMode) -> PResult<'s, Node> {
    for (kw, ty, val) in [
        ("true", "b", vec![1u8]),
        ("false", "b", vec![0]),
        ("null", "", vec![]),
    ] {
        if let Some(rest) = i.strip_prefix(kw) {
            if !ident_follows(rest) {
                return Ok((rest, Node { ty: ty.to_owned(), val }));
            }
        }
    }
    number(i, mode)
}

fn int_node<'s>(i: &'s str, v: i128) -> PResult<'s, Node> {
    let mut val = Vec::new();
    if v >= -(1 << 31) && v < (1 << 31) {
        crate::codec::put_i32(&mut val, v as i32);
        Ok((i, Node { ty: "i".to_owned(), val }))
    } else if i64::try_from(v).is_ok() {
        crate::codec::put_i64(&mut val, v as i64);
        Ok((i, Node { ty: "I".to_owned(), val }))
    } else {
        pfail(i, Error::new(ErrorKind::ValueMismatch, "integer literal does not fit 64 bits"))
    }
}

fn number<'s>(i: &'s str, mode: TextMode) -> PResult<'s, Node> {
    let neg = i.starts_with('-');
    let body = if neg { &i[1..] } else { i };
    if mode != TextMode::Json && (body.starts_with("0x") || body.starts_with("0X")) {
        let hex = &body[2..];
        let end = hex.find(|c: char| !c.is_ascii_hexdigit()).unwrap_or(hex.len());
        if end == 0 {
            return perr(i);
        }
        let v = match i128::from_str_radix(&hex[..end], 16) {
            Ok(v) => v,
            Err(_) => {
                return pfail(i, Error::new(ErrorKind::ValueMismatch, "hex literal overflows"))
            }
        };
        return int_node(&hex[end..], if neg { -v } else { v });
    }
    let bytes = body.as_bytes();
    let mut k = 0;
    while k < bytes.len() && bytes[k].is_ascii_digit() {
        k += 1;
    }
    if k == 0 {
        return perr(i);
    }
    let mut is_double = false;
    if k + 1 < bytes.len() && bytes[k] == b'.' && bytes[k + 1].is_ascii_digit() {
        is_double = true;
        k += 1;
        while k < bytes.len() && bytes[k].is_ascii_digit() {
            k += 1;
        }
    }
    if k < bytes.len() && (bytes[k] == b'e' || bytes[k] == b'E') {
        let mut j = k + 1;
        if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
            j += 1;
        }
        if j < bytes.len() && bytes[j].is_ascii_digit() {
            is_double = true;
            k = j;
            while k < bytes.len() && bytes[k].is_ascii_digit() {
                k += 1;
            }
        }
    }
    let lexeme = &body[..k];
    let rest = &body[k..];
    if is_double {
        // a lexeme that parses only as a double
        let v: f64 = match lexeme.parse() {
            Ok(v) => v,
            Err(_) => return perr(i),
        };
        let mut val = Vec::new();
        crate::codec::put_f64(&mut val, if neg { -v } else { v });
        Ok((rest, Node { ty: "d".to_owned(), val }))
    } else {
        let v: i128 = match lexeme.parse() {
            Ok(v) => v,
            Err(_) => {
                return pfail(i, Error::new(ErrorKind::ValueMismatch, "integer literal overflows"))
            }
        };
        int_node(rest, if neg { -v } else { v })
    }
}

fn hex_byte(i: &str) -> Option<u8> {
    let b = i.as_bytes();
    if b.len() < 2 {
        return None;
    }
    let hi = (b[0] as char).to_digit(16)?;
    let lo = (b[1] as char).to_digit(16)?;
    Some((hi * 16 + lo) as u8)
}

fn char_lit(i: &str) -> PResult<Node> {
    let (r, _) = char('\'')(i)?;
    let (r, b) = if let Some(rest) = r.strip_prefix('%') {
        match hex_byte(rest) {
            Some(b) => (&rest[2..], b),
            None => return perr(i),
        }
    } else {
        match r.chars().next() {
            Some(c) if c.is_ascii() && c != '\'' => (&r[1..], c as u8),
            _ => return perr(i),
        }
    };
    match r.strip_prefix('\'') {
        Some(rest) => Ok((rest, Node { ty: "c".to_owned(), val: vec![b] })),
        None => perr(r),
    }
}

fn string_lit<'s>(i: &'s str, mode: TextMode) -> PResult<'s, Node> {
    let body = &i[1..]; // caller saw the opening quote
    let bytes = body.as_bytes();
    let mut out: Vec<u8> = Vec::new();
    let mut k = 0;
    while k < bytes.len() {
        match bytes[k] {
            b'"' => {
                let mut val = Vec::new();
                put_bytes(&mut val, &out);
                return Ok((&body[k + 1..], Node { ty: "s".to_owned(), val }));
            }
            b'%' if mode != TextMode::Json => match hex_byte(&body[k + 1..]) {
                Some(b) => {
                    out.push(b);
                    k += 3;
                }
                None => return perr(&body[k..]),
            },
            b'\\' if mode == TextMode::Json => {
                let esc = match bytes.get(k + 1) {
                    Some(&e) => e,
                    None => return perr(&body[k..]),
                };
                match esc {
                    b'"' | b'\\' | b'/' => out.push(esc),
                    b'n' => out.push(b'\n'),
                    b't' => out.push(b'\t'),
                    b'r' => out.push(b'\r'),
                    b'b' => out.push(0x08),
                    b'f' => out.push(0x0c),
                    b'u' => {
                        let hex = body.get(k + 2..k + 6).unwrap_or("");
                        let v = match u32::from_str_radix(hex, 16) {
                            Ok(v) if hex.len() == 4 => v,
                            _ => return perr(&body[k..]),
                        };
                        let c = std::char::from_u32(v).unwrap_or('\u{fffd}');
                        let mut buf = [0u8; 4];
                        out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                        k += 6;
                        continue;
                    }
                    _ => return perr(&body[k..]),
                }
                k += 2;
            }
            b => {
                out.push(b);
                k += 1;
            }
        }
    }
    perr(i) // unterminated
}

/// An empty container literal carries no element information; its
/// serialized form (a zero count) is valid under any list/map type, so
/// inference lets it unify with its siblings.
fn is_poly(n: &Node) -> bool {
    (n.ty == "la" || n.ty == "maa") && n.val == [0, 0, 0, 0]
}

fn poly_matches(n: &Node, cand: &str) -> bool {
    is_poly(n)
        && ((n.ty == "la" && cand.starts_with('l')) || (n.ty == "maa" && cand.starts_with('m')))
}

fn wrap_any(n: &Node) -> Vec<u8> {
    let mut v = Vec::with_capacity(8 + n.ty.len() + n.val.len());
    put_bytes(&mut v, n.ty.as_bytes());
    put_bytes(&mut v, &n.val);
    v
}

fn tuple_lit<'s>(i: &'s str, mode: TextMode) -> PResult<'s, Node> {
    let (start, _) = char('(')(i)?;
    let mut i = start;
    let mut items = Vec::new();
    loop {
        let (r, n) = value(i, mode)?;
        items.push(n);
        let (r, _) = ws(r)?;
        match r.chars().next() {
            Some(',') | Some(';') => i = &r[1..],
            Some(')') => {
                i = &r[1..];
                break;
            }
            _ => return perr(r),
        }
    }
    if items.len() < 2 {
        return pfail(i, Error::new(ErrorKind::TypeMismatch, "a tuple needs at least two fields"));
    }
    for it in &mut items {
        if it.ty.is_empty() {
            if mode == TextMode::Normal {
                return pfail(i, Error::new(ErrorKind::TypeMismatch, "tuple field without a type"));
            }
            *it = Node { ty: "a".to_owned(), val: wrap_any(it) };
        }
    }
    let mut ty = format!("t{}", items.len());
    let mut val = Vec::new();
    for it in items {
        ty.push_str(&it.ty);
        val.extend_from_slice(&it.val);
    }
    Ok((i, Node { ty, val }))
}

/// First pass insists on one element type; in `Liberal`/`Json` a
/// mismatch widens the element type to `a` and wraps each element.
fn list_lit<'s>(i: &'s str, mode: TextMode) -> PResult<'s, Node> {
    let (start, _) = char('[')(i)?;
    let (r, _) = ws(start)?;
    if let Some(rest) = r.strip_prefix(']') {
        return Ok((rest, Node { ty: "la".to_owned(), val: vec![0; 4] }));
    }
    let mut i = start;
    let mut items = Vec::new();
    loop {
        let (r, n) = value(i, mode)?;
        items.push(n);
        let (r, _) = ws(r)?;
        match r.chars().next() {
            Some(',') => i = &r[1..],
            Some(']') => {
                i = &r[1..];
                break;
            }
            _ => return perr(r),
        }
    }
    let candidate = items
        .iter()
        .find(|n| !is_poly(n))
        .map(|n| n.ty.clone())
        .unwrap_or_else(|| items[0].ty.clone());
    let homogeneous = !candidate.is_empty()
        && items.iter().all(|n| n.ty == candidate || poly_matches(n, &candidate));
    let mut val = Vec::new();
    put_u32(&mut val, items.len() as u32);
    let node = if homogeneous {
        let ty = format!("l{}", candidate);
        for it in &items {
            val.extend_from_slice(&it.val);
        }
        Node { ty, val }
    } else {
        if mode == TextMode::Normal {
            return pfail(i, Error::new(ErrorKind::TypeMismatch, "list elements have differing types"));
        }
        for it in &items {
            val.extend_from_slice(&wrap_any(it));
        }
        Node { ty: "la".to_owned(), val }
    };
    Ok((i, node))
}

fn map_lit<'s>(i: &'s str, mode: TextMode) -> PResult<'s, Node> {
    let (start, _) = char('{')(i)?;
    let (r, _) = ws(start)?;
    if let Some(rest) = r.strip_prefix('}') {
        return Ok((rest, Node { ty: "maa".to_owned(), val: vec![0; 4] }));
    }
    let mut i = start;
    let mut pairs = Vec::new();
    loop {
        let (r, k) = value(i, mode)?;
        let (r, _) = ws(r)?;
        let r = match r.chars().next() {
            Some(':') | Some('=') => &r[1..],
            _ => return perr(r),
        };
        let (r, v) = value(r, mode)?;
        pairs.push((k, v));
        let (r, _) = ws(r)?;
        match r.chars().next() {
            Some(',') => i = &r[1..],
            Some('}') => {
                i = &r[1..];
                break;
            }
            _ => return perr(r),
        }
    }
    let widen = |same: bool| -> Result<bool, Error> {
        if same {
            return Ok(false);
        }
        if mode == TextMode::Normal {
            return Err(Error::new(ErrorKind::TypeMismatch, "map entries have differing types"));
        }
        Ok(true)
    };
    let kcand = pairs
        .iter()
        .find(|(k, _)| !is_poly(k))
        .map(|(k, _)| k.ty.clone())
        .unwrap_or_else(|| pairs[0].0.ty.clone());
    let vcand = pairs
        .iter()
        .find(|(_, v)| !is_poly(v))
        .map(|(_, v)| v.ty.clone())
        .unwrap_or_else(|| pairs[0].1.ty.clone());
    let keys_same = !kcand.is_empty()
        && pairs.iter().all(|(k, _)| k.ty == kcand || poly_matches(k, &kcand));
    let vals_same = !vcand.is_empty()
        && pairs.iter().all(|(_, v)| v.ty == vcand || poly_matches(v, &vcand));
    let (wk, wv) = match (widen(keys_same), widen(vals_same)) {
        (Ok(a), Ok(b)) => (a, b),
        (Err(e), _) | (_, Err(e)) => return pfail(i, e),
    };
    let kty = if wk { "a".to_owned() } else { kcand };
    let vty = if wv { "a".to_owned() } else { vcand };
    let mut val = Vec::new();
    put_u32(&mut val, pairs.len() as u32);
    for (k, v) in &pairs {
        if wk {
            val.extend_from_slice(&wrap_any(k));
        } else {
            val.extend_from_slice(&k.val);
        }
        if wv {
            val.extend_from_slice(&wrap_any(v));
        } else {
            val.extend_from_slice(&v.val);
        }
    }
    Ok((i, Node { ty: format!("m{}{}", kty, vty), val }))
}

/// `<type>` coerces the value that follows (or the type's default when
/// none does) into `type`, or wraps it when the target is `a`.
fn coercion<'s>(i: &'s str, mode: TextMode) -> PResult<'s, Node> {
    let (r, _) = char('<')(i)?;
    let end = match r.find('>') {
        Some(e) => e,
        None => return perr(i),
    };
    let ty = &r[..end];
    if let Err(e) = ty.parse::<TypeStr>() {
        return pfail(i, e);
    }
    let r = &r[end + 1..];
    let (r, inner) = match value(r, mode) {
        Ok((rest, n)) => (rest, Some(n)),
        Err(nom::Err::Failure(e)) => return Err(nom::Err::Failure(e)),
        Err(_) => (r, None),
    };
    let node = match inner {
        None => match default_value(ty.as_bytes()) {
            Ok(val) => Node { ty: ty.to_owned(), val },
            Err(e) => return pfail(i, e),
        },
        Some(n) => match coerce(n, ty) {
            Ok(node) => node,
            Err(e) => return pfail(i, e),
        },
    };
    Ok((r, node))
}

fn coerce(n: Node, ty: &str) -> Result<Node, Error> {
    if ty == "a" {
        // <a> always wraps, so nested any headers nest in the text too
        return Ok(Node { ty: "a".to_owned(), val: wrap_any(&n) });
    }
    if n.ty == ty {
        return Ok(Node { ty: n.ty, val: n.val });
    }
    let mut out = Accumulator::new();
    convert(n.ty.as_bytes(), &n.val, ty.as_bytes(), Policy::ALL, None, &mut out)?;
    Ok(Node { ty: ty.to_owned(), val: out.flatten() })
}

/// `error(tag, id, message[, attached])` with string fields and an
/// optional attached value (wrapped into an `a`).
fn error_lit<'s>(i: &'s str, mode: TextMode) -> PResult<'s, Node> {
    let r = &i["error".len()..];
    let (r, _) = ws(r)?;
    let (mut r, _) = char('(')(r)?;
    let mut val = Vec::new();
    for k in 0..3 {
        let (r2, n) = value(r, mode)?;
        if n.ty != "s" {
            return pfail(r2, Error::new(ErrorKind::TypeMismatch, "error fields must be strings"));
        }
        val.extend_from_slice(&n.val);
        let (r2, _) = ws(r2)?;
        match (k, r2.chars().next()) {
            (0..=1, Some(',')) => r = &r2[1..],
            (2, _) => {
                r = r2;
                break;
            }
            _ => return perr(r2),
        }
    }
    let (r, attached) = match r.chars().next() {
        Some(',') => {
            let (r2, n) = value(&r[1..], mode)?;
            let bytes = if n.ty == "a" { n.val } else { wrap_any(&n) };
            let (r2, _) = ws(r2)?;
            (r2, bytes)
        }
        _ => (r, vec![0; 8]),
    };
    match r.strip_prefix(')') {
        Some(rest) => {
            val.extend_from_slice(&attached);
            Ok((rest, Node { ty: "e".to_owned(), val }))
        }
        None => perr(r),
    }
}
