//! Renders a (type, value) pair as text.
//!
//! Two surfaces: the native form (`<type>` header followed by the
//! value, strings `%hh`-escaped, errors as `error(...)`, embedded `a`s
//! expanded with their own angle-bracketed headers) and a JSON-like
//! form (tuples as arrays, absent optionals as `null`, error-carrying
//! expecteds routed through a caller-supplied handler). A length budget
//! may be set; rendering stops as soon as the budget is exceeded and
//! the truncated prefix stays in the caller's buffer.

use crate::codec::Reader;
use crate::error::{Error, ParseErrorKind};
use crate::type_str::{node_len, tuple_arity};

/// Handler invoked by the JSON printer when it meets an error-carrying
/// expected; receives the output buffer and the serialized `e` bytes.
pub type ExpectedHandler<'h> = &'h dyn Fn(&mut String, &[u8]) -> Result<(), Error>;

pub struct PrintOptions<'h> {
    /// Abort with a truncation error once the output exceeds this many
    /// bytes.
    pub max_len: Option<usize>,
    /// Render the JSON-like form instead of the native one.
    pub json: bool,
    /// JSON-mode handler for `e` inside expecteds; `null` when unset.
    pub expected_handler: Option<ExpectedHandler<'h>>,
}

impl Default for PrintOptions<'_> {
    fn default() -> Self {
        PrintOptions { max_len: None, json: false, expected_handler: None }
    }
}

/// Renders `val` against `ty` in the native form.
pub fn print(ty: &[u8], val: &[u8]) -> Result<String, Error> {
    let mut out = String::new();
    print_to(&mut out, ty, val, &PrintOptions::default())?;
    Ok(out)
}

/// Renders `val` against `ty` in the JSON-like form.
pub fn print_json(ty: &[u8], val: &[u8]) -> Result<String, Error> {
    let mut out = String::new();
    print_to(&mut out, ty, val, &PrintOptions { json: true, ..PrintOptions::default() })?;
    Ok(out)
}

/// Renders into `out`; on truncation the prefix written so far stays.
pub fn print_to(out: &mut String, ty: &[u8], val: &[u8], opts: &PrintOptions) -> Result<(), Error> {
    let limit = opts.max_len.map(|m| out.len() + m);
    let mut p = P { out, limit, handler: opts.expected_handler };
    let mut rd = Reader::new(val);
    let mut tpos = 0;
    if opts.json {
        p_json(&mut p, ty, &mut tpos, &mut rd)?;
    } else {
        p.push('<')?;
        p.push_str(std::str::from_utf8(ty).map_err(|_| Error::typestring(ParseErrorKind::Chr, ty, 0))?)?;
        p.push('>')?;
        p_native(&mut p, ty, &mut tpos, &mut rd)?;
    }
    if tpos < ty.len() {
        return Err(Error::typestring(ParseErrorKind::TLong, ty, tpos));
    }
    if rd.remaining() > 0 {
        return Err(Error::value_long(ty, ty.len()));
    }
    Ok(())
}

struct P<'o, 'h> {
    out: &'o mut String,
    limit: Option<usize>,
    handler: Option<ExpectedHandler<'h>>,
}

impl P<'_, '_> {
    fn check(&self) -> Result<(), Error> {
        match self.limit {
            Some(l) if self.out.len() > l => Err(Error::truncated()),
            _ => Ok(()),
        }
    }

    fn push(&mut self, c: char) -> Result<(), Error> {
        self.out.push(c);
        self.check()
    }

    fn push_str(&mut self, s: &str) -> Result<(), Error> {
        self.out.push_str(s);
        self.check()
    }
}

fn short(ty: &[u8], at: usize) -> Error {
    Error::value_short(ty, at)
}

fn read_str<'a>(rd: &mut Reader<'a>, ty: &[u8], at: usize) -> Result<&'a [u8], Error> {
    let n = rd.u32().ok_or_else(|| short(ty, at))? as usize;
    rd.take(n).ok_or_else(|| short(ty, at))
}

fn read_any<'a>(rd: &mut Reader<'a>, ty: &[u8], at: usize) -> Result<(&'a [u8], &'a [u8]), Error> {
    let tlen = rd.u32().ok_or_else(|| short(ty, at))? as usize;
    let ity = rd.take(tlen).ok_or_else(|| short(ty, at))?;
    let vlen = rd.u32().ok_or_else(|| short(ty, at))? as usize;
    let ival = rd.take(vlen).ok_or_else(|| short(ty, at))?;
    Ok((ity, ival))
}

/// `%hh` escaping for the native form; `quote` is escaped too so the
/// output re-parses.
fn native_quoted(p: &mut P, bytes: &[u8], quote: u8) -> Result<(), Error> {
    p.push(quote as char)?;
    for &b in bytes {
        if b == b'%' || b == quote || !(0x20..=0x7e).contains(&b) {
            p.push_str(&format!("%{:02x}", b))?;
        } else {
            p.push(b as char)?;
        }
    }
    p.push(quote as char)
}

fn p_native(p: &mut P, ty: &[u8], tpos: &mut usize, rd: &mut Reader) -> Result<(), Error> {
    let b = match ty.get(*tpos) {
        Some(&b) => b,
        None => return Ok(()), // void renders as nothing
    };
    let at = *tpos;
    *tpos += 1;
    match b {
        b'b' => {
            let v = rd.u8().ok_or_else(|| short(ty, at))?;
            p.push_str(if v != 0 { "true" } else { "false" })?;
        }
        b'c' => {
            let v = rd.u8().ok_or_else(|| short(ty, at))?;
            native_quoted(p, &[v], b'\'')?;
        }
        b'i' => {
            let v = rd.i32().ok_or_else(|| short(ty, at))?;
            p.push_str(&v.to_string())?;
        }
        b'I' => {
            let v = rd.i64().ok_or_else(|| short(ty, at))?;
            p.push_str(&v.to_string())?;
        }
        b'd' => {
            let v = rd.f64().ok_or_else(|| short(ty, at))?;
            p.push_str(&v.to_string())?;
        }
        b's' => {
            let s = read_str(rd, ty, at)?;
            native_quoted(p, s, b'"')?;
        }
        b'l' => {
            let n = rd.u32().ok_or_else(|| short(ty, at))?;
            let elem = *tpos;
            let elen = node_len(ty, elem)?;
            p.push('[')?;
            for i in 0..n {
                if i > 0 {
                    p.push(',')?;
                }
                *tpos = elem;
                p_native(p, ty, tpos, rd)?;
            }
            p.push(']')?;
            *tpos = elem + elen;
        }
        b'm' => {
            let n = rd.u32().ok_or_else(|| short(ty, at))?;
            let key = *tpos;
            let klen = node_len(ty, key)?;
            let mlen = node_len(ty, key + klen)?;
            p.push('{')?;
            for i in 0..n {
                if i > 0 {
                    p.push(',')?;
                }
                *tpos = key;
                p_native(p, ty, tpos, rd)?;
                p.push(':')?;
                p_native(p, ty, tpos, rd)?;
            }
            p.push('}')?;
            *tpos = key + klen + mlen;
        }
        b't' => {
            let (arity, hdr) = tuple_arity(&ty[at..]);
            *tpos = at + hdr;
            p.push('(')?;
            for i in 0..arity {
                if i > 0 {
                    p.push(',')?;
                }
                p_native(p, ty, tpos, rd)?;
            }
            p.push(')')?;
        }
        b'o' => {
            let elen = node_len(ty, *tpos)?;
            match rd.u8().ok_or_else(|| short(ty, at))? {
                0 => {
                    p.push_str("null")?;
                    *tpos += elen;
                }
                _ => p_native(p, ty, tpos, rd)?,
            }
        }
        b'x' => {
            let elen = node_len(ty, *tpos)?;
            match rd.u8().ok_or_else(|| short(ty, at))? {
                0 => {
                    p_error(p, ty, at, rd)?;
                    *tpos += elen;
                }
                _ => p_native(p, ty, tpos, rd)?,
            }
        }
        b'X' => {
            if rd.u8().ok_or_else(|| short(ty, at))? == 0 {
                p_error(p, ty, at, rd)?;
            }
        }
        b'e' => p_error(p, ty, at, rd)?,
        b'a' => {
            let (ity, ival) = read_any(rd, ty, at)?;
            p.push('<')?;
            p.push_str(
                std::str::from_utf8(ity)
                    .map_err(|_| Error::typestring(ParseErrorKind::Chr, ity, 0))?,
            )?;
            p.push('>')?;
            let mut ird = Reader::new(ival);
            let mut itpos = 0;
            p_native(p, ity, &mut itpos, &mut ird).map_err(|e| e.encaps_any(ty, at + 1))?;
            if itpos < ity.len() {
                return Err(Error::typestring(ParseErrorKind::TLong, ity, itpos)
                    .encaps_any(ty, at + 1));
            }
            if ird.remaining() > 0 {
                return Err(Error::value_long(ity, ity.len()).encaps_any(ty, at + 1));
            }
        }
        _ => return Err(Error::typestring(ParseErrorKind::Chr, ty, at)),
    }
    Ok(())
}

/// `error("tag","id","message",<attached>)`.
fn p_error(p: &mut P, ty: &[u8], at: usize, rd: &mut Reader) -> Result<(), Error> {
    p.push_str("error(")?;
    for i in 0..3 {
        if i > 0 {
            p.push(',')?;
        }
        let s = read_str(rd, ty, at)?;
        native_quoted(p, s, b'"')?;
    }
    p.push(',')?;
    let (ity, ival) = read_any(rd, ty, at)?;
    p.push('<')?;
    p.push_str(std::str::from_utf8(ity).map_err(|_| Error::typestring(ParseErrorKind::Chr, ity, 0))?)?;
    p.push('>')?;
    let mut ird = Reader::new(ival);
    let mut itpos = 0;
    p_native(p, ity, &mut itpos, &mut ird)?;
    p.push(')')
}

fn json_quoted(p: &mut P, bytes: &[u8]) -> Result<(), Error> {
    p.push('"')?;
    for &b in bytes {
        match b {
            b'"' => p.push_str("\\\"")?,
            b'\\' => p.push_str("\\\\")?,
            0x08 => p.push_str("\\b")?,
            0x0c => p.push_str("\\f")?,
            b'\n' => p.push_str("\\n")?,
            b'\r' => p.push_str("\\r")?,
            b'\t' => p.push_str("\\t")?,
            0x20..=0x7e => p.push(b as char)?,
            _ => p.push_str(&format!("\\u{:04x}", b))?,
        }
    }
    p.push('"')
}

fn p_json(p: &mut P, ty: &[u8], tpos: &mut usize, rd: &mut Reader) -> Result<(), Error> {
    let b = match ty.get(*tpos) {
        Some(&b) => b,
        None => return p.push_str("null"),
    };
    let at = *tpos;
    *tpos += 1;
    match b {
        b'b' => {
            let v = rd.u8().ok_or_else(|| short(ty, at))?;
            p.push_str(if v != 0 { "true" } else { "false" })?;
        }
        b'c' => {
            let v = rd.u8().ok_or_else(|| short(ty, at))?;
            json_quoted(p, &[v])?;
        }
        b'i' => {
            let v = rd.i32().ok_or_else(|| short(ty, at))?;
            p.push_str(&v.to_string())?;
        }
        b'I' => {
            let v = rd.i64().ok_or_else(|| short(ty, at))?;
            p.push_str(&v.to_string())?;
        }
        b'd' => {
            // no trailing dot: integral doubles format without one
            let v = rd.f64().ok_or_else(|| short(ty, at))?;
            p.push_str(&v.to_string())?;
        }
        b's' => {
            let s = read_str(rd, ty, at)?;
            json_quoted(p, s)?;
        }
        b'l' => {
            let n = rd.u32().ok_or_else(|| short(ty, at))?;
            let elem = *tpos;
            let elen = node_len(ty, elem)?;
            p.push('[')?;
            for i in 0..n {
                if i > 0 {
                    p.push(',')?;
                }
                *tpos = elem;
                p_json(p, ty, tpos, rd)?;
            }
            p.push(']')?;
            *tpos = elem + elen;
        }
        b'm' => {
            let n = rd.u32().ok_or_else(|| short(ty, at))?;
            let key = *tpos;
            let klen = node_len(ty, key)?;
            let mlen = node_len(ty, key + klen)?;
            p.push('{')?;
            for i in 0..n {
                if i > 0 {
                    p.push(',')?;
                }
                *tpos = key;
                if ty.get(key) == Some(&b's') {
                    let s = read_str(rd, ty, key)?;
                    json_quoted(p, s)?;
                    *tpos = key + klen;
                } else {
                    // non-string keys become their JSON text, quoted
                    let mut tmp = String::new();
                    {
                        let mut sub = P { out: &mut tmp, limit: None, handler: p.handler };
                        p_json(&mut sub, ty, tpos, rd)?;
                    }
                    json_quoted(p, tmp.as_bytes())?;
                }
                p.push(':')?;
                p_json(p, ty, tpos, rd)?;
            }
            p.push('}')?;
            *tpos = key + klen + mlen;
        }
        b't' => {
            let (arity, hdr) = tuple_arity(&ty[at..]);
            *tpos = at + hdr;
            p.push('[')?;
            for i in 0..arity {
                if i > 0 {
                    p.push(',')?;
                }
                p_json(p, ty, tpos, rd)?;
            }
            p.push(']')?;
        }
        b'o' => {
            let elen = node_len(ty, *tpos)?;
            match rd.u8().ok_or_else(|| short(ty, at))? {
                0 => {
                    p.push_str("null")?;
                    *tpos += elen;
                }
                _ => p_json(p, ty, tpos, rd)?,
            }
        }
        b'x' => {
            let elen = node_len(ty, *tpos)?;
            match rd.u8().ok_or_else(|| short(ty, at))? {
                0 => {
                    json_expected_error(p, ty, at, rd)?;
                    *tpos += elen;
                }
                _ => p_json(p, ty, tpos, rd)?,
            }
        }
        b'X' => match rd.u8().ok_or_else(|| short(ty, at))? {
            0 => json_expected_error(p, ty, at, rd)?,
            _ => p.push_str("null")?,
        },
        b'e' => json_expected_error(p, ty, at, rd)?,
        b'a' => {
            let (ity, ival) = read_any(rd, ty, at)?;
            let mut ird = Reader::new(ival);
            let mut itpos = 0;
            p_json(p, ity, &mut itpos, &mut ird).map_err(|e| e.encaps_any(ty, at + 1))?;
        }
        _ => return Err(Error::typestring(ParseErrorKind::Chr, ty, at)),
    }
    Ok(())
}

fn json_expected_error(p: &mut P, ty: &[u8], at: usize, rd: &mut Reader) -> Result<(), Error> {
    let start = rd.pos();
    // consume the serialized error
    for _ in 0..3 {
        read_str(rd, ty, at)?;
    }
    read_any(rd, ty, at)?;
    match p.handler {
        Some(h) => {
            h(p.out, rd.taken_since(start))?;
            p.check()
        }
        None => p.push_str("null"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{put_i32, put_u32};

    fn wire_str(s: &str) -> Vec<u8> {
        let mut v = Vec::new();
        put_u32(&mut v, s.len() as u32);
        v.extend_from_slice(s.as_bytes());
        v
    }

    #[test]
    fn native_scalars() {
        assert_eq!(print(b"b", &[1]).unwrap(), "<b>true");
        assert_eq!(print(b"i", &[255, 255, 255, 255]).unwrap(), "<i>-1");
        assert_eq!(print(b"c", b"A").unwrap(), "<c>'A'");
        assert_eq!(print(b"c", &[0x0a]).unwrap(), "<c>'%0a'");
        assert_eq!(print(b"s", &wire_str("a%b\"c")).unwrap(), "<s>\"a%25b%22c\"");
        assert_eq!(print(b"", b"").unwrap(), "<>");
    }

    #[test]
    fn native_containers() {
        let mut v = Vec::new();
        put_u32(&mut v, 2);
        put_i32(&mut v, 1);
        put_i32(&mut v, 2);
        assert_eq!(print(b"li", &v).unwrap(), "<li>[1,2]");

        let mut v = Vec::new();
        put_u32(&mut v, 1);
        v.extend_from_slice(&wire_str("k"));
        put_i32(&mut v, 3);
        assert_eq!(print(b"msi", &v).unwrap(), "<msi>{\"k\":3}");

        let mut v = vec![1u8];
        put_i32(&mut v, 9);
        assert_eq!(print(b"oi", &v).unwrap(), "<oi>9");
        assert_eq!(print(b"oi", &[0]).unwrap(), "<oi>null");
    }

    #[test]
    fn native_any_and_error() {
        let mut v = Vec::new();
        put_u32(&mut v, 1);
        v.push(b'i');
        put_u32(&mut v, 4);
        put_i32(&mut v, 42);
        assert_eq!(print(b"a", &v).unwrap(), "<a><i>42");
        assert_eq!(
            print(b"e", &crate::default_value(b"e").unwrap()).unwrap(),
            "<e>error(\"\",\"\",\"\",<>)"
        );
    }

    #[test]
    fn json_form() {
        let mut v = Vec::new();
        put_u32(&mut v, 1);
        v.extend_from_slice(&wire_str("k"));
        put_i32(&mut v, 7);
        crate::codec::put_f64(&mut v, 1.5);
        assert_eq!(print_json(b"mst2id", &v).unwrap(), "{\"k\":[7,1.5]}");
        // integral doubles print without a trailing dot
        let mut v = Vec::new();
        crate::codec::put_f64(&mut v, 2.0);
        assert_eq!(print_json(b"d", &v).unwrap(), "2");
        // non-string keys are stringified
        let mut v = Vec::new();
        put_u32(&mut v, 1);
        put_i32(&mut v, 4);
        v.push(1);
        assert_eq!(print_json(b"mib", &v).unwrap(), "{\"4\":true}");
        assert_eq!(print_json(b"oi", &[0]).unwrap(), "null");
        assert_eq!(print_json(b"X", &[1]).unwrap(), "null");
    }

    #[test]
    fn json_expected_handler() {
        let mut v = vec![0u8];
        v.extend_from_slice(&crate::default_value(b"e").unwrap());
        assert_eq!(print_json(b"xi", &v).unwrap(), "null");
        let handler: ExpectedHandler = &|out: &mut String, e: &[u8]| {
            out.push_str(&format!("\"error:{}b\"", e.len()));
            Ok(())
        };
        let mut out = String::new();
        print_to(
            &mut out,
            b"xi",
            &v,
            &PrintOptions { json: true, expected_handler: Some(handler), ..PrintOptions::default() },
        )
        .unwrap();
        assert_eq!(out, "\"error:20b\"");
    }

    #[test]
    fn budget_truncates() {
        let mut v = Vec::new();
        put_u32(&mut v, 100);
        for i in 0..100 {
            put_i32(&mut v, i);
        }
        let mut out = String::new();
        let err = print_to(&mut out, b"li", &v, &PrintOptions { max_len: Some(16), ..PrintOptions::default() })
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Truncated);
        assert!(out.len() > 16 && out.len() < 24, "partial output stays: {:?}", out);
    }
}
