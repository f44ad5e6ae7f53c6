//! The self-describing value container: a type descriptor paired with
//! the serialized bytes it describes. [`Any`] owns the pair,
//! [`AnyView`] borrows it.

use std::fmt;
use std::io::Cursor;

use crate::chunk::Accumulator;
use crate::codec::{put_bytes, Reader};
use crate::convert::{self, Policy};
use crate::error::{Error, ErrorKind, ParseErrorKind};
use crate::scan;
use crate::serialize::Serializable;
use crate::text::{parse_text, TextMode};
use crate::type_str::{node_len, tuple_arity, TypeStr};

/// An owned (type, value) pair. Scanning the value against the type
/// consumes exactly the bytes held.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Any {
    ty: TypeStr,
    val: Vec<u8>,
}

/// A borrowed (type, value) pair, e.g. one element of a larger value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnyView<'a> {
    ty: &'a [u8],
    val: &'a [u8],
}

impl Any {
    /// Serializes a host value under its canonical descriptor.
    pub fn from_typed<T: Serializable>(value: &T) -> Result<Any, Error> {
        let mut val = Vec::new();
        value
            .write(&mut val)
            .map_err(|_| Error::api("host value failed to serialize"))?;
        Ok(Any { ty: T::type_str(), val })
    }

    /// Parses a host value back out; the descriptor must match exactly.
    pub fn to_typed<T: Serializable>(&self) -> Result<T, Error> {
        if self.ty != T::type_str() {
            return Err(Error::type_mismatch()
                .with_source(self.ty.as_bytes(), 0)
                .with_target(T::type_str().as_bytes(), 0));
        }
        let mut c = Cursor::new(self.val.as_slice());
        let v = T::read(&mut c).map_err(|_| Error::value_short(self.ty.as_bytes(), 0))?;
        if (c.position() as usize) < self.val.len() {
            return Err(Error::value_long(self.ty.as_bytes(), self.ty.as_bytes().len()));
        }
        Ok(v)
    }

    /// Parses the textual surface syntax.
    pub fn from_text(text: &str, mode: TextMode) -> Result<Any, Error> {
        let (ty, val) = parse_text(text, mode)?;
        Ok(Any { ty, val })
    }

    /// Reads the self-contained wire form
    /// `u32 Tlen | type | u32 Vlen | value` and validates it.
    pub fn from_wire(bytes: &[u8]) -> Result<Any, Error> {
        let mut rd = Reader::new(bytes);
        let fail = || Error::value_short(b"a", 0);
        let tlen = rd.u32().ok_or_else(fail)? as usize;
        let ty = rd.take(tlen).ok_or_else(fail)?;
        let vlen = rd.u32().ok_or_else(fail)? as usize;
        let val = rd.take(vlen).ok_or_else(fail)?;
        if rd.remaining() > 0 {
            return Err(Error::value_long(ty, ty.len()));
        }
        let ty = std::str::from_utf8(ty)
            .map_err(|_| Error::typestring(ParseErrorKind::Chr, ty, 0))?;
        Any::from_parts(ty, val.to_vec(), true)
    }

    /// Builds from a descriptor and serialized bytes. With `check` set,
    /// the value is scanned (recursively through any `a`s) and must
    /// consume exactly the bytes given.
    pub fn from_parts(ty: &str, val: Vec<u8>, check: bool) -> Result<Any, Error> {
        let ty: TypeStr = ty.parse()?;
        if check {
            let (tc, vc) = scan::scan(ty.as_bytes(), &val, true)?;
            if tc < ty.as_bytes().len() {
                return Err(Error::typestring(ParseErrorKind::TLong, ty.as_bytes(), tc));
            }
            if vc < val.len() {
                return Err(Error::value_long(ty.as_bytes(), tc));
            }
        }
        Ok(Any { ty, val })
    }

    /// The canonical zero value of `ty`.
    pub fn default_of(ty: &str) -> Result<Any, Error> {
        let ty: TypeStr = ty.parse()?;
        let val = crate::default_value(ty.as_bytes())?;
        Ok(Any { ty, val })
    }

    pub fn type_str(&self) -> &TypeStr {
        &self.ty
    }

    pub fn value(&self) -> &[u8] {
        &self.val
    }

    pub fn is_void(&self) -> bool {
        self.ty.is_void()
    }

    pub fn as_view(&self) -> AnyView<'_> {
        AnyView { ty: self.ty.as_bytes(), val: &self.val }
    }

    /// The wire form with the `Tlen`/`Vlen` framing.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.ty.as_bytes().len() + self.val.len());
        put_bytes(&mut out, self.ty.as_bytes());
        put_bytes(&mut out, &self.val);
        out
    }

    /// Converts into `target` under `policy`.
    pub fn convert_to(&self, target: &str, policy: Policy) -> Result<Any, Error> {
        let target: TypeStr = target.parse()?;
        let mut out = Accumulator::new();
        convert::convert(self.ty.as_bytes(), &self.val, target.as_bytes(), policy, None, &mut out)?;
        Ok(Any { ty: target, val: out.flatten() })
    }

    /// Container element count (see [`AnyView::size`]).
    pub fn size(&self) -> Result<usize, Error> {
        self.as_view().size()
    }

    /// The `i`-th element of a container value.
    pub fn element(&self, i: usize) -> Result<AnyView<'_>, Error> {
        self.as_view().element(i)
    }

    /// The `i`-th key/value pair of a map.
    pub fn entry(&self, i: usize) -> Result<(AnyView<'_>, AnyView<'_>), Error> {
        self.as_view().entry(i)
    }

    /// Looks a key up in a map by serialized-byte comparison.
    pub fn lookup(&self, key: &[u8]) -> Result<Option<AnyView<'_>>, Error> {
        self.as_view().lookup(key)
    }

    pub fn print(&self) -> Result<String, Error> {
        crate::print::print(self.ty.as_bytes(), &self.val)
    }

    pub fn print_json(&self) -> Result<String, Error> {
        crate::print::print_json(self.ty.as_bytes(), &self.val)
    }
}

impl fmt::Display for Any {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.as_view(), f)
    }
}

impl<'a> AnyView<'a> {
    /// Borrows a (type, value) pair without copying. With `check` set,
    /// the pair is validated like [`Any::from_parts`].
    pub fn new(ty: &'a str, val: &'a [u8], check: bool) -> Result<AnyView<'a>, Error> {
        let tb = ty.as_bytes();
        if check {
            crate::type_str::validate(tb).map_err(|(k, p)| Error::typestring(k, tb, p))?;
            let (_, vc) = scan::scan(tb, val, true)?;
            if vc < val.len() {
                return Err(Error::value_long(tb, tb.len()));
            }
        }
        Ok(AnyView { ty: tb, val })
    }

    pub fn type_bytes(&self) -> &'a [u8] {
        self.ty
    }

    pub fn value(&self) -> &'a [u8] {
        self.val
    }

    pub fn to_any(&self) -> Result<Any, Error> {
        let ty = std::str::from_utf8(self.ty)
            .map_err(|_| Error::typestring(ParseErrorKind::Chr, self.ty, 0))?;
        Any::from_parts(ty, self.val.to_vec(), false)
    }

    /// Container element count: runtime count for `l`/`m`, arity for
    /// `t`, the flag for `o`, 1 for `a`/`x`/`X`, 3 for `e`, else 0.
    pub fn size(&self) -> Result<usize, Error> {
        let b = match self.ty.first() {
            Some(&b) => b,
            None => return Ok(0),
        };
        let mut rd = Reader::new(self.val);
        Ok(match b {
            b'l' | b'm' => rd.u32().ok_or_else(|| Error::value_short(self.ty, 0))? as usize,
            b't' => tuple_arity(self.ty).0,
            b'o' => rd.u8().ok_or_else(|| Error::value_short(self.ty, 0))? as usize,
            b'a' | b'x' | b'X' => 1,
            b'e' => 3,
            _ => 0,
        })
    }

    /// The `i`-th element. For `e`, the elements are the id, the
    /// message and the attached `a` (the leading type tag is part of
    /// the header). For an `x`/`X` carrying an error, the single
    /// element is that `e`.
    pub fn element(&self, i: usize) -> Result<AnyView<'a>, Error> {
        element_at(self.ty, self.val, i)
    }

    pub fn entry(&self, i: usize) -> Result<(AnyView<'a>, AnyView<'a>), Error> {
        let b = self.ty.first().copied();
        if b != Some(b'm') {
            return Err(Error::api("entry() requires a map"));
        }
        let klen = node_len(self.ty, 1)?;
        let kty = &self.ty[1..1 + klen];
        let mlen = node_len(self.ty, 1 + klen)?;
        let mty = &self.ty[1 + klen..1 + klen + mlen];
        let mut rd = Reader::new(self.val);
        let n = rd.u32().ok_or_else(|| Error::value_short(self.ty, 0))? as usize;
        if i >= n {
            return Err(Error::api("map entry index out of range"));
        }
        let mut off = rd.pos();
        for _ in 0..i {
            off += scan::value_extent(self.ty, 1, &self.val[off..])?;
            off += scan::value_extent(self.ty, 1 + klen, &self.val[off..])?;
        }
        let ke = scan::value_extent(self.ty, 1, &self.val[off..])?;
        let key = AnyView { ty: kty, val: &self.val[off..off + ke] };
        let ve = scan::value_extent(self.ty, 1 + klen, &self.val[off + ke..])?;
        let value = AnyView { ty: mty, val: &self.val[off + ke..off + ke + ve] };
        Ok((key, value))
    }

    /// First map entry whose key's serialized bytes equal `key`.
    pub fn lookup(&self, key: &[u8]) -> Result<Option<AnyView<'a>>, Error> {
        let n = self.size()?;
        for i in 0..n {
            let (k, v) = self.entry(i)?;
            if k.val == key {
                return Ok(Some(v));
            }
        }
        Ok(None)
    }

    pub fn print(&self) -> Result<String, Error> {
        crate::print::print(self.ty, self.val)
    }

    pub fn print_json(&self) -> Result<String, Error> {
        crate::print::print_json(self.ty, self.val)
    }
}

impl fmt::Display for AnyView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match crate::print::print(self.ty, self.val) {
            Ok(s) => f.write_str(&s),
            Err(e) if e.kind() == ErrorKind::Truncated => f.write_str("..."),
            Err(_) => f.write_str("<invalid>"),
        }
    }
}

fn element_at<'a>(ty: &'a [u8], val: &'a [u8], idx: usize) -> Result<AnyView<'a>, Error> {
    let oob = || Error::api("element index out of range");
    let b = match ty.first() {
        Some(&b) => b,
        None => return Err(oob()),
    };
    let mut rd = Reader::new(val);
    match b {
        b'l' => {
            let ety = &ty[1..1 + node_len(ty, 1)?];
            let n = rd.u32().ok_or_else(|| Error::value_short(ty, 0))? as usize;
            if idx >= n {
                return Err(oob());
            }
            let mut off = rd.pos();
            for _ in 0..idx {
                off += scan::value_extent(ty, 1, &val[off..])?;
            }
            let e = scan::value_extent(ty, 1, &val[off..])?;
            Ok(AnyView { ty: ety, val: &val[off..off + e] })
        }
        b't' => {
            let (arity, hdr) = tuple_arity(ty);
            if idx >= arity {
                return Err(oob());
            }
            let mut tpos = hdr;
            let mut off = 0;
            for _ in 0..idx {
                let flen = node_len(ty, tpos)?;
                off += scan::value_extent(ty, tpos, &val[off..])?;
                tpos += flen;
            }
            let flen = node_len(ty, tpos)?;
            let e = scan::value_extent(ty, tpos, &val[off..])?;
            Ok(AnyView { ty: &ty[tpos..tpos + flen], val: &val[off..off + e] })
        }
        b'o' => {
            if idx > 0 || val.first() != Some(&1) {
                return Err(oob());
            }
            Ok(AnyView { ty: &ty[1..], val: &val[1..] })
        }
        b'x' => {
            if idx > 0 {
                return Err(oob());
            }
            match val.first() {
                Some(&1) => Ok(AnyView { ty: &ty[1..], val: &val[1..] }),
                Some(&0) => Ok(AnyView { ty: b"e", val: &val[1..] }),
                _ => Err(Error::value_short(ty, 0)),
            }
        }
        b'X' => {
            if idx > 0 {
                return Err(oob());
            }
            match val.first() {
                Some(&1) => Ok(AnyView { ty: b"", val: b"" }),
                Some(&0) => Ok(AnyView { ty: b"e", val: &val[1..] }),
                _ => Err(Error::value_short(ty, 0)),
            }
        }
        b'a' => {
            if idx > 0 {
                return Err(oob());
            }
            let tlen = rd.u32().ok_or_else(|| Error::value_short(ty, 0))? as usize;
            let ity = rd.take(tlen).ok_or_else(|| Error::value_short(ty, 0))?;
            let vlen = rd.u32().ok_or_else(|| Error::value_short(ty, 0))? as usize;
            let ival = rd.take(vlen).ok_or_else(|| Error::value_short(ty, 0))?;
            Ok(AnyView { ty: ity, val: ival })
        }
        b'e' => {
            // fields of the t4sssa layout, skipping the type tag
            static E_TY: &[u8] = b"t4sssa";
            let field = idx + 1;
            if field > 3 {
                return Err(oob());
            }
            let mut tpos = 2;
            let mut off = 0;
            for _ in 0..field {
                let flen = node_len(E_TY, tpos)?;
                off += scan::value_extent(E_TY, tpos, &val[off..])?;
                tpos += flen;
            }
            let flen = node_len(E_TY, tpos)?;
            let e = scan::value_extent(E_TY, tpos, &val[off..])?;
            Ok(AnyView { ty: &E_TY[tpos..tpos + flen], val: &val[off..off + e] })
        }
        _ => Err(oob()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_construction() {
        let v = Any::from_text("[(1, \"one\"), (2, \"two\")]", TextMode::Normal).unwrap();
        assert_eq!(v.type_str().as_str(), "lt2is");
        assert_eq!(v.size().unwrap(), 2);
        let first = v.element(0).unwrap();
        assert_eq!(first.type_bytes(), b"t2is");
        assert_eq!(first.element(0).unwrap().value(), &[0, 0, 0, 1]);
    }

    #[test]
    fn wire_roundtrip() {
        let v = Any::from_text("{\"a\": 1}", TextMode::Normal).unwrap();
        let wire = v.to_wire();
        let back = Any::from_wire(&wire).unwrap();
        assert_eq!(v, back);
    }

    #[test]
    fn from_parts_checks() {
        assert!(Any::from_parts("i", vec![0, 0, 0, 1], true).is_ok());
        assert!(Any::from_parts("i", vec![0, 0], true).is_err());
        assert!(Any::from_parts("i", vec![0, 0, 0, 1, 9], true).is_err());
        assert!(Any::from_parts("ii", vec![0; 8], true).is_err());
    }

    #[test]
    fn map_access() {
        let v = Any::from_text("{\"a\": 1, \"b\": 2}", TextMode::Normal).unwrap();
        let (k, _) = v.entry(0).unwrap();
        assert_eq!(&k.value()[4..], b"a");
        let key = Any::from_typed(&"b".to_string()).unwrap();
        let hit = v.lookup(key.value()).unwrap().unwrap();
        assert_eq!(hit.value(), &[0, 0, 0, 2]);
        let missing = Any::from_typed(&"z".to_string()).unwrap();
        assert!(v.lookup(missing.value()).unwrap().is_none());
    }

    #[test]
    fn conversion() {
        let v = Any::from_text("[1, 2, 3]", TextMode::Normal).unwrap();
        let t = v.convert_to("t3iii", Policy::TUPLE_LIST).unwrap();
        assert_eq!(t.type_str().as_str(), "t3iii");
        assert_eq!(t.value(), &v.value()[4..]);
    }

    #[test]
    fn display_is_native_print() {
        let v = Any::from_text("(1, \"x\")", TextMode::Normal).unwrap();
        assert_eq!(format!("{}", v), "<t2is>(1,\"x\")");
    }

    #[test]
    fn expected_elements() {
        let v = Any::from_text("<xi>5", TextMode::Normal).unwrap();
        assert_eq!(v.size().unwrap(), 1);
        assert_eq!(v.element(0).unwrap().type_bytes(), b"i");
        let e = Any::from_text("error(\"t\", \"id\", \"msg\")", TextMode::Normal).unwrap();
        assert_eq!(e.size().unwrap(), 3);
        assert_eq!(&e.element(1).unwrap().value()[4..], b"msg");
    }
}
