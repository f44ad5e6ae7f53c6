//! The structural conversion engine: walks a source type (and
//! optionally its value) against a target type and either proves the
//! two incompatible or emits the converted value.
//!
//! Three entry points share one recursive body: [`check_convertible`]
//! (types only), [`consume`] (reads the source value, discards output)
//! and [`convert`] (produces bytes into an [`Accumulator`]). Whether a
//! source value or an output sink is present is carried as an `Option`,
//! so the forbidden no-source-with-target combination cannot be
//! expressed.

use bitflags::bitflags;
use log::trace;

use crate::chunk::Accumulator;
use crate::codec::Reader;
use crate::default_value::write_default;
use crate::error::{Error, ErrorKind};
use crate::scan::value_extent;
use crate::type_str::{self, node_len, tuple_arity};

bitflags! {
    /// Flags enabling specific classes of cross-type conversion.
    ///
    /// All default to off; [`Policy::ALL`] is the union. The bit values
    /// are stable.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Policy: u32 {
        /// Wrap anything into an `a`, or unwrap an `a` into a
        /// compatible target.
        const ANY = 0x01;
        /// Cross between `T`, `oT`, `xT`, `X` and `e`.
        const EXPECTED = 0x02;
        /// `s` ↔ `lc`, and void ↔ `oT`.
        const AUX = 0x04;
        /// `b` ↔ `c`/`i`/`I`.
        const BOOL = 0x08;
        /// Widening integer conversions.
        const INTS = 0x10;
        /// Narrowing integer conversions (subsumes widening).
        const INTS_NARROWING = 0x20;
        /// `i`/`I` ↔ `d`.
        const DOUBLE = 0x40;
        /// Fixed-length `lT` ↔ `tN T…T` when the lengths match at
        /// runtime.
        const TUPLE_LIST = 0x80;
        /// Union of every other flag.
        const ALL = 0xff;
    }
}

/// Checks that a value of `src_ty` could convert into `dst_ty` under
/// `policy`, without looking at any value bytes.
pub fn check_convertible(src_ty: &[u8], dst_ty: &[u8], policy: Policy) -> Result<(), Error> {
    let mut cx = Cx { policy, collected: None };
    let (mut st, mut dt) = entry_cursors(src_ty, dst_ty)?;
    conv(&mut cx, &mut st, None, &mut dt, None)
}

/// Converts, consuming the source value but discarding the output.
/// Returns the number of source-value bytes consumed.
pub fn consume(
    src_ty: &[u8],
    src_val: &[u8],
    dst_ty: &[u8],
    policy: Policy,
    collected: Option<&mut Vec<Error>>,
) -> Result<usize, Error> {
    let mut cx = Cx { policy, collected };
    let (mut st, mut dt) = entry_cursors(src_ty, dst_ty)?;
    let mut rd = Reader::new(src_val);
    conv(&mut cx, &mut st, Some(&mut rd), &mut dt, None)?;
    Ok(rd.pos())
}

/// Converts a value of `src_ty` into `dst_ty`, appending the produced
/// bytes to `out`. Returns the number of source-value bytes consumed.
pub fn convert<'a>(
    src_ty: &'a [u8],
    src_val: &'a [u8],
    dst_ty: &[u8],
    policy: Policy,
    collected: Option<&mut Vec<Error>>,
    out: &mut Accumulator<'a>,
) -> Result<usize, Error> {
    let mut cx = Cx { policy, collected };
    let (mut st, mut dt) = entry_cursors(src_ty, dst_ty)?;
    let mut rd = Reader::new(src_val);
    conv(&mut cx, &mut st, Some(&mut rd), &mut dt, Some(out))?;
    Ok(rd.pos())
}

fn entry_cursors<'a, 'b>(src_ty: &'a [u8], dst_ty: &'b [u8]) -> Result<(Ty<'a>, Ty<'b>), Error> {
    type_str::validate(src_ty).map_err(|(k, p)| Error::typestring(k, src_ty, p))?;
    type_str::validate(dst_ty).map_err(|(k, p)| Error::typestring(k, dst_ty, p))?;
    Ok((Ty::new(src_ty), Ty::new(dst_ty)))
}

struct Cx<'c> {
    policy: Policy,
    collected: Option<&'c mut Vec<Error>>,
}

/// A position inside a full descriptor. `Copy`, for backtracking.
#[derive(Clone, Copy)]
struct Ty<'a> {
    s: &'a [u8],
    pos: usize,
}

impl<'a> Ty<'a> {
    fn new(s: &'a [u8]) -> Self {
        Ty { s, pos: 0 }
    }

    fn void() -> Ty<'static> {
        Ty { s: &[], pos: 0 }
    }

    fn at(&self, pos: usize) -> Ty<'a> {
        Ty { s: self.s, pos }
    }

    fn peek(&self) -> Option<u8> {
        self.s.get(self.pos).copied()
    }

    /// The bytes of the node at the cursor (empty for void).
    fn node(&self) -> Result<&'a [u8], Error> {
        let len = node_len(self.s, self.pos)?;
        Ok(&self.s[self.pos..self.pos + len])
    }
}

fn mismatch(st: &Ty, dt: &Ty) -> Error {
    Error::type_mismatch().with_source(st.s, st.pos).with_target(dt.s, dt.pos)
}

fn need(cx: &Cx, p: Policy, st: &Ty, dt: &Ty) -> Result<(), Error> {
    if cx.policy.contains(p) {
        return Ok(());
    }
    trace!("conversion denied, needs {:?}", p);
    Err(mismatch(st, dt).with_policy(p))
}

fn underflow(st: &Ty) -> Error {
    Error::value_short(st.s, st.pos)
}

fn bad_flag(st: &Ty) -> Error {
    Error::new(ErrorKind::ValueMismatch, "invalid flag byte in value of type %1")
        .with_source(st.s, st.pos)
}

/// Reads the serialized `e` at the reader and returns its bytes.
fn take_error<'a>(st: &Ty, sv: &mut Reader<'a>) -> Result<&'a [u8], Error> {
    let len = value_extent(b"e", 0, sv.rest())
        .map_err(|_| underflow(st))?;
    Ok(sv.take(len).expect("extent was just scanned"))
}

fn record_expected(cx: &mut Cx, st: &Ty, dt: &Ty, ebytes: &[u8]) -> Result<(), Error> {
    let err = decode_error_value(ebytes);
    match cx.collected.as_deref_mut() {
        Some(list) => {
            list.push(err);
            Ok(())
        }
        None => Err(Error::new(
            ErrorKind::TypeMismatch,
            "expected value carries an error converting %1 into %2",
        )
        .with_source(st.s, st.pos)
        .with_target(dt.s, dt.pos)),
    }
}

fn decode_error_value(b: &[u8]) -> Error {
    fn rd_str(r: &mut Reader) -> Option<String> {
        let n = r.u32()? as usize;
        let s = r.take(n)?;
        Some(String::from_utf8_lossy(s).into_owned())
    }
    let mut r = Reader::new(b);
    match (rd_str(&mut r), rd_str(&mut r), rd_str(&mut r)) {
        (Some(tag), Some(id), Some(msg)) => {
            Error::new(ErrorKind::ExpectedWithError, format!("{} {}: {}", tag, id, msg))
        }
        _ => Error::new(ErrorKind::ExpectedWithError, "malformed error value"),
    }
}

/// Collects cursors to every field of a tuple node; `e` exposes the
/// fields of its `t4sssa` layout.
fn tuple_fields<'x>(cur: &Ty<'x>, node: &[u8]) -> Result<Vec<Ty<'x>>, Error> {
    if node.first() == Some(&b'e') {
        static E_FIELDS: &[u8] = b"sssa";
        return Ok((0..4).map(|i| Ty { s: E_FIELDS, pos: i }).collect());
    }
    let (arity, hdr) = tuple_arity(node);
    let mut fields = Vec::with_capacity(arity);
    let mut pos = cur.pos + hdr;
    for _ in 0..arity {
        fields.push(cur.at(pos));
        pos += node_len(cur.s, pos)?;
    }
    Ok(fields)
}

#[allow(clippy::too_many_lines)]
fn conv<'a, 'b>(
    cx: &mut Cx,
    st: &mut Ty<'a>,
    mut sv: Option<&mut Reader<'a>>,
    dt: &mut Ty<'b>,
    mut out: Option<&mut Accumulator<'a>>,
) -> Result<(), Error> {
    debug_assert!(!(sv.is_none() && out.is_some()));
    let s_node = st.node()?;
    let d_node = dt.node()?;

    // identical types copy through, independent of policy
    if !s_node.is_empty() && s_node == d_node {
        if let Some(sv) = sv.as_deref_mut() {
            let vlen = value_extent(st.s, st.pos, sv.rest())?;
            let bytes = sv.take(vlen).expect("extent was just scanned");
            if let Some(out) = out.as_deref_mut() {
                out.push(bytes);
            }
        }
        st.pos += s_node.len();
        dt.pos += d_node.len();
        return Ok(());
    }

    // a void source
    let s = match s_node.first().copied() {
        Some(s) => s,
        None => {
            match d_node.first().copied() {
                None => {}
                Some(b'a') => {
                    need(cx, Policy::ANY, st, dt)?;
                    if let Some(out) = out.as_deref_mut() {
                        out.put_u32(0);
                        out.put_u32(0);
                    }
                }
                Some(b'X') => {
                    need(cx, Policy::EXPECTED, st, dt)?;
                    if let Some(out) = out.as_deref_mut() {
                        out.push_byte(1);
                    }
                }
                Some(b'o') => {
                    need(cx, Policy::AUX, st, dt)?;
                    if let Some(out) = out.as_deref_mut() {
                        out.push_byte(0);
                    }
                }
                Some(_) => return Err(mismatch(st, dt)),
            }
            dt.pos += d_node.len();
            return Ok(());
        }
    };
    let d = d_node.first().copied();

    // wrapping into a target `a`
    if d == Some(b'a') {
        need(cx, Policy::ANY, st, dt)?;
        dt.pos += d_node.len();
        if let Some(sv) = sv.as_deref_mut() {
            let vlen = value_extent(st.s, st.pos, sv.rest())?;
            let bytes = sv.take(vlen).expect("extent was just scanned");
            if let Some(out) = out.as_deref_mut() {
                out.put_u32(s_node.len() as u32);
                out.push(s_node);
                out.put_u32(vlen as u32);
                out.push(bytes);
            }
        }
        st.pos += s_node.len();
        return Ok(());
    }

    // a target expected
    if d == Some(b'x') || d == Some(b'X') {
        let d_end = dt.pos + d_node.len();
        let d_in = if d == Some(b'x') { dt.at(dt.pos + 1) } else { Ty::void() };
        match s {
            b'e' => {
                // the error goes into the error slot
                need(cx, Policy::EXPECTED, st, dt)?;
                if let Some(sv) = sv.as_deref_mut() {
                    let vlen = value_extent(st.s, st.pos, sv.rest())?;
                    let bytes = sv.take(vlen).expect("extent was just scanned");
                    if let Some(out) = out.as_deref_mut() {
                        out.push_byte(0);
                        out.push(bytes);
                    }
                }
                st.pos += s_node.len();
                dt.pos = d_end;
                return Ok(());
            }
            b'x' | b'X' => {
                let s_end = st.pos + s_node.len();
                let s_in = if s == b'x' { st.at(st.pos + 1) } else { Ty::void() };
                if let Some(sv) = sv.as_deref_mut() {
                    match sv.u8().ok_or_else(|| underflow(st))? {
                        0 => {
                            let bytes = take_error(st, sv)?;
                            if let Some(out) = out.as_deref_mut() {
                                out.push_byte(0);
                                out.push(bytes);
                            }
                            expected_inner_check(cx, s_in, d_in)?;
                        }
                        1 => {
                            if let Some(out) = out.as_deref_mut() {
                                out.push_byte(1);
                            }
                            if s_in.peek().is_none() && d_in.peek().is_some() {
                                // X → xT default-initializes the payload
                                if let Some(out) = out.as_deref_mut() {
                                    let mut tmp = Vec::new();
                                    let mut p = d_in.pos;
                                    write_default(d_in.s, &mut p, &mut tmp)?;
                                    out.push(tmp);
                                }
                            } else {
                                let mut si = s_in;
                                let mut di = d_in;
                                conv(cx, &mut si, Some(sv), &mut di, out.as_deref_mut())?;
                            }
                        }
                        _ => return Err(bad_flag(st)),
                    }
                } else {
                    expected_inner_check(cx, s_in, d_in)?;
                }
                st.pos = s_end;
                dt.pos = d_end;
                return Ok(());
            }
            _ => {
                // a plain value goes into the value slot
                need(cx, Policy::EXPECTED, st, dt)?;
                if let Some(out) = out.as_deref_mut() {
                    out.push_byte(1);
                }
                let mut di = d_in;
                conv(cx, st, sv, &mut di, out)?;
                dt.pos = d_end;
                return Ok(());
            }
        }
    }

    // a source expected into a non-expected target
    if s == b'x' || s == b'X' {
        need(cx, Policy::EXPECTED, st, dt)?;
        let s_end = st.pos + s_node.len();
        let s_in = if s == b'x' { st.at(st.pos + 1) } else { Ty::void() };
        if let Some(sv) = sv.as_deref_mut() {
            match sv.u8().ok_or_else(|| underflow(st))? {
                0 => {
                    let bytes = take_error(st, sv)?;
                    // the value path must still be compatible
                    {
                        let mut si = s_in;
                        let mut di = *dt;
                        conv(cx, &mut si, None, &mut di, None)?;
                    }
                    record_expected(cx, st, dt, bytes)?;
                    dt.pos += d_node.len();
                }
                1 => {
                    let mut si = s_in;
                    conv(cx, &mut si, Some(sv), dt, out.as_deref_mut())?;
                }
                _ => return Err(bad_flag(st)),
            }
        } else {
            let mut si = s_in;
            conv(cx, &mut si, None, dt, None)?;
        }
        st.pos = s_end;
        return Ok(());
    }

    // unwrapping a source `a`
    if s == b'a' {
        need(cx, Policy::ANY, st, dt)?;
        if let Some(sv) = sv.as_deref_mut() {
            let tlen = sv.u32().ok_or_else(|| underflow(st))? as usize;
            let ity = sv.take(tlen).ok_or_else(|| underflow(st))?;
            let vlen = sv.u32().ok_or_else(|| underflow(st))? as usize;
            let ival = sv.take(vlen).ok_or_else(|| underflow(st))?;
            type_str::validate(ity)
                .map_err(|(k, p)| Error::typestring(k, ity, p).encaps_any(st.s, st.pos + 1))?;
            let mut ist = Ty::new(ity);
            let mut ird = Reader::new(ival);
            conv(cx, &mut ist, Some(&mut ird), dt, out.as_deref_mut())
                .map_err(|e| e.encaps_any(st.s, st.pos + 1))?;
            if ird.remaining() > 0 {
                return Err(Error::value_long(ity, ity.len()).encaps_any(st.s, st.pos + 1));
            }
        } else {
            // the embedded type is unknowable without a value
            dt.pos += d_node.len();
        }
        st.pos += 1;
        return Ok(());
    }

    // a source optional
    if s == b'o' {
        let s_end = st.pos + s_node.len();
        let s_in = st.at(st.pos + 1);
        if let Some(sv) = sv.as_deref_mut() {
            let flag = sv.u8().ok_or_else(|| underflow(st))?;
            if flag > 1 {
                return Err(bad_flag(st));
            }
            match d {
                Some(b'o') => {
                    let d_end = dt.pos + d_node.len();
                    let mut di = dt.at(dt.pos + 1);
                    if let Some(out) = out.as_deref_mut() {
                        out.push_byte(flag);
                    }
                    let mut si = s_in;
                    if flag == 1 {
                        conv(cx, &mut si, Some(sv), &mut di, out.as_deref_mut())?;
                    } else {
                        conv(cx, &mut si, None, &mut di, None)?;
                    }
                    dt.pos = d_end;
                }
                None => {
                    need(cx, Policy::AUX, st, dt)?;
                    if flag == 1 {
                        let mut si = s_in;
                        conv(cx, &mut si, Some(sv), dt, out.as_deref_mut())?;
                    }
                }
                Some(_) => {
                    need(cx, Policy::EXPECTED, st, dt)?;
                    if flag == 0 {
                        return Err(Error::new(
                            ErrorKind::ValueMismatch,
                            "absent optional %1 has no value for %2",
                        )
                        .with_source(st.s, st.pos)
                        .with_target(dt.s, dt.pos));
                    }
                    let mut si = s_in;
                    conv(cx, &mut si, Some(sv), dt, out.as_deref_mut())?;
                }
            }
        } else {
            match d {
                Some(b'o') => {
                    let d_end = dt.pos + d_node.len();
                    let mut si = s_in;
                    let mut di = dt.at(dt.pos + 1);
                    conv(cx, &mut si, None, &mut di, None)?;
                    dt.pos = d_end;
                }
                None => need(cx, Policy::AUX, st, dt)?,
                Some(_) => {
                    need(cx, Policy::EXPECTED, st, dt)?;
                    let mut si = s_in;
                    conv(cx, &mut si, None, dt, None)?;
                }
            }
        }
        st.pos = s_end;
        return Ok(());
    }

    // wrapping into a target optional
    if d == Some(b'o') {
        need(cx, Policy::EXPECTED, st, dt)?;
        let d_end = dt.pos + d_node.len();
        if let Some(out) = out.as_deref_mut() {
            out.push_byte(1);
        }
        let mut di = dt.at(dt.pos + 1);
        conv(cx, st, sv, &mut di, out)?;
        dt.pos = d_end;
        return Ok(());
    }

    // a source list
    if s == b'l' {
        let s_end = st.pos + s_node.len();
        let se = st.at(st.pos + 1);
        match d {
            Some(b'l') => {
                let d_end = dt.pos + d_node.len();
                let de = dt.at(dt.pos + 1);
                if let Some(sv) = sv.as_deref_mut() {
                    let n = sv.u32().ok_or_else(|| underflow(st))?;
                    if let Some(out) = out.as_deref_mut() {
                        out.put_u32(n);
                    }
                    if n == 0 {
                        let mut si = se;
                        let mut di = de;
                        conv(cx, &mut si, None, &mut di, None)?;
                    }
                    for _ in 0..n {
                        let mut si = se;
                        let mut di = de;
                        conv(cx, &mut si, Some(sv), &mut di, out.as_deref_mut())?;
                    }
                } else {
                    let mut si = se;
                    let mut di = de;
                    conv(cx, &mut si, None, &mut di, None)?;
                }
                dt.pos = d_end;
            }
            Some(b't') => {
                need(cx, Policy::TUPLE_LIST, st, dt)?;
                let d_end = dt.pos + d_node.len();
                let (arity, hdr) = tuple_arity(d_node);
                let mut dpos = dt.pos + hdr;
                if let Some(sv) = sv.as_deref_mut() {
                    let n = sv.u32().ok_or_else(|| underflow(st))?;
                    if n as usize != arity {
                        return Err(Error::new(
                            ErrorKind::ValueMismatch,
                            format!("cannot convert %1 into %2: {}!={}", n, arity),
                        )
                        .with_source(st.s, st.pos)
                        .with_target(dt.s, dt.pos));
                    }
                    for _ in 0..arity {
                        let mut si = se;
                        let mut di = dt.at(dpos);
                        conv(cx, &mut si, Some(sv), &mut di, out.as_deref_mut())?;
                        dpos = di.pos;
                    }
                } else {
                    for _ in 0..arity {
                        let mut si = se;
                        let mut di = dt.at(dpos);
                        conv(cx, &mut si, None, &mut di, None)?;
                        dpos = di.pos;
                    }
                }
                dt.pos = d_end;
            }
            Some(b's') if se.peek() == Some(b'c') => {
                need(cx, Policy::AUX, st, dt)?;
                if let Some(sv) = sv.as_deref_mut() {
                    let n = sv.u32().ok_or_else(|| underflow(st))?;
                    let bytes = sv.take(n as usize).ok_or_else(|| underflow(st))?;
                    if let Some(out) = out.as_deref_mut() {
                        out.put_u32(n);
                        out.push(bytes);
                    }
                }
                dt.pos += 1;
            }
            _ => return Err(mismatch(st, dt)),
        }
        st.pos = s_end;
        return Ok(());
    }

    // a source string into `lc`
    if s == b's' {
        if d == Some(b'l') && dt.at(dt.pos + 1).peek() == Some(b'c') {
            need(cx, Policy::AUX, st, dt)?;
            let d_end = dt.pos + d_node.len();
            if let Some(sv) = sv.as_deref_mut() {
                let n = sv.u32().ok_or_else(|| underflow(st))?;
                let bytes = sv.take(n as usize).ok_or_else(|| underflow(st))?;
                if let Some(out) = out.as_deref_mut() {
                    out.put_u32(n);
                    out.push(bytes);
                }
            }
            st.pos += 1;
            dt.pos = d_end;
            return Ok(());
        }
        return Err(mismatch(st, dt));
    }

    // a source map
    if s == b'm' {
        let s_end = st.pos + s_node.len();
        let sk = st.at(st.pos + 1);
        let sk_len = node_len(st.s, sk.pos)?;
        let sm = st.at(sk.pos + sk_len);
        match d {
            Some(b'm') => {
                let d_end = dt.pos + d_node.len();
                let dk = dt.at(dt.pos + 1);
                let dk_len = node_len(dt.s, dk.pos)?;
                let dm = dt.at(dk.pos + dk_len);
                if let Some(sv) = sv.as_deref_mut() {
                    let n = sv.u32().ok_or_else(|| underflow(st))?;
                    if let Some(out) = out.as_deref_mut() {
                        out.put_u32(n);
                    }
                    if n == 0 {
                        let (mut si, mut di) = (sk, dk);
                        conv(cx, &mut si, None, &mut di, None)?;
                        let (mut si, mut di) = (sm, dm);
                        conv(cx, &mut si, None, &mut di, None)?;
                    }
                    for _ in 0..n {
                        let (mut si, mut di) = (sk, dk);
                        conv(cx, &mut si, Some(sv), &mut di, out.as_deref_mut())?;
                        let (mut si, mut di) = (sm, dm);
                        conv(cx, &mut si, Some(sv), &mut di, out.as_deref_mut())?;
                    }
                } else {
                    let (mut si, mut di) = (sk, dk);
                    conv(cx, &mut si, None, &mut di, None)?;
                    let (mut si, mut di) = (sm, dm);
                    conv(cx, &mut si, None, &mut di, None)?;
                }
                dt.pos = d_end;
            }
            Some(b'l') => {
                // legal when exactly one of key/mapped disappears
                let d_end = dt.pos + d_node.len();
                let de = dt.at(dt.pos + 1);
                let sfields = [sk, sm];
                let dfields = [de];
                if let Some(sv) = sv.as_deref_mut() {
                    let n = sv.u32().ok_or_else(|| underflow(st))?;
                    if let Some(out) = out.as_deref_mut() {
                        out.put_u32(n);
                    }
                    if n == 0 {
                        match_tuple(cx, &sfields, &dfields, None, None)?;
                    }
                    for _ in 0..n {
                        match_tuple(cx, &sfields, &dfields, Some(sv), out.as_deref_mut())?;
                    }
                } else {
                    match_tuple(cx, &sfields, &dfields, None, None)?;
                }
                dt.pos = d_end;
            }
            _ => return Err(mismatch(st, dt)),
        }
        st.pos = s_end;
        return Ok(());
    }

    // a source tuple (or an `e`, whose layout is t4sssa)
    if s == b't' || s == b'e' {
        let s_end = st.pos + s_node.len();
        let sfields = tuple_fields(st, s_node)?;
        match d {
            Some(b't') | Some(b'e') => {
                let d_end = dt.pos + d_node.len();
                let dfields = tuple_fields(dt, d_node)?;
                match_tuple(cx, &sfields, &dfields, sv, out)?;
                dt.pos = d_end;
            }
            Some(b'l') => {
                need(cx, Policy::TUPLE_LIST, st, dt)?;
                let d_end = dt.pos + d_node.len();
                let de = dt.at(dt.pos + 1);
                if sv.is_some() {
                    if let Some(out) = out.as_deref_mut() {
                        out.put_u32(sfields.len() as u32);
                    }
                }
                for f in &sfields {
                    let mut si = *f;
                    let mut di = de;
                    conv(cx, &mut si, sv.as_deref_mut(), &mut di, out.as_deref_mut())?;
                }
                dt.pos = d_end;
            }
            None => {
                match_tuple(cx, &sfields, &[], sv, out)?;
            }
            Some(_) => {
                // collapse to a scalar: all but one field must disappear
                let d_end = dt.pos + d_node.len();
                let dfields = [*dt];
                match_tuple(cx, &sfields, &dfields, sv, out)?;
                dt.pos = d_end;
            }
        }
        st.pos = s_end;
        return Ok(());
    }

    // primitive against primitive
    let d = match d {
        Some(d) => d,
        None => return Err(mismatch(st, dt)),
    };
    let pol = match (s, d) {
        (b'b', b'c') | (b'b', b'i') | (b'b', b'I') => Policy::BOOL,
        (b'c', b'b') | (b'i', b'b') | (b'I', b'b') => Policy::BOOL,
        (b'c', b'i') | (b'c', b'I') | (b'i', b'I') => {
            if !cx.policy.intersects(Policy::INTS | Policy::INTS_NARROWING) {
                return Err(mismatch(st, dt).with_policy(Policy::INTS));
            }
            Policy::empty()
        }
        (b'i', b'c') | (b'I', b'c') | (b'I', b'i') => Policy::INTS_NARROWING,
        (b'i', b'd') | (b'I', b'd') | (b'd', b'i') | (b'd', b'I') => Policy::DOUBLE,
        _ => return Err(mismatch(st, dt)),
    };
    if !pol.is_empty() {
        need(cx, pol, st, dt)?;
    }
    if let Some(sv) = sv.as_deref_mut() {
        enum V {
            I(i64),
            F(f64),
        }
        let v = match s {
            b'b' => V::I(i64::from(sv.u8().ok_or_else(|| underflow(st))?)),
            b'c' => V::I(i64::from(sv.u8().ok_or_else(|| underflow(st))? as i8)),
            b'i' => V::I(i64::from(sv.i32().ok_or_else(|| underflow(st))?)),
            b'I' => V::I(sv.i64().ok_or_else(|| underflow(st))?),
            b'd' => V::F(sv.f64().ok_or_else(|| underflow(st))?),
            _ => return Err(Error::internal(st.s, st.pos)),
        };
        if let Some(out) = out.as_deref_mut() {
            let mut tmp = Vec::with_capacity(8);
            match (d, v) {
                (b'b', V::I(x)) => tmp.push(u8::from(x != 0)),
                (b'c', V::I(x)) => tmp.push(x as u8),
                (b'i', V::I(x)) => crate::codec::put_i32(&mut tmp, x as i32),
                (b'I', V::I(x)) => crate::codec::put_i64(&mut tmp, x),
                (b'd', V::I(x)) => crate::codec::put_f64(&mut tmp, x as f64),
                (b'i', V::F(x)) => crate::codec::put_i32(&mut tmp, x as i32),
                (b'I', V::F(x)) => crate::codec::put_i64(&mut tmp, x as i64),
                _ => return Err(Error::internal(st.s, st.pos)),
            }
            out.push(tmp);
        }
    }
    st.pos += 1;
    dt.pos += 1;
    Ok(())
}

/// Type-only compatibility of the value branches of two expecteds.
fn expected_inner_check(cx: &mut Cx, s_in: Ty, d_in: Ty) -> Result<(), Error> {
    if s_in.peek().is_none() && d_in.peek().is_some() {
        // the target payload default-initializes from void
        return Ok(());
    }
    let mut si = s_in;
    let mut di = d_in;
    conv(cx, &mut si, None, &mut di, None)
}

/// Greedy left-to-right field matching with backtracking over fields
/// that may disappear. The first failure is preserved; if any
/// backtracking happened, it is annotated before surfacing.
fn match_tuple<'a, 'b>(
    cx: &mut Cx,
    sfields: &[Ty<'a>],
    dfields: &[Ty<'b>],
    mut sv: Option<&mut Reader<'a>>,
    mut out: Option<&mut Accumulator<'a>>,
) -> Result<(), Error> {
    let mut first_err = None;
    let mut backtracked = false;
    match match_from(
        cx,
        sfields,
        dfields,
        0,
        0,
        sv.as_deref_mut(),
        out.as_deref_mut(),
        &mut first_err,
        &mut backtracked,
    ) {
        Ok(()) => Ok(()),
        Err(e) => {
            let stored = first_err.unwrap_or(e);
            Err(if backtracked { stored.annotate_any_value() } else { stored })
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn match_from<'a, 'b>(
    cx: &mut Cx,
    sf: &[Ty<'a>],
    df: &[Ty<'b>],
    si: usize,
    di: usize,
    mut sv: Option<&mut Reader<'a>>,
    mut out: Option<&mut Accumulator<'a>>,
    first_err: &mut Option<Error>,
    backtracked: &mut bool,
) -> Result<(), Error> {
    let store = |first_err: &mut Option<Error>, e: Error| -> Error {
        if first_err.is_none() {
            *first_err = Some(e.clone());
        }
        e
    };
    if si == sf.len() {
        if di == df.len() {
            return Ok(());
        }
        let last = match sf.last().copied() {
            Some(t) => t,
            None => Ty::void(),
        };
        let e = mismatch(&last, &df[di]);
        return Err(store(first_err, e));
    }
    if di == df.len() {
        // every remaining source field has to disappear
        for f in &sf[si..] {
            let mut fc = *f;
            let mut void = Ty::void();
            conv(cx, &mut fc, sv.as_deref_mut(), &mut void, out.as_deref_mut())
                .map_err(|e| store(first_err, e))?;
        }
        return Ok(());
    }

    let sv_mark = sv.as_deref().copied();
    let out_mark = out.as_deref().map(Accumulator::save);
    let col_mark = cx.collected.as_deref().map(Vec::len);

    // the direct pairing first
    {
        let mut sc = sf[si];
        let mut dc = df[di];
        let r = conv(cx, &mut sc, sv.as_deref_mut(), &mut dc, out.as_deref_mut()).and_then(|()| {
            match_from(
                cx,
                sf,
                df,
                si + 1,
                di + 1,
                sv.as_deref_mut(),
                out.as_deref_mut(),
                first_err,
                backtracked,
            )
        });
        match r {
            Ok(()) => return Ok(()),
            Err(e) => {
                store(first_err, e);
            }
        }
    }

    // rewind, then retry with this field disappearing
    if let (Some(r), Some(mark)) = (sv.as_deref_mut(), sv_mark) {
        *r = mark;
    }
    if let (Some(o), Some(mark)) = (out.as_deref_mut(), out_mark) {
        o.rollback(mark);
    }
    if let (Some(v), Some(mark)) = (cx.collected.as_deref_mut(), col_mark) {
        v.truncate(mark);
    }
    {
        let mut sc = sf[si];
        let mut void = Ty::void();
        match conv(cx, &mut sc, sv.as_deref_mut(), &mut void, out.as_deref_mut()) {
            Ok(()) => {
                *backtracked = true;
                match match_from(
                    cx,
                    sf,
                    df,
                    si + 1,
                    di,
                    sv.as_deref_mut(),
                    out.as_deref_mut(),
                    first_err,
                    backtracked,
                ) {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        store(first_err, e);
                    }
                }
            }
            Err(e) => {
                store(first_err, e);
            }
        }
    }
    Err(first_err.clone().expect("a failure was stored on every path"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{put_i32, put_u32};

    fn conv_ok(src_ty: &[u8], src_val: &[u8], dst_ty: &[u8], policy: Policy) -> Vec<u8> {
        let mut out = Accumulator::new();
        let used = convert(src_ty, src_val, dst_ty, policy, None, &mut out)
            .unwrap_or_else(|e| panic!("{}", e));
        assert_eq!(used, src_val.len());
        out.flatten()
    }

    fn conv_err(src_ty: &[u8], src_val: &[u8], dst_ty: &[u8], policy: Policy) -> Error {
        let mut out = Accumulator::new();
        convert(src_ty, src_val, dst_ty, policy, None, &mut out).unwrap_err()
    }

    fn be32(v: i32) -> Vec<u8> {
        let mut b = Vec::new();
        put_i32(&mut b, v);
        b
    }

    #[test]
    fn identity_ignores_policy() {
        let mut v = Vec::new();
        put_u32(&mut v, 2);
        put_u32(&mut v, 7);
        put_u32(&mut v, 8);
        assert_eq!(conv_ok(b"li", &v, b"li", Policy::empty()), v);
        assert_eq!(conv_ok(b"li", &v, b"li", Policy::ALL), v);
    }

    #[test]
    fn widening_and_narrowing() {
        assert_eq!(conv_ok(b"i", &be32(300), b"I", Policy::INTS), {
            let mut b = Vec::new();
            crate::codec::put_i64(&mut b, 300);
            b
        });
        // narrowing subsumes widening
        assert_eq!(conv_ok(b"i", &be32(300), b"I", Policy::INTS_NARROWING).len(), 8);
        let e = conv_err(b"i", &be32(300), b"I", Policy::empty());
        assert_eq!(e.required_policy(), Some(Policy::INTS));
        // low byte copy
        assert_eq!(conv_ok(b"i", &be32(0x1_02), b"c", Policy::INTS_NARROWING), vec![0x02]);
        // char sign-extends when widening
        assert_eq!(conv_ok(b"c", &[0xff], b"i", Policy::INTS), be32(-1));
    }

    #[test]
    fn bool_crossings() {
        assert_eq!(conv_ok(b"i", &be32(7), b"b", Policy::BOOL), vec![1]);
        assert_eq!(conv_ok(b"b", &[1], b"I", Policy::BOOL), vec![0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(conv_err(b"b", &[1], b"d", Policy::ALL).kind(), ErrorKind::TypeMismatch);
    }

    #[test]
    fn string_list_aux() {
        let mut v = Vec::new();
        put_u32(&mut v, 2);
        v.extend_from_slice(b"ab");
        assert_eq!(conv_ok(b"s", &v, b"lc", Policy::AUX), v);
        assert_eq!(conv_ok(b"lc", &v, b"s", Policy::AUX), v);
        assert_eq!(conv_err(b"s", &v, b"lc", Policy::empty()).required_policy(), Some(Policy::AUX));
    }

    #[test]
    fn any_wrap_and_unwrap() {
        let out = conv_ok(b"i", &be32(9), b"a", Policy::ANY);
        let mut expect = Vec::new();
        put_u32(&mut expect, 1);
        expect.push(b'i');
        put_u32(&mut expect, 4);
        put_i32(&mut expect, 9);
        assert_eq!(out, expect);
        assert_eq!(conv_ok(b"a", &expect, b"i", Policy::ANY), be32(9));
        // inner conversions still apply their own policies
        assert_eq!(
            conv_err(b"a", &expect, b"I", Policy::ANY).required_policy(),
            Some(Policy::INTS)
        );
        assert_eq!(conv_ok(b"a", &expect, b"I", Policy::ANY | Policy::INTS).len(), 8);
    }

    #[test]
    fn expected_crossings() {
        // i → xi wraps with a present flag
        let out = conv_ok(b"i", &be32(4), b"xi", Policy::EXPECTED);
        assert_eq!(out, {
            let mut b = vec![1];
            b.extend_from_slice(&be32(4));
            b
        });
        // xi(present) → i strips the flag
        assert_eq!(conv_ok(b"xi", &out, b"i", Policy::EXPECTED), be32(4));
        // void → X
        assert_eq!(conv_ok(b"", b"", b"X", Policy::EXPECTED), vec![1]);
        // X → xi default-initializes
        assert_eq!(conv_ok(b"X", &[1], b"xi", Policy::empty()), vec![1, 0, 0, 0, 0]);
    }

    #[test]
    fn expected_error_collection() {
        let mut v = vec![0u8];
        v.extend_from_slice(&crate::default_value(b"e").unwrap());
        // without a collector the conversion fails
        assert_eq!(conv_err(b"xi", &v, b"i", Policy::EXPECTED).kind(), ErrorKind::TypeMismatch);
        // with one it succeeds, produces nothing and collects one error
        let mut collected = Vec::new();
        let mut out = Accumulator::new();
        let used =
            convert(b"xi", &v, b"i", Policy::EXPECTED, Some(&mut collected), &mut out).unwrap();
        assert_eq!(used, v.len());
        assert!(out.is_empty());
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].kind(), ErrorKind::ExpectedWithError);
    }

    #[test]
    fn optionals() {
        assert_eq!(conv_ok(b"oi", &[0], b"oI", Policy::INTS), vec![0]);
        let mut v = vec![1];
        v.extend_from_slice(&be32(3));
        assert_eq!(conv_ok(b"oi", &v, b"i", Policy::EXPECTED), be32(3));
        assert_eq!(conv_ok(b"i", &be32(3), b"oi", Policy::EXPECTED), v);
        assert_eq!(conv_ok(b"", b"", b"oi", Policy::AUX), vec![0]);
        assert_eq!(conv_ok(b"oi", &[0], b"", Policy::AUX), Vec::<u8>::new());
        assert_eq!(
            conv_err(b"oi", &[0], b"i", Policy::EXPECTED).kind(),
            ErrorKind::ValueMismatch
        );
    }

    #[test]
    fn list_tuple_crossings() {
        let mut v = Vec::new();
        put_u32(&mut v, 3);
        for i in 1..=3 {
            put_u32(&mut v, i);
        }
        let out = conv_ok(b"li", &v, b"t3iii", Policy::TUPLE_LIST);
        assert_eq!(out, v[4..]);
        let e = conv_err(b"li", &v, b"t2ii", Policy::TUPLE_LIST);
        assert_eq!(e.kind(), ErrorKind::ValueMismatch);
        assert!(e.message().contains("3!=2"), "{}", e.message());
        // and back: tuple to list
        assert_eq!(conv_ok(b"t3iii", &v[4..], b"li", Policy::TUPLE_LIST), v);
    }

    #[test]
    fn map_to_list_degeneration() {
        // {"a": absent, "b": absent} keyed strings survive, the oX slot vanishes
        let mut v = Vec::new();
        put_u32(&mut v, 1);
        put_u32(&mut v, 1);
        v.push(b'k');
        v.push(0); // absent optional
        let out = conv_ok(b"msoi", &v, b"ls", Policy::AUX);
        let mut expect = Vec::new();
        put_u32(&mut expect, 1);
        put_u32(&mut expect, 1);
        expect.push(b'k');
        assert_eq!(out, expect);
        // neither side disappears: refused
        assert!(check_convertible(b"msi", b"ls", Policy::ALL).is_err());
    }

    #[test]
    fn tuple_backtracking_collapse() {
        // t2xai carrying (expected any-of-void, 42) collapses to the int
        let mut v = vec![1u8]; // x flag: value present
        put_u32(&mut v, 0); // Tlen 0
        put_u32(&mut v, 0); // Vlen 0
        put_i32(&mut v, 42);
        let out = conv_ok(b"t2xai", &v, b"i", Policy::EXPECTED | Policy::ANY);
        assert_eq!(out, be32(42));
    }

    #[test]
    fn tuple_failure_is_annotated() {
        let mut v = vec![1u8];
        put_u32(&mut v, 0);
        put_u32(&mut v, 0);
        put_i32(&mut v, 42);
        let e = conv_err(b"t2xai", &v, b"s", Policy::EXPECTED | Policy::ANY);
        assert!(e.message().contains("with any incoming value"), "{}", e.message());
    }

    #[test]
    fn type_only_checks() {
        assert!(check_convertible(b"li", b"li", Policy::empty()).is_ok());
        assert!(check_convertible(b"li", b"lI", Policy::INTS).is_ok());
        assert!(check_convertible(b"li", b"lI", Policy::empty()).is_err());
        assert!(check_convertible(b"t2is", b"t2is", Policy::empty()).is_ok());
        assert!(check_convertible(b"i", b"a", Policy::ANY).is_ok());
        assert!(check_convertible(b"a", b"i", Policy::ANY).is_ok());
        assert!(check_convertible(b"a", b"i", Policy::empty()).is_err());
    }

    #[test]
    fn consume_reports_used_bytes() {
        let mut v = Vec::new();
        put_u32(&mut v, 1);
        put_u32(&mut v, 5);
        let used = consume(b"li", &v, b"li", Policy::empty(), None).unwrap();
        assert_eq!(used, 8);
    }
}
