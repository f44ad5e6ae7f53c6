use crate::codec::put_u32;
use crate::error::{Error, ParseErrorKind};

/// Writes the canonical zero encoding of `ty`.
///
/// Zeros for the numeric types, a zero length for `s`, a zero count for
/// `l`/`m`, an absent `o`, a present `x`/`X` holding the default of the
/// inner type, an all-zero error for `e`, and a void `a`.
///
/// ```
/// assert_eq!(anywire::default_value(b"oi").unwrap(), vec![0]);
/// assert_eq!(anywire::default_value(b"xb").unwrap(), vec![1, 0]);
/// ```
pub fn default_value(ty: &[u8]) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    let mut pos = 0;
    write_default(ty, &mut pos, &mut out)?;
    if pos < ty.len() {
        return Err(Error::typestring(ParseErrorKind::TLong, ty, pos));
    }
    Ok(out)
}

pub(crate) fn write_default(ty: &[u8], pos: &mut usize, out: &mut Vec<u8>) -> Result<(), Error> {
    let b = match ty.get(*pos) {
        Some(&b) => b,
        None => return Ok(()), // void
    };
    let at = *pos;
    *pos += 1;
    match b {
        b'b' | b'c' => out.push(0),
        b'i' => out.extend_from_slice(&[0; 4]),
        b'I' | b'd' => out.extend_from_slice(&[0; 8]),
        b's' => put_u32(out, 0),
        b'l' => {
            put_u32(out, 0);
            *pos += crate::type_str::node_len(ty, *pos)?;
        }
        b'm' => {
            put_u32(out, 0);
            *pos += crate::type_str::node_len(ty, *pos)?;
            *pos += crate::type_str::node_len(ty, *pos)?;
        }
        b't' => {
            let start = *pos;
            let mut n = 0usize;
            while *pos < ty.len() && ty[*pos].is_ascii_digit() {
                n = n * 10 + (ty[*pos] - b'0') as usize;
                *pos += 1;
            }
            if *pos == start || n < 2 {
                return Err(Error::typestring(ParseErrorKind::Num, ty, *pos));
            }
            for _ in 0..n {
                if *pos >= ty.len() {
                    return Err(Error::typestring(ParseErrorKind::End, ty, *pos));
                }
                write_default(ty, pos, out)?;
            }
        }
        b'o' => {
            out.push(0);
            *pos += crate::type_str::node_len(ty, *pos)?;
        }
        b'x' => {
            out.push(1);
            if *pos >= ty.len() {
                return Err(Error::typestring(ParseErrorKind::End, ty, *pos));
            }
            write_default(ty, pos, out)?;
        }
        b'X' => out.push(1),
        // all-zero t4sssa: three empty strings and a void any
        b'e' => out.extend_from_slice(&[0; 20]),
        b'a' => out.extend_from_slice(&[0; 8]),
        _ => return Err(Error::typestring(ParseErrorKind::Chr, ty, at)),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars() {
        assert_eq!(default_value(b"").unwrap(), Vec::<u8>::new());
        assert_eq!(default_value(b"b").unwrap(), vec![0]);
        assert_eq!(default_value(b"i").unwrap(), vec![0; 4]);
        assert_eq!(default_value(b"I").unwrap(), vec![0; 8]);
        assert_eq!(default_value(b"d").unwrap(), vec![0; 8]);
        assert_eq!(default_value(b"s").unwrap(), vec![0; 4]);
    }

    #[test]
    fn compounds() {
        assert_eq!(default_value(b"li").unwrap(), vec![0; 4]);
        assert_eq!(default_value(b"msi").unwrap(), vec![0; 4]);
        assert_eq!(default_value(b"t2ib").unwrap(), vec![0; 5]);
        assert_eq!(default_value(b"oi").unwrap(), vec![0]);
        assert_eq!(default_value(b"xi").unwrap(), vec![1, 0, 0, 0, 0]);
        assert_eq!(default_value(b"X").unwrap(), vec![1]);
        assert_eq!(default_value(b"e").unwrap(), vec![0; 20]);
        assert_eq!(default_value(b"a").unwrap(), vec![0; 8]);
    }

    #[test]
    fn default_scans_cleanly() {
        for ty in [&b"lt2is"[..], b"mst2id", b"t3ioIxs", b"xli", b"ole", b"a"] {
            let v = default_value(ty).unwrap();
            let (tc, vc) = crate::scan(ty, &v, true).unwrap();
            assert_eq!(tc, ty.len(), "type {:?}", std::str::from_utf8(ty));
            assert_eq!(vc, v.len(), "type {:?}", std::str::from_utf8(ty));
        }
    }
}
