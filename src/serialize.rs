//! The thin host-type adapter: maps native Rust values to and from the
//! fixed big-endian wire encoding, one descriptor per type.

use std::collections::BTreeMap;
use std::io::{self, Cursor, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::any::Any;
use crate::type_str::TypeStr;

/// Maps a host type onto its type descriptor and wire encoding.
///
/// Implemented for the primitives (`bool`, `u8` as `c`, `i32`, `i64`,
/// `f64`), `String`, `Vec<T>`, `BTreeMap<K, V>`, `Option<T>`, tuples of
/// arity 2–4 and [`Any`] itself.
pub trait Serializable: Sized {
    /// The canonical descriptor of this type.
    fn type_str() -> TypeStr;

    /// Deserialize a single value, advancing the cursor.
    fn read(c: &mut Cursor<&[u8]>) -> io::Result<Self>;

    /// Serialize a single value into a writer.
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()>;
}

fn bad_data(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_owned())
}

impl Serializable for bool {
    fn type_str() -> TypeStr {
        TypeStr::from_validated("b".to_owned())
    }
    fn read(c: &mut Cursor<&[u8]>) -> io::Result<Self> {
        match c.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(bad_data("boolean byte is neither 0 nor 1")),
        }
    }
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u8(u8::from(*self))
    }
}

impl Serializable for u8 {
    fn type_str() -> TypeStr {
        TypeStr::from_validated("c".to_owned())
    }
    fn read(c: &mut Cursor<&[u8]>) -> io::Result<Self> {
        c.read_u8()
    }
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u8(*self)
    }
}

impl Serializable for i32 {
    fn type_str() -> TypeStr {
        TypeStr::from_validated("i".to_owned())
    }
    fn read(c: &mut Cursor<&[u8]>) -> io::Result<Self> {
        c.read_i32::<BigEndian>()
    }
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_i32::<BigEndian>(*self)
    }
}

impl Serializable for i64 {
    fn type_str() -> TypeStr {
        TypeStr::from_validated("I".to_owned())
    }
    fn read(c: &mut Cursor<&[u8]>) -> io::Result<Self> {
        c.read_i64::<BigEndian>()
    }
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_i64::<BigEndian>(*self)
    }
}

impl Serializable for f64 {
    fn type_str() -> TypeStr {
        TypeStr::from_validated("d".to_owned())
    }
    fn read(c: &mut Cursor<&[u8]>) -> io::Result<Self> {
        c.read_f64::<BigEndian>()
    }
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_f64::<BigEndian>(*self)
    }
}

fn read_count(c: &mut Cursor<&[u8]>) -> io::Result<usize> {
    Ok(c.read_u32::<BigEndian>()? as usize)
}

fn write_count<W: Write>(w: &mut W, n: usize) -> io::Result<()> {
    w.write_u32::<BigEndian>(n as u32)
}

impl Serializable for String {
    fn type_str() -> TypeStr {
        TypeStr::from_validated("s".to_owned())
    }
    fn read(c: &mut Cursor<&[u8]>) -> io::Result<Self> {
        let n = read_count(c)?;
        let mut buf = vec![0; n];
        c.read_exact(&mut buf)?;
        String::from_utf8(buf).map_err(|_| bad_data("string is not UTF-8"))
    }
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_count(w, self.len())?;
        w.write_all(self.as_bytes())
    }
}

impl<T: Serializable> Serializable for Vec<T> {
    fn type_str() -> TypeStr {
        TypeStr::from_validated(format!("l{}", T::type_str()))
    }
    fn read(c: &mut Cursor<&[u8]>) -> io::Result<Self> {
        let n = read_count(c)?;
        let mut out = Vec::with_capacity(n.min(4096));
        for _ in 0..n {
            out.push(T::read(c)?);
        }
        Ok(out)
    }
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_count(w, self.len())?;
        for item in self {
            item.write(w)?;
        }
        Ok(())
    }
}

impl<K: Serializable + Ord, V: Serializable> Serializable for BTreeMap<K, V> {
    fn type_str() -> TypeStr {
        TypeStr::from_validated(format!("m{}{}", K::type_str(), V::type_str()))
    }
    fn read(c: &mut Cursor<&[u8]>) -> io::Result<Self> {
        let n = read_count(c)?;
        let mut out = BTreeMap::new();
        for _ in 0..n {
            let k = K::read(c)?;
            let v = V::read(c)?;
            out.insert(k, v);
        }
        Ok(out)
    }
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_count(w, self.len())?;
        for (k, v) in self {
            k.write(w)?;
            v.write(w)?;
        }
        Ok(())
    }
}

impl<T: Serializable> Serializable for Option<T> {
    fn type_str() -> TypeStr {
        TypeStr::from_validated(format!("o{}", T::type_str()))
    }
    fn read(c: &mut Cursor<&[u8]>) -> io::Result<Self> {
        match c.read_u8()? {
            0 => Ok(None),
            1 => Ok(Some(T::read(c)?)),
            _ => Err(bad_data("optional flag is neither 0 nor 1")),
        }
    }
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        match self {
            None => w.write_u8(0),
            Some(v) => {
                w.write_u8(1)?;
                v.write(w)
            }
        }
    }
}

macro_rules! impl_tuple_serializable {
    ($arity:literal => $($name:ident : $idx:tt),+) => {
        impl<$($name: Serializable),+> Serializable for ($($name,)+) {
            fn type_str() -> TypeStr {
                let mut s = format!("t{}", $arity);
                $(s.push_str($name::type_str().as_str());)+
                TypeStr::from_validated(s)
            }
            fn read(c: &mut Cursor<&[u8]>) -> io::Result<Self> {
                Ok(($($name::read(c)?,)+))
            }
            fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
                $(self.$idx.write(w)?;)+
                Ok(())
            }
        }
    };
}

impl_tuple_serializable!(2 => A: 0, B: 1);
impl_tuple_serializable!(3 => A: 0, B: 1, C: 2);
impl_tuple_serializable!(4 => A: 0, B: 1, C: 2, D: 3);

impl Serializable for Any {
    fn type_str() -> TypeStr {
        TypeStr::from_validated("a".to_owned())
    }
    fn read(c: &mut Cursor<&[u8]>) -> io::Result<Self> {
        let tlen = read_count(c)?;
        let mut ty = vec![0; tlen];
        c.read_exact(&mut ty)?;
        let vlen = read_count(c)?;
        let mut val = vec![0; vlen];
        c.read_exact(&mut val)?;
        let ty = String::from_utf8(ty).map_err(|_| bad_data("type string is not UTF-8"))?;
        Any::from_parts(&ty, val, false).map_err(|e| bad_data(&e.message()))
    }
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.to_wire())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<T: Serializable + PartialEq + std::fmt::Debug>(v: T) {
        let mut buf = Vec::new();
        v.write(&mut buf).unwrap();
        let mut c = Cursor::new(buf.as_slice());
        assert_eq!(T::read(&mut c).unwrap(), v);
        assert_eq!(c.position() as usize, buf.len());
        // the encoding scans cleanly against the declared type
        let ty = T::type_str();
        let (tc, vc) = crate::scan(ty.as_bytes(), &buf, true).unwrap();
        assert_eq!((tc, vc), (ty.as_bytes().len(), buf.len()));
    }

    #[test]
    fn primitives() {
        roundtrip(true);
        roundtrip(7u8);
        roundtrip(-5i32);
        roundtrip(1i64 << 40);
        roundtrip(2.5f64);
        roundtrip("hello".to_string());
    }

    #[test]
    fn containers() {
        roundtrip(vec![1i32, 2, 3]);
        roundtrip(Some(vec!["a".to_string()]));
        roundtrip(Option::<i32>::None);
        roundtrip((1i32, "x".to_string()));
        roundtrip((1i32, 2i64, 3.5f64, false));
        let mut m = BTreeMap::new();
        m.insert("k".to_string(), (1i32, 2i32));
        roundtrip(m);
    }

    #[test]
    fn descriptors() {
        assert_eq!(Vec::<i32>::type_str().as_str(), "li");
        assert_eq!(<(String, f64)>::type_str().as_str(), "t2sd");
        assert_eq!(BTreeMap::<String, Vec<i64>>::type_str().as_str(), "mslI");
        assert_eq!(Option::<u8>::type_str().as_str(), "oc");
        assert_eq!(<Any as Serializable>::type_str().as_str(), "a");
    }

    #[test]
    fn any_nested() {
        let inner = Any::from_typed(&42i32).unwrap();
        roundtrip(inner);
    }
}
