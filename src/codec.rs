//! Fixed-width big-endian primitives and the pull-style byte sources the
//! scanner and converter read from. No padding, no alignment; every
//! multi-byte integer on the wire is big-endian.

use std::borrow::Cow;

use byteorder::{BigEndian, ByteOrder};

pub(crate) fn put_u32(out: &mut Vec<u8>, v: u32) {
    let mut b = [0u8; 4];
    BigEndian::write_u32(&mut b, v);
    out.extend_from_slice(&b);
}

pub(crate) fn put_i32(out: &mut Vec<u8>, v: i32) {
    let mut b = [0u8; 4];
    BigEndian::write_i32(&mut b, v);
    out.extend_from_slice(&b);
}

pub(crate) fn put_i64(out: &mut Vec<u8>, v: i64) {
    let mut b = [0u8; 8];
    BigEndian::write_i64(&mut b, v);
    out.extend_from_slice(&b);
}

pub(crate) fn put_f64(out: &mut Vec<u8>, v: f64) {
    let mut b = [0u8; 8];
    BigEndian::write_f64(&mut b, v);
    out.extend_from_slice(&b);
}

/// Length-prefixed byte run (`s`, and the raw payload of counts).
pub(crate) fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    put_u32(out, bytes.len() as u32);
    out.extend_from_slice(bytes);
}

pub(crate) fn get_u32(b: &[u8]) -> Option<u32> {
    if b.len() < 4 {
        return None;
    }
    Some(BigEndian::read_u32(b))
}

/// Positional cursor over a contiguous value slice. `Copy`, so the
/// conversion engine can checkpoint it for backtracking.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.remaining() < n {
            return None;
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Some(s)
    }

    /// Splits off the next `n` bytes as their own cursor.
    pub fn sub(&mut self, n: usize) -> Option<Reader<'a>> {
        self.take(n).map(Reader::new)
    }

    /// The bytes consumed since an earlier position.
    pub fn taken_since(&self, start: usize) -> &'a [u8] {
        &self.buf[start..self.pos]
    }

    pub fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    pub fn u32(&mut self) -> Option<u32> {
        self.take(4).map(BigEndian::read_u32)
    }

    pub fn i32(&mut self) -> Option<i32> {
        self.take(4).map(BigEndian::read_i32)
    }

    pub fn i64(&mut self) -> Option<i64> {
        self.take(8).map(BigEndian::read_i64)
    }

    pub fn f64(&mut self) -> Option<f64> {
        self.take(8).map(BigEndian::read_f64)
    }
}

/// A pull reader over byte input that may arrive in chunks.
///
/// The refill callback is invoked when the current view is exhausted;
/// returning `None` ends the stream. `take` borrows when the requested
/// run lies inside the current chunk and copies across chunk seams.
pub struct ByteSource<'a> {
    chunk: &'a [u8],
    pos: usize,
    before: usize,
    refill: Option<Box<dyn FnMut() -> Option<&'a [u8]> + 'a>>,
}

impl<'a> ByteSource<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        ByteSource { chunk: bytes, pos: 0, before: 0, refill: None }
    }

    pub fn chunked(first: &'a [u8], refill: impl FnMut() -> Option<&'a [u8]> + 'a) -> Self {
        ByteSource { chunk: first, pos: 0, before: 0, refill: Some(Box::new(refill)) }
    }

    /// Total bytes consumed so far, across all chunks.
    pub fn consumed(&self) -> usize {
        self.before + self.pos
    }

    fn advance_chunk(&mut self) -> bool {
        let refill = match self.refill.as_mut() {
            Some(f) => f,
            None => return false,
        };
        loop {
            match refill() {
                Some(c) => {
                    self.before += self.chunk.len();
                    self.chunk = c;
                    self.pos = 0;
                    if !c.is_empty() {
                        return true;
                    }
                }
                None => return false,
            }
        }
    }

    pub fn peek(&mut self) -> Option<u8> {
        while self.pos >= self.chunk.len() {
            if !self.advance_chunk() {
                return None;
            }
        }
        Some(self.chunk[self.pos])
    }

    pub fn next_byte(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    pub fn take(&mut self, n: usize) -> Option<Cow<'a, [u8]>> {
        if self.chunk.len() - self.pos >= n {
            let s = &self.chunk[self.pos..self.pos + n];
            self.pos += n;
            return Some(Cow::Borrowed(s));
        }
        let mut out = Vec::with_capacity(n);
        let mut need = n;
        loop {
            let grab = (self.chunk.len() - self.pos).min(need);
            out.extend_from_slice(&self.chunk[self.pos..self.pos + grab]);
            self.pos += grab;
            need -= grab;
            if need == 0 {
                return Some(Cow::Owned(out));
            }
            if !self.advance_chunk() {
                return None;
            }
        }
    }

    pub fn skip(&mut self, n: usize) -> bool {
        let mut need = n;
        loop {
            let grab = (self.chunk.len() - self.pos).min(need);
            self.pos += grab;
            need -= grab;
            if need == 0 {
                return true;
            }
            if !self.advance_chunk() {
                return false;
            }
        }
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        self.take(4).map(|b| BigEndian::read_u32(&b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_cursor() {
        let mut r = Reader::new(&[0, 0, 0, 5, 1, 2]);
        assert_eq!(r.u32(), Some(5));
        assert_eq!(r.u8(), Some(1));
        assert_eq!(r.remaining(), 1);
        assert_eq!(r.u32(), None);
        assert_eq!(r.pos(), 5);
    }

    #[test]
    fn source_across_chunks() {
        let chunks: Vec<&[u8]> = vec![&[3, 4], &[], &[5, 6, 7]];
        let mut it = chunks.into_iter();
        let mut src = ByteSource::chunked(&[1, 2], move || it.next());
        assert_eq!(src.take(3).unwrap().as_ref(), &[1, 2, 3]);
        assert_eq!(src.consumed(), 3);
        assert!(matches!(src.take(2), Some(Cow::Owned(_))));
        assert!(src.skip(2));
        assert_eq!(src.consumed(), 7);
        assert!(!src.skip(1));
    }

    #[test]
    fn source_borrows_within_chunk() {
        let mut src = ByteSource::new(&[1, 2, 3, 4]);
        assert!(matches!(src.take(4), Some(Cow::Borrowed(_))));
    }
}
