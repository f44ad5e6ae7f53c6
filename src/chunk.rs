//! Shared byte runs and the chunked windows the writable view edits
//! through.
//!
//! An [`SView`] is a reference-counted byte run with a writable flag
//! that only ever transitions from writable to read-only: cloning the
//! handle (sharing the run) freezes it for good. A [`Chunk`] is a
//! window into a run plus a forward link; chains of chunks make up the
//! type and value of a writable view, and [`split`] guarantees that any
//! logically selected byte range can be made to occupy chunks of its
//! own. Writing through a chunk whose run is frozen replaces the run
//! with a fresh private copy of just that window (the chunk object, and
//! with it every chain that links it, keeps observing the new bytes).

use std::borrow::Cow;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};

enum Backing {
    Owned(Box<[u8]>),
    Borrowed(&'static [u8]),
}

struct SViewInner {
    bytes: Backing,
    writable: AtomicBool,
}

/// A shared, refcounted byte run with a monotonic writable→read-only
/// flag. Handles may be copied across threads; mutation requires the
/// run to be both unique and still writable.
pub(crate) struct SView {
    inner: Arc<SViewInner>,
}

impl SView {
    pub fn from_vec(v: Vec<u8>) -> Self {
        SView {
            inner: Arc::new(SViewInner {
                bytes: Backing::Owned(v.into_boxed_slice()),
                writable: AtomicBool::new(true),
            }),
        }
    }

    /// Non-owning mode over borrowed memory; never writable.
    pub fn from_static(b: &'static [u8]) -> Self {
        SView {
            inner: Arc::new(SViewInner {
                bytes: Backing::Borrowed(b),
                writable: AtomicBool::new(false),
            }),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.inner.bytes {
            Backing::Owned(b) => b,
            Backing::Borrowed(b) => b,
        }
    }

    pub fn is_writable(&self) -> bool {
        self.inner.writable.load(Ordering::Acquire)
    }

    /// Mutable access; `None` once the run has ever been shared.
    fn try_mut(&mut self) -> Option<&mut [u8]> {
        if !self.is_writable() {
            return None;
        }
        if Arc::get_mut(&mut self.inner).is_none() {
            // raced into sharing; freeze permanently
            self.inner.writable.store(false, Ordering::Release);
            return None;
        }
        match &mut Arc::get_mut(&mut self.inner).unwrap().bytes {
            Backing::Owned(b) => Some(&mut b[..]),
            Backing::Borrowed(_) => None,
        }
    }
}

impl Clone for SView {
    fn clone(&self) -> Self {
        // sharing a run freezes it, even if it later becomes unique again
        self.inner.writable.store(false, Ordering::Release);
        SView { inner: Arc::clone(&self.inner) }
    }
}

pub(crate) type ChunkRef = Rc<RefCell<Chunk>>;

pub(crate) fn chunk_ref(c: Chunk) -> ChunkRef {
    Rc::new(RefCell::new(c))
}

/// A window `(off, len)` into an optional byte run, plus the forward
/// link of its chain.
pub(crate) struct Chunk {
    view: Option<SView>,
    off: usize,
    pub(crate) len: usize,
    pub(crate) next: Option<ChunkRef>,
}

impl Chunk {
    pub fn empty() -> Self {
        Chunk { view: None, off: 0, len: 0, next: None }
    }

    /// A fresh chunk owning a private copy of `bytes`.
    pub fn owned(bytes: &[u8]) -> Self {
        if bytes.is_empty() {
            return Chunk::empty();
        }
        Chunk { view: Some(SView::from_vec(bytes.to_vec())), off: 0, len: bytes.len(), next: None }
    }

    pub fn bytes(&self) -> &[u8] {
        match &self.view {
            Some(v) => &v.as_slice()[self.off..self.off + self.len],
            None => &[],
        }
    }

    /// A non-owning window over the same bytes (freezes the run).
    pub fn share(&self) -> Chunk {
        self.sub(0, self.len)
    }

    /// A sub-window of this chunk's bytes.
    pub fn sub(&self, off: usize, len: usize) -> Chunk {
        debug_assert!(off + len <= self.len);
        Chunk { view: self.view.clone(), off: self.off + off, len, next: None }
    }

    /// Extends this window over `other` when the two are adjacent in the
    /// same run.
    pub fn try_append(&mut self, other: &Chunk) -> bool {
        match (&self.view, &other.view) {
            (Some(a), Some(b)) if Arc::ptr_eq(&a.inner, &b.inner) => {
                if self.off + self.len == other.off {
                    self.len += other.len;
                    true
                } else {
                    false
                }
            }
            (_, None) => true, // nothing to take over
            _ => false,
        }
    }

    /// Reallocates to `n` zero bytes; existing content is lost, the
    /// forward link survives.
    pub fn resize(&mut self, n: usize) {
        if n == 0 {
            self.view = None;
        } else {
            self.view = Some(SView::from_vec(vec![0; n]));
        }
        self.off = 0;
        self.len = n;
    }

    /// Replaces the window content, keeping the forward link.
    pub fn assign(&mut self, bytes: &[u8]) {
        if bytes.len() != self.len {
            self.resize(bytes.len());
        }
        self.write_at(0, bytes);
    }

    /// Full replacement, forward link included.
    pub fn copy_from(&mut self, other: &Chunk) {
        self.view = other.view.clone();
        self.off = other.off;
        self.len = other.len;
        self.next = other.next.clone();
    }

    /// Swaps window identity (run, offset, length) but not the links.
    pub fn swap_window(&mut self, other: &mut Chunk) {
        std::mem::swap(&mut self.view, &mut other.view);
        std::mem::swap(&mut self.off, &mut other.off);
        std::mem::swap(&mut self.len, &mut other.len);
    }

    /// Writes inside the window, copy-on-write when the run is frozen.
    pub fn write_at(&mut self, at: usize, data: &[u8]) {
        debug_assert!(at + data.len() <= self.len);
        if data.is_empty() {
            return;
        }
        if let Some(view) = &mut self.view {
            let off = self.off;
            if let Some(m) = view.try_mut() {
                m[off + at..off + at + data.len()].copy_from_slice(data);
                return;
            }
        }
        let mut fresh = self.bytes().to_vec();
        fresh[at..at + data.len()].copy_from_slice(data);
        self.view = Some(SView::from_vec(fresh));
        self.off = 0;
    }
}

fn is_end(c: &ChunkRef, end: Option<&ChunkRef>) -> bool {
    end.map_or(false, |e| Rc::ptr_eq(c, e))
}

/// Total length of the range `[begin, end)`.
pub(crate) fn flatten_len(begin: Option<&ChunkRef>, end: Option<&ChunkRef>) -> usize {
    let mut n = 0;
    let mut cur = begin.cloned();
    while let Some(c) = cur {
        if is_end(&c, end) {
            break;
        }
        let b = c.borrow();
        n += b.len;
        cur = b.next.clone();
    }
    n
}

/// Concatenates the range `[begin, end)`.
pub(crate) fn flatten(begin: Option<&ChunkRef>, end: Option<&ChunkRef>) -> Vec<u8> {
    let mut out = Vec::new();
    flatten_to(begin, end, &mut out);
    out
}

pub(crate) fn flatten_to(begin: Option<&ChunkRef>, end: Option<&ChunkRef>, out: &mut Vec<u8>) {
    let mut cur = begin.cloned();
    while let Some(c) = cur {
        if is_end(&c, end) {
            break;
        }
        let b = c.borrow();
        out.extend_from_slice(b.bytes());
        cur = b.next.clone();
    }
}

/// First chunk in the range with any content.
pub(crate) fn find_nonempty(begin: Option<&ChunkRef>, end: Option<&ChunkRef>) -> Option<ChunkRef> {
    let mut cur = begin.cloned();
    while let Some(c) = cur {
        if is_end(&c, end) {
            return None;
        }
        if c.borrow().len > 0 {
            return Some(c);
        }
        let next = c.borrow().next.clone();
        cur = next;
    }
    None
}

/// The chunk whose `next` is `target`, starting the walk at `begin`.
pub(crate) fn find_before(begin: &ChunkRef, target: &ChunkRef) -> Option<ChunkRef> {
    let mut cur = begin.clone();
    loop {
        let next = cur.borrow().next.clone();
        match next {
            Some(n) if Rc::ptr_eq(&n, target) => return Some(cur),
            Some(n) => cur = n,
            None => return None,
        }
    }
}

/// Advances to the chunk containing flat offset `off` of the range,
/// returning it with the local offset. `None` when `off` is past the
/// range (reaching `off` exactly at the end returns the end chunk with
/// offset 0 only if `off` is strictly inside).
pub(crate) fn walk_to(
    begin: &ChunkRef,
    end: Option<&ChunkRef>,
    mut off: usize,
) -> Option<(ChunkRef, usize)> {
    let mut cur = begin.clone();
    loop {
        if is_end(&cur, end) {
            return None;
        }
        let (len, next) = {
            let b = cur.borrow();
            (b.len, b.next.clone())
        };
        if off < len {
            return Some((cur, off));
        }
        off -= len;
        match next {
            Some(n) => cur = n,
            None => return None,
        }
    }
}

/// Does the range start with `prefix`?
pub(crate) fn starts_with(begin: Option<&ChunkRef>, end: Option<&ChunkRef>, prefix: &[u8]) -> bool {
    let mut need = prefix;
    let mut cur = begin.cloned();
    while let Some(c) = cur {
        if need.is_empty() {
            return true;
        }
        if is_end(&c, end) {
            break;
        }
        let b = c.borrow();
        let n = b.len.min(need.len());
        if b.bytes()[..n] != need[..n] {
            return false;
        }
        need = &need[n..];
        cur = b.next.clone();
    }
    need.is_empty()
}

/// Splits `c` at window offset `at`: `c` keeps `[0, at)`, a new linked
/// chunk takes the rest, and the tail is returned. The identity of `c`
/// is preserved, which is what lets a selected range become chunks of
/// its own without disturbing outer chains.
pub(crate) fn split(c: &ChunkRef, at: usize) -> ChunkRef {
    let mut b = c.borrow_mut();
    debug_assert!(at <= b.len);
    let mut tail = b.sub(at, b.len - at);
    tail.next = b.next.take();
    b.len = at;
    if b.len == 0 {
        b.view = None;
        b.off = 0;
    }
    let tail = chunk_ref(tail);
    b.next = Some(tail.clone());
    tail
}

/// Replaces the content of `[begin, end)` with `data`, preserving the
/// identity of `begin`. Interior chunks fall out of this chain but keep
/// their own linkage, so disowned views holding them stay intact.
pub(crate) fn replace_range(begin: &ChunkRef, end: Option<&ChunkRef>, data: &[u8]) {
    let mut b = begin.borrow_mut();
    b.assign(data);
    b.next = end.cloned();
}

/// Writes `data` at flat offset `off` of the range, chunk by chunk.
pub(crate) fn write_range_at(
    begin: &ChunkRef,
    end: Option<&ChunkRef>,
    off: usize,
    data: &[u8],
) -> bool {
    let (mut cur, mut local) = match walk_to(begin, end, off) {
        Some(x) => x,
        None => return data.is_empty(),
    };
    let mut rest = data;
    loop {
        let next = {
            let mut b = cur.borrow_mut();
            let n = (b.len - local).min(rest.len());
            b.write_at(local, &rest[..n]);
            rest = &rest[n..];
            b.next.clone()
        };
        if rest.is_empty() {
            return true;
        }
        local = 0;
        match next {
            Some(n) if !is_end(&n, end) => cur = n,
            _ => return false,
        }
    }
}

/// Reads a big-endian u32 at flat offset `off` of the range.
pub(crate) fn read_range_u32(begin: &ChunkRef, end: Option<&ChunkRef>, off: usize) -> Option<u32> {
    let mut buf = [0u8; 4];
    let mut got = 0;
    let (mut cur, mut local) = walk_to(begin, end, off)?;
    loop {
        {
            let b = cur.borrow();
            let n = (b.len - local).min(4 - got);
            buf[got..got + n].copy_from_slice(&b.bytes()[local..local + n]);
            got += n;
        }
        if got == 4 {
            return Some(BigEndian::read_u32(&buf));
        }
        local = 0;
        let next = cur.borrow().next.clone();
        match next {
            Some(n) if !is_end(&n, end) => cur = n,
            _ => return None,
        }
    }
}

/// The append-only byte-view sink the conversion engine writes into.
///
/// Collects borrowed or owned fragments and flattens on demand; the
/// tuple matcher relies on [`Accumulator::save`]/[`Accumulator::rollback`]
/// to unwind dead ends.
#[derive(Default)]
pub struct Accumulator<'a> {
    parts: Vec<Cow<'a, [u8]>>,
    len: usize,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Save {
    parts: usize,
    len: usize,
}

impl<'a> Accumulator<'a> {
    pub fn new() -> Self {
        Accumulator::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, bytes: impl Into<Cow<'a, [u8]>>) {
        let bytes = bytes.into();
        self.len += bytes.len();
        self.parts.push(bytes);
    }

    pub(crate) fn push_byte(&mut self, b: u8) {
        self.push(vec![b]);
    }

    pub(crate) fn put_u32(&mut self, v: u32) {
        let mut b = vec![0u8; 4];
        BigEndian::write_u32(&mut b, v);
        self.push(b);
    }

    pub(crate) fn save(&self) -> Save {
        Save { parts: self.parts.len(), len: self.len }
    }

    pub(crate) fn rollback(&mut self, s: Save) {
        self.parts.truncate(s.parts);
        self.len = s.len;
    }

    pub fn flatten(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for p in &self.parts {
            out.extend_from_slice(p);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn share_freezes_forever() {
        let mut a = SView::from_vec(vec![1, 2, 3]);
        assert!(a.is_writable());
        let b = a.clone();
        assert!(!a.is_writable());
        drop(b);
        // unique again, still frozen
        assert!(a.try_mut().is_none());
    }

    #[test]
    fn chunk_cow_keeps_identity() {
        let c = chunk_ref(Chunk::owned(&[1, 2, 3, 4]));
        let shared = c.borrow().share();
        c.borrow_mut().write_at(1, &[9]);
        assert_eq!(c.borrow().bytes(), &[1, 9, 3, 4]);
        // the pre-existing window still sees the old run
        assert_eq!(shared.bytes(), &[1, 2, 3, 4]);
    }

    #[test]
    fn split_preserves_linkage() {
        let a = chunk_ref(Chunk::owned(&[1, 2, 3, 4, 5]));
        let b = chunk_ref(Chunk::owned(&[6]));
        a.borrow_mut().next = Some(b.clone());
        let tail = split(&a, 2);
        assert_eq!(a.borrow().bytes(), &[1, 2]);
        assert_eq!(tail.borrow().bytes(), &[3, 4, 5]);
        assert!(Rc::ptr_eq(tail.borrow().next.as_ref().unwrap(), &b));
        assert_eq!(flatten(Some(&a), None), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn ranged_utilities() {
        let a = chunk_ref(Chunk::owned(&[0, 0]));
        let b = chunk_ref(Chunk::owned(&[0, 1, 2]));
        let c = chunk_ref(Chunk::owned(&[3]));
        a.borrow_mut().next = Some(b.clone());
        b.borrow_mut().next = Some(c.clone());
        assert_eq!(flatten_len(Some(&a), None), 6);
        assert_eq!(flatten_len(Some(&b), Some(&c)), 3);
        assert!(starts_with(Some(&a), None, &[0, 0, 0, 1]));
        assert!(!starts_with(Some(&a), None, &[0, 1]));
        assert_eq!(read_range_u32(&a, None, 1), Some(0x00_00_01_02));
        assert!(write_range_at(&a, None, 1, &[7, 8]));
        assert_eq!(flatten(Some(&a), None), vec![0, 7, 8, 1, 2, 3]);
        let before = find_before(&a, &c).unwrap();
        assert!(Rc::ptr_eq(&before, &b));
        let (chunk, local) = walk_to(&a, None, 3).unwrap();
        assert!(Rc::ptr_eq(&chunk, &b));
        assert_eq!(local, 1);
    }

    #[test]
    fn append_resize_copy() {
        let base = Chunk::owned(&[1, 2, 3, 4]);
        let mut left = base.sub(0, 2);
        let right = base.sub(2, 2);
        assert!(left.try_append(&right));
        assert_eq!(left.bytes(), &[1, 2, 3, 4]);

        let mut c = Chunk::owned(&[1, 2]);
        let d = chunk_ref(Chunk::owned(&[5]));
        c.next = Some(d.clone());
        c.resize(3);
        assert_eq!(c.bytes(), &[0, 0, 0]);
        assert!(Rc::ptr_eq(c.next.as_ref().unwrap(), &d));

        let mut e = Chunk::empty();
        e.copy_from(&c);
        assert_eq!(e.bytes(), &[0, 0, 0]);
        assert!(Rc::ptr_eq(e.next.as_ref().unwrap(), &d));
    }

    #[test]
    fn accumulator_rollback() {
        let mut acc = Accumulator::new();
        acc.push(&b"ab"[..]);
        let sp = acc.save();
        acc.put_u32(7);
        acc.push_byte(1);
        assert_eq!(acc.len(), 7);
        acc.rollback(sp);
        assert_eq!(acc.flatten(), b"ab");
    }
}
