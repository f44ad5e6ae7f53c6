//! The writable view: a parent/child tree of chunk ranges over one
//! serialized value, supporting surgical in-place mutation.
//!
//! A node is a window into two chunk chains (type and value) bounded by
//! begin/end chunk references. Dissecting a child splits the underlying
//! chunks so the child's range begins and ends exactly on chunk
//! boundaries; a child therefore never shares its begin chunk identity
//! with its parent, and rewriting the parent's content (which reassigns
//! the begin chunk and relinks past the interior) leaves every disowned
//! child holding an intact, orphaned chain of its own. For `t` and `e`
//! the parent's value chain keeps a leading empty chunk so the first
//! field's begin stays stable under such rewrites.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use log::debug;

use crate::any::Any;
use crate::chunk::{self, chunk_ref, Chunk, ChunkRef};
use crate::error::{Error, ErrorKind};
use crate::scan;
use crate::type_str::{node_len, tuple_arity};

/// A shared handle to one node of a writable view tree.
pub struct WView {
    node: Rc<RefCell<Node>>,
}

impl Clone for WView {
    fn clone(&self) -> Self {
        WView { node: Rc::clone(&self.node) }
    }
}

struct Node {
    tbegin: ChunkRef,
    tend: Option<ChunkRef>,
    vbegin: ChunkRef,
    vend: Option<ChunkRef>,
    parent: Weak<RefCell<Node>>,
    index: usize,
    children: Vec<(usize, WView)>,
    /// Descriptor chunk shared by the pair children of a map.
    pair_ty: Option<ChunkRef>,
}

fn be32(v: usize) -> [u8; 4] {
    (v as u32).to_be_bytes()
}

/// Where a child's type lives.
enum TSpan {
    /// A range of the parent's type chain.
    Type(usize, usize),
    /// A range of the parent's value chain (the embedded type of an `a`).
    Value(usize, usize),
    /// A standalone descriptor of its own.
    Owned(Vec<u8>),
    /// The shared `t2KV` descriptor of a map's pair children.
    Pair(Vec<u8>),
}

struct ChildLoc {
    t: TSpan,
    v: (usize, usize),
}

impl WView {
    /// Builds a view over a validated (type, value) pair; both are
    /// copied into fresh chunks.
    pub fn new(ty: &str, val: &[u8]) -> Result<WView, Error> {
        let tb = ty.as_bytes();
        let (tc, vc) = scan::scan(tb, val, true)?;
        if tc < tb.len() {
            return Err(Error::typestring(crate::ParseErrorKind::TLong, tb, tc));
        }
        if vc < val.len() {
            return Err(Error::value_long(tb, tb.len()));
        }
        Ok(WView {
            node: Rc::new(RefCell::new(Node {
                tbegin: chunk_ref(Chunk::owned(tb)),
                tend: None,
                vbegin: chunk_ref(Chunk::owned(val)),
                vend: None,
                parent: Weak::new(),
                index: 0,
                children: Vec::new(),
                pair_ty: None,
            })),
        })
    }

    pub fn from_any(a: &Any) -> Result<WView, Error> {
        WView::new(a.type_str().as_str(), a.value())
    }

    /// Flattens the type chain.
    pub fn type_bytes(&self) -> Vec<u8> {
        let n = self.node.borrow();
        chunk::flatten(Some(&n.tbegin), n.tend.as_ref())
    }

    pub fn type_string(&self) -> String {
        String::from_utf8_lossy(&self.type_bytes()).into_owned()
    }

    /// Flattens the value chain.
    pub fn value(&self) -> Vec<u8> {
        let n = self.node.borrow();
        chunk::flatten(Some(&n.vbegin), n.vend.as_ref())
    }

    /// First byte of the type chain; `None` for void.
    pub fn typechar(&self) -> Option<u8> {
        let n = self.node.borrow();
        chunk::find_nonempty(Some(&n.tbegin), n.tend.as_ref()).map(|c| c.borrow().bytes()[0])
    }

    pub fn to_any(&self) -> Result<Any, Error> {
        Any::from_parts(&self.type_string(), self.value(), false)
    }

    fn first_value_byte(&self) -> Result<u8, Error> {
        let n = self.node.borrow();
        chunk::find_nonempty(Some(&n.vbegin), n.vend.as_ref())
            .map(|c| c.borrow().bytes()[0])
            .ok_or_else(|| Error::value_short(b"", 0))
    }

    /// Container-specific element count: runtime count for `l`/`m`,
    /// arity for `t`, the flag for `o`, 1 for `a`/`x`/`X`, 3 for `e`,
    /// 0 otherwise.
    pub fn size(&self) -> Result<usize, Error> {
        match self.typechar() {
            None => Ok(0),
            Some(b'l') | Some(b'm') => {
                let n = self.node.borrow();
                chunk::read_range_u32(&n.vbegin, n.vend.as_ref(), 0)
                    .map(|v| v as usize)
                    .ok_or_else(|| Error::value_short(b"l", 0))
            }
            Some(b't') => Ok(tuple_arity(&self.type_bytes()).0),
            Some(b'o') => Ok(self.first_value_byte()? as usize),
            Some(b'a') | Some(b'x') | Some(b'X') => Ok(1),
            Some(b'e') => Ok(3),
            _ => Ok(0),
        }
    }

    /// Dissects (or returns the cached view of) the child at logical
    /// index `i`, splitting the underlying chunks so the child's range
    /// is chunk-aligned.
    pub fn child(&self, i: usize) -> Result<WView, Error> {
        {
            let n = self.node.borrow();
            if let Some((_, c)) = n.children.iter().find(|(k, _)| *k == i) {
                return Ok(c.clone());
            }
        }
        let ty = self.type_bytes();
        let val = self.value();
        let loc = locate_child(&ty, &val, i)?;
        let child = self.build_child(&ty, loc, i)?;
        let mut n = self.node.borrow_mut();
        let pos = n.children.binary_search_by_key(&i, |(k, _)| *k).unwrap_or_else(|p| p);
        n.children.insert(pos, (i, child.clone()));
        Ok(child)
    }

    fn build_child(&self, ty: &[u8], loc: ChildLoc, i: usize) -> Result<WView, Error> {
        let tc = ty.first().copied();
        {
            let n = self.node.borrow();
            // `t` and `e` keep a leading empty value chunk so the first
            // field's begin survives parent rewrites
            if tc == Some(b't') || tc == Some(b'e') {
                let head_len = n.vbegin.borrow().len;
                if head_len > 0 {
                    chunk::split(&n.vbegin, 0);
                }
            }
            // the t<N> header gets a chunk of its own
            if tc == Some(b't') {
                let hdr = tuple_arity(ty).1;
                cut_at(&n.tbegin, n.tend.as_ref(), hdr)?;
            }
        }
        let n = self.node.borrow();
        let (vb, ve) = carve(&n.vbegin, &n.vend, loc.v.0, loc.v.1)?;
        let (tb, te) = match loc.t {
            TSpan::Type(s, e) => carve(&n.tbegin, &n.tend, s, e)?,
            TSpan::Value(s, e) => carve(&n.vbegin, &n.vend, s, e)?,
            TSpan::Owned(bytes) => (chunk_ref(Chunk::owned(&bytes)), None),
            TSpan::Pair(bytes) => {
                drop(n);
                let mut nm = self.node.borrow_mut();
                let pair = match &nm.pair_ty {
                    Some(c) => c.clone(),
                    None => {
                        let c = chunk_ref(Chunk::owned(&bytes));
                        nm.pair_ty = Some(c.clone());
                        c
                    }
                };
                drop(nm);
                let child = WView {
                    node: Rc::new(RefCell::new(Node {
                        tbegin: pair,
                        tend: None,
                        vbegin: vb,
                        vend: ve,
                        parent: Rc::downgrade(&self.node),
                        index: i,
                        children: Vec::new(),
                        pair_ty: None,
                    })),
                };
                return Ok(child);
            }
        };
        let parent = Rc::downgrade(&self.node);
        drop(n);
        Ok(WView {
            node: Rc::new(RefCell::new(Node {
                tbegin: tb,
                tend: te,
                vbegin: vb,
                vend: ve,
                parent,
                index: i,
                children: Vec::new(),
                pair_ty: None,
            })),
        })
    }

    /// Replaces this node's content with another view's.
    pub fn set_from(&self, other: &WView) -> Result<(), Error> {
        if Rc::ptr_eq(&self.node, &other.node) {
            return Ok(()); // self-assign
        }
        self.set(&other.type_string(), &other.value())
    }

    /// Replaces this node's type and value. The parent dictates whether
    /// the type may change: `a` accepts anything, `x`/`X` accept only
    /// `e` (flipping their flag byte), `t` escalates to its own parent,
    /// `o`/`e`/`l`/`m` reject.
    pub fn set(&self, ty: &str, val: &[u8]) -> Result<(), Error> {
        let new_ty = ty.as_bytes();
        let (tc, vc) = scan::scan(new_ty, val, true)?;
        if tc < new_ty.len() {
            return Err(Error::typestring(crate::ParseErrorKind::TLong, new_ty, tc));
        }
        if vc < val.len() {
            return Err(Error::value_long(new_ty, new_ty.len()));
        }
        let old_ty = self.type_bytes();
        let type_change = old_ty != new_ty;
        if type_change {
            allow_type_change(&self.node, new_ty == b"e")?;
        }
        debug!("wview set: {} bytes as {:?}", val.len(), ty);
        self.disown_children();
        if type_change {
            let parent = self.node.borrow().parent.upgrade();
            let parent_tc = parent.as_ref().and_then(|p| WView { node: p.clone() }.typechar());
            if matches!(parent_tc, Some(b'x') | Some(b'X')) && new_ty == b"e" {
                // the expected turns into its error state
                let p = parent.expect("typechar implies a parent");
                {
                    let pb = p.borrow();
                    chunk::write_range_at(&pb.vbegin, pb.vend.as_ref(), 0, &[0]);
                }
                // our descriptor detaches; the parent keeps its own
                let mut nb = self.node.borrow_mut();
                nb.tbegin = chunk_ref(Chunk::owned(b"e"));
                nb.tend = None;
            } else {
                let n = self.node.borrow();
                chunk::replace_range(&n.tbegin, n.tend.as_ref(), new_ty);
            }
        }
        {
            let n = self.node.borrow();
            chunk::replace_range(&n.vbegin, n.vend.as_ref(), val);
        }
        self.update_ancestor_sizes();
        Ok(())
    }

    fn disown_children(&self) {
        let children = std::mem::take(&mut self.node.borrow_mut().children);
        for (_, c) in children {
            c.node.borrow_mut().parent = Weak::new();
        }
    }

    /// Walks up fixing the `Tlen`/`Vlen` headers of every ancestor `a`.
    fn update_ancestor_sizes(&self) {
        let mut cur = Rc::clone(&self.node);
        loop {
            let parent = cur.borrow().parent.upgrade();
            let p = match parent {
                Some(p) => p,
                None => break,
            };
            let ptc = WView { node: p.clone() }.typechar();
            if ptc == Some(b'a') {
                let (tlen, vlen, vlen_chunk, vb) = {
                    let cb = cur.borrow();
                    (
                        chunk::flatten_len(Some(&cb.tbegin), cb.tend.as_ref()),
                        chunk::flatten_len(Some(&cb.vbegin), cb.vend.as_ref()),
                        cb.tend.clone(),
                        cb.vbegin.clone(),
                    )
                };
                {
                    let pb = p.borrow();
                    chunk::write_range_at(&pb.vbegin, pb.vend.as_ref(), 0, &be32(tlen));
                }
                if let Some(vl) = vlen_chunk {
                    chunk::write_range_at(&vl, Some(&vb), 0, &be32(vlen));
                }
            }
            cur = p;
        }
    }

    /// Removes element `i` of this container. For `o` the flag drops to
    /// absent; for `l`/`m` the count decrements; for `t` the arity
    /// decrements (an arity of 1 is rejected).
    pub fn erase(&self, i: usize) -> Result<(), Error> {
        match self.typechar() {
            Some(b'o') => {
                if i != 0 {
                    return Err(Error::api("erase index out of range"));
                }
                let child = self.child(0)?;
                let (cvb, cve) = {
                    let cb = child.node.borrow();
                    (cb.vbegin.clone(), cb.vend.clone())
                };
                {
                    let n = self.node.borrow();
                    if let Some(prev) = chunk::find_before(&n.vbegin, &cvb) {
                        prev.borrow_mut().next = cve;
                    }
                    chunk::write_range_at(&n.vbegin, n.vend.as_ref(), 0, &[0]);
                }
                self.remove_child_entry(i, false);
                self.update_ancestor_sizes();
                Ok(())
            }
            Some(b'l') | Some(b'm') => {
                let n_elems = self.size()?;
                if i >= n_elems {
                    return Err(Error::api("erase index out of range"));
                }
                let child = self.child(i)?;
                let (cvb, cve) = {
                    let cb = child.node.borrow();
                    (cb.vbegin.clone(), cb.vend.clone())
                };
                {
                    let n = self.node.borrow();
                    if let Some(prev) = chunk::find_before(&n.vbegin, &cvb) {
                        prev.borrow_mut().next = cve.clone();
                    }
                    chunk::write_range_at(&n.vbegin, n.vend.as_ref(), 0, &be32(n_elems - 1));
                }
                self.patch_sibling_end(i, cve, None);
                self.remove_child_entry(i, true);
                self.update_ancestor_sizes();
                debug!("wview erase: element {} of {}", i, n_elems);
                Ok(())
            }
            Some(b't') => {
                let ty = self.type_bytes();
                let (arity, _) = tuple_arity(&ty);
                if i >= arity {
                    return Err(Error::api("erase index out of range"));
                }
                if arity == 2 {
                    return Err(Error::new(
                        ErrorKind::TypeMismatch,
                        "erasing would leave a tuple of arity 1",
                    )
                    .with_source(&ty, 0));
                }
                allow_type_change(&self.node, false)?;
                let child = self.child(i)?;
                let (ctb, cte, cvb, cve) = {
                    let cb = child.node.borrow();
                    (cb.tbegin.clone(), cb.tend.clone(), cb.vbegin.clone(), cb.vend.clone())
                };
                {
                    let n = self.node.borrow();
                    if let Some(prev) = chunk::find_before(&n.tbegin, &ctb) {
                        prev.borrow_mut().next = cte.clone();
                    }
                    if let Some(prev) = chunk::find_before(&n.vbegin, &cvb) {
                        prev.borrow_mut().next = cve.clone();
                    }
                    // the header occupies its own chunk after dissection
                    n.tbegin.borrow_mut().assign(format!("t{}", arity - 1).as_bytes());
                }
                self.patch_sibling_end(i, cve, Some(cte));
                self.remove_child_entry(i, true);
                self.update_ancestor_sizes();
                Ok(())
            }
            _ => Err(Error::api("erase requires an o, l, m or t container")),
        }
    }

    /// After removing or inserting around element `i`, the cached
    /// previous sibling's end pointers must follow. The outer `Option`
    /// of `tend` distinguishes "leave alone" from "set to chain end".
    fn patch_sibling_end(
        &self,
        i: usize,
        vend: Option<ChunkRef>,
        tend: Option<Option<ChunkRef>>,
    ) {
        if i == 0 {
            return;
        }
        let n = self.node.borrow();
        if let Some((_, c)) = n.children.iter().find(|(k, _)| *k == i - 1) {
            let mut cb = c.node.borrow_mut();
            cb.vend = vend;
            if let Some(t) = tend {
                cb.tend = t;
            }
        }
    }

    fn remove_child_entry(&self, i: usize, shift: bool) {
        let mut n = self.node.borrow_mut();
        n.children.retain(|(k, c)| {
            if *k == i {
                c.node.borrow_mut().parent = Weak::new();
                false
            } else {
                true
            }
        });
        if shift {
            for (k, c) in n.children.iter_mut() {
                if *k > i {
                    *k -= 1;
                    c.node.borrow_mut().index -= 1;
                }
            }
        }
    }

    /// Inserts a clone of `what` after element `after` (`None` for the
    /// front). The element type must match for `l`/`m`; for `t` the
    /// arity grows and the tuple's own type change must be permitted.
    pub fn insert_after(&self, after: Option<usize>, what: &WView) -> Result<(), Error> {
        let what_ty = what.type_bytes();
        let what_val = what.value();
        match self.typechar() {
            Some(b'l') => {
                let ty = self.type_bytes();
                let elen = node_len(&ty, 1)?;
                if what_ty != ty[1..1 + elen] {
                    return Err(Error::type_mismatch()
                        .with_source(&what_ty, 0)
                        .with_target(&ty, 1));
                }
                self.insert_counted(after, &what_val)
            }
            Some(b'm') => {
                let ty = self.type_bytes();
                let klen = node_len(&ty, 1)?;
                let mlen = node_len(&ty, 1 + klen)?;
                let mut pair = b"t2".to_vec();
                pair.extend_from_slice(&ty[1..1 + klen + mlen]);
                if what_ty != pair {
                    return Err(Error::type_mismatch()
                        .with_source(&what_ty, 0)
                        .with_target(&pair, 0));
                }
                self.insert_counted(after, &what_val)
            }
            Some(b't') => self.insert_tuple_field(after, &what_ty, &what_val),
            _ => Err(Error::api("insert_after requires an l, m or t container")),
        }
    }

    fn insert_counted(&self, after: Option<usize>, what_val: &[u8]) -> Result<(), Error> {
        let n_elems = self.size()?;
        let slot = match after {
            None => 0,
            Some(a) if a < n_elems => a + 1,
            Some(_) => return Err(Error::api("insert position out of range")),
        };
        let ty = self.type_bytes();
        let val = self.value();
        // flat end offset of the element before the slot
        let mut off = 4;
        for _ in 0..slot {
            off += pair_extent(&ty, &val[off..])?;
        }
        let head = chunk_ref(Chunk::owned(what_val));
        {
            let n = self.node.borrow();
            splice_at(&n.vbegin, &n.vend, off, head.clone(), head.clone())?;
            chunk::write_range_at(&n.vbegin, n.vend.as_ref(), 0, &be32(n_elems + 1));
        }
        if slot > 0 {
            self.patch_sibling_end(slot, Some(head), None);
        }
        self.shift_children_up(slot);
        self.update_ancestor_sizes();
        debug!("wview insert: slot {} of {}", slot, n_elems + 1);
        Ok(())
    }

    fn insert_tuple_field(
        &self,
        after: Option<usize>,
        what_ty: &[u8],
        what_val: &[u8],
    ) -> Result<(), Error> {
        if what_ty.is_empty() {
            return Err(Error::api("a tuple field needs a non-void type"));
        }
        allow_type_change(&self.node, false)?;
        let ty = self.type_bytes();
        let val = self.value();
        let (arity, hdr) = tuple_arity(&ty);
        let slot = match after {
            None => 0,
            Some(a) if a < arity => a + 1,
            Some(_) => return Err(Error::api("insert position out of range")),
        };
        // make sure the header and leading empty chunk exist
        if arity > 0 {
            self.child(0)?;
        }
        let mut tpos = hdr;
        let mut voff = 0;
        for _ in 0..slot {
            let flen = node_len(&ty, tpos)?;
            voff += scan::value_extent(&ty, tpos, &val[voff..])?;
            tpos += flen;
        }
        let thead = chunk_ref(Chunk::owned(what_ty));
        let vhead = chunk_ref(Chunk::owned(what_val));
        {
            let n = self.node.borrow();
            splice_at(&n.tbegin, &n.tend, tpos, thead.clone(), thead.clone())?;
            splice_at(&n.vbegin, &n.vend, voff, vhead.clone(), vhead.clone())?;
            n.tbegin.borrow_mut().assign(format!("t{}", arity + 1).as_bytes());
        }
        if slot > 0 {
            self.patch_sibling_end(slot, Some(vhead), Some(Some(thead)));
        }
        self.shift_children_up(slot);
        self.update_ancestor_sizes();
        Ok(())
    }

    fn shift_children_up(&self, slot: usize) {
        let mut n = self.node.borrow_mut();
        for (k, c) in n.children.iter_mut() {
            if *k >= slot {
                *k += 1;
                c.node.borrow_mut().index += 1;
            }
        }
    }

    fn is_ancestor_of(&self, other: &WView) -> bool {
        let mut cur = other.node.borrow().parent.upgrade();
        while let Some(p) = cur {
            if Rc::ptr_eq(&p, &self.node) {
                return true;
            }
            cur = p.borrow().parent.upgrade();
        }
        false
    }

    /// Swaps the contents of two views in place, preserving the
    /// identity of both begin chunks (which outside children depend
    /// on). Ancestor/descendant pairs are rejected.
    pub fn swap_content_with(&self, other: &WView) -> Result<(), Error> {
        if Rc::ptr_eq(&self.node, &other.node) {
            return Ok(());
        }
        if self.is_ancestor_of(other) || other.is_ancestor_of(self) {
            return Err(Error::api("cannot swap a view with its ancestor"));
        }
        let ta = self.type_bytes();
        let tb = other.type_bytes();
        if ta != tb {
            allow_type_change(&self.node, tb == b"e")?;
            allow_type_change(&other.node, ta == b"e")?;
        }
        {
            let a = self.node.borrow();
            let b = other.node.borrow();
            // siblings of an l/m share one descriptor chunk; skip then
            if !Rc::ptr_eq(&a.tbegin, &b.tbegin) {
                swap_ranges(&a.tbegin, a.tend.as_ref(), &b.tbegin, b.tend.as_ref());
            }
            swap_ranges(&a.vbegin, a.vend.as_ref(), &b.vbegin, b.vend.as_ref());
        }
        {
            let mut a = self.node.borrow_mut();
            let mut b = other.node.borrow_mut();
            std::mem::swap(&mut a.children, &mut b.children);
            for (_, c) in &a.children {
                c.node.borrow_mut().parent = Rc::downgrade(&self.node);
            }
            for (_, c) in &b.children {
                c.node.borrow_mut().parent = Rc::downgrade(&other.node);
            }
        }
        self.update_ancestor_sizes();
        other.update_ancestor_sizes();
        Ok(())
    }

    /// On an `m` (or an `l` of tuples), byte-compares the serialized
    /// `key` against the first `nfields` fields of each element (the
    /// whole key when `nfields` is 0) and returns the first hit.
    pub fn linear_search(&self, key: &[u8], nfields: usize) -> Result<Option<WView>, Error> {
        let ty = self.type_bytes();
        let val = self.value();
        match ty.first() {
            Some(&b'm') => {
                let n = self.size()?;
                let mut off = 4;
                for i in 0..n {
                    let ke = scan::value_extent(&ty, 1, &val[off..])?;
                    if val[off..off + ke] == *key {
                        return Ok(Some(self.child(i)?));
                    }
                    off += pair_extent(&ty, &val[off..])?;
                }
                Ok(None)
            }
            Some(&b'l') if ty.get(1) == Some(&b't') => {
                let n = self.size()?;
                let (_, hdr) = tuple_arity(&ty[1..]);
                let want = if nfields == 0 { 1 } else { nfields };
                let mut off = 4;
                for i in 0..n {
                    let elem = scan::value_extent(&ty, 1, &val[off..])?;
                    let mut ke = 0;
                    let mut tpos = 1 + hdr;
                    for _ in 0..want {
                        ke += scan::value_extent(&ty, tpos, &val[off + ke..])?;
                        tpos += node_len(&ty, tpos)?;
                    }
                    if val[off..off + ke] == *key {
                        return Ok(Some(self.child(i)?));
                    }
                    off += elem;
                }
                Ok(None)
            }
            _ => Err(Error::api("linear_search requires a map or a list of tuples")),
        }
    }
}

/// Key+mapped extent of one map entry (or a single list element when
/// the descriptor is a list).
fn pair_extent(ty: &[u8], val: &[u8]) -> Result<usize, Error> {
    match ty.first() {
        Some(&b'm') => {
            let klen = node_len(ty, 1)?;
            let ke = scan::value_extent(ty, 1, val)?;
            let ve = scan::value_extent(ty, 1 + klen, &val[ke..])?;
            Ok(ke + ve)
        }
        _ => scan::value_extent(ty, 1, val),
    }
}

/// The parent dictates whether a child's type may change.
fn allow_type_change(node: &Rc<RefCell<Node>>, new_is_e: bool) -> Result<(), Error> {
    let parent = node.borrow().parent.upgrade();
    let p = match parent {
        Some(p) => p,
        None => return Ok(()),
    };
    match (WView { node: p.clone() }.typechar()) {
        Some(b'a') => Ok(()),
        Some(b'x') | Some(b'X') if new_is_e => Ok(()),
        Some(b'x') | Some(b'X') => Err(Error::new(
            ErrorKind::TypeMismatch,
            "an expected only accepts an error in place of its value",
        )),
        // a tuple's field type is part of the tuple's own type
        Some(b't') => allow_type_change(&p, false),
        _ => Err(Error::new(
            ErrorKind::TypeMismatch,
            "the enclosing container does not permit a type change",
        )),
    }
}

/// Ensures a chunk starts exactly at flat offset `off` of the range and
/// returns it. `off` must be strictly inside the range.
fn cut_at(begin: &ChunkRef, end: Option<&ChunkRef>, off: usize) -> Result<ChunkRef, Error> {
    let (c, local) = chunk::walk_to(begin, end, off).ok_or_else(|| Error::internal(b"", 0))?;
    if local == 0 {
        Ok(c)
    } else {
        Ok(chunk::split(&c, local))
    }
}

/// Chunk-aligns `[start, stop)` of the range and returns the child's
/// begin/end. An empty range at the end of the parent gets a fresh
/// empty anchor chunk.
fn carve(
    begin: &ChunkRef,
    end: &Option<ChunkRef>,
    start: usize,
    stop: usize,
) -> Result<(ChunkRef, Option<ChunkRef>), Error> {
    let range_len = chunk::flatten_len(Some(begin), end.as_ref());
    if start == stop {
        if start == range_len {
            let anchor = append_anchor(begin, end.as_ref());
            return Ok((anchor, end.clone()));
        }
        let at = cut_at(begin, end.as_ref(), start)?;
        let tail = chunk::split(&at, 0);
        return Ok((at, Some(tail)));
    }
    let b = cut_at(begin, end.as_ref(), start)?;
    let e = if stop == range_len {
        end.clone()
    } else {
        Some(cut_at(begin, end.as_ref(), stop)?)
    };
    Ok((b, e))
}

fn last_chunk(begin: &ChunkRef, end: Option<&ChunkRef>) -> ChunkRef {
    let mut cur = begin.clone();
    loop {
        let next = cur.borrow().next.clone();
        match next {
            Some(n) if end.map_or(true, |e| !Rc::ptr_eq(&n, e)) => cur = n,
            _ => return cur,
        }
    }
}

fn append_anchor(begin: &ChunkRef, end: Option<&ChunkRef>) -> ChunkRef {
    let tail = last_chunk(begin, end);
    let anchor = chunk_ref(Chunk::empty());
    let mut tb = tail.borrow_mut();
    anchor.borrow_mut().next = tb.next.clone();
    tb.next = Some(anchor.clone());
    anchor
}

/// Links the standalone chain `head..=last` into the range at flat
/// offset `off`.
fn splice_at(
    begin: &ChunkRef,
    end: &Option<ChunkRef>,
    off: usize,
    head: ChunkRef,
    last: ChunkRef,
) -> Result<(), Error> {
    let range_len = chunk::flatten_len(Some(begin), end.as_ref());
    if off == range_len {
        let prev = last_chunk(begin, end.as_ref());
        last.borrow_mut().next = prev.borrow().next.clone();
        prev.borrow_mut().next = Some(head);
    } else {
        let at = cut_at(begin, end.as_ref(), off)?;
        let prev = chunk::find_before(begin, &at).ok_or_else(|| Error::internal(b"", 0))?;
        last.borrow_mut().next = Some(at);
        prev.borrow_mut().next = Some(head);
    }
    Ok(())
}

fn detach_tail(begin: &ChunkRef, end: Option<&ChunkRef>) -> Option<(ChunkRef, ChunkRef)> {
    let first_next = begin.borrow_mut().next.take();
    match first_next {
        Some(h) if end.map_or(true, |e| !Rc::ptr_eq(&h, e)) => {
            let l = last_chunk(&h, end);
            Some((h, l))
        }
        other => {
            // nothing after the first chunk; restore for now
            begin.borrow_mut().next = other;
            None
        }
    }
}

fn attach_tail(begin: &ChunkRef, end: Option<&ChunkRef>, tail: Option<(ChunkRef, ChunkRef)>) {
    match tail {
        Some((head, last)) => {
            last.borrow_mut().next = end.cloned();
            begin.borrow_mut().next = Some(head);
        }
        None => begin.borrow_mut().next = end.cloned(),
    }
}

/// Swaps two ranges' contents while both begin chunks keep their
/// identity: the tails are exchanged, the terminators re-pointed, then
/// the begin chunks' windows swapped.
fn swap_ranges(ab: &ChunkRef, ae: Option<&ChunkRef>, bb: &ChunkRef, be: Option<&ChunkRef>) {
    let a_tail = detach_tail(ab, ae);
    let b_tail = detach_tail(bb, be);
    ab.borrow_mut().swap_window(&mut bb.borrow_mut());
    attach_tail(ab, ae, b_tail);
    attach_tail(bb, be, a_tail);
}

fn locate_child(ty: &[u8], val: &[u8], i: usize) -> Result<ChildLoc, Error> {
    let oob = || Error::api("child index out of range");
    let b = match ty.first() {
        Some(&b) => b,
        None => return Err(oob()),
    };
    match b {
        b'l' => {
            let elen = node_len(ty, 1)?;
            let count = crate::codec::get_u32(val).ok_or_else(|| Error::value_short(ty, 0))?;
            if i >= count as usize {
                return Err(oob());
            }
            let mut off = 4;
            for _ in 0..i {
                off += scan::value_extent(ty, 1, &val[off..])?;
            }
            let e = scan::value_extent(ty, 1, &val[off..])?;
            Ok(ChildLoc { t: TSpan::Type(1, 1 + elen), v: (off, off + e) })
        }
        b'm' => {
            let klen = node_len(ty, 1)?;
            let mlen = node_len(ty, 1 + klen)?;
            let count = crate::codec::get_u32(val).ok_or_else(|| Error::value_short(ty, 0))?;
            if i >= count as usize {
                return Err(oob());
            }
            let mut off = 4;
            for _ in 0..i {
                off += pair_extent(ty, &val[off..])?;
            }
            let e = pair_extent(ty, &val[off..])?;
            let mut pair = b"t2".to_vec();
            pair.extend_from_slice(&ty[1..1 + klen + mlen]);
            Ok(ChildLoc { t: TSpan::Pair(pair), v: (off, off + e) })
        }
        b't' => {
            let (arity, hdr) = tuple_arity(ty);
            if i >= arity {
                return Err(oob());
            }
            let mut tpos = hdr;
            let mut off = 0;
            for _ in 0..i {
                let flen = node_len(ty, tpos)?;
                off += scan::value_extent(ty, tpos, &val[off..])?;
                tpos += flen;
            }
            let flen = node_len(ty, tpos)?;
            let e = scan::value_extent(ty, tpos, &val[off..])?;
            Ok(ChildLoc { t: TSpan::Type(tpos, tpos + flen), v: (off, off + e) })
        }
        b'o' => {
            if i > 0 || val.first() != Some(&1) {
                return Err(oob());
            }
            Ok(ChildLoc { t: TSpan::Type(1, ty.len()), v: (1, val.len()) })
        }
        b'x' => {
            if i > 0 {
                return Err(oob());
            }
            match val.first() {
                Some(&1) => Ok(ChildLoc { t: TSpan::Type(1, ty.len()), v: (1, val.len()) }),
                Some(&0) => Ok(ChildLoc { t: TSpan::Owned(b"e".to_vec()), v: (1, val.len()) }),
                _ => Err(Error::value_short(ty, 0)),
            }
        }
        b'X' => {
            if i > 0 {
                return Err(oob());
            }
            match val.first() {
                Some(&1) => Ok(ChildLoc { t: TSpan::Owned(Vec::new()), v: (1, 1) }),
                Some(&0) => Ok(ChildLoc { t: TSpan::Owned(b"e".to_vec()), v: (1, val.len()) }),
                _ => Err(Error::value_short(ty, 0)),
            }
        }
        b'a' => {
            if i > 0 {
                return Err(oob());
            }
            let tlen = crate::codec::get_u32(val).ok_or_else(|| Error::value_short(ty, 0))? as usize;
            Ok(ChildLoc { t: TSpan::Value(4, 4 + tlen), v: (8 + tlen, val.len()) })
        }
        b'e' => {
            if i > 2 {
                return Err(oob());
            }
            static E_TY: &[u8] = b"t4sssa";
            let field = i + 1; // the type tag stays in the header
            let mut tpos = 2;
            let mut off = 0;
            for _ in 0..field {
                let flen = node_len(E_TY, tpos)?;
                off += scan::value_extent(E_TY, tpos, &val[off..])?;
                tpos += flen;
            }
            let flen = node_len(E_TY, tpos)?;
            let e = scan::value_extent(E_TY, tpos, &val[off..])?;
            Ok(ChildLoc {
                t: TSpan::Owned(E_TY[tpos..tpos + flen].to_vec()),
                v: (off, off + e),
            })
        }
        _ => Err(oob()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::put_u32;
    use crate::text::TextMode;

    fn view(text: &str) -> WView {
        let a = Any::from_text(text, TextMode::Normal).unwrap();
        WView::from_any(&a).unwrap()
    }

    fn ints(w: &WView) -> Vec<i32> {
        let a = w.to_any().unwrap();
        a.to_typed::<Vec<i32>>().unwrap()
    }

    #[test]
    fn dissect_and_read() {
        let w = view("[(1, \"one\"), (2, \"two\")]");
        assert_eq!(w.typechar(), Some(b'l'));
        assert_eq!(w.size().unwrap(), 2);
        let first = w.child(0).unwrap();
        assert_eq!(first.type_string(), "t2is");
        let snd_field = first.child(1).unwrap();
        assert_eq!(snd_field.value(), {
            let mut v = Vec::new();
            put_u32(&mut v, 3);
            v.extend_from_slice(b"one");
            v
        });
        // cached children come back identical
        assert!(Rc::ptr_eq(&w.child(0).unwrap().node, &first.node));
    }

    #[test]
    fn set_leaf_updates_parent() {
        let w = view("[1, 2, 3]");
        let second = w.child(1).unwrap();
        second.set("i", &9i32.to_be_bytes()).unwrap();
        assert_eq!(ints(&w), vec![1, 9, 3]);
    }

    #[test]
    fn set_rejects_forbidden_type_change() {
        let w = view("[1, 2, 3]");
        let second = w.child(1).unwrap();
        let err = second.set("s", &[0, 0, 0, 0]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    }

    #[test]
    fn disowned_children_stay_isolated() {
        let w = view("[1, 2, 3]");
        let child = w.child(1).unwrap();
        let mut fresh = Vec::new();
        put_u32(&mut fresh, 1);
        fresh.extend_from_slice(&7i32.to_be_bytes());
        w.set("li", &fresh).unwrap();
        assert_eq!(ints(&w), vec![7]);
        // the old child still reads its old bytes, and writing through
        // it does not disturb the parent
        assert_eq!(child.value(), 2i32.to_be_bytes());
        child.set("i", &5i32.to_be_bytes()).unwrap();
        assert_eq!(ints(&w), vec![7]);
    }

    #[test]
    fn erase_list_element() {
        let w = view("[1, 2, 3]");
        w.erase(1).unwrap();
        assert_eq!(ints(&w), vec![1, 3]);
        assert_eq!(w.size().unwrap(), 2);
    }

    #[test]
    fn erase_optional_and_tuple() {
        let w = view("<oi>5");
        assert_eq!(w.size().unwrap(), 1);
        w.erase(0).unwrap();
        assert_eq!(w.size().unwrap(), 0);
        assert_eq!(w.value(), vec![0]);

        let t = view("(1, \"x\", true)");
        t.erase(1).unwrap();
        assert_eq!(t.type_string(), "t2ib");
        assert_eq!(t.value(), {
            let mut v = Vec::new();
            v.extend_from_slice(&1i32.to_be_bytes());
            v.push(1);
            v
        });
        let pair = view("(1, true)");
        assert!(pair.erase(0).is_err());
    }

    #[test]
    fn insert_into_list_and_map() {
        let w = view("[1, 3]");
        let two = view("<i>2");
        w.insert_after(Some(0), &two).unwrap();
        assert_eq!(ints(&w), vec![1, 2, 3]);
        let zero = view("<i>0");
        w.insert_after(None, &zero).unwrap();
        assert_eq!(ints(&w), vec![0, 1, 2, 3]);

        let m = view("{\"a\": 1}");
        let pair = view("(\"x\", 5)");
        m.insert_after(None, &pair).unwrap();
        assert_eq!(m.type_string(), "msi");
        assert_eq!(m.size().unwrap(), 2);
        let key = Any::from_typed(&"x".to_string()).unwrap();
        let hit = m.linear_search(key.value(), 0).unwrap().unwrap();
        assert_eq!(&hit.value()[hit.value().len() - 4..], &5i32.to_be_bytes());
        // a mismatched pair type is refused
        let bad = view("(1.5, 5)");
        assert_eq!(m.insert_after(None, &bad).unwrap_err().kind(), ErrorKind::TypeMismatch);
    }

    #[test]
    fn swap_list_elements() {
        let w = view("[1, 2, 3]");
        let a = w.child(0).unwrap();
        let b = w.child(2).unwrap();
        a.swap_content_with(&b).unwrap();
        assert_eq!(ints(&w), vec![3, 2, 1]);
    }

    #[test]
    fn swap_rejects_ancestry() {
        let w = view("[(1, \"a\"), (2, \"b\")]");
        let child = w.child(0).unwrap();
        assert_eq!(w.swap_content_with(&child).unwrap_err().kind(), ErrorKind::ApiError);
    }

    #[test]
    fn any_sizes_follow_edits() {
        let w = view("<a>[1, 2]");
        assert_eq!(w.typechar(), Some(b'a'));
        let inner = w.child(0).unwrap();
        assert_eq!(inner.type_string(), "li");
        let mut longer = Vec::new();
        put_u32(&mut longer, 3);
        for i in [5i32, 6, 7] {
            longer.extend_from_slice(&i.to_be_bytes());
        }
        inner.set("li", &longer).unwrap();
        // the whole any still scans, with the corrected Vlen framing
        let back = w.to_any().unwrap();
        let inner_any = back.element(0).unwrap();
        assert_eq!(inner_any.type_bytes(), b"li");
        assert_eq!(inner_any.value(), longer.as_slice());
        let (_, vc) = crate::scan(b"a", back.value(), true).unwrap();
        assert_eq!(vc, back.value().len());
    }

    #[test]
    fn expected_turns_into_error() {
        let w = view("<xi>5");
        let child = w.child(0).unwrap();
        assert_eq!(child.type_string(), "i");
        let e = Any::from_text("error(\"t\", \"id\", \"oops\")", TextMode::Normal).unwrap();
        child.set("e", e.value()).unwrap();
        // the parent descriptor is unchanged but the flag flipped
        assert_eq!(w.type_string(), "xi");
        assert_eq!(w.value()[0], 0);
        let (_, vc) = crate::scan(b"xi", &w.value(), true).unwrap();
        assert_eq!(vc, w.value().len());
        // only an error may replace the value
        let w2 = view("<xi>5");
        let c2 = w2.child(0).unwrap();
        assert!(c2.set("s", &[0, 0, 0, 0]).is_err());
    }

    #[test]
    fn flatten_matches_serialization() {
        let w = view("{\"k\": [1, 2]}");
        let a = w.to_any().unwrap();
        assert_eq!(w.type_bytes(), a.type_str().as_bytes());
        assert_eq!(w.value(), a.value());
        let child = w.child(0).unwrap();
        let _ = child; // dissection must not change the flattened bytes
        assert_eq!(w.value(), a.value());
    }
}
