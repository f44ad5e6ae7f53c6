use std::borrow::Cow;
use std::fmt;

use crate::convert::Policy;

/// Low-level codes shared by the type-string walker and the value scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseErrorKind {
    /// The type string ended in the middle of a compound type.
    #[error("unexpected end of type string")]
    End,
    /// A byte outside the descriptor alphabet.
    #[error("invalid character in type string")]
    Chr,
    /// A tuple header with arity below 2 (or no arity at all).
    #[error("tuple arity must be at least 2")]
    Num,
    /// Trailing characters after a complete type.
    #[error("extra characters after type string")]
    TLong,
    /// The serialized value ran short of its type.
    #[error("value too short for its type")]
    Val,
    /// Trailing bytes after a complete value.
    #[error("extra bytes after value")]
    VLong,
}

/// Coarse classification of every failure the crate reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Ill-formed or truncated type descriptor.
    TypeString,
    /// A value that underflows or overflows its declared type, or a
    /// runtime shape that cannot match (list length vs. tuple arity).
    ValueMismatch,
    /// Structurally incompatible types, or a conversion a policy flag
    /// would have to enable.
    TypeMismatch,
    /// A should-not-happen invariant violation in the type walker.
    InternalTypeString,
    /// The caller violated a precondition.
    ApiError,
    /// An `e` was met inside an expected during an otherwise successful
    /// conversion.
    ExpectedWithError,
    /// A pretty-printer length budget was exceeded.
    Truncated,
}

/// A type string with the position the error points at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypePos {
    pub ty: String,
    pub pos: usize,
}

impl TypePos {
    pub(crate) fn at(ty: &[u8], pos: usize) -> Self {
        TypePos { ty: String::from_utf8_lossy(ty).into_owned(), pos }
    }

    /// The type string with a `*` marking the error position.
    pub fn starred(&self) -> String {
        let pos = self.pos.min(self.ty.len());
        let mut s = String::with_capacity(self.ty.len() + 1);
        s.push_str(&self.ty[..pos]);
        s.push('*');
        s.push_str(&self.ty[pos..]);
        s
    }
}

/// The error type of every fallible operation in the crate.
///
/// Carries the offending source and target type strings (starred at the
/// failure position), the policy flag that would have enabled a denied
/// conversion, and a message template where `%1`/`%2` stand for the two
/// types and `%e` for collected expected-errors.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    template: Cow<'static, str>,
    source_ty: TypePos,
    target_ty: TypePos,
    policy: Option<Policy>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, template: impl Into<Cow<'static, str>>) -> Self {
        Error {
            kind,
            template: template.into(),
            source_ty: TypePos::default(),
            target_ty: TypePos::default(),
            policy: None,
        }
    }

    pub(crate) fn with_source(mut self, ty: &[u8], pos: usize) -> Self {
        self.source_ty = TypePos::at(ty, pos);
        self
    }

    pub(crate) fn with_target(mut self, ty: &[u8], pos: usize) -> Self {
        self.target_ty = TypePos::at(ty, pos);
        self
    }

    pub(crate) fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// A malformed type string, from a low-level walker code.
    pub(crate) fn typestring(code: ParseErrorKind, ty: &[u8], pos: usize) -> Self {
        let kind = match code {
            ParseErrorKind::Val | ParseErrorKind::VLong => ErrorKind::ValueMismatch,
            _ => ErrorKind::TypeString,
        };
        Error::new(kind, format!("{} in %1", code)).with_source(ty, pos)
    }

    pub(crate) fn value_short(ty: &[u8], pos: usize) -> Self {
        Error::new(ErrorKind::ValueMismatch, "value too short for type %1").with_source(ty, pos)
    }

    pub(crate) fn value_long(ty: &[u8], pos: usize) -> Self {
        Error::new(ErrorKind::ValueMismatch, "extra bytes after value of type %1")
            .with_source(ty, pos)
    }

    pub(crate) fn type_mismatch() -> Self {
        Error::new(ErrorKind::TypeMismatch, "cannot convert %1 into %2")
    }

    pub(crate) fn internal(ty: &[u8], pos: usize) -> Self {
        Error::new(ErrorKind::InternalTypeString, "internal inconsistency walking %1")
            .with_source(ty, pos)
    }

    pub(crate) fn api(msg: &'static str) -> Self {
        Error::new(ErrorKind::ApiError, msg)
    }

    pub(crate) fn truncated() -> Self {
        Error::new(ErrorKind::Truncated, "output exceeds the length budget")
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The policy flag that would enable the denied conversion, if any.
    pub fn required_policy(&self) -> Option<Policy> {
        self.policy
    }

    pub fn source_type(&self) -> &TypePos {
        &self.source_ty
    }

    pub fn target_type(&self) -> &TypePos {
        &self.target_ty
    }

    /// Wraps the source type in parentheses and appends the remainder of
    /// the enclosing descriptor, for errors that originate inside the
    /// embedded type of an `a`.
    pub(crate) fn encaps_any(mut self, outer: &[u8], outer_pos: usize) -> Self {
        let rest = String::from_utf8_lossy(&outer[outer_pos.min(outer.len())..]);
        self.source_ty = TypePos {
            ty: format!("({}){}", self.source_ty.ty, rest),
            pos: self.source_ty.pos + 1,
        };
        self
    }

    /// Marks a tuple-matching failure that survived backtracking.
    pub(crate) fn annotate_any_value(mut self) -> Self {
        let mut t = self.template.into_owned();
        t.push_str(" (with any incoming value)");
        self.template = Cow::Owned(t);
        self
    }

    /// Renders the message, substituting `%1`, `%2` and `%e`.
    pub fn message_with(&self, expected: &[Error]) -> String {
        let mut out = String::with_capacity(self.template.len() + 16);
        let mut rest = self.template.as_ref();
        while let Some(i) = rest.find('%') {
            out.push_str(&rest[..i]);
            match rest.as_bytes().get(i + 1) {
                Some(b'1') => out.push_str(&self.source_ty.starred()),
                Some(b'2') => out.push_str(&self.target_ty.starred()),
                Some(b'e') => {
                    for (n, e) in expected.iter().enumerate() {
                        if n > 0 {
                            out.push_str("; ");
                        }
                        out.push_str(&e.message());
                    }
                }
                Some(&c) => {
                    out.push('%');
                    out.push(c as char);
                }
                None => out.push('%'),
            }
            rest = &rest[(i + 2).min(rest.len())..];
        }
        out.push_str(rest);
        if let Some(p) = self.policy {
            out.push_str(&format!(" (enable {:?} to allow)", p));
        }
        out
    }

    pub fn message(&self) -> String {
        self.message_with(&[])
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.message())
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starred_position() {
        let tp = TypePos::at(b"lt2is", 1);
        assert_eq!(tp.starred(), "l*t2is");
        let tp = TypePos::at(b"i", 5);
        assert_eq!(tp.starred(), "i*");
    }

    #[test]
    fn message_substitution() {
        let e = Error::type_mismatch().with_source(b"li", 1).with_target(b"ls", 1);
        assert_eq!(e.message(), "cannot convert l*i into l*s");
    }

    #[test]
    fn encaps_any_parenthesizes() {
        let e = Error::type_mismatch().with_source(b"i", 0).encaps_any(b"lai", 2);
        assert_eq!(e.source_type().starred(), "(*i)i");
    }
}
