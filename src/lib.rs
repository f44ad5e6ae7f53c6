//! Self-describing binary values: a compact type-descriptor language,
//! the matching big-endian wire format, and a runtime that can
//! validate, convert, print, parse and surgically edit serialized
//! values.
//!
//! A value travels as an [`Any`]: a descriptor string (`i`, `s`, `li`,
//! `mst2id`, ...) paired with the bytes it describes. The descriptor
//! grammar is one byte per node: `b c i I d s` for the primitives,
//! `l<T>` lists, `m<K><V>` maps, `t<N><T>...` tuples, `o<T>` optionals,
//! `x<T>`/`X` expecteds, `e` errors, `a` nested anys, and the empty
//! string for void.
//!
//! ```
//! # fn main() -> Result<(), anywire::Error> {
//! use anywire::{Any, Policy, TextMode};
//!
//! let v = Any::from_text("[(1, \"one\"), (2, \"two\")]", TextMode::Normal)?;
//! assert_eq!(v.type_str().as_str(), "lt2is");
//! assert_eq!(v.print()?, "<lt2is>[(1,\"one\"),(2,\"two\")]");
//!
//! // structural conversion under an explicit policy
//! let n = Any::from_text("[1, 2, 3]", TextMode::Normal)?;
//! let t = n.convert_to("t3iii", Policy::TUPLE_LIST)?;
//! assert_eq!(t.type_str().as_str(), "t3iii");
//! # Ok(())
//! # }
//! ```
//!
//! In-place edits go through [`WView`], a chunked copy-on-write view
//! that supports insert, erase, replace, swap and key lookup without
//! reserializing the surrounding value:
//!
//! ```
//! # fn main() -> Result<(), anywire::Error> {
//! use anywire::{Any, TextMode, WView};
//!
//! let w = WView::from_any(&Any::from_text("[1, 2, 3]", TextMode::Normal)?)?;
//! w.erase(1)?;
//! assert_eq!(w.to_any()?.print()?, "<li>[1,3]");
//! # Ok(())
//! # }
//! ```

mod any;
mod chunk;
mod codec;
mod convert;
mod default_value;
mod error;
mod print;
mod scan;
mod serialize;
mod text;
mod type_str;
mod wview;

pub use any::{Any, AnyView};
pub use chunk::Accumulator;
pub use codec::ByteSource;
pub use convert::{check_convertible, consume, convert, Policy};
pub use default_value::default_value;
pub use error::{Error, ErrorKind, ParseErrorKind, TypePos};
pub use print::{print, print_json, print_to, ExpectedHandler, PrintOptions};
pub use scan::{scan, scan_chunked};
pub use serialize::Serializable;
pub use text::{parse_text, TextMode};
pub use type_str::{parse_type, TypeParseError, TypeStr};
pub use wview::WView;
