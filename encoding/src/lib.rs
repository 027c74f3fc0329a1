//! ABI-agnostic value marshalling for guest function calls.
//!
//! The original debugger marshalled arguments through Go's `reflect`
//! package, caching an encode/decode closure per `(type, block size)` pair
//! in a `sync.Map` because reflection is too slow to redo on every call.
//! Rust doesn't need that cache: [`Encode`]/[`Decode`] are resolved
//! statically per type, and the `#[derive(GuestValue)]` macro in
//! `dbgcore-encoding-derive` generates the struct-layout logic this module
//! would otherwise need reflection for.

mod align;
mod errors;
mod stream;
mod value;

pub use align::{align_up, field_offsets, layout_struct};
pub use errors::{EncodingError, Result};
pub use stream::{BlockStream, Stream};
pub use value::{Decode, Encode, EncodedSize, GuestSlice, NaturalAlign};
