//! MsgPack-style wire codec for twine tuples.
//!
//! Tuples, update operations and replication rows all travel as a compact
//! MsgPack-like encoding. This crate provides the positional primitives the
//! engine is built on: a type probe, cursor-style decoders over `&mut &[u8]`,
//! a one-value `skip`, exact `sizeof_*` computation for every encoder, and
//! append-style encoders into `Vec<u8>`.
//!
//! Decoders never allocate; string and binary reads borrow from the input
//! buffer. Encoders always pick the minimal-length representation, and
//! `sizeof_*` is guaranteed to match what the matching `write_*` appends —
//! the update engine's two-pass sizer relies on that equality.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod dec;
mod decode;
mod encode;
mod error;
mod types;

pub use dec::{read_decimal, sizeof_decimal, write_decimal, MP_DECIMAL};
pub use decode::{
    read_array, read_bin, read_bool, read_double, read_ext, read_float, read_int, read_int32,
    read_map, read_nil, read_str, read_str_utf8, read_uint, skip,
};
pub use encode::{
    sizeof_array, sizeof_bool, sizeof_double, sizeof_ext, sizeof_float, sizeof_int, sizeof_map,
    sizeof_nil, sizeof_str, sizeof_uint, write_array, write_bool, write_double, write_ext,
    write_float, write_int, write_map, write_nil, write_str, write_str_header, write_uint,
};
pub use error::{MpError, Result};
pub use types::{type_of, MpType};
