//! The in-place tuple UPDATE engine.
//!
//! Transforms an immutable, self-describing record (a length-prefixed
//! array of typed fields, with nested arrays and maps) by applying a
//! sequence of field operations, producing the new record in one
//! contiguous buffer without materializing intermediates.
//!
//! Supported field operations: set (`=`), insert (`!`), delete (`#`),
//! arithmetic (`+`, `-`), bitwise (`&`, `|`, `^`) and string splice
//! (`:`). Fields are addressed by number (negative = tail-relative), by
//! schema name, or by JSON path (`a.b[2]`, paths are 1-indexed).
//!
//! # Entry points
//!
//! - [`update_execute`]: strict application, first failure aborts
//! - [`upsert_execute`]: per-op failures are skipped
//! - [`update_check_ops`]: decode-only validation
//! - [`upsert_squash`]: fold two upsert op lists into one

#![warn(missing_docs)]
#![warn(clippy::all)]

mod arith;
mod array;
mod bar;
mod dict;
mod error;
mod field;
mod map;
mod mask;
mod op;
mod path;
mod rope;
mod route;
mod update;

pub use arith::{ArithOp, ArithVal};
pub use dict::TupleDict;
pub use error::{Result, UpdateError};
pub use mask::{
    column_mask_is_full, column_mask_set_fieldno, column_mask_set_range, COLUMN_MASK_FULL,
};
pub use op::{Opcode, OP_COUNT_MAX};
pub use path::{PathLexer, PathToken, PATH_INDEX_BASE};
pub use update::{
    update_check_ops, update_execute, upsert_execute, upsert_squash, UpdateResult,
};
