//! Update operations: decode and scalar execution.
//!
//! An operation arrives as a small array `[opcode, field, args...]`.
//! The field address is either an integer field number (non-negative,
//! or negative for tail-relative addressing) or a string resolved
//! against the schema dictionary, falling back to a JSON path whose
//! first token must name a top-level field.

use crate::arith::{arith_op, ArithError, ArithOp, ArithVal};
use crate::dict::TupleDict;
use crate::error::{Result, UpdateError};
use crate::path::{PathLexer, PathToken, PATH_INDEX_BASE};
use twine_mp as mp;

/// Hard cap on operations per update request.
pub const OP_COUNT_MAX: u32 = 4000;

/// Operation code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// `=`: replace a field (auto-inserts a missing map key).
    Set,
    /// `!`: insert a field.
    Insert,
    /// `#`: delete fields.
    Delete,
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `&`
    BitAnd,
    /// `|`
    BitOr,
    /// `^`
    BitXor,
    /// `:`: string splice.
    Splice,
}

impl Opcode {
    fn from_char(c: char) -> Option<Self> {
        Some(match c {
            '=' => Opcode::Set,
            '!' => Opcode::Insert,
            '#' => Opcode::Delete,
            '+' => Opcode::Add,
            '-' => Opcode::Sub,
            '&' => Opcode::BitAnd,
            '|' => Opcode::BitOr,
            '^' => Opcode::BitXor,
            ':' => Opcode::Splice,
            _ => return None,
        })
    }

    /// The opcode character as it travels on the wire.
    pub fn as_char(self) -> char {
        match self {
            Opcode::Set => '=',
            Opcode::Insert => '!',
            Opcode::Delete => '#',
            Opcode::Add => '+',
            Opcode::Sub => '-',
            Opcode::BitAnd => '&',
            Opcode::BitOr => '|',
            Opcode::BitXor => '^',
            Opcode::Splice => ':',
        }
    }

    fn arg_count(self) -> u32 {
        match self {
            Opcode::Splice => 5,
            _ => 3,
        }
    }

    /// True for `+`/`-`.
    pub fn is_arith(self) -> bool {
        matches!(self, Opcode::Add | Opcode::Sub)
    }

    /// True for insert/delete, the operations that change the parent's
    /// field count and header.
    pub fn changes_field_count(self) -> bool {
        matches!(self, Opcode::Insert | Opcode::Delete)
    }
}

/// An address token consumed from the path but not yet used to descend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrToken<'a> {
    /// Array position (0-based).
    Num(i32),
    /// Map key.
    Key(&'a str),
}

/// Splice argument triplet plus the tail geometry computed at apply
/// time.
#[derive(Debug, Clone, Copy)]
pub struct SpliceArg<'a> {
    /// Byte offset of the cut, normalized to `[0, len]` at apply time.
    pub offset: i32,
    /// Bytes removed at the offset.
    pub cut: i32,
    /// Bytes pasted at the offset.
    pub paste: &'a [u8],
    /// Offset of the preserved tail in the old string.
    pub tail_offset: i32,
    /// Length of the preserved tail.
    pub tail_len: i32,
}

/// The typed operation argument. Scalar results overwrite the argument
/// in place, so an operation is never re-executed.
#[derive(Debug, Clone, Copy)]
pub enum OpArg<'a> {
    /// Raw replacement value for `=`/`!`.
    Set(&'a [u8]),
    /// Deletion count for `#`.
    Del(u32),
    /// Operand, then result, of `+`/`-`.
    Arith(ArithVal),
    /// Operand, then result, of `&`/`|`/`^`.
    Bit(u64),
    /// Splice geometry for `:`.
    Splice(SpliceArg<'a>),
}

/// One decoded update operation.
#[derive(Debug, Clone)]
pub struct UpdateOp<'a> {
    /// The operation code.
    pub opcode: Opcode,
    /// 0-based top-level field number; negative means tail-relative.
    pub field_no: i32,
    /// Path lexer over the address string; empty for numeric addresses.
    pub lexer: PathLexer<'a>,
    /// Address token consumed (by decode or by a branch) but not yet
    /// used for a descent.
    pub token: Option<AddrToken<'a>>,
    /// Typed argument/result union.
    pub arg: OpArg<'a>,
    /// Serialized length of the produced field, set at apply time.
    pub new_field_len: u32,
}

/// Shared state of the operation list during one request.
pub(crate) struct Ops<'a> {
    pub list: Vec<UpdateOp<'a>>,
    pub index_base: i32,
}

impl<'a> UpdateOp<'a> {
    /// A user-facing identifier of the addressed field.
    pub fn field_str(&self) -> String {
        if !self.lexer.src().is_empty() {
            format!("'{}'", self.lexer.src())
        } else if self.field_no >= 0 {
            // Addresses are reported 1-based, the way callers wrote them.
            format!("{}", self.field_no + 1)
        } else {
            format!("{}", self.field_no)
        }
    }

    /// True once the whole address was consumed: the operation applies
    /// right here.
    pub fn is_term(&self) -> bool {
        self.token.is_none() && self.lexer.is_done()
    }

    /// Take the pending address token or lex the next one.
    pub fn next_token(&mut self) -> Result<AddrToken<'a>> {
        if let Some(t) = self.token.take() {
            return Ok(t);
        }
        match self.lexer.next_token() {
            Ok(PathToken::Num(n)) => Ok(AddrToken::Num(n)),
            Ok(PathToken::Str(s)) => Ok(AddrToken::Key(s)),
            Ok(PathToken::End) => Err(self.err_no_such_field()),
            Ok(PathToken::Any) => Err(self.err_bad_path(self.lexer.symbol_count)),
            Err(pos) => Err(self.err_bad_path(pos)),
        }
    }

    pub(crate) fn err_no_such_field(&self) -> UpdateError {
        if self.lexer.src().is_empty() {
            let display = if self.field_no >= 0 {
                self.field_no + 1
            } else {
                self.field_no
            };
            UpdateError::NoSuchFieldNo(display)
        } else {
            UpdateError::NoSuchFieldName(self.lexer.src().to_string())
        }
    }

    pub(crate) fn err_bad_path(&self, pos: usize) -> UpdateError {
        UpdateError::BadJsonPath {
            path: self.lexer.src().to_string(),
            pos,
        }
    }

    pub(crate) fn err_arg_type(&self, expected: &'static str) -> UpdateError {
        UpdateError::ArgType {
            op: self.opcode.as_char(),
            field: self.field_str(),
            expected,
        }
    }

    pub(crate) fn err_field(&self, reason: impl Into<String>) -> UpdateError {
        UpdateError::Field {
            field: self.field_str(),
            reason: reason.into(),
        }
    }

    pub(crate) fn err_double(&self) -> UpdateError {
        UpdateError::DoubleUpdate(self.field_str())
    }

    pub(crate) fn err_splice(&self, reason: &'static str) -> UpdateError {
        UpdateError::Splice {
            field: self.field_str(),
            reason,
        }
    }

    fn err_arith(&self, e: ArithError) -> UpdateError {
        match e {
            ArithError::IntOverflow => UpdateError::IntegerOverflow {
                op: self.opcode.as_char(),
                field: self.field_str(),
            },
            ArithError::DecimalOverflow => UpdateError::DecimalOverflow {
                op: self.opcode.as_char(),
                field: self.field_str(),
            },
            ArithError::BadDecimal => self.err_arg_type("a number convertible to decimal"),
        }
    }

    /// The arithmetic flavor of the opcode.
    pub fn arith_kind(&self) -> Option<ArithOp> {
        match self.opcode {
            Opcode::Add => Some(ArithOp::Add),
            Opcode::Sub => Some(ArithOp::Sub),
            _ => None,
        }
    }

    /// Execute `+`/`-` against the old field bytes, overwriting the
    /// argument with the result.
    pub(crate) fn do_arith(&mut self, old: &[u8]) -> Result<()> {
        let mut cur = old;
        let left = ArithVal::read(&mut cur).map_err(|_| self.err_arg_type("a number"))?;
        let OpArg::Arith(right) = &self.arg else {
            unreachable!("arith op carries an arith argument");
        };
        let op = self.arith_kind().expect("arith opcode");
        let result = arith_op(op, &left, right).map_err(|e| self.err_arith(e))?;
        self.new_field_len = result.sizeof() as u32;
        self.arg = OpArg::Arith(result);
        Ok(())
    }

    /// Execute `&`/`|`/`^` against the old field bytes.
    pub(crate) fn do_bit(&mut self, old: &[u8]) -> Result<()> {
        let mut cur = old;
        let val = match mp::type_of(cur) {
            Ok(mp::MpType::Uint) => {
                mp::read_uint(&mut cur).map_err(|_| self.err_arg_type("a positive integer"))?
            }
            _ => return Err(self.err_arg_type("a positive integer")),
        };
        let OpArg::Bit(arg) = &mut self.arg else {
            unreachable!("bit op carries a bit argument");
        };
        match self.opcode {
            Opcode::BitAnd => *arg &= val,
            Opcode::BitXor => *arg ^= val,
            Opcode::BitOr => *arg |= val,
            _ => unreachable!("checked at decode"),
        }
        self.new_field_len = mp::sizeof_uint(*arg) as u32;
        Ok(())
    }

    /// Execute `:` against the old field bytes: normalize the bounds
    /// and record the tail geometry.
    pub(crate) fn do_splice(&mut self, old: &[u8]) -> Result<()> {
        let mut cur = old;
        let subject = mp::read_str(&mut cur).map_err(|_| self.err_arg_type("a string"))?;
        let str_len = subject.len() as i32;

        let field = self.field_str();
        let OpArg::Splice(arg) = &mut self.arg else {
            unreachable!("splice op carries a splice argument");
        };
        if arg.offset < 0 {
            if -arg.offset > str_len + 1 {
                return Err(UpdateError::Splice {
                    field,
                    reason: "offset is out of bound",
                });
            }
            arg.offset += str_len + 1;
        } else if arg.offset > str_len {
            arg.offset = str_len;
        }
        debug_assert!(arg.offset >= 0 && arg.offset <= str_len);

        if arg.cut < 0 {
            if -arg.cut > str_len - arg.offset {
                arg.cut = 0;
            } else {
                arg.cut += str_len - arg.offset;
            }
        } else if arg.cut > str_len - arg.offset {
            arg.cut = str_len - arg.offset;
        }

        arg.tail_offset = arg.offset + arg.cut;
        arg.tail_len = str_len - arg.tail_offset;
        self.new_field_len =
            mp::sizeof_str((arg.offset + arg.paste.len() as i32 + arg.tail_len) as usize) as u32;
        Ok(())
    }

    /// Write the operation result over `out`; `old` is the original
    /// field (needed by splice, which scatters pieces of it).
    pub(crate) fn store(&self, old: &[u8], out: &mut Vec<u8>) {
        match &self.arg {
            OpArg::Set(value) => out.extend_from_slice(value),
            OpArg::Arith(val) => val.store(out),
            OpArg::Bit(val) => mp::write_uint(out, *val),
            OpArg::Splice(arg) => {
                let mut cur = old;
                let subject = mp::read_str(&mut cur).expect("splice subject verified at apply");
                let new_len = (arg.offset + arg.paste.len() as i32 + arg.tail_len) as usize;
                mp::write_str_header(out, new_len);
                out.extend_from_slice(&subject[..arg.offset as usize]);
                out.extend_from_slice(arg.paste);
                out.extend_from_slice(
                    &subject[arg.tail_offset as usize..(arg.tail_offset + arg.tail_len) as usize],
                );
            }
            OpArg::Del(_) => unreachable!("delete has no stored result"),
        }
    }
}

fn read_op_str<'a>(cur: &mut &'a [u8], what: &'static str) -> Result<&'a str> {
    mp::read_str_utf8(cur).map_err(|_| UpdateError::illegal(what))
}

/// Decode one operation from the request cursor.
pub(crate) fn decode_op<'a>(
    cur: &mut &'a [u8],
    index_base: i32,
    dict: &TupleDict,
) -> Result<UpdateOp<'a>> {
    if !matches!(mp::type_of(cur), Ok(mp::MpType::Array)) {
        return Err(UpdateError::illegal(
            "update operation must be an array {op,..}",
        ));
    }
    let arg_count = mp::read_array(cur).map_err(|_| UpdateError::illegal("truncated operation"))?;
    if arg_count < 1 {
        return Err(UpdateError::illegal(
            "update operation must be an array {op,..}, got empty array",
        ));
    }
    if !matches!(mp::type_of(cur), Ok(mp::MpType::Str)) {
        return Err(UpdateError::illegal(
            "update operation name must be a string",
        ));
    }
    let name = read_op_str(cur, "update operation name must be a string")?;
    let mut chars = name.chars();
    let opcode = chars
        .next()
        .filter(|_| chars.next().is_none())
        .and_then(Opcode::from_char)
        .ok_or(UpdateError::UnknownOp)?;
    if arg_count != opcode.arg_count() {
        return Err(UpdateError::UnknownOp);
    }

    let mut op = UpdateOp {
        opcode,
        field_no: 0,
        lexer: PathLexer::empty(),
        token: None,
        arg: OpArg::Del(0), // replaced by read_arg below
        new_field_len: 0,
    };

    match mp::type_of(cur) {
        Ok(mp::MpType::Uint | mp::MpType::Int) => {
            let field_no = mp::read_int32(cur).map_err(|_| op.err_arg_type("an integer"))?;
            if field_no - index_base >= 0 {
                op.field_no = field_no - index_base;
            } else if field_no < 0 {
                op.field_no = field_no;
            } else {
                return Err(UpdateError::NoSuchFieldNo(field_no));
            }
            op.token = Some(AddrToken::Num(op.field_no));
        }
        Ok(mp::MpType::Str) => {
            let path = read_op_str(cur, "field id must be a number or a string")?;
            if let Some(field_no) = dict.field_no(path) {
                // The whole string is a schema field name; no path walk.
                op.field_no = field_no as i32;
                op.token = Some(AddrToken::Num(op.field_no));
            } else {
                let mut lexer = PathLexer::new(path, PATH_INDEX_BASE);
                let first = lexer.next_token();
                match first {
                    Ok(PathToken::Num(n)) => {
                        op.field_no = n;
                        op.token = Some(AddrToken::Num(n));
                    }
                    Ok(PathToken::Str(name)) => match dict.field_no(name) {
                        Some(field_no) => {
                            op.field_no = field_no as i32;
                            op.token = Some(AddrToken::Num(op.field_no));
                        }
                        None => return Err(UpdateError::NoSuchFieldName(path.to_string())),
                    },
                    Ok(_) => return Err(UpdateError::NoSuchFieldName(path.to_string())),
                    Err(pos) => {
                        return Err(UpdateError::BadJsonPath {
                            path: path.to_string(),
                            pos,
                        })
                    }
                }
                op.lexer = lexer;
            }
        }
        _ => {
            return Err(UpdateError::illegal(
                "field id must be a number or a string",
            ));
        }
    }

    read_arg(&mut op, cur, index_base)?;
    Ok(op)
}

fn read_arg<'a>(op: &mut UpdateOp<'a>, cur: &mut &'a [u8], index_base: i32) -> Result<()> {
    match op.opcode {
        Opcode::Set | Opcode::Insert => {
            let start = *cur;
            mp::skip(cur).map_err(|_| UpdateError::illegal("truncated operation argument"))?;
            let len = start.len() - cur.len();
            op.arg = OpArg::Set(&start[..len]);
            Ok(())
        }
        Opcode::Delete => {
            if !matches!(mp::type_of(cur), Ok(mp::MpType::Uint)) {
                return Err(op.err_arg_type("a positive integer"));
            }
            let count = mp::read_uint(cur).map_err(|_| op.err_arg_type("a positive integer"))?;
            if count == 0 {
                return Err(op.err_field("cannot delete 0 fields"));
            }
            op.arg = OpArg::Del(u32::try_from(count).unwrap_or(u32::MAX));
            Ok(())
        }
        Opcode::Add | Opcode::Sub => {
            let val = ArithVal::read(cur).map_err(|_| op.err_arg_type("a number"))?;
            op.arg = OpArg::Arith(val);
            Ok(())
        }
        Opcode::BitAnd | Opcode::BitOr | Opcode::BitXor => {
            if !matches!(mp::type_of(cur), Ok(mp::MpType::Uint)) {
                return Err(op.err_arg_type("a positive integer"));
            }
            let val = mp::read_uint(cur).map_err(|_| op.err_arg_type("a positive integer"))?;
            op.arg = OpArg::Bit(val);
            Ok(())
        }
        Opcode::Splice => {
            let mut offset = mp::read_int32(cur).map_err(|_| op.err_arg_type("an integer"))?;
            if offset >= 0 {
                if offset - index_base < 0 {
                    return Err(op.err_splice("offset is out of bound"));
                }
                offset -= index_base;
            }
            let cut = mp::read_int32(cur).map_err(|_| op.err_arg_type("an integer"))?;
            let paste = mp::read_str(cur).map_err(|_| op.err_arg_type("a string"))?;
            op.arg = OpArg::Splice(SpliceArg {
                offset,
                cut,
                paste,
                tail_offset: 0,
                tail_len: 0,
            });
            Ok(())
        }
    }
}
