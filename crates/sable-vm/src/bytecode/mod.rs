//! Bytecode image, decoder, verifier and disassembler
//!
//! The on-disk format is a packed binary image: prefix fields, a public
//! symbol table, a NUL-terminated string table and the code section. The
//! decoder is the single definition of the instruction encoding; the
//! verifier and both execution engines dispatch over its output.

pub mod decode;
pub mod disasm;
pub mod image;
pub mod validator;

pub use decode::{decode, is_begin, Binop, CaptureList, Decoded, DecodeError, Instr, Loc, Patt};
pub use disasm::disassemble;
pub use image::{Image, ImageError};
pub use validator::{verify, ValidationError, ValidationErrorKind};
