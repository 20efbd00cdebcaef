//! Sable bytecode interpreter
//!
//! This library provides the complete interpreter core:
//! - Image loading and decoding of the packed bytecode format
//! - Static verification with stack-depth analysis and prologue patching
//! - Checked and unchecked execution engines over a GC-cooperating stack
//! - The runtime surface: heap, builtins and pattern primitives

/// Interpreter version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod bytecode;
pub mod runtime;
pub mod value;
pub mod vm;

// Re-export commonly used types
pub use bytecode::{
    decode, disassemble, is_begin, verify, Binop, Decoded, DecodeError, Image, ImageError, Instr,
    Loc, Patt, ValidationError, ValidationErrorKind,
};
pub use runtime::{heap::Heap, heap::Obj, tag_hash, tag_name, Runtime};
pub use value::{box_int, is_int, is_ref, unbox_int, RuntimeError, Word};
pub use vm::{
    run_checked, run_unchecked,
    stack::{GcRoots, OperandStack, N_GLOBAL, STACK_SIZE},
};
