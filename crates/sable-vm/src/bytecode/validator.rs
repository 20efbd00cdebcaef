//! Static verifier — proves checked-mode preconditions before execution
//!
//! Three phases over the code section:
//! 1. **Control-flow census**: depth-first walk from every public entry,
//!    collecting the set of instructions that are jump or call targets.
//! 2. **Abstract stack-depth interpretation**: a worklist walk tracking the
//!    operand depth along every path; at each target the inbound depths must
//!    agree, and no instruction may consume more than is there.
//! 3. **Prologue patching**: each function's observed maximum depth is
//!    written into the high 16 bits of its BEGIN argument field, so the
//!    engine can reserve the whole frame in one test.
//!
//! An accepted image runs under the unchecked engine with the same observable
//! behavior as under the checked one.

use std::collections::{HashMap, HashSet};

use crate::bytecode::decode::{decode, is_begin, DecodeError, Instr, Loc, Patt};
use crate::bytecode::image::Image;
use crate::vm::stack::N_GLOBAL;

// ============================================================================
// Errors
// ============================================================================

/// A verification error with the byte offset where it was detected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Offset in the code section where the error was detected.
    pub offset: usize,
    /// What went wrong.
    pub kind: ValidationErrorKind,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "offset {:#010x}: {}", self.offset, self.kind)
    }
}

impl std::error::Error for ValidationError {}

/// Kinds of errors the verifier can detect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// The decoder rejected the instruction.
    Decode(DecodeError),
    /// A jump target falls outside the code section.
    JumpOutOfCode { target: i32 },
    /// A CALL target is not a BEGIN/CBEGIN instruction.
    CallTargetNotBegin { target: i32 },
    /// A CLOSURE entry is not a BEGIN/CBEGIN instruction.
    ClosureTargetNotBegin { target: i32 },
    /// A closure capture record carries an unknown location kind.
    BadCaptureKind { kind: u8 },
    /// A GLOBAL location index is outside the globals region.
    GlobalOutOfBounds { index: i32 },
    /// A count operand is negative.
    NegativeOperand { value: i32 },
    /// An instruction consumes more operands than the path provides.
    StackUnderflow { required: u32, depth: u32 },
    /// The abstract depth went below zero.
    NegativeDepth,
    /// Two paths reach the same join point with different depths.
    DepthMismatch { first: u32, now: u32 },
    /// A function needs more stack than fits the 16-bit reservation.
    ReservationOverflow { max_depth: u32 },
}

impl std::fmt::Display for ValidationErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "{}", e),
            Self::JumpOutOfCode { target } => {
                write!(f, "trying to jump out of the code area to offset {}", target)
            }
            Self::CallTargetNotBegin { target } => {
                write!(f, "CALL of offset {} does not call a function", target)
            }
            Self::ClosureTargetNotBegin { target } => {
                write!(f, "closure entry {} does not point at begin", target)
            }
            Self::BadCaptureKind { kind } => {
                write!(f, "unsupported argument kind {} in closure", kind)
            }
            Self::GlobalOutOfBounds { index } => {
                write!(f, "querying out of bounds global {}", index)
            }
            Self::NegativeOperand { value } => {
                write!(f, "negative count operand {}", value)
            }
            Self::StackUnderflow { required, depth } => {
                write!(f, "stack underflow: needs {}, path provides {}", required, depth)
            }
            Self::NegativeDepth => {
                write!(f, "negative stack depth on the abstract execution")
            }
            Self::DepthMismatch { first, now } => {
                write!(f, "stack depth mismatch: first seen {}, now {}", first, now)
            }
            Self::ReservationOverflow { max_depth } => {
                write!(f, "function needs {} stack words, above the 16-bit limit", max_depth)
            }
        }
    }
}

fn at(offset: usize, kind: ValidationErrorKind) -> ValidationError {
    ValidationError { offset, kind }
}

// ============================================================================
// Public API
// ============================================================================

/// Verify `image`, patching function prologues on success.
///
/// Stops at the first error: the depth analysis cannot proceed past one.
pub fn verify(image: &mut Image) -> Result<(), ValidationError> {
    let targets = gather_targets(image)?;
    let reservations = check_depths(image, &targets)?;
    for (entry, max_depth) in reservations {
        if max_depth > u16::MAX as u32 {
            return Err(at(entry, ValidationErrorKind::ReservationOverflow { max_depth }));
        }
        // A public entry need not start with a prologue; only real
        // functions carry a reservation.
        if is_begin(image, entry as i32) {
            image.patch_begin_reservation(entry, max_depth as u16);
        }
    }
    Ok(())
}

// ============================================================================
// Phase A: control-flow census
// ============================================================================

/// Successors of an instruction, as the census sees them.
struct Flow {
    jump: Option<i32>,
    falls_through: bool,
}

fn flow(instr: &Instr) -> Flow {
    match *instr {
        Instr::Jmp(target) => Flow {
            jump: Some(target),
            falls_through: false,
        },
        Instr::Cjmp { target, .. } => Flow {
            jump: Some(target),
            falls_through: true,
        },
        Instr::Call { entry, .. } => Flow {
            jump: Some(entry),
            falls_through: true,
        },
        // A closure body is a callee: it enters through CALLC eventually,
        // but its code is only named here.
        Instr::Closure { entry, .. } => Flow {
            jump: Some(entry),
            falls_through: true,
        },
        Instr::EndRet { .. } | Instr::Failure(..) | Instr::Stop => Flow {
            jump: None,
            falls_through: false,
        },
        _ => Flow {
            jump: None,
            falls_through: true,
        },
    }
}

/// Walk every reachable instruction and collect the offsets that some jump
/// or call enters.
fn gather_targets(image: &Image) -> Result<HashSet<usize>, ValidationError> {
    let code_len = image.code().len();
    let mut targets = HashSet::new();
    let mut visited = vec![false; code_len];
    let mut work = Vec::new();

    let push_if_new = |work: &mut Vec<usize>, visited: &mut Vec<bool>, ip: usize| {
        if !visited[ip] {
            visited[ip] = true;
            work.push(ip);
        }
    };

    for i in 0..image.public_count {
        let (_, code_offset) = image.public_entry(i);
        push_if_new(&mut work, &mut visited, code_offset as usize);
    }

    while let Some(ip) = work.pop() {
        let decoded =
            decode(image, ip).map_err(|e| at(ip, ValidationErrorKind::Decode(e)))?;
        let flow = flow(&decoded.instr);
        if let Some(target) = flow.jump {
            if target < 0 || target as usize >= code_len {
                return Err(at(ip, ValidationErrorKind::JumpOutOfCode { target }));
            }
            push_if_new(&mut work, &mut visited, target as usize);
            targets.insert(target as usize);
        }
        if flow.falls_through {
            if decoded.next_ip >= code_len {
                return Err(at(
                    decoded.next_ip,
                    ValidationErrorKind::Decode(DecodeError::OutOfCode { offset: decoded.next_ip }),
                ));
            }
            push_if_new(&mut work, &mut visited, decoded.next_ip);
        }
    }

    Ok(targets)
}

// ============================================================================
// Phase B: abstract stack-depth interpretation
// ============================================================================

/// One pending path state.
struct Work {
    ip: usize,
    /// Entry offset of the function this path belongs to.
    function_entry: usize,
    depth: u32,
    max_depth: u32,
}

/// Net stack effect of an instruction.
fn depth_change(instr: &Instr) -> i64 {
    match *instr {
        Instr::Const(_) | Instr::Str(_) | Instr::Dup | Instr::Ld(..) | Instr::CallRead => 1,
        Instr::Lda(..) => 2,
        Instr::Closure { .. } => 1,
        Instr::Sexp { n, .. } => 1 - n as i64,
        Instr::Call { n_args, .. } => 1 - n_args as i64,
        Instr::Callc { n_args } => -(n_args as i64),
        Instr::CallBarray(n) => 1 - n as i64,
        Instr::Binop(_) | Instr::Sti | Instr::Drop | Instr::Elem | Instr::Cjmp { .. } => -1,
        Instr::Sta => -2,
        Instr::Patt(Patt::StrEq) => -1,
        Instr::Jmp(_)
        | Instr::EndRet { .. }
        | Instr::Swap
        | Instr::St(..)
        | Instr::Begin { .. }
        | Instr::Tag { .. }
        | Instr::Array(_)
        | Instr::Failure(..)
        | Instr::Line(_)
        | Instr::Patt(_)
        | Instr::CallWrite
        | Instr::CallLength
        | Instr::CallString
        | Instr::Stop => 0,
    }
}

/// How many operands the handler pops before anything else; the path must
/// provide at least this many.
fn required_depth(instr: &Instr) -> i64 {
    match *instr {
        Instr::Binop(_) | Instr::Sti | Instr::Swap | Instr::Elem => 2,
        Instr::Sta => 3,
        Instr::Drop
        | Instr::Dup
        | Instr::St(..)
        | Instr::Cjmp { .. }
        | Instr::EndRet { .. }
        | Instr::Tag { .. }
        | Instr::Array(_)
        | Instr::CallWrite
        | Instr::CallLength
        | Instr::CallString => 1,
        Instr::Patt(Patt::StrEq) => 2,
        Instr::Patt(_) => 1,
        Instr::Call { n_args, .. } => n_args as i64,
        Instr::Callc { n_args } => n_args as i64 + 1,
        Instr::CallBarray(n) => n as i64,
        Instr::Sexp { n, .. } => n as i64,
        _ => 0,
    }
}

/// Opcode-specific structural invariants.
fn structural_check(image: &Image, ip: usize, instr: &Instr) -> Result<(), ValidationError> {
    let code_len = image.code().len() as i32;
    match *instr {
        Instr::Jmp(target) | Instr::Cjmp { target, .. } => {
            if target < 0 || target >= code_len {
                return Err(at(ip, ValidationErrorKind::JumpOutOfCode { target }));
            }
        }
        Instr::Call { entry, n_args } => {
            if n_args < 0 {
                return Err(at(ip, ValidationErrorKind::NegativeOperand { value: n_args }));
            }
            if !is_begin(image, entry) {
                return Err(at(ip, ValidationErrorKind::CallTargetNotBegin { target: entry }));
            }
        }
        Instr::Closure { entry, captures } => {
            if !is_begin(image, entry) {
                return Err(at(
                    ip,
                    ValidationErrorKind::ClosureTargetNotBegin { target: entry },
                ));
            }
            for (kind, _) in captures.iter() {
                if Loc::from_kind(kind).is_none() {
                    return Err(at(ip, ValidationErrorKind::BadCaptureKind { kind }));
                }
            }
        }
        Instr::Ld(Loc::Global, index)
        | Instr::Lda(Loc::Global, index)
        | Instr::St(Loc::Global, index) => {
            if index < 0 || index >= N_GLOBAL as i32 {
                return Err(at(ip, ValidationErrorKind::GlobalOutOfBounds { index }));
            }
        }
        Instr::Sexp { n, .. } | Instr::Array(n) | Instr::CallBarray(n) | Instr::Callc { n_args: n } => {
            if n < 0 {
                return Err(at(ip, ValidationErrorKind::NegativeOperand { value: n }));
            }
        }
        Instr::Begin { n_locals, .. } => {
            if n_locals < 0 {
                return Err(at(ip, ValidationErrorKind::NegativeOperand { value: n_locals }));
            }
        }
        _ => {}
    }
    Ok(())
}

/// Walk every path, proving depth consistency; returns the maximum observed
/// depth per function entry.
fn check_depths(
    image: &Image,
    targets: &HashSet<usize>,
) -> Result<HashMap<usize, u32>, ValidationError> {
    let mut registered: HashMap<usize, u32> = HashMap::new();
    let mut visited: HashSet<usize> = HashSet::new();
    let mut max_stack: HashMap<usize, u32> = HashMap::new();
    let mut work: Vec<Work> = Vec::new();

    let register = |registered: &mut HashMap<usize, u32>, ip: usize, depth: u32| {
        match registered.get(&ip) {
            Some(&first) if first != depth => Err(at(
                ip,
                ValidationErrorKind::DepthMismatch { first, now: depth },
            )),
            Some(_) => Ok(()),
            None => {
                registered.insert(ip, depth);
                Ok(())
            }
        }
    };

    for i in 0..image.public_count {
        let (_, code_offset) = image.public_entry(i);
        let entry = code_offset as usize;
        work.push(Work {
            ip: entry,
            function_entry: entry,
            depth: 0,
            max_depth: 0,
        });
    }

    while let Some(item) = work.pop() {
        let decoded =
            decode(image, item.ip).map_err(|e| at(item.ip, ValidationErrorKind::Decode(e)))?;
        let instr = decoded.instr;
        structural_check(image, item.ip, &instr)?;

        let required = required_depth(&instr);
        if required > item.depth as i64 {
            return Err(at(
                item.ip,
                ValidationErrorKind::StackUnderflow {
                    required: required as u32,
                    depth: item.depth,
                },
            ));
        }
        let new_depth = item.depth as i64 + depth_change(&instr);
        if new_depth < 0 {
            return Err(at(item.ip, ValidationErrorKind::NegativeDepth));
        }
        let new_depth = new_depth as u32;
        if targets.contains(&item.ip) {
            register(&mut registered, item.ip, item.depth)?;
        }
        let new_max = item.max_depth.max(new_depth);

        match instr {
            Instr::Call { entry, .. } | Instr::Closure { entry, .. } => {
                let callee = entry as usize;
                if visited.insert(callee) {
                    work.push(Work {
                        ip: callee,
                        function_entry: callee,
                        depth: 0,
                        max_depth: 0,
                    });
                }
                work.push(Work {
                    ip: decoded.next_ip,
                    function_entry: item.function_entry,
                    depth: new_depth,
                    max_depth: new_max,
                });
            }
            Instr::Jmp(target) => {
                let target = target as usize;
                if visited.insert(target) {
                    work.push(Work {
                        ip: target,
                        function_entry: item.function_entry,
                        depth: new_depth,
                        max_depth: new_max,
                    });
                }
                register(&mut registered, target, new_depth)?;
            }
            Instr::Cjmp { target, .. } => {
                let target = target as usize;
                if visited.insert(target) {
                    work.push(Work {
                        ip: target,
                        function_entry: item.function_entry,
                        depth: new_depth,
                        max_depth: new_max,
                    });
                }
                register(&mut registered, target, new_depth)?;
                work.push(Work {
                    ip: decoded.next_ip,
                    function_entry: item.function_entry,
                    depth: new_depth,
                    max_depth: new_max,
                });
            }
            Instr::EndRet { .. } => {
                let slot = max_stack.entry(item.function_entry).or_insert(0);
                *slot = (*slot).max(item.max_depth);
            }
            Instr::Failure(..) | Instr::Stop => {}
            _ => {
                work.push(Work {
                    ip: decoded.next_ip,
                    function_entry: item.function_entry,
                    depth: new_depth,
                    max_depth: new_max,
                });
            }
        }
    }

    Ok(max_stack)
}
