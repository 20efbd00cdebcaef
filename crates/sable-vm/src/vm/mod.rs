//! Execution engine
//!
//! A fetch-decode-execute loop over [`Instr`] values. The engine comes in
//! two monomorphic flavors selected by the `CHECKED` parameter: the checked
//! engine validates every operand and target as it goes, the unchecked one
//! assumes the verifier has already ruled the failures out. Both share the
//! same handler code; only the guards differ.

pub mod stack;

use crate::bytecode::decode::{decode, is_begin, Binop, Decoded, Instr, Loc, Patt};
use crate::bytecode::image::Image;
use crate::runtime::{self, tag_hash, Runtime};
use crate::value::{box_int, unbox_int, RuntimeError, Word};
use stack::{OperandStack, N_GLOBAL, STACK_BEGIN, STACK_SIZE};

/// Run with every runtime check enabled.
pub fn run_checked(image: &Image, rt: &mut Runtime) -> Result<(), RuntimeError> {
    Interp::<true>::new(image, rt).run()
}

/// Run without bytecode-level checks. Only meaningful after the verifier
/// accepted the image; on unverified input the behavior is unspecified
/// (though still memory-safe).
pub fn run_unchecked(image: &Image, rt: &mut Runtime) -> Result<(), RuntimeError> {
    Interp::<false>::new(image, rt).run()
}

/// Store references produced by LDA are plain words. A stack slot is its
/// index; a captured cell sets the high tag bit and packs the closure's
/// arena slot with the capture index.
const CAPTURED_REF_TAG: Word = 0x8000_0000;

struct Interp<'a, const CHECKED: bool> {
    image: &'a Image,
    rt: &'a mut Runtime,
    stack: OperandStack<CHECKED>,
    /// Set across a CALLC so the matching END also drops the closure word.
    in_closure: bool,
}

impl<'a, const CHECKED: bool> Interp<'a, CHECKED> {
    fn new(image: &'a Image, rt: &'a mut Runtime) -> Self {
        Self {
            image,
            rt,
            stack: OperandStack::new(),
            in_closure: false,
        }
    }

    fn run(&mut self) -> Result<(), RuntimeError> {
        let Some(mut ip) = self.image.entry_offset() else {
            return Ok(());
        };
        loop {
            let decoded = decode(self.image, ip)?;
            match self.step(ip, decoded)? {
                Some(next) => ip = next,
                None => return Ok(()),
            }
        }
    }

    /// Execute one decoded instruction; `offset` is where it was decoded.
    /// Returns the next instruction offset, or `None` to halt.
    fn step(&mut self, offset: usize, decoded: Decoded) -> Result<Option<usize>, RuntimeError> {
        let next_ip = decoded.next_ip;
        match decoded.instr {
            Instr::Binop(op) => {
                let r = unbox_int(self.stack.pop()?);
                let l = unbox_int(self.stack.pop()?);
                self.stack.push(box_int(eval_binop(op, l, r, offset)?))?;
            }
            Instr::Const(v) => self.stack.push(box_int(v))?,
            Instr::Str(bytes) => {
                let roots = self.stack.roots();
                let w = self.rt.bstring(bytes, roots);
                self.stack.push(w)?;
            }
            Instr::Sexp { tag, n } => {
                let w = runtime::bsexp(self.rt, &mut self.stack, n, tag)?;
                self.stack.push(w)?;
            }
            Instr::Sti => {
                let value = self.stack.pop()?;
                let reference = self.stack.pop()?;
                self.write_through(reference, value)?;
                self.stack.push(value)?;
            }
            Instr::Sta => {
                let value = self.stack.pop()?;
                let index = self.stack.pop()?;
                let container = self.stack.pop()?;
                let w = self.rt.bsta(value, index, container)?;
                self.stack.push(w)?;
            }
            Instr::Jmp(target) => return Ok(Some(self.jump_target(offset, target)?)),
            Instr::EndRet { .. } => return self.do_return(),
            Instr::Drop => {
                self.stack.pop()?;
            }
            Instr::Dup => {
                let v = self.stack.peek()?;
                self.stack.push(v)?;
            }
            Instr::Swap => {
                let fst = self.stack.pop()?;
                let snd = self.stack.pop()?;
                self.stack.push(fst)?;
                self.stack.push(snd)?;
            }
            Instr::Elem => {
                let index = self.stack.pop()?;
                let container = self.stack.pop()?;
                let w = self.rt.belem(container, index)?;
                self.stack.push(w)?;
            }
            Instr::Ld(loc, index) => {
                let v = self.read_loc(loc, index)?;
                self.stack.push(v)?;
            }
            Instr::Lda(loc, index) => {
                let r = self.loc_ref(loc, index)?;
                self.stack.push(r)?;
                self.stack.push(r)?;
            }
            Instr::St(loc, index) => {
                let v = self.stack.peek()?;
                self.write_loc(loc, index, v)?;
            }
            Instr::Cjmp { negated, target } => {
                let v = unbox_int(self.stack.pop()?);
                if (v == 0) != negated {
                    return Ok(Some(self.jump_target(offset, target)?));
                }
            }
            Instr::Begin {
                is_closure: _,
                n_args,
                n_locals,
            } => self.do_begin(n_args, n_locals)?,
            Instr::Closure { entry, captures } => {
                if CHECKED && !is_begin(self.image, entry) {
                    return Err(RuntimeError::ClosureTargetNotBegin {
                        offset,
                        target: entry,
                    });
                }
                for (kind, index) in captures.iter() {
                    let loc = Loc::from_kind(kind)
                        .ok_or(RuntimeError::BadCaptureKind { offset, kind })?;
                    let v = self.read_loc(loc, index)?;
                    self.stack.push(v)?;
                }
                let w = runtime::bclosure(
                    self.rt,
                    &mut self.stack,
                    captures.len() as i32,
                    entry as u32,
                )?;
                self.stack.push(w)?;
            }
            Instr::Callc { n_args } => {
                let n = usize::try_from(n_args)
                    .map_err(|_| RuntimeError::NegativeCount(n_args))?;
                let closure = self.stack.get(self.stack.top + 1 + n);
                let entry = self.rt.heap.closure_entry(closure)?;
                self.stack.push(next_ip as Word)?;
                self.in_closure = true;
                return Ok(Some(entry as usize));
            }
            Instr::Call { entry, n_args: _ } => {
                if CHECKED && !is_begin(self.image, entry) {
                    return Err(RuntimeError::CallTargetNotBegin {
                        offset,
                        target: entry,
                    });
                }
                self.stack.push(next_ip as Word)?;
                return Ok(Some(entry as usize));
            }
            Instr::Tag { name, n } => {
                let w = self.stack.pop()?;
                let hash = tag_hash(name)?;
                let result = self.rt.btag(w, hash, n)?;
                self.stack.push(result)?;
            }
            Instr::Array(size) => {
                let w = self.stack.pop()?;
                let result = self.rt.barray_patt(w, size)?;
                self.stack.push(result)?;
            }
            Instr::Failure(a, b) => return Err(RuntimeError::Failure(a, b)),
            Instr::Line(_) => {}
            Instr::Patt(p) => self.do_patt(p)?,
            Instr::CallRead => {
                let v = self.rt.lread()?;
                self.stack.push(v)?;
            }
            Instr::CallWrite => {
                let v = unbox_int(self.stack.pop()?);
                self.rt.lwrite(v)?;
                self.stack.push(box_int(0))?;
            }
            Instr::CallLength => {
                let w = self.stack.pop()?;
                let result = self.rt.llength(w)?;
                self.stack.push(result)?;
            }
            Instr::CallString => {
                let w = self.stack.pop()?;
                let roots = self.stack.roots();
                let result = self.rt.lstring(w, roots)?;
                self.stack.push(result)?;
            }
            Instr::CallBarray(n) => {
                let w = runtime::barray(self.rt, &mut self.stack, n)?;
                self.stack.push(w)?;
            }
            Instr::Stop => return Ok(None),
        }
        Ok(Some(next_ip))
    }

    /// Function prologue. The low 16 bits of `n_args` are the argument
    /// count; the high 16 bits carry the verifier's stack reservation.
    /// The reservation test runs in both modes: recursion depth is not
    /// provable statically.
    fn do_begin(&mut self, n_args: i32, n_locals: i32) -> Result<(), RuntimeError> {
        let real_args = (n_args & 0xFFFF) as usize;
        let required = ((n_args as u32) >> 16) as usize;
        let n_locals =
            usize::try_from(n_locals).map_err(|_| RuntimeError::NegativeCount(n_locals))?;
        if !self.stack.has_at_least(real_args + n_locals + 4 + required) {
            return Err(RuntimeError::StackOverflow);
        }
        let saved_n_args = box_int(self.stack.n_args as i32);
        let saved_bp = self.stack.base_pointer as Word;
        self.stack.push(saved_n_args)?;
        self.stack.push(saved_bp)?;
        self.stack.n_args = real_args as u32;
        self.stack.base_pointer = self.stack.top + 1;
        // Reserve the locals plus one slot, zero-filled so uninitialized
        // reads are inert for the collector.
        let reserve = n_locals + 1;
        self.stack.top -= reserve;
        for slot in self.stack.top + 1..=self.stack.top + reserve {
            self.stack.set(slot, 0);
        }
        Ok(())
    }

    /// END/RET. Unwinds the current frame, or halts at the top level.
    fn do_return(&mut self) -> Result<Option<usize>, RuntimeError> {
        if self.stack.base_pointer == STACK_BEGIN - 1 {
            // Top-level frame: nothing to return to.
            self.in_closure = false;
            return Ok(None);
        }
        let ret_value = self.stack.pop()?;
        let callee_n_args = self.stack.n_args as usize;
        self.stack.top = self.stack.base_pointer - 1;
        self.stack.base_pointer = self.stack.pop()? as usize;
        self.stack.n_args = unbox_int(self.stack.pop()?) as u32;
        let ret_ip = self.stack.pop()?;
        // Drop the arguments that sat above the saved frame link.
        self.stack.top += callee_n_args;
        if self.in_closure {
            self.stack.pop()?;
        }
        self.stack.push(ret_value)?;
        self.in_closure = false;
        Ok(Some(ret_ip as usize))
    }

    fn do_patt(&mut self, p: Patt) -> Result<(), RuntimeError> {
        let result = match p {
            Patt::StrEq => {
                let x = self.stack.pop()?;
                let y = self.stack.pop()?;
                self.rt.bstring_patt(x, y)?
            }
            _ => {
                let w = self.stack.pop()?;
                match p {
                    Patt::String => self.rt.bstring_tag_patt(w),
                    Patt::Array => self.rt.barray_tag_patt(w),
                    Patt::Sexp => self.rt.bsexp_tag_patt(w),
                    Patt::Boxed => self.rt.bboxed_patt(w),
                    Patt::Unboxed => self.rt.bunboxed_patt(w),
                    Patt::Closure => self.rt.bclosure_tag_patt(w),
                    Patt::StrEq => unreachable!(),
                }
            }
        };
        self.stack.push(result)
    }

    fn jump_target(&self, offset: usize, target: i32) -> Result<usize, RuntimeError> {
        if CHECKED && (target < 0 || target as usize >= self.image.code().len()) {
            return Err(RuntimeError::JumpOutOfCode { offset, target });
        }
        Ok(target as usize)
    }

    /// Slot of global `index`. Globals sit just above `STACK_BEGIN`.
    fn global_slot(&self, index: i32) -> Result<usize, RuntimeError> {
        if CHECKED && !(0..N_GLOBAL as i32).contains(&index) {
            return Err(RuntimeError::GlobalOutOfBounds { index });
        }
        Ok(STACK_BEGIN + 1 + index as usize)
    }

    /// The closure word of the current activation, stored just above the
    /// arguments.
    fn current_closure(&self) -> Word {
        self.stack
            .get(self.stack.base_pointer + 2 + self.stack.n_args as usize + 1)
    }

    /// Resolve a location kind to its value.
    fn read_loc(&self, loc: Loc, index: i32) -> Result<Word, RuntimeError> {
        match loc {
            Loc::Global => Ok(self.stack.get(self.global_slot(index)?)),
            Loc::Local => Ok(self
                .stack
                .get(self.stack.base_pointer - 1 - index as usize)),
            Loc::Arg => Ok(self.stack.get(
                self.stack.base_pointer + 2 + self.stack.n_args as usize - index as usize,
            )),
            Loc::Captured => self.rt.heap.closure_captured(self.current_closure(), index),
        }
    }

    /// Resolve a location kind and overwrite its value.
    fn write_loc(&mut self, loc: Loc, index: i32, value: Word) -> Result<(), RuntimeError> {
        match loc {
            Loc::Global => {
                let slot = self.global_slot(index)?;
                self.stack.set(slot, value);
            }
            Loc::Local => {
                let slot = self.stack.base_pointer - 1 - index as usize;
                self.stack.set(slot, value);
            }
            Loc::Arg => {
                let slot =
                    self.stack.base_pointer + 2 + self.stack.n_args as usize - index as usize;
                self.stack.set(slot, value);
            }
            Loc::Captured => {
                let closure = self.current_closure();
                self.rt.heap.set_closure_captured(closure, index, value)?;
            }
        }
        Ok(())
    }

    /// Resolve a location kind to a store-reference word (for LDA).
    fn loc_ref(&self, loc: Loc, index: i32) -> Result<Word, RuntimeError> {
        match loc {
            Loc::Global => Ok(self.global_slot(index)? as Word),
            Loc::Local => Ok((self.stack.base_pointer - 1 - index as usize) as Word),
            Loc::Arg => Ok(
                (self.stack.base_pointer + 2 + self.stack.n_args as usize - index as usize)
                    as Word,
            ),
            Loc::Captured => {
                // The packed encoding carries eight bits of capture index.
                if CHECKED && !(0..=0xFF).contains(&index) {
                    return Err(RuntimeError::IndexOutOfBounds { index, len: 0x100 });
                }
                let closure = self.current_closure();
                Ok(CAPTURED_REF_TAG | ((closure >> 1) << 8) | (index as Word & 0xFF))
            }
        }
    }

    /// Store through a reference word popped off the stack (STI).
    fn write_through(&mut self, reference: Word, value: Word) -> Result<(), RuntimeError> {
        if reference & CAPTURED_REF_TAG != 0 {
            let closure = ((reference & !CAPTURED_REF_TAG) >> 8) << 1;
            let index = (reference & 0xFF) as i32;
            self.rt.heap.set_closure_captured(closure, index, value)
        } else {
            let slot = reference as usize;
            if CHECKED && slot >= STACK_SIZE {
                return Err(RuntimeError::InvalidStoreRef { word: reference });
            }
            self.stack.set(slot, value);
            Ok(())
        }
    }
}

fn eval_binop(op: Binop, l: i32, r: i32, offset: usize) -> Result<i32, RuntimeError> {
    Ok(match op {
        Binop::Add => l.wrapping_add(r),
        Binop::Sub => l.wrapping_sub(r),
        Binop::Mul => l.wrapping_mul(r),
        Binop::Div => {
            if r == 0 {
                return Err(RuntimeError::DivisionByZero { offset });
            }
            l.wrapping_div(r)
        }
        Binop::Mod => {
            if r == 0 {
                return Err(RuntimeError::DivisionByZero { offset });
            }
            l.wrapping_rem(r)
        }
        Binop::Lt => (l < r) as i32,
        Binop::Le => (l <= r) as i32,
        Binop::Gt => (l > r) as i32,
        Binop::Ge => (l >= r) as i32,
        Binop::Eq => (l == r) as i32,
        Binop::Ne => (l != r) as i32,
        Binop::And => (l != 0 && r != 0) as i32,
        Binop::Or => (l != 0 || r != 0) as i32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Binop::Add, 3, 4, 7)]
    #[case(Binop::Sub, 3, 4, -1)]
    #[case(Binop::Mul, 3, 4, 12)]
    #[case(Binop::Div, 9, 2, 4)]
    #[case(Binop::Mod, 9, 2, 1)]
    #[case(Binop::Lt, 3, 4, 1)]
    #[case(Binop::Ge, 3, 4, 0)]
    #[case(Binop::Eq, 4, 4, 1)]
    #[case(Binop::Ne, 4, 4, 0)]
    #[case(Binop::And, 2, 0, 0)]
    #[case(Binop::Or, 2, 0, 1)]
    fn test_eval_binop(#[case] op: Binop, #[case] l: i32, #[case] r: i32, #[case] expected: i32) {
        assert_eq!(eval_binop(op, l, r, 0).unwrap(), expected);
    }

    #[test]
    fn test_division_by_zero_is_reported() {
        assert!(matches!(
            eval_binop(Binop::Div, 1, 0, 5),
            Err(RuntimeError::DivisionByZero { offset: 5 })
        ));
        assert!(matches!(
            eval_binop(Binop::Mod, 1, 0, 5),
            Err(RuntimeError::DivisionByZero { offset: 5 })
        ));
    }
}
