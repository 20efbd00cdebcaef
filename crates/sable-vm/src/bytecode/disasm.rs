//! Bytecode disassembler
//!
//! Renders the code section as one instruction per line:
//!
//! ```text
//! 0x00000000  BEGIN	2 0
//! 0x00000009  CONST	5
//! 0x0000000e  CALL	0x00000014 1
//! ```
//!
//! The walk is linear from offset zero; on a decode failure the offending
//! offset is reported and the walk stops, since operand boundaries are no
//! longer known.

use std::fmt::Write;

use crate::bytecode::decode::{decode, Instr};
use crate::bytecode::image::Image;

/// Disassemble the whole code section.
pub fn disassemble(image: &Image) -> String {
    let mut output = String::new();
    let mut ip = 0;
    while ip < image.code().len() {
        match decode(image, ip) {
            Ok(decoded) => {
                writeln!(output, "{:#010x}  {}", ip, format_instr(&decoded.instr)).unwrap();
                ip = decoded.next_ip;
            }
            Err(e) => {
                writeln!(output, "{:#010x}  <{}>", ip, e).unwrap();
                break;
            }
        }
    }
    output
}

fn format_instr(instr: &Instr) -> String {
    match *instr {
        Instr::Binop(op) => format!("BINOP\t{}", op.symbol()),
        Instr::Const(v) => format!("CONST\t{}", v),
        Instr::Str(s) => format!("STRING\t{}", String::from_utf8_lossy(s)),
        Instr::Sexp { tag, n } => format!("SEXP\t{} {}", String::from_utf8_lossy(tag), n),
        Instr::Sti => "STI".to_string(),
        Instr::Sta => "STA".to_string(),
        Instr::Jmp(target) => format!("JMP\t{:#010x}", target),
        Instr::EndRet { is_ret: false } => "END".to_string(),
        Instr::EndRet { is_ret: true } => "RET".to_string(),
        Instr::Drop => "DROP".to_string(),
        Instr::Dup => "DUP".to_string(),
        Instr::Swap => "SWAP".to_string(),
        Instr::Elem => "ELEM".to_string(),
        Instr::Ld(loc, i) => format!("LD\t{}({})", loc.letter(), i),
        Instr::Lda(loc, i) => format!("LDA\t{}({})", loc.letter(), i),
        Instr::St(loc, i) => format!("ST\t{}({})", loc.letter(), i),
        Instr::Cjmp { negated: false, target } => format!("CJMPz\t{:#010x}", target),
        Instr::Cjmp { negated: true, target } => format!("CJMPnz\t{:#010x}", target),
        Instr::Begin {
            is_closure,
            n_args,
            n_locals,
        } => {
            let prefix = if is_closure { "CBEGIN" } else { "BEGIN" };
            // Strip a verifier-patched reservation for readability.
            format!("{}\t{} {}", prefix, n_args & 0xFFFF, n_locals)
        }
        Instr::Closure { entry, captures } => {
            let mut line = format!("CLOSURE\t{:#010x}", entry);
            for (kind, index) in captures.iter() {
                let letter = crate::bytecode::decode::Loc::from_kind(kind)
                    .map_or('?', |l| l.letter());
                write!(line, " {}({})", letter, index).unwrap();
            }
            line
        }
        Instr::Callc { n_args } => format!("CALLC\t{}", n_args),
        Instr::Call { entry, n_args } => format!("CALL\t{:#010x} {}", entry, n_args),
        Instr::Tag { name, n } => format!("TAG\t{} {}", String::from_utf8_lossy(name), n),
        Instr::Array(size) => format!("ARRAY\t{}", size),
        Instr::Failure(a, b) => format!("FAIL\t{} {}", a, b),
        Instr::Line(line) => format!("LINE\t{}", line),
        Instr::Patt(p) => format!("PATT\t{}", p.symbol()),
        Instr::CallRead => "CALL\tLread".to_string(),
        Instr::CallWrite => "CALL\tLwrite".to_string(),
        Instr::CallLength => "CALL\tLlength".to_string(),
        Instr::CallString => "CALL\tLstring".to_string(),
        Instr::CallBarray(n) => format!("CALL\tBarray\t{}", n),
        Instr::Stop => "<end>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(code: &[u8]) -> Image {
        let strings = b"main\0";
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(strings.len() as i32).to_le_bytes());
        bytes.extend_from_slice(&0i32.to_le_bytes());
        bytes.extend_from_slice(&0i32.to_le_bytes());
        bytes.extend_from_slice(strings);
        bytes.extend_from_slice(code);
        Image::from_bytes(bytes).unwrap()
    }

    #[test]
    fn test_disassembles_a_straight_line() {
        let mut code = vec![0x10];
        code.extend_from_slice(&5i32.to_le_bytes());
        code.push(0x01); // BINOP +
        code.push(0xF0);
        let text = disassemble(&image(&code));
        assert!(text.contains("CONST\t5"), "{text}");
        assert!(text.contains("BINOP\t+"), "{text}");
        assert!(text.contains("<end>"), "{text}");
    }

    #[test]
    fn test_reports_invalid_opcode_and_stops() {
        let text = disassemble(&image(&[0xEE, 0xF0]));
        assert!(text.contains("invalid opcode"), "{text}");
        assert!(!text.contains("<end>"), "{text}");
    }
}
