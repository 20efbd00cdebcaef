//! Verifier behavior: accepted programs, rejected programs, and the
//! prologue reservation patch.

mod common;

use common::{ImageBuilder, run_ok, ARG, GLOBAL};
use pretty_assertions::assert_eq;
use sable_vm::{verify, ValidationErrorKind};

#[test]
fn test_accepts_straight_line_program() {
    let mut b = ImageBuilder::new();
    b.public("main", 0);
    b.const_(3);
    b.const_(4);
    b.binop("+");
    b.lwrite();
    b.stop();
    let mut image = b.image();
    verify(&mut image).unwrap();
}

#[test]
fn test_accepts_diamond_with_matching_depths() {
    let mut b = ImageBuilder::new();
    b.public("main", 0);
    let taken = b.label();
    let join = b.label();
    b.const_(0);
    b.cjmpz(taken);
    b.const_(1);
    b.jmp(join);
    b.bind(taken);
    b.const_(2);
    b.bind(join);
    b.lwrite();
    b.stop();
    let mut image = b.image();
    verify(&mut image).unwrap();
}

#[test]
fn test_rejects_depth_mismatch_at_join() {
    // One inbound path carries one word, the other two.
    let mut b = ImageBuilder::new();
    b.public("main", 0);
    let join = b.label();
    b.const_(0);
    b.cjmpz(join);
    b.const_(1);
    b.const_(2);
    b.jmp(join);
    b.bind(join);
    b.stop();
    let mut image = b.image();
    let err = verify(&mut image).unwrap_err();
    assert!(
        matches!(err.kind, ValidationErrorKind::DepthMismatch { .. }),
        "unexpected error: {err}"
    );
}

#[test]
fn test_rejects_jump_out_of_code() {
    let mut b = ImageBuilder::new();
    b.public("main", 0);
    b.jmp_raw(9999);
    b.stop();
    let mut image = b.image();
    let err = verify(&mut image).unwrap_err();
    assert_eq!(err.kind, ValidationErrorKind::JumpOutOfCode { target: 9999 });
    assert!(err.to_string().contains("trying to jump out of the code area"));
}

#[test]
fn test_rejects_cjmp_falling_off_the_code_end() {
    // Both the target and the fallthrough sit at end-of-code.
    let mut b = ImageBuilder::new();
    b.public("main", 0);
    b.const_(0);
    let end = b.here() + 5;
    b.cjmpz_raw(end);
    let mut image = b.image();
    assert!(verify(&mut image).is_err());
}

#[test]
fn test_rejects_underflow() {
    let mut b = ImageBuilder::new();
    b.public("main", 0);
    b.binop("+"); // nothing on the abstract stack
    b.stop();
    let mut image = b.image();
    let err = verify(&mut image).unwrap_err();
    assert_eq!(
        err.kind,
        ValidationErrorKind::StackUnderflow { required: 2, depth: 0 }
    );
}

#[test]
fn test_rejects_call_to_non_begin() {
    let mut b = ImageBuilder::new();
    b.public("main", 0);
    b.call_raw(6, 0);
    b.const_(0);
    b.stop();
    let mut image = b.image();
    let err = verify(&mut image).unwrap_err();
    assert!(matches!(
        err.kind,
        ValidationErrorKind::CallTargetNotBegin { target: 6 }
    ));
}

#[test]
fn test_rejects_out_of_bounds_global() {
    let mut b = ImageBuilder::new();
    b.public("main", 0);
    b.ld(GLOBAL, 5000);
    b.drop_();
    b.stop();
    let mut image = b.image();
    let err = verify(&mut image).unwrap_err();
    assert_eq!(
        err.kind,
        ValidationErrorKind::GlobalOutOfBounds { index: 5000 }
    );
}

#[test]
fn test_rejects_invalid_opcode_on_a_reachable_path() {
    let mut b = ImageBuilder::new();
    b.public("main", 0);
    b.op(0xEE);
    b.stop();
    let mut image = b.image();
    let err = verify(&mut image).unwrap_err();
    assert!(matches!(err.kind, ValidationErrorKind::Decode(_)));
}

#[test]
fn test_patches_begin_with_computed_max_depth() {
    // f pushes three words at its deepest (two args of '-' plus one CONST).
    let mut b = ImageBuilder::new();
    b.public("main", 0);
    let f = b.label();
    b.const_(5);
    b.call(f, 1);
    b.lwrite();
    b.stop();
    let entry = b.here();
    b.bind(f);
    b.begin(1, 0);
    b.ld(ARG, 0);
    b.const_(1);
    b.const_(2);
    b.binop("+");
    b.binop("-");
    b.end();
    let mut image = b.image();
    verify(&mut image).unwrap();
    let operand = i32::from_le_bytes(
        image.code()[entry as usize + 1..entry as usize + 5]
            .try_into()
            .unwrap(),
    );
    assert_eq!(operand & 0xFFFF, 1, "argument count survives the patch");
    assert_eq!((operand >> 16) & 0xFFFF, 3, "reservation is the max depth");
}

#[test]
fn test_patched_program_still_runs() {
    let mut b = ImageBuilder::new();
    b.public("main", 0);
    let f = b.label();
    b.const_(5);
    b.call(f, 1);
    b.lwrite();
    b.stop();
    b.bind(f);
    b.begin(1, 0);
    b.ld(ARG, 0);
    b.const_(2);
    b.binop("*");
    b.end();
    let mut image = b.image();
    verify(&mut image).unwrap();
    assert_eq!(run_ok(&image, ""), "10\n");
}

#[test]
fn test_rejects_function_deeper_than_the_reservation_field() {
    let mut b = ImageBuilder::new();
    b.public("main", 0);
    b.begin(2, 0);
    for _ in 0..0x10010 {
        b.const_(0);
    }
    b.end();
    let mut image = b.image();
    let err = verify(&mut image).unwrap_err();
    assert!(matches!(
        err.kind,
        ValidationErrorKind::ReservationOverflow { .. }
    ));
}

#[test]
fn test_rejects_bad_closure_capture_kind() {
    let mut b = ImageBuilder::new();
    b.public("main", 0);
    let body = b.label();
    let over = b.label();
    b.jmp(over);
    b.bind(body);
    b.cbegin(0, 0);
    b.const_(0);
    b.end();
    b.bind(over);
    b.closure(body, &[(9, 0)]);
    b.drop_();
    b.stop();
    let mut image = b.image();
    let err = verify(&mut image).unwrap_err();
    assert_eq!(err.kind, ValidationErrorKind::BadCaptureKind { kind: 9 });
}

#[test]
fn test_rejects_closure_not_pointing_at_begin() {
    let mut b = ImageBuilder::new();
    b.public("main", 0);
    let nowhere = b.label();
    b.bind(nowhere); // offset 0: the CLOSURE itself, not a BEGIN
    b.closure(nowhere, &[]);
    b.drop_();
    b.stop();
    let mut image = b.image();
    let err = verify(&mut image).unwrap_err();
    assert!(matches!(
        err.kind,
        ValidationErrorKind::ClosureTargetNotBegin { .. }
    ));
}

#[test]
fn test_loop_with_back_edge_verifies() {
    // Count down from 5; the back edge re-enters at the same depth.
    let mut b = ImageBuilder::new();
    b.public("main", 0);
    let top = b.label();
    let done = b.label();
    b.begin(2, 1);
    b.const_(5);
    b.st(common::LOCAL, 0);
    b.drop_();
    b.bind(top);
    b.ld(common::LOCAL, 0);
    b.cjmpz(done);
    b.ld(common::LOCAL, 0);
    b.const_(1);
    b.binop("-");
    b.st(common::LOCAL, 0);
    b.drop_();
    b.jmp(top);
    b.bind(done);
    b.const_(0);
    b.lwrite();
    b.end();
    let mut image = b.image();
    verify(&mut image).unwrap();
    assert_eq!(run_ok(&image, ""), "0\n");
}
