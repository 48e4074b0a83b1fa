//! End-to-end tests: assemble → verify → load → emulate, plus the
//! assembler/disassembler round-trip properties.

use std::cell::RefCell;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::rc::Rc;

use crate::assembler::assemble_reader;
use crate::core::Core;
use crate::disasm::disassemble;
use crate::isa::{
    self, op, Interrupt, Sdt, INIT_PC_VAL, IO_STDOUT_ADDR,
};
use crate::mem::Mem;
use crate::stub;

/// Write half of a captured stdout.
#[derive(Clone, Default)]
pub(crate) struct SharedBuf(pub Rc<RefCell<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn assemble(src: &str) -> Cursor<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    assemble_reader(src.as_bytes(), None, &mut out, 4).unwrap();
    out
}

fn first_section_bytes(stub_file: &mut Cursor<Vec<u8>>) -> Vec<u8> {
    let sec = stub::load_section(stub_file, 0).unwrap();
    let mut bytes = vec![0u8; sec.size as usize];
    stub_file.read_exact(&mut bytes).unwrap();
    bytes
}

struct Run {
    core: Core,
    mem: Mem,
    result: Interrupt,
    stdout: SharedBuf,
}

// Loads the stub and steps to the first interrupt (with a safety cap).
fn emulate(stub_file: &mut Cursor<Vec<u8>>, stdin: &[u8]) -> Run {
    let stdout = SharedBuf::default();
    let mut mem = Mem::with_io(
        Box::new(Cursor::new(stdin.to_vec())),
        Box::new(stdout.clone()),
    );
    let mut core = Core::new();
    core.load_stub(&mut mem, stub_file).unwrap();

    let mut result = Interrupt::None;
    for _ in 0..10_000 {
        match core.step(&mut mem) {
            Ok(()) => {}
            Err(int) => {
                result = int;
                break;
            }
        }
    }
    Run {
        core,
        mem,
        result,
        stdout,
    }
}

#[test]
fn scenario_push_halt() {
    let mut stub_file = assemble("push8 0x2a\nhalt\n");
    stub::verify(&mut stub_file).unwrap();
    assert_eq!(
        first_section_bytes(&mut stub_file),
        vec![op::PUSH8AS8, 0x2a, op::HALT]
    );

    let mut run = emulate(&mut stub_file, b"");
    assert_eq!(run.result, Interrupt::Halt);
    let initial_sp = Core::new().sp;
    assert_eq!(run.core.sp, initial_sp - 1);
    assert_eq!(run.mem.read8(run.core.sp).unwrap(), 0x2a);
}

#[test]
fn scenario_add() {
    let mut stub_file = assemble("push64 1\npush64 2\nadd64\nhalt\n");
    let mut run = emulate(&mut stub_file, b"");
    assert_eq!(run.result, Interrupt::Halt);
    assert_eq!(run.mem.read64(run.core.sp).unwrap(), 3);
}

#[test]
fn scenario_div_by_zero() {
    let mut stub_file = assemble("push64 6\npush64 0\ndivu64\n");
    let run = emulate(&mut stub_file, b"");
    assert_eq!(run.result, Interrupt::DivByZero);
}

#[test]
fn scenario_stdout_newline() {
    let src = "push8 '\\n'\npush64 0xFFFFFFFFFFF00000\nstorepop8\nhalt\n";
    let mut stub_file = assemble(src);
    let run = emulate(&mut stub_file, b"");
    assert_eq!(run.result, Interrupt::Halt);
    assert_eq!(*run.stdout.0.borrow(), b"\n");
}

#[test]
fn scenario_hand_built_stub_steps_nop() {
    let mut file = Cursor::new(Vec::new());
    stub::init(&mut file, 1).unwrap();
    file.write_all(&[op::NOP]).unwrap();
    let mut sec = stub::Section::new(0x1000, 0, 0);
    stub::save_section(&mut file, 0, &mut sec).unwrap();
    stub::verify(&mut file).unwrap();

    let mut mem =
        Mem::with_io(Box::new(std::io::empty()), Box::new(std::io::sink()));
    let mut core = Core::new();
    core.load_stub(&mut mem, &mut file).unwrap();
    assert_eq!(core.pc, 0x1000);
    core.step(&mut mem).unwrap();
    assert_eq!(core.pc, 0x1001);
}

#[test]
fn scenario_self_referential_rjmp() {
    let mut stub_file = assemble(".section 0x1000\n:loop\nrjmpi8 loop\n");
    assert_eq!(
        first_section_bytes(&mut stub_file),
        vec![op::RJMPI8, 0xff]
    );
}

#[test]
fn nop_listing_round_trips() {
    let src = "nop\nnop\nnop\n";
    let mut stub_file = assemble(src);
    let mut listing = Vec::new();
    disassemble(&mut stub_file, &mut listing).unwrap();
    assert_eq!(
        String::from_utf8(listing).unwrap(),
        format!(".section {INIT_PC_VAL:#x}\nnop\nnop\nnop\n")
    );
}

#[test]
fn every_opcode_assembles_and_encodes_little_endian() {
    for code in 0..=0xffu8 {
        let Some(name) = isa::name_for_opcode(code) else {
            continue;
        };
        let sdt = isa::imm_type_for_opcode(code).unwrap();
        let src = if sdt == Sdt::Void {
            format!("{name}\n")
        } else {
            format!("{name} 1\n")
        };

        let mut stub_file = assemble(&src);
        let bytes = first_section_bytes(&mut stub_file);
        assert_eq!(bytes.len(), 1 + sdt.size(), "{name}");
        assert_eq!(bytes[0], code, "{name}");
        if sdt != Sdt::Void {
            let mut imm = [0u8; 8];
            imm[..sdt.size()].copy_from_slice(&bytes[1..]);
            assert_eq!(u64::from_le_bytes(imm), 1, "{name}");
        }
    }
}

#[test]
fn every_opcode_listing_round_trips() {
    // Assemble one of everything, disassemble, reassemble, and expect the
    // same section bytes.
    let mut src = String::from(".section 0x1000\n");
    for code in 0..=0xffu8 {
        let Some(name) = isa::name_for_opcode(code) else {
            continue;
        };
        let sdt = isa::imm_type_for_opcode(code).unwrap();
        if sdt == Sdt::Void {
            src.push_str(&format!("{name}\n"));
        } else {
            src.push_str(&format!("{name} 0x7f\n"));
        }
    }

    let mut stub_file = assemble(&src);
    let original = first_section_bytes(&mut stub_file);
    let mut listing = Vec::new();
    disassemble(&mut stub_file, &mut listing).unwrap();

    let mut again = Cursor::new(Vec::new());
    assemble_reader(listing.as_slice(), None, &mut again, 4).unwrap();
    assert_eq!(first_section_bytes(&mut again), original);
}

#[test]
fn forward_call_through_label() {
    let src = "\
.section 0x1000
call done
push8 0x2a
halt
:done
ret
";
    let mut stub_file = assemble(src);
    let mut run = emulate(&mut stub_file, b"");
    assert_eq!(run.result, Interrupt::Halt);
    // The callee returned past the call, then the push ran
    assert_eq!(run.core.pc, 0x100b);
    assert_eq!(run.core.sp, Core::new().sp - 1);
    assert_eq!(run.mem.read8(run.core.sp).unwrap(), 0x2a);
}

#[test]
fn countdown_loop_prints_digits() {
    // Print '3' '2' '1' using a rbrz loop
    let src = "\
.define COUNT 3
push8 $COUNT
:again
dup8
push8 '0'
add8
push64 $IO_STDOUT_ADDR
storepop8
pop8
push8 1
sub8
dup8
rbrz8i8 again
halt
";
    let mut stub_file = assemble(src);
    let run = emulate(&mut stub_file, b"");
    assert_eq!(run.result, Interrupt::Halt);
    assert_eq!(*run.stdout.0.borrow(), b"321");
}

#[test]
fn stdin_echo() {
    let src = "\
push64 $IO_STDIN_ADDR
loadpop8
push64 $IO_STDOUT_ADDR
storepop8
halt
";
    let mut stub_file = assemble(src);
    let run = emulate(&mut stub_file, b"Q");
    assert_eq!(run.result, Interrupt::Halt);
    assert_eq!(*run.stdout.0.borrow(), b"Q");
}

#[test]
fn stack_section_relocates_the_stack() {
    let src = "\
.section 0x8000 2
.section 0x1000
push8 7
halt
";
    let mut stub_file = assemble(src);
    let mut mem =
        Mem::with_io(Box::new(std::io::empty()), Box::new(std::io::sink()));
    let mut core = Core::new();
    core.load_stub(&mut mem, &mut stub_file).unwrap();
    assert_eq!(core.pc, 0x8000); // first section's address
    assert_eq!(core.sp, 0x8000);
    assert_eq!(core.sbp, 0x8000);
}

#[test]
fn data_section_loads_into_memory() {
    let src = "\
.define DATA 0x2000
.section 0x1000
push64 $DATA
loadpop64
halt
.section 0x2000 1
.data64 0x1122334455667788
";
    let mut stub_file = assemble(src);
    stub::verify(&mut stub_file).unwrap();
    let mut run = emulate(&mut stub_file, b"");
    assert_eq!(run.result, Interrupt::Halt);
    assert_eq!(
        run.mem.read64(run.core.sp).unwrap(),
        0x1122_3344_5566_7788
    );
}

#[test]
fn include_pulls_definitions_and_code() {
    // Includes need real files; build a tiny tree under the target tmpdir.
    let dir = std::env::temp_dir().join(format!(
        "starch-include-test-{}",
        std::process::id()
    ));
    std::fs::create_dir_all(&dir).unwrap();
    let lib = dir.join("lib.st");
    let main = dir.join("main.st");
    std::fs::write(&lib, ".define ANSWER 0x2a\n").unwrap();
    std::fs::write(
        &main,
        ".include \"lib.st\"\npush8 $ANSWER\nhalt\n",
    )
    .unwrap();

    let mut out = Cursor::new(Vec::new());
    crate::assembler::assemble(Some(&main), &mut out, 4).unwrap();
    assert_eq!(
        first_section_bytes(&mut out),
        vec![op::PUSH8AS8, 0x2a, op::HALT]
    );

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn stdout_symbol_sign_compresses() {
    // 0xfffffffffff00000 fits a sign-extended 32-bit immediate
    let mut stub_file = assemble("push64 $IO_STDOUT_ADDR\nhalt\n");
    let bytes = first_section_bytes(&mut stub_file);
    assert_eq!(bytes[0], op::PUSH32ASI64);
    assert_eq!(&bytes[1..5], &(IO_STDOUT_ADDR as u32).to_le_bytes());
}

#[test]
fn listing_round_trips_through_control_flow() {
    // Disassembling and reassembling a program with control flow must
    // produce a byte-identical stub.
    let src = "\
.section 0x1000
push8 5
:loop
push8 1
sub8
dup8
rbrz8i8 loop
halt
";
    let mut first = assemble(src);
    let mut listing = Vec::new();
    disassemble(&mut first, &mut listing).unwrap();
    let mut second = Cursor::new(Vec::new());
    assemble_reader(listing.as_slice(), None, &mut second, 4).unwrap();

    first.seek(SeekFrom::Start(0)).unwrap();
    second.seek(SeekFrom::Start(0)).unwrap();
    assert_eq!(
        first_section_bytes(&mut first),
        first_section_bytes(&mut second)
    );
}
