//! A Starch processor core: the register file and the fetch/decode/execute
//! step.
//!
//! [`Core::step`] executes exactly one instruction against a [`Mem`] and is
//! the emulator's single-step hook; drivers wrap it in a run loop (and may
//! impose a cycle budget). The consecutive opcode numbering within each
//! family makes the dispatch range-based: the operand width of a family
//! member is `1 << (opcode - base)`.

use std::io::{Read, Seek};

use anyhow::{anyhow, bail, Result};
use log::debug;

use crate::isa::{op, Interrupt, SectionKind};
use crate::mem::Mem;
use crate::stub;

/// Default stack base: registers start with a 1 GiB stack region.
const INIT_STACK_ADDR: u64 = 0x4000_0000;

/// The register file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Core {
    /// Program counter.
    pub pc: u64,
    /// Stack base pointer.
    pub sbp: u64,
    /// Stack frame pointer; `loadsfp`/`storesfp` offsets are signed
    /// displacements from here.
    pub sfp: u64,
    /// Stack pointer. The stack grows downward.
    pub sp: u64,
    /// Stack limit pointer; pushing below a non-zero limit faults.
    pub slp: u64,
}

impl Default for Core {
    fn default() -> Self {
        Core::new()
    }
}

fn sign_extend(val: u64, width: u64) -> i64 {
    let shift = 64 - 8 * width as u32;
    ((val << shift) as i64) >> shift
}

// Operand width of a member of a four-wide opcode family.
fn family_width(opcode: u8, base: u8) -> u64 {
    1 << (opcode - base)
}

impl Core {
    pub fn new() -> Self {
        Core {
            pc: 0,
            sbp: INIT_STACK_ADDR,
            sfp: INIT_STACK_ADDR,
            sp: INIT_STACK_ADDR,
            slp: 0,
        }
    }

    /// Loads a verified stub into memory and points the core at its entry:
    /// TEXT and DATA sections land at their addresses, a STACK section
    /// relocates the stack registers, and `pc` takes the first section's
    /// address.
    pub fn load_stub<F: Read + Seek>(
        &mut self,
        mem: &mut Mem,
        file: &mut F,
    ) -> Result<()> {
        stub::verify(file).map_err(|e| anyhow!("not a valid stub file: {e}"))?;
        let (_, nsec) = stub::section_counts(file)
            .map_err(|e| anyhow!("failed to get section counts: {e}"))?;

        for si in 0..nsec {
            let sec = stub::load_section(file, si)
                .map_err(|e| anyhow!("failed to load section {si}: {e}"))?;
            match sec.kind() {
                Some(SectionKind::Text) | Some(SectionKind::Data) => {
                    debug!(
                        "loading section {si}: {} bytes at {:#x}",
                        sec.size, sec.addr
                    );
                    mem.load_image(sec.addr, sec.size, file)?;
                }
                Some(SectionKind::Stack) => {
                    debug!(
                        "stack section {si}: base {:#x} extent {}",
                        sec.addr, sec.size
                    );
                    self.sbp = sec.addr;
                    self.sfp = sec.addr;
                    self.sp = sec.addr;
                    self.slp = sec.addr.wrapping_sub(sec.size);
                }
                None => bail!("section {si} has unknown flags {}", sec.flags),
            }
            if si == 0 {
                self.pc = sec.addr;
            }
        }
        Ok(())
    }

    // Moves sp down by `width`, faulting if a non-zero stack limit is
    // crossed, and writes `val` at the new top.
    fn push(
        &mut self,
        mem: &mut Mem,
        width: u64,
        val: u64,
    ) -> Result<(), Interrupt> {
        let new_sp = self.sp.wrapping_sub(width);
        if self.slp != 0 && new_sp < self.slp {
            return Err(Interrupt::BadStackAccess);
        }
        mem.write_w(new_sp, width, val)?;
        self.sp = new_sp;
        Ok(())
    }

    // Immediate operand of the instruction at pc.
    fn imm(&self, mem: &mut Mem, width: u64) -> Result<u64, Interrupt> {
        mem.read_w(self.pc.wrapping_add(1), width)
    }

    // Binary operation plumbing: a is the top operand, b sits below it;
    // the result replaces b and the stack shrinks by one operand. Plain
    // non-commutative ops treat b as the left-hand side (the divisor and
    // subtrahend ride on top); the reverse variants swap that.
    fn binop(
        &mut self,
        mem: &mut Mem,
        width: u64,
        f: impl FnOnce(u64, u64) -> Result<u64, Interrupt>,
    ) -> Result<(), Interrupt> {
        let a = mem.read_w(self.sp, width)?;
        let b = mem.read_w(self.sp.wrapping_add(width), width)?;
        let result = f(a, b)?;
        mem.write_w(self.sp.wrapping_add(width), width, result)?;
        self.sp = self.sp.wrapping_add(width);
        self.pc = self.pc.wrapping_add(1);
        Ok(())
    }

    // Unary operation on the top operand in place.
    fn unop(
        &mut self,
        mem: &mut Mem,
        width: u64,
        f: impl FnOnce(u64) -> u64,
    ) -> Result<(), Interrupt> {
        let a = mem.read_w(self.sp, width)?;
        mem.write_w(self.sp, width, f(a))?;
        self.pc = self.pc.wrapping_add(1);
        Ok(())
    }

    // Comparison: pops both operands, pushes a single 0/1 byte.
    fn cmpop(
        &mut self,
        mem: &mut Mem,
        width: u64,
        f: impl FnOnce(u64, u64) -> bool,
    ) -> Result<(), Interrupt> {
        let a = mem.read_w(self.sp, width)?;
        let b = mem.read_w(self.sp.wrapping_add(width), width)?;
        self.sp = self.sp.wrapping_add(2 * width);
        self.push(mem, 1, u64::from(f(a, b)))?;
        self.pc = self.pc.wrapping_add(1);
        Ok(())
    }

    // Signed binary operation over sign-extended operands.
    fn binop_i(
        &mut self,
        mem: &mut Mem,
        width: u64,
        f: impl FnOnce(i64, i64) -> Result<i64, Interrupt>,
    ) -> Result<(), Interrupt> {
        self.binop(mem, width, |a, b| {
            f(sign_extend(a, width), sign_extend(b, width)).map(|v| v as u64)
        })
    }

    /// Executes one instruction. `Ok(())` means the core can step again;
    /// `Err(Interrupt::Halt)` is orderly termination, every other interrupt
    /// is a fault.
    pub fn step(&mut self, mem: &mut Mem) -> Result<(), Interrupt> {
        let opcode = mem.read8(self.pc)?;

        match opcode {
            op::INVALID => return Err(Interrupt::BadInst),

            //
            // Push immediate operations
            //
            op::PUSH8AS8..=op::PUSH64AS64 => {
                let (src, dst, signed) = match opcode {
                    op::PUSH8AS8 => (1, 1, false),
                    op::PUSH8ASU16 => (1, 2, false),
                    op::PUSH8ASU32 => (1, 4, false),
                    op::PUSH8ASU64 => (1, 8, false),
                    op::PUSH8ASI16 => (1, 2, true),
                    op::PUSH8ASI32 => (1, 4, true),
                    op::PUSH8ASI64 => (1, 8, true),
                    op::PUSH16AS16 => (2, 2, false),
                    op::PUSH16ASU32 => (2, 4, false),
                    op::PUSH16ASU64 => (2, 8, false),
                    op::PUSH16ASI32 => (2, 4, true),
                    op::PUSH16ASI64 => (2, 8, true),
                    op::PUSH32AS32 => (4, 4, false),
                    op::PUSH32ASU64 => (4, 8, false),
                    op::PUSH32ASI64 => (4, 8, true),
                    _ => (8, 8, false),
                };
                let raw = self.imm(mem, src)?;
                let val = if signed {
                    sign_extend(raw, src) as u64
                } else {
                    raw
                };
                self.push(mem, dst, val)?;
                self.pc = self.pc.wrapping_add(1 + src);
            }

            //
            // Pop operations
            //
            op::POP8..=op::POP64 => {
                self.sp =
                    self.sp.wrapping_add(family_width(opcode, op::POP8));
                self.pc = self.pc.wrapping_add(1);
            }

            //
            // Duplication operations
            //
            op::DUP8..=op::DUP64 => {
                let w = family_width(opcode, op::DUP8);
                let val = mem.read_w(self.sp, w)?;
                self.push(mem, w, val)?;
                self.pc = self.pc.wrapping_add(1);
            }

            //
            // Setting operations
            //
            op::SET8..=op::SET64 => {
                let w = family_width(opcode, op::SET8);
                let val = mem.read_w(self.sp, w)?;
                mem.write_w(self.sp.wrapping_add(w), w, val)?;
                self.sp = self.sp.wrapping_add(w);
                self.pc = self.pc.wrapping_add(1);
            }

            //
            // Promotion operations
            //
            op::PROM8U16..=op::PROM32I64 => {
                let (src, dst, signed) = match opcode {
                    op::PROM8U16 => (1, 2, false),
                    op::PROM8U32 => (1, 4, false),
                    op::PROM8U64 => (1, 8, false),
                    op::PROM8I16 => (1, 2, true),
                    op::PROM8I32 => (1, 4, true),
                    op::PROM8I64 => (1, 8, true),
                    op::PROM16U32 => (2, 4, false),
                    op::PROM16U64 => (2, 8, false),
                    op::PROM16I32 => (2, 4, true),
                    op::PROM16I64 => (2, 8, true),
                    op::PROM32U64 => (4, 8, false),
                    _ => (4, 8, true),
                };
                let raw = mem.read_w(self.sp, src)?;
                let val = if signed {
                    sign_extend(raw, src) as u64
                } else {
                    raw
                };
                let grow = dst - src;
                let new_sp = self.sp.wrapping_sub(grow);
                if self.slp != 0 && new_sp < self.slp {
                    return Err(Interrupt::BadStackAccess);
                }
                mem.write_w(new_sp, dst, val)?;
                self.sp = new_sp;
                self.pc = self.pc.wrapping_add(1);
            }

            //
            // Demotion operations. Truncation is implicit: the low bytes
            // stay in place in little-endian memory.
            //
            op::DEM64TO16 => {
                self.sp = self.sp.wrapping_add(6);
                self.pc = self.pc.wrapping_add(1);
            }
            op::DEM64TO8 => {
                self.sp = self.sp.wrapping_add(7);
                self.pc = self.pc.wrapping_add(1);
            }
            op::DEM32TO8 => {
                self.sp = self.sp.wrapping_add(3);
                self.pc = self.pc.wrapping_add(1);
            }

            //
            // Integer arithmetic operations
            //
            op::ADD8..=op::ADD64 => {
                let w = family_width(opcode, op::ADD8);
                self.binop(mem, w, |a, b| Ok(a.wrapping_add(b)))?;
            }
            op::SUB8..=op::SUB64 => {
                let w = family_width(opcode, op::SUB8);
                self.binop(mem, w, |a, b| Ok(b.wrapping_sub(a)))?;
            }
            op::SUBR8..=op::SUBR64 => {
                let w = family_width(opcode, op::SUBR8);
                self.binop(mem, w, |a, b| Ok(a.wrapping_sub(b)))?;
            }
            op::MUL8..=op::MUL64 => {
                let w = family_width(opcode, op::MUL8);
                self.binop(mem, w, |a, b| Ok(a.wrapping_mul(b)))?;
            }
            op::DIVU8..=op::DIVU64 => {
                let w = family_width(opcode, op::DIVU8);
                self.binop(mem, w, |a, b| {
                    b.checked_div(a).ok_or(Interrupt::DivByZero)
                })?;
            }
            op::DIVRU8..=op::DIVRU64 => {
                let w = family_width(opcode, op::DIVRU8);
                self.binop(mem, w, |a, b| {
                    a.checked_div(b).ok_or(Interrupt::DivByZero)
                })?;
            }
            op::DIVI8..=op::DIVI64 => {
                let w = family_width(opcode, op::DIVI8);
                self.binop_i(mem, w, |a, b| {
                    if a == 0 {
                        Err(Interrupt::DivByZero)
                    } else {
                        Ok(b.wrapping_div(a))
                    }
                })?;
            }
            op::DIVRI8..=op::DIVRI64 => {
                let w = family_width(opcode, op::DIVRI8);
                self.binop_i(mem, w, |a, b| {
                    if b == 0 {
                        Err(Interrupt::DivByZero)
                    } else {
                        Ok(a.wrapping_div(b))
                    }
                })?;
            }
            op::MODU8..=op::MODU64 => {
                let w = family_width(opcode, op::MODU8);
                self.binop(mem, w, |a, b| {
                    b.checked_rem(a).ok_or(Interrupt::DivByZero)
                })?;
            }
            op::MODRU8..=op::MODRU64 => {
                let w = family_width(opcode, op::MODRU8);
                self.binop(mem, w, |a, b| {
                    a.checked_rem(b).ok_or(Interrupt::DivByZero)
                })?;
            }
            op::MODI8..=op::MODI64 => {
                let w = family_width(opcode, op::MODI8);
                self.binop_i(mem, w, |a, b| {
                    if a == 0 {
                        Err(Interrupt::DivByZero)
                    } else {
                        Ok(b.wrapping_rem(a))
                    }
                })?;
            }
            op::MODRI8..=op::MODRI64 => {
                let w = family_width(opcode, op::MODRI8);
                self.binop_i(mem, w, |a, b| {
                    if b == 0 {
                        Err(Interrupt::DivByZero)
                    } else {
                        Ok(a.wrapping_rem(b))
                    }
                })?;
            }

            //
            // Bitwise shift operations. The count is the top operand,
            // masked to the operand width.
            //
            op::LSHIFT8..=op::LSHIFT64 => {
                let w = family_width(opcode, op::LSHIFT8);
                self.binop(mem, w, |a, b| {
                    Ok(b << (a & (8 * w - 1)) as u32)
                })?;
            }
            op::RSHIFTU8..=op::RSHIFTU64 => {
                let w = family_width(opcode, op::RSHIFTU8);
                self.binop(mem, w, |a, b| {
                    Ok(b >> (a & (8 * w - 1)) as u32)
                })?;
            }
            op::RSHIFTI8..=op::RSHIFTI64 => {
                let w = family_width(opcode, op::RSHIFTI8);
                self.binop(mem, w, |a, b| {
                    let count = (a & (8 * w - 1)) as u32;
                    Ok((sign_extend(b, w) >> count) as u64)
                })?;
            }

            //
            // Bitwise logical operations
            //
            op::BAND8..=op::BAND64 => {
                let w = family_width(opcode, op::BAND8);
                self.binop(mem, w, |a, b| Ok(a & b))?;
            }
            op::BOR8..=op::BOR64 => {
                let w = family_width(opcode, op::BOR8);
                self.binop(mem, w, |a, b| Ok(a | b))?;
            }
            op::BXOR8..=op::BXOR64 => {
                let w = family_width(opcode, op::BXOR8);
                self.binop(mem, w, |a, b| Ok(a ^ b))?;
            }
            op::BINV8..=op::BINV64 => {
                let w = family_width(opcode, op::BINV8);
                self.unop(mem, w, |a| !a)?;
            }

            //
            // Boolean logical operations
            //
            op::LAND8..=op::LAND64 => {
                let w = family_width(opcode, op::LAND8);
                self.binop(mem, w, |a, b| {
                    Ok(u64::from(a != 0 && b != 0))
                })?;
            }
            op::LOR8..=op::LOR64 => {
                let w = family_width(opcode, op::LOR8);
                self.binop(mem, w, |a, b| {
                    Ok(u64::from(a != 0 || b != 0))
                })?;
            }
            op::LINV8..=op::LINV64 => {
                let w = family_width(opcode, op::LINV8);
                self.unop(mem, w, |a| u64::from(a == 0))?;
            }

            //
            // Comparison operations
            //
            op::CEQ8..=op::CEQ64 => {
                let w = family_width(opcode, op::CEQ8);
                self.cmpop(mem, w, |a, b| a == b)?;
            }
            op::CNE8..=op::CNE64 => {
                let w = family_width(opcode, op::CNE8);
                self.cmpop(mem, w, |a, b| a != b)?;
            }
            op::CGTU8..=op::CGTU64 => {
                let w = family_width(opcode, op::CGTU8);
                self.cmpop(mem, w, |a, b| a > b)?;
            }
            op::CGTI8..=op::CGTI64 => {
                let w = family_width(opcode, op::CGTI8);
                self.cmpop(mem, w, |a, b| {
                    sign_extend(a, w) > sign_extend(b, w)
                })?;
            }
            op::CLTU8..=op::CLTU64 => {
                let w = family_width(opcode, op::CLTU8);
                self.cmpop(mem, w, |a, b| a < b)?;
            }
            op::CLTI8..=op::CLTI64 => {
                let w = family_width(opcode, op::CLTI8);
                self.cmpop(mem, w, |a, b| {
                    sign_extend(a, w) < sign_extend(b, w)
                })?;
            }
            op::CGEU8..=op::CGEU64 => {
                let w = family_width(opcode, op::CGEU8);
                self.cmpop(mem, w, |a, b| a >= b)?;
            }
            op::CGEI8..=op::CGEI64 => {
                let w = family_width(opcode, op::CGEI8);
                self.cmpop(mem, w, |a, b| {
                    sign_extend(a, w) >= sign_extend(b, w)
                })?;
            }
            op::CLEU8..=op::CLEU64 => {
                let w = family_width(opcode, op::CLEU8);
                self.cmpop(mem, w, |a, b| a <= b)?;
            }
            op::CLEI8..=op::CLEI64 => {
                let w = family_width(opcode, op::CLEI8);
                self.cmpop(mem, w, |a, b| {
                    sign_extend(a, w) <= sign_extend(b, w)
                })?;
            }

            //
            // Function operations
            //
            op::CALL => {
                let target = self.imm(mem, 8)?;
                self.push(mem, 8, self.pc.wrapping_add(9))?;
                self.pc = target;
            }
            op::CALLS => {
                let target = mem.read_w(self.sp, 8)?;
                self.sp = self.sp.wrapping_add(8);
                self.push(mem, 8, self.pc.wrapping_add(1))?;
                self.pc = target;
            }
            op::RET => {
                self.pc = mem.read_w(self.sp, 8)?;
                self.sp = self.sp.wrapping_add(8);
            }

            //
            // Jump operations. Relative transfers are based at the address
            // just past the opcode byte, matching the assembler's label
            // delta arithmetic.
            //
            op::JMP => {
                self.pc = self.imm(mem, 8)?;
            }
            op::JMPS => {
                self.pc = mem.read_w(self.sp, 8)?;
                self.sp = self.sp.wrapping_add(8);
            }
            op::RJMPI8..=op::RJMPI32 => {
                let n = family_width(opcode, op::RJMPI8);
                let delta = sign_extend(self.imm(mem, n)?, n);
                self.pc = self.pc.wrapping_add(1).wrapping_add_signed(delta);
            }

            //
            // Conditional branching operations: taken when the popped
            // operand is non-zero.
            //
            op::BRZ8..=op::BRZ64 => {
                let w = family_width(opcode, op::BRZ8);
                let val = mem.read_w(self.sp, w)?;
                let target = self.imm(mem, 8)?;
                self.sp = self.sp.wrapping_add(w);
                if val != 0 {
                    self.pc = target;
                } else {
                    self.pc = self.pc.wrapping_add(9);
                }
            }
            op::RBRZ8I8..=op::RBRZ64I32 => {
                let idx = opcode - op::RBRZ8I8;
                let w = 1u64 << (idx / 3);
                let n = 1u64 << (idx % 3);
                let val = mem.read_w(self.sp, w)?;
                let delta = sign_extend(self.imm(mem, n)?, n);
                self.sp = self.sp.wrapping_add(w);
                if val != 0 {
                    self.pc =
                        self.pc.wrapping_add(1).wrapping_add_signed(delta);
                } else {
                    self.pc = self.pc.wrapping_add(1 + n);
                }
            }

            //
            // Memory operations
            //
            op::LOAD8..=op::LOAD64 => {
                let w = family_width(opcode, op::LOAD8);
                let addr = mem.read_w(self.sp, 8)?;
                let val = mem.read_w(addr, w)?;
                self.push(mem, w, val)?;
                self.pc = self.pc.wrapping_add(1);
            }
            op::LOADPOP8..=op::LOADPOP64 => {
                let w = family_width(opcode, op::LOADPOP8);
                let addr = mem.read_w(self.sp, 8)?;
                let val = mem.read_w(addr, w)?;
                mem.write_w(self.sp.wrapping_add(8 - w), w, val)?;
                self.sp = self.sp.wrapping_add(8 - w);
                self.pc = self.pc.wrapping_add(1);
            }
            op::LOADSFP8..=op::LOADSFP64 => {
                let w = family_width(opcode, op::LOADSFP8);
                let off = mem.read_w(self.sp, 8)? as i64;
                let val = mem.read_w(self.sfp.wrapping_add_signed(off), w)?;
                self.push(mem, w, val)?;
                self.pc = self.pc.wrapping_add(1);
            }
            op::LOADPOPSFP8..=op::LOADPOPSFP64 => {
                let w = family_width(opcode, op::LOADPOPSFP8);
                let off = mem.read_w(self.sp, 8)? as i64;
                let val = mem.read_w(self.sfp.wrapping_add_signed(off), w)?;
                mem.write_w(self.sp.wrapping_add(8 - w), w, val)?;
                self.sp = self.sp.wrapping_add(8 - w);
                self.pc = self.pc.wrapping_add(1);
            }
            op::STORE8..=op::STORE64 => {
                let w = family_width(opcode, op::STORE8);
                let addr = mem.read_w(self.sp, 8)?;
                let val = mem.read_w(self.sp.wrapping_add(8), w)?;
                mem.write_w(addr, w, val)?;
                self.pc = self.pc.wrapping_add(1);
            }
            op::STOREPOP8..=op::STOREPOP64 => {
                let w = family_width(opcode, op::STOREPOP8);
                let addr = mem.read_w(self.sp, 8)?;
                let val = mem.read_w(self.sp.wrapping_add(8), w)?;
                mem.write_w(addr, w, val)?;
                self.sp = self.sp.wrapping_add(8);
                self.pc = self.pc.wrapping_add(1);
            }
            op::STORESFP8..=op::STORESFP64 => {
                let w = family_width(opcode, op::STORESFP8);
                let off = mem.read_w(self.sp, 8)? as i64;
                let val = mem.read_w(self.sp.wrapping_add(8), w)?;
                mem.write_w(self.sfp.wrapping_add_signed(off), w, val)?;
                self.pc = self.pc.wrapping_add(1);
            }
            op::STOREPOPSFP8..=op::STOREPOPSFP64 => {
                let w = family_width(opcode, op::STOREPOPSFP8);
                let off = mem.read_w(self.sp, 8)? as i64;
                let val = mem.read_w(self.sp.wrapping_add(8), w)?;
                mem.write_w(self.sfp.wrapping_add_signed(off), w, val)?;
                self.sp = self.sp.wrapping_add(8);
                self.pc = self.pc.wrapping_add(1);
            }

            //
            // Reverse stores: the value sits on top, the address (or frame
            // offset) beneath it.
            //
            op::STORER8..=op::STORER64 => {
                let w = family_width(opcode, op::STORER8);
                let addr = mem.read_w(self.sp.wrapping_add(w), 8)?;
                let val = mem.read_w(self.sp, w)?;
                mem.write_w(addr, w, val)?;
                self.pc = self.pc.wrapping_add(1);
            }
            op::STORERPOP8..=op::STORERPOP64 => {
                let w = family_width(opcode, op::STORERPOP8);
                let addr = mem.read_w(self.sp.wrapping_add(w), 8)?;
                let val = mem.read_w(self.sp, w)?;
                mem.write_w(addr, w, val)?;
                self.sp = self.sp.wrapping_add(w);
                self.pc = self.pc.wrapping_add(1);
            }
            op::STORERSFP8..=op::STORERSFP64 => {
                let w = family_width(opcode, op::STORERSFP8);
                let off = mem.read_w(self.sp.wrapping_add(w), 8)? as i64;
                let val = mem.read_w(self.sp, w)?;
                mem.write_w(self.sfp.wrapping_add_signed(off), w, val)?;
                self.pc = self.pc.wrapping_add(1);
            }
            op::STORERPOPSFP8..=op::STORERPOPSFP64 => {
                let w = family_width(opcode, op::STORERPOPSFP8);
                let off = mem.read_w(self.sp.wrapping_add(w), 8)? as i64;
                let val = mem.read_w(self.sp, w)?;
                mem.write_w(self.sfp.wrapping_add_signed(off), w, val)?;
                self.sp = self.sp.wrapping_add(w);
                self.pc = self.pc.wrapping_add(1);
            }

            //
            // Special operations
            //
            op::SETSBP => {
                self.sbp = mem.read_w(self.sp, 8)?;
                self.sp = self.sp.wrapping_add(8);
                self.pc = self.pc.wrapping_add(1);
            }
            op::SETSFP => {
                self.sfp = mem.read_w(self.sp, 8)?;
                self.sp = self.sp.wrapping_add(8);
                self.pc = self.pc.wrapping_add(1);
            }
            op::SETSP => {
                // The popped value becomes the stack pointer outright
                self.sp = mem.read_w(self.sp, 8)?;
                self.pc = self.pc.wrapping_add(1);
            }
            op::SETSLP => {
                self.slp = mem.read_w(self.sp, 8)?;
                self.sp = self.sp.wrapping_add(8);
                self.pc = self.pc.wrapping_add(1);
            }
            op::HALT => return Err(Interrupt::Halt),
            op::NOP => {
                self.pc = self.pc.wrapping_add(1);
            }

            // ext is reserved for a future extension space
            op::EXT => return Err(Interrupt::BadInst),
            _ => return Err(Interrupt::BadInst),
        }

        Ok(())
    }
}
