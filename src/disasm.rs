//! Disassembler: verified stub → textual listing.
//!
//! Each section prints as a `.section <addr>` header followed by one line
//! per instruction. Immediate values format as `0` when zero, `0x<hex>` for
//! unsigned and any-typed immediates, and sign-magnitude (`-0x<hex>`) for
//! signed ones.

use std::io::{Read, Seek, Write};

use anyhow::{anyhow, bail, Context, Result};

use crate::isa::{self, Sdt};
use crate::stub;

/// Disassembles the stub in `file`, writing the listing to `out`.
pub fn disassemble<F: Read + Seek, W: Write>(
    file: &mut F,
    out: &mut W,
) -> Result<()> {
    stub::verify(file).map_err(|e| anyhow!("not a valid stub file: {e}"))?;
    let (_, nsec) = stub::section_counts(file)
        .map_err(|e| anyhow!("failed to get section counts: {e}"))?;

    for si in 0..nsec {
        let sec = stub::load_section(file, si)
            .map_err(|e| anyhow!("failed to load section {si}: {e}"))?;
        writeln!(out, ".section {:#x}", sec.addr)?;

        let mut di = 0u64;
        while di < sec.size {
            let mut opcode = [0u8; 1];
            file.read_exact(&mut opcode)
                .with_context(|| format!("unexpected EOF in section {si}"))?;
            let opcode = opcode[0];
            di += 1;

            let name = isa::name_for_opcode(opcode).ok_or_else(|| {
                anyhow!("unknown opcode {opcode:#04x} in section {si}")
            })?;
            let sdt = isa::imm_type_for_opcode(opcode).ok_or_else(|| {
                anyhow!(
                    "unknown immediate type for opcode {opcode:#04x} in section {si}"
                )
            })?;

            let imm_len = sdt.size() as u64;
            if di + imm_len > sec.size {
                bail!("unexpected end of section {si} inside an instruction");
            }
            let mut imm = [0u8; 8];
            file.read_exact(&mut imm[..sdt.size()])
                .with_context(|| format!("unexpected EOF in section {si}"))?;
            di += imm_len;

            let val = u64::from_le_bytes(imm);
            write!(out, "{name}")?;
            format_imm(out, sdt, val)?;
            writeln!(out)?;
        }
    }
    Ok(())
}

// Prints the immediate value, if any, with a leading space.
fn format_imm<W: Write>(out: &mut W, sdt: Sdt, val: u64) -> Result<()> {
    if sdt == Sdt::Void {
        return Ok(());
    }
    if val == 0 {
        // Zero prints bare, no matter the data type
        write!(out, " 0")?;
        return Ok(());
    }
    if !sdt.is_signed() {
        write!(out, " {val:#x}")?;
        return Ok(());
    }

    let signed = match sdt {
        Sdt::I8 => i64::from(val as u8 as i8),
        Sdt::I16 => i64::from(val as u16 as i16),
        Sdt::I32 => i64::from(val as u32 as i32),
        _ => val as i64,
    };
    if signed < 0 {
        write!(out, " -{:#x}", signed.unsigned_abs())?;
    } else {
        write!(out, " {signed:#x}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::assemble_reader;
    use crate::isa::op;
    use std::io::Cursor;

    fn disassemble_program(src: &str) -> String {
        let mut bin = Cursor::new(Vec::new());
        assemble_reader(src.as_bytes(), None, &mut bin, 4).unwrap();
        let mut listing = Vec::new();
        disassemble(&mut bin, &mut listing).unwrap();
        String::from_utf8(listing).unwrap()
    }

    #[test]
    fn listing_round_trip() {
        let src = ".section 0x1000\nnop\nnop\nhalt\n";
        assert_eq!(
            disassemble_program(src),
            ".section 0x1000\nnop\nnop\nhalt\n"
        );
    }

    #[test]
    fn value_formatting() {
        let listing = disassemble_program(
            ".section 0x1000\npush8as8 0x2a\npush64as64 0\nrjmpi8 -1\njmp 0x1000\n",
        );
        assert_eq!(
            listing,
            ".section 0x1000\npush8as8 0x2a\npush64as64 0\nrjmpi8 -0x1\njmp 0x1000\n"
        );
    }

    #[test]
    fn signed_positive_formats_plain_hex() {
        let listing =
            disassemble_program(".section 0x1000\nrjmpi16 0x7f\n");
        assert!(listing.contains("rjmpi16 0x7f"));
    }

    #[test]
    fn unknown_opcode_is_an_error() {
        let mut bin = Cursor::new(Vec::new());
        stub::init(&mut bin, 1).unwrap();
        use std::io::Write as _;
        bin.write_all(&[0xf9]).unwrap(); // unassigned byte
        let mut sec = stub::Section::new(0x1000, 0, 0);
        stub::save_section(&mut bin, 0, &mut sec).unwrap();
        let mut listing = Vec::new();
        let err = disassemble(&mut bin, &mut listing).unwrap_err();
        assert!(err.to_string().contains("unknown opcode"));
    }

    #[test]
    fn truncated_instruction_is_an_error() {
        let mut bin = Cursor::new(Vec::new());
        stub::init(&mut bin, 1).unwrap();
        use std::io::Write as _;
        // jmp with only half its immediate
        bin.write_all(&[op::JMP, 1, 2, 3]).unwrap();
        let mut sec = stub::Section::new(0x1000, 0, 0);
        stub::save_section(&mut bin, 0, &mut sec).unwrap();
        let mut listing = Vec::new();
        let err = disassemble(&mut bin, &mut listing).unwrap_err();
        assert!(err.to_string().contains("inside an instruction"));
    }
}
