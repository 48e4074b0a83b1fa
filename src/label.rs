//! Label records and back-patching.
//!
//! Each label is either `Defined` at an address or `Pending` with the list
//! of sites that referenced it before its definition. A usage carries the
//! output-file offset of the referencing instruction (or datum) and the
//! memory address of its immediate field; PC-relative opcodes patch
//! `label_addr - usage.addr`, absolute ones patch `label_addr`.

use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom, Write};

use anyhow::{anyhow, bail, ensure, Result};

use crate::isa;
use crate::lits::min_bytes_for_val;

/// A recorded reference to a not-yet-defined label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Usage {
    /// File offset of the instruction (or of the raw datum).
    pub foffset: u64,
    /// Memory address of the immediate field itself.
    pub addr: u64,
    /// Width of a raw-data usage; zero means an instruction usage whose
    /// width follows from the opcode on disk.
    pub data_len: usize,
}

#[derive(Debug)]
enum LabelState {
    Defined(u64),
    Pending(Vec<Usage>),
}

/// The per-assembly-unit label table.
#[derive(Debug, Default)]
pub struct LabelTable {
    map: BTreeMap<Vec<u8>, LabelState>,
}

impl LabelTable {
    pub fn new() -> Self {
        LabelTable::default()
    }

    /// Defines `name` at `addr`, back-patching every pending usage.
    /// Duplicate definitions are a hard error. The file position is
    /// preserved.
    pub fn define<F: Read + Write + Seek>(
        &mut self,
        file: &mut F,
        name: Vec<u8>,
        addr: u64,
    ) -> Result<()> {
        let pending = match self.map.get_mut(&name) {
            Some(LabelState::Defined(_)) => bail!(
                "definition already exists for label \"{}\"",
                String::from_utf8_lossy(&name)
            ),
            Some(state) => {
                let LabelState::Pending(usages) =
                    std::mem::replace(state, LabelState::Defined(addr))
                else {
                    unreachable!()
                };
                usages
            }
            None => {
                self.map.insert(name.clone(), LabelState::Defined(addr));
                Vec::new()
            }
        };

        if pending.is_empty() {
            return Ok(());
        }
        let pos = file.stream_position()?;
        for usage in &pending {
            apply(file, usage, addr).map_err(|e| {
                anyhow!(
                    "failed to apply label \"{}\": {e}",
                    String::from_utf8_lossy(&name)
                )
            })?;
        }
        file.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    /// Records a reference to `name`. If the label is already defined the
    /// site is patched immediately; otherwise the usage queues until the
    /// definition arrives. The file position is preserved.
    pub fn reference<F: Read + Write + Seek>(
        &mut self,
        file: &mut F,
        name: Vec<u8>,
        usage: Usage,
    ) -> Result<()> {
        match self.map.get_mut(&name) {
            Some(LabelState::Defined(addr)) => {
                let addr = *addr;
                let pos = file.stream_position()?;
                apply(file, &usage, addr).map_err(|e| {
                    anyhow!(
                        "failed to apply label \"{}\": {e}",
                        String::from_utf8_lossy(&name)
                    )
                })?;
                file.seek(SeekFrom::Start(pos))?;
            }
            Some(LabelState::Pending(usages)) => usages.push(usage),
            None => {
                self.map.insert(name, LabelState::Pending(vec![usage]));
            }
        }
        Ok(())
    }

    /// Verifies every referenced label was eventually defined.
    pub fn finish(&self) -> Result<()> {
        for (name, state) in &self.map {
            if matches!(state, LabelState::Pending(_)) {
                bail!("undefined label \"{}\"", String::from_utf8_lossy(name));
            }
        }
        Ok(())
    }
}

// Patches one usage site with the now-known label address.
fn apply<F: Read + Write + Seek>(
    file: &mut F,
    usage: &Usage,
    label_addr: u64,
) -> Result<()> {
    file.seek(SeekFrom::Start(usage.foffset))?;

    let (opcode_len, imm_len, imm_val) = if usage.data_len > 0 {
        // Raw data usage: no opcode, the label address is the value.
        (0u64, usage.data_len, label_addr as i64)
    } else {
        let mut opcode = [0u8; 1];
        file.read_exact(&mut opcode)?;
        let sdt = isa::imm_type_for_opcode(opcode[0]).ok_or_else(|| {
            anyhow!("no immediate type for opcode {:#04x}", opcode[0])
        })?;
        let imm_len = sdt.size();
        ensure!(
            (1..=8).contains(&imm_len),
            "opcode {:#04x} takes no immediate",
            opcode[0]
        );
        let (_, delta) = isa::opcode_is_jmp_br(opcode[0]);
        let imm_val = if delta {
            label_addr.wrapping_sub(usage.addr) as i64
        } else {
            label_addr as i64
        };
        (1, imm_len, imm_val)
    };

    ensure!(
        imm_len >= min_bytes_for_val(imm_val),
        "label value out of range for immediate width {imm_len}"
    );

    // The immediate bytes must still hold the zero fill written at
    // emission time.
    let mut imm = [0u8; 8];
    file.read_exact(&mut imm[..imm_len])?;
    ensure!(
        imm[..imm_len].iter().all(|b| *b == 0),
        "immediate data not cleared prior to label application"
    );

    file.seek(SeekFrom::Start(usage.foffset + opcode_len))?;
    file.write_all(&imm_val.to_le_bytes()[..imm_len])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::op;
    use std::io::Cursor;

    #[test]
    fn forward_absolute_reference() {
        // jmp <target>, patched once the label lands at 0x1234
        let mut file =
            Cursor::new(vec![op::JMP, 0, 0, 0, 0, 0, 0, 0, 0, op::NOP]);
        let mut labels = LabelTable::new();
        labels
            .reference(
                &mut file,
                b"target".to_vec(),
                Usage {
                    foffset: 0,
                    addr: 0x1001,
                    data_len: 0,
                },
            )
            .unwrap();
        labels
            .define(&mut file, b"target".to_vec(), 0x1234)
            .unwrap();
        labels.finish().unwrap();
        let data = file.into_inner();
        assert_eq!(&data[1..9], &0x1234u64.to_le_bytes());
    }

    #[test]
    fn relative_reference_is_delta() {
        // rjmpi8 referencing its own address: delta -1 from the immediate
        let mut file = Cursor::new(vec![op::RJMPI8, 0]);
        let mut labels = LabelTable::new();
        labels.define(&mut file, b"loop".to_vec(), 0x1000).unwrap();
        labels
            .reference(
                &mut file,
                b"loop".to_vec(),
                Usage {
                    foffset: 0,
                    addr: 0x1001,
                    data_len: 0,
                },
            )
            .unwrap();
        assert_eq!(file.into_inner(), vec![op::RJMPI8, 0xff]);
    }

    #[test]
    fn data_usage_patches_absolute() {
        let mut file = Cursor::new(vec![0; 8]);
        let mut labels = LabelTable::new();
        labels
            .reference(
                &mut file,
                b"t".to_vec(),
                Usage {
                    foffset: 0,
                    addr: 0x2000,
                    data_len: 8,
                },
            )
            .unwrap();
        labels.define(&mut file, b"t".to_vec(), 0xdead_beef).unwrap();
        assert_eq!(file.into_inner(), 0xdead_beefu64.to_le_bytes().to_vec());
    }

    #[test]
    fn duplicate_definition_rejected() {
        let mut file = Cursor::new(Vec::new());
        let mut labels = LabelTable::new();
        labels.define(&mut file, b"x".to_vec(), 0).unwrap();
        assert!(labels.define(&mut file, b"x".to_vec(), 1).is_err());
    }

    #[test]
    fn undefined_label_detected_at_finish() {
        let mut file = Cursor::new(vec![op::JMP, 0, 0, 0, 0, 0, 0, 0, 0]);
        let mut labels = LabelTable::new();
        labels
            .reference(
                &mut file,
                b"nowhere".to_vec(),
                Usage {
                    foffset: 0,
                    addr: 0x1001,
                    data_len: 0,
                },
            )
            .unwrap();
        assert!(labels.finish().is_err());
    }

    #[test]
    fn out_of_range_delta_rejected() {
        // rjmpi8 can only span signed 8 bits
        let mut file = Cursor::new(vec![op::RJMPI8, 0]);
        let mut labels = LabelTable::new();
        labels
            .reference(
                &mut file,
                b"far".to_vec(),
                Usage {
                    foffset: 0,
                    addr: 0x1001,
                    data_len: 0,
                },
            )
            .unwrap();
        assert!(labels.define(&mut file, b"far".to_vec(), 0x2000).is_err());
    }

    #[test]
    fn nonzero_immediate_rejected() {
        let mut file = Cursor::new(vec![op::JMP, 1, 0, 0, 0, 0, 0, 0, 0]);
        let mut labels = LabelTable::new();
        let usage = Usage {
            foffset: 0,
            addr: 0x1001,
            data_len: 0,
        };
        labels.reference(&mut file, b"t".to_vec(), usage).unwrap();
        assert!(labels.define(&mut file, b"t".to_vec(), 0x30).is_err());
    }
}
