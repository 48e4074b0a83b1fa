//! Assembly driver.
//!
//! Consumes parser events and writes a stub: opens and finalizes sections
//! through the two-pass writer, emits instruction and data bytes, resolves
//! labels (back-patching forward references), and maintains the `.include`
//! stack with symbol-map hand-off in both directions.

use std::fs::File;
use std::io::{BufReader, Read, Seek, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use log::debug;

use crate::isa::{SectionKind, INIT_PC_VAL};
use crate::label::{LabelTable, Usage};
use crate::parser::{Event, Parser};
use crate::stub::{self, Section, Truncate};

// Guards against include cycles; real programs nest far shallower.
const MAX_INCLUDE_DEPTH: usize = 64;

struct IncFrame<'a> {
    reader: Box<dyn Read + 'a>,
    parser: Parser,
    path: Option<PathBuf>,
}

impl IncFrame<'_> {
    fn name(&self) -> String {
        match &self.path {
            Some(path) => path.display().to_string(),
            None => "<stdin>".to_string(),
        }
    }
}

/// Assembles the source file at `source` (standard input when `None`) into
/// `out`, which is initialized as a stub with room for `maxnsec` sections.
pub fn assemble<F: Read + Write + Seek + Truncate>(
    source: Option<&Path>,
    out: &mut F,
    maxnsec: u32,
) -> Result<()> {
    match source {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            assemble_reader(BufReader::new(file), Some(path), out, maxnsec)
        }
        None => assemble_reader(std::io::stdin().lock(), None, out, maxnsec),
    }
}

/// Assembles from an arbitrary byte stream. `source` names the stream for
/// error messages and anchors `.include` path resolution.
pub fn assemble_reader<R: Read, F: Read + Write + Seek + Truncate>(
    input: R,
    source: Option<&Path>,
    out: &mut F,
    maxnsec: u32,
) -> Result<()> {
    stub::init(out, maxnsec)
        .map_err(|e| anyhow!("failed to initialize output stub: {e}"))?;

    let mut asm = Assembler {
        out,
        labels: LabelTable::new(),
        sec_count: 0,
        curr_sec: Section::default(),
        curr_sec_fo: 0,
    };

    let mut stack: Vec<IncFrame> = vec![IncFrame {
        reader: Box::new(input),
        parser: Parser::new(),
        path: source.map(Path::to_path_buf),
    }];

    while let Some(frame) = stack.last_mut() {
        let mut byte = [0u8; 1];
        let n = frame
            .reader
            .read(&mut byte)
            .with_context(|| format!("failed to read from {}", frame.name()))?;

        let at_eof = n == 0;
        let event = if at_eof {
            // Flush the final line; the frame pops once its events drain.
            frame
                .parser
                .finish()
                .with_context(|| format!("in {}", frame.name()))?
        } else {
            frame
                .parser
                .parse_byte(byte[0])
                .with_context(|| format!("in {}", frame.name()))?
        };

        match event {
            Some(Event::Include { path }) => {
                if stack.len() >= MAX_INCLUDE_DEPTH {
                    bail!("include depth exceeds {MAX_INCLUDE_DEPTH}");
                }
                let frame = open_include(&path, stack.last_mut())?;
                stack.push(frame);
            }
            Some(event) => asm.handle_event(event)?,
            None => {
                if at_eof {
                    // Pop the exhausted source, handing new symbol
                    // definitions back to the includer.
                    let mut finished = stack.pop().expect("frame exists");
                    let defs = finished.parser.take_defs();
                    if let Some(parent) = stack.last_mut() {
                        parent.parser.adopt_defs(defs);
                        debug!("leaving include {}", finished.name());
                    }
                }
            }
        }
    }

    asm.finalize()
}

fn open_include<'a>(
    path: &[u8],
    includer: Option<&mut IncFrame>,
) -> Result<IncFrame<'a>> {
    let includer = includer.expect("include arrives from a live frame");
    let rel = PathBuf::from(String::from_utf8_lossy(path).into_owned());
    // Paths resolve relative to the including file's directory.
    let resolved = match includer.path.as_ref().and_then(|p| p.parent()) {
        Some(dir) if rel.is_relative() => dir.join(&rel),
        _ => rel,
    };
    let file = File::open(&resolved).with_context(|| {
        format!(
            "failed to open \"{}\" included from {}",
            resolved.display(),
            includer.name()
        )
    })?;
    let mut parser = Parser::new();
    parser.adopt_defs(includer.parser.take_defs());
    Ok(IncFrame {
        reader: Box::new(BufReader::new(file)),
        parser,
        path: Some(resolved),
    })
}

struct Assembler<'a, F> {
    out: &'a mut F,
    labels: LabelTable,
    sec_count: u32,
    curr_sec: Section,
    curr_sec_fo: u64,
}

impl<F: Read + Write + Seek> Assembler<'_, F> {
    fn handle_event(&mut self, event: Event) -> Result<()> {
        match event {
            Event::Section { addr, flags } => self.open_section(addr, flags),
            Event::Inst { opcode, imm, label } => {
                self.emit(&[opcode], &imm, label, 0)
            }
            Event::Data { bytes, label } => {
                let len = bytes.len();
                self.emit(&[], &bytes, label, len)
            }
            Event::Label { name } => self.define_label(name),
            Event::Include { .. } => unreachable!("handled by the driver"),
        }
    }

    fn open_section(&mut self, addr: u64, flags: u8) -> Result<()> {
        if self.sec_count > 0 {
            // Finalize the previous section before starting a new one
            stub::save_section(self.out, self.sec_count - 1, &mut self.curr_sec)
                .map_err(|e| {
                    anyhow!(
                        "failed to save stub section {}: {e}",
                        self.sec_count - 1
                    )
                })?;
        }

        // Address and flags are known now; the size is discovered when the
        // section is saved.
        self.curr_sec = Section::new(addr, flags, 0);
        stub::save_section(self.out, self.sec_count, &mut self.curr_sec)
            .map_err(|e| {
                anyhow!("failed to save stub section {}: {e}", self.sec_count)
            })?;
        self.curr_sec_fo = self.out.stream_position()?;
        self.sec_count += 1;
        debug!("section {} at {addr:#x} flags {flags}", self.sec_count - 1);
        Ok(())
    }

    // Emits an instruction (`head` = opcode byte, `body` = immediate) or a
    // raw datum (`head` empty). `data_len` is non-zero for data usages.
    fn emit(
        &mut self,
        head: &[u8],
        body: &[u8],
        label: Option<Vec<u8>>,
        data_len: usize,
    ) -> Result<()> {
        self.ensure_section()?;
        let fpos = self.out.stream_position()?;
        self.out.write_all(head)?;
        self.out.write_all(body)?;

        if let Some(name) = label {
            let pc = self.curr_sec.addr + (fpos - self.curr_sec_fo);
            let usage = Usage {
                foffset: fpos,
                // The immediate field sits right past the opcode byte
                addr: pc + head.len() as u64,
                data_len,
            };
            self.labels.reference(self.out, name, usage)?;
        }
        Ok(())
    }

    // A program may begin emitting without an explicit `.section`; the
    // architectural default is a TEXT section at the default entry point.
    fn ensure_section(&mut self) -> Result<()> {
        if self.sec_count == 0 {
            self.open_section(INIT_PC_VAL, SectionKind::Text.into())?;
        }
        Ok(())
    }

    fn define_label(&mut self, name: Vec<u8>) -> Result<()> {
        self.ensure_section()?;
        let fpos = self.out.stream_position()?;
        let addr = self.curr_sec.addr + (fpos - self.curr_sec_fo);
        self.labels.define(self.out, name, addr)
    }

    fn finalize(&mut self) -> Result<()> {
        if self.sec_count > 0 {
            stub::save_section(self.out, self.sec_count - 1, &mut self.curr_sec)
                .map_err(|e| {
                    anyhow!(
                        "failed to save stub section {}: {e}",
                        self.sec_count - 1
                    )
                })?;
        }
        self.labels.finish()
    }
}
