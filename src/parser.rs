//! Statement parser: UTF-8 bytes → tokens → parser events.
//!
//! One statement per line. The parser threads a small state machine over
//! successive tokens and emits at most one [`Event`] per line, performing
//! symbol substitution, pseudo-op selection and literal range checks along
//! the way. A parser instance lives for one source file; the assembler
//! stacks instances for `.include` and moves symbol definitions between
//! them.

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Result};

use crate::isa::{
    self, op, Interrupt, Sdt, BEGIN_INT_ADDR, BEGIN_IO_ADDR, INIT_PC_VAL,
    IO_ASSERT_ADDR, IO_FLUSH_ADDR, IO_STDIN_ADDR, IO_STDOUT_ADDR,
    IO_URAND_ADDR,
};
use crate::lits::{min_bytes_for_val, parse_int, parse_string_lit};
use crate::tokenizer::{Token, Tokenizer};
use crate::utf8;

/// Symbol map: definition name → replacement text.
pub type SymbolMap = BTreeMap<Vec<u8>, Vec<u8>>;

/// Events the parser hands to the assembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// An instruction: opcode byte, raw little-endian immediate bytes
    /// (zero-filled when a label is pending), and the unresolved label name
    /// if the immediate references one.
    Inst {
        opcode: u8,
        imm: Vec<u8>,
        label: Option<Vec<u8>>,
    },
    /// 1-8 raw data bytes, possibly back-patched by a label.
    Data {
        bytes: Vec<u8>,
        label: Option<Vec<u8>>,
    },
    /// Start a new section.
    Section { addr: u64, flags: u8 },
    /// Push an included source file.
    Include { path: Vec<u8> },
    /// A label definition at the current emission point.
    Label { name: Vec<u8> },
}

// Automatic symbols besides opcodes and interrupt numbers, in sorted order
// for binary search.
static AUTOSYMS: &[(&str, u64)] = &[
    ("BEGIN_INT_ADDR", BEGIN_INT_ADDR),
    ("BEGIN_IO_ADDR", BEGIN_IO_ADDR),
    ("INIT_PC_VAL", INIT_PC_VAL),
    ("IO_ASSERT_ADDR", IO_ASSERT_ADDR),
    ("IO_FLUSH_ADDR", IO_FLUSH_ADDR),
    ("IO_STDIN_ADDR", IO_STDIN_ADDR),
    ("IO_STDOUT_ADDR", IO_STDOUT_ADDR),
    ("IO_URAND_ADDR", IO_URAND_ADDR),
];

fn autosym(name: &[u8]) -> Option<u64> {
    AUTOSYMS
        .binary_search_by(|(n, _)| n.as_bytes().cmp(name))
        .ok()
        .map(|i| AUTOSYMS[i].1)
}

// Assembler commands, sorted.
static ASM_CMDS: &[&[u8]] = &[
    b".data16", b".data32", b".data64", b".data8", b".define", b".include",
    b".section", b".strings",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AsmCmd {
    Data16,
    Data32,
    Data64,
    Data8,
    Define,
    Include,
    Section,
    Strings,
}

fn asm_cmd(token: &[u8]) -> Option<AsmCmd> {
    let idx = ASM_CMDS.binary_search(&token).ok()?;
    Some(match idx {
        0 => AsmCmd::Data16,
        1 => AsmCmd::Data32,
        2 => AsmCmd::Data64,
        3 => AsmCmd::Data8,
        4 => AsmCmd::Define,
        5 => AsmCmd::Include,
        6 => AsmCmd::Section,
        _ => AsmCmd::Strings,
    })
}

// Pseudo-op target widths by name, sorted.
static PSOPS: &[(&[u8], usize)] =
    &[(b"push16", 2), (b"push32", 4), (b"push64", 8), (b"push8", 1)];

fn psop_width(token: &[u8]) -> Option<usize> {
    PSOPS
        .binary_search_by(|(n, _)| (*n).cmp(token))
        .ok()
        .map(|i| PSOPS[i].1)
}

// Maps (source width, target width, signedness) to the concrete widening
// push opcode. `src == dst` selects the any-typed form.
fn push_opcode(src: usize, dst: usize, signed: bool) -> u8 {
    match (src, dst, signed) {
        (1, 1, _) => op::PUSH8AS8,
        (1, 2, false) => op::PUSH8ASU16,
        (1, 2, true) => op::PUSH8ASI16,
        (1, 4, false) => op::PUSH8ASU32,
        (1, 4, true) => op::PUSH8ASI32,
        (1, 8, false) => op::PUSH8ASU64,
        (1, 8, true) => op::PUSH8ASI64,
        (2, 2, _) => op::PUSH16AS16,
        (2, 4, false) => op::PUSH16ASU32,
        (2, 4, true) => op::PUSH16ASI32,
        (2, 8, false) => op::PUSH16ASU64,
        (2, 8, true) => op::PUSH16ASI64,
        (4, 4, _) => op::PUSH32AS32,
        (4, 8, false) => op::PUSH32ASU64,
        (4, 8, true) => op::PUSH32ASI64,
        _ => op::PUSH64AS64,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Default,
    Label1,
    Label2,
    Include1,
    Include2,
    Section1,
    Section2, // flags token optional: newline also accepted here
    Section3,
    Define1,
    Define2,
    Define3,
    Data1,
    Data2,
    Push1,
    Push2,
    Opcode1,
    Opcode2,
}

/// The value absorbed by a payload state: an integer literal or a label
/// reference.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Payload {
    Value(i64),
    Label(Vec<u8>),
}

#[derive(Debug)]
pub struct Parser {
    decoder: utf8::Decoder,
    tokenizer: Tokenizer,
    state: State,
    defs: SymbolMap,
    line: u32,
    ch: u32,
    // Pending statement pieces
    opcode: u8,
    sdt: Sdt,
    width: usize,
    payload: Option<Payload>,
    name: Vec<u8>,
    value: Vec<u8>,
    sec_addr: u64,
    sec_flags: u8,
}

impl Default for Parser {
    fn default() -> Self {
        Parser::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Parser {
            decoder: utf8::Decoder::new(),
            tokenizer: Tokenizer::new(),
            state: State::Default,
            defs: SymbolMap::new(),
            line: 1,
            ch: 1,
            opcode: 0,
            sdt: Sdt::Void,
            width: 0,
            payload: None,
            name: Vec::new(),
            value: Vec::new(),
            sec_addr: 0,
            sec_flags: 0,
        }
    }

    /// Seeds the symbol map (used when entering an included file).
    pub fn adopt_defs(&mut self, defs: SymbolMap) {
        self.defs = defs;
    }

    /// Takes the symbol map back out (used when leaving an included file).
    pub fn take_defs(&mut self) -> SymbolMap {
        std::mem::take(&mut self.defs)
    }

    /// Feeds one source byte; returns a completed statement event, if any.
    pub fn parse_byte(&mut self, b: u8) -> Result<Option<Event>> {
        let c = match self.decoder.decode(b).map_err(|e| {
            anyhow!("{e} at line {} char {}", self.line, self.ch)
        })? {
            Some(c) => c,
            None => return Ok(None),
        };

        self.tokenizer.parse(c);
        if c == u32::from(b'\n') {
            self.line += 1;
            self.ch = 1;
        } else {
            self.ch += 1;
        }

        self.drain_tokens()
    }

    /// True iff the stream may end here without error: no partial UTF-8
    /// sequence, no partial statement.
    pub fn can_terminate(&self) -> bool {
        self.decoder.can_terminate() && self.state == State::Default
    }

    /// Ends the source stream, acting as a final newline.
    pub fn finish(&mut self) -> Result<Option<Event>> {
        if !self.decoder.can_terminate() {
            bail!(
                "{} at line {} char {}",
                utf8::Utf8Error::UnexpectedTermination,
                self.line,
                self.ch
            );
        }
        self.tokenizer.finish().map_err(|e| {
            anyhow!("{e} at line {} char {}", self.line, self.ch)
        })?;
        self.drain_tokens()
    }

    fn drain_tokens(&mut self) -> Result<Option<Event>> {
        let mut event = None;
        while let Some(token) = self.tokenizer.emit() {
            if let Some(ev) = self.handle_token(token)? {
                // At most one statement completes per input character.
                debug_assert!(event.is_none());
                event = Some(ev);
            }
        }
        Ok(event)
    }

    /// Performs symbolic substitution: a token beginning with `$` is looked
    /// up among user definitions, `$OP_*` opcode values, `$STINT_*`
    /// interrupt numbers and the automatic symbols. Resolved automatic
    /// symbols are cached in the user map.
    fn substitute(&mut self, token: &Token) -> Result<Vec<u8>> {
        if token.text.first() != Some(&b'$') {
            return Ok(token.text.clone());
        }
        let name = &token.text[1..];
        if name.is_empty() {
            bail!(
                "empty symbol name at line {} char {}",
                token.line,
                token.ch
            );
        }
        if let Some(value) = self.defs.get(name) {
            return Ok(value.clone());
        }

        let resolved = if let Some(opname) = name.strip_prefix(b"OP_") {
            // $OP_XXX where XXX uppercases to a valid mnemonic
            let lower: Vec<u8> =
                opname.iter().map(|b| b.to_ascii_lowercase()).collect();
            opname
                .iter()
                .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
                .then(|| std::str::from_utf8(&lower).ok())
                .flatten()
                .and_then(isa::opcode_for_name)
                .map(|code| code.to_string().into_bytes())
        } else if let Ok(s) = std::str::from_utf8(name) {
            Interrupt::for_name(s)
                .map(|int| u8::from(int).to_string().into_bytes())
                .or_else(|| {
                    autosym(name).map(|val| format!("{val:#x}").into_bytes())
                })
        } else {
            None
        };

        match resolved {
            Some(value) => {
                self.defs.insert(name.to_vec(), value.clone());
                Ok(value)
            }
            None => bail!(
                "undefined symbol \"{}\" at line {} char {}",
                token.display(),
                token.line,
                token.ch
            ),
        }
    }

    fn handle_token(&mut self, token: Token) -> Result<Option<Event>> {
        let symbol = self.substitute(&token)?;
        match self.state {
            State::Default => self.handle_first(&token, &symbol),

            // Intermediate payload states: newline is an error (except the
            // optional section flags slot).
            State::Label1 => {
                self.expect_payload(&token)?;
                if token.is_quoted() {
                    bail!(
                        "invalid label name at line {} char {}",
                        token.line,
                        token.ch
                    );
                }
                self.name = symbol;
                self.state = State::Label2;
                Ok(None)
            }
            State::Include1 => {
                self.expect_payload(&token)?;
                if !token.is_quoted() {
                    bail!(
                        "expected quoted string at line {} char {}",
                        token.line,
                        token.ch
                    );
                }
                self.value = parse_string_lit(&symbol).ok_or_else(|| {
                    anyhow!(
                        "invalid string literal at line {} char {}",
                        token.line,
                        token.ch
                    )
                })?;
                self.state = State::Include2;
                Ok(None)
            }
            State::Section1 => {
                self.expect_payload(&token)?;
                self.sec_addr = self.expect_int(&token, &symbol)? as u64;
                self.state = State::Section2;
                Ok(None)
            }
            State::Section2 => {
                if token.is_newline() {
                    self.state = State::Default;
                    return Ok(Some(Event::Section {
                        addr: self.sec_addr,
                        flags: self.sec_flags,
                    }));
                }
                let flags = self.expect_int(&token, &symbol)?;
                self.sec_flags = u8::try_from(flags).map_err(|_| {
                    anyhow!(
                        "section flags out of range at line {} char {}",
                        token.line,
                        token.ch
                    )
                })?;
                self.state = State::Section3;
                Ok(None)
            }
            State::Define1 => {
                self.expect_payload(&token)?;
                if token.is_quoted() {
                    bail!(
                        "unexpected quoted string at line {} char {}",
                        token.line,
                        token.ch
                    );
                }
                // Definition keys are taken verbatim, not substituted.
                self.name = token.text;
                self.state = State::Define2;
                Ok(None)
            }
            State::Define2 => {
                self.expect_payload(&token)?;
                self.value = symbol;
                self.state = State::Define3;
                Ok(None)
            }
            State::Data1 | State::Push1 | State::Opcode1 => {
                self.expect_payload(&token)?;
                if token.is_quoted() {
                    // String-literal immediates belong to the string table,
                    // which does not exist yet.
                    bail!(
                        "string literal immediate is not supported at line {} char {}",
                        token.line,
                        token.ch
                    );
                }
                self.payload = Some(match parse_int(&symbol) {
                    Some(val) => Payload::Value(val),
                    None => Payload::Label(symbol),
                });
                self.state = match self.state {
                    State::Data1 => State::Data2,
                    State::Push1 => State::Push2,
                    _ => State::Opcode2,
                };
                Ok(None)
            }

            // Terminal states: only a newline is accepted.
            State::Label2 => {
                self.expect_eol(&token)?;
                Ok(Some(Event::Label {
                    name: std::mem::take(&mut self.name),
                }))
            }
            State::Include2 => {
                self.expect_eol(&token)?;
                Ok(Some(Event::Include {
                    path: std::mem::take(&mut self.value),
                }))
            }
            State::Section3 => {
                self.expect_eol(&token)?;
                Ok(Some(Event::Section {
                    addr: self.sec_addr,
                    flags: self.sec_flags,
                }))
            }
            State::Define3 => {
                self.expect_eol(&token)?;
                let key = std::mem::take(&mut self.name);
                let value = std::mem::take(&mut self.value);
                self.defs.insert(key, value);
                Ok(None)
            }
            State::Data2 => {
                self.expect_eol(&token)?;
                self.finish_data(&token)
            }
            State::Push2 => {
                self.expect_eol(&token)?;
                self.finish_push(&token)
            }
            State::Opcode2 => {
                self.expect_eol(&token)?;
                self.finish_inst(&token)
            }
        }
    }

    fn handle_first(
        &mut self,
        token: &Token,
        symbol: &[u8],
    ) -> Result<Option<Event>> {
        self.payload = None;
        self.sec_flags = 0;

        if token.is_newline() {
            return Ok(None); // Empty lines are allowed
        }
        if token.text == b":" {
            self.state = State::Label1;
            return Ok(None);
        }

        // Assembler commands match the raw token, without substitution.
        if let Some(cmd) = asm_cmd(&token.text) {
            self.state = match cmd {
                AsmCmd::Data8 => State::Data1,
                AsmCmd::Data16 => State::Data1,
                AsmCmd::Data32 => State::Data1,
                AsmCmd::Data64 => State::Data1,
                AsmCmd::Define => State::Define1,
                AsmCmd::Include => State::Include1,
                AsmCmd::Section => State::Section1,
                AsmCmd::Strings => bail!(
                    ".strings is not implemented at line {} char {}",
                    token.line,
                    token.ch
                ),
            };
            self.width = match cmd {
                AsmCmd::Data8 => 1,
                AsmCmd::Data16 => 2,
                AsmCmd::Data32 => 4,
                AsmCmd::Data64 => 8,
                _ => 0,
            };
            return Ok(None);
        }

        // Everything else must be an instruction or a push pseudo-op.
        if let Some(code) = std::str::from_utf8(symbol)
            .ok()
            .and_then(isa::opcode_for_name)
        {
            self.opcode = code;
            self.sdt = isa::imm_type_for_opcode(code)
                .expect("opcode from table has an immediate type");
            self.state = if self.sdt == Sdt::Void {
                State::Opcode2
            } else {
                State::Opcode1
            };
            return Ok(None);
        }
        if let Some(width) = psop_width(symbol) {
            self.width = width;
            self.state = State::Push1;
            return Ok(None);
        }
        bail!(
            "unrecognized opcode \"{}\" at line {} char {}",
            String::from_utf8_lossy(symbol),
            token.line,
            token.ch
        )
    }

    fn expect_payload(&self, token: &Token) -> Result<()> {
        if token.is_newline() {
            bail!(
                "unexpected newline at line {} char {}",
                token.line,
                token.ch
            );
        }
        Ok(())
    }

    fn expect_int(&self, token: &Token, symbol: &[u8]) -> Result<i64> {
        parse_int(symbol).ok_or_else(|| {
            anyhow!(
                "invalid integer literal at line {} char {}",
                token.line,
                token.ch
            )
        })
    }

    fn expect_eol(&mut self, token: &Token) -> Result<()> {
        if !token.is_newline() {
            bail!(
                "expected end of line at line {} char {}, found \"{}\"",
                token.line,
                token.ch,
                token.display()
            );
        }
        self.state = State::Default;
        Ok(())
    }

    fn finish_inst(&mut self, token: &Token) -> Result<Option<Event>> {
        let size = self.sdt.size();
        let event = match self.payload.take() {
            None => Event::Inst {
                opcode: self.opcode,
                imm: Vec::new(),
                label: None,
            },
            Some(Payload::Value(val)) => {
                if !self.sdt.admits(val) {
                    bail!(
                        "literal out of bounds for immediate type at line {} char {}",
                        token.line,
                        token.ch
                    );
                }
                Event::Inst {
                    opcode: self.opcode,
                    imm: val.to_le_bytes()[..size].to_vec(),
                    label: None,
                }
            }
            Some(Payload::Label(name)) => Event::Inst {
                opcode: self.opcode,
                imm: vec![0; size],
                label: Some(name),
            },
        };
        Ok(Some(event))
    }

    fn finish_push(&mut self, token: &Token) -> Result<Option<Event>> {
        let dst = self.width;
        let event = match self.payload.take() {
            None => unreachable!("push pseudo-op requires a payload token"),
            Some(Payload::Value(val)) => {
                let src = min_bytes_for_val(val);
                if src > dst {
                    bail!(
                        "literal out of bounds for push{} at line {} char {}",
                        dst * 8,
                        token.line,
                        token.ch
                    );
                }
                Event::Inst {
                    opcode: push_opcode(src, dst, val < 0),
                    imm: val.to_le_bytes()[..src].to_vec(),
                    label: None,
                }
            }
            // A label reference keeps the full pseudo-op width.
            Some(Payload::Label(name)) => Event::Inst {
                opcode: push_opcode(dst, dst, false),
                imm: vec![0; dst],
                label: Some(name),
            },
        };
        Ok(Some(event))
    }

    fn finish_data(&mut self, token: &Token) -> Result<Option<Event>> {
        let width = self.width;
        let sdt = match width {
            1 => Sdt::A8,
            2 => Sdt::A16,
            4 => Sdt::A32,
            _ => Sdt::A64,
        };
        let event = match self.payload.take() {
            None => unreachable!("data directive requires a payload token"),
            Some(Payload::Value(val)) => {
                if !sdt.admits(val) {
                    bail!(
                        "literal out of bounds for data{} at line {} char {}",
                        width * 8,
                        token.line,
                        token.ch
                    );
                }
                Event::Data {
                    bytes: val.to_le_bytes()[..width].to_vec(),
                    label: None,
                }
            }
            Some(Payload::Label(name)) => Event::Data {
                bytes: vec![0; width],
                label: Some(name),
            },
        };
        Ok(Some(event))
    }
}
