//! Token stream over decoded code points.
//!
//! Barewords are runs of letters, digits, `. - _ \ '` and anything
//! non-ASCII; those characters always continue a token even where they
//! overlap the operator set. The remaining single-character operators each
//! produce their own token, `"` opens a quoted token (both quotes are kept
//! in the token text so consumers can tell quoted from bare), and `;`
//! starts a comment that runs to the end of the line.
//!
//! The tokenizer is lazy: each input character enqueues zero, one or two
//! tokens (closing the current bareword and emitting an operator is the
//! two-token case), which the caller drains with [`Tokenizer::emit`].

use std::collections::VecDeque;

use crate::utf8::{encode_into, Ucp};

/// Single-character operators, with the bareword-continuation overlap
/// (`. - ' \`) resolved in favour of barewords.
const SCOS: &[u8] = b"\n!#%&()*+,/:<=>?@[]^`{|}~";

fn is_sco(c: Ucp) -> bool {
    c < 0x80 && SCOS.contains(&(c as u8))
}

fn is_space(c: Ucp) -> bool {
    matches!(c, 0x09..=0x0d | 0x20)
}

fn is_word_char(c: Ucp) -> bool {
    !is_space(c) && !is_sco(c) && c != Ucp::from(b'"') && c != Ucp::from(b';')
}

/// A token with the source position of its first character.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub text: Vec<u8>,
    pub line: u32,
    pub ch: u32,
}

impl Token {
    /// Lossy rendition for error messages.
    pub fn display(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.text)
    }

    pub fn is_newline(&self) -> bool {
        self.text == b"\n"
    }

    pub fn is_quoted(&self) -> bool {
        self.text.first() == Some(&b'"')
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenizeError {
    /// The stream ended inside a quoted token.
    UnterminatedQuote,
}

impl std::fmt::Display for TokenizeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("unterminated quoted token")
    }
}

impl std::error::Error for TokenizeError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Default,
    Comment,
    Quoted,
    QuotedEsc,
}

#[derive(Debug)]
pub struct Tokenizer {
    state: State,
    current: Option<Token>,
    queue: VecDeque<Token>,
    line: u32,
    ch: u32,
}

impl Default for Tokenizer {
    fn default() -> Self {
        Tokenizer::new()
    }
}

impl Tokenizer {
    pub fn new() -> Self {
        Tokenizer {
            state: State::Default,
            current: None,
            queue: VecDeque::new(),
            line: 1,
            ch: 1,
        }
    }

    fn push_char(&mut self, c: Ucp) {
        let token = self.current.get_or_insert_with(|| Token {
            text: Vec::new(),
            line: self.line,
            ch: self.ch,
        });
        // Code points come from the decoder and are always encodable.
        encode_into(c, &mut token.text).expect("decoded code point in range");
    }

    fn enqueue_current(&mut self) {
        if let Some(token) = self.current.take() {
            self.queue.push_back(token);
        }
    }

    /// Feeds one decoded code point.
    pub fn parse(&mut self, c: Ucp) {
        match self.state {
            State::Default => {
                if is_word_char(c) {
                    self.push_char(c);
                } else {
                    self.enqueue_current();
                    if is_sco(c) {
                        self.push_char(c);
                        self.enqueue_current();
                    } else if c == Ucp::from(b'"') {
                        self.push_char(c);
                        self.state = State::Quoted;
                    } else if c == Ucp::from(b';') {
                        self.state = State::Comment;
                    }
                    // Remaining whitespace just separates tokens.
                }
            }
            State::Comment => {
                if c == Ucp::from(b'\n') {
                    self.push_char(c);
                    self.enqueue_current();
                    self.state = State::Default;
                }
            }
            State::Quoted => {
                self.push_char(c);
                if c == Ucp::from(b'"') {
                    self.enqueue_current();
                    self.state = State::Default;
                } else if c == Ucp::from(b'\\') {
                    self.state = State::QuotedEsc;
                }
            }
            State::QuotedEsc => {
                self.push_char(c);
                self.state = State::Quoted;
            }
        }

        if c == Ucp::from(b'\n') {
            self.line += 1;
            self.ch = 1;
        } else {
            self.ch += 1;
        }
    }

    /// Dequeues the next pending token, if any.
    pub fn emit(&mut self) -> Option<Token> {
        self.queue.pop_front()
    }

    /// Ends the stream. Acts as a final newline so the last line needs no
    /// terminator; fails if the stream ends inside a quoted token.
    pub fn finish(&mut self) -> Result<(), TokenizeError> {
        if matches!(self.state, State::Quoted | State::QuotedEsc) {
            return Err(TokenizeError::UnterminatedQuote);
        }
        self.parse(Ucp::from(b'\n'));
        Ok(())
    }
}
