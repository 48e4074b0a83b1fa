//! Character, string and integer literal parsing shared by the parser and
//! assembler.

/// Parses one character (possibly an escape sequence) from the front of
/// `s`, returning the value and the remaining bytes. `None` on an invalid
/// escape, an empty input, or a bare newline.
pub fn parse_char_lit(s: &[u8]) -> Option<(u8, &[u8])> {
    match s.split_first()? {
        (b'\\', rest) => parse_escape(rest),
        (b'\n', _) => None,
        (c, rest) => Some((*c, rest)),
    }
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn parse_escape(s: &[u8]) -> Option<(u8, &[u8])> {
    let (c, mut rest) = s.split_first()?;
    let val = match c {
        b'a' => 0x07,
        b'b' => 0x08,
        b'f' => 0x0c,
        b'n' => b'\n',
        b'r' => b'\r',
        b't' => b'\t',
        b'v' => 0x0b,
        b'\\' => b'\\',
        b'\'' => b'\'',
        b'"' => b'"',
        b'?' => b'?',
        b'x' => {
            // Hexadecimal escapes are of arbitrary length
            let mut val: u8 = hex_digit(*rest.first()?)?;
            rest = &rest[1..];
            while let Some(d) = rest.first().and_then(|b| hex_digit(*b)) {
                val = val.wrapping_shl(4) | d;
                rest = &rest[1..];
            }
            return Some((val, rest));
        }
        b'0'..=b'7' => {
            // Octal escapes have at most three digits
            let mut val = c - b'0';
            for _ in 0..2 {
                match rest.first() {
                    Some(d @ b'0'..=b'7') => {
                        val = val.wrapping_shl(3).wrapping_add(d - b'0');
                        rest = &rest[1..];
                    }
                    _ => break,
                }
            }
            return Some((val, rest));
        }
        _ => return None,
    };
    Some((val, rest))
}

/// Unescapes a quoted string token (both quotes included, as the tokenizer
/// produces them). `None` if the token is malformed.
pub fn parse_string_lit(s: &[u8]) -> Option<Vec<u8>> {
    let mut rest = s.strip_prefix(b"\"")?;
    let mut out = Vec::new();
    while let Some(c) = rest.first() {
        if *c == b'"' {
            // The literal must end at the first unescaped quote
            return (rest.len() == 1).then_some(out);
        }
        let (val, r) = parse_char_lit(rest)?;
        out.push(val);
        rest = r;
    }
    None
}

/// Parses an integer literal: `'c'` character notation (with C escapes),
/// `0x` hexadecimal, or decimal, each with an optional leading `-`.
/// Accumulation wraps, so the full 64-bit unsigned range is expressible
/// (e.g. `0xffffffffffffffff` parses as `-1`).
pub fn parse_int(s: &[u8]) -> Option<i64> {
    if s.is_empty() {
        return None;
    }

    // Character notation such as 'c' or '\n'
    if let Some(rest) = s.strip_prefix(b"'") {
        let (val, rest) = parse_char_lit(rest)?;
        if rest != b"'" {
            return None;
        }
        return Some(i64::from(val as i8));
    }

    let (neg, digits) = match s.strip_prefix(b"-") {
        Some(rest) if !rest.is_empty() => (true, rest),
        Some(_) => return None,
        None => (false, s),
    };

    let mut val: i64 = 0;
    if let Some(hex) = digits
        .strip_prefix(b"0x")
        .or_else(|| digits.strip_prefix(b"0X"))
    {
        if hex.is_empty() {
            return None;
        }
        for b in hex {
            val = val.wrapping_mul(0x10).wrapping_add(i64::from(hex_digit(*b)?));
        }
    } else {
        for b in digits {
            if !b.is_ascii_digit() {
                return None;
            }
            val = val.wrapping_mul(10).wrapping_add(i64::from(b - b'0'));
        }
    }

    Some(if neg { val.wrapping_neg() } else { val })
}

/// Minimum number of bytes needed to represent `val`, treating non-negative
/// values up to the unsigned maximum of each width as representable.
pub fn min_bytes_for_val(val: i64) -> usize {
    if val < i64::from(i32::MIN) {
        8
    } else if val < i64::from(i16::MIN) {
        4
    } else if val < i64::from(i8::MIN) {
        2
    } else if val <= 0xff {
        1
    } else if val <= 0xffff {
        2
    } else if val <= 0xffff_ffff {
        4
    } else {
        8
    }
}
