//! Block-level G-code parsing: comments, the checksummed line-number
//! prefix, and word extraction. No modal semantics here; that is the
//! canonical machine's job.

/// One G-code word: a letter and its number.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Word {
    pub letter: char,
    pub value: f32,
}

/// A parsed block: its words in order, plus the line number if an N word
/// was present.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Block {
    pub words: Vec<Word>,
    pub line_number: Option<u32>,
}

impl Block {
    /// First value for a letter, if present.
    pub fn word(&self, letter: char) -> Option<f32> {
        self.words
            .iter()
            .find(|w| w.letter == letter)
            .map(|w| w.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("unsupported or malformed word '{0}'")]
    BadWord(char),
    #[error("bad number for word '{0}'")]
    BadNumber(char),
    #[error("checksum failed")]
    ChecksumFailed,
    #[error("unbalanced comment parentheses")]
    UnbalancedComment,
    #[error("gcode command unsupported: {0}{1}")]
    Unsupported(char, i32),
    #[error("modal group violation")]
    ModalGroupViolation,
    #[error("axis word missing")]
    AxisMissing,
    #[error("feed rate not specified")]
    FeedRateMissing,
    #[error("arc specification error")]
    ArcSpecification,
    #[error("input value out of range")]
    ValueRange,
}

/// Strip comments and whitespace, validate the checksum if the line carries
/// one, and split into words.
///
/// Checksummed lines look like `N42 G1 X5*57`: the checksum is the XOR of
/// every byte from the `N` up to but not including the `*`, in decimal.
pub fn parse_block(line: &str) -> Result<Block, ParseError> {
    let line = line.trim();

    // Split off a `*checksum` suffix before anything else; the XOR runs
    // over the raw bytes, comments included.
    let (body, checksum) = match line.rfind('*') {
        Some(pos) => {
            let cs: u32 = line[pos + 1..]
                .trim()
                .parse()
                .map_err(|_| ParseError::ChecksumFailed)?;
            (&line[..pos], Some(cs))
        }
        None => (line, None),
    };

    if let Some(expected) = checksum {
        let mut xor = 0u8;
        for b in body.bytes() {
            xor ^= b;
        }
        if xor as u32 != expected {
            return Err(ParseError::ChecksumFailed);
        }
    }

    let cleaned = strip_comments(body)?;

    let mut block = Block::default();
    let mut chars = cleaned.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        let letter = c.to_ascii_uppercase();
        if !letter.is_ascii_alphabetic() {
            return Err(ParseError::BadWord(c));
        }
        chars.next();

        let mut number = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_ascii_digit() || c == '.' || c == '-' || c == '+' {
                number.push(c);
                chars.next();
            } else if c.is_whitespace() {
                chars.next();
            } else {
                break;
            }
        }
        let value: f32 = number.parse().map_err(|_| ParseError::BadNumber(letter))?;

        if letter == 'N' && block.line_number.is_none() && block.words.is_empty() {
            if value < 0.0 || value.fract() != 0.0 {
                return Err(ParseError::BadNumber('N'));
            }
            block.line_number = Some(value as u32);
        } else {
            block.words.push(Word { letter, value });
        }
    }
    Ok(block)
}

/// Remove `(...)` comments and everything after `;`.
fn strip_comments(line: &str) -> Result<String, ParseError> {
    let mut out = String::with_capacity(line.len());
    let mut depth = 0u32;
    for c in line.chars() {
        match c {
            ';' if depth == 0 => break,
            '(' => depth += 1,
            ')' => {
                depth = depth.checked_sub(1).ok_or(ParseError::UnbalancedComment)?;
            }
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    if depth != 0 {
        return Err(ParseError::UnbalancedComment);
    }
    Ok(out)
}

/// Extract a `({...})` comment payload, used by M100/M101 to carry JSON
/// through the G-code stream. Returns the braces and their contents.
pub fn comment_payload(line: &str) -> Option<&str> {
    let open = line.find("({")?;
    let close = line[open..].find("})")? + open;
    Some(&line[open + 1..close + 1])
}
