//! G-code line tokenizer.
//!
//! Splits a raw G-code line into a command mnemonic, named parameters, and a
//! comment, while keeping the original text around so non-welded lines can be
//! written back byte-identical.
//!
//! Parsing is tolerant by design: a line that does not tokenize yields an
//! empty-command record, which the welder treats as a non-motion line and
//! passes through unchanged. Parameters additionally record the number of
//! decimal places they were written with, feeding the dynamic-precision
//! tracking of the arc emitter.

/// A single named parameter, e.g. `X104.351`.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    /// Parameter letter, uppercased (`X`, `Y`, `Z`, `E`, `F`, ...).
    pub letter: char,
    /// Numeric value.
    pub value: f64,
    /// Decimal places the value was written with in the source.
    pub decimals: u8,
}

/// A tokenized G-code line.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedCommand {
    /// Command mnemonic (`G1`, `M204`, `T0`, ...). Empty when the line holds
    /// no command (blank, comment-only, or unparseable).
    pub command: String,
    /// Parameters in source order.
    pub parameters: Vec<Parameter>,
    /// Comment text after `;`, trimmed. Empty when there is none.
    pub comment: String,
    /// The original line, without the trailing newline.
    pub raw: String,
}

impl ParsedCommand {
    /// True when the line carries no command at all.
    pub fn is_empty(&self) -> bool {
        self.command.is_empty()
    }

    /// True for the linear-move commands the welder can compress.
    pub fn is_linear_move(&self) -> bool {
        self.command == "G0" || self.command == "G1"
    }

    /// Look up a parameter value by letter.
    pub fn parameter(&self, letter: char) -> Option<f64> {
        self.parameters
            .iter()
            .find(|p| p.letter == letter)
            .map(|p| p.value)
    }
}

/// Count decimal places in a numeric token (`"1.250"` -> 3, `"7"` -> 0).
fn count_decimals(token: &str) -> u8 {
    match token.find('.') {
        Some(idx) => (token.len() - idx - 1).min(u8::MAX as usize) as u8,
        None => 0,
    }
}

/// Tokenize one G-code line.
///
/// Handles leading `N` line numbers, trailing `*` checksums, `;` comments,
/// and letter+number words. Unknown or malformed content never fails; it is
/// simply not tokenized and survives in [`ParsedCommand::raw`].
pub fn parse_line(line: &str) -> ParsedCommand {
    let raw = line.trim_end_matches(['\n', '\r']).to_string();

    // Split the code part from the comment.
    let (code, comment) = match raw.find(';') {
        Some(idx) => (&raw[..idx], raw[idx + 1..].trim().to_string()),
        None => (raw.as_str(), String::new()),
    };

    // Anything after a checksum marker is not code.
    let code = match code.find('*') {
        Some(idx) => &code[..idx],
        None => code,
    };

    let mut command = String::new();
    let mut parameters = Vec::new();

    let mut words = code.split_whitespace().peekable();

    // Skip an N-number if present.
    if let Some(word) = words.peek() {
        let mut chars = word.chars();
        if matches!(chars.next(), Some('N') | Some('n')) && chars.all(|c| c.is_ascii_digit()) {
            words.next();
        }
    }

    let mut tokenized = true;
    for word in words {
        let mut chars = word.chars();
        let letter = match chars.next() {
            Some(c) if c.is_ascii_alphabetic() => c.to_ascii_uppercase(),
            _ => continue,
        };
        let rest = chars.as_str();

        if command.is_empty() {
            // First word is the command mnemonic; it must carry a code.
            if !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit() || c == '.') {
                command = format!("{}{}", letter, rest);
            } else {
                // Not a recognizable command; leave the line untokenized.
                tokenized = false;
                break;
            }
        } else if let Ok(value) = rest.parse::<f64>() {
            parameters.push(Parameter {
                letter,
                value,
                decimals: count_decimals(rest),
            });
        }
        // Valueless or malformed parameters are ignored; the raw line keeps
        // them for passthrough.
    }
    if !tokenized {
        command.clear();
        parameters.clear();
    }

    ParsedCommand {
        command,
        parameters,
        comment,
        raw,
    }
}
