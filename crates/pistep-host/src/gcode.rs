//! G-code line parsing.
//!
//! Turns raw text lines into structured commands: a command word (`G1`,
//! `M104`, ...) plus parameter words (`X10.5`, `F3000`, `S200`). Comments
//! (`;` to end of line, parenthesized inline), `N` line numbers and `*`
//! checksums are stripped; commands are case-insensitive.

use std::collections::HashMap;

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum GcodeError {
    #[error("command word '{0}' is malformed")]
    MalformedWord(String),

    #[error("line does not start with a command letter")]
    MissingCommand,
}

/// One parsed command: `letter` and `number` identify it (`('G', 1)`), and
/// `params` holds the argument words. A bare parameter letter (e.g. `M84 X`)
/// is stored with no value.
#[derive(Debug, Clone, PartialEq)]
pub struct GcodeCommand {
    pub letter: char,
    pub number: u16,
    pub params: HashMap<char, Option<f64>>,
}

impl GcodeCommand {
    /// The numeric value of a parameter, if present with a value.
    pub fn value(&self, letter: char) -> Option<f64> {
        self.params.get(&letter).copied().flatten()
    }

    pub fn has(&self, letter: char) -> bool {
        self.params.contains_key(&letter)
    }
}

/// Strip comments: everything after `;`, and any `( ... )` groups.
fn strip_comments(line: &str) -> String {
    let before_semicolon = line.split(';').next().unwrap_or("");
    let mut out = String::with_capacity(before_semicolon.len());
    let mut depth = 0u32;
    for ch in before_semicolon.chars() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ if depth == 0 => out.push(ch),
            _ => {}
        }
    }
    out
}

/// Parse one line. Returns `Ok(None)` for empty/comment-only lines.
pub fn parse_line(line: &str) -> Result<Option<GcodeCommand>, GcodeError> {
    let cleaned = strip_comments(line);
    // The checksum (if any) covers the rest of the line; we don't verify it,
    // just drop it along with anything after.
    let cleaned = cleaned.split('*').next().unwrap_or("");

    let mut words = Vec::new();
    for raw in cleaned.split_whitespace() {
        let mut chars = raw.chars();
        let letter = match chars.next() {
            Some(c) if c.is_ascii_alphabetic() => c.to_ascii_uppercase(),
            Some(_) => return Err(GcodeError::MalformedWord(raw.to_string())),
            None => continue,
        };
        let rest = chars.as_str();
        let value = if rest.is_empty() {
            None
        } else {
            Some(
                rest.parse::<f64>()
                    .map_err(|_| GcodeError::MalformedWord(raw.to_string()))?,
            )
        };
        words.push((letter, value));
    }

    // Drop a leading N<line-number> word.
    let mut words = words.into_iter().peekable();
    if matches!(words.peek(), Some(('N', _))) {
        words.next();
    }

    let (letter, number) = match words.next() {
        None => return Ok(None),
        Some((letter @ ('G' | 'M' | 'T'), Some(number))) if number >= 0.0 => {
            (letter, number as u16)
        }
        Some((letter, value)) => {
            return Err(GcodeError::MalformedWord(format!(
                "{letter}{}",
                value.map(|v| v.to_string()).unwrap_or_default()
            )))
        }
    };

    let params = words.collect();
    Ok(Some(GcodeCommand {
        letter,
        number,
        params,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_move() {
        let cmd = parse_line("G1 X10.5 Y-3 F3000").unwrap().unwrap();
        assert_eq!((cmd.letter, cmd.number), ('G', 1));
        assert_eq!(cmd.value('X'), Some(10.5));
        assert_eq!(cmd.value('Y'), Some(-3.0));
        assert_eq!(cmd.value('F'), Some(3000.0));
        assert_eq!(cmd.value('Z'), None);
    }

    #[test]
    fn lowercase_and_whitespace_are_tolerated() {
        let cmd = parse_line("  g28  x ").unwrap().unwrap();
        assert_eq!((cmd.letter, cmd.number), ('G', 28));
        assert!(cmd.has('X'));
        assert_eq!(cmd.value('X'), None);
    }

    #[test]
    fn comments_and_blank_lines_yield_nothing() {
        assert_eq!(parse_line(""), Ok(None));
        assert_eq!(parse_line("; just a comment"), Ok(None));
        assert_eq!(parse_line("(whole line comment)"), Ok(None));
        let cmd = parse_line("G1 X1 ; trailing words").unwrap().unwrap();
        assert_eq!(cmd.value('X'), Some(1.0));
        let cmd = parse_line("G1 (inline) X2").unwrap().unwrap();
        assert_eq!(cmd.value('X'), Some(2.0));
    }

    #[test]
    fn line_numbers_and_checksums_are_stripped() {
        let cmd = parse_line("N42 M104 S205 *31").unwrap().unwrap();
        assert_eq!((cmd.letter, cmd.number), ('M', 104));
        assert_eq!(cmd.value('S'), Some(205.0));
    }

    #[test]
    fn malformed_words_are_rejected() {
        assert!(parse_line("G1 X1 2Y").is_err());
        assert!(parse_line("G1 Xabc").is_err());
        assert!(parse_line("X5 Y2").is_err());
    }

    #[test]
    fn decimal_command_numbers_truncate() {
        // G28.1-style variants collapse onto their base command.
        let cmd = parse_line("G28.1").unwrap().unwrap();
        assert_eq!((cmd.letter, cmd.number), ('G', 28));
    }
}
