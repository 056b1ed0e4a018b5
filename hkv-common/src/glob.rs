//! # Glob Matching
//!
//! Purpose: Implement the Redis `KEYS` glob dialect directly as a bytewise
//! matcher rather than translating to a general-purpose regex engine.
//!
//! Supported syntax: `?` (any single byte), `*` (any run, including empty),
//! `[...]` character classes with `^` negation and `a-z` ranges, and `\x`
//! to match `x` literally (escaping any of the special characters above).
//!
//! ## Design Principles
//! 1. **Compile Once**: `GlobPattern::compile` parses the pattern into a
//!    token list a single time; `matches` re-walks the tokens per key with
//!    no further allocation beyond the backtracking stack.
//! 2. **Byte-Exact**: Operates on raw bytes, not `str`, since keys are
//!    arbitrary binary data on the wire.

#[derive(Debug, Clone)]
enum Token {
    Literal(u8),
    AnyOne,
    AnyRun,
    Class { negate: bool, ranges: Vec<(u8, u8)> },
}

/// A compiled glob pattern ready for repeated matching.
#[derive(Debug, Clone)]
pub struct GlobPattern {
    tokens: Vec<Token>,
}

impl GlobPattern {
    /// Compiles a pattern; unterminated character classes fall back to
    /// treating `[` as a literal rather than erroring, matching the
    /// permissive behavior expected of `KEYS`.
    pub fn compile(pattern: &[u8]) -> Self {
        let mut tokens = Vec::new();
        let mut i = 0;
        while i < pattern.len() {
            match pattern[i] {
                b'\\' if i + 1 < pattern.len() => {
                    tokens.push(Token::Literal(pattern[i + 1]));
                    i += 2;
                }
                b'?' => {
                    tokens.push(Token::AnyOne);
                    i += 1;
                }
                b'*' => {
                    tokens.push(Token::AnyRun);
                    i += 1;
                }
                b'[' => match parse_class(&pattern[i..]) {
                    Some((token, consumed)) => {
                        tokens.push(token);
                        i += consumed;
                    }
                    None => {
                        tokens.push(Token::Literal(b'['));
                        i += 1;
                    }
                },
                other => {
                    tokens.push(Token::Literal(other));
                    i += 1;
                }
            }
        }
        GlobPattern { tokens }
    }

    /// Returns true if `key` matches the compiled pattern.
    pub fn matches(&self, key: &[u8]) -> bool {
        match_from(&self.tokens, key)
    }
}

fn parse_class(rest: &[u8]) -> Option<(Token, usize)> {
    // rest[0] == b'['
    let mut i = 1;
    let mut negate = false;
    if rest.get(i) == Some(&b'^') {
        negate = true;
        i += 1;
    }
    let mut ranges = Vec::new();
    let start = i;
    while i < rest.len() && rest[i] != b']' {
        if rest[i] == b'-' && i > start && i + 1 < rest.len() && rest[i + 1] != b']' {
            // extend the previous single-char range into a range.
            let lo = ranges.pop().map(|(lo, _): (u8, u8)| lo).unwrap_or(rest[i - 1]);
            ranges.push((lo, rest[i + 1]));
            i += 2;
        } else {
            ranges.push((rest[i], rest[i]));
            i += 1;
        }
    }
    if i >= rest.len() {
        return None; // unterminated class
    }
    Some((Token::Class { negate, ranges }, i + 1))
}

fn class_matches(negate: bool, ranges: &[(u8, u8)], byte: u8) -> bool {
    let hit = ranges.iter().any(|&(lo, hi)| byte >= lo && byte <= hi);
    hit != negate
}

fn match_from(tokens: &[Token], input: &[u8]) -> bool {
    match tokens.first() {
        None => input.is_empty(),
        Some(Token::AnyRun) => {
            // Try every split point; this is the only backtracking point.
            for split in 0..=input.len() {
                if match_from(&tokens[1..], &input[split..]) {
                    return true;
                }
            }
            false
        }
        Some(Token::AnyOne) => {
            !input.is_empty() && match_from(&tokens[1..], &input[1..])
        }
        Some(Token::Literal(byte)) => {
            !input.is_empty() && input[0] == *byte && match_from(&tokens[1..], &input[1..])
        }
        Some(Token::Class { negate, ranges }) => {
            !input.is_empty()
                && class_matches(*negate, ranges, input[0])
                && match_from(&tokens[1..], &input[1..])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(pattern: &str, key: &str) -> bool {
        GlobPattern::compile(pattern.as_bytes()).matches(key.as_bytes())
    }

    #[test]
    fn question_mark_matches_single_byte() {
        assert!(m("h?llo", "hello"));
        assert!(m("h?llo", "hallo"));
        assert!(!m("h?llo", "hllo"));
    }

    #[test]
    fn star_matches_any_run() {
        assert!(m("h*llo", "hllo"));
        assert!(m("h*llo", "heeeello"));
        assert!(m("*", ""));
        assert!(m("*", "anything"));
    }

    #[test]
    fn class_matches_set_and_range() {
        assert!(m("h[ae]llo", "hello"));
        assert!(m("h[ae]llo", "hallo"));
        assert!(!m("h[ae]llo", "hillo"));
        assert!(!m("h[^e]llo", "hello"));
        assert!(m("h[^e]llo", "hallo"));
        assert!(m("h[a-b]llo", "hallo"));
        assert!(m("h[a-b]llo", "hbllo"));
        assert!(!m("h[a-b]llo", "hcllo"));
    }

    #[test]
    fn backslash_escapes_special_bytes() {
        assert!(m(r"h\*llo", "h*llo"));
        assert!(!m(r"h\*llo", "hello"));
    }

    #[test]
    fn unterminated_class_is_literal() {
        assert!(m("h[llo", "h[llo"));
    }
}
