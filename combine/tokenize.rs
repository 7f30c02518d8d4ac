// ========================================================================================
//
//                          Whitespace tokenization of matrix lines
//
// ========================================================================================
//
// A line is split into maximal runs of non-whitespace bytes. The tokenizer walks a
// byte cursor with explicit bounds over the line it was given and never copies: every
// token borrows from the line, which itself borrows from the reader's chunk (or its
// spill buffer when the line straddled two chunks).

use std::iter::FusedIterator;

/// Matches C `isspace` in the "C" locale: space, tab, newline, vertical tab, form feed
/// and carriage return.
#[inline(always)]
pub fn is_separator(byte: u8) -> bool {
    matches!(byte, b' ' | b'\t' | b'\n' | 0x0b | 0x0c | b'\r')
}

/// One whitespace-delimited token of a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'a> {
    /// Zero-based position among the line's tokens.
    pub column: usize,
    /// Byte offset of the first byte of the token within the line.
    pub offset: usize,
    pub bytes: &'a [u8],
}

/// A single-pass iterator over the tokens of one line.
#[derive(Debug, Clone)]
pub struct Tokens<'a> {
    line: &'a [u8],
    cursor: usize,
    column: usize,
}

pub fn tokens(line: &[u8]) -> Tokens<'_> {
    Tokens {
        line,
        cursor: 0,
        column: 0,
    }
}

/// Returns the token at `index`, tokenizing no further than needed to reach it.
pub fn nth_token(line: &[u8], index: usize) -> Option<&[u8]> {
    tokens(line).nth(index).map(|token| token.bytes)
}

impl<'a> Iterator for Tokens<'a> {
    type Item = Token<'a>;

    #[inline]
    fn next(&mut self) -> Option<Token<'a>> {
        let line = self.line;
        let len = line.len();
        let mut cursor = self.cursor;

        while cursor < len && is_separator(line[cursor]) {
            cursor += 1;
        }
        if cursor >= len {
            self.cursor = len;
            return None;
        }

        let begin = cursor;
        while cursor < len && !is_separator(line[cursor]) {
            cursor += 1;
        }
        self.cursor = cursor;

        let token = Token {
            column: self.column,
            offset: begin,
            bytes: &line[begin..cursor],
        };
        self.column += 1;
        Some(token)
    }
}

impl FusedIterator for Tokens<'_> {}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(line: &[u8]) -> Vec<&[u8]> {
        tokens(line).map(|t| t.bytes).collect()
    }

    #[test]
    fn mixed_whitespace_separates_tokens_without_empty_tokens() {
        let line = b"  RECIPIENT\tA \t B\r";
        assert_eq!(words(line), vec![&b"RECIPIENT"[..], b"A", b"B"]);
    }

    #[test]
    fn tokens_carry_column_and_offset() {
        let found: Vec<_> = tokens(b"x  yy\tz").collect();
        assert_eq!(found.len(), 3);
        assert_eq!((found[0].column, found[0].offset), (0, 0));
        assert_eq!((found[1].column, found[1].offset), (1, 3));
        assert_eq!((found[2].column, found[2].offset), (2, 6));
        assert_eq!(found[1].bytes, b"yy");
    }

    #[test]
    fn blank_lines_have_no_tokens() {
        assert!(words(b"").is_empty());
        assert!(words(b" \t \r").is_empty());
    }

    #[test]
    fn iterator_stays_exhausted() {
        let mut it = tokens(b"a");
        assert!(it.next().is_some());
        assert!(it.next().is_none());
        assert!(it.next().is_none());
    }

    #[test]
    fn nth_token_picks_the_requested_column() {
        let line = b"0.5 id7 1.5 2.5";
        assert_eq!(nth_token(line, 1), Some(&b"id7"[..]));
        assert_eq!(nth_token(line, 3), Some(&b"2.5"[..]));
        assert_eq!(nth_token(line, 4), None);
    }
}
