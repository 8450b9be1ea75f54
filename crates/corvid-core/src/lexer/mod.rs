//! Lexer for corvid source text
//!
//! Most tokens come straight from the logos-generated [`TokenKind`] lexer.
//! The driver handles the parts of the grammar a regular language cannot:
//! - long brackets (`[[...]]`, `[==[...]==]`) for strings and comments
//! - backtick strings with `{expr}` interpolation, which nest
//!
//! String escapes are decoded later by [`unescape`] so the parser can report
//! errors with precise spans.

mod span;
mod token;

pub use span::{LineIndex, Location, Span};
pub use token::TokenKind;

use logos::Logos;
use thiserror::Error;

/// A token with its kind, span, and source text
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
    /// Source text; for long strings this is the contents without brackets
    pub lexeme: String,
}

impl Token {
    #[must_use]
    pub fn new(kind: TokenKind, span: Span, lexeme: impl Into<String>) -> Self {
        Self {
            kind,
            span,
            lexeme: lexeme.into(),
        }
    }
}

/// Lexer error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LexError {
    #[error("unexpected character '{0}'")]
    UnexpectedChar(char),
    #[error("unfinished string")]
    UnterminatedString,
    #[error("unfinished long string")]
    UnterminatedLongString,
    #[error("unfinished long comment")]
    UnterminatedComment,
    #[error("invalid escape sequence '\\{0}'")]
    InvalidEscape(char),
    #[error("decimal escape too large")]
    EscapeTooLarge,
    #[error("unmatched '}}' in interpolated string")]
    UnmatchedCloseBrace,
}

/// A lexer error with location information
#[derive(Debug, Clone, PartialEq)]
pub struct SpannedError {
    pub error: LexError,
    pub span: Span,
}

impl SpannedError {
    #[must_use]
    pub fn new(error: LexError, span: Span) -> Self {
        Self { error, span }
    }
}

impl std::fmt::Display for SpannedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at {}", self.error, self.span)
    }
}

impl std::error::Error for SpannedError {}

/// Where the driver currently is relative to backtick strings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LexerMode {
    Normal,
    /// Between the backticks of an interpolated string
    Interp,
    /// Inside `{ ... }` of an interpolated string; depth counts open braces
    Embedded { depth: u32 },
}

/// The corvid lexer
pub struct Lexer<'source> {
    source: &'source str,
    position: usize,
    mode: LexerMode,
    mode_stack: Vec<LexerMode>,
    errors: Vec<SpannedError>,
}

impl<'source> Lexer<'source> {
    #[must_use]
    pub fn new(source: &'source str) -> Self {
        Self {
            source,
            position: 0,
            mode: LexerMode::Normal,
            mode_stack: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Tokenize the entire source, returning all tokens and any errors
    #[must_use]
    pub fn tokenize(source: &str) -> (Vec<Token>, Vec<SpannedError>) {
        let mut lexer = Lexer::new(source);
        let mut tokens = Vec::new();
        loop {
            let token = lexer.next_token();
            let done = token.kind == TokenKind::Eof;
            tokens.push(token);
            if done {
                break;
            }
        }
        (tokens, lexer.errors)
    }

    /// Produce the next token; returns `Eof` forever once input is exhausted
    pub fn next_token(&mut self) -> Token {
        match self.mode {
            LexerMode::Interp => self.lex_interp_text(),
            LexerMode::Normal | LexerMode::Embedded { .. } => self.lex_code(),
        }
    }

    #[must_use]
    pub fn errors(&self) -> &[SpannedError] {
        &self.errors
    }

    fn span(start: usize, end: usize) -> Span {
        Span::new(start as u32, end as u32)
    }

    fn eof(&self) -> Token {
        Token::new(TokenKind::Eof, Span::point(self.source.len() as u32), "")
    }

    /// Skip whitespace, line comments and long comments
    fn skip_trivia(&mut self) {
        let bytes = self.source.as_bytes();
        loop {
            while self.position < bytes.len() && bytes[self.position].is_ascii_whitespace() {
                self.position += 1;
            }
            if !self.source[self.position..].starts_with("--") {
                return;
            }
            let comment_start = self.position;
            self.position += 2;
            if let Some(level) = long_bracket_level(&self.source[self.position..]) {
                let body_start = self.position + level + 2;
                match find_long_close(&self.source[body_start..], level) {
                    Some(len) => self.position = body_start + len + level + 2,
                    None => {
                        self.errors.push(SpannedError::new(
                            LexError::UnterminatedComment,
                            Self::span(comment_start, self.source.len()),
                        ));
                        self.position = self.source.len();
                    }
                }
            } else {
                while self.position < bytes.len() && bytes[self.position] != b'\n' {
                    self.position += 1;
                }
            }
        }
    }

    /// Lex ordinary code (outside backticks or inside `{}` of one)
    fn lex_code(&mut self) -> Token {
        self.skip_trivia();
        if self.position >= self.source.len() {
            if self.mode != LexerMode::Normal {
                self.errors.push(SpannedError::new(
                    LexError::UnterminatedString,
                    Span::point(self.source.len() as u32),
                ));
                self.mode = LexerMode::Normal;
            }
            return self.eof();
        }

        let start = self.position;
        let remaining = &self.source[start..];

        if let Some(level) = long_bracket_level(remaining) {
            return self.lex_long_string(start, level);
        }

        if let LexerMode::Embedded { depth } = self.mode {
            if remaining.starts_with('}') && depth == 1 {
                self.position += 1;
                self.mode = self.mode_stack.pop().unwrap_or(LexerMode::Normal);
                return Token::new(TokenKind::InterpClose, Self::span(start, start + 1), "}");
            }
        }

        let mut logos_lexer = TokenKind::lexer(remaining);
        match logos_lexer.next() {
            Some(Ok(kind)) => {
                let range = logos_lexer.span();
                let token_start = start + range.start;
                let token_end = start + range.end;
                self.position = token_end;
                self.track_braces(kind);
                Token::new(
                    kind,
                    Self::span(token_start, token_end),
                    &self.source[token_start..token_end],
                )
            }
            Some(Err(())) => {
                let range = logos_lexer.span();
                let token_start = start + range.start;
                let bad = self.source[token_start..].chars().next().unwrap_or('\0');
                let token_end = token_start + bad.len_utf8().max(1);
                self.position = token_end;
                let error = if matches!(bad, '"' | '\'') {
                    LexError::UnterminatedString
                } else {
                    LexError::UnexpectedChar(bad)
                };
                self.errors
                    .push(SpannedError::new(error, Self::span(token_start, token_end)));
                Token::new(
                    TokenKind::Error,
                    Self::span(token_start, token_end),
                    &self.source[token_start..token_end],
                )
            }
            None => {
                self.position = self.source.len();
                self.eof()
            }
        }
    }

    /// Maintain interpolation state after a code token
    fn track_braces(&mut self, kind: TokenKind) {
        match kind {
            TokenKind::InterpStart => {
                self.mode_stack.push(self.mode);
                self.mode = LexerMode::Interp;
            }
            TokenKind::LBrace => {
                if let LexerMode::Embedded { depth } = &mut self.mode {
                    *depth += 1;
                }
            }
            TokenKind::RBrace => {
                if let LexerMode::Embedded { depth } = &mut self.mode {
                    *depth = depth.saturating_sub(1);
                }
            }
            _ => {}
        }
    }

    fn lex_long_string(&mut self, start: usize, level: usize) -> Token {
        let body_start = start + level + 2;
        match find_long_close(&self.source[body_start..], level) {
            Some(len) => {
                let body = &self.source[body_start..body_start + len];
                // A newline directly after the opening bracket is not part of the string
                let body = body
                    .strip_prefix("\r\n")
                    .or_else(|| body.strip_prefix('\n'))
                    .unwrap_or(body);
                self.position = body_start + len + level + 2;
                Token::new(
                    TokenKind::LongString,
                    Self::span(start, self.position),
                    body,
                )
            }
            None => {
                self.position = self.source.len();
                self.errors.push(SpannedError::new(
                    LexError::UnterminatedLongString,
                    Self::span(start, self.position),
                ));
                Token::new(
                    TokenKind::Error,
                    Self::span(start, self.position),
                    &self.source[start..],
                )
            }
        }
    }

    /// Lex literal text between the backticks of an interpolated string
    fn lex_interp_text(&mut self) -> Token {
        let start = self.position;
        let bytes = self.source.as_bytes();
        let mut i = start;

        while i < bytes.len() {
            match bytes[i] {
                b'`' => {
                    if i > start {
                        self.position = i;
                        return Token::new(
                            TokenKind::InterpText,
                            Self::span(start, i),
                            &self.source[start..i],
                        );
                    }
                    self.position = i + 1;
                    self.mode = self.mode_stack.pop().unwrap_or(LexerMode::Normal);
                    return Token::new(TokenKind::InterpEnd, Self::span(i, i + 1), "`");
                }
                b'{' => {
                    if i > start {
                        self.position = i;
                        return Token::new(
                            TokenKind::InterpText,
                            Self::span(start, i),
                            &self.source[start..i],
                        );
                    }
                    self.position = i + 1;
                    self.mode_stack.push(LexerMode::Interp);
                    self.mode = LexerMode::Embedded { depth: 1 };
                    return Token::new(TokenKind::InterpOpen, Self::span(i, i + 1), "{");
                }
                b'}' => {
                    self.errors.push(SpannedError::new(
                        LexError::UnmatchedCloseBrace,
                        Self::span(i, i + 1),
                    ));
                    i += 1;
                }
                b'\\' => i += 2,
                b'\n' => break,
                _ => i += 1,
            }
        }

        let end = i.min(bytes.len());
        self.errors.push(SpannedError::new(
            LexError::UnterminatedString,
            Self::span(start, end),
        ));
        self.position = end;
        self.mode = self.mode_stack.pop().unwrap_or(LexerMode::Normal);
        Token::new(
            TokenKind::Error,
            Self::span(start, end),
            &self.source[start..end],
        )
    }
}

/// If `text` starts with `[[` or `[=*[`, return the number of `=` signs
fn long_bracket_level(text: &str) -> Option<usize> {
    let rest = text.strip_prefix('[')?;
    let level = rest.bytes().take_while(|&b| b == b'=').count();
    (rest.as_bytes().get(level) == Some(&b'[')).then_some(level)
}

/// Length of the body before the matching `]=*]` closer
fn find_long_close(body: &str, level: usize) -> Option<usize> {
    let closer = format!("]{}]", "=".repeat(level));
    body.find(&closer)
}

/// Decode the escape sequences of a quoted or interpolated string body.
///
/// `raw` excludes the surrounding quotes. The result is a byte string since
/// `\xFF` and `\ddd` may produce invalid UTF-8.
pub fn unescape(raw: &str) -> Result<Vec<u8>, LexError> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if b != b'\\' {
            out.push(b);
            i += 1;
            continue;
        }
        i += 1;
        let Some(&escape) = bytes.get(i) else {
            return Err(LexError::UnterminatedString);
        };
        i += 1;
        match escape {
            b'n' => out.push(b'\n'),
            b't' => out.push(b'\t'),
            b'r' => out.push(b'\r'),
            b'a' => out.push(0x07),
            b'b' => out.push(0x08),
            b'f' => out.push(0x0C),
            b'v' => out.push(0x0B),
            b'\\' | b'"' | b'\'' | b'`' | b'{' | b'}' => out.push(escape),
            b'\n' => out.push(b'\n'),
            b'\r' => {
                out.push(b'\n');
                if bytes.get(i) == Some(&b'\n') {
                    i += 1;
                }
            }
            b'z' => {
                while i < bytes.len() && bytes[i].is_ascii_whitespace() {
                    i += 1;
                }
            }
            b'x' => {
                let hex = raw.get(i..i + 2).ok_or(LexError::InvalidEscape('x'))?;
                let value = u8::from_str_radix(hex, 16).map_err(|_| LexError::InvalidEscape('x'))?;
                out.push(value);
                i += 2;
            }
            b'u' => {
                if bytes.get(i) != Some(&b'{') {
                    return Err(LexError::InvalidEscape('u'));
                }
                let close = raw[i..].find('}').ok_or(LexError::InvalidEscape('u'))? + i;
                let code = u32::from_str_radix(&raw[i + 1..close], 16)
                    .map_err(|_| LexError::InvalidEscape('u'))?;
                let ch = char::from_u32(code).ok_or(LexError::InvalidEscape('u'))?;
                let mut buf = [0u8; 4];
                out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
                i = close + 1;
            }
            b'0'..=b'9' => {
                let mut value = u32::from(escape - b'0');
                let mut digits = 1;
                while digits < 3 && i < bytes.len() && bytes[i].is_ascii_digit() {
                    value = value * 10 + u32::from(bytes[i] - b'0');
                    i += 1;
                    digits += 1;
                }
                let byte = u8::try_from(value).map_err(|_| LexError::EscapeTooLarge)?;
                out.push(byte);
            }
            other => {
                let ch = raw[i - 1..].chars().next().unwrap_or(other as char);
                return Err(LexError::InvalidEscape(ch));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        Lexer::tokenize(source).0.into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn lex_keywords_and_names() {
        assert_eq!(
            kinds("local function continue end"),
            vec![
                TokenKind::Local,
                TokenKind::Function,
                TokenKind::Name,
                TokenKind::End,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn lex_numbers() {
        assert_eq!(
            kinds("1 2.5 .5 1e10 0xff 0b101 1_000"),
            vec![
                TokenKind::Number,
                TokenKind::Number,
                TokenKind::Number,
                TokenKind::Number,
                TokenKind::HexNumber,
                TokenKind::BinaryNumber,
                TokenKind::Number,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn lex_operators_longest_match() {
        assert_eq!(
            kinds("a //= b .. c ... ~= ..="),
            vec![
                TokenKind::Name,
                TokenKind::SlashSlashAssign,
                TokenKind::Name,
                TokenKind::DotDot,
                TokenKind::Name,
                TokenKind::Ellipsis,
                TokenKind::NotEq,
                TokenKind::DotDotAssign,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            kinds("x -- line\n--[[ block\n still ]] y --[==[ ]] ]==] z"),
            vec![
                TokenKind::Name,
                TokenKind::Name,
                TokenKind::Name,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn long_string_strips_first_newline() {
        let (tokens, errors) = Lexer::tokenize("[==[\nhello ]] world]==]");
        assert!(errors.is_empty());
        assert_eq!(tokens[0].kind, TokenKind::LongString);
        assert_eq!(tokens[0].lexeme, "hello ]] world");
    }

    #[test]
    fn quoted_strings() {
        let (tokens, _) = Lexer::tokenize(r#"'it\'s' "a\"b""#);
        assert_eq!(tokens[0].kind, TokenKind::QuotedString);
        assert_eq!(tokens[0].lexeme, r"'it\'s'");
        assert_eq!(tokens[1].kind, TokenKind::QuotedString);
    }

    #[test]
    fn interpolated_string_tokens() {
        assert_eq!(
            kinds("`a {x + {1}[1]} b`"),
            vec![
                TokenKind::InterpStart,
                TokenKind::InterpText,
                TokenKind::InterpOpen,
                TokenKind::Name,
                TokenKind::Plus,
                TokenKind::LBrace,
                TokenKind::Number,
                TokenKind::RBrace,
                TokenKind::LBracket,
                TokenKind::Number,
                TokenKind::RBracket,
                TokenKind::InterpClose,
                TokenKind::InterpText,
                TokenKind::InterpEnd,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn nested_interpolation() {
        let (tokens, errors) = Lexer::tokenize("`{`{1}`}`");
        assert!(errors.is_empty(), "{errors:?}");
        let kinds: Vec<_> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::InterpStart,
                TokenKind::InterpOpen,
                TokenKind::InterpStart,
                TokenKind::InterpOpen,
                TokenKind::Number,
                TokenKind::InterpClose,
                TokenKind::InterpEnd,
                TokenKind::InterpClose,
                TokenKind::InterpEnd,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn unterminated_string_reports_error() {
        let (_, errors) = Lexer::tokenize("x = 'abc");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error, LexError::UnterminatedString);
    }

    #[test]
    fn unexpected_character() {
        let (tokens, errors) = Lexer::tokenize("a $ b");
        assert_eq!(tokens[1].kind, TokenKind::Error);
        assert_eq!(errors[0].error, LexError::UnexpectedChar('$'));
    }

    #[test]
    fn unescape_sequences() {
        assert_eq!(unescape(r"a\tb\n").unwrap(), b"a\tb\n");
        assert_eq!(unescape(r"\65\066\x43").unwrap(), b"ABC");
        assert_eq!(unescape(r"\u{48}i").unwrap(), b"Hi");
        assert_eq!(unescape("a\\z  \n  b").unwrap(), b"ab");
        assert_eq!(unescape(r"\xff").unwrap(), vec![0xff]);
        assert_eq!(unescape(r"\q"), Err(LexError::InvalidEscape('q')));
        assert_eq!(unescape(r"\300"), Err(LexError::EscapeTooLarge));
    }
}
