use std::iter::FusedIterator;
use thiserror::Error;
use unicode_segmentation::UnicodeSegmentation;

static NEWLINE_GRAPHEMES: &[&str] = &["\r", "\n", "\r\n"];

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TokenKind {
    // One-character tokens
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    Comma,
    Dot,
    Minus,
    Plus,
    Semicolon,
    Slash,
    Asterisk,
    // One- or two-character tokens
    Bang,
    BangEqual,
    Equal,
    EqualEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    // Literals
    Identifier,
    String,
    Number,
    // Keywords
    And,
    Assert,
    Class,
    Else,
    False,
    For,
    Fun,
    If,
    Nil,
    Or,
    Print,
    Return,
    Super,
    This,
    True,
    Var,
    While,
    Error(ScanError),
    Eof,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub lexeme: &'a str,
    pub line: usize,
}

impl<'a> Token<'a> {
    pub fn new(kind: TokenKind, lexeme: &'a str, line: usize) -> Self {
        Self { kind, lexeme, line }
    }
}

/// Lazily turns source text into tokens, one grapheme cluster at a time.
///
/// `scan_token` never fails: problems are reported as [`TokenKind::Error`] tokens and the
/// end of input is an endless stream of [`TokenKind::Eof`].
pub struct Scanner<'a> {
    source: &'a str,
    graphemes: Vec<(usize, &'a str)>,
    start: usize,
    current: usize,
    line: usize,
}

impl<'a> Scanner<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            graphemes: source.grapheme_indices(true).collect(),
            start: 0,
            current: 0,
            line: 1,
        }
    }

    pub fn scan_token(&mut self) -> Token<'a> {
        self.skip_whitespace();
        self.start = self.current;
        let Some(c) = self.get_and_advance() else {
            return self.make_token(TokenKind::Eof);
        };
        use TokenKind::*;
        match c {
            "(" => self.make_token(LeftParen),
            ")" => self.make_token(RightParen),
            "{" => self.make_token(LeftBrace),
            "}" => self.make_token(RightBrace),
            ";" => self.make_token(Semicolon),
            "," => self.make_token(Comma),
            "." => self.make_token(Dot),
            "-" => self.make_token(Minus),
            "+" => self.make_token(Plus),
            "/" => self.make_token(Slash),
            "*" => self.make_token(Asterisk),
            "!" => self.one_or_two("=", BangEqual, Bang),
            "=" => self.one_or_two("=", EqualEqual, Equal),
            "<" => self.one_or_two("=", LessEqual, Less),
            ">" => self.one_or_two("=", GreaterEqual, Greater),
            "\"" => self.string(),
            c if is_digit(c) => self.number(),
            c if is_letter_or_underscore(c) => self.identifier(),
            _ => self.make_token(Error(ScanError::UnexpectedCharacter)),
        }
    }

    fn byte_offset(&self, grapheme: usize) -> usize {
        self.graphemes
            .get(grapheme)
            .map(|(offset, _)| *offset)
            .unwrap_or(self.source.len())
    }

    fn lexeme(&self) -> &'a str {
        let from = self.byte_offset(self.start);
        let to = self.byte_offset(self.current);
        &self.source[from..to]
    }

    fn make_token(&self, kind: TokenKind) -> Token<'a> {
        Token::new(kind, self.lexeme(), self.line)
    }

    fn get_and_advance(&mut self) -> Option<&'a str> {
        let (_, res) = *self.graphemes.get(self.current)?;
        self.current += 1;
        Some(res)
    }

    fn peek(&self) -> Option<&'a str> {
        self.graphemes.get(self.current).map(|(_, g)| *g)
    }

    fn peek_peek(&self) -> Option<&'a str> {
        self.graphemes.get(self.current + 1).map(|(_, g)| *g)
    }

    fn advance_if_matches(&mut self, c: &str) -> bool {
        if self.peek() == Some(c) {
            self.current += 1;
            true
        } else {
            false
        }
    }

    fn one_or_two(&mut self, second: &str, two: TokenKind, one: TokenKind) -> Token<'a> {
        if self.advance_if_matches(second) {
            self.make_token(two)
        } else {
            self.make_token(one)
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            match c {
                " " | "\t" => {
                    self.current += 1;
                }
                c if NEWLINE_GRAPHEMES.contains(&c) => {
                    self.current += 1;
                    self.line += 1;
                }
                "/" if self.peek_peek() == Some("/") => {
                    while let Some(c) = self.peek() {
                        if NEWLINE_GRAPHEMES.contains(&c) {
                            break;
                        }
                        self.current += 1;
                    }
                }
                _ => break,
            }
        }
    }

    fn string(&mut self) -> Token<'a> {
        let starting_line = self.line;
        while let Some(c) = self.peek() {
            if c == "\"" {
                break;
            }
            if NEWLINE_GRAPHEMES.contains(&c) {
                self.line += 1;
            }
            self.current += 1;
        }

        if !self.advance_if_matches("\"") {
            return self.make_token(TokenKind::Error(ScanError::UnterminatedString));
        }
        // Strings report the line they started on.
        Token::new(TokenKind::String, self.lexeme(), starting_line)
    }

    fn number(&mut self) -> Token<'a> {
        self.skip_digits();
        if self.peek() == Some(".") && self.peek_peek().is_some_and(is_digit) {
            // Consume .
            self.current += 1;
            self.skip_digits();
        }
        self.make_token(TokenKind::Number)
    }

    fn skip_digits(&mut self) {
        while self.peek().is_some_and(is_digit) {
            self.current += 1;
        }
    }

    fn identifier(&mut self) -> Token<'a> {
        while self
            .peek()
            .is_some_and(|c| is_letter_or_underscore(c) || is_digit(c))
        {
            self.current += 1;
        }
        let kind = keyword(self.lexeme()).unwrap_or(TokenKind::Identifier);
        self.make_token(kind)
    }
}

/// Switches on the leading letters, then requires the rest of the word to match exactly.
fn keyword(identifier: &str) -> Option<TokenKind> {
    use TokenKind::*;
    let mut chars = identifier.chars();
    let first = chars.next()?;
    let rest = chars.as_str();
    let (expected, kind) = match first {
        'a' => match rest.chars().next()? {
            'n' => ("nd", And),
            's' => ("ssert", Assert),
            _ => return None,
        },
        'c' => ("lass", Class),
        'e' => ("lse", Else),
        'f' => match rest.chars().next()? {
            'a' => ("alse", False),
            'o' => ("or", For),
            'u' => ("un", Fun),
            _ => return None,
        },
        'i' => ("f", If),
        'n' => ("il", Nil),
        'o' => ("r", Or),
        'p' => ("rint", Print),
        'r' => ("eturn", Return),
        's' => ("uper", Super),
        't' => match rest.chars().next()? {
            'h' => ("his", This),
            'r' => ("rue", True),
            _ => return None,
        },
        'v' => ("ar", Var),
        'w' => ("hile", While),
        _ => return None,
    };
    (rest == expected).then_some(kind)
}

fn is_digit(c: &str) -> bool {
    matches!(c.as_bytes(), [b'0'..=b'9'])
}

fn is_letter_or_underscore(c: &str) -> bool {
    matches!(c.as_bytes(), [b'a'..=b'z' | b'A'..=b'Z' | b'_'])
}

impl<'a> Iterator for Scanner<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let token = self.scan_token();
        (token.kind != TokenKind::Eof).then_some(token)
    }
}

impl<'a> FusedIterator for Scanner<'a> {}

#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum ScanError {
    #[error("Unexpected character.")]
    UnexpectedCharacter,
    #[error("Unterminated string.")]
    UnterminatedString,
}
