//! Tokenizer for the clrmamepro text DAT grammar

use super::UTF8_BOM;
use phf::phf_map;
use std::fmt;
use std::io::BufRead;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    OpenBrace,
    CloseBrace,
    ClrMamePro,
    Game,
    Rom,
    Name,
    Description,
    Size,
    Crc,
    Md5,
    Sha1,
    QuotedString,
    Value,
    Eof,
    Error,
}

impl TokenKind {
    /// Keywords may double as plain values (a game can be called "rom").
    pub fn is_keyword(self) -> bool {
        matches!(
            self,
            TokenKind::ClrMamePro
                | TokenKind::Game
                | TokenKind::Rom
                | TokenKind::Name
                | TokenKind::Description
                | TokenKind::Size
                | TokenKind::Crc
                | TokenKind::Md5
                | TokenKind::Sha1
        )
    }
}

static KEYWORDS: phf::Map<&'static str, TokenKind> = phf_map! {
    "clrmamepro" => TokenKind::ClrMamePro,
    "game" => TokenKind::Game,
    "machine" => TokenKind::Game,
    "resource" => TokenKind::Game,
    "rom" => TokenKind::Rom,
    "name" => TokenKind::Name,
    "description" => TokenKind::Description,
    "size" => TokenKind::Size,
    "crc" => TokenKind::Crc,
    "crc32" => TokenKind::Crc,
    "md5" => TokenKind::Md5,
    "sha1" => TokenKind::Sha1,
};

/// A lexical unit. For quoted strings `text` holds the unescaped contents,
/// for errors it holds the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub line: usize,
}

impl Token {
    fn new(kind: TokenKind, text: impl Into<String>, line: usize) -> Self {
        Self {
            kind,
            text: text.into(),
            line,
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TokenKind::Eof => write!(f, "EOF"),
            TokenKind::Error => write!(f, "{} (line {})", self.text, self.line),
            _ => write!(f, "{:?} {:?} (line {})", self.kind, self.text, self.line),
        }
    }
}

pub struct Lexer<R> {
    reader: R,
    line: usize,
    started: bool,
    failed: bool,
}

impl<R: BufRead> Lexer<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: 1,
            started: false,
            failed: false,
        }
    }

    /// Current line of the read position.
    pub fn line(&self) -> usize {
        self.line
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    pub fn next_token(&mut self) -> Token {
        if self.failed {
            return Token::new(TokenKind::Error, "lexer already failed", self.line);
        }
        let token = self.scan();
        if token.kind == TokenKind::Error {
            self.failed = true;
        }
        token
    }

    /// Drop a UTF-8 byte order mark at the very start of the input.
    fn skip_bom(&mut self) -> std::io::Result<()> {
        for &expected in UTF8_BOM {
            match self.peek()? {
                Some(b) if b == expected => self.reader.consume(1),
                _ => break,
            }
        }
        Ok(())
    }

    fn scan(&mut self) -> Token {
        if !self.started {
            self.started = true;
            if let Err(e) = self.skip_bom() {
                return Token::new(TokenKind::Error, e.to_string(), self.line);
            }
        }

        loop {
            match self.peek() {
                Err(e) => return Token::new(TokenKind::Error, e.to_string(), self.line),
                Ok(None) => return Token::new(TokenKind::Eof, "", self.line),
                Ok(Some(b)) if b.is_ascii_whitespace() || b == b'=' => self.bump(b),
                Ok(Some(_)) => break,
            }
        }

        let line = self.line;
        match self.peek() {
            Ok(Some(b'(')) => {
                self.bump(b'(');
                Token::new(TokenKind::OpenBrace, "(", line)
            }
            Ok(Some(b')')) => {
                self.bump(b')');
                Token::new(TokenKind::CloseBrace, ")", line)
            }
            Ok(Some(delim @ (b'"' | b'\''))) => {
                self.bump(delim);
                self.quoted(delim, line)
            }
            _ => self.bare(line),
        }
    }

    fn quoted(&mut self, delim: u8, line: usize) -> Token {
        let mut bytes = Vec::new();
        loop {
            match self.peek() {
                Err(e) => return Token::new(TokenKind::Error, e.to_string(), line),
                Ok(None) => {
                    return Token::new(TokenKind::Error, "unterminated quoted string", line);
                }
                Ok(Some(b)) if b == delim => {
                    self.bump(b);
                    return Token::new(
                        TokenKind::QuotedString,
                        String::from_utf8_lossy(&bytes).into_owned(),
                        line,
                    );
                }
                Ok(Some(b'\\')) => {
                    self.bump(b'\\');
                    match self.peek() {
                        Ok(Some(next)) if next == delim || next.is_ascii_whitespace() => {
                            self.bump(next);
                            bytes.push(next);
                        }
                        // Anything else is literal, e.g. a path separator.
                        _ => bytes.push(b'\\'),
                    }
                }
                Ok(Some(b)) => {
                    self.bump(b);
                    bytes.push(b);
                }
            }
        }
    }

    fn bare(&mut self, line: usize) -> Token {
        let mut bytes = Vec::new();
        loop {
            match self.peek() {
                Err(e) => return Token::new(TokenKind::Error, e.to_string(), line),
                Ok(Some(b)) if !(b.is_ascii_whitespace() || matches!(b, b'=' | b'(' | b')')) => {
                    self.bump(b);
                    bytes.push(b);
                }
                _ => break,
            }
        }

        let text = String::from_utf8_lossy(&bytes).into_owned();
        let kind = KEYWORDS
            .get(text.to_ascii_lowercase().as_str())
            .copied()
            .unwrap_or(TokenKind::Value);
        Token::new(kind, text, line)
    }

    fn peek(&mut self) -> std::io::Result<Option<u8>> {
        Ok(self.reader.fill_buf()?.first().copied())
    }

    fn bump(&mut self, b: u8) {
        if b == b'\n' {
            self.line += 1;
        }
        self.reader.consume(1);
    }
}
