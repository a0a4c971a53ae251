//! Recursive-descent parser for clrmamepro text DATs

use super::hashing::Sha1HashingReader;
use super::lexer::{Lexer, Token, TokenKind};
use super::{CRC_HEX_LEN, Dat, DatError, Game, MD5_HEX_LEN, ParseError, Rom, SHA1_HEX_LEN};
use data_encoding::HEXLOWER_PERMISSIVE;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

/// Parse a size value; the placeholder `-` means zero.
pub fn string_value_to_int(input: &str) -> Result<u64, DatError> {
    if input == "-" {
        return Ok(0);
    }
    input.parse().map_err(|source| DatError::InvalidInt {
        value: input.to_string(),
        source,
    })
}

/// Decode a hex hash, left-padding with zeros up to `expected_len` hex chars.
/// `-` and the empty string mean "absent".
pub fn string_value_to_bytes(input: &str, expected_len: usize) -> Result<Option<Vec<u8>>, DatError> {
    let input = input.trim();
    if input == "-" || input.is_empty() {
        return Ok(None);
    }

    let padded = format!("{:0>width$}", input, width = expected_len);
    HEXLOWER_PERMISSIVE
        .decode(padded.as_bytes())
        .map(Some)
        .map_err(|source| DatError::InvalidHex {
            value: input.to_string(),
            source,
        })
}

struct Parser<R> {
    lexer: Lexer<R>,
    dat: Dat,
    /// Line of the most recently read token
    line: usize,
}

impl<R: BufRead> Parser<R> {
    fn next(&mut self) -> Token {
        let token = self.lexer.next_token();
        self.line = token.line;
        token
    }

    fn consume_string_value(&mut self) -> Result<String, DatError> {
        let token = self.next();
        match token.kind {
            TokenKind::QuotedString | TokenKind::Value => Ok(token.text),
            kind if kind.is_keyword() => Ok(token.text),
            TokenKind::Error => Err(DatError::Lexical(token.to_string())),
            _ => Err(unexpected("quoted string or value", &token)),
        }
    }

    fn consume_integer_value(&mut self) -> Result<u64, DatError> {
        let token = self.next();
        match token.kind {
            TokenKind::QuotedString | TokenKind::Value => string_value_to_int(&token.text),
            TokenKind::Error => Err(DatError::Lexical(token.to_string())),
            _ => Err(unexpected("value", &token)),
        }
    }

    fn consume_hex_bytes(&mut self, expected_len: usize) -> Result<Option<Vec<u8>>, DatError> {
        let token = self.next();
        match token.kind {
            TokenKind::QuotedString | TokenKind::Value => {
                string_value_to_bytes(&token.text, expected_len)
            }
            TokenKind::Error => Err(DatError::Lexical(token.to_string())),
            _ => Err(unexpected("value", &token)),
        }
    }

    fn expect_open_brace(&mut self) -> Result<(), DatError> {
        let token = self.next();
        match token.kind {
            TokenKind::OpenBrace => Ok(()),
            TokenKind::Error => Err(DatError::Lexical(token.to_string())),
            _ => Err(unexpected("open brace", &token)),
        }
    }

    /// Reads up to and including the close brace of the current block,
    /// skipping any nested blocks.
    fn skip_block(&mut self) -> Result<(), DatError> {
        let mut depth = 1usize;
        while depth > 0 {
            let token = self.next();
            match token.kind {
                TokenKind::OpenBrace => depth += 1,
                TokenKind::CloseBrace => depth -= 1,
                TokenKind::Eof => return Err(DatError::UnexpectedEof),
                TokenKind::Error => return Err(DatError::Lexical(token.to_string())),
                _ => {}
            }
        }
        Ok(())
    }

    fn dat_stmt(&mut self) -> Result<(), DatError> {
        self.expect_open_brace()?;
        loop {
            let token = self.next();
            match token.kind {
                TokenKind::CloseBrace => return Ok(()),
                TokenKind::Eof => return Err(DatError::UnexpectedEof),
                TokenKind::Error => return Err(DatError::Lexical(token.to_string())),
                TokenKind::Name => self.dat.name = self.consume_string_value()?,
                TokenKind::Description => self.dat.description = self.consume_string_value()?,
                TokenKind::OpenBrace => self.skip_block()?,
                _ => {}
            }
        }
    }

    fn game_stmt(&mut self) -> Result<Game, DatError> {
        self.expect_open_brace()?;
        let mut game = Game::default();
        loop {
            let token = self.next();
            match token.kind {
                TokenKind::CloseBrace => return Ok(game),
                TokenKind::Eof => return Err(DatError::UnexpectedEof),
                TokenKind::Error => return Err(DatError::Lexical(token.to_string())),
                TokenKind::Name => game.name = self.consume_string_value()?,
                TokenKind::Description => game.description = self.consume_string_value()?,
                TokenKind::Rom => {
                    if let Some(rom) = self.rom_stmt()? {
                        game.roms.push(rom);
                    }
                }
                TokenKind::OpenBrace => self.skip_block()?,
                _ => {}
            }
        }
    }

    /// A malformed hash drops the whole rom: the rest of its block is
    /// skipped and `None` is returned so sibling roms still parse.
    fn rom_stmt(&mut self) -> Result<Option<Rom>, DatError> {
        self.expect_open_brace()?;
        let mut rom = Rom::default();
        loop {
            let token = self.next();
            let hash = match token.kind {
                TokenKind::CloseBrace => return Ok(Some(rom)),
                TokenKind::Eof => return Err(DatError::UnexpectedEof),
                TokenKind::Error => return Err(DatError::Lexical(token.to_string())),
                TokenKind::Name => {
                    rom.name = self.consume_string_value()?;
                    continue;
                }
                TokenKind::Size => {
                    rom.size = self.consume_integer_value()?;
                    continue;
                }
                TokenKind::Crc => self.consume_hex_bytes(CRC_HEX_LEN).map(|v| rom.crc = v),
                TokenKind::Md5 => self.consume_hex_bytes(MD5_HEX_LEN).map(|v| rom.md5 = v),
                TokenKind::Sha1 => self.consume_hex_bytes(SHA1_HEX_LEN).map(|v| rom.sha1 = v),
                TokenKind::OpenBrace => {
                    self.skip_block()?;
                    continue;
                }
                _ => continue,
            };

            match hash {
                Ok(()) => {}
                Err(DatError::InvalidHex { value, .. }) => {
                    tracing::debug!(line = self.line, %value, "dropping rom with malformed hash");
                    self.skip_block()?;
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn parse(&mut self) -> Result<(), DatError> {
        loop {
            let token = self.next();
            match token.kind {
                TokenKind::Eof => return Ok(()),
                TokenKind::Error => return Err(DatError::Lexical(token.to_string())),
                TokenKind::ClrMamePro => self.dat_stmt()?,
                TokenKind::Game => {
                    let game = self.game_stmt()?;
                    self.dat.games.push(game);
                }
                TokenKind::OpenBrace => self.skip_block()?,
                _ => {}
            }
        }
    }
}

fn unexpected(expected: &'static str, token: &Token) -> DatError {
    DatError::Unexpected {
        expected,
        found: token.to_string(),
    }
}

/// Parse a clrmamepro text DAT.
///
/// Returns the normalized catalog and the SHA1 of every byte read from `reader`.
pub fn parse_text<R: Read>(reader: R, path: &Path) -> Result<(Dat, Vec<u8>), ParseError> {
    let mut parser = Parser {
        lexer: Lexer::new(BufReader::new(Sha1HashingReader::from(reader))),
        dat: Dat::default(),
        line: 1,
    };

    if let Err(source) = parser.parse() {
        return Err(ParseError::new(path, parser.line, source));
    }

    let Parser { lexer, mut dat, .. } = parser;
    dat.normalize();
    let digest = lexer.into_inner().into_inner().digest().to_vec();
    Ok((dat, digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use sha1::{Digest, Sha1};

    fn parse(input: &str) -> Result<(Dat, Vec<u8>), ParseError> {
        parse_text(input.as_bytes(), Path::new("test.dat"))
    }

    const SAMPLE: &str = r#"clrmamepro (
	name "Nintendo - Game Boy"
	description "Nintendo - Game Boy (20240101)"
	version 20240101
)

game (
	name "Tetris (World)"
	description "Tetris (World)"
	rom ( name "Tetris (World).gb" size 32768 crc 46df91ad md5 084f1e457749cdec86183189bd88ce69 sha1 74591cc9501af93873f9a5d3eb12da12c0723bbc )
)

game (
	name "Empty Game"
	description "No roms here"
)
"#;

    #[test]
    fn test_parse_sample() {
        let (dat, digest) = parse(SAMPLE).unwrap();

        assert_eq!(dat.name, "Nintendo - Game Boy");
        assert_eq!(dat.description, "Nintendo - Game Boy (20240101)");
        assert_eq!(dat.games.len(), 2);
        assert_eq!(digest, Sha1::digest(SAMPLE.as_bytes()).to_vec());

        let rom = &dat.games[0].roms[0];
        assert_eq!(rom.name, "Tetris (World).gb");
        assert_eq!(rom.size, 32768);
        assert_eq!(rom.crc, Some(vec![0x46, 0xdf, 0x91, 0xad]));
        assert_eq!(rom.md5.as_ref().map(Vec::len), Some(16));
        assert_eq!(rom.sha1.as_ref().map(Vec::len), Some(20));

        assert_eq!(dat.games[1].name, "Empty Game");
        assert!(dat.games[1].roms.is_empty());
    }

    #[test]
    fn test_parse_is_deterministic() {
        let first = parse(SAMPLE).unwrap();
        let second = parse(SAMPLE).unwrap();
        assert_eq!(first, second);
    }

    #[rstest]
    #[case("-", Some(0))]
    #[case("42", Some(42))]
    #[case("0", Some(0))]
    #[case("abc", None)]
    #[case("", None)]
    fn test_string_value_to_int(#[case] input: &str, #[case] expected: Option<u64>) {
        assert_eq!(string_value_to_int(input).ok(), expected);
    }

    #[rstest]
    #[case("1a2b", CRC_HEX_LEN, Some(vec![0x00, 0x00, 0x1a, 0x2b]))]
    #[case("DEADBEEF", CRC_HEX_LEN, Some(vec![0xde, 0xad, 0xbe, 0xef]))]
    #[case("-", CRC_HEX_LEN, None)]
    #[case("", SHA1_HEX_LEN, None)]
    fn test_string_value_to_bytes(
        #[case] input: &str,
        #[case] len: usize,
        #[case] expected: Option<Vec<u8>>,
    ) {
        assert_eq!(string_value_to_bytes(input, len).unwrap(), expected);
    }

    #[test]
    fn test_string_value_to_bytes_rejects_bad_hex() {
        assert!(matches!(
            string_value_to_bytes("xyz", CRC_HEX_LEN),
            Err(DatError::InvalidHex { .. })
        ));
    }

    #[test]
    fn test_size_dash_is_zero() {
        let (dat, _) = parse("game ( name g rom ( name r size - crc - ) )").unwrap();
        assert_eq!(dat.games[0].roms[0].size, 0);
        assert_eq!(dat.games[0].roms[0].crc, None);
    }

    #[test]
    fn test_malformed_sha1_drops_only_that_rom() {
        let input = r#"game (
	name g
	rom ( name bad.bin size 1 sha1 nothex md5 d41d8cd98f00b204e9800998ecf8427e )
	rom ( name good.bin size 2 crc 00000001 )
)
game ( name h )
"#;
        let (dat, _) = parse(input).unwrap();

        assert_eq!(dat.games.len(), 2);
        assert_eq!(dat.games[0].roms.len(), 1);
        assert_eq!(dat.games[0].roms[0].name, "good.bin");
        assert_eq!(dat.games[1].name, "h");
    }

    #[test]
    fn test_bom_keeps_header() {
        let input = "\u{feff}clrmamepro (\n\tname \"Bom DAT\"\n\tdescription \"With BOM\"\n)\ngame ( name g rom ( name r size 1 ) )\n";
        let (dat, digest) = parse(input).unwrap();
        assert_eq!(dat.name, "Bom DAT");
        assert_eq!(dat.description, "With BOM");
        assert_eq!(dat.games.len(), 1);
        assert_eq!(digest, Sha1::digest(input.as_bytes()).to_vec());
    }

    #[test]
    fn test_bad_size_fails_parse() {
        let err = parse("game ( name g\n rom ( name r size big ) )").unwrap_err();
        assert!(matches!(err.source, DatError::InvalidInt { .. }));
        assert_eq!(err.line, 2);
    }

    #[test]
    fn test_unknown_blocks_are_skipped() {
        let input = r#"emulator ( name "mame" )
game (
	name g
	sample ( name "not a rom" )
	rom ( name r size 1 )
)
"#;
        let (dat, _) = parse(input).unwrap();
        assert_eq!(dat.name, "");
        assert_eq!(dat.games[0].name, "g");
        assert_eq!(dat.games[0].roms.len(), 1);
    }

    #[test]
    fn test_keyword_as_value() {
        let (dat, _) = parse("game ( name rom description game )").unwrap();
        assert_eq!(dat.games[0].name, "rom");
        assert_eq!(dat.games[0].description, "game");
    }

    #[test]
    fn test_unexpected_eof() {
        let err = parse("game (\n name g\n rom ( name r\n").unwrap_err();
        assert!(matches!(err.source, DatError::UnexpectedEof));
        assert!(err.to_string().starts_with("error in file test.dat on line"));
    }

    #[test]
    fn test_missing_open_brace() {
        let err = parse("game name g )").unwrap_err();
        assert!(matches!(err.source, DatError::Unexpected { .. }));
        assert_eq!(err.line, 1);
    }

    #[test]
    fn test_lexical_error_reports_line() {
        let err = parse("clrmamepro ( name x )\ngame ( name g )\ngame ( name \"broken )\n").unwrap_err();
        assert!(matches!(err.source, DatError::Lexical(_)));
        assert_eq!(err.line, 3);
        assert!(err.to_string().contains("test.dat on line 3"));
    }
}
