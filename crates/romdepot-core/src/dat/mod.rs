//! DAT parsing module - clrmamepro text and Logiqx/MAME XML format support

pub mod hashing;
pub mod lexer;
pub mod text;
pub mod xml;

use std::fs::File;
use std::io::{self, Read};
use std::num::ParseIntError;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use text::{parse_text, string_value_to_bytes, string_value_to_int};
pub use xml::parse_xml;

/// Hex lengths of the canonical hash representations.
pub const CRC_HEX_LEN: usize = 8;
pub const MD5_HEX_LEN: usize = 32;
pub const SHA1_HEX_LEN: usize = 40;

/// Number of leading bytes inspected when deciding between text and XML.
const SNIFF_LEN: u64 = 256;
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// A parsed DAT file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dat {
    pub name: String,
    pub description: String,
    pub games: Vec<Game>,
    /// Entries of MAME software lists, same shape as games
    pub software: Vec<Game>,
}

impl Dat {
    /// Canonicalize names after parsing. Runs once per parse.
    pub fn normalize(&mut self) {
        self.name = self.name.trim().to_string();
        self.description = self.description.trim().to_string();
        for game in self.games.iter_mut().chain(self.software.iter_mut()) {
            game.normalize();
        }
    }

    /// Games followed by software entries
    pub fn all_games(&self) -> impl Iterator<Item = &Game> {
        self.games.iter().chain(self.software.iter())
    }

    /// Total number of ROM entries across all games and software entries
    pub fn rom_count(&self) -> usize {
        self.all_games().map(|g| g.all_roms().count()).sum()
    }
}

/// A game (or software entry) with its expected files
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Game {
    pub name: String,
    pub description: String,
    pub roms: Vec<Rom>,
    pub disks: Vec<Rom>,
    pub parts: Vec<Rom>,
    pub regions: Vec<Rom>,
}

impl Game {
    fn normalize(&mut self) {
        self.name = self.name.trim().to_string();
        self.description = self.description.trim().to_string();
        for rom in self
            .roms
            .iter_mut()
            .chain(self.disks.iter_mut())
            .chain(self.parts.iter_mut())
            .chain(self.regions.iter_mut())
        {
            rom.normalize();
        }
    }

    pub fn all_roms(&self) -> impl Iterator<Item = &Rom> {
        self.roms
            .iter()
            .chain(self.disks.iter())
            .chain(self.parts.iter())
            .chain(self.regions.iter())
    }
}

/// A single expected file. Absent hashes are `None`, never zero-filled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rom {
    pub name: String,
    pub size: u64,
    pub crc: Option<Vec<u8>>,
    pub md5: Option<Vec<u8>>,
    pub sha1: Option<Vec<u8>>,
}

impl Rom {
    fn normalize(&mut self) {
        self.name = self.name.trim().replace('\\', "/");
    }
}

#[derive(Debug, Error)]
pub enum DatError {
    #[error("lexer error: {0}")]
    Lexical(String),

    #[error("expected {expected}, got {found}")]
    Unexpected { expected: &'static str, found: String },

    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("invalid integer value {value:?}: {source}")]
    InvalidInt {
        value: String,
        source: ParseIntError,
    },

    #[error("invalid hex value {value:?}: {source}")]
    InvalidHex {
        value: String,
        source: data_encoding::DecodeError,
    },

    #[error("xml parsing error: {0}")]
    Xml(#[from] quick_xml::DeError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A parse failure located in its source file
#[derive(Debug, Error)]
#[error("error in file {} on line {line}: {source}", .path.display())]
pub struct ParseError {
    pub path: PathBuf,
    pub line: usize,
    #[source]
    pub source: DatError,
}

impl ParseError {
    pub fn new(path: &Path, line: usize, source: DatError) -> Self {
        Self {
            path: path.to_path_buf(),
            line,
            source,
        }
    }
}

/// Check whether the file starts with an XML declaration
pub fn is_xml(path: &Path) -> io::Result<bool> {
    let file = File::open(path)?;
    let mut snippet = Vec::with_capacity(SNIFF_LEN as usize);
    file.take(SNIFF_LEN).read_to_end(&mut snippet)?;

    let snippet = snippet.strip_prefix(UTF8_BOM).unwrap_or(&snippet);
    Ok(snippet.starts_with(b"<?xml"))
}

/// Parse a DAT file, detecting the format from its content.
///
/// Returns the normalized catalog together with the SHA1 of the file bytes.
pub fn parse_file(path: &Path) -> Result<(Dat, Vec<u8>), ParseError> {
    let io_error = |e: io::Error| ParseError::new(path, 0, DatError::Io(e));

    let xml = is_xml(path).map_err(io_error)?;
    let file = File::open(path).map_err(io_error)?;

    if xml {
        parse_xml(file, path)
    } else {
        parse_text(file, path)
    }
}
