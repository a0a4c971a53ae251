//! Logiqx datafile and MAME software list XML parsing

use super::hashing::{LineCountingReader, Sha1HashingReader};
use super::text::string_value_to_bytes;
use super::{CRC_HEX_LEN, Dat, DatError, Game, MD5_HEX_LEN, ParseError, Rom, SHA1_HEX_LEN};
use serde::Deserialize;
use std::io::{self, BufReader, Read};
use std::path::Path;

/// Document root: `<datafile>`, `<mame>` or `<softwarelist>`
#[derive(Debug, Deserialize)]
struct XmlDat {
    #[serde(rename = "@name", default)]
    name: Option<String>,
    #[serde(rename = "@description", default)]
    description: Option<String>,
    #[serde(default)]
    header: Option<XmlHeader>,
    #[serde(rename = "game", default)]
    games: Vec<XmlGame>,
    #[serde(rename = "machine", default)]
    machines: Vec<XmlGame>,
    #[serde(rename = "software", default)]
    software: Vec<XmlGame>,
}

#[derive(Debug, Deserialize)]
struct XmlHeader {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct XmlGame {
    #[serde(rename = "@name", default)]
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(rename = "rom", default)]
    roms: Vec<XmlRom>,
    #[serde(rename = "disk", default)]
    disks: Vec<XmlRom>,
    #[serde(rename = "part", default)]
    parts: Vec<XmlPart>,
    #[serde(rename = "region", default)]
    regions: Vec<XmlRegion>,
}

/// Software list part: `<part><dataarea><rom/></dataarea></part>`
#[derive(Debug, Deserialize)]
struct XmlPart {
    #[serde(rename = "dataarea", default)]
    data_areas: Vec<XmlRegion>,
}

#[derive(Debug, Deserialize)]
struct XmlRegion {
    #[serde(rename = "rom", default)]
    roms: Vec<XmlRom>,
}

/// Hashes stay as hex text until conversion into [`Rom`].
#[derive(Debug, Deserialize)]
struct XmlRom {
    #[serde(rename = "@name", default)]
    name: String,
    #[serde(rename = "@size", default)]
    size: u64,
    #[serde(rename = "@crc", default)]
    crc: Option<String>,
    #[serde(rename = "@md5", default)]
    md5: Option<String>,
    #[serde(rename = "@sha1", default)]
    sha1: Option<String>,
}

/// Undecodable hashes become `None`; they never fail the parse.
fn decode_hash(value: Option<String>, expected_len: usize) -> Option<Vec<u8>> {
    let value = value?;
    match string_value_to_bytes(&value, expected_len) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::debug!(error = %e, "clearing malformed hash");
            None
        }
    }
}

impl From<XmlRom> for Rom {
    fn from(rom: XmlRom) -> Self {
        Rom {
            name: rom.name,
            size: rom.size,
            crc: decode_hash(rom.crc, CRC_HEX_LEN),
            md5: decode_hash(rom.md5, MD5_HEX_LEN),
            sha1: decode_hash(rom.sha1, SHA1_HEX_LEN),
        }
    }
}

impl From<XmlGame> for Game {
    fn from(game: XmlGame) -> Self {
        Game {
            name: game.name,
            description: game.description.unwrap_or_default(),
            roms: game.roms.into_iter().map(Rom::from).collect(),
            disks: game.disks.into_iter().map(Rom::from).collect(),
            parts: game
                .parts
                .into_iter()
                .flat_map(|p| p.data_areas)
                .flat_map(|a| a.roms)
                .map(Rom::from)
                .collect(),
            regions: game
                .regions
                .into_iter()
                .flat_map(|r| r.roms)
                .map(Rom::from)
                .collect(),
        }
    }
}

impl From<XmlDat> for Dat {
    fn from(xml: XmlDat) -> Self {
        let (header_name, header_description) = xml
            .header
            .map(|h| (h.name, h.description))
            .unwrap_or_default();

        Dat {
            name: header_name.or(xml.name).unwrap_or_default(),
            description: header_description.or(xml.description).unwrap_or_default(),
            games: xml
                .games
                .into_iter()
                .chain(xml.machines)
                .map(Game::from)
                .collect(),
            software: xml.software.into_iter().map(Game::from).collect(),
        }
    }
}

/// Parse an XML DAT.
///
/// Returns the normalized catalog and the SHA1 of every byte read from `reader`.
pub fn parse_xml<R: Read>(reader: R, path: &Path) -> Result<(Dat, Vec<u8>), ParseError> {
    let mut counting = LineCountingReader::new(Sha1HashingReader::from(reader));

    let decoded = {
        let mut buffered = BufReader::new(&mut counting);
        quick_xml::de::from_reader::<_, XmlDat>(&mut buffered)
            .map_err(DatError::from)
            .and_then(|xml| {
                // Trailing bytes after the root element still belong to the file digest.
                io::copy(&mut buffered, &mut io::sink())?;
                Ok(xml)
            })
    };

    let xml = decoded.map_err(|source| ParseError::new(path, counting.line(), source))?;

    let mut dat = Dat::from(xml);
    dat.normalize();
    let digest = counting.into_inner().digest().to_vec();
    Ok((dat, digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha1::{Digest, Sha1};

    fn parse(input: &str) -> Result<(Dat, Vec<u8>), ParseError> {
        parse_xml(input.as_bytes(), Path::new("test.xml"))
    }

    #[test]
    fn test_parse_datafile() {
        let xml = r#"<?xml version="1.0"?>
<!DOCTYPE datafile PUBLIC "-//Logiqx//DTD ROM Management Datafile//EN" "http://www.logiqx.com/Dats/datafile.dtd">
<datafile>
  <header>
    <name>Test DAT</name>
    <description>Test DAT (2025-01-30)</description>
    <version>2025-01-30</version>
  </header>
  <game name="Test Game">
    <description>Test Game (USA)</description>
    <rom name="test.rom" size="1024" crc="abcd1234" md5="d41d8cd98f00b204e9800998ecf8427e" sha1="da39a3ee5e6b4b0d3255bfef95601890afd80709"/>
    <disk name="test.chd" sha1="da39a3ee5e6b4b0d3255bfef95601890afd80709"/>
    <rom name="second.rom" size="16" crc="1a2b"/>
  </game>
</datafile>
"#;

        let (dat, digest) = parse(xml).unwrap();
        assert_eq!(dat.name, "Test DAT");
        assert_eq!(dat.description, "Test DAT (2025-01-30)");
        assert_eq!(digest, Sha1::digest(xml.as_bytes()).to_vec());

        let game = &dat.games[0];
        assert_eq!(game.name, "Test Game");
        assert_eq!(game.description, "Test Game (USA)");
        assert_eq!(game.roms.len(), 2);
        assert_eq!(game.roms[0].size, 1024);
        assert_eq!(game.roms[0].crc, Some(vec![0xab, 0xcd, 0x12, 0x34]));
        assert_eq!(game.roms[1].crc, Some(vec![0x00, 0x00, 0x1a, 0x2b]));
        assert_eq!(game.disks.len(), 1);
        assert_eq!(game.disks[0].sha1.as_ref().map(Vec::len), Some(20));
        assert_eq!(dat.rom_count(), 3);
    }

    #[test]
    fn test_malformed_hash_is_cleared() {
        let xml = r#"<?xml version="1.0"?>
<datafile>
  <game name="g">
    <rom name="bad.bin" size="7" crc="01020304" sha1="not-a-hash"/>
  </game>
</datafile>"#;

        let (dat, _) = parse(xml).unwrap();
        let rom = &dat.games[0].roms[0];
        assert_eq!(rom.name, "bad.bin");
        assert_eq!(rom.size, 7);
        assert_eq!(rom.crc, Some(vec![1, 2, 3, 4]));
        assert_eq!(rom.sha1, None);
    }

    #[test]
    fn test_parse_software_list() {
        let xml = r#"<?xml version="1.0"?>
<softwarelist name="a2600" description="Atari 2600 cartridges">
  <software name="adventur">
    <description>Adventure</description>
    <year>1980</year>
    <part name="cart" interface="a2600_cart">
      <dataarea name="rom" size="4096">
        <rom name="adventure.bin" size="4096" crc="157bddb7" sha1="4a3f3a3e1b0f8ac0c9eaf7d8e0b5d8d36e0e0b1f"/>
      </dataarea>
    </part>
  </software>
</softwarelist>"#;

        let (dat, _) = parse(xml).unwrap();
        assert_eq!(dat.name, "a2600");
        assert_eq!(dat.description, "Atari 2600 cartridges");
        assert!(dat.games.is_empty());
        assert_eq!(dat.software.len(), 1);
        assert_eq!(dat.software[0].description, "Adventure");
        assert_eq!(dat.software[0].parts.len(), 1);
        assert_eq!(dat.software[0].parts[0].name, "adventure.bin");
        assert_eq!(dat.rom_count(), 1);
    }

    #[test]
    fn test_machine_regions() {
        let xml = r#"<?xml version="1.0"?>
<mame>
  <machine name="pacman">
    <region name="maincpu">
      <rom name="pacman.6e" size="4096" crc="c1e6ab10"/>
    </region>
  </machine>
</mame>"#;

        let (dat, _) = parse(xml).unwrap();
        assert_eq!(dat.games.len(), 1);
        assert_eq!(dat.games[0].regions[0].crc, Some(vec![0xc1, 0xe6, 0xab, 0x10]));
    }

    #[test]
    fn test_decode_error_reports_path() {
        let xml = "<?xml version=\"1.0\"?>\n<datafile>\n<game name=\"g\">\n<rom name=\"r\" size=\"huge\"/>\n</game>\n</datafile>\n";
        let err = parse(xml).unwrap_err();
        assert!(matches!(err.source, DatError::Xml(_)));
        assert!(err.to_string().starts_with("error in file test.xml on line"));
    }
}
