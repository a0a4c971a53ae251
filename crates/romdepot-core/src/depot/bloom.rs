//! Per-root bloom filter and its on-disk artifact

use sha1::{Digest, Sha1};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

pub const BLOOM_FILTER_FILENAME: &str = "bloomfilter";
pub const BACKUP_BLOOM_FILTER_FILENAME: &str = "backup.bloomfilter";

const MAGIC: &[u8; 8] = b"RDBLOOM1";
const MAX_HASHES: u32 = 32;
const MIN_BITS: u64 = 64;

/// Fixed-size probabilistic set of content identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    pub fn new(num_bits: u64, num_hashes: u32) -> Self {
        let num_bits = num_bits.max(MIN_BITS);
        let words = num_bits.div_ceil(64) as usize;
        Self {
            bits: vec![0; words],
            num_bits,
            num_hashes: num_hashes.clamp(1, MAX_HASHES),
        }
    }

    /// Size a filter for `items` entries at false positive rate `fp_rate`
    pub fn with_estimate(items: u64, fp_rate: f64) -> Self {
        let n = items.max(1) as f64;
        let p = fp_rate.clamp(1e-9, 0.5);
        let ln2 = std::f64::consts::LN_2;
        let m = (-n * p.ln() / (ln2 * ln2)).ceil();
        let k = ((m / n) * ln2).round();
        Self::new(m as u64, k as u32)
    }

    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    fn positions(&self, item: &[u8]) -> impl Iterator<Item = u64> + use<> {
        let digest = Sha1::digest(item);
        let mut h1 = [0u8; 8];
        let mut h2 = [0u8; 8];
        h1.copy_from_slice(&digest[0..8]);
        h2.copy_from_slice(&digest[8..16]);
        let h1 = u64::from_le_bytes(h1);
        let h2 = u64::from_le_bytes(h2) | 1;
        let m = self.num_bits;
        (0..u64::from(self.num_hashes)).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % m)
    }

    pub fn add(&mut self, item: &[u8]) {
        for bit in self.positions(item) {
            self.bits[(bit / 64) as usize] |= 1 << (bit % 64);
        }
    }

    pub fn contains(&self, item: &[u8]) -> bool {
        self.positions(item)
            .all(|bit| self.bits[(bit / 64) as usize] & (1 << (bit % 64)) != 0)
    }

    /// Serialize as magic, hash count, bit count, words, then a SHA1 trailer
    /// over everything before it.
    pub fn write_to<W: Write>(&self, writer: W) -> io::Result<()> {
        let mut body = Vec::with_capacity(MAGIC.len() + 12 + self.bits.len() * 8);
        body.extend_from_slice(MAGIC);
        body.extend_from_slice(&self.num_hashes.to_le_bytes());
        body.extend_from_slice(&self.num_bits.to_le_bytes());
        for word in &self.bits {
            body.extend_from_slice(&word.to_le_bytes());
        }
        let trailer = Sha1::digest(&body);

        let mut writer = BufWriter::new(writer);
        writer.write_all(&body)?;
        writer.write_all(&trailer)?;
        writer.flush()
    }

    pub fn read_from<R: Read>(reader: R) -> io::Result<Self> {
        let mut data = Vec::new();
        BufReader::new(reader).read_to_end(&mut data)?;

        let invalid = |msg: &str| io::Error::new(io::ErrorKind::InvalidData, msg.to_string());

        let header_len = MAGIC.len() + 12;
        if data.len() < header_len + 20 {
            return Err(invalid("bloom filter file is truncated"));
        }
        let (body, trailer) = data.split_at(data.len() - 20);
        if Sha1::digest(body).as_slice() != trailer {
            return Err(invalid("bloom filter checksum mismatch"));
        }
        if &body[..MAGIC.len()] != MAGIC {
            return Err(invalid("not a bloom filter file"));
        }

        let mut k = [0u8; 4];
        k.copy_from_slice(&body[8..12]);
        let mut m = [0u8; 8];
        m.copy_from_slice(&body[12..20]);
        let num_hashes = u32::from_le_bytes(k);
        let num_bits = u64::from_le_bytes(m);

        let words = &body[header_len..];
        if num_hashes == 0
            || num_hashes > MAX_HASHES
            || num_bits < MIN_BITS
            || words.len() % 8 != 0
            || (words.len() / 8) as u64 != num_bits.div_ceil(64)
        {
            return Err(invalid("bloom filter header is inconsistent"));
        }

        let bits = words
            .chunks_exact(8)
            .map(|chunk| {
                let mut word = [0u8; 8];
                word.copy_from_slice(chunk);
                u64::from_le_bytes(word)
            })
            .collect();

        Ok(Self {
            bits,
            num_bits,
            num_hashes,
        })
    }
}

fn read_bloom_filter(path: &Path) -> io::Result<BloomFilter> {
    BloomFilter::read_from(File::open(path)?)
}

fn write_bloom_filter(path: &Path, bf: &BloomFilter) -> io::Result<()> {
    let file = File::create(path)?;
    bf.write_to(&file)?;
    file.sync_all()
}

/// Load the filter stored under `root`.
///
/// A missing or corrupt primary file falls back to the backup. Returns
/// `None` when neither file holds a valid filter.
pub fn load_bloom_filter(root: &Path) -> Option<BloomFilter> {
    let primary = root.join(BLOOM_FILTER_FILENAME);
    match read_bloom_filter(&primary) {
        Ok(bf) => return Some(bf),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %primary.display(), error = %e, "ignoring unreadable bloom filter");
        }
    }

    let backup = root.join(BACKUP_BLOOM_FILTER_FILENAME);
    match read_bloom_filter(&backup) {
        Ok(bf) => {
            tracing::info!(path = %backup.display(), "restored bloom filter from backup");
            Some(bf)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => {
            tracing::warn!(path = %backup.display(), error = %e, "ignoring unreadable bloom filter backup");
            None
        }
    }
}

/// Persist `bf` under `root`, moving any current filter to the backup name first.
pub fn write_bloom_filter_with_backup(root: &Path, bf: &BloomFilter) -> io::Result<()> {
    replace_with_backup(root, |path| write_bloom_filter(path, bf))
}

fn replace_with_backup<F>(root: &Path, write: F) -> io::Result<()>
where
    F: FnOnce(&Path) -> io::Result<()>,
{
    let primary: PathBuf = root.join(BLOOM_FILTER_FILENAME);
    if primary.exists() {
        fs::rename(&primary, root.join(BACKUP_BLOOM_FILTER_FILENAME))?;
    }
    write(&primary)
}
