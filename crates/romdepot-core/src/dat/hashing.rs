use sha1::digest::{Digest, Output};
use std::io::{self, Read};

/// Wraps an existing reader, and allows querying for the digest of all
/// data read "through" it.
/// The hash function is configurable by type parameter.
pub struct HashingReader<R, H> {
    inner: R,
    hasher: H,
}

pub type Sha1HashingReader<R> = HashingReader<R, sha1::Sha1>;

impl<R: Read, H: Digest> HashingReader<R, H> {
    pub fn from(r: R) -> Self {
        Self {
            inner: r,
            hasher: H::new(),
        }
    }

    /// Return the digest.
    pub fn digest(self) -> Output<H> {
        self.hasher.finalize()
    }
}

impl<R: Read, H: Digest> Read for HashingReader<R, H> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

/// Counts newlines passing through, so decode failures can point at an
/// approximate line. The count runs ahead of the consumer by whatever the
/// consumer buffers.
pub struct LineCountingReader<R> {
    inner: R,
    line: usize,
}

impl<R: Read> LineCountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, line: 1 }
    }

    pub fn line(&self) -> usize {
        self.line
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for LineCountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.line += buf[..n].iter().filter(|&&b| b == b'\n').count();
        Ok(n)
    }
}
