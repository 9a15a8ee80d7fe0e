//! The download sink: one pass over the bytes feeds the destination file,
//! a running SHA-256, and a bounded EXIF capture.
//!
//! The capture branch is deliberately tolerant. EXIF lives in the first
//! kilobytes of the formats we download, so the capture buffers only a
//! fixed-size prefix and then flips to a no-op; it can never fail and never
//! applies backpressure to the download. The checksum, by contrast, covers
//! every byte and is finalized only once the source is fully consumed.

use std::io::{self, Write};

use sha2::{Digest, Sha256};

/// How much of the stream head is retained for EXIF parsing. APP1 segments
/// top out at 64 KiB; this leaves room for formats that pad before them.
pub(crate) const EXIF_CAPTURE_LIMIT: usize = 256 * 1024;

/// Buffers the first `limit` bytes offered to it, ignores the rest.
struct PrefixCapture {
    buf: Vec<u8>,
    limit: usize,
}

impl PrefixCapture {
    fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
        }
    }

    fn accept(&mut self, bytes: &[u8]) {
        if self.buf.len() >= self.limit {
            return;
        }
        let room = self.limit - self.buf.len();
        let take = room.min(bytes.len());
        self.buf.extend_from_slice(&bytes[..take]);
    }
}

/// A writer that tees into a destination, a hash, and a prefix capture.
pub(crate) struct HashSink<W: Write> {
    dest: W,
    hasher: Sha256,
    capture: PrefixCapture,
}

impl<W: Write> HashSink<W> {
    pub fn new(dest: W) -> Self {
        Self {
            dest,
            hasher: Sha256::new(),
            capture: PrefixCapture::new(EXIF_CAPTURE_LIMIT),
        }
    }

    /// Flush the destination and return the final checksum together with
    /// the captured stream prefix.
    pub fn finish(mut self) -> io::Result<([u8; 32], Vec<u8>)> {
        self.dest.flush()?;
        Ok((self.hasher.finalize().into(), self.capture.buf))
    }
}

impl<W: Write> Write for HashSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.dest.write(buf)?;
        self.hasher.update(&buf[..written]);
        self.capture.accept(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.dest.flush()
    }
}
