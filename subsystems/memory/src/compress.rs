//! Page compression codecs.

use alloc::vec::Vec;

/// Page content codec
pub trait Codec: Send + Sync {
    /// Short name for diagnostics
    fn name(&self) -> &'static str;

    /// Encode a page; `None` when the encoding would not save space
    fn compress(&self, page: &[u8]) -> Option<Vec<u8>>;

    /// Decode into `out`; false if `data` is malformed or the wrong size
    fn decompress(&self, data: &[u8], out: &mut [u8]) -> bool;
}

/// Byte run-length codec: `(run, byte)` pairs, runs of 1..=255
#[derive(Debug, Clone, Copy, Default)]
pub struct RleCodec;

impl Codec for RleCodec {
    fn name(&self) -> &'static str {
        "rle"
    }

    fn compress(&self, page: &[u8]) -> Option<Vec<u8>> {
        let mut out = Vec::new();
        let mut iter = page.iter().copied().peekable();
        while let Some(byte) = iter.next() {
            let mut run = 1u8;
            while run < u8::MAX && iter.peek() == Some(&byte) {
                iter.next();
                run += 1;
            }
            out.push(run);
            out.push(byte);
            if out.len() >= page.len() {
                return None;
            }
        }
        Some(out)
    }

    fn decompress(&self, data: &[u8], out: &mut [u8]) -> bool {
        if data.len() % 2 != 0 {
            return false;
        }
        let mut pos = 0usize;
        for pair in data.chunks_exact(2) {
            let (run, byte) = (pair[0] as usize, pair[1]);
            if run == 0 || pos + run > out.len() {
                return false;
            }
            out[pos..pos + run].fill(byte);
            pos += run;
        }
        pos == out.len()
    }
}

/// All-zero page?
#[inline]
pub fn is_zero_page(page: &[u8]) -> bool {
    page.iter().all(|&b| b == 0)
}

/// Compressed page content
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompressedPage {
    /// All zero; nothing stored
    Zero,
    /// Codec output
    Encoded(Vec<u8>),
}

impl CompressedPage {
    /// Bytes held for this page
    pub fn stored_bytes(&self) -> usize {
        match self {
            Self::Zero => 0,
            Self::Encoded(data) => data.len(),
        }
    }
}

/// Compression counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompressionStats {
    /// Pages compressed
    pub compressed: u64,
    /// Of which all-zero
    pub zero_pages: u64,
    /// Pages skipped because encoding saved nothing
    pub incompressible: u64,
    /// Pages decompressed on fault
    pub decompressed: u64,
    /// Bytes currently held compressed
    pub stored_bytes: u64,
}
