//! Bitmap pages and word-level bit operations.

use serde::Serialize;
use st_types::{BM_PAGE_SIZE, BM_WORDS_PER_PAGE};

/// Per-page state. Each flag is independent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PageFlags {
    /// A write or read of this page is in flight.
    pub io_locked: bool,
    /// The last I/O of this page failed.
    pub io_error: bool,
    /// Bits were set since the last write.
    pub need_writeout: bool,
    /// Bits were cleared since the last write.
    pub lazy_writeout: bool,
}

impl PageFlags {
    /// Neither set nor clear happened since the last write.
    #[must_use]
    pub fn unchanged(self) -> bool {
        !self.need_writeout && !self.lazy_writeout
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Page {
    pub(crate) words: Vec<u64>,
    pub(crate) flags: PageFlags,
}

impl Page {
    pub(crate) fn zeroed() -> Self {
        Self {
            words: vec![0; BM_WORDS_PER_PAGE],
            flags: PageFlags::default(),
        }
    }

    /// On-disk image: little-endian words.
    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BM_PAGE_SIZE);
        for w in &self.words {
            out.extend_from_slice(&w.to_le_bytes());
        }
        out
    }

    pub(crate) fn load_bytes(&mut self, bytes: &[u8]) {
        for (word, chunk) in self.words.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut le = [0_u8; 8];
            le.copy_from_slice(chunk);
            *word = u64::from_le_bytes(le);
        }
    }
}

/// Mask of `len` bits starting at bit `off` of a word. `off + len <= 64`.
#[inline]
pub(crate) fn word_mask(off: u32, len: u32) -> u64 {
    if len >= 64 {
        u64::MAX
    } else {
        ((1_u64 << len) - 1) << off
    }
}

/// Split global word index into (page, word-in-page).
#[expect(clippy::cast_possible_truncation)] // page and word indices are bounded by the page vector
#[inline]
pub(crate) fn locate(word: u64) -> (usize, usize) {
    let per = BM_WORDS_PER_PAGE as u64;
    ((word / per) as usize, (word % per) as usize)
}
