#![forbid(unsafe_code)]
//! Shared geometry, arithmetic and state types for synctrack.
//!
//! All device addresses are 512-byte sectors (`u64`). The bitmap tracks one
//! bit per 4 KiB block; activity extents cover 4 MiB and resync extents
//! cover 256 MiB.
//!
//! ```text
//!  sector ──>> 3 ──> bitmap bit ──>> 10 ──> AL extent ──>> 6 ──> resync extent
//!    512 B            4 KiB                  4 MiB                 256 MiB
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

pub const SECTOR_SHIFT: u32 = 9;
pub const SECTOR_SIZE: usize = 1 << SECTOR_SHIFT;

/// One bitmap bit covers this many bytes of the replicated device.
pub const BM_BLOCK_SHIFT: u32 = 12;
pub const BM_BLOCK_SIZE: u64 = 1 << BM_BLOCK_SHIFT;
pub const BM_SECT_PER_BIT: u64 = 1 << (BM_BLOCK_SHIFT - SECTOR_SHIFT);

/// Activity-log extent: 4 MiB.
pub const AL_EXTENT_SHIFT: u32 = 22;
pub const AL_EXTENT_SIZE: u64 = 1 << AL_EXTENT_SHIFT;
pub const BM_BITS_PER_AL_EXT: u64 = 1 << (AL_EXTENT_SHIFT - BM_BLOCK_SHIFT);

/// Resync (bitmap) extent: 256 MiB.
pub const BM_EXT_SHIFT: u32 = 28;
pub const BM_EXT_SIZE: u64 = 1 << BM_EXT_SHIFT;
pub const BM_BITS_PER_EXT: u64 = 1 << (BM_EXT_SHIFT - BM_BLOCK_SHIFT);
pub const AL_EXT_PER_BM_EXT: u32 = 1 << (BM_EXT_SHIFT - AL_EXTENT_SHIFT);

/// In-memory and on-disk bitmap page.
pub const BM_PAGE_SIZE: usize = 4096;
pub const BM_BITS_PER_PAGE: u64 = (BM_PAGE_SIZE as u64) * 8;
pub const BM_WORDS_PER_PAGE: usize = BM_PAGE_SIZE / 8;
pub const BM_SECT_PER_PAGE: u64 = (BM_PAGE_SIZE / SECTOR_SIZE) as u64;

/// Sentinel extent number of an unused LRU slot or padding update.
pub const LC_FREE: u32 = u32::MAX;

/// Magic of a valid activity-log transaction record.
pub const AL_MAGIC: u32 = 0x8374_0267;
/// Extent entries in one transaction besides the mandatory new-extent entry.
pub const AL_EXTENTS_PT: usize = 61;
/// Upper bound on activity-log ring slots (32 KiB reserved area).
pub const AL_MAX_RING_SLOTS: u32 = 64;

/// Largest activity-log LRU capacity the ring can describe.
pub const AL_MAX_EXTENTS: u32 = (AL_MAX_RING_SLOTS - 1) * AL_EXTENTS_PT as u32;
/// Smallest activity-log LRU capacity accepted at attach.
pub const AL_MIN_EXTENTS: u32 = 7;

// ── Sector arithmetic ──────────────────────────────────────────────────────

/// Bitmap bit containing `sector`.
#[inline]
#[must_use]
pub fn sect_to_bit(sector: u64) -> u64 {
    sector >> (BM_BLOCK_SHIFT - SECTOR_SHIFT)
}

/// First sector covered by bitmap bit `bit`.
#[inline]
#[must_use]
pub fn bit_to_sect(bit: u64) -> u64 {
    bit << (BM_BLOCK_SHIFT - SECTOR_SHIFT)
}

/// Number of bitmap bits needed for a device of `sectors` sectors.
#[inline]
#[must_use]
pub fn bits_for_capacity(sectors: u64) -> u64 {
    sectors.div_ceil(BM_SECT_PER_BIT)
}

/// Number of bitmap pages needed for `bits` bits.
#[inline]
#[must_use]
pub fn pages_for_bits(bits: u64) -> u64 {
    bits.div_ceil(BM_BITS_PER_PAGE)
}

/// Activity-log extent containing `sector`.
#[expect(clippy::cast_possible_truncation)] // extent numbers fit u32 for devices below 16 PiB
#[inline]
#[must_use]
pub fn sect_to_al_ext(sector: u64) -> u32 {
    (sector >> (AL_EXTENT_SHIFT - SECTOR_SHIFT)) as u32
}

/// First sector of activity-log extent `enr`.
#[inline]
#[must_use]
pub fn al_ext_to_sect(enr: u32) -> u64 {
    u64::from(enr) << (AL_EXTENT_SHIFT - SECTOR_SHIFT)
}

/// Resync extent containing `sector`.
#[expect(clippy::cast_possible_truncation)] // extent numbers fit u32 for devices below 1 EiB
#[inline]
#[must_use]
pub fn sect_to_bm_ext(sector: u64) -> u32 {
    (sector >> (BM_EXT_SHIFT - SECTOR_SHIFT)) as u32
}

/// First sector of resync extent `enr`.
#[inline]
#[must_use]
pub fn bm_ext_to_sect(enr: u32) -> u64 {
    u64::from(enr) << (BM_EXT_SHIFT - SECTOR_SHIFT)
}

/// First activity extent covered by resync extent `enr`.
#[inline]
#[must_use]
pub fn bm_ext_to_al_ext(enr: u32) -> u32 {
    enr.saturating_mul(AL_EXT_PER_BM_EXT)
}

/// Resync extent containing activity extent `al_enr`.
#[inline]
#[must_use]
pub fn al_ext_to_bm_ext(al_enr: u32) -> u32 {
    al_enr / AL_EXT_PER_BM_EXT
}

/// Granularity of an extent-addressed bitmap query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExtentKind {
    /// 4 MiB activity-log extent.
    Activity,
    /// 256 MiB resync extent.
    Resync,
}

impl ExtentKind {
    /// Bitmap bits covered by one extent of this kind.
    #[must_use]
    pub fn bits_per_extent(self) -> u64 {
        match self {
            Self::Activity => BM_BITS_PER_AL_EXT,
            Self::Resync => BM_BITS_PER_EXT,
        }
    }

    /// Inclusive bitmap bit range of extent `enr`, before clamping to the
    /// device size.
    #[must_use]
    pub fn bit_range(self, enr: u32) -> (u64, u64) {
        let per = self.bits_per_extent();
        let start = u64::from(enr) * per;
        (start, start + per - 1)
    }
}

// ── Device states ──────────────────────────────────────────────────────────

/// Usability of the local backing disk, ordered from worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DiskState {
    Diskless,
    Attaching,
    Failed,
    Negotiating,
    Inconsistent,
    Outdated,
    Unknown,
    Consistent,
    UpToDate,
}

impl DiskState {
    /// Local metadata may be read and written.
    #[must_use]
    pub fn has_local_disk(self) -> bool {
        self > Self::Failed
    }
}

impl fmt::Display for DiskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Replication link state as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConnState {
    StandAlone,
    Connecting,
    Connected,
    SyncSource,
    SyncTarget,
    PausedSyncS,
    PausedSyncT,
}

impl ConnState {
    /// The peer receives writes; evicted bitmap pages need no eager flush.
    #[must_use]
    pub fn is_connected(self) -> bool {
        self >= Self::Connected
    }

    /// A resync is running or paused.
    #[must_use]
    pub fn is_resyncing(self) -> bool {
        matches!(
            self,
            Self::SyncSource | Self::SyncTarget | Self::PausedSyncS | Self::PausedSyncT
        )
    }
}

/// Reaction to a local metadata I/O error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IoErrorPolicy {
    /// Report the error upward and keep the disk attached.
    #[default]
    PassOn,
    /// Notify the host helper, then detach.
    CallHelper,
    /// Detach the disk.
    Detach,
}

// ── Cancellation ───────────────────────────────────────────────────────────

/// Shared flag interrupting blocking waits.
///
/// Cloned handles observe the same flag. Once cancelled a token stays
/// cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

// ── Workload randomness ────────────────────────────────────────────────────

/// Seeded xorshift generator for reproducible test and stress workloads.
#[derive(Debug, Clone)]
pub struct Xorshift(u64);

impl Xorshift {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self((seed ^ 0x9E37_79B9_7F4A_7C15) | 1)
    }

    pub fn next_u64(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    /// Value in `0..bound`; `0` when `bound` is zero.
    pub fn below(&mut self, bound: u64) -> u64 {
        if bound == 0 { 0 } else { self.next_u64() % bound }
    }
}

// ── Byte helpers ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };
    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }
    Ok(&data[offset..end])
}

#[inline]
pub fn read_be_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

/// Store `value` big-endian at `offset`. Panics only on a caller-sized
/// buffer that is too short, which the fixed record layouts rule out.
#[inline]
pub fn write_be_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn xorshift_is_reproducible() {
        let mut a = Xorshift::new(7);
        let mut b = Xorshift::new(7);
        let xs: Vec<u64> = (0..4).map(|_| a.below(100)).collect();
        let ys: Vec<u64> = (0..4).map(|_| b.below(100)).collect();
        assert_eq!(xs, ys);
        assert!(xs.iter().all(|&x| x < 100));
        assert_ne!(Xorshift::new(8).next_u64(), Xorshift::new(7).next_u64());
        assert_eq!(Xorshift::new(0).below(0), 0);
    }

    #[test]
    fn geometry_constants_line_up() {
        assert_eq!(BM_SECT_PER_BIT, 8);
        assert_eq!(BM_BITS_PER_AL_EXT, 1024);
        assert_eq!(BM_BITS_PER_EXT, 65_536);
        assert_eq!(AL_EXT_PER_BM_EXT, 64);
        assert_eq!(BM_BITS_PER_PAGE, 32_768);
        assert_eq!(BM_SECT_PER_PAGE, 8);
        // magic + tr_number + 62 updates + xor_sum fits one sector
        assert!(4 + 4 + (AL_EXTENTS_PT + 1) * 8 + 4 <= SECTOR_SIZE);
    }

    #[test]
    fn sector_to_extent_mapping() {
        assert_eq!(sect_to_al_ext(0), 0);
        assert_eq!(sect_to_al_ext(8191), 0);
        assert_eq!(sect_to_al_ext(8192), 1);
        assert_eq!(al_ext_to_sect(3), 3 * 8192);
        assert_eq!(sect_to_bm_ext((1 << 19) - 1), 0);
        assert_eq!(sect_to_bm_ext(1 << 19), 1);
        assert_eq!(bm_ext_to_al_ext(2), 128);
        assert_eq!(al_ext_to_bm_ext(127), 1);
        assert_eq!(al_ext_to_bm_ext(128), 2);
    }

    #[test]
    fn capacity_rounds_up_to_whole_bits() {
        assert_eq!(bits_for_capacity(0), 0);
        assert_eq!(bits_for_capacity(1), 1);
        assert_eq!(bits_for_capacity(8), 1);
        assert_eq!(bits_for_capacity(9), 2);
        assert_eq!(pages_for_bits(1024), 1);
        assert_eq!(pages_for_bits(32_769), 2);
    }

    #[test]
    fn extent_bit_ranges() {
        assert_eq!(ExtentKind::Activity.bit_range(0), (0, 1023));
        assert_eq!(ExtentKind::Activity.bit_range(2), (2048, 3071));
        assert_eq!(ExtentKind::Resync.bit_range(1), (65_536, 131_071));
    }

    #[test]
    fn disk_state_ordering() {
        assert!(DiskState::Diskless < DiskState::Failed);
        assert!(DiskState::Failed < DiskState::Inconsistent);
        assert!(!DiskState::Failed.has_local_disk());
        assert!(DiskState::Negotiating.has_local_disk());
        assert!(DiskState::UpToDate.has_local_disk());
    }

    #[test]
    fn conn_state_predicates() {
        assert!(!ConnState::StandAlone.is_connected());
        assert!(ConnState::Connected.is_connected());
        assert!(!ConnState::Connected.is_resyncing());
        assert!(ConnState::PausedSyncT.is_resyncing());
    }

    #[test]
    fn io_error_policy_serde_names() {
        let json = serde_json::to_string(&IoErrorPolicy::CallHelper).unwrap();
        assert_eq!(json, "\"call-helper\"");
        let back: IoErrorPolicy = serde_json::from_str("\"detach\"").unwrap();
        assert_eq!(back, IoErrorPolicy::Detach);
    }

    #[test]
    fn cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn be_helpers_and_bounds() {
        let mut buf = [0_u8; 8];
        write_be_u32(&mut buf, 4, 0x0102_0304);
        assert_eq!(&buf[4..], &[1, 2, 3, 4]);
        assert_eq!(read_be_u32(&buf, 4), Ok(0x0102_0304));
        assert!(matches!(
            read_be_u32(&buf, 6),
            Err(ParseError::InsufficientData { needed: 4, .. })
        ));
        assert!(read_le_u64(&buf, usize::MAX).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn sector_lies_inside_its_extents(sector in 0_u64..(1 << 40)) {
            let al = sect_to_al_ext(sector);
            prop_assert!(al_ext_to_sect(al) <= sector);
            prop_assert!(sector < al_ext_to_sect(al + 1));
            let bm = sect_to_bm_ext(sector);
            prop_assert_eq!(al_ext_to_bm_ext(al), bm);
            let bit = sect_to_bit(sector);
            prop_assert!(bit_to_sect(bit) <= sector);
        }
    }
}
