//! Piece ownership bitmaps, wrapper types around Bitvec.
//!
//! Two lifetimes exist: a private [`Bitfield`] owned by a single peer
//! connection, and the global [`SharedBitfield`] of pieces we have, which
//! every worker observes without copying.

use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
};

use bitvec::prelude::*;
use rand::Rng;

/// Bitfield where index = piece.
pub type Bitfield = BitVec<u8, Msb0>;

/// Byte capacity of the shared region, fixed at creation.
pub const SHARED_BITFIELD_CAPACITY: usize = 2048;

pub trait RemoraBitfield {
    /// Bitfield of `bits` zeroed bits backed by the given bytes.
    fn from_vec_with_len(vec: Vec<u8>, bits: usize) -> Bitfield {
        let mut s = Bitfield::from_vec(vec);
        s.resize(bits, false);
        s
    }

    fn safe_set(&mut self, _index: usize) {}
    fn safe_get(&mut self, index: usize) -> bool;

    /// The piece-selection primitive: the lowest bit `i` with
    /// `self[i] == 0` and `other[i] == 1`, scanning the shorter of the
    /// two bit lengths. `self` is our ownership bitfield, `other` the
    /// remote peer's advertised one.
    ///
    /// With `randomize` the scan starts at a random offset and wraps, so
    /// workers hitting the same swarm state spread over different pieces;
    /// the returned index still satisfies the predicate, it is just no
    /// longer the lowest one.
    fn first_missing_in(
        &self,
        other: &Bitfield,
        randomize: bool,
    ) -> Option<usize>;
}

impl RemoraBitfield for Bitfield {
    fn safe_set(&mut self, index: usize) {
        if self.len() <= index {
            self.resize(index + 1, false);
        }
        self.set(index, true);
    }

    fn safe_get(&mut self, index: usize) -> bool {
        if self.len() <= index {
            self.resize(index + 1, false);
        }
        self[index]
    }

    fn first_missing_in(
        &self,
        other: &Bitfield,
        randomize: bool,
    ) -> Option<usize> {
        let bits = self.len().min(other.len());
        if bits == 0 {
            return None;
        }

        let start = if randomize {
            rand::thread_rng().gen_range(0..bits)
        } else {
            0
        };

        (0..bits)
            .map(|offset| (start + offset) % bits)
            .find(|&i| !self[i] && other[i])
    }
}

/// The global "pieces we have" bitmap, mapped into every worker.
///
/// This is the one piece of genuinely shared mutable state in the whole
/// client. Bits are only ever set, never cleared, and only through an
/// atomic or, so concurrent workers cannot lose each other's writes. The
/// capacity is fixed at creation and the region starts zeroed.
#[derive(Debug, Clone)]
pub struct SharedBitfield {
    bytes: Arc<[AtomicU8]>,
}

impl Default for SharedBitfield {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedBitfield {
    pub fn new() -> Self {
        Self::with_capacity(SHARED_BITFIELD_CAPACITY)
    }

    pub fn with_capacity(bytes: usize) -> Self {
        let v: Vec<AtomicU8> =
            (0..bytes).map(|_| AtomicU8::new(0)).collect();
        Self { bytes: v.into() }
    }

    pub fn capacity_bits(&self) -> usize {
        self.bytes.len() * 8
    }

    /// Set one bit. Out-of-capacity indices are reported, never grown.
    pub fn set(&self, bit: usize) -> bool {
        let Some(byte) = self.bytes.get(bit / 8) else { return false };
        byte.fetch_or(0x80 >> (bit % 8), Ordering::Release);
        true
    }

    pub fn get(&self, bit: usize) -> bool {
        let Some(byte) = self.bytes.get(bit / 8) else { return false };
        byte.load(Ordering::Acquire) & (0x80 >> (bit % 8)) != 0
    }

    /// Owned copy of the first `bits` bits, for complement scans against a
    /// peer's private bitfield.
    pub fn snapshot(&self, bits: usize) -> Bitfield {
        let bits = bits.min(self.capacity_bits());
        let bytes: Vec<u8> = self.bytes[..bits.div_ceil(8)]
            .iter()
            .map(|b| b.load(Ordering::Acquire))
            .collect();
        Bitfield::from_vec_with_len(bytes, bits)
    }

    pub fn count_ones(&self, bits: usize) -> usize {
        self.snapshot(bits).count_ones()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_set() {
        let mut bitfield = Bitfield::from_vec_with_len(vec![0], 2);
        assert_eq!(bitfield.len(), 2);

        bitfield.safe_set(2);
        assert_eq!(bitfield.len(), 3);
        assert!(bitfield.get(2).unwrap());

        bitfield.safe_set(10);
        assert_eq!(bitfield.len(), 11);
        assert!(bitfield.get(10).unwrap());
    }

    #[test]
    fn safe_get() {
        let mut bitfield = Bitfield::from_vec_with_len(vec![0], 1);
        assert!(!bitfield.safe_get(10));
        assert_eq!(bitfield.len(), 11);
    }

    #[test]
    fn first_missing_is_lowest() {
        // local: 1100 0000, remote: 1111 0000 -> piece 2
        let local = Bitfield::from_vec_with_len(vec![0b1100_0000], 8);
        let remote = Bitfield::from_vec_with_len(vec![0b1111_0000], 8);
        assert_eq!(local.first_missing_in(&remote, false), Some(2));

        // remote has nothing we lack
        let remote = Bitfield::from_vec_with_len(vec![0b1100_0000], 8);
        assert_eq!(local.first_missing_in(&remote, false), None);

        // empty bitfields
        let empty = Bitfield::new();
        assert_eq!(empty.first_missing_in(&empty, false), None);
    }

    #[test]
    fn first_missing_uses_shorter_length() {
        let local = Bitfield::from_vec_with_len(vec![0x00], 4);
        // remote only advertises piece 6, which is past our length
        let remote = Bitfield::from_vec_with_len(vec![0b0000_0010], 8);
        assert_eq!(local.first_missing_in(&remote, false), None);
    }

    #[test]
    fn first_missing_randomized_satisfies_predicate() {
        let local = Bitfield::from_vec_with_len(vec![0b1010_1010, 0], 16);
        let remote = Bitfield::from_vec_with_len(vec![0xff, 0xff], 16);

        for _ in 0..100 {
            let i = local.first_missing_in(&remote, true).unwrap();
            assert!(!local[i]);
            assert!(remote[i]);
        }
    }

    #[test]
    fn shared_starts_zeroed() {
        let shared = SharedBitfield::new();
        assert_eq!(shared.capacity_bits(), SHARED_BITFIELD_CAPACITY * 8);
        assert_eq!(shared.count_ones(shared.capacity_bits()), 0);
    }

    #[test]
    fn shared_set_is_monotonic_and_msb_first() {
        let shared = SharedBitfield::with_capacity(2);
        assert!(shared.set(0));
        assert!(shared.set(9));
        assert!(shared.get(0));
        assert!(shared.get(9));
        assert!(!shared.get(1));

        // wire order: bit 0 is the most significant bit of byte 0
        let snap = shared.snapshot(16);
        assert_eq!(snap.into_vec(), vec![0b1000_0000, 0b0100_0000]);

        // out of capacity is reported, not grown
        assert!(!shared.set(16));
        assert!(!shared.get(16));
    }

    #[test]
    fn shared_snapshot_feeds_complement_scan() {
        let shared = SharedBitfield::with_capacity(1);
        shared.set(0);

        let remote = Bitfield::from_vec_with_len(vec![0b1100_0000], 8);
        let snap = shared.snapshot(8);
        assert_eq!(snap.first_missing_in(&remote, false), Some(1));
    }
}
