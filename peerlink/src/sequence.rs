//! Modular sequence numbers and window bookkeeping.
//!
//! Every channel numbers its messages modulo [`NUM_SEQUENCE_NUMBERS`]. The
//! relative distance between two numbers is taken as a signed residue in
//! `[-512, 511]`, so comparisons stay unambiguous as long as no more than
//! half the modulus is in flight at once.

/// Sequence number modulus shared by every channel.
pub const NUM_SEQUENCE_NUMBERS: u16 = 1024;

/// Window size of the unreliable sender.
pub const UNRELIABLE_WINDOW_SIZE: usize = 128;
/// Window size of reliable-ordered channels.
pub const RELIABLE_ORDERED_WINDOW_SIZE: usize = 64;
/// Window size of reliable-sequenced channels.
pub const RELIABLE_SEQUENCED_WINDOW_SIZE: usize = 64;
/// Window size of every other channel.
pub const DEFAULT_WINDOW_SIZE: usize = 64;

const HALF: i32 = NUM_SEQUENCE_NUMBERS as i32 / 2;

/// Signed distance of `nr` from `expected`.
///
/// Zero means on time, negative means late (or a duplicate), positive
/// means early.
pub fn relative_sequence_number(nr: u16, expected: u16) -> i32 {
    let modulus = NUM_SEQUENCE_NUMBERS as i32;
    (nr as i32 - expected as i32 + modulus + HALF) % modulus - HALF
}

/// `seq + delta` wrapped into the sequence space.
pub fn advance(seq: u16, delta: usize) -> u16 {
    ((seq as usize + delta) % NUM_SEQUENCE_NUMBERS as usize) as u16
}

/// Forward distance from `from` to `to`, in `[0, NUM_SEQUENCE_NUMBERS)`.
pub fn distance(from: u16, to: u16) -> usize {
    let n = NUM_SEQUENCE_NUMBERS as usize;
    (to as usize + n - from as usize) % n
}

/// Check that `window` can be used as a slot array over the sequence space.
pub fn is_valid_window_size(window: usize) -> bool {
    window > 0
        && window <= NUM_SEQUENCE_NUMBERS as usize / 2
        && NUM_SEQUENCE_NUMBERS as usize % window == 0
}

/// Fixed-size bit set, one bit per slot.
#[derive(Debug, Clone)]
pub struct SequenceBits {
    words: Vec<u64>,
    len: usize,
}

impl SequenceBits {
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: usize) -> bool {
        let index = index % self.len;
        self.words[index / 64] & (1 << (index % 64)) != 0
    }

    pub fn set(&mut self, index: usize, value: bool) {
        let index = index % self.len;
        let mask = 1u64 << (index % 64);
        if value {
            self.words[index / 64] |= mask;
        } else {
            self.words[index / 64] &= !mask;
        }
    }

    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn clear(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }
}
