use md5::{Digest, Md5};

use crate::firestore::error::{invalid_argument, FirestoreResult};

/// Bloom filter sent with existence filters, over full document resource names.
///
/// Membership uses double hashing: the MD5 digest of the name is split into two little-endian
/// `u64`s `h1`, `h2`, and probe `i` tests bit `(h1 + i * h2) mod bit_count` with wrapping
/// arithmetic. Bit `n` lives in byte `n / 8` at position `n % 8`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    bitmap: Vec<u8>,
    bit_count: u64,
    hash_count: u32,
}

impl BloomFilter {
    /// `padding` is the number of unused high bits in the last byte.
    pub fn new(bitmap: Vec<u8>, padding: u32, hash_count: u32) -> FirestoreResult<Self> {
        if padding >= 8 {
            return Err(invalid_argument(format!("Invalid bloom filter padding: {padding}")));
        }
        if bitmap.is_empty() && padding != 0 {
            return Err(invalid_argument(format!(
                "Invalid bloom filter padding when bitmap is empty: {padding}"
            )));
        }
        if !bitmap.is_empty() && hash_count == 0 {
            return Err(invalid_argument("Invalid bloom filter hash count: 0"));
        }
        let bit_count = bitmap.len() as u64 * 8 - u64::from(padding);
        Ok(Self {
            bitmap,
            bit_count,
            hash_count,
        })
    }

    /// An empty filter of `bit_count` bits, for building filters locally.
    pub fn with_capacity(bit_count: u64, hash_count: u32) -> FirestoreResult<Self> {
        let bytes = bit_count.div_ceil(8) as usize;
        let padding = (bytes as u64 * 8 - bit_count) as u32;
        Self::new(vec![0; bytes], padding, hash_count)
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    pub fn bitmap(&self) -> &[u8] {
        &self.bitmap
    }

    pub fn padding(&self) -> u32 {
        (self.bitmap.len() as u64 * 8 - self.bit_count) as u32
    }

    pub fn might_contain(&self, value: &str) -> bool {
        if self.bit_count == 0 {
            return false;
        }
        let (h1, h2) = hash_pair(value);
        (0..self.hash_count).all(|i| self.is_bit_set(self.bit_index(h1, h2, i)))
    }

    pub fn insert(&mut self, value: &str) {
        if self.bit_count == 0 {
            return;
        }
        let (h1, h2) = hash_pair(value);
        for i in 0..self.hash_count {
            let index = self.bit_index(h1, h2, i);
            self.bitmap[(index / 8) as usize] |= 1 << (index % 8);
        }
    }

    fn bit_index(&self, h1: u64, h2: u64, i: u32) -> u64 {
        h1.wrapping_add(h2.wrapping_mul(u64::from(i))) % self.bit_count
    }

    fn is_bit_set(&self, index: u64) -> bool {
        self.bitmap[(index / 8) as usize] & (1 << (index % 8)) != 0
    }
}

fn hash_pair(value: &str) -> (u64, u64) {
    let digest = Md5::digest(value.as_bytes());
    let mut first = [0u8; 8];
    let mut second = [0u8; 8];
    first.copy_from_slice(&digest[..8]);
    second.copy_from_slice(&digest[8..16]);
    (u64::from_le_bytes(first), u64::from_le_bytes(second))
}
