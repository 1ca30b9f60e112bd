//! Fixed-length bitmap used for both the inode and the data-block maps.
//! Bit `i` lives in byte `i / 8` under mask `1 << (i % 8)`.

use std::ops::Range;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    bits: Vec<u8>,
    len: usize,
}

impl Bitmap {
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![0; len.div_ceil(8)],
            len,
        }
    }

    pub fn from_bytes(bytes: &[u8], len: usize) -> Self {
        let mut bm = Self::new(len);
        let n = bm.bits.len().min(bytes.len());
        bm.bits[..n].copy_from_slice(&bytes[..n]);
        bm
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    // Checks whether the bit at idx is set
    pub fn test(&self, idx: usize) -> bool {
        idx < self.len && self.bits[idx / 8] & (1 << (idx % 8)) != 0
    }

    // Sets the bit at idx
    pub fn set(&mut self, idx: usize) {
        if idx < self.len {
            self.bits[idx / 8] |= 1 << (idx % 8);
        }
    }

    // Clears the bit at idx; already-clear bits stay clear
    pub fn clear(&mut self, idx: usize) {
        if idx < self.len {
            self.bits[idx / 8] &= !(1 << (idx % 8));
        }
    }

    pub fn set_range(&mut self, range: Range<usize>) {
        for i in range {
            self.set(i);
        }
    }

    pub fn clear_range(&mut self, range: Range<usize>) {
        for i in range {
            self.clear(i);
        }
    }

    pub fn count_set(&self) -> usize {
        (0..self.len).filter(|&i| self.test(i)).count()
    }

    /// Lowest clear bit, if any.
    pub fn first_clear(&self) -> Option<usize> {
        (0..self.len).find(|&i| !self.test(i))
    }

    /// Start of the lowest run of `run_len` bits that are clear or inside
    /// `treat_clear`. Each index is visited once, so no bit is counted twice.
    pub fn find_run(&self, run_len: usize, treat_clear: Range<usize>) -> Option<usize> {
        if run_len == 0 || run_len > self.len {
            return None;
        }
        let mut run = 0;
        for i in 0..self.len {
            if !self.test(i) || treat_clear.contains(&i) {
                run += 1;
                if run == run_len {
                    return Some(i + 1 - run_len);
                }
            } else {
                run = 0;
            }
        }
        None
    }
}
