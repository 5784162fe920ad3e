//! Set representations over non-negative integers.
//!
//! All three types implement [`Bitmask`] and behave identically under it; they differ only in how
//! they store the set:
//! - [`ConnectedBitmask`] keeps sorted disjoint runs and suits mostly contiguous sets.
//! - [`ShortBitmask`] is a chain of 64-bit words that grows by appending nodes.
//! - [`LongBitmask`] is a flat word array for large persistent sets.

pub mod connected;
pub mod long;
pub mod short;

use std::fmt;

pub use connected::ConnectedBitmask;
pub use long::LongBitmask;
pub use short::ShortBitmask;

pub trait Bitmask: Clone + Default + PartialEq + fmt::Debug {
    fn set(&mut self, bit: usize);
    fn unset(&mut self, bit: usize);
    fn is_set(&self, bit: usize) -> bool;
    fn ones_count(&self) -> usize;
    /// One past the highest set bit, 0 for the empty set.
    fn len(&self) -> usize;
    fn is_zero(&self) -> bool;

    fn and(&mut self, other: &Self);
    fn or(&mut self, other: &Self);
    fn xor(&mut self, other: &Self);
    fn sub(&mut self, other: &Self);

    /// Inserts `bit` with `value`, moving every bit at or above it up by one.
    fn inject(&mut self, bit: usize, value: bool);
    /// Removes `bit`, moving every bit above it down by one.
    fn extract(&mut self, bit: usize);

    fn ones(&self) -> Vec<usize>;

    fn flip(&mut self, bit: usize) {
        if self.is_set(bit) {
            self.unset(bit);
        } else {
            self.set(bit);
        }
    }

    fn copy(&self) -> Self {
        self.clone()
    }

    fn and_copy(&self, other: &Self) -> Self {
        let mut result = self.clone();
        result.and(other);
        result
    }

    fn or_copy(&self, other: &Self) -> Self {
        let mut result = self.clone();
        result.or(other);
        result
    }

    fn xor_copy(&self, other: &Self) -> Self {
        let mut result = self.clone();
        result.xor(other);
        result
    }

    fn sub_copy(&self, other: &Self) -> Self {
        let mut result = self.clone();
        result.sub(other);
        result
    }
}

// Word-array helpers shared by the word based representations.
pub(crate) mod words {
    pub fn trim(words: &mut Vec<u64>) {
        while words.last() == Some(&0) {
            words.pop();
        }
    }

    pub fn is_set(words: &[u64], bit: usize) -> bool {
        words
            .get(bit / 64)
            .is_some_and(|w| (w >> (bit % 64)) & 1 != 0)
    }

    pub fn len(words: &[u64]) -> usize {
        match words.iter().rposition(|&w| w != 0) {
            Some(i) => i * 64 + (64 - words[i].leading_zeros() as usize),
            None => 0,
        }
    }

    pub fn combine(a: &[u64], b: &[u64], op: impl Fn(u64, u64) -> u64) -> Vec<u64> {
        let n = a.len().max(b.len());
        let mut out: Vec<u64> = (0..n)
            .map(|i| op(a.get(i).copied().unwrap_or(0), b.get(i).copied().unwrap_or(0)))
            .collect();
        trim(&mut out);
        out
    }

    pub fn inject(words: &mut Vec<u64>, bit: usize, value: bool) {
        let (w, off) = (bit / 64, bit % 64);
        if words.len() <= w {
            words.resize(w + 1, 0);
        }
        let low = (1u64 << off) - 1;
        let cur = words[w];
        let mut carry = cur >> 63;
        words[w] = (cur & low) | ((cur & !low) << 1) | ((value as u64) << off);
        for word in words[w + 1..].iter_mut() {
            let next = *word >> 63;
            *word = (*word << 1) | carry;
            carry = next;
        }
        if carry != 0 {
            words.push(carry);
        }
        trim(words);
    }

    pub fn extract(words: &mut Vec<u64>, bit: usize) {
        let (w, off) = (bit / 64, bit % 64);
        if w >= words.len() {
            return;
        }
        let low = (1u64 << off) - 1;
        let cur = words[w];
        words[w] = (cur & low) | ((cur >> 1) & !low);
        for i in w..words.len() {
            let borrow = words.get(i + 1).map_or(0, |next| next & 1);
            if i > w {
                words[i] >>= 1;
            }
            words[i] |= borrow << 63;
        }
        trim(words);
    }

    pub fn ones(words: &[u64]) -> Vec<usize> {
        let mut result = Vec::new();
        for (i, &word) in words.iter().enumerate() {
            let mut w = word;
            while w != 0 {
                let tz = w.trailing_zeros() as usize;
                result.push(i * 64 + tz);
                w &= w - 1;
            }
        }
        result
    }
}
