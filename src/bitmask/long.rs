use super::{words, Bitmask};

/// Flat word array without trailing zero words.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LongBitmask {
    words: Vec<u64>,
}

impl LongBitmask {
    pub fn new() -> Self {
        LongBitmask::default()
    }

    /// Set with every bit in `0..len`.
    pub fn all_ones(len: usize) -> Self {
        let mut words = vec![u64::MAX; len / 64];
        if len % 64 != 0 {
            words.push((1u64 << (len % 64)) - 1);
        }
        LongBitmask { words }
    }

    pub fn from_words(mut words: Vec<u64>) -> Self {
        words::trim(&mut words);
        LongBitmask { words }
    }

    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// Lowest set bit at or after `from`.
    pub fn next_set(&self, from: usize) -> Option<usize> {
        let mut index = from / 64;
        let mut word = *self.words.get(index)? & (u64::MAX << (from % 64));
        loop {
            if word != 0 {
                return Some(index * 64 + word.trailing_zeros() as usize);
            }
            index += 1;
            word = *self.words.get(index)?;
        }
    }
}

impl Bitmask for LongBitmask {
    fn set(&mut self, bit: usize) {
        let index = bit / 64;
        if self.words.len() <= index {
            self.words.resize(index + 1, 0);
        }
        self.words[index] |= 1 << (bit % 64);
    }

    fn unset(&mut self, bit: usize) {
        if let Some(word) = self.words.get_mut(bit / 64) {
            *word &= !(1 << (bit % 64));
            words::trim(&mut self.words);
        }
    }

    fn is_set(&self, bit: usize) -> bool {
        words::is_set(&self.words, bit)
    }

    fn ones_count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    fn len(&self) -> usize {
        words::len(&self.words)
    }

    fn is_zero(&self) -> bool {
        self.words.is_empty()
    }

    fn and(&mut self, other: &Self) {
        self.words.truncate(other.words.len());
        for (a, b) in self.words.iter_mut().zip(&other.words) {
            *a &= b;
        }
        words::trim(&mut self.words);
    }

    fn or(&mut self, other: &Self) {
        if self.words.len() < other.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (a, b) in self.words.iter_mut().zip(&other.words) {
            *a |= b;
        }
    }

    fn xor(&mut self, other: &Self) {
        if self.words.len() < other.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (a, b) in self.words.iter_mut().zip(&other.words) {
            *a ^= b;
        }
        words::trim(&mut self.words);
    }

    fn sub(&mut self, other: &Self) {
        for (a, b) in self.words.iter_mut().zip(&other.words) {
            *a &= !b;
        }
        words::trim(&mut self.words);
    }

    fn inject(&mut self, bit: usize, value: bool) {
        words::inject(&mut self.words, bit, value);
    }

    fn extract(&mut self, bit: usize) {
        words::extract(&mut self.words, bit);
    }

    fn ones(&self) -> Vec<usize> {
        words::ones(&self.words)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_ones_has_exact_length() {
        for len in [0, 1, 63, 64, 65, 130] {
            let mask = LongBitmask::all_ones(len);
            assert_eq!(mask.len(), len);
            assert_eq!(mask.ones_count(), len);
        }
    }

    #[test]
    fn next_set_walks_words() {
        let mut mask = LongBitmask::new();
        mask.set(3);
        mask.set(130);
        assert_eq!(mask.next_set(0), Some(3));
        assert_eq!(mask.next_set(4), Some(130));
        assert_eq!(mask.next_set(131), None);
    }
}
