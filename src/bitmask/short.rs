use super::{words, Bitmask};

/// Chain of 64-bit words; the first node holds bits 0..64.
///
/// Trailing zero nodes are dropped after every shrinking operation, so two equal sets always
/// have the same chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShortBitmask {
    mask: u64,
    next: Option<Box<ShortBitmask>>,
}

pub struct Words<'a> {
    node: Option<&'a ShortBitmask>,
}

impl Iterator for Words<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        let node = self.node?;
        self.node = node.next.as_deref();
        Some(node.mask)
    }
}

impl ShortBitmask {
    pub fn new() -> Self {
        ShortBitmask::default()
    }

    pub fn words(&self) -> Words<'_> {
        Words { node: Some(self) }
    }

    pub fn from_words(words: impl IntoIterator<Item = u64>) -> Self {
        let mut words: Vec<u64> = words.into_iter().collect();
        words::trim(&mut words);
        let mut node: Option<Box<ShortBitmask>> = None;
        for mask in words.into_iter().rev() {
            node = Some(Box::new(ShortBitmask { mask, next: node }));
        }
        node.map(|n| *n).unwrap_or_default()
    }

    fn word_mut(&mut self, index: usize) -> &mut u64 {
        let mut node = self;
        for _ in 0..index {
            node = &mut **node.next.get_or_insert_with(Box::default);
        }
        &mut node.mask
    }

    fn to_vec(&self) -> Vec<u64> {
        self.words().collect()
    }

    fn shrink(&mut self) {
        let keep = self.words().enumerate().filter(|&(_, w)| w != 0).map(|(i, _)| i).last();
        let mut node = self;
        for _ in 0..keep.unwrap_or(0) {
            node = &mut **node.next.get_or_insert_with(Box::default);
        }
        node.next = None;
    }

    fn rebuild(&mut self, words: Vec<u64>) {
        *self = ShortBitmask::from_words(words);
    }
}

impl Bitmask for ShortBitmask {
    fn set(&mut self, bit: usize) {
        *self.word_mut(bit / 64) |= 1 << (bit % 64);
    }

    fn unset(&mut self, bit: usize) {
        if bit >= self.len() {
            return;
        }
        *self.word_mut(bit / 64) &= !(1 << (bit % 64));
        self.shrink();
    }

    fn is_set(&self, bit: usize) -> bool {
        self.words()
            .nth(bit / 64)
            .is_some_and(|w| (w >> (bit % 64)) & 1 != 0)
    }

    fn ones_count(&self) -> usize {
        self.words().map(|w| w.count_ones() as usize).sum()
    }

    fn len(&self) -> usize {
        words::len(&self.to_vec())
    }

    fn is_zero(&self) -> bool {
        self.words().all(|w| w == 0)
    }

    fn and(&mut self, other: &Self) {
        let words = words::combine(&self.to_vec(), &other.to_vec(), |a, b| a & b);
        self.rebuild(words);
    }

    fn or(&mut self, other: &Self) {
        let words = words::combine(&self.to_vec(), &other.to_vec(), |a, b| a | b);
        self.rebuild(words);
    }

    fn xor(&mut self, other: &Self) {
        let words = words::combine(&self.to_vec(), &other.to_vec(), |a, b| a ^ b);
        self.rebuild(words);
    }

    fn sub(&mut self, other: &Self) {
        let words = words::combine(&self.to_vec(), &other.to_vec(), |a, b| a & !b);
        self.rebuild(words);
    }

    fn inject(&mut self, bit: usize, value: bool) {
        let mut words = self.to_vec();
        words::inject(&mut words, bit, value);
        self.rebuild(words);
    }

    fn extract(&mut self, bit: usize) {
        let mut words = self.to_vec();
        words::extract(&mut words, bit);
        self.rebuild(words);
    }

    fn ones(&self) -> Vec<usize> {
        words::ones(&self.to_vec())
    }
}
