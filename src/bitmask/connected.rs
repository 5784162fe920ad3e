use super::Bitmask;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Run {
    min: usize,
    max: usize,
}

/// Set stored as sorted, disjoint, non-adjacent inclusive runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectedBitmask {
    runs: Vec<Run>,
}

impl ConnectedBitmask {
    pub fn new() -> Self {
        ConnectedBitmask::default()
    }

    /// Set containing every bit in `min..=max`; empty if `min > max`.
    pub fn from_range(min: usize, max: usize) -> Self {
        let mut mask = ConnectedBitmask::new();
        if min <= max {
            mask.runs.push(Run { min, max });
        }
        mask
    }

    pub fn runs(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.runs.iter().map(|r| (r.min, r.max))
    }

    fn push_run(runs: &mut Vec<Run>, min: usize, max: usize) {
        if let Some(last) = runs.last_mut() {
            if last.max + 1 == min {
                last.max = max;
                return;
            }
        }
        runs.push(Run { min, max });
    }

    // Sweeps over every run boundary of both operands; membership is constant between two
    // consecutive boundaries.
    fn combine(&self, other: &Self, op: impl Fn(bool, bool) -> bool) -> Self {
        let (a, b) = (&self.runs, &other.runs);
        let mut bounds: Vec<usize> = Vec::with_capacity(2 * (a.len() + b.len()));
        for r in a.iter().chain(b.iter()) {
            bounds.push(r.min);
            bounds.push(r.max + 1);
        }
        bounds.sort_unstable();
        bounds.dedup();

        let mut runs = Vec::new();
        let (mut ia, mut ib) = (0, 0);
        for w in bounds.windows(2) {
            let (start, end) = (w[0], w[1]);
            while ia < a.len() && a[ia].max < start {
                ia += 1;
            }
            while ib < b.len() && b[ib].max < start {
                ib += 1;
            }
            let in_a = ia < a.len() && a[ia].min <= start;
            let in_b = ib < b.len() && b[ib].min <= start;
            if op(in_a, in_b) {
                Self::push_run(&mut runs, start, end - 1);
            }
        }
        ConnectedBitmask { runs }
    }

    // Index of the first run whose max is not below `bit`.
    fn locate(&self, bit: usize) -> usize {
        self.runs.partition_point(|r| r.max < bit)
    }
}

impl Bitmask for ConnectedBitmask {
    fn set(&mut self, bit: usize) {
        let idx = self.runs.partition_point(|r| r.max + 1 < bit);
        if idx == self.runs.len() {
            self.runs.push(Run { min: bit, max: bit });
            return;
        }
        let run = &mut self.runs[idx];
        if run.min <= bit && bit <= run.max {
            return;
        }
        if run.max + 1 == bit {
            run.max = bit;
            if idx + 1 < self.runs.len() && self.runs[idx + 1].min == bit + 1 {
                let next = self.runs.remove(idx + 1);
                self.runs[idx].max = next.max;
            }
            return;
        }
        if run.min == bit + 1 {
            run.min = bit;
            return;
        }
        self.runs.insert(idx, Run { min: bit, max: bit });
    }

    fn unset(&mut self, bit: usize) {
        let idx = self.locate(bit);
        if idx == self.runs.len() || self.runs[idx].min > bit {
            return;
        }
        let run = self.runs[idx];
        match (run.min == bit, run.max == bit) {
            (true, true) => {
                self.runs.remove(idx);
            }
            (true, false) => self.runs[idx].min = bit + 1,
            (false, true) => self.runs[idx].max = bit - 1,
            (false, false) => {
                self.runs[idx].max = bit - 1;
                self.runs.insert(idx + 1, Run { min: bit + 1, max: run.max });
            }
        }
    }

    fn is_set(&self, bit: usize) -> bool {
        let idx = self.locate(bit);
        idx < self.runs.len() && self.runs[idx].min <= bit
    }

    fn ones_count(&self) -> usize {
        self.runs.iter().map(|r| r.max - r.min + 1).sum()
    }

    fn len(&self) -> usize {
        self.runs.last().map_or(0, |r| r.max + 1)
    }

    fn is_zero(&self) -> bool {
        self.runs.is_empty()
    }

    fn and(&mut self, other: &Self) {
        *self = self.and_copy(other);
    }

    fn or(&mut self, other: &Self) {
        *self = self.or_copy(other);
    }

    fn xor(&mut self, other: &Self) {
        *self = self.xor_copy(other);
    }

    fn sub(&mut self, other: &Self) {
        *self = self.sub_copy(other);
    }

    fn and_copy(&self, other: &Self) -> Self {
        self.combine(other, |a, b| a && b)
    }

    fn or_copy(&self, other: &Self) -> Self {
        self.combine(other, |a, b| a || b)
    }

    fn xor_copy(&self, other: &Self) -> Self {
        self.combine(other, |a, b| a != b)
    }

    fn sub_copy(&self, other: &Self) -> Self {
        self.combine(other, |a, b| a && !b)
    }

    fn inject(&mut self, bit: usize, value: bool) {
        let idx = self.locate(bit);
        for run in &mut self.runs[idx..] {
            if run.min >= bit {
                run.min += 1;
            }
            run.max += 1;
        }
        if value {
            self.set(bit);
        } else {
            self.unset(bit);
        }
    }

    fn extract(&mut self, bit: usize) {
        self.unset(bit);
        let idx = self.locate(bit);
        for run in &mut self.runs[idx..] {
            run.min -= 1;
            run.max -= 1;
        }
        if idx > 0 && idx < self.runs.len() && self.runs[idx - 1].max + 1 == self.runs[idx].min {
            let next = self.runs.remove(idx);
            self.runs[idx - 1].max = next.max;
        }
    }

    fn ones(&self) -> Vec<usize> {
        self.runs.iter().flat_map(|r| r.min..=r.max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjacent_sets_merge_into_one_run() {
        let mut mask = ConnectedBitmask::new();
        mask.set(3);
        mask.set(5);
        assert_eq!(mask.runs().count(), 2);
        mask.set(4);
        assert_eq!(mask.runs().collect::<Vec<_>>(), vec![(3, 5)]);
    }

    #[test]
    fn unset_splits_run() {
        let mut mask = ConnectedBitmask::from_range(0, 9);
        mask.unset(4);
        assert_eq!(mask.runs().collect::<Vec<_>>(), vec![(0, 3), (5, 9)]);
        assert_eq!(mask.ones_count(), 9);
    }

    #[test]
    fn extract_rejoins_neighbours() {
        let mut mask = ConnectedBitmask::from_range(0, 9);
        mask.unset(4);
        mask.extract(4);
        assert_eq!(mask.runs().collect::<Vec<_>>(), vec![(0, 8)]);
    }

    #[test]
    fn inject_inside_run() {
        let mut mask = ConnectedBitmask::from_range(2, 5);
        mask.inject(3, false);
        assert_eq!(mask.runs().collect::<Vec<_>>(), vec![(2, 2), (4, 6)]);
        mask.inject(0, true);
        assert_eq!(mask.runs().collect::<Vec<_>>(), vec![(0, 0), (3, 3), (5, 7)]);
    }

    #[test]
    fn empty_range() {
        assert!(ConnectedBitmask::from_range(5, 4).is_zero());
    }
}
