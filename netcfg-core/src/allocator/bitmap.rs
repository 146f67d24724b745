/// Growable in-use bitmap; bit `n` is offset `n` of an allocator range.
///
/// Length only grows. Clearing a bit never shortens it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bitmap {
    words: Vec<u64>,
    len: u64,
}

impl Bitmap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_set(&self, bit: u64) -> bool {
        if bit >= self.len {
            return false;
        }
        self.words[(bit / 64) as usize] & (1 << (bit % 64)) != 0
    }

    /// Set `bit`, extending the bitmap if it lies past the end
    pub fn set(&mut self, bit: u64) {
        if bit >= self.len {
            self.len = bit + 1;
            let needed = ((self.len + 63) / 64) as usize;
            if self.words.len() < needed {
                self.words.resize(needed, 0);
            }
        }
        self.words[(bit / 64) as usize] |= 1 << (bit % 64);
    }

    /// Clear `bit` if it is within the current length
    pub fn clear(&mut self, bit: u64) {
        if bit < self.len {
            self.words[(bit / 64) as usize] &= !(1 << (bit % 64));
        }
    }

    /// Lowest clear bit, or `len()` when every bit is set
    pub fn first_clear(&self) -> u64 {
        for (i, word) in self.words.iter().enumerate() {
            if *word != u64::MAX {
                let bit = i as u64 * 64 + word.trailing_ones() as u64;
                return bit.min(self.len);
            }
        }
        self.len
    }

    pub fn any(&self) -> bool {
        self.words.iter().any(|w| *w != 0)
    }

    pub fn count_ones(&self) -> u64 {
        self.words.iter().map(|w| w.count_ones() as u64).sum()
    }

    pub fn iter_ones(&self) -> impl Iterator<Item = u64> + '_ {
        self.words.iter().enumerate().flat_map(|(i, word)| {
            let word = *word;
            (0..64u64)
                .filter(move |b| word & (1 << b) != 0)
                .map(move |b| i as u64 * 64 + b)
        })
    }
}
