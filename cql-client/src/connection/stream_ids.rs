//! Stream id allocation for one channel.

/// Bitmap of stream ids in use on a channel.
///
/// Allocation always returns the lowest free id.
#[derive(Debug, Clone)]
pub(crate) struct StreamIdSet {
    words: Vec<u64>,
    capacity: usize,
    in_use: usize,
}

impl StreamIdSet {
    /// Creates a set able to hand out ids `0..capacity`.
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            words: vec![0; capacity.div_ceil(64)],
            capacity,
            in_use: 0,
        }
    }

    /// Reserves the lowest free id.
    pub(crate) fn allocate(&mut self) -> Option<i16> {
        for (index, word) in self.words.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = (!*word).trailing_zeros() as usize;
            let id = index * 64 + bit;
            if id >= self.capacity {
                return None;
            }
            *word |= 1 << bit;
            self.in_use += 1;
            return i16::try_from(id).ok();
        }
        None
    }

    /// Returns an id to the set. Releasing a free id is a no-op.
    pub(crate) fn release(&mut self, id: i16) -> bool {
        let Ok(id) = usize::try_from(id) else {
            return false;
        };
        if id >= self.capacity {
            return false;
        }
        let mask = 1u64 << (id % 64);
        let word = &mut self.words[id / 64];
        if *word & mask == 0 {
            return false;
        }
        *word &= !mask;
        self.in_use -= 1;
        true
    }

    /// Returns true if the id is reserved.
    pub(crate) fn contains(&self, id: i16) -> bool {
        match usize::try_from(id) {
            Ok(id) if id < self.capacity => self.words[id / 64] & (1 << (id % 64)) != 0,
            _ => false,
        }
    }

    /// Returns the number of reserved ids.
    pub(crate) fn in_use(&self) -> usize {
        self.in_use
    }

    /// Returns the number of ids still available.
    pub(crate) fn available(&self) -> usize {
        self.capacity - self.in_use
    }
}
