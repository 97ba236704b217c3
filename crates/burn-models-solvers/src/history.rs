//! Bounded output history for multistep solvers

/// Number of past predictions a solver may look at
pub const HISTORY_CAPACITY: usize = 2;

/// Fixed two-slot ring of `(step_index, prediction)` pairs
///
/// Pushing into a full ring evicts the oldest entry. The capacity caps
/// multistep solvers at second order.
#[derive(Debug, Clone)]
pub struct OutputHistory<T> {
    slots: [Option<(usize, T)>; HISTORY_CAPACITY],
    /// Slot holding the oldest entry
    head: usize,
    len: usize,
}

impl<T> Default for OutputHistory<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> OutputHistory<T> {
    /// Empty history
    pub fn new() -> Self {
        Self {
            slots: [None, None],
            head: 0,
            len: 0,
        }
    }

    /// Number of stored entries (0..=2)
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Record the prediction made at `step`
    pub fn push(&mut self, step: usize, prediction: T) {
        if self.len < HISTORY_CAPACITY {
            let slot = (self.head + self.len) % HISTORY_CAPACITY;
            self.slots[slot] = Some((step, prediction));
            self.len += 1;
        } else {
            self.slots[self.head] = Some((step, prediction));
            self.head = (self.head + 1) % HISTORY_CAPACITY;
        }
    }

    /// Most recent entry
    pub fn newest(&self) -> Option<(usize, &T)> {
        if self.len == 0 {
            return None;
        }
        self.entry((self.head + self.len - 1) % HISTORY_CAPACITY)
    }

    /// Entry before the most recent one, when the ring is full
    pub fn previous(&self) -> Option<(usize, &T)> {
        if self.len < HISTORY_CAPACITY {
            return None;
        }
        self.entry(self.head)
    }

    /// Entries from oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> + '_ {
        (0..self.len).filter_map(move |k| self.entry((self.head + k) % HISTORY_CAPACITY))
    }

    pub fn clear(&mut self) {
        self.slots = [None, None];
        self.head = 0;
        self.len = 0;
    }

    fn entry(&self, slot: usize) -> Option<(usize, &T)> {
        self.slots[slot].as_ref().map(|(step, value)| (*step, value))
    }
}
