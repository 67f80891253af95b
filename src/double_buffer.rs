//! Two copies of a resource with a single parity flag.
//!
//! GPU passes must never read and write the same storage. Every resource that
//! feeds back into itself (particle buffers, trail textures) lives in a
//! [`DoubleBuffer`]: one slot is `current` (most recently written), the other
//! `previous`. Swapping flips the flag; nothing is copied.

/// A pair of resources and the index of the current one.
#[derive(Debug)]
pub struct DoubleBuffer<T> {
    slots: [T; 2],
    current: usize,
}

impl<T> DoubleBuffer<T> {
    /// Create with `first` as the current slot.
    pub fn new(first: T, second: T) -> Self {
        Self {
            slots: [first, second],
            current: 0,
        }
    }

    /// Build both slots with the same constructor.
    pub fn from_fn<F: FnMut(usize) -> T>(mut f: F) -> Self {
        Self::new(f(0), f(1))
    }

    /// The most recently written slot.
    #[inline]
    pub fn current(&self) -> &T {
        &self.slots[self.current]
    }

    /// The slot written before `current`.
    #[inline]
    pub fn previous(&self) -> &T {
        &self.slots[1 - self.current]
    }

    #[inline]
    pub fn current_mut(&mut self) -> &mut T {
        &mut self.slots[self.current]
    }

    /// Index of the current slot (0 or 1).
    #[inline]
    pub fn parity(&self) -> usize {
        self.current
    }

    /// Slot by physical index, regardless of parity.
    #[inline]
    pub fn slot(&self, index: usize) -> &T {
        &self.slots[index]
    }

    pub fn swap(&mut self) {
        self.current = 1 - self.current;
    }

    /// Make `index` the current slot.
    pub fn set_parity(&mut self, index: usize) {
        debug_assert!(index < 2);
        self.current = index & 1;
    }

    /// Both slots in physical order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swap_exchanges_roles() {
        let mut buffers = DoubleBuffer::new("a", "b");
        assert_eq!((*buffers.current(), *buffers.previous()), ("a", "b"));
        buffers.swap();
        assert_eq!((*buffers.current(), *buffers.previous()), ("b", "a"));
        buffers.swap();
        assert_eq!(buffers.parity(), 0);
    }

    #[test]
    fn test_current_and_previous_never_alias() {
        let mut buffers = DoubleBuffer::from_fn(|i| i);
        for _ in 0..5 {
            assert_ne!(buffers.current(), buffers.previous());
            buffers.swap();
        }
    }

    #[test]
    fn test_set_parity() {
        let mut buffers = DoubleBuffer::from_fn(|i| i * 10);
        buffers.set_parity(1);
        assert_eq!(*buffers.current(), 10);
        assert_eq!(*buffers.slot(0), 0);
    }
}
