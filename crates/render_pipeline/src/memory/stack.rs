//! Stack allocator for per-frame transient data

use super::{align_up, check_alignment};
use crate::error::{RenderError, RenderResult};

/// Saved stack position for [`StackAllocator::reset_to`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackMarker {
    cursor: u64,
    depth: usize,
}

/// Bump allocator over a fixed range
///
/// Never grows. Each allocation remembers the cursor it started from so a
/// LIFO `free` restores the exact previous position, alignment padding
/// included.
#[derive(Debug, Clone)]
pub struct StackAllocator {
    capacity: u64,
    cursor: u64,
    // (cursor before allocation, aligned offset)
    live: Vec<(u64, u64)>,
    high_water: u64,
}

impl StackAllocator {
    /// Create an empty stack over `capacity` bytes
    #[must_use]
    pub const fn new(capacity: u64) -> Self {
        Self {
            capacity,
            cursor: 0,
            live: Vec::new(),
            high_water: 0,
        }
    }

    /// Allocate `size` bytes aligned to `alignment`, returning the offset
    ///
    /// `alignment` must be a non-zero power of two.
    pub fn allocate(&mut self, size: u64, alignment: u64) -> RenderResult<u64> {
        check_alignment(alignment)?;
        let placed = align_up(self.cursor, alignment)
            .and_then(|offset| Some((offset, offset.checked_add(size)?)))
            .filter(|&(_, end)| end <= self.capacity);
        let Some((offset, end)) = placed else {
            return Err(RenderError::OutOfMemory { requested: size, alignment });
        };

        self.live.push((self.cursor, offset));
        self.cursor = end;
        self.high_water = self.high_water.max(end);
        Ok(offset)
    }

    /// Free the most recent allocation
    pub fn free(&mut self, offset: u64) -> RenderResult<()> {
        match self.live.last() {
            Some(&(previous, top)) if top == offset => {
                self.live.pop();
                self.cursor = previous;
                Ok(())
            }
            Some(&(_, top)) => Err(RenderError::InvalidState(format!(
                "stack free out of order: expected offset {top}, got {offset}"
            ))),
            None => Err(RenderError::invalid_state("stack free with no live allocation")),
        }
    }

    /// Current position, restorable with [`reset_to`](Self::reset_to)
    #[must_use]
    pub fn marker(&self) -> StackMarker {
        StackMarker {
            cursor: self.cursor,
            depth: self.live.len(),
        }
    }

    /// Release every allocation made after `marker`
    pub fn reset_to(&mut self, marker: StackMarker) -> RenderResult<()> {
        if marker.depth > self.live.len() || marker.cursor > self.cursor {
            return Err(RenderError::invalid_state("stack marker is newer than the current position"));
        }
        self.live.truncate(marker.depth);
        self.cursor = marker.cursor;
        Ok(())
    }

    /// Release every allocation
    pub fn reset(&mut self) {
        self.live.clear();
        self.cursor = 0;
    }

    /// Bytes in use, padding included
    #[must_use]
    pub const fn used(&self) -> u64 {
        self.cursor
    }

    /// Total capacity
    #[must_use]
    pub const fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Number of live allocations
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Highest cursor position ever reached
    #[must_use]
    pub const fn high_water(&self) -> u64 {
        self.high_water
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// After a reset, anything up to the previous cursor fits again
    #[test]
    fn test_reset_frees_everything() {
        let mut stack = StackAllocator::new(1024);
        for _ in 0..10 {
            stack.allocate(48, 16).unwrap();
        }
        let previous = stack.used();
        assert_eq!(stack.live_count(), 10);

        stack.reset();
        assert_eq!(stack.live_count(), 0);
        assert_eq!(stack.used(), 0);

        assert_eq!(stack.allocate(previous, 1).unwrap(), 0);
        assert_eq!(stack.capacity(), 1024);
    }

    #[test]
    fn test_lifo_free_restores_padding() {
        let mut stack = StackAllocator::new(1024);
        stack.allocate(3, 1).unwrap();
        let offset = stack.allocate(8, 256).unwrap();
        assert_eq!(offset, 256);

        stack.free(offset).unwrap();
        assert_eq!(stack.used(), 3);
    }

    #[test]
    fn test_out_of_order_free_rejected() {
        let mut stack = StackAllocator::new(1024);
        let first = stack.allocate(16, 16).unwrap();
        stack.allocate(16, 16).unwrap();

        assert!(matches!(stack.free(first), Err(RenderError::InvalidState(_))));
        assert!(matches!(StackAllocator::new(8).free(0), Err(RenderError::InvalidState(_))));
    }

    #[test]
    fn test_markers() {
        let mut stack = StackAllocator::new(1024);
        stack.allocate(100, 4).unwrap();
        let marker = stack.marker();
        stack.allocate(200, 4).unwrap();
        stack.allocate(300, 4).unwrap();

        stack.reset_to(marker).unwrap();
        assert_eq!(stack.used(), 100);
        assert_eq!(stack.live_count(), 1);
        assert_eq!(stack.high_water(), 600);

        stack.reset();
        assert!(stack.reset_to(marker).is_err());
    }

    #[test]
    fn test_exhaustion_never_grows() {
        let mut stack = StackAllocator::new(256);
        stack.allocate(200, 1).unwrap();

        let err = stack.allocate(100, 1).unwrap_err();
        assert!(matches!(err, RenderError::OutOfMemory { requested: 100, alignment: 1 }));
        assert_eq!(stack.capacity(), 256);
        assert!(stack.allocate(u64::MAX, 1).is_err());
    }

    #[test]
    fn test_invalid_alignment_rejected() {
        let mut stack = StackAllocator::new(1024);
        stack.allocate(5, 1).unwrap();

        assert!(matches!(stack.allocate(8, 3), Err(RenderError::InvalidState(_))));
        assert!(matches!(stack.allocate(8, 0), Err(RenderError::InvalidState(_))));
        assert_eq!(stack.live_count(), 1);
        assert_eq!(stack.used(), 5);
    }

    /// Cursor plus padding plus size past `u64::MAX` is exhaustion, not a wrap
    #[test]
    fn test_size_overflow_is_out_of_memory() {
        let mut stack = StackAllocator::new(1024);
        stack.allocate(100, 1).unwrap();

        let err = stack.allocate(u64::MAX - 10, 16).unwrap_err();
        assert!(matches!(err, RenderError::OutOfMemory { alignment: 16, .. }));
        assert_eq!(stack.used(), 100);
    }
}
