//! Specialized collection types

/// Fixed-capacity pool of `u32` indices with LIFO reuse of released slots
#[derive(Debug, Clone)]
pub struct IndexPool {
    capacity: u32,
    next: u32,
    free_indices: Vec<u32>,
}

impl IndexPool {
    /// Create a pool handing out indices in `0..capacity`
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            next: 0,
            free_indices: Vec::new(),
        }
    }

    /// Take an index, or `None` when every slot is in use
    pub fn allocate(&mut self) -> Option<u32> {
        if let Some(index) = self.free_indices.pop() {
            return Some(index);
        }
        if self.next < self.capacity {
            let index = self.next;
            self.next += 1;
            Some(index)
        } else {
            None
        }
    }

    /// Return an index to the pool
    pub fn release(&mut self, index: u32) {
        debug_assert!(index < self.next, "index {index} was never allocated");
        self.free_indices.push(index);
    }

    /// Number of indices currently handed out
    pub fn in_use(&self) -> u32 {
        self.next - self.free_indices.len() as u32
    }

    /// Maximum number of indices
    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhaustion() {
        let mut pool = IndexPool::new(2);
        assert_eq!(pool.allocate(), Some(0));
        assert_eq!(pool.allocate(), Some(1));
        assert_eq!(pool.allocate(), None);
        assert_eq!(pool.in_use(), 2);
    }

    #[test]
    fn test_released_index_is_reused() {
        let mut pool = IndexPool::new(4);
        let a = pool.allocate().unwrap();
        let _b = pool.allocate().unwrap();
        pool.release(a);
        assert_eq!(pool.in_use(), 1);
        assert_eq!(pool.allocate(), Some(a));
    }
}
