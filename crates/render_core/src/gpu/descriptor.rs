//! Descriptor heaps
//!
//! A heap hands out indices under one coarse lock. Handles give their index
//! back on drop, so routing a handle through the descriptor disposal queue
//! delays reuse until the GPU has finished with the old contents.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::foundation::collections::IndexPool;
use crate::gpu::error::{GpuError, GpuResult};
use crate::gpu::types::DescriptorKind;

/// Fixed-capacity descriptor index allocator
pub struct DescriptorHeap {
    kind: DescriptorKind,
    pool: Mutex<IndexPool>,
}

impl DescriptorHeap {
    /// Create a heap with `capacity` descriptors
    pub fn new(kind: DescriptorKind, capacity: u32) -> Arc<Self> {
        Arc::new(Self {
            kind,
            pool: Mutex::new(IndexPool::new(capacity)),
        })
    }

    /// Heap kind
    pub fn kind(&self) -> DescriptorKind {
        self.kind
    }

    /// Allocate one descriptor
    pub fn allocate(self: &Arc<Self>) -> GpuResult<DescriptorHandle> {
        let mut pool = self.pool.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match pool.allocate() {
            Some(index) => Ok(DescriptorHandle {
                heap: Arc::clone(self),
                index,
            }),
            None => {
                log::warn!("Descriptor heap {:?} exhausted", self.kind);
                Err(GpuError::DescriptorHeapExhausted {
                    kind: self.kind,
                    capacity: pool.capacity(),
                })
            }
        }
    }

    /// Descriptors currently allocated
    pub fn in_use(&self) -> u32 {
        self.pool.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).in_use()
    }

    /// Heap capacity
    pub fn capacity(&self) -> u32 {
        self.pool.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).capacity()
    }

    fn release(&self, index: u32) {
        self.pool
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .release(index);
    }
}

impl fmt::Debug for DescriptorHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorHeap").field("kind", &self.kind).finish()
    }
}

/// One allocated descriptor; its index returns to the heap on drop
pub struct DescriptorHandle {
    heap: Arc<DescriptorHeap>,
    index: u32,
}

impl DescriptorHandle {
    /// Index inside the heap
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Heap kind
    pub fn kind(&self) -> DescriptorKind {
        self.heap.kind
    }
}

impl fmt::Debug for DescriptorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorHandle")
            .field("kind", &self.heap.kind)
            .field("index", &self.index)
            .finish()
    }
}

impl Drop for DescriptorHandle {
    fn drop(&mut self) {
        self.heap.release(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhaustion_reports_kind() {
        let heap = DescriptorHeap::new(DescriptorKind::Sampler, 1);
        let _first = heap.allocate().unwrap();
        match heap.allocate() {
            Err(GpuError::DescriptorHeapExhausted { kind, capacity }) => {
                assert_eq!(kind, DescriptorKind::Sampler);
                assert_eq!(capacity, 1);
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[test]
    fn test_drop_returns_index() {
        let heap = DescriptorHeap::new(DescriptorKind::Resource, 2);
        let first = heap.allocate().unwrap();
        let index = first.index();
        assert_eq!(heap.in_use(), 1);
        drop(first);
        assert_eq!(heap.in_use(), 0);
        assert_eq!(heap.allocate().unwrap().index(), index);
    }

    #[test]
    fn test_concurrent_allocation() {
        let heap = DescriptorHeap::new(DescriptorKind::Resource, 64);
        let handles: Vec<_> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..4)
                .map(|_| {
                    let heap = Arc::clone(&heap);
                    scope.spawn(move || (0..16).map(|_| heap.allocate().unwrap()).collect::<Vec<_>>())
                })
                .collect();
            workers.into_iter().flat_map(|w| w.join().unwrap()).collect()
        });
        let mut indices: Vec<u32> = handles.iter().map(DescriptorHandle::index).collect();
        indices.sort_unstable();
        indices.dedup();
        assert_eq!(indices.len(), 64);
        assert!(heap.allocate().is_err());
    }
}
