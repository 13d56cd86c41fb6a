//! Frame-delayed release of GPU objects
//!
//! The GPU trails the CPU by up to frames-in-flight frames, so an object the
//! CPU is done with may still be referenced by submitted work. Objects pushed
//! here are dropped only after their countdown runs out.

use std::sync::{Mutex, MutexGuard};

struct DisposalEntry<T> {
    object: T,
    frames_remaining: u32,
}

/// FIFO of owned objects waiting out their frame countdown
pub struct DisposalQueue<T> {
    label: &'static str,
    default_life_time: u32,
    entries: Mutex<Vec<DisposalEntry<T>>>,
}

impl<T> DisposalQueue<T> {
    /// Queue whose entries live `default_life_time` frames unless told otherwise
    pub fn new(label: &'static str, default_life_time: u32) -> Self {
        Self {
            label,
            default_life_time,
            entries: Mutex::new(Vec::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, Vec<DisposalEntry<T>>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take ownership of `object` and release it after `life_time` frame syncs
    ///
    /// A life time of zero releases at the next [`Self::frame_sync`]. Pushing
    /// another handle to a shared object starts an independent countdown.
    pub fn push(&self, object: T, life_time: Option<u32>) {
        let frames_remaining = life_time.unwrap_or(self.default_life_time);
        self.entries().push(DisposalEntry {
            object,
            frames_remaining,
        });
    }

    /// Age every entry by one frame and drop those whose countdown ends
    ///
    /// Returns the number of objects released.
    pub fn frame_sync(&self) -> usize {
        let released: Vec<T> = {
            let mut entries = self.entries();
            let mut released = Vec::new();
            let mut kept = Vec::with_capacity(entries.len());
            for mut entry in entries.drain(..) {
                entry.frames_remaining = entry.frames_remaining.saturating_sub(1);
                if entry.frames_remaining == 0 {
                    released.push(entry.object);
                } else {
                    kept.push(entry);
                }
            }
            *entries = kept;
            released
        };
        // Dropped outside the lock; a release may push into another queue
        let count = released.len();
        if count > 0 {
            log::trace!("Disposal queue '{}' released {} objects", self.label, count);
        }
        drop(released);
        count
    }

    /// Drop everything immediately; only safe once the GPU is idle
    pub fn flush(&self) -> usize {
        let released: Vec<DisposalEntry<T>> = std::mem::take(&mut *self.entries());
        let count = released.len();
        if count > 0 {
            log::debug!("Disposal queue '{}' flushed {} objects", self.label, count);
        }
        drop(released);
        count
    }

    /// Objects still waiting
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Whether nothing is waiting
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Countdown used when `push` is given no life time
    pub fn default_life_time(&self) -> u32 {
        self.default_life_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_release_on_nth_sync() {
        for life_time in 1..=5u32 {
            let drops = Arc::new(AtomicUsize::new(0));
            let queue = DisposalQueue::new("test", 2);
            queue.push(DropCounter(drops.clone()), Some(life_time));

            for _ in 1..life_time {
                assert_eq!(queue.frame_sync(), 0);
                assert_eq!(drops.load(Ordering::SeqCst), 0);
            }
            assert_eq!(queue.frame_sync(), 1);
            assert_eq!(drops.load(Ordering::SeqCst), 1);
            assert!(queue.is_empty());
        }
    }

    #[test]
    fn test_zero_life_time_releases_at_next_sync() {
        let drops = Arc::new(AtomicUsize::new(0));
        let queue = DisposalQueue::new("test", 3);
        queue.push(DropCounter(drops.clone()), Some(0));
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        assert_eq!(queue.frame_sync(), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_default_life_time() {
        let drops = Arc::new(AtomicUsize::new(0));
        let queue = DisposalQueue::new("test", 3);
        queue.push(DropCounter(drops.clone()), None);
        assert_eq!(queue.frame_sync(), 0);
        assert_eq!(queue.frame_sync(), 0);
        assert_eq!(queue.frame_sync(), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shared_handle_pushed_twice_counts_twice() {
        let queue = DisposalQueue::new("test", 2);
        let shared = Arc::new(5u32);
        queue.push(shared.clone(), Some(1));
        queue.push(shared.clone(), Some(2));
        assert_eq!(Arc::strong_count(&shared), 3);
        assert_eq!(queue.frame_sync(), 1);
        assert_eq!(Arc::strong_count(&shared), 2);
        assert_eq!(queue.frame_sync(), 1);
        assert_eq!(Arc::strong_count(&shared), 1);
    }

    #[test]
    fn test_flush_releases_everything() {
        let drops = Arc::new(AtomicUsize::new(0));
        let queue = DisposalQueue::new("test", 8);
        for _ in 0..4 {
            queue.push(DropCounter(drops.clone()), None);
        }
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.flush(), 4);
        assert_eq!(drops.load(Ordering::SeqCst), 4);
        assert_eq!(queue.frame_sync(), 0);
    }

    #[test]
    fn test_push_from_many_threads() {
        let queue = DisposalQueue::new("test", 1);
        std::thread::scope(|scope| {
            for t in 0..4 {
                let queue = &queue;
                scope.spawn(move || {
                    for i in 0..25 {
                        queue.push(t * 100 + i, None);
                    }
                });
            }
        });
        assert_eq!(queue.len(), 100);
        assert_eq!(queue.frame_sync(), 100);
    }
}
