use crossbeam::queue::ArrayQueue;

/// A bounded lock-free ring buffer using crossbeam's ArrayQueue
///
/// Pushing into a full buffer hands the item back instead of blocking or
/// evicting, so the owner decides how to relieve the pressure.
#[derive(Debug)]
pub struct RingBuffer<T> {
    queue: ArrayQueue<T>,
}

impl<T> RingBuffer<T> {
    /// Create a new ring buffer with the specified capacity.
    ///
    /// Capacity must be non-zero.
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
        }
    }

    /// Attempt to push an item, returning it back if the buffer is full
    pub fn try_push(&self, item: T) -> Result<(), T> {
        self.queue.push(item)
    }

    /// Remove every buffered item, oldest first
    pub fn drain(&self) -> Vec<T> {
        let mut items = Vec::with_capacity(self.queue.len());
        while let Some(item) = self.queue.pop() {
            items.push(item);
        }
        items
    }

    /// Get the current size of the buffer
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
