//! Bounded single-producer/single-consumer queue.
//!
//! Each pipeline stage hands owned values to the next through one of these:
//! a power-of-two ring of `Option<T>` slots with monotonic head/tail
//! positions. The producer writes the slot then release-stores the tail; the
//! consumer acquire-loads the tail, takes the slot, then release-stores the
//! head. Exactly one thread pushes and exactly one thread pops.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A bounded SPSC queue of owned values.
pub struct SpscQueue<T> {
    slots: Box<[UnsafeCell<Option<T>>]>,
    mask: usize,
    /// Consumer position, monotonically increasing.
    head: AtomicUsize,
    /// Producer position, monotonically increasing.
    tail: AtomicUsize,
}

// SAFETY: designed for one producer and one consumer. The tail release /
// acquire pair orders the producer's slot write before the consumer's take;
// the head release / acquire pair orders the consumer's take before the
// producer's reuse of the slot.
unsafe impl<T: Send> Send for SpscQueue<T> {}
unsafe impl<T: Send> Sync for SpscQueue<T> {}

impl<T> SpscQueue<T> {
    /// Create a queue holding at least `capacity` values (rounded up to a
    /// power of two).
    pub fn new(capacity: usize) -> Self {
        let cap = capacity.max(2).next_power_of_two();
        let slots = (0..cap)
            .map(|_| UnsafeCell::new(None))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            mask: cap - 1,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Push a value, handing it back when the queue is full.
    pub fn push(&self, value: T) -> Result<(), T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) > self.mask {
            return Err(value);
        }
        // SAFETY: the slot at `tail` is outside the consumer's window
        // (checked above) and this is the only producer.
        unsafe {
            *self.slots[tail & self.mask].get() = Some(value);
        }
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Pop the oldest value, if any.
    pub fn pop(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        // SAFETY: the slot at `head` was published by the tail release above
        // and this is the only consumer.
        let value = unsafe { (*self.slots[head & self.mask].get()).take() };
        self.head.store(head.wrapping_add(1), Ordering::Release);
        value
    }

    /// Values currently queued.
    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slot capacity.
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_fifo_order() {
        let queue = SpscQueue::new(8);
        for i in 0..5 {
            queue.push(i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(queue.pop(), Some(i));
        }
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_full_queue_returns_value() {
        let queue = SpscQueue::new(4);
        for i in 0..4 {
            queue.push(i).unwrap();
        }
        assert_eq!(queue.push(99), Err(99));
        assert_eq!(queue.pop(), Some(0));
        queue.push(99).unwrap();
    }

    #[test]
    fn test_moves_owned_values() {
        let queue = SpscQueue::new(4);
        queue.push(String::from("owned")).unwrap();
        let value = queue.pop().unwrap();
        assert_eq!(value, "owned");
    }

    #[test]
    fn test_producer_consumer_threads() {
        const COUNT: usize = 100_000;

        let queue = Arc::new(SpscQueue::new(64));
        let producer_side = Arc::clone(&queue);
        let producer = std::thread::spawn(move || {
            for i in 0..COUNT {
                let mut value = i;
                loop {
                    match producer_side.push(value) {
                        Ok(()) => break,
                        Err(back) => {
                            value = back;
                            std::hint::spin_loop();
                        }
                    }
                }
            }
        });

        let mut expected = 0;
        while expected < COUNT {
            if let Some(value) = queue.pop() {
                assert_eq!(value, expected);
                expected += 1;
            } else {
                std::hint::spin_loop();
            }
        }
        producer.join().unwrap();
        assert!(queue.is_empty());
    }
}
