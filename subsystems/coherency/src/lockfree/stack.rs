//! Bounded lock-free stack.
//!
//! Nodes are preallocated and linked by index. Both the value list and the
//! free list are Treiber stacks whose head packs `(tag << 32) | index`; the
//! tag changes on every successful pop, so a recycled node cannot satisfy a
//! stale compare-and-swap.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::line::CachePadded;

const NIL: u32 = u32::MAX;

#[inline(always)]
const fn pack(tag: u32, index: u32) -> u64 {
    ((tag as u64) << 32) | index as u64
}

#[inline(always)]
const fn unpack(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, word as u32)
}

struct Node<T> {
    next: AtomicU32,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Fixed-capacity LIFO stack
pub struct BoundedStack<T> {
    nodes: Box<[Node<T>]>,
    head: CachePadded<AtomicU64>,
    free: CachePadded<AtomicU64>,
}

// SAFETY: a node's value is only touched by the thread that popped the node
// off one of the two lists.
unsafe impl<T: Send> Send for BoundedStack<T> {}
// SAFETY: see above.
unsafe impl<T: Send> Sync for BoundedStack<T> {}

impl<T> BoundedStack<T> {
    /// Stack holding up to `capacity` items
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, NIL as usize - 1);
        let nodes: Vec<Node<T>> = (0..capacity)
            .map(|i| Node {
                next: AtomicU32::new(if i + 1 < capacity { i as u32 + 1 } else { NIL }),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Self {
            nodes: nodes.into_boxed_slice(),
            head: CachePadded::new(AtomicU64::new(pack(0, NIL))),
            free: CachePadded::new(AtomicU64::new(pack(0, 0))),
        }
    }

    /// Node count
    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    /// Push; gives the value back when full
    pub fn push(&self, value: T) -> Result<(), T> {
        let Some(index) = self.take(&self.free) else {
            return Err(value);
        };
        let node = &self.nodes[index as usize];
        // SAFETY: the node came off the free list, nobody else can reach it.
        unsafe { (*node.value.get()).write(value) };
        self.give(&self.head, index);
        Ok(())
    }

    /// Pop the most recent item
    pub fn pop(&self) -> Option<T> {
        let index = self.take(&self.head)?;
        let node = &self.nodes[index as usize];
        // SAFETY: the node came off the value list, so it holds a value that
        // was published by the Release in `give`.
        let value = unsafe { (*node.value.get()).assume_init_read() };
        self.give(&self.free, index);
        Some(value)
    }

    /// Is the stack empty right now?
    pub fn is_empty(&self) -> bool {
        unpack(self.head.load(Ordering::Acquire)).1 == NIL
    }

    fn take(&self, list: &AtomicU64) -> Option<u32> {
        let mut current = list.load(Ordering::Acquire);
        loop {
            let (tag, index) = unpack(current);
            if index == NIL {
                return None;
            }
            let next = self.nodes[index as usize].next.load(Ordering::Relaxed);
            match list.compare_exchange_weak(
                current,
                pack(tag.wrapping_add(1), next),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(index),
                Err(seen) => current = seen,
            }
        }
    }

    fn give(&self, list: &AtomicU64, index: u32) {
        let node = &self.nodes[index as usize];
        let mut current = list.load(Ordering::Relaxed);
        loop {
            let (tag, head) = unpack(current);
            node.next.store(head, Ordering::Relaxed);
            match list.compare_exchange_weak(
                current,
                pack(tag, index),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(seen) => current = seen,
            }
        }
    }
}

impl<T> Drop for BoundedStack<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

impl<T> core::fmt::Debug for BoundedStack<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BoundedStack")
            .field("capacity", &self.capacity())
            .field("empty", &self.is_empty())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn test_lifo_and_capacity() {
        let s = BoundedStack::new(3);
        s.push(1).unwrap();
        s.push(2).unwrap();
        s.push(3).unwrap();
        assert_eq!(s.push(4), Err(4));
        assert_eq!(s.pop(), Some(3));
        s.push(5).unwrap();
        assert_eq!(s.pop(), Some(5));
        assert_eq!(s.pop(), Some(2));
        assert_eq!(s.pop(), Some(1));
        assert_eq!(s.pop(), None);
        assert!(s.is_empty());
    }

    #[test]
    fn test_concurrent_push_pop_preserves_items() {
        const THREADS: u32 = 4;
        const PER_THREAD: u32 = 5_000;
        let s = Arc::new(BoundedStack::new(32));
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let s = s.clone();
                thread::spawn(move || {
                    let mut popped = Vec::new();
                    for i in 0..PER_THREAD {
                        let mut v = t * PER_THREAD + i;
                        loop {
                            match s.push(v) {
                                Ok(()) => break,
                                Err(back) => {
                                    v = back;
                                    if let Some(x) = s.pop() {
                                        popped.push(x);
                                    }
                                },
                            }
                        }
                        if i % 2 == 0 {
                            if let Some(x) = s.pop() {
                                popped.push(x);
                            }
                        }
                    }
                    popped
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for v in h.join().unwrap() {
                assert!(seen.insert(v), "value {} popped twice", v);
            }
        }
        while let Some(v) = s.pop() {
            assert!(seen.insert(v), "value {} popped twice", v);
        }
        assert_eq!(seen.len(), (THREADS * PER_THREAD) as usize);
    }
}
