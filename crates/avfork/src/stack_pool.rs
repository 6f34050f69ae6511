// Lock-free pool of idle child stacks.

use crate::settings::SpawnSettings;
use crate::stack::Stack;
use crossbeam_queue::SegQueue;
use once_cell::sync::Lazy;
use std::mem;
use std::ops::{Deref, DerefMut};

static GLOBAL: Lazy<StackPool> = Lazy::new(|| StackPool::new(SpawnSettings::global().pool_capacity));

pub struct StackPool {
    queue: SegQueue<Stack>,
    capacity: usize,
}

impl StackPool {
    pub fn new(capacity: usize) -> StackPool {
        StackPool {
            queue: SegQueue::new(),
            capacity,
        }
    }

    /// The process-wide pool, sized from `SpawnSettings::global()`.
    pub fn global() -> &'static StackPool {
        &GLOBAL
    }

    /// Pop an idle stack, or hand out a fresh unmapped one.
    pub fn get(&self) -> Stack {
        self.queue.pop().unwrap_or_default()
    }

    /// Return a stack. Past capacity the stack is dropped, which unmaps it.
    pub fn put(&self, stack: Stack) {
        if !stack.is_mapped() || self.queue.len() >= self.capacity {
            return;
        }
        self.queue.push(stack);
    }

    /// Take a stack that goes back to this pool when the guard is dropped.
    pub fn checkout(&self) -> PooledStack<'_> {
        PooledStack {
            pool: self,
            stack: self.get(),
        }
    }

    /// Number of idle stacks.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

pub struct PooledStack<'a> {
    pool: &'a StackPool,
    stack: Stack,
}

impl Deref for PooledStack<'_> {
    type Target = Stack;

    fn deref(&self) -> &Stack {
        &self.stack
    }
}

impl DerefMut for PooledStack<'_> {
    fn deref_mut(&mut self) -> &mut Stack {
        &mut self.stack
    }
}

impl Drop for PooledStack<'_> {
    fn drop(&mut self) {
        self.pool.put(mem::take(&mut self.stack));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapped_stack() -> Stack {
        let mut stack = Stack::new();
        stack.reserve(4096, 0).unwrap();
        stack
    }

    #[test]
    fn get_from_empty_pool_creates_stack() {
        let pool = StackPool::new(2);
        assert!(pool.is_empty());
        assert!(!pool.get().is_mapped());
    }

    #[test]
    fn put_respects_capacity() {
        let pool = StackPool::new(2);
        pool.put(mapped_stack());
        pool.put(mapped_stack());
        pool.put(mapped_stack());
        assert_eq!(pool.len(), 2);

        assert!(pool.get().is_mapped());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn unmapped_stacks_are_not_pooled() {
        let pool = StackPool::new(4);
        pool.put(Stack::new());
        assert!(pool.is_empty());
    }

    #[test]
    fn checkout_returns_stack_on_drop() {
        let pool = StackPool::new(1);
        {
            let mut stack = pool.checkout();
            stack.reserve(8192, 0).unwrap();
        }
        assert_eq!(pool.len(), 1);

        let stack = pool.checkout();
        assert!(stack.size() >= 8192);
        assert!(pool.is_empty());
    }

    #[test]
    fn global_pool_uses_settings() {
        assert_eq!(StackPool::global().capacity(), SpawnSettings::global().pool_capacity);
    }
}
