// Cached child stacks.
//
// A `Stack` is an anonymous mapping with a PROT_NONE guard page at its low
// end. The top of the stack holds the objects the child needs (its callback
// context); everything below them is the child's call stack.

use avfork_syscall::{get_pagesz, SyscallError};
use nix::errno::Errno;
use std::marker::PhantomData;
use std::mem;
use std::os::raw::c_void;
use std::ptr;

/// Stack pointer alignment required by every ABI we run on.
const STACK_ALIGN: usize = 16;

#[derive(Debug)]
pub struct Stack {
    /// start of the mapping, guard page included
    addr: *mut c_void,
    /// length of the mapping, guard page included
    size: usize,
}

// The mapping is only reachable through the `Stack` that owns it.
unsafe impl Send for Stack {}

impl Default for Stack {
    fn default() -> Stack {
        Stack::new()
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        self.unmap();
    }
}

impl Stack {
    /// An empty stack. Nothing is mapped until `reserve` is called.
    pub const fn new() -> Stack {
        Stack {
            addr: ptr::null_mut(),
            size: 0,
        }
    }

    /// Usable bytes, excluding the guard page.
    pub fn size(&self) -> usize {
        if self.addr.is_null() {
            0
        } else {
            self.size - get_pagesz()
        }
    }

    pub fn is_mapped(&self) -> bool {
        !self.addr.is_null()
    }

    /// Make sure at least `reserved_stack_sz` bytes of call stack remain once
    /// `reserved_obj_sz` bytes of objects have been placed on top.
    ///
    /// The mapping is only replaced when it is too small, so a stack taken
    /// from the pool is usually reused as is.
    pub fn reserve(
        &mut self,
        reserved_stack_sz: usize,
        reserved_obj_sz: usize,
    ) -> Result<StackObjectAllocator<'_>, SyscallError> {
        let pagesz = get_pagesz();
        let obj_sz = round_up(reserved_obj_sz, STACK_ALIGN).ok_or(Errno::ENOMEM)?;
        let wanted = reserved_stack_sz
            .checked_add(obj_sz)
            .and_then(|sz| round_up(sz, pagesz))
            .ok_or(Errno::ENOMEM)?;

        if self.size() < wanted {
            self.unmap();
            self.map(wanted + pagesz)?;
            tracing::debug!(size = wanted, "mapped new child stack");
        }

        let top = self.addr as usize + self.size;
        Ok(StackObjectAllocator {
            top,
            cursor: top,
            limit: top - obj_sz,
            _stack: PhantomData,
        })
    }

    fn map(&mut self, size: usize) -> Result<(), SyscallError> {
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(SyscallError::last());
        }

        if unsafe { libc::mprotect(addr, get_pagesz(), libc::PROT_NONE) } != 0 {
            let err = SyscallError::last();
            unsafe { libc::munmap(addr, size) };
            return Err(err);
        }

        self.addr = addr;
        self.size = size;
        Ok(())
    }

    fn unmap(&mut self) {
        if self.addr.is_null() {
            return;
        }
        let ret = unsafe { libc::munmap(self.addr, self.size) };
        debug_assert_eq!(ret, 0, "munmap of a child stack failed");
        self.addr = ptr::null_mut();
        self.size = 0;
    }
}

fn round_up(value: usize, align: usize) -> Option<usize> {
    Some(value.checked_add(align - 1)? / align * align)
}

/// Places objects at the top of a reserved `Stack`.
///
/// Borrowing the stack mutably keeps it from being remapped or dropped while
/// the allocator, and anything allocated from it, is alive. Objects are never
/// dropped by the allocator.
pub struct StackObjectAllocator<'a> {
    top: usize,
    /// lowest address handed out so far
    cursor: usize,
    /// objects may not go below this address
    limit: usize,
    _stack: PhantomData<&'a mut Stack>,
}

impl<'a> StackObjectAllocator<'a> {
    /// Move `obj` onto the stack. Gives `obj` back if the reserved object
    /// area cannot fit it.
    pub fn alloc_obj<T>(&mut self, obj: T) -> Result<&mut T, T> {
        let addr = match self.cursor.checked_sub(mem::size_of::<T>()) {
            Some(addr) => addr & !(mem::align_of::<T>() - 1),
            None => return Err(obj),
        };
        if addr < self.limit {
            return Err(obj);
        }
        self.cursor = addr;

        let slot = addr as *mut T;
        unsafe {
            // the slot is uninitialized memory, so write without dropping
            slot.write(obj);
            Ok(&mut *slot)
        }
    }

    /// Bytes of the object area used so far, alignment padding included.
    pub fn allocated(&self) -> usize {
        self.top - self.cursor
    }

    /// Bytes still free in the object area.
    pub fn remaining(&self) -> usize {
        self.cursor - self.limit
    }

    /// Initial stack pointer for the child: just below the allocated objects.
    pub fn stack_top(&self) -> *mut c_void {
        (self.cursor & !(STACK_ALIGN - 1)) as *mut c_void
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_stack_maps_nothing() {
        let stack = Stack::new();
        assert!(!stack.is_mapped());
        assert_eq!(stack.size(), 0);
    }

    #[test]
    fn reserve_rounds_to_pages() {
        let pagesz = get_pagesz();
        let mut stack = Stack::new();
        stack.reserve(100, 10).unwrap();
        assert!(stack.is_mapped());
        assert_eq!(stack.size(), pagesz);
    }

    #[test]
    fn reserve_reuses_a_large_enough_mapping() {
        let mut stack = Stack::new();
        stack.reserve(64 * 1024, 64).unwrap();
        let (addr, size) = (stack.addr, stack.size);

        stack.reserve(16 * 1024, 64).unwrap();
        assert_eq!((stack.addr, stack.size), (addr, size));

        stack.reserve(256 * 1024, 64).unwrap();
        assert!(stack.size() >= 256 * 1024 + 64);
    }

    #[test]
    fn reserve_overflow_is_rejected() {
        let mut stack = Stack::new();
        let err = stack.reserve(usize::MAX, 1).err().unwrap();
        assert_eq!(err.errno(), Errno::ENOMEM);
        assert!(!stack.is_mapped());
    }

    #[test]
    fn alloc_obj_is_aligned_and_bounded() {
        let mut stack = Stack::new();
        let mut alloc = stack.reserve(4096, 32).unwrap();

        let byte = alloc.alloc_obj(7u8).unwrap();
        assert_eq!(*byte, 7);

        let word = alloc.alloc_obj(0xdead_beef_u64).unwrap();
        assert_eq!(word as *mut u64 as usize % mem::align_of::<u64>(), 0);
        assert_eq!(*word, 0xdead_beef);

        assert!(alloc.allocated() <= 32);
        assert_eq!(alloc.alloc_obj([0u8; 64]).err(), Some([0u8; 64]));
        assert_eq!(alloc.stack_top() as usize % STACK_ALIGN, 0);
    }

    #[test]
    fn empty_allocator_starts_at_the_top() {
        let mut stack = Stack::new();
        let top = stack.reserve(8192, 0).unwrap().stack_top() as usize;
        assert_eq!(top, stack.addr as usize + stack.size);
    }

    #[test]
    fn stack_memory_is_writable_below_the_objects() {
        let mut stack = Stack::new();
        let pagesz = get_pagesz();
        let alloc = stack.reserve(2 * pagesz, 0).unwrap();
        let top = alloc.stack_top() as *mut u8;

        unsafe {
            // the lowest usable byte sits right above the guard page
            let lowest = top.sub(2 * pagesz);
            lowest.write(1);
            top.sub(1).write(2);
            assert_eq!(lowest.read(), 1);
        }
    }
}
