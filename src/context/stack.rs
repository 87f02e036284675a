//! Stack memory for coroutine contexts.

use std::{ffi, io, ptr};

/// A stack region handed out by an allocator. Stacks grow downward: `sp` is
/// the highest address, the usable bytes span `[sp - size, sp)`.
#[derive(Debug, Copy, Clone)]
pub struct StackDesc {
    pub sp: *mut u8,
    pub size: usize,
}

/// Acquires and releases fixed-size coroutine stacks.
///
/// Allocators are movable values; `callcc` moves the allocator into the
/// stack's control record so the stack can reclaim itself when its context
/// finishes.
pub trait StackAllocator {
    fn allocate(&self) -> io::Result<StackDesc>;
    fn deallocate(&self, stack: StackDesc);
}

/// Default allocator: anonymous `mmap` with a guard page at the low end.
/// Demand paging ensures physical memory is committed only on first touch,
/// and the guard page turns stack overflow into a fault instead of silent
/// corruption.
#[derive(Debug, Copy, Clone)]
pub struct MmapStackAllocator {
    guard_pages: usize,
    usable_pages: usize,
}

impl MmapStackAllocator {
    pub fn new(guard_pages: usize, usable_pages: usize) -> Self {
        assert!(guard_pages > 0 && usable_pages > 0);
        MmapStackAllocator {
            guard_pages,
            usable_pages,
        }
    }
}

impl Default for MmapStackAllocator {
    /// 256 KiB of usable stack behind one guard page.
    fn default() -> Self {
        MmapStackAllocator::new(1, 64)
    }
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

impl StackAllocator for MmapStackAllocator {
    fn allocate(&self) -> io::Result<StackDesc> {
        let page_size = page_size();
        assert_eq!(page_size, 4096);
        let length = (self.guard_pages + self.usable_pages) * page_size;

        // kernel allocates an unused block of virtual memory
        let pointer = unsafe {
            libc::mmap(
                ptr::null_mut(),
                length,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if pointer == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        // located at the lowest addresses since the stack grows downward
        let result =
            unsafe { libc::mprotect(pointer, self.guard_pages * page_size, libc::PROT_NONE) };
        if result == -1 {
            let error = io::Error::last_os_error();
            unsafe { libc::munmap(pointer, length) };
            return Err(error);
        }

        Ok(StackDesc {
            sp: unsafe { (pointer as *mut u8).add(length) },
            size: self.usable_pages * page_size,
        })
    }

    fn deallocate(&self, stack: StackDesc) {
        let page_size = page_size();
        let length = (self.guard_pages + self.usable_pages) * page_size;
        let base = unsafe { stack.sp.sub(length) };
        let result = unsafe { libc::munmap(base as *mut ffi::c_void, length) };
        assert_eq!(result, 0);
    }
}
