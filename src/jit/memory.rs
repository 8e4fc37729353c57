//! Executable memory publication using mmap.
//!
//! The publisher takes a finished code buffer, copies it into one anonymous
//! page, and flips the protection from read-write to read-execute. The page
//! is never written again; it is unmapped when the handle drops.

use std::ptr::NonNull;

/// Error type for executable-memory operations.
#[derive(Debug, PartialEq, Eq)]
pub enum MemoryError {
    /// The OS refused the page allocation.
    AllocationFailed,
    /// The protection change to read-execute failed.
    ProtectionFailed,
    /// The code buffer is empty.
    EmptyCode,
    /// The code does not fit in a single page.
    CodeTooLarge { code: usize, page: usize },
    /// The host has no supported virtual-memory API.
    Unsupported,
}

impl std::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryError::AllocationFailed => write!(f, "executable page allocation failed"),
            MemoryError::ProtectionFailed => write!(f, "memory protection change failed"),
            MemoryError::EmptyCode => write!(f, "cannot publish an empty code buffer"),
            MemoryError::CodeTooLarge { code, page } => {
                write!(f, "code size {} exceeds page size {}", code, page)
            }
            MemoryError::Unsupported => {
                write!(f, "executable memory is not supported on this platform")
            }
        }
    }
}

impl std::error::Error for MemoryError {}

/// One page of published, executable machine code.
///
/// Constructed via [`ExecutableMemory::publish`]; by the time a value of
/// this type exists the page is already read-execute.
#[derive(Debug)]
pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    size: usize,
    code_len: usize,
}

impl ExecutableMemory {
    /// Copy `code` into a fresh page and make it executable.
    pub fn publish(code: &[u8]) -> Result<Self, MemoryError> {
        if code.is_empty() {
            return Err(MemoryError::EmptyCode);
        }

        let page = Self::page_size()?;
        if code.len() > page {
            return Err(MemoryError::CodeTooLarge {
                code: code.len(),
                page,
            });
        }

        let ptr = Self::map_writable(page)?;

        // SAFETY: the mapping is `page` bytes, writable, and freshly owned.
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr.as_ptr(), code.len());
        }

        Self::protect_executable(ptr, page)?;

        Ok(Self {
            ptr,
            size: page,
            code_len: code.len(),
        })
    }

    /// Entry pointer of the published code.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Size of the backing page.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Length of the machine code within the page.
    pub fn code_len(&self) -> usize {
        self.code_len
    }

    #[cfg(unix)]
    fn page_size() -> Result<usize, MemoryError> {
        // SAFETY: sysconf with a valid name has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size <= 0 {
            return Err(MemoryError::AllocationFailed);
        }
        Ok(size as usize)
    }

    #[cfg(unix)]
    fn map_writable(size: usize) -> Result<NonNull<u8>, MemoryError> {
        // SAFETY: anonymous private mapping, no file descriptor involved.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed);
        }

        NonNull::new(ptr as *mut u8).ok_or(MemoryError::AllocationFailed)
    }

    #[cfg(unix)]
    fn protect_executable(ptr: NonNull<u8>, size: usize) -> Result<(), MemoryError> {
        // SAFETY: `ptr` is the base of a live mapping of `size` bytes.
        let rc = unsafe {
            libc::mprotect(
                ptr.as_ptr() as *mut libc::c_void,
                size,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };

        if rc != 0 {
            // The mapping is unusable; release it rather than leak.
            // SAFETY: same mapping as above.
            unsafe {
                libc::munmap(ptr.as_ptr() as *mut libc::c_void, size);
            }
            return Err(MemoryError::ProtectionFailed);
        }

        Ok(())
    }

    #[cfg(not(unix))]
    fn page_size() -> Result<usize, MemoryError> {
        Err(MemoryError::Unsupported)
    }

    #[cfg(not(unix))]
    fn map_writable(_size: usize) -> Result<NonNull<u8>, MemoryError> {
        Err(MemoryError::Unsupported)
    }

    #[cfg(not(unix))]
    fn protect_executable(_ptr: NonNull<u8>, _size: usize) -> Result<(), MemoryError> {
        Err(MemoryError::Unsupported)
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        #[cfg(unix)]
        // SAFETY: we own the mapping and nothing else references it.
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
        }
    }
}

// The page is immutable once published and owned by exactly one handle.
unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}
