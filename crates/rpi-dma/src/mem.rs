//! Physical memory plumbing: `/dev/mem` peripheral windows and locked,
//! physically-resolved DMA buffers.
//!
//! This is the only module that knows virtual-to-physical translation comes
//! from `/proc/self/pagemap` and that DMA buffers are re-mapped through
//! `/dev/mem` at the uncached bus alias. Both techniques are kernel-version
//! sensitive; replacing them with the VideoCore mailbox allocator on newer
//! kernels means replacing this module only.

use std::os::unix::io::RawFd;
use std::ptr;

use tracing::debug;

use crate::regs::{BUS_UNCACHED_RAM, PAGE_SIZE};
use crate::DmaError;

/// Round up to the next page boundary.
pub fn ceil_to_page(bytes: usize) -> usize {
    (bytes + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Open handles to `/dev/mem` and `/proc/self/pagemap`.
///
/// Held for the process lifetime: the uncached views of every DMA buffer are
/// mapped through the `/dev/mem` descriptor.
pub struct DevMem {
    mem_fd: RawFd,
    pagemap_fd: RawFd,
}

impl DevMem {
    pub fn open() -> Result<Self, DmaError> {
        let mem_fd = unsafe {
            libc::open(
                c"/dev/mem".as_ptr(),
                libc::O_RDWR | libc::O_SYNC | libc::O_CLOEXEC,
            )
        };
        if mem_fd < 0 {
            return Err(DmaError::DevMemOpen(std::io::Error::last_os_error()));
        }
        let pagemap_fd = unsafe {
            libc::open(
                c"/proc/self/pagemap".as_ptr(),
                libc::O_RDONLY | libc::O_CLOEXEC,
            )
        };
        if pagemap_fd < 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(mem_fd) };
            return Err(DmaError::PagemapOpen(err));
        }
        Ok(Self { mem_fd, pagemap_fd })
    }

    /// Map one page of a peripheral's registers into our address space.
    pub fn map_peripheral(&self, phys_addr: u32) -> Result<MmioRegion, DmaError> {
        let mapped = unsafe {
            libc::mmap(
                ptr::null_mut(),
                PAGE_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.mem_fd,
                phys_addr as libc::off_t,
            )
        };
        if mapped == libc::MAP_FAILED {
            return Err(DmaError::Mmap {
                what: "peripheral registers",
                source: std::io::Error::last_os_error(),
            });
        }
        debug!(phys = format_args!("{phys_addr:#x}"), virt = ?mapped, "mapped peripheral");
        Ok(MmioRegion {
            base: mapped as *mut u32,
        })
    }

    /// Translate a virtual address to its physical address via the pagemap.
    fn virt_to_phys(&self, virt: usize) -> Result<u64, DmaError> {
        let page_number = virt / PAGE_SIZE;
        let mut entry = 0u64;
        let read = unsafe {
            libc::pread(
                self.pagemap_fd,
                &mut entry as *mut u64 as *mut libc::c_void,
                8,
                (page_number * 8) as libc::off_t,
            )
        };
        if read != 8 {
            return Err(DmaError::PagemapRead { addr: virt });
        }
        // Bit 63: page present. Bits 0-54: page frame number.
        if entry & (1 << 63) == 0 {
            return Err(DmaError::PageNotPresent { addr: virt });
        }
        let pfn = entry & ((1 << 55) - 1);
        Ok(pfn * PAGE_SIZE as u64 + (virt % PAGE_SIZE) as u64)
    }
}

impl Drop for DevMem {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.pagemap_fd);
            libc::close(self.mem_fd);
        }
    }
}

/// A mapped window of peripheral registers. All access is volatile.
pub struct MmioRegion {
    base: *mut u32,
}

impl MmioRegion {
    pub fn read(&self, byte_offset: usize) -> u32 {
        unsafe { ptr::read_volatile(self.base.byte_add(byte_offset)) }
    }

    pub fn write(&self, byte_offset: usize, value: u32) {
        unsafe { ptr::write_volatile(self.base.byte_add(byte_offset), value) }
    }

    /// Set only the bits in `mask` to `value`, leaving the rest untouched.
    pub fn write_masked(&self, byte_offset: usize, mask: u32, value: u32) {
        let current = self.read(byte_offset);
        self.write(byte_offset, (current & !mask) | (value & mask));
    }

    /// Raw register address, for the exit handler's static state.
    pub fn addr_of(&self, byte_offset: usize) -> usize {
        self.base as usize + byte_offset
    }
}

/// A DMA-able buffer: locked into RAM, with its physical pages resolved and
/// a second, L1-bypassing view mapped at the uncached bus alias.
///
/// The CPU writes through the uncached view so the DMA engine (which snoops
/// only L2) always sees current data. The cached view exists to keep the
/// kernel's ownership of the physical pages alive and is not used after
/// initialization.
pub struct DmaMemory {
    cached: *mut u8,
    uncached: *mut u8,
    pages: Vec<u64>,
    len: usize,
}

impl DmaMemory {
    pub fn alloc(devmem: &DevMem, bytes: usize) -> Result<Self, DmaError> {
        let len = ceil_to_page(bytes);
        let cached = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_LOCKED,
                -1,
                0,
            )
        };
        if cached == libc::MAP_FAILED {
            return Err(DmaError::Mmap {
                what: "locked dma buffer",
                source: std::io::Error::last_os_error(),
            });
        }
        // Zeroing also faults every page in, so the pagemap has a physical
        // address for each before we ask.
        unsafe {
            ptr::write_bytes(cached as *mut u8, 0, len);
            if libc::mlock(cached, len) != 0 {
                libc::munmap(cached, len);
                return Err(DmaError::Mlock(len));
            }
        }

        let mut pages = Vec::with_capacity(len / PAGE_SIZE);
        for offset in (0..len).step_by(PAGE_SIZE) {
            pages.push(devmem.virt_to_phys(cached as usize + offset)?);
        }

        let uncached = Self::map_uncached_view(devmem, &pages, len)?;
        debug!(len, pages = pages.len(), "allocated dma memory");
        Ok(Self {
            cached: cached as *mut u8,
            uncached,
            pages,
            len,
        })
    }

    /// Build a contiguous virtual view of the buffer's physical pages through
    /// `/dev/mem` at the uncached alias: reserve a span of address space,
    /// then re-map it page by page with MAP_FIXED.
    fn map_uncached_view(
        devmem: &DevMem,
        pages: &[u64],
        len: usize,
    ) -> Result<*mut u8, DmaError> {
        let reserved = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if reserved == libc::MAP_FAILED {
            return Err(DmaError::Mmap {
                what: "uncached view reservation",
                source: std::io::Error::last_os_error(),
            });
        }
        let base = reserved as *mut u8;
        for (index, &phys) in pages.iter().enumerate() {
            let offset = index * PAGE_SIZE;
            let target = unsafe { base.add(offset) };
            let mapped = unsafe {
                libc::mmap(
                    target as *mut libc::c_void,
                    PAGE_SIZE,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED | libc::MAP_FIXED | libc::MAP_NORESERVE,
                    devmem.mem_fd,
                    (phys | BUS_UNCACHED_RAM as u64) as libc::off_t,
                )
            };
            if mapped != target as *mut libc::c_void {
                unsafe { libc::munmap(reserved, len) };
                return Err(DmaError::UncachedViewNotContiguous { offset });
            }
        }
        // The cached view was zeroed, but those writes may still sit in L1;
        // zero again through the uncached view.
        unsafe { ptr::write_bytes(base, 0, len) };
        Ok(base)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pointer for CPU access that the DMA engine will observe coherently.
    pub fn uncached_ptr(&self) -> *mut u8 {
        self.uncached
    }

    /// Bus address of the byte at `offset`, as the DMA engine must see it.
    pub fn bus_addr_at(&self, offset: usize) -> u32 {
        let phys = self.pages[offset / PAGE_SIZE] + (offset % PAGE_SIZE) as u64;
        phys as u32 | BUS_UNCACHED_RAM
    }
}

impl Drop for DmaMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.uncached as *mut libc::c_void, self.len);
            libc::munlock(self.cached as *mut libc::c_void, self.len);
            libc::munmap(self.cached as *mut libc::c_void, self.len);
        }
    }
}
