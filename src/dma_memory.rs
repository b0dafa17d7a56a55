use core::ptr::{self, NonNull};

/// Alignment of every region handed out by [`StaticDmaPool`].
pub const DMA_ALIGNMENT: usize = 64;

/// Trait which is implemented by host memory the device can master directly.
///
/// # Safety
///
/// The implementing type must be safe to use as the target of DMA transfers.
/// This means:
///
/// - `physical_address` must return the bus address of the first byte of the
///   region, and it must always return the same value for as long as the value
///   is alive.
/// - The region must be at least `len` bytes long and must not be freed or
///   reused while `self` is alive, even if the device is still transferring.
pub unsafe trait DmaMemory {
    /// Bus address of the first byte, as the device sees it.
    fn physical_address(&self) -> u64;

    fn len(&self) -> u32;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `dst.len()` bytes starting at `offset` out of the region.
    fn copy_out(&self, offset: u32, dst: &mut [u8]);

    /// Copy `src` into the region starting at `offset`.
    fn copy_in(&mut self, offset: u32, src: &[u8]);

    fn fill(&mut self, byte: u8);
}

/// Source of DMA capable memory, typically the bus the device sits on.
pub trait DmaAllocator {
    type Memory: DmaMemory;
    type Error: core::fmt::Debug;

    fn alloc_dma(&mut self, size: u32) -> Result<Self::Memory, Self::Error>;

    fn free_dma(&mut self, memory: Self::Memory);
}

impl<T: DmaAllocator + ?Sized> DmaAllocator for &mut T {
    type Memory = T::Memory;
    type Error = T::Error;

    fn alloc_dma(&mut self, size: u32) -> Result<Self::Memory, Self::Error> {
        T::alloc_dma(self, size)
    }

    fn free_dma(&mut self, memory: Self::Memory) {
        T::free_dma(self, memory)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PoolError {
    /// Not enough contiguous space left in the pool.
    Exhausted,
    ZeroSize,
}

/// Region lent out by a [`StaticDmaPool`].
pub struct PoolMemory {
    ptr: NonNull<u8>,
    offset: usize,
    len: u32,
    bus_address: u64,
}

// SAFETY: the pool never hands out overlapping regions and its storage is
// 'static, so the pointer stays valid for the lifetime of the region.
unsafe impl DmaMemory for PoolMemory {
    fn physical_address(&self) -> u64 {
        self.bus_address
    }

    fn len(&self) -> u32 {
        self.len
    }

    fn copy_out(&self, offset: u32, dst: &mut [u8]) {
        assert!(offset as usize + dst.len() <= self.len as usize);
        unsafe {
            ptr::copy_nonoverlapping(
                self.ptr.as_ptr().add(offset as usize),
                dst.as_mut_ptr(),
                dst.len(),
            );
        }
    }

    fn copy_in(&mut self, offset: u32, src: &[u8]) {
        assert!(offset as usize + src.len() <= self.len as usize);
        unsafe {
            ptr::copy_nonoverlapping(
                src.as_ptr(),
                self.ptr.as_ptr().add(offset as usize),
                src.len(),
            );
        }
    }

    fn fill(&mut self, byte: u8) {
        unsafe { ptr::write_bytes(self.ptr.as_ptr(), byte, self.len as usize) };
    }
}

/// Bump allocator over a `'static` byte slice, for targets where DMA memory
/// is a statically reserved block (identity mapped unless a bus offset is given).
///
/// Regions are reclaimed in LIFO order; once every region has been handed
/// back the whole block is available again.
pub struct StaticDmaPool {
    base: NonNull<u8>,
    capacity: usize,
    next: usize,
    outstanding: usize,
    bus_offset: u64,
}

impl StaticDmaPool {
    pub fn new(storage: &'static mut [u8]) -> Self {
        Self::with_bus_offset(storage, 0)
    }

    /// `bus_offset` is added to the CPU address of the storage to form the
    /// address the device uses.
    pub fn with_bus_offset(storage: &'static mut [u8], bus_offset: u64) -> Self {
        let capacity = storage.len();
        Self {
            base: NonNull::from(storage).cast::<u8>(),
            capacity,
            next: 0,
            outstanding: 0,
            bus_offset,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes still available behind the last handed out region.
    pub fn remaining(&self) -> usize {
        self.capacity - self.next
    }

    fn aligned_offset(&self, offset: usize) -> usize {
        let addr = self.base.as_ptr() as usize + offset;
        let misalignment = addr % DMA_ALIGNMENT;
        if misalignment == 0 {
            offset
        } else {
            offset + DMA_ALIGNMENT - misalignment
        }
    }
}

impl DmaAllocator for StaticDmaPool {
    type Memory = PoolMemory;
    type Error = PoolError;

    fn alloc_dma(&mut self, size: u32) -> Result<PoolMemory, PoolError> {
        if size == 0 {
            return Err(PoolError::ZeroSize);
        }

        let offset = self.aligned_offset(self.next);
        let end = offset
            .checked_add(size as usize)
            .ok_or(PoolError::Exhausted)?;
        if end > self.capacity {
            debug!(
                "dma pool exhausted: requested {} bytes, {} remaining",
                size,
                self.remaining()
            );
            return Err(PoolError::Exhausted);
        }

        // SAFETY: offset < end <= capacity, so the pointer stays inside the storage.
        let ptr = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) };
        let bus_address = (ptr.as_ptr() as usize as u64).wrapping_add(self.bus_offset);

        self.next = end;
        self.outstanding += 1;

        Ok(PoolMemory {
            ptr,
            offset,
            len: size,
            bus_address,
        })
    }

    fn free_dma(&mut self, memory: PoolMemory) {
        self.outstanding = self.outstanding.saturating_sub(1);
        if self.outstanding == 0 {
            self.next = 0;
        } else if memory.offset + memory.len as usize == self.next {
            self.next = memory.offset;
        }
    }
}
