use crate::dma_controller::Topology;
use crate::dma_memory::{DmaAllocator, DmaMemory};
use crate::scatter_gather::ScatterGatherDmaBuffer;

/// Errors raised while building the device's view of an allocated buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InitError<E> {
    /// `initialize` was called before `allocate`.
    NotAllocated,
    /// The backend cannot build this topology.
    UnsupportedTopology,
    /// The buffer is smaller than the number of pages of the topology.
    PageTooSmall,
    /// `max_link_size` cannot hold a header and one transfer.
    LinkTooSmall,
    LinkTableFull,
    /// Link descriptors must be 8-byte aligned.
    BadLinkAlignment,
    DescriptorAllocation(E),
}

/// Host side of a DMA buffer: owns the memory and copies bytes in and out of
/// it at a logical location that wraps at the buffer size.
pub trait DmaBuffer<A: DmaAllocator> {
    fn allocate(&mut self, allocator: &mut A, size: u32) -> Result<(), A::Error>;

    /// Build whatever the device needs to walk the buffer for `topology`.
    fn initialize(
        &mut self,
        allocator: &mut A,
        topology: Topology,
        max_link_size: u32,
    ) -> Result<(), InitError<A::Error>>;

    /// Address to program into the controller.
    fn start_address(&self) -> u64;

    fn size(&self) -> u32;

    /// Size of the first link, 0 for buffers without links.
    fn link_size(&self) -> u32;

    fn location(&self) -> u32;

    fn set_location(&mut self, offset: u32);

    /// Copy `dst.len()` bytes out of the buffer, advancing the location.
    fn read(&mut self, dst: &mut [u8]);

    /// Copy `src` into the buffer, advancing the location.
    fn write(&mut self, src: &[u8]);

    fn free(&mut self, allocator: &mut A);
}

/// Copy out of a ring of `size` bytes starting at `location`, splitting the
/// copy at the end of the ring. Returns the location after the copy.
pub(crate) fn read_wrapping<M: DmaMemory>(
    memory: &M,
    size: u32,
    location: u32,
    dst: &mut [u8],
) -> u32 {
    assert!(dst.len() <= size as usize);

    let to_end = (size - location) as usize;
    let first = dst.len().min(to_end);
    memory.copy_out(location, &mut dst[..first]);
    if first < dst.len() {
        memory.copy_out(0, &mut dst[first..]);
    }

    ((location as u64 + dst.len() as u64) % size as u64) as u32
}

/// Counterpart of [`read_wrapping`] for writes.
pub(crate) fn write_wrapping<M: DmaMemory>(
    memory: &mut M,
    size: u32,
    location: u32,
    src: &[u8],
) -> u32 {
    assert!(src.len() <= size as usize);

    let to_end = (size - location) as usize;
    let first = src.len().min(to_end);
    memory.copy_in(location, &src[..first]);
    if first < src.len() {
        memory.copy_in(0, &src[first..]);
    }

    ((location as u64 + src.len() as u64) % size as u64) as u32
}

/// One contiguous buffer, programmed into the controller by its base address.
pub struct LinearDmaBuffer<A: DmaAllocator> {
    memory: Option<A::Memory>,
    size: u32,
    location: u32,
}

impl<A: DmaAllocator> LinearDmaBuffer<A> {
    pub const fn new() -> Self {
        Self {
            memory: None,
            size: 0,
            location: 0,
        }
    }
}

impl<A: DmaAllocator> Default for LinearDmaBuffer<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: DmaAllocator> DmaBuffer<A> for LinearDmaBuffer<A> {
    fn allocate(&mut self, allocator: &mut A, size: u32) -> Result<(), A::Error> {
        let mut memory = allocator.alloc_dma(size)?;
        memory.fill(0);

        self.memory = Some(memory);
        self.size = size;
        self.location = 0;
        Ok(())
    }

    fn initialize(
        &mut self,
        _allocator: &mut A,
        _topology: Topology,
        _max_link_size: u32,
    ) -> Result<(), InitError<A::Error>> {
        // the controller addresses the memory directly
        if self.memory.is_none() {
            return Err(InitError::NotAllocated);
        }
        Ok(())
    }

    fn start_address(&self) -> u64 {
        self.memory
            .as_ref()
            .map(DmaMemory::physical_address)
            .unwrap_or(0)
    }

    fn size(&self) -> u32 {
        self.size
    }

    fn link_size(&self) -> u32 {
        0
    }

    fn location(&self) -> u32 {
        self.location
    }

    fn set_location(&mut self, offset: u32) {
        self.location = if self.size == 0 { 0 } else { offset % self.size };
    }

    fn read(&mut self, dst: &mut [u8]) {
        if let Some(memory) = self.memory.as_ref() {
            self.location = read_wrapping(memory, self.size, self.location, dst);
        }
    }

    fn write(&mut self, src: &[u8]) {
        if let Some(memory) = self.memory.as_mut() {
            self.location = write_wrapping(memory, self.size, self.location, src);
        }
    }

    fn free(&mut self, allocator: &mut A) {
        if let Some(memory) = self.memory.take() {
            allocator.free_dma(memory);
        }
        self.size = 0;
        self.location = 0;
    }
}

/// Buffer owned by a ring channel, chosen by the configured topology.
pub enum RingBuffer<A: DmaAllocator> {
    Linear(LinearDmaBuffer<A>),
    ScatterGather(ScatterGatherDmaBuffer<A>),
}

impl<A: DmaAllocator> RingBuffer<A> {
    pub fn for_topology(topology: Topology) -> Self {
        if topology.is_link_chain() {
            RingBuffer::ScatterGather(ScatterGatherDmaBuffer::new())
        } else {
            RingBuffer::Linear(LinearDmaBuffer::new())
        }
    }

    fn inner(&self) -> &dyn DmaBuffer<A> {
        match self {
            RingBuffer::Linear(buffer) => buffer,
            RingBuffer::ScatterGather(buffer) => buffer,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn DmaBuffer<A> {
        match self {
            RingBuffer::Linear(buffer) => buffer,
            RingBuffer::ScatterGather(buffer) => buffer,
        }
    }
}

impl<A: DmaAllocator> DmaBuffer<A> for RingBuffer<A> {
    fn allocate(&mut self, allocator: &mut A, size: u32) -> Result<(), A::Error> {
        self.inner_mut().allocate(allocator, size)
    }

    fn initialize(
        &mut self,
        allocator: &mut A,
        topology: Topology,
        max_link_size: u32,
    ) -> Result<(), InitError<A::Error>> {
        self.inner_mut()
            .initialize(allocator, topology, max_link_size)
    }

    fn start_address(&self) -> u64 {
        self.inner().start_address()
    }

    fn size(&self) -> u32 {
        self.inner().size()
    }

    fn link_size(&self) -> u32 {
        self.inner().link_size()
    }

    fn location(&self) -> u32 {
        self.inner().location()
    }

    fn set_location(&mut self, offset: u32) {
        self.inner_mut().set_location(offset)
    }

    fn read(&mut self, dst: &mut [u8]) {
        self.inner_mut().read(dst)
    }

    fn write(&mut self, src: &[u8]) {
        self.inner_mut().write(src)
    }

    fn free(&mut self, allocator: &mut A) {
        self.inner_mut().free(allocator)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::vec;
    use std::vec::Vec;

    /// Heap backed memory with a fake bus address, for host tests.
    pub struct HeapMemory {
        pub bytes: Vec<u8>,
        pub address: u64,
    }

    unsafe impl DmaMemory for HeapMemory {
        fn physical_address(&self) -> u64 {
            self.address
        }

        fn len(&self) -> u32 {
            self.bytes.len() as u32
        }

        fn copy_out(&self, offset: u32, dst: &mut [u8]) {
            let offset = offset as usize;
            dst.copy_from_slice(&self.bytes[offset..offset + dst.len()]);
        }

        fn copy_in(&mut self, offset: u32, src: &[u8]) {
            let offset = offset as usize;
            self.bytes[offset..offset + src.len()].copy_from_slice(src);
        }

        fn fill(&mut self, byte: u8) {
            self.bytes.fill(byte);
        }
    }

    #[derive(Default)]
    pub struct HeapAllocator {
        pub next_address: u64,
        pub live: usize,
        pub fail_after: Option<usize>,
        pub misalign: bool,
    }

    impl DmaAllocator for HeapAllocator {
        type Memory = HeapMemory;
        type Error = ();

        fn alloc_dma(&mut self, size: u32) -> Result<HeapMemory, ()> {
            if let Some(remaining) = self.fail_after.as_mut() {
                if *remaining == 0 {
                    return Err(());
                }
                *remaining -= 1;
            }

            let address = 0x1000_0000 + self.next_address + if self.misalign { 4 } else { 0 };
            self.next_address += (size as u64 + 0xFFF) & !0xFFF;
            self.live += 1;
            Ok(HeapMemory {
                bytes: vec![0x55; size as usize],
                address,
            })
        }

        fn free_dma(&mut self, _memory: HeapMemory) {
            self.live -= 1;
        }
    }

    #[test]
    fn allocation_zero_fills() {
        let mut allocator = HeapAllocator::default();
        let mut buffer = LinearDmaBuffer::<HeapAllocator>::new();
        buffer.allocate(&mut allocator, 8).unwrap();

        let mut out = [0xFFu8; 8];
        buffer.read(&mut out);
        assert_eq!(out, [0u8; 8]);
    }

    #[test]
    fn linear_copy_wraps_at_end() {
        let mut allocator = HeapAllocator::default();
        let mut buffer = LinearDmaBuffer::<HeapAllocator>::new();
        buffer.allocate(&mut allocator, 8).unwrap();
        buffer.initialize(&mut allocator, Topology::Linear, 0).unwrap();

        buffer.set_location(6);
        buffer.write(&[1, 2, 3, 4]);
        assert_eq!(buffer.location(), 2);

        buffer.set_location(6);
        let mut out = [0u8; 4];
        buffer.read(&mut out);
        assert_eq!(out, [1, 2, 3, 4]);
        assert_eq!(buffer.location(), 2);
    }

    #[test]
    fn full_size_copy_returns_to_same_location() {
        let mut allocator = HeapAllocator::default();
        let mut buffer = LinearDmaBuffer::<HeapAllocator>::new();
        buffer.allocate(&mut allocator, 4).unwrap();

        buffer.set_location(1);
        buffer.write(&[9, 8, 7, 6]);
        assert_eq!(buffer.location(), 1);

        let mut out = [0u8; 4];
        buffer.set_location(0);
        buffer.read(&mut out);
        assert_eq!(out, [6, 9, 8, 7]);
    }

    #[test]
    fn initialize_requires_allocation() {
        let mut allocator = HeapAllocator::default();
        let mut buffer = LinearDmaBuffer::<HeapAllocator>::new();

        assert_eq!(
            buffer.initialize(&mut allocator, Topology::Linear, 0),
            Err(InitError::NotAllocated)
        );
    }

    #[test]
    fn free_returns_memory() {
        let mut allocator = HeapAllocator::default();
        let mut buffer = RingBuffer::<HeapAllocator>::for_topology(Topology::Linear);
        buffer.allocate(&mut allocator, 32).unwrap();
        assert_eq!(allocator.live, 1);
        assert_eq!(buffer.start_address(), 0x1000_0000);
        assert_eq!(buffer.size(), 32);

        buffer.free(&mut allocator);
        assert_eq!(allocator.live, 0);
        assert_eq!(buffer.start_address(), 0);
    }

    #[test]
    fn topology_selects_backend() {
        assert!(matches!(
            RingBuffer::<HeapAllocator>::for_topology(Topology::Linear),
            RingBuffer::Linear(_)
        ));
        assert!(matches!(
            RingBuffer::<HeapAllocator>::for_topology(Topology::LinkChainRing),
            RingBuffer::ScatterGather(_)
        ));
    }
}
