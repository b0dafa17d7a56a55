use arrayvec::ArrayVec;

use crate::dma_buffer::{read_wrapping, write_wrapping, DmaBuffer, InitError};
use crate::dma_controller::Topology;
use crate::dma_memory::{DmaAllocator, DmaMemory};

/// Upper bound on links in one ring.
pub const MAX_LINKS: usize = 32;

/// next link address (u64), next link size (u32), flags (u32)
pub const LINK_HEADER_LEN: u32 = 16;
/// page address (u64), page size (u32), link ident (u32)
pub const TRANSFER_LINK_LEN: u32 = 16;

/// The device fetches link descriptors from 8-byte aligned addresses only.
pub const LINK_ALIGNMENT: u64 = 8;

const FLAG_LAST_LINK: u32 = 1 << 0;
const FLAG_REUSE_LINK: u32 = 1 << 1;
const TRANSFER_LINK_IDENT: u32 = 0x1;

/// How the data region is split up for one topology.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkLayout {
    pub links: u32,
    pub pages_per_link: u32,
}

impl LinkLayout {
    pub const fn for_topology(topology: Topology) -> Option<LinkLayout> {
        match topology {
            Topology::Linear => None,
            Topology::LinkChain => Some(LinkLayout {
                links: 4,
                pages_per_link: 4,
            }),
            Topology::LinkChainRing => Some(LinkLayout {
                links: 4,
                pages_per_link: 4,
            }),
            Topology::ReuseLinkRing => Some(LinkLayout {
                links: 2,
                pages_per_link: 8,
            }),
        }
    }

    pub const fn pages(self) -> u32 {
        self.links * self.pages_per_link
    }
}

/// Decoded view of one link, as the device will see it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkInfo {
    pub address: u64,
    pub bytes_used: u32,
    pub transfers: u32,
    pub next_address: u64,
    pub next_size: u32,
    pub last: bool,
    pub reuse: bool,
}

/// One link descriptor block: a header followed by transfer entries.
struct ChunkyLink<M> {
    memory: M,
    bytes_used: u32,
}

impl<M: DmaMemory> ChunkyLink<M> {
    fn new(mut memory: M) -> Self {
        memory.fill(0);
        Self {
            memory,
            bytes_used: LINK_HEADER_LEN,
        }
    }

    fn address(&self) -> u64 {
        self.memory.physical_address()
    }

    fn is_empty(&self) -> bool {
        self.bytes_used == LINK_HEADER_LEN
    }

    fn has_room(&self) -> bool {
        self.memory.len() - self.bytes_used >= TRANSFER_LINK_LEN
    }

    fn add_transfer(&mut self, address: u64, size: u32) {
        let mut entry = [0u8; TRANSFER_LINK_LEN as usize];
        entry[0..8].copy_from_slice(&address.to_le_bytes());
        entry[8..12].copy_from_slice(&size.to_le_bytes());
        entry[12..16].copy_from_slice(&TRANSFER_LINK_IDENT.to_le_bytes());

        self.memory.copy_in(self.bytes_used, &entry);
        self.bytes_used += TRANSFER_LINK_LEN;
    }

    /// `next` is the address and used size of the following link, `None`
    /// terminates the chain here.
    fn write_header(&mut self, next: Option<(u64, u32)>, reuse: bool) {
        let (address, size, mut flags) = match next {
            Some((address, size)) => (address, size, 0),
            None => (0, 0, FLAG_LAST_LINK),
        };
        if reuse {
            flags |= FLAG_REUSE_LINK;
        }

        let mut header = [0u8; LINK_HEADER_LEN as usize];
        header[0..8].copy_from_slice(&address.to_le_bytes());
        header[8..12].copy_from_slice(&size.to_le_bytes());
        header[12..16].copy_from_slice(&flags.to_le_bytes());
        self.memory.copy_in(0, &header);
    }

    fn info(&self) -> LinkInfo {
        let mut header = [0u8; LINK_HEADER_LEN as usize];
        self.memory.copy_out(0, &mut header);

        let mut next_address = [0u8; 8];
        next_address.copy_from_slice(&header[0..8]);
        let mut next_size = [0u8; 4];
        next_size.copy_from_slice(&header[8..12]);
        let mut flags = [0u8; 4];
        flags.copy_from_slice(&header[12..16]);
        let flags = u32::from_le_bytes(flags);

        LinkInfo {
            address: self.address(),
            bytes_used: self.bytes_used,
            transfers: (self.bytes_used - LINK_HEADER_LEN) / TRANSFER_LINK_LEN,
            next_address: u64::from_le_bytes(next_address),
            next_size: u32::from_le_bytes(next_size),
            last: flags & FLAG_LAST_LINK != 0,
            reuse: flags & FLAG_REUSE_LINK != 0,
        }
    }
}

/// Ring buffer walked by the device through a chain of link descriptors.
///
/// The data itself is one contiguous allocation split into equal pages, so the
/// host copies in and out of it as if it were a linear buffer. Only the device
/// follows the links.
pub struct ScatterGatherDmaBuffer<A: DmaAllocator> {
    data: Option<A::Memory>,
    size: u32,
    location: u32,
    links: ArrayVec<ChunkyLink<A::Memory>, MAX_LINKS>,
}

impl<A: DmaAllocator> ScatterGatherDmaBuffer<A> {
    pub const fn new() -> Self {
        Self {
            data: None,
            size: 0,
            location: 0,
            links: ArrayVec::new_const(),
        }
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn link(&self, index: usize) -> Option<LinkInfo> {
        self.links.get(index).map(ChunkyLink::info)
    }

    fn release_links(&mut self, allocator: &mut A) {
        for link in self.links.drain(..) {
            allocator.free_dma(link.memory);
        }
    }

    fn push_link(
        &mut self,
        allocator: &mut A,
        max_link_size: u32,
    ) -> Result<(), InitError<A::Error>> {
        if self.links.is_full() {
            return Err(InitError::LinkTableFull);
        }

        let memory = allocator
            .alloc_dma(max_link_size)
            .map_err(InitError::DescriptorAllocation)?;
        if memory.physical_address() % LINK_ALIGNMENT != 0 {
            allocator.free_dma(memory);
            return Err(InitError::BadLinkAlignment);
        }

        self.links.push(ChunkyLink::new(memory));
        Ok(())
    }

    fn add_transfer(
        &mut self,
        allocator: &mut A,
        max_link_size: u32,
        address: u64,
        size: u32,
        new_link: bool,
    ) -> Result<(), InitError<A::Error>> {
        let need_link = match self.links.last() {
            None => true,
            Some(tail) => (new_link && !tail.is_empty()) || !tail.has_room(),
        };
        if need_link {
            self.push_link(allocator, max_link_size)?;
        }

        match self.links.last_mut() {
            Some(tail) => {
                tail.add_transfer(address, size);
                Ok(())
            }
            None => Err(InitError::LinkTableFull),
        }
    }

    fn build(
        &mut self,
        allocator: &mut A,
        topology: Topology,
        max_link_size: u32,
    ) -> Result<(), InitError<A::Error>> {
        let base = match self.data.as_ref() {
            Some(data) => data.physical_address(),
            None => return Err(InitError::NotAllocated),
        };
        let layout = LinkLayout::for_topology(topology).ok_or(InitError::UnsupportedTopology)?;
        if max_link_size < LINK_HEADER_LEN + TRANSFER_LINK_LEN {
            return Err(InitError::LinkTooSmall);
        }

        let pages = layout.pages();
        if self.size < pages {
            return Err(InitError::PageTooSmall);
        }
        let page_size = (self.size - self.size % pages) / pages;
        let last_page_size = self.size - page_size * (pages - 1);

        let mut address = base;
        for page in 0..pages {
            let size = if page == pages - 1 {
                last_page_size
            } else {
                page_size
            };
            let new_link = page != 0 && page % layout.pages_per_link == 0;
            self.add_transfer(allocator, max_link_size, address, size, new_link)?;
            address += size as u64;
        }

        self.link_up(topology);

        trace!(
            "scatter gather ring: {} links, page size {}, last page {}",
            self.links.len(),
            page_size,
            last_page_size
        );
        Ok(())
    }

    /// Point every link at its successor and specialize the tail.
    fn link_up(&mut self, topology: Topology) {
        let count = self.links.len();
        let head = self.links.first().map(|link| (link.address(), link.bytes_used));

        for index in 0..count {
            let is_tail = index + 1 == count;
            let next = if is_tail {
                match topology {
                    Topology::LinkChainRing | Topology::ReuseLinkRing => head,
                    _ => None,
                }
            } else {
                let link = &self.links[index + 1];
                Some((link.address(), link.bytes_used))
            };
            let reuse = is_tail && topology == Topology::ReuseLinkRing;

            self.links[index].write_header(next, reuse);
        }
    }
}

impl<A: DmaAllocator> Default for ScatterGatherDmaBuffer<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: DmaAllocator> DmaBuffer<A> for ScatterGatherDmaBuffer<A> {
    fn allocate(&mut self, allocator: &mut A, size: u32) -> Result<(), A::Error> {
        let mut data = allocator.alloc_dma(size)?;
        data.fill(0);

        self.data = Some(data);
        self.size = size;
        self.location = 0;
        Ok(())
    }

    fn initialize(
        &mut self,
        allocator: &mut A,
        topology: Topology,
        max_link_size: u32,
    ) -> Result<(), InitError<A::Error>> {
        // rebuild from scratch when initialized again
        self.release_links(allocator);

        let result = self.build(allocator, topology, max_link_size);
        if result.is_err() {
            self.release_links(allocator);
        }
        result
    }

    fn start_address(&self) -> u64 {
        self.links.first().map(ChunkyLink::address).unwrap_or(0)
    }

    fn size(&self) -> u32 {
        self.size
    }

    fn link_size(&self) -> u32 {
        self.links.first().map(|link| link.bytes_used).unwrap_or(0)
    }

    fn location(&self) -> u32 {
        self.location
    }

    fn set_location(&mut self, offset: u32) {
        self.location = if self.size == 0 { 0 } else { offset % self.size };
    }

    fn read(&mut self, dst: &mut [u8]) {
        if let Some(data) = self.data.as_ref() {
            self.location = read_wrapping(data, self.size, self.location, dst);
        }
    }

    fn write(&mut self, src: &[u8]) {
        if let Some(data) = self.data.as_mut() {
            self.location = write_wrapping(data, self.size, self.location, src);
        }
    }

    fn free(&mut self, allocator: &mut A) {
        self.release_links(allocator);
        if let Some(data) = self.data.take() {
            allocator.free_dma(data);
        }
        self.size = 0;
        self.location = 0;
    }
}
