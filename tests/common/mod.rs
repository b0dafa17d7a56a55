#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use dma_ring_channel::scatter_gather::LINK_HEADER_LEN;
use dma_ring_channel::{ChannelStatus, DmaAllocator, DmaController, DmaMemory, Topology};

/// Region handed out by [`SimBus`]; the bytes stay reachable through the bus
/// by physical address, the way the device would see them.
pub struct SimMemory {
    address: u64,
    bytes: Rc<RefCell<Vec<u8>>>,
}

unsafe impl DmaMemory for SimMemory {
    fn physical_address(&self) -> u64 {
        self.address
    }

    fn len(&self) -> u32 {
        self.bytes.borrow().len() as u32
    }

    fn copy_out(&self, offset: u32, dst: &mut [u8]) {
        let offset = offset as usize;
        dst.copy_from_slice(&self.bytes.borrow()[offset..offset + dst.len()]);
    }

    fn copy_in(&mut self, offset: u32, src: &[u8]) {
        let offset = offset as usize;
        self.bytes.borrow_mut()[offset..offset + src.len()].copy_from_slice(src);
    }

    fn fill(&mut self, byte: u8) {
        self.bytes.borrow_mut().fill(byte);
    }
}

#[derive(Default)]
struct BusState {
    next_address: u64,
    regions: BTreeMap<u64, Rc<RefCell<Vec<u8>>>>,
    fail_next: bool,
}

/// Host bus with DMA capable memory. Cloning gives another handle to the
/// same bus.
#[derive(Clone, Default)]
pub struct SimBus {
    state: Rc<RefCell<BusState>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutOfMemory;

impl SimBus {
    pub fn new() -> Self {
        let bus = Self::default();
        bus.state.borrow_mut().next_address = 0x4000_0000;
        bus
    }

    pub fn live_regions(&self) -> usize {
        self.state.borrow().regions.len()
    }

    pub fn fail_next_allocation(&self) {
        self.state.borrow_mut().fail_next = true;
    }

    fn region(&self, address: u64) -> (Rc<RefCell<Vec<u8>>>, usize) {
        let state = self.state.borrow();
        let (base, bytes) = state
            .regions
            .range(..=address)
            .next_back()
            .expect("address not mapped");
        let offset = (address - base) as usize;
        assert!(offset < bytes.borrow().len(), "address not mapped");
        (bytes.clone(), offset)
    }

    pub fn peek(&self, address: u64, len: usize) -> Vec<u8> {
        let (bytes, offset) = self.region(address);
        let bytes = bytes.borrow();
        bytes[offset..offset + len].to_vec()
    }

    pub fn poke(&self, address: u64, data: &[u8]) {
        let (bytes, offset) = self.region(address);
        bytes.borrow_mut()[offset..offset + data.len()].copy_from_slice(data);
    }
}

impl DmaAllocator for SimBus {
    type Memory = SimMemory;
    type Error = OutOfMemory;

    fn alloc_dma(&mut self, size: u32) -> Result<SimMemory, OutOfMemory> {
        let mut state = self.state.borrow_mut();
        if state.fail_next {
            state.fail_next = false;
            return Err(OutOfMemory);
        }

        let address = state.next_address;
        state.next_address += (size as u64 + 0xFFF) & !0xFFF;
        let bytes = Rc::new(RefCell::new(vec![0xEE; size as usize]));
        state.regions.insert(address, bytes.clone());

        Ok(SimMemory { address, bytes })
    }

    fn free_dma(&mut self, memory: SimMemory) {
        self.state.borrow_mut().regions.remove(&memory.address);
    }
}

#[derive(Default)]
struct ControllerState {
    count: Cell<u64>,
    glitches: RefCell<VecDeque<u64>>,
    programmed: Cell<Option<(Topology, u64, u32)>>,
    running: Cell<bool>,
    starts: Cell<u32>,
    fail_configure: Cell<bool>,
}

/// Channel controller whose transfer count is moved by the test.
#[derive(Clone, Default)]
pub struct SimController {
    state: Rc<ControllerState>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SimFault;

impl SimController {
    pub fn count(&self) -> u64 {
        self.state.count.get()
    }

    pub fn set_count(&self, count: u64) {
        self.state.count.set(count);
    }

    pub fn advance(&self, bytes: u64) {
        self.state.count.set(self.state.count.get() + bytes);
    }

    /// The next transfer count read returns `count` once.
    pub fn glitch(&self, count: u64) {
        self.state.glitches.borrow_mut().push_back(count);
    }

    pub fn programmed(&self) -> Option<(Topology, u64, u32)> {
        self.state.programmed.get()
    }

    pub fn is_running(&self) -> bool {
        self.state.running.get()
    }

    pub fn starts(&self) -> u32 {
        self.state.starts.get()
    }

    pub fn fail_configure(&self, fail: bool) {
        self.state.fail_configure.set(fail);
    }
}

impl DmaController for SimController {
    type Error = SimFault;

    fn configure(&mut self, topology: Topology, address: u64, size: u32) -> Result<(), SimFault> {
        if self.state.fail_configure.get() {
            return Err(SimFault);
        }
        self.state.programmed.set(Some((topology, address, size)));
        self.state.count.set(0);
        Ok(())
    }

    fn start(&mut self) -> Result<(), SimFault> {
        self.state.running.set(true);
        self.state.starts.set(self.state.starts.get() + 1);
        Ok(())
    }

    fn request_stop(&mut self) -> Result<(), SimFault> {
        self.state.running.set(false);
        Ok(())
    }

    fn status(&mut self) -> Result<ChannelStatus, SimFault> {
        if self.state.running.get() {
            Ok(ChannelStatus(ChannelStatus::LINK_READY))
        } else {
            Ok(ChannelStatus(ChannelStatus::DONE))
        }
    }

    fn transfer_count(&mut self) -> Result<u64, SimFault> {
        if let Some(count) = self.state.glitches.borrow_mut().pop_front() {
            return Ok(count);
        }
        Ok(self.state.count.get())
    }

    fn max_link_size(&self) -> u32 {
        256
    }
}

/// Where the device finds the data of a programmed channel. Link chains are
/// followed through the first transfer entry of the head link.
pub fn data_base(bus: &SimBus, controller: &SimController) -> u64 {
    let (topology, address, _) = controller.programmed().expect("controller not programmed");
    if topology.is_link_chain() {
        let entry = bus.peek(address + LINK_HEADER_LEN as u64, 8);
        u64::from_le_bytes(entry.try_into().unwrap())
    } else {
        address
    }
}

/// Device side of an input channel: writes `data` into the ring and bumps the
/// transfer count.
pub fn device_produce(bus: &SimBus, controller: &SimController, size: u32, data: &[u8]) {
    let base = data_base(bus, controller);
    for byte in data {
        let offset = controller.count() % size as u64;
        bus.poke(base + offset, &[*byte]);
        controller.advance(1);
    }
}

/// Device side of an output channel: takes `len` bytes out of the ring.
pub fn device_consume(bus: &SimBus, controller: &SimController, size: u32, len: usize) -> Vec<u8> {
    let base = data_base(bus, controller);
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        let offset = controller.count() % size as u64;
        out.extend(bus.peek(base + offset, 1));
        controller.advance(1);
    }
    out
}

/// Wire an output channel to an input channel: the device consumes from one
/// ring and produces into the other.
pub fn loopback(
    bus: &SimBus,
    out: &SimController,
    out_size: u32,
    input: &SimController,
    in_size: u32,
    len: usize,
) {
    let bytes = device_consume(bus, out, out_size, len);
    device_produce(bus, input, in_size, &bytes);
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}
