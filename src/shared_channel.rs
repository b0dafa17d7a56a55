use core::cell::RefCell;

use embassy_sync::blocking_mutex::{raw::RawMutex, Mutex};

use crate::dma_controller::DmaController;
use crate::dma_memory::DmaAllocator;
use crate::ring_channel::{ChannelState, Error, ReadStatus, RingChannel, WriteStatus};

/// Ring channel behind a blocking mutex, so the task feeding the channel and
/// the task draining it can share one instance.
pub struct SharedRingChannel<M: RawMutex, C: DmaController, A: DmaAllocator> {
    channel: Mutex<M, RefCell<RingChannel<C, A>>>,
}

impl<M, C, A> SharedRingChannel<M, C, A>
where
    M: RawMutex,
    C: DmaController,
    A: DmaAllocator,
{
    pub const fn new(channel: RingChannel<C, A>) -> Self {
        Self {
            channel: Mutex::new(RefCell::new(channel)),
        }
    }

    /// Run `f` with exclusive access to the channel. Must not be re-entered
    /// from inside `f`.
    pub fn lock<R>(&self, f: impl FnOnce(&mut RingChannel<C, A>) -> R) -> R {
        self.channel.lock(|channel| f(&mut channel.borrow_mut()))
    }

    pub fn start(&self) -> Result<(), Error<C, A>> {
        self.lock(|channel| channel.start())
    }

    pub fn stop(&self) -> Result<(), Error<C, A>> {
        self.lock(|channel| channel.stop())
    }

    pub fn reset(&self) -> Result<(), Error<C, A>> {
        self.lock(|channel| channel.reset())
    }

    pub fn state(&self) -> ChannelState {
        self.lock(|channel| channel.state())
    }

    pub fn read(
        &self,
        requested: u32,
        dst: Option<&mut [u8]>,
        allow_overwrite: bool,
    ) -> Result<ReadStatus, Error<C, A>> {
        self.lock(|channel| channel.read(requested, dst, allow_overwrite))
    }

    pub fn write(
        &self,
        requested: u32,
        src: Option<&[u8]>,
        allow_regeneration: bool,
    ) -> Result<WriteStatus, Error<C, A>> {
        self.lock(|channel| channel.write(requested, src, allow_regeneration))
    }

    pub fn bytes_available(&self) -> Result<u32, Error<C, A>> {
        self.lock(|channel| channel.bytes_available())
    }

    pub fn bytes_free(&self) -> Result<u32, Error<C, A>> {
        self.lock(|channel| channel.bytes_free())
    }

    pub fn into_inner(self) -> RingChannel<C, A> {
        self.channel.into_inner().into_inner()
    }
}
