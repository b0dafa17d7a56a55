use crate::transfer_cursor::CounterWidth;

/// Shape of the DMA buffer program.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Topology {
    /// One contiguous buffer, transferred once.
    Linear,
    /// Chain of links that stops after the last link.
    LinkChain,
    /// Chain of links whose last link points back to the first.
    LinkChainRing,
    /// Ring whose tail link is marked for reuse by the device.
    ReuseLinkRing,
}

impl Topology {
    /// Whether the device walks a chain of links instead of a single buffer.
    pub const fn is_link_chain(self) -> bool {
        !matches!(self, Topology::Linear)
    }

    pub const fn dma_mode(self) -> DmaMode {
        match self {
            Topology::Linear => DmaMode::Normal,
            _ => DmaMode::LinkChain,
        }
    }
}

/// Which side of the transfer the device drives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    /// Device writes into host memory; the transfer count is the write cursor.
    In,
    /// Device consumes host memory; the transfer count is the read cursor.
    Out,
}

/// Mode field of the channel control register.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DmaMode {
    Normal = 0x0,
    LinkChain = 0x2,
}

/// Snapshot of the channel status register.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelStatus(pub u32);

impl ChannelStatus {
    pub const LINK_READY: u32 = 1 << 0;
    pub const DONE: u32 = 1 << 1;
    pub const LAST_LINK: u32 = 1 << 2;
    pub const ERROR: u32 = 1 << 3;

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn link_ready(self) -> bool {
        self.0 & Self::LINK_READY != 0
    }

    pub const fn done(self) -> bool {
        self.0 & Self::DONE != 0
    }

    pub const fn last_link(self) -> bool {
        self.0 & Self::LAST_LINK != 0
    }

    pub const fn error(self) -> bool {
        self.0 & Self::ERROR != 0
    }

    /// The device has let go of the host buffer.
    pub const fn is_halted(self) -> bool {
        self.done() || self.last_link() || self.error()
    }
}

/// Device side of one DMA channel.
///
/// Implementations program the DMA engine and report how many bytes it has
/// moved. `transfer_count` must not decrease between `start` and
/// `request_stop`, apart from transient read races which the ring channel
/// filters out.
pub trait DmaController {
    type Error: core::fmt::Debug;

    /// Program the engine for `topology`. `size` is the whole buffer for
    /// [`Topology::Linear`] and the size of the first link otherwise.
    fn configure(&mut self, topology: Topology, address: u64, size: u32)
        -> Result<(), Self::Error>;

    fn start(&mut self) -> Result<(), Self::Error>;

    fn request_stop(&mut self) -> Result<(), Self::Error>;

    fn status(&mut self) -> Result<ChannelStatus, Self::Error>;

    /// Total bytes moved since the channel was armed.
    fn transfer_count(&mut self) -> Result<u64, Self::Error>;

    /// Largest descriptor block the engine fetches for a single link.
    fn max_link_size(&self) -> u32;

    /// Number of bits `transfer_count` carries before it wraps.
    fn counter_width(&self) -> CounterWidth {
        CounterWidth::Bits32
    }
}

impl<T: DmaController + ?Sized> DmaController for &mut T {
    type Error = T::Error;

    fn configure(
        &mut self,
        topology: Topology,
        address: u64,
        size: u32,
    ) -> Result<(), Self::Error> {
        T::configure(self, topology, address, size)
    }

    fn start(&mut self) -> Result<(), Self::Error> {
        T::start(self)
    }

    fn request_stop(&mut self) -> Result<(), Self::Error> {
        T::request_stop(self)
    }

    fn status(&mut self) -> Result<ChannelStatus, Self::Error> {
        T::status(self)
    }

    fn transfer_count(&mut self) -> Result<u64, Self::Error> {
        T::transfer_count(self)
    }

    fn max_link_size(&self) -> u32 {
        T::max_link_size(self)
    }

    fn counter_width(&self) -> CounterWidth {
        T::counter_width(self)
    }
}
