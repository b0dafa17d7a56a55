/* DMA ring channel
 * Copyright (C) 2025 Sebastian Quilitz
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation; either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use core::fmt::Debug;

use crate::dma_buffer::{DmaBuffer, InitError, RingBuffer};
use crate::dma_controller::{ChannelStatus, Direction, DmaController, Topology};
use crate::dma_memory::DmaAllocator;
use crate::transfer_cursor::{CounterWidth, TransferCursor};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChannelError<CE, AE> {
    /// Operation not valid in the current lifecycle state.
    WrongState,
    /// Zero size, oversized request or a slice shorter than the request.
    InvalidArgument,
    /// The device wrote more than the ring holds since the last read.
    BufferOverflow,
    /// The device consumed more than was written since the last write.
    BufferUnderflow,
    DataNotAvailable,
    SpaceNotAvailable,
    ControllerFailure(CE),
    AllocationFailure(AE),
    BufferInitialization(InitError<AE>),
}

impl<CE, AE> ChannelError<CE, AE> {
    /// Whether bytes were lost. Every other error can be retried.
    pub fn is_data_loss(&self) -> bool {
        matches!(
            self,
            ChannelError::BufferOverflow | ChannelError::BufferUnderflow
        )
    }

    /// Whether the same call may succeed once the device has moved more data.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChannelError::DataNotAvailable | ChannelError::SpaceNotAvailable
        )
    }
}

impl<CE: Debug, AE: Debug> embedded_io::Error for ChannelError<CE, AE> {
    fn kind(&self) -> embedded_io::ErrorKind {
        use embedded_io::ErrorKind;

        match self {
            ChannelError::InvalidArgument => ErrorKind::InvalidInput,
            ChannelError::BufferOverflow | ChannelError::BufferUnderflow => ErrorKind::InvalidData,
            ChannelError::DataNotAvailable | ChannelError::SpaceNotAvailable => {
                ErrorKind::Interrupted
            }
            ChannelError::WrongState => ErrorKind::NotConnected,
            ChannelError::AllocationFailure(_) => ErrorKind::OutOfMemory,
            _ => ErrorKind::Other,
        }
    }
}

pub type Error<C, A> =
    ChannelError<<C as DmaController>::Error, <A as DmaAllocator>::Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChannelState {
    Idle,
    Configured,
    Started,
    Stopped,
}

/// Everything needed to program the channel again after a stop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelConfig {
    pub topology: Topology,
    pub direction: Direction,
    pub size: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ReadStatus {
    pub bytes_remaining: u32,
    pub overwritten: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct WriteStatus {
    pub bytes_free: u32,
    pub regenerated: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelStats {
    /// Transfer counts that went backwards and were replaced by the last good one.
    pub counter_regressions: u32,
    pub overwrites: u32,
    pub regenerations: u32,
}

fn saturate(bytes: u64) -> u32 {
    bytes.min(u32::MAX as u64) as u32
}

/// Ring buffer between the host and one DMA channel of the device.
///
/// The device's transfer count is the only record of how far it got; the
/// channel keeps the host side cursor and works out occupancy from both.
/// Calls must be serialized by the caller, see
/// [`SharedRingChannel`](crate::shared_channel::SharedRingChannel).
pub struct RingChannel<C: DmaController, A: DmaAllocator> {
    controller: C,
    allocator: A,
    buffer: Option<RingBuffer<A>>,
    config: Option<ChannelConfig>,
    width: CounterWidth,
    read_cursor: TransferCursor,
    write_cursor: TransferCursor,
    last_write_cursor: TransferCursor,
    state: ChannelState,
    stats: ChannelStats,
}

impl<C: DmaController, A: DmaAllocator> RingChannel<C, A> {
    /// Channel whose cursors wrap at the width the controller reports.
    pub fn new(controller: C, allocator: A) -> Self {
        let width = controller.counter_width();
        Self::with_counter_width(controller, allocator, width)
    }

    /// `width` is the number of bits the device's transfer count wraps at,
    /// overriding what the controller reports.
    pub fn with_counter_width(controller: C, allocator: A, width: CounterWidth) -> Self {
        Self {
            controller,
            allocator,
            buffer: None,
            config: None,
            width,
            read_cursor: TransferCursor::zero(width),
            write_cursor: TransferCursor::zero(width),
            last_write_cursor: TransferCursor::zero(width),
            state: ChannelState::Idle,
            stats: ChannelStats::default(),
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn config(&self) -> Option<ChannelConfig> {
        self.config
    }

    pub fn counter_width(&self) -> CounterWidth {
        self.width
    }

    pub fn stats(&self) -> ChannelStats {
        self.stats
    }

    pub fn controller(&self) -> &C {
        &self.controller
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    /// Physical start address programmed into the controller, if configured.
    pub fn start_address(&self) -> Option<u64> {
        self.buffer.as_ref().map(|buffer| buffer.start_address())
    }

    pub fn configure(
        &mut self,
        topology: Topology,
        direction: Direction,
        size: u32,
    ) -> Result<(), Error<C, A>> {
        self.configure_with(ChannelConfig {
            topology,
            direction,
            size,
        })
    }

    /// Allocate the buffer for `config` and program the controller.
    ///
    /// Only valid while idle. On failure the buffer is released again and the
    /// channel stays idle.
    pub fn configure_with(&mut self, config: ChannelConfig) -> Result<(), Error<C, A>> {
        if self.state != ChannelState::Idle {
            return Err(ChannelError::WrongState);
        }
        if config.size == 0 {
            return Err(ChannelError::InvalidArgument);
        }

        let mut buffer = RingBuffer::for_topology(config.topology);
        if let Err(e) = buffer.allocate(&mut self.allocator, config.size) {
            warn!("dma buffer allocation of {} bytes failed", config.size);
            return Err(ChannelError::AllocationFailure(e));
        }

        let max_link_size = self.controller.max_link_size();
        if let Err(e) = buffer.initialize(&mut self.allocator, config.topology, max_link_size) {
            warn!("dma buffer initialization failed for {:?}", config.topology);
            buffer.free(&mut self.allocator);
            return Err(ChannelError::BufferInitialization(e));
        }

        self.buffer = Some(buffer);
        self.config = Some(config);

        if let Err(e) = self.program() {
            self.release_buffer();
            self.config = None;
            return Err(e);
        }

        info!(
            "channel configured: {:?} {:?}, {} bytes",
            config.topology,
            config.direction,
            config.size
        );
        Ok(())
    }

    /// Program the controller with the cached configuration and rewind the
    /// cursors.
    fn program(&mut self) -> Result<(), Error<C, A>> {
        let (config, buffer) = match (self.config, self.buffer.as_mut()) {
            (Some(config), Some(buffer)) => (config, buffer),
            _ => return Err(ChannelError::WrongState),
        };

        let address = buffer.start_address();
        let size = if config.topology.is_link_chain() {
            buffer.link_size()
        } else {
            buffer.size()
        };

        if let Err(e) = self.controller.configure(config.topology, address, size) {
            warn!("controller rejected address {} size {}", address, size);
            return Err(ChannelError::ControllerFailure(e));
        }
        debug!("controller programmed: address {}, size {}", address, size);

        buffer.set_location(0);
        self.read_cursor = TransferCursor::zero(self.width);
        self.write_cursor = TransferCursor::zero(self.width);
        self.last_write_cursor = TransferCursor::zero(self.width);
        self.state = ChannelState::Configured;
        Ok(())
    }

    /// Arm the device. From `Stopped` the cached configuration is programmed
    /// again first, which rewinds both cursors.
    pub fn start(&mut self) -> Result<(), Error<C, A>> {
        if self.state == ChannelState::Stopped {
            self.program()?;
        }

        if self.state != ChannelState::Configured {
            return Err(ChannelError::WrongState);
        }

        self.controller
            .start()
            .map_err(ChannelError::ControllerFailure)?;
        self.state = ChannelState::Started;
        debug!("channel started");
        Ok(())
    }

    /// Ask the device to stop. The channel is `Stopped` afterwards no matter
    /// what the controller reports; buffered bytes can still be read.
    pub fn stop(&mut self) -> Result<(), Error<C, A>> {
        let result = if self.state == ChannelState::Started {
            self.controller
                .request_stop()
                .map_err(ChannelError::ControllerFailure)
        } else {
            Ok(())
        };

        if result.is_err() {
            warn!("controller failed to acknowledge stop");
        }
        self.state = ChannelState::Stopped;
        debug!("channel stopped");
        result
    }

    /// Stop the device, release the buffer and return to `Idle`. Never fails.
    pub fn reset(&mut self) -> Result<(), Error<C, A>> {
        if self.state == ChannelState::Idle && self.buffer.is_none() {
            return Ok(());
        }

        if self.stop().is_err() {
            warn!("ignoring stop failure during reset");
        }
        self.release_buffer();
        self.config = None;
        self.read_cursor = TransferCursor::zero(self.width);
        self.write_cursor = TransferCursor::zero(self.width);
        self.last_write_cursor = TransferCursor::zero(self.width);
        self.state = ChannelState::Idle;
        debug!("channel reset");
        Ok(())
    }

    fn release_buffer(&mut self) {
        if let Some(mut buffer) = self.buffer.take() {
            buffer.free(&mut self.allocator);
        }
    }

    pub fn controller_status(&mut self) -> Result<ChannelStatus, Error<C, A>> {
        self.controller
            .status()
            .map_err(ChannelError::ControllerFailure)
    }

    /// Bytes written but not yet read, from the current transfer count.
    ///
    /// Values above the ring size mean the cursors crossed.
    fn bytes_in_buffer(&mut self) -> Result<u64, Error<C, A>> {
        let direction = match self.config {
            Some(config) => config.direction,
            None => return Err(ChannelError::WrongState),
        };

        let count = self
            .controller
            .transfer_count()
            .map_err(ChannelError::ControllerFailure)?;
        let observed = TransferCursor::from_count(count, self.width);

        match direction {
            Direction::In => {
                if observed.regressed_from(self.last_write_cursor) {
                    // glitched register read, keep the last good count
                    self.stats.counter_regressions = self.stats.counter_regressions.saturating_add(1);
                    debug!(
                        "transfer count went back from {} to {}",
                        self.last_write_cursor.value(),
                        observed.value()
                    );
                    self.write_cursor = self.last_write_cursor;
                } else {
                    self.write_cursor = observed;
                    self.last_write_cursor = observed;
                }
            }
            Direction::Out => self.read_cursor = observed,
        }

        Ok(self.write_cursor.distance_from(self.read_cursor))
    }

    fn ring_size(&self) -> Result<u32, Error<C, A>> {
        match (self.config, self.buffer.as_ref()) {
            (Some(config), Some(_)) => Ok(config.size),
            _ => Err(ChannelError::WrongState),
        }
    }

    /// Read `requested` bytes into `dst`.
    ///
    /// With `requested == 0` or no `dst` this only reports how many bytes are
    /// waiting. `allow_overwrite` accepts an overflowed ring and returns the
    /// newest `requested` bytes instead.
    pub fn read(
        &mut self,
        requested: u32,
        dst: Option<&mut [u8]>,
        allow_overwrite: bool,
    ) -> Result<ReadStatus, Error<C, A>> {
        if !matches!(self.state, ChannelState::Started | ChannelState::Stopped) {
            return Err(ChannelError::WrongState);
        }
        let size = self.ring_size()?;

        let in_buffer = self.bytes_in_buffer()?;
        let overflowed = in_buffer > size as u64;
        if overflowed && !allow_overwrite {
            warn!("buffer overflow: {} bytes pending in {}", in_buffer, size);
            return Err(ChannelError::BufferOverflow);
        }

        let dst = match dst {
            Some(dst) if requested != 0 => dst,
            _ => {
                return Ok(ReadStatus {
                    bytes_remaining: saturate(in_buffer),
                    overwritten: false,
                })
            }
        };
        if dst.len() < requested as usize {
            return Err(ChannelError::InvalidArgument);
        }
        if requested as u64 > in_buffer {
            return Err(ChannelError::DataNotAvailable);
        }
        if requested > size {
            return Err(ChannelError::InvalidArgument);
        }

        let mut overwritten = false;
        if let Some(buffer) = self.buffer.as_mut() {
            if overflowed {
                let newest = self.write_cursor.rewind(requested);
                Self::shift_location(buffer, newest.ring_shift_from(self.read_cursor, size), size);
                self.read_cursor = newest;
                self.stats.overwrites = self.stats.overwrites.saturating_add(1);
                overwritten = true;
                debug!("overwritten, skipping to the newest {} bytes", requested);
            }
            buffer.read(&mut dst[..requested as usize]);
        }

        // the device may have lapped us during the copy
        if self.bytes_in_buffer()? > size as u64 && !allow_overwrite {
            warn!("buffer overflow while copying {} bytes", requested);
            return Err(ChannelError::BufferOverflow);
        }

        self.read_cursor = self.read_cursor.advance(requested);
        let in_buffer = self.bytes_in_buffer()?;
        Ok(ReadStatus {
            bytes_remaining: saturate(in_buffer),
            overwritten,
        })
    }

    /// Write `requested` bytes from `src`.
    ///
    /// With `requested == 0` or no `src` this only reports the free space.
    /// `allow_regeneration` accepts an underflowed ring and places the bytes
    /// right behind the device's read position.
    pub fn write(
        &mut self,
        requested: u32,
        src: Option<&[u8]>,
        allow_regeneration: bool,
    ) -> Result<WriteStatus, Error<C, A>> {
        if !matches!(self.state, ChannelState::Started | ChannelState::Configured) {
            return Err(ChannelError::WrongState);
        }
        let size = self.ring_size()?;

        let in_buffer = self.bytes_in_buffer()?;
        let underflowed = in_buffer > size as u64;
        if underflowed && !allow_regeneration {
            warn!("buffer underflow: {} bytes pending in {}", in_buffer, size);
            return Err(ChannelError::BufferUnderflow);
        }
        let bytes_free = Self::free_space(in_buffer, size);

        let src = match src {
            Some(src) if requested != 0 => src,
            _ => {
                return Ok(WriteStatus {
                    bytes_free,
                    regenerated: false,
                })
            }
        };
        if src.len() < requested as usize {
            return Err(ChannelError::InvalidArgument);
        }
        if requested > bytes_free {
            return Err(ChannelError::SpaceNotAvailable);
        }
        if requested > size {
            return Err(ChannelError::InvalidArgument);
        }

        let mut regenerated = false;
        if let Some(buffer) = self.buffer.as_mut() {
            if underflowed {
                let behind_device = self.read_cursor.rewind(requested);
                Self::shift_location(
                    buffer,
                    behind_device.ring_shift_from(self.write_cursor, size),
                    size,
                );
                self.write_cursor = behind_device;
                self.stats.regenerations = self.stats.regenerations.saturating_add(1);
                regenerated = true;
                debug!("underflowed, regenerating {} bytes", requested);
            }
            buffer.write(&src[..requested as usize]);
        }

        if self.bytes_in_buffer()? > size as u64 && !allow_regeneration {
            warn!("buffer underflow while copying {} bytes", requested);
            return Err(ChannelError::BufferUnderflow);
        }

        self.write_cursor = self.write_cursor.advance(requested);
        let in_buffer = self.bytes_in_buffer()?;
        Ok(WriteStatus {
            bytes_free: Self::free_space(in_buffer, size),
            regenerated,
        })
    }

    /// Move the copy location along with a cursor jump. The location tracks
    /// the device's position in the ring, which the wrapped cursor alone
    /// can't give once the count passed the counter width.
    fn shift_location(buffer: &mut RingBuffer<A>, shift: u32, size: u32) {
        let location = (buffer.location() as u64 + shift as u64) % size as u64;
        buffer.set_location(location as u32);
    }

    /// Free space for a given occupancy. A crossed ring can be rewritten whole.
    fn free_space(in_buffer: u64, size: u32) -> u32 {
        if in_buffer > size as u64 {
            size
        } else {
            size - in_buffer as u32
        }
    }

    /// Bytes waiting to be read.
    pub fn bytes_available(&mut self) -> Result<u32, Error<C, A>> {
        self.read(0, None, false)
            .map(|status| status.bytes_remaining)
    }

    /// Space left for writing.
    pub fn bytes_free(&mut self) -> Result<u32, Error<C, A>> {
        self.write(0, None, false).map(|status| status.bytes_free)
    }
}

impl<C: DmaController, A: DmaAllocator> Drop for RingChannel<C, A> {
    fn drop(&mut self) {
        if self.state != ChannelState::Idle {
            let _ = self.reset();
        }
    }
}
