use embassy_futures::yield_now;
use embassy_time::{Duration, Instant};

use crate::dma_controller::DmaController;
use crate::dma_memory::DmaAllocator;
use crate::ring_channel::{ChannelError, ChannelState, Error, RingChannel};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PollError<E> {
    Channel(E),
    /// The deadline passed before the transfer completed.
    Timeout,
}

/// Read everything left in the ring, `scratch.len()` bytes at a time, handing
/// each chunk to `sink`. Meant for emptying an input channel after `stop`.
///
/// Returns the number of bytes drained.
pub fn drain<C, A, F>(
    channel: &mut RingChannel<C, A>,
    scratch: &mut [u8],
    mut sink: F,
) -> Result<usize, Error<C, A>>
where
    C: DmaController,
    A: DmaAllocator,
    F: FnMut(&[u8]),
{
    if scratch.is_empty() {
        return Err(ChannelError::InvalidArgument);
    }

    let mut total = 0;
    loop {
        let available = channel.bytes_available()? as usize;
        if available == 0 {
            break;
        }

        let chunk = available.min(scratch.len());
        channel.read(chunk as u32, Some(&mut scratch[..chunk]), false)?;
        sink(&scratch[..chunk]);
        total += chunk;
    }

    trace!("drained {} bytes", total);
    Ok(total)
}

/// Fill `dst` from the channel, waiting for the device until `timeout` runs out.
pub async fn read_exact<C, A>(
    channel: &mut RingChannel<C, A>,
    dst: &mut [u8],
    timeout: Duration,
) -> Result<(), PollError<Error<C, A>>>
where
    C: DmaController,
    A: DmaAllocator,
{
    let deadline = Instant::now() + timeout;
    let mut filled = 0;

    while filled < dst.len() {
        let available = channel.bytes_available().map_err(PollError::Channel)? as usize;
        if available > 0 {
            let chunk = available.min(dst.len() - filled);
            match channel.read(chunk as u32, Some(&mut dst[filled..]), false) {
                Ok(_) => {
                    filled += chunk;
                    continue;
                }
                Err(e) if e.is_transient() => {}
                Err(e) => return Err(PollError::Channel(e)),
            }
        }

        if Instant::now() >= deadline {
            debug!("read timed out with {} of {} bytes", filled, dst.len());
            return Err(PollError::Timeout);
        }
        yield_now().await;
    }
    Ok(())
}

/// Write all of `src` to the channel, waiting for space until `timeout` runs out.
pub async fn write_all<C, A>(
    channel: &mut RingChannel<C, A>,
    src: &[u8],
    timeout: Duration,
) -> Result<(), PollError<Error<C, A>>>
where
    C: DmaController,
    A: DmaAllocator,
{
    let deadline = Instant::now() + timeout;
    let mut written = 0;

    while written < src.len() {
        let free = channel.bytes_free().map_err(PollError::Channel)? as usize;
        if free > 0 {
            let chunk = free.min(src.len() - written);
            match channel.write(chunk as u32, Some(&src[written..]), false) {
                Ok(_) => {
                    written += chunk;
                    continue;
                }
                Err(e) if e.is_transient() => {}
                Err(e) => return Err(PollError::Channel(e)),
            }
        }

        if Instant::now() >= deadline {
            debug!("write timed out with {} of {} bytes", written, src.len());
            return Err(PollError::Timeout);
        }
        yield_now().await;
    }
    Ok(())
}

/// Byte stream over an input channel. Once the channel is stopped and empty
/// reads return 0.
pub struct ChannelReader<'a, C: DmaController, A: DmaAllocator> {
    channel: &'a mut RingChannel<C, A>,
}

impl<'a, C: DmaController, A: DmaAllocator> ChannelReader<'a, C, A> {
    pub fn new(channel: &'a mut RingChannel<C, A>) -> Self {
        Self { channel }
    }
}

impl<C: DmaController, A: DmaAllocator> embedded_io::ErrorType for ChannelReader<'_, C, A> {
    type Error = Error<C, A>;
}

impl<C: DmaController, A: DmaAllocator> embedded_io::Read for ChannelReader<'_, C, A> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            let available = self.channel.bytes_available()? as usize;
            if available > 0 {
                let chunk = available.min(buf.len());
                self.channel.read(chunk as u32, Some(&mut buf[..chunk]), false)?;
                return Ok(chunk);
            }
            if self.channel.state() == ChannelState::Stopped {
                return Ok(0);
            }
            core::hint::spin_loop();
        }
    }
}

impl<C: DmaController, A: DmaAllocator> embedded_io::ReadReady for ChannelReader<'_, C, A> {
    fn read_ready(&mut self) -> Result<bool, Self::Error> {
        Ok(self.channel.bytes_available()? > 0 || self.channel.state() == ChannelState::Stopped)
    }
}

/// Byte stream into an output channel. Writing to a full ring that was not
/// started fails with [`ChannelError::SpaceNotAvailable`] instead of waiting.
pub struct ChannelWriter<'a, C: DmaController, A: DmaAllocator> {
    channel: &'a mut RingChannel<C, A>,
}

impl<'a, C: DmaController, A: DmaAllocator> ChannelWriter<'a, C, A> {
    pub fn new(channel: &'a mut RingChannel<C, A>) -> Self {
        Self { channel }
    }
}

impl<C: DmaController, A: DmaAllocator> embedded_io::ErrorType for ChannelWriter<'_, C, A> {
    type Error = Error<C, A>;
}

impl<C: DmaController, A: DmaAllocator> embedded_io::Write for ChannelWriter<'_, C, A> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            let free = self.channel.bytes_free()? as usize;
            if free > 0 {
                let chunk = free.min(buf.len());
                self.channel.write(chunk as u32, Some(&buf[..chunk]), false)?;
                return Ok(chunk);
            }
            // nothing drains a ring the device isn't running on
            if self.channel.state() != ChannelState::Started {
                return Err(ChannelError::SpaceNotAvailable);
            }
            core::hint::spin_loop();
        }
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl<C: DmaController, A: DmaAllocator> embedded_io::WriteReady for ChannelWriter<'_, C, A> {
    fn write_ready(&mut self) -> Result<bool, Self::Error> {
        Ok(self.channel.bytes_free()? > 0)
    }
}
