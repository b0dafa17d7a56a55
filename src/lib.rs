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

//! Ring buffered DMA channels whose occupancy comes from the device's own
//! transfer counter.
//!
//! A [`RingChannel`] owns the host buffer of one DMA channel. The device moves
//! bytes in or out of it and reports a running byte count; the channel turns
//! that count into "bytes to read" or "space to write" and copies data at the
//! right place in the ring.

#![cfg_attr(not(test), no_std)]

// must come first so the logging macros are visible in the other modules
#[macro_use]
mod fmt;

pub mod dma_buffer;
pub mod dma_controller;
pub mod dma_memory;
pub mod register_controller;
pub mod ring_channel;
pub mod scatter_gather;
pub mod shared_channel;
pub mod stream;
pub mod transfer_cursor;

pub use dma_buffer::{DmaBuffer, InitError, LinearDmaBuffer, RingBuffer};
pub use dma_controller::{ChannelStatus, Direction, DmaController, DmaMode, Topology};
pub use dma_memory::{DmaAllocator, DmaMemory, PoolError, PoolMemory, StaticDmaPool};
pub use register_controller::{
    DmaChannelNumber, MmioRegisters, RegisterAccess, RegisterController,
    RegisterControllerConfig, RegisterControllerError,
};
pub use ring_channel::{
    ChannelConfig, ChannelError, ChannelState, ChannelStats, ReadStatus, RingChannel, WriteStatus,
};
pub use scatter_gather::{LinkInfo, LinkLayout, ScatterGatherDmaBuffer};
pub use shared_channel::SharedRingChannel;
pub use stream::{ChannelReader, ChannelWriter, PollError};
pub use transfer_cursor::{CounterWidth, TransferCursor};
