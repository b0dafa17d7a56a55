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

use core::ptr;

use embedded_hal_1::delay::DelayNs;

use crate::dma_controller::{ChannelStatus, DmaController, DmaMode, Topology};
use crate::transfer_cursor::CounterWidth;

pub const CHINCH_SIGNATURE: u32 = 0xC010_7AD0;
pub const MAX_LINK_SIZE: u32 = 512;

// chip level registers
pub const IDENTIFICATION: u32 = 0x00;
pub const HOST_BUS_RESOURCE_CONTROL: u32 = 0x0C;

const DMA_MA64: u32 = 1 << 0;
const DMA_LA64: u32 = 1 << 1;
const IO_MASTER_ENABLE: u32 = 1 << 4;

const CHANNEL_BANK_BASE: u32 = 0x2000;
const CHANNEL_BANK_STRIDE: u32 = 0x100;

// offsets inside a channel bank
pub const CHANNEL_CONTROL: u32 = 0x00;
pub const CHANNEL_OPERATION: u32 = 0x04;
pub const CHANNEL_STATUS: u32 = 0x08;
pub const TOTAL_TRANSFER_COUNT_MSW: u32 = 0x10;
pub const TOTAL_TRANSFER_COUNT_LSW: u32 = 0x14;
pub const MEMORY_ADDRESS_MSW: u32 = 0x40;
pub const MEMORY_ADDRESS_LSW: u32 = 0x44;
pub const LINK_ADDRESS_MSW: u32 = 0x60;
pub const LINK_ADDRESS_LSW: u32 = 0x64;
pub const LINK_SIZE: u32 = 0x6C;

pub const OPERATION_START: u32 = 1 << 0;
pub const OPERATION_STOP: u32 = 1 << 1;
pub const OPERATION_CLR_TTC: u32 = 1 << 8;

const CONTROL_MODE_MASK: u32 = 0xF;

/// 32 bit register window of the device.
pub trait RegisterAccess {
    fn read32(&mut self, offset: u32) -> u32;
    fn write32(&mut self, offset: u32, value: u32);
}

impl<T: RegisterAccess + ?Sized> RegisterAccess for &mut T {
    fn read32(&mut self, offset: u32) -> u32 {
        T::read32(self, offset)
    }

    fn write32(&mut self, offset: u32, value: u32) {
        T::write32(self, offset, value)
    }
}

/// Registers mapped into the CPU address space.
pub struct MmioRegisters {
    base: *mut u32,
}

impl MmioRegisters {
    /// # Safety
    ///
    /// `base` must point at the mapped register window of the device and stay
    /// valid for the lifetime of the returned value.
    pub unsafe fn new(base: *mut u32) -> Self {
        Self { base }
    }
}

impl RegisterAccess for MmioRegisters {
    fn read32(&mut self, offset: u32) -> u32 {
        unsafe { ptr::read_volatile(self.base.byte_add(offset as usize)) }
    }

    fn write32(&mut self, offset: u32, value: u32) {
        unsafe { ptr::write_volatile(self.base.byte_add(offset as usize), value) }
    }
}

/// DMA channels of the device, one register bank each.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DmaChannelNumber {
    AnalogIn,
    Counter0,
    Counter1,
    Counter2,
    Counter3,
    DigitalIn,
    AnalogOut,
    DigitalOut,
}

impl DmaChannelNumber {
    pub const fn bank_offset(self) -> u32 {
        let index = match self {
            DmaChannelNumber::AnalogIn => 0,
            DmaChannelNumber::Counter0 => 1,
            DmaChannelNumber::Counter1 => 2,
            DmaChannelNumber::Counter2 => 3,
            DmaChannelNumber::Counter3 => 4,
            DmaChannelNumber::DigitalIn => 5,
            DmaChannelNumber::AnalogOut => 6,
            DmaChannelNumber::DigitalOut => 7,
        };
        CHANNEL_BANK_BASE + index * CHANNEL_BANK_STRIDE
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RegisterControllerError {
    /// The identification register does not hold the expected signature.
    BadSignature,
    /// Null address, zero size, or an address the addressing mode can't reach.
    BadBuffer,
    LinkReadyTimeout,
    StopTimeout,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RegisterControllerConfig {
    pub addressing_64bit: bool,
    /// Status polls before a start or stop is given up on.
    pub poll_budget: u32,
    pub poll_interval_us: u32,
}

impl Default for RegisterControllerConfig {
    fn default() -> Self {
        Self {
            addressing_64bit: true,
            poll_budget: 10_000,
            poll_interval_us: 10,
        }
    }
}

/// [`DmaController`] driving one channel bank through its registers.
pub struct RegisterController<R: RegisterAccess, D: DelayNs> {
    regs: R,
    delay: D,
    bank: u32,
    config: RegisterControllerConfig,
    topology: Topology,
}

impl<R: RegisterAccess, D: DelayNs> RegisterController<R, D> {
    /// Check the chip signature and put `channel` into a known state:
    /// normal mode, interrupts off, stopped.
    pub fn new(
        mut regs: R,
        delay: D,
        channel: DmaChannelNumber,
        config: RegisterControllerConfig,
    ) -> Result<Self, RegisterControllerError> {
        let signature = regs.read32(IDENTIFICATION);
        if signature != CHINCH_SIGNATURE {
            error!("unexpected chip signature: {:#010x}", signature);
            return Err(RegisterControllerError::BadSignature);
        }

        let bank = channel.bank_offset();
        regs.write32(bank + CHANNEL_CONTROL, DmaMode::Normal as u32);
        regs.write32(bank + CHANNEL_OPERATION, OPERATION_STOP);

        debug!("dma channel {:?} at bank {:#06x}", channel, bank);

        Ok(Self {
            regs,
            delay,
            bank,
            config,
            topology: Topology::Linear,
        })
    }

    pub fn release(self) -> (R, D) {
        (self.regs, self.delay)
    }

    fn read(&mut self, offset: u32) -> u32 {
        self.regs.read32(self.bank + offset)
    }

    fn write(&mut self, offset: u32, value: u32) {
        self.regs.write32(self.bank + offset, value)
    }

    fn wait_for(&mut self, condition: fn(ChannelStatus) -> bool) -> Option<ChannelStatus> {
        for _ in 0..=self.config.poll_budget {
            let status = ChannelStatus(self.read(CHANNEL_STATUS));
            if condition(status) {
                return Some(status);
            }
            self.delay.delay_us(self.config.poll_interval_us);
        }
        None
    }
}

impl<R: RegisterAccess, D: DelayNs> DmaController for RegisterController<R, D> {
    type Error = RegisterControllerError;

    fn configure(
        &mut self,
        topology: Topology,
        address: u64,
        size: u32,
    ) -> Result<(), RegisterControllerError> {
        if address == 0 || size == 0 {
            return Err(RegisterControllerError::BadBuffer);
        }
        if !self.config.addressing_64bit && address > u32::MAX as u64 {
            return Err(RegisterControllerError::BadBuffer);
        }
        self.topology = topology;

        let mut host_bus = self.regs.read32(HOST_BUS_RESOURCE_CONTROL);
        if self.config.addressing_64bit {
            host_bus |= DMA_MA64 | DMA_LA64;
        } else {
            host_bus &= !(DMA_MA64 | DMA_LA64);
        }
        host_bus |= IO_MASTER_ENABLE;
        self.regs.write32(HOST_BUS_RESOURCE_CONTROL, host_bus);

        let address_low = address as u32;
        let address_high = (address >> 32) as u32;
        let mode = topology.dma_mode();
        match mode {
            DmaMode::Normal => {
                self.write(MEMORY_ADDRESS_LSW, address_low);
                if self.config.addressing_64bit {
                    self.write(MEMORY_ADDRESS_MSW, address_high);
                }
            }
            DmaMode::LinkChain => {
                self.write(LINK_ADDRESS_LSW, address_low);
                if self.config.addressing_64bit {
                    self.write(LINK_ADDRESS_MSW, address_high);
                }
                self.write(LINK_SIZE, size);
            }
        }

        let control = self.read(CHANNEL_CONTROL);
        self.write(
            CHANNEL_CONTROL,
            (control & !CONTROL_MODE_MASK) | mode as u32,
        );
        self.write(CHANNEL_OPERATION, OPERATION_CLR_TTC);
        Ok(())
    }

    fn start(&mut self) -> Result<(), RegisterControllerError> {
        self.write(CHANNEL_OPERATION, OPERATION_START | OPERATION_CLR_TTC);

        if self.topology.is_link_chain() && self.wait_for(ChannelStatus::link_ready).is_none() {
            warn!("link ready not seen after start");
            return Err(RegisterControllerError::LinkReadyTimeout);
        }
        Ok(())
    }

    fn request_stop(&mut self) -> Result<(), RegisterControllerError> {
        self.write(CHANNEL_OPERATION, OPERATION_STOP);

        match self.wait_for(ChannelStatus::is_halted) {
            Some(status) => {
                if status.error() {
                    warn!("channel halted with error, status {:#010x}", status.bits());
                }
                Ok(())
            }
            None => Err(RegisterControllerError::StopTimeout),
        }
    }

    fn status(&mut self) -> Result<ChannelStatus, RegisterControllerError> {
        Ok(ChannelStatus(self.read(CHANNEL_STATUS)))
    }

    fn transfer_count(&mut self) -> Result<u64, RegisterControllerError> {
        // If the MSW moved while the LSW was read, the LSW belongs to either
        // word; zero is the conservative choice.
        let msw1 = self.read(TOTAL_TRANSFER_COUNT_MSW);
        let mut lsw = self.read(TOTAL_TRANSFER_COUNT_LSW);
        let msw2 = self.read(TOTAL_TRANSFER_COUNT_MSW);
        if msw1 != msw2 {
            lsw = 0;
        }
        Ok((msw2 as u64) << 32 | lsw as u64)
    }

    fn max_link_size(&self) -> u32 {
        MAX_LINK_SIZE
    }

    // MSW and LSW together hold the full count
    fn counter_width(&self) -> CounterWidth {
        CounterWidth::Bits64
    }
}
