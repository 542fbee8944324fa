//! Packet memory access
//!
//! The packet memory area (PMA) is 1 KiB of SRAM shared between the CPU and
//! the USB peripheral. The CPU reaches it through 16-bit accesses, so every
//! byte operation in this module is built from half-word reads and writes.
//! Addresses are byte offsets from the start of packet memory.
//!
//! The buffer descriptor table (BDT) lives in packet memory, too. See
//! [`BufferDescriptor`].

use crate::vcell::VCell;

/// Packet memory size, in bytes
pub const PMA_SIZE: usize = 1024;

const CELLS: usize = PMA_SIZE / 2;

/// Size of one buffer descriptor table entry
pub const DESCRIPTOR_SIZE: u16 = 8;

/// Offsets within a buffer descriptor table entry
const ADDR_TX: u16 = 0;
const COUNT_TX: u16 = 2;
const ADDR_RX: u16 = 4;
const COUNT_RX: u16 = 6;

/// Byte count field of COUNT_TX and COUNT_RX
pub const COUNT_MASK: u16 = 0x3FF;

const BL_SIZE: u16 = 1 << 15;
const NUM_BLOCK_OFFSET: u16 = 10;

/// The packet memory area
#[repr(C)]
pub struct PacketMemory {
    cells: [VCell<u16>; CELLS],
}

impl PacketMemory {
    /// Zero-initialized packet memory, for host-side testing
    #[cfg(test)]
    pub const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const CELL: VCell<u16> = VCell::new(0);
        PacketMemory {
            cells: [CELL; CELLS],
        }
    }

    fn cell(&self, address: u16) -> &VCell<u16> {
        let index = usize::from(address >> 1);
        match self.cells.get(index) {
            Some(cell) => cell,
            None => panic!("PMA address {} is out of range", address),
        }
    }

    /// Read the half-word containing `address`
    pub fn read_u16(&self, address: u16) -> u16 {
        self.cell(address).read()
    }

    /// Write the half-word containing `address`
    pub fn write_u16(&self, address: u16, value: u16) {
        self.cell(address).write(value)
    }

    pub fn read_u8(&self, address: u16) -> u8 {
        let half = self.read_u16(address);
        if address & 1 == 0 {
            half as u8
        } else {
            (half >> 8) as u8
        }
    }

    /// Write one byte, preserving the other byte of the half-word
    pub fn write_u8(&self, address: u16, value: u8) {
        let half = self.read_u16(address);
        let half = if address & 1 == 0 {
            (half & 0xFF00) | u16::from(value)
        } else {
            (half & 0x00FF) | (u16::from(value) << 8)
        };
        self.write_u16(address, half);
    }

    /// Copy `buffer.len()` bytes out of packet memory, starting at `address`
    pub fn read(&self, address: u16, buffer: &mut [u8]) {
        let mut address = address;
        let buffer = if address & 1 != 0 {
            match buffer.split_first_mut() {
                Some((first, rest)) => {
                    *first = self.read_u8(address);
                    address += 1;
                    rest
                }
                None => return,
            }
        } else {
            buffer
        };

        let mut pairs = buffer.chunks_exact_mut(2);
        for pair in &mut pairs {
            let [lo, hi] = self.read_u16(address).to_le_bytes();
            pair[0] = lo;
            pair[1] = hi;
            address += 2;
        }
        if let [last] = pairs.into_remainder() {
            *last = self.read_u8(address);
        }
    }

    /// Copy `buffer` into packet memory, starting at `address`
    ///
    /// Bytes outside of the written range are untouched, even when the range
    /// starts or ends in the middle of a half-word.
    pub fn write(&self, address: u16, buffer: &[u8]) {
        let mut address = address;
        let mut buffer = buffer;

        if address & 1 != 0 {
            if let Some((first, rest)) = buffer.split_first() {
                self.write_u8(address, *first);
                address += 1;
                buffer = rest;
            }
        }

        let mut pairs = buffer.chunks_exact(2);
        for pair in &mut pairs {
            self.write_u16(address, u16::from_le_bytes([pair[0], pair[1]]));
            address += 2;
        }
        if let [last] = pairs.remainder() {
            self.write_u8(address, *last);
        }
    }

    /// Zero all of packet memory
    pub fn clear(&self) {
        for cell in &self.cells {
            cell.write(0);
        }
    }
}

/// One entry of the buffer descriptor table
///
/// `count_rx` holds the encoded RX buffer size (see [`rx_count_encoding`])
/// when written, and the received byte count in its low ten bits when read
/// back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferDescriptor {
    pub addr_tx: u16,
    pub count_tx: u16,
    pub addr_rx: u16,
    pub count_rx: u16,
}

/// Address of endpoint `endpoint`'s entry in a table at `btable`
pub const fn descriptor_address(btable: u16, endpoint: u8) -> u16 {
    btable + (endpoint as u16) * DESCRIPTOR_SIZE
}

pub fn write_descriptor(pma: &PacketMemory, address: u16, descriptor: &BufferDescriptor) {
    pma.write_u16(address + ADDR_TX, descriptor.addr_tx);
    pma.write_u16(address + COUNT_TX, descriptor.count_tx);
    pma.write_u16(address + ADDR_RX, descriptor.addr_rx);
    pma.write_u16(address + COUNT_RX, descriptor.count_rx);
}

#[cfg(test)]
pub fn read_descriptor(pma: &PacketMemory, address: u16) -> BufferDescriptor {
    BufferDescriptor {
        addr_tx: pma.read_u16(address + ADDR_TX),
        count_tx: pma.read_u16(address + COUNT_TX),
        addr_rx: pma.read_u16(address + ADDR_RX),
        count_rx: pma.read_u16(address + COUNT_RX),
    }
}

/// Set the number of bytes to send from an endpoint's TX buffer
pub fn write_tx_count(pma: &PacketMemory, address: u16, count: u16) {
    pma.write_u16(address + COUNT_TX, count & COUNT_MASK);
}

/// The number of bytes received into an endpoint's RX buffer
pub fn read_rx_count(pma: &PacketMemory, address: u16) -> u16 {
    pma.read_u16(address + COUNT_RX) & COUNT_MASK
}

/// Encode an RX buffer size for COUNT_RX
///
/// Sizes up to 62 bytes are counted in 2-byte blocks, larger sizes in 32-byte
/// blocks. Returns `None` if the peripheral can't express `size`.
pub const fn rx_count_encoding(size: u16) -> Option<u16> {
    if size >= 2 && size <= 62 && size % 2 == 0 {
        Some((size / 2) << NUM_BLOCK_OFFSET)
    } else if size >= 64 && size <= 1024 && size % 32 == 0 {
        Some(BL_SIZE | ((size / 32 - 1) << NUM_BLOCK_OFFSET))
    } else {
        None
    }
}
