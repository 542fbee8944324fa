//! A USB device driver core for STM32L4 processors
//!
//! `stm32l4-usbd` drives the USB full-speed device peripheral found on STM32L4
//! microcontrollers: eight bidirectional endpoints, 1 KiB of packet memory,
//! and endpoint registers with toggle fields. It handles bus reset,
//! enumeration (the chapter 9 control requests), suspend and resume, and
//! moves data for the generic endpoints that a class layer binds.
//!
//! Everything runs from the USB interrupt. Create a [`Device`] with a safe
//! implementation of [`Peripherals`], a [`Platform`] for clocks, pins and the
//! interrupt line, and a [`Descriptors`] provider. Then call
//! [`Device::on_interrupt`] from the interrupt handler. If thread code needs
//! the device, too, wrap it in a [`Shared`].
//!
//! ```no_run
//! use stm32l4_usbd::{Config, Descriptor, DescriptorType, Descriptors, Device, Peripherals, Platform};
//!
//! struct Usb;
//!
//! unsafe impl Peripherals for Usb {
//!     fn usb(&self) -> *const () {
//!         0x4000_6800 as *const ()
//!     }
//!     fn packet_memory(&self) -> *const () {
//!         0x4000_6C00 as *const ()
//!     }
//! }
//!
//! struct Board;
//!
//! impl Platform for Board {
//!     fn enable_usb_clock(&mut self) { /* HSI48 on, USBFSEN set */ }
//!     fn disable_usb_clock(&mut self) {}
//!     fn enable_voltage_detector(&mut self) { /* PWR_CR2.USV */ }
//!     fn disable_voltage_detector(&mut self) {}
//!     fn enable_irq(&mut self) {}
//!     fn disable_irq(&mut self) {}
//!     fn init_pins(&mut self) { /* PA11, PA12 to AF10 */ }
//!     fn deinit_pins(&mut self) {}
//!     fn delay_us(&mut self, _us: u32) {}
//! }
//!
//! struct Strings {
//!     device: &'static [u8],
//! }
//!
//! impl Descriptors for Strings {
//!     fn descriptor(&mut self, kind: DescriptorType, _: u8) -> Option<&mut dyn Descriptor> {
//!         match kind {
//!             DescriptorType::Device => Some(&mut self.device),
//!             _ => None,
//!         }
//!     }
//! }
//!
//! static DEVICE: [u8; 18] = [18, 1, 0, 2, 0, 0, 0, 64, 0x83, 4, 0x40, 0x57, 0, 1, 1, 2, 3, 1];
//!
//! let mut device = Device::new(Usb, Board, Strings { device: &DEVICE }, Config::default()).unwrap();
//! device.init();
//! device.connect();
//! loop {
//!     // From the USB interrupt
//!     let poll = device.on_interrupt();
//!     # let _ = poll;
//! }
//! ```

#![no_std]

#[macro_use]
mod log;

mod control;
mod descriptor;
mod device;
mod endpoint;
mod pma;
mod ral;
mod shared;
#[cfg(test)]
mod sim;
mod vcell;

pub use control::Stage;
pub use descriptor::{Descriptor, DescriptorType, Descriptors};
pub use device::{
    Callbacks, Config, Device, DeviceStatus, EndpointConfig, Interrupts, Poll, CONTROL_LAYOUT,
};
pub use endpoint::{
    compute_register_write, BufferLayout, Endpoint, EndpointType, RegisterUpdate, Status,
};
pub use pma::PMA_SIZE;
pub use shared::Shared;

/// Eight endpoints, each with an IN and an OUT direction
pub const NUM_ENDPOINTS: usize = ral::usb::ENDPOINTS;

/// A type that owns the USB peripheral
///
/// An implementation of `Peripherals` is expected to own
///
/// - the USB register block (`0x4000_6800` on STM32L4)
/// - the USB packet memory (`0x4000_6C00` on STM32L4)
///
/// # Safety
///
/// `Peripherals` should only be implemented on a type that owns both memory
/// blocks. The pointers returned by the methods are assumed to be valid for
/// as long as the driver exists, and will be cast to register and packet
/// memory definitions.
pub unsafe trait Peripherals {
    /// Returns the address of the USB registers
    fn usb(&self) -> *const ();
    /// Returns the address of the packet memory area
    fn packet_memory(&self) -> *const ();
}

/// Board support needed by the driver
///
/// These are the parts of bringing up USB that live outside of the USB
/// peripheral.
pub trait Platform {
    /// Enable the 48 MHz USB clock and the peripheral clock
    ///
    /// The clock must be stable when this returns.
    fn enable_usb_clock(&mut self);
    fn disable_usb_clock(&mut self);
    /// Enable the USB supply (VDDUSB) voltage monitor
    fn enable_voltage_detector(&mut self);
    fn disable_voltage_detector(&mut self);
    /// Unmask the USB interrupt line
    fn enable_irq(&mut self);
    fn disable_irq(&mut self);
    /// Put D+ and D- into their USB alternate function
    fn init_pins(&mut self);
    /// Return D+ and D- to plain inputs
    fn deinit_pins(&mut self);
    /// Busy wait for at least `us` microseconds
    fn delay_us(&mut self, us: u32);
}
