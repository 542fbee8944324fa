//! Interrupt-safe access to a [`Device`]
//!
//! The interrupt handler and thread code may both need the device. `Shared`
//! serializes them with a critical section.
//!
//! `cortex_m::interrupt::free` only runs on a Cortex-M target, so this module
//! is exercised on hardware. Host tests drive [`Device`] directly.

use crate::{
    descriptor::Descriptors,
    device::{Device, DeviceStatus, Poll},
    Platform,
};
use core::cell::RefCell;
use cortex_m::interrupt::{self, Mutex};
use usb_device::Result;

pub struct Shared<P, D> {
    device: Mutex<RefCell<Device<P, D>>>,
}

impl<P: Platform, D: Descriptors> Shared<P, D> {
    /// Wrap a device
    ///
    /// Initialize and connect the device before sharing it, or do so through
    /// [`with_device`](Self::with_device).
    pub fn new(device: Device<P, D>) -> Self {
        Shared {
            device: Mutex::new(RefCell::new(device)),
        }
    }

    /// Interrupt-safe, immutable access to the device
    fn with_ref<R>(&self, func: impl FnOnce(&Device<P, D>) -> R) -> R {
        interrupt::free(|cs| {
            let device = self.device.borrow(cs);
            let device = device.borrow();
            func(&*device)
        })
    }

    /// Interrupt-safe, mutable access to the device
    pub fn with_device<R>(&self, func: impl FnOnce(&mut Device<P, D>) -> R) -> R {
        interrupt::free(|cs| {
            let device = self.device.borrow(cs);
            let mut device = device.borrow_mut();
            func(&mut *device)
        })
    }

    /// Handle the USB interrupt
    pub fn on_interrupt(&self) -> Poll {
        self.with_device(|device| device.on_interrupt())
    }

    pub fn status(&self) -> DeviceStatus {
        self.with_ref(|device| device.status())
    }

    pub fn is_ready(&self) -> bool {
        self.with_ref(|device| device.is_ready())
    }

    /// See [`Device::transmit`]
    pub fn transmit(&self, number: u8, data: &[u8]) -> Result<usize> {
        self.with_device(|device| device.transmit(number, data))
    }

    /// See [`Device::receive`]
    pub fn receive(&self, number: u8, buffer: &mut [u8]) -> Result<usize> {
        self.with_device(|device| device.receive(number, buffer))
    }
}
