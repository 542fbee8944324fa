//! Register access for the USB full-speed peripheral
//!
//! The register block follows the STM32L4 reference manual (RM0394, "USB
//! full-speed device interface"). Field modules use the layout expected by
//! the `ral-registers` macros, so that we can `read_reg!`, `write_reg!` and
//! `modify_reg!` like any other RAL peripheral.
//!
//! It also adds some enhancements for endpoint register access.

#![allow(non_snake_case, non_upper_case_globals)]

pub use ral_registers::{modify_reg, read_reg, write_reg};

use crate::{pma::PacketMemory, vcell::VCell, Peripherals};
use core::ops::Deref;

/// Endpoint registers have toggle and write-0-to-clear fields.
#[cfg(not(test))]
pub type EndpointRegister = VCell<u32>;
#[cfg(test)]
pub type EndpointRegister = crate::sim::ToggleRegister;

/// ISTR flags are cleared by writing zero.
#[cfg(not(test))]
pub type InterruptStatusRegister = VCell<u32>;
#[cfg(test)]
pub type InterruptStatusRegister = crate::sim::ClearRegister;

/// Generates RAL field modules for a register
macro_rules! fields {
    ($($field:ident: $offset:expr, $width:expr;)+) => {
        $(
            #[allow(dead_code)]
            pub mod $field {
                pub const offset: u32 = $offset;
                pub const mask: u32 = ((1 << $width) - 1) << offset;
                pub mod RW {}
                pub mod R {}
                pub mod W {}
            }
        )+
    };
}

pub mod usb {
    use super::{EndpointRegister, InterruptStatusRegister, VCell};

    /// Number of endpoint registers
    pub const ENDPOINTS: usize = 8;

    #[repr(C)]
    #[allow(dead_code)]
    pub struct RegisterBlock {
        /// EP0R..EP7R, offset 0x00
        pub EPR: [EndpointRegister; ENDPOINTS],
        _reserved: [u32; 8],
        /// Offset 0x40
        pub CNTR: VCell<u32>,
        pub ISTR: InterruptStatusRegister,
        pub FNR: VCell<u32>,
        pub DADDR: VCell<u32>,
        pub BTABLE: VCell<u32>,
        pub LPMCSR: VCell<u32>,
        pub BCDR: VCell<u32>,
    }

    #[cfg(test)]
    impl RegisterBlock {
        pub fn new() -> Self {
            const EPR: EndpointRegister = EndpointRegister::new(0);
            RegisterBlock {
                EPR: [EPR; ENDPOINTS],
                _reserved: [0; 8],
                // Reset value
                CNTR: VCell::new(0x0003),
                ISTR: InterruptStatusRegister::new(0),
                FNR: VCell::new(0),
                DADDR: VCell::new(0),
                BTABLE: VCell::new(0),
                LPMCSR: VCell::new(0),
                BCDR: VCell::new(0),
            }
        }
    }

    const _: [(); 1] = [(); (core::mem::size_of::<RegisterBlock>() == 0x5C) as usize];

    pub mod CNTR {
        fields! {
            FRES: 0, 1;
            PDWN: 1, 1;
            LP_MODE: 2, 1;
            FSUSP: 3, 1;
            RESUME: 4, 1;
            L1RESUME: 5, 1;
            L1REQM: 7, 1;
            ESOFM: 8, 1;
            SOFM: 9, 1;
            RESETM: 10, 1;
            SUSPM: 11, 1;
            WKUPM: 12, 1;
            ERRM: 13, 1;
            PMAOVRM: 14, 1;
            CTRM: 15, 1;
        }
    }

    pub mod ISTR {
        fields! {
            EP_ID: 0, 4;
            DIR: 4, 1;
            L1REQ: 7, 1;
            ESOF: 8, 1;
            SOF: 9, 1;
            RESET: 10, 1;
            SUSP: 11, 1;
            WKUP: 12, 1;
            ERR: 13, 1;
            PMAOVR: 14, 1;
            CTR: 15, 1;
        }
    }

    pub mod FNR {
        fields! {
            FN: 0, 11;
            LSOF: 11, 2;
            LCK: 13, 1;
            RXDM: 14, 1;
            RXDP: 15, 1;
        }
    }

    pub mod DADDR {
        fields! {
            ADD: 0, 7;
            EF: 7, 1;
        }
    }

    pub mod BTABLE {
        fields! {
            BTABLE: 3, 13;
        }
    }

    pub mod BCDR {
        fields! {
            BCDEN: 0, 1;
            DCDEN: 1, 1;
            PDEN: 2, 1;
            SDEN: 3, 1;
            DPPU: 15, 1;
        }
    }
}

/// The RAL API requires us to treat all endpoint registers as unique.
/// We can make it a little easier with this function, the `Register` type,
/// and the `EPR` field module.
pub mod endpoint {
    use super::{usb, EndpointRegister};

    pub struct Register<'a> {
        pub EPR: &'a EndpointRegister,
    }

    pub mod EPR {
        fields! {
            EA: 0, 4;
            STAT_TX: 4, 2;
            DTOG_TX: 6, 1;
            CTR_TX: 7, 1;
            EP_KIND: 8, 1;
            EP_TYPE: 9, 2;
            SETUP: 11, 1;
            STAT_RX: 12, 2;
            DTOG_RX: 14, 1;
            CTR_RX: 15, 1;
        }
    }

    pub fn register(usb: &usb::RegisterBlock, endpoint: u8) -> Register<'_> {
        match usb.EPR.get(usize::from(endpoint)) {
            Some(epr) => Register { EPR: epr },
            None => unreachable!("EP{}R register doesn't exist", endpoint),
        }
    }
}

/// A pointer to a memory-mapped block, owned by the driver
pub struct Instance<T> {
    ptr: *const T,
}

impl<T> Deref for Instance<T> {
    type Target = T;
    fn deref(&self) -> &T {
        // Safety: Peripherals implementer guarantees that the address is valid
        // for as long as the driver exists.
        unsafe { &*self.ptr }
    }
}

// Safety: the driver is the sole owner of the register block and packet
// memory. Moving it to another execution context moves that ownership.
unsafe impl<T> Send for Instance<T> {}

/// The memory blocks used by one USB peripheral
pub struct Instances {
    pub usb: Instance<usb::RegisterBlock>,
    pub pma: Instance<PacketMemory>,
}

/// Convert the peripheral addresses into driver instances
pub fn instances<P: Peripherals>(peripherals: P) -> Instances {
    Instances {
        usb: Instance {
            ptr: peripherals.usb() as *const usb::RegisterBlock,
        },
        pma: Instance {
            ptr: peripherals.packet_memory() as *const PacketMemory,
        },
    }
}
