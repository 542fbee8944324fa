//! Descriptors served by the control endpoint
//!
//! The application supplies descriptors through [`Descriptors`]. The control
//! endpoint asks for a descriptor by type and index, then reads it one byte
//! at a time while filling IN packets, so descriptors may be generated on the
//! fly rather than stored.

/// Standard descriptor types, the high byte of a GET_DESCRIPTOR `wValue`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorType {
    Device,
    Configuration,
    String,
    Interface,
    Endpoint,
    DeviceQualifier,
    OtherSpeedConfiguration,
    InterfacePower,
    /// Class or vendor specific
    Other(u8),
}

impl From<u8> for DescriptorType {
    fn from(value: u8) -> Self {
        match value {
            1 => DescriptorType::Device,
            2 => DescriptorType::Configuration,
            3 => DescriptorType::String,
            4 => DescriptorType::Interface,
            5 => DescriptorType::Endpoint,
            6 => DescriptorType::DeviceQualifier,
            7 => DescriptorType::OtherSpeedConfiguration,
            8 => DescriptorType::InterfacePower,
            other => DescriptorType::Other(other),
        }
    }
}

impl From<DescriptorType> for u8 {
    fn from(kind: DescriptorType) -> Self {
        match kind {
            DescriptorType::Device => 1,
            DescriptorType::Configuration => 2,
            DescriptorType::String => 3,
            DescriptorType::Interface => 4,
            DescriptorType::Endpoint => 5,
            DescriptorType::DeviceQualifier => 6,
            DescriptorType::OtherSpeedConfiguration => 7,
            DescriptorType::InterfacePower => 8,
            DescriptorType::Other(other) => other,
        }
    }
}

/// A descriptor handle
///
/// `on_init` is called once when a GET_DESCRIPTOR transfer starts, and
/// `on_deinit` once when it ends, however it ends. Between them, the control
/// endpoint calls `length` and `data`.
pub trait Descriptor {
    fn on_init(&mut self) {}
    fn on_deinit(&mut self) {}
    /// Total descriptor length, in bytes
    fn length(&self) -> u16;
    /// The byte at `index`, which is always less than `length()`
    fn data(&self, index: u16) -> u8;
}

impl Descriptor for &[u8] {
    fn length(&self) -> u16 {
        self.len().min(usize::from(u16::MAX)) as u16
    }

    fn data(&self, index: u16) -> u8 {
        self.get(usize::from(index)).copied().unwrap_or(0)
    }
}

/// Resolves descriptors for the control endpoint
///
/// A transfer that spans multiple packets looks up the same descriptor for
/// every packet. The provider must return the same descriptor for the same
/// `(kind, index)` until the transfer ends.
pub trait Descriptors {
    /// Returns `None` if the device doesn't have the descriptor. The request
    /// is then dropped.
    fn descriptor(&mut self, kind: DescriptorType, index: u8) -> Option<&mut dyn Descriptor>;
}
