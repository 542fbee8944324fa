//! Control endpoint
//!
//! Endpoint 0 runs the chapter 9 control transfer state machine. A SETUP
//! packet starts a transfer; an optional data stage follows in the direction
//! of the request, then the status stage. Requests that change the device
//! (address and configuration) come back to the caller as an [`Effect`].

use crate::{
    descriptor::{DescriptorType, Descriptors},
    endpoint::{Endpoint, EndpointType, Status},
    ral,
};
use usb_device::{
    control::{Recipient, Request, RequestType},
    UsbDirection,
};

/// The largest control packet on a full-speed bus
const MAX_PACKET_SIZE: usize = 64;

/// Size of a SETUP packet
const SETUP_SIZE: usize = 8;

/// Data stage direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    None,
    In,
    Out,
}

/// A device change requested by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Status stage of SET_ADDRESS completed; commit this address
    Address(u8),
    /// SET_CONFIGURATION
    Configure(u8),
}

/// What the control endpoint needs from the device
pub struct Context<'a> {
    pub ral: &'a ral::Instances,
    pub descriptors: &'a mut dyn Descriptors,
    /// Response to a device GET_STATUS
    pub device_status: u16,
    /// Active configuration value
    pub configuration: u8,
}

/// A GET_DESCRIPTOR response that doesn't fit in one packet
#[derive(Debug, Clone, Copy)]
struct Pending {
    kind: DescriptorType,
    index: u8,
    /// Bytes already sent
    offset: u16,
    /// Bytes to send, never more than the host asked for
    total: u16,
}

/// Control endpoint state
pub struct Control {
    stage: Stage,
    /// Data stage bytes not yet transferred
    remaining: u16,
    /// SET_ADDRESS value, committed in the status stage
    address: Option<u8>,
    pending: Option<Pending>,
    /// The data stage ended on a full packet, short of what the host asked for
    zlp_due: bool,
}

impl Default for Control {
    fn default() -> Self {
        Self::new()
    }
}

impl Control {
    pub const fn new() -> Self {
        Control {
            stage: Stage::None,
            remaining: 0,
            address: None,
            pending: None,
            zlp_due: false,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Bus reset aborts any transfer, and readies the endpoint for SETUP
    pub(crate) fn on_reset(&mut self, ep: &Endpoint, cx: &mut Context) {
        ep.set_type(&cx.ral.usb, EndpointType::Control);
        ep.set_tx_status(&cx.ral.usb, Status::Nak);
        ep.set_rx_status(&cx.ral.usb, Status::Valid);
        self.release(cx.descriptors);
        self.stage = Stage::None;
        self.remaining = 0;
        self.address = None;
        self.zlp_due = false;
    }

    pub(crate) fn on_setup(&mut self, ep: &Endpoint, cx: &mut Context) -> Option<Effect> {
        self.release(cx.descriptors);
        self.stage = Stage::None;
        self.remaining = 0;
        self.zlp_due = false;

        let mut setup = [0; SETUP_SIZE];
        let effect = if ep.receive(cx.ral, &mut setup) == SETUP_SIZE {
            let request = parse(&setup);
            debug!("SETUP {}", request);
            if request.length != 0 {
                self.stage = match request.direction {
                    UsbDirection::In => Stage::In,
                    UsbDirection::Out => Stage::Out,
                };
                self.remaining = request.length;
            }
            self.dispatch(ep, cx, &request)
        } else {
            warn!("Short SETUP packet");
            None
        };

        ep.set_rx_status(&cx.ral.usb, Status::Valid);
        effect
    }

    fn dispatch(&mut self, ep: &Endpoint, cx: &mut Context, request: &Request) -> Option<Effect> {
        if request.request_type != RequestType::Standard {
            trace!("Ignoring non-standard request {}", request.request);
            return None;
        }

        match request.request {
            Request::GET_STATUS => {
                let status = match request.recipient {
                    Recipient::Device => cx.device_status,
                    _ => 0,
                };
                self.respond(ep, cx, &status.to_le_bytes());
            }
            Request::CLEAR_FEATURE | Request::SET_FEATURE | Request::SET_DESCRIPTOR => {
                ep.transmit(cx.ral, &[]);
            }
            Request::SET_ADDRESS => {
                self.address = Some((request.value & 0x7F) as u8);
                ep.transmit(cx.ral, &[]);
            }
            Request::GET_DESCRIPTOR
                if matches!(request.recipient, Recipient::Device | Recipient::Interface) =>
            {
                let (kind, index) = request.descriptor_type_index();
                self.start_descriptor(ep, cx, DescriptorType::from(kind), index, request.length);
            }
            Request::GET_CONFIGURATION => {
                self.respond(ep, cx, &[cx.configuration]);
            }
            Request::SET_CONFIGURATION => {
                ep.transmit(cx.ral, &[]);
                return Some(Effect::Configure(request.value as u8));
            }
            _ => {
                trace!("Ignoring request {}", request.request);
            }
        }
        None
    }

    /// Send a response that fits in one packet, limited to the requested length
    fn respond(&mut self, ep: &Endpoint, cx: &mut Context, data: &[u8]) {
        let size = data.len().min(usize::from(self.remaining));
        let sent = ep.transmit(cx.ral, &data[..size]);
        self.remaining -= sent as u16;
    }

    fn start_descriptor(
        &mut self,
        ep: &Endpoint,
        cx: &mut Context,
        kind: DescriptorType,
        index: u8,
        requested: u16,
    ) {
        let Some(descriptor) = cx.descriptors.descriptor(kind, index) else {
            warn!("No descriptor {} {}", u8::from(kind), index);
            self.stage = Stage::None;
            self.remaining = 0;
            return;
        };
        descriptor.on_init();
        let total = descriptor.length().min(requested);
        self.pending = Some(Pending {
            kind,
            index,
            offset: 0,
            total,
        });
        self.continue_descriptor(ep, cx);
    }

    /// Send the next packet of the pending descriptor
    fn continue_descriptor(&mut self, ep: &Endpoint, cx: &mut Context) {
        let Some(mut pending) = self.pending.take() else {
            return;
        };
        let Some(descriptor) = cx.descriptors.descriptor(pending.kind, pending.index) else {
            warn!("Descriptor {} {} went away", u8::from(pending.kind), pending.index);
            self.stage = Stage::None;
            return;
        };

        let packet_size = usize::from(ep.tx_size()).min(MAX_PACKET_SIZE);
        let chunk = usize::from(pending.total - pending.offset).min(packet_size);
        let mut packet = [0; MAX_PACKET_SIZE];
        for (i, byte) in packet[..chunk].iter_mut().enumerate() {
            *byte = descriptor.data(pending.offset + i as u16);
        }
        let sent = ep.transmit(cx.ral, &packet[..chunk]) as u16;
        pending.offset += sent;
        self.remaining = self.remaining.saturating_sub(sent);

        if pending.offset < pending.total {
            self.pending = Some(pending);
        } else {
            descriptor.on_deinit();
            self.zlp_due = self.remaining != 0 && usize::from(sent) == packet_size;
        }
    }

    /// An OUT packet arrived
    pub(crate) fn on_reception(&mut self, ep: &Endpoint, cx: &mut Context) -> Option<Effect> {
        match self.stage {
            Stage::In => {
                // Host's status packet, possibly before the data stage finished
                self.release(cx.descriptors);
                self.zlp_due = false;
                self.stage = Stage::None;
            }
            Stage::Out => {
                // Payload isn't forwarded anywhere; count it and move on
                let received = ep.received_len(&cx.ral.pma);
                self.remaining = self.remaining.saturating_sub(received);
                if self.remaining == 0 {
                    self.stage = Stage::None;
                }
            }
            Stage::None => {}
        }

        let effect = if self.stage == Stage::None {
            self.status_stage()
        } else {
            None
        };
        ep.set_rx_status(&cx.ral.usb, Status::Valid);
        effect
    }

    /// An IN packet was sent
    pub(crate) fn on_transmission(&mut self, ep: &Endpoint, cx: &mut Context) -> Option<Effect> {
        if self.stage == Stage::In {
            if self.pending.is_some() {
                self.continue_descriptor(ep, cx);
                return None;
            } else if self.zlp_due {
                self.zlp_due = false;
                ep.transmit(cx.ral, &[]);
                return None;
            }
            self.stage = Stage::None;
        }

        if self.stage == Stage::None {
            self.status_stage()
        } else {
            None
        }
    }

    fn status_stage(&mut self) -> Option<Effect> {
        self.address.take().map(Effect::Address)
    }

    /// Give up on a pending descriptor
    fn release(&mut self, descriptors: &mut dyn Descriptors) {
        if let Some(pending) = self.pending.take() {
            if let Some(descriptor) = descriptors.descriptor(pending.kind, pending.index) {
                descriptor.on_deinit();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_offset(&self) -> Option<u16> {
        self.pending.map(|pending| pending.offset)
    }
}

fn parse(setup: &[u8; SETUP_SIZE]) -> Request {
    let request_type = setup[0];
    Request {
        direction: UsbDirection::from(request_type),
        request_type: match (request_type >> 5) & 0b11 {
            0 => RequestType::Standard,
            1 => RequestType::Class,
            2 => RequestType::Vendor,
            _ => RequestType::Reserved,
        },
        recipient: match request_type & 0b1_1111 {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            3 => Recipient::Other,
            _ => Recipient::Reserved,
        },
        request: setup[1],
        value: u16::from_le_bytes([setup[2], setup[3]]),
        index: u16::from_le_bytes([setup[4], setup[5]]),
        length: u16::from_le_bytes([setup[6], setup[7]]),
    }
}
