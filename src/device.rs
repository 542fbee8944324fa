//! USB device controller
//!
//! [`Device`] owns the peripheral, the endpoint table, and the device state.
//! Call [`Device::on_interrupt`] from the USB interrupt handler. Endpoint 0 is
//! always the control endpoint; bind endpoints 1 through 7 with
//! [`Device::set_endpoint`].

use crate::{
    control::{Context, Control, Effect, Stage},
    descriptor::Descriptors,
    endpoint::{self, BufferLayout, Endpoint, EndpointType, RegisterUpdate, Status, BDT_SIZE},
    pma::{self, PMA_SIZE},
    ral, Peripherals, Platform, NUM_ENDPOINTS,
};
use usb_device::{Result, UsbError};

use ral::endpoint::EPR;

/// Transceiver startup time after leaving power down, in microseconds
const TRANSCEIVER_STARTUP_US: u32 = 10;

/// Default control endpoint buffers, placed after a BDT at offset 0
pub const CONTROL_LAYOUT: BufferLayout = BufferLayout {
    tx_addr: 64,
    tx_size: 64,
    rx_addr: 128,
    rx_size: 64,
};

/// USB device state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    /// Not initialized, or deinitialized
    Disabled,
    /// Initialized, waiting for a bus reset
    Powered,
    /// Reset by the host, responding at address 0
    Default,
    Addressed,
    Configured,
    Suspended,
    /// Part of the chapter 9 state set. The driver can't observe VBUS, so it
    /// never enters this state.
    Attached,
}

/// Application notifications, called from the interrupt
#[derive(Debug, Clone, Copy, Default)]
pub struct Callbacks {
    pub reset: Option<fn()>,
    pub suspend: Option<fn()>,
    pub resume: Option<fn()>,
}

/// Device configuration
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Offset of the buffer descriptor table in packet memory. Must be a
    /// multiple of 8.
    pub btable: u16,
    /// Control endpoint buffers
    pub control: BufferLayout,
    pub callbacks: Callbacks,
    /// Response to a GET_STATUS addressed to the device. Bit 0 is "self
    /// powered", bit 1 is "remote wakeup".
    pub device_status: u16,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            btable: 0,
            control: CONTROL_LAYOUT,
            callbacks: Callbacks::default(),
            device_status: 0,
        }
    }
}

/// A generic endpoint's type and buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointConfig {
    pub kind: EndpointType,
    pub layout: BufferLayout,
}

bitflags::bitflags! {
    /// Interrupt flags, as reported by ISTR
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Interrupts: u32 {
        const L1REQ = 1 << 7;
        const ESOF = 1 << 8;
        const SOF = 1 << 9;
        const RESET = 1 << 10;
        const SUSP = 1 << 11;
        const WKUP = 1 << 12;
        const ERR = 1 << 13;
        const PMAOVR = 1 << 14;
        /// Correct transfer; cleared through the endpoint registers
        const CTR = 1 << 15;
    }
}

/// ISTR flags that software clears by writing 0
const LATCHED: Interrupts = Interrupts::all().difference(Interrupts::CTR);

/// The outcome of one interrupt
///
/// Endpoint masks only cover generic endpoints. Bit `n` is endpoint `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Poll {
    /// Flags that were set when the interrupt was handled
    pub interrupts: Interrupts,
    /// Endpoints that received data; read it with [`Device::receive`]
    pub ep_out: u8,
    /// Endpoints that finished a transmission
    pub ep_in_complete: u8,
}

enum Role {
    Generic,
    Control(Control),
}

struct Slot {
    endpoint: Endpoint,
    role: Role,
}

/// A USB full-speed device
pub struct Device<P, D> {
    ral: ral::Instances,
    platform: P,
    descriptors: D,
    btable: u16,
    device_status: u16,
    callbacks: Callbacks,
    slots: [Option<Slot>; NUM_ENDPOINTS],
    status: DeviceStatus,
    pre_suspend: DeviceStatus,
    configuration: u8,
}

impl<P: Platform, D: Descriptors> Device<P, D> {
    /// Create a USB device
    ///
    /// The device starts out `Disabled`; call [`init`](Self::init), then
    /// [`connect`](Self::connect). Returns an error if the BDT or control
    /// endpoint buffers don't fit in packet memory.
    pub fn new<R: Peripherals>(
        peripherals: R,
        platform: P,
        descriptors: D,
        config: Config,
    ) -> Result<Self> {
        if config.btable % pma::DESCRIPTOR_SIZE != 0 {
            return Err(UsbError::Unsupported);
        }
        if usize::from(config.btable) + usize::from(BDT_SIZE) > PMA_SIZE {
            return Err(UsbError::EndpointMemoryOverflow);
        }
        if config.control.tx_size == 0 || config.control.rx_size == 0 {
            return Err(UsbError::Unsupported);
        }
        config.control.validate(config.btable)?;

        let mut endpoint = Endpoint::new(0, EndpointType::Control, config.btable);
        endpoint.set_buffer_descriptor(config.control);
        let mut slots: [Option<Slot>; NUM_ENDPOINTS] = core::array::from_fn(|_| None);
        slots[0] = Some(Slot {
            endpoint,
            role: Role::Control(Control::new()),
        });

        Ok(Device {
            ral: ral::instances(peripherals),
            platform,
            descriptors,
            btable: config.btable,
            device_status: config.device_status,
            callbacks: config.callbacks,
            slots,
            status: DeviceStatus::Disabled,
            pre_suspend: DeviceStatus::Disabled,
            configuration: 0,
        })
    }

    /// Power the peripheral and prepare the endpoints
    ///
    /// The peripheral stays in reset and powered down until
    /// [`connect`](Self::connect).
    pub fn init(&mut self) {
        self.platform.enable_voltage_detector();
        self.platform.enable_usb_clock();

        self.ral.pma.clear();
        ral::write_reg!(ral::usb, self.ral.usb, CNTR, FRES: 1, PDWN: 1);
        ral::write_reg!(ral::usb, self.ral.usb, ISTR, 0);
        ral::write_reg!(ral::usb, self.ral.usb, BTABLE, u32::from(self.btable));

        for slot in self.slots.iter().flatten() {
            slot.endpoint.init_buffer_descriptor(&self.ral.pma);
        }
        self.status = DeviceStatus::Powered;
        debug!("INIT");
    }

    /// Attach to the bus
    ///
    /// After this call, the host sees the device and resets it.
    pub fn connect(&mut self) {
        ral::modify_reg!(ral::usb, self.ral.usb, CNTR, PDWN: 0);
        self.platform.delay_us(TRANSCEIVER_STARTUP_US);
        ral::modify_reg!(ral::usb, self.ral.usb, CNTR, FRES: 0);
        ral::write_reg!(ral::usb, self.ral.usb, ISTR, 0);

        self.platform.enable_irq();
        ral::modify_reg!(ral::usb, self.ral.usb, CNTR, RESETM: 1, CTRM: 1, SUSPM: 1, WKUPM: 1);
        self.platform.init_pins();
        ral::modify_reg!(ral::usb, self.ral.usb, BCDR, DPPU: 1);
        debug!("CONNECT");
    }

    /// Detach from the bus
    pub fn disconnect(&mut self) {
        ral::modify_reg!(ral::usb, self.ral.usb, BCDR, DPPU: 0);
        self.platform.deinit_pins();
        ral::modify_reg!(ral::usb, self.ral.usb, CNTR, RESETM: 0, CTRM: 0, SUSPM: 0, WKUPM: 0);
        self.platform.disable_irq();

        ral::write_reg!(ral::usb, self.ral.usb, CNTR, FRES: 1, PDWN: 1);
        ral::write_reg!(ral::usb, self.ral.usb, ISTR, 0);

        if self.status != DeviceStatus::Disabled {
            self.status = DeviceStatus::Powered;
        }
        self.configuration = 0;
        debug!("DISCONNECT");
    }

    /// Detach from the bus and remove power
    pub fn deinit(&mut self) {
        self.disconnect();
        self.platform.disable_usb_clock();
        self.platform.disable_voltage_detector();
        self.status = DeviceStatus::Disabled;
    }

    /// Handle the USB interrupt
    ///
    /// Call this once per interrupt. A bus reset takes precedence over all
    /// other events signaled in the same interrupt.
    pub fn on_interrupt(&mut self) -> Poll {
        let istr = ral::read_reg!(ral::usb, self.ral.usb, ISTR);
        // Writing 1 leaves a flag alone, so flags raised since the read survive
        ral::write_reg!(ral::usb, self.ral.usb, ISTR, !(istr & LATCHED.bits()));

        let interrupts = Interrupts::from_bits_truncate(istr);
        let mut poll = Poll {
            interrupts,
            ..Poll::default()
        };

        if interrupts.contains(Interrupts::RESET) {
            self.bus_reset();
            return poll;
        }

        if interrupts.contains(Interrupts::CTR) {
            use ral::usb::ISTR;
            let number = ((istr & ISTR::EP_ID::mask) >> ISTR::EP_ID::offset) as u8;
            self.on_transfer(number, &mut poll);
        }

        if interrupts.contains(Interrupts::SUSP) {
            ral::modify_reg!(ral::usb, self.ral.usb, CNTR, FSUSP: 1);
            if self.status != DeviceStatus::Suspended {
                self.pre_suspend = self.status;
                self.status = DeviceStatus::Suspended;
            }
            debug!("SUSPEND");
            if let Some(suspend) = self.callbacks.suspend {
                suspend();
            }
        }

        if interrupts.contains(Interrupts::WKUP) {
            ral::modify_reg!(ral::usb, self.ral.usb, CNTR, FSUSP: 0);
            if self.status == DeviceStatus::Suspended {
                self.status = self.pre_suspend;
                debug!("RESUME");
                if let Some(resume) = self.callbacks.resume {
                    resume();
                }
            }
        }

        poll
    }

    fn bus_reset(&mut self) {
        debug!("RESET");
        ral::write_reg!(ral::usb, self.ral.usb, DADDR, ADD: 0, EF: 1);

        for slot in self.slots.iter_mut().flatten() {
            slot.endpoint.reset(&self.ral);
            match &mut slot.role {
                Role::Control(control) => {
                    let mut cx = Context {
                        ral: &self.ral,
                        descriptors: &mut self.descriptors,
                        device_status: self.device_status,
                        configuration: 0,
                    };
                    control.on_reset(&slot.endpoint, &mut cx);
                }
                Role::Generic => reset_generic(&slot.endpoint, &self.ral),
            }
        }

        if let Some(reset) = self.callbacks.reset {
            reset();
        }
        self.configuration = 0;
        self.status = DeviceStatus::Default;
    }

    fn on_transfer(&mut self, number: u8, poll: &mut Poll) {
        let Some(slot) = self
            .slots
            .get_mut(usize::from(number))
            .and_then(Option::as_mut)
        else {
            warn!("CTR on unbound EP{}", number);
            if usize::from(number) >= NUM_ENDPOINTS {
                return;
            }
            // Nobody handles the transfer, but CTR must not stay asserted
            let epr = ral::endpoint::register(&self.ral.usb, number);
            let seen = ral::read_reg!(ral::endpoint, &epr, EPR);
            endpoint::update_register(
                &self.ral.usb,
                number,
                RegisterUpdate::new().clear_flags(seen & (EPR::CTR_RX::mask | EPR::CTR_TX::mask)),
            );
            return;
        };

        let epr = slot.endpoint.read_register(&self.ral.usb);
        let received = epr & EPR::CTR_RX::mask != 0;
        let transmitted = epr & EPR::CTR_TX::mask != 0;
        let setup = epr & EPR::SETUP::mask != 0;
        slot.endpoint
            .clear_transfer_flags(&self.ral.usb, epr & (EPR::CTR_RX::mask | EPR::CTR_TX::mask));

        let mut effects = [None, None];
        match &mut slot.role {
            Role::Control(control) => {
                let mut cx = Context {
                    ral: &self.ral,
                    descriptors: &mut self.descriptors,
                    device_status: self.device_status,
                    configuration: self.configuration,
                };
                if received {
                    effects[0] = if setup {
                        control.on_setup(&slot.endpoint, &mut cx)
                    } else {
                        control.on_reception(&slot.endpoint, &mut cx)
                    };
                }
                if transmitted {
                    effects[1] = control.on_transmission(&slot.endpoint, &mut cx);
                }
            }
            Role::Generic => {
                if received {
                    poll.ep_out |= 1 << number;
                }
                if transmitted {
                    poll.ep_in_complete |= 1 << number;
                }
            }
        }

        for effect in effects.into_iter().flatten() {
            self.apply(effect);
        }
    }

    fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::Address(address) => {
                // Address and enable in one write
                ral::write_reg!(ral::usb, self.ral.usb, DADDR, ADD: u32::from(address), EF: 1);
                debug!("ADDRESS {}", address);
                self.status = if address != 0 {
                    DeviceStatus::Addressed
                } else {
                    DeviceStatus::Default
                };
            }
            Effect::Configure(configuration) => {
                debug!("CONFIGURED {}", configuration);
                self.configuration = configuration;
                if configuration == 0 {
                    if self.status == DeviceStatus::Configured {
                        self.status = DeviceStatus::Addressed;
                    }
                    return;
                }
                self.status = DeviceStatus::Configured;
                for slot in self.slots.iter().flatten() {
                    if matches!(slot.role, Role::Generic) && slot.endpoint.rx_size() != 0 {
                        slot.endpoint.set_rx_status(&self.ral.usb, Status::Valid);
                    }
                }
            }
        }
    }

    /// Bind, rebind or unbind a generic endpoint
    ///
    /// `number` is 1 through 7. The buffers must fit in packet memory without
    /// overlapping the BDT or any other endpoint's buffers.
    pub fn set_endpoint(&mut self, number: u8, config: Option<EndpointConfig>) -> Result<()> {
        let index = usize::from(number);
        if number == 0 || index >= NUM_ENDPOINTS {
            return Err(UsbError::InvalidEndpoint);
        }

        let Some(config) = config else {
            if let Some(slot) = self.slots[index].take() {
                debug!("UNBIND EP{}", number);
                if self.bus_active() {
                    slot.endpoint.set_tx_status(&self.ral.usb, Status::Disabled);
                    slot.endpoint.set_rx_status(&self.ral.usb, Status::Disabled);
                }
            }
            return Ok(());
        };

        config.layout.validate(self.btable)?;
        let overlapping = self
            .slots
            .iter()
            .enumerate()
            .filter(|(other, _)| *other != index)
            .filter_map(|(_, slot)| slot.as_ref())
            .any(|slot| slot.endpoint.layout().overlaps(&config.layout));
        if overlapping {
            return Err(UsbError::EndpointMemoryOverflow);
        }

        let mut endpoint = Endpoint::new(number, config.kind, self.btable);
        endpoint.set_buffer_descriptor(config.layout);
        if self.status != DeviceStatus::Disabled {
            endpoint.init_buffer_descriptor(&self.ral.pma);
        }
        if self.bus_active() {
            endpoint.set_address(&self.ral.usb, number);
            reset_generic(&endpoint, &self.ral);
        }

        debug!("BIND EP{} {}", number, config.kind as u32);
        self.slots[index] = Some(Slot {
            endpoint,
            role: Role::Generic,
        });
        Ok(())
    }

    /// The host has reset the device since it was connected
    fn bus_active(&self) -> bool {
        matches!(
            self.status,
            DeviceStatus::Default
                | DeviceStatus::Addressed
                | DeviceStatus::Configured
                | DeviceStatus::Suspended
        )
    }

    fn generic(&self, number: u8) -> Result<&Endpoint> {
        if self.status == DeviceStatus::Disabled {
            return Err(UsbError::InvalidState);
        }
        match self.slots.get(usize::from(number)) {
            Some(Some(Slot {
                endpoint,
                role: Role::Generic,
            })) => Ok(endpoint),
            _ => Err(UsbError::InvalidEndpoint),
        }
    }

    /// Send `data` from a generic endpoint
    ///
    /// Data beyond the endpoint's TX buffer size is dropped. Returns the
    /// number of bytes that will be sent.
    pub fn transmit(&mut self, number: u8, data: &[u8]) -> Result<usize> {
        let endpoint = self.generic(number)?;
        if endpoint.tx_size() == 0 {
            return Err(UsbError::InvalidEndpoint);
        }
        Ok(endpoint.transmit(&self.ral, data))
    }

    /// Read data received by a generic endpoint, and accept more
    ///
    /// Returns the number of bytes copied into `buffer`.
    pub fn receive(&mut self, number: u8, buffer: &mut [u8]) -> Result<usize> {
        let endpoint = self.generic(number)?;
        if endpoint.rx_size() == 0 {
            return Err(UsbError::InvalidEndpoint);
        }
        Ok(endpoint.receive(&self.ral, buffer))
    }

    /// The number of bytes waiting in a generic endpoint's RX buffer
    pub fn received_len(&self, number: u8) -> Result<u16> {
        self.generic(number)
            .map(|endpoint| endpoint.received_len(&self.ral.pma))
    }

    pub fn set_tx_status(&mut self, number: u8, status: Status) -> Result<()> {
        self.generic(number)
            .map(|endpoint| endpoint.set_tx_status(&self.ral.usb, status))
    }

    pub fn set_rx_status(&mut self, number: u8, status: Status) -> Result<()> {
        self.generic(number)
            .map(|endpoint| endpoint.set_rx_status(&self.ral.usb, status))
    }

    pub fn tx_status(&self, number: u8) -> Result<Status> {
        self.generic(number)
            .map(|endpoint| endpoint.tx_status(&self.ral.usb))
    }

    pub fn rx_status(&self, number: u8) -> Result<Status> {
        self.generic(number)
            .map(|endpoint| endpoint.rx_status(&self.ral.usb))
    }

    /// The endpoint bound to `number`, if any
    pub fn endpoint(&self, number: u8) -> Option<&Endpoint> {
        self.slots
            .get(usize::from(number))
            .and_then(Option::as_ref)
            .map(|slot| &slot.endpoint)
    }

    pub fn status(&self) -> DeviceStatus {
        self.status
    }

    /// Returns `true` once the host has configured the device
    pub fn is_ready(&self) -> bool {
        self.status == DeviceStatus::Configured
    }

    /// The device address assigned by the host
    pub fn address(&self) -> u8 {
        ral::read_reg!(ral::usb, self.ral.usb, DADDR, ADD) as u8
    }

    /// The active configuration value, or 0 if unconfigured
    pub fn configuration(&self) -> u8 {
        self.configuration
    }

    pub fn set_callbacks(&mut self, callbacks: Callbacks) {
        self.callbacks = callbacks;
    }

    pub fn descriptors(&self) -> &D {
        &self.descriptors
    }

    pub fn descriptors_mut(&mut self) -> &mut D {
        &mut self.descriptors
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Data stage of the control transfer in progress
    pub fn control_stage(&self) -> Stage {
        self.control().map_or(Stage::None, Control::stage)
    }

    fn control(&self) -> Option<&Control> {
        match self.slots.first() {
            Some(Some(Slot {
                role: Role::Control(control),
                ..
            })) => Some(control),
            _ => None,
        }
    }
}

/// Generic endpoints wait for the application after a reset
fn reset_generic(endpoint: &Endpoint, ral: &ral::Instances) {
    endpoint.set_type(&ral.usb, endpoint.kind());
    let status = |size: u16| if size != 0 { Status::Nak } else { Status::Disabled };
    endpoint.set_tx_status(&ral.usb, status(endpoint.tx_size()));
    endpoint.set_rx_status(&ral.usb, status(endpoint.rx_size()));
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        descriptor::{Descriptor, DescriptorType},
        sim::Hardware,
    };
    use core::sync::atomic::{AtomicU32, Ordering};
    use usb_device::control::Request;

    const DEVICE: [u8; 18] = [
        18, 1, 0x00, 0x02, 0, 0, 0, 64, 0x83, 0x04, 0x40, 0x57, 0x00, 0x01, 1, 2, 3, 1,
    ];

    #[derive(Default)]
    struct DeviceDescriptor {
        inits: u32,
        deinits: u32,
    }

    impl Descriptor for DeviceDescriptor {
        fn on_init(&mut self) {
            self.inits += 1;
        }
        fn on_deinit(&mut self) {
            self.deinits += 1;
        }
        fn length(&self) -> u16 {
            DEVICE.len() as u16
        }
        fn data(&self, index: u16) -> u8 {
            DEVICE[usize::from(index)]
        }
    }

    #[derive(Default)]
    struct TestDescriptors {
        device: DeviceDescriptor,
    }

    impl Descriptors for TestDescriptors {
        fn descriptor(&mut self, kind: DescriptorType, _: u8) -> Option<&mut dyn Descriptor> {
            match kind {
                DescriptorType::Device => Some(&mut self.device),
                _ => None,
            }
        }
    }

    #[derive(Default)]
    struct TestPlatform {
        clock: bool,
        voltage: bool,
        irq: bool,
        pins: bool,
        delay: u32,
    }

    impl Platform for TestPlatform {
        fn enable_usb_clock(&mut self) {
            self.clock = true;
        }
        fn disable_usb_clock(&mut self) {
            self.clock = false;
        }
        fn enable_voltage_detector(&mut self) {
            self.voltage = true;
        }
        fn disable_voltage_detector(&mut self) {
            self.voltage = false;
        }
        fn enable_irq(&mut self) {
            self.irq = true;
        }
        fn disable_irq(&mut self) {
            self.irq = false;
        }
        fn init_pins(&mut self) {
            self.pins = true;
        }
        fn deinit_pins(&mut self) {
            self.pins = false;
        }
        fn delay_us(&mut self, us: u32) {
            self.delay += us;
        }
    }

    type TestDevice = Device<TestPlatform, TestDescriptors>;

    use ral::usb::{BCDR, CNTR, ISTR};

    const EP1: EndpointConfig = EndpointConfig {
        kind: EndpointType::Bulk,
        layout: BufferLayout {
            tx_addr: 192,
            tx_size: 64,
            rx_addr: 256,
            rx_size: 64,
        },
    };

    fn device(hw: &Hardware, config: Config) -> TestDevice {
        Device::new(hw, TestPlatform::default(), TestDescriptors::default(), config).unwrap()
    }

    /// A device that the host has just reset
    fn reset_device(hw: &Hardware, config: Config) -> TestDevice {
        let mut device = device(hw, config);
        device.init();
        device.connect();
        hw.usb.ISTR.set(Interrupts::RESET.bits());
        device.on_interrupt();
        device
    }

    fn setup(hw: &Hardware, request_type: u8, request: u8, value: u16, length: u16) {
        let [v0, v1] = value.to_le_bytes();
        let [l0, l1] = length.to_le_bytes();
        out(hw, 0, &[request_type, request, v0, v1, 0, 0, l0, l1], true);
    }

    /// The host sent `data` to endpoint `number`
    fn out(hw: &Hardware, number: u8, data: &[u8], setup: bool) {
        let descriptor = pma::read_descriptor(&hw.pma, u16::from(number) * 8);
        hw.pma.write(descriptor.addr_rx, data);
        let count = descriptor.count_rx & !pma::COUNT_MASK;
        hw.pma
            .write_u16(u16::from(number) * 8 + 6, count | data.len() as u16);
        hw.epr(number).hw_receive(setup);
        hw.usb
            .ISTR
            .set(Interrupts::CTR.bits() | ISTR::DIR::mask | u32::from(number));
    }

    /// The host read endpoint `number`'s TX buffer
    fn in_complete(hw: &Hardware, number: u8) {
        hw.epr(number).hw_transmit();
        hw.usb.ISTR.set(Interrupts::CTR.bits() | u32::from(number));
    }

    /// What endpoint `number` is sending
    fn sent(hw: &Hardware, number: u8) -> ([u8; 64], usize) {
        let descriptor = pma::read_descriptor(&hw.pma, u16::from(number) * 8);
        let len = usize::from(descriptor.count_tx & pma::COUNT_MASK);
        let mut data = [0; 64];
        hw.pma.read(descriptor.addr_tx, &mut data[..len]);
        (data, len)
    }

    fn ep0_status(hw: &Hardware) -> (Status, Status) {
        let epr = hw.epr(0).read();
        (
            Status::from_bits(epr >> EPR::STAT_TX::offset),
            Status::from_bits(epr >> EPR::STAT_RX::offset),
        )
    }

    #[test]
    fn rejects_bad_config() {
        let hw = Hardware::new();
        let new = |config| {
            Device::new(&hw, TestPlatform::default(), TestDescriptors::default(), config)
                .map(|_| ())
        };
        assert_eq!(
            new(Config {
                btable: 4,
                ..Config::default()
            }),
            Err(UsbError::Unsupported)
        );
        assert_eq!(
            new(Config {
                btable: 1000,
                ..Config::default()
            }),
            Err(UsbError::EndpointMemoryOverflow)
        );
        assert_eq!(
            new(Config {
                btable: 64,
                ..Config::default()
            }),
            Err(UsbError::EndpointMemoryOverflow)
        );
        assert_eq!(
            new(Config {
                control: BufferLayout {
                    rx_size: 0,
                    ..CONTROL_LAYOUT
                },
                ..Config::default()
            }),
            Err(UsbError::Unsupported)
        );
        assert_eq!(new(Config::default()), Ok(()));
    }

    #[test]
    fn init_connect_disconnect() {
        let hw = Hardware::new();
        let mut device = device(
            &hw,
            Config {
                btable: 512,
                control: BufferLayout {
                    tx_addr: 0,
                    tx_size: 64,
                    rx_addr: 64,
                    rx_size: 64,
                },
                ..Config::default()
            },
        );
        assert_eq!(device.status(), DeviceStatus::Disabled);
        hw.pma.write(600, &[0xFF; 8]);

        device.init();
        assert_eq!(device.status(), DeviceStatus::Powered);
        assert!(device.platform().clock && device.platform().voltage);
        assert_eq!(hw.usb.CNTR.read(), CNTR::FRES::mask | CNTR::PDWN::mask);
        assert_eq!(hw.usb.BTABLE.read(), 512);
        assert_eq!(hw.pma.read_u16(600), 0);
        // Control endpoint BDT entry
        assert_eq!(hw.pma.read_u16(512), 0);
        assert_eq!(hw.pma.read_u16(516), 64);
        assert_eq!(hw.pma.read_u16(518), 0x8400);

        device.connect();
        let cntr = hw.usb.CNTR.read();
        assert_eq!(cntr & (CNTR::FRES::mask | CNTR::PDWN::mask), 0);
        let masks = CNTR::RESETM::mask | CNTR::CTRM::mask | CNTR::SUSPM::mask | CNTR::WKUPM::mask;
        assert_eq!(cntr & masks, masks);
        assert_eq!(hw.usb.BCDR.read() & BCDR::DPPU::mask, BCDR::DPPU::mask);
        assert_eq!(device.platform().delay, 10);
        assert!(device.platform().irq && device.platform().pins);

        device.disconnect();
        assert_eq!(hw.usb.BCDR.read() & BCDR::DPPU::mask, 0);
        assert_eq!(hw.usb.CNTR.read(), CNTR::FRES::mask | CNTR::PDWN::mask);
        assert!(!device.platform().irq && !device.platform().pins);
        assert_eq!(device.status(), DeviceStatus::Powered);

        device.deinit();
        assert_eq!(device.status(), DeviceStatus::Disabled);
        assert!(!device.platform().clock && !device.platform().voltage);
    }

    static RESETS: AtomicU32 = AtomicU32::new(0);

    #[test]
    fn bus_reset() {
        let hw = Hardware::new();
        let mut device = device(
            &hw,
            Config {
                callbacks: Callbacks {
                    reset: Some(|| {
                        RESETS.fetch_add(1, Ordering::Relaxed);
                    }),
                    ..Callbacks::default()
                },
                ..Config::default()
            },
        );
        device.init();
        device.connect();
        hw.usb.DADDR.write(0x12);

        // Reset wins over everything else in the same interrupt
        hw.usb
            .ISTR
            .set((Interrupts::RESET | Interrupts::SUSP | Interrupts::SOF).bits());
        let poll = device.on_interrupt();
        assert!(poll.interrupts.contains(Interrupts::RESET));
        assert_eq!(device.status(), DeviceStatus::Default);
        assert_eq!(hw.usb.DADDR.read(), 0x80);
        assert_eq!(hw.usb.ISTR.read(), 0);
        assert_eq!(hw.usb.CNTR.read() & CNTR::FSUSP::mask, 0);
        assert_eq!(ep0_status(&hw), (Status::Nak, Status::Valid));
        assert_eq!(hw.epr(0).read() & EPR::EA::mask, 0);
        assert_eq!(RESETS.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn only_seen_flags_are_cleared() {
        let hw = Hardware::new();
        let mut device = reset_device(&hw, Config::default());
        hw.usb.ISTR.set((Interrupts::SOF | Interrupts::ESOF).bits());
        let poll = device.on_interrupt();
        assert_eq!(poll.interrupts, Interrupts::SOF | Interrupts::ESOF);
        assert_eq!(hw.usb.ISTR.read(), 0);
        assert_eq!(device.status(), DeviceStatus::Default);
    }

    #[test]
    fn device_descriptor_in_packets() {
        let hw = Hardware::new();
        let mut device = reset_device(
            &hw,
            Config {
                control: BufferLayout {
                    tx_size: 8,
                    ..CONTROL_LAYOUT
                },
                ..Config::default()
            },
        );

        setup(&hw, 0x80, Request::GET_DESCRIPTOR, 0x0100, 18);
        device.on_interrupt();
        let (data, len) = sent(&hw, 0);
        assert_eq!(&data[..len], &DEVICE[..8]);
        assert_eq!(device.control().and_then(Control::pending_offset), Some(8));
        assert_eq!(device.control_stage(), Stage::In);
        assert_eq!(ep0_status(&hw), (Status::Valid, Status::Valid));

        in_complete(&hw, 0);
        device.on_interrupt();
        let (data, len) = sent(&hw, 0);
        assert_eq!(&data[..len], &DEVICE[8..16]);
        assert_eq!(device.control().and_then(Control::pending_offset), Some(16));

        in_complete(&hw, 0);
        device.on_interrupt();
        let (data, len) = sent(&hw, 0);
        assert_eq!(&data[..len], &DEVICE[16..]);
        assert_eq!(device.control().and_then(Control::pending_offset), None);
        assert_eq!(device.descriptors().device.inits, 1);
        assert_eq!(device.descriptors().device.deinits, 1);

        in_complete(&hw, 0);
        device.on_interrupt();
        out(&hw, 0, &[], false);
        device.on_interrupt();
        assert_eq!(device.descriptors().device.deinits, 1);
        assert_eq!(device.control_stage(), Stage::None);
        assert_eq!(device.status(), DeviceStatus::Default);
    }

    #[test]
    fn set_address_after_status_out() {
        let hw = Hardware::new();
        let mut device = reset_device(&hw, Config::default());

        setup(&hw, 0x00, Request::SET_ADDRESS, 5, 0);
        device.on_interrupt();
        assert_eq!(sent(&hw, 0).1, 0);
        assert_eq!(ep0_status(&hw).0, Status::Valid);
        assert_eq!(device.status(), DeviceStatus::Default);
        assert_eq!(hw.usb.DADDR.read(), 0x80);

        out(&hw, 0, &[], false);
        device.on_interrupt();
        assert_eq!(hw.usb.DADDR.read(), 0x85);
        assert_eq!(device.address(), 5);
        assert_eq!(device.status(), DeviceStatus::Addressed);
    }

    #[test]
    fn set_address_after_status_in() {
        let hw = Hardware::new();
        let mut device = reset_device(&hw, Config::default());

        setup(&hw, 0x00, Request::SET_ADDRESS, 0x2A, 0);
        device.on_interrupt();
        assert_eq!(hw.usb.DADDR.read(), 0x80);

        in_complete(&hw, 0);
        device.on_interrupt();
        assert_eq!(hw.usb.DADDR.read(), 0x80 | 0x2A);
        assert_eq!(device.status(), DeviceStatus::Addressed);
    }

    #[test]
    fn reset_aborts_descriptor_transfer() {
        let hw = Hardware::new();
        let mut device = reset_device(
            &hw,
            Config {
                control: BufferLayout {
                    tx_size: 8,
                    ..CONTROL_LAYOUT
                },
                ..Config::default()
            },
        );

        setup(&hw, 0x80, Request::GET_DESCRIPTOR, 0x0100, 18);
        device.on_interrupt();
        assert_eq!(device.control().and_then(Control::pending_offset), Some(8));

        hw.usb.ISTR.set(Interrupts::RESET.bits());
        device.on_interrupt();
        assert_eq!(device.control().and_then(Control::pending_offset), None);
        assert_eq!(device.descriptors().device.deinits, 1);
        assert_eq!(ep0_status(&hw), (Status::Nak, Status::Valid));

        setup(&hw, 0x80, Request::GET_STATUS, 0, 2);
        device.on_interrupt();
        let (data, len) = sent(&hw, 0);
        assert_eq!(&data[..len], &[0, 0]);
    }

    static SUSPENDS: AtomicU32 = AtomicU32::new(0);
    static RESUMES: AtomicU32 = AtomicU32::new(0);

    #[test]
    fn suspend_and_wakeup() {
        let hw = Hardware::new();
        let mut device = reset_device(
            &hw,
            Config {
                callbacks: Callbacks {
                    suspend: Some(|| {
                        SUSPENDS.fetch_add(1, Ordering::Relaxed);
                    }),
                    resume: Some(|| {
                        RESUMES.fetch_add(1, Ordering::Relaxed);
                    }),
                    ..Callbacks::default()
                },
                ..Config::default()
            },
        );
        setup(&hw, 0x00, Request::SET_ADDRESS, 3, 0);
        device.on_interrupt();
        in_complete(&hw, 0);
        device.on_interrupt();
        assert_eq!(device.status(), DeviceStatus::Addressed);

        hw.usb.ISTR.set(Interrupts::SUSP.bits());
        device.on_interrupt();
        assert_eq!(device.status(), DeviceStatus::Suspended);
        assert_ne!(hw.usb.CNTR.read() & CNTR::FSUSP::mask, 0);

        // A second suspend keeps the state to restore
        hw.usb.ISTR.set(Interrupts::SUSP.bits());
        device.on_interrupt();
        assert_eq!(SUSPENDS.load(Ordering::Relaxed), 2);

        hw.usb.ISTR.set(Interrupts::WKUP.bits());
        device.on_interrupt();
        assert_eq!(device.status(), DeviceStatus::Addressed);
        assert_eq!(hw.usb.CNTR.read() & CNTR::FSUSP::mask, 0);
        assert_eq!(RESUMES.load(Ordering::Relaxed), 1);

        // Not suspended; nothing to resume
        hw.usb.ISTR.set(Interrupts::WKUP.bits());
        device.on_interrupt();
        assert_eq!(RESUMES.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn endpoint_binding() {
        let hw = Hardware::new();
        let mut device = device(&hw, Config::default());

        assert_eq!(device.set_endpoint(0, Some(EP1)), Err(UsbError::InvalidEndpoint));
        assert_eq!(device.set_endpoint(8, Some(EP1)), Err(UsbError::InvalidEndpoint));
        let overlapping = EndpointConfig {
            layout: BufferLayout {
                tx_addr: 100,
                ..EP1.layout
            },
            ..EP1
        };
        assert_eq!(
            device.set_endpoint(1, Some(overlapping)),
            Err(UsbError::EndpointMemoryOverflow)
        );
        assert_eq!(device.set_endpoint(1, Some(EP1)), Ok(()));
        // Rebinding the same number replaces its buffers
        assert_eq!(device.set_endpoint(1, Some(EP1)), Ok(()));
        assert_eq!(
            device.set_endpoint(2, Some(EP1)),
            Err(UsbError::EndpointMemoryOverflow)
        );
        assert_eq!(device.transmit(1, &[1]), Err(UsbError::InvalidState));
        assert_eq!(device.transmit(2, &[1]), Err(UsbError::InvalidState));

        device.init();
        assert_eq!(device.transmit(2, &[1]), Err(UsbError::InvalidEndpoint));
        assert_eq!(device.transmit(0, &[1]), Err(UsbError::InvalidEndpoint));
        assert_eq!(device.endpoint(1).map(Endpoint::kind), Some(EndpointType::Bulk));

        assert_eq!(device.set_endpoint(1, None), Ok(()));
        assert!(device.endpoint(1).is_none());
    }

    #[test]
    fn transfer_on_unbound_endpoint_is_acknowledged() {
        let hw = Hardware::new();
        let mut device = device(&hw, Config::default());
        device.set_endpoint(1, Some(EP1)).unwrap();
        device.init();
        device.connect();
        hw.usb.ISTR.set(Interrupts::RESET.bits());
        device.on_interrupt();

        // Transfers latched before the endpoint went away
        hw.epr(1).hw_receive(false);
        hw.epr(1).hw_transmit();
        assert_eq!(device.set_endpoint(1, None), Ok(()));
        hw.usb
            .ISTR
            .set(Interrupts::CTR.bits() | ISTR::DIR::mask | 1);

        let poll = device.on_interrupt();
        assert_eq!(poll.ep_out, 0);
        assert_eq!(poll.ep_in_complete, 0);

        let epr = hw.epr(1).read();
        assert_eq!(epr & (EPR::CTR_RX::mask | EPR::CTR_TX::mask), 0);
        assert_eq!(epr & EPR::EA::mask, 1);
        // Status fields are left as the unbind set them
        assert_eq!(
            Status::from_bits(epr >> EPR::STAT_RX::offset),
            Status::Disabled
        );
    }

    #[test]
    fn deconfigure_only_leaves_configured() {
        let hw = Hardware::new();
        let mut device = reset_device(&hw, Config::default());

        setup(&hw, 0x00, Request::SET_CONFIGURATION, 0, 0);
        device.on_interrupt();
        assert_eq!(device.status(), DeviceStatus::Default);
        assert_eq!(device.configuration(), 0);

        setup(&hw, 0x00, Request::SET_ADDRESS, 3, 0);
        device.on_interrupt();
        in_complete(&hw, 0);
        device.on_interrupt();
        assert_eq!(device.status(), DeviceStatus::Addressed);

        setup(&hw, 0x00, Request::SET_CONFIGURATION, 0, 0);
        device.on_interrupt();
        assert_eq!(device.status(), DeviceStatus::Addressed);

        setup(&hw, 0x00, Request::SET_CONFIGURATION, 1, 0);
        device.on_interrupt();
        assert_eq!(device.status(), DeviceStatus::Configured);

        setup(&hw, 0x00, Request::SET_CONFIGURATION, 0, 0);
        device.on_interrupt();
        assert_eq!(device.status(), DeviceStatus::Addressed);
        assert_eq!(device.configuration(), 0);
    }

    #[test]
    fn configured_data_transfer() {
        let hw = Hardware::new();
        let mut device = device(&hw, Config::default());
        device.set_endpoint(1, Some(EP1)).unwrap();
        device.init();
        device.connect();
        hw.usb.ISTR.set(Interrupts::RESET.bits());
        device.on_interrupt();

        let epr = hw.epr(1).read();
        assert_eq!(epr & EPR::EA::mask, 1);
        assert_eq!(device.tx_status(1), Ok(Status::Nak));
        assert_eq!(device.rx_status(1), Ok(Status::Nak));

        setup(&hw, 0x00, Request::SET_CONFIGURATION, 1, 0);
        device.on_interrupt();
        assert!(device.is_ready());
        assert_eq!(device.configuration(), 1);
        assert_eq!(device.rx_status(1), Ok(Status::Valid));

        setup(&hw, 0x80, Request::GET_CONFIGURATION, 0, 1);
        device.on_interrupt();
        let (data, len) = sent(&hw, 0);
        assert_eq!(&data[..len], &[1]);

        out(&hw, 1, &[9, 8, 7], false);
        let poll = device.on_interrupt();
        assert_eq!(poll.ep_out, 1 << 1);
        assert_eq!(poll.ep_in_complete, 0);
        assert_eq!(device.received_len(1), Ok(3));
        let mut buffer = [0; 8];
        assert_eq!(device.receive(1, &mut buffer), Ok(3));
        assert_eq!(&buffer[..3], &[9, 8, 7]);
        assert_eq!(device.rx_status(1), Ok(Status::Valid));

        assert_eq!(device.transmit(1, &[0xAA; 80]), Ok(64));
        assert_eq!(device.tx_status(1), Ok(Status::Valid));
        in_complete(&hw, 1);
        let poll = device.on_interrupt();
        assert_eq!(poll.ep_in_complete, 1 << 1);
        assert_eq!(device.tx_status(1), Ok(Status::Nak));

        setup(&hw, 0x00, Request::SET_CONFIGURATION, 0, 0);
        device.on_interrupt();
        assert_eq!(device.status(), DeviceStatus::Addressed);
        assert!(!device.is_ready());
    }

    #[test]
    fn device_get_status_is_configurable() {
        let hw = Hardware::new();
        let mut device = reset_device(
            &hw,
            Config {
                device_status: 0b01,
                ..Config::default()
            },
        );
        setup(&hw, 0x80, Request::GET_STATUS, 0, 2);
        device.on_interrupt();
        let (data, len) = sent(&hw, 0);
        assert_eq!(&data[..len], &[1, 0]);
    }
}
