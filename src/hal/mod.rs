//! Hardware adaptors: GPIO, I2C, SPI
//!
//! The kernel gates access to these buses with per-task capabilities and
//! otherwise passes operations straight through. Each bus is one trait;
//! a board port implements them over the real peripherals, while the
//! host uses the recording simulators below.
//!
//! Capability checks live in the kernel, not here.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Digital pin configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMode {
    Input,
    Output,
    InputPullup,
}

impl PinMode {
    /// Decode the wire encoding used by the syscall surface.
    pub fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            0 => Some(PinMode::Input),
            1 => Some(PinMode::Output),
            2 => Some(PinMode::InputPullup),
            _ => None,
        }
    }
}

/// Bus-level failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalError {
    /// Addressed device did not acknowledge
    Nack,
    /// Transfer failed on the wire
    Bus,
}

impl std::fmt::Display for HalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HalError::Nack => write!(f, "device did not acknowledge"),
            HalError::Bus => write!(f, "bus transfer failed"),
        }
    }
}

/// Digital and analog pin access.
pub trait GpioPort {
    fn set_mode(&mut self, pin: u8, mode: PinMode);
    fn write(&mut self, pin: u8, high: bool);
    fn read(&mut self, pin: u8) -> bool;
    fn analog_read(&mut self, pin: u8) -> u16;
    fn analog_write(&mut self, pin: u8, value: u8);
}

/// I2C controller access.
pub trait I2cBus {
    /// Join the bus; address 0 joins as the controller.
    fn begin(&mut self, address: u8);
    /// Write `data` to `address`, returning the bytes accepted.
    fn write(&mut self, address: u8, data: &[u8]) -> Result<usize, HalError>;
    /// Read into `buf` from `address`, returning the bytes received.
    fn read(&mut self, address: u8, buf: &mut [u8]) -> Result<usize, HalError>;
    /// Ask `address` for up to `quantity` bytes; returns how many are
    /// waiting.
    fn request(&mut self, address: u8, quantity: usize) -> Result<usize, HalError>;
}

/// SPI controller access. Transfers are full duplex a byte at a time.
pub trait SpiBus {
    fn begin(&mut self);
    fn transfer_byte(&mut self, tx: u8) -> u8;
    fn end(&mut self);
}

#[derive(Debug, Clone, Copy, Default)]
struct PinState {
    mode: Option<PinMode>,
    level: bool,
    analog_out: u8,
    analog_in: u16,
}

/// Recording GPIO simulator. Cloning yields a handle onto the same pin
/// state, so a test can keep one clone and give the kernel the other.
#[derive(Clone, Default)]
pub struct SimGpio {
    pins: Rc<RefCell<HashMap<u8, PinState>>>,
}

impl SimGpio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last digital level written to `pin`.
    pub fn level(&self, pin: u8) -> bool {
        self.pins.borrow().get(&pin).map_or(false, |p| p.level)
    }

    /// Last configured mode of `pin`.
    pub fn mode(&self, pin: u8) -> Option<PinMode> {
        self.pins.borrow().get(&pin).and_then(|p| p.mode)
    }

    /// Last PWM duty written to `pin`.
    pub fn analog_out(&self, pin: u8) -> u8 {
        self.pins.borrow().get(&pin).map_or(0, |p| p.analog_out)
    }

    /// Preset the value an `analog_read` of `pin` will see.
    pub fn set_analog_input(&self, pin: u8, value: u16) {
        self.pins.borrow_mut().entry(pin).or_default().analog_in = value;
    }

    /// Preset the level a digital `read` of `pin` will see.
    pub fn set_input_level(&self, pin: u8, high: bool) {
        self.pins.borrow_mut().entry(pin).or_default().level = high;
    }
}

impl GpioPort for SimGpio {
    fn set_mode(&mut self, pin: u8, mode: PinMode) {
        self.pins.borrow_mut().entry(pin).or_default().mode = Some(mode);
    }

    fn write(&mut self, pin: u8, high: bool) {
        self.pins.borrow_mut().entry(pin).or_default().level = high;
    }

    fn read(&mut self, pin: u8) -> bool {
        self.level(pin)
    }

    fn analog_read(&mut self, pin: u8) -> u16 {
        self.pins.borrow().get(&pin).map_or(0, |p| p.analog_in)
    }

    fn analog_write(&mut self, pin: u8, value: u8) {
        self.pins.borrow_mut().entry(pin).or_default().analog_out = value;
    }
}

#[derive(Default)]
struct SimI2cState {
    joined: bool,
    /// Bytes written to each attached device.
    written: HashMap<u8, Vec<u8>>,
    /// Bytes each attached device will answer with.
    responses: HashMap<u8, Vec<u8>>,
}

/// Recording I2C simulator. Devices must be attached before they
/// acknowledge.
#[derive(Clone, Default)]
pub struct SimI2c {
    state: Rc<RefCell<SimI2cState>>,
}

impl SimI2c {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a device on the bus with a canned response.
    pub fn attach(&self, address: u8, response: &[u8]) {
        let mut state = self.state.borrow_mut();
        state.written.insert(address, Vec::new());
        state.responses.insert(address, response.to_vec());
    }

    /// Everything written to `address` so far.
    pub fn written_to(&self, address: u8) -> Vec<u8> {
        self.state
            .borrow()
            .written
            .get(&address)
            .cloned()
            .unwrap_or_default()
    }

    pub fn joined(&self) -> bool {
        self.state.borrow().joined
    }
}

impl I2cBus for SimI2c {
    fn begin(&mut self, _address: u8) {
        self.state.borrow_mut().joined = true;
    }

    fn write(&mut self, address: u8, data: &[u8]) -> Result<usize, HalError> {
        let mut state = self.state.borrow_mut();
        match state.written.get_mut(&address) {
            Some(sink) => {
                sink.extend_from_slice(data);
                Ok(data.len())
            }
            None => Err(HalError::Nack),
        }
    }

    fn read(&mut self, address: u8, buf: &mut [u8]) -> Result<usize, HalError> {
        let mut state = self.state.borrow_mut();
        match state.responses.get_mut(&address) {
            Some(pending) => {
                let n = buf.len().min(pending.len());
                buf[..n].copy_from_slice(&pending[..n]);
                pending.drain(..n);
                Ok(n)
            }
            None => Err(HalError::Nack),
        }
    }

    fn request(&mut self, address: u8, quantity: usize) -> Result<usize, HalError> {
        let state = self.state.borrow();
        match state.responses.get(&address) {
            Some(pending) => Ok(quantity.min(pending.len())),
            None => Err(HalError::Nack),
        }
    }
}

#[derive(Default)]
struct SimSpiState {
    begun: bool,
    traffic: Vec<u8>,
}

/// Loopback SPI simulator: every transmitted byte echoes straight back,
/// as if MOSI were jumpered to MISO. Transmitted bytes are recorded.
#[derive(Clone, Default)]
pub struct SimSpi {
    state: Rc<RefCell<SimSpiState>>,
}

impl SimSpi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begun(&self) -> bool {
        self.state.borrow().begun
    }

    /// Every byte shifted out so far.
    pub fn traffic(&self) -> Vec<u8> {
        self.state.borrow().traffic.clone()
    }
}

impl SpiBus for SimSpi {
    fn begin(&mut self) {
        self.state.borrow_mut().begun = true;
    }

    fn transfer_byte(&mut self, tx: u8) -> u8 {
        self.state.borrow_mut().traffic.push(tx);
        tx
    }

    fn end(&mut self) {
        self.state.borrow_mut().begun = false;
    }
}
