//! SIO byte channel between the firmware and the FPGA core's serial port.
//!
//! The FPGA exposes the Atari side of the SIO bus as a tiny UART behind a set
//! of registers: a transmit register with a FIFO-full flag, a receive register
//! that returns a 16-bit word (tag byte in the high half, data in the low), an
//! error latch, and a divisor register that sets the POKEY-compatible bit rate.
//!
//! [`Transport`] is the contract the framing layer uses. Two implementations:
//!
//! - [`RegisterTransport`]: drives a [`RegisterBus`] (the SPI register link)
//! - [`FifoTransport`]: in-memory queues, used by the host simulator and tests
//!
//! ## Divisor encoding
//!
//! | Operation     | Register write            |
//! |---------------|---------------------------|
//! | set divisor d | `SioSetDiv <- (d << 1) + 1` |
//! | switch rate   | `SioSetDiv <- SioGetDiv - 1` |
//!
//! A divisor change applies to every following byte, so callers only issue it
//! once a reply has been fully sent.

use std::collections::VecDeque;
use tracing::trace;

/// Divisor the bus starts at (standard 19200 baud, POKEY divisor 0x28 + 6).
pub const DEFAULT_DIVISOR: u8 = 0x28 + 6;

/// Status bit in the TX status word: transmit FIFO full.
const TX_FULL: u16 = 0x0200;
/// Status bit in the RX status word: receive FIFO empty.
const RX_EMPTY: u16 = 0x0100;

pub trait Transport {
    /// Sends one byte, blocking while the transmit FIFO is full.
    fn send(&mut self, byte: u8);

    /// Returns true if a received word is waiting.
    fn available(&mut self) -> bool;

    /// Blocks until a word is received. High byte is the frame tag.
    fn receive(&mut self) -> u16;

    /// Returns true if the receiver latched a framing/overrun error.
    fn error(&mut self) -> bool;

    /// Programs a new bit-rate divisor.
    fn set_divisor(&mut self, divisor: u8);

    /// Switches the receiver to the rate negotiated for the current command.
    fn switch_rate(&mut self);

    /// Drive activity LED.
    fn set_led(&mut self, _on: bool) {}

    fn send_all(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.send(byte);
        }
    }
}

/// Registers written by the firmware.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetReg {
    SioTx,
    SioSetDiv,
    DriveLed,
}

/// Registers read by the firmware.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GetReg {
    SioTxStat,
    SioRxStat,
    SioRx,
    SioGetDiv,
    SioError,
}

/// Raw register access over the SPI link to the FPGA.
pub trait RegisterBus {
    fn set_reg(&mut self, reg: SetReg, value: u8);
    fn get_reg(&mut self, reg: GetReg) -> u16;
}

/// [`Transport`] on top of the FPGA's SIO registers.
pub struct RegisterTransport<B: RegisterBus> {
    bus: B,
}

impl<B: RegisterBus> RegisterTransport<B> {
    pub const fn new(bus: B) -> Self {
        Self { bus }
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn into_inner(self) -> B {
        self.bus
    }

    fn tx_full(&mut self) -> bool {
        self.bus.get_reg(GetReg::SioTxStat) & TX_FULL != 0
    }
}

impl<B: RegisterBus> Transport for RegisterTransport<B> {
    fn send(&mut self, byte: u8) {
        while self.tx_full() {
            std::hint::spin_loop();
        }
        self.bus.set_reg(SetReg::SioTx, byte);
    }

    fn available(&mut self) -> bool {
        self.bus.get_reg(GetReg::SioRxStat) & RX_EMPTY == 0
    }

    fn receive(&mut self) -> u16 {
        while !self.available() {
            std::hint::spin_loop();
        }
        self.bus.get_reg(GetReg::SioRx)
    }

    fn error(&mut self) -> bool {
        self.bus.get_reg(GetReg::SioError) != 0
    }

    fn set_divisor(&mut self, divisor: u8) {
        self.bus
            .set_reg(SetReg::SioSetDiv, (divisor << 1).wrapping_add(1));
    }

    fn switch_rate(&mut self) {
        let current = self.bus.get_reg(GetReg::SioGetDiv) as u8;
        self.bus.set_reg(SetReg::SioSetDiv, current.wrapping_sub(1));
    }

    fn set_led(&mut self, on: bool) {
        self.bus.set_reg(SetReg::DriveLed, u8::from(on));
    }
}

/// In-memory SIO line.
///
/// The guest side pushes tagged words into the receive queue and drains what
/// the drive sent from the transmit queue. Receiving from an empty queue
/// returns an error word (tag 0xFF) and latches the error flag instead of
/// blocking forever, so a short test script cannot hang the framing layer.
#[derive(Clone, Debug)]
pub struct FifoTransport {
    rx_fifo: VecDeque<u16>,
    tx_fifo: VecDeque<u8>,
    error_latched: bool,
    divisor: u8,
    /// Every divisor programmed, in order.
    divisor_log: Vec<u8>,
    rate_switches: usize,
    led_on: bool,
}

impl Default for FifoTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl FifoTransport {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rx_fifo: VecDeque::new(),
            tx_fifo: VecDeque::new(),
            error_latched: false,
            divisor: DEFAULT_DIVISOR,
            divisor_log: Vec::new(),
            rate_switches: 0,
            led_on: false,
        }
    }

    /// Queues a raw received word.
    pub fn push_rx(&mut self, word: u16) {
        self.rx_fifo.push_back(word);
    }

    /// Queues a 5-byte command frame with the correct tags, followed by the
    /// word the FPGA emits when the command line is released.
    pub fn push_frame(&mut self, frame: [u8; 5]) {
        for (i, byte) in frame.iter().enumerate() {
            self.push_rx((((i + 1) as u16) << 8) | u16::from(*byte));
        }
        self.push_rx(0);
    }

    /// Queues untagged data bytes (the data phase of a write).
    pub fn push_data(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.push_rx(u16::from(byte));
        }
    }

    /// Drains everything the drive has sent so far.
    pub fn take_tx(&mut self) -> Vec<u8> {
        self.tx_fifo.drain(..).collect()
    }

    #[must_use]
    pub fn has_tx_data(&self) -> bool {
        !self.tx_fifo.is_empty()
    }

    #[must_use]
    pub const fn divisor(&self) -> u8 {
        self.divisor
    }

    #[must_use]
    pub fn divisor_log(&self) -> &[u8] {
        &self.divisor_log
    }

    #[must_use]
    pub const fn rate_switches(&self) -> usize {
        self.rate_switches
    }

    #[must_use]
    pub const fn led_state(&self) -> bool {
        self.led_on
    }

    pub fn set_error(&mut self, error: bool) {
        self.error_latched = error;
    }
}

impl Transport for FifoTransport {
    fn send(&mut self, byte: u8) {
        trace!("sio tx {byte:#04x}");
        self.tx_fifo.push_back(byte);
    }

    fn available(&mut self) -> bool {
        !self.rx_fifo.is_empty()
    }

    fn receive(&mut self) -> u16 {
        match self.rx_fifo.pop_front() {
            Some(word) => word,
            None => {
                self.error_latched = true;
                0xFF00
            }
        }
    }

    /// Reading the latch clears it, like the FPGA error register.
    fn error(&mut self) -> bool {
        std::mem::take(&mut self.error_latched)
    }

    fn set_divisor(&mut self, divisor: u8) {
        self.divisor = divisor;
        self.divisor_log.push(divisor);
    }

    fn switch_rate(&mut self) {
        self.rate_switches += 1;
    }

    fn set_led(&mut self, on: bool) {
        self.led_on = on;
    }
}
