//! Atari 8-bit disk drive emulation for the FPGA core's companion firmware.
//!
//! The FPGA exposes the Atari's SIO bus and PBI window as registers; this
//! crate answers them with up to fifteen floppy units and one fixed disk
//! backed by ATR, XDF, XEX and ATX images. [`SioBridge`] is the entry point.

// Links and protocol plumbing
pub mod clock;
pub mod memory;
pub mod transport;

// Disk images
pub mod apt;
pub mod atx;
pub mod drive;
mod xex;

// Command handling
pub mod bridge;
pub mod command;
pub mod dispatch;
pub mod pbi;
pub mod sio;

pub mod config;
pub mod error;

pub use bridge::{PollReport, SioBridge};
pub use clock::{Clock, SystemClock};
pub use config::{DriveModel, EmulatorConfig, PbiMode};
pub use drive::{DriveRegistry, ImageHint, UnitSnapshot, FIXED_UNIT};
pub use error::{Result, SioError};
pub use memory::GuestMemory;
pub use transport::{FifoTransport, RegisterBus, RegisterTransport, Transport};
