//! Emulator configuration.
//!
//! These settings used to live in two FPGA status registers that the firmware
//! polled before every command. The host now hands them to the bridge once,
//! usually deserialised from the core's JSON settings file.

use crate::error::{Result, SioError};
use serde::{Deserialize, Serialize};

/// Number of entries in the high-speed divisor table.
pub const SPEED_COUNT: usize = 8;

/// Emulated physical drive mechanism.
///
/// The two models differ in step/settle timing, retry count, and how they
/// report a "data lost" FDC condition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriveModel {
    #[default]
    Atari810,
    Atari1050,
}

impl DriveModel {
    #[must_use]
    pub const fn is_1050(self) -> bool {
        matches!(self, Self::Atari1050)
    }
}

/// How the PBI BIOS should treat one of the D1..D4 drives.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PbiMode {
    /// Not handled by the PBI BIOS; the guest falls back to its own SIO code.
    #[default]
    Off,
    /// Served directly through the PBI request block.
    Pbi,
    /// Handed back to the BIOS high-speed SIO routine.
    Sio,
}

impl PbiMode {
    /// Two-bit encoding used in the PBI handshake block.
    #[must_use]
    pub const fn bits(self) -> u8 {
        match self {
            Self::Off => 0,
            Self::Pbi => 1,
            Self::Sio => 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    pub drive_model: DriveModel,
    /// Index into the high-speed divisor table offered on a speed request.
    pub speed_index: u8,
    /// Mount every image read-only regardless of file permissions.
    pub force_read_only: bool,
    /// Enable the PBI side channel.
    pub pbi_enabled: bool,
    pub pbi_drive_modes: [PbiMode; 4],
    /// Boot drive reported to the PBI BIOS (0 = none, 1 = fixed disk).
    pub boot_drive: u8,
    pub splash: bool,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            drive_model: DriveModel::Atari810,
            speed_index: 0,
            force_read_only: false,
            pbi_enabled: false,
            pbi_drive_modes: [PbiMode::Off; 4],
            boot_drive: 0,
            splash: false,
        }
    }
}

impl EmulatorConfig {
    /// Parses and validates a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if usize::from(self.speed_index) >= SPEED_COUNT {
            return Err(SioError::InvalidConfig(format!(
                "speed_index {} out of range 0..{}",
                self.speed_index, SPEED_COUNT
            )));
        }
        if self.boot_drive > 7 {
            return Err(SioError::InvalidConfig(format!(
                "boot_drive {} out of range 0..=7",
                self.boot_drive
            )));
        }
        Ok(())
    }
}
