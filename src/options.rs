use std::fmt::Display;

use serde::{Deserialize, Serialize};
use serialport::{DataBits, Parity, StopBits};

use crate::error::Error;

/// Baud rates the sensor line is allowed to run at.
pub const SUPPORTED_BAUD_RATES: &[u32] = &[
    1200, 2400, 4800, 9600, 19200, 38400, 57600, 115_200, 230_400, 921_600,
];

/// Port options as persisted by the configuration store.
///
/// These are raw values and may be nonsense; [`PortOptions::normalize`]
/// validates them. Two sets of options describe the same line iff all four
/// fields match after normalization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortOptions {
    /// Line speed.
    pub baud_rate: u32,

    /// Data bits per character. Supported: 7 or 8.
    pub data_bits: u8,

    /// Stop bits. Supported: 1 or 2.
    pub stop_bits: u8,

    /// Parity: "none", "even" or "odd" (case-insensitive).
    pub parity: String,
}

impl PortOptions {
    /// Validate the raw values against the supported ranges.
    ///
    /// Anything outside those ranges fails with a descriptive error; no
    /// value is ever silently substituted with a default.
    pub fn normalize(&self) -> Result<NormalizedPortOptions, Error> {
        if !SUPPORTED_BAUD_RATES.contains(&self.baud_rate) {
            return Err(Error::Validation(format!(
                "unsupported baud rate {}, expected one of {SUPPORTED_BAUD_RATES:?}",
                self.baud_rate
            )));
        }

        let data_bits = match self.data_bits {
            7 => DataBits::Seven,
            8 => DataBits::Eight,
            other => {
                return Err(Error::Validation(format!(
                    "unsupported data bits {other}, expected 7 or 8"
                )))
            }
        };

        let stop_bits = match self.stop_bits {
            1 => StopBits::One,
            2 => StopBits::Two,
            other => {
                return Err(Error::Validation(format!(
                    "unsupported stop bits {other}, expected 1 or 2"
                )))
            }
        };

        let parity = match self.parity.to_lowercase().as_str() {
            "none" => Parity::None,
            "even" => Parity::Even,
            "odd" => Parity::Odd,
            other => {
                return Err(Error::Validation(format!(
                    "unsupported parity `{other}`, expected none, even or odd"
                )))
            }
        };

        Ok(NormalizedPortOptions {
            baud_rate: self.baud_rate,
            data_bits,
            stop_bits,
            parity,
        })
    }
}

impl Display for PortOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}{}{}",
            self.baud_rate,
            self.data_bits,
            &self.parity.chars().next().unwrap_or('?').to_uppercase(),
            self.stop_bits
        )
    }
}

/// Validated port options.
///
/// This is the form the factory opens ports with and the form snapshots
/// carry, so equality here is what decides whether a reload is a no-op.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct NormalizedPortOptions {
    /// Line speed.
    pub baud_rate: u32,

    /// Data bits per character.
    pub data_bits: DataBits,

    /// Stop bits.
    pub stop_bits: StopBits,

    /// Parity checking mode.
    pub parity: Parity,
}

impl Display for NormalizedPortOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parity = match self.parity {
            Parity::None => 'N',
            Parity::Even => 'E',
            Parity::Odd => 'O',
        };

        let data_bits = match self.data_bits {
            DataBits::Five => 5,
            DataBits::Six => 6,
            DataBits::Seven => 7,
            DataBits::Eight => 8,
        };

        let stop_bits = match self.stop_bits {
            StopBits::One => 1,
            StopBits::Two => 2,
        };

        write!(f, "{} {data_bits}{parity}{stop_bits}", self.baud_rate)
    }
}
