//! Get information about a HackRF board.
//!
//! This module contains the [`Info`] struct for accessing identity data from
//! the HackRF:
//!
//! - The MCU's [serial number][SerialNumber] with [Info::serial].
//! - The [board identifier][BoardId], with [Info::board_id].
//! - The firmware version string, with [Info::version_string].
//!
//! The general way to do this with a HackRF is:
//!
//! ```no_run
//! # use anyhow::Result;
//! # fn main() -> Result<()> {
//! use hackrf_ctrl::info::*;
//!
//! let hackrf = hackrf_ctrl::open_hackrf()?;
//! let info = hackrf.info();
//!
//! let serial: SerialNumber = info.serial()?;
//! let board_id: BoardId = info.board_id()?;
//! println!("{board_id}, firmware {}", info.version_string()?);
//! # Ok(())
//! # }
//! ```

use crate::{Error, HackRf, HackRfType, consts::ControlRequest};

/// The MCU serial number.
///
/// The Part ID identifies the exact LPC43xx part that was populated. See the
/// user manual for the exact decoding, but you're likely to find `0xa000cb3c`
/// for `part_id[0]`.
///
/// The "serial number" is referred to as the device unique ID in the user
/// manual for the LPC43x. It seems that only the last two 32-bit words are
/// nonzero, though this isn't guaranteed.
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Zeroable, bytemuck::Pod)]
pub struct SerialNumber {
    /// LPC43xx part identification words.
    pub part_id: [u32; 2],
    /// Device unique ID words.
    pub serial_no: [u32; 4],
}

impl SerialNumber {
    fn le_convert(&mut self) {
        for x in self.part_id.iter_mut() {
            *x = x.to_le();
        }
        for x in self.serial_no.iter_mut() {
            *x = x.to_le();
        }
    }
}

impl std::fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d] = self.serial_no;
        write!(f, "{a:08x}{b:08x}{c:08x}{d:08x}")
    }
}

/// The physical board's identifier. These differentiate between board hardware
/// that's actually different.
#[derive(Clone, Copy, Debug)]
#[allow(missing_docs)]
pub enum BoardId {
    Jellybean,
    Jawbreaker,
    HackRf1Og,
    Rad1o,
    HackRf1R9,
    Unknown(u8),
}

impl std::fmt::Display for BoardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Jellybean => f.write_str("Jellybean"),
            Self::Jawbreaker => f.write_str("Jawbreaker"),
            Self::HackRf1Og => f.write_str("HackRF One"),
            Self::Rad1o => f.write_str("rad1o"),
            Self::HackRf1R9 => f.write_str("HackRF One Rev9"),
            Self::Unknown(v) => write!(f, "Unknown (0x{:x})", v),
        }
    }
}

impl BoardId {
    fn from_u8(v: u8) -> Self {
        use BoardId::*;
        match v {
            0 => Jellybean,
            1 => Jawbreaker,
            2 => HackRf1Og,
            3 => Rad1o,
            4 => HackRf1R9,
            v => Unknown(v),
        }
    }
}

/// Info-gathering operations for the HackRF.
///
/// Borrows the session while doing operations.
pub struct Info<'a> {
    inner: &'a HackRf,
}

impl<'a> Info<'a> {
    pub(crate) fn new(inner: &'a HackRf) -> Info<'a> {
        Self { inner }
    }

    /// Get the device's implemented API version, as a binary-coded decimal
    /// (BCD) value.
    pub fn api_version(&self) -> u16 {
        self.inner.version
    }

    /// Get the [type][HackRfType] of HackRF radio.
    pub fn radio_type(&self) -> HackRfType {
        self.inner.ty
    }

    /// Get the [board hardware ID][BoardId].
    pub fn board_id(&self) -> Result<BoardId, Error> {
        let ret = self.inner.read_u8(ControlRequest::BoardIdRead, 0)?;
        Ok(BoardId::from_u8(ret))
    }

    /// Get the firmware version as a string.
    pub fn version_string(&self) -> Result<String, Error> {
        let resp = self.inner.read_bytes(ControlRequest::VersionStringRead, 255)?;
        String::from_utf8(resp).map_err(|_| Error::ReturnData)
    }

    /// Get the MCU's serial numbers.
    ///
    /// In the LP43xx documentation, this refers to the device unique ID and
    /// the part identification number.
    pub fn serial(&self) -> Result<SerialNumber, Error> {
        let mut v: SerialNumber = self
            .inner
            .read_struct(ControlRequest::BoardPartidSerialnoRead)?;
        v.le_convert();
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn board_id_decode() {
        assert_eq!(BoardId::from_u8(2).to_string(), "HackRF One");
        assert_eq!(BoardId::from_u8(4).to_string(), "HackRF One Rev9");
        assert_eq!(BoardId::from_u8(0x77).to_string(), "Unknown (0x77)");
    }

    #[test]
    fn serial_formats_as_hex() {
        let sn = SerialNumber {
            part_id: [0xa000cb3c, 0],
            serial_no: [0, 0, 0xa06063c8, 0x234e925f],
        };
        assert_eq!(sn.to_string(), "0000000000000000a06063c8234e925f");
    }
}
