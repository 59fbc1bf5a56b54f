//! Parameter checks and the cached radio configuration.
//!
//! Every limit here is enforced before anything touches the USB bus, so a
//! bad argument can never leave the device in a half-configured state.

use crate::error::Error;

/// Baseband filter bandwidths supported by the MAX2837, in Hz.
pub(crate) const MAX2837_FT: [u32; 16] = [
    1_750_000, 2_500_000, 3_500_000, 5_000_000, 5_500_000, 6_000_000, 7_000_000, 8_000_000,
    9_000_000, 10_000_000, 12_000_000, 14_000_000, 15_000_000, 20_000_000, 24_000_000, 28_000_000,
];

/// Pick the widest baseband filter that does not exceed `freq`.
///
/// Falls back to the narrowest filter for very low values; anything above
/// the table gets the widest.
pub(crate) fn baseband_filter_bw(freq: u32) -> u32 {
    MAX2837_FT
        .iter()
        .rev()
        .find(|f| freq >= **f)
        .copied()
        .unwrap_or(MAX2837_FT[0])
}

fn check_gain(val: u32, max: u32, step: u32) -> Result<u32, Error> {
    if val > max {
        return Err(Error::ValueRange {
            range: 0..(max + 1),
            val,
        });
    }
    if val % step != 0 {
        return Err(Error::ValueStep { step, val });
    }
    Ok(val)
}

/// RX LNA (IF) gain: 0-40 dB in 8 dB steps.
pub(crate) fn check_lna_gain(val: u32) -> Result<u32, Error> {
    check_gain(val, 40, 8)
}

/// RX VGA (baseband) gain: 0-62 dB in 2 dB steps.
pub(crate) fn check_vga_gain(val: u32) -> Result<u32, Error> {
    check_gain(val, 62, 2)
}

/// TX VGA (IF) gain: 0-47 dB in 1 dB steps.
pub(crate) fn check_txvga_gain(val: u32) -> Result<u32, Error> {
    check_gain(val, 47, 1)
}

/// Configuration last applied through a [`HackRf`][crate::HackRf] session.
///
/// This mirrors only what the session itself has written. It starts out
/// zeroed and is updated as each setter succeeds; it does not read back
/// state from the device.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DeviceConfig {
    /// Center frequency in Hz.
    pub freq_hz: u64,
    /// Sample rate in Hz.
    pub sample_rate_hz: f64,
    /// Baseband filter bandwidth in Hz, chosen when the sample rate was set.
    pub baseband_filter_hz: u32,
    /// RX LNA gain in dB.
    pub lna_gain_db: u32,
    /// RX VGA gain in dB.
    pub vga_gain_db: u32,
    /// TX VGA gain in dB.
    pub txvga_gain_db: u32,
    /// RF amplifier state.
    pub amp_enable: bool,
    /// Antenna port power state.
    pub antenna_enable: bool,
}
