//! Frequency sweep configuration and block decoding.
//!
//! A sweep continually retunes the HackRF, grabbing a block of 8187 samples
//! (8192, but the first 5 are overwritten with an internal header) at each
//! tuning. The process is:
//!
//! 1. Get the lower frequency in a range.
//! 2. Tune to that frequency after adding the frequency offset, then grab the
//!    samples.
//! 3. If multiple blocks are requested, grab another (non-sequential) block
//!    of samples. Repeat until all requested blocks have been retrieved.
//! 4. Add the step (ignoring any offset). If using interleaved mode, the
//!    first sub-step is 1/4 of the step size, and the second sub-step is 3/4
//!    of the step size.
//! 5. If the new frequency is greater or equal to the upper frequency in the
//!    range, go to the next range and repeat from step 1. Otherwise go to
//!    step 2 with the frequency from step 4.
//!
//! Blocks are *not* consecutive samples; the HackRF briefly turns off
//! between tunings. It's really best to think of this as a tool for spectrum
//! sensing, not active demodulation.
//!
//! Start a sweep with [`HackRf::start_rx_sweep`][crate::HackRf::start_rx_sweep].
//! Each callback buffer carries whole [`SWEEP_BLOCK_LEN`]-byte tuning blocks
//! back to back; split it with `chunks_exact` and decode each chunk with
//! [`SweepBlock::parse`].

use crate::config::baseband_filter_bw;
use crate::consts::{FREQ_MAX_MHZ, MAX_SWEEP_RANGES, SWEEP_BLOCK_LEN};
use crate::{ComplexI8, Error};

/// Configuration settings for a receive sweep across multiple frequencies.
///
/// The easiest way to configure this is to call
/// [`SweepParams::for_sample_rate`], then to add the desired frequency pairs
/// to sweep over. There shouldn't be more than 10 pairs.
///
/// The recommended usage adds an offset to the center frequency, such that
/// the lower edge of the baseband filter aligns with the lower limit of the
/// sweep. The step width is then 4/3 of the baseband filter.
pub struct SweepParams {
    /// Sample rate to operate at.
    pub sample_rate_hz: u32,
    /// List of frequency pairs to sweep over, in MHz. There can be up to 10.
    pub freq_mhz: Vec<(u16, u16)>,
    /// Number of blocks to capture per tuning. Each block is 16384 bytes, or
    /// 8192 samples.
    pub blocks_per_tuning: u16,
    /// Width of each tuning step, in Hz. `sample_rate` is a good value, in
    /// general.
    pub step_width_hz: u32,
    /// Frequency offset added to tuned frequencies. `sample_rate * 3 / 8` is
    /// a good value for interleaved sweep mode.
    pub offset_hz: u32,
    /// Sweep mode.
    pub mode: SweepMode,
}

impl SweepParams {
    /// Initialize the sweep parameters with some sane defaults, given a
    /// sample rate.
    ///
    /// This configures [interleaved][SweepMode::Interleaved] mode, finds the
    /// baseband filter bandwidth the sample rate will use, sets the offset to
    /// half that bandwidth, and sets the step width to 4/3 of it.
    pub fn for_sample_rate(sample_rate_hz: u32) -> Self {
        let filter_bw = baseband_filter_bw(sample_rate_hz * 3 / 4);
        Self {
            sample_rate_hz,
            freq_mhz: Vec::new(),
            blocks_per_tuning: 1,
            step_width_hz: filter_bw * 4 / 3,
            offset_hz: filter_bw / 2,
            mode: SweepMode::Interleaved,
        }
    }

    /// Pack the parameters into the firmware's sweep setup format, returning
    /// the payload and the number of bytes per tuning.
    pub(crate) fn wire_format(&self) -> Result<(Vec<u8>, u32), Error> {
        if self.freq_mhz.is_empty()
            || self.freq_mhz.len() > MAX_SWEEP_RANGES
            || self.blocks_per_tuning < 1
            || self.step_width_hz < 1
        {
            return Err(Error::InvalidParameter("Invalid sweep parameters"));
        }

        let mut data = Vec::with_capacity(self.freq_mhz.len() * 4 + 9);
        data.extend_from_slice(&self.step_width_hz.to_le_bytes());
        // The firmware reads the offset big-endian, unlike everything else
        // in this payload.
        data.extend_from_slice(&self.offset_hz.to_be_bytes());
        data.push(match self.mode {
            SweepMode::Linear => 0,
            SweepMode::Interleaved => 1,
        });
        for (lo, hi) in self.freq_mhz.iter().copied() {
            if lo >= hi || lo > (FREQ_MAX_MHZ as u16) || hi > (FREQ_MAX_MHZ as u16) {
                return Err(Error::InvalidParameter("Invalid frequency range"));
            }
            // Force the upper end of each tuning range to align with the
            // step size, pushing it upwards if necessary.
            let span_hz = (hi as u64 - lo as u64) * 1_000_000;
            let steps = span_hz.div_ceil(self.step_width_hz as u64);
            let full_hi = lo as u64 + (steps * self.step_width_hz as u64).div_ceil(1_000_000);

            data.extend_from_slice(&lo.to_le_bytes());
            data.extend_from_slice(&(full_hi as u16).to_le_bytes());
        }

        let num_bytes = (self.blocks_per_tuning as u32) * (SWEEP_BLOCK_LEN as u32);
        Ok((data, num_bytes))
    }
}

/// A chosen sweep mode.
///
/// While linear mode is the easiest to understand, the interleaved mode can
/// make it easy to discard the portion of the spectrum with the DC mixing
/// spur.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SweepMode {
    /// `step_width` is added to the current frequency at each step.
    Linear,
    /// Each step is divided into two interleaved sub-steps, allowing the
    /// host to select the best portions of the FFT of each sub-step and
    /// discard the rest. The first step adds 1/4 of the step size, and the
    /// second step adds the remaining 3/4 of the step size. This makes it
    /// relatively easy to discard the center of the band, where mixer IQ
    /// imbalance can create a spike in the FFT.
    Interleaved,
}

/// A decoded block of samples for one tuning frequency within the sweep.
///
/// Borrows from the callback buffer it was parsed out of.
pub struct SweepBlock<'a> {
    freq_hz: u64,
    samples: &'a [ComplexI8],
}

impl<'a> SweepBlock<'a> {
    /// Decode one [`SWEEP_BLOCK_LEN`]-byte tuning block.
    ///
    /// Rejects blocks of the wrong size, blocks without the firmware's
    /// `0x7f 0x7f` marker, and blocks claiming a nonsense tuning frequency.
    pub fn parse(block: &'a [u8]) -> Result<Self, Error> {
        if block.len() != SWEEP_BLOCK_LEN {
            return Err(Error::ReturnData);
        }
        if block[0..2] != [0x7f, 0x7f] {
            return Err(Error::ReturnData);
        }
        let freq: [u8; 8] = block[2..10].try_into().map_err(|_| Error::ReturnData)?;
        let freq_hz = u64::from_le_bytes(freq);
        if !(100_000..=7_100_000_000).contains(&freq_hz) {
            return Err(Error::ReturnData);
        }
        let tail = &block[10..];
        // SAFETY: ComplexI8 is two i8 with an alignment of 1, and the tail
        // of a full block is an even number of bytes.
        let samples = unsafe {
            std::slice::from_raw_parts(
                tail.as_ptr() as *const ComplexI8,
                tail.len() / size_of::<ComplexI8>(),
            )
        };
        Ok(Self { freq_hz, samples })
    }

    /// The frequency tuned to, without the offset added in.
    pub fn freq_hz(&self) -> u64 {
        self.freq_hz
    }

    /// The retrieved samples in this tuning block.
    pub fn samples(&self) -> &'a [ComplexI8] {
        self.samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> SweepParams {
        SweepParams {
            sample_rate_hz: 20_000_000,
            freq_mhz: vec![(2400, 2480)],
            blocks_per_tuning: 2,
            step_width_hz: 1_000_000,
            offset_hz: 150_000,
            mode: SweepMode::Interleaved,
        }
    }

    #[test]
    fn wire_format_layout() {
        let (data, num_bytes) = params().wire_format().unwrap();
        assert_eq!(num_bytes, 2 * 16384);
        assert_eq!(data.len(), 9 + 4);
        assert_eq!(&data[0..4], &1_000_000u32.to_le_bytes());
        // Offset keeps its big-endian quirk.
        assert_eq!(&data[4..8], &[0x00, 0x02, 0x49, 0xf0]);
        assert_eq!(data[8], 1);
        assert_eq!(&data[9..11], &2400u16.to_le_bytes());
        assert_eq!(&data[11..13], &2480u16.to_le_bytes());
    }

    #[test]
    fn upper_edge_pushed_to_whole_steps() {
        let mut p = params();
        p.step_width_hz = 600_000;
        let (data, _) = p.wire_format().unwrap();
        // 80 MHz needs 134 steps of 600 kHz, which lands at 2480.4 MHz.
        assert_eq!(&data[11..13], &2481u16.to_le_bytes());
    }

    #[test]
    fn bad_params_rejected() {
        let mut p = params();
        p.freq_mhz.clear();
        assert!(matches!(
            p.wire_format(),
            Err(Error::InvalidParameter("Invalid sweep parameters"))
        ));

        let mut p = params();
        p.freq_mhz = vec![(100, 200); 11];
        assert!(p.wire_format().is_err());

        let mut p = params();
        p.freq_mhz = vec![(2480, 2400)];
        assert!(matches!(
            p.wire_format(),
            Err(Error::InvalidParameter("Invalid frequency range"))
        ));

        let mut p = params();
        p.freq_mhz = vec![(7000, 7300)];
        assert!(p.wire_format().is_err());
    }

    #[test]
    fn defaults_track_sample_rate() {
        let p = SweepParams::for_sample_rate(20_000_000);
        // 3/4 of 20 MHz lands exactly on the 15 MHz filter.
        assert_eq!(p.offset_hz, 7_500_000);
        assert_eq!(p.step_width_hz, 20_000_000);
        assert_eq!(p.mode, SweepMode::Interleaved);
        assert_eq!(p.blocks_per_tuning, 1);

        let p = SweepParams::for_sample_rate(10_000_000);
        // 7.5 MHz rounds down to the 7 MHz filter.
        assert_eq!(p.offset_hz, 3_500_000);
        assert_eq!(p.step_width_hz, 7_000_000 * 4 / 3);
    }

    fn sweep_block(freq_hz: u64) -> Vec<u8> {
        let mut block = vec![0u8; SWEEP_BLOCK_LEN];
        block[0] = 0x7f;
        block[1] = 0x7f;
        block[2..10].copy_from_slice(&freq_hz.to_le_bytes());
        block
    }

    #[test]
    fn parse_good_block() {
        let raw = sweep_block(2_400_000_000);
        let block = SweepBlock::parse(&raw).unwrap();
        assert_eq!(block.freq_hz(), 2_400_000_000);
        assert_eq!(block.samples().len(), 8187);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(SweepBlock::parse(&[0u8; 100]).is_err());

        let mut raw = sweep_block(2_400_000_000);
        raw[0] = 0;
        assert!(SweepBlock::parse(&raw).is_err());

        let raw = sweep_block(50_000);
        assert!(SweepBlock::parse(&raw).is_err());

        let raw = sweep_block(8_000_000_000);
        assert!(SweepBlock::parse(&raw).is_err());
    }
}
