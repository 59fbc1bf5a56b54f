/*!

This is a threaded controller crate for the [HackRF][hackrf], made using the
pure-rust [`nusb`] crate for USB interfacing. It covers the everyday surface
of the original [`libhackrf`][libhackrf] library: exclusive device sessions,
RF configuration, and callback-driven receive, transmit, and sweep streaming.

[hackrf]: https://greatscottgadgets.com/hackrf/one/
[libhackrf]: https://github.com/greatscottgadgets/hackrf/tree/master/host

The standard entry point for this library is [`open_hackrf()`], which will
open the first available HackRF device.

Getting started is easy: open up a HackRF peripheral, configure it as needed,
and enter transmit, receive, or RX sweep mode. Each streaming mode runs a
dedicated worker thread that hands buffers to your callback; the callback
returns a [`StreamControl`] telling the stream whether to carry on. Stopping
is done from the session side with [`HackRf::stop_rx`] / [`HackRf::stop_tx`],
which block until the worker has fully wound down.

As for what using this library looks like in practice, here's an example
program that configures the system, enters receive mode, and processes
samples to estimate the average received power relative to full scale:

```no_run
use hackrf_ctrl::StreamControl;

fn main() -> anyhow::Result<()> {
    let hackrf = hackrf_ctrl::open_hackrf()?;

    // Configure: 10 MHz sample rate, turn on the RF amp, set IF & BB gains
    // to 16 dB, and tune to 915 MHz.
    hackrf.set_sample_rate(10e6)?;
    hackrf.set_amp_enable(true)?;
    hackrf.set_lna_gain(16)?;
    hackrf.set_vga_gain(16)?;
    hackrf.set_freq(915_000_000)?;

    // Receive until 64 MiB of samples have gone by, measuring power.
    let (done_tx, done_rx) = std::sync::mpsc::channel();
    let mut seen = 0usize;
    let mut pow_sum = 0.0f64;
    hackrf.start_rx(move |block| {
        for x in hackrf_ctrl::samples(block) {
            let re = x.re as f64;
            let im = x.im as f64;
            pow_sum += re * re + im * im;
        }
        seen += block.len();
        if seen >= 64 << 20 {
            let _ = done_tx.send(pow_sum / (seen / 2) as f64);
            return StreamControl::Stop;
        }
        StreamControl::Continue
    })?;

    let mean_pow = done_rx.recv()?;
    hackrf.stop_rx()?;

    let average_power = (mean_pow / (127.0 * 127.0)).log10() * 10.;
    println!("Average Power = {average_power} dbFS");
    Ok(())
}
```

*/

#![warn(missing_docs)]

mod config;
mod consts;
mod error;
pub mod info;
mod rx;
mod stream;
mod sweep;
mod transport;
mod tx;

use core::mem::size_of;
use std::io;
use std::ops::Range;
use std::sync::Mutex;

use bytemuck::Pod;
use tracing::{debug, info, warn};

use crate::config::{baseband_filter_bw, check_lna_gain, check_txvga_gain, check_vga_gain};
use crate::consts::*;
use crate::info::Info;
use crate::stream::{Direction, StreamEnd, StreamHandle};
use crate::transport::Transport;

pub use crate::config::DeviceConfig;
pub use crate::consts::{SWEEP_BLOCK_LEN, TRANSFER_BUFFER_SIZE};
pub use crate::error::{Error, ResultCode, error_name};
pub use crate::stream::StreamControl;
pub use crate::sweep::{SweepBlock, SweepMode, SweepParams};
pub use crate::tx::{SampleSender, SampleSource, sample_channel};

/// Complex 8-bit signed data, as used by the HackRF.
pub type ComplexI8 = num_complex::Complex<i8>;

/// View a block of receive bytes as complex 8-bit samples.
///
/// A trailing odd byte, which a partial transfer can produce, is dropped.
pub fn samples(block: &[u8]) -> &[ComplexI8] {
    // SAFETY: ComplexI8 is two i8 with an alignment of 1.
    unsafe {
        std::slice::from_raw_parts(
            block.as_ptr() as *const ComplexI8,
            block.len() / size_of::<ComplexI8>(),
        )
    }
}

/// A HackRF device descriptor, which can be opened.
///
/// These are mostly returned from calling [`list_hackrf_devices`], but can
/// also be formed by trying to convert a [`nusb::DeviceInfo`] into one.
pub struct HackRfDescriptor {
    info: nusb::DeviceInfo,
}

/// The type of HackRF device that was detected.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HackRfType {
    Jawbreaker,
    One,
    Rad1o,
}

impl std::fmt::Display for HackRfType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Jawbreaker => f.write_str("Jawbreaker"),
            Self::One => f.write_str("HackRF One"),
            Self::Rad1o => f.write_str("rad1o"),
        }
    }
}

fn open_err(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::ResourceBusy => Error::Busy,
        io::ErrorKind::NotFound => Error::NotFound,
        _ => Error::Io(e),
    }
}

impl HackRfDescriptor {
    /// Get the serial number of this HackRF, as a string.
    pub fn serial(&self) -> Option<&str> {
        self.info.serial_number()
    }

    /// Get the [type][HackRfType] of HackRF radio this is.
    pub fn radio_type(&self) -> HackRfType {
        match self.info.product_id() {
            HACKRF_JAWBREAKER_USB_PID => HackRfType::Jawbreaker,
            HACKRF_ONE_USB_PID => HackRfType::One,
            RAD1O_USB_PID => HackRfType::Rad1o,
            _ => panic!("Created a HackRfDescriptor without using a known product ID"),
        }
    }

    /// Try and open this HackRF device descriptor, claiming exclusive access
    /// to the radio.
    ///
    /// An already-claimed device comes back as [`Error::Busy`], and a device
    /// that vanished since enumeration as [`Error::NotFound`].
    pub fn open(self) -> Result<HackRf, Error> {
        let version = self.info.device_version();
        let ty = self.radio_type();
        let device = self.info.open().map_err(open_err)?;
        #[cfg(not(target_os = "windows"))]
        {
            let active = device.active_configuration().map_err(io::Error::from)?;
            if active.configuration_value() != 1 {
                device.detach_kernel_driver(0)?;
                device.set_configuration(1)?;
            }
        }
        let interface = device.detach_and_claim_interface(0).map_err(open_err)?;

        let rf = HackRf {
            transport: Box::new(transport::UsbTransport::new(interface)),
            version,
            ty,
            config: Mutex::new(DeviceConfig::default()),
            stream: Mutex::new(None),
        };

        let rf_info = rf.info();
        let board = rf_info.board_id()?;
        let firmware = rf_info.version_string()?;
        let serial = rf_info.serial()?;
        info!(radio = %ty, %board, %firmware, %serial, api = version, "opened HackRF");

        Ok(rf)
    }
}

/// Try and turn any [`nusb::DeviceInfo`] descriptor into a HackRF, failing if
/// the VID and PID don't match any known devices.
impl TryFrom<nusb::DeviceInfo> for HackRfDescriptor {
    type Error = &'static str;
    fn try_from(value: nusb::DeviceInfo) -> Result<Self, Self::Error> {
        if value.vendor_id() == HACKRF_USB_VID {
            if matches!(
                value.product_id(),
                HACKRF_JAWBREAKER_USB_PID | HACKRF_ONE_USB_PID | RAD1O_USB_PID
            ) {
                Ok(HackRfDescriptor { info: value })
            } else {
                Err("VID recognized, PID not recognized")
            }
        } else {
            Err("VID doesn't match for HackRF")
        }
    }
}

/// List all available HackRF devices.
pub fn list_hackrf_devices() -> Result<Vec<HackRfDescriptor>, std::io::Error> {
    Ok(nusb::list_devices()?
        .filter(|d| {
            d.vendor_id() == HACKRF_USB_VID
                && matches!(
                    d.product_id(),
                    HACKRF_JAWBREAKER_USB_PID | HACKRF_ONE_USB_PID | RAD1O_USB_PID
                )
        })
        .map(|d| HackRfDescriptor { info: d })
        .collect::<Vec<HackRfDescriptor>>())
}

/// Open the first detected HackRF device in the system.
///
/// This is a shortcut for calling [`list_hackrf_devices`] and opening the
/// first one.
pub fn open_hackrf() -> Result<HackRf, Error> {
    list_hackrf_devices()?
        .into_iter()
        .next()
        .ok_or(Error::NotFound)?
        .open()
}

/// An exclusive session with a HackRF device. This is the main struct for
/// talking to the radio.
///
/// Configuration setters can be called at any time, including while a stream
/// is running; they are serialized onto the control channel. Only one stream
/// (receive, sweep, or transmit) can be active at a time; a second start
/// call fails with [`Error::Busy`].
///
/// Dropping the session stops any active stream and releases the device.
pub struct HackRf {
    transport: Box<dyn Transport>,
    pub(crate) version: u16,
    pub(crate) ty: HackRfType,
    config: Mutex<DeviceConfig>,
    stream: Mutex<Option<StreamHandle>>,
}

impl HackRf {
    fn api_check(&self, needed: u16) -> Result<(), Error> {
        if self.version < needed {
            Err(Error::ApiVersion {
                needed,
                actual: self.version,
            })
        } else {
            Ok(())
        }
    }

    fn write_u32(&self, req: ControlRequest, val: u32) -> Result<(), Error> {
        self.transport
            .control_out(req, (val & 0xffff) as u16, (val >> 16) as u16, &[])
    }

    fn write_u16(&self, req: ControlRequest, idx: u16, val: u16) -> Result<(), Error> {
        self.transport.control_out(req, val, idx, &[])
    }

    pub(crate) fn read_u8(&self, req: ControlRequest, idx: u16) -> Result<u8, Error> {
        let mut buf = [0u8; 1];
        let n = self.transport.control_in(req, 0, idx, &mut buf)?;
        if n < 1 {
            return Err(Error::ReturnData);
        }
        Ok(buf[0])
    }

    fn write_bytes(&self, req: ControlRequest, data: &[u8]) -> Result<(), Error> {
        self.transport.control_out(req, 0, 0, data)
    }

    pub(crate) fn read_bytes(&self, req: ControlRequest, len: usize) -> Result<Vec<u8>, Error> {
        assert!(len < u16::MAX as usize);
        let mut buf = vec![0u8; len];
        let n = self.transport.control_in(req, 0, 0, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    pub(crate) fn read_struct<T>(&self, req: ControlRequest) -> Result<T, Error>
    where
        T: Pod,
    {
        let size = size_of::<T>();
        let mut resp = self.read_bytes(req, size)?;
        if resp.len() < size {
            return Err(Error::ReturnData);
        }
        resp.truncate(size);
        Ok(bytemuck::pod_read_unaligned(&resp))
    }

    fn set_transceiver_mode(&self, mode: TransceiverMode) -> Result<(), Error> {
        self.write_u16(ControlRequest::SetTransceiverMode, 0, mode as u16)
    }

    fn enter_idle(&self) -> Result<(), Error> {
        self.set_transceiver_mode(TransceiverMode::Off)?;
        // Firmware drops the antenna port power on the way back to idle.
        self.config.lock().unwrap().antenna_enable = false;
        Ok(())
    }

    /// Access the info commands for the HackRF.
    pub fn info(&self) -> Info<'_> {
        Info::new(self)
    }

    /// The configuration this session has applied so far.
    pub fn config(&self) -> DeviceConfig {
        *self.config.lock().unwrap()
    }

    /// Set the operating frequency.
    ///
    /// This uses the internal frequency tuning code onboard the HackRF,
    /// which can differ between boards. It automatically sets the LO and IF
    /// frequencies, as well as the RF path filter.
    pub fn set_freq(&self, freq_hz: u64) -> Result<(), Error> {
        const ONE_MHZ: u64 = 1_000_000;
        #[repr(C)]
        #[derive(Clone, Copy, bytemuck::Zeroable, bytemuck::Pod)]
        struct FreqParams {
            mhz: u32,
            hz: u32,
        }
        let mhz = freq_hz / ONE_MHZ;
        let hz = freq_hz % ONE_MHZ;
        let params = FreqParams {
            mhz: (mhz as u32).to_le(),
            hz: (hz as u32).to_le(),
        };

        self.write_bytes(ControlRequest::SetFreq, bytemuck::bytes_of(&params))?;
        self.config.lock().unwrap().freq_hz = freq_hz;
        Ok(())
    }

    /// Set the baseband filter bandwidth.
    ///
    /// The possible settings are: 1.75, 2.5, 3.5, 5, 5.5, 6, 7, 8, 9, 10,
    /// 12, 14, 15, 20, 24, and 28 MHz. This function will choose the
    /// nearest, rounded down.
    ///
    /// Setting the sample rate with
    /// [`set_sample_rate`][Self::set_sample_rate] will modify this setting,
    /// so any changes to the filter should be done after the rate is set.
    pub fn set_baseband_filter_bandwidth(&self, bandwidth_hz: u32) -> Result<(), Error> {
        let bandwidth_hz = baseband_filter_bw(bandwidth_hz);
        self.write_u32(ControlRequest::BasebandFilterBandwidthSet, bandwidth_hz)?;
        self.config.lock().unwrap().baseband_filter_hz = bandwidth_hz;
        Ok(())
    }

    /// Set the sample rate using a clock frequency in Hz and a divider
    /// value.
    ///
    /// The resulting sample rate is `freq_hz/divider`. Divider value can be
    /// 1-31, and the rate range should be 2-20MHz. Lower & higher values are
    /// technically possible, but not recommended.
    ///
    /// This also picks a matching baseband filter bandwidth, as
    /// [`set_sample_rate`][Self::set_sample_rate] does.
    pub fn set_sample_rate_manual(&self, freq_hz: u32, divider: u32) -> Result<(), Error> {
        #[repr(C)]
        #[derive(Clone, Copy, bytemuck::Zeroable, bytemuck::Pod)]
        struct FracRateParams {
            freq_hz: u32,
            divider: u32,
        }

        const DIV_RANGE: Range<u32> = Range { start: 1, end: 32 };
        if !DIV_RANGE.contains(&divider) {
            return Err(Error::ValueRange {
                range: DIV_RANGE,
                val: divider,
            });
        }

        let params = FracRateParams {
            freq_hz: freq_hz.to_le(),
            divider: divider.to_le(),
        };

        self.write_bytes(ControlRequest::SampleRateSet, bytemuck::bytes_of(&params))?;
        self.config.lock().unwrap().sample_rate_hz = freq_hz as f64 / divider as f64;

        let filter_bw = baseband_filter_bw(freq_hz * 3 / (divider * 4));
        self.set_baseband_filter_bandwidth(filter_bw)?;
        Ok(())
    }

    /// Set the sample rate, which should be between 2-20 MHz.
    ///
    /// Lower & higher rates are clamped into that range.
    ///
    /// This function will always pick a matching baseband filter bandwidth
    /// (3/4 of the rate, rounded down to a supported setting), so any
    /// changes to the filter should be done *after* this function.
    pub fn set_sample_rate(&self, freq: f64) -> Result<(), Error> {
        let freq = freq.clamp(2e6, 20e6);

        let mut freq_hz = 0;
        let mut divider = 1;
        let mut diff = f64::MAX;

        // Just blindly check the closest of all possible divider values,
        // preferring the smaller divider value on ties
        for i in 1u32..32 {
            let new_freq_hz = (freq * (i as f64)).round() as u32;
            let new_diff = ((new_freq_hz as f64) / (i as f64) - freq).abs();
            if new_diff < diff {
                freq_hz = new_freq_hz;
                divider = i;
                diff = new_diff;
            }
        }

        self.set_sample_rate_manual(freq_hz, divider)
    }

    /// Enable/disable the 14dB RF amplifiers.
    ///
    /// Enable/disable the RX/TX amplifiers U13/U25 via the controlling
    /// switches U9 and U14.
    pub fn set_amp_enable(&self, enable: bool) -> Result<(), Error> {
        self.write_u16(ControlRequest::AmpEnable, 0, enable as u16)?;
        self.config.lock().unwrap().amp_enable = enable;
        Ok(())
    }

    /// Set the LNA gain.
    ///
    /// Sets the RF RX gain of the MAX2837 transceiver IC. Must be in the
    /// range of 0-40 dB, in 8 dB steps. Off-step values are rejected.
    pub fn set_lna_gain(&self, value: u32) -> Result<(), Error> {
        let value = check_lna_gain(value)?;
        let ret = self.read_u8(ControlRequest::SetLnaGain, value as u16)?;
        if ret == 0 {
            return Err(Error::ReturnData);
        }
        self.config.lock().unwrap().lna_gain_db = value;
        Ok(())
    }

    /// Set the VGA gain.
    ///
    /// Sets the baseband RX gain of the MAX2837 transceiver IC. Must be in
    /// the range of 0-62 dB, in 2 dB steps. Off-step values are rejected.
    pub fn set_vga_gain(&self, value: u32) -> Result<(), Error> {
        let value = check_vga_gain(value)?;
        let ret = self.read_u8(ControlRequest::SetVgaGain, value as u16)?;
        if ret == 0 {
            return Err(Error::ReturnData);
        }
        self.config.lock().unwrap().vga_gain_db = value;
        Ok(())
    }

    /// Set the RF TX gain.
    ///
    /// Sets the RF TX gain of the MAX2837 transceiver IC. Must be in the
    /// range of 0-47 dB.
    pub fn set_txvga_gain(&self, value: u32) -> Result<(), Error> {
        let value = check_txvga_gain(value)?;
        let ret = self.read_u8(ControlRequest::SetTxvgaGain, value as u16)?;
        if ret == 0 {
            return Err(Error::ReturnData);
        }
        self.config.lock().unwrap().txvga_gain_db = value;
        Ok(())
    }

    /// Temporarily enable/disable the bias-tee (antenna port power).
    ///
    /// Enable or disable the **3.3v (max 50 mA)** bias-tee. Defaults to
    /// disabled on power-up.
    ///
    /// The firmware auto-disables this after returning to idle mode, so it
    /// usually wants re-enabling after each stream.
    pub fn set_antenna_enable(&self, enable: bool) -> Result<(), Error> {
        self.write_u16(ControlRequest::AntennaEnable, 0, enable as u16)?;
        self.config.lock().unwrap().antenna_enable = enable;
        Ok(())
    }

    /// Set the transmit underrun limit. This will cause the HackRF to stop
    /// operation if transmit runs out of samples to send. Set to 0 to
    /// disable.
    ///
    /// Requires API version 0x0106 or higher.
    pub fn set_tx_underrun_limit(&self, val: u32) -> Result<(), Error> {
        self.api_check(0x0106)?;
        self.write_u32(ControlRequest::SetTxUnderrunLimit, val)
    }

    /// Set the receive overrun limit. This will cause the HackRF to stop
    /// operation if more than the specified amount of samples get lost. Set
    /// to 0 to disable.
    ///
    /// Requires API version 0x0106 or higher.
    pub fn set_rx_overrun_limit(&self, val: u32) -> Result<(), Error> {
        self.api_check(0x0106)?;
        self.write_u32(ControlRequest::SetRxOverrunLimit, val)
    }

    // Collect a stream that ended on its own, or report Busy if one is
    // still running.
    fn ensure_idle(&self, guard: &mut Option<StreamHandle>) -> Result<(), Error> {
        if let Some(handle) = guard.take() {
            if handle.is_running() {
                *guard = Some(handle);
                return Err(Error::Busy);
            }
            if let StreamEnd::Fault(err) = handle.reap() {
                warn!(%err, "discarding verdict of a dead stream");
            }
            self.enter_idle()?;
        }
        Ok(())
    }

    fn spawn_stream(
        &self,
        guard: &mut Option<StreamHandle>,
        direction: Direction,
        body: impl FnOnce(&stream::StreamShared) -> StreamEnd + Send + 'static,
        canceller: Box<dyn transport::StreamCanceller>,
    ) -> Result<(), Error> {
        match stream::spawn_worker(direction, canceller, body) {
            Ok(handle) => {
                *guard = Some(handle);
                Ok(())
            }
            Err(err) => {
                let _ = self.enter_idle();
                Err(err)
            }
        }
    }

    /// Start receiving.
    ///
    /// The callback runs on a dedicated worker thread and gets each transfer
    /// in completion order, at its valid length. It must keep up with the
    /// sample rate; the device drops samples while all transfer buffers are
    /// full. Returning [`StreamControl::Stop`] winds the stream down, after
    /// which [`is_streaming`][Self::is_streaming] reports
    /// [`Error::StreamingExitCalled`] until [`stop_rx`][Self::stop_rx] is
    /// called.
    ///
    /// Fails with [`Error::Busy`] if any stream is already running.
    pub fn start_rx<F>(&self, callback: F) -> Result<(), Error>
    where
        F: FnMut(&[u8]) -> StreamControl + Send + 'static,
    {
        let mut guard = self.stream.lock().unwrap();
        self.ensure_idle(&mut guard)?;
        self.set_transceiver_mode(TransceiverMode::Receive)?;
        let stream = match self.transport.rx_stream(TRANSFER_BUFFER_SIZE) {
            Ok(stream) => stream,
            Err(err) => {
                let _ = self.enter_idle();
                return Err(err);
            }
        };
        let canceller = stream.cancel_handle();
        self.spawn_stream(
            &mut guard,
            Direction::Rx,
            move |shared| rx::run_rx(stream, callback, shared),
            canceller,
        )?;
        debug!("receive started");
        Ok(())
    }

    /// Start a receive sweep over the configured frequency ranges.
    ///
    /// This first applies `params.sample_rate_hz` (and the matching baseband
    /// filter), then programs the sweep plan into the firmware.
    ///
    /// The callback works exactly as in [`start_rx`][Self::start_rx], but
    /// each buffer carries whole [`SWEEP_BLOCK_LEN`]-byte tuning blocks;
    /// split it with `chunks_exact` and decode each with
    /// [`SweepBlock::parse`]. Stop with [`stop_rx`][Self::stop_rx].
    pub fn start_rx_sweep<F>(&self, params: &SweepParams, callback: F) -> Result<(), Error>
    where
        F: FnMut(&[u8]) -> StreamControl + Send + 'static,
    {
        let (data, num_bytes) = params.wire_format()?;
        let mut guard = self.stream.lock().unwrap();
        self.ensure_idle(&mut guard)?;
        self.set_sample_rate(params.sample_rate_hz as f64)?;
        self.transport.control_out(
            ControlRequest::InitSweep,
            (num_bytes & 0xffff) as u16,
            (num_bytes >> 16) as u16,
            &data,
        )?;
        self.set_transceiver_mode(TransceiverMode::RxSweep)?;
        let stream = match self.transport.rx_stream(TRANSFER_BUFFER_SIZE) {
            Ok(stream) => stream,
            Err(err) => {
                let _ = self.enter_idle();
                return Err(err);
            }
        };
        let canceller = stream.cancel_handle();
        self.spawn_stream(
            &mut guard,
            Direction::Sweep,
            move |shared| rx::run_rx(stream, callback, shared),
            canceller,
        )?;
        debug!("sweep started");
        Ok(())
    }

    /// Transmit a buffer of interleaved I/Q sample bytes.
    ///
    /// Equivalent to [`start_tx_reader`][Self::start_tx_reader] over the
    /// buffer; the stream ends on its own once the buffer has been sent and
    /// flushed through the device.
    pub fn start_tx<F>(&self, data: Vec<u8>, callback: F) -> Result<(), Error>
    where
        F: FnMut(&[u8]) -> StreamControl + Send + 'static,
    {
        self.start_tx_reader(io::Cursor::new(data), callback)
    }

    /// Start transmitting from a byte source.
    ///
    /// The worker pulls sample bytes out of `source` one transfer at a time,
    /// shows each filled block to the callback, and queues it to the device.
    /// A source that reaches end of input ends the stream: the real tail is
    /// flushed through the device's internal buffer, and
    /// [`is_streaming`][Self::is_streaming] reports
    /// [`Error::StreamingStopped`] until [`stop_tx`][Self::stop_tx] is
    /// called.
    ///
    /// Use [`sample_channel`] as the source to feed a transmission
    /// incrementally from another thread.
    pub fn start_tx_reader<R, F>(&self, source: R, callback: F) -> Result<(), Error>
    where
        R: io::Read + Send + 'static,
        F: FnMut(&[u8]) -> StreamControl + Send + 'static,
    {
        let mut guard = self.stream.lock().unwrap();
        self.ensure_idle(&mut guard)?;
        self.set_transceiver_mode(TransceiverMode::Transmit)?;
        let stream = match self.transport.tx_stream(TRANSFER_BUFFER_SIZE) {
            Ok(stream) => stream,
            Err(err) => {
                let _ = self.enter_idle();
                return Err(err);
            }
        };
        let canceller = stream.cancel_handle();
        let source: Box<dyn io::Read + Send> = Box::new(source);
        self.spawn_stream(
            &mut guard,
            Direction::Tx,
            move |shared| tx::run_tx(stream, source, callback, shared),
            canceller,
        )?;
        debug!("transmit started");
        Ok(())
    }

    fn stop_stream(&self, accept: &[Direction]) -> Result<(), Error> {
        let mut guard = self.stream.lock().unwrap();
        let Some(handle) = guard.take() else {
            return Ok(());
        };
        if !accept.contains(&handle.direction()) {
            *guard = Some(handle);
            return Err(Error::Busy);
        }
        let end = handle.stop();
        let idle = self.enter_idle();
        debug!(?end, "stream stopped");
        if let StreamEnd::Fault(err) = end {
            // A failed mode-set must not mask the fault the worker died on.
            if let Err(idle_err) = idle {
                warn!(err = %idle_err, "could not return the device to idle");
            }
            return Err(err);
        }
        idle
    }

    /// Stop receiving (plain or sweep) and return to idle.
    ///
    /// Blocks until the worker has drained and the device is back in idle
    /// mode. Safe to call when nothing is running. If the stream had already
    /// died on a transport fault, that fault is returned here, once.
    ///
    /// Fails with [`Error::Busy`] if the active stream is a transmission.
    pub fn stop_rx(&self) -> Result<(), Error> {
        self.stop_stream(&[Direction::Rx, Direction::Sweep])
    }

    /// Stop transmitting and return to idle.
    ///
    /// Blocks until everything queued has gone out and the device is back in
    /// idle mode. Safe to call when nothing is running. If the stream had
    /// already died on a transport fault, that fault is returned here, once.
    ///
    /// Fails with [`Error::Busy`] if the active stream is a receive.
    pub fn stop_tx(&self) -> Result<(), Error> {
        self.stop_stream(&[Direction::Tx])
    }

    /// Check whether a stream is running.
    ///
    /// Mirrors `hackrf_is_streaming`: `Ok(true)` while the worker is going,
    /// `Ok(false)` when nothing was started (or the last stream was stopped
    /// and collected), and an error describing why a stream that started is
    /// no longer running:
    ///
    /// - [`Error::StreamingExitCalled`]: a callback returned
    ///   [`StreamControl::Stop`].
    /// - [`Error::StreamingStopped`]: the transmit source ran dry.
    /// - [`Error::StreamingThread`]: the worker died on a transport fault;
    ///   the fault itself comes out of the next `stop_rx`/`stop_tx` call.
    pub fn is_streaming(&self) -> Result<bool, Error> {
        let guard = self.stream.lock().unwrap();
        match guard.as_ref() {
            None => Ok(false),
            Some(handle) => match handle.verdict() {
                None => Ok(true),
                Some(ResultCode::StreamingExitCalled) => Err(Error::StreamingExitCalled),
                Some(ResultCode::StreamingThreadErr) => Err(Error::StreamingThread),
                Some(_) => Err(Error::StreamingStopped),
            },
        }
    }

    /// Shut down any active stream and release the device.
    ///
    /// Dropping the session does the same; this form surfaces a fault the
    /// stream may have died on.
    pub fn close(mut self) -> Result<(), Error> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<(), Error> {
        let handle = self.stream.lock().unwrap().take();
        let end = handle.map(StreamHandle::stop);
        let idle = self.enter_idle();
        if let Some(StreamEnd::Fault(err)) = end {
            if let Err(idle_err) = idle {
                warn!(err = %idle_err, "could not return the device to idle");
            }
            return Err(err);
        }
        idle
    }
}

impl Drop for HackRf {
    fn drop(&mut self) {
        let _ = self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::sim::{ControlRecord, SimEvent, SimHandle, sim_pair};
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn test_rf_version(version: u16) -> (HackRf, SimHandle) {
        let (transport, sim) = sim_pair();
        let rf = HackRf {
            transport: Box::new(transport),
            version,
            ty: HackRfType::One,
            config: Mutex::new(DeviceConfig::default()),
            stream: Mutex::new(None),
        };
        (rf, sim)
    }

    fn test_rf() -> (HackRf, SimHandle) {
        test_rf_version(0x0107)
    }

    fn wait_for_verdict(rf: &HackRf) -> Error {
        for _ in 0..2000 {
            match rf.is_streaming() {
                Ok(true) => std::thread::sleep(Duration::from_millis(1)),
                Ok(false) => panic!("stream vanished without a verdict"),
                Err(err) => return err,
            }
        }
        panic!("stream never finished");
    }

    #[test]
    fn gain_setters_hit_the_wire_with_the_gain_in_index() {
        let (rf, sim) = test_rf();
        rf.set_lna_gain(16).unwrap();
        rf.set_vga_gain(32).unwrap();
        rf.set_txvga_gain(47).unwrap();
        let controls = sim.controls();
        assert_eq!(
            controls[0],
            ControlRecord::In {
                request: ControlRequest::SetLnaGain,
                value: 0,
                index: 16,
                len: 1
            }
        );
        assert_eq!(
            controls[1],
            ControlRecord::In {
                request: ControlRequest::SetVgaGain,
                value: 0,
                index: 32,
                len: 1
            }
        );
        assert_eq!(
            controls[2],
            ControlRecord::In {
                request: ControlRequest::SetTxvgaGain,
                value: 0,
                index: 47,
                len: 1
            }
        );
        let config = rf.config();
        assert_eq!(config.lna_gain_db, 16);
        assert_eq!(config.vga_gain_db, 32);
        assert_eq!(config.txvga_gain_db, 47);
    }

    #[test]
    fn rejected_gains_never_reach_the_device() {
        let (rf, sim) = test_rf();
        assert_eq!(
            rf.set_lna_gain(5).unwrap_err().result_code(),
            ResultCode::InvalidParam
        );
        assert_eq!(
            rf.set_lna_gain(48).unwrap_err().result_code(),
            ResultCode::InvalidParam
        );
        assert_eq!(
            rf.set_vga_gain(63).unwrap_err().result_code(),
            ResultCode::InvalidParam
        );
        assert_eq!(
            rf.set_txvga_gain(48).unwrap_err().result_code(),
            ResultCode::InvalidParam
        );
        assert!(sim.controls().is_empty());
        assert_eq!(rf.config().lna_gain_db, 0);
    }

    #[test]
    fn gain_ack_of_zero_is_a_return_data_error() {
        let (rf, sim) = test_rf();
        sim.respond(ControlRequest::SetLnaGain, &[0x00]);
        assert!(matches!(rf.set_lna_gain(8), Err(Error::ReturnData)));
    }

    #[test]
    fn set_freq_packs_mhz_and_hz() {
        let (rf, sim) = test_rf();
        rf.set_freq(2_437_123_456).unwrap();
        let controls = sim.controls();
        let ControlRecord::Out {
            request,
            value,
            index,
            data,
        } = &controls[0]
        else {
            panic!("expected an OUT transfer");
        };
        assert_eq!(*request, ControlRequest::SetFreq);
        assert_eq!((*value, *index), (0, 0));
        let mut expect = 2437u32.to_le_bytes().to_vec();
        expect.extend_from_slice(&123_456u32.to_le_bytes());
        assert_eq!(data, &expect);
        assert_eq!(rf.config().freq_hz, 2_437_123_456);
    }

    #[test]
    fn sample_rate_sets_rate_then_filter() {
        let (rf, sim) = test_rf();
        rf.set_sample_rate(20e6).unwrap();
        assert_eq!(
            sim.requests(),
            vec![
                ControlRequest::SampleRateSet,
                ControlRequest::BasebandFilterBandwidthSet
            ]
        );
        let controls = sim.controls();
        let ControlRecord::Out { data, .. } = &controls[0] else {
            panic!("expected an OUT transfer");
        };
        let mut expect = 20_000_000u32.to_le_bytes().to_vec();
        expect.extend_from_slice(&1u32.to_le_bytes());
        assert_eq!(data, &expect);
        // 3/4 of 20 MHz lands exactly on the 15 MHz filter setting; the
        // value rides split across value/index.
        let ControlRecord::Out { value, index, .. } = &controls[1] else {
            panic!("expected an OUT transfer");
        };
        assert_eq!(
            ((*index as u32) << 16) | (*value as u32),
            15_000_000,
        );
        let config = rf.config();
        assert_eq!(config.sample_rate_hz, 20e6);
        assert_eq!(config.baseband_filter_hz, 15_000_000);
    }

    #[test]
    fn bad_divider_is_rejected() {
        let (rf, sim) = test_rf();
        assert!(matches!(
            rf.set_sample_rate_manual(20_000_000, 32),
            Err(Error::ValueRange { val: 32, .. })
        ));
        assert!(sim.controls().is_empty());
    }

    #[test]
    fn limits_are_gated_on_api_version() {
        let (rf, sim) = test_rf_version(0x0102);
        assert!(matches!(
            rf.set_tx_underrun_limit(100_000),
            Err(Error::ApiVersion {
                needed: 0x0106,
                actual: 0x0102
            })
        ));
        assert!(sim.controls().is_empty());

        let (rf, sim) = test_rf();
        rf.set_tx_underrun_limit(100_000).unwrap();
        rf.set_rx_overrun_limit(50_000).unwrap();
        assert_eq!(
            sim.requests(),
            vec![
                ControlRequest::SetTxUnderrunLimit,
                ControlRequest::SetRxOverrunLimit
            ]
        );
    }

    #[test]
    fn rx_delivers_exactly_the_fed_blocks() {
        let (rf, sim) = test_rf();
        rf.set_antenna_enable(true).unwrap();
        let (seen_tx, seen_rx) = crossbeam_channel::unbounded();
        rf.start_rx(move |block| {
            seen_tx.send(block.to_vec()).unwrap();
            StreamControl::Continue
        })
        .unwrap();
        assert!(rf.is_streaming().unwrap());

        for i in 0..4u8 {
            sim.rx_feed.send(SimEvent::Block(vec![i; 32])).unwrap();
        }
        for i in 0..4u8 {
            assert_eq!(seen_rx.recv_timeout(TIMEOUT).unwrap(), vec![i; 32]);
        }
        rf.stop_rx().unwrap();
        assert!(seen_rx.try_recv().is_err());
        assert!(!rf.is_streaming().unwrap());
        // Back in idle, the firmware has dropped the antenna power; the
        // cache follows it.
        assert!(!rf.config().antenna_enable);

        // Mode went Receive on start and Off on stop.
        let modes: Vec<u16> = sim
            .controls()
            .iter()
            .filter_map(|c| match c {
                ControlRecord::Out {
                    request: ControlRequest::SetTransceiverMode,
                    value,
                    ..
                } => Some(*value),
                _ => None,
            })
            .collect();
        assert_eq!(modes, vec![1, 0]);
    }

    #[test]
    fn second_start_is_busy_until_stopped() {
        let (rf, _sim) = test_rf();
        rf.start_rx(|_| StreamControl::Continue).unwrap();
        assert!(matches!(
            rf.start_rx(|_| StreamControl::Continue),
            Err(Error::Busy)
        ));
        assert!(matches!(
            rf.start_tx(vec![0; 16], |_| StreamControl::Continue),
            Err(Error::Busy)
        ));
        rf.stop_rx().unwrap();
        rf.start_rx(|_| StreamControl::Continue).unwrap();
        rf.stop_rx().unwrap();
    }

    #[test]
    fn stop_rx_is_idempotent_and_wont_stop_a_transmission() {
        let (rf, _sim) = test_rf();
        rf.stop_rx().unwrap();
        // A starved channel source keeps the transmission running without
        // producing anything.
        let (_sender, source) = sample_channel(4);
        rf.start_tx_reader(source, |_| StreamControl::Continue)
            .unwrap();
        assert!(matches!(rf.stop_rx(), Err(Error::Busy)));
        rf.stop_tx().unwrap();
        rf.stop_tx().unwrap();
    }

    #[test]
    fn callback_stop_reports_exit_called() {
        let (rf, sim) = test_rf();
        rf.start_rx(|_| StreamControl::Stop).unwrap();
        sim.rx_feed.send(SimEvent::Block(vec![0; 32])).unwrap();
        assert!(matches!(
            wait_for_verdict(&rf),
            Error::StreamingExitCalled
        ));
        // Collecting the stream is still an ordinary stop.
        rf.stop_rx().unwrap();
        assert!(!rf.is_streaming().unwrap());
    }

    #[test]
    fn rx_fault_surfaces_once_through_stop() {
        let (rf, sim) = test_rf();
        rf.start_rx(|_| StreamControl::Continue).unwrap();
        sim.rx_feed
            .send(SimEvent::Fault(nusb::transfer::TransferError::Disconnected))
            .unwrap();
        assert!(matches!(wait_for_verdict(&rf), Error::StreamingThread));
        assert!(matches!(rf.stop_rx(), Err(Error::Transfer(_))));
        // The fault was collected; stopping again is a no-op.
        rf.stop_rx().unwrap();
    }

    #[test]
    fn stop_reports_the_stream_fault_over_a_failed_mode_set() {
        let (rf, sim) = test_rf();
        rf.start_rx(|_| StreamControl::Continue).unwrap();
        sim.rx_feed
            .send(SimEvent::Fault(nusb::transfer::TransferError::Disconnected))
            .unwrap();
        assert!(matches!(wait_for_verdict(&rf), Error::StreamingThread));

        // The control plane goes down with a different code, so the assert
        // can tell which failure the stop hands back.
        sim.fail_controls(nusb::transfer::TransferError::Stall);
        assert!(matches!(
            rf.stop_rx(),
            Err(Error::Transfer(nusb::transfer::TransferError::Disconnected))
        ));
        // The idle transition was still attempted on the way out.
        let last = sim.controls().into_iter().next_back();
        assert_eq!(
            last,
            Some(ControlRecord::Out {
                request: ControlRequest::SetTransceiverMode,
                value: 0,
                index: 0,
                data: vec![],
            })
        );
        rf.stop_rx().unwrap();
    }

    #[test]
    fn tx_runs_to_completion_and_restarts_cleanly() {
        let (rf, sim) = test_rf();
        let (len_tx, len_rx) = crossbeam_channel::unbounded();
        rf.start_tx(vec![7u8; 1000], move |block| {
            len_tx.send(block.len()).unwrap();
            StreamControl::Continue
        })
        .unwrap();
        assert!(matches!(wait_for_verdict(&rf), Error::StreamingStopped));
        let total: usize = len_rx.try_iter().sum();
        assert_eq!(total, 1000);
        drop(sim);

        // Starting the next stream collects the old one.
        rf.start_rx(|_| StreamControl::Continue).unwrap();
        rf.stop_rx().unwrap();
    }

    #[test]
    fn sweep_programs_the_plan_before_entering_sweep_mode() {
        let (rf, sim) = test_rf();
        let mut params = SweepParams::for_sample_rate(20_000_000);
        params.freq_mhz = vec![(2400, 2480)];
        params.blocks_per_tuning = 2;
        let (seen_tx, seen_rx) = crossbeam_channel::unbounded();
        rf.start_rx_sweep(&params, move |block| {
            seen_tx.send(block.len()).unwrap();
            StreamControl::Continue
        })
        .unwrap();

        let requests = sim.requests();
        assert_eq!(
            requests,
            vec![
                ControlRequest::SampleRateSet,
                ControlRequest::BasebandFilterBandwidthSet,
                ControlRequest::InitSweep,
                ControlRequest::SetTransceiverMode,
            ]
        );
        let controls = sim.controls();
        let ControlRecord::Out { value, index, .. } = &controls[2] else {
            panic!("expected an OUT transfer");
        };
        // num_bytes = 2 blocks of 16384, split across value/index.
        assert_eq!(((*index as u32) << 16) | (*value as u32), 32768);

        sim.rx_feed
            .send(SimEvent::Block(vec![0; SWEEP_BLOCK_LEN]))
            .unwrap();
        assert_eq!(seen_rx.recv_timeout(TIMEOUT).unwrap(), SWEEP_BLOCK_LEN);
        rf.stop_rx().unwrap();
    }

    #[test]
    fn invalid_sweep_params_fail_before_any_setup() {
        let (rf, sim) = test_rf();
        let params = SweepParams::for_sample_rate(20_000_000);
        assert!(matches!(
            rf.start_rx_sweep(&params, |_| StreamControl::Continue),
            Err(Error::InvalidParameter(_))
        ));
        assert!(sim.controls().is_empty());
    }

    #[test]
    fn close_winds_down_an_active_stream() {
        let (rf, sim) = test_rf();
        rf.start_rx(|_| StreamControl::Continue).unwrap();
        rf.close().unwrap();
        let last = sim.controls().into_iter().next_back();
        assert_eq!(
            last,
            Some(ControlRecord::Out {
                request: ControlRequest::SetTransceiverMode,
                value: 0,
                index: 0,
                data: vec![],
            })
        );
    }

    #[test]
    fn dropping_the_session_winds_down_too() {
        let (rf, sim) = test_rf();
        rf.start_rx(|_| StreamControl::Continue).unwrap();
        drop(rf);
        let last = sim.controls().into_iter().next_back();
        assert_eq!(
            last,
            Some(ControlRecord::Out {
                request: ControlRequest::SetTransceiverMode,
                value: 0,
                index: 0,
                data: vec![],
            })
        );
    }
}
