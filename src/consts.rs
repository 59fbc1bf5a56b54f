//! USB protocol constants shared with the HackRF firmware and libhackrf.

pub const HACKRF_USB_VID: u16 = 0x1d50;
pub const HACKRF_JAWBREAKER_USB_PID: u16 = 0x604b;
pub const HACKRF_ONE_USB_PID: u16 = 0x6089;
pub const RAD1O_USB_PID: u16 = 0xcc15;

pub const RX_ENDPOINT_ADDRESS: u8 = 0x81;
pub const TX_ENDPOINT_ADDRESS: u8 = 0x02;

/// Bulk transfers kept in flight per direction, per libhackrf.
pub const TRANSFER_COUNT: usize = 4;
/// Size of a single bulk transfer, in bytes.
pub const TRANSFER_BUFFER_SIZE: usize = 262144;
/// Depth of the HackRF's internal sample buffer, in bytes. Transmit teardown
/// pushes this many zero bytes through to flush queued samples out the air.
pub const DEVICE_BUFFER_SIZE: usize = 32768;
/// Size of one sweep tuning block, in bytes (header included).
pub const SWEEP_BLOCK_LEN: usize = 16384;
/// Maximum number of frequency ranges a single sweep may cover.
pub const MAX_SWEEP_RANGES: usize = 10;
/// Upper tuning limit, in MHz.
pub const FREQ_MAX_MHZ: u32 = 7250;

/// Vendor control requests issued by this crate.
///
/// Values are the firmware's request numbers; only the requests this crate
/// uses are listed.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlRequest {
    SetTransceiverMode = 1,
    SampleRateSet = 6,
    BasebandFilterBandwidthSet = 7,
    BoardIdRead = 14,
    VersionStringRead = 15,
    SetFreq = 16,
    AmpEnable = 17,
    BoardPartidSerialnoRead = 18,
    SetLnaGain = 19,
    SetVgaGain = 20,
    SetTxvgaGain = 21,
    AntennaEnable = 23,
    InitSweep = 26,
    SetTxUnderrunLimit = 42,
    SetRxOverrunLimit = 43,
}

/// Transceiver operating modes the firmware accepts.
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransceiverMode {
    Off = 0,
    Receive = 1,
    Transmit = 2,
    RxSweep = 5,
}
