use std::ops::Range;

/// Canonical result codes, numerically identical to libhackrf's
/// `hackrf_error` values.
///
/// Every [`Error`] maps onto one of these through
/// [`Error::result_code`], so logs and tooling built around the classic
/// integer codes keep working. The integer values are stable and must not be
/// renumbered.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResultCode {
    /// Operation completed.
    Success = 0,
    /// Boolean true, as returned by the streaming query.
    True = 1,
    /// One or more parameters were rejected before reaching the device.
    InvalidParam = -2,
    /// No matching device, or the device vanished.
    NotFound = -5,
    /// The device or session is already in use.
    Busy = -6,
    /// Memory allocation failed.
    NoMem = -11,
    /// The device cannot perform the requested operation.
    Unsupported = -12,
    /// USB-layer failure.
    Libusb = -1000,
    /// The transfer worker thread could not be set up.
    Thread = -1001,
    /// The streaming worker died on a transport fault.
    StreamingThreadErr = -1002,
    /// Streaming ended on its own (e.g. the transmit source ran dry).
    StreamingStopped = -1003,
    /// Streaming ended because a callback asked for it.
    StreamingExitCalled = -1004,
    /// The installed firmware is too old for the requested feature.
    UsbApiVersion = -1005,
    /// Device handles were still open at teardown.
    NotLastDevice = -2000,
    /// Unclassified failure.
    Other = -9999,
}

impl ResultCode {
    /// The raw integer code.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Stable human-readable description, identical to what
    /// `hackrf_error_name` prints.
    pub fn name(self) -> &'static str {
        match self {
            ResultCode::Success => "HACKRF_SUCCESS",
            ResultCode::True => "HACKRF_TRUE",
            ResultCode::InvalidParam => "invalid parameter(s)",
            ResultCode::NotFound => "HackRF not found",
            ResultCode::Busy => "HackRF busy",
            ResultCode::NoMem => "insufficient memory",
            ResultCode::Unsupported => "operation not supported by the device",
            ResultCode::Libusb => "USB error",
            ResultCode::Thread => "transfer thread error",
            ResultCode::StreamingThreadErr => "streaming thread encountered an error",
            ResultCode::StreamingStopped => "streaming stopped",
            ResultCode::StreamingExitCalled => "streaming terminated",
            ResultCode::UsbApiVersion => "feature not supported by installed firmware",
            ResultCode::NotLastDevice => "one or more HackRFs still in use",
            ResultCode::Other => "unspecified error",
        }
    }

    /// Look up a code by its integer value.
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => ResultCode::Success,
            1 => ResultCode::True,
            -2 => ResultCode::InvalidParam,
            -5 => ResultCode::NotFound,
            -6 => ResultCode::Busy,
            -11 => ResultCode::NoMem,
            -12 => ResultCode::Unsupported,
            -1000 => ResultCode::Libusb,
            -1001 => ResultCode::Thread,
            -1002 => ResultCode::StreamingThreadErr,
            -1003 => ResultCode::StreamingStopped,
            -1004 => ResultCode::StreamingExitCalled,
            -1005 => ResultCode::UsbApiVersion,
            -2000 => ResultCode::NotLastDevice,
            -9999 => ResultCode::Other,
            _ => return None,
        })
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Describe any integer result code, defined or not.
///
/// Unknown values come back as `"unknown error code"`, so this is safe to
/// call on codes read from logs or foreign sources.
pub fn error_name(code: i32) -> &'static str {
    match ResultCode::from_code(code) {
        Some(c) => c.name(),
        None => "unknown error code",
    }
}

/// An error from operating the HackRF.
///
/// Some errors are recoverable:
///
/// - `Io` & `Transfer` may just be a failed packet operation on the USB
///   cable, and can potentially be recovered from without giving up on the
///   HackRF.
/// - `ValueRange`, `ValueStep`, and `InvalidParameter` all mean the
///   arguments to a function were rejected before anything was sent to the
///   device, and may even provide a hint of how to fix them.
/// - `ReturnData` means the HackRF replied to a USB transaction with
///   something unintelligible. Most of the time this means something is
///   seriously wrong and nonrecoverable.
/// - `ApiVersion` indicates the firmware on the HackRF is too old to support
///   this function. Bail out, and advise the user to update their HackRF's
///   firmware.
/// - The `Streaming*` variants describe why a stream is no longer running;
///   see [`HackRf::is_streaming`][crate::HackRf::is_streaming].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Underlying OS I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// Transfer error from `nusb`.
    #[error("USB transfer error")]
    Transfer(#[from] nusb::transfer::TransferError),

    /// The provided argument value is out of range.
    #[error("Value ({val}) out of range ({}..{})", .range.start, .range.end)]
    #[allow(missing_docs)]
    ValueRange { range: Range<u32>, val: u32 },

    /// The provided argument value is not aligned to the supported step size.
    #[error("Value ({val}) not aligned to a {step} step")]
    #[allow(missing_docs)]
    ValueStep { step: u32, val: u32 },

    /// Some argument to a function is invalid in a way not easily expressed
    /// as a range.
    #[error("Invalid Parameter: {0}")]
    InvalidParameter(&'static str),

    /// No HackRF was found, or the device went away.
    #[error("HackRF not found")]
    NotFound,

    /// The device is already opened elsewhere, or a stream is already
    /// running on this session.
    #[error("HackRF busy")]
    Busy,

    /// The API version of the opened HackRF is too old for this function.
    #[error(
        "Requires API >= 0x{:x}, but device has API 0x{:x}. Consider updating the firmware",
        needed,
        actual
    )]
    #[allow(missing_docs)]
    ApiVersion { needed: u16, actual: u16 },

    /// Returned data from a HackRF didn't make any sense.
    #[error("Invalid return data")]
    ReturnData,

    /// The streaming worker could not be set up.
    #[error("transfer thread error")]
    ThreadSetup(#[source] std::io::Error),

    /// The streaming worker died on a transport fault.
    #[error("streaming thread encountered an error")]
    StreamingThread,

    /// The stream ended on its own, e.g. the transmit source ran out of
    /// samples.
    #[error("streaming stopped")]
    StreamingStopped,

    /// The stream ended because a callback returned
    /// [`StreamControl::Stop`][crate::StreamControl::Stop].
    #[error("streaming terminated")]
    StreamingExitCalled,
}

impl Error {
    /// The canonical [`ResultCode`] for this error.
    pub fn result_code(&self) -> ResultCode {
        match self {
            Error::Io(_) | Error::Transfer(_) => ResultCode::Libusb,
            Error::ValueRange { .. } | Error::ValueStep { .. } | Error::InvalidParameter(_) => {
                ResultCode::InvalidParam
            }
            Error::NotFound => ResultCode::NotFound,
            Error::Busy => ResultCode::Busy,
            Error::ApiVersion { .. } => ResultCode::UsbApiVersion,
            Error::ReturnData => ResultCode::Other,
            Error::ThreadSetup(_) => ResultCode::Thread,
            Error::StreamingThread => ResultCode::StreamingThreadErr,
            Error::StreamingStopped => ResultCode::StreamingStopped,
            Error::StreamingExitCalled => ResultCode::StreamingExitCalled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_CODES: &[ResultCode] = &[
        ResultCode::Success,
        ResultCode::True,
        ResultCode::InvalidParam,
        ResultCode::NotFound,
        ResultCode::Busy,
        ResultCode::NoMem,
        ResultCode::Unsupported,
        ResultCode::Libusb,
        ResultCode::Thread,
        ResultCode::StreamingThreadErr,
        ResultCode::StreamingStopped,
        ResultCode::StreamingExitCalled,
        ResultCode::UsbApiVersion,
        ResultCode::NotLastDevice,
        ResultCode::Other,
    ];

    #[test]
    fn numeric_codes_match_libhackrf() {
        assert_eq!(ResultCode::Success.code(), 0);
        assert_eq!(ResultCode::True.code(), 1);
        assert_eq!(ResultCode::InvalidParam.code(), -2);
        assert_eq!(ResultCode::NotFound.code(), -5);
        assert_eq!(ResultCode::Busy.code(), -6);
        assert_eq!(ResultCode::NoMem.code(), -11);
        assert_eq!(ResultCode::Unsupported.code(), -12);
        assert_eq!(ResultCode::Libusb.code(), -1000);
        assert_eq!(ResultCode::Thread.code(), -1001);
        assert_eq!(ResultCode::StreamingThreadErr.code(), -1002);
        assert_eq!(ResultCode::StreamingStopped.code(), -1003);
        assert_eq!(ResultCode::StreamingExitCalled.code(), -1004);
        assert_eq!(ResultCode::UsbApiVersion.code(), -1005);
        assert_eq!(ResultCode::NotLastDevice.code(), -2000);
        assert_eq!(ResultCode::Other.code(), -9999);
    }

    #[test]
    fn every_code_has_a_description() {
        for code in ALL_CODES {
            assert!(!code.name().is_empty());
            assert_eq!(ResultCode::from_code(code.code()), Some(*code));
            assert_eq!(error_name(code.code()), code.name());
        }
    }

    #[test]
    fn unknown_codes_fall_back() {
        assert_eq!(error_name(-3), "unknown error code");
        assert_eq!(error_name(12345), "unknown error code");
        assert_eq!(ResultCode::from_code(2), None);
    }

    #[test]
    fn descriptions_match_libhackrf() {
        assert_eq!(error_name(0), "HACKRF_SUCCESS");
        assert_eq!(error_name(-2), "invalid parameter(s)");
        assert_eq!(error_name(-6), "HackRF busy");
        assert_eq!(error_name(-1003), "streaming stopped");
        assert_eq!(error_name(-1004), "streaming terminated");
    }

    #[test]
    fn error_maps_to_result_code() {
        let e = Error::ValueRange {
            range: 0..41,
            val: 48,
        };
        assert_eq!(e.result_code(), ResultCode::InvalidParam);
        assert_eq!(Error::Busy.result_code(), ResultCode::Busy);
        assert_eq!(
            Error::StreamingExitCalled.result_code(),
            ResultCode::StreamingExitCalled
        );
        let io = Error::Io(std::io::Error::other("boom"));
        assert_eq!(io.result_code(), ResultCode::Libusb);
    }
}
