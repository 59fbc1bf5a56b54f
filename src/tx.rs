//! Transmit-side streaming engine.
//!
//! Transmit pulls sample bytes out of an [`io::Read`] source, shows each
//! filled block to the user callback, and queues it on the transport. A
//! fixed number of blocks stays in flight; the source is only read as fast
//! as the device drains them.
//!
//! When the source runs dry, a device buffer's worth of zeros is pushed
//! through behind the real tail so the last samples actually make it over
//! the air before the stream winds down.

use std::io::{self, Read};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};

use crate::consts::DEVICE_BUFFER_SIZE;
use crate::error::Error;
use crate::stream::{StreamControl, StreamEnd, StreamShared};
use crate::transport::TxStream;

/// How often a starved worker wakes up to check for a stop request.
const SOURCE_POLL: Duration = Duration::from_millis(50);

/// Fill `buf` from `source`, looping over short reads.
///
/// Returns the number of bytes filled; less than `buf.len()` only at end of
/// input, and 0 at a clean end of input. A source that signals `WouldBlock`
/// is retried until data arrives or a stop is requested.
pub(crate) fn read_full(
    source: &mut dyn Read,
    buf: &mut [u8],
    shared: &StreamShared,
) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if shared.stop_requested() {
                    break;
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

// Push zeros through until the device's internal buffer has cycled, then
// wait for everything queued to complete.
fn flush(stream: &mut dyn TxStream) -> StreamEnd {
    let mut remaining = DEVICE_BUFFER_SIZE;
    while remaining > 0 {
        let block = match stream.take_block() {
            Ok(Some(b)) => b,
            Ok(None) => return StreamEnd::Stopped,
            Err(err) => return StreamEnd::Fault(err),
        };
        let n = remaining.min(block.len());
        let mut block = block;
        block.truncate(n);
        if let Err(err) = stream.send_block(block) {
            return StreamEnd::Fault(err);
        }
        remaining -= n;
    }
    stream.drain();
    StreamEnd::SourceDrained
}

/// Drive a TX stream until the source is exhausted, it is stopped, the
/// callback bails, or the transport fails.
pub(crate) fn run_tx(
    mut stream: Box<dyn TxStream>,
    mut source: Box<dyn Read + Send>,
    mut callback: impl FnMut(&[u8]) -> StreamControl,
    shared: &StreamShared,
) -> StreamEnd {
    let end = loop {
        if shared.stop_requested() {
            break StreamEnd::Stopped;
        }
        let mut block = match stream.take_block() {
            Ok(Some(b)) => b,
            Ok(None) => break StreamEnd::Stopped,
            Err(err) => break StreamEnd::Fault(err),
        };
        let n = match read_full(&mut *source, &mut block, shared) {
            Ok(n) => n,
            Err(err) => break StreamEnd::Fault(err.into()),
        };
        if n == 0 {
            if shared.stop_requested() {
                break StreamEnd::Stopped;
            }
            break flush(stream.as_mut());
        }
        let control = callback(&block[..n]);
        block.truncate(n);
        // Short tails still go out as whole 512-byte USB packets.
        let padded = (n + 0x1ff) & !0x1ff;
        block.resize(padded, 0);
        if let Err(err) = stream.send_block(block) {
            break StreamEnd::Fault(err);
        }
        if control == StreamControl::Stop {
            stream.drain();
            break StreamEnd::ExitCalled;
        }
    };
    stream.shutdown();
    end
}

/// Create an in-memory byte channel usable as a transmit source.
///
/// The [`SampleSender`] half accepts chunks of sample bytes from anywhere;
/// the [`SampleSource`] half is an [`io::Read`] to hand to
/// [`HackRf::start_tx_reader`][crate::HackRf::start_tx_reader]. Chunks come
/// out in the order they went in. At most `depth` chunks are buffered;
/// sending blocks once the stream falls behind.
///
/// Dropping the sender ends the stream cleanly once the buffered chunks have
/// been transmitted.
pub fn sample_channel(depth: usize) -> (SampleSender, SampleSource) {
    let (tx, rx) = bounded(depth);
    (
        SampleSender { tx },
        SampleSource {
            rx,
            current: Vec::new(),
            offset: 0,
        },
    )
}

/// Producer half of [`sample_channel`].
pub struct SampleSender {
    tx: Sender<Vec<u8>>,
}

impl SampleSender {
    /// Queue a chunk of sample bytes, blocking while the channel is full.
    ///
    /// Fails with [`Error::StreamingStopped`] once the consuming stream is
    /// gone.
    pub fn send(&self, samples: Vec<u8>) -> Result<(), Error> {
        self.tx
            .send(samples)
            .map_err(|_| Error::StreamingStopped)
    }
}

/// Consumer half of [`sample_channel`]; a blocking [`io::Read`] over the
/// queued chunks.
pub struct SampleSource {
    rx: Receiver<Vec<u8>>,
    current: Vec<u8>,
    offset: usize,
}

impl Read for SampleSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.offset == self.current.len() {
            match self.rx.recv_timeout(SOURCE_POLL) {
                Ok(chunk) => {
                    self.current = chunk;
                    self.offset = 0;
                }
                // Wake the caller periodically so a stopping stream isn't
                // stuck behind a quiet producer.
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::ErrorKind::WouldBlock.into());
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len() - self.offset);
        buf[..n].copy_from_slice(&self.current[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}
