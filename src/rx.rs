//! Receive-side streaming engine.
//!
//! One worker thread per active stream pulls completed transfers off the
//! transport and hands each one to the user callback, in completion order.
//! The same loop serves plain receive and sweep mode; only the setup the
//! session performs beforehand differs.

use crate::stream::{StreamControl, StreamEnd, StreamShared};
use crate::transport::RxStream;

/// Drive an RX stream until it is stopped, the callback bails, or the
/// transport fails.
///
/// Buffers are handed to the callback at their completed length, which can
/// be shorter than the transfer size. Consumed buffers go straight back into
/// the transfer queue.
pub(crate) fn run_rx(
    mut stream: Box<dyn RxStream>,
    mut callback: impl FnMut(&[u8]) -> StreamControl,
    shared: &StreamShared,
) -> StreamEnd {
    let end = loop {
        if shared.stop_requested() {
            break StreamEnd::Stopped;
        }
        let block = match stream.next_block() {
            Ok(Some(block)) => block,
            Ok(None) => break StreamEnd::Stopped,
            Err(err) => break StreamEnd::Fault(err),
        };
        let control = callback(&block);
        stream.recycle(block);
        if control == StreamControl::Stop {
            break StreamEnd::ExitCalled;
        }
    };
    stream.shutdown();
    end
}
