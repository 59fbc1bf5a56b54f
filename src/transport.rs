//! Wire-level access to the device, behind a trait so the streaming engine
//! and session logic can be driven against a scripted stand-in in tests.

use std::sync::Arc;
use std::time::Duration;

use nusb::Interface;
use nusb::transfer::{Control, ControlType, Queue, Recipient, RequestBuffer};
use tokio::runtime::Runtime;
use tokio::sync::Notify;
use tracing::trace;

use crate::consts::{ControlRequest, RX_ENDPOINT_ADDRESS, TRANSFER_COUNT, TX_ENDPOINT_ADDRESS};
use crate::error::Error;

/// Control transfers never take long; anything slower means the device is
/// gone or wedged.
const USB_TIMEOUT: Duration = Duration::from_millis(500);

/// Vendor control plane plus bulk stream setup.
///
/// One implementation speaks USB through `nusb`; the test build adds a
/// scripted one.
pub(crate) trait Transport: Send + Sync {
    fn control_out(&self, req: ControlRequest, value: u16, index: u16, data: &[u8])
    -> Result<(), Error>;

    fn control_in(
        &self,
        req: ControlRequest,
        value: u16,
        index: u16,
        buf: &mut [u8],
    ) -> Result<usize, Error>;

    /// Open a bulk IN stream primed with pending transfers of `block_len`
    /// bytes each.
    fn rx_stream(&self, block_len: usize) -> Result<Box<dyn RxStream>, Error>;

    /// Open a bulk OUT stream accepting blocks of up to `block_len` bytes.
    fn tx_stream(&self, block_len: usize) -> Result<Box<dyn TxStream>, Error>;
}

/// Incoming sample stream. Blocks come back in submission order and may be
/// shorter than the transfer size; the length of the returned buffer is the
/// valid length.
pub(crate) trait RxStream: Send {
    /// Wait for the next block. `Ok(None)` means the cancel handle fired.
    fn next_block(&mut self) -> Result<Option<Vec<u8>>, Error>;

    /// Hand a consumed buffer back for resubmission.
    fn recycle(&mut self, buf: Vec<u8>);

    fn cancel_handle(&self) -> Box<dyn StreamCanceller>;

    /// Cancel whatever is still in flight and reap it. Must be called before
    /// the stream is dropped.
    fn shutdown(&mut self);
}

/// Outgoing sample stream with a bounded number of blocks in flight.
pub(crate) trait TxStream: Send {
    /// Get an empty block to fill, waiting for an in-flight slot if the
    /// pipeline is full. `Ok(None)` means the cancel handle fired while
    /// waiting.
    fn take_block(&mut self) -> Result<Option<Vec<u8>>, Error>;

    /// Queue a filled block. Never blocks; [`take_block`][Self::take_block]
    /// provides the backpressure.
    fn send_block(&mut self, buf: Vec<u8>) -> Result<(), Error>;

    /// Wait until everything queued has gone out.
    fn drain(&mut self);

    fn cancel_handle(&self) -> Box<dyn StreamCanceller>;

    fn shutdown(&mut self);
}

/// Wakes a stream worker that is parked inside `next_block`/`take_block`.
/// Safe to fire from any thread, any number of times.
pub(crate) trait StreamCanceller: Send {
    fn cancel(&self);
}

fn worker_runtime() -> Result<Runtime, Error> {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .map_err(Error::ThreadSetup)
}

/// Real device transport over a claimed `nusb` interface.
pub(crate) struct UsbTransport {
    interface: Interface,
}

impl UsbTransport {
    pub(crate) fn new(interface: Interface) -> Self {
        UsbTransport { interface }
    }
}

impl Transport for UsbTransport {
    fn control_out(
        &self,
        req: ControlRequest,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<(), Error> {
        trace!(request = ?req, value, index, len = data.len(), "control out");
        let n = self.interface.control_out_blocking(
            Control {
                control_type: ControlType::Vendor,
                recipient: Recipient::Device,
                request: req as u8,
                value,
                index,
            },
            data,
            USB_TIMEOUT,
        )?;
        if n != data.len() {
            return Err(Error::ReturnData);
        }
        Ok(())
    }

    fn control_in(
        &self,
        req: ControlRequest,
        value: u16,
        index: u16,
        buf: &mut [u8],
    ) -> Result<usize, Error> {
        trace!(request = ?req, value, index, len = buf.len(), "control in");
        Ok(self.interface.control_in_blocking(
            Control {
                control_type: ControlType::Vendor,
                recipient: Recipient::Device,
                request: req as u8,
                value,
                index,
            },
            buf,
            USB_TIMEOUT,
        )?)
    }

    fn rx_stream(&self, block_len: usize) -> Result<Box<dyn RxStream>, Error> {
        let mut queue = self.interface.bulk_in_queue(RX_ENDPOINT_ADDRESS);
        for _ in 0..TRANSFER_COUNT {
            queue.submit(RequestBuffer::new(block_len));
        }
        Ok(Box::new(UsbRxStream {
            queue,
            rt: worker_runtime()?,
            cancel: Arc::new(Notify::new()),
            block_len,
        }))
    }

    fn tx_stream(&self, block_len: usize) -> Result<Box<dyn TxStream>, Error> {
        Ok(Box::new(UsbTxStream {
            queue: self.interface.bulk_out_queue(TX_ENDPOINT_ADDRESS),
            rt: worker_runtime()?,
            cancel: Arc::new(Notify::new()),
            block_len,
        }))
    }
}

struct NotifyCanceller {
    notify: Arc<Notify>,
}

impl StreamCanceller for NotifyCanceller {
    fn cancel(&self) {
        // notify_one stores a permit, so a cancel that races ahead of the
        // worker's next park still wakes it.
        self.notify.notify_one();
    }
}

struct UsbRxStream {
    queue: Queue<RequestBuffer>,
    rt: Runtime,
    cancel: Arc<Notify>,
    block_len: usize,
}

impl RxStream for UsbRxStream {
    fn next_block(&mut self) -> Result<Option<Vec<u8>>, Error> {
        let UsbRxStream {
            queue, rt, cancel, ..
        } = self;
        rt.block_on(async {
            tokio::select! {
                biased;
                _ = cancel.notified() => Ok(None),
                comp = queue.next_complete() => {
                    comp.status?;
                    Ok(Some(comp.data))
                }
            }
        })
    }

    fn recycle(&mut self, buf: Vec<u8>) {
        self.queue.submit(RequestBuffer::reuse(buf, self.block_len));
    }

    fn cancel_handle(&self) -> Box<dyn StreamCanceller> {
        Box::new(NotifyCanceller {
            notify: self.cancel.clone(),
        })
    }

    fn shutdown(&mut self) {
        self.queue.cancel_all();
        let UsbRxStream { queue, rt, .. } = self;
        rt.block_on(async {
            while queue.pending() > 0 {
                let _ = queue.next_complete().await;
            }
        });
    }
}

struct UsbTxStream {
    queue: Queue<Vec<u8>>,
    rt: Runtime,
    cancel: Arc<Notify>,
    block_len: usize,
}

impl TxStream for UsbTxStream {
    fn take_block(&mut self) -> Result<Option<Vec<u8>>, Error> {
        if self.queue.pending() < TRANSFER_COUNT {
            return Ok(Some(vec![0u8; self.block_len]));
        }
        let UsbTxStream {
            queue,
            rt,
            cancel,
            block_len,
        } = self;
        rt.block_on(async {
            tokio::select! {
                biased;
                _ = cancel.notified() => Ok(None),
                comp = queue.next_complete() => {
                    comp.status?;
                    let mut buf = comp.data.reuse();
                    buf.clear();
                    buf.resize(*block_len, 0);
                    Ok(Some(buf))
                }
            }
        })
    }

    fn send_block(&mut self, buf: Vec<u8>) -> Result<(), Error> {
        self.queue.submit(buf);
        Ok(())
    }

    fn drain(&mut self) {
        let UsbTxStream { queue, rt, .. } = self;
        rt.block_on(async {
            while queue.pending() > 0 {
                let _ = queue.next_complete().await;
            }
        });
    }

    fn cancel_handle(&self) -> Box<dyn StreamCanceller> {
        Box::new(NotifyCanceller {
            notify: self.cancel.clone(),
        })
    }

    fn shutdown(&mut self) {
        self.queue.cancel_all();
        self.drain();
    }
}
