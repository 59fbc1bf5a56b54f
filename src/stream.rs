//! Worker lifecycle shared by the receive, sweep, and transmit engines.
//!
//! Each active stream is one dedicated OS thread driving a transport stream.
//! The session keeps a [`StreamHandle`]; the worker publishes its fate
//! through [`StreamShared`] so `is_streaming` can answer without joining.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::thread::JoinHandle;

use tracing::{debug, error};

use crate::error::{Error, ResultCode};
use crate::transport::StreamCanceller;

/// What a streaming callback wants to happen next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamControl {
    /// Keep the stream running.
    Continue,
    /// Wind the stream down. The session will afterwards report
    /// [`StreamingExitCalled`][crate::Error::StreamingExitCalled] until the
    /// stream is stopped.
    Stop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Direction {
    Rx,
    Sweep,
    Tx,
}

impl Direction {
    fn thread_name(self) -> &'static str {
        match self {
            Direction::Rx => "hackrf-rx",
            Direction::Sweep => "hackrf-sweep",
            Direction::Tx => "hackrf-tx",
        }
    }
}

/// How a worker finished.
#[derive(Debug)]
pub(crate) enum StreamEnd {
    /// The session asked it to stop.
    Stopped,
    /// A callback returned [`StreamControl::Stop`].
    ExitCalled,
    /// The transmit source ran out of data and the tail was flushed.
    SourceDrained,
    /// The transport failed mid-stream.
    Fault(Error),
}

impl StreamEnd {
    fn code(&self) -> ResultCode {
        match self {
            StreamEnd::Stopped | StreamEnd::SourceDrained => ResultCode::StreamingStopped,
            StreamEnd::ExitCalled => ResultCode::StreamingExitCalled,
            StreamEnd::Fault(_) => ResultCode::StreamingThreadErr,
        }
    }
}

/// Flags shared between a worker and its session.
pub(crate) struct StreamShared {
    stop: AtomicBool,
    running: AtomicBool,
    verdict: AtomicI32,
}

impl StreamShared {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(StreamShared {
            stop: AtomicBool::new(false),
            running: AtomicBool::new(true),
            verdict: AtomicI32::new(ResultCode::Success.code()),
        })
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    // Verdict goes in before the running flag comes down, so a reader that
    // sees running == false always sees the final code.
    fn finish(&self, code: ResultCode) {
        self.verdict.store(code.code(), Ordering::Release);
        self.running.store(false, Ordering::Release);
    }

    fn verdict(&self) -> ResultCode {
        ResultCode::from_code(self.verdict.load(Ordering::Acquire))
            .unwrap_or(ResultCode::StreamingThreadErr)
    }
}

/// Session-side handle to a running worker.
pub(crate) struct StreamHandle {
    direction: Direction,
    shared: Arc<StreamShared>,
    canceller: Box<dyn StreamCanceller>,
    join: Option<JoinHandle<StreamEnd>>,
}

impl StreamHandle {
    pub(crate) fn direction(&self) -> Direction {
        self.direction
    }

    pub(crate) fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Why the worker ended, or `None` while it is still going.
    pub(crate) fn verdict(&self) -> Option<ResultCode> {
        if self.shared.is_running() {
            None
        } else {
            Some(self.shared.verdict())
        }
    }

    /// Signal the worker, wake it out of any transport wait, and join it.
    pub(crate) fn stop(mut self) -> StreamEnd {
        self.shared.request_stop();
        self.canceller.cancel();
        self.join_inner()
    }

    /// Join a worker that already ended on its own.
    pub(crate) fn reap(mut self) -> StreamEnd {
        self.join_inner()
    }

    fn join_inner(&mut self) -> StreamEnd {
        match self.join.take() {
            // A Join error means the worker panicked, most likely inside a
            // user callback.
            Some(handle) => handle
                .join()
                .unwrap_or(StreamEnd::Fault(Error::StreamingThread)),
            None => StreamEnd::Stopped,
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if self.join.is_some() {
            self.shared.request_stop();
            self.canceller.cancel();
            let _ = self.join_inner();
        }
    }
}

/// Spawn a named worker thread running `body` and wrap it in a handle.
///
/// `body` gets the shared flags and must poll
/// [`stop_requested`][StreamShared::stop_requested] between blocks.
pub(crate) fn spawn_worker(
    direction: Direction,
    canceller: Box<dyn StreamCanceller>,
    body: impl FnOnce(&StreamShared) -> StreamEnd + Send + 'static,
) -> Result<StreamHandle, Error> {
    let shared = StreamShared::new();
    let worker_shared = shared.clone();
    let join = std::thread::Builder::new()
        .name(direction.thread_name().into())
        .spawn(move || {
            debug!(?direction, "stream worker started");
            let end = body(&worker_shared);
            match &end {
                StreamEnd::Fault(err) => error!(?direction, %err, "stream worker failed"),
                end => debug!(?direction, ?end, "stream worker finished"),
            }
            worker_shared.finish(end.code());
            end
        })
        .map_err(Error::ThreadSetup)?;
    Ok(StreamHandle {
        direction,
        shared,
        canceller,
        join: Some(join),
    })
}
