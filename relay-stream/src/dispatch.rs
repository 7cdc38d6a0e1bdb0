#![forbid(unsafe_code)]

//! Outbound dispatch. Emitting never blocks: a saturated path accepts the frame and reports
//! [`DispatchStatus::Backpressured`] so the session stops granting credit upstream.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::frame::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStatus {
    Ready,
    /// Frame taken, but the path is saturated.
    Backpressured,
}

pub trait Dispatch: Send + Sync {
    fn emit(&self, frame: Frame) -> DispatchStatus;
}

/// Dispatch over an unbounded tokio channel with a depth high-water mark.
#[derive(Debug, Clone)]
pub struct ChannelDispatch {
    tx: mpsc::UnboundedSender<Frame>,
    depth: Arc<AtomicUsize>,
    high_water: usize,
}

/// Consuming end of a [`ChannelDispatch`].
#[derive(Debug)]
pub struct DispatchReceiver {
    rx: mpsc::UnboundedReceiver<Frame>,
    depth: Arc<AtomicUsize>,
    high_water: usize,
}

/// Create a dispatch that reports backpressure once `high_water` frames are queued.
pub fn channel(high_water: usize) -> (ChannelDispatch, DispatchReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicUsize::new(0));
    (
        ChannelDispatch { tx, depth: depth.clone(), high_water },
        DispatchReceiver { rx, depth, high_water },
    )
}

impl ChannelDispatch {
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn is_saturated(&self) -> bool {
        self.depth() >= self.high_water
    }
}

impl Dispatch for ChannelDispatch {
    fn emit(&self, frame: Frame) -> DispatchStatus {
        trace!("dispatch {} on stream {}", frame.kind(), frame.stream_id());
        if self.tx.send(frame).is_err() {
            debug!("dispatch receiver gone, frame dropped");
            return DispatchStatus::Ready;
        }
        let depth = self.depth.fetch_add(1, Ordering::AcqRel) + 1;
        if depth >= self.high_water {
            DispatchStatus::Backpressured
        } else {
            DispatchStatus::Ready
        }
    }
}

impl DispatchReceiver {
    pub async fn recv(&mut self) -> Option<Frame> {
        let frame = self.rx.recv().await?;
        self.depth.fetch_sub(1, Ordering::AcqRel);
        Some(frame)
    }

    pub fn try_recv(&mut self) -> Option<Frame> {
        let frame = self.rx.try_recv().ok()?;
        self.depth.fetch_sub(1, Ordering::AcqRel);
        Some(frame)
    }

    /// True once the queue has drained below the high-water mark.
    pub fn is_ready(&self) -> bool {
        self.depth.load(Ordering::Acquire) < self.high_water
    }
}
