//! Per-stream receive buffer with watermark signaling
//!
//! Inbound Data messages are appended to a [`FlowBuffer`] by the session read
//! loop and drained by the stream's reader. The buffer tracks its own size
//! and tells a [`WatermarkListener`] when it fills past the high watermark
//! and, after that, when it drains back below the low watermark.
//!
//! ```text
//!   size
//!    ▲
//!  H ┤─────────╳──────────────────────  high_watermark() fires once
//!    │        ╱ ╲    ╱╲
//!    │       ╱   ╲  ╱  ╲
//!  L ┤──────╱─────╲╱────╳────────────  low_watermark() fires once
//!    │     ╱             ╲
//!    └──────────────────────────────▶ time
//! ```
//!
//! The two thresholds differ so the signals cannot flap around one value.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::TunnelError;

/// Receives fill-level transitions of a [`FlowBuffer`]
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WatermarkListener: Send + Sync {
    /// The buffer grew to or past its high watermark
    async fn high_watermark(&self);

    /// The buffer drained to or below its low watermark after a high watermark
    async fn low_watermark(&self);
}

#[derive(Default)]
struct State {
    chunks: VecDeque<Bytes>,
    size: usize,
    err: Option<TunnelError>,
    above_high: bool,
    read_deadline: Option<Instant>,
}

enum Step {
    Chunk(Bytes, bool),
    Wait(Option<Instant>),
}

/// Bounded byte buffer between the session read loop and a stream reader
pub struct FlowBuffer {
    state: Mutex<State>,
    readable: Notify,
    high: usize,
    low: usize,
    listener: Arc<dyn WatermarkListener>,
}

/// Point-in-time view of a [`FlowBuffer`], used in diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowStatus {
    /// Buffered bytes
    pub size: usize,
    /// Buffered chunks
    pub chunks: usize,
    /// Whether the high watermark has been signaled without a matching low
    pub above_high: bool,
    /// Terminal error, if closed
    pub err: Option<TunnelError>,
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "size={} chunks={} above_high={}",
            self.size, self.chunks, self.above_high
        )?;
        if let Some(err) = &self.err {
            write!(f, " err={err}")?;
        }
        Ok(())
    }
}

impl FlowBuffer {
    /// Create an empty buffer signaling `listener` at `high` and `low` bytes
    pub fn new(high: usize, low: usize, listener: Arc<dyn WatermarkListener>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            readable: Notify::new(),
            high,
            low: low.min(high.saturating_sub(1)),
            listener,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // State stays consistent across a panic in a holder; keep going.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append bytes; fails only once the buffer is closed
    pub async fn offer(&self, data: Bytes) -> Result<(), TunnelError> {
        let crossed_high = {
            let mut state = self.lock();
            if let Some(err) = &state.err {
                return Err(err.clone());
            }
            if data.is_empty() {
                return Ok(());
            }
            state.size += data.len();
            state.chunks.push_back(data);
            if !state.above_high && state.size >= self.high {
                state.above_high = true;
                true
            } else {
                false
            }
        };
        self.readable.notify_waiters();

        if crossed_high {
            self.listener.high_watermark().await;
        }
        Ok(())
    }

    /// Take up to `max` bytes from the front of the buffer
    ///
    /// Blocks until data is available, the buffer is closed, or the read
    /// deadline passes. Buffered data is always handed out before the
    /// terminal error.
    pub async fn read_chunk(&self, max: usize) -> Result<Bytes, TunnelError> {
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let step = {
                let mut state = self.lock();
                match state.chunks.pop_front() {
                    Some(mut chunk) => {
                        if chunk.len() > max {
                            let rest = chunk.split_off(max);
                            state.chunks.push_front(rest);
                        }
                        state.size -= chunk.len();
                        let crossed_low = state.above_high && state.size <= self.low;
                        if crossed_low {
                            state.above_high = false;
                        }
                        Step::Chunk(chunk, crossed_low)
                    }
                    None => match &state.err {
                        Some(err) => return Err(err.clone()),
                        None => Step::Wait(state.read_deadline),
                    },
                }
            };

            match step {
                Step::Chunk(chunk, crossed_low) => {
                    if crossed_low {
                        self.listener.low_watermark().await;
                    }
                    return Ok(chunk);
                }
                Step::Wait(Some(deadline)) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(TunnelError::Timeout);
                    }
                }
                Step::Wait(None) => notified.await,
            }
        }
    }

    /// Copy up to `buf.len()` bytes into `buf`
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let chunk = self.read_chunk(buf.len()).await?;
        buf[..chunk.len()].copy_from_slice(&chunk);
        Ok(chunk.len())
    }

    /// Set or clear the deadline for blocked and future reads
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.lock().read_deadline = deadline;
        self.readable.notify_waiters();
    }

    /// Mark the buffer closed; buffered bytes remain readable
    ///
    /// The first error recorded wins.
    pub fn close(&self, err: TunnelError) {
        {
            let mut state = self.lock();
            if state.err.is_none() {
                state.err = Some(err);
            }
        }
        self.readable.notify_waiters();
    }

    /// Mark the buffer closed and discard anything still buffered
    pub fn abort(&self, err: TunnelError) {
        {
            let mut state = self.lock();
            if state.err.is_none() {
                state.err = Some(err);
            }
            state.chunks.clear();
            state.size = 0;
        }
        self.readable.notify_waiters();
    }

    /// Buffered byte count
    pub fn len(&self) -> usize {
        self.lock().size
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Diagnostic snapshot
    pub fn status(&self) -> FlowStatus {
        let state = self.lock();
        FlowStatus {
            size: state.size,
            chunks: state.chunks.len(),
            above_high: state.above_high,
            err: state.err.clone(),
        }
    }
}
