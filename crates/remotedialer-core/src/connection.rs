//! One logical byte-stream multiplexed over a session
//!
//! # Lifecycle
//!
//! ```text
//!   dial / accept ──▶ Open ──┬── close()             ──▶ ClosedPipe (Error "EOF" sent)
//!                            ├── Error message       ──▶ Eof / Remote(text)
//!                            └── session teardown    ──▶ ClosedPipe / socket error
//! ```
//!
//! The first terminal error is sticky: every later `read` and `write` returns
//! it. A read timeout is not terminal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use remotedialer_proto::Message;
use tokio::time::Instant;

use crate::backpressure::BackPressure;
use crate::flow::{FlowBuffer, FlowStatus};
use crate::{SessionConfig, TunnelError};

/// Outbound half of a session as seen by its streams
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Serialize one message onto the socket within `deadline`
    async fn write_message(&self, deadline: Duration, message: Message) -> Result<(), TunnelError>;

    /// Forget `conn_id`, telling the remote end with an Error message when
    /// `notify` is set
    async fn close_connection(&self, conn_id: i64, notify: Option<TunnelError>);
}

/// A logical stream: socket-like read/write over one session
pub struct StreamConnection {
    conn_id: i64,
    proto: String,
    address: String,
    sink: Arc<dyn MessageSink>,
    buffer: FlowBuffer,
    backpressure: Arc<BackPressure>,
    err: Mutex<Option<TunnelError>>,
    closed: AtomicBool,
    write_deadline: Mutex<Option<Instant>>,
    write_timeout: Duration,
    max_chunk: usize,
}

impl StreamConnection {
    /// Create an open stream for `conn_id` writing through `sink`
    pub fn new(
        conn_id: i64,
        proto: impl Into<String>,
        address: impl Into<String>,
        sink: Arc<dyn MessageSink>,
        config: &SessionConfig,
    ) -> Self {
        let backpressure = Arc::new(BackPressure::new(
            conn_id,
            sink.clone(),
            config.write_timeout,
        ));
        let buffer = FlowBuffer::new(
            config.high_watermark,
            config.low_watermark,
            backpressure.clone(),
        );
        Self {
            conn_id,
            proto: proto.into(),
            address: address.into(),
            sink,
            buffer,
            backpressure,
            err: Mutex::new(None),
            closed: AtomicBool::new(false),
            write_deadline: Mutex::new(None),
            write_timeout: config.write_timeout,
            max_chunk: config.max_chunk,
        }
    }

    /// Stream id within the owning session
    pub fn conn_id(&self) -> i64 {
        self.conn_id
    }

    /// Protocol this stream was opened with
    pub fn proto(&self) -> &str {
        &self.proto
    }

    /// Address this stream was opened to
    pub fn address(&self) -> &str {
        &self.address
    }

    fn err_slot(&self) -> MutexGuard<'_, Option<TunnelError>> {
        self.err.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Terminal error, `None` while open
    pub fn terminal_error(&self) -> Option<TunnelError> {
        self.err_slot().clone()
    }

    /// Record `err` unless an earlier error is already recorded.
    /// Returns whether this call recorded it.
    fn record_err(&self, err: TunnelError) -> bool {
        let mut slot = self.err_slot();
        if slot.is_some() {
            return false;
        }
        *slot = Some(err);
        true
    }

    fn check_open(&self) -> Result<(), TunnelError> {
        match self.terminal_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Read up to `max` buffered bytes
    pub async fn read_chunk(&self, max: usize) -> Result<Bytes, TunnelError> {
        match self.buffer.read_chunk(max).await {
            Ok(chunk) => Ok(chunk),
            Err(TunnelError::Timeout) => Err(TunnelError::Timeout),
            Err(err) => Err(self.terminal_error().unwrap_or(err)),
        }
    }

    /// Read into `buf`, returning the number of bytes copied
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let chunk = self.read_chunk(buf.len()).await?;
        buf[..chunk.len()].copy_from_slice(&chunk);
        Ok(chunk.len())
    }

    /// Send all of `data` as one or more Data messages
    ///
    /// Blocks while the remote has this stream paused.
    pub async fn write(&self, mut data: Bytes) -> Result<usize, TunnelError> {
        self.check_open()?;
        let total = data.len();
        while !data.is_empty() {
            let piece = data.split_to(data.len().min(self.max_chunk));
            self.backpressure.wait().await;
            self.check_open()?;
            let deadline = self.send_deadline()?;
            self.sink
                .write_message(deadline, Message::data(self.conn_id, piece))
                .await?;
        }
        Ok(total)
    }

    fn send_deadline(&self) -> Result<Duration, TunnelError> {
        let deadline = *self
            .write_deadline
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match deadline {
            None => Ok(self.write_timeout),
            Some(at) => {
                let left = at.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    Err(TunnelError::Timeout)
                } else {
                    Ok(left.min(self.write_timeout))
                }
            }
        }
    }

    /// Set or clear the read deadline
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.buffer.set_read_deadline(deadline);
    }

    /// Set or clear the write deadline; bounds only the socket send
    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        *self
            .write_deadline
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = deadline;
    }

    /// Set both deadlines
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    /// Close locally and tell the remote end; idempotent
    pub async fn close(&self) {
        self.shutdown(TunnelError::ClosedPipe, TunnelError::Eof).await;
    }

    /// Close locally because the far end of a pipe failed, reporting `err`
    /// to the remote end instead of EOF
    pub async fn close_with_error(&self, err: TunnelError) {
        self.shutdown(err.clone(), err).await;
    }

    async fn shutdown(&self, local: TunnelError, notify: TunnelError) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let first = self.record_err(local.clone());
        self.buffer.abort(local);
        self.backpressure.close();
        self.sink
            .close_connection(self.conn_id, first.then_some(notify))
            .await;
    }

    /// Inbound Data for this stream
    pub async fn on_data(&self, data: Bytes) -> Result<(), TunnelError> {
        self.buffer.offer(data).await
    }

    /// The remote asked this stream to stop writing
    pub fn on_pause(&self) {
        self.backpressure.on_pause();
    }

    /// The remote asked this stream to resume writing
    pub fn on_resume(&self) {
        self.backpressure.on_resume();
    }

    /// Whether the remote currently has this stream's writes paused
    pub fn is_write_paused(&self) -> bool {
        self.backpressure.is_paused()
    }

    /// Terminate from the session side: remote Error message or teardown.
    /// Buffered bytes stay readable ahead of the error.
    pub fn tunnel_close(&self, err: TunnelError) {
        self.record_err(err.clone());
        self.buffer.close(err);
        self.backpressure.close();
    }

    /// Diagnostic view of the receive buffer
    pub fn status(&self) -> FlowStatus {
        self.buffer.status()
    }
}

impl std::fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConnection")
            .field("conn_id", &self.conn_id)
            .field("proto", &self.proto)
            .field("address", &self.address)
            .field("buffer", &self.buffer.status().to_string())
            .finish()
    }
}
