//! Per-stream flow control
//!
//! Two independent signals meet here:
//!
//! - **Outbound requests** ([`BackPressure::pause`] / [`BackPressure::resume`]):
//!   our receive buffer crossed a watermark, so we ask the remote writer to
//!   stop or restart by sending a Pause or Resume message. Idempotent: a
//!   request that would not change the state sends nothing.
//! - **Inbound requests** ([`BackPressure::on_pause`] /
//!   [`BackPressure::on_resume`]): the remote asked us to stop or restart.
//!   Only the local gate flips; nothing goes on the wire.
//!
//! Local writers call [`BackPressure::wait`], which blocks while the gate is
//! paused and returns immediately once the stream is closed.
//!
//! Pause and Resume are not acknowledged. A writer may send a little data
//! after the remote asked it to stop, before the Pause arrives.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use remotedialer_proto::Message;
use tokio::sync::Notify;
use tracing::debug;

use crate::connection::MessageSink;
use crate::flow::WatermarkListener;

#[derive(Debug, Default)]
struct Gate {
    paused: bool,
    closed: bool,
}

/// Flow-control coordinator for one stream
pub struct BackPressure {
    conn_id: i64,
    sink: Arc<dyn MessageSink>,
    write_timeout: Duration,
    gate: Mutex<Gate>,
    changed: Notify,
    // Held across the send so concurrent requests cannot reorder on the wire.
    requested: tokio::sync::Mutex<bool>,
}

impl BackPressure {
    /// Create an open, unpaused controller for `conn_id`
    pub fn new(conn_id: i64, sink: Arc<dyn MessageSink>, write_timeout: Duration) -> Self {
        Self {
            conn_id,
            sink,
            write_timeout,
            gate: Mutex::new(Gate::default()),
            changed: Notify::new(),
            requested: tokio::sync::Mutex::new(false),
        }
    }

    fn gate(&self) -> MutexGuard<'_, Gate> {
        self.gate.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The remote asked us to stop writing
    pub fn on_pause(&self) {
        self.gate().paused = true;
        self.changed.notify_waiters();
    }

    /// The remote asked us to resume writing
    pub fn on_resume(&self) {
        self.gate().paused = false;
        self.changed.notify_waiters();
    }

    /// Ask the remote to stop writing to us
    pub async fn pause(&self) {
        self.request(true).await;
    }

    /// Ask the remote to resume writing to us
    pub async fn resume(&self) {
        self.request(false).await;
    }

    async fn request(&self, pause: bool) {
        let mut requested = self.requested.lock().await;
        if *requested == pause || self.is_closed() {
            return;
        }
        let message = if pause {
            Message::pause(self.conn_id)
        } else {
            Message::resume(self.conn_id)
        };
        match self.sink.write_message(self.write_timeout, message).await {
            Ok(()) => *requested = pause,
            Err(err) => {
                debug!(conn_id = self.conn_id, pause, error = %err, "flow-control message not sent");
            }
        }
    }

    /// Block until writing is allowed or the stream is closed
    pub async fn wait(&self) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let gate = self.gate();
                if gate.closed || !gate.paused {
                    return;
                }
            }

            notified.await;
        }
    }

    /// Release all waiters for good
    pub fn close(&self) {
        self.gate().closed = true;
        self.changed.notify_waiters();
    }

    /// Whether the remote currently has us paused
    pub fn is_paused(&self) -> bool {
        self.gate().paused
    }

    /// Whether [`BackPressure::close`] was called
    pub fn is_closed(&self) -> bool {
        self.gate().closed
    }
}

#[async_trait]
impl WatermarkListener for BackPressure {
    async fn high_watermark(&self) {
        self.pause().await;
    }

    async fn low_watermark(&self) {
        self.resume().await;
    }
}
