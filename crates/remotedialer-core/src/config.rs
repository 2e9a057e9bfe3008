//! Session tuning knobs
//!
//! Defaults can be overridden through `REMOTEDIALER_*` environment variables,
//! read once when a [`SessionConfig`] is defaulted.

use std::time::Duration;

use remotedialer_common::{env_or, env_secs};

/// Default per-stream buffer size at which the remote writer is paused
pub const DEFAULT_HIGH_WATERMARK: usize = 2 * 1024 * 1024;

/// Default per-stream buffer size at which the remote writer is resumed
pub const DEFAULT_LOW_WATERMARK: usize = 256 * 1024;

/// Default largest slice of stream bytes carried in one Data message
pub const DEFAULT_MAX_CHUNK: usize = 32 * 1024;

/// Tuning for one session and the streams it multiplexes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Buffered bytes per stream that trigger a Pause to the remote writer
    pub high_watermark: usize,
    /// Buffered bytes per stream below which a paused remote writer is resumed
    pub low_watermark: usize,
    /// Interval between keep-alive pings sent by client-role sessions
    pub ping_interval: Duration,
    /// Maximum silence on the socket before the session is torn down
    pub idle_timeout: Duration,
    /// Deadline for a single frame write
    pub write_timeout: Duration,
    /// Deadline for dialing a local target on an accepted Connect
    pub dial_timeout: Duration,
    /// Largest slice of stream bytes put in one Data message
    pub max_chunk: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            high_watermark: env_or("REMOTEDIALER_HIGH_WATERMARK", DEFAULT_HIGH_WATERMARK),
            low_watermark: env_or("REMOTEDIALER_LOW_WATERMARK", DEFAULT_LOW_WATERMARK),
            ping_interval: env_secs("REMOTEDIALER_PING_INTERVAL_SECS", Duration::from_secs(5)),
            idle_timeout: env_secs("REMOTEDIALER_IDLE_TIMEOUT_SECS", Duration::from_secs(60)),
            write_timeout: env_secs("REMOTEDIALER_WRITE_TIMEOUT_SECS", Duration::from_secs(15)),
            dial_timeout: env_secs("REMOTEDIALER_DIAL_TIMEOUT_SECS", Duration::from_secs(15)),
            max_chunk: env_or("REMOTEDIALER_MAX_CHUNK", DEFAULT_MAX_CHUNK),
        }
        .normalized()
    }
}

impl SessionConfig {
    /// Repair values that would break flow control.
    ///
    /// The low watermark must sit strictly below the high one, otherwise a
    /// stream could flap between Pause and Resume on every message.
    pub fn normalized(mut self) -> Self {
        self.high_watermark = self.high_watermark.max(2);
        if self.low_watermark >= self.high_watermark {
            self.low_watermark = self.high_watermark / 8;
        }
        self.max_chunk = self.max_chunk.max(1);
        self
    }
}
