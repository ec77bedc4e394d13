//! Tunable timings and buffer bounds for hub connections.

use std::time::Duration;

use tracing::warn;

/// What a hub-code send does when a writer queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Wait for queue space (synchronous path).
    #[default]
    Block,
    /// Fail fast with a backpressure error (non-blocking path).
    Fail,
}

/// Connection-level options. All durations have the defaults of the wire
/// protocol's reference implementation.
#[derive(Debug, Clone)]
pub struct HubOptions {
    /// Emit a ping when nothing has been written for this long.
    pub keep_alive_interval: Duration,
    /// Abort the connection when nothing has been read for this long. Must
    /// be at least twice the keep-alive interval.
    pub timeout_interval: Duration,
    /// How long a client may take to complete the protocol handshake.
    pub handshake_timeout: Duration,
    /// How long a channel-returning method may take to produce the next
    /// item before the stream is completed with an error.
    pub chan_receive_timeout: Duration,
    /// Bound for writer queues and upload-stream buffers.
    pub stream_buffer_capacity: usize,
    /// Writer-queue overflow behavior for hub-code sends.
    pub overflow_policy: OverflowPolicy,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            keep_alive_interval: Duration::from_secs(15),
            timeout_interval: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(15),
            chan_receive_timeout: Duration::from_secs(5),
            stream_buffer_capacity: 32,
            overflow_policy: OverflowPolicy::Block,
        }
    }
}

impl HubOptions {
    /// Enforce the `timeout >= 2 x keep-alive` contract, clamping and
    /// warning when violated.
    #[must_use]
    pub fn validated(mut self) -> Self {
        let floor = self.keep_alive_interval * 2;
        if self.timeout_interval < floor {
            warn!(
                configured = ?self.timeout_interval,
                clamped = ?floor,
                "timeout interval below twice the keep-alive interval, clamping"
            );
            self.timeout_interval = floor;
        }
        if self.stream_buffer_capacity == 0 {
            self.stream_buffer_capacity = 1;
        }
        self
    }
}
