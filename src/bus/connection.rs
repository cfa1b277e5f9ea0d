//! Connection state and reconnect buffering
//!
//! Pure pieces of the connection manager: the session state machine exposed
//! to callers, and the byte-budgeted buffer holding outbound messages while
//! the session is down.

use crate::config::DEFAULT_RECONNECT_BUF_SIZE;
use crate::message::Message;
use std::collections::VecDeque;
use std::time::Duration;

/// Fixed per-attempt dial / ConnAck timeout.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay between automatic reconnection attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Bound on the best-effort outbound flush performed by `close`.
pub const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound on waiting for in-flight handlers during drain.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// State of the logical broker session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session established yet.
    Disconnected,
    /// Initial dial in progress.
    Connecting,
    /// Session established and ready for operations.
    Connected,
    /// Session lost; automatic reconnection attempt in progress.
    Reconnecting(u32),
    /// Session released by `close`; no further operations possible.
    Closed,
}

impl ConnectionState {
    /// Whether operations may go out on the wire right now.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Whether an outbound message may be held for later replay. Buffering
    /// only applies while a session is being (re)established, never before
    /// the first connect or after close.
    pub fn allows_buffering(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting(_)
        )
    }
}

/// Outcome of offering a message to the reconnect buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum BufferPush {
    /// Message accepted and held for replay.
    Buffered,
    /// Buffering disabled (zero capacity).
    Disabled,
    /// Message would exceed the byte budget.
    Exceeded { capacity: usize },
}

/// FIFO of outbound messages held while the session is down, bounded by a
/// byte budget over subject plus payload sizes.
#[derive(Debug)]
pub struct ReconnectBuffer {
    capacity: usize,
    used: usize,
    pending: VecDeque<Message>,
}

/// Effective buffer capacity for a configured size: zero selects the 5 MiB
/// default, a negative value disables buffering entirely.
pub fn reconnect_buffer_capacity(size: i64) -> usize {
    match size {
        0 => DEFAULT_RECONNECT_BUF_SIZE,
        n if n < 0 => 0,
        n => n as usize,
    }
}

impl ReconnectBuffer {
    /// Buffer sized per the configured reconnect buffer value.
    pub fn from_config_size(size: i64) -> Self {
        Self::new(reconnect_buffer_capacity(size))
    }

    pub fn new(capacity: usize) -> Self {
        ReconnectBuffer {
            capacity,
            used: 0,
            pending: VecDeque::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Offer a message to the buffer.
    pub fn push(&mut self, msg: Message) -> BufferPush {
        if self.capacity == 0 {
            return BufferPush::Disabled;
        }
        let size = msg.size();
        if self.used + size > self.capacity {
            return BufferPush::Exceeded {
                capacity: self.capacity,
            };
        }
        self.used += size;
        self.pending.push_back(msg);
        BufferPush::Buffered
    }

    /// Take every pending message, in publish order, for replay.
    pub fn drain_pending(&mut self) -> Vec<Message> {
        self.used = 0;
        self.pending.drain(..).collect()
    }

    /// Discard all pending messages.
    pub fn clear(&mut self) {
        self.used = 0;
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_queries() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Disconnected.is_connected());
        assert!(!ConnectionState::Closed.is_connected());

        assert!(ConnectionState::Connecting.allows_buffering());
        assert!(ConnectionState::Reconnecting(2).allows_buffering());
        assert!(!ConnectionState::Disconnected.allows_buffering());
        assert!(!ConnectionState::Connected.allows_buffering());
        assert!(!ConnectionState::Closed.allows_buffering());
    }

    #[test]
    fn test_zero_capacity_disables_buffering() {
        let mut buffer = ReconnectBuffer::new(0);
        let outcome = buffer.push(Message::with_payload("events", &b"x"[..]));
        assert_eq!(outcome, BufferPush::Disabled);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_push_accounts_bytes_and_rejects_overflow() {
        let mut buffer = ReconnectBuffer::new(16);

        // "events" (6) + 5 payload bytes = 11.
        let outcome = buffer.push(Message::with_payload("events", &b"12345"[..]));
        assert_eq!(outcome, BufferPush::Buffered);
        assert_eq!(buffer.used(), 11);

        // Another 11 bytes would exceed the 16-byte budget.
        let outcome = buffer.push(Message::with_payload("events", &b"12345"[..]));
        assert_eq!(outcome, BufferPush::Exceeded { capacity: 16 });
        assert_eq!(buffer.used(), 11);
    }

    #[test]
    fn test_drain_preserves_publish_order() {
        let mut buffer = ReconnectBuffer::new(1024);
        for i in 0..5u8 {
            buffer.push(Message::with_payload("events", vec![i]));
        }

        let drained = buffer.drain_pending();
        assert_eq!(drained.len(), 5);
        for (i, msg) in drained.iter().enumerate() {
            assert_eq!(msg.payload[0] as usize, i);
        }
        assert!(buffer.is_empty());
        assert_eq!(buffer.used(), 0);
    }
}
