//! Metrics collection for a connection.

use std::time::{Duration, Instant};

/// Counters and timestamps for one connection.
#[derive(Debug, Clone)]
pub struct ConnectionMetrics {
    /// Connection attempts made (outbound only)
    pub connection_attempts: u64,

    /// Failed connection attempts
    pub connection_failures: u64,

    /// Frames written to the socket
    pub frames_sent: u64,

    /// Frames parsed from the socket
    pub frames_received: u64,

    /// Sends accepted into the outbound queue
    pub frames_queued: u64,

    /// Sends failed without reaching the socket
    pub frames_failed: u64,

    /// Bytes written
    pub bytes_sent: u64,

    /// Bytes read
    pub bytes_received: u64,

    /// Frames queued but not yet written
    pub current_queue_size: usize,

    /// When the connection object was created
    pub created_at: Instant,

    /// When the socket became usable
    pub connected_at: Option<Instant>,

    /// Backoff before the next connect attempt
    pub current_reconnect_delay: Duration,
}

impl ConnectionMetrics {
    /// Fresh metrics created now.
    pub fn new() -> Self {
        Self {
            connection_attempts: 0,
            connection_failures: 0,
            frames_sent: 0,
            frames_received: 0,
            frames_queued: 0,
            frames_failed: 0,
            bytes_sent: 0,
            bytes_received: 0,
            current_queue_size: 0,
            created_at: Instant::now(),
            connected_at: None,
            current_reconnect_delay: Duration::ZERO,
        }
    }

    /// Record a connection attempt.
    pub fn record_connection_attempt(&mut self) {
        self.connection_attempts += 1;
    }

    /// Record that the socket is usable.
    pub fn record_connected(&mut self) {
        self.connected_at = Some(Instant::now());
    }

    /// Record a failed attempt and the backoff before the next one.
    pub fn record_connection_failure(&mut self, next_delay: Duration) {
        self.connection_failures += 1;
        self.current_reconnect_delay = next_delay;
    }

    /// Record a send accepted into the queue.
    pub fn record_frame_queued(&mut self) {
        self.frames_queued += 1;
        self.current_queue_size += 1;
    }

    /// Record a frame written to the socket.
    pub fn record_frame_sent(&mut self, bytes: usize) {
        self.frames_sent += 1;
        self.bytes_sent += bytes as u64;
        self.current_queue_size = self.current_queue_size.saturating_sub(1);
    }

    /// Record a queued frame that was failed instead of written.
    pub fn record_frame_failed(&mut self) {
        self.frames_failed += 1;
        self.current_queue_size = self.current_queue_size.saturating_sub(1);
    }

    /// Record a frame parsed from the socket.
    pub fn record_frame_received(&mut self, bytes: usize) {
        self.frames_received += 1;
        self.bytes_received += bytes as u64;
    }

    /// Time since the socket became usable.
    pub fn uptime(&self) -> Option<Duration> {
        self.connected_at.map(|t| t.elapsed())
    }
}

impl Default for ConnectionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_size_tracks_outcomes() {
        let mut metrics = ConnectionMetrics::new();
        metrics.record_frame_queued();
        metrics.record_frame_queued();
        metrics.record_frame_queued();
        metrics.record_frame_sent(10);
        metrics.record_frame_failed();
        assert_eq!(metrics.current_queue_size, 1);
        assert_eq!(metrics.frames_sent, 1);
        assert_eq!(metrics.bytes_sent, 10);
        assert_eq!(metrics.frames_failed, 1);

        metrics.record_frame_sent(5);
        metrics.record_frame_failed();
        assert_eq!(metrics.current_queue_size, 0, "never underflows");
    }

    #[test]
    fn test_uptime_only_after_connect() {
        let mut metrics = ConnectionMetrics::default();
        assert!(metrics.uptime().is_none());
        metrics.record_connected();
        assert!(metrics.uptime().is_some());
    }
}
