//! Backpressure buffer
//!
//! Bounded per-connection queue between the event-log reader and the SSE
//! network writer (see SPEC_FULL.md §4.7). Closes itself after three
//! consecutive overflows so a stalled client cannot grow memory unbounded.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc};

/// A single SSE wire frame, ready to format.
#[derive(Debug, Clone)]
pub struct SseEvent {
    pub event_type: String,
    pub data: String,
    pub event_id: Option<String>,
    pub retry_ms: Option<u64>,
}

impl SseEvent {
    pub fn new(event_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            data: data.into(),
            event_id: None,
            retry_ms: None,
        }
    }

    pub fn with_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    /// Render as `id:`/`event:`/`data:` lines terminated by a blank line.
    /// Multi-line payloads split across several `data:` lines.
    pub fn format(&self) -> String {
        let mut out = String::new();
        if let Some(id) = &self.event_id {
            out.push_str("id: ");
            out.push_str(id);
            out.push('\n');
        }
        out.push_str("event: ");
        out.push_str(&self.event_type);
        out.push('\n');
        if let Some(retry) = self.retry_ms {
            out.push_str("retry: ");
            out.push_str(&retry.to_string());
            out.push('\n');
        }
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackpressureConfig {
    pub max_size: usize,
    pub write_timeout: Duration,
    pub slow_threshold_percent: u32,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            write_timeout: Duration::from_secs(5),
            slow_threshold_percent: 80,
        }
    }
}

/// Point-in-time counters for one buffer, read via [`BufferMetrics::snapshot`].
pub struct BufferMetrics {
    connection_id: String,
    created_at: Instant,
    events_queued: AtomicU64,
    events_sent: AtomicU64,
    events_dropped: AtomicU64,
    slow_client_warnings: AtomicU64,
    buffer_overflows: AtomicU64,
    peak_buffer_size: AtomicUsize,
    last_activity: SyncMutex<Instant>,
}

#[derive(Debug, Clone)]
pub struct BufferMetricsSnapshot {
    pub connection_id: String,
    pub uptime: Duration,
    pub events_queued: u64,
    pub events_sent: u64,
    pub events_dropped: u64,
    pub slow_client_warnings: u64,
    pub buffer_overflows: u64,
    pub peak_buffer_size: usize,
}

impl BufferMetrics {
    fn new(connection_id: String) -> Self {
        let now = Instant::now();
        Self {
            connection_id,
            created_at: now,
            events_queued: AtomicU64::new(0),
            events_sent: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            slow_client_warnings: AtomicU64::new(0),
            buffer_overflows: AtomicU64::new(0),
            peak_buffer_size: AtomicUsize::new(0),
            last_activity: SyncMutex::new(now),
        }
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn bump_peak(&self, depth: usize) {
        self.peak_buffer_size.fetch_max(depth, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn snapshot(&self) -> BufferMetricsSnapshot {
        BufferMetricsSnapshot {
            connection_id: self.connection_id.clone(),
            uptime: self.created_at.elapsed(),
            events_queued: self.events_queued.load(Ordering::Relaxed),
            events_sent: self.events_sent.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            slow_client_warnings: self.slow_client_warnings.load(Ordering::Relaxed),
            buffer_overflows: self.buffer_overflows.load(Ordering::Relaxed),
            peak_buffer_size: self.peak_buffer_size.load(Ordering::Relaxed),
        }
    }
}

/// Per-connection bounded queue with producer-side overflow handling.
pub struct BackpressureBuffer {
    connection_id: String,
    max_size: usize,
    slow_threshold: usize,
    write_timeout: Duration,
    tx: SyncMutex<Option<mpsc::Sender<SseEvent>>>,
    rx: AsyncMutex<mpsc::Receiver<SseEvent>>,
    depth: AtomicUsize,
    closed: AtomicBool,
    error: SyncMutex<Option<String>>,
    pub metrics: Arc<BufferMetrics>,
}

impl BackpressureBuffer {
    pub fn new(connection_id: impl Into<String>, config: &BackpressureConfig) -> Self {
        let connection_id = connection_id.into();
        let (tx, rx) = mpsc::channel(config.max_size.max(1));
        let slow_threshold =
            (config.max_size * config.slow_threshold_percent as usize) / 100;

        Self {
            metrics: Arc::new(BufferMetrics::new(connection_id.clone())),
            connection_id,
            max_size: config.max_size,
            slow_threshold,
            write_timeout: config.write_timeout,
            tx: SyncMutex::new(Some(tx)),
            rx: AsyncMutex::new(rx),
            depth: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            error: SyncMutex::new(None),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn buffer_size(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn is_slow_client(&self) -> bool {
        self.buffer_size() >= self.slow_threshold
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    /// Push an event. Returns `false` if closed or at capacity. The third
    /// consecutive overflow closes the buffer with an error.
    pub fn push(&self, event: SseEvent) -> bool {
        if self.is_closed() {
            return false;
        }

        if self.depth.load(Ordering::Acquire) >= self.max_size {
            self.metrics.events_dropped.fetch_add(1, Ordering::Relaxed);
            let overflows = self.metrics.buffer_overflows.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(
                connection_id = %self.connection_id,
                overflows,
                "backpressure buffer overflow"
            );
            if overflows >= 3 {
                self.close(Some("Client too slow - buffer overflow".to_string()));
            }
            return false;
        }

        let sent = {
            let guard = self.tx.lock();
            match guard.as_ref() {
                Some(tx) => tx.try_send(event).is_ok(),
                None => false,
            }
        };

        if !sent {
            self.metrics.events_dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let depth = self.depth.fetch_add(1, Ordering::AcqRel) + 1;
        self.metrics.events_queued.fetch_add(1, Ordering::Relaxed);
        self.metrics.touch();
        self.metrics.bump_peak(depth);
        if depth >= self.slow_threshold {
            self.metrics.slow_client_warnings.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                connection_id = %self.connection_id,
                depth,
                threshold = self.slow_threshold,
                "slow client detected"
            );
        }
        true
    }

    /// Blocks until an event is available or the buffer closes. `write_timeout`
    /// only bounds the re-check granularity against an externally requested
    /// close; it does not expire the wait on its own.
    pub async fn pop(&self) -> Option<SseEvent> {
        loop {
            let mut rx = self.rx.lock().await;
            match tokio::time::timeout(self.write_timeout, rx.recv()).await {
                Ok(Some(event)) => {
                    self.depth.fetch_sub(1, Ordering::AcqRel);
                    self.metrics.events_sent.fetch_add(1, Ordering::Relaxed);
                    return Some(event);
                }
                Ok(None) => return None,
                Err(_) => {
                    if self.is_closed() {
                        return None;
                    }
                    continue;
                }
            }
        }
    }

    /// Idempotent. Drops the sender so any already-queued events still drain
    /// through `pop` before it starts returning `None`.
    pub fn close(&self, error: Option<String>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.error.lock() = error.clone();
        self.tx.lock().take();
        tracing::info!(
            connection_id = %self.connection_id,
            error = ?error,
            events_sent = self.metrics.events_sent.load(Ordering::Relaxed),
            events_dropped = self.metrics.events_dropped.load(Ordering::Relaxed),
            "backpressure buffer closed"
        );
    }
}

/// Tracks all active buffers for metrics and stale cleanup.
pub struct BackpressureManager {
    buffers: DashMap<String, Arc<BackpressureBuffer>>,
    total_connections: AtomicU64,
    total_events: AtomicU64,
    total_dropped: AtomicU64,
}

impl Default for BackpressureManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BackpressureManager {
    pub fn new() -> Self {
        Self {
            buffers: DashMap::new(),
            total_connections: AtomicU64::new(0),
            total_events: AtomicU64::new(0),
            total_dropped: AtomicU64::new(0),
        }
    }

    pub fn create_buffer(
        &self,
        connection_id: &str,
        config: &BackpressureConfig,
    ) -> Arc<BackpressureBuffer> {
        if let Some((_, old)) = self.buffers.remove(connection_id) {
            self.retire(&old);
        }
        let buffer = Arc::new(BackpressureBuffer::new(connection_id, config));
        self.buffers.insert(connection_id.to_string(), buffer.clone());
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        buffer
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<BackpressureBuffer>> {
        self.buffers.get(connection_id).map(|e| e.clone())
    }

    pub fn remove_buffer(&self, connection_id: &str) {
        if let Some((_, buffer)) = self.buffers.remove(connection_id) {
            self.retire(&buffer);
        }
    }

    fn retire(&self, buffer: &Arc<BackpressureBuffer>) {
        let snap = buffer.metrics.snapshot();
        self.total_events.fetch_add(snap.events_sent, Ordering::Relaxed);
        self.total_dropped.fetch_add(snap.events_dropped, Ordering::Relaxed);
        buffer.close(None);
    }

    /// Removes buffers idle past `max_idle`. Returns how many were removed.
    pub fn cleanup_stale(&self, max_idle: Duration) -> usize {
        let stale: Vec<String> = self
            .buffers
            .iter()
            .filter(|entry| entry.value().metrics.idle_for() > max_idle)
            .map(|entry| entry.key().clone())
            .collect();
        for id in &stale {
            self.remove_buffer(id);
        }
        stale.len()
    }

    pub fn active_connections(&self) -> usize {
        self.buffers.len()
    }

    pub fn current_slow_clients(&self) -> usize {
        self.buffers.iter().filter(|e| e.value().is_slow_client()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BackpressureConfig {
        BackpressureConfig {
            max_size: 3,
            write_timeout: Duration::from_millis(50),
            slow_threshold_percent: 67,
        }
    }

    #[test]
    fn test_format_single_line() {
        let event = SseEvent::new("trace", "{\"thinking\":\"hi\"}").with_id("abc");
        assert_eq!(
            event.format(),
            "id: abc\nevent: trace\ndata: {\"thinking\":\"hi\"}\n\n"
        );
    }

    #[test]
    fn test_format_multi_line_splits_data_lines() {
        let event = SseEvent::new("trace", "line1\nline2");
        assert_eq!(event.format(), "event: trace\ndata: line1\ndata: line2\n\n");
    }

    #[tokio::test]
    async fn test_push_and_pop_roundtrip() {
        let buffer = BackpressureBuffer::new("c1", &config());
        assert!(buffer.push(SseEvent::new("trace", "{}")));
        let popped = buffer.pop().await.unwrap();
        assert_eq!(popped.event_type, "trace");
    }

    #[tokio::test]
    async fn test_overflow_closes_after_three() {
        let buffer = BackpressureBuffer::new("c1", &config());
        for _ in 0..3 {
            assert!(buffer.push(SseEvent::new("trace", "{}")));
        }
        // buffer now full (max_size=3); next three pushes overflow
        assert!(!buffer.push(SseEvent::new("trace", "{}")));
        assert!(!buffer.push(SseEvent::new("trace", "{}")));
        assert!(!buffer.push(SseEvent::new("trace", "{}")));
        assert!(buffer.is_closed());
        assert_eq!(buffer.error().as_deref(), Some("Client too slow - buffer overflow"));
    }

    #[tokio::test]
    async fn test_pop_returns_none_after_close_and_drain() {
        let buffer = BackpressureBuffer::new("c1", &config());
        buffer.push(SseEvent::new("trace", "{}"));
        buffer.close(None);
        assert!(buffer.pop().await.is_some());
        assert!(buffer.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_slow_client_detection() {
        let buffer = BackpressureBuffer::new("c1", &config());
        assert!(!buffer.is_slow_client());
        buffer.push(SseEvent::new("trace", "{}"));
        buffer.push(SseEvent::new("trace", "{}"));
        assert!(buffer.is_slow_client());
    }

    #[test]
    fn test_manager_create_and_remove() {
        let manager = BackpressureManager::new();
        let buffer = manager.create_buffer("c1", &config());
        assert_eq!(manager.active_connections(), 1);
        buffer.push(SseEvent::new("trace", "{}"));
        manager.remove_buffer("c1");
        assert_eq!(manager.active_connections(), 0);
        assert!(buffer.is_closed());
    }

    #[test]
    fn test_manager_recreating_same_id_retires_old_buffer() {
        let manager = BackpressureManager::new();
        let first = manager.create_buffer("c1", &config());
        let second = manager.create_buffer("c1", &config());
        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(manager.active_connections(), 1);
    }
}
