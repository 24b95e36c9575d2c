//! SSE streamer
//!
//! Joins a session's consumer group, replays pending entries, and streams
//! new events to the client as SSE frames (see SPEC_FULL.md §4.8). A
//! background task reads the event log and feeds a [`BackpressureBuffer`];
//! the returned stream only pops and formats, so a stalled network write
//! never blocks the redis consumer loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::Stream;
use tokio::task::JoinHandle;

use crate::data::eventlog::{EventLog, EventLogError, LogEvent};
use crate::data::session::SessionStore;
use crate::metrics::Metrics;
use crate::sse::backpressure::{
    BackpressureBuffer, BackpressureConfig, BackpressureManager, SseEvent,
};

#[derive(Debug, Clone, Copy)]
pub struct StreamerConfig {
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub read_batch_size: usize,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(300),
            read_batch_size: 10,
        }
    }
}

/// Builds the formatted-frame stream for one SSE connection. The background
/// reader is spawned here and aborted once the frame stream is dropped
/// (client disconnect) or ends on its own (terminal event, idle timeout,
/// or a closed buffer).
pub fn stream(
    event_log: Arc<EventLog>,
    sessions: Arc<SessionStore>,
    backpressure: Arc<BackpressureManager>,
    metrics: Arc<Metrics>,
    session_id: String,
    connection_id: String,
    config: StreamerConfig,
) -> impl Stream<Item = String> {
    async_stream::stream! {
        let buffer = backpressure.create_buffer(&connection_id, &BackpressureConfig::default());
        let connection_started = metrics.connection_opened();
        let consumer = match event_log.ensure_group(&session_id).await {
            Ok(c) => c,
            Err(e) => {
                yield SseEvent::new(
                    "error",
                    serde_json::json!({"message": e.to_string(), "type": "StreamError"}).to_string(),
                )
                .format();
                backpressure.remove_buffer(&connection_id);
                metrics.connection_closed(connection_started);
                return;
            }
        };

        buffer.push(SseEvent::new(
            "connected",
            serde_json::json!({
                "session_id": session_id,
                "consumer": consumer,
                "timestamp": Utc::now().timestamp_millis(),
            })
            .to_string(),
        ));

        let reader: JoinHandle<()> = tokio::spawn(read_loop(
            event_log,
            sessions,
            buffer.clone(),
            metrics.clone(),
            session_id,
            consumer,
            config,
        ));

        loop {
            match buffer.pop().await {
                Some(event) => yield event.format(),
                None => {
                    if let Some(err) = buffer.error() {
                        yield SseEvent::new("error", serde_json::json!({"message": err}).to_string())
                            .format();
                    }
                    break;
                }
            }
        }

        reader.abort();
        backpressure.remove_buffer(&connection_id);
        metrics.connection_closed(connection_started);
    }
}

async fn read_loop(
    event_log: Arc<EventLog>,
    sessions: Arc<SessionStore>,
    buffer: Arc<BackpressureBuffer>,
    metrics: Arc<Metrics>,
    session_id: String,
    consumer: String,
    config: StreamerConfig,
) {
    if let Err(e) = run(&event_log, &sessions, &buffer, &metrics, &session_id, &consumer, &config).await {
        tracing::warn!(session_id = %session_id, error = %e, "sse reader error");
        buffer.push(SseEvent::new(
            "error",
            serde_json::json!({"message": e.to_string(), "type": "StreamError"}).to_string(),
        ));
    }
    buffer.close(None);
}

#[allow(clippy::too_many_arguments)]
async fn run(
    event_log: &Arc<EventLog>,
    sessions: &Arc<SessionStore>,
    buffer: &Arc<BackpressureBuffer>,
    metrics: &Arc<Metrics>,
    session_id: &str,
    consumer: &str,
    config: &StreamerConfig,
) -> Result<(), EventLogError> {
    let pending = event_log.claim_stale(session_id, consumer).await?;
    if deliver_batch(event_log, sessions, buffer, metrics, session_id, pending).await? {
        return Ok(());
    }

    let mut last_activity = tokio::time::Instant::now();
    let mut last_heartbeat = tokio::time::Instant::now();

    loop {
        if buffer.is_closed() {
            return Ok(());
        }

        let events = event_log
            .read_new(session_id, consumer, config.read_batch_size)
            .await?;

        if events.is_empty() {
            if last_activity.elapsed() >= config.idle_timeout {
                buffer.push(SseEvent::new(
                    "timeout",
                    serde_json::json!({
                        "reason": "idle_timeout",
                        "idle_seconds": last_activity.elapsed().as_secs_f64(),
                    })
                    .to_string(),
                ));
                return Ok(());
            }
            if last_heartbeat.elapsed() >= config.heartbeat_interval {
                if !buffer.push(SseEvent::new(
                    "heartbeat",
                    serde_json::json!({ "ts": Utc::now().timestamp_millis() }).to_string(),
                )) {
                    return Ok(());
                }
                last_heartbeat = tokio::time::Instant::now();
            }
            continue;
        }

        let stop = deliver_batch(event_log, sessions, buffer, metrics, session_id, events).await?;
        last_activity = tokio::time::Instant::now();
        last_heartbeat = last_activity;
        if stop {
            return Ok(());
        }
    }
}

/// Formats, pushes, acks, and touches the session for a batch of events.
/// Returns `Ok(true)` if the reader should stop: a terminal event was
/// delivered, or the buffer rejected a push (a stalled or closed client).
/// An event that fails to push is left unacked so another consumer can
/// claim it later.
async fn deliver_batch(
    event_log: &Arc<EventLog>,
    sessions: &Arc<SessionStore>,
    buffer: &Arc<BackpressureBuffer>,
    metrics: &Arc<Metrics>,
    session_id: &str,
    events: Vec<LogEvent>,
) -> Result<bool, EventLogError> {
    let mut acked = Vec::with_capacity(events.len());

    for event in events {
        if !event_log.mark_delivered(session_id, &event.event_id).await? {
            acked.push(event.entry_id);
            continue;
        }

        let event_type = event.event_type.clone();
        let frame = SseEvent::new(event_type.clone(), event.data.clone()).with_id(event.event_id);
        if !buffer.push(frame) {
            tracing::info!(session_id, "backpressure buffer rejected push, stopping reader");
            if !acked.is_empty() {
                event_log.ack(session_id, &acked).await?;
            }
            return Ok(true);
        }
        acked.push(event.entry_id);
        metrics.record_event_delivered(&event_type);

        if event_type == "final" || event_type == "error" {
            event_log.ack(session_id, &acked).await?;
            return Ok(true);
        }
        sessions.touch(session_id).await.ok();
    }

    if !acked.is_empty() {
        event_log.ack(session_id, &acked).await?;
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::store::memory::InMemoryStore;
    use futures::StreamExt;
    use std::time::Duration as StdDuration;

    fn event_log() -> Arc<EventLog> {
        Arc::new(EventLog::new(
            Arc::new(InMemoryStore::new()),
            StdDuration::from_secs(3600),
            1000,
            50,
            30_000,
        ))
    }

    fn sessions() -> Arc<SessionStore> {
        Arc::new(SessionStore::new(
            Arc::new(InMemoryStore::new()),
            StdDuration::from_secs(3600),
            StdDuration::from_secs(30),
        ))
    }

    #[tokio::test]
    async fn test_stream_delivers_connected_then_final() {
        let log = event_log();
        let sess = sessions();
        sess.create("s1", "hi".to_string(), None, "{}".to_string())
            .await
            .unwrap();
        log.append("s1", "final", "{\"response\":\"hi\"}", None)
            .await
            .unwrap();

        let backpressure = Arc::new(BackpressureManager::new());
        let metrics = Arc::new(Metrics::new().unwrap());
        let config = StreamerConfig {
            heartbeat_interval: StdDuration::from_millis(50),
            idle_timeout: StdDuration::from_millis(500),
            read_batch_size: 10,
        };

        let mut frames = Box::pin(stream(log, sess, backpressure, metrics, "s1".to_string(), "c1".to_string(), config));

        let connected = frames.next().await.unwrap();
        assert!(connected.contains("event: connected"));

        let final_frame = frames.next().await.unwrap();
        assert!(final_frame.contains("event: final"));
        assert!(final_frame.contains("\"response\":\"hi\""));

        assert!(frames.next().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_emits_heartbeat_when_idle() {
        let log = event_log();
        let sess = sessions();
        sess.create("s2", "hi".to_string(), None, "{}".to_string())
            .await
            .unwrap();

        let backpressure = Arc::new(BackpressureManager::new());
        let metrics = Arc::new(Metrics::new().unwrap());
        let config = StreamerConfig {
            heartbeat_interval: StdDuration::from_millis(10),
            idle_timeout: StdDuration::from_secs(60),
            read_batch_size: 10,
        };

        let mut frames = Box::pin(stream(log, sess, backpressure, metrics, "s2".to_string(), "c2".to_string(), config));

        let connected = frames.next().await.unwrap();
        assert!(connected.contains("event: connected"));
        let heartbeat = frames.next().await.unwrap();
        assert!(heartbeat.contains("event: heartbeat"));
    }
}
