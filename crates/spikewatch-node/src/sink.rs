//! Spike event sinks.
//!
//! - [`LogSink`]: writes each event to the log.
//! - [`ChannelSink`]: wraps events in an [`EventEnvelope`] and queues them on
//!   a tokio channel for a downstream notifier.
//! - [`MultiSink`]: fan-out to several sinks.
//!
//! [`write_envelopes`] drains a [`ChannelSink`] queue as JSON lines.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

use spikewatch_core::error::SinkError;
use spikewatch_core::traits::EventSink;
use spikewatch_core::types::{EventEnvelope, SpikeEvent};

/// Console sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn publish(&self, event: &SpikeEvent) -> Result<(), SinkError> {
        info!(
            feed_id = %event.feed_id,
            name = %event.name,
            url = %event.url,
            listeners = event.listener_count,
            median = event.median,
            mad = event.mad,
            robust_z = event.robust_z,
            at = %event.timestamp,
            "SPIKE"
        );
        Ok(())
    }
}

/// Queue sink backed by a bounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<EventEnvelope>,
}

impl ChannelSink {
    /// Create a sink and the receiving end of its queue.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<EventEnvelope>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub fn from_sender(tx: mpsc::Sender<EventEnvelope>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn publish(&self, event: &SpikeEvent) -> Result<(), SinkError> {
        let envelope =
            EventEnvelope::spike(event, Utc::now()).map_err(|e| SinkError::Encode(e.to_string()))?;
        self.tx.send(envelope).await.map_err(|_| SinkError::Closed)
    }
}

/// Publishes to every inner sink; reports the first failure after trying all.
#[derive(Clone, Default)]
pub struct MultiSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl MultiSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl EventSink for MultiSink {
    async fn publish(&self, event: &SpikeEvent) -> Result<(), SinkError> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.publish(event).await {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Write each queued envelope to `out` as one JSON line until every sender is gone.
///
/// Flushes after every line. Returns the number of envelopes written.
pub async fn write_envelopes<W>(
    mut rx: mpsc::Receiver<EventEnvelope>,
    mut out: W,
) -> std::io::Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    while let Some(envelope) = rx.recv().await {
        let mut line = serde_json::to_vec(&envelope)?;
        line.push(b'\n');
        out.write_all(&line).await?;
        out.flush().await?;
        written += 1;
        debug!(event_type = %envelope.event_type, "envelope written");
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use spikewatch_core::constants::EVENT_TYPE_SPIKE;
    use spikewatch_core::types::FeedId;

    fn event() -> SpikeEvent {
        SpikeEvent {
            feed_id: FeedId::from("4242"),
            name: "Metro Police Dispatch".into(),
            url: "https://example.invalid/4242".into(),
            timestamp: Utc.with_ymd_and_hms(2024, 6, 2, 8, 30, 0).unwrap(),
            listener_count: 510,
            median: 100.0,
            mad: 5.0,
            robust_z: 55.3,
        }
    }

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<FeedId>>,
    }

    #[async_trait]
    impl EventSink for Recording {
        async fn publish(&self, event: &SpikeEvent) -> Result<(), SinkError> {
            self.seen.lock().push(event.feed_id.clone());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl EventSink for Failing {
        async fn publish(&self, _event: &SpikeEvent) -> Result<(), SinkError> {
            Err(SinkError::Delivery("smtp down".into()))
        }
    }

    #[tokio::test]
    async fn log_sink_accepts() {
        assert!(LogSink.publish(&event()).await.is_ok());
    }

    #[tokio::test]
    async fn channel_sink_enqueues_envelope() {
        let (sink, mut rx) = ChannelSink::new(4);
        sink.publish(&event()).await.unwrap();
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.event_type, EVENT_TYPE_SPIKE);
        assert_eq!(envelope.spike_event(), Some(event()));
    }

    #[tokio::test]
    async fn channel_sink_reports_closed_queue() {
        let (sink, rx) = ChannelSink::new(1);
        drop(rx);
        assert_eq!(sink.publish(&event()).await, Err(SinkError::Closed));
    }

    #[tokio::test]
    async fn multi_sink_tries_all_and_reports_first_failure() {
        let a = Arc::new(Recording::default());
        let b = Arc::new(Recording::default());
        let multi = MultiSink::new(vec![a.clone(), Arc::new(Failing), b.clone()]);
        assert_eq!(multi.len(), 3);

        let err = multi.publish(&event()).await.unwrap_err();
        assert_eq!(err, SinkError::Delivery("smtp down".into()));
        assert_eq!(a.seen.lock().len(), 1);
        assert_eq!(b.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn envelopes_written_as_json_lines() {
        let (queue, rx) = ChannelSink::new(4);
        let mut multi = MultiSink::default();
        multi.push(Arc::new(LogSink));
        multi.push(Arc::new(queue));
        multi.publish(&event()).await.unwrap();
        multi.publish(&event()).await.unwrap();
        drop(multi);

        let mut out = Vec::new();
        let written = write_envelopes(rx, &mut out).await.unwrap();
        assert_eq!(written, 2);

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let envelope: EventEnvelope = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(envelope.spike_event(), Some(event()));
    }

    #[tokio::test]
    async fn empty_multi_sink_is_ok() {
        let multi = MultiSink::default();
        assert!(multi.is_empty());
        assert!(multi.publish(&event()).await.is_ok());
    }
}
