//! Background delivery of buffered events.
//!
//! The [`Consumer`] drains the [`EventBuffer`] on a fixed interval, groups the
//! batch by scope and hands each group to a [`Transport`]. A group that fails
//! to send goes back into the buffer and is retried on a later tick, so
//! delivery is at-least-once.

use super::event_buffer::EventBuffer;
use super::events::Event;
use super::transport::Transport;
use crate::config::TrackerConfig;
use crate::error::{Result, TraceError};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Outcome of one drain-and-send pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Events accepted by the transport
    pub sent: usize,
    /// Events put back into the buffer after a failed send
    pub requeued: usize,
    /// Events dropped because no scope token could be resolved
    pub dropped: usize,
}

#[derive(Clone)]
struct Shipper {
    buffer: Arc<EventBuffer>,
    transport: Arc<dyn Transport>,
    default_scope: Option<String>,
    verbose: bool,
}

impl Shipper {
    async fn send_batch(&self) -> FlushReport {
        let batch = self.buffer.drain_batch();
        let mut report = FlushReport::default();
        if batch.is_empty() {
            return report;
        }

        if self.verbose {
            info!(events = batch.len(), "Sending events");
        }

        let mut groups: BTreeMap<String, Vec<Event>> = BTreeMap::new();
        for event in batch {
            match event.app_id.clone().or_else(|| self.default_scope.clone()) {
                Some(scope) => groups.entry(scope).or_default().push(event),
                None => report.dropped += 1,
            }
        }

        if report.dropped > 0 {
            error!(dropped = report.dropped, "No app id found for events, they cannot be sent");
        }

        for (scope, events) in groups {
            match self.transport.send(&events, &scope).await {
                Ok(()) => report.sent += events.len(),
                Err(e) => {
                    if self.verbose {
                        warn!(error = %e, events = events.len(), "Error sending events");
                    } else {
                        warn!("Error sending events");
                    }
                    report.requeued += events.len();
                    self.buffer.append_batch(events);
                }
            }
        }

        report
    }

    /// Keep sending until the buffer is empty or a send fails
    async fn drain_all(&self) -> FlushReport {
        let mut total = FlushReport::default();
        while !self.buffer.is_empty() {
            let report = self.send_batch().await;
            total.sent += report.sent;
            total.requeued += report.requeued;
            total.dropped += report.dropped;
            if report.requeued > 0 {
                break;
            }
            if report.sent == 0 && report.dropped == 0 {
                // Lost the lock race with a producer
                tokio::task::yield_now().await;
            }
        }
        total
    }
}

/// Periodic background sender for the event buffer
///
/// # Examples
///
/// ```ignore
/// let mut consumer = Consumer::new(buffer, transport, &config);
///
/// consumer.start()?;
/// // ... instrumented work ...
/// consumer.shutdown().await?;
/// ```
pub struct Consumer {
    shipper: Shipper,
    interval: Duration,
    shutdown_timeout: Duration,
    stop_flag: Arc<AtomicBool>,
    wake: Arc<Notify>,
    task_handle: Option<JoinHandle<()>>,
}

impl Consumer {
    /// Create a new consumer
    ///
    /// # Arguments
    ///
    /// * `buffer` - The buffer to drain
    /// * `transport` - Where batches are sent
    /// * `config` - Supplies the default scope, the interval and the shutdown bound
    pub fn new(
        buffer: Arc<EventBuffer>,
        transport: Arc<dyn Transport>,
        config: &TrackerConfig,
    ) -> Self {
        Self {
            shipper: Shipper {
                buffer,
                transport,
                default_scope: config.app_id.clone(),
                verbose: config.verbose,
            },
            interval: config.flush_interval,
            shutdown_timeout: config.shutdown_timeout,
            stop_flag: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
            task_handle: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task_handle.is_some()
    }

    /// Spawn the background loop on the current tokio runtime
    pub fn start(&mut self) -> Result<()> {
        if self.task_handle.is_some() {
            return Err(TraceError::ConsumerError("Consumer already started".to_string()));
        }

        debug!("Starting consumer");
        self.stop_flag.store(false, Ordering::Relaxed);

        let shipper = self.shipper.clone();
        let stop_flag = self.stop_flag.clone();
        let wake = self.wake.clone();
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            Self::run_loop(shipper, stop_flag, wake, interval).await;
        });

        self.task_handle = Some(handle);
        info!("Consumer started");

        Ok(())
    }

    /// Drain and send once, right now
    pub async fn flush(&self) -> FlushReport {
        self.shipper.drain_all().await
    }

    /// Stop the loop, then perform a final flush bounded by the shutdown timeout
    pub async fn shutdown(&mut self) -> Result<()> {
        let Some(handle) = self.task_handle.take() else {
            return Ok(());
        };

        debug!("Stopping consumer");
        self.stop_flag.store(true, Ordering::Relaxed);
        self.wake.notify_one();

        match tokio::time::timeout(self.shutdown_timeout, handle).await {
            Ok(Ok(())) => {
                info!("Consumer stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(TraceError::ConsumerError(format!("Failed to stop consumer: {}", e))),
            Err(_) => {
                let pending = self.shipper.buffer.len();
                Err(TraceError::TimeoutError(format!(
                    "Final flush did not finish, {} events still pending",
                    pending
                )))
            }
        }
    }

    async fn run_loop(
        shipper: Shipper,
        stop_flag: Arc<AtomicBool>,
        wake: Arc<Notify>,
        interval: Duration,
    ) {
        while !stop_flag.load(Ordering::Relaxed) {
            shipper.send_batch().await;

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = wake.notified() => {}
            }
        }

        let report = shipper.drain_all().await;
        debug!(sent = report.sent, requeued = report.requeued, "Consumer loop exiting");
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        self.wake.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::events::{EventKind, RunType};
    use crate::tracer::transport::tests::RecordingTransport;

    fn event(run_id: &str) -> Event {
        Event::new(EventKind::Start, Some(RunType::TOOL), run_id)
    }

    fn config() -> TrackerConfig {
        TrackerConfig::default()
            .with_app_id("default-app")
            .with_flush_interval(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_flush_sends_to_default_scope() {
        let buffer = Arc::new(EventBuffer::default());
        let transport = Arc::new(RecordingTransport::default());
        let consumer = Consumer::new(buffer.clone(), transport.clone(), &config());

        buffer.append(event("a"));
        buffer.append(event("b"));

        let report = consumer.flush().await;

        assert_eq!(report.sent, 2);
        assert!(buffer.is_empty());
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "default-app");
    }

    #[tokio::test]
    async fn test_flush_groups_by_scope() {
        let buffer = Arc::new(EventBuffer::default());
        let transport = Arc::new(RecordingTransport::default());
        let consumer = Consumer::new(buffer.clone(), transport.clone(), &config());

        let mut custom = event("custom");
        custom.app_id = Some("other-app".to_string());
        buffer.append(event("a"));
        buffer.append(custom);

        consumer.flush().await;

        let sent = transport.sent.lock().unwrap();
        let scopes: Vec<_> = sent.iter().map(|(scope, _)| scope.as_str()).collect();
        assert_eq!(scopes, vec!["default-app", "other-app"]);
    }

    #[tokio::test]
    async fn test_failed_batch_is_requeued() {
        let buffer = Arc::new(EventBuffer::default());
        let transport = Arc::new(RecordingTransport::failing());
        let consumer = Consumer::new(buffer.clone(), transport.clone(), &config());

        buffer.append(event("a"));
        buffer.append(event("b"));
        buffer.append(event("c"));

        let report = consumer.flush().await;
        assert_eq!(report.requeued, 3);
        assert_eq!(report.sent, 0);

        let retried: Vec<_> = buffer.drain_batch().into_iter().map(|e| e.run_id).collect();
        assert_eq!(retried, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_events_without_scope_are_dropped() {
        let buffer = Arc::new(EventBuffer::default());
        let transport = Arc::new(RecordingTransport::default());
        let consumer = Consumer::new(buffer.clone(), transport.clone(), &TrackerConfig::default());

        buffer.append(event("a"));
        let report = consumer.flush().await;

        assert_eq!(report.dropped, 1);
        assert!(buffer.is_empty());
        assert_eq!(transport.delivered(), 0);
    }

    #[tokio::test]
    async fn test_background_loop_delivers() {
        let buffer = Arc::new(EventBuffer::default());
        let transport = Arc::new(RecordingTransport::default());
        let mut consumer = Consumer::new(buffer.clone(), transport.clone(), &config());

        consumer.start().unwrap();
        buffer.append(event("a"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(transport.delivered(), 1);

        consumer.shutdown().await.unwrap();
        assert!(!consumer.is_running());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let buffer = Arc::new(EventBuffer::default());
        let transport = Arc::new(RecordingTransport::default());
        let mut consumer = Consumer::new(buffer, transport, &config());

        consumer.start().unwrap();
        assert!(consumer.start().is_err());

        consumer.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending_events() {
        let buffer = Arc::new(EventBuffer::default());
        let transport = Arc::new(RecordingTransport::default());
        let config = config().with_flush_interval(Duration::from_secs(60));
        let mut consumer = Consumer::new(buffer.clone(), transport.clone(), &config);

        consumer.start().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.append(event("late"));

        consumer.shutdown().await.unwrap();

        assert_eq!(transport.delivered(), 1);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_recovery() {
        let buffer = Arc::new(EventBuffer::default());
        let transport = Arc::new(RecordingTransport::failing());
        let consumer = Consumer::new(buffer.clone(), transport.clone(), &config());

        buffer.append(event("a"));
        consumer.flush().await;
        assert_eq!(buffer.len(), 1);

        transport.failing.store(false, Ordering::SeqCst);
        let report = consumer.flush().await;

        assert_eq!(report.sent, 1);
        assert_eq!(transport.delivered(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_without_start_is_ok() {
        let buffer = Arc::new(EventBuffer::default());
        let mut consumer = Consumer::new(buffer, Arc::new(RecordingTransport::default()), &config());

        assert!(consumer.shutdown().await.is_ok());
    }
}
