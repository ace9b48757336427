use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use mockpod_http::HttpHeader;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Immutable record of one request-response exchange.
///
/// A producer builds the entry with `complete == false`, fills in the
/// response side, and marks it complete before handing it to the bus; a
/// published complete entry is never mutated again.
#[derive(Debug, Clone, PartialEq)]
pub struct TrafficEntry {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub method: String,
    pub url: String,
    pub host: String,
    pub path: String,
    pub scheme: String,
    pub request_headers: Vec<HttpHeader>,
    pub request_body: Option<Bytes>,
    pub status_code: Option<u16>,
    pub response_headers: Option<Vec<HttpHeader>>,
    pub response_body: Option<Bytes>,
    pub duration: Option<Duration>,
    pub complete: bool,
}

impl TrafficEntry {
    #[allow(clippy::too_many_arguments)]
    pub fn begin(
        method: impl Into<String>,
        url: impl Into<String>,
        host: impl Into<String>,
        path: impl Into<String>,
        scheme: impl Into<String>,
        request_headers: Vec<HttpHeader>,
        request_body: Option<Bytes>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            method: method.into(),
            url: url.into(),
            host: host.into(),
            path: path.into(),
            scheme: scheme.into(),
            request_headers,
            request_body,
            status_code: None,
            response_headers: None,
            response_body: None,
            duration: None,
            complete: false,
        }
    }

    pub fn finish(
        mut self,
        status_code: u16,
        response_headers: Vec<HttpHeader>,
        response_body: Bytes,
        duration: Duration,
    ) -> Self {
        self.status_code = Some(status_code);
        self.response_headers = Some(response_headers);
        self.response_body = Some(response_body);
        self.duration = Some(duration);
        self.complete = true;
        self
    }
}

/// Receives published entries. Deliveries to one sink are serialized; the
/// publisher is never blocked by a slow sink.
pub trait TrafficSink: Send + Sync {
    fn on_entry(&self, entry: TrafficEntry);
}

struct SubscriberQueue {
    entries: Mutex<VecDeque<TrafficEntry>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

struct Subscription {
    queue: Arc<SubscriberQueue>,
    drain_task: JoinHandle<()>,
}

/// Fans completed traffic entries out to subscribers registered at
/// construction. Each subscriber gets its own bounded FIFO queue drained by
/// its own task; on overflow the oldest queued entry is dropped, since the
/// proxy has already served the real response and the record is not the
/// source of truth.
pub struct TrafficBus {
    subscriptions: Vec<Subscription>,
}

pub const DEFAULT_SUBSCRIBER_QUEUE_CAPACITY: usize = 1024;

impl TrafficBus {
    /// Must be called from within a tokio runtime: one drain task is spawned
    /// per subscriber.
    pub fn new(subscribers: Vec<Arc<dyn TrafficSink>>) -> Self {
        Self::with_queue_capacity(subscribers, DEFAULT_SUBSCRIBER_QUEUE_CAPACITY)
    }

    pub fn with_queue_capacity(
        subscribers: Vec<Arc<dyn TrafficSink>>,
        capacity: usize,
    ) -> Self {
        let capacity = capacity.max(1);
        let subscriptions = subscribers
            .into_iter()
            .map(|sink| {
                let queue = Arc::new(SubscriberQueue {
                    entries: Mutex::new(VecDeque::new()),
                    notify: Notify::new(),
                    capacity,
                    dropped: AtomicU64::new(0),
                });
                let drain_task = tokio::spawn(drain_loop(Arc::clone(&queue), sink));
                Subscription { queue, drain_task }
            })
            .collect();
        Self { subscriptions }
    }

    /// Non-blocking, best-effort publication.
    pub fn publish(&self, entry: TrafficEntry) {
        for subscription in &self.subscriptions {
            let queue = &subscription.queue;
            {
                let mut entries = queue
                    .entries
                    .lock()
                    .unwrap_or_else(|poison| poison.into_inner());
                if entries.len() >= queue.capacity {
                    entries.pop_front();
                    queue.dropped.fetch_add(1, Ordering::Relaxed);
                }
                entries.push_back(entry.clone());
            }
            queue.notify.notify_one();
        }
    }

    /// Total entries dropped across all subscriber queues.
    pub fn dropped_entries(&self) -> u64 {
        self.subscriptions
            .iter()
            .map(|subscription| subscription.queue.dropped.load(Ordering::Relaxed))
            .sum()
    }
}

impl Drop for TrafficBus {
    fn drop(&mut self) {
        for subscription in &self.subscriptions {
            subscription.drain_task.abort();
        }
    }
}

async fn drain_loop(queue: Arc<SubscriberQueue>, sink: Arc<dyn TrafficSink>) {
    loop {
        queue.notify.notified().await;
        loop {
            let next = {
                let mut entries = queue
                    .entries
                    .lock()
                    .unwrap_or_else(|poison| poison.into_inner());
                entries.pop_front()
            };
            match next {
                Some(entry) => sink.on_entry(entry),
                None => break,
            }
        }
    }
}

/// Live-inspection subscriber: a bounded ring of the most recent entries,
/// newest first.
pub struct LiveRingSubscriber {
    entries: Mutex<VecDeque<TrafficEntry>>,
    capacity: usize,
}

pub const DEFAULT_LIVE_RING_CAPACITY: usize = 1000;

impl Default for LiveRingSubscriber {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LIVE_RING_CAPACITY)
    }
}

impl LiveRingSubscriber {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Entries newest-first.
    pub fn snapshot(&self) -> Vec<TrafficEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .clear();
    }
}

impl TrafficSink for LiveRingSubscriber {
    fn on_entry(&self, entry: TrafficEntry) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        entries.push_front(entry);
        while entries.len() > self.capacity {
            entries.pop_back();
        }
    }
}

/// Recording subscriber: append-only capture, active only while recording
/// is switched on.
#[derive(Default)]
pub struct RecordingSubscriber {
    entries: Mutex<Vec<TrafficEntry>>,
    recording: AtomicBool,
}

impl RecordingSubscriber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_recording(&self, on: bool) {
        self.recording.store(on, Ordering::Relaxed);
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Relaxed)
    }

    /// Entries in publication order.
    pub fn snapshot(&self) -> Vec<TrafficEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone()
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .clear();
    }
}

impl TrafficSink for RecordingSubscriber {
    fn on_entry(&self, entry: TrafficEntry) {
        if !self.is_recording() {
            return;
        }
        self.entries
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .push(entry);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;

    use super::{
        LiveRingSubscriber, RecordingSubscriber, TrafficBus, TrafficEntry, TrafficSink,
    };

    fn entry(path: &str) -> TrafficEntry {
        TrafficEntry::begin(
            "GET",
            format!("http://example.test{path}"),
            "example.test",
            path,
            "http",
            Vec::new(),
            None,
        )
        .finish(200, Vec::new(), Bytes::new(), Duration::from_millis(1))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn delivers_entries_to_all_subscribers_in_order() {
        let live = Arc::new(LiveRingSubscriber::default());
        let recorder = Arc::new(RecordingSubscriber::new());
        recorder.set_recording(true);
        let bus = TrafficBus::new(vec![
            Arc::clone(&live) as Arc<dyn TrafficSink>,
            Arc::clone(&recorder) as Arc<dyn TrafficSink>,
        ]);

        let first = entry("/first");
        let second = entry("/second");
        bus.publish(first.clone());
        bus.publish(second.clone());
        settle().await;

        let recorded = recorder.snapshot();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0].id, first.id);
        assert_eq!(recorded[1].id, second.id);

        let live_entries = live.snapshot();
        assert_eq!(live_entries.len(), 2);
        assert_eq!(live_entries[0].id, second.id, "newest first");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn recording_subscriber_ignores_entries_while_off() {
        let recorder = Arc::new(RecordingSubscriber::new());
        let bus = TrafficBus::new(vec![Arc::clone(&recorder) as Arc<dyn TrafficSink>]);

        bus.publish(entry("/ignored"));
        settle().await;
        assert!(recorder.snapshot().is_empty());

        recorder.set_recording(true);
        bus.publish(entry("/captured"));
        settle().await;
        assert_eq!(recorder.snapshot().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn live_ring_evicts_oldest_beyond_capacity() {
        let live = Arc::new(LiveRingSubscriber::with_capacity(2));
        let bus = TrafficBus::new(vec![Arc::clone(&live) as Arc<dyn TrafficSink>]);

        bus.publish(entry("/one"));
        bus.publish(entry("/two"));
        bus.publish(entry("/three"));
        settle().await;

        let entries = live.snapshot();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, "/three");
        assert_eq!(entries[1].path, "/two");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overflowing_queue_drops_oldest_entries() {
        struct BlockedSink;
        impl TrafficSink for BlockedSink {
            fn on_entry(&self, _entry: TrafficEntry) {
                std::thread::sleep(Duration::from_millis(250));
            }
        }

        let bus = TrafficBus::with_queue_capacity(vec![Arc::new(BlockedSink)], 2);
        for _ in 0..6 {
            bus.publish(entry("/burst"));
        }
        assert!(bus.dropped_entries() >= 3, "{}", bus.dropped_entries());
    }
}
