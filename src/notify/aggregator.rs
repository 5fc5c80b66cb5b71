use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info};
use serde::Serialize;
use thiserror::Error;

use crate::service::stop::StopFlag;

pub const DEFAULT_ENDPOINT: &str = "http://10.71.71.144:8000/notify-alert";
pub const DEFAULT_BUFFER_TIME: Duration = Duration::from_secs(100);
pub const DEFAULT_MAX_NOTIFICATIONS: usize = 100_000;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification POST failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("notification endpoint returned {0}")]
    Status(reqwest::StatusCode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Alert,
    Block,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Alert => write!(f, "alert"),
            EventKind::Block => write!(f, "block"),
        }
    }
}

/// A single rule hit emitted by the analyzer, consumed exactly once per
/// flush batch.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub rule_id: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub description: String,
    pub packet_summary: String,
    pub timestamp: u64,
    pub src_ip: String,
    pub dst_ip: String,
}

/// One aggregated group in the POSTed batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchItem {
    pub rule_id: String,
    pub description: String,
    pub total_events: usize,
    pub unique_src_ips: Vec<String>,
    pub unique_dst_ips: Vec<String>,
}

/// Delivery transport for aggregated batches. The production sink POSTs
/// JSON to the collector endpoint.
pub trait NotificationSink: Send + Sync {
    fn deliver(&self, batch: &[BatchItem]) -> Result<(), NotifyError>;
}

pub struct HttpSink {
    client: reqwest::blocking::Client,
    endpoint: String,
}

impl HttpSink {
    pub fn new(endpoint: &str) -> Result<Self, NotifyError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }
}

impl NotificationSink for HttpSink {
    fn deliver(&self, batch: &[BatchItem]) -> Result<(), NotifyError> {
        #[derive(Serialize)]
        struct Payload<'a> {
            events: &'a [BatchItem],
        }

        let response = self
            .client
            .post(&self.endpoint)
            .json(&Payload { events: batch })
            .send()?;
        if !response.status().is_success() {
            return Err(NotifyError::Status(response.status()));
        }
        Ok(())
    }
}

/// Groups events by rule id: per group the event count, the last seen
/// description, and the deduplicated source and destination addresses.
/// Groups come out in first-seen order.
pub fn aggregate(events: Vec<Event>) -> Vec<BatchItem> {
    struct Group {
        count: usize,
        description: String,
        src_ips: BTreeSet<String>,
        dst_ips: BTreeSet<String>,
    }

    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Group> = HashMap::new();

    for event in events {
        let group = groups.entry(event.rule_id.clone()).or_insert_with(|| {
            order.push(event.rule_id.clone());
            Group {
                count: 0,
                description: String::new(),
                src_ips: BTreeSet::new(),
                dst_ips: BTreeSet::new(),
            }
        });
        group.count += 1;
        group.description = event.description;
        group.src_ips.insert(event.src_ip);
        group.dst_ips.insert(event.dst_ip);
    }

    order
        .into_iter()
        .map(|rule_id| {
            let group = groups.remove(&rule_id).unwrap();
            BatchItem {
                rule_id,
                description: group.description,
                total_events: group.count,
                unique_src_ips: group.src_ips.into_iter().collect(),
                unique_dst_ips: group.dst_ips.into_iter().collect(),
            }
        })
        .collect()
}

/// Time-windowed notification batcher. The analyzer pushes events; the
/// worker loop wakes every `buffer_time`, drains up to `max_notifications`
/// events, aggregates them per rule and hands the batch to the sink. On
/// stop everything still queued goes out as one final batch. Delivery is
/// best effort: a failed batch is dropped, not retried.
pub struct NotificationManager {
    sink: Arc<dyn NotificationSink>,
    buffer_time: Duration,
    max_notifications: usize,
    queue: Mutex<VecDeque<Event>>,
}

impl NotificationManager {
    pub fn new(
        sink: Arc<dyn NotificationSink>,
        buffer_time: Duration,
        max_notifications: usize,
    ) -> Self {
        Self {
            sink,
            buffer_time,
            max_notifications,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, event: Event) {
        let mut queue = self.queue.lock().unwrap();
        queue.push_back(event);
        debug!("event queued for notification ({} pending)", queue.len());
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub(crate) fn drain_batch(&self) -> Vec<Event> {
        let mut queue = self.queue.lock().unwrap();
        let take = queue.len().min(self.max_notifications);
        queue.drain(..take).collect()
    }

    fn drain_all(&self) -> Vec<Event> {
        self.queue.lock().unwrap().drain(..).collect()
    }

    pub fn run(&self, stop: &StopFlag) {
        info!("notification dispatch started");
        loop {
            let stopped = stop.wait_timeout(self.buffer_time);
            if stopped {
                // The final flush ignores the per-window cap so stop emits
                // exactly one batch.
                self.flush(self.drain_all());
                break;
            }
            self.flush(self.drain_batch());
        }
        info!("notification dispatch stopped");
    }

    fn flush(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let total = events.len();
        let batch = aggregate(events);
        match self.sink.deliver(&batch) {
            Ok(()) => info!(
                "notification batch delivered: {} events in {} groups",
                total,
                batch.len()
            ),
            Err(e) => error!("dropping notification batch of {} events: {}", total, e),
        }
    }
}
